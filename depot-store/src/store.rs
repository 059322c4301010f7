//! Store orchestrator.
//!
//! The top-level API application code talks to: one typed store per entity
//! type, composing the entity cache, the memory manager and a backend
//! (usually a composite). Implements the fetch/write policies, staleness
//! and tag invalidation, watch subjects, the sync surface, lazy field
//! loading and telemetry.

use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, warn};
use uuid::Uuid;

use chrono::Utc;
use depot_core::{
    ConfigError, DepotResult, Entity, EntityId, PagedResult, Query, StateError, Timestamp,
    UnsupportedOperationError,
};

use crate::audit::{AuditAction, AuditRecord, AuditSink};
use crate::backend::{Backend, Conflict, PendingChange, SyncResult, WatchEvent};
use crate::memory::{MemoryManager, MemoryMetrics, PressureLevel};
use crate::watch::Subject;

// ============================================================================
// POLICIES
// ============================================================================

/// How a read resolves between cache and backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FetchPolicy {
    /// Serve a cached non-stale value when present, otherwise read through
    /// and populate the cache.
    #[default]
    CacheFirst,
    /// Read the backend first; fall back to the cache when it fails.
    NetworkFirst,
    /// Never touch the backend.
    CacheOnly,
    /// Bypass the cache on the read side, still populate it on success.
    NetworkOnly,
}

/// How a write reaches the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WritePolicy {
    /// Write the backend, then update the cache.
    #[default]
    CacheAndBackend,
    /// Update the cache only; the backend is untouched.
    CacheOnly,
}

/// What `invalidate` marks stale.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationScope {
    Id(EntityId),
    Ids(Vec<EntityId>),
    All,
    Tags(Vec<String>),
    Where(Query),
}

/// Lifecycle of the most recent sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Completed,
    Failed,
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Declares which fields are loaded lazily instead of with the entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LazyFieldConfig {
    /// Fields excluded from full-entity loads, fetched on demand.
    pub fields: Vec<String>,
}

impl LazyFieldConfig {
    pub fn new(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

/// Store configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Policy used when a read does not specify one.
    pub default_fetch_policy: FetchPolicy,
    /// Wall-clock budget for `transaction` bodies plus their apply phase.
    pub transaction_timeout: Duration,
    /// Fraction of operations recorded into the stats counters, in [0, 1].
    pub stats_sampling_rate: f64,
    /// Lazy field loading; `None` disables the lazy API entirely.
    pub lazy_fields: Option<LazyFieldConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_fetch_policy: FetchPolicy::CacheFirst,
            transaction_timeout: Duration::from_secs(30),
            stats_sampling_rate: 1.0,
            lazy_fields: None,
        }
    }
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.default_fetch_policy = policy;
        self
    }

    pub fn with_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = timeout;
        self
    }

    pub fn with_stats_sampling_rate(mut self, rate: f64) -> Self {
        self.stats_sampling_rate = rate;
        self
    }

    pub fn with_lazy_fields(mut self, config: LazyFieldConfig) -> Self {
        self.lazy_fields = Some(config);
        self
    }

    /// Validate rates and timeouts.
    pub fn validate(&self) -> DepotResult<()> {
        if !(0.0..=1.0).contains(&self.stats_sampling_rate) {
            return Err(ConfigError::InvalidValue {
                field: "stats_sampling_rate".to_string(),
                value: self.stats_sampling_rate.to_string(),
                reason: "sampling rate must be in [0, 1]".to_string(),
            }
            .into());
        }
        if self.transaction_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "transaction_timeout".to_string(),
                value: format!("{:?}", self.transaction_timeout),
                reason: "transaction timeout must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// Operation counters, sampled at the configured rate.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Total recorded operations.
    pub operations: u64,
    /// Recorded operations broken down by kind.
    pub op_counts: HashMap<&'static str, u64>,
    /// Summed duration of recorded operations.
    pub total_duration: Duration,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub sync_successes: u64,
    pub sync_failures: u64,
    pub errors: u64,
    pub last_updated: Option<Timestamp>,
}

impl StoreStats {
    /// Cache hit rate in [0, 1]; zero when nothing was recorded.
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Mean recorded operation duration.
    pub fn avg_duration(&self) -> Duration {
        if self.operations == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.operations as u32
        }
    }
}

// ============================================================================
// CACHE STATE
// ============================================================================

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    is_stale: bool,
    tags: HashSet<String>,
    cached_at: Timestamp,
}

#[derive(Debug, Clone)]
struct QueryCacheEntry {
    ids: Vec<EntityId>,
    is_stale: bool,
}

struct AllWatcher<T> {
    query: Query,
    subject: Arc<Subject<Vec<T>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Ready,
    Disposed,
}

// ============================================================================
// STORE
// ============================================================================

/// Typed store over one backend.
pub struct Store<T: Entity> {
    pub(crate) backend: Arc<dyn Backend<T>>,
    pub(crate) config: StoreConfig,
    memory: Arc<MemoryManager>,
    audit: Option<Arc<dyn AuditSink>>,
    lifecycle: RwLock<Lifecycle>,
    cache: Arc<RwLock<HashMap<EntityId, CacheEntry<T>>>>,
    query_cache: Arc<RwLock<HashMap<String, QueryCacheEntry>>>,
    watchers: Arc<Mutex<HashMap<EntityId, Arc<Subject<Option<T>>>>>>,
    all_watchers: Arc<Mutex<HashMap<String, AllWatcher<T>>>>,
    field_cache: RwLock<HashMap<(EntityId, String), Value>>,
    stats: Mutex<StoreStats>,
    sync_status: Subject<SyncStatus>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) in_transaction: AtomicBool,
}

impl<T: Entity> Store<T> {
    /// Create a store with default configuration and no memory budget.
    pub fn new(backend: Arc<dyn Backend<T>>) -> Self {
        Self {
            backend,
            config: StoreConfig::default(),
            memory: Arc::new(MemoryManager::unconfigured()),
            audit: None,
            lifecycle: RwLock::new(Lifecycle::Created),
            cache: Arc::new(RwLock::new(HashMap::new())),
            query_cache: Arc::new(RwLock::new(HashMap::new())),
            watchers: Arc::new(Mutex::new(HashMap::new())),
            all_watchers: Arc::new(Mutex::new(HashMap::new())),
            field_cache: RwLock::new(HashMap::new()),
            stats: Mutex::new(StoreStats::default()),
            sync_status: Subject::new(SyncStatus::Idle),
            forwarders: Mutex::new(Vec::new()),
            in_transaction: AtomicBool::new(false),
        }
    }

    /// Replace the configuration.
    pub fn with_config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a memory manager (and with it, a cache budget).
    pub fn with_memory_manager(mut self, manager: MemoryManager) -> Self {
        self.memory = Arc::new(manager);
        self
    }

    /// Attach an audit sink.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(sink);
        self
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Move the store into service. Validates configuration and probes the
    /// backend; a failing probe is logged, not fatal. Idempotent until
    /// `dispose`.
    pub async fn initialize(&self) -> DepotResult<()> {
        self.config.validate()?;
        {
            let mut lifecycle = self
                .lifecycle
                .write()
                .map_err(|_| StateError::LockPoisoned)?;
            match *lifecycle {
                Lifecycle::Disposed => return Err(StateError::Disposed.into()),
                _ => *lifecycle = Lifecycle::Ready,
            }
        }
        match self.backend.health_check().await {
            Ok(healthy) => {
                if !healthy {
                    warn!(backend = self.backend.name(), "backend reports unhealthy");
                }
            }
            Err(error) => warn!(backend = self.backend.name(), %error, "health probe failed"),
        }
        Ok(())
    }

    /// Tear the store down: abort watch forwarders, terminate owned
    /// streams, drop all cached state. Idempotent; after it begins no
    /// operation is guaranteed to complete.
    pub fn dispose(&self) {
        {
            let mut lifecycle = match self.lifecycle.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *lifecycle == Lifecycle::Disposed {
                return;
            }
            *lifecycle = Lifecycle::Disposed;
        }

        let handles = match self.forwarders.lock() {
            Ok(mut guard) => guard.drain(..).collect::<Vec<_>>(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            handle.abort();
        }

        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
        if let Ok(mut watchers) = self.all_watchers.lock() {
            watchers.clear();
        }
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
        if let Ok(mut queries) = self.query_cache.write() {
            queries.clear();
        }
        if let Ok(mut fields) = self.field_cache.write() {
            fields.clear();
        }
    }

    pub(crate) fn ensure_ready(&self) -> DepotResult<()> {
        let lifecycle = self
            .lifecycle
            .read()
            .map_err(|_| StateError::LockPoisoned)?;
        match *lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Created => Err(StateError::NotInitialized.into()),
            Lifecycle::Disposed => Err(StateError::Disposed.into()),
        }
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Get by id under the configured default policy.
    pub async fn get(&self, id: &EntityId) -> DepotResult<Option<T>> {
        self.get_with(id, self.config.default_fetch_policy).await
    }

    /// Get by id under an explicit policy.
    pub async fn get_with(&self, id: &EntityId, policy: FetchPolicy) -> DepotResult<Option<T>> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = self.get_inner(id, policy).await;
        self.record_op("get", started, result.is_ok());
        if let Ok(Some(item)) = &result {
            // A get resolving to absence emits nothing.
            self.audit_log(
                AuditRecord::new(AuditAction::Get, T::entity_type())
                    .with_entity_id(id.clone())
                    .with_new_values(Value::Object(item.to_fields())),
            )
            .await;
        }
        result
    }

    async fn get_inner(&self, id: &EntityId, policy: FetchPolicy) -> DepotResult<Option<T>> {
        match policy {
            FetchPolicy::CacheFirst => {
                if let Some(value) = self.cached_fresh(id)? {
                    self.memory.touch(id);
                    self.record_hit();
                    return Ok(Some(value));
                }
                self.record_miss();
                let fetched = self.backend.get(id).await?;
                if let Some(item) = &fetched {
                    self.apply_update(item, None, false)?;
                }
                Ok(fetched)
            }
            FetchPolicy::NetworkFirst => match self.backend.get(id).await {
                Ok(fetched) => {
                    self.record_miss();
                    if let Some(item) = &fetched {
                        self.apply_update(item, None, false)?;
                    }
                    Ok(fetched)
                }
                Err(error) => match self.cached_any(id)? {
                    Some(value) => {
                        debug!(%id, %error, "backend read failed, serving cached value");
                        self.memory.touch(id);
                        self.record_hit();
                        Ok(Some(value))
                    }
                    None => Err(error),
                },
            },
            FetchPolicy::CacheOnly => {
                let cached = self.cached_any(id)?;
                if cached.is_some() {
                    self.memory.touch(id);
                    self.record_hit();
                } else {
                    self.record_miss();
                }
                Ok(cached)
            }
            FetchPolicy::NetworkOnly => {
                self.record_miss();
                let fetched = self.backend.get(id).await?;
                if let Some(item) = &fetched {
                    self.apply_update(item, None, false)?;
                }
                Ok(fetched)
            }
        }
    }

    /// Get a collection under the configured default policy.
    pub async fn get_all(&self, query: &Query) -> DepotResult<Vec<T>> {
        self.get_all_with(query, self.config.default_fetch_policy)
            .await
    }

    /// Get a collection under an explicit policy.
    pub async fn get_all_with(&self, query: &Query, policy: FetchPolicy) -> DepotResult<Vec<T>> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = self.get_all_inner(query, policy).await;
        self.record_op("get_all", started, result.is_ok());
        if let Ok(items) = &result {
            self.audit_log(
                AuditRecord::new(AuditAction::GetAll, T::entity_type())
                    .with_metadata(serde_json::json!({ "count": items.len() })),
            )
            .await;
        }
        result
    }

    async fn get_all_inner(&self, query: &Query, policy: FetchPolicy) -> DepotResult<Vec<T>> {
        match policy {
            FetchPolicy::CacheFirst => {
                if let Some(items) = self.cached_query(query, false)? {
                    self.record_hit();
                    return Ok(items);
                }
                self.record_miss();
                let items = self.backend.get_all(query).await?;
                self.populate_collection(query, &items)?;
                Ok(items)
            }
            FetchPolicy::NetworkFirst => match self.backend.get_all(query).await {
                Ok(items) => {
                    self.record_miss();
                    self.populate_collection(query, &items)?;
                    Ok(items)
                }
                Err(error) => match self.cached_query(query, true)? {
                    Some(items) => {
                        debug!(%error, "backend query failed, serving cached result");
                        self.record_hit();
                        Ok(items)
                    }
                    None => Err(error),
                },
            },
            FetchPolicy::CacheOnly => {
                let items = self.evaluate_cache(query)?;
                self.record_hit();
                Ok(items)
            }
            FetchPolicy::NetworkOnly => {
                self.record_miss();
                let items = self.backend.get_all(query).await?;
                self.populate_collection(query, &items)?;
                Ok(items)
            }
        }
    }

    /// One page of a collection, for the pagination engine.
    pub async fn get_all_paged(&self, query: &Query) -> DepotResult<PagedResult<T>> {
        self.ensure_ready()?;
        if !self.backend.supports_pagination() {
            return Err(
                UnsupportedOperationError::new(self.backend.name(), "get_all_paged").into(),
            );
        }
        let started = Instant::now();
        let result = self.backend.get_all_paged(query).await;
        if let Ok(page) = &result {
            for item in page.items() {
                self.apply_update(item, None, false)?;
            }
        }
        self.record_op("get_all_paged", started, result.is_ok());
        result
    }

    // ========================================================================
    // WRITES
    // ========================================================================

    /// Save one entity, write-through, no tags.
    pub async fn save(&self, item: &T) -> DepotResult<()> {
        self.save_with(item, WritePolicy::default(), &[]).await
    }

    /// Save one entity under an explicit policy, attaching tags.
    pub async fn save_with(
        &self,
        item: &T,
        policy: WritePolicy,
        tags: &[String],
    ) -> DepotResult<()> {
        self.ensure_ready()?;
        let started = Instant::now();
        let previous = self.cached_any(&item.id())?;
        let result = self.save_inner(item, policy, tags).await;
        self.record_op("save", started, result.is_ok());
        let mut record = AuditRecord::new(AuditAction::Save, T::entity_type())
            .with_entity_id(item.id())
            .with_new_values(Value::Object(item.to_fields()))
            .with_success(result.is_ok());
        if let Some(previous) = previous {
            record = record.with_previous_values(Value::Object(previous.to_fields()));
        }
        self.audit_log(record).await;
        result
    }

    async fn save_inner(&self, item: &T, policy: WritePolicy, tags: &[String]) -> DepotResult<()> {
        if policy == WritePolicy::CacheAndBackend {
            self.backend.save(item).await?;
        }
        self.apply_update(item, Some(tags), true)?;
        self.maybe_evict()?;
        Ok(())
    }

    /// Save a batch in order.
    pub async fn save_all(&self, items: &[T]) -> DepotResult<()> {
        self.save_all_with(items, WritePolicy::default(), &[]).await
    }

    /// Save a batch under an explicit policy, attaching tags.
    pub async fn save_all_with(
        &self,
        items: &[T],
        policy: WritePolicy,
        tags: &[String],
    ) -> DepotResult<()> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = self.save_all_inner(items, policy, tags).await;
        self.record_op("save_all", started, result.is_ok());
        self.audit_log(
            AuditRecord::new(AuditAction::Save, T::entity_type())
                .with_metadata(serde_json::json!({ "count": items.len() }))
                .with_success(result.is_ok()),
        )
        .await;
        result
    }

    async fn save_all_inner(
        &self,
        items: &[T],
        policy: WritePolicy,
        tags: &[String],
    ) -> DepotResult<()> {
        if policy == WritePolicy::CacheAndBackend {
            self.backend.save_all(items).await?;
        }
        for item in items {
            self.apply_update(item, Some(tags), true)?;
        }
        self.maybe_evict()?;
        Ok(())
    }

    /// Delete by id; returns whether the backend held the entity.
    pub async fn delete(&self, id: &EntityId) -> DepotResult<bool> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = self.delete_inner(id).await;
        self.record_op("delete", started, result.is_ok());
        self.audit_log(
            AuditRecord::new(AuditAction::Delete, T::entity_type())
                .with_entity_id(id.clone())
                .with_success(result.is_ok()),
        )
        .await;
        result
    }

    async fn delete_inner(&self, id: &EntityId) -> DepotResult<bool> {
        let existed = self.backend.delete(id).await?;
        self.remove_entry(id)?;
        Ok(existed)
    }

    /// Delete a batch; returns how many existed.
    pub async fn delete_all(&self, ids: &[EntityId]) -> DepotResult<usize> {
        self.ensure_ready()?;
        let started = Instant::now();
        let result = async {
            let deleted = self.backend.delete_all(ids).await?;
            for id in ids {
                self.remove_entry(id)?;
            }
            Ok(deleted)
        }
        .await;
        self.record_op("delete_all", started, result.is_ok());
        self.audit_log(
            AuditRecord::new(AuditAction::Delete, T::entity_type())
                .with_metadata(serde_json::json!({ "count": ids.len() }))
                .with_success(result.is_ok()),
        )
        .await;
        result
    }

    // ========================================================================
    // INVALIDATION
    // ========================================================================

    /// Mark matching cache entries stale without removing them. The next
    /// cache-first read for a marked id is a forced miss. Returns how many
    /// entries were marked.
    pub fn invalidate(&self, scope: InvalidationScope) -> DepotResult<usize> {
        self.ensure_ready()?;
        let mut cache = self.cache.write().map_err(|_| StateError::LockPoisoned)?;
        let mut marked = 0;
        match &scope {
            InvalidationScope::Id(id) => {
                if let Some(entry) = cache.get_mut(id) {
                    entry.is_stale = true;
                    marked = 1;
                }
            }
            InvalidationScope::Ids(ids) => {
                for id in ids {
                    if let Some(entry) = cache.get_mut(id) {
                        entry.is_stale = true;
                        marked += 1;
                    }
                }
            }
            InvalidationScope::All => {
                for entry in cache.values_mut() {
                    entry.is_stale = true;
                    marked += 1;
                }
            }
            InvalidationScope::Tags(tags) => {
                for entry in cache.values_mut() {
                    if tags.iter().any(|tag| entry.tags.contains(tag)) {
                        entry.is_stale = true;
                        marked += 1;
                    }
                }
            }
            InvalidationScope::Where(query) => {
                for entry in cache.values_mut() {
                    if query.matches(&entry.value.to_fields()) {
                        entry.is_stale = true;
                        marked += 1;
                    }
                }
            }
        }
        drop(cache);
        self.mark_query_cache_stale()?;
        Ok(marked)
    }

    /// Wall-clock age of a cache entry, `None` when the id is not cached.
    pub fn entry_staleness(&self, id: &EntityId) -> DepotResult<Option<Duration>> {
        let cache = self.cache.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(cache.get(id).map(|entry| {
            Utc::now()
                .signed_duration_since(entry.cached_at)
                .to_std()
                .unwrap_or(Duration::ZERO)
        }))
    }

    // ========================================================================
    // WATCH
    // ========================================================================

    /// Replay-latest stream of one entity's value. Realtime backends feed
    /// the stream through a forwarder task; otherwise store-mediated
    /// mutations drive it.
    pub fn watch(&self, id: &EntityId) -> DepotResult<WatchStream<Option<T>>> {
        self.ensure_ready()?;
        let mut watchers = self.watchers.lock().map_err(|_| StateError::LockPoisoned)?;
        if let Some(subject) = watchers.get(id) {
            return Ok(subject.subscribe());
        }

        let initial = self.cached_any(id)?;
        let subject = Arc::new(Subject::new(initial));
        if self.backend.supports_realtime() {
            let mut events = self.backend.watch(id);
            let forward_to = Arc::clone(&subject);
            let handle = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        WatchEvent::Updated(item) => forward_to.emit(Some(item)),
                        WatchEvent::Removed(_) => forward_to.emit(None),
                    }
                }
            });
            self.forwarders
                .lock()
                .map_err(|_| StateError::LockPoisoned)?
                .push(handle);
        }
        let stream = subject.subscribe();
        watchers.insert(id.clone(), subject);
        Ok(stream)
    }

    /// Replay-latest stream of a query's matching items.
    pub fn watch_all(&self, query: &Query) -> DepotResult<WatchStream<Vec<T>>> {
        self.ensure_ready()?;
        let key = query.key();
        let mut watchers = self
            .all_watchers
            .lock()
            .map_err(|_| StateError::LockPoisoned)?;
        if let Some(watcher) = watchers.get(&key) {
            return Ok(watcher.subject.subscribe());
        }

        let initial = self.evaluate_cache(query)?;
        let subject = Arc::new(Subject::new(initial.clone()));
        if self.backend.supports_realtime() {
            let mut events = self.backend.watch_all(query);
            let forward_to = Arc::clone(&subject);
            let query_for_task = query.clone();
            let mut items = initial;
            let handle = tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    match event {
                        WatchEvent::Updated(item) => {
                            let id = item.id();
                            items.retain(|existing: &T| existing.id() != id);
                            if query_for_task.matches(&item.to_fields()) {
                                items.push(item);
                            }
                        }
                        WatchEvent::Removed(id) => {
                            items.retain(|existing| existing.id() != id);
                        }
                    }
                    sort_and_window(&mut items, &query_for_task);
                    forward_to.emit(items.clone());
                }
            });
            self.forwarders
                .lock()
                .map_err(|_| StateError::LockPoisoned)?
                .push(handle);
        }
        let stream = subject.subscribe();
        watchers.insert(
            key,
            AllWatcher {
                query: query.clone(),
                subject,
            },
        );
        Ok(stream)
    }

    // ========================================================================
    // SYNC SURFACE
    // ========================================================================

    /// Run a sync pass on the backend, tracking status and counters.
    pub async fn sync(&self) -> DepotResult<SyncResult> {
        self.ensure_ready()?;
        let started = Instant::now();
        self.sync_status.emit(SyncStatus::Syncing);
        let result = self.backend.sync().await;
        match &result {
            Ok(_) => {
                self.sync_status.emit(SyncStatus::Completed);
                self.record_sync(true);
            }
            Err(error) => {
                warn!(%error, "sync failed");
                self.sync_status.emit(SyncStatus::Failed);
                self.record_sync(false);
            }
        }
        self.record_op("sync", started, result.is_ok());
        result
    }

    /// Status of the most recent sync pass.
    pub fn sync_status(&self) -> DepotResult<SyncStatus> {
        self.ensure_ready()?;
        Ok(self.sync_status.get())
    }

    /// Replay-latest stream of sync status transitions.
    pub fn sync_status_stream(&self) -> DepotResult<WatchStream<SyncStatus>> {
        self.ensure_ready()?;
        Ok(self.sync_status.subscribe())
    }

    /// Number of queued offline mutations.
    pub async fn pending_changes_count(&self) -> DepotResult<usize> {
        self.ensure_ready()?;
        self.backend.pending_changes_count().await
    }

    /// Resubmit every queued change that has a recorded delivery error.
    /// Returns how many were resubmitted.
    pub async fn retry_all_pending(&self) -> DepotResult<usize> {
        self.ensure_ready()?;
        let changes = self.backend.pending_changes().await?;
        let mut retried = 0;
        for change in changes.iter().filter(|c| c.last_error.is_some()) {
            match self.backend.retry_change(change.change_id).await {
                Ok(()) => retried += 1,
                Err(error) => {
                    warn!(change_id = %change.change_id, %error, "retry failed");
                }
            }
        }
        Ok(retried)
    }

    /// Cancel every queued change the backend will release. Returns how
    /// many were actually cancelled; the backend may refuse in-flight
    /// changes by answering none for them.
    pub async fn cancel_all_pending(&self) -> DepotResult<usize> {
        self.ensure_ready()?;
        let changes = self.backend.pending_changes().await?;
        let mut cancelled = 0;
        for change in changes {
            if self.backend.cancel_change(change.change_id).await?.is_some() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Conflicts surfaced by the backend during sync.
    pub fn conflicts_stream(&self) -> DepotResult<BoxStream<'static, Conflict>> {
        self.ensure_ready()?;
        Ok(self.backend.conflicts_stream())
    }

    /// Queued offline mutations, for inspection.
    pub async fn pending_changes(&self) -> DepotResult<Vec<PendingChange>> {
        self.ensure_ready()?;
        self.backend.pending_changes().await
    }

    /// Resubmit one queued change by id.
    pub async fn retry_change(&self, change_id: Uuid) -> DepotResult<()> {
        self.ensure_ready()?;
        self.backend.retry_change(change_id).await
    }

    // ========================================================================
    // LAZY FIELDS
    // ========================================================================

    fn lazy_config(&self) -> DepotResult<&LazyFieldConfig> {
        self.config
            .lazy_fields
            .as_ref()
            .ok_or_else(|| StateError::LazyFieldsNotConfigured.into())
    }

    /// Load one lazily-configured field, memoized per (id, field).
    pub async fn load_field(&self, id: &EntityId, field: &str) -> DepotResult<Option<Value>> {
        self.ensure_ready()?;
        self.lazy_config()?;
        {
            let fields = self
                .field_cache
                .read()
                .map_err(|_| StateError::LockPoisoned)?;
            if let Some(value) = fields.get(&(id.clone(), field.to_string())) {
                return Ok(Some(value.clone()));
            }
        }
        if !self.backend.supports_field_operations() {
            return Err(UnsupportedOperationError::new(self.backend.name(), "get_field").into());
        }
        let value = self.backend.get_field(id, field).await?;
        if let Some(value) = &value {
            self.field_cache
                .write()
                .map_err(|_| StateError::LockPoisoned)?
                .insert((id.clone(), field.to_string()), value.clone());
        }
        Ok(value)
    }

    /// Load several fields, consulting the memo first and fetching the
    /// remainder in one backend call.
    pub async fn load_field_batch(
        &self,
        id: &EntityId,
        fields: &[String],
    ) -> DepotResult<HashMap<String, Value>> {
        self.ensure_ready()?;
        self.lazy_config()?;
        let mut out = HashMap::new();
        let mut missing = Vec::new();
        {
            let memo = self
                .field_cache
                .read()
                .map_err(|_| StateError::LockPoisoned)?;
            for field in fields {
                match memo.get(&(id.clone(), field.clone())) {
                    Some(value) => {
                        out.insert(field.clone(), value.clone());
                    }
                    None => missing.push(field.clone()),
                }
            }
        }
        if missing.is_empty() {
            return Ok(out);
        }
        if !self.backend.supports_field_operations() {
            return Err(UnsupportedOperationError::new(self.backend.name(), "get_fields").into());
        }
        let fetched = self.backend.get_fields(id, &missing).await?;
        let mut memo = self
            .field_cache
            .write()
            .map_err(|_| StateError::LockPoisoned)?;
        for (field, value) in fetched {
            memo.insert((id.clone(), field.clone()), value.clone());
            out.insert(field, value);
        }
        Ok(out)
    }

    /// Warm the field memo for a set of ids using the configured lazy
    /// field list.
    pub async fn preload_fields(&self, ids: &[EntityId]) -> DepotResult<()> {
        self.ensure_ready()?;
        let fields = self.lazy_config()?.fields.clone();
        if fields.is_empty() {
            return Ok(());
        }
        for id in ids {
            self.load_field_batch(id, &fields).await?;
        }
        Ok(())
    }

    /// Drop every memoized field value.
    pub fn clear_field_cache(&self) -> DepotResult<()> {
        self.ensure_ready()?;
        self.lazy_config()?;
        self.field_cache
            .write()
            .map_err(|_| StateError::LockPoisoned)?
            .clear();
        Ok(())
    }

    /// Drop the memoized field values of one entity.
    pub fn clear_field_cache_for_entity(&self, id: &EntityId) -> DepotResult<()> {
        self.ensure_ready()?;
        self.lazy_config()?;
        self.field_cache
            .write()
            .map_err(|_| StateError::LockPoisoned)?
            .retain(|(entity_id, _), _| entity_id != id);
        Ok(())
    }

    // ========================================================================
    // MEMORY ORCHESTRATION
    // ========================================================================

    /// Evict up to `count` unpinned entries from the memory tracker and
    /// the entity cache. Returns the evicted ids.
    pub fn evict_cache(&self, count: usize) -> DepotResult<Vec<EntityId>> {
        self.ensure_ready()?;
        let evicted = self.memory.evict(count);
        self.drop_entries(&evicted)?;
        Ok(evicted)
    }

    /// Evict every unpinned entry.
    pub fn evict_unpinned_cache(&self) -> DepotResult<Vec<EntityId>> {
        self.ensure_ready()?;
        let evicted = self.memory.evict_unpinned();
        self.drop_entries(&evicted)?;
        Ok(evicted)
    }

    /// Exempt an entry from eviction.
    pub fn pin(&self, id: &EntityId) -> DepotResult<()> {
        self.ensure_ready()?;
        self.memory.pin(id);
        Ok(())
    }

    /// Clear an entry's eviction exemption.
    pub fn unpin(&self, id: &EntityId) -> DepotResult<()> {
        self.ensure_ready()?;
        self.memory.unpin(id);
        Ok(())
    }

    /// Whether an entry is pinned.
    pub fn is_pinned(&self, id: &EntityId) -> bool {
        self.memory.is_pinned(id)
    }

    /// Current memory counters.
    pub fn memory_metrics(&self) -> MemoryMetrics {
        self.memory.metrics()
    }

    /// Current memory pressure.
    pub fn memory_pressure(&self) -> PressureLevel {
        self.memory.pressure()
    }

    /// Replay-latest stream of memory counters.
    pub fn memory_metrics_stream(&self) -> BoxStream<'static, MemoryMetrics> {
        self.memory.metrics_stream()
    }

    /// Replay-latest stream of pressure levels.
    pub fn memory_pressure_stream(&self) -> BoxStream<'static, PressureLevel> {
        self.memory.pressure_stream()
    }

    // ========================================================================
    // TELEMETRY
    // ========================================================================

    /// Snapshot the sampled counters.
    pub fn get_stats(&self) -> DepotResult<StoreStats> {
        self.ensure_ready()?;
        Ok(self
            .stats
            .lock()
            .map_err(|_| StateError::LockPoisoned)?
            .clone())
    }

    /// Zero the sampled counters.
    pub fn reset_stats(&self) -> DepotResult<()> {
        self.ensure_ready()?;
        *self.stats.lock().map_err(|_| StateError::LockPoisoned)? = StoreStats::default();
        Ok(())
    }

    /// Probe the backend.
    pub async fn health_check(&self) -> DepotResult<bool> {
        self.ensure_ready()?;
        self.backend.health_check().await
    }

    fn sampled(&self) -> bool {
        let rate = self.config.stats_sampling_rate;
        if rate <= 0.0 {
            return false;
        }
        rate >= 1.0 || rand::random::<f64>() < rate
    }

    fn record_op(&self, op: &'static str, started: Instant, ok: bool) {
        if !self.sampled() {
            return;
        }
        let mut stats = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        stats.operations += 1;
        *stats.op_counts.entry(op).or_insert(0) += 1;
        stats.total_duration += started.elapsed();
        if !ok {
            stats.errors += 1;
        }
        stats.last_updated = Some(Utc::now());
    }

    fn record_hit(&self) {
        if !self.sampled() {
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.cache_hits += 1;
        }
    }

    fn record_miss(&self) {
        if !self.sampled() {
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.cache_misses += 1;
        }
    }

    fn record_sync(&self, ok: bool) {
        if !self.sampled() {
            return;
        }
        if let Ok(mut stats) = self.stats.lock() {
            if ok {
                stats.sync_successes += 1;
            } else {
                stats.sync_failures += 1;
            }
        }
    }

    async fn audit_log(&self, record: AuditRecord) {
        if let Some(sink) = &self.audit {
            sink.log(record).await;
        }
    }

    // ========================================================================
    // CACHE INTERNALS
    // ========================================================================

    fn cached_fresh(&self, id: &EntityId) -> DepotResult<Option<T>> {
        let cache = self.cache.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(cache
            .get(id)
            .filter(|entry| !entry.is_stale)
            .map(|entry| entry.value.clone()))
    }

    fn cached_any(&self, id: &EntityId) -> DepotResult<Option<T>> {
        let cache = self.cache.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(cache.get(id).map(|entry| entry.value.clone()))
    }

    /// Upsert a cache entry as fresh, track its size, and notify watchers
    /// when the backend cannot do so itself.
    pub(crate) fn apply_update(
        &self,
        item: &T,
        tags: Option<&[String]>,
        mark_queries_stale: bool,
    ) -> DepotResult<()> {
        let id = item.id();
        {
            let mut cache = self.cache.write().map_err(|_| StateError::LockPoisoned)?;
            match cache.get_mut(&id) {
                Some(entry) => {
                    entry.value = item.clone();
                    entry.is_stale = false;
                    entry.cached_at = Utc::now();
                    if let Some(tags) = tags {
                        entry.tags.extend(tags.iter().cloned());
                    }
                }
                None => {
                    cache.insert(
                        id.clone(),
                        CacheEntry {
                            value: item.clone(),
                            is_stale: false,
                            tags: tags
                                .map(|t| t.iter().cloned().collect())
                                .unwrap_or_default(),
                            cached_at: Utc::now(),
                        },
                    );
                }
            }
        }
        self.memory.track(&id, &Value::Object(item.to_fields()));
        if mark_queries_stale {
            self.mark_query_cache_stale()?;
        }
        self.notify_entity(&id, Some(item.clone()))?;
        self.notify_all_watchers()?;
        Ok(())
    }

    /// Drop a cache entry after a delete and notify watchers.
    pub(crate) fn remove_entry(&self, id: &EntityId) -> DepotResult<()> {
        {
            let mut cache = self.cache.write().map_err(|_| StateError::LockPoisoned)?;
            cache.remove(id);
        }
        self.memory.forget(id);
        self.mark_query_cache_stale()?;
        self.notify_entity(id, None)?;
        self.notify_all_watchers()?;
        Ok(())
    }

    fn drop_entries(&self, ids: &[EntityId]) -> DepotResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut cache = self.cache.write().map_err(|_| StateError::LockPoisoned)?;
        for id in ids {
            cache.remove(id);
        }
        Ok(())
    }

    /// Inline over-budget handling: one eviction batch per write, never a
    /// background thread.
    fn maybe_evict(&self) -> DepotResult<()> {
        if !self.memory.over_budget() {
            return Ok(());
        }
        let evicted = self.memory.evict_batch();
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted cache entries over budget");
            self.drop_entries(&evicted)?;
        }
        Ok(())
    }

    fn mark_query_cache_stale(&self) -> DepotResult<()> {
        let mut queries = self
            .query_cache
            .write()
            .map_err(|_| StateError::LockPoisoned)?;
        for entry in queries.values_mut() {
            entry.is_stale = true;
        }
        Ok(())
    }

    /// Serve a collection read from the query-result cache, requiring
    /// every member entry to be present (and fresh unless `allow_stale`).
    fn cached_query(&self, query: &Query, allow_stale: bool) -> DepotResult<Option<Vec<T>>> {
        let queries = self
            .query_cache
            .read()
            .map_err(|_| StateError::LockPoisoned)?;
        let Some(entry) = queries.get(&query.key()) else {
            return Ok(None);
        };
        if entry.is_stale && !allow_stale {
            return Ok(None);
        }
        let cache = self.cache.read().map_err(|_| StateError::LockPoisoned)?;
        let mut items = Vec::with_capacity(entry.ids.len());
        for id in &entry.ids {
            match cache.get(id) {
                Some(cached) if allow_stale || !cached.is_stale => {
                    items.push(cached.value.clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(items))
    }

    fn populate_collection(&self, query: &Query, items: &[T]) -> DepotResult<()> {
        for item in items {
            self.apply_update(item, None, false)?;
        }
        let mut queries = self
            .query_cache
            .write()
            .map_err(|_| StateError::LockPoisoned)?;
        queries.insert(
            query.key(),
            QueryCacheEntry {
                ids: items.iter().map(|item| item.id()).collect(),
                is_stale: false,
            },
        );
        Ok(())
    }

    /// Evaluate a query over cached values only.
    fn evaluate_cache(&self, query: &Query) -> DepotResult<Vec<T>> {
        let cache = self.cache.read().map_err(|_| StateError::LockPoisoned)?;
        let mut items: Vec<T> = cache
            .values()
            .filter(|entry| query.matches(&entry.value.to_fields()))
            .map(|entry| entry.value.clone())
            .collect();
        drop(cache);
        sort_and_window(&mut items, query);
        Ok(items)
    }

    fn notify_entity(&self, id: &EntityId, value: Option<T>) -> DepotResult<()> {
        if self.backend.supports_realtime() {
            // Realtime backends drive the subjects through forwarders.
            return Ok(());
        }
        let watchers = self.watchers.lock().map_err(|_| StateError::LockPoisoned)?;
        if let Some(subject) = watchers.get(id) {
            subject.emit(value);
        }
        Ok(())
    }

    fn notify_all_watchers(&self) -> DepotResult<()> {
        if self.backend.supports_realtime() {
            return Ok(());
        }
        let watchers = self
            .all_watchers
            .lock()
            .map_err(|_| StateError::LockPoisoned)?;
        if watchers.is_empty() {
            return Ok(());
        }
        for watcher in watchers.values() {
            let items = self.evaluate_cache(&watcher.query)?;
            watcher.subject.emit(items);
        }
        Ok(())
    }
}

/// Order matching items per the query, falling back to id order, and trim
/// to the window limit.
fn sort_and_window<T: Entity>(items: &mut Vec<T>, query: &Query) {
    if query.sort.is_empty() {
        items.sort_by(|a, b| a.id().cmp(&b.id()));
    } else {
        items.sort_by(|a, b| query.compare(&a.to_fields(), &b.to_fields()));
    }
    if let Some(limit) = query.limit {
        items.truncate(limit);
    }
}

// ============================================================================
// TESTS
// ============================================================================
