//! Composite backend.
//!
//! Aggregates up to three constituent backends - primary (required),
//! fallback and cache (optional) - behind the ordinary backend trait, with
//! configurable read failover and write fan-out. Recovery is local: the
//! composite advances to the next applicable constituent and only surfaces
//! an error once all of them are exhausted.

use async_trait::async_trait;
use futures_util::future::{select_ok, BoxFuture, FutureExt};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use depot_core::{
    DepotResult, Entity, EntityId, PagedResult, Query, UnsupportedOperationError,
};

use crate::backend::{Backend, Conflict, EventStream, PendingChange, SyncResult};

/// How reads walk the constituents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Primary, then fallback, then cache; successful reads populate the
    /// cache constituent.
    #[default]
    PrimaryFirst,
    /// Cache first; any miss or cache error falls through to the
    /// primary-first ladder.
    CacheFirst,
    /// Race every constituent; first successful completion wins, losers
    /// are abandoned. All failing yields an empty result, not an error.
    Fastest,
}

/// How writes fan out across the constituents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteStrategy {
    /// Write the primary only.
    #[default]
    PrimaryOnly,
    /// Write every configured constituent, best-effort. Secondary failures
    /// are logged; a primary failure is never masked by secondary success.
    All,
    /// Write primary and cache, skipping the fallback.
    PrimaryAndCache,
}

/// Multi-backend composition with failover.
pub struct CompositeBackend<T: Entity> {
    name: String,
    primary: Arc<dyn Backend<T>>,
    fallback: Option<Arc<dyn Backend<T>>>,
    cache: Option<Arc<dyn Backend<T>>>,
    read_strategy: ReadStrategy,
    write_strategy: WriteStrategy,
}

impl<T: Entity> CompositeBackend<T> {
    /// Create a composite around a primary backend with default
    /// strategies and no secondary constituents.
    pub fn new(primary: Arc<dyn Backend<T>>) -> Self {
        Self {
            name: format!("CompositeBackend({})", primary.name()),
            primary,
            fallback: None,
            cache: None,
            read_strategy: ReadStrategy::default(),
            write_strategy: WriteStrategy::default(),
        }
    }

    /// Attach a fallback backend.
    pub fn with_fallback(mut self, fallback: Arc<dyn Backend<T>>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Attach a cache backend.
    pub fn with_cache(mut self, cache: Arc<dyn Backend<T>>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Set the read strategy.
    pub fn with_read_strategy(mut self, strategy: ReadStrategy) -> Self {
        self.read_strategy = strategy;
        self
    }

    /// Set the write strategy.
    pub fn with_write_strategy(mut self, strategy: WriteStrategy) -> Self {
        self.write_strategy = strategy;
        self
    }

    fn constituents(&self) -> Vec<Arc<dyn Backend<T>>> {
        let mut out = vec![Arc::clone(&self.primary)];
        if let Some(fallback) = &self.fallback {
            out.push(Arc::clone(fallback));
        }
        if let Some(cache) = &self.cache {
            out.push(Arc::clone(cache));
        }
        out
    }

    /// Best-effort cache population on the non-racing read paths.
    async fn populate_cache(&self, item: &T) {
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.save(item).await {
                debug!(backend = cache.name(), %error, "cache population failed");
            }
        }
    }

    async fn populate_cache_all(&self, items: &[T]) {
        if let Some(cache) = &self.cache {
            if let Err(error) = cache.save_all(items).await {
                debug!(backend = cache.name(), %error, "cache population failed");
            }
        }
    }

    /// Fire-and-forget cache population after a race; the consumer has
    /// already moved on and never observes the outcome.
    fn spawn_populate_cache(&self, items: Vec<T>) {
        if let Some(cache) = &self.cache {
            let cache = Arc::clone(cache);
            tokio::spawn(async move {
                if let Err(error) = cache.save_all(&items).await {
                    debug!(backend = cache.name(), %error, "cache population failed");
                }
            });
        }
    }

    async fn get_primary_first(&self, id: &EntityId) -> DepotResult<Option<T>> {
        let mut last_error = match self.primary.get(id).await {
            Ok(found) => {
                if let Some(item) = &found {
                    self.populate_cache(item).await;
                }
                return Ok(found);
            }
            Err(error) => {
                warn!(backend = self.primary.name(), %error, "primary read failed");
                error
            }
        };

        if let Some(fallback) = &self.fallback {
            match fallback.get(id).await {
                Ok(found) => {
                    if let Some(item) = &found {
                        self.populate_cache(item).await;
                    }
                    return Ok(found);
                }
                Err(error) => {
                    warn!(backend = fallback.name(), %error, "fallback read failed");
                    last_error = error;
                }
            }
        }

        if let Some(cache) = &self.cache {
            match cache.get(id).await {
                Ok(found) => return Ok(found),
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }

    async fn get_all_primary_first(&self, query: &Query) -> DepotResult<Vec<T>> {
        let mut last_error = match self.primary.get_all(query).await {
            Ok(items) => {
                self.populate_cache_all(&items).await;
                return Ok(items);
            }
            Err(error) => {
                warn!(backend = self.primary.name(), %error, "primary read failed");
                error
            }
        };

        if let Some(fallback) = &self.fallback {
            match fallback.get_all(query).await {
                Ok(items) => {
                    self.populate_cache_all(&items).await;
                    return Ok(items);
                }
                Err(error) => {
                    warn!(backend = fallback.name(), %error, "fallback read failed");
                    last_error = error;
                }
            }
        }

        if let Some(cache) = &self.cache {
            match cache.get_all(query).await {
                Ok(items) => return Ok(items),
                Err(error) => last_error = error,
            }
        }

        Err(last_error)
    }

    async fn get_fastest(&self, id: &EntityId) -> DepotResult<Option<T>> {
        let races: Vec<BoxFuture<'_, DepotResult<Option<T>>>> = self
            .constituents()
            .into_iter()
            .map(|backend| {
                let id = id.clone();
                async move { backend.get(&id).await }.boxed()
            })
            .collect();

        match select_ok(races).await {
            Ok((found, _losers)) => {
                if let Some(item) = &found {
                    self.spawn_populate_cache(vec![item.clone()]);
                }
                Ok(found)
            }
            Err(error) => {
                debug!(%error, "all constituents failed the read race");
                Ok(None)
            }
        }
    }

    async fn get_all_fastest(&self, query: &Query) -> DepotResult<Vec<T>> {
        let races: Vec<BoxFuture<'_, DepotResult<Vec<T>>>> = self
            .constituents()
            .into_iter()
            .map(|backend| {
                let query = query.clone();
                async move { backend.get_all(&query).await }.boxed()
            })
            .collect();

        match select_ok(races).await {
            Ok((items, _losers)) => {
                self.spawn_populate_cache(items.clone());
                Ok(items)
            }
            Err(error) => {
                debug!(%error, "all constituents failed the read race");
                Ok(Vec::new())
            }
        }
    }

    /// Dispatch a field/pagination member to the first constituent that
    /// advertises the capability (primary preferred, then fallback).
    fn capable_constituent(
        &self,
        has: impl Fn(&dyn Backend<T>) -> bool,
    ) -> Option<Arc<dyn Backend<T>>> {
        if has(self.primary.as_ref()) {
            return Some(Arc::clone(&self.primary));
        }
        self.fallback
            .as_ref()
            .filter(|f| has(f.as_ref()))
            .map(Arc::clone)
    }
}

#[async_trait]
impl<T: Entity> Backend<T> for CompositeBackend<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_offline(&self) -> bool {
        self.primary.supports_offline()
            || self.fallback.as_ref().is_some_and(|f| f.supports_offline())
    }

    fn supports_realtime(&self) -> bool {
        self.primary.supports_realtime()
            || self.fallback.as_ref().is_some_and(|f| f.supports_realtime())
    }

    fn supports_transactions(&self) -> bool {
        // Transactions always delegate to the primary.
        self.primary.supports_transactions()
    }

    fn supports_field_operations(&self) -> bool {
        self.primary.supports_field_operations()
            || self
                .fallback
                .as_ref()
                .is_some_and(|f| f.supports_field_operations())
    }

    fn supports_pagination(&self) -> bool {
        self.primary.supports_pagination()
            || self
                .fallback
                .as_ref()
                .is_some_and(|f| f.supports_pagination())
    }

    async fn get(&self, id: &EntityId) -> DepotResult<Option<T>> {
        match self.read_strategy {
            ReadStrategy::PrimaryFirst => self.get_primary_first(id).await,
            ReadStrategy::CacheFirst => {
                if let Some(cache) = &self.cache {
                    match cache.get(id).await {
                        Ok(Some(item)) => return Ok(Some(item)),
                        Ok(None) => {}
                        Err(error) => {
                            debug!(backend = cache.name(), %error, "cache read failed");
                        }
                    }
                }
                self.get_primary_first(id).await
            }
            ReadStrategy::Fastest => self.get_fastest(id).await,
        }
    }

    async fn get_all(&self, query: &Query) -> DepotResult<Vec<T>> {
        match self.read_strategy {
            ReadStrategy::PrimaryFirst => self.get_all_primary_first(query).await,
            ReadStrategy::CacheFirst => {
                if let Some(cache) = &self.cache {
                    match cache.get_all(query).await {
                        // An empty result is indistinguishable from a cold
                        // cache, so it falls through.
                        Ok(items) if !items.is_empty() => return Ok(items),
                        Ok(_) => {}
                        Err(error) => {
                            debug!(backend = cache.name(), %error, "cache read failed");
                        }
                    }
                }
                self.get_all_primary_first(query).await
            }
            ReadStrategy::Fastest => self.get_all_fastest(query).await,
        }
    }

    fn watch(&self, id: &EntityId) -> EventStream<T> {
        let streams: Vec<EventStream<T>> = self
            .constituents()
            .iter()
            .map(|backend| backend.watch(id))
            .collect();
        stream::select_all(streams).boxed()
    }

    fn watch_all(&self, query: &Query) -> EventStream<T> {
        let streams: Vec<EventStream<T>> = self
            .constituents()
            .iter()
            .map(|backend| backend.watch_all(query))
            .collect();
        stream::select_all(streams).boxed()
    }

    async fn save(&self, item: &T) -> DepotResult<()> {
        match self.write_strategy {
            WriteStrategy::PrimaryOnly => self.primary.save(item).await,
            WriteStrategy::All => {
                let primary_result = self.primary.save(item).await;
                if let Some(fallback) = &self.fallback {
                    if let Err(error) = fallback.save(item).await {
                        warn!(backend = fallback.name(), %error, "fallback write failed");
                    }
                }
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.save(item).await {
                        warn!(backend = cache.name(), %error, "cache write failed");
                    }
                }
                primary_result
            }
            WriteStrategy::PrimaryAndCache => {
                let primary_result = self.primary.save(item).await;
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.save(item).await {
                        warn!(backend = cache.name(), %error, "cache write failed");
                    }
                }
                primary_result
            }
        }
    }

    async fn save_all(&self, items: &[T]) -> DepotResult<()> {
        match self.write_strategy {
            WriteStrategy::PrimaryOnly => self.primary.save_all(items).await,
            WriteStrategy::All => {
                let primary_result = self.primary.save_all(items).await;
                if let Some(fallback) = &self.fallback {
                    if let Err(error) = fallback.save_all(items).await {
                        warn!(backend = fallback.name(), %error, "fallback write failed");
                    }
                }
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.save_all(items).await {
                        warn!(backend = cache.name(), %error, "cache write failed");
                    }
                }
                primary_result
            }
            WriteStrategy::PrimaryAndCache => {
                let primary_result = self.primary.save_all(items).await;
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.save_all(items).await {
                        warn!(backend = cache.name(), %error, "cache write failed");
                    }
                }
                primary_result
            }
        }
    }

    async fn delete(&self, id: &EntityId) -> DepotResult<bool> {
        match self.write_strategy {
            WriteStrategy::PrimaryOnly => self.primary.delete(id).await,
            WriteStrategy::All => {
                let primary_result = self.primary.delete(id).await;
                if let Some(fallback) = &self.fallback {
                    if let Err(error) = fallback.delete(id).await {
                        warn!(backend = fallback.name(), %error, "fallback delete failed");
                    }
                }
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.delete(id).await {
                        warn!(backend = cache.name(), %error, "cache delete failed");
                    }
                }
                primary_result
            }
            WriteStrategy::PrimaryAndCache => {
                let primary_result = self.primary.delete(id).await;
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.delete(id).await {
                        warn!(backend = cache.name(), %error, "cache delete failed");
                    }
                }
                primary_result
            }
        }
    }

    async fn delete_all(&self, ids: &[EntityId]) -> DepotResult<usize> {
        match self.write_strategy {
            WriteStrategy::PrimaryOnly => self.primary.delete_all(ids).await,
            WriteStrategy::All => {
                let primary_result = self.primary.delete_all(ids).await;
                if let Some(fallback) = &self.fallback {
                    if let Err(error) = fallback.delete_all(ids).await {
                        warn!(backend = fallback.name(), %error, "fallback delete failed");
                    }
                }
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.delete_all(ids).await {
                        warn!(backend = cache.name(), %error, "cache delete failed");
                    }
                }
                primary_result
            }
            WriteStrategy::PrimaryAndCache => {
                let primary_result = self.primary.delete_all(ids).await;
                if let Some(cache) = &self.cache {
                    if let Err(error) = cache.delete_all(ids).await {
                        warn!(backend = cache.name(), %error, "cache delete failed");
                    }
                }
                primary_result
            }
        }
    }

    async fn delete_where(&self, query: &Query) -> DepotResult<usize> {
        // Predicate deletes always target the source of truth.
        self.primary.delete_where(query).await
    }

    async fn sync(&self) -> DepotResult<SyncResult> {
        match self.primary.sync().await {
            Ok(result) => Ok(result),
            Err(error) => match &self.fallback {
                Some(fallback) => {
                    warn!(backend = self.primary.name(), %error, "primary sync failed");
                    fallback.sync().await
                }
                None => Err(error),
            },
        }
    }

    async fn get_field(&self, id: &EntityId, field: &str) -> DepotResult<Option<Value>> {
        match self.capable_constituent(|b| b.supports_field_operations()) {
            Some(backend) => backend.get_field(id, field).await,
            None => Err(UnsupportedOperationError::new(&self.name, "get_field").into()),
        }
    }

    async fn get_fields(
        &self,
        id: &EntityId,
        fields: &[String],
    ) -> DepotResult<HashMap<String, Value>> {
        match self.capable_constituent(|b| b.supports_field_operations()) {
            Some(backend) => backend.get_fields(id, fields).await,
            None => Err(UnsupportedOperationError::new(&self.name, "get_fields").into()),
        }
    }

    async fn begin_transaction(&self) -> DepotResult<()> {
        self.primary.begin_transaction().await
    }

    async fn commit_transaction(&self) -> DepotResult<()> {
        self.primary.commit_transaction().await
    }

    async fn rollback_transaction(&self) -> DepotResult<()> {
        self.primary.rollback_transaction().await
    }

    async fn get_all_paged(&self, query: &Query) -> DepotResult<PagedResult<T>> {
        match self.capable_constituent(|b| b.supports_pagination()) {
            Some(backend) => backend.get_all_paged(query).await,
            None => Err(UnsupportedOperationError::new(&self.name, "get_all_paged").into()),
        }
    }

    fn watch_all_paged(&self, query: &Query) -> BoxStream<'static, PagedResult<T>> {
        match self.capable_constituent(|b| b.supports_pagination()) {
            Some(backend) => backend.watch_all_paged(query),
            None => stream::empty().boxed(),
        }
    }

    async fn pending_changes(&self) -> DepotResult<Vec<PendingChange>> {
        let mut changes = self.primary.pending_changes().await?;
        if let Some(fallback) = &self.fallback {
            changes.extend(fallback.pending_changes().await?);
        }
        Ok(changes)
    }

    async fn pending_changes_count(&self) -> DepotResult<usize> {
        let mut count = self.primary.pending_changes_count().await?;
        if let Some(fallback) = &self.fallback {
            count += fallback.pending_changes_count().await?;
        }
        Ok(count)
    }

    fn pending_changes_stream(&self) -> BoxStream<'static, usize> {
        let mut streams = vec![self.primary.pending_changes_stream()];
        if let Some(fallback) = &self.fallback {
            streams.push(fallback.pending_changes_stream());
        }
        stream::select_all(streams).boxed()
    }

    async fn retry_change(&self, change_id: Uuid) -> DepotResult<()> {
        match self.primary.retry_change(change_id).await {
            Ok(()) => Ok(()),
            Err(error) => match &self.fallback {
                Some(fallback) => {
                    debug!(%change_id, %error, "primary retry failed, trying fallback");
                    fallback.retry_change(change_id).await
                }
                None => Err(error),
            },
        }
    }

    async fn cancel_change(&self, change_id: Uuid) -> DepotResult<Option<PendingChange>> {
        match self.primary.cancel_change(change_id).await? {
            Some(cancelled) => Ok(Some(cancelled)),
            None => match &self.fallback {
                Some(fallback) => fallback.cancel_change(change_id).await,
                None => Ok(None),
            },
        }
    }

    fn conflicts_stream(&self) -> BoxStream<'static, Conflict> {
        let mut streams = vec![self.primary.conflicts_stream()];
        if let Some(fallback) = &self.fallback {
            streams.push(fallback.conflicts_stream());
        }
        stream::select_all(streams).boxed()
    }

    async fn health_check(&self) -> DepotResult<bool> {
        for backend in self.constituents() {
            if !backend.health_check().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;
    use depot_core::{BackendError, DepotError};
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        rank: i64,
    }

    impl Entity for Doc {
        fn entity_type() -> &'static str {
            "doc"
        }

        fn id(&self) -> EntityId {
            EntityId::new(self.id.clone())
        }
    }

    fn doc(id: &str) -> Doc {
        Doc {
            id: id.to_string(),
            rank: 0,
        }
    }

    /// Backend that fails every operation.
    struct FailingBackend;

    impl FailingBackend {
        fn error(&self) -> DepotError {
            BackendError::Unavailable {
                backend: "failing".to_string(),
                reason: "down".to_string(),
            }
            .into()
        }
    }

    #[async_trait]
    impl Backend<Doc> for FailingBackend {
        fn name(&self) -> &str {
            "failing"
        }

        async fn get(&self, _id: &EntityId) -> DepotResult<Option<Doc>> {
            Err(self.error())
        }

        async fn get_all(&self, _query: &Query) -> DepotResult<Vec<Doc>> {
            Err(self.error())
        }

        async fn save(&self, _item: &Doc) -> DepotResult<()> {
            Err(self.error())
        }

        async fn delete(&self, _id: &EntityId) -> DepotResult<bool> {
            Err(self.error())
        }

        async fn delete_where(&self, _query: &Query) -> DepotResult<usize> {
            Err(self.error())
        }
    }

    /// Memory backend that counts reads, for cache-hit assertions.
    struct CountingBackend {
        inner: MemoryBackend<Doc>,
        gets: AtomicUsize,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                gets: AtomicUsize::new(0),
            }
        }

        fn get_count(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Backend<Doc> for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        async fn get(&self, id: &EntityId) -> DepotResult<Option<Doc>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(id).await
        }

        async fn get_all(&self, query: &Query) -> DepotResult<Vec<Doc>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get_all(query).await
        }

        async fn save(&self, item: &Doc) -> DepotResult<()> {
            self.inner.save(item).await
        }

        async fn delete(&self, id: &EntityId) -> DepotResult<bool> {
            self.inner.delete(id).await
        }

        async fn delete_where(&self, query: &Query) -> DepotResult<usize> {
            self.inner.delete_where(query).await
        }
    }

    #[tokio::test]
    async fn test_primary_first_falls_back_and_populates_cache() {
        let fallback = Arc::new(MemoryBackend::with_name("fallback"));
        let cache = Arc::new(MemoryBackend::with_name("cache"));
        let item = doc("a");
        fallback.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::new(FailingBackend))
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Backend<Doc>>)
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>);

        let found = composite.get(&item.id()).await.unwrap();
        assert_eq!(found, Some(item.clone()));
        // Fallback success populated the cache constituent.
        assert!(cache.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_primary_first_cache_is_last_resort() {
        let cache = Arc::new(MemoryBackend::with_name("cache"));
        let item = doc("a");
        cache.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::new(FailingBackend))
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>);

        let found = composite.get(&item.id()).await.unwrap();
        assert_eq!(found, Some(item));
    }

    #[tokio::test]
    async fn test_all_constituents_failing_propagates_error() {
        let composite: CompositeBackend<Doc> = CompositeBackend::new(Arc::new(FailingBackend))
            .with_fallback(Arc::new(FailingBackend));

        let err = composite.get(&EntityId::new("a")).await.unwrap_err();
        assert!(matches!(err, DepotError::Backend(_)));
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_primary() {
        let primary = Arc::new(CountingBackend::new());
        let cache = Arc::new(MemoryBackend::with_name("cache"));
        let item = doc("a");
        cache.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>)
            .with_read_strategy(ReadStrategy::CacheFirst);

        let found = composite.get(&item.id()).await.unwrap();
        assert_eq!(found, Some(item));
        assert_eq!(primary.get_count(), 0);
    }

    #[tokio::test]
    async fn test_cache_first_miss_falls_through() {
        let primary = Arc::new(CountingBackend::new());
        let cache = Arc::new(MemoryBackend::with_name("cache"));
        let item = doc("a");
        primary.inner.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>)
            .with_read_strategy(ReadStrategy::CacheFirst);

        let found = composite.get(&item.id()).await.unwrap();
        assert_eq!(found, Some(item.clone()));
        assert_eq!(primary.get_count(), 1);
        assert!(cache.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_fastest_returns_first_success() {
        let fallback = Arc::new(MemoryBackend::with_name("fallback"));
        let item = doc("a");
        fallback.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::new(FailingBackend))
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Backend<Doc>>)
            .with_read_strategy(ReadStrategy::Fastest);

        let found = composite.get(&item.id()).await.unwrap();
        assert_eq!(found, Some(item));
    }

    #[tokio::test]
    async fn test_fastest_all_failing_yields_none() {
        let composite: CompositeBackend<Doc> = CompositeBackend::new(Arc::new(FailingBackend))
            .with_fallback(Arc::new(FailingBackend))
            .with_read_strategy(ReadStrategy::Fastest);

        let found = composite.get(&EntityId::new("a")).await.unwrap();
        assert_eq!(found, None);

        let items = composite.get_all(&Query::new()).await.unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_write_all_reaches_every_constituent() {
        let primary = Arc::new(MemoryBackend::with_name("primary"));
        let fallback = Arc::new(MemoryBackend::with_name("fallback"));
        let cache = Arc::new(MemoryBackend::with_name("cache"));

        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Backend<Doc>>)
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>)
            .with_write_strategy(WriteStrategy::All);

        let item = doc("a");
        composite.save(&item).await.unwrap();

        assert!(primary.contains(&item.id()));
        assert!(fallback.contains(&item.id()));
        assert!(cache.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_write_all_primary_failure_not_masked() {
        let cache = Arc::new(MemoryBackend::with_name("cache"));

        let composite = CompositeBackend::new(Arc::new(FailingBackend))
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>)
            .with_write_strategy(WriteStrategy::All);

        let item = doc("a");
        let err = composite.save(&item).await.unwrap_err();
        assert!(matches!(err, DepotError::Backend(_)));
        // The best-effort cache write still happened.
        assert!(cache.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_primary_and_cache_skips_fallback() {
        let primary = Arc::new(MemoryBackend::with_name("primary"));
        let fallback = Arc::new(MemoryBackend::with_name("fallback"));
        let cache = Arc::new(MemoryBackend::with_name("cache"));

        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Backend<Doc>>)
            .with_cache(Arc::clone(&cache) as Arc<dyn Backend<Doc>>)
            .with_write_strategy(WriteStrategy::PrimaryAndCache);

        let item = doc("a");
        composite.save(&item).await.unwrap();

        assert!(primary.contains(&item.id()));
        assert!(!fallback.contains(&item.id()));
        assert!(cache.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_name_and_capability_flags() {
        let primary = Arc::new(MemoryBackend::<Doc>::with_name("mem"));
        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_fallback(Arc::new(FailingBackend));

        assert_eq!(composite.name(), "CompositeBackend(mem)");
        // Primary OR fallback for realtime/field ops/pagination.
        assert!(composite.supports_realtime());
        assert!(composite.supports_field_operations());
        assert!(composite.supports_pagination());
        // Transactions come from the primary alone.
        assert!(composite.supports_transactions());

        let flipped = CompositeBackend::new(Arc::new(FailingBackend))
            .with_fallback(Arc::clone(&primary) as Arc<dyn Backend<Doc>>);
        assert!(!flipped.supports_transactions());
        assert!(flipped.supports_pagination());
    }

    #[tokio::test]
    async fn test_delete_where_targets_primary_only() {
        let primary = Arc::new(MemoryBackend::with_name("primary"));
        let fallback = Arc::new(MemoryBackend::with_name("fallback"));
        let item = doc("a");
        primary.save(&item).await.unwrap();
        fallback.save(&item).await.unwrap();

        let composite = CompositeBackend::new(Arc::clone(&primary) as Arc<dyn Backend<Doc>>)
            .with_fallback(Arc::clone(&fallback) as Arc<dyn Backend<Doc>>);

        let removed = composite.delete_where(&Query::new()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(primary.is_empty());
        assert!(fallback.contains(&item.id()));
    }

    #[tokio::test]
    async fn test_cancel_change_falls_back_on_none() {
        // Neither constituent holds the change; both answer None.
        let composite: CompositeBackend<Doc> =
            CompositeBackend::new(Arc::new(MemoryBackend::new()))
                .with_fallback(Arc::new(MemoryBackend::new()));

        let cancelled = composite.cancel_change(Uuid::now_v7()).await.unwrap();
        assert_eq!(cancelled, None);
    }
}
