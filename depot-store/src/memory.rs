//! Memory manager.
//!
//! Independent size/pressure tracker over cache entries. It never talks to
//! a backend: the store orchestrator reports entry sizes and access order,
//! and asks for eviction victims when the budget is exceeded. Eviction
//! happens only on explicit calls - there is no background thread.

use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use depot_core::{ConfigError, DepotResult, EntityId};

use crate::watch::Subject;

/// Default byte estimate per entry when no estimator is injected.
pub const DEFAULT_ENTRY_SIZE: usize = 1024;

/// Pure function estimating the in-memory footprint of a cached value.
pub type SizeEstimator = Arc<dyn Fn(&Value) -> usize + Send + Sync>;

/// Estimator charging every entry the same fixed size.
pub fn fixed_size_estimator(bytes: usize) -> SizeEstimator {
    Arc::new(move |_| bytes)
}

/// Order in which unpinned entries are selected for eviction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Least-recently-accessed first.
    #[default]
    Lru,
    /// Oldest-inserted first.
    Fifo,
}

/// Budget and thresholds for the memory manager.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryConfig {
    /// Cache budget in bytes.
    pub max_cache_bytes: usize,
    /// Fraction of the budget at which pressure turns moderate.
    pub moderate_threshold: f64,
    /// Fraction of the budget at which pressure turns critical.
    pub critical_threshold: f64,
    /// Entries removed per eviction batch.
    pub eviction_batch_size: usize,
    /// Victim selection order.
    pub strategy: EvictionStrategy,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 16 * 1024 * 1024,
            moderate_threshold: 0.7,
            critical_threshold: 0.9,
            eviction_batch_size: 16,
            strategy: EvictionStrategy::Lru,
        }
    }
}

impl MemoryConfig {
    /// Create a config with the given budget and default thresholds.
    pub fn new(max_cache_bytes: usize) -> Self {
        Self {
            max_cache_bytes,
            ..Self::default()
        }
    }

    /// Set the moderate pressure threshold.
    pub fn with_moderate_threshold(mut self, threshold: f64) -> Self {
        self.moderate_threshold = threshold;
        self
    }

    /// Set the critical pressure threshold.
    pub fn with_critical_threshold(mut self, threshold: f64) -> Self {
        self.critical_threshold = threshold;
        self
    }

    /// Set the eviction batch size.
    pub fn with_eviction_batch_size(mut self, size: usize) -> Self {
        self.eviction_batch_size = size;
        self
    }

    /// Set the eviction strategy.
    pub fn with_strategy(mut self, strategy: EvictionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validate threshold ordering and batch size.
    pub fn validate(&self) -> DepotResult<()> {
        if self.max_cache_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_cache_bytes".to_string(),
                value: "0".to_string(),
                reason: "budget must be positive".to_string(),
            }
            .into());
        }
        for (field, value) in [
            ("moderate_threshold", self.moderate_threshold),
            ("critical_threshold", self.critical_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    value: value.to_string(),
                    reason: "thresholds are fractions of the budget".to_string(),
                }
                .into());
            }
        }
        if self.moderate_threshold > self.critical_threshold {
            return Err(ConfigError::InvalidValue {
                field: "moderate_threshold".to_string(),
                value: self.moderate_threshold.to_string(),
                reason: "moderate threshold must not exceed the critical threshold".to_string(),
            }
            .into());
        }
        if self.eviction_batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "eviction_batch_size".to_string(),
                value: "0".to_string(),
                reason: "batch size must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Derived counters over the tracked entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryMetrics {
    pub item_count: usize,
    pub current_bytes: usize,
    pub pinned_count: usize,
    pub pinned_bytes: usize,
}

/// Coarse classification of budget fullness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    #[default]
    None,
    Moderate,
    Critical,
}

#[derive(Debug, Clone)]
struct EntryState {
    size_bytes: usize,
    /// Logical access clock; higher means more recently touched.
    last_access: u64,
    /// Logical insertion clock, for FIFO selection.
    inserted_at: u64,
    pinned: bool,
}

#[derive(Default)]
struct Tracked {
    entries: HashMap<EntityId, EntryState>,
    clock: u64,
}

impl Tracked {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn metrics(&self) -> MemoryMetrics {
        let mut metrics = MemoryMetrics::default();
        for entry in self.entries.values() {
            metrics.item_count += 1;
            metrics.current_bytes += entry.size_bytes;
            if entry.pinned {
                metrics.pinned_count += 1;
                metrics.pinned_bytes += entry.size_bytes;
            }
        }
        metrics
    }
}

/// Size-bounded eviction tracker.
///
/// An unconfigured manager is inert: every query returns its default and
/// every mutator is a no-op, so stores without a memory budget pay
/// nothing.
pub struct MemoryManager {
    config: Option<MemoryConfig>,
    estimator: SizeEstimator,
    tracked: Mutex<Tracked>,
    metrics: Subject<MemoryMetrics>,
    pressure: Subject<PressureLevel>,
}

impl MemoryManager {
    /// Create a manager with a budget and the default fixed-size
    /// estimator.
    pub fn new(config: MemoryConfig) -> Self {
        Self::with_estimator(config, fixed_size_estimator(DEFAULT_ENTRY_SIZE))
    }

    /// Create a manager with an injected size estimator.
    pub fn with_estimator(config: MemoryConfig, estimator: SizeEstimator) -> Self {
        Self {
            config: Some(config),
            estimator,
            tracked: Mutex::new(Tracked::default()),
            metrics: Subject::new(MemoryMetrics::default()),
            pressure: Subject::new(PressureLevel::None),
        }
    }

    /// Create an inert manager.
    pub fn unconfigured() -> Self {
        Self {
            config: None,
            estimator: fixed_size_estimator(DEFAULT_ENTRY_SIZE),
            tracked: Mutex::new(Tracked::default()),
            metrics: Subject::new(MemoryMetrics::default()),
            pressure: Subject::new(PressureLevel::None),
        }
    }

    /// Whether a budget is configured.
    pub fn is_configured(&self) -> bool {
        self.config.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Tracked> {
        // Entry state stays consistent even if a holder panicked mid-update;
        // recomputation is total over whatever survived.
        match self.tracked.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, tracked: &Tracked) {
        let metrics = tracked.metrics();
        self.pressure.emit(self.pressure_for(&metrics));
        self.metrics.emit(metrics);
    }

    fn pressure_for(&self, metrics: &MemoryMetrics) -> PressureLevel {
        let Some(config) = &self.config else {
            return PressureLevel::None;
        };
        if config.max_cache_bytes == 0 {
            return PressureLevel::None;
        }
        let ratio = metrics.current_bytes as f64 / config.max_cache_bytes as f64;
        if ratio >= config.critical_threshold {
            PressureLevel::Critical
        } else if ratio >= config.moderate_threshold {
            PressureLevel::Moderate
        } else {
            PressureLevel::None
        }
    }

    // ========================================================================
    // TRACKING
    // ========================================================================

    /// Track (or re-size) an entry. The estimator runs against the
    /// projected value.
    pub fn track(&self, id: &EntityId, value: &Value) {
        if !self.is_configured() {
            return;
        }
        let size_bytes = (self.estimator)(value);
        let mut tracked = self.lock();
        let tick = tracked.tick();
        match tracked.entries.get_mut(id) {
            Some(entry) => {
                entry.size_bytes = size_bytes;
                entry.last_access = tick;
            }
            None => {
                tracked.entries.insert(
                    id.clone(),
                    EntryState {
                        size_bytes,
                        last_access: tick,
                        inserted_at: tick,
                        pinned: false,
                    },
                );
            }
        }
        self.publish(&tracked);
    }

    /// Bump the access clock for an entry. Untracked ids are a no-op.
    pub fn touch(&self, id: &EntityId) {
        if !self.is_configured() {
            return;
        }
        let mut tracked = self.lock();
        let tick = tracked.tick();
        if let Some(entry) = tracked.entries.get_mut(id) {
            entry.last_access = tick;
        }
    }

    /// Stop tracking an entry. Untracked ids are a no-op.
    pub fn forget(&self, id: &EntityId) {
        if !self.is_configured() {
            return;
        }
        let mut tracked = self.lock();
        if tracked.entries.remove(id).is_some() {
            self.publish(&tracked);
        }
    }

    // ========================================================================
    // EVICTION
    // ========================================================================

    /// Select and drop up to `count` unpinned entries in strategy order.
    /// Returns the evicted ids so the owner can drop the cache entries
    /// they describe.
    pub fn evict(&self, count: usize) -> Vec<EntityId> {
        if !self.is_configured() || count == 0 {
            return Vec::new();
        }
        let strategy = self
            .config
            .as_ref()
            .map(|c| c.strategy)
            .unwrap_or_default();

        let mut tracked = self.lock();
        let mut candidates: Vec<(EntityId, u64)> = tracked
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .map(|(id, entry)| {
                let order = match strategy {
                    EvictionStrategy::Lru => entry.last_access,
                    EvictionStrategy::Fifo => entry.inserted_at,
                };
                (id.clone(), order)
            })
            .collect();
        candidates.sort_by_key(|(_, order)| *order);
        candidates.truncate(count);

        let evicted: Vec<EntityId> = candidates.into_iter().map(|(id, _)| id).collect();
        for id in &evicted {
            tracked.entries.remove(id);
        }
        if !evicted.is_empty() {
            self.publish(&tracked);
        }
        evicted
    }

    /// Evict one configured batch. Convenience for inline over-budget
    /// handling on save paths.
    pub fn evict_batch(&self) -> Vec<EntityId> {
        match &self.config {
            Some(config) => self.evict(config.eviction_batch_size),
            None => Vec::new(),
        }
    }

    /// Drop every unpinned entry.
    pub fn evict_unpinned(&self) -> Vec<EntityId> {
        if !self.is_configured() {
            return Vec::new();
        }
        let mut tracked = self.lock();
        let evicted: Vec<EntityId> = tracked
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &evicted {
            tracked.entries.remove(id);
        }
        if !evicted.is_empty() {
            self.publish(&tracked);
        }
        evicted
    }

    // ========================================================================
    // PINNING
    // ========================================================================

    /// Exempt a tracked entry from eviction. Untracked ids are a no-op.
    pub fn pin(&self, id: &EntityId) {
        self.set_pinned(id, true);
    }

    /// Clear the eviction exemption. Untracked ids are a no-op.
    pub fn unpin(&self, id: &EntityId) {
        self.set_pinned(id, false);
    }

    fn set_pinned(&self, id: &EntityId, pinned: bool) {
        if !self.is_configured() {
            return;
        }
        let mut tracked = self.lock();
        if let Some(entry) = tracked.entries.get_mut(id) {
            if entry.pinned != pinned {
                entry.pinned = pinned;
                self.publish(&tracked);
            }
        }
    }

    /// Whether an entry is pinned. Untracked ids answer `false`.
    pub fn is_pinned(&self, id: &EntityId) -> bool {
        self.lock()
            .entries
            .get(id)
            .map(|entry| entry.pinned)
            .unwrap_or(false)
    }

    /// All currently pinned ids.
    pub fn pinned_ids(&self) -> Vec<EntityId> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.pinned)
            .map(|(id, _)| id.clone())
            .collect()
    }

    // ========================================================================
    // METRICS AND PRESSURE
    // ========================================================================

    /// Current derived counters.
    pub fn metrics(&self) -> MemoryMetrics {
        if !self.is_configured() {
            return MemoryMetrics::default();
        }
        self.lock().metrics()
    }

    /// Current pressure level.
    pub fn pressure(&self) -> PressureLevel {
        let metrics = self.metrics();
        self.pressure_for(&metrics)
    }

    /// True once the budget is strictly exceeded.
    pub fn over_budget(&self) -> bool {
        match &self.config {
            Some(config) => self.metrics().current_bytes > config.max_cache_bytes,
            None => false,
        }
    }

    /// Replay-latest stream of metrics. Empty when unconfigured.
    pub fn metrics_stream(&self) -> BoxStream<'static, MemoryMetrics> {
        if !self.is_configured() {
            return stream::empty().boxed();
        }
        self.metrics.subscribe().boxed()
    }

    /// Replay-latest stream of pressure levels. Empty when unconfigured.
    pub fn pressure_stream(&self) -> BoxStream<'static, PressureLevel> {
        if !self.is_configured() {
            return stream::empty().boxed();
        }
        self.pressure.subscribe().boxed()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn id(n: usize) -> EntityId {
        EntityId::new(format!("id-{n}"))
    }

    fn manager_10k() -> MemoryManager {
        MemoryManager::with_estimator(
            MemoryConfig::new(10_240).with_critical_threshold(1.0),
            fixed_size_estimator(1024),
        )
    }

    #[test]
    fn test_budget_exactly_filled_is_critical() {
        let manager = manager_10k();
        for n in 0..10 {
            manager.track(&id(n), &json!({"n": n}));
        }

        let metrics = manager.metrics();
        assert_eq!(metrics.item_count, 10);
        assert_eq!(metrics.current_bytes, 10_240);
        assert_eq!(manager.pressure(), PressureLevel::Critical);
        assert!(!manager.over_budget());
    }

    #[test]
    fn test_evict_removes_lru_entries() {
        let manager = manager_10k();
        for n in 0..10 {
            manager.track(&id(n), &json!({}));
        }
        // id-0 and id-1 become the most recently accessed.
        manager.touch(&id(0));
        manager.touch(&id(1));

        let evicted = manager.evict(2);
        assert_eq!(evicted, vec![id(2), id(3)]);
        assert_eq!(manager.metrics().item_count, 8);
        assert_eq!(manager.metrics().current_bytes, 8 * 1024);
    }

    #[test]
    fn test_pinned_entries_never_evicted() {
        let manager = manager_10k();
        for n in 0..4 {
            manager.track(&id(n), &json!({}));
        }
        manager.pin(&id(0));
        manager.pin(&id(1));

        let evicted = manager.evict(10);
        assert_eq!(evicted, vec![id(2), id(3)]);
        assert!(manager.is_pinned(&id(0)));

        let metrics = manager.metrics();
        assert_eq!(metrics.item_count, 2);
        assert_eq!(metrics.pinned_count, 2);
        assert_eq!(metrics.pinned_bytes, 2 * 1024);
    }

    #[test]
    fn test_fifo_strategy_ignores_access_order() {
        let manager = MemoryManager::with_estimator(
            MemoryConfig::new(10_240).with_strategy(EvictionStrategy::Fifo),
            fixed_size_estimator(1024),
        );
        for n in 0..3 {
            manager.track(&id(n), &json!({}));
        }
        manager.touch(&id(0));

        let evicted = manager.evict(1);
        assert_eq!(evicted, vec![id(0)]);
    }

    #[test]
    fn test_evict_unpinned_clears_everything_else() {
        let manager = manager_10k();
        for n in 0..5 {
            manager.track(&id(n), &json!({}));
        }
        manager.pin(&id(4));

        let mut evicted = manager.evict_unpinned();
        evicted.sort();
        assert_eq!(evicted.len(), 4);
        assert_eq!(manager.metrics().item_count, 1);
        assert_eq!(manager.pinned_ids(), vec![id(4)]);
    }

    #[test]
    fn test_retrack_updates_size_in_place() {
        let estimator: SizeEstimator = Arc::new(|value| {
            value
                .get("size")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_ENTRY_SIZE as u64) as usize
        });
        let manager = MemoryManager::with_estimator(MemoryConfig::new(10_240), estimator);

        manager.track(&id(0), &json!({"size": 100}));
        assert_eq!(manager.metrics().current_bytes, 100);

        manager.track(&id(0), &json!({"size": 500}));
        let metrics = manager.metrics();
        assert_eq!(metrics.item_count, 1);
        assert_eq!(metrics.current_bytes, 500);
    }

    #[test]
    fn test_pressure_thresholds() {
        let manager = MemoryManager::with_estimator(
            MemoryConfig::new(10_240)
                .with_moderate_threshold(0.5)
                .with_critical_threshold(0.9),
            fixed_size_estimator(1024),
        );

        for n in 0..4 {
            manager.track(&id(n), &json!({}));
        }
        assert_eq!(manager.pressure(), PressureLevel::None);

        manager.track(&id(4), &json!({}));
        assert_eq!(manager.pressure(), PressureLevel::Moderate);

        for n in 5..10 {
            manager.track(&id(n), &json!({}));
        }
        assert_eq!(manager.pressure(), PressureLevel::Critical);
    }

    #[test]
    fn test_unconfigured_manager_is_inert() {
        let manager = MemoryManager::unconfigured();
        manager.track(&id(0), &json!({}));
        manager.pin(&id(0));

        assert_eq!(manager.metrics(), MemoryMetrics::default());
        assert_eq!(manager.pressure(), PressureLevel::None);
        assert!(!manager.is_pinned(&id(0)));
        assert!(manager.pinned_ids().is_empty());
        assert!(manager.evict(10).is_empty());
        assert!(!manager.over_budget());
    }

    #[tokio::test]
    async fn test_unconfigured_streams_are_empty() {
        let manager = MemoryManager::unconfigured();
        assert_eq!(manager.metrics_stream().next().await, None);
        assert_eq!(manager.pressure_stream().next().await, None);
    }

    #[tokio::test]
    async fn test_pressure_stream_replays_latest() {
        let manager = manager_10k();
        for n in 0..10 {
            manager.track(&id(n), &json!({}));
        }

        let mut stream = manager.pressure_stream();
        assert_eq!(stream.next().await, Some(PressureLevel::Critical));
    }

    #[test]
    fn test_config_validation() {
        assert!(MemoryConfig::new(10_240).validate().is_ok());
        assert!(MemoryConfig::new(0).validate().is_err());
        assert!(MemoryConfig::new(1024)
            .with_moderate_threshold(1.5)
            .validate()
            .is_err());
        assert!(MemoryConfig::new(1024)
            .with_moderate_threshold(0.9)
            .with_critical_threshold(0.5)
            .validate()
            .is_err());
        assert!(MemoryConfig::new(1024)
            .with_eviction_batch_size(0)
            .validate()
            .is_err());
    }

    #[cfg(test)]
    mod prop_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            /// Eviction never removes more than requested, never touches
            /// pinned entries, and metrics stay consistent.
            #[test]
            fn prop_evict_bounds(
                total in 1usize..24,
                pinned in 0usize..8,
                request in 0usize..32
            ) {
                let manager = MemoryManager::with_estimator(
                    MemoryConfig::new(1 << 20),
                    fixed_size_estimator(64),
                );
                for n in 0..total {
                    manager.track(&id(n), &serde_json::json!({}));
                }
                let pinned = pinned.min(total);
                for n in 0..pinned {
                    manager.pin(&id(n));
                }

                let evicted = manager.evict(request);
                let unpinned = total - pinned;
                prop_assert!(evicted.len() <= request.min(unpinned));
                for victim in &evicted {
                    for n in 0..pinned {
                        prop_assert_ne!(victim, &id(n));
                    }
                }

                let metrics = manager.metrics();
                prop_assert_eq!(metrics.item_count, total - evicted.len());
                prop_assert_eq!(metrics.current_bytes, metrics.item_count * 64);
            }
        }
    }
}
