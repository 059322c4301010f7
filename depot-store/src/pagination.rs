//! Streaming pagination controller.
//!
//! Drives bounded incremental loads through the store orchestrator and
//! assembles a UI-facing state machine. State is a tagged sum type with
//! exhaustive match helpers; the state stream is a replay-latest subject.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use depot_core::{ConfigError, DepotError, DepotResult, Entity, PageInfo, Query};

use crate::store::Store;
use crate::watch::Subject;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Controller tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct PagerConfig {
    /// Items requested per load.
    pub page_size: usize,
    /// `on_item_visible` auto-loads when the index is within this distance
    /// of the loaded end; zero disables prefetching.
    pub prefetch_distance: usize,
    /// Pages kept before the oldest is dropped from the front; zero keeps
    /// everything.
    pub max_pages_in_memory: usize,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            prefetch_distance: 0,
            max_pages_in_memory: 0,
        }
    }
}

impl PagerConfig {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    pub fn with_max_pages_in_memory(mut self, pages: usize) -> Self {
        self.max_pages_in_memory = pages;
        self
    }

    /// Validate the page size.
    pub fn validate(&self) -> DepotResult<()> {
        if self.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page_size".to_string(),
                value: "0".to_string(),
                reason: "page size must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// STATE
// ============================================================================

/// Pagination state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum PaginationState<T> {
    /// Nothing loaded yet.
    Initial,
    /// A refresh is running; previously loaded items are still shown.
    Loading { previous: Vec<T> },
    /// A load-more is running; loaded items stay visible.
    LoadingMore { items: Vec<T>, page_info: PageInfo },
    /// Loaded and idle.
    Data { items: Vec<T>, page_info: PageInfo },
    /// The last load failed; loaded items survive for display and retry.
    Error {
        error: DepotError,
        previous: Vec<T>,
        page_info: Option<PageInfo>,
    },
}

impl<T> PaginationState<T> {
    /// Items currently displayable, whatever the phase.
    pub fn items(&self) -> &[T] {
        match self {
            Self::Initial => &[],
            Self::Loading { previous } => previous,
            Self::LoadingMore { items, .. } => items,
            Self::Data { items, .. } => items,
            Self::Error { previous, .. } => previous,
        }
    }

    /// Page metadata, when a page has been loaded.
    pub fn page_info(&self) -> Option<&PageInfo> {
        match self {
            Self::Initial | Self::Loading { .. } => None,
            Self::LoadingMore { page_info, .. } => Some(page_info),
            Self::Data { page_info, .. } => Some(page_info),
            Self::Error { page_info, .. } => page_info.as_ref(),
        }
    }

    /// Whether another page exists after the loaded ones.
    pub fn has_more(&self) -> bool {
        self.page_info().is_some_and(|info| info.has_next_page)
    }

    pub fn is_initial(&self) -> bool {
        matches!(self, Self::Initial)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }

    pub fn is_loading_more(&self) -> bool {
        matches!(self, Self::LoadingMore { .. })
    }

    pub fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAction {
    Refresh,
    LoadMore,
}

// ============================================================================
// CONTROLLER
// ============================================================================

/// Bounded incremental loader over one query.
///
/// Cooperative by design: methods take `&mut self`, state transitions and
/// their stream emissions happen synchronously relative to the call that
/// caused them.
pub struct PagedQueryController<T: Entity> {
    store: Arc<Store<T>>,
    query: Query,
    config: PagerConfig,
    subject: Option<Subject<PaginationState<T>>>,
    current: PaginationState<T>,
    /// Lengths of loaded pages, oldest first, for front eviction.
    page_lens: VecDeque<usize>,
    in_flight: bool,
    disposed: bool,
    last_action: Option<LastAction>,
}

impl<T: Entity> PagedQueryController<T> {
    /// Create a controller over a store and a base query. The query's own
    /// cursor and limit are ignored; the controller windows every load
    /// itself.
    pub fn new(store: Arc<Store<T>>, query: Query, config: PagerConfig) -> Self {
        Self {
            store,
            query,
            config,
            subject: Some(Subject::new(PaginationState::Initial)),
            current: PaginationState::Initial,
            page_lens: VecDeque::new(),
            in_flight: false,
            disposed: false,
            last_action: None,
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> PaginationState<T> {
        self.current.clone()
    }

    /// Replay-latest stream of states. Terminates on `dispose`.
    pub fn state_stream(&self) -> Option<WatchStream<PaginationState<T>>> {
        self.subject.as_ref().map(|subject| subject.subscribe())
    }

    /// Whether another page exists after the loaded ones.
    pub fn has_more(&self) -> bool {
        self.current.has_more()
    }

    fn set_state(&mut self, state: PaginationState<T>) {
        self.current = state.clone();
        if let Some(subject) = &self.subject {
            subject.emit(state);
        }
    }

    fn page_query(&self, cursor: Option<depot_core::Cursor>) -> Query {
        let mut query = self.query.clone().with_limit(self.config.page_size);
        query.cursor = cursor;
        query
    }

    /// Discard all cursor state and re-apply the query from scratch.
    pub async fn refresh(&mut self) {
        if self.disposed || self.in_flight {
            return;
        }
        self.in_flight = true;
        self.last_action = Some(LastAction::Refresh);

        let previous = self.current.items().to_vec();
        self.set_state(PaginationState::Loading {
            previous: previous.clone(),
        });

        let query = self.page_query(None);
        match self.store.get_all_paged(&query).await {
            Ok(page) => {
                let (items, page_info) = page.into_parts();
                self.page_lens.clear();
                self.page_lens.push_back(items.len());
                self.set_state(PaginationState::Data { items, page_info });
            }
            Err(error) => {
                self.set_state(PaginationState::Error {
                    error,
                    previous,
                    page_info: None,
                });
            }
        }
        self.in_flight = false;
    }

    /// Load the next page. A no-op unless idle in `Data` with more pages
    /// available.
    pub async fn load_more(&mut self) {
        if self.disposed || self.in_flight {
            return;
        }
        let (items, page_info) = match &self.current {
            PaginationState::Data { items, page_info } if page_info.has_next_page => {
                (items.clone(), page_info.clone())
            }
            _ => return,
        };
        self.in_flight = true;
        self.last_action = Some(LastAction::LoadMore);

        self.set_state(PaginationState::LoadingMore {
            items: items.clone(),
            page_info: page_info.clone(),
        });

        let query = self.page_query(page_info.end_cursor.clone());
        match self.store.get_all_paged(&query).await {
            Ok(page) => {
                let (new_items, new_info) = page.into_parts();
                let mut all = items;
                self.page_lens.push_back(new_items.len());
                all.extend(new_items);

                if self.config.max_pages_in_memory > 0 {
                    while self.page_lens.len() > self.config.max_pages_in_memory {
                        let dropped = self.page_lens.pop_front().unwrap_or(0);
                        all.drain(..dropped.min(all.len()));
                        debug!(dropped, "evicted oldest loaded page");
                    }
                }

                self.set_state(PaginationState::Data {
                    items: all,
                    page_info: new_info,
                });
            }
            Err(error) => {
                // Loaded items survive the failure.
                self.set_state(PaginationState::Error {
                    error,
                    previous: items,
                    page_info: Some(page_info),
                });
            }
        }
        self.in_flight = false;
    }

    /// Re-issue the last action after a failure. A no-op outside the
    /// error state.
    pub async fn retry(&mut self) {
        if self.disposed || self.in_flight {
            return;
        }
        let (previous, page_info) = match &self.current {
            PaginationState::Error {
                previous,
                page_info,
                ..
            } => (previous.clone(), page_info.clone()),
            _ => return,
        };
        match self.last_action {
            Some(LastAction::LoadMore) => {
                // Restore the pre-failure data state, then re-issue.
                if let Some(page_info) = page_info {
                    self.set_state(PaginationState::Data {
                        items: previous,
                        page_info,
                    });
                    self.load_more().await;
                } else {
                    self.refresh().await;
                }
            }
            Some(LastAction::Refresh) | None => self.refresh().await,
        }
    }

    /// Report that an item at `index` became visible; auto-loads the next
    /// page when within the prefetch distance of the loaded end.
    pub async fn on_item_visible(&mut self, index: usize) {
        if self.disposed || self.in_flight || self.config.prefetch_distance == 0 {
            return;
        }
        if !self.current.is_data() || !self.current.has_more() {
            return;
        }
        let loaded = self.current.items().len();
        if index + self.config.prefetch_distance >= loaded {
            self.load_more().await;
        }
    }

    /// Terminate the state stream and turn every further call into a
    /// no-op. Idempotent.
    pub fn dispose(&mut self) {
        self.disposed = true;
        self.subject = None;
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::memory_backend::MemoryBackend;
    use async_trait::async_trait;
    use depot_core::{DepotResult, EntityId, PagedResult, SortSpec};
    use futures_util::StreamExt;
    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

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

    /// Pagination-capable backend with injectable page failures.
    struct FlakyPager {
        inner: MemoryBackend<Doc>,
        fail_pages: AtomicBool,
    }

    impl FlakyPager {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_pages: AtomicBool::new(false),
            }
        }

        fn set_fail_pages(&self, fail: bool) {
            self.fail_pages.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Backend<Doc> for FlakyPager {
        fn name(&self) -> &str {
            "flaky"
        }

        fn supports_pagination(&self) -> bool {
            true
        }

        async fn get(&self, id: &EntityId) -> DepotResult<Option<Doc>> {
            self.inner.get(id).await
        }

        async fn get_all(&self, query: &Query) -> DepotResult<Vec<Doc>> {
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

        async fn get_field(&self, id: &EntityId, field: &str) -> DepotResult<Option<Value>> {
            self.inner.get_field(id, field).await
        }

        async fn get_fields(
            &self,
            id: &EntityId,
            fields: &[String],
        ) -> DepotResult<HashMap<String, Value>> {
            self.inner.get_fields(id, fields).await
        }

        async fn get_all_paged(&self, query: &Query) -> DepotResult<PagedResult<Doc>> {
            if self.fail_pages.load(Ordering::SeqCst) {
                return Err(depot_core::BackendError::ReadFailed {
                    backend: "flaky".to_string(),
                    reason: "injected".to_string(),
                }
                .into());
            }
            self.inner.get_all_paged(query).await
        }
    }

    async fn controller_over(
        total: usize,
        config: PagerConfig,
    ) -> (PagedQueryController<Doc>, Arc<FlakyPager>) {
        let backend = Arc::new(FlakyPager::new());
        for n in 0..total {
            backend
                .inner
                .save(&Doc {
                    id: format!("{n:03}"),
                    rank: n as i64,
                })
                .await
                .unwrap();
        }
        let store = Arc::new(Store::new(
            Arc::clone(&backend) as Arc<dyn Backend<Doc>>
        ));
        store.initialize().await.unwrap();

        let query = Query::new().order_by(SortSpec::asc("rank"));
        (PagedQueryController::new(store, query, config), backend)
    }

    fn ranks(state: &PaginationState<Doc>) -> Vec<i64> {
        state.items().iter().map(|d| d.rank).collect()
    }

    #[tokio::test]
    async fn test_refresh_loads_first_page() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        assert!(pager.state().is_initial());

        pager.refresh().await;
        let state = pager.state();
        assert!(state.is_data());
        assert_eq!(state.items().len(), 10);
        assert!(state.has_more());
        assert!(state.page_info().unwrap().end_cursor.is_some());
    }

    #[tokio::test]
    async fn test_load_more_accumulates_to_exhaustion() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;

        pager.load_more().await;
        assert_eq!(pager.state().items().len(), 20);
        assert!(pager.has_more());

        pager.load_more().await;
        let state = pager.state();
        assert_eq!(state.items().len(), 25);
        assert!(!state.has_more());
        assert_eq!(ranks(&state), (0..25).collect::<Vec<i64>>());

        // Exhausted: further calls are no-ops.
        pager.load_more().await;
        assert_eq!(pager.state().items().len(), 25);
    }

    #[tokio::test]
    async fn test_on_item_visible_prefetches_within_distance() {
        let (mut pager, _) =
            controller_over(25, PagerConfig::new(10).with_prefetch_distance(3)).await;
        pager.refresh().await;

        pager.on_item_visible(5).await;
        assert_eq!(pager.state().items().len(), 10);

        pager.on_item_visible(7).await;
        assert_eq!(pager.state().items().len(), 20);
    }

    #[tokio::test]
    async fn test_prefetch_distance_zero_disables_auto_load() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;

        pager.on_item_visible(9).await;
        assert_eq!(pager.state().items().len(), 10);
    }

    #[tokio::test]
    async fn test_refresh_failure_preserves_previous_items() {
        let (mut pager, backend) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;

        backend.set_fail_pages(true);
        pager.refresh().await;
        let state = pager.state();
        assert!(state.is_error());
        assert_eq!(state.items().len(), 10);
    }

    #[tokio::test]
    async fn test_retry_reissues_refresh_and_restores_order() {
        let (mut pager, backend) = controller_over(25, PagerConfig::new(10)).await;
        backend.set_fail_pages(true);
        pager.refresh().await;
        assert!(pager.state().is_error());

        backend.set_fail_pages(false);
        pager.retry().await;
        let state = pager.state();
        assert!(state.is_data());
        assert_eq!(ranks(&state), (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_retry_reissues_load_more_preserving_items() {
        let (mut pager, backend) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;

        backend.set_fail_pages(true);
        pager.load_more().await;
        let state = pager.state();
        assert!(state.is_error());
        assert_eq!(state.items().len(), 10);

        backend.set_fail_pages(false);
        pager.retry().await;
        let state = pager.state();
        assert!(state.is_data());
        assert_eq!(ranks(&state), (0..20).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_retry_is_noop_outside_error_state() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;
        let before = pager.state();

        pager.retry().await;
        assert_eq!(pager.state(), before);
    }

    #[tokio::test]
    async fn test_max_pages_in_memory_drops_oldest_page() {
        let (mut pager, _) =
            controller_over(25, PagerConfig::new(10).with_max_pages_in_memory(2)).await;
        pager.refresh().await;
        pager.load_more().await;
        pager.load_more().await;

        let state = pager.state();
        // Pages two and three survive; page one was evicted from the front.
        assert_eq!(state.items().len(), 15);
        assert_eq!(ranks(&state), (10..25).collect::<Vec<i64>>());
        assert!(!state.has_more());
    }

    #[tokio::test]
    async fn test_refresh_discards_cursor_state() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;
        pager.load_more().await;
        assert_eq!(pager.state().items().len(), 20);

        pager.refresh().await;
        let state = pager.state();
        assert_eq!(state.items().len(), 10);
        assert_eq!(ranks(&state), (0..10).collect::<Vec<i64>>());
        assert!(state.has_more());
    }

    #[tokio::test]
    async fn test_state_stream_replays_latest() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;

        let mut stream = pager.state_stream().unwrap();
        let state = stream.next().await.unwrap();
        assert!(state.is_data());
        assert_eq!(state.items().len(), 10);
    }

    #[tokio::test]
    async fn test_dispose_terminates_stream_and_noops() {
        let (mut pager, _) = controller_over(25, PagerConfig::new(10)).await;
        pager.refresh().await;
        let mut stream = pager.state_stream().unwrap();
        assert!(stream.next().await.is_some());

        pager.dispose();
        pager.dispose(); // idempotent
        assert_eq!(stream.next().await, None);
        assert!(pager.state_stream().is_none());

        pager.refresh().await;
        pager.load_more().await;
        assert_eq!(pager.state().items().len(), 10);
    }

    #[test]
    fn test_pager_config_validation() {
        assert!(PagerConfig::new(10).validate().is_ok());
        assert!(PagerConfig::new(0).validate().is_err());
    }
}
