//! In-memory backend.
//!
//! The reference implementation of the backend capability trait: a
//! `HashMap` behind a lock plus a broadcast channel for realtime events.
//! It serves as the cache constituent of a composite backend and as the
//! backend of choice in tests.

use async_trait::async_trait;
use futures_util::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use depot_core::{
    Cursor, DepotResult, Entity, EntityId, PageDirection, PageInfo, PagedResult, Query,
    StateError, TransactionError,
};

use crate::backend::{Backend, EventStream, SyncResult, WatchEvent};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// In-memory backend over a `HashMap`.
///
/// Supports realtime watches, snapshot transactions, field reads and
/// offset-cursor pagination. It has no offline queue: every mutation is
/// applied immediately, so `supports_offline` stays `false`.
pub struct MemoryBackend<T: Entity> {
    name: String,
    items: Arc<RwLock<HashMap<EntityId, T>>>,
    snapshot: Arc<Mutex<Option<HashMap<EntityId, T>>>>,
    events: broadcast::Sender<WatchEvent<T>>,
}

impl<T: Entity> MemoryBackend<T> {
    /// Create a backend named `memory`.
    pub fn new() -> Self {
        Self::with_name("memory")
    }

    /// Create a backend with an explicit name.
    pub fn with_name(name: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            name: name.into(),
            items: Arc::new(RwLock::new(HashMap::new())),
            snapshot: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.items.read().map(|m| m.len()).unwrap_or(0)
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entity is present.
    pub fn contains(&self, id: &EntityId) -> bool {
        self.items.read().map(|m| m.contains_key(id)).unwrap_or(false)
    }

    /// Drop all stored entities without emitting events.
    pub fn clear(&self) {
        if let Ok(mut items) = self.items.write() {
            items.clear();
        }
    }

    fn emit(&self, event: WatchEvent<T>) {
        // No receivers is fine; events are best-effort notifications.
        let _ = self.events.send(event);
    }

    /// Filter, sort and window per the query. Returns the window, the
    /// total match count and the window start offset.
    fn run_query(&self, query: &Query) -> DepotResult<(Vec<T>, usize, usize)> {
        let items = self.items.read().map_err(|_| StateError::LockPoisoned)?;
        let mut matched: Vec<T> = items
            .values()
            .filter(|item| query.matches(&item.to_fields()))
            .cloned()
            .collect();
        drop(items);

        if query.sort.is_empty() {
            // Deterministic order keeps offset cursors stable.
            matched.sort_by(|a, b| a.id().cmp(&b.id()));
        } else {
            matched.sort_by(|a, b| query.compare(&a.to_fields(), &b.to_fields()));
        }

        let total = matched.len();
        let offset = query
            .cursor
            .as_ref()
            .and_then(|c| c.get("offset"))
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        let (start, end) = match query.direction {
            PageDirection::Forward => {
                let start = offset.unwrap_or(0).min(total);
                let end = match query.limit {
                    Some(limit) => (start + limit).min(total),
                    None => total,
                };
                (start, end)
            }
            PageDirection::Backward => {
                let end = offset.unwrap_or(total).min(total);
                let start = match query.limit {
                    Some(limit) => end.saturating_sub(limit),
                    None => 0,
                };
                (start, end)
            }
        };

        let window: Vec<T> = matched.drain(start..end).collect();
        Ok((window, total, start))
    }
}

impl<T: Entity> Default for MemoryBackend<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Entity> Backend<T> for MemoryBackend<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports_realtime(&self) -> bool {
        true
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn supports_field_operations(&self) -> bool {
        true
    }

    fn supports_pagination(&self) -> bool {
        true
    }

    async fn get(&self, id: &EntityId) -> DepotResult<Option<T>> {
        let items = self.items.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(items.get(id).cloned())
    }

    async fn get_all(&self, query: &Query) -> DepotResult<Vec<T>> {
        let (window, _, _) = self.run_query(query)?;
        Ok(window)
    }

    fn watch(&self, id: &EntityId) -> EventStream<T> {
        let id = id.clone();
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |event| {
                let id = id.clone();
                async move {
                    match event {
                        Ok(WatchEvent::Updated(item)) if item.id() == id => {
                            Some(WatchEvent::Updated(item))
                        }
                        Ok(WatchEvent::Removed(removed)) if removed == id => {
                            Some(WatchEvent::Removed(removed))
                        }
                        _ => None,
                    }
                }
            })
            .boxed()
    }

    fn watch_all(&self, query: &Query) -> EventStream<T> {
        let query = query.clone();
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |event| {
                let query = query.clone();
                async move {
                    match event {
                        Ok(WatchEvent::Updated(item)) if query.matches(&item.to_fields()) => {
                            Some(WatchEvent::Updated(item))
                        }
                        // Removals pass through; subscribers drop ids they
                        // never held.
                        Ok(WatchEvent::Removed(id)) => Some(WatchEvent::Removed(id)),
                        _ => None,
                    }
                }
            })
            .boxed()
    }

    async fn save(&self, item: &T) -> DepotResult<()> {
        {
            let mut items = self.items.write().map_err(|_| StateError::LockPoisoned)?;
            items.insert(item.id(), item.clone());
        }
        self.emit(WatchEvent::Updated(item.clone()));
        Ok(())
    }

    async fn delete(&self, id: &EntityId) -> DepotResult<bool> {
        let existed = {
            let mut items = self.items.write().map_err(|_| StateError::LockPoisoned)?;
            items.remove(id).is_some()
        };
        if existed {
            self.emit(WatchEvent::Removed(id.clone()));
        }
        Ok(existed)
    }

    async fn delete_where(&self, query: &Query) -> DepotResult<usize> {
        let removed: Vec<EntityId> = {
            let mut items = self.items.write().map_err(|_| StateError::LockPoisoned)?;
            let ids: Vec<EntityId> = items
                .values()
                .filter(|item| query.matches(&item.to_fields()))
                .map(|item| item.id())
                .collect();
            for id in &ids {
                items.remove(id);
            }
            ids
        };
        for id in &removed {
            self.emit(WatchEvent::Removed(id.clone()));
        }
        Ok(removed.len())
    }

    async fn sync(&self) -> DepotResult<SyncResult> {
        Ok(SyncResult::default())
    }

    async fn get_field(&self, id: &EntityId, field: &str) -> DepotResult<Option<Value>> {
        let items = self.items.read().map_err(|_| StateError::LockPoisoned)?;
        Ok(items
            .get(id)
            .and_then(|item| item.to_fields().get(field).cloned()))
    }

    async fn get_fields(
        &self,
        id: &EntityId,
        fields: &[String],
    ) -> DepotResult<HashMap<String, Value>> {
        let items = self.items.read().map_err(|_| StateError::LockPoisoned)?;
        let mut out = HashMap::new();
        if let Some(item) = items.get(id) {
            let projected = item.to_fields();
            for field in fields {
                if let Some(value) = projected.get(field) {
                    out.insert(field.clone(), value.clone());
                }
            }
        }
        Ok(out)
    }

    async fn begin_transaction(&self) -> DepotResult<()> {
        let mut snapshot = self.snapshot.lock().map_err(|_| StateError::LockPoisoned)?;
        if snapshot.is_some() {
            return Err(TransactionError::Nested.into());
        }
        let items = self.items.read().map_err(|_| StateError::LockPoisoned)?;
        *snapshot = Some(items.clone());
        Ok(())
    }

    async fn commit_transaction(&self) -> DepotResult<()> {
        let mut snapshot = self.snapshot.lock().map_err(|_| StateError::LockPoisoned)?;
        if snapshot.take().is_none() {
            return Err(TransactionError::BackendFailed {
                reason: "no transaction in progress".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn rollback_transaction(&self) -> DepotResult<()> {
        let mut snapshot = self.snapshot.lock().map_err(|_| StateError::LockPoisoned)?;
        let Some(previous) = snapshot.take() else {
            return Err(TransactionError::BackendFailed {
                reason: "no transaction in progress".to_string(),
            }
            .into());
        };
        let mut items = self.items.write().map_err(|_| StateError::LockPoisoned)?;
        *items = previous;
        Ok(())
    }

    async fn get_all_paged(&self, query: &Query) -> DepotResult<PagedResult<T>> {
        let (window, total, start) = self.run_query(query)?;
        let end = start + window.len();

        let page_info = PageInfo {
            has_next_page: end < total,
            has_previous_page: start > 0,
            start_cursor: (!window.is_empty())
                .then(|| Cursor::new().with("offset", Value::from(start as u64))),
            end_cursor: (!window.is_empty())
                .then(|| Cursor::new().with("offset", Value::from(end as u64))),
            total_count: Some(total as u64),
        };
        Ok(PagedResult::new(window, page_info))
    }

    fn watch_all_paged(&self, query: &Query) -> BoxStream<'static, PagedResult<T>> {
        let query = query.clone();
        let items = Arc::clone(&self.items);
        BroadcastStream::new(self.events.subscribe())
            .filter_map(move |event| {
                let query = query.clone();
                let items = Arc::clone(&items);
                async move {
                    event.ok()?;
                    let snapshot: Vec<T> = items.read().ok()?.values().cloned().collect();
                    let mut matched: Vec<T> = snapshot
                        .into_iter()
                        .filter(|item| query.matches(&item.to_fields()))
                        .collect();
                    if query.sort.is_empty() {
                        matched.sort_by(|a, b| a.id().cmp(&b.id()));
                    } else {
                        matched.sort_by(|a, b| query.compare(&a.to_fields(), &b.to_fields()));
                    }
                    let total = matched.len();
                    if let Some(limit) = query.limit {
                        matched.truncate(limit);
                    }
                    let end = matched.len();
                    let page_info = PageInfo {
                        has_next_page: end < total,
                        has_previous_page: false,
                        start_cursor: None,
                        end_cursor: (!matched.is_empty())
                            .then(|| Cursor::new().with("offset", Value::from(end as u64))),
                        total_count: Some(total as u64),
                    };
                    Some(PagedResult::new(matched, page_info))
                }
            })
            .boxed()
    }
}

// ============================================================================
// TESTS
// ============================================================================
