//! Backend capability trait.
//!
//! The sole contract the store orchestrator and the composite backend are
//! written against. Concrete backends (network, local store, in-memory)
//! implement the required members and override only the optional members
//! they actually support, advertising them through capability flags. The
//! default implementations of optional members fail with
//! [`UnsupportedOperationError`], so no runtime type inspection is ever
//! needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use depot_core::{
    DepotResult, Entity, EntityId, PagedResult, Query, UnsupportedOperationError,
};

/// Stream of change events for watch members.
pub type EventStream<T> = BoxStream<'static, WatchEvent<T>>;

/// A change observed on a backend.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// An entity was created or updated.
    Updated(T),
    /// An entity was removed.
    Removed(EntityId),
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    /// Changes successfully pushed.
    pub synced: usize,
    /// Changes that failed and stay queued.
    pub failed: usize,
    /// Wall-clock time the pass took.
    pub duration: Duration,
}

/// Kind of a queued offline mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Save,
    Delete,
}

/// A mutation queued by an offline-capable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChange {
    /// Backend-assigned identifier for this queued change.
    pub change_id: Uuid,
    /// Entity the change applies to.
    pub entity_id: EntityId,
    /// What the change does.
    pub op: ChangeOp,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Last delivery error, if any attempt failed.
    pub last_error: Option<String>,
    /// When the change was queued.
    pub queued_at: DateTime<Utc>,
}

impl PendingChange {
    /// Create a freshly queued change.
    pub fn new(entity_id: EntityId, op: ChangeOp) -> Self {
        Self {
            change_id: Uuid::now_v7(),
            entity_id,
            op,
            attempts: 0,
            last_error: None,
            queued_at: Utc::now(),
        }
    }
}

/// A divergence between local and remote state detected during sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub entity_id: EntityId,
    pub local: Value,
    pub remote: Value,
    pub detected_at: DateTime<Utc>,
}

fn unsupported<O>(backend: &str, operation: &str) -> DepotResult<O> {
    Err(UnsupportedOperationError::new(backend, operation).into())
}

/// Contract every physical backend implements.
///
/// Required members cover plain CRUD, queries and sync. Optional members
/// are gated by the capability flags; a backend that leaves a flag `false`
/// inherits the failing default for the corresponding members.
#[async_trait]
pub trait Backend<T: Entity>: Send + Sync {
    /// Human-readable backend name, used in errors and logs.
    fn name(&self) -> &str;

    // ========================================================================
    // CAPABILITY FLAGS
    // ========================================================================

    /// Queues mutations while unreachable and exposes the pending-change
    /// surface.
    fn supports_offline(&self) -> bool {
        false
    }

    /// Emits live change events through `watch`/`watch_all`.
    fn supports_realtime(&self) -> bool {
        false
    }

    /// Implements `begin`/`commit`/`rollback`.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Implements field-level reads.
    fn supports_field_operations(&self) -> bool {
        false
    }

    /// Implements cursor pagination.
    fn supports_pagination(&self) -> bool {
        false
    }

    // ========================================================================
    // REQUIRED MEMBERS
    // ========================================================================

    /// Get an entity by id. Absence is `Ok(None)`, not an error.
    async fn get(&self, id: &EntityId) -> DepotResult<Option<T>>;

    /// Get all entities matching a query.
    async fn get_all(&self, query: &Query) -> DepotResult<Vec<T>>;

    /// Live change events for one entity. Backends without realtime
    /// support return an empty stream.
    fn watch(&self, _id: &EntityId) -> EventStream<T> {
        stream::empty().boxed()
    }

    /// Live change events for a query. Backends without realtime support
    /// return an empty stream.
    fn watch_all(&self, _query: &Query) -> EventStream<T> {
        stream::empty().boxed()
    }

    /// Save (upsert) an entity.
    async fn save(&self, item: &T) -> DepotResult<()>;

    /// Save a batch, in order.
    async fn save_all(&self, items: &[T]) -> DepotResult<()> {
        for item in items {
            self.save(item).await?;
        }
        Ok(())
    }

    /// Delete by id; returns whether the entity existed.
    async fn delete(&self, id: &EntityId) -> DepotResult<bool>;

    /// Delete a batch; returns how many existed.
    async fn delete_all(&self, ids: &[EntityId]) -> DepotResult<usize> {
        let mut deleted = 0;
        for id in ids {
            if self.delete(id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Delete everything matching a query; returns how many were removed.
    async fn delete_where(&self, query: &Query) -> DepotResult<usize>;

    /// Push queued changes / refresh local state. A no-op for backends
    /// without an offline queue.
    async fn sync(&self) -> DepotResult<SyncResult> {
        Ok(SyncResult::default())
    }

    // ========================================================================
    // FIELD OPERATIONS (supports_field_operations)
    // ========================================================================

    /// Read one field of an entity without materializing the whole value.
    async fn get_field(&self, _id: &EntityId, _field: &str) -> DepotResult<Option<Value>> {
        unsupported(self.name(), "get_field")
    }

    /// Read several fields at once.
    async fn get_fields(
        &self,
        _id: &EntityId,
        _fields: &[String],
    ) -> DepotResult<HashMap<String, Value>> {
        unsupported(self.name(), "get_fields")
    }

    // ========================================================================
    // TRANSACTIONS (supports_transactions)
    // ========================================================================

    async fn begin_transaction(&self) -> DepotResult<()> {
        unsupported(self.name(), "begin_transaction")
    }

    async fn commit_transaction(&self) -> DepotResult<()> {
        unsupported(self.name(), "commit_transaction")
    }

    async fn rollback_transaction(&self) -> DepotResult<()> {
        unsupported(self.name(), "rollback_transaction")
    }

    // ========================================================================
    // PAGINATION (supports_pagination)
    // ========================================================================

    /// Get one page of entities matching a query window.
    async fn get_all_paged(&self, _query: &Query) -> DepotResult<PagedResult<T>> {
        unsupported(self.name(), "get_all_paged")
    }

    /// Live page snapshots for a query window. Backends without support
    /// return an empty stream.
    fn watch_all_paged(&self, _query: &Query) -> BoxStream<'static, PagedResult<T>> {
        stream::empty().boxed()
    }

    // ========================================================================
    // OFFLINE SYNC (supports_offline)
    // ========================================================================

    /// Mutations still queued for delivery.
    async fn pending_changes(&self) -> DepotResult<Vec<PendingChange>> {
        Ok(Vec::new())
    }

    /// Number of mutations still queued for delivery.
    async fn pending_changes_count(&self) -> DepotResult<usize> {
        Ok(0)
    }

    /// Live count of queued mutations.
    fn pending_changes_stream(&self) -> BoxStream<'static, usize> {
        stream::empty().boxed()
    }

    /// Resubmit one queued change.
    async fn retry_change(&self, _change_id: Uuid) -> DepotResult<()> {
        unsupported(self.name(), "retry_change")
    }

    /// Cancel one queued change. Returns the cancelled change, or `None`
    /// when the backend refuses (for example because delivery is already
    /// in flight).
    async fn cancel_change(&self, _change_id: Uuid) -> DepotResult<Option<PendingChange>> {
        Ok(None)
    }

    /// Conflicts detected during sync.
    fn conflicts_stream(&self) -> BoxStream<'static, Conflict> {
        stream::empty().boxed()
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Whether the backend is reachable and serving.
    async fn health_check(&self) -> DepotResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use depot_core::DepotError;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
    }

    impl Entity for Doc {
        fn entity_type() -> &'static str {
            "doc"
        }

        fn id(&self) -> EntityId {
            EntityId::new(self.id.clone())
        }
    }

    /// Minimal backend that only implements the required members.
    struct Bare;

    #[async_trait]
    impl Backend<Doc> for Bare {
        fn name(&self) -> &str {
            "bare"
        }

        async fn get(&self, _id: &EntityId) -> DepotResult<Option<Doc>> {
            Ok(None)
        }

        async fn get_all(&self, _query: &Query) -> DepotResult<Vec<Doc>> {
            Ok(Vec::new())
        }

        async fn save(&self, _item: &Doc) -> DepotResult<()> {
            Ok(())
        }

        async fn delete(&self, _id: &EntityId) -> DepotResult<bool> {
            Ok(false)
        }

        async fn delete_where(&self, _query: &Query) -> DepotResult<usize> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_capability_flags_default_false() {
        let backend = Bare;
        assert!(!backend.supports_offline());
        assert!(!backend.supports_realtime());
        assert!(!backend.supports_transactions());
        assert!(!backend.supports_field_operations());
        assert!(!backend.supports_pagination());
    }

    #[tokio::test]
    async fn test_optional_members_fail_with_unsupported() {
        let backend = Bare;
        let id = EntityId::new("d1");

        let err = backend.get_field(&id, "title").await.unwrap_err();
        assert!(matches!(err, DepotError::Unsupported(ref u) if u.operation == "get_field"));

        let err = backend.begin_transaction().await.unwrap_err();
        assert!(matches!(err, DepotError::Unsupported(_)));

        let err = backend.get_all_paged(&Query::new()).await.unwrap_err();
        assert!(matches!(err, DepotError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_offline_defaults_are_empty_not_errors() {
        let backend = Bare;
        assert_eq!(backend.pending_changes_count().await.unwrap(), 0);
        assert!(backend.pending_changes().await.unwrap().is_empty());
        assert_eq!(backend.cancel_change(Uuid::now_v7()).await.unwrap(), None);
        assert!(backend.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_defaults_delegate_to_single_ops() {
        let backend = Bare;
        backend
            .save_all(&[Doc { id: "a".into() }, Doc { id: "b".into() }])
            .await
            .unwrap();
        let deleted = backend
            .delete_all(&[EntityId::new("a"), EntityId::new("b")])
            .await
            .unwrap();
        assert_eq!(deleted, 0);
    }
}
