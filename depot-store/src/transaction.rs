//! Deferred-apply transactions.
//!
//! A transaction body queues saves and deletes on a handle; nothing
//! reaches the backend until the body completes. Backends that support
//! real transactions get begin/commit/rollback around the apply phase;
//! everyone else gets an optimistic in-order apply. The whole thing runs
//! under a wall-clock timeout - on expiry the body is abandoned, rollback
//! is attempted where supported, and no partial application is ever
//! reported as success.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::warn;

use depot_core::{DepotResult, Entity, EntityId, TransactionError};

use crate::store::Store;

pub(crate) enum TxOp<T> {
    Save(T),
    Delete(EntityId),
}

/// Handle a transaction body queues operations on.
///
/// Operations are applied in issue order after the body completes; the
/// body itself observes none of its own writes.
pub struct TransactionHandle<T> {
    ops: Arc<Mutex<Vec<TxOp<T>>>>,
}

impl<T> Clone for TransactionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            ops: Arc::clone(&self.ops),
        }
    }
}

impl<T: Entity> TransactionHandle<T> {
    pub(crate) fn new() -> Self {
        Self {
            ops: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a save.
    pub fn save(&self, item: T) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(TxOp::Save(item));
        }
    }

    /// Queue a delete.
    pub fn delete(&self, id: EntityId) {
        if let Ok(mut ops) = self.ops.lock() {
            ops.push(TxOp::Delete(id));
        }
    }

    /// Number of queued operations.
    pub fn queued(&self) -> usize {
        self.ops.lock().map(|ops| ops.len()).unwrap_or(0)
    }

    fn take_ops(&self) -> Vec<TxOp<T>> {
        self.ops
            .lock()
            .map(|mut ops| std::mem::take(&mut *ops))
            .unwrap_or_default()
    }
}

impl<T: Entity> Store<T> {
    /// Run a transaction body against a deferred-apply handle.
    ///
    /// The configured `transaction_timeout` covers the body plus the apply
    /// phase. On timeout the queued work is abandoned, a rollback is
    /// attempted when the backend supports transactions, and the call
    /// fails with [`TransactionError::Timeout`].
    pub async fn transaction<F, Fut, R>(&self, body: F) -> DepotResult<R>
    where
        F: FnOnce(TransactionHandle<T>) -> Fut,
        Fut: Future<Output = DepotResult<R>>,
    {
        self.ensure_ready()?;
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(TransactionError::Nested.into());
        }
        let result = self.transaction_inner(body).await;
        self.in_transaction.store(false, Ordering::SeqCst);
        result
    }

    async fn transaction_inner<F, Fut, R>(&self, body: F) -> DepotResult<R>
    where
        F: FnOnce(TransactionHandle<T>) -> Fut,
        Fut: Future<Output = DepotResult<R>>,
    {
        let handle = TransactionHandle::new();
        let timeout = self.config.transaction_timeout;
        let transactional = self.backend.supports_transactions();

        let run = async {
            let out = body(handle.clone()).await?;
            let ops = handle.take_ops();
            if transactional {
                self.backend.begin_transaction().await?;
                match self.apply_backend_ops(&ops).await {
                    Ok(()) => self.backend.commit_transaction().await?,
                    Err(error) => {
                        if let Err(rollback_error) = self.backend.rollback_transaction().await {
                            warn!(%rollback_error, "rollback after failed apply also failed");
                        }
                        return Err(TransactionError::BackendFailed {
                            reason: error.to_string(),
                        }
                        .into());
                    }
                }
                // Cache state only moves once the backend committed.
                self.apply_cache_ops(&ops)?;
            } else {
                // Optimistic apply: each op hits backend then cache, in
                // issue order; the first failure aborts the remainder.
                for op in &ops {
                    match op {
                        TxOp::Save(item) => {
                            self.backend.save(item).await?;
                            self.apply_update(item, None, true)?;
                        }
                        TxOp::Delete(id) => {
                            self.backend.delete(id).await?;
                            self.remove_entry(id)?;
                        }
                    }
                }
            }
            Ok(out)
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_elapsed) => {
                if transactional {
                    // Best effort: the backend may not even have an open
                    // transaction yet.
                    let _ = self.backend.rollback_transaction().await;
                }
                Err(TransactionError::Timeout { timeout }.into())
            }
        }
    }

    async fn apply_backend_ops(&self, ops: &[TxOp<T>]) -> DepotResult<()> {
        for op in ops {
            match op {
                TxOp::Save(item) => self.backend.save(item).await?,
                TxOp::Delete(id) => {
                    self.backend.delete(id).await?;
                }
            }
        }
        Ok(())
    }

    fn apply_cache_ops(&self, ops: &[TxOp<T>]) -> DepotResult<()> {
        for op in ops {
            match op {
                TxOp::Save(item) => self.apply_update(item, None, true)?,
                TxOp::Delete(id) => self.remove_entry(id)?,
            }
        }
        Ok(())
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
    use crate::store::{FetchPolicy, StoreConfig};
    use async_trait::async_trait;
    use depot_core::{DepotError, Query};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

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

    fn doc(id: &str, rank: i64) -> Doc {
        Doc {
            id: id.to_string(),
            rank,
        }
    }

    async fn transactional_store() -> (crate::store::Store<Doc>, Arc<MemoryBackend<Doc>>) {
        let backend = Arc::new(MemoryBackend::new());
        let store = Store::new(Arc::clone(&backend) as Arc<dyn Backend<Doc>>).with_config(
            StoreConfig::new().with_transaction_timeout(Duration::from_millis(200)),
        );
        store.initialize().await.unwrap();
        (store, backend)
    }

    #[tokio::test]
    async fn test_commit_applies_queued_ops_in_order() {
        let (store, backend) = transactional_store().await;
        backend.save(&doc("stale", 0)).await.unwrap();

        let count = store
            .transaction(|tx| async move {
                tx.save(doc("a", 1));
                tx.save(doc("b", 2));
                tx.delete(EntityId::new("stale"));
                Ok(tx.queued())
            })
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert!(backend.contains(&EntityId::new("a")));
        assert!(backend.contains(&EntityId::new("b")));
        assert!(!backend.contains(&EntityId::new("stale")));

        // Committed values are cached.
        assert_eq!(
            store
                .get_with(&EntityId::new("a"), FetchPolicy::CacheOnly)
                .await
                .unwrap(),
            Some(doc("a", 1))
        );
    }

    #[tokio::test]
    async fn test_body_error_rolls_back_without_applying() {
        let (store, backend) = transactional_store().await;

        let result: DepotResult<()> = store
            .transaction(|tx| async move {
                tx.save(doc("a", 1));
                Err(TransactionError::BackendFailed {
                    reason: "body bailed".to_string(),
                }
                .into())
            })
            .await;

        assert!(result.is_err());
        assert!(backend.is_empty());
        assert_eq!(
            store
                .get_with(&EntityId::new("a"), FetchPolicy::CacheOnly)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_timeout_yields_transaction_error_and_no_backend_change() {
        let (store, backend) = transactional_store().await;
        backend.save(&doc("existing", 1)).await.unwrap();

        let result: DepotResult<()> = store
            .transaction(|tx| async move {
                tx.save(doc("never", 1));
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;

        match result.unwrap_err() {
            DepotError::Transaction(TransactionError::Timeout { timeout }) => {
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        // The queued save never reached the backend.
        assert_eq!(backend.len(), 1);
        assert!(backend.contains(&EntityId::new("existing")));
    }

    #[tokio::test]
    async fn test_nested_transactions_rejected() {
        let (store, _backend) = transactional_store().await;

        let store = Arc::new(store);
        let inner_store = Arc::clone(&store);
        let result: DepotResult<()> = store
            .transaction(|_tx| async move {
                inner_store
                    .transaction(|_inner| async move { Ok(()) })
                    .await
            })
            .await;

        assert_eq!(
            result.unwrap_err(),
            DepotError::Transaction(TransactionError::Nested)
        );
    }

    #[tokio::test]
    async fn test_optimistic_apply_without_backend_transactions() {
        struct Plain {
            inner: MemoryBackend<Doc>,
        }

        #[async_trait]
        impl Backend<Doc> for Plain {
            fn name(&self) -> &str {
                "plain"
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
        }

        let backend = Arc::new(Plain {
            inner: MemoryBackend::new(),
        });
        let store = Store::new(Arc::clone(&backend) as Arc<dyn Backend<Doc>>);
        store.initialize().await.unwrap();

        store
            .transaction(|tx| async move {
                tx.save(doc("a", 1));
                tx.save(doc("b", 2));
                Ok(())
            })
            .await
            .unwrap();

        assert!(backend.inner.contains(&EntityId::new("a")));
        assert!(backend.inner.contains(&EntityId::new("b")));
    }
}
