//! Depot Store - Offline-First Data Layer
//!
//! A unified read/write API over pluggable storage backends, with
//! staleness tracking, tag-based invalidation, size-bounded caching,
//! cursor pagination and lazy per-field loading.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Store Orchestrator                   │
//! │   fetch/write policies · transactions · lazy fields   │
//! ├───────────────┬───────────────────┬──────────────────┤
//! │  Entity Cache │   Memory Manager  │ Pagination Engine │
//! ├───────────────┴───────────────────┴──────────────────┤
//! │                 Backend (capability trait)            │
//! │        often a CompositeBackend fanning out to        │
//! │          remote / local / in-memory constituents      │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! Durability is entirely delegated to configured backends; this crate
//! persists nothing itself.

pub mod audit;
pub mod backend;
pub mod composite;
pub mod memory;
pub mod memory_backend;
pub mod pagination;
pub mod store;
pub mod transaction;

mod watch;

pub use audit::{AuditAction, AuditRecord, AuditSink};
pub use backend::{
    Backend, ChangeOp, Conflict, EventStream, PendingChange, SyncResult, WatchEvent,
};
pub use composite::{CompositeBackend, ReadStrategy, WriteStrategy};
pub use memory::{
    fixed_size_estimator, EvictionStrategy, MemoryConfig, MemoryManager, MemoryMetrics,
    PressureLevel, SizeEstimator, DEFAULT_ENTRY_SIZE,
};
pub use memory_backend::MemoryBackend;
pub use pagination::{PagedQueryController, PagerConfig, PaginationState};
pub use store::{
    FetchPolicy, InvalidationScope, LazyFieldConfig, Store, StoreConfig, StoreStats, SyncStatus,
    WritePolicy,
};
pub use transaction::TransactionHandle;

// Re-export core types for convenience
pub use depot_core::{
    BackendError, ConfigError, Cursor, DepotError, DepotResult, Entity, EntityId, FilterExpr,
    FilterOperator, InvalidCursorError, PageDirection, PageInfo, PagedResult, Query, SortDirection,
    SortSpec, StateError, Timestamp, TransactionError, UnsupportedOperationError,
};
