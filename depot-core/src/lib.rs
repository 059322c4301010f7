//! Depot Core - Entity Contract and Value Types
//!
//! Pure data types with no I/O. All other crates depend on this.
//! This crate contains the entity contract, the error taxonomy, the query
//! spec and the pagination value types - no backend logic.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;

pub mod cursor;
pub mod error;
pub mod page;
pub mod query;

pub use cursor::Cursor;
pub use error::{
    BackendError, ConfigError, DepotError, DepotResult, InvalidCursorError, StateError,
    TransactionError, UnsupportedOperationError,
};
pub use page::{PageInfo, PagedResult};
pub use query::{FilterExpr, FilterOperator, PageDirection, Query, SortDirection, SortSpec};

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Opaque identifier for an entity.
///
/// Backends decide what ids look like (UUIDs, server-assigned keys,
/// composite paths); the data layer only requires equality and ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Create an id from anything string-like.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

// ============================================================================
// ENTITY CONTRACT
// ============================================================================

/// Marker trait for types that can live in a Depot store.
///
/// # Implementation Requirements
///
/// - `entity_type()` must return a consistent value for all instances
/// - `id()` must return the unique identifier for this instance
/// - Implementations must be `Clone`, `Serialize`, and `DeserializeOwned`
///   so backends can move them across process and storage boundaries
/// - Implementations must be `Send + Sync + 'static` for async compatibility
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name of this entity type, used for audit records and
    /// backend namespacing.
    fn entity_type() -> &'static str;

    /// Get the unique identifier for this instance.
    fn id(&self) -> EntityId;

    /// Project the entity into a field map for query evaluation and
    /// field-level reads.
    ///
    /// The default projection serializes through `serde_json`; entities that
    /// do not serialize to a JSON object project to an empty map.
    fn to_fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        id: String,
        title: String,
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

    #[test]
    fn test_entity_id_display_roundtrip() {
        let id = EntityId::new("doc-1");
        assert_eq!(id.as_str(), "doc-1");
        assert_eq!(id.to_string(), "doc-1");
        assert_eq!(EntityId::from("doc-1"), id);
    }

    #[test]
    fn test_entity_projection() {
        let doc = Doc {
            id: "doc-1".to_string(),
            title: "hello".to_string(),
            rank: 3,
        };
        let fields = doc.to_fields();
        assert_eq!(fields.get("title"), Some(&serde_json::json!("hello")));
        assert_eq!(fields.get("rank"), Some(&serde_json::json!(3)));
    }
}
