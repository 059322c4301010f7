//! Audit collaborator interface.
//!
//! The store emits one record per qualifying operation to an attached
//! sink. Persistence, hash chaining and the query surface of the sink are
//! someone else's problem; this module only defines the call.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use depot_core::{EntityId, Timestamp};

/// Operation category of an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuditAction {
    Get,
    GetAll,
    Save,
    Delete,
}

/// One audited store operation.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditRecord {
    pub action: AuditAction,
    pub entity_type: String,
    /// Absent for collection-level operations.
    pub entity_id: Option<EntityId>,
    /// Fields touched, for field-level reads.
    pub fields: Option<Vec<String>>,
    pub previous_values: Option<Value>,
    pub new_values: Option<Value>,
    pub success: bool,
    pub metadata: Option<Value>,
    pub occurred_at: Timestamp,
}

impl AuditRecord {
    /// Create a successful record with the required parts; optional parts
    /// start empty.
    pub fn new(action: AuditAction, entity_type: impl Into<String>) -> Self {
        Self {
            action,
            entity_type: entity_type.into(),
            entity_id: None,
            fields: None,
            previous_values: None,
            new_values: None,
            success: true,
            metadata: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_entity_id(mut self, id: EntityId) -> Self {
        self.entity_id = Some(id);
        self
    }

    pub fn with_new_values(mut self, values: Value) -> Self {
        self.new_values = Some(values);
        self
    }

    pub fn with_previous_values(mut self, values: Value) -> Self {
        self.previous_values = Some(values);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }
}

/// Collaborator receiving audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, record: AuditRecord);
}
