//! Query spec for reads, invalidation predicates and watch filters.
//!
//! The store orchestrator treats queries as opaque and passes them through
//! to the backend unmodified. This module also ships the reference
//! evaluator used by in-process backends and local cache evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use crate::cursor::Cursor;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
}

/// A single predicate on a named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against (JSON value for flexibility)
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create an inequality filter.
    pub fn ne(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Ne, value)
    }

    /// Create a greater-than filter.
    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    /// Create a less-than filter.
    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    /// Create a greater-or-equal filter.
    pub fn gte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gte, value)
    }

    /// Create a less-or-equal filter.
    pub fn lte(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lte, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Create an in-list filter.
    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    /// Evaluate this predicate against a projected field map.
    pub fn matches(&self, fields: &serde_json::Map<String, Value>) -> bool {
        let actual = fields.get(&self.field).unwrap_or(&Value::Null);
        match self.operator {
            FilterOperator::Eq => actual == &self.value,
            FilterOperator::Ne => actual != &self.value,
            FilterOperator::Gt => {
                matches!(compare_values(actual, &self.value), Some(Ordering::Greater))
            }
            FilterOperator::Lt => {
                matches!(compare_values(actual, &self.value), Some(Ordering::Less))
            }
            FilterOperator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater) | Some(Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less) | Some(Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
                (Value::Array(items), needle) => items.contains(needle),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(candidates) => candidates.contains(actual),
                _ => false,
            },
        }
    }
}

/// Sort direction for a named field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Ordering on a named field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub direction: SortDirection,
}

impl SortSpec {
    /// Ascending sort on a field.
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Ascending,
        }
    }

    /// Descending sort on a field.
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Descending,
        }
    }
}

/// Direction of a cursor window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageDirection {
    #[default]
    Forward,
    Backward,
}

/// Filter/sort/window spec for collection reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Conjunction of field predicates.
    pub filters: Vec<FilterExpr>,
    /// Ordering, applied in sequence.
    pub sort: Vec<SortSpec>,
    /// Maximum number of items to return.
    pub limit: Option<usize>,
    /// Opaque resume position produced by a previous page.
    pub cursor: Option<Cursor>,
    /// Window direction relative to the cursor.
    pub direction: PageDirection,
}

impl Query {
    /// Create an empty query matching everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter predicate.
    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add a sort spec.
    pub fn order_by(mut self, sort: SortSpec) -> Self {
        self.sort.push(sort);
        self
    }

    /// Set the window limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the resume cursor.
    pub fn with_cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
        self
    }

    /// Flip the window to run backward from the cursor.
    pub fn backward(mut self) -> Self {
        self.direction = PageDirection::Backward;
        self
    }

    /// Evaluate all predicates against a projected field map.
    pub fn matches(&self, fields: &serde_json::Map<String, Value>) -> bool {
        self.filters.iter().all(|f| f.matches(fields))
    }

    /// Compare two projected field maps per the sort specs.
    ///
    /// Incomparable values (type mismatches, missing fields on both sides)
    /// compare equal so sorting stays stable.
    pub fn compare(
        &self,
        a: &serde_json::Map<String, Value>,
        b: &serde_json::Map<String, Value>,
    ) -> Ordering {
        for spec in &self.sort {
            let left = a.get(&spec.field).unwrap_or(&Value::Null);
            let right = b.get(&spec.field).unwrap_or(&Value::Null);
            let ordering = compare_values(left, right).unwrap_or(Ordering::Equal);
            let ordering = match spec.direction {
                SortDirection::Ascending => ordering,
                SortDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Canonical key for this query, used to index query-result caches.
    pub fn key(&self) -> String {
        serde_json::to_value(self)
            .unwrap_or(Value::Null)
            .to_string()
    }
}

/// Compare two JSON scalars. Numbers compare numerically, strings
/// lexicographically, bools false-before-true. Mixed types and nulls are
/// incomparable.
fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64().partial_cmp(&y.as_f64()),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
