//! Client-side view interceptor
//!
//! Wraps a native database handle so `view` calls that target the sorted-set
//! marker are answered from the sorted-set store, while everything else is
//! delegated to the wrapped handle unchanged.

mod interceptor;

pub use interceptor::SuperCouch;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::sset::SSetError;

/// Parameters of a `view` request, in the native client's shape. Fields the
/// interceptor does not interpret ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<Value>>,
    #[serde(default, alias = "startkey", skip_serializing_if = "Option::is_none")]
    pub start_key: Option<Value>,
    #[serde(default, alias = "endkey", skip_serializing_if = "Option::is_none")]
    pub end_key: Option<Value>,
    #[serde(default)]
    pub descending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    /// Attach scores to sorted-set rows. Defaults true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_scores: Option<bool>,
    /// Compute `total_rows` for sorted-set range queries. Defaults true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_total_rows: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One row of a view response. Sorted-set rows carry the synthetic id
/// `"#SSET"` and the comma-joined key; a keys query against an empty set
/// yields a row with no `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// A view response, shaped like the native client's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResponse {
    pub offset: i64,
    pub total_rows: i64,
    pub rows: Vec<ViewRow>,
}

/// Errors surfaced from `view` calls through the interceptor.
#[derive(Debug, Error)]
pub enum ViewError {
    /// A sorted-set keys query failed against the store.
    #[error("supercouch_error: keys_query_failed: {source}")]
    KeysQueryFailed {
        #[source]
        source: SSetError,
    },

    /// A sorted-set range query failed against the store.
    #[error("supercouch_error: range_query_failed: {source}")]
    RangeQueryFailed {
        #[source]
        source: SSetError,
    },

    /// An error produced by the native handle on the pass-through path.
    #[error("{name} ({status}): {reason}")]
    Native {
        status: u16,
        name: String,
        reason: String,
    },
}

impl ViewError {
    /// HTTP-style status attached to the error.
    pub fn status(&self) -> u16 {
        match self {
            ViewError::KeysQueryFailed { .. } | ViewError::RangeQueryFailed { .. } => 500,
            ViewError::Native { status, .. } => *status,
        }
    }

    /// Error name, `"supercouch_error"` for sorted-set failures.
    pub fn name(&self) -> &str {
        match self {
            ViewError::KeysQueryFailed { .. } | ViewError::RangeQueryFailed { .. } => {
                "supercouch_error"
            }
            ViewError::Native { name, .. } => name,
        }
    }

    /// Error reason, `"keys_query_failed"` or `"range_query_failed"` for
    /// sorted-set failures.
    pub fn reason(&self) -> &str {
        match self {
            ViewError::KeysQueryFailed { .. } => "keys_query_failed",
            ViewError::RangeQueryFailed { .. } => "range_query_failed",
            ViewError::Native { reason, .. } => reason,
        }
    }
}

/// The native database handle's view capability.
#[async_trait]
pub trait CouchView: Send + Sync {
    async fn view(
        &self,
        ddoc: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResponse, ViewError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_params_accepts_both_key_spellings() {
        let with_underscore: ViewParams =
            serde_json::from_value(serde_json::json!({"start_key": [1], "end_key": [2]})).unwrap();
        assert!(with_underscore.start_key.is_some());
        assert!(with_underscore.end_key.is_some());

        let without: ViewParams =
            serde_json::from_value(serde_json::json!({"startkey": [1], "endkey": [2]})).unwrap();
        assert!(without.start_key.is_some());
        assert!(without.end_key.is_some());
    }

    #[test]
    fn test_view_params_keeps_unknown_fields() {
        let params: ViewParams =
            serde_json::from_value(serde_json::json!({"group_level": 2, "stale": "ok"})).unwrap();
        assert_eq!(params.extra.get("group_level"), Some(&serde_json::json!(2)));
        assert_eq!(params.extra.get("stale"), Some(&serde_json::json!("ok")));
    }

    #[test]
    fn test_view_error_surface() {
        let err = ViewError::KeysQueryFailed {
            source: SSetError::Backend("connection reset".to_string()),
        };
        assert_eq!(err.status(), 500);
        assert_eq!(err.name(), "supercouch_error");
        assert_eq!(err.reason(), "keys_query_failed");
        assert!(std::error::Error::source(&err).is_some());
    }
}
