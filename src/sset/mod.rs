//! Sorted-set service
//!
//! The abstract contract of the external index and its realizations. The
//! engine and the view interceptor only ever talk to [`SSetStore`]; key
//! shaping, transactions and cluster routing stay behind it.

mod cluster;
mod keys;
mod memory;
mod redis;

pub use cluster::ClusterUrl;
pub use keys::sset_key;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{RangeOptions, RangeResponse, SSetOp};

/// Errors surfaced by a sorted-set store.
#[derive(Debug, Error)]
pub enum SSetError {
    /// An operation carried an empty id path; the whole batch is rejected.
    #[error("operation for database '{0}' has an empty id path")]
    EmptyIdPath(String),

    /// A stored member was not valid JSON.
    #[error("failed to decode stored value: {0}")]
    Decode(#[from] serde_json::Error),

    /// Backend transaction, connection or cluster failure.
    #[error("backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for SSetError {
    fn from(err: ::redis::RedisError) -> Self {
        SSetError::Backend(err.to_string())
    }
}

/// Capability contract of the sorted-set index.
///
/// `process` writes a batch atomically per database group; the two range
/// methods read back slices of one sorted set. Implementations do not retry;
/// callers decide what a failure means.
#[async_trait]
pub trait SSetStore: Send + Sync {
    /// Write a batch of operations. Operations sharing a `database` execute
    /// in one transaction; distinct databases commit in parallel. Any
    /// failure fails the whole call and no group is partially applied.
    async fn process(&self, ops: Vec<SSetOp>) -> Result<(), SSetError>;

    /// Fetch entries by inclusive rank indices. Negative indices count from
    /// the end, `-1` being the highest-ranked element.
    async fn range_by_index(
        &self,
        database: &str,
        id_path: &[String],
        min: i64,
        max: i64,
        opts: &RangeOptions,
    ) -> Result<RangeResponse, SSetError>;

    /// Fetch entries by inclusive score bounds.
    async fn range_by_score(
        &self,
        database: &str,
        id_path: &[String],
        min: f64,
        max: f64,
        opts: &RangeOptions,
    ) -> Result<RangeResponse, SSetError>;
}

/// Reject a batch up front if any operation is malformed.
///
/// Validation runs before any write so a bad operation cannot leave a
/// partially applied group behind.
pub(crate) fn validate_ops(ops: &[SSetOp]) -> Result<(), SSetError> {
    for op in ops {
        if op.id_path.is_empty() {
            return Err(SSetError::EmptyIdPath(op.database.clone()));
        }
    }
    Ok(())
}
