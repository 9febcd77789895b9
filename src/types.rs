//! Core types shared across the engine, the sorted-set service and the
//! view interceptor.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Marker placed as the first element of an emitted key (or query key) to
/// divert it into the sorted-set index instead of the regular view index.
pub const SSET_MARKER: &str = "$SSET";

/// Row id used for every view row synthesized from the sorted-set index.
pub const SSET_ROW_ID: &str = "#SSET";

/// Retention discipline for a sorted-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Keep {
    /// One entry per distinct encoded value; a value's score only ever grows.
    #[serde(rename = "ALL_VALUES")]
    AllValues,
    /// At most one entry total: the value submitted with the largest score.
    #[serde(rename = "LAST_VALUE")]
    LastValue,
}

impl Keep {
    /// Parse the wire spelling of a retention discipline.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALL_VALUES" => Some(Keep::AllValues),
            "LAST_VALUE" => Some(Keep::LastValue),
            _ => None,
        }
    }
}

impl fmt::Display for Keep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keep::AllValues => f.write_str("ALL_VALUES"),
            Keep::LastValue => f.write_str("LAST_VALUE"),
        }
    }
}

/// A single sorted-set write intent collected from a map emission.
///
/// Operations are batched per document; all operations sharing a `database`
/// commit in one transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SSetOp {
    /// Namespace grouping sorted sets; also the cluster hash-tag anchor.
    pub database: String,
    /// Ordered segments identifying one sorted set within the database.
    pub id_path: Vec<String>,
    /// Finite 64-bit float ordering coordinate.
    pub score: f64,
    /// Arbitrary JSON payload, stored by its exact encoding.
    pub value: Value,
    /// Retention discipline.
    pub keep: Keep,
}

/// Row ordering for range queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// Options shared by both range query flavors.
///
/// The `min`/`max` bounds are passed separately to the store methods since
/// their type differs between index mode (ranks) and score mode (floats).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeOptions {
    /// Skip this many rows from the start of the matching range.
    pub offset: Option<u64>,
    /// Return at most this many rows.
    pub count: Option<u64>,
    /// Row ordering; paging applies after ordering.
    pub order: Order,
    /// Compute the total number of matching entries (extra backend call).
    pub include_total: bool,
    /// Attach each row's score to the response.
    pub include_scores: bool,
}

impl RangeOptions {
    /// True when either paging field was supplied.
    pub fn paged(&self) -> bool {
        self.offset.is_some() || self.count.is_some()
    }
}

/// Paging block of a range response. `-1` marks fields that were not
/// requested or not computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    pub offset: i64,
    pub count: i64,
    pub total: i64,
}

impl Paging {
    pub fn new(offset: i64, count: i64, total: i64) -> Self {
        Self {
            offset,
            count,
            total,
        }
    }
}

/// One entry of a range response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeRow {
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Result of a range query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeResponse {
    pub paging: Paging,
    pub rows: Vec<RangeRow>,
}
