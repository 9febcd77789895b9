//! In-memory sorted-set store
//!
//! A process-local realization of [`SSetStore`]. It keeps the exact contract
//! of the Redis realization (encoded-value identity, score-then-bytes
//! ordering, batch validation before any write) and backs the test suites,
//! where it stands in for a live backend.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::types::{Keep, Order, Paging, RangeOptions, RangeResponse, RangeRow, SSetOp};

use super::{keys::sset_key, validate_ops, SSetError, SSetStore};

#[derive(Debug, Clone)]
struct Entry {
    score: f64,
    member: String,
}

/// Sorted-set store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    sets: RwLock<HashMap<String, Vec<Entry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently held for one sorted set.
    pub fn cardinality(&self, database: &str, id_path: &[String]) -> usize {
        let key = sset_key(database, id_path);
        self.sets.read().get(&key).map_or(0, |e| e.len())
    }
}

/// Apply one write to a set, preserving the ascending `(score, member)`
/// order. Scores only ever grow for an existing member; `LAST_VALUE` trims
/// everything below the top-ranked entry.
fn apply(entries: &mut Vec<Entry>, score: f64, member: String, keep: Keep) {
    match entries.iter_mut().find(|e| e.member == member) {
        Some(existing) => {
            if score > existing.score {
                existing.score = score;
            }
        }
        None => entries.push(Entry { score, member }),
    }
    entries.sort_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then_with(|| a.member.cmp(&b.member))
    });
    if keep == Keep::LastValue && entries.len() > 1 {
        let keep_from = entries.len() - 1;
        entries.drain(..keep_from);
    }
}

fn rows_from(entries: &[Entry], opts: &RangeOptions) -> Result<Vec<RangeRow>, SSetError> {
    entries
        .iter()
        .map(|e| {
            Ok(RangeRow {
                value: serde_json::from_str::<Value>(&e.member)?,
                score: opts.include_scores.then_some(e.score),
            })
        })
        .collect()
}

/// Offset/count slice of an ordered match set.
fn page(entries: Vec<Entry>, opts: &RangeOptions) -> Vec<Entry> {
    if !opts.paged() {
        return entries;
    }
    let offset = opts.offset.unwrap_or(0) as usize;
    let count = opts.count.map(|c| c as usize).unwrap_or(usize::MAX);
    entries.into_iter().skip(offset).take(count).collect()
}

fn paging_for(opts: &RangeOptions, total: i64) -> Paging {
    let (offset, count) = if opts.paged() {
        (
            opts.offset.unwrap_or(0) as i64,
            opts.count.map(|c| c as i64).unwrap_or(-1),
        )
    } else {
        (0, -1)
    };
    Paging::new(offset, count, total)
}

#[async_trait]
impl SSetStore for MemoryStore {
    async fn process(&self, ops: Vec<SSetOp>) -> Result<(), SSetError> {
        validate_ops(&ops)?;
        let mut sets = self.sets.write();
        for op in ops {
            let key = sset_key(&op.database, &op.id_path);
            let member = serde_json::to_string(&op.value)?;
            let entries = sets.entry(key).or_default();
            apply(entries, op.score, member, op.keep);
        }
        Ok(())
    }

    async fn range_by_index(
        &self,
        database: &str,
        id_path: &[String],
        min: i64,
        max: i64,
        opts: &RangeOptions,
    ) -> Result<RangeResponse, SSetError> {
        let key = sset_key(database, id_path);
        let sets = self.sets.read();
        let mut ordered: Vec<Entry> = sets.get(&key).cloned().unwrap_or_default();
        if opts.order == Order::Desc {
            ordered.reverse();
        }

        let len = ordered.len() as i64;
        let resolve = |i: i64| if i < 0 { len + i } else { i };
        let lo = resolve(min).max(0);
        let hi = resolve(max).min(len - 1);

        let matched: Vec<Entry> = if len == 0 || lo > hi {
            Vec::new()
        } else {
            ordered[lo as usize..=hi as usize].to_vec()
        };

        let total = if opts.include_total {
            matched.len() as i64
        } else {
            -1
        };
        let rows = rows_from(&page(matched, opts), opts)?;
        Ok(RangeResponse {
            paging: paging_for(opts, total),
            rows,
        })
    }

    async fn range_by_score(
        &self,
        database: &str,
        id_path: &[String],
        min: f64,
        max: f64,
        opts: &RangeOptions,
    ) -> Result<RangeResponse, SSetError> {
        let key = sset_key(database, id_path);
        let sets = self.sets.read();
        let mut matched: Vec<Entry> = sets
            .get(&key)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.score >= min && e.score <= max)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if opts.order == Order::Desc {
            matched.reverse();
        }

        let total = if opts.include_total {
            matched.len() as i64
        } else {
            -1
        };
        let rows = rows_from(&page(matched, opts), opts)?;
        Ok(RangeResponse {
            paging: paging_for(opts, total),
            rows,
        })
    }
}
