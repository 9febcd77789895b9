//! Request classification and rewriting
//!
//! A `view` call is answered from the sorted-set store when its keys (or
//! both range bounds) carry the sorted-set marker; everything else is
//! delegated verbatim to the wrapped native handle.

use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::Value;
use tracing::debug;

use crate::sset::SSetStore;
use crate::types::{Order, RangeOptions, SSET_MARKER, SSET_ROW_ID};

use super::{CouchView, ViewError, ViewParams, ViewResponse, ViewRow};

/// A database handle with sorted-set queries intercepted.
pub struct SuperCouch<C> {
    inner: C,
    store: Arc<dyn SSetStore>,
}

/// What a request turned out to be.
enum Classified {
    Keys(Vec<Vec<Value>>),
    Range(RangeQuery),
    PassThrough,
}

/// A recognized range query: one sorted set plus inclusive score bounds.
struct RangeQuery {
    database: String,
    id_path: Vec<String>,
    min: f64,
    max: f64,
    /// The common `["$SSET", database, ...idPath]` prefix, for row keys.
    prefix: Vec<Value>,
}

impl<C: CouchView> SuperCouch<C> {
    pub fn new(inner: C, store: Arc<dyn SSetStore>) -> Self {
        Self { inner, store }
    }

    /// The wrapped native handle.
    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Answer a view request, intercepting sorted-set queries.
    pub async fn view(
        &self,
        ddoc: &str,
        view: &str,
        params: &ViewParams,
    ) -> Result<ViewResponse, ViewError> {
        match classify(params) {
            Classified::Keys(keys) => {
                debug!(keys = keys.len(), "sorted-set keys query");
                self.keys_query(keys).await
            }
            Classified::Range(query) => {
                debug!(database = %query.database, "sorted-set range query");
                self.range_query(query, params).await
            }
            Classified::PassThrough => self.inner.view(ddoc, view, params).await,
        }
    }

    /// One `range_by_index(-1, -1)` per key, fanned out in parallel. Rows
    /// come back in input order; a key with no entries yields a row without
    /// `value` or `score`.
    async fn keys_query(&self, keys: Vec<Vec<Value>>) -> Result<ViewResponse, ViewError> {
        let opts = RangeOptions {
            include_scores: true,
            include_total: false,
            ..Default::default()
        };
        let lookups = keys.iter().map(|key| {
            let opts = &opts;
            async move {
                match parse_sset_key(key) {
                    Some((database, id_path)) => self
                        .store
                        .range_by_index(&database, &id_path, -1, -1, opts)
                        .await
                        .map(|resp| resp.rows.into_iter().next()),
                    // A key that does not parse as a sorted-set address has
                    // no entries; degrade to an empty row.
                    None => Ok(None),
                }
            }
        });
        let results = try_join_all(lookups)
            .await
            .map_err(|source| ViewError::KeysQueryFailed { source })?;

        let rows = keys
            .iter()
            .zip(results)
            .map(|(key, hit)| ViewRow {
                id: SSET_ROW_ID.to_string(),
                key: Value::String(join_key(key)),
                value: hit.as_ref().map(|row| row.value.clone()),
                score: hit.and_then(|row| row.score),
            })
            .collect::<Vec<_>>();

        Ok(ViewResponse {
            offset: 0,
            total_rows: rows.len() as i64,
            rows,
        })
    }

    async fn range_query(
        &self,
        query: RangeQuery,
        params: &ViewParams,
    ) -> Result<ViewResponse, ViewError> {
        let opts = RangeOptions {
            offset: params.skip,
            count: params.limit,
            order: if params.descending {
                Order::Desc
            } else {
                Order::Asc
            },
            include_total: params.include_total_rows.unwrap_or(true),
            include_scores: params.include_scores.unwrap_or(true),
        };
        let resp = self
            .store
            .range_by_score(&query.database, &query.id_path, query.min, query.max, &opts)
            .await
            .map_err(|source| ViewError::RangeQueryFailed { source })?;

        let key = join_key(&query.prefix);
        let rows = resp
            .rows
            .into_iter()
            .map(|row| ViewRow {
                id: SSET_ROW_ID.to_string(),
                key: Value::String(key.clone()),
                value: Some(row.value),
                score: row.score,
            })
            .collect();

        Ok(ViewResponse {
            offset: resp.paging.offset,
            total_rows: resp.paging.total,
            rows,
        })
    }
}

/// Decide how to answer a request.
fn classify(params: &ViewParams) -> Classified {
    if let Some(keys) = &params.keys {
        if let Some(Value::Array(first)) = keys.first() {
            if first.first().and_then(Value::as_str) == Some(SSET_MARKER) {
                let keys = keys
                    .iter()
                    .map(|k| k.as_array().cloned().unwrap_or_default())
                    .collect();
                return Classified::Keys(keys);
            }
        }
        return Classified::PassThrough;
    }

    let (Some(Value::Array(start)), Some(Value::Array(end))) =
        (&params.start_key, &params.end_key)
    else {
        return Classified::PassThrough;
    };
    match range_query(start, end) {
        Some(query) => Classified::Range(query),
        None => Classified::PassThrough,
    }
}

/// Recognize a `["$SSET", database, ...idPath, bound]` pair: equal length,
/// numeric last elements, every element before the last pairwise equal.
fn range_query(start: &[Value], end: &[Value]) -> Option<RangeQuery> {
    if start.len() != end.len() || start.len() < 4 {
        return None;
    }
    if start.first().and_then(Value::as_str) != Some(SSET_MARKER)
        || end.first().and_then(Value::as_str) != Some(SSET_MARKER)
    {
        return None;
    }
    let min = start.last().and_then(Value::as_f64)?;
    let max = end.last().and_then(Value::as_f64)?;
    let prefix = &start[..start.len() - 1];
    if prefix != &end[..end.len() - 1] {
        return None;
    }
    let (database, id_path) = parse_sset_key(prefix)?;
    Some(RangeQuery {
        database,
        id_path,
        min,
        max,
        prefix: prefix.to_vec(),
    })
}

/// Split `["$SSET", database, ...idPath]` into its address parts. All
/// segments must be strings and the id path must be non-empty.
fn parse_sset_key(key: &[Value]) -> Option<(String, Vec<String>)> {
    if key.first().and_then(Value::as_str) != Some(SSET_MARKER) || key.len() < 3 {
        return None;
    }
    let mut segments = Vec::with_capacity(key.len() - 1);
    for part in &key[1..] {
        segments.push(part.as_str()?.to_string());
    }
    let database = segments.remove(0);
    Some((database, segments))
}

/// Join a key array with commas, the way the native rows key sorted-set
/// results: `"$SSET,Users,u7"`.
fn join_key(key: &[Value]) -> String {
    key.iter()
        .map(|part| match part {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sset::{MemoryStore, SSetError};
    use crate::types::{Keep, SSetOp};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Native handle stub that records pass-through calls.
    #[derive(Default)]
    struct StubCouch {
        calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl CouchView for StubCouch {
        async fn view(
            &self,
            ddoc: &str,
            view: &str,
            _params: &ViewParams,
        ) -> Result<ViewResponse, ViewError> {
            self.calls.lock().push((ddoc.to_string(), view.to_string()));
            Ok(ViewResponse {
                offset: 0,
                total_rows: 0,
                rows: vec![],
            })
        }
    }

    /// Store stub that always fails, for the error-wrapping path.
    struct FailingStore;

    #[async_trait]
    impl SSetStore for FailingStore {
        async fn process(&self, _ops: Vec<SSetOp>) -> Result<(), SSetError> {
            Err(SSetError::Backend("down".to_string()))
        }

        async fn range_by_index(
            &self,
            _database: &str,
            _id_path: &[String],
            _min: i64,
            _max: i64,
            _opts: &RangeOptions,
        ) -> Result<crate::types::RangeResponse, SSetError> {
            Err(SSetError::Backend("down".to_string()))
        }

        async fn range_by_score(
            &self,
            _database: &str,
            _id_path: &[String],
            _min: f64,
            _max: f64,
            _opts: &RangeOptions,
        ) -> Result<crate::types::RangeResponse, SSetError> {
            Err(SSetError::Backend("down".to_string()))
        }
    }

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .process(vec![
                SSetOp {
                    database: "Users".to_string(),
                    id_path: vec!["u7".to_string()],
                    score: 5.0,
                    value: json!({"n": "seven"}),
                    keep: Keep::LastValue,
                },
                SSetOp {
                    database: "UsersIndex".to_string(),
                    id_path: vec!["ByDate".to_string()],
                    score: 150.0,
                    value: json!("a"),
                    keep: Keep::AllValues,
                },
                SSetOp {
                    database: "UsersIndex".to_string(),
                    id_path: vec!["ByDate".to_string()],
                    score: 200.0,
                    value: json!("b"),
                    keep: Keep::AllValues,
                },
            ])
            .await
            .unwrap();
        store
    }

    fn params(value: Value) -> ViewParams {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_keys_query_preserves_input_order() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        let resp = db
            .view(
                "d",
                "v",
                &params(json!({
                    "keys": [["$SSET", "Users", "u7"], ["$SSET", "Users", "u8"]]
                })),
            )
            .await
            .unwrap();

        assert_eq!(resp.offset, 0);
        assert_eq!(resp.total_rows, 2);
        assert_eq!(resp.rows.len(), 2);
        assert_eq!(resp.rows[0].id, "#SSET");
        assert_eq!(resp.rows[0].key, json!("$SSET,Users,u7"));
        assert_eq!(resp.rows[0].value, Some(json!({"n": "seven"})));
        assert_eq!(resp.rows[0].score, Some(5.0));
        // u8 has no entries: the row is present but bare.
        assert_eq!(resp.rows[1].key, json!("$SSET,Users,u8"));
        assert_eq!(resp.rows[1].value, None);
        assert_eq!(resp.rows[1].score, None);
    }

    #[tokio::test]
    async fn test_range_query_mirrors_service_paging() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        let resp = db
            .view(
                "d",
                "v",
                &params(json!({
                    "start_key": ["$SSET", "UsersIndex", "ByDate", 100],
                    "end_key": ["$SSET", "UsersIndex", "ByDate", 200],
                    "descending": false,
                    "skip": 0,
                    "limit": 10
                })),
            )
            .await
            .unwrap();

        assert_eq!(resp.offset, 0);
        assert_eq!(resp.total_rows, 2);
        assert_eq!(resp.rows.len(), 2);
        assert_eq!(resp.rows[0].key, json!("$SSET,UsersIndex,ByDate"));
        assert_eq!(resp.rows[0].value, Some(json!("a")));
        assert_eq!(resp.rows[0].score, Some(150.0));
        assert_eq!(resp.rows[1].value, Some(json!("b")));
    }

    #[tokio::test]
    async fn test_range_query_descending() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        let resp = db
            .view(
                "d",
                "v",
                &params(json!({
                    "start_key": ["$SSET", "UsersIndex", "ByDate", 0],
                    "end_key": ["$SSET", "UsersIndex", "ByDate", 300],
                    "descending": true
                })),
            )
            .await
            .unwrap();

        assert_eq!(resp.rows[0].value, Some(json!("b")));
        assert_eq!(resp.rows[1].value, Some(json!("a")));
    }

    #[tokio::test]
    async fn test_include_flags_shape_rows() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        let resp = db
            .view(
                "d",
                "v",
                &params(json!({
                    "start_key": ["$SSET", "UsersIndex", "ByDate", 0],
                    "end_key": ["$SSET", "UsersIndex", "ByDate", 300],
                    "include_scores": false,
                    "include_total_rows": false
                })),
            )
            .await
            .unwrap();

        assert_eq!(resp.total_rows, -1);
        assert!(resp.rows.iter().all(|r| r.score.is_none()));
    }

    #[tokio::test]
    async fn test_passthrough_delegates_to_native_handle() {
        let store = seeded_store().await;
        let stub = StubCouch::default();
        let db = SuperCouch::new(stub, store);

        // Unmarked range bounds go to the native handle untouched.
        db.view(
            "design",
            "by_date",
            &params(json!({
                "start_key": ["NOTSSET", "x", 1],
                "end_key": ["NOTSSET", "x", 9]
            })),
        )
        .await
        .unwrap();

        // Unmarked keys too.
        db.view("design", "by_id", &params(json!({"keys": [["k", 1]]})))
            .await
            .unwrap();

        // No params at all.
        db.view("design", "all", &ViewParams::default()).await.unwrap();

        let calls = db.inner.calls.lock();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[0], ("design".to_string(), "by_date".to_string()));
    }

    #[tokio::test]
    async fn test_mismatched_prefixes_pass_through() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        db.view(
            "d",
            "v",
            &params(json!({
                "start_key": ["$SSET", "A", "k", 1],
                "end_key": ["$SSET", "B", "k", 9]
            })),
        )
        .await
        .unwrap();
        assert_eq!(db.inner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_non_numeric_bounds_pass_through() {
        let store = seeded_store().await;
        let db = SuperCouch::new(StubCouch::default(), store);

        db.view(
            "d",
            "v",
            &params(json!({
                "start_key": ["$SSET", "A", "k", "low"],
                "end_key": ["$SSET", "A", "k", "high"]
            })),
        )
        .await
        .unwrap();
        assert_eq!(db.inner.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_store_errors_wrap_as_view_errors() {
        let db = SuperCouch::new(StubCouch::default(), Arc::new(FailingStore));

        let err = db
            .view("d", "v", &params(json!({"keys": [["$SSET", "Users", "u7"]]})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 500);
        assert_eq!(err.name(), "supercouch_error");
        assert_eq!(err.reason(), "keys_query_failed");

        let err = db
            .view(
                "d",
                "v",
                &params(json!({
                    "start_key": ["$SSET", "A", "k", 1],
                    "end_key": ["$SSET", "A", "k", 9]
                })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "range_query_failed");
    }

    #[test]
    fn test_join_key() {
        assert_eq!(
            join_key(&[json!("$SSET"), json!("Users"), json!("u7")]),
            "$SSET,Users,u7"
        );
        assert_eq!(join_key(&[json!("a"), json!(7), json!(null)]), "a,7,");
    }
}
