//! Redis-backed sorted-set store
//!
//! Realizes [`SSetStore`] over a standalone server or a cluster. Batches
//! commit as one `MULTI`/`EXEC` pipeline per database group; the hash tag in
//! the key shape guarantees every key of a group lives on one cluster slot,
//! which is what makes those transactions legal under cluster routing.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::future::try_join_all;
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use serde_json::Value;
use tracing::debug;

use crate::types::{Keep, Order, Paging, RangeOptions, RangeResponse, RangeRow, SSetOp};

use super::{cluster::ClusterUrl, keys::sset_key, validate_ops, SSetError, SSetStore};

/// `LIMIT` count used when an offset is given without a count.
const NO_COUNT: i64 = i64::MAX;

/// One handle over either connection flavor. Both multiplex internally and
/// are cheap to clone per call.
#[derive(Clone)]
enum Conn {
    Single(ConnectionManager),
    Cluster(ClusterConnection),
}

/// Sorted-set store talking to Redis.
pub struct RedisStore {
    conn: Conn,
}

impl RedisStore {
    /// Connect according to the URL scheme: `redis-cluster://` opens a
    /// cluster connection over the listed root nodes (with address
    /// overrides applied), anything else is handed to the single-node
    /// client as-is.
    pub async fn connect(url: &str) -> Result<Self, SSetError> {
        let conn = match ClusterUrl::parse(url).map_err(|e| SSetError::Backend(e.to_string()))? {
            Some(cluster) => {
                debug!(nodes = cluster.nodes.len(), "connecting to redis cluster");
                let client = ClusterClient::new(cluster.root_urls())?;
                Conn::Cluster(client.get_async_connection().await?)
            }
            None => {
                debug!(%url, "connecting to redis");
                let client = redis::Client::open(url)?;
                Conn::Single(ConnectionManager::new(client).await?)
            }
        };
        Ok(Self { conn })
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T, SSetError> {
        match self.conn.clone() {
            Conn::Single(mut c) => Ok(cmd.query_async(&mut c).await?),
            Conn::Cluster(mut c) => Ok(cmd.query_async(&mut c).await?),
        }
    }

    async fn exec_pipe(&self, pipe: &redis::Pipeline) -> Result<(), SSetError> {
        match self.conn.clone() {
            Conn::Single(mut c) => Ok(pipe.query_async::<()>(&mut c).await?),
            Conn::Cluster(mut c) => Ok(pipe.query_async::<()>(&mut c).await?),
        }
    }

    /// Commit one database group as a single transaction, commands in
    /// submitted order.
    async fn commit_group(&self, group: Vec<SSetOp>) -> Result<(), SSetError> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in &group {
            let key = sset_key(&op.database, &op.id_path);
            let member = serde_json::to_string(&op.value)?;
            // GT upgrades an existing member's score and still inserts new
            // members.
            pipe.cmd("ZADD")
                .arg(&key)
                .arg("GT")
                .arg(op.score)
                .arg(&member)
                .ignore();
            if op.keep == Keep::LastValue {
                // Trim everything below the top-ranked entry; cardinality
                // stays <= 1 with the globally-largest score retained.
                pipe.cmd("ZREMRANGEBYRANK").arg(&key).arg(0).arg(-2).ignore();
            }
        }
        self.exec_pipe(&pipe).await
    }

    /// Run a range command, with or without the `WITHSCORES` reply shape.
    async fn fetch(
        &self,
        cmd: redis::Cmd,
        with_scores: bool,
    ) -> Result<Vec<(String, Option<f64>)>, SSetError> {
        if with_scores {
            let rows: Vec<(String, f64)> = self.query(&cmd).await?;
            Ok(rows.into_iter().map(|(m, s)| (m, Some(s))).collect())
        } else {
            let rows: Vec<String> = self.query(&cmd).await?;
            Ok(rows.into_iter().map(|m| (m, None)).collect())
        }
    }
}

fn decode_rows(fetched: Vec<(String, Option<f64>)>) -> Result<Vec<RangeRow>, SSetError> {
    fetched
        .into_iter()
        .map(|(member, score)| {
            Ok(RangeRow {
                value: serde_json::from_str::<Value>(&member)?,
                score,
            })
        })
        .collect()
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
impl SSetStore for RedisStore {
    async fn process(&self, ops: Vec<SSetOp>) -> Result<(), SSetError> {
        validate_ops(&ops)?;
        let mut groups: HashMap<String, Vec<SSetOp>> = HashMap::new();
        for op in ops {
            groups.entry(op.database.clone()).or_default().push(op);
        }
        // One transaction per database; groups commit in parallel and any
        // failure fails the whole call.
        try_join_all(groups.into_values().map(|group| self.commit_group(group))).await?;
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
        let mut cmd = redis::cmd(match opts.order {
            Order::Asc => "ZRANGE",
            Order::Desc => "ZREVRANGE",
        });
        cmd.arg(&key).arg(min).arg(max);
        if opts.include_scores {
            cmd.arg("WITHSCORES");
        }

        // Rank ranges have no LIMIT clause; the full slice comes back and
        // paging is applied here. The pre-paging length is the range total.
        let fetched = self.fetch(cmd, opts.include_scores).await?;
        let total = if opts.include_total {
            fetched.len() as i64
        } else {
            -1
        };
        let paged: Vec<_> = if opts.paged() {
            let offset = opts.offset.unwrap_or(0) as usize;
            let count = opts.count.map(|c| c as usize).unwrap_or(usize::MAX);
            fetched.into_iter().skip(offset).take(count).collect()
        } else {
            fetched
        };

        Ok(RangeResponse {
            paging: paging_for(opts, total),
            rows: decode_rows(paged)?,
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
        // Descending ranges take their bounds swapped.
        let (name, lo, hi) = match opts.order {
            Order::Asc => ("ZRANGEBYSCORE", min, max),
            Order::Desc => ("ZREVRANGEBYSCORE", max, min),
        };
        let mut cmd = redis::cmd(name);
        cmd.arg(&key).arg(lo).arg(hi);
        if opts.include_scores {
            cmd.arg("WITHSCORES");
        }
        if opts.paged() {
            cmd.arg("LIMIT")
                .arg(opts.offset.unwrap_or(0) as i64)
                .arg(opts.count.map(|c| c as i64).unwrap_or(NO_COUNT));
        }

        // A paged fetch cannot tell the range total from the rows it got
        // back, so ZCOUNT runs in parallel with it. Unpaged fetches infer
        // the total from the row count and skip the extra call.
        let count_call = opts.include_total && opts.paged();
        let fetch_fut = self.fetch(cmd, opts.include_scores);
        let total_fut = async {
            if count_call {
                let mut count_cmd = redis::cmd("ZCOUNT");
                count_cmd.arg(&key).arg(min).arg(max);
                Ok::<_, SSetError>(Some(self.query::<i64>(&count_cmd).await?))
            } else {
                Ok(None)
            }
        };
        let (fetched, counted) = tokio::try_join!(fetch_fut, total_fut)?;

        let total = if opts.include_total {
            counted.unwrap_or(fetched.len() as i64)
        } else {
            -1
        };

        Ok(RangeResponse {
            paging: paging_for(opts, total),
            rows: decode_rows(fetched)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_malformed_url() {
        let result = RedisStore::connect("not a url").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_cluster() {
        let result = RedisStore::connect("redis-cluster://").await;
        assert!(matches!(result, Err(SSetError::Backend(_))));
    }
}
