// Cache Store - typed async facade over Redis
// Key families: catalog:*, distance:*, latency:*, audit:*

use redis::aio::ConnectionManager;
use redis::streams::{StreamMaxlen, StreamRangeReply};
use redis::{AsyncCommands, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::time::timeout;

use log::{debug, info, warn};

use crate::latency_recorder::{RecorderHandle, SampleStatus, Service};
use crate::metrics;

/// Cache store failure kinds. Not-found on reads is NOT an error: `get_*`
/// returns `Ok(None)`; `NotFound` is reserved for callers that require a key.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache codec error: {0}")]
    Codec(String),
    #[error("cache key not found: {0}")]
    NotFound(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Unavailable(e.to_string())
    }
}

/// One entry read back from a capped stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

/// Typed async facade over the key-value store. Every operation is bounded
/// by the configured per-op timeout; when a recorder handle is attached,
/// every operation reports a `cache` latency sample regardless of outcome.
#[derive(Clone)]
pub struct CacheStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    recorder: Option<RecorderHandle>,
}

impl CacheStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        info!("✅ Cache store connected to {}", url);
        Ok(Self {
            conn,
            op_timeout,
            recorder: None,
        })
    }

    /// Instrumented clone. The latency worker itself writes through an
    /// uninstrumented store so its sink writes do not feed back into the
    /// sample channel.
    pub fn with_recorder(&self, recorder: RecorderHandle) -> Self {
        Self {
            conn: self.conn.clone(),
            op_timeout: self.op_timeout,
            recorder: Some(recorder),
        }
    }

    fn finish_op<T>(
        &self,
        op: &'static str,
        started: Instant,
        res: Result<redis::RedisResult<T>, tokio::time::error::Elapsed>,
    ) -> Result<T, CacheError> {
        let (out, status, label) = match res {
            Ok(Ok(v)) => (Ok(v), SampleStatus::Ok, "ok"),
            Ok(Err(e)) => (Err(CacheError::from(e)), SampleStatus::Failed, "error"),
            Err(_) => (
                Err(CacheError::Unavailable(format!(
                    "{} timed out after {:?}",
                    op, self.op_timeout
                ))),
                SampleStatus::Failed,
                "timeout",
            ),
        };
        if let Some(rec) = &self.recorder {
            rec.record_elapsed(Service::Cache, op, started.elapsed(), status);
        }
        metrics::increment_cache_op(op, label);
        out
    }

    // ==================== BYTES / JSON ====================

    pub async fn get_bytes(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.get::<_, Option<Vec<u8>>>(key)).await;
        self.finish_op("get", started, res)
    }

    pub async fn set_bytes(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = match ttl {
            Some(ttl) => {
                timeout(
                    self.op_timeout,
                    conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()),
                )
                .await
            }
            None => timeout(self.op_timeout, conn.set::<_, _, ()>(key, value)).await,
        };
        self.finish_op("set", started, res)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get_bytes(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Codec(format!("{}: {}", key, e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| CacheError::Codec(format!("{}: {}", key, e)))?;
        self.set_bytes(key, &bytes, ttl).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.del::<_, ()>(key)).await;
        self.finish_op("del", started, res)
    }

    // ==================== STRINGS / COUNTERS ====================

    pub async fn get_string(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.get::<_, Option<String>>(key)).await;
        self.finish_op("get", started, res)
    }

    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.set::<_, _, ()>(key, value)).await;
        self.finish_op("set", started, res)
    }

    pub async fn incr(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.incr::<_, _, i64>(key, by)).await;
        self.finish_op("incr", started, res)
    }

    /// Best-effort lease acquisition: SET key value NX EX ttl.
    /// Returns false when another holder already owns the key.
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let fut = async {
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl.as_secs())
                .query_async::<_, Option<String>>(&mut conn)
                .await
        };
        let res = timeout(self.op_timeout, fut).await;
        self.finish_op("set_nx", started, res).map(|v| v.is_some())
    }

    // ==================== SORTED SETS ====================

    pub async fn add_sorted(&self, key: &str, score: f64, member: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.zadd::<_, _, _, ()>(key, member, score)).await;
        self.finish_op("zadd", started, res)
    }

    pub async fn range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(
            self.op_timeout,
            conn.zrangebyscore_withscores::<_, _, _, Vec<(String, f64)>>(key, min, max),
        )
        .await;
        self.finish_op("zrangebyscore", started, res)
    }

    /// Keep at most `max_len` members, discarding the lowest-ranked extras.
    pub async fn trim_sorted(&self, key: &str, max_len: usize) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let stop = -(max_len as isize) - 1;
        let res = timeout(
            self.op_timeout,
            conn.zremrangebyrank::<_, ()>(key, 0, stop),
        )
        .await;
        self.finish_op("zremrangebyrank", started, res)
    }

    // ==================== STREAMS ====================

    pub async fn stream_append(
        &self,
        key: &str,
        fields: &[(String, String)],
        max_len: usize,
    ) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(
            self.op_timeout,
            conn.xadd_maxlen::<_, _, _, _, ()>(key, StreamMaxlen::Approx(max_len), "*", fields),
        )
        .await;
        self.finish_op("xadd", started, res)
    }

    pub async fn stream_range(
        &self,
        key: &str,
        from_ts_ms: i64,
        limit: usize,
    ) -> Result<Vec<StreamEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let start_id = format!("{}-0", from_ts_ms);
        let res = timeout(
            self.op_timeout,
            conn.xrange_count::<_, _, _, _, StreamRangeReply>(key, start_id, "+", limit),
        )
        .await;
        self.finish_op("xrange", started, res)
            .map(Self::collect_stream_reply)
    }

    /// Most-recent `n` entries, newest first.
    pub async fn stream_recent(&self, key: &str, n: usize) -> Result<Vec<StreamEntry>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(
            self.op_timeout,
            conn.xrevrange_count::<_, _, _, _, StreamRangeReply>(key, "+", "-", n),
        )
        .await;
        self.finish_op("xrevrange", started, res)
            .map(Self::collect_stream_reply)
    }

    fn collect_stream_reply(reply: StreamRangeReply) -> Vec<StreamEntry> {
        reply
            .ids
            .into_iter()
            .map(|entry| {
                let fields = entry
                    .map
                    .iter()
                    .filter_map(|(k, v)| {
                        redis::from_redis_value::<String>(v)
                            .ok()
                            .map(|s| (k.clone(), s))
                    })
                    .collect();
                StreamEntry {
                    id: entry.id.clone(),
                    fields,
                }
            })
            .collect()
    }

    // ==================== SCAN / CLEANUP ====================

    pub async fn scan(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let pattern = format!("{}*", prefix);
        let fut = async {
            let mut keys = Vec::new();
            let mut iter: redis::AsyncIter<String> = conn.scan_match(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            Ok(keys)
        };
        let res = timeout(self.op_timeout, fut).await;
        self.finish_op("scan", started, res)
    }

    /// Drop an entire key family. Returns the number of keys removed.
    pub async fn clear_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        let keys = self.scan(prefix).await?;
        if keys.is_empty() {
            debug!("🗑️  Nothing to clear under '{}'", prefix);
            return Ok(0);
        }
        let count = keys.len();
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let res = timeout(self.op_timeout, conn.del::<_, ()>(keys)).await;
        self.finish_op("del", started, res)?;
        info!("🗑️  Cleared {} keys under '{}'", count, prefix);
        Ok(count)
    }

    // ==================== HEALTH ====================

    pub async fn ping(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let started = Instant::now();
        let fut = async { redis::cmd("PING").query_async::<_, String>(&mut conn).await };
        let res = timeout(self.op_timeout, fut).await;
        let pong = self.finish_op("ping", started, res)?;
        if pong == "PONG" {
            Ok(())
        } else {
            warn!("⚠️ Unexpected PING response: {}", pong);
            Err(CacheError::Unavailable(format!(
                "unexpected PING response: {}",
                pong
            )))
        }
    }
}
