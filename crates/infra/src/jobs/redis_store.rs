//! Redis-backed job store.
//!
//! Layout:
//! - `job:<id>` holds the full record as JSON
//! - `jobs` is a sorted set of ids scored by creation time (milliseconds)

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{debug, warn};

use jobrelay_core::{Job, JobId, JobStatus};

use crate::connection::{RedisConnection, bounded};
use crate::jobs::store::{JobStore, JobStoreError};

/// Deadline for single-record operations.
pub const OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Deadline for `list`, which makes two round trips.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(3);

/// Compare-and-set on the record's `status` field.
/// Replies `{"0"}` when missing, `{"1", current}` on mismatch, `{"2"}` once written.
const UPDATE_IF_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return {'0'}
end
if cjson.decode(current)['status'] ~= ARGV[1] then
  return {'1', current}
end
redis.call('SET', KEYS[1], ARGV[2])
return {'2'}
"#;

/// Durable job store.
///
/// Records survive restarts and are shared by every process pointing at the
/// same Redis database. `list` returns newest first.
///
/// `create` checks for the key and then writes in a transaction, so two
/// callers supplying the same id at the same moment can both succeed. Ids from
/// [`JobId::new`] are time-ordered and random and do not collide in practice.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    namespace: Option<String>,
    update_if: redis::Script,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RedisJobStore {
    pub fn new(connection: &RedisConnection) -> Self {
        Self {
            conn: connection.manager(),
            namespace: None,
            update_if: redis::Script::new(UPDATE_IF_SCRIPT),
        }
    }

    /// Prefix every key with `<namespace>:`, so several stores can share a database.
    pub fn with_namespace(connection: &RedisConnection, namespace: impl Into<String>) -> Self {
        Self {
            conn: connection.manager(),
            namespace: Some(namespace.into()),
            update_if: redis::Script::new(UPDATE_IF_SCRIPT),
        }
    }

    fn record_key(&self, job_id: impl std::fmt::Display) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:job:{job_id}"),
            None => format!("job:{job_id}"),
        }
    }

    fn index_key(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:jobs"),
            None => "jobs".to_string(),
        }
    }
}

fn encode(job: &Job) -> Result<String, JobStoreError> {
    serde_json::to_string(job).map_err(|e| JobStoreError::Backend(format!("encode job: {e}")))
}

fn decode(job_id: JobId, raw: &str) -> Result<Job, JobStoreError> {
    serde_json::from_str(raw).map_err(|e| JobStoreError::Backend(format!("decode job {job_id}: {e}")))
}

/// Interpret the reply of [`UPDATE_IF_SCRIPT`].
fn update_if_outcome(job_id: JobId, reply: Vec<String>) -> Result<(), JobStoreError> {
    match reply.first().map(String::as_str) {
        Some("2") => Ok(()),
        Some("0") => Err(JobStoreError::NotFound(job_id)),
        Some("1") => {
            let current = reply
                .get(1)
                .ok_or_else(|| JobStoreError::Backend("update_if: missing current record".to_string()))?;
            Err(JobStoreError::StatusChanged {
                id: job_id,
                found: decode(job_id, current)?.status(),
            })
        }
        other => Err(JobStoreError::Backend(format!("update_if: unexpected reply {other:?}"))),
    }
}

/// Decode an `MGET` reply, skipping records that vanished between the index
/// read and the fetch, or that no longer decode.
fn decode_records(ids: &[String], raw: Vec<Option<String>>) -> Vec<Job> {
    ids.iter()
        .zip(raw)
        .filter_map(|(id, value)| {
            let value = value?;
            match serde_json::from_str::<Job>(&value) {
                Ok(job) => Some(job),
                Err(e) => {
                    warn!(job_id = %id, error = %e, "skipping undecodable job record");
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let key = self.record_key(job.id());
        let payload = encode(job)?;

        let exists: bool = bounded(OP_TIMEOUT, redis::cmd("EXISTS").arg(&key).query_async(&mut conn))
            .await
            .map_err(JobStoreError::Backend)?;
        if exists {
            return Err(JobStoreError::AlreadyExists(job.id()));
        }

        let _: () = bounded(
            OP_TIMEOUT,
            redis::pipe()
                .atomic()
                .cmd("SET")
                .arg(&key)
                .arg(&payload)
                .ignore()
                .cmd("ZADD")
                .arg(self.index_key())
                .arg(job.created_at().timestamp_millis())
                .arg(job.id().to_string())
                .ignore()
                .query_async(&mut conn),
        )
        .await
        .map_err(JobStoreError::Backend)?;

        debug!(job_id = %job.id(), "stored job record");
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = bounded(
            OP_TIMEOUT,
            redis::cmd("GET").arg(self.record_key(job_id)).query_async(&mut conn),
        )
        .await
        .map_err(JobStoreError::Backend)?;

        let raw = raw.ok_or(JobStoreError::NotFound(job_id))?;
        decode(job_id, &raw)
    }

    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let payload = encode(job)?;

        // SET .. XX replies nil when the key does not exist.
        let reply: Option<String> = bounded(
            OP_TIMEOUT,
            redis::cmd("SET")
                .arg(self.record_key(job.id()))
                .arg(&payload)
                .arg("XX")
                .query_async(&mut conn),
        )
        .await
        .map_err(JobStoreError::Backend)?;

        match reply {
            Some(_) => Ok(()),
            None => Err(JobStoreError::NotFound(job.id())),
        }
    }

    async fn update_if(&self, job: &Job, expected: JobStatus) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let payload = encode(job)?;

        let mut invocation = self.update_if.key(self.record_key(job.id()));
        invocation.arg(expected.as_str()).arg(&payload);
        let reply: Vec<String> = bounded(OP_TIMEOUT, invocation.invoke_async(&mut conn))
            .await
            .map_err(JobStoreError::Backend)?;

        update_if_outcome(job.id(), reply)
    }

    async fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut conn = self.conn.clone();
        let (deleted, _): (i64, i64) = bounded(
            OP_TIMEOUT,
            redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(self.record_key(job_id))
                .cmd("ZREM")
                .arg(self.index_key())
                .arg(job_id.to_string())
                .query_async(&mut conn),
        )
        .await
        .map_err(JobStoreError::Backend)?;

        if deleted == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Job>, JobStoreError> {
        let mut conn = self.conn.clone();
        let index_key = self.index_key();

        let fetch = async {
            let ids: Vec<String> = redis::cmd("ZREVRANGE")
                .arg(&index_key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await?;
            if ids.is_empty() {
                return Ok::<_, redis::RedisError>((ids, Vec::new()));
            }

            let keys: Vec<String> = ids.iter().map(|id| self.record_key(id)).collect();
            let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
            Ok::<_, redis::RedisError>((ids, raw))
        };

        let (ids, raw) = bounded(LIST_TIMEOUT, fetch)
            .await
            .map_err(JobStoreError::Backend)?;
        Ok(decode_records(&ids, raw))
    }
}
