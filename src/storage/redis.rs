//! Distributed storage adapter: Redis sorted sets for ordering, Lua scripts
//! for the three transitions (`dequeue`, `complete_job`, `fail_job`) that
//! must be atomic with respect to concurrent callers. The connection itself
//! is owned by the supervisor; this adapter only ever borrows a
//! `ConnectionManager` clone, which reconnects transparently underneath it.

use super::{
    FailOutcome, HealthStatus, JobFilter, JobPatch, QueueStats, SortKey, SortOrder,
    StorageAdapter, StorageError, StorageResult,
};
use crate::job::{Job, JobError, JobId, JobStatus};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// On-wire envelope: the job plus the score it was enqueued with. Keeping
/// the score alongside the job (rather than recomputing it in Lua from a
/// timestamp string) lets retries preserve the original `queued_at` score
/// without teaching the Lua scripts how to parse RFC3339.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredJob {
    score: f64,
    job: Job,
}

pub struct RedisStorage {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisStorage {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn job_key(&self, id: JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }

    fn queued_key(&self, queue: &str) -> String {
        format!("{}:q:{}:queued", self.key_prefix, queue)
    }

    fn state_key(&self, queue: &str, status: JobStatus) -> String {
        format!("{}:q:{}:state:{}", self.key_prefix, queue, status_tag(status))
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn status_tag(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Completed => "completed",
        JobStatus::Failed => "failed",
        JobStatus::Cancelled => "cancelled",
    }
}

/// `ZPOPMIN` the ready queue, transition the popped job to `running`, move
/// its id between state sets, atomically. Returns the job JSON, or nil if
/// the queue was empty.
const DEQUEUE_SCRIPT: &str = r#"
local queued_key = KEYS[1]
local state_queued_key = KEYS[2]
local state_running_key = KEYS[3]
local job_key_prefix = ARGV[1]
local now_iso = ARGV[2]

local popped = redis.call('ZPOPMIN', queued_key, 1)
if #popped == 0 then
    return false
end

local job_id = popped[1]
local job_key = job_key_prefix .. job_id
local raw = redis.call('GET', job_key)
if not raw then
    return false
end

local stored = cjson.decode(raw)
stored.job.status = 'running'
stored.job.started_at = now_iso

redis.call('SET', job_key, cjson.encode(stored))
redis.call('SREM', state_queued_key, job_id)
redis.call('SADD', state_running_key, job_id)

return cjson.encode(stored)
"#;

/// Moves a `running` job to `completed`, storing the result payload.
/// Returns 1 on success, 0 if the job was not `running` (idempotent no-op),
/// -1 if the job does not exist.
const COMPLETE_SCRIPT: &str = r#"
local job_key = KEYS[1]
local state_running_key = KEYS[2]
local state_completed_key = KEYS[3]
local job_id = ARGV[1]
local now_iso = ARGV[2]
local result_json = ARGV[3]

local raw = redis.call('GET', job_key)
if not raw then
    return -1
end

local stored = cjson.decode(raw)
if stored.job.status ~= 'running' then
    return 0
end

stored.job.status = 'completed'
stored.job.completed_at = now_iso
stored.job.progress = 100
if result_json ~= '' then
    stored.job.result = cjson.decode(result_json)
end

redis.call('SET', job_key, cjson.encode(stored))
redis.call('SREM', state_running_key, job_id)
redis.call('SADD', state_completed_key, job_id)

return 1
"#;

/// Moves a `running` job to `queued` (retry, preserving its original
/// score) or `failed` (terminal), depending on `(retries + 1) > max_retries`.
/// Returns 1 for retried, 2 for failed terminally, 0 if not running, -1 if
/// the job does not exist.
const FAIL_SCRIPT: &str = r#"
local job_key = KEYS[1]
local state_running_key = KEYS[2]
local state_queued_key = KEYS[3]
local state_failed_key = KEYS[4]
local queued_zset_key = KEYS[5]
local job_id = ARGV[1]
local now_iso = ARGV[2]
local error_json = ARGV[3]

local raw = redis.call('GET', job_key)
if not raw then
    return -1
end

local stored = cjson.decode(raw)
if stored.job.status ~= 'running' then
    return 0
end

stored.job.error = cjson.decode(error_json)

if (stored.job.retries + 1) > stored.job.max_retries then
    stored.job.status = 'failed'
    stored.job.failed_at = now_iso
    redis.call('SET', job_key, cjson.encode(stored))
    redis.call('SREM', state_running_key, job_id)
    redis.call('SADD', state_failed_key, job_id)
    return 2
else
    stored.job.retries = stored.job.retries + 1
    stored.job.status = 'queued'
    stored.job.started_at = cjson.null
    stored.job.progress = 0
    stored.job.progress_message = cjson.null
    redis.call('SET', job_key, cjson.encode(stored))
    redis.call('SREM', state_running_key, job_id)
    redis.call('SADD', state_queued_key, job_id)
    redis.call('ZADD', queued_zset_key, stored.score, job_id)
    return 1
end
"#;

/// Unconditionally moves a job to `failed` from whichever state set it is
/// currently indexed under, removing it from every other state set along
/// the way. Returns 1 on success, 0 if already terminal, -1 if missing.
const FAIL_TERMINAL_SCRIPT: &str = r#"
local job_key = KEYS[1]
local state_queued_key = KEYS[2]
local state_running_key = KEYS[3]
local state_failed_key = KEYS[4]
local state_completed_key = KEYS[5]
local state_cancelled_key = KEYS[6]
local queued_zset_key = KEYS[7]
local job_id = ARGV[1]
local now_iso = ARGV[2]
local error_json = ARGV[3]

local raw = redis.call('GET', job_key)
if not raw then
    return -1
end

local stored = cjson.decode(raw)
local status = stored.job.status
if status == 'completed' or status == 'failed' or status == 'cancelled' then
    return 0
end

stored.job.status = 'failed'
stored.job.failed_at = now_iso
stored.job.error = cjson.decode(error_json)

redis.call('SET', job_key, cjson.encode(stored))
redis.call('SREM', state_queued_key, job_id)
redis.call('SREM', state_running_key, job_id)
redis.call('ZREM', queued_zset_key, job_id)
redis.call('SADD', state_failed_key, job_id)

return 1
"#;

#[async_trait]
impl StorageAdapter for RedisStorage {
    async fn enqueue(&self, job: Job) -> StorageResult<()> {
        let mut conn = self.conn();
        let stored = StoredJob {
            score: job.score(),
            job: job.clone(),
        };
        let raw = serde_json::to_string(&stored)?;

        let job_key = self.job_key(job.id);
        let queued_key = self.queued_key(&job.queue_name);
        let state_key = self.state_key(&job.queue_name, JobStatus::Queued);

        let _: () = conn
            .set(&job_key, &raw)
            .await
            .map_err(|e| StorageError::op("ENQUEUE", Some(job.id), e.to_string()))?;
        let _: () = conn
            .zadd(&queued_key, job.id.to_string(), stored.score)
            .await
            .map_err(|e| StorageError::op("ENQUEUE", Some(job.id), e.to_string()))?;
        let _: () = conn
            .sadd(&state_key, job.id.to_string())
            .await
            .map_err(|e| StorageError::op("ENQUEUE", Some(job.id), e.to_string()))?;
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let mut conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        let result: Option<String> = redis::Script::new(DEQUEUE_SCRIPT)
            .key(self.queued_key(queue_name))
            .key(self.state_key(queue_name, JobStatus::Queued))
            .key(self.state_key(queue_name, JobStatus::Running))
            .arg(format!("{}:job:", self.key_prefix))
            .arg(now)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::op("DEQUEUE", None, e.to_string()))?;

        match result {
            None => Ok(None),
            Some(raw) => {
                let stored: StoredJob = serde_json::from_str(&raw)?;
                Ok(Some(stored.job))
            }
        }
    }

    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn
            .zrange(self.queued_key(queue_name), 0, 0)
            .await
            .map_err(|e| StorageError::op("PEEK", None, e.to_string()))?;
        let Some(id_str) = ids.into_iter().next() else {
            return Ok(None);
        };
        let id: JobId = id_str
            .parse()
            .map_err(|_| StorageError::op("PEEK", None, "corrupt job id in queued set"))?;
        self.get_job(id).await
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn
            .get(self.job_key(id))
            .await
            .map_err(|e| StorageError::op("GET_JOB", Some(id), e.to_string()))?;
        match raw {
            None => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str::<StoredJob>(&raw)?.job)),
        }
    }

    async fn list_jobs(&self, queue_name: &str, filter: JobFilter) -> StorageResult<Vec<Job>> {
        let mut conn = self.conn();
        let statuses = filter
            .status
            .clone()
            .unwrap_or_else(|| vec![JobStatus::Queued, JobStatus::Running, JobStatus::Completed, JobStatus::Failed, JobStatus::Cancelled]);

        let mut ids = Vec::new();
        for status in statuses {
            let members: Vec<String> = conn
                .smembers(self.state_key(queue_name, status))
                .await
                .map_err(|e| StorageError::op("LIST_JOBS", None, e.to_string()))?;
            ids.extend(members);
        }

        let mut jobs = Vec::with_capacity(ids.len());
        for id_str in ids {
            if let Ok(id) = id_str.parse::<JobId>() {
                if let Some(job) = self.get_job(id).await? {
                    if filter
                        .job_type
                        .as_ref()
                        .map(|t| *t == job.job_type)
                        .unwrap_or(true)
                    {
                        jobs.push(job);
                    }
                }
            }
        }

        jobs.sort_by(|a, b| {
            let ord = match filter.sort_by {
                SortKey::Priority => a.score().partial_cmp(&b.score()).unwrap_or(std::cmp::Ordering::Equal),
                SortKey::QueuedAt => a.queued_at.cmp(&b.queued_at),
            };
            match filter.sort_order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let start = filter.offset.min(jobs.len());
        let end = match filter.limit {
            Some(limit) => (start + limit).min(jobs.len()),
            None => jobs.len(),
        };
        Ok(jobs[start..end].to_vec())
    }

    async fn update_job(&self, id: JobId, patch: JobPatch) -> StorageResult<bool> {
        let mut conn = self.conn();
        let Some(mut job) = self.get_job(id).await? else {
            return Ok(false);
        };

        let priority_changed = patch.priority.is_some();
        if let Some(priority) = patch.priority {
            job.priority = priority.clamp(crate::job::MIN_PRIORITY, crate::job::MAX_PRIORITY);
        }
        if let Some(progress) = patch.progress {
            job.progress = progress;
        }
        if let Some(msg) = patch.progress_message {
            job.progress_message = Some(msg);
        }
        if let Some(metadata) = patch.metadata {
            job.metadata = metadata;
        }

        let stored = StoredJob {
            score: job.score(),
            job: job.clone(),
        };
        let raw = serde_json::to_string(&stored)?;
        let _: () = conn
            .set(self.job_key(id), &raw)
            .await
            .map_err(|e| StorageError::op("UPDATE_JOB", Some(id), e.to_string()))?;

        if priority_changed && job.status == JobStatus::Queued {
            let _: () = conn
                .zadd(self.queued_key(&job.queue_name), id.to_string(), stored.score)
                .await
                .map_err(|e| StorageError::op("UPDATE_JOB", Some(id), e.to_string()))?;
        }
        Ok(true)
    }

    async fn remove_job(&self, id: JobId) -> StorageResult<bool> {
        let mut conn = self.conn();
        let Some(job) = self.get_job(id).await? else {
            return Ok(false);
        };
        let _: () = conn
            .del(self.job_key(id))
            .await
            .map_err(|e| StorageError::op("REMOVE_JOB", Some(id), e.to_string()))?;
        let _: () = conn
            .srem(self.state_key(&job.queue_name, job.status), id.to_string())
            .await
            .map_err(|e| StorageError::op("REMOVE_JOB", Some(id), e.to_string()))?;
        let _: () = conn
            .zrem(self.queued_key(&job.queue_name), id.to_string())
            .await
            .map_err(|e| StorageError::op("REMOVE_JOB", Some(id), e.to_string()))?;
        Ok(true)
    }

    async fn complete_job(&self, id: JobId, result: Option<serde_json::Value>) -> StorageResult<bool> {
        let Some(job) = self.get_job(id).await? else {
            return Err(StorageError::op("COMPLETE_JOB", Some(id), "job not found"));
        };
        let mut conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        let result_json = result.map(|v| v.to_string()).unwrap_or_default();

        let outcome: i64 = redis::Script::new(COMPLETE_SCRIPT)
            .key(self.job_key(id))
            .key(self.state_key(&job.queue_name, JobStatus::Running))
            .key(self.state_key(&job.queue_name, JobStatus::Completed))
            .arg(id.to_string())
            .arg(now)
            .arg(result_json)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::op("COMPLETE_JOB", Some(id), e.to_string()))?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(StorageError::op("COMPLETE_JOB", Some(id), "job vanished mid-transition")),
        }
    }

    async fn fail_job(&self, id: JobId, error: JobError) -> StorageResult<Option<FailOutcome>> {
        let Some(job) = self.get_job(id).await? else {
            return Err(StorageError::op("FAIL_JOB", Some(id), "job not found"));
        };
        let mut conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        let error_json = serde_json::to_string(&error)?;

        let outcome: i64 = redis::Script::new(FAIL_SCRIPT)
            .key(self.job_key(id))
            .key(self.state_key(&job.queue_name, JobStatus::Running))
            .key(self.state_key(&job.queue_name, JobStatus::Queued))
            .key(self.state_key(&job.queue_name, JobStatus::Failed))
            .key(self.queued_key(&job.queue_name))
            .arg(id.to_string())
            .arg(now)
            .arg(error_json)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::op("FAIL_JOB", Some(id), e.to_string()))?;

        match outcome {
            1 => Ok(Some(FailOutcome::Retried)),
            2 => Ok(Some(FailOutcome::FailedTerminally)),
            0 => Ok(None),
            _ => Err(StorageError::op("FAIL_JOB", Some(id), "job vanished mid-transition")),
        }
    }

    async fn fail_job_terminal(&self, id: JobId, error: JobError) -> StorageResult<bool> {
        let Some(job) = self.get_job(id).await? else {
            return Err(StorageError::op("FAIL_JOB", Some(id), "job not found"));
        };
        let mut conn = self.conn();
        let now = chrono::Utc::now().to_rfc3339();
        let error_json = serde_json::to_string(&error)?;

        let outcome: i64 = redis::Script::new(FAIL_TERMINAL_SCRIPT)
            .key(self.job_key(id))
            .key(self.state_key(&job.queue_name, JobStatus::Queued))
            .key(self.state_key(&job.queue_name, JobStatus::Running))
            .key(self.state_key(&job.queue_name, JobStatus::Failed))
            .key(self.state_key(&job.queue_name, JobStatus::Completed))
            .key(self.state_key(&job.queue_name, JobStatus::Cancelled))
            .key(self.queued_key(&job.queue_name))
            .arg(id.to_string())
            .arg(now)
            .arg(error_json)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StorageError::op("FAIL_JOB", Some(id), e.to_string()))?;

        match outcome {
            1 => Ok(true),
            0 => Ok(false),
            _ => Err(StorageError::op("FAIL_JOB", Some(id), "job vanished mid-transition")),
        }
    }

    async fn cancel_job(&self, id: JobId) -> StorageResult<bool> {
        let mut conn = self.conn();
        let Some(mut job) = self.get_job(id).await? else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        let old_state_key = self.state_key(&job.queue_name, job.status);
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(chrono::Utc::now());

        let stored = StoredJob {
            score: job.score(),
            job: job.clone(),
        };
        let _: () = conn
            .set(self.job_key(id), serde_json::to_string(&stored)?)
            .await
            .map_err(|e| StorageError::op("CANCEL_JOB", Some(id), e.to_string()))?;
        let _: () = conn
            .srem(old_state_key, id.to_string())
            .await
            .map_err(|e| StorageError::op("CANCEL_JOB", Some(id), e.to_string()))?;
        let _: () = conn
            .sadd(self.state_key(&job.queue_name, JobStatus::Cancelled), id.to_string())
            .await
            .map_err(|e| StorageError::op("CANCEL_JOB", Some(id), e.to_string()))?;
        let _: () = conn
            .zrem(self.queued_key(&job.queue_name), id.to_string())
            .await
            .map_err(|e| StorageError::op("CANCEL_JOB", Some(id), e.to_string()))?;
        Ok(true)
    }

    async fn queue_stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        let mut conn = self.conn();
        let mut stats = QueueStats::default();
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            let count: u64 = conn
                .scard(self.state_key(queue_name, status))
                .await
                .map_err(|e| StorageError::op("QUEUE_STATS", None, e.to_string()))?;
            match status {
                JobStatus::Queued => stats.queued = count,
                JobStatus::Running => stats.running = count,
                JobStatus::Completed => stats.completed = count,
                JobStatus::Failed => stats.failed = count,
                JobStatus::Cancelled => stats.cancelled = count,
            }
        }
        stats.total = stats.queued + stats.running + stats.completed + stats.failed + stats.cancelled;
        Ok(stats)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let mut conn = self.conn();
        let start = Instant::now();
        let pong: StorageResult<String> = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::op("HEALTH_CHECK", None, e.to_string()));

        match pong {
            Ok(_) => Ok(HealthStatus {
                healthy: true,
                latency_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
                detail: None,
            }),
            Err(e) => Ok(HealthStatus {
                healthy: false,
                latency_ms: None,
                detail: Some(e.to_string()),
            }),
        }
    }
}
