//! Storage adapter contract: persists jobs, atomic enqueue/dequeue/complete/fail,
//! queue statistics. See `memory` for the in-process reference/oracle
//! implementation and `redis` for the distributed reference adapter.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use memory::MemoryStorage;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisStorage;

use crate::job::{Job, JobError, JobId, JobStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by storage-adapter operations, tagged with the operation
/// name so callers (and logs) can tell ENQUEUE failures from FAIL_JOB ones.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{operation} failed for job {key:?}: {message}")]
    Operation {
        operation: &'static str,
        key: Option<String>,
        message: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    pub fn op(operation: &'static str, key: Option<JobId>, message: impl Into<String>) -> Self {
        StorageError::Operation {
            operation,
            key: key.map(|k| k.to_string()),
            message: message.into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// The outcome of `fail_job`: either the job still has attempts left and was
/// put back on the queue, or it has exhausted `max_retries` and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retried,
    FailedTerminally,
}

/// Filters accepted by `list_jobs`.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<Vec<JobStatus>>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub sort_by: SortKey,
    pub sort_order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    #[default]
    Priority,
    QueuedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Partial update applied atomically by `update_job`.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub priority: Option<u8>,
    pub progress: Option<u8>,
    pub progress_message: Option<String>,
    pub metadata: Option<std::collections::HashMap<String, String>>,
}

/// Per-queue job counts by lifecycle state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub detail: Option<String>,
}

/// The contract every storage backend (in-memory or distributed) must
/// satisfy. `dequeue`, `complete_job`, and `fail_job` must be atomic with
/// respect to concurrent callers: exactly one caller observes the
/// transition for a given job id.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    async fn enqueue(&self, job: Job) -> StorageResult<()>;

    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>>;

    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>>;

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>>;

    async fn list_jobs(&self, queue_name: &str, filter: JobFilter) -> StorageResult<Vec<Job>>;

    async fn update_job(&self, id: JobId, patch: JobPatch) -> StorageResult<bool>;

    async fn remove_job(&self, id: JobId) -> StorageResult<bool>;

    /// Moves a `running` job to `completed`. A no-op (returns `false`) if
    /// the job is not currently `running` — this is what makes repeated
    /// completion calls idempotent.
    async fn complete_job(&self, id: JobId, result: Option<serde_json::Value>) -> StorageResult<bool>;

    /// Moves a `running` job either back to `queued` (retry) or to `failed`
    /// (terminal), depending on `(retries + 1) > max_retries`.
    async fn fail_job(&self, id: JobId, error: JobError) -> StorageResult<Option<FailOutcome>>;

    /// Unconditionally moves a job straight to `failed`, bypassing the
    /// retry decision — used for failures no retry could ever fix (no
    /// handler registered for the job type). Returns `false` if the job
    /// was already terminal.
    async fn fail_job_terminal(&self, id: JobId, error: JobError) -> StorageResult<bool>;

    /// Marks a `queued` or `running` job `cancelled`.
    async fn cancel_job(&self, id: JobId) -> StorageResult<bool>;

    async fn queue_stats(&self, queue_name: &str) -> StorageResult<QueueStats>;

    async fn health_check(&self) -> StorageResult<HealthStatus>;
}
