//! The job record: identity, classification, lifecycle state, and execution budget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Opaque job identifier, assigned at enqueue.
pub type JobId = Uuid;

/// Job priority: 1..=10, lower numeric value is processed first.
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
pub const DEFAULT_PRIORITY: u8 = 5;

/// Lifecycle state of a job. Terminal states never transition elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// Structured failure detail stored on a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    pub message: String,
    pub code: String,
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: code.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

/// The central entity: one unit of work submitted to a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub queue_name: String,
    pub data: serde_json::Value,
    pub status: JobStatus,

    pub priority: u8,
    pub queued_at: DateTime<Utc>,

    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retries: u32,

    pub progress: u8,
    pub progress_message: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,

    pub result: Option<serde_json::Value>,
    pub error: Option<JobError>,

    pub metadata: HashMap<String, String>,
}

/// Options accepted by `QueueInstance::add` / `QueueService::add`.
#[derive(Debug, Clone, Default)]
pub struct AddJobOptions {
    pub priority: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub metadata: HashMap<String, String>,
}

impl Job {
    /// Build a fresh, queued job from defaults + overrides. Mirrors the
    /// composition `QueueInstance::add` performs per spec.
    pub fn new(
        job_type: impl Into<String>,
        queue_name: impl Into<String>,
        data: serde_json::Value,
        default_timeout_ms: u64,
        default_max_retries: u32,
        options: AddJobOptions,
    ) -> Self {
        let now = Utc::now();
        let priority = options
            .priority
            .unwrap_or(DEFAULT_PRIORITY)
            .clamp(MIN_PRIORITY, MAX_PRIORITY);

        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            queue_name: queue_name.into(),
            data,
            status: JobStatus::Queued,
            priority,
            queued_at: now,
            timeout_ms: options.timeout_ms.unwrap_or(default_timeout_ms),
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            retries: 0,
            progress: 0,
            progress_message: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
            metadata: options.metadata,
        }
    }

    /// Score used by ordered storage indices: smaller means "process first".
    /// `priority + queued_at / 1e13` per spec — priority dominates, the
    /// timestamp (in fractional microseconds) breaks ties.
    pub fn score(&self) -> f64 {
        self.priority as f64 + (self.queued_at.timestamp_micros() as f64) / 1e13
    }

    /// `true` once another attempt would exceed `max_retries`, i.e. the
    /// next failure must be terminal rather than re-enqueued.
    pub fn retries_exhausted(&self) -> bool {
        (self.retries + 1) > self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_job_defaults() {
        let job = Job::new(
            "send_email",
            "default",
            json!({"to": "a@b.com"}),
            30_000,
            3,
            AddJobOptions::default(),
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.priority, DEFAULT_PRIORITY);
        assert_eq!(job.retries, 0);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn priority_clamped_to_range() {
        let job = Job::new(
            "t",
            "q",
            json!({}),
            1000,
            0,
            AddJobOptions {
                priority: Some(200),
                ..Default::default()
            },
        );
        assert_eq!(job.priority, MAX_PRIORITY);
    }

    #[test]
    fn score_orders_by_priority_then_time() {
        let mut a = Job::new("t", "q", json!({}), 1000, 0, AddJobOptions::default());
        a.priority = 1;
        let mut b = Job::new("t", "q", json!({}), 1000, 0, AddJobOptions::default());
        b.priority = 5;
        assert!(a.score() < b.score());
    }

    #[test]
    fn terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }
}
