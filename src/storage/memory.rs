//! In-memory storage adapter: the default single-process backend and the
//! conformance oracle the distributed adapter's test suite is checked
//! against.

use super::{
    FailOutcome, HealthStatus, JobFilter, JobPatch, QueueStats, SortKey, SortOrder,
    StorageAdapter, StorageError, StorageResult,
};
use crate::job::{Job, JobError, JobId, JobStatus};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

/// A heap entry carrying a job id and the score it was enqueued/retried with.
/// Entries whose job has since left the `queued` state (or vanished
/// entirely) are "ghosts" and are discarded lazily when encountered at the
/// top of the heap, mirroring the ghost-cleanup idiom used by the
/// equivalent in-memory priority queue elsewhere in this codebase.
#[derive(Debug, Clone, Copy)]
struct ScoredId {
    score: f64,
    id: JobId,
}

impl PartialEq for ScoredId {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.id == other.id
    }
}
impl Eq for ScoredId {}

impl PartialOrd for ScoredId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoredId {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest score (highest
        // priority, earliest queued_at) surfaces first.
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
    }
}

struct Inner {
    jobs: HashMap<JobId, Job>,
    queued: HashMap<String, BinaryHeap<ScoredId>>,
}

/// In-memory storage backend. A single coarse lock guards the whole state,
/// which is what makes `dequeue`/`complete_job`/`fail_job` atomic here —
/// the distributed adapter gets the same guarantee from server-side
/// scripts instead.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                jobs: HashMap::new(),
                queued: HashMap::new(),
            }),
        }
    }

    /// Pop the lowest-score live `queued` entry for a queue, discarding any
    /// ghosts found along the way. Caller holds the lock.
    fn pop_ready(inner: &mut Inner, queue_name: &str) -> Option<JobId> {
        let heap = inner.queued.get_mut(queue_name)?;
        while let Some(top) = heap.pop() {
            match inner.jobs.get(&top.id) {
                Some(job) if job.status == JobStatus::Queued => return Some(top.id),
                _ => continue, // ghost: removed, retried since, or already running
            }
        }
        None
    }

    fn peek_ready<'a>(inner: &'a Inner, queue_name: &str) -> Option<&'a Job> {
        let heap = inner.queued.get(queue_name)?;
        // Clone-free peek: walk the heap's sorted view via `into_sorted_vec`
        // would consume it, so instead scan for the first live entry. The
        // heap is small relative to total throughput in the reference
        // in-memory backend, so a linear scan for peek is acceptable.
        // `ScoredId`'s `Ord` is reversed (smallest raw score sorts greatest)
        // so the max-heap pops the smallest score first; an ascending sort
        // therefore ends with the entry `pop_ready` would pop next.
        let mut candidates: Vec<&ScoredId> = heap.iter().collect();
        candidates.sort();
        for entry in candidates.iter().rev() {
            if let Some(job) = inner.jobs.get(&entry.id) {
                if job.status == JobStatus::Queued {
                    return Some(job);
                }
            }
        }
        None
    }
}

#[async_trait]
impl StorageAdapter for MemoryStorage {
    async fn enqueue(&self, job: Job) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let score = job.score();
        let id = job.id;
        let queue_name = job.queue_name.clone();
        inner.jobs.insert(id, job);
        inner
            .queued
            .entry(queue_name)
            .or_default()
            .push(ScoredId { score, id });
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let mut inner = self.inner.lock();
        let Some(id) = Self::pop_ready(&mut inner, queue_name) else {
            return Ok(None);
        };
        let job = inner.jobs.get_mut(&id).expect("checked present above");
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        Ok(Some(job.clone()))
    }

    async fn peek(&self, queue_name: &str) -> StorageResult<Option<Job>> {
        let inner = self.inner.lock();
        Ok(Self::peek_ready(&inner, queue_name).cloned())
    }

    async fn get_job(&self, id: JobId) -> StorageResult<Option<Job>> {
        let inner = self.inner.lock();
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_jobs(&self, queue_name: &str, filter: JobFilter) -> StorageResult<Vec<Job>> {
        let inner = self.inner.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.queue_name == queue_name)
            .filter(|j| match &filter.status {
                Some(statuses) => statuses.contains(&j.status),
                None => true,
            })
            .filter(|j| match &filter.job_type {
                Some(t) => &j.job_type == t,
                None => true,
            })
            .cloned()
            .collect();

        jobs.sort_by(|a, b| {
            let ord = match filter.sort_by {
                SortKey::Priority => a
                    .score()
                    .partial_cmp(&b.score())
                    .unwrap_or(Ordering::Equal),
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
        let mut inner = self.inner.lock();
        let priority_changed = patch.priority.is_some();
        let queue_name;
        let requeue_score;
        {
            let Some(job) = inner.jobs.get_mut(&id) else {
                return Ok(false);
            };
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
            queue_name = job.queue_name.clone();
            requeue_score =
                (priority_changed && job.status == JobStatus::Queued).then(|| job.score());
        }
        // A priority change while queued must be reflected in the ordered
        // index; push a fresh entry and let the stale one ghost out.
        if let Some(score) = requeue_score {
            inner
                .queued
                .entry(queue_name)
                .or_default()
                .push(ScoredId { score, id });
        }
        Ok(true)
    }

    async fn remove_job(&self, id: JobId) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        Ok(inner.jobs.remove(&id).is_some())
    }

    async fn complete_job(
        &self,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(StorageError::op("COMPLETE_JOB", Some(id), "job not found"));
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.progress = 100;
        job.result = result;
        Ok(true)
    }

    async fn fail_job(&self, id: JobId, error: JobError) -> StorageResult<Option<FailOutcome>> {
        let mut inner = self.inner.lock();
        let queue_name;
        let outcome;
        let requeue_score;
        {
            let Some(job) = inner.jobs.get_mut(&id) else {
                return Err(StorageError::op("FAIL_JOB", Some(id), "job not found"));
            };
            if job.status != JobStatus::Running {
                return Ok(None);
            }
            if job.retries_exhausted() {
                job.status = JobStatus::Failed;
                job.failed_at = Some(Utc::now());
                job.error = Some(error);
                outcome = FailOutcome::FailedTerminally;
                requeue_score = None;
                queue_name = job.queue_name.clone();
            } else {
                job.retries += 1;
                job.status = JobStatus::Queued;
                job.started_at = None;
                job.progress = 0;
                job.progress_message = None;
                job.error = Some(error);
                outcome = FailOutcome::Retried;
                queue_name = job.queue_name.clone();
                requeue_score = Some(job.score()); // queued_at preserved: same score as original enqueue
            }
        }
        if let Some(score) = requeue_score {
            inner
                .queued
                .entry(queue_name)
                .or_default()
                .push(ScoredId { score, id });
        }
        Ok(Some(outcome))
    }

    async fn fail_job_terminal(&self, id: JobId, error: JobError) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Err(StorageError::op("FAIL_JOB", Some(id), "job not found"));
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.failed_at = Some(Utc::now());
        job.error = Some(error);
        Ok(true)
    }

    async fn cancel_job(&self, id: JobId) -> StorageResult<bool> {
        let mut inner = self.inner.lock();
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        Ok(true)
    }

    async fn queue_stats(&self, queue_name: &str) -> StorageResult<QueueStats> {
        let inner = self.inner.lock();
        let mut stats = QueueStats::default();
        for job in inner.jobs.values().filter(|j| j.queue_name == queue_name) {
            stats.total += 1;
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
                JobStatus::Cancelled => stats.cancelled += 1,
            }
        }
        Ok(stats)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        Ok(HealthStatus {
            healthy: true,
            latency_ms: Some(0.0),
            detail: None,
        })
    }
}
