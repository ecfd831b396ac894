//! One queue's processing loop (spec §4.4): concurrency control, job
//! lifecycle state machine, handler invocation under a race of {handler
//! future, timeout, cancellation}, progress reporting, event emission.
//! Storage is the single owner of the job record; this module only ever
//! fetches-then-writes-through, never caching a mutable copy (spec §9).

use crate::config::QueueConfig;
use crate::job::{Job, JobError, JobId};
use crate::registry::{HandlerRegistry, JobContext};
use crate::storage::{FailOutcome, StorageAdapter, StorageResult};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error("job {0} not found")]
    JobNotFound(JobId),
}

/// The event catalogue (spec §4.4), all scoped to a single queue.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Queued(Job),
    Started(Job),
    Progress {
        job_id: JobId,
        percent: u8,
        message: Option<String>,
    },
    Completed {
        job: Job,
        result: Option<Value>,
    },
    Failed {
        job: Job,
        error: JobError,
    },
    Cancelled {
        job: Job,
        reason: Option<String>,
    },
    Retry(Job),
}

impl JobEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEvent::Queued(j) | JobEvent::Started(j) | JobEvent::Retry(j) => j.id,
            JobEvent::Progress { job_id, .. } => *job_id,
            JobEvent::Completed { job, .. } => job.id,
            JobEvent::Failed { job, .. } => job.id,
            JobEvent::Cancelled { job, .. } => job.id,
        }
    }

    /// The hierarchical tag used for bus channels and pattern matching
    /// (spec §3/§6), e.g. `job:completed`.
    pub fn type_tag(&self) -> &'static str {
        match self {
            JobEvent::Queued(_) => "job:queued",
            JobEvent::Started(_) => "job:started",
            JobEvent::Progress { .. } => "job:progress",
            JobEvent::Completed { .. } => "job:completed",
            JobEvent::Failed { .. } => "job:failed",
            JobEvent::Cancelled { .. } => "job:cancelled",
            JobEvent::Retry(_) => "job:retry",
        }
    }
}

struct RunningAttempt {
    cancel: CancellationToken,
}

/// One queue's state: configuration, its slice of the shared handler
/// registry, the in-flight set (the sole source of truth for "how many
/// handlers are currently running"), and the running/shutting-down flags.
pub struct QueueInstance {
    config: QueueConfig,
    storage: Arc<dyn StorageAdapter>,
    registry: Arc<HandlerRegistry>,
    in_flight: Arc<DashMap<JobId, RunningAttempt>>,
    running: Arc<AtomicBool>,
    shutting_down: Arc<AtomicBool>,
    events: broadcast::Sender<JobEvent>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of `stop`: whether the queue drained within its deadline, and
/// how many attempts were still in flight when it returned.
#[derive(Debug, Clone, Copy)]
pub struct StopOutcome {
    pub drained: bool,
    pub remaining_in_flight: usize,
}

impl QueueInstance {
    pub fn new(config: QueueConfig, storage: Arc<dyn StorageAdapter>, registry: Arc<HandlerRegistry>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            storage,
            registry,
            in_flight: Arc::new(DashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            events,
            loop_handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Composes a job from defaults + overrides, persists it `queued`, and
    /// emits `job:queued`. Returns the assigned id.
    pub async fn add(
        &self,
        job_type: impl Into<String>,
        data: Value,
        options: crate::job::AddJobOptions,
    ) -> Result<JobId, QueueError> {
        let job = Job::new(
            job_type,
            self.config.name.clone(),
            data,
            self.config.default_timeout_ms,
            self.config.default_max_retries,
            options,
        );
        let id = job.id;
        self.storage.enqueue(job.clone()).await?;
        self.emit(JobEvent::Queued(job));
        Ok(id)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.storage.get_job(id).await?)
    }

    pub async fn list_jobs(&self, filter: crate::storage::JobFilter) -> Result<Vec<Job>, QueueError> {
        Ok(self.storage.list_jobs(&self.config.name, filter).await?)
    }

    pub async fn get_stats(&self) -> Result<crate::storage::QueueStats, QueueError> {
        Ok(self.storage.queue_stats(&self.config.name).await?)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Cancels a job. If it has a live running attempt its cancellation
    /// token is signalled; the storage transition to `cancelled` happens
    /// here, unconditionally, so the caller doesn't have to race the
    /// processing loop to find out whether the cancellation "took".
    pub async fn cancel_job(&self, id: JobId, reason: Option<String>) -> Result<bool, QueueError> {
        if let Some(attempt) = self.in_flight.get(&id) {
            attempt.cancel.cancel();
        }
        let cancelled = self.storage.cancel_job(id).await?;
        if cancelled {
            if let Some(job) = self.storage.get_job(id).await? {
                self.emit(JobEvent::Cancelled { job, reason });
            }
        }
        Ok(cancelled)
    }

    /// Idempotent: a second `start()` on an already-running instance is a
    /// no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_loop().await });
        // loop_handle is only ever written from here and from stop(); a
        // try_lock is safe because nothing else holds it across an await.
        if let Ok(mut slot) = self.loop_handle.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn run_loop(self: Arc<Self>) {
        info!(queue = %self.config.name, "processing loop started");
        while !self.shutting_down.load(Ordering::SeqCst) {
            if self.in_flight.len() >= self.config.concurrency {
                tokio::time::sleep(self.config.poll_interval).await;
                continue;
            }
            match self.storage.dequeue(&self.config.name).await {
                Ok(Some(job)) => {
                    let token = CancellationToken::new();
                    self.in_flight.insert(job.id, RunningAttempt { cancel: token.clone() });
                    self.emit(JobEvent::Started(job.clone()));
                    let this = self.clone();
                    tokio::spawn(async move { this.execute_job(job, token).await });
                }
                Ok(None) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                Err(err) => {
                    warn!(queue = %self.config.name, error = %err, "dequeue failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.config.name, "processing loop stopped");
    }

    async fn execute_job(self: Arc<Self>, job: Job, cancel: CancellationToken) {
        let span = tracing::info_span!("job", id = %job.id, job_type = %job.job_type, queue = %self.config.name);
        async {
            let Some(definition) = self.registry.get(&self.config.name, &job.job_type) else {
                let error = JobError::new("HANDLER_NOT_FOUND", format!(
                    "no handler registered for {}:{}",
                    self.config.name, job.job_type
                ));
                match self.storage.fail_job_terminal(job.id, error.clone()).await {
                    Ok(_) => {
                        if let Ok(Some(job)) = self.storage.get_job(job.id).await {
                            self.emit(JobEvent::Failed { job, error });
                        }
                    }
                    Err(err) => warn!(error = %err, "failed to record HANDLER_NOT_FOUND"),
                }
                self.in_flight.remove(&job.id);
                return;
            };
            let handler = definition.handler.clone();

            let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
            let ctx = JobContext::new(&job, cancel.clone(), progress_tx);

            let timeout = Duration::from_millis(job.timeout_ms);
            let progress_storage = self.storage.clone();
            let progress_events = self.events.clone();
            let job_id = job.id;
            let progress_task = tokio::spawn(async move {
                while let Some((percent, message)) = progress_rx.recv().await {
                    let _ = progress_storage
                        .update_job(
                            job_id,
                            crate::storage::JobPatch {
                                progress: Some(percent),
                                progress_message: message.clone(),
                                ..Default::default()
                            },
                        )
                        .await;
                    let _ = progress_events.send(JobEvent::Progress { job_id, percent, message });
                }
            });

            let handler_future = handler.handle(ctx);
            tokio::pin!(handler_future);
            let sleep = tokio::time::sleep(timeout);
            tokio::pin!(sleep);
            // `cancel` is signalled both by an explicit `cancel_job` (which
            // transitions the storage record to `cancelled` *before*
            // signalling) and by a forceful queue shutdown (which only
            // requests cooperation — spec §5: handlers "run to completion or
            // until they consult their signal"). The branch below tells them
            // apart by checking storage; once it has confirmed a firing was
            // shutdown-only noise, it stops polling that branch so the loop
            // doesn't spin, and keeps racing the still-pinned handler future
            // against the timeout exactly as if no signal had fired.
            let mut cancel_is_shutdown_only = false;
            loop {
                tokio::select! {
                    result = &mut handler_future => {
                        progress_task.abort();
                        match result {
                            Ok(value) => {
                                match self.storage.complete_job(job.id, Some(value.clone())).await {
                                    Ok(true) => {
                                        if let Ok(Some(job)) = self.storage.get_job(job.id).await {
                                            self.emit(JobEvent::Completed { job, result: Some(value) });
                                        }
                                    }
                                    Ok(false) => debug!(id = %job.id, "complete_job no-op: not running"),
                                    Err(err) => warn!(error = %err, "complete_job failed"),
                                }
                            }
                            Err(handler_err) => {
                                let error = JobError {
                                    message: handler_err.message,
                                    code: handler_err.code.unwrap_or_else(|| "HANDLER_ERROR".to_string()),
                                    stack: handler_err.stack,
                                };
                                self.record_failure(job.id, error).await;
                            }
                        }
                        break;
                    }
                    _ = &mut sleep => {
                        progress_task.abort();
                        let error = JobError::new("JOB_TIMEOUT", format!("exceeded {}ms", job.timeout_ms));
                        self.record_failure(job.id, error).await;
                        break;
                    }
                    _ = cancel.cancelled(), if !cancel_is_shutdown_only => {
                        match self.storage.get_job(job.id).await {
                            Ok(Some(current)) if current.status == crate::job::JobStatus::Cancelled => {
                                progress_task.abort();
                                break;
                            }
                            _ => {
                                // Forceful shutdown, not a job-level cancel:
                                // the job is still `running`. Leave the
                                // handler running; keep racing it and the
                                // timeout, same as if nothing had fired.
                                cancel_is_shutdown_only = true;
                            }
                        }
                    }
                }
            }
            self.in_flight.remove(&job.id);
        }
        .instrument(span)
        .await;
    }

    /// Routes every attempt failure — handler error or timeout alike —
    /// through the adapter's retry-or-terminal decision (the REDESIGN this
    /// crate adopts per spec §9: one path, not a special-cased timeout).
    async fn record_failure(&self, id: JobId, error: JobError) {
        match self.storage.fail_job(id, error.clone()).await {
            Ok(Some(FailOutcome::Retried)) => {
                if let Ok(Some(job)) = self.storage.get_job(id).await {
                    self.emit(JobEvent::Retry(job));
                }
            }
            Ok(Some(FailOutcome::FailedTerminally)) => {
                if let Ok(Some(job)) = self.storage.get_job(id).await {
                    self.emit(JobEvent::Failed { job, error });
                }
            }
            Ok(None) => debug!(%id, "fail_job no-op: not running"),
            Err(err) => warn!(error = %err, "fail_job failed"),
        }
    }

    /// Idempotent. Graceful (the default) waits for the in-flight set to
    /// drain up to `timeout`; non-graceful signals every in-flight
    /// cancellation token and returns immediately without waiting — the
    /// signal only asks handlers to cooperate (`execute_job` tells this
    /// apart from an explicit `cancel_job` by checking storage before
    /// treating the signal as terminal), so in-flight attempts keep running
    /// to completion rather than being dropped.
    pub async fn stop(&self, graceful: bool, timeout: Duration) -> StopOutcome {
        self.shutting_down.store(true, Ordering::SeqCst);

        if !graceful {
            for entry in self.in_flight.iter() {
                entry.cancel.cancel();
            }
            self.running.store(false, Ordering::SeqCst);
            return StopOutcome {
                drained: self.in_flight.is_empty(),
                remaining_in_flight: self.in_flight.len(),
            };
        }

        let deadline = tokio::time::Instant::now() + timeout;
        while !self.in_flight.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let remaining = self.in_flight.len();
        self.running.store(false, Ordering::SeqCst);
        StopOutcome {
            drained: remaining == 0,
            remaining_in_flight: remaining,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is the common case before a service wires one up;
        // a send error there is not a bug.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::AddJobOptions;
    use crate::registry::HandlerError;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn instance(config: QueueConfig, registry: HandlerRegistry) -> Arc<QueueInstance> {
        Arc::new(QueueInstance::new(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(registry),
        ))
    }

    #[tokio::test]
    async fn add_then_process_to_completion() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "echo", |ctx: JobContext| async move { Ok(ctx.data) })
            .unwrap();
        let queue = instance(QueueConfig::new("q"), registry);
        let mut events = queue.subscribe();

        let id = queue
            .add("echo", json!({"x": 1}), AddJobOptions::default())
            .await
            .unwrap();
        queue.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            if let Ok(Some(job)) = queue.get_job(id).await {
                if job.status.is_terminal() {
                    assert_eq!(job.status, crate::job::JobStatus::Completed);
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "job never completed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mut saw_queued = false;
        let mut saw_started = false;
        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            match event {
                JobEvent::Queued(_) => saw_queued = true,
                JobEvent::Started(_) => saw_started = true,
                JobEvent::Completed { .. } => saw_completed = true,
                _ => {}
            }
        }
        assert!(saw_queued && saw_started && saw_completed);
    }

    #[tokio::test]
    async fn handler_not_found_fails_terminally() {
        let queue = instance(QueueConfig::new("q"), HandlerRegistry::new());
        let id = queue
            .add("ghost", json!({}), AddJobOptions::default())
            .await
            .unwrap();
        queue.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, crate::job::JobStatus::Failed);
                assert_eq!(job.error.unwrap().code, "HANDLER_NOT_FOUND");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn handler_error_retries_until_cap() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "flaky", move |_: JobContext| {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::new("boom"))
                }
            })
            .unwrap();
        let config = QueueConfigBuilderTesting::build();
        let queue = instance(config, registry);
        let id = queue
            .add(
                "flaky",
                json!({}),
                AddJobOptions { max_retries: Some(2), ..Default::default() },
            )
            .await
            .unwrap();
        queue.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, crate::job::JobStatus::Failed);
                assert_eq!(job.retries, 3);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_is_observed_by_handler() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "blocker", |ctx: JobContext| async move {
                ctx.cancelled.cancelled().await;
                Ok(json!(null))
            })
            .unwrap();
        let queue = instance(QueueConfig::new("q"), registry);
        let id = queue
            .add("blocker", json!({}), AddJobOptions::default())
            .await
            .unwrap();
        queue.start();

        // Wait until it's running, then cancel it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.status == crate::job::JobStatus::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.cancel_job(id, Some("user requested".into())).await.unwrap();

        let job = queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, crate::job::JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn concurrency_bound_never_exceeded() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "slow", |_: JobContext| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!(null))
            })
            .unwrap();
        let mut config = QueueConfig::new("q");
        config.concurrency = 2;
        let queue = instance(config, registry);
        for _ in 0..10 {
            queue.add("slow", json!({}), AddJobOptions::default()).await.unwrap();
        }
        queue.start();

        for _ in 0..50 {
            assert!(queue.in_flight_count() <= 2);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn forceful_stop_lets_running_handler_finish_instead_of_orphaning_it() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "slow", |_: JobContext| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({"done": true}))
            })
            .unwrap();
        let queue = instance(QueueConfig::new("q"), registry);
        let id = queue
            .add("slow", json!({}), AddJobOptions::default())
            .await
            .unwrap();
        queue.start();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.status == crate::job::JobStatus::Running {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Forceful stop must not drop the handler future or leave the job
        // stuck in `running`; it runs to completion and reaches a terminal
        // state on its own.
        let outcome = queue.stop(false, Duration::from_millis(0)).await;
        assert!(!outcome.drained);
        assert_eq!(outcome.remaining_in_flight, 1);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let job = queue.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, crate::job::JobStatus::Completed);
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "job never reached a terminal state");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // Helper so the retry test above can build a tight-poll config without
    // importing the builder module directly into the test body twice.
    struct QueueConfigBuilderTesting;
    impl QueueConfigBuilderTesting {
        fn build() -> QueueConfig {
            crate::config::QueueConfigBuilder::testing("q").build().unwrap()
        }
    }
}
