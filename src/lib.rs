//! A multi-queue background job scheduling core: typed job submission
//! against per-queue concurrency limits, a pluggable storage adapter with
//! an in-memory reference implementation and a distributed (Redis-backed)
//! one, a circuit-breaker-guarded event bus for cross-process fan-out, and
//! a connection supervisor for the distributed backend's channels.
//!
//! ## Quick start
//!
//! ```rust
//! use jobqueue_core::config::QueueConfig;
//! use jobqueue_core::job::AddJobOptions;
//! use jobqueue_core::registry::{HandlerRegistry, JobContext};
//! use jobqueue_core::service::QueueService;
//! use jobqueue_core::storage::MemoryStorage;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let mut registry = HandlerRegistry::new();
//! registry
//!     .register("emails", "send", |ctx: JobContext| async move {
//!         Ok(json!({ "sent_to": ctx.data["to"] }))
//!     })
//!     .unwrap();
//!
//! let storage = Arc::new(MemoryStorage::new());
//! let service = QueueService::new(
//!     vec![jobqueue_core::config::QueueConfigBuilder::testing("emails").build().unwrap()],
//!     registry,
//!     storage,
//! );
//! service.start_all();
//!
//! let id = service
//!     .add("emails", "send", json!({"to": "user@example.com"}), AddJobOptions::default())
//!     .await
//!     .unwrap();
//!
//! // poll until the processing loop picks the job up and runs it to completion
//! let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(2);
//! loop {
//!     let job = service.get_job(id, Some("emails")).await.unwrap().unwrap();
//!     if job.status.is_terminal() {
//!         assert_eq!(job.status, jobqueue_core::job::JobStatus::Completed);
//!         break;
//!     }
//!     assert!(tokio::time::Instant::now() < deadline, "job never completed");
//!     tokio::time::sleep(std::time::Duration::from_millis(5)).await;
//! }
//! # });
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod event_bus;
pub mod job;
pub mod queue;
pub mod registry;
pub mod service;
pub mod storage;
pub mod supervisor;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitError};
pub use config::{QueueConfig, QueueConfigBuilder};
pub use event_bus::{EventBus, EventBusError, EventEnvelope, LocalEventBus};
pub use job::{AddJobOptions, Job, JobError, JobId, JobStatus};
pub use queue::{JobEvent, QueueError, QueueInstance, StopOutcome};
pub use registry::{HandlerRegistry, JobContext, JobDefinition, JobHandler, RegistryError};
pub use service::{QueueService, ServiceError, SubscribeCallbacks};
pub use storage::{FailOutcome, HealthStatus, JobFilter, JobPatch, QueueStats, StorageAdapter, StorageError};
pub use supervisor::{ConnectionConfig, ConnectionFailureKind, ConnectionSupervisor, SupervisorError};
