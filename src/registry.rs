//! Handler registry & job definitions (spec §4.6): a read-only-after-
//! construction binding of `(queue_name, job_type) -> {input_schema,
//! output_schema, handler}`. The schema contract mirrors
//! `elif-validation`'s `Validate` trait shape (a value in, a list of
//! `{path, message}` errors out) rather than committing to one schema
//! library.

use crate::job::{Job, JobId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// One `{path, message}` validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Any validator exposing `safe_parse`: ok with the (possibly coerced)
/// value, or a list of field errors. Implementations are expected to be
/// cheap and side-effect free.
pub trait SchemaValidator: Send + Sync {
    fn safe_parse(&self, value: &Value) -> Result<Value, Vec<FieldError>>;
}

/// Accepts any payload unchanged. The default for job types that don't
/// register a stricter schema, and for output schemas (the core never
/// validates handler results against them — that's an application concern
/// the edge can opt into).
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissiveSchema;

impl SchemaValidator for PermissiveSchema {
    fn safe_parse(&self, value: &Value) -> Result<Value, Vec<FieldError>> {
        Ok(value.clone())
    }
}

/// The job context handed to a handler: identity, the (already-validated)
/// payload, a cancellation signal, and a progress reporter. `progress`
/// writes through to storage and is fire-and-forget from the handler's
/// point of view — failures are logged by the caller, not surfaced here,
/// since a handler shouldn't fail because progress reporting hiccuped.
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub queue_name: String,
    pub data: Value,
    pub cancelled: CancellationToken,
    progress_tx: tokio::sync::mpsc::UnboundedSender<(u8, Option<String>)>,
}

impl JobContext {
    pub fn new(
        job: &Job,
        cancelled: CancellationToken,
        progress_tx: tokio::sync::mpsc::UnboundedSender<(u8, Option<String>)>,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            queue_name: job.queue_name.clone(),
            data: job.data.clone(),
            cancelled,
            progress_tx,
        }
    }

    /// Report progress. `percent` is clamped into `0..=100`; monotonicity
    /// within an attempt is the caller's responsibility (spec §3).
    pub fn progress(&self, percent: u8, message: Option<String>) {
        let _ = self.progress_tx.send((percent.min(100), message));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.is_cancelled()
    }
}

/// A structured handler failure: carries the pieces `JobError` needs
/// (message, an optional machine-readable code, an optional stack/trace).
#[derive(Debug, Clone)]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl<E: std::error::Error> From<E> for HandlerError {
    fn from(err: E) -> Self {
        HandlerError::new(err.to_string())
    }
}

pub type HandlerResult = Result<Value, HandlerError>;

/// The application function bound to a job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> HandlerResult;
}

/// Blanket impl so a plain async closure can be registered directly,
/// mirroring the closure-processor convenience the teacher's worker
/// registry offered for its `Job` trait.
#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        self(ctx).await
    }
}

/// One `(queue, job_type)` binding: the schemas that gate submission and
/// the handler invoked at dispatch time.
pub struct JobDefinition {
    pub input_schema: Arc<dyn SchemaValidator>,
    pub output_schema: Arc<dyn SchemaValidator>,
    pub handler: Arc<dyn JobHandler>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("handler already registered for {queue}:{job_type}")]
    DuplicateHandler { queue: String, job_type: String },
}

/// `(queue_name, job_type) -> JobDefinition`. Read-only after construction
/// (spec §4.6, §9): there is no remove/replace, only `register`, which
/// rejects a duplicate key. Keeping registration one-shot avoids
/// half-registered states being visible to a concurrently-running queue.
#[derive(Default)]
pub struct HandlerRegistry {
    definitions: HashMap<(String, String), JobDefinition>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> Result<(), RegistryError> {
        self.register_with_schemas(
            queue_name,
            job_type,
            Arc::new(PermissiveSchema),
            Arc::new(PermissiveSchema),
            handler,
        )
    }

    pub fn register_with_schemas(
        &mut self,
        queue_name: impl Into<String>,
        job_type: impl Into<String>,
        input_schema: Arc<dyn SchemaValidator>,
        output_schema: Arc<dyn SchemaValidator>,
        handler: impl JobHandler + 'static,
    ) -> Result<(), RegistryError> {
        let queue_name = queue_name.into();
        let job_type = job_type.into();
        let key = (queue_name.clone(), job_type.clone());
        if self.definitions.contains_key(&key) {
            return Err(RegistryError::DuplicateHandler { queue: queue_name, job_type });
        }
        self.definitions.insert(
            key,
            JobDefinition {
                input_schema,
                output_schema,
                handler: Arc::new(handler),
            },
        );
        Ok(())
    }

    pub fn get(&self, queue_name: &str, job_type: &str) -> Option<&JobDefinition> {
        self.definitions
            .get(&(queue_name.to_string(), job_type.to_string()))
    }

    /// Job types registered for a given queue, for `HandlerNotFound` error
    /// context (spec §7).
    pub fn job_types_for(&self, queue_name: &str) -> Vec<String> {
        self.definitions
            .keys()
            .filter(|(q, _)| q == queue_name)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn register_and_dispatch() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("emails", "send", |ctx: JobContext| async move {
                Ok(json!({ "to": ctx.data["to"] }))
            })
            .unwrap();

        let def = registry.get("emails", "send").unwrap();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = JobContext {
            job_id: JobId::new_v4(),
            job_type: "send".into(),
            queue_name: "emails".into(),
            data: json!({"to": "a@b.com"}),
            cancelled: CancellationToken::new(),
            progress_tx: tx,
        };
        let result = def.handler.handle(ctx).await.unwrap();
        assert_eq!(result["to"], "a@b.com");
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "t", |_: JobContext| async { Ok(Value::Null) })
            .unwrap();
        let err = registry
            .register("q", "t", |_: JobContext| async { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateHandler { .. }));
    }

    #[test]
    fn job_types_for_queue() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("q", "a", |_: JobContext| async { Ok(Value::Null) })
            .unwrap();
        registry
            .register("q", "b", |_: JobContext| async { Ok(Value::Null) })
            .unwrap();
        registry
            .register("other", "c", |_: JobContext| async { Ok(Value::Null) })
            .unwrap();
        let mut types = registry.job_types_for("q");
        types.sort();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[test]
    fn permissive_schema_accepts_anything() {
        let schema = PermissiveSchema;
        assert!(schema.safe_parse(&json!({"whatever": 1})).is_ok());
    }
}
