//! Connection supervisor (spec §4.7): owns the three logical connections to
//! a distributed backend — data (request/response), publisher, subscriber —
//! validates configuration eagerly, reconnects with exponential backoff,
//! and classifies startup failures. Grounded on `rcommerce-core`'s
//! `cache::connection::RedisPool`: the reconnect-loop/state-tracking shape
//! is the same, generalized from one pooled connection to three named
//! channels that rise and fall together.

use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Reconnection gives up after this many attempts (spec §4.7).
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Connection configuration (spec §4.7 "Validates configuration eagerly").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct ConnectionConfig {
    #[builder(getter)]
    pub host: String,
    #[builder(default = "6379", getter)]
    pub port: u16,
    #[builder(default = "0", getter)]
    pub db: i64,
    #[builder(default = "10_000", getter)]
    pub connect_timeout_ms: u64,
    #[builder(default = "5_000", getter)]
    pub command_timeout_ms: u64,
    #[builder(default = "3", getter)]
    pub max_retries_per_request: u32,
    #[builder(default = "false", getter)]
    pub tls: bool,
    #[builder(default = "None", getter)]
    pub password: Option<String>,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>) -> Self {
        ConnectionConfigBuilder::new()
            .host(host.into())
            .build()
            .expect("host is the only required field")
    }

    /// Validates host non-empty, port in `1..65535`, db non-negative (spec
    /// §4.7). Called eagerly by `ConnectionSupervisor::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::InvalidField {
                field: "host",
                reason: "must not be empty".into(),
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidField {
                field: "port",
                reason: "must be in 1..65535".into(),
            });
        }
        if self.db < 0 {
            return Err(ConfigError::InvalidField {
                field: "db",
                reason: "must be non-negative".into(),
            });
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid connection config field {field:?}: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Classification of a failed connection attempt (spec §4.7, §7
/// "ConnectionError").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    ConnectionRefused,
    Timeout,
    AuthFailed,
    Unknown,
}

impl ConnectionFailureKind {
    /// Best-effort classification from a lower-level transport error
    /// message. Real transports (e.g. `redis::RedisError`) expose a typed
    /// `kind()`; this falls back to substring sniffing when given only a
    /// display string, which is what the in-process test double below
    /// produces.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        if lower.contains("refused") {
            ConnectionFailureKind::ConnectionRefused
        } else if lower.contains("timed out") || lower.contains("timeout") {
            ConnectionFailureKind::Timeout
        } else if lower.contains("auth") || lower.contains("noauth") || lower.contains("wrongpass") {
            ConnectionFailureKind::AuthFailed
        } else {
            ConnectionFailureKind::Unknown
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("connection failed ({kind:?}) to {host}:{port}: {message}")]
    Connection {
        kind: ConnectionFailureKind,
        host: String,
        port: u16,
        message: String,
    },

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChannelState {
    Connected,
    Reconnecting,
    Failed,
}

/// The outcome of a health check (spec §4.7 "Exposes a health check that
/// returns latency on success").
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub detail: Option<String>,
}

/// A factory abstracting "open one of the three logical connections" so
/// this module stays free of a hard dependency on any one transport crate.
/// A real deployment supplies a closure that opens a `redis::aio::Connection`
/// (or publisher/subscriber variant thereof); tests supply an in-memory
/// stand-in.
pub type ConnectFn = Arc<dyn Fn() -> Result<(), SupervisorError> + Send + Sync>;

struct Channel {
    name: &'static str,
    connect: ConnectFn,
    state: RwLock<ChannelState>,
}

impl Channel {
    async fn connect_with_backoff(&self, max_attempts: u32) -> Result<(), SupervisorError> {
        *self.state.write().await = ChannelState::Reconnecting;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match (self.connect)() {
                Ok(()) => {
                    *self.state.write().await = ChannelState::Connected;
                    info!(channel = self.name, attempt, "connected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(channel = self.name, attempt, error = %err, "connection attempt failed");
                    if attempt >= max_attempts {
                        *self.state.write().await = ChannelState::Failed;
                        error!(channel = self.name, attempts = attempt, "giving up reconnecting");
                        return Err(err);
                    }
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
            }
        }
    }

    async fn teardown(&self) {
        *self.state.write().await = ChannelState::Failed;
        debug!(channel = self.name, "torn down");
    }

    async fn is_connected(&self) -> bool {
        *self.state.read().await == ChannelState::Connected
    }
}

/// `min(100 * 2^attempt, 3000)` ms (spec §4.7's default reconnection
/// backoff).
fn backoff_delay(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.min(10));
    Duration::from_millis(millis.min(3000))
}

/// Owns the data/publisher/subscriber channels as a unit: they connect
/// together at startup and are torn down together on any failure (spec
/// §4.7 "Tears down all three channels on any failure during startup").
pub struct ConnectionSupervisor {
    config: ConnectionConfig,
    data: Channel,
    publisher: Channel,
    subscriber: Channel,
    reconnect_count: AtomicU32,
}

impl ConnectionSupervisor {
    /// Validates `config`, then connects all three channels using the
    /// given per-channel connect functions. On any failure, tears down
    /// whichever channels had already connected and returns the
    /// classified error.
    pub async fn start(
        config: ConnectionConfig,
        data_connect: ConnectFn,
        publisher_connect: ConnectFn,
        subscriber_connect: ConnectFn,
    ) -> Result<Self, SupervisorError> {
        Self::start_with_max_attempts(config, data_connect, publisher_connect, subscriber_connect, MAX_RECONNECT_ATTEMPTS).await
    }

    async fn start_with_max_attempts(
        config: ConnectionConfig,
        data_connect: ConnectFn,
        publisher_connect: ConnectFn,
        subscriber_connect: ConnectFn,
        max_attempts: u32,
    ) -> Result<Self, SupervisorError> {
        config.validate()?;

        let supervisor = Self {
            config,
            data: Channel { name: "data", connect: data_connect, state: RwLock::new(ChannelState::Failed) },
            publisher: Channel { name: "publisher", connect: publisher_connect, state: RwLock::new(ChannelState::Failed) },
            subscriber: Channel { name: "subscriber", connect: subscriber_connect, state: RwLock::new(ChannelState::Failed) },
            reconnect_count: AtomicU32::new(0),
        };

        for channel in [&supervisor.data, &supervisor.publisher, &supervisor.subscriber] {
            if let Err(err) = channel.connect_with_backoff(max_attempts).await {
                supervisor.teardown_all().await;
                return Err(err);
            }
        }

        Ok(supervisor)
    }

    async fn teardown_all(&self) {
        self.data.teardown().await;
        self.publisher.teardown().await;
        self.subscriber.teardown().await;
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Reconnects whichever channels are not currently connected,
    /// incrementing the supervisor's lifetime reconnect counter on each
    /// successful reconnect.
    pub async fn reconnect_if_needed(&self) -> Result<(), SupervisorError> {
        for channel in [&self.data, &self.publisher, &self.subscriber] {
            if !channel.is_connected().await {
                channel.connect_with_backoff(MAX_RECONNECT_ATTEMPTS).await?;
                self.reconnect_count.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    pub async fn health_check(&self) -> HealthCheck {
        let all_connected = self.data.is_connected().await
            && self.publisher.is_connected().await
            && self.subscriber.is_connected().await;
        if !all_connected {
            return HealthCheck {
                healthy: false,
                latency_ms: None,
                detail: Some("one or more channels disconnected".into()),
            };
        }
        let started = Instant::now();
        let ping = (self.data.connect)();
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match ping {
            Ok(()) => HealthCheck { healthy: true, latency_ms: Some(latency_ms), detail: None },
            Err(err) => HealthCheck { healthy: false, latency_ms: None, detail: Some(err.to_string()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn always_ok() -> ConnectFn {
        Arc::new(|| Ok(()))
    }

    fn fails_n_times(n: usize) -> ConnectFn {
        let calls = Arc::new(AtomicUsize::new(0));
        Arc::new(move || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            if attempt < n {
                Err(SupervisorError::Connection {
                    kind: ConnectionFailureKind::ConnectionRefused,
                    host: "localhost".into(),
                    port: 6379,
                    message: "connection refused".into(),
                })
            } else {
                Ok(())
            }
        })
    }

    fn always_fails() -> ConnectFn {
        Arc::new(|| {
            Err(SupervisorError::Connection {
                kind: ConnectionFailureKind::Unknown,
                host: "localhost".into(),
                port: 6379,
                message: "boom".into(),
            })
        })
    }

    #[test]
    fn rejects_empty_host() {
        let config = ConnectionConfigBuilder::new().host("").build().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_negative_db() {
        let config = ConnectionConfigBuilder::new().host("localhost").db(-1).build().unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn defaults_match_spec() {
        let config = ConnectionConfig::new("localhost");
        assert_eq!(config.port, 6379);
        assert_eq!(config.db, 0);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.command_timeout_ms, 5_000);
        assert_eq!(config.max_retries_per_request, 3);
        assert!(!config.tls);
    }

    #[test]
    fn backoff_caps_at_3000ms() {
        assert_eq!(backoff_delay(0), Duration::from_millis(100));
        assert_eq!(backoff_delay(1), Duration::from_millis(200));
        assert_eq!(backoff_delay(5), Duration::from_millis(3000));
        assert_eq!(backoff_delay(20), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn starts_successfully_when_all_channels_connect() {
        let supervisor = ConnectionSupervisor::start(
            ConnectionConfig::new("localhost"),
            always_ok(),
            always_ok(),
            always_ok(),
        )
        .await
        .unwrap();
        let health = supervisor.health_check().await;
        assert!(health.healthy);
        assert!(health.latency_ms.is_some());
    }

    #[tokio::test]
    async fn retries_transient_failures_then_succeeds() {
        let supervisor = ConnectionSupervisor::start(
            ConnectionConfig::new("localhost"),
            fails_n_times(2),
            always_ok(),
            always_ok(),
        )
        .await
        .unwrap();
        assert!(supervisor.health_check().await.healthy);
    }

    #[tokio::test]
    async fn tears_down_all_channels_on_startup_failure() {
        let result = ConnectionSupervisor::start_with_max_attempts(
            ConnectionConfig::new("localhost"),
            always_ok(),
            always_fails(),
            always_ok(),
            1,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn classifies_known_failure_shapes() {
        assert_eq!(ConnectionFailureKind::classify("connection refused"), ConnectionFailureKind::ConnectionRefused);
        assert_eq!(ConnectionFailureKind::classify("operation timed out"), ConnectionFailureKind::Timeout);
        assert_eq!(ConnectionFailureKind::classify("WRONGPASS invalid username"), ConnectionFailureKind::AuthFailed);
        assert_eq!(ConnectionFailureKind::classify("something else"), ConnectionFailureKind::Unknown);
    }
}
