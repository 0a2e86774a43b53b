use std::env;
use std::time::Duration;

/// Relay tunables, read from the environment at startup.  Every duration is
/// given in seconds unless the variable name says otherwise.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    pub database_url: Option<String>,
    /// Unset means single-instance mode: the in-process bus replaces Redis.
    pub redis_url: Option<String>,
    /// Viewers consider a producer connected while its catalog row is younger
    /// than this.
    pub liveness_window: Duration,
    /// Idle-read timeout per socket; also the local eviction threshold.
    pub heartbeat_timeout: Duration,
    /// Catalog rows older than this are pruned by any instance's janitor.
    /// Must stay strictly greater than `heartbeat_timeout`.
    pub grace_window: Duration,
    pub janitor_period: Duration,
    /// A streaming producer with no frames for this long drops back to idle.
    pub idle_stream_window: Duration,
    /// Per-write deadline on every outbound socket send.
    pub write_deadline: Duration,
    /// Frames buffered per (producer, monitor) per viewer before drop-oldest.
    pub frame_queue_depth: usize,
    /// Hard limit on the lossless control queue; overflowing it disconnects
    /// the viewer as a slow consumer.
    pub control_queue_limit: usize,
    pub streaming_command_ttl: Duration,
    pub action_command_ttl: Duration,
    pub idempotency_window: Duration,
    pub poll_batch_limit: u32,
    /// How often a command result watcher re-reads the store.
    pub result_poll_interval: Duration,
    pub protocol_error_limit: u32,
    pub protocol_error_window: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_owned(),
            database_url: None,
            redis_url: None,
            liveness_window: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            grace_window: Duration::from_secs(60),
            janitor_period: Duration::from_secs(10),
            idle_stream_window: Duration::from_secs(10),
            write_deadline: Duration::from_secs(5),
            frame_queue_depth: 8,
            control_queue_limit: 256,
            streaming_command_ttl: Duration::from_secs(30),
            action_command_ttl: Duration::from_secs(15),
            idempotency_window: Duration::from_secs(300),
            poll_batch_limit: 32,
            result_poll_interval: Duration::from_millis(250),
            protocol_error_limit: 10,
            protocol_error_window: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("BIND_ADDR", &defaults.bind_addr),
            database_url: env::var("DATABASE_URL").ok(),
            redis_url: env::var("REDIS_URL").ok(),
            liveness_window: env_secs("LIVENESS_WINDOW_SECS", defaults.liveness_window),
            heartbeat_timeout: env_secs("HEARTBEAT_TIMEOUT_SECS", defaults.heartbeat_timeout),
            grace_window: env_secs("GRACE_WINDOW_SECS", defaults.grace_window),
            janitor_period: env_secs("JANITOR_PERIOD_SECS", defaults.janitor_period),
            idle_stream_window: env_secs("IDLE_STREAM_WINDOW_SECS", defaults.idle_stream_window),
            write_deadline: env_secs("WRITE_DEADLINE_SECS", defaults.write_deadline),
            frame_queue_depth: env_usize("FRAME_QUEUE_DEPTH", defaults.frame_queue_depth),
            control_queue_limit: env_usize("CONTROL_QUEUE_LIMIT", defaults.control_queue_limit),
            streaming_command_ttl: env_secs(
                "STREAMING_COMMAND_TTL_SECS",
                defaults.streaming_command_ttl,
            ),
            action_command_ttl: env_secs("ACTION_COMMAND_TTL_SECS", defaults.action_command_ttl),
            idempotency_window: env_secs("IDEMPOTENCY_WINDOW_SECS", defaults.idempotency_window),
            poll_batch_limit: env_u32("POLL_BATCH_LIMIT", defaults.poll_batch_limit),
            result_poll_interval: defaults.result_poll_interval,
            protocol_error_limit: defaults.protocol_error_limit,
            protocol_error_window: defaults.protocol_error_window,
        }
    }

    /// TTL for a command's pending window, by kind class.
    pub fn command_ttl(&self, kind: relay_protocol::CommandKind) -> Duration {
        if kind.is_streaming_control() {
            self.streaming_command_ttl
        } else {
            self.action_command_ttl
        }
    }

    pub fn liveness_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.liveness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    pub fn grace_window_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.grace_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
    }
}

fn env_string(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}
