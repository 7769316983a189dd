use std::env;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    profiled_env_opt(profile, key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub aws: AwsConfig,
    pub queue: QueueConfig,
    pub listener: ListenerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `LISTENER_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let profile = env_or("LISTENER_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Result<Self, ConfigError> {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Ok(Self {
            profile: p.to_string(),
            aws: AwsConfig::from_env_profiled(p),
            queue: QueueConfig::from_env_profiled(p),
            listener: ListenerConfig::from_env_profiled(p)?,
        })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  aws:       region={}, static_credentials={}, endpoint={}",
            self.aws.region,
            self.aws.has_static_credentials(),
            self.aws.endpoint_url.as_deref().unwrap_or("(default)")
        );
        tracing::info!(
            "  queue:     url={}, visibility_timeout_secs={}",
            if self.queue.queue_url.is_empty() { "(none)" } else { &self.queue.queue_url },
            self.queue.visibility_timeout_secs
        );
        tracing::info!(
            "  listener:  kind={}, concurrency={}, batch_size={}, prefetch={}..{}",
            self.listener.kind,
            self.listener.concurrency_level,
            self.listener.batch_size,
            self.listener.desired_min_prefetched_messages,
            self.listener.max_prefetched_messages
        );
    }

    /// Return a redacted view safe for status output (no secrets).
    pub fn redacted_summary(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "aws": {
                "region": self.aws.region,
                "static_credentials": self.aws.has_static_credentials(),
                "endpoint_url": self.aws.endpoint_url,
            },
            "queue": {
                "queue_url": self.queue.queue_url,
                "visibility_timeout_secs": self.queue.visibility_timeout_secs,
                "configured": self.queue.is_configured(),
            },
            "listener": self.listener,
        })
    }
}

// ── AWS ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwsConfig {
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing)]
    pub session_token: Option<String>,
    pub endpoint_url: Option<String>,
}

impl AwsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            region: profiled_env_or(p, "AWS_REGION", "us-east-1"),
            access_key_id: profiled_env_opt(p, "AWS_ACCESS_KEY_ID"),
            secret_access_key: profiled_env_opt(p, "AWS_SECRET_ACCESS_KEY"),
            session_token: profiled_env_opt(p, "AWS_SESSION_TOKEN"),
            // AWS_ENDPOINT_URL may point at another service (e.g. S3), only the
            // queue-specific key is honoured.
            endpoint_url: profiled_env_opt(p, "QUEUE_AWS_ENDPOINT_URL"),
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        self.access_key_id.is_some() && self.secret_access_key.is_some()
    }
}

// ── Queue ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub queue_url: String,
    /// Visibility timeout requested on receive. Zero leaves the queue default.
    pub visibility_timeout_secs: u32,
}

impl QueueConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            queue_url: profiled_env_or(p, "QUEUE_URL", ""),
            visibility_timeout_secs: profiled_env_u32(p, "QUEUE_VISIBILITY_TIMEOUT_SECS", 0),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.queue_url.is_empty()
    }

    /// Whether the queue URL names a FIFO queue.
    pub fn is_fifo(&self) -> bool {
        self.queue_url.ends_with(".fifo")
    }
}

// ── Listener ──────────────────────────────────────────────────

/// Which container preset the worker binary builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    Batching,
    Prefetching,
    Fifo,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerKind::Batching => "batching",
            ListenerKind::Prefetching => "prefetching",
            ListenerKind::Fifo => "fifo",
        };
        f.write_str(name)
    }
}

impl FromStr for ListenerKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "batching" | "basic" => Ok(ListenerKind::Batching),
            "prefetching" | "prefetch" => Ok(ListenerKind::Prefetching),
            "fifo" => Ok(ListenerKind::Fifo),
            other => Err(ConfigError::Invalid {
                key: "LISTENER_KIND".to_string(),
                reason: format!("unknown listener kind '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub identifier: String,
    pub kind: ListenerKind,
    pub concurrency_level: u32,
    pub batch_size: u32,
    pub batching_period_ms: u64,
    pub desired_min_prefetched_messages: u32,
    pub max_prefetched_messages: u32,
    pub error_backoff_ms: u64,
    pub resolver_buffering_size: u32,
    pub resolver_buffering_time_ms: u64,
    pub maximum_cached_message_groups: u32,
    pub interrupt_on_shutdown: bool,
    pub process_extra_messages_on_shutdown: bool,
    /// Auto visibility extension; disabled when zero.
    pub auto_extend_max_processing_secs: u64,
}

impl ListenerConfig {
    fn from_env_profiled(p: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            identifier: profiled_env_or(p, "LISTENER_IDENTIFIER", "sqs-listener"),
            kind: profiled_env_or(p, "LISTENER_KIND", "batching").parse()?,
            concurrency_level: profiled_env_u32(p, "LISTENER_CONCURRENCY", 5),
            batch_size: profiled_env_u32(p, "LISTENER_BATCH_SIZE", 5),
            batching_period_ms: profiled_env_u64(p, "LISTENER_BATCHING_PERIOD_MS", 2_000),
            desired_min_prefetched_messages: profiled_env_u32(p, "LISTENER_DESIRED_MIN_PREFETCHED", 10),
            max_prefetched_messages: profiled_env_u32(p, "LISTENER_MAX_PREFETCHED", 20),
            error_backoff_ms: profiled_env_u64(p, "LISTENER_ERROR_BACKOFF_MS", 10_000),
            resolver_buffering_size: profiled_env_u32(p, "LISTENER_RESOLVER_BUFFERING_SIZE", 10),
            resolver_buffering_time_ms: profiled_env_u64(p, "LISTENER_RESOLVER_BUFFERING_TIME_MS", 1_000),
            maximum_cached_message_groups: profiled_env_u32(p, "LISTENER_MAX_CACHED_GROUPS", 10),
            interrupt_on_shutdown: profiled_env_bool(p, "LISTENER_INTERRUPT_ON_SHUTDOWN", false),
            process_extra_messages_on_shutdown: profiled_env_bool(p, "LISTENER_PROCESS_EXTRA_ON_SHUTDOWN", true),
            auto_extend_max_processing_secs: profiled_env_u64(p, "LISTENER_AUTO_EXTEND_MAX_SECS", 0),
        })
    }
}
