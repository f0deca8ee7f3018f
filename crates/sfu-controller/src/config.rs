//! SFU controller configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use secrecy::SecretString;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default WebSocket signaling bind address.
pub const DEFAULT_SIGNALING_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default health endpoint bind address.
pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";

/// Default first WebRTC server port. Worker `i` listens on `base + i`.
pub const DEFAULT_WEBRTC_PORT_BASE: u16 = 40000;

/// Default RTC port range handed to each worker.
pub const DEFAULT_RTC_MIN_PORT: u16 = 10000;
pub const DEFAULT_RTC_MAX_PORT: u16 = 59999;

/// Default CPU load sample interval in milliseconds.
pub const DEFAULT_LOAD_SAMPLE_INTERVAL_MS: u64 = 5000;

/// Default delay between a worker death and process exit, in milliseconds.
pub const DEFAULT_WORKER_DEATH_GRACE_MS: u64 = 2000;

/// Default cap on concurrent WebSocket connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Default maximum inbound WebSocket message size in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Default graceful shutdown budget in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECONDS: u64 = 30;

/// Default SFU instance ID prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "sfu";

/// SFU controller configuration.
///
/// Loaded from environment variables with sensible defaults.
/// Sensitive fields are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Redis connection URL (identity, permissions and membership).
    /// Protected by `SecretString` to prevent accidental logging.
    pub redis_url: SecretString,

    /// WebSocket signaling bind address (default: "0.0.0.0:3000").
    pub signaling_bind_address: String,

    /// Health and metrics bind address (default: "0.0.0.0:8081").
    pub health_bind_address: String,

    /// Unique identifier for this SFU instance.
    pub instance_id: String,

    /// Number of media engine workers. Fixed for the process lifetime.
    pub num_workers: usize,

    /// First WebRTC server port.
    pub webrtc_port_base: u16,

    pub rtc_min_port: u16,
    pub rtc_max_port: u16,

    /// Public address announced in ICE candidates.
    pub announced_address: Option<String>,

    pub load_sample_interval: Duration,

    /// Grace delay before exiting on worker death, for log flush.
    pub worker_death_grace: Duration,

    pub max_connections: usize,
    pub max_message_bytes: usize,

    /// Whether joining participants may get a producer transport at all.
    pub allow_produce: bool,

    /// Whether joining participants get a consumer transport.
    pub allow_consume: bool,

    pub shutdown_timeout: Duration,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("redis_url", &"[REDACTED]")
            .field("signaling_bind_address", &self.signaling_bind_address)
            .field("health_bind_address", &self.health_bind_address)
            .field("instance_id", &self.instance_id)
            .field("num_workers", &self.num_workers)
            .field("webrtc_port_base", &self.webrtc_port_base)
            .field("rtc_min_port", &self.rtc_min_port)
            .field("rtc_max_port", &self.rtc_max_port)
            .field("announced_address", &self.announced_address)
            .field("load_sample_interval", &self.load_sample_interval)
            .field("worker_death_grace", &self.worker_death_grace)
            .field("max_connections", &self.max_connections)
            .field("max_message_bytes", &self.max_message_bytes)
            .field("allow_produce", &self.allow_produce)
            .field("allow_consume", &self.allow_consume)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let redis_url = SecretString::from(
            vars.get("REDIS_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?
                .clone(),
        );

        let signaling_bind_address = vars
            .get("SFU_SIGNALING_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SIGNALING_BIND_ADDRESS.to_string());

        let health_bind_address = vars
            .get("SFU_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let num_workers = vars
            .get("SFU_NUM_WORKERS")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(std::num::NonZeroUsize::get)
                    .unwrap_or(1)
            });
        if num_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_NUM_WORKERS must be greater than zero".to_string(),
            ));
        }

        let webrtc_port_base: u16 = vars
            .get("SFU_WEBRTC_PORT_BASE")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WEBRTC_PORT_BASE);
        let last_port = u16::try_from(num_workers - 1)
            .ok()
            .and_then(|offset| webrtc_port_base.checked_add(offset));
        if last_port.is_none() {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_WEBRTC_PORT_BASE {webrtc_port_base} leaves no room for {num_workers} workers"
            )));
        }

        let rtc_min_port = vars
            .get("SFU_RTC_MIN_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_MIN_PORT);
        let rtc_max_port = vars
            .get("SFU_RTC_MAX_PORT")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RTC_MAX_PORT);
        if rtc_min_port > rtc_max_port {
            return Err(ConfigError::InvalidValue(format!(
                "SFU_RTC_MIN_PORT {rtc_min_port} is above SFU_RTC_MAX_PORT {rtc_max_port}"
            )));
        }

        let announced_address = vars
            .get("SFU_ANNOUNCED_ADDRESS")
            .filter(|s| !s.is_empty())
            .cloned();

        let load_sample_interval_ms = vars
            .get("SFU_LOAD_SAMPLE_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_LOAD_SAMPLE_INTERVAL_MS);
        if load_sample_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "SFU_LOAD_SAMPLE_INTERVAL_MS must be greater than zero".to_string(),
            ));
        }

        let worker_death_grace_ms = vars
            .get("SFU_WORKER_DEATH_GRACE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_WORKER_DEATH_GRACE_MS);

        let max_connections = vars
            .get("SFU_MAX_CONNECTIONS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS);

        let max_message_bytes = vars
            .get("SFU_MAX_MESSAGE_BYTES")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);

        let allow_produce = vars
            .get("SFU_ALLOW_PRODUCE")
            .and_then(|s| parse_bool(s))
            .unwrap_or(true);

        let allow_consume = vars
            .get("SFU_ALLOW_CONSUME")
            .and_then(|s| parse_bool(s))
            .unwrap_or(true);

        let shutdown_timeout_seconds = vars
            .get("SFU_SHUTDOWN_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECONDS);

        // Generate SFU instance ID
        let instance_id = vars.get("SFU_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().simple().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            redis_url,
            signaling_bind_address,
            health_bind_address,
            instance_id,
            num_workers,
            webrtc_port_base,
            rtc_min_port,
            rtc_max_port,
            announced_address,
            load_sample_interval: Duration::from_millis(load_sample_interval_ms),
            worker_death_grace: Duration::from_millis(worker_death_grace_ms),
            max_connections,
            max_message_bytes,
            allow_produce,
            allow_consume,
            shutdown_timeout: Duration::from_secs(shutdown_timeout_seconds),
        })
    }
}
