// Relay configuration
//
// Defaults come from environment variables; an optional TOML file is overlaid on top.
use crate::{RelayError, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Broker connection settings
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    /// The single topic carrying encoded power events
    pub topic: String,
    pub keep_alive: Duration,
    /// Upper bound for the initial connect; exceeding it is fatal
    pub connect_timeout: Duration,
    /// Pause between reconnect attempts after the connection drops
    pub reconnect_delay: Duration,
    /// Request channel capacity of the MQTT client
    pub channel_capacity: usize,
}

/// HTTP listener settings
#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
    /// Interval of SSE keep-alive comments on idle streams
    pub keep_alive_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub broker: BrokerConfig,
    pub http: HttpConfig,
    /// Bound on the whole shutdown sequence
    pub shutdown_grace: Duration,
    /// Default tracing directive when RUST_LOG is unset
    pub log_filter: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: env_or("POWERWATCH_MQTT_HOST", "localhost"),
            port: env_parse("POWERWATCH_MQTT_PORT", 1883),
            client_id: env_or("POWERWATCH_MQTT_CLIENT_ID", "server-sse-subscriber"),
            topic: env_or("POWERWATCH_TOPIC", "power-events"),
            keep_alive: Duration::from_secs(30),
            connect_timeout: env_millis("POWERWATCH_CONNECT_TIMEOUT_MS", 10_000),
            reconnect_delay: env_millis("POWERWATCH_RECONNECT_DELAY_MS", 1_000),
            channel_capacity: 10,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: env_or("POWERWATCH_HTTP_HOST", "0.0.0.0"),
            port: env_parse("POWERWATCH_HTTP_PORT", 5000),
            keep_alive_interval: Duration::from_secs(15),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            http: HttpConfig::default(),
            shutdown_grace: env_millis("POWERWATCH_SHUTDOWN_GRACE_MS", 5_000),
            log_filter: env_or("POWERWATCH_LOG", "info"),
        }
    }
}

impl HttpConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl RelayConfig {
    /// Load from `POWERWATCH_CONFIG` (or ./powerwatch.toml) over env defaults.
    /// A missing file is fine; a broken one is an error.
    pub fn load() -> Result<Self> {
        let path = env_or("POWERWATCH_CONFIG", "powerwatch.toml");
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        Self::overlay_file(path, Self::default())
    }

    /// Overlay the TOML file at `path` onto `base`. With no file, `base` alone
    /// is validated and returned.
    pub fn overlay_file(path: &Path, base: Self) -> Result<Self> {
        if !path.exists() {
            tracing::info!(target: "relay", path = %path.display(), "No TOML config found; using defaults/env");
            base.validate()?;
            return Ok(base);
        }
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text, base)
    }

    /// Overlay TOML text onto `base`
    pub fn from_toml_str(text: &str, base: Self) -> Result<Self> {
        let parsed: RelayToml =
            toml::from_str(text).map_err(|e| RelayError::Config(e.to_string()))?;
        parsed.overlay(base)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RelayToml {
    broker: Option<BrokerToml>,
    http: Option<HttpToml>,
    shutdown_grace_ms: Option<u64>,
    log_filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BrokerToml {
    host: Option<String>,
    port: Option<u16>,
    client_id: Option<String>,
    topic: Option<String>,
    keep_alive_secs: Option<u64>,
    connect_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpToml {
    host: Option<String>,
    port: Option<u16>,
    keep_alive_secs: Option<u64>,
}

impl RelayToml {
    fn overlay(self, mut base: RelayConfig) -> Result<RelayConfig> {
        if let Some(b) = self.broker {
            let cfg = &mut base.broker;
            if let Some(v) = b.host {
                cfg.host = v;
            }
            if let Some(v) = b.port {
                cfg.port = v;
            }
            if let Some(v) = b.client_id {
                cfg.client_id = v;
            }
            if let Some(v) = b.topic {
                cfg.topic = v;
            }
            if let Some(v) = b.keep_alive_secs {
                cfg.keep_alive = Duration::from_secs(v);
            }
            if let Some(v) = b.connect_timeout_ms {
                cfg.connect_timeout = Duration::from_millis(v);
            }
            if let Some(v) = b.reconnect_delay_ms {
                cfg.reconnect_delay = Duration::from_millis(v);
            }
            if let Some(v) = b.channel_capacity {
                cfg.channel_capacity = v;
            }
        }
        if let Some(h) = self.http {
            if let Some(v) = h.host {
                base.http.host = v;
            }
            if let Some(v) = h.port {
                base.http.port = v;
            }
            if let Some(v) = h.keep_alive_secs {
                base.http.keep_alive_interval = Duration::from_secs(v);
            }
        }
        if let Some(v) = self.shutdown_grace_ms {
            base.shutdown_grace = Duration::from_millis(v);
        }
        if let Some(v) = self.log_filter {
            base.log_filter = v;
        }
        base.validate()?;
        Ok(base)
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broker.topic.trim().is_empty() {
            return Err(RelayError::Config("broker.topic must not be empty".into()));
        }
        if self.broker.topic.contains(['+', '#']) {
            return Err(RelayError::Config(
                "broker.topic must be a single topic, not a filter".into(),
            ));
        }
        if self.broker.client_id.is_empty() {
            return Err(RelayError::Config("broker.client_id must not be empty".into()));
        }
        if self.broker.client_id.starts_with(char::is_whitespace) {
            return Err(RelayError::Config(
                "broker.client_id must not start with whitespace".into(),
            ));
        }
        if self.broker.keep_alive < Duration::from_secs(1) {
            return Err(RelayError::Config("broker.keep_alive_secs must be at least 1".into()));
        }
        if self.broker.channel_capacity == 0 {
            return Err(RelayError::Config("broker.channel_capacity must be positive".into()));
        }
        Ok(())
    }
}
