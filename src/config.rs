use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,

    // Engine.IO heartbeat
    pub ping_interval_ms: u64,
    pub ping_timeout_ms: u64,
    pub max_payload: usize,

    // Dispatch
    pub inbound_queue_capacity: usize,
    pub ack_timeout_secs: u64,

    // Demo namespaces: connections presenting this auth token are refused
    pub refused_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,

            ping_interval_ms: 25_000,
            ping_timeout_ms: 20_000,
            max_payload: 1_000_000,

            inbound_queue_capacity: 64,
            ack_timeout_secs: 30,

            refused_token: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from any variable source, starting from defaults
    pub fn from_lookup<F>(get: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(host) = get("SOCKETHUB_HOST") {
            config.host = host;
        }

        if let Some(port) = get("SOCKETHUB_PORT") {
            config.port = parse_var("SOCKETHUB_PORT", &port)?;
        }

        if let Some(interval) = get("PING_INTERVAL_MS") {
            config.ping_interval_ms = parse_var("PING_INTERVAL_MS", &interval)?;
        }

        if let Some(timeout) = get("PING_TIMEOUT_MS") {
            config.ping_timeout_ms = parse_var("PING_TIMEOUT_MS", &timeout)?;
        }

        if let Some(max_payload) = get("MAX_PAYLOAD") {
            config.max_payload = parse_var("MAX_PAYLOAD", &max_payload)?;
        }

        if let Some(capacity) = get("INBOUND_QUEUE_CAPACITY") {
            config.inbound_queue_capacity = parse_var("INBOUND_QUEUE_CAPACITY", &capacity)?;
            if config.inbound_queue_capacity == 0 {
                return Err("Invalid INBOUND_QUEUE_CAPACITY: must be at least 1".to_string());
            }
        }

        if let Some(ack_timeout) = get("ACK_TIMEOUT_SECS") {
            config.ack_timeout_secs = parse_var("ACK_TIMEOUT_SECS", &ack_timeout)?;
            if config.ack_timeout_secs == 0 {
                return Err("Invalid ACK_TIMEOUT_SECS: must be at least 1".to_string());
            }
        }

        if let Some(token) = get("REFUSED_TOKEN") {
            if !token.is_empty() {
                config.refused_token = Some(token);
            }
        }

        Ok(config)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| format!("Invalid {}: {}", name, e))
}
