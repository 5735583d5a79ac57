// Client-side defaults and configuration overrides.
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;

pub(crate) const DEFAULT_REPLY_QUEUE_PREFIX: &str = "response.";

/// Upper bound on request handler invocations running concurrently per
/// consumer.
///
/// Rationale:
/// - Every inbound request spawns a handler task; without a cap, a burst of
///   requests (or a slow handler) grows the task set without bound.
/// - Deliveries are still read and acknowledged while the cap is hit; only
///   handler dispatch waits for a permit.
///
/// Override with `COURIER_MAX_IN_FLIGHT_HANDLERS`.
pub(crate) const DEFAULT_MAX_IN_FLIGHT_HANDLERS: usize = 256;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefix for generated reply queue names (`response.<uuid>`).
    pub reply_queue_prefix: String,
    pub max_in_flight_handlers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_queue_prefix: DEFAULT_REPLY_QUEUE_PREFIX.to_string(),
            max_in_flight_handlers: DEFAULT_MAX_IN_FLIGHT_HANDLERS,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientConfigOverride {
    reply_queue_prefix: Option<String>,
    max_in_flight_handlers: Option<usize>,
}

impl ClientConfigOverride {
    fn apply(self, config: &mut ClientConfig) {
        if let Some(value) = self.reply_queue_prefix.filter(|value| !value.is_empty()) {
            config.reply_queue_prefix = value;
        }
        if let Some(value) = self.max_in_flight_handlers.filter(|value| *value > 0) {
            config.max_in_flight_handlers = value;
        }
    }
}

impl ClientConfig {
    /// Defaults, then environment overrides, then an optional YAML override
    /// file (explicit path or `COURIER_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path.as_deref() {
            let contents =
                fs::read_to_string(path).with_context(|| format!("read client config: {path}"))?;
            let override_cfg: ClientConfigOverride =
                serde_yaml::from_str(&contents).context("parse client config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(value) = std::env::var("COURIER_REPLY_QUEUE_PREFIX") {
            if !value.is_empty() {
                config.reply_queue_prefix = value;
            }
        }
        if let Some(value) = read_usize_env("COURIER_MAX_IN_FLIGHT_HANDLERS") {
            config.max_in_flight_handlers = value;
        }
        config
    }
}

fn read_usize_env(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
