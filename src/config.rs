//! Ambient configuration surface: the fixed MRP parameters from spec
//! §4.1/§6 as overridable fields, loaded/saved as JSON the way the teacher's
//! `devman::config::ManagerConfig` does.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeManagerConfig {
    pub standalone_ack_timeout_ms: u64,
    pub max_transmissions: u8,
    pub max_concurrent_exchanges: usize,
}

impl Default for ExchangeManagerConfig {
    fn default() -> Self {
        Self {
            standalone_ack_timeout_ms: 200,
            max_transmissions: crate::backoff::MAX_TRANSMISSIONS,
            max_concurrent_exchanges: 5,
        }
    }
}

impl ExchangeManagerConfig {
    pub fn standalone_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.standalone_ack_timeout_ms)
    }

    pub fn load(path: &str) -> Result<Self> {
        let data = std::fs::read_to_string(path).with_context(|| format!("reading config from {path}"))?;
        serde_json::from_str(&data).with_context(|| format!("parsing config from {path}"))
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let data = serde_json::to_string_pretty(self).context("serializing config")?;
        std::fs::write(path, data).with_context(|| format!("writing config to {path}"))
    }
}
