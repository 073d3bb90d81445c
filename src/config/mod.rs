//! Controller configuration, loaded from TOML.
//!
//! Every field has a default matching JSK hardware, so an empty file (or no
//! file at all) yields a working configuration for `/dev/ttyUSB0`.
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::ReopenPolicy;
use crate::serial::interface::DEFAULT_BAUD_RATE;
use crate::serial::{CodecConfig, SerialSettings, SessionPolicy};
use crate::vending::AisleRange;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub serial: SerialConfig,
    pub protocol: ProtocolConfig,
    pub dispatch: DispatchConfig,
    pub aisles: AisleRange,
    pub codec: CodecConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_backoff_ms: u64,
    pub progress_timeout_ms: u64,
    /// Write only in answer to a POLL, as JSK boards expect
    pub wait_for_poll: bool,
    pub acknowledge_reports: bool,
    /// Ignore reports whose communication number is not the session's
    pub match_comm_number: bool,
    /// REQUEST_SYNC after the port opens and whenever the VMC asks for it
    pub sync_with_vmc: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 1000,
            max_attempts: 3,
            retry_delay_ms: 200,
            retry_backoff_ms: 0,
            progress_timeout_ms: 30_000,
            wait_for_poll: true,
            acknowledge_reports: true,
            match_comm_number: true,
            sync_with_vmc: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub queue_depth: usize,
    pub submit_timeout_ms: u64,
    pub reopen_attempts: u32,
    pub reopen_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_depth: 16,
            submit_timeout_ms: 30_000,
            reopen_attempts: 3,
            reopen_delay_ms: 500,
        }
    }
}

impl ControllerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: ControllerConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.serial.port.trim().is_empty() {
            return Err(ConfigError::Invalid("serial.port is empty".into()));
        }
        if self.serial.baud_rate == 0 {
            return Err(ConfigError::Invalid("serial.baud_rate must be positive".into()));
        }
        if self.protocol.max_attempts == 0 {
            return Err(ConfigError::Invalid("protocol.max_attempts must be at least 1".into()));
        }
        if self.protocol.attempt_timeout_ms == 0 {
            return Err(ConfigError::Invalid("protocol.attempt_timeout_ms must be positive".into()));
        }
        if self.dispatch.queue_depth == 0 {
            return Err(ConfigError::Invalid("dispatch.queue_depth must be at least 1".into()));
        }
        if self.aisles.min == 0 || self.aisles.min > self.aisles.max {
            return Err(ConfigError::Invalid(format!(
                "aisle range {}..={} is empty or starts at 0",
                self.aisles.min, self.aisles.max
            )));
        }
        if self.codec.start_marker.is_empty() {
            return Err(ConfigError::Invalid("codec.start_marker is empty".into()));
        }
        Ok(())
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            port: self.serial.port.clone(),
            baud_rate: self.serial.baud_rate,
            read_timeout: Duration::from_millis(self.serial.read_timeout_ms),
        }
    }

    pub fn session_policy(&self) -> SessionPolicy {
        let p = &self.protocol;
        SessionPolicy {
            max_attempts: p.max_attempts,
            attempt_timeout: Duration::from_millis(p.attempt_timeout_ms),
            retry_delay: Duration::from_millis(p.retry_delay_ms),
            retry_backoff: Duration::from_millis(p.retry_backoff_ms),
            progress_timeout: Duration::from_millis(p.progress_timeout_ms),
            wait_for_poll: p.wait_for_poll,
            acknowledge_reports: p.acknowledge_reports,
            match_comm_number: p.match_comm_number,
        }
    }

    pub fn reopen_policy(&self) -> ReopenPolicy {
        ReopenPolicy {
            attempts: self.dispatch.reopen_attempts,
            delay: Duration::from_millis(self.dispatch.reopen_delay_ms),
        }
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch.submit_timeout_ms)
    }
}
