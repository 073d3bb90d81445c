use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::serial::protocol::DriveOptions;

/// A dispense request as callers describe it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalCommand {
    pub aisle_number: u16,
    #[serde(default = "default_true")]
    pub use_drop_sensor: bool,
    #[serde(default)]
    pub use_elevator: bool,
    /// Drive the motor directly instead of going through the VMC's selection
    #[serde(default)]
    pub direct_drive: bool,
}

fn default_true() -> bool {
    true
}

impl LogicalCommand {
    pub fn new(aisle_number: u16) -> Self {
        Self {
            aisle_number,
            use_drop_sensor: true,
            use_elevator: false,
            direct_drive: false,
        }
    }

    pub fn with_drop_sensor(mut self, enabled: bool) -> Self {
        self.use_drop_sensor = enabled;
        self
    }

    pub fn with_elevator(mut self, enabled: bool) -> Self {
        self.use_elevator = enabled;
        self
    }

    pub fn direct(mut self) -> Self {
        self.direct_drive = true;
        self
    }

    /// Flags only travel on the wire for direct drive.
    pub fn drive_options(&self) -> Option<DriveOptions> {
        self.direct_drive.then_some(DriveOptions {
            use_drop_sensor: self.use_drop_sensor,
            use_elevator: self.use_elevator,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispenseStatus {
    Success,
    Timeout,
    Jammed,
    InvalidAisle,
    TransportError,
    ControllerBusy,
}

impl DispenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispenseStatus::Success => "success",
            DispenseStatus::Timeout => "timeout",
            DispenseStatus::Jammed => "jammed",
            DispenseStatus::InvalidAisle => "invalid_aisle",
            DispenseStatus::TransportError => "transport_error",
            DispenseStatus::ControllerBusy => "controller_busy",
        }
    }
}

impl std::fmt::Display for DispenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispenseOutcome {
    pub success: bool,
    pub aisle_number: u16,
    pub status: DispenseStatus,
    pub message: String,
    pub transaction_id: String,
    /// Frames written for the command, retries included
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

impl DispenseOutcome {
    pub fn succeeded(aisle_number: u16, transaction_id: String, attempts: u32) -> Self {
        Self {
            success: true,
            aisle_number,
            status: DispenseStatus::Success,
            message: format!("Dispensed from aisle {}", aisle_number),
            transaction_id,
            attempts,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        aisle_number: u16,
        status: DispenseStatus,
        message: impl Into<String>,
        transaction_id: String,
        attempts: u32,
    ) -> Self {
        Self {
            success: false,
            aisle_number,
            status,
            message: message.into(),
            transaction_id,
            attempts,
            completed_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AisleStatus {
    Normal,
    Empty,
    Jammed,
    Unknown,
}

/// Full answer to an aisle check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AisleReport {
    pub aisle_number: u16,
    pub status: AisleStatus,
    pub raw_code: u8,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub transport_open: bool,
    pub last_error: Option<String>,
    pub port: String,
}

/// Inclusive range of aisles the machine has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AisleRange {
    pub min: u16,
    pub max: u16,
}

impl AisleRange {
    pub fn new(min: u16, max: u16) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, aisle: u16) -> bool {
        (self.min..=self.max).contains(&aisle)
    }
}

impl Default for AisleRange {
    fn default() -> Self {
        Self { min: 1, max: 100 }
    }
}
