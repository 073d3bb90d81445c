pub mod config;
pub mod dispatch;
pub mod error;
pub mod serial;
pub mod vending;

pub use config::ControllerConfig;
pub use error::ControllerError;
pub use vending::{
    AisleReport, AisleStatus, DispenseOrchestrator, DispenseOutcome, DispenseStatus, HealthReport,
    LogicalCommand, VendingController,
};
