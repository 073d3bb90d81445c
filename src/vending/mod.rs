pub mod manager;
pub mod models;
pub mod orchestrator;
pub mod status;

pub use manager::VendingController;
pub use models::{
    AisleRange, AisleReport, AisleStatus, DispenseOutcome, DispenseStatus, HealthReport, LogicalCommand,
};
pub use orchestrator::{new_transaction_id, DispenseOrchestrator};
pub use status::{aisle_message, translate_aisle_code, DispenseCode};
