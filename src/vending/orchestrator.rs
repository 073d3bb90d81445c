use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::{AisleRange, AisleReport, AisleStatus, DispenseOutcome, DispenseStatus, LogicalCommand};
use super::status::{aisle_message, translate_aisle_code, DispenseCode};
use crate::dispatch::{DispatchHandle, SessionReport};
use crate::error::{ControllerError, Result};
use crate::serial::protocol::StatusReport;
use crate::serial::{Frame, Request, SessionOutcome};

/// `txn_` followed by 12 hex digits of a v4 UUID
pub fn new_transaction_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("txn_{}", &uuid[..12])
}

/// Turns logical requests into dispatch submissions and their results into
/// domain outcomes. Cloning is cheap; clones share the dispatch worker and
/// the record of jammed aisles.
#[derive(Clone)]
pub struct DispenseOrchestrator {
    dispatch: DispatchHandle,
    aisles: AisleRange,
    /// Last failed dispense per aisle, cleared by the next success
    faults: Arc<RwLock<HashMap<u16, DispenseCode>>>,
}

impl DispenseOrchestrator {
    pub fn new(dispatch: DispatchHandle, aisles: AisleRange) -> Self {
        Self {
            dispatch,
            aisles,
            faults: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn aisles(&self) -> AisleRange {
        self.aisles
    }

    pub async fn dispense(&self, command: LogicalCommand) -> DispenseOutcome {
        let transaction_id = new_transaction_id();
        let aisle = command.aisle_number;

        if let Err(e) = self.validate(aisle) {
            log::warn!("[{}] rejected: {}", transaction_id, e);
            return DispenseOutcome::failed(aisle, e.status(), e.to_string(), transaction_id, 0);
        }

        log::info!(
            "[{}] dispense aisle {} (direct: {}, drop sensor: {}, elevator: {})",
            transaction_id,
            aisle,
            command.direct_drive,
            command.use_drop_sensor,
            command.use_elevator
        );
        let request = Request::Dispense {
            aisle,
            direct: command.drive_options(),
        };
        let report = match self.dispatch.submit(transaction_id.clone(), request).await {
            Ok(report) => report,
            Err(e) => {
                log::warn!("[{}] not dispatched: {}", transaction_id, e);
                return DispenseOutcome::failed(aisle, e.status(), e.to_string(), transaction_id, 0);
            }
        };

        let attempts = report.outcome.attempts();
        let outcome = match completed_frame(report) {
            Ok(frame) => match StatusReport::parse(&frame.payload) {
                Some(status) => {
                    let code = DispenseCode::from_code(status.code);
                    self.record_dispense(aisle, code).await;
                    if code.is_failure() {
                        let fault = ControllerError::MachineFault {
                            aisle,
                            code: status.code,
                            message: code.message(),
                        };
                        DispenseOutcome::failed(aisle, fault.status(), code.message(), transaction_id, attempts)
                    } else {
                        DispenseOutcome::succeeded(aisle, transaction_id, attempts)
                    }
                }
                None => DispenseOutcome::failed(
                    aisle,
                    DispenseStatus::TransportError,
                    format!("Malformed dispensing report: {}", hex::encode(&frame.payload)),
                    transaction_id,
                    attempts,
                ),
            },
            Err(e) => DispenseOutcome::failed(aisle, e.status(), e.to_string(), transaction_id, attempts),
        };

        if outcome.success {
            log::info!("[{}] aisle {} dispensed", outcome.transaction_id, aisle);
        } else {
            log::warn!(
                "[{}] aisle {} dispense {}: {}",
                outcome.transaction_id,
                aisle,
                outcome.status,
                outcome.message
            );
        }
        outcome
    }

    /// Never fails. Without a clean answer an aisle is `Unknown`, or
    /// `Jammed` if its last dispense failed.
    pub async fn query_status(&self, aisle: u16) -> AisleStatus {
        match self.check_aisle(aisle).await {
            Ok(report) => report.status,
            Err(e) => {
                log::warn!("Status query for aisle {} failed: {}", aisle, e);
                match self.faults.read().await.get(&aisle) {
                    Some(_) => AisleStatus::Jammed,
                    None => AisleStatus::Unknown,
                }
            }
        }
    }

    pub async fn check_aisle(&self, aisle: u16) -> Result<AisleReport> {
        self.validate(aisle)?;
        let report = self
            .dispatch
            .submit(new_transaction_id(), Request::CheckAisle { aisle })
            .await?;
        let frame = completed_frame(report)?;
        let status = StatusReport::parse(&frame.payload).ok_or_else(|| {
            ControllerError::TransportError(format!(
                "Malformed aisle status: {}",
                hex::encode(&frame.payload)
            ))
        })?;

        // A recorded fault outranks the aisle code.
        if let Some(fault) = self.faults.read().await.get(&aisle) {
            return Ok(AisleReport {
                aisle_number: aisle,
                status: AisleStatus::Jammed,
                raw_code: status.code,
                message: format!("{} on last dispense", fault.message()),
            });
        }

        Ok(AisleReport {
            aisle_number: aisle,
            status: translate_aisle_code(status.code),
            raw_code: status.code,
            message: aisle_message(status.code),
        })
    }

    pub async fn set_aisle_inventory(&self, aisle: u16, inventory: u8) -> Result<()> {
        self.validate(aisle)?;
        let report = self
            .dispatch
            .submit(new_transaction_id(), Request::SetInventory { aisle, inventory })
            .await?;
        completed_frame(report)?;
        log::info!("Aisle {} inventory set to {}", aisle, inventory);
        Ok(())
    }

    pub async fn request_sync(&self) -> Result<()> {
        let report = self.dispatch.submit(new_transaction_id(), Request::Sync).await?;
        completed_frame(report).map(|_| ())
    }

    /// Body of the machine status response, communication number stripped.
    pub async fn machine_status(&self) -> Result<Vec<u8>> {
        let report = self
            .dispatch
            .submit(new_transaction_id(), Request::MachineStatus)
            .await?;
        let frame = completed_frame(report)?;
        Ok(frame.payload.get(1..).map(<[u8]>::to_vec).unwrap_or_default())
    }

    async fn record_dispense(&self, aisle: u16, code: DispenseCode) {
        match code.aisle_status() {
            Some(AisleStatus::Normal) => {
                if self.faults.write().await.remove(&aisle).is_some() {
                    log::info!("Aisle {} cleared after a successful dispense", aisle);
                }
            }
            Some(_) => {
                log::warn!("Aisle {} marked jammed: {}", aisle, code.message());
                self.faults.write().await.insert(aisle, code);
            }
            None => {}
        }
    }

    fn validate(&self, aisle: u16) -> Result<()> {
        if self.aisles.contains(aisle) {
            Ok(())
        } else {
            Err(ControllerError::InvalidAisle {
                aisle,
                min: self.aisles.min,
                max: self.aisles.max,
            })
        }
    }
}

fn completed_frame(report: SessionReport) -> Result<Frame> {
    match report.outcome {
        SessionOutcome::Completed { frame, .. } => Ok(frame),
        SessionOutcome::TimedOut { attempts } => Err(ControllerError::TransportTimeout { attempts }),
        SessionOutcome::Failed { error, .. } => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_shape() {
        let id = new_transaction_id();
        assert!(id.starts_with("txn_"));
        assert_eq!(id.len(), 16);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_transaction_id());
    }
}
