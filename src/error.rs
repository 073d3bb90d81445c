use crate::serial::{CorruptFrame, SerialError};
use crate::vending::DispenseStatus;

/// Everything the controller can report across its boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ControllerError {
    #[error("Aisle {aisle} outside configured range {min}..={max}")]
    InvalidAisle { aisle: u16, min: u16, max: u16 },

    #[error("Controller busy: {0}")]
    ControllerBusy(String),

    #[error("Corrupt frame: {0}")]
    CorruptFrame(#[from] CorruptFrame),

    #[error("No response from VMC after {attempts} attempt(s)")]
    TransportTimeout { attempts: u32 },

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Machine fault on aisle {aisle}: {message} (code 0x{code:02X})")]
    MachineFault { aisle: u16, code: u8, message: String },
}

impl ControllerError {
    /// Stable boundary status for this error.
    pub fn status(&self) -> DispenseStatus {
        match self {
            ControllerError::InvalidAisle { .. } => DispenseStatus::InvalidAisle,
            ControllerError::ControllerBusy(_) => DispenseStatus::ControllerBusy,
            ControllerError::CorruptFrame(_) | ControllerError::TransportTimeout { .. } => {
                DispenseStatus::Timeout
            }
            ControllerError::TransportError(_) | ControllerError::TransportUnavailable(_) => {
                DispenseStatus::TransportError
            }
            ControllerError::MachineFault { .. } => DispenseStatus::Jammed,
        }
    }

    /// Infrastructure failures as opposed to caller mistakes or machine news.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            ControllerError::ControllerBusy(_)
                | ControllerError::TransportError(_)
                | ControllerError::TransportUnavailable(_)
        )
    }
}

impl From<SerialError> for ControllerError {
    fn from(error: SerialError) -> Self {
        match error {
            SerialError::Unavailable { .. } | SerialError::NotConnected => {
                ControllerError::TransportUnavailable(error.to_string())
            }
            SerialError::Timeout => ControllerError::TransportTimeout { attempts: 1 },
            SerialError::Frame(e) => ControllerError::CorruptFrame(e),
            other => ControllerError::TransportError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ControllerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_stable() {
        assert_eq!(
            ControllerError::InvalidAisle { aisle: 999, min: 1, max: 20 }.status(),
            DispenseStatus::InvalidAisle
        );
        assert_eq!(ControllerError::TransportTimeout { attempts: 3 }.status(), DispenseStatus::Timeout);
        assert_eq!(
            ControllerError::MachineFault { aisle: 1, code: 3, message: "Product jammed".into() }.status(),
            DispenseStatus::Jammed
        );
        assert_eq!(ControllerError::ControllerBusy("full".into()).status(), DispenseStatus::ControllerBusy);
    }

    #[test]
    fn test_serial_errors_convert() {
        let unavailable = SerialError::Unavailable { port: "/dev/ttyUSB9".into(), reason: "No such file".into() };
        assert!(matches!(ControllerError::from(unavailable), ControllerError::TransportUnavailable(_)));

        let io = SerialError::IoError(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"));
        let converted = ControllerError::from(io);
        assert!(matches!(converted, ControllerError::TransportError(_)));
        assert!(converted.is_infrastructure());
    }
}
