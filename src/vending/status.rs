//! Raw VMC status codes to domain statuses. Pure functions, no I/O.
use super::models::AisleStatus;
use crate::serial::protocol::{
    AISLE_DOES_NOT_EXIST, AISLE_NORMAL, AISLE_OUT_OF_STOCK, AISLE_PAUSED, DISPENSE_IN_PROGRESS,
    DISPENSE_JAMMED, DISPENSE_MOTOR_DOESNT_EXIST, DISPENSE_MOTOR_DOESNT_STOP, DISPENSE_SUCCESS,
};

/// Anything not recognised is `Unknown`, never an error.
pub fn translate_aisle_code(code: u8) -> AisleStatus {
    match code {
        AISLE_NORMAL => AisleStatus::Normal,
        AISLE_OUT_OF_STOCK => AisleStatus::Empty,
        _ => AisleStatus::Unknown,
    }
}

pub fn aisle_message(code: u8) -> String {
    match code {
        AISLE_NORMAL => "Aisle normal".to_string(),
        AISLE_OUT_OF_STOCK => "Aisle out of stock".to_string(),
        AISLE_DOES_NOT_EXIST => "Aisle does not exist".to_string(),
        AISLE_PAUSED => "Aisle paused".to_string(),
        other => format!("Unrecognized aisle status 0x{:02X}", other),
    }
}

/// Codes carried by a DISPENSING_STATUS report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispenseCode {
    InProgress,
    Success,
    Jammed,
    MotorDoesntStop,
    MotorMissing,
    Unrecognized(u8),
}

impl DispenseCode {
    pub fn from_code(code: u8) -> Self {
        match code {
            DISPENSE_IN_PROGRESS => DispenseCode::InProgress,
            DISPENSE_SUCCESS => DispenseCode::Success,
            DISPENSE_JAMMED => DispenseCode::Jammed,
            DISPENSE_MOTOR_DOESNT_STOP => DispenseCode::MotorDoesntStop,
            DISPENSE_MOTOR_DOESNT_EXIST => DispenseCode::MotorMissing,
            other => DispenseCode::Unrecognized(other),
        }
    }

    pub fn is_failure(&self) -> bool {
        !matches!(self, DispenseCode::InProgress | DispenseCode::Success)
    }

    pub fn message(&self) -> String {
        match self {
            DispenseCode::InProgress => "Dispensing".to_string(),
            DispenseCode::Success => "Dispense successful".to_string(),
            DispenseCode::Jammed => "Product jammed".to_string(),
            DispenseCode::MotorDoesntStop => "Motor doesn't stop normally".to_string(),
            DispenseCode::MotorMissing => "Motor doesn't exist".to_string(),
            DispenseCode::Unrecognized(code) => format!("Unrecognized dispensing status 0x{:02X}", code),
        }
    }

    /// Aisle state implied by this report, if it implies one.
    pub fn aisle_status(&self) -> Option<AisleStatus> {
        match self {
            DispenseCode::InProgress => None,
            DispenseCode::Success => Some(AisleStatus::Normal),
            _ => Some(AisleStatus::Jammed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_aisle_codes() {
        assert_eq!(translate_aisle_code(0x01), AisleStatus::Normal);
        assert_eq!(translate_aisle_code(0x02), AisleStatus::Empty);
        assert_eq!(translate_aisle_code(0x03), AisleStatus::Unknown);
        assert_eq!(translate_aisle_code(0x04), AisleStatus::Unknown);
    }

    #[test]
    fn test_unknown_aisle_codes_never_fail() {
        for code in [0x00u8, 0x05, 0x7F, 0xFF] {
            assert_eq!(translate_aisle_code(code), AisleStatus::Unknown);
            assert!(aisle_message(code).contains("Unrecognized"));
        }
        assert_eq!(aisle_message(0x04), "Aisle paused");
    }

    #[test]
    fn test_dispense_failures_map_to_jammed() {
        for code in [0x03u8, 0x04, 0x06, 0x09] {
            let parsed = DispenseCode::from_code(code);
            assert!(parsed.is_failure());
            assert_eq!(parsed.aisle_status(), Some(AisleStatus::Jammed));
        }
        assert_eq!(DispenseCode::from_code(0x02).aisle_status(), Some(AisleStatus::Normal));
        assert_eq!(DispenseCode::from_code(0x01).aisle_status(), None);
        assert_eq!(DispenseCode::from_code(0x06).message(), "Motor doesn't exist");
    }
}
