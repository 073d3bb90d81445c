use serde::{Deserialize, Serialize};

use super::codec::Frame;

/// JSK command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    CheckAisle = 0x01,
    AisleStatusResponse = 0x02,
    SelectBuy = 0x03,
    DispensingStatus = 0x04,
    SelectAisle = 0x05,
    DriveAisleDirect = 0x06,
    AisleInfo = 0x11,
    SetAislePrice = 0x12,
    SetAisleInventory = 0x13,
    SetAisleCapacity = 0x14,
    SetAisleCommodity = 0x15,
    PosDisplay = 0x24,
    RequestSync = 0x31,
    Poll = 0x41,
    Ack = 0x42,
    RequestMachineStatus = 0x51,
    MachineStatusResponse = 0x52,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let command = match code {
            0x01 => Command::CheckAisle,
            0x02 => Command::AisleStatusResponse,
            0x03 => Command::SelectBuy,
            0x04 => Command::DispensingStatus,
            0x05 => Command::SelectAisle,
            0x06 => Command::DriveAisleDirect,
            0x11 => Command::AisleInfo,
            0x12 => Command::SetAislePrice,
            0x13 => Command::SetAisleInventory,
            0x14 => Command::SetAisleCapacity,
            0x15 => Command::SetAisleCommodity,
            0x24 => Command::PosDisplay,
            0x31 => Command::RequestSync,
            0x41 => Command::Poll,
            0x42 => Command::Ack,
            0x51 => Command::RequestMachineStatus,
            0x52 => Command::MachineStatusResponse,
            _ => return None,
        };
        Some(command)
    }
}

// Aisle status codes carried by AISLE_STATUS_RESPONSE
pub const AISLE_NORMAL: u8 = 0x01;
pub const AISLE_OUT_OF_STOCK: u8 = 0x02;
pub const AISLE_DOES_NOT_EXIST: u8 = 0x03;
pub const AISLE_PAUSED: u8 = 0x04;

// Dispensing status codes carried by DISPENSING_STATUS
pub const DISPENSE_IN_PROGRESS: u8 = 0x01;
pub const DISPENSE_SUCCESS: u8 = 0x02;
pub const DISPENSE_JAMMED: u8 = 0x03;
pub const DISPENSE_MOTOR_DOESNT_STOP: u8 = 0x04;
pub const DISPENSE_MOTOR_DOESNT_EXIST: u8 = 0x06;

/// Options carried by DRIVE_AISLE_DIRECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveOptions {
    pub use_drop_sensor: bool,
    pub use_elevator: bool,
}

/// A host-initiated exchange with the VMC
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// SELECT_BUY, or DRIVE_AISLE_DIRECT when `direct` is set
    Dispense { aisle: u16, direct: Option<DriveOptions> },
    CheckAisle { aisle: u16 },
    SetInventory { aisle: u16, inventory: u8 },
    Sync,
    MachineStatus,
}

/// What terminates a session for a given request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expectation {
    /// A bare ACK from the VMC
    Ack,
    /// A report frame with the given command code, optionally for one aisle
    Report { command: Command, aisle: Option<u16> },
}

impl Request {
    pub fn command(&self) -> Command {
        match self {
            Request::Dispense { direct: Some(_), .. } => Command::DriveAisleDirect,
            Request::Dispense { direct: None, .. } => Command::SelectBuy,
            Request::CheckAisle { .. } => Command::CheckAisle,
            Request::SetInventory { .. } => Command::SetAisleInventory,
            Request::Sync => Command::RequestSync,
            Request::MachineStatus => Command::RequestMachineStatus,
        }
    }

    pub fn aisle(&self) -> Option<u16> {
        match self {
            Request::Dispense { aisle, .. }
            | Request::CheckAisle { aisle }
            | Request::SetInventory { aisle, .. } => Some(*aisle),
            Request::Sync | Request::MachineStatus => None,
        }
    }

    /// Payload bytes; the first byte is always the communication number.
    pub fn payload(&self, comm_number: u8) -> Vec<u8> {
        let mut text = vec![comm_number];
        match self {
            Request::Dispense { aisle, direct: Some(opts) } => {
                text.push(u8::from(opts.use_drop_sensor));
                text.push(u8::from(opts.use_elevator));
                text.extend_from_slice(&aisle.to_be_bytes());
            }
            Request::Dispense { aisle, direct: None } | Request::CheckAisle { aisle } => {
                text.extend_from_slice(&aisle.to_be_bytes());
            }
            Request::SetInventory { aisle, inventory } => {
                text.extend_from_slice(&aisle.to_be_bytes());
                text.push(*inventory);
            }
            Request::Sync | Request::MachineStatus => {}
        }
        text
    }

    pub fn to_frame(&self, comm_number: u8) -> Frame {
        Frame::new(self.command().code(), self.payload(comm_number))
    }

    pub fn expectation(&self) -> Expectation {
        match self {
            Request::Dispense { aisle, .. } => Expectation::Report {
                command: Command::DispensingStatus,
                aisle: Some(*aisle),
            },
            Request::CheckAisle { aisle } => Expectation::Report {
                command: Command::AisleStatusResponse,
                aisle: Some(*aisle),
            },
            Request::MachineStatus => Expectation::Report {
                command: Command::MachineStatusResponse,
                aisle: None,
            },
            Request::SetInventory { .. } | Request::Sync => Expectation::Ack,
        }
    }

    /// Whether re-sending after the VMC accepted the command is harmless.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Request::Dispense { .. })
    }
}

/// Body of AISLE_STATUS_RESPONSE and DISPENSING_STATUS: comm number, status, aisle (BE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub comm_number: u8,
    pub code: u8,
    pub aisle: u16,
}

impl StatusReport {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.len() < 4 {
            return None;
        }
        Some(Self {
            comm_number: payload[0],
            code: payload[1],
            aisle: u16::from_be_bytes([payload[2], payload[3]]),
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let aisle = self.aisle.to_be_bytes();
        vec![self.comm_number, self.code, aisle[0], aisle[1]]
    }
}

/// Communication numbers run 1..=255 and wrap.
#[derive(Debug, Clone)]
pub struct CommCounter {
    next: u8,
}

impl CommCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next(&mut self) -> u8 {
        let current = self.next;
        self.next = if current == u8::MAX { 1 } else { current + 1 };
        current
    }
}

impl Default for CommCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_codes_roundtrip() {
        for code in 0u8..=0xFF {
            if let Some(cmd) = Command::from_code(code) {
                assert_eq!(cmd.code(), code);
            }
        }
        assert_eq!(Command::from_code(0x99), None);
    }

    #[test]
    fn test_select_buy_payload() {
        let req = Request::Dispense { aisle: 0x0102, direct: None };
        assert_eq!(req.command(), Command::SelectBuy);
        assert_eq!(req.payload(7), vec![7, 0x01, 0x02]);
    }

    #[test]
    fn test_drive_direct_payload_carries_flags() {
        let req = Request::Dispense {
            aisle: 12,
            direct: Some(DriveOptions { use_drop_sensor: true, use_elevator: false }),
        };
        assert_eq!(req.command(), Command::DriveAisleDirect);
        assert_eq!(req.payload(3), vec![3, 1, 0, 0x00, 0x0C]);
    }

    #[test]
    fn test_inventory_payload_and_expectation() {
        let req = Request::SetInventory { aisle: 5, inventory: 9 };
        assert_eq!(req.payload(1), vec![1, 0x00, 0x05, 9]);
        assert_eq!(req.expectation(), Expectation::Ack);
        assert!(req.is_idempotent());
    }

    #[test]
    fn test_status_report_parse() {
        let report = StatusReport::parse(&[4, DISPENSE_JAMMED, 0x00, 0x11]).unwrap();
        assert_eq!(report.code, DISPENSE_JAMMED);
        assert_eq!(report.aisle, 17);
        assert!(StatusReport::parse(&[4, 1, 0]).is_none());
    }

    #[test]
    fn test_comm_counter_wraps_to_one() {
        let mut counter = CommCounter { next: 254 };
        assert_eq!(counter.next(), 254);
        assert_eq!(counter.next(), 255);
        assert_eq!(counter.next(), 1);
    }
}
