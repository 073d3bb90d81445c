pub mod codec;
pub mod interface;
pub mod protocol;
pub mod session;
pub mod sim;

pub use codec::{Boundary, Checksum, CodecConfig, CorruptFrame, Frame, FrameCodec};
pub use interface::{PortConnector, SerialInterface, SerialPortIO, SerialSettings};
pub use protocol::{Command, Request};
pub use session::{CommandSession, SessionOutcome, SessionPolicy, SessionState};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub port_type: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port unavailable: {port}: {reason}")]
    Unavailable { port: String, reason: String },

    #[error("Port not open")]
    NotConnected,

    #[error("Communication timeout")]
    Timeout,

    #[error("Short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("Frame error: {0}")]
    Frame(#[from] CorruptFrame),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// Faults that mean the device handle itself is unusable and must be reopened.
    pub fn is_device_fault(&self) -> bool {
        !matches!(self, SerialError::Timeout | SerialError::Frame(_))
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
