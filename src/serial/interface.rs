use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, Parity, SerialPort, SerialPortType, StopBits};
use tokio::time::Instant;

use super::codec::Boundary;
use super::{Result, SerialDeviceInfo, SerialError};

// JSK boards talk 57600 8N1
pub const DEFAULT_BAUD_RATE: u32 = 57600;

/// Upper bound on a single blocking read so deadlines are re-checked promptly.
const READ_SLICE_MS: u64 = 50;
const RX_CHUNK: usize = 256;
const BYTES_POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Byte-level access to a serial device.
#[async_trait]
pub trait SerialPortIO: Send {
    async fn send_data(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available, waiting at most `timeout_ms`.
    /// Returns `SerialError::Timeout` when nothing arrived.
    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;

    async fn flush(&mut self) -> Result<()>;

    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Knows how to (re)acquire the device behind a `SerialInterface`.
pub trait PortConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn SerialPortIO>>;
    fn port_name(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub read_timeout: Duration,
}

impl SerialSettings {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl PortConnector for SerialSettings {
    fn connect(&self) -> Result<Box<dyn SerialPortIO>> {
        let port = serialport::new(&self.port, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.read_timeout)
            .open()
            .map_err(|e| SerialError::Unavailable {
                port: self.port.clone(),
                reason: e.to_string(),
            })?;

        log::info!("Opened {} at {} baud", self.port, self.baud_rate);
        Ok(Box::new(SystemPort { port }))
    }

    fn port_name(&self) -> String {
        self.port.clone()
    }
}

/// `SerialPortIO` over a real device.
pub struct SystemPort {
    port: Box<dyn SerialPort>,
}

#[async_trait]
impl SerialPortIO for SystemPort {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.port.write(&data[written..]) {
                Ok(0) => {
                    return Err(SerialError::ShortWrite {
                        written,
                        expected: data.len(),
                    })
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(SerialError::IoError(e)),
            }
        }
        Ok(())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            match self.port.bytes_to_read() {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        return Err(SerialError::Timeout);
                    }
                    tokio::time::sleep(BYTES_POLL_INTERVAL).await;
                }
                Ok(available) => {
                    let wanted = (available as usize).min(buffer.len());
                    match self.port.read(&mut buffer[..wanted]) {
                        Ok(n) if n > 0 => return Ok(n),
                        Ok(_) => return Err(SerialError::Timeout),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {
                            return Err(SerialError::Timeout)
                        }
                        Err(e) => return Err(SerialError::IoError(e)),
                    }
                }
                Err(e) => return Err(SerialError::SerialportError(e)),
            }
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.port.flush().map_err(SerialError::IoError)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port.clear(ClearBuffer::Input)?;
        Ok(())
    }
}

/// The one half-duplex channel to the VMC.
///
/// Only the dispatch worker holds a `SerialInterface`; everything else goes
/// through the queue.
pub struct SerialInterface {
    connector: Box<dyn PortConnector>,
    io: Option<Box<dyn SerialPortIO>>,
    rx_buffer: Vec<u8>,
}

impl SerialInterface {
    pub fn new(connector: impl PortConnector + 'static) -> Self {
        Self {
            connector: Box::new(connector),
            io: None,
            rx_buffer: Vec::new(),
        }
    }

    pub fn port_name(&self) -> String {
        self.connector.port_name()
    }

    /// Acquire the device. A no-op when already open.
    pub fn open(&mut self) -> Result<()> {
        if self.io.is_some() {
            return Ok(());
        }
        let io = self.connector.connect()?;
        self.io = Some(io);
        self.rx_buffer.clear();
        log::info!("Serial transport open on {}", self.port_name());
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.io.is_some()
    }

    /// Release the device. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.io.take().is_some() {
            log::info!("Serial transport on {} closed", self.port_name());
        }
        self.rx_buffer.clear();
    }

    /// Write the whole buffer and flush.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        log::debug!("TX {}", hex::encode(data));
        io.send_data(data).await?;
        io.flush().await
    }

    /// Drop anything buffered from an earlier exchange.
    pub fn discard_input(&mut self) -> Result<()> {
        if !self.rx_buffer.is_empty() {
            log::debug!("Discarding {} stale bytes", self.rx_buffer.len());
            self.rx_buffer.clear();
        }
        match self.io.as_mut() {
            Some(io) => io.clear_input(),
            None => Err(SerialError::NotConnected),
        }
    }

    /// Accumulate bytes until `boundary` reports a complete frame or `deadline` passes.
    ///
    /// On timeout any half-received frame is thrown away; it is never handed
    /// to a later read.
    pub async fn read_until<F>(&mut self, boundary: F, deadline: Instant) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> Boundary,
    {
        let io = self.io.as_mut().ok_or(SerialError::NotConnected)?;
        let mut chunk = [0u8; RX_CHUNK];

        loop {
            match boundary(&self.rx_buffer) {
                Boundary::Complete(n) => {
                    let frame: Vec<u8> = self.rx_buffer.drain(..n).collect();
                    log::debug!("RX {}", hex::encode(&frame));
                    return Ok(frame);
                }
                Boundary::Discard(n) => {
                    log::debug!("Dropping {} stray bytes: {}", n, hex::encode(&self.rx_buffer[..n]));
                    self.rx_buffer.drain(..n);
                    continue;
                }
                Boundary::Incomplete => {}
            }

            let now = Instant::now();
            if now >= deadline {
                if !self.rx_buffer.is_empty() {
                    log::debug!(
                        "Read deadline passed with {} partial bytes: {}",
                        self.rx_buffer.len(),
                        hex::encode(&self.rx_buffer)
                    );
                    self.rx_buffer.clear();
                }
                return Err(SerialError::Timeout);
            }

            let slice_ms = (deadline - now).as_millis().clamp(1, READ_SLICE_MS as u128) as u64;
            match io.read_data(&mut chunk, slice_ms).await {
                Ok(n) => self.rx_buffer.extend_from_slice(&chunk[..n]),
                Err(SerialError::Timeout) => {}
                Err(e) => {
                    self.rx_buffer.clear();
                    return Err(e);
                }
            }
        }
    }

    /// Enumerate serial ports present on this host
    pub fn list_ports() -> Result<Vec<SerialDeviceInfo>> {
        let ports = serialport::available_ports()?;
        let devices = ports
            .into_iter()
            .map(|port| match port.port_type {
                SerialPortType::UsbPort(usb) => SerialDeviceInfo {
                    port_name: port.port_name,
                    port_type: "usb".to_string(),
                    vid: Some(usb.vid),
                    pid: Some(usb.pid),
                    serial_number: usb.serial_number,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                },
                other => SerialDeviceInfo {
                    port_name: port.port_name,
                    port_type: match other {
                        SerialPortType::PciPort => "pci",
                        SerialPortType::BluetoothPort => "bluetooth",
                        _ => "unknown",
                    }
                    .to_string(),
                    vid: None,
                    pid: None,
                    serial_number: None,
                    manufacturer: None,
                    product: None,
                },
            })
            .collect();
        Ok(devices)
    }
}
