//! In-process JSK board for tests and `--simulate` runs.
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::codec::{Frame, FrameCodec};
use super::interface::{PortConnector, SerialPortIO};
use super::protocol::{
    Command, StatusReport, AISLE_NORMAL, DISPENSE_IN_PROGRESS, DISPENSE_SUCCESS,
};
use super::{Result, SerialError};

/// How the simulated board behaves.
#[derive(Debug, Clone)]
pub struct SimScript {
    /// DISPENSING_STATUS codes reported after a dispense, in order
    pub dispense_codes: Vec<u8>,
    /// AISLE_STATUS_RESPONSE code per aisle; `default_aisle_code` otherwise
    pub aisle_codes: HashMap<u16, u8>,
    pub default_aisle_code: u8,
    /// Body of MACHINE_STATUS_RESPONSE after the comm number
    pub machine_status: Vec<u8>,
    /// ACK every host command on receipt
    pub ack_commands: bool,
    /// Never answer commands (polls still go out)
    pub silent: bool,
    /// Corrupt the checksum of this many upcoming terminal replies
    pub corrupt_replies: u32,
    /// Fail every host write as if the cable was pulled
    pub fail_writes: bool,
    /// Refuse to open
    pub unavailable: bool,
    pub reply_delay: Duration,
    /// Emit a POLL this often while idle
    pub poll_interval: Option<Duration>,
    /// After a dispense, keep reporting "dispensing" this often instead of
    /// finishing
    pub progress_interval: Option<Duration>,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            dispense_codes: vec![DISPENSE_IN_PROGRESS, DISPENSE_SUCCESS],
            aisle_codes: HashMap::new(),
            default_aisle_code: AISLE_NORMAL,
            machine_status: vec![0x00],
            ack_commands: true,
            silent: false,
            corrupt_replies: 0,
            fail_writes: false,
            unavailable: false,
            reply_delay: Duration::from_millis(5),
            poll_interval: Some(Duration::from_millis(20)),
            progress_interval: None,
        }
    }
}

/// Wire activity seen by the simulated board
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// A host command frame (anything but ACK)
    Command { command: u8, payload: Vec<u8> },
    /// A host ACK
    HostAck,
    /// Bytes handed to the host
    Delivered(usize),
}

struct SimState {
    script: SimScript,
    pending: VecDeque<(Instant, Vec<u8>)>,
    events: Vec<SimEvent>,
    connects: u32,
    overlapping_writes: u32,
    next_poll: Option<Instant>,
    /// Next repeat of an endless progress report
    progress: Option<(Instant, Vec<u8>)>,
}

#[derive(Clone)]
pub struct SimulatedVmc {
    state: Arc<Mutex<SimState>>,
    codec: FrameCodec,
}

impl SimulatedVmc {
    pub fn new(script: SimScript) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState {
                script,
                pending: VecDeque::new(),
                events: Vec::new(),
                connects: 0,
                overlapping_writes: 0,
                next_poll: None,
                progress: None,
            })),
            codec: FrameCodec::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn update_script(&self, change: impl FnOnce(&mut SimScript)) {
        change(&mut self.lock().script);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.lock().events.clone()
    }

    /// Host command frames received, ACKs excluded
    pub fn command_writes(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, SimEvent::Command { .. }))
            .count()
    }

    /// Commands written while replies to an earlier one were still unread
    pub fn overlapping_writes(&self) -> u32 {
        self.lock().overlapping_writes
    }

    pub fn connects(&self) -> u32 {
        self.lock().connects
    }

    /// Host ACKs received so far
    pub fn host_acks(&self) -> usize {
        self.lock().events.iter().filter(|e| **e == SimEvent::HostAck).count()
    }

    /// Queue an unsolicited VMC frame for the host to read.
    pub fn inject(&self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.lock().pending.push_back((Instant::now(), bytes));
        Ok(())
    }

    fn replies_for(&self, script: &SimScript, frame: &Frame) -> Vec<Frame> {
        let comm_number = frame.payload.first().copied().unwrap_or(0);
        let aisle_at = |offset: usize| -> u16 {
            match frame.payload.get(offset..offset + 2) {
                Some(b) => u16::from_be_bytes([b[0], b[1]]),
                None => 0,
            }
        };
        let report = |command: Command, code: u8, aisle: u16| {
            Frame::new(
                command.code(),
                StatusReport { comm_number, code, aisle }.to_payload(),
            )
        };

        let mut replies = Vec::new();
        if script.ack_commands {
            replies.push(Frame::new(Command::Ack.code(), Vec::new()));
        }
        match Command::from_code(frame.command) {
            Some(Command::SelectBuy) => {
                let aisle = aisle_at(1);
                for code in &script.dispense_codes {
                    replies.push(report(Command::DispensingStatus, *code, aisle));
                }
            }
            Some(Command::DriveAisleDirect) => {
                let aisle = aisle_at(3);
                for code in &script.dispense_codes {
                    replies.push(report(Command::DispensingStatus, *code, aisle));
                }
            }
            Some(Command::CheckAisle) => {
                let aisle = aisle_at(1);
                let code = script
                    .aisle_codes
                    .get(&aisle)
                    .copied()
                    .unwrap_or(script.default_aisle_code);
                replies.push(report(Command::AisleStatusResponse, code, aisle));
            }
            Some(Command::RequestMachineStatus) => {
                let mut body = vec![comm_number];
                body.extend_from_slice(&script.machine_status);
                replies.push(Frame::new(Command::MachineStatusResponse.code(), body));
            }
            _ => {}
        }
        replies
    }
}

#[async_trait]
impl SerialPortIO for SimulatedVmc {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if state.script.fail_writes {
            return Err(SerialError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated device disconnected",
            )));
        }

        let frame = match self.codec.decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::debug!("sim: ignoring undecodable host bytes: {}", e);
                return Ok(());
            }
        };
        if frame.command == Command::Ack.code() {
            state.events.push(SimEvent::HostAck);
            return Ok(());
        }

        if !state.pending.is_empty() {
            state.overlapping_writes += 1;
        }
        state.progress = None;
        state.events.push(SimEvent::Command {
            command: frame.command,
            payload: frame.payload.clone(),
        });
        if state.script.silent {
            return Ok(());
        }

        let mut replies = self.replies_for(&state.script, &frame);
        let mut encoded: Vec<Vec<u8>> = Vec::with_capacity(replies.len());
        for reply in replies.drain(..) {
            encoded.push(self.codec.encode(&reply)?);
        }
        if state.script.corrupt_replies > 0 {
            state.script.corrupt_replies -= 1;
            if let Some(last) = encoded.last_mut().and_then(|bytes| bytes.last_mut()) {
                *last ^= 0xFF;
            }
        }

        let mut ready_at = Instant::now() + state.script.reply_delay;
        for bytes in encoded {
            state.pending.push_back((ready_at, bytes));
            ready_at += Duration::from_millis(1);
        }

        let dispensing = matches!(
            Command::from_code(frame.command),
            Some(Command::SelectBuy | Command::DriveAisleDirect)
        );
        if let (true, Some(interval)) = (dispensing, state.script.progress_interval) {
            let aisle_at = if frame.command == Command::DriveAisleDirect.code() { 3 } else { 1 };
            let aisle = match frame.payload.get(aisle_at..aisle_at + 2) {
                Some(b) => u16::from_be_bytes([b[0], b[1]]),
                None => 0,
            };
            let report = StatusReport {
                comm_number: frame.payload.first().copied().unwrap_or(0),
                code: DISPENSE_IN_PROGRESS,
                aisle,
            };
            let bytes = self
                .codec
                .encode(&Frame::new(Command::DispensingStatus.code(), report.to_payload()))?;
            state.progress = Some((ready_at + interval, bytes));
        }
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let mut state = self.lock();
                let now = Instant::now();
                let ready = matches!(state.pending.front(), Some((at, _)) if *at <= now);
                if ready {
                    if let Some((at, mut bytes)) = state.pending.pop_front() {
                        let n = bytes.len().min(buf.len());
                        buf[..n].copy_from_slice(&bytes[..n]);
                        if n < bytes.len() {
                            state.pending.push_front((at, bytes.split_off(n)));
                        }
                        state.events.push(SimEvent::Delivered(n));
                        return Ok(n);
                    }
                }

                if state.pending.is_empty() {
                    if let Some((due, bytes)) = state.progress.clone() {
                        if due <= now {
                            let interval = state.script.progress_interval.unwrap_or(Duration::from_millis(100));
                            state.progress = Some((now + interval, bytes.clone()));
                            let n = bytes.len().min(buf.len());
                            buf[..n].copy_from_slice(&bytes[..n]);
                            state.events.push(SimEvent::Delivered(n));
                            return Ok(n);
                        }
                    }
                }

                if let Some(interval) = state.script.poll_interval {
                    if state.pending.is_empty() {
                        let due = *state.next_poll.get_or_insert(now + interval);
                        if due <= now {
                            state.next_poll = Some(now + interval);
                            let poll = self.codec.encode(&Frame::new(Command::Poll.code(), Vec::new()))?;
                            let n = poll.len().min(buf.len());
                            buf[..n].copy_from_slice(&poll[..n]);
                            return Ok(n);
                        }
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(SerialError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn clear_input(&mut self) -> Result<()> {
        let mut state = self.lock();
        let now = Instant::now();
        // Only bytes that have already "arrived" sit in the OS buffer.
        state.pending.retain(|(at, _)| *at > now);
        Ok(())
    }
}

impl PortConnector for SimulatedVmc {
    fn connect(&self) -> Result<Box<dyn SerialPortIO>> {
        let mut state = self.lock();
        if state.script.unavailable {
            return Err(SerialError::Unavailable {
                port: self.port_name(),
                reason: "simulated device absent".to_string(),
            });
        }
        state.connects += 1;
        drop(state);
        Ok(Box::new(self.clone()))
    }

    fn port_name(&self) -> String {
        "sim://jsk".to_string()
    }
}
