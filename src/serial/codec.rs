use serde::{Deserialize, Serialize};

/// JSK start-of-text marker (STX).
pub const JSK_START_MARKER: [u8; 2] = [0xFA, 0xFB];

/// The length field is a single byte.
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Checksum arithmetic applied to every byte ahead of the checksum field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Checksum {
    /// Running XOR, as used by JSK VMC boards.
    #[default]
    Xor,
    /// Running sum modulo 256.
    Sum,
}

impl Checksum {
    pub fn compute(self, bytes: &[u8]) -> u8 {
        match self {
            Checksum::Xor => bytes.iter().fold(0u8, |acc, b| acc ^ b),
            Checksum::Sum => bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)),
        }
    }
}

/// Frame layout description.
///
/// ```text
/// ┌──────────────┬───────────┬─────────┬────────┬───────────┬──────────┬───────────┐
/// │ Start marker │ Address   │ Command │ Length │ Payload   │ Checksum │ End       │
/// │ (1+ bytes)   │ (0/1 B)   │ (1 B)   │ (1 B)  │ (Length)  │ (1 B)    │ (0/1 B)   │
/// └──────────────┴───────────┴─────────┴────────┴───────────┴──────────┴───────────┘
/// ```
///
/// JSK boards use `FA FB | cmd | len | payload | xor` with no address byte and
/// no end marker, which is the default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub start_marker: Vec<u8>,
    pub address: Option<u8>,
    pub end_marker: Option<u8>,
    pub checksum: Checksum,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            start_marker: JSK_START_MARKER.to_vec(),
            address: None,
            end_marker: None,
            checksum: Checksum::Xor,
        }
    }
}

impl CodecConfig {
    /// Bytes up to and including the length field.
    fn header_len(&self) -> usize {
        self.start_marker.len() + usize::from(self.address.is_some()) + 2
    }

    /// Checksum plus optional end marker.
    fn trailer_len(&self) -> usize {
        1 + usize::from(self.end_marker.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: Option<u8>,
    pub command: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            address: None,
            command,
            payload: payload.into(),
        }
    }
}

/// Codec failures. Every variant other than `PayloadTooLarge` describes a
/// corrupt inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptFrame {
    #[error("No start marker in {0} bytes")]
    MissingStart(usize),

    #[error("Truncated frame: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("{extra} bytes past the declared frame length")]
    TrailingBytes { extra: usize },

    #[error("Checksum mismatch: received 0x{received:02X}, calculated 0x{calculated:02X}")]
    ChecksumMismatch { received: u8, calculated: u8 },

    #[error("Missing end marker: expected 0x{expected:02X}, found 0x{found:02X}")]
    MissingEndMarker { expected: u8, found: u8 },

    #[error("Payload of {0} bytes does not fit the length field")]
    PayloadTooLarge(usize),
}

/// Result of scanning a receive buffer for the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    /// More bytes are needed.
    Incomplete,
    /// The first `n` bytes hold one frame (which may still fail `decode`).
    Complete(usize),
    /// The first `n` bytes cannot start a frame and should be dropped.
    Discard(usize),
}

#[derive(Debug, Clone, Default)]
pub struct FrameCodec {
    config: CodecConfig,
}

impl FrameCodec {
    pub fn new(config: CodecConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CodecConfig {
        &self.config
    }

    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, CorruptFrame> {
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(CorruptFrame::PayloadTooLarge(frame.payload.len()));
        }

        let mut out = Vec::with_capacity(
            self.config.header_len() + frame.payload.len() + self.config.trailer_len(),
        );
        out.extend_from_slice(&self.config.start_marker);
        if let Some(address) = self.config.address {
            out.push(frame.address.unwrap_or(address));
        }
        out.push(frame.command);
        out.push(frame.payload.len() as u8);
        out.extend_from_slice(&frame.payload);
        out.push(self.config.checksum.compute(&out));
        if let Some(end) = self.config.end_marker {
            out.push(end);
        }
        Ok(out)
    }

    /// Decode exactly one frame. Leading noise before the start marker is skipped.
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, CorruptFrame> {
        let marker = &self.config.start_marker;
        let start = find_marker(bytes, marker).ok_or(CorruptFrame::MissingStart(bytes.len()))?;
        let data = &bytes[start..];

        let header_len = self.config.header_len();
        let trailer_len = self.config.trailer_len();
        if data.len() < header_len {
            return Err(CorruptFrame::Truncated {
                expected: header_len + trailer_len,
                actual: data.len(),
            });
        }

        let mut idx = marker.len();
        let address = if self.config.address.is_some() {
            idx += 1;
            Some(data[idx - 1])
        } else {
            None
        };
        let command = data[idx];
        let payload_len = data[idx + 1] as usize;

        let body_end = header_len + payload_len;
        let total = body_end + trailer_len;
        if data.len() < total {
            return Err(CorruptFrame::Truncated {
                expected: total,
                actual: data.len(),
            });
        }
        if data.len() > total {
            return Err(CorruptFrame::TrailingBytes {
                extra: data.len() - total,
            });
        }

        let received = data[body_end];
        let calculated = self.config.checksum.compute(&data[..body_end]);
        if received != calculated {
            return Err(CorruptFrame::ChecksumMismatch {
                received,
                calculated,
            });
        }

        if let Some(expected) = self.config.end_marker {
            let found = data[body_end + 1];
            if found != expected {
                return Err(CorruptFrame::MissingEndMarker { expected, found });
            }
        }

        Ok(Frame {
            address,
            command,
            payload: data[header_len..body_end].to_vec(),
        })
    }

    /// Frame boundary predicate for the transport's `read_until`.
    pub fn boundary(&self, buf: &[u8]) -> Boundary {
        let marker = &self.config.start_marker;
        match find_marker(buf, marker) {
            None => {
                // Hold back a tail that could be the first half of a marker.
                let keep = partial_marker_tail(buf, marker);
                if buf.len() > keep {
                    Boundary::Discard(buf.len() - keep)
                } else {
                    Boundary::Incomplete
                }
            }
            Some(pos) if pos > 0 => Boundary::Discard(pos),
            Some(_) => {
                let header_len = self.config.header_len();
                if buf.len() < header_len {
                    return Boundary::Incomplete;
                }
                let payload_len = buf[header_len - 1] as usize;
                let total = header_len + payload_len + self.config.trailer_len();
                if buf.len() < total {
                    Boundary::Incomplete
                } else {
                    Boundary::Complete(total)
                }
            }
        }
    }
}

fn find_marker(haystack: &[u8], marker: &[u8]) -> Option<usize> {
    if marker.is_empty() {
        return Some(0);
    }
    haystack.windows(marker.len()).position(|w| w == marker)
}

fn partial_marker_tail(buf: &[u8], marker: &[u8]) -> usize {
    (1..marker.len())
        .rev()
        .find(|&k| buf.len() >= k && buf[buf.len() - k..] == marker[..k])
        .unwrap_or(0)
}
