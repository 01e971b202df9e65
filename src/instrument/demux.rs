//! Binary stream demultiplexer.
//!
//! The instrument streams 16-bit current samples interleaved with metadata
//! frames. A frame starts with the marker byte `0xF0` followed by a frame-type
//! byte; everything else is a sample.
//!
//! Sample encoding: the top nibble of the first byte is a base-16 exponent `e`,
//! the remaining 12 bits form a mantissa `m`, and the current in amperes is
//! `m × 16^(-e)`.
//!
//! Frame shapes, lengths include the two header bytes:
//!
//! | type            | total length                      |
//! |-----------------|-----------------------------------|
//! | `0xF1` (text)   | up to and including `0D 0A FF FF` |
//! | `0xF2` (error)  | up to and including `0D 0A FF FF` |
//! | `0xF3` (time)   | 9                                 |
//! | `0xF4`          | 4                                 |
//! | `0xF5`          | 8                                 |
//! | `0xF6`          | 4                                 |
//! | `0xF7`, `0xF8`  | 6                                 |
//! | `0xF9`          | 5                                 |
//! | `0xFA`, `0xFB`  | 4                                 |
//!
//! Any other type is kept as a two-byte frame.

use crate::error::{AppResult, DaqError};

/// First byte of every metadata frame.
pub const FRAME_MARKER: u8 = 0xF0;

/// Terminator closing a text frame.
pub const FRAME_TERMINATOR: [u8; 4] = [13, 10, 255, 255];

const HEADER_LEN: usize = 2;

/// Total length of a fixed-size frame, header included.
pub fn fixed_frame_len(frame_type: u8) -> Option<usize> {
    match frame_type {
        0xF3 => Some(9),
        0xF4 => Some(4),
        0xF5 => Some(8),
        0xF6 => Some(4),
        0xF7 | 0xF8 => Some(6),
        0xF9 => Some(5),
        0xFA | 0xFB => Some(4),
        _ => None,
    }
}

/// Frame types whose length is given by the terminator.
pub fn is_terminated_frame(frame_type: u8) -> bool {
    matches!(frame_type, 0xF1 | 0xF2)
}

/// One decoded current sample.
#[derive(Debug, Clone, PartialEq)]
pub struct RawSample {
    /// The two source bytes as lower-case hex, e.g. `"2a3f"`.
    pub hex: String,
    /// Current in amperes.
    pub value: f64,
}

impl RawSample {
    /// Decode a byte pair.
    pub fn decode(b1: u8, b2: u8) -> Self {
        let exponent = i32::from(b1 >> 4);
        let mantissa = (u16::from(b1 & 0x0F) << 8) | u16::from(b2);
        Self {
            hex: format!("{:02x}{:02x}", b1, b2),
            value: f64::from(mantissa) * 16f64.powi(-exponent),
        }
    }
}

/// Interpretation of a metadata frame type.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    ErrorMessage,
    Timestamp,
    /// Fixed-size frame without a decoded meaning.
    Fixed(u8),
    Unknown(u8),
}

/// Out-of-band frame found in the sample stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFrame {
    /// Byte offset of the marker in the captured buffer.
    pub offset: usize,
    /// Complete frame, marker and type included.
    pub bytes: Vec<u8>,
}

impl MetadataFrame {
    /// Frame-type byte.
    pub fn frame_type(&self) -> u8 {
        self.bytes[1]
    }

    #[allow(missing_docs)]
    pub fn kind(&self) -> FrameKind {
        match self.frame_type() {
            0xF1 => FrameKind::Message,
            0xF2 => FrameKind::ErrorMessage,
            0xF3 => FrameKind::Timestamp,
            other if fixed_frame_len(other).is_some() => FrameKind::Fixed(other),
            other => FrameKind::Unknown(other),
        }
    }

    /// Bytes after the header, without the terminator of text frames.
    pub fn payload(&self) -> &[u8] {
        let body = &self.bytes[HEADER_LEN..];
        if is_terminated_frame(self.frame_type()) {
            &body[..body.len().saturating_sub(FRAME_TERMINATOR.len())]
        } else {
            body
        }
    }

    /// Device time in milliseconds: the first four payload bytes of a
    /// timestamp frame, big-endian.
    pub fn timestamp_ms(&self) -> Option<u32> {
        match (self.kind(), self.payload()) {
            (FrameKind::Timestamp, [a, b, c, d, ..]) => Some(u32::from_be_bytes([*a, *b, *c, *d])),
            _ => None,
        }
    }

    /// Text of a message or error-message frame.
    pub fn text(&self) -> Option<String> {
        match self.kind() {
            FrameKind::Message | FrameKind::ErrorMessage => {
                Some(String::from_utf8_lossy(self.payload()).trim().to_string())
            }
            _ => None,
        }
    }
}

/// Samples and frames in stream order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Demultiplexed {
    #[allow(missing_docs)]
    pub samples: Vec<RawSample>,
    #[allow(missing_docs)]
    pub frames: Vec<MetadataFrame>,
}

impl Demultiplexed {
    /// Frames whose type is not in the frame table.
    pub fn unknown_frames(&self) -> impl Iterator<Item = &MetadataFrame> {
        self.frames
            .iter()
            .filter(|f| matches!(f.kind(), FrameKind::Unknown(_)))
    }
}

/// Split a captured buffer into samples and metadata frames.
///
/// # Errors
/// [`DaqError::ProtocolDecode`] if a frame extends past the end of `buf`.
pub fn demultiplex(buf: &[u8]) -> AppResult<Demultiplexed> {
    let mut out = Demultiplexed {
        samples: Vec::with_capacity(buf.len() / 2),
        frames: Vec::new(),
    };
    let mut pos = 0;

    while buf.len() - pos >= HEADER_LEN {
        let (b1, b2) = (buf[pos], buf[pos + 1]);
        if b1 != FRAME_MARKER {
            out.samples.push(RawSample::decode(b1, b2));
            pos += 2;
            continue;
        }

        let end = frame_end(buf, pos, b2)?;
        out.frames.push(MetadataFrame {
            offset: pos,
            bytes: buf[pos..end].to_vec(),
        });
        pos = end;
    }

    Ok(out)
}

fn frame_end(buf: &[u8], start: usize, frame_type: u8) -> AppResult<usize> {
    if let Some(len) = fixed_frame_len(frame_type) {
        if start + len > buf.len() {
            return Err(DaqError::ProtocolDecode(format!(
                "frame 0x{:02X} at offset {} needs {} bytes but only {} were captured",
                frame_type,
                start,
                len,
                buf.len() - start
            )));
        }
        return Ok(start + len);
    }

    if is_terminated_frame(frame_type) {
        let body_start = start + HEADER_LEN;
        return buf[body_start..]
            .windows(FRAME_TERMINATOR.len())
            .position(|w| w == FRAME_TERMINATOR)
            .map(|i| body_start + i + FRAME_TERMINATOR.len())
            .ok_or_else(|| {
                DaqError::ProtocolDecode(format!(
                    "frame 0x{:02X} at offset {} is not terminated before the end of the capture",
                    frame_type, start
                ))
            });
    }

    Ok(start + HEADER_LEN)
}
