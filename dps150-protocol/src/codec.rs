//! Stream decoder for frames arriving over a byte-oriented transport.
//!
//! The transport delivers arbitrary chunks: a frame may be split across
//! reads, several frames may arrive in one read, and line noise or a corrupt
//! byte may appear anywhere. The scan looks for a header (direction byte
//! followed by an accepted command byte), waits when the header or payload is
//! incomplete, and on a checksum mismatch discards the candidate header byte
//! and rescans from the next position.

use crate::frame::{checksum, Command, Direction, Frame};
use bytes::{Buf, Bytes, BytesMut};

/// Which frames a decoder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMatcher {
    /// Device responses and pushes: `0xF0 0xA1`.
    Device,
    /// Host commands: `0xF1` followed by any known command byte.
    Host,
}

impl FrameMatcher {
    fn direction(self) -> u8 {
        match self {
            FrameMatcher::Device => Direction::DeviceToHost.as_byte(),
            FrameMatcher::Host => Direction::HostToDevice.as_byte(),
        }
    }

    fn accepts_command(self, byte: u8) -> bool {
        match self {
            FrameMatcher::Device => byte == Command::Get.as_byte(),
            FrameMatcher::Host => Command::from_byte(byte).is_ok(),
        }
    }
}

/// Result of one scan step over a buffer.
enum Scan {
    /// A valid frame spanning up to `end` (exclusive).
    Frame { frame: Frame, end: usize },
    /// The candidate header at `at` failed its checksum.
    Corrupt { at: usize },
    /// No complete frame; bytes before `keep_from` can never start one.
    Incomplete { keep_from: usize },
}

fn scan(buf: &[u8], from: usize, matcher: FrameMatcher) -> Scan {
    let dir = matcher.direction();

    let start = (from..buf.len()).find(|&i| {
        buf[i] == dir && buf.get(i + 1).map_or(true, |&c| matcher.accepts_command(c))
    });
    let Some(start) = start else {
        return Scan::Incomplete {
            keep_from: buf.len(),
        };
    };

    // partial header
    if buf.len() - start < 4 {
        return Scan::Incomplete { keep_from: start };
    }

    let len = buf[start + 3] as usize;
    let payload_start = start + 4;
    let checksum_at = payload_start + len;
    // partial payload
    if checksum_at + 1 > buf.len() {
        return Scan::Incomplete { keep_from: start };
    }

    let type_code = buf[start + 2];
    let payload = &buf[payload_start..checksum_at];
    if checksum(type_code, payload) != buf[checksum_at] {
        return Scan::Corrupt { at: start };
    }

    let (Ok(direction), Ok(command)) = (
        Direction::from_byte(buf[start]),
        Command::from_byte(buf[start + 1]),
    ) else {
        // unreachable for matched headers; treat as noise
        return Scan::Corrupt { at: start };
    };

    Scan::Frame {
        frame: Frame {
            direction,
            command,
            type_code,
            payload: Bytes::copy_from_slice(payload),
        },
        end: checksum_at + 1,
    }
}

/// Frames extracted from a buffer and how much of the buffer they used up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeOutcome {
    /// Checksum-valid frames, in stream order.
    pub frames: Vec<Frame>,
    /// Number of leading bytes that can be discarded.
    pub consumed: usize,
    /// Number of candidate headers rejected for a bad checksum.
    pub rejected: usize,
}

/// Extracts every complete device frame from `buf`.
///
/// Pure: the caller drops `consumed` bytes from the front of its buffer and
/// calls again once more bytes have arrived.
pub fn decode_frames(buf: &[u8]) -> DecodeOutcome {
    decode_frames_matching(buf, FrameMatcher::Device)
}

/// Like [`decode_frames`] with an explicit frame matcher.
pub fn decode_frames_matching(buf: &[u8], matcher: FrameMatcher) -> DecodeOutcome {
    let mut outcome = DecodeOutcome::default();
    let mut cursor = 0;

    loop {
        match scan(buf, cursor, matcher) {
            Scan::Frame { frame, end } => {
                outcome.frames.push(frame);
                cursor = end;
            }
            Scan::Corrupt { at } => {
                outcome.rejected += 1;
                cursor = at + 1;
            }
            Scan::Incomplete { keep_from } => {
                outcome.consumed = keep_from;
                return outcome;
            }
        }
    }
}

/// Decoder owning the accumulation buffer for one stream.
pub struct Decoder {
    buffer: BytesMut,
    matcher: FrameMatcher,
    rejected: u64,
}

impl Decoder {
    /// Decoder for frames sent by the device.
    pub fn device() -> Self {
        Self::with_matcher(FrameMatcher::Device)
    }

    /// Decoder for frames sent by the host (used by device simulators).
    pub fn host() -> Self {
        Self::with_matcher(FrameMatcher::Host)
    }

    pub fn with_matcher(matcher: FrameMatcher) -> Self {
        Self {
            buffer: BytesMut::with_capacity(1024),
            matcher,
            rejected: 0,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `None` when more data is needed. Corrupt frames are skipped.
    pub fn decode_frame(&mut self) -> Option<Frame> {
        loop {
            match scan(&self.buffer, 0, self.matcher) {
                Scan::Frame { frame, end } => {
                    self.buffer.advance(end);
                    return Some(frame);
                }
                Scan::Corrupt { at } => {
                    self.rejected += 1;
                    self.buffer.advance(at + 1);
                }
                Scan::Incomplete { keep_from } => {
                    self.buffer.advance(keep_from);
                    return None;
                }
            }
        }
    }

    /// Decodes every complete frame currently buffered.
    pub fn decode_all(&mut self) -> Vec<Frame> {
        let outcome = decode_frames_matching(&self.buffer, self.matcher);
        self.buffer.advance(outcome.consumed);
        self.rejected += outcome.rejected as u64;
        outcome.frames
    }

    /// Returns the number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total number of frames dropped for a bad checksum.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::device()
    }
}
