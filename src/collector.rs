//! # BMS Frame Collector
//!
//! Incremental reassembler turning an unbounded byte stream into a sequence
//! of validated frames. The underlying transports deliver bytes at arbitrary
//! chunk boundaries — a BLE notification may carry a fragment of one frame or
//! pieces of two, and an MQTT payload may coalesce several — so the collector
//! never assumes a delivery boundary equals a frame boundary.
//!
//! State machine per extraction attempt:
//! - **SeekHeader**: scan the buffer for the 2-byte header; preceding bytes
//!   are discarded as garbage.
//! - **AwaitLength**: wait for enough bytes to compute the expected total
//!   length (byte-count field for read-class frames, fixed otherwise).
//! - **AwaitBody**: wait until the buffer holds the whole candidate frame.
//! - **Validate**: check the trailer byte at the expected final offset; a
//!   missing trailer means the header match was spurious — advance one byte
//!   and rescan rather than waiting indefinitely.
//! - **Emit**: decode via the codec; on CRC failure drop only the matched
//!   header byte and rescan, since a real frame may follow in the buffer.
//!
//! ```rust
//! use voltage_bms::collector::{FrameCollector, Direction};
//! use voltage_bms::frame::CrcMode;
//!
//! let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
//! let frames = collector.push(&[0x7F, 0x55]); // partial delivery, no frame yet
//! assert!(frames.is_empty());
//! ```

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::frame::{Frame, BmsFunction, CrcMode, FRAME_HEADER, FRAME_TAIL, MIN_FRAME_LEN};

/// Which side of the conversation this collector listens to
///
/// Frame length computation differs between the two directions: a 0x10 frame
/// from the host is a write request carrying data, while the same function
/// code from the device is a fixed-length write response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Reassembling responses and reports sent by a device
    FromDevice,
    /// Reassembling requests sent by a host (simulator side)
    FromHost,
}

/// Collector diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectorStats {
    /// Frames successfully validated and emitted
    pub frames_emitted: u64,
    /// Candidate frames rejected by CRC (signal-quality indicator)
    pub crc_failures: u64,
    /// One-byte advances past spurious header matches
    pub resyncs: u64,
    /// Garbage bytes discarded before a header match
    pub garbage_bytes: u64,
}

/// Re-entrant stream-to-frame reassembler
#[derive(Debug)]
pub struct FrameCollector {
    direction: Direction,
    crc_mode: CrcMode,
    allow_crc_fallback: bool,
    buf: BytesMut,
    stats: CollectorStats,
}

impl FrameCollector {
    /// Create a collector with CRC fallback enabled (field default)
    pub fn new(direction: Direction, crc_mode: CrcMode) -> Self {
        Self::with_fallback(direction, crc_mode, true)
    }

    /// Create a collector with explicit CRC fallback behavior
    pub fn with_fallback(direction: Direction, crc_mode: CrcMode, allow_crc_fallback: bool) -> Self {
        Self {
            direction,
            crc_mode,
            allow_crc_fallback,
            buf: BytesMut::with_capacity(512),
            stats: CollectorStats::default(),
        }
    }

    /// Feed one inbound delivery, returning every frame completed by it
    ///
    /// Must be called for every delivery in arrival order; emitted frames
    /// preserve network arrival order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one() {
            frames.push(frame);
        }
        frames
    }

    /// Number of bytes currently buffered awaiting completion
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Collector diagnostics snapshot
    pub fn stats(&self) -> CollectorStats {
        self.stats
    }

    /// Drop all buffered bytes (session reset)
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn try_extract_one(&mut self) -> Option<Frame> {
        loop {
            if !self.seek_header() {
                return None;
            }

            let expected = match self.expected_length() {
                LengthOutcome::Known(len) => len,
                LengthOutcome::NeedMore => return None,
                LengthOutcome::Spurious => {
                    self.advance_resync();
                    continue;
                }
            };

            if self.buf.len() < expected {
                return None;
            }

            if self.buf[expected - 1] != FRAME_TAIL {
                trace!("missing trailer at offset {}, rescanning", expected - 1);
                self.advance_resync();
                continue;
            }

            match Frame::decode(&self.buf[..expected], self.crc_mode, self.allow_crc_fallback) {
                Ok(frame) => {
                    self.buf.advance(expected);
                    self.stats.frames_emitted += 1;
                    return Some(frame);
                }
                Err(err) => {
                    debug!("frame rejected: {}", err);
                    if matches!(err, crate::error::BmsError::CrcMismatch { .. }) {
                        self.stats.crc_failures += 1;
                    }
                    self.advance_resync();
                }
            }
        }
    }

    /// Discard garbage until the buffer starts with the frame header.
    /// Returns false when no header is present yet.
    fn seek_header(&mut self) -> bool {
        if self.buf.len() < 2 {
            return false;
        }
        if let Some(pos) = self.buf
            .windows(2)
            .position(|w| w == FRAME_HEADER)
        {
            if pos > 0 {
                self.stats.garbage_bytes += pos as u64;
                self.buf.advance(pos);
            }
            true
        } else {
            // Keep a trailing first-header byte, it may pair with the next chunk
            let keep = usize::from(self.buf[self.buf.len() - 1] == FRAME_HEADER[0]);
            let drop = self.buf.len() - keep;
            self.stats.garbage_bytes += drop as u64;
            self.buf.advance(drop);
            false
        }
    }

    /// Compute the candidate frame's total length from the bytes buffered so
    /// far. The buffer is known to start with the header.
    fn expected_length(&self) -> LengthOutcome {
        if self.buf.len() < 5 {
            return LengthOutcome::NeedMore;
        }
        let function = self.buf[4];

        match self.direction {
            Direction::FromDevice => {
                // UUID responses carry the raw 0xFF function byte, which also
                // has the error bit set; byte-count framing wins for that code
                if function == BmsFunction::ReadUuid.to_u8() {
                    return if self.buf.len() < 6 {
                        LengthOutcome::NeedMore
                    } else {
                        LengthOutcome::Known(MIN_FRAME_LEN + self.buf[5] as usize)
                    };
                }
                // Error frames are fixed-length regardless of function class
                if function & 0x80 != 0 {
                    return LengthOutcome::Known(MIN_FRAME_LEN);
                }
                let func = match BmsFunction::from_u8(function) {
                    Ok(f) => f,
                    Err(_) => return LengthOutcome::Spurious,
                };
                if func.is_write_function() {
                    LengthOutcome::Known(12)
                } else if self.buf.len() < 6 {
                    LengthOutcome::NeedMore
                } else {
                    LengthOutcome::Known(MIN_FRAME_LEN + self.buf[5] as usize)
                }
            }
            Direction::FromHost => {
                let func = match BmsFunction::from_u8(function) {
                    Ok(f) => f,
                    Err(_) => return LengthOutcome::Spurious,
                };
                if func.is_write_function() {
                    if self.buf.len() < 10 {
                        LengthOutcome::NeedMore
                    } else {
                        LengthOutcome::Known(13 + self.buf[9] as usize)
                    }
                } else {
                    LengthOutcome::Known(12)
                }
            }
        }
    }

    /// Advance past a spurious or rejected header match by a single byte
    fn advance_resync(&mut self) {
        self.buf.advance(1);
        self.stats.resyncs += 1;
    }
}

enum LengthOutcome {
    Known(usize),
    NeedMore,
    Spurious,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    fn sample_response() -> (Frame, Vec<u8>) {
        let frame = Frame::read_response(0x40, 0x01, BmsFunction::ReadHolding,
                                         vec![0x0C, 0xE4, 0x0C, 0xE5, 0x0C, 0xE6]);
        let bytes = frame.encode(CrcMode::AfterHeader).unwrap();
        (frame, bytes)
    }

    #[test]
    fn test_whole_frame_single_push() {
        let (frame, bytes) = sample_response();
        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
        let frames = collector.push(&bytes);
        assert_eq!(frames, vec![frame]);
        assert_eq!(collector.pending_bytes(), 0);
    }

    #[test]
    fn test_every_split_boundary() {
        let (frame, bytes) = sample_response();

        for split in 0..=bytes.len() {
            let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
            let mut frames = collector.push(&bytes[..split]);
            frames.extend(collector.push(&bytes[split..]));
            assert_eq!(frames, vec![frame.clone()], "split at byte {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let (frame, bytes) = sample_response();
        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);

        let mut frames = Vec::new();
        for &b in &bytes {
            frames.extend(collector.push(&[b]));
        }
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn test_coalesced_frames() {
        let (frame, bytes) = sample_response();
        let error = Frame::error(0x40, 0x01, 0x03, 0x02);
        let error_bytes = error.encode(CrcMode::AfterHeader).unwrap();

        let mut wire = bytes.clone();
        wire.extend_from_slice(&error_bytes);

        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
        let frames = collector.push(&wire);
        assert_eq!(frames, vec![frame, error]);
    }

    #[test]
    fn test_garbage_prefix_resync() {
        let (frame, bytes) = sample_response();
        let mut wire = vec![0x00, 0x13, 0x7F, 0xAB]; // noise, incl. a lone header byte
        wire.extend_from_slice(&bytes);

        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
        let frames = collector.push(&wire);
        assert_eq!(frames, vec![frame]);
        assert!(collector.stats().garbage_bytes > 0);
    }

    #[test]
    fn test_bit_flip_rejected_then_recovers() {
        let (frame, bytes) = sample_response();

        // Flip every payload bit in turn; the corrupted frame must never be
        // emitted, and a clean frame following it must still come through.
        for byte_idx in 6..6 + 6 {
            for bit in 0..8 {
                let mut corrupted = bytes.clone();
                corrupted[byte_idx] ^= 1 << bit;

                let mut wire = corrupted;
                wire.extend_from_slice(&bytes);

                let mut collector =
                    FrameCollector::with_fallback(Direction::FromDevice, CrcMode::AfterHeader, false);
                let frames = collector.push(&wire);
                assert_eq!(frames, vec![frame.clone()],
                           "byte {} bit {} produced a corrupt frame", byte_idx, bit);
                assert!(collector.stats().crc_failures >= 1);
            }
        }
    }

    #[test]
    fn test_uuid_response_reassembly() {
        // 0xFF has the error bit set but is a read-class response and must be
        // sized from its byte-count, not as a 9-byte error frame
        let frame = Frame::read_response(0x40, 0x01, BmsFunction::ReadUuid,
                                         b"VE-SIM-0000-0001".to_vec());
        let bytes = frame.encode(CrcMode::AfterHeader).unwrap();

        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
        assert_eq!(collector.push(&bytes), vec![frame.clone()]);
        assert_eq!(collector.pending_bytes(), 0);
        assert_eq!(collector.stats().resyncs, 0);

        for split in 0..=bytes.len() {
            let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
            let mut frames = collector.push(&bytes[..split]);
            frames.extend(collector.push(&bytes[split..]));
            assert_eq!(frames, vec![frame.clone()], "split at byte {}", split);
        }
    }

    #[test]
    fn test_spurious_header_in_noise() {
        // Header bytes followed by an impossible function code must not stall
        let mut collector = FrameCollector::new(Direction::FromDevice, CrcMode::AfterHeader);
        let (frame, bytes) = sample_response();

        let mut wire = vec![0x7F, 0x55, 0x01, 0x02, 0x07, 0x99];
        wire.extend_from_slice(&bytes);
        let frames = collector.push(&wire);
        assert_eq!(frames, vec![frame]);
        assert!(collector.stats().resyncs >= 1);
    }

    #[test]
    fn test_from_host_write_request() {
        let request = Frame::write_request(0x01, 0x40, BmsFunction::WriteMultiple,
                                           0x0200, &[0xAAAA, 0xBBBB]);
        let bytes = request.encode(CrcMode::AfterHeader).unwrap();

        let mut collector = FrameCollector::new(Direction::FromHost, CrcMode::AfterHeader);
        // Deliver in two fragments splitting inside the data section
        let mut frames = collector.push(&bytes[..11]);
        assert!(frames.is_empty());
        frames.extend(collector.push(&bytes[11..]));
        assert_eq!(frames, vec![request]);
    }

    #[test]
    fn test_from_host_read_request() {
        let request = Frame::read_request(0x01, 0x40, BmsFunction::ReadInput, 0x013F, 2);
        let bytes = request.encode(CrcMode::AfterHeader).unwrap();

        let mut collector = FrameCollector::new(Direction::FromHost, CrcMode::AfterHeader);
        let frames = collector.push(&bytes);
        assert_eq!(frames.len(), 1);
        match &frames[0].kind {
            FrameKind::ReadRequest { start, quantity } => {
                assert_eq!(*start, 0x013F);
                assert_eq!(*quantity, 2);
            }
            other => panic!("unexpected kind: {:?}", other),
        }
    }
}
