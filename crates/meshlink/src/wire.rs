//! Frame encoder/decoder.
//!
//! Modules frame every message the same way on the wire; only the
//! escaping differs between the two framed operating modes. This module
//! handles the pure byte-level encoding and decoding, checksum
//! computation, and resynchronization after garbage.
//!
//! # Frame format
//!
//! ```text
//! 0x7E <len:u16 BE> <type> [<frame-id>] [<payload>...] <checksum>
//! ```
//!
//! - Start delimiter: `0x7E`
//! - `len`: number of frame-data bytes (type + id + payload)
//! - `type`: frame type tag (see [`FrameType`])
//! - `frame-id`: present only for types that carry a correlation id
//! - `checksum`: `0xFF - (sum of frame-data bytes)`
//!
//! In escaped mode every byte after the start delimiter that collides
//! with `{0x7E, 0x7D, 0x11, 0x13}` is emitted as `0x7D, byte ^ 0x20`.

use bytes::{BufMut, BytesMut};

use meshlink_core::frame::{Frame, FrameType};

/// Start-of-frame delimiter byte.
pub const START_DELIMITER: u8 = 0x7E;

/// Escape introducer byte (escaped mode only).
pub const ESCAPE: u8 = 0x7D;

/// XON flow-control byte, escaped in escaped mode.
pub const XON: u8 = 0x11;

/// XOFF flow-control byte, escaped in escaped mode.
pub const XOFF: u8 = 0x13;

/// XOR mask applied to escaped bytes.
const ESCAPE_MASK: u8 = 0x20;

/// Returns `true` if `byte` must be escaped in escaped mode.
fn needs_escape(byte: u8) -> bool {
    matches!(byte, START_DELIMITER | ESCAPE | XON | XOFF)
}

/// Compute the checksum over frame-data bytes.
fn checksum(frame_data: &[u8]) -> u8 {
    let sum: u8 = frame_data
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    0xFF - sum
}

/// Encode a frame into raw bytes ready for transmission.
///
/// Produces the full wire form including delimiter, length, and checksum.
/// The frame-id byte is emitted only for frame types that carry one.
///
/// # Example
///
/// ```
/// use meshlink::wire::encode_frame;
/// use meshlink_core::frame::{Frame, FrameType};
///
/// // AT command "AP", frame id 1.
/// let frame = Frame::with_frame_id(FrameType::AtCommand, 0x01, b"AP".to_vec());
/// let bytes = encode_frame(&frame, false);
/// assert_eq!(bytes, vec![0x7E, 0x00, 0x04, 0x08, 0x01, 0x41, 0x50, 0x65]);
/// ```
pub fn encode_frame(frame: &Frame, escaped: bool) -> Vec<u8> {
    let mut frame_data =
        Vec::with_capacity(2 + frame.payload().len());
    frame_data.push(frame.frame_type().tag());
    if frame.needs_frame_id() {
        frame_data.push(frame.frame_id());
    }
    frame_data.extend_from_slice(frame.payload());

    let len = frame_data.len() as u16;
    let cks = checksum(&frame_data);

    let mut buf = BytesMut::with_capacity(4 + frame_data.len() + frame_data.len() / 4);
    buf.put_u8(START_DELIMITER);

    let put_escaped = |buf: &mut BytesMut, byte: u8| {
        if escaped && needs_escape(byte) {
            buf.put_u8(ESCAPE);
            buf.put_u8(byte ^ ESCAPE_MASK);
        } else {
            buf.put_u8(byte);
        }
    };

    for byte in len.to_be_bytes() {
        put_escaped(&mut buf, byte);
    }
    for &byte in &frame_data {
        put_escaped(&mut buf, byte);
    }
    put_escaped(&mut buf, cks);

    buf.to_vec()
}

/// Result of attempting to decode a frame from a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeResult {
    /// A complete frame was decoded. The `usize` is the number of bytes
    /// consumed from the input buffer (including any garbage skipped
    /// before the start delimiter).
    Frame(Frame, usize),

    /// The buffer does not yet contain a complete frame. More data is
    /// needed.
    Incomplete,

    /// The buffer contains data that cannot be a valid frame (checksum
    /// mismatch, unknown type tag, truncated escape sequence). The
    /// `usize` is the number of bytes to discard before retrying.
    Invalid(usize),
}

/// Attempt to decode one frame from a byte buffer.
///
/// Scans `buf` for a start delimiter; any bytes before it are counted as
/// consumed garbage (line noise, legacy-mode chatter). Returns
/// [`DecodeResult::Frame`] with the number of bytes the caller should
/// drain, [`DecodeResult::Incomplete`] when more data is needed, or
/// [`DecodeResult::Invalid`] when the candidate frame is corrupt.
///
/// # Example
///
/// ```
/// use meshlink::wire::{decode_frame, DecodeResult};
/// use meshlink_core::frame::FrameType;
///
/// let buf = [0x7E, 0x00, 0x06, 0x88, 0x01, 0x41, 0x50, 0x00, 0x01, 0xE4];
/// match decode_frame(&buf, false) {
///     DecodeResult::Frame(frame, consumed) => {
///         assert_eq!(frame.frame_type(), FrameType::AtResponse);
///         assert_eq!(frame.frame_id(), 0x01);
///         assert_eq!(consumed, 10);
///     }
///     _ => panic!("expected a frame"),
/// }
/// ```
pub fn decode_frame(buf: &[u8], escaped: bool) -> DecodeResult {
    let start = match buf.iter().position(|&b| b == START_DELIMITER) {
        Some(pos) => pos,
        None => return DecodeResult::Incomplete,
    };

    // Unescape (or copy) bytes following the delimiter until we have
    // length + frame-data + checksum, tracking how many raw bytes that
    // took.
    let mut body = Vec::new();
    let mut raw_idx = start + 1;
    let mut expected: Option<usize> = None;

    while raw_idx < buf.len() {
        let byte = buf[raw_idx];

        if escaped && byte == START_DELIMITER {
            // A new delimiter inside an escaped frame means the previous
            // frame was cut short; discard up to it and resync.
            return DecodeResult::Invalid(raw_idx);
        }

        let value = if escaped && byte == ESCAPE {
            match buf.get(raw_idx + 1) {
                Some(&next) => {
                    raw_idx += 2;
                    next ^ ESCAPE_MASK
                }
                // Escape introducer at the end of the buffer.
                None => return DecodeResult::Incomplete,
            }
        } else {
            raw_idx += 1;
            byte
        };
        body.push(value);

        if body.len() == 2 {
            let len = u16::from_be_bytes([body[0], body[1]]) as usize;
            // length bytes + frame data + checksum
            expected = Some(2 + len + 1);
        }
        if let Some(total) = expected {
            if body.len() == total {
                return finish_frame(&body, raw_idx);
            }
        }
    }

    DecodeResult::Incomplete
}

/// Validate checksum and build the [`Frame`] from an unescaped body.
fn finish_frame(body: &[u8], consumed: usize) -> DecodeResult {
    let frame_data = &body[2..body.len() - 1];
    let cks = body[body.len() - 1];

    if checksum(frame_data) != cks {
        return DecodeResult::Invalid(consumed);
    }
    if frame_data.is_empty() {
        return DecodeResult::Invalid(consumed);
    }

    let frame_type = match FrameType::from_tag(frame_data[0]) {
        Some(ft) => ft,
        None => return DecodeResult::Invalid(consumed),
    };

    let frame = if frame_type.needs_frame_id() {
        if frame_data.len() < 2 {
            return DecodeResult::Invalid(consumed);
        }
        Frame::with_frame_id(frame_type, frame_data[1], frame_data[2..].to_vec())
    } else {
        Frame::new(frame_type, frame_data[1..].to_vec())
    };

    DecodeResult::Frame(frame, consumed)
}
