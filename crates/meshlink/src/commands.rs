//! Frame builders and well-known AT command names.
//!
//! Builders produce [`Frame`]s with no id assigned; the correlator
//! assigns ids at send time. Parameter payload semantics are command-
//! specific and left to callers -- this module only knows the frame
//! layouts.

use meshlink_core::addr::{Addr16, Addr64};
use meshlink_core::frame::{AtCmd, Frame, FrameType};

/// Framing mode query ("AP").
pub const CMD_API_MODE: AtCmd = AtCmd(*b"AP");
/// Network discovery scan ("ND").
pub const CMD_NODE_DISCOVER: AtCmd = AtCmd(*b"ND");
/// Node discovery timeout in 100 ms units ("NT").
pub const CMD_DISCOVER_TIMEOUT: AtCmd = AtCmd(*b"NT");
/// Advertised maximum discovery time in milliseconds ("N?").
pub const CMD_DISCOVER_TOTAL_TIME: AtCmd = AtCmd(*b"N?");
/// Sleep mode ("SM").
pub const CMD_SLEEP_MODE: AtCmd = AtCmd(*b"SM");
/// Software reset ("FR").
pub const CMD_SOFTWARE_RESET: AtCmd = AtCmd(*b"FR");
/// 64-bit address high word ("SH").
pub const CMD_ADDR_HIGH: AtCmd = AtCmd(*b"SH");
/// 64-bit address low word ("SL").
pub const CMD_ADDR_LOW: AtCmd = AtCmd(*b"SL");
/// 16-bit network address ("MY").
pub const CMD_ADDR_16: AtCmd = AtCmd(*b"MY");
/// Node identifier string ("NI").
pub const CMD_NODE_ID: AtCmd = AtCmd(*b"NI");
/// Firmware version ("VR").
pub const CMD_FIRMWARE_VERSION: AtCmd = AtCmd(*b"VR");
/// Hardware version ("HV").
pub const CMD_HARDWARE_VERSION: AtCmd = AtCmd(*b"HV");

/// Remote AT command option bit: apply the change immediately instead of
/// waiting for an explicit apply.
pub const REMOTE_OPT_APPLY_CHANGES: u8 = 0x02;

/// Build a local AT command frame.
///
/// `param` is empty for a query or an execute, and carries the value
/// bytes for a set.
pub fn at_command(cmd: AtCmd, param: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(2 + param.len());
    payload.extend_from_slice(&cmd.0);
    payload.extend_from_slice(param);
    Frame::new(FrameType::AtCommand, payload)
}

/// Build a queued local AT command frame (applied on the next "AC").
pub fn at_command_queue(cmd: AtCmd, param: &[u8]) -> Frame {
    let mut payload = Vec::with_capacity(2 + param.len());
    payload.extend_from_slice(&cmd.0);
    payload.extend_from_slice(param);
    Frame::new(FrameType::AtCommandQueue, payload)
}

/// Build an AT command frame addressed to a remote peer.
pub fn remote_at_command(
    addr64: Addr64,
    addr16: Addr16,
    options: u8,
    cmd: AtCmd,
    param: &[u8],
) -> Frame {
    let mut payload = Vec::with_capacity(13 + param.len());
    payload.extend_from_slice(&addr64.to_bytes());
    payload.extend_from_slice(&addr16.to_bytes());
    payload.push(options);
    payload.extend_from_slice(&cmd.0);
    payload.extend_from_slice(param);
    Frame::new(FrameType::RemoteAtCommand, payload)
}

/// Build a data transmit request.
///
/// `radius` bounds broadcast propagation (0 = maximum hops); `options`
/// carries the protocol-specific transmit option bits.
pub fn transmit_request(
    addr64: Addr64,
    addr16: Addr16,
    radius: u8,
    options: u8,
    data: &[u8],
) -> Frame {
    let mut payload = Vec::with_capacity(12 + data.len());
    payload.extend_from_slice(&addr64.to_bytes());
    payload.extend_from_slice(&addr16.to_bytes());
    payload.push(radius);
    payload.push(options);
    payload.extend_from_slice(data);
    Frame::new(FrameType::TransmitRequest, payload)
}

/// Build an explicit-addressing transmit request (endpoint/cluster
/// addressed; mesh families only).
#[allow(clippy::too_many_arguments)]
pub fn explicit_transmit_request(
    addr64: Addr64,
    addr16: Addr16,
    src_endpoint: u8,
    dst_endpoint: u8,
    cluster_id: u16,
    profile_id: u16,
    radius: u8,
    options: u8,
    data: &[u8],
) -> Frame {
    let mut payload = Vec::with_capacity(18 + data.len());
    payload.extend_from_slice(&addr64.to_bytes());
    payload.extend_from_slice(&addr16.to_bytes());
    payload.push(src_endpoint);
    payload.push(dst_endpoint);
    payload.extend_from_slice(&cluster_id.to_be_bytes());
    payload.extend_from_slice(&profile_id.to_be_bytes());
    payload.push(radius);
    payload.push(options);
    payload.extend_from_slice(data);
    Frame::new(FrameType::ExplicitTransmitRequest, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_command_layout() {
        let frame = at_command(CMD_DISCOVER_TIMEOUT, &[0x3C]);
        assert_eq!(frame.frame_type(), FrameType::AtCommand);
        assert_eq!(frame.payload(), &[b'N', b'T', 0x3C]);
        assert_eq!(frame.at_command(), Some(CMD_DISCOVER_TIMEOUT));
    }

    #[test]
    fn remote_at_command_layout() {
        let frame = remote_at_command(
            Addr64::new(0x0013_A200_0000_0042),
            Addr16::UNKNOWN,
            REMOTE_OPT_APPLY_CHANGES,
            CMD_NODE_ID,
            &[],
        );
        assert_eq!(frame.frame_type(), FrameType::RemoteAtCommand);
        assert_eq!(frame.payload().len(), 13);
        assert_eq!(&frame.payload()[8..10], &[0xFF, 0xFE]);
        assert_eq!(frame.payload()[10], REMOTE_OPT_APPLY_CHANGES);
        assert_eq!(frame.at_command(), Some(CMD_NODE_ID));
    }

    #[test]
    fn transmit_request_layout() {
        let frame = transmit_request(
            Addr64::BROADCAST,
            Addr16::BROADCAST,
            0x00,
            0x00,
            b"hello",
        );
        assert_eq!(frame.frame_type(), FrameType::TransmitRequest);
        assert_eq!(frame.payload().len(), 12 + 5);
        assert_eq!(&frame.payload()[12..], b"hello");
    }

    #[test]
    fn explicit_transmit_request_layout() {
        let frame = explicit_transmit_request(
            Addr64::new(1),
            Addr16::new(2),
            0xE8,
            0xE8,
            0x0011,
            0xC105,
            0,
            0,
            b"x",
        );
        assert_eq!(frame.frame_type(), FrameType::ExplicitTransmitRequest);
        assert_eq!(frame.payload().len(), 18 + 1);
        assert_eq!(frame.payload()[10], 0xE8);
        assert_eq!(&frame.payload()[12..14], &[0x00, 0x11]);
        assert_eq!(&frame.payload()[14..16], &[0xC1, 0x05]);
    }
}
