//! Operating-mode detection.
//!
//! Run once per connection open, before the IO task takes ownership of
//! the transport. The probe assumes framed mode and queries the framing
//! parameter; if that times out it falls back to the legacy
//! escape-sequence handshake. The resolved mode gates all subsequent
//! serialization for the life of the connection.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use meshlink_core::error::{Error, Result};
use meshlink_core::frame::FrameType;
use meshlink_core::transport::Transport;
use meshlink_core::types::OperatingMode;

use crate::allocator::FrameIdAllocator;
use crate::commands;
use crate::wire::{self, DecodeResult};

/// Timeout for the framed mode query.
const MODE_QUERY_TIMEOUT: Duration = Duration::from_millis(750);

/// Quiet interval before and after the escape sequence, satisfying the
/// transport's command-mode entry guard time.
const GUARD_TIME: Duration = Duration::from_secs(1);

/// Timeout for the legacy handshake reply.
const COMMAND_MODE_REPLY_TIMEOUT: Duration = Duration::from_millis(1_500);

/// The 3-character command-mode escape sequence.
const ESCAPE_SEQUENCE: &[u8] = b"+++";

/// Framing parameter value marking unescaped framed mode.
const FRAMED_MARKER: u8 = 0x01;

/// Determine the operating mode of the module behind `transport`.
///
/// 1. Assume framed: send a framing-parameter query with a short timeout.
///    A reply whose payload byte equals the framed marker resolves to
///    [`OperatingMode::Framed`]; any other value resolves to
///    [`OperatingMode::FramedEscaped`].
/// 2. On timeout, try the legacy handshake: wait the guard time, send
///    `+++`, wait again, and look for `OK`. Success resolves to
///    [`OperatingMode::LegacyCommand`]; failure or any I/O error at this
///    stage resolves to [`OperatingMode::Unknown`], which callers must
///    treat as fatal for the open.
///
/// Transport errors during the framed query itself are propagated.
pub(crate) async fn detect_operating_mode(
    transport: &mut dyn Transport,
    allocator: &FrameIdAllocator,
) -> Result<OperatingMode> {
    let mut query = commands::at_command(commands::CMD_API_MODE, &[]);
    query.set_frame_id(allocator.next());
    let frame_id = query.frame_id();

    transport.send(&wire::encode_frame(&query, false)).await?;

    match wait_mode_reply(transport, frame_id).await {
        Ok(value) => {
            let mode = if value == Some(FRAMED_MARKER) {
                OperatingMode::Framed
            } else {
                OperatingMode::FramedEscaped
            };
            debug!(%mode, "framed mode query answered");
            Ok(mode)
        }
        Err(Error::Timeout) => {
            debug!("framed mode query timed out, trying legacy handshake");
            Ok(legacy_handshake(transport).await)
        }
        Err(e) => Err(e),
    }
}

/// Wait for the framing-parameter reply and return its value byte.
async fn wait_mode_reply(transport: &mut dyn Transport, frame_id: u8) -> Result<Option<u8>> {
    let deadline = Instant::now() + MODE_QUERY_TIMEOUT;
    let mut rx_buf: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout);
        }

        match transport.receive(&mut buf, remaining).await {
            Ok(n) if n > 0 => {
                rx_buf.extend_from_slice(&buf[..n]);
                loop {
                    match wire::decode_frame(&rx_buf, false) {
                        DecodeResult::Frame(frame, consumed) => {
                            rx_buf.drain(..consumed);
                            if frame.frame_type() == FrameType::AtResponse
                                && frame.frame_id() == frame_id
                                && frame.at_command() == Some(commands::CMD_API_MODE)
                            {
                                return Ok(frame
                                    .at_value()
                                    .and_then(|value| value.first().copied()));
                            }
                        }
                        DecodeResult::Incomplete => break,
                        DecodeResult::Invalid(consumed) => {
                            rx_buf.drain(..consumed.max(1));
                        }
                    }
                }
            }
            Ok(_) | Err(Error::Timeout) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Attempt the legacy command-mode handshake.
///
/// Any failure here -- including transport errors -- resolves to
/// [`OperatingMode::Unknown`] rather than an error; the caller decides
/// whether that aborts the open.
async fn legacy_handshake(transport: &mut dyn Transport) -> OperatingMode {
    tokio::time::sleep(GUARD_TIME).await;

    if let Err(e) = transport.send(ESCAPE_SEQUENCE).await {
        debug!(error = %e, "escape sequence send failed");
        return OperatingMode::Unknown;
    }

    tokio::time::sleep(GUARD_TIME).await;

    let deadline = Instant::now() + COMMAND_MODE_REPLY_TIMEOUT;
    let mut reply: Vec<u8> = Vec::new();
    let mut buf = [0u8; 64];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match transport.receive(&mut buf, remaining).await {
            Ok(n) if n > 0 => {
                reply.extend_from_slice(&buf[..n]);
                if reply.windows(2).any(|w| w == b"OK") {
                    debug!("legacy command mode confirmed");
                    return OperatingMode::LegacyCommand;
                }
            }
            Ok(_) | Err(Error::Timeout) => {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Err(e) => {
                debug!(error = %e, "legacy handshake read failed");
                return OperatingMode::Unknown;
            }
        }
    }

    debug!("legacy handshake got no OK, mode unknown");
    OperatingMode::Unknown
}
