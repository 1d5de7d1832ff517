//! Error types for meshlink.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer, protocol-layer, and
//! device-layer errors are all captured here.

use crate::types::{AtStatus, OperatingMode, RadioProtocol, TransmitStatus};

/// The error type for all meshlink operations.
///
/// Variants cover the full range of failure modes encountered when
/// communicating with radio modules: physical transport failures, frame
/// decode errors, timeouts, unsupported operations, and non-success
/// statuses reported by the module itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Timed out waiting for a response from the module.
    ///
    /// This typically indicates the module is unpowered, the baud rate is
    /// wrong, or the addressed peer is out of range.
    #[error("timeout waiting for response")]
    Timeout,

    /// A send was attempted while the connection's operating mode does not
    /// support framed operations (legacy command mode, or undetermined).
    #[error("invalid operating mode: {0}")]
    InvalidOperatingMode(OperatingMode),

    /// An operation was attempted before `open()` or after `close()`.
    #[error("interface not open")]
    InterfaceNotOpen,

    /// The protocol declared for a device disagrees with the protocol the
    /// device actually reports in its version registers.
    #[error("protocol mismatch: declared {declared}, device reports {reported}")]
    ProtocolMismatch {
        /// The protocol the caller declared at build time.
        declared: RadioProtocol,
        /// The protocol derived from the device's version registers.
        reported: RadioProtocol,
    },

    /// A synchronous transmit completed but the status frame reported a
    /// non-success delivery status.
    #[error("transmit failed: {0}")]
    TransmitFailed(TransmitStatus),

    /// An AT command response carried a non-OK status byte.
    #[error("AT command failed: {0}")]
    AtCommandFailed(AtStatus),

    /// The requested operation is not supported by this device's protocol
    /// family.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An invalid parameter was passed to a command.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A transport-level error (serial port, TCP socket, USB).
    #[error("transport error: {0}")]
    Transport(String),

    /// A protocol-level error (malformed frame, unexpected response).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection to the module was lost unexpectedly.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_timeout() {
        let e = Error::Timeout;
        assert_eq!(e.to_string(), "timeout waiting for response");
    }

    #[test]
    fn error_display_invalid_operating_mode() {
        let e = Error::InvalidOperatingMode(OperatingMode::LegacyCommand);
        assert_eq!(e.to_string(), "invalid operating mode: legacy command mode");
    }

    #[test]
    fn error_display_interface_not_open() {
        let e = Error::InterfaceNotOpen;
        assert_eq!(e.to_string(), "interface not open");
    }

    #[test]
    fn error_display_protocol_mismatch() {
        let e = Error::ProtocolMismatch {
            declared: RadioProtocol::ZigBee,
            reported: RadioProtocol::DigiMesh,
        };
        assert_eq!(
            e.to_string(),
            "protocol mismatch: declared ZigBee, device reports DigiMesh"
        );
    }

    #[test]
    fn error_display_transmit_failed() {
        let e = Error::TransmitFailed(TransmitStatus::AddressNotFound);
        assert_eq!(e.to_string(), "transmit failed: address not found");
    }

    #[test]
    fn error_display_at_command_failed() {
        let e = Error::AtCommandFailed(AtStatus::InvalidCommand);
        assert_eq!(e.to_string(), "AT command failed: invalid command");
    }

    #[test]
    fn error_display_unsupported() {
        let e = Error::Unsupported("16-bit addressing".into());
        assert_eq!(e.to_string(), "unsupported operation: 16-bit addressing");
    }

    #[test]
    fn error_display_transport() {
        let e = Error::Transport("port busy".into());
        assert_eq!(e.to_string(), "transport error: port busy");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broken");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("pipe broken"));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn error_implements_std_error() {
        fn assert_std_error<T: std::error::Error>() {}
        assert_std_error::<Error>();
    }

    #[test]
    fn result_alias_works() {
        let ok: Result<u32> = Ok(42);
        match ok {
            Ok(val) => assert_eq!(val, 42),
            Err(_) => panic!("expected Ok"),
        }

        let err: Result<u32> = Err(Error::Timeout);
        assert!(err.is_err());
    }
}
