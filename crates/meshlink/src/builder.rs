//! RadioBuilder -- fluent builder for opening [`Radio`] connections.
//!
//! Separates configuration from construction so that callers can set up
//! serial parameters, the declared protocol family, and timeout values
//! before the transport is opened and probed.
//!
//! # Example
//!
//! ```no_run
//! use meshlink::RadioBuilder;
//! use meshlink_core::RadioProtocol;
//! use std::time::Duration;
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let radio = RadioBuilder::new(RadioProtocol::DigiMesh)
//!     .serial_port("/dev/ttyUSB0")
//!     .baud_rate(115_200)
//!     .receive_timeout(Duration::from_secs(3))
//!     .open()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use meshlink_core::error::{Error, Result};
use meshlink_core::transport::Transport;
use meshlink_core::types::{OperatingMode, RadioProtocol};

use crate::allocator::FrameIdAllocator;
use crate::correlator::{Correlator, DEFAULT_RECEIVE_TIMEOUT};
use crate::device::{self, DeviceInfo, Radio};
use crate::mode;

/// Fluent builder for [`Radio`].
///
/// The declared protocol may be [`RadioProtocol::Unknown`] to accept
/// whatever the module's firmware reports; declaring a concrete family
/// turns a disagreement into [`Error::ProtocolMismatch`] during open.
pub struct RadioBuilder {
    protocol: RadioProtocol,
    serial_port: Option<String>,
    baud_rate: u32,
    receive_timeout: Duration,
    read_device_info: bool,
}

impl RadioBuilder {
    /// Create a new builder for a device of the given protocol family.
    pub fn new(protocol: RadioProtocol) -> Self {
        RadioBuilder {
            protocol,
            serial_port: None,
            baud_rate: 9_600,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            read_device_info: true,
        }
    }

    /// Set the serial port path (e.g. `/dev/ttyUSB0` or `COM3`).
    pub fn serial_port(mut self, port: &str) -> Self {
        self.serial_port = Some(port.to_string());
        self
    }

    /// Override the default baud rate (default: 9600).
    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    /// Set the timeout for synchronous request/response exchanges
    /// (default: 2 seconds).
    pub fn receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    /// Enable or disable the identity-register read during open
    /// (default: enabled). Disabling it also skips the protocol check.
    pub fn read_device_info(mut self, enabled: bool) -> Self {
        self.read_device_info = enabled;
        self
    }

    /// Open a [`Radio`] with a caller-provided transport.
    ///
    /// This is the primary entry point for testing (pass a
    /// `MockTransport` from `meshlink-test-harness`) and for advanced
    /// use cases where the caller manages the transport lifecycle.
    pub async fn open_with_transport(self, mut transport: Box<dyn Transport>) -> Result<Radio> {
        let allocator = Arc::new(FrameIdAllocator::new());

        let mode =
            mode::detect_operating_mode(transport.as_mut(), &allocator).await?;
        if mode == OperatingMode::Unknown {
            return Err(Error::InvalidOperatingMode(OperatingMode::Unknown));
        }

        let correlator = Arc::new(Correlator::spawn(
            transport,
            mode,
            self.receive_timeout,
            allocator,
        ));

        let (info, protocol) = if mode.is_sendable() && self.read_device_info {
            let (info, reported) = device::fetch_device_info(&correlator).await?;
            let protocol = match (self.protocol, reported) {
                (RadioProtocol::Unknown, reported) => reported,
                (declared, RadioProtocol::Unknown) => declared,
                (declared, reported) if declared != reported => {
                    return Err(Error::ProtocolMismatch { declared, reported });
                }
                (declared, _) => declared,
            };
            (info, protocol)
        } else {
            (DeviceInfo::default(), self.protocol)
        };

        info!(%mode, %protocol, addr64 = %info.addr64, "radio connection opened");
        Ok(Radio::new(correlator, protocol, info))
    }

    /// Open a [`Radio`] over a serial transport.
    ///
    /// Requires that [`serial_port()`](Self::serial_port) has been
    /// called.
    pub async fn open(self) -> Result<Radio> {
        let port = self
            .serial_port
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("serial_port is required for open()".into()))?;

        let transport =
            meshlink_transport::SerialTransport::open(port, self.baud_rate).await?;
        self.open_with_transport(Box::new(transport)).await
    }
}
