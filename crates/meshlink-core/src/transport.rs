//! Transport trait for radio module communication.
//!
//! The [`Transport`] trait abstracts over the physical link to a module.
//! Implementations exist for serial ports (USB/RS-232), TCP sockets
//! (network-attached gateways), and mock transports for testing.
//!
//! The protocol engine in the `meshlink` crate operates on a `Transport`
//! rather than directly on a serial port, enabling both real hardware
//! control and deterministic unit testing with `MockTransport` from the
//! `meshlink-test-harness` crate.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a radio module.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Protocol-level concerns (frame delimiting, escaping, checksums)
/// are handled by the engine that consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the module.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying transport (serial TX buffer, TCP socket, etc.).
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the module into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::InterfaceNotOpen`](crate::error::Error::InterfaceNotOpen).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
