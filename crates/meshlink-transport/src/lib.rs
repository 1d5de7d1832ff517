//! meshlink-transport: Concrete [`Transport`](meshlink_core::Transport)
//! implementations.
//!
//! - [`SerialTransport`] -- USB virtual COM ports and RS-232 links
//! - [`TcpTransport`] -- network-attached modules and serial-over-IP
//!   gateways

pub mod serial;
pub mod tcp;

pub use serial::{DataBits, FlowControl, Parity, SerialConfig, SerialTransport, StopBits};
pub use tcp::TcpTransport;
