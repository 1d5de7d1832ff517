//! meshlink-core: Core traits, types, and error definitions for meshlink.
//!
//! This crate defines the protocol-agnostic abstractions the meshlink
//! driver is built on. Applications depend on these types without pulling
//! in the protocol engine or any concrete transport.
//!
//! # Key types
//!
//! - [`Transport`] -- byte-level communication channel to a radio module
//! - [`Frame`] -- one application-level protocol message
//! - [`Addr64`] / [`Addr16`] -- the two peer address spaces
//! - [`RadioProtocol`] / [`Capabilities`] -- protocol family and feature set
//! - [`Error`] / [`Result`] -- error handling

pub mod addr;
pub mod error;
pub mod events;
pub mod frame;
pub mod transport;
pub mod types;

// Re-export key types at crate root for ergonomic `use meshlink_core::*`.
pub use addr::{Addr16, Addr64};
pub use error::{Error, Result};
pub use events::{DiscoveryEvent, IoSampleEvent, NodeRecord, ReceivedData};
pub use frame::{AtCmd, Frame, FrameType, UNSET_FRAME_ID};
pub use transport::Transport;
pub use types::{
    AtStatus, Capabilities, ModemStatus, OperatingMode, RadioProtocol, TransmitStatus,
};
