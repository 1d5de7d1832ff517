//! meshlink: host-side driver for frame-protocol mesh radio modules.
//!
//! Radio modules in this family speak a binary request/response frame
//! protocol over a byte-stream transport (serial, USB, TCP). This crate
//! turns that asynchronous, listener-driven wire into a synchronous
//! call/response API with timeouts, drives network discovery with
//! protocol-dependent adaptive deadlines, and maintains a directory of
//! discovered peers merged across the two peer address spaces.
//!
//! # Architecture
//!
//! - [`wire`] -- byte-level frame codec (delimiter, length, checksum,
//!   escaped and unescaped forms)
//! - [`allocator`] -- per-connection rolling frame-id generator
//! - [`correlator`] -- the IO task owning the transport plus the
//!   pending-request table that pairs responses with requests
//! - [`device`] -- the local [`Radio`] and discovered [`RemoteNode`] peers
//! - [`discovery`] -- the network scan state machine
//! - [`directory`] -- the dual-keyed peer directory
//!
//! # Example
//!
//! ```no_run
//! use meshlink::RadioBuilder;
//! use meshlink_core::RadioProtocol;
//!
//! # async fn example() -> meshlink_core::Result<()> {
//! let radio = RadioBuilder::new(RadioProtocol::ZigBee)
//!     .serial_port("/dev/ttyUSB0")
//!     .baud_rate(9_600)
//!     .open()
//!     .await?;
//!
//! let nodes = radio.network().discover_nodes().await?;
//! for node in &nodes {
//!     println!("{} ({})", node.addr64(), node.node_id().unwrap_or_default());
//! }
//! # Ok(())
//! # }
//! ```

pub mod allocator;
pub mod builder;
pub mod commands;
pub mod correlator;
pub mod device;
pub mod directory;
pub mod discovery;
mod mode;
pub mod wire;

pub use builder::RadioBuilder;
pub use device::{DeviceInfo, Radio, RemoteNode};
pub use directory::DeviceDirectory;
pub use discovery::{DiscoveryState, Network};

// Re-export the core crate so applications need only one dependency.
pub use meshlink_core as core;
