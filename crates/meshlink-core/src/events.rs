//! Asynchronous event types.
//!
//! Events are emitted by the protocol engine through per-kind
//! `tokio::sync::broadcast` channels when frames arrive from the module.
//! Applications subscribe to the kinds they care about; a subscription
//! lives until its receiver is dropped. Events are delivered on a
//! best-effort basis through bounded channels; slow consumers may miss
//! events under heavy traffic.

use crate::addr::{Addr16, Addr64};

/// A data packet received from a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedData {
    /// 64-bit address of the sending peer.
    pub addr64: Addr64,
    /// 16-bit address of the sending peer.
    pub addr16: Addr16,
    /// Whether the packet was sent as a broadcast.
    pub is_broadcast: bool,
    /// The application payload.
    pub payload: Vec<u8>,
}

/// An IO sample received from a peer.
///
/// The sample bit layout is parameter-specific and left opaque; the raw
/// sample bytes are carried as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSampleEvent {
    /// 64-bit address of the sampling peer.
    pub addr64: Addr64,
    /// 16-bit address of the sampling peer.
    pub addr16: Addr16,
    /// Raw sample data.
    pub data: Vec<u8>,
}

/// A peer identity as parsed from a single discovery response.
///
/// This is the plain data record produced by the discovery engine before
/// it is merged into the device directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    /// 64-bit address; may be [`Addr64::UNKNOWN`].
    pub addr64: Addr64,
    /// 16-bit address; may be [`Addr16::UNKNOWN`].
    pub addr16: Addr16,
    /// Human-readable node identifier, when the peer has one configured.
    pub node_id: Option<String>,
    /// Parent network address (mesh families only).
    pub parent_addr: Option<Addr16>,
    /// Application profile identifier (mesh families only).
    pub profile_id: Option<u16>,
    /// Manufacturer identifier (mesh families only).
    pub manufacturer_id: Option<u16>,
    /// Received signal strength of the response (legacy family only).
    pub rssi: Option<u8>,
}

impl NodeRecord {
    /// Create a record carrying only an address pair.
    pub fn new(addr64: Addr64, addr16: Addr16) -> Self {
        NodeRecord {
            addr64,
            addr16,
            node_id: None,
            parent_addr: None,
            profile_id: None,
            manufacturer_id: None,
            rssi: None,
        }
    }

    /// Returns `true` if neither address is known.
    ///
    /// Such records are rejected by the device directory.
    pub fn is_addressless(&self) -> bool {
        self.addr64.is_unknown() && self.addr16.is_unknown()
    }
}

/// An event emitted during network discovery.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A peer answered the scan.
    Discovered(NodeRecord),
    /// A recoverable error occurred; discovery continues.
    Error(String),
    /// Discovery finished. Carries the error message when it failed.
    Finished(Option<String>),
}
