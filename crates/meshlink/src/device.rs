//! Local and remote device surfaces.
//!
//! [`Radio`] is the locally attached module: it owns the connection's
//! correlation engine and exposes the parameter command surface, data
//! transmission, module reset, and the network view. [`RemoteNode`] is a
//! discovered peer: it carries the dual-address identity plus mutable
//! descriptive fields, and relays its parameter commands through the
//! owning connection's correlator (sharing its frame-id allocator).

use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use meshlink_core::addr::{Addr16, Addr64};
use meshlink_core::error::{Error, Result};
use meshlink_core::events::{IoSampleEvent, NodeRecord, ReceivedData};
use meshlink_core::frame::{AtCmd, Frame};
use meshlink_core::types::{
    Capabilities, ModemStatus, OperatingMode, RadioProtocol, TransmitStatus,
};

use crate::commands;
use crate::correlator::Correlator;
use crate::discovery::Network;

/// Ceiling for the blocking wait on the reset status event.
const RESET_TIMEOUT: Duration = Duration::from_secs(5);

/// Cached identity and version information for the local module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// The module's 64-bit address.
    pub addr64: Addr64,
    /// The module's 16-bit network address, when its protocol has one.
    pub addr16: Addr16,
    /// The configured node identifier string.
    pub node_id: String,
    /// Raw firmware version register bytes.
    pub firmware_version: Vec<u8>,
    /// Hardware version register value.
    pub hardware_version: u16,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            addr64: Addr64::UNKNOWN,
            addr16: Addr16::UNKNOWN,
            node_id: String::new(),
            firmware_version: Vec::new(),
            hardware_version: 0,
        }
    }
}

/// Validate an AT response and extract its value bytes.
///
/// A non-OK status surfaces as [`Error::AtCommandFailed`] carrying the
/// status code.
pub(crate) fn check_at_response(response: &Frame) -> Result<Vec<u8>> {
    let status = response.at_status().ok_or_else(|| {
        Error::Protocol(format!(
            "{} response carried no command status",
            response.frame_type()
        ))
    })?;
    if !status.is_ok() {
        return Err(Error::AtCommandFailed(status));
    }
    Ok(response.at_value().unwrap_or_default().to_vec())
}

/// Derive the protocol family from the firmware version register.
///
/// Covers the common firmware numbering families; unrecognized values
/// resolve to [`RadioProtocol::Unknown`] and never fail an open on their
/// own.
pub(crate) fn protocol_from_firmware(firmware: &[u8]) -> RadioProtocol {
    let Some(&high) = firmware.first() else {
        return RadioProtocol::Unknown;
    };
    match high >> 4 {
        0x1 => RadioProtocol::Raw802154,
        0x2 | 0x3 | 0x4 => RadioProtocol::ZigBee,
        0x8 | 0x9 => RadioProtocol::DigiMesh,
        0xA => RadioProtocol::PointToMultipoint,
        _ => RadioProtocol::Unknown,
    }
}

/// Read the local module's identity registers.
///
/// Returns the assembled [`DeviceInfo`] and the protocol family the
/// firmware reports. The 16-bit address read is best-effort: protocol
/// families without a 16-bit space reject it, which is not an error.
pub(crate) async fn fetch_device_info(
    correlator: &Correlator,
) -> Result<(DeviceInfo, RadioProtocol)> {
    let timeout = correlator.receive_timeout();

    let local_at = |cmd: AtCmd| async move {
        let mut frame = commands::at_command(cmd, &[]);
        let response = correlator.send_sync(&mut frame, timeout).await?;
        check_at_response(&response)
    };

    let high = local_at(commands::CMD_ADDR_HIGH).await?;
    let low = local_at(commands::CMD_ADDR_LOW).await?;
    let mut bytes = [0u8; 8];
    for (i, b) in high.iter().rev().take(4).enumerate() {
        bytes[3 - i] = *b;
    }
    for (i, b) in low.iter().rev().take(4).enumerate() {
        bytes[7 - i] = *b;
    }
    let addr64 = Addr64::from_bytes(bytes);

    let addr16 = match local_at(commands::CMD_ADDR_16).await {
        Ok(value) if value.len() >= 2 => Addr16::from_bytes([value[0], value[1]]),
        _ => Addr16::UNKNOWN,
    };

    let node_id = local_at(commands::CMD_NODE_ID)
        .await
        .map(|value| String::from_utf8_lossy(&value).trim().to_string())
        .unwrap_or_default();

    let firmware_version = local_at(commands::CMD_FIRMWARE_VERSION).await?;
    let hardware_version = local_at(commands::CMD_HARDWARE_VERSION)
        .await
        .map(|value| {
            value
                .iter()
                .fold(0u16, |acc, &b| (acc << 8) | u16::from(b))
        })
        .unwrap_or(0);

    let reported = protocol_from_firmware(&firmware_version);

    Ok((
        DeviceInfo {
            addr64,
            addr16,
            node_id,
            firmware_version,
            hardware_version,
        },
        reported,
    ))
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

/// The locally attached radio module.
///
/// Constructed via [`RadioBuilder`](crate::builder::RadioBuilder). All
/// module communication goes through the IO task that owns the transport.
pub struct Radio {
    correlator: Arc<Correlator>,
    protocol: RadioProtocol,
    capabilities: Capabilities,
    info: RwLock<DeviceInfo>,
    network: Network,
}

impl Radio {
    /// Assemble a radio from its constituent parts.
    ///
    /// Called by the builder after mode detection and the initial info
    /// refresh; use [`RadioBuilder`](crate::builder::RadioBuilder)
    /// instead.
    pub(crate) fn new(
        correlator: Arc<Correlator>,
        protocol: RadioProtocol,
        info: DeviceInfo,
    ) -> Self {
        let network = Network::new(Arc::clone(&correlator), protocol);
        Radio {
            correlator,
            protocol,
            capabilities: protocol.capabilities(),
            info: RwLock::new(info),
            network,
        }
    }

    /// The connection's resolved operating mode.
    pub fn operating_mode(&self) -> OperatingMode {
        self.correlator.operating_mode()
    }

    /// The protocol family this device runs.
    pub fn protocol(&self) -> RadioProtocol {
        self.protocol
    }

    /// The capability set of this device's protocol family.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// A snapshot of the cached device identity.
    pub fn info(&self) -> DeviceInfo {
        self.info.read().unwrap().clone()
    }

    /// The network view: discovery and the peer directory.
    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Returns `true` until [`close()`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.correlator.is_open()
    }

    /// Close the connection: cancel any running discovery and stop the
    /// IO task. Subsequent operations fail with
    /// [`Error::InterfaceNotOpen`].
    pub fn close(&self) {
        self.network.stop_discovery();
        self.correlator.close();
    }

    /// Read a parameter from the module.
    ///
    /// `name` is the two-character command name; the returned bytes are
    /// the parameter-specific value.
    pub async fn get_parameter(&self, name: &str) -> Result<Vec<u8>> {
        let cmd = AtCmd::try_from_str(name)?;
        self.local_at(cmd, &[]).await
    }

    /// Write a parameter value to the module.
    pub async fn set_parameter(&self, name: &str, value: &[u8]) -> Result<()> {
        let cmd = AtCmd::try_from_str(name)?;
        self.local_at(cmd, value).await.map(|_| ())
    }

    /// Execute a parameter-less command on the module (e.g. apply
    /// changes, software reset).
    pub async fn execute_parameter(&self, name: &str) -> Result<()> {
        let cmd = AtCmd::try_from_str(name)?;
        self.local_at(cmd, &[]).await.map(|_| ())
    }

    async fn local_at(&self, cmd: AtCmd, param: &[u8]) -> Result<Vec<u8>> {
        let mut frame = commands::at_command(cmd, param);
        let response = self
            .correlator
            .send_sync(&mut frame, self.correlator.receive_timeout())
            .await?;
        check_at_response(&response)
    }

    /// Re-read the module's identity registers, refreshing the cached
    /// [`DeviceInfo`].
    ///
    /// Fails with [`Error::ProtocolMismatch`] when the firmware reports a
    /// different protocol family than this device was declared with.
    pub async fn read_device_info(&self) -> Result<DeviceInfo> {
        let (info, reported) = fetch_device_info(&self.correlator).await?;
        if self.protocol != RadioProtocol::Unknown
            && reported != RadioProtocol::Unknown
            && reported != self.protocol
        {
            return Err(Error::ProtocolMismatch {
                declared: self.protocol,
                reported,
            });
        }
        *self.info.write().unwrap() = info.clone();
        Ok(info)
    }

    /// Send data to a peer and wait for the delivery status.
    pub async fn send_data(&self, remote: &RemoteNode, data: &[u8]) -> Result<TransmitStatus> {
        let mut frame = commands::transmit_request(remote.addr64(), remote.addr16(), 0, 0, data);
        self.correlator
            .send_checked(&mut frame, self.correlator.receive_timeout())
            .await
    }

    /// Send data to a peer without waiting for the delivery status.
    pub async fn send_data_async(&self, remote: &RemoteNode, data: &[u8]) -> Result<()> {
        let mut frame = commands::transmit_request(remote.addr64(), remote.addr16(), 0, 0, data);
        self.correlator.send_async(&mut frame).await.map(|_| ())
    }

    /// Broadcast data to every node on the network.
    pub async fn send_data_broadcast(&self, data: &[u8]) -> Result<TransmitStatus> {
        let mut frame =
            commands::transmit_request(Addr64::BROADCAST, Addr16::BROADCAST, 0, 0, data);
        self.correlator
            .send_checked(&mut frame, self.correlator.receive_timeout())
            .await
    }

    /// Send explicitly addressed (endpoint/cluster) data to a peer.
    ///
    /// Only available on protocol families with explicit addressing.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_explicit(
        &self,
        remote: &RemoteNode,
        src_endpoint: u8,
        dst_endpoint: u8,
        cluster_id: u16,
        profile_id: u16,
        data: &[u8],
    ) -> Result<TransmitStatus> {
        if !self.capabilities.supports_explicit_addressing {
            return Err(Error::Unsupported(format!(
                "{} does not support explicit addressing",
                self.protocol
            )));
        }
        let mut frame = commands::explicit_transmit_request(
            remote.addr64(),
            remote.addr16(),
            src_endpoint,
            dst_endpoint,
            cluster_id,
            profile_id,
            0,
            0,
            data,
        );
        self.correlator
            .send_checked(&mut frame, self.correlator.receive_timeout())
            .await
    }

    /// Software-reset the module and wait for it to come back.
    ///
    /// Blocks until the module emits its reset modem-status event,
    /// bounded by a fixed 5-second ceiling. This wait is status-driven,
    /// not frame-id-correlated.
    pub async fn reset(&self) -> Result<()> {
        let mut status_rx = self.correlator.subscribe_modem_status();

        let mut frame = commands::at_command(commands::CMD_SOFTWARE_RESET, &[]);
        self.correlator.send_async(&mut frame).await?;
        debug!("software reset sent, waiting for status event");

        let deadline = Instant::now() + RESET_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            match tokio::time::timeout(remaining, status_rx.recv()).await {
                Ok(Ok(status)) if status.is_reset() => {
                    debug!(%status, "module reset complete");
                    return Ok(());
                }
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::ConnectionLost);
                }
                Err(_) => return Err(Error::Timeout),
            }
        }
    }

    /// Subscribe to every decoded frame.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.correlator.subscribe_frames()
    }

    /// Subscribe to received data packets.
    pub fn subscribe_data(&self) -> broadcast::Receiver<ReceivedData> {
        self.correlator.subscribe_data()
    }

    /// Subscribe to received IO samples.
    pub fn subscribe_io_samples(&self) -> broadcast::Receiver<IoSampleEvent> {
        self.correlator.subscribe_io_samples()
    }

    /// Subscribe to modem status events.
    pub fn subscribe_modem_status(&self) -> broadcast::Receiver<ModemStatus> {
        self.correlator.subscribe_modem_status()
    }
}

impl fmt::Debug for Radio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Radio")
            .field("protocol", &self.protocol)
            .field("mode", &self.operating_mode())
            .field("info", &self.info())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RemoteNode
// ---------------------------------------------------------------------------

/// Mutable identity fields of a remote node.
#[derive(Debug, Clone)]
struct NodeState {
    addr64: Addr64,
    addr16: Addr16,
    node_id: Option<String>,
    firmware_version: Option<Vec<u8>>,
    hardware_version: Option<u16>,
}

/// A peer discovered on the network.
///
/// Owned by the [`DeviceDirectory`](crate::directory::DeviceDirectory)
/// once inserted; rediscoveries merge into the same instance rather than
/// creating a new one. Outbound operations relay through the originating
/// local connection, which also supplies the frame-id allocator.
pub struct RemoteNode {
    local: Weak<Correlator>,
    protocol: RadioProtocol,
    state: RwLock<NodeState>,
}

impl RemoteNode {
    /// Build a node from a discovery record.
    pub(crate) fn from_record(
        local: Weak<Correlator>,
        protocol: RadioProtocol,
        record: &NodeRecord,
    ) -> Arc<Self> {
        Arc::new(RemoteNode {
            local,
            protocol,
            state: RwLock::new(NodeState {
                addr64: record.addr64,
                addr16: record.addr16,
                node_id: record.node_id.clone(),
                firmware_version: None,
                hardware_version: None,
            }),
        })
    }

    /// The peer's 64-bit address, or [`Addr64::UNKNOWN`].
    pub fn addr64(&self) -> Addr64 {
        self.state.read().unwrap().addr64
    }

    /// The peer's 16-bit address, or [`Addr16::UNKNOWN`].
    pub fn addr16(&self) -> Addr16 {
        self.state.read().unwrap().addr16
    }

    /// The peer's node identifier, when known.
    pub fn node_id(&self) -> Option<String> {
        self.state.read().unwrap().node_id.clone()
    }

    /// The peer's protocol family.
    pub fn protocol(&self) -> RadioProtocol {
        self.protocol
    }

    /// The peer's cached firmware version, when it has been read.
    pub fn firmware_version(&self) -> Option<Vec<u8>> {
        self.state.read().unwrap().firmware_version.clone()
    }

    /// Merge a later observation of the same peer into this instance.
    ///
    /// Field rules: the node id updates when the incoming value is
    /// non-empty; the 16-bit address updates when the incoming value is
    /// known and differs; the 64-bit address updates only when the
    /// existing one is unknown.
    pub(crate) fn merge_record(&self, record: &NodeRecord) {
        let mut state = self.state.write().unwrap();
        if let Some(node_id) = &record.node_id {
            if !node_id.is_empty() {
                state.node_id = Some(node_id.clone());
            }
        }
        if !record.addr16.is_unknown() && record.addr16 != state.addr16 {
            state.addr16 = record.addr16;
        }
        if state.addr64.is_unknown() && !record.addr64.is_unknown() {
            state.addr64 = record.addr64;
        }
    }

    /// Merge another instance's fields into this one (same rules as
    /// [`merge_record`](Self::merge_record), plus cached versions).
    pub(crate) fn merge_node(&self, other: &RemoteNode) {
        let other_state = other.state.read().unwrap().clone();
        let mut state = self.state.write().unwrap();
        if let Some(node_id) = &other_state.node_id {
            if !node_id.is_empty() {
                state.node_id = Some(node_id.clone());
            }
        }
        if !other_state.addr16.is_unknown() && other_state.addr16 != state.addr16 {
            state.addr16 = other_state.addr16;
        }
        if state.addr64.is_unknown() && !other_state.addr64.is_unknown() {
            state.addr64 = other_state.addr64;
        }
        if other_state.firmware_version.is_some() {
            state.firmware_version = other_state.firmware_version;
        }
        if other_state.hardware_version.is_some() {
            state.hardware_version = other_state.hardware_version;
        }
    }

    /// Fill fields this instance lacks from an older record being
    /// promoted out of the 16-bit map.
    pub(crate) fn absorb_missing_from(&self, older: &RemoteNode) {
        let older_state = older.state.read().unwrap().clone();
        let mut state = self.state.write().unwrap();
        if state.node_id.as_deref().unwrap_or_default().is_empty() {
            state.node_id = older_state.node_id;
        }
        if state.addr16.is_unknown() {
            state.addr16 = older_state.addr16;
        }
        if state.firmware_version.is_none() {
            state.firmware_version = older_state.firmware_version;
        }
        if state.hardware_version.is_none() {
            state.hardware_version = older_state.hardware_version;
        }
    }

    /// Read a parameter from the remote peer.
    pub async fn get_parameter(&self, name: &str) -> Result<Vec<u8>> {
        let cmd = AtCmd::try_from_str(name)?;
        self.remote_at(cmd, &[]).await
    }

    /// Write a parameter value on the remote peer.
    pub async fn set_parameter(&self, name: &str, value: &[u8]) -> Result<()> {
        let cmd = AtCmd::try_from_str(name)?;
        self.remote_at(cmd, value).await.map(|_| ())
    }

    /// Execute a parameter-less command on the remote peer.
    pub async fn execute_parameter(&self, name: &str) -> Result<()> {
        let cmd = AtCmd::try_from_str(name)?;
        self.remote_at(cmd, &[]).await.map(|_| ())
    }

    /// Read the peer's node identifier and version registers, refreshing
    /// the cached fields.
    pub async fn read_device_info(&self) -> Result<()> {
        let node_id = self.remote_at(commands::CMD_NODE_ID, &[]).await?;
        let firmware = self.remote_at(commands::CMD_FIRMWARE_VERSION, &[]).await?;
        let hardware = self.remote_at(commands::CMD_HARDWARE_VERSION, &[]).await?;

        let mut state = self.state.write().unwrap();
        let node_id = String::from_utf8_lossy(&node_id).trim().to_string();
        if !node_id.is_empty() {
            state.node_id = Some(node_id);
        }
        state.hardware_version = Some(
            hardware
                .iter()
                .fold(0u16, |acc, &b| (acc << 8) | u16::from(b)),
        );
        state.firmware_version = Some(firmware);
        Ok(())
    }

    async fn remote_at(&self, cmd: AtCmd, param: &[u8]) -> Result<Vec<u8>> {
        // Non-owning reference to the originating connection; a dropped
        // local device means the peer can no longer be reached.
        let correlator = self.local.upgrade().ok_or(Error::InterfaceNotOpen)?;
        let (addr64, addr16) = {
            let state = self.state.read().unwrap();
            (state.addr64, state.addr16)
        };
        let mut frame = commands::remote_at_command(
            addr64,
            addr16,
            commands::REMOTE_OPT_APPLY_CHANGES,
            cmd,
            param,
        );
        let response = correlator
            .send_sync(&mut frame, correlator.receive_timeout())
            .await?;
        check_at_response(&response)
    }
}

impl fmt::Debug for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        f.debug_struct("RemoteNode")
            .field("addr64", &state.addr64)
            .field("addr16", &state.addr16)
            .field("node_id", &state.node_id)
            .field("protocol", &self.protocol)
            .finish()
    }
}

impl fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read().unwrap();
        match &state.node_id {
            Some(node_id) if !node_id.is_empty() => {
                write!(f, "{} ({})", state.addr64, node_id)
            }
            _ => write!(f, "{}", state.addr64),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
