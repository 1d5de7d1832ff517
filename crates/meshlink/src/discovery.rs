//! Network discovery and the network view.
//!
//! [`Network`] bundles the peer directory with the discovery state
//! machine for one local device. Discovery drives the scan command,
//! filters the replies through a transient frame subscription, computes
//! a protocol-dependent adaptive deadline (or waits for the explicit
//! end-of-scan frame on the legacy family), and merges every accepted
//! record into the directory.
//!
//! The synchronous entry points run the scan on the caller's task; the
//! asynchronous entry point runs the identical algorithm on a dedicated
//! worker task and reports exclusively through the discovery event
//! channel. Cancellation latency is bounded by the poll slice.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use meshlink_core::addr::{Addr16, Addr64};
use meshlink_core::error::{Error, Result};
use meshlink_core::events::{DiscoveryEvent, NodeRecord};
use meshlink_core::frame::{Frame, FrameType};
use meshlink_core::types::RadioProtocol;

use crate::commands;
use crate::correlator::Correlator;
use crate::device::{check_at_response, RemoteNode};
use crate::directory::DeviceDirectory;

/// Fixed poll slice; stop-flag and deadline checks happen at this
/// granularity.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Milliseconds per unit of the coarse discovery-timeout parameter.
const NT_UNIT_MS: u64 = 100;

/// Fallback scan window when the timeout parameters cannot be read.
const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 20_000;

/// Capacity of the discovery event channel.
const DISCOVERY_CHANNEL_CAPACITY: usize = 64;

/// Discovery lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryState {
    /// No discovery has run yet.
    Idle,
    /// A scan is in progress.
    Running,
    /// The last scan finished; carries the error message when it failed.
    Finished(Option<String>),
}

/// Shared discovery state for one local device.
struct DiscoveryShared {
    /// Guards against concurrent scans on the same device.
    running: AtomicBool,
    /// Early-cancellation flag, checked every poll slice.
    stop: AtomicBool,
    state: Mutex<DiscoveryState>,
    events: broadcast::Sender<DiscoveryEvent>,
}

/// What one finished scan produced.
struct ScanOutcome {
    nodes: Vec<Arc<RemoteNode>>,
    target: Option<Arc<RemoteNode>>,
}

struct NetworkInner {
    correlator: Arc<Correlator>,
    protocol: RadioProtocol,
    directory: DeviceDirectory,
    discovery: DiscoveryShared,
}

/// The network view of a local device: discovery plus the peer
/// directory.
///
/// Cheaply cloneable; clones share the same directory and discovery
/// state.
#[derive(Clone)]
pub struct Network {
    inner: Arc<NetworkInner>,
}

impl Network {
    pub(crate) fn new(correlator: Arc<Correlator>, protocol: RadioProtocol) -> Self {
        let (events, _) = broadcast::channel(DISCOVERY_CHANNEL_CAPACITY);
        Network {
            inner: Arc::new(NetworkInner {
                correlator,
                protocol,
                directory: DeviceDirectory::new(protocol),
                discovery: DiscoveryShared {
                    running: AtomicBool::new(false),
                    stop: AtomicBool::new(false),
                    state: Mutex::new(DiscoveryState::Idle),
                    events,
                },
            }),
        }
    }

    /// The peer directory.
    pub fn directory(&self) -> &DeviceDirectory {
        &self.inner.directory
    }

    /// The current discovery lifecycle state.
    pub fn discovery_state(&self) -> DiscoveryState {
        self.inner.discovery.state.lock().unwrap().clone()
    }

    /// Returns `true` while a scan is in progress.
    pub fn is_discovering(&self) -> bool {
        self.inner.discovery.running.load(Ordering::Acquire)
    }

    /// Subscribe to discovery events.
    pub fn subscribe_discovery(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.discovery.events.subscribe()
    }

    /// Run a full network scan on the caller's task.
    ///
    /// Returns every peer that answered, after merging into the
    /// directory. Rejected while another scan is running.
    pub async fn discover_nodes(&self) -> Result<Vec<Arc<RemoteNode>>> {
        self.try_claim()?;
        run_claimed(Arc::clone(&self.inner), None)
            .await
            .map(|outcome| outcome.nodes)
    }

    /// Run a targeted lookup for the peer with the given node identifier.
    ///
    /// Only the matching record is stored and reported. Non-legacy
    /// devices stop the scan as soon as the target answers; the legacy
    /// family still waits for its end-of-scan frame.
    pub async fn discover_node(&self, node_id: &str) -> Result<Option<Arc<RemoteNode>>> {
        self.try_claim()?;
        run_claimed(Arc::clone(&self.inner), Some(node_id.to_string()))
            .await
            .map(|outcome| outcome.target)
    }

    /// Start a full scan on a dedicated worker task.
    ///
    /// Results and completion are reported exclusively through the
    /// discovery event channel. Rejected while another scan is running.
    pub fn start_discovery(&self) -> Result<()> {
        self.try_claim()?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            // Completion is reported through the event channel.
            let _ = run_claimed(inner, None).await;
        });
        Ok(())
    }

    /// Request early cancellation of a running scan.
    ///
    /// Detection latency is bounded by the poll slice.
    pub fn stop_discovery(&self) {
        self.inner.discovery.stop.store(true, Ordering::Release);
    }

    fn try_claim(&self) -> Result<()> {
        self.inner
            .discovery
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::InvalidParameter("node discovery already running".into()))
    }
}

/// Run one claimed scan to completion.
///
/// Every exit path -- normal completion, cancellation, send failure --
/// releases the claim, transitions to `Finished`, and emits the finished
/// event exactly once.
async fn run_claimed(inner: Arc<NetworkInner>, filter: Option<String>) -> Result<ScanOutcome> {
    let discovery = &inner.discovery;
    discovery.stop.store(false, Ordering::Release);
    *discovery.state.lock().unwrap() = DiscoveryState::Running;

    let result = scan_loop(&inner, filter.as_deref()).await;

    let error_message = result.as_ref().err().map(ToString::to_string);
    *discovery.state.lock().unwrap() = DiscoveryState::Finished(error_message.clone());
    discovery.running.store(false, Ordering::Release);
    let _ = discovery
        .events
        .send(DiscoveryEvent::Finished(error_message));

    result
}

/// The scan algorithm proper.
async fn scan_loop(inner: &NetworkInner, filter: Option<&str>) -> Result<ScanOutcome> {
    let capabilities = inner.protocol.capabilities();
    let discovery = &inner.discovery;

    // Transient frame subscription; dropped on every exit path.
    let mut frames_rx = inner.correlator.subscribe_frames();

    let deadline = if capabilities.end_of_scan_terminated {
        // The legacy family signals completion with an empty scan
        // response instead of a computed window.
        None
    } else {
        let timeout_ms = read_discovery_timeout(inner).await;
        debug!(timeout_ms, "discovery deadline computed");
        Some(Instant::now() + Duration::from_millis(timeout_ms))
    };

    let mut scan = commands::at_command(
        commands::CMD_NODE_DISCOVER,
        filter.map(str::as_bytes).unwrap_or_default(),
    );
    // A send failure aborts discovery entirely.
    let scan_id = inner.correlator.send_async(&mut scan).await?;
    debug!(scan_id, target = filter.unwrap_or("<all>"), "network scan started");

    let mut nodes = Vec::new();
    let mut target: Option<Arc<RemoteNode>> = None;

    loop {
        if discovery.stop.load(Ordering::Acquire) {
            debug!("discovery cancelled");
            break;
        }

        let slice = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    debug!("discovery deadline reached");
                    break;
                }
                remaining.min(POLL_INTERVAL)
            }
            None => POLL_INTERVAL,
        };

        let frame = match tokio::time::timeout(slice, frames_rx.recv()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(broadcast::error::RecvError::Lagged(missed))) => {
                warn!(missed, "discovery fell behind frame delivery");
                continue;
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => {
                return Err(Error::ConnectionLost);
            }
            // Slice elapsed; loop re-checks stop flag and deadline.
            Err(_) => continue,
        };

        if !is_scan_response(&frame, scan_id) {
            continue;
        }
        if let Some(status) = frame.at_status() {
            if !status.is_ok() {
                let _ = discovery.events.send(DiscoveryEvent::Error(format!(
                    "scan response reported {status}"
                )));
                continue;
            }
        }

        let value = frame.at_value().unwrap_or_default();
        if value.is_empty() {
            // An empty successful payload is the end-of-scan marker.
            if capabilities.end_of_scan_terminated {
                debug!("end-of-scan frame received");
                break;
            }
            continue;
        }

        let record = match parse_discovery_response(inner.protocol, value) {
            Ok(record) => record,
            Err(e) => {
                let _ = discovery
                    .events
                    .send(DiscoveryEvent::Error(format!("malformed scan response: {e}")));
                continue;
            }
        };

        if let Some(wanted) = filter {
            if record.node_id.as_deref() != Some(wanted) {
                continue;
            }
        }

        debug!(addr64 = %record.addr64, node_id = ?record.node_id, "peer discovered");
        let node = inner.directory.add(RemoteNode::from_record(
            Arc::downgrade(&inner.correlator),
            inner.protocol,
            &record,
        ))?;
        let _ = discovery.events.send(DiscoveryEvent::Discovered(record));
        nodes.push(Arc::clone(&node));

        if filter.is_some() {
            target = Some(node);
            if !capabilities.end_of_scan_terminated {
                // Targeted lookups short-circuit; the legacy family still
                // waits for its end-of-scan frame.
                debug!("target found, stopping scan");
                break;
            }
        }
    }

    Ok(ScanOutcome { nodes, target })
}

/// Returns `true` for responses belonging to this scan.
fn is_scan_response(frame: &Frame, scan_id: u8) -> bool {
    frame.frame_type() == FrameType::AtResponse
        && frame.frame_id() == scan_id
        && frame.at_command() == Some(commands::CMD_NODE_DISCOVER)
}

/// Read the module's discovery timing parameters and compute the scan
/// window in milliseconds.
///
/// Prefers the advertised total-time parameter; falls back to the coarse
/// timeout parameter times its unit plus the protocol's propagation pad,
/// and finally to a hardcoded default (with a discovery-error event)
/// when neither can be read. A sleep-capable power mode widens the
/// window to cover one additional sleep/wake cycle.
async fn read_discovery_timeout(inner: &NetworkInner) -> u64 {
    let pad_ms = inner.protocol.capabilities().discovery_pad.as_millis() as u64;

    let total_ms = match read_parameter(inner, commands::CMD_DISCOVER_TOTAL_TIME).await {
        Ok(value) if !value.is_empty() => Some(bytes_to_u64(&value)),
        _ => None,
    };

    let nt_units = if total_ms.is_none() {
        match read_parameter(inner, commands::CMD_DISCOVER_TIMEOUT).await {
            Ok(value) if !value.is_empty() => Some(bytes_to_u64(&value)),
            _ => {
                warn!("could not read discovery timeout parameter, using default");
                let _ = inner.discovery.events.send(DiscoveryEvent::Error(
                    "could not read discovery timeout parameter, using default".into(),
                ));
                None
            }
        }
    } else {
        None
    };

    let sleeping = match read_parameter(inner, commands::CMD_SLEEP_MODE).await {
        Ok(value) => value.first().copied().unwrap_or(0) != 0,
        Err(_) => false,
    };

    discovery_timeout_ms(total_ms, nt_units, pad_ms, sleeping)
}

/// Pure form of the deadline computation.
fn discovery_timeout_ms(
    total_ms: Option<u64>,
    nt_units: Option<u64>,
    pad_ms: u64,
    sleeping: bool,
) -> u64 {
    let base = match (total_ms, nt_units) {
        (Some(ms), _) => ms,
        (None, Some(units)) => units * NT_UNIT_MS + pad_ms,
        (None, None) => DEFAULT_DISCOVERY_TIMEOUT_MS + pad_ms,
    };
    if sleeping {
        // One additional sleep/wake cycle plus a 10% margin.
        base * 2 + base / 10
    } else {
        base
    }
}

async fn read_parameter(inner: &NetworkInner, cmd: meshlink_core::frame::AtCmd) -> Result<Vec<u8>> {
    let mut frame = commands::at_command(cmd, &[]);
    let response = inner
        .correlator
        .send_sync(&mut frame, inner.correlator.receive_timeout())
        .await?;
    check_at_response(&response)
}

fn bytes_to_u64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Parse a non-empty scan response payload into a [`NodeRecord`].
///
/// The address pair always comes first; the trailing fields depend on
/// the peer's protocol family.
fn parse_discovery_response(protocol: RadioProtocol, value: &[u8]) -> Result<NodeRecord> {
    if value.len() < 10 {
        return Err(Error::Protocol("discovery response too short".into()));
    }
    let addr16 = Addr16::from_bytes([value[0], value[1]]);
    let mut addr_bytes = [0u8; 8];
    addr_bytes.copy_from_slice(&value[2..10]);
    let addr64 = Addr64::from_bytes(addr_bytes);
    let mut record = NodeRecord::new(addr64, addr16);

    match protocol {
        RadioProtocol::Raw802154 => {
            // Signal-strength byte, then the node identifier.
            record.rssi = value.get(10).copied();
            if value.len() > 11 {
                let (node_id, _) = read_cstring(&value[11..]);
                if !node_id.is_empty() {
                    record.node_id = Some(node_id);
                }
            }
        }
        _ => {
            // Node identifier, parent address, device type, status,
            // profile id, manufacturer id; trailing fields are optional.
            let (node_id, rest) = read_cstring(&value[10..]);
            if !node_id.is_empty() {
                record.node_id = Some(node_id);
            }
            if rest.len() >= 2 {
                record.parent_addr = Some(Addr16::from_bytes([rest[0], rest[1]]));
            }
            if rest.len() >= 6 {
                record.profile_id = Some(u16::from_be_bytes([rest[4], rest[5]]));
            }
            if rest.len() >= 8 {
                record.manufacturer_id = Some(u16::from_be_bytes([rest[6], rest[7]]));
            }
        }
    }

    Ok(record)
}

/// Split a NUL-terminated string off the front of `bytes`.
fn read_cstring(bytes: &[u8]) -> (String, &[u8]) {
    match bytes.iter().position(|&b| b == 0) {
        Some(pos) => (
            String::from_utf8_lossy(&bytes[..pos]).to_string(),
            &bytes[pos + 1..],
        ),
        None => (String::from_utf8_lossy(bytes).to_string(), &[]),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
