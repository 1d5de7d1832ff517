//! Request/response correlation engine.
//!
//! One IO task per connection owns the transport: it continuously reads
//! and deframes bytes, and every decoded frame is (a) tested against the
//! table of pending synchronous requests and (b) dispatched to the typed
//! event registries. Writes are funneled into the same task over an
//! `mpsc` channel so the transport has exactly one owner.
//!
//! Synchronous sends register a transient [`PendingRequest`] entry whose
//! match predicate checks frame-id, response frame-type family, echoed
//! command name, and transport echo; the calling task then waits on a
//! `oneshot` bounded by the receive timeout. The entry is removed on
//! every exit path -- match, timeout, or error -- so a failed call never
//! leaves a stale filter behind to corrupt a later call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use meshlink_core::error::{Error, Result};
use meshlink_core::events::{IoSampleEvent, ReceivedData};
use meshlink_core::frame::{AtCmd, Frame, FrameType, UNSET_FRAME_ID};
use meshlink_core::transport::Transport;
use meshlink_core::types::{ModemStatus, OperatingMode, TransmitStatus};

use crate::allocator::FrameIdAllocator;
use crate::wire::{self, DecodeResult};

/// Default timeout for a synchronous request/response exchange.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Broadcast channel capacity for each event registry.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Maximum receive buffer size before reset to prevent unbounded growth.
const MAX_RX_BUF: usize = 4096;

/// Timeout for a single idle transport read inside the IO loop.
const IDLE_READ_TIMEOUT: Duration = Duration::from_millis(100);

// ---------------------------------------------------------------------------
// Response matching
// ---------------------------------------------------------------------------

/// The response frame-type family a request pairs with.
///
/// Requests and responses pair by type family, not just by id: a plain
/// command's response type differs from a relayed/remote command's
/// response type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseKind {
    /// AtCommand / AtCommandQueue -> AtResponse.
    LocalAt,
    /// RemoteAtCommand -> RemoteAtResponse.
    RemoteAt,
    /// TransmitRequest / ExplicitTransmitRequest -> TransmitStatusEvent.
    Transmit,
}

impl ResponseKind {
    /// The response family for a request frame type, if it has one.
    fn for_request(frame_type: FrameType) -> Option<Self> {
        match frame_type {
            FrameType::AtCommand | FrameType::AtCommandQueue => Some(ResponseKind::LocalAt),
            FrameType::RemoteAtCommand => Some(ResponseKind::RemoteAt),
            FrameType::TransmitRequest | FrameType::ExplicitTransmitRequest => {
                Some(ResponseKind::Transmit)
            }
            _ => None,
        }
    }

    /// Returns `true` if `frame_type` is the correct counterpart.
    fn accepts(self, frame_type: FrameType) -> bool {
        match self {
            ResponseKind::LocalAt => frame_type == FrameType::AtResponse,
            ResponseKind::RemoteAt => frame_type == FrameType::RemoteAtResponse,
            ResponseKind::Transmit => frame_type == FrameType::TransmitStatusEvent,
        }
    }
}

/// Match predicate for one pending synchronous request.
#[derive(Debug)]
struct ResponseMatcher {
    frame_id: u8,
    kind: ResponseKind,
    /// For AT-style commands the echoed command name must match too.
    at_command: Option<AtCmd>,
    /// The frame as sent; a byte-identical received frame is transport
    /// echo and must never satisfy the wait.
    sent: Frame,
}

impl ResponseMatcher {
    fn matches(&self, frame: &Frame) -> bool {
        if *frame == self.sent {
            return false;
        }
        if frame.frame_id() != self.frame_id {
            return false;
        }
        if !self.kind.accepts(frame.frame_type()) {
            return false;
        }
        match self.at_command {
            Some(cmd) => frame.at_command() == Some(cmd),
            None => true,
        }
    }
}

/// One registered pending request.
struct PendingRequest {
    matcher: ResponseMatcher,
    slot: oneshot::Sender<Frame>,
}

/// Token-keyed table of pending requests.
///
/// Keys are registration tokens rather than frame ids so that the table
/// tolerates the allocator's id-space wrap while older requests are
/// still in flight.
#[derive(Default)]
struct PendingTable {
    next_token: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    fn register(&mut self, matcher: ResponseMatcher, slot: oneshot::Sender<Frame>) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.insert(token, PendingRequest { matcher, slot });
        token
    }

    fn remove(&mut self, token: u64) {
        self.entries.remove(&token);
    }

    /// Remove and return the oldest entry matching `frame`, if any.
    ///
    /// Exactly one pending wait is satisfied per frame.
    fn take_match(&mut self, frame: &Frame) -> Option<oneshot::Sender<Frame>> {
        let token = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.matcher.matches(frame))
            .map(|(&token, _)| token)
            .min()?;
        self.entries.remove(&token).map(|entry| entry.slot)
    }
}

// ---------------------------------------------------------------------------
// Event registries
// ---------------------------------------------------------------------------

/// Typed subscriber registries, one broadcast channel per event kind.
///
/// Dispatch happens synchronously on the IO task; the channels are
/// bounded and never block, so a slow subscriber lags rather than
/// stalling frame delivery for the connection.
#[derive(Clone)]
pub(crate) struct EventRegistry {
    pub frames: broadcast::Sender<Frame>,
    pub data: broadcast::Sender<ReceivedData>,
    pub io_samples: broadcast::Sender<IoSampleEvent>,
    pub modem_status: broadcast::Sender<ModemStatus>,
}

impl EventRegistry {
    fn new() -> Self {
        let (frames, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (data, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (io_samples, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (modem_status, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventRegistry {
            frames,
            data,
            io_samples,
            modem_status,
        }
    }
}

// ---------------------------------------------------------------------------
// Correlator
// ---------------------------------------------------------------------------

/// A write request sent from application tasks to the IO task.
struct WriteRequest {
    bytes: Vec<u8>,
    reply: oneshot::Sender<Result<()>>,
}

/// The connection's correlation engine and IO task handle.
///
/// Owned by the local [`Radio`](crate::device::Radio) and shared (by
/// `Arc`) with remote devices and the discovery engine.
pub struct Correlator {
    mode: OperatingMode,
    receive_timeout: Duration,
    allocator: Arc<FrameIdAllocator>,
    write_tx: mpsc::Sender<WriteRequest>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    pending: Arc<Mutex<PendingTable>>,
    events: EventRegistry,
    open: AtomicBool,
}

impl Drop for Correlator {
    fn drop(&mut self) {
        // Graceful: signal the IO loop to exit at the next select iteration.
        self.cancel.cancel();
        // Safety net: abort in case it's stuck in a transport read that
        // doesn't respect the cancellation token (e.g. hung USB-serial).
        self.task.abort();
    }
}

impl Correlator {
    /// Spawn the IO task and return the correlation engine.
    ///
    /// `mode` must already be resolved by the operating-mode probe; it is
    /// fixed for the life of the connection.
    pub fn spawn(
        transport: Box<dyn Transport>,
        mode: OperatingMode,
        receive_timeout: Duration,
        allocator: Arc<FrameIdAllocator>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel::<WriteRequest>(32);
        let cancel = CancellationToken::new();
        let pending: Arc<Mutex<PendingTable>> = Arc::new(Mutex::new(PendingTable::default()));
        let events = EventRegistry::new();

        let task = tokio::spawn(io_loop(
            transport,
            mode == OperatingMode::FramedEscaped,
            Arc::clone(&pending),
            events.clone(),
            write_rx,
            cancel.clone(),
        ));

        Correlator {
            mode,
            receive_timeout,
            allocator,
            write_tx,
            cancel,
            task,
            pending,
            events,
            open: AtomicBool::new(true),
        }
    }

    /// The operating mode resolved for this connection.
    pub fn operating_mode(&self) -> OperatingMode {
        self.mode
    }

    /// The configured synchronous receive timeout.
    pub fn receive_timeout(&self) -> Duration {
        self.receive_timeout
    }

    /// The connection's frame-id allocator.
    pub fn allocator(&self) -> &Arc<FrameIdAllocator> {
        &self.allocator
    }

    /// Returns `true` until [`close()`](Self::close) is called.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Close the connection and stop the IO task.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("closing connection");
            self.cancel.cancel();
        }
    }

    /// Subscribe to every decoded frame.
    pub fn subscribe_frames(&self) -> broadcast::Receiver<Frame> {
        self.events.frames.subscribe()
    }

    /// Subscribe to received data packets.
    pub fn subscribe_data(&self) -> broadcast::Receiver<ReceivedData> {
        self.events.data.subscribe()
    }

    /// Subscribe to received IO samples.
    pub fn subscribe_io_samples(&self) -> broadcast::Receiver<IoSampleEvent> {
        self.events.io_samples.subscribe()
    }

    /// Subscribe to modem status events.
    pub fn subscribe_modem_status(&self) -> broadcast::Receiver<ModemStatus> {
        self.events.modem_status.subscribe()
    }

    /// Send a frame without waiting for its response.
    ///
    /// Assigns a frame id when the type requires one and none is set, and
    /// returns the id actually sent. Callers that want the response
    /// subscribe to [`subscribe_frames()`](Self::subscribe_frames) before
    /// sending; the subscription lives until they drop it.
    pub async fn send_async(&self, frame: &mut Frame) -> Result<u8> {
        self.ensure_sendable()?;
        self.assign_frame_id(frame);
        let bytes = wire::encode_frame(frame, self.mode == OperatingMode::FramedEscaped);
        self.write(bytes).await?;
        Ok(frame.frame_id())
    }

    /// Send a frame and wait for its correlated response.
    ///
    /// The response must carry the same frame id, the protocol-correct
    /// counterpart frame type, and (for AT-style commands) the echoed
    /// command name; a frame byte-identical to the one sent is transport
    /// echo and is ignored. Times out after `timeout` with the pending
    /// entry removed -- on success, timeout, and every error path alike.
    pub async fn send_sync(&self, frame: &mut Frame, timeout: Duration) -> Result<Frame> {
        self.ensure_sendable()?;
        self.assign_frame_id(frame);

        let kind = ResponseKind::for_request(frame.frame_type()).ok_or_else(|| {
            Error::InvalidParameter(format!(
                "frame type {} has no response counterpart",
                frame.frame_type()
            ))
        })?;
        let matcher = ResponseMatcher {
            frame_id: frame.frame_id(),
            kind,
            at_command: frame.at_command(),
            sent: frame.clone(),
        };

        let (slot_tx, slot_rx) = oneshot::channel();
        let token = self
            .pending
            .lock()
            .unwrap()
            .register(matcher, slot_tx);

        let bytes = wire::encode_frame(frame, self.mode == OperatingMode::FramedEscaped);
        if let Err(e) = self.write(bytes).await {
            self.pending.lock().unwrap().remove(token);
            return Err(e);
        }

        match tokio::time::timeout(timeout, slot_rx).await {
            Ok(Ok(response)) => {
                // Already removed by the IO task on match; idempotent.
                self.pending.lock().unwrap().remove(token);
                trace!(
                    frame_id = frame.frame_id(),
                    response_type = %response.frame_type(),
                    "response received"
                );
                Ok(response)
            }
            Ok(Err(_)) => {
                self.pending.lock().unwrap().remove(token);
                Err(Error::ConnectionLost)
            }
            Err(_) => {
                self.pending.lock().unwrap().remove(token);
                debug!(frame_id = frame.frame_id(), "synchronous send timed out");
                Err(Error::Timeout)
            }
        }
    }

    /// Send a frame synchronously and check the delivery status it
    /// reports.
    ///
    /// A missing response is itself a failure ([`Error::Timeout`]); a
    /// present response whose status is neither success nor
    /// self-addressed is surfaced as [`Error::TransmitFailed`] carrying
    /// the status code.
    pub async fn send_checked(
        &self,
        frame: &mut Frame,
        timeout: Duration,
    ) -> Result<TransmitStatus> {
        let response = self.send_sync(frame, timeout).await?;
        let status = response.delivery_status().ok_or_else(|| {
            Error::Protocol(format!(
                "{} response carried no delivery status",
                response.frame_type()
            ))
        })?;
        if status.is_success() {
            Ok(status)
        } else {
            Err(Error::TransmitFailed(status))
        }
    }

    fn ensure_sendable(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::InterfaceNotOpen);
        }
        if !self.mode.is_sendable() {
            return Err(Error::InvalidOperatingMode(self.mode));
        }
        Ok(())
    }

    fn assign_frame_id(&self, frame: &mut Frame) {
        if frame.needs_frame_id() && frame.frame_id() == UNSET_FRAME_ID {
            frame.set_frame_id(self.allocator.next());
        }
    }

    async fn write(&self, bytes: Vec<u8>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send(WriteRequest {
                bytes,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::InterfaceNotOpen)?;
        reply_rx.await.map_err(|_| Error::InterfaceNotOpen)?
    }
}

// ---------------------------------------------------------------------------
// IO loop
// ---------------------------------------------------------------------------

/// The main loop of the IO task. Owns the transport exclusively.
///
/// Uses `tokio::select! { biased; }` to prioritize cancellation, then
/// writes, then idle reads.
async fn io_loop(
    mut transport: Box<dyn Transport>,
    escaped: bool,
    pending: Arc<Mutex<PendingTable>>,
    events: EventRegistry,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    cancel: CancellationToken,
) {
    let mut rx_buf: Vec<u8> = Vec::new();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("IO task cancelled");
                let _ = transport.close().await;
                break;
            }

            req = write_rx.recv() => {
                match req {
                    Some(WriteRequest { bytes, reply }) => {
                        let result = transport.send(&bytes).await;
                        let _ = reply.send(result);
                    }
                    None => {
                        debug!("all write senders dropped, exiting IO task");
                        let _ = transport.close().await;
                        break;
                    }
                }
            }

            // Idle: read and deframe incoming bytes.
            _ = async {
                let mut buf = [0u8; 256];
                match transport.receive(&mut buf, IDLE_READ_TIMEOUT).await {
                    Ok(n) if n > 0 => {
                        rx_buf.extend_from_slice(&buf[..n]);
                        if rx_buf.len() > MAX_RX_BUF {
                            warn!(len = rx_buf.len(), "receive buffer overflow, resetting");
                            rx_buf.clear();
                            return;
                        }
                        drain_frames(&mut rx_buf, escaped, &pending, &events);
                    }
                    _ => {
                        // Timeout or error -- yield briefly so the loop can
                        // check for writes or cancellation.
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            } => {}
        }
    }
}

/// Decode and dispatch every complete frame in the receive buffer.
///
/// Incomplete trailing data is left for the next read; invalid stretches
/// are discarded with a log line.
fn drain_frames(
    buf: &mut Vec<u8>,
    escaped: bool,
    pending: &Mutex<PendingTable>,
    events: &EventRegistry,
) {
    loop {
        match wire::decode_frame(buf, escaped) {
            DecodeResult::Frame(frame, consumed) => {
                buf.drain(..consumed);
                dispatch_frame(frame, pending, events);
            }
            DecodeResult::Incomplete => break,
            DecodeResult::Invalid(consumed) => {
                debug!(discarded = consumed, "discarding invalid frame data");
                buf.drain(..consumed.max(1));
            }
        }
    }
}

/// Deliver one decoded frame: satisfy at most one pending wait, then
/// fan out to the typed event registries.
fn dispatch_frame(frame: Frame, pending: &Mutex<PendingTable>, events: &EventRegistry) {
    trace!(
        frame_type = %frame.frame_type(),
        frame_id = frame.frame_id(),
        "frame received"
    );

    if let Some(slot) = pending.lock().unwrap().take_match(&frame) {
        let _ = slot.send(frame.clone());
    }

    let _ = events.frames.send(frame.clone());

    match frame.frame_type() {
        FrameType::Receive | FrameType::ExplicitReceive => {
            if let Some(data) = parse_received_data(&frame) {
                let _ = events.data.send(data);
            }
        }
        FrameType::IoSample => {
            if let Some(sample) = parse_io_sample(&frame) {
                let _ = events.io_samples.send(sample);
            }
        }
        FrameType::ModemStatusEvent => {
            if let Some(status) = frame.modem_status() {
                debug!(%status, "modem status");
                let _ = events.modem_status.send(status);
            }
        }
        _ => {}
    }
}

/// Receive option bit: the packet was a broadcast.
const RX_OPT_BROADCAST: u8 = 0x02;

/// Parse a Receive or ExplicitReceive frame into a [`ReceivedData`] event.
fn parse_received_data(frame: &Frame) -> Option<ReceivedData> {
    let (addr64, addr16) = frame.source_addrs()?;
    let (options_pos, data_pos) = match frame.frame_type() {
        FrameType::Receive => (10, 11),
        // addr64 (8) + addr16 (2) + endpoints (2) + cluster (2) + profile (2)
        FrameType::ExplicitReceive => (16, 17),
        _ => return None,
    };
    let options = *frame.payload().get(options_pos)?;
    let payload = frame.payload().get(data_pos..)?.to_vec();
    Some(ReceivedData {
        addr64,
        addr16,
        is_broadcast: options & RX_OPT_BROADCAST != 0,
        payload,
    })
}

/// Parse an IoSample frame into an [`IoSampleEvent`], leaving the sample
/// bit layout opaque.
fn parse_io_sample(frame: &Frame) -> Option<IoSampleEvent> {
    let (addr64, addr16) = frame.source_addrs()?;
    let data = frame.payload().get(11..)?.to_vec();
    Some(IoSampleEvent {
        addr64,
        addr16,
        data,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands;
    use meshlink_core::addr::{Addr16, Addr64};
    use meshlink_core::types::AtStatus;
    use meshlink_test_harness::MockTransport;

    const TEST_TIMEOUT: Duration = Duration::from_millis(300);

    /// Spawn a correlator over a fresh mock transport.
    fn spawn_mock(mode: OperatingMode) -> (Correlator, MockTransport) {
        let handle = MockTransport::new();
        let transport = Box::new(handle.clone());
        let correlator = Correlator::spawn(
            transport,
            mode,
            DEFAULT_RECEIVE_TIMEOUT,
            Arc::new(FrameIdAllocator::new()),
        );
        (correlator, handle)
    }

    /// Wire bytes for an AT response to `cmd` with frame id `id`.
    fn at_response_bytes(id: u8, cmd: &[u8; 2], status: u8, value: &[u8]) -> Vec<u8> {
        let mut payload = cmd.to_vec();
        payload.push(status);
        payload.extend_from_slice(value);
        let frame = Frame::with_frame_id(FrameType::AtResponse, id, payload);
        wire::encode_frame(&frame, false)
    }

    /// Wire bytes for a transmit status with frame id `id`.
    fn transmit_status_bytes(id: u8, delivery: u8) -> Vec<u8> {
        let frame = Frame::with_frame_id(
            FrameType::TransmitStatusEvent,
            id,
            vec![0xFF, 0xFE, 0x00, delivery, 0x00],
        );
        wire::encode_frame(&frame, false)
    }

    #[tokio::test]
    async fn send_sync_matches_response_by_id_type_and_command() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        let mut frame = commands::at_command(commands::CMD_API_MODE, &[]);
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        mock.expect(&request, &at_response_bytes(1, b"AP", 0x00, &[0x01]));

        let response = correlator.send_sync(&mut frame, TEST_TIMEOUT).await.unwrap();
        assert_eq!(response.frame_type(), FrameType::AtResponse);
        assert_eq!(response.at_status(), Some(AtStatus::Ok));
        assert_eq!(response.at_value(), Some(&[0x01][..]));
    }

    #[tokio::test]
    async fn mismatched_command_name_does_not_satisfy_wait() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        let mut frame = commands::at_command(commands::CMD_DISCOVER_TIMEOUT, &[]);
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        // Same frame id, correct response type, wrong command name.
        mock.expect(&request, &at_response_bytes(1, b"NI", 0x00, b"NODE"));

        let result = correlator.send_sync(&mut frame, TEST_TIMEOUT).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn mismatched_response_type_does_not_satisfy_wait() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        // A transmit request must pair with a transmit status, not an
        // AT response that happens to share its id.
        let mut frame =
            commands::transmit_request(Addr64::new(0x42), Addr16::UNKNOWN, 0, 0, b"x");
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        mock.expect(&request, &at_response_bytes(1, b"AP", 0x00, &[0x01]));

        let result = correlator.send_sync(&mut frame, TEST_TIMEOUT).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn transport_echo_never_satisfies_wait() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        let mut frame = commands::at_command(commands::CMD_API_MODE, &[]);
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        // The transport echoes our own bytes back, then the real response
        // arrives. The echo must be skipped.
        let mut reply = request.clone();
        reply.extend_from_slice(&at_response_bytes(1, b"AP", 0x00, &[0x02]));
        mock.expect(&request, &reply);

        let response = correlator.send_sync(&mut frame, TEST_TIMEOUT).await.unwrap();
        assert_eq!(response.frame_type(), FrameType::AtResponse);
        assert_eq!(response.at_value(), Some(&[0x02][..]));
    }

    #[tokio::test]
    async fn echo_alone_times_out() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        let mut frame = commands::at_command(commands::CMD_API_MODE, &[]);
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        mock.expect(&request, &request.clone());

        let result = correlator.send_sync(&mut frame, TEST_TIMEOUT).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn stale_response_after_timeout_never_satisfies_new_wait() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        // First request (id 1) gets no response and times out.
        let mut first = commands::at_command(commands::CMD_API_MODE, &[]);
        let first_bytes = {
            let mut f = first.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        mock.expect(&first_bytes, &[]);
        let result = correlator.send_sync(&mut first, TEST_TIMEOUT).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));

        // Second request (id 2, same command) is answered only by the
        // original stale response for id 1, which must not satisfy it.
        let mut second = commands::at_command(commands::CMD_API_MODE, &[]);
        let second_bytes = {
            let mut f = second.clone();
            f.set_frame_id(2);
            wire::encode_frame(&f, false)
        };
        mock.expect(&second_bytes, &at_response_bytes(1, b"AP", 0x00, &[0x01]));

        let result = correlator.send_sync(&mut second, TEST_TIMEOUT).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn send_requires_sendable_mode() {
        for mode in [OperatingMode::LegacyCommand, OperatingMode::Unknown] {
            let (correlator, _mock) = spawn_mock(mode);
            let mut frame = commands::at_command(commands::CMD_API_MODE, &[]);
            let result = correlator.send_sync(&mut frame, TEST_TIMEOUT).await;
            assert!(matches!(
                result.unwrap_err(),
                Error::InvalidOperatingMode(m) if m == mode
            ));
        }
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (correlator, _mock) = spawn_mock(OperatingMode::Framed);
        correlator.close();

        let mut frame = commands::at_command(commands::CMD_API_MODE, &[]);
        let result = correlator.send_async(&mut frame).await;
        assert!(matches!(result.unwrap_err(), Error::InterfaceNotOpen));
    }

    #[tokio::test]
    async fn send_checked_success_statuses() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        for (id, delivery) in [(1u8, 0x00u8), (2, 0x23)] {
            let mut frame =
                commands::transmit_request(Addr64::new(0x42), Addr16::UNKNOWN, 0, 0, b"hi");
            let request = {
                let mut f = frame.clone();
                f.set_frame_id(id);
                wire::encode_frame(&f, false)
            };
            mock.expect(&request, &transmit_status_bytes(id, delivery));

            let status = correlator.send_checked(&mut frame, TEST_TIMEOUT).await.unwrap();
            assert!(status.is_success());
        }
    }

    #[tokio::test]
    async fn send_checked_surfaces_failure_status() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);

        let mut frame =
            commands::transmit_request(Addr64::new(0x42), Addr16::UNKNOWN, 0, 0, b"hi");
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        mock.expect(&request, &transmit_status_bytes(1, 0x24));

        let result = correlator.send_checked(&mut frame, TEST_TIMEOUT).await;
        assert!(matches!(
            result.unwrap_err(),
            Error::TransmitFailed(TransmitStatus::AddressNotFound)
        ));
    }

    #[tokio::test]
    async fn unsolicited_modem_status_reaches_subscribers() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);
        let mut status_rx = correlator.subscribe_modem_status();

        let frame = Frame::new(FrameType::ModemStatusEvent, vec![0x00]);
        mock.inject(&wire::encode_frame(&frame, false));

        let status = tokio::time::timeout(Duration::from_secs(1), status_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status, ModemStatus::HardwareReset);
    }

    #[tokio::test]
    async fn unsolicited_data_frame_is_parsed_and_dispatched() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);
        let mut data_rx = correlator.subscribe_data();

        let mut payload = Vec::new();
        payload.extend_from_slice(&Addr64::new(0x0013_A200_0000_0007).to_bytes());
        payload.extend_from_slice(&Addr16::new(0x1234).to_bytes());
        payload.push(RX_OPT_BROADCAST);
        payload.extend_from_slice(b"hello");
        let frame = Frame::new(FrameType::Receive, payload);
        mock.inject(&wire::encode_frame(&frame, false));

        let data = tokio::time::timeout(Duration::from_secs(1), data_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.addr64, Addr64::new(0x0013_A200_0000_0007));
        assert_eq!(data.addr16, Addr16::new(0x1234));
        assert!(data.is_broadcast);
        assert_eq!(data.payload, b"hello");
    }

    #[tokio::test]
    async fn io_sample_frame_is_dispatched_with_raw_sample() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);
        let mut sample_rx = correlator.subscribe_io_samples();

        let mut payload = Vec::new();
        payload.extend_from_slice(&Addr64::new(0x0013_A200_0000_0008).to_bytes());
        payload.extend_from_slice(&Addr16::new(0x0002).to_bytes());
        payload.push(0x01); // options
        payload.extend_from_slice(&[0x01, 0x00, 0x1C, 0x02, 0x00, 0x14]);
        let frame = Frame::new(FrameType::IoSample, payload);
        mock.inject(&wire::encode_frame(&frame, false));

        let sample = tokio::time::timeout(Duration::from_secs(1), sample_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sample.addr64, Addr64::new(0x0013_A200_0000_0008));
        assert_eq!(sample.data, vec![0x01, 0x00, 0x1C, 0x02, 0x00, 0x14]);
    }

    #[tokio::test]
    async fn escaped_mode_serializes_escaped() {
        let (correlator, mock) = spawn_mock(OperatingMode::FramedEscaped);

        // Parameter value 0x13 (XOFF) forces an escape sequence.
        let mut frame = commands::at_command(commands::CMD_SLEEP_MODE, &[0x13]);
        let request = {
            let mut f = frame.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, true)
        };
        assert!(request.windows(2).any(|w| w[0] == wire::ESCAPE));

        let response = {
            let f = Frame::with_frame_id(
                FrameType::AtResponse,
                1,
                vec![b'S', b'M', 0x00],
            );
            wire::encode_frame(&f, true)
        };
        mock.expect(&request, &response);

        let resp = correlator.send_sync(&mut frame, TEST_TIMEOUT).await.unwrap();
        assert_eq!(resp.at_status(), Some(AtStatus::Ok));
    }

    #[tokio::test]
    async fn concurrent_waits_each_get_their_own_response() {
        let (correlator, mock) = spawn_mock(OperatingMode::Framed);
        let correlator = Arc::new(correlator);

        // Two requests in flight; both responses arrive after the second
        // send, out of order.
        let mut f1 = commands::at_command(commands::CMD_ADDR_HIGH, &[]);
        let mut f2 = commands::at_command(commands::CMD_ADDR_LOW, &[]);
        let r1 = {
            let mut f = f1.clone();
            f.set_frame_id(1);
            wire::encode_frame(&f, false)
        };
        let r2 = {
            let mut f = f2.clone();
            f.set_frame_id(2);
            wire::encode_frame(&f, false)
        };
        mock.expect(&r1, &[]);
        let mut both = at_response_bytes(2, b"SL", 0x00, &[0x04]);
        both.extend_from_slice(&at_response_bytes(1, b"SH", 0x00, &[0x03]));
        mock.expect(&r2, &both);

        let c1 = Arc::clone(&correlator);
        let wait1 =
            tokio::spawn(async move { c1.send_sync(&mut f1, Duration::from_secs(1)).await });
        // Let the first send hit the transport before the second.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let c2 = Arc::clone(&correlator);
        let wait2 =
            tokio::spawn(async move { c2.send_sync(&mut f2, Duration::from_secs(1)).await });

        let resp1 = wait1.await.unwrap().unwrap();
        let resp2 = wait2.await.unwrap().unwrap();
        assert_eq!(resp1.at_command(), Some(commands::CMD_ADDR_HIGH));
        assert_eq!(resp2.at_command(), Some(commands::CMD_ADDR_LOW));
    }
}
