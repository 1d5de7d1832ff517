//! Mock transport for deterministic testing of the protocol engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs plus an injection queue for unsolicited frames.
//! This lets you test frame encoding, response correlation, discovery,
//! and event dispatch without real hardware.
//!
//! The mock is cheaply cloneable; all clones share the same state. Tests
//! typically keep one clone and move the other into the engine, so that
//! expectations can be added and unsolicited data injected while the
//! engine's IO task owns "the transport".
//!
//! # Example
//!
//! ```
//! use meshlink_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! // Pre-load: when the engine sends this request, return this response.
//! mock.expect(&[0x7E, 0x00, 0x04, 0x08, 0x01, 0x41, 0x50, 0x65],
//!             &[0x7E, 0x00, 0x06, 0x88, 0x01, 0x41, 0x50, 0x00, 0x01, 0xE4]);
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshlink_core::error::{Error, Result};
use meshlink_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return when the matching request is received.
    response: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    /// Ordered queue of expected request/response pairs.
    expectations: VecDeque<Expectation>,
    /// Bytes pending for `receive()`: matched responses and injected data.
    rx_queue: VecDeque<u8>,
    /// Whether the transport is "connected".
    connected: bool,
    /// Log of all bytes sent through this transport.
    sent_log: Vec<Vec<u8>>,
}

/// A mock [`Transport`] for testing the protocol engine without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation; the
/// corresponding response bytes are then returned by subsequent
/// `receive()` calls. Unsolicited data pushed via [`inject()`](Self::inject)
/// is returned the same way without requiring a send.
///
/// If a send does not match the next expectation, or the queue is
/// exhausted, the send returns an error.
#[derive(Debug, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<State>>,
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        MockTransport {
            inner: Arc::new(Mutex::new(State {
                connected: true,
                ..State::default()
            })),
        }
    }

    /// Add an expected request/response pair.
    ///
    /// When `send()` is called with data matching `request`, the response
    /// bytes become available to `receive()`. An empty response models a
    /// peer that never answers.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.inner
            .lock()
            .unwrap()
            .expectations
            .push_back(Expectation {
                request: request.to_vec(),
                response: response.to_vec(),
            });
    }

    /// Queue unsolicited bytes for `receive()` without requiring a send.
    ///
    /// Used to simulate event frames (modem status, received data,
    /// discovery responses) arriving on their own.
    pub fn inject(&self, data: &[u8]) {
        self.inner.lock().unwrap().rx_queue.extend(data);
    }

    /// Return a copy of all data sent through this transport.
    ///
    /// Each element is the byte slice from one `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.inner.lock().unwrap().sent_log.clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.inner.lock().unwrap().expectations.len()
    }

    /// Set the connected state of the mock transport.
    ///
    /// When set to `false`, subsequent `send()` and `receive()` calls will
    /// return [`Error::InterfaceNotOpen`].
    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        if !state.connected {
            return Err(Error::InterfaceNotOpen);
        }

        // Record what was sent.
        state.sent_log.push(data.to_vec());

        // Match against the next expectation.
        if let Some(expectation) = state.expectations.pop_front() {
            if data != expectation.request.as_slice() {
                return Err(Error::Protocol(format!(
                    "unexpected send data: expected {:02X?}, got {:02X?}",
                    expectation.request, data
                )));
            }
            state.rx_queue.extend(expectation.response);
            Ok(())
        } else {
            Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            ))
        }
    }

    async fn receive(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.inner.lock().unwrap();
        if !state.connected {
            return Err(Error::InterfaceNotOpen);
        }

        if state.rx_queue.is_empty() {
            return Err(Error::Timeout);
        }

        let mut n = 0;
        while n < buf.len() {
            match state.rx_queue.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.connected = false;
        state.rx_queue.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        let request = &[0x7E, 0x00, 0x04, 0x08, 0x01, 0x41, 0x50, 0x65];
        let response = &[0x7E, 0x00, 0x06, 0x88, 0x01, 0x41, 0x50, 0x00, 0x01, 0xE4];

        handle.expect(request, response);

        mock.send(request).await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();

        assert_eq!(n, response.len());
        assert_eq!(&buf[..n], response);
    }

    #[tokio::test]
    async fn mock_transport_tracks_sent_data() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        let req1 = &[0x01, 0x02];
        let req2 = &[0x03, 0x04];

        handle.expect(req1, &[0xFF]);
        handle.expect(req2, &[0xFE]);

        mock.send(req1).await.unwrap();
        mock.send(req2).await.unwrap();

        assert_eq!(handle.sent_data().len(), 2);
        assert_eq!(handle.sent_data()[0], req1);
        assert_eq!(handle.sent_data()[1], req2);
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = MockTransport::new();
        mock.expect(&[0x01], &[0xFF]);

        let result = mock.send(&[0x99]).await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = MockTransport::new();

        let result = mock.send(&[0x01]).await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_receive_without_data_times_out() {
        let mut mock = MockTransport::new();
        let mut buf = [0u8; 64];

        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::Timeout));
    }

    #[tokio::test]
    async fn mock_transport_injected_data_is_received() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();

        handle.inject(&[0xAA, 0xBB, 0xCC]);

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB, 0xCC]);
    }

    #[tokio::test]
    async fn mock_transport_partial_receive() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        handle.inject(&[0xAA, 0xBB, 0xCC, 0xDD]);

        // Read with a buffer smaller than the queued data.
        let mut buf = [0u8; 2];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);

        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn mock_transport_disconnect() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        assert!(mock.is_connected());

        mock.close().await.unwrap();
        assert!(!mock.is_connected());

        let result = mock.send(&[0x01]).await;
        assert!(matches!(result.unwrap_err(), Error::InterfaceNotOpen));
    }

    #[tokio::test]
    async fn mock_transport_set_connected() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        handle.set_connected(false);

        let result = mock.send(&[0x01]).await;
        assert!(matches!(result.unwrap_err(), Error::InterfaceNotOpen));

        let mut buf = [0u8; 8];
        let result = mock.receive(&mut buf, Duration::from_millis(10)).await;
        assert!(matches!(result.unwrap_err(), Error::InterfaceNotOpen));
    }

    #[tokio::test]
    async fn mock_transport_remaining_expectations() {
        let handle = MockTransport::new();
        let mut mock = handle.clone();
        handle.expect(&[0x01], &[0xFF]);
        handle.expect(&[0x02], &[0xFE]);
        assert_eq!(handle.remaining_expectations(), 2);

        mock.send(&[0x01]).await.unwrap();
        assert_eq!(handle.remaining_expectations(), 1);

        mock.send(&[0x02]).await.unwrap();
        assert_eq!(handle.remaining_expectations(), 0);
    }
}
