//! meshlink-test-harness: Test utilities and mock transports for meshlink.
//!
//! This crate provides [`MockTransport`] for deterministic unit testing of
//! the protocol engine without requiring real radio hardware.

pub mod mock_serial;

pub use mock_serial::MockTransport;
