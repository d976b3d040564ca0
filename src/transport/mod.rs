//! Transport layer for the board link.
//!
//! This module provides the abstraction the command layer talks to. The
//! production implementation is a serial port; tests use a scripted
//! in-memory transport.

#[cfg(test)]
pub(crate) mod mock;
pub mod serial;

use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;
use crate::protocol::{Frame, Message};

/// Trait for transport implementations.
///
/// The link is half-duplex with one outstanding request at a time, so the
/// transport is used through `&mut self` and never shared.
pub trait Transport: Send {
    /// Opens the link, retrying according to the transport's policy.
    fn connect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Closes the link. Closing an already closed link is a no-op.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<()>>;

    /// Encodes and writes one message. Input buffered from earlier exchanges
    /// is dropped first.
    fn send(&mut self, message: &Message) -> BoxFuture<'_, Result<()>>;

    /// Waits up to `timeout` for the next complete frame.
    ///
    /// Returns `Ok(None)` when the deadline passes without a frame; that is
    /// the normal "no answer yet" outcome, not an error. Malformed frames are
    /// dropped and waiting continues.
    fn receive(&mut self, timeout: Duration) -> BoxFuture<'_, Result<Option<Frame>>>;

    /// Returns true if connected.
    fn is_connected(&self) -> bool;
}

pub use serial::SerialTransport;
