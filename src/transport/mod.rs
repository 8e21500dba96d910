//! Byte transports for board links.
//!
//! A [`Transport`] owns one open connection and exposes the handful of
//! operations the exchange engine needs: write a command, ask how many bytes
//! are buffered, take them without blocking, and close. Framing lives in
//! [`crate::codec`]; timing lives in [`crate::exchange`].
//!
//! Implementations:
//! - [`SerialTransport`]: a real serial port through `tokio-serial`
//!   (feature `instrument_serial`).
//! - [`MockTransport`]: a scripted in-memory board used by tests and demos.

use crate::error::LinkResult;
use async_trait::async_trait;
use std::fmt;

pub mod mock;
pub mod registry;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::MockTransport;
pub use registry::PortClaim;
#[cfg(feature = "instrument_serial")]
pub use serial::{list_ports, SerialTransport};

/// Raw byte link to one board.
///
/// Reads are non-blocking: [`read_available`](Transport::read_available)
/// returns whatever is buffered right now, possibly nothing. Waiting for a
/// reply is the exchange engine's job.
#[async_trait]
pub trait Transport: Send + fmt::Debug {
    /// Port name or device identifier, used in logs and errors.
    fn port_name(&self) -> &str;

    /// Whether the underlying handle is still open.
    fn is_open(&self) -> bool;

    /// Write all bytes. Write failures are returned as-is, never retried.
    async fn write(&mut self, bytes: &[u8]) -> LinkResult<()>;

    /// Number of bytes currently buffered for reading.
    async fn bytes_available(&mut self) -> LinkResult<usize>;

    /// Take up to `max` buffered bytes without waiting for more.
    async fn read_available(&mut self, max: usize) -> LinkResult<Vec<u8>>;

    /// Drop everything currently buffered. Returns how many bytes were discarded.
    async fn clear_input(&mut self) -> LinkResult<usize> {
        let pending = self.bytes_available().await?;
        if pending == 0 {
            return Ok(0);
        }
        Ok(self.read_available(pending).await?.len())
    }

    /// Release the handle. Safe to call more than once.
    async fn close(&mut self) -> LinkResult<()>;
}

/// A serial port discovered on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// OS device name (`/dev/ttyACM0`, `COM4`, ...).
    pub device: String,
    /// USB manufacturer string, if the port is a USB device.
    pub manufacturer: Option<String>,
    /// USB product string, if reported.
    pub product: Option<String>,
}

impl PortInfo {
    /// True if the USB manufacturer starts with `prefix`.
    pub fn manufacturer_starts_with(&self, prefix: &str) -> bool {
        self.manufacturer
            .as_deref()
            .map(|m| m.starts_with(prefix))
            .unwrap_or(false)
    }
}
