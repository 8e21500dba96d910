//! Serial port transport backed by `tokio-serial`.
//!
//! Boards are opened 8N1 with no flow control. The port name is registered in
//! the process-wide [`PortClaim`] registry for as long as the transport lives.

use super::{PortClaim, PortInfo, Transport};
use crate::error::{LinkError, LinkResult};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, trace};

/// An open serial port.
#[derive(Debug)]
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    stream: Option<SerialStream>,
    claim: Option<PortClaim>,
}

impl SerialTransport {
    /// Open `port_name` at `baud_rate`.
    ///
    /// Must be called from inside a Tokio runtime; the stream registers with
    /// the runtime's reactor.
    ///
    /// # Errors
    /// [`LinkError::Connect`] if the port is missing, busy, or already open in
    /// this process.
    pub async fn open(port_name: &str, baud_rate: u32) -> LinkResult<Self> {
        let claim = PortClaim::acquire(port_name)?;

        let stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| LinkError::Connect {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        info!(port = port_name, baud_rate, "serial port opened");
        Ok(Self {
            port_name: port_name.to_string(),
            baud_rate,
            stream: Some(stream),
            claim: Some(claim),
        })
    }

    /// [`open`](Self::open), boxed for a [`crate::exchange::Link`].
    ///
    /// # Errors
    /// Same as [`open`](Self::open).
    pub async fn open_boxed(port_name: &str, baud_rate: u32) -> LinkResult<Box<dyn Transport>> {
        Ok(Box::new(Self::open(port_name, baud_rate).await?))
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn stream(&mut self) -> LinkResult<&mut SerialStream> {
        let port = self.port_name.clone();
        self.stream
            .as_mut()
            .ok_or(LinkError::NotConnected(port))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let port = self.port_name.clone();
        let stream = self.stream()?;
        trace!(port = %port, bytes = ?String::from_utf8_lossy(bytes), "write");
        stream
            .write_all(bytes)
            .await
            .map_err(|e| LinkError::io(&port, e))?;
        stream.flush().await.map_err(|e| LinkError::io(&port, e))
    }

    async fn bytes_available(&mut self) -> LinkResult<usize> {
        let port = self.port_name.clone();
        let stream = self.stream()?;
        let pending = stream
            .bytes_to_read()
            .map_err(|e| LinkError::io(&port, std::io::Error::from(e)))?;
        Ok(pending as usize)
    }

    async fn read_available(&mut self, max: usize) -> LinkResult<Vec<u8>> {
        let pending = self.bytes_available().await?.min(max);
        if pending == 0 {
            return Ok(Vec::new());
        }

        let port = self.port_name.clone();
        let stream = self.stream()?;
        let mut buf = vec![0u8; pending];
        // The driver already holds `pending` bytes, so this read completes
        // without waiting on the line.
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| LinkError::io(&port, e))?;
        buf.truncate(n);
        trace!(port = %port, bytes = ?String::from_utf8_lossy(&buf), "read");
        Ok(buf)
    }

    async fn clear_input(&mut self) -> LinkResult<usize> {
        let port = self.port_name.clone();
        let stream = self.stream()?;
        let pending = stream
            .bytes_to_read()
            .map_err(|e| LinkError::io(&port, std::io::Error::from(e)))?;
        stream
            .clear(tokio_serial::ClearBuffer::Input)
            .map_err(|e| LinkError::io(&port, std::io::Error::from(e)))?;
        Ok(pending as usize)
    }

    async fn close(&mut self) -> LinkResult<()> {
        if self.stream.take().is_some() {
            info!(port = %self.port_name, "serial port closed");
        }
        self.claim = None;
        Ok(())
    }
}

/// Enumerate serial ports, optionally keeping only USB devices whose
/// manufacturer string starts with `manufacturer_prefix` (`"STM"` for Nucleo
/// boards).
///
/// # Errors
/// [`LinkError::Connect`] if the OS port enumeration fails.
pub fn list_ports(manufacturer_prefix: Option<&str>) -> LinkResult<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(|e| LinkError::Connect {
        port: "<enumerate>".into(),
        reason: e.to_string(),
    })?;

    let found: Vec<PortInfo> = ports
        .into_iter()
        .map(|p| match p.port_type {
            serialport::SerialPortType::UsbPort(usb) => PortInfo {
                device: p.port_name,
                manufacturer: usb.manufacturer,
                product: usb.product,
            },
            _ => PortInfo {
                device: p.port_name,
                manufacturer: None,
                product: None,
            },
        })
        .filter(|info| match manufacturer_prefix {
            Some(prefix) => info.manufacturer_starts_with(prefix),
            None => true,
        })
        .collect();

    debug!(count = found.len(), prefix = ?manufacturer_prefix, "serial ports listed");
    Ok(found)
}
