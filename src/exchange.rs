//! Command/response exchange over one link.
//!
//! A [`Link`] pairs a [`Transport`] with a [`FrameCodec`] and runs strictly
//! half-duplex exchanges: write one command, then poll the transport at a
//! fixed interval until a complete frame decodes or the deadline passes.
//!
//! ```text
//!            write ok            frame decoded
//!   (idle) ───────────▶ WAITING ───────────────▶ SATISFIED
//!                          │
//!                          │ deadline elapsed
//!                          ▼
//!                      TIMED_OUT
//! ```
//!
//! Deadlines come from the command class ([`CommandClass`]) so a slow capture
//! does not share the budget of a quick status query. The poll wait is the
//! only suspension point and is interruptible through a
//! [`CancellationToken`].

use crate::codec::{Command, Frame, FrameCodec};
use crate::error::{LinkError, LinkResult};
use crate::transport::Transport;
use bytes::BytesMut;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Deadline class of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Status and identification queries.
    Quick,
    /// Commands that move something before acknowledging.
    Motion,
    /// Captures that run on the board before acknowledging.
    Capture,
    /// Measurement reads.
    Readout,
}

/// Per-class deadlines plus the poll interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTimeouts {
    /// Deadline for [`CommandClass::Quick`].
    pub quick: Duration,
    /// Deadline for [`CommandClass::Motion`].
    pub motion: Duration,
    /// Deadline for [`CommandClass::Capture`].
    pub capture: Duration,
    /// Deadline for [`CommandClass::Readout`].
    pub readout: Duration,
    /// Sleep between "bytes available" polls.
    pub poll_interval: Duration,
}

impl Default for ExchangeTimeouts {
    fn default() -> Self {
        Self {
            quick: Duration::from_millis(200),
            motion: Duration::from_millis(1000),
            capture: Duration::from_millis(2000),
            readout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
        }
    }
}

impl ExchangeTimeouts {
    /// Deadline for a command class.
    pub fn for_class(&self, class: CommandClass) -> Duration {
        match class {
            CommandClass::Quick => self.quick,
            CommandClass::Motion => self.motion,
            CommandClass::Capture => self.capture,
            CommandClass::Readout => self.readout,
        }
    }
}

/// State of the exchange in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Command written, no frame yet.
    Waiting,
    /// A matching frame was decoded.
    Satisfied,
    /// Deadline elapsed with no usable frame.
    TimedOut,
}

/// Book-keeping for the current (or last) exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingExchange {
    /// Rendered command.
    pub command: String,
    /// When the exchange gives up.
    pub deadline: Instant,
    /// Current state.
    pub state: ExchangeState,
}

/// A transport plus the codec its board speaks.
#[derive(Debug)]
pub struct Link {
    transport: Box<dyn Transport>,
    codec: Box<dyn FrameCodec>,
    timeouts: ExchangeTimeouts,
    rx: BytesMut,
    pending: Option<PendingExchange>,
}

impl Link {
    /// Wrap an open transport.
    pub fn new(
        transport: Box<dyn Transport>,
        codec: Box<dyn FrameCodec>,
        timeouts: ExchangeTimeouts,
    ) -> Self {
        Self {
            transport,
            codec,
            timeouts,
            rx: BytesMut::with_capacity(256),
            pending: None,
        }
    }

    /// Port name of the transport.
    pub fn port_name(&self) -> &str {
        self.transport.port_name()
    }

    /// Whether the transport handle is open.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Configured deadlines.
    pub fn timeouts(&self) -> &ExchangeTimeouts {
        &self.timeouts
    }

    /// The codec in use.
    pub fn codec(&self) -> &dyn FrameCodec {
        self.codec.as_ref()
    }

    /// The current or most recent exchange.
    pub fn pending(&self) -> Option<&PendingExchange> {
        self.pending.as_ref()
    }

    /// Swap in a freshly opened transport, dropping buffered bytes.
    pub fn replace_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = transport;
        self.rx.clear();
        self.pending = None;
    }

    /// Close the transport.
    pub async fn close(&mut self) -> LinkResult<()> {
        self.rx.clear();
        self.pending = None;
        self.transport.close().await
    }

    /// Exchange with the deadline of `class`.
    pub async fn exchange(&mut self, command: &Command, class: CommandClass) -> LinkResult<Frame> {
        let deadline = self.timeouts.for_class(class);
        self.exchange_within(command, deadline, None).await
    }

    /// Write `command` and wait up to `deadline` for the matching reply.
    ///
    /// # Errors
    /// - [`LinkError::ExchangeTimeout`] if no frame decodes in time.
    /// - [`LinkError::FrameParse`] if a frame decodes but is malformed or
    ///   carries a different verb.
    /// - [`LinkError::BoardRejected`] if the board answers with its error verb.
    /// - [`LinkError::Cancelled`] if `cancel` fires first.
    /// - [`LinkError::Io`] on transport failure.
    pub async fn exchange_within(
        &mut self,
        command: &Command,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Frame> {
        let label = command.to_string();
        let bytes = self.codec.encode(command)?;
        self.write_command(&label, &bytes, deadline).await?;

        let started = Instant::now();
        let frame = self.await_frame(&label, started + deadline, cancel).await?;
        self.check_reply(command, &label, frame, started)
    }

    /// Write a command that has no reply.
    pub async fn send_only(&mut self, command: &Command) -> LinkResult<()> {
        let label = command.to_string();
        let bytes = self.codec.encode(command)?;
        self.discard_stale().await?;
        self.pending = None;
        self.transport.write(&bytes).await?;
        debug!(port = %self.port_name(), command = %label, "command sent (no reply expected)");
        Ok(())
    }

    /// Write raw bytes and return whatever arrives once the board starts
    /// answering. Used for probes that bypass the framing.
    pub async fn exchange_raw(
        &mut self,
        bytes: &[u8],
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Vec<u8>> {
        let label = String::from_utf8_lossy(bytes).into_owned();
        self.write_command(&label, bytes, deadline).await?;
        let deadline_at = Instant::now() + deadline;

        loop {
            self.fill_rx().await?;
            if !self.rx.is_empty() {
                // One more poll lets the rest of a short reply land.
                self.nap(self.timeouts.poll_interval, &label, cancel).await?;
                self.fill_rx().await?;
                self.set_state(ExchangeState::Satisfied);
                return Ok(self.rx.split().to_vec());
            }
            self.wait_or_time_out(&label, deadline, deadline_at, cancel).await?;
        }
    }

    /// Wait for the next frame without writing anything, for boards that
    /// stream unprompted.
    pub async fn read_frame(
        &mut self,
        deadline: Duration,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Frame> {
        let label = "<stream>".to_string();
        self.pending = Some(PendingExchange {
            command: label.clone(),
            deadline: Instant::now() + deadline,
            state: ExchangeState::Waiting,
        });
        let frame = self
            .await_frame(&label, Instant::now() + deadline, cancel)
            .await?;
        self.set_state(ExchangeState::Satisfied);
        Ok(frame)
    }

    async fn write_command(&mut self, label: &str, bytes: &[u8], deadline: Duration) -> LinkResult<()> {
        if let Some(previous) = &self.pending {
            if previous.state == ExchangeState::Waiting {
                debug!(port = %self.port_name(), command = %previous.command, "abandoned exchange left a reply slot open");
            }
        }
        self.discard_stale().await?;
        self.pending = Some(PendingExchange {
            command: label.to_string(),
            deadline: Instant::now() + deadline,
            state: ExchangeState::Waiting,
        });
        if let Err(e) = self.transport.write(bytes).await {
            self.pending = None;
            return Err(e);
        }
        trace!(port = %self.port_name(), command = %label, "command written");
        Ok(())
    }

    async fn discard_stale(&mut self) -> LinkResult<()> {
        let buffered = self.rx.len();
        self.rx.clear();
        let flushed = self.transport.clear_input().await?;
        if buffered + flushed > 0 {
            debug!(
                port = %self.port_name(),
                bytes = buffered + flushed,
                "discarded stale input before command"
            );
        }
        Ok(())
    }

    async fn fill_rx(&mut self) -> LinkResult<()> {
        let available = self.transport.bytes_available().await?;
        if available > 0 {
            let chunk = self.transport.read_available(available).await?;
            self.rx.extend_from_slice(&chunk);
        }
        Ok(())
    }

    async fn await_frame(
        &mut self,
        label: &str,
        deadline_at: Instant,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<Frame> {
        let budget = deadline_at.saturating_duration_since(Instant::now());
        loop {
            self.fill_rx().await?;
            match self.codec.decode(&mut self.rx) {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.pending = None;
                    warn!(port = %self.port_name(), command = %label, error = %e, "malformed reply");
                    return Err(e);
                }
            }
            self.wait_or_time_out(label, budget, deadline_at, cancel).await?;
        }
    }

    async fn wait_or_time_out(
        &mut self,
        label: &str,
        budget: Duration,
        deadline_at: Instant,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<()> {
        let now = Instant::now();
        if now >= deadline_at {
            self.set_state(ExchangeState::TimedOut);
            warn!(
                port = %self.port_name(),
                command = %label,
                waited_ms = budget.as_millis() as u64,
                buffered = self.rx.len(),
                "exchange timed out"
            );
            return Err(LinkError::ExchangeTimeout {
                command: label.to_string(),
                waited: budget,
            });
        }
        let nap = self.timeouts.poll_interval.min(deadline_at - now);
        self.nap(nap, label, cancel).await
    }

    async fn nap(
        &mut self,
        nap: Duration,
        label: &str,
        cancel: Option<&CancellationToken>,
    ) -> LinkResult<()> {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        self.pending = None;
                        debug!(port = %self.port_name(), command = %label, "exchange cancelled");
                        Err(LinkError::Cancelled(label.to_string()))
                    }
                    _ = tokio::time::sleep(nap) => Ok(()),
                }
            }
            None => {
                tokio::time::sleep(nap).await;
                Ok(())
            }
        }
    }

    fn check_reply(
        &mut self,
        command: &Command,
        label: &str,
        frame: Frame,
        started: Instant,
    ) -> LinkResult<Frame> {
        let expected = command.expected_reply();
        let verb = frame.verb().unwrap_or_default();

        if verb != expected {
            self.pending = None;
            if self.codec.error_verb() == Some(verb) {
                warn!(port = %self.port_name(), command = %label, "board rejected command");
                return Err(LinkError::BoardRejected {
                    command: label.to_string(),
                    reply: String::from_utf8_lossy(frame.raw()).into_owned(),
                });
            }
            return Err(LinkError::frame(
                frame.dialect().name(),
                format!("expected reply '{expected}', got '{verb}'"),
                frame.raw(),
            ));
        }

        self.set_state(ExchangeState::Satisfied);
        debug!(
            port = %self.port_name(),
            command = %label,
            fields = frame.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "exchange satisfied"
        );
        Ok(frame)
    }

    fn set_state(&mut self, state: ExchangeState) {
        if let Some(pending) = self.pending.as_mut() {
            pending.state = state;
        }
    }
}
