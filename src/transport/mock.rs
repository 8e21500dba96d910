//! Scripted in-memory transport for testing.
//!
//! This transport stands in for a board without any hardware. It provides:
//! - Request/response rules (exact or prefix match) with optional delay
//! - Chunked delivery to exercise partial-frame handling
//! - Unsolicited bytes (stale data, boot banners)
//! - Failure injection for writes and reads
//! - A write log for test verification
//!
//! Clones share state, so a test can keep one handle for inspection while the
//! other is owned by a link.
//!
//! # Example
//!
//! ```
//! use instrument_link::transport::MockTransport;
//!
//! let board = MockTransport::new("mock-piezo").respond("_V!", "_V3!");
//! assert!(board.writes().is_empty());
//! ```

use super::Transport;
use crate::error::{LinkError, LinkResult};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
enum Matcher {
    Exact(Vec<u8>),
    Prefix(Vec<u8>),
}

impl Matcher {
    fn matches(&self, written: &[u8]) -> bool {
        match self {
            Matcher::Exact(expected) => written == expected.as_slice(),
            Matcher::Prefix(prefix) => written.starts_with(prefix),
        }
    }
}

#[derive(Debug, Clone)]
struct Rule {
    matcher: Matcher,
    response: Vec<u8>,
    delay: Duration,
    chunk: Option<(usize, Duration)>,
    once: bool,
}

#[derive(Debug)]
struct Delivery {
    at: Instant,
    bytes: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    rx: VecDeque<u8>,
    scheduled: Vec<Delivery>,
    rules: Vec<Rule>,
    writes: Vec<Vec<u8>>,
    fail_next_write: bool,
    fail_next_read: bool,
    interleaved: bool,
    reply_outstanding: bool,
}

impl MockState {
    fn deliver_due(&mut self) {
        let now = Instant::now();
        let (due, later): (Vec<_>, Vec<_>) = self.scheduled.drain(..).partition(|d| d.at <= now);
        self.scheduled = later;
        let mut due = due;
        due.sort_by_key(|d| d.at);
        for delivery in due {
            self.rx.extend(delivery.bytes);
        }
    }
}

/// Scripted board that answers written commands from a rule table.
#[derive(Debug, Clone)]
pub struct MockTransport {
    port_name: String,
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create an open mock port with no rules.
    pub fn new(port_name: &str) -> Self {
        Self {
            port_name: port_name.to_string(),
            state: Arc::new(Mutex::new(MockState {
                open: true,
                ..MockState::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_rule(self, rule: Rule) -> Self {
        self.state().rules.push(rule);
        self
    }

    /// Answer `request` (exact bytes) with `response`, every time.
    pub fn respond(self, request: impl AsRef<[u8]>, response: impl AsRef<[u8]>) -> Self {
        self.add_rule(Rule {
            matcher: Matcher::Exact(request.as_ref().to_vec()),
            response: response.as_ref().to_vec(),
            delay: Duration::ZERO,
            chunk: None,
            once: false,
        })
    }

    /// Answer any write starting with `prefix` with `response`.
    pub fn respond_prefix(self, prefix: impl AsRef<[u8]>, response: impl AsRef<[u8]>) -> Self {
        self.add_rule(Rule {
            matcher: Matcher::Prefix(prefix.as_ref().to_vec()),
            response: response.as_ref().to_vec(),
            delay: Duration::ZERO,
            chunk: None,
            once: false,
        })
    }

    /// Answer `request` with `response` after `delay`.
    pub fn respond_after(
        self,
        request: impl AsRef<[u8]>,
        response: impl AsRef<[u8]>,
        delay: Duration,
    ) -> Self {
        self.add_rule(Rule {
            matcher: Matcher::Exact(request.as_ref().to_vec()),
            response: response.as_ref().to_vec(),
            delay,
            chunk: None,
            once: false,
        })
    }

    /// Answer `request` once; later writes fall through to other rules.
    pub fn respond_once(self, request: impl AsRef<[u8]>, response: impl AsRef<[u8]>) -> Self {
        self.add_rule(Rule {
            matcher: Matcher::Exact(request.as_ref().to_vec()),
            response: response.as_ref().to_vec(),
            delay: Duration::ZERO,
            chunk: None,
            once: true,
        })
    }

    /// Answer `request` in pieces of `chunk` bytes, one piece per `interval`.
    pub fn respond_chunked(
        self,
        request: impl AsRef<[u8]>,
        response: impl AsRef<[u8]>,
        chunk: usize,
        interval: Duration,
    ) -> Self {
        self.add_rule(Rule {
            matcher: Matcher::Exact(request.as_ref().to_vec()),
            response: response.as_ref().to_vec(),
            delay: Duration::ZERO,
            chunk: Some((chunk.max(1), interval)),
            once: false,
        })
    }

    /// Make bytes readable right away, as if the board sent them unprompted.
    pub fn push_rx(&self, bytes: impl AsRef<[u8]>) {
        self.state().rx.extend(bytes.as_ref().iter().copied());
    }

    /// Fail the next write with an I/O error.
    pub fn inject_write_failure(&self) {
        self.state().fail_next_write = true;
    }

    /// Fail the next read with an I/O error.
    pub fn inject_read_failure(&self) {
        self.state().fail_next_read = true;
    }

    /// Every write, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Writes rendered as lossy UTF-8.
    pub fn written_text(&self) -> Vec<String> {
        self.writes()
            .iter()
            .map(|w| String::from_utf8_lossy(w).into_owned())
            .collect()
    }

    /// Clear the write log.
    pub fn clear_writes(&self) {
        self.state().writes.clear();
    }

    /// True if a command was written while the reply to an earlier command
    /// had not been fully read yet.
    pub fn saw_interleaving(&self) -> bool {
        self.state().interleaved
    }

    /// Open the port again after a close, keeping rules and logs. Returns a
    /// handle for the new link.
    pub fn reopen(&self) -> Self {
        let mut state = self.state();
        state.open = true;
        state.rx.clear();
        state.scheduled.clear();
        state.reply_outstanding = false;
        drop(state);
        self.clone()
    }

    /// Whether the mock port is still open.
    pub fn open_state(&self) -> bool {
        self.state().open
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn write(&mut self, bytes: &[u8]) -> LinkResult<()> {
        let port = self.port_name.clone();
        let mut state = self.state();
        if !state.open {
            return Err(LinkError::NotConnected(port));
        }
        if std::mem::take(&mut state.fail_next_write) {
            return Err(LinkError::io(
                port,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, "injected write failure"),
            ));
        }

        state.deliver_due();
        if state.reply_outstanding && (!state.rx.is_empty() || !state.scheduled.is_empty()) {
            state.interleaved = true;
        }
        state.writes.push(bytes.to_vec());
        trace!(port = %port, bytes = ?String::from_utf8_lossy(bytes), "mock write");

        let Some(index) = state.rules.iter().position(|r| r.matcher.matches(bytes)) else {
            state.reply_outstanding = false;
            return Ok(());
        };
        let rule = if state.rules[index].once {
            state.rules.remove(index)
        } else {
            state.rules[index].clone()
        };

        let start = Instant::now() + rule.delay;
        match rule.chunk {
            None => state.scheduled.push(Delivery {
                at: start,
                bytes: rule.response,
            }),
            Some((size, interval)) => {
                for (i, piece) in rule.response.chunks(size).enumerate() {
                    state.scheduled.push(Delivery {
                        at: start + interval * i as u32,
                        bytes: piece.to_vec(),
                    });
                }
            }
        }
        state.reply_outstanding = true;
        state.deliver_due();
        Ok(())
    }

    async fn bytes_available(&mut self) -> LinkResult<usize> {
        let mut state = self.state();
        if !state.open {
            return Err(LinkError::NotConnected(self.port_name.clone()));
        }
        state.deliver_due();
        Ok(state.rx.len())
    }

    async fn read_available(&mut self, max: usize) -> LinkResult<Vec<u8>> {
        let port = self.port_name.clone();
        let mut state = self.state();
        if !state.open {
            return Err(LinkError::NotConnected(port));
        }
        if std::mem::take(&mut state.fail_next_read) {
            return Err(LinkError::io(
                port,
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "injected read failure"),
            ));
        }
        state.deliver_due();
        let n = state.rx.len().min(max);
        let out: Vec<u8> = state.rx.drain(..n).collect();
        if state.rx.is_empty() && state.scheduled.is_empty() {
            state.reply_outstanding = false;
        }
        Ok(out)
    }

    async fn close(&mut self) -> LinkResult<()> {
        let mut state = self.state();
        state.open = false;
        state.rx.clear();
        state.scheduled.clear();
        Ok(())
    }
}
