//! Error types for the instrument link.
//!
//! Every fallible operation in this crate returns [`LinkResult`], built on the
//! single [`LinkError`] enum. Drivers, the exchange engine and the acquisition
//! loop all report through it, so callers can match on the failure kind instead
//! of parsing messages.
//!
//! ## Error kinds
//!
//! - **`Connect`**: the port or USB device could not be opened, is missing, or
//!   is already claimed by this process.
//! - **`Io`**: a read or write on an open link failed. The session flips to
//!   disconnected when this happens.
//! - **`ExchangeTimeout`**: a command was written but no complete reply frame
//!   arrived before its deadline. The link itself is still usable.
//! - **`FrameParse`**: a reply arrived but does not match the board's grammar.
//!   Kept distinct from timeouts: the board answered, the answer was wrong.
//! - **`Range`**: a command argument is outside the board's domain. Raised
//!   before anything is encoded or written.
//! - **`Concurrency`**: a second exchange or stream was requested while the
//!   link is leased to someone else.
//! - **`NotConnected`**: the session was torn down (explicitly or after an I/O
//!   failure) and must be reconnected first.
//!
//! Configuration problems have their own type, [`crate::config::ConfigError`],
//! which converts into `LinkError::Config`.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the link error type.
pub type LinkResult<T> = std::result::Result<T, LinkError>;

/// Failure kinds reported by the instrument link.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Port or device could not be opened.
    #[error("Failed to connect to '{port}': {reason}")]
    Connect {
        /// Port name or USB identifier.
        port: String,
        /// What went wrong.
        reason: String,
    },

    /// Read/write failure on an open link.
    #[error("I/O error on '{port}': {source}")]
    Io {
        /// Port name or USB identifier.
        port: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// No complete reply frame before the deadline.
    #[error("No reply to '{command}' within {waited:?}")]
    ExchangeTimeout {
        /// Rendered command that went unanswered.
        command: String,
        /// Deadline that elapsed.
        waited: Duration,
    },

    /// Reply frame did not match the expected grammar.
    #[error("Malformed {dialect} frame: {reason} (raw: {raw:?})")]
    FrameParse {
        /// Codec dialect that rejected the frame.
        dialect: &'static str,
        /// Why it was rejected.
        reason: String,
        /// Offending bytes, lossily rendered.
        raw: String,
    },

    /// Argument outside the board's accepted domain.
    #[error("Value out of range: {0}")]
    Range(String),

    /// The link is leased to another owner.
    #[error("Link '{port}' is busy (held by '{held_by}')")]
    Concurrency {
        /// Port name of the contended link.
        port: String,
        /// Current lease owner.
        held_by: String,
    },

    /// Session is disconnected.
    #[error("Board on '{0}' is not connected")]
    NotConnected(String),

    /// A pending exchange or stream was cancelled.
    #[error("Operation '{0}' was cancelled")]
    Cancelled(String),

    /// The board answered with an explicit rejection.
    #[error("Board rejected '{command}': {reply}")]
    BoardRejected {
        /// Rendered command.
        command: String,
        /// Reply or status that signalled the rejection.
        reply: String,
    },

    /// Operation is not allowed in the device's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration could not be loaded or failed validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker runtime could not be started or has shut down.
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Driver compiled out.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl LinkError {
    /// Build a [`LinkError::FrameParse`] from raw bytes.
    pub fn frame(dialect: &'static str, reason: impl Into<String>, raw: &[u8]) -> Self {
        LinkError::FrameParse {
            dialect,
            reason: reason.into(),
            raw: String::from_utf8_lossy(raw).into_owned(),
        }
    }

    /// Build a [`LinkError::Io`] for the given port.
    pub fn io(port: impl Into<String>, source: std::io::Error) -> Self {
        LinkError::Io {
            port: port.into(),
            source,
        }
    }

    /// True when the error means the underlying link is gone and the session
    /// must be treated as disconnected.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, LinkError::Connect { .. } | LinkError::Io { .. })
    }

    /// True for a reply deadline miss.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::ExchangeTimeout { .. })
    }
}
