//! Frame codecs: wire bytes to [`Frame`]s and [`Command`]s to wire bytes.
//!
//! Two dialects are spoken by the boards:
//!
//! - **Delimited ASCII** ([`DelimitedAscii`]): text fields split by a
//!   separator and closed by a sentinel, e.g. `M_1_2_!` or `!D:1:2:3:4:5:6;`.
//! - **Fixed binary** ([`FixedBinary`]): fixed-size records of big-endian
//!   unsigned integers packed into 1..=8 bytes each.
//!
//! Decoding is incremental. [`FrameCodec::decode`] looks at the receive
//! buffer, and either splits off one complete frame or leaves the buffer
//! alone and returns `Ok(None)` so the caller keeps reading.

use crate::error::{LinkError, LinkResult};
use bytes::BytesMut;
use std::fmt;
use std::str::FromStr;

pub mod ascii;
pub mod binary;
pub mod fixed_point;

pub use ascii::{DelimitedAscii, VerbPlacement};
pub use binary::FixedBinary;
pub use fixed_point::PiezoPosition;

/// Wire dialect of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// Separator/sentinel text frames.
    DelimitedAscii,
    /// Fixed-length packed records.
    FixedBinary,
}

impl Dialect {
    /// Short name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            Dialect::DelimitedAscii => "delimited-ascii",
            Dialect::FixedBinary => "fixed-binary",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Raw text token, exactly as received (padding included).
    Token(String),
    /// Zero-extended unsigned integer from a binary record.
    Unsigned(u64),
}

/// One complete message received from a board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    dialect: Dialect,
    verb: Option<String>,
    fields: Vec<FieldValue>,
    raw: Vec<u8>,
}

impl Frame {
    /// Build an ASCII frame.
    pub fn ascii(verb: impl Into<String>, fields: Vec<String>, raw: &[u8]) -> Self {
        Self {
            dialect: Dialect::DelimitedAscii,
            verb: Some(verb.into()),
            fields: fields.into_iter().map(FieldValue::Token).collect(),
            raw: raw.to_vec(),
        }
    }

    /// Build a binary record frame.
    pub fn binary(values: Vec<u64>, raw: &[u8]) -> Self {
        Self {
            dialect: Dialect::FixedBinary,
            verb: None,
            fields: values.into_iter().map(FieldValue::Unsigned).collect(),
            raw: raw.to_vec(),
        }
    }

    /// Dialect this frame was decoded with.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Reply verb, if the dialect carries one.
    pub fn verb(&self) -> Option<&str> {
        self.verb.as_deref()
    }

    /// Decoded fields, verb excluded.
    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True if the frame has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Bytes the frame was decoded from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    fn error(&self, reason: impl Into<String>) -> LinkError {
        LinkError::frame(self.dialect.name(), reason, &self.raw)
    }

    /// Fail unless the frame has exactly `n` fields.
    pub fn expect_len(&self, n: usize) -> LinkResult<&Self> {
        if self.fields.len() != n {
            return Err(self.error(format!(
                "expected {n} fields, got {}",
                self.fields.len()
            )));
        }
        Ok(self)
    }

    /// Text of field `index`.
    pub fn token(&self, index: usize) -> LinkResult<&str> {
        match self.fields.get(index) {
            Some(FieldValue::Token(text)) => Ok(text),
            Some(FieldValue::Unsigned(_)) => Err(self.error(format!("field {index} is not text"))),
            None => Err(self.error(format!("missing field {index}"))),
        }
    }

    /// Parse field `index` (trimmed) as `T`.
    pub fn parse<T: FromStr>(&self, index: usize) -> LinkResult<T> {
        let text = self.token(index)?;
        text.trim()
            .parse::<T>()
            .map_err(|_| self.error(format!("field {index} ({text:?}) is not a valid number")))
    }

    /// Unsigned value of field `index`, from either dialect.
    pub fn unsigned(&self, index: usize) -> LinkResult<u64> {
        match self.fields.get(index) {
            Some(FieldValue::Unsigned(value)) => Ok(*value),
            Some(FieldValue::Token(_)) => self.parse::<u64>(index),
            None => Err(self.error(format!("missing field {index}"))),
        }
    }
}

/// One argument of a [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandArg {
    /// Pre-rendered text, written verbatim.
    Text(String),
    /// Unsigned integer; decimal in ASCII, packed in binary.
    Unsigned(u64),
}

impl fmt::Display for CommandArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandArg::Text(text) => f.write_str(text),
            CommandArg::Unsigned(value) => write!(f, "{value}"),
        }
    }
}

/// A request to a board: a verb plus ordered arguments.
///
/// The reply is expected to carry the same verb unless
/// [`expecting`](Command::expecting) says otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    verb: String,
    args: Vec<CommandArg>,
    reply: Option<String>,
}

impl Command {
    /// Command with no arguments.
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            verb: verb.into(),
            args: Vec::new(),
            reply: None,
        }
    }

    /// Append a text argument rendered with `Display`.
    pub fn arg(mut self, value: impl fmt::Display) -> Self {
        self.args.push(CommandArg::Text(value.to_string()));
        self
    }

    /// Append an unsigned argument.
    pub fn unsigned(mut self, value: u64) -> Self {
        self.args.push(CommandArg::Unsigned(value));
        self
    }

    /// Override the expected reply verb.
    pub fn expecting(mut self, verb: impl Into<String>) -> Self {
        self.reply = Some(verb.into());
        self
    }

    /// Command verb.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// Command arguments.
    pub fn args(&self) -> &[CommandArg] {
        &self.args
    }

    /// Verb the reply must carry.
    pub fn expected_reply(&self) -> &str {
        self.reply.as_deref().unwrap_or(&self.verb)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.verb)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Encoder/decoder for one wire dialect.
pub trait FrameCodec: Send + Sync + fmt::Debug {
    /// Dialect spoken by this codec.
    fn dialect(&self) -> Dialect;

    /// Encode a command. Deterministic: equal commands give equal bytes.
    ///
    /// # Errors
    /// [`LinkError::Range`] if an argument cannot be represented in this
    /// dialect. ASCII encoding never fails.
    fn encode(&self, command: &Command) -> LinkResult<Vec<u8>>;

    /// Split one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` holds only part of a frame; those bytes
    /// stay in the buffer. A complete but malformed frame is consumed and
    /// reported as [`LinkError::FrameParse`].
    fn decode(&self, buf: &mut BytesMut) -> LinkResult<Option<Frame>>;

    /// Reply verb the board uses to reject a command, if any.
    fn error_verb(&self) -> Option<&str> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_display_and_reply_verb() {
        let cmd = Command::new("M").arg(3).arg(7);
        assert_eq!(cmd.to_string(), "M 3 7");
        assert_eq!(cmd.expected_reply(), "M");

        let stop = Command::new("S").expecting("E");
        assert_eq!(stop.expected_reply(), "E");
    }

    #[test]
    fn frame_field_access() {
        let frame = Frame::ascii("A", vec!["1.5".into(), " 2".into()], b"A_1.5_ 2_!");
        assert_eq!(frame.verb(), Some("A"));
        assert_eq!(frame.token(1).unwrap(), " 2");
        assert_eq!(frame.parse::<f64>(0).unwrap(), 1.5);
        assert_eq!(frame.parse::<u32>(1).unwrap(), 2);
        assert!(frame.expect_len(2).is_ok());
        assert!(matches!(
            frame.expect_len(3),
            Err(LinkError::FrameParse { .. })
        ));
        assert!(frame.token(5).is_err());
    }

    #[test]
    fn binary_frame_values() {
        let frame = Frame::binary(vec![7, 0xFF_FFFF], &[0, 0, 7, 0xFF, 0xFF, 0xFF]);
        assert_eq!(frame.verb(), None);
        assert_eq!(frame.unsigned(1).unwrap(), 0xFF_FFFF);
        assert!(frame.token(0).is_err());
    }
}
