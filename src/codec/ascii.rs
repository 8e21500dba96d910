//! Delimited ASCII dialect.
//!
//! One codec type covers every text board by configuration:
//!
//! | board        | request            | reply                  |
//! |--------------|--------------------|------------------------|
//! | laser PID    | `M_12_30_!\r\n`    | `M_12_30_0.41_0.38_!`  |
//! | piezo        | `_M 5. 42!`        | `_M1!`                 |
//! | coincidence  | `!T:400?`          | `!T:400;`              |
//!
//! The verb is either a fixed-length prefix right after the start character
//! ([`VerbPlacement::Prefix`]) or the first separated field
//! ([`VerbPlacement::LeadingField`]).

use super::{Command, Dialect, Frame, FrameCodec};
use crate::error::{LinkError, LinkResult};
use bytes::{Buf, BytesMut};
use tracing::trace;

const DIALECT: &str = "delimited-ascii";

/// Where the verb sits in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerbPlacement {
    /// The first `n` characters after the start character.
    Prefix(usize),
    /// The first separated field.
    LeadingField,
}

/// Configurable separator/sentinel text codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedAscii {
    start: Option<u8>,
    separator: Option<u8>,
    request_end: u8,
    reply_end: u8,
    verb: VerbPlacement,
    trailing_separator: bool,
    line_terminator: Vec<u8>,
    error_verb: Option<String>,
    max_frame_len: usize,
}

impl DelimitedAscii {
    /// Codec whose requests and replies both end with `end`. Verb is the
    /// first field; no start character, no separator.
    pub fn new(end: u8) -> Self {
        Self {
            start: None,
            separator: None,
            request_end: end,
            reply_end: end,
            verb: VerbPlacement::LeadingField,
            trailing_separator: false,
            line_terminator: Vec::new(),
            error_verb: None,
            max_frame_len: 256,
        }
    }

    /// Frames open with `start`; anything before it is discarded as noise.
    pub fn with_start(mut self, start: u8) -> Self {
        self.start = Some(start);
        self
    }

    /// Fields are split by `separator`.
    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = Some(separator);
        self
    }

    /// Requests end with `end` instead of the reply sentinel.
    pub fn with_request_end(mut self, end: u8) -> Self {
        self.request_end = end;
        self
    }

    /// Verb is the first `len` characters after the start character.
    pub fn with_verb_prefix(mut self, len: usize) -> Self {
        self.verb = VerbPlacement::Prefix(len);
        self
    }

    /// Requests carry a separator right before the sentinel (`A_!`), and a
    /// trailing empty field is dropped from replies.
    pub fn with_trailing_separator(mut self, trailing: bool) -> Self {
        self.trailing_separator = trailing;
        self
    }

    /// Bytes appended after the request sentinel.
    pub fn with_line_terminator(mut self, terminator: &[u8]) -> Self {
        self.line_terminator = terminator.to_vec();
        self
    }

    /// Reply verb meaning "command rejected".
    pub fn with_error_verb(mut self, verb: &str) -> Self {
        self.error_verb = Some(verb.to_string());
        self
    }

    /// Give up on a frame that grows past `len` bytes without a sentinel.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len.max(2);
        self
    }

    /// Verb placement.
    pub fn verb_placement(&self) -> VerbPlacement {
        self.verb
    }

    fn strip_noise(&self, buf: &mut BytesMut) {
        let skip = match self.start {
            Some(start) => buf.iter().position(|&b| b == start).unwrap_or(buf.len()),
            None => buf
                .iter()
                .take_while(|&&b| matches!(b, b'\r' | b'\n' | 0))
                .count(),
        };
        if skip > 0 {
            trace!(discarded = skip, "skipped bytes outside a frame");
            buf.advance(skip);
        }
    }

    fn parse(&self, raw: &[u8]) -> LinkResult<Frame> {
        if !raw.is_ascii() {
            return Err(LinkError::frame(DIALECT, "non-ASCII bytes in frame", raw));
        }
        let text = std::str::from_utf8(raw)
            .map_err(|_| LinkError::frame(DIALECT, "invalid UTF-8", raw))?;
        let open = usize::from(self.start.is_some());
        let body = &text[open..text.len() - 1];

        match self.verb {
            VerbPlacement::Prefix(n) => {
                if body.len() < n || n == 0 {
                    return Err(LinkError::frame(DIALECT, "frame too short for verb", raw));
                }
                let (verb, rest) = body.split_at(n);
                let fields = match self.separator {
                    _ if rest.is_empty() => Vec::new(),
                    Some(sep) => {
                        let sep = sep as char;
                        let Some(rest) = rest.strip_prefix(sep) else {
                            return Err(LinkError::frame(
                                DIALECT,
                                format!("expected '{sep}' after verb"),
                                raw,
                            ));
                        };
                        rest.split(sep).map(str::to_string).collect()
                    }
                    None => vec![rest.to_string()],
                };
                Ok(Frame::ascii(verb, fields, raw))
            }
            VerbPlacement::LeadingField => {
                let mut tokens: Vec<String> = match self.separator {
                    Some(sep) => body.split(sep as char).map(str::to_string).collect(),
                    None => vec![body.to_string()],
                };
                if self.trailing_separator
                    && tokens.len() > 1
                    && tokens.last().map(String::is_empty).unwrap_or(false)
                {
                    tokens.pop();
                }
                let verb = tokens.remove(0);
                if verb.is_empty() {
                    return Err(LinkError::frame(DIALECT, "empty verb", raw));
                }
                Ok(Frame::ascii(verb, tokens, raw))
            }
        }
    }
}

impl FrameCodec for DelimitedAscii {
    fn dialect(&self) -> Dialect {
        Dialect::DelimitedAscii
    }

    fn encode(&self, command: &Command) -> LinkResult<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        if let (Some(start), VerbPlacement::Prefix(_)) = (self.start, self.verb) {
            out.push(start);
        }
        out.extend_from_slice(command.verb().as_bytes());
        for arg in command.args() {
            if let Some(sep) = self.separator {
                out.push(sep);
            }
            out.extend_from_slice(arg.to_string().as_bytes());
        }
        if self.trailing_separator {
            if let Some(sep) = self.separator {
                out.push(sep);
            }
        }
        out.push(self.request_end);
        out.extend_from_slice(&self.line_terminator);
        Ok(out)
    }

    fn decode(&self, buf: &mut BytesMut) -> LinkResult<Option<Frame>> {
        self.strip_noise(buf);
        if buf.is_empty() {
            return Ok(None);
        }

        let from = usize::from(self.start.is_some());
        let end = buf[from..]
            .iter()
            .position(|&b| b == self.reply_end)
            .map(|p| p + from);

        let Some(end) = end else {
            if buf.len() > self.max_frame_len {
                let junk = buf.split();
                return Err(LinkError::frame(
                    DIALECT,
                    format!("no terminator within {} bytes", self.max_frame_len),
                    &junk,
                ));
            }
            return Ok(None);
        };

        let raw = buf.split_to(end + 1);
        self.parse(&raw).map(Some)
    }

    fn error_verb(&self) -> Option<&str> {
        self.error_verb.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn laser_pid() -> DelimitedAscii {
        DelimitedAscii::new(b'!')
            .with_separator(b'_')
            .with_trailing_separator(true)
            .with_line_terminator(b"\r\n")
    }

    fn coincidence() -> DelimitedAscii {
        DelimitedAscii::new(b';')
            .with_start(b'!')
            .with_separator(b':')
            .with_request_end(b'?')
            .with_verb_prefix(1)
            .with_error_verb("E")
    }

    fn piezo() -> DelimitedAscii {
        DelimitedAscii::new(b'!').with_start(b'_').with_verb_prefix(1)
    }

    #[test]
    fn encodes_leading_field_commands() {
        let codec = laser_pid();
        assert_eq!(codec.encode(&Command::new("A")).unwrap(), b"A_!\r\n");
        assert_eq!(
            codec.encode(&Command::new("M").arg(12).arg(30)).unwrap(),
            b"M_12_30_!\r\n"
        );
    }

    #[test]
    fn encodes_prefix_commands() {
        let codec = coincidence();
        assert_eq!(codec.encode(&Command::new("D")).unwrap(), b"!D?");
        assert_eq!(
            codec.encode(&Command::new("T").unsigned(400)).unwrap(),
            b"!T:400?"
        );

        assert_eq!(
            piezo().encode(&Command::new("M").arg(" 5. 42")).unwrap(),
            b"_M 5. 42!"
        );
    }

    #[test]
    fn decodes_leading_field_reply() {
        let codec = laser_pid();
        let mut buf = BytesMut::from(&b"M_12_30_0.41_0.38_!\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), Some("M"));
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.parse::<f64>(3).unwrap(), 0.38);
        assert_eq!(&buf[..], b"\r\n");

        // Line noise left over from the previous frame is skipped.
        let mut buf = BytesMut::from(&b"\r\nS_OK!\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), Some("S"));
        assert_eq!(frame.token(0).unwrap(), "OK");
    }

    #[test]
    fn decodes_prefix_reply_and_discards_banner() {
        let codec = coincidence();
        let mut buf = BytesMut::from(&b"HOM Test / LEnsE\r\n!D:1:2:3:4:5:6;"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), Some("D"));
        assert_eq!(frame.len(), 6);
        assert_eq!(frame.unsigned(5).unwrap(), 6);
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&b"!E;"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), Some("E"));
        assert!(frame.is_empty());
    }

    #[test]
    fn keeps_padding_in_unseparated_payload() {
        let mut buf = BytesMut::from(&b"_G 5. 42!"[..]);
        let frame = piezo().decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.verb(), Some("G"));
        assert_eq!(frame.token(0).unwrap(), " 5. 42");
    }

    #[test]
    fn partial_frame_stays_buffered() {
        let codec = coincidence();
        let mut buf = BytesMut::from(&b"!D:1:2:3"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"!D:1:2:3");

        buf.extend_from_slice(b":4:5:6;");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 6);
    }

    #[test]
    fn malformed_frame_is_consumed_and_reported() {
        let codec = coincidence();
        let mut buf = BytesMut::from(&b"!T400;!V:1.1a;"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, LinkError::FrameParse { .. }));

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.token(0).unwrap(), "1.1a");
    }

    #[test]
    fn runaway_frame_is_rejected() {
        let codec = laser_pid().with_max_frame_len(8);
        let mut buf = BytesMut::from(&b"A_1.2345678_9.87654321"[..]);
        assert!(codec.decode(&mut buf).is_err());
        assert!(buf.is_empty());
    }
}
