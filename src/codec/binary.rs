//! Fixed binary dialect.
//!
//! A record is a fixed number of bytes split into big-endian unsigned fields
//! of 1..=8 bytes. The legacy coincidence board streams 18-byte records of six
//! 3-byte counters.

use super::{Command, CommandArg, Dialect, Frame, FrameCodec};
use crate::error::{LinkError, LinkResult};
use bytes::BytesMut;

/// Largest value a field of `width` bytes can hold.
pub fn field_max(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Zero-extend big-endian bytes to `u64`.
pub fn unpack_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Pack `value` into `width` big-endian bytes.
///
/// # Errors
/// [`LinkError::Range`] if `value` does not fit.
pub fn pack_be(value: u64, width: usize) -> LinkResult<Vec<u8>> {
    if value > field_max(width) {
        return Err(LinkError::Range(format!(
            "{value} does not fit in {width} byte(s) (max {})",
            field_max(width)
        )));
    }
    let bytes = value.to_be_bytes();
    Ok(bytes[8 - width..].to_vec())
}

/// Fixed-size record codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedBinary {
    widths: Vec<usize>,
    record_len: usize,
}

impl FixedBinary {
    /// Record made of the given field widths, in wire order.
    ///
    /// # Errors
    /// [`LinkError::Range`] if there are no fields or a width is outside 1..=8.
    pub fn new(widths: &[usize]) -> LinkResult<Self> {
        if widths.is_empty() {
            return Err(LinkError::Range("binary record needs at least one field".into()));
        }
        if let Some(bad) = widths.iter().find(|w| !(1..=8).contains(*w)) {
            return Err(LinkError::Range(format!(
                "field width {bad} outside 1..=8 bytes"
            )));
        }
        Ok(Self {
            widths: widths.to_vec(),
            record_len: widths.iter().sum(),
        })
    }

    /// Six 3-byte counters, 18 bytes per record.
    pub fn legacy_coincidence() -> Self {
        Self {
            widths: vec![3; 6],
            record_len: 18,
        }
    }

    /// Bytes per record.
    pub fn record_len(&self) -> usize {
        self.record_len
    }

    /// Field widths in wire order.
    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Pack one record.
    ///
    /// # Errors
    /// [`LinkError::Range`] on a field count mismatch or a value that does not
    /// fit its width.
    pub fn encode_values(&self, values: &[u64]) -> LinkResult<Vec<u8>> {
        if values.len() != self.widths.len() {
            return Err(LinkError::Range(format!(
                "record has {} fields, got {} values",
                self.widths.len(),
                values.len()
            )));
        }
        let mut out = Vec::with_capacity(self.record_len);
        for (&value, &width) in values.iter().zip(&self.widths) {
            out.extend(pack_be(value, width)?);
        }
        Ok(out)
    }
}

impl FrameCodec for FixedBinary {
    fn dialect(&self) -> Dialect {
        Dialect::FixedBinary
    }

    fn encode(&self, command: &Command) -> LinkResult<Vec<u8>> {
        if !command.verb().is_empty() {
            return Err(LinkError::Range(format!(
                "binary records carry no verb, got '{}'",
                command.verb()
            )));
        }
        let values = command
            .args()
            .iter()
            .map(|arg| match arg {
                CommandArg::Unsigned(value) => Ok(*value),
                CommandArg::Text(text) => Err(LinkError::Range(format!(
                    "binary records carry only unsigned fields, got '{text}'"
                ))),
            })
            .collect::<LinkResult<Vec<u64>>>()?;
        self.encode_values(&values)
    }

    fn decode(&self, buf: &mut BytesMut) -> LinkResult<Option<Frame>> {
        if buf.len() < self.record_len {
            return Ok(None);
        }
        let raw = buf.split_to(self.record_len);
        let mut offset = 0;
        let values = self
            .widths
            .iter()
            .map(|&width| {
                let value = unpack_be(&raw[offset..offset + width]);
                offset += width;
                value
            })
            .collect();
        Ok(Some(Frame::binary(values, &raw)))
    }
}
