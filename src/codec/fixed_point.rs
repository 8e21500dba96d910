//! Fixed-point position fields for the piezo board.
//!
//! The firmware reads positions from fixed columns: two characters of whole
//! micrometers, a `.`, three characters of nanometers. Both parts are right
//! aligned and padded with spaces, never zeros, so 5 µm 42 nm travels as
//! `" 5. 42"`.

use crate::error::{LinkError, LinkResult};
use std::fmt;

const DIALECT: &str = "delimited-ascii";

/// A piezo set-point or readback split into µm and nm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PiezoPosition {
    um: u8,
    nm: u16,
}

impl PiezoPosition {
    /// Largest whole-micrometer part the board accepts.
    pub const MAX_UM: u8 = 10;
    /// Largest nanometer part.
    pub const MAX_NM: u16 = 999;
    /// Width of the encoded field, `uu.nnn`.
    pub const FIELD_WIDTH: usize = 6;

    /// Build a position, rejecting values the wire format cannot carry.
    ///
    /// # Errors
    /// [`LinkError::Range`] if `um > 10` or `nm > 999`.
    pub fn new(um: u8, nm: u16) -> LinkResult<Self> {
        if um > Self::MAX_UM {
            return Err(LinkError::Range(format!(
                "piezo position {um} µm outside 0..={}",
                Self::MAX_UM
            )));
        }
        if nm > Self::MAX_NM {
            return Err(LinkError::Range(format!(
                "piezo position {nm} nm outside 0..={}",
                Self::MAX_NM
            )));
        }
        Ok(Self { um, nm })
    }

    /// Split a micrometer value into whole µm and truncated nm.
    ///
    /// # Errors
    /// [`LinkError::Range`] for negative, non-finite or out-of-range values.
    pub fn from_micrometers(value: f64) -> LinkResult<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(LinkError::Range(format!(
                "piezo position {value} µm is not a valid set-point"
            )));
        }
        let whole = value.trunc();
        if whole > f64::from(Self::MAX_UM) {
            return Err(LinkError::Range(format!(
                "piezo position {value} µm outside 0..={}",
                Self::MAX_UM
            )));
        }
        let nm = ((value - whole) * 1000.0).trunc();
        Self::new(whole as u8, nm as u16)
    }

    /// Whole micrometers.
    pub fn um(&self) -> u8 {
        self.um
    }

    /// Nanometers on top of [`um`](Self::um).
    pub fn nm(&self) -> u16 {
        self.nm
    }

    /// Position as fractional micrometers.
    pub fn as_micrometers(&self) -> f64 {
        f64::from(self.um) + f64::from(self.nm) / 1000.0
    }

    /// Render the `uu.nnn` field.
    pub fn encode_field(&self) -> String {
        format!("{:>2}.{:>3}", self.um, self.nm)
    }

    /// Parse a `uu.nnn` field. Spaces count as empty columns; a group of
    /// spaces only reads as 0, as the firmware's `atoi` does.
    ///
    /// # Errors
    /// [`LinkError::FrameParse`] if the field is not six columns with a `.`
    /// in the third, or contains anything but digits and spaces elsewhere.
    pub fn decode_field(field: &str) -> LinkResult<Self> {
        let bytes = field.as_bytes();
        if bytes.len() != Self::FIELD_WIDTH || bytes[2] != b'.' {
            return Err(LinkError::frame(
                DIALECT,
                "piezo position must be 'uu.nnn'",
                bytes,
            ));
        }
        let um = columns(&bytes[..2]).ok_or_else(|| {
            LinkError::frame(DIALECT, "bad micrometer columns", bytes)
        })?;
        let nm = columns(&bytes[3..]).ok_or_else(|| {
            LinkError::frame(DIALECT, "bad nanometer columns", bytes)
        })?;
        let um = u8::try_from(um)
            .map_err(|_| LinkError::frame(DIALECT, "micrometer value too large", bytes))?;
        let nm = u16::try_from(nm)
            .map_err(|_| LinkError::frame(DIALECT, "nanometer value too large", bytes))?;
        Self::new(um, nm).map_err(|e| LinkError::frame(DIALECT, e.to_string(), bytes))
    }
}

/// Read digit columns, treating spaces as blanks.
fn columns(cols: &[u8]) -> Option<u32> {
    cols.iter().try_fold(0u32, |acc, &c| match c {
        b' ' => Some(acc * 10),
        b'0'..=b'9' => Some(acc * 10 + u32::from(c - b'0')),
        _ => None,
    })
}

impl fmt::Display for PiezoPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03} µm", self.um, self.nm)
    }
}
