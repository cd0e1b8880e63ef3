//! Pixel values and per-channel segment extraction.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

// ============================================================================
// Rgb
// ============================================================================

/// One LED colour, 8 bits per component.
///
/// Serialized as a `#rrggbb` hex string so site configuration stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    /// Creates a colour from its components.
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

impl FromStr for Rgb {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(DomainError::invalid("color", s, "#rrggbb"));
        }

        let component = |range: std::ops::Range<usize>| {
            hex.get(range)
                .and_then(|part| u8::from_str_radix(part, 16).ok())
                .ok_or_else(|| DomainError::invalid("color", s, "#rrggbb"))
        };

        Ok(Self::new(component(0..2)?, component(2..4)?, component(4..6)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Segment Extraction
// ============================================================================

/// Copies one channel's sub-range of a site buffer into wire-order RGB bytes.
///
/// Returns `length * 3` bytes. When `reversed` is set the segment is read
/// from its last pixel backwards, matching a strip fed from the far end.
/// When `swap_red_green` is set the first two bytes of every triple are
/// exchanged. The source buffer is never modified.
///
/// # Errors
///
/// `DomainError::SegmentOutOfRange` if `[offset, offset + length)` does not
/// fit inside `pixels`.
pub fn extract_segment(
    pixels: &[Rgb],
    offset: usize,
    length: usize,
    reversed: bool,
    swap_red_green: bool,
) -> DomainResult<Vec<u8>> {
    let out_of_range = || DomainError::SegmentOutOfRange {
        offset,
        length,
        width: pixels.len(),
    };

    let end = offset.checked_add(length).ok_or_else(out_of_range)?;
    let segment = pixels.get(offset..end).ok_or_else(out_of_range)?;

    let mut data = Vec::with_capacity(length * 3);
    let mut push = |px: &Rgb| {
        if swap_red_green {
            data.extend_from_slice(&[px.g, px.r, px.b]);
        } else {
            data.extend_from_slice(&[px.r, px.g, px.b]);
        }
    };

    if reversed {
        segment.iter().rev().for_each(&mut push);
    } else {
        segment.iter().for_each(&mut push);
    }

    Ok(data)
}
