//! Pixel and clock frame encoding.
//!
//! Frame layouts (little-endian):
//!
//! ```text
//! command 3 (pixels, 64-bit clock):  u16 cmd | u16 channel | u32 leds | u64 secs | u64 usecs | rgb...
//! command 0 (pixels, 32-bit clock):  u16 cmd | u16 channel | u32 leds | u32 secs | u32 usecs | rgb...
//! command 2 (clock sync):            u16 cmd | u16 channel | u64 secs | u64 usecs
//! ```

use ledfleet_core::ClockFormat;

use crate::error::{CodecError, CodecResult};

/// Header length of a command 3 frame.
pub const PIXEL_HEADER_LEN: usize = 24;

/// Header length of a command 0 frame.
pub const LEGACY_PIXEL_HEADER_LEN: usize = 16;

/// Total length of a command 2 frame.
pub const CLOCK_FRAME_LEN: usize = 20;

/// Frame command word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Command {
    /// Pixel data with 32-bit timestamps
    LegacyPixels = 0,
    /// Clock synchronisation
    Clock = 2,
    /// Pixel data with 64-bit timestamps
    Pixels = 3,
}

impl Command {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Command {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::LegacyPixels),
            2 => Ok(Self::Clock),
            3 => Ok(Self::Pixels),
            other => Err(CodecError::UnknownCommand(other)),
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

/// One encoded wire message, ready to send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame(Vec<u8>);

impl Frame {
    /// Wraps bytes that are already in wire form.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Concatenates a batch of frames into one send buffer, preserving order.
pub fn combine(frames: &[Frame]) -> Vec<u8> {
    let total = frames.iter().map(Frame::len).sum();
    let mut out = Vec::with_capacity(total);
    for frame in frames {
        out.extend_from_slice(frame.as_bytes());
    }
    out
}

// ============================================================================
// Encoding
// ============================================================================

/// Encodes a command 3 pixel frame.
///
/// `rgb` is expected to hold `led_count * 3` bytes; it is copied verbatim.
pub fn encode_pixel_frame(
    channel: u16,
    led_count: u32,
    seconds: u64,
    micros: u64,
    rgb: &[u8],
) -> Frame {
    let mut out = Vec::with_capacity(PIXEL_HEADER_LEN + rgb.len());
    out.extend_from_slice(&Command::Pixels.as_u16().to_le_bytes());
    out.extend_from_slice(&channel.to_le_bytes());
    out.extend_from_slice(&led_count.to_le_bytes());
    out.extend_from_slice(&seconds.to_le_bytes());
    out.extend_from_slice(&micros.to_le_bytes());
    out.extend_from_slice(rgb);
    Frame(out)
}

/// Encodes a command 0 pixel frame for firmware without 64-bit clocks.
pub fn encode_legacy_pixel_frame(
    channel: u16,
    led_count: u32,
    seconds: u32,
    micros: u32,
    rgb: &[u8],
) -> Frame {
    let mut out = Vec::with_capacity(LEGACY_PIXEL_HEADER_LEN + rgb.len());
    out.extend_from_slice(&Command::LegacyPixels.as_u16().to_le_bytes());
    out.extend_from_slice(&channel.to_le_bytes());
    out.extend_from_slice(&led_count.to_le_bytes());
    out.extend_from_slice(&seconds.to_le_bytes());
    out.extend_from_slice(&micros.to_le_bytes());
    out.extend_from_slice(rgb);
    Frame(out)
}

/// Encodes a pixel frame in the layout `clock` firmware expects.
///
/// Legacy timestamps are truncated to their low 32 bits, which is what
/// that firmware reads.
pub fn encode_for(
    clock: ClockFormat,
    channel: u16,
    led_count: u32,
    seconds: u64,
    micros: u64,
    rgb: &[u8],
) -> Frame {
    match clock {
        ClockFormat::Wide64 => encode_pixel_frame(channel, led_count, seconds, micros, rgb),
        ClockFormat::Legacy32 => {
            encode_legacy_pixel_frame(channel, led_count, seconds as u32, micros as u32, rgb)
        }
    }
}

/// Encodes a command 2 clock-sync frame.
pub fn encode_clock_frame(seconds: u64, micros: u64) -> Frame {
    let mut out = Vec::with_capacity(CLOCK_FRAME_LEN);
    out.extend_from_slice(&Command::Clock.as_u16().to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&seconds.to_le_bytes());
    out.extend_from_slice(&micros.to_le_bytes());
    Frame(out)
}

// ============================================================================
// Decoding
// ============================================================================

/// Fields recovered from the start of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub command: Command,
    pub channel: u16,
    /// Zero for clock frames
    pub led_count: u32,
    pub seconds: u64,
    pub micros: u64,
}

impl FrameHeader {
    /// Bytes occupied by the header itself.
    pub fn header_len(&self) -> usize {
        match self.command {
            Command::Pixels => PIXEL_HEADER_LEN,
            Command::LegacyPixels => LEGACY_PIXEL_HEADER_LEN,
            Command::Clock => CLOCK_FRAME_LEN,
        }
    }

    /// Total frame length including pixel payload.
    pub fn frame_len(&self) -> usize {
        self.header_len() + self.led_count as usize * 3
    }
}

/// Little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let truncated = CodecError::Truncated {
            needed: self.pos + N,
            available: self.bytes.len(),
        };
        let slice = self
            .bytes
            .get(self.pos..self.pos + N)
            .ok_or(truncated.clone())?;
        let array: [u8; N] = slice.try_into().map_err(|_| truncated)?;
        self.pos += N;
        Ok(array)
    }

    pub(crate) fn u16(&mut self) -> CodecResult<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    pub(crate) fn u32(&mut self) -> CodecResult<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }

    pub(crate) fn u64(&mut self) -> CodecResult<u64> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    pub(crate) fn f64(&mut self) -> CodecResult<f64> {
        self.take::<8>().map(f64::from_le_bytes)
    }
}

/// Decodes the header at the start of `bytes`.
///
/// # Errors
///
/// `CodecError::Truncated` if `bytes` is shorter than the header, or
/// `CodecError::UnknownCommand` for an unrecognised command word.
pub fn decode_header(bytes: &[u8]) -> CodecResult<FrameHeader> {
    let mut reader = ByteReader::new(bytes);
    let command = Command::try_from(reader.u16()?)?;
    let channel = reader.u16()?;

    match command {
        Command::Pixels => Ok(FrameHeader {
            command,
            channel,
            led_count: reader.u32()?,
            seconds: reader.u64()?,
            micros: reader.u64()?,
        }),
        Command::LegacyPixels => Ok(FrameHeader {
            command,
            channel,
            led_count: reader.u32()?,
            seconds: u64::from(reader.u32()?),
            micros: u64::from(reader.u32()?),
        }),
        Command::Clock => Ok(FrameHeader {
            command,
            channel,
            led_count: 0,
            seconds: reader.u64()?,
            micros: reader.u64()?,
        }),
    }
}
