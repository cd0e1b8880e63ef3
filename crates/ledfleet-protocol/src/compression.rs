//! zlib compression and the compressed-frame envelope.
//!
//! Envelope layout (little-endian):
//!
//! ```text
//! u32 magic 0x44415645 | u32 compressed len | u32 uncompressed len | u32 0x12345678 | zlib payload
//! ```
//!
//! An envelope is only ever emitted when it is strictly smaller than the
//! frame it replaces.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{CodecError, CodecResult};
use crate::frame::{decode_header, ByteReader, Frame};

/// Tag occupying the first word of a compressed frame.
pub const COMPRESSED_FRAME_MAGIC: u32 = 0x4441_5645;

/// Fixed value of the envelope's reserved word.
pub const COMPRESSED_FRAME_RESERVED: u32 = 0x1234_5678;

/// Bytes of envelope preceding the payload.
pub const ENVELOPE_HEADER_LEN: usize = 16;

/// Compresses `data` into a zlib stream at best compression.
pub fn compress(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::best());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compress(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compress(e.to_string()))
}

/// Expands a zlib stream.
///
/// # Errors
///
/// `CodecError::CorruptStream` if `data` is not a complete, valid stream.
pub fn decompress(data: &[u8]) -> CodecResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::CorruptStream(e.to_string()))?;
    Ok(out)
}

/// Builds the envelope around `compressed`, or `None` if the result would
/// not be strictly smaller than `original`.
pub fn wrap_compressed(original: &[u8], compressed: &[u8]) -> Option<Frame> {
    if ENVELOPE_HEADER_LEN + compressed.len() >= original.len() {
        return None;
    }
    let compressed_len = u32::try_from(compressed.len()).ok()?;
    let original_len = u32::try_from(original.len()).ok()?;

    let mut out = Vec::with_capacity(ENVELOPE_HEADER_LEN + compressed.len());
    out.extend_from_slice(&COMPRESSED_FRAME_MAGIC.to_le_bytes());
    out.extend_from_slice(&compressed_len.to_le_bytes());
    out.extend_from_slice(&original_len.to_le_bytes());
    out.extend_from_slice(&COMPRESSED_FRAME_RESERVED.to_le_bytes());
    out.extend_from_slice(compressed);
    Some(Frame::from_bytes(out))
}

/// Returns the enveloped form of `raw` when that is smaller, else `raw`.
///
/// The result is never longer than the input.
pub fn compress_frame(raw: Frame) -> Frame {
    let wrapped = compress(raw.as_bytes())
        .ok()
        .and_then(|compressed| wrap_compressed(raw.as_bytes(), &compressed));
    wrapped.unwrap_or(raw)
}

struct Envelope<'a> {
    uncompressed_len: usize,
    payload: &'a [u8],
}

fn read_envelope(bytes: &[u8]) -> CodecResult<Envelope<'_>> {
    let mut reader = ByteReader::new(bytes);
    let magic = reader.u32()?;
    if magic != COMPRESSED_FRAME_MAGIC {
        return Err(CodecError::BadEnvelope(format!("magic {magic:#010x}")));
    }
    let compressed_len = reader.u32()? as usize;
    let uncompressed_len = reader.u32()? as usize;
    let reserved = reader.u32()?;
    if reserved != COMPRESSED_FRAME_RESERVED {
        return Err(CodecError::BadEnvelope(format!("reserved {reserved:#010x}")));
    }

    let end = ENVELOPE_HEADER_LEN.saturating_add(compressed_len);
    let payload = bytes
        .get(ENVELOPE_HEADER_LEN..end)
        .ok_or(CodecError::Truncated {
            needed: end,
            available: bytes.len(),
        })?;
    Ok(Envelope {
        uncompressed_len,
        payload,
    })
}

/// Opens an envelope and returns the original frame bytes.
///
/// # Errors
///
/// `BadEnvelope` for wrong tags or a length mismatch after expansion,
/// `Truncated` if the payload is short, `CorruptStream` if it does not
/// inflate.
pub fn unwrap_compressed(bytes: &[u8]) -> CodecResult<Vec<u8>> {
    let envelope = read_envelope(bytes)?;
    let inner = decompress(envelope.payload)?;
    if inner.len() != envelope.uncompressed_len {
        return Err(CodecError::BadEnvelope(format!(
            "expanded to {} bytes, header says {}",
            inner.len(),
            envelope.uncompressed_len
        )));
    }
    Ok(inner)
}

/// Splits a concatenated batch back into raw frames, opening envelopes.
///
/// This is the receiving side of the protocol, as a device would parse it.
pub fn split_batch(mut bytes: &[u8]) -> CodecResult<Vec<Vec<u8>>> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let is_envelope = bytes.get(0..4) == Some(&COMPRESSED_FRAME_MAGIC.to_le_bytes()[..]);
        let consumed = if is_envelope {
            let consumed = ENVELOPE_HEADER_LEN + read_envelope(bytes)?.payload.len();
            frames.push(unwrap_compressed(bytes)?);
            consumed
        } else {
            let len = decode_header(bytes)?.frame_len();
            let frame = bytes.get(..len).ok_or(CodecError::Truncated {
                needed: len,
                available: bytes.len(),
            })?;
            frames.push(frame.to_vec());
            len
        };
        bytes = bytes.get(consumed..).unwrap_or_default();
    }
    Ok(frames)
}
