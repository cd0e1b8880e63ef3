//! ledfleet Protocol - Binary wire codec for LED controller devices
//!
//! This crate provides the pure, stateless encoders and decoders for the
//! device protocol: pixel and clock frames, the compression envelope, batch
//! concatenation, and the fixed-size status response devices send back.
//!
//! All integers on the wire are little-endian.

pub mod compression;
pub mod error;
pub mod frame;
pub mod response;

pub use compression::{
    compress, compress_frame, decompress, split_batch, unwrap_compressed, wrap_compressed,
    COMPRESSED_FRAME_MAGIC, COMPRESSED_FRAME_RESERVED, ENVELOPE_HEADER_LEN,
};
pub use error::{CodecError, CodecResult};
pub use frame::{
    combine, decode_header, encode_clock_frame, encode_for, encode_legacy_pixel_frame,
    encode_pixel_frame, Command, Frame, FrameHeader,
};
pub use response::{decode_status_response, encode_status_response, STATUS_RESPONSE_LEN};
