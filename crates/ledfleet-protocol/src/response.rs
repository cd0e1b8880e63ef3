//! Status response codec.
//!
//! Devices answer each receive with a fixed 64-byte little-endian record:
//!
//! ```text
//! u32 size | u32 flash_version | f64 current_clock | f64 oldest_packet | f64 newest_packet
//! f64 brightness | f64 wifi_signal | u32 buffer_size | u32 buffer_pos | u32 fps_drawing | u32 watts
//! ```

use ledfleet_core::StatusResponse;

use crate::frame::ByteReader;

/// Size of a status response on the wire.
pub const STATUS_RESPONSE_LEN: usize = 64;

/// Decodes a status response from the front of `bytes`.
///
/// Returns `None` unless at least [`STATUS_RESPONSE_LEN`] bytes are present
/// and the record's own `size` field is at least that large.
pub fn decode_status_response(bytes: &[u8]) -> Option<StatusResponse> {
    if bytes.len() < STATUS_RESPONSE_LEN {
        return None;
    }
    let mut r = ByteReader::new(bytes);
    let response = StatusResponse {
        size: r.u32().ok()?,
        flash_version: r.u32().ok()?,
        current_clock: r.f64().ok()?,
        oldest_packet: r.f64().ok()?,
        newest_packet: r.f64().ok()?,
        brightness: r.f64().ok()?,
        wifi_signal: r.f64().ok()?,
        buffer_size: r.u32().ok()?,
        buffer_pos: r.u32().ok()?,
        fps_drawing: r.u32().ok()?,
        watts: r.u32().ok()?,
    };
    (response.size as usize >= STATUS_RESPONSE_LEN).then_some(response)
}

/// Encodes a status response as a device would send it.
pub fn encode_status_response(status: &StatusResponse) -> [u8; STATUS_RESPONSE_LEN] {
    let mut out = [0u8; STATUS_RESPONSE_LEN];
    let fields: [&[u8]; 11] = [
        &status.size.to_le_bytes(),
        &status.flash_version.to_le_bytes(),
        &status.current_clock.to_le_bytes(),
        &status.oldest_packet.to_le_bytes(),
        &status.newest_packet.to_le_bytes(),
        &status.brightness.to_le_bytes(),
        &status.wifi_signal.to_le_bytes(),
        &status.buffer_size.to_le_bytes(),
        &status.buffer_pos.to_le_bytes(),
        &status.fps_drawing.to_le_bytes(),
        &status.watts.to_le_bytes(),
    ];
    let mut pos = 0;
    for field in fields {
        if let Some(dest) = out.get_mut(pos..pos + field.len()) {
            dest.copy_from_slice(field);
        }
        pos += field.len();
    }
    out
}
