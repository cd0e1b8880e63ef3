//! Device status and connection lifecycle types.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Telemetry record a device reports after receiving data.
///
/// The wire layout is fixed at 64 bytes; see `ledfleet-protocol` for the
/// codec. A zeroed record means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Struct size as reported by the device
    pub size: u32,
    pub flash_version: u32,
    /// Device clock, seconds
    pub current_clock: f64,
    pub oldest_packet: f64,
    pub newest_packet: f64,
    /// Brightness, 0-100
    pub brightness: f64,
    pub wifi_signal: f64,
    pub buffer_size: u32,
    pub buffer_pos: u32,
    pub fps_drawing: u32,
    pub watts: u32,
}

impl StatusResponse {
    /// Zeroes every field.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// True once the device has reported at least once since the last reset.
    pub fn is_known(&self) -> bool {
        self.size != 0
    }

    /// Seconds of content buffered on the device, if known.
    pub fn buffered_seconds(&self) -> Option<f64> {
        if !self.is_known() || self.newest_packet < self.current_clock {
            return None;
        }
        Some(self.newest_packet - self.current_clock)
    }
}

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle of a single device socket.
///
/// `Unresolved -> Resolving -> Resolved -> Connecting -> Connected`, with
/// `Connected <-> Disconnected` on link loss and `Dead` when hostname
/// resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    #[default]
    Unresolved = 0,
    Resolving = 1,
    Resolved = 2,
    Connecting = 3,
    Connected = 4,
    Disconnected = 5,
    Dead = 6,
}

impl ConnectionState {
    /// Numeric form for atomic storage.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`as_u8`](Self::as_u8). Unknown values map to `Dead`.
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Unresolved,
            1 => Self::Resolving,
            2 => Self::Resolved,
            3 => Self::Connecting,
            4 => Self::Connected,
            5 => Self::Disconnected,
            _ => Self::Dead,
        }
    }

    /// Returns true if a connect attempt may be made from this state.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Resolved | Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unresolved => "unresolved",
            Self::Resolving => "resolving",
            Self::Resolved => "resolved",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Dead => "dead",
        };
        f.write_str(s)
    }
}
