//! Telemetry capability and the read-only fleet snapshot.
//!
//! Components report through a [`TelemetrySink`] handed to them at
//! construction. The sink is write-only from the engine's point of view;
//! nothing it records feeds back into scheduling decisions.

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::status::{ConnectionState, StatusResponse};

/// Write-only sink for human-readable status lines and named counters.
pub trait TelemetrySink: Send + Sync {
    /// Appends one status line.
    fn line(&self, text: String);

    /// Sets a named counter to `value`.
    fn set_counter(&self, name: &str, value: i64);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn line(&self, _text: String) {}

    fn set_counter(&self, _name: &str, _value: i64) {}
}

/// A recorded status line with its local timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryLine {
    pub at: DateTime<Local>,
    pub text: String,
}

// ============================================================================
// Snapshot Views
// ============================================================================

/// Point-in-time view of one device channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub friendly_name: String,
    pub host: String,
    pub state: ConnectionState,
    pub bytes_per_second: f64,
    pub response: StatusResponse,
    pub connects: u64,
    pub queue_depth: usize,
    /// Frames this channel has written to its device
    pub frames_sent: u64,
    /// Seconds added to outgoing frame timestamps
    pub time_offset: f64,
    pub site_fps: u32,
    pub active_producer: Option<String>,
}

/// Point-in-time view of one site scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub name: String,
    pub fps: u32,
    /// Minimum slack before a deadline over the current one-second window
    pub spare_ms: u64,
    pub active_producer: Option<String>,
    pub frames_rendered: u64,
    pub frames_dropped: u64,
}

/// Everything an external dashboard needs, serializable as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Local>,
    pub sites: Vec<SiteStatus>,
    pub channels: Vec<ChannelStatus>,
    /// Minimum spare time across all sites
    pub min_spare_ms: u64,
    /// Throughput summed once per device host
    pub total_bytes_per_second: f64,
    pub counters: BTreeMap<String, i64>,
    pub recent_lines: Vec<TelemetryLine>,
}

impl FleetSnapshot {
    /// Builds a snapshot, deriving the minimum spare time.
    ///
    /// `total_bytes_per_second` is counted once per device connection by the
    /// caller, since channels sharing a host all report that host's rate.
    /// With no sites, `min_spare_ms` is 0.
    pub fn new(
        sites: Vec<SiteStatus>,
        channels: Vec<ChannelStatus>,
        total_bytes_per_second: f64,
        counters: BTreeMap<String, i64>,
        recent_lines: Vec<TelemetryLine>,
    ) -> Self {
        let min_spare_ms = sites.iter().map(|s| s.spare_ms).min().unwrap_or(0);
        Self {
            taken_at: Local::now(),
            sites,
            channels,
            min_spare_ms,
            total_bytes_per_second,
            counters,
            recent_lines,
        }
    }

    /// Number of channels currently connected.
    pub fn connected_channels(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state == ConnectionState::Connected)
            .count()
    }
}
