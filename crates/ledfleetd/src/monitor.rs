//! Periodic fleet monitoring.
//!
//! Samples an [`Engine`] snapshot on a fixed interval and:
//! - logs a one-line summary of fleet health
//! - warns when a site has no spare render time left
//! - optionally writes the snapshot as JSON for an external dashboard
//!
//! # Panic-Free Guarantees
//!
//! Status file errors are logged and the monitor keeps running.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledfleet_core::FleetSnapshot;

use crate::engine::Engine;

/// Default sampling interval.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Summary numbers derived from one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetMetrics {
    pub sites: usize,
    pub channels: usize,
    pub connected: usize,

    /// Frames waiting across all channel queues
    pub queued_frames: usize,

    pub min_spare_ms: u64,
    pub bytes_per_second: f64,

    /// True if any site finished a tick with no time to spare
    pub render_starved: bool,

    /// Smallest content buffer reported by any device, in seconds
    pub min_buffered_secs: Option<f64>,
}

impl FleetMetrics {
    pub fn from_snapshot(snapshot: &FleetSnapshot) -> Self {
        Self {
            sites: snapshot.sites.len(),
            channels: snapshot.channels.len(),
            connected: snapshot.connected_channels(),
            queued_frames: snapshot.channels.iter().map(|c| c.queue_depth).sum(),
            min_spare_ms: snapshot.min_spare_ms,
            bytes_per_second: snapshot.total_bytes_per_second,
            render_starved: !snapshot.sites.is_empty() && snapshot.min_spare_ms == 0,
            min_buffered_secs: snapshot
                .channels
                .iter()
                .filter_map(|c| c.response.buffered_seconds())
                .min_by(f64::total_cmp),
        }
    }
}

/// Spawns the monitoring task.
///
/// If `status_file` is set, each snapshot is also written there as JSON.
pub fn spawn_monitor_task(
    engine: Arc<Engine>,
    period: Duration,
    status_file: Option<PathBuf>,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval(period);

        info!(
            interval_secs = period.as_secs(),
            status_file = ?status_file,
            "Fleet monitor started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => {
                    info!("Fleet monitor shutting down");
                    break;
                }

                _ = tick.tick() => {
                    let snapshot = engine.snapshot();
                    log_metrics(&FleetMetrics::from_snapshot(&snapshot));
                    if let Some(path) = &status_file {
                        if let Err(e) = write_status_file(path, &snapshot) {
                            warn!(path = %path.display(), error = %e, "Failed to write status file");
                        }
                    }
                }
            }
        }

        debug!("Fleet monitor task completed");
    })
}

fn log_metrics(metrics: &FleetMetrics) {
    if metrics.render_starved {
        warn!(
            sites = metrics.sites,
            min_spare_ms = metrics.min_spare_ms,
            "NO SPARE TIME: a site is missing its frame deadlines"
        );
    } else {
        info!(
            connected = metrics.connected,
            channels = metrics.channels,
            queued = metrics.queued_frames,
            min_spare_ms = metrics.min_spare_ms,
            kbps = format!("{:.1}", metrics.bytes_per_second / 1024.0),
            min_buffered_secs = ?metrics.min_buffered_secs.map(|s| format!("{s:.2}")),
            "Fleet status"
        );
    }
}

/// Writes `snapshot` to `path` through a temp file and rename, so readers
/// never see a partial document.
pub fn write_status_file(path: &Path, snapshot: &FleetSnapshot) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)
}
