//! Process-wide telemetry sink.
//!
//! Keeps a bounded ring of timestamped status lines plus a table of named
//! counters for the status file and dashboards. Each line is mirrored to
//! `tracing` so it also lands in the daemon log.

use std::collections::{BTreeMap, VecDeque};

use chrono::Local;
use parking_lot::Mutex;
use tracing::info;

use ledfleet_core::{TelemetryLine, TelemetrySink};

/// Lines retained before the oldest are discarded.
pub const MAX_TELEMETRY_LINES: usize = 1000;

/// Shared telemetry store. Construct once and hand out as
/// `Arc<dyn TelemetrySink>`.
#[derive(Debug)]
pub struct Telemetry {
    lines: Mutex<VecDeque<TelemetryLine>>,
    counters: Mutex<BTreeMap<String, i64>>,
    capacity: usize,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::with_capacity(MAX_TELEMETRY_LINES)
    }

    /// Creates a sink retaining at most `capacity` lines.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_TELEMETRY_LINES))),
            counters: Mutex::new(BTreeMap::new()),
            capacity,
        }
    }

    /// The most recent `limit` lines, oldest first.
    pub fn recent_lines(&self, limit: usize) -> Vec<TelemetryLine> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn line_count(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn counter(&self, name: &str) -> Option<i64> {
        self.counters.lock().get(name).copied()
    }

    pub fn counters(&self) -> BTreeMap<String, i64> {
        self.counters.lock().clone()
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for Telemetry {
    fn line(&self, text: String) {
        info!(target: "ledfleetd::telemetry", "{text}");

        let mut lines = self.lines.lock();
        lines.push_back(TelemetryLine {
            at: Local::now(),
            text,
        });
        while lines.len() > self.capacity {
            lines.pop_front();
        }
    }

    fn set_counter(&self, name: &str, value: i64) {
        let mut counters = self.counters.lock();
        match counters.get_mut(name) {
            Some(slot) => *slot = value,
            None => {
                counters.insert(name.to_string(), value);
            }
        }
    }
}
