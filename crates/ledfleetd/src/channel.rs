//! Device channel: a bounded frame queue and its sender thread.
//!
//! Each channel delivers one segment of a site buffer to one device. The
//! site scheduler encodes frames into the channel's queue with
//! [`DeviceChannel::enqueue`]; a dedicated worker thread drains the queue
//! in batches over the shared [`DeviceConnection`].
//!
//! Backpressure policy: a queue that reaches `max_queue_depth` means the
//! link cannot keep up. The worker then drops every queued frame and
//! replaces the connection instead of draining slowly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledfleet_core::{
    ChannelDescriptor, ChannelStatus, ConnectionState, StatusResponse, TelemetrySink,
};
use ledfleet_protocol::{combine, compress_frame, encode_for, Frame};

use crate::config::EngineTuning;
use crate::connection::DeviceConnection;
use crate::registry::FleetRegistry;

/// Scheduler frame rate used when a site leaves `fps` unset.
pub const DEFAULT_SCHEDULER_FPS: u32 = 30;

/// Offset applied to firmware that predates 64-bit clocks.
const LEGACY_TIME_OFFSET_SECS: f64 = 1.0;

/// Decides whether the worker should flush now.
///
/// In order: more than a second's worth of frames (`queued > fps`) is
/// waiting; the queue is non-empty and `batch_timeout` has passed since the
/// last flush; or `batch_size` frames have accumulated.
pub fn should_send_batch(
    queued: usize,
    fps: u32,
    since_last_flush: Duration,
    batch_size: usize,
    batch_timeout: Duration,
) -> bool {
    if queued > fps as usize {
        return true;
    }
    if queued > 0 && since_last_flush > batch_timeout {
        return true;
    }
    queued >= batch_size
}

/// Seconds added to capture time so devices play frames from the middle of
/// their buffer instead of starving.
pub fn time_offset(fps: u32, legacy_clock: bool, tuning: &EngineTuning) -> f64 {
    if fps == 0 {
        return 0.0;
    }
    if legacy_clock {
        return LEGACY_TIME_OFFSET_SECS;
    }
    (f64::from(tuning.device_buffer_frames) * tuning.buffer_use_fraction) / f64::from(fps)
}

/// Outcome of a single worker iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// A batch went out in one write
    Flushed { frames: usize, bytes: usize },
    /// Connected but nothing due yet
    Waiting,
    /// Not connected (resolving, throttled, or failed)
    NotConnected,
    /// Queue hit its limit; frames dropped and connection replaced
    Jammed { dropped: usize },
    /// Write error or short write; connection dropped
    SendFailed,
}

/// One LED segment on one device.
pub struct DeviceChannel {
    descriptor: ChannelDescriptor,
    site_fps: u32,
    tuning: EngineTuning,
    queue: ArrayQueue<Frame>,
    registry: Arc<FleetRegistry>,
    telemetry: Arc<dyn TelemetrySink>,
    last_enqueue_attempt: Mutex<Option<Instant>>,
    last_flush: Mutex<Instant>,
    connects: AtomicU64,
    frames_sent: AtomicU64,
}

impl DeviceChannel {
    pub fn new(
        descriptor: ChannelDescriptor,
        site_fps: u32,
        tuning: EngineTuning,
        registry: Arc<FleetRegistry>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let capacity = tuning.max_queue_depth.max(1);
        Self {
            descriptor,
            site_fps,
            tuning,
            queue: ArrayQueue::new(capacity),
            registry,
            telemetry,
            last_enqueue_attempt: Mutex::new(None),
            last_flush: Mutex::new(Instant::now()),
            connects: AtomicU64::new(0),
            frames_sent: AtomicU64::new(0),
        }
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    pub fn host(&self) -> &str {
        &self.descriptor.host
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Connections this channel's worker has created.
    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::Relaxed)
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn time_offset(&self) -> f64 {
        time_offset(self.site_fps, self.descriptor.clock.is_legacy(), &self.tuning)
    }

    fn connection(&self) -> Option<Arc<DeviceConnection>> {
        self.registry.get(&self.descriptor.host)
    }

    /// True if a registered connection is open and the queue has room.
    pub fn ready_for_data(&self) -> bool {
        self.queue.len() < self.tuning.max_queue_depth
            && self.connection().is_some_and(|conn| conn.is_connected())
    }

    /// Zeroes the device's stored status response, if a connection exists.
    pub fn reset_response(&self) {
        if let Some(conn) = self.connection() {
            conn.reset_response();
        }
    }

    /// Encodes `pixels` (wire-order RGB bytes) into a frame stamped
    /// `capture_time + time_offset` and queues it.
    ///
    /// Returns false if the queue is full, or if no connection exists yet
    /// and the previous attempt was within the enqueue retry interval.
    pub fn enqueue(&self, pixels: &[u8], capture_time: DateTime<Utc>) -> bool {
        let host = &self.descriptor.host;

        if self.queue.len() >= self.tuning.max_queue_depth {
            self.telemetry
                .line(format!("Queue full so discarding frame for {host}"));
            return false;
        }

        {
            let now = Instant::now();
            let mut last = self.last_enqueue_attempt.lock();
            let too_early = last.is_some_and(|prev| now.duration_since(prev) < self.tuning.enqueue_retry());
            if too_early && !self.registry.contains(host) {
                self.telemetry.line(format!("Too early to retry for {host}"));
                return false;
            }
            *last = Some(now);
        }

        let offset_micros = (self.time_offset() * 1_000_000.0) as i64;
        let target = capture_time + chrono::Duration::microseconds(offset_micros);
        let seconds = u64::try_from(target.timestamp()).unwrap_or(0);
        let micros = u64::from(target.timestamp_subsec_micros());
        let led_count = u32::try_from(pixels.len() / 3).unwrap_or(u32::MAX);

        let raw = encode_for(
            self.descriptor.clock,
            self.descriptor.channel,
            led_count,
            seconds,
            micros,
            pixels,
        );
        let frame = if self.descriptor.compress {
            compress_frame(raw)
        } else {
            raw
        };

        self.queue.push(frame).is_ok()
    }

    /// Runs one worker iteration.
    pub fn run_once(&self) -> WorkerStep {
        let host = self.descriptor.host.as_str();
        let (conn, created) = self.registry.get_or_create(host, self.descriptor.port);
        if created {
            self.connects.fetch_add(1, Ordering::Relaxed);
        }

        if self.queue.len() >= self.tuning.max_queue_depth {
            let mut dropped = 0;
            while self.queue.pop().is_some() {
                dropped += 1;
            }
            conn.disconnect();
            self.registry.remove(&conn);
            warn!(host, dropped, "Queue jammed; resetting connection");
            self.telemetry
                .line(format!("Closing jammed socket: {host}"));
            return WorkerStep::Jammed { dropped };
        }

        if !conn.ensure_connected() {
            if conn.should_discard() {
                self.registry.remove(&conn);
            }
            return WorkerStep::NotConnected;
        }
        if !conn.is_connected() {
            return WorkerStep::NotConnected;
        }

        let since_last_flush = self.last_flush.lock().elapsed();
        if !should_send_batch(
            self.queue.len(),
            self.site_fps,
            since_last_flush,
            self.descriptor.batch_size,
            self.tuning.batch_timeout(),
        ) {
            return WorkerStep::Waiting;
        }
        *self.last_flush.lock() = Instant::now();

        // Only what is queued now; frames pushed meanwhile wait for next time
        let count = self.queue.len();
        let frames: Vec<Frame> = (0..count).map_while(|_| self.queue.pop()).collect();
        let batch = combine(&frames);
        if batch.is_empty() {
            return WorkerStep::Waiting;
        }

        match conn.send(&batch) {
            Ok(written) if written == batch.len() => {
                self.frames_sent
                    .fetch_add(frames.len() as u64, Ordering::Relaxed);
                debug!(host, frames = frames.len(), bytes = written, "Batch sent");
                WorkerStep::Flushed {
                    frames: frames.len(),
                    bytes: written,
                }
            }
            Ok(written) => {
                self.telemetry.line(format!(
                    "Could not write all bytes so closing socket for {host} ({written}/{})",
                    batch.len()
                ));
                conn.disconnect();
                self.registry.remove(&conn);
                WorkerStep::SendFailed
            }
            Err(e) => {
                self.telemetry
                    .line(format!("Exception writing to socket for {host}: {e}"));
                conn.disconnect();
                self.registry.remove(&conn);
                WorkerStep::SendFailed
            }
        }
    }

    /// Worker loop: one iteration every `worker_interval` until cancelled.
    pub fn run(&self, cancel: &CancellationToken) {
        info!(host = %self.descriptor.host, name = %self.descriptor.friendly_name, "Channel worker started");
        let interval = self.tuning.worker_interval();
        while !cancel.is_cancelled() {
            self.run_once();
            thread::sleep(interval);
        }
        debug!(host = %self.descriptor.host, "Channel worker stopped");
    }

    /// Starts the worker on a named OS thread.
    pub fn spawn_worker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> std::io::Result<JoinHandle<()>> {
        let channel = Arc::clone(self);
        thread::Builder::new()
            .name(format!("chan-{}", self.descriptor.friendly_name))
            .spawn(move || channel.run(&cancel))
    }

    /// Current view for telemetry.
    pub fn status(&self, active_producer: Option<String>) -> ChannelStatus {
        let conn = self.connection();
        ChannelStatus {
            friendly_name: self.descriptor.friendly_name.clone(),
            host: self.descriptor.host.clone(),
            state: conn
                .as_ref()
                .map_or(ConnectionState::Unresolved, |c| c.state()),
            bytes_per_second: conn.as_ref().map_or(0.0, |c| c.bytes_per_second()),
            response: conn
                .as_ref()
                .map_or_else(StatusResponse::default, |c| c.response()),
            connects: self.connects(),
            queue_depth: self.queue_depth(),
            frames_sent: self.frames_sent(),
            time_offset: self.time_offset(),
            site_fps: self.site_fps,
            active_producer,
        }
    }
}
