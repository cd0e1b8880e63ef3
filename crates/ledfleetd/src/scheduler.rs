//! Site scheduler: the fixed-rate render loop for one site.
//!
//! Every tick the scheduler picks the active producer, renders into the
//! site buffer under its write lock, and hands each ready channel its
//! segment. Missed deadlines are logged and skipped, never caught up.
//!
//! ```text
//! tick ─▶ select producer ─▶ render (write lock) ─▶ fan out to channels ─▶ sleep
//!              │                    │                       │
//!        schedule window       panic/Err isolated     not ready: reset
//!        + rotation index      buffer unchanged       cached response
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ledfleet_core::{
    extract_segment, FrameProducer, Rgb, ScheduleWindow, SiteDescriptor, SiteStatus,
    TelemetrySink,
};

use crate::channel::{DeviceChannel, DEFAULT_SCHEDULER_FPS};

/// Spare time reported at the start of each one-second window.
pub const SPARE_TIME_CEILING_MS: u64 = 1000;

/// Pause after a missed deadline before starting the next tick.
const DROPPED_FRAME_YIELD: Duration = Duration::from_millis(1);

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SchedulerState {
    Idle = 0,
    Running = 1,
    Stopped = 2,
}

impl SchedulerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Index of the producer to run `elapsed` after site start, among `eligible`
/// candidates, rotating every `rotation`.
pub fn rotation_index(elapsed: Duration, rotation: Duration, eligible: usize) -> usize {
    if eligible == 0 {
        return 0;
    }
    let period = rotation.as_secs().max(1);
    ((elapsed.as_secs() / period) % eligible as u64) as usize
}

/// A producer and the window in which it may run.
pub struct ScheduledProducer {
    pub window: ScheduleWindow,
    producer: Mutex<Box<dyn FrameProducer>>,
    name: String,
}

impl ScheduledProducer {
    pub fn new(window: ScheduleWindow, producer: Box<dyn FrameProducer>) -> Self {
        let name = producer.name().to_string();
        Self {
            window,
            producer: Mutex::new(producer),
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Producer that rendered, if any was eligible and succeeded
    pub rendered: Option<String>,
    pub producer_failed: bool,
    /// Channels that accepted a frame
    pub enqueued: usize,
    /// Channels skipped because they were not ready
    pub skipped: usize,
}

/// Minimum slack over a rolling one-second window.
#[derive(Debug)]
struct SpareTime {
    window_start: Instant,
    min_ms: u64,
}

impl SpareTime {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            min_ms: SPARE_TIME_CEILING_MS,
        }
    }

    /// Folds one tick's slack into the current window. A window older than
    /// one second is restarted first, so it opens with this tick's value.
    fn record(&mut self, spare: Duration) {
        if self.window_start.elapsed() > Duration::from_secs(1) {
            self.window_start = Instant::now();
            self.min_ms = SPARE_TIME_CEILING_MS;
        }
        let ms = u64::try_from(spare.as_millis()).unwrap_or(u64::MAX);
        self.min_ms = self.min_ms.min(ms);
    }
}

/// Render loop and shared pixel buffer for one site.
pub struct SiteScheduler {
    name: String,
    fps: u32,
    pixels: Arc<RwLock<Vec<Rgb>>>,
    scratch: Mutex<Vec<Rgb>>,
    schedule: Vec<ScheduledProducer>,
    channels: Vec<Arc<DeviceChannel>>,
    rotation: Duration,
    started: Instant,
    state: AtomicU8,
    active_producer: RwLock<Option<String>>,
    spare: Mutex<SpareTime>,
    frames_rendered: AtomicU64,
    frames_dropped: AtomicU64,
    producer_faults: AtomicU64,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SiteScheduler {
    pub fn new(
        site: &SiteDescriptor,
        schedule: Vec<ScheduledProducer>,
        channels: Vec<Arc<DeviceChannel>>,
        rotation: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            name: site.name.clone(),
            fps: site.fps,
            pixels: Arc::new(RwLock::new(vec![Rgb::BLACK; site.width])),
            scratch: Mutex::new(Vec::with_capacity(site.width)),
            schedule,
            channels,
            rotation,
            started: Instant::now(),
            state: AtomicU8::new(SchedulerState::Idle as u8),
            active_producer: RwLock::new(None),
            spare: Mutex::new(SpareTime::new()),
            frames_rendered: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            producer_faults: AtomicU64::new(0),
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured frame rate (0 when unset).
    pub fn fps(&self) -> u32 {
        self.fps
    }

    /// Duration of one tick; an unset rate runs at 30 fps.
    pub fn frame_interval(&self) -> Duration {
        let fps = if self.fps > 0 {
            self.fps
        } else {
            DEFAULT_SCHEDULER_FPS
        };
        Duration::from_secs_f64(1.0 / f64::from(fps))
    }

    /// Shared pixel buffer. Readers should take the read lock.
    pub fn pixels(&self) -> Arc<RwLock<Vec<Rgb>>> {
        Arc::clone(&self.pixels)
    }

    pub fn channels(&self) -> &[Arc<DeviceChannel>] {
        &self.channels
    }

    pub fn state(&self) -> SchedulerState {
        SchedulerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn active_producer(&self) -> Option<String> {
        self.active_producer.read().clone()
    }

    pub fn spare_ms(&self) -> u64 {
        self.spare.lock().min_ms
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }

    pub fn producer_faults(&self) -> u64 {
        self.producer_faults.load(Ordering::Relaxed)
    }

    /// Picks the schedule entry to run at `now`, `elapsed` after site start.
    pub fn select_producer(&self, now: &DateTime<Local>, elapsed: Duration) -> Option<usize> {
        let eligible: Vec<usize> = self
            .schedule
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.window.contains(now))
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let pick = rotation_index(elapsed, self.rotation, eligible.len());
        eligible.get(pick).copied()
    }

    /// Renders one frame and fans it out. `capture` is the frame's nominal
    /// display time before the channel's own offset.
    pub fn tick(&self, now: DateTime<Local>, capture: DateTime<Utc>) -> TickReport {
        let mut report = TickReport {
            rendered: None,
            producer_failed: false,
            enqueued: 0,
            skipped: 0,
        };

        let selected = self
            .select_producer(&now, self.started.elapsed())
            .and_then(|i| self.schedule.get(i));
        match selected {
            Some(entry) => {
                if self.render(entry, now) {
                    report.rendered = Some(entry.name().to_string());
                    self.frames_rendered.fetch_add(1, Ordering::Relaxed);
                } else {
                    report.producer_failed = true;
                }
                *self.active_producer.write() = Some(entry.name().to_string());
            }
            None => *self.active_producer.write() = None,
        }

        let pixels = self.pixels.read();
        for channel in &self.channels {
            if !channel.ready_for_data() {
                channel.reset_response();
                report.skipped += 1;
                continue;
            }
            let d = channel.descriptor();
            match extract_segment(&pixels, d.offset, d.length, d.reversed, d.swap_red_green) {
                Ok(segment) => {
                    if channel.enqueue(&segment, capture) {
                        report.enqueued += 1;
                    }
                }
                Err(e) => {
                    error!(site = %self.name, host = %d.host, error = %e, "Segment extraction failed");
                }
            }
        }

        report
    }

    /// Runs `entry` against the buffer. On `Err` or panic the buffer is
    /// restored to its pre-render contents.
    fn render(&self, entry: &ScheduledProducer, now: DateTime<Local>) -> bool {
        let mut pixels = self.pixels.write();
        let mut backup = self.scratch.lock();
        backup.clone_from(&pixels);

        let mut producer = entry.producer.lock();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| producer.render(&mut pixels, now)));

        let failure = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => e.to_string(),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("producer '{}' panicked: {message}", entry.name())
            }
        };

        pixels.clone_from(&backup);
        let faults = self.producer_faults.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(site = %self.name, producer = entry.name(), error = %failure, "Producer fault");
        self.telemetry.line(format!("{}: {failure}", self.name));
        self.telemetry.set_counter(
            &format!("site.{}.producer_faults", self.name),
            i64::try_from(faults).unwrap_or(i64::MAX),
        );
        false
    }

    /// Render loop. Returns once `cancel` fires.
    pub fn run(&self, cancel: &CancellationToken) {
        self.state
            .store(SchedulerState::Running as u8, Ordering::Release);
        info!(site = %self.name, fps = self.fps, channels = self.channels.len(), "Site scheduler running");

        let interval = self.frame_interval();
        let mut last_tick = Instant::now();

        while !cancel.is_cancelled() {
            let deadline = last_tick + interval;
            let until_deadline = deadline.saturating_duration_since(Instant::now());
            let capture = Utc::now()
                + chrono::Duration::from_std(until_deadline).unwrap_or_else(|_| chrono::Duration::zero());

            self.tick(Local::now(), capture);

            let now = Instant::now();
            if let Some(spare) = deadline.checked_duration_since(now).filter(|d| !d.is_zero()) {
                self.spare.lock().record(spare);
                thread::sleep(spare);
                last_tick = deadline;
            } else {
                let late = now.duration_since(deadline);
                self.spare.lock().record(Duration::ZERO);
                let dropped = self.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(site = %self.name, late_ms = late.as_millis() as u64, "Dropped frame");
                self.telemetry.line(format!(
                    "{} dropped frame by {} ms",
                    self.name,
                    late.as_millis()
                ));
                self.telemetry.set_counter(
                    &format!("site.{}.frames_dropped", self.name),
                    i64::try_from(dropped).unwrap_or(i64::MAX),
                );
                thread::sleep(DROPPED_FRAME_YIELD);
                // Restart pacing from now rather than bursting to catch up
                last_tick = Instant::now();
            }
        }

        self.state
            .store(SchedulerState::Stopped as u8, Ordering::Release);
        info!(site = %self.name, "Site scheduler stopped");
    }

    /// Starts the render loop on a named OS thread.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> std::io::Result<JoinHandle<()>> {
        let scheduler = Arc::clone(self);
        thread::Builder::new()
            .name(format!("site-{}", self.name))
            .spawn(move || scheduler.run(&cancel))
    }

    pub fn status(&self) -> SiteStatus {
        SiteStatus {
            name: self.name.clone(),
            fps: self.fps,
            spare_ms: self.spare_ms(),
            active_producer: self.active_producer(),
            frames_rendered: self.frames_rendered(),
            frames_dropped: self.frames_dropped(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineTuning;
    use crate::connection::LinkTiming;
    use crate::producers::SolidFill;
    use crate::registry::FleetRegistry;
    use ledfleet_core::{ChannelDescriptor, NullTelemetry, ProducerError};

    struct Exploding;

    impl FrameProducer for Exploding {
        fn name(&self) -> &str {
            "exploding"
        }

        fn render(&mut self, pixels: &mut [Rgb], _now: DateTime<Local>) -> Result<(), ProducerError> {
            if let Some(px) = pixels.first_mut() {
                *px = Rgb::new(1, 2, 3);
            }
            panic!("boom");
        }
    }

    struct Failing;

    impl FrameProducer for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn render(&mut self, pixels: &mut [Rgb], _now: DateTime<Local>) -> Result<(), ProducerError> {
            pixels.fill(Rgb::WHITE);
            Err(ProducerError::new("failing", "no data"))
        }
    }

    /// Takes longer than a 20 fps tick to render.
    struct Slow;

    impl FrameProducer for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn render(&mut self, pixels: &mut [Rgb], _now: DateTime<Local>) -> Result<(), ProducerError> {
            thread::sleep(Duration::from_millis(100));
            pixels.fill(Rgb::WHITE);
            Ok(())
        }
    }

    fn site(fps: u32) -> SiteDescriptor {
        SiteDescriptor {
            name: "test".to_string(),
            width: 4,
            fps,
            channels: Vec::new(),
            schedule: Vec::new(),
        }
    }

    fn scheduler_with(schedule: Vec<ScheduledProducer>) -> SiteScheduler {
        SiteScheduler::new(
            &site(20),
            schedule,
            Vec::new(),
            Duration::from_secs(300),
            Arc::new(NullTelemetry),
        )
    }

    #[test]
    fn test_rotation_index() {
        let period = Duration::from_secs(300);
        assert_eq!(rotation_index(Duration::from_secs(0), period, 3), 0);
        assert_eq!(rotation_index(Duration::from_secs(299), period, 3), 0);
        assert_eq!(rotation_index(Duration::from_secs(300), period, 3), 1);
        assert_eq!(rotation_index(Duration::from_secs(900), period, 3), 0);
        assert_eq!(rotation_index(Duration::from_secs(900), period, 0), 0);
    }

    #[test]
    fn test_frame_interval_defaults_to_30() {
        let unset = SiteScheduler::new(
            &site(0),
            Vec::new(),
            Vec::new(),
            Duration::from_secs(300),
            Arc::new(NullTelemetry),
        );
        assert_eq!(unset.frame_interval(), Duration::from_secs_f64(1.0 / 30.0));
        assert_eq!(scheduler_with(Vec::new()).frame_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_no_eligible_producer_renders_nothing() {
        let scheduler = scheduler_with(Vec::new());
        let report = scheduler.tick(Local::now(), Utc::now());
        assert_eq!(report.rendered, None);
        assert_eq!(scheduler.active_producer(), None);
        assert_eq!(scheduler.frames_rendered(), 0);
    }

    #[test]
    fn test_tick_renders_active_producer() {
        let red = Rgb::new(255, 0, 0);
        let scheduler = scheduler_with(vec![ScheduledProducer::new(
            ScheduleWindow::ALWAYS,
            Box::new(SolidFill::new(red)),
        )]);
        let report = scheduler.tick(Local::now(), Utc::now());
        assert_eq!(report.rendered.as_deref(), Some("solid"));
        assert!(scheduler.pixels().read().iter().all(|p| *p == red));
        assert_eq!(scheduler.frames_rendered(), 1);
    }

    #[test]
    fn test_panicking_producer_is_isolated() {
        let scheduler = scheduler_with(vec![ScheduledProducer::new(
            ScheduleWindow::ALWAYS,
            Box::new(Exploding),
        )]);
        let report = scheduler.tick(Local::now(), Utc::now());
        assert!(report.producer_failed);
        assert_eq!(report.rendered, None);
        assert_eq!(scheduler.producer_faults(), 1);
        // Partial write rolled back
        assert!(scheduler.pixels().read().iter().all(|p| *p == Rgb::BLACK));

        // The scheduler keeps working on the next tick
        let report = scheduler.tick(Local::now(), Utc::now());
        assert!(report.producer_failed);
        assert_eq!(scheduler.producer_faults(), 2);
    }

    #[test]
    fn test_failing_producer_leaves_buffer() {
        let scheduler = scheduler_with(vec![ScheduledProducer::new(
            ScheduleWindow::ALWAYS,
            Box::new(Failing),
        )]);
        scheduler.tick(Local::now(), Utc::now());
        assert!(scheduler.pixels().read().iter().all(|p| *p == Rgb::BLACK));
        assert_eq!(scheduler.active_producer().as_deref(), Some("failing"));
    }

    #[test]
    fn test_unready_channel_skipped() {
        let registry = Arc::new(FleetRegistry::new(
            LinkTiming::default(),
            Duration::from_secs(1),
            Arc::new(NullTelemetry),
        ));
        let channel = Arc::new(DeviceChannel::new(
            ChannelDescriptor::new("127.0.0.1", "Local", 0, 4),
            20,
            EngineTuning::default(),
            registry,
            Arc::new(NullTelemetry),
        ));
        let scheduler = SiteScheduler::new(
            &site(20),
            vec![ScheduledProducer::new(
                ScheduleWindow::ALWAYS,
                Box::new(SolidFill::off()),
            )],
            vec![Arc::clone(&channel)],
            Duration::from_secs(300),
            Arc::new(NullTelemetry),
        );

        let report = scheduler.tick(Local::now(), Utc::now());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.enqueued, 0);
        assert_eq!(channel.queue_depth(), 0);
    }

    #[test]
    fn test_spare_time_window_restarts_with_current_value() {
        let mut spare = SpareTime::new();
        spare.record(Duration::from_millis(40));
        spare.record(Duration::from_millis(70));
        assert_eq!(spare.min_ms, 40);

        // A starved window followed by a quiet tick after it expires
        spare.min_ms = 0;
        spare.window_start = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap();
        spare.record(Duration::from_millis(30));
        assert_eq!(spare.min_ms, 30);

        // Starved tick in a fresh window never reports the ceiling
        spare.window_start = Instant::now()
            .checked_sub(Duration::from_secs(2))
            .unwrap();
        spare.record(Duration::ZERO);
        assert_eq!(spare.min_ms, 0);
    }

    #[test]
    fn test_slow_producer_drops_frames_without_bursting() {
        let scheduler = Arc::new(scheduler_with(vec![ScheduledProducer::new(
            ScheduleWindow::ALWAYS,
            Box::new(Slow),
        )]));
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let handle = scheduler.spawn(cancel.clone()).unwrap();

        thread::sleep(Duration::from_millis(300));
        assert_eq!(scheduler.spare_ms(), 0);
        thread::sleep(Duration::from_millis(800));
        assert_eq!(scheduler.spare_ms(), 0);

        cancel.cancel();
        handle.join().unwrap();
        let elapsed = started.elapsed();

        assert!(scheduler.frames_dropped() > 0);
        // One render per 100 ms at most; catching up would push this past 20
        let expected = (elapsed.as_millis() / 100) as u64;
        let rendered = scheduler.frames_rendered();
        assert!(
            rendered >= expected.saturating_sub(4) && rendered <= expected + 1,
            "rendered {rendered} frames in {elapsed:?}"
        );
        assert_eq!(scheduler.status().frames_dropped, scheduler.frames_dropped());
    }

    #[test]
    fn test_fast_producer_reports_spare_time() {
        let scheduler = Arc::new(SiteScheduler::new(
            &site(5),
            vec![ScheduledProducer::new(
                ScheduleWindow::ALWAYS,
                Box::new(SolidFill::off()),
            )],
            Vec::new(),
            Duration::from_secs(300),
            Arc::new(NullTelemetry),
        ));
        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone()).unwrap();
        thread::sleep(Duration::from_millis(500));

        let spare = scheduler.spare_ms();
        assert!(spare > 0 && spare <= 200, "spare {spare} ms");

        cancel.cancel();
        handle.join().unwrap();
        assert_eq!(scheduler.frames_dropped(), 0);
        assert!(scheduler.frames_rendered() >= 2);
    }

    #[test]
    fn test_run_stops_on_cancel() {
        let scheduler = Arc::new(scheduler_with(Vec::new()));
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        let cancel = CancellationToken::new();
        let handle = scheduler.spawn(cancel.clone()).unwrap();
        thread::sleep(Duration::from_millis(120));
        assert_eq!(scheduler.state(), SchedulerState::Running);

        cancel.cancel();
        handle.join().unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
    }
}
