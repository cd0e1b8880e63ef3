//! Integration tests against fake devices on loopback TCP.
//!
//! Each test binds a `TcpListener` on an ephemeral port and points channels
//! at it, so the full connect, batch, and send path runs over real sockets.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use ledfleet_core::{
    ChannelDescriptor, ConnectionState, FrameProducer, NullTelemetry, ProducerError, ProducerSpec,
    Rgb, ScheduleEntry, ScheduleWindow, SiteDescriptor, StatusResponse,
};
use ledfleet_protocol::{decode_header, encode_status_response, split_batch, Command};
use ledfleetd::channel::{DeviceChannel, WorkerStep};
use ledfleetd::config::{EngineTuning, FleetConfig};
use ledfleetd::connection::LinkTiming;
use ledfleetd::engine::Engine;
use ledfleetd::registry::FleetRegistry;
use ledfleetd::scheduler::{ScheduledProducer, SiteScheduler};
use ledfleetd::telemetry::Telemetry;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

const HOST: &str = "127.0.0.1";

/// Upper bound on any single wait in these tests
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

// ============================================================================
// Test Helpers
// ============================================================================

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < WAIT_TIMEOUT {
        if condition() {
            return true;
        }
        thread::sleep(POLL_INTERVAL);
    }
    false
}

fn fake_device() -> (TcpListener, u16) {
    let listener = TcpListener::bind((HOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

/// A port with nothing listening on it.
fn closed_port() -> u16 {
    let (listener, port) = fake_device();
    drop(listener);
    port
}

fn accept(listener: &TcpListener) -> TcpStream {
    listener.set_nonblocking(true).unwrap();
    let start = Instant::now();
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false).unwrap();
                stream.set_read_timeout(Some(WAIT_TIMEOUT)).unwrap();
                return stream;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                assert!(start.elapsed() < WAIT_TIMEOUT, "device was never connected");
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => panic!("accept failed: {e}"),
        }
    }
}

fn read_frames(stream: &mut TcpStream, bytes: usize) -> Vec<Vec<u8>> {
    let mut buf = vec![0u8; bytes];
    stream.read_exact(&mut buf).unwrap();
    split_batch(&buf).unwrap()
}

fn registry() -> Arc<FleetRegistry> {
    Arc::new(FleetRegistry::new(
        LinkTiming::default(),
        Duration::from_secs(1),
        Arc::new(NullTelemetry),
    ))
}

fn descriptor(port: u16, name: &str, offset: usize, length: usize) -> ChannelDescriptor {
    let mut d = ChannelDescriptor::new(HOST, name, offset, length);
    d.port = port;
    d
}

fn channel(registry: &Arc<FleetRegistry>, descriptor: ChannelDescriptor) -> Arc<DeviceChannel> {
    channel_with(registry, descriptor, EngineTuning::default())
}

fn channel_with(
    registry: &Arc<FleetRegistry>,
    descriptor: ChannelDescriptor,
    tuning: EngineTuning,
) -> Arc<DeviceChannel> {
    Arc::new(DeviceChannel::new(
        descriptor,
        20,
        tuning,
        Arc::clone(registry),
        Arc::new(NullTelemetry),
    ))
}

/// Drives the worker until its connection is open.
fn connect(channel: &DeviceChannel, registry: &FleetRegistry) {
    let connected = wait_until(|| {
        channel.run_once();
        registry
            .get(channel.host())
            .is_some_and(|conn| conn.is_connected())
    });
    assert!(connected, "channel never connected");
}

/// Writes red = pixel index, so segments are easy to recognise.
struct Gradient;

impl FrameProducer for Gradient {
    fn name(&self) -> &str {
        "gradient"
    }

    fn render(&mut self, pixels: &mut [Rgb], _now: DateTime<Local>) -> Result<(), ProducerError> {
        for (i, px) in pixels.iter_mut().enumerate() {
            *px = Rgb::new(i as u8, 0, 0);
        }
        Ok(())
    }
}

fn site(width: usize, channels: Vec<ChannelDescriptor>) -> SiteDescriptor {
    SiteDescriptor {
        name: "yard".to_string(),
        width,
        fps: 20,
        channels,
        schedule: Vec::new(),
    }
}

// ============================================================================
// Registry and Connection
// ============================================================================

#[test]
fn test_channels_share_one_connection_per_host() {
    let (_listener, port) = fake_device();
    let registry = registry();
    let a = channel(&registry, descriptor(port, "A", 0, 3));
    let b = channel(&registry, descriptor(port, "B", 3, 3));

    a.run_once();
    b.run_once();

    assert_eq!(registry.len(), 1);
    assert_eq!(a.connects(), 1);
    assert_eq!(b.connects(), 0);
}

#[test]
fn test_connect_attempts_are_throttled() {
    let registry = registry();
    let (conn, _) = registry.get_or_create(HOST, closed_port());
    assert!(wait_until(|| conn.state() != ConnectionState::Resolving));
    assert_eq!(conn.state(), ConnectionState::Resolved);

    assert!(!conn.ensure_connected());
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(conn.connect_attempts(), 1);

    // Within the throttle interval: reports success without trying
    assert!(conn.ensure_connected());
    assert!(!conn.is_connected());
    assert_eq!(conn.connect_attempts(), 1);
    assert!(conn.should_discard());
}

#[test]
fn test_unresolvable_host_goes_dead() {
    let registry = registry();
    let (conn, _) = registry.get_or_create("no-such-device.invalid", 49152);
    assert!(wait_until(|| conn.state() != ConnectionState::Resolving));
    assert_eq!(conn.state(), ConnectionState::Dead);
    assert!(!conn.ensure_connected());
    // Kept until the re-resolve interval has passed
    assert!(!conn.should_discard());
}

// ============================================================================
// Device Channel
// ============================================================================

#[test]
fn test_enqueue_retry_window_without_connection() {
    let registry = registry();
    let ch = channel(&registry, descriptor(closed_port(), "A", 0, 3));
    assert!(ch.enqueue(&[0; 9], Utc::now()));
    assert!(!ch.enqueue(&[0; 9], Utc::now()));
    assert_eq!(ch.queue_depth(), 1);
}

#[test]
fn test_batch_size_one_sends_single_frame() {
    let (listener, port) = fake_device();
    let registry = registry();
    let ch = channel(&registry, descriptor(port, "A", 0, 3));
    connect(&ch, &registry);
    let mut device = accept(&listener);

    assert!(ch.ready_for_data());
    let capture = Utc::now();
    let rgb = [1, 2, 3, 4, 5, 6, 7, 8, 9];
    assert!(ch.enqueue(&rgb, capture));

    let WorkerStep::Flushed { frames, bytes } = ch.run_once() else {
        panic!("expected a flush");
    };
    assert_eq!(frames, 1);

    let received = read_frames(&mut device, bytes);
    assert_eq!(received.len(), 1);
    let header = decode_header(&received[0]).unwrap();
    assert_eq!(header.command, Command::Pixels);
    assert_eq!(header.led_count, 3);
    assert_eq!(&received[0][header.header_len()..], &rgb[..]);

    // Stamped ahead of capture by the channel's offset
    let stamped = header.seconds as i64;
    assert!(stamped >= capture.timestamp());
    assert!(stamped <= capture.timestamp() + 2);
    assert_eq!(ch.frames_sent(), 1);
}

#[test]
fn test_status_response_recorded_after_send() {
    let (listener, port) = fake_device();
    let registry = registry();
    let ch = channel(&registry, descriptor(port, "A", 0, 2));
    connect(&ch, &registry);
    let mut device = accept(&listener);

    assert!(ch.enqueue(&[0; 6], Utc::now()));
    let WorkerStep::Flushed { bytes, .. } = ch.run_once() else {
        panic!("expected a flush");
    };
    read_frames(&mut device, bytes);

    let status = StatusResponse {
        size: 64,
        flash_version: 7,
        buffer_size: 500,
        ..StatusResponse::default()
    };
    device.write_all(&encode_status_response(&status)).unwrap();
    thread::sleep(Duration::from_millis(50));

    assert!(ch.enqueue(&[0; 6], Utc::now()));
    assert!(matches!(ch.run_once(), WorkerStep::Flushed { .. }));

    let reported = ch.status(None).response;
    assert_eq!(reported.flash_version, 7);
    assert_eq!(reported.buffer_size, 500);

    ch.reset_response();
    assert!(!ch.status(None).response.is_known());
}

#[test]
fn test_partial_batch_waits_for_timeout() {
    let (listener, port) = fake_device();
    let registry = registry();
    let mut d = descriptor(port, "A", 0, 3);
    d.batch_size = 5;
    let tuning = EngineTuning {
        batch_timeout_ms: 50,
        ..EngineTuning::default()
    };
    let ch = channel_with(&registry, d, tuning);
    connect(&ch, &registry);
    let mut device = accept(&listener);

    // Clear whatever the connect loop left on the flush clock
    assert!(ch.enqueue(&[0; 9], Utc::now()));
    thread::sleep(Duration::from_millis(60));
    let WorkerStep::Flushed { frames: 1, bytes } = ch.run_once() else {
        panic!("expected a single-frame flush after the timeout");
    };
    read_frames(&mut device, bytes);

    // One frame, well short of the batch size, right after a flush
    assert!(ch.enqueue(&[1; 9], Utc::now()));
    assert_eq!(ch.run_once(), WorkerStep::Waiting);
    assert_eq!(ch.queue_depth(), 1);

    thread::sleep(Duration::from_millis(60));
    let WorkerStep::Flushed { frames: 1, bytes } = ch.run_once() else {
        panic!("expected a single-frame flush after the timeout");
    };
    let received = read_frames(&mut device, bytes);
    assert_eq!(received.len(), 1);
    assert_eq!(ch.queue_depth(), 0);
    assert_eq!(ch.frames_sent(), 2);
}

#[test]
fn test_closed_device_socket_fails_send_and_unregisters() {
    let (listener, port) = fake_device();
    let registry = registry();
    let ch = channel(&registry, descriptor(port, "A", 0, 3));
    connect(&ch, &registry);
    drop(accept(&listener));
    drop(listener);
    thread::sleep(Duration::from_millis(50));

    // The first write after the peer closes may still land in the kernel
    // buffer; the reset surfaces on a later one.
    let mut failed = false;
    for _ in 0..20 {
        if ch.enqueue(&[0; 9], Utc::now()) && ch.run_once() == WorkerStep::SendFailed {
            failed = true;
            break;
        }
        thread::sleep(Duration::from_millis(20));
    }
    assert!(failed, "send never failed after the device closed");
    assert!(!registry.contains(HOST));
    assert_eq!(ch.queue_depth(), 0);
}

#[test]
fn test_jammed_queue_drops_frames_and_replaces_connection() {
    let (_listener, port) = fake_device();
    let registry = registry();
    let mut d = descriptor(port, "A", 0, 3);
    d.batch_size = 1000;
    let ch = channel(&registry, d);
    connect(&ch, &registry);
    let first = registry.get(HOST).unwrap();

    let max = EngineTuning::default().max_queue_depth;
    for _ in 0..max {
        assert!(ch.enqueue(&[0; 9], Utc::now()));
    }
    assert!(!ch.ready_for_data());
    assert!(!ch.enqueue(&[0; 9], Utc::now()));
    assert_eq!(ch.queue_depth(), max);

    assert_eq!(ch.run_once(), WorkerStep::Jammed { dropped: max });
    assert_eq!(ch.queue_depth(), 0);
    assert!(!registry.contains(HOST));
    assert_eq!(first.state(), ConnectionState::Disconnected);

    ch.run_once();
    let second = registry.get(HOST).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(ch.connects(), 2);
}

// ============================================================================
// Site Scheduler
// ============================================================================

#[test]
fn test_tick_fans_segments_out_to_channels() {
    let (listener, port) = fake_device();
    let registry = registry();
    let left = channel(&registry, descriptor(port, "Left", 0, 3));
    let mut right_desc = descriptor(port, "Right", 3, 3);
    right_desc.reversed = true;
    let right = channel(&registry, right_desc);
    connect(&left, &registry);
    let mut device = accept(&listener);

    let scheduler = SiteScheduler::new(
        &site(6, Vec::new()),
        vec![ScheduledProducer::new(ScheduleWindow::ALWAYS, Box::new(Gradient))],
        vec![Arc::clone(&left), Arc::clone(&right)],
        Duration::from_secs(300),
        Arc::new(NullTelemetry),
    );

    let report = scheduler.tick(Local::now(), Utc::now());
    assert_eq!(report.rendered.as_deref(), Some("gradient"));
    assert_eq!(report.enqueued, 2);

    let mut total = 0;
    for ch in [&left, &right] {
        let WorkerStep::Flushed { bytes, .. } = ch.run_once() else {
            panic!("expected a flush");
        };
        total += bytes;
    }

    let frames = read_frames(&mut device, total);
    assert_eq!(frames.len(), 2);
    let payload = |raw: &Vec<u8>| raw[decode_header(raw).unwrap().header_len()..].to_vec();
    assert_eq!(payload(&frames[0]), vec![0, 0, 0, 1, 0, 0, 2, 0, 0]);
    assert_eq!(payload(&frames[1]), vec![5, 0, 0, 4, 0, 0, 3, 0, 0]);
}

// ============================================================================
// Engine
// ============================================================================

#[test]
fn test_engine_streams_to_device() {
    let (listener, port) = fake_device();
    let mut site = site(4, vec![descriptor(port, "Strip", 0, 4)]);
    site.schedule.push(ScheduleEntry {
        window: ScheduleWindow::ALWAYS,
        producer: ProducerSpec::Solid {
            color: Rgb::new(0, 0, 255),
        },
    });
    let config = FleetConfig {
        tuning: EngineTuning::default(),
        sites: vec![site],
    };

    let telemetry = Arc::new(Telemetry::new());
    let engine = Engine::new(&config, Arc::clone(&telemetry)).unwrap();
    engine.start(CancellationToken::new()).unwrap();

    let mut device = accept(&listener);
    let mut buf = [0u8; 64];
    let n = device.read(&mut buf).unwrap();
    assert!(n > 0);

    assert!(wait_until(|| engine.snapshot().connected_channels() == 1));
    let snapshot = engine.snapshot();
    assert_eq!(snapshot.sites[0].active_producer.as_deref(), Some("solid"));
    assert!(telemetry.line_count() > 0);

    engine.stop();
    assert!(!engine.is_running());
}

#[test]
fn test_snapshot_counts_shared_host_throughput_once() {
    let (listener, port) = fake_device();
    let mut site = site(6, vec![descriptor(port, "A", 0, 3), descriptor(port, "B", 3, 3)]);
    site.schedule.push(ScheduleEntry {
        window: ScheduleWindow::ALWAYS,
        producer: ProducerSpec::Solid {
            color: Rgb::new(9, 9, 9),
        },
    });
    let config = FleetConfig {
        tuning: EngineTuning::default(),
        sites: vec![site],
    };

    let engine = Engine::new(&config, Arc::new(Telemetry::new())).unwrap();
    engine.start(CancellationToken::new()).unwrap();
    let _device = accept(&listener);
    assert!(wait_until(|| engine.registry().total_bytes_per_second() > 0.0));
    engine.stop();

    let snapshot = engine.snapshot();
    assert_eq!(snapshot.channels.len(), 2);
    let per_host = snapshot.channels[0].bytes_per_second;
    assert!(per_host > 0.0);
    // Both channels report the shared connection's rate
    assert!((snapshot.channels[1].bytes_per_second - per_host).abs() <= per_host * 0.05);
    assert!(
        (snapshot.total_bytes_per_second - per_host).abs() <= per_host * 0.05,
        "total {} vs per-host {per_host}",
        snapshot.total_bytes_per_second
    );
}
