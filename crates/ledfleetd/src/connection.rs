//! Blocking TCP link to a single LED controller.
//!
//! A `DeviceConnection` owns at most one socket to one hostname. Hostname
//! resolution runs on its own short-lived thread right after construction;
//! until it finishes the connection refuses to connect or send.
//!
//! # Lifecycle
//!
//! ```text
//! Resolving ──ok──▶ Resolved ──▶ Connecting ──▶ Connected
//!     │                              │              │
//!     └─fail─▶ Dead                  └──fail──▶ Disconnected ◀─ write error
//! ```
//!
//! A connection is never reused after it fails: the channel worker removes
//! it from the registry and a fresh one is created on the next iteration.
//! Connect attempts are rate-limited per hostname by a [`ConnectThrottle`]
//! that outlives individual connection objects.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, or unchecked slice indexing. Socket errors
//! are mapped to [`LinkError`] or folded into the state machine.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use ledfleet_core::{ConnectionState, StatusResponse, TelemetrySink};
use ledfleet_protocol::{decode_status_response, STATUS_RESPONSE_LEN};

use crate::config::EngineTuning;

/// Unparsed response bytes kept between sends before further reads stop.
const MAX_PENDING_RESPONSE_BYTES: usize = STATUS_RESPONSE_LEN * 16;

/// Errors from a send on a device link.
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Not connected to {0}")]
    NotConnected(String),

    #[error("I/O error on link to {host}: {source}")]
    Io {
        host: String,
        #[source]
        source: io::Error,
    },
}

/// Socket timing parameters, derived from [`EngineTuning`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTiming {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// How long a resolution failure keeps the connection dead
    pub resolve_retry: Duration,
    /// Byte-rate counter restarts after this long
    pub rate_window: Duration,
}

impl From<&EngineTuning> for LinkTiming {
    fn from(tuning: &EngineTuning) -> Self {
        Self {
            connect_timeout: tuning.connect_timeout(),
            write_timeout: tuning.write_timeout(),
            resolve_retry: tuning.resolve_retry(),
            rate_window: tuning.rate_window(),
        }
    }
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self::from(&EngineTuning::default())
    }
}

// ============================================================================
// Connect Throttle
// ============================================================================

/// Limits connect attempts to one per `interval` per hostname.
#[derive(Debug)]
pub struct ConnectThrottle {
    last_attempt: DashMap<String, Instant>,
    interval: Duration,
}

impl ConnectThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_attempt: DashMap::new(),
            interval,
        }
    }

    /// Records an attempt for `host` and returns true, unless the previous
    /// attempt was less than `interval` ago.
    pub fn try_acquire(&self, host: &str) -> bool {
        let now = Instant::now();
        match self.last_attempt.entry(host.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.duration_since(*entry.get()) < self.interval {
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

// ============================================================================
// Byte Rate
// ============================================================================

#[derive(Debug)]
struct ByteRate {
    started: Instant,
    bytes: u64,
    window: Duration,
}

impl ByteRate {
    fn new(window: Duration) -> Self {
        Self {
            started: Instant::now(),
            bytes: 0,
            window,
        }
    }

    fn record(&mut self, bytes: u64) {
        if self.started.elapsed() > self.window {
            self.started = Instant::now();
            self.bytes = 0;
        }
        self.bytes = self.bytes.saturating_add(bytes);
    }

    fn per_second(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs < 0.001 {
            return 0.0;
        }
        self.bytes as f64 / secs
    }
}

// ============================================================================
// Device Connection
// ============================================================================

#[derive(Default)]
struct Link {
    addrs: Vec<SocketAddr>,
    stream: Option<TcpStream>,
    dead_since: Option<Instant>,
    pending: Vec<u8>,
}

/// The single shared socket to one device hostname.
pub struct DeviceConnection {
    host: String,
    port: u16,
    state: AtomicU8,
    link: Mutex<Link>,
    response: Mutex<StatusResponse>,
    rate: Mutex<ByteRate>,
    connect_attempts: AtomicU64,
    throttle: Arc<ConnectThrottle>,
    timing: LinkTiming,
    telemetry: Arc<dyn TelemetrySink>,
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceConnection {
    /// Creates a connection and starts resolving `host` in the background.
    pub fn spawn(
        host: &str,
        port: u16,
        timing: LinkTiming,
        throttle: Arc<ConnectThrottle>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Arc<Self> {
        let conn = Arc::new(Self {
            host: host.to_string(),
            port,
            state: AtomicU8::new(ConnectionState::Resolving.as_u8()),
            link: Mutex::new(Link::default()),
            response: Mutex::new(StatusResponse::default()),
            rate: Mutex::new(ByteRate::new(timing.rate_window)),
            connect_attempts: AtomicU64::new(0),
            throttle,
            timing,
            telemetry,
        });

        let weak = Arc::downgrade(&conn);
        let lookup = (host.to_string(), port);
        let spawned = thread::Builder::new()
            .name(format!("resolve-{host}"))
            .spawn(move || {
                let result = lookup
                    .to_socket_addrs()
                    .map(|addrs| addrs.collect::<Vec<_>>());
                // The registry may have dropped us while DNS was slow
                if let Some(conn) = weak.upgrade() {
                    conn.finish_resolve(result);
                }
            });
        if let Err(e) = spawned {
            conn.finish_resolve(Err(e));
        }

        conn
    }

    fn finish_resolve(&self, result: io::Result<Vec<SocketAddr>>) {
        let mut link = self.link.lock();
        match result {
            Ok(addrs) if !addrs.is_empty() => {
                debug!(host = %self.host, addresses = addrs.len(), "Hostname resolved");
                link.addrs = addrs;
                self.set_state(ConnectionState::Resolved);
            }
            Ok(_) => self.mark_dead(&mut link, "no addresses"),
            Err(e) => self.mark_dead(&mut link, &e.to_string()),
        }
    }

    fn mark_dead(&self, link: &mut Link, reason: &str) {
        link.dead_since = Some(Instant::now());
        link.stream = None;
        self.set_state(ConnectionState::Dead);
        warn!(host = %self.host, reason, "Hostname resolution failed");
        self.telemetry
            .line(format!("Could not resolve {}: {reason}", self.host));
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of socket connects actually attempted by this object.
    pub fn connect_attempts(&self) -> u64 {
        self.connect_attempts.load(Ordering::Relaxed)
    }

    /// Makes sure a socket is open, connecting if allowed.
    ///
    /// Returns false while resolving, after a resolution failure, or when a
    /// connect attempt fails. If another attempt against this hostname was
    /// made within the throttle interval, returns true without trying; the
    /// caller should check [`is_connected`](Self::is_connected) before
    /// sending.
    pub fn ensure_connected(&self) -> bool {
        match self.state() {
            ConnectionState::Connected => return true,
            state if !state.can_connect() => return false,
            _ => {}
        }

        let mut link = self.link.lock();

        // Another channel sharing this connection may have won the race
        match self.state() {
            ConnectionState::Connected => return true,
            state if !state.can_connect() => return false,
            _ => {}
        }

        if !self.throttle.try_acquire(&self.host) {
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);

        match self.open_stream(&link.addrs) {
            Ok(stream) => {
                link.stream = Some(stream);
                link.pending.clear();
                self.set_state(ConnectionState::Connected);
                info!(host = %self.host, port = self.port, "Connected to device");
                self.telemetry.line(format!("Connected to {}", self.host));
                true
            }
            Err(e) => {
                link.stream = None;
                self.set_state(ConnectionState::Disconnected);
                debug!(host = %self.host, error = %e, "Connect failed");
                self.telemetry
                    .line(format!("Could not connect to {}: {e}", self.host));
                false
            }
        }
    }

    fn open_stream(&self, addrs: &[SocketAddr]) -> io::Result<TcpStream> {
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses");
        for addr in addrs {
            match TcpStream::connect_timeout(addr, self.timing.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(self.timing.write_timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    /// Writes `data` and then picks up any status responses already waiting.
    ///
    /// Returns the number of bytes written, which is less than `data.len()`
    /// when the write timed out part-way. Never blocks waiting for a
    /// response.
    ///
    /// # Errors
    ///
    /// `LinkError::NotConnected` without an open socket; `LinkError::Io` on a
    /// socket error, after which the connection is `Disconnected`.
    pub fn send(&self, data: &[u8]) -> Result<usize, LinkError> {
        let mut guard = self.link.lock();
        let link = &mut *guard;

        let Some(stream) = link.stream.as_mut() else {
            return Err(LinkError::NotConnected(self.host.clone()));
        };

        let written = match write_fully(stream, data) {
            Ok(written) => written,
            Err(source) => {
                link.stream = None;
                self.set_state(ConnectionState::Disconnected);
                return Err(LinkError::Io {
                    host: self.host.clone(),
                    source,
                });
            }
        };
        self.rate.lock().record(written as u64);

        match read_responses(stream, &mut link.pending) {
            Ok(Some(status)) => *self.response.lock() = status,
            Ok(None) => {}
            Err(e) => debug!(host = %self.host, error = %e, "Status read failed"),
        }

        Ok(written)
    }

    /// Closes the socket. The object is not reconnected afterwards.
    pub fn disconnect(&self) {
        let mut link = self.link.lock();
        if link.stream.take().is_some() {
            debug!(host = %self.host, "Socket closed");
        }
        if self.state() != ConnectionState::Dead {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Whether a channel worker should drop this object from the registry
    /// after `ensure_connected` returned false.
    ///
    /// Resolving connections are kept. Dead ones are kept until the
    /// re-resolve interval has elapsed, so resolution is retried
    /// periodically rather than on every worker tick.
    pub fn should_discard(&self) -> bool {
        match self.state() {
            ConnectionState::Unresolved | ConnectionState::Resolving => false,
            ConnectionState::Dead => self
                .link
                .lock()
                .dead_since
                .map_or(true, |since| since.elapsed() >= self.timing.resolve_retry),
            _ => true,
        }
    }

    /// Most recent status response from the device.
    pub fn response(&self) -> StatusResponse {
        *self.response.lock()
    }

    /// Clears the stored response so telemetry shows it as unknown.
    pub fn reset_response(&self) {
        self.response.lock().reset();
    }

    /// Bytes written per second since the rate window last restarted.
    pub fn bytes_per_second(&self) -> f64 {
        self.rate.lock().per_second()
    }
}

/// Writes as much of `data` as the socket accepts before an error or the
/// write timeout. A timeout after partial progress reports the short count.
fn write_fully(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while let Some(rest) = data.get(written..).filter(|rest| !rest.is_empty()) {
        match stream.write(rest) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e)
                if written > 0
                    && matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
            {
                break
            }
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// Reads whatever is already available without blocking and decodes every
/// complete response, returning the newest accepted one.
fn read_responses(
    stream: &mut TcpStream,
    pending: &mut Vec<u8>,
) -> io::Result<Option<StatusResponse>> {
    stream.set_nonblocking(true)?;
    let mut chunk = [0u8; STATUS_RESPONSE_LEN * 4];
    let read_result = loop {
        if pending.len() >= MAX_PENDING_RESPONSE_BYTES {
            break Ok(());
        }
        match stream.read(&mut chunk) {
            Ok(0) => break Ok(()),
            Ok(n) => pending.extend_from_slice(chunk.get(..n).unwrap_or_default()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Err(e),
        }
    };
    stream.set_nonblocking(false)?;
    read_result?;

    let mut latest = None;
    while pending.len() >= STATUS_RESPONSE_LEN {
        let record: Vec<u8> = pending.drain(..STATUS_RESPONSE_LEN).collect();
        if let Some(status) = decode_status_response(&record) {
            latest = Some(status);
        }
    }
    Ok(latest)
}
