//! Engine: wires sites, channels and the fleet registry together.
//!
//! Built once from a validated [`FleetConfig`]. [`Engine::start`] spawns one
//! scheduler thread per site and one worker thread per channel; all of them
//! stop when the shared cancellation token fires.
//!
//! # Panic-Free Guarantees
//!
//! Thread spawn failures are returned as [`EngineError::Spawn`]; a panicked
//! worker is logged at join time rather than propagated.

use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use ledfleet_core::{FleetSnapshot, TelemetrySink};

use crate::channel::DeviceChannel;
use crate::config::{ConfigError, FleetConfig};
use crate::connection::LinkTiming;
use crate::producers::build_producer;
use crate::registry::FleetRegistry;
use crate::scheduler::{ScheduledProducer, SiteScheduler};
use crate::telemetry::Telemetry;

/// Lines included in each snapshot.
pub const SNAPSHOT_LINES: usize = 50;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Engine already started")]
    AlreadyStarted,
}

/// All running state for a fleet.
pub struct Engine {
    sites: Vec<Arc<SiteScheduler>>,
    registry: Arc<FleetRegistry>,
    telemetry: Arc<Telemetry>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl Engine {
    /// Builds schedulers and channels for every configured site.
    pub fn new(config: &FleetConfig, telemetry: Arc<Telemetry>) -> Result<Self, EngineError> {
        config.validate()?;

        let sink: Arc<dyn TelemetrySink> = telemetry.clone();
        let tuning = &config.tuning;
        let registry = Arc::new(FleetRegistry::new(
            LinkTiming::from(tuning),
            tuning.connect_throttle(),
            Arc::clone(&sink),
        ));

        let sites = config
            .sites
            .iter()
            .map(|site| {
                let channels = site
                    .channels
                    .iter()
                    .map(|descriptor| {
                        Arc::new(DeviceChannel::new(
                            descriptor.clone(),
                            site.fps,
                            tuning.clone(),
                            Arc::clone(&registry),
                            Arc::clone(&sink),
                        ))
                    })
                    .collect();
                let schedule = site
                    .schedule
                    .iter()
                    .map(|entry| ScheduledProducer::new(entry.window, build_producer(&entry.producer)))
                    .collect();
                Arc::new(SiteScheduler::new(
                    site,
                    schedule,
                    channels,
                    tuning.rotation(),
                    Arc::clone(&sink),
                ))
            })
            .collect();

        Ok(Self {
            sites,
            registry,
            telemetry,
            handles: Mutex::new(Vec::new()),
            cancel: Mutex::new(None),
        })
    }

    pub fn sites(&self) -> &[Arc<SiteScheduler>] {
        &self.sites
    }

    pub fn registry(&self) -> &Arc<FleetRegistry> {
        &self.registry
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<DeviceChannel>> {
        self.sites.iter().flat_map(|site| site.channels().iter())
    }

    pub fn is_running(&self) -> bool {
        self.cancel.lock().is_some()
    }

    /// Spawns every channel worker and site scheduler.
    ///
    /// Workers start first so connections are resolving by the time the
    /// first frames are rendered.
    pub fn start(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let mut slot = self.cancel.lock();
        if slot.is_some() {
            return Err(EngineError::AlreadyStarted);
        }

        let mut handles = self.handles.lock();
        for channel in self.channels() {
            let handle = channel
                .spawn_worker(cancel.clone())
                .map_err(|source| EngineError::Spawn {
                    name: format!("chan-{}", channel.descriptor().friendly_name),
                    source,
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            }
        }
        for site in &self.sites {
            let handle = site
                .spawn(cancel.clone())
                .map_err(|source| EngineError::Spawn {
                    name: format!("site-{}", site.name()),
                    source,
                });
            match handle {
                Ok(h) => handles.push(h),
                Err(e) => {
                    cancel.cancel();
                    return Err(e);
                }
            }
        }

        info!(
            sites = self.sites.len(),
            channels = self.channels().count(),
            "Engine started"
        );
        *slot = Some(cancel);
        Ok(())
    }

    /// Signals every thread to stop and waits for them.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.join();
    }

    /// Waits for all spawned threads to exit.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            if handle.join().is_err() {
                error!(thread = %name, "Engine thread panicked");
            }
        }
    }

    /// Read-only view of the whole fleet.
    pub fn snapshot(&self) -> FleetSnapshot {
        let sites = self.sites.iter().map(|s| s.status()).collect();
        let channels = self
            .sites
            .iter()
            .flat_map(|site| {
                let active = site.active_producer();
                site.channels()
                    .iter()
                    .map(move |c| c.status(active.clone()))
            })
            .collect();
        FleetSnapshot::new(
            sites,
            channels,
            self.registry.total_bytes_per_second(),
            self.telemetry.counters(),
            self.telemetry.recent_lines(SNAPSHOT_LINES),
        )
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.get_mut().take() {
            cancel.cancel();
        }
    }
}
