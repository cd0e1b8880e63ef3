//! Fleet registry: one shared connection per device hostname.
//!
//! Several channels can address the same physical device. They must share
//! one socket, so every lookup goes through [`FleetRegistry::get_or_create`]
//! and removal only succeeds if the caller still holds the registered
//! instance. Both operations are single atomic map operations, so there is
//! no read-then-write window between concurrent channel workers.
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()` or `.expect()`; lookups return `Option`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use ledfleet_core::TelemetrySink;

use crate::connection::{ConnectThrottle, DeviceConnection, LinkTiming};

/// Process-wide map from hostname to its live [`DeviceConnection`].
pub struct FleetRegistry {
    connections: DashMap<String, Arc<DeviceConnection>>,
    throttle: Arc<ConnectThrottle>,
    timing: LinkTiming,
    telemetry: Arc<dyn TelemetrySink>,
}

impl FleetRegistry {
    pub fn new(
        timing: LinkTiming,
        connect_throttle: Duration,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            throttle: Arc::new(ConnectThrottle::new(connect_throttle)),
            timing,
            telemetry,
        }
    }

    /// Returns the registered connection for `host`, creating one if absent.
    ///
    /// The flag is true when this call created the connection.
    pub fn get_or_create(&self, host: &str, port: u16) -> (Arc<DeviceConnection>, bool) {
        match self.connections.entry(host.to_string()) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                debug!(host, port, "Creating device connection");
                let conn = DeviceConnection::spawn(
                    host,
                    port,
                    self.timing,
                    Arc::clone(&self.throttle),
                    Arc::clone(&self.telemetry),
                );
                entry.insert(Arc::clone(&conn));
                (conn, true)
            }
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<DeviceConnection>> {
        self.connections.get(host).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, host: &str) -> bool {
        self.connections.contains_key(host)
    }

    /// Removes `conn` if it is still the registered instance for its host.
    ///
    /// Returns false when another worker already replaced or removed it.
    pub fn remove(&self, conn: &Arc<DeviceConnection>) -> bool {
        let removed = self
            .connections
            .remove_if(conn.host(), |_, registered| Arc::ptr_eq(registered, conn))
            .is_some();
        if removed {
            debug!(host = conn.host(), "Device connection removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Sum of throughput over all registered connections.
    pub fn total_bytes_per_second(&self) -> f64 {
        self.connections
            .iter()
            .map(|entry| entry.value().bytes_per_second())
            .sum()
    }
}
