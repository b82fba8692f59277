//! Connection tracking and transfer counters.
//!
//! Every established outbound connection is registered in a
//! `connection_id → Connection` map for the lifetime of its socket. The id
//! is surfaced to the downstream client in the CONNECT reply
//! (`X-Connection-Id`) and, when an upstream proxy supplied one, adopted
//! unchanged — making connection identity transitive across a chain of
//! proxies.

use super::upstream::Upstream;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// An established outbound connection, as visible in the tracking map.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Opaque connection handle (adopted from upstream or freshly
    /// generated with at least 64 bits of entropy).
    pub connection_id: String,
    /// Partition id copied from the inbound `X-Partition-Id` header.
    pub partition_id: Option<String>,
    /// Upstream the connection goes through, if any.
    pub upstream: Option<Upstream>,
    /// Target `host:port`.
    pub host: String,
}

/// Map of live outbound connections, keyed by connection id.
///
/// A connection is present exactly while its socket is open: the guard
/// returned by [`ConnectionTracker::insert`] removes the entry on drop,
/// which the relay task holds until the tunnel ends.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    inner: RwLock<HashMap<String, Connection>>,
}

impl ConnectionTracker {
    /// Register a connection, returning the guard that keeps it tracked.
    pub(crate) fn insert(self: &Arc<Self>, connection: Connection) -> TrackedConnection {
        let id = connection.connection_id.clone();
        self.inner
            .write()
            .expect("connection tracker poisoned")
            .insert(id.clone(), connection);
        TrackedConnection {
            tracker: self.clone(),
            connection_id: id,
        }
    }

    /// Look up a connection by id.
    pub fn get(&self, connection_id: &str) -> Option<Connection> {
        self.inner
            .read()
            .expect("connection tracker poisoned")
            .get(connection_id)
            .cloned()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.inner.read().expect("connection tracker poisoned").len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live connection.
    pub fn snapshot(&self) -> Vec<Connection> {
        self.inner
            .read()
            .expect("connection tracker poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn remove(&self, connection_id: &str) {
        self.inner
            .write()
            .expect("connection tracker poisoned")
            .remove(connection_id);
    }
}

/// Guard tying a tracking entry to the lifetime of its socket's relay task.
#[derive(Debug)]
pub(crate) struct TrackedConnection {
    tracker: Arc<ConnectionTracker>,
    connection_id: String,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.tracker.remove(&self.connection_id);
    }
}

/// Transfer counters for one engine instance.
///
/// Monotonic while the engine is running; reset on restart.
#[derive(Debug, Default)]
pub struct ProxyStats {
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl ProxyStats {
    /// Bytes received from remote endpoints.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes sent toward remote endpoints.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn record(&self, read: u64, written: u64) {
        self.bytes_read.fetch_add(read, Ordering::Relaxed);
        self.bytes_written.fetch_add(written, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}
