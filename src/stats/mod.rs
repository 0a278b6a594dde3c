//! Connection registry and live counters
//!
//! The registry is the only shared mutable state in the proxy: a map of
//! live connection records plus aggregate counters, read by the monitoring
//! side through point-in-time snapshots. Counters are plain atomics so the
//! relay hot path never takes the map lock; the lock guards only
//! registration, teardown, and snapshot copies.

use crate::protocol::Address;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Lifecycle of one proxied connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum ConnState {
    Negotiating = 0,
    Connecting = 1,
    Relaying = 2,
    Closing = 3,
    Closed = 4,
}

impl ConnState {
    fn from_u8(v: u8) -> ConnState {
        match v {
            0 => ConnState::Negotiating,
            1 => ConnState::Connecting,
            2 => ConnState::Relaying,
            3 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// Live record for one connection; shared between its handler task and
/// snapshot readers.
#[derive(Debug)]
pub struct ConnRecord {
    id: u64,
    client_addr: SocketAddr,
    started_at: SystemTime,
    target: Mutex<Option<Address>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    state: AtomicU8,
}

impl ConnRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}

struct RegistryInner {
    started: Instant,
    max_connections: u32,
    next_id: AtomicU64,
    total_connections: AtomicU64,
    total_bytes_in: AtomicU64,
    total_bytes_out: AtomicU64,
    // Resettable baseline offsets so `reset` keeps the raw counters
    // monotonic for live guards.
    connections: Mutex<HashMap<u64, Arc<ConnRecord>>>,
    reset_at: Mutex<ResetBaseline>,
}

#[derive(Default)]
struct ResetBaseline {
    elapsed_offset: std::time::Duration,
    total_connections: u64,
    total_bytes_in: u64,
    total_bytes_out: u64,
}

/// Cheaply-cloneable handle to the shared registry state.
#[derive(Clone)]
pub struct ConnRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnRegistry {
    pub fn new(max_connections: u32) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                started: Instant::now(),
                max_connections,
                next_id: AtomicU64::new(1),
                total_connections: AtomicU64::new(0),
                total_bytes_in: AtomicU64::new(0),
                total_bytes_out: AtomicU64::new(0),
                connections: Mutex::new(HashMap::new()),
                reset_at: Mutex::new(ResetBaseline::default()),
            }),
        }
    }

    /// Admit a new connection, or refuse it when the live count has
    /// reached `max_connections`. The returned guard removes the record
    /// on drop, on every exit path.
    pub fn register(&self, client_addr: SocketAddr) -> Option<ConnGuard> {
        let mut connections = self.inner.connections.lock().unwrap();
        if connections.len() as u32 >= self.inner.max_connections {
            return None;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.total_connections.fetch_add(1, Ordering::Relaxed);

        let record = Arc::new(ConnRecord {
            id,
            client_addr,
            started_at: SystemTime::now(),
            target: Mutex::new(None),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            state: AtomicU8::new(ConnState::Negotiating as u8),
        });
        connections.insert(id, Arc::clone(&record));

        Some(ConnGuard {
            registry: self.clone(),
            record,
        })
    }

    /// Number of live connections
    pub fn active_connections(&self) -> u64 {
        self.inner.connections.lock().unwrap().len() as u64
    }

    /// Seconds since start (or since the last reset)
    pub fn uptime_secs(&self) -> u64 {
        let offset = self.inner.reset_at.lock().unwrap().elapsed_offset;
        (self.inner.started.elapsed() - offset).as_secs()
    }

    /// Point-in-time copy of all counters and live connection rows.
    pub fn snapshot(&self) -> StatsSnapshot {
        let baseline = {
            let guard = self.inner.reset_at.lock().unwrap();
            ResetBaseline {
                elapsed_offset: guard.elapsed_offset,
                total_connections: guard.total_connections,
                total_bytes_in: guard.total_bytes_in,
                total_bytes_out: guard.total_bytes_out,
            }
        };

        let mut connections: Vec<ConnSnapshot> = {
            let map = self.inner.connections.lock().unwrap();
            map.values().map(|record| snapshot_row(record)).collect()
        };
        connections.sort_by_key(|row| row.id);

        StatsSnapshot {
            total_connections: self
                .inner
                .total_connections
                .load(Ordering::Relaxed)
                .saturating_sub(baseline.total_connections),
            active_connections: connections.len() as u64,
            total_bytes_in: self
                .inner
                .total_bytes_in
                .load(Ordering::Relaxed)
                .saturating_sub(baseline.total_bytes_in),
            total_bytes_out: self
                .inner
                .total_bytes_out
                .load(Ordering::Relaxed)
                .saturating_sub(baseline.total_bytes_out),
            uptime: (self.inner.started.elapsed() - baseline.elapsed_offset).as_secs(),
            connections,
        }
    }

    /// Restart the aggregate counters and the uptime clock. Live
    /// connection records are unaffected.
    pub fn reset(&self) {
        let mut baseline = self.inner.reset_at.lock().unwrap();
        baseline.elapsed_offset = self.inner.started.elapsed();
        baseline.total_connections = self.inner.total_connections.load(Ordering::Relaxed);
        baseline.total_bytes_in = self.inner.total_bytes_in.load(Ordering::Relaxed);
        baseline.total_bytes_out = self.inner.total_bytes_out.load(Ordering::Relaxed);
    }
}

fn snapshot_row(record: &ConnRecord) -> ConnSnapshot {
    let (host, port) = match &*record.target.lock().unwrap() {
        Some(addr) => (addr.host(), addr.port()),
        None => (String::new(), 0),
    };
    ConnSnapshot {
        id: record.id,
        client: record.client_addr.to_string(),
        host,
        port,
        start_time: record
            .started_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
        bytes_in: record.bytes_in.load(Ordering::Relaxed),
        bytes_out: record.bytes_out.load(Ordering::Relaxed),
        status: record.state(),
    }
}

/// RAII handle owned by a connection's handler task.
///
/// Dropping the guard is the single teardown point: the record leaves the
/// registry and its state becomes Closed, no matter how the handler
/// exited.
pub struct ConnGuard {
    registry: ConnRegistry,
    record: Arc<ConnRecord>,
}

impl ConnGuard {
    pub fn record(&self) -> &ConnRecord {
        &self.record
    }

    pub fn set_state(&self, state: ConnState) {
        self.record.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn set_target(&self, target: Address) {
        *self.record.target.lock().unwrap() = Some(target);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.record.bytes_in.fetch_add(n, Ordering::Relaxed);
        self.registry
            .inner
            .total_bytes_in
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.record.bytes_out.fetch_add(n, Ordering::Relaxed);
        self.registry
            .inner
            .total_bytes_out
            .fetch_add(n, Ordering::Relaxed);
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.record
            .state
            .store(ConnState::Closed as u8, Ordering::Relaxed);
        self.registry
            .inner
            .connections
            .lock()
            .unwrap()
            .remove(&self.record.id);
    }
}

/// One row of the snapshot's connection table
#[derive(Debug, Clone, Serialize)]
pub struct ConnSnapshot {
    pub id: u64,
    pub client: String,
    pub host: String,
    pub port: u16,
    pub start_time: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub status: ConnState,
}

/// The `/api/stats` payload
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub uptime: u64,
    pub connections: Vec<ConnSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{}", port).parse().unwrap()
    }

    #[test]
    fn test_register_and_teardown() {
        let registry = ConnRegistry::new(8);
        assert_eq!(registry.active_connections(), 0);

        let guard = registry.register(addr(1000)).unwrap();
        assert_eq!(registry.active_connections(), 1);
        assert_eq!(guard.record().state(), ConnState::Negotiating);

        drop(guard);
        assert_eq!(registry.active_connections(), 0);
        assert_eq!(registry.snapshot().total_connections, 1);
    }

    #[test]
    fn test_admission_cap() {
        let registry = ConnRegistry::new(2);
        let g1 = registry.register(addr(1)).unwrap();
        let _g2 = registry.register(addr(2)).unwrap();
        assert!(registry.register(addr(3)).is_none());

        // A slot frees up once any live connection closes.
        drop(g1);
        assert!(registry.register(addr(4)).is_some());
    }

    #[test]
    fn test_ids_are_unique_and_monotonic() {
        let registry = ConnRegistry::new(8);
        let g1 = registry.register(addr(1)).unwrap();
        let g2 = registry.register(addr(2)).unwrap();
        drop(g1);
        let g3 = registry.register(addr(3)).unwrap();
        assert!(g2.record().id() > 0);
        assert!(g3.record().id() > g2.record().id());
    }

    #[test]
    fn test_counters_aggregate() {
        let registry = ConnRegistry::new(8);
        let g1 = registry.register(addr(1)).unwrap();
        let g2 = registry.register(addr(2)).unwrap();

        g1.add_bytes_in(100);
        g1.add_bytes_out(10);
        g2.add_bytes_in(1);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_bytes_in, 101);
        assert_eq!(snapshot.total_bytes_out, 10);

        // Totals survive teardown of the contributing connections.
        drop(g1);
        drop(g2);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_bytes_in, 101);
        assert_eq!(snapshot.active_connections, 0);
    }

    #[test]
    fn test_snapshot_rows() {
        let registry = ConnRegistry::new(8);
        let guard = registry.register(addr(5555)).unwrap();
        guard.set_target(Address::Domain("example.com".into(), 443));
        guard.set_state(ConnState::Relaying);
        guard.add_bytes_out(42);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        let row = &snapshot.connections[0];
        assert_eq!(row.client, "127.0.0.1:5555");
        assert_eq!(row.host, "example.com");
        assert_eq!(row.port, 443);
        assert_eq!(row.bytes_out, 42);
        assert_eq!(row.status, ConnState::Relaying);
    }

    #[test]
    fn test_snapshot_serializes_with_contract_field_names() {
        let registry = ConnRegistry::new(8);
        let guard = registry.register(addr(1)).unwrap();
        guard.set_state(ConnState::Relaying);

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert!(json.get("total_connections").is_some());
        assert!(json.get("active_connections").is_some());
        assert!(json.get("total_bytes_in").is_some());
        assert!(json.get("total_bytes_out").is_some());
        assert!(json.get("uptime").is_some());
        assert_eq!(json["connections"][0]["status"], "relaying");
    }

    #[test]
    fn test_reset_rebases_aggregates() {
        let registry = ConnRegistry::new(8);
        let guard = registry.register(addr(1)).unwrap();
        guard.add_bytes_in(500);
        drop(guard);

        registry.reset();
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.total_connections, 0);
        assert_eq!(snapshot.total_bytes_in, 0);

        // New traffic counts from the fresh baseline.
        let guard = registry.register(addr(2)).unwrap();
        guard.add_bytes_in(7);
        assert_eq!(registry.snapshot().total_bytes_in, 7);
    }
}
