//! Process-wide state: listeners, connections, pending decisions and boundary queues.
//!
//! The registry is the single owner of all bookkeeping shared between listener tasks, connection
//! tasks and the boundary API. Identifiers are minted from monotonic counters and never reused.

use crate::decision::{
    DisconnectionEvent, MotdDecision, MotdRequest, RouteDecision, RouteRequest,
};
use crate::limiter::{ConnectionLimiter, RateLimit};
use dashmap::DashMap;
use geofront_packets::VarInt;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One running accept loop.
#[derive(Debug)]
pub(crate) struct ListenerEntry {
    pub id: u64,
    pub addr: SocketAddr,
    /// Cancelling this stops only the accept loop; extant connections continue.
    pub stop: CancellationToken,
}

/// The mutable attributes of a connection, filled in as its pipeline progresses.
#[derive(Debug)]
pub(crate) struct ConnectionMeta {
    /// The observed client address (rewritten by an inbound PROXY header).
    pub peer: SocketAddr,
    pub protocol: Option<VarInt>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
}

/// One accepted connection, shared between its pipeline task and the boundary API.
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub id: u64,
    pub accepted_at: Instant,
    /// Cancelling this aborts any suspended io or token wait of the pipeline.
    pub cancel: CancellationToken,
    pub limiter: ConnectionLimiter,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub meta: Mutex<ConnectionMeta>,
}

impl ConnectionEntry {
    pub fn peer(&self) -> SocketAddr {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peer
    }

    pub fn set_peer(&self, peer: SocketAddr) {
        self.meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peer = peer;
    }
}

/// The aggregated transfer counters, monotone for the lifetime of the process.
#[derive(Debug, Default)]
pub(crate) struct GlobalCounters {
    pub total_connections: AtomicU64,
    pub total_bytes_sent: AtomicU64,
    pub total_bytes_recv: AtomicU64,
}

/// The process-wide state registry.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    pub listeners: DashMap<u64, Arc<ListenerEntry>>,
    pub connections: DashMap<u64, Arc<ConnectionEntry>>,
    pending_route: DashMap<u64, oneshot::Sender<RouteDecision>>,
    pending_motd: DashMap<u64, oneshot::Sender<MotdDecision>>,
    route_requests: Mutex<VecDeque<RouteRequest>>,
    motd_requests: Mutex<VecDeque<MotdRequest>>,
    disconnections: Mutex<VecDeque<DisconnectionEvent>>,
    global_rate_limit: Mutex<Option<RateLimit>>,
    pub counters: GlobalCounters,
    next_listener_id: AtomicU64,
    next_connection_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Creates and registers a connection entry for a freshly accepted socket.
    pub fn register_connection(&self, peer: SocketAddr) -> Arc<ConnectionEntry> {
        let entry = Arc::new(ConnectionEntry {
            id: self.next_connection_id(),
            accepted_at: Instant::now(),
            cancel: CancellationToken::new(),
            limiter: match self.global_rate_limit() {
                Some(limit) => ConnectionLimiter::new(limit),
                None => ConnectionLimiter::unlimited(),
            },
            bytes_sent: AtomicU64::new(0),
            bytes_recv: AtomicU64::new(0),
            meta: Mutex::new(ConnectionMeta {
                peer,
                protocol: None,
                host: None,
                port: None,
                username: None,
            }),
        });
        self.connections.insert(entry.id, Arc::clone(&entry));
        self.counters
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
        entry
    }

    /// Removes a connection and drops any decision still pending for it.
    pub fn remove_connection(&self, id: u64) {
        self.connections.remove(&id);
        self.pending_route.remove(&id);
        self.pending_motd.remove(&id);
    }

    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    // boundary queues

    pub fn push_route_request(&self, request: RouteRequest) -> oneshot::Receiver<RouteDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending_route.insert(request.conn_id, tx);
        self.route_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
        rx
    }

    pub fn push_motd_request(&self, request: MotdRequest) -> oneshot::Receiver<MotdDecision> {
        let (tx, rx) = oneshot::channel();
        self.pending_motd.insert(request.conn_id, tx);
        self.motd_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(request);
        rx
    }

    pub fn push_disconnection(&self, event: DisconnectionEvent) {
        self.disconnections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(event);
    }

    /// Drains all three queues in FIFO order.
    pub fn drain_events(
        &self,
    ) -> (
        Vec<RouteRequest>,
        Vec<MotdRequest>,
        Vec<DisconnectionEvent>,
    ) {
        let route = self
            .route_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let motd = self
            .motd_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let disconnections = self
            .disconnections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        (route, motd, disconnections)
    }

    /// Completes a pending route decision; a submission for an id no longer pending is ignored.
    pub fn submit_route(&self, conn_id: u64, decision: RouteDecision) -> bool {
        match self.pending_route.remove(&conn_id) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    /// Completes a pending MOTD decision; a submission for an id no longer pending is ignored.
    pub fn submit_motd(&self, conn_id: u64, decision: MotdDecision) -> bool {
        match self.pending_motd.remove(&conn_id) {
            Some((_, tx)) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    // rate limits

    pub fn global_rate_limit(&self) -> Option<RateLimit> {
        *self
            .global_rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_global_rate_limit(&self, limit: Option<RateLimit>) {
        *self
            .global_rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = limit;
    }
}
