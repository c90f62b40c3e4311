//! The boundary API between the engine and the policy layer.
//!
//! The policy layer never holds engine references: it polls the request/event queues, names
//! connections and listeners by id, and submits decisions that resume parked pipelines. All JSON
//! crossing the boundary is (de)serialized exactly once through the types in [`crate::decision`].

use crate::cache::{CacheStats, DecisionCache};
use crate::decision::{
    DisconnectionEvent, MotdDecision, MotdRequest, RouteDecision, RouteRequest,
};
use crate::error::Error;
use crate::limiter::RateLimit;
use crate::listener;
use crate::proxy_protocol::ProxyProtocolMode;
use crate::registry::{ListenerEntry, Registry};
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// How long a pipeline waits for a decision before synthesizing a "router timeout" rejection.
pub const DEFAULT_DECISION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a connection may take from accept to the forward loop.
pub const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(120);

/// The state shared by the boundary API, all listener tasks and all connection tasks.
pub(crate) struct EngineState {
    pub registry: Arc<Registry>,
    pub cache: Arc<DecisionCache>,
    pub tracker: TaskTracker,
    pub shutdown: CancellationToken,
    pub decision_timeout: Duration,
    pub setup_timeout: Duration,
    proxy_protocol_in: Mutex<ProxyProtocolMode>,
}

impl EngineState {
    pub fn proxy_protocol_in(&self) -> ProxyProtocolMode {
        *self
            .proxy_protocol_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// The gateway engine handle.
///
/// Cloning is cheap; all clones drive the same engine.
#[derive(Clone)]
pub struct Engine {
    state: Arc<EngineState>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_DECISION_TIMEOUT, DEFAULT_SETUP_TIMEOUT)
    }

    pub fn with_timeouts(decision_timeout: Duration, setup_timeout: Duration) -> Self {
        Self {
            state: Arc::new(EngineState {
                registry: Arc::new(Registry::new()),
                cache: Arc::new(DecisionCache::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
                decision_timeout,
                setup_timeout,
                proxy_protocol_in: Mutex::new(ProxyProtocolMode::default()),
            }),
        }
    }

    // listeners

    /// Binds a new listening endpoint and starts its accept loop.
    ///
    /// # Errors
    ///
    /// Will return [`Error::Bind`] when the address cannot be bound; this is the only fatal error
    /// of the boundary API.
    pub async fn start_listener(&self, host: &str, port: u16) -> Result<u64, Error> {
        let listener = TcpListener::bind((host, port)).await.map_err(Error::Bind)?;
        let addr = listener.local_addr().map_err(Error::Bind)?;

        let entry = Arc::new(ListenerEntry {
            id: self.state.registry.next_listener_id(),
            addr,
            stop: self.state.shutdown.child_token(),
        });
        self.state
            .registry
            .listeners
            .insert(entry.id, Arc::clone(&entry));

        self.state.tracker.spawn(listener::accept_loop(
            listener,
            entry.clone(),
            Arc::clone(&self.state),
        ));

        Ok(entry.id)
    }

    /// Stops a listener's accept loop; extant connections continue.
    pub fn stop_listener(&self, listener_id: u64) -> bool {
        match self.state.registry.listeners.remove(&listener_id) {
            Some((_, entry)) => {
                entry.stop.cancel();
                true
            }
            None => false,
        }
    }

    /// The bound address of a running listener (useful with port 0).
    pub fn listener_addr(&self, listener_id: u64) -> Option<SocketAddr> {
        self.state
            .registry
            .listeners
            .get(&listener_id)
            .map(|entry| entry.addr)
    }

    // options

    /// Selects how subsequently accepted connections treat inbound PROXY protocol headers.
    pub fn set_proxy_protocol_in(&self, mode: ProxyProtocolMode) {
        debug!(mode = ?mode, "setting inbound PROXY protocol mode");
        *self
            .state
            .proxy_protocol_in
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = mode;
    }

    // connections

    /// Replaces the rate limit of one connection, effective on its next token acquisition.
    pub fn set_rate_limit(&self, conn_id: u64, limit: RateLimit) -> bool {
        match self.state.registry.connections.get(&conn_id) {
            Some(conn) => {
                conn.limiter.set(limit);
                true
            }
            None => false,
        }
    }

    /// Installs the rate limit applied to each connection at creation.
    pub fn set_default_rate_limit(&self, limit: Option<RateLimit>) {
        self.state.registry.set_global_rate_limit(limit);
    }

    /// Kicks one connection; any suspended io or token wait aborts.
    pub fn disconnect(&self, conn_id: u64) -> bool {
        match self.state.registry.connections.get(&conn_id) {
            Some(conn) => {
                conn.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Kicks every active connection, returning how many were kicked.
    pub fn kick_all(&self) -> usize {
        let mut kicked = 0;
        for conn in self.state.registry.connections.iter() {
            conn.cancel.cancel();
            kicked += 1;
        }
        kicked
    }

    // metrics

    /// A snapshot of the global and per-connection transfer counters.
    pub fn metrics(&self) -> MetricsSnapshot {
        let registry = &self.state.registry;
        let connections = registry
            .connections
            .iter()
            .map(|conn| {
                (
                    conn.id.to_string(),
                    ConnectionMetrics {
                        bytes_sent: conn.bytes_sent.load(Ordering::Relaxed),
                        bytes_recv: conn.bytes_recv.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            total_conn: registry.counters.total_connections.load(Ordering::Relaxed),
            active_conn: registry.active_connections() as u64,
            total_bytes_sent: registry.counters.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_recv: registry.counters.total_bytes_recv.load(Ordering::Relaxed),
            connections,
        }
    }

    /// The transfer counters of one connection.
    pub fn connection_metrics(&self, conn_id: u64) -> Option<ConnectionMetrics> {
        self.state
            .registry
            .connections
            .get(&conn_id)
            .map(|conn| ConnectionMetrics {
                bytes_sent: conn.bytes_sent.load(Ordering::Relaxed),
                bytes_recv: conn.bytes_recv.load(Ordering::Relaxed),
            })
    }

    // events and decisions

    /// Drains all pending requests and events; empty collections mean nothing is pending.
    pub fn poll_events(&self) -> Events {
        let (route_requests, motd_requests, disconnection_events) =
            self.state.registry.drain_events();
        Events {
            route_requests,
            motd_requests,
            disconnection_events,
        }
    }

    /// Resumes the connection waiting on this route decision.
    ///
    /// A submission for an id that is no longer pending is ignored and reported as `false`.
    pub fn submit_route_decision(&self, conn_id: u64, decision: RouteDecision) -> bool {
        self.state.registry.submit_route(conn_id, decision)
    }

    /// Resumes the connection waiting on this MOTD decision.
    ///
    /// A submission for an id that is no longer pending is ignored and reported as `false`.
    pub fn submit_motd_decision(&self, conn_id: u64, decision: MotdDecision) -> bool {
        self.state.registry.submit_motd(conn_id, decision)
    }

    // cache

    /// Sweeps expired cache entries, returning how many were collected.
    pub fn cleanup_cache(&self) -> usize {
        self.state.cache.sweep()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.state.cache.stats()
    }

    // lifecycle

    /// Cancels all listeners and connections and waits for their tasks to drain.
    pub async fn shutdown(&self) {
        info!("engine shutdown requested");
        self.state.shutdown.cancel();
        self.kick_all();
        self.state.tracker.close();
        self.state.tracker.wait().await;
        info!("engine shutdown complete");
    }
}

/// The answer of a poll: everything queued since the previous poll, in FIFO order per queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Events {
    pub route_requests: Vec<RouteRequest>,
    pub motd_requests: Vec<MotdRequest>,
    pub disconnection_events: Vec<DisconnectionEvent>,
}

impl Events {
    pub fn is_empty(&self) -> bool {
        self.route_requests.is_empty()
            && self.motd_requests.is_empty()
            && self.disconnection_events.is_empty()
    }
}

/// The transfer counters of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

/// The aggregate counters reported by the boundary API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_conn: u64,
    pub active_conn: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub connections: BTreeMap<String, ConnectionMetrics>,
}
