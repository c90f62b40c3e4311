//! The accept loop of one listening endpoint and the lifecycle of the tasks it spawns.
//!
//! Each accepted socket gets its own task running the connection pipeline. Bookkeeping that must
//! happen exactly once per connection (registry removal, the disconnection event, the metric
//! decrement) lives in a drop guard, so it also fires when a pipeline panics or is cancelled.

use crate::connection::Pipeline;
use crate::decision::DisconnectionEvent;
use crate::engine::EngineState;
use crate::error::Error;
use crate::metrics;
use crate::proxy_protocol;
use crate::registry::{ConnectionEntry, ListenerEntry};
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

/// Serves one listening endpoint until it is stopped or the engine shuts down.
#[instrument(skip_all, fields(listener_id = entry.id, addr = %entry.addr))]
pub(crate) async fn accept_loop(
    listener: TcpListener,
    entry: Arc<ListenerEntry>,
    state: Arc<EngineState>,
) {
    info!("listener started");
    loop {
        let (stream, addr) = tokio::select! {
            _ = entry.stop.cancelled() => break,
            _ = state.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(cause = err.to_string(), "transient accept error");
                    continue;
                }
                Err(err) => {
                    warn!(cause = err.to_string(), "accept loop failed");
                    break;
                }
            },
        };
        handle(stream, addr, &state);
    }

    state.registry.listeners.remove(&entry.id);
    info!("listener stopped");
}

fn is_transient_accept_error(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

/// Registers the accepted socket and spawns its pipeline task.
fn handle(stream: TcpStream, addr: SocketAddr, state: &Arc<EngineState>) {
    let conn = state.registry.register_connection(addr);
    metrics::accepted_connections::inc();
    metrics::open_connections::inc();
    debug!(conn_id = conn.id, addr = %addr, "accepted connection");

    let state = Arc::clone(state);
    let tracker = state.tracker.clone();
    tracker.spawn(async move {
        let _guard = CleanupGuard {
            conn: Arc::clone(&conn),
            state: Arc::clone(&state),
        };

        let result = tokio::select! {
            _ = conn.cancel.cancelled() => Err(Error::Cancelled),
            _ = state.shutdown.cancelled() => Err(Error::Cancelled),
            result = drive(stream, Arc::clone(&conn), Arc::clone(&state)) => result,
        };

        match result {
            Ok(()) => debug!(conn_id = conn.id, "closed connection"),
            Err(err) if err.is_connection_closed() => {
                debug!(conn_id = conn.id, "connection closed by peer");
            }
            Err(err) => warn!(
                conn_id = conn.id,
                cause = err.to_string(),
                "failure handling connection"
            ),
        }
    });
}

/// Runs PROXY protocol ingestion and the pipeline for one accepted socket.
async fn drive(
    stream: TcpStream,
    conn: Arc<ConnectionEntry>,
    state: Arc<EngineState>,
) -> Result<(), Error> {
    let mode = state.proxy_protocol_in();
    let (stream, proxied) = timeout(state.setup_timeout, proxy_protocol::ingest(stream, mode))
        .await
        .map_err(|_| Error::SetupTimeout)??;

    if let Some(addresses) = proxied {
        debug!(conn_id = conn.id, source = %addresses.source, "rewrote client address");
        conn.set_peer(addresses.source);
    }

    Pipeline::new(
        stream,
        conn,
        Arc::clone(&state.registry),
        Arc::clone(&state.cache),
        state.decision_timeout,
    )
    .run(state.setup_timeout)
    .await
}

/// Runs the once-per-connection teardown, also on panic or cancellation.
struct CleanupGuard {
    conn: Arc<ConnectionEntry>,
    state: Arc<EngineState>,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        self.state.registry.remove_connection(self.conn.id);
        self.state.registry.push_disconnection(DisconnectionEvent {
            conn_id: self.conn.id,
        });
        metrics::open_connections::dec();

        let meta = self
            .conn
            .meta
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        debug!(
            conn_id = self.conn.id,
            peer = %meta.peer,
            protocol = ?meta.protocol,
            host = ?meta.host,
            port = ?meta.port,
            username = ?meta.username,
            duration = ?self.conn.accepted_at.elapsed(),
            "connection finished"
        );
    }
}
