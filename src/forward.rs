//! The bidirectional forward loop between an accepted client and its backend.
//!
//! Each direction runs in its own task and is metered: chunks of at most 4096 bytes are read,
//! tokens for the chunk are acquired from the direction's bucket, then the chunk is written to
//! the peer and accounted. EOF on one direction shuts down writing on the peer while the opposite
//! direction keeps running; an io error or a cancellation ends both halves silently.

use crate::limiter::MAX_ACQUIRE;
use crate::metrics;
use crate::registry::{ConnectionEntry, Registry};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const CHUNK_SIZE: usize = MAX_ACQUIRE as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client toward backend, metered by the `send` bucket.
    Serverbound,
    /// Backend toward client, metered by the `recv` bucket.
    Clientbound,
}

/// Runs the forward loop until both directions have ended.
pub(crate) async fn run<C, B>(
    client: C,
    backend: B,
    conn: Arc<ConnectionEntry>,
    registry: Arc<Registry>,
) where
    C: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (backend_read, backend_write) = tokio::io::split(backend);

    // an error in either half stops the other through this token
    let halt = conn.cancel.child_token();

    let serverbound = spawn_half(
        client_read,
        backend_write,
        Direction::Serverbound,
        Arc::clone(&conn),
        Arc::clone(&registry),
        halt.clone(),
    );
    let clientbound = spawn_half(
        backend_read,
        client_write,
        Direction::Clientbound,
        conn,
        registry,
        halt,
    );

    let _ = tokio::join!(serverbound, clientbound);
}

fn spawn_half<R, W>(
    from: ReadHalf<R>,
    to: WriteHalf<W>,
    direction: Direction,
    conn: Arc<ConnectionEntry>,
    registry: Arc<Registry>,
    halt: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Send + 'static,
    W: AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            _ = halt.cancelled() => {}
            result = pump(from, to, direction, &conn, &registry) => {
                if let Err(err) = result {
                    debug!(
                        conn_id = conn.id,
                        direction = ?direction,
                        cause = err.to_string(),
                        "forward half ended with an io error"
                    );
                    halt.cancel();
                }
            }
        }
    })
}

async fn pump<R, W>(
    mut from: ReadHalf<R>,
    mut to: WriteHalf<W>,
    direction: Direction,
    conn: &ConnectionEntry,
    registry: &Registry,
) -> std::io::Result<()>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let amount = from.read(&mut buffer).await?;
        if amount == 0 {
            // propagate the EOF, the opposite direction keeps running
            to.shutdown().await?;
            return Ok(());
        }

        let bucket = match direction {
            Direction::Serverbound => conn.limiter.send(),
            Direction::Clientbound => conn.limiter.recv(),
        };
        bucket.acquire(amount as u64).await;

        to.write_all(&buffer[..amount]).await?;
        trace!(conn_id = conn.id, direction = ?direction, amount, "forwarded chunk");

        match direction {
            Direction::Serverbound => {
                conn.bytes_sent.fetch_add(amount as u64, Ordering::Relaxed);
                registry
                    .counters
                    .total_bytes_sent
                    .fetch_add(amount as u64, Ordering::Relaxed);
                metrics::forwarded_bytes::record_serverbound(amount as u64);
            }
            Direction::Clientbound => {
                conn.bytes_recv.fetch_add(amount as u64, Ordering::Relaxed);
                registry
                    .counters
                    .total_bytes_recv
                    .fetch_add(amount as u64, Ordering::Relaxed);
                metrics::forwarded_bytes::record_clientbound(amount as u64);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::RateLimit;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tokio::time::{Duration, Instant};

    fn fixtures() -> (Arc<Registry>, Arc<ConnectionEntry>) {
        let registry = Arc::new(Registry::new());
        let conn =
            registry.register_connection(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 45000));
        (registry, conn)
    }

    #[tokio::test]
    async fn bytes_flow_in_both_directions_and_are_accounted() {
        let (registry, conn) = fixtures();
        let (mut client, client_remote) = tokio::io::duplex(8192);
        let (backend_local, mut backend) = tokio::io::duplex(8192);

        let forward = tokio::spawn(run(
            client_remote,
            backend_local,
            Arc::clone(&conn),
            Arc::clone(&registry),
        ));

        client.write_all(b"to backend").await.expect("write failed");
        let mut buf = [0u8; 10];
        backend.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"to backend");

        backend.write_all(b"to client!!!").await.expect("write failed");
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.expect("read failed");
        assert_eq!(&buf, b"to client!!!");

        assert_eq!(conn.bytes_sent.load(Ordering::Relaxed), 10);
        assert_eq!(conn.bytes_recv.load(Ordering::Relaxed), 12);
        assert_eq!(
            registry.counters.total_bytes_sent.load(Ordering::Relaxed),
            10
        );
        assert_eq!(
            registry.counters.total_bytes_recv.load(Ordering::Relaxed),
            12
        );

        drop(client);
        drop(backend);
        forward.await.expect("forward task failed");
    }

    #[tokio::test]
    async fn cancellation_ends_both_halves() {
        let (registry, conn) = fixtures();
        let (_client, client_remote) = tokio::io::duplex(64);
        let (backend_local, _backend) = tokio::io::duplex(64);

        let forward = tokio::spawn(run(
            client_remote,
            backend_local,
            Arc::clone(&conn),
            registry,
        ));

        conn.cancel.cancel();
        forward.await.expect("forward task failed");
    }

    #[tokio::test(start_paused = true)]
    async fn serverbound_transfer_respects_the_send_bucket() {
        let (registry, conn) = fixtures();
        conn.limiter.set(RateLimit {
            send_avg: 1024,
            send_burst: 1024,
            recv_avg: 0,
            recv_burst: 0,
        });

        let (mut client, client_remote) = tokio::io::duplex(16 * 1024);
        let (backend_local, mut backend) = tokio::io::duplex(16 * 1024);
        let forward = tokio::spawn(run(client_remote, backend_local, conn, registry));

        let payload = vec![0xABu8; 4096];
        let started = Instant::now();
        client.write_all(&payload).await.expect("write failed");

        let mut received = vec![0u8; 4096];
        backend.read_exact(&mut received).await.expect("read failed");

        // 4096 bytes through a 1024 B/s bucket with 1024 B burst needs at least 3 s
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(received, payload);

        drop(client);
        drop(backend);
        forward.await.expect("forward task failed");
    }
}
