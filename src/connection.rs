//! The per-connection pipeline from the first frame to the forward loop.
//!
//! One pipeline runs per accepted connection: it parses the handshake, branches into the status
//! or login flow, parks on the policy decision, and for accepted logins dials the backend,
//! replays the (possibly rewritten) handshake plus the original login start bytes, and hands both
//! sockets to the forwarder. All phases before the forward loop run under a setup deadline.

use crate::cache::DecisionCache;
use crate::decision::{
    MotdDecision, MotdRequest, ProxyProtocolVersion, Rejection, RouteDecision, RouteRequest,
    RouteTarget, chat_component,
};
use crate::error::Error;
use crate::forward;
use crate::outbound;
use crate::proxy_protocol::{self, ProxiedAddresses};
use crate::registry::{ConnectionEntry, Registry};
use geofront_packets::handshake::serverbound::HandshakePacket;
use geofront_packets::login::clientbound::DisconnectPacket;
use geofront_packets::login::serverbound::LoginStartPacket;
use geofront_packets::status::clientbound::{PongPacket, StatusResponsePacket};
use geofront_packets::status::serverbound::{PingPacket, StatusRequestPacket};
use geofront_packets::{
    AsyncReadPacket, AsyncWritePacket, NextState, Packet, RawPacket, ReadPacket,
};
use std::io::Cursor;
use std::sync::Arc;
use std::sync::PoisonError;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{Duration, timeout};
use tracing::{debug, instrument, warn};

/// The reason shown when no decision arrived before the deadline.
const ROUTER_TIMEOUT_REASON: &str = "router timeout";

/// The reason shown when the backend could not be dialed.
const BACKEND_UNAVAILABLE_REASON: &str = "backend unavailable";

/// The per-connection state passed through all pipeline phases.
pub(crate) struct Pipeline<S> {
    stream: S,
    conn: Arc<ConnectionEntry>,
    registry: Arc<Registry>,
    cache: Arc<DecisionCache>,
    decision_timeout: Duration,
}

/// Everything needed to enter the forward loop after a successful login setup.
struct Forwarding {
    backend: TcpStream,
}

impl<S> Pipeline<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
{
    pub fn new(
        stream: S,
        conn: Arc<ConnectionEntry>,
        registry: Arc<Registry>,
        cache: Arc<DecisionCache>,
        decision_timeout: Duration,
    ) -> Self {
        Self {
            stream,
            conn,
            registry,
            cache,
            decision_timeout,
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// The phases up to and including backend establishment run under `setup_deadline`; the
    /// forward loop itself is unbounded.
    #[instrument(skip_all, fields(conn_id = self.conn.id))]
    pub async fn run(mut self, setup_deadline: Duration) -> Result<(), Error> {
        let forwarding = match timeout(setup_deadline, self.setup()).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::SetupTimeout),
        };

        let Some(forwarding) = forwarding else {
            return Ok(());
        };

        forward::run(
            self.stream,
            forwarding.backend,
            Arc::clone(&self.conn),
            Arc::clone(&self.registry),
        )
        .await;

        Ok(())
    }

    /// Handles everything before the forward loop; `None` means the connection is finished.
    async fn setup(&mut self) -> Result<Option<Forwarding>, Error> {
        let handshake: HandshakePacket = self.stream.read_packet().await?;
        debug!(packet = ?handshake, "received handshake packet");

        {
            let mut meta = self.conn.meta.lock().unwrap_or_else(PoisonError::into_inner);
            meta.protocol = Some(handshake.protocol_version);
            meta.host = Some(handshake.server_address.clone());
            meta.port = Some(handshake.server_port);
        }

        match handshake.next_state {
            NextState::Status => {
                self.serve_status(&handshake).await?;
                Ok(None)
            }
            NextState::Login => self.serve_login(&handshake).await,
        }
    }

    // status flow

    async fn serve_status(&mut self, handshake: &HandshakePacket) -> Result<(), Error> {
        let request: StatusRequestPacket = self.stream.read_packet().await?;
        debug!(packet = ?request, "received status request packet");

        let decision = self.motd_decision(handshake).await?;
        let template = match decision {
            MotdDecision::Status(template) => template,
            MotdDecision::Reject(rejection) => {
                // the status flow has no in-band reject frame
                debug!(reason = rejection.disconnect, "status connection rejected");
                return Ok(());
            }
        };

        // "auto" placeholders resolve against the live state, excluding this status connection
        let online = self.registry.active_connections().saturating_sub(1) as i64;
        let status = template.render(handshake.protocol_version, online);
        let response = StatusResponsePacket {
            body: serde_json::to_string(&status)?,
        };
        debug!(packet = ?response, "sending status response packet");
        self.stream.write_packet(response).await?;

        // the ping exchange is optional, clients may simply close
        let ping: PingPacket = match self.stream.read_packet().await {
            Ok(ping) => ping,
            Err(err) if err.is_connection_closed() => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        debug!(packet = ?ping, "received ping packet");
        self.stream
            .write_packet(PongPacket {
                payload: ping.payload,
            })
            .await?;

        Ok(())
    }

    async fn motd_decision(&mut self, handshake: &HandshakePacket) -> Result<MotdDecision, Error> {
        let ip = self.conn.peer().ip();
        let host = handshake.server_address.as_str();

        if let Some(hit) = self.cache.lookup_motd(ip, host) {
            debug!("using cached motd decision");
            return Ok(hit);
        }

        let receiver = self.registry.push_motd_request(MotdRequest {
            conn_id: self.conn.id,
            peer_ip: ip.to_string(),
            port: handshake.server_port,
            protocol: handshake.protocol_version,
            host: host.to_string(),
        });

        let decision = match timeout(self.decision_timeout, receiver).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => MotdDecision::Reject(Rejection {
                disconnect: ROUTER_TIMEOUT_REASON.to_string(),
            }),
        };

        if let MotdDecision::Status(template) = &decision
            && let Some(directive) = &template.cache
        {
            self.cache.store_motd(ip, host, template, directive);
        }

        Ok(decision)
    }

    // login flow

    async fn serve_login(
        &mut self,
        handshake: &HandshakePacket,
    ) -> Result<Option<Forwarding>, Error> {
        // the login start frame is retained raw so the backend sees the exact original bytes
        let raw = self.stream.read_raw_packet().await?;
        if raw.id != LoginStartPacket::ID {
            return Err(geofront_packets::Error::IllegalPacketId {
                expected: LoginStartPacket::ID,
                actual: raw.id,
            }
            .into());
        }
        let login_start =
            LoginStartPacket::read_from_buffer(&mut Cursor::new(&raw.body)).await?;
        debug!(user_name = login_start.user_name, "received login start packet");

        if login_start.user_name.is_empty() {
            self.disconnect("protocol violation").await?;
            return Err(Error::ProtocolViolation("zero-length username"));
        }
        self.conn
            .meta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .username = Some(login_start.user_name.clone());

        let decision = self.route_decision(handshake, &login_start).await?;
        let target = match decision {
            RouteDecision::Forward(target) => target,
            RouteDecision::Reject(rejection) => {
                debug!(reason = rejection.disconnect, "login connection rejected");
                self.disconnect(&rejection.disconnect).await?;
                return Ok(None);
            }
        };

        let backend = match self.establish_backend(handshake, &raw, &target).await {
            Ok(backend) => backend,
            Err(err) => {
                warn!(
                    cause = err.to_string(),
                    host = target.remote_host,
                    port = target.remote_port,
                    "backend establishment failed"
                );
                self.disconnect(BACKEND_UNAVAILABLE_REASON).await?;
                return Ok(None);
            }
        };

        Ok(Some(Forwarding { backend }))
    }

    async fn route_decision(
        &mut self,
        handshake: &HandshakePacket,
        login_start: &LoginStartPacket,
    ) -> Result<RouteDecision, Error> {
        let ip = self.conn.peer().ip();
        let host = handshake.server_address.as_str();

        if let Some(hit) = self.cache.lookup_route(ip, host) {
            debug!("using cached route decision");
            return Ok(hit);
        }

        let receiver = self.registry.push_route_request(RouteRequest {
            conn_id: self.conn.id,
            peer_ip: ip.to_string(),
            port: handshake.server_port,
            protocol: handshake.protocol_version,
            host: host.to_string(),
            username: login_start.user_name.clone(),
        });

        let decision = match timeout(self.decision_timeout, receiver).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => return Err(Error::Cancelled),
            Err(_) => RouteDecision::Reject(Rejection {
                disconnect: ROUTER_TIMEOUT_REASON.to_string(),
            }),
        };

        if let RouteDecision::Forward(target) = &decision
            && let Some(directive) = &target.cache
        {
            self.cache.store_route(ip, host, target, directive);
        }

        Ok(decision)
    }

    /// Dials the backend, emits the optional PROXY header and replays handshake and login start.
    async fn establish_backend(
        &mut self,
        handshake: &HandshakePacket,
        login_start_raw: &RawPacket,
        target: &RouteTarget,
    ) -> Result<TcpStream, Error> {
        let mut backend = outbound::dial(
            &target.remote_host,
            target.remote_port,
            target.proxy.as_deref(),
        )
        .await?;

        if let Some(version) = target.proxy_protocol {
            let addresses = ProxiedAddresses {
                source: self.conn.peer(),
                destination: backend.local_addr().map_err(outbound::Error::Io)?,
            };
            match version {
                ProxyProtocolVersion::V1 => {
                    proxy_protocol::write_v1(&mut backend, addresses).await?
                }
                ProxyProtocolVersion::V2 => {
                    proxy_protocol::write_v2(&mut backend, addresses).await?
                }
            }
        }

        // the handshake is re-serialized with the rewritten host and the real backend port
        let replay = HandshakePacket {
            protocol_version: handshake.protocol_version,
            server_address: target
                .rewrite_host
                .clone()
                .unwrap_or_else(|| handshake.server_address.clone()),
            server_port: target.remote_port,
            next_state: NextState::Login,
        };
        debug!(packet = ?replay, "replaying handshake to backend");
        backend.write_packet(replay).await?;
        backend.write_raw_packet(login_start_raw).await?;

        Ok(backend)
    }

    async fn disconnect(&mut self, reason: &str) -> Result<(), Error> {
        let packet = DisconnectPacket {
            reason: chat_component(reason),
        };
        debug!(packet = ?packet, "sending disconnect packet");
        self.stream.write_packet(packet).await?;

        Ok(())
    }
}
