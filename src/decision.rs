//! The JSON shapes exchanged with the policy layer.
//!
//! These types cross the boundary exactly once in each direction: requests and events are
//! serialized when the policy layer polls them, decisions are deserialized on submission. Inside
//! the engine only the strongly typed enums below are passed around.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A routing question for one login-path connection, answered by exactly one [`RouteDecision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRequest {
    /// The connection this request belongs to.
    pub conn_id: u64,
    /// The observed client address (after PROXY protocol rewriting, if any).
    pub peer_ip: String,
    /// The port the client believes it connected to.
    pub port: u16,
    /// The protocol version announced in the handshake.
    pub protocol: i32,
    /// The virtual host requested in the handshake, before any rewrite.
    pub host: String,
    /// The self-reported player name from the login start frame.
    pub username: String,
}

/// A description question for one status-path connection, answered by one [`MotdDecision`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MotdRequest {
    /// The connection this request belongs to.
    pub conn_id: u64,
    /// The observed client address (after PROXY protocol rewriting, if any).
    pub peer_ip: String,
    /// The port the client believes it connected to.
    pub port: u16,
    /// The protocol version announced in the handshake.
    pub protocol: i32,
    /// The virtual host requested in the handshake.
    pub host: String,
}

/// Emitted exactly once per connection after its pipeline has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectionEvent {
    /// The connection that went away.
    pub conn_id: u64,
}

/// The answer of the policy layer to a [`RouteRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RouteDecision {
    /// Turn the client away with a disconnect screen.
    Reject(Rejection),
    /// Forward the connection to a backend.
    Forward(RouteTarget),
}

/// A rejection with the reason shown on the client's disconnect screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Plain text or a raw chat component JSON object.
    pub disconnect: String,
}

/// Where and how to forward an accepted login connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTarget {
    /// The backend host to dial (hostname or IP literal).
    pub remote_host: String,
    /// The backend port to dial.
    pub remote_port: u16,
    /// An optional upstream proxy in the form `socks5://host:port[?user:pass]`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    /// When set, a PROXY protocol header of this version is written to the backend first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_protocol: Option<ProxyProtocolVersion>,
    /// Replaces the `server_address` field in the replayed handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_host: Option<String>,
    /// When set, the decision is memoized for subsequent connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDirective>,
}

impl RouteTarget {
    /// A copy of this target with the cache directive stripped, as stored in the decision cache.
    pub(crate) fn without_cache(&self) -> Self {
        Self {
            cache: None,
            ..self.clone()
        }
    }
}

/// The PROXY protocol generation emitted toward the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ProxyProtocolVersion {
    V1,
    V2,
}

impl From<ProxyProtocolVersion> for u8 {
    fn from(version: ProxyProtocolVersion) -> Self {
        match version {
            ProxyProtocolVersion::V1 => 1,
            ProxyProtocolVersion::V2 => 2,
        }
    }
}

impl TryFrom<u8> for ProxyProtocolVersion {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ProxyProtocolVersion::V1),
            2 => Ok(ProxyProtocolVersion::V2),
            other => Err(format!("unsupported PROXY protocol version: {other}")),
        }
    }
}

/// Instructs the engine to memoize a decision for subsequent connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheDirective {
    /// The client identity the entry is keyed on.
    pub granularity: CacheGranularity,
    /// Entry lifetime in milliseconds.
    pub ttl: u64,
    /// When set, a rejection is cached instead of the decision itself.
    #[serde(default)]
    pub reject: bool,
    /// The reason used for the cached rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<String>,
}

/// The key shape of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheGranularity {
    /// Keyed on the client IP alone.
    Ip,
    /// Keyed on the client IP and the lowercased requested host.
    IpHost,
}

/// The answer of the policy layer to a [`MotdRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MotdDecision {
    /// Close the status connection without responding.
    Reject(Rejection),
    /// Respond with this status document.
    Status(StatusTemplate),
}

/// A server list entry as supplied by the policy layer, with unresolved `"auto"` placeholders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTemplate {
    /// The version information of the advertised server.
    pub version: VersionTemplate,
    /// The player counts and samples of the advertised server.
    pub players: PlayersTemplate,
    /// The description (MOTD), passed through opaquely.
    pub description: serde_json::Value,
    /// An optional favicon data URL, passed through opaquely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    /// When set, the template is memoized for subsequent connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CacheDirective>,
}

impl StatusTemplate {
    /// A copy of this template with the cache directive stripped, as stored in the decision cache.
    pub(crate) fn without_cache(&self) -> Self {
        Self {
            cache: None,
            ..self.clone()
        }
    }

    /// Resolves the `"auto"` placeholders against the requesting connection and produces the
    /// response document.
    ///
    /// Resolution happens at response build time, never at cache store time, so a cached template
    /// keeps tracking the live connection count.
    pub fn render(&self, protocol: i32, online: i64) -> ServerStatus {
        ServerStatus {
            version: ServerVersion {
                name: self.version.name.clone(),
                protocol: self.version.protocol.resolve(protocol),
            },
            players: ServerPlayers {
                max: self.players.max,
                online: self.players.online.resolve(online),
                sample: self
                    .players
                    .sample
                    .iter()
                    .map(SampleEntry::promote)
                    .collect(),
            },
            description: self.description.clone(),
            favicon: self.favicon.clone(),
        }
    }
}

/// The version block of a [`StatusTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionTemplate {
    /// The textual version name to display.
    pub name: String,
    /// The numeric protocol version, or `"auto"` for the client's own version.
    pub protocol: AutoOr<i32>,
}

/// The players block of a [`StatusTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayersTemplate {
    /// The maximum number of players to advertise.
    pub max: i64,
    /// The online count, or `"auto"` for the current active connection count.
    pub online: AutoOr<i64>,
    /// Sampled player entries (version hover), bare strings are promoted on render.
    #[serde(default)]
    pub sample: Vec<SampleEntry>,
}

/// Either a concrete value or the `"auto"` placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AutoOr<T> {
    Value(T),
    Auto(AutoKeyword),
}

impl<T: Copy> AutoOr<T> {
    fn resolve(&self, auto: T) -> T {
        match self {
            AutoOr::Value(value) => *value,
            AutoOr::Auto(_) => auto,
        }
    }
}

/// The literal `"auto"` marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AutoKeyword {
    #[serde(rename = "auto")]
    Auto,
}

/// One sampled player entry, either complete or a bare name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleEntry {
    /// A complete entry with name and id.
    Player { name: String, id: String },
    /// A bare name, promoted to an entry with the zero UUID.
    Name(String),
}

impl SampleEntry {
    fn promote(&self) -> ServerPlayer {
        match self {
            SampleEntry::Player { name, id } => ServerPlayer {
                name: name.clone(),
                id: id.clone(),
            },
            SampleEntry::Name(name) => ServerPlayer {
                name: name.clone(),
                id: Uuid::nil().to_string(),
            },
        }
    }
}

/// The resolved status document written into the Status Response packet.
#[derive(Debug, Serialize)]
pub struct ServerStatus {
    /// The version and protocol information of the server.
    pub version: ServerVersion,
    /// The current, maximum and sampled players of the server.
    pub players: ServerPlayers,
    /// The description (MOTD) of this server.
    pub description: serde_json::Value,
    /// The optional favicon of the server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
}

/// The information on the protocol version of a server.
#[derive(Debug, Serialize)]
pub struct ServerVersion {
    /// The textual protocol version to display this version visually.
    pub name: String,
    /// The numeric protocol version (for compatibility checking).
    pub protocol: i32,
}

/// The information on the current, maximum and sampled players.
#[derive(Debug, Serialize)]
pub struct ServerPlayers {
    /// The maximum number of players that can join (slots).
    pub max: i64,
    /// The current number of players that are online at this moment.
    pub online: i64,
    /// The list of player information samples (version hover).
    pub sample: Vec<ServerPlayer>,
}

/// The information on a single, sampled player entry.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct ServerPlayer {
    /// The visual name to display this player.
    pub name: String,
    /// The unique identifier to reference this player.
    pub id: String,
}

/// Wraps a plain text reason into a chat component, leaving raw components untouched.
pub(crate) fn chat_component(reason: &str) -> String {
    if reason.trim_start().starts_with('{') {
        reason.to_string()
    } else {
        serde_json::json!({ "text": reason }).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_decision_reject_shape() {
        let decision: RouteDecision =
            serde_json::from_str(r#"{"disconnect": "§cnope"}"#).expect("parse failed");
        assert_eq!(
            decision,
            RouteDecision::Reject(Rejection {
                disconnect: "§cnope".to_string()
            })
        );
    }

    #[test]
    fn route_decision_forward_shape() {
        let decision: RouteDecision = serde_json::from_str(
            r#"{
                "remoteHost": "127.0.0.1",
                "remotePort": 25566,
                "proxy": "socks5://relay:1080?user:pass",
                "proxyProtocol": 2,
                "rewriteHost": "backend.internal",
                "cache": {"granularity": "IpHost", "ttl": 3000}
            }"#,
        )
        .expect("parse failed");

        let RouteDecision::Forward(target) = decision else {
            panic!("expected a forward decision");
        };
        assert_eq!(target.remote_host, "127.0.0.1");
        assert_eq!(target.remote_port, 25566);
        assert_eq!(target.proxy_protocol, Some(ProxyProtocolVersion::V2));
        assert_eq!(target.rewrite_host.as_deref(), Some("backend.internal"));
        let cache = target.cache.expect("missing cache directive");
        assert_eq!(cache.granularity, CacheGranularity::IpHost);
        assert_eq!(cache.ttl, 3000);
        assert!(!cache.reject);
    }

    #[test]
    fn route_decision_rejects_unknown_proxy_protocol() {
        let result: Result<RouteDecision, _> =
            serde_json::from_str(r#"{"remoteHost": "h", "remotePort": 1, "proxyProtocol": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn motd_decision_resolves_auto_placeholders() {
        let decision: MotdDecision = serde_json::from_str(
            r#"{
                "version": {"name": "x", "protocol": "auto"},
                "players": {"max": 100, "online": "auto", "sample": ["steve", {"name": "alex", "id": "y"}]},
                "description": {"text": "hi"}
            }"#,
        )
        .expect("parse failed");

        let MotdDecision::Status(template) = decision else {
            panic!("expected a status decision");
        };
        let status = template.render(47, 3);
        assert_eq!(status.version.protocol, 47);
        assert_eq!(status.players.online, 3);
        assert_eq!(status.players.max, 100);
        assert_eq!(
            status.players.sample[0],
            ServerPlayer {
                name: "steve".to_string(),
                id: "00000000-0000-0000-0000-000000000000".to_string()
            }
        );
        assert_eq!(status.players.sample[1].name, "alex");
    }

    #[test]
    fn motd_decision_keeps_concrete_values() {
        let decision: MotdDecision = serde_json::from_str(
            r#"{
                "version": {"name": "x", "protocol": 762},
                "players": {"max": 10, "online": 7},
                "description": {"text": "hi"}
            }"#,
        )
        .expect("parse failed");

        let MotdDecision::Status(template) = decision else {
            panic!("expected a status decision");
        };
        let status = template.render(47, 3);
        assert_eq!(status.version.protocol, 762);
        assert_eq!(status.players.online, 7);
        assert!(status.players.sample.is_empty());
    }

    #[test]
    fn request_shapes_use_camel_case_keys() {
        let request = RouteRequest {
            conn_id: 7,
            peer_ip: "10.0.0.1".to_string(),
            port: 25565,
            protocol: 47,
            host: "mc.example.com".to_string(),
            username: "tester".to_string(),
        };
        let json = serde_json::to_value(&request).expect("serialize failed");
        assert_eq!(
            json,
            serde_json::json!({
                "connId": 7,
                "peerIp": "10.0.0.1",
                "port": 25565,
                "protocol": 47,
                "host": "mc.example.com",
                "username": "tester"
            })
        );

        let event = DisconnectionEvent { conn_id: 7 };
        assert_eq!(
            serde_json::to_value(event).expect("serialize failed"),
            serde_json::json!({ "connId": 7 })
        );
    }

    #[test]
    fn chat_component_wraps_plain_text() {
        assert_eq!(chat_component("nope"), r#"{"text":"nope"}"#);
        assert_eq!(
            chat_component(r#"{"text":"styled","color":"red"}"#),
            r#"{"text":"styled","color":"red"}"#
        );
    }
}
