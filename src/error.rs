use crate::{outbound, proxy_protocol};
use std::io::ErrorKind;

/// The internal error type for everything that can end a gateway connection.
///
/// Most variants terminate only the connection they occurred on. The sole fatal variant is
/// [`Error::Bind`], which is surfaced from listener creation to the caller of the boundary API.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error occurred while reading or writing to one of the connection's byte streams.
    #[error("error reading or writing data: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent data that does not form a valid Minecraft frame.
    #[error(transparent)]
    Packets(#[from] geofront_packets::Error),

    /// A value crossing the policy boundary could not be serialized.
    #[error("invalid JSON at the policy boundary: {0}")]
    Json(#[from] serde_json::Error),

    /// The inbound PROXY protocol header was missing, malformed or unexpected.
    #[error(transparent)]
    ProxyProtocol(#[from] proxy_protocol::Error),

    /// The backend connection could not be established.
    #[error(transparent)]
    Dial(#[from] outbound::Error),

    /// The client violated the protocol state machine.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// The listener socket could not be bound.
    #[error("could not bind listener: {0}")]
    Bind(std::io::Error),

    /// The connection did not reach the forward loop before its deadline.
    #[error("connection setup deadline exceeded")]
    SetupTimeout,

    /// The connection was cancelled by the boundary API or engine shutdown.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this error is a routine disconnect rather than a failure worth logging.
    pub fn is_connection_closed(&self) -> bool {
        match self {
            Error::Io(err) => {
                err.kind() == ErrorKind::UnexpectedEof
                    || err.kind() == ErrorKind::ConnectionReset
                    || err.kind() == ErrorKind::ConnectionAborted
                    || err.kind() == ErrorKind::BrokenPipe
            }
            Error::Packets(err) => err.is_connection_closed(),
            Error::Cancelled => true,
            _ => false,
        }
    }
}
