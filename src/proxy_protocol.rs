//! PROXY protocol support on both edges of the gateway.
//!
//! Inbound, listeners can accept HAProxy v1/v2 headers from a fronting load balancer and rewrite
//! the observed client address. Outbound, the engine can emit a v1/v2 header toward the backend
//! when a route decision requests it.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// The 12 byte signature every v2 header starts with.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// The ASCII prefix every v1 header starts with.
pub const V1_PREFIX: [u8; 6] = *b"PROXY ";

/// The max length in bytes of a complete v1 header line.
const V1_MAX_LENGTH: usize = 107;

/// How a listener treats inbound PROXY protocol headers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocolMode {
    /// Never parse; a connection starting with a PROXY signature is dropped.
    #[default]
    None,
    /// Parse a header when one is present, pass the stream through untouched otherwise.
    Optional,
    /// A header must be present; its absence is a framing error.
    Strict,
}

/// Error type for PROXY protocol parsing and emission.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error while reading PROXY protocol header: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid PROXY protocol header: {0}")]
    InvalidHeader(String),

    #[error("missing PROXY protocol header in strict mode")]
    MissingHeader,

    #[error("unexpected PROXY protocol header with mode \"none\"")]
    UnexpectedHeader,
}

/// The address pair conveyed by a PROXY protocol header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedAddresses {
    /// The original client endpoint.
    pub source: SocketAddr,
    /// The endpoint the client originally connected to.
    pub destination: SocketAddr,
}

/// A stream that replays already consumed sniff bytes before reading from the inner stream.
#[derive(Debug)]
pub struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let amount = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..amount]);
            this.offset += amount;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sniff {
    V1,
    V2,
    Partial,
    Absent,
}

/// Classifies the consumed prefix against both header signatures.
fn sniff(buf: &[u8]) -> Sniff {
    if buf.len() >= V2_SIGNATURE.len() && buf[..V2_SIGNATURE.len()] == V2_SIGNATURE {
        return Sniff::V2;
    }
    if buf.len() >= V1_PREFIX.len() && buf[..V1_PREFIX.len()] == V1_PREFIX {
        return Sniff::V1;
    }
    let v1_possible = buf.len() < V1_PREFIX.len() && V1_PREFIX[..buf.len()] == *buf;
    let v2_possible = buf.len() < V2_SIGNATURE.len() && V2_SIGNATURE[..buf.len()] == *buf;
    if v1_possible || v2_possible {
        Sniff::Partial
    } else {
        Sniff::Absent
    }
}

/// Consumes a possible PROXY protocol header from a fresh inbound stream according to `mode`.
///
/// Returns the stream (with any non-header bytes replayed in front) and the conveyed addresses
/// when a header carrying them was present. The sniff reads one byte at a time so a connection
/// whose first frame happens to share a signature prefix is never over-read.
pub(crate) async fn ingest<S>(
    mut stream: S,
    mode: ProxyProtocolMode,
) -> Result<(Rewind<S>, Option<ProxiedAddresses>), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut consumed = Vec::with_capacity(V2_SIGNATURE.len());
    let version = loop {
        match sniff(&consumed) {
            Sniff::V1 => break 1,
            Sniff::V2 => break 2,
            Sniff::Absent => {
                return match mode {
                    ProxyProtocolMode::Strict => Err(Error::MissingHeader),
                    _ => Ok((Rewind::new(consumed, stream), None)),
                };
            }
            Sniff::Partial => {
                let mut byte = [0u8; 1];
                stream.read_exact(&mut byte).await?;
                consumed.push(byte[0]);
            }
        }
    };

    if mode == ProxyProtocolMode::None {
        return Err(Error::UnexpectedHeader);
    }

    let addresses = if version == 1 {
        read_v1_rest(&mut stream).await?
    } else {
        read_v2_rest(&mut stream).await?
    };
    debug!(addresses = ?addresses, version, "parsed inbound PROXY protocol header");

    Ok((Rewind::new(Vec::new(), stream), addresses))
}

/// Reads a v1 header after its `PROXY ` prefix has been consumed.
///
/// Format: `PROXY TCP4/TCP6 source_ip dest_ip source_port dest_port\r\n`.
async fn read_v1_rest<S>(stream: &mut S) -> Result<Option<ProxiedAddresses>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(V1_MAX_LENGTH);
    let mut byte = [0u8; 1];
    loop {
        if line.len() > V1_MAX_LENGTH {
            return Err(Error::InvalidHeader("v1 header line too long".to_string()));
        }
        stream.read_exact(&mut byte).await?;
        line.push(byte[0]);
        if line.ends_with(b"\r\n") {
            break;
        }
    }

    let line = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| Error::InvalidHeader("v1 header is not ASCII".to_string()))?;
    let parts: Vec<&str> = line.split(' ').collect();

    match parts.first() {
        Some(&"UNKNOWN") => return Ok(None),
        Some(&"TCP4" | &"TCP6") => {}
        _ => {
            return Err(Error::InvalidHeader(format!(
                "unsupported v1 protocol family: {line}"
            )));
        }
    }
    if parts.len() != 5 {
        return Err(Error::InvalidHeader(format!(
            "v1 header has {} parts instead of 5",
            parts.len()
        )));
    }

    let source = parse_v1_addr(parts[1], parts[3])?;
    let destination = parse_v1_addr(parts[2], parts[4])?;
    if (parts[0] == "TCP4") != source.is_ipv4() || source.is_ipv4() != destination.is_ipv4() {
        return Err(Error::InvalidHeader(format!(
            "v1 address family mismatch: {line}"
        )));
    }

    Ok(Some(ProxiedAddresses {
        source,
        destination,
    }))
}

fn parse_v1_addr(ip: &str, port: &str) -> Result<SocketAddr, Error> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| Error::InvalidHeader(format!("invalid v1 address: {ip}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidHeader(format!("invalid v1 port: {port}")))?;
    Ok(SocketAddr::new(ip, port))
}

/// Reads a v2 header after its 12 byte signature has been consumed.
async fn read_v2_rest<S>(stream: &mut S) -> Result<Option<ProxiedAddresses>, Error>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    let version = (head[0] & 0xF0) >> 4;
    let command = head[0] & 0x0F;
    if version != 2 {
        return Err(Error::InvalidHeader(format!(
            "unsupported v2 version nibble: {version}"
        )));
    }
    if command > 1 {
        return Err(Error::InvalidHeader(format!(
            "unsupported v2 command: {command}"
        )));
    }

    let family = (head[1] & 0xF0) >> 4;
    let protocol = head[1] & 0x0F;
    let length = u16::from_be_bytes([head[2], head[3]]) as usize;

    let mut payload = vec![0u8; length];
    stream.read_exact(&mut payload).await?;

    // LOCAL carries no meaningful addresses (health checks)
    if command == 0 {
        return Ok(None);
    }

    match (family, protocol) {
        // AF_INET, STREAM
        (0x1, 0x1) => {
            if payload.len() < 12 {
                return Err(Error::InvalidHeader(
                    "v2 IPv4 address block too short".to_string(),
                ));
            }
            let src_ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let dst_ip = Ipv4Addr::new(payload[4], payload[5], payload[6], payload[7]);
            let src_port = u16::from_be_bytes([payload[8], payload[9]]);
            let dst_port = u16::from_be_bytes([payload[10], payload[11]]);
            Ok(Some(ProxiedAddresses {
                source: SocketAddr::new(src_ip.into(), src_port),
                destination: SocketAddr::new(dst_ip.into(), dst_port),
            }))
        }
        // AF_INET6, STREAM
        (0x2, 0x1) => {
            if payload.len() < 36 {
                return Err(Error::InvalidHeader(
                    "v2 IPv6 address block too short".to_string(),
                ));
            }
            let mut src = [0u8; 16];
            let mut dst = [0u8; 16];
            src.copy_from_slice(&payload[0..16]);
            dst.copy_from_slice(&payload[16..32]);
            let src_port = u16::from_be_bytes([payload[32], payload[33]]);
            let dst_port = u16::from_be_bytes([payload[34], payload[35]]);
            Ok(Some(ProxiedAddresses {
                source: SocketAddr::new(Ipv6Addr::from(src).into(), src_port),
                destination: SocketAddr::new(Ipv6Addr::from(dst).into(), dst_port),
            }))
        }
        // AF_UNSPEC
        (0x0, _) => Ok(None),
        _ => Err(Error::InvalidHeader(format!(
            "unsupported v2 family/protocol combination: {family}/{protocol}"
        ))),
    }
}

/// Promotes both addresses to IPv6 when their families differ, as required by both wire formats.
fn align_families(addresses: ProxiedAddresses) -> ProxiedAddresses {
    if addresses.source.is_ipv4() == addresses.destination.is_ipv4() {
        return addresses;
    }
    let promote = |addr: SocketAddr| match addr.ip() {
        IpAddr::V4(ip) => SocketAddr::new(ip.to_ipv6_mapped().into(), addr.port()),
        IpAddr::V6(_) => addr,
    };
    ProxiedAddresses {
        source: promote(addresses.source),
        destination: promote(addresses.destination),
    }
}

/// Writes a v1 header line for the supplied address pair.
pub(crate) async fn write_v1<S>(stream: &mut S, addresses: ProxiedAddresses) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let addresses = align_families(addresses);
    let family = if addresses.source.is_ipv4() {
        "TCP4"
    } else {
        "TCP6"
    };
    let line = format!(
        "PROXY {family} {} {} {} {}\r\n",
        addresses.source.ip(),
        addresses.destination.ip(),
        addresses.source.port(),
        addresses.destination.port()
    );
    stream.write_all(line.as_bytes()).await?;

    Ok(())
}

/// Writes a binary v2 header with the PROXY command for the supplied address pair.
pub(crate) async fn write_v2<S>(stream: &mut S, addresses: ProxiedAddresses) -> Result<(), Error>
where
    S: AsyncWrite + Unpin,
{
    let addresses = align_families(addresses);

    let mut header = Vec::with_capacity(52);
    header.extend_from_slice(&V2_SIGNATURE);
    // version 2, command PROXY
    header.push(0x21);

    match (addresses.source.ip(), addresses.destination.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            // AF_INET, STREAM
            header.push(0x11);
            header.extend_from_slice(&12u16.to_be_bytes());
            header.extend_from_slice(&src.octets());
            header.extend_from_slice(&dst.octets());
            header.extend_from_slice(&addresses.source.port().to_be_bytes());
            header.extend_from_slice(&addresses.destination.port().to_be_bytes());
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            // AF_INET6, STREAM
            header.push(0x21);
            header.extend_from_slice(&36u16.to_be_bytes());
            header.extend_from_slice(&src.octets());
            header.extend_from_slice(&dst.octets());
            header.extend_from_slice(&addresses.source.port().to_be_bytes());
            header.extend_from_slice(&addresses.destination.port().to_be_bytes());
        }
        _ => {
            return Err(Error::InvalidHeader(
                "mixed address families after alignment".to_string(),
            ));
        }
    }

    stream.write_all(&header).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn addr(literal: &str) -> SocketAddr {
        literal.parse().expect("invalid address literal")
    }

    fn pair(source: &str, destination: &str) -> ProxiedAddresses {
        ProxiedAddresses {
            source: addr(source),
            destination: addr(destination),
        }
    }

    async fn ingest_bytes(
        bytes: &[u8],
        mode: ProxyProtocolMode,
    ) -> Result<(Vec<u8>, Option<ProxiedAddresses>), Error> {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(bytes).await.expect("write failed");
        drop(server);

        let (mut stream, addresses) = ingest(client, mode).await?;
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.expect("read failed");
        Ok((rest, addresses))
    }

    #[tokio::test]
    async fn v1_roundtrip_preserves_addresses() {
        let expected = pair("192.168.1.100:12345", "10.0.0.1:25565");

        let mut wire: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        write_v1(&mut wire, expected).await.expect("write failed");

        let (rest, addresses) = ingest_bytes(wire.get_ref(), ProxyProtocolMode::Strict)
            .await
            .expect("ingest failed");
        assert!(rest.is_empty());
        assert_eq!(addresses, Some(expected));
    }

    #[tokio::test]
    async fn v2_roundtrip_preserves_addresses() {
        for expected in [
            pair("192.168.1.100:12345", "10.0.0.1:25565"),
            pair("[2001:db8::1]:54321", "[2001:db8::2]:25565"),
        ] {
            let mut wire: Cursor<Vec<u8>> = Cursor::new(Vec::new());
            write_v2(&mut wire, expected).await.expect("write failed");

            let (rest, addresses) = ingest_bytes(wire.get_ref(), ProxyProtocolMode::Strict)
                .await
                .expect("ingest failed");
            assert!(rest.is_empty());
            assert_eq!(addresses, Some(expected));
        }
    }

    #[tokio::test]
    async fn mixed_families_are_promoted_to_ipv6() {
        let mut wire: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        write_v1(&mut wire, pair("192.168.1.100:12345", "[2001:db8::2]:25565"))
            .await
            .expect("write failed");

        let line = String::from_utf8(wire.into_inner()).expect("not utf-8");
        assert!(line.starts_with("PROXY TCP6 ::ffff:192.168.1.100 2001:db8::2 "));
    }

    #[tokio::test]
    async fn optional_mode_passes_other_traffic_through() {
        let payload = [0x10u8, 0x00, 0x2F, 0xAB, 0xCD];
        let (rest, addresses) = ingest_bytes(&payload, ProxyProtocolMode::Optional)
            .await
            .expect("ingest failed");
        assert_eq!(rest, payload);
        assert_eq!(addresses, None);
    }

    #[tokio::test]
    async fn optional_mode_passes_near_miss_prefix_through() {
        // shares the first byte with the v2 signature, then diverges
        let payload = [0x0Du8, 0x00, 0x2F, 0xAB];
        let (rest, addresses) = ingest_bytes(&payload, ProxyProtocolMode::Optional)
            .await
            .expect("ingest failed");
        assert_eq!(rest, payload);
        assert_eq!(addresses, None);
    }

    #[tokio::test]
    async fn strict_mode_requires_a_header() {
        let payload = [0x10u8, 0x00, 0x2F];
        let result = ingest_bytes(&payload, ProxyProtocolMode::Strict).await;
        assert!(matches!(result, Err(Error::MissingHeader)));
    }

    #[tokio::test]
    async fn none_mode_rejects_a_header() {
        let mut wire: Cursor<Vec<u8>> = Cursor::new(Vec::new());
        write_v1(&mut wire, pair("192.168.1.100:12345", "10.0.0.1:25565"))
            .await
            .expect("write failed");

        let result = ingest_bytes(wire.get_ref(), ProxyProtocolMode::None).await;
        assert!(matches!(result, Err(Error::UnexpectedHeader)));
    }

    #[tokio::test]
    async fn v1_unknown_family_carries_no_addresses() {
        let (rest, addresses) =
            ingest_bytes(b"PROXY UNKNOWN\r\n\x05\x00", ProxyProtocolMode::Optional)
                .await
                .expect("ingest failed");
        assert_eq!(rest, [0x05, 0x00]);
        assert_eq!(addresses, None);
    }

    #[tokio::test]
    async fn v2_local_command_carries_no_addresses() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&V2_SIGNATURE);
        wire.push(0x20); // version 2, command LOCAL
        wire.push(0x00); // AF_UNSPEC
        wire.extend_from_slice(&0u16.to_be_bytes());
        wire.extend_from_slice(&[0x01, 0x02]);

        let (rest, addresses) = ingest_bytes(&wire, ProxyProtocolMode::Optional)
            .await
            .expect("ingest failed");
        assert_eq!(rest, [0x01, 0x02]);
        assert_eq!(addresses, None);
    }

    #[tokio::test]
    async fn v1_garbage_after_prefix_is_rejected() {
        let result = ingest_bytes(b"PROXY TCP4 not an ip\r\n", ProxyProtocolMode::Optional).await;
        assert!(matches!(result, Err(Error::InvalidHeader(_))));
    }
}
