//! Backend establishment: direct TCP dialing and SOCKS5 upstream chaining.
//!
//! Route decisions can name an upstream proxy as `socks5://host:port[?user:pass]`, in which case
//! the engine performs an RFC 1928 CONNECT (NoAuth or Username/Password) to the routed target
//! through that relay. Every failure in here surfaces to the client as "backend unavailable".

use std::net::IpAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const COMMAND_CONNECT: u8 = 0x01;
const ADDRESS_IPV4: u8 = 0x01;
const ADDRESS_DOMAIN: u8 = 0x03;
const ADDRESS_IPV6: u8 = 0x04;

/// Error type for backend dialing and upstream proxy negotiation.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error during backend dial: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid upstream proxy url: {0}")]
    InvalidProxyUrl(String),

    #[error("upstream proxy offered no acceptable authentication method")]
    NoAcceptableAuth,

    #[error("upstream proxy rejected the supplied credentials")]
    AuthenticationFailed,

    #[error("upstream proxy refused the connect request (reply {0})")]
    ConnectRefused(u8),

    #[error("upstream proxy sent a malformed reply")]
    MalformedReply,
}

/// A parsed `socks5://` upstream locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ProxyUrl {
    pub host: String,
    pub port: u16,
    pub auth: Option<(String, String)>,
}

/// Parses an upstream locator of the form `socks5://host:port[?user:pass]`.
pub(crate) fn parse_proxy_url(url: &str) -> Result<ProxyUrl, Error> {
    let rest = url
        .strip_prefix("socks5://")
        .ok_or_else(|| Error::InvalidProxyUrl(url.to_string()))?;

    let (endpoint, query) = match rest.split_once('?') {
        Some((endpoint, query)) => (endpoint, Some(query)),
        None => (rest, None),
    };

    let (host, port) = split_host_port(endpoint)
        .ok_or_else(|| Error::InvalidProxyUrl(url.to_string()))?;

    let auth = match query {
        Some(query) => {
            let (user, pass) = query
                .split_once(':')
                .ok_or_else(|| Error::InvalidProxyUrl(url.to_string()))?;
            Some((user.to_string(), pass.to_string()))
        }
        None => None,
    };

    Ok(ProxyUrl {
        host: host.to_string(),
        port,
        auth,
    })
}

/// Splits `host:port`, accepting bracketed IPv6 literals.
fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = if let Some(rest) = endpoint.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        endpoint.rsplit_once(':')?
    };
    Some((host, port.parse().ok()?))
}

/// Establishes the backend stream for a route decision, directly or through a SOCKS5 relay.
pub(crate) async fn dial(
    remote_host: &str,
    remote_port: u16,
    proxy: Option<&str>,
) -> Result<TcpStream, Error> {
    match proxy {
        None => {
            debug!(host = remote_host, port = remote_port, "dialing backend");
            Ok(TcpStream::connect((remote_host, remote_port)).await?)
        }
        Some(url) => {
            let proxy = parse_proxy_url(url)?;
            debug!(
                host = remote_host,
                port = remote_port,
                relay = proxy.host,
                "dialing backend through SOCKS5 relay"
            );
            let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port)).await?;
            connect(
                &mut stream,
                remote_host,
                remote_port,
                proxy.auth.as_ref(),
            )
            .await?;
            Ok(stream)
        }
    }
}

/// Performs the RFC 1928 negotiation and CONNECT on an established relay stream.
pub(crate) async fn connect<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    auth: Option<&(String, String)>,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // method selection
    let greeting: &[u8] = match auth {
        Some(_) => &[SOCKS_VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS],
        None => &[SOCKS_VERSION, 1, METHOD_NO_AUTH],
    };
    stream.write_all(greeting).await?;

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS_VERSION {
        return Err(Error::MalformedReply);
    }
    match choice[1] {
        METHOD_NO_AUTH => {}
        METHOD_USER_PASS => {
            let Some((user, pass)) = auth else {
                return Err(Error::NoAcceptableAuth);
            };
            subnegotiate(stream, user, pass).await?;
        }
        METHOD_UNACCEPTABLE => return Err(Error::NoAcceptableAuth),
        _ => return Err(Error::MalformedReply),
    }

    // connect request
    let mut request = vec![SOCKS_VERSION, COMMAND_CONNECT, 0x00];
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ADDRESS_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ADDRESS_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if target_host.len() > 255 {
                return Err(Error::InvalidProxyUrl(target_host.to_string()));
            }
            request.push(ADDRESS_DOMAIN);
            request.push(target_host.len() as u8);
            request.extend_from_slice(target_host.as_bytes());
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    stream.write_all(&request).await?;

    // reply with the bound address, which is skipped
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    if reply[0] != SOCKS_VERSION {
        return Err(Error::MalformedReply);
    }
    if reply[1] != 0x00 {
        return Err(Error::ConnectRefused(reply[1]));
    }
    let bound_len = match reply[3] {
        ADDRESS_IPV4 => 4,
        ADDRESS_IPV6 => 16,
        ADDRESS_DOMAIN => stream.read_u8().await? as usize,
        _ => return Err(Error::MalformedReply),
    };
    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    Ok(())
}

/// RFC 1929 username/password subnegotiation.
async fn subnegotiate<S>(stream: &mut S, user: &str, pass: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if user.len() > 255 || pass.len() > 255 {
        return Err(Error::AuthenticationFailed);
    }

    let mut request = vec![0x01, user.len() as u8];
    request.extend_from_slice(user.as_bytes());
    request.push(pass.len() as u8);
    request.extend_from_slice(pass.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Error::AuthenticationFailed);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_without_credentials() {
        let url = parse_proxy_url("socks5://relay.example.com:1080").expect("parse failed");
        assert_eq!(
            url,
            ProxyUrl {
                host: "relay.example.com".to_string(),
                port: 1080,
                auth: None,
            }
        );
    }

    #[test]
    fn proxy_url_with_credentials() {
        let url = parse_proxy_url("socks5://10.0.0.5:1080?alice:s3cret").expect("parse failed");
        assert_eq!(url.auth, Some(("alice".to_string(), "s3cret".to_string())));
    }

    #[test]
    fn proxy_url_with_ipv6_literal() {
        let url = parse_proxy_url("socks5://[2001:db8::1]:1080").expect("parse failed");
        assert_eq!(url.host, "2001:db8::1");
        assert_eq!(url.port, 1080);
    }

    #[test]
    fn proxy_url_rejects_other_schemes() {
        assert!(matches!(
            parse_proxy_url("http://relay:8080"),
            Err(Error::InvalidProxyUrl(_))
        ));
        assert!(matches!(
            parse_proxy_url("socks5://no-port"),
            Err(Error::InvalidProxyUrl(_))
        ));
    }

    /// Answers one CONNECT exchange on the relay side and returns the request bytes observed
    /// after the greeting.
    async fn relay_fixture<S>(stream: &mut S, method: u8, reply_code: u8) -> Vec<u8>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.expect("read failed");
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await.expect("read failed");
        stream
            .write_all(&[SOCKS_VERSION, method])
            .await
            .expect("write failed");

        if method == METHOD_USER_PASS {
            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.expect("read failed");
            let mut user = vec![0u8; head[1] as usize];
            stream.read_exact(&mut user).await.expect("read failed");
            let plen = stream.read_u8().await.expect("read failed");
            let mut pass = vec![0u8; plen as usize];
            stream.read_exact(&mut pass).await.expect("read failed");
            let status = if user == b"alice" && pass == b"s3cret" {
                0x00
            } else {
                0x01
            };
            stream
                .write_all(&[0x01, status])
                .await
                .expect("write failed");
            if status != 0x00 {
                return Vec::new();
            }
        }

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await.expect("read failed");
        let mut request = head.to_vec();
        let addr_len = match head[3] {
            ADDRESS_IPV4 => 4,
            ADDRESS_IPV6 => 16,
            ADDRESS_DOMAIN => {
                let len = stream.read_u8().await.expect("read failed");
                request.push(len);
                len as usize
            }
            other => panic!("unexpected address type {other}"),
        };
        let mut rest = vec![0u8; addr_len + 2];
        stream.read_exact(&mut rest).await.expect("read failed");
        request.extend_from_slice(&rest);

        stream
            .write_all(&[SOCKS_VERSION, reply_code, 0x00, ADDRESS_IPV4, 0, 0, 0, 0, 0, 0])
            .await
            .expect("write failed");
        request
    }

    #[tokio::test]
    async fn connect_negotiates_no_auth_with_domain_target() {
        let (mut client, mut relay) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            relay_fixture(&mut relay, METHOD_NO_AUTH, 0x00).await
        });

        connect(&mut client, "backend.internal", 25566, None)
            .await
            .expect("connect failed");

        let request = relay.await.expect("relay fixture failed");
        assert_eq!(request[1], COMMAND_CONNECT);
        assert_eq!(request[3], ADDRESS_DOMAIN);
        assert_eq!(request[4] as usize, "backend.internal".len());
        assert_eq!(&request[5..5 + 16], b"backend.internal");
        assert_eq!(&request[21..], &25566u16.to_be_bytes());
    }

    #[tokio::test]
    async fn connect_negotiates_username_password() {
        let (mut client, mut relay) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            relay_fixture(&mut relay, METHOD_USER_PASS, 0x00).await
        });

        let auth = ("alice".to_string(), "s3cret".to_string());
        connect(&mut client, "10.0.0.9", 25566, Some(&auth))
            .await
            .expect("connect failed");

        let request = relay.await.expect("relay fixture failed");
        assert_eq!(request[3], ADDRESS_IPV4);
        assert_eq!(&request[4..8], &[10, 0, 0, 9]);
    }

    #[tokio::test]
    async fn connect_fails_on_bad_credentials() {
        let (mut client, mut relay) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            relay_fixture(&mut relay, METHOD_USER_PASS, 0x00).await
        });

        let auth = ("alice".to_string(), "wrong".to_string());
        let result = connect(&mut client, "10.0.0.9", 25566, Some(&auth)).await;
        assert!(matches!(result, Err(Error::AuthenticationFailed)));
        relay.await.expect("relay fixture failed");
    }

    #[tokio::test]
    async fn connect_surfaces_relay_refusal() {
        let (mut client, mut relay) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            // reply 0x05: connection refused
            relay_fixture(&mut relay, METHOD_NO_AUTH, 0x05).await
        });

        let result = connect(&mut client, "10.0.0.9", 25566, None).await;
        assert!(matches!(result, Err(Error::ConnectRefused(0x05))));
        relay.await.expect("relay fixture failed");
    }

    #[tokio::test]
    async fn connect_fails_when_relay_requires_auth_we_lack() {
        let (mut client, mut relay) = tokio::io::duplex(1024);

        let relay = tokio::spawn(async move {
            let mut greeting = [0u8; 2];
            relay.read_exact(&mut greeting).await.expect("read failed");
            let mut methods = vec![0u8; greeting[1] as usize];
            relay.read_exact(&mut methods).await.expect("read failed");
            relay
                .write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE])
                .await
                .expect("write failed");
        });

        let result = connect(&mut client, "10.0.0.9", 25566, None).await;
        assert!(matches!(result, Err(Error::NoAcceptableAuth)));
        relay.await.expect("relay fixture failed");
    }
}
