use clap::Parser;
use geofront::decision::{
    AutoKeyword, AutoOr, MotdDecision, PlayersTemplate, Rejection, RouteDecision, RouteTarget,
    StatusTemplate, VersionTemplate,
};
use geofront::{Engine, ProxyProtocolMode};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::level_filters::LevelFilter;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

/// Arguments to configure this runtime of the application before it is started.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    log_level: LevelFilter,

    /// The address to listen on.
    #[arg(long, env, default_value = "0.0.0.0:25565")]
    address: SocketAddr,

    /// A static backend as `host:port`; without it every login is rejected.
    #[arg(long, env)]
    target: Option<String>,

    /// The description text advertised in the server list.
    #[arg(long, env, default_value = "A geofront gateway")]
    motd: String,

    /// The inbound PROXY protocol mode.
    #[arg(long, env, value_enum, default_value = "none")]
    proxy_protocol_in: ProxyMode,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProxyMode {
    None,
    Optional,
    Strict,
}

impl From<ProxyMode> for ProxyProtocolMode {
    fn from(mode: ProxyMode) -> Self {
        match mode {
            ProxyMode::None => ProxyProtocolMode::None,
            ProxyMode::Optional => ProxyProtocolMode::Optional,
            ProxyMode::Strict => ProxyProtocolMode::Strict,
        }
    }
}

/// Initializes the runtime and drives the engine with a static policy.
///
/// This is a thin standalone mode around the boundary API: every route request is answered with
/// the configured backend (or a rejection when none is configured) and every MOTD request with
/// the configured description. Embedders with a real policy layer use the [`Engine`] directly.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // parse the arguments and configuration
    let args = Args::parse();

    // initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_filter(args.log_level),
        )
        .init();

    let target = args
        .target
        .as_deref()
        .map(parse_target)
        .transpose()
        .map_err(|err| format!("invalid --target: {err}"))?;

    // run the gateway blocking
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args, target))
}

async fn run(
    args: Args,
    target: Option<(String, u16)>,
) -> Result<(), Box<dyn std::error::Error>> {
    let engine = Engine::new();
    engine.set_proxy_protocol_in(args.proxy_protocol_in.into());

    // a bind failure is the only fatal error and yields a non-zero exit code
    let listener_id = engine
        .start_listener(&args.address.ip().to_string(), args.address.port())
        .await?;
    info!(listener_id, addr = %args.address, "gateway started");

    let policy = tokio::spawn(static_policy(engine.clone(), target, args.motd));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    engine.shutdown().await;
    policy.abort();

    Ok(())
}

/// Answers boundary events with a fixed backend and description.
async fn static_policy(engine: Engine, target: Option<(String, u16)>, motd: String) {
    let mut interval = tokio::time::interval(Duration::from_millis(50));
    loop {
        interval.tick().await;

        let events = engine.poll_events();
        if events.is_empty() {
            continue;
        }

        for request in events.route_requests {
            let decision = match &target {
                Some((host, port)) => RouteDecision::Forward(RouteTarget {
                    remote_host: host.clone(),
                    remote_port: *port,
                    proxy: None,
                    proxy_protocol: None,
                    rewrite_host: None,
                    cache: None,
                }),
                None => RouteDecision::Reject(Rejection {
                    disconnect: "no backend configured".to_string(),
                }),
            };
            engine.submit_route_decision(request.conn_id, decision);
        }

        for request in events.motd_requests {
            let decision = MotdDecision::Status(StatusTemplate {
                version: VersionTemplate {
                    name: "geofront".to_string(),
                    protocol: AutoOr::Auto(AutoKeyword::Auto),
                },
                players: PlayersTemplate {
                    max: 100,
                    online: AutoOr::Auto(AutoKeyword::Auto),
                    sample: Vec::new(),
                },
                description: serde_json::json!({ "text": motd }),
                favicon: None,
                cache: None,
            });
            engine.submit_motd_decision(request.conn_id, decision);
        }

        for event in events.disconnection_events {
            debug!(conn_id = event.conn_id, "connection went away");
        }
    }
}

/// Parses a `host:port` backend locator, accepting bracketed IPv6 literals.
fn parse_target(target: &str) -> Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| format!("unclosed bracket in {target}"))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| format!("missing port in {target}"))?;
        (host, port)
    } else {
        target
            .rsplit_once(':')
            .ok_or_else(|| format!("missing port in {target}"))?
    };
    let port = port.parse().map_err(|_| format!("invalid port in {target}"))?;
    Ok((host.to_string(), port))
}
