//! OCPP Node - CLI running the protocol engine
//!
//! One binary, three roles.
//!
//! # Usage
//!
//! ```bash
//! # Central system with OCPP-J and OCPP-S endpoints
//! ocpp-node csms --listen 0.0.0.0:8180 --soap-listen 0.0.0.0:8181
//!
//! # Charging station over OCPP-J
//! ocpp-node station --identity CP001 --url ws://localhost:8180/ocpp
//!
//! # Charging station over OCPP-S
//! ocpp-node station --identity CP002 --url http://localhost:8181/ocpp --soap
//!
//! # Networking node between stations and the central system
//! ocpp-node relay --node-id NN1 --listen 0.0.0.0:8280 --upstream-url ws://localhost:8180/ocpp
//! ```
//!
//! Stations behind a networking node are reached from the central system
//! with `--route CP7=NN1`.

mod handlers;
mod serve;
mod settings;
mod station;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use ocpp_core::transport::soap::SoapServer;
use ocpp_core::transport::websocket::WebSocketListener;
use ocpp_core::{EngineContext, OcppConfig, PeerIdentity, Side, TransportKind};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::settings::{parse_route, NodeSettings};

/// OCPP central system, charging station or networking node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG wins when set
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Central system accepting stations and networking nodes
    Csms {
        #[arg(long, default_value = "CSMS")]
        node_id: String,

        /// OCPP-J listen address
        #[arg(long, default_value = "0.0.0.0:8180")]
        listen: String,

        /// OCPP-S listen address (OCPP-S disabled when absent)
        #[arg(long)]
        soap_listen: Option<String>,

        /// Heartbeat interval handed to stations (seconds)
        #[arg(long, default_value_t = handlers::DEFAULT_HEARTBEAT_INTERVAL)]
        heartbeat_interval: i64,

        /// Static route DESTINATION=NEIGHBOR (can be repeated)
        #[arg(long = "route")]
        routes: Vec<String>,
    },

    /// Charging station connecting to a central system
    Station {
        /// Charge box identity
        #[arg(short, long, default_value = "CP001")]
        identity: String,

        /// Central system WebSocket base URL, or SOAP endpoint with --soap
        #[arg(long, default_value = "ws://localhost:8180/ocpp")]
        url: String,

        /// Use OCPP-S instead of OCPP-J
        #[arg(long)]
        soap: bool,

        /// Node id of the central system
        #[arg(long, default_value = "CSMS")]
        upstream: String,

        /// Vendor name
        #[arg(long, default_value = "Elektrokombinacija")]
        vendor: String,

        /// Model name
        #[arg(long, default_value = "EK3-OCPP")]
        model: String,
    },

    /// Networking node relaying between downstream stations and an upstream node
    Relay {
        #[arg(long, default_value = "NN1")]
        node_id: String,

        /// OCPP-J listen address for downstream peers
        #[arg(long, default_value = "0.0.0.0:8280")]
        listen: String,

        /// Upstream WebSocket base URL
        #[arg(long)]
        upstream_url: String,

        /// Node id of the upstream node
        #[arg(long, default_value = "CSMS")]
        upstream: String,

        /// Static route DESTINATION=NEIGHBOR (can be repeated)
        #[arg(long = "route")]
        routes: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let settings = match &args.config {
        Some(path) => NodeSettings::load(path)?,
        None => NodeSettings::default(),
    };

    match args.command {
        Command::Csms {
            node_id,
            listen,
            soap_listen,
            heartbeat_interval,
            routes,
        } => {
            banner("Central System", &node_id, &listen);
            let config = settings.apply(OcppConfig::new(node_id, Side::CentralSystem))?;
            let ctx = EngineContext::new(config);
            handlers::install_central_handlers(&ctx.dispatcher, heartbeat_interval);
            install_routes(&ctx, &settings, &routes)?;

            if let Some(addr) = soap_listen {
                let server = SoapServer::bind(addr, ctx.config.clone()).await?;
                tokio::spawn(serve::serve_soap(ctx.clone(), server));
            }
            let listener = WebSocketListener::bind(listen, ctx.config.clone()).await?;
            serve::serve_websocket(ctx, listener).await;
        }

        Command::Station {
            identity,
            url,
            soap,
            upstream,
            vendor,
            model,
        } => {
            banner("Charging Station", &identity, &url);
            let config = settings.apply(OcppConfig::new(identity, Side::ChargingStation))?;
            let ctx = EngineContext::new(config);
            handlers::install_station_handlers(&ctx.dispatcher);

            let options = station::StationOptions {
                endpoint: url,
                transport: if soap { TransportKind::Soap } else { TransportKind::Json },
                upstream: PeerIdentity::from(upstream),
                vendor,
                model,
            };
            station::run(ctx, options).await;
        }

        Command::Relay {
            node_id,
            listen,
            upstream_url,
            upstream,
            routes,
        } => {
            banner("Networking Node", &node_id, &listen);
            let config = settings.apply(OcppConfig::new(node_id, Side::NetworkingNode))?;
            let ctx = EngineContext::new(config);
            install_routes(&ctx, &settings, &routes)?;
            ctx.router.set_default_route(Some(upstream.clone()));

            tokio::spawn(serve::maintain_uplink(
                ctx.clone(),
                upstream_url,
                PeerIdentity::from(upstream),
            ));
            let listener = WebSocketListener::bind(listen, ctx.config.clone()).await?;
            serve::serve_websocket(ctx, listener).await;
        }
    }

    Ok(())
}

/// Routes from the configuration file, then from the command line
fn install_routes(
    ctx: &Arc<EngineContext>,
    settings: &NodeSettings,
    routes: &[String],
) -> Result<(), settings::SettingsError> {
    for (destination, via) in &settings.routes {
        ctx.router.add_route(destination.clone(), via.clone());
    }
    for arg in routes {
        let (destination, via) = parse_route(arg)?;
        info!("Route to {} via {}", destination, via);
        ctx.router.add_route(destination, via);
    }
    Ok(())
}

fn banner(role: &str, identity: &str, endpoint: &str) {
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║  OCPP Node - {:<48}║", role);
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Identity: {:<50}║", truncate(identity, 50));
    println!("║  Endpoint: {:<50}║", truncate(endpoint, 50));
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_station_args() {
        let args = Args::parse_from(["ocpp-node", "station", "--identity", "CP9", "--soap"]);
        match args.command {
            Command::Station { identity, soap, .. } => {
                assert_eq!(identity, "CP9");
                assert!(soap);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ws://example.com/very/long/path", 12), "ws://exam...");
    }
}
