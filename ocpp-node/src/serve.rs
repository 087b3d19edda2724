//! Accept loops and the networking node's uplink

use std::sync::Arc;

use ocpp_core::transport::soap::SoapServer;
use ocpp_core::transport::websocket::{self, WebSocketListener};
use ocpp_core::{EngineContext, PeerIdentity};
use tracing::{error, info};

/// Open a connection for every peer completing an OCPP-J handshake
pub async fn serve_websocket(ctx: Arc<EngineContext>, listener: WebSocketListener) {
    loop {
        match listener.accept().await {
            Ok(accepted) => {
                let remote = accepted
                    .remote_addr
                    .map(|addr| addr.to_string())
                    .unwrap_or_default();
                info!("Accepted {} {}", accepted.identity, remote);
                ctx.open_with(accepted.link, accepted.identity, accepted.protocol);
            }
            Err(e) => {
                error!("OCPP-J listener failed: {}", e);
                return;
            }
        }
    }
}

/// Open a connection for every station starting an OCPP-S session
pub async fn serve_soap(ctx: Arc<EngineContext>, server: SoapServer) {
    loop {
        match server.accept().await {
            Ok(accepted) => {
                ctx.open_with(accepted.link, accepted.identity, accepted.protocol);
            }
            Err(e) => {
                error!("OCPP-S server failed: {}", e);
                return;
            }
        }
    }
}

/// Keep a networking node connected to its upstream node
pub async fn maintain_uplink(ctx: Arc<EngineContext>, url: String, upstream: PeerIdentity) {
    let config = ctx.config.clone();
    let identity = PeerIdentity::from(config.node_id.as_str());
    let mut reconnect_delay = config.reconnect_delay;

    loop {
        match websocket::connect(&config, &url, &identity).await {
            Ok((link, protocol)) => {
                reconnect_delay = config.reconnect_delay;
                let (_connection, task) = ctx.open_with(link, upstream.clone(), protocol);
                match task.await {
                    Ok(reason) => info!("Uplink to {} ended: {}", upstream, reason),
                    Err(e) => error!("Uplink task failed: {}", e),
                }
            }
            Err(e) => error!("Uplink to {} failed: {}", url, e),
        }

        // Exponential backoff
        info!("Reconnecting in {:?}", reconnect_delay);
        tokio::time::sleep(reconnect_delay).await;
        reconnect_delay = std::cmp::min(reconnect_delay * 2, config.max_reconnect_delay);
    }
}
