//! OCPP-J over WebSocket
//!
//! Handles:
//! - sub-protocol negotiation (client offers a list, server picks)
//! - charge box identity as the last URL path segment
//! - optional HTTP Basic authentication on the handshake
//! - transport keep-alive pings, independent of protocol messages
//!
//! Each socket gets two pump tasks: one writer draining the link's outbound
//! queue, one reader feeding inbound frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::{basic_auth_header, link, Accepted, Link, LinkDriver, LinkEvent};
use crate::codec::TransportKind;
use crate::config::OcppConfig;
use crate::error::TransportError;
use crate::types::{PeerIdentity, ProtocolVersion};

/// Upper bound for a client to complete the upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, identity: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), identity)
}

/// Charge box identity: last non-empty path segment
pub fn identity_from_path(path: &str) -> Option<PeerIdentity> {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(PeerIdentity::from)
}

/// Server choice: first of our versions the client offered
pub fn select_subprotocol(offered: &str, supported: &[ProtocolVersion]) -> Option<ProtocolVersion> {
    supported.iter().copied().find(|version| {
        offered
            .split(',')
            .any(|token| token.trim() == version.subprotocol())
    })
}

fn ws_config(config: &OcppConfig) -> WebSocketConfig {
    WebSocketConfig {
        max_message_size: Some(config.websocket.max_message_size),
        max_frame_size: Some(config.websocket.max_frame_size),
        ..Default::default()
    }
}

/// Connect to `<base_url>/<identity>` as a charging station or networking node
pub async fn connect(
    config: &OcppConfig,
    base_url: &str,
    identity: &PeerIdentity,
) -> Result<(Link, ProtocolVersion), TransportError> {
    let url = build_ocpp_url(base_url, identity.as_str());
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let offered = config
        .websocket
        .subprotocols
        .iter()
        .map(|v| v.subprotocol())
        .collect::<Vec<_>>()
        .join(", ");
    let offered =
        HeaderValue::from_str(&offered).map_err(|e| TransportError::Handshake(e.to_string()))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, offered);

    if let Some(auth) = &config.basic_auth {
        let value = HeaderValue::from_str(&basic_auth_header(auth))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        request.headers_mut().insert(header::AUTHORIZATION, value);
    }

    let (ws_stream, response) =
        connect_async_with_config(request, Some(ws_config(config)), false)
            .await
            .map_err(|e| {
                error!("WebSocket connection failed: {}", e);
                TransportError::Handshake(e.to_string())
            })?;

    // Verify subprotocol
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(ProtocolVersion::from_subprotocol);

    let protocol = match accepted {
        Some(version) if config.websocket.subprotocols.contains(&version) => version,
        other => {
            warn!("Server did not accept an offered sub-protocol, got: {:?}", other);
            return Err(TransportError::Handshake(
                "no offered sub-protocol was accepted".into(),
            ));
        }
    };

    info!("WebSocket connected to {} ({})", url, protocol);
    Ok((spawn_pumps(ws_stream, config.websocket.ping_interval), protocol))
}

/// Accepts OCPP-J connections from charging stations or downstream nodes
pub struct WebSocketListener {
    listener: TcpListener,
    config: Arc<OcppConfig>,
}

impl WebSocketListener {
    pub async fn bind(addr: impl ToSocketAddrs, config: Arc<OcppConfig>) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        info!("Listening for OCPP-J on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next peer that completes the handshake.
    ///
    /// Rejected handshakes are logged and skipped.
    pub async fn accept(&self) -> Result<Accepted, TransportError> {
        loop {
            let (stream, remote_addr) = self.listener.accept().await?;
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, self.handshake(stream, remote_addr)).await {
                Ok(Ok(accepted)) => return Ok(accepted),
                Ok(Err(e)) => warn!("Rejected WebSocket handshake from {}: {}", remote_addr, e),
                Err(_) => warn!("WebSocket handshake from {} timed out", remote_addr),
            }
        }
    }

    async fn handshake(&self, stream: TcpStream, remote_addr: SocketAddr) -> Result<Accepted, TransportError> {
        let supported = &self.config.websocket.subprotocols;
        let expected_auth = self.config.basic_auth.as_ref().map(basic_auth_header);
        let mut negotiated: Option<(PeerIdentity, ProtocolVersion)> = None;

        let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let identity = identity_from_path(request.uri().path())
                .ok_or_else(|| reject(StatusCode::NOT_FOUND, "missing charge box identity"))?;

            if let Some(expected) = &expected_auth {
                let presented = request
                    .headers()
                    .get(header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok());
                if presented != Some(expected.as_str()) {
                    return Err(reject(StatusCode::UNAUTHORIZED, "invalid credentials"));
                }
            }

            let offered = request
                .headers()
                .get(header::SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            let protocol = select_subprotocol(offered, supported)
                .ok_or_else(|| reject(StatusCode::BAD_REQUEST, "no supported sub-protocol offered"))?;

            response.headers_mut().insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                HeaderValue::from_static(protocol.subprotocol()),
            );
            negotiated = Some((identity, protocol));
            Ok(response)
        };

        let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config(&self.config)))
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let (identity, protocol) = negotiated
            .ok_or_else(|| TransportError::Handshake("handshake produced no identity".into()))?;

        info!("{} connected from {} ({})", identity, remote_addr, protocol);
        Ok(Accepted {
            link: spawn_pumps(ws_stream, self.config.websocket.ping_interval),
            identity,
            protocol,
            remote_addr: Some(remote_addr),
        })
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

fn spawn_pumps<S>(stream: WebSocketStream<S>, ping_interval: Duration) -> Link
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (link, driver) = link(TransportKind::Json);
    let LinkDriver {
        mut outbound,
        inbound,
        control,
    } = driver;
    let (mut ws_tx, mut ws_rx) = stream.split();

    // Writer: the only task touching the sink
    let writer_control = control.clone();
    tokio::spawn(async move {
        let mut ping = (!ping_interval.is_zero()).then(|| {
            let mut interval = tokio::time::interval_at(
                tokio::time::Instant::now() + ping_interval,
                ping_interval,
            );
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                biased;

                frame = outbound.recv() => {
                    let Some(frame) = frame else { break };
                    let text = match String::from_utf8(frame) {
                        Ok(text) => text,
                        Err(e) => {
                            error!("Refusing to send non-UTF-8 frame: {}", e);
                            continue;
                        }
                    };
                    debug!("Sending: {}", text);
                    if let Err(e) = ws_tx.send(Message::Text(text)).await {
                        error!("Failed to send WebSocket message: {}", e);
                        writer_control.abort(TransportError::Reset(e.to_string()));
                        break;
                    }
                }

                _ = writer_control.closed() => break,

                _ = async {
                    match ping.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    if let Err(e) = ws_tx.send(Message::Ping(Vec::new())).await {
                        error!("Failed to send ping: {}", e);
                        writer_control.abort(TransportError::Reset(e.to_string()));
                        break;
                    }
                }
            }
        }

        let _ = ws_tx.close().await;
    });

    // Reader
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = ws_rx.next() => {
                    let event = match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received: {}", text);
                            LinkEvent::Frame(text.into_bytes())
                        }
                        Some(Ok(Message::Binary(data))) => LinkEvent::Frame(data),
                        Some(Ok(Message::Close(frame))) => {
                            info!("WebSocket closed by peer: {:?}", frame);
                            LinkEvent::Closed(None)
                        }
                        // Pongs are answered by tungstenite
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            LinkEvent::Closed(Some(TransportError::Reset(e.to_string())))
                        }
                        None => {
                            info!("WebSocket stream ended");
                            LinkEvent::Closed(None)
                        }
                    };
                    let closed = matches!(event, LinkEvent::Closed(_));
                    if inbound.send(event).await.is_err() || closed {
                        break;
                    }
                }

                _ = control.closed() => break,
            }
        }
    });

    link
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ocpp_url() {
        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService", "EK3-001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );

        let url = build_ocpp_url("ws://localhost:8180/steve/websocket/CentralSystemService/", "EK3-001");
        assert_eq!(
            url,
            "ws://localhost:8180/steve/websocket/CentralSystemService/EK3-001"
        );
    }

    #[test]
    fn test_identity_from_path() {
        assert_eq!(identity_from_path("/ocpp/CS-01"), Some(PeerIdentity::from("CS-01")));
        assert_eq!(identity_from_path("/ocpp/CS-01/"), Some(PeerIdentity::from("CS-01")));
        assert_eq!(identity_from_path("/"), None);
    }

    #[test]
    fn test_select_subprotocol() {
        let supported = [ProtocolVersion::Ocpp201, ProtocolVersion::Ocpp16];
        assert_eq!(
            select_subprotocol("ocpp1.6, ocpp2.0.1", &supported),
            Some(ProtocolVersion::Ocpp201)
        );
        assert_eq!(select_subprotocol("ocpp1.6", &supported), Some(ProtocolVersion::Ocpp16));
        assert_eq!(select_subprotocol("ocpp1.5", &supported), None);
        assert_eq!(select_subprotocol("", &supported), None);
    }

    #[tokio::test]
    async fn test_handshake_and_frames() {
        let config = Arc::new(OcppConfig::default().with_ping_interval(Duration::ZERO));
        let listener = WebSocketListener::bind("127.0.0.1:0", config.clone()).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move { listener.accept().await.unwrap() });
        let client_config = OcppConfig::default().with_subprotocols(vec![ProtocolVersion::Ocpp16]);
        let (client, protocol) = connect(&client_config, &format!("ws://{}/ocpp", addr), &"CS-7".into())
            .await
            .unwrap();
        assert_eq!(protocol, ProtocolVersion::Ocpp16);

        let mut accepted = server.await.unwrap();
        assert_eq!(accepted.identity, "CS-7");
        assert_eq!(accepted.protocol, ProtocolVersion::Ocpp16);

        client.sender.send(br#"[2,"1","Heartbeat",{}]"#.to_vec()).await.unwrap();
        assert_eq!(
            accepted.link.receiver.recv().await,
            LinkEvent::Frame(br#"[2,"1","Heartbeat",{}]"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_rejects_unsupported_subprotocol() {
        let config = Arc::new(OcppConfig::default().with_subprotocols(vec![ProtocolVersion::Ocpp201]));
        let listener = WebSocketListener::bind("127.0.0.1:0", config).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let client_config = OcppConfig::default().with_subprotocols(vec![ProtocolVersion::Ocpp16]);
        let result = connect(&client_config, &format!("ws://{}/ocpp", addr), &"CS-8".into()).await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));
    }
}
