//! WebSocket transport server.
//!
//! Accepts client connections on `/ws`, reads the handshake query and
//! forwarded-address headers, dispatches to the new-session or reattach
//! path, then runs the per-connection loop: outbound queue → sink, inbound
//! frames classified into control messages and upstream bytes, and a
//! periodic keepalive ping.

use crate::config::ProxyConfig;
use crate::session::{self, control_message, DetachIntent, Session, SessionRegistry};
use crate::upstream::{self, UpstreamAddr};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use mudgate_core::{
    classify_frame, ClientControl, Frame, ProxyError, ProxyResult, ServerControl, SessionConfig,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Interval between transport-level keepalive pings.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Values extracted from the WebSocket handshake request.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Handshake {
    session_id: Option<String>,
    persistence_timeout: Option<i64>,
    max_buffer_lines: Option<i64>,
    forwarded_for: Option<String>,
    forwarded_port: Option<u16>,
}

/// The proxy instance: configuration, registry, shutdown fan-out.
pub struct ProxyServer {
    config: ProxyConfig,
    upstream_addr: UpstreamAddr,
    registry: Arc<SessionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let upstream_addr = UpstreamAddr::parse(&config.upstream)?;
        Ok(Self {
            config,
            upstream_addr,
            registry: Arc::new(SessionRegistry::new()),
            shutdown_tx: broadcast::channel(1).0,
        })
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Bind the WebSocket listener on the configured port.
    pub async fn bind(&self) -> ProxyResult<TcpListener> {
        let listener = TcpListener::bind(("0.0.0.0", self.config.port)).await?;
        Ok(listener)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> ProxyResult<()> {
        info!(
            addr = %listener.local_addr()?,
            upstream = %self.config.upstream,
            "websocket listener started"
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, peer).await {
                                debug!(remote = %peer, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }
        Ok(())
    }

    /// Signal shutdown and clean up every session: both legs close, the
    /// registry drains, attached clients receive a normal close.
    pub async fn shutdown(&self) {
        info!("shutting down, cleaning up all sessions");
        let _ = self.shutdown_tx.send(());
        for id in self.registry.ids().await {
            session::cleanup(&self.registry, &id).await;
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> ProxyResult<()> {
        let mut hs = Handshake::default();
        let ws = accept_hdr_async(stream, |req: &Request, resp: Response| {
            if req.uri().path() != "/ws" {
                let mut response = ErrorResponse::new(Some("not found".to_string()));
                *response.status_mut() = StatusCode::NOT_FOUND;
                return Err(response);
            }
            hs = parse_handshake(req);
            Ok(resp)
        })
        .await
        .map_err(|e| ProxyError::Transport(e.to_string()))?;

        let (client_ip, client_port) = client_addr(&hs, peer);
        let (mut sink, mut source) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let (session_id, seq) = match hs.session_id {
            Some(ref id) => {
                match session::reattach(
                    &self.registry,
                    id,
                    tx.clone(),
                    client_ip.clone(),
                    client_port,
                )
                .await
                {
                    Ok(seq) => (id.clone(), seq),
                    Err(e) => {
                        info!(remote = %peer, session_id = %id, error = %e, "reattach refused");
                        let _ = sink
                            .send(control_message(&ServerControl::Error {
                                error: "Session not found".to_string(),
                            }))
                            .await;
                        let _ = sink.send(session::close_frame()).await;
                        return Ok(());
                    }
                }
            }
            None => {
                let config = SessionConfig::from_raw(
                    hs.persistence_timeout,
                    hs.max_buffer_lines,
                    self.config.default_session,
                );
                let proxy_source = self
                    .config
                    .use_proxy_protocol
                    .then_some((client_ip.as_str(), client_port));
                let upstream = match upstream::connect(&self.upstream_addr, proxy_source).await
                {
                    Ok(upstream) => upstream,
                    Err(e) => {
                        warn!(remote = %peer, error = %e, "upstream connect failed");
                        let _ = sink.send(session::close_frame()).await;
                        return Ok(());
                    }
                };

                let (upstream_tx, upstream_rx) = mpsc::unbounded_channel();
                let mut new_session =
                    Session::new(client_ip.clone(), client_port, config);
                new_session.upstream_tx = Some(upstream_tx);
                new_session.client = Some(tx.clone());
                new_session.client_seq = 1;
                let id = self.registry.insert(new_session).await;
                // The session control message must be first in the queue:
                // only after it is enqueued may the pump start producing
                // upstream data frames.
                let _ = tx.send(control_message(&ServerControl::Session {
                    session_id: id.clone(),
                    config,
                }));
                session::spawn_upstream_writer(id.clone(), upstream.writer, upstream_rx);
                session::spawn_upstream_pump(
                    self.registry.clone(),
                    id.clone(),
                    upstream.reader,
                );
                info!(session_id = %id, client = %client_ip, "session created");
                (id, 1)
            }
        };

        let intent = self
            .connection_loop(&mut sink, &mut source, &mut rx, &session_id)
            .await;
        session::detach(&self.registry, &session_id, seq, intent).await;
        Ok(())
    }

    /// Per-connection event loop. Returns how the transport went away.
    async fn connection_loop(
        &self,
        sink: &mut WsSink,
        source: &mut WsSource,
        rx: &mut mpsc::UnboundedReceiver<Message>,
        session_id: &str,
    ) -> DetachIntent {
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + KEEPALIVE_INTERVAL,
            KEEPALIVE_INTERVAL,
        );
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    let _ = sink.send(session::close_frame()).await;
                    // Global cleanup will reap the session; report graceful
                    // so no persistence timer gets armed in the meantime.
                    return DetachIntent::Graceful;
                }

                outbound = rx.recv() => {
                    let Some(msg) = outbound else {
                        return DetachIntent::Involuntary;
                    };
                    let closing = matches!(msg, Message::Close(_));
                    if sink.send(msg).await.is_err() {
                        return DetachIntent::Involuntary;
                    }
                    if closing {
                        // The session told this transport to go away
                        // (cleanup or takeover by a newer client).
                        return DetachIntent::Graceful;
                    }
                }

                _ = keepalive.tick() => {
                    if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                        return DetachIntent::Involuntary;
                    }
                }

                inbound = source.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            self.handle_frame(&data, session_id).await;
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(text.as_bytes(), session_id).await;
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(frame))) => {
                            let graceful = frame
                                .map(|f| f.code == CloseCode::Normal)
                                .unwrap_or(false);
                            return if graceful {
                                DetachIntent::Graceful
                            } else {
                                DetachIntent::Involuntary
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(session_id = %session_id, error = %e, "transport error");
                            return DetachIntent::Involuntary;
                        }
                        None => return DetachIntent::Involuntary,
                    }
                }
            }
        }
    }

    /// Classify one inbound frame: 0x00-prefixed control messages are
    /// handled locally, everything else is forwarded verbatim upstream.
    async fn handle_frame(&self, payload: &[u8], session_id: &str) {
        match classify_frame(payload) {
            Frame::Control(body) => self.handle_control(body, session_id).await,
            Frame::Data(data) => {
                if let Some(handle) = self.registry.get(session_id).await {
                    let session = handle.lock().await;
                    session::write_upstream(&session, data);
                }
            }
        }
    }

    async fn handle_control(&self, body: &[u8], session_id: &str) {
        match ClientControl::decode(body) {
            Ok(ClientControl::UpdateConfig {
                persistence_timeout,
                max_buffer_lines,
            }) => {
                let Some(handle) = self.registry.get(session_id).await else {
                    return;
                };
                let mut session = handle.lock().await;
                session.config.apply_update(persistence_timeout, max_buffer_lines);
                let config = session.config;
                if let Some(tx) = &session.client {
                    let _ = tx.send(control_message(&ServerControl::ConfigUpdated {
                        config,
                    }));
                }
                info!(
                    session_id = %session_id,
                    timeout_ms = config.persistence_timeout_ms,
                    max_lines = config.max_buffer_lines,
                    "session config updated"
                );
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "ignoring malformed control message");
            }
        }
    }
}

/// Extract query parameters and forwarded-address headers from the
/// handshake request. Unknown query parameters are ignored; non-numeric
/// values are treated as absent.
fn parse_handshake(req: &Request) -> Handshake {
    let mut hs = Handshake::default();

    if let Some(query) = req.uri().query() {
        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            match key {
                "sessionId" => hs.session_id = Some(value.to_string()),
                "persistenceTimeout" => hs.persistence_timeout = value.parse().ok(),
                "maxBufferLines" => hs.max_buffer_lines = value.parse().ok(),
                _ => {}
            }
        }
    }

    hs.forwarded_for = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    hs.forwarded_port = req
        .headers()
        .get("x-forwarded-port")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    hs
}

/// Resolve the real client address: forwarded headers win over the
/// transport peer, and the IPv4-mapped-IPv6 prefix is stripped.
fn client_addr(hs: &Handshake, peer: SocketAddr) -> (String, u16) {
    let ip = hs
        .forwarded_for
        .clone()
        .unwrap_or_else(|| peer.ip().to_string());
    let ip = match ip.strip_prefix("::ffff:") {
        Some(v4) => v4.to_string(),
        None => ip,
    };
    let port = hs.forwarded_port.unwrap_or_else(|| peer.port());
    (ip, port)
}
