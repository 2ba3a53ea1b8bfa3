//! Reusable harness for proxy end-to-end tests.
//!
//! Starts the proxy on an ephemeral port against a mock TCP upstream and
//! provides helpers for driving both legs: a real WebSocket client on one
//! side, raw socket reads/writes on the other.

#![allow(dead_code)]

use futures_util::StreamExt;
use mudgate_core::SessionConfig;
use mudgate_server::{ProxyConfig, ProxyServer};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestProxy {
    pub server: Arc<ProxyServer>,
    pub addr: SocketAddr,
    pub upstream_listener: TcpListener,
}

pub async fn start_proxy() -> TestProxy {
    start_proxy_with(SessionConfig::default()).await
}

pub async fn start_proxy_with(default_session: SessionConfig) -> TestProxy {
    let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream_port = upstream_listener.local_addr().unwrap().port();

    let config = ProxyConfig {
        port: 0,
        ops_port: 0,
        upstream: format!("tcp://127.0.0.1:{upstream_port}"),
        use_proxy_protocol: false,
        default_session,
    };
    let server = Arc::new(ProxyServer::new(config).unwrap());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let run = server.clone();
    tokio::spawn(async move {
        let _ = run.run(listener).await;
    });

    TestProxy {
        server,
        addr,
        upstream_listener,
    }
}

/// Open a WebSocket to the proxy. `query` includes its leading `?` when
/// non-empty; `forwarded_for` sets the X-Forwarded-For header.
pub async fn connect_client(
    addr: SocketAddr,
    query: &str,
    forwarded_for: Option<&str>,
) -> WsClient {
    let url = format!("ws://{addr}/ws{query}");
    let mut request = url.into_client_request().unwrap();
    if let Some(ip) = forwarded_for {
        request
            .headers_mut()
            .insert("X-Forwarded-For", HeaderValue::from_str(ip).unwrap());
    }
    let (ws, _) = connect_async(request).await.unwrap();
    ws
}

/// Next binary payload, skipping keepalive frames.
pub async fn next_binary(ws: &mut WsClient) -> Vec<u8> {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                other => panic!("expected binary frame, got {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a binary frame")
}

/// Next control message as JSON; asserts the 0x00 prefix.
pub async fn next_control(ws: &mut WsClient) -> serde_json::Value {
    let data = next_binary(ws).await;
    assert_eq!(data[0], 0x00, "expected a control frame");
    serde_json::from_slice(&data[1..]).unwrap()
}

/// Wait for the proxy to close the connection.
pub async fn expect_close(ws: &mut WsClient) {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

/// Tear the client connection down without a close handshake, then give
/// the proxy a moment to observe the abnormal disconnect.
pub async fn abort_client(ws: WsClient) {
    drop(ws);
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn accept_upstream(listener: &TcpListener) -> TcpStream {
    let (stream, _) = tokio::time::timeout(RECV_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for the upstream connection")
        .unwrap();
    stream
}

pub async fn upstream_read_exact(stream: &mut TcpStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    tokio::time::timeout(RECV_TIMEOUT, stream.read_exact(&mut buf))
        .await
        .expect("timed out reading from the mock upstream")
        .unwrap();
    buf
}

/// Write chunks with gaps long enough that each arrives as its own read
/// (and therefore its own buffered message) on the proxy side.
pub async fn upstream_send_chunks(stream: &mut TcpStream, chunks: &[&[u8]]) {
    for chunk in chunks {
        stream.write_all(chunk).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
}
