//! Session lifecycle: one upstream connection, zero-or-one client
//! transport, a replay buffer for the gaps, and a persistence timer.
//!
//! The registry owns every session; everything else reaches a session by id
//! and mutates it under the per-session lock. Cleanup is a single map
//! removal plus teardown of both legs, and is idempotent.

pub mod registry;

pub use registry::{RegistryStats, SessionRegistry, SESSION_ID_LEN};

use crate::upstream::{UpstreamReader, UpstreamWriter};
use mudgate_core::{ProxyError, ProxyResult, ReplayBuffer, ServerControl, SessionConfig, TelnetFilter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Outbound queue feeding one client transport's writer loop.
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Outbound queue feeding the session's upstream writer task.
pub type UpstreamSender = mpsc::UnboundedSender<Vec<u8>>;

pub type SessionHandle = Arc<Mutex<Session>>;

/// How the client transport went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachIntent {
    /// Closed with the normal-closure status: the user meant to leave.
    Graceful,
    /// Anything else: error, abnormal close, missing close frame.
    Involuntary,
}

/// Per-client-session state. All mutation happens under the session lock.
pub struct Session {
    pub id: String,
    /// Outbound queue of the attached client, if any.
    pub client: Option<ClientSender>,
    /// Bumped on every attach; a detaching transport must present the
    /// matching value, so a stale transport cannot disturb its successor.
    pub client_seq: u64,
    pub buffer: ReplayBuffer,
    pub disconnected_at: Option<Instant>,
    /// Queue into the upstream writer task. Enqueueing never blocks, so
    /// the session lock is never held across upstream socket I/O.
    pub upstream_tx: Option<UpstreamSender>,
    pub upstream_alive: bool,
    pub created_at: Instant,
    pub client_ip: String,
    pub client_port: u16,
    pub filter: TelnetFilter,
    pub config: SessionConfig,
    /// Set under the session lock when the session leaves the registry.
    pub closed: bool,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Session {
    pub fn new(client_ip: String, client_port: u16, config: SessionConfig) -> Self {
        Self {
            id: String::new(),
            client: None,
            client_seq: 0,
            buffer: ReplayBuffer::new(),
            disconnected_at: None,
            upstream_tx: None,
            upstream_alive: true,
            created_at: Instant::now(),
            client_ip,
            client_port,
            filter: TelnetFilter::new(),
            config,
            closed: false,
            timer_generation: 0,
            timer: None,
        }
    }

    /// Whether the persistence timer is armed.
    pub fn timer_set(&self) -> bool {
        self.timer.is_some()
    }
}

/// Wrap a control message for the client transport.
pub fn control_message(msg: &ServerControl) -> Message {
    Message::Binary(msg.encode().into())
}

pub(crate) fn close_frame() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

/// Queue bytes for the upstream leg, if it is still there. A closed queue
/// is advisory; the read pump observes the authoritative close.
pub(crate) fn write_upstream(session: &Session, data: &[u8]) {
    if !session.upstream_alive {
        return;
    }
    if let Some(tx) = &session.upstream_tx {
        let _ = tx.send(data.to_vec());
    }
}

/// Own the upstream write half on a dedicated task, draining the queue in
/// order. A blocked socket write stalls only this task, never the session
/// lock. When every sender is gone the task flushes what is queued and
/// shuts the socket down.
pub fn spawn_upstream_writer(
    id: String,
    mut writer: UpstreamWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if let Err(e) = writer.write_all(&data).await {
                warn!(session_id = %id, error = %e, "upstream write failed");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });
}

/// Attach a new client to an existing session.
///
/// Cancels the persistence timer, re-announces a changed client address
/// upstream if NEW-ENVIRON was negotiated, sends the `reconnected` control
/// message, and drains the replay buffer, all under the session lock so
/// buffered output lands strictly before any later live byte. Returns the
/// attachment sequence number the transport must present on detach.
pub async fn reattach(
    registry: &Arc<SessionRegistry>,
    id: &str,
    tx: ClientSender,
    ip: String,
    port: u16,
) -> ProxyResult<u64> {
    let handle = registry
        .get(id)
        .await
        .ok_or_else(|| ProxyError::SessionNotFound(id.to_string()))?;
    let mut session = handle.lock().await;
    if session.closed || !session.upstream_alive {
        return Err(ProxyError::SessionNotFound(id.to_string()));
    }

    session.timer_generation += 1;
    if let Some(timer) = session.timer.take() {
        timer.abort();
    }
    session.disconnected_at = None;

    // At most one attached client: a lingering transport gets closed.
    if let Some(old) = session.client.take() {
        let _ = old.send(close_frame());
    }

    if session.client_ip != ip {
        if let Some(update) = session.filter.address_update(&ip) {
            debug!(session_id = %id, new_ip = %ip, "re-announcing client address upstream");
            write_upstream(&session, &update);
        }
    }
    session.client_ip = ip;
    session.client_port = port;
    session.client_seq += 1;

    let buffered = session.buffer.drain();
    info!(session_id = %id, buffered = buffered.len(), "client reattached");
    let _ = tx.send(control_message(&ServerControl::Reconnected {
        session_id: id.to_string(),
        buffered_count: buffered.len(),
    }));
    for msg in buffered {
        let _ = tx.send(Message::Binary(msg.data.into()));
    }
    session.client = Some(tx);

    Ok(session.client_seq)
}

/// Handle a client transport going away.
///
/// A graceful close, a dead upstream, or a zero persistence timeout tear
/// the session down immediately; otherwise the session enters the
/// persisting state and the cleanup timer is armed.
pub async fn detach(
    registry: &Arc<SessionRegistry>,
    id: &str,
    seq: u64,
    intent: DetachIntent,
) {
    let Some(handle) = registry.get(id).await else {
        return;
    };
    {
        let mut session = handle.lock().await;
        if session.client_seq != seq {
            return; // a newer transport took over; nothing to do
        }
        session.client = None;
        session.disconnected_at = Some(Instant::now());

        let persist = intent == DetachIntent::Involuntary
            && session.upstream_alive
            && session.config.persistence_timeout_ms > 0;
        if persist {
            arm_timer(&mut session, registry.clone(), id.to_string());
            info!(
                session_id = %id,
                timeout_ms = session.config.persistence_timeout_ms,
                "client detached, session persisting"
            );
            return;
        }
    }
    info!(session_id = %id, ?intent, "client detached, cleaning up");
    cleanup(registry, id).await;
}

fn arm_timer(session: &mut Session, registry: Arc<SessionRegistry>, id: String) {
    session.timer_generation += 1;
    let generation = session.timer_generation;
    let wait = Duration::from_millis(session.config.persistence_timeout_ms);
    session.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(wait).await;
        expire(&registry, &id, generation).await;
    }));
}

/// Timer callback. The generation check makes cancellation race-safe: a
/// reattach that cleared the timer first wins even if the sleep already
/// elapsed.
async fn expire(registry: &Arc<SessionRegistry>, id: &str, generation: u64) {
    let removed = registry
        .remove_if(id, |s| {
            s.timer_generation == generation && s.client.is_none()
        })
        .await;
    if let Some(handle) = removed {
        info!(session_id = %id, "persistence timeout expired");
        teardown(handle).await;
    }
}

/// Remove the session and close both legs. Idempotent.
pub async fn cleanup(registry: &Arc<SessionRegistry>, id: &str) {
    if let Some(handle) = registry.remove_if(id, |_| true).await {
        teardown(handle).await;
    }
}

async fn teardown(handle: SessionHandle) {
    let (upstream_tx, client, timer) = {
        let mut session = handle.lock().await;
        session.upstream_alive = false;
        session.timer_generation += 1;
        (
            session.upstream_tx.take(),
            session.client.take(),
            session.timer.take(),
        )
    };
    if let Some(timer) = timer {
        timer.abort();
    }
    if let Some(tx) = client {
        let _ = tx.send(close_frame());
    }
    // Dropping the last sender lets the writer task flush and shut the
    // upstream socket down.
    drop(upstream_tx);
}

/// Pump upstream bytes through the negotiation filter and on to the
/// attached client, or into the replay buffer while none is attached.
/// When the upstream closes, the session is torn down.
pub fn spawn_upstream_pump(
    registry: Arc<SessionRegistry>,
    id: String,
    mut reader: UpstreamReader,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let Some(handle) = registry.get(&id).await else {
                        break;
                    };
                    let mut session = handle.lock().await;
                    if session.closed {
                        break;
                    }
                    let ip = session.client_ip.clone();
                    let out = session.filter.feed(&buf[..n], &ip);
                    if !out.to_upstream.is_empty() {
                        write_upstream(&session, &out.to_upstream);
                    }
                    if out.to_client.is_empty() {
                        continue;
                    }
                    match &session.client {
                        Some(tx) => {
                            let _ = tx.send(Message::Binary(out.to_client.into()));
                        }
                        None => {
                            let max_lines = session.config.max_buffer_lines;
                            if !session.buffer.push(out.to_client, max_lines) {
                                warn!(session_id = %id, "dropping oversized upstream chunk");
                            }
                        }
                    }
                }
                Err(e) => {
                    debug!(session_id = %id, error = %e, "upstream read error");
                    break;
                }
            }
        }
        info!(session_id = %id, "upstream closed");
        cleanup(&registry, &id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use mudgate_core::control::CONTROL_PREFIX;

    fn test_registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new())
    }

    async fn insert_session(registry: &Arc<SessionRegistry>, config: SessionConfig) -> String {
        registry
            .insert(Session::new("1.2.3.4".into(), 40000, config))
            .await
    }

    fn attached_session(
        config: SessionConfig,
    ) -> (Session, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = Session::new("1.2.3.4".into(), 40000, config);
        session.client = Some(tx);
        session.client_seq = 1;
        (session, rx)
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let registry = test_registry();
        let id = insert_session(&registry, SessionConfig::default()).await;
        cleanup(&registry, &id).await;
        cleanup(&registry, &id).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn graceful_detach_removes_session() {
        let registry = test_registry();
        let (session, _rx) = attached_session(SessionConfig::default());
        let id = registry.insert(session).await;

        detach(&registry, &id, 1, DetachIntent::Graceful).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn zero_timeout_detach_removes_session() {
        let registry = test_registry();
        let config = SessionConfig {
            persistence_timeout_ms: 0,
            ..SessionConfig::default()
        };
        let (session, _rx) = attached_session(config);
        let id = registry.insert(session).await;

        detach(&registry, &id, 1, DetachIntent::Involuntary).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn involuntary_detach_persists_and_arms_timer() {
        let registry = test_registry();
        let config = SessionConfig {
            persistence_timeout_ms: 60_000,
            ..SessionConfig::default()
        };
        let (session, _rx) = attached_session(config);
        let id = registry.insert(session).await;

        detach(&registry, &id, 1, DetachIntent::Involuntary).await;
        let handle = registry.get(&id).await.expect("session must persist");
        let session = handle.lock().await;
        assert!(session.client.is_none());
        assert!(session.timer_set());
        assert!(session.disconnected_at.is_some());
    }

    #[tokio::test]
    async fn persistence_timer_expires_session() {
        let registry = test_registry();
        let config = SessionConfig {
            persistence_timeout_ms: 30,
            ..SessionConfig::default()
        };
        let (session, _rx) = attached_session(config);
        let id = registry.insert(session).await;

        detach(&registry, &id, 1, DetachIntent::Involuntary).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(registry.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn reattach_cancels_timer_and_survives() {
        let registry = test_registry();
        let config = SessionConfig {
            persistence_timeout_ms: 50,
            ..SessionConfig::default()
        };
        let (session, _rx) = attached_session(config);
        let id = registry.insert(session).await;

        detach(&registry, &id, 1, DetachIntent::Involuntary).await;

        let (tx, _rx2) = mpsc::unbounded_channel();
        let seq = reattach(&registry, &id, tx, "1.2.3.4".into(), 40000)
            .await
            .unwrap();
        assert_eq!(seq, 2);

        // Well past the original timeout: the reattach must have won.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let handle = registry.get(&id).await.expect("session must survive");
        assert!(!handle.lock().await.timer_set());
    }

    #[tokio::test]
    async fn reattach_unknown_id_fails() {
        let registry = test_registry();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = reattach(&registry, "nosuchsession", tx, "1.2.3.4".into(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn reattach_drains_buffer_in_order_after_reconnected() {
        let registry = test_registry();
        let (session, _rx) = attached_session(SessionConfig::default());
        let id = registry.insert(session).await;
        detach(&registry, &id, 1, DetachIntent::Involuntary).await;

        {
            let handle = registry.get(&id).await.unwrap();
            let mut session = handle.lock().await;
            let max = session.config.max_buffer_lines;
            for chunk in [b"A", b"B", b"C"] {
                session.buffer.push(chunk.to_vec(), max);
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        reattach(&registry, &id, tx, "1.2.3.4".into(), 40000)
            .await
            .unwrap();

        let first = rx.try_recv().unwrap();
        let Message::Binary(control) = first else {
            panic!("expected control frame first");
        };
        assert_eq!(control[0], CONTROL_PREFIX);
        let json: serde_json::Value = serde_json::from_slice(&control[1..]).unwrap();
        assert_eq!(json["type"], "reconnected");
        assert_eq!(json["bufferedCount"], 3);

        for expected in [b"A", b"B", b"C"] {
            let Message::Binary(data) = rx.try_recv().unwrap() else {
                panic!("expected data frame");
            };
            assert_eq!(&data[..], &expected[..]);
        }

        // Buffer is empty whenever a client is attached.
        let handle = registry.get(&id).await.unwrap();
        assert!(handle.lock().await.buffer.is_empty());
    }

    #[tokio::test]
    async fn takeover_closes_old_transport() {
        let registry = test_registry();
        let (session, mut old_rx) = attached_session(SessionConfig::default());
        let id = registry.insert(session).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let seq = reattach(&registry, &id, tx, "5.6.7.8".into(), 41000)
            .await
            .unwrap();
        assert_eq!(seq, 2);

        let msg = old_rx.try_recv().unwrap();
        assert!(matches!(msg, Message::Close(_)));

        // The stale transport's detach must not disturb the new client.
        detach(&registry, &id, 1, DetachIntent::Graceful).await;
        let handle = registry.get(&id).await.expect("session must survive");
        assert!(handle.lock().await.client.is_some());
    }
}
