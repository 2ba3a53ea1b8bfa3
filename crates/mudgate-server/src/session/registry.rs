//! In-memory session registry.
//!
//! Maps opaque session ids to live sessions. The map lock is held only for
//! lookups and insert/remove; all session state is mutated under the
//! per-session lock, so independent sessions proceed in parallel.

use super::{Session, SessionHandle};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Session ids are 24 characters drawn from `[a-z0-9]`.
pub const SESSION_ID_LEN: usize = 24;

/// Counts reported by the operational endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryStats {
    /// Sessions with a client currently attached.
    pub attached: usize,
    /// Sessions persisting without a client.
    pub persisted: usize,
    /// Bytes held in replay buffers across all sessions.
    pub buffered_bytes: usize,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session under a freshly generated id, retrying on the
    /// (astronomically unlikely) collision. Returns the id.
    pub async fn insert(&self, mut session: Session) -> String {
        let mut map = self.sessions.write().await;
        loop {
            let id = generate_session_id();
            if map.contains_key(&id) {
                continue;
            }
            session.id = id.clone();
            map.insert(id.clone(), Arc::new(Mutex::new(session)));
            info!(session_id = %id, total = map.len(), "session registered");
            return id;
        }
    }

    pub async fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session if `pred` holds for it, marking it closed under its
    /// own lock before the map entry disappears so that holders of a stale
    /// handle observe the death. Returns the removed handle for teardown.
    pub async fn remove_if<F>(&self, id: &str, pred: F) -> Option<SessionHandle>
    where
        F: FnOnce(&Session) -> bool,
    {
        let mut map = self.sessions.write().await;
        let handle = map.get(id)?.clone();
        {
            let mut session = handle.lock().await;
            if !pred(&session) {
                return None;
            }
            session.closed = true;
        }
        map.remove(id);
        info!(session_id = %id, total = map.len(), "session removed");
        Some(handle)
    }

    /// Snapshot of all live session ids.
    pub async fn ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Aggregate counts for `/stats`.
    pub async fn stats(&self) -> RegistryStats {
        let map = self.sessions.read().await;
        let mut stats = RegistryStats::default();
        for handle in map.values() {
            let session = handle.lock().await;
            if session.client.is_some() {
                stats.attached += 1;
            } else {
                stats.persisted += 1;
            }
            stats.buffered_bytes += session.buffer.byte_size();
        }
        stats
    }
}

fn generate_session_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..SESSION_ID_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}
