//! Session registry: NodeId → shared session.
//!
//! Sharded map so lookups for unrelated peers never contend; each session
//! carries its own async lock. A map guard is never held across an await.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;

use meshlink_core::NodeId;

use super::state::{Session, SessionSnapshot};

pub type SharedSession = Arc<Mutex<Session>>;

#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<DashMap<NodeId, SharedSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, peer: NodeId) -> Option<SharedSession> {
        self.inner.get(&peer).map(|entry| entry.value().clone())
    }

    /// Existing session for `peer`, or a new one from `make`. The flag is
    /// true when the session was created by this call.
    pub fn get_or_insert_with(
        &self,
        peer: NodeId,
        make: impl FnOnce() -> Session,
    ) -> (SharedSession, bool) {
        match self.inner.entry(peer) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let session = Arc::new(Mutex::new(make()));
                e.insert(session.clone());
                (session, true)
            }
        }
    }

    /// All sessions, cloned out of the map.
    pub fn all(&self) -> Vec<(NodeId, SharedSession)> {
        self.inner
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    pub async fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut out = Vec::new();
        for (_, session) in self.all() {
            out.push(session.lock().await.snapshot());
        }
        out.sort_by_key(|s| s.peer_id);
        out
    }

    pub fn remove(&self, peer: NodeId) -> Option<SharedSession> {
        self.inner.remove(&peer).map(|(_, session)| session)
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
