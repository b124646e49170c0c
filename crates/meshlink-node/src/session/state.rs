//! Per-peer session state.

use std::net::SocketAddr;

use meshlink_core::crypto::{generate_nonce, HandshakeNonce, PublicIdentity, SymmetricKey};
use meshlink_core::{BlockId, NodeId, PacketType};

use super::queue::BlockQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Handshake,
    Exchanging,
}

/// Which side generated the current session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrigin {
    Local,
    Remote,
}

/// Cryptographic and delivery state for one peer.
///
/// `waiting` holds blocks that cannot go out until the session is valid.
/// `sending` holds blocks on the wire that await acknowledgment or the next
/// handshake step.
#[derive(Debug)]
pub struct Session {
    pub peer_id: NodeId,
    pub addr: SocketAddr,
    pub peer_key: Option<PublicIdentity>,
    pub local_nonce: Option<HandshakeNonce>,
    pub remote_nonce: Option<HandshakeNonce>,
    pub session_key: Option<SymmetricKey>,
    pub key_origin: Option<KeyOrigin>,
    pub phase: Phase,
    pub waiting: BlockQueue,
    pub sending: BlockQueue,
    next_block_id: BlockId,
}

impl Session {
    pub fn new(peer_id: NodeId, addr: SocketAddr) -> Self {
        Self {
            peer_id,
            addr,
            peer_key: None,
            local_nonce: Some(generate_nonce()),
            remote_nonce: None,
            session_key: None,
            key_origin: None,
            phase: Phase::Handshake,
            waiting: BlockQueue::new(),
            sending: BlockQueue::new(),
            next_block_id: rand::random(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.local_nonce.is_some()
            && self.remote_nonce.is_some()
            && self.session_key.is_some()
            && self.peer_key.is_some()
            && self.peer_id != 0
            && self.phase == Phase::Exchanging
    }

    /// Id for the next block sent to this peer.
    pub fn next_block_id(&mut self) -> BlockId {
        self.next_block_id = self.next_block_id.wrapping_add(1);
        self.next_block_id
    }

    /// A Hello, Welcome or KeyRequest of ours is still awaiting its answer.
    pub fn handshake_in_progress(&self) -> bool {
        self.sending.iter().any(|b| b.block_type.is_handshake())
    }

    /// Key to hand out in SessionKey. The key already held in this handshake
    /// is reused so repeated KeyRequests see the same answer.
    pub fn issue_session_key(&mut self) -> SymmetricKey {
        let key = match &self.session_key {
            Some(key) => key.clone(),
            None => {
                let key = SymmetricKey::generate();
                self.session_key = Some(key.clone());
                self.key_origin = Some(KeyOrigin::Local);
                key
            }
        };
        self.phase = Phase::Exchanging;
        key
    }

    pub fn accept_session_key(&mut self, key: SymmetricKey) {
        self.session_key = Some(key);
        self.key_origin = Some(KeyOrigin::Remote);
        self.phase = Phase::Exchanging;
    }

    /// Restart the handshake. Outstanding blocks move back to `waiting` so
    /// they go out again once the new session is up; stale handshake steps
    /// are dropped.
    pub fn reset_handshake(&mut self) {
        for block in self.sending.drain() {
            self.waiting.push(block);
        }
        for t in [PacketType::Hello, PacketType::Welcome, PacketType::KeyRequest] {
            self.waiting.remove_by_type(t);
        }
        self.local_nonce = Some(generate_nonce());
        self.remote_nonce = None;
        self.session_key = None;
        self.key_origin = None;
        self.phase = Phase::Handshake;
    }

    /// Drop the outstanding block with this id. Returns whether it was queued.
    pub fn mark_delivered(&mut self, id: BlockId) -> bool {
        match self.sending.remove(id) {
            Some(mut block) => {
                block.delivered = true;
                true
            }
            None => false,
        }
    }

    /// Drop every outstanding block of this type; the peer's reply proves
    /// they arrived.
    pub fn mark_delivered_by_type(&mut self, block_type: PacketType) -> usize {
        self.sending.remove_by_type(block_type).len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            peer_id: self.peer_id,
            addr: self.addr,
            phase: self.phase,
            valid: self.is_valid(),
            waiting: self.waiting.len(),
            sending: self.sending.len(),
        }
    }
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub peer_id: NodeId,
    pub addr: SocketAddr,
    pub phase: Phase,
    pub valid: bool,
    pub waiting: usize,
    pub sending: usize,
}
