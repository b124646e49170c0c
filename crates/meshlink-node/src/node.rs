//! The transport engine shared by the receive task, the sweeper and callers
//! of `send`.
//!
//! Session state is only touched under the session's own lock. Datagrams
//! are built while the lock is held and emitted after it is released.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;

use meshlink_core::block;
use meshlink_core::config::TransportConfig;
use meshlink_core::crypto::{Identity, PublicIdentity, SymmetricKey};
use meshlink_core::envelope::{self, DataEnvelope};
use meshlink_core::wire::DEFAULT_MAX_PACKET_SIZE;
use meshlink_core::{Block, NodeId, Packet, PacketType};

use crate::error::{ProtocolError, SendError};
use crate::receiver::PayloadReceiver;
use crate::session::{Session, SessionRegistry, SharedSession};
use crate::transport::Transport;

/// Runtime knobs, usually taken from `[transport]` in the config file.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub max_packet_size: usize,
    pub max_send_attempts: u32,
    pub retransmit_interval: Duration,
    pub reassembly_timeout: Duration,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_send_attempts: 20,
            retransmit_interval: Duration::from_millis(250),
            reassembly_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&TransportConfig> for NodeSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_packet_size: config.max_packet_size,
            max_send_attempts: config.max_send_attempts,
            retransmit_interval: config.retransmit_interval(),
            reassembly_timeout: config.reassembly_timeout(),
        }
    }
}

/// Delivery faults injected on the outbound path, for exercising the
/// protocol under reordering and loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TestMode {
    None = 0,
    /// Emit the packets of each block in random order.
    ShufflePackets = 1,
    /// Drop each outbound packet with probability one half.
    LosePackets = 2,
}

impl TestMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => TestMode::ShufflePackets,
            2 => TestMode::LosePackets,
            _ => TestMode::None,
        }
    }
}

/// A destination for `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub id: NodeId,
    pub addr: SocketAddr,
    pub public_key: PublicIdentity,
}

pub struct Node {
    id: NodeId,
    identity: Arc<Identity>,
    sessions: SessionRegistry,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    receiver: Arc<dyn PayloadReceiver>,
    settings: NodeSettings,
    test_mode: AtomicU8,
}

impl Node {
    pub fn new(
        id: NodeId,
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        receiver: Arc<dyn PayloadReceiver>,
        settings: NodeSettings,
    ) -> Self {
        Self {
            id,
            identity,
            sessions: SessionRegistry::new(),
            transport: RwLock::new(Some(transport)),
            receiver,
            settings,
            test_mode: AtomicU8::new(TestMode::None as u8),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub(crate) fn receiver(&self) -> &dyn PayloadReceiver {
        self.receiver.as_ref()
    }

    pub fn set_test_mode(&self, mode: TestMode) {
        self.test_mode.store(mode as u8, Ordering::Relaxed);
    }

    pub fn test_mode(&self) -> TestMode {
        TestMode::from_u8(self.test_mode.load(Ordering::Relaxed))
    }

    pub(crate) fn transport(&self) -> Result<Arc<dyn Transport>, ProtocolError> {
        self.transport
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ProtocolError::TransportUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.transport().is_err()
    }

    /// Existing or new session for `peer`, or `None` once the node is closed.
    /// A session inserted while `close` runs is removed again, so nothing
    /// outlives the clear.
    pub(crate) fn session_for(
        &self,
        peer: NodeId,
        make: impl FnOnce() -> Session,
    ) -> Option<(SharedSession, bool)> {
        if self.is_closed() {
            return None;
        }
        let entry = self.sessions.get_or_insert_with(peer, make);
        if self.is_closed() {
            self.sessions.remove(peer);
            return None;
        }
        Some(entry)
    }

    /// Release the transport, then forget every session.
    pub fn close(&self) {
        self.transport
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.sessions.clear();
    }

    /// Send `payload` to `dest` as one reliable block.
    ///
    /// On a valid session the block goes out immediately. Otherwise it is
    /// queued and, unless a handshake is already running, a new one starts.
    pub async fn send(&self, dest: &Peer, payload: Bytes) -> Result<(), SendError> {
        let Some((shared, created)) =
            self.session_for(dest.id, || Session::new(dest.id, dest.addr))
        else {
            tracing::debug!(node = self.id, peer = dest.id, "send after shutdown ignored");
            return Ok(());
        };

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            if session.peer_key.is_none() {
                session.peer_key = Some(dest.public_key);
            }
            let block_id = session.next_block_id();
            let block = Block::outbound(self.id, dest.id, block_id, PacketType::RawData, payload);

            let datagrams = if session.is_valid() {
                tracing::trace!(node = self.id, peer = dest.id, block_id, "sending data block");
                self.send_tracked(&mut session, block)?
            } else {
                session.waiting.push(block);
                if session.handshake_in_progress() {
                    tracing::trace!(
                        node = self.id,
                        peer = dest.id,
                        block_id,
                        "handshake running, block queued"
                    );
                    Vec::new()
                } else {
                    if !created {
                        session.reset_handshake();
                    }
                    tracing::debug!(node = self.id, peer = dest.id, "starting handshake");
                    self.send_hello(&mut session)?
                }
            };
            (session.addr, datagrams)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// Encode a block for the wire.
    ///
    /// `RawData` is sealed with the session key into a `Data` envelope. The
    /// ciphertext is cached on the block and reused for as long as the key
    /// stays the same, so fragments from different transmissions of one
    /// block always combine.
    pub(crate) fn encode_block(
        &self,
        key: Option<&SymmetricKey>,
        block: &mut Block,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let max = self.settings.max_packet_size;
        let packets = match block.block_type {
            PacketType::RawData => {
                let key = key.ok_or(SendError::NoSessionKey)?;
                let fingerprint = key.fingerprint();
                let sealed = match block.sealed_for(&fingerprint) {
                    Some(sealed) => sealed,
                    None => {
                        let data = key.encrypt(&block.payload)?;
                        let sealed = Bytes::from(envelope::to_bytes(&DataEnvelope { data })?);
                        block.set_sealed(fingerprint, sealed.clone());
                        sealed
                    }
                };
                block::fragment(
                    block.sender_id,
                    block.receiver_id,
                    block.block_id,
                    PacketType::Data,
                    &sealed,
                    max,
                )?
            }
            _ => block.split(max)?,
        };
        Ok(packets.iter().map(Packet::encode).collect())
    }

    /// Encode `block`, count the attempt and keep it for retransmission.
    pub(crate) fn send_tracked(
        &self,
        session: &mut Session,
        mut block: Block,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let datagrams = self.encode_block(session.session_key.as_ref(), &mut block)?;
        block.send_attempts += 1;
        session.sending.push(block);
        Ok(datagrams)
    }

    /// Encode a control block that is never retransmitted.
    pub(crate) fn send_untracked(
        &self,
        session: &mut Session,
        block_type: PacketType,
        payload: Bytes,
    ) -> Result<Vec<Vec<u8>>, SendError> {
        let block_id = session.next_block_id();
        let mut block = Block::outbound(self.id, session.peer_id, block_id, block_type, payload);
        self.encode_block(session.session_key.as_ref(), &mut block)
    }

    pub(crate) fn send_hello(&self, session: &mut Session) -> Result<Vec<Vec<u8>>, SendError> {
        let block_id = session.next_block_id();
        let hello = Block::outbound(
            self.id,
            session.peer_id,
            block_id,
            PacketType::Hello,
            Bytes::copy_from_slice(&self.identity.public().to_bytes()),
        );
        self.send_tracked(session, hello)
    }

    /// Transmit everything queued while the session was not valid, oldest
    /// first.
    pub(crate) fn release_waiting(&self, session: &mut Session) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        for block in session.waiting.drain() {
            let block_id = block.block_id;
            match self.send_tracked(session, block) {
                Ok(datagrams) => out.extend(datagrams),
                Err(e) => tracing::warn!(
                    node = self.id,
                    peer = session.peer_id,
                    block_id,
                    error = %e,
                    "dropping queued block"
                ),
            }
        }
        out
    }

    /// Put datagrams on the wire. Transport failures are logged, never
    /// returned; retransmission covers them.
    pub(crate) async fn emit(&self, addr: SocketAddr, mut datagrams: Vec<Vec<u8>>) {
        if datagrams.is_empty() {
            return;
        }
        let transport = match self.transport() {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(node = self.id, error = %e, "dropping outbound datagrams");
                return;
            }
        };

        let mode = self.test_mode();
        if mode == TestMode::ShufflePackets {
            datagrams.shuffle(&mut rand::thread_rng());
        }
        for datagram in datagrams {
            if mode == TestMode::LosePackets && rand::random::<bool>() {
                tracing::trace!(node = self.id, %addr, "test mode: packet lost");
                continue;
            }
            if let Err(e) = transport.send_to(&datagram, addr).await {
                tracing::warn!(node = self.id, %addr, error = %e, "send_to failed");
            }
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("sessions", &self.sessions.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
