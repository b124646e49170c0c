//! Handshake and data-plane handlers for solid inbound blocks.
//!
//! ```text
//! initiator                         responder
//!   Hello(public identity)     →
//!                              ←   Welcome(responder nonce)
//!   KeyRequest(signed nonces)  →
//!                              ←   SessionKey(sealed key + initiator nonce, signed)
//! ```
//!
//! Hello, Welcome and KeyRequest are retransmitted until the next step
//! arrives. SessionKey, Ack and Nack are sent once; a lost SessionKey is
//! recovered by the retransmitted KeyRequest.

use std::net::SocketAddr;

use bytes::Bytes;

use meshlink_core::crypto::{HandshakeNonce, PublicIdentity, SymmetricKey, NONCE_LEN};
use meshlink_core::envelope::{
    self, DataEnvelope, KeyRequestBody, SessionKeyBody, SignedEnvelope,
};
use meshlink_core::{Block, NodeId, PacketType};

use crate::error::ProtocolError;
use crate::node::Node;
use crate::session::{KeyOrigin, Phase, Session};

fn to_nonce(kind: PacketType, bytes: &[u8]) -> Result<HandshakeNonce, ProtocolError> {
    bytes.try_into().map_err(|_| {
        ProtocolError::malformed(
            kind,
            format!("nonce must be {NONCE_LEN} bytes, got {}", bytes.len()),
        )
    })
}

impl Node {
    /// Route a solid block to its handler. Failures are logged and dropped.
    pub(crate) async fn dispatch(&self, block: Block, payload: Bytes, from: SocketAddr) {
        let peer = block.sender_id;
        let block_type = block.block_type;
        tracing::trace!(
            node = self.id(),
            peer,
            block_id = block.block_id,
            ?block_type,
            len = payload.len(),
            "block received"
        );

        let result = match block_type {
            PacketType::Hello => self.on_hello(peer, from, payload).await,
            PacketType::Welcome => self.on_welcome(peer, payload).await,
            PacketType::KeyRequest => self.on_key_request(peer, payload).await,
            PacketType::SessionKey => self.on_session_key(peer, payload).await,
            PacketType::Data => self.on_data(peer, from, block.block_id, payload).await,
            PacketType::Ack => self.on_ack(peer, payload).await,
            PacketType::Nack => self.on_nack(peer, payload).await,
            PacketType::RawData => Err(ProtocolError::malformed(block_type, "not a wire type")),
        };

        if let Err(e) = result {
            match &e {
                ProtocolError::Verification | ProtocolError::NonceMismatch => tracing::warn!(
                    node = self.id(),
                    peer,
                    ?block_type,
                    error = %e,
                    "handshake step rejected"
                ),
                _ => tracing::debug!(
                    node = self.id(),
                    peer,
                    ?block_type,
                    error = %e,
                    "block dropped"
                ),
            }
        }
    }

    /// Step 1 received: (re)start the handshake as responder.
    ///
    /// The announced key must match the key already held for this peer,
    /// if any.
    pub(crate) async fn on_hello(
        &self,
        peer: NodeId,
        from: SocketAddr,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let peer_key = PublicIdentity::from_bytes(&payload)
            .map_err(|e| ProtocolError::malformed(PacketType::Hello, e))?;

        let (shared, created) = self
            .session_for(peer, || Session::new(peer, from))
            .ok_or(ProtocolError::TransportUnavailable)?;

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            // A known key is pinned; only keyless sessions learn it from Hello.
            if let Some(known) = session.peer_key {
                if known != peer_key {
                    tracing::warn!(
                        node = self.id(),
                        peer,
                        %from,
                        "hello carries a different public key than the one on record"
                    );
                    return Err(ProtocolError::Verification);
                }
            }
            if !created {
                session.reset_handshake();
            }
            session.peer_key = Some(peer_key);
            session.addr = from;

            let local_nonce = session.local_nonce.ok_or(ProtocolError::NonceMismatch)?;
            let block_id = session.next_block_id();
            let welcome = Block::outbound(
                self.id(),
                peer,
                block_id,
                PacketType::Welcome,
                Bytes::copy_from_slice(&local_nonce),
            );
            tracing::debug!(
                node = self.id(),
                peer,
                created,
                "hello received, sending welcome"
            );
            (session.addr, self.send_tracked(&mut session, welcome)?)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// Step 2 received: sign both nonces and ask for the session key.
    pub(crate) async fn on_welcome(
        &self,
        peer: NodeId,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let remote_nonce = to_nonce(PacketType::Welcome, &payload)?;
        let shared = self
            .sessions()
            .get(peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            let local_nonce = session.local_nonce.ok_or(ProtocolError::NonceMismatch)?;

            session.remote_nonce = Some(remote_nonce);
            session.mark_delivered_by_type(PacketType::Hello);
            session.sending.remove_by_type(PacketType::KeyRequest);

            let body = envelope::to_bytes(&KeyRequestBody {
                sender_nonce: local_nonce.to_vec(),
                receiver_nonce: remote_nonce.to_vec(),
            })
            .map_err(|e| ProtocolError::malformed(PacketType::KeyRequest, e))?;
            let signature = self.identity().sign(&body);
            let request = envelope::to_bytes(&SignedEnvelope {
                data: body,
                signature,
            })
            .map_err(|e| ProtocolError::malformed(PacketType::KeyRequest, e))?;

            let block_id = session.next_block_id();
            let block =
                Block::outbound(self.id(), peer, block_id, PacketType::KeyRequest, request);
            tracing::debug!(node = self.id(), peer, "welcome received, requesting session key");
            (session.addr, self.send_tracked(&mut session, block)?)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// Step 3 received: verify the requester, hand out the session key and
    /// start exchanging.
    pub(crate) async fn on_key_request(
        &self,
        peer: NodeId,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let request: SignedEnvelope = envelope::from_bytes(&payload)
            .map_err(|e| ProtocolError::malformed(PacketType::KeyRequest, e))?;
        let shared = self
            .sessions()
            .get(peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            let peer_key = session.peer_key.ok_or(ProtocolError::NoPublicKey(peer))?;
            peer_key
                .verify(&request.data, &request.signature)
                .map_err(|_| ProtocolError::Verification)?;

            let body: KeyRequestBody = envelope::from_bytes(&request.data)
                .map_err(|e| ProtocolError::malformed(PacketType::KeyRequest, e))?;
            let local_nonce = session.local_nonce.ok_or(ProtocolError::NonceMismatch)?;
            if body.receiver_nonce[..] != local_nonce[..] {
                return Err(ProtocolError::NonceMismatch);
            }
            let requester_nonce = to_nonce(PacketType::KeyRequest, &body.sender_nonce)?;

            session.mark_delivered_by_type(PacketType::Welcome);
            session.remote_nonce = Some(requester_nonce);
            let was_exchanging = session.phase == Phase::Exchanging;
            let key = session.issue_session_key();

            let sealed = peer_key.encrypt(&envelope::to_bytes(&SessionKeyBody {
                session_key: key.as_bytes().to_vec(),
                receiver_nonce: requester_nonce.to_vec(),
            })
            .map_err(|e| ProtocolError::malformed(PacketType::SessionKey, e))?)?;
            let signature = self.identity().sign(&sealed);
            let reply = envelope::to_bytes(&SignedEnvelope {
                data: sealed,
                signature,
            })
            .map_err(|e| ProtocolError::malformed(PacketType::SessionKey, e))?;

            let mut datagrams =
                self.send_untracked(&mut session, PacketType::SessionKey, Bytes::from(reply))?;
            datagrams.extend(self.release_waiting(&mut session));
            if !was_exchanging {
                tracing::info!(node = self.id(), peer, role = "responder", "session established");
            }
            (session.addr, datagrams)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// Step 4 received: take the key the responder issued.
    ///
    /// If both sides issued a key in the same handshake, the key issued by
    /// the lower node id is kept by both.
    pub(crate) async fn on_session_key(
        &self,
        peer: NodeId,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let reply: SignedEnvelope = envelope::from_bytes(&payload)
            .map_err(|e| ProtocolError::malformed(PacketType::SessionKey, e))?;
        let shared = self
            .sessions()
            .get(peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            let peer_key = session.peer_key.ok_or(ProtocolError::NoPublicKey(peer))?;
            peer_key
                .verify(&reply.data, &reply.signature)
                .map_err(|_| ProtocolError::Verification)?;

            let plain = zeroize::Zeroizing::new(self.identity().decrypt(&reply.data)?);
            let body: SessionKeyBody = envelope::from_bytes(&plain)
                .map_err(|e| ProtocolError::malformed(PacketType::SessionKey, e))?;
            let body_key = zeroize::Zeroizing::new(body.session_key);
            let local_nonce = session.local_nonce.ok_or(ProtocolError::NonceMismatch)?;
            if body.receiver_nonce[..] != local_nonce[..] {
                return Err(ProtocolError::NonceMismatch);
            }
            let key = SymmetricKey::from_bytes(&body_key)?;

            session.mark_delivered_by_type(PacketType::KeyRequest);
            let was_exchanging = session.phase == Phase::Exchanging;
            let keep_ours = session.key_origin == Some(KeyOrigin::Local)
                && session.session_key.is_some()
                && self.id() < peer;
            if keep_ours {
                tracing::debug!(node = self.id(), peer, "both sides issued a key, keeping ours");
            } else {
                session.accept_session_key(key);
            }

            let datagrams = self.release_waiting(&mut session);
            if !was_exchanging {
                tracing::info!(node = self.id(), peer, role = "initiator", "session established");
            }
            (session.addr, datagrams)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// Encrypted application payload.
    ///
    /// Delivered and acknowledged on a valid session. Otherwise the sender
    /// is told with a Nack that it must handshake again; our own handshake
    /// state is left as it is.
    pub(crate) async fn on_data(
        &self,
        peer: NodeId,
        from: SocketAddr,
        block_id: meshlink_core::BlockId,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let (shared, created) = self
            .session_for(peer, || Session::new(peer, from))
            .ok_or(ProtocolError::TransportUnavailable)?;

        let (addr, datagrams, delivered) = {
            let mut session = shared.lock().await;
            let reply = envelope::encode_block_ref(block_id);

            if !created && session.is_valid() {
                let data: DataEnvelope = envelope::from_bytes(&payload)
                    .map_err(|e| ProtocolError::malformed(PacketType::Data, e))?;
                let key = session
                    .session_key
                    .clone()
                    .ok_or(ProtocolError::UnknownSession(peer))?;
                let plain = key.decrypt(&data.data)?;
                let ack = self.send_untracked(
                    &mut session,
                    PacketType::Ack,
                    Bytes::copy_from_slice(&reply),
                )?;
                (session.addr, ack, Some(Bytes::from(plain)))
            } else {
                tracing::debug!(
                    node = self.id(),
                    peer,
                    block_id,
                    created,
                    handshaking = session.handshake_in_progress(),
                    "data on invalid session, sending nack"
                );
                let nack = self.send_untracked(
                    &mut session,
                    PacketType::Nack,
                    Bytes::copy_from_slice(&reply),
                )?;
                (session.addr, nack, None)
            }
        };

        if let Some(plain) = delivered {
            tracing::trace!(
                node = self.id(),
                peer,
                block_id,
                len = plain.len(),
                "payload delivered"
            );
            self.receiver().accept(peer, plain);
        }
        self.emit(addr, datagrams).await;
        Ok(())
    }

    /// The peer received our Data block. Repeated Acks are no-ops.
    pub(crate) async fn on_ack(&self, peer: NodeId, payload: Bytes) -> Result<(), ProtocolError> {
        let block_id = envelope::decode_block_ref(&payload)
            .map_err(|e| ProtocolError::malformed(PacketType::Ack, e))?;
        let shared = self
            .sessions()
            .get(peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;
        let removed = shared.lock().await.mark_delivered(block_id);
        tracing::trace!(node = self.id(), peer, block_id, removed, "ack received");
        Ok(())
    }

    /// The peer has no session for us. Only honoured while our session is
    /// valid; queued and outstanding blocks go out again after a new
    /// handshake.
    pub(crate) async fn on_nack(&self, peer: NodeId, payload: Bytes) -> Result<(), ProtocolError> {
        let block_id = envelope::decode_block_ref(&payload)
            .map_err(|e| ProtocolError::malformed(PacketType::Nack, e))?;
        let shared = self
            .sessions()
            .get(peer)
            .ok_or(ProtocolError::UnknownSession(peer))?;

        let (addr, datagrams) = {
            let mut session = shared.lock().await;
            if !session.is_valid() {
                tracing::debug!(
                    node = self.id(),
                    peer,
                    block_id,
                    "nack ignored, session not valid"
                );
                return Ok(());
            }
            tracing::warn!(
                node = self.id(),
                peer,
                block_id,
                "peer lost our session, restarting handshake"
            );
            session.reset_handshake();
            (session.addr, self.send_hello(&mut session)?)
        };

        self.emit(addr, datagrams).await;
        Ok(())
    }
}
