//! Public facade: bind a socket, run the receive and sweep tasks, send
//! payloads to peers, shut everything down.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use meshlink_core::crypto::{Identity, PublicIdentity};
use meshlink_core::NodeId;

use crate::error::SendError;
use crate::node::{Node, NodeSettings, Peer, TestMode};
use crate::receive::receive_loop;
use crate::receiver::PayloadReceiver;
use crate::session::SessionSnapshot;
use crate::sweeper::sweep_loop;
use crate::transport::Transport;

pub struct Adapter {
    node: Arc<Node>,
    local_addr: Option<SocketAddr>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Adapter {
    /// Bind a UDP socket at `listen` and start the adapter on it.
    pub async fn bind(
        id: NodeId,
        identity: Arc<Identity>,
        listen: SocketAddr,
        settings: NodeSettings,
        receiver: Arc<dyn PayloadReceiver>,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind(listen).await?;
        Ok(Self::start(id, identity, Arc::new(socket), settings, receiver))
    }

    /// Start the receive and sweep tasks on an existing transport. Must be
    /// called inside a tokio runtime.
    pub fn start(
        id: NodeId,
        identity: Arc<Identity>,
        transport: Arc<dyn Transport>,
        settings: NodeSettings,
        receiver: Arc<dyn PayloadReceiver>,
    ) -> Self {
        let local_addr = transport.local_addr().ok();
        let node = Arc::new(Node::new(id, identity, transport.clone(), receiver, settings));
        let (shutdown_tx, _) = broadcast::channel(1);

        let receive_task = tokio::spawn(receive_loop(
            node.clone(),
            transport,
            shutdown_tx.subscribe(),
        ));
        let sweep_task = tokio::spawn(sweep_loop(node.clone(), shutdown_tx.subscribe()));

        tracing::info!(
            node = id,
            addr = ?local_addr,
            public_key = node.identity().public().to_hex(),
            "adapter started"
        );

        Self {
            node,
            local_addr,
            shutdown_tx,
            tasks: Mutex::new(vec![receive_task, sweep_task]),
            closed: AtomicBool::new(false),
        }
    }

    /// Deliver `payload` to `dest` as one block. Returns an error only if
    /// encrypting on an established session fails. Sends after shutdown are
    /// silently dropped.
    pub async fn send(&self, dest: &Peer, payload: impl Into<Bytes>) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(node = self.node.id(), peer = dest.id, "send after shutdown ignored");
            return Ok(());
        }
        self.node.send(dest, payload.into()).await
    }

    /// Stop both tasks, then release the socket and forget all sessions.
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
        // Last, so a handler that was mid-flight cannot leave a session behind.
        self.node.close();
        tracing::info!(node = self.node.id(), "adapter shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn node_id(&self) -> NodeId {
        self.node.id()
    }

    pub fn public_identity(&self) -> PublicIdentity {
        self.node.identity().public()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// This adapter as a `send` destination for other nodes.
    pub fn as_peer(&self) -> Option<Peer> {
        Some(Peer {
            id: self.node.id(),
            addr: self.local_addr?,
            public_key: self.public_identity(),
        })
    }

    pub async fn session_snapshot(&self, peer: NodeId) -> Option<SessionSnapshot> {
        let session = self.node.sessions().get(peer)?;
        let snapshot = session.lock().await.snapshot();
        Some(snapshot)
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.node.sessions().snapshot().await
    }

    pub fn set_test_mode(&self, mode: TestMode) {
        self.node.set_test_mode(mode);
    }
}

impl Drop for Adapter {
    fn drop(&mut self) {
        self.shutdown();
    }
}
