//! Deterministic in-memory harness: nodes whose transports record outbound
//! datagrams, and helpers that hand them to the peer's `handle_datagram`.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use meshlink_core::crypto::Identity;
use meshlink_core::NodeId;

use crate::node::{Node, NodeSettings, Peer};
use crate::receive::Reassembler;
use crate::receiver::{self, Inbound};
use crate::transport::Transport;

pub struct RecordingTransport {
    addr: SocketAddr,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
}

impl RecordingTransport {
    pub fn new(addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            addr,
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Everything sent so far, clearing the record.
    pub fn take(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn peek(&self) -> Vec<(Vec<u8>, SocketAddr)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send_to(&self, datagram: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.sent.lock().unwrap().push((datagram.to_vec(), addr));
        Ok(datagram.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub wire: Arc<RecordingTransport>,
    pub inbox: mpsc::UnboundedReceiver<Inbound>,
    pub reassembler: Reassembler,
    pub addr: SocketAddr,
}

pub fn test_settings() -> NodeSettings {
    NodeSettings {
        max_packet_size: 128,
        max_send_attempts: 3,
        retransmit_interval: Duration::from_millis(10),
        reassembly_timeout: Duration::from_secs(30),
    }
}

pub fn test_node(id: NodeId) -> TestNode {
    let addr = SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16));
    let wire = RecordingTransport::new(addr);
    let (tx, inbox) = receiver::channel();
    let settings = test_settings();
    let reassembler = Reassembler::new(settings.reassembly_timeout);
    let node = Arc::new(Node::new(
        id,
        Arc::new(Identity::generate()),
        wire.clone(),
        Arc::new(tx),
        settings,
    ));
    TestNode {
        node,
        wire,
        inbox,
        reassembler,
        addr,
    }
}

pub fn peer_of(t: &TestNode) -> Peer {
    Peer {
        id: t.node.id(),
        addr: t.addr,
        public_key: t.node.identity().public(),
    }
}

/// Hand everything `from` has sent so far to `to`. Returns the datagram count.
pub async fn deliver(from: &TestNode, to: &mut TestNode) -> usize {
    let sent = from.wire.take();
    let count = sent.len();
    for (datagram, _) in sent {
        to.node
            .handle_datagram(&mut to.reassembler, &datagram, from.addr)
            .await;
    }
    count
}

/// Exchange datagrams until both sides go quiet.
pub async fn pump(a: &mut TestNode, b: &mut TestNode) {
    for _ in 0..64 {
        let moved = deliver(a, b).await + deliver(b, a).await;
        if moved == 0 {
            return;
        }
    }
    panic!("nodes never went quiet");
}
