//! Receive loop: the single consumer of inbound datagrams.
//!
//! datagram → packet → partial block → solid block → handler. Partial blocks
//! live in a table owned by the loop and are evicted once they are older
//! than the reassembly timeout.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use meshlink_core::wire::MAX_DATAGRAM;
use meshlink_core::{Block, BlockError, BlockId, NodeId, Packet};

use crate::node::Node;
use crate::transport::Transport;

/// Delay after a failed receive, doubled per consecutive failure.
const MIN_RECV_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RECV_BACKOFF: Duration = Duration::from_secs(1);

struct Partial {
    block: Block,
    started: Instant,
}

/// Table of blocks still missing fragments, keyed by (sender, block id).
pub struct Reassembler {
    partial: HashMap<(NodeId, BlockId), Partial>,
    timeout: Duration,
}

impl Reassembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partial: HashMap::new(),
            timeout,
        }
    }

    /// Add a packet. Returns the block once it is solid.
    pub fn accept(&mut self, packet: Packet) -> Option<Block> {
        let key = (packet.sender_id, packet.block_id);
        let entry = self.partial.entry(key).or_insert_with(|| Partial {
            block: Block::inbound(&packet),
            started: Instant::now(),
        });

        match entry.block.add_fragment(packet.clone()) {
            Ok(_) => {}
            // A different block reusing the id: the stale partial can never
            // complete, start over from this packet.
            Err(BlockError::ForeignFragment { .. } | BlockError::FragmentCountMismatch { .. }) => {
                tracing::debug!(
                    peer = key.0,
                    block_id = key.1,
                    "fragment disagrees with partial block, restarting it"
                );
                let mut block = Block::inbound(&packet);
                if block.add_fragment(packet).is_err() {
                    self.partial.remove(&key);
                    return None;
                }
                *entry = Partial {
                    block,
                    started: Instant::now(),
                };
            }
            Err(e) => {
                tracing::debug!(peer = key.0, block_id = key.1, error = %e, "fragment dropped");
                return None;
            }
        }

        if entry.block.is_solid() {
            self.partial.remove(&key).map(|p| p.block)
        } else {
            None
        }
    }

    /// Drop partial blocks older than the timeout. Returns how many.
    pub fn expire(&mut self) -> usize {
        let before = self.partial.len();
        let timeout = self.timeout;
        self.partial.retain(|_, p| p.started.elapsed() < timeout);
        before - self.partial.len()
    }

    pub fn pending(&self) -> usize {
        self.partial.len()
    }
}

impl Node {
    /// Process one inbound datagram. Malformed input is logged and dropped.
    pub async fn handle_datagram(
        &self,
        reassembler: &mut Reassembler,
        datagram: &[u8],
        from: SocketAddr,
    ) {
        let packet = match Packet::decode(datagram) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!(node = self.id(), %from, error = %e, "malformed datagram dropped");
                return;
            }
        };
        if packet.receiver_id != self.id() {
            tracing::debug!(
                node = self.id(),
                %from,
                receiver = packet.receiver_id,
                "datagram for another node dropped"
            );
            return;
        }
        tracing::trace!(
            node = self.id(),
            peer = packet.sender_id,
            block_id = packet.block_id,
            index = packet.fragment_index,
            count = packet.fragment_count,
            "packet received"
        );

        let Some(block) = reassembler.accept(packet) else {
            return;
        };
        match block.reconstruct() {
            Ok(payload) => self.dispatch(block, payload, from).await,
            Err(e) => tracing::debug!(node = self.id(), error = %e, "reassembly failed"),
        }
    }
}

/// Run until shutdown is signalled or the node releases its transport.
/// Persistent receive errors are retried with exponential backoff.
pub async fn receive_loop(
    node: Arc<Node>,
    transport: Arc<dyn Transport>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut reassembler = Reassembler::new(node.settings().reassembly_timeout);
    let period = (node.settings().reassembly_timeout / 2).max(Duration::from_millis(100));
    let mut cleanup_interval = tokio::time::interval(period);
    let mut backoff = MIN_RECV_BACKOFF;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(node = node.id(), "receive loop shutting down");
                return;
            }

            _ = cleanup_interval.tick() => {
                let expired = reassembler.expire();
                if expired > 0 {
                    tracing::debug!(
                        node = node.id(),
                        expired,
                        pending = reassembler.pending(),
                        "expired partial blocks"
                    );
                }
            }

            result = transport.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(r) => r,
                    Err(e) if is_transient(&e) => {
                        tracing::debug!(node = node.id(), error = %e, "recv_from interrupted");
                        continue;
                    }
                    Err(e) => {
                        if node.is_closed() {
                            tracing::info!(
                                node = node.id(),
                                "transport released, receive loop exiting"
                            );
                            return;
                        }
                        tracing::warn!(
                            node = node.id(),
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "recv_from failed"
                        );
                        tokio::select! {
                            _ = shutdown.recv() => {
                                tracing::info!(node = node.id(), "receive loop shutting down");
                                return;
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                        backoff = (backoff * 2).min(MAX_RECV_BACKOFF);
                        continue;
                    }
                };
                backoff = MIN_RECV_BACKOFF;
                node.handle_datagram(&mut reassembler, &buf[..len], from).await;
            }
        }
    }
}

/// Errors a datagram socket reports for a single packet, such as an ICMP
/// port-unreachable for an earlier send. The next receive can succeed.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}
