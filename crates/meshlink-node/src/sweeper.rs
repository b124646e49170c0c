//! Retransmission sweeper.
//!
//! Every tick, each outstanding block in every session is either sent again
//! or, once it has been transmitted `max_send_attempts` times, abandoned.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant};

use crate::node::Node;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub retransmitted: usize,
    pub abandoned: usize,
}

impl Node {
    /// One pass over every session's sending queue.
    pub async fn sweep(&self) -> SweepReport {
        let max_attempts = self.settings().max_send_attempts;
        let mut report = SweepReport::default();

        for (peer, shared) in self.sessions().all() {
            let (addr, datagrams) = {
                let mut session = shared.lock().await;
                let key = session.session_key.clone();
                let mut datagrams = Vec::new();

                for block_id in session.sending.ids() {
                    let exhausted = match session.sending.get(block_id) {
                        Some(block) => block.delivered || block.send_attempts >= max_attempts,
                        None => continue,
                    };
                    if exhausted {
                        if let Some(block) = session.sending.remove(block_id) {
                            if !block.delivered {
                                report.abandoned += 1;
                                tracing::warn!(
                                    node = self.id(),
                                    peer,
                                    block_id,
                                    block_type = ?block.block_type,
                                    attempts = block.send_attempts,
                                    "block abandoned"
                                );
                            }
                        }
                        continue;
                    }

                    let Some(block) = session.sending.get_mut(block_id) else {
                        continue;
                    };
                    match self.encode_block(key.as_ref(), block) {
                        Ok(encoded) => {
                            block.send_attempts += 1;
                            report.retransmitted += 1;
                            tracing::trace!(
                                node = self.id(),
                                peer,
                                block_id,
                                attempt = block.send_attempts,
                                "retransmitting"
                            );
                            datagrams.extend(encoded);
                        }
                        Err(e) => tracing::warn!(
                            node = self.id(),
                            peer,
                            block_id,
                            error = %e,
                            "cannot retransmit block"
                        ),
                    }
                }
                (session.addr, datagrams)
            };
            self.emit(addr, datagrams).await;
        }
        report
    }
}

/// Run `Node::sweep` every `retransmit_interval` until shutdown.
pub async fn sweep_loop(node: Arc<Node>, mut shutdown: broadcast::Receiver<()>) {
    let period = node.settings().retransmit_interval;
    let mut interval = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!(node = node.id(), "sweeper shutting down");
                return;
            }
            _ = interval.tick() => {
                let report = node.sweep().await;
                if report.abandoned > 0 || report.retransmitted > 0 {
                    tracing::debug!(
                        node = node.id(),
                        retransmitted = report.retransmitted,
                        abandoned = report.abandoned,
                        "sweep"
                    );
                }
            }
        }
    }
}
