//! meshlinkd: meshlink peer daemon.
//!
//! Reads lines of the form `<peer id> <message>` on stdin and sends each
//! message to that peer. Payloads received from peers are logged.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;

use meshlink_core::config::{MeshlinkConfig, PeerConfig};
use meshlink_core::crypto::{Identity, PublicIdentity};
use meshlink_core::NodeId;
use meshlink_node::{receiver, Adapter, NodeSettings, Peer};

fn resolve_peers(peers: &[PeerConfig]) -> Result<HashMap<NodeId, Peer>> {
    peers
        .iter()
        .map(|p| {
            let public_key = PublicIdentity::from_hex(&p.public_key)
                .with_context(|| format!("peer {} public_key", p.id))?;
            Ok((
                p.id,
                Peer {
                    id: p.id,
                    addr: p.addr,
                    public_key,
                },
            ))
        })
        .collect()
}

fn parse_line(line: &str) -> Option<(NodeId, &str)> {
    let (id, message) = line.trim().split_once(char::is_whitespace)?;
    Some((id.parse().ok()?, message.trim_start()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = MeshlinkConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = MeshlinkConfig::load().context("failed to load config")?;
    let peers = resolve_peers(&config.peers)?;

    // Identity
    let identity = Arc::new(
        Identity::load_or_generate(&config.node.identity_path).with_context(|| {
            format!("identity at {}", config.node.identity_path.display())
        })?,
    );
    tracing::info!(
        node = config.node.id,
        public_key = identity.public().to_hex(),
        peers = peers.len(),
        "identity ready"
    );

    // Adapter
    let (inbound_tx, mut inbound_rx) = receiver::channel();
    let adapter = Arc::new(
        Adapter::bind(
            config.node.id,
            identity,
            config.node.listen,
            NodeSettings::from(&config.transport),
            Arc::new(inbound_tx),
        )
        .await
        .with_context(|| format!("failed to bind {}", config.node.listen))?,
    );

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let inbound_printer = tokio::spawn(async move {
        while let Some(msg) = inbound_rx.recv().await {
            tracing::info!(
                from = msg.from,
                len = msg.payload.len(),
                text = %String::from_utf8_lossy(&msg.payload),
                "payload received"
            );
        }
    });

    let session_printer = {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(10));
            loop {
                interval.tick().await;
                let sessions = adapter.sessions().await;
                tracing::info!(count = sessions.len(), "session table snapshot");
                for s in sessions {
                    tracing::info!(
                        peer = s.peer_id,
                        addr = %s.addr,
                        phase = ?s.phase,
                        valid = s.valid,
                        waiting = s.waiting,
                        sending = s.sending,
                        "  session"
                    );
                }
            }
        })
    };

    {
        let adapter = adapter.clone();
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                let Some((id, message)) = parse_line(&line) else {
                    tracing::warn!(line = %line, "expected `<peer id> <message>`");
                    continue;
                };
                let Some(peer) = peers.get(&id) else {
                    tracing::warn!(peer = id, "peer not in config");
                    continue;
                };
                if let Err(e) = adapter.send(peer, message.as_bytes().to_vec()).await {
                    tracing::warn!(peer = id, error = %e, "send failed");
                }
            }
            tracing::info!("stdin closed, still serving peers");
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::select! {
        _ = tokio::signal::ctrl_c()  => tracing::info!("shutdown signal received"),
        r = inbound_printer          => tracing::error!("inbound printer exited: {:?}", r),
        r = session_printer          => tracing::error!("session printer exited: {:?}", r),
    }

    adapter.shutdown();
    Ok(())
}
