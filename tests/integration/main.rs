//! meshlink integration test harness.
//!
//! Every test runs real adapters on loopback UDP sockets bound to
//! OS-assigned ports, so tests can run in parallel without setup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc::UnboundedReceiver;

use meshlink_core::crypto::Identity;
use meshlink_core::NodeId;
use meshlink_node::{receiver, Adapter, Inbound, NodeSettings, Peer};

mod delivery;
mod faults;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestPeer {
    pub adapter: Adapter,
    pub inbox: UnboundedReceiver<Inbound>,
    pub identity: Arc<Identity>,
}

impl TestPeer {
    pub fn peer(&self) -> Peer {
        self.adapter.as_peer().expect("bound adapter has an address")
    }

    /// Next payload from any peer, or an error after `TIMEOUT`.
    pub async fn recv(&mut self) -> Result<Inbound> {
        match tokio::time::timeout(TIMEOUT, self.inbox.recv()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => bail!("inbox closed on node {}", self.adapter.node_id()),
            Err(_) => bail!("node {} received nothing within {TIMEOUT:?}", self.adapter.node_id()),
        }
    }

    /// Collect `n` payloads.
    pub async fn recv_n(&mut self, n: usize) -> Result<Vec<Inbound>> {
        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            out.push(self.recv().await.with_context(|| format!("payload {i} of {n}"))?);
        }
        Ok(out)
    }
}

/// Short retransmit period so recovery paths finish quickly.
pub fn fast_settings() -> NodeSettings {
    NodeSettings {
        retransmit_interval: Duration::from_millis(20),
        max_send_attempts: 100,
        ..NodeSettings::default()
    }
}

pub async fn spawn_node(id: NodeId) -> Result<TestPeer> {
    spawn_node_with(id, Arc::new(Identity::generate()), "127.0.0.1:0", fast_settings()).await
}

pub async fn spawn_node_with(
    id: NodeId,
    identity: Arc<Identity>,
    listen: &str,
    settings: NodeSettings,
) -> Result<TestPeer> {
    let (tx, inbox) = receiver::channel();
    let adapter = Adapter::bind(
        id,
        identity.clone(),
        listen.parse().context("listen address")?,
        settings,
        Arc::new(tx),
    )
    .await
    .with_context(|| format!("bind node {id} on {listen}"))?;
    Ok(TestPeer {
        adapter,
        inbox,
        identity,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_nodes_exchange_both_ways() -> Result<()> {
    let mut a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;

    a.adapter.send(&b.peer(), &b"ping"[..]).await?;
    let got = b.recv().await?;
    assert_eq!(got.from, 1);
    assert_eq!(&got.payload[..], b"ping");

    b.adapter.send(&a.peer(), &b"pong"[..]).await?;
    let got = a.recv().await?;
    assert_eq!(got.from, 2);
    assert_eq!(&got.payload[..], b"pong");

    let snap = a.adapter.session_snapshot(2).await.context("session on a")?;
    assert!(snap.valid);
    Ok(())
}

#[tokio::test]
async fn large_payload_spans_many_packets() -> Result<()> {
    let a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 253) as u8).collect();
    a.adapter.send(&b.peer(), payload.clone()).await?;

    let got = b.recv().await?;
    assert_eq!(got.payload.len(), payload.len());
    assert_eq!(&got.payload[..], &payload[..]);
    Ok(())
}

#[tokio::test]
async fn empty_payload_is_delivered() -> Result<()> {
    let a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;

    a.adapter.send(&b.peer(), Vec::new()).await?;
    assert!(b.recv().await?.payload.is_empty());
    Ok(())
}

#[tokio::test]
async fn three_nodes_full_mesh() -> Result<()> {
    let mut nodes = vec![spawn_node(1).await?, spawn_node(2).await?, spawn_node(3).await?];
    let peers: Vec<Peer> = nodes.iter().map(TestPeer::peer).collect();

    for from in 0..3 {
        for to in 0..3 {
            if from != to {
                let msg = format!("{} to {}", from + 1, to + 1);
                nodes[from].adapter.send(&peers[to], msg.into_bytes()).await?;
            }
        }
    }

    for (i, node) in nodes.iter_mut().enumerate() {
        let mut got: Vec<String> = node
            .recv_n(2)
            .await?
            .into_iter()
            .map(|m| String::from_utf8_lossy(&m.payload).into_owned())
            .collect();
        got.sort();
        let mut want: Vec<String> = (0..3)
            .filter(|&from| from != i)
            .map(|from| format!("{} to {}", from + 1, i + 1))
            .collect();
        want.sort();
        assert_eq!(got, want, "node {}", i + 1);
    }
    Ok(())
}
