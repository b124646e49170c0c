use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;

use meshlink_node::Phase;

use crate::*;

/// Both sides open a session to each other at the same moment.
#[tokio::test]
async fn simultaneous_open_delivers_both_ways() -> Result<()> {
    let mut a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;
    let (pa, pb) = (a.peer(), b.peer());

    let (ra, rb) = tokio::join!(
        a.adapter.send(&pb, &b"from a"[..]),
        b.adapter.send(&pa, &b"from b"[..]),
    );
    ra?;
    rb?;

    assert_eq!(&b.recv().await?.payload[..], b"from a");
    assert_eq!(&a.recv().await?.payload[..], b"from b");
    Ok(())
}

/// Many sends queued during the handshake all arrive once it completes.
#[tokio::test]
async fn queued_payloads_all_arrive() -> Result<()> {
    let a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;
    let dest = b.peer();

    for i in 0..50u32 {
        a.adapter.send(&dest, i.to_be_bytes().to_vec()).await?;
    }

    let mut seen = BTreeSet::new();
    while seen.len() < 50 {
        let msg = b.recv().await?;
        let raw: [u8; 4] = msg.payload[..].try_into()?;
        seen.insert(u32::from_be_bytes(raw));
    }
    assert_eq!(seen, (0..50).collect::<BTreeSet<u32>>());
    Ok(())
}

/// Sends from several tasks over one adapter.
#[tokio::test]
async fn concurrent_senders_share_a_session() -> Result<()> {
    let a = Arc::new(spawn_node(1).await?.adapter);
    let mut b = spawn_node(2).await?;
    let dest = b.peer();

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let a = a.clone();
        tasks.push(tokio::spawn(async move {
            a.send(&dest, vec![i; 700]).await
        }));
    }
    for t in tasks {
        t.await??;
    }

    let mut firsts: Vec<u8> = b.recv_n(8).await?.iter().map(|m| m.payload[0]).collect();
    firsts.sort();
    assert_eq!(firsts, (0..8).collect::<Vec<u8>>());
    assert_eq!(b.adapter.sessions().await.len(), 1);
    Ok(())
}

/// A peer that never answers: the handshake is abandoned after the attempt
/// limit and the payload stays queued.
#[tokio::test]
async fn silent_peer_gives_up_after_max_attempts() -> Result<()> {
    let settings = NodeSettings {
        retransmit_interval: Duration::from_millis(10),
        max_send_attempts: 5,
        ..NodeSettings::default()
    };
    let a = spawn_node_with(1, Arc::new(Identity::generate()), "127.0.0.1:0", settings).await?;

    // Bound but never read.
    let sink = std::net::UdpSocket::bind("127.0.0.1:0")?;
    let dest = Peer {
        id: 2,
        addr: sink.local_addr()?,
        public_key: Identity::generate().public(),
    };
    a.adapter.send(&dest, &b"anyone?"[..]).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    let snap = a.adapter.session_snapshot(2).await.expect("session exists");
    assert_eq!(snap.phase, Phase::Handshake);
    assert_eq!(snap.sending, 0, "hello abandoned");
    assert_eq!(snap.waiting, 1);
    Ok(())
}

/// Shutdown stops the node: later sends are silent no-ops.
#[tokio::test]
async fn shutdown_releases_state() -> Result<()> {
    let a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;

    a.adapter.send(&b.peer(), &b"before"[..]).await?;
    b.recv().await?;

    a.adapter.shutdown();
    a.adapter.shutdown();
    a.adapter.send(&b.peer(), &b"after"[..]).await?;
    assert!(a.adapter.sessions().await.is_empty());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), b.inbox.recv())
            .await
            .is_err(),
        "nothing sent after shutdown"
    );
    Ok(())
}
