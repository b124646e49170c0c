use std::time::Duration;

use anyhow::{Context, Result};

use meshlink_node::TestMode;

use crate::*;

#[tokio::test]
async fn shuffled_packets_reassemble() -> Result<()> {
    let a = spawn_node(1).await?;
    let mut b = spawn_node(2).await?;
    a.adapter.set_test_mode(TestMode::ShufflePackets);
    b.adapter.set_test_mode(TestMode::ShufflePackets);

    let payload: Vec<u8> = (0..20_000u32).map(|i| (i * 7 % 256) as u8).collect();
    a.adapter.send(&b.peer(), payload.clone()).await?;
    assert_eq!(&b.recv().await?.payload[..], &payload[..]);
    Ok(())
}

#[tokio::test]
async fn lossy_sender_still_delivers() -> Result<()> {
    let settings = NodeSettings {
        retransmit_interval: Duration::from_millis(15),
        max_send_attempts: 400,
        ..NodeSettings::default()
    };
    let listen = "127.0.0.1:0";
    let a = spawn_node_with(1, Arc::new(Identity::generate()), listen, settings.clone()).await?;
    let mut b = spawn_node_with(2, Arc::new(Identity::generate()), listen, settings).await?;
    a.adapter.set_test_mode(TestMode::LosePackets);

    let dest = b.peer();
    for msg in [&b"one"[..], &b"two"[..], &[0x42; 1500][..]] {
        a.adapter.send(&dest, msg.to_vec()).await?;
    }

    let mut lens: Vec<usize> = b.recv_n(3).await?.iter().map(|m| m.payload.len()).collect();
    lens.sort();
    assert_eq!(lens, vec![3, 3, 1500]);
    Ok(())
}

/// The peer restarts with the same identity and address but no sessions.
/// Its Nack makes us handshake again and resend.
#[tokio::test]
async fn restarted_peer_recovers_via_nack() -> Result<()> {
    let mut a = spawn_node(1).await?;
    let b = spawn_node(2).await?;
    let b_peer = b.peer();
    let b_addr = b_peer.addr.to_string();
    let b_identity = b.identity.clone();

    a.adapter.send(&b_peer, &b"first"[..]).await?;
    b.adapter.send(&a.peer(), &b"hi a"[..]).await?;
    a.recv().await?;

    drop(b);

    // The old socket closes once its aborted task is dropped.
    let mut restarted = None;
    for _ in 0..100 {
        match spawn_node_with(2, b_identity.clone(), &b_addr, fast_settings()).await {
            Ok(node) => {
                restarted = Some(node);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut b = restarted.context("rebinding restarted peer")?;

    a.adapter.send(&b_peer, &b"after restart"[..]).await?;
    let got = b.recv().await?;
    assert_eq!(got.from, 1);
    assert_eq!(&got.payload[..], b"after restart");
    assert!(a.adapter.session_snapshot(2).await.context("session")?.valid);
    Ok(())
}
