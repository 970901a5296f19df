//! Session runtime integration tests: real children on real PTYs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::timeout;

use tether_core::TetherError;
use tether_supervisor::{StartSpec, Supervisor};

fn spec(id: &str, script: &str) -> StartSpec {
    StartSpec {
        id: id.to_string(),
        argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
        cwd: PathBuf::from("/tmp"),
        env: HashMap::new(),
        rows: 40,
        cols: 80,
    }
}

/// `needle` appears in `haystack` as a subsequence (terminal echo may
/// interleave carriage returns).
fn contains_in_order(haystack: &[u8], needle: &[u8]) -> bool {
    let mut it = haystack.iter();
    needle.iter().all(|b| it.any(|h| h == b))
}

async fn drain(rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>, deadline: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = timeout(deadline, async {
        while let Some(chunk) = rx.recv().await {
            out.extend_from_slice(&chunk);
        }
    })
    .await;
    out
}

#[tokio::test]
async fn short_lived_child_output_and_done() {
    let supervisor = Supervisor::new();
    let session = supervisor
        .start(spec("s1", "sleep 0.2; printf hello; printf world"))
        .await
        .unwrap();
    assert!(session.pid() > 0);

    let (mut rx, _sub) = session.subscribe();
    let bytes = drain(&mut rx, Duration::from_secs(5)).await;
    assert_eq!(bytes, b"helloworld");

    let summary = timeout(Duration::from_secs(2), session.done()).await.unwrap();
    assert!(!summary.signalled);
    assert!(session.is_stopped());
}

#[tokio::test]
async fn early_subscriber_sees_prefix_and_replay_is_bounded_suffix() {
    let supervisor = Supervisor::new();
    // 200000 bytes of 'a': twice the ring cap.
    let session = supervisor
        .start(spec(
            "s2",
            "sleep 0.2; head -c 200000 /dev/zero | tr '\\0' a",
        ))
        .await
        .unwrap();

    let (mut rx, _sub) = session.subscribe();
    let bytes = drain(&mut rx, Duration::from_secs(10)).await;
    assert_eq!(bytes.len(), 200_000);
    assert!(bytes.iter().all(|&b| b == b'a'));

    timeout(Duration::from_secs(2), session.done()).await.unwrap();
    let replay = session.replay();
    assert_eq!(replay.len(), 100 * 1024);
    assert_eq!(&bytes[bytes.len() - replay.len()..], replay.as_slice());

    let tail = session.tail(1000);
    assert_eq!(tail.len(), 1000);
}

#[tokio::test]
async fn replay_then_subscribe_covers_catch_up() {
    let supervisor = Supervisor::new();
    let session = supervisor
        .start(spec("s3", "printf early; sleep 10"))
        .await
        .unwrap();

    // Wait for the first burst to land in the ring.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while session.replay().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "no output arrived");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let replay = session.replay();
    let (mut rx, _sub) = session.subscribe();
    assert_eq!(replay, b"early");

    session.write(b"ignored-by-sleep").await.unwrap();
    session.stop();
    let echoed = drain(&mut rx, Duration::from_secs(5)).await;
    // Live stream starts after the snapshot: no overlap with the replay.
    assert!(!echoed.starts_with(b"early"));
    timeout(Duration::from_secs(5), session.done()).await.unwrap();
}

#[tokio::test]
async fn cat_round_trip_preserves_write_order() {
    let supervisor = Supervisor::new();
    let session = supervisor.start(spec("s4", "exec /bin/cat")).await.unwrap();
    let (mut rx, _sub) = session.subscribe();

    let n = session.write(b"abc\n").await.unwrap();
    assert_eq!(n, 4);
    session.write(b"def\n").await.unwrap();

    let mut seen = Vec::new();
    let ok = timeout(Duration::from_secs(5), async {
        while let Some(chunk) = rx.recv().await {
            seen.extend_from_slice(&chunk);
            if contains_in_order(&seen, b"abc\ndef\n") {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(ok, "did not observe abc/def in order: {:?}", seen);

    session.stop();
    timeout(Duration::from_secs(5), session.done()).await.unwrap();
}

#[tokio::test]
async fn slow_subscriber_drops_without_stalling_others() {
    let supervisor = Supervisor::new();
    let session = supervisor
        .start(spec("s5", "while :; do printf xxxxxxxxxxxxxxxx; done"))
        .await
        .unwrap();

    let (mut fast_rx, _fast) = session.subscribe();
    let (_slow_rx, slow) = session.subscribe();

    let fast_total = tokio::spawn(async move {
        let mut total = 0usize;
        let _ = timeout(Duration::from_secs(3), async {
            while let Some(chunk) = fast_rx.recv().await {
                total += chunk.len();
            }
        })
        .await;
        total
    });

    let total = fast_total.await.unwrap();
    assert!(total >= 64 * 1024, "fast subscriber starved: {total} bytes");
    assert!(
        slow.dropped_payloads() > 0,
        "slow subscriber never saturated"
    );

    session.stop();
    timeout(Duration::from_secs(5), session.done()).await.unwrap();
}

#[tokio::test]
async fn parallel_stops_fire_done_once() {
    let supervisor = Supervisor::new();
    let session = supervisor.start(spec("s6", "sleep 30")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let s = session.clone();
        handles.push(tokio::spawn(async move { s.stop() }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let summary = timeout(Duration::from_secs(4), session.done()).await.unwrap();
    assert!(summary.signalled);
    // Done is observable again without blocking.
    let again = timeout(Duration::from_secs(1), session.done()).await.unwrap();
    assert!(again.signalled);
}

#[tokio::test]
async fn ended_session_rejects_write_and_closes_new_subscribers() {
    let supervisor = Supervisor::new();
    let session = supervisor.start(spec("s7", "true")).await.unwrap();
    timeout(Duration::from_secs(5), session.done()).await.unwrap();

    match session.write(b"late").await {
        Err(TetherError::Closed) => {}
        other => panic!("expected Closed, got {other:?}"),
    }

    let (mut rx, _sub) = session.subscribe();
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn live_id_cannot_be_reused() {
    let supervisor = Supervisor::new();
    let session = supervisor.start(spec("dup", "sleep 30")).await.unwrap();

    match supervisor.start(spec("dup", "true")).await {
        Err(TetherError::IdInUse(id)) => assert_eq!(id, "dup"),
        other => panic!("expected IdInUse, got {other:?}"),
    }

    session.stop();
    timeout(Duration::from_secs(5), session.done()).await.unwrap();

    // After the reap the registry slot frees up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while supervisor.get("dup").await.is_some() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let reused = supervisor.start(spec("dup", "true")).await.unwrap();
    timeout(Duration::from_secs(5), reused.done()).await.unwrap();
}

#[tokio::test]
async fn unknown_ids_and_bad_specs_are_rejected() {
    let supervisor = Supervisor::new();

    match supervisor.write("ghost", b"x").await {
        Err(TetherError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    match supervisor.resize("ghost", 10, 10).await {
        Err(TetherError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }
    match supervisor.stop("ghost").await {
        Err(TetherError::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    match supervisor.start(spec("bad id!", "true")).await {
        Err(TetherError::StartFailed(_)) => {}
        other => panic!("expected StartFailed, got {other:?}"),
    }
    match supervisor.start(spec("noexec", "")).await {
        Ok(session) => {
            // Empty script is still a valid sh invocation; just reap it.
            timeout(Duration::from_secs(5), session.done()).await.unwrap();
        }
        Err(_) => {}
    }
    let mut empty = spec("empty", "true");
    empty.argv.clear();
    match supervisor.start(empty).await {
        Err(TetherError::StartFailed(_)) => {}
        other => panic!("expected StartFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn resize_is_idempotent() {
    let supervisor = Supervisor::new();
    let session = supervisor.start(spec("s8", "sleep 30")).await.unwrap();
    session.resize(50, 132).unwrap();
    session.resize(50, 132).unwrap();
    assert_eq!(session.size(), (50, 132));
    session.stop();
    timeout(Duration::from_secs(5), session.done()).await.unwrap();
}

#[tokio::test]
async fn sessions_do_not_interleave() {
    let supervisor = Supervisor::new();
    let a = supervisor
        .start(spec("iso-a", "sleep 0.2; head -c 4000 /dev/zero | tr '\\0' A"))
        .await
        .unwrap();
    let b = supervisor
        .start(spec("iso-b", "sleep 0.2; head -c 4000 /dev/zero | tr '\\0' B"))
        .await
        .unwrap();

    let (mut rx_a, _ga) = a.subscribe();
    let (mut rx_b, _gb) = b.subscribe();
    let bytes_a = drain(&mut rx_a, Duration::from_secs(5)).await;
    let bytes_b = drain(&mut rx_b, Duration::from_secs(5)).await;

    assert_eq!(bytes_a.len(), 4000);
    assert!(bytes_a.iter().all(|&c| c == b'A'));
    assert_eq!(bytes_b.len(), 4000);
    assert!(bytes_b.iter().all(|&c| c == b'B'));
}
