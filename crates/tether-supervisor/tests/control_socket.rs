//! Control socket end-to-end tests: a real server on a scratch socket,
//! driven with raw frames.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::time::timeout;

use tether_core::codec::{json_decode, read_frame, write_frame};
use tether_core::protocol::{
    b64_decode, b64_encode, ErrorKind, GetOk, HelloFrame, Op, Reply, ReplyBody, Request, Role,
    SessionEntry, SessionRef, StartArgs, StartedOk, TailArgs, TailOk, WriteArgs,
};
use tether_core::{build_fingerprint, TetherResult};
use tether_supervisor::control::ControlServer;
use tether_supervisor::Supervisor;

struct TestDaemon {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    shutdown: tokio::sync::broadcast::Sender<()>,
}

async fn start_daemon() -> TestDaemon {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("supervisor.sock");
    let server = ControlServer::new(Arc::new(Supervisor::new()), socket.clone());
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    assert!(
        tether_supervisor::daemon::wait_socket_ready(&socket, Duration::from_secs(5)).await,
        "control socket never came up"
    );
    TestDaemon {
        _dir: dir,
        socket,
        shutdown,
    }
}

async fn connect(daemon: &TestDaemon) -> UnixStream {
    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    write_frame(
        &mut stream,
        &HelloFrame::new(Role::Client, build_fingerprint()),
    )
    .await
    .unwrap();
    let payload = read_frame(&mut stream).await.unwrap().unwrap();
    let hello: HelloFrame = json_decode(&payload).unwrap();
    assert_eq!(hello.hello.role, Role::Daemon);
    stream
}

async fn call(stream: &mut UnixStream, id: u64, op: Op) -> Reply {
    write_frame(stream, &Request { id, op }).await.unwrap();
    let payload = timeout(Duration::from_secs(5), read_frame(stream))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let reply: Reply = json_decode(&payload).unwrap();
    assert_eq!(reply.id, Some(id));
    reply
}

fn ok_payload<T: serde::de::DeserializeOwned>(reply: Reply) -> T {
    match reply.body {
        ReplyBody::Ok(value) => serde_json::from_value(value).unwrap(),
        other => panic!("expected ok reply, got {other:?}"),
    }
}

fn error_kind(reply: Reply) -> ErrorKind {
    match reply.body {
        ReplyBody::Error(e) => e.kind,
        other => panic!("expected error reply, got {other:?}"),
    }
}

fn start_args(id: &str, script: &str) -> StartArgs {
    StartArgs {
        id: id.to_string(),
        argv: vec!["/bin/sh".into(), "-c".into(), script.into()],
        cwd: PathBuf::from("/tmp"),
        env: Default::default(),
        rows: 40,
        cols: 120,
    }
}

#[tokio::test]
async fn start_subscribe_and_observe_exit() {
    let daemon = start_daemon().await;
    let mut control = connect(&daemon).await;

    let started: StartedOk = ok_payload(
        call(
            &mut control,
            1,
            Op::Start(start_args("c1", "sleep 0.3; printf hi-from-child")),
        )
        .await,
    );
    assert!(started.pid > 0);

    let listed: Vec<SessionEntry> = ok_payload(call(&mut control, 2, Op::List).await);
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "c1");
    assert_eq!(listed[0].pid, started.pid);
    assert!(listed[0].alive);

    let detail: GetOk = ok_payload(
        call(&mut control, 3, Op::Get(SessionRef { id: "c1".into() })).await,
    );
    assert_eq!(detail.pid, started.pid);

    // Stream on a second connection.
    let mut stream = connect(&daemon).await;
    write_frame(
        &mut stream,
        &Request {
            id: 10,
            op: Op::Subscribe(SessionRef { id: "c1".into() }),
        },
    )
    .await
    .unwrap();

    let mut bytes = Vec::new();
    let mut eof_reason = None;
    let mut last_seq = 0;
    let deadline = timeout(Duration::from_secs(5), async {
        while let Some(payload) = read_frame(&mut stream).await.unwrap() {
            let reply: Reply = json_decode(&payload).unwrap();
            assert_eq!(reply.id, Some(10));
            let ReplyBody::Stream(frame) = reply.body else {
                panic!("expected stream frame");
            };
            assert!(frame.seq > last_seq, "stream seq must increase");
            last_seq = frame.seq;
            if frame.eof == Some(true) {
                eof_reason = frame.reason;
                break;
            }
            if let Some(data) = frame.data {
                bytes.extend_from_slice(&b64_decode(&data).unwrap());
            }
        }
    })
    .await;
    assert!(deadline.is_ok(), "stream never ended");
    assert_eq!(bytes, b"hi-from-child");
    assert_eq!(
        eof_reason,
        Some(tether_core::protocol::EofReason::Exited)
    );
}

#[tokio::test]
async fn write_tail_and_stop() {
    let daemon = start_daemon().await;
    let mut control = connect(&daemon).await;

    ok_payload::<StartedOk>(
        call(&mut control, 1, Op::Start(start_args("c2", "exec /bin/cat"))).await,
    );

    let reply = call(
        &mut control,
        2,
        Op::Write(WriteArgs {
            id: "c2".into(),
            data: b64_encode(b"ping\n"),
        }),
    )
    .await;
    let written: tether_core::protocol::WrittenOk = ok_payload(reply);
    assert_eq!(written.n, 5);

    // cat echoes back through the PTY; poll the tail until it shows up.
    let mut seen = Vec::new();
    let found: TetherResult<()> = async {
        for attempt in 0..50u64 {
            let tail: TailOk = ok_payload(
                call(
                    &mut control,
                    3 + attempt,
                    Op::Tail(TailArgs {
                        id: "c2".into(),
                        max: 100_000,
                    }),
                )
                .await,
            );
            seen = b64_decode(&tail.data)?;
            if seen.windows(4).any(|w| w == b"ping") {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("tail never showed the write: {:?}", seen);
    }
    .await;
    found.unwrap();

    let stopped = call(&mut control, 90, Op::Stop(SessionRef { id: "c2".into() })).await;
    assert!(matches!(stopped.body, ReplyBody::Ok(_)));

    // The registry drops the session once the child is reaped.
    let gone = async {
        for attempt in 0..50u64 {
            let reply = call(
                &mut control,
                100 + attempt,
                Op::Get(SessionRef { id: "c2".into() }),
            )
            .await;
            if let ReplyBody::Error(e) = reply.body {
                assert_eq!(e.kind, ErrorKind::NotFound);
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }
    .await;
    assert!(gone, "session never left the registry after stop");
}

#[tokio::test]
async fn build_mismatch_is_rejected_before_anything_else() {
    let daemon = start_daemon().await;
    let mut stream = UnixStream::connect(&daemon.socket).await.unwrap();
    write_frame(
        &mut stream,
        &HelloFrame::new(Role::Client, "0000000000000000"),
    )
    .await
    .unwrap();

    let payload = read_frame(&mut stream).await.unwrap().unwrap();
    let reply: Reply = json_decode(&payload).unwrap();
    let ReplyBody::Error(e) = reply.body else {
        panic!("expected incompatible_build error");
    };
    assert_eq!(e.kind, ErrorKind::IncompatibleBuild);
    assert_eq!(e.build.as_deref(), Some(build_fingerprint()));

    // No further operation succeeds: the daemon has closed the connection.
    assert!(read_frame(&mut stream).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_op_gets_typed_error_and_malformed_frame_closes() {
    let daemon = start_daemon().await;
    let mut control = connect(&daemon).await;

    write_frame(
        &mut control,
        &serde_json::json!({"id": 5, "op": "bogus", "args": {}}),
    )
    .await
    .unwrap();
    let payload = read_frame(&mut control).await.unwrap().unwrap();
    let reply: Reply = json_decode(&payload).unwrap();
    assert_eq!(reply.id, Some(5));
    assert_eq!(error_kind(reply), ErrorKind::UnknownOp);

    // Not JSON at all: the server closes the connection.
    let mut garbage = Vec::new();
    garbage.extend_from_slice(&5u32.to_be_bytes());
    garbage.extend_from_slice(b"not{j");
    use tokio::io::AsyncWriteExt;
    control.write_all(&garbage).await.unwrap();
    control.flush().await.unwrap();
    assert!(read_frame(&mut control).await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_emits_supervisor_shutdown_to_streams() {
    let daemon = start_daemon().await;
    let mut control = connect(&daemon).await;
    ok_payload::<StartedOk>(
        call(&mut control, 1, Op::Start(start_args("c3", "sleep 30"))).await,
    );

    let mut stream = connect(&daemon).await;
    write_frame(
        &mut stream,
        &Request {
            id: 7,
            op: Op::Subscribe(SessionRef { id: "c3".into() }),
        },
    )
    .await
    .unwrap();
    // Give the stream a moment to register before shutting down.
    tokio::time::sleep(Duration::from_millis(200)).await;

    daemon.shutdown.send(()).unwrap();

    let got_eof = timeout(Duration::from_secs(5), async {
        while let Some(payload) = read_frame(&mut stream).await.ok().flatten() {
            let Ok(reply) = json_decode::<Reply>(&payload) else {
                return false;
            };
            if let ReplyBody::Stream(frame) = reply.body {
                if frame.eof == Some(true) {
                    return frame.reason
                        == Some(tether_core::protocol::EofReason::SupervisorShutdown);
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(got_eof, "stream did not see supervisor_shutdown eof");
}
