//! Unix-socket control plane for the supervisor.
//!
//! Accepts connections at a well-known path, runs the Hello handshake
//! (build fingerprint + protocol version, 5 s deadline), then serves
//! length-prefixed JSON request/reply frames. A Subscribe request upgrades
//! the connection: stream frames flow until Unsubscribe, session end, or
//! supervisor shutdown. All outbound frames for one connection pass
//! through a single writer task so frames never interleave.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::registry::Supervisor;
use crate::session::StartSpec;
use tether_core::codec::{frame_encode, json_decode, read_frame, write_frame};
use tether_core::protocol::{
    b64_decode, b64_encode, EofReason, GetOk, HelloFrame, Op, Reply, ReplyBody, Request, Role,
    StartedOk, TailOk, WireError, WrittenOk, PROTOCOL_VERSION,
};
use tether_core::{build_fingerprint, ErrorKind, TetherError, TetherResult};

/// Deadline for the client's Hello frame.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// The control socket server.
pub struct ControlServer {
    supervisor: Arc<Supervisor>,
    socket_path: PathBuf,
    shutdown: broadcast::Sender<()>,
}

impl ControlServer {
    pub fn new(supervisor: Arc<Supervisor>, socket_path: PathBuf) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            supervisor,
            socket_path,
            shutdown,
        }
    }

    /// Handle used to request a graceful stop: open streams receive a
    /// `supervisor_shutdown` eof, connections close, sessions keep running.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Bind the socket and serve until shutdown is signalled.
    pub async fn run(&self) -> TetherResult<()> {
        prepare_socket_path(&self.socket_path)?;
        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!(path = %self.socket_path.display(), "control socket listening");

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let supervisor = self.supervisor.clone();
                        let shutdown = self.shutdown.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(supervisor, stream, shutdown).await {
                                debug!(error = %e, "control connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "control accept failed");
                    }
                },
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        info!("control socket closed");
        Ok(())
    }
}

/// Refuse symlinked socket paths, clear stale inodes, ensure the parent
/// directory exists.
fn prepare_socket_path(path: &std::path::Path) -> TetherResult<()> {
    if path.exists() {
        let metadata = std::fs::symlink_metadata(path)?;
        if metadata.file_type().is_symlink() {
            return Err(TetherError::Internal(
                "control socket path is a symlink".into(),
            ));
        }
        if metadata.file_type().is_socket() || metadata.file_type().is_file() {
            let _ = std::fs::remove_file(path);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Per-connection state: the serialized outbound frame channel and the
/// cancel handle of the connection's active Subscribe stream, if any.
struct Connection {
    out_tx: mpsc::Sender<Vec<u8>>,
    active_stream: Option<oneshot::Sender<()>>,
}

async fn serve_connection(
    supervisor: Arc<Supervisor>,
    stream: UnixStream,
    shutdown: broadcast::Sender<()>,
) -> TetherResult<()> {
    let (mut read_half, mut write_half) = stream.into_split();

    // Handshake: first frame each direction.
    let payload = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut read_half))
        .await
        .map_err(|_| TetherError::Codec("handshake deadline elapsed".into()))??
        .ok_or_else(|| TetherError::Codec("connection closed before hello".into()))?;
    let hello: HelloFrame = json_decode(&payload)?;
    let build = build_fingerprint();
    if hello.hello.role != Role::Client
        || hello.hello.proto != PROTOCOL_VERSION
        || hello.hello.build != build
    {
        warn!(
            peer_build = %hello.hello.build,
            peer_proto = hello.hello.proto,
            "rejecting incompatible control client"
        );
        write_frame(&mut write_half, &Reply::incompatible_build(build)).await?;
        return Ok(());
    }
    write_frame(&mut write_half, &HelloFrame::new(Role::Daemon, build)).await?;

    // Writer task: the only writer of this connection.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut conn = Connection {
        out_tx,
        active_stream: None,
    };
    let mut shutdown_rx = shutdown.subscribe();
    let mut graceful = false;

    let result = loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                graceful = true;
                break Ok(());
            }
            frame = read_frame(&mut read_half) => match frame {
                Ok(Some(payload)) => {
                    match dispatch(&supervisor, &mut conn, &shutdown, &payload).await {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            },
        }
    };

    // On graceful shutdown the stream task emits its own eof frame; on a
    // client-initiated close, cancel it without one.
    if !graceful {
        if let Some(cancel) = conn.active_stream.take() {
            let _ = cancel.send(());
        }
    }
    drop(conn);
    let _ = writer_task.await;
    result
}

/// Handle one request frame. Returns `Ok(false)` when the frame is
/// malformed and the connection must close.
async fn dispatch(
    supervisor: &Arc<Supervisor>,
    conn: &mut Connection,
    shutdown: &broadcast::Sender<()>,
    payload: &[u8],
) -> TetherResult<bool> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(_) => return Ok(false),
    };
    let req: Request = match serde_json::from_value(value.clone()) {
        Ok(r) => r,
        Err(_) => {
            // A well-formed envelope with an unrecognized verb gets a
            // typed error; anything else closes the connection.
            if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                if value.get("op").is_some() {
                    send_reply(conn, unknown_op(id)).await?;
                    return Ok(true);
                }
            }
            return Ok(false);
        }
    };

    let reply = match req.op {
        Op::Start(args) => {
            let spec = StartSpec {
                id: args.id,
                argv: args.argv,
                cwd: args.cwd,
                env: args.env,
                rows: args.rows,
                cols: args.cols,
            };
            match supervisor.start(spec).await {
                Ok(session) => Reply::ok(req.id, &StartedOk { pid: session.pid() })?,
                Err(e) => error_reply(req.id, &e),
            }
        }
        Op::Write(args) => match b64_decode(&args.data) {
            Ok(bytes) => match supervisor.write(&args.id, &bytes).await {
                Ok(n) => Reply::ok(req.id, &WrittenOk { n })?,
                Err(e) => error_reply(req.id, &e),
            },
            Err(e) => error_reply(req.id, &e),
        },
        Op::Resize(args) => match supervisor.resize(&args.id, args.rows, args.cols).await {
            Ok(()) => Reply::ok(req.id, &serde_json::json!({}))?,
            Err(e) => error_reply(req.id, &e),
        },
        Op::Stop(r) => match supervisor.stop(&r.id).await {
            Ok(()) => Reply::ok(req.id, &serde_json::json!({}))?,
            Err(e) => error_reply(req.id, &e),
        },
        Op::List => Reply::ok(req.id, &supervisor.list().await)?,
        Op::Get(r) => match supervisor.get(&r.id).await {
            Some(session) => Reply::ok(
                req.id,
                &GetOk {
                    pid: session.pid(),
                    started_at: session.started_at(),
                    alive: !session.is_stopped(),
                },
            )?,
            None => error_reply(req.id, &TetherError::NotFound(r.id)),
        },
        Op::Tail(args) => match supervisor.tail(&args.id, args.max).await {
            Ok(bytes) => Reply::ok(
                req.id,
                &TailOk {
                    data: b64_encode(&bytes),
                },
            )?,
            Err(e) => error_reply(req.id, &e),
        },
        Op::Subscribe(r) => {
            match supervisor.subscribe(&r.id).await {
                Ok((rx, subscription, session)) => {
                    let (cancel_tx, cancel_rx) = oneshot::channel();
                    conn.active_stream = Some(cancel_tx);
                    spawn_stream(
                        req.id,
                        rx,
                        subscription,
                        session,
                        conn.out_tx.clone(),
                        shutdown.subscribe(),
                        cancel_rx,
                    );
                    return Ok(true);
                }
                Err(e) => error_reply(req.id, &e),
            }
        }
        Op::Unsubscribe => {
            if let Some(cancel) = conn.active_stream.take() {
                let _ = cancel.send(());
            }
            return Ok(true);
        }
    };

    send_reply(conn, reply).await?;
    Ok(true)
}

/// Forward session output as `{seq, data}` frames until the session ends,
/// the supervisor shuts down, or the client unsubscribes.
fn spawn_stream(
    req_id: u64,
    mut rx: mpsc::Receiver<Vec<u8>>,
    subscription: crate::session::Subscription,
    session: Arc<crate::session::Session>,
    out: mpsc::Sender<Vec<u8>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut seq: u64 = 0;
        let reason = loop {
            tokio::select! {
                _ = &mut cancel_rx => break None,
                _ = shutdown_rx.recv() => break Some(EofReason::SupervisorShutdown),
                payload = rx.recv() => match payload {
                    Some(bytes) => {
                        seq += 1;
                        let Ok(frame) = frame_encode(&Reply::stream_data(req_id, seq, &bytes)) else {
                            break None;
                        };
                        if out.send(frame).await.is_err() {
                            break None;
                        }
                    }
                    None => {
                        let summary = session.done().await;
                        break Some(if summary.signalled {
                            EofReason::Signalled
                        } else {
                            EofReason::Exited
                        });
                    }
                },
            }
        };
        subscription.cancel();
        if let Some(reason) = reason {
            seq += 1;
            if let Ok(frame) = frame_encode(&Reply::stream_eof(req_id, seq, reason)) {
                let _ = out.send(frame).await;
            }
        }
    });
}

async fn send_reply(conn: &Connection, reply: Reply) -> TetherResult<()> {
    let frame = frame_encode(&reply)?;
    conn.out_tx
        .send(frame)
        .await
        .map_err(|_| TetherError::Closed)
}

fn error_reply(id: u64, err: &TetherError) -> Reply {
    let build = match err {
        TetherError::IncompatibleBuild { build } => Some(build.clone()),
        _ => None,
    };
    Reply {
        id: Some(id),
        body: ReplyBody::Error(WireError {
            kind: err.kind(),
            msg: Some(err.to_string()),
            build,
        }),
    }
}

fn unknown_op(id: u64) -> Reply {
    Reply {
        id: Some(id),
        body: ReplyBody::Error(WireError {
            kind: ErrorKind::UnknownOp,
            msg: None,
            build: None,
        }),
    }
}
