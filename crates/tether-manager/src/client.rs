//! Control client for a remote supervisor.
//!
//! One connection carries request/reply traffic (a single outstanding
//! request at a time, per the protocol); each Subscribe opens its own
//! connection that is upgraded to a one-way stream. A lost connection
//! fails in-flight operations with `Closed` and triggers a background
//! reconnect with exponential backoff (1 s doubling to a 10 s cap); the
//! client never buffers retries.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

use tether_core::codec::{json_decode, read_frame, write_frame};
use tether_core::protocol::{
    b64_decode, b64_encode, EofReason, GetOk, HelloFrame, Op, Reply, ReplyBody, Request, Role,
    SessionEntry, SessionRef, StartArgs, StartedOk, TailArgs, TailOk, WriteArgs, WrittenOk,
    PROTOCOL_VERSION,
};
use tether_core::{build_fingerprint, TetherError, TetherResult};

/// Deadline for the daemon's Hello reply.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

pub(crate) fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Client handle to the supervisor's control socket. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ControlClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    socket_path: PathBuf,
    conn: Mutex<Option<UnixStream>>,
    next_id: AtomicU64,
    reconnecting: AtomicBool,
}

/// Connect and run the Hello handshake. Surfaces `IncompatibleBuild` when
/// the daemon rejects this binary's fingerprint.
pub(crate) async fn connect_and_handshake(socket_path: &Path) -> TetherResult<UnixStream> {
    let mut stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| TetherError::Unavailable(format!("connect supervisor socket: {e}")))?;
    write_frame(
        &mut stream,
        &HelloFrame::new(Role::Client, build_fingerprint()),
    )
    .await?;
    let payload = timeout(HANDSHAKE_TIMEOUT, read_frame(&mut stream))
        .await
        .map_err(|_| TetherError::Unavailable("handshake timeout".into()))??
        .ok_or_else(|| TetherError::Unavailable("connection closed during handshake".into()))?;
    if let Ok(hello) = json_decode::<HelloFrame>(&payload) {
        if hello.hello.role == Role::Daemon && hello.hello.proto == PROTOCOL_VERSION {
            return Ok(stream);
        }
        return Err(TetherError::Unavailable("unexpected hello".into()));
    }
    let reply: Reply = json_decode(&payload)?;
    match reply.body {
        ReplyBody::Error(e) => Err(TetherError::from_wire(e.kind, e.msg, e.build)),
        _ => Err(TetherError::Unavailable("unexpected handshake reply".into())),
    }
}

impl ControlClient {
    /// Connect to the supervisor at the given socket path.
    pub async fn connect(socket_path: &Path) -> TetherResult<Self> {
        let stream = connect_and_handshake(socket_path).await?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                socket_path: socket_path.to_path_buf(),
                conn: Mutex::new(Some(stream)),
                next_id: AtomicU64::new(0),
                reconnecting: AtomicBool::new(false),
            }),
        })
    }

    pub async fn start(&self, args: StartArgs) -> TetherResult<u32> {
        let ok: StartedOk = decode(self.call(Op::Start(args)).await?)?;
        Ok(ok.pid)
    }

    pub async fn write(&self, id: &str, bytes: &[u8]) -> TetherResult<usize> {
        let ok: WrittenOk = decode(
            self.call(Op::Write(WriteArgs {
                id: id.to_string(),
                data: b64_encode(bytes),
            }))
            .await?,
        )?;
        Ok(ok.n)
    }

    pub async fn resize(&self, id: &str, rows: u16, cols: u16) -> TetherResult<()> {
        self.call(Op::Resize(tether_core::protocol::ResizeArgs {
            id: id.to_string(),
            rows,
            cols,
        }))
        .await?;
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> TetherResult<()> {
        self.call(Op::Stop(SessionRef { id: id.to_string() })).await?;
        Ok(())
    }

    pub async fn list(&self) -> TetherResult<Vec<SessionEntry>> {
        decode(self.call(Op::List).await?)
    }

    pub async fn get(&self, id: &str) -> TetherResult<GetOk> {
        decode(
            self.call(Op::Get(SessionRef { id: id.to_string() }))
                .await?,
        )
    }

    pub async fn tail(&self, id: &str, max: usize) -> TetherResult<Vec<u8>> {
        let ok: TailOk = decode(
            self.call(Op::Tail(TailArgs {
                id: id.to_string(),
                max,
            }))
            .await?,
        )?;
        b64_decode(&ok.data)
    }

    /// Open a dedicated streaming connection for one session's output.
    pub async fn subscribe(&self, id: &str) -> TetherResult<RemoteStream> {
        let mut stream = connect_and_handshake(&self.inner.socket_path).await?;
        let request = Request {
            id: 1,
            op: Op::Subscribe(SessionRef { id: id.to_string() }),
        };
        write_frame(&mut stream, &request).await?;

        let (tx, rx) = mpsc::channel::<Vec<u8>>(256);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let eof = Arc::new(std::sync::Mutex::new(None));
        let eof_slot = eof.clone();
        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();
            loop {
                tokio::select! {
                    _ = &mut cancel_rx => {
                        let _ = write_frame(&mut write_half, &Request { id: 2, op: Op::Unsubscribe }).await;
                        break;
                    }
                    frame = read_frame(&mut read_half) => {
                        let Ok(Some(payload)) = frame else { break };
                        let Ok(reply) = json_decode::<Reply>(&payload) else { break };
                        match reply.body {
                            ReplyBody::Stream(sf) => {
                                if sf.eof == Some(true) {
                                    debug!(reason = ?sf.reason, "subscribe stream ended");
                                    if let Ok(mut slot) = eof_slot.lock() {
                                        *slot = sf.reason;
                                    }
                                    break;
                                }
                                let Some(data) = sf.data else { continue };
                                let Ok(bytes) = b64_decode(&data) else { break };
                                if tx.send(bytes).await.is_err() {
                                    let _ = write_frame(&mut write_half, &Request { id: 2, op: Op::Unsubscribe }).await;
                                    break;
                                }
                            }
                            // A not_found (session already gone) simply
                            // ends the stream: the caller sees a closed
                            // channel.
                            ReplyBody::Error(e) => {
                                debug!(kind = ?e.kind, "subscribe rejected");
                                break;
                            }
                            ReplyBody::Ok(_) => {}
                        }
                    }
                }
            }
        });

        Ok(RemoteStream {
            rx,
            cancel: Some(cancel_tx),
            eof,
        })
    }

    /// Send one request and wait for its reply on the shared connection.
    async fn call(&self, op: Op) -> TetherResult<serde_json::Value> {
        let mut guard = self.inner.conn.lock().await;
        let Some(stream) = guard.as_mut() else {
            self.spawn_reconnect();
            return Err(TetherError::Closed);
        };
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let request = Request { id, op };
        match round_trip(stream, id, &request).await {
            Ok(value) => Ok(value),
            Err(e) => {
                if connection_fatal(&e) {
                    *guard = None;
                    drop(guard);
                    self.spawn_reconnect();
                    Err(TetherError::Closed)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn spawn_reconnect(&self) {
        if self.inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_START;
            loop {
                tokio::time::sleep(backoff).await;
                let Some(inner) = weak.upgrade() else { return };
                match connect_and_handshake(&inner.socket_path).await {
                    Ok(stream) => {
                        *inner.conn.lock().await = Some(stream);
                        inner.reconnecting.store(false, Ordering::SeqCst);
                        info!("control connection re-established");
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, backoff_secs = backoff.as_secs(), "supervisor reconnect failed");
                    }
                }
                backoff = next_backoff(backoff);
            }
        });
    }
}

/// Whether an error means the connection itself is unusable.
fn connection_fatal(e: &TetherError) -> bool {
    matches!(
        e,
        TetherError::Io(_) | TetherError::Codec(_) | TetherError::Closed
    )
}

async fn round_trip(
    stream: &mut UnixStream,
    id: u64,
    request: &Request,
) -> TetherResult<serde_json::Value> {
    write_frame(stream, request).await?;
    loop {
        let payload = read_frame(stream).await?.ok_or(TetherError::Closed)?;
        let reply: Reply = json_decode(&payload)?;
        if reply.id != Some(id) {
            continue;
        }
        return match reply.body {
            ReplyBody::Ok(value) => Ok(value),
            ReplyBody::Error(e) => Err(TetherError::from_wire(e.kind, e.msg, e.build)),
            ReplyBody::Stream(_) => Err(TetherError::Codec(
                "stream frame on request connection".into(),
            )),
        };
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> TetherResult<T> {
    serde_json::from_value(value).map_err(|e| TetherError::Codec(e.to_string()))
}

/// A live Subscribe stream. Dropping it unsubscribes.
pub struct RemoteStream {
    rx: mpsc::Receiver<Vec<u8>>,
    cancel: Option<oneshot::Sender<()>>,
    eof: Arc<std::sync::Mutex<Option<EofReason>>>,
}

impl RemoteStream {
    /// Next output payload; `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// The daemon's terminal frame reason, set before the stream closes.
    /// `None` while the stream is live, or when the connection dropped
    /// without an eof frame (the session itself may still be running).
    pub fn eof_reason(&self) -> Option<EofReason> {
        self.eof.lock().ok().and_then(|slot| *slot)
    }

    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for RemoteStream {
    fn drop(&mut self) {
        self.cancel();
    }
}
