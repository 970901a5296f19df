//! One supervised child process attached to a pseudo-terminal.
//!
//! A `Session` owns the PTY pair, a bounded replay ring, and the subscriber
//! set. A dedicated reader task is the only reader of the PTY master; it
//! appends each chunk to the ring and then offers it to every subscriber,
//! in that fixed order. A waiter task reaps the child and fires the exit
//! signal exactly once.

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::replay::{ReplayRing, DEFAULT_REPLAY_CAPACITY};
use tether_core::{TetherError, TetherResult};

/// Unit of PTY reads, broadcast payloads, and ring insertion.
pub const READ_CHUNK: usize = 32 * 1024;

/// Per-subscriber queue depth. Absorbs a ~8 MiB burst at 32 KiB/payload
/// without blocking the reader.
pub const SUBSCRIBER_QUEUE: usize = 256;

/// Grace period between SIGTERM and SIGKILL on Stop.
pub const STOP_GRACE: Duration = Duration::from_secs(3);

/// What to launch and where.
#[derive(Debug, Clone)]
pub struct StartSpec {
    pub id: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

/// How the child ended.
#[derive(Debug, Clone, Copy)]
pub struct ExitSummary {
    pub code: u32,
    /// True when this session's own kill path delivered a signal.
    pub signalled: bool,
}

struct SubscriberSlot {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

struct SubscriberSet {
    next_id: u64,
    closed: bool,
    channels: HashMap<u64, SubscriberSlot>,
}

/// A supervised child attached to a PTY.
pub struct Session {
    id: String,
    pid: u32,
    argv: Vec<String>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    started_at: u64,
    ring: Arc<Mutex<ReplayRing>>,
    subscribers: Arc<Mutex<SubscriberSet>>,
    writer: Arc<Mutex<Option<Box<dyn Write + Send>>>>,
    /// Master side kept for resize (Mutex because MasterPty is not Sync).
    master: Mutex<Box<dyn MasterPty + Send>>,
    size: Mutex<(u16, u16)>,
    done_tx: watch::Sender<Option<ExitSummary>>,
    done_rx: watch::Receiver<Option<ExitSummary>>,
    stopped: AtomicBool,
    term_sent: AtomicBool,
}

impl Session {
    /// Allocate a PTY, launch the argv, and start the reader and waiter
    /// tasks. The returned oneshot fires once the reader has posted its
    /// first read; callers await it so that Start returns with the fan-out
    /// path live.
    pub(crate) fn spawn(spec: StartSpec) -> TetherResult<(Arc<Self>, oneshot::Receiver<()>)> {
        if spec.argv.is_empty() {
            return Err(TetherError::StartFailed("empty argv".into()));
        }

        let pty_system = native_pty_system();
        let size = PtySize {
            rows: spec.rows,
            cols: spec.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = pty_system
            .openpty(size)
            .map_err(|e| TetherError::StartFailed(format!("pty allocation failed: {e}")))?;

        let mut cmd = CommandBuilder::new(&spec.argv[0]);
        cmd.args(&spec.argv[1..]);
        cmd.cwd(&spec.cwd);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        if !spec.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TetherError::StartFailed(format!("spawn failed: {e}")))?;
        drop(pair.slave);

        let pid = child
            .process_id()
            .ok_or_else(|| TetherError::StartFailed("child has no pid".into()))?;

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TetherError::StartFailed(format!("clone pty reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TetherError::StartFailed(format!("take pty writer: {e}")))?;

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let (done_tx, done_rx) = watch::channel(None);
        let session = Arc::new(Session {
            id: spec.id.clone(),
            pid,
            argv: spec.argv,
            cwd: spec.cwd,
            env: spec.env,
            started_at,
            ring: Arc::new(Mutex::new(ReplayRing::new(DEFAULT_REPLAY_CAPACITY))),
            subscribers: Arc::new(Mutex::new(SubscriberSet {
                next_id: 0,
                closed: false,
                channels: HashMap::new(),
            })),
            writer: Arc::new(Mutex::new(Some(writer))),
            master: Mutex::new(pair.master),
            size: Mutex::new((spec.rows, spec.cols)),
            done_tx,
            done_rx,
            stopped: AtomicBool::new(false),
            term_sent: AtomicBool::new(false),
        });

        info!(id = %session.id, pid, rows = spec.rows, cols = spec.cols, "session spawned");

        // Reader task: sole reader of the PTY master. Ring first, then
        // subscribers; the only place both locks are held together.
        let (ready_tx, ready_rx) = oneshot::channel();
        let ring = session.ring.clone();
        let subscribers = session.subscribers.clone();
        let reader_id = session.id.clone();
        tokio::task::spawn_blocking(move || {
            let _ = ready_tx.send(());
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let Ok(mut ring) = ring.lock() else { break };
                        ring.push(&buf[..n]);
                        let Ok(subs) = subscribers.lock() else { break };
                        for slot in subs.channels.values() {
                            match slot.tx.try_send(buf[..n].to_vec()) {
                                Ok(()) => {}
                                Err(mpsc::error::TrySendError::Full(_)) => {
                                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(mpsc::error::TrySendError::Closed(_)) => {}
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            if let Ok(mut subs) = subscribers.lock() {
                subs.closed = true;
                subs.channels.clear();
            }
            debug!(id = %reader_id, "pty reader finished");
        });

        // Waiter task: reap the child, mark stopped, fire Done once.
        let waiter = session.clone();
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || {
                let mut child = child;
                child.wait()
            })
            .await;
            let code = match status {
                Ok(Ok(st)) => st.exit_code(),
                _ => 1,
            };
            let signalled = waiter.term_sent.load(Ordering::SeqCst);
            waiter.stopped.store(true, Ordering::SeqCst);
            if let Ok(mut writer) = waiter.writer.lock() {
                writer.take();
            }
            let _ = waiter.done_tx.send(Some(ExitSummary { code, signalled }));
            info!(id = %waiter.id, pid = waiter.pid, code, signalled, "session reaped");
        });

        Ok((session, ready_rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn cwd(&self) -> &std::path::Path {
        &self.cwd
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.env
    }

    /// Unix seconds at spawn.
    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> (u16, u16) {
        self.size.lock().map(|s| *s).unwrap_or((0, 0))
    }

    /// Write bytes verbatim to the terminal. `write_all` retries partial
    /// writes; the call fails with `Closed` once the write side is gone.
    pub async fn write(&self, bytes: &[u8]) -> TetherResult<usize> {
        if self.is_stopped() {
            return Err(TetherError::Closed);
        }
        let writer = self.writer.clone();
        let data = bytes.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = writer
                .lock()
                .map_err(|_| TetherError::Internal("pty writer lock poisoned".into()))?;
            let w = guard.as_mut().ok_or(TetherError::Closed)?;
            w.write_all(&data).map_err(|_| TetherError::Closed)?;
            w.flush().map_err(|_| TetherError::Closed)?;
            Ok(data.len())
        })
        .await
        .map_err(|e| TetherError::Internal(format!("join error: {e}")))?
    }

    /// Set the terminal window size. The kernel delivers SIGWINCH to the
    /// child. Idempotent, last-write-wins.
    pub fn resize(&self, rows: u16, cols: u16) -> TetherResult<()> {
        let master = self
            .master
            .lock()
            .map_err(|_| TetherError::Internal("pty master lock poisoned".into()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| TetherError::Internal(format!("pty resize failed: {e}")))?;
        drop(master);
        if let Ok(mut size) = self.size.lock() {
            *size = (rows, cols);
        }
        debug!(id = %self.id, rows, cols, "session resized");
        Ok(())
    }

    /// Register a subscriber. The receiver sees every payload broadcast
    /// after this call returns, except payloads dropped because its own
    /// queue was full. On an ended session the receiver is already closed.
    pub fn subscribe(&self) -> (mpsc::Receiver<Vec<u8>>, Subscription) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut assigned = 0;
        if let Ok(mut set) = self.subscribers.lock() {
            if !set.closed {
                set.next_id += 1;
                assigned = set.next_id;
                set.channels.insert(
                    assigned,
                    SubscriberSlot {
                        tx,
                        dropped: dropped.clone(),
                    },
                );
            }
        }
        let subscription = Subscription {
            id: assigned,
            set: Arc::downgrade(&self.subscribers),
            dropped,
            cancelled: AtomicBool::new(false),
        };
        (rx, subscription)
    }

    /// Point-in-time copy of the replay ring.
    pub fn replay(&self) -> Vec<u8> {
        self.ring.lock().map(|r| r.snapshot()).unwrap_or_default()
    }

    /// The last `max` bytes of the replay ring.
    pub fn tail(&self, max: usize) -> Vec<u8> {
        self.ring.lock().map(|r| r.tail(max)).unwrap_or_default()
    }

    /// Request termination: SIGTERM to the process group now, SIGKILL
    /// after the grace period if the child has not been reaped. Idempotent;
    /// returns without waiting for Done.
    pub fn stop(self: &Arc<Self>) {
        if self.term_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.is_stopped() {
            return;
        }
        let pgid = Pid::from_raw(self.pid as i32);
        if let Err(e) = killpg(pgid, Signal::SIGTERM) {
            debug!(id = %self.id, pid = self.pid, error = %e, "SIGTERM delivery failed");
            return;
        }
        info!(id = %self.id, pid = self.pid, "sent SIGTERM to session process group");
        let session = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = session.done() => {}
                _ = tokio::time::sleep(STOP_GRACE) => {
                    warn!(id = %session.id, pid = session.pid, "grace period elapsed, escalating to SIGKILL");
                    let _ = killpg(Pid::from_raw(session.pid as i32), Signal::SIGKILL);
                }
            }
        });
    }

    /// Resolves once the child has been reaped. Observable by many callers.
    pub async fn done(&self) -> ExitSummary {
        let mut rx = self.done_rx.clone();
        loop {
            if let Some(summary) = *rx.borrow_and_update() {
                return summary;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or(ExitSummary {
                    code: 1,
                    signalled: false,
                });
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("pid", &self.pid)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Cancel handle for a subscriber. Cancelling (or dropping) removes the
/// channel from the broadcast set; doing so twice is a no-op.
pub struct Subscription {
    id: u64,
    set: Weak<Mutex<SubscriberSet>>,
    dropped: Arc<AtomicU64>,
    cancelled: AtomicBool,
}

impl Subscription {
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(set) = self.set.upgrade() {
            if let Ok(mut set) = set.lock() {
                set.channels.remove(&self.id);
            }
        }
    }

    /// Payloads dropped for this subscriber because its queue was full.
    pub fn dropped_payloads(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
