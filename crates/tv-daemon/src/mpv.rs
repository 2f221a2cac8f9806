//! mpv-backed implementation of the player capability.
//!
//! One mpv process per session — a channel change kills the old player and
//! spawns a fresh one, mirroring how a TV retunes.  Each process gets its own
//! JSON IPC socket:
//!
//! ```text
//!   MpvBackend::create_session(media)
//!         │
//!         ├── writer task      ← requests via mpsc, serialised → socket
//!         ├── reader task      ← JSON lines from socket
//!         │        ├── response (request_id) → matched oneshot sender
//!         │        └── event / property-change → translator
//!         └── translator task  ← raw mpv events → PlayerEvent stream
//! ```

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::player::{MediaPlayer, PlayerError, PlayerEvent, PlayerSession};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Observe-property ID, matched against property-change events.
const OBS_PAUSE: u64 = 1;

const IPC_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);
const SOCKET_WAIT_ATTEMPTS: u32 = 50;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line, '\n' included
    reply: oneshot::Sender<Result<Value, PlayerError>>,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, PlayerError>>>>>;

/// Cheaply cloneable handle to the writer task.  `send()` fires a command
/// and awaits the matched response.
#[derive(Clone)]
struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    async fn send(&self, command: Value) -> Result<Value, PlayerError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg).map_err(|e| PlayerError::Ipc(e.to_string()))?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| PlayerError::Ipc("writer task gone".into()))?;

        tokio::time::timeout(IPC_TIMEOUT, reply_rx)
            .await
            .map_err(|_| PlayerError::Timeout)?
            .map_err(|_| PlayerError::Ipc("reply channel dropped".into()))?
    }

    async fn get_property_f64(&self, name: &str) -> Option<f64> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => resp["data"].as_f64().filter(|v| v.is_finite()),
            // Transient — property not available yet.  Sample skipped.
            Err(_) => None,
        }
    }
}

/// Session factory.  Holds nothing but a counter for unique socket names.
pub struct MpvBackend {
    session_tag: u64,
}

impl MpvBackend {
    pub fn new() -> Self {
        Self { session_tag: 0 }
    }
}

impl Default for MpvBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaPlayer for MpvBackend {
    type Session = MpvSession;

    async fn create_session(
        &mut self,
        media: &str,
        resume_hint: Option<f64>,
    ) -> Result<(MpvSession, mpsc::Receiver<PlayerEvent>), PlayerError> {
        self.session_tag += 1;
        let tag = self.session_tag;

        let binary =
            tv_proto::platform::find_mpv_binary().ok_or(PlayerError::BinaryNotFound)?;

        let mut cmd = tokio::process::Command::new(binary);
        cmd.arg(media)
            .arg(tv_proto::platform::mpv_socket_arg(tag))
            // Start paused and silent until the core applies the resume
            // policy and calls play().
            .arg("--pause")
            .arg("--quiet")
            .arg("--force-window=yes")
            .arg("--keep-open=no")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(start) = resume_hint {
            cmd.arg(format!("--start={:.3}", start));
        }

        info!("mpv: spawning session {} for {}", tag, media);
        let process = cmd.spawn().map_err(|e| PlayerError::Spawn(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel::<PlayerEvent>(32);
        let (handle, io_tasks) = connect(tag, event_tx).await?;

        // Observe the pause property; the translator derives playing/paused
        // transitions from it.
        if let Err(e) = handle
            .send(json!(["observe_property", OBS_PAUSE, "pause"]))
            .await
        {
            warn!("mpv: observe_property pause failed: {}", e);
        }

        let session = MpvSession {
            handle,
            process: Some(process),
            io_tasks,
        };
        Ok((session, event_rx))
    }
}

pub struct MpvSession {
    handle: MpvHandle,
    process: Option<tokio::process::Child>,
    io_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl PlayerSession for MpvSession {
    async fn play(&self) -> Result<(), PlayerError> {
        self.handle
            .send(json!(["set_property", "pause", false]))
            .await?;
        Ok(())
    }

    async fn seek_to(&self, secs: f64) -> Result<(), PlayerError> {
        self.handle
            .send(json!(["set_property", "time-pos", secs]))
            .await?;
        Ok(())
    }

    async fn position(&self) -> Option<f64> {
        self.handle.get_property_f64("time-pos").await
    }

    async fn duration(&self) -> Option<f64> {
        self.handle.get_property_f64("duration").await
    }

    async fn set_mute(&self, muted: bool) -> Result<(), PlayerError> {
        self.handle
            .send(json!(["set_property", "mute", muted]))
            .await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        // Kill rather than ask: a graceful `quit` over IPC waits on a reply,
        // and a wedged player would stall the event loop for the full IPC
        // timeout on every channel change.
        if let Some(mut process) = self.process.take() {
            let _ = process.kill().await;
        }
        for task in self.io_tasks.drain(..) {
            task.abort();
        }
        debug!("mpv: session shut down");
    }
}

// ── connection ────────────────────────────────────────────────────────────────

#[cfg(unix)]
async fn connect(
    tag: u64,
    event_tx: mpsc::Sender<PlayerEvent>,
) -> Result<(MpvHandle, Vec<tokio::task::JoinHandle<()>>), PlayerError> {
    let socket_path = std::path::PathBuf::from(tv_proto::platform::mpv_socket_name(tag));

    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if socket_path.exists() {
            break;
        }
    }
    if !socket_path.exists() {
        return Err(PlayerError::Spawn("mpv IPC socket did not appear".into()));
    }

    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| PlayerError::Ipc(e.to_string()))?;
    debug!("mpv: connected to IPC socket");
    Ok(start_io_tasks(stream, event_tx))
}

#[cfg(windows)]
async fn connect(
    tag: u64,
    event_tx: mpsc::Sender<PlayerEvent>,
) -> Result<(MpvHandle, Vec<tokio::task::JoinHandle<()>>), PlayerError> {
    let pipe_path = format!(r"\\.\pipe\{}", tv_proto::platform::mpv_socket_name(tag));

    for _ in 0..SOCKET_WAIT_ATTEMPTS {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
        if let Ok(pipe) = ClientOptions::new().open(&pipe_path) {
            debug!("mpv: connected to named pipe");
            return Ok(start_io_tasks(pipe, event_tx));
        }
    }
    Err(PlayerError::Spawn("mpv named pipe did not appear".into()))
}

fn start_io_tasks<S>(
    stream: S,
    event_tx: mpsc::Sender<PlayerEvent>,
) -> (MpvHandle, Vec<tokio::task::JoinHandle<()>>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // pending map: req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);
    let (raw_tx, raw_rx) = mpsc::channel::<Value>(64);

    let tasks = vec![
        tokio::spawn(writer_task(write_half, cmd_rx, Arc::clone(&pending))),
        tokio::spawn(reader_task(reader, pending, raw_tx)),
        tokio::spawn(translator_task(raw_rx, event_tx)),
    ];

    (MpvHandle { tx: cmd_tx }, tasks)
}

// ── reader / writer tasks ─────────────────────────────────────────────────────

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, raw_tx: mpsc::Sender<Value>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            Err(PlayerError::Ipc(err.to_string()))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else if raw_tx.send(val).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(PlayerError::Ipc(reason.to_string())));
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register the reply channel before writing so the reader can match
        // a fast response.
        {
            let mut map = pending.lock().await;
            map.insert(req.req_id, req.reply);
        }
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            let mut map = pending.lock().await;
            if let Some(tx) = map.remove(&req.req_id) {
                let _ = tx.send(Err(PlayerError::Ipc(e.to_string())));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Maps raw mpv events onto the capability's event vocabulary.  Exactly one
/// `Ready` is emitted, on `file-loaded`.
async fn translator_task(mut raw_rx: mpsc::Receiver<Value>, event_tx: mpsc::Sender<PlayerEvent>) {
    let mut paused = true; // sessions are spawned with --pause
    while let Some(raw) = raw_rx.recv().await {
        let event = match raw.get("event").and_then(|e| e.as_str()) {
            Some("file-loaded") => Some(PlayerEvent::Ready),
            Some("end-file") => match raw.get("reason").and_then(|r| r.as_str()) {
                Some("error") => {
                    let detail = raw
                        .get("file_error")
                        .and_then(|e| e.as_str())
                        .unwrap_or("unknown");
                    Some(PlayerEvent::Error(detail.to_string()))
                }
                // quit/stop come from our own teardown; only a natural end
                // counts.
                Some("eof") => Some(PlayerEvent::Ended),
                _ => None,
            },
            Some("property-change") => match raw.get("id").and_then(|i| i.as_u64()) {
                Some(OBS_PAUSE) => {
                    let now_paused = raw
                        .get("data")
                        .and_then(|d| d.as_bool())
                        .unwrap_or(paused);
                    let changed = now_paused != paused;
                    paused = now_paused;
                    match (changed, now_paused) {
                        (true, true) => Some(PlayerEvent::Paused),
                        (true, false) => Some(PlayerEvent::Playing),
                        _ => None,
                    }
                }
                _ => None,
            },
            _ => None,
        };

        if let Some(event) = event {
            if event_tx.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!("mpv translator: task exiting");
}
