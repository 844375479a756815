//! Sidecar bridge adapter (the production transport).
//!
//! The chat-network session library runs as a child process speaking NDJSON
//! on stdin/stdout:
//!
//! - requests: `{"id":1,"op":"connect"|"send_text"|"send_media"|"logout",...}`
//! - replies: `{"type":"response","id":1,"ok":true,"error":null}`
//! - events: `qr{code}`, `open`, `creds{data}`, `close{logged_out,reason}`

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use outreach_core::{
    audit::truncate_text,
    campaign::MimeClass,
    domain::{Address, CredentialBundle},
    errors::Error,
    transport::{DropReason, MediaPayload, Transport, TransportEvent, TransportEvents},
    Result,
};

const STDERR_TAIL_MAX_BYTES: usize = 16 * 1024;
const STDERR_TAIL_MAX_LINES: usize = 200;
const EXIT_REASON_MAX: usize = 500;

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Device name shown on the paired phone.
    pub client_name: String,
    pub request_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_config(cfg: &outreach_core::config::Config) -> Self {
        Self {
            program: cfg.bridge_program.clone(),
            args: cfg.bridge_args.clone(),
            client_name: cfg.client_name.clone(),
            request_timeout: cfg.bridge_timeout,
        }
    }
}

type Reply = std::result::Result<(), String>;
type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub struct BridgeTransport {
    cfg: BridgeConfig,
    running: Arc<Mutex<Option<Running>>>,
    next_id: AtomicU64,
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    pending: Pending,
    shutdown: CancellationToken,
}

#[derive(Clone, Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        // +1 for the '\n' we join with later.
        self.bytes = self.bytes.saturating_add(line.len() + 1);
        self.lines.push_back(line);

        while self.lines.len() > STDERR_TAIL_MAX_LINES || self.bytes > STDERR_TAIL_MAX_BYTES {
            if let Some(front) = self.lines.pop_front() {
                self.bytes = self.bytes.saturating_sub(front.len() + 1);
            } else {
                break;
            }
        }
    }

    fn snapshot(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Connect {
        #[serde(rename = "clientName")]
        client_name: &'a str,
        credentials: Option<String>,
    },
    SendText {
        to: &'a str,
        text: &'a str,
    },
    SendMedia {
        to: &'a str,
        kind: &'static str,
        mimetype: &'a str,
        filename: &'a str,
        caption: Option<&'a str>,
        data: String,
    },
    Logout,
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    id: u64,
    #[serde(flatten)]
    request: Request<'a>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Incoming {
    Response {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Qr {
        code: String,
    },
    Open,
    Creds {
        data: String,
    },
    Close {
        #[serde(default)]
        logged_out: bool,
        #[serde(default)]
        reason: Option<String>,
    },
}

impl BridgeTransport {
    pub fn new(cfg: BridgeConfig) -> Self {
        Self {
            cfg,
            running: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    async fn spawn(&self, events: TransportEvents) -> Result<()> {
        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            Error::Transport(format!(
                "failed to start bridge {}: {e}",
                self.cfg.program.display()
            ))
        })?;
        info!(pid = ?child.id(), generation = events.generation(), "bridge started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transport("bridge stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Transport("bridge stdout was not captured".to_string()))?;

        // Drain stderr in background to avoid blocking on a full pipe.
        let stderr_tail = Arc::new(Mutex::new(StderrTail::default()));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = stderr_tail.clone();
            tokio::spawn(async move {
                let mut r = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = r.next_line().await {
                    debug!(target: "outreach_bridge::sidecar", "{line}");
                    tail.lock().await.push_line(line);
                }
            })
        });

        let pending: Pending = Arc::default();
        let shutdown = CancellationToken::new();
        tokio::spawn(read_stdout(
            stdout,
            events,
            pending.clone(),
            stderr_tail,
            stderr_task,
            shutdown.clone(),
        ));

        *self.running.lock().await = Some(Running {
            child,
            stdin,
            pending,
            shutdown,
        });
        Ok(())
    }

    async fn request(&self, request: Request<'_>) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut line = serde_json::to_string(&Envelope { id, request })?;
        line.push('\n');

        let (tx, rx) = oneshot::channel();
        let pending = {
            let mut guard = self.running.lock().await;
            let Some(running) = guard.as_mut() else {
                return Err(Error::Transport("bridge is not running".to_string()));
            };
            lock_pending(&running.pending).insert(id, tx);
            let written = async {
                running.stdin.write_all(line.as_bytes()).await?;
                running.stdin.flush().await
            }
            .await;
            if let Err(e) = written {
                lock_pending(&running.pending).remove(&id);
                return Err(Error::Transport(format!("failed to write to bridge: {e}")));
            }
            running.pending.clone()
        };

        match tokio::time::timeout(self.cfg.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(msg))) => Err(Error::Transport(msg)),
            Ok(Err(_)) => Err(Error::Transport(
                "bridge exited before replying".to_string(),
            )),
            Err(_) => {
                lock_pending(&pending).remove(&id);
                Err(Error::Transport(format!(
                    "bridge request timed out after {}ms",
                    self.cfg.request_timeout.as_millis()
                )))
            }
        }
    }

    async fn kill_child(&self) -> Result<()> {
        let running = self.running.lock().await.take();
        let Some(mut running) = running else {
            return Ok(());
        };
        // Suppresses the drop event the reader would otherwise report.
        running.shutdown.cancel();
        fail_pending(&running.pending, "bridge stopped");

        // If it's already exited, `try_wait` reaps it.
        if running.child.try_wait()?.is_some() {
            return Ok(());
        }
        match running.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // If it exited between `try_wait` and `kill`, `wait` will reap it.
                if running.child.try_wait()?.is_none() {
                    let mut guard = self.running.lock().await;
                    if guard.is_none() {
                        *guard = Some(running);
                    }
                    return Err(Error::Io(e));
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    async fn connect(
        &self,
        credentials: Option<CredentialBundle>,
        events: TransportEvents,
    ) -> Result<()> {
        // One sidecar per session: replace whatever is running.
        self.kill_child().await?;
        self.spawn(events).await?;

        let request = Request::Connect {
            client_name: &self.cfg.client_name,
            credentials: credentials.map(|c| STANDARD.encode(&c.0)),
        };
        if let Err(e) = self.request(request).await {
            if let Err(kill_e) = self.kill_child().await {
                warn!(error = %kill_e, "failed to stop bridge after connect failure");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn send_text(&self, to: &Address, text: &str) -> Result<()> {
        self.request(Request::SendText {
            to: to.as_str(),
            text,
        })
        .await
    }

    async fn send_media(&self, to: &Address, media: MediaPayload<'_>) -> Result<()> {
        self.request(Request::SendMedia {
            to: to.as_str(),
            kind: media_kind(media.mime_class),
            mimetype: media.mimetype,
            filename: media.filename,
            caption: media.caption,
            data: STANDARD.encode(media.bytes),
        })
        .await
    }

    async fn logout(&self) -> Result<()> {
        let result = self.request(Request::Logout).await;
        self.kill_child().await?;
        result
    }
}

fn media_kind(class: MimeClass) -> &'static str {
    match class {
        MimeClass::Image => "image",
        MimeClass::Video => "video",
        MimeClass::Document => "document",
    }
}

fn lock_pending(
    pending: &Pending,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fail_pending(pending: &Pending, why: &str) {
    for (_, tx) in lock_pending(pending).drain() {
        let _ = tx.send(Err(why.to_string()));
    }
}

fn classify_line(line: &str) -> Option<Incoming> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<Incoming>(line) {
        Ok(msg) => Some(msg),
        Err(e) => {
            debug!(error = %e, line = %truncate_text(line, 200), "ignoring unrecognized bridge output");
            None
        }
    }
}

/// Translate a sidecar event into a transport event.
fn to_transport_event(msg: Incoming) -> Option<TransportEvent> {
    match msg {
        Incoming::Response { .. } => None,
        Incoming::Qr { code } => Some(TransportEvent::PairingCode(code)),
        Incoming::Open => Some(TransportEvent::Authenticated),
        Incoming::Creds { data } => match STANDARD.decode(data.trim()) {
            Ok(bytes) => Some(TransportEvent::CredentialsUpdated(CredentialBundle(bytes))),
            Err(e) => {
                warn!(error = %e, "bridge sent undecodable credentials");
                None
            }
        },
        Incoming::Close { logged_out: true, .. } => {
            Some(TransportEvent::Dropped(DropReason::LoggedOut))
        }
        Incoming::Close { reason, .. } => Some(TransportEvent::Dropped(DropReason::Transient(
            reason.unwrap_or_else(|| "connection closed".to_string()),
        ))),
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    events: TransportEvents,
    pending: Pending,
    stderr_tail: Arc<Mutex<StderrTail>>,
    stderr_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
) {
    let mut reader = BufReader::new(stdout).lines();
    let mut closed = false;
    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "bridge stdout read failed");
                break;
            }
        };
        let Some(msg) = classify_line(&line) else {
            continue;
        };

        if let Incoming::Response { id, ok, error } = &msg {
            let reply = if *ok {
                Ok(())
            } else {
                Err(error.clone().unwrap_or_else(|| "bridge request failed".to_string()))
            };
            match lock_pending(&pending).remove(id) {
                Some(tx) => {
                    let _ = tx.send(reply);
                }
                None => debug!(id, "reply for unknown or expired request"),
            }
            continue;
        }

        if matches!(msg, Incoming::Close { .. }) {
            closed = true;
        }
        if let Some(event) = to_transport_event(msg) {
            if !events.emit(event) {
                debug!("session manager gone; stopping bridge reader");
                return;
            }
        }
    }

    fail_pending(&pending, "bridge exited before replying");
    if closed || shutdown.is_cancelled() {
        return;
    }

    // stderr closes with the process; let the tail catch up first.
    if let Some(task) = stderr_task {
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
    let stderr = stderr_tail.lock().await.snapshot();
    let mut reason = "bridge exited".to_string();
    if !stderr.trim().is_empty() {
        reason.push_str(": ");
        reason.push_str(&truncate_text(stderr.trim(), EXIT_REASON_MAX));
    }
    warn!(reason = %reason, "bridge exited unexpectedly");
    events.emit(TransportEvent::Dropped(DropReason::Transient(reason)));
}
