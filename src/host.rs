//! The host process boundary.
//!
//! The bridge never speaks the remote-login protocol itself. A host (usually
//! the sidecar child process) does, and the bridge only asks it to connect,
//! disconnect and forward prompt replies. The host in turn pushes
//! authentication prompts back to the bridge as [`PromptEvent`]s.
//!
//! ## Wire format ([`ProcessHost`])
//!
//! One JSON object per line on the sidecar's stdin/stdout:
//!
//! ```text
//! → {"id":0,"method":"connect","params":{"command":"ssh user@host"}}
//! ← {"event":"prompt","data":{"id":"p1","prompt":"Enter passphrase for key:"}}
//! → {"id":1,"method":"prompt_reply","params":{"id":"p1","value":"secret"}}
//! ← {"id":1,"result":null}
//! ← {"id":0,"result":{"key":"k1","url":"https://h/","password":"pw","destination":"user@host"}}
//! ← {"id":2,"error":"no such tunnel"}
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::sidecar::{forward_stderr, SidecarCommand, SidecarExit};

/// An authentication prompt pushed by the host.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PromptEvent {
    pub id: String,
    pub prompt: String,
}

/// Result of a successful `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectReply {
    pub key: String,
    pub url: String,
    pub password: String,
    #[serde(default)]
    pub destination: String,
}

/// Listen address the host's local server reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    pub hostname: Option<String>,
    pub port: Option<u32>,
}

impl ServerConfig {
    /// `http://hostname:port`, when both are known.
    pub fn base_url(&self) -> Option<String> {
        match (&self.hostname, self.port) {
            (Some(host), Some(port)) => Some(format!("http://{host}:{port}")),
            _ => None,
        }
    }
}

/// Operations the bridge can ask of the host. Every call crosses a process
/// boundary and may fail independently of the others.
#[async_trait]
pub trait Host: Send + Sync {
    async fn connect(&self, command: &str) -> Result<ConnectReply, BridgeError>;
    async fn disconnect(&self, key: &str) -> Result<(), BridgeError>;
    async fn prompt_reply(&self, id: &str, value: &str) -> Result<(), BridgeError>;

    /// Best-effort: the host's local server address, if it reports one.
    async fn server_config(&self) -> Option<ServerConfig> {
        None
    }
}

type Reply = Result<Value, BridgeError>;

/// Requests waiting for a response. Once `closed` is set no new waiter is
/// registered, so nothing can wait on a host that has already gone.
#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
}

/// A [`Host`] backed by a sidecar child process speaking line-delimited JSON.
pub struct ProcessHost {
    outbound: mpsc::Sender<String>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    kill: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl ProcessHost {
    /// Spawn the sidecar and start its I/O tasks.
    ///
    /// Prompt events are delivered on `prompts`. The returned receiver fires
    /// once when the process exits.
    pub fn spawn(
        command: &SidecarCommand,
        prompts: mpsc::Sender<PromptEvent>,
    ) -> Result<(Self, oneshot::Receiver<SidecarExit>), BridgeError> {
        let mut child = command.build().spawn()?;
        info!(program = command.program(), pid = ?child.id(), "Spawned sidecar");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BridgeError::Protocol("sidecar stdin not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BridgeError::Protocol("sidecar stdout not piped".into()))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let pending = Arc::new(Mutex::new(Pending::default()));
        let (out_tx, out_rx) = mpsc::channel::<String>(64);
        tokio::spawn(writer_loop(stdin, out_rx));
        tokio::spawn(reader_loop(stdout, Arc::clone(&pending), prompts));

        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(target: "sidecar", "Failed to kill sidecar: {e}");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    let exit = SidecarExit::from_status(status);
                    info!(target: "sidecar", code = ?exit.code, signal = ?exit.signal, "Sidecar terminated");
                    let _ = exit_tx.send(exit);
                }
                Err(e) => warn!(target: "sidecar", "Sidecar wait error: {e}"),
            }
        });

        Ok((
            Self {
                outbound: out_tx,
                pending,
                next_id: AtomicU64::new(0),
                kill: std::sync::Mutex::new(Some(kill_tx)),
            },
            exit_rx,
        ))
    }

    /// Kill the sidecar. Pending requests fail with [`BridgeError::HostClosed`]
    /// once its stdout closes.
    pub fn shutdown(&self) {
        let tx = self
            .kill
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    async fn call(&self, method: &str, params: Value) -> Reply {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(BridgeError::HostClosed);
            }
            pending.waiters.insert(id, tx);
        }

        let line = serde_json::to_string(&json!({ "id": id, "method": method, "params": params }))?;
        debug!(id, method, "Host request");
        if self.outbound.send(line).await.is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(BridgeError::HostClosed);
        }
        rx.await.map_err(|_| BridgeError::HostClosed)?
    }
}

#[async_trait]
impl Host for ProcessHost {
    async fn connect(&self, command: &str) -> Result<ConnectReply, BridgeError> {
        let result = self.call("connect", json!({ "command": command })).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn disconnect(&self, key: &str) -> Result<(), BridgeError> {
        self.call("disconnect", json!({ "key": key })).await.map(drop)
    }

    async fn prompt_reply(&self, id: &str, value: &str) -> Result<(), BridgeError> {
        self.call("prompt_reply", json!({ "id": id, "value": value }))
            .await
            .map(drop)
    }

    async fn server_config(&self) -> Option<ServerConfig> {
        self.call("server_config", Value::Null)
            .await
            .and_then(|v| serde_json::from_value::<ServerConfig>(v).map_err(BridgeError::from))
            .inspect_err(|e| warn!("Failed to read sidecar server config: {e}"))
            .ok()
    }
}

async fn writer_loop(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(target: "sidecar", "Write to sidecar failed: {e}");
            break;
        }
    }
}

async fn reader_loop(
    stdout: ChildStdout,
    pending: Arc<Mutex<Pending>>,
    prompts: mpsc::Sender<PromptEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(target: "sidecar", "Read from sidecar failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(msg) => dispatch(msg, &pending, &prompts).await,
            Err(e) => warn!(target: "sidecar", "Ignoring malformed line ({e}): {line}"),
        }
    }

    // Sidecar stdout closed: fail everything still waiting
    let mut pending = pending.lock().await;
    pending.closed = true;
    let count = pending.waiters.len();
    for (_, tx) in pending.waiters.drain() {
        let _ = tx.send(Err(BridgeError::HostClosed));
    }
    if count > 0 {
        warn!(target: "sidecar", "Sidecar closed with {count} pending requests");
    }
}

async fn dispatch(msg: Value, pending: &Mutex<Pending>, prompts: &mpsc::Sender<PromptEvent>) {
    if let Some(event) = msg["event"].as_str() {
        if event != "prompt" {
            debug!(event, "Ignoring sidecar event");
            return;
        }
        match serde_json::from_value::<PromptEvent>(msg["data"].clone()) {
            Ok(prompt) => {
                if prompts.send(prompt).await.is_err() {
                    warn!("Prompt relay is gone, dropping prompt event");
                }
            }
            Err(e) => warn!("Malformed prompt event: {e}"),
        }
        return;
    }

    let Some(id) = msg["id"].as_u64() else {
        warn!(target: "sidecar", "Sidecar message without id or event: {msg}");
        return;
    };
    let Some(tx) = pending.lock().await.waiters.remove(&id) else {
        debug!(id, "Response for unknown request");
        return;
    };
    let reply = match msg.get("error") {
        Some(err) if !err.is_null() => Err(BridgeError::Host(
            err.as_str().map_or_else(|| err.to_string(), String::from),
        )),
        _ => Ok(msg.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(reply);
}
