//! Interactive prompt relay.
//!
//! The host pushes authentication prompts (host-key confirmation, key
//! passphrases, one-time codes) while a tunnel `connect` is pending. The relay
//! shows them through a [`PromptView`] one at a time, in arrival order, and
//! sends each answer back to the host.
//!
//! ## Lifecycle of a prompt
//!
//! ```text
//! queued ──(no dialog open)──▶ open ──submit──▶ awaiting reply ──ack──▶ closed
//!                               │    ◀──reply failed──┘
//!                               └──cancel / attempt finished──────────▶ closed
//! ```
//!
//! At most one prompt is open. Everything else waits in a FIFO queue and is
//! opened as soon as the current one closes.
//!
//! A prompt belongs to the connect attempt that was outstanding (the newest
//! one, if several were) when it arrived. Once that attempt ends, the host has
//! given up on the prompt: an open one is closed without a reply and a queued
//! one is skipped with a log line. Prompts that arrive while nothing is
//! connecting have no owner and stay until answered or cancelled.
//!
//! The relay runs as a single task. Arrivals come in on a bounded channel fed
//! by the host; UI actions come in through a cloneable [`RelayHandle`].

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::host::{Host, PromptEvent};
use crate::tunnel::ConnectAttempts;

/// How a prompt should be rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// Yes/no question, e.g. an unknown host key.
    Confirm,
    /// Secret input (password, passphrase, OTP). Never echoed.
    Masked,
    FreeText,
}

/// Classify prompt text by case-insensitive substring match.
pub fn classify(text: &str) -> PromptKind {
    let lower = text.to_lowercase();
    if lower.contains("yes/no") || lower.contains("continue connecting") {
        return PromptKind::Confirm;
    }
    const SECRET_MARKERS: [&str; 5] = [
        "password",
        "passphrase",
        "verification code",
        "one-time",
        "otp",
    ];
    if SECRET_MARKERS.iter().any(|m| lower.contains(m)) {
        return PromptKind::Masked;
    }
    PromptKind::FreeText
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptState {
    Open,
    /// Reply sent; input disabled until the host acknowledges it.
    AwaitingReply,
}

/// The prompt currently shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePrompt {
    pub id: String,
    pub text: String,
    pub kind: PromptKind,
    pub state: PromptState,
    /// Connect attempt that owns the prompt, if any was outstanding.
    pub attempt: Option<u64>,
}

impl ActivePrompt {
    fn new(event: PromptEvent, attempt: Option<u64>) -> Self {
        Self {
            kind: classify(&event.prompt),
            id: event.id,
            text: event.prompt,
            state: PromptState::Open,
            attempt,
        }
    }
}

/// Where prompts are displayed. Implemented by the UI layer.
pub trait PromptView: Send + 'static {
    fn show(&mut self, prompt: &ActivePrompt);
    /// `true` while a reply is in flight. `false` re-enables input after the
    /// host rejected a reply and the prompt stays open.
    fn set_busy(&mut self, busy: bool);
    fn hide(&mut self, id: &str);
}

/// Point-in-time view of the relay, for UI code and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySnapshot {
    pub current: Option<ActivePrompt>,
    pub queued: usize,
}

enum Command {
    Submit(String),
    Cancel,
    Snapshot(oneshot::Sender<RelaySnapshot>),
}

/// Cloneable handle for UI actions on the relay.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::Sender<Command>,
}

impl RelayHandle {
    /// Answer the open prompt. Ignored if nothing is open or a reply is
    /// already in flight. Returns `false` if the relay has stopped.
    pub async fn submit(&self, value: impl Into<String>) -> bool {
        self.tx.send(Command::Submit(value.into())).await.is_ok()
    }

    /// Dismiss the open prompt. Returns `false` if the relay has stopped.
    pub async fn cancel(&self) -> bool {
        self.tx.send(Command::Cancel).await.is_ok()
    }

    pub async fn snapshot(&self) -> Option<RelaySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Snapshot(tx)).await.ok()?;
        rx.await.ok()
    }
}

/// Start the relay task.
///
/// `events` carries prompt arrivals from the host. `connecting` is the tunnel
/// manager's set of outstanding connect attempts: when the attempt owning the
/// open prompt leaves it, that prompt is closed without a reply. The task ends
/// once `events` is closed and every [`RelayHandle`] has been dropped; it
/// yields the view back.
pub fn spawn_relay<V: PromptView>(
    host: Arc<dyn Host>,
    view: V,
    events: mpsc::Receiver<PromptEvent>,
    connecting: watch::Receiver<ConnectAttempts>,
) -> (RelayHandle, JoinHandle<V>) {
    let (tx, rx) = mpsc::channel(16);
    let relay = Relay {
        host,
        view,
        attempts: connecting.clone(),
        queue: VecDeque::new(),
        current: None,
    };
    let task = tokio::spawn(run(relay, events, rx, connecting));
    (RelayHandle { tx }, task)
}

struct Relay<V> {
    host: Arc<dyn Host>,
    view: V,
    attempts: watch::Receiver<ConnectAttempts>,
    queue: VecDeque<ActivePrompt>,
    current: Option<ActivePrompt>,
}

type ReplyTask = JoinHandle<Result<(), BridgeError>>;

enum Cancelled {
    /// Waiting for the host to acknowledge the reply.
    Replying(ReplyTask),
    /// Closed without waiting.
    Closed,
    Ignored,
}

impl<V: PromptView> Relay<V> {
    fn enqueue(&mut self, event: PromptEvent) {
        let attempt = self.attempts.borrow().latest();
        debug!(id = %event.id, ?attempt, "Prompt queued");
        self.queue.push_back(ActivePrompt::new(event, attempt));
        self.advance();
    }

    /// Whether the attempt owning `prompt` is still outstanding.
    fn is_live(&self, prompt: &ActivePrompt) -> bool {
        prompt
            .attempt
            .is_none_or(|id| self.attempts.borrow().is_active(id))
    }

    /// The open prompt's attempt has ended.
    fn current_abandoned(&self) -> bool {
        self.current.as_ref().is_some_and(|p| !self.is_live(p))
    }

    /// Open the next queued prompt if none is open.
    fn advance(&mut self) {
        if self.current.is_some() {
            return;
        }
        while let Some(prompt) = self.queue.pop_front() {
            if !self.is_live(&prompt) {
                info!(id = %prompt.id, attempt = ?prompt.attempt, "Connection attempt already finished, skipping prompt");
                continue;
            }
            info!(id = %prompt.id, kind = ?prompt.kind, "Prompt open");
            self.view.show(&prompt);
            self.current = Some(prompt);
            return;
        }
    }

    /// The host rejected the reply: let the user answer again.
    fn reopen(&mut self) {
        if let Some(prompt) = self.current.as_mut() {
            if prompt.state == PromptState::AwaitingReply {
                prompt.state = PromptState::Open;
                self.view.set_busy(false);
            }
        }
    }

    fn close_current(&mut self) {
        if let Some(prompt) = self.current.take() {
            debug!(id = %prompt.id, "Prompt closed");
            self.view.hide(&prompt.id);
        }
        self.advance();
    }

    /// Send `value` for the open prompt and mark it awaiting reply.
    fn reply(&mut self, value: String) -> Option<ReplyTask> {
        let prompt = self.current.as_mut()?;
        if prompt.state != PromptState::Open {
            debug!(id = %prompt.id, "Reply already in flight, ignoring submit");
            return None;
        }
        prompt.state = PromptState::AwaitingReply;
        self.view.set_busy(true);
        let host = Arc::clone(&self.host);
        let id = prompt.id.clone();
        Some(tokio::spawn(async move { host.prompt_reply(&id, &value).await }))
    }

    /// Cancel the open prompt. A confirm prompt is answered "no"; anything
    /// else gets an empty reply and closes at once.
    fn cancel(&mut self) -> Cancelled {
        let Some(prompt) = self.current.as_ref() else {
            return Cancelled::Ignored;
        };
        if prompt.kind == PromptKind::Confirm {
            return self
                .reply("no".to_string())
                .map_or(Cancelled::Ignored, Cancelled::Replying);
        }

        // Empty reply tells the host the user gave up; don't wait for it.
        let host = Arc::clone(&self.host);
        let id = prompt.id.clone();
        tokio::spawn(async move {
            if let Err(e) = host.prompt_reply(&id, "").await {
                warn!(id, "Prompt cancel reply failed: {e}");
            }
        });
        self.close_current();
        Cancelled::Closed
    }

    fn snapshot(&self) -> RelaySnapshot {
        RelaySnapshot {
            current: self.current.clone(),
            queued: self.queue.len(),
        }
    }
}

async fn run<V: PromptView>(
    mut relay: Relay<V>,
    mut events: mpsc::Receiver<PromptEvent>,
    mut commands: mpsc::Receiver<Command>,
    mut connecting: watch::Receiver<ConnectAttempts>,
) -> V {
    let mut reply: Option<ReplyTask> = None;
    let mut events_open = true;
    let mut commands_open = true;
    let mut watch_open = true;

    while events_open || commands_open {
        tokio::select! {
            // Arrivals first, so a snapshot reflects every prompt already delivered.
            biased;

            event = events.recv(), if events_open => match event {
                Some(event) => relay.enqueue(event),
                None => events_open = false,
            },

            result = async {
                match reply.as_mut() {
                    Some(task) => task.await,
                    None => std::future::pending().await,
                }
            }, if reply.is_some() => {
                reply = None;
                match result {
                    Ok(Ok(())) => relay.close_current(),
                    Ok(Err(e)) => {
                        warn!("Prompt reply failed: {e}");
                        relay.reopen();
                    }
                    Err(e) => {
                        warn!("Prompt reply task failed: {e}");
                        relay.reopen();
                    }
                }
            }

            changed = connecting.changed(), if watch_open => {
                if changed.is_err() {
                    watch_open = false;
                } else if relay.current_abandoned() {
                    if let Some(prompt) = &relay.current {
                        info!(id = %prompt.id, attempt = ?prompt.attempt, "Connection attempt finished, closing prompt");
                    }
                    // A reply still in flight completes on its own.
                    reply = None;
                    relay.close_current();
                }
            }

            command = commands.recv(), if commands_open => match command {
                Some(Command::Submit(value)) => {
                    if let Some(task) = relay.reply(value) {
                        reply = Some(task);
                    }
                }
                Some(Command::Cancel) => match relay.cancel() {
                    Cancelled::Replying(task) => reply = Some(task),
                    Cancelled::Closed => reply = None,
                    Cancelled::Ignored => {}
                },
                Some(Command::Snapshot(tx)) => {
                    let _ = tx.send(relay.snapshot());
                }
                None => commands_open = false,
            },

            else => break,
        }
    }
    relay.view
}
