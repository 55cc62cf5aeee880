//! Connect through an authentication prompt, route requests through the
//! tunnel credential, then tear the tunnel down.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::Method;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use deskbridge::config::FetchConfig;
use deskbridge::fetch::{basic_auth_header, FetchRouter};
use deskbridge::host::{ConnectReply, Host, PromptEvent};
use deskbridge::prompt::{spawn_relay, ActivePrompt, PromptKind, PromptView, RelayHandle};
use deskbridge::{BridgeError, TunnelManager};

/// Host that asks for a key passphrase and only opens the tunnel for
/// "secret".
struct PassphraseHost {
    prompts: mpsc::Sender<PromptEvent>,
    answer_tx: AsyncMutex<Option<oneshot::Sender<String>>>,
    answer_rx: AsyncMutex<Option<oneshot::Receiver<String>>>,
    replies: Mutex<Vec<(String, String)>>,
    disconnects: Mutex<Vec<String>>,
}

impl PassphraseHost {
    fn new(prompts: mpsc::Sender<PromptEvent>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            prompts,
            answer_tx: AsyncMutex::new(Some(tx)),
            answer_rx: AsyncMutex::new(Some(rx)),
            replies: Mutex::new(Vec::new()),
            disconnects: Mutex::new(Vec::new()),
        }
    }

    fn replies(&self) -> Vec<(String, String)> {
        self.replies.lock().unwrap().clone()
    }
}

#[async_trait]
impl Host for PassphraseHost {
    async fn connect(&self, _command: &str) -> Result<ConnectReply, BridgeError> {
        let rx = self
            .answer_rx
            .lock()
            .await
            .take()
            .ok_or(BridgeError::HostClosed)?;
        self.prompts
            .send(PromptEvent {
                id: "p1".into(),
                prompt: "Enter passphrase for key '/home/me/.ssh/id_ed25519':".into(),
            })
            .await
            .map_err(|_| BridgeError::HostClosed)?;

        match rx.await.map_err(|_| BridgeError::HostClosed)?.as_str() {
            "secret" => Ok(ConnectReply {
                key: "k1".into(),
                url: "https://h/".into(),
                password: "tunnelpw".into(),
                destination: "me@h".into(),
            }),
            _ => Err(BridgeError::Host("Permission denied (publickey)".into())),
        }
    }

    async fn disconnect(&self, key: &str) -> Result<(), BridgeError> {
        self.disconnects.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn prompt_reply(&self, id: &str, value: &str) -> Result<(), BridgeError> {
        self.replies
            .lock()
            .unwrap()
            .push((id.to_string(), value.to_string()));
        if let Some(tx) = self.answer_tx.lock().await.take() {
            let _ = tx.send(value.to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
struct SharedView(Arc<Mutex<Vec<String>>>);

impl PromptView for SharedView {
    fn show(&mut self, prompt: &ActivePrompt) {
        self.0.lock().unwrap().push(format!("show {}", prompt.id));
    }
    fn set_busy(&mut self, busy: bool) {
        self.0.lock().unwrap().push(format!("busy {busy}"));
    }
    fn hide(&mut self, id: &str) {
        self.0.lock().unwrap().push(format!("hide {id}"));
    }
}

async fn open_prompt(relay: &RelayHandle) -> ActivePrompt {
    for _ in 0..200 {
        if let Some(prompt) = relay.snapshot().await.and_then(|s| s.current) {
            return prompt;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no prompt opened");
}

struct Bridge {
    host: Arc<PassphraseHost>,
    manager: Arc<TunnelManager>,
    relay: RelayHandle,
    view: SharedView,
}

fn bridge() -> Bridge {
    let (prompt_tx, prompt_rx) = mpsc::channel(8);
    let host = Arc::new(PassphraseHost::new(prompt_tx));
    let manager = Arc::new(TunnelManager::new(host.clone()));
    let view = SharedView::default();
    let (relay, _task) = spawn_relay(
        host.clone(),
        view.clone(),
        prompt_rx,
        manager.subscribe_connecting(),
    );
    Bridge {
        host,
        manager,
        relay,
        view,
    }
}

fn auth_header(router: &FetchRouter, url: &str) -> Option<String> {
    router
        .prepare(Method::GET, url)
        .unwrap()
        .build()
        .unwrap()
        .headers()
        .get(AUTHORIZATION)
        .map(|v| v.to_str().unwrap().to_string())
}

#[tokio::test]
async fn test_passphrase_connect_routes_and_disconnects() {
    let b = bridge();
    let manager = Arc::clone(&b.manager);
    let pending = tokio::spawn(async move { manager.connect("ssh h").await });

    let prompt = open_prompt(&b.relay).await;
    assert_eq!(prompt.id, "p1");
    assert_eq!(prompt.kind, PromptKind::Masked);
    assert!(b.manager.is_connecting());

    assert!(b.relay.submit("secret").await);
    let conn = pending.await.unwrap().unwrap();
    assert_eq!(conn.key, "k1");
    assert_eq!(
        b.host.replies(),
        vec![("p1".to_string(), "secret".to_string())]
    );
    assert!(!b.manager.is_connecting());

    assert!(!b.manager.is_server_local("https://h/"));
    assert_eq!(b.manager.server_key("https://h/"), "ssh:k1");

    let router = FetchRouter::new(
        reqwest::Client::new(),
        b.manager.directory(),
        &FetchConfig::default(),
    );
    router.set_ambient_password(Some("localpw".into()));
    assert_eq!(
        auth_header(&router, "https://h/api"),
        Some(basic_auth_header("tunnelpw"))
    );

    let teardown = b.manager.disconnect("k1").await;
    assert!(teardown.host_error.is_none());
    assert_eq!(teardown.removed.len(), 1);
    assert_eq!(*b.host.disconnects.lock().unwrap(), vec!["k1".to_string()]);

    // No tunnel credential any more; only the ambient one applies.
    assert_eq!(
        auth_header(&router, "https://h/api"),
        Some(basic_auth_header("localpw"))
    );
    router.set_ambient_password(None);
    assert_eq!(auth_header(&router, "https://h/api"), None);
    assert_eq!(b.manager.server_key("https://h/"), "https://h/");

    // The prompt was shown once and closed after the host acknowledged.
    while b.relay.snapshot().await.unwrap().current.is_some() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let events = b.view.0.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("show p1"));
    assert!(events.contains(&"hide p1".to_string()));
}

#[tokio::test]
async fn test_cancelled_passphrase_fails_connect() {
    let b = bridge();
    let manager = Arc::clone(&b.manager);
    let pending = tokio::spawn(async move { manager.connect("ssh h").await });

    open_prompt(&b.relay).await;
    assert!(b.relay.cancel().await);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, BridgeError::Host(_)));
    assert_eq!(b.host.replies(), vec![("p1".to_string(), String::new())]);
    assert!(b.manager.directory().is_empty());
    assert!(!b.manager.is_connecting());
    assert_eq!(b.manager.server_key("https://h/"), "https://h/");
}
