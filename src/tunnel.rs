//! Tunnel manager: opens and closes SSH tunnels through the host and keeps
//! the [`ConnectionDirectory`] in step with them.
//!
//! `connect` is load-bearing: its error is returned to the caller and nothing
//! is recorded unless it succeeds. `disconnect` is best-effort towards the
//! host (a failed teardown is logged and reported in [`Teardown`]) but always
//! clears the directory, so routing never keeps using a tunnel the UI has
//! dropped.
//!
//! Each `connect` is a numbered attempt. The set of outstanding attempts is
//! published as the manager's *connecting* signal; the prompt relay watches it
//! to close a dialog whose attempt the host has finished.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::directory::{ConnectionDirectory, DirectoryReader, TunnelEntry};
use crate::error::BridgeError;
use crate::host::Host;
use crate::origin::{is_loopback_url, Origin};

/// A live tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConnection {
    pub key: String,
    pub origin: Origin,
    /// URL the host reported for the forwarded backend.
    pub url: String,
    pub password: String,
    pub destination: String,
}

/// Outcome of [`TunnelManager::disconnect`].
#[derive(Debug)]
pub struct Teardown {
    /// Origins removed from the directory.
    pub removed: Vec<Origin>,
    /// Set when the host failed to tear the tunnel down.
    pub host_error: Option<BridgeError>,
}

/// Connect attempts still outstanding, published on a watch channel.
///
/// Every `connect` gets a fresh id that is never reused, so a receiver that
/// misses intermediate updates (an attempt ending and another starting before
/// it looks) can still tell that a given attempt is over.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectAttempts {
    pub(crate) active: BTreeSet<u64>,
}

impl ConnectAttempts {
    pub fn is_connecting(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn is_active(&self, attempt: u64) -> bool {
        self.active.contains(&attempt)
    }

    /// The most recently started attempt that is still outstanding.
    pub fn latest(&self) -> Option<u64> {
        self.active.last().copied()
    }
}

struct Connecting {
    next: AtomicU64,
    tx: watch::Sender<ConnectAttempts>,
}

impl Connecting {
    fn begin(&self) -> ConnectingGuard<'_> {
        let attempt = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx.send_modify(|a| {
            a.active.insert(attempt);
        });
        ConnectingGuard {
            state: self,
            attempt,
        }
    }
}

/// Retires its attempt however the connect ends (success, error, or the
/// future being dropped).
struct ConnectingGuard<'a> {
    state: &'a Connecting,
    attempt: u64,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        let attempt = self.attempt;
        self.state.tx.send_modify(|a| {
            a.active.remove(&attempt);
        });
    }
}

/// Opens/closes tunnels and owns the connection directory.
pub struct TunnelManager {
    host: Arc<dyn Host>,
    directory: ConnectionDirectory,
    connecting: Connecting,
}

impl TunnelManager {
    pub fn new(host: Arc<dyn Host>) -> Self {
        let (tx, _rx) = watch::channel(ConnectAttempts::default());
        Self {
            host,
            directory: ConnectionDirectory::new(),
            connecting: Connecting {
                next: AtomicU64::new(0),
                tx,
            },
        }
    }

    /// Ask the host to open a tunnel for `command` (e.g. `"ssh user@host"`).
    ///
    /// Prompts the host raises while this is pending go to the prompt relay.
    /// On success the tunnel's origin is recorded with its key and password.
    pub async fn connect(&self, command: &str) -> Result<TunnelConnection, BridgeError> {
        let guard = self.connecting.begin();
        info!(command, attempt = guard.attempt, "Opening tunnel");

        let reply = self.host.connect(command).await?;
        let origin =
            Origin::parse(&reply.url).ok_or_else(|| BridgeError::InvalidUrl(reply.url.clone()))?;

        let replaced = self.directory.insert(
            origin.clone(),
            TunnelEntry {
                key: reply.key.clone(),
                url: reply.url.clone(),
                password: reply.password.clone(),
                destination: reply.destination.clone(),
            },
        );
        if let Some(old) = replaced {
            warn!(%origin, old_key = %old.key, new_key = %reply.key, "Tunnel replaced existing entry for origin");
        }
        info!(%origin, key = %reply.key, destination = %reply.destination, "Tunnel open");

        Ok(TunnelConnection {
            key: reply.key,
            origin,
            url: reply.url,
            password: reply.password,
            destination: reply.destination,
        })
    }

    /// Tear down tunnel `key` and forget every origin it served.
    pub async fn disconnect(&self, key: &str) -> Teardown {
        let host_error = self
            .host
            .disconnect(key)
            .await
            .inspect_err(|e| warn!(key, "Tunnel teardown failed: {e}"))
            .err();
        let removed = self.directory.remove_by_key(key);
        info!(key, removed = removed.len(), "Tunnel closed");
        Teardown {
            removed,
            host_error,
        }
    }

    /// Grouping key for `url`: `ssh:<key>` for tunneled origins, `local` for
    /// loopback hosts, otherwise the URL itself.
    pub fn server_key(&self, url: &str) -> String {
        if let Some(key) = Origin::parse(url).and_then(|o| self.directory.reader().key_for(&o)) {
            return format!("ssh:{key}");
        }
        if is_loopback_url(url) {
            return "local".to_string();
        }
        url.to_string()
    }

    /// Whether `url` is a server on this machine. Tunneled origins never are,
    /// even when the tunnel forwards to a loopback address.
    pub fn is_server_local(&self, url: &str) -> bool {
        let Some(origin) = Origin::parse(url) else {
            return false;
        };
        if self.directory.reader().key_for(&origin).is_some() {
            return false;
        }
        is_loopback_url(url)
    }

    /// Live tunnels, sorted by origin.
    pub fn connections(&self) -> Vec<TunnelConnection> {
        self.directory
            .reader()
            .entries()
            .into_iter()
            .map(|(origin, e)| TunnelConnection {
                key: e.key,
                url: e.url,
                origin,
                password: e.password,
                destination: e.destination,
            })
            .collect()
    }

    /// Read-only view of the directory for the fetch router.
    pub fn directory(&self) -> DirectoryReader {
        self.directory.reader()
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.tx.borrow().is_connecting()
    }

    /// Outstanding connect attempts, for the prompt relay.
    pub fn subscribe_connecting(&self) -> watch::Receiver<ConnectAttempts> {
        self.connecting.tx.subscribe()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use tokio::sync::Mutex as AsyncMutex;

    use super::*;
    use crate::host::ConnectReply;

    /// Host with scripted connect results that records every call.
    #[derive(Default)]
    pub(crate) struct ScriptedHost {
        pub connects: AsyncMutex<VecDeque<Result<ConnectReply, BridgeError>>>,
        pub fail_disconnect: bool,
        pub calls: AsyncMutex<Vec<String>>,
    }

    impl ScriptedHost {
        pub fn with_connect(reply: Result<ConnectReply, BridgeError>) -> Self {
            Self {
                connects: AsyncMutex::new(VecDeque::from([reply])),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Host for ScriptedHost {
        async fn connect(&self, command: &str) -> Result<ConnectReply, BridgeError> {
            self.calls.lock().await.push(format!("connect {command}"));
            self.connects
                .lock()
                .await
                .pop_front()
                .unwrap_or(Err(BridgeError::HostClosed))
        }

        async fn disconnect(&self, key: &str) -> Result<(), BridgeError> {
            self.calls.lock().await.push(format!("disconnect {key}"));
            if self.fail_disconnect {
                Err(BridgeError::Host("teardown failed".into()))
            } else {
                Ok(())
            }
        }

        async fn prompt_reply(&self, id: &str, value: &str) -> Result<(), BridgeError> {
            self.calls.lock().await.push(format!("reply {id}={value}"));
            Ok(())
        }
    }

    pub(crate) fn reply(key: &str, url: &str, password: &str) -> ConnectReply {
        ConnectReply {
            key: key.into(),
            url: url.into(),
            password: password.into(),
            destination: "me@h".into(),
        }
    }

    #[tokio::test]
    async fn test_connect_records_origin() {
        let host = Arc::new(ScriptedHost::with_connect(Ok(reply("k1", "https://h/", "tunnelpw"))));
        let mgr = TunnelManager::new(host);
        let conn = mgr.connect("ssh h").await.unwrap();
        assert_eq!(conn.origin.as_str(), "https://h");
        assert_eq!(mgr.server_key("https://h/"), "ssh:k1");
        assert!(!mgr.is_server_local("https://h/"));
        assert_eq!(
            mgr.directory().password_for(&conn.origin).as_deref(),
            Some("tunnelpw")
        );
        assert!(!mgr.is_connecting());
    }

    #[tokio::test]
    async fn test_connect_error_propagates_and_records_nothing() {
        let host = Arc::new(ScriptedHost::with_connect(Err(BridgeError::Host("auth failed".into()))));
        let mgr = TunnelManager::new(host);
        let err = mgr.connect("ssh h").await.unwrap_err();
        assert!(matches!(err, BridgeError::Host(_)));
        assert!(mgr.directory().is_empty());
        assert!(!mgr.is_connecting());
    }

    #[tokio::test]
    async fn test_connect_with_bad_url_is_error() {
        let host = Arc::new(ScriptedHost::with_connect(Ok(reply("k1", "not a url", "pw"))));
        let mgr = TunnelManager::new(host);
        assert!(matches!(
            mgr.connect("ssh h").await,
            Err(BridgeError::InvalidUrl(_))
        ));
        assert!(mgr.directory().is_empty());
    }

    #[tokio::test]
    async fn test_server_key_precedence() {
        let host = Arc::new(ScriptedHost::with_connect(Ok(reply(
            "abc123",
            "http://localhost:4096/",
            "pw",
        ))));
        let mgr = TunnelManager::new(host);
        assert_eq!(mgr.server_key("http://localhost:4096/"), "local");
        assert!(mgr.is_server_local("http://localhost:4096/"));

        mgr.connect("ssh h").await.unwrap();
        assert_eq!(mgr.server_key("http://localhost:4096/"), "ssh:abc123");
        assert!(!mgr.is_server_local("http://localhost:4096/"));
        // Different port, different origin
        assert_eq!(mgr.server_key("http://localhost:5000/"), "local");
        assert_eq!(mgr.server_key("https://remote.example/"), "https://remote.example/");
        assert!(!mgr.is_server_local("garbage"));
    }

    #[tokio::test]
    async fn test_disconnect_clears_even_when_host_fails() {
        let host = Arc::new(ScriptedHost {
            fail_disconnect: true,
            ..ScriptedHost::with_connect(Ok(reply("k1", "https://h/", "pw")))
        });
        let mgr = TunnelManager::new(host.clone());
        mgr.connect("ssh h").await.unwrap();

        let teardown = mgr.disconnect("k1").await;
        assert!(teardown.host_error.is_some());
        assert_eq!(teardown.removed.len(), 1);
        assert_eq!(mgr.server_key("https://h/"), "https://h/");
        assert!(mgr.connections().is_empty());
        assert_eq!(host.calls.lock().await.last().unwrap(), "disconnect k1");
    }

    #[tokio::test]
    async fn test_connecting_signal_while_pending() {
        let mgr = Arc::new(TunnelManager::new(Arc::new(ScriptedHost::default())));
        let mut rx = mgr.subscribe_connecting();
        assert!(!rx.borrow().is_connecting());

        let first = mgr.connecting.begin();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().latest(), Some(first.attempt));
        let second = mgr.connecting.begin();
        assert!(second.attempt > first.attempt);
        let first_id = first.attempt;
        drop(first);
        assert!(mgr.is_connecting());
        assert!(!rx.borrow().is_active(first_id));
        drop(second);
        rx.changed().await.unwrap();
        assert!(!rx.borrow().is_connecting());
    }

    #[tokio::test]
    async fn test_retry_gets_new_attempt_id() {
        let mgr = TunnelManager::new(Arc::new(ScriptedHost::default()));
        let rx = mgr.subscribe_connecting();

        // Fail and retry with no yield in between: the failed attempt must
        // still read as ended.
        let failed = mgr.connecting.begin();
        let failed_id = failed.attempt;
        drop(failed);
        let retry = mgr.connecting.begin();

        let attempts = rx.borrow().clone();
        assert!(attempts.is_connecting());
        assert!(!attempts.is_active(failed_id));
        assert_eq!(attempts.latest(), Some(retry.attempt));
    }

    #[tokio::test]
    async fn test_connections_listing() {
        let host = Arc::new(ScriptedHost {
            connects: AsyncMutex::new(VecDeque::from([
                Ok(reply("k2", "https://b.example/", "b")),
                Ok(reply("k1", "https://a.example:8443/x", "a")),
            ])),
            ..ScriptedHost::default()
        });
        let mgr = TunnelManager::new(host);
        mgr.connect("ssh b").await.unwrap();
        mgr.connect("ssh a").await.unwrap();
        let list = mgr.connections();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].key, "k1");
        assert_eq!(list[0].url, "https://a.example:8443/x");
        assert_eq!(list[0].origin.as_str(), "https://a.example:8443");
        assert_eq!(list[1].url, "https://b.example/");
        assert_eq!(list[1].destination, "me@h");
    }
}
