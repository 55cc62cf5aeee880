//! Debounced durable storage.
//!
//! Small client state (settings, last-opened project, window layout) is
//! written through a per-namespace [`Namespace`] handle. Writes never wait on
//! disk:
//!
//! - `set`/`delete` record into a **pending buffer** and arm a debounce timer.
//!   Repeated writes to a key before the timer fires collapse into the last
//!   one; a delete is recorded as a tombstone.
//! - `get` reads the pending buffer first, so callers always see their own
//!   writes even before anything reached the backend.
//! - `flush` is **single-flight**: concurrent callers share one in-progress
//!   flush. The flush drains the buffer repeatedly until it is empty, so writes
//!   that land mid-flush are applied by the same flush.
//!
//! Persistence is best-effort. If the durable backend cannot be opened, a
//! [`MemoryBackend`] takes its place for the rest of the run (and is reused on
//! every later open of that namespace). Failed entry writes are logged and
//! reported in [`FlushReport`]; the pending state already reflects them for
//! reads that happen before the flush.

pub mod backend;

use std::collections::HashMap;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use backend::{Backend, FileBackend, FileOpener, MemoryBackend, Opener};

/// Namespace used when the caller doesn't name one.
pub const DEFAULT_NAMESPACE: &str = "default.dat";

/// Default quiet period before pending writes are flushed.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// A write waiting to be flushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingWrite {
    Value(String),
    /// Pending delete.
    Tombstone,
}

impl PendingWrite {
    fn value(&self) -> Option<String> {
        match self {
            Self::Value(v) => Some(v.clone()),
            Self::Tombstone => None,
        }
    }
}

/// Outcome of a flush. Failures are reported, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries written to (or deleted from) the backend.
    pub applied: usize,
    /// `(key, error)` for entries the backend rejected.
    pub failed: Vec<(String, String)>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Application lifecycle signals that force a flush of every namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The window was hidden or the app moved to the background.
    Hidden,
    /// The app is about to exit.
    Terminating,
}

type SharedFlush = Shared<BoxFuture<'static, FlushReport>>;

/// Scheduler state of one namespace. Mutated only by `schedule` and the
/// flush drain loop.
#[derive(Default)]
struct Scheduler {
    pending: HashMap<String, PendingWrite>,
    /// Batch currently being written by the flush loop.
    applying: HashMap<String, PendingWrite>,
    timer: Option<JoinHandle<()>>,
    in_flight: Option<SharedFlush>,
}

/// Opens backends, substituting a cached memory store on failure.
struct Resolver {
    opener: Arc<dyn Opener>,
    fallbacks: Mutex<HashMap<String, Arc<MemoryBackend>>>,
}

impl Resolver {
    async fn open(&self, namespace: &str) -> Arc<dyn Backend> {
        if let Some(fallback) = self.fallback(namespace) {
            return fallback;
        }
        match self.opener.open(namespace).await {
            Ok(backend) => backend,
            Err(e) => {
                warn!(namespace, "Durable store unavailable, using memory: {e}");
                let mut fallbacks = self.fallbacks.lock().unwrap_or_else(PoisonError::into_inner);
                let fallback = Arc::clone(fallbacks.entry(namespace.to_string()).or_default());
                fallback as Arc<dyn Backend>
            }
        }
    }

    fn fallback(&self, namespace: &str) -> Option<Arc<dyn Backend>> {
        self.fallbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(namespace)
            .map(|m| Arc::clone(m) as Arc<dyn Backend>)
    }
}

struct Inner {
    name: String,
    debounce: Duration,
    resolver: Arc<Resolver>,
    backend: OnceCell<Arc<dyn Backend>>,
    sched: Mutex<Scheduler>,
}

impl Inner {
    fn sched(&self) -> MutexGuard<'_, Scheduler> {
        self.sched.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn backend(&self) -> &Arc<dyn Backend> {
        self.backend
            .get_or_init(|| self.resolver.open(&self.name))
            .await
    }

    /// Arm the debounce timer unless it is already armed.
    fn schedule(self: &Arc<Self>, sched: &mut Scheduler) {
        if sched.timer.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        sched.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.sched().timer = None;
            let report = Inner::flush(&inner).await;
            if !report.is_clean() {
                warn!(namespace = %inner.name, failed = report.failed.len(), "Debounced flush had failures");
            }
        }));
    }

    fn flush(self: &Arc<Self>) -> SharedFlush {
        let mut sched = self.sched();
        if let Some(in_flight) = &sched.in_flight {
            return in_flight.clone();
        }
        let inner = Arc::clone(self);
        let flush = async move { inner.drain().await }.boxed().shared();
        sched.in_flight = Some(flush.clone());
        flush
    }

    /// Apply pending batches until the buffer is empty at the top of the loop.
    async fn drain(&self) -> FlushReport {
        let mut report = FlushReport::default();
        loop {
            let batch = {
                let mut sched = self.sched();
                if sched.pending.is_empty() {
                    sched.applying.clear();
                    sched.in_flight = None;
                    break;
                }
                let batch = mem::take(&mut sched.pending);
                sched.applying.clone_from(&batch);
                batch
            };

            let backend = self.backend().await;
            for (key, write) in batch {
                let result = match &write {
                    PendingWrite::Value(v) => backend.set(&key, v).await,
                    PendingWrite::Tombstone => backend.delete(&key).await,
                };
                match result {
                    Ok(()) => report.applied += 1,
                    Err(e) => {
                        warn!(namespace = %self.name, key = %key, "Failed to persist entry: {e}");
                        report.failed.push((key, e.to_string()));
                    }
                }
            }
        }
        debug!(namespace = %self.name, applied = report.applied, "Flush complete");
        report
    }
}

/// Handle to one storage namespace. Cheap to clone.
#[derive(Clone)]
pub struct Namespace {
    inner: Arc<Inner>,
}

impl Namespace {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Read `key`, preferring unflushed writes over the backend.
    pub async fn get(&self, key: &str) -> Option<String> {
        {
            let sched = self.inner.sched();
            if let Some(write) = sched.pending.get(key).or_else(|| sched.applying.get(key)) {
                return write.value();
            }
        }
        self.inner
            .backend()
            .await
            .get(key)
            .await
            .inspect_err(|e| warn!(namespace = %self.inner.name, key, "Read failed: {e}"))
            .ok()
            .flatten()
    }

    /// Record `value` for `key`; persisted after the debounce window.
    ///
    /// Must be called from within a tokio runtime (the timer is a task).
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.record(key.into(), PendingWrite::Value(value.into()));
    }

    /// Record a delete of `key`; persisted after the debounce window.
    pub fn delete(&self, key: impl Into<String>) {
        self.record(key.into(), PendingWrite::Tombstone);
    }

    fn record(&self, key: String, write: PendingWrite) {
        let mut sched = self.inner.sched();
        sched.pending.insert(key, write);
        self.inner.schedule(&mut sched);
    }

    /// Write all pending entries now. Concurrent callers share one flush.
    pub fn flush(&self) -> impl Future<Output = FlushReport> + Send + 'static {
        self.inner.flush()
    }

    /// Flush, then remove every key from the backend.
    pub async fn clear(&self) {
        self.flush().await;
        if let Err(e) = self.inner.backend().await.clear().await {
            warn!(namespace = %self.inner.name, "Clear failed: {e}");
        }
    }

    /// Flush, then list keys in the backend.
    pub async fn keys(&self) -> Vec<String> {
        self.flush().await;
        self.inner
            .backend()
            .await
            .keys()
            .await
            .inspect_err(|e| warn!(namespace = %self.inner.name, "Listing keys failed: {e}"))
            .unwrap_or_default()
    }

    /// Flush, then count entries in the backend.
    pub async fn len(&self) -> usize {
        self.flush().await;
        self.inner
            .backend()
            .await
            .len()
            .await
            .inspect_err(|e| warn!(namespace = %self.inner.name, "Counting entries failed: {e}"))
            .unwrap_or_default()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of writes waiting for a flush.
    pub fn pending_len(&self) -> usize {
        self.inner.sched().pending.len()
    }
}

/// Registry of namespaces sharing one backend opener.
#[derive(Clone)]
pub struct Storage {
    resolver: Arc<Resolver>,
    debounce: Duration,
    namespaces: Arc<Mutex<HashMap<String, Namespace>>>,
}

impl Storage {
    pub fn new(opener: Arc<dyn Opener>, debounce: Duration) -> Self {
        Self {
            resolver: Arc::new(Resolver {
                opener,
                fallbacks: Mutex::new(HashMap::new()),
            }),
            debounce,
            namespaces: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Storage backed by JSON files under `dir`.
    pub fn with_files(dir: impl Into<std::path::PathBuf>, debounce: Duration) -> Self {
        Self::new(Arc::new(FileOpener::new(dir)), debounce)
    }

    /// Handle for `name`; the same handle is returned for the same name.
    pub fn namespace(&self, name: &str) -> Namespace {
        self.namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert_with(|| Namespace {
                inner: Arc::new(Inner {
                    name: name.to_string(),
                    debounce: self.debounce,
                    resolver: Arc::clone(&self.resolver),
                    backend: OnceCell::new(),
                    sched: Mutex::new(Scheduler::default()),
                }),
            })
            .clone()
    }

    pub fn default_namespace(&self) -> Namespace {
        self.namespace(DEFAULT_NAMESPACE)
    }

    /// Open the backend for `name` directly, honoring the fallback table.
    pub async fn open_backend(&self, name: &str) -> Arc<dyn Backend> {
        self.resolver.open(name).await
    }

    /// Flush every namespace opened so far.
    pub async fn flush_all(&self) -> Vec<(String, FlushReport)> {
        let namespaces: Vec<Namespace> = self
            .namespaces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let names: Vec<String> = namespaces.iter().map(|n| n.name().to_string()).collect();
        let reports = join_all(namespaces.iter().map(Namespace::flush)).await;
        names.into_iter().zip(reports).collect()
    }

    /// React to a lifecycle signal by flushing everything in the background.
    ///
    /// The flush is not awaited: the process may exit before it completes.
    pub fn on_lifecycle(&self, event: LifecycleEvent) -> JoinHandle<()> {
        debug!(?event, "Lifecycle flush");
        let storage = self.clone();
        tokio::spawn(async move {
            for (name, report) in storage.flush_all().await {
                if !report.is_clean() {
                    warn!(namespace = %name, ?event, failed = report.failed.len(), "Lifecycle flush had failures");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::StoreError;

    /// Memory backend that records every write, optionally slowly.
    #[derive(Default)]
    struct RecordingBackend {
        inner: MemoryBackend,
        log: Mutex<Vec<String>>,
        delay: Duration,
        fail_key: Option<String>,
    }

    impl RecordingBackend {
        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Backend for RecordingBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail_key.as_deref() == Some(key) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.log.lock().unwrap().push(format!("set {key}={value}"));
            self.inner.set(key, value).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.log.lock().unwrap().push(format!("delete {key}"));
            self.inner.delete(key).await
        }
        async fn clear(&self) -> Result<(), StoreError> {
            self.inner.clear().await
        }
        async fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.inner.keys().await
        }
        async fn len(&self) -> Result<usize, StoreError> {
            self.inner.len().await
        }
    }

    struct FixedOpener(Arc<RecordingBackend>);

    #[async_trait]
    impl Opener for FixedOpener {
        async fn open(&self, _namespace: &str) -> Result<Arc<dyn Backend>, StoreError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FailingOpener {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Opener for FailingOpener {
        async fn open(&self, _namespace: &str) -> Result<Arc<dyn Backend>, StoreError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Unavailable("locked".into()))
        }
    }

    fn recording(backend: RecordingBackend) -> (Storage, Arc<RecordingBackend>) {
        let backend = Arc::new(backend);
        let storage = Storage::new(Arc::new(FixedOpener(backend.clone())), DEFAULT_DEBOUNCE);
        (storage, backend)
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_coalesce_to_last_value() {
        let (storage, backend) = recording(RecordingBackend::default());
        let ns = storage.default_namespace();
        ns.set("a", "1");
        ns.set("a", "2");
        ns.set("b", "x");
        ns.delete("b");
        ns.delete("c");
        ns.set("c", "3");
        assert!(backend.log().is_empty());

        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        let mut log = backend.log();
        log.sort();
        assert_eq!(log, vec!["delete b", "set a=2", "set c=3"]);
        assert_eq!(ns.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_your_writes_before_flush() {
        let (storage, backend) = recording(RecordingBackend::default());
        let ns = storage.namespace("settings");
        backend.inner.set("gone", "old").await.unwrap();

        ns.set("theme", "dark");
        ns.delete("gone");
        assert_eq!(ns.get("theme").await.as_deref(), Some("dark"));
        assert!(ns.get("gone").await.is_none());
        assert!(backend.log().is_empty());
        assert!(ns.get("missing").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_flush_is_single_flight() {
        let (storage, backend) = recording(RecordingBackend {
            delay: Duration::from_millis(10),
            ..RecordingBackend::default()
        });
        let ns = storage.default_namespace();
        ns.set("a", "1");
        ns.set("b", "2");

        let (first, second) = tokio::join!(ns.flush(), ns.flush());
        assert_eq!(first, second);
        assert_eq!(first.applied, 2);
        assert_eq!(backend.log().len(), 2);

        // The debounce timer fires later on an empty buffer and writes nothing.
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(backend.log().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_during_flush_are_drained_by_same_flush() {
        let (storage, backend) = recording(RecordingBackend {
            delay: Duration::from_millis(10),
            ..RecordingBackend::default()
        });
        let ns = storage.default_namespace();
        ns.set("a", "1");

        let flush = tokio::spawn(ns.flush());
        tokio::time::sleep(Duration::from_millis(5)).await;
        // Mid-flush: "a" is being applied, reads still see it.
        assert_eq!(ns.get("a").await.as_deref(), Some("1"));
        ns.set("b", "2");

        let report = flush.await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(backend.log(), vec!["set a=1", "set b=2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_failure_is_reported_not_raised() {
        let (storage, backend) = recording(RecordingBackend {
            fail_key: Some("bad".into()),
            ..RecordingBackend::default()
        });
        let ns = storage.default_namespace();
        ns.set("bad", "1");
        ns.set("good", "2");
        let report = ns.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "bad");
        assert_eq!(backend.log(), vec!["set good=2"]);
    }

    #[tokio::test]
    async fn test_open_failure_falls_back_once() {
        let opener = Arc::new(FailingOpener::default());
        let storage = Storage::new(opener.clone(), DEFAULT_DEBOUNCE);

        let first = storage.open_backend("prefs").await;
        let second = storage.open_backend("prefs").await;
        assert_eq!(opener.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(
            Arc::as_ptr(&first).cast::<()>(),
            Arc::as_ptr(&second).cast::<()>()
        );

        // Namespace operations still work against the fallback.
        let ns = storage.namespace("prefs");
        ns.set("k", "v");
        assert!(ns.flush().await.is_clean());
        assert_eq!(ns.get("k").await.as_deref(), Some("v"));
        assert_eq!(ns.keys().await, vec!["k"]);
        assert_eq!(first.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(opener.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_namespace_handles_are_shared() {
        let storage = Storage::new(Arc::new(FailingOpener::default()), DEFAULT_DEBOUNCE);
        let a = storage.namespace("x");
        a.set("k", "v");
        let b = storage.namespace("x");
        assert_eq!(b.get("k").await.as_deref(), Some("v"));
        assert_eq!(storage.default_namespace().name(), DEFAULT_NAMESPACE);
    }

    #[tokio::test]
    async fn test_clear_and_len_flush_first() {
        let storage = Storage::new(Arc::new(FailingOpener::default()), DEFAULT_DEBOUNCE);
        let ns = storage.default_namespace();
        ns.set("a", "1");
        ns.set("b", "2");
        assert_eq!(ns.len().await, 2);
        ns.clear().await;
        assert!(ns.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lifecycle_flushes_all_namespaces() {
        let (storage, backend) = recording(RecordingBackend::default());
        storage.namespace("one").set("a", "1");
        storage.namespace("two").set("b", "2");
        storage.on_lifecycle(LifecycleEvent::Hidden).await.unwrap();
        let mut log = backend.log();
        log.sort();
        assert_eq!(log, vec!["set a=1", "set b=2"]);
    }

    #[tokio::test]
    async fn test_file_storage_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::with_files(dir.path(), Duration::from_millis(1));
        let ns = storage.namespace("window.dat");
        ns.set("width", "1280");
        ns.flush().await;

        let reopened = Storage::with_files(dir.path(), Duration::from_millis(1));
        assert_eq!(
            reopened.namespace("window.dat").get("width").await.as_deref(),
            Some("1280")
        );
    }
}
