//! Storage backends.
//!
//! [`FileBackend`] keeps one JSON object per namespace at
//! `<data_dir>/<namespace>.json`. The whole object is rewritten on every
//! change using a temp-file-then-rename, so a crash mid-write leaves either the
//! old or the new file, never a torn one. [`MemoryBackend`] is the in-process
//! substitute used when a durable store cannot be opened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::StoreError;

/// Key/value operations of one namespace.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn clear(&self) -> Result<(), StoreError>;
    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;
    async fn len(&self) -> Result<usize, StoreError>;
}

/// Opens the durable backend for a namespace.
#[async_trait]
pub trait Opener: Send + Sync {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Backend>, StoreError>;
}

/// Map-backed store living only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.map.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.map().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.map().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.map().clear();
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.map().keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.map().len())
    }
}

/// Monotonic counter for unique temp file names.
static WRITE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON file per namespace.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    map: tokio::sync::Mutex<BTreeMap<String, String>>,
}

impl FileBackend {
    /// Open (or create on first write) `<dir>/<namespace>.json`.
    pub async fn open(dir: &Path, namespace: &str) -> Result<Self, StoreError> {
        validate_namespace(namespace)?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{namespace}.json"));
        let map = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            map: tokio::sync::Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(map)?;
        let parent = self.path.parent().unwrap_or(Path::new("."));
        let seq = WRITE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_path = parent.join(format!(".deskbridge_tmp_{}_{seq}", std::process::id()));

        if let Err(e) = tokio::fs::write(&temp_path, &bytes).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&temp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Apply `change` to the map and write it out. The in-memory map is only
    /// updated when the write succeeds.
    async fn update(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, String>) -> bool + Send,
    ) -> Result<(), StoreError> {
        let mut map = self.map.lock().await;
        let mut next = map.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next).await?;
        *map = next;
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.map.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.update(|m| m.insert(key.to_string(), value.to_string()).as_deref() != Some(value))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.update(|m| m.remove(key).is_some()).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.update(|m| {
            let changed = !m.is_empty();
            m.clear();
            changed
        })
        .await
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.map.lock().await.keys().cloned().collect())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.map.lock().await.len())
    }
}

/// Opens [`FileBackend`]s under one data directory.
#[derive(Debug, Clone)]
pub struct FileOpener {
    dir: PathBuf,
}

impl FileOpener {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Opener for FileOpener {
    async fn open(&self, namespace: &str) -> Result<Arc<dyn Backend>, StoreError> {
        Ok(Arc::new(FileBackend::open(&self.dir, namespace).await?))
    }
}

/// Namespaces become file names; keep them to a single path component.
fn validate_namespace(namespace: &str) -> Result<(), StoreError> {
    if namespace.is_empty()
        || namespace.contains(['/', '\\'])
        || namespace.contains("..")
        || namespace.starts_with('.')
    {
        return Err(StoreError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}
