//! Key/value release store.
//!
//! Each revision is one key, `release.v1.{namespace}.{name}.v{revision}`,
//! holding the encoded record. Names and namespaces may not contain '.',
//! so every key splits back into exactly one release and revision. The
//! backend only needs an atomic insert-if-absent to provide the store's
//! conflict semantics.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::codec::{decode, encode, DEFAULT_RECORD_LIMIT};
use super::{check_next_revision, check_update, latest_per_release, ReleaseStore};
use crate::error::{StoreError, StoreResult};
use crate::release::Release;

const KEY_PREFIX: &str = "release.v1.";

/// Minimal key/value interface used by [`KvStore`].
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Insert a value if the key is absent. Returns false if it exists.
    async fn insert(&self, key: &str, value: String) -> StoreResult<bool>;

    /// Replace an existing value. Returns false if the key is absent.
    async fn replace(&self, key: &str, value: String) -> StoreResult<bool>;

    async fn remove(&self, key: &str) -> StoreResult<Option<String>>;

    /// All keys starting with `prefix`, in ascending order.
    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

/// Release store over a [`KvBackend`].
pub struct KvStore<B> {
    backend: B,
    limit: usize,
}

impl<B: KvBackend> KvStore<B> {
    pub fn new(backend: B) -> Self {
        Self::with_limit(backend, DEFAULT_RECORD_LIMIT)
    }

    /// Use a custom encoded record size limit.
    pub fn with_limit(backend: B, limit: usize) -> Self {
        Self { backend, limit }
    }

    fn release_prefix(name: &str, namespace: &str) -> String {
        format!("{KEY_PREFIX}{namespace}.{name}.v")
    }

    fn record_key(name: &str, namespace: &str, revision: u32) -> String {
        format!("{}{revision}", Self::release_prefix(name, namespace))
    }

    /// Revisions stored for a release, ascending.
    async fn revisions(&self, name: &str, namespace: &str) -> StoreResult<Vec<u32>> {
        let prefix = Self::release_prefix(name, namespace);
        let mut revisions: Vec<u32> = self
            .backend
            .keys(&prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix)?.parse().ok())
            .collect();
        revisions.sort_unstable();
        Ok(revisions)
    }

    async fn load(&self, key: &str) -> StoreResult<Option<Release>> {
        match self.backend.get(key).await? {
            Some(data) => decode(&data).map(Some),
            None => Ok(None),
        }
    }
}

/// Check a whole key before it becomes a file name.
fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty() || key.contains(['/', '\\']) || key.starts_with('.') {
        return Err(StoreError::Invalid(format!(
            "'{key}' cannot be used as a record key"
        )));
    }
    Ok(())
}

/// Check a name or namespace before it is joined into a key. '.' is the
/// key separator.
fn validate_segment(value: &str) -> StoreResult<()> {
    validate_key(value)?;
    if value.contains('.') {
        return Err(StoreError::Invalid(format!(
            "'{value}' cannot contain '.' in a record key"
        )));
    }
    Ok(())
}

fn not_found(name: &str, namespace: &str, revision: u32) -> StoreError {
    StoreError::NotFound {
        name: name.to_string(),
        namespace: namespace.to_string(),
        revision,
    }
}

#[async_trait]
impl<B: KvBackend> ReleaseStore for KvStore<B> {
    async fn create(&self, release: &Release) -> StoreResult<()> {
        validate_segment(&release.name)?;
        validate_segment(&release.namespace)?;

        let latest = self
            .revisions(&release.name, &release.namespace)
            .await?
            .last()
            .copied();
        check_next_revision(release, latest)?;

        let key = Self::record_key(&release.name, &release.namespace, release.revision);
        let data = encode(release, self.limit)?;
        if !self.backend.insert(&key, data).await? {
            return Err(StoreError::Conflict {
                name: release.name.clone(),
                namespace: release.namespace.clone(),
                revision: release.revision,
                latest: Some(release.revision),
            });
        }

        debug!(release = %release.label(), key = %key, "Created release record");
        Ok(())
    }

    async fn update(&self, release: &Release) -> StoreResult<()> {
        let key = Self::record_key(&release.name, &release.namespace, release.revision);
        let existing = self
            .load(&key)
            .await?
            .ok_or_else(|| not_found(&release.name, &release.namespace, release.revision))?;
        check_update(&existing, release)?;

        let data = encode(release, self.limit)?;
        if !self.backend.replace(&key, data).await? {
            return Err(not_found(&release.name, &release.namespace, release.revision));
        }

        debug!(release = %release.label(), status = %release.status(), "Updated release record");
        Ok(())
    }

    async fn get(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        self.load(&Self::record_key(name, namespace, revision))
            .await?
            .ok_or_else(|| not_found(name, namespace, revision))
    }

    async fn history(&self, name: &str, namespace: &str) -> StoreResult<Vec<Release>> {
        let mut history = Vec::new();
        for revision in self.revisions(name, namespace).await? {
            // A concurrent delete between listing and loading is not an error.
            if let Some(release) = self.load(&Self::record_key(name, namespace, revision)).await? {
                history.push(release);
            }
        }
        Ok(history)
    }

    async fn delete(&self, name: &str, namespace: &str, revision: u32) -> StoreResult<Release> {
        let key = Self::record_key(name, namespace, revision);
        let data = self
            .backend
            .remove(&key)
            .await?
            .ok_or_else(|| not_found(name, namespace, revision))?;

        debug!(key = %key, "Deleted release record");
        decode(&data)
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Release>> {
        let prefix = match namespace {
            Some(ns) => format!("{KEY_PREFIX}{ns}."),
            None => KEY_PREFIX.to_string(),
        };

        let mut all = Vec::new();
        for key in self.backend.keys(&prefix).await? {
            if let Some(release) = self.load(&key).await? {
                if namespace.is_none_or(|ns| ns == release.namespace) {
                    all.push(release);
                }
            }
        }
        Ok(latest_per_release(all))
    }
}

/// Process-local key/value backend.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn insert(&self, key: &str, value: String) -> StoreResult<bool> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value);
        Ok(true)
    }

    async fn replace(&self, key: &str, value: String) -> StoreResult<bool> {
        match self.entries.write().await.get_mut(key) {
            Some(slot) => {
                *slot = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.write().await.remove(key))
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Key/value backend with one file per key in a directory.
///
/// Values are written to a private scratch file first and only then
/// linked or renamed into place, so readers see a whole record or none.
/// Inserts hard-link the scratch file, which fails if the key exists, so
/// two processes sharing the directory cannot both create the same
/// revision.
pub struct DirectoryKv {
    root: PathBuf,
}

impl DirectoryKv {
    /// Use `root` as the store directory, creating it if needed.
    pub async fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Write `value` to a scratch file unique to this writer. Scratch names
    /// start with '.', which [`KvBackend::keys`] skips.
    async fn write_scratch(&self, key: &str, value: &str) -> StoreResult<PathBuf> {
        let seq = SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed);
        let scratch = self
            .root
            .join(format!(".{key}.{}.{seq}.tmp", std::process::id()));

        let written = async {
            let mut file = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&scratch)
                .await?;
            file.write_all(value.as_bytes()).await?;
            file.sync_all().await
        }
        .await;
        if let Err(e) = written {
            discard(&scratch).await;
            return Err(e.into());
        }
        Ok(scratch)
    }
}

async fn discard(scratch: &Path) {
    match tokio::fs::remove_file(scratch).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %scratch.display(), error = %e, "Failed to remove scratch file"),
    }
}

#[async_trait]
impl KvBackend for DirectoryKv {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        match tokio::fs::read_to_string(self.path(key)?).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, key: &str, value: String) -> StoreResult<bool> {
        let path = self.path(key)?;
        let scratch = self.write_scratch(key, &value).await?;
        let linked = tokio::fs::hard_link(&scratch, &path).await;
        discard(&scratch).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, key: &str, value: String) -> StoreResult<bool> {
        let path = self.path(key)?;
        if !tokio::fs::try_exists(&path).await? {
            return Ok(false);
        }

        let scratch = self.write_scratch(key, &value).await?;
        if let Err(e) = tokio::fs::rename(&scratch, &path).await {
            discard(&scratch).await;
            return Err(e.into());
        }
        Ok(true)
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<String>> {
        let Some(data) = self.get(key).await? else {
            return Ok(None);
        };
        match tokio::fs::remove_file(self.path(key)?).await {
            Ok(()) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.starts_with('.') {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}
