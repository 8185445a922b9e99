//! # On-disk Response Cache
//!
//! Content-addressed store of upstream responses, keyed the way npm's own
//! fetch cache keys them (`make-fetch-happen:request-cache:<url>`).
//!
//! ```text
//! <root>/
//!   index/<sha256(key)>.json   entry metadata
//!   content/<sha256(key)>      response body
//!   tmp/                       in-flight writes
//! ```
//!
//! Bodies are written to `tmp/` and renamed into `content/` only after the
//! full body arrived and passed its integrity check, so a reader never sees
//! a partial entry. The index file is written last and is what makes an
//! entry visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::hash_utils::{sha256_hash, Algorithm, Integrity, IntegrityHasher};

/// Prefix of every request cache key.
pub const KEY_PREFIX: &str = "make-fetch-happen:request-cache:";

/// Cache key for a request URL.
pub fn request_key(url: &str) -> String {
    format!("{KEY_PREFIX}{url}")
}

/// Metadata recorded next to each cached body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub key: String,
    pub url: String,
    pub status: u16,
    /// Response headers as received, lowercased names
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub size: u64,
    /// SRI digest of the stored body
    pub integrity: String,
    pub stored_at: DateTime<Utc>,
}

impl EntryMetadata {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Handle on a cache directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    /// Open (and create if needed) a cache rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> AppResult<Self> {
        let store = Self { root: root.into() };
        for dir in [store.index_dir(), store.content_dir(), store.tmp_dir()] {
            fs::create_dir_all(&dir).await?;
        }
        debug!(root = %store.root.display(), "Opened cache store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_dir(&self) -> PathBuf {
        self.root.join("index")
    }

    fn content_dir(&self) -> PathBuf {
        self.root.join("content")
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    fn index_path(&self, key: &str) -> PathBuf {
        self.index_dir().join(format!("{}.json", sha256_hash(key.as_bytes())))
    }

    /// Location of a key's body, whether or not it exists yet.
    pub fn content_path(&self, key: &str) -> PathBuf {
        self.content_dir().join(sha256_hash(key.as_bytes()))
    }

    /// Every complete entry in the cache. Unreadable index files are skipped.
    pub async fn list(&self) -> AppResult<Vec<EntryMetadata>> {
        let mut entries = Vec::new();
        let mut dir = match fs::read_dir(self.index_dir()).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_metadata(&path).await {
                Ok(meta) => entries.push(meta),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable index entry"),
            }
        }

        Ok(entries)
    }

    /// Metadata for `key`, if a complete entry exists.
    pub async fn get(&self, key: &str) -> AppResult<Option<EntryMetadata>> {
        let path = self.index_path(key);
        let meta = match read_metadata(&path).await {
            Ok(meta) => meta,
            Err(AppError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if meta.key != key {
            warn!(key = %key, found = %meta.key, "Index digest collision");
            return Ok(None);
        }
        if !fs::try_exists(self.content_path(key)).await? {
            warn!(key = %key, "Index entry without content");
            return Ok(None);
        }
        Ok(Some(meta))
    }

    /// Full body and metadata for `key`.
    pub async fn read(&self, key: &str) -> AppResult<Option<(EntryMetadata, Vec<u8>)>> {
        let Some(meta) = self.get(key).await? else {
            return Ok(None);
        };
        let body = fs::read(self.content_path(key)).await?;
        Ok(Some((meta, body)))
    }

    /// Stream the body for `key` without buffering it.
    pub async fn open_stream(
        &self,
        key: &str,
    ) -> AppResult<Option<(EntryMetadata, ReaderStream<fs::File>)>> {
        let Some(meta) = self.get(key).await? else {
            return Ok(None);
        };
        let file = fs::File::open(self.content_path(key)).await?;
        Ok(Some((meta, ReaderStream::new(file))))
    }

    /// Start writing a new body for `key`. Nothing becomes visible until
    /// [`CacheWriter::commit`] succeeds.
    pub async fn writer(
        &self,
        key: &str,
        url: &str,
        status: u16,
        headers: BTreeMap<String, String>,
        expected: Option<&str>,
    ) -> AppResult<CacheWriter> {
        let expected = expected.and_then(Integrity::parse);
        let algorithm = expected
            .as_ref()
            .map(|i| i.algorithm)
            .unwrap_or(Algorithm::Sha512);
        let tmp_path = self.tmp_dir().join(Uuid::new_v4().to_string());
        let file = fs::File::create(&tmp_path).await?;

        Ok(CacheWriter {
            store: self.clone(),
            file: Some(file),
            tmp_path,
            hasher: Some(IntegrityHasher::new(algorithm)),
            expected,
            size: 0,
            published: false,
            meta: EntryMetadata {
                key: key.to_string(),
                url: url.to_string(),
                status,
                headers,
                size: 0,
                integrity: String::new(),
                stored_at: Utc::now(),
            },
        })
    }

    /// Store a body held in memory.
    pub async fn insert(
        &self,
        key: &str,
        url: &str,
        status: u16,
        headers: BTreeMap<String, String>,
        body: &[u8],
    ) -> AppResult<EntryMetadata> {
        let mut writer = self.writer(key, url, status, headers, None).await?;
        writer.write(body).await?;
        writer.commit().await
    }

    /// Mark an entry fresh again after a successful revalidation, merging
    /// in any headers the registry sent with its 304.
    pub async fn touch(
        &self,
        key: &str,
        headers: BTreeMap<String, String>,
    ) -> AppResult<Option<EntryMetadata>> {
        let Some(mut meta) = self.get(key).await? else {
            return Ok(None);
        };
        meta.headers.extend(headers);
        meta.stored_at = Utc::now();
        self.write_index(&meta).await?;
        Ok(Some(meta))
    }

    async fn write_index(&self, meta: &EntryMetadata) -> AppResult<()> {
        let tmp_path = self.tmp_dir().join(format!("{}.json", Uuid::new_v4()));
        fs::write(&tmp_path, serde_json::to_vec_pretty(meta)?).await?;
        if let Err(e) = fs::rename(&tmp_path, self.index_path(&meta.key)).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }
}

async fn read_metadata(path: &Path) -> AppResult<EntryMetadata> {
    let content = fs::read(path).await?;
    Ok(serde_json::from_slice(&content)?)
}

/// In-flight cache entry. Dropping it without committing discards the body.
pub struct CacheWriter {
    store: CacheStore,
    file: Option<fs::File>,
    tmp_path: PathBuf,
    hasher: Option<IntegrityHasher>,
    expected: Option<Integrity>,
    size: u64,
    published: bool,
    meta: EntryMetadata,
}

impl CacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> AppResult<()> {
        if let Some(hasher) = self.hasher.as_mut() {
            hasher.update(chunk);
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }
        self.size += chunk.len() as u64;
        Ok(())
    }

    /// Verify the body and publish the entry.
    ///
    /// # Errors
    ///
    /// [`AppError::IntegrityMismatch`] when the body does not match the
    /// expected digest; the temporary file is removed in that case.
    pub async fn commit(mut self) -> AppResult<EntryMetadata> {
        let Some(mut file) = self.file.take() else {
            return Err(AppError::InternalError("Cache writer already closed".into()));
        };
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = self
            .hasher
            .take()
            .map(IntegrityHasher::finish)
            .ok_or_else(|| AppError::InternalError("Cache writer already closed".into()))?;

        if let Some(expected) = &self.expected {
            if expected.digest != actual.digest {
                return Err(AppError::IntegrityMismatch {
                    url: self.meta.url.clone(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        let content_path = self.store.content_path(&self.meta.key);
        fs::rename(&self.tmp_path, &content_path).await?;
        self.published = true;

        let mut meta = self.meta.clone();
        meta.size = self.size;
        meta.integrity = actual.to_string();
        meta.stored_at = Utc::now();
        self.store.write_index(&meta).await?;

        info!(key = %meta.key, size = meta.size, "Cached upstream response");
        Ok(meta)
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let path = std::mem::take(&mut self.tmp_path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = fs::remove_file(&path).await {
                        log_cleanup_failure(&path, &e);
                    }
                });
            }
            Err(_) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    log_cleanup_failure(&path, &e);
                }
            }
        }
    }
}

fn log_cleanup_failure(path: &Path, err: &std::io::Error) {
    if err.kind() != std::io::ErrorKind::NotFound {
        warn!(path = %path.display(), error = %err, "Failed to remove partial cache write");
    }
}
