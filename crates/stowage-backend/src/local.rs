//! Local filesystem backend
//!
//! # Storage Layout
//!
//! ```text
//! root/
//! ├── store.json                  ← manifest (format version, hash algorithm)
//! ├── objects/{segments...}       ← raw bodies
//! ├── meta/{h[..2]}/{h}.json      ← MetadataEnvelope, h = blake3(key)
//! └── staging/{uuid}.tmp          ← in-flight writes
//! ```
//!
//! Bodies and descriptors are written to `staging/`, synced, then renamed into
//! place while holding the key's write lock, so readers never observe a
//! partially written object. Descriptors are named by key digest so no key
//! can shadow another key's descriptor.

use crate::{
    Backend, ContinuationToken, HashAlgorithm, ListPage, ObjectMetadata, ObjectReader,
    Precondition, Result, StorageError, StorageKey, Tags, WriteSession, DEFAULT_CHUNK_SIZE,
    DEFAULT_PAGE_SIZE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage_core::{ContentHasher, MetadataEnvelope, StoreConfig};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::instrument;

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const STAGING_DIR: &str = "staging";
const MANIFEST_FILE: &str = "store.json";
const MANIFEST_VERSION: u32 = 2;
const LOCK_STRIPES: usize = 64;
/// Longest file name most filesystems accept, in bytes
pub const MAX_SEGMENT_LEN: usize = 255;

/// Translate an I/O failure into the shared taxonomy
pub fn map_io_error(err: std::io::Error, context: impl Display) -> StorageError {
    match err.kind() {
        IoErrorKind::NotFound => StorageError::NotFound(context.to_string()),
        IoErrorKind::PermissionDenied | IoErrorKind::ReadOnlyFilesystem => {
            StorageError::PermissionDenied(format!("{}: {}", context, err))
        }
        IoErrorKind::AlreadyExists => StorageError::AlreadyExists(format!("{}: {}", context, err)),
        IoErrorKind::NotADirectory | IoErrorKind::IsADirectory | IoErrorKind::DirectoryNotEmpty => {
            StorageError::Conflict(format!(
                "{}: key collides with an existing virtual directory ({})",
                context, err
            ))
        }
        IoErrorKind::Interrupted
        | IoErrorKind::WouldBlock
        | IoErrorKind::TimedOut
        | IoErrorKind::ResourceBusy => StorageError::transient(format!("{}: {}", context, err)),
        IoErrorKind::InvalidData | IoErrorKind::UnexpectedEof => {
            StorageError::Corrupt(format!("{}: {}", context, err))
        }
        IoErrorKind::InvalidInput => StorageError::InvalidKey(format!("{}: {}", context, err)),
        _ => StorageError::Unavailable(format!("{}: {}", context, err)),
    }
}

/// Directory creation reports a file in the way as `AlreadyExists`; for a key
/// that means a file/directory collision, not an existing object.
fn map_layout_error(err: std::io::Error, key: &StorageKey) -> StorageError {
    match err.kind() {
        IoErrorKind::AlreadyExists | IoErrorKind::NotADirectory => StorageError::Conflict(format!(
            "{}: a parent segment is already an object",
            key
        )),
        _ => map_io_error(err, key),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreManifest {
    version: u32,
    hash_algorithm: HashAlgorithm,
    created_at: DateTime<Utc>,
}

/// Temporary file removed on drop unless it was renamed into place
struct StagedFile {
    path: PathBuf,
    armed: bool,
}

impl StagedFile {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

struct LocalInner {
    root: PathBuf,
    algorithm: HashAlgorithm,
    locks: Vec<RwLock<()>>,
}

/// An object store rooted at a local directory
#[derive(Clone)]
pub struct LocalDiskBackend {
    inner: Arc<LocalInner>,
    page_size: usize,
}

impl LocalDiskBackend {
    /// Open (creating if needed) the store at `config.root_path`
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        Self::open_at(&config.root_path, config.hash_algorithm).await
    }

    /// Open (creating if needed) the store at `root`.
    ///
    /// Fails with `Conflict` if the store was created with a different hash algorithm.
    #[instrument(skip(root), fields(root = %root.as_ref().display()))]
    pub async fn open_at(root: impl AsRef<Path>, algorithm: HashAlgorithm) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for dir in [OBJECTS_DIR, META_DIR, STAGING_DIR] {
            let path = root.join(dir);
            fs::create_dir_all(&path)
                .await
                .map_err(|e| map_io_error(e, path.display()))?;
        }
        check_manifest(&root, algorithm).await?;

        tracing::debug!(%algorithm, "opened local store");
        Ok(Self {
            inner: Arc::new(LocalInner {
                root,
                algorithm,
                locks: (0..LOCK_STRIPES).map(|_| RwLock::new(())).collect(),
            }),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// Set listing page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Location of an object's body on disk
    pub fn object_path(&self, key: &StorageKey) -> PathBuf {
        key.segments()
            .iter()
            .fold(self.inner.root.join(OBJECTS_DIR), |path, segment| path.join(segment))
    }

    fn meta_path(&self, key: &StorageKey) -> PathBuf {
        let digest = HashAlgorithm::Blake3
            .digest(key.to_string().as_bytes())
            .to_hex();
        self.inner
            .root
            .join(META_DIR)
            .join(&digest[..2])
            .join(format!("{}.json", digest))
    }

    fn lock_for(&self, key: &StorageKey) -> &RwLock<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.inner.locks[(hasher.finish() as usize) % LOCK_STRIPES]
    }

    async fn load_metadata(&self, key: &StorageKey) -> Result<ObjectMetadata> {
        if !fits_on_disk(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let bytes = fs::read(self.meta_path(key))
            .await
            .map_err(|e| map_io_error(e, key))?;
        let envelope = MetadataEnvelope::from_json_slice(&bytes)?;
        if envelope.metadata.key != *key {
            return Err(StorageError::Corrupt(format!(
                "descriptor for {} names {}",
                key, envelope.metadata.key
            )));
        }
        Ok(envelope.metadata)
    }

    async fn current_metadata(&self, key: &StorageKey) -> Result<Option<ObjectMetadata>> {
        match self.load_metadata(key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_staged(&self) -> Result<(StagedFile, fs::File)> {
        let staged = StagedFile {
            path: self
                .inner
                .root
                .join(STAGING_DIR)
                .join(format!("{}.tmp", uuid::Uuid::new_v4())),
            armed: true,
        };
        let file = fs::File::create(&staged.path)
            .await
            .map_err(|e| map_io_error(e, staged.path.display()))?;
        Ok((staged, file))
    }

    async fn stage(&self, data: &[u8]) -> Result<StagedFile> {
        let (staged, mut file) = self.create_staged().await?;
        let context = staged.path.display().to_string();
        file.write_all(data)
            .await
            .map_err(|e| map_io_error(e, &context))?;
        file.sync_all().await.map_err(|e| map_io_error(e, &context))?;
        Ok(staged)
    }

    /// Move staged body and descriptor into place. Caller holds the key's write lock.
    ///
    /// Both parent directories are prepared first, and a body path occupied
    /// by a directory is rejected, so a layout conflict leaves nothing behind.
    async fn install(
        &self,
        key: &StorageKey,
        body: &mut StagedFile,
        descriptor: &mut StagedFile,
    ) -> Result<()> {
        let body_path = self.object_path(key);
        let meta_path = self.meta_path(key);
        for path in [&body_path, &meta_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| map_layout_error(e, key))?;
            }
        }
        match fs::metadata(&body_path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(StorageError::Conflict(format!(
                    "{}: key collides with an existing virtual directory",
                    key
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(map_layout_error(e, key)),
        }
        rename_into(body, &body_path, key).await?;
        rename_into(descriptor, &meta_path, key).await
    }

    async fn prune_empty_dirs(&self, key: &StorageKey) {
        let stop = self.inner.root.join(OBJECTS_DIR);
        let mut dir = self.object_path(key).parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == stop || fs::remove_dir(&current).await.is_err() {
                break;
            }
            dir = current.parent().map(Path::to_path_buf);
        }
    }

    async fn collect_keys(&self, prefix: Option<&StorageKey>) -> Result<Vec<StorageKey>> {
        let mut keys = Vec::new();
        let (start, segments) = match prefix {
            Some(prefix) if !fits_on_disk(prefix) => return Ok(keys),
            Some(prefix) => (self.object_path(prefix), prefix.segments().to_vec()),
            None => (self.inner.root.join(OBJECTS_DIR), Vec::new()),
        };

        match fs::metadata(&start).await {
            Ok(meta) if meta.is_file() => {
                keys.extend(prefix.cloned());
                return Ok(keys);
            }
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(map_io_error(e, start.display())),
        }

        let mut pending = vec![(start, segments)];
        while let Some((dir, segments)) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(map_io_error(e, dir.display())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| map_io_error(e, dir.display()))?
            {
                let Ok(name) = entry.file_name().into_string() else {
                    tracing::warn!(path = %entry.path().display(), "skipping non UTF-8 entry");
                    continue;
                };
                let mut child = segments.clone();
                child.push(name);

                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| map_io_error(e, entry.path().display()))?;
                if file_type.is_dir() {
                    pending.push((entry.path(), child));
                } else if file_type.is_file() {
                    match StorageKey::normalize(&child.join("/")) {
                        Ok(key) => keys.push(key),
                        Err(e) => tracing::warn!(error = %e, "skipping unrepresentable entry"),
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn fits_on_disk(key: &StorageKey) -> bool {
    key.segments().iter().all(|s| s.len() <= MAX_SEGMENT_LEN)
}

fn check_writable(key: &StorageKey) -> Result<()> {
    match key.segments().iter().find(|s| s.len() > MAX_SEGMENT_LEN) {
        Some(segment) => Err(StorageError::InvalidKey(format!(
            "{}: segment of {} bytes exceeds the local limit of {}",
            key,
            segment.len(),
            MAX_SEGMENT_LEN
        ))),
        None => Ok(()),
    }
}

async fn rename_into(staged: &mut StagedFile, target: &Path, key: &StorageKey) -> Result<()> {
    // A concurrent delete may prune the parent between mkdir and rename; retry once.
    for attempt in 0..2 {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| map_layout_error(e, key))?;
        }
        match fs::rename(&staged.path, target).await {
            Ok(()) => {
                staged.disarm();
                return Ok(());
            }
            Err(e) if e.kind() == IoErrorKind::NotFound && attempt == 0 => continue,
            Err(e) => return Err(map_layout_error(e, key)),
        }
    }
    Err(StorageError::transient(format!(
        "{}: parent directory vanished during write",
        key
    )))
}

async fn check_manifest(root: &Path, algorithm: HashAlgorithm) -> Result<()> {
    let path = root.join(MANIFEST_FILE);
    match fs::read(&path).await {
        Ok(bytes) => {
            let manifest: StoreManifest = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Corrupt(format!("{}: {}", path.display(), e)))?;
            if manifest.version != MANIFEST_VERSION {
                return Err(StorageError::Conflict(format!(
                    "store at {} uses layout version {}, expected {}",
                    root.display(),
                    manifest.version,
                    MANIFEST_VERSION
                )));
            }
            if manifest.hash_algorithm != algorithm {
                return Err(StorageError::Conflict(format!(
                    "store at {} hashes with {}, configured for {}",
                    root.display(),
                    manifest.hash_algorithm,
                    algorithm
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == IoErrorKind::NotFound => {
            let manifest = StoreManifest {
                version: MANIFEST_VERSION,
                hash_algorithm: algorithm,
                created_at: Utc::now(),
            };
            let bytes = serde_json::to_vec_pretty(&manifest)
                .map_err(|e| StorageError::Corrupt(e.to_string()))?;
            let temp = root.join(STAGING_DIR).join("store.json.tmp");
            fs::write(&temp, &bytes)
                .await
                .map_err(|e| map_io_error(e, temp.display()))?;
            fs::rename(&temp, &path)
                .await
                .map_err(|e| map_io_error(e, path.display()))
        }
        Err(e) => Err(map_io_error(e, path.display())),
    }
}

fn file_chunks(file: fs::File, key: StorageKey) -> crate::ChunkStream {
    stream::try_unfold((file, key), |(mut file, key)| async move {
        let mut buf = BytesMut::with_capacity(DEFAULT_CHUNK_SIZE);
        let n = file
            .read_buf(&mut buf)
            .await
            .map_err(|e| map_io_error(e, &key))?;
        if n == 0 {
            return Ok(None);
        }
        Ok::<_, StorageError>(Some((buf.freeze(), (file, key))))
    })
    .boxed()
}

#[async_trait]
impl Backend for LocalDiskBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.inner.algorithm
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn read(&self, key: &StorageKey) -> Result<ObjectReader> {
        let _guard = self.lock_for(key).read().await;
        let metadata = self.load_metadata(key).await?;
        let file = fs::File::open(self.object_path(key))
            .await
            .map_err(|e| map_io_error(e, key))?;
        // The open descriptor keeps reading the same inode after the lock is released.
        Ok(ObjectReader::new(metadata, file_chunks(file, key.clone())))
    }

    #[instrument(skip(self, key, body, tags), fields(key = %key, size = body.len()))]
    async fn write_full(
        &self,
        key: &StorageKey,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata> {
        check_writable(key)?;
        let metadata = ObjectMetadata::for_body(key.clone(), &body, self.inner.algorithm, tags);
        let mut staged_body = self.stage(&body).await?;
        let mut staged_meta = self
            .stage(&MetadataEnvelope::new(metadata.clone()).to_json_vec()?)
            .await?;

        let _guard = self.lock_for(key).write().await;
        if precondition.needs_current() {
            let current = self.current_metadata(key).await?;
            precondition.check(key, current.as_ref())?;
        }
        self.install(key, &mut staged_body, &mut staged_meta).await?;

        tracing::debug!(hash = %metadata.content_hash, "object written");
        Ok(metadata)
    }

    #[instrument(skip(self, key, tags), fields(key = %key))]
    async fn write_stream(&self, key: &StorageKey, tags: Tags) -> Result<Box<dyn WriteSession>> {
        check_writable(key)?;
        let (staged, file) = self.create_staged().await?;
        Ok(Box::new(LocalWriteSession {
            backend: self.clone(),
            key: key.clone(),
            tags,
            file,
            staged,
            hasher: ContentHasher::new(self.inner.algorithm),
            written: 0,
        }))
    }

    async fn stat(&self, key: &StorageKey) -> Result<ObjectMetadata> {
        let _guard = self.lock_for(key).read().await;
        self.load_metadata(key).await
    }

    #[instrument(skip(self, token))]
    async fn list(
        &self,
        prefix: Option<&StorageKey>,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage> {
        let after = token
            .map(|t| {
                StorageKey::normalize(t.as_str()).map_err(|_| {
                    StorageError::InvalidKey(format!(
                        "malformed continuation token {:?}",
                        t.as_str()
                    ))
                })
            })
            .transpose()?;

        let mut keys = self.collect_keys(prefix).await?;
        if let Some(after) = &after {
            keys.retain(|key| key > after);
        }
        let has_more = keys.len() > self.page_size;
        keys.truncate(self.page_size);
        let next = if has_more {
            keys.last().map(|key| ContinuationToken(key.to_string()))
        } else {
            None
        };

        let mut objects = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.stat(key).await {
                Ok(meta) => objects.push(meta),
                // Deleted since the walk, or a body whose descriptor never landed
                Err(StorageError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        tracing::debug!(count = objects.len(), more = next.is_some(), "listed objects");
        Ok(ListPage { objects, next })
    }

    #[instrument(skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &StorageKey) -> Result<()> {
        if !fits_on_disk(key) {
            return Err(StorageError::NotFound(key.to_string()));
        }
        let _guard = self.lock_for(key).write().await;
        fs::remove_file(self.object_path(key))
            .await
            .map_err(|e| map_io_error(e, key))?;
        match fs::remove_file(self.meta_path(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(map_io_error(e, key)),
        }
        self.prune_empty_dirs(key).await;
        Ok(())
    }
}

struct LocalWriteSession {
    backend: LocalDiskBackend,
    key: StorageKey,
    tags: Tags,
    file: fs::File,
    staged: StagedFile,
    hasher: ContentHasher,
    written: u64,
}

#[async_trait]
impl WriteSession for LocalWriteSession {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.file
            .write_all(&chunk)
            .await
            .map_err(|e| map_io_error(e, &self.key))?;
        self.hasher.update(&chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.written
    }

    async fn commit(self: Box<Self>) -> Result<ObjectMetadata> {
        let mut session = *self;
        session
            .file
            .flush()
            .await
            .map_err(|e| map_io_error(e, &session.key))?;
        session
            .file
            .sync_all()
            .await
            .map_err(|e| map_io_error(e, &session.key))?;

        let metadata = ObjectMetadata::from_parts(
            session.key.clone(),
            session.written,
            session.hasher.finalize(),
            session.tags,
        );
        let mut staged_meta = session
            .backend
            .stage(&MetadataEnvelope::new(metadata.clone()).to_json_vec()?)
            .await?;

        let _guard = session.backend.lock_for(&session.key).write().await;
        session
            .backend
            .install(&session.key, &mut session.staged, &mut staged_meta)
            .await?;

        tracing::debug!(key = %session.key, size = session.written, "streamed object committed");
        Ok(metadata)
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        let mut session = *self;
        drop(session.file);
        match fs::remove_file(&session.staged.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {}
            Err(e) => return Err(map_io_error(e, &session.key)),
        }
        session.staged.disarm();
        Ok(())
    }
}
