//! Storage facade
//!
//! [`StorageClient`] is the one entry point applications use. Every call
//! normalizes the key, runs the backend operation under the retry engine and
//! a deadline, and returns either a result or exactly one taxonomy error.

use crate::retry::RetryPolicy;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use stowage_backend::{
    Backend, ChunkStream, ContinuationToken, ListPage, Precondition, WriteSession,
};
use stowage_core::{
    ContentHash, ContentHasher, ObjectMetadata, Result, StorageError, StorageKey, StoreConfig,
    Tags,
};
use tokio::time::{self, Instant};
use tracing::instrument;

/// An object body together with its metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Object {
    pub metadata: ObjectMetadata,
    pub body: Bytes,
}

/// Uniform, retrying access to one backend
#[derive(Clone)]
pub struct StorageClient {
    backend: Arc<dyn Backend>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl std::fmt::Debug for StorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageClient")
            .field("backend", &self.backend.name())
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Parse a listing prefix; empty or `/` means the whole store
fn parse_prefix(raw: &str) -> Result<Option<StorageKey>> {
    if raw.trim_matches('/').is_empty() {
        Ok(None)
    } else {
        StorageKey::normalize(raw).map(Some)
    }
}

/// Errors that escape the retry loop must not look retryable to callers
fn terminal(err: StorageError) -> StorageError {
    match err {
        StorageError::Transient { message, .. } => StorageError::Unavailable(message),
        other => other,
    }
}

fn deadline_exceeded(operation: &str, key: &StorageKey) -> StorageError {
    StorageError::Unavailable(format!("{} {}: deadline exceeded", operation, key))
}

fn verify(metadata: &ObjectMetadata, body: &[u8]) -> Result<()> {
    if body.len() as u64 != metadata.size_bytes || !metadata.content_hash.verify(body) {
        return Err(StorageError::Corrupt(format!(
            "{}: body does not match recorded hash {} ({} bytes, expected {})",
            metadata.key,
            metadata.content_hash,
            body.len(),
            metadata.size_bytes
        )));
    }
    Ok(())
}

impl StorageClient {
    /// Wrap a backend with retry and timeout settings from `config`
    pub fn new(backend: Arc<dyn Backend>, config: &StoreConfig) -> Self {
        Self::with_policy(backend, RetryPolicy::from_config(config), config.operation_timeout())
    }

    pub fn with_policy(backend: Arc<dyn Backend>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            backend,
            retry,
            timeout,
        }
    }

    /// A client sharing this backend whose calls are bounded by `timeout`
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Total time budget per call
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.timeout
    }

    /// Read a whole object, verifying it against its recorded hash
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn get(&self, key: &str) -> Result<Object> {
        let key = StorageKey::normalize(key)?;
        let backend = &self.backend;
        let key = &key;

        self.retry
            .run("get", self.deadline(), || async move {
                let reader = backend.read(key).await?;
                let metadata = reader.metadata().clone();
                let body = reader.read_to_end().await?;
                verify(&metadata, &body)?;
                Ok::<_, StorageError>(Object { metadata, body })
            })
            .await
    }

    /// Open an object for chunked reading; the hash is verified at end of stream
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn get_stream(&self, key: &str) -> Result<ObjectStream> {
        let key = StorageKey::normalize(key)?;
        let deadline = self.deadline();
        let backend = &self.backend;
        let key_ref = &key;

        let reader = self
            .retry
            .run("get_stream", deadline, || async move { backend.read(key_ref).await })
            .await?;
        let (metadata, chunks) = reader.into_parts();
        Ok(ObjectStream {
            hasher: ContentHasher::new(metadata.content_hash.algorithm()),
            metadata,
            chunks,
            received: 0,
            deadline,
            finished: false,
        })
    }

    /// Write an object without tags
    pub async fn put(&self, key: &str, body: impl Into<Bytes>) -> Result<ObjectMetadata> {
        self.write("put", key, body.into(), Tags::new(), Precondition::None)
            .await
    }

    pub async fn put_with_tags(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        tags: Tags,
    ) -> Result<ObjectMetadata> {
        self.write("put", key, body.into(), tags, Precondition::None)
            .await
    }

    /// Replace an object only if its current hash is `expected`.
    ///
    /// If a successful attempt's response is lost and the call is retried,
    /// the retry observes the new hash and reports `Conflict`.
    pub async fn put_if_match(
        &self,
        key: &str,
        body: impl Into<Bytes>,
        expected: &ContentHash,
    ) -> Result<ObjectMetadata> {
        self.write(
            "put_if_match",
            key,
            body.into(),
            Tags::new(),
            Precondition::IfHashMatches(expected.clone()),
        )
        .await
    }

    /// Create an object, failing with `AlreadyExists` if the key is taken
    pub async fn put_if_absent(&self, key: &str, body: impl Into<Bytes>) -> Result<ObjectMetadata> {
        self.write("put_if_absent", key, body.into(), Tags::new(), Precondition::IfAbsent)
            .await
    }

    #[instrument(skip(self, body, tags), fields(backend = self.backend.name(), size = body.len()))]
    async fn write(
        &self,
        operation: &str,
        key: &str,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata> {
        let key = StorageKey::normalize(key)?;
        let backend = &self.backend;
        let (key, body, tags, precondition) = (&key, &body, &tags, &precondition);

        self.retry
            .run(operation, self.deadline(), || async move {
                backend
                    .write_full(key, body.clone(), tags.clone(), precondition.clone())
                    .await
            })
            .await
    }

    /// Start a streaming write; the object appears only when the writer commits
    #[instrument(skip(self, tags), fields(backend = self.backend.name()))]
    pub async fn writer(&self, key: &str, tags: Tags) -> Result<ObjectWriter> {
        let key = StorageKey::normalize(key)?;
        let deadline = self.deadline();
        let backend = &self.backend;
        let (key_ref, tags) = (&key, &tags);

        let session = self
            .retry
            .run("writer", deadline, || async move {
                backend.write_stream(key_ref, tags.clone()).await
            })
            .await?;
        Ok(ObjectWriter {
            session,
            key,
            deadline,
        })
    }

    /// Remove an object; an absent key is success
    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn delete(&self, key: &str) -> Result<()> {
        let key = StorageKey::normalize(key)?;
        let backend = &self.backend;
        let key = &key;

        let result = self
            .retry
            .run("delete", self.deadline(), || async move { backend.delete(key).await })
            .await;
        match result {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.stat_metadata(key).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = self.backend.name()))]
    pub async fn stat_metadata(&self, key: &str) -> Result<ObjectMetadata> {
        let key = StorageKey::normalize(key)?;
        let backend = &self.backend;
        let key = &key;

        self.retry
            .run("stat", self.deadline(), || async move { backend.stat(key).await })
            .await
    }

    /// Fetch one page of a listing
    pub async fn list_page(
        &self,
        prefix: &str,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage> {
        let prefix = parse_prefix(prefix)?;
        self.fetch_page(prefix.as_ref(), token).await
    }

    async fn fetch_page(
        &self,
        prefix: Option<&StorageKey>,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage> {
        let backend = &self.backend;
        self.retry
            .run("list", self.deadline(), || async move {
                backend.list(prefix, token).await
            })
            .await
    }

    /// Lazily list objects under `prefix` in key order.
    ///
    /// Pages are fetched on demand; each page fetch gets its own deadline.
    pub fn list(&self, prefix: &str) -> Result<BoxStream<'static, Result<ObjectMetadata>>> {
        let state = ListState {
            client: self.clone(),
            prefix: parse_prefix(prefix)?,
            token: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        Ok(stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(meta) = state.buffered.pop_front() {
                    return Ok::<_, StorageError>(Some((meta, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }
                let page = state
                    .client
                    .fetch_page(state.prefix.as_ref(), state.token.as_ref())
                    .await?;
                if page.next.is_some() && page.next == state.token {
                    return Err(StorageError::Corrupt(
                        "listing returned the same continuation token twice".to_string(),
                    ));
                }
                state.exhausted = page.next.is_none();
                state.token = page.next;
                state.buffered.extend(page.objects);
            }
        })
        .boxed())
    }

    /// Collect a whole listing
    pub async fn list_all(&self, prefix: &str) -> Result<Vec<ObjectMetadata>> {
        self.list(prefix)?.try_collect().await
    }
}

struct ListState {
    client: StorageClient,
    prefix: Option<StorageKey>,
    token: Option<ContinuationToken>,
    buffered: VecDeque<ObjectMetadata>,
    exhausted: bool,
}

/// Chunked reader over one object.
///
/// Each chunk must arrive before the call's deadline. The body is hashed as it
/// streams; the final chunk is followed by a check against the recorded hash.
pub struct ObjectStream {
    metadata: ObjectMetadata,
    chunks: ChunkStream,
    hasher: ContentHasher,
    received: u64,
    deadline: Instant,
    finished: bool,
}

impl ObjectStream {
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    /// Next chunk, or `None` once the whole body has arrived and verified
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }
        let next = time::timeout_at(self.deadline, self.chunks.try_next())
            .await
            .map_err(|_| deadline_exceeded("read", &self.metadata.key))?
            .map_err(terminal)?;

        match next {
            Some(chunk) => {
                self.hasher.update(&chunk);
                self.received += chunk.len() as u64;
                Ok(Some(chunk))
            }
            None => {
                self.finished = true;
                let hasher = std::mem::replace(
                    &mut self.hasher,
                    ContentHasher::new(self.metadata.content_hash.algorithm()),
                );
                let digest = hasher.finalize();
                if digest != self.metadata.content_hash
                    || self.received != self.metadata.size_bytes
                {
                    return Err(StorageError::Corrupt(format!(
                        "{}: streamed body hashed to {}, expected {}",
                        self.metadata.key, digest, self.metadata.content_hash
                    )));
                }
                Ok(None)
            }
        }
    }

    /// Drain the rest of the body
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(self.metadata.size_bytes as usize);
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

/// Streaming writer for one object.
///
/// Dropping the writer without calling [`commit`](Self::commit) discards
/// everything written.
pub struct ObjectWriter {
    session: Box<dyn WriteSession>,
    key: StorageKey,
    deadline: Instant,
}

impl ObjectWriter {
    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn bytes_written(&self) -> u64 {
        self.session.bytes_written()
    }

    /// Append a chunk; fails `Unavailable` once the deadline has passed
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk = chunk.into();
        time::timeout_at(self.deadline, self.session.write_chunk(chunk))
            .await
            .map_err(|_| deadline_exceeded("write", &self.key))?
            .map_err(terminal)
    }

    /// Publish the object. Runs to completion regardless of the deadline.
    pub async fn commit(self) -> Result<ObjectMetadata> {
        let key = self.key;
        let metadata = self.session.commit().await.map_err(terminal)?;
        tracing::debug!(%key, size = metadata.size_bytes, "stream committed");
        Ok(metadata)
    }

    pub async fn abort(self) -> Result<()> {
        self.session.abort().await.map_err(terminal)
    }
}
