//! Read and write handles
//!
//! Handles own their backend resources (file descriptors, HTTP connections,
//! staging files). Dropping a handle releases them on every exit path.

use crate::{ObjectMetadata, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

/// Stream of body chunks
pub type ChunkStream = BoxStream<'static, Result<Bytes>>;

/// An open object: its metadata plus a stream over its body
pub struct ObjectReader {
    metadata: ObjectMetadata,
    chunks: ChunkStream,
}

impl ObjectReader {
    pub fn new(metadata: ObjectMetadata, chunks: ChunkStream) -> Self {
        Self { metadata, chunks }
    }

    /// Reader over a body already held in memory
    pub fn from_bytes(metadata: ObjectMetadata, body: Bytes) -> Self {
        let chunks = if body.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(body) }).boxed()
        };
        Self::new(metadata, chunks)
    }

    /// Metadata recorded when the object was written
    pub fn metadata(&self) -> &ObjectMetadata {
        &self.metadata
    }

    /// Next chunk, or `None` at end of body
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        self.chunks.try_next().await
    }

    /// Drain the remaining body into one buffer
    pub async fn read_to_end(mut self) -> Result<Bytes> {
        let mut body = BytesMut::with_capacity(self.metadata.size_bytes as usize);
        while let Some(chunk) = self.next_chunk().await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    pub fn into_parts(self) -> (ObjectMetadata, ChunkStream) {
        (self.metadata, self.chunks)
    }
}

impl std::fmt::Debug for ObjectReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectReader")
            .field("key", &self.metadata.key)
            .field("size_bytes", &self.metadata.size_bytes)
            .finish_non_exhaustive()
    }
}

/// An in-progress streaming write.
///
/// Chunks are staged out of sight of readers. `commit` publishes the whole
/// body atomically; `abort` (or dropping the session) discards it.
#[async_trait]
pub trait WriteSession: Send {
    /// Append a chunk to the staged body
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;

    /// Bytes staged so far
    fn bytes_written(&self) -> u64;

    /// Publish the staged body and return its metadata
    async fn commit(self: Box<Self>) -> Result<ObjectMetadata>;

    /// Discard the staged body
    async fn abort(self: Box<Self>) -> Result<()>;
}
