//! In-memory backend for testing
//!
//! Objects live in an arena of slots indexed by key. The whole store sits
//! behind one mutex, so every call is trivially atomic. Faults can be injected
//! per operation to exercise retry and error paths deterministically.

use crate::{
    Backend, ContinuationToken, ErrorKind, HashAlgorithm, ListPage, ObjectMetadata, ObjectReader,
    Precondition, Result, StorageError, StorageKey, Tags, WriteSession, DEFAULT_PAGE_SIZE,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use stowage_core::ContentHasher;

/// Backend operations that faults can target
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Read,
    Write,
    Stat,
    List,
    Delete,
}

struct Slot {
    body: Bytes,
    metadata: ObjectMetadata,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    index: BTreeMap<StorageKey, usize>,
}

impl Arena {
    fn get(&self, key: &StorageKey) -> Option<&Slot> {
        self.index
            .get(key)
            .and_then(|&i| self.slots.get(i))
            .and_then(Option::as_ref)
    }

    fn get_mut(&mut self, key: &StorageKey) -> Option<&mut Slot> {
        let i = *self.index.get(key)?;
        self.slots.get_mut(i).and_then(Option::as_mut)
    }

    fn upsert(&mut self, key: StorageKey, slot: Slot) {
        if let Some(&i) = self.index.get(&key) {
            self.slots[i] = Some(slot);
            return;
        }
        let i = match self.free.pop() {
            Some(i) => {
                self.slots[i] = Some(slot);
                i
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, i);
    }

    fn remove(&mut self, key: &StorageKey) -> Option<Slot> {
        let i = self.index.remove(key)?;
        self.free.push(i);
        self.slots[i].take()
    }
}

#[derive(Default)]
struct Faults {
    pending: HashMap<Operation, (ErrorKind, u32)>,
    calls: HashMap<Operation, u64>,
}

struct MemoryInner {
    algorithm: HashAlgorithm,
    arena: Mutex<Arena>,
    faults: Mutex<Faults>,
}

/// An in-memory object store
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
    page_size: usize,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Create a new empty store hashing with BLAKE3
    pub fn new() -> Self {
        Self::with_algorithm(HashAlgorithm::default())
    }

    /// Create a new empty store with the given digest
    pub fn with_algorithm(algorithm: HashAlgorithm) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                algorithm,
                arena: Mutex::new(Arena::default()),
                faults: Mutex::new(Faults::default()),
            }),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Set listing page size; useful for exercising continuation tokens
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Get the number of objects stored
    pub fn len(&self) -> usize {
        self.inner.arena.lock().index.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all objects
    pub fn clear(&self) {
        *self.inner.arena.lock() = Arena::default();
    }

    /// Fail the next `times` calls of `operation` with an error of `kind`.
    ///
    /// `times == 0` cancels any fault pending for `operation`.
    pub fn inject_fault(&self, operation: Operation, kind: ErrorKind, times: u32) {
        let mut faults = self.inner.faults.lock();
        if times == 0 {
            faults.pending.remove(&operation);
        } else {
            faults.pending.insert(operation, (kind, times));
        }
    }

    /// Drop all pending faults
    pub fn clear_faults(&self) {
        self.inner.faults.lock().pending.clear();
    }

    /// How many times `operation` has been invoked, faulted calls included
    pub fn call_count(&self, operation: Operation) -> u64 {
        self.inner
            .faults
            .lock()
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Replace a stored body without touching its metadata.
    ///
    /// Simulates out-of-band corruption. Returns `false` if the key is absent.
    pub fn tamper(&self, key: &StorageKey, body: impl Into<Bytes>) -> bool {
        match self.inner.arena.lock().get_mut(key) {
            Some(slot) => {
                slot.body = body.into();
                true
            }
            None => false,
        }
    }

    fn enter(&self, operation: Operation, key: Option<&StorageKey>) -> Result<()> {
        let mut faults = self.inner.faults.lock();
        *faults.calls.entry(operation).or_default() += 1;

        let Some((kind, remaining)) = faults.pending.get_mut(&operation) else {
            return Ok(());
        };
        let kind = *kind;
        *remaining -= 1;
        if *remaining == 0 {
            faults.pending.remove(&operation);
        }

        let target = key.map(ToString::to_string).unwrap_or_default();
        tracing::debug!(?operation, %kind, key = %target, "injecting simulated fault");
        Err(kind.into_error(format!("simulated {:?} fault on {:?}", operation, target)))
    }

    fn commit_slot(
        &self,
        key: &StorageKey,
        body: Bytes,
        metadata: ObjectMetadata,
        precondition: &Precondition,
    ) -> Result<ObjectMetadata> {
        let mut arena = self.inner.arena.lock();
        precondition.check(key, arena.get(key).map(|slot| &slot.metadata))?;
        arena.upsert(
            key.clone(),
            Slot {
                body,
                metadata: metadata.clone(),
            },
        );
        Ok(metadata)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn hash_algorithm(&self) -> HashAlgorithm {
        self.inner.algorithm
    }

    async fn read(&self, key: &StorageKey) -> Result<ObjectReader> {
        self.enter(Operation::Read, Some(key))?;
        let arena = self.inner.arena.lock();
        let slot = arena
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectReader::from_bytes(
            slot.metadata.clone(),
            slot.body.clone(),
        ))
    }

    async fn write_full(
        &self,
        key: &StorageKey,
        body: Bytes,
        tags: Tags,
        precondition: Precondition,
    ) -> Result<ObjectMetadata> {
        self.enter(Operation::Write, Some(key))?;
        let metadata = ObjectMetadata::for_body(key.clone(), &body, self.inner.algorithm, tags);
        self.commit_slot(key, body, metadata, &precondition)
    }

    async fn write_stream(&self, key: &StorageKey, tags: Tags) -> Result<Box<dyn WriteSession>> {
        self.enter(Operation::Write, Some(key))?;
        Ok(Box::new(MemoryWriteSession {
            backend: self.clone(),
            key: key.clone(),
            tags,
            buffer: BytesMut::new(),
            hasher: ContentHasher::new(self.inner.algorithm),
        }))
    }

    async fn stat(&self, key: &StorageKey) -> Result<ObjectMetadata> {
        self.enter(Operation::Stat, Some(key))?;
        self.inner
            .arena
            .lock()
            .get(key)
            .map(|slot| slot.metadata.clone())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(
        &self,
        prefix: Option<&StorageKey>,
        token: Option<&ContinuationToken>,
    ) -> Result<ListPage> {
        self.enter(Operation::List, prefix)?;
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

        let lower = match (&after, prefix) {
            (Some(after), Some(prefix)) if after < prefix => Bound::Included(prefix.clone()),
            (Some(after), _) => Bound::Excluded(after.clone()),
            (None, Some(prefix)) => Bound::Included(prefix.clone()),
            (None, None) => Bound::Unbounded,
        };

        let page_size = self.page_size;
        let arena = self.inner.arena.lock();
        let mut objects: Vec<ObjectMetadata> = arena
            .index
            .range((lower, Bound::Unbounded))
            .take_while(|(key, _)| prefix.map_or(true, |p| p.is_prefix_of(key)))
            .filter_map(|(_, &i)| arena.slots[i].as_ref().map(|slot| slot.metadata.clone()))
            .take(page_size + 1)
            .collect();

        let next = if objects.len() > page_size {
            objects.truncate(page_size);
            objects
                .last()
                .map(|meta| ContinuationToken(meta.key.to_string()))
        } else {
            None
        };
        Ok(ListPage { objects, next })
    }

    async fn delete(&self, key: &StorageKey) -> Result<()> {
        self.enter(Operation::Delete, Some(key))?;
        self.inner
            .arena
            .lock()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

struct MemoryWriteSession {
    backend: MemoryBackend,
    key: StorageKey,
    tags: Tags,
    buffer: BytesMut,
    hasher: ContentHasher,
}

#[async_trait]
impl WriteSession for MemoryWriteSession {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.hasher.update(&chunk);
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    fn bytes_written(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn commit(self: Box<Self>) -> Result<ObjectMetadata> {
        let session = *self;
        let metadata = ObjectMetadata::from_parts(
            session.key.clone(),
            session.buffer.len() as u64,
            session.hasher.finalize(),
            session.tags,
        );
        session.backend.commit_slot(
            &session.key,
            session.buffer.freeze(),
            metadata,
            &Precondition::None,
        )
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
