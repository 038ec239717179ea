//! In-process store, used by tests and for dry runs.

use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{stream::BoxStream, StreamExt};

use super::{metadata, BlobSink, BlobStore, BlobStream, Metadata, ObjectAttrs, PathMap};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    metadata: Metadata,
}

#[derive(Debug, Default)]
struct Inner {
    objects: DashMap<String, StoredObject>,
    blob_writes: AtomicU64,
    metadata_writes: AtomicU64,
    pending_faults: AtomicUsize,
}

/// A [`BlobStore`] held entirely in memory.
///
/// Counts committed blob and metadata writes, and can be told to fail the
/// next few writes with a transient error to exercise retry paths.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without touching the write counters.
    pub fn insert(&self, id: impl Into<String>, data: impl Into<Bytes>, metadata: Metadata) {
        self.inner.objects.insert(
            id.into(),
            StoredObject {
                data: data.into(),
                metadata,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<(Bytes, Metadata)> {
        self.inner
            .objects
            .get(id)
            .map(|o| (o.data.clone(), o.metadata.clone()))
    }

    /// Decoded `paths` of an object, if it exists and they decode.
    pub fn paths(&self, id: &str) -> Option<PathMap> {
        let (_, meta) = self.get(id)?;
        metadata::decode_paths(id, &meta).ok()
    }

    pub fn len(&self) -> usize {
        self.inner.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.objects.is_empty()
    }

    pub fn blob_writes(&self) -> u64 {
        self.inner.blob_writes.load(Ordering::SeqCst)
    }

    pub fn metadata_writes(&self) -> u64 {
        self.inner.metadata_writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` blob commits or metadata updates fail transiently.
    pub fn fail_next(&self, n: usize) {
        self.inner.pending_faults.store(n, Ordering::SeqCst);
    }

    fn take_fault(&self) -> bool {
        self.inner
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

struct MemorySink {
    store: MemoryStore,
    id: String,
    buf: Vec<u8>,
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        if self.store.take_fault() {
            return Err(Error::Transient(format!("injected failure writing {}", self.id)));
        }
        let MemorySink { store, id, buf } = *self;
        store.inner.objects.insert(
            id,
            StoredObject {
                data: Bytes::from(buf),
                metadata: Metadata::new(),
            },
        );
        store.inner.blob_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn attrs(&self, id: &str) -> Result<ObjectAttrs> {
        let object = self
            .inner
            .objects
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(ObjectAttrs {
            name: id.to_string(),
            size: object.data.len() as u64,
            metadata: object.metadata.clone(),
        })
    }

    async fn create(&self, id: &str) -> Result<Box<dyn BlobSink>> {
        Ok(Box::new(MemorySink {
            store: self.clone(),
            id: id.to_string(),
            buf: Vec::new(),
        }))
    }

    async fn update_metadata(&self, id: &str, metadata: Metadata) -> Result<()> {
        if self.take_fault() {
            return Err(Error::Transient(format!(
                "injected failure updating {id}"
            )));
        }
        let mut object = self
            .inner
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        object.metadata = metadata;
        self.inner.metadata_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn open(&self, id: &str) -> Result<Box<dyn BlobStream>> {
        let data = self
            .inner
            .objects
            .get(id)
            .map(|o| o.data.clone())
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn list_all(&self) -> BoxStream<'_, Result<ObjectAttrs>> {
        let mut objects: Vec<ObjectAttrs> = self
            .inner
            .objects
            .iter()
            .map(|entry| ObjectAttrs {
                name: entry.key().clone(),
                size: entry.data.len() as u64,
                metadata: entry.metadata.clone(),
            })
            .collect();
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        futures::stream::iter(objects.into_iter().map(Ok)).boxed()
    }
}
