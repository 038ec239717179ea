//! The object store capability.
//!
//! Blobs are keyed by content id and carry a small string-to-string metadata
//! map. The engine only needs a handful of operations from the store, so the
//! network client behind a real bucket is hidden behind [`BlobStore`]; this
//! crate ships an in-memory store for tests and a directory-backed store for
//! single-host use.

pub mod local;
pub mod memory;
pub mod metadata;

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::error::Result;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use metadata::{PathMap, PATHS_KEY};

/// Object metadata as stored: string keys to string values.
pub type Metadata = HashMap<String, String>;

/// What the store knows about one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectAttrs {
    pub name: String,
    pub size: u64,
    pub metadata: Metadata,
}

/// Seekable byte stream over a stored blob.
pub trait BlobStream: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> BlobStream for T {}

/// Write side of a blob upload. Nothing is visible in the store until
/// [`finish`](BlobSink::finish) returns `Ok`.
#[async_trait]
pub trait BlobSink: Send {
    async fn write(&mut self, buf: &[u8]) -> Result<()>;

    async fn finish(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Size and metadata of an object; `Error::NotFound` if it is absent.
    async fn attrs(&self, id: &str) -> Result<ObjectAttrs>;

    /// Like [`attrs`](BlobStore::attrs) but absence is `Ok(None)`.
    async fn exists(&self, id: &str) -> Result<Option<ObjectAttrs>> {
        match self.attrs(id).await {
            Ok(attrs) => Ok(Some(attrs)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Start writing the blob named `id`. Replacing an existing blob resets
    /// its metadata.
    async fn create(&self, id: &str) -> Result<Box<dyn BlobSink>>;

    /// Replace the metadata of an existing object.
    async fn update_metadata(&self, id: &str, metadata: Metadata) -> Result<()>;

    /// Open a blob for sequential or random-access reading.
    async fn open(&self, id: &str) -> Result<Box<dyn BlobStream>>;

    /// Every object in the store, in no particular order.
    fn list_all(&self) -> BoxStream<'_, Result<ObjectAttrs>>;

    /// Store a complete blob and then its metadata.
    async fn write(&self, id: &str, data: &[u8], metadata: Metadata) -> Result<()> {
        let mut sink = self.create(id).await?;
        sink.write(data).await?;
        sink.finish().await?;
        self.update_metadata(id, metadata).await
    }
}
