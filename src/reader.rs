//! The content read path shared by the mount and the HTTP server.
//!
//! Small blobs are read in one go. Blobs above the `large` threshold are read
//! in `chunk`-sized pieces into a buffer allocated once for the declared
//! size, so the transport never has to buffer more than one chunk on our
//! behalf. Range reads seek the remote stream first.
//!
//! The front ends never hold a whole large blob: the HTTP server streams it
//! through [`BlobReader::stream_range`], one chunk per body frame, and the
//! mount asks for kernel-sized pieces with [`BlobReader::read_range`].
//! [`BlobReader::read`] and [`BlobReader::read_chunked`] return a complete
//! blob for library callers.

use std::{io::SeekFrom, sync::Arc};

use bytes::Bytes;
use futures::stream::{self, Stream};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::{
    error::{Result, ResultExt},
    store::{BlobStore, BlobStream},
    util::config::ReadConfig,
};

#[derive(Clone)]
pub struct BlobReader {
    store: Arc<dyn BlobStore>,
    large_threshold: u64,
    chunk_size: usize,
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobReader")
            .field("large_threshold", &self.large_threshold)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Read into `buf` until it is full or the stream ends, at most `chunk`
/// bytes per call. Returns how much was filled.
async fn fill(stream: &mut dyn BlobStream, buf: &mut [u8], chunk: usize) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let end = buf.len().min(filled + chunk);
        match stream.read(&mut buf[filled..end]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl BlobReader {
    pub fn new(store: Arc<dyn BlobStore>, config: ReadConfig) -> Self {
        Self {
            store,
            large_threshold: config.large_threshold,
            chunk_size: config.chunk_size,
        }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether a blob of `size` bytes takes the chunked path.
    pub fn is_large(&self, size: u64) -> bool {
        size > self.large_threshold
    }

    /// Whole blob, choosing the chunked path when `size` is above the
    /// threshold.
    pub async fn read(&self, id: &str, size: u64) -> Result<Vec<u8>> {
        if self.is_large(size) {
            self.read_chunked(id, size).await
        } else {
            self.read_all(id).await
        }
    }

    /// Whole blob in a single read loop.
    pub async fn read_all(&self, id: &str) -> Result<Vec<u8>> {
        let mut stream = self.store.open(id).await?;
        let mut data = Vec::new();
        stream
            .read_to_end(&mut data)
            .await
            .context(|| format!("reading {id}"))?;
        Ok(data)
    }

    /// Whole blob in bounded reads. `size` is the declared length; a stream
    /// that ends early yields a short result rather than an error.
    pub async fn read_chunked(&self, id: &str, size: u64) -> Result<Vec<u8>> {
        let len = usize::try_from(size)
            .map_err(|_| crate::Error::Store(format!("{id}: size {size} exceeds address space")))?;
        let mut stream = self.store.open(id).await?;
        let mut buf = vec![0u8; len];
        let filled = fill(stream.as_mut(), &mut buf, self.chunk_size)
            .await
            .context(|| format!("reading {id}"))?;
        if filled < len {
            debug!("{id}: stream ended after {filled} of {len} declared bytes");
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Up to `length` bytes starting at `offset`.
    pub async fn read_range(&self, id: &str, offset: u64, length: usize) -> Result<Vec<u8>> {
        let mut stream = self.store.open(id).await?;
        if offset > 0 {
            stream
                .seek(SeekFrom::Start(offset))
                .await
                .context(|| format!("seeking {id} to {offset}"))?;
        }
        let mut buf = vec![0u8; length];
        let filled = fill(stream.as_mut(), &mut buf, self.chunk_size)
            .await
            .context(|| format!("reading {id} at {offset}"))?;
        buf.truncate(filled);
        Ok(buf)
    }

    /// A body stream of `length` bytes from `offset`, one chunk per item.
    /// Used by the HTTP server so large responses never sit in memory.
    pub async fn stream_range(
        &self,
        id: &str,
        offset: u64,
        length: u64,
    ) -> Result<impl Stream<Item = std::io::Result<Bytes>> + Send + 'static> {
        let mut source = self.store.open(id).await?;
        if offset > 0 {
            source
                .seek(SeekFrom::Start(offset))
                .await
                .context(|| format!("seeking {id} to {offset}"))?;
        }
        let chunk = self.chunk_size;
        Ok(stream::try_unfold(
            (source, length),
            move |(mut source, remaining)| async move {
                if remaining == 0 {
                    return Ok::<_, std::io::Error>(None);
                }
                let want = usize::try_from(remaining).map_or(chunk, |r| r.min(chunk));
                let mut buf = vec![0u8; want];
                let n = fill(source.as_mut(), &mut buf, chunk).await?;
                if n == 0 {
                    return Ok(None);
                }
                buf.truncate(n);
                Ok(Some((Bytes::from(buf), (source, remaining - n as u64))))
            },
        ))
    }
}
