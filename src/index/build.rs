//! Building a [`PathIndex`] from the store or from a listing.
//!
//! Both sources boil down to a stream of (path, content id, timestamp, size)
//! records fed through [`IndexBuilder`]. They differ in how bad input is
//! treated: a live store may hold objects with missing or broken metadata,
//! which are reported and skipped, whereas a listing is expected to be
//! internally consistent and any malformed record aborts the build.

use std::{io::Read, sync::Arc, time::Instant};

use futures::TryStreamExt;

use super::{listing::ListingReader, InodeAllocator, NodeKind, PathIndex};
use crate::{
    content::ContentId,
    error::{Error, Result, ResultExt},
    store::{metadata, BlobStore},
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Ignore path records newer than this Unix time.
    pub as_of: Option<i64>,
}

/// Accumulates records into an index.
///
/// When a path is recorded more than once (its content changed over time),
/// the record with the newest timestamp wins.
#[derive(Debug)]
pub struct IndexBuilder {
    index: PathIndex,
    options: BuildOptions,
    strict: bool,
}

impl IndexBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self::with_allocator(Arc::new(InodeAllocator::new()), options)
    }

    pub fn with_allocator(inodes: Arc<InodeAllocator>, options: BuildOptions) -> Self {
        Self {
            index: PathIndex::with_allocator(inodes),
            options,
            strict: false,
        }
    }

    /// Reject a file record that lands on a directory instead of ignoring it.
    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }

    /// Add one record. Returns whether it is now the visible entry for its
    /// path.
    pub fn add(
        &mut self,
        path: &str,
        content_id: ContentId,
        timestamp: i64,
        size: u64,
    ) -> Result<bool> {
        if self.options.as_of.is_some_and(|as_of| timestamp > as_of) {
            return Ok(false);
        }
        if let Ok(existing) = self.index.resolve(path) {
            match self.index.node(existing).kind() {
                NodeKind::File(entry) if entry.modified_at > timestamp => return Ok(false),
                NodeKind::File(_) => {}
                NodeKind::Directory(_) if self.strict => {
                    return Err(Error::Listing(format!(
                        "file record for {content_id} conflicts with directory {path}"
                    )));
                }
                NodeKind::Directory(_) => {
                    warn!("{path} is a directory in this view, ignoring file record for {content_id}");
                    return Ok(false);
                }
            }
        }
        self.index.insert(path, content_id, timestamp, size)?;
        Ok(true)
    }

    pub fn finish(self) -> PathIndex {
        self.index
    }
}

impl PathIndex {
    /// Scan every object in the store.
    pub async fn from_store(store: &dyn BlobStore, options: BuildOptions) -> Result<Self> {
        Self::from_store_with(store, Arc::new(InodeAllocator::new()), options).await
    }

    pub async fn from_store_with(
        store: &dyn BlobStore,
        inodes: Arc<InodeAllocator>,
        options: BuildOptions,
    ) -> Result<Self> {
        let start = Instant::now();
        let mut builder = IndexBuilder::with_allocator(inodes, options);
        let mut objects = store.list_all();
        let mut scanned = 0usize;
        let mut warnings = 0usize;

        while let Some(attrs) = objects
            .try_next()
            .await
            .context(|| "iterating through store objects")?
        {
            scanned += 1;
            if !metadata::has_paths(&attrs.metadata) {
                warn!("no paths defined for object {}", attrs.name);
                warnings += 1;
                continue;
            }
            let paths = match metadata::decode_paths(&attrs.name, &attrs.metadata) {
                Ok(paths) => paths,
                Err(e) => {
                    warn!("{e}");
                    warnings += 1;
                    continue;
                }
            };
            for (path, timestamp) in paths {
                let id = ContentId::new(attrs.name.clone());
                if let Err(e) = builder.add(&path, id, timestamp, attrs.size) {
                    warn!("object {}: skipping path {path}: {e}", attrs.name);
                    warnings += 1;
                }
            }
        }

        let index = builder.finish();
        tracing::info!(
            "index: built from store objects={} files={} warnings={} elapsed={:.2}s",
            scanned,
            index.file_count(),
            warnings,
            start.elapsed().as_secs_f64()
        );
        Ok(index)
    }

    /// Replay a listing produced by `dedupfs list`.
    pub fn from_listing<R: Read>(reader: R, options: BuildOptions) -> Result<Self> {
        Self::from_listing_with(reader, Arc::new(InodeAllocator::new()), options)
    }

    pub fn from_listing_with<R: Read>(
        reader: R,
        inodes: Arc<InodeAllocator>,
        options: BuildOptions,
    ) -> Result<Self> {
        let start = Instant::now();
        let mut builder = IndexBuilder::with_allocator(inodes, options).strict();
        for record in ListingReader::new(reader) {
            let record = record.context(|| "JSON-decoding prescan input")?;
            builder
                .add(
                    &record.path,
                    ContentId::new(record.hash),
                    record.timestamp.0,
                    record.size,
                )
                .map_err(|e| match e {
                    Error::NotADirectory(p) => {
                        Error::Listing(format!("{} conflicts with file {p}", record.path))
                    }
                    other => other,
                })
                .context(|| "building prescan tree")?;
        }
        let index = builder.finish();
        tracing::info!(
            "index: built from listing files={} elapsed={:.2}s",
            index.file_count(),
            start.elapsed().as_secs_f64()
        );
        Ok(index)
    }
}
