//! Directory-backed store.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/sha256-…          blob content
//! <root>/sha256-….meta     metadata, a JSON object of strings
//! <root>/.tmp-…            uploads in flight
//! ```
//!
//! Uploads land in a temp file and are renamed into place, so a blob name
//! only ever refers to complete content.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use futures::{
    stream::{self, BoxStream},
    StreamExt,
};
use tokio::{
    fs::{self, File, ReadDir},
    io::AsyncWriteExt,
};

use super::{BlobSink, BlobStore, BlobStream, Metadata, ObjectAttrs};
use crate::error::{Error, Result, ResultExt};

const META_SUFFIX: &str = ".meta";
const TMP_PREFIX: &str = ".tmp-";

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .context(|| format!("creating store root {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> Result<PathBuf> {
        if !is_object_name(id) {
            return Err(Error::Store(format!("invalid object name {id:?}")));
        }
        Ok(self.root.join(id))
    }

    fn meta_path(&self, id: &str) -> Result<PathBuf> {
        self.object_path(id)?;
        Ok(self.root.join(format!("{id}{META_SUFFIX}")))
    }

    fn temp_path(&self, id: &str) -> PathBuf {
        let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(format!("{TMP_PREFIX}{id}.{}.{n}", std::process::id()))
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata> {
        match fs::read_to_string(self.meta_path(id)?).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| Error::Metadata {
                id: id.to_string(),
                reason: format!("decoding metadata file: {e}"),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn next_object(&self, mut dir: ReadDir) -> Result<Option<(ObjectAttrs, Option<ReadDir>)>> {
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_object_name(name) {
                continue;
            }
            let attrs = match self.attrs(name).await {
                Ok(attrs) => attrs,
                Err(e @ Error::Metadata { .. }) => {
                    // Listed without metadata so scans skip it instead of failing.
                    warn!("{e}");
                    let size = fs::metadata(self.object_path(name)?).await?.len();
                    ObjectAttrs {
                        name: name.to_string(),
                        size,
                        metadata: Metadata::new(),
                    }
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            return Ok(Some((attrs, Some(dir))));
        }
        Ok(None)
    }
}

/// Names that may refer to a blob: no separators, no dot-files, no metadata
/// suffix.
fn is_object_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with(META_SUFFIX)
        && !name.contains(['/', '\\', '\0'])
}

fn not_found(id: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(id.to_string())
    } else {
        Error::Io(e)
    }
}

/// An upload in flight. The temp file is removed when the sink is dropped
/// without a successful `finish`.
struct LocalSink {
    file: File,
    temp: PathBuf,
    dest: PathBuf,
    meta: PathBuf,
    committed: bool,
}

impl Drop for LocalSink {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.temp) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {e}", self.temp.display());
            }
        }
    }
}

#[async_trait]
impl BlobSink for LocalSink {
    async fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.file.write_all(buf).await?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        fs::rename(&self.temp, &self.dest).await?;
        self.committed = true;
        match fs::remove_file(&self.meta).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn attrs(&self, id: &str) -> Result<ObjectAttrs> {
        let meta = fs::metadata(self.object_path(id)?)
            .await
            .map_err(|e| not_found(id, e))?;
        Ok(ObjectAttrs {
            name: id.to_string(),
            size: meta.len(),
            metadata: self.read_metadata(id).await?,
        })
    }

    async fn create(&self, id: &str) -> Result<Box<dyn BlobSink>> {
        let dest = self.object_path(id)?;
        let meta = self.meta_path(id)?;
        let temp = self.temp_path(id);
        let file = File::create(&temp).await?;
        Ok(Box::new(LocalSink {
            file,
            temp,
            dest,
            meta,
            committed: false,
        }))
    }

    async fn update_metadata(&self, id: &str, metadata: Metadata) -> Result<()> {
        fs::metadata(self.object_path(id)?)
            .await
            .map_err(|e| not_found(id, e))?;
        let json = serde_json::to_vec(&metadata)?;
        let temp = self.temp_path(id);
        fs::write(&temp, &json).await?;
        if let Err(e) = fs::rename(&temp, self.meta_path(id)?).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn open(&self, id: &str) -> Result<Box<dyn BlobStream>> {
        let file = File::open(self.object_path(id)?)
            .await
            .map_err(|e| not_found(id, e))?;
        Ok(Box::new(file))
    }

    fn list_all(&self) -> BoxStream<'_, Result<ObjectAttrs>> {
        stream::try_unfold(None, move |dir: Option<ReadDir>| async move {
            let dir = match dir {
                Some(dir) => dir,
                None => fs::read_dir(&self.root).await?,
            };
            self.next_object(dir).await
        })
        .boxed()
    }
}
