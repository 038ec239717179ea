//! # Backup engine
//!
//! Walks local directory trees and makes sure every regular file's content
//! is in the store, with the file's path recorded in that object's `paths`
//! metadata.
//!
//! Per file the engine decides between four outcomes:
//!
//! - the prescan index already knows the file and it looks unchanged: skip
//!   without hashing;
//! - the content is absent from the store: upload the blob, then write its
//!   metadata;
//! - the content is present but not under this path: add the path to the
//!   object's metadata;
//! - the content is present under this path already: nothing to do.
//!
//! Roots are processed one after another and files one at a time. Store
//! writes go through a [`RetryPolicy`]; uploads optionally share a
//! [`TokenBucket`]. Everything that waits on the store honours the engine's
//! cancellation token.

pub mod retry;
pub mod throttle;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use chrono::Utc;
use filetime::FileTime;
use regex::Regex;
use tokio::{io::AsyncReadExt, sync::mpsc};
use tokio_util::sync::CancellationToken;
use walkdir::{DirEntry, WalkDir};

use crate::{
    content::ContentId,
    error::{Error, Result, ResultExt},
    index::PathIndex,
    store::{metadata, BlobStore, ObjectAttrs, PathMap},
    util::{atime::FileTimes, config::BackupConfig},
};

pub use retry::RetryPolicy;
pub use throttle::{ThrottledSink, TokenBucket};

const UPLOAD_BUF_SIZE: usize = 256 * 1024;
const WALK_QUEUE: usize = 256;

/// How far a prescan entry is trusted before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrescanTrust {
    /// A file whose size matches and whose mtime is not newer than the
    /// recorded timestamp is taken to be unchanged. A file edited and put
    /// back within the same second keeps its old content id.
    #[default]
    SizeAndMtime,
    /// Always hash. The prescan can still save the store round trip when the
    /// hash matches.
    Never,
}

impl PrescanTrust {
    pub fn from_flag(trust: bool) -> Self {
        if trust {
            Self::SizeAndMtime
        } else {
            Self::Never
        }
    }
}

/// What happened to one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Uploaded { bytes: u64 },
    /// Content was stored already; this path was added to it.
    Merged,
    /// Content and path were both known to the store.
    AlreadyPresent,
    /// Skipped on the prescan's size and mtime.
    PrescanUnchanged,
    /// Hashed, and the prescan already maps this path to that hash.
    PrescanHashMatch,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackupReport {
    pub uploaded: u64,
    pub bytes_uploaded: u64,
    pub merged: u64,
    pub already_present: u64,
    pub prescan_skipped: u64,
    pub excluded: u64,
    /// Symlinks, empty files, special files and unrepresentable names.
    pub skipped: u64,
}

impl BackupReport {
    pub fn record(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Uploaded { bytes } => {
                self.uploaded += 1;
                self.bytes_uploaded += bytes;
            }
            FileOutcome::Merged => self.merged += 1,
            FileOutcome::AlreadyPresent => self.already_present += 1,
            FileOutcome::PrescanUnchanged | FileOutcome::PrescanHashMatch => {
                self.prescan_skipped += 1
            }
        }
    }

    /// Number of store writes (blob or metadata) the run performed.
    pub fn writes(&self) -> u64 {
        self.uploaded * 2 + self.merged
    }
}

pub struct BackupEngine {
    store: Arc<dyn BlobStore>,
    prescan: Option<Arc<PathIndex>>,
    excludes: Vec<Regex>,
    retry: RetryPolicy,
    throttle: Option<Arc<TokenBucket>>,
    trust: PrescanTrust,
    cancel: CancellationToken,
}

impl BackupEngine {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            prescan: None,
            excludes: Vec::new(),
            retry: RetryPolicy::default(),
            throttle: None,
            trust: PrescanTrust::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// An engine with retry, throttle and trust settings taken from the
    /// `[backup]` table.
    pub fn from_config(store: Arc<dyn BlobStore>, config: &BackupConfig) -> Self {
        Self::new(store)
            .with_retry(RetryPolicy::from_config(config))
            .with_throttle(TokenBucket::from_rate(config.throttle, config.throttle_burst))
            .with_trust(PrescanTrust::from_flag(config.trust_prescan))
    }

    pub fn with_prescan(mut self, index: Arc<PathIndex>) -> Self {
        self.prescan = Some(index);
        self
    }

    pub fn with_excludes(mut self, excludes: Vec<Regex>) -> Self {
        self.excludes = excludes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_throttle(mut self, bucket: Option<Arc<TokenBucket>>) -> Self {
        self.throttle = bucket;
        self
    }

    pub fn with_trust(mut self, trust: PrescanTrust) -> Self {
        self.trust = trust;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Back up every root in order. The first root that fails stops the run
    /// with an error naming that root.
    pub async fn run(&self, roots: &[PathBuf]) -> Result<BackupReport> {
        let start = Instant::now();
        let mut report = BackupReport::default();
        for root in roots {
            self.backup_root(root, &mut report)
                .await
                .context(|| format!("in walk of {}", root.display()))?;
        }
        tracing::info!(
            "backup: done roots={} uploaded={} bytes={} merged={} present={} prescan_skipped={} elapsed={:.2}s",
            roots.len(),
            report.uploaded,
            report.bytes_uploaded,
            report.merged,
            report.already_present,
            report.prescan_skipped,
            start.elapsed().as_secs_f64()
        );
        Ok(report)
    }

    async fn backup_root(&self, root: &Path, report: &mut BackupReport) -> Result<()> {
        let root = tokio::fs::canonicalize(root).await?;

        // The walk itself is blocking I/O; it runs on the blocking pool and
        // hands entries over one at a time.
        let (tx, mut rx) = mpsc::channel(WALK_QUEUE);
        let walk_root = root.clone();
        let walker = tokio::task::spawn_blocking(move || {
            for entry in WalkDir::new(&walk_root).sort_by_file_name() {
                if tx.blocking_send(entry).is_err() {
                    break;
                }
            }
        });

        let result = async {
            while let Some(entry) = rx.recv().await {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let entry = entry.map_err(std::io::Error::from)?;
                self.visit(&entry, report).await?;
            }
            Ok(())
        }
        .await;

        drop(rx);
        if let Err(e) = walker.await {
            warn!("walker for {} ended abnormally: {e}", root.display());
        }
        result
    }

    async fn visit(&self, entry: &DirEntry, report: &mut BackupReport) -> Result<()> {
        let file_type = entry.file_type();
        if file_type.is_dir() {
            return Ok(());
        }
        let local = entry.path();
        let Some(path) = local.to_str() else {
            warn!("Skipping non-UTF-8 path {}", local.display());
            report.skipped += 1;
            return Ok(());
        };
        if file_type.is_symlink() {
            info!("Skipping symlink {path}");
            report.skipped += 1;
            return Ok(());
        }
        if !file_type.is_file() {
            info!("Skipping special file {path}");
            report.skipped += 1;
            return Ok(());
        }

        let meta = entry
            .metadata()
            .map_err(std::io::Error::from)
            .context(|| format!("stat {path}"))?;
        if meta.len() == 0 {
            info!("Skipping empty file {path}");
            report.skipped += 1;
            return Ok(());
        }
        if self.is_excluded(path) {
            info!("Skipping excluded file {path}");
            report.excluded += 1;
            return Ok(());
        }

        let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
        let outcome = self.backup_file(local, path, meta.len(), mtime).await?;
        report.record(outcome);
        Ok(())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excludes.iter().any(|re| re.is_match(path))
    }

    /// Make sure the content of one regular file is stored under `path`.
    pub async fn backup_file(
        &self,
        local: &Path,
        path: &str,
        size: u64,
        mtime: i64,
    ) -> Result<FileOutcome> {
        let known = self
            .prescan
            .as_deref()
            .and_then(|index| index.file(path))
            .cloned();

        if let Some(entry) = &known {
            if self.trust == PrescanTrust::SizeAndMtime
                && entry.size == size
                && mtime <= entry.modified_at
            {
                info!("Found a prescan size/modtime match for {path}");
                return Ok(FileOutcome::PrescanUnchanged);
            }
        }

        let hashed = local.to_path_buf();
        let id = tokio::task::spawn_blocking(move || ContentId::of_file(&hashed))
            .await
            .map_err(std::io::Error::other)
            .and_then(|r| r)
            .context(|| format!("hashing {path}"))?;

        if known.is_some_and(|entry| entry.content_id == id) {
            info!("Found a prescan hash match for {path}");
            return Ok(FileOutcome::PrescanHashMatch);
        }

        let existing = retry::cancellable(&self.cancel, self.store.exists(id.as_str()))
            .await
            .context(|| format!("getting attrs for {id} (path {path})"))?;

        match existing {
            None => self.upload(local, path, size, &id).await,
            Some(attrs) => self.merge(path, &id, attrs).await,
        }
    }

    async fn upload(&self, local: &Path, path: &str, size: u64, id: &ContentId) -> Result<FileOutcome> {
        let paths = PathMap::from([(path.to_string(), Utc::now().timestamp())]);
        let metadata = metadata::encode_paths(&paths)
            .context(|| format!("encoding new paths attr for {id} (path {path})"))?;

        info!("uploading {path}, {size} bytes, hash {id}");
        let bytes = self
            .retry
            .run("upload", &self.cancel, || self.copy_to_store(local, id.as_str()))
            .await
            .context(|| format!("uploading content for {id} (path {path})"))?;

        // Only now that the blob has landed may metadata point at it.
        self.retry
            .run("store attrs", &self.cancel, || {
                self.store.update_metadata(id.as_str(), metadata.clone())
            })
            .await
            .context(|| format!("storing attrs for {id} (path {path})"))?;

        Ok(FileOutcome::Uploaded { bytes })
    }

    /// One upload attempt: stream the file into a fresh sink, restoring the
    /// file's times afterwards.
    async fn copy_to_store(&self, local: &Path, id: &str) -> Result<u64> {
        let times = FileTimes::capture(local)?;
        let result = async {
            let mut sink = self.store.create(id).await?;
            if let Some(bucket) = &self.throttle {
                sink = Box::new(ThrottledSink::new(sink, bucket.clone(), self.cancel.clone()));
            }
            let mut file = tokio::fs::File::open(local).await?;
            let mut buf = vec![0u8; UPLOAD_BUF_SIZE];
            let mut total = 0u64;
            loop {
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                sink.write(&buf[..n]).await?;
                total += n as u64;
            }
            sink.finish().await?;
            Ok::<_, Error>(total)
        }
        .await;
        times.restore(local);
        result
    }

    async fn merge(&self, path: &str, id: &ContentId, attrs: ObjectAttrs) -> Result<FileOutcome> {
        let mut paths = metadata::decode_paths(id.as_str(), &attrs.metadata)
            .context(|| format!("decoding paths attr for {id} (path {path})"))?;

        if paths.contains_key(path) {
            info!("{path} already present (hash {id})");
            return Ok(FileOutcome::AlreadyPresent);
        }

        let old: Vec<&str> = paths.keys().map(String::as_str).collect();
        info!("{path} already present as {old:?} (hash {id}), adding new path");

        paths.insert(path.to_string(), Utc::now().timestamp());
        let mut updated = attrs.metadata;
        updated.extend(
            metadata::encode_paths(&paths)
                .context(|| format!("encoding updated paths attr for {id} (path {path})"))?,
        );

        self.retry
            .run("update attrs", &self.cancel, || {
                self.store.update_metadata(id.as_str(), updated.clone())
            })
            .await
            .context(|| format!("updating attrs for {id} (path {path})"))?;
        Ok(FileOutcome::Merged)
    }
}

/// Compile exclusion patterns, one unanchored regex per line. Blank lines are
/// ignored.
pub fn parse_excludes(text: &str) -> Result<Vec<Regex>> {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| {
            Regex::new(line)
                .map_err(|e| Error::Config(format!("compiling exclude pattern {line}: {e}")))
        })
        .collect()
}

pub fn load_excludes(path: &Path) -> Result<Vec<Regex>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
    parse_excludes(&text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn excludes_skip_blank_lines() {
        let excludes = parse_excludes("\\.tmp$\n\n^/proc/\n").unwrap();
        assert_eq!(excludes.len(), 2);
        assert!(excludes[0].is_match("/x/y.tmp"));
        assert!(!excludes[0].is_match("/x/y.tmpl"));
    }

    #[test]
    fn bad_exclude_is_config_error() {
        let err = parse_excludes("(unclosed\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn report_counts_outcomes() {
        let mut report = BackupReport::default();
        report.record(FileOutcome::Uploaded { bytes: 5 });
        report.record(FileOutcome::Merged);
        report.record(FileOutcome::PrescanHashMatch);
        report.record(FileOutcome::AlreadyPresent);
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.bytes_uploaded, 5);
        assert_eq!(report.prescan_skipped, 1);
        assert_eq!(report.writes(), 3);
    }
}
