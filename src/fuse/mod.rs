//! Read-only FUSE view of a [`PathIndex`].
//!
//! Inode numbers are the index's node identifiers, so the root is inode 1.
//! Directories are `0555`, files `0444`, file mtimes are the last time the
//! path was recorded. File content is fetched through the shared
//! [`BlobReader`] on every read; nothing is cached here beyond what the
//! kernel caches for `TTL`.

use std::{
    ffi::{OsStr, OsString},
    num::NonZeroU32,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use futures::stream::{self, Stream};
use rfuse3::{
    raw::{
        reply::{
            DirectoryEntry, DirectoryEntryPlus, FileAttr, ReplyAttr, ReplyData, ReplyDirectory,
            ReplyDirectoryPlus, ReplyEntry, ReplyInit, ReplyOpen, ReplyStatFs,
        },
        Filesystem, MountHandle, Request, Session,
    },
    Errno, FileType, MountOptions, Timestamp,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ResultExt},
    index::{FileEntry, NodeId, NodeKind, PathIndex},
    reader::BlobReader,
};

const TTL: Duration = Duration::from_secs(60);
const BLOCK_SIZE: u32 = 4096;
const MAX_WRITE: u32 = 128 * 1024;
const NAME_MAX: u32 = 255;

const DIR_PERM: u16 = 0o555;
const FILE_PERM: u16 = 0o444;

type FsResult<T> = rfuse3::Result<T>;

fn errno(e: &Error) -> Errno {
    Errno::from(e.errno())
}

/// One line of a directory listing as the mount reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub ino: u64,
    pub name: String,
    pub kind: FileType,
}

pub struct BackupFs {
    index: Arc<PathIndex>,
    reader: BlobReader,
    browse: bool,
    uid: u32,
    gid: u32,
}

impl BackupFs {
    pub fn new(index: Arc<PathIndex>, reader: BlobReader, browse: bool) -> Self {
        Self {
            index,
            reader,
            browse,
            uid: 0,
            gid: 0,
        }
    }

    /// Owner reported for every node.
    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    fn node_id(&self, ino: u64) -> FsResult<NodeId> {
        self.index
            .by_inode(ino)
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn file_entry(&self, ino: u64) -> FsResult<&FileEntry> {
        let id = self.node_id(ino)?;
        match self.index.node(id).kind() {
            NodeKind::File(entry) => Ok(entry),
            NodeKind::Directory(_) => Err(Errno::from(libc::EISDIR)),
        }
    }

    /// Attributes of the node with inode `ino`.
    pub fn attr(&self, ino: u64) -> FsResult<FileAttr> {
        let id = self.node_id(ino)?;
        Ok(self.attr_of(id))
    }

    fn attr_of(&self, id: NodeId) -> FileAttr {
        let node = self.index.node(id);
        let (kind, perm, size, mtime, nlink) = match node.kind() {
            NodeKind::Directory(children) => {
                let subdirs = children
                    .values()
                    .filter(|c| self.index.node(**c).is_dir())
                    .count() as u32;
                (FileType::Directory, DIR_PERM, 0, 0, 2 + subdirs)
            }
            NodeKind::File(entry) => (
                FileType::RegularFile,
                FILE_PERM,
                entry.size,
                entry.modified_at,
                1,
            ),
        };
        let time = Timestamp::new(mtime, 0);
        FileAttr {
            ino: node.ino(),
            size,
            blocks: size.div_ceil(512),
            atime: time,
            mtime: time,
            ctime: time,
            kind,
            perm,
            nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
        }
    }

    /// Resolve `name` inside directory `parent`.
    pub fn lookup_attr(&self, parent: u64, name: &OsStr) -> FsResult<FileAttr> {
        let dir = self.node_id(parent)?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let child = self.index.lookup(dir, name).map_err(|e| errno(&e))?;
        Ok(self.attr_of(child))
    }

    /// Entries of directory `ino`, `.` and `..` first. Children come in the
    /// index's own order.
    pub fn list(&self, ino: u64) -> FsResult<Vec<DirEntryInfo>> {
        let id = self.node_id(ino)?;
        let node = self.index.node(id);
        if !node.is_dir() {
            return Err(Errno::from(libc::ENOTDIR));
        }
        if !self.browse {
            return Err(Errno::from(libc::EACCES));
        }
        let parent_ino = node
            .parent()
            .map_or(node.ino(), |p| self.index.node(p).ino());
        let mut entries = vec![
            DirEntryInfo {
                ino: node.ino(),
                name: ".".into(),
                kind: FileType::Directory,
            },
            DirEntryInfo {
                ino: parent_ino,
                name: "..".into(),
                kind: FileType::Directory,
            },
        ];
        entries.extend(self.index.children(id).into_iter().map(|(name, child)| {
            let child = self.index.node(child);
            DirEntryInfo {
                ino: child.ino(),
                name: name.to_string(),
                kind: if child.is_dir() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                },
            }
        }));
        Ok(entries)
    }

    /// Up to `size` bytes of file `ino` from `offset`.
    pub async fn read_at(&self, ino: u64, offset: u64, size: u32) -> FsResult<Bytes> {
        let entry = self.file_entry(ino)?;
        if offset >= entry.size {
            return Ok(Bytes::new());
        }
        let length = (entry.size - offset).min(u64::from(size)) as usize;
        let data = self
            .reader
            .read_range(entry.content_id.as_str(), offset, length)
            .await
            .map_err(|e| {
                warn!("read {} at {offset}: {e}", entry.content_id);
                errno(&e)
            })?;
        Ok(Bytes::from(data))
    }
}

fn is_write_access(flags: u32) -> bool {
    let mode = flags as libc::c_int & libc::O_ACCMODE;
    mode != libc::O_RDONLY || flags as libc::c_int & libc::O_TRUNC != 0
}

impl Filesystem for BackupFs {
    async fn init(&self, _req: Request) -> FsResult<ReplyInit> {
        Ok(ReplyInit {
            max_write: NonZeroU32::new(MAX_WRITE).ok_or_else(|| Errno::from(libc::EINVAL))?,
        })
    }

    async fn destroy(&self, _req: Request) {}

    async fn lookup(&self, _req: Request, parent: u64, name: &OsStr) -> FsResult<ReplyEntry> {
        let attr = self.lookup_attr(parent, name)?;
        Ok(ReplyEntry {
            ttl: TTL,
            attr,
            generation: 0,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        inode: u64,
        _fh: Option<u64>,
        _flags: u32,
    ) -> FsResult<ReplyAttr> {
        Ok(ReplyAttr {
            ttl: TTL,
            attr: self.attr(inode)?,
        })
    }

    async fn open(&self, _req: Request, inode: u64, flags: u32) -> FsResult<ReplyOpen> {
        self.file_entry(inode)?;
        if is_write_access(flags) {
            return Err(Errno::from(libc::EROFS));
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        inode: u64,
        _fh: u64,
        offset: u64,
        size: u32,
    ) -> FsResult<ReplyData> {
        Ok(ReplyData {
            data: self.read_at(inode, offset, size).await?,
        })
    }

    async fn release(
        &self,
        _req: Request,
        _inode: u64,
        _fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> FsResult<()> {
        Ok(())
    }

    async fn statfs(&self, _req: Request, _inode: u64) -> FsResult<ReplyStatFs> {
        Ok(ReplyStatFs {
            blocks: 0,
            bfree: 0,
            bavail: 0,
            files: self.index.len() as u64,
            ffree: 0,
            bsize: BLOCK_SIZE,
            namelen: NAME_MAX,
            frsize: BLOCK_SIZE,
        })
    }

    async fn opendir(&self, _req: Request, inode: u64, _flags: u32) -> FsResult<ReplyOpen> {
        let id = self.node_id(inode)?;
        if !self.index.node(id).is_dir() {
            return Err(Errno::from(libc::ENOTDIR));
        }
        Ok(ReplyOpen { fh: 0, flags: 0 })
    }

    async fn releasedir(&self, _req: Request, _inode: u64, _fh: u64, _flags: u32) -> FsResult<()> {
        Ok(())
    }

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: i64,
    ) -> FsResult<ReplyDirectory<impl Stream<Item = FsResult<DirectoryEntry>> + Send + 'a>> {
        let entries = self.list(parent)?;
        let entries = entries
            .into_iter()
            .enumerate()
            .skip(offset.max(0) as usize)
            .map(|(i, e)| {
                Ok(DirectoryEntry {
                    inode: e.ino,
                    kind: e.kind,
                    name: OsString::from(e.name),
                    offset: i as i64 + 1,
                })
            });
        Ok(ReplyDirectory {
            entries: stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: u64,
        _fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> FsResult<ReplyDirectoryPlus<impl Stream<Item = FsResult<DirectoryEntryPlus>> + Send + 'a>>
    {
        let entries = self.list(parent)?;
        let mut plus = Vec::with_capacity(entries.len());
        for (i, e) in entries.into_iter().enumerate().skip(offset as usize) {
            plus.push(Ok(DirectoryEntryPlus {
                inode: e.ino,
                generation: 0,
                kind: e.kind,
                name: OsString::from(e.name),
                offset: i as i64 + 1,
                attr: self.attr(e.ino)?,
                entry_ttl: TTL,
                attr_ttl: TTL,
            }));
        }
        Ok(ReplyDirectoryPlus {
            entries: stream::iter(plus),
        })
    }

    async fn access(&self, _req: Request, inode: u64, mask: u32) -> FsResult<()> {
        self.node_id(inode)?;
        if mask as libc::c_int & libc::W_OK != 0 {
            return Err(Errno::from(libc::EROFS));
        }
        Ok(())
    }
}

/// Mount `fs` read-only at `mountpoint` and serve it until the kernel
/// unmounts it or `cancel` fires.
pub async fn mount(
    fs: BackupFs,
    mountpoint: &Path,
    name: &str,
    cancel: CancellationToken,
) -> crate::Result<()> {
    let start = Instant::now();
    let mut options = MountOptions::default();
    options.fs_name(name).read_only(true);

    let mut handle: MountHandle = Session::new(options)
        .mount_with_unprivileged(fs, mountpoint)
        .await
        .context(|| format!("mounting at {}", mountpoint.display()))?;
    tracing::info!(
        "mount: serving name={} mountpoint={} elapsed={:.2}s",
        name,
        mountpoint.display(),
        start.elapsed().as_secs_f64()
    );

    let served = &mut handle;
    tokio::select! {
        res = served => res.context(|| format!("serving {}", mountpoint.display()))?,
        _ = cancel.cancelled() => {
            info!("unmounting {}", mountpoint.display());
            handle
                .unmount()
                .await
                .context(|| format!("unmounting {}", mountpoint.display()))?;
        }
    }
    tracing::info!("mount: done mountpoint={}", mountpoint.display());
    Ok(())
}
