//! # Path index
//!
//! An in-memory tree of every path recorded in the store. Files carry the
//! content id, size and timestamp of the blob they map to; directories are
//! synthesized on demand while inserting paths.
//!
//! Nodes live in an arena owned by [`PathIndex`] and refer to each other by
//! [`NodeId`]. A node's parent link is a plain handle, so the tree holds no
//! reference cycles and nodes are never freed individually. Every node also
//! gets a process-unique inode number from an [`InodeAllocator`]; the root is
//! always [`ROOT_INODE`].
//!
//! The index is built once (see [`build`]) and is read-only afterwards, so it
//! can be shared between server threads behind an `Arc` without locking.
//!
//! ```rust,ignore
//! let mut index = PathIndex::new();
//! index.insert("/photos/2019/cat.jpg", id, 1_560_000_000, 48_213)?;
//! let node = index.resolve("/photos/2019")?;
//! assert!(index.node(node).is_dir());
//! ```

pub mod build;
pub mod listing;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use crate::{
    content::ContentId,
    error::{Error, Result},
};

pub use build::BuildOptions;

/// Inode number of the root directory.
pub const ROOT_INODE: u64 = 1;

/// Hands out inode numbers, starting at 2 and never repeating.
#[derive(Debug)]
pub struct InodeAllocator {
    next: AtomicU64,
}

impl Default for InodeAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeAllocator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Handle to a node in a [`PathIndex`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// What a file node points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub content_id: ContentId,
    pub size: u64,
    /// Unix seconds this path was last recorded.
    pub modified_at: i64,
}

#[derive(Debug)]
pub enum NodeKind {
    Directory(HashMap<String, NodeId>),
    File(FileEntry),
}

#[derive(Debug)]
pub struct Node {
    ino: u64,
    name: String,
    parent: Option<NodeId>,
    kind: NodeKind,
}

impl Node {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_))
    }

    pub fn as_file(&self) -> Option<&FileEntry> {
        match &self.kind {
            NodeKind::File(entry) => Some(entry),
            NodeKind::Directory(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct PathIndex {
    nodes: Vec<Node>,
    by_ino: HashMap<u64, NodeId>,
    inodes: Arc<InodeAllocator>,
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

impl PathIndex {
    pub fn new() -> Self {
        Self::with_allocator(Arc::new(InodeAllocator::new()))
    }

    /// An empty index drawing inode numbers from a shared allocator.
    pub fn with_allocator(inodes: Arc<InodeAllocator>) -> Self {
        let root = Node {
            ino: ROOT_INODE,
            name: String::new(),
            parent: None,
            kind: NodeKind::Directory(HashMap::new()),
        };
        Self {
            nodes: vec![root],
            by_ino: HashMap::from([(ROOT_INODE, NodeId(0))]),
            inodes,
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn by_inode(&self, ino: u64) -> Option<NodeId> {
        self.by_ino.get(&ino).copied()
    }

    /// Number of reachable nodes, root included.
    pub fn len(&self) -> usize {
        self.by_ino.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ino.len() == 1
    }

    pub fn file_count(&self) -> usize {
        self.by_ino
            .values()
            .filter(|id| matches!(self.node(**id).kind, NodeKind::File(_)))
            .count()
    }

    /// Create or replace the file at `path`, creating missing directories.
    ///
    /// Fails with [`Error::NotADirectory`] when a leading segment is a file.
    pub fn insert(
        &mut self,
        path: &str,
        content_id: ContentId,
        timestamp: i64,
        size: u64,
    ) -> Result<NodeId> {
        let segs: Vec<&str> = segments(path).collect();
        let Some((name, dirs)) = segs.split_last() else {
            return Err(Error::Listing(format!("cannot place a file at {path:?}")));
        };

        let mut cur = self.root();
        for (i, seg) in dirs.iter().enumerate() {
            cur = match self.child(cur, seg) {
                Some(child) if self.node(child).is_dir() => child,
                Some(_) => {
                    return Err(Error::NotADirectory(format!("/{}", segs[..=i].join("/"))));
                }
                None => self.add_node(cur, seg, NodeKind::Directory(HashMap::new())),
            };
        }

        let entry = FileEntry {
            content_id,
            size,
            modified_at: timestamp,
        };
        match self.child(cur, name) {
            Some(existing) => {
                self.forget_subtree(existing);
                self.nodes[existing.0].kind = NodeKind::File(entry);
                Ok(existing)
            }
            None => Ok(self.add_node(cur, name, NodeKind::File(entry))),
        }
    }

    /// Unregister the inodes below `id` before it is overwritten. The
    /// arena slots stay allocated but become unreachable.
    fn forget_subtree(&mut self, id: NodeId) {
        let mut stack: Vec<NodeId> = match &self.node(id).kind {
            NodeKind::Directory(children) => children.values().copied().collect(),
            NodeKind::File(_) => return,
        };
        while let Some(n) = stack.pop() {
            let node = &self.nodes[n.0];
            self.by_ino.remove(&node.ino);
            if let NodeKind::Directory(children) = &node.kind {
                stack.extend(children.values().copied());
            }
        }
    }

    fn add_node(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        let ino = self.inodes.allocate();
        self.nodes.push(Node {
            ino,
            name: name.to_string(),
            parent: Some(parent),
            kind,
        });
        self.by_ino.insert(ino, id);
        if let NodeKind::Directory(children) = &mut self.nodes[parent.0].kind {
            children.insert(name.to_string(), id);
        }
        id
    }

    fn child(&self, dir: NodeId, name: &str) -> Option<NodeId> {
        match &self.node(dir).kind {
            NodeKind::Directory(children) => children.get(name).copied(),
            NodeKind::File(_) => None,
        }
    }

    /// Resolve an absolute or root-relative path.
    pub fn resolve(&self, path: &str) -> Result<NodeId> {
        self.resolve_from(self.root(), path)
    }

    /// Walk `path` segment by segment starting at `start`.
    pub fn resolve_from(&self, start: NodeId, path: &str) -> Result<NodeId> {
        let mut cur = start;
        let mut walked = String::new();
        for seg in segments(path) {
            match &self.node(cur).kind {
                NodeKind::File(_) => return Err(Error::NotADirectory(walked)),
                NodeKind::Directory(children) => {
                    walked.push('/');
                    walked.push_str(seg);
                    cur = *children
                        .get(seg)
                        .ok_or_else(|| Error::NotFound(walked.clone()))?;
                }
            }
        }
        Ok(cur)
    }

    /// Single-name lookup inside a directory, as the mount does it.
    pub fn lookup(&self, dir: NodeId, name: &str) -> Result<NodeId> {
        match &self.node(dir).kind {
            NodeKind::File(_) => Err(Error::NotADirectory(self.path_of(dir))),
            NodeKind::Directory(children) => children
                .get(name)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("{}/{name}", self.path_of(dir)))),
        }
    }

    /// The file entry at `path`, if that path is a file.
    pub fn file(&self, path: &str) -> Option<&FileEntry> {
        self.resolve(path).ok().and_then(|id| self.node(id).as_file())
    }

    /// Children of a directory as (name, node) pairs in no particular order.
    /// Empty for files.
    pub fn children(&self, id: NodeId) -> Vec<(&str, NodeId)> {
        match &self.node(id).kind {
            NodeKind::Directory(children) => {
                children.iter().map(|(k, v)| (k.as_str(), *v)).collect()
            }
            NodeKind::File(_) => Vec::new(),
        }
    }

    /// Absolute path of a node, rebuilt from parent links.
    pub fn path_of(&self, id: NodeId) -> String {
        let mut names = Vec::new();
        let mut cur = Some(id);
        while let Some(n) = cur {
            let node = self.node(n);
            if node.parent.is_some() {
                names.push(node.name.as_str());
            }
            cur = node.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }
}
