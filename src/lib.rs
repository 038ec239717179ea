//! # dedupfs
//!
//! A content-addressed backup engine. `dedupfs save` walks directory trees,
//! stores each distinct file content once under its SHA-256 content id, and
//! records every path that ever held that content in the object's metadata.
//! The stored corpus can then be browsed read-only, either mounted through
//! FUSE or served over HTTP.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dedupfs::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> dedupfs::Result<()> {
//!     dedupfs::util::config::init_config("dedupfs.toml").unwrap();
//!     let config = dedupfs::util::config::config();
//!
//!     let store: Arc<dyn BlobStore> = Arc::new(LocalStore::open(&config.store.root).await?);
//!
//!     // Back up two trees
//!     let engine = BackupEngine::from_config(store.clone(), &config.backup);
//!     let report = engine.run(&["/home".into(), "/etc".into()]).await?;
//!     println!("uploaded {} files", report.uploaded);
//!
//!     // Rebuild the view and look a path up
//!     let index = PathIndex::from_store(store.as_ref(), BuildOptions::default()).await?;
//!     let entry = index.file("/etc/hostname").unwrap();
//!     println!("{} {} bytes", entry.content_id, entry.size);
//!     Ok(())
//! }
//! ```
//!
//! ## Serving the corpus
//!
//! ```rust,ignore
//! use dedupfs::prelude::*;
//! use tokio_util::sync::CancellationToken;
//!
//! let reader = BlobReader::new(store.clone(), config.read_config()?);
//! let index = std::sync::Arc::new(index);
//!
//! // Over HTTP
//! let state = AppState::new(index.clone(), reader.clone(), config.browse);
//! dedupfs::server::serve(state, "127.0.0.1:1549", CancellationToken::new()).await?;
//!
//! // Or as a mount
//! let fs = BackupFs::new(index, reader, config.browse);
//! dedupfs::fuse::mount(fs, "/mnt/backup".as_ref(), "dedupfs", CancellationToken::new()).await?;
//! ```
//!
//! ## Core Components
//!
//! - [`index`]: the in-memory path tree and its two build paths
//! - [`backup`]: the walk, hash, upload and merge engine
//! - [`reader`]: chunked and ranged blob reads shared by both front ends
//! - [`fuse`] / [`server`]: the read-only front ends
//! - [`store`]: the object store capability plus local and in-memory stores
//! - [`util::config`]: configuration management

#[macro_use]
extern crate log;

pub mod backup;
pub mod content;
pub mod error;
pub mod fuse;
pub mod index;
pub mod reader;
pub mod server;
pub mod store;
pub mod util;

/// Commonly used types and traits.
///
/// ```rust,ignore
/// use dedupfs::prelude::*;
/// ```
pub mod prelude {
    pub use crate::backup::{BackupEngine, BackupReport, PrescanTrust, RetryPolicy, TokenBucket};
    pub use crate::content::ContentId;
    pub use crate::error::{Error, Result, ResultExt};
    pub use crate::fuse::BackupFs;
    pub use crate::index::{BuildOptions, PathIndex};
    pub use crate::reader::BlobReader;
    pub use crate::server::{AppState, BasicAuth};
    pub use crate::store::{BlobStore, LocalStore, MemoryStore};
    pub use crate::util::config::{Config, ReadConfig};
}

pub use error::{Error, Result};
