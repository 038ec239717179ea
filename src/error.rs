//! Crate-wide error type.
//!
//! Variants follow the failure classes the engine and both front ends care
//! about: lookups that miss (`NotFound`, `NotADirectory`), remote failures
//! that may succeed on a later attempt (`Transient`), and fatal input problems
//! (`Config`, `Listing`). `Context` wraps an inner error with a message so a
//! failure deep in a walk still reports which root and which object it hit.

use std::fmt::Display;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Path absent from the index or object absent from the store.
    #[error("no such entry: {0}")]
    NotFound(String),

    /// A path traverses through a file.
    #[error("not a directory: {0}")]
    NotADirectory(String),

    /// Network or server-side failure worth retrying.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Store failure that will not go away by retrying.
    #[error("store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Malformed listing-replay input.
    #[error("malformed listing: {0}")]
    Listing(String),

    /// Missing or undecodable `paths` metadata on a stored object.
    #[error("bad metadata on {id}: {reason}")]
    Metadata { id: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the failed operation could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Context { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Context { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Errno reported to the kernel when this error ends a FUSE request.
    pub fn errno(&self) -> libc::c_int {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::Cancelled => libc::EINTR,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::Context { source, .. } => source.errno(),
            _ => libc::EIO,
        }
    }

    /// The innermost error of a `Context` chain.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Attach a message to an error while keeping it classifiable.
pub trait ResultExt<T> {
    fn context<C, F>(self, f: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    fn context<C, F>(self, f: F) -> Result<T>
    where
        C: Display,
        F: FnOnce() -> C,
    {
        self.map_err(|e| Error::Context {
            context: f().to_string(),
            source: Box::new(e.into()),
        })
    }
}
