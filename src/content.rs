//! Content identifiers.
//!
//! An object's name in the store is the algorithm tag followed by the
//! lowercase hex digest of its bytes, e.g. `sha256-2cf24dba…`. The tag keeps
//! the scheme open to other digests without ambiguity.

use std::{fmt, io::Read, path::Path};

use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};

use crate::util::atime;

pub const SHA256_TAG: &str = "sha256-";

const READ_BUF_SIZE: usize = 256 * 1024;

/// Name of a blob, derived from its content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Wrap an existing object name without checking it.
    ///
    /// Store scans and listings carry whatever names the store holds; those
    /// are trusted as-is and only checked lazily when read.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn from_sha256_digest(digest: &[u8]) -> Self {
        Self(format!("{SHA256_TAG}{}", hex::encode(digest)))
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self::from_sha256_digest(ring::digest::digest(&SHA256, data).as_ref())
    }

    /// Hash everything `reader` yields.
    pub fn of_reader<R: Read>(mut reader: R) -> std::io::Result<Self> {
        let mut ctx = Context::new(&SHA256);
        let mut buf = vec![0u8; READ_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            ctx.update(&buf[..n]);
        }
        Ok(Self::from_sha256_digest(ctx.finish().as_ref()))
    }

    /// Hash a file on disk, leaving its access time as it was.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        atime::with_times_restored(path, |file| Self::of_reader(file))
    }

    /// True for `sha256-` followed by exactly 64 lowercase hex digits.
    pub fn is_well_formed(&self) -> bool {
        self.0.strip_prefix(SHA256_TAG).is_some_and(|hex| {
            hex.len() == 64 && hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<String> for ContentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_digest() {
        let id = ContentId::of_bytes(b"hello");
        assert_eq!(
            id.as_str(),
            "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert!(id.is_well_formed());
    }

    #[test]
    fn reader_and_slice_agree() {
        let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
        let streamed = ContentId::of_reader(&data[..]).unwrap();
        assert_eq!(streamed, ContentId::of_bytes(&data));
    }

    #[test]
    fn malformed_names() {
        assert!(!ContentId::new("sha256-abc").is_well_formed());
        assert!(!ContentId::new("md5-d41d8cd98f00b204e9800998ecf8427e").is_well_formed());
        assert!(!ContentId::new(format!("sha256-{}", "A".repeat(64))).is_well_formed());
    }
}
