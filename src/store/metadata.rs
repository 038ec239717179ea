//! Encoding of the `paths` metadata entry.
//!
//! Each object records every path that ever held its content under a single
//! metadata key, `paths`, whose value is a JSON object mapping the absolute
//! path to the Unix time (seconds) it was last seen.

use std::collections::BTreeMap;

use super::Metadata;
use crate::error::{Error, Result};

pub const PATHS_KEY: &str = "paths";

/// Path to last-seen Unix time.
pub type PathMap = BTreeMap<String, i64>;

/// Decode the `paths` entry of `metadata`. A missing entry is an empty map;
/// an entry that is not a JSON object of integers is an error.
pub fn decode_paths(id: &str, metadata: &Metadata) -> Result<PathMap> {
    match metadata.get(PATHS_KEY) {
        None => Ok(PathMap::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| Error::Metadata {
            id: id.to_string(),
            reason: format!("decoding paths attr: {e}"),
        }),
    }
}

pub fn has_paths(metadata: &Metadata) -> bool {
    metadata.contains_key(PATHS_KEY)
}

/// Metadata holding exactly the given `paths` entry.
pub fn encode_paths(paths: &PathMap) -> Result<Metadata> {
    let json = serde_json::to_string(paths)?;
    Ok(Metadata::from([(PATHS_KEY.to_string(), json)]))
}
