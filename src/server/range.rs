//! `Range` and HTTP-date header parsing.

use chrono::{DateTime, Utc};

/// How a `Range` header applies to a file of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRange {
    /// Malformed or multi-range: serve the whole file.
    Ignored,
    /// Inclusive byte bounds within the file.
    Satisfiable { start: u64, end: u64 },
    Unsatisfiable,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        match self {
            Self::Satisfiable { start, end } => end - start + 1,
            _ => 0,
        }
    }
}

/// Interpret a single `bytes=` range against a file of `size` bytes.
pub fn parse_range(header: &str, size: u64) -> ByteRange {
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return ByteRange::Ignored;
    };
    if spec.contains(',') {
        return ByteRange::Ignored;
    }
    let Some((first, last)) = spec.split_once('-') else {
        return ByteRange::Ignored;
    };
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let Ok(suffix) = last.parse::<u64>() else {
            return ByteRange::Ignored;
        };
        if suffix == 0 || size == 0 {
            return ByteRange::Unsatisfiable;
        }
        return ByteRange::Satisfiable {
            start: size.saturating_sub(suffix),
            end: size - 1,
        };
    }

    let Ok(start) = first.parse::<u64>() else {
        return ByteRange::Ignored;
    };
    let end = if last.is_empty() {
        u64::MAX
    } else {
        match last.parse::<u64>() {
            Ok(end) if end >= start => end,
            _ => return ByteRange::Ignored,
        }
    };
    if start >= size {
        return ByteRange::Unsatisfiable;
    }
    ByteRange::Satisfiable {
        start,
        end: end.min(size - 1),
    }
}

/// IMF-fixdate, as used in `Last-Modified`.
pub fn http_date(unix: i64) -> String {
    DateTime::<Utc>::from_timestamp(unix, 0)
        .unwrap_or_default()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

pub fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.timestamp())
}
