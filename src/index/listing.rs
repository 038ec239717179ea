//! The listing stream.
//!
//! `dedupfs list` writes one JSON object per recorded path:
//!
//! ```json
//! {"path":"/a/b.txt","timestamp":"2023-11-14T22:13:20Z","hash":"sha256-…","size":5}
//! ```
//!
//! Records are concatenated JSON values; whitespace between them does not
//! matter. Timestamps may be RFC 3339 strings or Unix seconds. The older
//! per-object form, `{"paths":{"/a/b.txt":"…"},"size":5,"hash":"sha256-…"}`,
//! is accepted on input and expanded into one record per path.

use std::{collections::BTreeMap, collections::VecDeque, fmt, io::Read, io::Write};

use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{
    error::{Error, Result},
    store::{metadata, BlobStore, ObjectAttrs},
};

/// Unix seconds, written as RFC 3339 and read from either form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTime(pub i64);

impl Serialize for UnixTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match DateTime::<Utc>::from_timestamp(self.0, 0) {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_i64(self.0),
        }
    }
}

impl<'de> Deserialize<'de> for UnixTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = UnixTime;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("Unix seconds or an RFC 3339 timestamp")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<UnixTime, E> {
                Ok(UnixTime(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<UnixTime, E> {
                i64::try_from(v).map(UnixTime).map_err(E::custom)
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<UnixTime, E> {
                DateTime::parse_from_rfc3339(v)
                    .map(|dt| UnixTime(dt.timestamp()))
                    .map_err(E::custom)
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Parse a point in time given on the command line: Unix seconds or RFC 3339.
pub fn parse_time(s: &str) -> Result<i64> {
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.timestamp())
        .map_err(|e| Error::Config(format!("bad time {s:?}: {e}")))
}

/// One recorded path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRecord {
    pub path: String,
    pub timestamp: UnixTime,
    pub hash: String,
    pub size: u64,
}

#[derive(Deserialize)]
struct ObjectRecord {
    paths: BTreeMap<String, UnixTime>,
    size: u64,
    hash: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRecord {
    Path(ListRecord),
    Object(ObjectRecord),
}

/// Streaming decoder over a listing. Yields records in input order; the
/// first malformed value ends the stream with an [`Error::Listing`].
pub struct ListingReader<R: Read> {
    values: serde_json::StreamDeserializer<'static, serde_json::de::IoRead<R>, RawRecord>,
    pending: VecDeque<ListRecord>,
    seen: usize,
    failed: bool,
}

impl<R: Read> ListingReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            values: serde_json::Deserializer::from_reader(reader).into_iter(),
            pending: VecDeque::new(),
            seen: 0,
            failed: false,
        }
    }
}

impl<R: Read> Iterator for ListingReader<R> {
    type Item = Result<ListRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            if self.failed {
                return None;
            }
            match self.values.next()? {
                Ok(RawRecord::Path(record)) => {
                    self.seen += 1;
                    return Some(Ok(record));
                }
                Ok(RawRecord::Object(object)) => {
                    self.seen += 1;
                    self.pending
                        .extend(object.paths.into_iter().map(|(path, timestamp)| ListRecord {
                            path,
                            timestamp,
                            hash: object.hash.clone(),
                            size: object.size,
                        }));
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(Error::Listing(format!(
                        "record {}: {e}",
                        self.seen + 1
                    ))));
                }
            }
        }
    }
}

/// The listing records describing one stored object.
pub fn records_for(attrs: &ObjectAttrs) -> Result<Vec<ListRecord>> {
    let paths = metadata::decode_paths(&attrs.name, &attrs.metadata)?;
    Ok(paths
        .into_iter()
        .map(|(path, ts)| ListRecord {
            path,
            timestamp: UnixTime(ts),
            hash: attrs.name.clone(),
            size: attrs.size,
        })
        .collect())
}

/// Counts reported by [`write_listing`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ListSummary {
    pub objects: usize,
    pub records: usize,
    pub skipped: usize,
}

/// Scan the store and write one record per recorded path to `out`.
pub async fn write_listing<W: Write>(store: &dyn BlobStore, mut out: W) -> Result<ListSummary> {
    let mut summary = ListSummary::default();
    let mut objects = store.list_all();
    while let Some(attrs) = objects.try_next().await? {
        summary.objects += 1;
        let records = match records_for(&attrs) {
            Ok(records) => records,
            Err(e) => {
                warn!("skipping {}: {e}", attrs.name);
                summary.skipped += 1;
                continue;
            }
        };
        for record in records {
            serde_json::to_writer(&mut out, &record)?;
            out.write_all(b"\n")?;
            summary.records += 1;
        }
    }
    out.flush()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_in_both_forms() {
        let text = r#"
            {"path":"/a","timestamp":1700000000,"hash":"h1","size":1}
            {"path":"/b","timestamp":"2023-11-14T22:13:20Z","hash":"h2","size":2}
        "#;
        let records: Vec<ListRecord> = ListingReader::new(text.as_bytes())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].timestamp, UnixTime(1_700_000_000));
        assert_eq!(records[1].timestamp, UnixTime(1_700_000_000));
    }

    #[test]
    fn per_object_records_expand() {
        let text = r#"{"paths":{"/x/1":"2023-11-14T22:13:20Z","/x/2":5},"size":9,"timestamp":"0001-01-01T00:00:00Z","hash":"h"}"#;
        let records: Vec<ListRecord> = ListingReader::new(text.as_bytes())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.hash == "h" && r.size == 9));
    }

    #[test]
    fn garbage_stops_the_stream() {
        let text = r#"{"path":"/a","timestamp":1,"hash":"h","size":1} {"nope":true} {"path":"/b","timestamp":1,"hash":"h","size":1}"#;
        let results: Vec<Result<ListRecord>> = ListingReader::new(text.as_bytes()).collect();
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(Error::Listing(_))));
    }

    #[test]
    fn serializes_rfc3339() {
        let record = ListRecord {
            path: "/a".into(),
            timestamp: UnixTime(1_700_000_000),
            hash: "h".into(),
            size: 1,
        };
        assert_eq!(
            serde_json::to_string(&record).unwrap(),
            r#"{"path":"/a","timestamp":"2023-11-14T22:13:20Z","hash":"h","size":1}"#
        );
    }

    #[test]
    fn command_line_times() {
        assert_eq!(parse_time("1700000000").unwrap(), 1_700_000_000);
        assert_eq!(parse_time("2023-11-14T22:13:20+00:00").unwrap(), 1_700_000_000);
        assert!(parse_time("yesterday").is_err());
    }
}
