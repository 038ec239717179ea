use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Response};

use super::error::ServerError;
use super::range::{http_date, parse_http_date, parse_range, ByteRange};
use super::AppState;
use crate::index::{FileEntry, NodeId, NodeKind, PathIndex};

/// GET / — the root listing.
pub async fn get_root(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    respond(&state, "", &uri, &headers).await
}

/// GET /{*path} — a directory listing or file content.
///
/// A path that walks through a file answers 404 with a "not a directory"
/// body, distinct from the "not found" body of a missing name.
pub async fn get_path(
    State(state): State<AppState>,
    Path(path): Path<String>,
    uri: Uri,
    headers: HeaderMap,
) -> Result<Response, ServerError> {
    respond(&state, &path, &uri, &headers).await
}

async fn respond(
    state: &AppState,
    path: &str,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<Response, ServerError> {
    let id = state.index.resolve(path)?;
    let node = state.index.node(id);
    let trailing_slash = uri.path().ends_with('/');

    match node.kind() {
        NodeKind::Directory(_) => {
            if !trailing_slash {
                return Ok(redirect(&format!("{}/", uri.path()), uri.query()));
            }
            if !state.browse {
                return Err(ServerError::Forbidden("directory listing disabled".into()));
            }
            Ok(Html(render_listing(&state.index, id)).into_response())
        }
        NodeKind::File(entry) => {
            if trailing_slash {
                return Ok(redirect(uri.path().trim_end_matches('/'), uri.query()));
            }
            serve_file(state, node.name(), entry, headers).await
        }
    }
}

fn redirect(path: &str, query: Option<&str>) -> Response {
    let location = match query {
        Some(q) => format!("{path}?{q}"),
        None => path.to_string(),
    };
    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
}

/// Immediate children, sorted by name, subdirectories with a trailing slash.
fn render_listing(index: &PathIndex, dir: NodeId) -> String {
    let mut children = index.children(dir);
    children.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let mut html = String::from("<!doctype html>\n<meta name=\"viewport\" content=\"width=device-width\">\n<pre>\n");
    for (name, child) in children {
        let suffix = if index.node(child).is_dir() { "/" } else { "" };
        html.push_str(&format!(
            "<a href=\"{}{suffix}\">{}{suffix}</a>\n",
            encode_href(name),
            escape_html(name)
        ));
    }
    html.push_str("</pre>\n");
    html
}

async fn serve_file(
    state: &AppState,
    name: &str,
    entry: &FileEntry,
    headers: &HeaderMap,
) -> Result<Response, ServerError> {
    let size = entry.size;
    let etag = format!("\"{}\"", entry.content_id);
    let last_modified = http_date(entry.modified_at);

    if not_modified(headers, &etag, entry.modified_at) {
        return Ok((
            StatusCode::NOT_MODIFIED,
            [(header::ETAG, etag), (header::LAST_MODIFIED, last_modified)],
        )
            .into_response());
    }

    let range = header_str(headers, header::RANGE)
        .filter(|_| if_range_holds(headers, &etag, entry.modified_at))
        .map_or(ByteRange::Ignored, |value| parse_range(value, size));
    let (status, start, len) = match range {
        ByteRange::Ignored => (StatusCode::OK, 0, size),
        ByteRange::Satisfiable { start, .. } => (StatusCode::PARTIAL_CONTENT, start, range.len()),
        ByteRange::Unsatisfiable => return Err(ServerError::RangeNotSatisfiable(size)),
    };

    let id = entry.content_id.as_str();
    // Buffered bodies report what was actually read; the declared size is advisory.
    let (body, len) = if state.reader.is_large(len) {
        (Body::from_stream(state.reader.stream_range(id, start, len).await?), len)
    } else {
        let data = if status == StatusCode::OK {
            state.reader.read_all(id).await?
        } else {
            state.reader.read_range(id, start, len as usize).await?
        };
        let read = data.len() as u64;
        (Body::from(data), read)
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type(name))
        .header(header::CONTENT_LENGTH, len)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag)
        .header(header::LAST_MODIFIED, last_modified);
    if status == StatusCode::PARTIAL_CONTENT {
        let end = (start + len).saturating_sub(1).max(start);
        response = response.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
    }
    response
        .body(body)
        .map_err(|e| ServerError::Internal(e.to_string()))
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn etag_matches(list: &str, etag: &str) -> bool {
    list.split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || tag.trim_start_matches("W/") == etag)
}

/// `If-None-Match` wins over `If-Modified-Since` when both are present.
fn not_modified(headers: &HeaderMap, etag: &str, mtime: i64) -> bool {
    if let Some(list) = header_str(headers, header::IF_NONE_MATCH) {
        return etag_matches(list, etag);
    }
    header_str(headers, header::IF_MODIFIED_SINCE)
        .and_then(parse_http_date)
        .is_some_and(|since| mtime <= since)
}

fn if_range_holds(headers: &HeaderMap, etag: &str, mtime: i64) -> bool {
    match header_str(headers, header::IF_RANGE) {
        None => true,
        Some(value) if value.starts_with('"') || value.starts_with("W/") => value == etag,
        Some(value) => parse_http_date(value) == Some(mtime),
    }
}

fn content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "pdf" => "application/pdf",
        "txt" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        _ => "application/octet-stream",
    }
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&#34;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Percent-encode a path segment for use in an href.
fn encode_href(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hrefs_and_text_are_escaped() {
        assert_eq!(encode_href("a b&c.mkv"), "a%20b%26c.mkv");
        assert_eq!(escape_html("<x & y>"), "&lt;x &amp; y&gt;");
    }

    #[test]
    fn etag_lists() {
        assert!(etag_matches("\"a\", \"b\"", "\"b\""));
        assert!(etag_matches("W/\"b\"", "\"b\""));
        assert!(etag_matches("*", "\"b\""));
        assert!(!etag_matches("\"a\"", "\"b\""));
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type("Movie.MKV"), "video/x-matroska");
        assert_eq!(content_type("README"), "application/octet-stream");
    }
}
