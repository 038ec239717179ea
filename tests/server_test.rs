//! Integration tests for the HTTP front end, driven through the router
//! without a socket.

use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use base64::Engine;
use dedupfs::{
    content::ContentId,
    index::PathIndex,
    reader::BlobReader,
    server::{router, AppState, BasicAuth},
    store::{MemoryStore, Metadata},
    util::config::ReadConfig,
};
use http::{header, Request, StatusCode};
use tower::ServiceExt;

const MTIME: i64 = 1_700_000_000;

fn setup_app(browse: bool, auth: Option<BasicAuth>) -> Router {
    let store = MemoryStore::new();
    let mut index = PathIndex::new();
    for (path, content) in [
        ("/movies/b.mkv", &b"0123456789"[..]),
        ("/movies/a.mkv", &b"abc"[..]),
        ("/movies/extras/x.txt", &b"extra"[..]),
        ("/notes & <stuff>.txt", &b"n"[..]),
    ] {
        let id = ContentId::of_bytes(content);
        store.insert(id.as_str(), content, Metadata::new());
        index.insert(path, id, MTIME, content.len() as u64).unwrap();
    }
    let reader = BlobReader::new(Arc::new(store), ReadConfig::new(4, 2, browse).unwrap());
    router(AppState::new(Arc::new(index), reader, browse).with_auth(auth))
}

async fn get(app: Router, uri: &str, headers: &[(header::HeaderName, &str)]) -> axum::response::Response {
    let mut req = Request::builder().uri(uri);
    for (name, value) in headers {
        req = req.header(name, *value);
    }
    app.oneshot(req.body(Body::empty()).unwrap()).await.unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn basic(user: &str, pass: &str) -> String {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
    format!("Basic {token}")
}

// =============================================================================
// Directory Listing Tests
// =============================================================================

#[tokio::test]
async fn test_directory_listing_is_sorted_with_slashes() {
    let response = get(setup_app(true, None), "/movies/", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = body_string(response).await;
    let a = html.find("a.mkv").unwrap();
    let b = html.find("b.mkv").unwrap();
    let extras = html.find("extras/").unwrap();
    assert!(a < b && b < extras, "{html}");
    assert!(html.contains("<a href=\"extras/\">extras/</a>"));
}

#[tokio::test]
async fn test_listing_escapes_names() {
    let html = body_string(get(setup_app(true, None), "/", &[]).await).await;
    assert!(html.contains("href=\"notes%20%26%20%3Cstuff%3E.txt\""), "{html}");
    assert!(html.contains("notes &amp; &lt;stuff&gt;.txt"), "{html}");
    assert!(html.contains("<a href=\"movies/\">movies/</a>"));
}

#[tokio::test]
async fn test_directory_without_slash_redirects() {
    let response = get(setup_app(true, None), "/movies", &[]).await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(response.headers()[header::LOCATION], "/movies/");
}

// =============================================================================
// File Content Tests
// =============================================================================

#[tokio::test]
async fn test_file_is_served_with_validators() {
    let response = get(setup_app(true, None), "/movies/b.mkv", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_LENGTH], "10");
    assert_eq!(headers[header::CONTENT_TYPE], "video/x-matroska");
    assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
    assert_eq!(
        headers[header::ETAG].to_str().unwrap(),
        format!("\"{}\"", ContentId::of_bytes(b"0123456789"))
    );
    assert_eq!(headers[header::LAST_MODIFIED], "Tue, 14 Nov 2023 22:13:20 GMT");
    assert_eq!(body_string(response).await, "0123456789");
}

#[tokio::test]
async fn test_small_file_below_threshold() {
    let response = get(setup_app(true, None), "/movies/a.mkv", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "abc");
}

#[tokio::test]
async fn test_range_requests() {
    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::RANGE, "bytes=2-5")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-5/10");
    assert_eq!(body_string(response).await, "2345");

    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::RANGE, "bytes=-3")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(body_string(response).await, "789");

    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::RANGE, "bytes=50-")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");
}

#[tokio::test]
async fn test_conditional_requests() {
    let etag = format!("\"{}\"", ContentId::of_bytes(b"0123456789"));
    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::IF_NONE_MATCH, etag.as_str())],
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::IF_MODIFIED_SINCE, "Wed, 15 Nov 2023 00:00:00 GMT")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

    let response = get(
        setup_app(true, None),
        "/movies/b.mkv",
        &[(header::IF_MODIFIED_SINCE, "Mon, 13 Nov 2023 00:00:00 GMT")],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_content_length_follows_the_stored_blob() {
    let store = MemoryStore::new();
    let mut index = PathIndex::new();
    let id = ContentId::of_bytes(b"abc");
    store.insert(id.as_str(), &b"abc"[..], Metadata::new());
    // Recorded size is stale: the blob is shorter than the index claims.
    index.insert("/short.txt", id, MTIME, 10).unwrap();
    let reader = BlobReader::new(Arc::new(store), ReadConfig::new(64, 8, true).unwrap());
    let app = router(AppState::new(Arc::new(index), reader, true));

    let response = get(app.clone(), "/short.txt", &[]).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "3");
    assert_eq!(body_string(response).await, "abc");

    let response = get(app, "/short.txt", &[(header::RANGE, "bytes=1-5")]).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "2");
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 1-2/10");
    assert_eq!(body_string(response).await, "bc");
}

// =============================================================================
// Error and Access Control Tests
// =============================================================================

#[tokio::test]
async fn test_missing_paths_are_404() {
    let app = setup_app(true, None);
    let missing = get(app.clone(), "/movies/nope.mkv", &[]).await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    let body = body_string(missing).await;
    assert!(body.starts_with("not found"), "{body}");

    let through_file = get(app, "/movies/a.mkv/below", &[]).await;
    assert_eq!(through_file.status(), StatusCode::NOT_FOUND);
    let body = body_string(through_file).await;
    assert!(body.starts_with("not a directory"), "{body}");
    assert!(body.contains("/movies/a.mkv"), "{body}");
}

#[tokio::test]
async fn test_browse_disabled_forbids_listings_only() {
    let app = setup_app(false, None);
    assert_eq!(get(app.clone(), "/", &[]).await.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        get(app.clone(), "/movies/", &[]).await.status(),
        StatusCode::FORBIDDEN
    );
    assert_eq!(get(app, "/movies/a.mkv", &[]).await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unauthorized_requests_are_challenged_uniformly() {
    let auth = || Some(BasicAuth::new("kodi", "s3cret", "Access to list and stream titles"));

    let existing = get(setup_app(true, auth()), "/movies/a.mkv", &[]).await;
    let missing = get(setup_app(true, auth()), "/no/such/path", &[]).await;
    for response in [&existing, &missing] {
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"Access to list and stream titles\""
        );
    }
    assert_eq!(body_string(existing).await, body_string(missing).await);

    let wrong = basic("kodi", "nope");
    let response = get(
        setup_app(true, auth()),
        "/movies/a.mkv",
        &[(header::AUTHORIZATION, wrong.as_str())],
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let right = basic("kodi", "s3cret");
    let response = get(
        setup_app(true, auth()),
        "/movies/a.mkv",
        &[(header::AUTHORIZATION, right.as_str())],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "abc");
}
