//! Integration tests for the backup engine against an in-memory store.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use dedupfs::{
    backup::{parse_excludes, BackupEngine, PrescanTrust, RetryPolicy, TokenBucket},
    content::ContentId,
    index::{BuildOptions, PathIndex},
    store::{BlobStore, MemoryStore},
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        initial_interval: Duration::from_millis(1),
        max_interval: Duration::from_millis(5),
        multiplier: 2.0,
    }
}

fn engine(store: &MemoryStore) -> BackupEngine {
    BackupEngine::new(Arc::new(store.clone())).with_retry(fast_retry())
}

/// A scratch tree; returns the tempdir and its canonical root.
fn tree(files: &[(&str, &[u8])]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().canonicalize().unwrap();
    for (rel, content) in files {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
    (dir, root)
}

fn path_str(root: &Path, rel: &str) -> String {
    root.join(rel).to_str().unwrap().to_string()
}

// =============================================================================
// Upload and Deduplication Tests
// =============================================================================

#[tokio::test]
async fn test_fresh_upload_records_path() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a/b.txt", b"hello")]);

    let report = engine(&store).run(&[root.clone()]).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.bytes_uploaded, 5);

    let id = ContentId::of_bytes(b"hello");
    assert_eq!(
        id.as_str(),
        "sha256-2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
    );
    let (data, _) = store.get(id.as_str()).expect("object stored");
    assert_eq!(&data[..], b"hello");
    let paths = store.paths(id.as_str()).unwrap();
    assert_eq!(paths.len(), 1);
    assert!(paths.contains_key(&path_str(&root, "a/b.txt")));
    assert_eq!(store.blob_writes(), 1);
    assert_eq!(store.metadata_writes(), 1);

    let index = PathIndex::from_store(&store, BuildOptions::default())
        .await
        .unwrap();
    let entry = index.file(&path_str(&root, "a/b.txt")).unwrap();
    assert_eq!(entry.size, 5);
    assert_eq!(entry.content_id, id);
}

#[tokio::test]
async fn test_duplicate_content_adds_path_without_upload() {
    let store = MemoryStore::new();
    let (_a, first) = tree(&[("a/b.txt", b"hello")]);
    let (_c, second) = tree(&[("c/d.txt", b"hello")]);

    engine(&store).run(&[first.clone()]).await.unwrap();
    let report = engine(&store).run(&[second.clone()]).await.unwrap();

    assert_eq!(report.uploaded, 0);
    assert_eq!(report.merged, 1);
    assert_eq!(store.blob_writes(), 1);
    assert_eq!(store.metadata_writes(), 2);

    let paths = store.paths(ContentId::of_bytes(b"hello").as_str()).unwrap();
    assert!(paths.contains_key(&path_str(&first, "a/b.txt")));
    assert!(paths.contains_key(&path_str(&second, "c/d.txt")));
}

#[tokio::test]
async fn test_identical_files_in_one_tree_share_an_object() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("x/one", b"same bytes"), ("y/two", b"same bytes")]);

    let report = engine(&store).run(&[root.clone()]).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.merged, 1);
    assert_eq!(store.len(), 1);
    let paths = store.paths(ContentId::of_bytes(b"same bytes").as_str()).unwrap();
    assert_eq!(paths.len(), 2);
}

#[tokio::test]
async fn test_second_run_over_unchanged_tree_writes_nothing() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a", b"one"), ("b/c", b"two"), ("b/d", b"three")]);

    engine(&store).run(&[root.clone()]).await.unwrap();
    let (blobs, metas) = (store.blob_writes(), store.metadata_writes());

    let report = engine(&store).run(&[root.clone()]).await.unwrap();
    assert_eq!(report.already_present, 3);
    assert_eq!(report.writes(), 0);
    assert_eq!(store.blob_writes(), blobs);
    assert_eq!(store.metadata_writes(), metas);
}

// =============================================================================
// Prescan Tests
// =============================================================================

#[tokio::test]
async fn test_prescan_skips_unchanged_files_without_hashing() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a", b"one"), ("b", b"two")]);
    engine(&store).run(&[root.clone()]).await.unwrap();

    let prescan = PathIndex::from_store(&store, BuildOptions::default())
        .await
        .unwrap();
    let report = engine(&store)
        .with_prescan(Arc::new(prescan))
        .run(&[root.clone()])
        .await
        .unwrap();
    assert_eq!(report.prescan_skipped, 2);
    assert_eq!(report.already_present, 0);
}

#[tokio::test]
async fn test_untrusted_prescan_still_short_circuits_on_hash() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a", b"one")]);
    engine(&store).run(&[root.clone()]).await.unwrap();

    let prescan = PathIndex::from_store(&store, BuildOptions::default())
        .await
        .unwrap();
    let report = engine(&store)
        .with_prescan(Arc::new(prescan))
        .with_trust(PrescanTrust::Never)
        .run(&[root.clone()])
        .await
        .unwrap();
    assert_eq!(report.prescan_skipped, 1);
    assert_eq!(report.writes(), 0);
}

#[tokio::test]
async fn test_changed_file_with_stale_prescan_is_uploaded() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a", b"one")]);
    engine(&store).run(&[root.clone()]).await.unwrap();
    let prescan = PathIndex::from_store(&store, BuildOptions::default())
        .await
        .unwrap();

    fs::write(root.join("a"), b"something longer").unwrap();
    let report = engine(&store)
        .with_prescan(Arc::new(prescan))
        .run(&[root.clone()])
        .await
        .unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(store.get(ContentId::of_bytes(b"something longer").as_str()).is_some());
}

// =============================================================================
// Walk Filtering Tests
// =============================================================================

#[tokio::test]
async fn test_excluded_files_never_reach_the_store() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("x/y.tmp", b"scratch"), ("x/keep.txt", b"keep")]);

    let report = engine(&store)
        .with_excludes(parse_excludes("\\.tmp$\n").unwrap())
        .run(&[root.clone()])
        .await
        .unwrap();
    assert_eq!(report.excluded, 1);
    assert_eq!(report.uploaded, 1);
    assert!(store.get(ContentId::of_bytes(b"scratch").as_str()).is_none());

    let index = PathIndex::from_store(&store, BuildOptions::default())
        .await
        .unwrap();
    assert!(index.resolve(&path_str(&root, "x/y.tmp")).is_err());
    assert!(index.file(&path_str(&root, "x/keep.txt")).is_some());
}

#[tokio::test]
async fn test_symlinks_and_empty_files_are_skipped() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("real", b"data"), ("empty", b"")]);
    std::os::unix::fs::symlink(root.join("real"), root.join("link")).unwrap();

    let report = engine(&store).run(&[root.clone()]).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.skipped, 2);
    let paths = store.paths(ContentId::of_bytes(b"data").as_str()).unwrap();
    assert_eq!(paths.len(), 1);
}

// =============================================================================
// Failure Handling Tests
// =============================================================================

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("f", b"retry me")]);

    store.fail_next(2);
    let report = engine(&store).run(&[root.clone()]).await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert!(store.paths(ContentId::of_bytes(b"retry me").as_str()).is_some());
}

#[tokio::test]
async fn test_failed_upload_leaves_no_metadata_and_names_the_root() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("f", b"doomed")]);

    store.fail_next(1);
    let err = engine(&store)
        .with_retry(RetryPolicy::none())
        .run(&[root.clone()])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("in walk of"), "{err}");
    assert!(err.is_transient());
    assert!(store.is_empty());
    assert_eq!(store.metadata_writes(), 0);
}

// =============================================================================
// Engine Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_metadata_other_keys_survive_merge() {
    let store = MemoryStore::new();
    let (_a, first) = tree(&[("a", b"shared")]);
    let (_b, second) = tree(&[("b", b"shared")]);
    engine(&store).run(&[first]).await.unwrap();

    let id = ContentId::of_bytes(b"shared");
    let mut meta = store.attrs(id.as_str()).await.unwrap().metadata;
    meta.insert("owner".into(), "backup".into());
    store.update_metadata(id.as_str(), meta).await.unwrap();

    engine(&store).run(&[second]).await.unwrap();
    let (_, meta) = store.get(id.as_str()).unwrap();
    assert_eq!(meta.get("owner").map(String::as_str), Some("backup"));
    assert_eq!(store.paths(id.as_str()).unwrap().len(), 2);
}

#[tokio::test]
async fn test_cancelled_engine_stops() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("a", b"one")]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = engine(&store)
        .with_cancel(cancel)
        .run(&[root])
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_throttled_upload_still_lands() {
    let store = MemoryStore::new();
    let (_dir, root) = tree(&[("big", &[7u8; 4096])]);

    let report = engine(&store)
        .with_throttle(TokenBucket::from_rate(64 * 1024, None))
        .run(&[root])
        .await
        .unwrap();
    assert_eq!(report.bytes_uploaded, 4096);
}

#[tokio::test]
async fn test_missing_root_is_an_error() {
    let store = MemoryStore::new();
    let err = engine(&store)
        .run(&[PathBuf::from("/definitely/not/here")])
        .await
        .unwrap_err();
    assert!(err.to_string().contains("/definitely/not/here"), "{err}");
}
