use std::path::Path;

use bytes::Bytes;
use siphon_store::{DirHandle, FileHandle, FsDir, StorageResolver, Writable};
use tempfile::tempdir;

fn listing(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(path)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn root_guard_leaves_store_byte_for_byte_intact() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("timeline.db"), b"sqlite pages").unwrap();
    let root = FsDir::open(dir.path()).await.unwrap();
    let resolver = StorageResolver::open(root.clone(), "ingest/bronze", &[])
        .await
        .unwrap();
    let before = listing(dir.path());

    // A misconfigured cleanup that targets the root handle itself.
    let err = resolver.purge(&root).await.unwrap_err();
    assert!(err.is_guard());

    assert_eq!(listing(dir.path()), before);
    assert_eq!(std::fs::read(dir.path().join("timeline.db")).unwrap(), b"sqlite pages");
}

#[tokio::test]
async fn separately_opened_root_handle_is_still_recognised() {
    let dir = tempdir().unwrap();
    let root = FsDir::open(dir.path()).await.unwrap();
    let resolver = StorageResolver::open(root, "ingest", &[]).await.unwrap();

    // Same directory reached through a different path string.
    let alias = FsDir::open(dir.path().join("ingest").join("..")).await.unwrap();
    assert!(resolver.is_protected(&alias));
    assert!(resolver.purge(&alias).await.unwrap_err().is_guard());
}

#[cfg(unix)]
#[tokio::test]
async fn symlinked_working_directory_cannot_alias_the_root() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store");
    std::fs::create_dir(&store).unwrap();
    std::os::unix::fs::symlink(&store, store.join("loop")).unwrap();

    let root = FsDir::open(&store).await.unwrap();
    let err = StorageResolver::open(root, "loop", &[]).await.unwrap_err();
    assert!(err.is_guard());
}

#[tokio::test]
async fn protected_database_directory_survives_working_directory_purge() {
    let dir = tempdir().unwrap();
    let root = FsDir::open(dir.path()).await.unwrap();
    let db = root.get_directory("db", true).await.unwrap();
    let db_file = db.get_file("timeline.db", true).await.unwrap();
    let mut writer = db_file.create_writable().await.unwrap();
    writer.write(Bytes::from_static(b"pages")).await.unwrap();
    writer.close().await.unwrap();

    let resolver = StorageResolver::open(root.clone(), "ingest", &["db".to_string()])
        .await
        .unwrap();
    resolver
        .working_directory()
        .get_file("stale___file.json", true)
        .await
        .unwrap();

    assert_eq!(resolver.clear_working_directory().await.unwrap(), 1);
    assert!(resolver.working_directory().entries().await.unwrap().is_empty());
    assert!(resolver.remove_directory(&root, "db").await.unwrap_err().is_guard());
    assert_eq!(db_file.size().await.unwrap(), 5);
}

#[tokio::test]
async fn protected_file_path_opens_and_is_never_purged() {
    let dir = tempdir().unwrap();
    std::fs::create_dir(dir.path().join("ingest")).unwrap();
    std::fs::write(dir.path().join("ingest/forensics.db"), b"case notes").unwrap();
    std::fs::write(dir.path().join("ingest/stale.json"), b"{}").unwrap();
    let root = FsDir::open(dir.path()).await.unwrap();

    let resolver = StorageResolver::open(root.clone(), "ingest", &["ingest/forensics.db".to_string()])
        .await
        .unwrap();

    assert!(resolver.clear_working_directory().await.unwrap_err().is_guard());
    assert!(resolver.remove_directory(&root, "ingest").await.unwrap_err().is_guard());
    assert_eq!(
        std::fs::read(dir.path().join("ingest/forensics.db")).unwrap(),
        b"case notes"
    );
}
