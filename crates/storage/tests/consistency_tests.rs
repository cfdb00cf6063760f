// Consistency tests for concurrent writers and readers on the same key.
// Readers must only ever observe complete blobs.

use bytes::Bytes;
use quarry_storage::{ContentStore, FilesystemBackend};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;

const KEY: &str = "com/example/lib/1.0-SNAPSHOT/maven-metadata.xml";

fn blob(tag: u8, len: usize) -> Bytes {
    Bytes::from(vec![tag; len])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_last_rename_wins() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());

    let mut handles = Vec::new();
    for tag in 0..16u8 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            backend.put(KEY, blob(tag, 256 * 1024)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // Whatever won, the blob is one writer's complete payload.
    let data = backend.get(KEY).await.unwrap();
    assert_eq!(data.len(), 256 * 1024);
    let distinct: HashSet<u8> = data.iter().copied().collect();
    assert_eq!(distinct.len(), 1, "blob mixes bytes from several writers");

    // No temp files survive a burst of writes.
    assert_eq!(backend.list("").await.unwrap(), vec![KEY.to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_partial_blobs() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());
    backend.put(KEY, blob(0, 128 * 1024)).await.unwrap();

    let writer = {
        let backend = backend.clone();
        tokio::spawn(async move {
            for tag in 1..=32u8 {
                backend.put(KEY, blob(tag, 128 * 1024)).await.unwrap();
            }
        })
    };

    let reader = {
        let backend = backend.clone();
        tokio::spawn(async move {
            let mut reads = 0;
            while reads < 200 {
                let data = backend.get(KEY).await.unwrap();
                assert_eq!(data.len(), 128 * 1024, "observed a truncated blob");
                let first = data[0];
                assert!(data.iter().all(|b| *b == first), "observed a mixed blob");
                reads += 1;
            }
        })
    };

    let (w, r) = tokio::join!(writer, reader);
    w.unwrap();
    r.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_survives_concurrent_sibling_delete() {
    let temp_dir = TempDir::new().unwrap();
    let backend = Arc::new(FilesystemBackend::new(temp_dir.path()).await.unwrap());

    for i in 0..500 {
        let jar = format!("g/a/{i}/a-{i}.jar");
        let pom = format!("g/a/{i}/a-{i}.pom");
        backend.put(&jar, blob(1, 64)).await.unwrap();

        let deleter = {
            let backend = backend.clone();
            tokio::spawn(async move { backend.delete(&jar).await })
        };
        let writer = {
            let backend = backend.clone();
            let pom = pom.clone();
            tokio::spawn(async move { backend.put(&pom, blob(2, 64)).await })
        };

        deleter.await.unwrap().unwrap();
        writer
            .await
            .unwrap()
            .unwrap_or_else(|e| panic!("put of {pom} failed beside a delete: {e}"));
        assert_eq!(backend.get(&pom).await.unwrap(), blob(2, 64));
    }
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    backend.put(KEY, Bytes::from("meta")).await.unwrap();
    backend.delete(KEY).await.unwrap();

    assert!(!backend.exists(KEY).await.unwrap());
    assert!(matches!(
        backend.get(KEY).await,
        Err(quarry_storage::StorageError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_binary_roundtrip_is_exact() {
    let temp_dir = TempDir::new().unwrap();
    let backend = FilesystemBackend::new(temp_dir.path()).await.unwrap();

    let data: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();
    backend
        .put("g/a/1/a-1.jar", Bytes::from(data.clone()))
        .await
        .unwrap();
    assert_eq!(backend.get("g/a/1/a-1.jar").await.unwrap().to_vec(), data);
}
