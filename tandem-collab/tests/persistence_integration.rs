//! Sessions backed by RocksDB: history survives a restart.

use std::sync::Arc;

use tandem_collab::{
    DocumentRegistry, DocumentStorage, DocumentStore, SessionConfig, StoreConfig,
};
use tandem_core::{Edit, Snapshot};
use tempfile::TempDir;
use tokio::time::Duration;
use uuid::Uuid;

fn open_store(dir: &TempDir) -> Arc<DocumentStore> {
    Arc::new(DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap())
}

fn config() -> SessionConfig {
    SessionConfig {
        idle_close_after: Duration::from_secs(10),
        ..SessionConfig::for_testing()
    }
}

#[tokio::test]
async fn test_close_and_reopen_restores_text_and_revision() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();

    {
        let store = open_store(&dir);
        let registry = DocumentRegistry::new(store.clone(), config());
        registry
            .submit_operation(doc_id, Edit::insert(0, "Hello"), 0, "alice".into())
            .await
            .unwrap();
        registry
            .submit_operation(doc_id, Edit::insert(5, " world"), 1, "bob".into())
            .await
            .unwrap();
        registry
            .submit_operation(doc_id, Edit::delete(0, 1), 1, "carol".into())
            .await
            .unwrap();
        registry.close_all().await;

        let meta = store.load_metadata(doc_id).unwrap().unwrap();
        assert_eq!(meta.snapshot_revision, 3);
        assert_eq!(meta.last_revision, 3);
    }

    let store = open_store(&dir);
    assert_eq!(store.list_documents().unwrap(), vec![doc_id]);
    let registry = DocumentRegistry::new(store, config());
    let snapshot = registry.snapshot(doc_id).await.unwrap();
    assert_eq!(snapshot.text, "ello world");
    assert_eq!(snapshot.revision, 3);

    let next = registry
        .submit_operation(doc_id, Edit::insert(0, "H"), 3, "alice".into())
        .await
        .unwrap();
    assert_eq!(next.revision, 4);
    registry.close_all().await;
}

#[tokio::test]
async fn test_operations_are_replayed_when_no_snapshot_was_saved() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let store = open_store(&dir);

    let registry = DocumentRegistry::new(store.clone(), config());
    for (i, word) in ["one", " two", " three"].iter().enumerate() {
        let at = registry.snapshot(doc_id).await.unwrap().text.chars().count();
        registry
            .submit_operation(doc_id, Edit::insert(at, *word), i as u64, "alice".into())
            .await
            .unwrap();
    }

    let handle = registry.get_or_open(doc_id).await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while handle.stats().await.unwrap().durable_revision < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Read straight from storage, as a restarted process would.
    let stored = store.load_document(doc_id).unwrap();
    assert_eq!(stored.snapshot.revision, 0);
    assert_eq!(stored.operations.len(), 3);
    assert_eq!(stored.last_persisted_revision(), 3);

    let mut text = tandem_core::DocumentText::new();
    for op in &stored.operations {
        text.apply(op.edit()).unwrap();
    }
    assert_eq!(text.to_string(), "one two three");
    registry.close_all().await;
}

#[tokio::test]
async fn test_snapshot_compacts_stored_operations() {
    let dir = TempDir::new().unwrap();
    let doc_id = Uuid::new_v4();
    let store = open_store(&dir);

    let registry = DocumentRegistry::new(store.clone(), config());
    for i in 0..10 {
        registry
            .submit_operation(doc_id, Edit::insert(0, "x"), i, "alice".into())
            .await
            .unwrap();
    }
    registry.close_all().await;

    let stored = store.load_document(doc_id).unwrap();
    assert_eq!(
        stored.snapshot,
        Snapshot {
            text: "x".repeat(10),
            revision: 10,
        }
    );
    assert!(stored.operations.is_empty());
}

#[tokio::test]
async fn test_unknown_document_opens_empty() {
    let dir = TempDir::new().unwrap();
    let registry = DocumentRegistry::new(open_store(&dir), config());
    let snapshot = registry.snapshot(Uuid::new_v4()).await.unwrap();
    assert_eq!(snapshot.text, "");
    assert_eq!(snapshot.revision, 0);
    registry.close_all().await;
}
