// Atomic document delete under fault injection: a failing index removal
// must leave the database rows and index entries untouched.

mod common;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::TestWorld;
use ragdb::contracts::{DualIndex, IndexEntry, IndexFilter, IndexHit};
use ragdb::{delete_document, index_name_for, BlobStore, MetadataStore};

/// DualIndex wrapper whose delete_by_filter can be made to fail.
struct FlakyIndex {
    inner: Arc<dyn DualIndex>,
    fail_deletes: AtomicBool,
}

impl FlakyIndex {
    fn new(inner: Arc<dyn DualIndex>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            fail_deletes: AtomicBool::new(false),
        })
    }

    fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DualIndex for FlakyIndex {
    async fn ensure_index(&self, name: &str, dim: usize) -> Result<()> {
        self.inner.ensure_index(name, dim).await
    }

    async fn bulk_upsert(&self, name: &str, entries: Vec<IndexEntry>) -> Result<Vec<String>> {
        self.inner.bulk_upsert(name, entries).await
    }

    async fn delete_by_filter(&self, name: &str, filter: &IndexFilter) -> Result<usize> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(anyhow!("injected index failure"));
        }
        self.inner.delete_by_filter(name, filter).await
    }

    async fn drop_index(&self, name: &str) -> Result<()> {
        self.inner.drop_index(name).await
    }

    async fn knn(
        &self,
        names: &[String],
        vector: &[f32],
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>> {
        self.inner.knn(names, vector, k, filter).await
    }

    async fn bm25(
        &self,
        names: &[String],
        query: &str,
        k: usize,
        filter: Option<&IndexFilter>,
    ) -> Result<Vec<IndexHit>> {
        self.inner.bm25(names, query, k, filter).await
    }
}

#[tokio::test]
async fn test_delete_is_atomic_under_index_failure() -> Result<()> {
    let world = TestWorld::new().await?;
    let kb = world.create_kb("docs").await?;

    // Three paragraphs chunk into three parents worth of entries.
    let content = "First fact paragraph.\n\nSecond fact paragraph.\n\nThird fact paragraph.";
    let doc = world.ingest(&kb, "facts.txt", content).await?;
    let chunk_count = world.store.count_chunks(doc.id).await?;
    assert!(chunk_count > 0);

    let flaky: Arc<FlakyIndex> = FlakyIndex::new(world.index.clone());
    let flaky_dyn: Arc<dyn DualIndex> = flaky.clone();

    // Inject the failure: the delete must error and mutate nothing.
    flaky.set_fail_deletes(true);
    let err = delete_document(&world.store, &world.blobs, &flaky_dyn, doc.id)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("INDEX_WRITE_FAILED"));

    let still = world.store.get_document(doc.id).await?;
    assert!(still.is_some(), "document row untouched");
    assert_eq!(world.store.count_chunks(doc.id).await?, chunk_count);
    let index_entries = world
        .index
        .bm25(
            &[index_name_for(kb.id)],
            "fact paragraph",
            100,
            Some(&IndexFilter::DocId(doc.id)),
        )
        .await?;
    assert_eq!(index_entries.len(), chunk_count, "index entries untouched");
    assert!(world.blobs.exists(&still.unwrap().blob_path).await?);

    // Heal the index and delete for real: everything goes, in order.
    flaky.set_fail_deletes(false);
    delete_document(&world.store, &world.blobs, &flaky_dyn, doc.id).await?;

    assert!(world.store.get_document(doc.id).await?.is_none());
    assert_eq!(world.store.count_chunks(doc.id).await?, 0);
    let remaining = world
        .index
        .bm25(
            &[index_name_for(kb.id)],
            "fact paragraph",
            100,
            Some(&IndexFilter::DocId(doc.id)),
        )
        .await?;
    assert!(remaining.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delete_missing_document_is_not_found() -> Result<()> {
    let world = TestWorld::new().await?;
    let err = delete_document(&world.store, &world.blobs, &world.index, 9999)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("NOT_FOUND"));
    Ok(())
}
