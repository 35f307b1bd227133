//! End-to-end page history tests: divergence and merge resolution.

use std::sync::Arc;

use folio_core::{
    CommitGraph, Journal, LastOneWinsStrategy, MemoryDb, MergeOutcome, ObjectPriority, ObjectStore,
    PageDb, PageId, PageMergeResolver, PageTree,
};

async fn setup() -> (Arc<CommitGraph>, Arc<ObjectStore>) {
    let db: Arc<dyn PageDb> = Arc::new(MemoryDb::new());
    let objects = Arc::new(ObjectStore::new(db.clone()));
    let graph = Arc::new(CommitGraph::open(db, &objects).await.unwrap());
    (graph, objects)
}

async fn read_key(graph: &CommitGraph, objects: &ObjectStore, key: &[u8]) -> Vec<u8> {
    let head = graph.heads().await[0].0;
    let commit = graph.get_commit(&head).await.unwrap();
    let tree = PageTree::load(objects, &commit.root).await.unwrap();
    let entry = tree.get(key).unwrap();
    objects.read(&entry.object).await.unwrap().to_vec()
}

#[tokio::test]
async fn test_stale_base_commit_diverges_then_merges() {
    let (graph, objects) = setup().await;

    // Put("k","v1") -> Commit.
    let mut j1 = Journal::new_simple(graph.clone(), objects.clone(), graph.genesis());
    j1.put_bytes(b"k".to_vec(), b"v1", ObjectPriority::Eager)
        .await
        .unwrap();
    j1.commit().await.unwrap();

    // Put("k","v2") -> Commit from the stale genesis base.
    let mut j2 = Journal::new_simple(graph.clone(), objects.clone(), graph.genesis());
    j2.put_bytes(b"k".to_vec(), b"v2", ObjectPriority::Eager)
        .await
        .unwrap();
    j2.commit().await.unwrap();

    // Two heads now exist.
    assert_eq!(graph.head_count().await, 2);
    let heads_before = graph.heads().await;

    // Resolve: a single head remains whose parents are the two prior
    // heads in timestamp order.
    let resolver = PageMergeResolver::new(
        PageId::new([1; 16]),
        graph.clone(),
        objects.clone(),
        Arc::new(LastOneWinsStrategy),
    );
    let outcome = resolver.merge_once().await.unwrap();
    let merged_id = match outcome {
        MergeOutcome::Merged(id) => id,
        other => panic!("Expected a merge, got {:?}", other),
    };

    assert_eq!(graph.head_count().await, 1);
    let merged = graph.get_commit(&merged_id).await.unwrap();
    assert_eq!(merged.parents.len(), 2);
    assert_eq!(merged.parents[0], heads_before[0].0);
    assert_eq!(merged.parents[1], heads_before[1].0);

    // Last-one-wins resolves "k" to the newer head's value.
    let newer = graph.get_commit(&heads_before[1].0).await.unwrap();
    let newer_tree = PageTree::load(&objects, &newer.root).await.unwrap();
    let expected = objects
        .read(&newer_tree.get(b"k").unwrap().object)
        .await
        .unwrap();
    assert_eq!(read_key(&graph, &objects, b"k").await, expected.to_vec());
}

#[tokio::test]
async fn test_linear_history_stays_single_headed() {
    let (graph, objects) = setup().await;
    let mut base = graph.genesis();
    for i in 0..5u8 {
        let mut journal = Journal::new_simple(graph.clone(), objects.clone(), base);
        journal
            .put_bytes(b"counter".to_vec(), &[i], ObjectPriority::Eager)
            .await
            .unwrap();
        base = journal.commit().await.unwrap();
        assert_eq!(graph.head_count().await, 1);
    }
    assert_eq!(read_key(&graph, &objects, b"counter").await, vec![4]);
}
