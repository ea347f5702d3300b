mod common;

use std::collections::BTreeMap;

use common::{expected_hits, index_hits, row, rows, set, wait_until};
use engine::sindex::lifecycle::read_map;
use engine::sindex::{SindexError, SindexName};
use engine::storage::Access;
use engine::testing::new_test_store;
use engine::{FieldExtractor, ReadRequest, Signal, SindexQuery, SindexState, StoreError};

fn prefix() -> Vec<u8> {
    FieldExtractor::definition(0, 2)
}

#[tokio::test]
async fn test_create_twice_fails() {
    let store = new_test_store().await;
    let id = store.add_sindex("a", prefix()).await.expect("create");
    let again = store.add_sindex("a", prefix()).await;
    assert_eq!(
        again,
        Err(StoreError::Sindex(SindexError::AlreadyExists("a".to_string())))
    );
    let status = store.sindex_status("a").await.expect("status");
    assert_eq!(status.id, id);
    assert_eq!(status.state, SindexState::Building);
}

#[tokio::test]
async fn test_unknown_index_is_not_found() {
    let store = new_test_store().await;
    let not_found = StoreError::Sindex(SindexError::NotFound("nope".to_string()));
    assert_eq!(store.sindex_status("nope").await.expect_err("status"), not_found);
    assert_eq!(store.mark_index_up_to_date("nope").await, Err(not_found.clone()));
    assert_eq!(store.drop_sindex("nope").await, Err(not_found));
}

#[tokio::test]
async fn test_building_index_is_not_readable() {
    let store = new_test_store().await;
    store.add_sindex("a", prefix()).await.expect("create");
    let result = store
        .read(
            store.order_token(),
            ReadRequest::Sindex {
                name: "a".to_string(),
                query: SindexQuery::All,
            },
            &Signal::never(),
        )
        .await;
    assert_eq!(
        result,
        Err(StoreError::Sindex(SindexError::NotReady("a".to_string())))
    );

    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    let write = store.acquire_sindex_superblock_for_write(&sindex_block, "a").await;
    assert!(matches!(
        write,
        Err(StoreError::Sindex(SindexError::NotReady(_)))
    ));
}

#[tokio::test]
async fn test_post_construction_fills_index() {
    let store = new_test_store().await;
    for n in 0..120 {
        set(&store, n, row(n % 7, n), n + 1).await;
    }
    let id = store.add_sindex("bucket", prefix()).await.expect("create");
    store
        .post_construct_secondary_indexes(&[id], &Signal::never())
        .await
        .expect("build");

    let status = store.sindex_status("bucket").await.expect("status");
    assert_eq!(status.state, SindexState::Ready);
    assert_eq!(status.entries, 120);
    assert_eq!(index_hits(&store, "bucket").await, expected_hits(&rows(&store).await));

    // Ready indexes follow later writes.
    set(&store, 3, row(42, 3), 500).await;
    common::delete(&store, 4, 501).await;
    assert_eq!(index_hits(&store, "bucket").await, expected_hits(&rows(&store).await));
    assert_eq!(store.sindex_status("bucket").await.expect("status").entries, 119);
    assert_eq!(store.cache().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_equal_query_selects_one_secondary_value() {
    let store = new_test_store().await;
    for n in 0..30 {
        set(&store, n, row(n % 3, n), n + 1).await;
    }
    let id = store.add_sindex("bucket", prefix()).await.expect("create");
    store
        .post_construct_secondary_indexes(&[id], &Signal::never())
        .await
        .expect("build");
    let response = store
        .read(
            store.order_token(),
            ReadRequest::Sindex {
                name: "bucket".to_string(),
                query: SindexQuery::Equal(b"01".to_vec()),
            },
            &Signal::never(),
        )
        .await
        .expect("read");
    let engine::ReadResponse::Sindex(hits) = response else {
        panic!("expected hits, got {response:?}");
    };
    assert_eq!(hits.len(), 10);
    assert!(hits.iter().all(|hit| hit.secondary == b"01"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_writes_during_build_reach_index() {
    let store = new_test_store().await;
    for n in 0..300 {
        set(&store, n, row(n % 5, n), n + 1).await;
    }
    let id = store.add_sindex("bucket", prefix()).await.expect("create");

    let writer = {
        let store = std::sync::Arc::clone(&store);
        tokio::spawn(async move {
            for n in 0..300 {
                if n % 4 == 0 {
                    common::delete(&store, n, 1000 + n).await;
                } else {
                    set(&store, n, row(n % 9, n), 1000 + n).await;
                }
            }
        })
    };
    store
        .post_construct_secondary_indexes(&[id], &Signal::never())
        .await
        .expect("build");
    writer.await.expect("writer");

    assert_eq!(index_hits(&store, "bucket").await, expected_hits(&rows(&store).await));
}

/// An index dropped before its build finishes disappears by name at once
/// and is cleared in the background.
#[tokio::test]
async fn test_drop_before_build_completes() {
    let store = new_test_store().await;
    for n in 0..20 {
        set(&store, n, row(n, n), n + 1).await;
    }
    let id = store.add_sindex("b", prefix()).await.expect("create");
    let superblock = {
        let sindex_block = store
            .cache()
            .acquire(store.sindex_block_id(), Access::Read)
            .await
            .expect("sindex block");
        let map = read_map(&sindex_block).expect("map");
        map.find_by_id(id).expect("record").1.superblock
    };
    // Holding the index superblock keeps the clear from finishing.
    let pin = store
        .cache()
        .acquire(superblock, Access::Read)
        .await
        .expect("index superblock");

    store.drop_sindex("b").await.expect("drop");
    let not_found = StoreError::Sindex(SindexError::NotFound("b".to_string()));
    assert_eq!(store.sindex_status("b").await.expect_err("dropped"), not_found);
    assert_eq!(store.slice_count(), 1);
    {
        let sindex_block = store
            .cache()
            .acquire(store.sindex_block_id(), Access::Read)
            .await
            .expect("sindex block");
        let lookup = store.acquire_sindex_superblock_for_read(&sindex_block, "b").await;
        assert_eq!(lookup.map(|_| ()), Err(not_found.clone()));
    }

    drop(pin);
    wait_until("clear", async || store.slice_count() == 0).await;
    assert_eq!(store.sindex_status("b").await.expect_err("cleared"), not_found);
    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    assert!(read_map(&sindex_block).expect("map").is_empty());
    drop(sindex_block);

    // Building a cleared index does nothing.
    store
        .post_construct_secondary_indexes(&[id], &Signal::never())
        .await
        .expect("build");
    assert_eq!(store.cache().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_name_reusable_while_old_index_clears() {
    let store = new_test_store().await;
    let old = store.add_sindex("b", prefix()).await.expect("create");
    store.drop_sindex("b").await.expect("drop");
    let new = store.add_sindex("b", prefix()).await.expect("recreate");
    assert_ne!(old, new);
    assert_eq!(store.sindex_status("b").await.expect("status").id, new);
    wait_until("clear", async || store.slice_count() == 1).await;
}

#[tokio::test]
async fn test_set_sindexes_reconciles() {
    let store = new_test_store().await;
    let a = store.add_sindex("a", prefix()).await.expect("create a");
    let b = store.add_sindex("b", prefix()).await.expect("create b");
    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    let b_root = read_map(&sindex_block)
        .expect("map")
        .find_by_id(b)
        .expect("b")
        .1
        .superblock;
    drop(sindex_block);
    let pin = store
        .cache()
        .acquire(b_root, Access::Read)
        .await
        .expect("b superblock");

    let desired = BTreeMap::from([
        ("a".to_string(), prefix()),
        ("c".to_string(), FieldExtractor::definition(1, 1)),
    ]);
    let created = store.set_sindexes(&desired).await.expect("reconcile");
    assert_eq!(created.len(), 1);

    let live = store.list_sindexes().await.expect("list");
    assert_eq!(live.keys().collect::<Vec<_>>(), vec!["a", "c"]);
    assert_eq!(live["a"].id, a);
    assert_eq!(live["c"].id, created[0]);

    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    let map = read_map(&sindex_block).expect("map");
    let (name, record) = map.find_by_id(b).expect("b is still recorded");
    assert_eq!(*name, SindexName::Deleted(b));
    assert!(record.being_deleted);
    assert_eq!(record.state(), SindexState::Deleting);
    drop(sindex_block);

    drop(pin);
    wait_until("clear of b", async || store.slice_count() == 2).await;
}

#[tokio::test]
async fn test_mark_deleted_then_clear_explicitly() {
    let store = new_test_store().await;
    store.add_sindex("a", prefix()).await.expect("create");
    let id = store.mark_secondary_index_deleted("a").await.expect("mark");
    assert!(store.sindex_status("a").await.is_err());
    assert_eq!(store.slice_count(), 1);

    store.clear_sindex(id, &Signal::never()).await.expect("clear");
    assert_eq!(store.slice_count(), 0);
    // A second clear finds nothing to do.
    store.clear_sindex(id, &Signal::never()).await.expect("clear again");
    assert_eq!(store.cache().stats().outstanding(), 0);
}

/// Lookups through `acquire_sindex_superblock_for_read` succeed once `name`
/// is ready.
async fn readable(store: &engine::Store, name: &str) -> Result<(), StoreError> {
    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    store
        .acquire_sindex_superblock_for_read(&sindex_block, name)
        .await
        .map(drop)
}

#[tokio::test]
async fn test_mark_ready_by_name() {
    let store = new_test_store().await;
    store.add_sindex("a", prefix()).await.expect("create");
    assert_eq!(
        readable(&store, "a").await,
        Err(StoreError::Sindex(SindexError::NotReady("a".to_string())))
    );

    store.mark_index_up_to_date("a").await.expect("mark");
    assert_eq!(readable(&store, "a").await, Ok(()));
    assert_eq!(store.sindex_status("a").await.expect("status").state, SindexState::Ready);
}

#[tokio::test]
async fn test_mark_ready_by_id() {
    let store = new_test_store().await;
    let id = store.add_sindex("a", prefix()).await.expect("create");
    store.mark_index_up_to_date_by_id(id).await.expect("mark");
    assert_eq!(readable(&store, "a").await, Ok(()));
    assert_eq!(store.sindex_status("a").await.expect("status").state, SindexState::Ready);
}

#[tokio::test]
async fn test_mark_dropped_index_by_id_is_not_found() {
    let store = new_test_store().await;
    let id = store.add_sindex("a", prefix()).await.expect("create");
    store.mark_secondary_index_deleted("a").await.expect("mark deleted");

    assert_eq!(
        store.mark_index_up_to_date_by_id(id).await,
        Err(StoreError::Sindex(SindexError::NotFound(id.to_string())))
    );
    let sindex_block = store
        .cache()
        .acquire(store.sindex_block_id(), Access::Read)
        .await
        .expect("sindex block");
    let map = read_map(&sindex_block).expect("map");
    let (_, record) = map.find_by_id(id).expect("still recorded");
    assert_eq!(record.state(), SindexState::Deleting);
    assert!(!record.post_construction_complete());
}
