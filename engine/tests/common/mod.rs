//! Helpers shared by the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use engine::{
    Key, KeyRange, ReadRequest, ReadResponse, Signal, SindexHit, SindexQuery, Store, Timestamp,
    WriteRequest,
};

pub fn k(n: u64) -> Key {
    Key::from_u64(n)
}

/// A row value whose first two bytes are `bucket`, as read by
/// `FieldExtractor::definition(0, 2)`.
pub fn row(bucket: u64, n: u64) -> Vec<u8> {
    format!("{:02}:{n}", bucket % 100).into_bytes()
}

pub async fn set(store: &Store, n: u64, value: Vec<u8>, ts: u64) {
    store
        .write(
            store.order_token(),
            WriteRequest::Set { key: k(n), value },
            Timestamp(ts),
            &Signal::never(),
        )
        .await
        .expect("set");
}

pub async fn delete(store: &Store, n: u64, ts: u64) {
    store
        .write(
            store.order_token(),
            WriteRequest::Delete { key: k(n) },
            Timestamp(ts),
            &Signal::never(),
        )
        .await
        .expect("delete");
}

/// Every primary row as `(key, value)`, in key order.
pub async fn rows(store: &Store) -> Vec<(Key, Vec<u8>)> {
    let response = store
        .read(
            store.order_token(),
            ReadRequest::Range(KeyRange::universe()),
            &Signal::never(),
        )
        .await
        .expect("range read");
    let ReadResponse::Rows(rows) = response else {
        panic!("expected rows, got {response:?}");
    };
    rows.into_iter().map(|row| (row.key, row.value)).collect()
}

/// Every entry of the ready index `name`.
pub async fn index_hits(store: &Store, name: &str) -> Vec<SindexHit> {
    let response = store
        .read(
            store.order_token(),
            ReadRequest::Sindex {
                name: name.to_string(),
                query: SindexQuery::All,
            },
            &Signal::never(),
        )
        .await
        .expect("index read");
    let ReadResponse::Sindex(hits) = response else {
        panic!("expected index hits, got {response:?}");
    };
    hits
}

/// The index entries `rows` should produce under a two-byte prefix index.
///
/// All test keys have the same length, so index order is secondary value
/// then primary key.
pub fn expected_hits(rows: &[(Key, Vec<u8>)]) -> Vec<SindexHit> {
    let mut hits: Vec<SindexHit> = rows
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| SindexHit {
            secondary: value[..value.len().min(2)].to_vec(),
            primary: key.clone(),
            value: value.clone(),
        })
        .collect();
    hits.sort_by(|a, b| (&a.secondary, &a.primary).cmp(&(&b.secondary, &b.primary)));
    hits
}

/// Poll `done` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, mut done: impl AsyncFnMut() -> bool) {
    let poll = async {
        while !done().await {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}
