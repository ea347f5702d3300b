#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::collections::BTreeMap;
use std::sync::Arc;

use engine::{
    BlockCache, ChunkBuffer, FieldExtractor, Key, KeyRange, ReadRequest, ReadResponse, Signal,
    SindexQuery, Store, StoreConfig, StoreError, Timestamp, WriteRequest,
};

const ROWS: u64 = 500;

#[tokio::main]
async fn main() {
    engine::telemetry::init_tracing("engine=info,store_check=info");

    // Load configuration from environment variables
    let config = match StoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Loaded configuration: max_leaf_bytes={}, max_internal_children={}, backfill_batch_size={}",
        config.max_leaf_bytes,
        config.max_internal_children,
        config.backfill_batch_size
    );

    if let Err(e) = run(config).await {
        tracing::error!("Store check failed: {e}");
        std::process::exit(1);
    }
}

/// Write rows, build an index over them, and replicate the store into a
/// second one through a backfill.
async fn run(config: StoreConfig) -> Result<(), StoreError> {
    let never = Signal::never();
    let source = Store::create(BlockCache::new(), config.clone(), Arc::new(FieldExtractor)).await?;

    for n in 0..ROWS {
        let value = format!("{:02}-row-{n}", n % 10).into_bytes();
        source
            .write(
                source.order_token(),
                WriteRequest::Set {
                    key: Key::from_u64(n),
                    value,
                },
                Timestamp(n + 1),
                &never,
            )
            .await?;
    }

    let id = source
        .add_sindex("bucket", FieldExtractor::definition(0, 2))
        .await?;
    source.post_construct_secondary_indexes(&[id], &never).await?;
    let status = source.sindex_status("bucket").await?;
    tracing::info!(state = ?status.state, entries = status.entries, "index built");

    let hits = match source
        .read(
            source.order_token(),
            ReadRequest::Sindex {
                name: "bucket".to_string(),
                query: SindexQuery::Equal(b"07".to_vec()),
            },
            &never,
        )
        .await?
    {
        ReadResponse::Sindex(hits) => hits.len(),
        _ => 0,
    };
    tracing::info!(hits, "index lookup");

    let mut buffer = ChunkBuffer::default();
    let stats = source
        .send_backfill(
            source.order_token(),
            &KeyRange::universe(),
            Timestamp::DISTANT_PAST,
            &mut buffer,
            &never,
        )
        .await?;
    tracing::info!(
        leaves = stats.leaves_visited,
        pairs = stats.pairs,
        chunks = buffer.chunks.len(),
        "backfill sent"
    );

    let replica = Store::create(BlockCache::new(), config, Arc::new(FieldExtractor)).await?;
    let applied_at = Timestamp(ROWS + 1);
    for chunk in buffer.chunks {
        replica
            .receive_backfill(replica.order_token(), chunk, applied_at, &never)
            .await?;
    }

    let source_rows = rows(&source).await?;
    let replica_rows = rows(&replica).await?;
    let replica_indexes: BTreeMap<_, _> = replica
        .list_sindexes()
        .await?
        .into_iter()
        .map(|(name, status)| (name, status.definition))
        .collect();
    tracing::info!(
        rows = source_rows.len(),
        matches = source_rows == replica_rows,
        replica_indexes = replica_indexes.len(),
        "replica compared"
    );

    source.shutdown().await;
    replica.shutdown().await;
    Ok(())
}

async fn rows(store: &Store) -> Result<Vec<(Key, Vec<u8>)>, StoreError> {
    let response = store
        .read(
            store.order_token(),
            ReadRequest::Range(KeyRange::universe()),
            &Signal::never(),
        )
        .await?;
    Ok(match response {
        ReadResponse::Rows(rows) => rows.into_iter().map(|row| (row.key, row.value)).collect(),
        _ => Vec::new(),
    })
}
