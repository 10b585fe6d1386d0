//! Splitting a table key span into storage-aligned sub-ranges.

use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use anyhow::Result;
use common::{
    backoff::Backoff,
    knobs,
    kv::{
        is_retryable,
        Priority,
        Store,
        Version,
    },
    table::PhysicalTable,
    Key,
    KeyRange,
};

use crate::{
    errors::ReorgError,
    reorg::JobContext,
};

const SPLIT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const SPLIT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Split `[start_key, end_key)` on the store's region boundaries, capped at
/// `limit` sub-ranges. Stores without a region map get the single input
/// range back. Transient region-cache failures are retried with backoff for
/// at most `SPLIT_REGION_MAX_BACKOFF` in total.
pub async fn split_table_ranges(
    table: &PhysicalTable,
    store: &Arc<dyn Store>,
    start_key: &Key,
    end_key: &Key,
    limit: usize,
) -> Result<Vec<KeyRange>> {
    tracing::info!(
        physical_table_id = table.physical_id,
        start_key = %start_key,
        end_key = %end_key,
        "splitting table range on region boundaries"
    );
    let range = KeyRange::new(start_key.clone(), end_key.clone());
    let Some(region_cache) = store.region_cache() else {
        return Ok(vec![range]);
    };

    let mut backoff = Backoff::new(SPLIT_RETRY_INITIAL_BACKOFF, SPLIT_RETRY_MAX_BACKOFF);
    let deadline = Instant::now() + *knobs::SPLIT_REGION_MAX_BACKOFF;
    loop {
        match region_cache.split_region_ranges(range.clone(), limit).await {
            Ok(ranges) => {
                if ranges.is_empty() {
                    // The span is addressable but no region covers it: the
                    // region metadata is inconsistent.
                    return Err(ReorgError::InvalidSplitRegionRanges {
                        start: start_key.to_string(),
                        end: end_key.to_string(),
                    }
                    .into());
                }
                return Ok(ranges);
            },
            Err(err) if is_retryable(&err) && Instant::now() < deadline => {
                let delay = backoff.fail(&mut rand::thread_rng());
                tracing::warn!(
                    failures = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    "transient region cache failure while splitting: {err:#}"
                );
                tokio::time::sleep(delay).await;
            },
            Err(err) => return Err(err),
        }
    }
}

/// The largest existing key in `[start_key, end_key]` under `key_prefix`,
/// found with a reverse iterator at the latest version. Used to tighten a
/// region's declared end down to the last real record so workers do not
/// scan empty tail space; falls back to `start_key` when the span holds no
/// such key.
pub async fn range_end_key(
    store: &Arc<dyn Store>,
    job_ctx: &JobContext,
    priority: Priority,
    key_prefix: &Key,
    start_key: &Key,
    end_key: &Key,
) -> Result<Key> {
    let snapshot = store
        .snapshot(Version::MAX, job_ctx.snapshot_options(priority))
        .await?;
    let it = snapshot.iter_reverse(end_key.next()).await?;
    if !it.valid() || !it.key().has_prefix(key_prefix) {
        return Ok(start_key.clone());
    }
    if it.key() < start_key {
        return Ok(start_key.clone());
    }
    Ok(it.key().clone())
}
