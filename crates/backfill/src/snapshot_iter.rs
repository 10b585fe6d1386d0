//! Prefix-bounded iteration over a storage snapshot.

use std::sync::Arc;

use anyhow::Result;
use common::{
    codec,
    kv::{
        next_until,
        Priority,
        Store,
        Version,
    },
    Key,
};

use crate::reorg::JobContext;

/// Iterate keys at the fixed read timestamp `version`, invoking `f` once
/// per row.
///
/// Iteration starts at `start_key` (or `key_prefix` when unset) and covers
/// keys up to but not including `end_key.prefix_next()` (or
/// `key_prefix.prefix_next()` when unset), stopping early once a key no
/// longer carries `key_prefix`. When the prefix denotes record keys, the
/// row handle is decoded and passed to `f`; `f` returning `false` stops
/// iteration cleanly. After each row, residual keys prefixed by the row's
/// key (leftover versions of the same row) are skipped.
#[allow(clippy::too_many_arguments)]
pub async fn iterate_snapshot_keys(
    store: &Arc<dyn Store>,
    job_ctx: &JobContext,
    priority: Priority,
    key_prefix: &Key,
    version: Version,
    start_key: &Key,
    end_key: &Key,
    mut f: impl FnMut(Option<i64>, &Key, &[u8]) -> Result<bool> + Send,
) -> Result<()> {
    let is_record = codec::is_record_key(&key_prefix.next());
    let first_key = if start_key.is_empty() {
        key_prefix.clone()
    } else {
        start_key.clone()
    };
    let upper_bound = if end_key.is_empty() {
        key_prefix.prefix_next()
    } else {
        end_key.prefix_next()
    };

    let snapshot = store
        .snapshot(version, job_ctx.snapshot_options(priority))
        .await?;
    let mut it = snapshot.iter(first_key, upper_bound).await?;

    while it.valid() {
        if !it.key().has_prefix(key_prefix) {
            break;
        }
        let handle = if is_record {
            Some(codec::decode_record_handle(it.key())?)
        } else {
            None
        };
        let more = f(handle, it.key(), it.value())?;
        if !more {
            return Ok(());
        }
        let row_key = it.key().clone();
        next_until(it.as_mut(), |k| k.has_prefix(&row_key)).await?;
    }
    Ok(())
}
