//! Row processors, one per backfill kind.
//!
//! Every processor follows the same batch shape: snapshot-read at most
//! `batch_cnt` entries starting at the task's current start key, derive
//! mutations, commit them in one transaction (retrying transient commit
//! errors internally), and report the first unprocessed key.

pub mod add_index;
pub mod cleanup_index;
pub mod merge_temp_index;
pub mod reorg_partition;
pub mod update_column;

use std::{
    sync::Arc,
    time::{
        Duration,
        UNIX_EPOCH,
    },
};

use anyhow::{
    Context,
    Result,
};
use common::{
    backoff::Backoff,
    kv::{
        is_retryable,
        Mutation,
    },
    Key,
};

use crate::{
    backfiller::{
        Backfiller,
        BackfillContext,
    },
    reorg::ReorgInfo,
    snapshot_iter::iterate_snapshot_keys,
    task::BackfillTask,
};

const COMMIT_RETRY_LIMIT: u32 = 4;
const COMMIT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const COMMIT_RETRY_MAX_BACKOFF: Duration = Duration::from_millis(500);

/// Build the row processor for `reorg.kind`.
pub fn new_backfiller(ctx: BackfillContext, reorg: &ReorgInfo) -> Result<Box<dyn Backfiller>> {
    use crate::task::BackfillKind::*;
    let backfiller: Box<dyn Backfiller> = match reorg.kind {
        AddIndex => {
            let index = reorg.index_info.context("add index requires index info")?;
            Box::new(add_index::AddIndexBackfiller::new(ctx, index))
        },
        UpdateColumn => {
            let change = reorg
                .column_change
                .context("update column requires a column change")?;
            let converter = reorg
                .column_converter
                .clone()
                .unwrap_or_else(|| Arc::new(update_column::SameTypeConverter));
            Box::new(update_column::UpdateColumnBackfiller::new(
                ctx, change, converter,
            ))
        },
        CleanupGlobalIndex => Box::new(cleanup_index::CleanupIndexBackfiller::new(
            ctx,
            reorg.element.id,
            reorg.dropped_partition_ids.clone(),
        )),
        MergeTempIndex => {
            let temp_index_id = reorg
                .temp_index_id
                .context("merge requires a temporary index id")?;
            Box::new(merge_temp_index::MergeTempIndexBackfiller::new(
                ctx,
                reorg.element.id,
                temp_index_id,
            ))
        },
        ReorgPartition => {
            let dest_physical_id = reorg
                .dest_physical_id
                .context("reorganize partition requires a destination")?;
            Box::new(reorg_partition::ReorgPartitionBackfiller::new(
                ctx,
                dest_physical_id,
            ))
        },
    };
    Ok(backfiller)
}

/// One batch worth of snapshot entries under `key_prefix`.
pub(crate) struct FetchedEntries {
    /// `(handle, key, value)`; the handle is decoded for record keys only.
    pub entries: Vec<(Option<i64>, Key, Vec<u8>)>,
    /// First key not fetched: the batch's resume point.
    pub next_key: Key,
    /// The task's range is exhausted.
    pub done: bool,
}

pub(crate) async fn fetch_entries(
    ctx: &BackfillContext,
    task: &BackfillTask,
    key_prefix: &Key,
) -> Result<FetchedEntries> {
    let batch_cnt = ctx.batch_cnt;
    let excluded_end = task.excluded_end_key();
    let mut entries: Vec<(Option<i64>, Key, Vec<u8>)> = Vec::with_capacity(batch_cnt);
    let mut task_done = false;
    iterate_snapshot_keys(
        &ctx.store,
        &ctx.job_ctx,
        task.priority,
        key_prefix,
        ctx.snapshot_version,
        &task.start_key,
        &task.end_key,
        |handle, key, value| {
            task_done = *key >= excluded_end;
            if task_done || entries.len() >= batch_cnt {
                return Ok(false);
            }
            entries.push((handle, key.clone(), value.to_vec()));
            if *key == task.end_key {
                task_done = true;
                return Ok(false);
            }
            Ok(true)
        },
    )
    .await?;
    if entries.is_empty() {
        task_done = true;
    }
    let next_key = if task_done {
        excluded_end
    } else {
        entries
            .last()
            .map(|(_, key, _)| key.next())
            .unwrap_or_else(|| task.start_key.clone())
    };
    Ok(FetchedEntries {
        entries,
        next_key,
        done: task_done,
    })
}

/// Commit `mutations` in one transaction, retrying transient errors up to
/// `COMMIT_RETRY_LIMIT` times. Returns the batch's finish timestamp.
pub(crate) async fn commit_batch(ctx: &BackfillContext, mutations: Vec<Mutation>) -> Result<u64> {
    let mut backoff = Backoff::new(COMMIT_RETRY_INITIAL_BACKOFF, COMMIT_RETRY_MAX_BACKOFF);
    loop {
        let mut txn = ctx.store.begin().await?;
        for mutation in &mutations {
            match mutation {
                Mutation::Put(key, value) => txn.put(key.clone(), value.clone()),
                Mutation::Delete(key) => txn.delete(key.clone()),
            }
        }
        match txn.commit().await {
            Ok(()) => break,
            Err(err) if is_retryable(&err) && backoff.failures() < COMMIT_RETRY_LIMIT => {
                let delay = backoff.fail(&mut rand::thread_rng());
                tracing::debug!(
                    failures = backoff.failures(),
                    "retrying backfill batch commit: {err:#}"
                );
                tokio::time::sleep(delay).await;
            },
            Err(err) => return Err(err),
        }
    }
    let finish_ts = ctx
        .store
        .oracle_time()
        .await?
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok(finish_ts)
}
