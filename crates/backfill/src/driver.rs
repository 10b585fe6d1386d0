//! The pipeline driver: split the remaining key space, dispatch a round of
//! tasks, collect results, persist progress, repeat.

use std::{
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use common::{
    knobs,
    kv::Store,
    pause::PauseClient,
    table::PhysicalTable,
    Key,
    KeyRange,
};

use crate::{
    job::{
        BackfillJob,
        BackfillJobMeta,
        BackfillJobState,
        BackfillJobTable,
    },
    metrics,
    progress::DoneTaskKeeper,
    reorg::{
        JobContext,
        ReorgInfo,
        SessionPool,
    },
    scheduler::{
        BackfillScheduler,
        RowPrefetcher,
    },
    split::{
        range_end_key,
        split_table_ranges,
    },
    task::{
        BackfillKind,
        BackfillTask,
    },
};

/// The bulk-ingest backend, seen by the pipeline only through its flush and
/// reset hooks.
#[async_trait]
pub trait IngestBackend: Send + Sync {
    /// Flush buffered index data for `element_id`, bounding memory growth
    /// between dispatch rounds.
    async fn flush(&self, element_id: i64) -> Result<()>;

    /// Reset per-element ingest worker state once the element is fully
    /// backfilled.
    fn reset_workers(&self, job_id: i64, element_id: i64);

    /// The backend's row prefetch pool, when it has one. Dispatched tasks
    /// are announced to it ahead of the workers.
    fn prefetcher(&self) -> Option<Arc<dyn RowPrefetcher>> {
        None
    }
}

pub(crate) fn log_slow_operations(elapsed: Duration, msg: &str, threshold: Option<Duration>) {
    let threshold = threshold.unwrap_or_else(knobs::slow_operation_threshold);
    if !threshold.is_zero() && elapsed >= threshold {
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, msg, "slow operation");
    }
}

/// Backfill one physical table for a reorg job: the "write reorganization"
/// state of add-index, modify-column, index cleanup, index merge, and
/// partition reorganization. Partitioned tables are handled partition by
/// partition by the caller.
///
/// Concurrency is `reorg_worker_cnt`, re-read as the job runs. The table's
/// `[start_key, end_key)` span is split on region boundaries; each round
/// dispatches up to `backfill_task_chan_size` range tasks to the worker
/// pool, waits for all of them, and persists the in-order resume key.
#[allow(clippy::too_many_arguments)]
pub async fn write_physical_table_record(
    store: Arc<dyn Store>,
    session_pool: SessionPool,
    table: Arc<PhysicalTable>,
    kind: BackfillKind,
    reorg_info: Arc<ReorgInfo>,
    job_ctx: JobContext,
    job_table: Option<Arc<dyn BackfillJobTable>>,
    pause: Option<PauseClient>,
) -> Result<()> {
    job_ctx.is_reorg_runnable(reorg_info.job_id)?;

    let start_key = reorg_info.start_key.clone();
    let end_key = reorg_info.end_key.clone();
    if start_key.is_empty() && end_key.is_empty() {
        return Ok(());
    }
    if start_key >= end_key {
        // Nothing left to process, or an empty table span.
        return Ok(());
    }

    let mut scheduler = BackfillScheduler::new(
        store,
        table,
        kind,
        reorg_info,
        job_ctx,
        session_pool,
        job_table,
        pause.unwrap_or_default(),
    );
    let result = run_backfill_rounds(&mut scheduler, start_key, end_key).await;
    scheduler.close().await;
    result
}

async fn run_backfill_rounds(
    scheduler: &mut BackfillScheduler,
    mut start_key: Key,
    end_key: Key,
) -> Result<()> {
    let reorg = scheduler.reorg().clone();
    let ingest = match reorg.kind {
        BackfillKind::AddIndex => reorg.ingest.clone(),
        _ => None,
    };
    if let Some(prefetcher) = ingest.as_ref().and_then(|ingest| ingest.prefetcher()) {
        scheduler.set_prefetcher(prefetcher);
    }
    let mut total_added: u64 = 0;

    loop {
        let kv_ranges = split_table_ranges(
            scheduler.table(),
            scheduler.store(),
            &start_key,
            &end_key,
            knobs::backfill_task_chan_size(),
        )
        .await?;
        if kv_ranges.is_empty() {
            break;
        }

        scheduler.set_max_worker_size(kv_ranges.len());
        scheduler.adjust_worker_size().await?;

        tracing::info!(
            kind = %scheduler.kind(),
            worker_cnt = scheduler.worker_size(),
            region_cnt = kv_ranges.len(),
            start_key = %start_key,
            end_key = %end_key,
            "starting backfill workers for one round"
        );

        if let Some(ingest) = &ingest {
            ingest.flush(reorg.element.id).await?;
        }

        let remains = handle_range_tasks(scheduler, &mut total_added, &kv_ranges).await?;
        start_key = match remains.first() {
            Some(range) => range.start_key.clone(),
            None => match kv_ranges.last() {
                Some(range) => range.end_key.next(),
                None => break,
            },
        };
        if start_key >= end_key {
            break;
        }
    }

    if let Some(ingest) = &ingest {
        ingest.reset_workers(reorg.job_id, reorg.element.id);
    }
    Ok(())
}

/// Dispatch one round of tasks built from `kv_ranges` and wait for it,
/// returning the ranges that did not fit in the round.
async fn handle_range_tasks(
    scheduler: &mut BackfillScheduler,
    total_added: &mut u64,
    kv_ranges: &[KeyRange],
) -> Result<Vec<KeyRange>> {
    let batch_tasks =
        get_batch_tasks(scheduler, kv_ranges, knobs::backfill_task_chan_size()).await?;
    if batch_tasks.is_empty() {
        return Ok(Vec::new());
    }
    let batch_len = batch_tasks.len();

    send_tasks_and_wait(scheduler, total_added, batch_tasks).await?;

    if batch_len < kv_ranges.len() {
        return Ok(kv_ranges[batch_len..].to_vec());
    }
    Ok(Vec::new())
}

/// The key prefix a kind's processor scans: temp-index entries for merges,
/// the global index for cleanups, record keys otherwise.
fn scan_prefix(table: &PhysicalTable, reorg: &ReorgInfo) -> Key {
    match reorg.kind {
        BackfillKind::MergeTempIndex => match reorg.temp_index_id {
            Some(temp_index_id) => table.index_prefix(temp_index_id),
            None => table.index_root_prefix(),
        },
        BackfillKind::CleanupGlobalIndex => table.index_prefix(reorg.element.id),
        _ => table.record_prefix(),
    }
}

async fn get_batch_tasks(
    scheduler: &BackfillScheduler,
    kv_ranges: &[KeyRange],
    batch: usize,
) -> Result<Vec<BackfillTask>> {
    let reorg = scheduler.reorg();
    let table = scheduler.table();
    let prefix = scan_prefix(table, reorg);
    let mut tasks = Vec::with_capacity(batch.min(kv_ranges.len()));

    for (i, key_range) in kv_ranges.iter().enumerate() {
        let mut start_key = key_range.start_key.clone();
        let mut end_key = key_range.end_key.clone();
        let mut end_include = i == kv_ranges.len() - 1;
        match range_end_key(
            scheduler.store(),
            scheduler.job_ctx(),
            reorg.priority,
            &prefix,
            &start_key,
            &end_key,
        )
        .await
        {
            Ok(tight_end) => {
                if tight_end != end_key {
                    tracing::info!(
                        physical_table_id = table.physical_id,
                        declared_end = %end_key,
                        tight_end = %tight_end,
                        "tightened range end to the last existing key"
                    );
                    // The tight end is a real key and must be processed;
                    // the declared end belongs to the next region.
                    end_key = tight_end;
                    end_include = true;
                }
            },
            Err(err) => {
                tracing::info!(
                    "failed to locate the last key of a range, keeping the declared end: {err:#}"
                );
            },
        }
        if start_key.is_empty() {
            start_key = prefix.clone();
        }
        if end_key.is_empty() {
            end_key = prefix.prefix_next();
        }

        let backfill_job = scheduler.job_table().map(|_| BackfillJob {
            id: i as i64,
            ddl_job_id: reorg.job_id,
            ele_id: reorg.element.id,
            physical_table_id: table.physical_id,
            instance_id: scheduler.job_ctx().instance_id.clone(),
            instance_lease: std::time::UNIX_EPOCH,
            state: BackfillJobState::Running,
            meta: BackfillJobMeta {
                curr_key: start_key.clone(),
                row_count: 0,
                error: None,
            },
        });

        tasks.push(BackfillTask {
            id: i,
            job_id: reorg.job_id,
            physical_table: table.clone(),
            start_key,
            end_key,
            end_include,
            priority: reorg.priority,
            backfill_job,
        });
        if tasks.len() >= batch {
            break;
        }
    }
    Ok(tasks)
}

/// Send one round of tasks and wait for every result. Progress is persisted
/// on every return path, so even a failed round leaves the resume point at
/// its last in-order success.
async fn send_tasks_and_wait(
    scheduler: &mut BackfillScheduler,
    total_added: &mut u64,
    batch_tasks: Vec<BackfillTask>,
) -> Result<()> {
    let Some(first) = batch_tasks.first() else {
        return Ok(());
    };
    let batch_start_key = first.start_key.clone();
    let task_cnt = batch_tasks.len();
    for task in batch_tasks {
        scheduler.send_task(task).await?;
    }

    let started = Instant::now();
    let (next_key, batch_added, mut first_err) =
        wait_task_results(scheduler, task_cnt, batch_start_key.clone(), total_added).await;
    if first_err.is_none() {
        if let Err(err) = scheduler
            .job_ctx()
            .is_reorg_runnable(scheduler.reorg().job_id)
        {
            first_err = Some(err);
        }
    }

    let persist_err = scheduler
        .reorg()
        .update_reorg_meta(&next_key, scheduler.session_pool())
        .await
        .err()
        .map(|err| format!("{err:#}"));

    let elapsed = started.elapsed();
    metrics::observe_batch_seconds(first_err.is_none(), elapsed.as_secs_f64());
    log_slow_operations(elapsed, "backfill task round", None);

    match first_err {
        Some(err) => {
            tracing::warn!(
                total_added = *total_added,
                batch_added,
                start_key = %batch_start_key,
                next_key = %next_key,
                elapsed_ms = elapsed.as_millis() as u64,
                ?persist_err,
                "backfill workers failed to process one round: {err:#}"
            );
            Err(err)
        },
        None => {
            tracing::info!(
                element = %scheduler.reorg().element,
                total_added = *total_added,
                batch_added,
                start_key = %batch_start_key,
                next_key = %next_key,
                elapsed_ms = elapsed.as_millis() as u64,
                ?persist_err,
                "backfill workers processed one round"
            );
            Ok(())
        },
    }
}

/// Read exactly one result per dispatched task. The first error is kept and
/// the task channel drained so undelivered tasks are not waited for; the
/// worker pool is re-sized periodically so configuration changes take
/// effect quickly.
async fn wait_task_results(
    scheduler: &mut BackfillScheduler,
    task_cnt: usize,
    batch_start_key: Key,
    total_added: &mut u64,
) -> (Key, u64, Option<anyhow::Error>) {
    let mut keeper = DoneTaskKeeper::new(batch_start_key);
    let mut first_err: Option<anyhow::Error> = None;
    let mut batch_added: u64 = 0;
    let mut task_size = task_cnt;
    let mut received = 0usize;

    while received < task_size {
        let result = match scheduler.recv_result().await {
            Ok(result) => result,
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                break;
            },
        };
        received += 1;

        if let Some(err) = result.err {
            tracing::warn!(next_key = %result.next_key, "backfill worker failed: {err:#}");
            if first_err.is_none() {
                first_err = Some(err);
            }
            let drained = scheduler.drain_tasks();
            task_size -= drained;
            continue;
        }

        batch_added += result.added_count as u64;
        *total_added += result.added_count as u64;
        keeper.update_next_key(result.task_id, result.next_key);

        let stride = (scheduler.worker_size() * 4).max(1);
        if received % stride == 0 {
            if let Err(err) = scheduler.adjust_worker_size().await {
                tracing::warn!("cannot adjust backfill worker count: {err:#}");
            }
        }
    }
    (keeper.next_key, batch_added, first_err)
}
