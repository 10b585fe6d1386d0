//! The backfill worker: consumes tasks one at a time and runs the batch
//! loop for each.

use std::{
    panic::AssertUnwindSafe,
    time::Instant,
};

use anyhow::Result;
use common::{
    knobs,
    pause::Fault,
    Key,
};
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::{
    backfiller::Backfiller,
    driver::log_slow_operations,
    errors::{
        is_job_not_found,
        ReorgError,
    },
    job::{
        lease_expire_time,
        BackfillJobState,
    },
    reorg::JobContext,
    task::{
        BackfillResult,
        BackfillTask,
    },
};

/// Log throughput after this many additional scanned rows.
const THROUGHPUT_LOG_ROWS: usize = 90_000;

/// Test hook hit before every batch.
pub const BACKFILL_BATCH_PAUSE: &str = "backfill_batch";

pub struct BackfillWorker {
    id: usize,
    backfiller: Box<dyn Backfiller>,
    task_rx: flume::Receiver<BackfillTask>,
    result_tx: flume::Sender<BackfillResult>,
    cancel: CancellationToken,
    job_ctx: JobContext,
}

impl BackfillWorker {
    pub fn new(
        id: usize,
        backfiller: Box<dyn Backfiller>,
        task_rx: flume::Receiver<BackfillTask>,
        result_tx: flume::Sender<BackfillResult>,
        cancel: CancellationToken,
        job_ctx: JobContext,
    ) -> Self {
        Self {
            id,
            backfiller,
            task_rx,
            result_tx,
            cancel,
            job_ctx,
        }
    }

    /// Pull tasks until cancelled, the channel closes, or a task fails.
    pub async fn run(mut self) {
        tracing::info!(
            worker = self.id,
            kind = self.backfiller.describe(),
            "backfill worker started"
        );
        loop {
            let task = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(worker = self.id, "backfill worker exits on cancellation");
                    return;
                },
                task = self.task_rx.recv_async() => match task {
                    Ok(task) => task,
                    Err(_) => {
                        tracing::info!(worker = self.id, "backfill worker exits, task channel closed");
                        return;
                    },
                },
            };
            let result = self.run_task(task).await;
            let failed = result.err.is_some();
            if self.result_tx.send_async(result).await.is_err() {
                return;
            }
            if failed {
                tracing::info!(worker = self.id, "backfill worker exits on task error");
                return;
            }
        }
    }

    async fn run_task(&mut self, mut task: BackfillTask) -> BackfillResult {
        tracing::debug!(worker = self.id, %task, "backfill worker got task");
        // Pick up the current batch size for this task.
        self.backfiller.ctx_mut().batch_cnt = knobs::reorg_batch_size();

        let task_id = task.id;
        let task_start_key = task.start_key.clone();
        let mut result =
            match AssertUnwindSafe(self.handle_backfill_task(&mut task)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    let mut result = BackfillResult::new(task_id, task_start_key);
                    result.err = Some(ReorgError::ReorgPanic.into());
                    result
                },
            };

        // Distributed mode: publish the task's terminal state.
        if let Some(job) = task.backfill_job.as_mut() {
            job.meta.row_count = result.added_count as u64;
            match result.err.take() {
                None => {
                    job.state = BackfillJobState::Done;
                    if let Err(err) = self.backfiller.finish_job(job).await {
                        if !is_job_not_found(&err) {
                            result.err = Some(err);
                        }
                    }
                },
                Some(err) if is_job_not_found(&err) => {
                    // The persisted job is gone: another owner finished it,
                    // so this task counts as a success.
                },
                Some(err) => {
                    tracing::warn!(
                        worker = self.id,
                        job = %job.abbr(),
                        "backfill task failed: {err:#}"
                    );
                    job.state = BackfillJobState::Cancelled;
                    job.meta.error = Some(format!("{err:#}"));
                    result.err = Some(err);
                    if let Err(finish_err) = self.backfiller.finish_job(job).await {
                        tracing::warn!(
                            worker = self.id,
                            job = %job.abbr(),
                            "publishing terminal task state failed: {finish_err:#}"
                        );
                        result.err = Some(finish_err);
                    }
                },
            }
        }
        result
    }

    /// The batch loop: left-to-right over the task's range, one transaction
    /// per batch.
    async fn handle_backfill_task(&mut self, task: &mut BackfillTask) -> BackfillResult {
        let mut handle_range = task.clone();
        let mut result = BackfillResult::new(task.id, handle_range.start_key.clone());
        let job_id = task.job_id();
        let is_distributed = task.backfill_job.is_some();
        let start_time = Instant::now();
        let mut lease_refreshed_at = start_time;
        let mut last_log_count = 0usize;
        let mut last_log_time = start_time;

        loop {
            // The task may run for a long time; re-check the cancel
            // predicate between batches.
            if let Err(err) = self.job_ctx.is_reorg_runnable(job_id) {
                result.err = Some(err);
                return result;
            }
            match self.backfiller.ctx().pause.wait(BACKFILL_BATCH_PAUSE).await {
                Fault::Error(err) => {
                    result.err = Some(err);
                    return result;
                },
                Fault::Noop => {},
            }

            let batch_started = Instant::now();
            let batch = match self.backfiller.backfill_batch(&handle_range).await {
                Ok(batch) => batch,
                Err(err) => {
                    result.err = Some(err);
                    return result;
                },
            };
            log_slow_operations(batch_started.elapsed(), "backfill one batch", None);

            self.backfiller.add_metric(batch.added_count);
            result.absorb_batch(&batch);
            self.job_ctx.increase_row_count(batch.added_count as u64);
            self.job_ctx.merge_warnings(&batch.warnings);

            let scanned = result.scan_count - last_log_count;
            if scanned >= THROUGHPUT_LOG_ROWS {
                tracing::info!(
                    worker = self.id,
                    added = result.added_count,
                    scanned = result.scan_count,
                    next_key = %batch.next_key,
                    rows_per_sec =
                        scanned as f64 / last_log_time.elapsed().as_secs_f64().max(f64::EPSILON),
                    "backfill progress"
                );
                last_log_count = result.scan_count;
                last_log_time = Instant::now();
            }

            handle_range.start_key = batch.next_key.clone();
            if batch.done {
                break;
            }

            if is_distributed && lease_refreshed_at.elapsed() >= knobs::update_instance_lease() {
                lease_refreshed_at = Instant::now();
                if let Err(err) = self
                    .update_lease(&mut handle_range, result.next_key.clone())
                    .await
                {
                    tracing::warn!(worker = self.id, "lease refresh failed: {err:#}");
                    result.err = Some(err);
                    return result;
                }
            }
        }

        // Carry the published progress back onto the dispatched task.
        if let Some(job) = handle_range.backfill_job.take() {
            task.backfill_job = Some(job);
        }
        tracing::info!(
            worker = self.id,
            %task,
            added = result.added_count,
            scanned = result.scan_count,
            next_key = %result.next_key,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "backfill worker finished task"
        );
        result
    }

    /// Renew this instance's claim on a distributed task.
    async fn update_lease(&self, handle_range: &mut BackfillTask, next_key: Key) -> Result<()> {
        let Some(job) = handle_range.backfill_job.as_mut() else {
            return Ok(());
        };
        let oracle_now = self.backfiller.ctx().store.oracle_time().await?;
        job.meta.curr_key = next_key;
        job.instance_id = self.job_ctx.instance_id.clone();
        job.instance_lease = lease_expire_time(oracle_now, *knobs::INSTANCE_LEASE);
        self.backfiller.update_job(job).await
    }
}
