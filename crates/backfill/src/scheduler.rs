//! The scheduler owns the worker pool and the shared task/result channels.

use std::{
    cmp,
    sync::Arc,
};

use anyhow::{
    anyhow,
    Context,
    Result,
};
use common::{
    knobs,
    kv::Store,
    pause::PauseClient,
    table::PhysicalTable,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    backfiller::BackfillContext,
    job::BackfillJobTable,
    metrics,
    processors,
    reorg::{
        JobContext,
        ReorgInfo,
        SessionPool,
    },
    task::{
        BackfillKind,
        BackfillResult,
        BackfillTask,
    },
    worker::BackfillWorker,
};

/// Prefetches row data for dispatched tasks, bulk-ingest mode only.
pub trait RowPrefetcher: Send + Sync {
    fn prefetch(&self, task: &BackfillTask);
}

/// Test hook hit after every pool resize; an injected fault fails the
/// resize, as a worker-count mismatch would.
pub const ADJUST_WORKER_POOL_PAUSE: &str = "adjust_worker_pool";

struct WorkerHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct BackfillScheduler {
    kind: BackfillKind,
    store: Arc<dyn Store>,
    table: Arc<PhysicalTable>,
    reorg: Arc<ReorgInfo>,
    job_ctx: JobContext,
    session_pool: SessionPool,
    job_table: Option<Arc<dyn BackfillJobTable>>,
    prefetcher: Option<Arc<dyn RowPrefetcher>>,
    pause: PauseClient,

    task_tx: flume::Sender<BackfillTask>,
    task_rx: flume::Receiver<BackfillTask>,
    result_tx: flume::Sender<BackfillResult>,
    result_rx: flume::Receiver<BackfillResult>,

    workers: Vec<WorkerHandle>,
    /// Upper bound on the worker count: the number of ranges in the pending
    /// round. There is never a point in more parallelism than ranges.
    max_worker_size: usize,
    next_worker_id: usize,
    cancel: CancellationToken,
}

impl BackfillScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        table: Arc<PhysicalTable>,
        kind: BackfillKind,
        reorg: Arc<ReorgInfo>,
        job_ctx: JobContext,
        session_pool: SessionPool,
        job_table: Option<Arc<dyn BackfillJobTable>>,
        pause: PauseClient,
    ) -> Self {
        let chan_size = knobs::backfill_task_chan_size();
        let (task_tx, task_rx) = flume::bounded(chan_size);
        let (result_tx, result_rx) = flume::bounded(chan_size);
        let cancel = job_ctx.cancel_token().child_token();
        Self {
            kind,
            store,
            table,
            reorg,
            job_ctx,
            session_pool,
            job_table,
            prefetcher: None,
            pause,
            task_tx,
            task_rx,
            result_tx,
            result_rx,
            workers: Vec::new(),
            max_worker_size: 0,
            next_worker_id: 0,
            cancel,
        }
    }

    pub fn kind(&self) -> BackfillKind {
        self.kind
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn table(&self) -> &Arc<PhysicalTable> {
        &self.table
    }

    pub fn reorg(&self) -> &Arc<ReorgInfo> {
        &self.reorg
    }

    pub fn job_ctx(&self) -> &JobContext {
        &self.job_ctx
    }

    pub fn session_pool(&self) -> &SessionPool {
        &self.session_pool
    }

    pub fn job_table(&self) -> Option<&Arc<dyn BackfillJobTable>> {
        self.job_table.as_ref()
    }

    pub fn set_prefetcher(&mut self, prefetcher: Arc<dyn RowPrefetcher>) {
        self.prefetcher = Some(prefetcher);
    }

    pub fn worker_size(&self) -> usize {
        self.workers.len()
    }

    pub fn set_max_worker_size(&mut self, n: usize) {
        self.max_worker_size = n;
    }

    /// Re-read the worker-count variable, clamp it to `max_worker_size`,
    /// and grow or shrink the pool to match. Shrinking cancels the surplus
    /// workers and waits for their in-flight tasks to drain.
    pub async fn adjust_worker_size(&mut self) -> Result<()> {
        let target = cmp::min(knobs::reorg_worker_cnt(), self.max_worker_size);
        while self.workers.len() < target {
            self.spawn_worker()?;
        }
        if self.workers.len() > target {
            let surplus: Vec<WorkerHandle> = self.workers.drain(target..).collect();
            for worker in &surplus {
                worker.cancel.cancel();
            }
            for worker in surplus {
                join_worker(worker.handle).await;
            }
        }
        metrics::set_worker_count(self.workers.len());
        tracing::debug!(
            worker_cnt = self.workers.len(),
            max_worker_size = self.max_worker_size,
            "adjusted backfill worker pool"
        );
        if let common::pause::Fault::Error(err) = self.pause.wait(ADJUST_WORKER_POOL_PAUSE).await {
            return Err(err);
        }
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<()> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let session = self.session_pool.acquire();
        let ctx = BackfillContext {
            id,
            store: session.store(),
            table: self.table.clone(),
            job_ctx: self.job_ctx.clone(),
            batch_cnt: knobs::reorg_batch_size(),
            snapshot_version: self.reorg.snapshot_version,
            metric: metrics::backfill_rows_counter(self.kind, &self.table.table_name),
            job_table: self.job_table.clone(),
            pause: self.pause.clone(),
        };
        let backfiller = processors::new_backfiller(ctx, &self.reorg)?;
        let cancel = self.cancel.child_token();
        let worker = BackfillWorker::new(
            id,
            backfiller,
            self.task_rx.clone(),
            self.result_tx.clone(),
            cancel.clone(),
            self.job_ctx.clone(),
        );
        let handle = tokio::spawn(worker.run());
        self.workers.push(WorkerHandle { cancel, handle });
        Ok(())
    }

    pub async fn send_task(&self, task: BackfillTask) -> Result<()> {
        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.prefetch(&task);
        }
        self.task_tx
            .send_async(task)
            .await
            .map_err(|_| anyhow!("backfill task channel closed"))
    }

    pub async fn recv_result(&self) -> Result<BackfillResult> {
        self.result_rx
            .recv_async()
            .await
            .context("backfill result channel closed")
    }

    /// Pull pending-but-undelivered tasks off the channel, returning how
    /// many were removed.
    pub fn drain_tasks(&self) -> usize {
        let mut drained = 0;
        while self.task_rx.try_recv().is_ok() {
            drained += 1;
        }
        drained
    }

    /// Cancel every worker, drop undelivered tasks, and wait for the pool
    /// to wind down. Workers always finish their current task first, so no
    /// result is lost.
    pub async fn close(&mut self) {
        self.cancel.cancel();
        let drained = self.drain_tasks();
        if drained > 0 {
            tracing::debug!(drained, "dropped undelivered tasks on scheduler close");
        }
        for worker in self.workers.drain(..) {
            join_worker(worker.handle).await;
        }
        metrics::set_worker_count(0);
    }
}

async fn join_worker(handle: JoinHandle<()>) {
    if let Err(err) = handle.await {
        if err.is_panic() {
            tracing::error!("backfill worker panicked during shutdown: {err}");
        }
    }
}
