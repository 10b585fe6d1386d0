//! The row-processor seam of the pipeline.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use common::{
    kv::{
        Store,
        Version,
    },
    pause::PauseClient,
    table::PhysicalTable,
};
use prometheus::IntCounter;

use crate::{
    job::{
        BackfillJob,
        BackfillJobTable,
    },
    reorg::JobContext,
    task::{
        BackfillTask,
        BatchContext,
    },
};

/// Shared state every row processor carries: the session's store handle,
/// the table under reorg, the dynamically tuned batch size, and the metric
/// counter for rows written.
pub struct BackfillContext {
    pub id: usize,
    pub store: Arc<dyn Store>,
    pub table: Arc<PhysicalTable>,
    pub job_ctx: JobContext,
    pub batch_cnt: usize,
    pub snapshot_version: Version,
    pub metric: IntCounter,
    pub job_table: Option<Arc<dyn BackfillJobTable>>,
    pub pause: PauseClient,
}

/// Kind-specific backfill logic. One instance per worker; the pipeline
/// drives it a batch at a time.
///
/// `backfill_batch` must consume at most `ctx.batch_cnt` rows starting at
/// the task's current start key, apply its transformation, commit in one
/// transaction, and report the first key not processed. Recoverable commit
/// errors (write conflicts, outdated read timestamps) are its own
/// responsibility to retry within a bounded policy; whatever error it
/// returns fails the task.
#[async_trait]
pub trait Backfiller: Send + Sync {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext>;

    fn ctx(&self) -> &BackfillContext;

    fn ctx_mut(&mut self) -> &mut BackfillContext;

    fn describe(&self) -> &'static str;

    fn add_metric(&self, added_count: usize) {
        self.ctx().metric.inc_by(added_count as u64);
    }

    /// Persisted task records, distributed mode only.
    async fn get_jobs(&self) -> Result<Vec<BackfillJob>> {
        match &self.ctx().job_table {
            Some(table) => table.get_jobs(self.ctx().job_ctx.job_id).await,
            None => Ok(Vec::new()),
        }
    }

    /// Publish liveness and progress for a claimed task.
    async fn update_job(&self, job: &BackfillJob) -> Result<()> {
        match &self.ctx().job_table {
            Some(table) => table.update_job(job).await,
            None => Ok(()),
        }
    }

    /// Publish a task's terminal state.
    async fn finish_job(&self, job: &BackfillJob) -> Result<()> {
        match &self.ctx().job_table {
            Some(table) => table.finish_job(job).await,
            None => Ok(()),
        }
    }
}
