//! Tasks, results, and per-batch aggregates.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use common::{
    kv::Priority,
    table::PhysicalTable,
    Key,
};

use crate::job::BackfillJob;

/// Which kind of backfill a job performs. The kind picks the row processor;
/// the pipeline is otherwise indifferent to it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackfillKind {
    AddIndex,
    UpdateColumn,
    CleanupGlobalIndex,
    MergeTempIndex,
    ReorgPartition,
}

impl BackfillKind {
    /// The request source tag attached to storage reads.
    pub fn source_type(&self) -> &'static str {
        match self {
            BackfillKind::AddIndex => "ddl_add_index",
            BackfillKind::UpdateColumn => "ddl_modify_column",
            BackfillKind::CleanupGlobalIndex => "ddl_cleanup_index",
            BackfillKind::MergeTempIndex => "ddl_merge_temp_index",
            BackfillKind::ReorgPartition => "ddl_reorg_partition",
        }
    }
}

impl fmt::Display for BackfillKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BackfillKind::AddIndex => "add index",
            BackfillKind::UpdateColumn => "update column",
            BackfillKind::CleanupGlobalIndex => "clean up index",
            BackfillKind::MergeTempIndex => "merge temporary index",
            BackfillKind::ReorgPartition => "reorganize partition",
        };
        write!(f, "{label}")
    }
}

/// One unit of dispatched work: a storage-aligned sub-range of the table.
/// Immutable once dispatched, except for the persisted job handle a worker
/// updates in distributed mode.
#[derive(Clone)]
pub struct BackfillTask {
    /// Sequential index within the current batch; the done-task keeper
    /// collapses completions by this id.
    pub id: usize,
    pub job_id: i64,
    pub physical_table: Arc<PhysicalTable>,
    pub start_key: Key,
    pub end_key: Key,
    /// The final range of a partition must include its boundary key.
    pub end_include: bool,
    pub priority: Priority,
    /// Present in distributed mode: the persisted record through which the
    /// worker publishes liveness and progress.
    pub backfill_job: Option<BackfillJob>,
}

impl BackfillTask {
    /// The first key past the task's range.
    pub fn excluded_end_key(&self) -> Key {
        if self.end_include {
            self.end_key.next()
        } else {
            self.end_key.clone()
        }
    }

    pub fn job_id(&self) -> i64 {
        match &self.backfill_job {
            Some(job) => job.ddl_job_id,
            None => self.job_id,
        }
    }
}

impl fmt::Display for BackfillTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inclusion = if self.end_include { "]" } else { ")" };
        write!(
            f,
            "task {}, physical table {}, range [{}, {}{}, job {}",
            self.id,
            self.physical_table.physical_id,
            self.start_key,
            self.end_key,
            inclusion,
            self.job_id(),
        )
    }
}

/// The outcome of one task, reported on the scheduler's result channel.
#[derive(Debug)]
pub struct BackfillResult {
    pub task_id: usize,
    pub added_count: usize,
    pub scan_count: usize,
    /// The first key not yet processed: the task's resume point.
    pub next_key: Key,
    pub err: Option<anyhow::Error>,
}

impl BackfillResult {
    pub fn new(task_id: usize, start_key: Key) -> Self {
        Self {
            task_id,
            added_count: 0,
            scan_count: 0,
            next_key: start_key,
            err: None,
        }
    }

    /// Fold one committed batch into the cumulative result.
    pub fn absorb_batch(&mut self, batch: &BatchContext) {
        self.next_key = batch.next_key.clone();
        self.added_count += batch.added_count;
        self.scan_count += batch.scan_count;
    }
}

/// What one transactional batch accomplished.
#[derive(Clone, Debug, Default)]
pub struct BatchContext {
    pub next_key: Key,
    pub done: bool,
    pub added_count: usize,
    pub scan_count: usize,
    /// Warning message -> occurrence count, collected per committed batch
    /// so retried ranges do not double-count.
    pub warnings: BTreeMap<String, u64>,
    pub finish_ts: u64,
}
