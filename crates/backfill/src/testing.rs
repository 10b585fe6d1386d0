//! Test doubles for the pipeline's durable collaborators.

use std::{
    collections::BTreeMap,
    sync::Arc,
};

use anyhow::Result;
use async_trait::async_trait;
use common::{
    codec,
    table::{
        Element,
        PhysicalTable,
    },
    testing::TestStore,
    Key,
};
use parking_lot::Mutex;

use crate::{
    driver::IngestBackend,
    errors::ReorgError,
    job::{
        BackfillJob,
        BackfillJobTable,
    },
    reorg::ReorgMetaStore,
    scheduler::RowPrefetcher,
    task::BackfillTask,
};

/// In-memory reorg meta persistence recording every save, so tests can
/// assert on the whole resume-key history.
#[derive(Default)]
pub struct MemReorgMetaStore {
    saves: Mutex<Vec<Key>>,
    keys: Mutex<BTreeMap<(i64, i64), Key>>,
}

impl MemReorgMetaStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn saved_keys(&self) -> Vec<Key> {
        self.saves.lock().clone()
    }
}

#[async_trait]
impl ReorgMetaStore for MemReorgMetaStore {
    async fn save_resume_key(&self, job_id: i64, element: Element, next_key: &Key) -> Result<()> {
        self.saves.lock().push(next_key.clone());
        self.keys
            .lock()
            .insert((job_id, element.id), next_key.clone());
        Ok(())
    }

    async fn load_resume_key(&self, job_id: i64, element: Element) -> Result<Option<Key>> {
        Ok(self.keys.lock().get(&(job_id, element.id)).cloned())
    }
}

/// In-memory persisted-task table recording lease updates.
#[derive(Default)]
pub struct TestJobTable {
    jobs: Mutex<BTreeMap<i64, BackfillJob>>,
    updates: Mutex<Vec<(i64, Key)>>,
    missing: Mutex<bool>,
}

impl TestJobTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make `finish_job` report that the persisted job has gone away.
    pub fn set_missing(&self) {
        *self.missing.lock() = true;
    }

    /// `(job id, current key)` per observed lease update, in order.
    pub fn lease_updates(&self) -> Vec<(i64, Key)> {
        self.updates.lock().clone()
    }

    pub fn job(&self, id: i64) -> Option<BackfillJob> {
        self.jobs.lock().get(&id).cloned()
    }
}

#[async_trait]
impl BackfillJobTable for TestJobTable {
    async fn get_jobs(&self, ddl_job_id: i64) -> Result<Vec<BackfillJob>> {
        Ok(self
            .jobs
            .lock()
            .values()
            .filter(|job| job.ddl_job_id == ddl_job_id)
            .cloned()
            .collect())
    }

    async fn update_job(&self, job: &BackfillJob) -> Result<()> {
        self.updates
            .lock()
            .push((job.id, job.meta.curr_key.clone()));
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }

    async fn finish_job(&self, job: &BackfillJob) -> Result<()> {
        if *self.missing.lock() {
            return Err(ReorgError::JobNotFound(job.id).into());
        }
        self.jobs.lock().insert(job.id, job.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingIngest {
    pub flushes: Mutex<Vec<i64>>,
    pub resets: Mutex<Vec<(i64, i64)>>,
}

#[async_trait]
impl IngestBackend for RecordingIngest {
    async fn flush(&self, element_id: i64) -> Result<()> {
        self.flushes.lock().push(element_id);
        Ok(())
    }

    fn reset_workers(&self, job_id: i64, element_id: i64) {
        self.resets.lock().push((job_id, element_id));
    }
}

#[derive(Default)]
pub struct RecordingPrefetcher {
    pub tasks: Mutex<Vec<usize>>,
}

impl RowPrefetcher for RecordingPrefetcher {
    fn prefetch(&self, task: &BackfillTask) {
        self.tasks.lock().push(task.id);
    }
}

pub fn test_table(physical_id: i64) -> Arc<PhysicalTable> {
    Arc::new(PhysicalTable::new(physical_id, "test", "t"))
}

/// Seed rows `0..n` with a single column whose value encodes the handle.
pub fn seed_rows(store: &TestStore, table_id: i64, n: i64, column_id: i64) {
    for handle in 0..n {
        store.insert_row(
            table_id,
            handle,
            &[(column_id, handle.to_be_bytes().to_vec())],
        );
    }
}

/// The full record span of a table: `[record prefix, prefix_next)`.
pub fn record_span(table_id: i64) -> (Key, Key) {
    let prefix = codec::record_prefix(table_id);
    let end = prefix.prefix_next();
    (prefix, end)
}
