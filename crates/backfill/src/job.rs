//! Persisted backfill task records for distributed mode.
//!
//! When a job is executed by several instances, each claimed range has a
//! durable [`BackfillJob`] record. Workers renew their claim by publishing
//! `(instance id, lease, current key)` through [`BackfillJobTable`]; an
//! expired lease lets another instance take the task over.

use std::time::{
    Duration,
    SystemTime,
};

use anyhow::Result;
use async_trait::async_trait;
use common::Key;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackfillJobState {
    Running,
    Done,
    Cancelled,
}

#[derive(Clone, Debug, Default)]
pub struct BackfillJobMeta {
    pub curr_key: Key,
    pub row_count: u64,
    pub error: Option<String>,
}

#[derive(Clone, Debug)]
pub struct BackfillJob {
    pub id: i64,
    pub ddl_job_id: i64,
    pub ele_id: i64,
    pub physical_table_id: i64,
    pub instance_id: String,
    pub instance_lease: SystemTime,
    pub state: BackfillJobState,
    pub meta: BackfillJobMeta,
}

impl BackfillJob {
    /// Short form for logs.
    pub fn abbr(&self) -> String {
        format!(
            "job {} (ddl {}, ele {}, physical {})",
            self.id, self.ddl_job_id, self.ele_id, self.physical_table_id
        )
    }
}

/// Lease expiry for a claim renewed at `oracle_now`.
pub fn lease_expire_time(oracle_now: SystemTime, lease: Duration) -> SystemTime {
    oracle_now + lease
}

/// Storage for persisted backfill task records. The real implementation is
/// a system table; tests use an in-memory double.
#[async_trait]
pub trait BackfillJobTable: Send + Sync {
    async fn get_jobs(&self, ddl_job_id: i64) -> Result<Vec<BackfillJob>>;
    async fn update_job(&self, job: &BackfillJob) -> Result<()>;
    async fn finish_job(&self, job: &BackfillJob) -> Result<()>;
}
