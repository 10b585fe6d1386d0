//! Durable reorg-job context and the session pool that persists it.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use common::{
    kv::{
        Priority,
        SnapshotOptions,
        Store,
        Version,
    },
    table::{
        ColumnChange,
        Element,
        IndexInfo,
    },
    Key,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    driver::IngestBackend,
    errors::ReorgError,
    processors::update_column::ColumnConverter,
    task::BackfillKind,
};

/// Cancellation and tagging context for one reorg job. Cloned into every
/// worker; cancelling it stops the whole pipeline at the next batch
/// boundary.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: i64,
    pub source_type: &'static str,
    pub resource_group_tag: Option<String>,
    /// This DDL instance's identity, published with lease renewals.
    pub instance_id: String,
    cancelled: Arc<AtomicBool>,
    cancel_token: CancellationToken,
    row_count: Arc<AtomicU64>,
    warnings: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl JobContext {
    pub fn new(job_id: i64, kind: BackfillKind) -> Self {
        Self {
            job_id,
            source_type: kind.source_type(),
            resource_group_tag: None,
            instance_id: format!("ddl-{}", uuid::Uuid::new_v4()),
            cancelled: Arc::new(AtomicBool::new(false)),
            cancel_token: CancellationToken::new(),
            row_count: Arc::new(AtomicU64::new(0)),
            warnings: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Rows are counted per committed batch, not per finished task: a
    /// retried range must not double-count what its committed batches
    /// already reported.
    pub fn increase_row_count(&self, added: u64) {
        self.row_count.fetch_add(added, Ordering::Relaxed);
    }

    pub fn row_count(&self) -> u64 {
        self.row_count.load(Ordering::Relaxed)
    }

    pub fn merge_warnings(&self, batch_warnings: &BTreeMap<String, u64>) {
        if batch_warnings.is_empty() {
            return;
        }
        let mut warnings = self.warnings.lock();
        for (message, count) in batch_warnings {
            *warnings.entry(message.clone()).or_insert(0) += count;
        }
    }

    pub fn warnings(&self) -> BTreeMap<String, u64> {
        self.warnings.lock().clone()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.cancel_token.cancel();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Whether the reorg job may keep running. Checked before every batch
    /// and after every dispatch round.
    pub fn is_reorg_runnable(&self, job_id: i64) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) || self.cancel_token.is_cancelled() {
            return Err(ReorgError::ReorgCancelled(job_id).into());
        }
        Ok(())
    }

    pub fn snapshot_options(&self, priority: Priority) -> SnapshotOptions {
        SnapshotOptions {
            priority,
            request_source_internal: true,
            request_source_type: self.source_type,
            resource_group_tag: self.resource_group_tag.clone(),
        }
    }
}

/// The durable schema-change context: what is being built, over which key
/// span, and where to resume. Mutated only through
/// [`ReorgInfo::update_reorg_meta`].
pub struct ReorgInfo {
    pub job_id: i64,
    pub element: Element,
    pub kind: BackfillKind,
    pub start_key: Key,
    pub end_key: Key,
    pub priority: Priority,
    /// Fixed read timestamp for the whole backfill; rows written after it
    /// are covered by the online double-write path.
    pub snapshot_version: Version,
    /// The index being built (add-index and merge kinds).
    pub index_info: Option<IndexInfo>,
    /// The column identity swap (update-column kind).
    pub column_change: Option<ColumnChange>,
    /// Partitions whose global-index entries are stale (cleanup kind).
    pub dropped_partition_ids: Vec<i64>,
    /// Destination physical table (reorganize-partition kind).
    pub dest_physical_id: Option<i64>,
    /// The temporary index merged into the element (merge kind).
    pub temp_index_id: Option<i64>,
    /// Value conversion for the changed column (update-column kind).
    pub column_converter: Option<Arc<dyn ColumnConverter>>,
    /// Bulk-ingest backend hooks, when the add-index job uses ingest.
    pub ingest: Option<Arc<dyn IngestBackend>>,
    curr_key: Mutex<Key>,
}

impl ReorgInfo {
    pub fn new(
        job_id: i64,
        element: Element,
        kind: BackfillKind,
        start_key: Key,
        end_key: Key,
    ) -> Self {
        let curr_key = Mutex::new(start_key.clone());
        Self {
            job_id,
            element,
            kind,
            start_key,
            end_key,
            priority: Priority::Low,
            snapshot_version: Version::MAX,
            index_info: None,
            column_change: None,
            dropped_partition_ids: Vec::new(),
            dest_physical_id: None,
            temp_index_id: None,
            column_converter: None,
            ingest: None,
            curr_key,
        }
    }

    /// The most recently persisted resume key.
    pub fn curr_key(&self) -> Key {
        self.curr_key.lock().clone()
    }

    /// Persist `next_key` as the job's resume point. Runs on every return
    /// path of a dispatch round, so a crash resumes from the last in-order
    /// success.
    pub async fn update_reorg_meta(&self, next_key: &Key, pool: &SessionPool) -> Result<()> {
        let session = pool.acquire();
        session
            .save_resume_key(self.job_id, self.element, next_key)
            .await?;
        *self.curr_key.lock() = next_key.clone();
        Ok(())
    }
}

/// Durable storage for reorg resume keys. The real implementation writes
/// the job's system-table record.
#[async_trait]
pub trait ReorgMetaStore: Send + Sync {
    async fn save_resume_key(&self, job_id: i64, element: Element, next_key: &Key) -> Result<()>;
    async fn load_resume_key(&self, job_id: i64, element: Element) -> Result<Option<Key>>;
}

/// Hands out transactional sessions: one per worker, plus the driver's own
/// for persisting progress.
#[derive(Clone)]
pub struct SessionPool {
    store: Arc<dyn Store>,
    meta: Arc<dyn ReorgMetaStore>,
}

impl SessionPool {
    pub fn new(store: Arc<dyn Store>, meta: Arc<dyn ReorgMetaStore>) -> Self {
        Self { store, meta }
    }

    pub fn acquire(&self) -> Session {
        Session {
            store: self.store.clone(),
            meta: self.meta.clone(),
        }
    }
}

pub struct Session {
    store: Arc<dyn Store>,
    meta: Arc<dyn ReorgMetaStore>,
}

impl Session {
    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub async fn save_resume_key(&self, job_id: i64, element: Element, key: &Key) -> Result<()> {
        self.meta.save_resume_key(job_id, element, key).await
    }

    pub async fn load_resume_key(&self, job_id: i64, element: Element) -> Result<Option<Key>> {
        self.meta.load_resume_key(job_id, element).await
    }
}
