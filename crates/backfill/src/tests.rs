//! End-to-end pipeline scenarios over the in-memory store.

use std::sync::Arc;

use anyhow::Result;
use common::{
    codec,
    knobs,
    kv::{
        Mutation,
        Store,
        Version,
    },
    pause::PauseController,
    table::{
        ColumnChange,
        Element,
        IndexInfo,
    },
    testing::TestStore,
    Key,
};
use parking_lot::{
    Mutex,
    MutexGuard,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::{
    backfiller::BackfillContext,
    driver::write_physical_table_record,
    errors::{
        is_cancelled,
        ReorgError,
    },
    job::{
        BackfillJob,
        BackfillJobMeta,
        BackfillJobState,
        BackfillJobTable,
    },
    metrics,
    processors::add_index::AddIndexBackfiller,
    reorg::{
        JobContext,
        ReorgInfo,
        ReorgMetaStore,
        SessionPool,
    },
    scheduler::BackfillScheduler,
    task::{
        BackfillKind,
        BackfillTask,
        BatchContext,
    },
    testing::{
        record_span,
        seed_rows,
        test_table,
        MemReorgMetaStore,
        RecordingIngest,
        RecordingPrefetcher,
        TestJobTable,
    },
    worker::BackfillWorker,
    Backfiller,
};

/// The reorg variables are process-wide; tests that touch them hold this.
static KNOBS: Mutex<()> = Mutex::new(());

fn lock_knobs() -> MutexGuard<'static, ()> {
    let guard = KNOBS.lock();
    knobs::set_reorg_worker_cnt(4);
    knobs::set_reorg_batch_size(256);
    knobs::set_backfill_task_chan_size(1024);
    knobs::set_update_instance_lease_ms(25_000);
    guard
}

const TABLE_ID: i64 = 1;
const INDEX_ID: i64 = 9;
const COLUMN_ID: i64 = 1;

fn add_index_reorg(job_id: i64) -> ReorgInfo {
    let (start, end) = record_span(TABLE_ID);
    reorg_with_span(job_id, start, end)
}

fn reorg_with_span(job_id: i64, start: Key, end: Key) -> ReorgInfo {
    let mut reorg = ReorgInfo::new(
        job_id,
        Element::index(INDEX_ID),
        BackfillKind::AddIndex,
        start,
        end,
    );
    reorg.index_info = Some(IndexInfo {
        id: INDEX_ID,
        column_id: COLUMN_ID,
    });
    reorg
}

async fn run_driver(
    store: &TestStore,
    meta: &Arc<MemReorgMetaStore>,
    reorg: ReorgInfo,
    job_ctx: &JobContext,
    pause: Option<common::pause::PauseClient>,
) -> Result<()> {
    let store_arc: Arc<dyn Store> = Arc::new(store.clone());
    let session_pool = SessionPool::new(store_arc.clone(), meta.clone() as Arc<dyn ReorgMetaStore>);
    write_physical_table_record(
        store_arc,
        session_pool,
        test_table(TABLE_ID),
        reorg.kind,
        Arc::new(reorg),
        job_ctx.clone(),
        None,
        pause,
    )
    .await
}

fn index_key_for(handle: i64) -> Key {
    codec::encode_index_key(TABLE_ID, INDEX_ID, &handle.to_be_bytes(), handle)
}

#[tokio::test]
async fn test_empty_span_dispatches_nothing() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    // Fully unset span.
    let reorg = reorg_with_span(1, Key::default(), Key::default());
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    // Empty span [k, k).
    let (prefix, _) = record_span(TABLE_ID);
    let reorg = reorg_with_span(1, prefix.clone(), prefix);
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    assert_eq!(meta.saved_keys(), Vec::<Key>::new());
    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 0);
}

#[tokio::test]
async fn test_single_range_backfills_every_row() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 10_000, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    run_driver(&store, &meta, add_index_reorg(1), &job_ctx, None)
        .await
        .unwrap();

    assert_eq!(
        store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)),
        10_000
    );
    assert_eq!(job_ctx.row_count(), 10_000);
    // Resume key is one past the last row.
    let last_row = codec::encode_record_key(TABLE_ID, 9_999);
    assert_eq!(meta.saved_keys().last().unwrap(), &last_row.next());
}

#[tokio::test]
async fn test_rows_without_indexed_column_become_warnings() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 4, COLUMN_ID);
    // Row 4 has no value for the indexed column.
    store.insert_row(TABLE_ID, 4, &[(77, b"other".to_vec())]);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    run_driver(&store, &meta, add_index_reorg(1), &job_ctx, None)
        .await
        .unwrap();

    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 4);
    assert_eq!(job_ctx.row_count(), 4);
    let warnings = job_ctx.warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings.values().sum::<u64>(), 1);
}

#[tokio::test]
async fn test_failed_middle_task_truncates_progress() {
    let _guard = lock_knobs();
    knobs::set_reorg_worker_cnt(3);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    // Three regions; any commit carrying handle 10's index entry fails.
    let split_keys = vec![
        codec::encode_record_key(TABLE_ID, 10),
        codec::encode_record_key(TABLE_ID, 20),
    ];
    let store = TestStore::with_region_splits(split_keys.clone());
    seed_rows(&store, TABLE_ID, 30, COLUMN_ID);
    let poisoned_key = index_key_for(10);
    store.set_commit_check(move |mutations| {
        mutations.iter().any(|m| matches!(m, Mutation::Put(k, _) if *k == poisoned_key))
            .then(|| anyhow::anyhow!("injected commit failure"))
    });

    let err = run_driver(&store, &meta, add_index_reorg(1), &job_ctx, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("injected commit failure"));

    // The longest in-order prefix of successes is task 0: its range ends at
    // the first region boundary.
    let saved = meta.saved_keys();
    assert_eq!(saved.last().unwrap(), &split_keys[0]);
    // Tasks 0 and 2 committed; task 1 did not.
    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 20);

    // The next attempt resumes from the persisted key and finishes the rest.
    store.clear_commit_check();
    let resume = meta
        .load_resume_key(1, Element::index(INDEX_ID))
        .await
        .unwrap()
        .unwrap();
    let (_, end) = record_span(TABLE_ID);
    run_driver(&store, &meta, reorg_with_span(1, resume, end), &job_ctx, None)
        .await
        .unwrap();
    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 30);
    // Every persisted resume key is monotone non-decreasing.
    let saved = meta.saved_keys();
    assert!(saved.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test]
async fn test_cancellation_between_batches() {
    let _guard = lock_knobs();
    knobs::set_reorg_worker_cnt(1);
    knobs::set_reorg_batch_size(32);
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 100, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    let (mut controller, pause) = PauseController::new([crate::worker::BACKFILL_BATCH_PAUSE]);
    let driver = {
        let store = store.clone();
        let meta = meta.clone();
        let job_ctx = job_ctx.clone();
        tokio::spawn(async move {
            run_driver(&store, &meta, add_index_reorg(1), &job_ctx, Some(pause)).await
        })
    };

    // Let the first batch through, then cancel the job before the second.
    let mut guard = controller
        .wait_for_blocked(crate::worker::BACKFILL_BATCH_PAUSE)
        .await
        .unwrap();
    guard.unpause();
    drop(guard);
    let mut guard = controller
        .wait_for_blocked(crate::worker::BACKFILL_BATCH_PAUSE)
        .await
        .unwrap();
    job_ctx.cancel();
    guard.unpause();
    drop(guard);
    drop(controller);

    let err = driver.await.unwrap().unwrap_err();
    assert!(is_cancelled(&err));
    // Two batches committed before the cancel took effect; the persisted
    // resume key covers no part of the failed task.
    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 64);
    let (start, _) = record_span(TABLE_ID);
    assert_eq!(meta.saved_keys(), vec![start]);
}

#[tokio::test]
async fn test_multiple_rounds_persist_monotone_progress() {
    let _guard = lock_knobs();
    knobs::set_reorg_worker_cnt(2);
    knobs::set_backfill_task_chan_size(2);
    let split_keys: Vec<Key> = (1..5)
        .map(|i| codec::encode_record_key(TABLE_ID, i * 10))
        .collect();
    let store = TestStore::with_region_splits(split_keys);
    seed_rows(&store, TABLE_ID, 50, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);

    run_driver(&store, &meta, add_index_reorg(1), &job_ctx, None)
        .await
        .unwrap();

    // Five ranges at two per round: three rounds, each persisting further
    // to the right, the union covering the whole span.
    let saved = meta.saved_keys();
    assert_eq!(saved.len(), 3);
    assert!(saved.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(
        saved.last().unwrap(),
        &codec::encode_record_key(TABLE_ID, 49).next()
    );
    assert_eq!(store.count_prefix(&codec::index_prefix(TABLE_ID, INDEX_ID)), 50);
}

#[tokio::test]
async fn test_worker_pool_follows_configuration() {
    let _guard = lock_knobs();
    knobs::set_reorg_worker_cnt(2);
    let store: Arc<dyn Store> = Arc::new(TestStore::new());
    let meta = MemReorgMetaStore::new();
    let session_pool = SessionPool::new(store.clone(), meta as Arc<dyn ReorgMetaStore>);
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);
    let mut scheduler = BackfillScheduler::new(
        store,
        test_table(TABLE_ID),
        BackfillKind::AddIndex,
        Arc::new(add_index_reorg(1)),
        job_ctx,
        session_pool,
        None,
        Default::default(),
    );

    scheduler.set_max_worker_size(10);
    scheduler.adjust_worker_size().await.unwrap();
    assert_eq!(scheduler.worker_size(), 2);

    knobs::set_reorg_worker_cnt(5);
    scheduler.adjust_worker_size().await.unwrap();
    assert_eq!(scheduler.worker_size(), 5);

    // Clamped to the number of pending ranges.
    knobs::set_reorg_worker_cnt(64);
    scheduler.adjust_worker_size().await.unwrap();
    assert_eq!(scheduler.worker_size(), 10);

    knobs::set_reorg_worker_cnt(1);
    scheduler.adjust_worker_size().await.unwrap();
    assert_eq!(scheduler.worker_size(), 1);

    scheduler.close().await;
    assert_eq!(scheduler.worker_size(), 0);
}

fn distributed_job(task_id: i64, start_key: Key) -> BackfillJob {
    BackfillJob {
        id: task_id,
        ddl_job_id: 7,
        ele_id: INDEX_ID,
        physical_table_id: TABLE_ID,
        instance_id: String::new(),
        instance_lease: std::time::UNIX_EPOCH,
        state: BackfillJobState::Running,
        meta: BackfillJobMeta {
            curr_key: start_key,
            row_count: 0,
            error: None,
        },
    }
}

fn worker_fixture(
    store: &TestStore,
    job_table: Arc<TestJobTable>,
) -> (
    flume::Sender<BackfillTask>,
    flume::Receiver<crate::task::BackfillResult>,
    tokio::task::JoinHandle<()>,
    JobContext,
) {
    let job_ctx = JobContext::new(7, BackfillKind::AddIndex);
    let ctx = BackfillContext {
        id: 0,
        store: Arc::new(store.clone()),
        table: test_table(TABLE_ID),
        job_ctx: job_ctx.clone(),
        batch_cnt: knobs::reorg_batch_size(),
        snapshot_version: Version::MAX,
        metric: metrics::backfill_rows_counter(BackfillKind::AddIndex, "t"),
        job_table: Some(job_table as Arc<dyn BackfillJobTable>),
        pause: Default::default(),
    };
    let backfiller = AddIndexBackfiller::new(
        ctx,
        IndexInfo {
            id: INDEX_ID,
            column_id: COLUMN_ID,
        },
    );
    let (task_tx, task_rx) = flume::bounded(4);
    let (result_tx, result_rx) = flume::bounded(4);
    let worker = BackfillWorker::new(
        0,
        Box::new(backfiller),
        task_rx,
        result_tx,
        CancellationToken::new(),
        job_ctx.clone(),
    );
    let handle = tokio::spawn(worker.run());
    (task_tx, result_rx, handle, job_ctx)
}

fn full_span_task(backfill_job: Option<BackfillJob>) -> BackfillTask {
    let (start, end) = record_span(TABLE_ID);
    BackfillTask {
        id: 0,
        job_id: 7,
        physical_table: test_table(TABLE_ID),
        start_key: start,
        end_key: end,
        end_include: false,
        priority: Default::default(),
        backfill_job,
    }
}

#[tokio::test]
async fn test_distributed_task_renews_lease_with_advancing_key() {
    let _guard = lock_knobs();
    knobs::set_reorg_batch_size(32);
    // Refresh the lease after every batch.
    knobs::set_update_instance_lease_ms(0);
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 100, COLUMN_ID);
    let job_table = TestJobTable::new();
    let (task_tx, result_rx, handle, _job_ctx) = worker_fixture(&store, job_table.clone());

    let (start, _) = record_span(TABLE_ID);
    let task = full_span_task(Some(distributed_job(0, start)));
    task_tx.send_async(task).await.unwrap();
    let result = result_rx.recv_async().await.unwrap();
    assert!(result.err.is_none(), "{:?}", result.err);
    assert_eq!(result.added_count, 100);

    let updates = job_table.lease_updates();
    assert!(!updates.is_empty());
    assert!(updates
        .windows(2)
        .all(|w| w[0].1 < w[1].1), "lease keys must strictly advance: {updates:?}");

    let job = job_table.job(0).unwrap();
    assert_eq!(job.state, BackfillJobState::Done);
    assert_eq!(job.meta.row_count, 100);
    assert_eq!(job_table.get_jobs(7).await.unwrap().len(), 1);

    drop(task_tx);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_missing_persisted_job_counts_as_success() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 10, COLUMN_ID);
    let job_table = TestJobTable::new();
    job_table.set_missing();
    let (task_tx, result_rx, handle, _job_ctx) = worker_fixture(&store, job_table.clone());

    let (start, _) = record_span(TABLE_ID);
    let task = full_span_task(Some(distributed_job(0, start)));
    task_tx.send_async(task).await.unwrap();
    let result = result_rx.recv_async().await.unwrap();
    assert!(result.err.is_none(), "{:?}", result.err);

    drop(task_tx);
    handle.await.unwrap();
}

struct PanickingBackfiller {
    ctx: BackfillContext,
}

#[async_trait::async_trait]
impl Backfiller for PanickingBackfiller {
    async fn backfill_batch(&mut self, _task_range: &BackfillTask) -> Result<BatchContext> {
        panic!("backfiller blew up");
    }

    fn ctx(&self) -> &BackfillContext {
        &self.ctx
    }

    fn ctx_mut(&mut self) -> &mut BackfillContext {
        &mut self.ctx
    }

    fn describe(&self) -> &'static str {
        "panicking"
    }
}

#[tokio::test]
async fn test_worker_panic_becomes_terminal_result() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    let job_ctx = JobContext::new(1, BackfillKind::AddIndex);
    let ctx = BackfillContext {
        id: 0,
        store: Arc::new(store.clone()),
        table: test_table(TABLE_ID),
        job_ctx: job_ctx.clone(),
        batch_cnt: 32,
        snapshot_version: Version::MAX,
        metric: metrics::backfill_rows_counter(BackfillKind::AddIndex, "t"),
        job_table: None,
        pause: Default::default(),
    };
    let (task_tx, task_rx) = flume::bounded(1);
    let (result_tx, result_rx) = flume::bounded(1);
    let worker = BackfillWorker::new(
        0,
        Box::new(PanickingBackfiller { ctx }),
        task_rx,
        result_tx,
        CancellationToken::new(),
        job_ctx,
    );
    let handle = tokio::spawn(worker.run());

    task_tx.send_async(full_span_task(None)).await.unwrap();
    let result = result_rx.recv_async().await.unwrap();
    let err = result.err.unwrap();
    assert!(matches!(
        err.downcast_ref::<ReorgError>(),
        Some(ReorgError::ReorgPanic)
    ));
    handle.await.unwrap();
}

#[tokio::test]
async fn test_update_column_rewrites_rows() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 40, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(2, BackfillKind::UpdateColumn);

    let (start, end) = record_span(TABLE_ID);
    let mut reorg = ReorgInfo::new(
        2,
        Element::column(2),
        BackfillKind::UpdateColumn,
        start,
        end,
    );
    reorg.column_change = Some(ColumnChange {
        old_column_id: COLUMN_ID,
        new_column_id: 2,
    });
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    for handle in 0..40i64 {
        let raw = store
            .get_value(&codec::encode_record_key(TABLE_ID, handle))
            .unwrap();
        let columns = codec::decode_row(&raw).unwrap();
        assert_eq!(columns, vec![(2, handle.to_be_bytes().to_vec())]);
    }
}

#[tokio::test]
async fn test_cleanup_removes_dropped_partition_entries() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    for handle in 0..20i64 {
        let partition = if handle % 2 == 0 { 100 } else { 200 };
        store.put(
            codec::encode_index_key(TABLE_ID, INDEX_ID, &handle.to_be_bytes(), handle),
            codec::encode_index_value(partition, handle),
        );
    }
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(3, BackfillKind::CleanupGlobalIndex);

    let index_prefix = codec::index_prefix(TABLE_ID, INDEX_ID);
    let mut reorg = ReorgInfo::new(
        3,
        Element::index(INDEX_ID),
        BackfillKind::CleanupGlobalIndex,
        index_prefix.clone(),
        index_prefix.prefix_next(),
    );
    reorg.dropped_partition_ids = vec![100];
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    let remaining = store.keys_with_prefix(&index_prefix);
    assert_eq!(remaining.len(), 10);
    for key in remaining {
        let raw = store.get_value(&key).unwrap();
        let (partition, _) = codec::decode_index_value(&raw).unwrap();
        assert_eq!(partition, 200);
    }
}

#[tokio::test]
async fn test_merge_folds_temp_index_into_final() {
    let _guard = lock_knobs();
    const TEMP_INDEX_ID: i64 = 5009;
    let store = TestStore::new();
    for handle in 0..10i64 {
        store.put(
            codec::encode_index_key(TABLE_ID, TEMP_INDEX_ID, &handle.to_be_bytes(), handle),
            codec::encode_index_value(TABLE_ID, handle),
        );
    }
    // Handle 99 was deleted while ingest ran: the temp index holds a delete
    // marker and the final index still has the stale entry.
    store.put(
        codec::encode_index_key(TABLE_ID, TEMP_INDEX_ID, &99i64.to_be_bytes(), 99),
        Vec::new(),
    );
    store.put(
        codec::encode_index_key(TABLE_ID, INDEX_ID, &99i64.to_be_bytes(), 99),
        codec::encode_index_value(TABLE_ID, 99),
    );

    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(4, BackfillKind::MergeTempIndex);
    let temp_prefix = codec::index_prefix(TABLE_ID, TEMP_INDEX_ID);
    let mut reorg = ReorgInfo::new(
        4,
        Element::index(INDEX_ID),
        BackfillKind::MergeTempIndex,
        temp_prefix.clone(),
        temp_prefix.prefix_next(),
    );
    reorg.temp_index_id = Some(TEMP_INDEX_ID);
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    assert_eq!(store.count_prefix(&temp_prefix), 0);
    let final_prefix = codec::index_prefix(TABLE_ID, INDEX_ID);
    assert_eq!(store.count_prefix(&final_prefix), 10);
    assert_eq!(
        store.get_value(&codec::encode_index_key(
            TABLE_ID,
            INDEX_ID,
            &99i64.to_be_bytes(),
            99
        )),
        None
    );
}

#[tokio::test]
async fn test_reorg_partition_copies_rows_to_destination() {
    let _guard = lock_knobs();
    const DEST_ID: i64 = 2;
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 25, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(5, BackfillKind::ReorgPartition);

    let (start, end) = record_span(TABLE_ID);
    let mut reorg = ReorgInfo::new(
        5,
        Element::index(INDEX_ID),
        BackfillKind::ReorgPartition,
        start,
        end,
    );
    reorg.dest_physical_id = Some(DEST_ID);
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    assert_eq!(store.count_prefix(&codec::record_prefix(DEST_ID)), 25);
    let copied = store
        .get_value(&codec::encode_record_key(DEST_ID, 7))
        .unwrap();
    assert_eq!(
        codec::decode_row(&copied).unwrap(),
        vec![(COLUMN_ID, 7i64.to_be_bytes().to_vec())]
    );
}

struct PrefetchingIngest {
    inner: RecordingIngest,
    prefetcher: Arc<RecordingPrefetcher>,
}

#[async_trait::async_trait]
impl crate::driver::IngestBackend for PrefetchingIngest {
    async fn flush(&self, element_id: i64) -> Result<()> {
        self.inner.flush(element_id).await
    }

    fn reset_workers(&self, job_id: i64, element_id: i64) {
        self.inner.reset_workers(job_id, element_id);
    }

    fn prefetcher(&self) -> Option<Arc<dyn crate::scheduler::RowPrefetcher>> {
        Some(self.prefetcher.clone())
    }
}

#[tokio::test]
async fn test_ingest_hooks_run_per_round() {
    let _guard = lock_knobs();
    let store = TestStore::new();
    seed_rows(&store, TABLE_ID, 10, COLUMN_ID);
    let meta = MemReorgMetaStore::new();
    let job_ctx = JobContext::new(6, BackfillKind::AddIndex);

    let prefetcher = Arc::new(RecordingPrefetcher::default());
    let ingest = Arc::new(PrefetchingIngest {
        inner: RecordingIngest::default(),
        prefetcher: prefetcher.clone(),
    });
    let mut reorg = add_index_reorg(6);
    reorg.ingest = Some(ingest.clone());
    run_driver(&store, &meta, reorg, &job_ctx, None).await.unwrap();

    assert_eq!(ingest.inner.flushes.lock().clone(), vec![INDEX_ID]);
    assert_eq!(ingest.inner.resets.lock().clone(), vec![(6, INDEX_ID)]);
    assert_eq!(prefetcher.tasks.lock().clone(), vec![0]);
}
