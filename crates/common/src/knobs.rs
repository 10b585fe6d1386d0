//! Tunable limits and parameters for the backfill engine.
//!
//! Static knobs are read once from the environment. The reorg variables
//! (`reorg_worker_cnt`, `reorg_batch_size`, `slow_operation_threshold`,
//! `update_instance_lease`, `backfill_task_chan_size`) are re-read while a
//! job runs, so they live behind atomic accessors that tests and an admin
//! surface can drive.

use std::{
    sync::{
        atomic::{
            AtomicU64,
            AtomicUsize,
            Ordering,
        },
        LazyLock,
    },
    time::Duration,
};

use crate::env::env_config;

/// Lower bound for `reorg_batch_size`.
pub const MIN_REORG_BATCH_SIZE: usize = 32;
/// Upper bound for `reorg_batch_size`.
pub const MAX_REORG_BATCH_SIZE: usize = 10240;
/// Upper bound for `reorg_worker_cnt`.
pub const MAX_REORG_WORKER_CNT: usize = 256;

/// How long a claimed backfill task's lease lasts before another instance
/// may take it over.
pub static INSTANCE_LEASE: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("BACKFILL_INSTANCE_LEASE_SECS", 60)));

/// Total time budget for retrying transient region-cache lookup failures
/// while splitting ranges.
pub static SPLIT_REGION_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SPLIT_REGION_MAX_BACKOFF_MS", 10_000)));

static REORG_WORKER_CNT: LazyLock<AtomicUsize> =
    LazyLock::new(|| AtomicUsize::new(env_config("REORG_WORKER_CNT", 4)));

static REORG_BATCH_SIZE: LazyLock<AtomicUsize> =
    LazyLock::new(|| AtomicUsize::new(env_config("REORG_BATCH_SIZE", 256)));

static SLOW_OPERATION_THRESHOLD_MS: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(env_config("SLOW_OPERATION_THRESHOLD_MS", 300)));

static UPDATE_INSTANCE_LEASE_MS: LazyLock<AtomicU64> =
    LazyLock::new(|| AtomicU64::new(env_config("UPDATE_INSTANCE_LEASE_MS", 25_000)));

static BACKFILL_TASK_CHAN_SIZE: LazyLock<AtomicUsize> =
    LazyLock::new(|| AtomicUsize::new(env_config("BACKFILL_TASK_CHAN_SIZE", 1024)));

/// Desired backfill worker concurrency. Re-read on every dispatch round and
/// periodically while waiting for results.
pub fn reorg_worker_cnt() -> usize {
    REORG_WORKER_CNT.load(Ordering::Relaxed)
}

pub fn set_reorg_worker_cnt(n: usize) {
    REORG_WORKER_CNT.store(n.clamp(1, MAX_REORG_WORKER_CNT), Ordering::Relaxed);
}

/// Rows per transactional batch. Re-read before every batch.
pub fn reorg_batch_size() -> usize {
    REORG_BATCH_SIZE.load(Ordering::Relaxed)
}

pub fn set_reorg_batch_size(n: usize) {
    REORG_BATCH_SIZE.store(
        n.clamp(MIN_REORG_BATCH_SIZE, MAX_REORG_BATCH_SIZE),
        Ordering::Relaxed,
    );
}

/// Operations slower than this get a slow-operation log line.
pub fn slow_operation_threshold() -> Duration {
    Duration::from_millis(SLOW_OPERATION_THRESHOLD_MS.load(Ordering::Relaxed))
}

pub fn set_slow_operation_threshold_ms(ms: u64) {
    SLOW_OPERATION_THRESHOLD_MS.store(ms, Ordering::Relaxed);
}

/// Minimum interval between lease refreshes for a distributed backfill task.
pub fn update_instance_lease() -> Duration {
    Duration::from_millis(UPDATE_INSTANCE_LEASE_MS.load(Ordering::Relaxed))
}

pub fn set_update_instance_lease_ms(ms: u64) {
    UPDATE_INSTANCE_LEASE_MS.store(ms, Ordering::Relaxed);
}

/// Capacity of the scheduler's shared task channel, and the maximum number
/// of ranges dispatched per round.
pub fn backfill_task_chan_size() -> usize {
    BACKFILL_TASK_CHAN_SIZE.load(Ordering::Relaxed).max(1)
}

pub fn set_backfill_task_chan_size(n: usize) {
    BACKFILL_TASK_CHAN_SIZE.store(n.max(1), Ordering::Relaxed);
}
