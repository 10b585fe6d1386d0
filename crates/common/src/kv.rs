//! The key-value store abstraction the backfill engine runs against.
//!
//! The real storage layer is a distributed, region-sharded transactional
//! store; tests use [`crate::testing::TestStore`]. The engine only depends
//! on the operations here: snapshot reads at a fixed version, forward and
//! reverse iteration, short write transactions, a region map for splitting,
//! and an oracle clock for lease math.

use std::{
    sync::Arc,
    time::SystemTime,
};

use anyhow::Result;
use async_trait::async_trait;

use crate::key::{
    Key,
    KeyRange,
};

/// A read timestamp. `Version::MAX` reads the latest committed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u64);

impl Version {
    pub const MAX: Version = Version(u64::MAX);
}

/// Request priority, forwarded to the storage layer for QoS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Options attached to every snapshot the engine opens, for observability
/// and QoS on the storage side.
#[derive(Clone, Debug, Default)]
pub struct SnapshotOptions {
    pub priority: Priority,
    pub request_source_internal: bool,
    pub request_source_type: &'static str,
    pub resource_group_tag: Option<String>,
}

/// Storage errors the engine classifies. Everything else is opaque and
/// treated as terminal for the current task.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("write conflict")]
    WriteConflict,
    #[error("region unavailable")]
    RegionUnavailable,
    #[error("read timestamp outdated")]
    TimestampOutdated,
}

/// Transient store errors are retried by whoever owns the operation (the
/// row processors for commits, the splitter for region lookups).
pub fn is_retryable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<KvError>(),
        Some(KvError::WriteConflict | KvError::RegionUnavailable | KvError::TimestampOutdated)
    )
}

/// A buffered write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mutation {
    Put(Key, Vec<u8>),
    Delete(Key),
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Open a read snapshot at `version`.
    async fn snapshot(&self, version: Version, options: SnapshotOptions)
        -> Result<Arc<dyn Snapshot>>;

    /// The region map, when the store is region-sharded. In-memory stores
    /// return `None` and the splitter falls back to a single range.
    fn region_cache(&self) -> Option<Arc<dyn RegionCache>>;

    /// The storage layer's clock, used for lease expiry math.
    async fn oracle_time(&self) -> Result<SystemTime>;

    /// Begin a short write transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

#[async_trait]
pub trait Snapshot: Send + Sync {
    /// Iterate keys in `[lower, upper)` ascending.
    async fn iter(&self, lower: Key, upper: Key) -> Result<Box<dyn KvIterator>>;

    /// Iterate keys strictly below `upper`, descending.
    async fn iter_reverse(&self, upper: Key) -> Result<Box<dyn KvIterator>>;

    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;
}

/// Storage-client style cursor. `key`/`value` must only be called while
/// `valid()` returns true.
#[async_trait]
pub trait KvIterator: Send {
    fn valid(&self) -> bool;
    fn key(&self) -> &Key;
    fn value(&self) -> &[u8];
    async fn next(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Transaction: Send {
    async fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: Key, value: Vec<u8>);
    fn delete(&mut self, key: Key);
    async fn commit(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait RegionCache: Send + Sync {
    /// Intersect `range` with region boundaries, returning at most `limit`
    /// sub-ranges in order.
    async fn split_region_ranges(&self, range: KeyRange, limit: usize) -> Result<Vec<KeyRange>>;
}

/// Advance `it` while `pred` holds for the current key. Used to skip the
/// residual versions belonging to a row once its first key was handled.
pub async fn next_until(
    it: &mut dyn KvIterator,
    mut pred: impl FnMut(&Key) -> bool + Send,
) -> Result<()> {
    while it.valid() && pred(it.key()) {
        it.next().await?;
    }
    Ok(())
}
