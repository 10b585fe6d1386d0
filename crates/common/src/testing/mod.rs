//! Test doubles for the storage layer.

use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    },
    time::SystemTime,
};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{
    codec,
    key::{
        Key,
        KeyRange,
    },
    kv::{
        KvError,
        KvIterator,
        Mutation,
        RegionCache,
        Snapshot,
        SnapshotOptions,
        Store,
        Transaction,
        Version,
    },
};

type CommitCheck = Box<dyn FnMut(&[Mutation]) -> Option<anyhow::Error> + Send>;

#[derive(Default)]
struct Faults {
    /// Fail the next N region-cache lookups with a transient error.
    split_failures: AtomicUsize,
    /// Pretend no region covers any requested span.
    split_returns_empty: AtomicUsize,
    commit_check: Mutex<Option<CommitCheck>>,
}

/// An in-memory store. Snapshots copy the current state, so they are
/// isolated from later writes; explicit versions are ignored.
#[derive(Clone, Default)]
pub struct TestStore {
    data: Arc<Mutex<BTreeMap<Key, Vec<u8>>>>,
    region_splits: Option<Arc<Vec<Key>>>,
    faults: Arc<Faults>,
}

impl TestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A region-sharded store whose region boundaries are `splits`.
    pub fn with_region_splits(splits: Vec<Key>) -> Self {
        Self {
            region_splits: Some(Arc::new(splits)),
            ..Self::default()
        }
    }

    pub fn fail_next_region_lookups(&self, n: usize) {
        self.faults.split_failures.store(n, Ordering::SeqCst);
    }

    pub fn return_empty_region_ranges(&self, n: usize) {
        self.faults.split_returns_empty.store(n, Ordering::SeqCst);
    }

    /// Run `check` against every commit's mutations; returning an error
    /// fails that commit.
    pub fn set_commit_check(
        &self,
        check: impl FnMut(&[Mutation]) -> Option<anyhow::Error> + Send + 'static,
    ) {
        *self.faults.commit_check.lock() = Some(Box::new(check));
    }

    pub fn clear_commit_check(&self) {
        *self.faults.commit_check.lock() = None;
    }

    pub fn put(&self, key: Key, value: Vec<u8>) {
        self.data.lock().insert(key, value);
    }

    pub fn get_value(&self, key: &Key) -> Option<Vec<u8>> {
        self.data.lock().get(key).cloned()
    }

    pub fn insert_row(&self, table_id: i64, handle: i64, columns: &[(i64, Vec<u8>)]) {
        self.put(
            codec::encode_record_key(table_id, handle),
            codec::encode_row(columns),
        );
    }

    pub fn keys_with_prefix(&self, prefix: &Key) -> Vec<Key> {
        self.data
            .lock()
            .keys()
            .filter(|k| k.has_prefix(prefix))
            .cloned()
            .collect()
    }

    pub fn count_prefix(&self, prefix: &Key) -> usize {
        self.keys_with_prefix(prefix).len()
    }
}

#[async_trait]
impl Store for TestStore {
    async fn snapshot(
        &self,
        _version: Version,
        _options: SnapshotOptions,
    ) -> Result<Arc<dyn Snapshot>> {
        Ok(Arc::new(TestSnapshot {
            data: self.data.lock().clone(),
        }))
    }

    fn region_cache(&self) -> Option<Arc<dyn RegionCache>> {
        self.region_splits.as_ref().map(|splits| {
            Arc::new(TestRegionCache {
                splits: splits.clone(),
                faults: self.faults.clone(),
            }) as Arc<dyn RegionCache>
        })
    }

    async fn oracle_time(&self) -> Result<SystemTime> {
        Ok(SystemTime::now())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(TestTransaction {
            store: self.clone(),
            mutations: Vec::new(),
        }))
    }
}

struct TestSnapshot {
    data: BTreeMap<Key, Vec<u8>>,
}

#[async_trait]
impl Snapshot for TestSnapshot {
    async fn iter(&self, lower: Key, upper: Key) -> Result<Box<dyn KvIterator>> {
        let entries = if upper <= lower {
            Vec::new()
        } else {
            self.data
                .range((Bound::Included(&lower), Bound::Excluded(&upper)))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        Ok(Box::new(TestIter { entries, pos: 0 }))
    }

    async fn iter_reverse(&self, upper: Key) -> Result<Box<dyn KvIterator>> {
        let entries = self
            .data
            .range(..upper)
            .rev()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Box::new(TestIter { entries, pos: 0 }))
    }

    async fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }
}

struct TestIter {
    entries: Vec<(Key, Vec<u8>)>,
    pos: usize,
}

#[async_trait]
impl KvIterator for TestIter {
    fn valid(&self) -> bool {
        self.pos < self.entries.len()
    }

    fn key(&self) -> &Key {
        &self.entries[self.pos].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.pos].1
    }

    async fn next(&mut self) -> Result<()> {
        self.pos += 1;
        Ok(())
    }
}

struct TestTransaction {
    store: TestStore,
    mutations: Vec<Mutation>,
}

#[async_trait]
impl Transaction for TestTransaction {
    async fn get(&mut self, key: &Key) -> Result<Option<Vec<u8>>> {
        for mutation in self.mutations.iter().rev() {
            match mutation {
                Mutation::Put(k, v) if k == key => return Ok(Some(v.clone())),
                Mutation::Delete(k) if k == key => return Ok(None),
                _ => {},
            }
        }
        Ok(self.store.get_value(key))
    }

    fn put(&mut self, key: Key, value: Vec<u8>) {
        self.mutations.push(Mutation::Put(key, value));
    }

    fn delete(&mut self, key: Key) {
        self.mutations.push(Mutation::Delete(key));
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        if let Some(check) = self.store.faults.commit_check.lock().as_mut() {
            if let Some(err) = check(&self.mutations) {
                return Err(err);
            }
        }
        let mut data = self.store.data.lock();
        for mutation in self.mutations {
            match mutation {
                Mutation::Put(k, v) => {
                    data.insert(k, v);
                },
                Mutation::Delete(k) => {
                    data.remove(&k);
                },
            }
        }
        Ok(())
    }
}

struct TestRegionCache {
    splits: Arc<Vec<Key>>,
    faults: Arc<Faults>,
}

#[async_trait]
impl RegionCache for TestRegionCache {
    async fn split_region_ranges(&self, range: KeyRange, limit: usize) -> Result<Vec<KeyRange>> {
        if take_one(&self.faults.split_failures) {
            return Err(anyhow::Error::new(KvError::RegionUnavailable));
        }
        if take_one(&self.faults.split_returns_empty) {
            return Ok(Vec::new());
        }
        let mut ranges = Vec::new();
        let mut current = range.start_key.clone();
        for split in self.splits.iter() {
            if ranges.len() == limit {
                return Ok(ranges);
            }
            if *split <= current {
                continue;
            }
            if *split >= range.end_key {
                break;
            }
            ranges.push(KeyRange::new(current, split.clone()));
            current = split.clone();
        }
        if ranges.len() < limit {
            ranges.push(KeyRange::new(current, range.end_key));
        }
        Ok(ranges)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
