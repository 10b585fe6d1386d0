//! In-order collapsing of out-of-order task completions.

use std::collections::BTreeMap;

use common::Key;

/// Tasks complete in any order, but the resume key may only advance over
/// the longest prefix of consecutively finished task ids. Early arrivals
/// are parked until every smaller id has reported.
pub struct DoneTaskKeeper {
    pending: BTreeMap<usize, Key>,
    current: usize,
    pub next_key: Key,
}

impl DoneTaskKeeper {
    pub fn new(start: Key) -> Self {
        Self {
            pending: BTreeMap::new(),
            current: 0,
            next_key: start,
        }
    }

    pub fn update_next_key(&mut self, done_task_id: usize, next: Key) {
        if done_task_id == self.current {
            self.current += 1;
            self.next_key = next;
            while let Some(parked) = self.pending.remove(&self.current) {
                self.current += 1;
                self.next_key = parked;
            }
            return;
        }
        self.pending.insert(done_task_id, next);
    }
}
