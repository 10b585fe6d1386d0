//! Global-index cleanup: after partitions are dropped, their entries in a
//! global index are stale and must be removed.

use anyhow::Result;
use async_trait::async_trait;
use common::{
    codec,
    kv::Mutation,
};

use super::{
    commit_batch,
    fetch_entries,
};
use crate::{
    backfiller::{
        Backfiller,
        BackfillContext,
    },
    task::{
        BackfillTask,
        BatchContext,
    },
};

pub struct CleanupIndexBackfiller {
    ctx: BackfillContext,
    index_id: i64,
    dropped_partition_ids: Vec<i64>,
}

impl CleanupIndexBackfiller {
    pub fn new(ctx: BackfillContext, index_id: i64, dropped_partition_ids: Vec<i64>) -> Self {
        Self {
            ctx,
            index_id,
            dropped_partition_ids,
        }
    }
}

#[async_trait]
impl Backfiller for CleanupIndexBackfiller {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext> {
        let index_prefix = self.ctx.table.index_prefix(self.index_id);
        let fetched = fetch_entries(&self.ctx, task_range, &index_prefix).await?;

        let mut mutations = Vec::new();
        for (_, key, value) in &fetched.entries {
            let (partition_id, _handle) = codec::decode_index_value(value)?;
            if self.dropped_partition_ids.contains(&partition_id) {
                mutations.push(Mutation::Delete(key.clone()));
            }
        }

        let added_count = mutations.len();
        let finish_ts = commit_batch(&self.ctx, mutations).await?;
        Ok(BatchContext {
            next_key: fetched.next_key,
            done: fetched.done,
            added_count,
            scan_count: fetched.entries.len(),
            warnings: Default::default(),
            finish_ts,
        })
    }

    fn ctx(&self) -> &BackfillContext {
        &self.ctx
    }

    fn ctx_mut(&mut self) -> &mut BackfillContext {
        &mut self.ctx
    }

    fn describe(&self) -> &'static str {
        "clean up index"
    }
}
