//! Partition reorganization: copy rows into their destination partition.

use anyhow::{
    Context,
    Result,
};
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

pub struct ReorgPartitionBackfiller {
    ctx: BackfillContext,
    dest_physical_id: i64,
}

impl ReorgPartitionBackfiller {
    pub fn new(ctx: BackfillContext, dest_physical_id: i64) -> Self {
        Self {
            ctx,
            dest_physical_id,
        }
    }
}

#[async_trait]
impl Backfiller for ReorgPartitionBackfiller {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext> {
        let record_prefix = self.ctx.table.record_prefix();
        let fetched = fetch_entries(&self.ctx, task_range, &record_prefix).await?;

        let mut mutations = Vec::with_capacity(fetched.entries.len());
        for (handle, _key, raw_row) in &fetched.entries {
            let handle = (*handle).context("record key without a handle")?;
            let dest_key = codec::encode_record_key(self.dest_physical_id, handle);
            mutations.push(Mutation::Put(dest_key, raw_row.clone()));
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
        "reorganize partition"
    }
}
