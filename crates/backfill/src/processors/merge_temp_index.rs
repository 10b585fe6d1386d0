//! Merging a temporary index into the final one.
//!
//! While an index is built through bulk ingest, concurrent DML writes land
//! in a temporary index. Once ingest finishes, those entries are folded
//! into the real index: an empty temp value is a delete marker, anything
//! else is copied verbatim. Consumed temp entries are removed.

use anyhow::Result;
use async_trait::async_trait;
use common::{
    codec,
    kv::Mutation,
    Key,
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

pub struct MergeTempIndexBackfiller {
    ctx: BackfillContext,
    index_id: i64,
    temp_index_id: i64,
}

impl MergeTempIndexBackfiller {
    pub fn new(ctx: BackfillContext, index_id: i64, temp_index_id: i64) -> Self {
        Self {
            ctx,
            index_id,
            temp_index_id,
        }
    }
}

#[async_trait]
impl Backfiller for MergeTempIndexBackfiller {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext> {
        let temp_prefix = self.ctx.table.index_prefix(self.temp_index_id);
        let final_prefix = self.ctx.table.index_prefix(self.index_id);
        let fetched = fetch_entries(&self.ctx, task_range, &temp_prefix).await?;

        let mut mutations = Vec::new();
        let mut added_count = 0;
        for (_, key, value) in &fetched.entries {
            let suffix = codec::index_key_suffix(key, &temp_prefix)?;
            let mut final_key = final_prefix.clone().into_bytes();
            final_key.extend_from_slice(suffix);
            let final_key = Key::new(final_key);
            if value.is_empty() {
                mutations.push(Mutation::Delete(final_key));
            } else {
                mutations.push(Mutation::Put(final_key, value.clone()));
                added_count += 1;
            }
            mutations.push(Mutation::Delete(key.clone()));
        }

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
        "merge temporary index"
    }
}
