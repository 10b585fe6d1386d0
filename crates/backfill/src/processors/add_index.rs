//! Transactional add-index backfill: derive an index entry from every
//! existing row.

use std::collections::BTreeMap;

use anyhow::{
    Context,
    Result,
};
use async_trait::async_trait;
use common::{
    codec,
    kv::Mutation,
    table::IndexInfo,
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

pub struct AddIndexBackfiller {
    ctx: BackfillContext,
    index: IndexInfo,
}

impl AddIndexBackfiller {
    pub fn new(ctx: BackfillContext, index: IndexInfo) -> Self {
        Self { ctx, index }
    }
}

#[async_trait]
impl Backfiller for AddIndexBackfiller {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext> {
        let record_prefix = self.ctx.table.record_prefix();
        let fetched = fetch_entries(&self.ctx, task_range, &record_prefix).await?;

        let mut mutations = Vec::with_capacity(fetched.entries.len());
        let mut warnings = BTreeMap::new();
        for (handle, _key, raw_row) in &fetched.entries {
            let handle = (*handle).context("record key without a handle")?;
            let columns = codec::decode_row(raw_row)?;
            let Some((_, value)) = columns.iter().find(|(id, _)| *id == self.index.column_id)
            else {
                // Null values are not indexed; remember that we skipped one.
                *warnings
                    .entry(format!("column {} missing, row skipped", self.index.column_id))
                    .or_insert(0) += 1;
                continue;
            };
            let index_key = codec::encode_index_key(
                self.ctx.table.physical_id,
                self.index.id,
                value,
                handle,
            );
            let index_value = codec::encode_index_value(self.ctx.table.physical_id, handle);
            mutations.push(Mutation::Put(index_key, index_value));
        }

        let added_count = mutations.len();
        let finish_ts = commit_batch(&self.ctx, mutations).await?;
        Ok(BatchContext {
            next_key: fetched.next_key,
            done: fetched.done,
            added_count,
            scan_count: fetched.entries.len(),
            warnings,
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
        "add index"
    }
}
