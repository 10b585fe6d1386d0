//! Modify-column backfill: rewrite rows with the changed column's value
//! converted and stored under the new column id.

use std::sync::Arc;

use anyhow::{
    Context,
    Result,
};
use async_trait::async_trait;
use common::{
    codec,
    kv::Mutation,
    table::ColumnChange,
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

/// Converts a column value from the old type to the new one. The cast
/// logic itself belongs to the expression layer; the pipeline only needs
/// this one operation.
pub trait ColumnConverter: Send + Sync {
    fn convert(&self, raw: &[u8]) -> Result<Vec<u8>>;
}

/// For changes that only alter the column's identity, not its encoding.
pub struct SameTypeConverter;

impl ColumnConverter for SameTypeConverter {
    fn convert(&self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

pub struct UpdateColumnBackfiller {
    ctx: BackfillContext,
    change: ColumnChange,
    converter: Arc<dyn ColumnConverter>,
}

impl UpdateColumnBackfiller {
    pub fn new(
        ctx: BackfillContext,
        change: ColumnChange,
        converter: Arc<dyn ColumnConverter>,
    ) -> Self {
        Self {
            ctx,
            change,
            converter,
        }
    }
}

#[async_trait]
impl Backfiller for UpdateColumnBackfiller {
    async fn backfill_batch(&mut self, task_range: &BackfillTask) -> Result<BatchContext> {
        let record_prefix = self.ctx.table.record_prefix();
        let fetched = fetch_entries(&self.ctx, task_range, &record_prefix).await?;

        let mut mutations = Vec::new();
        for (handle, key, raw_row) in &fetched.entries {
            (*handle).context("record key without a handle")?;
            let mut columns = codec::decode_row(raw_row)?;
            // A retried range may contain rows already rewritten; writing
            // the converted value again must stay a no-op.
            let Some(slot) = columns
                .iter_mut()
                .find(|(id, _)| *id == self.change.old_column_id)
            else {
                continue;
            };
            slot.0 = self.change.new_column_id;
            slot.1 = self.converter.convert(&slot.1)?;
            mutations.push(Mutation::Put(key.clone(), codec::encode_row(&columns)));
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
        "update column"
    }
}
