use crate::config::{CommitMode, WriterConfig};
use crate::error::{PipelineError, Result};
use crate::storage::{RecordStore, UpsertPlan};
use crate::types::CastMember;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};

/// Fixed-capacity buffer between the row stream and the store.
///
/// `push` hands back a full batch as soon as the buffer reaches capacity;
/// `finish` hands back whatever is left at the end of the stream.
#[derive(Debug)]
pub struct BatchBuffer<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> BatchBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) -> Option<Vec<T>> {
        self.items.push(item);
        if self.items.len() >= self.capacity {
            Some(std::mem::replace(&mut self.items, Vec::with_capacity(self.capacity)))
        } else {
            None
        }
    }

    pub fn finish(self) -> Option<Vec<T>> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items)
        }
    }
}

/// Keep only the last row for each `credit_id`, preserving the order of the survivors.
///
/// A single upsert statement must not touch the same key twice.
pub fn collapse_duplicate_keys(batch: Vec<CastMember>) -> (Vec<CastMember>, usize) {
    let mut last_seen: HashMap<&str, usize> = HashMap::with_capacity(batch.len());
    for (idx, row) in batch.iter().enumerate() {
        last_seen.insert(row.credit_id.as_str(), idx);
    }
    if last_seen.len() == batch.len() {
        return (batch, 0);
    }

    let keep: Vec<bool> = batch
        .iter()
        .enumerate()
        .map(|(idx, row)| last_seen.get(row.credit_id.as_str()) == Some(&idx))
        .collect();
    let collapsed = batch.len() - last_seen.len();
    let survivors = batch
        .into_iter()
        .zip(keep)
        .filter_map(|(row, keep)| keep.then_some(row))
        .collect();
    (survivors, collapsed)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub batches: usize,
    pub rows: usize,
    pub duplicates_collapsed: usize,
}

/// Persists cast rows into the warehouse table with keyed upserts.
pub struct CastWriter<'a> {
    store: &'a mut dyn RecordStore,
    plan: UpsertPlan,
    config: &'a WriterConfig,
}

impl<'a> CastWriter<'a> {
    pub fn new(store: &'a mut dyn RecordStore, config: &'a WriterConfig) -> Result<Self> {
        let plan = UpsertPlan::for_cast(&config.table)
            .map_err(|e| PipelineError::Config(format!("writer.table: {e}")))?;
        Ok(Self { store, plan, config })
    }

    /// Write every row; with `CommitMode::Atomic` nothing is visible unless all batches succeed.
    #[instrument(skip(self, rows), fields(table = %self.plan.table(), batch_size = self.config.batch_size))]
    pub async fn write<I>(&mut self, rows: I) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = CastMember>,
    {
        if self.config.create_table {
            self.store
                .ensure_cast_table(&self.plan)
                .await
                .map_err(|source| PipelineError::Write { batch: 0, source })?;
        }

        match self.config.commit {
            CommitMode::Atomic => {
                self.store
                    .begin()
                    .await
                    .map_err(|source| PipelineError::Write { batch: 0, source })?;
                match self.write_batches(rows).await {
                    Ok(summary) => {
                        if let Err(source) = self.store.commit().await {
                            let e = PipelineError::Commit { source };
                            self.rollback_after(&e).await;
                            return Err(e);
                        }
                        info!(
                            "Committed {} rows in {} batches to {}",
                            summary.rows,
                            summary.batches,
                            self.plan.table()
                        );
                        Ok(summary)
                    }
                    Err(e) => {
                        self.rollback_after(&e).await;
                        Err(e)
                    }
                }
            }
            CommitMode::PerBatch => self.write_batches(rows).await,
        }
    }

    async fn write_batches<I>(&mut self, rows: I) -> Result<WriteSummary>
    where
        I: IntoIterator<Item = CastMember>,
    {
        let mut summary = WriteSummary::default();
        let mut buffer = BatchBuffer::new(self.config.batch_size);

        for row in rows {
            if let Some(batch) = buffer.push(row) {
                self.flush(summary.batches, batch, &mut summary).await?;
            }
        }
        if let Some(batch) = buffer.finish() {
            self.flush(summary.batches, batch, &mut summary).await?;
        }
        Ok(summary)
    }

    async fn flush(&mut self, index: usize, batch: Vec<CastMember>, summary: &mut WriteSummary) -> Result<()> {
        let (batch, collapsed) = collapse_duplicate_keys(batch);
        if collapsed > 0 {
            debug!(batch = index, "Collapsed {} duplicate credit_id rows", collapsed);
            crate::metrics::writer::duplicates_collapsed(collapsed);
        }

        let per_batch = self.config.commit == CommitMode::PerBatch;
        if per_batch {
            self.store
                .begin()
                .await
                .map_err(|source| PipelineError::Write { batch: index, source })?;
        }

        let result = self.store.upsert_cast_batch(&self.plan, &batch).await;
        let result = match result {
            Ok(_) if per_batch => self.store.commit().await.map(|_| ()),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(source) = result {
            let error = PipelineError::Write { batch: index, source };
            if per_batch {
                self.rollback_after(&error).await;
            }
            return Err(error);
        }

        debug!(batch = index, rows = batch.len(), "Upserted batch");
        crate::metrics::writer::batch_written(batch.len());
        summary.batches += 1;
        summary.rows += batch.len();
        summary.duplicates_collapsed += collapsed;
        Ok(())
    }

    async fn rollback_after(&mut self, cause: &PipelineError) {
        warn!("Rolling back cast write: {}", cause);
        if let Err(e) = self.store.rollback().await {
            warn!("Rollback failed: {}", e);
        }
    }
}
