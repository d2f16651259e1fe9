//! Checkpoint save cadence
//!
//! Owned by the single coordinating loop that drains finished work, so
//! there is never more than one writer per phase. The snapshot is created
//! on the first recorded batch and then rewritten every K items.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use super::store::CheckpointStore;
use crate::error::CheckpointError;

pub struct CheckpointWriter<R> {
    store: CheckpointStore<R>,
    run_id: String,
    phase: String,
    every: usize,
    results: BTreeMap<String, R>,
    since_save: usize,
    created: bool,
    saves: usize,
}

impl<R> CheckpointWriter<R>
where
    R: Serialize + DeserializeOwned,
{
    /// Open the writer for `(run_id, phase)`, picking up an existing snapshot
    pub fn resume(
        store: CheckpointStore<R>,
        run_id: impl Into<String>,
        phase: impl Into<String>,
        every: usize,
    ) -> Result<Self, CheckpointError> {
        let run_id = run_id.into();
        let phase = phase.into();
        let existing = store.load(&run_id, &phase)?;
        let created = existing.is_some();
        let results = existing.map(|c| c.results).unwrap_or_default();

        if created {
            tracing::info!(
                run_id = %run_id,
                phase = %phase,
                already_processed = results.len(),
                "Resuming phase from checkpoint"
            );
        }

        Ok(Self {
            store,
            run_id,
            phase,
            every: every.max(1),
            results,
            since_save: 0,
            created,
            saves: 0,
        })
    }

    pub fn is_processed(&self, id: &str) -> bool {
        self.results.contains_key(id)
    }

    pub fn results(&self) -> &BTreeMap<String, R> {
        &self.results
    }

    /// Items durably recorded or pending the next save
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Snapshots written by this writer
    pub fn saves(&self) -> usize {
        self.saves
    }

    /// Record one finished sub-batch. Returns whether a snapshot was written.
    pub async fn record_batch<I>(&mut self, batch: I) -> Result<bool, CheckpointError>
    where
        I: IntoIterator<Item = (String, R)>,
    {
        let mut added = 0;
        for (id, result) in batch {
            self.results.insert(id, result);
            added += 1;
        }
        if added == 0 {
            return Ok(false);
        }
        self.since_save += added;

        if !self.created || self.since_save >= self.every {
            self.save().await?;
            return Ok(true);
        }
        Ok(false)
    }

    pub async fn record(
        &mut self,
        id: impl Into<String>,
        result: R,
    ) -> Result<bool, CheckpointError> {
        self.record_batch(std::iter::once((id.into(), result))).await
    }

    /// Write any unsaved results (end of phase or cancellation)
    pub async fn flush(&mut self) -> Result<(), CheckpointError> {
        if self.since_save > 0 {
            self.save().await?;
        }
        Ok(())
    }

    async fn save(&mut self) -> Result<(), CheckpointError> {
        self.store
            .save_offloaded(&self.run_id, &self.phase, &self.results)
            .await?;
        self.created = true;
        self.since_save = 0;
        self.saves += 1;
        tracing::debug!(
            run_id = %self.run_id,
            phase = %self.phase,
            processed = self.results.len(),
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Hand back everything recorded, saved or not
    pub fn into_results(self) -> BTreeMap<String, R> {
        self.results
    }

    /// Delete the snapshot once the phase artifact is durable
    pub fn clear(&self) -> Result<(), CheckpointError> {
        self.store.clear(&self.run_id, &self.phase)
    }
}
