//! Checkpoint Store
//!
//! A checkpoint is a full snapshot of one phase's accumulated results for
//! one run, keyed `<run_id>.<phase>`. Every save overwrites the previous
//! snapshot. Unreadable or tampered snapshots are treated as absent so a
//! phase restarts from scratch instead of crashing.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;

use super::blob::BlobStore;
use crate::error::CheckpointError;

/// On-disk form. Results stay as raw JSON so the digest can be checked
/// without knowing the result type.
#[derive(Debug, Serialize, Deserialize)]
struct StoredSnapshot {
    run_id: String,
    phase: String,
    saved_at: DateTime<Utc>,
    digest: String,
    results: Value,
}

/// A loaded checkpoint
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint<R> {
    pub run_id: String,
    pub phase: String,
    pub saved_at: DateTime<Utc>,
    /// Item id -> result, for every durably processed item
    pub results: BTreeMap<String, R>,
}

impl<R> Checkpoint<R> {
    pub fn processed_ids(&self) -> BTreeSet<String> {
        self.results.keys().cloned().collect()
    }
}

/// Progress of one checkpointed phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecovery {
    pub phase: String,
    /// Items already durably processed
    pub processed: usize,
    pub saved_at: DateTime<Utc>,
}

/// Information about an interrupted run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryInfo {
    pub run_id: String,
    pub phases: Vec<PhaseRecovery>,
    /// Sum over all phases
    pub durably_processed: usize,
}

/// Typed checkpoint access over any [`BlobStore`]
pub struct CheckpointStore<R> {
    blobs: Arc<dyn BlobStore>,
    _results: PhantomData<fn() -> R>,
}

impl<R> Clone for CheckpointStore<R> {
    fn clone(&self) -> Self {
        Self {
            blobs: Arc::clone(&self.blobs),
            _results: PhantomData,
        }
    }
}

impl<R> std::fmt::Debug for CheckpointStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

/// Key a phase checkpoint is stored under
pub fn checkpoint_key(run_id: &str, phase: &str) -> String {
    format!("{}.{}", run_id, phase)
}

fn digest_of(results: &Value) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(results)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Serialize a snapshot and its digest into the stored blob
fn encode_snapshot<R: Serialize>(
    run_id: &str,
    phase: &str,
    results: &BTreeMap<String, R>,
) -> Result<(String, Vec<u8>), CheckpointError> {
    let key = checkpoint_key(run_id, phase);
    let encode = |source: serde_json::Error| CheckpointError::Encode {
        key: key.clone(),
        source,
    };

    let results = serde_json::to_value(results).map_err(encode)?;
    let snapshot = StoredSnapshot {
        run_id: run_id.to_string(),
        phase: phase.to_string(),
        saved_at: Utc::now(),
        digest: digest_of(&results).map_err(encode)?,
        results,
    };
    let blob = serde_json::to_vec_pretty(&snapshot).map_err(encode)?;
    Ok((key, blob))
}

impl<R> CheckpointStore<R>
where
    R: Serialize + DeserializeOwned,
{
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            _results: PhantomData,
        }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Overwrite the snapshot for `(run_id, phase)` with `results`
    pub fn save(
        &self,
        run_id: &str,
        phase: &str,
        results: &BTreeMap<String, R>,
    ) -> Result<(), CheckpointError> {
        let (key, blob) = encode_snapshot(run_id, phase, results)?;
        self.blobs.save(&key, &blob)
    }

    /// Like [`save`](Self::save), but the backend write runs on the blocking
    /// pool so file locks and fsyncs stay off the async workers.
    pub async fn save_offloaded(
        &self,
        run_id: &str,
        phase: &str,
        results: &BTreeMap<String, R>,
    ) -> Result<(), CheckpointError> {
        let (key, blob) = encode_snapshot(run_id, phase, results)?;
        let blobs = Arc::clone(&self.blobs);
        let task_key = key.clone();
        tokio::task::spawn_blocking(move || blobs.save(&task_key, &blob))
            .await
            .map_err(|e| CheckpointError::Io {
                key,
                source: std::io::Error::other(e.to_string()),
            })?
    }

    /// Load the snapshot for `(run_id, phase)`.
    ///
    /// Backend I/O failures are errors. Corrupt content is logged and
    /// reported as `None`.
    pub fn load(
        &self,
        run_id: &str,
        phase: &str,
    ) -> Result<Option<Checkpoint<R>>, CheckpointError> {
        let key = checkpoint_key(run_id, phase);
        let Some(blob) = self.blobs.load(&key)? else {
            return Ok(None);
        };

        let Some(snapshot) = parse_snapshot(&key, &blob) else {
            return Ok(None);
        };

        match serde_json::from_value::<BTreeMap<String, R>>(snapshot.results) {
            Ok(results) => {
                tracing::info!(key = %key, processed = results.len(), "Loaded checkpoint");
                Ok(Some(Checkpoint {
                    run_id: snapshot.run_id,
                    phase: snapshot.phase,
                    saved_at: snapshot.saved_at,
                    results,
                }))
            }
            Err(e) => {
                tracing::warn!(
                    key = %key,
                    error = %e,
                    "Checkpoint results unreadable, starting phase from scratch"
                );
                Ok(None)
            }
        }
    }

    /// Ids already processed for `(run_id, phase)`, empty when there is no
    /// usable checkpoint
    pub fn processed_ids(
        &self,
        run_id: &str,
        phase: &str,
    ) -> Result<BTreeSet<String>, CheckpointError> {
        Ok(self
            .load(run_id, phase)?
            .map(|c| c.processed_ids())
            .unwrap_or_default())
    }

    /// Delete the snapshot. Call only after the final artifact is durable.
    pub fn clear(&self, run_id: &str, phase: &str) -> Result<(), CheckpointError> {
        let key = checkpoint_key(run_id, phase);
        self.blobs.delete(&key)?;
        tracing::info!(key = %key, "Cleared checkpoint");
        Ok(())
    }

    /// Run ids that still have at least one checkpoint
    pub fn pending_runs(&self) -> Result<Vec<String>, CheckpointError> {
        let runs: BTreeSet<String> = self
            .blobs
            .list()?
            .into_iter()
            .filter_map(|key| key.rsplit_once('.').map(|(run, _)| run.to_string()))
            .collect();
        Ok(runs.into_iter().collect())
    }

    /// Summarise what an interrupted run already has on record
    pub fn recovery_info(&self, run_id: &str) -> Result<Option<RecoveryInfo>, CheckpointError> {
        let mut phases = Vec::new();

        for key in self.blobs.list()? {
            let Some((run, _)) = key.rsplit_once('.') else {
                continue;
            };
            if run != run_id {
                continue;
            }
            let Some(blob) = self.blobs.load(&key)? else {
                continue;
            };
            if let Some(snapshot) = parse_snapshot(&key, &blob) {
                let processed = snapshot.results.as_object().map(|m| m.len()).unwrap_or(0);
                phases.push(PhaseRecovery {
                    phase: snapshot.phase,
                    processed,
                    saved_at: snapshot.saved_at,
                });
            }
        }

        if phases.is_empty() {
            return Ok(None);
        }

        let durably_processed = phases.iter().map(|p| p.processed).sum();
        Ok(Some(RecoveryInfo {
            run_id: run_id.to_string(),
            phases,
            durably_processed,
        }))
    }
}

/// Parse and verify a stored snapshot; `None` on any corruption
fn parse_snapshot(key: &str, blob: &[u8]) -> Option<StoredSnapshot> {
    let snapshot: StoredSnapshot = match serde_json::from_slice(blob) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(key, error = %e, "Corrupt checkpoint, treating as absent");
            return None;
        }
    };

    match digest_of(&snapshot.results) {
        Ok(digest) if digest == snapshot.digest => Some(snapshot),
        _ => {
            tracing::warn!(key, "Checkpoint digest mismatch, treating as absent");
            None
        }
    }
}
