//! Checkpoint files: versioned snapshots of run state plus pointers to the
//! artifacts the completed phases produced.
//!
//! Checkpoints reference artifact paths, never embedded payloads, so a
//! checkpoint stays small no matter how large the export is. Every write
//! produces a new file; existing checkpoints are never mutated in place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{ErrorRecord, Phase, PhaseState, PhaseStatus};
use crate::error::{EtlError, Result};

/// Bump when the serialized shape changes incompatibly.
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub current: Option<Phase>,
    pub phases: BTreeMap<Phase, PhaseState>,
    pub errors: Vec<ErrorRecord>,
    /// Artifact paths keyed by the phase that produced them.
    pub artifacts: BTreeMap<Phase, PathBuf>,
    /// Original source path and owner name, so a resumed pipeline can
    /// verify it was pointed at the same run.
    pub source: Option<PathBuf>,
    pub owner_display_name: Option<String>,
}

impl Checkpoint {
    pub(crate) fn capture(
        current: Option<Phase>,
        phases: BTreeMap<Phase, PhaseState>,
        errors: Vec<ErrorRecord>,
        artifacts: BTreeMap<Phase, PathBuf>,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            saved_at: Utc::now(),
            current,
            phases,
            errors,
            artifacts,
            source: None,
            owner_display_name: None,
        }
    }

    pub fn verify_version(&self) -> Result<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(EtlError::CheckpointVersion {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        Ok(())
    }

    /// Phases this checkpoint records as completed, in phase order.
    pub fn completed_phases(&self) -> Vec<Phase> {
        self.phases
            .iter()
            .filter(|(_, state)| state.status == PhaseStatus::Completed)
            .map(|(phase, _)| *phase)
            .collect()
    }

    /// Write a fresh checkpoint file into `dir` and return its path.
    pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let label = self
            .completed_phases()
            .last()
            .map(Phase::as_str)
            .unwrap_or("start");
        let path = dir.join(format!(
            "checkpoint-{label}-{}.json",
            self.saved_at.timestamp_millis()
        ));
        let json = serde_json::to_string_pretty(self)
            .map_err(|err| EtlError::json("checkpoint", err))?;
        fs::write(&path, json)?;
        debug!(path = ?path, "wrote checkpoint");
        Ok(path)
    }

    pub fn read(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EtlError::not_found(path));
        }
        let content = fs::read_to_string(path)?;
        let checkpoint: Self = serde_json::from_str(&content)
            .map_err(|err| EtlError::json(format!("checkpoint {path:?}"), err))?;
        checkpoint.verify_version()?;
        Ok(checkpoint)
    }

    /// Newest parseable checkpoint in `dir`, if any. Unreadable or
    /// version-mismatched files are skipped with a warning.
    pub fn latest_in_dir(dir: &Path) -> Option<Self> {
        let entries = fs::read_dir(dir).ok()?;
        let mut newest: Option<Self> = None;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(checkpoint) => {
                    // Tiebreak on progress: same-millisecond writes happen
                    // on fast runs.
                    let key = |c: &Self| (c.saved_at, c.completed_phases().len());
                    let is_newer = newest
                        .as_ref()
                        .map(|current| key(&checkpoint) > key(current))
                        .unwrap_or(true);
                    if is_newer {
                        newest = Some(checkpoint);
                    }
                }
                Err(err) => warn!(path = ?path, error = %err, "skipping unreadable checkpoint"),
            }
        }
        newest
    }
}
