//! Shared run context: configuration, the three-phase state machine,
//! progress counters, the advisory memory monitor, and the error log.
//!
//! The context is owned by the pipeline for the lifetime of a run and
//! passed by reference into each phase. Phase bookkeeping is only ever
//! touched from the thread driving a phase; during parallel transformation
//! the merge lock serializes progress updates (see `transform.rs`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::checkpoint::Checkpoint;
use crate::config::EtlConfig;
use crate::error::{EtlError, Result};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Extract,
    Transform,
    Load,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Extract, Phase::Transform, Phase::Load];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Load => "load",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "extract" => Ok(Phase::Extract),
            "transform" => Ok(Phase::Transform),
            "load" => Ok(Phase::Load),
            other => Err(EtlError::InvalidPhase { name: other.into() }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PhaseStatus {
    type Err = EtlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "running" => Ok(PhaseStatus::Running),
            "completed" => Ok(PhaseStatus::Completed),
            "failed" => Ok(PhaseStatus::Failed),
            other => Err(EtlError::InvalidStatus { name: other.into() }),
        }
    }
}

/// Per-phase bookkeeping. Counters are monotonically non-decreasing while
/// the phase runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseState {
    pub status: PhaseStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub total_conversations: u64,
    pub processed_conversations: u64,
    pub total_messages: u64,
    pub processed_messages: u64,
    /// Duration, counters and caller-supplied fields merged by `end_phase`.
    #[serde(default)]
    pub summary: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: Phase,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub struct RunContext {
    pub config: EtlConfig,
    current: Option<Phase>,
    phases: BTreeMap<Phase, PhaseState>,
    errors: Vec<ErrorRecord>,
    memory: MemoryMonitor,
}

impl RunContext {
    pub fn new(config: EtlConfig) -> Self {
        let memory = MemoryMonitor::new(
            config.memory_limit_mb * 1024 * 1024,
            Duration::from_secs(config.memory_cooldown_secs),
        );
        let phases = Phase::ALL
            .iter()
            .map(|phase| (*phase, PhaseState::default()))
            .collect();
        Self {
            config,
            current: None,
            phases,
            errors: Vec::new(),
            memory,
        }
    }

    pub fn current_phase(&self) -> Option<Phase> {
        self.current
    }

    pub fn phase_state(&self, phase: Phase) -> &PhaseState {
        &self.phases[&phase]
    }

    pub fn phases(&self) -> &BTreeMap<Phase, PhaseState> {
        &self.phases
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    /// Begin a phase. Fails if another phase is already running. Resets the
    /// phase's counters to the supplied totals.
    pub fn start_phase(
        &mut self,
        phase: Phase,
        total_conversations: u64,
        total_messages: u64,
    ) -> Result<()> {
        if let Some(running) = self.current {
            return Err(EtlError::invalid_state(format!(
                "cannot start phase '{phase}' while '{running}' is running"
            )));
        }
        let state = self.phases.get_mut(&phase).expect("all phases present");
        state.status = PhaseStatus::Running;
        state.started_at = Some(Utc::now());
        state.ended_at = None;
        state.total_conversations = total_conversations;
        state.processed_conversations = 0;
        state.total_messages = total_messages;
        state.processed_messages = 0;
        state.summary.clear();
        self.current = Some(phase);
        info!(%phase, total_conversations, total_messages, "phase started");
        Ok(())
    }

    /// Increment the running phase's processed counters. Calling with no
    /// active phase is not an error, just a logged warning.
    pub fn update_progress(&mut self, conversations: u64, messages: u64) {
        let Some(phase) = self.current else {
            warn!("progress update with no phase running");
            return;
        };
        let state = self.phases.get_mut(&phase).expect("all phases present");
        state.processed_conversations += conversations;
        state.processed_messages += messages;
    }

    /// Finish the running phase, merging `result` into its summary. Status
    /// becomes `Completed` unless the caller already marked the phase
    /// `Failed` via [`RunContext::set_phase_status`].
    pub fn end_phase(&mut self, result: Option<Map<String, Value>>) -> Result<Phase> {
        let Some(phase) = self.current.take() else {
            return Err(EtlError::invalid_state("end_phase with no phase running"));
        };
        let state = self.phases.get_mut(&phase).expect("all phases present");
        let ended = Utc::now();
        state.ended_at = Some(ended);
        if state.status != PhaseStatus::Failed {
            state.status = PhaseStatus::Completed;
        }

        if let Some(started) = state.started_at {
            let duration = ended - started;
            state.summary.insert(
                "duration_secs".into(),
                json!(duration.num_milliseconds() as f64 / 1000.0),
            );
        }
        state.summary.insert(
            "processed_conversations".into(),
            json!(state.processed_conversations),
        );
        state
            .summary
            .insert("processed_messages".into(), json!(state.processed_messages));
        if let Some(result) = result {
            state.summary.extend(result);
        }
        info!(%phase, status = %state.status, "phase ended");
        Ok(phase)
    }

    /// Explicitly set a phase's status; used to mark failure before
    /// `end_phase` so the reason is retained. `Running` is rejected: a
    /// phase only enters that state through [`RunContext::start_phase`],
    /// which keeps exactly one phase running at a time.
    pub fn set_phase_status(&mut self, phase: Phase, status: PhaseStatus) -> Result<()> {
        if status == PhaseStatus::Running {
            return Err(EtlError::invalid_state(format!(
                "phase '{phase}' can only enter 'running' through start_phase"
            )));
        }
        let state = self.phases.get_mut(&phase).expect("all phases present");
        state.status = status;
        if self.current == Some(phase) && status != PhaseStatus::Failed {
            // A phase force-reset to pending/completed no longer counts as
            // running.
            self.current = None;
        }
        Ok(())
    }

    /// Append to the error log. Does not change phase status by itself.
    pub fn record_error(&mut self, phase: Phase, message: impl Into<String>) {
        let message = message.into();
        warn!(%phase, error = %message, "recorded error");
        self.errors.push(ErrorRecord {
            phase,
            message,
            timestamp: Utc::now(),
        });
    }

    /// Advisory memory check, invoked at chunk boundaries. Returns true if
    /// a collection event was recorded.
    pub fn check_memory(&mut self) -> bool {
        self.memory.check()
    }

    pub fn memory_events(&self) -> u64 {
        self.memory.events
    }

    /// Snapshot the full run state for checkpointing.
    pub fn serialize_checkpoint(
        &self,
        artifacts: BTreeMap<Phase, std::path::PathBuf>,
    ) -> Checkpoint {
        Checkpoint::capture(self.current, self.phases.clone(), self.errors.clone(), artifacts)
    }

    /// Restore run state from a checkpoint snapshot. Fails if the snapshot
    /// was written by an incompatible schema version.
    pub fn restore_from_checkpoint(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        checkpoint.verify_version()?;
        self.current = checkpoint.current;
        self.phases = checkpoint.phases.clone();
        self.errors = checkpoint.errors.clone();
        debug!(saved_at = %checkpoint.saved_at, "restored run context from checkpoint");
        Ok(())
    }
}

/// Advisory resident-memory monitor with a cooldown gate. Sustained
/// pressure triggers at most one collection event per cooldown interval,
/// which keeps a storm of forced collections from hurting throughput.
struct MemoryMonitor {
    limit_bytes: u64,
    cooldown: Duration,
    last_trigger: Option<Instant>,
    events: u64,
}

impl MemoryMonitor {
    fn new(limit_bytes: u64, cooldown: Duration) -> Self {
        Self {
            limit_bytes,
            cooldown,
            last_trigger: None,
            events: 0,
        }
    }

    fn check(&mut self) -> bool {
        let Some(resident) = resident_bytes() else {
            return false;
        };
        if resident <= self.limit_bytes {
            return false;
        }
        if let Some(last) = self.last_trigger {
            if last.elapsed() < self.cooldown {
                return false;
            }
        }
        self.last_trigger = Some(Instant::now());
        self.events += 1;
        warn!(
            resident_mb = resident / (1024 * 1024),
            limit_mb = self.limit_bytes / (1024 * 1024),
            "memory pressure: recording collection event"
        );
        true
    }
}

/// Resident set size of this process, if the platform exposes it.
#[cfg(target_os = "linux")]
fn resident_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RunContext {
        RunContext::new(EtlConfig::default())
    }

    #[test]
    fn test_phase_name_parsing() {
        assert_eq!("extract".parse::<Phase>().unwrap(), Phase::Extract);
        assert!(matches!(
            "reticulate".parse::<Phase>(),
            Err(EtlError::InvalidPhase { .. })
        ));
        assert!(matches!(
            "done".parse::<PhaseStatus>(),
            Err(EtlError::InvalidStatus { .. })
        ));
    }

    #[test]
    fn test_happy_path_phase_lifecycle() {
        let mut ctx = ctx();
        ctx.start_phase(Phase::Extract, 2, 10).unwrap();
        assert_eq!(ctx.current_phase(), Some(Phase::Extract));

        ctx.update_progress(1, 5);
        ctx.update_progress(1, 5);
        let state = ctx.phase_state(Phase::Extract);
        assert_eq!(state.processed_conversations, 2);
        assert_eq!(state.processed_messages, 10);

        let mut extra = Map::new();
        extra.insert("export_id".into(), json!(7));
        ctx.end_phase(Some(extra)).unwrap();

        let state = ctx.phase_state(Phase::Extract);
        assert_eq!(state.status, PhaseStatus::Completed);
        assert_eq!(state.summary["export_id"], json!(7));
        assert_eq!(state.summary["processed_messages"], json!(10));
        assert!(state.summary.contains_key("duration_secs"));
    }

    #[test]
    fn test_double_start_rejected() {
        let mut ctx = ctx();
        ctx.start_phase(Phase::Extract, 0, 0).unwrap();
        assert!(matches!(
            ctx.start_phase(Phase::Transform, 0, 0),
            Err(EtlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_end_without_start_rejected() {
        let mut ctx = ctx();
        assert!(matches!(
            ctx.end_phase(None),
            Err(EtlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_progress_without_phase_is_noop() {
        let mut ctx = ctx();
        ctx.update_progress(1, 1);
        assert_eq!(ctx.phase_state(Phase::Extract).processed_messages, 0);
    }

    #[test]
    fn test_failed_status_survives_end_phase() {
        let mut ctx = ctx();
        ctx.start_phase(Phase::Load, 0, 0).unwrap();
        ctx.record_error(Phase::Load, "raw export insert failed");
        ctx.set_phase_status(Phase::Load, PhaseStatus::Failed).unwrap();
        ctx.end_phase(None).unwrap();

        assert_eq!(ctx.phase_state(Phase::Load).status, PhaseStatus::Failed);
        assert_eq!(ctx.errors().len(), 1);
        assert_eq!(ctx.errors()[0].phase, Phase::Load);
    }

    #[test]
    fn test_running_only_via_start_phase() {
        let mut ctx = ctx();
        ctx.start_phase(Phase::Extract, 0, 0).unwrap();
        assert!(matches!(
            ctx.set_phase_status(Phase::Transform, PhaseStatus::Running),
            Err(EtlError::InvalidState { .. })
        ));
        // the running phase is untouched
        assert_eq!(ctx.current_phase(), Some(Phase::Extract));
        assert_eq!(
            ctx.phase_state(Phase::Transform).status,
            PhaseStatus::Pending
        );
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let mut ctx = ctx();
        ctx.start_phase(Phase::Extract, 3, 30).unwrap();
        ctx.update_progress(3, 30);
        ctx.end_phase(None).unwrap();
        ctx.record_error(Phase::Extract, "one warning");

        let mut artifacts = BTreeMap::new();
        artifacts.insert(Phase::Extract, std::path::PathBuf::from("/tmp/raw.json"));
        let checkpoint = ctx.serialize_checkpoint(artifacts);

        let mut restored = RunContext::new(EtlConfig::default());
        restored.restore_from_checkpoint(&checkpoint).unwrap();
        assert_eq!(
            restored.phase_state(Phase::Extract).status,
            PhaseStatus::Completed
        );
        assert_eq!(restored.phase_state(Phase::Extract).processed_messages, 30);
        assert_eq!(restored.errors().len(), 1);
    }
}
