//! The three-phase pipeline: extract, transform, load.
//!
//! Each phase ends with a checkpoint naming the artifacts produced so far.
//! A resumed run skips phases the checkpoint records as completed and picks
//! up from their artifacts; an interrupted phase is re-run from its start.
//! Phase artifacts live under `work_dir` and survive the process, unlike
//! the scoped staging a non-checkpointed extraction would use.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument, warn};

use chatvault_core::checkpoint::Checkpoint;
use chatvault_core::config::EtlConfig;
use chatvault_core::context::{ErrorRecord, Phase, PhaseState, PhaseStatus, RunContext};
use chatvault_core::model::{ExportHeader, NormalizedConversation};
use chatvault_core::ndjson::{self, NdjsonWriter};
use chatvault_core::normalize::ContentNormalizer;
use chatvault_core::registry::MessageTypeRegistry;
use chatvault_core::stream::ConversationStream;
use chatvault_core::transform::{self, Transformer};
use chatvault_core::{Extractor, SourceKind};

use crate::loader::{LoadOutcome, Loader};

pub struct EtlPipeline {
    ctx: RunContext,
    registry: MessageTypeRegistry,
    artifacts: BTreeMap<Phase, PathBuf>,
    source: Option<PathBuf>,
    owner_display_name: Option<String>,
    member_hint: Option<String>,
    header: Option<ExportHeader>,
}

#[derive(Debug)]
pub struct RunResult {
    pub export_id: i64,
    pub conversations_loaded: u64,
    pub messages_loaded: u64,
    pub failed_batches: u64,
    pub phases: BTreeMap<Phase, PhaseState>,
    pub errors: Vec<ErrorRecord>,
}

impl EtlPipeline {
    pub fn new(config: EtlConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx: RunContext::new(config),
            registry: MessageTypeRegistry::with_builtins(),
            artifacts: BTreeMap::new(),
            source: None,
            owner_display_name: None,
            member_hint: None,
            header: None,
        })
    }

    pub fn config(&self) -> &EtlConfig {
        &self.ctx.config
    }

    pub fn config_mut(&mut self) -> &mut EtlConfig {
        &mut self.ctx.config
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Registry hook for callers that handle additional message types.
    pub fn registry_mut(&mut self) -> &mut MessageTypeRegistry {
        &mut self.registry
    }

    /// Archive member to unpack when the container holds more than one
    /// JSON document.
    pub fn set_member_hint(&mut self, hint: impl Into<String>) {
        self.member_hint = Some(hint.into());
    }

    /// Phases the current run state records as completed; a resumed run
    /// will skip these.
    pub fn available_checkpoints(&self) -> Vec<Phase> {
        self.ctx
            .phases()
            .iter()
            .filter(|(_, state)| state.status == PhaseStatus::Completed)
            .map(|(phase, _)| *phase)
            .collect()
    }

    /// Snapshot the run into a fresh checkpoint file.
    pub fn save_checkpoint(&self) -> Result<PathBuf> {
        let mut checkpoint = self.ctx.serialize_checkpoint(self.artifacts.clone());
        checkpoint.source = self.source.clone();
        checkpoint.owner_display_name = self.owner_display_name.clone();
        let path = checkpoint.write_to_dir(&self.ctx.config.checkpoint_dir)?;
        Ok(path)
    }

    /// Restore run state from a checkpoint file.
    pub fn load_from_checkpoint(&mut self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::read(path)?;
        self.ctx.restore_from_checkpoint(&checkpoint)?;
        self.artifacts = checkpoint.artifacts;
        self.source = checkpoint.source;
        self.owner_display_name = checkpoint.owner_display_name;
        self.header = None;
        info!(path = ?path, "restored pipeline state from checkpoint");
        Ok(())
    }

    /// Restore from the newest checkpoint in the configured directory.
    pub fn load_latest_checkpoint(&mut self) -> Result<bool> {
        let Some(checkpoint) = Checkpoint::latest_in_dir(&self.ctx.config.checkpoint_dir) else {
            return Ok(false);
        };
        self.ctx.restore_from_checkpoint(&checkpoint)?;
        self.artifacts = checkpoint.artifacts;
        self.source = checkpoint.source;
        self.owner_display_name = checkpoint.owner_display_name;
        self.header = None;
        Ok(true)
    }

    /// Run the pipeline end to end. With `resume` set, phases already
    /// completed in the restored state are skipped and their artifacts
    /// reused; otherwise the run starts from scratch.
    #[instrument(skip_all, fields(resume = resume))]
    pub async fn run(
        &mut self,
        source: impl AsRef<Path>,
        owner_display_name: &str,
        resume: bool,
    ) -> Result<RunResult> {
        let source = source.as_ref().to_path_buf();
        if !resume {
            self.ctx = RunContext::new(self.ctx.config.clone());
            self.artifacts.clear();
            self.header = None;
        } else if let Some(phase) = self.ctx.current_phase() {
            // Interrupted mid-phase: re-run that phase from its start.
            warn!(%phase, "checkpoint was taken mid-phase, re-running it");
            self.ctx.set_phase_status(phase, PhaseStatus::Pending)?;
        }
        self.source = Some(source.clone());
        self.owner_display_name = Some(owner_display_name.to_string());

        let extract_artifact = match self.reusable_artifact(Phase::Extract, resume) {
            Some(path) => path,
            None => self.run_extract(&source)?,
        };

        let transform_artifact = match self.reusable_artifact(Phase::Transform, resume) {
            Some(path) => path,
            None => self.run_transform(&extract_artifact, owner_display_name)?,
        };

        let outcome = if resume
            && self.ctx.phase_state(Phase::Load).status == PhaseStatus::Completed
        {
            info!("load phase already completed, nothing to do");
            LoadOutcome {
                export_id: self
                    .ctx
                    .phase_state(Phase::Load)
                    .summary
                    .get("export_id")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or_default(),
                ..Default::default()
            }
        } else {
            self.run_load(&extract_artifact, &transform_artifact, owner_display_name)
                .await?
        };

        Ok(RunResult {
            export_id: outcome.export_id,
            conversations_loaded: outcome.conversations_loaded,
            messages_loaded: outcome.messages_loaded,
            failed_batches: outcome.failed_batches,
            phases: self.ctx.phases().clone(),
            errors: self.ctx.errors().to_vec(),
        })
    }

    /// A completed phase's artifact, if resuming and it still exists.
    fn reusable_artifact(&self, phase: Phase, resume: bool) -> Option<PathBuf> {
        if !resume || self.ctx.phase_state(phase).status != PhaseStatus::Completed {
            return None;
        }
        match self.artifacts.get(&phase) {
            Some(path) if path.exists() => {
                info!(%phase, artifact = ?path, "skipping completed phase");
                Some(path.clone())
            }
            Some(path) => {
                warn!(%phase, artifact = ?path, "artifact missing, re-running phase");
                None
            }
            None => None,
        }
    }

    #[instrument(skip_all)]
    fn run_extract(&mut self, source: &Path) -> Result<PathBuf> {
        self.ctx.start_phase(Phase::Extract, 0, 0)?;
        let staging = self.ctx.config.work_dir.join("extracted");
        let hint = self.member_hint.clone();

        let opened = Extractor::open_into(source, hint.as_deref(), &staging)
            .and_then(|opened| Ok((opened.json_path().to_path_buf(), opened.kind(), opened.size_bytes()?)));
        match opened {
            Ok((path, kind, size)) => {
                let mut summary = serde_json::Map::new();
                summary.insert(
                    "source_kind".into(),
                    json!(match kind {
                        SourceKind::Json => "json",
                        SourceKind::Tar => "tar",
                    }),
                );
                summary.insert("document_bytes".into(), json!(size));
                self.artifacts.insert(Phase::Extract, path.clone());
                self.ctx.end_phase(Some(summary))?;
                self.save_checkpoint()?;
                Ok(path)
            }
            Err(err) => self.fail_phase(Phase::Extract, err.to_string()),
        }
    }

    #[instrument(skip_all)]
    fn run_transform(&mut self, artifact: &Path, owner_display_name: &str) -> Result<PathBuf> {
        self.ctx.start_phase(Phase::Transform, 0, 0)?;

        let config = self.ctx.config.clone();
        let streaming = match fs::metadata(artifact) {
            Ok(meta) => meta.len() >= config.stream_threshold_bytes,
            Err(err) => return self.fail_phase(Phase::Transform, err.to_string()),
        };

        let outcome: Result<(ExportHeader, transform::TransformedData)> = (|| {
            let transformer =
                Transformer::new(&config, &self.registry, ContentNormalizer::detect());
            if streaming {
                let stream = ConversationStream::from_path(artifact)?;
                Ok(transformer.transform_stream(stream, owner_display_name, &mut self.ctx)?)
            } else {
                let source = Extractor::open(artifact, None)?;
                let document = source.read_document()?;
                let data =
                    transformer.transform_document(&document, owner_display_name, &mut self.ctx)?;
                Ok((document.header(), data))
            }
        })();

        let (header, data) = match outcome {
            Ok(pair) => pair,
            Err(err) => return self.fail_phase(Phase::Transform, err.to_string()),
        };

        let written = self.write_transform_artifact(&data);
        match written {
            Ok(path) => {
                let mut summary = transform::summary(&data);
                summary.insert("mode".into(), json!(if streaming { "streaming" } else { "batch" }));
                self.header = Some(header);
                self.artifacts.insert(Phase::Transform, path.clone());
                self.ctx.end_phase(Some(summary))?;
                self.save_checkpoint()?;
                Ok(path)
            }
            Err(err) => self.fail_phase(Phase::Transform, err.to_string()),
        }
    }

    /// Conversations go into the artifact in id order so two runs over the
    /// same input produce identical files.
    fn write_transform_artifact(&self, data: &transform::TransformedData) -> Result<PathBuf> {
        fs::create_dir_all(&self.ctx.config.work_dir)?;
        let path = self.ctx.config.work_dir.join(format!(
            "normalized-{}.ndjson",
            Utc::now().timestamp_millis()
        ));
        let mut writer = NdjsonWriter::create(&path)?;
        let mut ids: Vec<&String> = data.conversations.keys().collect();
        ids.sort();
        for id in ids {
            writer.write_conversation(&data.conversations[id])?;
        }
        writer.finish()?;
        Ok(path)
    }

    #[instrument(skip_all)]
    async fn run_load(
        &mut self,
        extract_artifact: &Path,
        transform_artifact: &Path,
        owner_display_name: &str,
    ) -> Result<LoadOutcome> {
        // An unreadable artifact (e.g. corrupted after the transform
        // checkpoint was written) must still leave a Failed load phase and
        // a checkpoint behind.
        let conversations = match ndjson::read_conversations(transform_artifact) {
            Ok(conversations) => conversations,
            Err(err) => {
                self.ctx.start_phase(Phase::Load, 0, 0)?;
                return self.fail_phase(Phase::Load, err.to_string());
            }
        };
        let total_messages: u64 = conversations.iter().map(|c| c.message_count).sum();
        self.ctx
            .start_phase(Phase::Load, conversations.len() as u64, total_messages)?;

        let result = self
            .load_inner(extract_artifact, &conversations, owner_display_name)
            .await;
        match result {
            Ok(outcome) => {
                let mut summary = serde_json::Map::new();
                summary.insert("export_id".into(), json!(outcome.export_id));
                summary.insert("failed_batches".into(), json!(outcome.failed_batches));
                self.ctx.end_phase(Some(summary))?;
                self.save_checkpoint()?;
                Ok(outcome)
            }
            Err(err) => self.fail_phase(Phase::Load, err.to_string()),
        }
    }

    async fn load_inner(
        &mut self,
        extract_artifact: &Path,
        conversations: &[NormalizedConversation],
        owner_display_name: &str,
    ) -> Result<LoadOutcome> {
        let header = match self.header.clone() {
            Some(header) => header,
            None => read_header(extract_artifact)?,
        };
        let label = self
            .source
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned());

        let config = self.ctx.config.clone();
        // The raw body goes into the export row only when the document was
        // small enough for batch mode; otherwise the extract artifact on
        // disk is the raw record.
        let raw_document = match fs::metadata(extract_artifact) {
            Ok(meta) if meta.len() < config.stream_threshold_bytes => {
                Some(fs::read_to_string(extract_artifact)?)
            }
            _ => None,
        };

        let loader = Loader::connect(&config.database_url, config.batch_size).await?;
        loader.ensure_schema().await?;
        let export_id = loader
            .insert_raw_export(
                &header,
                owner_display_name,
                label.as_deref(),
                raw_document.as_deref(),
            )
            .await?;

        let mut outcome = LoadOutcome {
            export_id,
            ..Default::default()
        };
        let mut next_mark = config.checkpoint_interval.unwrap_or(u64::MAX);
        for conversation in conversations {
            let load = loader
                .load_conversation(export_id, conversation, &mut self.ctx)
                .await?;
            outcome.conversations_loaded += 1;
            outcome.messages_loaded += load.messages_loaded;
            outcome.failed_batches += load.failed_batches;

            if let Some(interval) = config.checkpoint_interval {
                let processed = self.ctx.phase_state(Phase::Load).processed_messages;
                if processed >= next_mark {
                    if let Err(err) = self.save_checkpoint() {
                        warn!(error = %err, "intra-phase checkpoint failed");
                    }
                    next_mark = processed + interval;
                }
            }
        }
        Ok(outcome)
    }

    fn fail_phase<T>(&mut self, phase: Phase, reason: String) -> Result<T> {
        self.ctx.record_error(phase, reason.clone());
        self.ctx.set_phase_status(phase, PhaseStatus::Failed)?;
        if self.ctx.current_phase() == Some(phase) {
            self.ctx.end_phase(None)?;
        }
        if let Err(err) = self.save_checkpoint() {
            warn!(error = %err, "failed to checkpoint after phase failure");
        }
        Err(anyhow!("{phase} phase failed: {reason}"))
    }
}

/// Header fields of an extracted export document. The streaming prologue
/// scan is cheap; documents whose header trails the conversations list fall
/// back to a full parse.
fn read_header(artifact: &Path) -> Result<ExportHeader> {
    match ConversationStream::from_path(artifact) {
        Ok(stream) => Ok(stream.header().clone()),
        Err(_) => {
            let source = Extractor::open(artifact, None)?;
            let document = source
                .read_document()
                .context("cannot recover export header from artifact")?;
            Ok(document.header())
        }
    }
}
