//! Conversion of raw conversations into normalized, ordered records.
//!
//! Conversations are independent units of work: the transformer can walk
//! them serially or fan them out across a bounded rayon pool. Workers share
//! no mutable state; results and progress are merged into the output map
//! under a single mutex held only for the merge step. One conversation's
//! failure never aborts its siblings.
//!
//! Within a conversation, messages are processed in chunks of
//! `chunk_size` to bound peak memory, with the run context's advisory
//! memory check invoked at every chunk boundary.

use std::collections::HashMap;
use std::sync::Mutex;

use rayon::prelude::*;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

use crate::config::EtlConfig;
use crate::context::{Phase, RunContext};
use crate::error::{EtlError, Result};
use crate::model::{
    parse_timestamp, Conversation, ExportDocument, ExportHeader, Message, NormalizedConversation,
    NormalizedMessage,
};
use crate::normalize::ContentNormalizer;
use crate::registry::MessageTypeRegistry;
use crate::stream::ConversationStream;

/// Message types whose raw content is ordinary renderable text.
const TEXT_TYPES: &[&str] = &["Text", "RichText"];

#[derive(Debug, Clone)]
pub struct TransformError {
    pub conversation_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct TransformedData {
    pub conversations: HashMap<String, NormalizedConversation>,
    pub errors: Vec<TransformError>,
}

impl TransformedData {
    pub fn message_count(&self) -> u64 {
        self.conversations.values().map(|c| c.message_count).sum()
    }
}

pub struct Transformer<'a> {
    config: &'a EtlConfig,
    registry: &'a MessageTypeRegistry,
    normalizer: ContentNormalizer,
}

/// Everything the parallel workers merge under the single lock: the output
/// map and the run context's progress counters.
struct MergeState<'a> {
    data: TransformedData,
    ctx: &'a mut RunContext,
}

impl<'a> Transformer<'a> {
    pub fn new(
        config: &'a EtlConfig,
        registry: &'a MessageTypeRegistry,
        normalizer: ContentNormalizer,
    ) -> Self {
        Self {
            config,
            registry,
            normalizer,
        }
    }

    /// Transform a fully materialized export document.
    #[instrument(skip_all)]
    pub fn transform_document(
        &self,
        document: &ExportDocument,
        owner_display_name: &str,
        ctx: &mut RunContext,
    ) -> Result<TransformedData> {
        if document.owner_id.is_empty() {
            return Err(EtlError::schema("export document has empty owner id"));
        }

        // Resolve sender display names across the whole export up front, so
        // a message with no name still gets one if the sender is named
        // anywhere else.
        let mut names = HashMap::new();
        names.insert(document.owner_id.clone(), owner_display_name.to_string());
        for conversation in &document.conversations {
            collect_sender_names(conversation, &mut names);
        }

        if self.config.parallel {
            self.transform_parallel(&document.conversations, &names, ctx)
        } else {
            let mut data = TransformedData::default();
            for conversation in &document.conversations {
                self.merge_serial(conversation, &names, &mut data, ctx);
            }
            Ok(data)
        }
    }

    /// Transform a lazy conversation stream. Extraction stays cooperative
    /// and single-threaded; in parallel mode the already-yielded
    /// conversations are bridged onto the worker pool.
    ///
    /// Unlike [`Transformer::transform_document`], the sender-name lookup
    /// is built per conversation, since a forward-only stream cannot be
    /// scanned twice. Observable consequence: a sender who is named only in
    /// some other conversation stays unresolved here, though the owner id
    /// always resolves to `owner_display_name`.
    #[instrument(skip_all)]
    pub fn transform_stream(
        &self,
        stream: ConversationStream,
        owner_display_name: &str,
        ctx: &mut RunContext,
    ) -> Result<(ExportHeader, TransformedData)> {
        let header = stream.header().clone();
        let owner_binding = (header.owner_id.clone(), owner_display_name.to_string());

        let data = if self.config.parallel {
            let pool = self.build_pool()?;
            let merge = Mutex::new(MergeState {
                data: TransformedData::default(),
                ctx,
            });
            pool.install(|| {
                stream.par_bridge().for_each(|result| {
                    let outcome = result.map(|conversation| {
                        let mut names = HashMap::new();
                        names.insert(owner_binding.0.clone(), owner_binding.1.clone());
                        collect_sender_names(&conversation, &mut names);
                        self.normalize_conversation(&conversation, &names, |_| {})
                    });
                    let mut guard = merge.lock().expect("transform merge lock");
                    match outcome {
                        Ok(Ok(normalized)) => guard.absorb(normalized),
                        Ok(Err(err)) => guard.reject(err),
                        Err(err) => guard.reject(TransformError {
                            conversation_id: "<stream>".into(),
                            reason: err.to_string(),
                        }),
                    }
                });
            });
            merge.into_inner().expect("transform merge lock").data
        } else {
            let mut data = TransformedData::default();
            for result in stream {
                let conversation = result?;
                let mut names = HashMap::new();
                names.insert(owner_binding.0.clone(), owner_binding.1.clone());
                collect_sender_names(&conversation, &mut names);
                self.merge_serial(&conversation, &names, &mut data, ctx);
            }
            data
        };

        Ok((header, data))
    }

    fn transform_parallel(
        &self,
        conversations: &[Conversation],
        names: &HashMap<String, String>,
        ctx: &mut RunContext,
    ) -> Result<TransformedData> {
        let pool = self.build_pool()?;
        let merge = Mutex::new(MergeState {
            data: TransformedData::default(),
            ctx,
        });
        pool.install(|| {
            conversations.par_iter().for_each(|conversation| {
                // No locks held during per-conversation processing.
                let result = self.normalize_conversation(conversation, names, |_| {});
                let mut guard = merge.lock().expect("transform merge lock");
                match result {
                    Ok(normalized) => guard.absorb(normalized),
                    Err(err) => guard.reject(err),
                }
            });
        });
        Ok(merge.into_inner().expect("transform merge lock").data)
    }

    fn build_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.effective_workers())
            .thread_name(|idx| format!("chatvault-transform-{idx}"))
            .build()
            .map_err(|err| EtlError::config(format!("failed to build worker pool: {err}")))
    }

    fn merge_serial(
        &self,
        conversation: &Conversation,
        names: &HashMap<String, String>,
        data: &mut TransformedData,
        ctx: &mut RunContext,
    ) {
        let result = self.normalize_conversation(conversation, names, |chunk_len| {
            ctx.update_progress(0, chunk_len);
            ctx.check_memory();
        });
        match result {
            Ok(normalized) => {
                ctx.update_progress(1, 0);
                data.conversations.insert(normalized.id.clone(), normalized);
            }
            Err(err) => {
                ctx.record_error(
                    Phase::Transform,
                    format!("conversation '{}': {}", err.conversation_id, err.reason),
                );
                data.errors.push(err);
            }
        }
    }

    /// Normalize one conversation: chunked message processing, stable sort
    /// by arrival time (unparseable timestamps last, original order), and
    /// derived summary fields. `on_chunk` fires at every chunk boundary
    /// with the chunk's message count.
    fn normalize_conversation(
        &self,
        conversation: &Conversation,
        names: &HashMap<String, String>,
        mut on_chunk: impl FnMut(u64),
    ) -> std::result::Result<NormalizedConversation, TransformError> {
        if conversation.id.is_empty() {
            return Err(TransformError {
                conversation_id: String::new(),
                reason: "conversation missing id".into(),
            });
        }
        debug!(
            conversation_id = %conversation.id,
            messages = conversation.messages.len(),
            "normalizing conversation"
        );

        let mut messages = Vec::with_capacity(conversation.messages.len());
        for chunk in conversation.messages.chunks(self.config.chunk_size) {
            for message in chunk {
                messages.push(self.normalize_message(&conversation.id, message, names));
            }
            on_chunk(chunk.len() as u64);
        }

        // Stable: invalid timestamps keep their original relative order and
        // sort after all valid messages.
        messages.sort_by_key(|m| (m.timestamp.is_none(), m.timestamp));

        let first_message_time = messages.iter().find_map(|m| m.timestamp);
        let last_message_time = messages.iter().filter_map(|m| m.timestamp).last();

        Ok(NormalizedConversation {
            id: conversation.id.clone(),
            display_name: conversation.display_name.clone(),
            first_message_time,
            last_message_time,
            message_count: messages.len() as u64,
            messages,
        })
    }

    fn normalize_message(
        &self,
        conversation_id: &str,
        message: &Message,
        names: &HashMap<String, String>,
    ) -> NormalizedMessage {
        let timestamp = match message.arrival_time.as_deref() {
            Some(raw) => {
                let parsed = parse_timestamp(raw);
                if parsed.is_none() {
                    warn!(
                        message_id = %message.id,
                        arrival_time = %raw,
                        "unparseable arrival time, keeping message with placeholder"
                    );
                }
                parsed
            }
            None => None,
        };

        let sender_name = message.sender_name.clone().or_else(|| {
            message
                .sender_id
                .as_ref()
                .and_then(|id| names.get(id).cloned())
        });

        let structured_data = self
            .registry
            .handler_for(&message.message_type)
            .extract(message);

        let cleaned_content = self.cleaned_content(message);

        NormalizedMessage {
            conversation_id: conversation_id.to_string(),
            message_id: message.id.clone(),
            timestamp,
            sender_id: message.sender_id.clone(),
            sender_name,
            message_type: message.message_type.clone(),
            cleaned_content,
            raw_content: message.raw_content.clone(),
            edited: message.edited,
            structured_data,
        }
    }

    /// Plain text types get normalized markup; typed payloads fall back to
    /// the registry description when stripping leaves nothing renderable,
    /// and unknown types always use the description template.
    fn cleaned_content(&self, message: &Message) -> String {
        let tag = message.message_type.as_str();
        if TEXT_TYPES.contains(&tag) {
            return self.normalizer.normalize(&message.raw_content);
        }
        if !self.registry.is_known(tag) {
            return self.registry.describe(tag);
        }
        let cleaned = self.normalizer.normalize(&message.raw_content);
        if cleaned.is_empty() {
            self.registry.describe(tag)
        } else {
            cleaned
        }
    }
}

fn collect_sender_names(conversation: &Conversation, names: &mut HashMap<String, String>) {
    for message in &conversation.messages {
        if let (Some(id), Some(name)) = (&message.sender_id, &message.sender_name) {
            if !name.is_empty() {
                names.entry(id.clone()).or_insert_with(|| name.clone());
            }
        }
    }
}

impl MergeState<'_> {
    fn absorb(&mut self, normalized: NormalizedConversation) {
        self.ctx.update_progress(1, normalized.message_count);
        self.ctx.check_memory();
        self.data
            .conversations
            .insert(normalized.id.clone(), normalized);
    }

    fn reject(&mut self, err: TransformError) {
        self.ctx.record_error(
            Phase::Transform,
            format!("conversation '{}': {}", err.conversation_id, err.reason),
        );
        self.data.errors.push(err);
    }
}

/// Build the phase summary the pipeline merges into the run context.
pub fn summary(data: &TransformedData) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(
        "normalized_conversations".into(),
        serde_json::json!(data.conversations.len()),
    );
    map.insert(
        "failed_conversations".into(),
        serde_json::json!(data.errors.len()),
    );
    map
}
