//! Dispatch of heterogeneous message payloads by type tag.
//!
//! A message's `type` is an exact, slash-delimited tag (`"Event/Call"`,
//! `"RichText/Media_Video"`, ...). The registry maps each tag to a handler
//! that digs type-specific structured fields out of the raw payload.
//! Lookup misses return a shared no-op handler; the caller can still render
//! a human-readable description from the default template. Registering a
//! handler for a new tag is the one supported extension seam in the core.
//!
//! Handlers are pure functions of the message payload and never fail:
//! malformed input is logged and produces an empty map so one odd message
//! cannot abort its conversation.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::model::Message;

pub trait TypeHandler: Send + Sync {
    /// Extract structured fields from the message payload. May return an
    /// empty map; must not panic on malformed input.
    fn extract(&self, message: &Message) -> Map<String, Value>;
}

pub struct MessageTypeRegistry {
    handlers: HashMap<String, Box<dyn TypeHandler>>,
    fallback: NoOpHandler,
}

impl MessageTypeRegistry {
    /// Registry with handlers for every built-in message type.
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            fallback: NoOpHandler,
        };
        registry.register("Poll", PollHandler);
        registry.register("Event/Call", CallHandler);
        registry.register("RichText/Location", LocationHandler);
        registry.register("RichText/UriObject", MediaHandler { kind: "image" });
        registry.register("RichText/Media_Video", MediaHandler { kind: "video" });
        registry.register("RichText/Media_AudioMsg", MediaHandler { kind: "audio" });
        registry.register(
            "RichText/Media_GenericFile",
            MediaHandler { kind: "file" },
        );
        registry.register(
            "ThreadActivity/AddMember",
            ThreadActivityHandler { action: "add_member" },
        );
        registry.register(
            "ThreadActivity/DeleteMember",
            ThreadActivityHandler { action: "delete_member" },
        );
        registry.register(
            "ThreadActivity/TopicUpdate",
            ThreadActivityHandler { action: "topic_update" },
        );
        registry.register(
            "ThreadActivity/PictureUpdate",
            ThreadActivityHandler { action: "picture_update" },
        );
        registry.register(
            "ThreadActivity/RoleUpdate",
            ThreadActivityHandler { action: "role_update" },
        );
        registry
    }

    /// Register (or replace) the handler for a type tag.
    pub fn register(&mut self, tag: impl Into<String>, handler: impl TypeHandler + 'static) {
        self.handlers.insert(tag.into(), Box::new(handler));
    }

    pub fn is_known(&self, tag: &str) -> bool {
        self.handlers.contains_key(tag)
    }

    /// Handler for a tag; misses get the no-op handler.
    pub fn handler_for(&self, tag: &str) -> &dyn TypeHandler {
        match self.handlers.get(tag) {
            Some(handler) => handler.as_ref(),
            None => &self.fallback,
        }
    }

    /// Human-readable description for messages whose type has no renderable
    /// text content.
    pub fn describe(&self, tag: &str) -> String {
        format!("Sent a {tag} message")
    }
}

impl Default for MessageTypeRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

struct NoOpHandler;

impl TypeHandler for NoOpHandler {
    fn extract(&self, _message: &Message) -> Map<String, Value> {
        Map::new()
    }
}

/// `Poll`: question plus its options.
struct PollHandler;

impl TypeHandler for PollHandler {
    fn extract(&self, message: &Message) -> Map<String, Value> {
        let raw = &message.raw_content;
        let mut data = Map::new();
        if let Some(question) = element_text(raw, "pollquestion") {
            data.insert("question".into(), json!(question));
        }
        let options: Vec<String> = element_texts(raw, "polloption");
        if !options.is_empty() {
            data.insert("options".into(), json!(options));
        }
        if data.is_empty() {
            warn!(message_id = %message.id, "poll payload had no question or options");
        }
        data
    }
}

/// `Event/Call`: duration, participants, call state.
struct CallHandler;

impl TypeHandler for CallHandler {
    fn extract(&self, message: &Message) -> Map<String, Value> {
        let raw = &message.raw_content;
        let mut data = Map::new();

        if let Some(text) = element_text(raw, "duration") {
            match text.trim().parse::<f64>() {
                Ok(seconds) => {
                    data.insert("duration_seconds".into(), json!(seconds));
                }
                Err(_) => warn!(message_id = %message.id, value = %text, "unparseable call duration"),
            }
        }

        let participants = attr_values(raw, "part", "identity");
        if !participants.is_empty() {
            data.insert("participants".into(), json!(participants));
        }

        let state = tag_attr(raw, "partlist", "type").unwrap_or_else(|| "started".to_string());
        data.insert("call_state".into(), json!(state));
        data
    }
}

/// `RichText/Location`: coordinates arrive in microdegrees.
struct LocationHandler;

impl TypeHandler for LocationHandler {
    fn extract(&self, message: &Message) -> Map<String, Value> {
        let raw = &message.raw_content;
        let mut data = Map::new();
        for (attr, key) in [("latitude", "latitude"), ("longitude", "longitude")] {
            if let Some(text) = tag_attr(raw, "location", attr) {
                match text.trim().parse::<f64>() {
                    Ok(micro) => {
                        data.insert(key.into(), json!(micro / 1_000_000.0));
                    }
                    Err(_) => {
                        warn!(message_id = %message.id, value = %text, "unparseable {attr}")
                    }
                }
            }
        }
        if let Some(address) = tag_attr(raw, "location", "address") {
            data.insert("address".into(), json!(address));
        }
        data
    }
}

/// `RichText/UriObject` and the `RichText/Media_*` family: shared URIObject
/// payload shape, distinguished by kind.
struct MediaHandler {
    kind: &'static str,
}

impl TypeHandler for MediaHandler {
    fn extract(&self, message: &Message) -> Map<String, Value> {
        let raw = &message.raw_content;
        let mut data = Map::new();
        data.insert("media_kind".into(), json!(self.kind));

        if let Some(url) = tag_attr(raw, "URIObject", "uri") {
            data.insert("url".into(), json!(url));
        }
        if let Some(content_type) = tag_attr(raw, "URIObject", "type") {
            data.insert("content_type".into(), json!(content_type));
        }
        if let Some(name) = tag_attr(raw, "OriginalName", "v") {
            data.insert("file_name".into(), json!(name));
        }
        if let Some(size) = tag_attr(raw, "FileSize", "v") {
            match size.trim().parse::<u64>() {
                Ok(bytes) => {
                    data.insert("file_size".into(), json!(bytes));
                }
                Err(_) => warn!(message_id = %message.id, value = %size, "unparseable file size"),
            }
        }
        data
    }
}

/// `ThreadActivity/*`: membership and settings changes.
struct ThreadActivityHandler {
    action: &'static str,
}

impl TypeHandler for ThreadActivityHandler {
    fn extract(&self, message: &Message) -> Map<String, Value> {
        let raw = &message.raw_content;
        let mut data = Map::new();
        data.insert("action".into(), json!(self.action));

        if let Some(initiator) = element_text(raw, "initiator") {
            data.insert("initiator".into(), json!(initiator));
        }
        let targets = element_texts(raw, "target");
        if !targets.is_empty() {
            data.insert("targets".into(), json!(targets));
        }
        if let Some(value) = element_text(raw, "value") {
            data.insert("value".into(), json!(value));
        }
        data
    }
}

// Payload scanning helpers. Plain string walking, tolerant by construction:
// anything that does not match simply yields None / empty.

fn element_texts(raw: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];
        let Some(gt) = after_open.find('>') else { break };
        let body = &after_open[gt + 1..];
        let Some(end) = body.find(&close) else { break };
        out.push(body[..end].to_string());
        rest = &body[end + close.len()..];
    }
    out
}

fn element_text(raw: &str, tag: &str) -> Option<String> {
    element_texts(raw, tag).into_iter().next()
}

fn tag_attr(raw: &str, tag: &str, attr: &str) -> Option<String> {
    attr_values(raw, tag, attr).into_iter().next()
}

fn attr_values(raw: &str, tag: &str, attr: &str) -> Vec<String> {
    let open = format!("<{tag}");
    let needle = format!("{attr}=\"");
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(start) = rest.find(&open) {
        let after_open = &rest[start + open.len()..];
        let Some(gt) = after_open.find('>') else { break };
        let tag_body = &after_open[..gt];
        if let Some(pos) = tag_body.find(&needle) {
            let value = &tag_body[pos + needle.len()..];
            if let Some(end) = value.find('"') {
                out.push(value[..end].to_string());
            }
        }
        rest = &after_open[gt + 1..];
    }
    out
}
