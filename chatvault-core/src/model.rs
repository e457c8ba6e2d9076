use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fully materialized export document, produced by the batch extractor.
/// Immutable once read; owned by the extractor until handed to the
/// transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    #[serde(rename = "userId", alias = "ownerId")]
    pub owner_id: String,
    #[serde(rename = "exportDate", alias = "exportTimestamp", default)]
    pub export_timestamp: Option<String>,
    #[serde(default)]
    pub conversations: Vec<Conversation>,
}

impl ExportDocument {
    pub fn header(&self) -> ExportHeader {
        ExportHeader {
            owner_id: self.owner_id.clone(),
            export_timestamp: self.export_timestamp.clone(),
        }
    }
}

/// Top-level fields of the export document, available before (or without)
/// materializing the conversation list. The streaming extractor captures
/// these while scanning toward the conversations array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportHeader {
    pub owner_id: String,
    pub export_timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "displayName", default)]
    pub display_name: Option<String>,
    /// Opaque key/value bag carried through untouched.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// A conversation missing its message list is treated as empty, not fatal.
    #[serde(default, alias = "MessageList")]
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "senderId", alias = "from", default)]
    pub sender_id: Option<String>,
    #[serde(rename = "senderName", alias = "displayName", default)]
    pub sender_name: Option<String>,
    #[serde(
        rename = "arrivalTime",
        alias = "originalarrivaltime",
        default
    )]
    pub arrival_time: Option<String>,
    #[serde(rename = "type", alias = "messagetype", default)]
    pub message_type: String,
    #[serde(rename = "content", alias = "rawContent", default)]
    pub raw_content: String,
    #[serde(rename = "edited", alias = "editedFlag", default)]
    pub edited: bool,
    #[serde(default)]
    pub properties: Map<String, Value>,
}

/// Conversation after transformation: messages normalized, ordered by
/// arrival time, with derived summary fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedConversation {
    pub id: String,
    pub display_name: Option<String>,
    pub first_message_time: Option<DateTime<Utc>>,
    pub last_message_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub messages: Vec<NormalizedMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub conversation_id: String,
    pub message_id: String,
    /// `None` is the placeholder for an unparseable arrival time; such
    /// messages are retained but excluded from ordering-sensitive
    /// computations.
    pub timestamp: Option<DateTime<Utc>>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub message_type: String,
    pub cleaned_content: String,
    pub raw_content: String,
    pub edited: bool,
    /// Type-specific fields extracted by the registry; may be empty.
    #[serde(default)]
    pub structured_data: Map<String, Value>,
}

/// Parse an export timestamp into a timezone-aware instant.
/// Accepts RFC 3339 and the space-separated variant some exporters emit.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f %z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_aliases() {
        let msg: Message = serde_json::from_value(json!({
            "id": "m1",
            "from": "8:alice",
            "displayName": "Alice",
            "originalarrivaltime": "2024-03-01T10:00:00Z",
            "messagetype": "RichText",
            "content": "hello"
        }))
        .unwrap();
        assert_eq!(msg.sender_id.as_deref(), Some("8:alice"));
        assert_eq!(msg.sender_name.as_deref(), Some("Alice"));
        assert_eq!(msg.message_type, "RichText");
        assert!(!msg.edited);
    }

    #[test]
    fn test_conversation_without_messages_is_empty() {
        let conv: Conversation = serde_json::from_value(json!({
            "id": "c1",
            "displayName": "Test"
        }))
        .unwrap();
        assert!(conv.messages.is_empty());
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp("2024-03-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-03-01T10:00:00.123+02:00").is_some());
        assert!(parse_timestamp("2024-03-01 10:00:00.000 +0000").is_some());
        assert!(parse_timestamp("yesterday at noon").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_timestamp_preserves_offset() {
        let dt = parse_timestamp("2024-03-01T12:00:00+02:00").unwrap();
        assert_eq!(dt, parse_timestamp("2024-03-01T10:00:00Z").unwrap());
    }
}
