//! Streaming parser for multi-gigabyte export documents.
//!
//! An export is one JSON object: `{ "userId": ..., "exportDate": ...,
//! "conversations": [ ... ] }`. `serde_json::from_reader` would buffer the
//! whole document before returning, which defeats streaming for exports in
//! the gigabyte range. [`ConversationStream`] instead walks the top-level
//! object manually:
//!
//! 1. reads the opening `{` and scans key/value pairs, capturing the header
//!    fields (owner id, export timestamp) as it passes them;
//! 2. on reaching the `"conversations"` key it enters the array and yields
//!    one [`Conversation`] per `next()` call, using serde's `RawValue` so
//!    only a single element is ever buffered;
//! 3. detects the closing `]` and stops.
//!
//! At any point only one conversation is held in memory, regardless of file
//! size. The stream is forward-only and finite; there is no rewind.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde_json::{self as sj, value::RawValue};
use tracing::debug;

use crate::error::{EtlError, Result};
use crate::model::{Conversation, ExportHeader};

pub struct ConversationStream {
    reader: BufReader<File>,
    header: ExportHeader,
    /// True once the first array element has been yielded.
    started: bool,
    finished: bool,
}

impl ConversationStream {
    /// Opens the export document and scans forward to the conversations
    /// array, capturing header fields on the way. Fails with a schema error
    /// if the document has no conversations list, or if the owner id has
    /// not appeared before it (the stream cannot rewind to find it later).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => EtlError::not_found(path),
            _ => err.into(),
        })?;
        let mut stream = Self {
            reader: BufReader::new(file),
            header: ExportHeader::default(),
            started: false,
            finished: false,
        };
        stream.scan_to_conversations()?;
        Ok(stream)
    }

    /// Header fields captured before the conversations array.
    pub fn header(&self) -> &ExportHeader {
        &self.header
    }

    fn scan_to_conversations(&mut self) -> Result<()> {
        self.skip_whitespace()?;
        if self.read_byte()? != Some(b'{') {
            return Err(EtlError::schema("export document is not a JSON object"));
        }

        loop {
            self.skip_whitespace()?;
            match self.peek_byte()? {
                Some(b'}') | None => {
                    return Err(EtlError::schema("export document has no conversations list"));
                }
                Some(b',') => {
                    self.read_byte()?;
                    continue;
                }
                _ => {}
            }

            let key: String = self.next_value("object key")?;
            self.skip_whitespace()?;
            if self.read_byte()? != Some(b':') {
                return Err(EtlError::schema(format!(
                    "expected ':' after key '{key}' in export document"
                )));
            }
            self.skip_whitespace()?;

            if key == "conversations" {
                if self.read_byte()? != Some(b'[') {
                    return Err(EtlError::schema("conversations field is not a list"));
                }
                if self.header.owner_id.is_empty() {
                    return Err(EtlError::schema(
                        "owner identifier must precede the conversations list \
                         when streaming",
                    ));
                }
                debug!(owner = %self.header.owner_id, "streaming conversations");
                return Ok(());
            }

            // Any other value: parse it whole (headers are small scalars)
            // and keep the fields we care about.
            let raw: Box<RawValue> = self.next_value("header field")?;
            match key.as_str() {
                "userId" | "ownerId" => {
                    self.header.owner_id = sj::from_str::<String>(raw.get())
                        .map_err(|err| EtlError::json("owner id", err))?;
                }
                "exportDate" | "exportTimestamp" => {
                    self.header.export_timestamp = sj::from_str(raw.get()).ok();
                }
                _ => {}
            }
        }
    }

    fn next_conversation(&mut self) -> Result<Option<Conversation>> {
        if self.finished {
            return Ok(None);
        }

        self.skip_whitespace()?;
        if self.started {
            // Between elements: expect ',' or the closing ']'.
            match self.peek_byte()? {
                Some(b']') => {
                    self.finished = true;
                    return Ok(None);
                }
                Some(b',') => {
                    self.read_byte()?;
                    self.skip_whitespace()?;
                }
                None => {
                    return Err(EtlError::schema(
                        "unexpected EOF in conversations list (missing ']')",
                    ));
                }
                Some(other) => {
                    return Err(EtlError::schema(format!(
                        "unexpected character '{}' in conversations list",
                        char::from(other)
                    )));
                }
            }
        } else if self.peek_byte()? == Some(b']') {
            // Empty list.
            self.finished = true;
            return Ok(None);
        }

        let raw: Box<RawValue> = self.next_value("conversation")?;
        let conversation: Conversation = sj::from_str(raw.get())
            .map_err(|err| EtlError::json("conversation record", err))?;
        self.started = true;
        Ok(Some(conversation))
    }

    /// Deserialize exactly one JSON value off the reader without consuming
    /// the delimiter that follows it.
    fn next_value<T: DeserializeOwned>(&mut self, context: &str) -> Result<T> {
        T::deserialize(&mut sj::Deserializer::from_reader(&mut self.reader))
            .map_err(|err| EtlError::json(context, err))
    }

    fn skip_whitespace(&mut self) -> Result<()> {
        loop {
            match self.reader.fill_buf() {
                Ok([]) => break,
                Ok(available) => {
                    if available[0].is_ascii_whitespace() {
                        self.reader.consume(1);
                    } else {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn peek_byte(&mut self) -> Result<Option<u8>> {
        match self.reader.fill_buf() {
            Ok([]) => Ok(None),
            Ok(buf) => Ok(Some(buf[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => self.peek_byte(),
            Err(e) => Err(e.into()),
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        let byte = self.peek_byte()?;
        if byte.is_some() {
            self.reader.consume(1);
        }
        Ok(byte)
    }
}

impl Iterator for ConversationStream {
    type Item = Result<Conversation>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_conversation() {
            Ok(conversation) => conversation.map(Ok),
            Err(err) => {
                // The reader position is undefined after a parse error;
                // finish the stream rather than yielding errors forever.
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Reads bytes until finding the first non-whitespace byte.
pub(crate) fn first_non_whitespace_byte<R: Read>(reader: &mut R) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => {
                if !buf[0].is_ascii_whitespace() {
                    return Ok(Some(buf[0]));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}
