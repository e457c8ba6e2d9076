//! NDJSON artifact I/O for normalized conversations.
//!
//! The transform phase writes its output as one normalized conversation per
//! line. Checkpoints point at this file; a resumed run reloads it instead
//! of re-transforming.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::{EtlError, Result};
use crate::model::NormalizedConversation;

pub struct NdjsonWriter<W: Write> {
    writer: BufWriter<W>,
}

impl NdjsonWriter<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::create(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::new(inner),
        }
    }

    pub fn write_conversation(&mut self, conversation: &NormalizedConversation) -> Result<()> {
        serde_json::to_writer(&mut self.writer, conversation)
            .map_err(|err| EtlError::json("normalized conversation", err))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Read every conversation back from an NDJSON artifact.
pub fn read_conversations(path: impl AsRef<Path>) -> Result<Vec<NormalizedConversation>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(EtlError::not_found(path));
    }
    let reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let conversation = serde_json::from_str(&line)
            .map_err(|err| EtlError::json(format!("artifact line {}", idx + 1), err))?;
        out.push(conversation);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("normalized.ndjson");

        let conv = NormalizedConversation {
            id: "c1".into(),
            display_name: Some("Test".into()),
            first_message_time: None,
            last_message_time: None,
            message_count: 0,
            messages: Vec::new(),
        };

        let mut writer = NdjsonWriter::create(&path).unwrap();
        writer.write_conversation(&conv).unwrap();
        writer.finish().unwrap();

        let back = read_conversations(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].id, "c1");
    }

    #[test]
    fn test_missing_artifact() {
        assert!(matches!(
            read_conversations("/no/such/artifact.ndjson"),
            Err(EtlError::NotFound { .. })
        ));
    }
}
