//! Source validation and archive handling for export documents.
//!
//! A source is either the export JSON itself or a tar container holding it.
//! The kind is sniffed from content (first non-whitespace byte for JSON,
//! the ustar magic for tar), never from a caller-supplied flag.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tar::Archive;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::error::{EtlError, Result};
use crate::model::ExportDocument;
use crate::stream::{first_non_whitespace_byte, ConversationStream};

/// Offset of the `ustar` magic inside a tar header block.
const TAR_MAGIC_OFFSET: u64 = 257;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Json,
    Tar,
}

/// A validated, readable export source. For container archives this owns
/// the staging area the JSON member was unpacked into; when that staging is
/// a temporary directory it is removed on every exit path, including
/// panics, by `TempDir`'s drop.
pub struct ExportSource {
    kind: SourceKind,
    json_path: PathBuf,
    _staging: Option<TempDir>,
}

impl ExportSource {
    pub fn kind(&self) -> SourceKind {
        self.kind
    }

    /// Path of the export JSON document (the source itself, or the unpacked
    /// archive member).
    pub fn json_path(&self) -> &Path {
        &self.json_path
    }

    /// Size of the JSON document in bytes; the caller uses this to decide
    /// between batch and streaming mode.
    pub fn size_bytes(&self) -> Result<u64> {
        Ok(fs::metadata(&self.json_path)?.len())
    }

    /// Batch mode: fully parse and validate the export document.
    pub fn read_document(&self) -> Result<ExportDocument> {
        let file = File::open(&self.json_path)?;
        let value: Value = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| EtlError::json(format!("{:?}", self.json_path), err))?;

        if value
            .get("userId")
            .or_else(|| value.get("ownerId"))
            .and_then(Value::as_str)
            .is_none()
        {
            return Err(EtlError::schema("export document missing owner identifier"));
        }
        if !value
            .get("conversations")
            .map(Value::is_array)
            .unwrap_or(false)
        {
            return Err(EtlError::schema("export document missing conversations list"));
        }

        serde_json::from_value(value).map_err(|err| EtlError::json("export document", err))
    }

    /// Streaming mode: a lazy, forward-only sequence of conversations.
    /// The caller decides when streaming is worthwhile; this source is
    /// agnostic to why.
    pub fn stream(&self) -> Result<ConversationStream> {
        ConversationStream::from_path(&self.json_path)
    }
}

pub struct Extractor;

impl Extractor {
    /// Open and validate a source, unpacking container archives into a
    /// scoped temporary directory that is cleaned up when the returned
    /// [`ExportSource`] is dropped.
    pub fn open(source: impl AsRef<Path>, member_hint: Option<&str>) -> Result<ExportSource> {
        let source = source.as_ref();
        match Self::detect(source)? {
            SourceKind::Json => Ok(ExportSource {
                kind: SourceKind::Json,
                json_path: source.to_path_buf(),
                _staging: None,
            }),
            SourceKind::Tar => {
                let staging = TempDir::new()?;
                let json_path = Self::unpack_member(source, member_hint, staging.path())?;
                Ok(ExportSource {
                    kind: SourceKind::Tar,
                    json_path,
                    _staging: Some(staging),
                })
            }
        }
    }

    /// Like [`Extractor::open`], but container members are unpacked into
    /// `staging_dir` and survive drop. Used for checkpointable runs where
    /// the extracted document is a phase artifact; cleanup belongs to the
    /// caller.
    pub fn open_into(
        source: impl AsRef<Path>,
        member_hint: Option<&str>,
        staging_dir: &Path,
    ) -> Result<ExportSource> {
        let source = source.as_ref();
        match Self::detect(source)? {
            SourceKind::Json => Ok(ExportSource {
                kind: SourceKind::Json,
                json_path: source.to_path_buf(),
                _staging: None,
            }),
            SourceKind::Tar => {
                fs::create_dir_all(staging_dir)?;
                let json_path = Self::unpack_member(source, member_hint, staging_dir)?;
                Ok(ExportSource {
                    kind: SourceKind::Tar,
                    json_path,
                    _staging: None,
                })
            }
        }
    }

    /// Sniff the source kind from content.
    fn detect(source: &Path) -> Result<SourceKind> {
        if !source.exists() {
            return Err(EtlError::not_found(source));
        }
        let mut file = File::open(source)?;

        match first_non_whitespace_byte(&mut file)? {
            Some(b'{') => return Ok(SourceKind::Json),
            None => {
                return Err(EtlError::malformed_archive(source, "empty source file"));
            }
            Some(_) => {}
        }

        let mut magic = [0u8; 5];
        file.seek(SeekFrom::Start(TAR_MAGIC_OFFSET))?;
        match file.read_exact(&mut magic) {
            Ok(()) if &magic == b"ustar" => Ok(SourceKind::Tar),
            _ => Err(EtlError::malformed_archive(
                source,
                "not a JSON document or tar archive",
            )),
        }
    }

    /// Locate the single eligible JSON member and unpack it. More than one
    /// candidate with no hint is an error naming the candidates; the hint
    /// selects by exact member path.
    fn unpack_member(
        source: &Path,
        member_hint: Option<&str>,
        staging_dir: &Path,
    ) -> Result<PathBuf> {
        let candidates = Self::list_json_members(source)?;
        if candidates.is_empty() {
            return Err(EtlError::malformed_archive(
                source,
                "archive contains no JSON member",
            ));
        }

        let selected = match member_hint {
            Some(hint) => candidates
                .iter()
                .find(|name| name.as_str() == hint)
                .cloned()
                .ok_or_else(|| {
                    EtlError::malformed_archive(
                        source,
                        format!("archive has no member named '{hint}'"),
                    )
                })?,
            None if candidates.len() == 1 => candidates[0].clone(),
            None => return Err(EtlError::AmbiguousSource { candidates }),
        };
        debug!(member = %selected, "unpacking archive member");

        // tar archives are forward-only; reopen for the unpack pass.
        let mut archive = Archive::new(BufReader::new(File::open(source)?));
        for entry in archive.entries().map_err(|err| {
            EtlError::malformed_archive(source, format!("unreadable entries: {err}"))
        })? {
            let mut entry = entry
                .map_err(|err| EtlError::malformed_archive(source, err.to_string()))?;
            let path = entry.path().map_err(|err| {
                EtlError::malformed_archive(source, format!("bad member path: {err}"))
            })?;
            if path.to_string_lossy() != selected {
                continue;
            }

            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "export.json".to_string());
            let dest = staging_dir.join(file_name);
            let mut out = File::create(&dest)?;
            std::io::copy(&mut entry, &mut out)?;
            info!(member = %selected, dest = ?dest, "extracted archive member");
            return Ok(dest);
        }

        // Listed a moment ago but gone on the second pass: the archive is
        // lying about its contents.
        Err(EtlError::malformed_archive(
            source,
            format!("member '{selected}' disappeared between passes"),
        ))
    }

    fn list_json_members(source: &Path) -> Result<Vec<String>> {
        let mut archive = Archive::new(BufReader::new(File::open(source)?));
        let mut names = Vec::new();
        for entry in archive.entries().map_err(|err| {
            EtlError::malformed_archive(source, format!("unreadable entries: {err}"))
        })? {
            let entry = entry
                .map_err(|err| EtlError::malformed_archive(source, err.to_string()))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path().map_err(|err| {
                EtlError::malformed_archive(source, format!("bad member path: {err}"))
            })?;
            let name = path.to_string_lossy();
            if name.to_ascii_lowercase().ends_with(".json") {
                names.push(name.into_owned());
            }
        }
        Ok(names)
    }
}
