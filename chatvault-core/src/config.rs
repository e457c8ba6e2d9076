use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EtlError, Result};

/// Centralized configuration for a chatvault ETL run.
///
/// Every tunable has a default; a TOML file can override any subset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    /// Messages processed per chunk inside a conversation.
    pub chunk_size: usize,

    /// Rows per insert transaction in the loader.
    pub batch_size: usize,

    /// Fan conversations out across a worker pool.
    pub parallel: bool,

    /// Worker pool size; 0 means available parallelism.
    pub workers: usize,

    /// Sources larger than this are read in streaming mode (bytes).
    pub stream_threshold_bytes: u64,

    /// Resident memory ceiling for the advisory monitor (MiB).
    pub memory_limit_mb: u64,

    /// Minimum seconds between forced-collection events.
    pub memory_cooldown_secs: u64,

    /// Optional intra-phase checkpoint interval, in processed messages.
    pub checkpoint_interval: Option<u64>,

    /// Where checkpoint files are written.
    pub checkpoint_dir: PathBuf,

    /// Where phase artifacts (extracted JSON, normalized NDJSON) live.
    pub work_dir: PathBuf,

    /// Database the loader writes to.
    pub database_url: String,
}

impl Default for EtlConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatvault");
        Self {
            chunk_size: 1000,
            batch_size: 100,
            parallel: false,
            workers: 0,
            stream_threshold_bytes: 50 * 1024 * 1024,
            memory_limit_mb: 1024,
            memory_cooldown_secs: 60,
            checkpoint_interval: None,
            checkpoint_dir: base.join("checkpoints"),
            work_dir: base.join("work"),
            database_url: format!("sqlite://{}", base.join("chatvault.db").display()),
        }
    }
}

impl EtlConfig {
    /// Load config from a TOML file, falling back to defaults for any
    /// missing key.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(EtlError::not_found(path));
        }
        let content = fs::read_to_string(&path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|err| EtlError::config(format!("invalid TOML in {:?}: {err}", path)))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config file path: ~/.config/chatvault/config.toml (per platform).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatvault/config.toml")
    }

    /// Effective worker count for the parallel transformer.
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(EtlError::config("chunk_size must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(EtlError::config("batch_size must be at least 1"));
        }
        if self.checkpoint_interval == Some(0) {
            return Err(EtlError::config("checkpoint_interval must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EtlConfig::default();
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.batch_size, 100);
        assert!(!config.parallel);
        assert!(config.effective_workers() >= 1);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = 250\nparallel = true").unwrap();
        file.flush().unwrap();

        let config = EtlConfig::load(file.path()).unwrap();
        assert_eq!(config.chunk_size, 250);
        assert!(config.parallel);
        // untouched keys keep their defaults
        assert_eq!(config.batch_size, 100);
    }

    #[test]
    fn test_zero_chunk_size_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "chunk_size = 0").unwrap();
        file.flush().unwrap();

        assert!(matches!(
            EtlConfig::load(file.path()),
            Err(EtlError::Config { .. })
        ));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        assert!(matches!(
            EtlConfig::load("/definitely/not/here.toml"),
            Err(EtlError::NotFound { .. })
        ));
    }
}
