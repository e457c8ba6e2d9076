//! Async half of chatvault: the relational loader and the three-phase
//! pipeline orchestrator. Parsing and normalization live in
//! `chatvault-core`.

pub mod loader;
pub mod pipeline;

pub use loader::{normalize_source_label, ConversationLoad, LoadOutcome, Loader};
pub use pipeline::{EtlPipeline, RunResult};
