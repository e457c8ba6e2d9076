//! Core library for chatvault: parsing, normalizing and checkpointing bulk
//! chat export archives.
//!
//! Everything in this crate is synchronous. The async loader and the
//! pipeline orchestrator live in `chatvault-etl`.

pub mod archive;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod ndjson;
pub mod normalize;
pub mod registry;
pub mod stream;
pub mod transform;

pub use archive::{ExportSource, Extractor, SourceKind};
pub use checkpoint::{Checkpoint, CHECKPOINT_VERSION};
pub use config::EtlConfig;
pub use context::{ErrorRecord, Phase, PhaseState, PhaseStatus, RunContext};
pub use error::{EtlError, Result};
pub use model::{
    Conversation, ExportDocument, ExportHeader, Message, NormalizedConversation,
    NormalizedMessage,
};
pub use normalize::{ContentNormalizer, NormalizerBackend};
pub use registry::{MessageTypeRegistry, TypeHandler};
pub use stream::ConversationStream;
pub use transform::{TransformedData, Transformer};
