//! Core block construction logic for chat-distill.
//!
//! This crate turns a raw chat export (one participant's message history)
//! into fixed-shape `system? -> user -> ... -> assistant` blocks suitable
//! for supervised fine-tuning with loss masking on the assistant turns.
//!
//! The stages run in order: normalize, assemble, segment, merge, validate.
//! Stats are computed over whatever survives.

/// Trait for tokenization operations.
///
/// Implementors provide token counting. For exact counts use the target
/// model's tokenizer; for quick runs use [`CharApproxTokenizer`].
pub trait Tokenizer {
    /// Count the number of tokens in the given text.
    fn count_tokens(&self, text: &str) -> usize;
}

// Blanket implementation for references to Tokenizers
impl<T: Tokenizer + ?Sized> Tokenizer for &T {
    fn count_tokens(&self, text: &str) -> usize {
        (*self).count_tokens(text)
    }
}

/// Character-based approximate tokenizer (~4 chars per token).
#[derive(Debug, Clone, Copy, Default)]
pub struct CharApproxTokenizer;

impl Tokenizer for CharApproxTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.len() / 4
    }
}

pub mod assemble;
pub mod config;
mod error;
pub mod merge;
pub mod message;
pub mod normalize;
pub mod pipeline;
pub mod segment;
pub mod stats;
pub mod upload;
pub mod validate;

pub use assemble::{assemble_chats, discover_exports, load_export, load_exports, AssemblyOutcome, RawChat};
pub use config::{
    resolve_overrides, AppConfig, OutputConfig, OutputMode, OverrideCounts, OverrideLayer,
    TokenBudget,
};
pub use error::{Error, Result};
pub use merge::merge_turns;
pub use message::{Block, Chat, ChatKind, Message, ModelError, Role};
pub use normalize::{normalize_message, parse_timestamp, MessageRejection, RawMessage};
pub use pipeline::{
    run_metadata, run_pipeline, training_records, write_metadata, write_processed_chats,
    write_raw_chats, write_training_jsonl, PipelineOutput, PipelineSettings, ProcessedChatRecord,
    TrainingRecord,
};
pub use segment::{segment_messages, Segmentation};
pub use stats::{compute_stats, render_summary, ChatStats, DiscardCounts, PipelineReport};
pub use upload::{metadata_strings, upload_raw_chats, upload_results, ArtifactStore, StoreError};
pub use validate::{trim_turns, validate_block, BlockRejection};

/// Default lower bound of the per-block token window.
pub const DEFAULT_MIN_TOKENS_PER_BLOCK: usize = 100;

/// Default upper bound of the per-block token window.
pub const DEFAULT_MAX_TOKENS_PER_BLOCK: usize = 3000;

/// Default maximum gap between two messages of the same block.
pub const DEFAULT_TIME_GAP_THRESHOLD_SECS: f64 = 3600.0;

/// Default prefix for every line of a merged turn.
pub const DEFAULT_TURN_DELIMITER: &str = ">>>";

/// The only conversation category the pipeline accepts.
pub const PERSONAL_CHAT_LABEL: &str = "personal_chat";
