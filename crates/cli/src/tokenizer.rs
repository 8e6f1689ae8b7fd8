//! Token counting backends for the CLI.

use std::path::Path;

use anyhow::anyhow;
use chat_distill_core::{CharApproxTokenizer, Tokenizer};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{info, warn};

/// Counts tokens with the target model's tokenizer when it can be loaded,
/// and with the character approximation otherwise.
///
/// Both variants are `Send + Sync`, so the pipeline can count in parallel.
pub enum CountingTokenizer {
    HuggingFace(HfTokenizer),
    Approx(CharApproxTokenizer),
}

impl CountingTokenizer {
    /// Load from a local `tokenizer.json` path or a HuggingFace model name.
    pub fn load(model: &str) -> anyhow::Result<Self> {
        let path = Path::new(model);
        let loaded = if path.is_file() {
            HfTokenizer::from_file(path)
        } else {
            HfTokenizer::from_pretrained(model, None)
        };
        let inner = loaded.map_err(|e| anyhow!("failed to load tokenizer '{}': {}", model, e))?;
        Ok(CountingTokenizer::HuggingFace(inner))
    }

    /// Like [`CountingTokenizer::load`], falling back to the approximation.
    pub fn load_or_approx(model: &str) -> Self {
        match Self::load(model) {
            Ok(tokenizer) => {
                info!(model, "loaded tokenizer");
                tokenizer
            }
            Err(e) => {
                warn!(error = %e, "falling back to character-based token approximation");
                CountingTokenizer::Approx(CharApproxTokenizer)
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CountingTokenizer::HuggingFace(_) => "huggingface",
            CountingTokenizer::Approx(_) => "char-approx",
        }
    }
}

impl Tokenizer for CountingTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        match self {
            CountingTokenizer::HuggingFace(inner) => match inner.encode(text, false) {
                Ok(encoding) => encoding.get_ids().len(),
                Err(e) => {
                    warn!(error = %e, "failed to encode text, counting it as zero tokens");
                    0
                }
            },
            CountingTokenizer::Approx(approx) => approx.count_tokens(text),
        }
    }
}
