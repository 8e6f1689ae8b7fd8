//! Block validation: trim to canonical shape, prepend the system turn, and
//! enforce structural and token thresholds.

use thiserror::Error;

use crate::config::TokenBudget;
use crate::message::{Block, Message, ModelError, Role};
use crate::Tokenizer;

/// Why a merged block was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlockRejection {
    #[error("{turns} turns after trimming, need {required}")]
    TooFewTurns { turns: usize, required: usize },

    #[error("{tokens} tokens is below the minimum of {min}")]
    TooShort { tokens: usize, min: usize },

    #[error("{tokens} tokens is above the maximum of {max}")]
    TooLong { tokens: usize, max: usize },

    #[error("invalid block: {0}")]
    Invalid(#[from] ModelError),
}

impl BlockRejection {
    /// Structural and token underflows both count as short.
    pub fn is_short(&self) -> bool {
        matches!(
            self,
            BlockRejection::TooFewTurns { .. } | BlockRejection::TooShort { .. }
        )
    }
}

fn may_open(role: Role) -> bool {
    match role {
        Role::Assistant => false,
        Role::User | Role::System => true,
    }
}

fn may_close(role: Role) -> bool {
    match role {
        Role::User => false,
        Role::Assistant | Role::System => true,
    }
}

/// Drop leading assistant turns and trailing user turns.
///
/// Returns a sub-slice; the input is left untouched.
pub fn trim_turns(turns: &[Message]) -> &[Message] {
    let start = turns
        .iter()
        .position(|t| may_open(t.role()))
        .unwrap_or(turns.len());
    let rest = &turns[start..];
    let end = rest
        .iter()
        .rposition(|t| may_close(t.role()))
        .map_or(0, |i| i + 1);
    &rest[..end]
}

/// Accept or reject one merged block.
///
/// Trimming happens first, then `system` is prepended, then the turn count
/// (3 with a system turn, else 2) and the token window are checked. The
/// system turn counts towards the token total.
pub fn validate_block<T: Tokenizer>(
    turns: &[Message],
    system: Option<&Message>,
    budget: &TokenBudget,
    tokenizer: &T,
) -> Result<Block, BlockRejection> {
    let trimmed = trim_turns(turns);

    let mut messages = Vec::with_capacity(trimmed.len() + 1);
    messages.extend(system.cloned());
    messages.extend_from_slice(trimmed);

    let required = if system.is_some() { 3 } else { 2 };
    if messages.len() < required {
        return Err(BlockRejection::TooFewTurns {
            turns: messages.len(),
            required,
        });
    }

    let tokens: usize = messages
        .iter()
        .map(|m| tokenizer.count_tokens(m.content()))
        .sum();
    if !budget.contains(tokens) {
        return Err(if tokens < budget.min() {
            BlockRejection::TooShort {
                tokens,
                min: budget.min(),
            }
        } else {
            BlockRejection::TooLong {
                tokens,
                max: budget.max(),
            }
        });
    }

    Ok(Block::new(messages, system.is_some())?)
}
