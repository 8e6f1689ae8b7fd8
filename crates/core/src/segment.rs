//! Greedy segmentation of a chronological message stream into raw blocks.

use chrono::Duration;
use tracing::trace;

use crate::config::TokenBudget;
use crate::message::Message;
use crate::Tokenizer;

/// Raw blocks kept for one message stream plus the ones thrown away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Segmentation {
    pub blocks: Vec<Vec<Message>>,
    pub too_short: usize,
    pub too_long: usize,
}

impl Segmentation {
    fn close(&mut self, block: Vec<Message>, tokens: usize, budget: &TokenBudget) {
        if block.is_empty() {
            return;
        }
        if budget.contains(tokens) {
            self.blocks.push(block);
        } else if tokens < budget.min() {
            trace!(tokens, messages = block.len(), "dropping short segment");
            self.too_short += 1;
        } else {
            trace!(tokens, messages = block.len(), "dropping long segment");
            self.too_long += 1;
        }
    }
}

/// Split `messages` into blocks in a single left-to-right pass.
///
/// A message joins the current block when it follows another message by at
/// most `time_gap_threshold` and the block stays within `budget.max()`
/// tokens. Otherwise the current block is closed and kept only if its token
/// count lies in the budget window. The gap is always measured to the
/// previous message in the stream, kept or not.
pub fn segment_messages<T: Tokenizer>(
    messages: &[Message],
    time_gap_threshold: Duration,
    budget: &TokenBudget,
    tokenizer: &T,
) -> Segmentation {
    let mut segmentation = Segmentation::default();
    let mut current: Vec<Message> = Vec::new();
    let mut current_tokens = 0usize;
    let mut previous: Option<&Message> = None;

    for msg in messages {
        let msg_tokens = tokenizer.count_tokens(msg.content());
        let gap = previous
            .and_then(Message::timestamp)
            .zip(msg.timestamp())
            .map(|(prev, now)| now - prev);

        let within_gap = gap.is_some_and(|gap| gap <= time_gap_threshold);
        if within_gap && current_tokens + msg_tokens <= budget.max() {
            current.push(msg.clone());
            current_tokens += msg_tokens;
        } else {
            let closed = std::mem::replace(&mut current, vec![msg.clone()]);
            segmentation.close(closed, current_tokens, budget);
            current_tokens = msg_tokens;
        }

        previous = Some(msg);
    }

    segmentation.close(current, current_tokens, budget);
    segmentation
}
