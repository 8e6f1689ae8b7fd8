//! Collapse runs of same-sender messages into single turns.

use chrono::NaiveDateTime;
use tracing::warn;

use crate::message::{Message, Role};

/// Prefix one physical line with the delimiter.
fn prefixed(delimiter: &str, content: &str) -> String {
    let content = content.trim();
    if delimiter.is_empty() {
        content.to_string()
    } else {
        format!("{} {}", delimiter, content)
    }
}

/// A turn under construction.
struct Run {
    role: Role,
    timestamp: Option<NaiveDateTime>,
    content: String,
}

impl Run {
    fn start(msg: &Message, delimiter: &str) -> Self {
        Self {
            role: msg.role(),
            timestamp: msg.timestamp(),
            content: prefixed(delimiter, msg.content()),
        }
    }

    fn push(&mut self, msg: &Message, delimiter: &str) {
        self.content.push('\n');
        self.content.push_str(&prefixed(delimiter, msg.content()));
    }

    fn finish(self, turns: &mut Vec<Message>) {
        match Message::new(self.role, self.content, self.timestamp) {
            Ok(turn) => turns.push(turn),
            Err(e) => warn!(role = %self.role, error = %e, "skipping merged turn"),
        }
    }
}

/// Merge consecutive same-role messages of one raw block.
///
/// Every input line is prefixed with `delimiter` (trimmed) and lines of one
/// turn are joined with `\n`. A merged turn keeps the timestamp of the first
/// message of its run.
pub fn merge_turns(block: &[Message], delimiter: &str) -> Vec<Message> {
    let delimiter = delimiter.trim();
    let mut turns = Vec::new();

    let Some((first, rest)) = block.split_first() else {
        return turns;
    };

    let mut run = Run::start(first, delimiter);
    for msg in rest {
        if msg.role() == run.role {
            run.push(msg, delimiter);
        } else {
            std::mem::replace(&mut run, Run::start(msg, delimiter)).finish(&mut turns);
        }
    }
    run.finish(&mut turns);

    turns
}
