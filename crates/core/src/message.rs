//! Data model shared by every pipeline stage.

use std::fmt;

use chrono::{Duration, NaiveDateTime};
use serde::Serialize;
use thiserror::Error;

use crate::{Tokenizer, PERSONAL_CHAT_LABEL};

/// Speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Construction failures for [`Message`] and [`Block`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("message content is empty")]
    EmptyContent,

    #[error("{0} message has no timestamp")]
    MissingTimestamp(Role),

    #[error("block has no turns")]
    EmptyBlock,

    #[error("system turn at position {0}")]
    MisplacedSystem(usize),

    #[error("block opens with {0} instead of user")]
    BadOpening(Role),

    #[error("block closes with {0} instead of assistant")]
    BadClosing(Role),

    #[error("consecutive {role} turns at position {position}")]
    RepeatedRole { role: Role, position: usize },
}

/// One utterance. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    role: Role,
    content: String,
    timestamp: Option<NaiveDateTime>,
}

impl Message {
    /// Build a message, rejecting blank content and undated non-system turns.
    pub fn new(
        role: Role,
        content: impl Into<String>,
        timestamp: Option<NaiveDateTime>,
    ) -> Result<Self, ModelError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(ModelError::EmptyContent);
        }
        if timestamp.is_none() && role != Role::System {
            return Err(ModelError::MissingTimestamp(role));
        }
        Ok(Self {
            role,
            content,
            timestamp,
        })
    }

    /// Synthetic system turn carrying the configured prompt.
    pub fn system(prompt: impl Into<String>) -> Result<Self, ModelError> {
        Self::new(Role::System, prompt, None)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        self.timestamp
    }
}

/// Conversation category. Only one-on-one chats are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChatKind {
    #[serde(rename = "personal_chat")]
    Personal,
}

impl ChatKind {
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            PERSONAL_CHAT_LABEL => Some(ChatKind::Personal),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChatKind::Personal => PERSONAL_CHAT_LABEL,
        }
    }
}

/// One two-party conversation and the views derived from it.
#[derive(Debug, Clone)]
pub struct Chat {
    pub contact_name: String,
    pub kind: ChatKind,
    /// Chronological, owned exclusively by this chat.
    pub messages: Vec<Message>,
    /// Segmented blocks, later replaced by their merged turns.
    pub raw_blocks: Vec<Vec<Message>>,
    pub valid_blocks: Vec<Block>,
}

impl Chat {
    pub fn new(contact_name: impl Into<String>, kind: ChatKind, messages: Vec<Message>) -> Self {
        Self {
            contact_name: contact_name.into(),
            kind,
            messages,
            raw_blocks: Vec::new(),
            valid_blocks: Vec::new(),
        }
    }
}

/// One accepted training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    messages: Vec<Message>,
}

impl Block {
    /// Build a block, checking the canonical `system? -> user -> ... -> assistant` shape.
    ///
    /// `with_system` states whether the first turn must be the system turn.
    pub fn new(messages: Vec<Message>, with_system: bool) -> Result<Self, ModelError> {
        let offset = usize::from(with_system);
        if with_system {
            match messages.first().map(Message::role) {
                Some(Role::System) => {}
                Some(role) => return Err(ModelError::BadOpening(role)),
                None => return Err(ModelError::EmptyBlock),
            }
        }

        let dialog = &messages[offset.min(messages.len())..];
        let (first, last) = match (dialog.first(), dialog.last()) {
            (Some(first), Some(last)) => (first.role(), last.role()),
            _ => return Err(ModelError::EmptyBlock),
        };
        if first != Role::User {
            return Err(ModelError::BadOpening(first));
        }
        if last != Role::Assistant {
            return Err(ModelError::BadClosing(last));
        }

        for (i, pair) in dialog.windows(2).enumerate() {
            let position = offset + i + 1;
            if pair[1].role() == Role::System {
                return Err(ModelError::MisplacedSystem(position));
            }
            if pair[0].role() == pair[1].role() {
                return Err(ModelError::RepeatedRole {
                    role: pair[1].role(),
                    position,
                });
            }
        }

        Ok(Self { messages })
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn token_count<T: Tokenizer>(&self, tokenizer: &T) -> usize {
        self.messages
            .iter()
            .map(|m| tokenizer.count_tokens(m.content()))
            .sum()
    }

    /// Elapsed time from the first to the last dated turn.
    pub fn duration(&self) -> Option<Duration> {
        let mut dated = self.messages.iter().filter_map(Message::timestamp);
        let first = dated.next()?;
        let last = dated.last().unwrap_or(first);
        Some(last - first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(minute: u32) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .and_then(|d| d.and_hms_opt(12, minute, 0))
    }

    fn user(minute: u32) -> Message {
        Message::new(Role::User, "hi", at(minute)).unwrap()
    }

    fn assistant(minute: u32) -> Message {
        Message::new(Role::Assistant, "hey", at(minute)).unwrap()
    }

    #[test]
    fn test_message_rejects_blank_content() {
        assert_eq!(
            Message::new(Role::User, "  \n ", at(0)),
            Err(ModelError::EmptyContent)
        );
        assert_eq!(Message::system(""), Err(ModelError::EmptyContent));
    }

    #[test]
    fn test_message_requires_timestamp_unless_system() {
        assert_eq!(
            Message::new(Role::Assistant, "ok", None),
            Err(ModelError::MissingTimestamp(Role::Assistant))
        );
        assert!(Message::system("be nice").is_ok());
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&Role::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }

    #[test]
    fn test_block_accepts_canonical_shape() {
        let block = Block::new(vec![user(0), assistant(1)], false).unwrap();
        assert_eq!(block.len(), 2);

        let system = Message::system("prompt").unwrap();
        let block = Block::new(vec![system, user(0), assistant(1)], true).unwrap();
        assert_eq!(block.messages()[0].role(), Role::System);
    }

    #[test]
    fn test_block_rejects_bad_shapes() {
        assert_eq!(
            Block::new(vec![assistant(0), user(1)], false),
            Err(ModelError::BadOpening(Role::Assistant))
        );
        assert_eq!(
            Block::new(vec![user(0), assistant(1), user(2)], false),
            Err(ModelError::BadClosing(Role::User))
        );
        assert_eq!(
            Block::new(vec![user(0), user(1), assistant(2)], false),
            Err(ModelError::RepeatedRole {
                role: Role::User,
                position: 1
            })
        );
        assert_eq!(
            Block::new(vec![user(0), assistant(1)], true),
            Err(ModelError::BadOpening(Role::User))
        );
        assert_eq!(
            Block::new(vec![Message::system("p").unwrap()], true),
            Err(ModelError::EmptyBlock)
        );
    }

    #[test]
    fn test_block_duration_skips_undated_turns() {
        let system = Message::system("prompt").unwrap();
        let block = Block::new(vec![system, user(5), assistant(35)], true).unwrap();
        assert_eq!(block.duration(), Some(Duration::minutes(30)));
    }
}
