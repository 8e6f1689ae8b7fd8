//! Message normalization: one raw export record in, zero or one [`Message`] out.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{Message, Role};

/// A message record as it appears in a Telegram-style export.
///
/// Unknown fields (media, reactions, ids) are ignored.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawMessage {
    pub from: Option<String>,
    pub text_entities: Option<Vec<TextEntity>>,
    pub sticker_emoji: Option<String>,
    pub date: Option<String>,
}

/// One formatted fragment of a message's text.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TextEntity {
    pub text: String,
}

/// Why a raw record produced no message. Tallied, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageRejection {
    #[error("record could not be decoded: {0}")]
    Malformed(String),

    #[error("no sender")]
    MissingSender,

    #[error("no text or sticker content")]
    NoContent,

    #[error("content is blank after normalization")]
    EmptyContent,

    #[error("no timestamp")]
    MissingTimestamp,

    #[error("invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    #[error("sent before the date cutoff")]
    BeforeCutoff,
}

impl MessageRejection {
    /// Stable key used when tallying rejections.
    pub fn reason(&self) -> &'static str {
        match self {
            MessageRejection::Malformed(_) => "malformed",
            MessageRejection::MissingSender => "missing_sender",
            MessageRejection::NoContent => "no_content",
            MessageRejection::EmptyContent => "empty_content",
            MessageRejection::MissingTimestamp => "missing_timestamp",
            MessageRejection::InvalidTimestamp(_) => "invalid_timestamp",
            MessageRejection::BeforeCutoff => "before_cutoff",
        }
    }
}

/// Parse an ISO-8601 timestamp.
///
/// Offset-qualified values are converted to UTC and made naive so they
/// compare against naive export timestamps. A bare date means midnight.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// Normalize one raw record.
///
/// Text fragments are concatenated in order and the sticker emoji appended;
/// the result is trimmed and internal newlines become spaces, since newlines
/// are reserved for separating merged messages later.
pub fn normalize_message(
    raw: &RawMessage,
    target_speaker_id: &str,
    cutoff: Option<NaiveDateTime>,
) -> Result<Message, MessageRejection> {
    let sender = match raw.from.as_deref() {
        Some(sender) if !sender.is_empty() => sender,
        _ => return Err(MessageRejection::MissingSender),
    };

    let entities = raw.text_entities.as_deref().unwrap_or_default();
    let sticker = raw.sticker_emoji.as_deref().unwrap_or_default();
    if entities.is_empty() && sticker.is_empty() {
        return Err(MessageRejection::NoContent);
    }

    let mut text: String = entities.iter().map(|e| e.text.as_str()).collect();
    text.push_str(sticker);
    let content = text.trim().replace("\r\n", " ").replace('\n', " ");
    if content.is_empty() {
        return Err(MessageRejection::EmptyContent);
    }

    let date = raw.date.as_deref().ok_or(MessageRejection::MissingTimestamp)?;
    let timestamp =
        parse_timestamp(date).ok_or_else(|| MessageRejection::InvalidTimestamp(date.to_string()))?;
    if cutoff.is_some_and(|cutoff| timestamp < cutoff) {
        return Err(MessageRejection::BeforeCutoff);
    }

    let role = if sender == target_speaker_id {
        Role::Assistant
    } else {
        Role::User
    };

    Message::new(role, content, Some(timestamp)).map_err(|_| MessageRejection::EmptyContent)
}
