//! Chat assembly: export loading, category filtering, and per-chat normalization.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::message::{Chat, ChatKind, Message};
use crate::normalize::{normalize_message, MessageRejection, RawMessage};
use crate::stats::DiscardCounts;

/// A conversation record as it appears in the export.
///
/// Messages stay undecoded so that one malformed record only costs that
/// record, not the whole chat.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawChat {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of assembling raw chats.
#[derive(Debug, Default)]
pub struct AssemblyOutcome {
    pub chats: Vec<Chat>,
    pub discards: DiscardCounts,
}

fn has_chat_keys(obj: &Map<String, Value>) -> bool {
    obj.contains_key("name") && obj.contains_key("messages")
}

/// Load raw chats from one export file.
///
/// Accepts a list of chat objects, a full export (`{"chats": {"list": [...]}}`),
/// or a single chat object.
pub fn load_export(path: &Path) -> Result<Vec<RawChat>> {
    let text = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    let data: Value = serde_json::from_str(&text)?;

    let chats: Vec<RawChat> = match data {
        Value::Array(items) => items
            .into_iter()
            .filter(|item| item.as_object().is_some_and(has_chat_keys))
            .map(serde_json::from_value)
            .collect::<std::result::Result<_, _>>()?,
        Value::Object(mut obj) => {
            let is_full_export = obj
                .get("chats")
                .and_then(|chats| chats.get("list"))
                .is_some();
            if is_full_export {
                let list = obj
                    .get_mut("chats")
                    .and_then(|chats| chats.get_mut("list"))
                    .map(Value::take)
                    .unwrap_or_default();
                serde_json::from_value(list)?
            } else if has_chat_keys(&obj) {
                vec![serde_json::from_value(Value::Object(obj))?]
            } else {
                return Err(Error::UnrecognisedExport {
                    path: path.to_path_buf(),
                });
            }
        }
        _ => {
            return Err(Error::UnrecognisedExport {
                path: path.to_path_buf(),
            })
        }
    };

    if chats.is_empty() {
        return Err(Error::EmptyExport {
            path: path.to_path_buf(),
        });
    }
    info!(count = chats.len(), path = %path.display(), "loaded raw chats");
    Ok(chats)
}

/// Discover all JSON exports in a directory.
pub fn discover_exports(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

/// Load a single export file, or every export under a directory in path order.
pub fn load_exports(path: &Path) -> Result<Vec<RawChat>> {
    if !path.is_dir() {
        return load_export(path);
    }

    let files = discover_exports(path);
    if files.is_empty() {
        return Err(Error::NoExports(path.to_path_buf()));
    }

    let mut chats = Vec::new();
    for file in &files {
        chats.extend(load_export(file)?);
    }
    Ok(chats)
}

/// Build chats from raw records.
///
/// Unnamed and non-personal chats are skipped, messages are normalized
/// independently, chats with no surviving message are dropped, and the
/// rest are sorted chronologically (stable, so source order breaks ties).
pub fn assemble_chats(
    raw_chats: &[RawChat],
    target_speaker_id: &str,
    cutoff: Option<NaiveDateTime>,
) -> AssemblyOutcome {
    let mut outcome = AssemblyOutcome::default();

    for raw in raw_chats {
        let contact_name = match raw.name.as_deref() {
            Some(name) if !name.is_empty() => name,
            _ => {
                outcome.discards.unnamed_chats += 1;
                continue;
            }
        };

        let label = raw.kind.as_deref().unwrap_or_default();
        let Some(kind) = ChatKind::from_label(label) else {
            debug!(chat = contact_name, kind = label, "skipping unsupported chat category");
            outcome.discards.unsupported_chats += 1;
            continue;
        };

        let mut messages: Vec<Message> = Vec::with_capacity(raw.messages.len());
        for value in &raw.messages {
            let result = RawMessage::deserialize(value)
                .map_err(|e| MessageRejection::Malformed(e.to_string()))
                .and_then(|record| normalize_message(&record, target_speaker_id, cutoff));

            match result {
                Ok(message) => messages.push(message),
                Err(rejection) => {
                    match rejection {
                        MessageRejection::Malformed(_) | MessageRejection::InvalidTimestamp(_) => {
                            warn!(chat = contact_name, %rejection, "skipping message")
                        }
                        _ => debug!(chat = contact_name, %rejection, "skipping message"),
                    }
                    outcome.discards.record_message(&rejection);
                }
            }
        }

        if messages.is_empty() {
            debug!(chat = contact_name, "no usable messages");
            outcome.discards.empty_chats += 1;
            continue;
        }

        messages.sort_by_key(Message::timestamp);
        outcome.chats.push(Chat::new(contact_name, kind, messages));
    }

    info!(
        built = outcome.chats.len(),
        skipped_messages = outcome.discards.skipped_messages,
        "built usable chat objects"
    );
    outcome
}
