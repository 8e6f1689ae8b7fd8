//! Uploading run artifacts to object storage.
//!
//! Objects land under `<run_id>/data/`. The raw export must arrive for the
//! run to continue; later artifacts are best effort and their failures are
//! logged only.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use tracing::{error, info};

use crate::assemble::RawChat;
use crate::error::{Error, Result};
use crate::message::Chat;
use crate::pipeline::{training_records, ProcessedChatRecord};

/// Boxed error returned by storage backends.
pub type StoreError = Box<dyn std::error::Error + Send + Sync>;

/// A bucket-like destination for run artifacts.
pub trait ArtifactStore {
    /// Store `body` under `key` with string user metadata attached.
    fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        metadata: &BTreeMap<String, String>,
    ) -> std::result::Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

fn object_key(run_id: &str, name: &str) -> String {
    format!("{}/data/{}", run_id, name)
}

/// Object metadata is string-valued; non-string JSON values are rendered.
pub fn metadata_strings(metadata: &Map<String, Value>) -> BTreeMap<String, String> {
    metadata
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => "None".to_string(),
                other => other.to_string(),
            };
            (key.clone(), value)
        })
        .collect()
}

/// Upload `raw.json`. Failure aborts the run.
pub fn upload_raw_chats<S: ArtifactStore>(
    store: &S,
    run_id: &str,
    raw_chats: &[RawChat],
) -> Result<()> {
    let key = object_key(run_id, "raw.json");
    let body = serde_json::to_vec_pretty(raw_chats)?;
    let metadata = BTreeMap::from([("uuid".to_string(), run_id.to_string())]);

    info!(location = %store.location(), key = key.as_str(), "uploading raw chats");
    store
        .put(&key, body, &metadata)
        .map_err(|e| Error::Upload {
            key: key.clone(),
            reason: e.to_string(),
        })?;
    info!(key = key.as_str(), "uploaded raw chats");
    Ok(())
}

/// Upload `processed.json` and `train.jsonl` with the run metadata attached.
///
/// Returns how many objects were stored. Failures are logged and skipped.
pub fn upload_results<S: ArtifactStore>(
    store: &S,
    run_id: &str,
    chats: &[Chat],
    metadata: &Map<String, Value>,
) -> Result<usize> {
    let metadata = metadata_strings(metadata);

    let records: Vec<ProcessedChatRecord<'_>> = chats.iter().map(Into::into).collect();
    let processed = serde_json::to_vec_pretty(&records)?;

    let lines = training_records(chats)
        .map(|record| serde_json::to_string(&record))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let training = lines.join("\n").into_bytes();

    let mut stored = 0;
    for (name, body) in [("processed.json", processed), ("train.jsonl", training)] {
        let key = object_key(run_id, name);
        info!(location = %store.location(), key = key.as_str(), "uploading");
        match store.put(&key, body, &metadata) {
            Ok(()) => {
                info!(key = key.as_str(), "uploaded");
                stored += 1;
            }
            Err(e) => error!(key = key.as_str(), error = %e, "failed to upload"),
        }
    }
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    use chrono::NaiveDate;
    use serde_json::json;
    use tracing_test::traced_test;

    use crate::message::{Block, ChatKind, Message, Role};

    type Object = (String, String, BTreeMap<String, String>);

    /// Records every put; fails for keys ending in `fail_suffix`.
    #[derive(Default)]
    struct MemoryStore {
        objects: RefCell<Vec<Object>>,
        fail_suffix: Option<&'static str>,
    }

    impl ArtifactStore for MemoryStore {
        fn put(
            &self,
            key: &str,
            body: Vec<u8>,
            metadata: &BTreeMap<String, String>,
        ) -> std::result::Result<(), StoreError> {
            if self.fail_suffix.is_some_and(|suffix| key.ends_with(suffix)) {
                return Err("access denied".into());
            }
            let body = String::from_utf8(body)?;
            self.objects
                .borrow_mut()
                .push((key.to_string(), body, metadata.clone()));
            Ok(())
        }

        fn location(&self) -> String {
            "memory://test".to_string()
        }
    }

    fn chats() -> Vec<Chat> {
        let at = NaiveDate::from_ymd_opt(2024, 1, 1).and_then(|d| d.and_hms_opt(9, 0, 0));
        let user = Message::new(Role::User, "hi", at).unwrap();
        let assistant = Message::new(Role::Assistant, "hello", user.timestamp()).unwrap();
        let mut chat = Chat::new("Bob", ChatKind::Personal, Vec::new());
        chat.valid_blocks = vec![Block::new(vec![user, assistant], false).unwrap()];
        vec![chat]
    }

    #[test]
    fn test_metadata_strings() {
        let metadata = json!({"uuid": "run-1", "stats_num_blocks": 2.0, "system_prompt": null});
        let strings = metadata_strings(metadata.as_object().unwrap());
        assert_eq!(strings["uuid"], "run-1");
        assert_eq!(strings["stats_num_blocks"], "2.0");
        assert_eq!(strings["system_prompt"], "None");
    }

    #[test]
    fn test_upload_raw_chats() {
        let raw: Vec<RawChat> =
            serde_json::from_value(json!([{"name": "Bob", "messages": []}])).unwrap();
        let store = MemoryStore::default();
        upload_raw_chats(&store, "run-1", &raw).unwrap();

        let objects = store.objects.borrow();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].0, "run-1/data/raw.json");
        assert_eq!(objects[0].2["uuid"], "run-1");

        let failing = MemoryStore {
            fail_suffix: Some("raw.json"),
            ..Default::default()
        };
        let err = upload_raw_chats(&failing, "run-1", &raw).unwrap_err();
        assert!(matches!(err, Error::Upload { key, .. } if key == "run-1/data/raw.json"));
    }

    #[test]
    fn test_upload_results() {
        let store = MemoryStore::default();
        let metadata = json!({"uuid": "run-1"});
        let stored =
            upload_results(&store, "run-1", &chats(), metadata.as_object().unwrap()).unwrap();
        assert_eq!(stored, 2);

        let objects = store.objects.borrow();
        assert_eq!(objects[0].0, "run-1/data/processed.json");
        assert_eq!(objects[1].0, "run-1/data/train.jsonl");
        assert_eq!(
            objects[1].1,
            r#"{"messages":[{"role":"user","content":"hi"},{"role":"assistant","content":"hello"}]}"#
        );
        assert!(objects.iter().all(|(_, _, m)| m["uuid"] == "run-1"));
    }

    #[test]
    #[traced_test]
    fn test_failed_result_upload_is_logged_and_skipped() {
        let store = MemoryStore {
            fail_suffix: Some("processed.json"),
            ..Default::default()
        };
        let metadata = Map::new();
        let stored = upload_results(&store, "run-1", &chats(), &metadata).unwrap();

        assert_eq!(stored, 1);
        assert_eq!(store.objects.borrow()[0].0, "run-1/data/train.jsonl");
        assert!(logs_contain("failed to upload"));
    }
}
