//! Pipeline for turning raw chats into validated training blocks.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use rayon::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::assemble::{assemble_chats, AssemblyOutcome, RawChat};
use crate::config::{AppConfig, TokenBudget};
use crate::error::{Error, Result};
use crate::merge::merge_turns;
use crate::message::{Chat, Message, Role};
use crate::segment::segment_messages;
use crate::stats::{compute_stats, DiscardCounts, PipelineReport};
use crate::validate::{validate_block, BlockRejection};
use crate::{Tokenizer, DEFAULT_TIME_GAP_THRESHOLD_SECS, DEFAULT_TURN_DELIMITER};

/// Resolved knobs for one run.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub target_speaker_id: String,
    pub date_cutoff: Option<NaiveDateTime>,
    pub time_gap_threshold: Duration,
    pub budget: TokenBudget,
    pub turn_delimiter: String,
    pub system_prompt: Option<String>,
}

impl PipelineSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            target_speaker_id: config.target_speaker_id.clone(),
            date_cutoff: config.date_cutoff.and_then(|d| d.and_hms_opt(0, 0, 0)),
            time_gap_threshold: config.time_gap_threshold()?,
            budget: TokenBudget::new(config.min_tokens_per_block, config.max_tokens_per_block),
            turn_delimiter: config.turn_delimiter.clone(),
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// The system turn to prepend, if a non-blank prompt is configured.
    pub fn system_turn(&self) -> Option<Message> {
        let prompt = self.system_prompt.as_deref()?.trim();
        if prompt.is_empty() {
            return None;
        }
        match Message::system(prompt) {
            Ok(turn) => Some(turn),
            Err(e) => {
                error!(error = %e, "failed to create system message, skipping system prompts");
                None
            }
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            target_speaker_id: String::new(),
            date_cutoff: None,
            time_gap_threshold: Duration::milliseconds(
                (DEFAULT_TIME_GAP_THRESHOLD_SECS * 1000.0) as i64,
            ),
            budget: TokenBudget::default(),
            turn_delimiter: DEFAULT_TURN_DELIMITER.to_string(),
            system_prompt: None,
        }
    }
}

/// Accepted chats plus everything discarded on the way.
#[derive(Debug, Default)]
pub struct PipelineOutput {
    pub chats: Vec<Chat>,
    pub discards: DiscardCounts,
    pub token_budget_corrected: bool,
}

impl PipelineOutput {
    pub fn num_blocks(&self) -> usize {
        self.chats.iter().map(|c| c.valid_blocks.len()).sum()
    }

    pub fn report<T: Tokenizer>(&self, tokenizer: &T) -> PipelineReport {
        PipelineReport {
            stats: compute_stats(&self.chats, tokenizer),
            discards: self.discards.clone(),
            token_budget_corrected: self.token_budget_corrected,
        }
    }
}

/// Segment, merge and validate one chat. The chat is dropped when no block
/// survives.
fn process_chat<T: Tokenizer>(
    mut chat: Chat,
    settings: &PipelineSettings,
    system: Option<&Message>,
    tokenizer: &T,
) -> (Option<Chat>, DiscardCounts) {
    let mut discards = DiscardCounts::default();

    let segmentation = segment_messages(
        &chat.messages,
        settings.time_gap_threshold,
        &settings.budget,
        tokenizer,
    );
    discards.short_segments += segmentation.too_short;
    discards.long_segments += segmentation.too_long;
    if segmentation.blocks.is_empty() {
        debug!(chat = chat.contact_name.as_str(), "no segment within the token window");
        discards.chats_without_segments += 1;
        return (None, discards);
    }

    chat.raw_blocks = segmentation
        .blocks
        .iter()
        .map(|block| merge_turns(block, &settings.turn_delimiter))
        .collect();

    for turns in &chat.raw_blocks {
        match validate_block(turns, system, &settings.budget, tokenizer) {
            Ok(block) => chat.valid_blocks.push(block),
            Err(rejection) => {
                if let BlockRejection::Invalid(_) = rejection {
                    warn!(
                        chat = chat.contact_name.as_str(),
                        block_start = ?turns.first().and_then(Message::timestamp),
                        %rejection,
                        "failed to create block"
                    );
                }
                discards.record_block(&rejection);
            }
        }
    }

    if chat.valid_blocks.is_empty() {
        debug!(chat = chat.contact_name.as_str(), "no valid blocks");
        discards.chats_without_blocks += 1;
        return (None, discards);
    }
    (Some(chat), discards)
}

/// Run the full pipeline over raw chats.
///
/// Chats are independent after assembly and are processed in parallel; the
/// output keeps input order.
pub fn run_pipeline<T>(raw_chats: &[RawChat], settings: &PipelineSettings, tokenizer: &T) -> PipelineOutput
where
    T: Tokenizer + Sync,
{
    let AssemblyOutcome {
        chats,
        mut discards,
    } = assemble_chats(raw_chats, &settings.target_speaker_id, settings.date_cutoff);
    let assembled = chats.len();

    let system = settings.system_turn();
    if let Some(turn) = &system {
        info!(prompt = turn.content(), "prepending system message to each block");
    }

    let results: Vec<(Option<Chat>, DiscardCounts)> = chats
        .into_par_iter()
        .map(|chat| process_chat(chat, settings, system.as_ref(), tokenizer))
        .collect();

    let mut kept = Vec::with_capacity(results.len());
    for (chat, chat_discards) in results {
        discards.merge(&chat_discards);
        kept.extend(chat);
    }

    let output = PipelineOutput {
        chats: kept,
        discards,
        token_budget_corrected: settings.budget.was_corrected(),
    };
    info!(
        assembled,
        kept = output.chats.len(),
        blocks = output.num_blocks(),
        short_segments = output.discards.short_segments,
        long_segments = output.discards.long_segments,
        short_blocks = output.discards.short_blocks,
        long_blocks = output.discards.long_blocks,
        discarded_blocks = output.discards.discarded_blocks(),
        "pipeline complete"
    );
    output
}

/// One chat in `processed.json`.
#[derive(Debug, Serialize)]
pub struct ProcessedChatRecord<'a> {
    pub contact_name: &'a str,
    pub chat_type: &'static str,
    pub num_blocks: usize,
    pub blocks: Vec<ProcessedBlockRecord<'a>>,
}

#[derive(Debug, Serialize)]
pub struct ProcessedBlockRecord<'a> {
    pub messages: &'a [Message],
}

impl<'a> From<&'a Chat> for ProcessedChatRecord<'a> {
    fn from(chat: &'a Chat) -> Self {
        Self {
            contact_name: &chat.contact_name,
            chat_type: chat.kind.label(),
            num_blocks: chat.valid_blocks.len(),
            blocks: chat
                .valid_blocks
                .iter()
                .map(|block| ProcessedBlockRecord {
                    messages: block.messages(),
                })
                .collect(),
        }
    }
}

/// One line of `train.jsonl`.
#[derive(Debug, Serialize)]
pub struct TrainingRecord<'a> {
    pub messages: Vec<TrainingTurn<'a>>,
}

#[derive(Debug, Serialize)]
pub struct TrainingTurn<'a> {
    pub role: Role,
    pub content: &'a str,
}

fn create_writer(dir: &Path, name: &str) -> Result<(PathBuf, BufWriter<File>)> {
    fs::create_dir_all(dir).map_err(|e| Error::io(dir, e))?;
    let path = dir.join(name);
    let file = File::create(&path).map_err(|e| Error::io(&path, e))?;
    Ok((path, BufWriter::new(file)))
}

fn write_pretty<S: Serialize>(dir: &Path, name: &str, value: &S) -> Result<PathBuf> {
    let (path, mut writer) = create_writer(dir, name)?;
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(|e| Error::io(&path, e))?;
    Ok(path)
}

/// Write the loaded raw chats to `raw.json`.
pub fn write_raw_chats(raw_chats: &[RawChat], run_dir: &Path) -> Result<PathBuf> {
    let path = write_pretty(run_dir, "raw.json", &raw_chats)?;
    info!(path = %path.display(), "saved raw chats");
    Ok(path)
}

/// Write accepted chats with their blocks to `processed.json`.
pub fn write_processed_chats(chats: &[Chat], run_dir: &Path) -> Result<PathBuf> {
    let records: Vec<ProcessedChatRecord<'_>> = chats.iter().map(Into::into).collect();
    let path = write_pretty(run_dir, "processed.json", &records)?;
    info!(path = %path.display(), chats = records.len(), "saved processed chats");
    Ok(path)
}

/// One training record per accepted block, in chat order.
pub fn training_records(chats: &[Chat]) -> impl Iterator<Item = TrainingRecord<'_>> {
    chats
        .iter()
        .flat_map(|c| &c.valid_blocks)
        .map(|block| TrainingRecord {
            messages: block
                .messages()
                .iter()
                .map(|m| TrainingTurn {
                    role: m.role(),
                    content: m.content(),
                })
                .collect(),
        })
}

/// Write one `{"messages": [...]}` line per block to `train.jsonl`.
///
/// Returns the path and the number of lines written.
pub fn write_training_jsonl(chats: &[Chat], run_dir: &Path) -> Result<(PathBuf, usize)> {
    let (path, mut writer) = create_writer(run_dir, "train.jsonl")?;

    let mut lines = 0;
    for record in training_records(chats) {
        let line = serde_json::to_string(&record)?;
        writeln!(writer, "{}", line).map_err(|e| Error::io(&path, e))?;
        lines += 1;
    }
    writer.flush().map_err(|e| Error::io(&path, e))?;

    info!(path = %path.display(), blocks = lines, "saved training blocks");
    Ok((path, lines))
}

/// Run settings, stats and trainer settings, keyed flat.
pub fn run_metadata(
    run_id: &str,
    config: &AppConfig,
    report: &PipelineReport,
) -> Result<Map<String, Value>> {
    let mut metadata = Map::new();
    metadata.insert("uuid".into(), run_id.into());
    metadata.insert("model_id".into(), config.fine_tuning.model.name.clone().into());
    metadata.insert("target_speaker_id".into(), config.target_speaker_id.clone().into());
    metadata.insert("system_prompt".into(), serde_json::to_value(&config.system_prompt)?);
    metadata.insert("date_cutoff".into(), serde_json::to_value(config.date_cutoff)?);
    metadata.insert(
        "time_gap_threshold_seconds".into(),
        config.time_gap_threshold_seconds.into(),
    );
    metadata.insert("min_tokens_per_block".into(), config.min_tokens_per_block.into());
    metadata.insert("max_tokens_per_block".into(), config.max_tokens_per_block.into());
    metadata.insert("turn_delimiter".into(), config.turn_delimiter.clone().into());
    metadata.insert(
        "token_budget_corrected".into(),
        report.token_budget_corrected.into(),
    );

    for (name, value) in report.metrics() {
        metadata.insert(format!("stats_{}", name), value.into());
    }
    metadata.insert(
        "stats_block_breakdown".into(),
        serde_json::to_value(&report.stats.block_breakdown)?,
    );

    let ft = &config.fine_tuning;
    let sections = [
        ("model", serde_json::to_value(&ft.model)?),
        ("dataset", serde_json::to_value(&ft.dataset)?),
        ("lora", serde_json::to_value(&ft.lora)?),
        ("training", serde_json::to_value(&ft.training)?),
    ];
    for (section, value) in sections {
        if let Value::Object(fields) = value {
            for (key, value) in fields {
                metadata.insert(format!("ft_{}_{}", section, key), value);
            }
        }
    }

    Ok(metadata)
}

/// Write the output of [`run_metadata`] to `metadata.json`.
pub fn write_metadata(run_dir: &Path, metadata: &Map<String, Value>) -> Result<PathBuf> {
    let path = write_pretty(run_dir, "metadata.json", metadata)?;
    info!(path = %path.display(), "saved run metadata");
    Ok(path)
}
