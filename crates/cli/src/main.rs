//! CLI tool for turning a chat export into fine-tuning data.
//!
//! This tool loads a Telegram-style JSON export (or a directory of them),
//! builds `system? -> user -> ... -> assistant` training blocks, and writes
//! `train.jsonl` plus processed chats and run metadata under
//! `<local_dir>/<run_id>/` and, when enabled, to `<s3_bucket>/<run_id>/data/`.
//! Token counts come from the HuggingFace tokenizers library.

mod notify;
mod s3;
mod tokenizer;

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use serde_json::{Map, Value};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use chat_distill_core::{
    load_exports, render_summary, resolve_overrides, run_metadata, run_pipeline,
    upload_raw_chats, upload_results, write_metadata, write_processed_chats, write_raw_chats,
    write_training_jsonl, AppConfig, ArtifactStore, PipelineSettings,
};

use crate::s3::S3Store;
use crate::tokenizer::CountingTokenizer;

/// Build SFT training blocks from a chat export.
#[derive(Parser, Debug)]
#[command(name = "chat-distill")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Export file, or a directory searched for *.json exports
    #[arg(long)]
    input: PathBuf,

    /// TOML config file (defaults and CHAT_DISTILL_* env vars apply without it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON object of config overrides
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Single override, KEY=VALUE (VALUE is parsed as JSON, else taken as a string)
    #[arg(long = "set", value_parser = parse_override)]
    set: Vec<(String, Value)>,

    /// HuggingFace tokenizer name or tokenizer.json path (default: the fine-tuning model)
    #[arg(long)]
    tokenizer: Option<String>,

    /// Run identifier (default: random UUID)
    #[arg(long)]
    run_id: Option<String>,

    /// Number of chats listed in the block-count ranking
    #[arg(long, default_value = "10")]
    top_k: usize,

    /// Fine-tuning service to notify once the data is written
    #[arg(long, env = "FINE_TUNING_SERVICE_URL")]
    notify_url: Option<String>,
}

fn parse_override(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", raw));
    }
    let value =
        serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn collect_overrides(args: &Args) -> anyhow::Result<Map<String, Value>> {
    let mut overrides = Map::new();
    if let Some(path) = &args.overrides {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading overrides from {:?}", path))?;
        match serde_json::from_str(&text)? {
            Value::Object(map) => overrides.extend(map),
            _ => bail!("overrides file {:?} must contain a JSON object", path),
        }
    }
    overrides.extend(args.set.iter().cloned());
    Ok(overrides)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("chat_distill=info,chat_distill_core=info")),
        )
        .init();

    let args = Args::parse();

    let base = AppConfig::load(args.config.as_deref())?;
    let overrides = collect_overrides(&args)?;
    info!(count = overrides.len(), "applying configuration overrides");
    let (config, _) = resolve_overrides(&base, &overrides)?;

    if config.target_speaker_id.trim().is_empty() {
        bail!("target_speaker_id is not set; pass --set target_speaker_id=<your name>");
    }

    let settings = PipelineSettings::from_config(&config)?;
    let write_local = config.output.writes_local();
    let store = config
        .output
        .upload_bucket()?
        .map(S3Store::connect)
        .transpose()?;
    if !write_local && store.is_none() {
        warn!("no output mode enabled, results will only be summarised");
    }

    let raw_chats = load_exports(&args.input)?;

    let run_id = args
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let run_dir = config.output.local_dir.join(&run_id);
    if write_local {
        write_raw_chats(&raw_chats, &run_dir)?;
    }
    if let Some(store) = &store {
        upload_raw_chats(store, &run_id, &raw_chats)?;
    }

    let tokenizer_name = args
        .tokenizer
        .clone()
        .unwrap_or_else(|| config.fine_tuning.model.name.clone());
    info!(tokenizer = tokenizer_name.as_str(), "loading tokenizer for token counting");
    let tokenizer = CountingTokenizer::load_or_approx(&tokenizer_name);

    let output = run_pipeline(&raw_chats, &settings, &tokenizer);
    if output.chats.is_empty() {
        warn!("no chat produced a valid block");
    }

    let report = output.report(&tokenizer);
    info!("\n{}", render_summary(&report, args.top_k));
    let metadata = run_metadata(&run_id, &config, &report)?;

    if write_local {
        write_processed_chats(&output.chats, &run_dir)?;
        write_training_jsonl(&output.chats, &run_dir)?;
        write_metadata(&run_dir, &metadata)?;
    }
    let uploaded = match &store {
        Some(store) => upload_results(store, &run_id, &output.chats, &metadata)?,
        None => 0,
    };

    match args.notify_url.as_deref() {
        Some(url) => notify::queue_fine_tuning(url, &run_id),
        None => info!("no fine-tuning service configured, skipping trigger"),
    }

    println!("\n[summary]");
    println!("  Run id: {}", run_id);
    println!("  Tokenizer: {} ({})", tokenizer_name, tokenizer.name());
    println!("  Chats kept: {}", report.stats.num_chats);
    println!("  Training blocks: {}", output.num_blocks());
    println!("  Skipped messages: {}", report.discards.skipped_messages);
    println!("  Discarded blocks: {}", report.discards.discarded_blocks());
    if write_local {
        println!("  Output: {:?}", run_dir);
    }
    if let Some(store) = &store {
        println!("  Uploaded: {} objects to {}/{}/data", uploaded + 1, store.location(), run_id);
    }

    Ok(())
}
