//! Run configuration.
//!
//! The base config comes from defaults, an optional TOML file and
//! `CHAT_DISTILL_*` environment variables. Per-run overrides are applied on
//! top by [`resolve_overrides`], which returns a new value instead of
//! mutating the base.

use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDate};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::{
    DEFAULT_MAX_TOKENS_PER_BLOCK, DEFAULT_MIN_TOKENS_PER_BLOCK, DEFAULT_TIME_GAP_THRESHOLD_SECS,
    DEFAULT_TURN_DELIMITER,
};

/// Inclusive token window a block must fall in. Always `min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenBudget {
    min: usize,
    max: usize,
    corrected: bool,
}

impl TokenBudget {
    /// Build a budget, substituting the defaults when `min >= max`.
    pub fn new(min: usize, max: usize) -> Self {
        if min >= max {
            warn!(
                min_tokens = min,
                max_tokens = max,
                "invalid token thresholds: min_tokens >= max_tokens, resetting to defaults \
                 min_tokens={}, max_tokens={}",
                DEFAULT_MIN_TOKENS_PER_BLOCK,
                DEFAULT_MAX_TOKENS_PER_BLOCK
            );
            return Self {
                min: DEFAULT_MIN_TOKENS_PER_BLOCK,
                max: DEFAULT_MAX_TOKENS_PER_BLOCK,
                corrected: true,
            };
        }
        Self {
            min,
            max,
            corrected: false,
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Whether the requested window was rejected and replaced.
    pub fn was_corrected(&self) -> bool {
        self.corrected
    }

    pub fn contains(&self, tokens: usize) -> bool {
        (self.min..=self.max).contains(&tokens)
    }
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_TOKENS_PER_BLOCK, DEFAULT_MAX_TOKENS_PER_BLOCK)
    }
}

/// Top-level config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Sender name mapped to the assistant role.
    pub target_speaker_id: String,
    /// Messages sent before this day are dropped.
    pub date_cutoff: Option<NaiveDate>,
    /// Longest pause inside one block. Fractions of a second are kept to the
    /// millisecond.
    pub time_gap_threshold_seconds: f64,
    pub min_tokens_per_block: usize,
    pub max_tokens_per_block: usize,
    pub turn_delimiter: String,
    pub system_prompt: Option<String>,
    pub output: OutputConfig,
    pub fine_tuning: FineTuningConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            target_speaker_id: String::new(),
            date_cutoff: None,
            time_gap_threshold_seconds: DEFAULT_TIME_GAP_THRESHOLD_SECS,
            min_tokens_per_block: DEFAULT_MIN_TOKENS_PER_BLOCK,
            max_tokens_per_block: DEFAULT_MAX_TOKENS_PER_BLOCK,
            turn_delimiter: DEFAULT_TURN_DELIMITER.to_string(),
            system_prompt: None,
            output: OutputConfig::default(),
            fine_tuning: FineTuningConfig::default(),
        }
    }
}

impl AppConfig {
    /// The gap threshold as a duration.
    ///
    /// Negative, non-finite or out-of-range values are a configuration error.
    pub fn time_gap_threshold(&self) -> Result<Duration> {
        let secs = self.time_gap_threshold_seconds;
        let millis = secs * 1000.0;
        if !millis.is_finite() || millis < 0.0 || millis >= i64::MAX as f64 {
            return Err(Error::Config(format!(
                "time_gap_threshold_seconds must be a non-negative number of seconds, got {}",
                secs
            )));
        }
        Duration::try_milliseconds(millis.round() as i64).ok_or_else(|| {
            Error::Config(format!(
                "time_gap_threshold_seconds {} is out of range",
                secs
            ))
        })
    }

    /// Load defaults, then `config_path` (TOML) if given, then `CHAT_DISTILL_*`
    /// environment variables (`__` separates nested keys).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()));
        if let Some(path) = config_path {
            if !path.is_file() {
                return Err(Error::Config(format!("config file {:?} not found", path)));
            }
            figment = figment.merge(Toml::file(path));
        }

        figment
            .merge(Env::prefixed("CHAT_DISTILL_").split("__"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))
    }
}

/// Where run artifacts go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Local,
    S3,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub modes: Vec<OutputMode>,
    /// Runs are written to `<local_dir>/<run_id>/`.
    pub local_dir: PathBuf,
    /// Objects are uploaded to `<s3_bucket>/<run_id>/data/`.
    pub s3_bucket: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            modes: vec![OutputMode::Local],
            local_dir: PathBuf::from("outputs"),
            s3_bucket: None,
        }
    }
}

impl OutputConfig {
    pub fn writes_local(&self) -> bool {
        self.modes.contains(&OutputMode::Local)
    }

    /// The bucket to upload to, if uploading is enabled.
    pub fn upload_bucket(&self) -> Result<Option<&str>> {
        if !self.modes.contains(&OutputMode::S3) {
            return Ok(None);
        }
        match self.s3_bucket.as_deref().map(str::trim) {
            Some(bucket) if !bucket.is_empty() => Ok(Some(bucket)),
            _ => Err(Error::Config(
                "output mode 's3' requires output.s3_bucket".to_string(),
            )),
        }
    }
}

/// Settings for the downstream trainer. Carried through to run metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FineTuningConfig {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub lora: LoraConfig,
    pub training: TrainingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Also names the tokenizer used for counting.
    pub name: String,
    pub max_seq_length: usize,
    pub load_in_4bit: bool,
    pub chat_template: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "unsloth/Llama-3.2-3B-Instruct".to_string(),
            max_seq_length: 2048,
            load_in_4bit: true,
            chat_template: "llama-3.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub split: String,
    pub num_proc: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            split: "train".to_string(),
            num_proc: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub r: u32,
    pub alpha: u32,
    pub dropout: f64,
    pub bias: String,
    pub use_gradient_checkpointing: String,
    pub random_state: u64,
    pub use_rslora: bool,
    pub target_modules: Vec<String>,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            r: 16,
            alpha: 16,
            dropout: 0.0,
            bias: "none".to_string(),
            use_gradient_checkpointing: "unsloth".to_string(),
            random_state: 3407,
            use_rslora: false,
            target_modules: [
                "q_proj", "k_proj", "v_proj", "o_proj", "gate_proj", "up_proj", "down_proj",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub per_device_train_batch_size: usize,
    pub gradient_accumulation_steps: usize,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub lr_scheduler_type: String,
    pub seed: u64,
    pub packing: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 4,
            warmup_steps: 5,
            max_steps: 60,
            learning_rate: 2e-4,
            weight_decay: 0.01,
            lr_scheduler_type: "linear".to_string(),
            seed: 3407,
            packing: false,
        }
    }
}

/// Config section an override key can land in, in matching order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideLayer {
    Main,
    Dataset,
    Lora,
    Model,
    Training,
}

impl OverrideLayer {
    pub const ALL: [OverrideLayer; 5] = [
        OverrideLayer::Main,
        OverrideLayer::Dataset,
        OverrideLayer::Lora,
        OverrideLayer::Model,
        OverrideLayer::Training,
    ];

    /// JSON pointer of the section inside the serialized config.
    fn pointer(self) -> &'static str {
        match self {
            OverrideLayer::Main => "",
            OverrideLayer::Dataset => "/fine_tuning/dataset",
            OverrideLayer::Lora => "/fine_tuning/lora",
            OverrideLayer::Model => "/fine_tuning/model",
            OverrideLayer::Training => "/fine_tuning/training",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OverrideLayer::Main => "main",
            OverrideLayer::Dataset => "dataset",
            OverrideLayer::Lora => "lora",
            OverrideLayer::Model => "model",
            OverrideLayer::Training => "training",
        }
    }
}

/// How many override keys landed in each layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OverrideCounts {
    pub main: usize,
    pub dataset: usize,
    pub lora: usize,
    pub model: usize,
    pub training: usize,
    pub skipped: usize,
}

impl OverrideCounts {
    fn record(&mut self, layer: OverrideLayer) {
        let slot = match layer {
            OverrideLayer::Main => &mut self.main,
            OverrideLayer::Dataset => &mut self.dataset,
            OverrideLayer::Lora => &mut self.lora,
            OverrideLayer::Model => &mut self.model,
            OverrideLayer::Training => &mut self.training,
        };
        *slot += 1;
    }

    pub fn applied(&self) -> usize {
        self.main + self.dataset + self.lora + self.model + self.training
    }
}

fn section_declares(root: &Value, layer: OverrideLayer, key: &str) -> bool {
    root.pointer(layer.pointer())
        .and_then(Value::as_object)
        .is_some_and(|section| section.contains_key(key))
}

/// Apply `overrides` on top of `base`.
///
/// Each key goes to the first layer declaring it (main, dataset, lora,
/// model, training); keys no layer declares are skipped with a warning.
/// A value that does not fit the field's type is an error.
pub fn resolve_overrides(
    base: &AppConfig,
    overrides: &Map<String, Value>,
) -> Result<(AppConfig, OverrideCounts)> {
    let mut root = serde_json::to_value(base)?;
    let mut counts = OverrideCounts::default();

    for (key, value) in overrides {
        let layer = OverrideLayer::ALL
            .into_iter()
            .find(|layer| section_declares(&root, *layer, key));

        let Some(layer) = layer else {
            warn!(key = key.as_str(), "override skipped: key not found in configuration");
            counts.skipped += 1;
            continue;
        };

        if let Some(section) = root.pointer_mut(layer.pointer()).and_then(Value::as_object_mut) {
            debug!(layer = layer.name(), key = key.as_str(), %value, "applying override");
            section.insert(key.clone(), value.clone());
        }
        serde_json::from_value::<AppConfig>(root.clone()).map_err(|e| Error::InvalidOverride {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        counts.record(layer);
    }

    let resolved = serde_json::from_value(root)?;
    info!(
        main = counts.main,
        dataset = counts.dataset,
        lora = counts.lora,
        model = counts.model,
        training = counts.training,
        skipped = counts.skipped,
        "override summary"
    );
    Ok((resolved, counts))
}
