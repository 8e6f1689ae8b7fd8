//! Corpus statistics and discard diagnostics.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::message::Chat;
use crate::normalize::MessageRejection;
use crate::validate::BlockRejection;
use crate::Tokenizer;

/// Everything the pipeline threw away, by stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscardCounts {
    pub skipped_messages: usize,
    pub skipped_messages_by_reason: BTreeMap<String, usize>,
    pub unnamed_chats: usize,
    pub unsupported_chats: usize,
    /// Chats with no message surviving normalization.
    pub empty_chats: usize,
    pub short_segments: usize,
    pub long_segments: usize,
    /// Chats whose every segment fell outside the token window.
    pub chats_without_segments: usize,
    pub short_blocks: usize,
    pub long_blocks: usize,
    pub invalid_blocks: usize,
    /// Chats with no block accepted by validation.
    pub chats_without_blocks: usize,
}

impl DiscardCounts {
    pub fn record_message(&mut self, rejection: &MessageRejection) {
        self.skipped_messages += 1;
        *self
            .skipped_messages_by_reason
            .entry(rejection.reason().to_string())
            .or_default() += 1;
    }

    pub fn record_block(&mut self, rejection: &BlockRejection) {
        match rejection {
            BlockRejection::TooFewTurns { .. } | BlockRejection::TooShort { .. } => {
                self.short_blocks += 1
            }
            BlockRejection::TooLong { .. } => self.long_blocks += 1,
            BlockRejection::Invalid(_) => self.invalid_blocks += 1,
        }
    }

    pub fn merge(&mut self, other: &DiscardCounts) {
        self.skipped_messages += other.skipped_messages;
        for (reason, count) in &other.skipped_messages_by_reason {
            *self
                .skipped_messages_by_reason
                .entry(reason.clone())
                .or_default() += count;
        }
        self.unnamed_chats += other.unnamed_chats;
        self.unsupported_chats += other.unsupported_chats;
        self.empty_chats += other.empty_chats;
        self.short_segments += other.short_segments;
        self.long_segments += other.long_segments;
        self.chats_without_segments += other.chats_without_segments;
        self.short_blocks += other.short_blocks;
        self.long_blocks += other.long_blocks;
        self.invalid_blocks += other.invalid_blocks;
        self.chats_without_blocks += other.chats_without_blocks;
    }

    /// Blocks rejected at validation, whatever the reason.
    pub fn discarded_blocks(&self) -> usize {
        self.short_blocks + self.long_blocks + self.invalid_blocks
    }
}

/// Aggregates over the accepted corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatStats {
    pub num_chats: usize,
    pub num_blocks: usize,
    pub min_tokens_per_block: usize,
    pub max_tokens_per_block: usize,
    pub avg_tokens_per_block: f64,
    pub min_duration_minutes_per_block: f64,
    pub max_duration_minutes_per_block: f64,
    pub avg_duration_minutes_per_block: f64,
    /// Accepted blocks per contact name. Chats sharing a name, e.g. from
    /// two exports of the same account, are counted together.
    pub block_breakdown: BTreeMap<String, usize>,
}

fn extrema_and_mean<I>(values: I) -> Option<(f64, f64, f64)>
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let (mut min, mut max, mut sum) = (f64::INFINITY, f64::NEG_INFINITY, 0.0);
    for v in values {
        count += 1;
        min = min.min(v);
        max = max.max(v);
        sum += v;
    }
    (count > 0).then(|| (min, max, sum / count as f64))
}

/// Compute corpus statistics. An empty corpus yields zeroed stats.
pub fn compute_stats<T: Tokenizer>(chats: &[Chat], tokenizer: &T) -> ChatStats {
    let mut stats = ChatStats {
        num_chats: chats.len(),
        ..Default::default()
    };

    let mut tokens: Vec<usize> = Vec::new();
    let mut minutes: Vec<f64> = Vec::new();
    for chat in chats {
        *stats
            .block_breakdown
            .entry(chat.contact_name.clone())
            .or_default() += chat.valid_blocks.len();

        for block in &chat.valid_blocks {
            tokens.push(block.token_count(tokenizer));
            if let Some(duration) = block.duration() {
                minutes.push(duration.num_milliseconds() as f64 / 60_000.0);
            }
        }
    }

    stats.num_blocks = tokens.len();
    if let Some((min, max, avg)) = extrema_and_mean(tokens.iter().map(|&t| t as f64)) {
        stats.min_tokens_per_block = min as usize;
        stats.max_tokens_per_block = max as usize;
        stats.avg_tokens_per_block = avg;
    }
    if let Some((min, max, avg)) = extrema_and_mean(minutes) {
        stats.min_duration_minutes_per_block = min;
        stats.max_duration_minutes_per_block = max;
        stats.avg_duration_minutes_per_block = avg;
    }
    stats
}

/// Stats plus discard tallies for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineReport {
    pub stats: ChatStats,
    pub discards: DiscardCounts,
    /// Whether the requested token window was replaced by the defaults.
    pub token_budget_corrected: bool,
}

impl PipelineReport {
    /// Flat named metrics, for metadata and external reporting.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let s = &self.stats;
        let d = &self.discards;
        let mut metrics: BTreeMap<String, f64> = [
            ("num_chats", s.num_chats as f64),
            ("num_blocks", s.num_blocks as f64),
            ("min_tokens_per_block", s.min_tokens_per_block as f64),
            ("max_tokens_per_block", s.max_tokens_per_block as f64),
            ("avg_tokens_per_block", s.avg_tokens_per_block),
            ("min_duration_minutes_per_block", s.min_duration_minutes_per_block),
            ("max_duration_minutes_per_block", s.max_duration_minutes_per_block),
            ("avg_duration_minutes_per_block", s.avg_duration_minutes_per_block),
            ("skipped_messages", d.skipped_messages as f64),
            ("unnamed_chats", d.unnamed_chats as f64),
            ("unsupported_chats", d.unsupported_chats as f64),
            ("empty_chats", d.empty_chats as f64),
            ("short_segments", d.short_segments as f64),
            ("long_segments", d.long_segments as f64),
            ("chats_without_segments", d.chats_without_segments as f64),
            ("short_blocks", d.short_blocks as f64),
            ("long_blocks", d.long_blocks as f64),
            ("invalid_blocks", d.invalid_blocks as f64),
            ("discarded_blocks", d.discarded_blocks() as f64),
            ("chats_without_blocks", d.chats_without_blocks as f64),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();

        for (reason, count) in &d.skipped_messages_by_reason {
            metrics.insert(format!("skipped_messages_{}", reason), *count as f64);
        }
        metrics
    }
}

/// The stats table and the `top_k` chats by block count.
struct Summary<'a> {
    report: &'a PipelineReport,
    top_k: usize,
}

impl fmt::Display for Summary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.report.stats;
        let d = &self.report.discards;
        let rule = "*".repeat(36);

        writeln!(f, "{rule}")?;
        writeln!(f, "*{:^34}*", "Chat Statistics Summary")?;
        writeln!(f, "{rule}")?;
        writeln!(f, "{:<25} | {:>8}", "Metric", "Value")?;
        writeln!(f, "{}", "-".repeat(36))?;
        writeln!(f, "{:<25} | {:>8}", "Total Chats", s.num_chats)?;
        writeln!(f, "{:<25} | {:>8}", "Total Blocks", s.num_blocks)?;
        writeln!(f, "{:<25} | {:>8}", "Min Tokens/Block", s.min_tokens_per_block)?;
        writeln!(f, "{:<25} | {:>8}", "Max Tokens/Block", s.max_tokens_per_block)?;
        writeln!(f, "{:<25} | {:>8.2}", "Avg Tokens/Block", s.avg_tokens_per_block)?;
        writeln!(f, "{:<25} | {:>8.2}", "Min Duration (min)", s.min_duration_minutes_per_block)?;
        writeln!(f, "{:<25} | {:>8.2}", "Max Duration (min)", s.max_duration_minutes_per_block)?;
        writeln!(f, "{:<25} | {:>8.2}", "Avg Duration (min)", s.avg_duration_minutes_per_block)?;
        writeln!(f, "{:<25} | {:>8}", "Skipped Messages", d.skipped_messages)?;
        writeln!(f, "{:<25} | {:>8}", "Short Segments", d.short_segments)?;
        writeln!(f, "{:<25} | {:>8}", "Long Segments", d.long_segments)?;
        writeln!(f, "{:<25} | {:>8}", "Discarded Blocks", d.discarded_blocks())?;

        let mut ranked: Vec<(&String, &usize)> = s.block_breakdown.iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(a.1));

        writeln!(f)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "*{:^34}*", "Top Chats by Block Count")?;
        writeln!(f, "{rule}")?;
        for (rank, (name, count)) in ranked.into_iter().take(self.top_k).enumerate() {
            writeln!(f, "{:>2}. {:<28} {:>5}", rank + 1, name, count)?;
        }
        Ok(())
    }
}

/// Render the stats table and the `top_k` chats by block count.
pub fn render_summary(report: &PipelineReport, top_k: usize) -> String {
    Summary { report, top_k }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Block, ChatKind, Message, Role};
    use chrono::{Duration, NaiveDate, NaiveDateTime};

    struct WordTokenizer;

    impl Tokenizer for WordTokenizer {
        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn at(minutes: i64) -> Option<NaiveDateTime> {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|t| t + Duration::minutes(minutes))
    }

    fn block(user: &str, assistant: &str, start: i64, minutes: i64) -> Block {
        Block::new(
            vec![
                Message::new(Role::User, user, at(start)).unwrap(),
                Message::new(Role::Assistant, assistant, at(start + minutes)).unwrap(),
            ],
            false,
        )
        .unwrap()
    }

    fn chat(name: &str, blocks: Vec<Block>) -> Chat {
        let mut chat = Chat::new(name, ChatKind::Personal, Vec::new());
        chat.valid_blocks = blocks;
        chat
    }

    #[test]
    fn test_empty_corpus_is_zeroed() {
        let stats = compute_stats(&[], &WordTokenizer);
        assert_eq!(stats, ChatStats::default());
    }

    #[test]
    fn test_compute_stats() {
        let chats = vec![
            chat("Bob", vec![block("a b", "c", 0, 10), block("a", "b", 100, 0)]),
            chat("Carol", vec![block("a b c d", "e f", 0, 20)]),
        ];
        let stats = compute_stats(&chats, &WordTokenizer);

        assert_eq!(stats.num_chats, 2);
        assert_eq!(stats.num_blocks, 3);
        assert_eq!(stats.min_tokens_per_block, 2);
        assert_eq!(stats.max_tokens_per_block, 6);
        assert!((stats.avg_tokens_per_block - 11.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.min_duration_minutes_per_block, 0.0);
        assert_eq!(stats.max_duration_minutes_per_block, 20.0);
        assert!((stats.avg_duration_minutes_per_block - 10.0).abs() < 1e-9);
        assert_eq!(stats.block_breakdown["Bob"], 2);
        assert_eq!(stats.block_breakdown["Carol"], 1);
    }

    #[test]
    fn test_breakdown_sums_chats_with_the_same_name() {
        let chats = vec![
            chat("Bob", vec![block("a", "b", 0, 1)]),
            chat("Bob", vec![block("c", "d", 0, 1), block("e", "f", 5, 1)]),
        ];
        let stats = compute_stats(&chats, &WordTokenizer);
        assert_eq!(stats.num_chats, 2);
        assert_eq!(stats.block_breakdown.len(), 1);
        assert_eq!(stats.block_breakdown["Bob"], 3);
    }

    #[test]
    fn test_discard_counts_merge() {
        let mut a = DiscardCounts::default();
        a.record_message(&MessageRejection::BeforeCutoff);
        a.record_block(&BlockRejection::TooLong { tokens: 9, max: 8 });

        let mut b = DiscardCounts::default();
        b.record_message(&MessageRejection::BeforeCutoff);
        b.record_message(&MessageRejection::MissingSender);
        b.record_block(&BlockRejection::TooFewTurns { turns: 0, required: 2 });

        a.merge(&b);
        assert_eq!(a.skipped_messages, 3);
        assert_eq!(a.skipped_messages_by_reason["before_cutoff"], 2);
        assert_eq!(a.long_blocks, 1);
        assert_eq!(a.short_blocks, 1);
        assert_eq!(a.discarded_blocks(), 2);
    }

    #[test]
    fn test_metrics_and_summary() {
        let chats = vec![
            chat("Bob", vec![block("a", "b", 0, 1)]),
            chat("Carol", vec![block("a", "b", 0, 1), block("c", "d", 5, 1)]),
        ];
        let mut discards = DiscardCounts::default();
        discards.record_message(&MessageRejection::NoContent);
        let report = PipelineReport {
            stats: compute_stats(&chats, &WordTokenizer),
            discards,
            token_budget_corrected: false,
        };

        let metrics = report.metrics();
        assert_eq!(metrics["num_blocks"], 3.0);
        assert_eq!(metrics["skipped_messages_no_content"], 1.0);

        let table = render_summary(&report, 1);
        assert!(table.contains("Chat Statistics Summary"));
        assert!(table.contains(" 1. Carol"));
        assert!(!table.contains("Bob "));
    }
}
