//! End-to-end behaviour of the block construction pipeline.

use chat_distill_core::{
    merge_turns, run_pipeline, segment_messages, validate_block, AppConfig, BlockRejection,
    Message, PipelineSettings, RawChat, Role, TokenBudget, Tokenizer,
};
use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde_json::{json, Value};

/// Counts whitespace-separated words.
struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        text.split_whitespace().count()
    }
}

fn at(secs: i64) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .map(|t| t + Duration::seconds(secs))
}

fn msg(role: Role, text: &str, secs: i64) -> Message {
    Message::new(role, text, at(secs)).unwrap()
}

fn raw_message(from: &str, text: &str, secs: i64) -> Value {
    let date = at(secs).unwrap().format("%Y-%m-%dT%H:%M:%S").to_string();
    json!({"from": from, "date": date, "text_entities": [{"type": "plain", "text": text}]})
}

fn raw_chat(name: &str, messages: Vec<Value>) -> RawChat {
    serde_json::from_value(json!({"name": name, "type": "personal_chat", "messages": messages}))
        .unwrap()
}

#[test]
fn same_sender_run_merges_into_one_valid_block() {
    let messages = vec![
        msg(Role::User, "hello", 0),
        msg(Role::User, "still there", 5),
        msg(Role::Assistant, "yep", 10),
    ];
    let budget = TokenBudget::new(1, 1000);

    let segmented = segment_messages(&messages, Duration::seconds(60), &budget, &WordTokenizer);
    assert_eq!(segmented.blocks.len(), 1);
    assert_eq!(segmented.blocks[0].len(), 3);

    let turns = merge_turns(&segmented.blocks[0], ">>>");
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role(), Role::User);
    assert_eq!(turns[1].role(), Role::Assistant);

    let block = validate_block(&turns, None, &budget, &WordTokenizer).unwrap();
    assert_eq!(block.len(), 2);
}

#[test]
fn hour_gap_splits_into_two_blocks() {
    let messages = vec![msg(Role::User, "hi", 0), msg(Role::Assistant, "hi", 3600)];
    let segmented = segment_messages(
        &messages,
        Duration::seconds(60),
        &TokenBudget::new(1, 1000),
        &WordTokenizer,
    );
    assert_eq!(segmented.blocks.len(), 2);
}

#[test]
fn block_trimmed_to_nothing_is_short() {
    let turns = vec![msg(Role::Assistant, "late", 0), msg(Role::User, "hm", 1)];
    let rejection =
        validate_block(&turns, None, &TokenBudget::new(1, 1000), &WordTokenizer).unwrap_err();
    assert!(rejection.is_short());
    assert_eq!(
        rejection,
        BlockRejection::TooFewTurns {
            turns: 0,
            required: 2
        }
    );
}

#[test]
fn inverted_token_window_falls_back_to_defaults() {
    let config = AppConfig {
        min_tokens_per_block: 500,
        max_tokens_per_block: 100,
        ..Default::default()
    };
    let settings = PipelineSettings::from_config(&config).unwrap();
    assert!(settings.budget.was_corrected());
    assert_eq!((settings.budget.min(), settings.budget.max()), (100, 3000));

    let output = run_pipeline(&[], &settings, &WordTokenizer);
    assert!(output.token_budget_corrected);
    assert!(output.report(&WordTokenizer).token_budget_corrected);
}

#[test]
fn chat_entirely_before_cutoff_is_dropped() {
    let raw = vec![
        raw_chat(
            "Old friend",
            vec![raw_message("Old friend", "hi", 0), raw_message("Me", "hey", 5)],
        ),
        raw_chat(
            "New friend",
            vec![
                raw_message("New friend", "hi", 2 * 86_400),
                raw_message("Me", "hey", 2 * 86_400 + 5),
            ],
        ),
    ];
    let settings = PipelineSettings {
        target_speaker_id: "Me".to_string(),
        date_cutoff: at(86_400),
        budget: TokenBudget::new(1, 1000),
        ..Default::default()
    };

    let output = run_pipeline(&raw, &settings, &WordTokenizer);
    let names: Vec<&str> = output.chats.iter().map(|c| c.contact_name.as_str()).collect();
    assert_eq!(names, vec!["New friend"]);
    assert_eq!(output.discards.empty_chats, 1);
    assert_eq!(output.discards.skipped_messages_by_reason["before_cutoff"], 2);
}

/// Deterministic linear congruential generator, enough to shuffle roles and gaps.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self, bound: u64) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (self.0 >> 33) % bound
    }
}

#[test]
fn accepted_blocks_always_have_canonical_shape() {
    let mut rng = Lcg(7);
    let words = ["ok", "sure thing", "see you at noon", "lol", "what about tomorrow then"];

    let raw: Vec<RawChat> = (0..20)
        .map(|c| {
            let contact = format!("contact-{}", c);
            let mut secs = 0;
            let messages = (0..60)
                .map(|_| {
                    secs += [5, 30, 90, 7200][rng.next(4) as usize];
                    let from = if rng.next(2) == 0 { "Me" } else { contact.as_str() };
                    raw_message(from, words[rng.next(words.len() as u64) as usize], secs)
                })
                .collect();
            raw_chat(&contact, messages)
        })
        .collect();

    for system_prompt in [None, Some("Reply like me.".to_string())] {
        let settings = PipelineSettings {
            target_speaker_id: "Me".to_string(),
            time_gap_threshold: Duration::seconds(120),
            budget: TokenBudget::new(6, 40),
            system_prompt: system_prompt.clone(),
            ..Default::default()
        };
        let output = run_pipeline(&raw, &settings, &WordTokenizer);
        assert!(output.num_blocks() > 0);

        for chat in &output.chats {
            assert!(!chat.valid_blocks.is_empty());
            for block in &chat.valid_blocks {
                let turns = block.messages();
                let dialog = if system_prompt.is_some() {
                    assert_eq!(turns[0].role(), Role::System);
                    assert!(turns.len() >= 3);
                    &turns[1..]
                } else {
                    assert!(turns.len() >= 2);
                    turns
                };
                assert_eq!(dialog[0].role(), Role::User);
                assert_eq!(dialog[dialog.len() - 1].role(), Role::Assistant);
                assert!(turns.windows(2).all(|w| w[0].role() != w[1].role()));

                let tokens = block.token_count(&WordTokenizer);
                assert!((6..=40).contains(&tokens), "{} tokens", tokens);
            }
        }
    }
}
