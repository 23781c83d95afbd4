//! Context pruning to fit a token budget.
//!
//! Chunks are ranked by `0.7 * relevance + 0.3 * recency` and kept greedily
//! until the kept set reaches the `min_keep_tokens` floor. If the floor cannot
//! be met the original context is returned untouched with a `warning`; the
//! pruner never silently over-prunes.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::tokens::estimate_tokens;

const RELEVANCE_WEIGHT: f64 = 0.7;
const RECENCY_WEIGHT: f64 = 0.3;

static CHUNK_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("chunk split regex"));
static ISO_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("date regex"));
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_]{3,}").expect("word regex"));

/// Context handed to the pruner: one text blob or a list of chunks.
///
/// The output keeps the input's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PruneInput {
    Text(String),
    Chunks(Vec<String>),
}

impl PruneInput {
    fn chunks(&self) -> Vec<String> {
        match self {
            Self::Text(text) => CHUNK_SPLIT_RE
                .split(text)
                .map(str::to_string)
                .filter(|chunk| !chunk.trim().is_empty())
                .collect(),
            Self::Chunks(chunks) => chunks.clone(),
        }
    }

    fn with_chunks(&self, chunks: Vec<String>) -> Self {
        match self {
            Self::Text(_) => Self::Text(chunks.join("\n\n")),
            Self::Chunks(_) => Self::Chunks(chunks),
        }
    }

    pub fn estimate_tokens(&self) -> usize {
        match self {
            Self::Text(text) => estimate_tokens(text),
            Self::Chunks(chunks) => chunks.iter().map(|c| estimate_tokens(c)).sum(),
        }
    }

    /// Render as a single string (chunks joined by blank lines).
    pub fn render(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Chunks(chunks) => chunks.join("\n\n"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PruneStatus {
    /// Already within budget; returned unchanged.
    Skipped,
    Pruned,
    /// Pruning would break the `min_keep_tokens` floor; original returned.
    Warning,
    /// The relevance oracle failed; original returned.
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruneOutcome {
    pub status: PruneStatus,
    pub context: PruneInput,
    pub token_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub dropped_chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    pub target_tokens: usize,
    pub min_keep_tokens: usize,
    /// Chunks mentioning a date older than this are treated as stale.
    pub max_age_days: i64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            target_tokens: 6_000,
            min_keep_tokens: 1_500,
            max_age_days: 30,
        }
    }
}

impl PruningConfig {
    pub fn validate(&self) -> Result<()> {
        if self.target_tokens == 0 {
            return Err(anyhow!("pruning.target_tokens must be > 0"));
        }
        if self.max_age_days < 0 {
            return Err(anyhow!("pruning.max_age_days must be >= 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PruneOptions {
    pub target_tokens: usize,
    pub min_keep_tokens: usize,
    pub max_age_days: i64,
    /// Reference date for recency scoring.
    pub today: NaiveDate,
}

impl PruneOptions {
    pub fn from_config(config: &PruningConfig, today: NaiveDate) -> Self {
        Self {
            target_tokens: config.target_tokens,
            min_keep_tokens: config.min_keep_tokens,
            max_age_days: config.max_age_days,
            today,
        }
    }
}

/// Source of per-chunk relevance in `[0, 1]`.
pub trait RelevanceOracle {
    fn relevance(&self, chunk: &str) -> Result<f64>;
}

/// Lexical relevance: share of query terms that appear in the chunk.
#[derive(Debug, Clone)]
pub struct KeywordRelevance {
    terms: BTreeSet<String>,
}

impl KeywordRelevance {
    pub fn new(query: &str) -> Self {
        Self {
            terms: words(query),
        }
    }
}

impl RelevanceOracle for KeywordRelevance {
    fn relevance(&self, chunk: &str) -> Result<f64> {
        if self.terms.is_empty() {
            return Ok(0.0);
        }
        let chunk_words = words(chunk);
        let hits = self.terms.intersection(&chunk_words).count();
        Ok(hits as f64 / self.terms.len() as f64)
    }
}

fn words(text: &str) -> BTreeSet<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Reduce `input` to fit `options.target_tokens` without dropping below the floor.
pub fn prune_context<O: RelevanceOracle + ?Sized>(
    input: &PruneInput,
    options: &PruneOptions,
    oracle: &O,
) -> PruneOutcome {
    let original_tokens = input.estimate_tokens();
    if original_tokens <= options.target_tokens {
        debug!(
            tokens = original_tokens,
            target = options.target_tokens,
            "context within budget"
        );
        return unchanged(input, PruneStatus::Skipped, original_tokens, None);
    }

    let chunks = input.chunks();
    let mut scored = Vec::with_capacity(chunks.len());
    for (idx, chunk) in chunks.iter().enumerate() {
        let relevance = match oracle.relevance(chunk) {
            Ok(value) => value.clamp(0.0, 1.0),
            Err(err) => {
                warn!(err = %err, chunk = idx, "relevance oracle failed");
                return unchanged(
                    input,
                    PruneStatus::Error,
                    original_tokens,
                    Some(format!("relevance oracle failed: {err}")),
                );
            }
        };
        let recency = recency(chunk, options.today, options.max_age_days);
        let score = RELEVANCE_WEIGHT * relevance + RECENCY_WEIGHT * recency;
        scored.push((idx, score, estimate_tokens(chunk)));
    }
    // Stable sort keeps original order among equal scores.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut kept = Vec::new();
    let mut kept_tokens = 0usize;
    for (idx, _, tokens) in &scored {
        if kept_tokens >= options.min_keep_tokens {
            break;
        }
        kept.push(*idx);
        kept_tokens += tokens;
    }

    if kept_tokens < options.min_keep_tokens {
        warn!(
            kept_tokens,
            min_keep = options.min_keep_tokens,
            "pruning would drop below floor; returning original context"
        );
        return unchanged(
            input,
            PruneStatus::Warning,
            original_tokens,
            Some("min_keep_unreachable".to_string()),
        );
    }

    kept.sort_unstable();
    let dropped_chunks = chunks.len() - kept.len();
    let pruned: Vec<String> = kept.iter().map(|&idx| minify_tables(&chunks[idx])).collect();
    let context = input.with_chunks(pruned);
    let token_count = context.estimate_tokens();
    debug!(
        original_tokens,
        token_count, dropped_chunks, "context pruned"
    );
    PruneOutcome {
        status: PruneStatus::Pruned,
        context,
        token_count,
        reason: None,
        dropped_chunks,
    }
}

fn unchanged(
    input: &PruneInput,
    status: PruneStatus,
    token_count: usize,
    reason: Option<String>,
) -> PruneOutcome {
    PruneOutcome {
        status,
        context: input.clone(),
        token_count,
        reason,
        dropped_chunks: 0,
    }
}

/// 0.0 if the chunk mentions a date older than `max_age_days`, else 1.0.
fn recency(chunk: &str, today: NaiveDate, max_age_days: i64) -> f64 {
    let stale = ISO_DATE_RE.captures_iter(chunk).any(|caps| {
        let parsed = (
            caps[1].parse::<i32>(),
            caps[2].parse::<u32>(),
            caps[3].parse::<u32>(),
        );
        let (Ok(y), Ok(m), Ok(d)) = parsed else {
            return false;
        };
        NaiveDate::from_ymd_opt(y, m, d)
            .map(|date| (today - date).num_days() > max_age_days)
            .unwrap_or(false)
    });
    if stale { 0.0 } else { 1.0 }
}

/// Shorten table-like lines (`a | b | c | ...`) to their first two fields.
fn minify_tables(chunk: &str) -> String {
    chunk
        .lines()
        .map(|line| {
            let inner = line.trim().trim_matches('|');
            let fields: Vec<&str> = inner.split('|').map(str::trim).collect();
            if fields.len() >= 3 {
                format!("{} | {}", fields[0], fields[1])
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapOracle(HashMap<&'static str, f64>);

    impl RelevanceOracle for MapOracle {
        fn relevance(&self, chunk: &str) -> Result<f64> {
            Ok(self
                .0
                .iter()
                .find(|(key, _)| chunk.contains(*key))
                .map(|(_, v)| *v)
                .unwrap_or(0.0))
        }
    }

    struct FailingOracle;

    impl RelevanceOracle for FailingOracle {
        fn relevance(&self, _chunk: &str) -> Result<f64> {
            Err(anyhow!("oracle offline"))
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 16).expect("date")
    }

    fn options(target: usize, min_keep: usize) -> PruneOptions {
        PruneOptions {
            target_tokens: target,
            min_keep_tokens: min_keep,
            max_age_days: 30,
            today: today(),
        }
    }

    fn chunk(tag: &str) -> String {
        // 70 chars -> 20 tokens.
        format!("{tag}{}", "x".repeat(70 - tag.len()))
    }

    #[test]
    fn within_budget_is_skipped_unchanged() {
        let input = PruneInput::Text("short context".to_string());
        let outcome = prune_context(&input, &options(100, 10), &FailingOracle);
        assert_eq!(outcome.status, PruneStatus::Skipped);
        assert_eq!(outcome.context, input);
    }

    #[test]
    fn keeps_most_relevant_chunks_in_original_order() {
        let input = PruneInput::Chunks(vec![chunk("low"), chunk("high"), chunk("mid")]);
        let oracle = MapOracle(HashMap::from([("high", 1.0), ("mid", 0.5), ("low", 0.0)]));

        let outcome = prune_context(&input, &options(50, 40), &oracle);

        assert_eq!(outcome.status, PruneStatus::Pruned);
        assert_eq!(
            outcome.context,
            PruneInput::Chunks(vec![chunk("high"), chunk("mid")])
        );
        assert_eq!(outcome.token_count, 40);
        assert_eq!(outcome.dropped_chunks, 1);
    }

    #[test]
    fn stale_dates_lose_recency() {
        let stale = format!("2026-01-02 {}", "x".repeat(59));
        let fresh = format!("2026-10-10 {}", "x".repeat(59));
        let input = PruneInput::Chunks(vec![stale.clone(), fresh.clone()]);
        let oracle = MapOracle(HashMap::new());

        let outcome = prune_context(&input, &options(30, 20), &oracle);

        assert_eq!(outcome.status, PruneStatus::Pruned);
        assert_eq!(outcome.context, PruneInput::Chunks(vec![fresh]));
    }

    #[test]
    fn unreachable_floor_returns_original_with_warning() {
        let input = PruneInput::Chunks(vec![chunk("a"), chunk("b")]);
        let oracle = MapOracle(HashMap::new());

        let outcome = prune_context(&input, &options(30, 100), &oracle);

        assert_eq!(outcome.status, PruneStatus::Warning);
        assert_eq!(outcome.context, input);
        assert_eq!(outcome.token_count, 40);
    }

    #[test]
    fn oracle_failure_returns_original_with_error() {
        let input = PruneInput::Chunks(vec![chunk("a"), chunk("b")]);
        let outcome = prune_context(&input, &options(30, 10), &FailingOracle);
        assert_eq!(outcome.status, PruneStatus::Error);
        assert_eq!(outcome.context, input);
        assert!(outcome.reason.expect("reason").contains("oracle offline"));
    }

    #[test]
    fn text_input_splits_on_blank_lines_and_minifies_tables() {
        let table = "name | amount | date | memo\nrent | 1200 | 2026-10-01 | oct";
        let filler = "y".repeat(140);
        let text = format!("{table}\n\n{filler}");
        let oracle = MapOracle(HashMap::from([("rent", 1.0)]));

        let outcome = prune_context(&PruneInput::Text(text), &options(40, 10), &oracle);

        assert_eq!(outcome.status, PruneStatus::Pruned);
        assert_eq!(
            outcome.context,
            PruneInput::Text("name | amount\nrent | 1200".to_string())
        );
    }

    #[test]
    fn minify_leaves_two_column_lines_alone() {
        assert_eq!(minify_tables("a | b"), "a | b");
        assert_eq!(minify_tables("| a | b | c |"), "a | b");
        assert_eq!(minify_tables("plain line"), "plain line");
    }

    #[test]
    fn keyword_relevance_is_term_overlap() {
        let oracle = KeywordRelevance::new("budget rent groceries");
        let score = oracle.relevance("Rent went up; budget is tight").expect("score");
        assert!((score - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(oracle.relevance("nothing here").expect("score"), 0.0);
    }
}
