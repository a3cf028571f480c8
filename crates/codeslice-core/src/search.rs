//! Keyword boosting and re-ranking of vector candidates.
//!
//! The vector store ranks chunks by embedding distance alone. This module
//! blends that signal with literal overlap between the query and the chunk
//! text, which rescues exact identifier matches that embeddings blur.
//!
//! # Scoring
//!
//! For each candidate:
//!
//! 1. `similarity = clamp(1 − distance, 0, 1)`.
//! 2. `keyword = Σ min(count(kw), saturation) / (saturation × |keywords|)`,
//!    where `count` is the number of case-insensitive occurrences of each
//!    query keyword in the chunk text. `0` when the query has no keywords.
//! 3. `final = similarity_weight × similarity + keyword_weight × keyword`.
//!
//! Candidates scoring below `min_score` are dropped. The rest are sorted by
//! final score (desc), then by their original similarity rank (asc), then by
//! path (asc), and truncated to `k`.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// Re-ranking parameters (the `[retrieval]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoostConfig {
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    /// Occurrences of one keyword beyond this count add nothing.
    #[serde(default = "default_keyword_saturation")]
    pub keyword_saturation: usize,
    /// Candidates fetched per requested result.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Minimum number of candidates fetched, whatever `k` is.
    #[serde(default = "default_candidate_floor")]
    pub candidate_floor: usize,
    #[serde(default)]
    pub min_score: f64,
}

fn default_similarity_weight() -> f64 {
    0.7
}

fn default_keyword_weight() -> f64 {
    0.3
}

fn default_keyword_saturation() -> usize {
    3
}

fn default_candidate_multiplier() -> usize {
    5
}

fn default_candidate_floor() -> usize {
    20
}

impl Default for BoostConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            keyword_weight: default_keyword_weight(),
            keyword_saturation: default_keyword_saturation(),
            candidate_multiplier: default_candidate_multiplier(),
            candidate_floor: default_candidate_floor(),
            min_score: 0.0,
        }
    }
}

impl BoostConfig {
    /// Number of vector candidates to fetch for `k` results.
    pub fn candidate_count(&self, k: usize) -> usize {
        k.saturating_mul(self.candidate_multiplier)
            .max(self.candidate_floor)
            .max(k)
    }
}

/// A vector-store match awaiting re-ranking.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    pub distance: f32,
}

/// A ranked search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
    /// Blended score.
    pub score: f64,
    pub similarity: f64,
    pub keyword_score: f64,
}

const STOP_WORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "because", "been", "but", "can",
    "could", "did", "does", "doing", "for", "from", "get", "had", "has", "have", "her", "his",
    "how", "into", "its", "just", "more", "not", "now", "our", "out", "over", "should", "some",
    "than", "that", "the", "their", "them", "then", "there", "these", "they", "this", "use",
    "used", "using", "was", "way", "were", "what", "when", "where", "which", "while", "who",
    "why", "will", "with", "would", "you", "your",
];

/// Lowercase identifier-like tokens of more than two characters, without
/// stop words or duplicates, in first-seen order.
///
/// ```rust
/// use codeslice_core::search::extract_keywords;
///
/// assert_eq!(
///     extract_keywords("Where is the parse_config fn for TOML?"),
///     vec!["parse_config", "toml"]
/// );
/// ```
pub fn extract_keywords(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    query
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .map(str::to_lowercase)
        .filter(|t| t.chars().count() > 2 && !STOP_WORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Saturated keyword overlap in `[0, 1]`.
pub fn keyword_score(keywords: &[String], text: &str, saturation: usize) -> f64 {
    if keywords.is_empty() || saturation == 0 {
        return 0.0;
    }
    let haystack = text.to_lowercase();
    let total: usize = keywords
        .iter()
        .map(|kw| haystack.matches(kw.as_str()).count().min(saturation))
        .sum();
    total as f64 / (saturation * keywords.len()) as f64
}

/// Map a cosine distance onto a `[0, 1]` similarity.
pub fn similarity_from_distance(distance: f32) -> f64 {
    (1.0 - distance as f64).clamp(0.0, 1.0)
}

/// Score, filter, sort and truncate candidates.
///
/// `candidates` must be in the vector store's order (closest first); that
/// position is the similarity rank used for tie-breaking.
pub fn rerank(
    query: &str,
    candidates: Vec<Candidate>,
    config: &BoostConfig,
    k: usize,
) -> Vec<SearchHit> {
    if k == 0 {
        return Vec::new();
    }
    let keywords = extract_keywords(query);

    let mut scored: Vec<(usize, SearchHit)> = candidates
        .into_iter()
        .enumerate()
        .map(|(rank, c)| {
            let similarity = similarity_from_distance(c.distance);
            let kw = keyword_score(&keywords, &c.text, config.keyword_saturation);
            let score = config.similarity_weight * similarity + config.keyword_weight * kw;
            (
                rank,
                SearchHit {
                    chunk_id: c.chunk_id,
                    path: c.path,
                    start_line: c.start_line,
                    end_line: c.end_line,
                    text: c.text,
                    score,
                    similarity,
                    keyword_score: kw,
                },
            )
        })
        .filter(|(_, hit)| hit.score >= config.min_score)
        .collect();

    scored.sort_by(|(rank_a, a), (rank_b, b)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then(rank_a.cmp(rank_b))
            .then_with(|| a.path.cmp(&b.path))
    });
    scored.truncate(k);
    scored.into_iter().map(|(_, hit)| hit).collect()
}
