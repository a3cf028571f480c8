//! Line-oriented code chunker.
//!
//! Splits a file's text into overlapping [`Chunk`]s that jointly cover every
//! line. Two policies are available and [`ChunkStrategy::Auto`] picks between
//! them per file:
//!
//! | Strategy | Boundaries | Overlap |
//! |---|---|---|
//! | `window` | every `window_lines - overlap` lines | `round(span × overlap_fraction)` lines shared with the previous window |
//! | `structural` | top-level and one-level-nested definitions (`fn`, `class`, `def`, …) | the same number of lines prepended from the previous chunk |
//!
//! # Structural algorithm
//!
//! 1. Find lines that open a definition (at most 4 columns of indentation).
//! 2. Pull each boundary up over directly attached doc comments, attributes
//!    and decorators, so they travel with the item they describe.
//! 3. Cut the file into segments at those boundaries; text before the first
//!    boundary is its own segment.
//! 4. Pack consecutive segments greedily while the pack stays within
//!    `window_lines` and `max_chunk_chars`. A segment that is too large on
//!    its own is cut into fixed blocks.
//! 5. Prefix every chunk after the first with the tail of its predecessor.
//!
//! `auto` uses the structural policy when at least two boundaries are found
//! and falls back to the sliding window otherwise.
//!
//! Chunk ids come from [`chunk_id`], so the same content always yields the
//! same ids. Changing any [`ChunkerConfig`] field changes the cut points;
//! [`ChunkerConfig::fingerprint`] captures that.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use codeslice_core::chunk::{Chunker, ChunkerConfig};
//! use codeslice_core::models::{ContentHash, FileRecord};
//!
//! let text: String = (1..=100).map(|i| format!("line {i}\n")).collect();
//! let record = FileRecord {
//!     path: "notes.txt".into(),
//!     hash: ContentHash::of(text.as_bytes()),
//!     size: text.len() as u64,
//!     modified: Utc::now(),
//! };
//!
//! let chunks = Chunker::new(ChunkerConfig::default()).chunk(&record, &text);
//! assert_eq!(chunks.len(), 4);
//! assert_eq!(chunks[0].start_line, 1);
//! assert_eq!(chunks[3].end_line, 100);
//! ```

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::{chunk_id, Chunk, ContentHash, FileRecord};

/// Bumped whenever the cutting rules change in a way that moves chunk edges.
const CHUNKER_REVISION: u32 = 1;

static DEFINITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"^[ \t]{0,4}",
        r"(?:(?:pub(?:\([^)]*\))?|export|default|public|private|protected|internal",
        r"|static|abstract|final|async|unsafe|extern(?:\s+\x22[^\x22]*\x22)?)\s+)*",
        r"(?:fn|struct|enum|trait|impl|mod|union|class|interface|def|function|func|object|record)\b",
    ))
    .expect("definition pattern is valid")
});

/// How a file is cut into chunks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Auto,
    Structural,
    Window,
}

impl ChunkStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStrategy::Auto => "auto",
            ChunkStrategy::Structural => "structural",
            ChunkStrategy::Window => "window",
        }
    }
}

/// Chunking parameters (the `[chunking]` config section).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    #[serde(default)]
    pub strategy: ChunkStrategy,
    /// Target lines per chunk.
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    /// Share of a chunk repeated from its predecessor, in `[0, 0.9]`.
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f64,
    /// Soft character cap. A single line longer than this still becomes one chunk.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
}

fn default_window_lines() -> usize {
    30
}

fn default_overlap_fraction() -> f64 {
    0.2
}

fn default_max_chunk_chars() -> usize {
    4000
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::default(),
            window_lines: default_window_lines(),
            overlap_fraction: default_overlap_fraction(),
            max_chunk_chars: default_max_chunk_chars(),
        }
    }
}

impl ChunkerConfig {
    /// Identifies every parameter that influences cut points.
    ///
    /// Two configs with equal fingerprints chunk any input identically.
    pub fn fingerprint(&self) -> String {
        format!(
            "r{}:{}:{}:{:.4}:{}",
            CHUNKER_REVISION,
            self.strategy.as_str(),
            self.window_lines,
            self.overlap_fraction,
            self.max_chunk_chars
        )
    }

    fn overlap_lines(&self, span: usize) -> usize {
        let raw = (span as f64 * self.overlap_fraction).round() as usize;
        raw.min(span.saturating_sub(1))
    }
}

/// Splits file content into [`Chunk`]s according to a [`ChunkerConfig`].
#[derive(Debug, Clone, Default)]
pub struct Chunker {
    config: ChunkerConfig,
}

/// Lines of one file with cumulative character counts.
struct Lines<'a> {
    lines: Vec<&'a str>,
    /// `prefix[i]` is the number of chars in `lines[..i]`.
    prefix: Vec<usize>,
}

impl<'a> Lines<'a> {
    fn new(content: &'a str) -> Self {
        let lines: Vec<&str> = content.split_inclusive('\n').collect();
        let mut prefix = Vec::with_capacity(lines.len() + 1);
        prefix.push(0);
        let mut total = 0;
        for line in &lines {
            total += line.chars().count();
            prefix.push(total);
        }
        Self { lines, prefix }
    }

    fn len(&self) -> usize {
        self.lines.len()
    }

    fn chars(&self, range: &Range<usize>) -> usize {
        self.prefix[range.end] - self.prefix[range.start]
    }

    fn text(&self, range: &Range<usize>) -> String {
        self.lines[range.clone()].concat()
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunk one file.
    ///
    /// `record.hash` feeds the chunk ids and should be the hash of `content`.
    /// Empty or whitespace-only content yields no chunks.
    pub fn chunk(&self, record: &FileRecord, content: &str) -> Vec<Chunk> {
        if content.trim().is_empty() {
            return Vec::new();
        }

        let lines = Lines::new(content);
        let ranges = match self.config.strategy {
            ChunkStrategy::Window => self.window_ranges(&lines),
            ChunkStrategy::Structural => self.structural_ranges(&lines, &boundaries(&lines)),
            ChunkStrategy::Auto => {
                let found = boundaries(&lines);
                if found.len() >= 2 {
                    self.structural_ranges(&lines, &found)
                } else {
                    self.window_ranges(&lines)
                }
            }
        };

        ranges
            .into_iter()
            .enumerate()
            .map(|(index, range)| {
                let text = lines.text(&range);
                Chunk {
                    id: chunk_id(&record.path, &record.hash, index),
                    path: record.path.clone(),
                    chunk_index: index,
                    start_line: range.start + 1,
                    end_line: range.end,
                    hash: ContentHash::of(text.as_bytes()),
                    text,
                }
            })
            .collect()
    }

    /// Sliding windows of `window_lines`, each sharing its first lines with
    /// the tail of the previous window.
    fn window_ranges(&self, lines: &Lines<'_>) -> Vec<Range<usize>> {
        let n = lines.len();
        let span = self.config.window_lines.max(1);
        let mut out = Vec::new();
        let mut start = 0;
        loop {
            let end = self.fit_end(lines, start, (start + span).min(n));
            out.push(start..end);
            if end >= n {
                break;
            }
            start = end - self.config.overlap_lines(end - start);
        }
        out
    }

    fn structural_ranges(&self, lines: &Lines<'_>, boundaries: &[usize]) -> Vec<Range<usize>> {
        let n = lines.len();
        let limit = self.config.window_lines.max(1);
        let max_chars = self.config.max_chunk_chars;

        let mut edges = Vec::with_capacity(boundaries.len() + 2);
        edges.push(0);
        edges.extend(boundaries.iter().copied().filter(|&b| b > 0 && b < n));
        edges.push(n);
        edges.dedup();

        // Non-overlapping cores covering 0..n.
        let mut cores: Vec<Range<usize>> = Vec::new();
        let mut pack: Option<Range<usize>> = None;
        for pair in edges.windows(2) {
            let segment = pair[0]..pair[1];
            if segment.len() > limit || lines.chars(&segment) > max_chars {
                cores.extend(pack.take());
                let block = (limit - self.config.overlap_lines(limit)).max(1);
                let mut start = segment.start;
                while start < segment.end {
                    let end = self.fit_end(lines, start, (start + block).min(segment.end));
                    cores.push(start..end);
                    start = end;
                }
                continue;
            }
            pack = match pack.take() {
                Some(current) => {
                    let merged = current.start..segment.end;
                    if merged.len() <= limit && lines.chars(&merged) <= max_chars {
                        Some(merged)
                    } else {
                        cores.push(current);
                        Some(segment)
                    }
                }
                None => Some(segment),
            };
        }
        cores.extend(pack);

        let mut out = Vec::with_capacity(cores.len());
        for (i, core) in cores.iter().enumerate() {
            if i == 0 {
                out.push(core.clone());
                continue;
            }
            let floor = (cores[i - 1].start + 1).min(core.start);
            let mut start = core
                .start
                .saturating_sub(self.config.overlap_lines(core.len()))
                .max(floor);
            while start < core.start && lines.chars(&(start..core.end)) > max_chars {
                start += 1;
            }
            out.push(start..core.end);
        }
        out
    }

    /// Shrink `start..end` until it fits the character cap, keeping at least one line.
    fn fit_end(&self, lines: &Lines<'_>, start: usize, mut end: usize) -> usize {
        while end > start + 1 && lines.chars(&(start..end)) > self.config.max_chunk_chars {
            end -= 1;
        }
        end
    }
}

/// Convenience wrapper around [`Chunker::chunk`].
pub fn chunk_file(config: &ChunkerConfig, record: &FileRecord, content: &str) -> Vec<Chunk> {
    Chunker::new(config.clone()).chunk(record, content)
}

/// Zero-based line indices where a definition begins, including attached
/// doc comments and attributes.
fn boundaries(lines: &Lines<'_>) -> Vec<usize> {
    let mut found = Vec::new();
    let mut last = 0;
    for (i, line) in lines.lines.iter().enumerate() {
        if !DEFINITION.is_match(line) {
            continue;
        }
        let mut start = i;
        while start > last && is_attached(lines.lines[start - 1]) {
            start -= 1;
        }
        if found.last() != Some(&start) {
            found.push(start);
        }
        last = i + 1;
    }
    found
}

fn is_attached(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with("///")
        || t.starts_with("//")
        || t.starts_with("#[")
        || t.starts_with('@')
        || t.starts_with("/*")
        || t.starts_with("*")
        || t.starts_with('#')
}
