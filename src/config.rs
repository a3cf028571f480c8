//! TOML configuration.
//!
//! Every section and field has a default, so an empty file (or no file at
//! all, via [`Config::default`]) is a valid configuration.
//!
//! ```toml
//! [walk]
//! exclude_globs = ["**/generated/**"]
//! max_file_bytes = 1048576
//!
//! [chunking]
//! strategy = "auto"        # auto | structural | window
//! window_lines = 30
//! overlap_fraction = 0.2
//!
//! [embedding]
//! provider = "ollama"      # disabled | openai | ollama
//! model = "nomic-embed-text"
//! dims = 768
//!
//! [retry]
//! max_attempts = 5
//!
//! [retrieval]
//! similarity_weight = 0.7
//! keyword_weight = 0.3
//!
//! [index]
//! state_dir = ".codeslice"
//!
//! [vector_store]
//! backend = "sqlite"       # memory | sqlite; file defaults to <state_dir>/vectors.db
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use codeslice_core::chunk::ChunkerConfig;
use codeslice_core::search::BoostConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub walk: WalkConfig,
    #[serde(default)]
    pub chunking: ChunkerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub retrieval: BoostConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct WalkConfig {
    /// Files must match at least one of these (relative-path globs).
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    /// Directory names never descended into, at any depth.
    #[serde(default = "default_ignore_dirs")]
    pub ignore_dirs: Vec<String>,
    /// File names always skipped (lock files and the like).
    #[serde(default = "default_skip_files")]
    pub skip_files: Vec<String>,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default = "default_true")]
    pub respect_gitignore: bool,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_hash_workers")]
    pub hash_workers: usize,
}

const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "js", "ts", "jsx", "tsx", "java", "cpp", "c", "h", "hpp", "cs", "php", "rb", "go",
    "rs", "swift", "kt", "scala", "clj", "hs", "ml", "elm", "dart", "r", "m", "mm", "sh",
    "bash", "zsh", "fish", "ps1", "bat", "cmd", "html", "htm", "xml", "css", "scss", "sass",
    "less", "astro", "vue", "svelte", "mjs", "cjs", "sql", "yaml", "yml", "json", "toml", "ini",
    "cfg", "md", "rst", "txt", "tex", "org",
];

fn default_include_globs() -> Vec<String> {
    SOURCE_EXTENSIONS
        .iter()
        .map(|ext| format!("**/*.{ext}"))
        .collect()
}

fn default_ignore_dirs() -> Vec<String> {
    [
        ".git",
        "node_modules",
        "__pycache__",
        "target",
        "build",
        "dist",
        ".venv",
        "venv",
        ".gradle",
        ".idea",
        ".vscode",
        ".vs",
        "bin",
        "obj",
        "logs",
        "tmp",
        "temp",
        "coverage",
        ".nyc_output",
        ".pytest_cache",
        "test-results",
        "dist-ssr",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_skip_files() -> Vec<String> {
    [
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "composer.lock",
        "Cargo.lock",
        "poetry.lock",
        "Pipfile.lock",
        "go.sum",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

fn default_hash_workers() -> usize {
    4
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            ignore_dirs: default_ignore_dirs(),
            skip_files: default_skip_files(),
            include_hidden: false,
            respect_gitignore: true,
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
            hash_workers: default_hash_workers(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL; defaults per provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Embedding batches in flight at once.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_provider() -> String {
    "disabled".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_max_concurrency() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

/// Exponential backoff for transient embedding failures.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts per batch, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1 = first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_backoff_ms as f64) as u64)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct IndexConfig {
    /// Where the manifest lives; relative paths resolve against the codebase root.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Tag separating this codebase's entries in a shared vector store.
    /// Derived from the canonical root path when unset.
    #[serde(default)]
    pub scope: Option<String>,
    /// Vector-store writes in flight at once.
    #[serde(default = "default_upsert_concurrency")]
    pub upsert_concurrency: usize,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".codeslice")
}

fn default_upsert_concurrency() -> usize {
    8
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            scope: None,
            upsert_concurrency: default_upsert_concurrency(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct VectorStoreConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    /// Database file for `sqlite`; defaults to `vectors.db` in the state dir.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "memory".to_string()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        // Chunking
        if self.chunking.window_lines == 0 {
            bail!("chunking.window_lines must be > 0");
        }
        if !(0.0..=0.9).contains(&self.chunking.overlap_fraction) {
            bail!("chunking.overlap_fraction must be in [0.0, 0.9]");
        }
        if self.chunking.max_chunk_chars == 0 {
            bail!("chunking.max_chunk_chars must be > 0");
        }

        // Embedding
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        if self.embedding.max_concurrency == 0 {
            bail!("embedding.max_concurrency must be > 0");
        }
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }

        // Retry
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be >= 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }

        // Retrieval
        let r = &self.retrieval;
        if r.similarity_weight < 0.0 || r.keyword_weight < 0.0 {
            bail!("retrieval weights must be >= 0");
        }
        if r.similarity_weight == 0.0 && r.keyword_weight == 0.0 {
            bail!("retrieval.similarity_weight and retrieval.keyword_weight cannot both be 0");
        }
        if r.keyword_saturation == 0 {
            bail!("retrieval.keyword_saturation must be > 0");
        }
        if r.candidate_multiplier == 0 {
            bail!("retrieval.candidate_multiplier must be > 0");
        }

        // Index + store
        if self.index.upsert_concurrency == 0 {
            bail!("index.upsert_concurrency must be > 0");
        }
        if self.walk.hash_workers == 0 {
            bail!("walk.hash_workers must be > 0");
        }
        match self.vector_store.backend.as_str() {
            "memory" | "sqlite" => {}
            other => bail!(
                "Unknown vector store backend: '{}'. Must be memory or sqlite.",
                other
            ),
        }

        Ok(())
    }
}

/// Read, parse and validate a configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    Config::from_toml_str(&content)
}
