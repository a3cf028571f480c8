//! Codebase file enumeration and hashing.
//!
//! [`FileWalker`] discovers indexable files under a codebase root and hashes
//! their raw bytes with SHA-256. Ignore rules are checked before a directory
//! is descended into, so ignored subtrees are never read.
//!
//! # Rules
//!
//! | Rule | Applies to | Effect |
//! |------|-----------|--------|
//! | `ignore_dirs` | directory names at any depth | not descended |
//! | hidden (`.name`) | files and directories | skipped unless `include_hidden` or allow-listed |
//! | `exclude_globs` | relative paths | skipped |
//! | root `.gitignore` | relative paths and names | skipped when `respect_gitignore` |
//! | `skip_files` | file names | skipped |
//! | `include_globs` | relative paths | files must match one |
//! | `max_file_bytes` | file size | recorded as excluded |
//! | binary content | NUL in the first 8 KiB, or not UTF-8 | recorded as excluded |
//!
//! Unreadable files become warnings and the walk continues. A symlink that
//! leads back to one of its own ancestors is reported as a
//! [`IndexError::SymlinkCycle`] warning and not followed.
//!
//! # Ordering
//!
//! Siblings are visited with directories sorted as if their names ended in
//! `/`, which makes the depth-first order identical to plain lexicographic
//! order of the full relative paths.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use codeslice_core::models::{ContentHash, FileRecord};
use crossbeam_channel as channel;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::WalkConfig;
use crate::error::{IndexError, Result};

/// Hidden files indexed even when hidden files are skipped.
const ALLOWED_HIDDEN: &[&str] = &[".gitignore", ".env.example", ".editorconfig", ".nvmrc"];

/// Bytes inspected for NUL when sniffing binary files.
const BINARY_SNIFF_BYTES: usize = 8 * 1024;

/// Why a file that passed the ignore rules was left out of the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum ExclusionReason {
    TooLarge { size: u64, limit: u64 },
    Binary,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExcludedFile {
    pub path: String,
    #[serde(flatten)]
    pub reason: ExclusionReason,
}

/// A per-file problem that did not stop the walk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalkWarning {
    pub path: String,
    pub message: String,
}

impl WalkWarning {
    pub(crate) fn from_error(path: impl Into<String>, err: &IndexError) -> Self {
        Self {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// One item produced by [`FileWalker::walk`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEvent {
    Record(FileRecord),
    Excluded(ExcludedFile),
    Warning(WalkWarning),
}

/// Everything one complete walk found.
#[derive(Debug, Clone, Default)]
pub struct WalkOutcome {
    /// Hashed files in lexicographic path order.
    pub records: Vec<FileRecord>,
    pub excluded: Vec<ExcludedFile>,
    pub warnings: Vec<WalkWarning>,
}

/// A file that passed the ignore rules and has not been read yet.
#[derive(Debug, Clone)]
struct FileCandidate {
    rel: String,
    abs: PathBuf,
    size: u64,
    modified: DateTime<Utc>,
}

/// Patterns from the root `.gitignore`.
struct GitIgnore {
    /// `name/` patterns, matched against directory names.
    dir_only: GlobSet,
    /// Patterns containing a `/`, matched against the relative path.
    anchored: GlobSet,
    /// Bare patterns, matched against the relative path or the name.
    floating: GlobSet,
}

impl Default for GitIgnore {
    fn default() -> Self {
        Self {
            dir_only: GlobSet::empty(),
            anchored: GlobSet::empty(),
            floating: GlobSet::empty(),
        }
    }
}

impl GitIgnore {
    fn load(root: &Path) -> Result<Self> {
        let path = root.join(".gitignore");
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Cannot read .gitignore; ignoring it");
                return Ok(Self::default());
            }
        };

        let mut dir_only = Vec::new();
        let mut anchored = Vec::new();
        let mut floating = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            // Negation is not supported; such lines are dropped.
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            if let Some(dir) = line.strip_suffix('/') {
                dir_only.push(dir.trim_start_matches('/').to_string());
            } else if line.contains('/') {
                anchored.push(line.trim_start_matches('/').to_string());
            } else {
                floating.push(line.to_string());
            }
        }

        Ok(Self {
            dir_only: build_globset(&dir_only)?,
            anchored: build_globset(&anchored)?,
            floating: build_globset(&floating)?,
        })
    }

    fn is_ignored(&self, rel: &str, name: &str, is_dir: bool) -> bool {
        (is_dir && self.dir_only.is_match(name))
            || self.anchored.is_match(rel)
            || self.floating.is_match(rel)
            || self.floating.is_match(name)
    }
}

/// Enumerates and hashes the indexable files of one codebase.
pub struct FileWalker {
    root: PathBuf,
    config: WalkConfig,
    include: GlobSet,
    exclude: GlobSet,
    gitignore: GitIgnore,
    excluded_dirs: Vec<PathBuf>,
}

impl FileWalker {
    /// Prepare a walker for `root`.
    ///
    /// # Errors
    ///
    /// [`IndexError::Io`] when the root cannot be resolved or is not a
    /// directory, [`IndexError::Config`] for an invalid glob.
    pub fn new(root: &Path, config: &WalkConfig) -> Result<Self> {
        let root = root
            .canonicalize()
            .map_err(|e| IndexError::io(root, e))?;
        if !root.is_dir() {
            return Err(IndexError::io(
                &root,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }

        let gitignore = if config.respect_gitignore {
            GitIgnore::load(&root)?
        } else {
            GitIgnore::default()
        };

        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            gitignore,
            excluded_dirs: Vec::new(),
            config: config.clone(),
            root,
        })
    }

    /// Never descend into `dir` (used for the index's own state directory).
    pub fn exclude_dir(mut self, dir: &Path) -> Self {
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        self.excluded_dirs.push(dir);
        self
    }

    /// Canonical codebase root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start a lazy walk that hashes files one at a time on the calling thread.
    ///
    /// Each call starts over from the root.
    pub fn walk(&self) -> impl Iterator<Item = WalkEvent> + '_ {
        self.discover().map(move |found| match found {
            Ok(candidate) => self.inspect(candidate),
            Err(warning) => WalkEvent::Warning(warning),
        })
    }

    /// Walk the whole tree, hashing on `hash_workers` threads.
    ///
    /// Discovery stays on the calling thread; results are merged by path, so
    /// the outcome does not depend on which worker finished first.
    pub fn scan(&self) -> WalkOutcome {
        let workers = self.config.hash_workers.max(1);
        let (job_tx, job_rx) = channel::bounded::<FileCandidate>(workers * 64);
        let (event_tx, event_rx) = channel::unbounded::<WalkEvent>();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let event_tx = event_tx.clone();
                scope.spawn(move || {
                    for candidate in job_rx {
                        if event_tx.send(self.inspect(candidate)).is_err() {
                            break;
                        }
                    }
                });
            }

            for found in self.discover() {
                match found {
                    Ok(candidate) => {
                        if job_tx.send(candidate).is_err() {
                            break;
                        }
                    }
                    Err(warning) => {
                        let _ = event_tx.send(WalkEvent::Warning(warning));
                    }
                }
            }
            drop(job_tx);
        });
        drop(event_tx);

        let mut records = BTreeMap::new();
        let mut outcome = WalkOutcome::default();
        for event in event_rx.iter() {
            match event {
                WalkEvent::Record(r) => {
                    records.insert(r.path.clone(), r);
                }
                WalkEvent::Excluded(x) => outcome.excluded.push(x),
                WalkEvent::Warning(w) => outcome.warnings.push(w),
            }
        }
        outcome.records = records.into_values().collect();
        outcome.excluded.sort_by(|a, b| a.path.cmp(&b.path));
        outcome.warnings.sort_by(|a, b| a.path.cmp(&b.path));
        outcome
    }

    /// Read a file for chunking: returns its text and the hash of its bytes.
    pub fn read_text(&self, rel: &str) -> Result<(String, ContentHash)> {
        let path = self.root.join(rel);
        let bytes = std::fs::read(&path).map_err(|e| IndexError::io(&path, e))?;
        let hash = ContentHash::of(&bytes);
        let text = String::from_utf8(bytes).map_err(|e| {
            IndexError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.utf8_error()),
            )
        })?;
        Ok((text, hash))
    }

    fn discover(
        &self,
    ) -> impl Iterator<Item = std::result::Result<FileCandidate, WalkWarning>> + '_ {
        WalkDir::new(&self.root)
            .follow_links(self.config.follow_symlinks)
            .sort_by(|a, b| sort_key(a).cmp(&sort_key(b)))
            .into_iter()
            .filter_entry(move |entry| self.should_descend(entry))
            .filter_map(move |entry| match entry {
                Ok(entry) => self.candidate(&entry),
                Err(err) => Some(Err(self.walk_warning(err))),
            })
    }

    fn rel_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Directory filter applied before descending. Non-directories pass.
    fn should_descend(&self, entry: &DirEntry) -> bool {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        let name = entry.file_name().to_string_lossy();
        if self.config.ignore_dirs.iter().any(|d| d.as_str() == &*name) {
            return false;
        }
        if name.starts_with('.') && !self.config.include_hidden {
            return false;
        }
        if self.excluded_dirs.iter().any(|d| d == entry.path()) {
            return false;
        }
        let rel = self.rel_path(entry.path());
        if self.exclude.is_match(&rel) || self.gitignore.is_ignored(&rel, &name, true) {
            debug!(dir = %rel, "Skipping ignored directory");
            return false;
        }
        true
    }

    fn candidate(
        &self,
        entry: &DirEntry,
    ) -> Option<std::result::Result<FileCandidate, WalkWarning>> {
        if !entry.file_type().is_file() {
            return None;
        }
        let name = entry.file_name().to_string_lossy();
        let rel = self.rel_path(entry.path());

        if self.config.skip_files.iter().any(|f| f.as_str() == &*name) {
            return None;
        }
        if name.starts_with('.')
            && !self.config.include_hidden
            && !ALLOWED_HIDDEN.contains(&&*name)
        {
            return None;
        }
        if !self.include.is_match(&rel)
            || self.exclude.is_match(&rel)
            || self.gitignore.is_ignored(&rel, &name, false)
        {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => return Some(Err(self.walk_warning(err))),
        };
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        Some(Ok(FileCandidate {
            rel,
            abs: entry.path().to_path_buf(),
            size: metadata.len(),
            modified,
        }))
    }

    /// Size check, read, binary sniff and hash.
    fn inspect(&self, candidate: FileCandidate) -> WalkEvent {
        let limit = self.config.max_file_bytes;
        if candidate.size > limit {
            debug!(file = %candidate.rel, size = candidate.size, "Excluding oversized file");
            return WalkEvent::Excluded(ExcludedFile {
                path: candidate.rel,
                reason: ExclusionReason::TooLarge {
                    size: candidate.size,
                    limit,
                },
            });
        }

        let bytes = match std::fs::read(&candidate.abs) {
            Ok(b) => b,
            Err(e) => {
                let err = IndexError::io(&candidate.abs, e);
                warn!(file = %candidate.rel, error = %err, "Skipping unreadable file");
                return WalkEvent::Warning(WalkWarning::from_error(candidate.rel, &err));
            }
        };

        if is_binary(&bytes) {
            debug!(file = %candidate.rel, "Excluding binary file");
            return WalkEvent::Excluded(ExcludedFile {
                path: candidate.rel,
                reason: ExclusionReason::Binary,
            });
        }

        WalkEvent::Record(FileRecord {
            path: candidate.rel,
            hash: ContentHash::of(&bytes),
            size: bytes.len() as u64,
            modified: candidate.modified,
        })
    }

    fn walk_warning(&self, err: walkdir::Error) -> WalkWarning {
        let path = err.path().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        let rel = self.rel_path(&path);
        let err = if err.loop_ancestor().is_some() {
            IndexError::SymlinkCycle { path }
        } else {
            let source = err
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("walk error"));
            IndexError::io(path, source)
        };
        warn!(path = %rel, error = %err, "Walk problem; continuing");
        WalkWarning::from_error(rel, &err)
    }
}

/// Directory names compare as if suffixed with `/`.
fn sort_key(entry: &DirEntry) -> String {
    let mut key = entry.file_name().to_string_lossy().into_owned();
    if entry.file_type().is_dir() {
        key.push('/');
    }
    key
}

fn is_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_BYTES)];
    memchr::memchr(0, head).is_some() || std::str::from_utf8(bytes).is_err()
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| IndexError::Config(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| IndexError::Config(format!("invalid glob set: {e}")))
}
