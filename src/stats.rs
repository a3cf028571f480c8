//! Index status overview.
//!
//! Summarizes what a codebase's committed index holds: generation, file and
//! chunk counts, outstanding orphaned vectors and the embedding model it was
//! built with. Computed from the committed manifest alone, so it is cheap
//! and never waits for a running sync.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::context::{CodebaseContext, SyncPhase};
use crate::manifest::IndexManifest;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub root: PathBuf,
    pub scope: String,
    pub generation: u64,
    pub root_hash: String,
    pub files: usize,
    pub indexed_files: usize,
    pub chunks: usize,
    pub orphans: usize,
    pub embedding_model: String,
    pub chunker: String,
    pub last_sync: Option<DateTime<Utc>>,
    pub phase: SyncPhase,
}

impl IndexStatus {
    pub fn from_context(ctx: &CodebaseContext) -> Self {
        let mut status = Self::from_manifest(&ctx.committed());
        status.root = ctx.root().to_path_buf();
        status.scope = ctx.scope().to_string();
        status.phase = ctx.phase();
        status
    }

    pub fn from_manifest(manifest: &IndexManifest) -> Self {
        Self {
            root: manifest.root.clone(),
            scope: manifest.scope.clone(),
            generation: manifest.generation,
            root_hash: manifest.snapshot.root_hash().to_hex(),
            files: manifest.snapshot.len(),
            indexed_files: manifest.file_count(),
            chunks: manifest.chunk_count(),
            orphans: manifest.orphans.len(),
            embedding_model: manifest.embedding_model.clone(),
            chunker: manifest.chunker.clone(),
            last_sync: manifest.updated_at,
            phase: SyncPhase::Idle,
        }
    }

    pub fn is_indexed(&self) -> bool {
        self.generation > 0
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last_sync = match self.last_sync {
            Some(ts) => format_ts_relative(ts),
            None => "never".to_string(),
        };
        writeln!(f, "  Root:        {}", self.root.display())?;
        writeln!(f, "  Scope:       {}", self.scope)?;
        writeln!(f, "  Generation:  {}", self.generation)?;
        writeln!(f, "  Root hash:   {}", &self.root_hash[..12.min(self.root_hash.len())])?;
        writeln!(
            f,
            "  Files:       {} ({} with chunks)",
            self.files, self.indexed_files
        )?;
        writeln!(f, "  Chunks:      {}", self.chunks)?;
        if self.orphans > 0 {
            writeln!(f, "  Orphans:     {} (deleted on next sync)", self.orphans)?;
        }
        writeln!(
            f,
            "  Model:       {}",
            if self.embedding_model.is_empty() {
                "-"
            } else {
                &self.embedding_model
            }
        )?;
        write!(f, "  Last sync:   {}", last_sync)
    }
}

/// Format a timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: DateTime<Utc>) -> String {
    let delta = (Utc::now() - ts).num_seconds();

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_status_of_fresh_context() {
        let tmp = TempDir::new().unwrap();
        let ctx = CodebaseContext::open(tmp.path(), Config::default()).unwrap();
        let status = IndexStatus::from_context(&ctx);
        assert!(!status.is_indexed());
        assert_eq!(status.chunks, 0);
        assert_eq!(status.scope, ctx.scope());
        assert!(status.to_string().contains("Last sync:   never"));
    }

    #[test]
    fn test_relative_timestamps() {
        let now = Utc::now();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - Duration::minutes(5)), "5 mins ago");
        assert_eq!(format_ts_relative(now - Duration::hours(1)), "1 hour ago");
        assert_eq!(format_ts_relative(now - Duration::days(3)), "3 days ago");
        let old = now - Duration::days(90);
        assert_eq!(format_ts_relative(old), format_ts_iso(old));
    }
}
