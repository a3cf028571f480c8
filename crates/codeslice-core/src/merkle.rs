//! Merkle snapshots over a codebase's file set.
//!
//! A [`Snapshot`] pairs a flat `path → FileRecord` map with a hash tree that
//! mirrors the directory hierarchy. A file leaf's hash is the file's content
//! hash; a directory's hash covers its children's names, kinds and hashes in
//! sorted order. Renaming, adding, removing or editing any file therefore
//! changes every hash on the path up to the root, and nothing else.
//!
//! [`diff`] walks two trees top-down and never descends into a subtree whose
//! hash is unchanged, so its cost follows the changed subtrees rather than
//! the total file count.
//!
//! # Example
//!
//! ```rust
//! use chrono::Utc;
//! use codeslice_core::merkle::{diff, Snapshot};
//! use codeslice_core::models::{ContentHash, FileRecord};
//!
//! let rec = |path: &str, body: &[u8]| FileRecord {
//!     path: path.to_string(),
//!     hash: ContentHash::of(body),
//!     size: body.len() as u64,
//!     modified: Utc::now(),
//! };
//!
//! let old = Snapshot::build(vec![rec("src/a.rs", b"a"), rec("src/b.rs", b"b")]);
//! let new = Snapshot::build(vec![rec("src/a.rs", b"a2"), rec("src/b.rs", b"b")]);
//!
//! let changes = diff(&old, &new);
//! assert!(changes.modified.contains("src/a.rs"));
//! assert!(changes.added.is_empty() && changes.removed.is_empty());
//! ```

use std::collections::{BTreeMap, BTreeSet};

use sha2::{Digest, Sha256};

use crate::models::{ContentHash, FileRecord};

const DIR_DOMAIN: &[u8] = b"codeslice-dir\0";

/// A node in the snapshot's hash tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MerkleNode {
    File {
        hash: ContentHash,
    },
    Dir {
        hash: ContentHash,
        children: BTreeMap<String, MerkleNode>,
    },
}

impl MerkleNode {
    pub fn hash(&self) -> &ContentHash {
        match self {
            MerkleNode::File { hash } | MerkleNode::Dir { hash, .. } => hash,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, MerkleNode::Dir { .. })
    }

    fn kind_tag(&self) -> u8 {
        if self.is_dir() {
            b'd'
        } else {
            b'f'
        }
    }

    fn dir(children: BTreeMap<String, MerkleNode>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DIR_DOMAIN);
        for (name, child) in &children {
            hasher.update(name.as_bytes());
            hasher.update([0u8, child.kind_tag()]);
            hasher.update(child.hash().as_bytes());
        }
        MerkleNode::Dir {
            hash: ContentHash::from_bytes(hasher.finalize().into()),
            children,
        }
    }
}

/// Intermediate directory used while building bottom-up.
#[derive(Default)]
struct DirBuilder {
    files: BTreeMap<String, ContentHash>,
    dirs: BTreeMap<String, DirBuilder>,
}

impl DirBuilder {
    fn insert(&mut self, components: &[&str], hash: ContentHash) {
        match components {
            [] => {}
            [name] => {
                self.files.insert((*name).to_string(), hash);
            }
            [dir, rest @ ..] => self
                .dirs
                .entry((*dir).to_string())
                .or_default()
                .insert(rest, hash),
        }
    }

    fn finish(self) -> MerkleNode {
        let mut children: BTreeMap<String, MerkleNode> = self
            .files
            .into_iter()
            .map(|(name, hash)| (name, MerkleNode::File { hash }))
            .collect();
        // A name cannot be both a file and a directory on disk; the directory wins.
        for (name, sub) in self.dirs {
            children.insert(name, sub.finish());
        }
        MerkleNode::dir(children)
    }
}

/// The file set of a codebase captured at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    root: MerkleNode,
    files: BTreeMap<String, FileRecord>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Build a snapshot from file records.
    ///
    /// Records are keyed by path first, so the result is independent of the
    /// order in which the records arrive. A later record for the same path
    /// replaces an earlier one.
    pub fn build<I>(records: I) -> Self
    where
        I: IntoIterator<Item = FileRecord>,
    {
        let files: BTreeMap<String, FileRecord> = records
            .into_iter()
            .map(|r| (r.path.clone(), r))
            .collect();

        let mut builder = DirBuilder::default();
        for (path, record) in &files {
            let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
            builder.insert(&components, record.hash);
        }

        Self {
            root: builder.finish(),
            files,
        }
    }

    pub fn root(&self) -> &MerkleNode {
        &self.root
    }

    pub fn root_hash(&self) -> &ContentHash {
        self.root.hash()
    }

    pub fn files(&self) -> &BTreeMap<String, FileRecord> {
        &self.files
    }

    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records in lexicographic path order.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub added: BTreeSet<String>,
    pub modified: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Work counters collected by [`diff_with_stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    /// Node pairs whose hashes were compared.
    pub comparisons: usize,
    /// Compared pairs that matched and were not descended into.
    pub subtrees_skipped: usize,
}

/// Diff two snapshots.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Changeset {
    diff_with_stats(old, new).0
}

/// Diff two snapshots, also reporting how much of the trees was inspected.
pub fn diff_with_stats(old: &Snapshot, new: &Snapshot) -> (Changeset, DiffStats) {
    let mut changes = Changeset::default();
    let mut stats = DiffStats::default();
    diff_nodes("", &old.root, &new.root, &mut changes, &mut stats);
    (changes, stats)
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn diff_nodes(
    path: &str,
    old: &MerkleNode,
    new: &MerkleNode,
    changes: &mut Changeset,
    stats: &mut DiffStats,
) {
    stats.comparisons += 1;
    if old.is_dir() == new.is_dir() && old.hash() == new.hash() {
        stats.subtrees_skipped += 1;
        return;
    }

    match (old, new) {
        (MerkleNode::File { .. }, MerkleNode::File { .. }) => {
            changes.modified.insert(path.to_string());
        }
        (
            MerkleNode::Dir {
                children: old_children,
                ..
            },
            MerkleNode::Dir {
                children: new_children,
                ..
            },
        ) => {
            let names: BTreeSet<&String> = old_children.keys().chain(new_children.keys()).collect();
            for name in names {
                let child_path = join(path, name);
                match (old_children.get(name), new_children.get(name)) {
                    (Some(o), Some(n)) => diff_nodes(&child_path, o, n, changes, stats),
                    (Some(o), None) => collect_files(&child_path, o, &mut changes.removed),
                    (None, Some(n)) => collect_files(&child_path, n, &mut changes.added),
                    (None, None) => {}
                }
            }
        }
        // A file replaced by a directory of the same name, or the reverse.
        (o, n) => {
            collect_files(path, o, &mut changes.removed);
            collect_files(path, n, &mut changes.added);
        }
    }
}

fn collect_files(path: &str, node: &MerkleNode, out: &mut BTreeSet<String>) {
    match node {
        MerkleNode::File { .. } => {
            out.insert(path.to_string());
        }
        MerkleNode::Dir { children, .. } => {
            for (name, child) in children {
                collect_files(&join(path, name), child, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn rec(path: &str, body: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            hash: ContentHash::of(body.as_bytes()),
            size: body.len() as u64,
            modified: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    fn nested_tree(changed: Option<&str>) -> Snapshot {
        let mut records = Vec::new();
        for d in 0..10 {
            for s in 0..10 {
                for f in 0..10 {
                    let path = format!("d{d}/s{s}/f{f}.rs");
                    let body = if Some(path.as_str()) == changed {
                        "changed".to_string()
                    } else {
                        format!("body of {path}")
                    };
                    records.push(rec(&path, &body));
                }
            }
        }
        Snapshot::build(records)
    }

    #[test]
    fn test_build_is_order_independent() {
        let a = vec![rec("b.rs", "b"), rec("a/x.rs", "x"), rec("a/y.rs", "y")];
        let mut b = a.clone();
        b.reverse();
        assert_eq!(Snapshot::build(a).root_hash(), Snapshot::build(b).root_hash());
    }

    #[test]
    fn test_empty_snapshot() {
        let s = Snapshot::empty();
        assert!(s.is_empty());
        assert_eq!(s.root_hash(), Snapshot::build(Vec::new()).root_hash());
        assert!(diff(&s, &Snapshot::empty()).is_empty());
    }

    #[test]
    fn test_diff_of_identical_snapshots_is_empty() {
        let s = nested_tree(None);
        let (changes, stats) = diff_with_stats(&s, &s.clone());
        assert!(changes.is_empty());
        assert_eq!(stats.comparisons, 1);
        assert_eq!(stats.subtrees_skipped, 1);
    }

    #[test]
    fn test_root_hash_changes_on_content_path_and_existence() {
        let base = Snapshot::build(vec![rec("a.rs", "a"), rec("b.rs", "b")]);
        let edited = Snapshot::build(vec![rec("a.rs", "a!"), rec("b.rs", "b")]);
        let renamed = Snapshot::build(vec![rec("c.rs", "a"), rec("b.rs", "b")]);
        let removed = Snapshot::build(vec![rec("b.rs", "b")]);
        let moved = Snapshot::build(vec![rec("x/a.rs", "a"), rec("b.rs", "b")]);
        for other in [&edited, &renamed, &removed, &moved] {
            assert_ne!(base.root_hash(), other.root_hash());
        }
        // mtime alone is not content
        let mut touched = rec("a.rs", "a");
        touched.modified = Utc.timestamp_opt(1_800_000_000, 0).unwrap();
        let touched = Snapshot::build(vec![touched, rec("b.rs", "b")]);
        assert_eq!(base.root_hash(), touched.root_hash());
    }

    #[test]
    fn test_diff_classifies_changes() {
        let old = Snapshot::build(vec![
            rec("keep.rs", "k"),
            rec("edit.rs", "1"),
            rec("gone/x.rs", "x"),
            rec("gone/y.rs", "y"),
        ]);
        let new = Snapshot::build(vec![
            rec("keep.rs", "k"),
            rec("edit.rs", "2"),
            rec("fresh/z.rs", "z"),
        ]);
        let changes = diff(&old, &new);
        assert_eq!(changes.modified, BTreeSet::from(["edit.rs".to_string()]));
        assert_eq!(changes.added, BTreeSet::from(["fresh/z.rs".to_string()]));
        assert_eq!(
            changes.removed,
            BTreeSet::from(["gone/x.rs".to_string(), "gone/y.rs".to_string()])
        );
    }

    #[test]
    fn test_diff_file_replaced_by_directory() {
        let old = Snapshot::build(vec![rec("lib", "file")]);
        let new = Snapshot::build(vec![rec("lib/mod.rs", "dir")]);
        let changes = diff(&old, &new);
        assert_eq!(changes.removed, BTreeSet::from(["lib".to_string()]));
        assert_eq!(changes.added, BTreeSet::from(["lib/mod.rs".to_string()]));
    }

    #[test]
    fn test_diff_locality_single_change() {
        let old = nested_tree(None);
        let new = nested_tree(Some("d3/s7/f2.rs"));
        let (changes, stats) = diff_with_stats(&old, &new);
        assert_eq!(changes.modified, BTreeSet::from(["d3/s7/f2.rs".to_string()]));
        assert!(changes.added.is_empty() && changes.removed.is_empty());
        // root + 10 top dirs + 10 subdirs + 10 files, out of 1000 files
        assert_eq!(stats.comparisons, 31);
        assert!(stats.comparisons < old.len() / 10);
    }
}
