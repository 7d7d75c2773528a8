//! Directory trees on disk: ignore rules, copying, and change detection.
//!
//! The same [`IgnoreRules`] value must drive both [`copy_tree`] and
//! [`compare_trees`], otherwise excluded paths would surface as changes.

use crate::config::{SandboxConfig, DEFAULT_LOG_FILE};
use crate::diff_engine::{DiffEngine, MAX_DIFF_LINES};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Prefix of copy-based session directories, created next to the original
pub const SESSION_SANDBOX_PREFIX: &str = ".sandbox_";
/// Prefix of snapshot sandboxes, created under the system temp dir
pub const SNAPSHOT_SANDBOX_PREFIX: &str = "plan_sandbox_";

pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    "__pycache__",
    "*.pyc",
    ".sandbox_*",
    "plan_sandbox_*",
    "node_modules",
    ".venv",
    "venv",
    "*.egg-info",
];

/// Name patterns excluded from copy and comparison.
///
/// A pattern is an exact name, `*suffix`, or `prefix*`. A path is ignored
/// when any of its components matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreRules {
    patterns: Vec<String>,
}

impl IgnoreRules {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    /// Configured patterns plus the audit log file itself
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.ignore_patterns.iter().cloned()).with_name(&config.log_file)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        if !self.patterns.iter().any(|p| p == name) {
            self.patterns.push(name.to_string());
        }
        self
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.patterns.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix('*') {
                name.ends_with(suffix)
            } else if let Some(prefix) = pattern.strip_suffix('*') {
                name.starts_with(prefix)
            } else {
                name == pattern
            }
        })
    }

    /// True if any component of a relative path is ignored
    pub fn is_ignored(&self, relative: &Path) -> bool {
        relative
            .components()
            .any(|c| self.matches_name(&c.as_os_str().to_string_lossy()))
    }

    fn admits(&self, entry: &DirEntry) -> bool {
        // Depth 0 is the root itself, whose name is irrelevant
        entry.depth() == 0 || !self.matches_name(&entry.file_name().to_string_lossy())
    }
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_PATTERNS.iter().copied()).with_name(DEFAULT_LOG_FILE)
    }
}

/// Kind of change between two trees
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

/// Best-effort textual diff of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "lines")]
pub enum DiffContent {
    /// Unified diff lines, bounded
    Text(Vec<String>),
    /// Content differs but at least one side is not UTF-8
    Binary,
    /// Content could not be read on one side
    Unreadable,
    /// Added or deleted files carry no diff
    NotApplicable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// Relative path with forward slashes
    pub path: String,
    pub kind: ChangeKind,
    pub content: DiffContent,
}

impl FileChange {
    pub fn added(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Added,
            content: DiffContent::NotApplicable,
        }
    }

    pub fn deleted(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Deleted,
            content: DiffContent::NotApplicable,
        }
    }

    pub fn modified(path: impl Into<String>, content: DiffContent) -> Self {
        Self {
            path: path.into(),
            kind: ChangeKind::Modified,
            content,
        }
    }
}

/// Non-ignored entries under `root`.
///
/// Symlinks are followed, so a linked file or directory shows up as its
/// content. Linked directories that resolve outside `root` are pruned, and
/// dangling or looping links are skipped.
fn walk<'a>(
    root: &'a Path,
    canonical_root: &'a Path,
    rules: &'a IgnoreRules,
) -> impl Iterator<Item = io::Result<DirEntry>> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(move |e| rules.admits(e) && link_stays_inside(e, canonical_root))
        .filter_map(|entry| match entry {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if is_unfollowable_link(&e) => {
                tracing::warn!(path = ?e.path(), "skipping dangling or looping symlink");
                None
            }
            Err(e) => Some(Err(io::Error::from(e))),
        })
}

fn link_stays_inside(entry: &DirEntry, canonical_root: &Path) -> bool {
    if entry.depth() == 0 || !entry.path_is_symlink() || !entry.file_type().is_dir() {
        return true;
    }
    let inside = fs::canonicalize(entry.path())
        .map(|target| target.starts_with(canonical_root))
        .unwrap_or(false);
    if !inside {
        tracing::warn!(path = %entry.path().display(), "skipping symlinked directory outside the tree");
    }
    inside
}

fn is_unfollowable_link(err: &walkdir::Error) -> bool {
    if err.loop_ancestor().is_some() {
        return true;
    }
    err.path()
        .map(|p| {
            let is_link = fs::symlink_metadata(p)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            is_link && fs::metadata(p).is_err()
        })
        .unwrap_or(false)
}

/// True when `path`, or its deepest existing ancestor, resolves inside `root`.
///
/// Writes through a symlink that leads out of the working directory fail
/// this check.
pub fn resolves_inside(root: &Path, path: &Path) -> bool {
    let Ok(root) = fs::canonicalize(root) else {
        return false;
    };
    let mut existing = path;
    loop {
        if fs::symlink_metadata(existing).is_ok() {
            return fs::canonicalize(existing)
                .map(|resolved| resolved.starts_with(&root))
                .unwrap_or(false);
        }
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return false,
        }
    }
}

/// Recursively copy `src` into `dst`, skipping ignored entries.
///
/// Symlinks are materialized: the copy holds the content they point at, so
/// nothing in `dst` leads back into `src` or elsewhere. Returns the number
/// of files copied. A failure leaves whatever was already copied in place.
pub fn copy_tree(src: &Path, dst: &Path, rules: &IgnoreRules) -> io::Result<usize> {
    if !src.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source directory does not exist: {}", src.display()),
        ));
    }
    fs::create_dir_all(dst)?;
    let canonical_src = fs::canonicalize(src)?;

    let mut copied = 0;
    for entry in walk(src, &canonical_src, rules) {
        let entry = entry?;
        if entry.depth() == 0 {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    Ok(copied)
}

/// Relative paths (forward slashes) of every non-ignored file, symlinked files included
pub fn scan_files(root: &Path, rules: &IgnoreRules) -> io::Result<BTreeSet<String>> {
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("directory does not exist: {}", root.display()),
        ));
    }
    let canonical_root = fs::canonicalize(root)?;

    let mut files = BTreeSet::new();
    for entry in walk(root, &canonical_root, rules).filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            files.insert(to_slash(relative));
        }
    }
    Ok(files)
}

/// Compare two trees. Changes are sorted by path.
pub fn compare_trees(
    original: &Path,
    sandbox: &Path,
    rules: &IgnoreRules,
) -> io::Result<Vec<FileChange>> {
    let original_files = scan_files(original, rules)?;
    let sandbox_files = scan_files(sandbox, rules)?;

    let mut changes: Vec<FileChange> = Vec::new();

    for path in sandbox_files.difference(&original_files) {
        changes.push(FileChange::added(path.as_str()));
    }
    for path in original_files.difference(&sandbox_files) {
        changes.push(FileChange::deleted(path.as_str()));
    }
    for path in original_files.intersection(&sandbox_files) {
        let left = original.join(from_slash(path));
        let right = sandbox.join(from_slash(path));
        if let Some(content) = compare_file(&left, &right, path) {
            changes.push(FileChange::modified(path.as_str(), content));
        }
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

/// `None` if identical, otherwise the best diff we can produce
fn compare_file(original: &Path, sandbox: &Path, label: &str) -> Option<DiffContent> {
    let (old, new) = match (fs::read(original), fs::read(sandbox)) {
        (Ok(old), Ok(new)) => (old, new),
        _ => {
            tracing::warn!(path = %label, "could not read file while comparing trees");
            return Some(DiffContent::Unreadable);
        }
    };

    if old.len() == new.len() && compute_hash(&old) == compute_hash(&new) {
        return None;
    }

    match (std::str::from_utf8(&old), std::str::from_utf8(&new)) {
        (Ok(old), Ok(new)) => Some(DiffContent::Text(DiffEngine::unified_lines(
            old,
            new,
            &format!("original/{}", label),
            &format!("sandbox/{}", label),
            MAX_DIFF_LINES,
        ))),
        _ => Some(DiffContent::Binary),
    }
}

pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Leftover copy-based sandboxes in `parent`, e.g. from crashed processes
pub fn find_orphaned_sandboxes(parent: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in fs::read_dir(parent)? {
        let entry = entry?;
        let is_sandbox = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(SESSION_SANDBOX_PREFIX))
            .unwrap_or(false);
        if is_sandbox && entry.file_type()?.is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

pub fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn from_slash(path: &str) -> PathBuf {
    path.split('/').collect()
}
