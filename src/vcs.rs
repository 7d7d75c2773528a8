//! Git adapter used for snapshots, diffs and rollback.
//!
//! Every call shells out to the `git` binary under a bounded timeout. A
//! missing binary or a hung call becomes [`VcsError::Unavailable`] so callers
//! can carry on without version control.

use crate::diff_engine::{DiffEngine, MAX_DIFF_LINES};
use crate::error::{SandboxError, SandboxResult};
use crate::process::{run_process, ProcessSpec};
use crate::tree::{copy_tree, DiffContent, FileChange, IgnoreRules, SNAPSHOT_SANDBOX_PREFIX};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const GIT_TIMEOUT: Duration = Duration::from_secs(30);
const GIT_OUTPUT_CAP: usize = 16 * 1024 * 1024;

/// Applied to every invocation so commits work without a configured identity
const GIT_CONFIG: &[&str] = &[
    "-c",
    "core.quotepath=false",
    "-c",
    "user.name=plan-sandbox",
    "-c",
    "user.email=plan-sandbox@localhost",
    "-c",
    "commit.gpgsign=false",
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcsError {
    #[error("version control unavailable: {0}")]
    Unavailable(String),

    #[error("not a git repository: {}", .0.display())]
    NotARepository(PathBuf),

    #[error("git {command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

pub type VcsResult<T> = Result<T, VcsError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: Option<String>,
    pub head: Option<String>,
    pub is_clean: bool,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub hash: String,
    pub short_hash: String,
    pub date: String,
    pub message: String,
}

/// Changes between a commit and the working tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VcsDiff {
    pub files: Vec<FileChange>,
    pub insertions: usize,
    pub deletions: usize,
    pub raw: String,
}

impl VcsDiff {
    pub fn has_changes(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn changed_paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }
}

/// A disposable git-tracked copy and the commit it started from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCopy {
    pub path: PathBuf,
    pub baseline: String,
}

struct GitOutput {
    code: i32,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone)]
pub struct GitAdapter {
    work_dir: PathBuf,
    program: String,
    available: bool,
}

impl GitAdapter {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self::with_program(work_dir, "git")
    }

    /// Use a specific git executable; availability is probed once here
    pub fn with_program(work_dir: impl Into<PathBuf>, program: &str) -> Self {
        let work_dir = work_dir.into();
        let probe = vec![program.to_string(), "--version".to_string()];
        let outcome = run_process(&ProcessSpec {
            argv: &probe,
            cwd: Path::new("."),
            timeout: PROBE_TIMEOUT,
            max_output_bytes: 1024,
        });
        let available = outcome.success();
        if !available {
            warn!(program, "git is not available; snapshots are disabled");
        }
        Self {
            work_dir,
            program: program.to_string(),
            available,
        }
    }

    /// Same binary and availability, different directory
    pub fn at(&self, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            program: self.program.clone(),
            available: self.available,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    fn run(&self, args: &[&str]) -> VcsResult<GitOutput> {
        if !self.available {
            return Err(VcsError::Unavailable(format!("'{}' not found", self.program)));
        }

        let mut argv = vec![self.program.clone()];
        argv.extend(GIT_CONFIG.iter().map(|s| s.to_string()));
        argv.extend(args.iter().map(|s| s.to_string()));

        let outcome = run_process(&ProcessSpec {
            argv: &argv,
            cwd: &self.work_dir,
            timeout: GIT_TIMEOUT,
            max_output_bytes: GIT_OUTPUT_CAP,
        });

        if let Some(failure) = outcome.failure {
            warn!(args = ?args, kind = failure.kind.as_str(), "git call failed: {}", failure.message);
            return Err(VcsError::Unavailable(failure.message));
        }

        Ok(GitOutput {
            code: outcome.exit_code,
            stdout: outcome.stdout.trim_end().to_string(),
            stderr: outcome.stderr.trim().to_string(),
        })
    }

    fn run_ok(&self, args: &[&str]) -> VcsResult<String> {
        let output = self.run(args)?;
        if output.code != 0 {
            return Err(VcsError::Command {
                command: args.join(" "),
                stderr: output.stderr,
            });
        }
        Ok(output.stdout)
    }

    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--git-dir"])
            .map(|o| o.code == 0)
            .unwrap_or(false)
    }

    fn require_repo(&self) -> VcsResult<()> {
        if !self.available {
            return Err(VcsError::Unavailable(format!("'{}' not found", self.program)));
        }
        if !self.is_repo() {
            return Err(VcsError::NotARepository(self.work_dir.clone()));
        }
        Ok(())
    }

    /// `git init` plus a baseline commit of whatever is present. Returns the baseline.
    pub fn init_repo(&self) -> VcsResult<String> {
        self.run_ok(&["init", "--quiet"])?;
        self.run_ok(&["add", "-A"])?;
        self.run_ok(&["commit", "--quiet", "--allow-empty", "-m", "Initial sandbox state"])?;
        self.current_commit()
    }

    pub fn current_commit(&self) -> VcsResult<String> {
        self.run_ok(&["rev-parse", "HEAD"])
    }

    pub fn status(&self) -> VcsResult<GitStatus> {
        self.require_repo()?;

        let branch = self.run_ok(&["rev-parse", "--abbrev-ref", "HEAD"]).ok();
        let head = self.current_commit().ok();
        let modified = split_lines(&self.run_ok(&["diff", "--name-only"])?);
        let untracked = split_lines(&self.run_ok(&["ls-files", "--others", "--exclude-standard"])?);
        let porcelain = self.run_ok(&["status", "--porcelain"])?;

        Ok(GitStatus {
            branch,
            head,
            is_clean: porcelain.trim().is_empty(),
            modified,
            untracked,
        })
    }

    /// Stage everything and commit. A clean tree returns the current head unchanged.
    pub fn create_snapshot(&self, message: &str) -> VcsResult<String> {
        self.require_repo()?;

        self.run_ok(&["add", "-A"])?;
        let porcelain = self.run_ok(&["status", "--porcelain"])?;
        if porcelain.trim().is_empty() {
            return self.current_commit();
        }

        let stamped = format!(
            "{} [{}]",
            message,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
        );
        self.run_ok(&["commit", "--quiet", "-m", &stamped])?;
        let commit = self.current_commit()?;
        debug!(commit = %commit, "snapshot created");
        Ok(commit)
    }

    /// Diff from a commit (or the index, if `None`) to the working tree
    pub fn get_diff(&self, from_commit: Option<&str>) -> VcsResult<VcsDiff> {
        let raw = self.run_ok(&diff_args(&[], from_commit))?;
        let numstat = self.run_ok(&diff_args(&["--numstat"], from_commit))?;
        let name_status = self.run_ok(&diff_args(&["--name-status", "-z"], from_commit))?;

        let (insertions, deletions) = parse_numstat(&numstat);
        let sections = split_patch(&raw);

        let files = parse_name_status(&name_status)
            .into_iter()
            .map(|(status, path)| {
                match status {
                    'A' => FileChange::added(path),
                    'D' => FileChange::deleted(path),
                    _ => {
                        let content = match sections.get(&path) {
                            Some(section) if section.iter().any(|l| l.starts_with("Binary files ")) => {
                                DiffContent::Binary
                            }
                            Some(section) => {
                                DiffContent::Text(DiffEngine::bounded_lines(&section.join("\n"), MAX_DIFF_LINES))
                            }
                            None => DiffContent::Unreadable,
                        };
                        FileChange::modified(path, content)
                    }
                }
            })
            .collect();

        Ok(VcsDiff {
            files,
            insertions,
            deletions,
            raw,
        })
    }

    /// Hard reset. Everything after `to_commit` is lost.
    pub fn rollback(&self, to_commit: &str) -> VcsResult<()> {
        self.require_repo()?;
        self.run_ok(&["reset", "--hard", "--quiet", to_commit])?;
        info!(commit = %to_commit, "rolled back");
        Ok(())
    }

    pub fn rollback_last(&self) -> VcsResult<()> {
        self.rollback("HEAD~1")
    }

    /// Copy `source` into a fresh temp directory and make it a repo with one baseline commit
    pub fn create_sandbox_copy(&self, source: &Path, rules: &IgnoreRules) -> SandboxResult<SandboxCopy> {
        if !self.available {
            return Err(SandboxError::Setup(
                "git is required for snapshot sandboxes but is not available".into(),
            ));
        }

        let path = std::env::temp_dir().join(format!(
            "{}{}",
            SNAPSHOT_SANDBOX_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));

        let setup = || -> SandboxResult<String> {
            copy_tree(source, &path, rules).map_err(|e| {
                SandboxError::Setup(format!("failed to copy {}: {}", source.display(), e))
            })?;
            self.at(&path)
                .init_repo()
                .map_err(|e| SandboxError::Setup(format!("failed to initialise sandbox repo: {}", e)))
        };

        match setup() {
            Ok(baseline) => {
                info!(sandbox = %path.display(), baseline = %baseline, "snapshot sandbox created");
                Ok(SandboxCopy { path, baseline })
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&path);
                Err(e)
            }
        }
    }

    /// Remove a sandbox directory. Refuses paths that are not ours.
    pub fn cleanup_sandbox(&self, sandbox: &Path) -> std::io::Result<()> {
        let ours = sandbox
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(SNAPSHOT_SANDBOX_PREFIX))
            .unwrap_or(false);
        if !ours {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("refusing to remove non-sandbox path {}", sandbox.display()),
            ));
        }
        if sandbox.exists() {
            std::fs::remove_dir_all(sandbox)?;
        }
        Ok(())
    }

    pub fn get_log(&self, n: usize) -> VcsResult<Vec<CommitInfo>> {
        let count = format!("-{}", n);
        let log = self.run_ok(&["log", &count, "--pretty=format:%H|%h|%ai|%s"])?;
        Ok(log
            .lines()
            .filter_map(|line| {
                let mut parts = line.splitn(4, '|');
                Some(CommitInfo {
                    hash: parts.next()?.to_string(),
                    short_hash: parts.next()?.to_string(),
                    date: parts.next()?.to_string(),
                    message: parts.next()?.to_string(),
                })
            })
            .collect())
    }
}

fn diff_args<'a>(flags: &[&'a str], from_commit: Option<&'a str>) -> Vec<&'a str> {
    let mut args = vec!["diff", "--no-renames"];
    args.extend_from_slice(flags);
    args.extend(from_commit);
    args
}

fn split_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sum `--numstat` columns; binary files report `-` and count as zero
fn parse_numstat(numstat: &str) -> (usize, usize) {
    numstat.lines().fold((0, 0), |(ins, del), line| {
        let mut cols = line.split('\t');
        let added = cols.next().and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        let removed = cols.next().and_then(|c| c.parse::<usize>().ok()).unwrap_or(0);
        (ins + added, del + removed)
    })
}

/// `(status, path)` pairs from NUL-separated `--name-status -z` output
fn parse_name_status(output: &str) -> Vec<(char, String)> {
    let mut fields = output.split('\0').filter(|f| !f.is_empty());
    let mut entries = Vec::new();
    while let (Some(status), Some(path)) = (fields.next(), fields.next()) {
        if let Some(code) = status.chars().next() {
            entries.push((code, path.to_string()));
        }
    }
    entries
}

/// Split a patch into per-file sections keyed by path
fn split_patch(raw: &str) -> HashMap<String, Vec<String>> {
    let mut sections: HashMap<String, Vec<String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in raw.lines() {
        if let Some(header) = line.strip_prefix("diff --git ") {
            current = header_path(header);
        }
        if let Some(path) = &current {
            sections.entry(path.clone()).or_default().push(line.to_string());
        }
    }
    sections
}

/// Path from `a/<p> b/<p>`. Without renames both sides are equal, so the
/// split point is fixed by length even when `<p>` contains ` b/`.
fn header_path(header: &str) -> Option<String> {
    if header.starts_with('"') {
        let (_, rest) = take_quoted(header)?;
        let (b_side, _) = take_quoted(rest.trim_start())?;
        return b_side.strip_prefix("b/").map(str::to_string);
    }
    let len = header.len().checked_sub(5)?;
    if len % 2 != 0 {
        return None;
    }
    let half = len / 2;
    let a_side = header.get(2..2 + half)?;
    let b_side = header.get(header.len() - half..)?;
    let middle = header.get(2 + half..header.len() - half)?;
    (header.starts_with("a/") && middle == " b/" && a_side == b_side).then(|| b_side.to_string())
}

/// Decode one C-quoted string as git writes it; returns it and the remainder
fn take_quoted(text: &str) -> Option<(String, &str)> {
    let body = text.strip_prefix('"')?;
    let bytes = body.as_bytes();
    let mut out: Vec<u8> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Some((String::from_utf8_lossy(&out).into_owned(), &body[i + 1..])),
            b'\\' => {
                let escaped = *bytes.get(i + 1)?;
                i += 2;
                match escaped {
                    b'n' => out.push(b'\n'),
                    b't' => out.push(b'\t'),
                    b'r' => out.push(b'\r'),
                    b'a' => out.push(0x07),
                    b'b' => out.push(0x08),
                    b'f' => out.push(0x0c),
                    b'v' => out.push(0x0b),
                    b'0'..=b'7' => {
                        let digits = body.get(i - 1..i + 2)?;
                        out.push(u8::from_str_radix(digits, 8).ok()?);
                        i += 2;
                    }
                    other => out.push(other),
                }
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ChangeKind;
    use std::fs;

    fn git_repo() -> Option<(tempfile::TempDir, GitAdapter)> {
        let dir = tempfile::tempdir().unwrap();
        let git = GitAdapter::new(dir.path());
        if !git.is_available() {
            return None;
        }
        Some((dir, git))
    }

    #[test]
    fn numstat_sums_and_skips_binary() {
        assert_eq!(parse_numstat("3\t1\ta.txt\n-\t-\tlogo.png\n10\t0\tb.txt"), (13, 1));
    }

    #[test]
    fn patch_sections_are_keyed_by_path() {
        let raw = "diff --git a/x.txt b/x.txt\n--- a/x.txt\n+++ b/x.txt\n@@ -1 +1 @@\n-a\n+b\ndiff --git a/y.bin b/y.bin\nBinary files a/y.bin and b/y.bin differ";
        let sections = split_patch(raw);
        assert_eq!(sections["x.txt"].len(), 6);
        assert!(sections["y.bin"][1].starts_with("Binary files"));
    }

    #[test]
    fn awkward_names_survive_parsing() {
        assert_eq!(header_path("a/docs b/x.md b/docs b/x.md"), Some("docs b/x.md".to_string()));
        assert_eq!(
            header_path(r#""a/say \"hi\"\tnow.txt" "b/say \"hi\"\tnow.txt""#),
            Some("say \"hi\"\tnow.txt".to_string())
        );
        assert_eq!(header_path(r#""a/caf\303\251" "b/caf\303\251""#), Some("café".to_string()));

        let entries = parse_name_status("M\0docs b/x.md\0A\0say \"hi\"\tnow.txt\0");
        assert_eq!(
            entries,
            vec![('M', "docs b/x.md".to_string()), ('A', "say \"hi\"\tnow.txt".to_string())]
        );
    }

    #[test]
    fn missing_binary_degrades_to_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitAdapter::with_program(dir.path(), "no-such-git-binary-xyz");
        assert!(!git.is_available());
        assert!(!git.is_repo());
        assert!(matches!(git.current_commit(), Err(VcsError::Unavailable(_))));
        assert!(matches!(git.create_snapshot("x"), Err(VcsError::Unavailable(_))));
        let err = git
            .create_sandbox_copy(dir.path(), &IgnoreRules::default())
            .unwrap_err();
        assert_eq!(err.kind(), "setup");
    }

    #[cfg(unix)]
    #[test]
    fn diff_keeps_quoted_and_spaced_names_intact() {
        let Some((dir, git)) = git_repo() else { return };
        let spaced = "docs b/x.md";
        let quoted = "say \"hi\".txt";
        fs::create_dir_all(dir.path().join("docs b")).unwrap();
        fs::write(dir.path().join(spaced), "one\n").unwrap();
        fs::write(dir.path().join(quoted), "one\n").unwrap();
        let baseline = git.init_repo().unwrap();

        fs::write(dir.path().join(spaced), "two\n").unwrap();
        fs::write(dir.path().join(quoted), "two\n").unwrap();
        git.create_snapshot("edit").unwrap();

        let diff = git.get_diff(Some(&baseline)).unwrap();
        assert_eq!(diff.changed_paths(), vec![spaced.to_string(), quoted.to_string()]);
        for file in &diff.files {
            assert_eq!(file.kind, ChangeKind::Modified);
            match &file.content {
                DiffContent::Text(lines) => assert!(lines.iter().any(|l| l == "+two"), "{}", file.path),
                other => panic!("expected text for {}, got {:?}", file.path, other),
            }
        }
    }

    #[test]
    fn snapshot_diff_and_rollback() {
        let Some((dir, git)) = git_repo() else { return };
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        let baseline = git.init_repo().unwrap();

        // Clean tree: snapshot is a no-op
        assert_eq!(git.create_snapshot("noop").unwrap(), baseline);

        fs::write(dir.path().join("a.txt"), "one\ntwo\n").unwrap();
        fs::write(dir.path().join("b.txt"), "new\n").unwrap();
        let after = git.create_snapshot("after").unwrap();
        assert_ne!(after, baseline);

        let diff = git.get_diff(Some(&baseline)).unwrap();
        assert!(diff.has_changes());
        assert_eq!(diff.insertions, 2);
        let kinds: Vec<(String, ChangeKind)> =
            diff.files.iter().map(|f| (f.path.clone(), f.kind)).collect();
        assert_eq!(
            kinds,
            vec![("a.txt".to_string(), ChangeKind::Modified), ("b.txt".to_string(), ChangeKind::Added)]
        );
        match &diff.files[0].content {
            DiffContent::Text(lines) => assert!(lines.iter().any(|l| l == "+two")),
            other => panic!("expected text, got {:?}", other),
        }

        let log = git.get_log(5).unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].message.starts_with("after ["));

        git.rollback(&baseline).unwrap();
        assert!(!dir.path().join("b.txt").exists());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
        assert!(git.status().unwrap().is_clean);
    }

    #[test]
    fn sandbox_copy_excludes_metadata_and_has_baseline() {
        let Some((dir, git)) = git_repo() else { return };
        fs::write(dir.path().join("keep.txt"), "data").unwrap();
        git.init_repo().unwrap();

        let copy = git
            .create_sandbox_copy(dir.path(), &IgnoreRules::default())
            .unwrap();
        assert!(copy.path.join("keep.txt").exists());
        let sandbox_git = git.at(&copy.path);
        assert_eq!(sandbox_git.current_commit().unwrap(), copy.baseline);
        assert_eq!(sandbox_git.get_log(10).unwrap().len(), 1);

        git.cleanup_sandbox(&copy.path).unwrap();
        assert!(!copy.path.exists());
    }

    #[test]
    fn cleanup_refuses_foreign_paths() {
        let dir = tempfile::tempdir().unwrap();
        let git = GitAdapter::with_program(dir.path(), "no-such-git-binary-xyz");
        assert!(git.cleanup_sandbox(dir.path()).is_err());
        assert!(dir.path().exists());
    }
}
