//! Append-only audit log of every execution decision.
//!
//! Each entry is rendered in full first and then appended with a single
//! `write_all` while holding a [`LogLock`], so concurrent writers sharing
//! the lock never interleave. Two encodings exist: one JSON record per line,
//! or a human-readable block framed by `=` rules.

use crate::config::LogFormat;
use crate::error::{SandboxError, SandboxResult};
use crate::plan::Plan;
use crate::process::ExecFailure;
use crate::runner::{ExecutionMode, ExecutionResult};
use crate::session::CommandResult;
use crate::tree::FileChange;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

const RULE_WIDTH: usize = 60;
const HUMAN_STDOUT_CHARS: usize = 500;
const HUMAN_STDERR_CHARS: usize = 300;

/// Shared write lock for one log file. Clone it into every logger that writes there.
#[derive(Debug, Clone, Default)]
pub struct LogLock(Arc<Mutex<()>>);

impl LogLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) -> MutexGuard<'_, ()> {
        // the guarded value is (), so a poisoned lock is still usable
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogMode {
    DryRun,
    Sandbox,
    Live,
    Rejected,
    Modify,
}

impl LogMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogMode::DryRun => "dry_run",
            LogMode::Sandbox => "sandbox",
            LogMode::Live => "live",
            LogMode::Rejected => "rejected",
            LogMode::Modify => "modify",
        }
    }
}

impl From<ExecutionMode> for LogMode {
    fn from(mode: ExecutionMode) -> Self {
        match mode {
            ExecutionMode::DryRun => LogMode::DryRun,
            ExecutionMode::Sandbox => LogMode::Sandbox,
            ExecutionMode::Live => LogMode::Live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: String,
    pub message: String,
}

impl From<&SandboxError> for FailureDetail {
    fn from(err: &SandboxError) -> Self {
        Self {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<&ExecFailure> for FailureDetail {
    fn from(failure: &ExecFailure) -> Self {
        Self {
            kind: failure.kind.as_str().to_string(),
            message: failure.message.clone(),
        }
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: String,
    pub timestamp: DateTime<Local>,
    pub session_id: String,
    pub user_query: String,
    pub plan: Plan,
    pub mode: LogMode,
    pub approved: bool,
    pub applied: Option<bool>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub git_commit_before: Option<String>,
    pub git_commit_after: Option<String>,
    pub changed_files: Vec<String>,
    pub error: Option<FailureDetail>,
}

impl LogEntry {
    pub fn new(session_id: &str, user_query: &str, plan: &Plan, mode: LogMode) -> Self {
        Self {
            entry_id: Uuid::new_v4().to_string(),
            timestamp: Local::now(),
            session_id: session_id.to_string(),
            user_query: user_query.to_string(),
            plan: plan.clone(),
            mode,
            approved: false,
            applied: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            git_commit_before: None,
            git_commit_after: None,
            changed_files: Vec::new(),
            error: None,
        }
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }

    pub fn applied(mut self, applied: bool) -> Self {
        self.applied = Some(applied);
        self
    }

    /// Copy outcome fields from an execution. A launch failure becomes the entry's error.
    pub fn with_result(mut self, result: &ExecutionResult) -> Self {
        self.mode = result.mode.into();
        self.exit_code = Some(result.exit_code);
        self.stdout = result.stdout.clone();
        self.stderr = result.stderr.clone();
        self.duration_ms = result.duration_ms;
        self.git_commit_before = result.git_before.clone();
        self.git_commit_after = result.git_after.clone();
        self.changed_files = result.changed_paths();
        if let Some(failure) = &result.failure {
            self.error = Some(failure.into());
        }
        self
    }

    /// Outcome of one command in a copy session, with the session's changes so far
    pub fn with_command(mut self, result: &CommandResult, changes: &[FileChange]) -> Self {
        self.exit_code = Some(result.exit_code);
        self.stdout = result.stdout.clone();
        self.stderr = result.stderr.clone();
        self.duration_ms = result.duration_ms;
        self.changed_files = changes.iter().map(|c| c.path.clone()).collect();
        if let Some(failure) = &result.failure {
            self.error = Some(failure.into());
        }
        self
    }

    pub fn with_error(mut self, err: &SandboxError) -> Self {
        self.error = Some(err.into());
        self
    }

    pub fn to_json_line(&self) -> SandboxResult<String> {
        Ok(format!("{}\n", serde_json::to_string(self)?))
    }

    pub fn to_human_block(&self) -> String {
        let rule = "=".repeat(RULE_WIDTH);
        let yes_no = |b: bool| if b { "yes" } else { "no" };

        let mut lines = vec![
            rule.clone(),
            format!(
                "[{}] session {} entry {}",
                self.timestamp.to_rfc3339(),
                self.session_id,
                self.entry_id
            ),
            labeled("Query", &self.user_query),
            labeled("Intent", &self.plan.intent),
            labeled("Command", &self.plan.command_line()),
            labeled("Cwd", &self.plan.cwd),
            format!(
                "Mode: {} | Approved: {} | Applied: {}",
                self.mode.as_str(),
                yes_no(self.approved),
                self.applied.map(yes_no).unwrap_or("n/a")
            ),
        ];
        if let Some(code) = self.exit_code {
            lines.push(format!("Exit code: {} | Duration: {}ms", code, self.duration_ms));
        }
        if self.git_commit_before.is_some() || self.git_commit_after.is_some() {
            lines.push(format!(
                "Git: {} -> {}",
                self.git_commit_before.as_deref().unwrap_or("-"),
                self.git_commit_after.as_deref().unwrap_or("-")
            ));
        }
        if !self.changed_files.is_empty() {
            lines.push(labeled("Changed files", &self.changed_files.join(", ")));
        }
        if let Some(err) = &self.error {
            lines.push(labeled(&format!("Error [{}]", err.kind), &err.message));
        }
        push_stream(&mut lines, "stdout", &self.stdout, HUMAN_STDOUT_CHARS);
        push_stream(&mut lines, "stderr", &self.stderr, HUMAN_STDERR_CHARS);
        lines.push(rule);

        format!("{}\n\n", lines.join("\n"))
    }
}

/// `Label: text`, with continuation lines indented like stream output
fn labeled(label: &str, text: &str) -> String {
    let mut lines = text.split('\n');
    let mut out = format!("{}: {}", label, lines.next().unwrap_or_default());
    for line in lines {
        out.push_str("\n    ");
        out.push_str(line);
    }
    out
}

/// Stream output is indented so it can never be mistaken for a block rule
fn push_stream(lines: &mut Vec<String>, label: &str, text: &str, limit: usize) {
    if text.is_empty() {
        return;
    }
    let mut shown: String = text.chars().take(limit).collect();
    if text.chars().count() > limit {
        shown.push_str("...");
    }
    lines.push(format!("--- {} ---", label));
    lines.extend(shown.lines().map(|l| format!("    {}", l)));
}

pub struct AuditLogger {
    path: PathBuf,
    format: LogFormat,
    lock: LogLock,
    session_id: String,
}

impl AuditLogger {
    /// Open (or create) the log at `path`. A fresh file gets a `#` header.
    pub fn new(path: impl Into<PathBuf>, format: LogFormat, lock: LogLock) -> SandboxResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let session_id = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let logger = Self {
            path,
            format,
            lock,
            session_id,
        };
        logger.write_header_if_new()?;
        Ok(logger)
    }

    fn write_header_if_new(&self) -> SandboxResult<()> {
        let _guard = self.lock.acquire();
        let empty = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        if !empty {
            return Ok(());
        }

        let format = match self.format {
            LogFormat::Human => "human",
            LogFormat::Json => "json",
        };
        let header = format!(
            "# plan-sandbox audit log\n# Created: {}\n# Format: {}\n\n",
            Local::now().to_rfc3339(),
            format
        );
        self.append(header.as_bytes())
    }

    fn append(&self, bytes: &[u8]) -> SandboxResult<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// A blank entry stamped with this logger's session id
    pub fn entry(&self, user_query: &str, plan: &Plan, mode: LogMode) -> LogEntry {
        LogEntry::new(&self.session_id, user_query, plan, mode)
    }

    pub fn log(&self, entry: &LogEntry) -> SandboxResult<()> {
        let rendered = match self.format {
            LogFormat::Json => entry.to_json_line()?,
            LogFormat::Human => entry.to_human_block(),
        };

        let _guard = self.lock.acquire();
        self.append(rendered.as_bytes())?;
        debug!(entry = %entry.entry_id, mode = entry.mode.as_str(), "audit entry written");
        Ok(())
    }

    /// Text of the last `n` entries, oldest first
    pub fn read_recent(&self, n: usize) -> SandboxResult<Vec<String>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let entries = match self.format {
            LogFormat::Json => content
                .lines()
                .filter(|l| !l.trim().is_empty() && !l.starts_with('#'))
                .map(str::to_string)
                .collect(),
            LogFormat::Human => split_blocks(&content),
        };

        let skip = entries.len().saturating_sub(n);
        Ok(entries.into_iter().skip(skip).collect())
    }

    /// Parsed entries; only meaningful for JSON logs
    pub fn read_entries(&self, n: usize) -> SandboxResult<Vec<LogEntry>> {
        if self.format != LogFormat::Json {
            return Err(SandboxError::Config(
                "structured entries can only be read from a json audit log".into(),
            ));
        }
        self.read_recent(n)?
            .iter()
            .map(|line| serde_json::from_str(line).map_err(SandboxError::from))
            .collect()
    }
}

/// Entries for the commands of one copy session.
///
/// Nothing is written until [`finish`](Self::finish), so every entry carries
/// the session's final apply decision.
pub struct SessionAudit<'a> {
    logger: &'a AuditLogger,
    query: String,
    entries: Vec<LogEntry>,
}

impl<'a> SessionAudit<'a> {
    pub fn new(logger: &'a AuditLogger, query: &str) -> Self {
        Self {
            logger,
            query: query.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, plan: &Plan, result: &CommandResult, changes: &[FileChange]) {
        let entry = self
            .logger
            .entry(&self.query, plan, LogMode::Sandbox)
            .approved(true)
            .with_command(result, changes);
        self.entries.push(entry);
    }

    /// A plan that never produced a result
    pub fn record_error(&mut self, plan: &Plan, err: &SandboxError) {
        let entry = self.logger.entry(&self.query, plan, LogMode::Sandbox).with_error(err);
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write every entry with the apply decision and, if the apply failed, its error
    pub fn finish(self, applied: bool, apply_error: Option<&SandboxError>) -> SandboxResult<()> {
        for entry in self.entries {
            let mut entry = entry.applied(applied);
            if let Some(err) = apply_error {
                entry = entry.with_error(err);
            }
            self.logger.log(&entry)?;
        }
        Ok(())
    }
}

fn split_blocks(content: &str) -> Vec<String> {
    let rule = "=".repeat(RULE_WIDTH);
    let mut blocks = Vec::new();
    let mut current: Option<Vec<&str>> = None;

    for line in content.lines() {
        if line == rule {
            match current.take() {
                None => current = Some(vec![line]),
                Some(mut block) => {
                    block.push(line);
                    blocks.push(block.join("\n"));
                }
            }
        } else if let Some(block) = current.as_mut() {
            block.push(line);
        }
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn sample_plan() -> Plan {
        Plan::new("list files", &["ls", "-la"])
    }

    #[test]
    fn new_log_gets_a_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.log");
        let lock = LogLock::new();

        AuditLogger::new(&path, LogFormat::Human, lock.clone()).unwrap();
        AuditLogger::new(&path, LogFormat::Human, lock).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("# plan-sandbox audit log"));
        assert_eq!(content.matches("# Created:").count(), 1);
    }

    #[test]
    fn json_entries_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let logger =
            AuditLogger::new(dir.path().join("audit.log"), LogFormat::Json, LogLock::new()).unwrap();

        let rejected = logger.entry("show me", &sample_plan(), LogMode::Rejected);
        let modify = logger.entry("show me", &sample_plan(), LogMode::Modify);
        logger.log(&rejected).unwrap();
        logger.log(&modify).unwrap();

        let entries = logger.read_entries(10).unwrap();
        assert_eq!(entries, vec![rejected, modify]);
        assert!(!entries[0].approved);

        let last = logger.read_recent(1).unwrap();
        assert_eq!(last.len(), 1);
        assert!(last[0].contains("\"mode\":\"modify\""));
    }

    #[test]
    fn human_blocks_truncate_streams() {
        let dir = tempfile::tempdir().unwrap();
        let logger =
            AuditLogger::new(dir.path().join("audit.log"), LogFormat::Human, LogLock::new()).unwrap();

        let mut entry = logger
            .entry("q", &sample_plan(), LogMode::Sandbox)
            .approved(true)
            .applied(false);
        entry.exit_code = Some(0);
        entry.stdout = "x".repeat(2000);
        entry.stderr = "=".repeat(RULE_WIDTH);
        logger.log(&entry).unwrap();
        logger.log(&logger.entry("q2", &sample_plan(), LogMode::Rejected)).unwrap();

        let blocks = logger.read_recent(10).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("Mode: sandbox | Approved: yes | Applied: no"));
        assert!(blocks[0].contains(&format!("    {}...", "x".repeat(HUMAN_STDOUT_CHARS))));
        assert!(!blocks[0].contains(&"x".repeat(HUMAN_STDOUT_CHARS + 1)));
        assert!(blocks[1].contains("Query: q2"));
        assert!(logger.read_entries(1).is_err());
    }

    #[test]
    fn multiline_fields_cannot_close_a_block() {
        let dir = tempfile::tempdir().unwrap();
        let logger =
            AuditLogger::new(dir.path().join("audit.log"), LogFormat::Human, LogLock::new()).unwrap();
        let rule = "=".repeat(RULE_WIDTH);

        let tricky = format!("first line\n{}\nsecond", rule);
        let mut plan = sample_plan();
        plan.intent = tricky.clone();
        let err = SandboxError::Setup(format!("git said:\n{}\n", rule));
        logger
            .log(&logger.entry(&tricky, &plan, LogMode::Sandbox).with_error(&err))
            .unwrap();
        logger.log(&logger.entry("plain", &sample_plan(), LogMode::Rejected)).unwrap();

        let blocks = logger.read_recent(10).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks[0].contains("Query: first line\n    ===="));
        assert!(blocks[0].contains("    second"));
        assert!(blocks[1].contains("Query: plain"));
        assert_eq!(logger.read_recent(1).unwrap(), vec![blocks[1].clone()]);
    }

    #[test]
    fn session_entries_carry_the_final_decision() {
        let dir = tempfile::tempdir().unwrap();
        let logger =
            AuditLogger::new(dir.path().join("audit.log"), LogFormat::Json, LogLock::new()).unwrap();

        let result = CommandResult {
            command: vec!["touch".into(), "b".into()],
            cwd: ".".into(),
            exit_code: 0,
            stdout: "done\n".into(),
            stderr: String::new(),
            duration_ms: 3,
            timestamp: Local::now(),
            success: true,
            failure: None,
        };
        let mut audit = SessionAudit::new(&logger, "make b");
        audit.record(&sample_plan(), &result, &[FileChange::added("b")]);
        audit.record_error(&sample_plan(), &SandboxError::InvalidPlan("empty command".into()));
        assert_eq!(audit.len(), 2);
        assert!(logger.read_entries(10).unwrap().is_empty());

        let failed = SandboxError::Apply {
            path: PathBuf::from("b"),
            applied: Vec::new(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        audit.finish(false, Some(&failed)).unwrap();

        let entries = logger.read_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mode, LogMode::Sandbox);
        assert!(entries[0].approved);
        assert_eq!(entries[0].changed_files, vec!["b".to_string()]);
        assert_eq!(entries[0].stdout, "done\n");
        for entry in &entries {
            assert_eq!(entry.applied, Some(false));
            assert_eq!(entry.error.as_ref().map(|e| e.kind.as_str()), Some("apply"));
        }
    }

    #[test]
    fn error_detail_keeps_kind() {
        let err = SandboxError::Setup("git missing".into());
        let entry = LogEntry::new("s", "q", &sample_plan(), LogMode::Sandbox).with_error(&err);
        let detail = entry.error.unwrap();
        assert_eq!(detail.kind, "setup");
        assert!(detail.message.contains("git missing"));
    }

    #[test]
    fn concurrent_writers_never_interleave() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let lock = LogLock::new();
        let threads = 8;
        let per_thread = 25;

        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let path = path.clone();
                let lock = lock.clone();
                thread::spawn(move || {
                    let logger = AuditLogger::new(path, LogFormat::Json, lock).unwrap();
                    for i in 0..per_thread {
                        let mut entry = logger.entry(&format!("t{}-{}", t, i), &sample_plan(), LogMode::DryRun);
                        entry.stdout = "y".repeat(4096);
                        logger.log(&entry).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reader = AuditLogger::new(&path, LogFormat::Json, lock).unwrap();
        let entries = reader.read_entries(usize::MAX).unwrap();
        assert_eq!(entries.len(), threads * per_thread);
        assert_eq!(fs::read_to_string(&path).unwrap().matches("# Created:").count(), 1);
    }
}
