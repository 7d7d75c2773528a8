//! Copy-based sandbox session.
//!
//! The original directory is copied to a sibling named
//! `.sandbox_<dirname>_<session id>`. Commands run only inside the copy, and
//! changes are found by comparing the two trees. The original is touched only
//! by [`SandboxSession::apply_changes`].

use crate::config::SandboxConfig;
use crate::diff_engine::DiffEngine;
use crate::error::{SandboxError, SandboxResult};
use crate::plan::{validate_relative_cwd, Plan};
use crate::process::{CommandLauncher, ExecFailure, ProcessSpec, SystemLauncher};
use crate::tree::{
    compare_trees, copy_tree, from_slash, resolves_inside, ChangeKind, FileChange, IgnoreRules,
    SESSION_SANDBOX_PREFIX,
};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// One command executed inside a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: Vec<String>,
    pub cwd: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Local>,
    pub success: bool,
    pub failure: Option<ExecFailure>,
}

impl CommandResult {
    pub fn summary(&self) -> String {
        let status = if self.success { "OK  " } else { "FAIL" };
        let mut line = format!(
            "{} [{}] {} (exit: {}, {}ms)",
            status,
            self.timestamp.format("%H:%M:%S"),
            self.command.join(" "),
            self.exit_code,
            self.duration_ms
        );
        if let Some(failure) = &self.failure {
            line.push_str(&format!(" [{}]", failure.kind.as_str()));
        }
        line
    }
}

/// Files written or removed by a successful apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApplyReport {
    pub applied: Vec<FileChange>,
    pub snapshot: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub rules: IgnoreRules,
}

impl SessionSettings {
    pub fn from_config(config: &SandboxConfig) -> Self {
        Self {
            timeout: config.session_timeout(),
            max_output_bytes: config.max_output_bytes,
            rules: IgnoreRules::from_config(config),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// Lifecycle of a session. `Applied` and `Discarded` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Unstarted,
    /// The copy failed part-way; only `discard` is allowed
    SetupFailed,
    Active,
    Applied,
    Discarded,
}

#[derive(Debug, Clone)]
pub struct SessionState {
    pub session_id: String,
    pub original_dir: PathBuf,
    pub sandbox_dir: PathBuf,
    pub created_at: DateTime<Local>,
    pub history: Vec<CommandResult>,
}

pub struct SandboxSession {
    original_dir: PathBuf,
    settings: SessionSettings,
    launcher: Arc<dyn CommandLauncher>,
    phase: SessionPhase,
    state: Option<SessionState>,
}

impl SandboxSession {
    pub fn new(original_dir: impl Into<PathBuf>, settings: SessionSettings) -> Self {
        Self::with_launcher(original_dir, settings, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(
        original_dir: impl Into<PathBuf>,
        settings: SessionSettings,
        launcher: Arc<dyn CommandLauncher>,
    ) -> Self {
        Self {
            original_dir: original_dir.into(),
            settings,
            launcher,
            phase: SessionPhase::Unstarted,
            state: None,
        }
    }

    /// Copy the original into a fresh sibling directory.
    ///
    /// On a failed copy the partial directory stays on disk until `discard`.
    pub fn start(&mut self) -> SandboxResult<&SessionState> {
        if self.phase != SessionPhase::Unstarted {
            return Err(SandboxError::State(format!(
                "session cannot be started from {:?}; sandboxes are never reused",
                self.phase
            )));
        }

        let original = fs::canonicalize(&self.original_dir).map_err(|e| {
            SandboxError::Setup(format!(
                "source directory {} is not accessible: {}",
                self.original_dir.display(),
                e
            ))
        })?;
        if !original.is_dir() {
            return Err(SandboxError::Setup(format!(
                "source {} is not a directory",
                original.display()
            )));
        }
        let parent = original.parent().ok_or_else(|| {
            SandboxError::Setup("cannot sandbox a filesystem root: no sibling location".into())
        })?;
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let session_id = generate_session_id();
        let sandbox_dir = parent.join(format!("{}{}_{}", SESSION_SANDBOX_PREFIX, name, session_id));

        info!(
            session = %session_id,
            original = %original.display(),
            sandbox = %sandbox_dir.display(),
            "creating sandbox copy"
        );

        let copy_result = copy_tree(&original, &sandbox_dir, &self.settings.rules);

        self.state = Some(SessionState {
            session_id,
            original_dir: original,
            sandbox_dir: sandbox_dir.clone(),
            created_at: Local::now(),
            history: Vec::new(),
        });

        match copy_result {
            Ok(files) => {
                self.phase = SessionPhase::Active;
                info!(files, "sandbox session started");
                self.state
                    .as_ref()
                    .ok_or_else(|| SandboxError::State("session state missing".into()))
            }
            Err(e) => {
                self.phase = SessionPhase::SetupFailed;
                Err(SandboxError::Setup(format!(
                    "copy into {} failed: {} (discard the session to remove the partial copy)",
                    sandbox_dir.display(),
                    e
                )))
            }
        }
    }

    fn active_state(&mut self) -> SandboxResult<&mut SessionState> {
        match (self.phase, self.state.as_mut()) {
            (SessionPhase::Active, Some(state)) => Ok(state),
            (phase, _) => Err(SandboxError::State(format!(
                "no active sandbox session (phase: {:?})",
                phase
            ))),
        }
    }

    /// Run argv with its cwd resolved inside the sandbox.
    ///
    /// Non-zero exits and timeouts are ordinary results.
    pub fn run_command(&mut self, command: &[String], cwd: &str) -> SandboxResult<CommandResult> {
        validate_relative_cwd(cwd)?;
        let timeout = self.settings.timeout;
        let max_output_bytes = self.settings.max_output_bytes;
        let launcher = Arc::clone(&self.launcher);
        let state = self.active_state()?;

        let exec_dir = state.sandbox_dir.join(cwd);
        fs::create_dir_all(&exec_dir)?;

        info!(session = %state.session_id, command = %command.join(" "), "executing in sandbox");
        let timestamp = Local::now();
        let outcome = launcher.launch(&ProcessSpec {
            argv: command,
            cwd: &exec_dir,
            timeout,
            max_output_bytes,
        });

        let result = CommandResult {
            command: command.to_vec(),
            cwd: cwd.to_string(),
            exit_code: outcome.exit_code,
            success: outcome.success(),
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.duration.as_millis() as u64,
            timestamp,
            failure: outcome.failure,
        };

        if result.success {
            info!(duration_ms = result.duration_ms, "command succeeded");
        } else {
            warn!(exit_code = result.exit_code, "command failed");
        }

        state.history.push(result.clone());
        Ok(result)
    }

    pub fn run_plan(&mut self, plan: &Plan) -> SandboxResult<CommandResult> {
        plan.validate()?;
        self.run_command(&plan.command, &plan.cwd)
    }

    /// Recompute the change set from the current trees. No side effects.
    pub fn get_changes(&self) -> SandboxResult<Vec<FileChange>> {
        let state = match (self.phase, self.state.as_ref()) {
            (SessionPhase::Active, Some(state)) => state,
            (phase, _) => {
                return Err(SandboxError::State(format!(
                    "no active sandbox session (phase: {:?})",
                    phase
                )))
            }
        };
        Ok(compare_trees(
            &state.original_dir,
            &state.sandbox_dir,
            &self.settings.rules,
        )?)
    }

    /// Propagate every change to the original, then delete the sandbox.
    ///
    /// Not transactional: an IO error aborts with earlier changes already
    /// written, and the session stays active for a retry or discard.
    pub fn apply_changes(&mut self) -> SandboxResult<ApplyReport> {
        let changes = self.get_changes()?;
        let state = self.active_state()?;

        info!(count = changes.len(), "applying sandbox changes to original");
        let mut applied: Vec<FileChange> = Vec::with_capacity(changes.len());
        for change in changes {
            let relative = from_slash(&change.path);
            let target = state.original_dir.join(&relative);
            let source = state.sandbox_dir.join(&relative);

            if let Err(source_err) = apply_one(&change, &source, &target, &state.original_dir) {
                warn!(path = %change.path, error = %source_err, "apply aborted");
                return Err(SandboxError::Apply {
                    path: relative,
                    applied: applied.into_iter().map(|c| c.path).collect(),
                    source: source_err,
                });
            }
            applied.push(change);
        }

        let sandbox_dir = state.sandbox_dir.clone();
        remove_sandbox_dir(&sandbox_dir);
        self.phase = SessionPhase::Applied;
        info!(applied = applied.len(), "all changes applied");

        Ok(ApplyReport {
            applied,
            snapshot: None,
        })
    }

    /// Delete the sandbox without touching the original
    pub fn discard(&mut self) -> SandboxResult<()> {
        match self.phase {
            SessionPhase::Active | SessionPhase::SetupFailed => {}
            phase => {
                return Err(SandboxError::State(format!(
                    "nothing to discard (phase: {:?})",
                    phase
                )))
            }
        }

        if let Some(state) = &self.state {
            info!(session = %state.session_id, "discarding sandbox session");
            remove_sandbox_dir(&state.sandbox_dir);
        }
        self.phase = SessionPhase::Discarded;
        Ok(())
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == SessionPhase::Active
    }

    pub fn session_id(&self) -> Option<&str> {
        self.state.as_ref().map(|s| s.session_id.as_str())
    }

    pub fn sandbox_path(&self) -> Option<&Path> {
        self.state.as_ref().map(|s| s.sandbox_dir.as_path())
    }

    pub fn original_dir(&self) -> &Path {
        self.state
            .as_ref()
            .map(|s| s.original_dir.as_path())
            .unwrap_or(&self.original_dir)
    }

    pub fn history(&self) -> &[CommandResult] {
        self.state.as_ref().map(|s| s.history.as_slice()).unwrap_or(&[])
    }

    pub fn show_changes(&self) -> SandboxResult<String> {
        Ok(DiffEngine::render_changes(&self.get_changes()?))
    }

    pub fn show_history(&self) -> String {
        let Some(state) = &self.state else {
            return "No session started.".to_string();
        };

        let mut lines = vec![
            format!("Command History (Session: {})", state.session_id),
            "-".repeat(40),
        ];
        if state.history.is_empty() {
            lines.push("   (no commands executed yet)".to_string());
        }
        for (i, result) in state.history.iter().enumerate() {
            lines.push(format!("{}. {}", i + 1, result.summary()));
        }
        lines.join("\n")
    }
}

fn apply_one(change: &FileChange, source: &Path, target: &Path, root: &Path) -> std::io::Result<()> {
    if !resolves_inside(root, target) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "target resolves outside the original directory",
        ));
    }
    match change.kind {
        ChangeKind::Added | ChangeKind::Modified => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(source, target)?;
        }
        ChangeKind::Deleted => {
            if target.exists() {
                fs::remove_file(target)?;
            }
        }
    }
    Ok(())
}

fn remove_sandbox_dir(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_dir_all(path) {
            warn!(sandbox = %path.display(), error = %e, "could not fully remove sandbox");
        }
    }
}

/// Local timestamp plus a short random suffix so same-second sessions get distinct directories
fn generate_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", Local::now().format("%Y%m%d_%H%M%S"), &suffix[..6])
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::FailureKind;
    use crate::tree::DiffContent;
    use std::collections::BTreeMap;

    struct Fixture {
        _root: tempfile::TempDir,
        original: PathBuf,
    }

    fn fixture(files: &[(&str, &str)]) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let original = root.path().join("project");
        fs::create_dir_all(&original).unwrap();
        for (rel, content) in files {
            let path = original.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        Fixture { _root: root, original }
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e.path().strip_prefix(dir).unwrap().to_string_lossy().into_owned();
                (rel, fs::read(e.path()).unwrap())
            })
            .collect()
    }

    #[test]
    fn start_creates_a_sibling_copy() {
        let fx = fixture(&[("a.txt", "A"), (".git/HEAD", "ref")]);
        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        let sandbox = session.start().unwrap().sandbox_dir.clone();

        let name = sandbox.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".sandbox_project_"));
        assert_eq!(sandbox.parent(), fx.original.canonicalize().unwrap().parent());
        assert!(sandbox.join("a.txt").exists());
        assert!(!sandbox.join(".git").exists());
        assert!(session.is_active());

        session.discard().unwrap();
        assert!(!sandbox.exists());
    }

    #[test]
    fn missing_source_is_a_setup_error() {
        let root = tempfile::tempdir().unwrap();
        let mut session = SandboxSession::new(root.path().join("absent"), SessionSettings::default());
        let err = session.start().unwrap_err();
        assert_eq!(err.kind(), "setup");
        assert!(!session.is_active());
    }

    #[test]
    fn delete_and_create_round_trip() {
        let fx = fixture(&[("A.txt", "alpha"), ("B.txt", "beta")]);
        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();

        let result = session.run_command(&sh("rm A.txt && echo gamma > C.txt"), ".").unwrap();
        assert!(result.success);

        let changes = session.get_changes().unwrap();
        let kinds: Vec<(&str, ChangeKind)> =
            changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(kinds, vec![("A.txt", ChangeKind::Deleted), ("C.txt", ChangeKind::Added)]);

        let sandbox = session.sandbox_path().unwrap().to_path_buf();
        let report = session.apply_changes().unwrap();
        assert_eq!(report.applied.len(), 2);

        let files: Vec<String> = snapshot(&fx.original).into_keys().collect();
        assert_eq!(files, vec!["B.txt".to_string(), "C.txt".to_string()]);
        assert!(!sandbox.exists());
        assert_eq!(session.phase(), SessionPhase::Applied);
    }

    #[test]
    fn original_is_untouched_until_apply() {
        let fx = fixture(&[("a.txt", "one\n"), ("src/lib.rs", "fn x() {}\n")]);
        let before = snapshot(&fx.original);

        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();
        session.run_command(&sh("echo two >> a.txt"), ".").unwrap();
        session.run_command(&sh("rm lib.rs && touch new.rs"), "src").unwrap();
        session.run_command(&sh("mkdir -p deep/er && echo x > deep/er/f"), ".").unwrap();

        assert_eq!(snapshot(&fx.original), before);
        session.discard().unwrap();
        assert_eq!(snapshot(&fx.original), before);
    }

    #[test]
    fn get_changes_is_idempotent() {
        let fx = fixture(&[("a.txt", "one\ntwo\n")]);
        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();
        session.run_command(&sh("printf 'one\\nthree\\n' > a.txt"), ".").unwrap();

        let first = session.get_changes().unwrap();
        let second = session.get_changes().unwrap();
        assert_eq!(first, second);
        match &first[0].content {
            DiffContent::Text(lines) => {
                assert!(lines.iter().any(|l| l == "-two"));
                assert!(lines.iter().any(|l| l == "+three"));
            }
            other => panic!("expected text diff, got {:?}", other),
        }
        session.discard().unwrap();
    }

    #[test]
    fn terminal_sessions_reject_operations() {
        let fx = fixture(&[("a.txt", "a")]);

        let mut unstarted = SandboxSession::new(&fx.original, SessionSettings::default());
        assert_eq!(unstarted.get_changes().unwrap_err().kind(), "state");
        assert_eq!(unstarted.run_command(&sh("true"), ".").unwrap_err().kind(), "state");

        let mut applied = SandboxSession::new(&fx.original, SessionSettings::default());
        applied.start().unwrap();
        applied.apply_changes().unwrap();

        let mut discarded = SandboxSession::new(&fx.original, SessionSettings::default());
        discarded.start().unwrap();
        discarded.discard().unwrap();

        for session in [&mut applied, &mut discarded] {
            assert_eq!(session.run_command(&sh("true"), ".").unwrap_err().kind(), "state");
            assert_eq!(session.get_changes().unwrap_err().kind(), "state");
            assert_eq!(session.apply_changes().unwrap_err().kind(), "state");
            assert_eq!(session.discard().unwrap_err().kind(), "state");
            assert_eq!(session.start().unwrap_err().kind(), "state");
        }
    }

    #[test]
    fn timeout_yields_failed_result_and_keeps_session() {
        let fx = fixture(&[("a.txt", "a")]);
        let settings = SessionSettings {
            timeout: Duration::from_secs(1),
            ..SessionSettings::default()
        };
        let mut session = SandboxSession::new(&fx.original, settings);
        session.start().unwrap();

        let result = session
            .run_command(&["sleep".to_string(), "5".to_string()], ".")
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure.map(|f| f.kind), Some(FailureKind::Timeout));
        assert!(session.is_active());
        assert_eq!(session.history().len(), 1);
        session.discard().unwrap();
    }

    #[test]
    fn history_is_append_only_and_nonzero_exit_is_normal() {
        let fx = fixture(&[("a.txt", "a")]);
        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();

        let failed = session.run_command(&sh("exit 4"), ".").unwrap();
        assert_eq!(failed.exit_code, 4);
        assert!(failed.failure.is_none());
        session.run_command(&sh("echo hi"), "nested/dir").unwrap();

        assert_eq!(session.history().len(), 2);
        assert!(session.show_history().contains("2. OK"));
        assert!(session.run_command(&sh("true"), "../escape").is_err());
        assert_eq!(session.history().len(), 2);
        session.discard().unwrap();
    }

    #[test]
    fn failed_apply_reports_progress_and_stays_active() {
        // `zz.txt` is a directory in the original holding only ignored content,
        // so it is invisible to the scan but blocks the copy of a file there.
        let fx = fixture(&[("zz.txt/node_modules/pkg.js", "x")]);
        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();
        session
            .run_command(&sh("echo a > a.txt && rmdir zz.txt && echo z > zz.txt"), ".")
            .unwrap();

        match session.apply_changes() {
            Err(SandboxError::Apply { path, applied, .. }) => {
                assert_eq!(path, PathBuf::from("zz.txt"));
                assert_eq!(applied, vec!["a.txt".to_string()]);
            }
            other => panic!("expected apply error, got {:?}", other.map(|r| r.applied)),
        }
        assert!(session.is_active());
        assert!(fx.original.join("a.txt").exists());
        session.discard().unwrap();
        assert!(!session.is_active());
    }

    #[test]
    fn absolute_symlink_cannot_reach_the_original() {
        let fx = fixture(&[("data/keep.txt", "orig")]);
        std::os::unix::fs::symlink(fx.original.join("data"), fx.original.join("alias")).unwrap();
        let before = snapshot(&fx.original);

        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();
        session
            .run_command(&sh("echo pwned > alias/keep.txt; echo new > alias/new.txt"), ".")
            .unwrap();

        assert_eq!(snapshot(&fx.original), before);
        let changes: Vec<(String, ChangeKind)> = session
            .get_changes()
            .unwrap()
            .into_iter()
            .map(|c| (c.path, c.kind))
            .collect();
        assert_eq!(
            changes,
            vec![
                ("alias/keep.txt".to_string(), ChangeKind::Modified),
                ("alias/new.txt".to_string(), ChangeKind::Added),
            ]
        );
        session.discard().unwrap();
        assert_eq!(snapshot(&fx.original), before);
    }

    #[test]
    fn apply_refuses_to_write_through_links_out_of_the_original() {
        let fx = fixture(&[("a.txt", "a")]);
        let outside = fx.original.parent().unwrap().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, fx.original.join("ext")).unwrap();

        let mut session = SandboxSession::new(&fx.original, SessionSettings::default());
        session.start().unwrap();
        session.run_command(&sh("mkdir ext && echo x > ext/new.txt"), ".").unwrap();

        match session.apply_changes() {
            Err(SandboxError::Apply { path, .. }) => assert_eq!(path, PathBuf::from("ext/new.txt")),
            other => panic!("expected apply error, got {:?}", other.map(|r| r.applied)),
        }
        assert!(!outside.join("new.txt").exists());
        session.discard().unwrap();
    }
}
