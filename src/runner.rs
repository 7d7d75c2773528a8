//! Snapshot-based runner.
//!
//! Sandbox mode copies the working directory into a temp repo, commits a
//! baseline, runs the command there and snapshots the result. The sandbox
//! stays pending until it is applied to the live directory or discarded.

use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::plan::Plan;
use crate::policy::scan_command;
use crate::process::{CommandLauncher, ExecFailure, ProcessSpec, SystemLauncher};
use crate::session::ApplyReport;
use crate::tree::{from_slash, resolves_inside, ChangeKind, FileChange, IgnoreRules};
use crate::vcs::{GitAdapter, SandboxCopy, VcsDiff};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    DryRun,
    Sandbox,
    Live,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::DryRun => "dry_run",
            ExecutionMode::Sandbox => "sandbox",
            ExecutionMode::Live => "live",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What would run, without running it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preview {
    pub text: String,
    pub warnings: Vec<String>,
    pub target_dir: PathBuf,
    pub target_exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub command: Vec<String>,
    pub cwd: String,
    pub mode: ExecutionMode,
    pub git_before: Option<String>,
    pub git_after: Option<String>,
    pub diff: Option<VcsDiff>,
    pub changes: Vec<FileChange>,
    pub failure: Option<ExecFailure>,
}

impl ExecutionResult {
    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    pub fn changed_paths(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.path.clone()).collect()
    }
}

pub struct SandboxRunner {
    work_dir: PathBuf,
    git: GitAdapter,
    launcher: Arc<dyn CommandLauncher>,
    timeout: Duration,
    max_output_bytes: usize,
    rules: IgnoreRules,
    pending: Option<SandboxCopy>,
}

impl SandboxRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self::with_launcher(config, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(config: &SandboxConfig, launcher: Arc<dyn CommandLauncher>) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            git: GitAdapter::new(&config.work_dir),
            launcher,
            timeout: config.timeout(),
            max_output_bytes: config.max_output_bytes,
            rules: IgnoreRules::from_config(config),
            pending: None,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn git(&self) -> &GitAdapter {
        &self.git
    }

    pub fn launcher(&self) -> Arc<dyn CommandLauncher> {
        Arc::clone(&self.launcher)
    }

    pub fn pending_sandbox(&self) -> Option<&Path> {
        self.pending.as_ref().map(|p| p.path.as_path())
    }

    /// Render what `plan` would do. No side effects.
    pub fn preview(&self, plan: &Plan) -> Preview {
        let target_dir = resolve(&self.work_dir, &plan.cwd);
        let target_exists = target_dir.is_dir();
        let warnings = scan_command(&plan.command);

        let rule = "=".repeat(50);
        let mut lines = vec![
            rule.clone(),
            "COMMAND PREVIEW".to_string(),
            rule.clone(),
            format!("Intent: {}", plan.intent),
            format!("Explanation: {}", plan.explain),
            String::new(),
            format!("Command: {}", plan.command_line()),
            format!("Directory: {}", target_dir.display()),
            String::new(),
        ];
        if !warnings.is_empty() {
            lines.push("WARNINGS:".to_string());
            lines.extend(warnings.iter().map(|w| format!("   - {}", w)));
            lines.push(String::new());
        }
        if !target_exists {
            lines.push(format!("Directory does not exist: {}", target_dir.display()));
        }
        lines.push(rule);

        Preview {
            text: lines.join("\n"),
            warnings,
            target_dir,
            target_exists,
        }
    }

    /// Run a validated plan in the given mode.
    ///
    /// Validation and sandbox setup problems are errors. Anything that goes
    /// wrong with the command itself is reported inside the result.
    pub fn execute(&mut self, plan: &Plan, mode: ExecutionMode) -> SandboxResult<ExecutionResult> {
        plan.validate()?;

        match mode {
            ExecutionMode::DryRun => Ok(self.dry_run(plan)),
            ExecutionMode::Sandbox => self.execute_in_sandbox(plan),
            ExecutionMode::Live => Ok(self.execute_live(plan)),
        }
    }

    fn dry_run(&self, plan: &Plan) -> ExecutionResult {
        ExecutionResult {
            success: true,
            exit_code: 0,
            stdout: self.preview(plan).text,
            stderr: String::new(),
            duration_ms: 0,
            command: plan.command.clone(),
            cwd: plan.cwd.clone(),
            mode: ExecutionMode::DryRun,
            git_before: None,
            git_after: None,
            diff: None,
            changes: Vec::new(),
            failure: None,
        }
    }

    fn execute_in_sandbox(&mut self, plan: &Plan) -> SandboxResult<ExecutionResult> {
        if self.pending.is_some() {
            debug!("discarding previous pending sandbox");
            self.discard_sandbox();
        }

        let copy = self.git.create_sandbox_copy(&self.work_dir, &self.rules)?;
        let sandbox_git = self.git.at(&copy.path);
        let exec_dir = resolve(&copy.path, &plan.cwd);
        fs::create_dir_all(&exec_dir).map_err(|e| {
            let _ = self.git.cleanup_sandbox(&copy.path);
            SandboxError::Setup(format!("cannot create {} in sandbox: {}", plan.cwd, e))
        })?;

        let baseline = copy.baseline.clone();
        self.pending = Some(copy);

        let mut result = self.launch(plan, &exec_dir, ExecutionMode::Sandbox);
        result.git_before = Some(baseline.clone());

        match sandbox_git.create_snapshot(&snapshot_message(plan)) {
            Ok(after) => result.git_after = Some(after),
            Err(e) => warn!(error = %e, "sandbox snapshot failed"),
        }
        match self.filtered_diff(&sandbox_git, &baseline) {
            Ok(diff) => {
                result.changes = diff.files.clone();
                result.diff = Some(diff);
            }
            Err(e) => warn!(error = %e, "sandbox diff failed"),
        }

        info!(
            success = result.success,
            changes = result.changes.len(),
            "sandbox execution finished"
        );
        Ok(result)
    }

    fn execute_live(&self, plan: &Plan) -> ExecutionResult {
        let exec_dir = resolve(&self.work_dir, &plan.cwd);
        let tracked = self.git.is_repo();
        let before = if tracked { self.git.current_commit().ok() } else { None };

        warn!(command = %plan.command_line(), dir = %exec_dir.display(), "executing live");
        let mut result = self.launch(plan, &exec_dir, ExecutionMode::Live);
        result.git_before = before.clone();

        if tracked {
            match self.git.create_snapshot(&snapshot_message(plan)) {
                Ok(after) => result.git_after = Some(after),
                Err(e) => warn!(error = %e, "live snapshot failed"),
            }
            if let Some(before) = &before {
                match self.git.get_diff(Some(before)) {
                    Ok(diff) => {
                        result.changes = diff.files.clone();
                        result.diff = Some(diff);
                    }
                    Err(e) => warn!(error = %e, "live diff failed"),
                }
            }
        }
        result
    }

    fn launch(&self, plan: &Plan, exec_dir: &Path, mode: ExecutionMode) -> ExecutionResult {
        let outcome = self.launcher.launch(&ProcessSpec {
            argv: &plan.command,
            cwd: exec_dir,
            timeout: self.timeout,
            max_output_bytes: self.max_output_bytes,
        });

        ExecutionResult {
            success: outcome.success(),
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            duration_ms: outcome.duration.as_millis() as u64,
            command: plan.command.clone(),
            cwd: plan.cwd.clone(),
            mode,
            git_before: None,
            git_after: None,
            diff: None,
            changes: Vec::new(),
            failure: outcome.failure,
        }
    }

    /// Git sees everything in the sandbox; drop paths the ignore rules exclude
    fn filtered_diff(&self, sandbox_git: &GitAdapter, baseline: &str) -> SandboxResult<VcsDiff> {
        let mut diff = sandbox_git
            .get_diff(Some(baseline))
            .map_err(|e| SandboxError::Setup(format!("cannot diff sandbox: {}", e)))?;
        diff.files
            .retain(|f| !self.rules.is_ignored(&from_slash(&f.path)));
        Ok(diff)
    }

    /// Changes in the pending sandbox relative to its baseline
    pub fn sandbox_diff(&self) -> SandboxResult<Option<VcsDiff>> {
        match &self.pending {
            Some(copy) => Ok(Some(self.filtered_diff(&self.git.at(&copy.path), &copy.baseline)?)),
            None => Ok(None),
        }
    }

    /// Copy the pending sandbox's changes into the live directory.
    ///
    /// The diff is taken from the baseline recorded when the sandbox was
    /// made, so it covers every change regardless of how many snapshots
    /// were taken since. The sandbox is removed afterwards.
    pub fn apply_sandbox_to_live(&mut self) -> SandboxResult<ApplyReport> {
        let copy = self
            .pending
            .clone()
            .ok_or_else(|| SandboxError::State("no pending sandbox to apply".into()))?;
        if !copy.path.exists() {
            self.pending = None;
            return Err(SandboxError::State(format!(
                "sandbox {} no longer exists",
                copy.path.display()
            )));
        }

        let diff = self.filtered_diff(&self.git.at(&copy.path), &copy.baseline)?;
        info!(count = diff.files.len(), "applying sandbox to live directory");

        let mut applied: Vec<FileChange> = Vec::with_capacity(diff.files.len());
        for change in diff.files {
            let relative = from_slash(&change.path);
            let source = copy.path.join(&relative);
            let target = self.work_dir.join(&relative);

            let outcome = match change.kind {
                _ if !resolves_inside(&self.work_dir, &target) => Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "target resolves outside the live directory",
                )),
                ChangeKind::Added | ChangeKind::Modified => target
                    .parent()
                    .map_or(Ok(()), fs::create_dir_all)
                    .and_then(|_| fs::copy(&source, &target).map(|_| ())),
                ChangeKind::Deleted if target.exists() => fs::remove_file(&target),
                ChangeKind::Deleted => Ok(()),
            };
            if let Err(source_err) = outcome {
                warn!(path = %change.path, error = %source_err, "apply aborted");
                return Err(SandboxError::Apply {
                    path: relative,
                    applied: applied.into_iter().map(|c| c.path).collect(),
                    source: source_err,
                });
            }
            applied.push(change);
        }

        let snapshot = if !applied.is_empty() && self.git.is_repo() {
            self.git
                .create_snapshot("plan-sandbox: applied sandbox changes")
                .map_err(|e| warn!(error = %e, "live snapshot after apply failed"))
                .ok()
        } else {
            None
        };

        self.discard_sandbox();
        Ok(ApplyReport { applied, snapshot })
    }

    /// Remove the pending sandbox, if any. The live directory is untouched.
    pub fn discard_sandbox(&mut self) {
        if let Some(copy) = self.pending.take() {
            if let Err(e) = self.git.cleanup_sandbox(&copy.path) {
                warn!(sandbox = %copy.path.display(), error = %e, "could not remove sandbox");
            } else {
                debug!(sandbox = %copy.path.display(), "sandbox removed");
            }
        }
    }
}

impl Drop for SandboxRunner {
    fn drop(&mut self) {
        self.discard_sandbox();
    }
}

fn resolve(root: &Path, cwd: &str) -> PathBuf {
    if cwd == "." {
        root.to_path_buf()
    } else {
        root.join(cwd)
    }
}

fn snapshot_message(plan: &Plan) -> String {
    format!("plan-sandbox: after '{}'", plan.intent)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{run_process, ProcessOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLauncher {
        launches: AtomicUsize,
    }

    impl CommandLauncher for CountingLauncher {
        fn launch(&self, spec: &ProcessSpec<'_>) -> ProcessOutcome {
            self.launches.fetch_add(1, Ordering::SeqCst);
            run_process(spec)
        }
    }

    fn setup(files: &[(&str, &str)]) -> (tempfile::TempDir, SandboxConfig, Arc<CountingLauncher>) {
        let dir = tempfile::tempdir().unwrap();
        for (rel, content) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let config = SandboxConfig {
            work_dir: dir.path().to_path_buf(),
            ..SandboxConfig::default()
        };
        (dir, config, Arc::new(CountingLauncher::default()))
    }

    fn sh(intent: &str, script: &str) -> Plan {
        Plan::new(intent, &["sh", "-c", script])
    }

    #[test]
    fn preview_flags_danger_and_missing_dir() {
        let (_dir, config, launcher) = setup(&[]);
        let runner = SandboxRunner::with_launcher(&config, launcher.clone());

        let preview = runner.preview(&Plan::new("wipe", &["rm", "-rf", "build"]).with_cwd("nope"));
        assert_eq!(preview.warnings.len(), 2);
        assert!(!preview.target_exists);
        assert!(preview.text.contains("WARNINGS:"));
        assert!(preview.text.contains("Directory does not exist"));
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dry_run_never_launches() {
        let (dir, config, launcher) = setup(&[("a.txt", "a")]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher.clone());

        let result = runner
            .execute(&sh("remove", "rm a.txt"), ExecutionMode::DryRun)
            .unwrap();
        assert!(result.success);
        assert!(result.stdout.contains("COMMAND PREVIEW"));
        assert!(dir.path().join("a.txt").exists());
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn invalid_plan_is_rejected_before_launch() {
        let (_dir, config, launcher) = setup(&[]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher.clone());

        let mut plan = Plan::new("list", &["ls"]);
        plan.version = "2.0".into();
        let err = runner.execute(&plan, ExecutionMode::Live).unwrap_err();
        assert_eq!(err.kind(), "plan_validation");
        assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn live_without_repository_has_no_markers() {
        let (dir, config, launcher) = setup(&[]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher);

        let result = runner
            .execute(&sh("touch", "echo hi > out.txt"), ExecutionMode::Live)
            .unwrap();
        assert!(result.success);
        assert!(dir.path().join("out.txt").exists());
        assert!(result.git_before.is_none());
        assert!(result.git_after.is_none());
    }

    #[test]
    fn sandbox_run_then_apply() {
        let (dir, config, launcher) = setup(&[("keep.txt", "keep\n"), ("gone.txt", "bye\n")]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher);
        if !runner.git().is_available() {
            return;
        }

        let result = runner
            .execute(
                &sh("rewrite", "rm -rf gone.txt && echo more >> keep.txt && echo n > new.txt"),
                ExecutionMode::Sandbox,
            )
            .unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert!(result.git_before.is_some());
        assert_ne!(result.git_before, result.git_after);

        let mut kinds: Vec<(String, ChangeKind)> =
            result.changes.iter().map(|c| (c.path.clone(), c.kind)).collect();
        kinds.sort();
        assert_eq!(
            kinds,
            vec![
                ("gone.txt".to_string(), ChangeKind::Deleted),
                ("keep.txt".to_string(), ChangeKind::Modified),
                ("new.txt".to_string(), ChangeKind::Added),
            ]
        );

        // Live untouched until apply
        assert!(dir.path().join("gone.txt").exists());
        let sandbox = runner.pending_sandbox().unwrap().to_path_buf();

        let report = runner.apply_sandbox_to_live().unwrap();
        assert_eq!(report.applied.len(), 3);
        assert!(!dir.path().join("gone.txt").exists());
        assert_eq!(fs::read_to_string(dir.path().join("keep.txt")).unwrap(), "keep\nmore\n");
        assert!(dir.path().join("new.txt").exists());
        assert!(!sandbox.exists());
        assert!(runner.pending_sandbox().is_none());
    }

    #[test]
    fn ignored_paths_never_reach_changes_or_live() {
        let (dir, config, launcher) = setup(&[("app.py", "print(1)\n")]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher);
        if !runner.git().is_available() {
            return;
        }

        let script = "mkdir -p __pycache__ node_modules && echo c > __pycache__/x.pyc \
                      && echo y > node_modules/y.js && echo 'print(2)' >> app.py";
        let result = runner.execute(&sh("build", script), ExecutionMode::Sandbox).unwrap();
        assert!(result.success, "stderr: {}", result.stderr);
        assert_eq!(result.changed_paths(), vec!["app.py".to_string()]);
        assert_eq!(result.diff.as_ref().unwrap().changed_paths(), vec!["app.py".to_string()]);

        let report = runner.apply_sandbox_to_live().unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("app.py")).unwrap(),
            "print(1)\nprint(2)\n"
        );
        assert!(!dir.path().join("__pycache__").exists());
        assert!(!dir.path().join("node_modules").exists());
    }

    #[test]
    fn new_sandbox_replaces_pending_one() {
        let (dir, config, launcher) = setup(&[("a.txt", "a")]);
        let mut runner = SandboxRunner::with_launcher(&config, launcher);
        if !runner.git().is_available() {
            return;
        }

        runner.execute(&sh("one", "echo 1 > one.txt"), ExecutionMode::Sandbox).unwrap();
        let first = runner.pending_sandbox().unwrap().to_path_buf();
        runner.execute(&sh("two", "echo 2 > two.txt"), ExecutionMode::Sandbox).unwrap();
        assert!(!first.exists());

        let diff = runner.sandbox_diff().unwrap().unwrap();
        assert_eq!(diff.changed_paths(), vec!["two.txt".to_string()]);

        runner.discard_sandbox();
        assert!(runner.sandbox_diff().unwrap().is_none());
        assert!(!dir.path().join("two.txt").exists());
        assert_eq!(runner.apply_sandbox_to_live().unwrap_err().kind(), "state");
    }

    #[test]
    fn sandbox_timeout_is_a_result() {
        let (_dir, mut config, launcher) = setup(&[]);
        config.timeout_secs = 1;
        let mut runner = SandboxRunner::with_launcher(&config, launcher);
        if !runner.git().is_available() {
            return;
        }

        let result = runner
            .execute(&Plan::new("wait", &["sleep", "5"]), ExecutionMode::Sandbox)
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(
            result.failure.map(|f| f.kind),
            Some(crate::process::FailureKind::Timeout)
        );
        runner.discard_sandbox();
    }
}
