use crate::config::{IsolationKind, SandboxConfig};
use crate::error::{SandboxError, SandboxResult};
use crate::plan::Plan;
use crate::runner::{ExecutionMode, ExecutionResult, SandboxRunner};
use crate::session::{ApplyReport, SandboxSession, SessionSettings};
use std::path::Path;
use tracing::{debug, warn};

/// Copy-based isolation. Holds at most one live session.
pub struct CopyIsolation {
    settings: SessionSettings,
    session: Option<SandboxSession>,
}

impl CopyIsolation {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            session: None,
        }
    }

    fn execute(&mut self, runner: &SandboxRunner, plan: &Plan) -> SandboxResult<ExecutionResult> {
        plan.validate()?;
        self.discard();

        let mut session =
            SandboxSession::with_launcher(runner.work_dir(), self.settings.clone(), runner.launcher());
        if let Err(e) = session.start() {
            // a half-made copy is still on disk
            let _ = session.discard();
            return Err(e);
        }

        let outcome = session.run_plan(plan).and_then(|run| Ok((run, session.get_changes()?)));
        let (run, changes) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                let _ = session.discard();
                return Err(e);
            }
        };
        self.session = Some(session);

        Ok(ExecutionResult {
            success: run.success,
            exit_code: run.exit_code,
            stdout: run.stdout,
            stderr: run.stderr,
            duration_ms: run.duration_ms,
            command: run.command,
            cwd: run.cwd,
            mode: ExecutionMode::Sandbox,
            git_before: None,
            git_after: None,
            diff: None,
            changes,
            failure: run.failure,
        })
    }

    fn apply(&mut self) -> SandboxResult<ApplyReport> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SandboxError::State("no pending sandbox session to apply".into()))?;
        let report = session.apply_changes()?;
        self.session = None;
        Ok(report)
    }

    fn discard(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.discard() {
                warn!(error = %e, "could not discard sandbox session");
            }
        }
    }

    fn pending(&self) -> Option<&Path> {
        self.session.as_ref().and_then(|s| s.sandbox_path())
    }
}

/// How sandbox-mode execution is isolated from the live directory.
///
/// Dry runs and live runs always go through the runner directly.
pub enum IsolatedExecutionStrategy {
    CopyBased(CopyIsolation),
    SnapshotBased,
}

impl IsolatedExecutionStrategy {
    pub fn from_config(config: &SandboxConfig) -> Self {
        match config.isolation {
            IsolationKind::Copy => {
                IsolatedExecutionStrategy::CopyBased(CopyIsolation::new(SessionSettings::from_config(config)))
            }
            IsolationKind::Snapshot => IsolatedExecutionStrategy::SnapshotBased,
        }
    }

    pub fn kind(&self) -> IsolationKind {
        match self {
            IsolatedExecutionStrategy::CopyBased(_) => IsolationKind::Copy,
            IsolatedExecutionStrategy::SnapshotBased => IsolationKind::Snapshot,
        }
    }

    pub fn execute_isolated(
        &mut self,
        runner: &mut SandboxRunner,
        plan: &Plan,
    ) -> SandboxResult<ExecutionResult> {
        debug!(strategy = ?self.kind(), "isolated execution");
        match self {
            IsolatedExecutionStrategy::CopyBased(copy) => copy.execute(runner, plan),
            IsolatedExecutionStrategy::SnapshotBased => runner.execute(plan, ExecutionMode::Sandbox),
        }
    }

    pub fn apply(&mut self, runner: &mut SandboxRunner) -> SandboxResult<ApplyReport> {
        match self {
            IsolatedExecutionStrategy::CopyBased(copy) => copy.apply(),
            IsolatedExecutionStrategy::SnapshotBased => runner.apply_sandbox_to_live(),
        }
    }

    pub fn discard(&mut self, runner: &mut SandboxRunner) {
        match self {
            IsolatedExecutionStrategy::CopyBased(copy) => copy.discard(),
            IsolatedExecutionStrategy::SnapshotBased => runner.discard_sandbox(),
        }
    }

    pub fn pending<'a>(&'a self, runner: &'a SandboxRunner) -> Option<&'a Path> {
        match self {
            IsolatedExecutionStrategy::CopyBased(copy) => copy.pending(),
            IsolatedExecutionStrategy::SnapshotBased => runner.pending_sandbox(),
        }
    }
}
