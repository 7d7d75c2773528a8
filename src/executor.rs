//! Approval flow tying the runner, isolation strategy and audit log together.
//!
//! Every terminal outcome of a request writes exactly one audit entry:
//! a validation or setup error, a rejection, a modify request, or an
//! execution together with its apply decision.

use crate::audit::{AuditLogger, LogEntry, LogLock, LogMode};
use crate::config::SandboxConfig;
use crate::error::{SandboxError, SandboxResult};
use crate::plan::Plan;
use crate::policy::{ApprovalPolicy, Classification, HeuristicPolicy};
use crate::process::{CommandLauncher, SystemLauncher};
use crate::runner::{ExecutionMode, ExecutionResult, SandboxRunner};
use crate::session::ApplyReport;
use crate::strategy::IsolatedExecutionStrategy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalChoice {
    ApproveSandbox,
    ApproveLive,
    Reject,
    Preview,
    Modify,
}

impl ApprovalChoice {
    /// Unrecognised input means "run it in the sandbox"
    pub fn parse(input: &str) -> Self {
        match input.trim().to_uppercase().as_str() {
            "L" | "LIVE" | "DIRECT" => ApprovalChoice::ApproveLive,
            "N" | "NO" | "REJECT" | "CANCEL" => ApprovalChoice::Reject,
            "P" | "PREVIEW" | "DETAILS" => ApprovalChoice::Preview,
            "M" | "MODIFY" => ApprovalChoice::Modify,
            _ => ApprovalChoice::ApproveSandbox,
        }
    }
}

/// The human (or script) deciding what happens to a plan
pub trait Approver {
    fn choose(&mut self, preview: &str) -> ApprovalChoice;

    /// Asked only when a sandbox run succeeded and changed something
    fn confirm_apply(&mut self, result: &ExecutionResult) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Executed {
        result: ExecutionResult,
        /// `None` when there was nothing to apply
        applied: Option<bool>,
    },
    Rejected,
    /// The caller should send the plan back for revision
    ModifyRequested,
}

pub struct Executor {
    config: SandboxConfig,
    runner: SandboxRunner,
    strategy: IsolatedExecutionStrategy,
    logger: AuditLogger,
    policy: Box<dyn ApprovalPolicy>,
    /// Entry of a quick sandbox run, written once the sandbox is applied or discarded
    pending_entry: Option<LogEntry>,
}

impl Executor {
    pub fn new(config: SandboxConfig, lock: LogLock) -> SandboxResult<Self> {
        Self::with_launcher(config, lock, Arc::new(SystemLauncher))
    }

    pub fn with_launcher(
        config: SandboxConfig,
        lock: LogLock,
        launcher: Arc<dyn CommandLauncher>,
    ) -> SandboxResult<Self> {
        config.validate()?;
        let logger = AuditLogger::new(config.log_path(), config.log_format, lock)?;
        let runner = SandboxRunner::with_launcher(&config, launcher);
        let strategy = IsolatedExecutionStrategy::from_config(&config);

        info!(
            work_dir = %config.work_dir.display(),
            isolation = ?strategy.kind(),
            log = %logger.path().display(),
            "executor ready"
        );
        Ok(Self {
            config,
            runner,
            strategy,
            logger,
            policy: Box::new(HeuristicPolicy::new()),
            pending_entry: None,
        })
    }

    pub fn with_policy(mut self, policy: Box<dyn ApprovalPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn logger(&self) -> &AuditLogger {
        &self.logger
    }

    pub fn log_path(&self) -> &Path {
        self.logger.path()
    }

    pub fn pending_sandbox(&self) -> Option<&Path> {
        self.strategy.pending(&self.runner)
    }

    /// Runner preview plus the available choices
    pub fn preview(&self, plan: &Plan) -> String {
        let mut lines = vec![
            self.runner.preview(plan).text,
            String::new(),
            "OPTIONS:".to_string(),
            if self.config.require_sandbox_first {
                "  [Y] Approve (run in sandbox first)".to_string()
            } else {
                "  [Y] Approve".to_string()
            },
            "  [L] Run LIVE (skip sandbox, direct execution)".to_string(),
            "  [N] Reject (cancel)".to_string(),
            "  [P] Show more details".to_string(),
            "  [M] Modify (revise the plan)".to_string(),
        ];

        let classification = self.policy.classify(plan);
        if classification == Classification::Safe && self.config.auto_approve_safe {
            lines.push(String::new());
            lines.push("This appears to be a safe read-only command.".to_string());
        }
        if plan.needs_clarification {
            lines.push(String::new());
            lines.push(format!(
                "Clarification needed: {}",
                plan.question.as_deref().unwrap_or("Please confirm.")
            ));
        }
        lines.join("\n")
    }

    fn details(&mut self, plan: &Plan) -> SandboxResult<String> {
        let dry = self.runner.execute(plan, ExecutionMode::DryRun)?;
        let mut text = dry.stdout;
        if !plan.inputs.is_empty() {
            text.push_str(&format!("\nInputs: {}", plan.inputs.join(", ")));
        }
        if !plan.outputs.is_empty() {
            text.push_str(&format!("\nOutputs: {}", plan.outputs.join(", ")));
        }
        text.push_str(&format!("\n\n{}", self.preview(plan)));
        Ok(text)
    }

    /// Validate, logging the failure as this request's only entry
    fn validate_logged(&self, query: &str, plan: &Plan, mode: LogMode) -> SandboxResult<()> {
        if let Err(e) = plan.validate() {
            warn!(error = %e, "plan rejected by validation");
            self.write(self.logger.entry(query, plan, mode).with_error(&e));
            return Err(e);
        }
        Ok(())
    }

    /// An unwritable audit log must not abort an execution that already happened
    fn write(&self, entry: LogEntry) {
        if let Err(e) = self.logger.log(&entry) {
            warn!(error = %e, path = %self.logger.path().display(), "audit entry not written");
        }
    }

    /// Prompt until the approver picks a terminal choice, then act on it
    pub fn execute_with_approval(
        &mut self,
        query: &str,
        plan: &Plan,
        approver: &mut dyn Approver,
    ) -> SandboxResult<Outcome> {
        self.validate_logged(query, plan, LogMode::Rejected)?;

        let mut shown = self.preview(plan);
        loop {
            match approver.choose(&shown) {
                ApprovalChoice::Preview => {
                    shown = self.details(plan)?;
                }
                ApprovalChoice::Reject => {
                    info!(intent = %plan.intent, "plan rejected");
                    self.write(self.logger.entry(query, plan, LogMode::Rejected));
                    return Ok(Outcome::Rejected);
                }
                ApprovalChoice::Modify => {
                    info!(intent = %plan.intent, "modification requested");
                    self.write(self.logger.entry(query, plan, LogMode::Modify));
                    return Ok(Outcome::ModifyRequested);
                }
                ApprovalChoice::ApproveSandbox => return self.run_sandboxed(query, plan, approver),
                ApprovalChoice::ApproveLive => return self.run_live(query, plan),
            }
        }
    }

    /// Skip the prompt for plans the policy calls safe, when configured to
    pub fn execute_auto(
        &mut self,
        query: &str,
        plan: &Plan,
        approver: &mut dyn Approver,
    ) -> SandboxResult<Outcome> {
        let auto = self.config.auto_approve_safe && self.policy.classify(plan) == Classification::Safe;
        if !auto {
            return self.execute_with_approval(query, plan, approver);
        }

        self.validate_logged(query, plan, LogMode::Rejected)?;
        info!(intent = %plan.intent, "auto-approving safe plan");
        if self.config.require_sandbox_first {
            self.run_sandboxed(query, plan, approver)
        } else {
            self.run_live(query, plan)
        }
    }

    fn run_sandboxed(
        &mut self,
        query: &str,
        plan: &Plan,
        approver: &mut dyn Approver,
    ) -> SandboxResult<Outcome> {
        self.discard_pending();
        let entry = self.logger.entry(query, plan, LogMode::Sandbox).approved(true);
        let result = match self.strategy.execute_isolated(&mut self.runner, plan) {
            Ok(result) => result,
            Err(e) => {
                self.write(entry.with_error(&e));
                return Err(e);
            }
        };
        let mut entry = entry.with_result(&result);

        let applied = if result.success && result.has_changes() {
            if approver.confirm_apply(&result) {
                if let Err(e) = self.strategy.apply(&mut self.runner) {
                    self.write(entry.applied(false).with_error(&e));
                    return Err(e);
                }
                Some(true)
            } else {
                self.strategy.discard(&mut self.runner);
                Some(false)
            }
        } else {
            self.strategy.discard(&mut self.runner);
            None
        };

        if let Some(applied) = applied {
            entry = entry.applied(applied);
        }
        self.write(entry);
        Ok(Outcome::Executed { result, applied })
    }

    fn run_live(&mut self, query: &str, plan: &Plan) -> SandboxResult<Outcome> {
        let result = self.run_logged(query, plan, ExecutionMode::Live)?;
        Ok(Outcome::Executed {
            result,
            applied: None,
        })
    }

    fn run_logged(&mut self, query: &str, plan: &Plan, mode: ExecutionMode) -> SandboxResult<ExecutionResult> {
        let entry = self.logger.entry(query, plan, mode.into()).approved(true);
        let outcome = match mode {
            ExecutionMode::Sandbox => {
                self.discard_pending();
                self.strategy.execute_isolated(&mut self.runner, plan)
            }
            other => self.runner.execute(plan, other),
        };
        match outcome {
            Ok(result) => {
                let entry = entry.with_result(&result);
                if mode == ExecutionMode::Sandbox && self.pending_sandbox().is_some() {
                    self.pending_entry = Some(entry);
                } else {
                    self.write(entry);
                }
                Ok(result)
            }
            Err(e) => {
                self.write(entry.with_error(&e));
                Err(e)
            }
        }
    }

    /// Run without asking. A sandbox run stays pending for
    /// [`apply_pending`](Self::apply_pending) or [`discard_pending`](Self::discard_pending),
    /// and its audit entry is written with that decision.
    pub fn quick_execute(&mut self, query: &str, plan: &Plan, mode: ExecutionMode) -> SandboxResult<ExecutionResult> {
        self.validate_logged(query, plan, mode.into())?;
        self.run_logged(query, plan, mode)
    }

    pub fn apply_pending(&mut self) -> SandboxResult<ApplyReport> {
        if self.pending_sandbox().is_none() {
            return Err(SandboxError::State("no pending sandbox to apply".into()));
        }
        match self.strategy.apply(&mut self.runner) {
            Ok(report) => {
                info!(applied = report.applied.len(), "pending sandbox applied");
                if let Some(entry) = self.pending_entry.take() {
                    self.write(entry.applied(true));
                }
                Ok(report)
            }
            Err(e) => {
                if let Some(entry) = self.pending_entry.take() {
                    self.write(entry.applied(false).with_error(&e));
                }
                Err(e)
            }
        }
    }

    pub fn discard_pending(&mut self) {
        self.strategy.discard(&mut self.runner);
        if let Some(entry) = self.pending_entry.take() {
            let entry = if entry.changed_files.is_empty() {
                entry
            } else {
                entry.applied(false)
            };
            self.write(entry);
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.discard_pending();
    }
}
