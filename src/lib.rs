//! Plan Sandbox - approve, isolate and audit machine-proposed commands
//!
//! Runs a structured command plan inside a disposable copy of the working
//! directory, shows what changed, and only touches the real directory when
//! the change set is explicitly applied.
//!
//! # Features
//!
//! - **Two isolation strategies**: a sibling directory copy diffed file by file, or a
//!   git-tracked temp copy diffed between snapshots
//! - **Approval flow**: preview, sandbox, live, reject or modify
//! - **Advisory safety scan**: dangerous patterns are flagged in the preview
//! - **Audit log**: one append-only entry per decision, human-readable or JSON lines
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use plan_sandbox::{ExecutionMode, Executor, LogLock, Plan, SandboxConfig};
//!
//! let mut executor = Executor::new(SandboxConfig::default(), LogLock::new())?;
//! let plan = Plan::new("list files", &["ls", "-la"]);
//!
//! // Run in a sandbox; nothing reaches the working directory yet
//! let result = executor.quick_execute("show me the files", &plan, ExecutionMode::Sandbox)?;
//! println!("{}", result.stdout);
//! executor.discard_pending();
//! # Ok::<(), plan_sandbox::SandboxError>(())
//! ```

pub mod audit;
pub mod config;
pub mod diff_engine;
pub mod error;
pub mod executor;
pub mod plan;
pub mod policy;
pub mod process;
pub mod runner;
pub mod session;
pub mod strategy;
pub mod tree;
pub mod vcs;

// Re-export main types
pub use audit::{AuditLogger, FailureDetail, LogEntry, LogLock, LogMode, SessionAudit};
pub use config::{IsolationKind, LogFormat, SandboxConfig};
pub use diff_engine::{DiffEngine, DiffSummary};
pub use error::{SandboxError, SandboxResult};
pub use executor::{ApprovalChoice, Approver, Executor, Outcome};
pub use plan::{Plan, PLAN_VERSION};
pub use policy::{scan_command, ApprovalPolicy, Classification, HeuristicPolicy};
pub use process::{CommandLauncher, ExecFailure, FailureKind, SystemLauncher};
pub use runner::{ExecutionMode, ExecutionResult, Preview, SandboxRunner};
pub use session::{ApplyReport, CommandResult, SandboxSession, SessionPhase, SessionSettings};
pub use strategy::{CopyIsolation, IsolatedExecutionStrategy};
pub use tree::{ChangeKind, DiffContent, FileChange, IgnoreRules};
pub use vcs::{GitAdapter, VcsDiff, VcsError};
