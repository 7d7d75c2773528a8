use clap::{Parser, Subcommand, ValueEnum};
use plan_sandbox::tree::find_orphaned_sandboxes;
use plan_sandbox::{
    ApprovalChoice, Approver, AuditLogger, ExecutionMode, ExecutionResult, Executor, LogFormat,
    LogLock, Outcome, Plan, SandboxConfig, SandboxResult, SandboxRunner, SandboxSession,
    SessionAudit, SessionSettings,
};
use std::io::{self, BufRead, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Config file picked up from the current directory when `--config` is absent
const DEFAULT_CONFIG_FILE: &str = "plan-sandbox.toml";

/// Plan Sandbox - approve, isolate and audit proposed commands
///
/// Runs a JSON command plan in a disposable copy of the working directory,
/// shows the resulting changes, and applies them only on request.
#[derive(Parser)]
#[command(name = "plan-sandbox")]
#[command(version)]
#[command(about = "Sandboxed execution of command plans", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Working directory (overrides the config file)
    #[arg(short = 'd', long, global = true)]
    work_dir: Option<PathBuf>,

    /// Write the audit log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show what a plan would do
    Preview {
        /// Plan file, or `-` for stdin
        plan: PathBuf,
    },
    /// Run a plan through the approval flow
    Run {
        /// Plan file, or `-` for stdin
        plan: PathBuf,
        /// The request the plan was made for, recorded in the audit log
        #[arg(short, long, default_value = "")]
        query: String,
        /// Execute directly in this mode without prompting
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Auto-approve plans the safety policy considers read-only
        #[arg(long)]
        auto: bool,
    },
    /// Run several plans in one copy-based session
    Session {
        /// Plan files, executed in order
        #[arg(required = true)]
        plans: Vec<PathBuf>,
        /// The request the plans were made for, recorded in the audit log
        #[arg(short, long, default_value = "")]
        query: String,
        /// Apply the changes without asking
        #[arg(long, conflicts_with = "discard")]
        apply: bool,
        /// Discard the changes without asking
        #[arg(long)]
        discard: bool,
    },
    /// Show recent audit log entries
    Log {
        /// Number of entries
        #[arg(short, default_value_t = 5)]
        n: usize,
    },
    /// List leftover session sandboxes next to the working directory
    Orphans,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    DryRun,
    Sandbox,
    Live,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::DryRun => ExecutionMode::DryRun,
            ModeArg::Sandbox => ExecutionMode::Sandbox,
            ModeArg::Live => ExecutionMode::Live,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {}", e);
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Preview { plan } => preview(config, &plan),
        Commands::Run { plan, query, mode, auto } => run(config, &plan, &query, mode, auto),
        Commands::Session {
            plans,
            query,
            apply,
            discard,
        } => session(config, &plans, &query, apply, discard),
        Commands::Log { n } => show_log(&config, n),
        Commands::Orphans => orphans(&config),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(cli: &Cli) -> SandboxResult<SandboxConfig> {
    let mut config = match &cli.config {
        Some(path) => SandboxConfig::load(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).is_file() => SandboxConfig::load(Path::new(DEFAULT_CONFIG_FILE))?,
        None => SandboxConfig::default(),
    };

    if let Some(dir) = &cli.work_dir {
        config.work_dir = dir.clone();
    }
    if cli.json_logs {
        config.log_format = LogFormat::Json;
    }
    config.validate()?;
    Ok(config)
}

fn read_plan(path: &Path) -> SandboxResult<Plan> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    Plan::from_json(&text)
}

/// Reads choices from stdin. End of input counts as a rejection.
struct TerminalApprover;

impl TerminalApprover {
    fn ask(prompt: &str) -> Option<String> {
        print!("{}", prompt);
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line),
        }
    }
}

impl Approver for TerminalApprover {
    fn choose(&mut self, preview: &str) -> ApprovalChoice {
        println!("{}", preview);
        match Self::ask("\nYour choice [Y/L/N/P/M]: ") {
            Some(answer) => ApprovalChoice::parse(&answer),
            None => ApprovalChoice::Reject,
        }
    }

    fn confirm_apply(&mut self, result: &ExecutionResult) -> bool {
        print_result(result);
        println!("\nSandbox execution complete. Changes detected:");
        println!("   Files: {}", result.changed_paths().join(", "));
        Self::ask("\nApply changes to live directory? [Y/N]: ")
            .map(|a| matches!(a.trim().to_uppercase().as_str(), "Y" | "YES"))
            .unwrap_or(false)
    }
}

fn print_result(result: &ExecutionResult) {
    println!("\n{}", "=".repeat(60));
    println!("Command: {}", result.command.join(" "));
    println!("Mode: {}", result.mode);
    println!("Exit Code: {}", result.exit_code);
    println!("Duration: {}ms", result.duration_ms);
    if let Some(failure) = &result.failure {
        println!("Error [{}]: {}", failure.kind.as_str(), failure.message);
    }
    if let (Some(before), Some(after)) = (&result.git_before, &result.git_after) {
        println!("Git: {} -> {}", short(before), short(after));
    }
    if let Some(diff) = &result.diff {
        println!("Diff: +{} -{}", diff.insertions, diff.deletions);
    }
    println!("{}", "=".repeat(60));

    if !result.stdout.is_empty() {
        println!("\nSTDOUT:\n{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        println!("\nSTDERR:\n{}", result.stderr);
    }
}

fn short(commit: &str) -> &str {
    commit.get(..8).unwrap_or(commit)
}

fn preview(config: SandboxConfig, plan_path: &Path) -> SandboxResult<bool> {
    let plan = read_plan(plan_path)?;
    plan.validate()?;
    let preview = SandboxRunner::new(&config).preview(&plan);
    println!("{}", preview.text);
    Ok(true)
}

fn run(
    config: SandboxConfig,
    plan_path: &Path,
    query: &str,
    mode: Option<ModeArg>,
    auto: bool,
) -> SandboxResult<bool> {
    let plan = read_plan(plan_path)?;
    let mut executor = Executor::new(config, LogLock::new())?;
    let mut approver = TerminalApprover;

    if let Some(mode) = mode {
        let mode = ExecutionMode::from(mode);
        info!("Executing: {} (mode: {})", plan.command_line(), mode);
        let result = executor.quick_execute(query, &plan, mode)?;
        print_result(&result);

        if mode == ExecutionMode::Sandbox && result.has_changes() {
            if approver.confirm_apply(&result) {
                let report = executor.apply_pending()?;
                println!("Applied {} change(s) to live directory", report.applied.len());
            } else {
                executor.discard_pending();
                println!("Sandbox changes discarded");
            }
        } else {
            executor.discard_pending();
        }
        return Ok(result.success);
    }

    let outcome = if auto {
        executor.execute_auto(query, &plan, &mut approver)?
    } else {
        executor.execute_with_approval(query, &plan, &mut approver)?
    };

    match outcome {
        Outcome::Executed { result, applied } => {
            match applied {
                Some(true) => println!("Changes applied to live directory"),
                Some(false) => println!("Sandbox changes discarded"),
                None => {
                    print_result(&result);
                    if result.mode == ExecutionMode::Sandbox {
                        println!("\nCommand executed (no file changes applied)");
                    }
                }
            }
            Ok(result.success)
        }
        Outcome::Rejected => {
            println!("Command rejected");
            Ok(true)
        }
        Outcome::ModifyRequested => {
            println!("Modification requested; revise the plan and run again");
            Ok(true)
        }
    }
}

fn session(
    config: SandboxConfig,
    plan_paths: &[PathBuf],
    query: &str,
    apply: bool,
    discard: bool,
) -> SandboxResult<bool> {
    let plans = plan_paths
        .iter()
        .map(|p| read_plan(p.as_path()))
        .collect::<SandboxResult<Vec<Plan>>>()?;
    let logger = AuditLogger::new(config.log_path(), config.log_format, LogLock::new())?;
    let mut audit = SessionAudit::new(&logger, query);

    let mut session = SandboxSession::new(&config.work_dir, SessionSettings::from_config(&config));
    if let Err(e) = session.start() {
        let _ = session.discard();
        if let Some(first) = plans.first() {
            audit.record_error(first, &e);
        }
        audit.finish(false, None)?;
        return Err(e);
    }
    if let Some(path) = session.sandbox_path() {
        println!("Sandbox: {}", path.display());
    }

    let mut all_ok = true;
    for plan in &plans {
        let run = session
            .run_plan(plan)
            .and_then(|result| Ok((session.get_changes()?, result)));
        match run {
            Ok((changes, result)) => {
                all_ok &= result.success;
                audit.record(plan, &result, &changes);
                if !result.stdout.is_empty() {
                    println!("{}", result.stdout);
                }
                if !result.stderr.is_empty() {
                    eprintln!("{}", result.stderr);
                }
            }
            Err(e) => {
                let _ = session.discard();
                audit.record_error(plan, &e);
                audit.finish(false, None)?;
                return Err(e);
            }
        }
    }

    println!("\n{}\n", session.show_history());
    println!("{}", session.show_changes()?);

    let should_apply = if apply {
        true
    } else if discard {
        false
    } else {
        TerminalApprover::ask("\nApply changes to original directory? [Y/N]: ")
            .map(|a| matches!(a.trim().to_uppercase().as_str(), "Y" | "YES"))
            .unwrap_or(false)
    };

    if should_apply {
        match session.apply_changes() {
            Ok(report) => {
                audit.finish(true, None)?;
                println!("Applied {} change(s)", report.applied.len());
            }
            Err(e) => {
                // the sandbox stays on disk; `orphans` lists it
                audit.finish(false, Some(&e))?;
                return Err(e);
            }
        }
    } else {
        session.discard()?;
        audit.finish(false, None)?;
        println!("Sandbox discarded");
    }
    Ok(all_ok)
}

fn show_log(config: &SandboxConfig, n: usize) -> SandboxResult<bool> {
    let logger = AuditLogger::new(config.log_path(), config.log_format, LogLock::new())?;
    let entries = logger.read_recent(n)?;
    if entries.is_empty() {
        println!("No audit entries in {}", logger.path().display());
    }
    for entry in entries {
        println!("{}\n", entry);
    }
    Ok(true)
}

fn orphans(config: &SandboxConfig) -> SandboxResult<bool> {
    let work_dir = std::fs::canonicalize(&config.work_dir)?;
    let Some(parent) = work_dir.parent() else {
        println!("No parent directory to search");
        return Ok(true);
    };

    let found = find_orphaned_sandboxes(parent)?;
    if found.is_empty() {
        println!("No leftover sandboxes in {}", parent.display());
    } else {
        println!("Leftover sandboxes (not removed):");
        for path in found {
            println!("  {}", path.display());
        }
    }
    Ok(true)
}
