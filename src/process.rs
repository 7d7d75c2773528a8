//! Child process execution with a wall-clock timeout and capped output.
//!
//! Nothing here returns an error: launch failures, timeouts and OS errors
//! all come back as a [`ProcessOutcome`] with a [`ExecFailure`] attached.

use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for pipe readers once the child has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Readers may still be blocked by grandchildren holding the pipe after a kill
const KILL_GRACE: Duration = Duration::from_millis(200);

/// Classification of an execution that did not produce a normal exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    NotFound,
    PermissionDenied,
    LaunchError,
    EmptyCommand,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::NotFound => "not_found",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::LaunchError => "launch_error",
            FailureKind::EmptyCommand => "empty_command",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// What to run and under which limits
#[derive(Debug, Clone, Copy)]
pub struct ProcessSpec<'a> {
    pub argv: &'a [String],
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub failure: Option<ExecFailure>,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        self.failure.is_none() && self.exit_code == 0
    }

    fn failed(failure: ExecFailure, started: Instant) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration: started.elapsed(),
            failure: Some(failure),
        }
    }
}

/// Seam for process creation so callers can substitute or observe launches
pub trait CommandLauncher: Send + Sync {
    fn launch(&self, spec: &ProcessSpec<'_>) -> ProcessOutcome;
}

/// Launches real OS processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLauncher;

impl CommandLauncher for SystemLauncher {
    fn launch(&self, spec: &ProcessSpec<'_>) -> ProcessOutcome {
        run_process(spec)
    }
}

/// Spawn argv (no shell), enforce the timeout and collect capped output
pub fn run_process(spec: &ProcessSpec<'_>) -> ProcessOutcome {
    let started = Instant::now();
    let argv = prepare_argv(spec.argv);

    let Some((program, args)) = argv.split_first() else {
        return ProcessOutcome::failed(
            ExecFailure::new(FailureKind::EmptyCommand, "Empty command"),
            started,
        );
    };

    let mut child = match Command::new(program)
        .args(args)
        .current_dir(spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(e) => return ProcessOutcome::failed(classify_launch_error(program, &e), started),
    };

    let stdout = child
        .stdout
        .take()
        .map(|pipe| StreamCapture::start(pipe, spec.max_output_bytes));
    let stderr = child
        .stderr
        .take()
        .map(|pipe| StreamCapture::start(pipe, spec.max_output_bytes));

    let deadline = started + spec.timeout;
    let waited = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break Err(ExecFailure::new(
                        FailureKind::Timeout,
                        format!("Command timed out after {}s", spec.timeout.as_secs_f64()),
                    ));
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                break Err(ExecFailure::new(
                    FailureKind::LaunchError,
                    format!("failed to wait for '{}': {}", program, e),
                ));
            }
        }
    };

    let grace = if waited.is_ok() { DRAIN_GRACE } else { KILL_GRACE };
    let stdout = stdout.map(|c| c.finish(grace)).unwrap_or_default();
    let stderr = stderr.map(|c| c.finish(grace)).unwrap_or_default();

    match waited {
        Ok(status) => ProcessOutcome {
            // Signal-terminated children have no code
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
            duration: started.elapsed(),
            failure: None,
        },
        Err(failure) => {
            tracing::warn!(program = %program, kind = failure.kind.as_str(), "{}", failure.message);
            ProcessOutcome {
                exit_code: -1,
                stdout,
                stderr,
                duration: started.elapsed(),
                failure: Some(failure),
            }
        }
    }
}

fn classify_launch_error(program: &str, err: &std::io::Error) -> ExecFailure {
    match err.kind() {
        std::io::ErrorKind::NotFound => {
            ExecFailure::new(FailureKind::NotFound, format!("Command not found: {}", program))
        }
        std::io::ErrorKind::PermissionDenied => ExecFailure::new(
            FailureKind::PermissionDenied,
            format!("Permission denied launching {}: {}", program, err),
        ),
        _ => ExecFailure::new(
            FailureKind::LaunchError,
            format!("Execution error launching {}: {}", program, err),
        ),
    }
}

/// Only an explicit `bash -c` wrapper gets shell treatment, and only on Windows
fn prepare_argv(argv: &[String]) -> Vec<String> {
    #[cfg(windows)]
    {
        if argv.len() >= 3 && argv[0] == "bash" && (argv[1] == "-c" || argv[1] == "-lc") {
            let git_bash = r"C:\Program Files\Git\bin\bash.exe";
            if Path::new(git_bash).exists() {
                return vec![git_bash.to_string(), argv[1].clone(), argv[2].clone()];
            }
            return vec!["cmd".to_string(), "/c".to_string(), argv[2].clone()];
        }
    }
    argv.to_vec()
}

/// Drains one pipe on a background thread, keeping at most `cap` bytes
struct StreamCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    done: mpsc::Receiver<()>,
}

impl StreamCapture {
    fn start<R: Read + Send + 'static>(mut reader: R, cap: usize) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&buf);
        let (tx, done) = mpsc::channel();

        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Ok(mut held) = sink.lock() {
                            let room = cap.saturating_sub(held.len());
                            held.extend_from_slice(&chunk[..n.min(room)]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });

        Self { buf, done }
    }

    fn finish(self, grace: Duration) -> String {
        let _ = self.done.recv_timeout(grace);
        let bytes = self.buf.lock().map(|held| held.clone()).unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
