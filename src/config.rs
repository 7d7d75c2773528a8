use crate::error::{SandboxError, SandboxResult};
use crate::tree::DEFAULT_IGNORE_PATTERNS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOG_FILE: &str = "sandbox_audit.log";
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How audit entries are encoded on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Which isolation strategy backs sandbox mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Full directory copy, diffed by direct tree comparison
    Copy,
    /// Temp copy tracked by git, diffed between snapshots
    #[default]
    Snapshot,
}

/// Settings for the whole pipeline, loadable from TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SandboxConfig {
    pub work_dir: PathBuf,
    pub log_file: String,
    pub log_format: LogFormat,
    pub timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub auto_approve_safe: bool,
    pub require_sandbox_first: bool,
    pub isolation: IsolationKind,
    pub ignore_patterns: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            log_file: DEFAULT_LOG_FILE.to_string(),
            log_format: LogFormat::Human,
            timeout_secs: 30,
            session_timeout_secs: 60,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            auto_approve_safe: false,
            require_sandbox_first: true,
            isolation: IsolationKind::Snapshot,
            ignore_patterns: DEFAULT_IGNORE_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl SandboxConfig {
    /// Load a config file; unknown keys are rejected, missing keys take defaults
    pub fn load(path: &Path) -> SandboxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SandboxError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SandboxResult<Self> {
        let config: SandboxConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.timeout_secs == 0 || self.session_timeout_secs == 0 {
            return Err(SandboxError::Config("timeouts must be at least 1 second".into()));
        }
        if self.max_output_bytes == 0 {
            return Err(SandboxError::Config("max_output_bytes must be positive".into()));
        }
        if self.log_file.trim().is_empty() {
            return Err(SandboxError::Config("log_file must not be empty".into()));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    /// Absolute-ish path of the audit file inside the work dir
    pub fn log_path(&self) -> PathBuf {
        self.work_dir.join(&self.log_file)
    }
}
