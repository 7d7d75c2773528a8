use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    /// Source missing, copy failed, or the version-control adapter is unusable.
    #[error("Sandbox setup failed: {0}")]
    Setup(String),

    /// Caller misuse: the session is unstarted or already terminal.
    #[error("Invalid session state: {0}")]
    State(String),

    /// IO failure in the middle of an apply. `applied` lists what was already committed.
    #[error("Apply aborted at {}: {source} ({} change(s) already applied)", path.display(), applied.len())]
    Apply {
        path: PathBuf,
        applied: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("Unsupported plan version '{found}' (supported: {supported})")]
    UnsupportedPlanVersion { found: String, supported: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}

impl SandboxError {
    /// Stable classification recorded in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            SandboxError::Setup(_) => "setup",
            SandboxError::State(_) => "state",
            SandboxError::Apply { .. } => "apply",
            SandboxError::UnsupportedPlanVersion { .. } | SandboxError::InvalidPlan(_) => {
                "plan_validation"
            }
            SandboxError::Config(_) | SandboxError::TomlError(_) => "config",
            SandboxError::IoError(_) => "io",
            SandboxError::SerdeError(_) => "serialization",
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_group_plan_errors() {
        let err = SandboxError::UnsupportedPlanVersion {
            found: "2.0".into(),
            supported: "1.0".into(),
        };
        assert_eq!(err.kind(), "plan_validation");
        assert_eq!(SandboxError::InvalidPlan("x".into()).kind(), "plan_validation");
        assert_eq!(SandboxError::State("done".into()).kind(), "state");
    }

    #[test]
    fn apply_error_reports_partial_progress() {
        let err = SandboxError::Apply {
            path: PathBuf::from("a.txt"),
            applied: vec!["b.txt".into(), "c.txt".into()],
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("a.txt"));
        assert!(msg.contains("2 change(s)"));
    }
}
