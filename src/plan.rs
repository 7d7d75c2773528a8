use crate::error::{SandboxError, SandboxResult};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// The only plan version this crate accepts
pub const PLAN_VERSION: &str = "1.0";

/// One command to run, as emitted by the translation layer.
///
/// `inputs` and `outputs` are advisory and never enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub version: String,
    pub intent: String,
    pub command: Vec<String>,
    #[serde(default = "default_cwd")]
    pub cwd: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub explain: String,
    #[serde(default)]
    pub needs_clarification: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
}

fn default_cwd() -> String {
    ".".to_string()
}

impl Plan {
    /// Build a minimal valid plan, mostly useful for programmatic callers
    pub fn new(intent: &str, command: &[&str]) -> Self {
        Self {
            version: PLAN_VERSION.to_string(),
            intent: intent.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            cwd: default_cwd(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            explain: String::new(),
            needs_clarification: false,
            question: None,
        }
    }

    pub fn with_cwd(mut self, cwd: &str) -> Self {
        self.cwd = cwd.to_string();
        self
    }

    pub fn with_explain(mut self, explain: &str) -> Self {
        self.explain = explain.to_string();
        self
    }

    pub fn needing_clarification(mut self, question: &str) -> Self {
        self.needs_clarification = true;
        self.question = Some(question.to_string());
        self
    }

    /// Parse a plan. Shape errors surface as `InvalidPlan`; version is checked by `validate`.
    pub fn from_json(input: &str) -> SandboxResult<Self> {
        serde_json::from_str(input).map_err(|e| SandboxError::InvalidPlan(e.to_string()))
    }

    pub fn validate(&self) -> SandboxResult<()> {
        if self.version != PLAN_VERSION {
            return Err(SandboxError::UnsupportedPlanVersion {
                found: self.version.clone(),
                supported: PLAN_VERSION.to_string(),
            });
        }

        match self.command.first() {
            None => return Err(SandboxError::InvalidPlan("command must not be empty".into())),
            Some(program) if program.trim().is_empty() => {
                return Err(SandboxError::InvalidPlan("program name is blank".into()))
            }
            _ => {}
        }

        validate_relative_cwd(&self.cwd)
    }

    /// Flattened argv, used for display and pattern scanning
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// A cwd must stay inside whatever root it is resolved against
pub fn validate_relative_cwd(cwd: &str) -> SandboxResult<()> {
    let path = Path::new(cwd);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(SandboxError::InvalidPlan(format!(
                    "cwd '{}' escapes the working directory",
                    cwd
                )))
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(SandboxError::InvalidPlan(format!(
                    "cwd '{}' must be relative",
                    cwd
                )))
            }
        }
    }
    Ok(())
}
