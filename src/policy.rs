use crate::plan::Plan;
use serde::{Deserialize, Serialize};

/// A substring that marks a command as potentially destructive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DangerPattern {
    pub pattern: &'static str,
    pub warning: &'static str,
}

/// Checked in order against the lowercased, space-joined argv.
/// Matches are advisory: they are shown in previews and never block execution.
pub const DANGER_PATTERNS: &[DangerPattern] = &[
    DangerPattern { pattern: "rm -rf", warning: "Recursive force delete detected" },
    DangerPattern { pattern: "rm -r", warning: "Recursive delete detected" },
    DangerPattern { pattern: "del /s", warning: "Windows recursive delete detected" },
    DangerPattern { pattern: "format", warning: "Disk format command detected" },
    DangerPattern { pattern: "mkfs", warning: "Filesystem creation detected" },
    DangerPattern { pattern: "> /dev/", warning: "Writing to device detected" },
    DangerPattern { pattern: "dd if=", warning: "Disk dump command detected" },
    DangerPattern { pattern: "chmod 777", warning: "Overly permissive chmod detected" },
    DangerPattern { pattern: "sudo", warning: "Sudo/elevated privileges detected" },
    DangerPattern { pattern: "powershell", warning: "PowerShell execution detected" },
    DangerPattern { pattern: ":(){:|:&};:", warning: "Fork bomb detected" },
    DangerPattern { pattern: "shutdown", warning: "Shutdown command detected" },
    DangerPattern { pattern: "reboot", warning: "Reboot command detected" },
];

/// Tokens that make a plan ineligible for auto-approval
pub const DEFAULT_DENYLIST: &[&str] = &[
    "rm", "del", "remove", "delete", "write", "create", "mv", "move", "cp", "copy", ">", ">>",
];

/// Advisory warnings for an argv, in pattern order
pub fn scan_command(argv: &[String]) -> Vec<String> {
    let flattened = argv.join(" ").to_lowercase();
    DANGER_PATTERNS
        .iter()
        .filter(|p| flattened.contains(p.pattern))
        .map(|p| p.warning.to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Safe,
    Unsafe,
    NeedsClarification,
}

/// Decides whether a plan may skip the human prompt
pub trait ApprovalPolicy: Send + Sync {
    fn classify(&self, plan: &Plan) -> Classification;
}

/// Substring matching on intent and argv.
///
/// False positives (`format` contains `rm`) and false negatives are accepted;
/// a stronger classifier can be swapped in through [`ApprovalPolicy`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeuristicPolicy {
    denylist: Vec<String>,
}

impl HeuristicPolicy {
    pub fn new() -> Self {
        Self {
            denylist: DEFAULT_DENYLIST.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn deny_token(mut self, token: &str) -> Self {
        self.denylist.push(token.to_lowercase());
        self
    }

    pub fn denylist(&self) -> &[String] {
        &self.denylist
    }
}

impl Default for HeuristicPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ApprovalPolicy for HeuristicPolicy {
    fn classify(&self, plan: &Plan) -> Classification {
        if plan.needs_clarification {
            return Classification::NeedsClarification;
        }

        let intent = plan.intent.to_lowercase();
        let command = plan.command_line().to_lowercase();
        let flagged = self
            .denylist
            .iter()
            .any(|token| intent.contains(token.as_str()) || command.contains(token.as_str()));

        if flagged {
            Classification::Unsafe
        } else {
            Classification::Safe
        }
    }
}
