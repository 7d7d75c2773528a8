use crate::tree::{ChangeKind, DiffContent, FileChange};
use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Upper bound on diff lines kept per file
pub const MAX_DIFF_LINES: usize = 100;

/// Lines of each file diff shown in a change report
const REPORT_DIFF_LINES: usize = 20;

/// Diff engine for computing file differences
pub struct DiffEngine;

impl DiffEngine {
    /// Unified diff between two texts, cut to at most `max_lines` lines
    pub fn unified_lines(
        old: &str,
        new: &str,
        old_label: &str,
        new_label: &str,
        max_lines: usize,
    ) -> Vec<String> {
        let diff = TextDiff::from_lines(old, new);
        let rendered = diff
            .unified_diff()
            .context_radius(3)
            .header(old_label, new_label)
            .to_string();

        rendered
            .lines()
            .take(max_lines)
            .map(str::to_string)
            .collect()
    }

    /// Split raw text into at most `max_lines` lines
    pub fn bounded_lines(text: &str, max_lines: usize) -> Vec<String> {
        text.lines().take(max_lines).map(str::to_string).collect()
    }

    /// Human-readable summary of a change set, grouped by kind
    pub fn render_changes(changes: &[FileChange]) -> String {
        if changes.is_empty() {
            return "No changes detected between original and sandbox.".to_string();
        }

        let pick = |kind: ChangeKind| -> Vec<&FileChange> {
            changes.iter().filter(|c| c.kind == kind).collect()
        };
        let added = pick(ChangeKind::Added);
        let modified = pick(ChangeKind::Modified);
        let deleted = pick(ChangeKind::Deleted);

        let mut output = String::new();
        output.push_str(&format!("{}\nSANDBOX CHANGES\n{}\n\n", "=".repeat(60), "=".repeat(60)));

        if !added.is_empty() {
            output.push_str(&format!("Added ({} files):\n", added.len()));
            for change in &added {
                output.push_str(&format!("   + {}\n", change.path));
            }
            output.push('\n');
        }

        if !modified.is_empty() {
            output.push_str(&format!("Modified ({} files):\n", modified.len()));
            for change in &modified {
                output.push_str(&format!("   ~ {}", change.path));
                match &change.content {
                    DiffContent::Text(lines) => {
                        output.push_str(&format!(" ({})\n", DiffSummary::from_unified(lines).format()));
                        for line in lines.iter().take(REPORT_DIFF_LINES) {
                            output.push_str(&format!("      {}\n", line.trim_end()));
                        }
                        if lines.len() > REPORT_DIFF_LINES {
                            output.push_str(&format!(
                                "      ... ({} more lines)\n",
                                lines.len() - REPORT_DIFF_LINES
                            ));
                        }
                    }
                    DiffContent::Binary => output.push_str(" (binary content changed)\n"),
                    DiffContent::Unreadable => output.push_str(" (content unreadable)\n"),
                    DiffContent::NotApplicable => output.push('\n'),
                }
            }
            output.push('\n');
        }

        if !deleted.is_empty() {
            output.push_str(&format!("Deleted ({} files):\n", deleted.len()));
            for change in &deleted {
                output.push_str(&format!("   - {}\n", change.path));
            }
            output.push('\n');
        }

        output.push_str(&format!(
            "Total: {} added, {} modified, {} deleted\n{}",
            added.len(),
            modified.len(),
            deleted.len(),
            "=".repeat(60)
        ));
        output
    }
}

/// Summary of diff statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DiffSummary {
    pub added: usize,
    pub deleted: usize,
}

impl DiffSummary {
    /// Count +/- body lines of a unified diff, skipping file headers
    pub fn from_unified(lines: &[String]) -> Self {
        let mut summary = DiffSummary::default();
        for line in lines {
            if line.starts_with("+++") || line.starts_with("---") {
                continue;
            }
            if line.starts_with('+') {
                summary.added += 1;
            } else if line.starts_with('-') {
                summary.deleted += 1;
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.added > 0 || self.deleted > 0
    }

    pub fn format(&self) -> String {
        format!("+{} -{}", self.added, self.deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_lines_include_headers_and_changes() {
        let lines = DiffEngine::unified_lines(
            "one\ntwo\nthree\n",
            "one\n2\nthree\n",
            "original/a.txt",
            "sandbox/a.txt",
            MAX_DIFF_LINES,
        );
        assert_eq!(lines[0], "--- original/a.txt");
        assert_eq!(lines[1], "+++ sandbox/a.txt");
        assert!(lines.iter().any(|l| l == "-two"));
        assert!(lines.iter().any(|l| l == "+2"));

        let summary = DiffSummary::from_unified(&lines);
        assert_eq!(summary, DiffSummary { added: 1, deleted: 1 });
        assert!(summary.has_changes());
    }

    #[test]
    fn unified_lines_are_bounded() {
        let old: String = (0..500).map(|i| format!("line {}\n", i)).collect();
        let lines = DiffEngine::unified_lines(&old, "", "a", "b", 10);
        assert_eq!(lines.len(), 10);
    }

    #[test]
    fn report_groups_by_kind() {
        let changes = vec![
            FileChange::added("c.txt"),
            FileChange::deleted("a.txt"),
            FileChange::modified("b.bin", DiffContent::Binary),
        ];
        let report = DiffEngine::render_changes(&changes);
        assert!(report.contains("   + c.txt"));
        assert!(report.contains("   - a.txt"));
        assert!(report.contains("b.bin (binary content changed)"));
        assert!(report.contains("Total: 1 added, 1 modified, 1 deleted"));
    }

    #[test]
    fn empty_report() {
        assert!(DiffEngine::render_changes(&[]).starts_with("No changes"));
    }
}
