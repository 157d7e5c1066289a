//! Checklist extraction from agent message content.
//!
//! Agents narrate task progress as markdown checklists. The normalizer
//! derives a typed list from them so the UI's task-progress component does
//! not have to re-parse markdown:
//!
//!   `- [ ] item`  pending
//!   `- [x] item`  completed
//!   `- [-] item`  cancelled
//!
//! An explicit `[running]` prefix on the item text marks it in-progress.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecklistStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl ChecklistStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub content: String,
    pub status: ChecklistStatus,
}

/// Parse every checklist item out of `text`, in order.
pub fn parse_checklist(text: &str) -> Vec<ChecklistItem> {
    let mut items = Vec::new();

    for line in text.lines() {
        let trimmed = line.trim_start();
        let Some(rest) = trimmed.strip_prefix("- [") else {
            continue;
        };
        let mut chars = rest.chars();
        let marker = chars.next();
        if chars.next() != Some(']') {
            continue;
        }

        let mut status = match marker {
            Some(' ') => ChecklistStatus::Pending,
            Some('x') | Some('X') => ChecklistStatus::Completed,
            Some('-') => ChecklistStatus::Cancelled,
            _ => continue,
        };

        let mut content = chars.as_str().trim().to_string();
        for running_marker in ["[running]", "(running)"] {
            if let Some(stripped) = content.strip_prefix(running_marker) {
                status = ChecklistStatus::Running;
                content = stripped.trim_start().to_string();
                break;
            }
        }

        if !content.is_empty() {
            items.push(ChecklistItem { content, status });
        }
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_marker_kinds() {
        let text = "\
Plan:
- [ ] write tests
- [x] read the code
- [-] abandoned idea
- [ ] [running] refactor the parser
Some trailing prose.";

        let items = parse_checklist(text);
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].status, ChecklistStatus::Pending);
        assert_eq!(items[1].status, ChecklistStatus::Completed);
        assert_eq!(items[2].status, ChecklistStatus::Cancelled);
        assert_eq!(items[3].status, ChecklistStatus::Running);
        assert_eq!(items[3].content, "refactor the parser");
    }

    #[test]
    fn ignores_non_checklist_lines() {
        assert!(parse_checklist("just some text\n- a plain bullet\n-[ ] no space").is_empty());
    }

    #[test]
    fn indented_items_are_accepted() {
        let items = parse_checklist("  - [x] nested item");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].content, "nested item");
    }

    #[test]
    fn empty_content_is_skipped() {
        assert!(parse_checklist("- [ ]   ").is_empty());
    }
}
