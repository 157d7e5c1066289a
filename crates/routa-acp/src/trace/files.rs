//! File-range extraction from tool parameters.
//!
//! Turns tool call inputs into typed `TraceFile` entries so traces (and
//! the UI's "N files changed" summary) know which files an agent touched.

use serde_json::Value;

use super::{TraceFile, TraceRange};

/// Extract file entries from one tool call's parameters. The tool name is
/// the normalized `kind` (`read-file`, `write-file`, `edit-file`, ...) or a
/// provider-native name (`Read`, `Write`, `Edit`, `MultiEdit`).
pub fn extract_files_from_tool_call(tool_name: &str, params: &Value) -> Vec<TraceFile> {
    let mut files = Vec::new();

    match normalize(tool_name) {
        "read" => {
            if let Some(path) = file_path(params) {
                files.push(entry(path, "read", line_range(params)));
            }
        }
        "write" => {
            if let Some(path) = file_path(params) {
                files.push(entry(path, "write", None));
            }
        }
        "edit" => {
            if let Some(path) = file_path(params) {
                files.push(entry(path, "edit", line_range(params)));
            }
            // MultiEdit carries per-edit paths
            if let Some(edits) = params.get("edits").and_then(Value::as_array) {
                for edit in edits {
                    if let Some(path) = file_path(edit) {
                        files.push(entry(path, "edit", line_range(edit)));
                    }
                }
            }
        }
        _ => {}
    }

    files
}

fn normalize(tool_name: &str) -> &'static str {
    match tool_name {
        "Read" | "read-file" | "NotebookRead" => "read",
        "Write" | "write-file" => "write",
        "Edit" | "MultiEdit" | "edit-file" | "NotebookEdit" => "edit",
        _ => "other",
    }
}

fn file_path(params: &Value) -> Option<String> {
    params
        .get("file_path")
        .or_else(|| params.get("path"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn line_range(params: &Value) -> Option<TraceRange> {
    let start = params.get("startLine").and_then(Value::as_u64)?;
    let end = params.get("endLine").and_then(Value::as_u64)?;
    Some(TraceRange {
        start_line: start as u32,
        end_line: end as u32,
    })
}

fn entry(path: String, operation: &str, range: Option<TraceRange>) -> TraceFile {
    TraceFile {
        path,
        ranges: range.into_iter().collect(),
        operation: Some(operation.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn read_tool_yields_read_entry() {
        let files = extract_files_from_tool_call(
            "Read",
            &json!({ "file_path": "/src/main.rs", "limit": 100 }),
        );
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "/src/main.rs");
        assert_eq!(files[0].operation.as_deref(), Some("read"));
    }

    #[test]
    fn edit_with_line_range() {
        let files = extract_files_from_tool_call(
            "edit-file",
            &json!({ "file_path": "/src/lib.rs", "startLine": 10, "endLine": 20 }),
        );
        assert_eq!(files[0].ranges, vec![TraceRange { start_line: 10, end_line: 20 }]);
    }

    #[test]
    fn multi_edit_yields_per_edit_entries() {
        let files = extract_files_from_tool_call(
            "MultiEdit",
            &json!({
                "edits": [
                    { "file_path": "/a.rs" },
                    { "file_path": "/b.rs", "startLine": 1, "endLine": 2 },
                ]
            }),
        );
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].path, "/b.rs");
    }

    #[test]
    fn shell_tool_touches_no_files() {
        assert!(extract_files_from_tool_call("shell", &json!({ "command": "ls" })).is_empty());
    }
}
