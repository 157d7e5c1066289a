//! Per-session trace recording.
//!
//! Traces are JSONL records written under the session's working directory
//! (`<cwd>/.routa/traces/{day}/traces-{datetime}.jsonl`). They power
//! attribution: which provider touched which files, what was said, which
//! tools ran. Schema version 0.1.0.

pub mod files;
pub mod writer;

pub use files::extract_files_from_tool_call;
pub use writer::TraceWriter;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current trace schema version.
pub const TRACE_VERSION: &str = "0.1.0";

/// One trace record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub version: String,
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub contributor: Contributor,
    pub event_type: TraceEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<TraceTool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<TraceFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<TraceConversation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TraceEventType {
    UserMessage,
    AgentMessage,
    AgentThought,
    ToolCall,
    ToolResult,
    SessionStart,
    SessionEnd,
}

/// The provider/model that produced a record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contributor {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Contributor {
    pub fn new(provider: impl Into<String>, model: Option<String>) -> Self {
        Self {
            provider: provider.into(),
            model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTool {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// A file touched by an agent action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<TraceRange>,
    /// read | write | edit | create | delete
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRange {
    pub start_line: u32,
    pub end_line: u32,
}

/// Conversation context: 200-char preview plus the full content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceConversation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_content: Option<String>,
}

impl TraceConversation {
    pub fn of(role: &str, content: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            content_preview: Some(content.chars().take(200).collect()),
            full_content: Some(content.to_string()),
        }
    }
}

impl TraceRecord {
    pub fn new(
        session_id: impl Into<String>,
        event_type: TraceEventType,
        contributor: Contributor,
    ) -> Self {
        Self {
            version: TRACE_VERSION.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            session_id: session_id.into(),
            workspace_id: None,
            contributor,
            event_type,
            tool: None,
            files: Vec::new(),
            conversation: None,
        }
    }

    pub fn with_workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn with_tool(mut self, tool: TraceTool) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_files(mut self, files: Vec<TraceFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_conversation(mut self, conversation: TraceConversation) -> Self {
        self.conversation = Some(conversation);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_with_camel_case_tags() {
        let record = TraceRecord::new(
            "s1",
            TraceEventType::AgentMessage,
            Contributor::new("claude", Some("claude-sonnet-4".into())),
        )
        .with_conversation(TraceConversation::of("assistant", "hello"));

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["eventType"], "agent_message");
        assert_eq!(value["contributor"]["provider"], "claude");
        assert_eq!(value["conversation"]["contentPreview"], "hello");
    }

    #[test]
    fn preview_truncates_at_200_chars() {
        let long = "x".repeat(500);
        let conv = TraceConversation::of("assistant", &long);
        assert_eq!(conv.content_preview.unwrap().len(), 200);
        assert_eq!(conv.full_content.unwrap().len(), 500);
    }
}
