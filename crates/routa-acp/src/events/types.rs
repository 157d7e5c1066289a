//! Canonical `session/update` event vocabulary.
//!
//! Every provider's notifications are normalized into this vocabulary
//! before they reach a subscriber. The wire shape is the JSON-RPC
//! notification:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"session/update",
//!  "params":{"sessionId":"...","update":{"sessionUpdate":"<kind>", ...}}}
//! ```

use serde_json::{json, Value};

/// The `sessionUpdate` tag of a canonical event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserMessage,
    AgentMessageChunk,
    AgentThoughtChunk,
    ToolCall,
    ToolCallUpdate,
    ToolCallStart,
    ToolCallParamsDelta,
    ThinkingStart,
    ThinkingStop,
    ThinkingSignature,
    Plan,
    UsageUpdate,
    CurrentModeUpdate,
    TaskCompletion,
    TerminalCreated,
    TerminalOutput,
    TerminalExited,
    ProcessOutput,
    TurnComplete,
    AvailableCommandsUpdate,
    SessionInfoUpdate,
    ConfigOptionUpdate,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UserMessage => "user_message",
            Self::AgentMessageChunk => "agent_message_chunk",
            Self::AgentThoughtChunk => "agent_thought_chunk",
            Self::ToolCall => "tool_call",
            Self::ToolCallUpdate => "tool_call_update",
            Self::ToolCallStart => "tool_call_start",
            Self::ToolCallParamsDelta => "tool_call_params_delta",
            Self::ThinkingStart => "thinking_start",
            Self::ThinkingStop => "thinking_stop",
            Self::ThinkingSignature => "thinking_signature",
            Self::Plan => "plan",
            Self::UsageUpdate => "usage_update",
            Self::CurrentModeUpdate => "current_mode_update",
            Self::TaskCompletion => "task_completion",
            Self::TerminalCreated => "terminal_created",
            Self::TerminalOutput => "terminal_output",
            Self::TerminalExited => "terminal_exited",
            Self::ProcessOutput => "process_output",
            Self::TurnComplete => "turn_complete",
            Self::AvailableCommandsUpdate => "available_commands_update",
            Self::SessionInfoUpdate => "session_info_update",
            Self::ConfigOptionUpdate => "config_option_update",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        // agent_message is a legacy alias a few providers still emit
        Some(match s {
            "user_message" => Self::UserMessage,
            "agent_message_chunk" | "agent_message" => Self::AgentMessageChunk,
            "agent_thought_chunk" | "agent_thought" => Self::AgentThoughtChunk,
            "tool_call" => Self::ToolCall,
            "tool_call_update" => Self::ToolCallUpdate,
            "tool_call_start" => Self::ToolCallStart,
            "tool_call_params_delta" => Self::ToolCallParamsDelta,
            "thinking_start" => Self::ThinkingStart,
            "thinking_stop" => Self::ThinkingStop,
            "thinking_signature" => Self::ThinkingSignature,
            "plan" => Self::Plan,
            "usage_update" => Self::UsageUpdate,
            "current_mode_update" => Self::CurrentModeUpdate,
            "task_completion" => Self::TaskCompletion,
            "terminal_created" => Self::TerminalCreated,
            "terminal_output" => Self::TerminalOutput,
            "terminal_exited" => Self::TerminalExited,
            "process_output" => Self::ProcessOutput,
            "turn_complete" => Self::TurnComplete,
            "available_commands_update" => Self::AvailableCommandsUpdate,
            "session_info_update" => Self::SessionInfoUpdate,
            "config_option_update" => Self::ConfigOptionUpdate,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Tool-call lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStatus {
    /// Input still arriving.
    Streaming,
    /// Input finalized, execution begun.
    Running,
    /// Async subtask in flight (delegation tools only).
    Delegated,
    Completed,
    Failed,
}

impl ToolStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::Running => "running",
            Self::Delegated => "delegated",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "streaming" | "pending" => Self::Streaming,
            "running" | "in_progress" => Self::Running,
            "delegated" => Self::Delegated,
            "failed" | "error" => Self::Failed,
            _ => Self::Completed,
        }
    }

    /// Only completed/failed end a tool call.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

// ─── Notification builders ──────────────────────────────────────────────

/// Wrap an `update` object into the JSON-RPC `session/update` notification.
pub fn session_notification(session_id: &str, update: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "session/update",
        "params": {
            "sessionId": session_id,
            "update": update,
        }
    })
}

/// Extract `(sessionId, update)` from a `session/update` notification.
pub fn split_notification(notification: &Value) -> Option<(&str, &Value)> {
    let params = notification.get("params")?;
    let session_id = params.get("sessionId")?.as_str()?;
    let update = params.get("update")?;
    Some((session_id, update))
}

/// The `sessionUpdate` kind of an `update` object.
pub fn update_kind(update: &Value) -> Option<EventKind> {
    update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .and_then(EventKind::parse)
}

pub fn process_output(source: &str, data: &str, display_name: &str) -> Value {
    json!({
        "sessionUpdate": "process_output",
        "source": source,
        "data": data,
        "displayName": display_name,
    })
}

pub fn turn_complete(stop_reason: &str, usage: Option<Value>) -> Value {
    let mut update = json!({
        "sessionUpdate": "turn_complete",
        "stopReason": stop_reason,
    });
    if let Some(usage) = usage {
        update["usage"] = usage;
    }
    update
}

pub fn session_info(message: &str, extra: Option<Value>) -> Value {
    let mut update = json!({
        "sessionUpdate": "session_info_update",
        "message": message,
    });
    if let Some(Value::Object(map)) = extra {
        for (k, v) in map {
            update[k] = v;
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        for kind in [
            EventKind::ToolCall,
            EventKind::TurnComplete,
            EventKind::ThinkingSignature,
            EventKind::TaskCompletion,
        ] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(EventKind::parse("agent_message"), Some(EventKind::AgentMessageChunk));
        assert_eq!(EventKind::parse("nope"), None);
    }

    #[test]
    fn notification_envelope_splits_back() {
        let n = session_notification("s1", json!({"sessionUpdate":"turn_complete","stopReason":"end_turn"}));
        let (sid, update) = split_notification(&n).unwrap();
        assert_eq!(sid, "s1");
        assert_eq!(update_kind(update), Some(EventKind::TurnComplete));
    }

    #[test]
    fn tool_status_terminality() {
        assert!(ToolStatus::Completed.is_terminal());
        assert!(ToolStatus::Failed.is_terminal());
        assert!(!ToolStatus::Delegated.is_terminal());
        assert!(!ToolStatus::Streaming.is_terminal());
        assert_eq!(ToolStatus::parse("in_progress"), ToolStatus::Running);
    }
}
