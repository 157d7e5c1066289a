//! Event normalizer — per-session enrichment and trace recording.
//!
//! Conformant providers already speak the canonical vocabulary, so this
//! stage does not rewrite events; it watches them. Per session it keeps
//! sticky state: the last event kind (consecutive `agent_message_chunk`s
//! group into one logical message; a foreign event closes the group),
//! chunk buffers flushed to the trace store at ≥100 characters and at
//! `turn_complete`, and the set of tool calls whose input has not been
//! traced yet (several providers defer input to a later update).
//!
//! It also derives two update streams of its own: a `plan` update whenever
//! the accumulated message contains a changed markdown checklist, and a
//! `session_info_update` carrying the running "N files changed, +A -R"
//! summary.

use std::collections::HashMap;

use serde_json::{json, Value};

use super::checklist::{parse_checklist, ChecklistItem};
use super::types::{update_kind, EventKind, ToolStatus};
use crate::trace::{
    extract_files_from_tool_call, Contributor, TraceConversation, TraceEventType, TraceRecord,
    TraceTool, TraceWriter,
};

/// Chunk buffers flush to the trace store at this size.
const FLUSH_THRESHOLD: usize = 100;

struct PendingToolCall {
    name: String,
    traced: bool,
}

#[derive(Default)]
struct FileChangeTally {
    /// path → (lines added, lines removed)
    files: HashMap<String, (u64, u64)>,
}

impl FileChangeTally {
    fn record(&mut self, path: &str, added: u64, removed: u64) {
        let entry = self.files.entry(path.to_string()).or_default();
        entry.0 += added;
        entry.1 += removed;
    }

    fn summary(&self) -> Option<Value> {
        if self.files.is_empty() {
            return None;
        }
        let (added, removed) = self
            .files
            .values()
            .fold((0u64, 0u64), |(a, r), (fa, fr)| (a + fa, r + fr));
        Some(json!({
            "sessionUpdate": "session_info_update",
            "filesChanged": self.files.len(),
            "linesAdded": added,
            "linesRemoved": removed,
            "message": format!("{} files changed, +{} -{}", self.files.len(), added, removed),
        }))
    }
}

/// Per-session normalizer state. Owned by the session's event pump; not
/// shared.
pub struct Normalizer {
    session_id: String,
    provider: String,
    writer: TraceWriter,
    last_event_kind: Option<EventKind>,
    message_buffer: String,
    /// Full message content for the current turn (checklist source).
    turn_message: String,
    thought_buffer: String,
    pending_tool_calls: HashMap<String, PendingToolCall>,
    last_checklist: Vec<ChecklistItem>,
    tally: FileChangeTally,
}

impl Normalizer {
    pub fn new(session_id: &str, provider: &str, cwd: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            provider: provider.to_string(),
            writer: TraceWriter::new(cwd),
            last_event_kind: None,
            message_buffer: String::new(),
            turn_message: String::new(),
            thought_buffer: String::new(),
            pending_tool_calls: HashMap::new(),
            last_checklist: Vec::new(),
            tally: FileChangeTally::default(),
        }
    }

    /// Process one canonical `update` object. Returns derived updates to
    /// publish after it.
    pub async fn handle(&mut self, update: &Value) -> Vec<Value> {
        let Some(kind) = update_kind(update) else {
            return Vec::new();
        };

        // A foreign event closes the current message/thought group.
        if !matches!(kind, EventKind::AgentMessageChunk) && !self.message_buffer.is_empty() {
            self.flush_message().await;
        }
        if !matches!(kind, EventKind::AgentThoughtChunk) && !self.thought_buffer.is_empty() {
            self.flush_thought().await;
        }

        let mut derived = Vec::new();

        match kind {
            EventKind::AgentMessageChunk => {
                let text = chunk_text(update);
                self.message_buffer.push_str(text);
                self.turn_message.push_str(text);
                if self.message_buffer.len() >= FLUSH_THRESHOLD {
                    self.flush_message().await;
                }
                if let Some(plan) = self.derive_checklist() {
                    derived.push(plan);
                }
            }

            EventKind::AgentThoughtChunk => {
                self.thought_buffer.push_str(chunk_text(update));
                if self.thought_buffer.len() >= FLUSH_THRESHOLD {
                    self.flush_thought().await;
                }
            }

            EventKind::UserMessage => {
                let text = chunk_text(update);
                if !text.is_empty() {
                    let record = self
                        .record(TraceEventType::UserMessage)
                        .with_conversation(TraceConversation::of("user", text));
                    self.writer.append_safe(&record).await;
                }
            }

            EventKind::ToolCall => {
                self.on_tool_call(update).await;
            }

            EventKind::ToolCallUpdate => {
                if let Some(summary) = self.on_tool_call_update(update).await {
                    derived.push(summary);
                }
            }

            EventKind::TaskCompletion => {
                if let Some(files) = update.get("filesModified").and_then(Value::as_array) {
                    for file in files.iter().filter_map(Value::as_str) {
                        self.tally.record(file, 0, 0);
                    }
                    if let Some(summary) = self.tally.summary() {
                        derived.push(summary);
                    }
                }
            }

            EventKind::TurnComplete => {
                self.flush_message().await;
                self.flush_thought().await;
                self.turn_message.clear();
                self.last_checklist.clear();
            }

            _ => {}
        }

        self.last_event_kind = Some(kind);
        derived
    }

    /// Drop session state when the session ends.
    pub async fn finish(&mut self) {
        self.flush_message().await;
        self.flush_thought().await;
        self.pending_tool_calls.clear();
    }

    // ── Tool calls ───────────────────────────────────────────────────────

    async fn on_tool_call(&mut self, update: &Value) {
        let tool_call_id = str_field(update, "toolCallId");
        let name = update
            .get("kind")
            .or_else(|| update.get("title"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let input = update.get("rawInput").cloned();

        if has_input(&input) {
            self.trace_tool_call(&tool_call_id, &name, input.clone()).await;
            self.pending_tool_calls.insert(
                tool_call_id,
                PendingToolCall { name, traced: true },
            );
        } else {
            // Input deferred to a later tool_call_update.
            self.pending_tool_calls.insert(
                tool_call_id,
                PendingToolCall { name, traced: false },
            );
        }
    }

    async fn on_tool_call_update(&mut self, update: &Value) -> Option<Value> {
        let tool_call_id = str_field(update, "toolCallId");
        let status = update
            .get("status")
            .and_then(Value::as_str)
            .map(ToolStatus::parse)
            .unwrap_or(ToolStatus::Running);
        let input = update.get("rawInput").cloned();

        // Deferred-input providers: the first update with real input
        // completes the tool_call trace.
        let needs_call_trace = self
            .pending_tool_calls
            .get(&tool_call_id)
            .map(|p| !p.traced && has_input(&input))
            .unwrap_or(false);
        if needs_call_trace {
            let name = self.pending_tool_calls[&tool_call_id].name.clone();
            self.trace_tool_call(&tool_call_id, &name, input.clone()).await;
            if let Some(pending) = self.pending_tool_calls.get_mut(&tool_call_id) {
                pending.traced = true;
            }
        }

        if !status.is_terminal() {
            return None;
        }

        let name = self
            .pending_tool_calls
            .remove(&tool_call_id)
            .map(|p| p.name)
            .or_else(|| {
                update
                    .get("kind")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "unknown".to_string());

        let record = self
            .record(TraceEventType::ToolResult)
            .with_tool(TraceTool {
                name,
                tool_call_id: Some(tool_call_id),
                status: Some(status.as_str().to_string()),
                input: None,
                output: update.get("rawOutput").cloned(),
            });
        self.writer.append_safe(&record).await;

        self.tally.summary().filter(|_| status == ToolStatus::Completed)
    }

    async fn trace_tool_call(&mut self, tool_call_id: &str, name: &str, input: Option<Value>) {
        let files = input
            .as_ref()
            .map(|i| extract_files_from_tool_call(name, i))
            .unwrap_or_default();

        // Count line deltas for write/edit inputs.
        if let Some(input) = input.as_ref() {
            for file in &files {
                match file.operation.as_deref() {
                    Some("write") => {
                        let added = input
                            .get("content")
                            .and_then(Value::as_str)
                            .map(|c| c.lines().count() as u64)
                            .unwrap_or(0);
                        self.tally.record(&file.path, added, 0);
                    }
                    Some("edit") => {
                        let removed = line_count(input, "old_string");
                        let added = line_count(input, "new_string");
                        self.tally.record(&file.path, added, removed);
                    }
                    _ => {}
                }
            }
        }

        let record = self
            .record(TraceEventType::ToolCall)
            .with_tool(TraceTool {
                name: name.to_string(),
                tool_call_id: Some(tool_call_id.to_string()),
                status: Some("running".to_string()),
                input,
                output: None,
            })
            .with_files(files);
        self.writer.append_safe(&record).await;
    }

    // ── Buffers ──────────────────────────────────────────────────────────

    async fn flush_message(&mut self) {
        if self.message_buffer.is_empty() {
            return;
        }
        let content = std::mem::take(&mut self.message_buffer);
        let record = self
            .record(TraceEventType::AgentMessage)
            .with_conversation(TraceConversation::of("assistant", &content));
        self.writer.append_safe(&record).await;
    }

    async fn flush_thought(&mut self) {
        if self.thought_buffer.is_empty() {
            return;
        }
        let content = std::mem::take(&mut self.thought_buffer);
        let record = self
            .record(TraceEventType::AgentThought)
            .with_conversation(TraceConversation::of("assistant", &content));
        self.writer.append_safe(&record).await;
    }

    fn derive_checklist(&mut self) -> Option<Value> {
        let items = parse_checklist(&self.turn_message);
        if items.is_empty() || items == self.last_checklist {
            return None;
        }
        self.last_checklist = items.clone();
        Some(json!({
            "sessionUpdate": "plan",
            "entries": items
                .iter()
                .map(|i| json!({ "content": i.content, "status": i.status.as_str() }))
                .collect::<Vec<_>>(),
        }))
    }

    fn record(&self, event_type: TraceEventType) -> TraceRecord {
        TraceRecord::new(
            self.session_id.clone(),
            event_type,
            Contributor::new(self.provider.clone(), None),
        )
    }
}

// ─── Field helpers ──────────────────────────────────────────────────────

fn chunk_text(update: &Value) -> &str {
    update
        .get("content")
        .and_then(|c| c.get("text"))
        .and_then(Value::as_str)
        .unwrap_or("")
}

fn str_field(update: &Value, key: &str) -> String {
    update
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn has_input(input: &Option<Value>) -> bool {
    match input {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

fn line_count(input: &Value, key: &str) -> u64 {
    input
        .get(key)
        .and_then(Value::as_str)
        .map(|s| s.lines().count() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_traces(dir: &std::path::Path) -> Vec<Value> {
        let mut records = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&d) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().map(|e| e == "jsonl").unwrap_or(false) {
                    for line in std::fs::read_to_string(&path).unwrap_or_default().lines() {
                        records.push(serde_json::from_str(line).unwrap());
                    }
                }
            }
        }
        records
    }

    fn chunk(text: &str) -> Value {
        json!({ "sessionUpdate": "agent_message_chunk", "content": { "type": "text", "text": text } })
    }

    #[tokio::test]
    async fn chunks_accumulate_into_one_trace_record() {
        let tmp = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new("s1", "opencode", tmp.path().to_str().unwrap());

        // Three small chunks stay buffered, turn_complete flushes them.
        n.handle(&chunk("hello ")).await;
        n.handle(&chunk("from ")).await;
        n.handle(&chunk("the agent")).await;
        n.handle(&json!({ "sessionUpdate": "turn_complete", "stopReason": "end_turn" }))
            .await;

        let traces = read_traces(tmp.path());
        let messages: Vec<_> = traces
            .iter()
            .filter(|t| t["eventType"] == "agent_message")
            .collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0]["conversation"]["fullContent"],
            "hello from the agent"
        );
    }

    #[tokio::test]
    async fn total_traced_length_matches_stream() {
        let tmp = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new("s1", "opencode", tmp.path().to_str().unwrap());

        let long = "y".repeat(60);
        let mut expected = String::new();
        for _ in 0..4 {
            expected.push_str(&long);
            n.handle(&chunk(&long)).await;
        }
        n.handle(&json!({ "sessionUpdate": "turn_complete", "stopReason": "end_turn" }))
            .await;

        let total: String = read_traces(tmp.path())
            .iter()
            .filter(|t| t["eventType"] == "agent_message")
            .map(|t| t["conversation"]["fullContent"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(total, expected);
    }

    #[tokio::test]
    async fn deferred_tool_input_is_traced_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new("s1", "opencode", tmp.path().to_str().unwrap());

        n.handle(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t1",
            "title": "read",
            "kind": "read-file",
            "status": "running",
        }))
        .await;
        n.handle(&json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t1",
            "status": "running",
            "rawInput": { "file_path": "/x.rs" },
        }))
        .await;
        n.handle(&json!({
            "sessionUpdate": "tool_call_update",
            "toolCallId": "t1",
            "status": "completed",
            "rawOutput": "file contents",
        }))
        .await;

        let traces = read_traces(tmp.path());
        let calls: Vec<_> = traces.iter().filter(|t| t["eventType"] == "tool_call").collect();
        let results: Vec<_> = traces.iter().filter(|t| t["eventType"] == "tool_result").collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["tool"]["input"]["file_path"], "/x.rs");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["tool"]["status"], "completed");
    }

    #[tokio::test]
    async fn checklist_derives_plan_update() {
        let tmp = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new("s1", "claude", tmp.path().to_str().unwrap());

        let derived = n
            .handle(&chunk("- [x] read files\n- [ ] write tests\n"))
            .await;
        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0]["sessionUpdate"], "plan");
        let entries = derived[0]["entries"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["status"], "completed");

        // Same checklist again: no duplicate plan update.
        let derived = n.handle(&chunk("")).await;
        assert!(derived.is_empty());
    }

    #[tokio::test]
    async fn write_tool_feeds_file_summary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut n = Normalizer::new("s1", "claude", tmp.path().to_str().unwrap());

        n.handle(&json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t1",
            "kind": "write-file",
            "status": "running",
            "rawInput": { "file_path": "/a.rs", "content": "l1\nl2\nl3" },
        }))
        .await;
        let derived = n
            .handle(&json!({
                "sessionUpdate": "tool_call_update",
                "toolCallId": "t1",
                "status": "completed",
            }))
            .await;

        assert_eq!(derived.len(), 1);
        assert_eq!(derived[0]["filesChanged"], 1);
        assert_eq!(derived[0]["linesAdded"], 3);
        assert!(derived[0]["message"].as_str().unwrap().contains("1 files changed"));
    }
}
