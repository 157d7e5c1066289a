//! Shared test fixtures.
//!
//! `write_mock_agent` materializes a scripted stdio agent that speaks just
//! enough ACP for lifecycle tests: it answers `initialize`, `session/new`
//! and `session/prompt`, emits one `session/update` notification per
//! prompt, and exercises the agent→host callback path with a permission
//! request.

#![cfg(test)]

use std::path::PathBuf;

/// A scripted ACP agent. `prompt_delay` seconds pass between receiving a
/// prompt and answering it, so overlap/cancel tests have a window to act.
pub fn write_mock_agent(dir: &std::path::Path, prompt_delay: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
# Minimal scripted ACP agent: line-delimited JSON-RPC on stdio.
pid=""
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id="${{line#*\"id\":}}"; id="${{id%%,*}}"
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":1,"agentCapabilities":{{"promptCapabilities":{{}}}},"agentInfo":{{"name":"mock-agent","version":"1.0.0"}}}}}}\n' "$id"
      ;;
    *'"method":"session/new"'*)
      id="${{line#*\"id\":}}"; id="${{id%%,*}}"
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"sessionId":"mock-agent-session"}}}}\n' "$id"
      ;;
    *'"method":"session/prompt"'*)
      pid="${{line#*\"id\":}}"; pid="${{pid%%,*}}"
      sleep {prompt_delay}
      printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"mock-agent-session","update":{{"sessionUpdate":"agent_message_chunk","content":{{"type":"text","text":"hi from mock"}}}}}}}}\n'
      printf '{{"jsonrpc":"2.0","id":99,"method":"session/request_permission","params":{{"toolCall":{{}}}}}}\n'
      ;;
    *'"id":99'*)
      case "$line" in
        *approved*) sr="end_turn" ;;
        *) sr="error" ;;
      esac
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"stopReason":"%s"}}}}\n' "$pid" "$sr"
      ;;
    *'"method":"session/cancel"'*)
      printf '{{"jsonrpc":"2.0","method":"session/update","params":{{"sessionId":"mock-agent-session","update":{{"sessionUpdate":"turn_complete","stopReason":"cancelled"}}}}}}\n'
      ;;
  esac
done
"#
    );

    let path = dir.join("mock-agent.sh");
    std::fs::write(&path, script).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}
