//! Integration test: boot the broker server and drive a full session
//! against a scripted stdio agent.

#![cfg(unix)]

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};

/// A scripted ACP agent on stdio, wired in through the `OPENCODE_BIN`
/// preset override.
fn write_mock_agent(dir: &std::path::Path) -> std::path::PathBuf {
    let script = r#"#!/bin/sh
while IFS= read -r line; do
  case "$line" in
    *'"method":"initialize"'*)
      id="${line#*\"id\":}"; id="${id%%,*}"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":1,"agentCapabilities":{},"agentInfo":{"name":"mock-agent","version":"1.0.0"}}}\n' "$id"
      ;;
    *'"method":"session/new"'*)
      id="${line#*\"id\":}"; id="${id%%,*}"
      printf '{"jsonrpc":"2.0","id":%s,"result":{"sessionId":"mock-agent-session"}}\n' "$id"
      ;;
    *'"method":"session/prompt"'*)
      id="${line#*\"id\":}"; id="${id%%,*}"
      printf '{"jsonrpc":"2.0","method":"session/update","params":{"sessionId":"mock-agent-session","update":{"sessionUpdate":"agent_message_chunk","content":{"type":"text","text":"hi"}}}}\n'
      printf '{"jsonrpc":"2.0","id":%s,"result":{"stopReason":"end_turn"}}\n' "$id"
      ;;
  esac
done
"#;
    let path = dir.join("mock-agent.sh");
    std::fs::write(&path, script).unwrap();
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

async fn rpc(client: &reqwest::Client, base: &str, method: &str, params: Value) -> Value {
    client
        .post(format!("{base}/api/acp"))
        .json(&json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_broker_api_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let script = write_mock_agent(tmp.path());
    std::env::set_var("OPENCODE_BIN", &script);

    let state = routa_acp_server::create_app_state();
    let addr = routa_acp_server::start_server_with_state(
        routa_acp_server::ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        state.clone(),
    )
    .await
    .unwrap();
    let base = format!("http://{addr}");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let client = reqwest::Client::new();

    // ── Health ─────────────────────────────────────────────────────
    let resp = client
        .get(format!("{base}/api/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    // ── initialize ─────────────────────────────────────────────────
    let body = rpc(&client, &base, "initialize", json!({ "protocolVersion": 1 })).await;
    assert_eq!(body["result"]["protocolVersion"], 1);
    assert_eq!(body["result"]["agentInfo"]["name"], "routa-acp-server");

    // ── unknown method ─────────────────────────────────────────────
    let body = rpc(&client, &base, "definitely/not/a/method", json!({})).await;
    assert_eq!(body["error"]["code"], -32601);

    // ── session/new ────────────────────────────────────────────────
    let body = rpc(
        &client,
        &base,
        "session/new",
        json!({ "provider": "opencode", "cwd": tmp.path() }),
    )
    .await;
    let session_id = body["result"]["sessionId"].as_str().unwrap().to_string();
    assert_eq!(body["result"]["agentId"], "mock-agent-session");

    // ── SSE subscribe, then prompt ─────────────────────────────────
    let sse = client
        .get(format!("{base}/api/acp?sessionId={session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(sse.status(), 200);
    let mut sse_stream = sse.bytes_stream();

    let prompt = {
        let client = client.clone();
        let base = base.clone();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            rpc(
                &client,
                &base,
                "session/prompt",
                json!({ "sessionId": session_id, "prompt": [{ "type": "text", "text": "echo hi" }] }),
            )
            .await
        })
    };

    // Collect SSE frames until turn_complete.
    let mut saw_chunk = false;
    let mut saw_turn_complete = false;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let mut buffer = String::new();
    while tokio::time::Instant::now() < deadline && !saw_turn_complete {
        let chunk = tokio::time::timeout(Duration::from_secs(5), sse_stream.next())
            .await
            .expect("SSE stalled");
        let Some(chunk) = chunk else { break };
        buffer.push_str(&String::from_utf8_lossy(&chunk.unwrap()));
        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Value>(data.trim()) else {
                continue;
            };
            assert_eq!(frame["method"], "session/update");
            assert_eq!(frame["params"]["sessionId"], session_id.as_str());
            match frame["params"]["update"]["sessionUpdate"].as_str() {
                Some("agent_message_chunk") => {
                    assert!(frame["params"]["update"]["content"]["text"]
                        .as_str()
                        .unwrap()
                        .contains("hi"));
                    saw_chunk = true;
                }
                Some("turn_complete") => {
                    assert_eq!(frame["params"]["update"]["stopReason"], "end_turn");
                    saw_turn_complete = true;
                }
                _ => {}
            }
        }
    }
    assert!(saw_chunk, "no agent_message_chunk on the SSE stream");
    assert!(saw_turn_complete, "no turn_complete on the SSE stream");

    let body = prompt.await.unwrap();
    assert_eq!(body["result"]["stopReason"], "end_turn");

    // ── history replay ─────────────────────────────────────────────
    tokio::time::sleep(Duration::from_millis(100)).await;
    let resp = client
        .get(format!("{base}/api/sessions/{session_id}/history"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let events = body["events"].as_array().unwrap();
    assert!(!events.is_empty());
    let kinds: Vec<&str> = events
        .iter()
        .filter_map(|e| e["params"]["update"]["sessionUpdate"].as_str())
        .collect();
    assert_eq!(kinds.first(), Some(&"user_message"));
    assert!(kinds.contains(&"turn_complete"));

    // ── session listing + teardown ─────────────────────────────────
    let resp = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["sessions"].as_array().unwrap().len(), 1);

    let resp = client
        .delete(format!("{base}/api/sessions/{session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .get(format!("{base}/api/sessions/{session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    state.shutdown().await;
}

#[tokio::test]
async fn test_missing_session_paths() {
    let state = routa_acp_server::create_app_state();
    let addr = routa_acp_server::start_server_with_state(
        routa_acp_server::ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        state,
    )
    .await
    .unwrap();
    let base = format!("http://{addr}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let client = reqwest::Client::new();

    // SSE for an unknown session is a 404.
    let resp = client
        .get(format!("{base}/api/acp?sessionId=nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Prompting an unknown session is a JSON-RPC error.
    let body = rpc(
        &client,
        &base,
        "session/prompt",
        json!({ "sessionId": "nope", "prompt": [{ "type": "text", "text": "x" }] }),
    )
    .await;
    assert_eq!(body["error"]["code"], -32002);

    // History for an unknown session is a 404.
    let resp = client
        .get(format!("{base}/api/sessions/nope/history"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
