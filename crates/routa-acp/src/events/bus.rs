//! Per-session fanout bus with replay.
//!
//! Every session owns one broadcast channel. Producers (the agent process,
//! adapters, the normalizer) send JSON-RPC `session/update` notifications
//! into it; each SSE subscriber holds its own bounded receiver. A slow
//! subscriber lags and loses the oldest frames — it never back-pressures
//! the producer — and the SSE layer marks the gap with a synthetic
//! `session_info_update`.
//!
//! The bus also keeps an ordered replay buffer per session so a client
//! reconnecting mid-turn can rebuild its state before going live.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex, RwLock};

/// Per-subscriber queue depth. Overflow drops the oldest frames for that
/// subscriber only.
pub const SUBSCRIBER_CAPACITY: usize = 256;

/// Replay buffer cap per session; the oldest events fall off first.
const REPLAY_LIMIT: usize = 4096;

struct SessionChannel {
    tx: broadcast::Sender<Value>,
    replay: Arc<Mutex<Vec<Value>>>,
}

/// Process-wide registry of per-session broadcast channels.
pub struct SessionEventBus {
    channels: RwLock<HashMap<String, SessionChannel>>,
}

impl SessionEventBus {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Create (or fetch) the channel for a session and return its sender.
    /// The first call spawns the replay pump that records every frame.
    pub async fn open(&self, session_id: &str) -> broadcast::Sender<Value> {
        let mut channels = self.channels.write().await;
        if let Some(channel) = channels.get(session_id) {
            return channel.tx.clone();
        }

        let (tx, mut rx) = broadcast::channel::<Value>(SUBSCRIBER_CAPACITY);
        let replay = Arc::new(Mutex::new(Vec::new()));

        {
            let replay = replay.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(frame) => {
                            let mut buf = replay.lock().await;
                            if buf.len() >= REPLAY_LIMIT {
                                buf.remove(0);
                            }
                            buf.push(frame);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(
                                "[bus] replay pump for {} lagged by {} frames",
                                session_id,
                                n
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
        }

        let sender = tx.clone();
        channels.insert(session_id.to_string(), SessionChannel { tx, replay });
        sender
    }

    /// Subscribe to live frames for a session.
    pub async fn subscribe(&self, session_id: &str) -> Option<broadcast::Receiver<Value>> {
        let channels = self.channels.read().await;
        channels.get(session_id).map(|c| c.tx.subscribe())
    }

    /// Publish one frame to a session's subscribers. No-op for unknown
    /// sessions.
    pub async fn publish(&self, session_id: &str, frame: Value) {
        let channels = self.channels.read().await;
        if let Some(channel) = channels.get(session_id) {
            let _ = channel.tx.send(frame);
        }
    }

    /// The ordered replay buffer: every frame published so far.
    pub async fn history(&self, session_id: &str) -> Vec<Value> {
        let replay = {
            let channels = self.channels.read().await;
            match channels.get(session_id) {
                Some(channel) => channel.replay.clone(),
                None => return Vec::new(),
            }
        };
        let buf = replay.lock().await;
        buf.clone()
    }

    pub async fn has_session(&self, session_id: &str) -> bool {
        self.channels.read().await.contains_key(session_id)
    }

    /// Tear down a session's channel. Live subscribers see the stream close.
    pub async fn close(&self, session_id: &str) {
        self.channels.write().await.remove(session_id);
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::session_notification;
    use serde_json::json;

    fn frame(session_id: &str, n: u64) -> Value {
        session_notification(session_id, json!({ "sessionUpdate": "agent_message_chunk", "n": n }))
    }

    #[tokio::test]
    async fn replay_preserves_order() {
        let bus = SessionEventBus::new();
        bus.open("s1").await;

        for n in 0..5 {
            bus.publish("s1", frame("s1", n)).await;
        }
        // Let the pump drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let history = bus.history("s1").await;
        assert_eq!(history.len(), 5);
        for (i, f) in history.iter().enumerate() {
            assert_eq!(f["params"]["update"]["n"], i as u64);
        }
    }

    #[tokio::test]
    async fn subscribers_are_isolated() {
        let bus = SessionEventBus::new();
        let tx = bus.open("s1").await;

        let mut sub_a = bus.subscribe("s1").await.unwrap();
        let sub_b = bus.subscribe("s1").await.unwrap();
        // b disconnects mid-turn
        drop(sub_b);

        tx.send(frame("s1", 1)).unwrap();
        let got = sub_a.recv().await.unwrap();
        assert_eq!(got["params"]["update"]["n"], 1);
    }

    #[tokio::test]
    async fn slow_subscriber_lags_without_blocking_producer() {
        let bus = SessionEventBus::new();
        let tx = bus.open("s1").await;
        let mut slow = bus.subscribe("s1").await.unwrap();

        // Overflow the subscriber's queue.
        for n in 0..(SUBSCRIBER_CAPACITY as u64 + 50) {
            tx.send(frame("s1", n)).unwrap();
        }

        match slow.recv().await {
            Err(broadcast::error::RecvError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        // After the lag, the stream continues with newer frames.
        assert!(slow.recv().await.is_ok());
    }

    #[tokio::test]
    async fn closed_session_has_no_history() {
        let bus = SessionEventBus::new();
        bus.open("s1").await;
        bus.publish("s1", frame("s1", 1)).await;
        bus.close("s1").await;
        assert!(bus.history("s1").await.is_empty());
        assert!(bus.subscribe("s1").await.is_none());
    }
}
