//! Routa ACP broker core.
//!
//! A transport-agnostic library for brokering agent sessions: spawning and
//! supervising agent CLI child processes (OpenCode, Gemini, Codex,
//! Copilot, Auggie, Kimi, Claude Code, plus registry-distributed agents),
//! exchanging JSON-RPC over their stdio, normalizing every provider
//! dialect into one canonical `session/update` event vocabulary, and
//! fanning the stream out to subscribers.
//!
//! The HTTP/SSE surface lives in `routa-acp-server`; this crate has no
//! web-framework dependency so it can be embedded anywhere (desktop
//! shell, CLI, serverless function).

pub mod adapters;
pub mod error;
pub mod events;
pub mod host;
pub mod mcp;
pub mod process;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod shell_env;
pub mod trace;

#[cfg(test)]
pub mod testutil;

pub use adapters::{AgentHandle, PromptResult};
pub use error::{AgentInfo, AuthMethod, BrokerError};
pub use events::{SessionEventBus, SUBSCRIBER_CAPACITY};
pub use mcp::{CustomMcpServer, McpConfigWriter, McpMaterial};
pub use process::AgentProcess;
pub use registry::{AgentProcessConfig, Preset, PresetCatalog};
pub use registry::warmup::WarmupService;
pub use runtime::{AgentPaths, RuntimeKind, RuntimeManager};
pub use session::{CreateSessionParams, SessionManager, SessionRecord};
