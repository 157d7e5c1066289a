//! Canonical event vocabulary, per-session fanout, and normalization.

pub mod bus;
pub mod checklist;
pub mod normalizer;
pub mod types;

pub use bus::{SessionEventBus, SUBSCRIBER_CAPACITY};
pub use checklist::{parse_checklist, ChecklistItem, ChecklistStatus};
pub use normalizer::Normalizer;
pub use types::{
    session_notification, split_notification, update_kind, EventKind, ToolStatus,
};
