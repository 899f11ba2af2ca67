//! Conversation sessions
//!
//! Sessions hold the bounded turn history for one browser conversation and
//! expire after a period of inactivity.

mod reaper;
mod store;

pub use reaper::{ExpiryListener, SessionReaper, REAP_INTERVAL};
pub use store::{
    ConversationStore, Role, SessionError, SessionHandle, SessionStats, ToolInvocationRef, Turn,
    DEFAULT_CONTEXT_TURNS, MAX_TURNS, SESSION_TIMEOUT,
};
