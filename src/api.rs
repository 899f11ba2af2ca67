//! HTTP API for the MCP host

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;
#[allow(unused_imports)] // Public API re-exports
pub use types::*;

use crate::broker::EventBroker;
use crate::gateway::ToolCatalog;
use crate::mcp::McpManager;
use crate::runtime::TurnDispatcher;
use crate::session::ConversationStore;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ConversationStore>,
    pub broker: Arc<EventBroker>,
    pub dispatcher: Arc<TurnDispatcher>,
    pub servers: Arc<McpManager>,
}

impl AppState {
    pub fn new(dispatcher: Arc<TurnDispatcher>, servers: Arc<McpManager>) -> Self {
        let services = dispatcher.services();
        Self {
            store: services.store.clone(),
            broker: services.broker.clone(),
            dispatcher,
            servers,
        }
    }

    pub fn catalog(&self) -> ToolCatalog {
        self.dispatcher.services().gateway.catalog()
    }
}
