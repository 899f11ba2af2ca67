//! MCP host - session-scoped streaming chat over MCP tool servers
//!
//! Turns run either as a single intent-driven tool call or as a bounded
//! ReAct loop. Progress is streamed to clients over SSE.

mod agent;
mod api;
mod broker;
mod config;
mod gateway;
mod llm;
mod mcp;
mod runtime;
mod session;
mod state_machine;

use agent::LlmCapabilities;
use api::{create_router, AppState};
use broker::EventBroker;
use config::{load_server_configs, HostConfig};
use gateway::{AuditSink, JsonlAuditLog, MemoryAuditLog, ToolGateway};
use llm::{LlmService, LoggingService, OpenAIService, UnconfiguredService};
use mcp::McpManager;
use runtime::{TurnDispatcher, TurnServices};
use session::{ConversationStore, SessionReaper, MAX_TURNS};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mcp_host=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = HostConfig::from_env()?;

    // MCP servers
    let server_configs = load_server_configs(&config.mcp_servers_config)?;
    let manager = Arc::new(McpManager::connect_all(&server_configs, config.tool_timeout).await);
    tracing::info!(
        configured = server_configs.len(),
        connected = manager.connected_count(),
        "MCP servers initialized"
    );

    let audit: Arc<dyn AuditSink> = match JsonlAuditLog::open(&config.audit_log).await {
        Ok(log) => {
            tracing::info!(path = %config.audit_log.display(), "Audit log opened");
            Arc::new(log)
        }
        Err(e) => {
            tracing::warn!(
                path = %config.audit_log.display(),
                error = %e,
                "Audit log unavailable, keeping records in memory"
            );
            Arc::new(MemoryAuditLog::default())
        }
    };

    // LLM
    let backend: Arc<dyn LlmService> = match config.openai_api_key.as_deref() {
        Some(key) => Arc::new(OpenAIService::new(
            key,
            config.openai_model.as_str(),
            &config.openai_base_url,
            config.temperature,
            config.max_tokens,
        )?),
        None => {
            tracing::warn!("No LLM API key configured. Set OPENAI_API_KEY.");
            Arc::new(UnconfiguredService)
        }
    };
    let llm: Arc<dyn LlmService> = Arc::new(LoggingService::new(backend));

    // Turn services
    let services = TurnServices {
        capabilities: Arc::new(LlmCapabilities::new(llm, manager.clone())),
        gateway: Arc::new(ToolGateway::new(manager.clone(), audit, config.tool_timeout)),
        store: Arc::new(ConversationStore::with_limits(config.session_timeout, MAX_TURNS)),
        broker: Arc::new(EventBroker::with_limits(config.channel_capacity, config.max_connections)),
        turn_timeout: config.turn_timeout,
        context_turns: config.context_turns,
    };
    let store = services.store.clone();
    let broker = services.broker.clone();
    let dispatcher = Arc::new(TurnDispatcher::new(services));

    let cancel = CancellationToken::new();
    let reaper = SessionReaper::new(store, broker)
        .with_interval(config.reaper_interval)
        .with_max_connection_age(config.max_connection_age)
        .with_listener(dispatcher.clone())
        .spawn(cancel.clone());

    // Create router
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let state = AppState::new(dispatcher, manager.clone());
    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(model = %config.openai_model, "MCP host listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cancel.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "Session reaper did not stop cleanly");
    }
    manager.shutdown().await;
    tracing::info!("MCP host stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
