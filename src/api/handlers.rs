//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    ChatRequest, ChatResponse, ErrorResponse, HealthResponse, SendRequest, SendResponse,
    ServersResponse, SessionCreated, StreamQuery, SuccessResponse, ToolsResponse,
};
use super::AppState;
use crate::broker::BrokerError;
use crate::mcp::tools_by_server;
use crate::runtime::{DispatchError, TurnOutcome};
use crate::session::{SessionError, SessionStats};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        // Streamed turns
        .route("/chat/send", post(send_message))
        .route("/chat/stream", get(stream_events))
        // Turn answered in the response body
        .route("/chat", post(chat))
        // Sessions
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(session_stats).delete(delete_session))
        // MCP servers and tools
        .route("/servers", get(list_servers))
        .route("/tools", get(list_tools))
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "message": "MCP 호스트가 실행 중입니다",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected_servers = state
        .servers
        .statuses()
        .into_iter()
        .filter(|s| s.connected)
        .map(|s| s.name)
        .collect();

    Json(HealthResponse {
        status: "healthy",
        connected_servers,
        available_tools_count: state.catalog().len(),
        active_sessions: state.store.active_count(),
        active_workers: state.dispatcher.active_workers(),
        streams: state.broker.stats(),
    })
}

// ============================================================
// Chat
// ============================================================

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendResponse>, AppError> {
    if req.session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session_id is required".to_string()));
    }
    state.store.open(&req.session_id)?;
    let ticket = state
        .dispatcher
        .submit(&req.session_id, &req.message, req.react_mode)?;

    Ok(Json(SendResponse {
        success: true,
        turn_id: ticket.turn_id,
    }))
}

async fn stream_events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Result<impl IntoResponse, AppError> {
    if query.session_id.trim().is_empty() {
        return Err(AppError::BadRequest("session_id is required".to_string()));
    }
    state.store.open(&query.session_id)?;
    state.broker.open_channel(&query.session_id);
    let subscription = state.broker.subscribe(&query.session_id)?;

    Ok(sse_stream(subscription))
}

async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    let session_id = match req.session_id {
        Some(id) if !id.trim().is_empty() => {
            state.store.open(&id)?;
            id
        }
        _ => state.store.create(),
    };

    let ticket = state
        .dispatcher
        .submit(&session_id, &req.message, req.react_mode)?;

    Ok(Json(match ticket.outcome().await {
        TurnOutcome::Answered(text) => ChatResponse {
            success: true,
            session_id,
            response: Some(text),
            error: None,
        },
        TurnOutcome::Failed(error) => ChatResponse {
            success: false,
            session_id,
            response: None,
            error: Some(error),
        },
    }))
}

// ============================================================
// Sessions
// ============================================================

async fn create_session(State(state): State<AppState>) -> Json<SessionCreated> {
    Json(SessionCreated {
        session_id: state.store.create(),
    })
}

async fn session_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionStats>, AppError> {
    Ok(Json(state.store.stats(&id)?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    // Expired first so concurrent sends are refused while the channel is torn down
    state.store.mark_expired(&id)?;
    state.broker.close_channel(&id);
    state.dispatcher.forget(&id);
    state.store.remove(&id);
    tracing::info!(session_id = %id, "Session deleted");
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Servers and tools
// ============================================================

async fn list_servers(State(state): State<AppState>) -> Json<ServersResponse> {
    Json(ServersResponse {
        servers: state.servers.statuses(),
    })
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    let catalog = state.catalog();
    Json(ToolsResponse {
        total_tools: catalog.len(),
        tools_by_server: tools_by_server(&catalog),
        tools: catalog.iter().cloned().collect(),
    })
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Gone(String),
    TooManyRequests(String),
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotFound(_) => AppError::NotFound(e.to_string()),
            SessionError::Expired(_) => AppError::Gone(e.to_string()),
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::Session(e) => e.into(),
            DispatchError::EmptyMessage => AppError::BadRequest(e.to_string()),
        }
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::TooManyRequests(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Gone(msg) => (StatusCode::GONE, msg),
            AppError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
        };

        let body = Json(ErrorResponse::new(message));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LlmCapabilities;
    use crate::broker::EventBroker;
    use crate::gateway::{MemoryAuditLog, ToolGateway};
    use crate::mcp::McpManager;
    use crate::runtime::testing::{MockLlmService, MockToolTransport};
    use crate::runtime::{TurnDispatcher, TurnServices, TURN_TIMEOUT};
    use crate::session::{ConversationStore, DEFAULT_CONTEXT_TURNS};
    use axum::body::Body;
    use axum::http::Request;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app_with_broker(broker: EventBroker) -> (Router, AppState) {
        let tools = Arc::new(MockToolTransport::weather());
        let services = TurnServices {
            capabilities: Arc::new(LlmCapabilities::new(Arc::new(MockLlmService::new()), tools.clone())),
            gateway: Arc::new(ToolGateway::new(
                tools,
                Arc::new(MemoryAuditLog::default()),
                Duration::from_secs(30),
            )),
            store: Arc::new(ConversationStore::new()),
            broker: Arc::new(broker),
            turn_timeout: TURN_TIMEOUT,
            context_turns: DEFAULT_CONTEXT_TURNS,
        };
        let state = AppState::new(Arc::new(TurnDispatcher::new(services)), Arc::new(McpManager::new()));
        (create_router(state.clone()), state)
    }

    fn app() -> (Router, AppState) {
        app_with_broker(EventBroker::new())
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_answers_in_body() {
        let (app, state) = app();

        let response = app
            .oneshot(post_json("/chat", &json!({"message": "서울 날씨"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert!(body["response"].as_str().unwrap().contains("서울: 맑음, 23도"));
        let session_id = body["session_id"].as_str().unwrap();
        assert_eq!(state.store.stats(session_id).unwrap().turn_count, 2);
    }

    #[tokio::test]
    async fn test_send_rejects_empty_message() {
        let (app, _) = app();
        let response = app
            .oneshot(post_json("/chat/send", &json!({"message": "  ", "session_id": "s1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "Message is empty");
    }

    #[tokio::test]
    async fn test_send_then_stream() {
        let (app, state) = app();

        let response = app
            .clone()
            .oneshot(post_json(
                "/chat/send",
                &json!({"message": "안녕하세요", "session_id": "s1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["success"], true);
        assert!(state.store.stats("s1").is_ok());

        let response = app.oneshot(get("/chat/stream?session_id=s1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        let text = String::from_utf8(first.to_vec()).unwrap();
        assert!(text.starts_with("data: {"));
        assert!(text.contains("\"type\":\"session_start\""));
    }

    #[tokio::test]
    async fn test_stream_connection_limit() {
        let (app, _) = app_with_broker(EventBroker::with_limits(16, 1));

        let first = app.clone().oneshot(get("/chat/stream?session_id=a")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = app.oneshot(get("/chat/stream?session_id=b")).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(body_json(second).await["error"]
            .as_str()
            .unwrap()
            .contains("Connection limit exceeded"));
        drop(first);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let (app, _) = app();

        let created = body_json(app.clone().oneshot(post_json("/sessions", &json!({}))).await.unwrap()).await;
        let id = created["session_id"].as_str().unwrap().to_string();

        let stats = app.clone().oneshot(get(&format!("/sessions/{id}"))).await.unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        assert_eq!(body_json(stats).await["turn_count"], 0);

        let deleted = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/sessions/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::OK);

        let missing = app.oneshot(get(&format!("/sessions/{id}"))).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_session_is_gone() {
        let (app, state) = app();
        let id = state.store.create();
        tokio::time::advance(Duration::from_secs(31 * 60)).await;

        let response = app
            .oneshot(post_json("/chat/send", &json!({"message": "hi", "session_id": id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GONE);
    }

    #[tokio::test]
    async fn test_health_and_tools() {
        let (app, _) = app();

        let health = body_json(app.clone().oneshot(get("/health")).await.unwrap()).await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["available_tools_count"], 3);
        assert_eq!(health["streams"]["max_subscriptions"], 50);
        assert_eq!(health["active_workers"], 0);

        let tools = body_json(app.clone().oneshot(get("/tools")).await.unwrap()).await;
        assert_eq!(tools["total_tools"], 3);
        assert_eq!(tools["tools_by_server"]["weather"].as_array().unwrap().len(), 2);
        assert_eq!(tools["tools"][0]["input_schema"]["required"][0], "location");

        let servers = body_json(app.oneshot(get("/servers")).await.unwrap()).await;
        assert!(servers["servers"].as_array().unwrap().is_empty());
    }
}
