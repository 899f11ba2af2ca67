//! Turn dispatch
//!
//! Each session gets one worker task that runs its turns strictly in arrival
//! order. A turn is either single-shot (intent, optional tool, response) or a
//! bounded ReAct loop; both publish through a `TurnPublisher` and end in
//! exactly one `final_response` or `error` event.

mod controller;
mod publisher;
mod single_shot;
mod traits;

#[cfg(test)]
pub mod testing;

use controller::ReactController;
use publisher::TurnPublisher;
pub use traits::Capabilities;

use crate::broker::{EventBroker, EventSender};
use crate::gateway::ToolGateway;
use crate::session::{
    ConversationStore, ExpiryListener, SessionError, SessionHandle, ToolInvocationRef, Turn,
};
use crate::state_machine::{Observation, ToolCall};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Default bound on one whole turn
pub const TURN_TIMEOUT: Duration = Duration::from_secs(120);

/// How a turn ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "text", rename_all = "snake_case")]
pub enum TurnOutcome {
    Answered(String),
    Failed(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("Message is empty")]
    EmptyMessage,
}

/// Everything a turn needs, built once at startup
pub struct TurnServices {
    pub capabilities: Arc<dyn Capabilities>,
    pub gateway: Arc<ToolGateway>,
    pub store: Arc<ConversationStore>,
    pub broker: Arc<EventBroker>,
    pub turn_timeout: Duration,
    pub context_turns: usize,
}

/// Append the assistant turn. The session may have expired or been deleted
/// mid-turn, in which case the answer was still streamed but is not kept.
fn persist(session: &SessionHandle, session_id: &str, turn: Turn) {
    if let Err(e) = session.append(turn) {
        tracing::warn!(session_id = %session_id, error = %e, "Assistant turn not stored");
    }
}

/// Call a tool through the gateway; failures become failure observations.
///
/// The call runs on its own task: a turn that stops waiting does not cut it
/// short, so the gateway still audits its completion.
async fn invoke_tool(gateway: &Arc<ToolGateway>, call: ToolCall) -> Observation {
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let task = {
        let gateway = gateway.clone();
        let call = call.clone();
        let correlation_id = correlation_id.clone();
        tokio::spawn(async move {
            gateway
                .invoke(&call.server, &call.tool, call.arguments, &correlation_id)
                .await
        })
    };
    match task.await {
        Ok(Ok(success)) => Observation::success(call, correlation_id, success.text),
        Ok(Err(e)) => Observation::failure(call, correlation_id, e.to_string()),
        Err(e) => {
            tracing::error!(correlation_id = %correlation_id, error = %e, "Tool task failed");
            Observation::failure(call, correlation_id, format!("Tool task failed: {e}"))
        }
    }
}

fn invocation_ref(observation: &Observation) -> ToolInvocationRef {
    ToolInvocationRef {
        correlation_id: observation.correlation_id.clone(),
        server: observation.call.server.clone(),
        tool: observation.call.tool.clone(),
        ok: observation.ok,
    }
}

/// A turn waiting for its session worker. It is bound to the session and
/// channel that existed at submit time, so a delete and re-open of the same
/// id cannot receive its writes.
struct QueuedTurn {
    turn_id: String,
    message: String,
    react_mode: bool,
    session: SessionHandle,
    events: EventSender,
    reply: oneshot::Sender<TurnOutcome>,
}

/// Handle to a submitted turn
#[derive(Debug)]
pub struct TurnTicket {
    pub turn_id: String,
    outcome: oneshot::Receiver<TurnOutcome>,
}

impl TurnTicket {
    /// Wait for the turn to end
    pub async fn outcome(self) -> TurnOutcome {
        self.outcome
            .await
            .unwrap_or_else(|_| TurnOutcome::Failed("Turn was dropped before it finished".to_string()))
    }
}

pub struct TurnDispatcher {
    services: Arc<TurnServices>,
    workers: Mutex<HashMap<String, mpsc::UnboundedSender<QueuedTurn>>>,
}

impl TurnDispatcher {
    pub fn new(services: TurnServices) -> Self {
        Self {
            services: Arc::new(services),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &TurnServices {
        &self.services
    }

    /// Queue a turn on the session's worker. The session must exist and be
    /// live; the user turn itself is appended when the worker picks it up.
    pub fn submit(&self, session_id: &str, message: &str, react_mode: bool) -> Result<TurnTicket, DispatchError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(DispatchError::EmptyMessage);
        }
        let session = self.services.store.handle(session_id)?;
        let events = self.services.broker.open_channel(session_id);

        let turn_id = uuid::Uuid::new_v4().to_string();
        let (reply, outcome) = oneshot::channel();
        let mut turn = QueuedTurn {
            turn_id: turn_id.clone(),
            message: message.to_string(),
            react_mode,
            session,
            events,
            reply,
        };

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = workers.get(session_id) {
            match sender.send(turn) {
                Ok(()) => {
                    tracing::debug!(session_id = %session_id, turn_id = %turn_id, "Turn queued");
                    return Ok(TurnTicket { turn_id, outcome });
                }
                // The worker is gone; start a fresh one below
                Err(mpsc::error::SendError(returned)) => turn = returned,
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        // A fresh receiver is alive, so this send cannot fail
        let _ = sender.send(turn);
        workers.insert(session_id.to_string(), sender);
        drop(workers);

        tokio::spawn(worker(self.services.clone(), session_id.to_string(), receiver));
        tracing::info!(session_id = %session_id, turn_id = %turn_id, "Session worker started");
        Ok(TurnTicket { turn_id, outcome })
    }

    /// Release a session's worker; turns already queued still run
    pub fn forget(&self, session_id: &str) {
        let removed = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        if removed.is_some() {
            tracing::debug!(session_id = %session_id, "Session worker released");
        }
    }

    pub fn active_workers(&self) -> usize {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl ExpiryListener for TurnDispatcher {
    fn session_expired(&self, session_id: &str) {
        self.forget(session_id);
    }
}

async fn worker(services: Arc<TurnServices>, session_id: String, mut turns: mpsc::UnboundedReceiver<QueuedTurn>) {
    while let Some(turn) = turns.recv().await {
        let outcome = run_turn(&services, &session_id, &turn).await;
        // The caller may have stopped waiting
        let _ = turn.reply.send(outcome);
    }
    tracing::debug!(session_id = %session_id, "Session worker stopped");
}

async fn run_turn(services: &TurnServices, session_id: &str, turn: &QueuedTurn) -> TurnOutcome {
    let started = Instant::now();
    let publisher = TurnPublisher::new(turn.events.clone(), session_id, &turn.turn_id);

    // History is read before the new message is stored so it only holds
    // earlier turns
    let history = turn
        .session
        .recent_context(services.context_turns)
        .and_then(|history| {
            turn.session
                .append(Turn::user(turn.message.clone()))
                .map(|()| history)
        });
    let history = match history {
        Ok(history) => history,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "Turn rejected");
            let error = e.to_string();
            publisher.error(&error);
            return TurnOutcome::Failed(error);
        }
    };

    tracing::info!(
        session_id = %session_id,
        turn_id = %turn.turn_id,
        react_mode = turn.react_mode,
        history = history.len(),
        "Turn started"
    );

    let limit = services.turn_timeout;
    let outcome = if turn.react_mode {
        ReactController::new(services, &publisher, &turn.session, &turn.message, &history)
            .run(limit)
            .await
    } else {
        match tokio::time::timeout(
            limit,
            single_shot::run(services, &publisher, &turn.session, &turn.message, &history),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let error = format!("Turn timed out after {}s", limit.as_secs());
                tracing::warn!(session_id = %session_id, turn_id = %turn.turn_id, "Single-shot turn timed out");
                publisher.error(&error);
                TurnOutcome::Failed(error)
            }
        }
    };

    tracing::info!(
        session_id = %session_id,
        turn_id = %turn.turn_id,
        duration_ms = %started.elapsed().as_millis(),
        answered = matches!(outcome, TurnOutcome::Answered(_)),
        "Turn finished"
    );
    outcome
}
