//! ReAct turn execution
//!
//! Feeds events into the pure state machine and executes the effects it
//! returns. Only `RequestThought` and `InvokeTool` await; everything else
//! runs to completion, so a timeout can only land between LLM or tool calls.

use super::publisher::TurnPublisher;
use super::traits::Node;
use super::{invoke_tool, invocation_ref, persist, TurnOutcome, TurnServices};
use crate::session::{SessionHandle, ToolInvocationRef, Turn};
use crate::state_machine::{start, transition, Effect, ReactEvent, ReactState, ReactTrace};
use std::collections::VecDeque;
use std::time::Duration;

pub struct ReactController<'a> {
    services: &'a TurnServices,
    publisher: &'a TurnPublisher,
    session: &'a SessionHandle,
    message: &'a str,
    history: &'a [Turn],
    state: ReactState,
    trace: ReactTrace,
    invocations: Vec<ToolInvocationRef>,
    outcome: Option<TurnOutcome>,
}

impl<'a> ReactController<'a> {
    pub fn new(
        services: &'a TurnServices,
        publisher: &'a TurnPublisher,
        session: &'a SessionHandle,
        message: &'a str,
        history: &'a [Turn],
    ) -> Self {
        Self {
            services,
            publisher,
            session,
            message,
            history,
            state: ReactState::Thinking { iteration: 1 },
            trace: ReactTrace::new(message),
            invocations: Vec::new(),
            outcome: None,
        }
    }

    /// Run the turn to a terminal state within `limit`
    pub async fn run(mut self, limit: Duration) -> TurnOutcome {
        let initial = start();
        self.state = initial.new_state;

        let finished = tokio::time::timeout(limit, self.drive(initial.effects.into()))
            .await
            .is_ok();
        if !finished {
            tracing::warn!(
                session_id = %self.publisher.session_id(),
                state = %self.state.name(),
                cycles = self.trace.cycles(),
                "ReAct turn timed out"
            );
            let mut queue = VecDeque::new();
            self.apply(
                ReactEvent::TimedOut {
                    after_secs: limit.as_secs(),
                },
                &mut queue,
            );
            self.drive(queue).await;
        }

        tracing::info!(
            session_id = %self.publisher.session_id(),
            cycles = self.trace.cycles(),
            state = %self.state.name(),
            "ReAct turn finished"
        );
        self.outcome
            .unwrap_or_else(|| TurnOutcome::Failed("turn ended without an answer".to_string()))
    }

    async fn drive(&mut self, mut queue: VecDeque<Effect>) {
        loop {
            while let Some(effect) = queue.pop_front() {
                if let Some(event) = self.execute(effect).await {
                    self.apply(event, &mut queue);
                }
            }
            // The observation is in the trace once its effects have run
            if matches!(self.state, ReactState::Observing { .. }) {
                self.apply(ReactEvent::ObservationRecorded, &mut queue);
                continue;
            }
            break;
        }
    }

    fn apply(&mut self, event: ReactEvent, queue: &mut VecDeque<Effect>) {
        match transition(&self.state, &self.trace, event) {
            Ok(result) => {
                tracing::debug!(
                    from = %self.state.name(),
                    to = %result.new_state.name(),
                    node = Node::for_state(&result.new_state).map_or("none", Node::as_str),
                    "ReAct transition"
                );
                self.state = result.new_state;
                queue.extend(result.effects);
            }
            Err(e) if self.state.is_terminal() => {
                tracing::debug!(error = %e, "Event after turn end ignored");
            }
            Err(e) => {
                tracing::error!(state = %self.state.name(), error = %e, "Invalid ReAct transition");
                let error = e.to_string();
                self.state = ReactState::Failed { error: error.clone() };
                queue.push_back(Effect::FailTurn { error });
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<ReactEvent> {
        match effect {
            Effect::Publish(notice) => {
                self.publisher.notice(notice);
                None
            }
            Effect::RequestThought { iteration } => {
                let decided = self
                    .services
                    .capabilities
                    .think(self.message, self.history, &self.trace)
                    .await;
                Some(match decided {
                    Ok(decision) => ReactEvent::Decided(decision),
                    Err(e) => {
                        tracing::warn!(iteration, kind = e.kind.as_str(), error = %e, "Think failed");
                        ReactEvent::ThinkFailed { error: e.to_string() }
                    }
                })
            }
            Effect::InvokeTool { call } => {
                let observation = invoke_tool(&self.services.gateway, call).await;
                self.invocations.push(invocation_ref(&observation));
                Some(ReactEvent::ToolFinished { observation })
            }
            Effect::RecordStep(step) => {
                self.trace.steps.push(step);
                None
            }
            Effect::StreamAnswer { answer } => {
                self.publisher.stream_answer(&answer);
                Some(ReactEvent::AnswerDelivered)
            }
            Effect::PersistAnswer { answer } => {
                let turn = Turn::assistant(answer.clone())
                    .with_tool_invocations(std::mem::take(&mut self.invocations));
                persist(self.session, self.publisher.session_id(), turn);
                self.outcome = Some(TurnOutcome::Answered(answer));
                None
            }
            Effect::FailTurn { error } => {
                self.publisher.error(&error);
                self.outcome = Some(TurnOutcome::Failed(error));
                None
            }
        }
    }
}
