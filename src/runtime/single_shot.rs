//! Single-shot turns: ParseIntent, at most one CallTool, GenerateResponse

use super::publisher::TurnPublisher;
use super::traits::Node;
use super::{invoke_tool, invocation_ref, persist, TurnOutcome, TurnServices};
use crate::session::{SessionHandle, Turn};

pub async fn run(
    services: &TurnServices,
    publisher: &TurnPublisher,
    session: &SessionHandle,
    message: &str,
    history: &[Turn],
) -> TurnOutcome {
    let caps = &services.capabilities;
    let intent = caps.parse_intent(message).await;
    tracing::debug!(
        session_id = %publisher.session_id(),
        node = Node::ParseIntent.as_str(),
        intent = ?intent.kind,
        confidence = intent.confidence,
        "Intent selected"
    );

    let mut invocations = Vec::new();
    let observation = match intent.tool_call.clone() {
        Some(call) => {
            publisher.tool_call(Node::CallTool, &call);
            let observation = invoke_tool(&services.gateway, call).await;
            publisher.tool_result(Node::CallTool, &observation);
            invocations.push(invocation_ref(&observation));
            Some(observation)
        }
        None => None,
    };

    match caps
        .generate_response(message, history, &intent, observation.as_ref())
        .await
    {
        Ok(answer) => {
            publisher.stream_answer(&answer);
            persist(
                session,
                publisher.session_id(),
                Turn::assistant(answer.clone()).with_tool_invocations(invocations),
            );
            TurnOutcome::Answered(answer)
        }
        Err(e) => {
            tracing::warn!(
                session_id = %publisher.session_id(),
                kind = e.kind.as_str(),
                error = %e,
                "Response generation failed"
            );
            let error = e.to_string();
            publisher.error(&error);
            TurnOutcome::Failed(error)
        }
    }
}
