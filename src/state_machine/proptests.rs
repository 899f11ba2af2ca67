//! Property-based tests for the state machine
//!
//! Drives whole turns through `transition` with arbitrary reasoner replies
//! and tool outcomes, applying effects the way the controller does.

use super::state::MAX_ITERATIONS;
use super::*;
use proptest::prelude::*;
use serde_json::json;

#[derive(Debug, Clone)]
enum Reply {
    /// Calls for a city starting with `x` fail
    Tool { city: String },
    Final,
    Fail,
}

fn arb_reply() -> impl Strategy<Value = Reply> {
    prop_oneof![
        6 => "[a-z]{1,6}".prop_map(|city| Reply::Tool { city }),
        1 => Just(Reply::Final),
        1 => Just(Reply::Fail),
    ]
}

#[derive(Debug, Default)]
struct Outcome {
    trace: ReactTrace,
    state: Option<ReactState>,
    streamed: usize,
    failed: usize,
    invoked: usize,
    persisted: usize,
    effects_after_terminal: usize,
}

/// Run one turn; replies beyond the script are final answers
fn run(replies: &[Reply]) -> Outcome {
    let mut outcome = Outcome {
        trace: ReactTrace::new("날씨 비교"),
        ..Outcome::default()
    };
    let mut script = replies.iter();
    let mut state = ReactState::Thinking { iteration: 1 };
    let mut queue: Vec<Effect> = start().effects;
    let mut terminal_seen = false;

    while !queue.is_empty() {
        let effects = std::mem::take(&mut queue);
        for effect in effects {
            if terminal_seen && !matches!(effect, Effect::PersistAnswer { .. }) {
                outcome.effects_after_terminal += 1;
            }
            let event = match effect {
                Effect::RecordStep(step) => {
                    outcome.trace.steps.push(step);
                    None
                }
                Effect::RequestThought { .. } => Some(match script.next() {
                    Some(Reply::Tool { city }) => ReactEvent::Decided(Decision::UseTool {
                        thought: Some("more data".to_string()),
                        call: ToolCall::new("weather", "get_weather", json!({ "location": city })),
                    }),
                    Some(Reply::Fail) => ReactEvent::ThinkFailed {
                        error: "llm down".to_string(),
                    },
                    Some(Reply::Final) | None => ReactEvent::Decided(Decision::Final {
                        thought: None,
                        answer: "done".to_string(),
                    }),
                }),
                Effect::InvokeTool { call } => {
                    outcome.invoked += 1;
                    let city = call.argument("location").unwrap_or_default().to_string();
                    let ok = !city.starts_with('x');
                    let id = format!("c{}", outcome.invoked);
                    Some(ReactEvent::ToolFinished {
                        observation: if ok {
                            Observation::success(call, id, format!("{city} {}", outcome.invoked))
                        } else {
                            Observation::failure(call, id, format!("{city} failed {}", outcome.invoked))
                        },
                    })
                }
                Effect::StreamAnswer { .. } => {
                    outcome.streamed += 1;
                    terminal_seen = true;
                    Some(ReactEvent::AnswerDelivered)
                }
                Effect::FailTurn { .. } => {
                    outcome.failed += 1;
                    terminal_seen = true;
                    None
                }
                Effect::PersistAnswer { .. } => {
                    outcome.persisted += 1;
                    None
                }
                Effect::Publish(_) => None,
            };

            if let Some(event) = event {
                let result = transition(&state, &outcome.trace, event).unwrap();
                state = result.new_state;
                queue.extend(result.effects);
            }
        }

        if let ReactState::Observing { .. } = state {
            if queue.is_empty() {
                let result = transition(&state, &outcome.trace, ReactEvent::ObservationRecorded).unwrap();
                state = result.new_state;
                queue.extend(result.effects);
            }
        }
    }

    outcome.state = Some(state);
    outcome
}

fn tool_replies(ok: &[bool]) -> Vec<Reply> {
    ok.iter()
        .enumerate()
        .map(|(i, ok)| Reply::Tool {
            city: if *ok { format!("city{i}") } else { format!("x{i}") },
        })
        .collect()
}

proptest! {
    #[test]
    fn prop_cycles_never_exceed_cap(replies in proptest::collection::vec(arb_reply(), 0..12)) {
        let outcome = run(&replies);
        prop_assert!(outcome.trace.cycles() <= MAX_ITERATIONS);
        prop_assert!(outcome.invoked <= MAX_ITERATIONS as usize);
    }

    #[test]
    fn prop_exactly_one_terminal(replies in proptest::collection::vec(arb_reply(), 0..12)) {
        let outcome = run(&replies);
        prop_assert_eq!(outcome.streamed + outcome.failed, 1);
        prop_assert_eq!(outcome.effects_after_terminal, 0);
        let state = outcome.state.unwrap();
        prop_assert!(state.is_terminal());
        if outcome.failed == 1 {
            prop_assert_eq!(outcome.persisted, 0);
        } else {
            prop_assert_eq!(outcome.persisted, 1);
            prop_assert_eq!(state, ReactState::Done);
        }
    }

    #[test]
    fn prop_tool_failures_do_not_end_turn(ok in proptest::collection::vec(any::<bool>(), 1..5)) {
        let outcome = run(&tool_replies(&ok));
        prop_assert_eq!(outcome.failed, 0);
        prop_assert_eq!(outcome.streamed, 1);
    }
}

#[test]
fn test_endless_tool_use_yields_one_summary() {
    let ok = vec![true; 10];
    let outcome = run(&tool_replies(&ok));
    assert_eq!(outcome.trace.cycles(), MAX_ITERATIONS);
    assert_eq!(outcome.invoked, MAX_ITERATIONS as usize);
    assert_eq!(outcome.streamed, 1);
    assert_eq!(outcome.state, Some(ReactState::Done));
}
