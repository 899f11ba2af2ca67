//! Pure state transition function
//!
//! Given the same state, trace and event, `transition` always produces the
//! same result and performs no I/O.

use super::event::{Decision, ReactEvent};
use super::state::{ReactState, ReactTrace, Step, MAX_ITERATIONS};
use super::{Effect, Notice};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ReactState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ReactState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error, PartialEq)]
pub enum TransitionError {
    #[error("Turn already finished")]
    AlreadyTerminal,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Entry into the first Thinking step
pub fn start() -> TransitionResult {
    think(1)
}

fn think(iteration: u32) -> TransitionResult {
    TransitionResult::new(ReactState::Thinking { iteration }).with_effects([
        Effect::thinking(iteration, format!("생각하는 중... (단계 {iteration})")),
        Effect::RequestThought { iteration },
    ])
}

fn respond(answer: String, forced: bool) -> TransitionResult {
    TransitionResult::new(ReactState::Responding {
        answer: answer.clone(),
        forced,
    })
    .with_effect(Effect::StreamAnswer { answer })
}

fn fail(error: String) -> TransitionResult {
    TransitionResult::new(ReactState::Failed {
        error: error.clone(),
    })
    .with_effect(Effect::FailTurn { error })
}

pub fn transition(
    state: &ReactState,
    trace: &ReactTrace,
    event: ReactEvent,
) -> Result<TransitionResult, TransitionError> {
    match (state, event) {
        (ReactState::Thinking { iteration }, ReactEvent::Decided(decision)) => {
            let iteration = *iteration;
            let mut effects = Vec::new();
            if let Some(thought) = decision.thought() {
                effects.push(Effect::thought(thought));
                effects.push(Effect::thinking(iteration, format!("사고: {thought}")));
            }

            match decision {
                Decision::Final { answer, .. } if answer.trim().is_empty() => {
                    Ok(respond(trace.summary(), true).with_effects_first(effects))
                }
                Decision::Final { answer, .. } => Ok(respond(answer, false).with_effects_first(effects)),
                // The cap is reached: the would-be next action is skipped
                Decision::UseTool { .. } if trace.cycles() >= MAX_ITERATIONS => {
                    Ok(respond(trace.summary(), true).with_effects_first(effects))
                }
                Decision::UseTool { call, .. } => {
                    effects.push(Effect::RecordStep(Step::Action { call: call.clone() }));
                    effects.push(Effect::acting(
                        iteration,
                        format!("행동 실행 중: {}", call.describe()),
                    ));
                    effects.push(Effect::Publish(Notice::ToolCall { call: call.clone() }));
                    effects.push(Effect::InvokeTool { call: call.clone() });
                    Ok(TransitionResult::new(ReactState::Acting { iteration, call }).with_effects(effects))
                }
            }
        }

        (ReactState::Thinking { .. }, ReactEvent::ThinkFailed { error }) => Ok(fail(error)),

        // Tool failures are data: they become an observation like any result
        (ReactState::Acting { iteration, .. }, ReactEvent::ToolFinished { observation }) => {
            Ok(TransitionResult::new(ReactState::Observing {
                iteration: *iteration,
                observation: observation.clone(),
            })
            .with_effects([
                Effect::observing(*iteration, format!("결과 관찰: {}", observation.render())),
                Effect::Publish(Notice::ToolResult {
                    observation: observation.clone(),
                }),
                Effect::RecordStep(Step::Observation { observation }),
            ]))
        }

        (ReactState::Observing { iteration, .. }, ReactEvent::ObservationRecorded) => {
            if trace.cycles() >= MAX_ITERATIONS || trace.stagnated() {
                Ok(respond(trace.summary(), true))
            } else {
                Ok(think(iteration + 1))
            }
        }

        (ReactState::Responding { answer, .. }, ReactEvent::AnswerDelivered) => {
            Ok(TransitionResult::new(ReactState::Done).with_effect(Effect::PersistAnswer {
                answer: answer.clone(),
            }))
        }

        (s, _) if s.is_terminal() => Err(TransitionError::AlreadyTerminal),

        (_, ReactEvent::TimedOut { after_secs }) => Ok(fail(format!("Turn timed out after {after_secs}s"))),

        (s, e) => Err(TransitionError::InvalidTransition(format!(
            "{} cannot handle {e:?}",
            s.name()
        ))),
    }
}

impl TransitionResult {
    fn with_effects_first(mut self, mut first: Vec<Effect>) -> Self {
        first.append(&mut self.effects);
        self.effects = first;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::{Observation, ToolCall};
    use serde_json::json;

    fn weather(location: &str) -> ToolCall {
        ToolCall::new("weather", "get_weather", json!({ "location": location }))
    }

    fn use_tool(location: &str) -> ReactEvent {
        ReactEvent::Decided(Decision::UseTool {
            thought: Some(format!("{location} 날씨가 필요합니다")),
            call: weather(location),
        })
    }

    #[test]
    fn test_start_requests_thought() {
        let result = start();
        assert_eq!(result.new_state, ReactState::Thinking { iteration: 1 });
        assert!(matches!(result.effects[0], Effect::Publish(Notice::Thinking { iteration: 1, .. })));
        assert_eq!(result.effects[1], Effect::RequestThought { iteration: 1 });
    }

    #[test]
    fn test_use_tool_enters_acting() {
        let trace = ReactTrace::new("서울 날씨");
        let result = transition(&ReactState::Thinking { iteration: 1 }, &trace, use_tool("서울")).unwrap();

        assert_eq!(
            result.new_state,
            ReactState::Acting {
                iteration: 1,
                call: weather("서울")
            }
        );
        assert!(matches!(result.effects[0], Effect::RecordStep(Step::Thought { .. })));
        assert!(matches!(result.effects[1], Effect::Publish(Notice::Thinking { .. })));
        assert!(matches!(result.effects[2], Effect::RecordStep(Step::Action { .. })));
        assert!(matches!(result.effects[3], Effect::Publish(Notice::Acting { .. })));
        assert!(matches!(result.effects[4], Effect::Publish(Notice::ToolCall { .. })));
        assert_eq!(result.effects[5], Effect::InvokeTool { call: weather("서울") });
    }

    #[test]
    fn test_final_answer_streams() {
        let trace = ReactTrace::new("안녕");
        let event = ReactEvent::Decided(Decision::Final {
            thought: None,
            answer: "안녕하세요".to_string(),
        });
        let result = transition(&ReactState::Thinking { iteration: 1 }, &trace, event).unwrap();

        assert_eq!(
            result.new_state,
            ReactState::Responding {
                answer: "안녕하세요".to_string(),
                forced: false
            }
        );
        assert_eq!(
            result.effects,
            vec![Effect::StreamAnswer {
                answer: "안녕하세요".to_string()
            }]
        );
    }

    #[test]
    fn test_failed_tool_is_observed() {
        let trace = ReactTrace::new("서울 날씨");
        let state = ReactState::Acting {
            iteration: 1,
            call: weather("서울"),
        };
        let observation = Observation::failure(weather("서울"), "c1", "Transport error: broken pipe");
        let result = transition(&state, &trace, ReactEvent::ToolFinished { observation }).unwrap();

        assert!(matches!(result.new_state, ReactState::Observing { iteration: 1, .. }));
        match &result.effects[0] {
            Effect::Publish(Notice::Observing { text, .. }) => {
                assert!(text.contains("실행 실패: Transport error: broken pipe"));
            }
            other => panic!("unexpected effect {other:?}"),
        }
    }

    #[test]
    fn test_observation_loops_back() {
        let mut trace = ReactTrace::new("서울 날씨");
        trace.steps.push(Step::Observation {
            observation: Observation::success(weather("서울"), "c1", "서울: 맑음, 23도"),
        });
        let state = ReactState::Observing {
            iteration: 1,
            observation: Observation::success(weather("서울"), "c1", "서울: 맑음, 23도"),
        };
        let result = transition(&state, &trace, ReactEvent::ObservationRecorded).unwrap();
        assert_eq!(result.new_state, ReactState::Thinking { iteration: 2 });
    }

    #[test]
    fn test_fifth_observation_forces_response() {
        let mut trace = ReactTrace::new("날씨 비교");
        for (i, city) in ["서울", "부산", "대구", "인천", "광주"].iter().enumerate() {
            trace.steps.push(Step::Observation {
                observation: Observation::success(weather(city), format!("c{i}"), format!("{city}: 맑음")),
            });
        }
        let state = ReactState::Observing {
            iteration: 5,
            observation: Observation::success(weather("광주"), "c4", "광주: 맑음"),
        };
        let result = transition(&state, &trace, ReactEvent::ObservationRecorded).unwrap();

        assert!(matches!(result.new_state, ReactState::Responding { forced: true, .. }));
        assert!(matches!(result.effects[..], [Effect::StreamAnswer { .. }]));
    }

    #[test]
    fn test_action_at_cap_is_skipped() {
        let mut trace = ReactTrace::new("q");
        for i in 0..MAX_ITERATIONS {
            trace.steps.push(Step::Observation {
                observation: Observation::success(weather("서울"), format!("c{i}"), format!("result {i}")),
            });
        }
        let result = transition(&ReactState::Thinking { iteration: 6 }, &trace, use_tool("부산")).unwrap();

        assert!(matches!(result.new_state, ReactState::Responding { forced: true, .. }));
        assert!(!result.effects.iter().any(|e| matches!(e, Effect::InvokeTool { .. })));
    }

    #[test]
    fn test_think_failure_fails_turn() {
        let trace = ReactTrace::new("q");
        let result = transition(
            &ReactState::Thinking { iteration: 1 },
            &trace,
            ReactEvent::ThinkFailed {
                error: "rate limited".to_string(),
            },
        )
        .unwrap();
        assert_eq!(
            result.new_state,
            ReactState::Failed {
                error: "rate limited".to_string()
            }
        );
        assert_eq!(
            result.effects,
            vec![Effect::FailTurn {
                error: "rate limited".to_string()
            }]
        );
    }

    #[test]
    fn test_timeout_from_any_live_state() {
        let trace = ReactTrace::new("q");
        let state = ReactState::Acting {
            iteration: 2,
            call: weather("서울"),
        };
        let result = transition(&state, &trace, ReactEvent::TimedOut { after_secs: 120 }).unwrap();
        assert!(matches!(result.new_state, ReactState::Failed { .. }));
    }

    #[test]
    fn test_terminal_states_reject_events() {
        let trace = ReactTrace::new("q");
        assert_eq!(
            transition(&ReactState::Done, &trace, ReactEvent::TimedOut { after_secs: 1 }).unwrap_err(),
            TransitionError::AlreadyTerminal
        );
        assert!(transition(
            &ReactState::Failed {
                error: "x".to_string()
            },
            &trace,
            ReactEvent::AnswerDelivered
        )
        .is_err());
    }

    #[test]
    fn test_mismatched_event_is_invalid() {
        let trace = ReactTrace::new("q");
        let err = transition(&ReactState::Thinking { iteration: 1 }, &trace, ReactEvent::AnswerDelivered)
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition(_)));
    }
}
