//! ReAct turn state machine
//!
//! Pure transitions in the Elm style: `transition` maps a state and an event
//! to a new state plus the effects the controller must carry out. All I/O
//! lives in `runtime::controller`.

mod effect;
mod event;
mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::{Effect, Notice};
pub use event::{Decision, ReactEvent};
pub use state::{Observation, ReactState, ReactTrace, ToolCall};
pub use transition::{start, transition};

#[cfg(test)]
pub use state::Step;
