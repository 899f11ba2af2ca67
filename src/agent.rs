//! LLM-backed reasoning: keyword intents, prompts and reply parsing

mod intent;
mod prompt;
mod reasoner;

pub use intent::{Intent, IntentKind, IntentParser};
pub use prompt::ReplyParser;
pub use reasoner::LlmCapabilities;
