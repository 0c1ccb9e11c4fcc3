//! Chat host: everything between a front-end event and the LLM client.
//!
//! A [`ChatSession`] owns one conversation. [`ChatSession::handle_user_input`]
//! runs a turn under the session's [`GenerationGuard`], builds the prompt,
//! and renders the reply through a [`Renderer`].

pub mod cache;
pub mod collaborators;
pub mod guard;
pub mod orchestrator;
pub mod prompts;
pub mod session;

pub use collaborators::{EmotionDetector, ModelSelector, RecordingRenderer, Renderer};
pub use guard::{GenerationGuard, GenerationPermit, GuardState};
pub use orchestrator::{ReplySource, TurnOutcome, TurnSettings};
pub use prompts::Language;
pub use session::{ChatSession, ModelChange};
