//! Agent module: app state, the loop state machine and the orchestrator.

pub mod loop_state;
pub mod orchestrator;
pub mod state;

pub use loop_state::LoopState;
pub use orchestrator::{AgentDeps, Orchestrator, SendOutcome, UserMessage};
pub use state::{AgentEvent, AppState};
