//! Agent loop state machine.

use serde::{Deserialize, Serialize};

/// Where a turn's loop currently is.
///
/// One round is `Streaming → InspectingCalls → (ExecutingTool |
/// ExecutingEmbeddedCode) → Streaming`. A round without a call or code
/// block ends in `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Waiting on model snapshots.
    Streaming,
    /// Looking at the final response for a call or a fenced block.
    InspectingCalls,
    /// Running the first function call.
    ExecutingTool,
    /// Running the first executable code fence.
    ExecutingEmbeddedCode,
    /// Final answer produced.
    Done,
    /// Stopped by cancellation.
    Aborted,
}

impl LoopState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: LoopState) -> bool {
        use LoopState::*;

        matches!(
            (self, target),
            (Streaming, InspectingCalls) | (Streaming, Aborted) |
            (InspectingCalls, ExecutingTool) | (InspectingCalls, ExecutingEmbeddedCode) |
            (InspectingCalls, Done) | (InspectingCalls, Aborted) |
            // Execution always leads to another model round.
            (ExecutingTool, Streaming) | (ExecutingTool, Aborted) |
            (ExecutingEmbeddedCode, Streaming) | (ExecutingEmbeddedCode, Aborted)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl std::fmt::Display for LoopState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Streaming => "streaming",
            Self::InspectingCalls => "inspecting_calls",
            Self::ExecutingTool => "executing_tool",
            Self::ExecutingEmbeddedCode => "executing_embedded_code",
            Self::Done => "done",
            Self::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}
