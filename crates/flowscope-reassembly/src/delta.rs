//! Deltas produced while reassembling a stream

use flowscope_core::error::FlowError;

/// One observable step of stream reassembly, consumed by the capture layer
/// to drive `FlowUpdated` events and terminal transitions.
#[derive(Debug, Clone)]
pub enum FlowDelta {
    /// A content text suffix.
    Content(String),
    /// A thinking text suffix.
    Thinking(String),
    /// A tool call became visible (name may still grow for OpenAI).
    ToolCallStarted { name: String },
    /// The stream reported its stop reason.
    StopReason(String),
    /// The stream terminated cleanly.
    Terminator,
    /// The stream reported an error; the Flow should fail.
    StreamError(FlowError),
    /// An event could not be decoded and was skipped.
    Malformed,
}
