//! Interpreter limits and switches.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum depth of the frame chain.
    pub max_call_depth: usize,
    /// Maximum nesting of interpreters started from the suspension loop
    /// (lenient calls, then/else replays).
    pub max_lenient_depth: usize,
    /// Ops executed per host entry point before giving up. `None` means no
    /// limit.
    pub max_instructions: Option<u64>,
    /// Emit a `trace!` event for every executed op.
    pub trace_execution: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_lenient_depth: 64,
            max_instructions: None,
            trace_execution: false,
        }
    }
}
