//! Lenity VM: a lenient register interpreter.
//!
//! Ops whose inputs are unresolved placeholders are queued on those
//! placeholders instead of blocking, failure contexts speculate under
//! transactions and may finish long after their `EndFailureContext`, and
//! tasks are cooperatively scheduled coroutines that can be canceled.

pub mod cell;
pub mod config;
pub mod failure;
pub mod frame;
pub mod heap;
pub mod ids;
pub mod suspension;
pub mod task;
pub mod values;
pub mod vm;

pub use config::VmConfig;
pub use ids::TaskId;
pub use task::TaskPhase;
pub use values::Value;
pub use vm::{
    Completion, DebugEvent, NativeContext, NativeEffects, NativeFunction, NativeResult, Outcome, Vm,
    VmError,
};
