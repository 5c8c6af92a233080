//! Suspensions: work deferred until a placeholder resolves.

use crate::frame::Code;
use crate::ids::{ContextId, TaskId};
use crate::values::Value;
use std::fmt;
use std::rc::Rc;

/// Operands an op had when it blocked. A fired suspension re-runs the op
/// from these, never from the frame, whose registers may since have been
/// reset and reused.
#[derive(Debug, Clone)]
pub struct Captures {
    /// Use operands in op order (for calls: callee, then arguments).
    pub inputs: Vec<Value>,
    /// Destination cell, or `Uninitialized` for ops without one.
    pub dest: Value,
    /// Effect-threading ops: the token to define once the effect is done.
    /// Calls: the incoming token.
    pub effect_token: Option<Value>,
    /// Calls: the token after the call.
    pub return_effect_token: Option<Value>,
}

/// Native step a lambda suspension performs once its token resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaAction {
    StartTransaction,
    CommitTransaction,
}

#[derive(Clone)]
pub enum SuspensionKind {
    Bytecode {
        code: Rc<Code>,
        pc: usize,
        captures: Captures,
    },
    /// Runs `action` for the owning context, then defines
    /// `next_effect_token` as done.
    Lambda {
        action: LambdaAction,
        next_effect_token: Value,
    },
}

#[derive(Clone)]
pub struct Suspension {
    pub context: ContextId,
    pub task: Option<TaskId>,
    pub kind: SuspensionKind,
}

impl fmt::Debug for Suspension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            SuspensionKind::Bytecode { code, pc, .. } => write!(
                f,
                "Suspension({}@{} in ctx {})",
                code.procedure.name, pc, self.context.0
            ),
            SuspensionKind::Lambda { action, .. } => {
                write!(f, "Suspension({:?} in ctx {})", action, self.context.0)
            }
        }
    }
}
