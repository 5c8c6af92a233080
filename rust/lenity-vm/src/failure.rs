//! Failure contexts: the tree of nested speculative regions.

use crate::frame::{FrameRef, Pc};
use crate::heap::Heap;
use crate::ids::{ContextId, TaskId, TxId};
use crate::values::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Waiting for the incoming effect token before it may start.
    Pending,
    Active,
    Committed,
    Aborted,
}

/// A context's transaction. Starting is deferred until the effects before
/// the region have completed; commit and abort are no-ops once settled.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub state: TxState,
    id: Option<TxId>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TxState::Pending,
            id: None,
        }
    }
}

impl Transaction {
    pub fn start(&mut self, heap: &mut Heap) {
        if self.state == TxState::Pending {
            self.id = Some(heap.tx_start());
            self.state = TxState::Active;
        }
    }

    /// Journal id while the transaction is open.
    pub fn open_id(&self) -> Option<TxId> {
        match self.state {
            TxState::Active => self.id,
            _ => None,
        }
    }

    /// Keeps the writes; their undo entries move to `into` if given.
    pub fn commit(&mut self, heap: &mut Heap, into: Option<TxId>) {
        match self.state {
            TxState::Active => {
                if let Some(id) = self.id {
                    heap.tx_commit(id, into);
                }
                self.state = TxState::Committed;
            }
            TxState::Pending => self.state = TxState::Committed,
            TxState::Committed | TxState::Aborted => {}
        }
    }

    pub fn abort(&mut self, heap: &mut Heap) {
        match self.state {
            TxState::Active => {
                if let Some(id) = self.id {
                    heap.tx_abort(id);
                }
                self.state = TxState::Aborted;
            }
            TxState::Pending => self.state = TxState::Aborted,
            TxState::Committed | TxState::Aborted => {}
        }
    }
}

#[derive(Debug)]
pub struct FailureContext {
    pub parent: Option<ContextId>,
    pub task: Option<TaskId>,
    /// Frame the region runs in; replaced by a caller-less copy when the
    /// region ends with suspensions still outstanding.
    pub frame: FrameRef,
    pub incoming_effect_token: Value,
    pub before_then_effect_token: Value,
    pub done_effect_token: Value,
    pub failure_pc: Pc,
    pub then_pc: Pc,
    pub done_pc: Pc,
    /// Suspended ops owned by this context that have not yet run.
    pub suspension_count: u32,
    pub failed: bool,
    pub executed_end: bool,
    /// Committed (or replayed after failure); nothing further happens to it.
    pub finished: bool,
    pub transaction: Transaction,
}

impl FailureContext {
    pub fn new(
        parent: Option<ContextId>,
        task: Option<TaskId>,
        frame: FrameRef,
        incoming_effect_token: Value,
        failure_pc: Pc,
    ) -> Self {
        Self {
            parent,
            task,
            frame,
            incoming_effect_token,
            before_then_effect_token: Value::Uninitialized,
            done_effect_token: Value::Uninitialized,
            failure_pc,
            then_pc: Pc::Stop,
            done_pc: Pc::Stop,
            suspension_count: 0,
            failed: false,
            executed_end: false,
            finished: false,
            transaction: Transaction::default(),
        }
    }

    /// Whether the region ended while suspensions were outstanding, so its
    /// then/else range still has to be replayed.
    pub fn is_deferred(&self) -> bool {
        self.executed_end && !self.finished
    }
}
