//! Cooperatively scheduled tasks.

use crate::cell::SavedCell;
use crate::frame::{FrameRef, Pc};
use crate::ids::TaskId;
use crate::values::Value;
use crate::vm::Vm;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    Active,
    /// Cancellation asked for while the task was running; takes effect at its
    /// next suspension or at `EndTask`.
    CancelRequested,
    /// Cancellation under way; children are being canceled first.
    CancelStarted,
    /// Running its cleanup blocks towards `EndTask`.
    CancelUnwinding,
    Canceled,
}

impl TaskPhase {
    pub fn is_canceling(self) -> bool {
        matches!(self, TaskPhase::CancelStarted | TaskPhase::CancelUnwinding)
    }
}

/// One-shot cleanup registered by a native for the task that called it. Runs
/// exactly once, when the task is resumed or torn down.
pub type NativeDefer = Box<dyn FnOnce(&mut Vm, TaskId)>;

pub struct Task {
    pub phase: TaskPhase,
    /// On the current control path (not parked).
    pub running: bool,
    pub finished: bool,
    pub yield_pc: Pc,
    pub yield_frame: Option<FrameRef>,
    pub yield_task: Option<TaskId>,
    pub resume_pc: Pc,
    pub resume_frame: Option<FrameRef>,
    /// Defined with the wake-up value when the task resumes.
    pub resume_slot: Value,
    pub parent: Option<TaskId>,
    pub children: Vec<TaskId>,
    pub awaiters: Vec<TaskId>,
    pub cancellers: Vec<TaskId>,
    pub native_defer: Option<NativeDefer>,
    pub result: Value,
}

impl Task {
    pub fn new(
        parent: Option<TaskId>,
        yield_pc: Pc,
        yield_frame: Option<FrameRef>,
        yield_task: Option<TaskId>,
    ) -> Self {
        Self {
            phase: TaskPhase::Active,
            running: true,
            finished: false,
            yield_pc,
            yield_frame,
            yield_task,
            resume_pc: Pc::Stop,
            resume_frame: None,
            resume_slot: Value::Uninitialized,
            parent,
            children: Vec::new(),
            awaiters: Vec::new(),
            cancellers: Vec::new(),
            native_defer: None,
            result: Value::Uninitialized,
        }
    }

    /// Suspended and able to be woken.
    pub fn is_parked(&self) -> bool {
        !self.running && !self.finished
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("phase", &self.phase)
            .field("running", &self.running)
            .field("finished", &self.finished)
            .field("yield_pc", &self.yield_pc)
            .field("resume_pc", &self.resume_pc)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .field("awaiters", &self.awaiters)
            .field("cancellers", &self.cancellers)
            .field("has_defer", &self.native_defer.is_some())
            .finish()
    }
}

/// Everything a host-driven wake changes on a parked task. Restoring it puts
/// the task back where it parked after the resumption aborted. The native
/// defer consumed by the wake is not part of it: it runs at most once.
pub(crate) struct ParkedState {
    phase: TaskPhase,
    yield_pc: Pc,
    yield_frame: Option<FrameRef>,
    yield_task: Option<TaskId>,
    resume_pc: Pc,
    resume_frame: Option<FrameRef>,
    resume_slot: Value,
    slot_cell: Option<SavedCell>,
    registers: Option<Vec<Value>>,
}

impl Vm {
    pub(crate) fn save_parked(&mut self, task: TaskId) -> ParkedState {
        let t = &self.tasks[task.index()];
        let mut state = ParkedState {
            phase: t.phase,
            yield_pc: t.yield_pc,
            yield_frame: t.yield_frame.clone(),
            yield_task: t.yield_task,
            resume_pc: t.resume_pc,
            resume_frame: t.resume_frame.clone(),
            resume_slot: t.resume_slot.clone(),
            slot_cell: None,
            registers: t.resume_frame.as_ref().map(|f| f.borrow().registers.clone()),
        };
        state.slot_cell = self.heap.save_cell(&state.resume_slot);
        state
    }

    /// Parks `task` again as `state` describes. A task that reached its
    /// `EndTask` meanwhile stays finished.
    pub(crate) fn restore_parked(&mut self, task: TaskId, state: ParkedState) {
        if self.tasks[task.index()].finished {
            tracing::warn!(task = task.0, "aborted resumption finished the task; not re-parked");
            return;
        }
        // Cleanup registered by a park inside the aborted resumption.
        self.run_native_defer(task);
        if let Some(saved) = state.slot_cell {
            self.heap.restore_cell(saved);
        }
        if let (Some(frame), Some(registers)) = (&state.resume_frame, state.registers) {
            frame.borrow_mut().registers = registers;
        }
        let t = &mut self.tasks[task.index()];
        t.running = false;
        t.phase = state.phase;
        t.yield_pc = state.yield_pc;
        t.yield_frame = state.yield_frame;
        t.yield_task = state.yield_task;
        t.resume_pc = state.resume_pc;
        t.resume_frame = state.resume_frame;
        t.resume_slot = state.resume_slot;
        tracing::debug!(task = task.0, "task re-parked after aborted resumption");
    }

    /// Requests cancellation of every child of `task`. Returns whether the
    /// task is left without children.
    pub(crate) fn cancel_children(&mut self, task: TaskId) -> bool {
        let children = self.tasks[task.index()].children.clone();
        for child in children {
            self.request_cancel(child);
        }
        self.tasks[task.index()].children.is_empty()
    }

    /// Depth-first cancellation. A running task is only flagged; a parked one
    /// starts canceling right away and, once it has no children left, is
    /// queued for the host to unwind.
    pub(crate) fn request_cancel(&mut self, task: TaskId) {
        let t = &mut self.tasks[task.index()];
        if t.finished || t.phase != TaskPhase::Active {
            return;
        }
        if t.running {
            t.phase = TaskPhase::CancelRequested;
            return;
        }
        t.phase = TaskPhase::CancelStarted;
        tracing::debug!(task = task.0, "cancel started");
        if self.cancel_children(task) {
            self.pending_unwinds.push_back(task);
        }
    }

    /// Removes `task` from its parent's children. Returns the parent if it is
    /// canceling, parked, and this was its last child.
    pub(crate) fn detach(&mut self, task: TaskId) -> Option<TaskId> {
        let parent = self.tasks[task.index()].parent.take()?;
        let p = &mut self.tasks[parent.index()];
        p.children.retain(|c| *c != task);
        let signal = p.children.is_empty() && p.phase == TaskPhase::CancelStarted && p.is_parked();
        signal.then_some(parent)
    }

    /// Runs and clears the task's native defer, if any.
    pub(crate) fn run_native_defer(&mut self, task: TaskId) {
        if let Some(defer) = self.tasks[task.index()].native_defer.take() {
            defer(self, task);
        }
    }
}
