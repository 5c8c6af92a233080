//! The dispatch loop.
//!
//! One interpreter runs one host entry point, or one nested lenient
//! execution (a suspended call, a deferred then/else replay). It is a state
//! machine over `ExecState`:
//!
//! ```text
//! Running --op done, queue empty--> Running
//! Running --op done, queue busy---> Draining --> Unwinding --> Yielded --> Running
//! Running --op failed-------------> Draining      (fail() ran first)
//! Running --task yielded----------> Draining
//! Yielded --pc stopped------------> Terminal
//! ```
//!
//! `Terminal` drains whatever is still queued before returning.

use super::{DebugEvent, Vm, VmError};
use crate::frame::{FrameRef, Pc};
use crate::ids::{ContextId, TaskId};
use crate::suspension::{LambdaAction, Suspension, SuspensionKind};
use crate::task::TaskPhase;
use crate::values::Value;
use lenity_core::Op;
use std::collections::VecDeque;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecState {
    Running,
    Draining,
    Unwinding,
    Yielded,
    Terminal,
}

/// How an op left the main loop. Ops move `pc` themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Fail,
    Yield,
}

pub(crate) struct Interpreter {
    pub(crate) pc: Pc,
    pub(crate) frame: FrameRef,
    /// Innermost failure context of the main path.
    pub(crate) failure: ContextId,
    pub(crate) task: Option<TaskId>,
    /// Ambient effect token: `EffectDone` or a placeholder.
    pub(crate) effect_token: Value,
    pub(crate) outermost_failure: ContextId,
    /// Replays stop once control leaves `[start, end)` of their root frame.
    bounds: Option<(usize, usize)>,
    pub(crate) ready: VecDeque<Suspension>,
}

impl Interpreter {
    pub(crate) fn new(
        pc: Pc,
        frame: FrameRef,
        failure: ContextId,
        task: Option<TaskId>,
        effect_token: Value,
    ) -> Self {
        Self {
            pc,
            frame,
            failure,
            task,
            effect_token,
            outermost_failure: failure,
            bounds: None,
            ready: VecDeque::new(),
        }
    }

    pub(crate) fn run(&mut self, vm: &mut Vm, start: ExecState) -> Result<(), VmError> {
        let mut state = start;
        loop {
            state = match state {
                ExecState::Running => self.step(vm)?,
                ExecState::Draining => {
                    self.drain(vm)?;
                    ExecState::Unwinding
                }
                ExecState::Unwinding => {
                    self.unwind_if_needed(vm);
                    ExecState::Yielded
                }
                ExecState::Yielded => {
                    if self.yield_if_needed(vm)? {
                        ExecState::Running
                    } else {
                        ExecState::Terminal
                    }
                }
                ExecState::Terminal => {
                    self.drain(vm)?;
                    return Ok(());
                }
            };
        }
    }

    fn step(&mut self, vm: &mut Vm) -> Result<ExecState, VmError> {
        let Pc::At(pc) = self.pc else {
            return Ok(ExecState::Terminal);
        };
        let (code, root) = {
            let frame = self.frame.borrow();
            (frame.code.clone(), frame.caller_frame.is_none())
        };
        if let Some((start, end)) = self.bounds {
            if root && !(start..end).contains(&pc) {
                return Ok(ExecState::Terminal);
            }
        }
        let Some(op) = code.procedure.ops.get(pc) else {
            return Err(VmError::Runtime(format!(
                "control ran off the end of `{}` at {}",
                code.procedure.name, pc
            )));
        };

        vm.count_instruction()?;
        if vm.debug_callback.is_some() {
            vm.notify(DebugEvent::Step {
                procedure: code.procedure.name.clone(),
                pc,
                op: op.name(),
            });
        }
        if vm.config.trace_execution {
            trace!(procedure = %code.procedure.name, pc, op = op.name(), "step");
        }

        vm.enter_context(self.failure);
        Ok(match self.exec(vm, &code, pc, op)? {
            Step::Continue if self.ready.is_empty() => ExecState::Running,
            Step::Continue => ExecState::Draining,
            Step::Fail => {
                self.fail(vm, self.failure)?;
                ExecState::Draining
            }
            Step::Yield => ExecState::Draining,
        })
    }

    // ---- Suspension queue ----

    /// Runs queued suspensions until the queue is empty. Work they enqueue is
    /// picked up in the same pass.
    pub(crate) fn drain(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        while let Some(suspension) = self.ready.pop_front() {
            let Suspension { context, task, kind } = suspension;
            if vm.context_failed(context) {
                if let SuspensionKind::Bytecode { .. } = kind {
                    self.finished_suspension_in(vm, context)?;
                }
                continue;
            }
            match kind {
                SuspensionKind::Lambda {
                    action,
                    next_effect_token,
                } => {
                    match action {
                        LambdaAction::StartTransaction => {
                            vm.contexts[context.index()].transaction.start(&mut vm.heap)
                        }
                        LambdaAction::CommitTransaction => vm.commit_context(context),
                    }
                    vm.heap.def(&next_effect_token, &Value::EffectDone, &mut self.ready);
                }
                SuspensionKind::Bytecode { code, pc, captures } => {
                    self.resume(vm, context, task, code, pc, captures)?;
                }
            }
        }
        Ok(())
    }

    /// Runs `[pc, ...)` of `frame` in a fresh interpreter rooted at `failure`
    /// and returns its final effect token.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn run_nested(
        vm: &mut Vm,
        pc: Pc,
        frame: FrameRef,
        failure: ContextId,
        task: Option<TaskId>,
        effect_token: Value,
        bounds: Option<(usize, usize)>,
    ) -> Result<Value, VmError> {
        if vm.lenient_depth >= vm.config.max_lenient_depth {
            return Err(VmError::StackExhausted(vm.config.max_lenient_depth));
        }
        vm.lenient_depth += 1;
        trace!(depth = vm.lenient_depth, ?pc, ?bounds, "nested interpreter");
        let mut nested = Interpreter::new(pc, frame, failure, task, effect_token);
        nested.bounds = bounds;
        let result = nested.run(vm, ExecState::Running);
        vm.lenient_depth -= 1;
        result?;
        Ok(nested.effect_token)
    }

    // ---- Failure ----

    /// Marks `id` failed and rolls back its transaction. A context whose end
    /// already ran has its else range replayed right away.
    pub(crate) fn fail(&mut self, vm: &mut Vm, id: ContextId) -> Result<(), VmError> {
        let ctx = &mut vm.contexts[id.index()];
        if ctx.failed {
            return Ok(());
        }
        ctx.failed = true;
        vm.abort_context(id);
        debug!(context = id.0, "failure context failed");
        if vm.debug_callback.is_some() {
            vm.notify(DebugEvent::ContextFailed { context: id.0 });
        }

        let ctx = &mut vm.contexts[id.index()];
        if !ctx.is_deferred() {
            return Ok(());
        }
        ctx.finished = true;
        let (Pc::At(start), Pc::At(end), Some(parent)) = (ctx.failure_pc, ctx.done_pc, ctx.parent) else {
            return Ok(());
        };
        let frame = ctx.frame.clone();
        let task = ctx.task;
        let incoming = ctx.incoming_effect_token.clone();
        let done = ctx.done_effect_token.clone();

        debug!(context = id.0, start, end, "replaying else range");
        let token = Self::run_nested(vm, Pc::At(start), frame, parent, task, incoming, Some((start, end)))?;
        vm.heap.def(&done, &token, &mut self.ready);
        self.finished_suspension_in(vm, parent)
    }

    /// Accounts for one suspension of `id` having run. A deferred context
    /// whose last suspension finished commits and replays its then range;
    /// that replay itself counted as a suspension of the parent.
    pub(crate) fn finished_suspension_in(&mut self, vm: &mut Vm, id: ContextId) -> Result<(), VmError> {
        let mut current = Some(id);
        while let Some(id) = current {
            let ctx = &mut vm.contexts[id.index()];
            ctx.suspension_count = ctx.suspension_count.saturating_sub(1);
            if ctx.suspension_count > 0 || !ctx.is_deferred() || vm.context_failed(id) {
                return Ok(());
            }

            let ctx = &mut vm.contexts[id.index()];
            ctx.finished = true;
            let (then_pc, failure_pc) = (ctx.then_pc, ctx.failure_pc);
            let parent = ctx.parent;
            let task = ctx.task;
            let frame = ctx.frame.clone();
            let before = ctx.before_then_effect_token.clone();
            let done = ctx.done_effect_token.clone();

            let token = if vm.heap.is_concrete(&before) {
                vm.commit_context(id);
                before
            } else {
                let next = vm.heap.new_placeholder();
                let commit = Suspension {
                    context: id,
                    task,
                    kind: SuspensionKind::Lambda {
                        action: LambdaAction::CommitTransaction,
                        next_effect_token: next.clone(),
                    },
                };
                vm.heap.enqueue(&before, commit, &mut self.ready);
                next
            };
            debug!(context = id.0, "deferred failure context succeeded");

            if let (Pc::At(start), Pc::At(end), Some(parent)) = (then_pc, failure_pc, parent) {
                let token = Self::run_nested(vm, Pc::At(start), frame, parent, task, token, Some((start, end)))?;
                vm.heap.def(&done, &token, &mut self.ready);
            }
            current = parent;
        }
        Ok(())
    }

    /// Moves the main path out of the outermost failed context below
    /// `outermost_failure`, to that context's failure target. Returns whether
    /// anything had failed.
    pub(crate) fn unwind_if_needed(&mut self, vm: &mut Vm) -> bool {
        let mut highest = None;
        let mut current = Some(self.failure);
        while let Some(id) = current {
            let ctx = &vm.contexts[id.index()];
            if ctx.failed {
                highest = Some(id);
            }
            if id == self.outermost_failure {
                break;
            }
            current = ctx.parent;
        }
        let Some(failed) = highest else {
            return false;
        };
        if failed == self.outermost_failure {
            self.pc = Pc::Stop;
            return true;
        }
        let ctx = &vm.contexts[failed.index()];
        self.pc = ctx.failure_pc;
        self.frame = ctx.frame.clone();
        self.effect_token = ctx.incoming_effect_token.clone();
        self.failure = ctx.parent.unwrap_or(self.outermost_failure);
        debug!(context = failed.0, pc = ?self.pc, "unwound to failure target");
        true
    }

    // ---- Task switching ----

    /// Switches away from tasks that stopped running. Returns `false` once
    /// control reaches `Stop`.
    pub(crate) fn yield_if_needed(&mut self, vm: &mut Vm) -> Result<bool, VmError> {
        loop {
            if self.pc == Pc::Stop {
                return Ok(false);
            }
            let Some(task) = self.task else {
                return Ok(true);
            };
            let (running, phase) = {
                let t = &vm.tasks[task.index()];
                (t.running, t.phase)
            };
            if running {
                if phase != TaskPhase::CancelStarted {
                    return Ok(true);
                }
                if vm.cancel_children(task) {
                    self.begin_unwind(vm, task)?;
                    return Ok(true);
                }
            }
            self.suspend(vm, task);
        }
    }

    /// Parks `task` at the current position and continues at its yield point.
    fn suspend(&mut self, vm: &mut Vm, task: TaskId) {
        let t = &mut vm.tasks[task.index()];
        t.running = false;
        t.resume_pc = self.pc;
        t.resume_frame = Some(self.frame.clone());
        let requested = t.phase == TaskPhase::CancelRequested;
        let (pc, frame, next) = (t.yield_pc, t.yield_frame.clone(), t.yield_task);
        debug!(task = task.0, resume = ?self.pc, "task suspended");

        if requested {
            vm.tasks[task.index()].phase = TaskPhase::CancelStarted;
            if vm.cancel_children(task) {
                vm.pending_unwinds.push_back(task);
            }
        }
        self.pc = pc;
        if let Some(frame) = frame {
            self.frame = frame;
        }
        self.task = next;
    }

    /// Sends a canceled task to its innermost cleanup block, or to its
    /// `EndTask` if it is already there.
    pub(crate) fn begin_unwind(&mut self, vm: &mut Vm, task: TaskId) -> Result<(), VmError> {
        vm.tasks[task.index()].phase = TaskPhase::CancelUnwinding;
        let mut frame = self.frame.clone();
        let mut pc = self.pc;
        loop {
            let (target, caller) = {
                let f = frame.borrow();
                let procedure = &f.code.procedure;
                let target = match pc {
                    Pc::At(n) if matches!(procedure.ops.get(n), Some(Op::EndTask { .. })) => Some(n),
                    Pc::At(n) => procedure
                        .unwind_target(n)
                        .and_then(|label| procedure.label_target(label)),
                    Pc::Stop => None,
                };
                (target, f.caller_frame.clone().map(|c| (c, f.caller_pc)))
            };
            if let Some(target) = target {
                debug!(task = task.0, target, "unwinding");
                self.pc = Pc::At(target);
                self.frame = frame;
                return Ok(());
            }
            match caller {
                Some((caller, caller_pc)) => {
                    frame = caller;
                    pc = caller_pc;
                }
                None => {
                    return Err(VmError::Runtime(format!(
                        "task {} was canceled outside any cleanup block",
                        task.0
                    )))
                }
            }
        }
    }

    /// Wakes `woken` tasks, last one first, each yielding back to the one
    /// before it. Tasks that are no longer parked are skipped.
    pub(crate) fn resume_chain(&mut self, vm: &mut Vm, woken: Vec<(TaskId, Option<Value>)>) {
        for (task, value) in woken.into_iter().rev() {
            if !vm.tasks[task.index()].is_parked() {
                continue;
            }
            let yield_to = (self.pc, Some(self.frame.clone()), self.task);
            let (pc, frame) = vm.wake(task, yield_to, value.as_ref(), &mut self.ready);
            self.pc = pc;
            if let Some(frame) = frame {
                self.frame = frame;
            }
            self.task = Some(task);
        }
    }
}
