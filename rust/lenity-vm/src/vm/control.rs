//! Main-loop-only ops: jumps, returns, failure contexts and tasks.

use super::interpreter::{Interpreter, Step};
use super::{DebugEvent, Vm, VmError};
use crate::failure::FailureContext;
use crate::frame::{Code, Pc};
use crate::ids::TaskId;
use crate::suspension::{LambdaAction, Suspension, SuspensionKind};
use crate::task::{Task, TaskPhase};
use crate::values::Value;
use lenity_core::{Label, Op, Operand, Reg};
use std::rc::Rc;
use tracing::debug;

impl Interpreter {
    pub(crate) fn exec(&mut self, vm: &mut Vm, code: &Rc<Code>, pc: usize, op: &Op) -> Result<Step, VmError> {
        match op {
            Op::Jump { target } => {
                self.pc = Pc::At(jump_target(code, *target)?);
                Ok(Step::Continue)
            }
            Op::JumpIfInitialized { source, target } => {
                let initialized = !self.frame.borrow().register(*source).is_uninitialized();
                self.pc = if initialized {
                    Pc::At(jump_target(code, *target)?)
                } else {
                    Pc::At(pc + 1)
                };
                Ok(Step::Continue)
            }
            Op::Switch { which, targets } => {
                let value = self.read(vm, *which);
                let index = match value {
                    Value::Int(_) => value.as_i64().and_then(|i| usize::try_from(i).ok()),
                    Value::Placeholder(_) => {
                        return Err(VmError::Runtime("Switch on an unresolved value".into()))
                    }
                    other => {
                        return Err(VmError::TypeError(format!(
                            "Switch expects an int, got {}",
                            other.type_name()
                        )))
                    }
                };
                let Some(label) = index.and_then(|i| targets.get(i)) else {
                    return Err(VmError::Runtime(format!("Switch index {:?} out of range", index)));
                };
                self.pc = Pc::At(jump_target(code, *label)?);
                Ok(Step::Continue)
            }
            Op::Reset { dest } => {
                self.frame.borrow_mut().set_register(*dest, Value::Uninitialized);
                self.pc = Pc::At(pc + 1);
                Ok(Step::Continue)
            }
            Op::Err => Err(VmError::Runtime(format!(
                "`Err` reached in `{}` at {}",
                code.procedure.name, pc
            ))),
            Op::Return { value } => self.exec_return(vm, *value),
            Op::BeginFailureContext { on_failure } => self.begin_failure_context(vm, code, pc, *on_failure),
            Op::EndFailureContext { done } => self.end_failure_context(vm, code, pc, *done),
            Op::BeginTask {
                dest,
                attached,
                on_yield,
            } => self.begin_task(vm, code, pc, *dest, *attached, *on_yield),
            Op::EndTask { value, write, signal } => self.end_task(vm, pc, *value, *write, *signal),
            Op::NewSemaphore { dest } => {
                let id = vm.heap.new_semaphore();
                self.frame.borrow_mut().set_register(*dest, Value::Semaphore(id));
                self.pc = Pc::At(pc + 1);
                Ok(Step::Continue)
            }
            Op::WaitSemaphore { source, count } => self.wait_semaphore(vm, pc, *source, *count),
            Op::ResumeUnwind => {
                let task = self.current_task("ResumeUnwind")?;
                if vm.tasks[task.index()].phase != TaskPhase::CancelUnwinding {
                    return Err(VmError::Runtime(format!(
                        "ResumeUnwind in task {} which is not unwinding",
                        task.0
                    )));
                }
                self.pc = Pc::At(pc + 1);
                self.begin_unwind(vm, task)?;
                Ok(Step::Continue)
            }
            _ => self.exec_lenient(vm, code, pc, op),
        }
    }

    fn read(&mut self, vm: &mut Vm, operand: Operand) -> Value {
        let value = self.frame.borrow_mut().read(operand, &mut vm.heap);
        vm.heap.follow(&value)
    }

    fn current_task(&self, op: &str) -> Result<TaskId, VmError> {
        self.task
            .ok_or_else(|| VmError::Runtime(format!("{} outside of any task", op)))
    }

    fn exec_return(&mut self, vm: &mut Vm, value: Operand) -> Result<Step, VmError> {
        let value = self.frame.borrow_mut().read(value, &mut vm.heap);
        let (slot, token, caller, caller_pc) = {
            let f = self.frame.borrow();
            (
                f.return_slot.clone(),
                f.return_effect_token.clone(),
                f.caller_frame.clone(),
                f.caller_pc,
            )
        };
        if !slot.is_uninitialized() && !vm.heap.def(&slot, &value, &mut self.ready) {
            return Ok(Step::Fail);
        }
        if !token.is_uninitialized() {
            vm.heap.def(&token, &self.effect_token, &mut self.ready);
        }
        match caller {
            Some(caller) => {
                self.frame = caller;
                self.pc = caller_pc;
            }
            None => self.pc = Pc::Stop,
        }
        Ok(Step::Continue)
    }

    // ---- Failure contexts ----

    fn begin_failure_context(
        &mut self,
        vm: &mut Vm,
        code: &Code,
        pc: usize,
        on_failure: Label,
    ) -> Result<Step, VmError> {
        let failure_pc = Pc::At(jump_target(code, on_failure)?);
        let incoming = self.effect_token.clone();
        let id = vm.push_context(FailureContext::new(
            Some(self.failure),
            self.task,
            self.frame.clone(),
            incoming.clone(),
            failure_pc,
        ));
        if vm.heap.is_concrete(&incoming) {
            vm.contexts[id.index()].transaction.start(&mut vm.heap);
        } else {
            let next = vm.heap.new_placeholder();
            let start = Suspension {
                context: id,
                task: self.task,
                kind: SuspensionKind::Lambda {
                    action: LambdaAction::StartTransaction,
                    next_effect_token: next.clone(),
                },
            };
            vm.heap.enqueue(&incoming, start, &mut self.ready);
            self.effect_token = next;
        }
        debug!(context = id.0, parent = self.failure.0, "failure context begun");
        self.failure = id;
        self.pc = Pc::At(pc + 1);
        Ok(Step::Continue)
    }

    /// Ends the innermost context. With suspensions outstanding the then
    /// range is skipped for now and the frame is copied so it can be
    /// replayed later; otherwise the context commits and falls through.
    fn end_failure_context(&mut self, vm: &mut Vm, code: &Code, pc: usize, done: Label) -> Result<Step, VmError> {
        let id = self.failure;
        let parent = match vm.contexts[id.index()].parent {
            Some(parent) if id != self.outermost_failure => parent,
            _ => {
                return Err(VmError::Runtime(
                    "EndFailureContext without a matching BeginFailureContext".into(),
                ))
            }
        };
        let done_pc = jump_target(code, done)?;
        let ctx = &mut vm.contexts[id.index()];
        ctx.then_pc = Pc::At(pc + 1);
        ctx.done_pc = Pc::At(done_pc);
        ctx.executed_end = true;

        if ctx.suspension_count > 0 {
            let pending = ctx.suspension_count;
            vm.contexts[parent.index()].suspension_count += 1;
            let done_token = vm.heap.new_placeholder();
            let copy = self.frame.borrow_mut().clone_without_caller(&mut vm.heap).into_ref();
            let ctx = &mut vm.contexts[id.index()];
            ctx.before_then_effect_token = std::mem::replace(&mut self.effect_token, done_token.clone());
            ctx.done_effect_token = done_token;
            ctx.frame = copy;
            debug!(context = id.0, pending, "failure context deferred");
            self.pc = Pc::At(done_pc);
        } else {
            ctx.finished = true;
            if vm.heap.is_concrete(&self.effect_token) {
                vm.commit_context(id);
            } else {
                let next = vm.heap.new_placeholder();
                let commit = Suspension {
                    context: id,
                    task: self.task,
                    kind: SuspensionKind::Lambda {
                        action: LambdaAction::CommitTransaction,
                        next_effect_token: next.clone(),
                    },
                };
                vm.heap.enqueue(&self.effect_token, commit, &mut self.ready);
                self.effect_token = next;
            }
            self.pc = Pc::At(pc + 1);
        }
        self.failure = parent;
        Ok(Step::Continue)
    }

    // ---- Tasks ----

    fn begin_task(
        &mut self,
        vm: &mut Vm,
        code: &Code,
        pc: usize,
        dest: Reg,
        attached: bool,
        on_yield: Label,
    ) -> Result<Step, VmError> {
        if self.failure != self.outermost_failure {
            return Err(VmError::Runtime(
                "BeginTask inside a failure context".into(),
            ));
        }
        let yield_pc = Pc::At(jump_target(code, on_yield)?);
        let parent = if attached { self.task } else { None };
        let task = vm.push_task(Task::new(parent, yield_pc, Some(self.frame.clone()), self.task));
        if let Some(parent) = parent {
            vm.tasks[parent.index()].children.push(task);
        }
        debug!(task = task.0, parent = ?parent.map(|p| p.0), "task begun");
        self.frame.borrow_mut().set_register(dest, Value::Task(task));
        self.task = Some(task);
        self.pc = Pc::At(pc + 1);
        Ok(Step::Continue)
    }

    fn wait_semaphore(&mut self, vm: &mut Vm, pc: usize, source: Operand, count: i32) -> Result<Step, VmError> {
        let id = match self.read(vm, source) {
            Value::Semaphore(id) => id,
            Value::Placeholder(_) => {
                return Err(VmError::Runtime("WaitSemaphore on an unresolved value".into()))
            }
            other => {
                return Err(VmError::TypeError(format!(
                    "WaitSemaphore expects a semaphore, got {}",
                    other.type_name()
                )))
            }
        };
        let task = self.current_task("WaitSemaphore")?;
        let Some(waiting) = vm.heap.semaphore(id).map(|s| s.awaiter) else {
            return Err(VmError::Runtime(format!("no semaphore with id {}", id.0)));
        };
        if let Some(other) = waiting.filter(|t| vm.tasks[t.index()].is_parked()) {
            return Err(VmError::Runtime(format!(
                "semaphore {} already has task {} waiting on it",
                id.0, other.0
            )));
        }
        let Some(semaphore) = vm.heap.semaphore_mut(id) else {
            return Err(VmError::Runtime(format!("no semaphore with id {}", id.0)));
        };
        semaphore.count -= i64::from(count);
        self.pc = Pc::At(pc + 1);
        if semaphore.count < 0 {
            semaphore.awaiter = Some(task);
            vm.tasks[task.index()].running = false;
            debug!(task = task.0, "waiting on semaphore");
            return Ok(Step::Yield);
        }
        Ok(Step::Continue)
    }

    /// Increments the semaphore; returns the parked awaiter to wake once
    /// the count is back to zero.
    fn signal_semaphore(&mut self, vm: &mut Vm, source: Operand) -> Result<Option<TaskId>, VmError> {
        let id = match self.read(vm, source) {
            Value::Semaphore(id) => id,
            other => {
                return Err(VmError::TypeError(format!(
                    "EndTask signals a semaphore, got {}",
                    other.type_name()
                )))
            }
        };
        let Some(semaphore) = vm.heap.semaphore_mut(id) else {
            return Err(VmError::Runtime(format!("no semaphore with id {}", id.0)));
        };
        semaphore.count += 1;
        if semaphore.count != 0 {
            return Ok(None);
        }
        Ok(semaphore
            .awaiter
            .take()
            .filter(|a| vm.tasks[a.index()].is_parked()))
    }

    fn end_task(
        &mut self,
        vm: &mut Vm,
        pc: usize,
        value: Operand,
        write: Option<Reg>,
        signal: Option<Operand>,
    ) -> Result<Step, VmError> {
        let task = self.current_task("EndTask")?;
        if vm.tasks[task.index()].phase == TaskPhase::CancelRequested {
            vm.tasks[task.index()].phase = TaskPhase::CancelStarted;
        }

        // Children first: park on the last one and retry this op when it ends.
        if !vm.cancel_children(task) {
            if let Some(&last) = vm.tasks[task.index()].children.last() {
                vm.tasks[last.index()].cancellers.push(task);
                let t = &mut vm.tasks[task.index()];
                t.running = false;
                t.native_defer = Some(Box::new(move |vm: &mut Vm, me: TaskId| {
                    vm.tasks[last.index()].cancellers.retain(|c| *c != me);
                }));
                debug!(task = task.0, child = last.0, "task end waits for children");
            }
            self.pc = Pc::At(pc);
            return Ok(Step::Yield);
        }

        let value = self.read(vm, value);
        let canceled = vm.tasks[task.index()].phase.is_canceling();
        let mut signalled = None;
        let result = if canceled {
            vm.tasks[task.index()].phase = TaskPhase::Canceled;
            Value::False
        } else {
            if let Some(reg) = write {
                let mut frame = self.frame.borrow_mut();
                if frame.register(reg).is_uninitialized() {
                    frame.set_register(reg, value.clone());
                }
            }
            if let Some(signal) = signal {
                signalled = self.signal_semaphore(vm, signal)?;
            }
            value
        };

        let t = &mut vm.tasks[task.index()];
        t.result = result.clone();
        t.finished = true;
        t.running = false;
        t.resume_frame = None;
        let (yield_pc, yield_frame, yield_task) = (t.yield_pc, t.yield_frame.take(), t.yield_task);
        let cancellers = std::mem::take(&mut t.cancellers);
        let awaiters = std::mem::take(&mut t.awaiters);
        debug!(task = task.0, canceled, "task ended");
        if vm.debug_callback.is_some() {
            vm.notify(DebugEvent::TaskEnded { task: task.0, canceled });
        }
        let parent = vm.detach(task);

        self.pc = yield_pc;
        if let Some(frame) = yield_frame {
            self.frame = frame;
        }
        self.task = yield_task;

        // A canceled task answers only its cancellers. Waiters that are
        // canceling themselves are left for their own unwind.
        let waiters = if canceled { cancellers } else { awaiters };
        let mut woken: Vec<(TaskId, Option<Value>)> = Vec::new();
        woken.extend(signalled.map(|t| (t, None)));
        woken.extend(parent.map(|p| (p, None)));
        woken.extend(
            waiters
                .into_iter()
                .filter(|w| vm.tasks[w.index()].phase == TaskPhase::Active)
                .map(|w| (w, Some(result.clone()))),
        );
        self.resume_chain(vm, woken);
        Ok(Step::Yield)
    }
}

fn jump_target(code: &Code, label: Label) -> Result<usize, VmError> {
    code.procedure.label_target(label).ok_or_else(|| {
        VmError::Runtime(format!(
            "label L{} undefined in `{}`",
            label.0, code.procedure.name
        ))
    })
}
