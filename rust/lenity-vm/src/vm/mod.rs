//! Lenient register VM: host entry points, program loading and runtime
//! errors.

mod control;
mod interpreter;
pub mod natives;
mod ops;

pub use natives::{NativeContext, NativeEffects, NativeFunction, NativeResult, NativeThunk};

use crate::config::VmConfig;
use crate::failure::FailureContext;
use crate::frame::{Code, Frame, FrameRef, Pc};
use crate::heap::Heap;
use crate::ids::*;
use crate::suspension::Suspension;
use crate::task::{Task, TaskPhase};
use crate::values::Value;
use interpreter::{ExecState, Interpreter};
use lenity_core::{verify_program, Constant, Procedure, Program, VerifyError};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

/// Type alias for debug callback to simplify type signatures
pub type DebugCallback = Option<Box<dyn FnMut(&DebugEvent)>>;

/// Debug events emitted during execution. The callback only observes.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    /// One executed op: procedure name, offset, op name
    Step {
        procedure: String,
        pc: usize,
        op: &'static str,
    },
    /// A user procedure was entered from the main loop
    CallEnter { procedure: String },
    ContextFailed { context: u32 },
    TaskEnded { task: u32, canceled: bool },
}

#[derive(Debug, Error)]
pub enum VmError {
    #[error("runtime error: {0}")]
    Runtime(String),
    #[error("type error at runtime: {0}")]
    TypeError(String),
    #[error("native `{name}` failed: {message}")]
    Native { name: String, message: String },
    #[error("stack overflow: call depth exceeded {0}")]
    StackOverflow(usize),
    #[error("stack exhausted: lenient nesting exceeded {0}")]
    StackExhausted(usize),
    #[error("instruction limit exceeded: {0}")]
    InstructionLimitExceeded(u64),
    #[error("undefined procedure: {0}")]
    UndefinedProcedure(String),
    #[error("unknown native: {0}")]
    UnknownNative(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Result of a synchronous top-level call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The return value. Still a placeholder if the body left it undefined,
    /// e.g. because the root task suspended.
    Return(Value),
    Fail,
}

/// Result of a host resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Committed,
    Aborted,
    /// The task was not in a state that allows the request.
    Skipped,
}

/// The lenient register VM.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) contexts: Vec<FailureContext>,
    pub(crate) tasks: Vec<Task>,
    codes: Vec<Rc<Code>>,
    names: HashMap<String, FunctionId>,
    natives: HashMap<String, Rc<NativeFunction>>,
    host_code: Rc<Code>,
    pub config: VmConfig,
    /// Lines written by `print`.
    pub output: Vec<String>,
    /// Optional debug callback for step-through debugging
    pub debug_callback: DebugCallback,
    pub(crate) lenient_depth: usize,
    pub(crate) instruction_count: u64,
    /// Canceled tasks waiting for the host to unwind them.
    pub(crate) pending_unwinds: VecDeque<TaskId>,
    draining_unwinds: bool,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            contexts: Vec::new(),
            tasks: Vec::new(),
            codes: Vec::new(),
            names: HashMap::new(),
            natives: HashMap::new(),
            host_code: Rc::new(Code::host()),
            config,
            output: Vec::new(),
            debug_callback: None,
            lenient_depth: 0,
            instruction_count: 0,
            pending_unwinds: VecDeque::new(),
            draining_unwinds: false,
        };
        for native in natives::builtins() {
            vm.register_native(native);
        }
        vm
    }

    /// Makes a native callable from constants of programs loaded afterwards.
    pub fn register_native(&mut self, native: NativeFunction) {
        self.natives.insert(native.name.clone(), Rc::new(native));
    }

    /// Verifies and loads `program`. Procedures replace earlier ones with the
    /// same name.
    pub fn load(&mut self, program: Program) -> Result<(), VmError> {
        verify_program(&program)?;
        let base = self.codes.len();
        let pending: HashMap<String, FunctionId> = program
            .procedures
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), FunctionId::from_index(base + i)))
            .collect();

        let mut loaded = Vec::with_capacity(program.procedures.len());
        for (i, procedure) in program.procedures.into_iter().enumerate() {
            let constants = procedure
                .constants
                .iter()
                .map(|c| self.resolve_constant(c, &pending))
                .collect::<Result<Vec<_>, _>>()?;
            loaded.push(Rc::new(Code {
                id: FunctionId::from_index(base + i),
                procedure,
                constants,
            }));
        }
        debug!(procedures = loaded.len(), "program loaded");
        self.codes.extend(loaded);
        self.names.extend(pending);
        Ok(())
    }

    fn resolve_constant(
        &self,
        constant: &Constant,
        pending: &HashMap<String, FunctionId>,
    ) -> Result<Value, VmError> {
        Ok(match constant {
            Constant::Int(n) => Value::int(*n),
            Constant::Float(f) => Value::Float(*f),
            Constant::String(s) => Value::string(s),
            Constant::False => Value::False,
            Constant::True => Value::logic(true),
            Constant::Function(name) => pending
                .get(name)
                .or_else(|| self.names.get(name))
                .map(|id| Value::Function(*id))
                .ok_or_else(|| VmError::UndefinedProcedure(name.clone()))?,
            Constant::Native(name) => self
                .natives
                .get(name)
                .map(|n| Value::Native(n.clone()))
                .ok_or_else(|| VmError::UnknownNative(name.clone()))?,
            Constant::Type(tag) => Value::Type(*tag),
        })
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        let id = self.names.get(name)?;
        self.codes.get(id.index()).map(|c| &c.procedure)
    }

    pub(crate) fn code(&self, id: FunctionId) -> Result<Rc<Code>, VmError> {
        self.codes
            .get(id.index())
            .cloned()
            .ok_or_else(|| VmError::Runtime(format!("no procedure with id {}", id.0)))
    }

    /// Builds the callee frame, adapting the argument list to the parameter
    /// count: one array argument spreads over several parameters, several
    /// arguments pack into a single parameter.
    pub(crate) fn make_frame(
        &mut self,
        code: Rc<Code>,
        args: Vec<Value>,
        return_slot: Value,
        depth: usize,
    ) -> Result<Frame, VmError> {
        if depth >= self.config.max_call_depth {
            return Err(VmError::StackOverflow(self.config.max_call_depth));
        }
        let params = code.procedure.params as usize;
        let args = self.adapt_args(&code.procedure.name, params, args)?;
        let mut frame = Frame::new(code, return_slot, depth);
        for (i, arg) in args.into_iter().enumerate() {
            frame.set_register(lenity_core::Reg(i as u32), arg);
        }
        Ok(frame)
    }

    fn adapt_args(&mut self, name: &str, params: usize, args: Vec<Value>) -> Result<Vec<Value>, VmError> {
        if args.len() == params {
            return Ok(args);
        }
        if params == 1 {
            return Ok(vec![Value::array(args)]);
        }
        if let [single] = args.as_slice() {
            if let Value::Array(items) = self.heap.follow(single) {
                if items.len() == params {
                    return Ok(items.to_vec());
                }
            }
        }
        Err(VmError::Runtime(format!(
            "`{}` expects {} arguments, got {}",
            name,
            params,
            args.len()
        )))
    }

    pub(crate) fn push_context(&mut self, context: FailureContext) -> ContextId {
        self.contexts.push(context);
        ContextId::from_index(self.contexts.len() - 1)
    }

    pub(crate) fn push_task(&mut self, task: Task) -> TaskId {
        self.tasks.push(task);
        TaskId::from_index(self.tasks.len() - 1)
    }

    /// Whether `id` or any of its ancestors has failed.
    pub(crate) fn context_failed(&self, id: ContextId) -> bool {
        let mut current = Some(id);
        while let Some(id) = current {
            let ctx = &self.contexts[id.index()];
            if ctx.failed {
                return true;
            }
            current = ctx.parent;
        }
        false
    }

    /// Open transaction of `id`, or of its nearest ancestor that has one.
    pub(crate) fn open_tx(&self, id: ContextId) -> Option<TxId> {
        let mut current = Some(id);
        while let Some(id) = current {
            let ctx = &self.contexts[id.index()];
            if let Some(tx) = ctx.transaction.open_id() {
                return Some(tx);
            }
            current = ctx.parent;
        }
        None
    }

    /// Journals subsequent writes under `id`.
    pub(crate) fn enter_context(&mut self, id: ContextId) {
        let tx = self.open_tx(id);
        self.heap.set_current(tx);
    }

    /// Commits `id`, handing its undo entries to the enclosing open
    /// transaction.
    pub(crate) fn commit_context(&mut self, id: ContextId) {
        let into = self.contexts[id.index()].parent.and_then(|p| self.open_tx(p));
        self.contexts[id.index()].transaction.commit(&mut self.heap, into);
    }

    /// Rolls back `id` together with any descendant whose transaction is
    /// still open (deferred regions that never settled).
    pub(crate) fn abort_context(&mut self, id: ContextId) {
        for index in (id.index() + 1..self.contexts.len()).rev() {
            let child = ContextId::from_index(index);
            if self.contexts[index].transaction.open_id().is_some() && self.descends_from(child, id) {
                self.contexts[index].transaction.abort(&mut self.heap);
            }
        }
        self.contexts[id.index()].transaction.abort(&mut self.heap);
    }

    fn descends_from(&self, id: ContextId, ancestor: ContextId) -> bool {
        let mut current = self.contexts[id.index()].parent;
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.contexts[id.index()].parent;
        }
        false
    }

    pub(crate) fn count_instruction(&mut self) -> Result<(), VmError> {
        self.instruction_count = self.instruction_count.saturating_add(1);
        match self.config.max_instructions {
            Some(max) if self.instruction_count > max => Err(VmError::InstructionLimitExceeded(max)),
            _ => Ok(()),
        }
    }

    pub(crate) fn notify(&mut self, event: DebugEvent) {
        if let Some(ref mut cb) = self.debug_callback {
            cb(&event);
        }
    }

    /// Marks a parked task running again with a new yield point, runs its
    /// native defer and defines its resume slot. Returns where it resumes.
    pub(crate) fn wake(
        &mut self,
        task: TaskId,
        yield_to: (Pc, Option<FrameRef>, Option<TaskId>),
        value: Option<&Value>,
        ready: &mut VecDeque<Suspension>,
    ) -> (Pc, Option<FrameRef>) {
        let t = &mut self.tasks[task.index()];
        t.running = true;
        (t.yield_pc, t.yield_frame, t.yield_task) = yield_to;
        let slot = std::mem::replace(&mut t.resume_slot, Value::Uninitialized);
        let resume = (t.resume_pc, t.resume_frame.clone());
        self.run_native_defer(task);
        if let Some(value) = value {
            if !slot.is_uninitialized() && !self.heap.def(&slot, value, ready) {
                warn!(task = task.0, "resume value conflicts with the task's result slot");
            }
        }
        debug!(task = task.0, "task resumed");
        resume
    }

    /// Opens a root context with its own transaction for a host entry point.
    fn host_context(&mut self, task: Option<TaskId>, frame: FrameRef) -> ContextId {
        let id = self.push_context(FailureContext::new(None, task, frame, Value::EffectDone, Pc::Stop));
        self.contexts[id.index()].transaction.start(&mut self.heap);
        id
    }

    /// Commits or aborts a host context after its interpreter stopped.
    /// Returns whether it committed.
    fn settle(&mut self, context: ContextId, result: Result<(), VmError>) -> Result<bool, VmError> {
        match result {
            Err(e) => {
                self.abort_context(context);
                Err(e)
            }
            Ok(()) if self.contexts[context.index()].failed => Ok(false),
            Ok(()) => {
                self.commit_context(context);
                self.contexts[context.index()].finished = true;
                Ok(true)
            }
        }
    }

    // ---- Host entry points ----

    /// Calls `name` synchronously under a fresh root task and transaction.
    pub fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Outcome, VmError> {
        let id = *self
            .names
            .get(name)
            .ok_or_else(|| VmError::UndefinedProcedure(name.to_string()))?;
        let code = self.code(id)?;
        self.instruction_count = 0;
        debug!(procedure = name, args = args.len(), "invoke");

        let ret = self.heap.new_placeholder();
        let frame = self.make_frame(code, args, ret.clone(), 0)?.into_ref();
        let task = self.push_task(Task::new(None, Pc::Stop, None, None));
        let context = self.host_context(Some(task), frame.clone());

        let mut interp = Interpreter::new(Pc::At(0), frame, context, Some(task), Value::EffectDone);
        let result = interp.run(self, ExecState::Running);
        let committed = self.settle(context, result)?;

        let t = &mut self.tasks[task.index()];
        if t.running {
            t.running = false;
            t.finished = true;
            t.result = ret.clone();
        }
        self.run_pending_unwinds()?;

        if committed {
            Ok(Outcome::Return(self.heap.follow(&ret)))
        } else {
            debug!(procedure = name, "invoke failed");
            Ok(Outcome::Fail)
        }
    }

    /// Wakes a parked task with `value` as the result of the call it parked
    /// in. Failure anywhere during the resumption aborts all of it, and the
    /// task is left parked where it was, ready to be resumed again.
    pub fn resume_in_transaction(&mut self, task: TaskId, value: Value) -> Result<Completion, VmError> {
        let Some(t) = self.tasks.get(task.index()) else {
            return Err(VmError::Runtime(format!("no task with id {}", task.0)));
        };
        if !t.is_parked() || t.phase != TaskPhase::Active {
            warn!(task = task.0, phase = ?t.phase, "resume skipped");
            return Ok(Completion::Skipped);
        }
        let Some(frame) = t.resume_frame.clone() else {
            warn!(task = task.0, "resume skipped: task never suspended");
            return Ok(Completion::Skipped);
        };
        self.instruction_count = 0;
        debug!(task = task.0, "resume in transaction");

        let context = self.host_context(Some(task), frame.clone());
        let parked = self.save_parked(task);
        let mut interp = Interpreter::new(Pc::Stop, frame, context, Some(task), Value::EffectDone);
        let (pc, resume_frame) = self.wake(task, (Pc::Stop, None, None), Some(&value), &mut interp.ready);
        interp.pc = pc;
        if let Some(f) = resume_frame {
            interp.frame = f;
        }
        let result = interp.run(self, ExecState::Draining);
        let settled = self.settle(context, result);
        if !matches!(settled, Ok(true)) {
            self.restore_parked(task, parked);
        }
        let completion = match settled? {
            true => Completion::Committed,
            false => Completion::Aborted,
        };
        self.run_pending_unwinds()?;
        Ok(completion)
    }

    /// Cancels a parked task and runs its cleanup blocks up to its `EndTask`.
    /// An aborted unwind leaves the task parked in `CancelStarted`.
    /// A task whose children are still canceling is skipped; it unwinds once
    /// the last child finishes.
    pub fn unwind_in_transaction(&mut self, task: TaskId) -> Result<Completion, VmError> {
        let Some(t) = self.tasks.get_mut(task.index()) else {
            return Err(VmError::Runtime(format!("no task with id {}", task.0)));
        };
        if !t.is_parked() {
            warn!(task = task.0, "unwind skipped: task is not parked");
            return Ok(Completion::Skipped);
        }
        match t.phase {
            TaskPhase::Active | TaskPhase::CancelRequested => t.phase = TaskPhase::CancelStarted,
            TaskPhase::CancelStarted => {}
            _ => {
                warn!(task = task.0, phase = ?t.phase, "unwind skipped");
                return Ok(Completion::Skipped);
            }
        }
        let Some(frame) = t.resume_frame.clone() else {
            warn!(task = task.0, "unwind skipped: task never suspended");
            return Ok(Completion::Skipped);
        };
        if !self.cancel_children(task) {
            debug!(task = task.0, "unwind deferred until children finish");
            return Ok(Completion::Skipped);
        }
        self.instruction_count = 0;
        debug!(task = task.0, "unwind in transaction");

        let context = self.host_context(Some(task), frame.clone());
        let parked = self.save_parked(task);
        let mut interp = Interpreter::new(Pc::Stop, frame, context, Some(task), Value::EffectDone);
        let (pc, resume_frame) = self.wake(task, (Pc::Stop, None, None), None, &mut interp.ready);
        interp.pc = pc;
        if let Some(f) = resume_frame {
            interp.frame = f;
        }
        let result = interp.run(self, ExecState::Yielded);
        let settled = self.settle(context, result);
        if !matches!(settled, Ok(true)) {
            self.restore_parked(task, parked);
        }
        let completion = match settled? {
            true => Completion::Committed,
            false => Completion::Aborted,
        };
        self.run_pending_unwinds()?;
        Ok(completion)
    }

    /// Unwinds every task queued by cancellation, including ones queued while
    /// doing so.
    pub fn run_pending_unwinds(&mut self) -> Result<(), VmError> {
        if self.draining_unwinds {
            return Ok(());
        }
        self.draining_unwinds = true;
        let mut result = Ok(());
        while let Some(task) = self.pending_unwinds.pop_front() {
            if let Err(e) = self.unwind_in_transaction(task) {
                result = Err(e);
                break;
            }
        }
        self.draining_unwinds = false;
        result
    }

    /// Resolves a placeholder from the host and runs everything that was
    /// waiting on it, inside a transaction. Returns `false` if `cell` already
    /// held a conflicting value.
    pub fn define(&mut self, cell: &Value, value: Value) -> Result<bool, VmError> {
        self.instruction_count = 0;
        let frame = Frame::new(self.host_code.clone(), Value::Uninitialized, 0).into_ref();
        let context = self.host_context(None, frame.clone());
        let mut interp = Interpreter::new(Pc::Stop, frame, context, None, Value::EffectDone);
        let defined = self.heap.def(cell, &value, &mut interp.ready);
        debug!(fired = interp.ready.len(), "host define");
        let result = interp.run(self, ExecState::Terminal);
        self.settle(context, result)?;
        self.run_pending_unwinds()?;
        Ok(defined)
    }

    // ---- Inspection ----

    pub fn new_placeholder(&mut self) -> Value {
        self.heap.new_placeholder()
    }

    /// `value` with resolved placeholders followed.
    pub fn resolve(&mut self, value: &Value) -> Value {
        self.heap.follow(value)
    }

    pub fn is_concrete(&mut self, value: &Value) -> bool {
        self.heap.is_concrete(value)
    }

    pub fn render(&mut self, value: &Value) -> String {
        self.heap.render(value)
    }

    /// Current contents of a `var`.
    pub fn var_value(&mut self, value: &Value) -> Option<Value> {
        match self.heap.follow(value) {
            Value::Var(id) => {
                let inner = self.heap.var(id)?.clone();
                Some(self.heap.follow(&inner))
            }
            _ => None,
        }
    }

    pub fn task_phase(&self, task: TaskId) -> Option<TaskPhase> {
        self.tasks.get(task.index()).map(|t| t.phase)
    }

    /// Tasks that are suspended and not finished, oldest first.
    pub fn parked_tasks(&self) -> Vec<TaskId> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.is_parked())
            .map(|(i, _)| TaskId::from_index(i))
            .collect()
    }

    pub fn native_value(&self, name: &str) -> Option<Value> {
        self.natives.get(name).map(|n| Value::Native(n.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lenity_core::{Op, ProcedureBuilder};

    fn load(vm: &mut Vm, procs: Vec<Procedure>) {
        vm.load(Program::new(procs)).expect("program should load");
    }

    fn returns(vm: &mut Vm, name: &str, args: Vec<Value>) -> Value {
        match vm.invoke(name, args).expect("invoke should succeed") {
            Outcome::Return(v) => v,
            Outcome::Fail => panic!("unexpected failure"),
        }
    }

    #[test]
    fn unknown_native_is_rejected_at_load() {
        let mut b = ProcedureBuilder::new("main", 0);
        let f = b.native("nope");
        b.emit(Op::Return { value: f });
        let err = Vm::new().load(Program::new(vec![b.finish()])).unwrap_err();
        assert!(matches!(err, VmError::UnknownNative(ref n) if n == "nope"));
    }

    #[test]
    fn undefined_procedure() {
        let mut vm = Vm::new();
        assert!(matches!(
            vm.invoke("missing", vec![]),
            Err(VmError::UndefinedProcedure(_))
        ));
    }

    #[test]
    fn arguments_pack_into_single_parameter() {
        let mut b = ProcedureBuilder::new("len", 1);
        let r = b.reg();
        let p = b.param(0);
        b.emit(Op::Length { dest: r, container: p });
        b.emit(Op::Return { value: lenity_core::Operand::Reg(r) });
        let mut vm = Vm::new();
        load(&mut vm, vec![b.finish()]);
        let v = returns(&mut vm, "len", vec![Value::int(1), Value::int(2), Value::int(3)]);
        assert_eq!(v, Value::int(3));
    }

    #[test]
    fn array_argument_spreads_over_parameters() {
        let mut b = ProcedureBuilder::new("sub", 2);
        let r = b.reg();
        let (x, y) = (b.param(0), b.param(1));
        b.emit(Op::Sub { dest: r, left: x, right: y });
        b.emit(Op::Return { value: lenity_core::Operand::Reg(r) });
        let mut vm = Vm::new();
        load(&mut vm, vec![b.finish()]);
        let args = vec![Value::array(vec![Value::int(10), Value::int(4)])];
        assert_eq!(returns(&mut vm, "sub", args), Value::int(6));
        assert!(matches!(
            vm.invoke("sub", vec![Value::int(1)]),
            Err(VmError::Runtime(_))
        ));
    }

    #[test]
    fn unbounded_recursion_overflows() {
        let mut b = ProcedureBuilder::new("down", 0);
        let r = b.reg();
        let f = b.function("down");
        let args = b.operands(&[]);
        b.emit(Op::Call { dest: r, callee: f, args });
        b.emit(Op::Return { value: lenity_core::Operand::Reg(r) });
        let mut vm = Vm::new();
        vm.config.max_call_depth = 16;
        load(&mut vm, vec![b.finish()]);
        assert!(matches!(
            vm.invoke("down", vec![]),
            Err(VmError::StackOverflow(16))
        ));
    }

    #[test]
    fn debug_callback_sees_every_step() {
        let mut b = ProcedureBuilder::new("main", 0);
        let r = b.reg();
        let one = b.int(1);
        b.emit(Op::Move { dest: r, source: one });
        b.emit(Op::Return { value: lenity_core::Operand::Reg(r) });
        let mut vm = Vm::new();
        load(&mut vm, vec![b.finish()]);

        let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
        let sink = seen.clone();
        vm.debug_callback = Some(Box::new(move |event| {
            if let DebugEvent::Step { op, pc, .. } = event {
                sink.borrow_mut().push((*pc, *op));
            }
        }));
        returns(&mut vm, "main", vec![]);
        assert_eq!(*seen.borrow(), vec![(0, "Move"), (1, "Return")]);
    }

    #[test]
    fn task_end_skips_canceling_awaiters() {
        let mut b = ProcedureBuilder::new("main", 0);
        let (target, waiter, parked, awaited, printed) = (b.reg(), b.reg(), b.reg(), b.reg(), b.reg());
        let park = b.native("park");
        let wait = b.native("await");
        let print = b.native("print");
        let (seven, zero) = (b.int(7), b.int(0));
        let message = b.string("awaited");
        let no_args = b.operands(&[]);
        let await_args = b.operands(&[lenity_core::Operand::Reg(target)]);
        let print_args = b.operands(&[message]);
        let (target_yield, waiter_yield) = (b.label(), b.label());

        b.emit(Op::BeginTask { dest: target, attached: false, on_yield: target_yield });
        b.emit(Op::Call { dest: parked, callee: park, args: no_args });
        b.emit(Op::EndTask { value: seven, write: None, signal: None });
        b.bind(target_yield);
        b.emit(Op::BeginTask { dest: waiter, attached: false, on_yield: waiter_yield });
        b.emit(Op::Call { dest: awaited, callee: wait, args: await_args });
        b.emit(Op::Call { dest: printed, callee: print, args: print_args });
        b.emit(Op::EndTask { value: zero, write: None, signal: None });
        b.bind(waiter_yield);
        b.emit(Op::Return { value: zero });

        let mut vm = Vm::new();
        vm.register_native(NativeFunction::new("park", 0, NativeEffects::Pure, |ctx, _| ctx.park()));
        load(&mut vm, vec![b.finish()]);
        returns(&mut vm, "main", vec![]);
        let (target, waiter) = (TaskId(1), TaskId(2));
        assert_eq!(vm.parked_tasks(), vec![target, waiter]);

        vm.tasks[waiter.index()].phase = TaskPhase::CancelStarted;
        assert_eq!(vm.resume_in_transaction(target, Value::False).unwrap(), Completion::Committed);
        assert!(vm.output.is_empty());
        assert_eq!(vm.parked_tasks(), vec![waiter]);
    }

    #[test]
    fn host_define_reports_conflicts() {
        let mut vm = Vm::new();
        let p = vm.new_placeholder();
        assert!(vm.define(&p, Value::int(1)).unwrap());
        assert!(vm.define(&p, Value::int(1)).unwrap());
        assert!(!vm.define(&p, Value::int(2)).unwrap());
        assert_eq!(vm.resolve(&p), Value::int(1));
    }
}
