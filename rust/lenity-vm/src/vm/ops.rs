//! Lenient ops: everything that may block on a placeholder and be re-run
//! later from captured operands.

use super::interpreter::{Interpreter, Step};
use super::natives::{NativeContext, NativeEffects, NativeResult};
use super::{Vm, VmError};
use crate::frame::{Code, FrameRef, Pc};
use crate::heap::{Comparison, CopyError, Lookup};
use crate::ids::{ContextId, FunctionId, TaskId};
use crate::suspension::{Captures, Suspension, SuspensionKind};
use crate::values::{arith, compare, negate, type_admits, Arith, ArithOp, Value};
use lenity_core::{Op, Operand, Procedure, Reg};
use std::cmp::Ordering;
use std::rc::Rc;
use tracing::trace;

/// Result of one attempt at a lenient op.
#[derive(Debug, Clone)]
pub(crate) enum OpResult {
    Return,
    /// Retry once this placeholder resolves.
    Block(Value),
    Fail,
    Yield,
}

/// Where an op's result goes.
pub(crate) enum Slot {
    None,
    /// Main loop: a register of the live frame.
    Register(FrameRef, Reg),
    /// Suspended op: the cell captured when it blocked.
    Cell(Value),
}

/// Returns early with `Block` on the first placeholder among the values.
macro_rules! concrete {
    ($($v:expr),+) => {
        $(
            if $v.is_placeholder() {
                return Ok(OpResult::Block($v.clone()));
            }
        )+
    };
}

/// Use operands of `op`, in the order the op reads them.
pub(crate) fn op_operands(op: &Op, procedure: &Procedure) -> Vec<Operand> {
    match op {
        Op::Add { left, right, .. }
        | Op::Sub { left, right, .. }
        | Op::Mul { left, right, .. }
        | Op::Div { left, right, .. }
        | Op::Mod { left, right, .. }
        | Op::Neq { left, right, .. }
        | Op::Lt { left, right, .. }
        | Op::Lte { left, right, .. }
        | Op::Gt { left, right, .. }
        | Op::Gte { left, right, .. } => vec![*left, *right],
        Op::Neg { source, .. } | Op::Query { source, .. } | Op::Move { source, .. } => vec![*source],
        Op::Melt { value, .. }
        | Op::Freeze { value, .. }
        | Op::NewOption { value, .. }
        | Op::NewVar { value, .. } => vec![*value],
        Op::VarGet { var, .. } => vec![*var],
        Op::VarSet { var, value } => vec![*var, *value],
        Op::SetField { object, value, .. } | Op::UnifyField { object, value, .. } => {
            vec![*object, *value]
        }
        Op::CallSet {
            container,
            index,
            value,
        } => vec![*container, *index, *value],
        Op::ArrayAdd { container, value } => vec![*container, *value],
        Op::Length { container, .. } | Op::InPlaceMakeImmutable { container } => vec![*container],
        Op::NewArray { values, .. } | Op::NewMutableArray { values, .. } | Op::NewObject { values, .. } => {
            procedure.operand_slice(*values).to_vec()
        }
        Op::NewMutableArrayWithCapacity { size, .. } => vec![*size],
        Op::NewMap { keys, values, .. } => {
            let mut operands = procedure.operand_slice(*keys).to_vec();
            operands.extend_from_slice(procedure.operand_slice(*values));
            operands
        }
        Op::MapKey { map, index, .. } | Op::MapValue { map, index, .. } => vec![*map, *index],
        Op::LoadField { object, .. } => vec![*object],
        Op::Call { callee, args, .. } => {
            let mut operands = vec![*callee];
            operands.extend_from_slice(procedure.operand_slice(*args));
            operands
        }
        _ => Vec::new(),
    }
}

fn index_of(value: &Value) -> Result<Option<usize>, VmError> {
    match value {
        Value::Int(_) => Ok(value.as_i64().and_then(|i| usize::try_from(i).ok())),
        other => Err(VmError::TypeError(format!(
            "index must be an int, got {}",
            other.type_name()
        ))),
    }
}

fn arith_op(op: &Op) -> Option<ArithOp> {
    Some(match op {
        Op::Add { .. } => ArithOp::Add,
        Op::Sub { .. } => ArithOp::Sub,
        Op::Mul { .. } => ArithOp::Mul,
        Op::Div { .. } => ArithOp::Div,
        Op::Mod { .. } => ArithOp::Mod,
        _ => return None,
    })
}

/// Upper bound on capacity preallocated by `NewMutableArrayWithCapacity`.
const MAX_PREALLOCATED: usize = 1 << 16;

impl Interpreter {
    /// Main-loop path of every lenient op, including calls.
    pub(crate) fn exec_lenient(
        &mut self,
        vm: &mut Vm,
        code: &Rc<Code>,
        pc: usize,
        op: &Op,
    ) -> Result<Step, VmError> {
        let operands = op_operands(op, &code.procedure);
        let mut inputs = Vec::with_capacity(operands.len());
        {
            let mut frame = self.frame.borrow_mut();
            for operand in operands {
                let value = frame.read(operand, &mut vm.heap);
                inputs.push(vm.heap.follow(&value));
            }
        }
        let dest = match op.dest() {
            Some(reg) => Slot::Register(self.frame.clone(), reg),
            None => Slot::None,
        };

        let result = if op.threads_effects() && vm.heap.follow(&self.effect_token).is_placeholder() {
            OpResult::Block(self.effect_token.clone())
        } else if let Op::Call { dest: reg, .. } = op {
            match &inputs[0] {
                Value::Function(id) => return self.push_call(vm, pc, *id, inputs[1..].to_vec(), *reg),
                Value::Native(native)
                    if native.effects == NativeEffects::Effectful
                        && vm.heap.follow(&self.effect_token).is_placeholder() =>
                {
                    OpResult::Block(self.effect_token.clone())
                }
                callee => self.call_value(vm, self.failure, self.task, callee, &inputs[1..], &dest)?,
            }
        } else {
            self.run_op(vm, self.failure, self.task, op, &inputs, &dest)?
        };

        Ok(match result {
            OpResult::Return => {
                self.pc = Pc::At(pc + 1);
                Step::Continue
            }
            OpResult::Block(cell) => {
                self.suspend_op(vm, code, pc, op, inputs, cell);
                self.pc = Pc::At(pc + 1);
                Step::Continue
            }
            OpResult::Fail => Step::Fail,
            OpResult::Yield => {
                self.pc = Pc::At(pc + 1);
                Step::Yield
            }
        })
    }

    /// Enters a user procedure from the main loop.
    fn push_call(
        &mut self,
        vm: &mut Vm,
        pc: usize,
        id: FunctionId,
        args: Vec<Value>,
        dest: Reg,
    ) -> Result<Step, VmError> {
        let code = vm.code(id)?;
        let ret = self.frame.borrow_mut().materialize(dest, &mut vm.heap);
        let depth = self.frame.borrow().depth + 1;
        let mut frame = vm.make_frame(code, args, ret, depth)?;
        frame.caller_pc = Pc::At(pc + 1);
        frame.caller_frame = Some(self.frame.clone());
        if vm.debug_callback.is_some() {
            vm.notify(super::DebugEvent::CallEnter {
                procedure: frame.code.procedure.name.clone(),
            });
        }
        self.frame = frame.into_ref();
        self.pc = Pc::At(0);
        Ok(Step::Continue)
    }

    /// Queues `op` on `cell`, capturing its operands and destination. Effect
    /// ops and calls move the ambient token on to a fresh placeholder that
    /// resolves once they have run.
    fn suspend_op(&mut self, vm: &mut Vm, code: &Rc<Code>, pc: usize, op: &Op, inputs: Vec<Value>, cell: Value) {
        let dest = match op.dest() {
            Some(reg) => self.frame.borrow_mut().materialize(reg, &mut vm.heap),
            None => Value::Uninitialized,
        };
        let (effect_token, return_effect_token) = if op.threads_effects() {
            let next = vm.heap.new_placeholder();
            self.effect_token = next.clone();
            (Some(next), None)
        } else if matches!(op, Op::Call { .. }) {
            let after = vm.heap.new_placeholder();
            let incoming = std::mem::replace(&mut self.effect_token, after.clone());
            (Some(incoming), Some(after))
        } else {
            (None, None)
        };
        trace!(procedure = %code.procedure.name, pc, op = op.name(), "op suspended");
        vm.contexts[self.failure.index()].suspension_count += 1;
        let suspension = Suspension {
            context: self.failure,
            task: self.task,
            kind: SuspensionKind::Bytecode {
                code: code.clone(),
                pc,
                captures: Captures {
                    inputs,
                    dest,
                    effect_token,
                    return_effect_token,
                },
            },
        };
        vm.heap.enqueue(&cell, suspension, &mut self.ready);
    }

    /// Re-runs a fired bytecode suspension from its captures.
    pub(crate) fn resume(
        &mut self,
        vm: &mut Vm,
        context: ContextId,
        task: Option<TaskId>,
        code: Rc<Code>,
        pc: usize,
        captures: Captures,
    ) -> Result<(), VmError> {
        let Some(op) = code.procedure.ops.get(pc) else {
            return Err(VmError::Runtime(format!(
                "suspended op {} missing from `{}`",
                pc, code.procedure.name
            )));
        };
        let inputs: Vec<Value> = captures.inputs.iter().map(|v| vm.heap.follow(v)).collect();
        vm.enter_context(context);
        let result = if matches!(op, Op::Call { .. }) {
            self.resume_call(vm, context, task, &inputs, &captures)?
        } else {
            let dest = Slot::Cell(captures.dest.clone());
            self.run_op(vm, context, task, op, &inputs, &dest)?
        };

        match result {
            OpResult::Return => {
                if op.threads_effects() {
                    if let Some(token) = &captures.effect_token {
                        vm.heap.def(token, &Value::EffectDone, &mut self.ready);
                    }
                }
                self.finished_suspension_in(vm, context)
            }
            OpResult::Block(cell) => {
                let suspension = Suspension {
                    context,
                    task,
                    kind: SuspensionKind::Bytecode { code, pc, captures },
                };
                vm.heap.enqueue(&cell, suspension, &mut self.ready);
                Ok(())
            }
            OpResult::Fail => {
                self.fail(vm, context)?;
                self.finished_suspension_in(vm, context)
            }
            OpResult::Yield => {
                if let Some(task) = task {
                    vm.tasks[task.index()].running = false;
                }
                self.finished_suspension_in(vm, context)
            }
        }
    }

    /// Suspended call: user procedures run to completion in a nested
    /// interpreter; natives and indexing go through `call_value`. Either way
    /// the call's outgoing effect token gets defined.
    fn resume_call(
        &mut self,
        vm: &mut Vm,
        context: ContextId,
        task: Option<TaskId>,
        inputs: &[Value],
        captures: &Captures,
    ) -> Result<OpResult, VmError> {
        let incoming = captures.effect_token.clone().unwrap_or(Value::EffectDone);
        let after = captures.return_effect_token.clone().unwrap_or(Value::Uninitialized);
        let callee = &inputs[0];
        let dest = Slot::Cell(captures.dest.clone());

        let outgoing = match callee {
            Value::Placeholder(_) => return Ok(OpResult::Block(callee.clone())),
            Value::Function(id) => {
                let code = vm.code(*id)?;
                let mut frame = vm.make_frame(code, inputs[1..].to_vec(), captures.dest.clone(), 0)?;
                frame.return_effect_token = after;
                Self::run_nested(vm, Pc::At(0), frame.into_ref(), context, task, incoming, None)?;
                return Ok(OpResult::Return);
            }
            Value::Native(native) if native.effects == NativeEffects::Effectful => {
                let token = vm.heap.follow(&incoming);
                if token.is_placeholder() {
                    return Ok(OpResult::Block(token));
                }
                Value::EffectDone
            }
            _ => incoming,
        };

        let result = self.call_value(vm, context, task, callee, &inputs[1..], &dest)?;
        if matches!(result, OpResult::Return | OpResult::Yield) && !after.is_uninitialized() {
            vm.heap.def(&after, &outgoing, &mut self.ready);
        }
        Ok(result)
    }

    /// Stores an op result: an empty register takes it as is, anything else
    /// is unified with it.
    pub(crate) fn define(&mut self, vm: &mut Vm, slot: &Slot, value: Value) -> bool {
        match slot {
            Slot::None => true,
            Slot::Register(frame, reg) => {
                let current = frame.borrow().register(*reg);
                if current.is_uninitialized() {
                    frame.borrow_mut().set_register(*reg, value);
                    true
                } else {
                    vm.heap.def(&current, &value, &mut self.ready)
                }
            }
            Slot::Cell(cell) if cell.is_uninitialized() => true,
            Slot::Cell(cell) => vm.heap.def(cell, &value, &mut self.ready),
        }
    }

    fn produce(&mut self, vm: &mut Vm, slot: &Slot, value: Value) -> OpResult {
        if self.define(vm, slot, value) {
            OpResult::Return
        } else {
            OpResult::Fail
        }
    }

    /// Cell a native's result lands in; parking natives hand it to the task.
    fn result_cell(&mut self, vm: &mut Vm, slot: &Slot) -> Value {
        match slot {
            Slot::None => Value::Uninitialized,
            Slot::Register(frame, reg) => frame.borrow_mut().materialize(*reg, &mut vm.heap),
            Slot::Cell(cell) => cell.clone(),
        }
    }

    /// Calls anything that is not a user procedure: natives, arrays and maps
    /// (indexing), and type tags (membership tests).
    pub(crate) fn call_value(
        &mut self,
        vm: &mut Vm,
        context: ContextId,
        task: Option<TaskId>,
        callee: &Value,
        args: &[Value],
        dest: &Slot,
    ) -> Result<OpResult, VmError> {
        let single = |args: &[Value]| -> Result<Value, VmError> {
            match args {
                [arg] => Ok(arg.clone()),
                _ => Err(VmError::Runtime(format!(
                    "{} takes exactly one argument, got {}",
                    callee.type_name(),
                    args.len()
                ))),
            }
        };

        match callee {
            Value::Placeholder(_) => Ok(OpResult::Block(callee.clone())),
            Value::Native(native) => {
                if args.len() != native.arity {
                    return Err(VmError::Runtime(format!(
                        "native `{}` expects {} arguments, got {}",
                        native.name,
                        native.arity,
                        args.len()
                    )));
                }
                let native = native.clone();
                let result = self.result_cell(vm, dest);
                let outcome = {
                    let mut ctx = NativeContext {
                        vm: &mut *vm,
                        context,
                        task,
                        result,
                    };
                    (native.thunk)(&mut ctx, args)
                };
                match outcome {
                    NativeResult::Done(value) => Ok(self.produce(vm, dest, value)),
                    NativeResult::Blocked(cell) => Ok(OpResult::Block(cell)),
                    NativeResult::Failed => Ok(OpResult::Fail),
                    NativeResult::Yielded => Ok(OpResult::Yield),
                    NativeResult::Error(message) => Err(VmError::Native {
                        name: native.name.clone(),
                        message,
                    }),
                }
            }
            Value::Array(items) => {
                let index = single(args)?;
                concrete!(index);
                match index_of(&index)?.and_then(|i| items.get(i)) {
                    Some(item) => Ok(self.produce(vm, dest, item.clone())),
                    None => Ok(OpResult::Fail),
                }
            }
            Value::MutableArray(id) => {
                let index = single(args)?;
                concrete!(index);
                let item = index_of(&index)?
                    .and_then(|i| vm.heap.array(*id).and_then(|a| a.items.get(i).cloned()));
                match item {
                    Some(item) => Ok(self.produce(vm, dest, item)),
                    None => Ok(OpResult::Fail),
                }
            }
            Value::Map(entries) => {
                let key = single(args)?;
                match vm.heap.lookup(entries, &key) {
                    Lookup::Found(i) => Ok(self.produce(vm, dest, entries[i].1.clone())),
                    Lookup::Missing => Ok(OpResult::Fail),
                    Lookup::Blocked(cell) => Ok(OpResult::Block(cell)),
                }
            }
            Value::MutableMap(id) => {
                let key = single(args)?;
                let entries = vm.heap.map(*id).map(<[_]>::to_vec).unwrap_or_default();
                match vm.heap.lookup(&entries, &key) {
                    Lookup::Found(i) => Ok(self.produce(vm, dest, entries[i].1.clone())),
                    Lookup::Missing => Ok(OpResult::Fail),
                    Lookup::Blocked(cell) => Ok(OpResult::Block(cell)),
                }
            }
            Value::Type(tag) => {
                let value = single(args)?;
                if *tag != lenity_core::TypeTag::Any {
                    concrete!(value);
                }
                if type_admits(*tag, &value) {
                    Ok(self.produce(vm, dest, value))
                } else {
                    Ok(OpResult::Fail)
                }
            }
            other => Err(VmError::TypeError(format!(
                "{} is not callable",
                other.type_name()
            ))),
        }
    }

    /// Semantics of every lenient op other than a user-procedure call.
    /// `inputs` are the followed use operands in `op_operands` order.
    pub(crate) fn run_op(
        &mut self,
        vm: &mut Vm,
        context: ContextId,
        task: Option<TaskId>,
        op: &Op,
        inputs: &[Value],
        dest: &Slot,
    ) -> Result<OpResult, VmError> {
        let type_error = |what: &str, v: &Value| {
            VmError::TypeError(format!("{} expects {}, got {}", op.name(), what, v.type_name()))
        };

        Ok(match op {
            Op::Add { .. } | Op::Sub { .. } | Op::Mul { .. } | Op::Div { .. } | Op::Mod { .. } => {
                let (left, right) = (&inputs[0], &inputs[1]);
                concrete!(left, right);
                let Some(kind) = arith_op(op) else {
                    return Err(VmError::Runtime(format!("{} is not arithmetic", op.name())));
                };
                match arith(kind, left, right) {
                    Arith::Value(v) => self.produce(vm, dest, v),
                    Arith::Fail => OpResult::Fail,
                    Arith::TypeError => {
                        return Err(VmError::TypeError(format!(
                            "cannot apply {} to {} and {}",
                            op.name(),
                            left.type_name(),
                            right.type_name()
                        )))
                    }
                }
            }
            Op::Neg { .. } => {
                let source = &inputs[0];
                concrete!(source);
                match negate(source) {
                    Some(v) => self.produce(vm, dest, v),
                    None => return Err(type_error("a number", source)),
                }
            }
            Op::Lt { .. } | Op::Lte { .. } | Op::Gt { .. } | Op::Gte { .. } => {
                let (left, right) = (&inputs[0], &inputs[1]);
                concrete!(left, right);
                let Some(ordering) = compare(left, right) else {
                    return Err(VmError::TypeError(format!(
                        "cannot compare {} with {}",
                        left.type_name(),
                        right.type_name()
                    )));
                };
                let holds = match op {
                    Op::Lt { .. } => ordering == Ordering::Less,
                    Op::Lte { .. } => ordering != Ordering::Greater,
                    Op::Gt { .. } => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                };
                if holds {
                    self.produce(vm, dest, left.clone())
                } else {
                    OpResult::Fail
                }
            }
            Op::Neq { .. } => match vm.heap.compare(&inputs[0], &inputs[1]) {
                Comparison::Equal => OpResult::Fail,
                Comparison::Unequal => self.produce(vm, dest, inputs[0].clone()),
                Comparison::Unknown(cell) => OpResult::Block(cell),
            },
            Op::Query { .. } => {
                let source = &inputs[0];
                concrete!(source);
                match source {
                    Value::False => OpResult::Fail,
                    Value::Option(inner) => self.produce(vm, dest, (**inner).clone()),
                    other => return Err(type_error("a logic or option", other)),
                }
            }
            Op::Melt { .. } => match vm.heap.melt(&inputs[0]) {
                Ok(v) => self.produce(vm, dest, v),
                Err(CopyError::Blocked(cell)) => OpResult::Block(cell),
                Err(CopyError::Cyclic) => return Err(VmError::Runtime("cannot melt a cyclic value".into())),
            },
            Op::Freeze { .. } => match vm.heap.freeze(&inputs[0]) {
                Ok(v) => self.produce(vm, dest, v),
                Err(CopyError::Blocked(cell)) => OpResult::Block(cell),
                Err(CopyError::Cyclic) => return Err(VmError::Runtime("cannot freeze a cyclic value".into())),
            },
            Op::VarGet { .. } => {
                let var = &inputs[0];
                concrete!(var);
                let Value::Var(id) = var else {
                    return Err(type_error("a var", var));
                };
                let value = vm.heap.var(*id).cloned().unwrap_or(Value::Uninitialized);
                self.produce(vm, dest, value)
            }
            Op::VarSet { .. } => {
                let var = &inputs[0];
                concrete!(var);
                let Value::Var(id) = var else {
                    return Err(type_error("a var", var));
                };
                vm.heap.set_var(*id, inputs[1].clone());
                OpResult::Return
            }
            Op::SetField { field, .. } => {
                let object = &inputs[0];
                concrete!(object);
                let Value::Object(id) = object else {
                    return Err(type_error("an object", object));
                };
                let Some(index) = vm.heap.field_index(*id, field) else {
                    return Err(VmError::Runtime(format!("object has no field `{}`", field)));
                };
                vm.heap.set_field(*id, index, inputs[1].clone());
                OpResult::Return
            }
            Op::CallSet { .. } => {
                let (container, index) = (&inputs[0], &inputs[1]);
                concrete!(container, index);
                match container {
                    Value::MutableArray(id) => {
                        if vm.heap.array(*id).is_some_and(|a| a.frozen) {
                            return Err(VmError::TypeError("cannot write to a frozen array".into()));
                        }
                        match index_of(index)? {
                            Some(i) if vm.heap.set_array_item(*id, i, inputs[2].clone()) => OpResult::Return,
                            _ => OpResult::Fail,
                        }
                    }
                    Value::MutableMap(id) => match vm.heap.set_map_entry(*id, index.clone(), inputs[2].clone()) {
                        Lookup::Blocked(cell) => OpResult::Block(cell),
                        Lookup::Found(_) | Lookup::Missing => OpResult::Return,
                    },
                    other => return Err(type_error("a mutable array or map", other)),
                }
            }
            Op::ArrayAdd { .. } => {
                let container = &inputs[0];
                concrete!(container);
                let Value::MutableArray(id) = container else {
                    return Err(type_error("a mutable array", container));
                };
                if vm.heap.array(*id).is_some_and(|a| a.frozen) {
                    return Err(VmError::TypeError("cannot append to a frozen array".into()));
                }
                vm.heap.push_array_item(*id, inputs[1].clone());
                OpResult::Return
            }
            Op::NewOption { .. } => self.produce(vm, dest, Value::Option(Rc::new(inputs[0].clone()))),
            Op::Length { .. } => {
                let container = &inputs[0];
                concrete!(container);
                let len = match container {
                    Value::Array(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    Value::String(s) => s.chars().count(),
                    Value::MutableArray(id) => vm.heap.array(*id).map_or(0, |a| a.items.len()),
                    Value::MutableMap(id) => vm.heap.map(*id).map_or(0, <[_]>::len),
                    other => return Err(type_error("a container", other)),
                };
                self.produce(vm, dest, Value::int(len as i64))
            }
            Op::NewArray { .. } => self.produce(vm, dest, Value::array(inputs.to_vec())),
            Op::NewMutableArray { .. } => {
                let id = vm.heap.new_array(inputs.to_vec());
                self.produce(vm, dest, Value::MutableArray(id))
            }
            Op::NewMutableArrayWithCapacity { .. } => {
                let size = &inputs[0];
                concrete!(size);
                let Some(capacity) = index_of(size)? else {
                    return Err(VmError::Runtime("array capacity must not be negative".into()));
                };
                let id = vm.heap.new_array(Vec::with_capacity(capacity.min(MAX_PREALLOCATED)));
                self.produce(vm, dest, Value::MutableArray(id))
            }
            Op::InPlaceMakeImmutable { .. } => {
                let container = &inputs[0];
                concrete!(container);
                let Value::MutableArray(id) = container else {
                    return Err(type_error("a mutable array", container));
                };
                vm.heap.freeze_array(*id);
                OpResult::Return
            }
            Op::NewMap { .. } => {
                let (keys, values) = inputs.split_at(inputs.len() / 2);
                let mut entries: Vec<(Value, Value)> = Vec::with_capacity(keys.len());
                for (key, value) in keys.iter().zip(values) {
                    match vm.heap.lookup(&entries, key) {
                        Lookup::Found(i) => entries[i].1 = value.clone(),
                        Lookup::Missing => entries.push((key.clone(), value.clone())),
                        Lookup::Blocked(cell) => return Ok(OpResult::Block(cell)),
                    }
                }
                self.produce(vm, dest, Value::Map(Rc::new(entries)))
            }
            Op::MapKey { .. } | Op::MapValue { .. } => {
                let (map, index) = (&inputs[0], &inputs[1]);
                concrete!(map, index);
                let entry = match map {
                    Value::Map(entries) => index_of(index)?.and_then(|i| entries.get(i).cloned()),
                    Value::MutableMap(id) => index_of(index)?
                        .and_then(|i| vm.heap.map(*id).and_then(|entries| entries.get(i).cloned())),
                    other => return Err(type_error("a map", other)),
                };
                match entry {
                    Some((key, _)) if matches!(op, Op::MapKey { .. }) => self.produce(vm, dest, key),
                    Some((_, value)) => self.produce(vm, dest, value),
                    None => OpResult::Fail,
                }
            }
            Op::NewObject { fields, .. } => {
                let fields = fields
                    .iter()
                    .map(|f| Rc::from(f.as_str()))
                    .zip(inputs.iter().cloned())
                    .collect();
                let id = vm.heap.new_object(fields);
                self.produce(vm, dest, Value::Object(id))
            }
            Op::LoadField { field, .. } => {
                let object = &inputs[0];
                concrete!(object);
                let Value::Object(id) = object else {
                    return Err(type_error("an object", object));
                };
                let value = vm
                    .heap
                    .field_index(*id, field)
                    .and_then(|index| vm.heap.field(*id, index));
                match value {
                    Some(value) => self.produce(vm, dest, value),
                    None => return Err(VmError::Runtime(format!("object has no field `{}`", field))),
                }
            }
            Op::UnifyField { field, .. } => {
                let object = &inputs[0];
                concrete!(object);
                let Value::Object(id) = object else {
                    return Err(type_error("an object", object));
                };
                let Some(index) = vm.heap.field_index(*id, field) else {
                    return Err(VmError::Runtime(format!("object has no field `{}`", field)));
                };
                match vm.heap.raw_field(*id, index).cloned() {
                    Some(current) if !current.is_uninitialized() => {
                        if vm.heap.def(&current, &inputs[1], &mut self.ready) {
                            OpResult::Return
                        } else {
                            OpResult::Fail
                        }
                    }
                    _ => {
                        vm.heap.init_field(*id, index, inputs[1].clone());
                        OpResult::Return
                    }
                }
            }
            Op::NewVar { .. } => {
                let id = vm.heap.new_var(inputs[0].clone());
                self.produce(vm, dest, Value::Var(id))
            }
            Op::Move { .. } => self.produce(vm, dest, inputs[0].clone()),
            Op::Call { .. } => self.call_value(vm, context, task, &inputs[0], &inputs[1..], dest)?,
            other => {
                return Err(VmError::Runtime(format!(
                    "{} cannot be suspended",
                    other.name()
                )))
            }
        })
    }
}
