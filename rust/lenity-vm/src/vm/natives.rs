//! Native call boundary and the built-in natives.

use super::Vm;
use crate::ids::{ContextId, TaskId};
use crate::task::NativeDefer;
use crate::values::Value;
use std::fmt;
use std::rc::Rc;

/// What a native call produced.
#[derive(Debug, Clone)]
pub enum NativeResult {
    Done(Value),
    /// Needs this placeholder resolved; the call is retried once it is.
    Blocked(Value),
    Failed,
    /// The calling task parked itself; its result slot is defined on wake-up.
    Yielded,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeEffects {
    Pure,
    /// Runs only once the incoming effect token is concrete.
    Effectful,
}

pub type NativeThunk = Rc<dyn Fn(&mut NativeContext<'_>, &[Value]) -> NativeResult>;

pub struct NativeFunction {
    pub name: String,
    pub arity: usize,
    pub effects: NativeEffects,
    pub thunk: NativeThunk,
}

impl NativeFunction {
    pub fn new(
        name: &str,
        arity: usize,
        effects: NativeEffects,
        thunk: impl Fn(&mut NativeContext<'_>, &[Value]) -> NativeResult + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            arity,
            effects,
            thunk: Rc::new(thunk),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("effects", &self.effects)
            .finish()
    }
}

/// What a native sees of the interpreter.
pub struct NativeContext<'a> {
    pub vm: &'a mut Vm,
    pub context: ContextId,
    pub task: Option<TaskId>,
    /// Cell the call's result lands in.
    pub(crate) result: Value,
}

impl NativeContext<'_> {
    /// Registers cleanup for the calling task, replacing any earlier one.
    pub fn defer(&mut self, f: impl FnOnce(&mut Vm, TaskId) + 'static) {
        if let Some(task) = self.task {
            let defer: NativeDefer = Box::new(f);
            self.vm.tasks[task.index()].native_defer = Some(defer);
        }
    }

    /// Parks the calling task. The call's destination is defined with the
    /// value the task is later resumed with.
    pub fn park(&mut self) -> NativeResult {
        let Some(task) = self.task else {
            return NativeResult::Error("no task to suspend".to_string());
        };
        let t = &mut self.vm.tasks[task.index()];
        t.running = false;
        t.resume_slot = self.result.clone();
        NativeResult::Yielded
    }

    pub fn render(&mut self, value: &Value) -> String {
        self.vm.heap.render(value)
    }
}

/// Natives every `Vm` starts with.
pub(crate) fn builtins() -> Vec<NativeFunction> {
    vec![
        NativeFunction::new("print", 1, NativeEffects::Effectful, print),
        NativeFunction::new("await", 1, NativeEffects::Pure, await_task),
        NativeFunction::new("cancel", 1, NativeEffects::Pure, cancel_task),
    ]
}

fn print(ctx: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    if let Some(p) = ctx.vm.heap.first_placeholder(&args[0]) {
        return NativeResult::Blocked(p);
    }
    let line = ctx.render(&args[0]);
    tracing::debug!(%line, "print");
    ctx.vm.output.push(line);
    NativeResult::Done(args[0].clone())
}

fn target_task(ctx: &mut NativeContext<'_>, arg: &Value) -> Result<TaskId, NativeResult> {
    match ctx.vm.heap.follow(arg) {
        Value::Task(id) => Ok(id),
        p @ Value::Placeholder(_) => Err(NativeResult::Blocked(p)),
        other => Err(NativeResult::Error(format!(
            "expected a task, got {}",
            other.type_name()
        ))),
    }
}

fn await_task(ctx: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let target = match target_task(ctx, &args[0]) {
        Ok(id) => id,
        Err(result) => return result,
    };
    let t = &ctx.vm.tasks[target.index()];
    if t.finished {
        return NativeResult::Done(t.result.clone());
    }
    let Some(caller) = ctx.task else {
        return NativeResult::Error("await outside a task".to_string());
    };
    if caller == target {
        return NativeResult::Error("a task cannot await itself".to_string());
    }
    ctx.vm.tasks[target.index()].awaiters.push(caller);
    ctx.defer(move |vm, me| {
        vm.tasks[target.index()].awaiters.retain(|t| *t != me);
    });
    ctx.park()
}

fn cancel_task(ctx: &mut NativeContext<'_>, args: &[Value]) -> NativeResult {
    let target = match target_task(ctx, &args[0]) {
        Ok(id) => id,
        Err(result) => return result,
    };
    if ctx.vm.tasks[target.index()].finished {
        return NativeResult::Done(Value::False);
    }
    let Some(caller) = ctx.task else {
        return NativeResult::Error("cancel outside a task".to_string());
    };
    if caller == target {
        return NativeResult::Error("a task cannot cancel itself".to_string());
    }
    ctx.vm.request_cancel(target);
    ctx.vm.tasks[target.index()].cancellers.push(caller);
    ctx.defer(move |vm, me| {
        vm.tasks[target.index()].cancellers.retain(|t| *t != me);
    });
    ctx.park()
}
