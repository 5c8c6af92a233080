//! Tasks: suspension, resumption from the host, semaphores, awaiting and
//! structured cancellation.

use lenity_core::{Op, Operand, Procedure, ProcedureBuilder, Program};
use lenity_vm::{
    Completion, NativeEffects, NativeFunction, Outcome, TaskId, TaskPhase, Value, Vm, VmError,
};

/// Vm with a `park` native that suspends the calling task until the host
/// resumes it.
fn vm_with(procs: Vec<Procedure>) -> Vm {
    let mut vm = Vm::new();
    vm.register_native(NativeFunction::new("park", 0, NativeEffects::Pure, |ctx, _| ctx.park()));
    vm.load(Program::new(procs)).expect("program should load");
    vm
}

fn returned(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Return(v) => v,
        Outcome::Fail => panic!("expected a return, got failure"),
    }
}

fn lines(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

const ROOT: TaskId = TaskId(0);

#[test]
fn semaphore_wakes_waiting_task() {
    let mut b = ProcedureBuilder::new("main", 0);
    let (sem, task, parked, printed) = (b.reg(), b.reg(), b.reg(), b.reg());
    let park = b.native("park");
    let print = b.native("print");
    let woken = b.string("woken");
    let five = b.int(5);
    let no_args = b.operands(&[]);
    let print_args = b.operands(&[woken]);
    let on_yield = b.label();

    b.emit(Op::NewSemaphore { dest: sem });
    b.emit(Op::BeginTask { dest: task, attached: true, on_yield });
    b.emit(Op::Call { dest: parked, callee: park, args: no_args });
    b.emit(Op::EndTask {
        value: Operand::Reg(parked),
        write: None,
        signal: Some(Operand::Reg(sem)),
    });
    b.bind(on_yield);
    b.emit(Op::WaitSemaphore { source: Operand::Reg(sem), count: 1 });
    b.emit(Op::Call { dest: printed, callee: print, args: print_args });
    b.emit(Op::Return { value: five });
    let mut vm = vm_with(vec![b.finish()]);

    let result = returned(vm.invoke("main", vec![]).unwrap());
    assert!(!vm.is_concrete(&result));
    assert!(vm.output.is_empty());
    assert_eq!(vm.parked_tasks(), vec![ROOT, TaskId(1)]);

    let completion = vm.resume_in_transaction(TaskId(1), Value::int(5)).unwrap();
    assert_eq!(completion, Completion::Committed);
    assert_eq!(vm.output, lines(&["woken"]));
    assert_eq!(vm.resolve(&result), Value::int(5));
    assert!(vm.parked_tasks().is_empty());
}

#[test]
fn second_waiter_on_a_semaphore_is_an_error() {
    let mut b = ProcedureBuilder::new("main", 0);
    let (sem, first, second) = (b.reg(), b.reg(), b.reg());
    let zero = b.int(0);
    let (first_yield, second_yield) = (b.label(), b.label());

    b.emit(Op::NewSemaphore { dest: sem });
    b.emit(Op::BeginTask { dest: first, attached: false, on_yield: first_yield });
    b.emit(Op::WaitSemaphore { source: Operand::Reg(sem), count: 1 });
    b.emit(Op::EndTask { value: zero, write: None, signal: None });
    b.bind(first_yield);
    b.emit(Op::BeginTask { dest: second, attached: false, on_yield: second_yield });
    b.emit(Op::WaitSemaphore { source: Operand::Reg(sem), count: 1 });
    b.emit(Op::EndTask { value: zero, write: None, signal: None });
    b.bind(second_yield);
    b.emit(Op::Return { value: zero });
    let mut vm = vm_with(vec![b.finish()]);

    let err = vm.invoke("main", vec![]).unwrap_err();
    assert!(matches!(err, VmError::Runtime(ref m) if m.contains("already has task 1 waiting")));
}

/// ```text
///  v = var 0
///  spawn { x = park(); set v = 1; x? }
///  return v
/// ```
fn resume_then_query() -> Procedure {
    let mut b = ProcedureBuilder::new("main", 0);
    let (v, task, parked, queried) = (b.reg(), b.reg(), b.reg(), b.reg());
    let park = b.native("park");
    let zero = b.int(0);
    let one = b.int(1);
    let no_args = b.operands(&[]);
    let on_yield = b.label();

    b.emit(Op::NewVar { dest: v, value: zero });
    b.emit(Op::BeginTask { dest: task, attached: false, on_yield });
    b.emit(Op::Call { dest: parked, callee: park, args: no_args });
    b.emit(Op::VarSet { var: Operand::Reg(v), value: one });
    b.emit(Op::Query { dest: queried, source: Operand::Reg(parked) });
    b.emit(Op::EndTask { value: Operand::Reg(queried), write: None, signal: None });
    b.bind(on_yield);
    b.emit(Op::Return { value: Operand::Reg(v) });
    b.finish()
}

#[test]
fn aborted_resumption_leaves_the_task_parked() {
    let mut vm = vm_with(vec![resume_then_query()]);
    let var = returned(vm.invoke("main", vec![]).unwrap());
    let task = TaskId(1);
    assert_eq!(vm.parked_tasks(), vec![task]);

    let completion = vm.resume_in_transaction(task, Value::False).unwrap();
    assert_eq!(completion, Completion::Aborted);
    assert_eq!(vm.var_value(&var), Some(Value::int(0)));
    assert_eq!(vm.parked_tasks(), vec![task]);
    assert_eq!(vm.task_phase(task), Some(TaskPhase::Active));

    let completion = vm.resume_in_transaction(task, Value::logic(true)).unwrap();
    assert_eq!(completion, Completion::Committed);
    assert_eq!(vm.var_value(&var), Some(Value::int(1)));
    assert!(vm.parked_tasks().is_empty());
}

#[test]
fn await_receives_the_task_result() {
    let mut b = ProcedureBuilder::new("main", 0);
    let (task, parked, awaited) = (b.reg(), b.reg(), b.reg());
    let park = b.native("park");
    let wait = b.native("await");
    let answer = b.int(42);
    let no_args = b.operands(&[]);
    let await_args = b.operands(&[Operand::Reg(task)]);
    let on_yield = b.label();

    b.emit(Op::BeginTask { dest: task, attached: false, on_yield });
    b.emit(Op::Call { dest: parked, callee: park, args: no_args });
    b.emit(Op::EndTask { value: answer, write: None, signal: None });
    b.bind(on_yield);
    b.emit(Op::Call { dest: awaited, callee: wait, args: await_args });
    b.emit(Op::Return { value: Operand::Reg(awaited) });
    let mut vm = vm_with(vec![b.finish()]);

    let result = returned(vm.invoke("main", vec![]).unwrap());
    assert!(!vm.is_concrete(&result));

    vm.resume_in_transaction(TaskId(1), Value::False).unwrap();
    assert_eq!(vm.resolve(&result), Value::int(42));
    assert_eq!(vm.task_phase(TaskId(1)), Some(TaskPhase::Active));
}

#[test]
fn resuming_a_running_or_finished_task_is_skipped() {
    let mut b = ProcedureBuilder::new("main", 0);
    let one = b.int(1);
    b.emit(Op::Return { value: one });
    let mut vm = vm_with(vec![b.finish()]);

    assert_eq!(vm.invoke("main", vec![]).unwrap(), Outcome::Return(Value::int(1)));
    assert_eq!(
        vm.resume_in_transaction(ROOT, Value::False).unwrap(),
        Completion::Skipped
    );
    assert_eq!(vm.unwind_in_transaction(ROOT).unwrap(), Completion::Skipped);
}

#[test]
fn host_unwind_runs_cleanup_block() {
    let mut b = ProcedureBuilder::new("main", 0);
    let (task, parked, printed) = (b.reg(), b.reg(), b.reg());
    let park = b.native("park");
    let print = b.native("print");
    let message = b.string("cleanup");
    let zero = b.int(0);
    let no_args = b.operands(&[]);
    let print_args = b.operands(&[message]);
    let (cleanup, end, on_yield) = (b.label(), b.label(), b.label());

    b.emit(Op::BeginTask { dest: task, attached: false, on_yield });
    let parked_at = b.emit(Op::Call { dest: parked, callee: park, args: no_args });
    b.emit(Op::Jump { target: end });
    b.bind(cleanup);
    b.emit(Op::Call { dest: printed, callee: print, args: print_args });
    b.bind(end);
    b.emit(Op::EndTask { value: Operand::Reg(parked), write: None, signal: None });
    b.bind(on_yield);
    b.emit(Op::Return { value: zero });
    b.unwind_edge(parked_at, parked_at + 1, cleanup);
    let mut vm = vm_with(vec![b.finish()]);

    assert_eq!(vm.invoke("main", vec![]).unwrap(), Outcome::Return(Value::int(0)));
    assert_eq!(vm.task_phase(TaskId(1)), Some(TaskPhase::Active));

    assert_eq!(vm.unwind_in_transaction(TaskId(1)).unwrap(), Completion::Committed);
    assert_eq!(vm.output, lines(&["cleanup"]));
    assert_eq!(vm.task_phase(TaskId(1)), Some(TaskPhase::Canceled));
    assert_eq!(
        vm.resume_in_transaction(TaskId(1), Value::False).unwrap(),
        Completion::Skipped
    );
}

/// ```text
///  P = spawn {
///      C1 = spawn { park() } cleanup { print "C1" }
///      C2 = spawn { park() } cleanup { print "C2" }
///      park()
///  } cleanup { print "P" }
///  cancel(P)
///  print "main"
/// ```
fn structured_cancellation() -> Procedure {
    let mut b = ProcedureBuilder::new("main", 0);
    let (p, c1, c2) = (b.reg(), b.reg(), b.reg());
    let (park1, park2, park3) = (b.reg(), b.reg(), b.reg());
    let (out1, out2, out3, out4, canceled) = (b.reg(), b.reg(), b.reg(), b.reg(), b.reg());
    let park = b.native("park");
    let print = b.native("print");
    let cancel = b.native("cancel");
    let zero = b.int(0);
    let no_args = b.operands(&[]);
    let print_c1 = b.string("C1");
    let print_c2 = b.string("C2");
    let print_p = b.string("P");
    let print_main = b.string("main");
    let c1_args = b.operands(&[print_c1]);
    let c2_args = b.operands(&[print_c2]);
    let p_args = b.operands(&[print_p]);
    let main_args = b.operands(&[print_main]);
    let cancel_args = b.operands(&[Operand::Reg(p)]);

    let p_yield = b.label();
    let (c1_yield, c1_cleanup, c1_end) = (b.label(), b.label(), b.label());
    let (c2_yield, c2_cleanup, c2_end) = (b.label(), b.label(), b.label());
    let (p_cleanup, p_end) = (b.label(), b.label());

    b.emit(Op::BeginTask { dest: p, attached: true, on_yield: p_yield });
    b.emit(Op::BeginTask { dest: c1, attached: true, on_yield: c1_yield });
    let c1_park = b.emit(Op::Call { dest: park1, callee: park, args: no_args });
    b.emit(Op::Jump { target: c1_end });
    b.bind(c1_cleanup);
    b.emit(Op::Call { dest: out1, callee: print, args: c1_args });
    b.bind(c1_end);
    b.emit(Op::EndTask { value: Operand::Empty, write: None, signal: None });

    b.bind(c1_yield);
    b.emit(Op::BeginTask { dest: c2, attached: true, on_yield: c2_yield });
    let c2_park = b.emit(Op::Call { dest: park2, callee: park, args: no_args });
    b.emit(Op::Jump { target: c2_end });
    b.bind(c2_cleanup);
    b.emit(Op::Call { dest: out2, callee: print, args: c2_args });
    b.bind(c2_end);
    b.emit(Op::EndTask { value: Operand::Empty, write: None, signal: None });

    b.bind(c2_yield);
    let p_park = b.emit(Op::Call { dest: park3, callee: park, args: no_args });
    b.emit(Op::Jump { target: p_end });
    b.bind(p_cleanup);
    b.emit(Op::Call { dest: out3, callee: print, args: p_args });
    b.bind(p_end);
    b.emit(Op::EndTask { value: Operand::Empty, write: None, signal: None });

    b.bind(p_yield);
    b.emit(Op::Call { dest: canceled, callee: cancel, args: cancel_args });
    b.emit(Op::Call { dest: out4, callee: print, args: main_args });
    b.emit(Op::Return { value: zero });

    b.unwind_edge(c1_park, c1_park + 1, c1_cleanup);
    b.unwind_edge(c2_park, c2_park + 1, c2_cleanup);
    b.unwind_edge(p_park, p_park + 1, p_cleanup);
    b.finish()
}

#[test]
fn cancellation_unwinds_children_before_parent() {
    let mut vm = vm_with(vec![structured_cancellation()]);
    let result = vm.invoke("main", vec![]).unwrap();

    assert_eq!(vm.output, lines(&["C1", "C2", "P", "main"]));
    assert_eq!(result, Outcome::Return(Value::int(0)));
    let (p, c1, c2) = (TaskId(1), TaskId(2), TaskId(3));
    for task in [p, c1, c2] {
        assert_eq!(vm.task_phase(task), Some(TaskPhase::Canceled));
    }
    assert!(vm.parked_tasks().is_empty());
}
