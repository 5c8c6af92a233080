//! Lenient execution: ops that wait on placeholders, speculative failure
//! contexts and their deferred commit or rollback.

use lenity_core::{Operand, Op, Procedure, ProcedureBuilder, Program};
use lenity_vm::{Outcome, Value, Vm};

fn vm_with(procs: Vec<Procedure>) -> Vm {
    let mut vm = Vm::new();
    vm.load(Program::new(procs)).expect("program should load");
    vm
}

fn returned(outcome: Outcome) -> Value {
    match outcome {
        Outcome::Return(v) => v,
        Outcome::Fail => panic!("expected a return, got failure"),
    }
}

fn reg(r: lenity_core::Reg) -> Operand {
    Operand::Reg(r)
}

// ─── Waiting on placeholders ───

#[test]
fn add_waits_for_its_argument() {
    let mut b = ProcedureBuilder::new("f", 1);
    let r = b.reg();
    let x = b.param(0);
    let three = b.int(3);
    b.emit(Op::Add { dest: r, left: x, right: three });
    b.emit(Op::Return { value: reg(r) });
    let mut vm = vm_with(vec![b.finish()]);

    let p = vm.new_placeholder();
    let result = returned(vm.invoke("f", vec![p.clone()]).unwrap());
    assert!(!vm.is_concrete(&result));

    assert!(vm.define(&p, Value::int(4)).unwrap());
    assert_eq!(vm.resolve(&result), Value::int(7));
}

#[test]
fn suspended_op_keeps_its_captured_operands() {
    // r1 is reset and reused after the Add blocked on it.
    let mut b = ProcedureBuilder::new("f", 1);
    let r1 = b.reg();
    let r2 = b.reg();
    let x = b.param(0);
    let ten = b.int(10);
    let hundred = b.int(100);
    b.emit(Op::Move { dest: r1, source: x });
    b.emit(Op::Add { dest: r2, left: reg(r1), right: ten });
    b.emit(Op::Reset { dest: r1 });
    b.emit(Op::Move { dest: r1, source: hundred });
    b.emit(Op::Return { value: reg(r2) });
    let mut vm = vm_with(vec![b.finish()]);

    let p = vm.new_placeholder();
    let result = returned(vm.invoke("f", vec![p.clone()]).unwrap());
    vm.define(&p, Value::int(1)).unwrap();
    assert_eq!(vm.resolve(&result), Value::int(11));
}

#[test]
fn effects_run_in_program_order() {
    let mut b = ProcedureBuilder::new("f", 1);
    let (a, c) = (b.reg(), b.reg());
    let print = b.native("print");
    let x = b.param(0);
    let second = b.string("second");
    let first_args = b.operands(&[x]);
    let second_args = b.operands(&[second]);
    b.emit(Op::Call { dest: a, callee: print, args: first_args });
    b.emit(Op::Call { dest: c, callee: print, args: second_args });
    b.emit(Op::Return { value: reg(c) });
    let mut vm = vm_with(vec![b.finish()]);

    let p = vm.new_placeholder();
    returned(vm.invoke("f", vec![p.clone()]).unwrap());
    assert!(vm.output.is_empty(), "second print must wait for the first");

    vm.define(&p, Value::string("first")).unwrap();
    assert_eq!(vm.output, vec!["first".to_string(), "second".to_string()]);
}

#[test]
fn neq_on_partially_known_arrays_waits() {
    let mut b = ProcedureBuilder::new("f", 1);
    let (arr1, arr2, r) = (b.reg(), b.reg(), b.reg());
    let x = b.param(0);
    let one = b.int(1);
    let two = b.int(2);
    let left = b.operands(&[one, x]);
    let right = b.operands(&[one, two]);
    b.emit(Op::NewArray { dest: arr1, values: left });
    b.emit(Op::NewArray { dest: arr2, values: right });
    b.emit(Op::Neq { dest: r, left: reg(arr1), right: reg(arr2) });
    b.emit(Op::Return { value: one });
    let mut vm = vm_with(vec![b.finish()]);

    let p = vm.new_placeholder();
    assert_eq!(
        vm.invoke("f", vec![p.clone()]).unwrap(),
        Outcome::Return(Value::int(1))
    );
    assert!(vm.define(&p, Value::int(3)).unwrap());

    let q = vm.new_placeholder();
    returned(vm.invoke("f", vec![q.clone()]).unwrap());
    // Equal arrays make the Neq fail; the root context has already
    // committed, so the late failure has nowhere to unwind to.
    assert!(vm.define(&q, Value::int(2)).unwrap());
}

// ─── Failure contexts ───

/// ```text
///  v = var 0
///  if {                       -- outer
///      set v = 1
///      if { set v = 2; flag? }  -- inner
///      else { mode? }
///  } else { print "outer else" }
///  return v
/// ```
fn nested_contexts() -> Procedure {
    let mut b = ProcedureBuilder::new("main", 2);
    let (v, q1, q2, out, got) = (b.reg(), b.reg(), b.reg(), b.reg(), b.reg());
    let (flag, mode) = (b.param(0), b.param(1));
    let zero = b.int(0);
    let one = b.int(1);
    let two = b.int(2);
    let print = b.native("print");
    let message = b.string("outer else");
    let print_args = b.operands(&[message]);
    let (outer_else, outer_done) = (b.label(), b.label());
    let (inner_else, inner_done) = (b.label(), b.label());

    b.emit(Op::NewVar { dest: v, value: zero });
    b.emit(Op::BeginFailureContext { on_failure: outer_else });
    b.emit(Op::VarSet { var: reg(v), value: one });
    b.emit(Op::BeginFailureContext { on_failure: inner_else });
    b.emit(Op::VarSet { var: reg(v), value: two });
    b.emit(Op::Query { dest: q1, source: flag });
    b.emit(Op::EndFailureContext { done: inner_done });
    b.emit(Op::Jump { target: inner_done });
    b.bind(inner_else);
    b.emit(Op::Query { dest: q2, source: mode });
    b.bind(inner_done);
    b.emit(Op::EndFailureContext { done: outer_done });
    b.emit(Op::Jump { target: outer_done });
    b.bind(outer_else);
    b.emit(Op::Call { dest: out, callee: print, args: print_args });
    b.bind(outer_done);
    b.emit(Op::VarGet { dest: got, var: reg(v) });
    b.emit(Op::Return { value: reg(got) });
    b.finish()
}

#[test]
fn successful_contexts_commit_their_writes() {
    let mut vm = vm_with(vec![nested_contexts()]);
    let result = vm
        .invoke("main", vec![Value::logic(true), Value::logic(true)])
        .unwrap();
    assert_eq!(result, Outcome::Return(Value::int(2)));
    assert!(vm.output.is_empty());
}

#[test]
fn inner_failure_rolls_back_only_inner_writes() {
    let mut vm = vm_with(vec![nested_contexts()]);
    let result = vm
        .invoke("main", vec![Value::logic(false), Value::logic(true)])
        .unwrap();
    assert_eq!(result, Outcome::Return(Value::int(1)));
    assert!(vm.output.is_empty());
}

#[test]
fn failing_inner_else_fails_the_outer_context() {
    let mut vm = vm_with(vec![nested_contexts()]);
    let result = vm
        .invoke("main", vec![Value::logic(false), Value::logic(false)])
        .unwrap();
    assert_eq!(result, Outcome::Return(Value::int(0)));
    assert_eq!(vm.output, vec!["outer else".to_string()]);
}

/// ```text
///  v = var 0
///  if { x + 1 / x? }  then { set v = 2 }  else { set v = -1 }
///  return v
/// ```
fn deferred_context(query: bool) -> Procedure {
    let mut b = ProcedureBuilder::new("main", 1);
    let (v, r) = (b.reg(), b.reg());
    let x = b.param(0);
    let zero = b.int(0);
    let one = b.int(1);
    let two = b.int(2);
    let minus_one = b.int(-1);
    let (on_failure, done) = (b.label(), b.label());

    b.emit(Op::NewVar { dest: v, value: zero });
    b.emit(Op::BeginFailureContext { on_failure });
    if query {
        b.emit(Op::Query { dest: r, source: x });
    } else {
        b.emit(Op::Add { dest: r, left: x, right: one });
    }
    b.emit(Op::EndFailureContext { done });
    b.emit(Op::VarSet { var: reg(v), value: two });
    b.emit(Op::Jump { target: done });
    b.bind(on_failure);
    b.emit(Op::VarSet { var: reg(v), value: minus_one });
    b.bind(done);
    b.emit(Op::Return { value: reg(v) });
    b.finish()
}

#[test]
fn deferred_context_runs_then_branch_after_resolution() {
    let mut vm = vm_with(vec![deferred_context(false)]);
    let p = vm.new_placeholder();
    let var = returned(vm.invoke("main", vec![p.clone()]).unwrap());
    assert_eq!(vm.var_value(&var), Some(Value::int(0)));

    vm.define(&p, Value::int(1)).unwrap();
    assert_eq!(vm.var_value(&var), Some(Value::int(2)));
}

#[test]
fn deferred_context_runs_else_branch_on_late_failure() {
    let mut vm = vm_with(vec![deferred_context(true)]);
    let p = vm.new_placeholder();
    let var = returned(vm.invoke("main", vec![p.clone()]).unwrap());
    assert_eq!(vm.var_value(&var), Some(Value::int(0)));

    vm.define(&p, Value::False).unwrap();
    assert_eq!(vm.var_value(&var), Some(Value::int(-1)));
}

#[test]
fn failing_root_context_reports_failure() {
    let mut b = ProcedureBuilder::new("main", 0);
    let r = b.reg();
    let no = b.logic(false);
    b.emit(Op::Query { dest: r, source: no });
    b.emit(Op::Return { value: reg(r) });
    let mut vm = vm_with(vec![b.finish()]);
    assert_eq!(vm.invoke("main", vec![]).unwrap(), Outcome::Fail);
}

#[test]
fn division_by_zero_fails_rather_than_errors() {
    let mut b = ProcedureBuilder::new("main", 0);
    let r = b.reg();
    let one = b.int(1);
    let zero = b.int(0);
    b.emit(Op::Div { dest: r, left: one, right: zero });
    b.emit(Op::Return { value: reg(r) });
    let mut vm = vm_with(vec![b.finish()]);
    assert_eq!(vm.invoke("main", vec![]).unwrap(), Outcome::Fail);
}

#[test]
fn call_runs_once_its_callee_is_known() {
    let mut double = ProcedureBuilder::new("double", 1);
    let sum = double.reg();
    let n = double.param(0);
    double.emit(Op::Add { dest: sum, left: n, right: n });
    double.emit(Op::Return { value: reg(sum) });

    // The callee register is only written after the call.
    let mut main = ProcedureBuilder::new("main", 1);
    let (result, callee) = (main.reg(), main.reg());
    let x = main.param(0);
    let f = main.function("double");
    let args = main.operands(&[x]);
    main.emit(Op::Call { dest: result, callee: reg(callee), args });
    main.emit(Op::Move { dest: callee, source: f });
    main.emit(Op::Return { value: reg(result) });
    let mut vm = vm_with(vec![main.finish(), double.finish()]);

    assert_eq!(
        vm.invoke("main", vec![Value::int(3)]).unwrap(),
        Outcome::Return(Value::int(6))
    );

    let p = vm.new_placeholder();
    let result = returned(vm.invoke("main", vec![p.clone()]).unwrap());
    assert!(!vm.is_concrete(&result));
    vm.define(&p, Value::int(5)).unwrap();
    assert_eq!(vm.resolve(&result), Value::int(10));
}

#[test]
fn a_failed_context_runs_its_else_branch_once() {
    let mut b = ProcedureBuilder::new("main", 2);
    let (q1, q2, out) = (b.reg(), b.reg(), b.reg());
    let (x, y) = (b.param(0), b.param(1));
    let zero = b.int(0);
    let print = b.native("print");
    let message = b.string("else");
    let print_args = b.operands(&[message]);
    let (on_failure, done) = (b.label(), b.label());

    b.emit(Op::BeginFailureContext { on_failure });
    b.emit(Op::Query { dest: q1, source: x });
    b.emit(Op::Query { dest: q2, source: y });
    b.emit(Op::EndFailureContext { done });
    b.emit(Op::Jump { target: done });
    b.bind(on_failure);
    b.emit(Op::Call { dest: out, callee: print, args: print_args });
    b.bind(done);
    b.emit(Op::Return { value: zero });
    let mut vm = vm_with(vec![b.finish()]);

    let (p, q) = (vm.new_placeholder(), vm.new_placeholder());
    returned(vm.invoke("main", vec![p.clone(), q.clone()]).unwrap());
    assert!(vm.output.is_empty());

    vm.define(&p, Value::False).unwrap();
    assert_eq!(vm.output, vec!["else".to_string()]);
    vm.define(&q, Value::False).unwrap();
    assert_eq!(vm.output, vec!["else".to_string()]);
}
