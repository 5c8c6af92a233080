use lenity_core::{Label, Op, Operand, Procedure, ProcedureBuilder, Program, Reg, VerifyError};
use lenity_vm::{Vm, VmConfig, VmError};

fn vm_with(config: VmConfig, procs: Vec<Procedure>) -> Vm {
    let mut vm = Vm::with_config(config);
    vm.load(Program::new(procs)).expect("program should load");
    vm
}

#[test]
fn infinite_loop_hits_instruction_limit() {
    let mut b = ProcedureBuilder::new("main", 0);
    let top = b.label();
    b.bind(top);
    b.emit(Op::Jump { target: top });
    let config = VmConfig {
        max_instructions: Some(100),
        ..VmConfig::default()
    };
    let mut vm = vm_with(config, vec![b.finish()]);

    match vm.invoke("main", vec![]) {
        Err(VmError::InstructionLimitExceeded(100)) => {}
        other => panic!("expected instruction limit, got {:?}", other),
    }
}

/// `h(f)` calls a callee that only becomes known after the call, which in
/// turn is `h` again: every level nests another interpreter.
#[test]
fn unbounded_lenient_nesting_is_an_error() {
    let mut h = ProcedureBuilder::new("h", 1);
    let (result, callee) = (h.reg(), h.reg());
    let f = h.param(0);
    let args = h.operands(&[f]);
    h.emit(Op::Call { dest: result, callee: Operand::Reg(callee), args });
    h.emit(Op::Move { dest: callee, source: f });
    h.emit(Op::Return { value: Operand::Reg(result) });

    let mut main = ProcedureBuilder::new("main", 0);
    let r = main.reg();
    let hf = main.function("h");
    let args = main.operands(&[hf]);
    main.emit(Op::Call { dest: r, callee: hf, args });
    main.emit(Op::Return { value: Operand::Reg(r) });

    let config = VmConfig {
        max_lenient_depth: 8,
        ..VmConfig::default()
    };
    let mut vm = vm_with(config, vec![main.finish(), h.finish()]);
    match vm.invoke("main", vec![]) {
        Err(VmError::StackExhausted(8)) => {}
        other => panic!("expected exhausted lenient stack, got {:?}", other),
    }
}

#[test]
fn loader_rejects_unbound_label() {
    let mut b = ProcedureBuilder::new("main", 0);
    b.emit(Op::Jump { target: Label(3) });
    let mut vm = Vm::new();
    let err = vm.load(Program::new(vec![b.finish()])).unwrap_err();
    assert!(matches!(err, VmError::Verify(VerifyError::BadLabel { .. })), "{err}");
}

#[test]
fn loader_rejects_register_out_of_bounds() {
    let mut b = ProcedureBuilder::new("main", 0);
    let one = b.int(1);
    b.emit(Op::Move { dest: Reg(9), source: one });
    let mut vm = Vm::new();
    let err = vm.load(Program::new(vec![b.finish()])).unwrap_err();
    assert!(matches!(
        err,
        VmError::Verify(VerifyError::RegisterOutOfBounds { .. })
    ));
    assert!(vm.procedure("main").is_none());
}

/// `a = []; a.add(a)`, then `tail` is emitted on the self-containing array.
fn self_containing_array(tail: impl FnOnce(&mut ProcedureBuilder, Reg)) -> Procedure {
    let mut b = ProcedureBuilder::new("main", 0);
    let a = b.reg();
    let empty = b.operands(&[]);
    b.emit(Op::NewMutableArray { dest: a, values: empty });
    b.emit(Op::ArrayAdd { container: Operand::Reg(a), value: Operand::Reg(a) });
    tail(&mut b, a);
    b.finish()
}

#[test]
fn freezing_a_cyclic_array_is_an_error() {
    let main = self_containing_array(|b, a| {
        let frozen = b.reg();
        b.emit(Op::Freeze { dest: frozen, value: Operand::Reg(a) });
        b.emit(Op::Return { value: Operand::Reg(frozen) });
    });
    let mut vm = vm_with(VmConfig::default(), vec![main]);
    match vm.invoke("main", vec![]) {
        Err(VmError::Runtime(message)) => assert!(message.contains("cyclic")),
        other => panic!("expected a runtime error, got {:?}", other),
    }
}

#[test]
fn printing_a_cyclic_array_elides_the_cycle() {
    let main = self_containing_array(|b, a| {
        let printed = b.reg();
        let print = b.native("print");
        let args = b.operands(&[Operand::Reg(a)]);
        let zero = b.int(0);
        b.emit(Op::Call { dest: printed, callee: print, args });
        b.emit(Op::Return { value: zero });
    });
    let mut vm = vm_with(VmConfig::default(), vec![main]);
    vm.invoke("main", vec![]).unwrap();
    assert_eq!(vm.output, vec!["array{...}".to_string()]);
}
