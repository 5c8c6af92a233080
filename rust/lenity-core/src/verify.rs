//! Structural verification of procedures before they are loaded.
//!
//! The interpreter indexes registers, constants, operand ranges and labels
//! without bounds checks of its own, so every index is validated here once.

use crate::bytecode::*;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("{proc}: register r{reg} out of bounds at op {pc} ({registers} registers)")]
    RegisterOutOfBounds {
        proc: String,
        pc: usize,
        reg: u32,
        registers: u32,
    },
    #[error("{proc}: constant k{index} out of bounds at op {pc}")]
    ConstantOutOfBounds { proc: String, pc: usize, index: u32 },
    #[error("{proc}: operand range {start}..{end} out of bounds at op {pc}")]
    OperandRangeOutOfBounds {
        proc: String,
        pc: usize,
        start: u32,
        end: u32,
    },
    #[error("{proc}: label L{label} is undefined or points outside the procedure")]
    BadLabel { proc: String, label: u32 },
    #[error("{proc}: unwind edge [{begin}, {end}) is malformed or out of order")]
    BadUnwindEdge { proc: String, begin: u32, end: u32 },
    #[error("{proc}: declares {params} params but only {registers} registers")]
    TooManyParams {
        proc: String,
        params: u32,
        registers: u32,
    },
    #[error("{proc}: reference to unknown procedure '{target}'")]
    UnknownProcedure { proc: String, target: String },
    #[error("duplicate procedure '{0}'")]
    DuplicateProcedure(String),
    #[error("map op at {pc} in {proc} has {keys} keys but {values} values")]
    MapArity {
        proc: String,
        pc: usize,
        keys: u32,
        values: u32,
    },
}

/// Everything an op refers to, gathered for checking.
#[derive(Default)]
struct OpRefs {
    operands: Vec<Operand>,
    regs: Vec<Reg>,
    labels: Vec<Label>,
    ranges: Vec<OperandRange>,
}

fn op_refs(op: &Op) -> OpRefs {
    let mut r = OpRefs::default();
    if let Some(dest) = op.dest() {
        r.regs.push(dest);
    }
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
        | Op::Gte { left, right, .. } => r.operands.extend([*left, *right]),
        Op::Neg { source, .. } | Op::Query { source, .. } | Op::Move { source, .. } => {
            r.operands.push(*source)
        }
        Op::Melt { value, .. }
        | Op::Freeze { value, .. }
        | Op::NewOption { value, .. }
        | Op::NewVar { value, .. } => r.operands.push(*value),
        Op::VarGet { var, .. } => r.operands.push(*var),
        Op::VarSet { var, value } => r.operands.extend([*var, *value]),
        Op::SetField { object, value, .. } | Op::UnifyField { object, value, .. } => {
            r.operands.extend([*object, *value])
        }
        Op::LoadField { object, .. } => r.operands.push(*object),
        Op::CallSet {
            container,
            index,
            value,
        } => r.operands.extend([*container, *index, *value]),
        Op::ArrayAdd { container, value } => r.operands.extend([*container, *value]),
        Op::Length { container, .. } => r.operands.push(*container),
        Op::InPlaceMakeImmutable { container } => r.operands.push(*container),
        Op::NewArray { values, .. }
        | Op::NewMutableArray { values, .. }
        | Op::NewObject { values, .. } => r.ranges.push(*values),
        Op::NewMutableArrayWithCapacity { size, .. } => r.operands.push(*size),
        Op::NewMap { keys, values, .. } => r.ranges.extend([*keys, *values]),
        Op::MapKey { map, index, .. } | Op::MapValue { map, index, .. } => {
            r.operands.extend([*map, *index])
        }
        Op::Jump { target } => r.labels.push(*target),
        Op::JumpIfInitialized { source, target } => {
            r.regs.push(*source);
            r.labels.push(*target);
        }
        Op::Switch { which, targets } => {
            r.operands.push(*which);
            r.labels.extend(targets.iter().copied());
        }
        Op::Call { callee, args, .. } => {
            r.operands.push(*callee);
            r.ranges.push(*args);
        }
        Op::Return { value } => r.operands.push(*value),
        Op::BeginFailureContext { on_failure } => r.labels.push(*on_failure),
        Op::EndFailureContext { done } => r.labels.push(*done),
        Op::BeginTask { on_yield, .. } => r.labels.push(*on_yield),
        Op::EndTask {
            value,
            write,
            signal,
        } => {
            r.operands.push(*value);
            r.regs.extend(write.iter().copied());
            r.operands.extend(signal.iter().copied());
        }
        Op::WaitSemaphore { source, .. } => r.operands.push(*source),
        Op::Reset { .. } | Op::NewSemaphore { .. } | Op::Err | Op::ResumeUnwind => {}
    }
    r
}

/// Checks one procedure in isolation.
pub fn verify_procedure(proc: &Procedure) -> Result<(), VerifyError> {
    let name = || proc.name.clone();
    if proc.params > proc.registers {
        return Err(VerifyError::TooManyParams {
            proc: name(),
            params: proc.params,
            registers: proc.registers,
        });
    }

    for (label, &target) in proc.labels.iter().enumerate() {
        if target as usize >= proc.ops.len() {
            return Err(VerifyError::BadLabel {
                proc: name(),
                label: label as u32,
            });
        }
    }

    let check_operand = |pc: usize, operand: &Operand| -> Result<(), VerifyError> {
        match operand {
            Operand::Reg(reg) if reg.0 >= proc.registers => Err(VerifyError::RegisterOutOfBounds {
                proc: name(),
                pc,
                reg: reg.0,
                registers: proc.registers,
            }),
            Operand::Const(k) if k.0 as usize >= proc.constants.len() => {
                Err(VerifyError::ConstantOutOfBounds {
                    proc: name(),
                    pc,
                    index: k.0,
                })
            }
            _ => Ok(()),
        }
    };

    for (pc, op) in proc.ops.iter().enumerate() {
        let refs = op_refs(op);
        for operand in &refs.operands {
            check_operand(pc, operand)?;
        }
        for reg in &refs.regs {
            if reg.0 >= proc.registers {
                return Err(VerifyError::RegisterOutOfBounds {
                    proc: name(),
                    pc,
                    reg: reg.0,
                    registers: proc.registers,
                });
            }
        }
        for label in &refs.labels {
            if label.0 as usize >= proc.labels.len() {
                return Err(VerifyError::BadLabel {
                    proc: name(),
                    label: label.0,
                });
            }
        }
        for range in &refs.ranges {
            if range.end() as usize > proc.operands.len() {
                return Err(VerifyError::OperandRangeOutOfBounds {
                    proc: name(),
                    pc,
                    start: range.start,
                    end: range.end(),
                });
            }
            for operand in proc.operand_slice(*range) {
                check_operand(pc, operand)?;
            }
        }
        if let Op::NewMap { keys, values, .. } = op {
            if keys.len != values.len {
                return Err(VerifyError::MapArity {
                    proc: name(),
                    pc,
                    keys: keys.len,
                    values: values.len,
                });
            }
        }
    }

    let mut last_begin = 0;
    for edge in &proc.unwind_edges {
        let malformed = edge.begin > edge.end
            || edge.end as usize > proc.ops.len()
            || edge.begin < last_begin
            || edge.on_unwind.0 as usize >= proc.labels.len();
        if malformed {
            return Err(VerifyError::BadUnwindEdge {
                proc: name(),
                begin: edge.begin,
                end: edge.end,
            });
        }
        last_begin = edge.begin;
    }
    Ok(())
}

/// Checks every procedure plus cross-procedure references.
pub fn verify_program(program: &Program) -> Result<(), VerifyError> {
    let mut names = HashSet::new();
    for proc in &program.procedures {
        if !names.insert(proc.name.as_str()) {
            return Err(VerifyError::DuplicateProcedure(proc.name.clone()));
        }
    }
    for proc in &program.procedures {
        verify_procedure(proc)?;
        for constant in &proc.constants {
            if let Constant::Function(target) = constant {
                if !names.contains(target.as_str()) {
                    return Err(VerifyError::UnknownProcedure {
                        proc: proc.name.clone(),
                        target: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}
