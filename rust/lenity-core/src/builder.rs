//! Incremental assembly of a [`Procedure`].

use crate::bytecode::*;

/// Label value used until [`ProcedureBuilder::bind`] is called.
const UNBOUND: u32 = u32::MAX;

/// Builds a procedure op by op. Registers `0..params` hold the parameters.
#[derive(Debug, Clone)]
pub struct ProcedureBuilder {
    proc: Procedure,
}

impl ProcedureBuilder {
    pub fn new(name: &str, params: u32) -> Self {
        Self {
            proc: Procedure {
                name: name.to_string(),
                params,
                registers: params,
                ops: Vec::new(),
                constants: Vec::new(),
                operands: Vec::new(),
                labels: Vec::new(),
                unwind_edges: Vec::new(),
            },
        }
    }

    /// Allocates a fresh register.
    pub fn reg(&mut self) -> Reg {
        let reg = Reg(self.proc.registers);
        self.proc.registers += 1;
        reg
    }

    pub fn param(&self, index: u32) -> Operand {
        Operand::Reg(Reg(index))
    }

    pub fn constant(&mut self, constant: Constant) -> Operand {
        if let Some(i) = self.proc.constants.iter().position(|c| *c == constant) {
            return Operand::Const(ConstIdx(i as u32));
        }
        self.proc.constants.push(constant);
        Operand::Const(ConstIdx(self.proc.constants.len() as u32 - 1))
    }

    pub fn int(&mut self, value: i64) -> Operand {
        self.constant(Constant::Int(value))
    }

    pub fn float(&mut self, value: f64) -> Operand {
        self.constant(Constant::Float(value))
    }

    pub fn string(&mut self, value: &str) -> Operand {
        self.constant(Constant::String(value.to_string()))
    }

    pub fn logic(&mut self, value: bool) -> Operand {
        self.constant(if value { Constant::True } else { Constant::False })
    }

    pub fn function(&mut self, name: &str) -> Operand {
        self.constant(Constant::Function(name.to_string()))
    }

    pub fn native(&mut self, name: &str) -> Operand {
        self.constant(Constant::Native(name.to_string()))
    }

    pub fn type_tag(&mut self, tag: TypeTag) -> Operand {
        self.constant(Constant::Type(tag))
    }

    /// Appends a list of operands to the operand table.
    pub fn operands(&mut self, operands: &[Operand]) -> OperandRange {
        let start = self.proc.operands.len() as u32;
        self.proc.operands.extend_from_slice(operands);
        OperandRange {
            start,
            len: operands.len() as u32,
        }
    }

    /// Declares a label; bind it later with [`bind`](Self::bind).
    pub fn label(&mut self) -> Label {
        self.proc.labels.push(UNBOUND);
        Label(self.proc.labels.len() as u32 - 1)
    }

    /// Points `label` at the next emitted op.
    pub fn bind(&mut self, label: Label) {
        let here = self.here();
        if let Some(slot) = self.proc.labels.get_mut(label.0 as usize) {
            *slot = here;
        }
    }

    /// Offset of the next op to be emitted.
    pub fn here(&self) -> u32 {
        self.proc.ops.len() as u32
    }

    pub fn emit(&mut self, op: Op) -> u32 {
        self.proc.ops.push(op);
        self.proc.ops.len() as u32 - 1
    }

    /// Ops in `[begin, end)` unwind to `on_unwind` when their task is canceled.
    pub fn unwind_edge(&mut self, begin: u32, end: u32, on_unwind: Label) {
        self.proc.unwind_edges.push(UnwindEdge {
            begin,
            end,
            on_unwind,
        });
    }

    pub fn finish(self) -> Procedure {
        self.proc
    }
}
