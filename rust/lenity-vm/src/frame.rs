//! Activation records.

use crate::heap::Heap;
use crate::ids::FunctionId;
use crate::values::Value;
use lenity_core::{Operand, Procedure, Reg};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// A loaded procedure: bytecode plus its resolved constant table.
#[derive(Debug)]
pub struct Code {
    pub id: FunctionId,
    pub procedure: Procedure,
    pub constants: Vec<Value>,
}

impl Code {
    /// Empty procedure used as the frame of host-side drains.
    pub(crate) fn host() -> Self {
        Self {
            id: FunctionId(u32::MAX),
            procedure: Procedure {
                name: "<host>".to_string(),
                params: 0,
                registers: 0,
                ops: Vec::new(),
                constants: Vec::new(),
                operands: Vec::new(),
                labels: Vec::new(),
                unwind_edges: Vec::new(),
            },
            constants: Vec::new(),
        }
    }
}

/// Program counter. `Stop` ends the interpreter that reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pc {
    At(usize),
    Stop,
}

impl Pc {
    pub fn next(self) -> Pc {
        match self {
            Pc::At(n) => Pc::At(n + 1),
            Pc::Stop => Pc::Stop,
        }
    }
}

pub type FrameRef = Rc<RefCell<Frame>>;

pub struct Frame {
    pub code: Rc<Code>,
    pub registers: Vec<Value>,
    pub caller_pc: Pc,
    pub caller_frame: Option<FrameRef>,
    /// Cell the procedure's `Return` defines.
    pub return_slot: Value,
    /// Defined with the frame's final effect token on `Return`, when the
    /// call was made leniently. `Uninitialized` otherwise.
    pub return_effect_token: Value,
    pub depth: usize,
}

impl Frame {
    pub fn new(code: Rc<Code>, return_slot: Value, depth: usize) -> Self {
        let registers = vec![Value::Uninitialized; code.procedure.registers as usize];
        Self {
            code,
            registers,
            caller_pc: Pc::Stop,
            caller_frame: None,
            return_slot,
            return_effect_token: Value::Uninitialized,
            depth,
        }
    }

    pub fn into_ref(self) -> FrameRef {
        Rc::new(RefCell::new(self))
    }

    pub fn register(&self, reg: Reg) -> Value {
        self.registers
            .get(reg.0 as usize)
            .cloned()
            .unwrap_or(Value::Uninitialized)
    }

    pub fn set_register(&mut self, reg: Reg, value: Value) {
        if let Some(slot) = self.registers.get_mut(reg.0 as usize) {
            *slot = value;
        }
    }

    /// Register contents, replacing an empty register with a fresh
    /// placeholder so later definitions are observed through it.
    pub fn materialize(&mut self, reg: Reg, heap: &mut Heap) -> Value {
        match self.registers.get_mut(reg.0 as usize) {
            Some(slot) if slot.is_uninitialized() => {
                *slot = heap.new_placeholder();
                slot.clone()
            }
            Some(slot) => slot.clone(),
            None => Value::Uninitialized,
        }
    }

    /// Reads an operand for use. Empty operands read as `false`.
    pub fn read(&mut self, operand: Operand, heap: &mut Heap) -> Value {
        match operand {
            Operand::Reg(reg) => self.materialize(reg, heap),
            Operand::Const(k) => self
                .code
                .constants
                .get(k.0 as usize)
                .cloned()
                .unwrap_or(Value::Uninitialized),
            Operand::Empty => Value::False,
        }
    }

    /// Copy of this frame without caller linkage, for replaying a
    /// speculative region's then/else range later. Empty registers are
    /// materialized first so both copies share the same cells.
    pub fn clone_without_caller(&mut self, heap: &mut Heap) -> Frame {
        for slot in self.registers.iter_mut() {
            if slot.is_uninitialized() {
                *slot = heap.new_placeholder();
            }
        }
        Frame {
            code: self.code.clone(),
            registers: self.registers.clone(),
            caller_pc: Pc::Stop,
            caller_frame: None,
            return_slot: self.return_slot.clone(),
            return_effect_token: self.return_effect_token.clone(),
            depth: self.depth,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("procedure", &self.code.procedure.name)
            .field("registers", &self.registers.len())
            .field("caller_pc", &self.caller_pc)
            .field("has_caller", &self.caller_frame.is_some())
            .field("depth", &self.depth)
            .finish()
    }
}
