//! Bytecode data types.
//! Register machine: every register is a unification cell, operands are
//! registers or constants, variadic operand lists live in a per-procedure
//! operand table.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Register index within a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reg(pub u32);

/// Index into a procedure's constant table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConstIdx(pub u32);

/// Index into a procedure's label table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label(pub u32);

/// A single op operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operand {
    Reg(Reg),
    Const(ConstIdx),
    Empty,
}

/// A slice `[start, start + len)` of the procedure's operand table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OperandRange {
    pub start: u32,
    pub len: u32,
}

impl OperandRange {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn end(&self) -> u32 {
        self.start + self.len
    }
}

/// Cleanup target for ops whose offset lies in `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnwindEdge {
    pub begin: u32,
    pub end: u32,
    pub on_unwind: Label,
}

/// Type tags usable as callees: calling a type checks membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    Any,
    Int,
    Float,
    Rational,
    String,
    Logic,
    Array,
    Map,
    Function,
    Task,
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeTag::Any => "any",
            TypeTag::Int => "int",
            TypeTag::Float => "float",
            TypeTag::Rational => "rational",
            TypeTag::String => "string",
            TypeTag::Logic => "logic",
            TypeTag::Array => "array",
            TypeTag::Map => "map",
            TypeTag::Function => "function",
            TypeTag::Task => "task",
        };
        write!(f, "{}", name)
    }
}

/// Constant pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constant {
    Int(i64),
    Float(f64),
    String(String),
    False,
    True,
    /// Reference to a procedure of the same program, by name.
    Function(String),
    /// Reference to a registered native function, by name.
    Native(String),
    Type(TypeTag),
}

/// Ops of the lenient register machine.
///
/// Ops that define a `dest` unify it with their result; a `dest` that already
/// holds a different concrete value makes the op fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    // Arithmetic
    Add { dest: Reg, left: Operand, right: Operand },
    Sub { dest: Reg, left: Operand, right: Operand },
    Mul { dest: Reg, left: Operand, right: Operand },
    Div { dest: Reg, left: Operand, right: Operand }, // fails on zero divisor
    Mod { dest: Reg, left: Operand, right: Operand }, // fails on zero divisor
    Neg { dest: Reg, source: Operand },

    // Comparison: fail when false, define dest with `left` otherwise
    Neq { dest: Reg, left: Operand, right: Operand },
    Lt { dest: Reg, left: Operand, right: Operand },
    Lte { dest: Reg, left: Operand, right: Operand },
    Gt { dest: Reg, left: Operand, right: Operand },
    Gte { dest: Reg, left: Operand, right: Operand },

    // Logic
    Query { dest: Reg, source: Operand }, // fails on `false`, unwraps options

    // Effect-threading ops
    Melt { dest: Reg, value: Operand },
    Freeze { dest: Reg, value: Operand },
    VarGet { dest: Reg, var: Operand },
    VarSet { var: Operand, value: Operand },
    SetField { object: Operand, field: String, value: Operand },
    CallSet { container: Operand, index: Operand, value: Operand },
    ArrayAdd { container: Operand, value: Operand },

    // Data construction and access
    NewOption { dest: Reg, value: Operand },
    Length { dest: Reg, container: Operand },
    NewArray { dest: Reg, values: OperandRange },
    NewMutableArray { dest: Reg, values: OperandRange },
    NewMutableArrayWithCapacity { dest: Reg, size: Operand },
    InPlaceMakeImmutable { container: Operand },
    NewMap { dest: Reg, keys: OperandRange, values: OperandRange },
    MapKey { dest: Reg, map: Operand, index: Operand },
    MapValue { dest: Reg, map: Operand, index: Operand },
    NewObject { dest: Reg, fields: Vec<String>, values: OperandRange },
    LoadField { dest: Reg, object: Operand, field: String },
    UnifyField { object: Operand, field: String, value: Operand },
    NewVar { dest: Reg, value: Operand },

    // Control flow
    Move { dest: Reg, source: Operand },
    Jump { target: Label },
    JumpIfInitialized { source: Reg, target: Label },
    Switch { which: Operand, targets: Vec<Label> },
    Reset { dest: Reg },
    Err,

    // Calls
    Call { dest: Reg, callee: Operand, args: OperandRange },
    Return { value: Operand },

    // Speculation
    BeginFailureContext { on_failure: Label },
    EndFailureContext { done: Label },

    // Tasks
    BeginTask { dest: Reg, attached: bool, on_yield: Label },
    EndTask { value: Operand, write: Option<Reg>, signal: Option<Operand> },
    NewSemaphore { dest: Reg },
    WaitSemaphore { source: Operand, count: i32 },
    ResumeUnwind,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add { .. } => "Add",
            Op::Sub { .. } => "Sub",
            Op::Mul { .. } => "Mul",
            Op::Div { .. } => "Div",
            Op::Mod { .. } => "Mod",
            Op::Neg { .. } => "Neg",
            Op::Neq { .. } => "Neq",
            Op::Lt { .. } => "Lt",
            Op::Lte { .. } => "Lte",
            Op::Gt { .. } => "Gt",
            Op::Gte { .. } => "Gte",
            Op::Query { .. } => "Query",
            Op::Melt { .. } => "Melt",
            Op::Freeze { .. } => "Freeze",
            Op::VarGet { .. } => "VarGet",
            Op::VarSet { .. } => "VarSet",
            Op::SetField { .. } => "SetField",
            Op::CallSet { .. } => "CallSet",
            Op::ArrayAdd { .. } => "ArrayAdd",
            Op::NewOption { .. } => "NewOption",
            Op::Length { .. } => "Length",
            Op::NewArray { .. } => "NewArray",
            Op::NewMutableArray { .. } => "NewMutableArray",
            Op::NewMutableArrayWithCapacity { .. } => "NewMutableArrayWithCapacity",
            Op::InPlaceMakeImmutable { .. } => "InPlaceMakeImmutable",
            Op::NewMap { .. } => "NewMap",
            Op::MapKey { .. } => "MapKey",
            Op::MapValue { .. } => "MapValue",
            Op::NewObject { .. } => "NewObject",
            Op::LoadField { .. } => "LoadField",
            Op::UnifyField { .. } => "UnifyField",
            Op::NewVar { .. } => "NewVar",
            Op::Move { .. } => "Move",
            Op::Jump { .. } => "Jump",
            Op::JumpIfInitialized { .. } => "JumpIfInitialized",
            Op::Switch { .. } => "Switch",
            Op::Reset { .. } => "Reset",
            Op::Err => "Err",
            Op::Call { .. } => "Call",
            Op::Return { .. } => "Return",
            Op::BeginFailureContext { .. } => "BeginFailureContext",
            Op::EndFailureContext { .. } => "EndFailureContext",
            Op::BeginTask { .. } => "BeginTask",
            Op::EndTask { .. } => "EndTask",
            Op::NewSemaphore { .. } => "NewSemaphore",
            Op::WaitSemaphore { .. } => "WaitSemaphore",
            Op::ResumeUnwind => "ResumeUnwind",
        }
    }

    /// Ops that must observe a concrete incoming effect token and produce a
    /// fresh one.
    pub fn threads_effects(&self) -> bool {
        matches!(
            self,
            Op::Melt { .. }
                | Op::Freeze { .. }
                | Op::VarGet { .. }
                | Op::VarSet { .. }
                | Op::SetField { .. }
                | Op::CallSet { .. }
                | Op::ArrayAdd { .. }
        )
    }

    /// Destination register, if the op defines one.
    pub fn dest(&self) -> Option<Reg> {
        match self {
            Op::Add { dest, .. }
            | Op::Sub { dest, .. }
            | Op::Mul { dest, .. }
            | Op::Div { dest, .. }
            | Op::Mod { dest, .. }
            | Op::Neg { dest, .. }
            | Op::Neq { dest, .. }
            | Op::Lt { dest, .. }
            | Op::Lte { dest, .. }
            | Op::Gt { dest, .. }
            | Op::Gte { dest, .. }
            | Op::Query { dest, .. }
            | Op::Melt { dest, .. }
            | Op::Freeze { dest, .. }
            | Op::VarGet { dest, .. }
            | Op::NewOption { dest, .. }
            | Op::Length { dest, .. }
            | Op::NewArray { dest, .. }
            | Op::NewMutableArray { dest, .. }
            | Op::NewMutableArrayWithCapacity { dest, .. }
            | Op::NewMap { dest, .. }
            | Op::MapKey { dest, .. }
            | Op::MapValue { dest, .. }
            | Op::NewObject { dest, .. }
            | Op::LoadField { dest, .. }
            | Op::NewVar { dest, .. }
            | Op::Move { dest, .. }
            | Op::Reset { dest }
            | Op::Call { dest, .. }
            | Op::BeginTask { dest, .. }
            | Op::NewSemaphore { dest } => Some(*dest),
            _ => None,
        }
    }
}

/// One procedure: ops plus the read-only tables they index into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    pub params: u32,
    pub registers: u32,
    pub ops: Vec<Op>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    #[serde(default)]
    pub operands: Vec<Operand>,
    /// Label index -> op offset.
    #[serde(default)]
    pub labels: Vec<u32>,
    /// Sorted by `begin`.
    #[serde(default)]
    pub unwind_edges: Vec<UnwindEdge>,
}

impl Procedure {
    pub fn label_target(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0 as usize).map(|&pc| pc as usize)
    }

    pub fn operand_slice(&self, range: OperandRange) -> &[Operand] {
        let start = (range.start as usize).min(self.operands.len());
        let end = (range.end() as usize).min(self.operands.len());
        &self.operands[start..end]
    }

    /// Finds the cleanup label for a frame whose next op is `next_pc`.
    ///
    /// An edge covers `next_pc` when `begin < next_pc <= end`, i.e. the op
    /// just executed lies inside `[begin, end)`.
    pub fn unwind_target(&self, next_pc: usize) -> Option<Label> {
        let offset = next_pc as u32;
        for edge in &self.unwind_edges {
            if edge.begin >= offset {
                break;
            }
            if offset <= edge.end {
                return Some(edge.on_unwind);
            }
        }
        None
    }

    /// Human-readable listing, one op per line, with label markers.
    pub fn disassemble(&self) -> String {
        let mut out = format!(
            "proc {} (params: {}, registers: {})\n",
            self.name, self.params, self.registers
        );
        for (i, c) in self.constants.iter().enumerate() {
            out.push_str(&format!("  .const k{} = {:?}\n", i, c));
        }
        for (pc, op) in self.ops.iter().enumerate() {
            for (label, &target) in self.labels.iter().enumerate() {
                if target as usize == pc {
                    out.push_str(&format!("L{}:\n", label));
                }
            }
            out.push_str(&format!("  {:4}  {:?}\n", pc, op));
        }
        for edge in &self.unwind_edges {
            out.push_str(&format!(
                "  .unwind [{}, {}) -> L{}\n",
                edge.begin, edge.end, edge.on_unwind.0
            ));
        }
        out
    }
}

/// A loadable set of procedures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub procedures: Vec<Procedure>,
}

impl Program {
    pub fn new(procedures: Vec<Procedure>) -> Self {
        Self { procedures }
    }

    pub fn find(&self, name: &str) -> Option<&Procedure> {
        self.procedures.iter().find(|p| p.name == name)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
