//! Lenity Core
//!
//! Bytecode definitions shared by the interpreter and the command-line tools:
//! procedures, ops, operand tables, labels and unwind edges, plus a verifier
//! and a builder for assembling procedures by hand.

pub mod builder;
pub mod bytecode;
pub mod verify;

pub use builder::ProcedureBuilder;
pub use bytecode::*;
pub use verify::{verify_procedure, verify_program, VerifyError};
