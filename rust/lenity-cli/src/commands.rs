//! The work behind each subcommand, kept free of process exits and printing
//! so it can be tested.

use lenity_core::{verify_program, Program, VerifyError};
use lenity_vm::{Outcome, Value, Vm, VmConfig, VmError};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("cannot read '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("'{path}' is not a valid program: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("bad argument '{0}': expected a JSON number, string or boolean")]
    Arg(String),
    #[error(transparent)]
    Verify(#[from] VerifyError),
    #[error(transparent)]
    Vm(#[from] VmError),
}

pub fn load_program(path: &Path) -> Result<Program, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Program::from_json(&text).map_err(|source| CliError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Parses a `--arg` value. Bare words that are not JSON are taken as strings.
pub fn parse_arg(text: &str) -> Result<Value, CliError> {
    let json = match serde_json::from_str::<serde_json::Value>(text) {
        Ok(json) => json,
        Err(_) => return Ok(Value::string(text)),
    };
    match json {
        serde_json::Value::Bool(b) => Ok(Value::logic(b)),
        serde_json::Value::String(s) => Ok(Value::string(&s)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(CliError::Arg(text.to_string()))
            }
        }
        _ => Err(CliError::Arg(text.to_string())),
    }
}

/// What a `run` produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Lines printed by the program, in order.
    pub output: Vec<String>,
    /// Rendered return value; `None` when the entry procedure failed.
    pub result: Option<String>,
    /// Whether the result was still unresolved when the run ended.
    pub pending: bool,
    pub parked_tasks: usize,
}

pub fn run(program: Program, entry: &str, args: Vec<Value>, config: VmConfig) -> Result<RunReport, CliError> {
    let mut vm = Vm::with_config(config);
    vm.load(program)?;
    debug!(entry, args = args.len(), "running");
    let outcome = vm.invoke(entry, args)?;
    let (result, pending) = match outcome {
        Outcome::Return(value) => {
            let pending = !vm.is_concrete(&value);
            (Some(vm.render(&value)), pending)
        }
        Outcome::Fail => (None, false),
    };
    Ok(RunReport {
        output: std::mem::take(&mut vm.output),
        result,
        pending,
        parked_tasks: vm.parked_tasks().len(),
    })
}

pub fn disassemble(program: &Program) -> String {
    program
        .procedures
        .iter()
        .map(|p| p.disassemble())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Verifies every procedure and returns how many there are.
pub fn verify(program: &Program) -> Result<usize, CliError> {
    verify_program(program)?;
    Ok(program.procedures.len())
}
