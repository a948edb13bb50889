//! Errors that can cross a lifting operation's boundary.
//!
//! Analysis-incompleteness conditions (a backtrack that cannot be resolved, a dispatch edge
//! that cannot be proven) are deliberately absent: passes log and count those, and carry on.

use crate::ir::Address;
use thiserror::Error;

/// Coarse classification of a [`LiftError`], matching how the failure should be treated by the
/// caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorClass {
    /// The requested operation cannot run with the current setup; no IR is produced.
    Configuration,
    /// The instruction translator and the disassembly disagree; no IR is produced.
    Translation,
    /// Expected in normal operation for inputs that deviate from recognized patterns.
    AnalysisIncomplete,
    /// The function is not in the shape a pass requires; the pass aborts for that function.
    StructuralViolation,
    /// Malformed or unreadable input files.
    Input,
}

#[derive(Debug, Error)]
pub enum LiftError {
    #[error("unsupported processor architecture: {0}")]
    UnsupportedProcessor(String),

    #[error("code generator backend `{library}` does not provide entry point `{entry_point}`")]
    MissingEntryPoint {
        library: String,
        entry_point: &'static str,
    },

    #[error("code generator backend `{0}` could not be loaded")]
    BackendLoad(String),

    #[error("code generator backend is not loaded")]
    BackendNotLoaded,

    #[error("register information for `{0}` is not available")]
    MissingRegister(String),

    #[error("pass `{pass}` requires `{required}` to run first")]
    PassOrdering {
        pass: &'static str,
        required: &'static str,
    },

    #[error("no translation produced for instruction at {addr:#x}")]
    Translation { addr: Address },

    #[error("no function contains address {addr:#x}")]
    NoFunctionAt { addr: Address },

    #[error("basic block index {index} out of range (flow chart has {size} blocks)")]
    IndexError { index: usize, size: usize },

    #[error("dispatch in block `{block}` does not switch on a program counter load")]
    DispatchNotPcLoad { block: String },

    #[error(
        "stack depth {exit_depth} at exit of `{from}` disagrees with entry depth \
         {entry_depth} of `{to}`"
    )]
    StackDepthMismatch {
        from: String,
        to: String,
        exit_depth: i64,
        entry_depth: i64,
    },

    #[error("cannot track stack pointer update in block `{block}` of `{function}`")]
    StackPointerUntrackable { function: String, block: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LiftError {
    pub fn class(&self) -> ErrorClass {
        use LiftError::*;
        match self {
            UnsupportedProcessor(_)
            | MissingEntryPoint { .. }
            | BackendLoad(_)
            | BackendNotLoaded
            | MissingRegister(_)
            | PassOrdering { .. } => ErrorClass::Configuration,
            Translation { .. } => ErrorClass::Translation,
            NoFunctionAt { .. } | IndexError { .. } => ErrorClass::AnalysisIncomplete,
            DispatchNotPcLoad { .. }
            | StackDepthMismatch { .. }
            | StackPointerUntrackable { .. } => ErrorClass::StructuralViolation,
            Parse { .. } | Io(_) => ErrorClass::Input,
        }
    }
}
