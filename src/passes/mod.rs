//! Rewrite passes over lifted functions, and the manager that sequences them.

pub mod cpu_struct_to_reg;
pub mod fix_basic_block_edges;
pub mod identify_calls;
pub mod inline_opcode_calls;
pub mod lift_asm_registers;
pub mod lift_asm_stack;

pub use cpu_struct_to_reg::CpuStructToRegPass;
pub use fix_basic_block_edges::FixBasicBlockEdgesPass;
pub use identify_calls::CallIdentificationPass;
pub use inline_opcode_calls::InlineOpcodeCallsPass;
pub use lift_asm_registers::LiftAsmRegistersPass;
pub use lift_asm_stack::LiftAsmStackPass;

use crate::backend::RegisterInfo;
use crate::disassembly::Processor;
use crate::error::LiftError;
use crate::ir::{FuncId, Function, InstId, Module, Op, Value};
use crate::lift_config::CONFIG;
use crate::log::*;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum PassId {
    InlineOpcodeCalls,
    IdentifyCalls,
    CpuStructToReg,
    FixBasicBlockEdges,
    LiftAsmStack,
    LiftAsmRegisters,
}

impl PassId {
    pub fn name(&self) -> &'static str {
        match self {
            PassId::InlineOpcodeCalls => "InlineOpcodeCalls",
            PassId::IdentifyCalls => "IdentifyCalls",
            PassId::CpuStructToReg => "CpuStructToReg",
            PassId::FixBasicBlockEdges => "FixBasicBlockEdges",
            PassId::LiftAsmStack => "LiftAsmStack",
            PassId::LiftAsmRegisters => "LiftAsmRegisters",
        }
    }
}

/// Per-session facts the passes need about the target
#[derive(Clone, Debug)]
pub struct PassContext {
    pub processor: Processor,
    pub pc: RegisterInfo,
    pub sp: RegisterInfo,
    /// Link register, on architectures that have one
    pub lr: Option<RegisterInfo>,
    /// Size of a pointer of the target, in bytes
    pub pointer_size: usize,
}

pub trait FunctionPass {
    fn id(&self) -> PassId;
    /// Passes that must have run on the function before this one
    fn requires(&self) -> &'static [PassId] {
        &[]
    }
    /// Whether the pass leaves the block graph untouched
    fn preserves_cfg(&self) -> bool {
        true
    }
    /// Run on `func`, returning whether anything changed. An `Err` means the function was not
    /// in the shape this pass needs; rewrites already made by earlier passes are kept.
    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        ctx: &PassContext,
    ) -> Result<bool, LiftError>;
}

/// An ordered sequence of passes, run to completion on one function at a time.
pub struct PassManager {
    passes: Vec<Box<dyn FunctionPass>>,
}

impl PassManager {
    /// Sequence `passes`, checking every pass comes after the passes it requires
    pub fn new(passes: Vec<Box<dyn FunctionPass>>) -> Result<Self, LiftError> {
        for (i, p) in passes.iter().enumerate() {
            for req in p.requires() {
                if !passes[..i].iter().any(|e| e.id() == *req) {
                    error!(
                        "Pass scheduled before one it requires";
                        "pass" => p.id().name(),
                        "required" => req.name(),
                    );
                    return Err(LiftError::PassOrdering {
                        pass: p.id().name(),
                        required: req.name(),
                    });
                }
            }
        }
        Ok(Self { passes })
    }

    pub fn pass_ids(&self) -> Vec<PassId> {
        self.passes.iter().map(|p| p.id()).collect()
    }

    /// Run every pass on `func`, stopping at the first pass that fails.
    pub fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        ctx: &PassContext,
    ) -> Result<bool, LiftError> {
        let mut changed = false;
        for pass in self.passes.iter_mut() {
            let name = pass.id().name();
            debug!("Running pass"; "pass" => name, "function" => &module.function(func).name);
            match pass.run(module, func, ctx) {
                Ok(c) => changed |= c,
                Err(e) => {
                    error!(
                        "Pass aborted on function";
                        "pass" => name,
                        "function" => &module.function(func).name,
                        "error" => %e,
                    );
                    return Err(e);
                }
            }
            if CONFIG.verify_after_each_pass {
                if let Err(e) = module.function(func).verify() {
                    error!("Verification failed after pass"; "pass" => name, "error" => e);
                }
            }
            if CONFIG.debug_dump_ir_after_each_pass {
                trace!("IR after pass"; "pass" => name, "ir" => ?module.debug_function(func));
            }
        }
        Ok(changed)
    }
}

/// The stored value of a store instruction
pub(crate) fn stored_value(f: &Function, i: InstId) -> Option<Value> {
    match f.op(i) {
        Op::Store { value, .. } => Some(*value),
        _ => None,
    }
}

/// Erase the load or store `i`, along with the field address computation feeding it once
/// nothing else uses that address.
pub(crate) fn erase_with_dead_address(f: &mut Function, i: InstId) {
    let ptr = match f.op(i) {
        Op::Load { ptr, .. } | Op::Store { ptr, .. } => ptr.as_inst(),
        _ => None,
    };
    f.erase(i);
    if let Some(p) = ptr {
        if f.is_live(p)
            && matches!(f.op(p), Op::CpuFieldPtr { .. } | Op::FrameFieldPtr { .. })
            && f.uses_of(p).is_empty()
        {
            f.erase(p);
        }
    }
}
