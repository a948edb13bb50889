//! The "translate function at address" entry point: a lifting session owning the
//! disassembly, the loaded code generator, the module being built and the lift cache.

use crate::backend::{Backend, BackendRegistry};
use crate::disassembly::Disassembly;
use crate::error::{ErrorClass, LiftError};
use crate::exported::ExportedProgram;
use crate::flow_chart::ControlFlowView;
use crate::function_lifter::{FunctionLifter, LiftCache};
use crate::ir::{Address, FuncId, Module};
use crate::lift_config::CONFIG;
use crate::log::*;
use crate::passes::{
    CallIdentificationPass, CpuStructToRegPass, FixBasicBlockEdgesPass, FunctionPass,
    InlineOpcodeCallsPass, LiftAsmRegistersPass, LiftAsmStackPass, PassContext, PassId,
    PassManager,
};

/// The passes enabled in the global configuration, in their standard order
pub fn default_pipeline() -> Result<PassManager, LiftError> {
    let mut passes: Vec<Box<dyn FunctionPass>> = vec![];
    if CONFIG.enable_opcode_inlining {
        passes.push(Box::new(InlineOpcodeCallsPass::default()));
    }
    if CONFIG.enable_call_identification {
        passes.push(Box::new(CallIdentificationPass::default()));
    }
    if CONFIG.enable_cpu_struct_to_reg {
        passes.push(Box::new(CpuStructToRegPass::default()));
    }
    if CONFIG.enable_basic_block_edge_fixing {
        passes.push(Box::new(FixBasicBlockEdgesPass::default()));
    }
    if CONFIG.enable_stack_lifting {
        passes.push(Box::new(LiftAsmStackPass::default()));
    }
    if CONFIG.enable_register_promotion {
        passes.push(Box::new(LiftAsmRegistersPass::default()));
    }
    PassManager::new(passes)
}

/// Lifts functions of one program, one at a time, into a single module.
pub struct LiftSession {
    disassembly: Box<dyn Disassembly>,
    module: Module,
    backend: Backend,
    cache: LiftCache,
    ctx: PassContext,
    passes: PassManager,
}

impl LiftSession {
    /// Start a session over `disassembly`, loading the code generator for its processor from
    /// `registry`.
    pub fn new(
        name: &str,
        disassembly: Box<dyn Disassembly>,
        registry: &BackendRegistry,
        passes: PassManager,
    ) -> Result<Self, LiftError> {
        let mut module = Module::new(name);
        let info = disassembly.processor();
        let backend = Backend::load(registry, &info.processor, &mut module)?;
        let ctx = PassContext {
            processor: info.processor.clone(),
            pc: backend.pc_register()?,
            sp: backend.sp_register()?,
            lr: backend.register_by_name("lr").ok(),
            pointer_size: (info.address_bits / 8) as usize,
        };
        if passes.pass_ids().contains(&PassId::IdentifyCalls)
            && !CallIdentificationPass::supports(&ctx.processor)
        {
            error!(
                "Pipeline identifies calls, which the processor does not support";
                "processor" => ctx.processor.name(),
            );
            return Err(LiftError::UnsupportedProcessor(
                ctx.processor.name().to_string(),
            ));
        }
        debug!(
            "Started lifting session";
            "module" => name,
            "processor" => ctx.processor.name(),
            "pc" => &ctx.pc.name,
            "sp" => &ctx.sp.name,
            OptionalKV("lr", ctx.lr.as_ref().map(|r| r.name.clone())),
        );
        Ok(Self {
            disassembly,
            module,
            backend,
            cache: LiftCache::new(),
            ctx,
            passes,
        })
    }

    /// Start a session over an exported program, with the configured pipeline
    pub fn from_exported(program: ExportedProgram) -> Result<Self, LiftError> {
        Self::from_exported_with(program, default_pipeline()?)
    }

    pub fn from_exported_with(
        program: ExportedProgram,
        passes: PassManager,
    ) -> Result<Self, LiftError> {
        let registry = program.registry();
        Self::new(
            &program.name,
            Box::new(program.disassembly),
            &registry,
            passes,
        )
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn context(&self) -> &PassContext {
        &self.ctx
    }

    pub fn disassembly(&self) -> &dyn Disassembly {
        self.disassembly.as_ref()
    }

    pub fn cache(&self) -> &LiftCache {
        &self.cache
    }

    /// Generate the initial IR of the function containing `addr`, without running any pass.
    /// The result is cached like a fully lifted function, so a later [`Self::lift`] of the same
    /// function returns it as is.
    pub fn lift_only(&mut self, addr: Address) -> Result<FuncId, LiftError> {
        let view = ControlFlowView::for_function(self.disassembly.as_ref(), addr)?;
        let mut lifter = FunctionLifter {
            module: &mut self.module,
            backend: &mut self.backend,
            cache: &mut self.cache,
            pc: &self.ctx.pc,
        };
        lifter.lift(&view)
    }

    /// Lift the function containing `addr` and run the pipeline over it. Functions lifted
    /// earlier in the session are returned from the cache without running the pipeline again.
    ///
    /// A pass that aborts on the function's shape leaves it as the passes before it made it;
    /// the function is still returned. Configuration errors are returned instead.
    pub fn lift(&mut self, addr: Address) -> Result<FuncId, LiftError> {
        let entry = self
            .disassembly
            .function_containing(addr)
            .map(|f| f.start)
            .ok_or(LiftError::NoFunctionAt { addr })?;
        if let Some(f) = self.cache.get(entry) {
            debug!("Function already lifted"; "addr" => Hex(addr));
            return Ok(f);
        }
        let f = self.lift_only(addr)?;
        if let Err(e) = self.passes.run(&mut self.module, f, &self.ctx) {
            if e.class() == ErrorClass::Configuration {
                return Err(e);
            }
            warn!(
                "Returning partially rewritten function";
                "function" => &self.module.function(f).name,
                "error" => %e,
            );
        }
        Ok(f)
    }

    /// Lift the function containing `addr`, reporting any failure through the log instead of
    /// returning it.
    pub fn translate_function(&mut self, addr: Address) -> Option<FuncId> {
        match self.lift(addr) {
            Ok(f) => {
                info!(
                    "Translated function";
                    "addr" => Hex(addr),
                    "function" => &self.module.function(f).name,
                );
                Some(f)
            }
            Err(e) => {
                error!(
                    "Could not translate function";
                    "addr" => Hex(addr),
                    "error" => %e,
                    "class" => ?e.class(),
                );
                None
            }
        }
    }

    /// Lift the functions containing each of `starts`, skipping any that fail
    pub fn translate_all(&mut self, starts: &[Address]) -> Vec<FuncId> {
        starts
            .iter()
            .filter_map(|&a| self.translate_function(a))
            .collect()
    }

    /// Unload the code generator. Further translation fails with
    /// [`LiftError::BackendNotLoaded`].
    pub fn close(&mut self) {
        self.backend.unload();
    }
}
