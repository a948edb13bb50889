//! A global store of flags that select which rewrites the lifting pipeline performs.
//!
//! WARNING: Only a single configuration per process is supported; sessions cannot run with
//! different pipelines side by side.

/// The global configuration store. Its fields are expected to be accessed across the crate via
/// the global [`CONFIG`](static@CONFIG).
pub struct LiftConfig {
    /// Splice the body of each per-instruction function into its call site. Every later pass
    /// needs the CPU-state accesses to be visible in the lifted function, so disabling this
    /// effectively disables them too.
    pub enable_opcode_inlining: bool,
    /// Turn program counter stores that are followed by a matching link register value into
    /// explicit calls.
    pub enable_call_identification: bool,
    /// Remove redundant loads and stores of CPU-state fields within a basic block.
    pub enable_cpu_struct_to_reg: bool,
    /// Replace program counter dispatches with direct branches where the target is provable.
    pub enable_basic_block_edge_fixing: bool,
    /// Rewrite stack-relative memory helper calls into accesses of a synthesized frame.
    pub enable_stack_lifting: bool,
    /// Promote CPU-state fields to function-local slots, writing them back at calls, barriers,
    /// dispatches and returns.
    pub enable_register_promotion: bool,
    /// Run the IR verifier after every pass, logging any failure.
    pub verify_after_each_pass: bool,
    /// Dump the function's IR to the trace log after every pass.
    pub debug_dump_ir_after_each_pass: bool,
}

impl LiftConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineLiftConfig>) {
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(command_line_config.into())) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<LiftConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: LiftConfig = LiftConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Lifting configuration parameters
pub enum CommandLineLiftConfig {
    DisableOpcodeInlining,
    DisableCallIdentification,
    DisableCpuStructToReg,
    DisableBasicBlockEdgeFixing,
    DisableStackLifting,
    EnableRegisterPromotion,
    EnableVerifyAfterEachPass,
    EnableDebugDumpIrAfterEachPass,
}

impl Default for LiftConfig {
    fn default() -> Self {
        LiftConfig {
            enable_opcode_inlining: true,
            enable_call_identification: true,
            enable_cpu_struct_to_reg: true,
            enable_basic_block_edge_fixing: true,
            enable_stack_lifting: true,
            enable_register_promotion: false,
            verify_after_each_pass: false,
            debug_dump_ir_after_each_pass: false,
        }
    }
}

impl From<Vec<CommandLineLiftConfig>> for LiftConfig {
    fn from(v: Vec<CommandLineLiftConfig>) -> Self {
        use CommandLineLiftConfig::*;
        let mut r = LiftConfig::default();
        for v in v {
            match v {
                DisableOpcodeInlining => {
                    r.enable_opcode_inlining = false;
                }
                DisableCallIdentification => {
                    r.enable_call_identification = false;
                }
                DisableCpuStructToReg => {
                    r.enable_cpu_struct_to_reg = false;
                }
                DisableBasicBlockEdgeFixing => {
                    r.enable_basic_block_edge_fixing = false;
                }
                DisableStackLifting => {
                    r.enable_stack_lifting = false;
                }
                EnableRegisterPromotion => {
                    r.enable_register_promotion = true;
                }
                EnableVerifyAfterEachPass => {
                    r.verify_after_each_pass = true;
                }
                EnableDebugDumpIrAfterEachPass => {
                    r.debug_dump_ir_after_each_pass = true;
                }
            }
        }
        r
    }
}
