//! The instruction-translator ("code generator") boundary.
//!
//! A code generator produces, for one machine instruction, an IR function implementing its
//! exact semantics against the CPU-state structure. Generators are provided per target
//! architecture, under a per-architecture library name, through a [`BackendRegistry`]. A
//! [`Backend`] validates that the generator offers every required entry point before it is
//! considered loaded.

use crate::containers::unordered::UnorderedMap;
use crate::disassembly::Processor;
use crate::error::LiftError;
use crate::ir::{Address, FuncId, Module};
use crate::log::*;

/// Name of the helper that loads from guest memory: `(env, addr, size_shift, mmu_index)`
pub const MEMORY_LOAD_HELPER: &str = "helper_mem_ld";
/// Name of the helper that stores to guest memory: `(env, addr, size_shift, mmu_index, value)`
pub const MEMORY_STORE_HELPER: &str = "helper_mem_st";

/// Entry points a code generator must provide for the lifter to use it.
pub const REQUIRED_ENTRY_POINTS: &[&str] = &[
    "codegen_init",
    "codegen_gen_intermediate_code",
    "codegen_set_error_handler",
    "codegen_get_module",
    "codegen_get_target_name",
    "codegen_get_register_info_by_name",
    "codegen_get_register_info_by_offset",
    "codegen_get_register_info_pc",
    "codegen_get_register_info_sp",
];

/// Describes one register of the CPU-state structure.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RegisterInfo {
    pub name: String,
    /// Byte offset within the CPU-state structure
    pub offset: u64,
    pub bits: u32,
    /// Index path locating the field within the CPU-state structure
    pub path: Vec<u32>,
}

/// Per-instruction decoding flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug)]
pub struct CodeFlags {
    /// Decode as a thumb-mode instruction (ARM only)
    pub thumb: bool,
}

pub type ErrorHandler = Box<dyn Fn(&str)>;

pub trait CodeGenerator {
    /// Names of the entry points this generator provides
    fn entry_points(&self) -> Vec<&'static str>;
    /// Declare whatever the generator's output refers to (e.g. memory helpers) in `module`
    fn init(&mut self, module: &mut Module) -> Result<(), LiftError>;
    /// Translate the instruction at `addr` into a function of `module` taking the CPU-state
    /// pointer as its only argument. `None` if no translation could be produced.
    fn gen_intermediate_code(
        &mut self,
        module: &mut Module,
        addr: Address,
        flags: CodeFlags,
        single_instruction: bool,
    ) -> Option<FuncId>;
    fn set_error_handler(&mut self, handler: ErrorHandler);
    fn target_name(&self) -> String;
    fn register_by_name(&self, name: &str) -> Option<RegisterInfo>;
    fn register_by_offset(&self, offset: u64) -> Option<RegisterInfo>;
    fn pc_register(&self) -> Option<RegisterInfo>;
    fn sp_register(&self) -> Option<RegisterInfo>;
}

/// Name under which the code generator for `processor` is provided
pub fn library_name(processor: &Processor) -> Result<String, LiftError> {
    match processor {
        Processor::Unknown(name) => Err(LiftError::UnsupportedProcessor(name.clone())),
        p => Ok(format!("libcodegen-{}.so", p.name())),
    }
}

type Constructor = Box<dyn Fn() -> Box<dyn CodeGenerator>>;

/// Maps library names to code generator constructors.
#[derive(Default)]
pub struct BackendRegistry {
    constructors: UnorderedMap<String, Constructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register(
        &mut self,
        library: impl Into<String>,
        constructor: impl Fn() -> Box<dyn CodeGenerator> + 'static,
    ) {
        self.constructors
            .insert(library.into(), Box::new(constructor));
    }

    fn instantiate(&self, library: &str) -> Option<Box<dyn CodeGenerator>> {
        self.constructors.get(library).map(|c| c())
    }
}

/// A loaded code generator. Translation is only possible between a successful
/// [`Backend::load`] and [`Backend::unload`].
pub struct Backend {
    library: String,
    generator: Option<Box<dyn CodeGenerator>>,
}

impl Backend {
    /// Load the code generator for `processor`, check it provides every required entry point
    /// and initialize it against `module`.
    pub fn load(
        registry: &BackendRegistry,
        processor: &Processor,
        module: &mut Module,
    ) -> Result<Self, LiftError> {
        let library = library_name(processor).map_err(|e| {
            error!("Unsupported processor"; "processor" => processor.name());
            e
        })?;
        let mut generator = registry.instantiate(&library).ok_or_else(|| {
            error!("Could not load code generator"; "library" => &library);
            LiftError::BackendLoad(library.clone())
        })?;
        let provided = generator.entry_points();
        if let Some(missing) = REQUIRED_ENTRY_POINTS
            .iter()
            .copied()
            .find(|e| !provided.contains(e))
        {
            error!(
                "Code generator is missing an entry point; unloading";
                "library" => &library,
                "entry_point" => missing,
            );
            return Err(LiftError::MissingEntryPoint {
                library,
                entry_point: missing,
            });
        }
        generator.set_error_handler(Box::new(|msg: &str| {
            error!("Code generator error"; "message" => msg);
        }));
        generator.init(module)?;
        info!(
            "Loaded code generator";
            "library" => &library,
            "target" => generator.target_name(),
        );
        Ok(Self {
            library,
            generator: Some(generator),
        })
    }

    pub fn unload(&mut self) {
        if self.generator.take().is_some() {
            info!("Unloaded code generator"; "library" => &self.library);
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.generator.is_some()
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    fn generator(&self) -> Result<&dyn CodeGenerator, LiftError> {
        self.generator.as_deref().ok_or(LiftError::BackendNotLoaded)
    }

    pub fn gen_intermediate_code(
        &mut self,
        module: &mut Module,
        addr: Address,
        flags: CodeFlags,
        single_instruction: bool,
    ) -> Result<Option<FuncId>, LiftError> {
        let generator = self
            .generator
            .as_deref_mut()
            .ok_or(LiftError::BackendNotLoaded)?;
        Ok(generator.gen_intermediate_code(module, addr, flags, single_instruction))
    }

    pub fn target_name(&self) -> Result<String, LiftError> {
        Ok(self.generator()?.target_name())
    }

    pub fn register_by_name(&self, name: &str) -> Result<RegisterInfo, LiftError> {
        self.generator()?
            .register_by_name(name)
            .ok_or_else(|| LiftError::MissingRegister(name.to_string()))
    }

    pub fn register_by_offset(&self, offset: u64) -> Result<RegisterInfo, LiftError> {
        self.generator()?
            .register_by_offset(offset)
            .ok_or_else(|| LiftError::MissingRegister(format!("offset {:#x}", offset)))
    }

    pub fn pc_register(&self) -> Result<RegisterInfo, LiftError> {
        self.generator()?
            .pc_register()
            .ok_or_else(|| LiftError::MissingRegister("pc".to_string()))
    }

    pub fn sp_register(&self) -> Result<RegisterInfo, LiftError> {
        self.generator()?
            .sp_register()
            .ok_or_else(|| LiftError::MissingRegister("sp".to_string()))
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.unload();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::diamond_generator;

    struct Partial;

    impl CodeGenerator for Partial {
        fn entry_points(&self) -> Vec<&'static str> {
            vec!["codegen_init", "codegen_gen_intermediate_code"]
        }
        fn init(&mut self, _module: &mut Module) -> Result<(), LiftError> {
            panic!("A generator with missing entry points must not be initialized")
        }
        fn gen_intermediate_code(
            &mut self,
            _module: &mut Module,
            _addr: Address,
            _flags: CodeFlags,
            _single_instruction: bool,
        ) -> Option<FuncId> {
            None
        }
        fn set_error_handler(&mut self, _handler: ErrorHandler) {}
        fn target_name(&self) -> String {
            "partial".into()
        }
        fn register_by_name(&self, _name: &str) -> Option<RegisterInfo> {
            None
        }
        fn register_by_offset(&self, _offset: u64) -> Option<RegisterInfo> {
            None
        }
        fn pc_register(&self) -> Option<RegisterInfo> {
            None
        }
        fn sp_register(&self) -> Option<RegisterInfo> {
            None
        }
    }

    #[test]
    fn library_names_follow_processor() {
        assert_eq!(library_name(&Processor::Arm).unwrap(), "libcodegen-arm.so");
        assert_eq!(
            library_name(&Processor::X86_64).unwrap(),
            "libcodegen-x86_64.so"
        );
        assert!(matches!(
            library_name(&Processor::Unknown("mips".into())),
            Err(LiftError::UnsupportedProcessor(_))
        ));
    }

    #[test]
    fn missing_entry_point_fails_load() {
        let mut registry = BackendRegistry::new();
        registry.register("libcodegen-arm.so", || Box::new(Partial) as Box<dyn CodeGenerator>);
        let mut module = Module::new("m");
        let r = Backend::load(&registry, &Processor::Arm, &mut module);
        assert!(matches!(
            r,
            Err(LiftError::MissingEntryPoint {
                entry_point: "codegen_set_error_handler",
                ..
            })
        ));
    }

    #[test]
    fn unregistered_library_fails_load() {
        let registry = BackendRegistry::new();
        let mut module = Module::new("m");
        assert!(matches!(
            Backend::load(&registry, &Processor::I386, &mut module),
            Err(LiftError::BackendLoad(_))
        ));
    }

    #[test]
    fn translation_after_unload_is_rejected() {
        let generator = diamond_generator();
        let mut registry = BackendRegistry::new();
        registry.register("libcodegen-arm.so", move || {
            Box::new(generator.clone()) as Box<dyn CodeGenerator>
        });
        let mut module = Module::new("m");
        let mut backend = Backend::load(&registry, &Processor::Arm, &mut module).unwrap();
        assert!(backend.is_loaded());
        assert_eq!(backend.pc_register().unwrap().name, "pc");
        backend.unload();
        assert!(matches!(
            backend.gen_intermediate_code(&mut module, 0x1000, CodeFlags::default(), true),
            Err(LiftError::BackendNotLoaded)
        ));
        assert!(matches!(
            backend.sp_register(),
            Err(LiftError::BackendNotLoaded)
        ));
    }
}
