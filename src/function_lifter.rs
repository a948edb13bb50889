//! Generation of the initial IR for a machine-code function: one IR block per basic block,
//! holding a call to each instruction's translation and ending in a program counter dispatch.

use crate::backend::{Backend, CodeFlags, RegisterInfo};
use crate::containers::unordered::UnorderedMap;
use crate::containers::InsertionOrderedSet;
use crate::disassembly::Processor;
use crate::error::LiftError;
use crate::flow_chart::ControlFlowView;
use crate::ir::{
    Address, BlockId, Callee, FuncId, Function, Module, Op, Tags, Terminator, Type, Value,
};
use crate::log::*;

/// Prefix of the names of lifted functions
pub const LIFTED_FUNCTION_PREFIX: &str = "asmlift";

/// Remembers which function each entry address was lifted to. Entries are never invalidated;
/// the machine code is assumed not to change during a session.
#[derive(Default, Debug)]
pub struct LiftCache {
    functions: UnorderedMap<Address, FuncId>,
}

impl LiftCache {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, entry: Address) -> Option<FuncId> {
        self.functions.get(&entry).copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    fn insert(&mut self, entry: Address, f: FuncId) {
        let prev = self.functions.insert(entry, f);
        assert!(prev.is_none(), "Lifted {:#x} twice", entry);
    }
}

/// Deterministic name of the function lifted from `entry`
pub fn lifted_function_name(name: &str, entry: Address) -> String {
    format!("{}_{}_0x{:x}", LIFTED_FUNCTION_PREFIX, name, entry)
}

/// A basic block of the view paired with the IR block being built for it
#[derive(Debug)]
struct TranslateBlock {
    ir_block: BlockId,
    completed: bool,
    preds: InsertionOrderedSet<usize>,
    succs: InsertionOrderedSet<usize>,
}

/// Lifts functions of a control-flow view into IR, one call per machine instruction.
pub struct FunctionLifter<'s> {
    pub module: &'s mut Module,
    pub backend: &'s mut Backend,
    pub cache: &'s mut LiftCache,
    /// The program counter, whose field every dispatch reads
    pub pc: &'s RegisterInfo,
}

impl<'s> FunctionLifter<'s> {
    /// Produce the IR function for the function `view` covers, or the cached one if it was
    /// lifted before.
    pub fn lift(&mut self, view: &ControlFlowView) -> Result<FuncId, LiftError> {
        let entry = view.start();
        if let Some(f) = self.cache.get(entry) {
            debug!("Reusing lifted function"; "entry" => Hex(entry));
            return Ok(f);
        }
        let name = lifted_function_name(view.name(), entry);
        if let Some(f) = self.module.lookup(&name) {
            self.cache.insert(entry, f);
            return Ok(f);
        }

        let disasm = view.disassembly();
        let processor = disasm.processor().processor;
        if processor != Processor::Arm {
            warn!(
                "No instruction mode information for processor; using default flags";
                "processor" => processor.name(),
            );
        }

        let mut f = Function::new(name, vec![Type::Ptr], Type::Void);
        let env = Value::Arg(0);
        let mut blocks: UnorderedMap<usize, TranslateBlock> = Default::default();
        let entry_view = view.entry_block()?;
        blocks.insert(
            0,
            TranslateBlock {
                ir_block: f.add_block(format!("bb_{:x}", entry_view.start())),
                completed: false,
                preds: InsertionOrderedSet::new(),
                succs: InsertionOrderedSet::new(),
            },
        );
        let unknown_target = f.add_block("unknown_jump_target");
        f.set_terminator(unknown_target, Terminator::Ret(None));

        let mut worklist = vec![0usize];
        while let Some(index) = worklist.pop() {
            if blocks.get(&index).map_or(false, |tb| tb.completed) {
                continue;
            }
            let bb = view.block(index)?;
            let ir_block = blocks
                .get(&index)
                .map(|tb| tb.ir_block)
                .ok_or(LiftError::IndexError {
                    index,
                    size: view.size(),
                })?;
            trace!("Translating block"; "start" => Hex(bb.start()), "end" => Hex(bb.end()));

            for insn in bb.instructions() {
                let flags = CodeFlags {
                    thumb: processor == Processor::Arm && disasm.is_thumb(insn.address),
                };
                let opcode = self
                    .backend
                    .gen_intermediate_code(self.module, insn.address, flags, true)?
                    .ok_or_else(|| {
                        crit!("Instruction translation failed"; "addr" => Hex(insn.address));
                        LiftError::Translation { addr: insn.address }
                    })?;
                let call = f.append(
                    ir_block,
                    Op::Call {
                        callee: Callee::Direct(opcode),
                        args: vec![env],
                        ret: Type::Void,
                    },
                );
                f.set_tags(
                    call,
                    Tags {
                        source_address: Some(insn.address),
                        ..Default::default()
                    },
                );
            }

            let pc_ptr = f.append(
                ir_block,
                Op::CpuFieldPtr {
                    base: env,
                    path: self.pc.path.clone(),
                },
            );
            let pc = f.append(
                ir_block,
                Op::Load {
                    ty: Type::Int(self.pc.bits),
                    ptr: Value::Inst(pc_ptr),
                },
            );
            f.set_tags(
                pc,
                Tags {
                    env_offset: Some(self.pc.offset),
                    register: Some(self.pc.name.clone()),
                    ..Default::default()
                },
            );

            let mut cases = vec![];
            for succ in bb.successors() {
                let si = succ.index();
                let target = match blocks.get(&si) {
                    Some(tb) => tb.ir_block,
                    None => {
                        let ir = f.add_block(format!("bb_{:x}", succ.start()));
                        blocks.insert(
                            si,
                            TranslateBlock {
                                ir_block: ir,
                                completed: false,
                                preds: InsertionOrderedSet::new(),
                                succs: InsertionOrderedSet::new(),
                            },
                        );
                        worklist.push(si);
                        ir
                    }
                };
                if let Some(tb) = blocks.get_mut(&si) {
                    tb.preds.insert(index);
                }
                if let Some(tb) = blocks.get_mut(&index) {
                    if !tb.succs.contains(&si) {
                        tb.succs.insert(si);
                        cases.push((succ.start(), target));
                    }
                }
            }
            f.set_terminator(
                ir_block,
                Terminator::Switch {
                    value: Value::Inst(pc),
                    default: unknown_target,
                    cases,
                },
            );
            if let Some(tb) = blocks.get_mut(&index) {
                tb.completed = true;
            }
        }

        for (index, tb) in &blocks {
            trace!(
                "Block links";
                "block" => index,
                "preds" => ?tb.preds.iter().collect::<Vec<_>>(),
                "succs" => ?tb.succs.iter().collect::<Vec<_>>(),
            );
        }
        debug!(
            "Lifted function";
            "name" => &f.name,
            "entry" => Hex(entry),
            "blocks" => blocks.len(),
            "instructions" => f.inst_count(),
        );
        if let Err(e) = f.verify() {
            error!("Lifted function failed verification"; "name" => &f.name, "error" => e);
        }
        let id = self.module.add_function(f);
        self.cache.insert(entry, id);
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::{diamond_session, DIAMOND_ENTRY};

    #[test]
    fn every_instruction_gets_a_tagged_call() {
        let mut s = diamond_session();
        let f = s.lift_only(DIAMOND_ENTRY).unwrap();
        let func = s.module().function(f);
        assert_eq!(func.name, "asmlift_diamond_0x1000");
        let tagged: Vec<Address> = func
            .blocks()
            .iter()
            .flat_map(|&b| func.block_insts(b).iter())
            .filter_map(|&i| func.source_address(i))
            .collect();
        assert_eq!(tagged.len(), 7);
        assert!(tagged.contains(&0x1000) && tagged.contains(&0x1030));
    }

    #[test]
    fn unknown_target_sink_returns() {
        let mut s = diamond_session();
        let f = s.lift_only(DIAMOND_ENTRY).unwrap();
        let func = s.module().function(f);
        let sink = func.blocks()[1];
        assert_eq!(func.block_name(sink), "unknown_jump_target");
        assert!(func.block_insts(sink).is_empty());
        assert_eq!(func.terminator(sink), Some(&Terminator::Ret(None)));
        assert_eq!(func.verify(), Ok(()));
    }
}
