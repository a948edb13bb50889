//! Recognizes subroutine calls of the lifted program.
//!
//! Within a block, consecutive instructions leave the program counter pointing at the next
//! instruction. When an instruction boundary is reached while the last program counter store
//! named some other address, control flow left the straight line there. If the link register
//! at that point holds exactly the boundary's address, the discontinuity is a call that
//! returns here, and it is rewritten into an explicit call through the stored target.

use super::{erase_with_dead_address, stored_value, FunctionPass, PassContext, PassId};
use crate::disassembly::Processor;
use crate::error::LiftError;
use crate::ir::{
    Address, BlockId, Callee, CastOp, FuncId, Function, InstId, Module, Op, Tags, Type, Value,
};
use crate::log::*;

#[derive(Default)]
pub struct CallIdentificationPass {
    /// Calls synthesized
    pub calls: usize,
    /// Discontinuities that could not be shown to be calls
    pub barriers: usize,
}

/// A store to a tracked register, and its value if that is a constant
#[derive(Clone, Copy, Debug)]
struct TrackedStore {
    store: InstId,
    value: Option<u64>,
}

impl FunctionPass for CallIdentificationPass {
    fn id(&self) -> PassId {
        PassId::IdentifyCalls
    }

    fn requires(&self) -> &'static [PassId] {
        &[PassId::InlineOpcodeCalls]
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        ctx: &PassContext,
    ) -> Result<bool, LiftError> {
        if !Self::supports(&ctx.processor) {
            error!("Call identification is not available"; "processor" => ctx.processor.name());
            return Err(LiftError::UnsupportedProcessor(
                ctx.processor.name().to_string(),
            ));
        }
        let lr = ctx
            .lr
            .as_ref()
            .ok_or_else(|| LiftError::MissingRegister("lr".to_string()))?;
        let f = module.function_mut(func);
        let mut changed = false;
        for b in f.blocks().to_vec() {
            changed |= self.run_on_block_arm(f, b, ctx.pc.offset, lr.offset);
        }
        debug!(
            "Identified calls";
            "function" => &f.name,
            "calls" => self.calls,
            "barriers" => self.barriers,
        );
        Ok(changed)
    }
}

impl CallIdentificationPass {
    /// Whether calls can be recognized on `processor`
    pub fn supports(processor: &Processor) -> bool {
        matches!(processor, Processor::Arm)
    }

    fn run_on_block_arm(&mut self, f: &mut Function, b: BlockId, pc: u64, lr: u64) -> bool {
        let mut pending_pc: Option<TrackedStore> = None;
        let mut last_lr: Option<TrackedStore> = None;
        let mut erase = vec![];
        let mut changed = false;

        for i in f.block_insts(b).to_vec() {
            match f.op(i) {
                Op::OpcodeStart => {
                    let addr: Address = match f.source_address(i) {
                        Some(a) => a,
                        None => continue,
                    };
                    let pc_store = match pending_pc.take() {
                        Some(s) if s.value != Some(addr) => s,
                        _ => continue,
                    };
                    match last_lr {
                        Some(lr_store) if lr_store.value == Some(addr) => {
                            let target = stored_value(f, pc_store.store)
                                .expect("Tracked program counter write is a store");
                            let fptr = f.insert_before(
                                pc_store.store,
                                Op::Cast {
                                    op: CastOp::IntToPtr,
                                    value: target,
                                    to: Type::Ptr,
                                },
                            );
                            let call = f.insert_before(
                                pc_store.store,
                                Op::Call {
                                    callee: Callee::Indirect(Value::Inst(fptr)),
                                    args: vec![Value::Arg(0)],
                                    ret: Type::Void,
                                },
                            );
                            f.set_tags(
                                call,
                                Tags {
                                    asm_call: true,
                                    ..Default::default()
                                },
                            );
                            debug!(
                                "Found call";
                                "target" => ?target,
                                "return_addr" => Hex(addr),
                            );
                            erase.push(pc_store.store);
                            erase.push(lr_store.store);
                            last_lr = None;
                            self.calls += 1;
                        }
                        _ => {
                            warn!(
                                "Found indirect jump: does not have return address in LR";
                                "before" => Hex(addr),
                            );
                            f.tags_mut(pc_store.store).propagation_barrier = true;
                            self.barriers += 1;
                        }
                    }
                    changed = true;
                }
                Op::Store { value, .. } => {
                    let tracked = TrackedStore {
                        store: i,
                        value: value.as_const(),
                    };
                    if f.env_offset(i) == Some(pc) {
                        pending_pc = Some(tracked);
                    } else if f.env_offset(i) == Some(lr) {
                        last_lr = Some(tracked);
                    }
                }
                Op::Call { .. } if f.is_asm_call(i) => {
                    pending_pc = None;
                    last_lr = None;
                }
                _ => {}
            }
        }

        for s in erase {
            erase_with_dead_address(f, s);
        }
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::{arm_context, call_block_fixture};

    fn count_asm_calls(f: &Function) -> usize {
        f.blocks()
            .iter()
            .flat_map(|&b| f.block_insts(b).iter())
            .filter(|&&i| f.is_asm_call(i))
            .count()
    }

    #[test]
    fn return_address_in_lr_makes_a_call() {
        let ctx = arm_context();
        let (mut m, func, pc_store, lr_store) = call_block_fixture(0x1800, 0x1004, 0x1004);
        let before = m.function(func).inst_count();
        let mut pass = CallIdentificationPass::default();
        assert!(pass.run(&mut m, func, &ctx).unwrap());
        let f = m.function(func);
        assert_eq!(count_asm_calls(f), 1);
        assert_eq!(pass.calls, 1);
        assert!(!f.is_live(pc_store));
        assert!(!f.is_live(lr_store));
        // cast + call added, two stores and their field addresses removed
        assert_eq!(f.inst_count(), before + 2 - 4);
        assert_eq!(f.verify(), Ok(()));
    }

    #[test]
    fn mismatched_lr_makes_a_barrier() {
        let ctx = arm_context();
        let (mut m, func, pc_store, lr_store) = call_block_fixture(0x1800, 0x1008, 0x1004);
        let before = m.function(func).inst_count();
        let mut pass = CallIdentificationPass::default();
        pass.run(&mut m, func, &ctx).unwrap();
        let f = m.function(func);
        assert_eq!(count_asm_calls(f), 0);
        assert_eq!(f.inst_count(), before);
        assert!(f.is_propagation_barrier(pc_store));
        assert!(f.is_live(lr_store));
        assert_eq!(pass.barriers, 1);
    }

    #[test]
    fn straight_line_code_is_untouched() {
        let ctx = arm_context();
        // The program counter already points at the next boundary
        let (mut m, func, pc_store, _) = call_block_fixture(0x1004, 0x1004, 0x1004);
        let mut pass = CallIdentificationPass::default();
        assert!(!pass.run(&mut m, func, &ctx).unwrap());
        assert!(!m.function(func).is_propagation_barrier(pc_store));
    }

    #[test]
    fn other_processors_are_rejected() {
        let mut ctx = arm_context();
        ctx.processor = Processor::X86_64;
        let (mut m, func, _, _) = call_block_fixture(0x1800, 0x1004, 0x1004);
        assert!(matches!(
            CallIdentificationPass::default().run(&mut m, func, &ctx),
            Err(LiftError::UnsupportedProcessor(_))
        ));
    }
}
