//! Replaces program counter dispatches by direct branches where the branch target can be
//! proven from a constant program counter store.

use super::{erase_with_dead_address, stored_value, FunctionPass, PassContext, PassId};
use crate::error::LiftError;
use crate::ir::{BlockId, FuncId, Function, InstId, Module, Op, Terminator, Value};
use crate::log::*;

#[derive(Default)]
pub struct FixBasicBlockEdgesPass {
    /// Dispatches replaced by a branch
    pub resolved_dispatches: usize,
    /// Predecessor branches redirected past a dispatch
    pub redirected_edges: usize,
    /// Dispatches or edges that could not be resolved
    pub unresolved: usize,
}

/// The last store to the program counter field in `b`, searching backwards from `from` (or
/// from the end of the block)
fn last_pc_store(f: &Function, b: BlockId, pc: u64, from: Option<usize>) -> Option<InstId> {
    let insts = f.block_insts(b);
    let end = from.unwrap_or(insts.len());
    insts[..end]
        .iter()
        .rev()
        .copied()
        .find(|&i| f.is_env_store_of(i, pc))
}

impl FunctionPass for FixBasicBlockEdgesPass {
    fn id(&self) -> PassId {
        PassId::FixBasicBlockEdges
    }

    fn requires(&self) -> &'static [PassId] {
        &[PassId::InlineOpcodeCalls, PassId::IdentifyCalls]
    }

    fn preserves_cfg(&self) -> bool {
        false
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        ctx: &PassContext,
    ) -> Result<bool, LiftError> {
        let pc = ctx.pc.offset;
        let f = module.function_mut(func);

        let mut dispatches: Vec<(BlockId, InstId)> = vec![];
        for &b in f.blocks() {
            if let Some(Terminator::Switch { value, .. }) = f.terminator(b) {
                match value.as_inst() {
                    Some(load) if f.is_env_load_of(load, pc) => dispatches.push((b, load)),
                    _ => {
                        error!(
                            "Dispatch does not switch on a program counter load";
                            "block" => f.block_name(b),
                        );
                        return Err(LiftError::DispatchNotPcLoad {
                            block: f.block_name(b).to_string(),
                        });
                    }
                }
            }
        }

        let mut changed = false;
        for (b, load) in dispatches {
            if !matches!(f.terminator(b), Some(Terminator::Switch { .. })) {
                continue;
            }
            let load_pos = f.position_in_block(load);
            if let Some(store) = last_pc_store(f, b, pc, load_pos) {
                changed |= self.resolve_in_block(f, b, load, store);
            } else {
                changed |= self.resolve_from_predecessors(f, b, load, pc);
            }
        }
        debug!(
            "Fixed basic block edges";
            "function" => &f.name,
            "resolved" => self.resolved_dispatches,
            "redirected" => self.redirected_edges,
            "unresolved" => self.unresolved,
        );
        Ok(changed)
    }
}

impl FixBasicBlockEdgesPass {
    /// Replace the dispatch ending `b` by a branch, using the program counter store `store`
    /// made earlier in the same block
    fn resolve_in_block(&mut self, f: &mut Function, b: BlockId, load: InstId, store: InstId) -> bool {
        let value = match stored_value(f, store).and_then(|v| v.as_const()) {
            Some(v) => v,
            None => {
                error!(
                    "Stored program counter value is not constant";
                    "block" => f.block_name(b),
                );
                self.unresolved += 1;
                return false;
            }
        };
        let target = match f.terminator(b).and_then(|t| t.find_case(value)) {
            Some(t) => t,
            None => {
                error!(
                    "Dispatch does not cover stored program counter value";
                    "block" => f.block_name(b),
                    "value" => Hex(value),
                );
                self.unresolved += 1;
                return false;
            }
        };
        trace!(
            "Resolved dispatch";
            "block" => f.block_name(b),
            "target" => f.block_name(target),
        );
        f.set_terminator(b, Terminator::Br(target));
        if f.uses_of(load).is_empty() {
            erase_with_dead_address(f, load);
        }
        self.resolved_dispatches += 1;
        true
    }

    /// Redirect each predecessor of `b` that sets a constant program counter and branches
    /// unconditionally into `b` straight to the dispatched target
    fn resolve_from_predecessors(&mut self, f: &mut Function, b: BlockId, load: InstId, pc: u64) -> bool {
        // Skipping `b` is only sound if it does nothing but dispatch
        let dispatch_only = f.block_insts(b).iter().all(|&i| {
            i == load || matches!(f.op(i), Op::CpuFieldPtr { .. }) && f.op(load).operands().contains(&Value::Inst(i))
        });
        if !dispatch_only {
            warn!(
                "No program counter store before dispatch, and block has other effects";
                "block" => f.block_name(b),
            );
            self.unresolved += 1;
            return false;
        }

        let mut replacements: Vec<(BlockId, BlockId)> = vec![];
        for p in f.predecessors(b) {
            let store = match last_pc_store(f, p, pc, None) {
                Some(s) => s,
                None => {
                    error!("No program counter store found"; "block" => f.block_name(p));
                    self.unresolved += 1;
                    continue;
                }
            };
            let value = match stored_value(f, store).and_then(|v| v.as_const()) {
                Some(v) => v,
                None => {
                    error!(
                        "Program counter value set at end of block is not constant";
                        "block" => f.block_name(p),
                    );
                    self.unresolved += 1;
                    continue;
                }
            };
            let target = match f.terminator(b).and_then(|t| t.find_case(value)) {
                Some(t) => t,
                None => {
                    error!(
                        "Value not found among dispatch cases";
                        "block" => f.block_name(b),
                        "value" => Hex(value),
                    );
                    self.unresolved += 1;
                    continue;
                }
            };
            match f.terminator(p) {
                Some(Terminator::Br(_)) => replacements.push((p, target)),
                t => {
                    error!(
                        "Block setting the program counter does not end in an unconditional branch";
                        "block" => f.block_name(p),
                        "terminator" => ?t,
                    );
                    self.unresolved += 1;
                }
            }
        }

        let changed = !replacements.is_empty();
        for (p, target) in replacements {
            f.set_terminator(p, Terminator::Br(target));
            self.redirected_edges += 1;
        }
        changed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Tags, Type};
    use crate::tests::arm_context;

    const PC: u64 = 60;

    fn pc_store(f: &mut Function, b: BlockId, value: Value) -> InstId {
        let p = f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![15],
            },
        );
        let s = f.append(
            b,
            Op::Store {
                value,
                ptr: Value::Inst(p),
            },
        );
        f.set_tags(
            s,
            Tags {
                env_offset: Some(PC),
                ..Default::default()
            },
        );
        s
    }

    fn dispatch(f: &mut Function, b: BlockId, sink: BlockId, cases: Vec<(u64, BlockId)>) -> InstId {
        let p = f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![15],
            },
        );
        let l = f.append(
            b,
            Op::Load {
                ty: Type::Int(32),
                ptr: Value::Inst(p),
            },
        );
        f.set_tags(
            l,
            Tags {
                env_offset: Some(PC),
                ..Default::default()
            },
        );
        f.set_terminator(
            b,
            Terminator::Switch {
                value: Value::Inst(l),
                default: sink,
                cases,
            },
        );
        l
    }

    #[test]
    fn uncovered_value_leaves_dispatch() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("b0");
        let sink = f.add_block("sink");
        let b1 = f.add_block("b1");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(b1, Terminator::Ret(None));
        pc_store(&mut f, b0, Value::constant(0x3000, 32));
        dispatch(&mut f, b0, sink, vec![(0x2000, b1)]);
        let id = m.add_function(f);

        let mut pass = FixBasicBlockEdgesPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(pass.unresolved, 1);
        assert!(matches!(
            m.function(id).terminator(b0),
            Some(Terminator::Switch { .. })
        ));
    }

    #[test]
    fn predecessor_branch_is_redirected() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("b0");
        let sink = f.add_block("sink");
        let hub = f.add_block("hub");
        let b2 = f.add_block("b2");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(b2, Terminator::Ret(None));
        pc_store(&mut f, b0, Value::constant(0x2000, 32));
        f.set_terminator(b0, Terminator::Br(hub));
        dispatch(&mut f, hub, sink, vec![(0x2000, b2)]);
        let id = m.add_function(f);

        let mut pass = FixBasicBlockEdgesPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(m.function(id).terminator(b0), Some(&Terminator::Br(b2)));
        assert_eq!(pass.redirected_edges, 1);
    }

    #[test]
    fn conditional_predecessor_is_not_redirected() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("b0");
        let sink = f.add_block("sink");
        let hub = f.add_block("hub");
        let b2 = f.add_block("b2");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(b2, Terminator::Ret(None));
        pc_store(&mut f, b0, Value::constant(0x2000, 32));
        f.set_terminator(
            b0,
            Terminator::CondBr {
                cond: Value::constant(1, 1),
                then_bb: hub,
                else_bb: sink,
            },
        );
        dispatch(&mut f, hub, sink, vec![(0x2000, b2)]);
        let id = m.add_function(f);

        let mut pass = FixBasicBlockEdgesPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(pass.unresolved, 1);
    }

    #[test]
    fn computed_program_counter_leaves_dispatch() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr, Type::Int(32)], Type::Void);
        let b0 = f.add_block("b0");
        let sink = f.add_block("sink");
        let b1 = f.add_block("b1");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(b1, Terminator::Ret(None));
        pc_store(&mut f, b0, Value::Arg(1));
        dispatch(&mut f, b0, sink, vec![(0x2000, b1)]);
        let id = m.add_function(f);

        let mut pass = FixBasicBlockEdgesPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(pass.unresolved, 1);
        assert_eq!(pass.resolved_dispatches, 0);
        assert!(matches!(
            m.function(id).terminator(b0),
            Some(Terminator::Switch { .. })
        ));
    }

    #[test]
    fn predecessor_without_program_counter_store_keeps_its_edge() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let setter = f.add_block("setter");
        let plain = f.add_block("plain");
        let sink = f.add_block("sink");
        let hub = f.add_block("hub");
        let b2 = f.add_block("b2");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(b2, Terminator::Ret(None));
        pc_store(&mut f, setter, Value::constant(0x2000, 32));
        f.set_terminator(setter, Terminator::Br(hub));
        f.set_terminator(plain, Terminator::Br(hub));
        dispatch(&mut f, hub, sink, vec![(0x2000, b2)]);
        let id = m.add_function(f);

        let mut pass = FixBasicBlockEdgesPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        let f = m.function(id);
        assert_eq!(f.terminator(setter), Some(&Terminator::Br(b2)));
        assert_eq!(f.terminator(plain), Some(&Terminator::Br(hub)));
        assert_eq!(pass.redirected_edges, 1);
        assert_eq!(pass.unresolved, 1);
        // The hub is still reachable, so it keeps its dispatch
        assert!(matches!(f.terminator(hub), Some(Terminator::Switch { .. })));
    }

    #[test]
    fn dispatch_on_other_value_is_rejected() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("b0");
        let sink = f.add_block("sink");
        f.set_terminator(sink, Terminator::Ret(None));
        f.set_terminator(
            b0,
            Terminator::Switch {
                value: Value::constant(0, 32),
                default: sink,
                cases: vec![],
            },
        );
        let id = m.add_function(f);
        assert!(matches!(
            FixBasicBlockEdgesPass::default().run(&mut m, id, &arm_context()),
            Err(LiftError::DispatchNotPcLoad { .. })
        ));
    }
}
