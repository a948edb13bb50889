//! Removes redundant accesses to CPU-state fields within each basic block.
//!
//! Within a block, a load of a field whose current value is already known is replaced by that
//! value, and a store that is fully overwritten before anything reads it is removed. Subroutine
//! calls, value-propagation barriers and opcode calls that were not inlined may change any
//! field, so they forget everything known.
//!
//! Per-block live-in and live-out field sets are also computed, but values are not yet carried
//! across block boundaries.

use super::{erase_with_dead_address, stored_value, FunctionPass, PassContext, PassId};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::LiftError;
use crate::ir::{BlockId, FuncId, Function, InstId, Module, Op, Use, Value};
use crate::log::*;

/// Field offsets read on entry to, and written on exit from, one block
#[derive(Clone, Debug)]
pub struct BlockSummary {
    pub block: BlockId,
    /// Fields whose first access in the block is a load
    pub live_in: UnorderedSet<u64>,
    /// Fields stored after the last point that invalidates CPU state
    pub live_out: UnorderedSet<u64>,
}

#[derive(Default)]
pub struct CpuStructToRegPass {
    pub loads_forwarded: usize,
    pub stores_removed: usize,
    pub summaries: Vec<BlockSummary>,
}

/// Whether `i` may change any CPU-state field behind the pass's back
fn invalidates_state(f: &Function, i: InstId) -> bool {
    match f.op(i) {
        Op::Call { .. } => f.is_asm_call(i) || f.source_address(i).is_some(),
        Op::Store { .. } => f.is_propagation_barrier(i),
        _ => false,
    }
}

impl FunctionPass for CpuStructToRegPass {
    fn id(&self) -> PassId {
        PassId::CpuStructToReg
    }

    fn requires(&self) -> &'static [PassId] {
        &[PassId::InlineOpcodeCalls, PassId::IdentifyCalls]
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _ctx: &PassContext,
    ) -> Result<bool, LiftError> {
        let f = module.function_mut(func);
        let mut changed = false;
        for b in f.blocks().to_vec() {
            changed |= self.eliminate_in_block(f, b);
        }
        self.summaries = f.blocks().iter().map(|&b| summarize(f, b)).collect();
        for s in &self.summaries {
            trace!(
                "CPU state block summary";
                "block" => f.block_name(s.block),
                "live_in" => ?s.live_in,
                "live_out" => ?s.live_out,
            );
        }
        debug!(
            "Removed redundant CPU state accesses";
            "function" => &f.name,
            "loads" => self.loads_forwarded,
            "stores" => self.stores_removed,
        );
        Ok(changed)
    }
}

impl CpuStructToRegPass {
    fn eliminate_in_block(&mut self, f: &mut Function, b: BlockId) -> bool {
        let mut current: UnorderedMap<u64, Value> = Default::default();
        let mut unread_store: UnorderedMap<u64, InstId> = Default::default();
        let mut changed = false;

        for i in f.block_insts(b).to_vec() {
            if invalidates_state(f, i) {
                current.clear();
                unread_store.clear();
                continue;
            }
            let offset = match f.env_offset(i) {
                Some(o) => o,
                None => continue,
            };
            match f.op(i).clone() {
                Op::Load { ty, .. } => {
                    let feeds_dispatch = f
                        .uses_of(i)
                        .iter()
                        .any(|u| matches!(u, Use::Terminator(_)));
                    match current.get(&offset) {
                        Some(&v) if !feeds_dispatch && f.value_type(v) == ty => {
                            f.replace_all_uses_with(i, v);
                            erase_with_dead_address(f, i);
                            self.loads_forwarded += 1;
                            changed = true;
                        }
                        _ => {
                            unread_store.remove(&offset);
                            current.insert(offset, Value::Inst(i));
                        }
                    }
                }
                Op::Store { value, .. } => {
                    if let Some(earlier) = unread_store.insert(offset, i) {
                        if overwrites(f, value, earlier) {
                            erase_with_dead_address(f, earlier);
                            self.stores_removed += 1;
                            changed = true;
                        } else {
                            trace!(
                                "Narrower store keeps earlier store to field";
                                "function" => &f.name,
                                "offset" => offset,
                            );
                        }
                    }
                    current.insert(offset, value);
                }
                _ => {}
            }
        }
        changed
    }
}

/// Whether storing `value` replaces every byte written by the store `earlier`
fn overwrites(f: &Function, value: Value, earlier: InstId) -> bool {
    let earlier = match stored_value(f, earlier) {
        Some(v) => f.value_type(v),
        None => return false,
    };
    let later = f.value_type(value);
    match (earlier.int_bits(), later.int_bits()) {
        (Some(e), Some(l)) => e <= l,
        _ => earlier == later,
    }
}

fn summarize(f: &Function, b: BlockId) -> BlockSummary {
    let mut live_in = UnorderedSet::new();
    let mut seen = UnorderedSet::new();
    let mut live_out = UnorderedSet::new();
    let mut before_first_invalidation = true;
    for &i in f.block_insts(b) {
        if invalidates_state(f, i) {
            before_first_invalidation = false;
            live_out.clear();
            continue;
        }
        let offset = match f.env_offset(i) {
            Some(o) => o,
            None => continue,
        };
        match f.op(i) {
            Op::Load { .. } => {
                if before_first_invalidation && seen.insert(offset) {
                    live_in.insert(offset);
                }
            }
            Op::Store { .. } => {
                seen.insert(offset);
                live_out.insert(offset);
            }
            _ => {}
        }
    }
    BlockSummary {
        block: b,
        live_in,
        live_out,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Tags, Terminator, Type};
    use crate::tests::arm_context;

    const R0: u64 = 0;

    fn field(f: &mut Function, b: BlockId, idx: u32) -> Value {
        Value::Inst(f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![idx],
            },
        ))
    }

    fn tag(f: &mut Function, i: InstId, offset: u64) {
        f.set_tags(
            i,
            Tags {
                env_offset: Some(offset),
                ..Default::default()
            },
        );
    }

    #[test]
    fn overwritten_store_is_removed() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let p = field(&mut f, b, 0);
        let s1 = f.append(
            b,
            Op::Store {
                value: Value::constant(1, 32),
                ptr: p,
            },
        );
        tag(&mut f, s1, R0);
        let p = field(&mut f, b, 0);
        let s2 = f.append(
            b,
            Op::Store {
                value: Value::constant(2, 32),
                ptr: p,
            },
        );
        tag(&mut f, s2, R0);
        f.set_terminator(b, Terminator::Ret(None));
        let id = m.add_function(f);

        let mut pass = CpuStructToRegPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        let f = m.function(id);
        assert!(!f.is_live(s1));
        assert!(f.is_live(s2));
        assert_eq!(pass.stores_removed, 1);
        assert_eq!(f.inst_count(), 2);
        assert!(pass.summaries[0].live_out.contains(&R0));
    }

    #[test]
    fn narrower_store_keeps_wider_one() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let p = field(&mut f, b, 0);
        let wide = f.append(
            b,
            Op::Store {
                value: Value::constant(0x11223344, 32),
                ptr: p,
            },
        );
        tag(&mut f, wide, R0);
        let p = field(&mut f, b, 0);
        let narrow = f.append(
            b,
            Op::Store {
                value: Value::constant(0x55, 8),
                ptr: p,
            },
        );
        tag(&mut f, narrow, R0);
        let p = field(&mut f, b, 0);
        let wider = f.append(
            b,
            Op::Store {
                value: Value::constant(0x66778899, 32),
                ptr: p,
            },
        );
        tag(&mut f, wider, R0);
        f.set_terminator(b, Terminator::Ret(None));
        let id = m.add_function(f);

        let mut pass = CpuStructToRegPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        let f = m.function(id);
        assert!(f.is_live(wide));
        assert!(!f.is_live(narrow));
        assert!(f.is_live(wider));
        assert_eq!(pass.stores_removed, 1);
    }

    #[test]
    fn barrier_forgets_known_values() {
        let mut m = Module::new("m");
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let p = field(&mut f, b, 0);
        let l1 = f.append(b, Op::Load { ty: Type::Int(32), ptr: p });
        tag(&mut f, l1, R0);
        let p = field(&mut f, b, 15);
        let barrier = f.append(
            b,
            Op::Store {
                value: Value::Inst(l1),
                ptr: p,
            },
        );
        f.set_tags(
            barrier,
            Tags {
                env_offset: Some(60),
                propagation_barrier: true,
                ..Default::default()
            },
        );
        let p = field(&mut f, b, 0);
        let l2 = f.append(b, Op::Load { ty: Type::Int(32), ptr: p });
        tag(&mut f, l2, R0);
        f.set_terminator(b, Terminator::Ret(Some(Value::Inst(l2))));
        let id = m.add_function(f);

        let mut pass = CpuStructToRegPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert!(m.function(id).is_live(l2));
        assert_eq!(pass.loads_forwarded, 0);
        let s = &pass.summaries[0];
        assert!(s.live_in.contains(&R0));
        assert!(s.live_out.is_empty());
    }
}
