//! Promotes CPU-state fields to function-local slots.
//!
//! Every field accessed through tagged loads and stores gets a slot, initialised from the CPU
//! state on entry. Accesses then go to the slot, and the slots are written back to the CPU
//! state wherever something else may observe it: subroutine calls, opcode calls that were not
//! inlined, value-propagation barriers, remaining dispatches and returns. Calls may also change
//! the CPU state, so slots are reloaded after them.

use super::{FunctionPass, PassContext, PassId};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::LiftError;
use crate::ir::{BlockId, FuncId, Function, InstId, Module, Op, Tags, Terminator, Type, Use, Value};
use crate::log::*;

/// A promoted CPU-state field
#[derive(Clone, Debug)]
struct Slot {
    ty: Type,
    base: Value,
    path: Vec<u32>,
    register: Option<String>,
    alloca: Value,
}

#[derive(Default)]
pub struct LiftAsmRegistersPass {
    /// Offsets of the fields given a slot
    pub promoted: Vec<u64>,
    /// Loads and stores redirected to a slot
    pub rewritten: usize,
}

/// Where the CPU state must be up to date
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum CommitPoint {
    /// Write back before; the CPU state may change, so reload after
    Call,
    /// Write back before a store that goes to the CPU state unchanged
    Barrier,
    /// Write back before a load that feeds a dispatch
    Dispatch,
}

fn commit_point(f: &Function, i: InstId) -> Option<CommitPoint> {
    match f.op(i) {
        Op::Call { .. } if f.is_asm_call(i) || f.source_address(i).is_some() => {
            Some(CommitPoint::Call)
        }
        Op::Store { .. } if f.is_propagation_barrier(i) => Some(CommitPoint::Barrier),
        Op::Load { .. } if f.env_offset(i).is_some() && feeds_dispatch(f, i) => {
            Some(CommitPoint::Dispatch)
        }
        _ => None,
    }
}

fn feeds_dispatch(f: &Function, i: InstId) -> bool {
    f.uses_of(i).iter().any(|u| match u {
        Use::Terminator(b) => matches!(f.terminator(*b), Some(Terminator::Switch { .. })),
        Use::Inst(_) => false,
    })
}

/// The field address computation behind a CPU-state access
fn field_of(f: &Function, ptr: Value) -> Option<(Value, Vec<u32>)> {
    match f.op(ptr.as_inst()?) {
        Op::CpuFieldPtr { base, path } => Some((*base, path.clone())),
        _ => None,
    }
}

impl FunctionPass for LiftAsmRegistersPass {
    fn id(&self) -> PassId {
        PassId::LiftAsmRegisters
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
        let mut slots = find_slots(f);
        if slots.is_empty() {
            return Ok(false);
        }
        let entry = f.entry_block().expect("Function with CPU-state accesses has a body");

        let mut pos = 0;
        let offsets: Vec<u64> = slots.keys().copied().collect();
        for offset in offsets {
            let slot = slots.get_mut(&offset).expect("Offset taken from the map");
            let a = f.insert_at(
                entry,
                pos,
                Op::Alloca {
                    ty: slot.ty.clone(),
                },
            );
            slot.alloca = Value::Inst(a);
            pos += 1;
            self.promoted.push(offset);
        }
        for slot in slots.values() {
            pos += load_into_slot(f, entry, pos, slot);
        }

        for b in f.blocks().to_vec() {
            self.rewrite_block(f, b, &slots);
        }
        debug!(
            "Promoted CPU-state fields";
            "function" => &f.name,
            "fields" => self.promoted.len(),
            "accesses" => self.rewritten,
        );
        Ok(true)
    }
}

/// Fields accessed with one consistent type through a field address
fn find_slots(f: &Function) -> UnorderedMap<u64, Slot> {
    let mut slots: UnorderedMap<u64, Slot> = Default::default();
    let mut conflicting: UnorderedSet<u64> = Default::default();
    for &b in f.blocks() {
        for &i in f.block_insts(b) {
            let offset = match f.env_offset(i) {
                Some(o) => o,
                None => continue,
            };
            let (ty, ptr) = match f.op(i) {
                Op::Load { ty, ptr } => (ty.clone(), *ptr),
                Op::Store { value, ptr } => (f.value_type(*value), *ptr),
                _ => continue,
            };
            let (base, path) = match field_of(f, ptr) {
                Some(x) => x,
                None => {
                    conflicting.insert(offset);
                    continue;
                }
            };
            match slots.get(&offset) {
                Some(s) if s.ty != ty || s.path != path => {
                    conflicting.insert(offset);
                }
                Some(_) => {}
                None => {
                    slots.insert(
                        offset,
                        Slot {
                            ty,
                            base,
                            path,
                            register: f.tags(i).and_then(|t| t.register.clone()),
                            alloca: Value::Arg(0),
                        },
                    );
                }
            }
        }
    }
    for offset in conflicting.iter() {
        warn!("CPU-state field accessed inconsistently; not promoting"; "offset" => *offset);
        slots.remove(offset);
    }
    slots
}

impl LiftAsmRegistersPass {
    fn rewrite_block(&mut self, f: &mut Function, b: BlockId, slots: &UnorderedMap<u64, Slot>) {
        for i in f.block_insts(b).to_vec() {
            match commit_point(f, i) {
                Some(CommitPoint::Call) => {
                    write_back_before(f, i, slots);
                    let b = f.inst_block(i).expect("Live instruction");
                    let mut pos = f.position_in_block(i).expect("Live instruction") + 1;
                    for slot in slots.values() {
                        pos += load_into_slot(f, b, pos, slot);
                    }
                    continue;
                }
                Some(CommitPoint::Barrier) => {
                    write_back_before(f, i, slots);
                    if let (Some(slot), Op::Store { value, .. }) =
                        (f.env_offset(i).and_then(|o| slots.get(&o)), f.op(i).clone())
                    {
                        f.insert_after(
                            i,
                            Op::Store {
                                value,
                                ptr: slot.alloca,
                            },
                        );
                    }
                    continue;
                }
                Some(CommitPoint::Dispatch) => {
                    write_back_before(f, i, slots);
                    continue;
                }
                None => {}
            }
            let slot = match f.env_offset(i).and_then(|o| slots.get(&o)) {
                Some(s) => s,
                None => continue,
            };
            let old_ptr = match f.op_mut(i) {
                Op::Load { ptr, .. } | Op::Store { ptr, .. } => std::mem::replace(ptr, slot.alloca),
                _ => continue,
            };
            f.set_tags(i, Tags::default());
            if let Some(p) = old_ptr.as_inst() {
                if f.uses_of(p).is_empty() {
                    f.erase(p);
                }
            }
            self.rewritten += 1;
        }
        if matches!(f.terminator(b), Some(Terminator::Ret(_))) {
            let end = f.block_insts(b).len();
            write_back_at(f, b, end, slots);
        }
    }
}

/// Insert, at `pos` of `b`, a reload of `slot` from the CPU state. Returns the number of
/// instructions inserted.
fn load_into_slot(f: &mut Function, b: BlockId, pos: usize, slot: &Slot) -> usize {
    let p = f.insert_at(
        b,
        pos,
        Op::CpuFieldPtr {
            base: slot.base,
            path: slot.path.clone(),
        },
    );
    let l = f.insert_at(
        b,
        pos + 1,
        Op::Load {
            ty: slot.ty.clone(),
            ptr: Value::Inst(p),
        },
    );
    f.insert_at(
        b,
        pos + 2,
        Op::Store {
            value: Value::Inst(l),
            ptr: slot.alloca,
        },
    );
    3
}

fn write_back_before(f: &mut Function, i: InstId, slots: &UnorderedMap<u64, Slot>) {
    let b = f.inst_block(i).expect("Live instruction");
    let pos = f.position_in_block(i).expect("Live instruction");
    write_back_at(f, b, pos, slots);
}

/// Insert, at `pos` of `b`, stores of every slot back to the CPU state
fn write_back_at(f: &mut Function, b: BlockId, mut pos: usize, slots: &UnorderedMap<u64, Slot>) {
    for (offset, slot) in slots.iter() {
        let l = f.insert_at(
            b,
            pos,
            Op::Load {
                ty: slot.ty.clone(),
                ptr: slot.alloca,
            },
        );
        let p = f.insert_at(
            b,
            pos + 1,
            Op::CpuFieldPtr {
                base: slot.base,
                path: slot.path.clone(),
            },
        );
        f.insert_at(
            b,
            pos + 2,
            Op::Store {
                value: Value::Inst(l),
                ptr: Value::Inst(p),
            },
        );
        trace!(
            "Slot write-back";
            "block" => f.block_name(b),
            "offset" => *offset,
            OptionalKV("register", slot.register.clone()),
        );
        pos += 3;
    }
}
