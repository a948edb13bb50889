//! Lifts stack-relative memory accesses into accesses of a synthesized stack frame.
//!
//! The stack pointer is tracked symbolically along a depth-first walk of the function, as a
//! constant depth relative to its value on entry. Memory helper calls whose address resolves
//! to a constant depth are collected, a packed frame structure covering every such depth is
//! allocated on entry, and the calls are replaced by plain loads and stores into it.

use super::{FunctionPass, PassContext, PassId};
use crate::backend::{MEMORY_LOAD_HELPER, MEMORY_STORE_HELPER};
use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::LiftError;
use crate::ir::{
    BinaryOp, BlockId, Callee, CastOp, FuncId, Function, InstId, Module, Op, Terminator, Type,
    Value,
};
use crate::log::*;
use std::collections::BTreeMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessKind {
    Load,
    Store,
}

/// A memory helper call whose address is a known offset from the entry stack pointer
#[derive(Clone, Debug)]
pub struct StackAccess {
    pub call: InstId,
    pub offset: i64,
    /// Access width in bytes
    pub width: usize,
    pub kind: AccessKind,
}

/// Placement of one stack offset within the frame structure
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FrameSlot {
    pub offset: i64,
    pub width: usize,
    /// Byte position within the frame
    pub position: usize,
    /// Field index within the frame
    pub field: usize,
}

#[derive(Clone, Default, Debug)]
pub struct FrameLayout {
    /// Byte width of every field, padding included
    pub fields: Vec<usize>,
    pub slots: Vec<FrameSlot>,
    /// Offsets that start inside an earlier slot, and so have no field
    pub overlapping: Vec<i64>,
}

impl FrameLayout {
    pub fn slot(&self, offset: i64) -> Option<&FrameSlot> {
        self.slots.iter().find(|s| s.offset == offset)
    }

    pub fn size(&self) -> usize {
        self.fields.iter().sum()
    }
}

/// Lay out a packed frame holding a field for every offset in `widths` (offset to widest
/// access), with each field's position equal to its offset minus the smallest offset.
pub fn frame_layout(widths: &BTreeMap<i64, usize>) -> FrameLayout {
    let mut layout = FrameLayout::default();
    let min = match widths.keys().next() {
        Some(&m) => m,
        None => return layout,
    };
    let mut cursor = 0usize;
    for (&offset, &width) in widths {
        let position = (offset - min) as usize;
        if position < cursor {
            layout.overlapping.push(offset);
            continue;
        }
        let mut gap = position - cursor;
        while gap > 0 {
            let chunk = 1usize << (usize::BITS - 1 - gap.min(8).leading_zeros());
            layout.fields.push(chunk);
            gap -= chunk;
        }
        layout.fields.push(width);
        layout.slots.push(FrameSlot {
            offset,
            width,
            position,
            field: layout.fields.len() - 1,
        });
        cursor = position + width;
    }
    layout
}

/// Whether `v` is computed from a stack pointer load through arithmetic and casts only
pub fn is_stack_relative(f: &Function, v: Value, sp: u64) -> bool {
    let i = match v.as_inst() {
        Some(i) => i,
        None => return false,
    };
    match f.op(i) {
        Op::Load { .. } => f.env_offset(i) == Some(sp),
        Op::Binary { lhs, rhs, .. } => {
            is_stack_relative(f, *lhs, sp) || is_stack_relative(f, *rhs, sp)
        }
        Op::Cast { value, .. } => is_stack_relative(f, *value, sp),
        _ => false,
    }
}

/// Resolve `v` to a constant offset from the entry stack pointer, given the depths recorded
/// for the stack pointer loads visited so far. `None` if `v` is not of a recognized form.
pub fn backtrack(f: &Function, v: Value, sp: u64, depths: &UnorderedMap<InstId, i64>) -> Option<i64> {
    let i = v.as_inst()?;
    match f.op(i) {
        Op::Load { .. } if f.env_offset(i) == Some(sp) => depths.get(&i).copied(),
        Op::Binary {
            op: BinaryOp::Add,
            lhs,
            rhs,
        } => match (lhs.as_signed_const(), rhs.as_signed_const()) {
            (None, Some(c)) => Some(backtrack(f, *lhs, sp, depths)?.wrapping_add(c)),
            (Some(c), None) => Some(backtrack(f, *rhs, sp, depths)?.wrapping_add(c)),
            _ => None,
        },
        Op::Binary {
            op: BinaryOp::Sub,
            lhs,
            rhs,
        } => {
            let c = rhs.as_signed_const()?;
            Some(backtrack(f, *lhs, sp, depths)?.wrapping_sub(c))
        }
        Op::Cast {
            op: CastOp::ZExt | CastOp::SExt | CastOp::Trunc,
            value,
            ..
        } => backtrack(f, *value, sp, depths),
        _ => None,
    }
}

#[derive(Default)]
pub struct LiftAsmStackPass {
    pub accesses: Vec<StackAccess>,
    pub layout: FrameLayout,
    /// Stack-relative accesses left as helper calls
    pub skipped: usize,
}

/// An instruction-free block that returns, such as the unknown jump target sink
fn is_trivial_exit(f: &Function, b: BlockId) -> bool {
    f.block_insts(b).is_empty() && matches!(f.terminator(b), Some(Terminator::Ret(_)))
}

/// Convert `v` to an integer of `bits`, inserting a cast before `before` if needed
fn resize_before(f: &mut Function, before: InstId, v: Value, bits: u32) -> Value {
    let from = f.value_type(v).int_bits().unwrap_or(bits);
    let op = match from.cmp(&bits) {
        std::cmp::Ordering::Equal => return v,
        std::cmp::Ordering::Less => CastOp::ZExt,
        std::cmp::Ordering::Greater => CastOp::Trunc,
    };
    if let Some(c) = v.as_const() {
        return Value::constant(c, bits);
    }
    Value::Inst(f.insert_before(
        before,
        Op::Cast {
            op,
            value: v,
            to: Type::Int(bits),
        },
    ))
}

impl FunctionPass for LiftAsmStackPass {
    fn id(&self) -> PassId {
        PassId::LiftAsmStack
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
        let helpers = (module.lookup(MEMORY_LOAD_HELPER), module.lookup(MEMORY_STORE_HELPER));
        self.collect(module.function(func), helpers, ctx.sp.offset)?;
        if self.accesses.is_empty() {
            debug!("No stack accesses"; "function" => &module.function(func).name);
            return Ok(false);
        }

        let mut widths: BTreeMap<i64, usize> = BTreeMap::new();
        for a in &self.accesses {
            let w = widths.entry(a.offset).or_insert(0);
            *w = (*w).max(a.width);
        }
        self.layout = frame_layout(&widths);
        for &offset in &self.layout.overlapping {
            warn!(
                "Stack slot overlaps an earlier slot; leaving its accesses as calls";
                "offset" => offset,
            );
        }
        if self.layout.slots.is_empty() {
            return Ok(false);
        }

        let name = format!("frame_{}", module.function(func).name);
        let fields = self
            .layout
            .fields
            .iter()
            .map(|w| Type::Int(8 * *w as u32))
            .collect();
        let frame_ty = module.add_struct(name, fields, true);
        let f = module.function_mut(func);
        let entry = f
            .entry_block()
            .expect("Function with stack accesses has an entry block");
        let frame = Value::Inst(f.insert_at(
            entry,
            0,
            Op::Alloca {
                ty: Type::Struct(frame_ty),
            },
        ));

        let mut rewritten = 0;
        for a in &self.accesses {
            let slot = match self.layout.slot(a.offset) {
                Some(s) => *s,
                None => {
                    self.skipped += 1;
                    continue;
                }
            };
            let bits = 8 * a.width as u32;
            let ptr = Value::Inst(f.insert_before(
                a.call,
                Op::FrameFieldPtr {
                    frame,
                    index: slot.field,
                },
            ));
            let args = match f.op(a.call) {
                Op::Call { args, .. } => args.clone(),
                _ => unreachable!(),
            };
            match a.kind {
                AccessKind::Store => {
                    let value = resize_before(f, a.call, args[4], bits);
                    f.insert_before(a.call, Op::Store { value, ptr });
                }
                AccessKind::Load => {
                    let l = f.insert_before(
                        a.call,
                        Op::Load {
                            ty: Type::Int(bits),
                            ptr,
                        },
                    );
                    let ret_bits = f.inst_type(a.call).int_bits().unwrap_or(bits);
                    let v = resize_before(f, a.call, Value::Inst(l), ret_bits);
                    f.replace_all_uses_with(a.call, v);
                }
            }
            f.erase(a.call);
            rewritten += 1;
        }
        info!(
            "Lifted stack frame";
            "function" => &f.name,
            "accesses" => rewritten,
            "skipped" => self.skipped,
            "frame_size" => self.layout.size(),
        );
        Ok(true)
    }
}

impl LiftAsmStackPass {
    /// Walk `f` depth-first from its entry, tracking the stack pointer depth, and record every
    /// helper call whose address resolves to a stack offset. Nothing is modified.
    fn collect(
        &mut self,
        f: &Function,
        (load_helper, store_helper): (Option<FuncId>, Option<FuncId>),
        sp: u64,
    ) -> Result<(), LiftError> {
        self.accesses.clear();
        self.layout = FrameLayout::default();
        self.skipped = 0;
        let entry = match f.entry_block() {
            Some(b) => b,
            None => return Ok(()),
        };
        let mut entry_depth: UnorderedMap<BlockId, i64> = Default::default();
        let mut load_depth: UnorderedMap<InstId, i64> = Default::default();
        let mut visited: UnorderedSet<BlockId> = Default::default();
        let mut stack = vec![entry];
        entry_depth.insert(entry, 0);

        while let Some(b) = stack.pop() {
            if !visited.insert(b) {
                continue;
            }
            let mut depth = *entry_depth
                .get(&b)
                .expect("Blocks are only pushed once their entry depth is known");
            for &i in f.block_insts(b) {
                match f.op(i) {
                    Op::Load { .. } if f.env_offset(i) == Some(sp) => {
                        load_depth.insert(i, depth);
                    }
                    Op::Store { value, .. } if f.env_offset(i) == Some(sp) => {
                        depth = match backtrack(f, *value, sp, &load_depth) {
                            Some(d) => d,
                            None => {
                                error!(
                                    "Cannot backtrack stack pointer update";
                                    "function" => &f.name,
                                    "block" => f.block_name(b),
                                    "inst" => ?i,
                                );
                                return Err(LiftError::StackPointerUntrackable {
                                    function: f.name.clone(),
                                    block: f.block_name(b).to_string(),
                                });
                            }
                        };
                    }
                    Op::Call {
                        callee: Callee::Direct(c),
                        args,
                        ..
                    } => {
                        let kind = if Some(*c) == load_helper {
                            AccessKind::Load
                        } else if Some(*c) == store_helper {
                            AccessKind::Store
                        } else {
                            continue;
                        };
                        self.record(f, i, kind, args, sp, &load_depth);
                    }
                    _ => {}
                }
            }
            // Reverse so that the first successor is explored first
            for s in f.successors(b).into_iter().rev() {
                if is_trivial_exit(f, s) {
                    continue;
                }
                match entry_depth.get(&s) {
                    Some(&d) if d != depth => {
                        error!(
                            "Stack depth mismatch";
                            "from" => f.block_name(b),
                            "to" => f.block_name(s),
                            "exit_depth" => depth,
                            "entry_depth" => d,
                        );
                        return Err(LiftError::StackDepthMismatch {
                            from: f.block_name(b).to_string(),
                            to: f.block_name(s).to_string(),
                            exit_depth: depth,
                            entry_depth: d,
                        });
                    }
                    Some(_) => {}
                    None => {
                        entry_depth.insert(s, depth);
                        stack.push(s);
                    }
                }
            }
        }
        Ok(())
    }

    fn record(
        &mut self,
        f: &Function,
        call: InstId,
        kind: AccessKind,
        args: &[Value],
        sp: u64,
        load_depth: &UnorderedMap<InstId, i64>,
    ) {
        let addr = match args.get(1) {
            Some(&a) if is_stack_relative(f, a, sp) => a,
            _ => return,
        };
        let arity = match kind {
            AccessKind::Load => 4,
            AccessKind::Store => 5,
        };
        if args.len() < arity {
            warn!(
                "Memory helper call has too few arguments";
                "function" => &f.name,
                "call" => ?call,
                "args" => args.len(),
            );
            self.skipped += 1;
            return;
        }
        let offset = match backtrack(f, addr, sp, load_depth) {
            Some(o) => o,
            None => {
                warn!(
                    "Backtracking not implemented for stack address";
                    "function" => &f.name,
                    "call" => ?call,
                );
                self.skipped += 1;
                return;
            }
        };
        let width = match args.get(2).and_then(|s| s.as_const()) {
            Some(shift) if shift <= 3 => 1usize << shift,
            _ => {
                warn!("Stack access of unknown width"; "function" => &f.name, "call" => ?call);
                self.skipped += 1;
                return;
            }
        };
        trace!(
            "Stack access";
            "call" => ?call,
            "offset" => offset,
            "width" => width,
            "kind" => ?kind,
        );
        self.accesses.push(StackAccess {
            call,
            offset,
            width,
            kind,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::Tags;
    use crate::tests::arm_context;

    const SP: u64 = 52;

    fn widths(w: &[(i64, usize)]) -> BTreeMap<i64, usize> {
        w.iter().copied().collect()
    }

    #[test]
    fn contiguous_offsets_need_no_padding() {
        let l = frame_layout(&widths(&[(-8, 4), (-4, 4), (0, 8)]));
        assert_eq!(l.fields, vec![4, 4, 8]);
        let positions: Vec<usize> = l.slots.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![0, 4, 8]);
        assert!(l.overlapping.is_empty());
    }

    #[test]
    fn gaps_are_padded_greedily() {
        let l = frame_layout(&widths(&[(-20, 4), (0, 4)]));
        // 16 bytes of gap, in chunks of at most 8
        assert_eq!(l.fields, vec![4, 8, 8, 4]);
        assert_eq!(l.slot(0).unwrap().field, 3);
        assert_eq!(l.slot(0).unwrap().position, 20);

        let l = frame_layout(&widths(&[(-7, 1), (0, 4)]));
        assert_eq!(l.fields, vec![1, 4, 2, 4]);
    }

    #[test]
    fn overlapping_offsets_are_reported() {
        let l = frame_layout(&widths(&[(-8, 8), (-4, 4)]));
        assert_eq!(l.slots.len(), 1);
        assert_eq!(l.overlapping, vec![-4]);
    }

    fn sp_load(f: &mut Function, b: BlockId) -> InstId {
        let p = f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![13],
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
                env_offset: Some(SP),
                ..Default::default()
            },
        );
        l
    }

    fn sp_store(f: &mut Function, b: BlockId, value: Value) {
        let p = f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![13],
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
                env_offset: Some(SP),
                ..Default::default()
            },
        );
    }

    fn binary(f: &mut Function, b: BlockId, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        Value::Inst(f.append(b, Op::Binary { op, lhs, rhs }))
    }

    fn with_helpers() -> (Module, FuncId, FuncId) {
        let mut m = Module::new("m");
        let ld = m.get_or_insert_function(
            MEMORY_LOAD_HELPER,
            vec![Type::Ptr, Type::Int(32), Type::Int(32), Type::Int(32)],
            Type::Int(64),
        );
        let st = m.get_or_insert_function(
            MEMORY_STORE_HELPER,
            vec![Type::Ptr, Type::Int(32), Type::Int(32), Type::Int(32), Type::Int(64)],
            Type::Void,
        );
        (m, ld, st)
    }

    #[test]
    fn backtracking_follows_constant_arithmetic() {
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let l = sp_load(&mut f, b);
        let a = binary(&mut f, b, BinaryOp::Add, Value::Inst(l), Value::constant(0xfffffff8, 32));
        let s = binary(&mut f, b, BinaryOp::Sub, a, Value::constant(4, 32));
        let c = binary(&mut f, b, BinaryOp::Sub, Value::constant(4, 32), a);
        let m = binary(&mut f, b, BinaryOp::Mul, a, Value::constant(2, 32));
        let mut depths = UnorderedMap::new();
        depths.insert(l, 16);
        assert_eq!(backtrack(&f, a, SP, &depths), Some(8));
        assert_eq!(backtrack(&f, s, SP, &depths), Some(4));
        assert_eq!(backtrack(&f, c, SP, &depths), None);
        assert_eq!(backtrack(&f, m, SP, &depths), None);
        assert!(is_stack_relative(&f, m, SP));
        assert!(!is_stack_relative(&f, Value::constant(4, 32), SP));
        // Unvisited loads are unresolved
        assert_eq!(backtrack(&f, a, SP, &UnorderedMap::new()), None);
    }

    #[test]
    fn function_without_helper_calls_is_untouched() {
        let (mut m, _, _) = with_helpers();
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let l = sp_load(&mut f, b);
        let v = binary(&mut f, b, BinaryOp::Sub, Value::Inst(l), Value::constant(8, 32));
        sp_store(&mut f, b, v);
        f.set_terminator(b, Terminator::Ret(None));
        let id = m.add_function(f);
        let before = m.function(id).inst_count();

        let mut pass = LiftAsmStackPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(m.function(id).inst_count(), before);
        assert!(pass.accesses.is_empty());
    }

    #[test]
    fn stack_accesses_become_frame_accesses() {
        let (mut m, ld, st) = with_helpers();
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let l = sp_load(&mut f, b);
        let slot = binary(&mut f, b, BinaryOp::Sub, Value::Inst(l), Value::constant(8, 32));
        sp_store(&mut f, b, slot);
        let store = f.append(
            b,
            Op::Call {
                callee: Callee::Direct(st),
                args: vec![
                    Value::Arg(0),
                    slot,
                    Value::constant(2, 32),
                    Value::constant(0, 32),
                    Value::constant(7, 64),
                ],
                ret: Type::Void,
            },
        );
        // Reload through the updated stack pointer: same slot
        let l2 = sp_load(&mut f, b);
        let load = f.append(
            b,
            Op::Call {
                callee: Callee::Direct(ld),
                args: vec![
                    Value::Arg(0),
                    Value::Inst(l2),
                    Value::constant(2, 32),
                    Value::constant(0, 32),
                ],
                ret: Type::Int(64),
            },
        );
        f.set_terminator(b, Terminator::Ret(Some(Value::Inst(load))));
        let id = m.add_function(f);

        let mut pass = LiftAsmStackPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(pass.accesses.len(), 2);
        assert!(pass.accesses.iter().all(|a| a.offset == -8 && a.width == 4));
        assert_eq!(pass.layout.fields, vec![4]);
        let f = m.function(id);
        assert!(!f.is_live(store));
        assert!(!f.is_live(load));
        assert!(matches!(f.op(f.block_insts(b)[0]), Op::Alloca { .. }));
        assert_eq!(f.verify(), Ok(()));
    }

    #[test]
    fn unresolvable_accesses_are_left_as_calls() {
        let (mut m, ld, st) = with_helpers();
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let dead = f.add_block("dead");
        f.set_terminator(dead, Terminator::Ret(None));
        // Never visited, so its depth is unknown
        let unvisited = sp_load(&mut f, dead);
        let l = sp_load(&mut f, b);
        let scaled = binary(&mut f, b, BinaryOp::Mul, Value::Inst(l), Value::constant(2, 32));
        let load = |f: &mut Function, addr: Value| {
            f.append(
                b,
                Op::Call {
                    callee: Callee::Direct(ld),
                    args: vec![
                        Value::Arg(0),
                        addr,
                        Value::constant(2, 32),
                        Value::constant(0, 32),
                    ],
                    ret: Type::Int(64),
                },
            )
        };
        let good = load(&mut f, Value::Inst(l));
        let untracked = load(&mut f, scaled);
        let unrecorded = load(&mut f, Value::Inst(unvisited));
        let short = f.append(
            b,
            Op::Call {
                callee: Callee::Direct(st),
                args: vec![Value::Arg(0), Value::Inst(l), Value::constant(2, 32)],
                ret: Type::Void,
            },
        );
        f.set_terminator(b, Terminator::Ret(Some(Value::Inst(good))));
        let id = m.add_function(f);

        let mut pass = LiftAsmStackPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!(pass.accesses.len(), 1);
        assert_eq!(pass.skipped, 3);
        let f = m.function(id);
        assert!(!f.is_live(good));
        for call in [untracked, unrecorded, short] {
            assert!(f.is_live(call));
        }

        // Counts start over for the next function
        let mut g = Function::new("g", vec![Type::Ptr], Type::Void);
        let gb = g.add_block("entry");
        g.set_terminator(gb, Terminator::Ret(None));
        let gid = m.add_function(g);
        assert!(!pass.run(&mut m, gid, &arm_context()).unwrap());
        assert_eq!(pass.skipped, 0);
        assert!(pass.accesses.is_empty());
    }

    #[test]
    fn helper_calls_in_unreachable_blocks_are_ignored() {
        let (mut m, _, st) = with_helpers();
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let dead = f.add_block("dead");
        f.set_terminator(b, Terminator::Ret(None));
        let l = sp_load(&mut f, dead);
        let call = f.append(
            dead,
            Op::Call {
                callee: Callee::Direct(st),
                args: vec![
                    Value::Arg(0),
                    Value::Inst(l),
                    Value::constant(2, 32),
                    Value::constant(0, 32),
                    Value::constant(1, 64),
                ],
                ret: Type::Void,
            },
        );
        f.set_terminator(dead, Terminator::Ret(None));
        let id = m.add_function(f);

        let mut pass = LiftAsmStackPass::default();
        assert!(!pass.run(&mut m, id, &arm_context()).unwrap());
        assert!(pass.accesses.is_empty());
        assert!(m.function(id).is_live(call));
    }

    #[test]
    fn diverging_stack_depths_abort() {
        let (mut m, _, _) = with_helpers();
        let mut f = Function::new("f", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("b0");
        let left = f.add_block("left");
        let right = f.add_block("right");
        let join = f.add_block("join");
        f.set_terminator(
            b0,
            Terminator::CondBr {
                cond: Value::constant(1, 1),
                then_bb: left,
                else_bb: right,
            },
        );
        let l = sp_load(&mut f, left);
        let v = binary(&mut f, left, BinaryOp::Sub, Value::Inst(l), Value::constant(8, 32));
        sp_store(&mut f, left, v);
        f.set_terminator(left, Terminator::Br(join));
        f.set_terminator(right, Terminator::Br(join));
        sp_load(&mut f, join);
        f.set_terminator(join, Terminator::Ret(None));
        let id = m.add_function(f);
        let before = m.function(id).inst_count();

        assert!(matches!(
            LiftAsmStackPass::default().run(&mut m, id, &arm_context()),
            Err(LiftError::StackDepthMismatch { .. })
        ));
        assert_eq!(m.function(id).inst_count(), before);
    }
}
