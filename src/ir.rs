//! Intermediate representation that lifted machine-code functions are expressed in.
//!
//! A small SSA-shaped IR: instructions produce at most one value and refer to other values
//! directly. Semantic intent that a generic load, store or call cannot express (which CPU-state
//! field is touched, which machine instruction a marker stands for, whether a call is a real
//! subroutine call) lives in a per-function side-table of [`Tags`], keyed by instruction.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use itertools::Itertools;

/// A location in the address space of the program being lifted.
pub type Address = u64;
/// Sentinel for "no address".
pub const BADADDR: Address = u64::MAX;

macro_rules! id_type {
    ($(#[$attr:meta])* $name:ident, $prefix:literal) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

id_type!(
    /// A function within a [`Module`]
    FuncId,
    "@fn"
);
id_type!(
    /// A basic block within a [`Function`]
    BlockId,
    "bb"
);
id_type!(
    /// An instruction within a [`Function`]. Stays valid (but dead) after erasure.
    InstId,
    "%"
);
id_type!(
    /// A named struct type within a [`Module`]
    StructId,
    "%struct"
);

/// Types of IR values. Pointers are opaque; loads name the type they read.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Type {
    Void,
    Int(u32),
    Ptr,
    Struct(StructId),
}

impl Type {
    /// Bit width, for integer types
    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::Int(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Type::Void => write!(f, "void"),
            Type::Int(b) => write!(f, "i{}", b),
            Type::Ptr => write!(f, "ptr"),
            Type::Struct(s) => write!(f, "{:?}", s),
        }
    }
}

/// An operand of an instruction or terminator.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// The result of an instruction
    Inst(InstId),
    /// The `n`th parameter of the enclosing function
    Arg(usize),
    /// An integer constant, kept truncated to `bits`
    Const { value: u64, bits: u32 },
    /// The address of a function
    Func(FuncId),
}

impl Value {
    /// Build a constant of width `bits`, truncating `value` to fit.
    pub fn constant(value: u64, bits: u32) -> Self {
        Value::Const {
            value: truncate(value, bits),
            bits,
        }
    }

    pub fn as_const(&self) -> Option<u64> {
        match self {
            Value::Const { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Sign-extended view of a constant
    pub fn as_signed_const(&self) -> Option<i64> {
        match self {
            Value::Const { value, bits } => Some(sign_extend(*value, *bits)),
            _ => None,
        }
    }

    pub fn as_inst(&self) -> Option<InstId> {
        match self {
            Value::Inst(i) => Some(*i),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::Inst(i) => write!(f, "{:?}", i),
            Value::Arg(n) => write!(f, "%arg{}", n),
            Value::Const { value, bits } => write!(f, "i{} {:#x}", bits, value),
            Value::Func(func) => write!(f, "{:?}", func),
        }
    }
}

pub fn truncate(value: u64, bits: u32) -> u64 {
    if bits >= 64 {
        value
    } else {
        value & ((1u64 << bits) - 1)
    }
}

pub fn sign_extend(value: u64, bits: u32) -> i64 {
    if bits == 0 || bits >= 64 {
        value as i64
    } else {
        let shift = 64 - bits;
        ((value << shift) as i64) >> shift
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    LShr,
    AShr,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum CastOp {
    ZExt,
    SExt,
    Trunc,
    IntToPtr,
    PtrToInt,
}

/// Target of a call
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Callee {
    Direct(FuncId),
    /// A call through a computed function pointer
    Indirect(Value),
}

/// An IR operation. Operands are [`Value`]s; the result type is fixed at insertion time.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Op {
    /// Read a `ty` from `ptr`
    Load { ty: Type, ptr: Value },
    /// Write `value` to `ptr`
    Store { value: Value, ptr: Value },
    Binary {
        op: BinaryOp,
        lhs: Value,
        rhs: Value,
    },
    Cast { op: CastOp, value: Value, to: Type },
    /// Address of a CPU-state field, located by its index path within the CPU-state structure
    CpuFieldPtr { base: Value, path: Vec<u32> },
    /// Address of field `index` of a synthesized stack frame
    FrameFieldPtr { frame: Value, index: usize },
    /// Function-local storage for one `ty`; evaluates to its address
    Alloca { ty: Type },
    Call {
        callee: Callee,
        args: Vec<Value>,
        ret: Type,
    },
    /// Marks the start of an inlined machine instruction. Its `source_address` tag names the
    /// instruction.
    OpcodeStart,
}

impl Op {
    pub fn operands(&self) -> Vec<Value> {
        match self {
            Op::Load { ptr, .. } => vec![*ptr],
            Op::Store { value, ptr } => vec![*value, *ptr],
            Op::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            Op::Cast { value, .. } => vec![*value],
            Op::CpuFieldPtr { base, .. } => vec![*base],
            Op::FrameFieldPtr { frame, .. } => vec![*frame],
            Op::Alloca { .. } | Op::OpcodeStart => vec![],
            Op::Call { callee, args, .. } => {
                let mut r = vec![];
                if let Callee::Indirect(v) = callee {
                    r.push(*v);
                }
                r.extend(args.iter().copied());
                r
            }
        }
    }

    pub fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Op::Load { ptr, .. } => vec![ptr],
            Op::Store { value, ptr } => vec![value, ptr],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Cast { value, .. } => vec![value],
            Op::CpuFieldPtr { base, .. } => vec![base],
            Op::FrameFieldPtr { frame, .. } => vec![frame],
            Op::Alloca { .. } | Op::OpcodeStart => vec![],
            Op::Call { callee, args, .. } => {
                let mut r: Vec<&mut Value> = vec![];
                if let Callee::Indirect(v) = callee {
                    r.push(v);
                }
                r.extend(args.iter_mut());
                r
            }
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Op::Call { .. })
    }
}

/// The single control-flow instruction ending a block.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        then_bb: BlockId,
        else_bb: BlockId,
    },
    /// Multi-way branch on `value`; cases are matched by exact value
    Switch {
        value: Value,
        default: BlockId,
        cases: Vec<(u64, BlockId)>,
    },
    Ret(Option<Value>),
    Unreachable,
}

impl Terminator {
    /// Successor blocks, in the order they appear in the terminator (default first for
    /// switches). May contain duplicates.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Br(b) => vec![*b],
            Terminator::CondBr {
                then_bb, else_bb, ..
            } => vec![*then_bb, *else_bb],
            Terminator::Switch { default, cases, .. } => std::iter::once(*default)
                .chain(cases.iter().map(|(_, b)| *b))
                .collect(),
            Terminator::Ret(_) | Terminator::Unreachable => vec![],
        }
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Terminator::CondBr { cond, .. } => vec![*cond],
            Terminator::Switch { value, .. } => vec![*value],
            Terminator::Ret(Some(v)) => vec![*v],
            Terminator::Br(_) | Terminator::Ret(None) | Terminator::Unreachable => vec![],
        }
    }

    fn operands_mut(&mut self) -> Vec<&mut Value> {
        match self {
            Terminator::CondBr { cond, .. } => vec![cond],
            Terminator::Switch { value, .. } => vec![value],
            Terminator::Ret(Some(v)) => vec![v],
            Terminator::Br(_) | Terminator::Ret(None) | Terminator::Unreachable => vec![],
        }
    }

    /// The target of the case matching `value`, if any
    pub fn find_case(&self, value: u64) -> Option<BlockId> {
        match self {
            Terminator::Switch { cases, .. } => cases
                .iter()
                .find(|(v, _)| *v == value)
                .map(|(_, b)| *b),
            _ => None,
        }
    }
}

/// Provenance tags that passes attach to, and read from, generic instructions.
#[derive(Clone, Default, PartialEq, Eq, Debug)]
pub struct Tags {
    /// Byte offset of the CPU-state field a load or store accesses
    pub env_offset: Option<u64>,
    /// Name of the register a CPU-state access refers to
    pub register: Option<String>,
    /// Machine address an opcode call or opcode marker stands for
    pub source_address: Option<Address>,
    /// The call represents a subroutine call of the lifted program
    pub asm_call: bool,
    /// Cached CPU-state values must not be reused across this store
    pub propagation_barrier: bool,
}

impl Tags {
    fn is_empty(&self) -> bool {
        *self == Tags::default()
    }
}

#[derive(Clone, Debug)]
struct InstData {
    op: Op,
    ty: Type,
    /// `None` once erased
    block: Option<BlockId>,
}

#[derive(Clone, Debug)]
struct BlockData {
    name: String,
    insts: Vec<InstId>,
    terminator: Option<Terminator>,
}

/// Where a value is used
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Use {
    Inst(InstId),
    Terminator(BlockId),
}

/// A function: parameters, an arena of blocks and instructions, and the tag side-table.
#[derive(Clone)]
pub struct Function {
    pub name: String,
    pub params: Vec<Type>,
    pub ret: Type,
    insts: Vec<InstData>,
    blocks: Vec<BlockData>,
    /// Blocks in program order; the first one is the entry block
    layout: Vec<BlockId>,
    tags: UnorderedMap<InstId, Tags>,
}

impl Function {
    pub fn new(name: impl Into<String>, params: Vec<Type>, ret: Type) -> Self {
        Self {
            name: name.into(),
            params,
            ret,
            insts: vec![],
            blocks: vec![],
            layout: vec![],
            tags: Default::default(),
        }
    }

    /// Whether this function only declares a signature (e.g. an external helper)
    pub fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    pub fn add_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(BlockData {
            name: name.into(),
            insts: vec![],
            terminator: None,
        });
        self.layout.push(id);
        id
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.layout.first().copied()
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.layout
    }

    pub fn block_name(&self, b: BlockId) -> &str {
        &self.blocks[b.0].name
    }

    pub fn block_insts(&self, b: BlockId) -> &[InstId] {
        &self.blocks[b.0].insts
    }

    pub fn op(&self, i: InstId) -> &Op {
        &self.insts[i.0].op
    }

    pub fn op_mut(&mut self, i: InstId) -> &mut Op {
        &mut self.insts[i.0].op
    }

    /// Result type of instruction `i` (`void` for stores and void calls)
    pub fn inst_type(&self, i: InstId) -> &Type {
        &self.insts[i.0].ty
    }

    pub fn inst_block(&self, i: InstId) -> Option<BlockId> {
        self.insts[i.0].block
    }

    pub fn is_live(&self, i: InstId) -> bool {
        self.insts[i.0].block.is_some()
    }

    /// Number of live instructions, excluding terminators
    pub fn inst_count(&self) -> usize {
        self.insts.iter().filter(|i| i.block.is_some()).count()
    }

    pub fn value_type(&self, v: Value) -> Type {
        match v {
            Value::Inst(i) => self.insts[i.0].ty.clone(),
            Value::Arg(n) => self.params[n].clone(),
            Value::Const { bits, .. } => Type::Int(bits),
            Value::Func(_) => Type::Ptr,
        }
    }

    fn result_type(&self, op: &Op) -> Type {
        match op {
            Op::Load { ty, .. } => ty.clone(),
            Op::Store { .. } | Op::OpcodeStart => Type::Void,
            Op::Binary { lhs, .. } => self.value_type(*lhs),
            Op::Cast { to, .. } => to.clone(),
            Op::CpuFieldPtr { .. } | Op::FrameFieldPtr { .. } | Op::Alloca { .. } => Type::Ptr,
            Op::Call { ret, .. } => ret.clone(),
        }
    }

    fn new_inst(&mut self, b: BlockId, op: Op) -> InstId {
        let ty = self.result_type(&op);
        let id = InstId(self.insts.len());
        self.insts.push(InstData {
            op,
            ty,
            block: Some(b),
        });
        id
    }

    /// Append `op` to the end of block `b` (before its terminator, if any)
    pub fn append(&mut self, b: BlockId, op: Op) -> InstId {
        let id = self.new_inst(b, op);
        self.blocks[b.0].insts.push(id);
        id
    }

    /// Insert `op` at position `pos` of block `b`
    pub fn insert_at(&mut self, b: BlockId, pos: usize, op: Op) -> InstId {
        let id = self.new_inst(b, op);
        self.blocks[b.0].insts.insert(pos, id);
        id
    }

    /// Insert `op` immediately before the live instruction `before`
    pub fn insert_before(&mut self, before: InstId, op: Op) -> InstId {
        let b = self.insts[before.0]
            .block
            .expect("Cannot insert before an erased instruction");
        let pos = self.position_in_block(before).unwrap();
        self.insert_at(b, pos, op)
    }

    /// Insert `op` immediately after the live instruction `after`
    pub fn insert_after(&mut self, after: InstId, op: Op) -> InstId {
        let b = self.insts[after.0]
            .block
            .expect("Cannot insert after an erased instruction");
        let pos = self.position_in_block(after).unwrap();
        self.insert_at(b, pos + 1, op)
    }

    pub fn position_in_block(&self, i: InstId) -> Option<usize> {
        let b = self.insts[i.0].block?;
        self.blocks[b.0].insts.iter().position(|&x| x == i)
    }

    /// Remove `i` from its block. Its result must no longer be used.
    pub fn erase(&mut self, i: InstId) {
        debug_assert!(
            self.uses_of(i).is_empty(),
            "Erasing {:?} which still has uses {:?}",
            i,
            self.uses_of(i)
        );
        if let Some(b) = self.insts[i.0].block.take() {
            self.blocks[b.0].insts.retain(|&x| x != i);
        }
        self.tags.remove(&i);
    }

    pub fn uses_of(&self, i: InstId) -> Vec<Use> {
        let v = Value::Inst(i);
        let mut r = vec![];
        for &b in &self.layout {
            for &u in &self.blocks[b.0].insts {
                if self.insts[u.0].op.operands().contains(&v) {
                    r.push(Use::Inst(u));
                }
            }
            if let Some(t) = &self.blocks[b.0].terminator {
                if t.operands().contains(&v) {
                    r.push(Use::Terminator(b));
                }
            }
        }
        r
    }

    /// Rewrite every use of `i`'s result (in instructions and terminators) to use `with`
    pub fn replace_all_uses_with(&mut self, i: InstId, with: Value) {
        let old = Value::Inst(i);
        for inst in self.insts.iter_mut().filter(|x| x.block.is_some()) {
            for v in inst.op.operands_mut() {
                if *v == old {
                    *v = with;
                }
            }
        }
        for block in self.blocks.iter_mut() {
            if let Some(t) = &mut block.terminator {
                for v in t.operands_mut() {
                    if *v == old {
                        *v = with;
                    }
                }
            }
        }
    }

    pub fn terminator(&self, b: BlockId) -> Option<&Terminator> {
        self.blocks[b.0].terminator.as_ref()
    }

    pub fn terminator_mut(&mut self, b: BlockId) -> Option<&mut Terminator> {
        self.blocks[b.0].terminator.as_mut()
    }

    /// Set the terminator of `b`, returning the previous one
    pub fn set_terminator(&mut self, b: BlockId, t: Terminator) -> Option<Terminator> {
        self.blocks[b.0].terminator.replace(t)
    }

    /// Distinct successors of `b`, in terminator order
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        self.terminator(b)
            .map(|t| t.successors().into_iter().unique().collect())
            .unwrap_or_default()
    }

    /// Distinct predecessors of `b`, in layout order
    pub fn predecessors(&self, b: BlockId) -> Vec<BlockId> {
        self.layout
            .iter()
            .copied()
            .filter(|&p| self.successors(p).contains(&b))
            .collect()
    }

    pub fn tags(&self, i: InstId) -> Option<&Tags> {
        self.tags.get(&i)
    }

    pub fn tags_mut(&mut self, i: InstId) -> &mut Tags {
        self.tags.entry(i).or_default()
    }

    pub fn set_tags(&mut self, i: InstId, tags: Tags) {
        if tags.is_empty() {
            self.tags.remove(&i);
        } else {
            self.tags.insert(i, tags);
        }
    }

    /// CPU-state offset tag of `i`, if it has one
    pub fn env_offset(&self, i: InstId) -> Option<u64> {
        self.tags(i).and_then(|t| t.env_offset)
    }

    pub fn is_asm_call(&self, i: InstId) -> bool {
        self.tags(i).map_or(false, |t| t.asm_call)
    }

    pub fn is_propagation_barrier(&self, i: InstId) -> bool {
        self.tags(i).map_or(false, |t| t.propagation_barrier)
    }

    pub fn source_address(&self, i: InstId) -> Option<Address> {
        self.tags(i).and_then(|t| t.source_address)
    }

    /// Whether `i` is a load from the CPU-state field at `offset`
    pub fn is_env_load_of(&self, i: InstId, offset: u64) -> bool {
        matches!(self.op(i), Op::Load { .. }) && self.env_offset(i) == Some(offset)
    }

    /// Whether `i` is a store to the CPU-state field at `offset`
    pub fn is_env_store_of(&self, i: InstId, offset: u64) -> bool {
        matches!(self.op(i), Op::Store { .. }) && self.env_offset(i) == Some(offset)
    }

    /// Check structural well-formedness of the function.
    pub fn verify(&self) -> Result<(), String> {
        let mut seen: UnorderedSet<InstId> = Default::default();
        let laid_out: UnorderedSet<BlockId> = self.layout.iter().copied().collect();
        if laid_out.len() != self.layout.len() {
            return Err(format!("Block layout of {} has duplicates", self.name));
        }
        let check_operand = |user: &str, pos: Option<usize>, b: BlockId, v: Value| match v {
            Value::Inst(d) => {
                let def = &self.insts[d.0];
                match def.block {
                    None => Err(format!("{} uses erased instruction {:?}", user, d)),
                    Some(db) if db == b => match (self.position_in_block(d), pos) {
                        (Some(dp), Some(up)) if dp >= up => Err(format!(
                            "{} uses {:?} before its definition in {}",
                            user,
                            d,
                            self.block_name(b)
                        )),
                        _ => Ok(()),
                    },
                    Some(db) if !laid_out.contains(&db) => Err(format!(
                        "{} uses {:?} from a block outside the function",
                        user, d
                    )),
                    Some(_) => Ok(()),
                }
            }
            Value::Arg(n) if n >= self.params.len() => {
                Err(format!("{} uses nonexistent argument {}", user, n))
            }
            _ => Ok(()),
        };
        for &b in &self.layout {
            let block = &self.blocks[b.0];
            for (pos, &i) in block.insts.iter().enumerate() {
                if !seen.insert(i) {
                    return Err(format!("{:?} appears in more than one place", i));
                }
                if self.insts[i.0].block != Some(b) {
                    return Err(format!(
                        "{:?} is listed in {} but belongs elsewhere",
                        i, block.name
                    ));
                }
                for v in self.insts[i.0].op.operands() {
                    check_operand(&format!("{:?}", i), Some(pos), b, v)?;
                }
            }
            let term = block
                .terminator
                .as_ref()
                .ok_or_else(|| format!("Block {} has no terminator", block.name))?;
            for v in term.operands() {
                check_operand(&format!("terminator of {}", block.name), None, b, v)?;
            }
            for s in term.successors() {
                if !laid_out.contains(&s) {
                    return Err(format!(
                        "Terminator of {} branches to {:?} outside the function",
                        block.name, s
                    ));
                }
            }
            if let Terminator::Switch { cases, .. } = term {
                if let Some((v, _)) = cases.iter().duplicates_by(|(v, _)| *v).next() {
                    return Err(format!(
                        "Switch in {} has duplicate case value {:#x}",
                        block.name, v
                    ));
                }
            }
        }
        let live = self.insts.iter().filter(|i| i.block.is_some()).count();
        if live != seen.len() {
            return Err(format!(
                "{} live instructions, but only {} placed in blocks",
                live,
                seen.len()
            ));
        }
        Ok(())
    }
}

/// A packed struct type synthesized during lifting (e.g. a stack frame).
#[derive(Clone, Debug)]
pub struct StructType {
    pub name: String,
    pub fields: Vec<Type>,
    pub packed: bool,
}

/// Owns all functions and named types produced during a lifting session.
#[derive(Default)]
pub struct Module {
    pub name: String,
    functions: Vec<Function>,
    by_name: UnorderedMap<String, FuncId>,
    structs: Vec<StructType>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add `f`, which must have a name not yet present in the module
    pub fn add_function(&mut self, f: Function) -> FuncId {
        assert!(
            !self.by_name.contains_key(&f.name),
            "Function {} already exists",
            f.name
        );
        let id = FuncId(self.functions.len());
        self.by_name.insert(f.name.clone(), id);
        self.functions.push(f);
        id
    }

    /// Look up the function named `name`, declaring it with the given signature if it does not
    /// exist yet.
    pub fn get_or_insert_function(&mut self, name: &str, params: Vec<Type>, ret: Type) -> FuncId {
        match self.lookup(name) {
            Some(id) => id,
            None => self.add_function(Function::new(name, params, ret)),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<FuncId> {
        self.by_name.get(name).copied()
    }

    pub fn function(&self, id: FuncId) -> &Function {
        &self.functions[id.0]
    }

    pub fn function_mut(&mut self, id: FuncId) -> &mut Function {
        &mut self.functions[id.0]
    }

    pub fn function_ids(&self) -> impl Iterator<Item = FuncId> {
        (0..self.functions.len()).map(FuncId)
    }

    pub fn add_struct(&mut self, name: impl Into<String>, fields: Vec<Type>, packed: bool) -> StructId {
        let id = StructId(self.structs.len());
        self.structs.push(StructType {
            name: name.into(),
            fields,
            packed,
        });
        id
    }

    pub fn struct_type(&self, id: StructId) -> &StructType {
        &self.structs[id.0]
    }

    /// Size in bytes of a value of type `ty`, if it has one
    pub fn type_size(&self, ty: &Type, pointer_size: usize) -> Option<usize> {
        match ty {
            Type::Void => None,
            Type::Int(b) => Some((*b as usize + 7) / 8),
            Type::Ptr => Some(pointer_size),
            Type::Struct(s) => self.structs[s.0]
                .fields
                .iter()
                .map(|f| self.type_size(f, pointer_size))
                .sum(),
        }
    }

    /// Debug-printable view of a function that resolves callee names.
    pub fn debug_function(&self, id: FuncId) -> DebugFunction<'_> {
        DebugFunction { module: self, id }
    }
}

/// See [`Module::debug_function`]
pub struct DebugFunction<'a> {
    module: &'a Module,
    id: FuncId,
}

impl<'a> DebugFunction<'a> {
    fn value(&self, v: Value) -> String {
        match v {
            Value::Func(f) => format!("@{}", self.module.function(f).name),
            v => format!("{:?}", v),
        }
    }
}

impl<'a> DebugFunction<'a> {
    /// Write the listing of block `b`: its instructions and terminator, one per line
    pub fn write_block(&self, f: &mut dyn std::fmt::Write, b: BlockId) -> std::fmt::Result {
        let func = self.module.function(self.id);
        for &i in func.block_insts(b) {
            let body = match func.op(i) {
                Op::Load { ty, ptr } => format!("load {:?}, {}", ty, self.value(*ptr)),
                Op::Store { value, ptr } => {
                    format!("store {}, {}", self.value(*value), self.value(*ptr))
                }
                Op::Binary { op, lhs, rhs } => format!(
                    "{} {}, {}",
                    format!("{:?}", op).to_lowercase(),
                    self.value(*lhs),
                    self.value(*rhs)
                ),
                Op::Cast { op, value, to } => format!(
                    "{} {} to {:?}",
                    format!("{:?}", op).to_lowercase(),
                    self.value(*value),
                    to
                ),
                Op::CpuFieldPtr { base, path } => format!(
                    "cpufield {}, [{}]",
                    self.value(*base),
                    path.iter().join(", ")
                ),
                Op::FrameFieldPtr { frame, index } => {
                    format!("framefield {}, {}", self.value(*frame), index)
                }
                Op::Alloca { ty } => match ty {
                    Type::Struct(s) => {
                        let st = self.module.struct_type(*s);
                        format!(
                            "alloca %{} <{{ {} }}>",
                            st.name,
                            st.fields.iter().map(|t| format!("{:?}", t)).join(", ")
                        )
                    }
                    ty => format!("alloca {:?}", ty),
                },
                Op::Call { callee, args, ret } => format!(
                    "call {:?} {}({})",
                    ret,
                    match callee {
                        Callee::Direct(c) => format!("@{}", self.module.function(*c).name),
                        Callee::Indirect(v) => self.value(*v),
                    },
                    args.iter().map(|a| self.value(*a)).join(", ")
                ),
                Op::OpcodeStart => "opcode_start".to_string(),
            };
            if *func.inst_type(i) == Type::Void {
                write!(f, "  {}", body)?;
            } else {
                write!(f, "  {:?} = {}", i, body)?;
            }
            if let Some(t) = func.tags(i) {
                if let Some(o) = t.env_offset {
                    write!(f, " !env_offset={:#x}", o)?;
                }
                if let Some(r) = &t.register {
                    write!(f, " !register={}", r)?;
                }
                if let Some(a) = t.source_address {
                    write!(f, " !pc={:#x}", a)?;
                }
                if t.asm_call {
                    write!(f, " !asm_call")?;
                }
                if t.propagation_barrier {
                    write!(f, " !value_propagation_barrier")?;
                }
            }
            writeln!(f)?;
        }
        match func.terminator(b) {
            None => writeln!(f, "  <no terminator>")?,
            Some(Terminator::Br(t)) => writeln!(f, "  br {:?}", t)?,
            Some(Terminator::CondBr {
                cond,
                then_bb,
                else_bb,
            }) => writeln!(
                f,
                "  br {}, {:?}, {:?}",
                self.value(*cond),
                then_bb,
                else_bb
            )?,
            Some(Terminator::Switch {
                value,
                default,
                cases,
            }) => writeln!(
                f,
                "  switch {}, {:?} [{}]",
                self.value(*value),
                default,
                cases
                    .iter()
                    .map(|(v, b)| format!("{:#x} -> {:?}", v, b))
                    .join(", ")
            )?,
            Some(Terminator::Ret(v)) => match v {
                Some(v) => writeln!(f, "  ret {}", self.value(*v))?,
                None => writeln!(f, "  ret void")?,
            },
            Some(Terminator::Unreachable) => writeln!(f, "  unreachable")?,
        }
        Ok(())
    }

    pub fn block_listing(&self, b: BlockId) -> String {
        let mut s = String::new();
        self.write_block(&mut s, b)
            .expect("Writing to a String cannot fail");
        s
    }
}

impl<'a> std::fmt::Debug for DebugFunction<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let func = self.module.function(self.id);
        let params = func
            .params
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{:?} %arg{}", t, i))
            .join(", ");
        if func.is_declaration() {
            return writeln!(f, "declare {:?} @{}({})", func.ret, func.name, params);
        }
        writeln!(f, "define {:?} @{}({}) {{", func.ret, func.name, params)?;
        for &b in func.blocks() {
            writeln!(f, "{:?} \"{}\":", b, func.block_name(b))?;
            self.write_block(f, b)?;
        }
        writeln!(f, "}}")
    }
}
