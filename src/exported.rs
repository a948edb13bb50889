//! Reader for exported-program files, and a code generator driven by their per-instruction
//! micro-op listings.
//!
//! An exported program carries everything a lifting session needs from the outside world: the
//! processor description, the CPU-state register layout, and for every function its basic
//! blocks and instructions. Each instruction is described by a short list of micro-ops, which
//! [`ScriptedCodeGenerator`] turns into the same kind of per-instruction IR function (with the
//! same provenance tags) that a full instruction translator would produce.

use std::rc::Rc;

use crate::backend::{
    library_name, BackendRegistry, CodeFlags, CodeGenerator, ErrorHandler, RegisterInfo,
    MEMORY_LOAD_HELPER, MEMORY_STORE_HELPER, REQUIRED_ENTRY_POINTS,
};
use crate::containers::unordered::UnorderedMap;
use crate::disassembly::{Endian, Processor, ProcessorInfo, StaticBlock, StaticDisassembly};
use crate::error::LiftError;
use crate::ir::{
    Address, BinaryOp, Callee, CastOp, FuncId, Function, Module, Op, Tags, Terminator, Type,
    Value,
};
use crate::log::*;

/// Operand of a micro-op
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Operand {
    /// A temporary defined by an earlier micro-op of the same instruction
    Temp(usize),
    /// An integer literal, with an explicit width if one was given
    Literal { value: u64, bits: Option<u32> },
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MicroOp {
    Get { dst: usize, reg: String },
    Set { reg: String, value: Operand },
    Binary { dst: usize, op: BinaryOp, lhs: Operand, rhs: Operand },
    Cast { dst: usize, op: CastOp, value: Operand, bits: u32 },
    Load { dst: usize, addr: Operand, shift: u32 },
    Store { addr: Operand, shift: u32, value: Operand },
}

#[derive(Clone, Debug)]
struct ScriptedInstruction {
    thumb: bool,
    /// Address execution continues at if the instruction does not write the program counter
    fallthrough: Address,
    ops: Vec<MicroOp>,
}

/// A parsed exported program
pub struct ExportedProgram {
    pub name: String,
    pub disassembly: StaticDisassembly,
    pub generator: ScriptedCodeGenerator,
}

impl ExportedProgram {
    /// A registry providing this program's generator under the library name of its processor
    pub fn registry(&self) -> BackendRegistry {
        let mut registry = BackendRegistry::new();
        match library_name(&self.generator.processor) {
            Ok(library) => {
                let generator = self.generator.clone();
                registry.register(library, move || {
                    Box::new(generator.clone()) as Box<dyn CodeGenerator>
                });
            }
            Err(e) => warn!("No code generator available"; "reason" => %e),
        }
        registry
    }
}

/// Translates instructions from their micro-op listing.
#[derive(Clone)]
pub struct ScriptedCodeGenerator {
    processor: Processor,
    address_bits: u32,
    registers: Vec<RegisterInfo>,
    pc: Option<usize>,
    sp: Option<usize>,
    instructions: UnorderedMap<Address, ScriptedInstruction>,
    error_handler: Option<Rc<dyn Fn(&str)>>,
}

impl ScriptedCodeGenerator {
    fn raise(&self, msg: &str) {
        match &self.error_handler {
            Some(h) => h(msg),
            None => warn!("Code generator error"; "message" => msg),
        }
    }

    fn register(&self, name: &str) -> Option<&RegisterInfo> {
        self.registers.iter().find(|r| r.name == name)
    }

    fn translate(
        &self,
        module: &Module,
        name: String,
        insn: &ScriptedInstruction,
    ) -> Result<Function, String> {
        let load_helper = module
            .lookup(MEMORY_LOAD_HELPER)
            .ok_or("Memory helpers not declared; was the generator initialized?")?;
        let store_helper = module
            .lookup(MEMORY_STORE_HELPER)
            .ok_or("Memory helpers not declared; was the generator initialized?")?;

        let mut f = Function::new(name, vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let env = Value::Arg(0);
        let mut temps: UnorderedMap<usize, Value> = Default::default();

        let operand = |temps: &UnorderedMap<usize, Value>,
                       o: Operand,
                       default_bits: u32|
         -> Result<Value, String> {
            match o {
                Operand::Temp(t) => temps
                    .get(&t)
                    .copied()
                    .ok_or_else(|| format!("Use of undefined temporary %{}", t)),
                Operand::Literal { value, bits } => {
                    Ok(Value::constant(value, bits.unwrap_or(default_bits)))
                }
            }
        };
        // Width of a temporary operand, if any, used to size literals next to it
        let width_of = |f: &Function, temps: &UnorderedMap<usize, Value>, o: Operand| match o {
            Operand::Temp(t) => temps.get(&t).and_then(|v| f.value_type(*v).int_bits()),
            Operand::Literal { bits, .. } => bits,
        };
        let resize = |f: &mut Function, v: Value, bits: u32| -> Value {
            match f.value_type(v).int_bits() {
                Some(have) if have < bits => Value::Inst(f.append(
                    b,
                    Op::Cast {
                        op: CastOp::ZExt,
                        value: v,
                        to: Type::Int(bits),
                    },
                )),
                Some(have) if have > bits => Value::Inst(f.append(
                    b,
                    Op::Cast {
                        op: CastOp::Trunc,
                        value: v,
                        to: Type::Int(bits),
                    },
                )),
                _ => v,
            }
        };

        let mut writes_pc = false;
        for op in &insn.ops {
            match op {
                MicroOp::Get { dst, reg } => {
                    let r = self
                        .register(reg)
                        .ok_or_else(|| format!("Unknown register {}", reg))?;
                    let p = f.append(
                        b,
                        Op::CpuFieldPtr {
                            base: env,
                            path: r.path.clone(),
                        },
                    );
                    let l = f.append(
                        b,
                        Op::Load {
                            ty: Type::Int(r.bits),
                            ptr: Value::Inst(p),
                        },
                    );
                    f.set_tags(l, register_tags(r));
                    temps.insert(*dst, Value::Inst(l));
                }
                MicroOp::Set { reg, value } => {
                    let r = self
                        .register(reg)
                        .ok_or_else(|| format!("Unknown register {}", reg))?;
                    writes_pc |= Some(r) == self.pc.map(|i| &self.registers[i]);
                    let v = operand(&temps, *value, r.bits)?;
                    let v = resize(&mut f, v, r.bits);
                    let p = f.append(
                        b,
                        Op::CpuFieldPtr {
                            base: env,
                            path: r.path.clone(),
                        },
                    );
                    let s = f.append(
                        b,
                        Op::Store {
                            value: v,
                            ptr: Value::Inst(p),
                        },
                    );
                    f.set_tags(s, register_tags(r));
                }
                MicroOp::Binary { dst, op, lhs, rhs } => {
                    let bits = width_of(&f, &temps, *lhs)
                        .or_else(|| width_of(&f, &temps, *rhs))
                        .unwrap_or(self.address_bits);
                    let l = operand(&temps, *lhs, bits)?;
                    let r = operand(&temps, *rhs, bits)?;
                    let r = resize(&mut f, r, bits);
                    let i = f.append(
                        b,
                        Op::Binary {
                            op: *op,
                            lhs: l,
                            rhs: r,
                        },
                    );
                    temps.insert(*dst, Value::Inst(i));
                }
                MicroOp::Cast {
                    dst,
                    op,
                    value,
                    bits,
                } => {
                    let v = operand(&temps, *value, self.address_bits)?;
                    let i = f.append(
                        b,
                        Op::Cast {
                            op: *op,
                            value: v,
                            to: Type::Int(*bits),
                        },
                    );
                    temps.insert(*dst, Value::Inst(i));
                }
                MicroOp::Load { dst, addr, shift } => {
                    let a = operand(&temps, *addr, self.address_bits)?;
                    let i = f.append(
                        b,
                        Op::Call {
                            callee: Callee::Direct(load_helper),
                            args: vec![
                                env,
                                a,
                                Value::constant(*shift as u64, 32),
                                Value::constant(0, 32),
                            ],
                            ret: Type::Int(64),
                        },
                    );
                    temps.insert(*dst, Value::Inst(i));
                }
                MicroOp::Store { addr, shift, value } => {
                    let a = operand(&temps, *addr, self.address_bits)?;
                    let v = operand(&temps, *value, 8 << *shift)?;
                    let v = resize(&mut f, v, 64);
                    f.append(
                        b,
                        Op::Call {
                            callee: Callee::Direct(store_helper),
                            args: vec![
                                env,
                                a,
                                Value::constant(*shift as u64, 32),
                                Value::constant(0, 32),
                                v,
                            ],
                            ret: Type::Void,
                        },
                    );
                }
            }
        }

        if !writes_pc {
            if let Some(pc) = self.pc.map(|i| &self.registers[i]) {
                let p = f.append(
                    b,
                    Op::CpuFieldPtr {
                        base: env,
                        path: pc.path.clone(),
                    },
                );
                let s = f.append(
                    b,
                    Op::Store {
                        value: Value::constant(insn.fallthrough, pc.bits),
                        ptr: Value::Inst(p),
                    },
                );
                f.set_tags(s, register_tags(pc));
            }
        }
        f.set_terminator(b, Terminator::Ret(None));
        f.verify()?;
        Ok(f)
    }
}

fn register_tags(r: &RegisterInfo) -> Tags {
    Tags {
        env_offset: Some(r.offset),
        register: Some(r.name.clone()),
        ..Default::default()
    }
}

impl CodeGenerator for ScriptedCodeGenerator {
    fn entry_points(&self) -> Vec<&'static str> {
        REQUIRED_ENTRY_POINTS.to_vec()
    }

    fn init(&mut self, module: &mut Module) -> Result<(), LiftError> {
        let addr = Type::Int(self.address_bits);
        module.get_or_insert_function(
            MEMORY_LOAD_HELPER,
            vec![Type::Ptr, addr.clone(), Type::Int(32), Type::Int(32)],
            Type::Int(64),
        );
        module.get_or_insert_function(
            MEMORY_STORE_HELPER,
            vec![Type::Ptr, addr, Type::Int(32), Type::Int(32), Type::Int(64)],
            Type::Void,
        );
        Ok(())
    }

    fn gen_intermediate_code(
        &mut self,
        module: &mut Module,
        addr: Address,
        flags: CodeFlags,
        _single_instruction: bool,
    ) -> Option<FuncId> {
        let insn = match self.instructions.get(&addr) {
            Some(i) => i,
            None => {
                self.raise(&format!("No instruction at {:#x}", addr));
                return None;
            }
        };
        if insn.thumb != flags.thumb {
            self.raise(&format!(
                "Instruction at {:#x} decoded with the wrong thumb flag",
                addr
            ));
            return None;
        }
        let name = format!(
            "opcode_{:x}{}",
            addr,
            if flags.thumb { "_thumb" } else { "" }
        );
        if let Some(f) = module.lookup(&name) {
            return Some(f);
        }
        match self.translate(module, name, insn) {
            Ok(f) => Some(module.add_function(f)),
            Err(msg) => {
                self.raise(&format!("Translation of {:#x} failed: {}", addr, msg));
                None
            }
        }
    }

    fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(Rc::from(handler));
    }

    fn target_name(&self) -> String {
        self.processor.name().to_string()
    }

    fn register_by_name(&self, name: &str) -> Option<RegisterInfo> {
        self.register(name).cloned()
    }

    fn register_by_offset(&self, offset: u64) -> Option<RegisterInfo> {
        self.registers.iter().find(|r| r.offset == offset).cloned()
    }

    fn pc_register(&self) -> Option<RegisterInfo> {
        self.pc.map(|i| self.registers[i].clone())
    }

    fn sp_register(&self) -> Option<RegisterInfo> {
        self.sp.map(|i| self.registers[i].clone())
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> LiftError {
    LiftError::Parse {
        line,
        message: message.into(),
    }
}

fn parse_hex(line: usize, s: &str) -> Result<u64, LiftError> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .map_err(|_| parse_error(line, format!("Expected hex address, got {:?}", s)))
}

fn parse_num<T: std::str::FromStr>(line: usize, s: &str) -> Result<T, LiftError> {
    s.parse()
        .map_err(|_| parse_error(line, format!("Expected number, got {:?}", s)))
}

fn parse_temp(line: usize, s: &str) -> Result<usize, LiftError> {
    s.strip_prefix('%')
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| parse_error(line, format!("Expected temporary, got {:?}", s)))
}

fn parse_operand(line: usize, s: &str) -> Result<Operand, LiftError> {
    if s.starts_with('%') {
        return Ok(Operand::Temp(parse_temp(line, s)?));
    }
    let (lit, bits) = match s.split_once(':') {
        Some((l, b)) => (l, Some(parse_num(line, b)?)),
        None => (s, None),
    };
    let value = if let Some(h) = lit.strip_prefix("0x") {
        u64::from_str_radix(h, 16).ok()
    } else if let Some(d) = lit.strip_prefix('-') {
        d.parse::<u64>().ok().map(|v| v.wrapping_neg())
    } else {
        lit.parse().ok()
    };
    let value = value.ok_or_else(|| parse_error(line, format!("Expected operand, got {:?}", s)))?;
    Ok(Operand::Literal { value, bits })
}

fn parse_binop(s: &str) -> Option<BinaryOp> {
    Some(match s {
        "add" => BinaryOp::Add,
        "sub" => BinaryOp::Sub,
        "mul" => BinaryOp::Mul,
        "and" => BinaryOp::And,
        "or" => BinaryOp::Or,
        "xor" => BinaryOp::Xor,
        "shl" => BinaryOp::Shl,
        "lshr" => BinaryOp::LShr,
        "ashr" => BinaryOp::AShr,
        _ => return None,
    })
}

fn parse_micro_op(line: usize, text: &str) -> Result<MicroOp, LiftError> {
    let words: Vec<&str> = text.split_whitespace().collect();
    Ok(match &*words {
        ["set", reg, v] => MicroOp::Set {
            reg: reg.to_string(),
            value: parse_operand(line, v)?,
        },
        ["st", a, shift, v] => MicroOp::Store {
            addr: parse_operand(line, a)?,
            shift: parse_num(line, shift)?,
            value: parse_operand(line, v)?,
        },
        [dst, "=", rest @ ..] => {
            let dst = parse_temp(line, dst)?;
            match rest {
                ["get", reg] => MicroOp::Get {
                    dst,
                    reg: reg.to_string(),
                },
                ["ld", a, shift] => MicroOp::Load {
                    dst,
                    addr: parse_operand(line, a)?,
                    shift: parse_num(line, shift)?,
                },
                [cast @ ("zext" | "sext" | "trunc"), v, bits] => MicroOp::Cast {
                    dst,
                    op: match *cast {
                        "zext" => CastOp::ZExt,
                        "sext" => CastOp::SExt,
                        _ => CastOp::Trunc,
                    },
                    value: parse_operand(line, v)?,
                    bits: parse_num(line, bits)?,
                },
                [op, a, b2] => MicroOp::Binary {
                    dst,
                    op: parse_binop(op)
                        .ok_or_else(|| parse_error(line, format!("Unknown operation {:?}", op)))?,
                    lhs: parse_operand(line, a)?,
                    rhs: parse_operand(line, b2)?,
                },
                _ => return Err(parse_error(line, format!("Malformed micro-op {:?}", text))),
            }
        }
        _ => return Err(parse_error(line, format!("Malformed micro-op {:?}", text))),
    })
}

/// Split `text` into blank-line separated sections of numbered, trimmed, non-comment lines
fn sections(text: &str) -> Vec<Vec<(usize, &str)>> {
    let mut r: Vec<Vec<(usize, &str)>> = vec![vec![]];
    for (i, l) in text.lines().enumerate() {
        let l = l.split('#').next().unwrap_or("").trim();
        if l.is_empty() {
            if !r.last().map_or(true, |s| s.is_empty()) {
                r.push(vec![]);
            }
        } else if let Some(s) = r.last_mut() {
            s.push((i + 1, l));
        }
    }
    r.retain(|s| !s.is_empty());
    r
}

/// Parse the contents of an exported-program file.
pub fn parse(text: &str, name: &str) -> Result<ExportedProgram, LiftError> {
    let sections = sections(text);
    let mut sections = sections.iter();

    let program = sections
        .next()
        .filter(|s| s[0].1 == "PROGRAM")
        .ok_or_else(|| parse_error(1, "Expected PROGRAM section"))?;
    let mut processor = None;
    let mut endianness = Endian::Little;
    let mut address_bits = 32;
    for &(ln, l) in &program[1..] {
        match &*l.split_whitespace().collect::<Vec<_>>() {
            ["processor", p] => processor = Some(Processor::from_name(p)),
            ["big_endian", "false"] => endianness = Endian::Little,
            ["big_endian", "true"] => endianness = Endian::Big,
            ["address_bits", b] => address_bits = parse_num(ln, b)?,
            _ => return Err(parse_error(ln, format!("Unexpected {:?}", l))),
        }
    }
    let processor = processor.ok_or_else(|| parse_error(program[0].0, "Missing processor"))?;

    let registers_section = sections
        .next()
        .filter(|s| s[0].1 == "REGISTERS")
        .ok_or_else(|| parse_error(program[0].0, "Expected REGISTERS section"))?;
    let mut registers = vec![];
    let (mut pc, mut sp) = (None, None);
    for &(ln, l) in &registers_section[1..] {
        let words: Vec<&str> = l.split_whitespace().collect();
        let (reg, role) = match &*words {
            [reg, offset, bits] => ((reg, offset, bits), None),
            [reg, offset, bits, role] => ((reg, offset, bits), Some(*role)),
            _ => return Err(parse_error(ln, format!("Malformed register {:?}", l))),
        };
        let idx = registers.len();
        match role {
            Some("pc") => pc = Some(idx),
            Some("sp") => sp = Some(idx),
            Some("lr") | None => {}
            Some(r) => return Err(parse_error(ln, format!("Unknown register role {:?}", r))),
        }
        registers.push(RegisterInfo {
            name: reg.0.to_string(),
            offset: parse_num(ln, reg.1)?,
            bits: parse_num(ln, reg.2)?,
            path: vec![idx as u32],
        });
    }

    let mut disassembly = StaticDisassembly::new(ProcessorInfo {
        processor: processor.clone(),
        endianness,
        address_bits,
    });
    let mut instructions = UnorderedMap::new();
    for section in sections {
        let (ln, header) = section[0];
        let (fstart, fname, fend) = match &*header.split_whitespace().collect::<Vec<_>>() {
            ["FUNCTION", start, name, end] => (parse_hex(ln, start)?, *name, parse_hex(ln, end)?),
            _ => return Err(parse_error(ln, format!("Expected FUNCTION, got {:?}", header))),
        };
        // Successors by block index until all blocks are known
        let mut blocks: Vec<(StaticBlock, Vec<(usize, usize)>)> = vec![];
        let mut insns: Vec<(Address, usize, ScriptedInstruction)> = vec![];
        for &(ln, l) in &section[1..] {
            let words: Vec<&str> = l.split_whitespace().collect();
            match &*words {
                ["BLOCK", start, end, rest @ ..] => {
                    let succs = match rest {
                        [] => vec![],
                        ["->", idxs @ ..] => idxs
                            .iter()
                            .map(|i| Ok((ln, parse_num(ln, i)?)))
                            .collect::<Result<Vec<_>, LiftError>>()?,
                        _ => return Err(parse_error(ln, format!("Malformed block {:?}", l))),
                    };
                    blocks.push((
                        StaticBlock {
                            start: parse_hex(ln, start)?,
                            end: parse_hex(ln, end)?,
                            succs: vec![],
                        },
                        succs,
                    ));
                }
                ["INSN", addr, flags @ ..] => {
                    let block = blocks
                        .len()
                        .checked_sub(1)
                        .ok_or_else(|| parse_error(ln, "Instruction outside of a block"))?;
                    let thumb = match flags {
                        [] => false,
                        ["thumb"] => true,
                        _ => return Err(parse_error(ln, format!("Malformed instruction {:?}", l))),
                    };
                    insns.push((
                        parse_hex(ln, addr)?,
                        block,
                        ScriptedInstruction {
                            thumb,
                            fallthrough: 0,
                            ops: vec![],
                        },
                    ));
                }
                _ => {
                    let insn = insns
                        .last_mut()
                        .ok_or_else(|| parse_error(ln, "Micro-op outside of an instruction"))?;
                    insn.2.ops.push(parse_micro_op(ln, l)?);
                }
            }
        }
        let starts: Vec<Address> = blocks.iter().map(|(b, _)| b.start).collect();
        let blocks: Vec<StaticBlock> = blocks
            .into_iter()
            .map(|(mut b, succs)| {
                b.succs = succs
                    .into_iter()
                    .map(|(ln, i)| {
                        starts.get(i).copied().ok_or_else(|| {
                            parse_error(ln, format!("Successor index {} out of range", i))
                        })
                    })
                    .collect::<Result<_, _>>()?;
                Ok(b)
            })
            .collect::<Result<_, LiftError>>()?;
        for i in 0..insns.len() {
            let addr = insns[i].0;
            let block = insns[i].1;
            let fallthrough = match insns.get(i + 1) {
                Some((next, nb, _)) if *nb == block => *next,
                _ => blocks[block].end,
            };
            let (_, _, mut insn) = insns[i].clone();
            insn.fallthrough = fallthrough;
            disassembly.add_instruction(addr, insn.thumb);
            instructions.insert(addr, insn);
        }
        if blocks.is_empty() {
            return Err(parse_error(ln, format!("Function {} has no blocks", fname)));
        }
        if blocks[0].start != fstart {
            return Err(parse_error(
                ln,
                format!("Function {} must begin with its entry block", fname),
            ));
        }
        disassembly.add_function(fname, fstart, fend, blocks);
    }
    debug!(
        "Parsed exported program";
        "name" => name,
        "processor" => processor.name(),
        "functions" => disassembly.functions().count(),
        "instructions" => instructions.len(),
    );

    Ok(ExportedProgram {
        name: name.to_string(),
        disassembly,
        generator: ScriptedCodeGenerator {
            processor,
            address_bits,
            registers,
            pc,
            sp,
            instructions,
            error_handler: None,
        },
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disassembly::Disassembly;

    const SMALL: &str = "
PROGRAM
processor arm
big_endian false
address_bits 32

REGISTERS
r0 0 32
sp 52 32 sp
lr 56 32 lr
pc 60 32 pc

FUNCTION 100 small 110
BLOCK 100 108 -> 1
INSN 100
  %0 = get sp
  %1 = sub %0 8
  set sp %1
INSN 104
  %0 = get r0
  st %0 2 0x2a
BLOCK 108 10c
INSN 108 thumb
  set pc 0x200
";

    #[test]
    fn parses_layout_and_registers() {
        let p = parse(SMALL, "small").unwrap();
        let d = &p.disassembly;
        assert_eq!(d.processor().processor, Processor::Arm);
        let blocks = d.basic_blocks(0x100, 0x110);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].succs, vec![1]);
        assert!(d.is_thumb(0x108));
        assert_eq!(p.generator.sp_register().unwrap().offset, 52);
        assert_eq!(p.generator.register_by_offset(56).unwrap().name, "lr");
    }

    #[test]
    fn instructions_get_fallthrough_pc_store() {
        let mut p = parse(SMALL, "small").unwrap();
        let mut m = Module::new("m");
        p.generator.init(&mut m).unwrap();
        let f = p
            .generator
            .gen_intermediate_code(&mut m, 0x104, CodeFlags::default(), true)
            .unwrap();
        let func = m.function(f);
        let entry = func.entry_block().unwrap();
        let last = *func.block_insts(entry).last().unwrap();
        assert!(func.is_env_store_of(last, 60));
        match func.op(last) {
            Op::Store { value, .. } => assert_eq!(*value, Value::constant(0x108, 32)),
            op => panic!("expected the fallthrough store, got {:?}", op),
        }
        let calls = func
            .block_insts(entry)
            .iter()
            .filter(|&&i| func.op(i).is_call())
            .count();
        assert_eq!(calls, 1);
    }

    #[test]
    fn explicit_pc_write_suppresses_fallthrough() {
        let mut p = parse(SMALL, "small").unwrap();
        let mut m = Module::new("m");
        p.generator.init(&mut m).unwrap();
        let f = p
            .generator
            .gen_intermediate_code(&mut m, 0x108, CodeFlags { thumb: true }, true)
            .unwrap();
        let func = m.function(f);
        let entry = func.entry_block().unwrap();
        let pc_stores = func
            .block_insts(entry)
            .iter()
            .filter(|&&i| func.is_env_store_of(i, 60))
            .count();
        assert_eq!(pc_stores, 1);
        assert!(p
            .generator
            .gen_intermediate_code(&mut m, 0x108, CodeFlags::default(), true)
            .is_none());
    }

    #[test]
    fn malformed_input_reports_line() {
        let bad = SMALL.replace("%1 = sub %0 8", "%1 = frob %0 8");
        match parse(&bad, "bad") {
            Err(LiftError::Parse { line, .. }) => assert_eq!(line, 17),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("parse should fail"),
        }
        let bad = SMALL.replace("BLOCK 100 108 -> 1", "BLOCK 100 108 -> 7");
        assert!(matches!(parse(&bad, "bad"), Err(LiftError::Parse { .. })));
    }
}
