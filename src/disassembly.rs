//! The boundary to the disassembler that supplies functions, their basic blocks and their
//! instructions.

use crate::containers::unordered::UnorderedSet;
use crate::containers::InsertionOrderedSet;
use crate::ir::Address;

/// Byte order of the target
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Endian {
    Little,
    Big,
}

/// Processor family of the target program
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Processor {
    Arm,
    I386,
    X86_64,
    Unknown(String),
}

impl Processor {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "arm" => Processor::Arm,
            "i386" | "x86" => Processor::I386,
            "x86_64" | "x86-64" | "amd64" => Processor::X86_64,
            _ => Processor::Unknown(name.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Processor::Arm => "arm",
            Processor::I386 => "i386",
            Processor::X86_64 => "x86_64",
            Processor::Unknown(n) => n,
        }
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ProcessorInfo {
    pub processor: Processor,
    pub endianness: Endian,
    pub address_bits: u32,
}

/// A function known to the disassembler
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FunctionInfo {
    pub name: String,
    pub start: Address,
    pub end: Address,
}

/// A basic block as reported by the disassembler, before any caching. Predecessor and
/// successor lists hold indices into the same enumeration, in reporting order.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct RawBlock {
    pub start: Address,
    pub end: Address,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
}

/// Everything the lifter needs from a disassembly database.
pub trait Disassembly {
    fn processor(&self) -> ProcessorInfo;
    /// The function whose body contains `addr`
    fn function_containing(&self, addr: Address) -> Option<FunctionInfo>;
    /// Basic blocks covering `[start, end)`; index 0 is the block starting at `start`
    fn basic_blocks(&self, start: Address, end: Address) -> Vec<RawBlock>;
    /// First instruction head in `[start, end)`
    fn first_head(&self, start: Address, end: Address) -> Option<Address>;
    /// Instruction head following `addr`, if it lies before `end`
    fn next_head(&self, addr: Address, end: Address) -> Option<Address>;
    /// Whether the instruction at `addr` is encoded in thumb mode
    fn is_thumb(&self, addr: Address) -> bool;
    /// Targets of code cross-references originating at `addr`
    fn code_refs_from(&self, addr: Address) -> Vec<Address>;
    fn has_code_ref(&self, from: Address, to: Address) -> bool {
        self.code_refs_from(from).contains(&to)
    }
}

/// A basic block of a [`StaticDisassembly`] function, with successors given as block start
/// addresses.
#[derive(Clone, Debug)]
pub struct StaticBlock {
    pub start: Address,
    pub end: Address,
    pub succs: Vec<Address>,
}

#[derive(Clone, Debug)]
struct StaticFunction {
    info: FunctionInfo,
    blocks: Vec<StaticBlock>,
}

/// A disassembly held entirely in memory: the product of parsing an exported program, or
/// built directly by tests.
#[derive(Clone, Debug)]
pub struct StaticDisassembly {
    processor: ProcessorInfo,
    functions: Vec<StaticFunction>,
    /// All instruction heads, sorted
    heads: Vec<Address>,
    thumb: UnorderedSet<Address>,
    code_refs: Vec<(Address, Address)>,
}

impl StaticDisassembly {
    pub fn new(processor: ProcessorInfo) -> Self {
        Self {
            processor,
            functions: vec![],
            heads: vec![],
            thumb: Default::default(),
            code_refs: vec![],
        }
    }

    /// Add a function. Its first block must start at `start`.
    pub fn add_function(&mut self, name: &str, start: Address, end: Address, blocks: Vec<StaticBlock>) {
        assert!(
            blocks.first().map(|b| b.start) == Some(start),
            "Entry block of {} must start at {:#x}",
            name,
            start
        );
        for b in &blocks {
            for &s in &b.succs {
                self.code_refs.push((b.end, s));
            }
        }
        self.functions.push(StaticFunction {
            info: FunctionInfo {
                name: name.to_string(),
                start,
                end,
            },
            blocks,
        });
    }

    /// Record an instruction head at `addr`
    pub fn add_instruction(&mut self, addr: Address, thumb: bool) {
        if let Err(pos) = self.heads.binary_search(&addr) {
            self.heads.insert(pos, addr);
        }
        if thumb {
            self.thumb.insert(addr);
        }
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionInfo> {
        self.functions.iter().map(|f| &f.info)
    }
}

impl Disassembly for StaticDisassembly {
    fn processor(&self) -> ProcessorInfo {
        self.processor.clone()
    }

    fn function_containing(&self, addr: Address) -> Option<FunctionInfo> {
        self.functions
            .iter()
            .find(|f| f.info.start <= addr && addr < f.info.end)
            .map(|f| f.info.clone())
    }

    fn basic_blocks(&self, start: Address, end: Address) -> Vec<RawBlock> {
        let blocks: Vec<&StaticBlock> = match self
            .functions
            .iter()
            .find(|f| f.info.start == start && f.info.end == end)
        {
            Some(f) => f.blocks.iter().collect(),
            None => {
                let mut r: Vec<&StaticBlock> = self
                    .functions
                    .iter()
                    .flat_map(|f| f.blocks.iter())
                    .filter(|b| start <= b.start && b.start < end)
                    .collect();
                r.sort_by_key(|b| (b.start != start, b.start));
                r
            }
        };
        let index_of = |a: Address| blocks.iter().position(|b| b.start == a);
        let succs: Vec<Vec<usize>> = blocks
            .iter()
            .map(|b| {
                b.succs
                    .iter()
                    .filter_map(|&s| index_of(s))
                    .collect::<InsertionOrderedSet<_>>()
                    .into_vec()
            })
            .collect();
        let mut preds: Vec<InsertionOrderedSet<usize>> =
            (0..blocks.len()).map(|_| InsertionOrderedSet::new()).collect();
        for (i, ss) in succs.iter().enumerate() {
            for &s in ss {
                preds[s].insert(i);
            }
        }
        blocks
            .iter()
            .zip(succs.into_iter().zip(preds.into_iter()))
            .map(|(b, (succs, preds))| RawBlock {
                start: b.start,
                end: b.end,
                preds: preds.into_vec(),
                succs,
            })
            .collect()
    }

    fn first_head(&self, start: Address, end: Address) -> Option<Address> {
        let pos = self.heads.partition_point(|&h| h < start);
        self.heads.get(pos).copied().filter(|&h| h < end)
    }

    fn next_head(&self, addr: Address, end: Address) -> Option<Address> {
        let pos = self.heads.partition_point(|&h| h <= addr);
        self.heads.get(pos).copied().filter(|&h| h < end)
    }

    fn is_thumb(&self, addr: Address) -> bool {
        self.thumb.contains(&addr)
    }

    fn code_refs_from(&self, addr: Address) -> Vec<Address> {
        self.code_refs
            .iter()
            .filter(|(f, _)| *f == addr)
            .map(|(_, t)| *t)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn diamond() -> StaticDisassembly {
        let mut d = StaticDisassembly::new(ProcessorInfo {
            processor: Processor::Arm,
            endianness: Endian::Little,
            address_bits: 32,
        });
        d.add_function(
            "diamond",
            0x100,
            0x140,
            vec![
                StaticBlock {
                    start: 0x100,
                    end: 0x108,
                    succs: vec![0x120, 0x110, 0x120],
                },
                StaticBlock {
                    start: 0x110,
                    end: 0x118,
                    succs: vec![0x130],
                },
                StaticBlock {
                    start: 0x120,
                    end: 0x128,
                    succs: vec![0x130],
                },
                StaticBlock {
                    start: 0x130,
                    end: 0x138,
                    succs: vec![],
                },
            ],
        );
        for a in (0x100..0x138).step_by(4) {
            d.add_instruction(a, false);
        }
        d
    }

    #[test]
    fn predecessors_follow_report_order() {
        let d = diamond();
        let blocks = d.basic_blocks(0x100, 0x140);
        assert_eq!(blocks.len(), 4);
        assert_eq!(blocks[0].succs, vec![2, 1]);
        assert_eq!(blocks[3].preds, vec![1, 2]);
        assert!(blocks[0].preds.is_empty());
    }

    #[test]
    fn heads_are_bounded_by_range() {
        let d = diamond();
        assert_eq!(d.first_head(0x110, 0x118), Some(0x110));
        assert_eq!(d.next_head(0x110, 0x118), Some(0x114));
        assert_eq!(d.next_head(0x114, 0x118), None);
        assert_eq!(d.function_containing(0x124).map(|f| f.start), Some(0x100));
        assert_eq!(d.function_containing(0x200), None);
    }
}
