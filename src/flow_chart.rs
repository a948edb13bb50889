//! A read-only control-flow view over one function of a [`Disassembly`].
//!
//! Block records and their instruction lists are only materialized when first asked for, and
//! are cached for the lifetime of the view. Blocks are handed out as lightweight
//! [`BasicBlockView`] handles that carry an index, so the cache can be filled in lazily without
//! ever invalidating a previously handed out block.

use std::cell::OnceCell;

use crate::disassembly::{Disassembly, RawBlock};
use crate::error::LiftError;
use crate::ir::Address;
use crate::log::*;

/// One instruction head inside a basic block
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InstructionView {
    pub address: Address,
    /// Index of the owning block
    pub block: usize,
}

/// Cached data for one basic block
#[derive(Debug)]
pub struct BasicBlockRecord {
    pub index: usize,
    pub start: Address,
    pub end: Address,
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
    insts: OnceCell<Vec<InstructionView>>,
}

pub struct ControlFlowView<'a> {
    disasm: &'a dyn Disassembly,
    name: String,
    start: Address,
    end: Address,
    raw: Vec<RawBlock>,
    records: Vec<OnceCell<BasicBlockRecord>>,
}

impl<'a> ControlFlowView<'a> {
    /// View of the function containing `addr`
    pub fn for_function(disasm: &'a dyn Disassembly, addr: Address) -> Result<Self, LiftError> {
        let func = disasm.function_containing(addr).ok_or_else(|| {
            warn!("No function found"; "addr" => Hex(addr));
            LiftError::NoFunctionAt { addr }
        })?;
        Ok(Self::build(disasm, func.name, func.start, func.end))
    }

    /// View of the blocks in `[start, end)`. Block 0 is the one beginning at `start`.
    pub fn for_range(disasm: &'a dyn Disassembly, start: Address, end: Address) -> Self {
        let name = disasm
            .function_containing(start)
            .filter(|f| f.start == start)
            .map(|f| f.name)
            .unwrap_or_else(|| format!("sub_{:x}", start));
        Self::build(disasm, name, start, end)
    }

    fn build(disasm: &'a dyn Disassembly, name: String, start: Address, end: Address) -> Self {
        let raw = disasm.basic_blocks(start, end);
        debug!(
            "Built control flow view";
            "function" => &name,
            "start" => Hex(start),
            "blocks" => raw.len(),
        );
        let records = (0..raw.len()).map(|_| OnceCell::new()).collect();
        Self {
            disasm,
            name,
            start,
            end,
            raw,
            records,
        }
    }

    pub fn disassembly(&self) -> &'a dyn Disassembly {
        self.disasm
    }

    /// Display name of the viewed function
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.end
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    pub fn block(&self, index: usize) -> Result<BasicBlockView<'_, 'a>, LiftError> {
        if index >= self.size() {
            return Err(LiftError::IndexError {
                index,
                size: self.size(),
            });
        }
        Ok(BasicBlockView { view: self, index })
    }

    pub fn entry_block(&self) -> Result<BasicBlockView<'_, 'a>, LiftError> {
        self.block(0)
    }

    pub fn blocks(&self) -> impl Iterator<Item = BasicBlockView<'_, 'a>> {
        (0..self.size()).map(move |index| BasicBlockView { view: self, index })
    }

    fn record(&self, index: usize) -> &BasicBlockRecord {
        self.records[index].get_or_init(|| {
            let raw = &self.raw[index];
            trace!("Materializing block"; "index" => index, "start" => Hex(raw.start));
            BasicBlockRecord {
                index,
                start: raw.start,
                end: raw.end,
                preds: raw.preds.clone(),
                succs: raw.succs.clone(),
                insts: OnceCell::new(),
            }
        })
    }
}

/// Handle to one block of a [`ControlFlowView`]
#[derive(Clone, Copy)]
pub struct BasicBlockView<'v, 'a> {
    view: &'v ControlFlowView<'a>,
    index: usize,
}

impl<'v, 'a> BasicBlockView<'v, 'a> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// The cached record for this block; the same index always yields the same record
    pub fn record(&self) -> &'v BasicBlockRecord {
        self.view.record(self.index)
    }

    pub fn start(&self) -> Address {
        self.record().start
    }

    pub fn end(&self) -> Address {
        self.record().end
    }

    pub fn predecessors(&self) -> Vec<BasicBlockView<'v, 'a>> {
        let view = self.view;
        self.record()
            .preds
            .iter()
            .map(|&index| BasicBlockView { view, index })
            .collect()
    }

    pub fn successors(&self) -> Vec<BasicBlockView<'v, 'a>> {
        let view = self.view;
        self.record()
            .succs
            .iter()
            .map(|&index| BasicBlockView { view, index })
            .collect()
    }

    /// Instruction heads in `[start, end)`, in address order
    pub fn instructions(&self) -> &'v [InstructionView] {
        let rec = self.record();
        rec.insts.get_or_init(|| {
            let disasm = self.view.disasm;
            let mut r = vec![];
            let mut cur = disasm.first_head(rec.start, rec.end);
            while let Some(address) = cur {
                r.push(InstructionView {
                    address,
                    block: self.index,
                });
                cur = disasm.next_head(address, rec.end);
            }
            r
        })
    }

    pub fn instruction(&self, address: Address) -> Option<&'v InstructionView> {
        let insts = self.instructions();
        insts
            .binary_search_by_key(&address, |i| i.address)
            .ok()
            .map(|i| &insts[i])
    }
}

impl<'v, 'a> std::fmt::Debug for BasicBlockView<'v, 'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "BasicBlockView({}: {:#x}..{:#x})",
            self.index,
            self.start(),
            self.end()
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::diamond_disassembly;

    #[test]
    fn block_records_are_cached() {
        let d = diamond_disassembly();
        let view = ControlFlowView::for_function(&d, 0x1008).unwrap();
        assert_eq!(view.size(), 4);
        let a = view.block(2).unwrap().record() as *const BasicBlockRecord;
        let b = view.entry_block().unwrap().successors()[1].record() as *const BasicBlockRecord;
        let c = view.block(3).unwrap().predecessors()[1].record() as *const BasicBlockRecord;
        assert!(std::ptr::eq(a, b));
        assert!(std::ptr::eq(a, c));
        let i1 = view.block(1).unwrap().instructions().as_ptr();
        let i2 = view.block(1).unwrap().instructions().as_ptr();
        assert_eq!(i1, i2);
    }

    #[test]
    fn out_of_range_block_is_an_index_error() {
        let d = diamond_disassembly();
        let view = ControlFlowView::for_function(&d, 0x1000).unwrap();
        assert!(matches!(
            view.block(4),
            Err(LiftError::IndexError { index: 4, size: 4 })
        ));
    }

    #[test]
    fn missing_function_is_reported() {
        let d = diamond_disassembly();
        assert!(matches!(
            ControlFlowView::for_function(&d, 0x9999_0000),
            Err(LiftError::NoFunctionAt { .. })
        ));
    }

    #[test]
    fn instructions_are_listed_in_address_order() {
        let d = diamond_disassembly();
        let view = ControlFlowView::for_range(&d, 0x1000, 0x1040);
        assert_eq!(view.name(), "diamond");
        let entry = view.entry_block().unwrap();
        let addrs: Vec<Address> = entry.instructions().iter().map(|i| i.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x1004]);
        assert_eq!(entry.instruction(0x1004).map(|i| i.block), Some(0));
        assert!(entry.instruction(0x1010).is_none());
    }
}
