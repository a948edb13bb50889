//! Splices the body of every per-instruction function into the lifted function, leaving an
//! opcode-start marker where each instruction begins.

use super::{FunctionPass, PassContext, PassId};
use crate::containers::unordered::UnorderedMap;
use crate::error::LiftError;
use crate::ir::{Callee, FuncId, InstId, Module, Op, Tags, Value};
use crate::log::*;

#[derive(Default)]
pub struct InlineOpcodeCallsPass {
    /// Opcode calls replaced by their body
    pub inlined: usize,
    /// Opcode calls left in place because their callee is not a single block
    pub not_inlined: usize,
}

impl FunctionPass for InlineOpcodeCallsPass {
    fn id(&self) -> PassId {
        PassId::InlineOpcodeCalls
    }

    fn run(
        &mut self,
        module: &mut Module,
        func: FuncId,
        _ctx: &PassContext,
    ) -> Result<bool, LiftError> {
        let f = module.function(func);
        let calls: Vec<(InstId, FuncId)> = f
            .blocks()
            .iter()
            .flat_map(|&b| f.block_insts(b).iter().copied())
            .filter_map(|i| match f.op(i) {
                Op::Call {
                    callee: Callee::Direct(c),
                    ..
                } if f.source_address(i).is_some() => Some((i, *c)),
                _ => None,
            })
            .collect();

        let mut changed = false;
        for (call, callee_id) in calls {
            let callee = module.function(callee_id).clone();
            let addr = module.function(func).source_address(call);
            let body = match callee.entry_block() {
                Some(b) if callee.blocks().len() == 1 => b,
                _ => {
                    warn!(
                        "Cannot inline opcode with control flow";
                        "callee" => &callee.name,
                        OptionalKV("addr", addr.map(Hex)),
                    );
                    self.not_inlined += 1;
                    continue;
                }
            };
            let f = module.function_mut(func);
            let args = match f.op(call) {
                Op::Call { args, .. } => args.clone(),
                _ => unreachable!(),
            };
            let marker = f.insert_before(call, Op::OpcodeStart);
            f.set_tags(
                marker,
                Tags {
                    source_address: addr,
                    ..Default::default()
                },
            );
            let mut mapped: UnorderedMap<InstId, Value> = Default::default();
            for &ci in callee.block_insts(body) {
                let mut op = callee.op(ci).clone();
                for v in op.operands_mut() {
                    *v = match *v {
                        Value::Arg(n) => args[n],
                        Value::Inst(x) => *mapped
                            .get(&x)
                            .expect("Callee uses an instruction before defining it"),
                        other => other,
                    };
                }
                let new = f.insert_before(call, op);
                if let Some(t) = callee.tags(ci) {
                    f.set_tags(new, t.clone());
                }
                mapped.insert(ci, Value::Inst(new));
            }
            f.erase(call);
            self.inlined += 1;
            changed = true;
        }
        debug!(
            "Inlined opcode calls";
            "inlined" => self.inlined,
            "not_inlined" => self.not_inlined,
        );
        Ok(changed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{Function, Terminator, Type};
    use crate::tests::arm_context;

    /// An opcode writing 1 to `r0`
    fn set_r0() -> Function {
        let mut f = Function::new("tcg_set_r0", vec![Type::Ptr], Type::Void);
        let b = f.add_block("entry");
        let p = f.append(
            b,
            Op::CpuFieldPtr {
                base: Value::Arg(0),
                path: vec![0],
            },
        );
        let s = f.append(
            b,
            Op::Store {
                value: Value::constant(1, 32),
                ptr: Value::Inst(p),
            },
        );
        f.set_tags(
            s,
            Tags {
                env_offset: Some(0),
                register: Some("r0".to_string()),
                ..Default::default()
            },
        );
        f.set_terminator(b, Terminator::Ret(None));
        f
    }

    fn branching() -> Function {
        let mut f = Function::new("tcg_branching", vec![Type::Ptr], Type::Void);
        let b0 = f.add_block("entry");
        let b1 = f.add_block("exit");
        f.set_terminator(b0, Terminator::Br(b1));
        f.set_terminator(b1, Terminator::Ret(None));
        f
    }

    fn opcode_call(f: &mut Function, b: crate::ir::BlockId, callee: FuncId, addr: u64) -> InstId {
        let c = f.append(
            b,
            Op::Call {
                callee: Callee::Direct(callee),
                args: vec![Value::Arg(0)],
                ret: Type::Void,
            },
        );
        f.set_tags(
            c,
            Tags {
                source_address: Some(addr),
                ..Default::default()
            },
        );
        c
    }

    #[test]
    fn single_block_opcodes_are_spliced_in() {
        let mut m = Module::new("m");
        let simple = m.add_function(set_r0());
        let complex = m.add_function(branching());
        let mut f = Function::new("lifted", vec![Type::Ptr], Type::Void);
        let b = f.add_block("bb_1000");
        opcode_call(&mut f, b, simple, 0x1000);
        let kept = opcode_call(&mut f, b, complex, 0x1004);
        f.set_terminator(b, Terminator::Ret(None));
        let id = m.add_function(f);

        let mut pass = InlineOpcodeCallsPass::default();
        assert!(pass.run(&mut m, id, &arm_context()).unwrap());
        assert_eq!((pass.inlined, pass.not_inlined), (1, 1));

        let f = m.function(id);
        let insts = f.block_insts(b);
        assert_eq!(insts.len(), 4);
        assert_eq!(*f.op(insts[0]), Op::OpcodeStart);
        assert_eq!(f.source_address(insts[0]), Some(0x1000));
        assert!(matches!(f.op(insts[1]), Op::CpuFieldPtr { base: Value::Arg(0), .. }));
        assert_eq!(
            *f.op(insts[2]),
            Op::Store {
                value: Value::constant(1, 32),
                ptr: Value::Inst(insts[1]),
            }
        );
        assert!(f.is_env_store_of(insts[2], 0));
        assert_eq!(insts[3], kept);
        assert!(f.verify().is_ok());
    }
}
