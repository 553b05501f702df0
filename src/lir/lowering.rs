//! One-pass lowering from the high-level graph
//!
//! Each high-level opcode chooses a representation-specific code shape:
//! integer arithmetic lowers to two-address 32-bit forms, proven doubles
//! to three-address double forms, and still-tagged values to helper calls
//! with fixed ABI registers. Guards receive deoptimization environments;
//! calls receive both an environment and a pointer map.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::BinOp;
use crate::error::Result;
use crate::hir::types::Representation;
use crate::hir::{Graph, HConst, HirId, HOp};
use crate::lir::{
    LChunk, LEnvId, LEnvironment, LInstr, LOp, LOperand, LPolicy, PointerMap, VReg,
};
use crate::masm::conv;

struct LChunkBuilder<'g> {
    graph: &'g Graph,
    chunk: LChunk,
    vregs: FxHashMap<HirId, VReg>,
    next_vreg: u32,
    /// The last simulate's lowered environment: what a deopt at this point
    /// must reconstruct.
    current_env: Option<LEnvId>,
    /// Outer environments of enclosing inlined frames.
    env_stack: Vec<Option<LEnvId>>,
}

/// Lower `graph` into an allocator-ready chunk.
pub fn lower_graph(graph: &Graph) -> Result<LChunk> {
    let mut builder = LChunkBuilder {
        graph,
        chunk: LChunk::default(),
        vregs: FxHashMap::default(),
        next_vreg: 0,
        current_env: None,
        env_stack: Vec::new(),
    };
    builder.run();
    let chunk = builder.chunk;
    debug!(
        instrs = chunk.instrs.len(),
        environments = chunk.environments.len(),
        vregs = chunk.vreg_count,
        "graph lowered"
    );
    Ok(chunk)
}

impl<'g> LChunkBuilder<'g> {
    fn run(&mut self) {
        let rpo = self.graph.compute_rpo();
        for &block_id in &rpo {
            let block = &self.graph.blocks[block_id.index()];
            self.emit_plain(HirId(u32::MAX), LOp::Label { block: block_id });
            for &phi in &block.phis {
                let vreg = self.vreg_for(phi);
                self.chunk.phi_vregs.push((phi, vreg));
            }
            for &id in &block.instructions {
                self.lower_instruction(id);
            }
        }
        self.chunk.vreg_count = self.next_vreg;
        self.chunk.spill_slot_count = self
            .chunk
            .environments
            .iter()
            .map(|env| env.values.len() as u32)
            .max()
            .unwrap_or(0);
    }

    fn vreg_for(&mut self, id: HirId) -> VReg {
        if let Some(&vreg) = self.vregs.get(&id) {
            return vreg;
        }
        let vreg = VReg(self.next_vreg);
        self.next_vreg += 1;
        self.vregs.insert(id, vreg);
        vreg
    }

    // -- operand constructors (the policy vocabulary) ----------------------

    fn use_register(&mut self, id: HirId) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::MustRegister,
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn use_register_at_start(&mut self, id: HirId) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::MustRegister,
            vreg: self.vreg_for(id),
            at_start: true,
        }
    }

    fn use_register_or_constant(&mut self, id: HirId) -> LOperand {
        if let HOp::Constant(c) = &self.graph.value(id).op {
            let index = self.constant_index(*c);
            return LOperand::ConstantIndex(index);
        }
        LOperand::Unallocated {
            policy: LPolicy::RegisterOrConstant,
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn use_any(&mut self, id: HirId) -> LOperand {
        if let HOp::Constant(c) = &self.graph.value(id).op {
            let index = self.constant_index(*c);
            return LOperand::ConstantIndex(index);
        }
        LOperand::Unallocated {
            policy: LPolicy::Any,
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn use_fixed(&mut self, id: HirId, reg: crate::masm::Reg) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::Fixed(reg),
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn define_register(&mut self, id: HirId) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::MustRegister,
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn define_same_as_first(&mut self, id: HirId) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::SameAsFirst,
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn define_fixed(&mut self, id: HirId, reg: crate::masm::Reg) -> LOperand {
        LOperand::Unallocated {
            policy: LPolicy::Fixed(reg),
            vreg: self.vreg_for(id),
            at_start: false,
        }
    }

    fn temp_writable(&mut self) -> LOperand {
        let vreg = VReg(self.next_vreg);
        self.next_vreg += 1;
        LOperand::Unallocated {
            policy: LPolicy::WritableRegister,
            vreg,
            at_start: false,
        }
    }

    fn constant_index(&mut self, constant: HConst) -> u32 {
        if let Some(idx) = self.chunk.constants.iter().position(|c| *c == constant) {
            return idx as u32;
        }
        self.chunk.constants.push(constant);
        (self.chunk.constants.len() - 1) as u32
    }

    // -- emission ----------------------------------------------------------

    fn emit_plain(&mut self, hir: HirId, op: LOp) {
        self.chunk.instrs.push(LInstr {
            op,
            result: None,
            inputs: Vec::new(),
            temps: Vec::new(),
            pointer_map: None,
            environment: None,
            hir,
            is_call: false,
        });
    }

    fn emit(&mut self, instr: LInstr) {
        self.chunk.instrs.push(instr);
    }

    fn instr(&self, hir: HirId, op: LOp) -> LInstr {
        LInstr {
            op,
            result: None,
            inputs: Vec::new(),
            temps: Vec::new(),
            pointer_map: None,
            environment: None,
            hir,
            is_call: false,
        }
    }

    /// Mark an instruction as calling out of the lowered code: its tagged
    /// operands become the pointer map, and it receives the current
    /// deoptimization environment.
    fn mark_as_call(&mut self, instr: &mut LInstr, hir: HirId) {
        instr.is_call = true;
        let live: Vec<VReg> = self
            .graph
            .value(hir)
            .operands
            .iter()
            .filter(|&&operand| self.graph.value(operand).rep == Representation::Tagged)
            .map(|&operand| self.vreg_for(operand))
            .collect();
        instr.pointer_map = Some(PointerMap { live });
        instr.environment = self.current_env;
    }

    fn assign_environment(&mut self, instr: &mut LInstr) {
        instr.environment = self.current_env;
    }

    fn lower_instruction(&mut self, id: HirId) {
        let value = self.graph.value(id);
        match value.op.clone() {
            HOp::Constant(c) => {
                let op = match value.rep {
                    Representation::Integer32 => match c {
                        HConst::Smi(n) => LOp::ConstantI(n),
                        _ => LOp::ConstantT(c),
                    },
                    Representation::Double => match c {
                        HConst::Number(n) => LOp::ConstantD(n),
                        HConst::Smi(n) => LOp::ConstantD(n as f64),
                        _ => LOp::ConstantT(c),
                    },
                    _ => LOp::ConstantT(c),
                };
                let mut instr = self.instr(id, op);
                instr.result = Some(self.define_register(id));
                self.emit(instr);
            }
            HOp::Parameter(index) => {
                let mut instr = self.instr(id, LOp::Parameter { index });
                instr.result = Some(self.define_register(id));
                self.emit(instr);
            }
            HOp::Phi => unreachable!("phis are handled per block"),
            HOp::Binary(op) => self.lower_binary(id, op),
            HOp::Compare(op) => {
                let operands = self.graph.value(id).operands.clone();
                let reps: Vec<Representation> = operands
                    .iter()
                    .map(|o| self.graph.value(*o).rep)
                    .collect();
                if reps.iter().all(|r| *r == Representation::Integer32) {
                    let mut instr = self.instr(id, LOp::CompareI(op));
                    instr.inputs = vec![
                        self.use_register_at_start(operands[0]),
                        self.use_register_or_constant(operands[1]),
                    ];
                    instr.result = Some(self.define_register(id));
                    self.emit(instr);
                } else if reps
                    .iter()
                    .all(|r| matches!(r, Representation::Integer32 | Representation::Double))
                {
                    let mut instr = self.instr(id, LOp::CompareD(op));
                    instr.inputs = vec![
                        self.use_register(operands[0]),
                        self.use_register(operands[1]),
                    ];
                    instr.result = Some(self.define_register(id));
                    self.emit(instr);
                } else {
                    // Generic compare calls a stub helper.
                    let mut instr = self.instr(id, LOp::CompareT(op));
                    instr.inputs = vec![
                        self.use_fixed(operands[0], conv::RUNTIME_ARGS[0]),
                        self.use_fixed(operands[1], conv::RUNTIME_ARGS[1]),
                    ];
                    instr.result = Some(self.define_fixed(id, conv::RESULT));
                    self.mark_as_call(&mut instr, id);
                    self.emit(instr);
                }
            }
            HOp::LoadNamedField { index, in_object } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::LoadNamedField { index, in_object });
                instr.inputs = vec![self.use_register_at_start(operands[0])];
                instr.result = Some(self.define_register(id));
                self.emit(instr);
            }
            HOp::StoreNamedField { index, in_object } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::StoreNamedField { index, in_object });
                instr.inputs = vec![
                    self.use_register(operands[0]),
                    self.use_register(operands[1]),
                ];
                // Write-barrier scratch: mutated in place, so it must not
                // be coalesced with any value's home register.
                instr.temps = vec![self.temp_writable()];
                self.emit(instr);
            }
            HOp::LoadNamedGeneric { name } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::LoadNamedGeneric { name });
                instr.inputs = vec![self.use_fixed(operands[0], conv::RECEIVER)];
                instr.result = Some(self.define_fixed(id, conv::RESULT));
                self.mark_as_call(&mut instr, id);
                self.emit(instr);
            }
            HOp::StoreNamedGeneric { name } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::StoreNamedGeneric { name });
                instr.inputs = vec![
                    self.use_fixed(operands[0], conv::RECEIVER),
                    self.use_fixed(operands[1], conv::VALUE),
                ];
                self.mark_as_call(&mut instr, id);
                self.emit(instr);
            }
            HOp::LoadGlobalCell { cell } => {
                let mut instr = self.instr(id, LOp::LoadGlobalCell { cell });
                instr.result = Some(self.define_register(id));
                self.emit(instr);
            }
            HOp::CallKnown { function, argc } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::CallKnown { function, argc });
                instr.inputs = self.call_inputs(&operands);
                instr.result = Some(self.define_fixed(id, conv::RESULT));
                self.mark_as_call(&mut instr, id);
                self.emit(instr);
            }
            HOp::CallNamed { name, argc } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::CallNamed { name, argc });
                instr.inputs = self.call_inputs(&operands);
                instr.result = Some(self.define_fixed(id, conv::RESULT));
                self.mark_as_call(&mut instr, id);
                self.emit(instr);
            }
            HOp::CheckNonSmi => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::CheckNonSmi);
                instr.inputs = vec![self.use_register_at_start(operands[0])];
                self.assign_environment(&mut instr);
                self.emit(instr);
            }
            HOp::CheckMap { shape } => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::CheckMap { shape });
                instr.inputs = vec![self.use_register_at_start(operands[0])];
                self.assign_environment(&mut instr);
                self.emit(instr);
            }
            HOp::Simulate { ast_id } => {
                let operands = self.graph.value(id).operands.clone();
                let values: Vec<LOperand> =
                    operands.iter().map(|&o| self.use_any(o)).collect();
                let env = LEnvironment {
                    ast_id,
                    values,
                    outer: self.env_stack.last().copied().flatten(),
                };
                let env_id = LEnvId(self.chunk.environments.len() as u32);
                self.chunk.environments.push(env);
                self.current_env = Some(env_id);
            }
            HOp::EnterInlined { .. } => {
                self.env_stack.push(self.current_env);
            }
            HOp::LeaveInlined => {
                if let Some(outer) = self.env_stack.pop() {
                    self.current_env = outer;
                }
            }
            HOp::Goto => {
                let block = self.graph.value(id).block;
                let target = self.graph.blocks[block.index()].successors[0];
                self.emit_plain(id, LOp::Goto { target });
            }
            HOp::Branch => {
                let operands = self.graph.value(id).operands.clone();
                let block = self.graph.value(id).block;
                let successors = self.graph.blocks[block.index()].successors.clone();
                let mut instr = self.instr(
                    id,
                    LOp::Branch {
                        if_true: successors[0],
                        if_false: successors[1],
                    },
                );
                instr.inputs = vec![self.use_register_at_start(operands[0])];
                self.emit(instr);
            }
            HOp::Return => {
                let operands = self.graph.value(id).operands.clone();
                let mut instr = self.instr(id, LOp::Return);
                instr.inputs = vec![self.use_fixed(operands[0], conv::RESULT)];
                self.emit(instr);
            }
        }
    }

    fn lower_binary(&mut self, id: HirId, op: BinOp) {
        let operands = self.graph.value(id).operands.clone();
        let rep = self.graph.value(id).rep;
        match rep {
            Representation::Integer32 => {
                if op == BinOp::Div {
                    // Division pins its operands to the architecture's
                    // dividend/remainder registers.
                    let mut instr = self.instr(id, LOp::DivI);
                    instr.inputs = vec![
                        self.use_fixed(operands[0], crate::masm::Reg::R0),
                        self.use_register(operands[1]),
                    ];
                    instr.result = Some(self.define_fixed(id, crate::masm::Reg::R0));
                    instr.temps = vec![self.temp_writable()];
                    self.assign_environment(&mut instr);
                    self.emit(instr);
                    return;
                }
                let lop = match op {
                    BinOp::Add => LOp::AddI,
                    BinOp::Sub => LOp::SubI,
                    BinOp::Mul => LOp::MulI,
                    BinOp::Div => unreachable!(),
                };
                // Two-address integer form: the output reuses the first
                // input's location.
                let mut instr = self.instr(id, lop);
                instr.inputs = vec![
                    self.use_register_at_start(operands[0]),
                    self.use_register_or_constant(operands[1]),
                ];
                instr.result = Some(self.define_same_as_first(id));
                // Overflow bails out to the baseline tier.
                self.assign_environment(&mut instr);
                self.emit(instr);
            }
            Representation::Double => {
                let lop = match op {
                    BinOp::Add => LOp::AddD,
                    BinOp::Sub => LOp::SubD,
                    BinOp::Mul => LOp::MulD,
                    BinOp::Div => LOp::DivD,
                };
                let mut instr = self.instr(id, lop);
                instr.inputs = vec![
                    self.use_register(operands[0]),
                    self.use_register(operands[1]),
                ];
                instr.result = Some(self.define_register(id));
                self.emit(instr);
            }
            _ => {
                // Still-generic arithmetic calls the shared stub with the
                // ABI-fixed argument registers.
                let mut instr = self.instr(id, LOp::ArithmeticT(op));
                instr.inputs = vec![
                    self.use_fixed(operands[0], conv::RUNTIME_ARGS[0]),
                    self.use_fixed(operands[1], conv::RUNTIME_ARGS[1]),
                ];
                instr.result = Some(self.define_fixed(id, conv::RESULT));
                self.mark_as_call(&mut instr, id);
                self.emit(instr);
            }
        }
    }

    /// Fixed registers for the leading arguments; everything past the ABI
    /// registers is `Any` (read from the stack by the callee).
    fn call_inputs(&mut self, operands: &[HirId]) -> Vec<LOperand> {
        operands
            .iter()
            .enumerate()
            .map(|(i, &operand)| match conv::RUNTIME_ARGS.get(i) {
                Some(&reg) => self.use_fixed(operand, reg),
                None => self.use_any(operand),
            })
            .collect()
    }
}
