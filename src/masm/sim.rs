//! Simulator for the reference architecture
//!
//! Executes assembled code objects against the object model so generated
//! stubs can be exercised end to end: guards, cache probes, field loads,
//! write barriers, tail calls into runtime helpers, and debug-break traps.

use crate::code::CodeHandle;
use crate::context::CompileContext;
use crate::error::{Error, Result};
use crate::heap::{Value, CELL_VALUE_OFFSET};
use crate::masm::{conv, decode_cache_access, Instr, Op, Reg, INSTR_SIZE};
use crate::runtime;

/// Byte offset of the code slot inside a shared function descriptor, as
/// seen by generated code.
pub const SHARED_CODE_OFFSET: i32 = 8;

/// Why execution stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The outermost frame returned; payload is the result register.
    Return(Value),
    /// A debug-break trap fired.
    DebugBreak { code: CodeHandle, offset: u32 },
}

/// Architectural state shared with runtime helpers.
pub struct SimState {
    regs: [Value; 16],
    pub stack: Vec<Value>,
    /// Incoming arguments of the current activation.
    pub args: Vec<Value>,
    pub flag_eq: bool,
}

impl SimState {
    pub fn new() -> Self {
        Self {
            regs: [Value::Undefined; 16],
            stack: Vec::new(),
            args: Vec::new(),
            flag_eq: false,
        }
    }

    #[inline]
    pub fn reg(&self, reg: Reg) -> Value {
        self.regs[reg.index()]
    }

    #[inline]
    pub fn set_reg(&mut self, reg: Reg, value: Value) {
        self.regs[reg.index()] = value;
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new()
    }
}

struct Frame {
    code: CodeHandle,
    bytes: Vec<u8>,
    pool: Vec<Value>,
    pc: u32,
}

/// The simulator proper. Frames snapshot their code object's bytes on
/// entry, matching the patching contract: a patch never changes the meaning
/// of an instruction already fetched by an active frame.
pub struct Simulator<'a> {
    pub ctx: &'a mut CompileContext,
    pub state: SimState,
    fuel: u64,
}

const DEFAULT_FUEL: u64 = 100_000;

impl<'a> Simulator<'a> {
    pub fn new(ctx: &'a mut CompileContext) -> Self {
        Self {
            ctx,
            state: SimState::new(),
            fuel: DEFAULT_FUEL,
        }
    }

    pub fn with_args(ctx: &'a mut CompileContext, args: Vec<Value>) -> Self {
        let mut sim = Self::new(ctx);
        sim.state.args = args;
        sim
    }

    fn enter(&self, code: CodeHandle) -> Frame {
        let obj = self.ctx.code_space.get(code);
        Frame {
            code,
            bytes: obj.bytes().to_vec(),
            pool: obj.pool().to_vec(),
            pc: 0,
        }
    }

    /// Execute `entry` to completion or the first debug break.
    pub fn run(&mut self, entry: CodeHandle) -> Result<Outcome> {
        let mut frames = vec![self.enter(entry)];
        loop {
            if self.fuel == 0 {
                return Err(Error::bailout("simulator fuel exhausted"));
            }
            self.fuel -= 1;

            let frame = frames.last_mut().expect("no active frame");
            let pc = frame.pc as usize;
            if pc + INSTR_SIZE as usize > frame.bytes.len() {
                // Fell off the end: treat like a return.
                frames.pop();
                if frames.is_empty() {
                    return Ok(Outcome::Return(self.state.reg(conv::RESULT)));
                }
                continue;
            }
            let instr = Instr::decode(&frame.bytes[pc..pc + INSTR_SIZE as usize]);
            frame.pc += INSTR_SIZE;
            let at = pc as u32;
            let current_code = frame.code;

            match instr.op {
                Op::Nop => {}
                Op::DebugBreak => {
                    return Ok(Outcome::DebugBreak {
                        code: current_code,
                        offset: at,
                    });
                }
                Op::Move => {
                    let v = self.state.reg(instr.rb);
                    self.state.set_reg(instr.ra, v);
                }
                Op::LoadImm => {
                    self.state
                        .set_reg(instr.ra, Value::Int(instr.imm as i32 as i64));
                }
                Op::LoadPool => {
                    let v = frame
                        .pool
                        .get(instr.imm as usize)
                        .copied()
                        .unwrap_or(Value::Undefined);
                    self.state.set_reg(instr.ra, v);
                }
                Op::LoadField => {
                    let base = self.state.reg(instr.rb);
                    let offset = instr.imm as i32;
                    let v = self.load_field(base, offset)?;
                    self.state.set_reg(instr.ra, v);
                }
                Op::StoreField => {
                    let base = self.state.reg(instr.ra);
                    let value = self.state.reg(instr.rb);
                    let offset = instr.imm as i32;
                    self.store_field(base, offset, value)?;
                }
                Op::LoadElem => {
                    let array = self.expect_array(instr.rb)?;
                    let v = self.ctx.heap.load_array_slot(array, instr.imm);
                    self.state.set_reg(instr.ra, v);
                }
                Op::StoreElem => {
                    let array = self.expect_array(instr.ra)?;
                    let value = self.state.reg(instr.rb);
                    self.ctx.heap.store_array_slot(array, instr.imm, value);
                }
                Op::LoadElemReg => {
                    let array = self.expect_array(instr.rb)?;
                    let index = self.expect_int(Reg::from_bits(instr.flag))? as u32;
                    let v = self.ctx.heap.load_array_slot(array, index);
                    self.state.set_reg(instr.ra, v);
                }
                Op::LoadShape => match self.state.reg(instr.rb) {
                    Value::Object(o) => {
                        let shape = self.ctx.heap.shape_of(o);
                        self.state.set_reg(instr.ra, Value::Shape(shape));
                    }
                    other => return Err(type_error("LoadShape", other)),
                },
                Op::LoadProto => match self.state.reg(instr.rb) {
                    Value::Shape(s) => {
                        let v = self
                            .ctx
                            .heap
                            .prototype_of(s)
                            .map(Value::Object)
                            .unwrap_or(Value::Undefined);
                        self.state.set_reg(instr.ra, v);
                    }
                    other => return Err(type_error("LoadProto", other)),
                },
                Op::LoadShared => match self.state.reg(instr.rb) {
                    Value::Function(f) => {
                        let shared = self.ctx.heap.shared_of(f);
                        self.state.set_reg(instr.ra, Value::Shared(shared));
                    }
                    other => return Err(type_error("LoadShared", other)),
                },
                Op::LoadNameHash => match self.state.reg(instr.rb) {
                    Value::Name(n) => {
                        let hash = self.ctx.heap.names.hash(n);
                        self.state.set_reg(instr.ra, Value::Int(hash as i64));
                    }
                    other => return Err(type_error("LoadNameHash", other)),
                },
                Op::LoadIdent => match self.state.reg(instr.rb) {
                    Value::Shape(s) => {
                        self.state
                            .set_reg(instr.ra, Value::Int(s.identity_hash() as i64));
                    }
                    Value::Name(n) => {
                        let hash = self.ctx.heap.names.hash(n);
                        self.state.set_reg(instr.ra, Value::Int(hash as i64));
                    }
                    other => return Err(type_error("LoadIdent", other)),
                },
                Op::LoadCodeFlags => match self.state.reg(instr.rb) {
                    Value::Code(c) => {
                        let bits = self.ctx.code_space.get(c).flags.bits();
                        self.state.set_reg(instr.ra, Value::Int(bits as i64));
                    }
                    // An empty cache slot never validates.
                    _ => self.state.set_reg(instr.ra, Value::Int(-1)),
                },
                Op::CmpReg => {
                    self.state.flag_eq = self.state.reg(instr.ra) == self.state.reg(instr.rb);
                }
                Op::CmpImm => {
                    let a = self.state.reg(instr.ra).as_int();
                    self.state.flag_eq = a == Some(instr.imm as i32 as i64);
                }
                Op::CmpPool => {
                    let expected = frame
                        .pool
                        .get(instr.imm as usize)
                        .copied()
                        .unwrap_or(Value::Undefined);
                    self.state.flag_eq = self.state.reg(instr.ra) == expected;
                }
                Op::Jump => {
                    frames.last_mut().unwrap().pc = instr.imm;
                }
                Op::JumpIfEq => {
                    if self.state.flag_eq {
                        frames.last_mut().unwrap().pc = instr.imm;
                    }
                }
                Op::JumpIfNe => {
                    if !self.state.flag_eq {
                        frames.last_mut().unwrap().pc = instr.imm;
                    }
                }
                Op::Call => {
                    let callee = self.enter(CodeHandle(instr.imm));
                    frames.push(callee);
                }
                Op::TailCall => {
                    let callee = self.enter(CodeHandle(instr.imm));
                    *frames.last_mut().unwrap() = callee;
                }
                Op::CallRuntime => {
                    runtime::invoke(instr.imm, self.ctx, &mut self.state)?;
                }
                Op::TailCallRuntime => {
                    runtime::invoke(instr.imm, self.ctx, &mut self.state)?;
                    frames.pop();
                    if frames.is_empty() {
                        return Ok(Outcome::Return(self.state.reg(conv::RESULT)));
                    }
                }
                Op::JumpCode => match self.state.reg(instr.rb) {
                    Value::Code(c) => {
                        let callee = self.enter(c);
                        *frames.last_mut().unwrap() = callee;
                    }
                    other => return Err(type_error("JumpCode", other)),
                },
                Op::Ret => {
                    frames.pop();
                    if frames.is_empty() {
                        return Ok(Outcome::Return(self.state.reg(conv::RESULT)));
                    }
                }
                Op::Push => {
                    let v = self.state.reg(instr.ra);
                    self.state.stack.push(v);
                }
                Op::Pop => {
                    let v = self.state.stack.pop().unwrap_or(Value::Undefined);
                    self.state.set_reg(instr.ra, v);
                }
                Op::Add | Op::Sub | Op::Xor | Op::And => {
                    let a = self.expect_int(instr.ra)?;
                    let b = self.expect_int(instr.rb)?;
                    let r = match instr.op {
                        Op::Add => a.wrapping_add(b),
                        Op::Sub => a.wrapping_sub(b),
                        Op::Xor => a ^ b,
                        _ => a & b,
                    };
                    self.state.set_reg(instr.ra, Value::Int(r));
                }
                Op::AddImm | Op::SubImm => {
                    let a = self.expect_int(instr.ra)?;
                    let b = instr.imm as i32 as i64;
                    let r = if instr.op == Op::AddImm {
                        a.wrapping_add(b)
                    } else {
                        a.wrapping_sub(b)
                    };
                    self.state.set_reg(instr.ra, Value::Int(r));
                }
                Op::XorImm | Op::AndImm => {
                    let a = self.expect_int(instr.ra)?;
                    let b = instr.imm as i64;
                    let r = if instr.op == Op::XorImm { a ^ b } else { a & b };
                    self.state.set_reg(instr.ra, Value::Int(r));
                }
                Op::LoadCacheField => {
                    let (table, field) = decode_cache_access(instr.flag);
                    let index = self.expect_int(instr.rb)? as u32;
                    let v = self.ctx.stub_cache.entry_field(table, index, field);
                    self.state.set_reg(instr.ra, v);
                }
                Op::RecordWrite => match self.state.reg(instr.ra) {
                    Value::Object(o) => {
                        if self.state.reg(instr.rb).is_heap_value() {
                            self.ctx.heap.record_write(o, instr.imm as i32);
                        }
                    }
                    other => return Err(type_error("RecordWrite", other)),
                },
                Op::CmpKind => {
                    let kind = crate::masm::ValueKind::from_bits(instr.flag);
                    let value = self.state.reg(instr.ra);
                    self.state.flag_eq = match kind {
                        crate::masm::ValueKind::Object => matches!(value, Value::Object(_)),
                        crate::masm::ValueKind::Function => matches!(value, Value::Function(_)),
                        crate::masm::ValueKind::Smi => matches!(value, Value::Smi(_)),
                        crate::masm::ValueKind::Undefined => value == Value::Undefined,
                    };
                }
                Op::AllocateYoung => {
                    let shape = match frame.pool.get(instr.imm as usize) {
                        Some(Value::Shape(s)) => *s,
                        other => {
                            return Err(Error::bailout(format!(
                                "AllocateYoung expects a shape constant, got {other:?}"
                            )))
                        }
                    };
                    match self.ctx.heap.allocate_young(shape) {
                        Ok(obj) => {
                            self.state.set_reg(instr.ra, Value::Object(obj));
                            self.state.flag_eq = true;
                        }
                        Err(_) => {
                            self.state.flag_eq = false;
                        }
                    }
                }
                Op::LoadArg => {
                    let v = self
                        .state
                        .args
                        .get(instr.imm as usize)
                        .copied()
                        .unwrap_or(Value::Undefined);
                    self.state.set_reg(instr.ra, v);
                }
                Op::LoadArgc => {
                    let argc = self.state.args.len() as i64;
                    self.state.set_reg(instr.ra, Value::Int(argc));
                }
            }
        }
    }

    fn load_field(&mut self, base: Value, offset: i32) -> Result<Value> {
        match base {
            Value::Object(o) => Ok(self.ctx.heap.load_raw_field(o, offset)),
            Value::Cell(c) if offset == CELL_VALUE_OFFSET => Ok(self.ctx.heap.cell_value(c)),
            Value::Shared(s) if offset == SHARED_CODE_OFFSET => Ok(self
                .ctx
                .heap
                .shared_info(s)
                .code
                .map(Value::Code)
                .unwrap_or(Value::Undefined)),
            other => Err(type_error("LoadField", other)),
        }
    }

    fn store_field(&mut self, base: Value, offset: i32, value: Value) -> Result<()> {
        match base {
            Value::Object(o) => {
                self.ctx.heap.store_raw_field(o, offset, value);
                Ok(())
            }
            Value::Cell(c) if offset == CELL_VALUE_OFFSET => {
                self.ctx.heap.set_cell_value(c, value);
                Ok(())
            }
            other => Err(type_error("StoreField", other)),
        }
    }

    fn expect_array(&self, reg: Reg) -> Result<crate::heap::ArrayRef> {
        match self.state.reg(reg) {
            Value::Array(a) => Ok(a),
            other => Err(type_error("array operand", other)),
        }
    }

    fn expect_int(&self, reg: Reg) -> Result<i64> {
        self.state
            .reg(reg)
            .as_int()
            .ok_or_else(|| type_error("integer operand", self.state.reg(reg)))
    }
}

fn type_error(op: &str, value: Value) -> Error {
    Error::bailout(format!("generated code type error in {op}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeFlags, CodeKind, IcState};
    use crate::heap::{InstanceType, OBJECT_HEADER_SIZE};
    use crate::masm::MacroAssembler;

    fn stub_flags() -> CodeFlags {
        CodeFlags::new(CodeKind::Stub, IcState::Uninitialized)
    }

    #[test]
    fn test_return_constant() {
        let mut ctx = CompileContext::new();
        let mut masm = MacroAssembler::new();
        masm.load_value(conv::RESULT, Value::Smi(42));
        masm.ret();
        let code = ctx.allocate_code(masm.finish(), stub_flags()).unwrap();
        let mut sim = Simulator::new(&mut ctx);
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(42)));
    }

    #[test]
    fn test_field_load_through_object() {
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 2);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 1, Value::Smi(9));

        let mut masm = MacroAssembler::new();
        // In-object field 1 of 2 sits one pointer past the header.
        masm.load_field(
            conv::RESULT,
            conv::RECEIVER,
            OBJECT_HEADER_SIZE as i32 + 8,
        );
        masm.ret();
        let code = ctx.allocate_code(masm.finish(), stub_flags()).unwrap();

        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(obj));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(9)));
    }

    #[test]
    fn test_branching() {
        let mut ctx = CompileContext::new();
        let mut masm = MacroAssembler::new();
        let mut not_equal = crate::masm::Label::new();
        masm.cmp_imm(conv::SCRATCH0, 5);
        masm.jump_if_ne(&mut not_equal);
        masm.load_value(conv::RESULT, Value::Smi(1));
        masm.ret();
        masm.bind(&mut not_equal);
        masm.load_value(conv::RESULT, Value::Smi(0));
        masm.ret();
        let code = ctx.allocate_code(masm.finish(), stub_flags()).unwrap();

        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::SCRATCH0, Value::Int(5));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(1)));

        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::SCRATCH0, Value::Int(6));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(0)));
    }

    #[test]
    fn test_call_and_return() {
        let mut ctx = CompileContext::new();
        let mut callee = MacroAssembler::new();
        callee.load_value(conv::RESULT, Value::Smi(7));
        callee.ret();
        let callee_code = ctx.allocate_code(callee.finish(), stub_flags()).unwrap();

        let mut caller = MacroAssembler::new();
        caller.call(callee_code);
        caller.ret();
        let caller_code = ctx.allocate_code(caller.finish(), stub_flags()).unwrap();

        let mut sim = Simulator::new(&mut ctx);
        assert_eq!(sim.run(caller_code).unwrap(), Outcome::Return(Value::Smi(7)));
    }

    #[test]
    fn test_debug_break_outcome() {
        let mut ctx = CompileContext::new();
        let trap = ctx.builtins.debug_break;
        let mut sim = Simulator::new(&mut ctx);
        match sim.run(trap).unwrap() {
            Outcome::DebugBreak { code, .. } => assert_eq!(code, trap),
            other => panic!("expected debug break, got {other:?}"),
        }
    }

    #[test]
    fn test_runtime_miss_call() {
        let mut ctx = CompileContext::new();
        let x = ctx.heap.names.intern("x");
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let shape = ctx.heap.transition_add_field(base, x);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(13));

        let miss = ctx.builtins.load_ic_miss;
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(obj));
        sim.state.set_reg(conv::NAME, Value::Name(x));
        assert_eq!(sim.run(miss).unwrap(), Outcome::Return(Value::Smi(13)));
    }

    #[test]
    fn test_allocate_young_failure_clears_flag() {
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        ctx.heap.set_young_budget(0);

        let mut masm = MacroAssembler::new();
        let mut fail = crate::masm::Label::new();
        masm.allocate_young(conv::RESULT, Value::Shape(shape));
        masm.jump_if_ne(&mut fail);
        masm.ret();
        masm.bind(&mut fail);
        masm.load_value(conv::RESULT, Value::TheHole);
        masm.ret();
        let code = ctx.allocate_code(masm.finish(), stub_flags()).unwrap();

        let mut sim = Simulator::new(&mut ctx);
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::TheHole));
    }

    #[test]
    fn test_load_arg_past_argc_is_undefined() {
        let mut ctx = CompileContext::new();
        let mut masm = MacroAssembler::new();
        masm.load_arg(conv::RESULT, 3);
        masm.ret();
        let code = ctx.allocate_code(masm.finish(), stub_flags()).unwrap();
        let mut sim = Simulator::with_args(&mut ctx, vec![Value::Smi(1)]);
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Undefined));
    }
}
