//! Macro assembler for the reference architecture
//!
//! The design is architecture-parametric; this crate implements one
//! reference architecture: a fixed-width ISA with twelve general registers
//! plus frame and stack pointers. Every instruction occupies one 8-byte
//! word — `[opcode, ra, rb, flag, imm:u32 LE]` — so call-target patching
//! and debug-break slots have fixed offsets and lengths.
//!
//! Tagged constants are referenced through a per-code-object literal pool;
//! pool entries holding heap references are mirrored in the relocation
//! table as `EmbeddedObject` entries.

pub mod sim;

use crate::code::{CodeDesc, CodeHandle, RelocInfo, RelocKind};
use crate::heap::Value;

/// Size of one instruction word in bytes.
pub const INSTR_SIZE: u32 = 8;

/// Number of no-op words reserved in a debug-break slot.
pub const DEBUG_BREAK_SLOT_WORDS: u32 = 2;

/// General-purpose registers of the reference architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    Fp,
    Sp,
}

impl Reg {
    pub fn bits(self) -> u8 {
        match self {
            Reg::R0 => 0,
            Reg::R1 => 1,
            Reg::R2 => 2,
            Reg::R3 => 3,
            Reg::R4 => 4,
            Reg::R5 => 5,
            Reg::R6 => 6,
            Reg::R7 => 7,
            Reg::R8 => 8,
            Reg::R9 => 9,
            Reg::R10 => 10,
            Reg::R11 => 11,
            Reg::Fp => 12,
            Reg::Sp => 13,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Reg::R0,
            1 => Reg::R1,
            2 => Reg::R2,
            3 => Reg::R3,
            4 => Reg::R4,
            5 => Reg::R5,
            6 => Reg::R6,
            7 => Reg::R7,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::Fp,
            _ => Reg::Sp,
        }
    }

    /// Index into the simulator's register file.
    #[inline]
    pub fn index(self) -> usize {
        self.bits() as usize
    }
}

/// The IC calling convention for the reference architecture.
///
/// Every stub in this crate is compiled against these assignments; miss
/// handlers re-read receiver and name from the same registers, so stubs
/// must leave them undisturbed on the miss path.
pub mod conv {
    use super::Reg;

    /// Receiver object on entry to every IC stub; also the result register.
    pub const RECEIVER: Reg = Reg::R0;
    /// Property name on entry to load/store/call ICs.
    pub const NAME: Reg = Reg::R1;
    /// Value to store, on entry to store ICs.
    pub const VALUE: Reg = Reg::R2;
    pub const SCRATCH0: Reg = Reg::R3;
    pub const SCRATCH1: Reg = Reg::R4;
    pub const SCRATCH2: Reg = Reg::R5;
    pub const SCRATCH3: Reg = Reg::R6;
    /// Argument count on entry to call and construct ICs.
    pub const ARGC: Reg = Reg::R7;
    /// Callee function object, on entry to construct stubs.
    pub const CALLEE: Reg = Reg::R8;
    pub const RESULT: Reg = Reg::R0;

    /// Fixed argument registers for runtime-helper calls.
    pub const RUNTIME_ARGS: [Reg; 4] = [Reg::R0, Reg::R1, Reg::R2, Reg::R3];
}

/// Opcodes of the reference architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Nop = 0,
    /// Trap into the debugger.
    DebugBreak = 1,
    /// `ra <- rb`.
    Move = 2,
    /// `ra <- imm` as an untagged integer (sign-extended).
    LoadImm = 3,
    /// `ra <- pool[imm]`.
    LoadPool = 4,
    /// `ra <- [rb + imm]` (object header/in-object slot, or cell value).
    LoadField = 5,
    /// `[ra + imm] <- rb`.
    StoreField = 6,
    /// `ra <- array(rb)[imm]`.
    LoadElem = 7,
    /// `array(ra)[imm] <- rb`.
    StoreElem = 8,
    /// `ra <- array(rb)[reg(flag)]`.
    LoadElemReg = 9,
    /// `ra <- shape_of(rb)`.
    LoadShape = 10,
    /// `ra <- prototype_of(shape rb)`, Undefined at chain end.
    LoadProto = 11,
    /// `ra <- shared_descriptor_of(function rb)`.
    LoadShared = 12,
    /// `ra <- hash(name rb)` as an untagged integer.
    LoadNameHash = 13,
    /// `ra <- identity bits of rb` (shape identity for cache hashing).
    LoadIdent = 14,
    /// `ra <- header flags of code object rb`.
    LoadCodeFlags = 15,
    /// Compare `ra` with `rb`, setting the condition flag.
    CmpReg = 16,
    /// Compare `ra` with the untagged integer `imm`.
    CmpImm = 17,
    /// Compare `ra` with `pool[imm]`.
    CmpPool = 18,
    Jump = 19,
    JumpIfEq = 20,
    JumpIfNe = 21,
    /// Call the code object `imm`; patchable, mirrored as a CodeTarget.
    Call = 22,
    /// Tail-call the code object `imm`.
    TailCall = 23,
    /// Call runtime helper `imm` with arguments in the runtime registers.
    CallRuntime = 24,
    /// Tail-call runtime helper `imm`.
    TailCallRuntime = 25,
    /// Tail-transfer to the code object held in `rb`.
    JumpCode = 26,
    Ret = 27,
    Push = 28,
    Pop = 29,
    /// Untagged integer ALU: `ra <- ra op rb` / `ra <- ra op imm`.
    Add = 30,
    Sub = 31,
    Xor = 32,
    And = 33,
    AddImm = 34,
    SubImm = 35,
    XorImm = 36,
    AndImm = 37,
    /// `ra <- stub_cache[table(flag)][rb].field(flag)`.
    LoadCacheField = 38,
    /// Emit a write-barrier record for `[ra + imm]`.
    RecordWrite = 39,
    /// `ra <- allocate_young(shape pool[imm])`; condition flag set on
    /// success, cleared on failure (ra untouched).
    AllocateYoung = 40,
    /// `ra <- args[imm]`, Undefined when past the actual argument count.
    LoadArg = 41,
    /// `ra <- actual argument count`.
    LoadArgc = 42,
    /// Compare the kind tag of `ra` against `flag` (see [`ValueKind`]).
    CmpKind = 43,
}

impl Op {
    pub fn from_bits(bits: u8) -> Op {
        match bits {
            1 => Op::DebugBreak,
            2 => Op::Move,
            3 => Op::LoadImm,
            4 => Op::LoadPool,
            5 => Op::LoadField,
            6 => Op::StoreField,
            7 => Op::LoadElem,
            8 => Op::StoreElem,
            9 => Op::LoadElemReg,
            10 => Op::LoadShape,
            11 => Op::LoadProto,
            12 => Op::LoadShared,
            13 => Op::LoadNameHash,
            14 => Op::LoadIdent,
            15 => Op::LoadCodeFlags,
            16 => Op::CmpReg,
            17 => Op::CmpImm,
            18 => Op::CmpPool,
            19 => Op::Jump,
            20 => Op::JumpIfEq,
            21 => Op::JumpIfNe,
            22 => Op::Call,
            23 => Op::TailCall,
            24 => Op::CallRuntime,
            25 => Op::TailCallRuntime,
            26 => Op::JumpCode,
            27 => Op::Ret,
            28 => Op::Push,
            29 => Op::Pop,
            30 => Op::Add,
            31 => Op::Sub,
            32 => Op::Xor,
            33 => Op::And,
            34 => Op::AddImm,
            35 => Op::SubImm,
            36 => Op::XorImm,
            37 => Op::AndImm,
            38 => Op::LoadCacheField,
            39 => Op::RecordWrite,
            40 => Op::AllocateYoung,
            41 => Op::LoadArg,
            42 => Op::LoadArgc,
            43 => Op::CmpKind,
            _ => Op::Nop,
        }
    }
}

/// Value kind tags testable by `CmpKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Object = 0,
    Function = 1,
    Smi = 2,
    Undefined = 3,
}

impl ValueKind {
    pub fn from_bits(bits: u8) -> ValueKind {
        match bits {
            0 => ValueKind::Object,
            1 => ValueKind::Function,
            2 => ValueKind::Smi,
            _ => ValueKind::Undefined,
        }
    }
}

/// Which stub-cache table a `LoadCacheField` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTable {
    Primary,
    Secondary,
}

/// Which field of a stub-cache entry a `LoadCacheField` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheField {
    Name,
    Flags,
    Code,
}

/// Pack (table, field) into the flag byte of a `LoadCacheField`.
pub fn cache_access_flag(table: CacheTable, field: CacheField) -> u8 {
    let t = match table {
        CacheTable::Primary => 0,
        CacheTable::Secondary => 1,
    };
    let f = match field {
        CacheField::Name => 0,
        CacheField::Flags => 1,
        CacheField::Code => 2,
    };
    (t << 2) | f
}

/// Decode the flag byte of a `LoadCacheField`.
pub fn decode_cache_access(flag: u8) -> (CacheTable, CacheField) {
    let table = if flag & 0b100 != 0 {
        CacheTable::Secondary
    } else {
        CacheTable::Primary
    };
    let field = match flag & 0b11 {
        0 => CacheField::Name,
        1 => CacheField::Flags,
        _ => CacheField::Code,
    };
    (table, field)
}

/// A decoded instruction word.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Instr {
    pub op: Op,
    pub ra: Reg,
    pub rb: Reg,
    pub flag: u8,
    pub imm: u32,
}

impl Instr {
    pub fn decode(word: &[u8]) -> Instr {
        Instr {
            op: Op::from_bits(word[0]),
            ra: Reg::from_bits(word[1]),
            rb: Reg::from_bits(word[2]),
            flag: word[3],
            imm: u32::from_le_bytes(word[4..8].try_into().unwrap()),
        }
    }

    pub fn encode(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[0] = self.op as u8;
        out[1] = self.ra.bits();
        out[2] = self.rb.bits();
        out[3] = self.flag;
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }
}

/// An unbound or bound jump target.
///
/// Forward references record fixup sites; binding patches them all.
#[derive(Debug, Default)]
pub struct Label {
    pos: Option<u32>,
    fixups: Vec<u32>,
}

impl Label {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_bound(&self) -> bool {
        self.pos.is_some()
    }

    pub fn position(&self) -> Option<u32> {
        self.pos
    }
}

/// The macro assembler: an append-only instruction buffer with labels,
/// relocation recording, and a literal pool.
pub struct MacroAssembler {
    bytes: Vec<u8>,
    reloc: Vec<RelocInfo>,
    pool: Vec<Value>,
}

impl MacroAssembler {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            reloc: Vec::new(),
            pool: Vec::new(),
        }
    }

    /// Current program counter (byte offset of the next instruction).
    #[inline]
    pub fn pc(&self) -> u32 {
        self.bytes.len() as u32
    }

    fn emit(&mut self, op: Op, ra: Reg, rb: Reg, flag: u8, imm: u32) -> u32 {
        let at = self.pc();
        let word = Instr {
            op,
            ra,
            rb,
            flag,
            imm,
        }
        .encode();
        self.bytes.extend_from_slice(&word);
        at
    }

    /// Intern a value in the literal pool, recording an `EmbeddedObject`
    /// reloc entry for heap references.
    fn pool_index(&mut self, value: Value, at: u32) -> u32 {
        let idx = self.pool.len() as u32;
        self.pool.push(value);
        if value.is_heap_value() || matches!(value, Value::Shape(_) | Value::Name(_) | Value::Code(_)) {
            self.reloc.push(RelocInfo {
                offset: at,
                kind: RelocKind::EmbeddedObject,
                payload: idx,
            });
        }
        idx
    }

    // -- plain instructions ------------------------------------------------

    pub fn nop(&mut self) {
        self.emit(Op::Nop, Reg::R0, Reg::R0, 0, 0);
    }

    pub fn debug_break(&mut self) {
        self.emit(Op::DebugBreak, Reg::R0, Reg::R0, 0, 0);
    }

    pub fn move_reg(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::Move, dst, src, 0, 0);
    }

    pub fn load_imm(&mut self, dst: Reg, imm: i32) {
        self.emit(Op::LoadImm, dst, Reg::R0, 0, imm as u32);
    }

    /// Load a tagged constant through the literal pool.
    pub fn load_value(&mut self, dst: Reg, value: Value) {
        let at = self.pc();
        let idx = self.pool_index(value, at);
        self.emit(Op::LoadPool, dst, Reg::R0, 0, idx);
    }

    pub fn load_field(&mut self, dst: Reg, base: Reg, offset: i32) {
        self.emit(Op::LoadField, dst, base, 0, offset as u32);
    }

    pub fn store_field(&mut self, base: Reg, offset: i32, src: Reg) {
        self.emit(Op::StoreField, base, src, 0, offset as u32);
    }

    pub fn load_elem(&mut self, dst: Reg, array: Reg, slot: u32) {
        self.emit(Op::LoadElem, dst, array, 0, slot);
    }

    pub fn store_elem(&mut self, array: Reg, slot: u32, src: Reg) {
        self.emit(Op::StoreElem, array, src, 0, slot);
    }

    pub fn load_elem_reg(&mut self, dst: Reg, array: Reg, index: Reg) {
        self.emit(Op::LoadElemReg, dst, array, index.bits(), 0);
    }

    pub fn load_shape(&mut self, dst: Reg, object: Reg) {
        self.emit(Op::LoadShape, dst, object, 0, 0);
    }

    pub fn load_prototype(&mut self, dst: Reg, shape: Reg) {
        self.emit(Op::LoadProto, dst, shape, 0, 0);
    }

    pub fn load_shared(&mut self, dst: Reg, function: Reg) {
        self.emit(Op::LoadShared, dst, function, 0, 0);
    }

    pub fn load_name_hash(&mut self, dst: Reg, name: Reg) {
        self.emit(Op::LoadNameHash, dst, name, 0, 0);
    }

    pub fn load_identity(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::LoadIdent, dst, src, 0, 0);
    }

    pub fn load_code_flags(&mut self, dst: Reg, code: Reg) {
        self.emit(Op::LoadCodeFlags, dst, code, 0, 0);
    }

    pub fn cmp_reg(&mut self, a: Reg, b: Reg) {
        self.emit(Op::CmpReg, a, b, 0, 0);
    }

    pub fn cmp_imm(&mut self, a: Reg, imm: i32) {
        self.emit(Op::CmpImm, a, Reg::R0, 0, imm as u32);
    }

    /// Compare a register against a tagged constant (e.g. a shape check).
    pub fn cmp_value(&mut self, a: Reg, value: Value) {
        let at = self.pc();
        let idx = self.pool_index(value, at);
        self.emit(Op::CmpPool, a, Reg::R0, 0, idx);
    }

    pub fn push(&mut self, src: Reg) {
        self.emit(Op::Push, src, Reg::R0, 0, 0);
    }

    pub fn pop(&mut self, dst: Reg) {
        self.emit(Op::Pop, dst, Reg::R0, 0, 0);
    }

    pub fn add(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::Add, dst, src, 0, 0);
    }

    pub fn sub(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::Sub, dst, src, 0, 0);
    }

    pub fn xor(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::Xor, dst, src, 0, 0);
    }

    pub fn and(&mut self, dst: Reg, src: Reg) {
        self.emit(Op::And, dst, src, 0, 0);
    }

    pub fn add_imm(&mut self, dst: Reg, imm: i32) {
        self.emit(Op::AddImm, dst, Reg::R0, 0, imm as u32);
    }

    pub fn sub_imm(&mut self, dst: Reg, imm: i32) {
        self.emit(Op::SubImm, dst, Reg::R0, 0, imm as u32);
    }

    pub fn xor_imm(&mut self, dst: Reg, imm: u32) {
        self.emit(Op::XorImm, dst, Reg::R0, 0, imm);
    }

    pub fn and_imm(&mut self, dst: Reg, imm: u32) {
        self.emit(Op::AndImm, dst, Reg::R0, 0, imm);
    }

    pub fn load_cache_field(
        &mut self,
        dst: Reg,
        index: Reg,
        table: CacheTable,
        field: CacheField,
    ) {
        self.emit(
            Op::LoadCacheField,
            dst,
            index,
            cache_access_flag(table, field),
            0,
        );
    }

    /// Emit a write-barrier record for `[object + offset]`. The barrier is
    /// skipped at run time when `value` holds a primitive.
    pub fn record_write(&mut self, object: Reg, offset: i32, value: Reg) {
        self.emit(Op::RecordWrite, object, value, 0, offset as u32);
    }

    pub fn cmp_kind(&mut self, a: Reg, kind: ValueKind) {
        self.emit(Op::CmpKind, a, Reg::R0, kind as u8, 0);
    }

    /// Try-allocate in the young generation; branches must follow on the
    /// condition flag (eq = success).
    pub fn allocate_young(&mut self, dst: Reg, shape: Value) {
        let at = self.pc();
        let idx = self.pool_index(shape, at);
        self.emit(Op::AllocateYoung, dst, Reg::R0, 0, idx);
    }

    pub fn load_arg(&mut self, dst: Reg, index: u32) {
        self.emit(Op::LoadArg, dst, Reg::R0, 0, index);
    }

    pub fn load_argc(&mut self, dst: Reg) {
        self.emit(Op::LoadArgc, dst, Reg::R0, 0, 0);
    }

    pub fn ret(&mut self) {
        self.emit(Op::Ret, Reg::R0, Reg::R0, 0, 0);
    }

    // -- control flow ------------------------------------------------------

    fn emit_branch(&mut self, op: Op, label: &mut Label) {
        let at = self.emit(op, Reg::R0, Reg::R0, 0, u32::MAX);
        match label.pos {
            Some(target) => self.patch_branch(at, target),
            None => label.fixups.push(at),
        }
    }

    pub fn jump(&mut self, label: &mut Label) {
        self.emit_branch(Op::Jump, label);
    }

    pub fn jump_if_eq(&mut self, label: &mut Label) {
        self.emit_branch(Op::JumpIfEq, label);
    }

    pub fn jump_if_ne(&mut self, label: &mut Label) {
        self.emit_branch(Op::JumpIfNe, label);
    }

    /// Bind `label` to the current position, patching pending fixups.
    pub fn bind(&mut self, label: &mut Label) {
        debug_assert!(label.pos.is_none(), "label bound twice");
        let target = self.pc();
        label.pos = Some(target);
        let fixups = std::mem::take(&mut label.fixups);
        for at in fixups {
            self.patch_branch(at, target);
        }
    }

    fn patch_branch(&mut self, at: u32, target: u32) {
        let start = at as usize + 4;
        self.bytes[start..start + 4].copy_from_slice(&target.to_le_bytes());
    }

    /// Tail-transfer to the code object in `code`.
    pub fn jump_code(&mut self, code: Reg) {
        self.emit(Op::JumpCode, Reg::R0, code, 0, 0);
    }

    // -- calls -------------------------------------------------------------

    /// Emit a patchable call; the site is recorded as a `CodeTarget`.
    pub fn call(&mut self, target: CodeHandle) -> u32 {
        let at = self.emit(Op::Call, Reg::R0, Reg::R0, 0, target.0);
        self.reloc.push(RelocInfo {
            offset: at,
            kind: RelocKind::CodeTarget,
            payload: target.0,
        });
        at
    }

    /// Emit a patchable tail call; also recorded as a `CodeTarget`.
    pub fn tail_call(&mut self, target: CodeHandle) -> u32 {
        let at = self.emit(Op::TailCall, Reg::R0, Reg::R0, 0, target.0);
        self.reloc.push(RelocInfo {
            offset: at,
            kind: RelocKind::CodeTarget,
            payload: target.0,
        });
        at
    }

    pub fn call_runtime(&mut self, id: u32) {
        self.emit(Op::CallRuntime, Reg::R0, Reg::R0, 0, id);
    }

    pub fn tail_call_runtime(&mut self, id: u32) {
        self.emit(Op::TailCallRuntime, Reg::R0, Reg::R0, 0, id);
    }

    // -- markers and debug support ----------------------------------------

    /// Record an expression position marker at the current pc.
    pub fn record_position(&mut self, position: u32) {
        self.reloc.push(RelocInfo {
            offset: self.pc(),
            kind: RelocKind::Position,
            payload: position,
        });
    }

    /// Record a statement position marker at the current pc.
    pub fn record_statement_position(&mut self, position: u32) {
        self.reloc.push(RelocInfo {
            offset: self.pc(),
            kind: RelocKind::StatementPosition,
            payload: position,
        });
    }

    /// Reserve a debug-break slot: fixed-length no-op padding the debugger
    /// can later replace with a call, without moving any other code.
    pub fn record_debug_break_slot(&mut self) {
        self.reloc.push(RelocInfo {
            offset: self.pc(),
            kind: RelocKind::DebugBreakSlot,
            payload: 0,
        });
        for _ in 0..DEBUG_BREAK_SLOT_WORDS {
            self.nop();
        }
    }

    /// Emit an IC-guarded call site: the mandatory debug-break slot, then
    /// the patchable call to the IC entry.
    pub fn emit_ic_call(&mut self, target: CodeHandle, position: u32) -> u32 {
        self.record_position(position);
        self.record_debug_break_slot();
        self.call(target)
    }

    /// Emit the function return sequence with its `JsReturn` marker and the
    /// padding the debugger patches for break-on-return.
    pub fn emit_js_return(&mut self, position: u32) {
        self.reloc.push(RelocInfo {
            offset: self.pc(),
            kind: RelocKind::JsReturn,
            payload: position,
        });
        for _ in 0..DEBUG_BREAK_SLOT_WORDS {
            self.nop();
        }
        self.ret();
    }

    /// Finish assembly.
    pub fn finish(self) -> CodeDesc {
        CodeDesc {
            bytes: self.bytes,
            reloc: self.reloc,
            pool: self.pool,
        }
    }
}

impl Default for MacroAssembler {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Disassembler
// ---------------------------------------------------------------------------

/// Render an instruction stream for dumps and tests.
pub fn disassemble(bytes: &[u8], pool: &[Value]) -> String {
    let mut out = String::new();
    let mut pc = 0usize;
    while pc + INSTR_SIZE as usize <= bytes.len() {
        let instr = Instr::decode(&bytes[pc..pc + INSTR_SIZE as usize]);
        let pool_str = |idx: u32| -> String {
            pool.get(idx as usize)
                .map(|v| format!("{v:?}"))
                .unwrap_or_else(|| format!("pool[{idx}]?"))
        };
        let text = match instr.op {
            Op::Nop => "nop".to_string(),
            Op::DebugBreak => "debug_break".to_string(),
            Op::Move => format!("mov {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadImm => format!("ldi {:?}, #{}", instr.ra, instr.imm as i32),
            Op::LoadPool => format!("ldp {:?}, {}", instr.ra, pool_str(instr.imm)),
            Op::LoadField => {
                format!("ldfld {:?}, [{:?}+{}]", instr.ra, instr.rb, instr.imm as i32)
            }
            Op::StoreField => {
                format!("stfld [{:?}+{}], {:?}", instr.ra, instr.imm as i32, instr.rb)
            }
            Op::LoadElem => format!("ldelem {:?}, {:?}[{}]", instr.ra, instr.rb, instr.imm),
            Op::StoreElem => format!("stelem {:?}[{}], {:?}", instr.ra, instr.imm, instr.rb),
            Op::LoadElemReg => format!(
                "ldelem {:?}, {:?}[{:?}]",
                instr.ra,
                instr.rb,
                Reg::from_bits(instr.flag)
            ),
            Op::LoadShape => format!("ldshape {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadProto => format!("ldproto {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadShared => format!("ldshared {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadNameHash => format!("ldhash {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadIdent => format!("ldident {:?}, {:?}", instr.ra, instr.rb),
            Op::LoadCodeFlags => format!("ldcflags {:?}, {:?}", instr.ra, instr.rb),
            Op::CmpReg => format!("cmp {:?}, {:?}", instr.ra, instr.rb),
            Op::CmpImm => format!("cmp {:?}, #{}", instr.ra, instr.imm as i32),
            Op::CmpPool => format!("cmp {:?}, {}", instr.ra, pool_str(instr.imm)),
            Op::Jump => format!("jmp {:#x}", instr.imm),
            Op::JumpIfEq => format!("jeq {:#x}", instr.imm),
            Op::JumpIfNe => format!("jne {:#x}", instr.imm),
            Op::Call => format!("call code#{}", instr.imm),
            Op::TailCall => format!("tcall code#{}", instr.imm),
            Op::CallRuntime => format!("callrt {}", instr.imm),
            Op::TailCallRuntime => format!("tcallrt {}", instr.imm),
            Op::JumpCode => format!("jmpcode {:?}", instr.rb),
            Op::Ret => "ret".to_string(),
            Op::Push => format!("push {:?}", instr.ra),
            Op::Pop => format!("pop {:?}", instr.ra),
            Op::Add => format!("add {:?}, {:?}", instr.ra, instr.rb),
            Op::Sub => format!("sub {:?}, {:?}", instr.ra, instr.rb),
            Op::Xor => format!("xor {:?}, {:?}", instr.ra, instr.rb),
            Op::And => format!("and {:?}, {:?}", instr.ra, instr.rb),
            Op::AddImm => format!("add {:?}, #{}", instr.ra, instr.imm as i32),
            Op::SubImm => format!("sub {:?}, #{}", instr.ra, instr.imm as i32),
            Op::XorImm => format!("xor {:?}, #{:#x}", instr.ra, instr.imm),
            Op::AndImm => format!("and {:?}, #{:#x}", instr.ra, instr.imm),
            Op::LoadCacheField => {
                let (table, field) = decode_cache_access(instr.flag);
                format!("ldcache {:?}, {table:?}.{field:?}[{:?}]", instr.ra, instr.rb)
            }
            Op::RecordWrite => format!(
                "wb [{:?}+{}], {:?}",
                instr.ra, instr.imm as i32, instr.rb
            ),
            Op::CmpKind => format!(
                "cmpk {:?}, {:?}",
                instr.ra,
                ValueKind::from_bits(instr.flag)
            ),
            Op::AllocateYoung => {
                format!("allocy {:?}, {}", instr.ra, pool_str(instr.imm))
            }
            Op::LoadArg => format!("ldarg {:?}, {}", instr.ra, instr.imm),
            Op::LoadArgc => format!("ldargc {:?}", instr.ra),
        };
        out.push_str(&format!("{pc:6}  {text}\n"));
        pc += INSTR_SIZE as usize;
    }
    out
}
