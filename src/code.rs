//! Code objects, relocation metadata, and the code-object store
//!
//! A code object is an opaque executable blob with a small typed header and
//! an embedded relocation table. The relocation table serves both the
//! collector (finding embedded heap pointers) and the debugger (finding call
//! targets, position markers, and debug-break slots). The cache and call
//! sites hold non-owning handles; [`CodeSpace`] owns the bytes.

use crate::error::{Error, Result};
use crate::heap::{InstanceType, Value};

/// Handle to a code object inside a [`CodeSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeHandle(pub u32);

impl CodeHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What kind of code a code object holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeKind {
    /// Baseline (unoptimized) function code.
    Baseline,
    /// Optimized function code produced by the two-tier pipeline.
    Optimized,
    /// A shared stub memoized by cache key.
    Stub,
    /// A fixed runtime entry point (miss handlers, trampolines).
    Builtin,
    LoadIc,
    KeyedLoadIc,
    StoreIc,
    KeyedStoreIc,
    CallIc,
    ConstructIc,
}

impl CodeKind {
    /// Dense discriminant used in the packed flags word.
    pub fn bits(self) -> u32 {
        match self {
            CodeKind::Baseline => 0,
            CodeKind::Optimized => 1,
            CodeKind::Stub => 2,
            CodeKind::Builtin => 3,
            CodeKind::LoadIc => 4,
            CodeKind::KeyedLoadIc => 5,
            CodeKind::StoreIc => 6,
            CodeKind::KeyedStoreIc => 7,
            CodeKind::CallIc => 8,
            CodeKind::ConstructIc => 9,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits {
            0 => CodeKind::Baseline,
            1 => CodeKind::Optimized,
            2 => CodeKind::Stub,
            3 => CodeKind::Builtin,
            4 => CodeKind::LoadIc,
            5 => CodeKind::KeyedLoadIc,
            6 => CodeKind::StoreIc,
            7 => CodeKind::KeyedStoreIc,
            8 => CodeKind::CallIc,
            9 => CodeKind::ConstructIc,
            _ => CodeKind::Stub,
        }
    }

    /// True for the IC kinds whose call sites the debugger patches.
    pub fn is_inline_cache(self) -> bool {
        matches!(
            self,
            CodeKind::LoadIc
                | CodeKind::KeyedLoadIc
                | CodeKind::StoreIc
                | CodeKind::KeyedStoreIc
                | CodeKind::CallIc
                | CodeKind::ConstructIc
        )
    }
}

/// Specialization state of an inline cache stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IcState {
    Uninitialized,
    Premonomorphic,
    Monomorphic,
    Megamorphic,
    Generic,
}

impl IcState {
    pub fn bits(self) -> u32 {
        match self {
            IcState::Uninitialized => 0,
            IcState::Premonomorphic => 1,
            IcState::Monomorphic => 2,
            IcState::Megamorphic => 3,
            IcState::Generic => 4,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits {
            1 => IcState::Premonomorphic,
            2 => IcState::Monomorphic,
            3 => IcState::Megamorphic,
            4 => IcState::Generic,
            _ => IcState::Uninitialized,
        }
    }
}

// Bit layout of the packed flags word. The dense encoding lives only here,
// at the boundary where flags are stored in code headers and hashed into the
// stub cache.
const KIND_SHIFT: u32 = 0;
const KIND_BITS: u32 = 4;
const STATE_SHIFT: u32 = KIND_SHIFT + KIND_BITS;
const STATE_BITS: u32 = 3;
const TYPE_SHIFT: u32 = STATE_SHIFT + STATE_BITS;
const TYPE_BITS: u32 = 3;
const ARGC_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
const ARGC_BITS: u32 = 8;

/// Packed (kind, ic-state, instance-type discriminant, argc) header word.
///
/// Probe hits re-validate this word against the probe's expectation before
/// trusting the cached entry, so a colliding cache slot can only cost a
/// miss, never a wrong dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeFlags(u32);

impl CodeFlags {
    pub fn new(kind: CodeKind, state: IcState) -> Self {
        Self::with_details(kind, state, InstanceType::Object, 0)
    }

    pub fn with_details(
        kind: CodeKind,
        state: IcState,
        instance_type: InstanceType,
        argc: u32,
    ) -> Self {
        debug_assert!(kind.bits() < (1 << KIND_BITS));
        debug_assert!(state.bits() < (1 << STATE_BITS));
        debug_assert!(instance_type.discriminant() < (1 << TYPE_BITS));
        debug_assert!(argc < (1 << ARGC_BITS));
        CodeFlags(
            (kind.bits() << KIND_SHIFT)
                | (state.bits() << STATE_SHIFT)
                | (instance_type.discriminant() << TYPE_SHIFT)
                | (argc << ARGC_SHIFT),
        )
    }

    pub fn kind(self) -> CodeKind {
        CodeKind::from_bits((self.0 >> KIND_SHIFT) & ((1 << KIND_BITS) - 1))
    }

    pub fn ic_state(self) -> IcState {
        IcState::from_bits((self.0 >> STATE_SHIFT) & ((1 << STATE_BITS) - 1))
    }

    pub fn instance_type(self) -> InstanceType {
        InstanceType::from_discriminant((self.0 >> TYPE_SHIFT) & ((1 << TYPE_BITS) - 1))
    }

    pub fn argc(self) -> u32 {
        (self.0 >> ARGC_SHIFT) & ((1 << ARGC_BITS) - 1)
    }

    /// Raw bits, used when hashing flags into the stub cache tables.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Rebuild a flags value from raw bits (cache-table bookkeeping only).
    #[inline]
    pub fn from_raw(bits: u32) -> CodeFlags {
        CodeFlags(bits)
    }
}

// ---------------------------------------------------------------------------
// Relocation
// ---------------------------------------------------------------------------

/// Kind of a relocation table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    /// Expression-level source position marker.
    Position,
    /// Statement-level source position marker (breakpoint candidates).
    StatementPosition,
    /// A patchable call target; payload is the callee's handle.
    CodeTarget,
    /// A call target that is a construct call.
    ConstructCall,
    /// The function's return sequence.
    JsReturn,
    /// No-op padding reserved so a breakpoint can be patched in without
    /// moving any other code.
    DebugBreakSlot,
    /// An embedded heap reference; payload identifies the value.
    EmbeddedObject,
}

/// One relocation entry: `(code offset, kind, payload)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocInfo {
    pub offset: u32,
    pub kind: RelocKind,
    pub payload: u32,
}

/// Unassembled output of the macro assembler.
#[derive(Debug, Clone)]
pub struct CodeDesc {
    pub bytes: Vec<u8>,
    pub reloc: Vec<RelocInfo>,
    /// Tagged constants referenced by pool index from the instruction
    /// stream. Embedded heap references live here so the collector can
    /// update them through the relocation table.
    pub pool: Vec<Value>,
}

/// An executable, relocatable blob with a typed header.
#[derive(Debug, Clone)]
pub struct CodeObject {
    pub flags: CodeFlags,
    bytes: Vec<u8>,
    reloc: Vec<RelocInfo>,
    pool: Vec<Value>,
    /// Shadow copy of the original bytes, materialized the first time the
    /// debugger patches this object so patches can be undone.
    shadow: Option<Vec<u8>>,
}

impl CodeObject {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn pool(&self) -> &[Value] {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn reloc(&self) -> &[RelocInfo] {
        &self.reloc
    }

    /// Read the call target payload at a `CodeTarget`/`ConstructCall` site.
    /// `offset` is the instruction-word offset recorded in the reloc entry.
    pub fn call_target_at(&self, offset: u32) -> CodeHandle {
        let imm = self.read_imm(offset);
        CodeHandle(imm)
    }

    /// Redirect the call at `offset` to `target`.
    ///
    /// Only forward targets (calls not yet jumped through) may be patched;
    /// the meaning of already-fetched return addresses never changes.
    pub fn patch_call_target(&mut self, offset: u32, target: CodeHandle) {
        self.write_imm(offset, target.0);
    }

    /// Overwrite one instruction word in place. Used by the breakpoint
    /// patcher to turn a debug-break slot's padding into a live call.
    pub fn patch_instruction_word(&mut self, offset: u32, word: [u8; 8]) {
        let start = offset as usize;
        self.bytes[start..start + 8].copy_from_slice(&word);
    }

    /// Make sure the pristine copy of the bytes exists, then return it.
    pub fn ensure_shadow(&mut self) -> &[u8] {
        if self.shadow.is_none() {
            self.shadow = Some(self.bytes.clone());
        }
        self.shadow.as_deref().unwrap()
    }

    pub fn has_shadow(&self) -> bool {
        self.shadow.is_some()
    }

    /// Restore one instruction word from the shadow copy.
    pub fn restore_instruction_word(&mut self, offset: u32) {
        if let Some(shadow) = &self.shadow {
            let start = offset as usize;
            let word: [u8; 8] = shadow[start..start + 8].try_into().unwrap();
            self.bytes[start..start + 8].copy_from_slice(&word);
        }
    }

    /// Compare one instruction word against the shadow copy.
    pub fn word_differs_from_shadow(&self, offset: u32) -> bool {
        match &self.shadow {
            Some(shadow) => {
                let start = offset as usize;
                self.bytes[start..start + 8] != shadow[start..start + 8]
            }
            None => false,
        }
    }

    fn read_imm(&self, word_offset: u32) -> u32 {
        let start = word_offset as usize + 4;
        u32::from_le_bytes(self.bytes[start..start + 4].try_into().unwrap())
    }

    fn write_imm(&mut self, word_offset: u32, imm: u32) {
        let start = word_offset as usize + 4;
        self.bytes[start..start + 4].copy_from_slice(&imm.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------
// Code space
// ---------------------------------------------------------------------------

/// The store that owns all code objects.
///
/// Allocation is by handle; exhaustion surfaces as a typed error that every
/// compiler entry point propagates rather than panicking.
pub struct CodeSpace {
    objects: Vec<CodeObject>,
    capacity_bytes: usize,
    used_bytes: usize,
}

/// Default code-space capacity. Generous for tests; configurable for
/// exhaustion scenarios.
pub const DEFAULT_CODE_CAPACITY: usize = 4 << 20;

impl CodeSpace {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CODE_CAPACITY)
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            objects: Vec::new(),
            capacity_bytes,
            used_bytes: 0,
        }
    }

    /// Allocate a code object from an assembled descriptor.
    pub fn allocate(&mut self, desc: CodeDesc, flags: CodeFlags) -> Result<CodeHandle> {
        let size = desc.bytes.len();
        if self.used_bytes + size > self.capacity_bytes {
            return Err(Error::CodeSpaceExhausted {
                requested: size,
                available: self.capacity_bytes - self.used_bytes,
            });
        }
        self.used_bytes += size;
        let handle = CodeHandle(self.objects.len() as u32);
        self.objects.push(CodeObject {
            flags,
            bytes: desc.bytes,
            reloc: desc.reloc,
            pool: desc.pool,
            shadow: None,
        });
        Ok(handle)
    }

    pub fn get(&self, handle: CodeHandle) -> &CodeObject {
        &self.objects[handle.index()]
    }

    pub fn get_mut(&mut self, handle: CodeHandle) -> &mut CodeObject {
        &mut self.objects[handle.index()]
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes
    }
}

impl Default for CodeSpace {
    fn default() -> Self {
        Self::new()
    }
}
