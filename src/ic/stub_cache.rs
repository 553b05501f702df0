//! The stub cache: memoized specialized code by (name, shape, flags)
//!
//! Two flat fixed-size tables (primary and secondary) map a property name,
//! receiver shape, and operation flags to previously generated code. The
//! cache is a hint, never a source of truth: a slot may be overwritten at
//! any time, and the probe re-validates the flags stored in the hit code
//! object's header before trusting it, so a stale entry degrades to a miss.
//!
//! The probe sequence is also emitted as position-independent machine code
//! (see [`StubCache::generate_probe`]) so IC call sites can inline the full
//! probe instead of paying a call/return per property access.

use rustc_hash::FxHashMap;

use crate::code::{CodeFlags, CodeHandle, CodeSpace};
use crate::heap::{NameId, NameTable, ShapeId, Value};
use crate::ic::key::CacheKey;
use crate::masm::{conv, CacheField, CacheTable, Label, MacroAssembler, Reg};

/// Primary table size; must be a power of two for mask hashing.
pub const PRIMARY_TABLE_SIZE: usize = 2048;

/// Secondary table size; must be a power of two.
pub const SECONDARY_TABLE_SIZE: usize = 512;

const PRIMARY_MASK: u32 = (PRIMARY_TABLE_SIZE - 1) as u32;
const SECONDARY_MASK: u32 = (SECONDARY_TABLE_SIZE - 1) as u32;

/// One table slot: `{key fingerprint, code entry}` stored as its parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheEntry {
    pub name: Option<NameId>,
    pub shape: Option<ShapeId>,
    pub flags: u32,
    pub code: Option<CodeHandle>,
}

impl CacheEntry {
    fn is_empty(&self) -> bool {
        self.name.is_none()
    }

    fn matches(&self, name: NameId, flags: CodeFlags) -> bool {
        self.name == Some(name) && self.flags == flags.bits()
    }
}

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub demotions: u64,
    pub clears: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

/// The global stub cache plus the shared-stub memo table.
pub struct StubCache {
    primary: Vec<CacheEntry>,
    secondary: Vec<CacheEntry>,
    /// Shared (non-IC) stubs memoized by dense cache key.
    shared: FxHashMap<CacheKey, CodeHandle>,
    stats: CacheStats,
}

impl StubCache {
    pub fn new() -> Self {
        Self {
            primary: vec![CacheEntry::default(); PRIMARY_TABLE_SIZE],
            secondary: vec![CacheEntry::default(); SECONDARY_TABLE_SIZE],
            shared: FxHashMap::default(),
            stats: CacheStats::default(),
        }
    }

    /// Primary-table index for `(name, shape, flags)`.
    #[inline]
    pub fn primary_offset(name_hash: u32, shape: ShapeId, flags: CodeFlags) -> u32 {
        (name_hash ^ shape.identity_hash() ^ flags.bits()) & PRIMARY_MASK
    }

    /// Secondary-table index, derived from the primary index.
    #[inline]
    pub fn secondary_offset(primary: u32, name_hash: u32, flags: CodeFlags) -> u32 {
        primary
            .wrapping_sub(name_hash)
            .wrapping_add(flags.bits())
            & SECONDARY_MASK
    }

    /// Look up `(name, shape, flags)`; a miss is not an error, it routes the
    /// caller to the slow path.
    pub fn probe(
        &mut self,
        names: &NameTable,
        code_space: &CodeSpace,
        name: NameId,
        shape: ShapeId,
        flags: CodeFlags,
    ) -> Option<CodeHandle> {
        let name_hash = names.hash(name);
        let primary = Self::primary_offset(name_hash, shape, flags);
        if let Some(code) = self.validate_hit(code_space, self.primary[primary as usize], name, flags)
        {
            self.stats.hits += 1;
            return Some(code);
        }
        let secondary = Self::secondary_offset(primary, name_hash, flags);
        if let Some(code) =
            self.validate_hit(code_space, self.secondary[secondary as usize], name, flags)
        {
            self.stats.hits += 1;
            return Some(code);
        }
        self.stats.misses += 1;
        None
    }

    /// A hit only counts if the slot key matches and the code object's own
    /// header agrees with the probed flags.
    fn validate_hit(
        &self,
        code_space: &CodeSpace,
        entry: CacheEntry,
        name: NameId,
        flags: CodeFlags,
    ) -> Option<CodeHandle> {
        if !entry.matches(name, flags) {
            return None;
        }
        let code = entry.code?;
        if code_space.get(code).flags != flags {
            return None;
        }
        Some(code)
    }

    /// Insert a freshly compiled entry, unconditionally overwriting the
    /// primary slot. A colliding resident is demoted to its secondary slot
    /// rather than resolved: overwriting an unrelated entry only costs a
    /// future miss.
    pub fn insert(
        &mut self,
        names: &NameTable,
        name: NameId,
        shape: ShapeId,
        flags: CodeFlags,
        code: CodeHandle,
    ) {
        let name_hash = names.hash(name);
        let primary = Self::primary_offset(name_hash, shape, flags);
        let old = self.primary[primary as usize];
        if !old.is_empty() && !old.matches(name, flags) {
            let old_hash = names.hash(old.name.unwrap());
            let old_flags = CodeFlags::from_raw(old.flags);
            let secondary = Self::secondary_offset(primary, old_hash, old_flags);
            self.secondary[secondary as usize] = old;
            self.stats.demotions += 1;
        }
        self.primary[primary as usize] = CacheEntry {
            name: Some(name),
            shape: Some(shape),
            flags: flags.bits(),
            code: Some(code),
        };
        self.stats.inserts += 1;
    }

    /// Drop every entry (full compaction pause, debugger activation).
    pub fn clear(&mut self) {
        for slot in self.primary.iter_mut() {
            *slot = CacheEntry::default();
        }
        for slot in self.secondary.iter_mut() {
            *slot = CacheEntry::default();
        }
        self.stats.clears += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    // -- shared stub memoization -------------------------------------------

    pub fn shared_stub(&self, key: CacheKey) -> Option<CodeHandle> {
        self.shared.get(&key).copied()
    }

    pub fn insert_shared_stub(&mut self, key: CacheKey, code: CodeHandle) {
        self.shared.insert(key, code);
    }

    // -- simulator view ----------------------------------------------------

    /// Read one field of a table slot, as generated probe code sees it.
    pub fn entry_field(&self, table: CacheTable, index: u32, field: CacheField) -> Value {
        let entry = match table {
            CacheTable::Primary => self.primary[(index & PRIMARY_MASK) as usize],
            CacheTable::Secondary => self.secondary[(index & SECONDARY_MASK) as usize],
        };
        match field {
            CacheField::Name => entry.name.map(Value::Name).unwrap_or(Value::Undefined),
            CacheField::Flags => Value::Int(entry.flags as i64),
            CacheField::Code => entry.code.map(Value::Code).unwrap_or(Value::Undefined),
        }
    }

    // -- machine-code probe ------------------------------------------------

    /// Emit the inline probe sequence.
    ///
    /// On a validated hit control transfers to the cached code; on any
    /// mismatch control reaches `miss`. The receiver and name registers are
    /// left untouched, so the miss handler sees the original operands.
    pub fn generate_probe(
        masm: &mut MacroAssembler,
        flags: CodeFlags,
        receiver: Reg,
        name: Reg,
        miss: &mut Label,
    ) {
        let s0 = conv::SCRATCH0;
        let s1 = conv::SCRATCH1;
        let s2 = conv::SCRATCH2;
        let mut try_secondary = Label::new();

        // Primary index: (name.hash ^ shape.identity ^ flags) & mask.
        masm.load_name_hash(s0, name);
        masm.load_shape(s1, receiver);
        masm.load_identity(s1, s1);
        masm.xor(s0, s1);
        masm.xor_imm(s0, flags.bits());
        masm.and_imm(s0, PRIMARY_MASK);

        Self::generate_table_check(
            masm,
            flags,
            name,
            s0,
            s1,
            s2,
            CacheTable::Primary,
            &mut try_secondary,
        );

        masm.bind(&mut try_secondary);
        // Secondary index: (primary - name.hash + flags) & mask.
        masm.load_name_hash(s1, name);
        masm.sub(s0, s1);
        masm.add_imm(s0, flags.bits() as i32);
        masm.and_imm(s0, SECONDARY_MASK);

        Self::generate_table_check(
            masm,
            flags,
            name,
            s0,
            s1,
            s2,
            CacheTable::Secondary,
            miss,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn generate_table_check(
        masm: &mut MacroAssembler,
        flags: CodeFlags,
        name: Reg,
        index: Reg,
        scratch_a: Reg,
        scratch_b: Reg,
        table: CacheTable,
        on_mismatch: &mut Label,
    ) {
        masm.load_cache_field(scratch_b, index, table, CacheField::Name);
        masm.cmp_reg(scratch_b, name);
        masm.jump_if_ne(on_mismatch);
        masm.load_cache_field(scratch_b, index, table, CacheField::Flags);
        masm.cmp_imm(scratch_b, flags.bits() as i32);
        masm.jump_if_ne(on_mismatch);
        masm.load_cache_field(scratch_b, index, table, CacheField::Code);
        // Re-validate against the code object's own header before jumping.
        masm.load_code_flags(scratch_a, scratch_b);
        masm.cmp_imm(scratch_a, flags.bits() as i32);
        masm.jump_if_ne(on_mismatch);
        masm.jump_code(scratch_b);
    }
}

impl Default for StubCache {
    fn default() -> Self {
        Self::new()
    }
}
