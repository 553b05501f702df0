//! Breakpoint and stepping patcher
//!
//! Breakpoints work by patching already-generated code: the relocation
//! table locates IC call sites, construct calls, return sequences, and the
//! reserved debug-break slots, and the patcher swaps call targets between
//! their normal entries and the debug-break trampolines. The original
//! bytes are preserved in the code object's shadow copy so every patch can
//! be undone.
//!
//! Persistent breakpoints and one-shot (stepping) flags are unioned: a
//! location stays patched while either requires it, and is restored only
//! when neither does. Patching is forward-only — the meaning of an
//! already-fetched return address never changes; frames already executing
//! are handled by the frame-drop protocol instead.

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::code::{CodeHandle, CodeKind, RelocKind};
use crate::context::CompileContext;
use crate::error::{Error, Result};
use crate::heap::SharedId;
use crate::masm::{Instr, Op, Reg, INSTR_SIZE};

/// Global debugger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugState {
    NoBreakPoints,
    HasBreakPoints,
}

/// Stepping modes exposed to the debugger front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    StepNone,
    /// Step out of the current function.
    StepOut,
    /// Step to the next statement in the current function.
    StepNext,
    /// Step into any call made by the current statement.
    StepIn,
    /// Minimal step, used for re-stepping after a break.
    StepMin,
}

/// What kind of site a breakable location is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakLocationKind {
    /// A patchable call to an IC or other code target.
    CodeTarget,
    /// A construct-call site.
    ConstructCall,
    /// The function's return sequence.
    Return,
    /// Reserved no-op padding at a statement boundary.
    DebugBreakSlot,
}

/// One breakable location within a code object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakLocation {
    /// Instruction-word offset of the patchable site.
    pub code_offset: u32,
    /// Nearest preceding expression position.
    pub position: u32,
    /// Nearest preceding statement position.
    pub statement_position: u32,
    pub kind: BreakLocationKind,
}

/// Walk a code object's relocation table yielding breakable locations, with
/// source positions threaded from the position markers in between.
pub fn break_locations(ctx: &CompileContext, code: CodeHandle) -> Vec<BreakLocation> {
    let object = ctx.code_space.get(code);
    let mut locations = Vec::new();
    let mut position = 0u32;
    let mut statement_position = 0u32;
    for reloc in object.reloc() {
        match reloc.kind {
            RelocKind::Position => position = reloc.payload,
            RelocKind::StatementPosition => {
                position = reloc.payload;
                statement_position = reloc.payload;
            }
            RelocKind::CodeTarget => locations.push(BreakLocation {
                code_offset: reloc.offset,
                position,
                statement_position,
                kind: BreakLocationKind::CodeTarget,
            }),
            RelocKind::ConstructCall => locations.push(BreakLocation {
                code_offset: reloc.offset,
                position,
                statement_position,
                kind: BreakLocationKind::ConstructCall,
            }),
            RelocKind::JsReturn => locations.push(BreakLocation {
                code_offset: reloc.offset,
                position: reloc.payload,
                statement_position: reloc.payload,
                kind: BreakLocationKind::Return,
            }),
            RelocKind::DebugBreakSlot => locations.push(BreakLocation {
                code_offset: reloc.offset,
                position,
                statement_position,
                kind: BreakLocationKind::DebugBreakSlot,
            }),
            RelocKind::EmbeddedObject => {}
        }
    }
    locations
}

/// Per-location bookkeeping: which breakpoint objects are attached and
/// whether a one-shot (stepping) flag is pending.
#[derive(Debug, Clone)]
pub struct BreakPointInfo {
    pub location: BreakLocation,
    pub break_objects: Vec<u32>,
    pub one_shot: bool,
}

impl BreakPointInfo {
    fn is_required(&self) -> bool {
        !self.break_objects.is_empty() || self.one_shot
    }
}

/// Side table for one function's breakpoints.
#[derive(Debug, Clone)]
pub struct DebugInfo {
    pub code: CodeHandle,
    pub break_points: Vec<BreakPointInfo>,
}

/// The debugger state machine and side tables.
pub struct Debug {
    state: DebugState,
    infos: FxHashMap<SharedId, DebugInfo>,
    /// Where each live breakpoint object is attached.
    break_index: FxHashMap<u32, (SharedId, u32)>,
    step_action: StepAction,
    step_count: u32,
    frame_drops: u64,
}

impl Debug {
    pub fn new() -> Self {
        Self {
            state: DebugState::NoBreakPoints,
            infos: FxHashMap::default(),
            break_index: FxHashMap::default(),
            step_action: StepAction::StepNone,
            step_count: 0,
            frame_drops: 0,
        }
    }

    pub fn state(&self) -> DebugState {
        self.state
    }

    pub fn has_break_points(&self) -> bool {
        self.state == DebugState::HasBreakPoints
    }

    /// Flip into the has-break-points regime. Callers discard optimized
    /// code and clear the stub cache around this (see [`set_break_point`]).
    pub fn prepare_for_break_points(&mut self) {
        self.state = DebugState::HasBreakPoints;
    }

    pub fn step_action(&self) -> StepAction {
        self.step_action
    }

    pub fn record_frame_drop(&mut self) {
        self.frame_drops += 1;
    }

    pub fn frame_drops(&self) -> u64 {
        self.frame_drops
    }

    pub fn debug_info(&self, shared: SharedId) -> Option<&DebugInfo> {
        self.infos.get(&shared)
    }
}

impl Default for Debug {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Patching
// ---------------------------------------------------------------------------

/// Attach `break_point` (an opaque debugger-side id) to the nearest
/// breakable location at or after `source_position` in `shared`'s code.
/// Returns the patched location.
pub fn set_break_point(
    ctx: &mut CompileContext,
    shared: SharedId,
    source_position: u32,
    break_point: u32,
) -> Result<BreakLocation> {
    let code = ctx
        .heap
        .shared_info(shared)
        .code
        .ok_or(Error::NoDebugInfo)?;

    if !ctx.debug.has_break_points() {
        prepare_for_break_points(ctx);
    }

    let location = break_locations(ctx, code)
        .into_iter()
        .find(|loc| loc.statement_position >= source_position || loc.position >= source_position)
        .ok_or(Error::InvalidBreakLocation {
            position: source_position,
        })?;

    let info = ctx.debug.infos.entry(shared).or_insert(DebugInfo {
        code,
        break_points: Vec::new(),
    });
    let index = match info
        .break_points
        .iter()
        .position(|bp| bp.location.code_offset == location.code_offset)
    {
        Some(index) => index,
        None => {
            info.break_points.push(BreakPointInfo {
                location,
                break_objects: Vec::new(),
                one_shot: false,
            });
            info.break_points.len() - 1
        }
    };
    let entry = &mut info.break_points[index];
    // Setting the same breakpoint twice has the same effect as once.
    if !entry.break_objects.contains(&break_point) {
        entry.break_objects.push(break_point);
    }
    ctx.debug
        .break_index
        .insert(break_point, (shared, location.code_offset));

    apply_patch(ctx, code, location);
    debug!(?shared, offset = location.code_offset, "breakpoint set");
    Ok(location)
}

/// Detach `break_point`; the location is restored only if no other
/// breakpoint or pending one-shot flag still requires it.
pub fn clear_break_point(ctx: &mut CompileContext, break_point: u32) -> Result<()> {
    let (shared, offset) = match ctx.debug.break_index.remove(&break_point) {
        Some(found) => found,
        None => return Ok(()),
    };
    let info = ctx.debug.infos.get_mut(&shared).ok_or(Error::NoDebugInfo)?;
    let code = info.code;
    let mut restore = None;
    if let Some(idx) = info
        .break_points
        .iter()
        .position(|bp| bp.location.code_offset == offset)
    {
        let entry = &mut info.break_points[idx];
        entry.break_objects.retain(|&id| id != break_point);
        if !entry.is_required() {
            restore = Some(entry.location);
            info.break_points.remove(idx);
        }
    }
    if let Some(location) = restore {
        undo_patch(ctx, code, location);
        debug!(?shared, offset, "breakpoint cleared");
    }
    Ok(())
}

/// Query whether the location nearest `source_position` currently carries a
/// live patch.
pub fn is_patched(ctx: &CompileContext, shared: SharedId, source_position: u32) -> bool {
    let info = match ctx.debug.infos.get(&shared) {
        Some(info) => info,
        None => return false,
    };
    let location = break_locations(ctx, info.code).into_iter().find(|loc| {
        loc.statement_position >= source_position || loc.position >= source_position
    });
    match location {
        Some(loc) => ctx
            .code_space
            .get(info.code)
            .word_differs_from_shadow(loc.code_offset),
        None => false,
    }
}

/// First-breakpoint transition: optimized code cannot cooperate with
/// statement-level breakpoints, so every function falls back to baseline,
/// and the stub cache is emptied so no site re-enters a stale stub.
pub fn prepare_for_break_points(ctx: &mut CompileContext) {
    let shared_ids: Vec<SharedId> = ctx.heap.shared_ids().collect();
    let mut discarded = 0usize;
    for shared in shared_ids {
        let info = ctx.heap.shared_info(shared);
        if let Some(code) = info.code {
            if ctx.code_space.get(code).flags.kind() == CodeKind::Optimized {
                let fallback = info.baseline_code;
                ctx.heap.shared_info_mut(shared).code = fallback;
                discarded += 1;
            }
        }
    }
    ctx.stub_cache.clear();
    ctx.debug.prepare_for_break_points();
    debug!(discarded, "entered has-break-points state");
}

fn apply_patch(ctx: &mut CompileContext, code: CodeHandle, location: BreakLocation) {
    let trampoline = match location.kind {
        BreakLocationKind::Return => ctx.builtins.debug_break_return,
        _ => ctx.builtins.debug_break,
    };
    let object = ctx.code_space.get_mut(code);
    object.ensure_shadow();
    match location.kind {
        BreakLocationKind::CodeTarget | BreakLocationKind::ConstructCall => {
            // The original target lives on in the shadow copy; only the
            // forward target changes.
            object.patch_call_target(location.code_offset, trampoline);
        }
        BreakLocationKind::Return | BreakLocationKind::DebugBreakSlot => {
            let word = Instr {
                op: Op::Call,
                ra: Reg::R0,
                rb: Reg::R0,
                flag: 0,
                imm: trampoline.0,
            }
            .encode();
            object.patch_instruction_word(location.code_offset, word);
        }
    }
}

fn undo_patch(ctx: &mut CompileContext, code: CodeHandle, location: BreakLocation) {
    let object = ctx.code_space.get_mut(code);
    match location.kind {
        BreakLocationKind::CodeTarget | BreakLocationKind::ConstructCall => {
            object.restore_instruction_word(location.code_offset);
        }
        BreakLocationKind::Return | BreakLocationKind::DebugBreakSlot => {
            // The slot was no-op padding; the shadow restores it wholesale.
            for word in 0..crate::masm::DEBUG_BREAK_SLOT_WORDS {
                object.restore_instruction_word(location.code_offset + word * INSTR_SIZE);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Stepping
// ---------------------------------------------------------------------------

/// Prepare a step: arm one-shot patches according to the action. One-shots
/// reuse the same patch mechanism as persistent breakpoints and are cleared
/// unconditionally at the next stop.
pub fn prepare_step(
    ctx: &mut CompileContext,
    shared: SharedId,
    action: StepAction,
    step_count: u32,
) -> Result<()> {
    ctx.debug.step_action = action;
    ctx.debug.step_count = step_count;
    match action {
        StepAction::StepNone => {
            clear_one_shot(ctx, shared);
            Ok(())
        }
        StepAction::StepOut => set_one_shot(ctx, shared, |loc| {
            loc.kind == BreakLocationKind::Return
        }),
        StepAction::StepIn | StepAction::StepNext | StepAction::StepMin => {
            set_one_shot(ctx, shared, |_| true)
        }
    }
}

/// Arm one-shot flags at every location accepted by `filter`.
fn set_one_shot(
    ctx: &mut CompileContext,
    shared: SharedId,
    filter: impl Fn(&BreakLocation) -> bool,
) -> Result<()> {
    let code = ctx
        .heap
        .shared_info(shared)
        .code
        .ok_or(Error::NoDebugInfo)?;
    if !ctx.debug.has_break_points() {
        prepare_for_break_points(ctx);
    }
    let locations: Vec<BreakLocation> = break_locations(ctx, code)
        .into_iter()
        .filter(|loc| filter(loc))
        .collect();
    let info = ctx.debug.infos.entry(shared).or_insert(DebugInfo {
        code,
        break_points: Vec::new(),
    });
    let mut to_patch = Vec::new();
    for location in locations {
        let existing = info
            .break_points
            .iter()
            .position(|bp| bp.location.code_offset == location.code_offset);
        match existing {
            Some(index) => info.break_points[index].one_shot = true,
            None => {
                info.break_points.push(BreakPointInfo {
                    location,
                    break_objects: Vec::new(),
                    one_shot: true,
                });
                to_patch.push(location);
            }
        }
    }
    for location in to_patch {
        apply_patch(ctx, code, location);
    }
    Ok(())
}

/// Clear every one-shot flag after a stop. Locations still required by a
/// persistent breakpoint stay patched; the rest are restored.
pub fn clear_one_shot(ctx: &mut CompileContext, shared: SharedId) {
    let info = match ctx.debug.infos.get_mut(&shared) {
        Some(info) => info,
        None => return,
    };
    let code = info.code;
    let mut to_restore = Vec::new();
    info.break_points.retain_mut(|entry| {
        entry.one_shot = false;
        if entry.is_required() {
            true
        } else {
            to_restore.push(entry.location);
            false
        }
    });
    for location in to_restore {
        undo_patch(ctx, code, location);
    }
    ctx.debug.step_action = StepAction::StepNone;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeFlags, IcState};
    use crate::heap::Value;
    use crate::masm::conv;
    use crate::masm::sim::{Outcome, Simulator};
    use crate::masm::MacroAssembler;

    /// A function body with one IC-guarded call site and a return sequence.
    fn compile_test_function(ctx: &mut CompileContext) -> SharedId {
        let shared = ctx.heap.new_shared_function("test", 0);
        let callee = ctx.builtins.return_undefined;
        let mut masm = MacroAssembler::new();
        masm.record_statement_position(10);
        masm.emit_ic_call(callee, 12);
        masm.record_statement_position(20);
        masm.load_value(conv::RESULT, Value::Smi(1));
        masm.emit_js_return(30);
        let flags = CodeFlags::new(CodeKind::Baseline, IcState::Uninitialized);
        let code = ctx.allocate_code(masm.finish(), flags).unwrap();
        ctx.heap.shared_info_mut(shared).code = Some(code);
        code_sanity(ctx, code);
        shared
    }

    fn code_sanity(ctx: &CompileContext, code: CodeHandle) {
        let locations = break_locations(ctx, code);
        assert!(locations
            .iter()
            .any(|l| l.kind == BreakLocationKind::CodeTarget));
        assert!(locations.iter().any(|l| l.kind == BreakLocationKind::Return));
        assert!(locations
            .iter()
            .any(|l| l.kind == BreakLocationKind::DebugBreakSlot));
    }

    fn run(ctx: &mut CompileContext, shared: SharedId) -> Outcome {
        let code = ctx.heap.shared_info(shared).code.unwrap();
        let mut sim = Simulator::new(ctx);
        sim.run(code).unwrap()
    }

    #[test]
    fn test_set_break_point_patches_call_site() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        assert_eq!(run(&mut ctx, shared), Outcome::Return(Value::Smi(1)));

        set_break_point(&mut ctx, shared, 10, 1).unwrap();
        assert!(ctx.debug.has_break_points());
        assert!(is_patched(&ctx, shared, 10));
        match run(&mut ctx, shared) {
            Outcome::DebugBreak { .. } => {}
            other => panic!("expected debug break, got {other:?}"),
        }
    }

    #[test]
    fn test_clear_break_point_restores_site() {
        // Scenario: set, clear, query, then a normal call must not trap.
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        set_break_point(&mut ctx, shared, 10, 7).unwrap();
        clear_break_point(&mut ctx, 7).unwrap();
        assert!(!is_patched(&ctx, shared, 10));
        assert_eq!(run(&mut ctx, shared), Outcome::Return(Value::Smi(1)));
    }

    #[test]
    fn test_break_point_idempotent() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        let loc1 = set_break_point(&mut ctx, shared, 10, 3).unwrap();
        let loc2 = set_break_point(&mut ctx, shared, 10, 3).unwrap();
        assert_eq!(loc1, loc2);
        let info = ctx.debug.debug_info(shared).unwrap();
        assert_eq!(info.break_points.len(), 1);
        assert_eq!(info.break_points[0].break_objects.len(), 1);

        clear_break_point(&mut ctx, 3).unwrap();
        assert!(!is_patched(&ctx, shared, 10));
    }

    #[test]
    fn test_two_break_points_same_location() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        set_break_point(&mut ctx, shared, 10, 1).unwrap();
        set_break_point(&mut ctx, shared, 10, 2).unwrap();
        clear_break_point(&mut ctx, 1).unwrap();
        // The second breakpoint still requires the patch.
        assert!(is_patched(&ctx, shared, 10));
        clear_break_point(&mut ctx, 2).unwrap();
        assert!(!is_patched(&ctx, shared, 10));
    }

    #[test]
    fn test_one_shot_union_with_persistent() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        set_break_point(&mut ctx, shared, 10, 9).unwrap();
        prepare_step(&mut ctx, shared, StepAction::StepNext, 1).unwrap();
        // Clearing one-shots must keep the persistent location patched.
        clear_one_shot(&mut ctx, shared);
        assert!(is_patched(&ctx, shared, 10));
        clear_break_point(&mut ctx, 9).unwrap();
        assert!(!is_patched(&ctx, shared, 10));
    }

    #[test]
    fn test_step_out_patches_only_returns() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        prepare_step(&mut ctx, shared, StepAction::StepOut, 1).unwrap();
        let info = ctx.debug.debug_info(shared).unwrap();
        assert!(info
            .break_points
            .iter()
            .all(|bp| bp.location.kind == BreakLocationKind::Return));
        assert!(!info.break_points.is_empty());
        clear_one_shot(&mut ctx, shared);
        assert_eq!(run(&mut ctx, shared), Outcome::Return(Value::Smi(1)));
    }

    #[test]
    fn test_stepping_traps_then_clears() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        prepare_step(&mut ctx, shared, StepAction::StepIn, 1).unwrap();
        match run(&mut ctx, shared) {
            Outcome::DebugBreak { .. } => {}
            other => panic!("expected debug break, got {other:?}"),
        }
        clear_one_shot(&mut ctx, shared);
        assert_eq!(ctx.debug.step_action(), StepAction::StepNone);
        assert_eq!(run(&mut ctx, shared), Outcome::Return(Value::Smi(1)));
    }

    #[test]
    fn test_first_break_point_discards_optimized_code() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);

        // Give another function optimized code with a baseline fallback.
        let hot = ctx.heap.new_shared_function("hot", 0);
        let baseline = {
            let mut masm = MacroAssembler::new();
            masm.ret();
            ctx.allocate_code(
                masm.finish(),
                CodeFlags::new(CodeKind::Baseline, IcState::Uninitialized),
            )
            .unwrap()
        };
        let optimized = {
            let mut masm = MacroAssembler::new();
            masm.ret();
            ctx.allocate_code(
                masm.finish(),
                CodeFlags::new(CodeKind::Optimized, IcState::Uninitialized),
            )
            .unwrap()
        };
        ctx.heap.shared_info_mut(hot).baseline_code = Some(baseline);
        ctx.heap.shared_info_mut(hot).code = Some(optimized);

        // Prime the stub cache so the clear is observable.
        let x = ctx.heap.names.intern("x");
        let base = ctx.heap.new_shape(crate::heap::InstanceType::Object, 1);
        let shape = ctx.heap.transition_add_field(base, x);
        let obj = ctx.heap.new_object(shape);
        crate::ic::compute_load_stub(&mut ctx, obj, x).unwrap();

        set_break_point(&mut ctx, shared, 10, 4).unwrap();
        assert_eq!(ctx.heap.shared_info(hot).code, Some(baseline));
        assert_eq!(ctx.stub_cache.stats().clears, 1);
    }

    #[test]
    fn test_no_breakable_location_error() {
        let mut ctx = CompileContext::new();
        let shared = compile_test_function(&mut ctx);
        let err = set_break_point(&mut ctx, shared, 1000, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidBreakLocation { position: 1000 }));
    }

    #[test]
    fn test_missing_code_is_reported() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("lazy", 0);
        let err = set_break_point(&mut ctx, shared, 0, 1).unwrap_err();
        assert_eq!(err, Error::NoDebugInfo);
    }
}
