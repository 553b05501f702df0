//! Inline construct stub
//!
//! When a constructor's initial shape is finalized (its sequence of
//! `this.x =` assignments has stopped reshaping instances) and no
//! breakpoint is pending, construction is inlined: allocate in the young
//! generation, initialize the header, populate each statically-known slot
//! from the incoming arguments or embedded constants (undefined for
//! arguments not actually supplied), and return the tagged object. Any
//! precondition failure falls through to the fully general path.

use tracing::debug;

use crate::code::{CodeFlags, CodeHandle, CodeKind, IcState};
use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{
    field_offset, FieldOffset, FunctionId, InstanceType, ShapeFlags, ThisAssignment, Value,
};
use crate::masm::{conv, Label, MacroAssembler};

/// Compiler for the per-constructor construct stub.
pub struct ConstructStubCompiler;

impl ConstructStubCompiler {
    /// True when the inline stub may be emitted for this constructor.
    pub fn can_inline(ctx: &CompileContext, function: FunctionId) -> bool {
        if !ctx.config.inline_construct_enabled || ctx.debug.has_break_points() {
            return false;
        }
        let shared = ctx.heap.shared_of(function);
        let info = ctx.heap.shared_info(shared);
        let shape = match info.initial_shape {
            Some(shape) => shape,
            None => return false,
        };
        if !ctx
            .heap
            .shape(shape)
            .flags
            .contains(ShapeFlags::CONSTRUCTION_FINALIZED)
        {
            return false;
        }
        // Every statically-known slot must land in-object; anything else
        // takes the general path.
        info.this_assignments.iter().all(|(name, _)| {
            matches!(
                ctx.heap.lookup_behind_interceptor(shape, *name),
                crate::heap::LookupResult::Field { index }
                    if matches!(
                        field_offset(ctx.heap.shape(shape), index),
                        FieldOffset::InObject(_)
                    )
            )
        })
    }

    /// Compile the construct stub for `function`. When inlining is not
    /// possible the stub is a plain tail call into the general path.
    pub fn compile(ctx: &mut CompileContext, function: FunctionId) -> Result<CodeHandle> {
        let flags = CodeFlags::with_details(
            CodeKind::ConstructIc,
            IcState::Monomorphic,
            InstanceType::Function,
            0,
        );

        if !Self::can_inline(ctx, function) {
            let mut masm = MacroAssembler::new();
            masm.tail_call(ctx.builtins.construct_generic);
            let code = ctx.allocate_code(masm.finish(), flags)?;
            debug!(?function, ?code, "compiled generic construct stub");
            return Ok(code);
        }

        let shared = ctx.heap.shared_of(function);
        let info = ctx.heap.shared_info(shared);
        let shape = info.initial_shape.expect("checked by can_inline");
        let assignments = info.this_assignments.clone();

        let mut masm = MacroAssembler::new();
        let mut generic = Label::new();

        // Allocation failure falls through to the general path, which can
        // allocate outside the young generation.
        masm.allocate_young(conv::SCRATCH1, Value::Shape(shape));
        masm.jump_if_ne(&mut generic);

        for (name, assignment) in &assignments {
            let index = match ctx.heap.lookup_behind_interceptor(shape, *name) {
                crate::heap::LookupResult::Field { index } => index,
                _ => unreachable!("checked by can_inline"),
            };
            let offset = match field_offset(ctx.heap.shape(shape), index) {
                FieldOffset::InObject(offset) => offset,
                FieldOffset::External(_) => unreachable!("checked by can_inline"),
            };
            match assignment {
                ThisAssignment::Argument(k) => {
                    masm.load_arg(conv::SCRATCH0, *k as u32);
                }
                ThisAssignment::Constant(value) => {
                    masm.load_value(conv::SCRATCH0, *value);
                }
            }
            masm.store_field(conv::SCRATCH1, offset, conv::SCRATCH0);
        }

        masm.move_reg(conv::RESULT, conv::SCRATCH1);
        masm.ret();

        masm.bind(&mut generic);
        masm.tail_call(ctx.builtins.construct_generic);

        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(?function, ?code, "compiled inline construct stub");
        Ok(code)
    }
}
