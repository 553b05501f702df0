//! Store stub generators
//!
//! Store sites guard only the receiver's shape (stores never walk the
//! chain), then either write a known field, perform a shape transition,
//! write a global cell, or hand off to a callback/interceptor helper.
//! A transition that needs more backing storage than the object has tail
//! calls the grow-storage helper instead of completing inline.

use tracing::debug;

use crate::code::{CodeFlags, CodeHandle, CodeKind, IcState};
use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{
    field_offset, AccessorId, FieldOffset, NameId, ObjectRef, ShapeId, Value, ARRAY_HEADER_SLOTS,
    CELL_VALUE_OFFSET, OFFSET_PROPERTIES, OFFSET_SHAPE,
};
use crate::masm::{conv, Label, MacroAssembler, Reg};

/// Compiler for store IC stubs.
pub struct StoreStubCompiler;

impl StoreStubCompiler {
    fn ic_flags(ctx: &CompileContext, object: ObjectRef) -> CodeFlags {
        let shape = ctx.heap.shape_of(object);
        let instance_type = ctx.heap.shape(shape).instance_type;
        CodeFlags::with_details(CodeKind::StoreIc, IcState::Monomorphic, instance_type, 0)
    }

    /// Store to an existing field, or add one through a shape transition.
    pub fn compile_store_field(
        ctx: &mut CompileContext,
        object: ObjectRef,
        index: u32,
        transition: Option<ShapeId>,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        let layout_shape = transition.unwrap_or(object_shape);
        let offset = field_offset(ctx.heap.shape(layout_shape), index);

        if let Some(target) = transition {
            let needs_growth = match offset {
                FieldOffset::External(ext) => ext >= ctx.heap.properties_capacity(object),
                FieldOffset::InObject(_) => false,
            };
            if needs_growth {
                // No spare storage: the grow helper reallocates, performs
                // the transition, and completes the store.
                masm.load_value(Reg::R3, Value::Shape(target));
                masm.tail_call(ctx.builtins.grow_storage);
                masm.bind(&mut miss);
                masm.tail_call(ctx.builtins.store_ic_miss);
                let flags = Self::ic_flags(ctx, object);
                let code = ctx.allocate_code(masm.finish(), flags)?;
                debug!(
                    name = ctx.heap.names.resolve(name),
                    ?code,
                    "compiled grow-transition store stub"
                );
                return Ok(code);
            }
            // Storage has room: rewrite the shape pointer in place.
            masm.load_value(conv::SCRATCH1, Value::Shape(target));
            masm.store_field(conv::RECEIVER, OFFSET_SHAPE, conv::SCRATCH1);
        }

        generate_fast_property_store(&mut masm, offset);
        masm.move_reg(conv::RESULT, conv::VALUE);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.store_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled field store stub");
        Ok(code)
    }

    /// Store a global property through its cell. An emptied cell means the
    /// property was deleted; the store must miss rather than resurrect it.
    pub fn compile_store_global(
        ctx: &mut CompileContext,
        object: ObjectRef,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        let cell = ctx.heap.ensure_property_cell(object, name)?;
        masm.load_value(conv::SCRATCH1, Value::Cell(cell));
        masm.load_field(conv::SCRATCH2, conv::SCRATCH1, CELL_VALUE_OFFSET);
        masm.cmp_value(conv::SCRATCH2, Value::TheHole);
        masm.jump_if_eq(&mut miss);
        masm.store_field(conv::SCRATCH1, CELL_VALUE_OFFSET, conv::VALUE);
        masm.move_reg(conv::RESULT, conv::VALUE);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.store_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled global store stub");
        Ok(code)
    }

    /// Store through a native accessor: marshal and tail-call the setter
    /// trampoline.
    pub fn compile_store_callback(
        ctx: &mut CompileContext,
        object: ObjectRef,
        accessor: AccessorId,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        masm.move_reg(Reg::R3, conv::RECEIVER);
        masm.load_imm(Reg::R4, accessor.0 as i32);
        masm.tail_call(ctx.builtins.store_callback);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.store_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled callback store stub");
        Ok(code)
    }

    /// Store through a named interceptor: always the generic helper; store
    /// traps have no profitable inline shape.
    pub fn compile_store_interceptor(
        ctx: &mut CompileContext,
        object: ObjectRef,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        masm.tail_call(ctx.builtins.store_interceptor);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.store_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled interceptor store stub");
        Ok(code)
    }
}

/// Emit the fast field store with its write barrier. In-object fields
/// write straight into the instance; overflow fields indirect through the
/// properties array, with the barrier recorded against the array slot.
pub fn generate_fast_property_store(masm: &mut MacroAssembler, offset: FieldOffset) {
    match offset {
        FieldOffset::InObject(offset) => {
            masm.store_field(conv::RECEIVER, offset, conv::VALUE);
            masm.record_write(conv::RECEIVER, offset, conv::VALUE);
        }
        FieldOffset::External(ext) => {
            masm.load_field(conv::SCRATCH2, conv::RECEIVER, OFFSET_PROPERTIES);
            masm.store_elem(conv::SCRATCH2, ARRAY_HEADER_SLOTS + ext, conv::VALUE);
            masm.record_write(conv::RECEIVER, OFFSET_PROPERTIES, conv::VALUE);
        }
    }
}
