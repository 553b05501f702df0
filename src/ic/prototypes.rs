//! Prototype-chain verification
//!
//! Every specialized access is preceded by proof that the receiver's chain
//! still matches what the stub was compiled against: shape compares along
//! the compile-time chain, property-cell emptiness checks for global-like
//! intermediates (declaring a property on a global does not change its
//! shape), loads through the live shape's prototype slot when a prototype
//! may be relocated, and negative-lookup probes for dictionary-mode
//! intermediates (their shape does not encode per-property presence).
//!
//! The checker is purely a verifier: every failure jumps to the caller's
//! `miss` label, and the caller decides what a miss means.

use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{
    NameId, ObjectRef, ShapeFlags, Value, ARRAY_HEADER_SLOTS, CELL_VALUE_OFFSET,
    DICT_NEGATIVE_LOOKUP_PROBES, OFFSET_PROPERTIES,
};
use crate::masm::{Label, MacroAssembler, Reg};

/// Caller-saved temporaries the negative dictionary probe may clobber.
const DICT_TEMP0: Reg = Reg::R9;
const DICT_TEMP1: Reg = Reg::R10;
const DICT_TEMP2: Reg = Reg::R11;

/// Emit the guard sequence proving that `object`'s chain up to `holder`
/// still matches the compile-time observation. Returns the register holding
/// the holder (which is `object_reg` itself for a zero-length chain).
///
/// Register discipline: `object_reg` and the IC name register are left
/// untouched so the miss handler sees the original operands; `holder_reg`
/// and `scratch` are clobbered.
#[allow(clippy::too_many_arguments)]
pub fn check_prototypes(
    masm: &mut MacroAssembler,
    ctx: &mut CompileContext,
    object: ObjectRef,
    object_reg: Reg,
    holder: ObjectRef,
    holder_reg: Reg,
    scratch: Reg,
    name: NameId,
    miss: &mut Label,
) -> Result<Reg> {
    // Receiver shape must match the compile-time observation. After this,
    // `scratch` always holds the current link's verified shape.
    let object_shape = ctx.heap.shape_of(object);
    masm.load_shape(scratch, object_reg);
    masm.cmp_value(scratch, Value::Shape(object_shape));
    masm.jump_if_ne(miss);

    let mut current = object;
    let mut reg = object_reg;

    while current != holder {
        let current_shape = ctx.heap.shape_of(current);
        let flags = ctx.heap.shape(current_shape).flags;

        if flags.contains(ShapeFlags::GLOBAL_LIKE) {
            // A global-like link needs more than a shape compare: its shape
            // does not change when a property is merely declared. The guard
            // is that this name's cell still holds the hole.
            let cell = ctx.heap.ensure_property_cell(current, name)?;
            masm.load_value(holder_reg, Value::Cell(cell));
            masm.load_field(holder_reg, holder_reg, CELL_VALUE_OFFSET);
            masm.cmp_value(holder_reg, Value::TheHole);
            masm.jump_if_ne(miss);
        }

        if flags.contains(ShapeFlags::DICTIONARY_MODE) {
            generate_dictionary_negative_lookup(masm, ctx, reg, name, scratch, miss);
        }

        let proto = ctx
            .heap
            .prototype_of(current_shape)
            .expect("compile-time chain must reach the holder");

        if ctx.heap.is_in_young_generation(proto) {
            // The prototype may be relocated between compile time and run
            // time: load it through the current shape's prototype slot
            // instead of embedding a raw reference. The shape is reloaded
            // because the guards above may have clobbered `scratch`.
            masm.load_shape(scratch, reg);
            masm.load_prototype(holder_reg, scratch);
        } else {
            masm.load_value(holder_reg, Value::Object(proto));
        }

        let proto_shape = ctx.heap.shape_of(proto);
        masm.load_shape(scratch, holder_reg);
        masm.cmp_value(scratch, Value::Shape(proto_shape));
        masm.jump_if_ne(miss);

        current = proto;
        reg = holder_reg;
    }

    // The holder itself may be in dictionary mode; its shape check above
    // does not prove the name is absent from it. Callers loading a known
    // property off the holder skip this by construction (the descriptor
    // pins the property), so only the chain links were probed.

    Ok(reg)
}

/// Emit a bounded probe of a dictionary-mode object's flat storage proving
/// `name` is absent: each probed key slot either differs from `name` (keep
/// probing) or is the unused-slot sentinel (proven absent). A probed slot
/// holding `name`, or exhausting the probe bound, jumps to `miss`.
pub fn generate_dictionary_negative_lookup(
    masm: &mut MacroAssembler,
    ctx: &CompileContext,
    object_reg: Reg,
    name: NameId,
    scratch: Reg,
    miss: &mut Label,
) {
    let hash = ctx.heap.names.hash(name);
    let mut absent = Label::new();

    // Dictionary storage lives in the properties slot: [capacity, k, v, ...].
    masm.load_field(DICT_TEMP0, object_reg, OFFSET_PROPERTIES);
    masm.load_elem(DICT_TEMP1, DICT_TEMP0, 0);
    masm.sub_imm(DICT_TEMP1, 1);

    for probe in 0..DICT_NEGATIVE_LOOKUP_PROBES {
        // Triangular probe offsets match the host-side insert sequence.
        let offset = probe * (probe + 1) / 2;
        masm.load_imm(DICT_TEMP2, hash.wrapping_add(offset) as i32);
        masm.and(DICT_TEMP2, DICT_TEMP1);
        masm.add(DICT_TEMP2, DICT_TEMP2);
        masm.add_imm(DICT_TEMP2, ARRAY_HEADER_SLOTS as i32);
        masm.load_elem_reg(scratch, DICT_TEMP0, DICT_TEMP2);
        masm.cmp_value(scratch, Value::Name(name));
        masm.jump_if_eq(miss);
        masm.cmp_value(scratch, Value::Undefined);
        masm.jump_if_eq(&mut absent);
    }
    // Probe bound exhausted without proof either way.
    masm.jump(miss);
    masm.bind(&mut absent);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeFlags, CodeKind, IcState};
    use crate::heap::InstanceType;
    use crate::masm::sim::{Outcome, Simulator};
    use crate::masm::conv;

    fn compile_guard(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        name: NameId,
    ) -> crate::code::CodeDesc {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();
        check_prototypes(
            &mut masm,
            ctx,
            object,
            conv::RECEIVER,
            holder,
            conv::SCRATCH1,
            conv::SCRATCH0,
            name,
            &mut miss,
        )
        .unwrap();
        masm.load_value(conv::RESULT, Value::Smi(1));
        masm.ret();
        masm.bind(&mut miss);
        masm.load_value(conv::RESULT, Value::Smi(0));
        masm.ret();
        masm.finish()
    }

    fn run_guard(
        ctx: &mut CompileContext,
        desc: crate::code::CodeDesc,
        receiver: ObjectRef,
    ) -> Value {
        let flags = CodeFlags::new(CodeKind::Stub, IcState::Monomorphic);
        let code = ctx.allocate_code(desc, flags).unwrap();
        let mut sim = Simulator::new(ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(receiver));
        match sim.run(code).unwrap() {
            Outcome::Return(v) => v,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_accepts_matching_shape() {
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let obj = ctx.heap.new_object(shape);
        let name = ctx.heap.names.intern("x");
        let desc = compile_guard(&mut ctx, obj, obj, name);
        assert_eq!(run_guard(&mut ctx, desc, obj), Value::Smi(1));
    }

    #[test]
    fn test_rejects_different_shape() {
        let mut ctx = CompileContext::new();
        let shape_a = ctx.heap.new_shape(InstanceType::Object, 1);
        let shape_b = ctx.heap.new_shape(InstanceType::Object, 1);
        let obj_a = ctx.heap.new_object(shape_a);
        let obj_b = ctx.heap.new_object(shape_b);
        let name = ctx.heap.names.intern("x");
        let desc = compile_guard(&mut ctx, obj_a, obj_a, name);
        assert_eq!(run_guard(&mut ctx, desc, obj_b), Value::Smi(0));
    }

    #[test]
    fn test_walks_chain_to_holder() {
        let mut ctx = CompileContext::new();
        let name = ctx.heap.names.intern("x");
        let holder_shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let holder = ctx.heap.new_object(holder_shape);
        let recv_shape = ctx.heap.new_shape(InstanceType::Object, 0);
        ctx.heap.set_prototype(recv_shape, holder);
        let receiver = ctx.heap.new_object(recv_shape);
        let desc = compile_guard(&mut ctx, receiver, holder, name);
        assert_eq!(run_guard(&mut ctx, desc, receiver), Value::Smi(1));
    }

    #[test]
    fn test_global_intermediate_cell_guard() {
        let mut ctx = CompileContext::new();
        let name = ctx.heap.names.intern("x");

        let holder_shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let holder = ctx.heap.new_object(holder_shape);

        let global_shape = ctx.heap.new_shape_with_flags(
            InstanceType::GlobalObject,
            0,
            ShapeFlags::GLOBAL_LIKE,
        );
        ctx.heap.set_prototype(global_shape, holder);
        let global = ctx.heap.new_object(global_shape);

        let desc = compile_guard(&mut ctx, global, holder, name);
        let flags = CodeFlags::new(CodeKind::Stub, IcState::Monomorphic);
        let code = ctx.allocate_code(desc, flags).unwrap();

        // While the cell holds the hole, the guard accepts.
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(global));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(1)));

        // Declaring the property on the global fills the cell; the shape is
        // unchanged, but the guard must now reject.
        let cell = ctx.heap.ensure_property_cell(global, name).unwrap();
        ctx.heap.set_cell_value(cell, Value::Smi(99));
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(global));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(0)));
    }

    #[test]
    fn test_young_prototype_loaded_through_shape() {
        let mut ctx = CompileContext::new();
        let name = ctx.heap.names.intern("x");
        let holder_shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let holder = ctx.heap.allocate_young(holder_shape).unwrap();
        let recv_shape = ctx.heap.new_shape(InstanceType::Object, 0);
        ctx.heap.set_prototype(recv_shape, holder);
        let receiver = ctx.heap.new_object(recv_shape);

        let desc = compile_guard(&mut ctx, receiver, holder, name);
        // No direct embedding of the movable prototype: the only embedded
        // objects are shapes (and no Object constants).
        let embeds_object = desc
            .pool
            .iter()
            .any(|v| matches!(v, Value::Object(o) if *o == holder));
        assert!(!embeds_object);
        assert_eq!(run_guard(&mut ctx, desc, receiver), Value::Smi(1));
    }

    #[test]
    fn test_dictionary_negative_lookup_guard() {
        let mut ctx = CompileContext::new();
        let name = ctx.heap.names.intern("x");

        let holder_shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let holder = ctx.heap.new_object(holder_shape);

        let dict_shape = ctx.heap.new_shape(InstanceType::Object, 0);
        ctx.heap.set_prototype(dict_shape, holder);
        let dict_obj = ctx.heap.new_object(dict_shape);
        ctx.heap.make_dictionary(dict_obj, 8);
        let other = ctx.heap.names.intern("unrelated");
        ctx.heap.dictionary_insert(dict_obj, other, Value::Smi(1));

        let desc = compile_guard(&mut ctx, dict_obj, holder, name);
        let flags = CodeFlags::new(CodeKind::Stub, IcState::Monomorphic);
        let code = ctx.allocate_code(desc, flags).unwrap();

        // Absent name: guard accepts.
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(dict_obj));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(1)));

        // Shadowing the name in the dictionary must flip the guard to miss
        // even though the shape never changed.
        ctx.heap.dictionary_insert(dict_obj, name, Value::Smi(5));
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(dict_obj));
        assert_eq!(sim.run(code).unwrap(), Outcome::Return(Value::Smi(0)));
    }

    #[test]
    fn test_guard_compilation_idempotent() {
        let mut ctx = CompileContext::new();
        let name = ctx.heap.names.intern("x");
        let holder_shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let holder = ctx.heap.new_object(holder_shape);
        let recv_shape = ctx.heap.new_shape(InstanceType::Object, 0);
        ctx.heap.set_prototype(recv_shape, holder);
        let receiver = ctx.heap.new_object(recv_shape);

        let first = compile_guard(&mut ctx, receiver, holder, name);
        let second = compile_guard(&mut ctx, receiver, holder, name);
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.pool, second.pool);
    }
}
