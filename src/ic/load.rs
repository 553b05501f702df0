//! Load stub generators
//!
//! One generator per property kind observed at a load site: field,
//! constant function, native callback, interceptor, global cell, and the
//! proven-nonexistent case. Every generator has the same skeleton —
//! guards, action, return — with a `miss:` tail that jumps to the generic
//! miss handler leaving the receiver and name registers untouched.

use tracing::debug;

use crate::code::{CodeFlags, CodeHandle, CodeKind, IcState};
use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{
    field_offset, AccessorId, FieldOffset, FunctionId, NameId, ObjectRef, ShapeFlags, ShapeId,
    Value, ARRAY_HEADER_SLOTS, CELL_VALUE_OFFSET, OFFSET_PROPERTIES,
};
use crate::ic::prototypes::{check_prototypes, generate_dictionary_negative_lookup};
use crate::masm::{conv, Label, MacroAssembler, Reg};

/// Compiler for load IC stubs specialized to one (receiver shape, holder,
/// property) observation.
pub struct LoadStubCompiler;

impl LoadStubCompiler {
    fn ic_flags(ctx: &CompileContext, object: ObjectRef) -> CodeFlags {
        let shape = ctx.heap.shape_of(object);
        let instance_type = ctx.heap.shape(shape).instance_type;
        CodeFlags::with_details(CodeKind::LoadIc, IcState::Monomorphic, instance_type, 0)
    }

    /// Load a data field from the holder's storage.
    pub fn compile_load_field(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        index: u32,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let reg = check_prototypes(
            &mut masm,
            ctx,
            object,
            conv::RECEIVER,
            holder,
            conv::SCRATCH1,
            conv::SCRATCH0,
            name,
            &mut miss,
        )?;
        let holder_shape = ctx.heap.shape_of(holder);
        generate_fast_property_load(&mut masm, ctx, holder_shape, reg, index);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled field load stub");
        Ok(code)
    }

    /// Return a compile-time-known constant function.
    pub fn compile_load_constant(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        function: FunctionId,
        name: NameId,
    ) -> Result<CodeHandle> {
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
        )?;
        // No runtime computation: embed the known value and return it.
        masm.load_value(conv::RESULT, Value::Function(function));
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled constant load stub");
        Ok(code)
    }

    /// Load through a native accessor: marshal (receiver, holder, accessor,
    /// name) and call the callback trampoline, then return its result.
    pub fn compile_load_callback(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        accessor: AccessorId,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let reg = check_prototypes(
            &mut masm,
            ctx,
            object,
            conv::RECEIVER,
            holder,
            conv::SCRATCH1,
            conv::SCRATCH0,
            name,
            &mut miss,
        )?;
        masm.move_reg(Reg::R3, reg);
        masm.load_imm(Reg::R4, accessor.0 as i32);
        masm.call(ctx.builtins.load_callback);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled callback load stub");
        Ok(code)
    }

    /// Load through a named interceptor.
    ///
    /// When the follow-up lookup (what holds if the trap declines) is a
    /// simple field or callback, the common two-outcome shape is inlined:
    /// call the trap, branch on the no-result sentinel, and fall back to the
    /// follow-up action without leaving the stub. Anything else tail-calls
    /// the generic interceptor helper.
    pub fn compile_load_interceptor(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let reg = check_prototypes(
            &mut masm,
            ctx,
            object,
            conv::RECEIVER,
            holder,
            conv::SCRATCH1,
            conv::SCRATCH0,
            name,
            &mut miss,
        )?;

        let holder_shape = ctx.heap.shape_of(holder);
        let follow_up = ctx.heap.lookup_behind_interceptor(holder_shape, name);
        if follow_up.is_simple_for_interceptor() {
            let mut fall_back = Label::new();
            // The trap's result lands in R0, so the receiver is saved and
            // restored around it; both outcomes see the original operands.
            masm.push(conv::RECEIVER);
            masm.move_reg(Reg::R3, reg);
            masm.call_runtime(crate::runtime::RuntimeFn::CallInterceptorTrap as u32);
            masm.move_reg(conv::SCRATCH2, conv::RESULT);
            masm.pop(conv::RECEIVER);
            masm.cmp_value(conv::SCRATCH2, Value::TheHole);
            masm.jump_if_eq(&mut fall_back);
            masm.move_reg(conv::RESULT, conv::SCRATCH2);
            masm.ret();
            // Trap declined: the follow-up action, still inline. The holder
            // register survives the trap call.
            masm.bind(&mut fall_back);
            match follow_up {
                crate::heap::LookupResult::Field { index } => {
                    generate_fast_property_load(&mut masm, ctx, holder_shape, Reg::R3, index);
                }
                crate::heap::LookupResult::Callbacks(accessor) => {
                    masm.load_imm(Reg::R4, accessor.0 as i32);
                    masm.call(ctx.builtins.load_callback);
                }
                _ => unreachable!("follow-up was checked to be simple"),
            }
            masm.ret();
        } else {
            masm.move_reg(Reg::R3, reg);
            masm.tail_call(ctx.builtins.load_interceptor);
        }

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled interceptor load stub");
        Ok(code)
    }

    /// Load a global property through its cell, missing when the cell has
    /// been emptied (property deleted).
    pub fn compile_load_global(
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        // Guard the receiver's shape (and chain, when the holder is a
        // prototype of the receiver). The cell check below is the holder's
        // own guard, so the chain walk stops one link short of touching it.
        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        let cell = ctx.heap.ensure_property_cell(holder, name)?;
        masm.load_value(conv::SCRATCH1, Value::Cell(cell));
        masm.load_field(conv::SCRATCH2, conv::SCRATCH1, CELL_VALUE_OFFSET);
        masm.cmp_value(conv::SCRATCH2, Value::TheHole);
        masm.jump_if_eq(&mut miss);
        masm.move_reg(conv::RESULT, conv::SCRATCH2);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled global load stub");
        Ok(code)
    }

    /// Prove the property absent along the whole chain and return undefined.
    pub fn compile_load_nonexistent(
        ctx: &mut CompileContext,
        object: ObjectRef,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        // Walk to the end of the compile-time chain.
        let mut terminal = object;
        loop {
            let shape = ctx.heap.shape_of(terminal);
            match ctx.heap.prototype_of(shape) {
                Some(proto) => terminal = proto,
                None => break,
            }
        }

        let reg = check_prototypes(
            &mut masm,
            ctx,
            object,
            conv::RECEIVER,
            terminal,
            conv::SCRATCH1,
            conv::SCRATCH0,
            name,
            &mut miss,
        )?;
        // The terminal link's own storage still needs a negative proof when
        // it is in dictionary mode; shape checks covered everything else.
        let terminal_shape = ctx.heap.shape_of(terminal);
        if ctx
            .heap
            .shape(terminal_shape)
            .flags
            .contains(ShapeFlags::DICTIONARY_MODE)
        {
            generate_dictionary_negative_lookup(&mut masm, ctx, reg, name, conv::SCRATCH0, &mut miss);
        }
        masm.load_value(conv::RESULT, Value::Undefined);
        masm.ret();

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.load_ic_miss);

        let flags = Self::ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled nonexistent load stub");
        Ok(code)
    }
}

/// Emit the fast field load: in-object fields read straight from the
/// instance; overflow fields indirect through the properties array.
pub fn generate_fast_property_load(
    masm: &mut MacroAssembler,
    ctx: &CompileContext,
    holder_shape: ShapeId,
    holder_reg: Reg,
    index: u32,
) {
    match field_offset(ctx.heap.shape(holder_shape), index) {
        FieldOffset::InObject(offset) => {
            masm.load_field(conv::RESULT, holder_reg, offset);
        }
        FieldOffset::External(ext) => {
            masm.load_field(conv::SCRATCH2, holder_reg, OFFSET_PROPERTIES);
            masm.load_elem(conv::RESULT, conv::SCRATCH2, ARRAY_HEADER_SLOTS + ext);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{InstanceType, NamedInterceptor, NativeAccessor, PropertyDetails};
    use crate::masm::sim::{Outcome, Simulator};

    fn run_load(ctx: &mut CompileContext, code: CodeHandle, receiver: ObjectRef, name: NameId) -> Value {
        let mut sim = Simulator::new(ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(receiver));
        sim.state.set_reg(conv::NAME, Value::Name(name));
        match sim.run(code).unwrap() {
            Outcome::Return(v) => v,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_inobject_field_load_stub() {
        // Shape with 3 in-object slots, property at field index 1: the load
        // must come strictly from the in-object region.
        let mut ctx = CompileContext::new();
        let mut shape = ctx.heap.new_shape(InstanceType::Object, 3);
        for n in ["a", "x", "c"] {
            let name = ctx.heap.names.intern(n);
            shape = ctx.heap.transition_add_field(shape, name);
        }
        let x = ctx.heap.names.intern("x");
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 1, Value::Smi(21));

        let code = LoadStubCompiler::compile_load_field(&mut ctx, obj, obj, 1, x).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, x), Value::Smi(21));

        // The emitted offset is instance_size + (1 - 3) * pointer size.
        let desc_text = crate::masm::disassemble(
            ctx.code_space.get(code).bytes(),
            ctx.code_space.get(code).pool(),
        );
        let instance_size = ctx.heap.instance_size_of(shape) as i32;
        assert!(desc_text.contains(&format!("[R0+{}]", instance_size - 16)));
    }

    #[test]
    fn test_external_field_load_stub() {
        let mut ctx = CompileContext::new();
        let mut shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let x = ctx.heap.names.intern("x");
        shape = ctx.heap.transition_add_field(shape, x);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(8));

        let code = LoadStubCompiler::compile_load_field(&mut ctx, obj, obj, 0, x).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, x), Value::Smi(8));
    }

    #[test]
    fn test_field_load_miss_on_wrong_shape() {
        let mut ctx = CompileContext::new();
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        let shape = ctx.heap.transition_add_field(base, x);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(4));
        let code = LoadStubCompiler::compile_load_field(&mut ctx, obj, obj, 0, x).unwrap();

        // A receiver with a different shape goes through the miss handler,
        // which resolves generically.
        let other_base = ctx.heap.new_shape(InstanceType::Object, 1);
        let other_shape = ctx.heap.transition_add_field(other_base, x);
        let other = ctx.heap.new_object(other_shape);
        ctx.heap.store_field(other, 0, Value::Smi(77));
        assert_eq!(run_load(&mut ctx, code, other, x), Value::Smi(77));
    }

    #[test]
    fn test_constant_function_load_stub() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("f", 0);
        let f = ctx.heap.new_function(shared, false);
        let shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let m = ctx.heap.names.intern("m");
        ctx.heap
            .add_descriptor(shape, m, PropertyDetails::ConstantFunction(f));
        let obj = ctx.heap.new_object(shape);

        let code = LoadStubCompiler::compile_load_constant(&mut ctx, obj, obj, f, m).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, m), Value::Function(f));
    }

    #[test]
    fn test_callback_load_stub() {
        fn getter(_: &mut crate::heap::Heap, _: ObjectRef, _: NameId) -> Value {
            Value::Smi(123)
        }
        fn setter(_: &mut crate::heap::Heap, _: ObjectRef, _: NameId, _: Value) {}

        let mut ctx = CompileContext::new();
        let accessor = ctx.heap.register_accessor(NativeAccessor { getter, setter });
        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let p = ctx.heap.names.intern("p");
        ctx.heap
            .add_descriptor(shape, p, PropertyDetails::Callbacks(accessor));
        let obj = ctx.heap.new_object(shape);

        let code =
            LoadStubCompiler::compile_load_callback(&mut ctx, obj, obj, accessor, p).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, p), Value::Smi(123));
    }

    #[test]
    fn test_interceptor_load_stub_trap_hits() {
        fn trap(_: &mut crate::heap::Heap, _: ObjectRef, _: NameId) -> Option<Value> {
            Some(Value::Smi(55))
        }
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        ctx.heap
            .add_descriptor(shape, x, PropertyDetails::Field { index: 0 });
        ctx.heap
            .register_interceptor(shape, NamedInterceptor { getter: trap });
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(1));

        let code = LoadStubCompiler::compile_load_interceptor(&mut ctx, obj, obj, x).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, x), Value::Smi(55));
    }

    #[test]
    fn test_interceptor_load_stub_trap_declines_to_field() {
        fn trap(_: &mut crate::heap::Heap, _: ObjectRef, _: NameId) -> Option<Value> {
            None
        }
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        ctx.heap
            .add_descriptor(shape, x, PropertyDetails::Field { index: 0 });
        ctx.heap
            .register_interceptor(shape, NamedInterceptor { getter: trap });
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(31));

        let code = LoadStubCompiler::compile_load_interceptor(&mut ctx, obj, obj, x).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, x), Value::Smi(31));
    }

    #[test]
    fn test_global_load_stub_and_deleted_cell() {
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape_with_flags(
            InstanceType::GlobalObject,
            0,
            ShapeFlags::GLOBAL_LIKE,
        );
        let global = ctx.heap.new_object(shape);
        let g = ctx.heap.names.intern("g");
        let cell = ctx.heap.ensure_property_cell(global, g).unwrap();
        ctx.heap.set_cell_value(cell, Value::Smi(17));

        let code = LoadStubCompiler::compile_load_global(&mut ctx, global, global, g).unwrap();
        assert_eq!(run_load(&mut ctx, code, global, g), Value::Smi(17));

        // Emptying the cell sends the load through the miss handler, which
        // sees an undefined global.
        ctx.heap.set_cell_value(cell, Value::TheHole);
        assert_eq!(run_load(&mut ctx, code, global, g), Value::Undefined);
    }

    #[test]
    fn test_nonexistent_load_stub() {
        let mut ctx = CompileContext::new();
        let shape = ctx.heap.new_shape(InstanceType::Object, 1);
        let obj = ctx.heap.new_object(shape);
        let missing = ctx.heap.names.intern("missing");
        let code = LoadStubCompiler::compile_load_nonexistent(&mut ctx, obj, missing).unwrap();
        assert_eq!(run_load(&mut ctx, code, obj, missing), Value::Undefined);
    }

    #[test]
    fn test_miss_preserves_receiver_and_name() {
        // The miss path must leave R0/R1 exactly as they were so the miss
        // handler can re-read them.
        let mut ctx = CompileContext::new();
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        let shape = ctx.heap.transition_add_field(base, x);
        let obj = ctx.heap.new_object(shape);
        let code = LoadStubCompiler::compile_load_field(&mut ctx, obj, obj, 0, x).unwrap();

        let other = ctx.heap.new_object(base);
        let mut sim = Simulator::new(&mut ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(other));
        sim.state.set_reg(conv::NAME, Value::Name(x));
        // Runs to completion through the miss handler without a type error,
        // which is only possible if R0/R1 still held the operands.
        assert!(matches!(sim.run(code).unwrap(), Outcome::Return(_)));
    }
}
