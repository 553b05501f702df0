//! Call-site specialization stubs
//!
//! A specialized call site verifies the receiver's chain, verifies the
//! callee is still the expected function, optionally substitutes the
//! distinguished global-receiver proxy, and tail-invokes the target with
//! the original argument count and calling convention. Functions that may
//! live in a movable generation are compared by shared-descriptor identity
//! rather than object identity.

use tracing::debug;

use crate::code::{CodeFlags, CodeHandle, CodeKind, IcState};
use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{field_offset, FieldOffset, FunctionId, NameId, ObjectRef, ShapeFlags, Value};
use crate::ic::prototypes::check_prototypes;
use crate::masm::sim::SHARED_CODE_OFFSET;
use crate::masm::{conv, Label, MacroAssembler, Reg, ValueKind};

/// Compiler for call IC stubs, parameterized by argument count.
pub struct CallStubCompiler {
    pub argc: u32,
}

impl CallStubCompiler {
    pub fn new(argc: u32) -> Self {
        Self { argc }
    }

    fn ic_flags(&self, ctx: &CompileContext, object: ObjectRef) -> CodeFlags {
        let shape = ctx.heap.shape_of(object);
        let instance_type = ctx.heap.shape(shape).instance_type;
        CodeFlags::with_details(
            CodeKind::CallIc,
            IcState::Monomorphic,
            instance_type,
            self.argc,
        )
    }

    /// Substitute the global-receiver proxy when the receiver is a
    /// namespace object.
    fn maybe_rewrite_receiver(
        &self,
        masm: &mut MacroAssembler,
        ctx: &mut CompileContext,
        object: ObjectRef,
    ) {
        let shape = ctx.heap.shape_of(object);
        if ctx.heap.shape(shape).flags.contains(ShapeFlags::GLOBAL_LIKE) {
            let proxy = ctx.heap.global_receiver_proxy(object);
            masm.load_value(conv::RECEIVER, Value::Object(proxy));
        }
    }

    /// Tail-invoke the function held in `callee`, preserving argc and the
    /// argument stack.
    fn invoke_function(&self, masm: &mut MacroAssembler, callee: Reg) {
        masm.load_shared(conv::SCRATCH2, callee);
        masm.load_field(conv::SCRATCH2, conv::SCRATCH2, SHARED_CODE_OFFSET);
        masm.jump_code(conv::SCRATCH2);
    }

    /// Call a compile-time-known constant function found on the chain.
    pub fn compile_call_constant(
        &self,
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
        self.maybe_rewrite_receiver(&mut masm, ctx, object);
        // The holder's descriptor pins the callee; no runtime target check
        // is needed beyond the chain guards.
        masm.load_value(conv::SCRATCH0, Value::Function(function));
        masm.load_imm(conv::ARGC, self.argc as i32);
        self.invoke_function(&mut masm, conv::SCRATCH0);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.call_ic_miss);

        let flags = self.ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled constant call stub");
        Ok(code)
    }

    /// Call a function-valued data field: load it, verify it is callable,
    /// and invoke it.
    pub fn compile_call_field(
        &self,
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
        match field_offset(ctx.heap.shape(holder_shape), index) {
            FieldOffset::InObject(offset) => {
                masm.load_field(conv::SCRATCH0, reg, offset);
            }
            FieldOffset::External(ext) => {
                masm.load_field(conv::SCRATCH2, reg, crate::heap::OFFSET_PROPERTIES);
                masm.load_elem(
                    conv::SCRATCH0,
                    conv::SCRATCH2,
                    crate::heap::ARRAY_HEADER_SLOTS + ext,
                );
            }
        }
        masm.cmp_kind(conv::SCRATCH0, ValueKind::Function);
        masm.jump_if_ne(&mut miss);
        self.maybe_rewrite_receiver(&mut masm, ctx, object);
        masm.load_imm(conv::ARGC, self.argc as i32);
        self.invoke_function(&mut masm, conv::SCRATCH0);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.call_ic_miss);

        let flags = self.ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled field call stub");
        Ok(code)
    }

    /// Call a function bound through a global property cell. The cell value
    /// must still be the expected function; movable functions compare by
    /// shared descriptor.
    pub fn compile_call_global(
        &self,
        ctx: &mut CompileContext,
        object: ObjectRef,
        holder: ObjectRef,
        expected: FunctionId,
        name: NameId,
    ) -> Result<CodeHandle> {
        let mut masm = MacroAssembler::new();
        let mut miss = Label::new();

        let object_shape = ctx.heap.shape_of(object);
        masm.load_shape(conv::SCRATCH0, conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::Shape(object_shape));
        masm.jump_if_ne(&mut miss);

        let cell = ctx.heap.ensure_property_cell(holder, name)?;
        masm.load_value(conv::SCRATCH1, Value::Cell(cell));
        masm.load_field(conv::SCRATCH0, conv::SCRATCH1, crate::heap::CELL_VALUE_OFFSET);
        masm.cmp_kind(conv::SCRATCH0, ValueKind::Function);
        masm.jump_if_ne(&mut miss);

        if ctx.heap.function_in_young(expected) {
            // The function object may be relocated between now and the next
            // call; its shared descriptor is the stable identity.
            let shared = ctx.heap.shared_of(expected);
            masm.load_shared(conv::SCRATCH1, conv::SCRATCH0);
            masm.cmp_value(conv::SCRATCH1, Value::Shared(shared));
        } else {
            masm.cmp_value(conv::SCRATCH0, Value::Function(expected));
        }
        masm.jump_if_ne(&mut miss);

        self.maybe_rewrite_receiver(&mut masm, ctx, object);
        masm.load_imm(conv::ARGC, self.argc as i32);
        self.invoke_function(&mut masm, conv::SCRATCH0);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.call_ic_miss);

        let flags = self.ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled global call stub");
        Ok(code)
    }

    /// Call a function produced by a named interceptor: probe the trap
    /// inline, verify callability, and invoke; a declining trap resolves
    /// through the generic call path.
    pub fn compile_call_interceptor(
        &self,
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

        // Balance the stack on every path so the miss handler sees the
        // original operands.
        masm.push(conv::RECEIVER);
        masm.move_reg(Reg::R3, reg);
        masm.call_runtime(crate::runtime::RuntimeFn::CallInterceptorTrap as u32);
        masm.move_reg(conv::SCRATCH0, conv::RESULT);
        masm.pop(conv::RECEIVER);
        masm.cmp_value(conv::SCRATCH0, Value::TheHole);
        masm.jump_if_eq(&mut miss);
        masm.cmp_kind(conv::SCRATCH0, ValueKind::Function);
        masm.jump_if_ne(&mut miss);
        self.maybe_rewrite_receiver(&mut masm, ctx, object);
        masm.load_imm(conv::ARGC, self.argc as i32);
        self.invoke_function(&mut masm, conv::SCRATCH0);

        masm.bind(&mut miss);
        masm.tail_call(ctx.builtins.call_ic_miss);

        let flags = self.ic_flags(ctx, object);
        let code = ctx.allocate_code(masm.finish(), flags)?;
        debug!(name = ctx.heap.names.resolve(name), ?code, "compiled interceptor call stub");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::CodeKind;
    use crate::heap::{InstanceType, PropertyDetails, SharedId};
    use crate::masm::sim::{Outcome, Simulator};

    /// Give `shared` a body returning the given constant.
    fn install_body(ctx: &mut CompileContext, shared: SharedId, result: Value) {
        let mut masm = MacroAssembler::new();
        masm.load_value(conv::RESULT, result);
        masm.ret();
        let flags = CodeFlags::new(CodeKind::Baseline, IcState::Uninitialized);
        let code = ctx.allocate_code(masm.finish(), flags).unwrap();
        ctx.heap.shared_info_mut(shared).code = Some(code);
    }

    fn run_call(
        ctx: &mut CompileContext,
        code: CodeHandle,
        receiver: ObjectRef,
        name: NameId,
    ) -> Value {
        let mut sim = Simulator::new(ctx);
        sim.state.set_reg(conv::RECEIVER, Value::Object(receiver));
        sim.state.set_reg(conv::NAME, Value::Name(name));
        match sim.run(code).unwrap() {
            Outcome::Return(v) => v,
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_call_constant_function() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("m", 0);
        install_body(&mut ctx, shared, Value::Smi(71));
        let f = ctx.heap.new_function(shared, false);

        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let m = ctx.heap.names.intern("m");
        ctx.heap
            .add_descriptor(shape, m, PropertyDetails::ConstantFunction(f));
        let obj = ctx.heap.new_object(shape);

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_constant(&mut ctx, obj, obj, f, m)
            .unwrap();
        assert_eq!(run_call(&mut ctx, code, obj, m), Value::Smi(71));
    }

    #[test]
    fn test_call_constant_misses_on_wrong_shape() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("m", 0);
        install_body(&mut ctx, shared, Value::Smi(71));
        let f = ctx.heap.new_function(shared, false);

        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let m = ctx.heap.names.intern("m");
        ctx.heap
            .add_descriptor(shape, m, PropertyDetails::ConstantFunction(f));
        let obj = ctx.heap.new_object(shape);

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_constant(&mut ctx, obj, obj, f, m)
            .unwrap();

        // A shape-mismatched receiver resolves through the generic path,
        // which still finds no such method and returns undefined.
        let other_shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let other = ctx.heap.new_object(other_shape);
        assert_eq!(run_call(&mut ctx, code, other, m), Value::Undefined);
    }

    #[test]
    fn test_call_field_function() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("f", 0);
        install_body(&mut ctx, shared, Value::Smi(5));
        let f = ctx.heap.new_function(shared, false);

        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let cb = ctx.heap.names.intern("cb");
        let shape = ctx.heap.transition_add_field(base, cb);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Function(f));

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_field(&mut ctx, obj, obj, 0, cb)
            .unwrap();
        assert_eq!(run_call(&mut ctx, code, obj, cb), Value::Smi(5));
    }

    #[test]
    fn test_call_field_non_function_misses() {
        let mut ctx = CompileContext::new();
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let cb = ctx.heap.names.intern("cb");
        let shape = ctx.heap.transition_add_field(base, cb);
        let obj = ctx.heap.new_object(shape);
        ctx.heap.store_field(obj, 0, Value::Smi(3));

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_field(&mut ctx, obj, obj, 0, cb)
            .unwrap();
        assert_eq!(run_call(&mut ctx, code, obj, cb), Value::Undefined);
    }

    #[test]
    fn test_call_global_rewrites_receiver() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("g", 0);
        let f = ctx.heap.new_function(shared, false);

        // The body returns its receiver so the test can observe the proxy
        // substitution.
        let body = {
            let mut masm = MacroAssembler::new();
            masm.ret();
            let flags = CodeFlags::new(CodeKind::Baseline, IcState::Uninitialized);
            ctx.allocate_code(masm.finish(), flags).unwrap()
        };
        ctx.heap.shared_info_mut(shared).code = Some(body);

        let shape = ctx.heap.new_shape_with_flags(
            InstanceType::GlobalObject,
            0,
            ShapeFlags::GLOBAL_LIKE,
        );
        let global = ctx.heap.new_object(shape);
        let g = ctx.heap.names.intern("g");
        let cell = ctx.heap.ensure_property_cell(global, g).unwrap();
        ctx.heap.set_cell_value(cell, Value::Function(f));

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_global(&mut ctx, global, global, f, g)
            .unwrap();
        let result = run_call(&mut ctx, code, global, g);
        let proxy = ctx.heap.global_receiver_proxy(global);
        assert_eq!(result, Value::Object(proxy));
    }

    #[test]
    fn test_call_global_young_function_compares_descriptor() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("g", 0);
        install_body(&mut ctx, shared, Value::Smi(13));
        let f = ctx.heap.new_function(shared, true);

        let shape = ctx.heap.new_shape_with_flags(
            InstanceType::GlobalObject,
            0,
            ShapeFlags::GLOBAL_LIKE,
        );
        let global = ctx.heap.new_object(shape);
        let g = ctx.heap.names.intern("g");
        let cell = ctx.heap.ensure_property_cell(global, g).unwrap();
        ctx.heap.set_cell_value(cell, Value::Function(f));

        let compiler = CallStubCompiler::new(0);
        let code = compiler
            .compile_call_global(&mut ctx, global, global, f, g)
            .unwrap();
        // No raw function reference is embedded for a movable callee; the
        // pool carries its shared descriptor instead.
        let pool: Vec<_> = ctx.code_space.get(code).pool().to_vec();
        assert!(!pool.iter().any(|v| matches!(v, Value::Function(_))));
        assert!(pool.iter().any(|v| matches!(v, Value::Shared(_))));
        assert_eq!(run_call(&mut ctx, code, global, g), Value::Smi(13));

        // Rebinding the global to a different descriptor misses.
        let shared2 = ctx.heap.new_shared_function("g2", 0);
        install_body(&mut ctx, shared2, Value::Smi(14));
        let f2 = ctx.heap.new_function(shared2, true);
        ctx.heap.set_cell_value(cell, Value::Function(f2));
        assert_eq!(run_call(&mut ctx, code, global, g), Value::Smi(14));
    }

    #[test]
    fn test_call_stub_flags_carry_argc() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("m", 2);
        install_body(&mut ctx, shared, Value::Smi(0));
        let f = ctx.heap.new_function(shared, false);
        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let m = ctx.heap.names.intern("m");
        ctx.heap
            .add_descriptor(shape, m, PropertyDetails::ConstantFunction(f));
        let obj = ctx.heap.new_object(shape);

        let compiler = CallStubCompiler::new(2);
        let code = compiler
            .compile_call_constant(&mut ctx, obj, obj, f, m)
            .unwrap();
        assert_eq!(ctx.code_space.get(code).flags.argc(), 2);
    }
}
