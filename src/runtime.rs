//! Runtime helpers reachable from generated code
//!
//! Generated stubs handle the common case inline and tail-call into these
//! helpers for everything else: cache misses, storage growth, native
//! accessors, interceptors, and the fully general construction path.
//!
//! ## Helper calling convention
//!
//! Arguments arrive in the fixed runtime registers: receiver in `R0`, name
//! in `R1`, value in `R2` (stores), holder in `R3`, auxiliary data in `R4`,
//! argument count in `R7`, callee in `R8`. Results are returned in `R0`;
//! the call-target resolver leaves a code object in `R9`.

use tracing::trace;

use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{LookupResult, NameId, ObjectRef, ShapeFlags, Value};
use crate::masm::sim::SimState;
use crate::masm::{conv, Reg};

/// Identifiers of the runtime helpers, as referenced by `CallRuntime`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RuntimeFn {
    LoadIcMiss = 0,
    StoreIcMiss = 1,
    ResolveCallTarget = 2,
    GrowStorageAndStore = 3,
    LoadCallback = 4,
    StoreCallback = 5,
    LoadInterceptor = 6,
    StoreInterceptor = 7,
    GenericConstruct = 8,
    DropFrames = 9,
    /// Invoke only the interceptor trap; leaves the hole in `R0` when the
    /// trap declines, so inline fast paths can branch on it.
    CallInterceptorTrap = 10,
}

impl RuntimeFn {
    pub fn from_id(id: u32) -> RuntimeFn {
        match id {
            0 => RuntimeFn::LoadIcMiss,
            1 => RuntimeFn::StoreIcMiss,
            2 => RuntimeFn::ResolveCallTarget,
            3 => RuntimeFn::GrowStorageAndStore,
            4 => RuntimeFn::LoadCallback,
            5 => RuntimeFn::StoreCallback,
            6 => RuntimeFn::LoadInterceptor,
            7 => RuntimeFn::StoreInterceptor,
            8 => RuntimeFn::GenericConstruct,
            9 => RuntimeFn::DropFrames,
            _ => RuntimeFn::CallInterceptorTrap,
        }
    }
}

/// Dispatch a runtime call from the simulator.
pub fn invoke(id: u32, ctx: &mut CompileContext, state: &mut SimState) -> Result<()> {
    let f = RuntimeFn::from_id(id);
    trace!(runtime = ?f, "runtime call");
    match f {
        RuntimeFn::LoadIcMiss => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let result = generic_load(ctx, receiver, name);
            state.set_reg(conv::RESULT, result);
        }
        RuntimeFn::StoreIcMiss => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let value = state.reg(conv::VALUE);
            generic_store(ctx, receiver, name, value)?;
            state.set_reg(conv::RESULT, value);
        }
        RuntimeFn::ResolveCallTarget => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let target = match generic_load(ctx, receiver, name) {
                Value::Function(f) => {
                    let shared = ctx.heap.shared_of(f);
                    ctx.heap
                        .shared_info(shared)
                        .code
                        .map(Value::Code)
                        .unwrap_or(Value::Code(ctx.builtins.return_undefined))
                }
                _ => Value::Code(ctx.builtins.return_undefined),
            };
            state.set_reg(Reg::R9, target);
        }
        RuntimeFn::GrowStorageAndStore => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let value = state.reg(conv::VALUE);
            let target = match state.reg(Reg::R3) {
                Value::Shape(s) => s,
                other => panic!("grow-storage helper expects a shape in R3, got {other:?}"),
            };
            let index = match ctx.heap.lookup_behind_interceptor(target, name) {
                LookupResult::Field { index } => index,
                _ => ctx.heap.shape(target).property_count().saturating_sub(1),
            };
            let inobject = ctx.heap.in_object_property_count_of(target);
            if index >= inobject {
                ctx.heap.grow_properties(receiver, index - inobject + 1);
            }
            ctx.heap
                .store_raw_field(receiver, crate::heap::OFFSET_SHAPE, Value::Shape(target));
            ctx.heap.store_field(receiver, index, value);
            state.set_reg(conv::RESULT, value);
        }
        RuntimeFn::LoadCallback => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let holder = match state.reg(Reg::R3) {
                Value::Object(o) => o,
                _ => receiver,
            };
            let accessor = expect_accessor(ctx, state.reg(Reg::R4));
            let result = (accessor.getter)(&mut ctx.heap, holder, name);
            state.set_reg(conv::RESULT, result);
        }
        RuntimeFn::StoreCallback => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let value = state.reg(conv::VALUE);
            let holder = match state.reg(Reg::R3) {
                Value::Object(o) => o,
                _ => receiver,
            };
            let accessor = expect_accessor(ctx, state.reg(Reg::R4));
            (accessor.setter)(&mut ctx.heap, holder, name, value);
            state.set_reg(conv::RESULT, value);
        }
        RuntimeFn::LoadInterceptor => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let holder = match state.reg(Reg::R3) {
                Value::Object(o) => o,
                _ => receiver,
            };
            let result = load_with_interceptor(ctx, receiver, holder, name);
            state.set_reg(conv::RESULT, result);
        }
        RuntimeFn::StoreInterceptor => {
            let receiver = expect_object(state.reg(conv::RECEIVER));
            let name = expect_name(state.reg(conv::NAME));
            let value = state.reg(conv::VALUE);
            store_behind_interceptor(ctx, receiver, name, value)?;
            state.set_reg(conv::RESULT, value);
        }
        RuntimeFn::GenericConstruct => {
            let callee = match state.reg(conv::CALLEE) {
                Value::Function(f) => f,
                other => panic!("construct helper expects a function in R8, got {other:?}"),
            };
            let result = generic_construct(ctx, callee, &state.args.clone())?;
            state.set_reg(conv::RESULT, Value::Object(result));
        }
        RuntimeFn::DropFrames => {
            ctx.debug.record_frame_drop();
        }
        RuntimeFn::CallInterceptorTrap => {
            let name = expect_name(state.reg(conv::NAME));
            let holder = match state.reg(Reg::R3) {
                Value::Object(o) => o,
                other => panic!("interceptor trap expects a holder in R3, got {other:?}"),
            };
            let shape = ctx.heap.shape_of(holder);
            let result = match ctx.heap.interceptor_for(shape) {
                Some(interceptor) => {
                    (interceptor.getter)(&mut ctx.heap, holder, name).unwrap_or(Value::TheHole)
                }
                None => Value::TheHole,
            };
            state.set_reg(conv::RESULT, result);
        }
    }
    Ok(())
}

fn expect_object(value: Value) -> ObjectRef {
    match value {
        Value::Object(o) => o,
        other => panic!("generated code passed a non-object receiver: {other:?}"),
    }
}

fn expect_name(value: Value) -> NameId {
    match value {
        Value::Name(n) => n,
        other => panic!("generated code passed a non-name: {other:?}"),
    }
}

fn expect_accessor(ctx: &CompileContext, value: Value) -> crate::heap::NativeAccessor {
    match value {
        Value::Int(id) => ctx.heap.accessor(crate::heap::AccessorId(id as u32)),
        other => panic!("callback helper expects an accessor id, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Generic slow paths
// ---------------------------------------------------------------------------

/// Fully general property load: prototype walk, dictionaries, cells,
/// accessors, interceptors. Misses resolve to undefined.
pub fn generic_load(ctx: &mut CompileContext, receiver: ObjectRef, name: NameId) -> Value {
    let mut current = receiver;
    loop {
        let shape = ctx.heap.shape_of(current);
        let flags = ctx.heap.shape(shape).flags;

        if flags.contains(ShapeFlags::GLOBAL_LIKE) {
            if let Ok(cell) = ctx.heap.ensure_property_cell(current, name) {
                let value = ctx.heap.cell_value(cell);
                if value != Value::TheHole {
                    return value;
                }
            }
        }

        if flags.contains(ShapeFlags::DICTIONARY_MODE) {
            if let Some(value) = ctx.heap.dictionary_lookup(current, name) {
                return value;
            }
        } else {
            match ctx.heap.lookup_property(shape, name) {
                LookupResult::Field { index } => return ctx.heap.load_field(current, index),
                LookupResult::ConstantFunction(f) => return Value::Function(f),
                LookupResult::Callbacks(a) => {
                    let accessor = ctx.heap.accessor(a);
                    return (accessor.getter)(&mut ctx.heap, current, name);
                }
                LookupResult::Interceptor => {
                    return load_with_interceptor(ctx, receiver, current, name)
                }
                LookupResult::Transition(_) | LookupResult::NotFound => {}
            }
        }

        match ctx.heap.prototype_of(shape) {
            Some(proto) => current = proto,
            None => return Value::Undefined,
        }
    }
}

/// Invoke the holder's interceptor; when it declines, continue with the
/// lookup result behind it.
fn load_with_interceptor(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    holder: ObjectRef,
    name: NameId,
) -> Value {
    let shape = ctx.heap.shape_of(holder);
    if let Some(interceptor) = ctx.heap.interceptor_for(shape) {
        if let Some(value) = (interceptor.getter)(&mut ctx.heap, holder, name) {
            return value;
        }
    }
    match ctx.heap.lookup_behind_interceptor(shape, name) {
        LookupResult::Field { index } => ctx.heap.load_field(holder, index),
        LookupResult::ConstantFunction(f) => Value::Function(f),
        LookupResult::Callbacks(a) => {
            let accessor = ctx.heap.accessor(a);
            (accessor.getter)(&mut ctx.heap, holder, name)
        }
        _ => {
            // Continue the walk above the holder.
            match ctx.heap.prototype_of(shape) {
                Some(proto) => generic_load(ctx, proto, name),
                None => {
                    let _ = receiver;
                    Value::Undefined
                }
            }
        }
    }
}

/// Fully general property store: cells on globals, dictionaries, existing
/// fields, accessors, and transition-adding a fresh field.
pub fn generic_store(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    name: NameId,
    value: Value,
) -> Result<()> {
    let shape = ctx.heap.shape_of(receiver);
    let flags = ctx.heap.shape(shape).flags;

    if flags.contains(ShapeFlags::GLOBAL_LIKE) {
        let cell = ctx.heap.ensure_property_cell(receiver, name)?;
        ctx.heap.set_cell_value(cell, value);
        return Ok(());
    }

    if flags.contains(ShapeFlags::DICTIONARY_MODE) {
        ctx.heap.dictionary_insert(receiver, name, value);
        return Ok(());
    }

    match ctx.heap.lookup_property(shape, name) {
        LookupResult::Field { index } => {
            ctx.heap.store_field(receiver, index, value);
        }
        LookupResult::Callbacks(a) => {
            let accessor = ctx.heap.accessor(a);
            (accessor.setter)(&mut ctx.heap, receiver, name, value);
        }
        LookupResult::Interceptor => {
            store_behind_interceptor(ctx, receiver, name, value)?;
        }
        LookupResult::ConstantFunction(_) => {
            // Overwriting a constant-function slot falls back to a field:
            // transition to a shape that describes the name as data.
            let target = ctx.heap.transition_add_field(shape, name);
            apply_transition_store(ctx, receiver, target, name, value);
        }
        LookupResult::Transition(target) => {
            apply_transition_store(ctx, receiver, target, name, value);
        }
        LookupResult::NotFound => {
            let target = ctx.heap.transition_add_field(shape, name);
            apply_transition_store(ctx, receiver, target, name, value);
        }
    }
    Ok(())
}

fn store_behind_interceptor(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    name: NameId,
    value: Value,
) -> Result<()> {
    let shape = ctx.heap.shape_of(receiver);
    match ctx.heap.lookup_behind_interceptor(shape, name) {
        LookupResult::Field { index } => {
            ctx.heap.store_field(receiver, index, value);
            Ok(())
        }
        LookupResult::Callbacks(a) => {
            let accessor = ctx.heap.accessor(a);
            (accessor.setter)(&mut ctx.heap, receiver, name, value);
            Ok(())
        }
        _ => {
            let target = ctx.heap.transition_add_field(shape, name);
            apply_transition_store(ctx, receiver, target, name, value);
            Ok(())
        }
    }
}

fn apply_transition_store(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    target: crate::heap::ShapeId,
    name: NameId,
    value: Value,
) {
    ctx.heap
        .store_raw_field(receiver, crate::heap::OFFSET_SHAPE, Value::Shape(target));
    let index = match ctx.heap.lookup_behind_interceptor(target, name) {
        LookupResult::Field { index } => index,
        _ => ctx.heap.shape(target).property_count().saturating_sub(1),
    };
    ctx.heap.store_field(receiver, index, value);
}

/// The non-inlined construction path: allocate, then run the constructor's
/// statically-known `this.x = ...` assignments generically.
pub fn generic_construct(
    ctx: &mut CompileContext,
    callee: crate::heap::FunctionId,
    args: &[Value],
) -> Result<ObjectRef> {
    let shared = ctx.heap.shared_of(callee);
    let info = ctx.heap.shared_info(shared);
    let assignments = info.this_assignments.clone();
    let initial_shape = info.initial_shape;
    let object = match initial_shape {
        Some(shape) => match ctx.heap.allocate_young(shape) {
            Ok(obj) => obj,
            // Young space exhausted: fall back to an old-generation object.
            Err(_) => ctx.heap.new_object(shape),
        },
        None => {
            let shape = ctx
                .heap
                .new_shape(crate::heap::InstanceType::Object, assignments.len() as u32);
            ctx.heap.new_object(shape)
        }
    };
    for (name, assignment) in assignments {
        let value = match assignment {
            crate::heap::ThisAssignment::Argument(k) => {
                args.get(k as usize).copied().unwrap_or(Value::Undefined)
            }
            crate::heap::ThisAssignment::Constant(v) => v,
        };
        generic_store(ctx, object, name, value)?;
    }
    Ok(object)
}
