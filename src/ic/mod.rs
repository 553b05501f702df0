//! Inline caches: the stub cache and per-site specialization
//!
//! A call site that misses routes here: the observed (receiver, name)
//! pair is looked up, the matching generator compiles a guard-then-act
//! stub, and the result is inserted into the global stub cache so every
//! site observing the same (name, shape, operation) reuses it.

pub mod call;
pub mod construct;
pub mod key;
pub mod load;
pub mod prototypes;
pub mod stub_cache;
pub mod store;

use tracing::debug;

use crate::code::{CodeFlags, CodeHandle, CodeKind, IcState};
use crate::context::CompileContext;
use crate::error::Result;
use crate::heap::{LookupResult, NameId, ObjectRef};

pub use call::CallStubCompiler;
pub use construct::ConstructStubCompiler;
pub use load::LoadStubCompiler;
pub use stub_cache::StubCache;
pub use store::StoreStubCompiler;

fn monomorphic_flags(ctx: &CompileContext, kind: CodeKind, object: ObjectRef, argc: u32) -> CodeFlags {
    let shape = ctx.heap.shape_of(object);
    let instance_type = ctx.heap.shape(shape).instance_type;
    CodeFlags::with_details(kind, IcState::Monomorphic, instance_type, argc)
}

/// Resolve a load miss: probe the cache, compile on a true miss, insert.
pub fn compute_load_stub(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    name: NameId,
) -> Result<CodeHandle> {
    let shape = ctx.heap.shape_of(receiver);
    let flags = monomorphic_flags(ctx, CodeKind::LoadIc, receiver, 0);
    if let Some(code) = ctx
        .stub_cache
        .probe(&ctx.heap.names, &ctx.code_space, name, shape, flags)
    {
        return Ok(code);
    }

    let is_global = ctx
        .heap
        .shape(shape)
        .flags
        .contains(crate::heap::ShapeFlags::GLOBAL_LIKE);
    let code = match ctx.heap.lookup_on_chain(receiver, name) {
        Some((holder, LookupResult::Field { index })) => {
            LoadStubCompiler::compile_load_field(ctx, receiver, holder, index, name)?
        }
        Some((holder, LookupResult::ConstantFunction(f))) => {
            LoadStubCompiler::compile_load_constant(ctx, receiver, holder, f, name)?
        }
        Some((holder, LookupResult::Callbacks(a))) => {
            LoadStubCompiler::compile_load_callback(ctx, receiver, holder, a, name)?
        }
        Some((holder, LookupResult::Interceptor)) => {
            LoadStubCompiler::compile_load_interceptor(ctx, receiver, holder, name)?
        }
        Some((_, LookupResult::Transition(_))) | Some((_, LookupResult::NotFound)) | None => {
            if is_global {
                // Global properties live in cells, not shape descriptors.
                LoadStubCompiler::compile_load_global(ctx, receiver, receiver, name)?
            } else {
                LoadStubCompiler::compile_load_nonexistent(ctx, receiver, name)?
            }
        }
    };

    ctx.stub_cache
        .insert(&ctx.heap.names, name, shape, flags, code);
    debug!(name = ctx.heap.names.resolve(name), "load stub cached");
    Ok(code)
}

/// Resolve a store miss analogously.
pub fn compute_store_stub(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    name: NameId,
) -> Result<CodeHandle> {
    let shape = ctx.heap.shape_of(receiver);
    let flags = monomorphic_flags(ctx, CodeKind::StoreIc, receiver, 0);
    if let Some(code) = ctx
        .stub_cache
        .probe(&ctx.heap.names, &ctx.code_space, name, shape, flags)
    {
        return Ok(code);
    }

    let is_global = ctx
        .heap
        .shape(shape)
        .flags
        .contains(crate::heap::ShapeFlags::GLOBAL_LIKE);
    let code = if is_global {
        StoreStubCompiler::compile_store_global(ctx, receiver, name)?
    } else {
        match ctx.heap.lookup_property(shape, name) {
            LookupResult::Field { index } => {
                StoreStubCompiler::compile_store_field(ctx, receiver, index, None, name)?
            }
            LookupResult::Callbacks(a) => {
                StoreStubCompiler::compile_store_callback(ctx, receiver, a, name)?
            }
            LookupResult::Interceptor => {
                StoreStubCompiler::compile_store_interceptor(ctx, receiver, name)?
            }
            LookupResult::Transition(target) => {
                let index = match ctx.heap.lookup_behind_interceptor(target, name) {
                    LookupResult::Field { index } => index,
                    _ => ctx.heap.shape(target).property_count().saturating_sub(1),
                };
                StoreStubCompiler::compile_store_field(ctx, receiver, index, Some(target), name)?
            }
            LookupResult::ConstantFunction(_) | LookupResult::NotFound => {
                let target = ctx.heap.transition_add_field(shape, name);
                let index = ctx.heap.shape(target).property_count() - 1;
                StoreStubCompiler::compile_store_field(ctx, receiver, index, Some(target), name)?
            }
        }
    };

    ctx.stub_cache
        .insert(&ctx.heap.names, name, shape, flags, code);
    debug!(name = ctx.heap.names.resolve(name), "store stub cached");
    Ok(code)
}

/// Resolve a call miss analogously, keyed additionally by argument count.
pub fn compute_call_stub(
    ctx: &mut CompileContext,
    receiver: ObjectRef,
    name: NameId,
    argc: u32,
) -> Result<CodeHandle> {
    let shape = ctx.heap.shape_of(receiver);
    let flags = monomorphic_flags(ctx, CodeKind::CallIc, receiver, argc);
    if let Some(code) = ctx
        .stub_cache
        .probe(&ctx.heap.names, &ctx.code_space, name, shape, flags)
    {
        return Ok(code);
    }

    let compiler = CallStubCompiler::new(argc);
    let is_global = ctx
        .heap
        .shape(shape)
        .flags
        .contains(crate::heap::ShapeFlags::GLOBAL_LIKE);

    let code = if is_global {
        // A global call binds through the property cell.
        match crate::runtime::generic_load(ctx, receiver, name) {
            crate::heap::Value::Function(f) => {
                compiler.compile_call_global(ctx, receiver, receiver, f, name)?
            }
            _ => return missing_callee(ctx),
        }
    } else {
        match ctx.heap.lookup_on_chain(receiver, name) {
            Some((holder, LookupResult::ConstantFunction(f))) => {
                compiler.compile_call_constant(ctx, receiver, holder, f, name)?
            }
            Some((holder, LookupResult::Field { index })) => {
                compiler.compile_call_field(ctx, receiver, holder, index, name)?
            }
            Some((holder, LookupResult::Interceptor)) => {
                compiler.compile_call_interceptor(ctx, receiver, holder, name)?
            }
            _ => return missing_callee(ctx),
        }
    };

    ctx.stub_cache
        .insert(&ctx.heap.names, name, shape, flags, code);
    debug!(name = ctx.heap.names.resolve(name), argc, "call stub cached");
    Ok(code)
}

fn missing_callee(ctx: &CompileContext) -> Result<CodeHandle> {
    // Nothing callable to specialize on; sites keep using the generic
    // entry and re-miss until the shape of the world changes.
    Ok(ctx.builtins.call_ic_miss)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::{InstanceType, Value};

    #[test]
    fn test_compute_load_stub_caches_by_shape_and_name() {
        let mut ctx = CompileContext::new();
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        let shape = ctx.heap.transition_add_field(base, x);
        let a = ctx.heap.new_object(shape);
        let b = ctx.heap.new_object(shape);
        ctx.heap.store_field(a, 0, Value::Smi(1));
        ctx.heap.store_field(b, 0, Value::Smi(2));

        let first = compute_load_stub(&mut ctx, a, x).unwrap();
        // Same shape and name: the second site reuses the cached stub.
        let second = compute_load_stub(&mut ctx, b, x).unwrap();
        assert_eq!(first, second);
        assert_eq!(ctx.stub_cache.stats().hits, 1);
    }

    #[test]
    fn test_load_and_store_stubs_do_not_collide() {
        let mut ctx = CompileContext::new();
        let base = ctx.heap.new_shape(InstanceType::Object, 1);
        let x = ctx.heap.names.intern("x");
        let shape = ctx.heap.transition_add_field(base, x);
        let obj = ctx.heap.new_object(shape);

        let load = compute_load_stub(&mut ctx, obj, x).unwrap();
        let store = compute_store_stub(&mut ctx, obj, x).unwrap();
        assert_ne!(load, store);
        // Each keeps its own cache entry.
        assert_eq!(compute_load_stub(&mut ctx, obj, x).unwrap(), load);
        assert_eq!(compute_store_stub(&mut ctx, obj, x).unwrap(), store);
    }

    #[test]
    fn test_call_stubs_keyed_by_argc() {
        let mut ctx = CompileContext::new();
        let shared = ctx.heap.new_shared_function("m", 0);
        let f = ctx.heap.new_function(shared, false);
        let shape = ctx.heap.new_shape(InstanceType::Object, 0);
        let m = ctx.heap.names.intern("m");
        ctx.heap.add_descriptor(
            shape,
            m,
            crate::heap::PropertyDetails::ConstantFunction(f),
        );
        let obj = ctx.heap.new_object(shape);

        let one = compute_call_stub(&mut ctx, obj, m, 1).unwrap();
        let two = compute_call_stub(&mut ctx, obj, m, 2).unwrap();
        assert_ne!(one, two);
        assert_eq!(compute_call_stub(&mut ctx, obj, m, 1).unwrap(), one);
    }
}
