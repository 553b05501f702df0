//! Explicit compilation context
//!
//! Every component takes the context as an argument instead of reaching
//! into ambient globals: it bundles the heap collaborator, the code-object
//! store, the stub cache, the pre-installed builtins, the debugger state,
//! and the policy knobs.

use crate::code::{CodeDesc, CodeFlags, CodeHandle, CodeKind, CodeSpace, IcState};
use crate::debug::Debug;
use crate::error::Result;
use crate::heap::Heap;
use crate::ic::stub_cache::StubCache;
use crate::masm::{conv, MacroAssembler, Reg};
use crate::runtime::RuntimeFn;

/// Policy knobs, tuned empirically; the mechanism matters more than the
/// specific values.
#[derive(Debug, Clone)]
pub struct CompilerConfig {
    /// Maximum graph node count for an inlining candidate.
    pub max_inline_nodes: usize,
    /// Maximum source size (AST textual weight) for an inlining candidate.
    pub max_inline_source_size: usize,
    /// Maximum inlining nesting depth.
    pub max_inline_depth: usize,
    /// Maximum expression nesting before the graph builder bails out.
    pub max_build_depth: usize,
    /// Whether the inline construct stub may be used at all.
    pub inline_construct_enabled: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            max_inline_nodes: 196,
            max_inline_source_size: 600,
            max_inline_depth: 3,
            max_build_depth: 256,
            inline_construct_enabled: true,
        }
    }
}

/// Fixed runtime entry points installed once per context.
///
/// Miss handlers and trampolines are ordinary code objects so generated
/// stubs can tail-call them like any other target.
#[derive(Debug, Clone, Copy)]
pub struct Builtins {
    pub load_ic_miss: CodeHandle,
    pub store_ic_miss: CodeHandle,
    pub call_ic_miss: CodeHandle,
    pub keyed_load_ic_miss: CodeHandle,
    /// Returns undefined; the call-miss resolver dispatches here when the
    /// callee cannot be resolved.
    pub return_undefined: CodeHandle,
    pub grow_storage: CodeHandle,
    pub load_callback: CodeHandle,
    pub store_callback: CodeHandle,
    pub load_interceptor: CodeHandle,
    pub store_interceptor: CodeHandle,
    pub construct_generic: CodeHandle,
    /// Trap hit when a patched IC call site fires.
    pub debug_break: CodeHandle,
    /// Trap hit when a patched return sequence fires.
    pub debug_break_return: CodeHandle,
    /// Synthetic frame the debugger substitutes for dropped frames; control
    /// re-enters the function at a safe boundary through here.
    pub frame_dropper: CodeHandle,
}

impl Builtins {
    /// Compile and install every builtin into `space`.
    pub fn install(space: &mut CodeSpace) -> Result<Builtins> {
        let flags = CodeFlags::new(CodeKind::Builtin, IcState::Uninitialized);

        let runtime_stub = |space: &mut CodeSpace, id: RuntimeFn| -> Result<CodeHandle> {
            let mut masm = MacroAssembler::new();
            masm.call_runtime(id as u32);
            masm.ret();
            space.allocate(masm.finish(), flags)
        };

        let load_ic_miss = runtime_stub(space, RuntimeFn::LoadIcMiss)?;
        let store_ic_miss = runtime_stub(space, RuntimeFn::StoreIcMiss)?;
        let keyed_load_ic_miss = runtime_stub(space, RuntimeFn::LoadIcMiss)?;
        let grow_storage = runtime_stub(space, RuntimeFn::GrowStorageAndStore)?;
        let load_callback = runtime_stub(space, RuntimeFn::LoadCallback)?;
        let store_callback = runtime_stub(space, RuntimeFn::StoreCallback)?;
        let load_interceptor = runtime_stub(space, RuntimeFn::LoadInterceptor)?;
        let store_interceptor = runtime_stub(space, RuntimeFn::StoreInterceptor)?;
        let construct_generic = runtime_stub(space, RuntimeFn::GenericConstruct)?;

        let return_undefined = {
            let mut masm = MacroAssembler::new();
            masm.load_value(conv::RESULT, crate::heap::Value::Undefined);
            masm.ret();
            space.allocate(masm.finish(), flags)?
        };

        // The call miss resolves the target's code into R9 and transfers.
        let call_ic_miss = {
            let mut masm = MacroAssembler::new();
            masm.call_runtime(RuntimeFn::ResolveCallTarget as u32);
            masm.jump_code(Reg::R9);
            space.allocate(masm.finish(), flags)?
        };

        let trap = |space: &mut CodeSpace| -> Result<CodeHandle> {
            let mut masm = MacroAssembler::new();
            masm.debug_break();
            masm.ret();
            space.allocate(masm.finish(), flags)
        };
        let debug_break = trap(space)?;
        let debug_break_return = trap(space)?;

        let frame_dropper = {
            let mut masm = MacroAssembler::new();
            masm.call_runtime(RuntimeFn::DropFrames as u32);
            masm.ret();
            space.allocate(masm.finish(), flags)?
        };

        Ok(Builtins {
            load_ic_miss,
            store_ic_miss,
            call_ic_miss,
            keyed_load_ic_miss,
            return_undefined,
            grow_storage,
            load_callback,
            store_callback,
            load_interceptor,
            store_interceptor,
            construct_generic,
            debug_break,
            debug_break_return,
            frame_dropper,
        })
    }

    /// The debug trampoline a patched site of the given kind jumps to.
    pub fn debug_target_for(&self, kind: CodeKind) -> CodeHandle {
        match kind {
            CodeKind::Baseline | CodeKind::Optimized => self.debug_break_return,
            _ => self.debug_break,
        }
    }
}

/// The state threaded through every compiler entry point.
pub struct CompileContext {
    pub heap: Heap,
    pub code_space: CodeSpace,
    pub stub_cache: StubCache,
    pub builtins: Builtins,
    pub debug: Debug,
    pub config: CompilerConfig,
}

impl CompileContext {
    pub fn new() -> Self {
        let heap = Heap::new();
        let mut code_space = CodeSpace::new();
        let builtins =
            Builtins::install(&mut code_space).expect("builtin installation cannot exhaust a fresh code space");
        Self {
            heap,
            code_space,
            stub_cache: StubCache::new(),
            builtins,
            debug: Debug::new(),
            config: CompilerConfig::default(),
        }
    }

    /// Allocate a finished descriptor, propagating exhaustion.
    pub fn allocate_code(&mut self, desc: CodeDesc, flags: CodeFlags) -> Result<CodeHandle> {
        self.code_space.allocate(desc, flags)
    }
}

impl Default for CompileContext {
    fn default() -> Self {
        Self::new()
    }
}
