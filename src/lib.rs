//! Cinnabar: JIT compilation and inline-cache infrastructure for a
//! dynamic-language VM
//!
//! Cinnabar is the specialization machinery of a dynamic-language engine:
//! it turns dynamically-typed property and call sites into guarded,
//! specialized code stubs, maintains the global stub cache that memoizes
//! them, lowers a typed instruction graph to a register-allocation-ready
//! form with deoptimization metadata, and patches live code for
//! breakpoints and stepping without corrupting it.
//!
//! # Quick Start
//!
//! ```
//! use cinnabar::context::CompileContext;
//! use cinnabar::heap::{InstanceType, Value};
//!
//! let mut ctx = CompileContext::new();
//! let base = ctx.heap.new_shape(InstanceType::Object, 1);
//! let x = ctx.heap.names.intern("x");
//! let shape = ctx.heap.transition_add_field(base, x);
//! let obj = ctx.heap.new_object(shape);
//! ctx.heap.store_field(obj, 0, Value::Smi(7));
//! let stub = cinnabar::ic::compute_load_stub(&mut ctx, obj, x).unwrap();
//! assert!(ctx.code_space.get(stub).len() > 0);
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Inline caches** | [`ic`] (stub cache, cache keys, prototype guards, stub compilers) |
//! | **Code** | [`code`], [`masm`] (code objects, relocation, reference ISA, simulator) |
//! | **Optimizing tier** | [`ast`], [`hir`], [`lir`] |
//! | **Debugging** | [`debug`] (breakpoints, stepping, code patching) |
//! | **Collaborators** | [`heap`] (object model surface), [`runtime`] (slow paths) |
//! | **Glue** | [`context`], [`error`](Error) |

// Clippy configuration for the compiler pipeline.
//
// - too_many_arguments: stub generators thread registers and labels
//   explicitly, matching the emitter call shape
// - new_without_default: contexts have required installation steps
#![allow(clippy::too_many_arguments)]
#![allow(clippy::new_without_default)]

pub mod ast;
pub mod code;
pub mod context;
pub mod debug;
pub mod heap;
pub mod hir;
pub mod ic;
pub mod lir;
pub mod masm;
pub mod runtime;

mod error;

pub use context::{CompileContext, CompilerConfig};
pub use error::{Error, Result};

/// Cinnabar version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run the optimizing pipeline for one function: graph construction,
/// redundancy elimination, range recomputation, and lowering.
///
/// A bailout (unsupported construct, stack overflow) is recoverable: the
/// caller keeps the function on the baseline tier.
pub fn optimize_function(
    program: &ast::Program<'_>,
    index: usize,
    config: &CompilerConfig,
) -> Result<(hir::Graph, lir::LChunk)> {
    let mut graph = hir::builder::build_graph(program, index, config)?;
    hir::gvn::eliminate_redundancy(&mut graph);
    graph.compute_ranges();
    graph.verify()?;
    let chunk = lir::lowering::lower_graph(&graph)?;
    Ok((graph, chunk))
}
