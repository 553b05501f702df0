//! Performance benchmarks for the stub cache and the optimizing pipeline
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use cinnabar::ast::{AstArena, BinOp, CmpOp, Expr, FunctionDecl, Literal, Program, Stmt};
use cinnabar::code::{CodeDesc, CodeFlags, CodeKind, IcState};
use cinnabar::context::CompileContext;
use cinnabar::heap::InstanceType;
use cinnabar::ic::stub_cache::StubCache;
use cinnabar::CompilerConfig;

/// Benchmark: probe/insert throughput on the two-way stub cache.
fn bench_stub_cache(c: &mut Criterion) {
    let mut ctx = CompileContext::new();
    let flags = CodeFlags::new(CodeKind::LoadIc, IcState::Monomorphic);
    let code = ctx
        .code_space
        .allocate(
            CodeDesc {
                bytes: vec![0; 8],
                reloc: Vec::new(),
                pool: Vec::new(),
            },
            flags,
        )
        .unwrap();
    let entries: Vec<_> = (0..256)
        .map(|i| {
            let name = ctx.heap.names.intern(&format!("prop_{i}"));
            let shape = ctx.heap.new_shape(InstanceType::Object, 1);
            (name, shape)
        })
        .collect();
    let mut cache = StubCache::new();
    for &(name, shape) in &entries {
        cache.insert(&ctx.heap.names, name, shape, flags, code);
    }

    c.bench_function("stub_cache_probe_hit", |b| {
        let mut i = 0;
        b.iter(|| {
            let (name, shape) = entries[i % entries.len()];
            i += 1;
            black_box(cache.probe(&ctx.heap.names, &ctx.code_space, name, shape, flags))
        })
    });

    c.bench_function("stub_cache_insert", |b| {
        let mut i = 0;
        b.iter(|| {
            let (name, shape) = entries[i % entries.len()];
            i += 1;
            cache.insert(&ctx.heap.names, name, shape, flags, code);
        })
    });
}

/// Benchmark: full graph build + GVN + lowering for a small hot loop.
fn bench_pipeline(c: &mut Criterion) {
    c.bench_function("optimize_loop_function", |b| {
        b.iter(|| {
            let arena = AstArena::new();
            let n = &*arena.alloc(Expr::Local(0));
            let i = &*arena.alloc(Expr::Local(1));
            let zero = &*arena.alloc(Expr::Literal(Literal::Smi(0)));
            let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
            let cond = &*arena.alloc(Expr::Compare {
                op: CmpOp::Lt,
                left: i,
                right: n,
            });
            let inc = &*arena.alloc(Expr::Binary {
                op: BinOp::Add,
                left: i,
                right: one,
            });
            let assign = &*arena.alloc(Expr::Assign { slot: 1, value: inc });
            let mut program = Program::new();
            program.add_function(FunctionDecl {
                name: "count".to_string(),
                param_count: 1,
                local_count: 2,
                body: vec![
                    Stmt::Declare { slot: 1, value: zero },
                    Stmt::While {
                        condition: cond,
                        body: vec![Stmt::Expression(assign)],
                    },
                    Stmt::Return(Some(i)),
                ],
                source_size: 40,
            });
            black_box(
                cinnabar::optimize_function(&program, 0, &CompilerConfig::default()).unwrap(),
            )
        })
    });
}

/// Benchmark: monomorphic load stub compilation (guards + field load).
fn bench_stub_compilation(c: &mut Criterion) {
    c.bench_function("compile_load_stub", |b| {
        b.iter(|| {
            let mut ctx = CompileContext::new();
            let base = ctx.heap.new_shape(InstanceType::Object, 2);
            let x = ctx.heap.names.intern("x");
            let shape = ctx.heap.transition_add_field(base, x);
            let obj = ctx.heap.new_object(shape);
            black_box(cinnabar::ic::compute_load_stub(&mut ctx, obj, x).unwrap())
        })
    });
}

criterion_group!(benches, bench_stub_cache, bench_pipeline, bench_stub_compilation);
criterion_main!(benches);
