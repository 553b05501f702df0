//! Cinnabar CLI: drive the pipeline on demo input and dump artifacts

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cinnabar::ast::{AstArena, BinOp, CmpOp, Expr, FunctionDecl, Literal, Program, Stmt};
use cinnabar::context::CompileContext;
use cinnabar::heap::{InstanceType, Value};
use cinnabar::masm::disassemble;
use cinnabar::CompilerConfig;

#[derive(Parser)]
#[command(name = "cinnabar", version = cinnabar::VERSION)]
#[command(about = "JIT and inline-cache infrastructure for a dynamic-language VM")]
struct Cli {
    /// Log filter (overrides RUST_LOG), e.g. "cinnabar=debug"
    #[arg(long)]
    trace: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build the demo function and dump its high-level graph
    DumpHir,
    /// Lower the demo function and dump the low-level instruction list
    DumpLir,
    /// Compile a monomorphic load stub and disassemble it
    DumpStub,
    /// Print stub cache statistics after a miss/hit exercise
    CacheStats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = match &cli.trace {
        Some(spec) => EnvFilter::new(spec.clone()),
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::DumpHir => {
            let arena = AstArena::new();
            let program = demo_program(&arena);
            let (graph, _) = cinnabar::optimize_function(&program, 0, &CompilerConfig::default())?;
            print!("{graph}");
        }
        Command::DumpLir => {
            let arena = AstArena::new();
            let program = demo_program(&arena);
            let (_, chunk) = cinnabar::optimize_function(&program, 0, &CompilerConfig::default())?;
            for (i, instr) in chunk.instrs.iter().enumerate() {
                println!("{i:4}  {:?}", instr.op);
            }
            println!(
                "vregs={} environments={} spill_slots={}",
                chunk.vreg_count,
                chunk.environments.len(),
                chunk.spill_slot_count
            );
        }
        Command::DumpStub => {
            let mut ctx = CompileContext::new();
            let base = ctx.heap.new_shape(InstanceType::Object, 2);
            let x = ctx.heap.names.intern("x");
            let shape = ctx.heap.transition_add_field(base, x);
            let obj = ctx.heap.new_object(shape);
            ctx.heap.store_field(obj, 0, Value::Smi(42));
            let stub = cinnabar::ic::compute_load_stub(&mut ctx, obj, x)?;
            let code = ctx.code_space.get(stub);
            print!("{}", disassemble(code.bytes(), code.pool()));
        }
        Command::CacheStats => {
            let mut ctx = CompileContext::new();
            let base = ctx.heap.new_shape(InstanceType::Object, 1);
            let x = ctx.heap.names.intern("x");
            let shape = ctx.heap.transition_add_field(base, x);
            for _ in 0..3 {
                let obj = ctx.heap.new_object(shape);
                cinnabar::ic::compute_load_stub(&mut ctx, obj, x)?;
            }
            let stats = ctx.stub_cache.stats();
            println!(
                "hits={} misses={} inserts={} hit_rate={:.1}%",
                stats.hits,
                stats.misses,
                stats.inserts,
                stats.hit_rate()
            );
        }
    }
    Ok(())
}

/// `function demo(a, b) { let s = 0; while (s < a) { s = s + b; } return s && a; }`
fn demo_program<'a>(arena: &'a AstArena<'a>) -> Program<'a> {
    let a = &*arena.alloc(Expr::Local(0));
    let b = &*arena.alloc(Expr::Local(1));
    let s = &*arena.alloc(Expr::Local(2));
    let zero = &*arena.alloc(Expr::Literal(Literal::Smi(0)));
    let cond = &*arena.alloc(Expr::Compare {
        op: CmpOp::Lt,
        left: s,
        right: a,
    });
    let sum = &*arena.alloc(Expr::Binary {
        op: BinOp::Add,
        left: s,
        right: b,
    });
    let assign = &*arena.alloc(Expr::Assign { slot: 2, value: sum });
    let result = &*arena.alloc(Expr::Logical {
        op: cinnabar::ast::LogicalOp::And,
        left: s,
        right: a,
    });
    let mut program = Program::new();
    program.add_function(FunctionDecl {
        name: "demo".to_string(),
        param_count: 2,
        local_count: 3,
        body: vec![
            Stmt::Declare {
                slot: 2,
                value: zero,
            },
            Stmt::While {
                condition: cond,
                body: vec![Stmt::Expression(assign)],
            },
            Stmt::Return(Some(result)),
        ],
        source_size: 60,
    });
    program
}
