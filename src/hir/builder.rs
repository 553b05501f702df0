//! AST-to-graph construction
//!
//! The builder walks the typed expression tree once, emitting into basic
//! blocks. Each expression is visited in one of three contexts: effect
//! (value discarded), value (value produced), or test (value consumed as a
//! branch condition with explicit targets). Control constructs choose
//! their lowering by context — a short-circuit operator branches in test
//! and value contexts but flattens to sequential evaluation for effect.
//!
//! Unsupported constructs and exhausted stack headroom raise a bailout
//! that unwinds to the entry point; the caller falls back to the baseline
//! tier for that function.

use tracing::debug;

use crate::ast::{CallTarget, Expr, FunctionDecl, Literal, Program, Stmt};
use crate::context::CompilerConfig;
use crate::error::{Error, Result};
use crate::hir::{BlockId, Graph, HConst, HirId, HOp};

struct InlineFrame {
    function: usize,
    return_join: BlockId,
    return_values: Vec<HirId>,
}

/// Single-pass graph builder for one function.
pub struct GraphBuilder<'p, 'a> {
    program: &'p Program<'a>,
    config: &'p CompilerConfig,
    graph: Graph,
    current: BlockId,
    /// Abstract interpreter state: one live value per local slot.
    env: Vec<HirId>,
    depth: usize,
    ast_id: u32,
    inline_stack: Vec<InlineFrame>,
    /// Functions on the build path, to refuse direct recursion inlining.
    function_stack: Vec<usize>,
}

/// How an expression's value is consumed.
#[derive(Clone, Copy)]
enum ExprContext {
    Effect,
    Value,
    Test { if_true: BlockId, if_false: BlockId },
}

/// Build the optimizable graph for `program.functions[index]`.
pub fn build_graph(
    program: &Program<'_>,
    index: usize,
    config: &CompilerConfig,
) -> Result<Graph> {
    let function = program.function(index);
    let mut graph = Graph::new();
    let entry = graph.entry;

    let mut env = Vec::with_capacity(function.local_count as usize);
    for param in 0..function.param_count {
        env.push(graph.add_instruction(entry, HOp::Parameter(param), Vec::new()));
    }
    let undefined = graph.add_instruction(entry, HOp::Constant(HConst::Undefined), Vec::new());
    for _ in function.param_count..function.local_count {
        env.push(undefined);
    }

    let mut builder = GraphBuilder {
        program,
        config,
        graph,
        current: entry,
        env,
        depth: 0,
        ast_id: 0,
        inline_stack: Vec::new(),
        function_stack: vec![index],
    };

    let fell_through = builder.visit_stmts(&function.body)?;
    if fell_through {
        let undefined = builder
            .graph
            .add_instruction(builder.current, HOp::Constant(HConst::Undefined), Vec::new());
        builder
            .graph
            .add_instruction(builder.current, HOp::Return, vec![undefined]);
    }

    let mut graph = builder.graph;
    graph.infer_types();
    graph.infer_representations();
    graph.compute_ranges();
    graph.verify()?;
    debug!(
        function = function.name.as_str(),
        values = graph.value_count(),
        blocks = graph.blocks.len(),
        "graph built"
    );
    Ok(graph)
}

impl<'p, 'a> GraphBuilder<'p, 'a> {
    fn next_ast_id(&mut self) -> u32 {
        self.ast_id += 1;
        self.ast_id
    }

    fn constant(&mut self, constant: HConst) -> HirId {
        self.graph
            .add_instruction(self.current, HOp::Constant(constant), Vec::new())
    }

    /// Snapshot the abstract state right after a side-effecting
    /// instruction, so deoptimization can resume in the baseline tier.
    fn add_simulate(&mut self, effect: HirId) {
        let mut operands = vec![effect];
        operands.extend(self.env.iter().copied());
        let ast_id = self.next_ast_id();
        self.graph
            .add_instruction(self.current, HOp::Simulate { ast_id }, operands);
    }

    // -- statements --------------------------------------------------------

    /// Returns true when control falls off the end of the list.
    fn visit_stmts(&mut self, stmts: &[Stmt<'a>]) -> Result<bool> {
        for stmt in stmts {
            if !self.visit_stmt(stmt)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn visit_stmt(&mut self, stmt: &Stmt<'a>) -> Result<bool> {
        match stmt {
            Stmt::Expression(expr) => {
                self.visit_expr(expr, ExprContext::Effect)?;
                Ok(true)
            }
            Stmt::Declare { slot, value } => {
                let v = self.expect_value(value)?;
                self.env[*slot as usize] = v;
                Ok(true)
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => self.visit_if(condition, then_branch, else_branch),
            Stmt::While { condition, body } => self.visit_while(condition, body),
            Stmt::Return(value) => {
                let v = match value {
                    Some(expr) => self.expect_value(expr)?,
                    None => self.constant(HConst::Undefined),
                };
                if let Some(frame) = self.inline_stack.last_mut() {
                    frame.return_values.push(v);
                    let join = frame.return_join;
                    self.graph.goto(self.current, join);
                } else {
                    self.graph.add_instruction(self.current, HOp::Return, vec![v]);
                }
                Ok(false)
            }
            Stmt::TryCatch { .. } => Err(Error::bailout("unsupported construct: try/catch")),
        }
    }

    fn visit_if(
        &mut self,
        condition: &Expr<'a>,
        then_branch: &[Stmt<'a>],
        else_branch: &[Stmt<'a>],
    ) -> Result<bool> {
        let then_block = self.graph.new_block();
        let else_block = self.graph.new_block();
        let join = self.graph.new_block();
        self.visit_expr(
            condition,
            ExprContext::Test {
                if_true: then_block,
                if_false: else_block,
            },
        )?;

        let saved = self.env.clone();

        self.current = then_block;
        self.env = saved.clone();
        let then_fell = self.visit_stmts(then_branch)?;
        let then_env = self.env.clone();
        if then_fell {
            self.graph.goto(self.current, join);
        }

        self.current = else_block;
        self.env = saved;
        let else_fell = self.visit_stmts(else_branch)?;
        let else_env = self.env.clone();
        if else_fell {
            self.graph.goto(self.current, join);
        }

        self.current = join;
        match (then_fell, else_fell) {
            (true, true) => {
                // Join differing slots with phis; operand order follows the
                // predecessor order (then, else).
                self.env = then_env
                    .iter()
                    .zip(else_env.iter())
                    .map(|(&t, &e)| {
                        if t == e {
                            t
                        } else {
                            self.graph.add_phi(join, vec![t, e])
                        }
                    })
                    .collect();
                Ok(true)
            }
            (true, false) => {
                self.env = then_env;
                Ok(true)
            }
            (false, true) => {
                self.env = else_env;
                Ok(true)
            }
            (false, false) => Ok(false),
        }
    }

    fn visit_while(&mut self, condition: &Expr<'a>, body: &[Stmt<'a>]) -> Result<bool> {
        let header = self.graph.new_block();
        self.graph.goto(self.current, header);
        self.graph.blocks[header.index()].is_loop_header = true;

        // Every local gets a loop phi; the back-edge operand is appended
        // once the body is built.
        let entry_env = self.env.clone();
        let phis: Vec<HirId> = entry_env
            .iter()
            .map(|&v| self.graph.add_phi(header, vec![v]))
            .collect();
        self.env = phis.clone();

        let body_block = self.graph.new_block();
        let exit = self.graph.new_block();
        self.current = header;
        self.visit_expr(
            condition,
            ExprContext::Test {
                if_true: body_block,
                if_false: exit,
            },
        )?;

        self.current = body_block;
        let fell = self.visit_stmts(body)?;
        if fell {
            self.graph.goto(self.current, header);
            for (phi, &value) in phis.iter().zip(self.env.iter()) {
                self.graph.append_phi_operand(*phi, value);
            }
        }

        self.current = exit;
        self.env = phis;
        Ok(true)
    }

    // -- expressions -------------------------------------------------------

    fn expect_value(&mut self, expr: &Expr<'a>) -> Result<HirId> {
        Ok(self
            .visit_expr(expr, ExprContext::Value)?
            .expect("value context always produces a value"))
    }

    fn visit_expr(&mut self, expr: &Expr<'a>, ctx: ExprContext) -> Result<Option<HirId>> {
        self.depth += 1;
        if self.depth > self.config.max_build_depth {
            let depth = self.depth;
            self.depth -= 1;
            return Err(Error::StackOverflow { depth });
        }
        let result = self.visit_expr_inner(expr, ctx);
        self.depth -= 1;
        result
    }

    fn visit_expr_inner(&mut self, expr: &Expr<'a>, ctx: ExprContext) -> Result<Option<HirId>> {
        match expr {
            Expr::Logical { op, left, right } => return self.visit_logical(*op, left, right, ctx),
            _ => {}
        }

        let value = match expr {
            Expr::Literal(literal) => {
                let constant = match literal {
                    Literal::Smi(n) => HConst::Smi(*n),
                    Literal::Number(n) => HConst::Number(*n),
                    Literal::Boolean(b) => HConst::Boolean(*b),
                    Literal::Undefined => HConst::Undefined,
                };
                self.constant(constant)
            }
            Expr::Local(slot) => self.env[*slot as usize],
            Expr::Assign { slot, value } => {
                let v = self.expect_value(value)?;
                self.env[*slot as usize] = v;
                v
            }
            Expr::Binary { op, left, right } => {
                let l = self.expect_value(left)?;
                let r = self.expect_value(right)?;
                self.graph
                    .add_instruction(self.current, HOp::Binary(*op), vec![l, r])
            }
            Expr::Compare { op, left, right } => {
                let l = self.expect_value(left)?;
                let r = self.expect_value(right)?;
                self.graph
                    .add_instruction(self.current, HOp::Compare(*op), vec![l, r])
            }
            Expr::PropertyLoad { object, name } => {
                let obj = self.expect_value(object)?;
                let name = self.graph.intern_name(name);
                let load = self.graph.add_instruction(
                    self.current,
                    HOp::LoadNamedGeneric { name },
                    vec![obj],
                );
                self.add_simulate(load);
                load
            }
            Expr::PropertyStore {
                object,
                name,
                value,
            } => {
                let obj = self.expect_value(object)?;
                let v = self.expect_value(value)?;
                let name = self.graph.intern_name(name);
                let store = self.graph.add_instruction(
                    self.current,
                    HOp::StoreNamedGeneric { name },
                    vec![obj, v],
                );
                self.add_simulate(store);
                v
            }
            Expr::Call {
                target,
                receiver,
                name,
                args,
            } => self.visit_call(*target, *receiver, name, args)?,
            Expr::Logical { .. } => unreachable!("handled above"),
        };

        Ok(self.apply_context(value, ctx))
    }

    fn apply_context(&mut self, value: HirId, ctx: ExprContext) -> Option<HirId> {
        match ctx {
            ExprContext::Effect => None,
            ExprContext::Value => Some(value),
            ExprContext::Test { if_true, if_false } => {
                self.graph.branch(self.current, value, if_true, if_false);
                None
            }
        }
    }

    /// Short-circuit operators lower by context: conditional branches in
    /// test and value contexts, plain sequential evaluation for effect.
    fn visit_logical(
        &mut self,
        op: crate::ast::LogicalOp,
        left: &Expr<'a>,
        right: &Expr<'a>,
        ctx: ExprContext,
    ) -> Result<Option<HirId>> {
        use crate::ast::LogicalOp;
        match ctx {
            ExprContext::Effect => {
                self.visit_expr(left, ExprContext::Effect)?;
                self.visit_expr(right, ExprContext::Effect)?;
                Ok(None)
            }
            ExprContext::Test { if_true, if_false } => {
                let mid = self.graph.new_block();
                match op {
                    LogicalOp::And => self.visit_expr(
                        left,
                        ExprContext::Test {
                            if_true: mid,
                            if_false,
                        },
                    )?,
                    LogicalOp::Or => self.visit_expr(
                        left,
                        ExprContext::Test {
                            if_true,
                            if_false: mid,
                        },
                    )?,
                };
                self.current = mid;
                self.visit_expr(right, ExprContext::Test { if_true, if_false })?;
                Ok(None)
            }
            ExprContext::Value => {
                let right_block = self.graph.new_block();
                let join = self.graph.new_block();
                let l = self.expect_value(left)?;
                match op {
                    LogicalOp::And => {
                        self.graph.branch(self.current, l, right_block, join)
                    }
                    LogicalOp::Or => self.graph.branch(self.current, l, join, right_block),
                }
                self.current = right_block;
                let r = self.expect_value(right)?;
                self.graph.goto(self.current, join);
                self.current = join;
                let phi = self.graph.add_phi(join, vec![l, r]);
                Ok(Some(phi))
            }
        }
    }

    fn visit_call(
        &mut self,
        target: CallTarget,
        receiver: Option<&Expr<'a>>,
        name: &str,
        args: &[&Expr<'a>],
    ) -> Result<HirId> {
        let mut operands = Vec::with_capacity(args.len() + 1);
        if let Some(receiver) = receiver {
            operands.push(self.expect_value(receiver)?);
        }
        for arg in args {
            operands.push(self.expect_value(arg)?);
        }

        if let CallTarget::Known(index) = target {
            if let Some(result) = self.try_inline(index, &operands)? {
                return Ok(result);
            }
            let call = self.graph.add_instruction(
                self.current,
                HOp::CallKnown {
                    function: index as u32,
                    argc: args.len() as u8,
                },
                operands,
            );
            self.add_simulate(call);
            return Ok(call);
        }

        let name = self.graph.intern_name(name);
        let call = self.graph.add_instruction(
            self.current,
            HOp::CallNamed {
                name,
                argc: args.len() as u8,
            },
            operands,
        );
        self.add_simulate(call);
        Ok(call)
    }

    // -- inlining ----------------------------------------------------------

    fn inline_candidate(&self, index: usize, callee: &FunctionDecl<'_>) -> bool {
        if self.inline_stack.len() >= self.config.max_inline_depth {
            return false;
        }
        if self.function_stack.contains(&index) {
            return false;
        }
        if crate::ast::node_count(callee) > self.config.max_inline_nodes {
            return false;
        }
        callee.source_size <= self.config.max_inline_source_size
    }

    /// Inline a known call: bind formals to actuals in a fresh environment
    /// between enter/leave markers, and join multiple returns with a phi.
    fn try_inline(&mut self, index: usize, args: &[HirId]) -> Result<Option<HirId>> {
        let program = self.program;
        let callee = program.function(index);
        if !self.inline_candidate(index, callee) {
            return Ok(None);
        }
        debug!(callee = callee.name.as_str(), "inlining call");

        self.graph.add_instruction(
            self.current,
            HOp::EnterInlined {
                function: index as u32,
            },
            Vec::new(),
        );

        let saved_env = std::mem::take(&mut self.env);
        let undefined = self.constant(HConst::Undefined);
        let mut callee_env = Vec::with_capacity(callee.local_count as usize);
        for param in 0..callee.param_count as usize {
            callee_env.push(args.get(param).copied().unwrap_or(undefined));
        }
        for _ in callee.param_count..callee.local_count {
            callee_env.push(undefined);
        }
        self.env = callee_env;

        let return_join = self.graph.new_block();
        self.inline_stack.push(InlineFrame {
            function: index,
            return_join,
            return_values: Vec::new(),
        });
        self.function_stack.push(index);

        let fell = self.visit_stmts(&callee.body)?;
        if fell {
            let implicit = self.constant(HConst::Undefined);
            self.inline_stack
                .last_mut()
                .unwrap()
                .return_values
                .push(implicit);
            self.graph.goto(self.current, return_join);
        }

        let frame = self.inline_stack.pop().unwrap();
        self.function_stack.pop();
        self.current = return_join;
        self.graph
            .add_instruction(self.current, HOp::LeaveInlined, Vec::new());

        let result = match frame.return_values.len() {
            0 => self.constant(HConst::Undefined),
            1 => frame.return_values[0],
            _ => self.graph.add_phi(return_join, frame.return_values),
        };
        self.env = saved_env;
        Ok(Some(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AstArena, BinOp, CmpOp, LogicalOp};
    use crate::hir::types::Range;

    fn simple_config() -> CompilerConfig {
        CompilerConfig::default()
    }

    /// `function f(a, b) { return a + b * 2; }`
    fn arith_program<'a>(arena: &'a AstArena<'a>) -> Program<'a> {
        let a = &*arena.alloc(Expr::Local(0));
        let b = &*arena.alloc(Expr::Local(1));
        let two = &*arena.alloc(Expr::Literal(Literal::Smi(2)));
        let mul = &*arena.alloc(Expr::Binary {
            op: BinOp::Mul,
            left: b,
            right: two,
        });
        let add = &*arena.alloc(Expr::Binary {
            op: BinOp::Add,
            left: a,
            right: mul,
        });
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 2,
            local_count: 2,
            body: vec![Stmt::Return(Some(add))],
            source_size: 20,
        });
        program
    }

    #[test]
    fn test_build_arithmetic() {
        let arena = AstArena::new();
        let program = arith_program(&arena);
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        let ops: Vec<&'static str> = graph.blocks[graph.entry.index()]
            .instructions
            .iter()
            .map(|&id| graph.value(id).op.mnemonic())
            .collect();
        assert!(ops.contains(&"add"));
        assert!(ops.contains(&"mul"));
        assert!(ops.contains(&"return"));
    }

    #[test]
    fn test_if_join_phi() {
        // function f(a) { let x = 0; if (a < 10) { x = 1; } else { x = 2; } return x; }
        let arena = AstArena::new();
        let a = &*arena.alloc(Expr::Local(0));
        let ten = &*arena.alloc(Expr::Literal(Literal::Smi(10)));
        let cond = &*arena.alloc(Expr::Compare {
            op: CmpOp::Lt,
            left: a,
            right: ten,
        });
        let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
        let two = &*arena.alloc(Expr::Literal(Literal::Smi(2)));
        let x = &*arena.alloc(Expr::Local(1));
        let zero = &*arena.alloc(Expr::Literal(Literal::Smi(0)));

        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 1,
            local_count: 2,
            body: vec![
                Stmt::Declare { slot: 1, value: zero },
                Stmt::If {
                    condition: cond,
                    then_branch: vec![Stmt::Expression(
                        arena.alloc(Expr::Assign { slot: 1, value: one }),
                    )],
                    else_branch: vec![Stmt::Expression(
                        arena.alloc(Expr::Assign { slot: 1, value: two }),
                    )],
                },
                Stmt::Return(Some(x)),
            ],
            source_size: 40,
        });
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        // The join block carries a phi over the two assignments.
        let has_phi = graph.blocks.iter().any(|b| !b.phis.is_empty());
        assert!(has_phi);
        // Its range is the union of both constants.
        let phi_block = graph.blocks.iter().find(|b| !b.phis.is_empty()).unwrap();
        let phi = phi_block.phis[0];
        assert_eq!(graph.value(phi).range, Some(Range::new(1, 2)));
    }

    #[test]
    fn test_while_loop_phis() {
        // function f() { let i = 0; while (i < 10) { i = i + 1; } return i; }
        let arena = AstArena::new();
        let zero = &*arena.alloc(Expr::Literal(Literal::Smi(0)));
        let i = &*arena.alloc(Expr::Local(0));
        let ten = &*arena.alloc(Expr::Literal(Literal::Smi(10)));
        let cond = &*arena.alloc(Expr::Compare {
            op: CmpOp::Lt,
            left: i,
            right: ten,
        });
        let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
        let inc = &*arena.alloc(Expr::Binary {
            op: BinOp::Add,
            left: i,
            right: one,
        });
        let assign = &*arena.alloc(Expr::Assign { slot: 0, value: inc });

        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 0,
            local_count: 1,
            body: vec![
                Stmt::Declare { slot: 0, value: zero },
                Stmt::While {
                    condition: cond,
                    body: vec![Stmt::Expression(assign)],
                },
                Stmt::Return(Some(i)),
            ],
            source_size: 40,
        });
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        let header = graph
            .blocks
            .iter()
            .find(|b| b.is_loop_header)
            .expect("loop header exists");
        assert_eq!(header.phis.len(), 1);
        // The loop phi has the entry operand plus the back-edge operand.
        assert_eq!(graph.value(header.phis[0]).operands.len(), 2);
    }

    #[test]
    fn test_logical_effect_context_is_sequential() {
        // `a && b;` as a statement: no branches, both sides evaluated for
        // effect only.
        let arena = AstArena::new();
        let a = &*arena.alloc(Expr::Local(0));
        let b = &*arena.alloc(Expr::Local(1));
        let and = &*arena.alloc(Expr::Logical {
            op: LogicalOp::And,
            left: a,
            right: b,
        });
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 2,
            local_count: 2,
            body: vec![Stmt::Expression(and), Stmt::Return(None)],
            source_size: 10,
        });
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        assert_eq!(graph.blocks.len(), 1);
    }

    #[test]
    fn test_logical_value_context_builds_phi() {
        let arena = AstArena::new();
        let a = &*arena.alloc(Expr::Local(0));
        let b = &*arena.alloc(Expr::Local(1));
        let or = &*arena.alloc(Expr::Logical {
            op: LogicalOp::Or,
            left: a,
            right: b,
        });
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 2,
            local_count: 2,
            body: vec![Stmt::Return(Some(or))],
            source_size: 10,
        });
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        assert!(graph.blocks.iter().any(|bl| !bl.phis.is_empty()));
    }

    #[test]
    fn test_simulate_follows_store() {
        let arena = AstArena::new();
        let obj = &*arena.alloc(Expr::Local(0));
        let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
        let store = &*arena.alloc(Expr::PropertyStore {
            object: obj,
            name: "x",
            value: one,
        });
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 1,
            local_count: 1,
            body: vec![Stmt::Expression(store), Stmt::Return(None)],
            source_size: 10,
        });
        // verify() inside build_graph enforces the simulate invariant.
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        let ops: Vec<&'static str> = graph.blocks[graph.entry.index()]
            .instructions
            .iter()
            .map(|&id| graph.value(id).op.mnemonic())
            .collect();
        let store_pos = ops.iter().position(|o| *o == "store-named-generic").unwrap();
        assert_eq!(ops[store_pos + 1], "simulate");
    }

    #[test]
    fn test_try_catch_bails_out() {
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "f".to_string(),
            param_count: 0,
            local_count: 0,
            body: vec![Stmt::TryCatch {
                body: Vec::new(),
                handler: Vec::new(),
            }],
            source_size: 10,
        });
        let err = build_graph(&program, 0, &simple_config()).unwrap_err();
        assert!(matches!(err, Error::Bailout { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_deep_nesting_overflows() {
        let arena = AstArena::new();
        let mut expr: &Expr<'_> = arena.alloc(Expr::Literal(Literal::Smi(1)));
        for _ in 0..1000 {
            let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
            expr = arena.alloc(Expr::Binary {
                op: BinOp::Add,
                left: expr,
                right: one,
            });
        }
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "deep".to_string(),
            param_count: 0,
            local_count: 0,
            body: vec![Stmt::Return(Some(expr))],
            source_size: 4000,
        });
        let err = build_graph(&program, 0, &simple_config()).unwrap_err();
        assert!(matches!(err, Error::StackOverflow { .. }));
    }

    /// Build a program with a caller invoking `callee_size`-weighted callee.
    fn call_program<'a>(arena: &'a AstArena<'a>, source_size: usize) -> Program<'a> {
        let mut program = Program::new();
        let x = &*arena.alloc(Expr::Local(0));
        let one = &*arena.alloc(Expr::Literal(Literal::Smi(1)));
        let add = &*arena.alloc(Expr::Binary {
            op: BinOp::Add,
            left: x,
            right: one,
        });
        let callee = program.add_function(FunctionDecl {
            name: "inc".to_string(),
            param_count: 1,
            local_count: 1,
            body: vec![Stmt::Return(Some(add))],
            source_size,
        });
        let arg = &*arena.alloc(Expr::Literal(Literal::Smi(41)));
        let call = &*arena.alloc(Expr::Call {
            target: CallTarget::Known(callee),
            receiver: None,
            name: "inc",
            args: vec![arg],
        });
        program.add_function(FunctionDecl {
            name: "caller".to_string(),
            param_count: 0,
            local_count: 0,
            body: vec![Stmt::Return(Some(call))],
            source_size: 10,
        });
        program
    }

    #[test]
    fn test_small_call_is_inlined() {
        let arena = AstArena::new();
        let program = call_program(&arena, 10);
        let graph = build_graph(&program, 1, &simple_config()).unwrap();
        let all_ops: Vec<&'static str> = graph
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|&id| graph.value(id).op.mnemonic())
            .collect();
        assert!(all_ops.contains(&"enter-inlined"));
        assert!(all_ops.contains(&"leave-inlined"));
        assert!(!all_ops.contains(&"call-known"));
    }

    #[test]
    fn test_oversized_call_is_not_inlined() {
        let arena = AstArena::new();
        let program = call_program(&arena, 100_000);
        let graph = build_graph(&program, 1, &simple_config()).unwrap();
        let all_ops: Vec<&'static str> = graph
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|&id| graph.value(id).op.mnemonic())
            .collect();
        assert!(all_ops.contains(&"call-known"));
        assert!(!all_ops.contains(&"enter-inlined"));
    }

    #[test]
    fn test_recursive_call_is_not_inlined() {
        let arena = AstArena::new();
        let call = &*arena.alloc(Expr::Call {
            target: CallTarget::Known(0),
            receiver: None,
            name: "loop",
            args: vec![],
        });
        let mut program = Program::new();
        program.add_function(FunctionDecl {
            name: "loop".to_string(),
            param_count: 0,
            local_count: 0,
            body: vec![Stmt::Return(Some(call))],
            source_size: 10,
        });
        let graph = build_graph(&program, 0, &simple_config()).unwrap();
        let all_ops: Vec<&'static str> = graph
            .blocks
            .iter()
            .flat_map(|b| b.instructions.iter())
            .map(|&id| graph.value(id).op.mnemonic())
            .collect();
        assert!(all_ops.contains(&"call-known"));
    }
}
