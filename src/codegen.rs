use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::analyzer::{Analysis, refcounted};
use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionBody, FunctionDecl, Program, Stmt, StmtKind, UnaryOp,
};
use crate::builtins::BuiltinFunction;
use crate::runtime::RuntimeFn;
use crate::target::TargetSpec;
use crate::types::Type;

/// Internal inconsistencies between the checked AST and the emitter. These
/// indicate a compiler bug, not a user error (driver exit code 2).
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("internal codegen assertion: {0}")]
    Internal(String),
}

type Result<T, E = CodegenError> = std::result::Result<T, E>;

fn internal<T>(message: impl Into<String>) -> Result<T> {
    Err(CodegenError::Internal(message.into()))
}

#[derive(Debug, Clone)]
struct VarSlot {
    offset: i64,
    ty: Type,
}

#[derive(Debug, Clone)]
struct LoopLabels {
    continue_label: String,
    break_label: String,
}

/// AST-directed x86-64 emitter.
///
/// Expressions evaluate into `%rax` (float values travel as raw bits and move
/// through `%xmm0`/`%xmm1` at operation sites). Binary operators push the
/// left operand, evaluate the right, and combine through the caller-save
/// scratch `%rcx`. All mutable emission state lives on this value so the
/// pipeline can be re-run in one process.
pub struct Generator<'a> {
    target: &'a TargetSpec,
    analysis: &'a Analysis,
    text: String,
    string_values: Vec<String>,
    string_labels: HashMap<String, usize>,
    externs: BTreeSet<String>,
    next_label: usize,
    global_types: HashMap<String, Type>,

    /// Whether the user's `main` is itself the program entry symbol.
    promoted_main: bool,

    // Per-function state
    vars: HashMap<String, VarSlot>,
    loop_stack: Vec<LoopLabels>,
    hidden_cursor: i64,
    epilogue: String,
    /// Bytes pushed beyond the aligned frame, for call-site realignment.
    stack_depth: i64,
}

impl<'a> Generator<'a> {
    pub fn new(target: &'a TargetSpec, analysis: &'a Analysis) -> Self {
        let global_types = analysis.globals.iter().cloned().collect();
        Self {
            target,
            analysis,
            text: String::new(),
            string_values: Vec::new(),
            string_labels: HashMap::new(),
            externs: BTreeSet::new(),
            next_label: 0,
            global_types,
            promoted_main: false,
            vars: HashMap::new(),
            loop_stack: Vec::new(),
            hidden_cursor: 0,
            epilogue: String::new(),
            stack_depth: 0,
        }
    }

    pub fn generate(mut self, program: &Program) -> Result<String> {
        let top_level: Vec<&Stmt> = program
            .statements
            .iter()
            .filter(|stmt| !matches!(stmt.kind, StmtKind::Function(_)))
            .collect();
        let has_main = self.analysis.functions.contains_key("main");
        // The user's main is the program entry only when nothing runs before
        // it; otherwise a synthesized entry executes the top-level statements
        // (which conventionally end in a `main()` call).
        let promote_main = has_main && top_level.is_empty();
        self.promoted_main = promote_main;

        if !promote_main {
            self.g_entry(&top_level)?;
        }

        for stmt in &program.statements {
            if let StmtKind::Function(func) = &stmt.kind {
                self.g_function(func, promote_main && func.name == "main")?;
            }
        }

        Ok(self.render())
    }

    /// Synthesized entry point running the top-level statements.
    fn g_entry(&mut self, statements: &[&Stmt]) -> Result<()> {
        let entry = self.target.symbol("main");
        self.raw(format!("{}", self.target.global_directive(&entry)));
        self.label(&entry);

        self.vars.clear();
        self.loop_stack.clear();
        self.stack_depth = 0;
        self.epilogue = self.new_label("epilogue");

        let hidden = statements
            .iter()
            .map(|stmt| count_hidden_stmt(stmt, self.target))
            .sum::<usize>();
        self.hidden_cursor = 0;
        let frame = align16((hidden as i64) * 8);

        self.ins("pushq %rbp");
        self.ins("movq %rsp, %rbp");
        if frame > 0 {
            self.ins(format!("subq ${frame}, %rsp"));
        }

        for stmt in statements {
            self.g_stmt(stmt)?;
        }

        let epilogue = self.epilogue.clone();
        self.label(&epilogue);
        self.ins("movq $0, %rax");
        self.ins("movq %rbp, %rsp");
        self.ins("popq %rbp");
        self.ins("ret");
        self.blank();
        Ok(())
    }

    fn g_function(&mut self, func: &FunctionDecl, promoted_entry: bool) -> Result<()> {
        let Some(info) = self.analysis.functions.get(&func.name) else {
            return internal(format!("no analysis for function '{}'", func.name));
        };
        let info = info.clone();

        let label = if promoted_entry {
            let entry = self.target.symbol("main");
            self.raw(format!("{}", self.target.global_directive(&entry)));
            entry
        } else {
            function_label(&func.name)
        };
        self.label(&label);

        self.vars.clear();
        self.loop_stack.clear();
        self.stack_depth = 0;
        self.epilogue = self.new_label("epilogue");

        // Frame layout: spilled parameters, then locals, then hidden slots
        // for loop and tuple bookkeeping, 8 bytes each.
        let regs = self.target.arg_registers;
        let mut next_offset = 0i64;
        let mut reg_param_count = 0usize;
        for (index, (name, ty)) in info.params.iter().enumerate() {
            if index < regs.len() {
                next_offset += 8;
                reg_param_count += 1;
                self.vars.insert(
                    name.clone(),
                    VarSlot {
                        offset: -next_offset,
                        ty: ty.clone(),
                    },
                );
            } else {
                // Stack parameters stay in the caller's frame, above the
                // return address and any shadow space.
                let above = 16 + self.target.shadow_space as i64
                    + 8 * (index - regs.len()) as i64;
                self.vars.insert(
                    name.clone(),
                    VarSlot {
                        offset: above,
                        ty: ty.clone(),
                    },
                );
            }
        }
        for (name, ty) in &info.locals {
            next_offset += 8;
            self.vars.insert(
                name.clone(),
                VarSlot {
                    offset: -next_offset,
                    ty: ty.clone(),
                },
            );
        }

        let hidden = match &func.body {
            FunctionBody::Block(body) => body
                .iter()
                .map(|stmt| count_hidden_stmt(stmt, self.target))
                .sum::<usize>(),
            FunctionBody::Expr(expr) => count_hidden_expr(expr, self.target),
        };
        self.hidden_cursor = next_offset;
        let frame = align16(next_offset + (hidden as i64) * 8);

        self.ins("pushq %rbp");
        self.ins("movq %rsp, %rbp");
        if frame > 0 {
            self.ins(format!("subq ${frame}, %rsp"));
        }

        for (index, (name, _)) in info.params.iter().take(reg_param_count).enumerate() {
            let offset = self.slot_offset(name)?;
            self.ins(format!("movq {}, {}(%rbp)", regs[index], offset));
        }
        // Refcounted locals start as null so releases on early paths are
        // no-ops.
        for (name, ty) in &info.locals {
            if refcounted(ty) {
                let offset = self.slot_offset(name)?;
                self.ins(format!("movq $0, {offset}(%rbp)"));
            }
        }

        match &func.body {
            FunctionBody::Block(body) => {
                for stmt in body {
                    self.g_stmt(stmt)?;
                }
            }
            FunctionBody::Expr(expr) => {
                self.g_expr(expr)?;
            }
        }

        let epilogue = self.epilogue.clone();
        self.label(&epilogue);
        let releases: Vec<(String, Type)> = info
            .locals
            .iter()
            .filter(|(_, ty)| refcounted(ty))
            .cloned()
            .collect();
        if !releases.is_empty() {
            self.push("%rax");
            for (name, ty) in &releases {
                let offset = self.slot_offset(name)?;
                self.ins(format!("movq {}(%rbp), {}", offset, self.areg(0)));
                self.call_runtime(release_fn(ty)?);
            }
            self.pop("%rax");
        }
        if promoted_entry && info.return_type == Type::Void {
            self.ins("movq $0, %rax");
        }
        self.ins("movq %rbp, %rsp");
        self.ins("popq %rbp");
        self.ins("ret");
        self.blank();
        Ok(())
    }

    fn g_stmt(&mut self, stmt: &Stmt) -> Result<()> {
        match &stmt.kind {
            StmtKind::Function(_) => Ok(()),
            StmtKind::Struct { .. }
            | StmtKind::Enum { .. }
            | StmtKind::Global(_)
            | StmtKind::Local(_)
            | StmtKind::Pass => Ok(()),
            StmtKind::VarDecl { name, init, .. } => {
                self.g_expr(init)?;
                self.store_variable(name, &init.ty, is_fresh(init))
            }
            StmtKind::IndexAssign {
                object,
                index,
                value,
            } => {
                let setter = match object.ty {
                    Type::List => RuntimeFn::ListSet,
                    Type::Dict => RuntimeFn::DictSet,
                    ref other => {
                        return internal(format!("index assignment into {other}"));
                    }
                };
                self.g_expr(object)?;
                self.push("%rax");
                self.g_expr(index)?;
                self.push("%rax");
                self.g_expr(value)?;
                self.ins(format!("movq %rax, {}", self.areg(2)));
                self.pop(self.areg(1));
                self.pop(self.areg(0));
                self.call_runtime(setter);
                Ok(())
            }
            StmtKind::TupleAssign { targets, values } => self.g_tuple_assign(targets, values),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                let else_label = self.new_label("else");
                let end_label = self.new_label("end_if");
                self.g_expr(condition)?;
                self.ins("testq %rax, %rax");
                self.ins(format!("jz {else_label}"));
                self.g_stmt(then_branch)?;
                self.ins(format!("jmp {end_label}"));
                self.label(&else_label);
                if let Some(else_branch) = else_branch {
                    self.g_stmt(else_branch)?;
                }
                self.label(&end_label);
                Ok(())
            }
            StmtKind::While { condition, body } => {
                let cond_label = self.new_label("loop");
                let end_label = self.new_label("end_loop");
                self.label(&cond_label);
                self.g_expr(condition)?;
                self.ins("testq %rax, %rax");
                self.ins(format!("jz {end_label}"));
                self.loop_stack.push(LoopLabels {
                    continue_label: cond_label.clone(),
                    break_label: end_label.clone(),
                });
                self.g_stmt(body)?;
                self.loop_stack.pop();
                self.ins(format!("jmp {cond_label}"));
                self.label(&end_label);
                Ok(())
            }
            StmtKind::ForIn {
                variable,
                iterable,
                body,
            } => self.g_for_in(variable, iterable, body),
            StmtKind::Return(value) => {
                match value {
                    Some(value) => self.g_expr(value)?,
                    None => self.ins("movq $0, %rax"),
                }
                let epilogue = self.epilogue.clone();
                self.ins(format!("jmp {epilogue}"));
                Ok(())
            }
            StmtKind::Break => match self.loop_stack.last() {
                Some(labels) => {
                    let label = labels.break_label.clone();
                    self.ins(format!("jmp {label}"));
                    Ok(())
                }
                None => internal("break outside loop reached codegen"),
            },
            StmtKind::Continue => match self.loop_stack.last() {
                Some(labels) => {
                    let label = labels.continue_label.clone();
                    self.ins(format!("jmp {label}"));
                    Ok(())
                }
                None => internal("continue outside loop reached codegen"),
            },
            StmtKind::Block(statements) => {
                for inner in statements {
                    self.g_stmt(inner)?;
                }
                Ok(())
            }
            StmtKind::Expression(expr) => {
                self.g_expr(expr)?;
                // A discarded fresh heap value would otherwise leak its
                // initial reference.
                if refcounted(&expr.ty) && is_fresh(expr) {
                    self.ins(format!("movq %rax, {}", self.areg(0)));
                    self.call_runtime(release_fn(&expr.ty)?);
                }
                Ok(())
            }
        }
    }

    /// All right-hand sides evaluate into temporaries before any target is
    /// written, so `a, b = b, a` swaps correctly.
    fn g_tuple_assign(&mut self, targets: &[Expr], values: &[Expr]) -> Result<()> {
        let temps = self.alloc_hidden(values.len());
        for (value, offset) in values.iter().zip(&temps) {
            self.g_expr(value)?;
            self.ins(format!("movq %rax, {offset}(%rbp)"));
        }
        for ((target, value), offset) in targets.iter().zip(values).zip(&temps) {
            match &target.kind {
                ExprKind::Identifier(name) => {
                    self.ins(format!("movq {offset}(%rbp), %rax"));
                    self.store_variable(name, &value.ty, is_fresh(value))?;
                }
                ExprKind::Index { object, index } => {
                    let setter = match object.ty {
                        Type::List => RuntimeFn::ListSet,
                        Type::Dict => RuntimeFn::DictSet,
                        ref other => {
                            return internal(format!("index assignment into {other}"));
                        }
                    };
                    self.g_expr(object)?;
                    self.push("%rax");
                    self.g_expr(index)?;
                    self.ins(format!("movq %rax, {}", self.areg(1)));
                    self.pop(self.areg(0));
                    self.ins(format!("movq {}(%rbp), {}", offset, self.areg(2)));
                    self.call_runtime(setter);
                }
                _ => return internal("tuple target is neither identifier nor index"),
            }
        }
        Ok(())
    }

    fn g_for_in(&mut self, variable: &str, iterable: &Expr, body: &Stmt) -> Result<()> {
        // A literal `range(...)` iterable is materialized into frame slots
        // with a sign-directed loop; other iterables go through the runtime
        // object protocol.
        if let ExprKind::Call { callee, args } = &iterable.kind {
            if BuiltinFunction::from_name(callee) == Some(BuiltinFunction::Range) {
                return self.g_for_in_range_literal(variable, args, body);
            }
        }
        match iterable.ty {
            Type::Range => self.g_for_in_runtime(
                variable,
                iterable,
                body,
                RuntimeFn::RangeLen,
                RuntimeFn::RangeGet,
                RuntimeFn::RangeRetain,
                RuntimeFn::RangeRelease,
            ),
            Type::List => self.g_for_in_runtime(
                variable,
                iterable,
                body,
                RuntimeFn::ListLen,
                RuntimeFn::ListGet,
                RuntimeFn::ListRetain,
                RuntimeFn::ListRelease,
            ),
            ref other => internal(format!("for-in over {other}")),
        }
    }

    /// `for v in range(a, b, s)` without constructing a range object: start,
    /// stop and step live in the frame and the loop direction follows the
    /// step's sign at run time.
    fn g_for_in_range_literal(
        &mut self,
        variable: &str,
        args: &[Expr],
        body: &Stmt,
    ) -> Result<()> {
        let slots = self.alloc_hidden(3);
        let (start, stop, step) = (slots[0], slots[1], slots[2]);

        match args.len() {
            1 => {
                self.ins(format!("movq $0, {start}(%rbp)"));
                self.g_expr(&args[0])?;
                self.ins(format!("movq %rax, {stop}(%rbp)"));
                self.ins(format!("movq $1, {step}(%rbp)"));
            }
            2 => {
                self.g_expr(&args[0])?;
                self.ins(format!("movq %rax, {start}(%rbp)"));
                self.g_expr(&args[1])?;
                self.ins(format!("movq %rax, {stop}(%rbp)"));
                self.ins(format!("movq $1, {step}(%rbp)"));
            }
            3 => {
                self.g_expr(&args[0])?;
                self.ins(format!("movq %rax, {start}(%rbp)"));
                self.g_expr(&args[1])?;
                self.ins(format!("movq %rax, {stop}(%rbp)"));
                self.g_expr(&args[2])?;
                self.ins(format!("movq %rax, {step}(%rbp)"));
                // A zero step is a runtime abort; range_new carries the
                // diagnostic.
                let ok = self.new_label("step_ok");
                self.ins("testq %rax, %rax");
                self.ins(format!("jnz {ok}"));
                self.ins(format!("movq {}(%rbp), {}", start, self.areg(0)));
                self.ins(format!("movq {}(%rbp), {}", stop, self.areg(1)));
                self.ins(format!("movq $0, {}", self.areg(2)));
                self.call_runtime(RuntimeFn::RangeNew);
                self.label(&ok);
            }
            n => return internal(format!("range literal with {n} arguments")),
        }

        self.ins(format!("movq {start}(%rbp), %rax"));
        self.store_variable(variable, &Type::Int64, false)?;

        let cond = self.new_label("for");
        let negative = self.new_label("for_down");
        let body_label = self.new_label("for_body");
        let step_label = self.new_label("for_step");
        let end = self.new_label("end_for");

        self.label(&cond);
        self.ins(format!("movq {step}(%rbp), %rax"));
        self.ins("testq %rax, %rax");
        self.ins(format!("js {negative}"));
        self.load_variable(variable)?;
        self.ins(format!("cmpq {stop}(%rbp), %rax"));
        self.ins(format!("jge {end}"));
        self.ins(format!("jmp {body_label}"));
        self.label(&negative);
        self.load_variable(variable)?;
        self.ins(format!("cmpq {stop}(%rbp), %rax"));
        self.ins(format!("jle {end}"));
        self.label(&body_label);

        self.loop_stack.push(LoopLabels {
            continue_label: step_label.clone(),
            break_label: end.clone(),
        });
        self.g_stmt(body)?;
        self.loop_stack.pop();

        self.label(&step_label);
        self.load_variable(variable)?;
        self.ins(format!("addq {step}(%rbp), %rax"));
        self.store_variable(variable, &Type::Int64, false)?;
        self.ins(format!("jmp {cond}"));
        self.label(&end);
        Ok(())
    }

    /// Index-driven loop over a runtime range or list object.
    fn g_for_in_runtime(
        &mut self,
        variable: &str,
        iterable: &Expr,
        body: &Stmt,
        len_fn: RuntimeFn,
        get_fn: RuntimeFn,
        retain: RuntimeFn,
        release: RuntimeFn,
    ) -> Result<()> {
        let slots = self.alloc_hidden(3);
        let (obj, idx, len) = (slots[0], slots[1], slots[2]);

        self.g_expr(iterable)?;
        self.ins(format!("movq %rax, {obj}(%rbp)"));
        // The loop holds its own reference for its whole duration: a body
        // that rebinds the iterated variable must not free the object out
        // from under the index walk.
        self.ins(format!("movq %rax, {}", self.areg(0)));
        self.call_runtime(retain);
        self.ins(format!("movq {}(%rbp), {}", obj, self.areg(0)));
        self.call_runtime(len_fn);
        self.ins(format!("movq %rax, {len}(%rbp)"));
        self.ins(format!("movq $0, {idx}(%rbp)"));

        let cond = self.new_label("for");
        let step_label = self.new_label("for_step");
        let end = self.new_label("end_for");

        self.label(&cond);
        self.ins(format!("movq {idx}(%rbp), %rax"));
        self.ins(format!("cmpq {len}(%rbp), %rax"));
        self.ins(format!("jge {end}"));
        self.ins(format!("movq {}(%rbp), {}", obj, self.areg(0)));
        self.ins(format!("movq {}(%rbp), {}", idx, self.areg(1)));
        self.call_runtime(get_fn);
        self.store_variable(variable, &Type::Int64, false)?;

        self.loop_stack.push(LoopLabels {
            continue_label: step_label.clone(),
            break_label: end.clone(),
        });
        self.g_stmt(body)?;
        self.loop_stack.pop();

        self.label(&step_label);
        self.ins(format!("incq {idx}(%rbp)"));
        self.ins(format!("jmp {cond}"));
        self.label(&end);

        // Drop the loop's reference; a freshly constructed iterable also
        // surrenders its initial reference here, since nothing else owns it.
        self.ins(format!("movq {}(%rbp), {}", obj, self.areg(0)));
        self.call_runtime(release);
        if is_fresh(iterable) {
            self.ins(format!("movq {}(%rbp), {}", obj, self.areg(0)));
            self.call_runtime(release);
        }
        Ok(())
    }

    fn g_expr(&mut self, expr: &Expr) -> Result<()> {
        match &expr.kind {
            ExprKind::Int(value) => {
                self.mov_immediate(*value);
                Ok(())
            }
            ExprKind::Float(value) => {
                let bits = value.to_bits();
                self.ins(format!("movabsq ${bits}, %rax"));
                Ok(())
            }
            ExprKind::Bool(value) => {
                self.ins(format!("movq ${}, %rax", i64::from(*value)));
                Ok(())
            }
            ExprKind::Str(value) => {
                let label = self.intern_string(value);
                let load = self.target.load_address(&label, "%rax");
                self.ins(load);
                Ok(())
            }
            ExprKind::Identifier(name) => self.load_variable(name),
            ExprKind::Binary { left, op, right } => self.g_binary(left, *op, right),
            ExprKind::Unary { op, operand } => self.g_unary(*op, operand),
            ExprKind::Call { callee, args } => self.g_call(callee, args),
            ExprKind::Index { object, index } => {
                let getter = match object.ty {
                    Type::List => RuntimeFn::ListGet,
                    Type::Dict => RuntimeFn::DictGet,
                    Type::Range => RuntimeFn::RangeGet,
                    ref other => return internal(format!("indexing into {other}")),
                };
                self.g_expr(object)?;
                self.push("%rax");
                self.g_expr(index)?;
                self.ins(format!("movq %rax, {}", self.areg(1)));
                self.pop(self.areg(0));
                self.call_runtime(getter);
                Ok(())
            }
            ExprKind::List(elements) => self.g_list_literal(elements),
            ExprKind::Dict(pairs) => self.g_dict_literal(pairs),
            ExprKind::Tuple(_) => internal("tuple expression reached codegen"),
        }
    }

    fn g_binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<()> {
        let float_operands = left.ty.is_float() || right.ty.is_float();
        let string_operands = left.ty == Type::String && right.ty == Type::String;

        if op.is_logical() {
            return self.g_logical(left, op, right);
        }
        if string_operands {
            return self.g_string_binary(left, op, right);
        }
        if float_operands && op != BinaryOp::Power {
            return self.g_float_binary(left, op, right);
        }
        if op == BinaryOp::Power {
            return self.g_power(left, right);
        }

        self.g_expr(left)?;
        self.push("%rax");
        self.g_expr(right)?;
        self.ins("movq %rax, %rcx");
        self.pop("%rax");
        match op {
            BinaryOp::Add => self.ins("addq %rcx, %rax"),
            BinaryOp::Sub => self.ins("subq %rcx, %rax"),
            BinaryOp::Mul => self.ins("imulq %rcx, %rax"),
            BinaryOp::Div | BinaryOp::FloorDiv => {
                self.ins("cqto");
                self.ins("idivq %rcx");
            }
            BinaryOp::Mod => {
                self.ins("cqto");
                self.ins("idivq %rcx");
                self.ins("movq %rdx, %rax");
            }
            BinaryOp::Eq
            | BinaryOp::NotEq
            | BinaryOp::Less
            | BinaryOp::LessEq
            | BinaryOp::Greater
            | BinaryOp::GreaterEq => {
                self.ins("cmpq %rcx, %rax");
                self.ins(format!("{} %al", int_set_instruction(op)));
                self.ins("movzbq %al, %rax");
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::Power => {
                return internal("operator dispatched to wrong emitter");
            }
        }
        Ok(())
    }

    /// Logical operands normalize to 0/1 before combining, so integer truth
    /// values behave (`2 and 1` is true).
    fn g_logical(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<()> {
        self.g_expr(left)?;
        self.normalize_bool();
        self.push("%rax");
        self.g_expr(right)?;
        self.normalize_bool();
        self.ins("movq %rax, %rcx");
        self.pop("%rax");
        match op {
            BinaryOp::And => self.ins("andq %rcx, %rax"),
            BinaryOp::Or => self.ins("orq %rcx, %rax"),
            _ => return internal("non-logical operator in logical emitter"),
        }
        Ok(())
    }

    fn g_string_binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<()> {
        self.g_expr(left)?;
        self.push("%rax");
        self.g_expr(right)?;
        self.ins("movq %rax, %rcx");
        self.pop("%rax");
        match op {
            BinaryOp::Add => {
                // Parts array on the stack for string_concat_parts.
                self.ins("subq $16, %rsp");
                self.stack_depth += 16;
                self.ins("movq %rax, (%rsp)");
                self.ins("movq %rcx, 8(%rsp)");
                self.ins(format!("movq %rsp, {}", self.areg(0)));
                self.ins(format!("movq $2, {}", self.areg(1)));
                self.call_runtime(RuntimeFn::StringConcatParts);
                self.ins("addq $16, %rsp");
                self.stack_depth -= 16;
            }
            op if op.is_comparison() => {
                // The %rcx source moves first; on Win64 %rcx is also the
                // first argument register.
                self.ins(format!("movq %rcx, {}", self.areg(1)));
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_libc("strcmp");
                self.ins("cmpl $0, %eax");
                self.ins(format!("{} %al", int_set_instruction(op)));
                self.ins("movzbq %al, %rax");
            }
            other => return internal(format!("string operator {other}")),
        }
        Ok(())
    }

    fn g_float_binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<()> {
        self.g_expr(left)?;
        if left.ty.is_integer() {
            self.int_bits_to_float();
        }
        self.push("%rax");
        self.g_expr(right)?;
        if right.ty.is_integer() {
            self.int_bits_to_float();
        }
        self.ins("movq %rax, %xmm1");
        self.pop("%rax");
        self.ins("movq %rax, %xmm0");
        match op {
            BinaryOp::Add => self.ins("addsd %xmm1, %xmm0"),
            BinaryOp::Sub => self.ins("subsd %xmm1, %xmm0"),
            BinaryOp::Mul => self.ins("mulsd %xmm1, %xmm0"),
            BinaryOp::Div => self.ins("divsd %xmm1, %xmm0"),
            op if op.is_comparison() => {
                self.ins("ucomisd %xmm1, %xmm0");
                self.ins(format!("{} %al", float_set_instruction(op)));
                self.ins("movzbq %al, %rax");
                return Ok(());
            }
            other => return internal(format!("float operator {other}")),
        }
        self.ins("movq %xmm0, %rax");
        Ok(())
    }

    /// Exponentiation by a multiply loop; a non-positive exponent yields 1.
    fn g_power(&mut self, left: &Expr, right: &Expr) -> Result<()> {
        let float_base = left.ty.is_float();
        let loop_label = self.new_label("pow");
        let done_label = self.new_label("pow_done");

        self.g_expr(left)?;
        self.push("%rax");
        self.g_expr(right)?;
        self.ins("movq %rax, %rcx");
        self.pop("%rax");
        if float_base {
            self.ins("movq %rax, %xmm1");
            self.ins("movabsq $4607182418800017408, %rax"); // 1.0
            self.ins("movq %rax, %xmm0");
            self.ins("testq %rcx, %rcx");
            self.ins(format!("jle {done_label}"));
            self.label(&loop_label);
            self.ins("mulsd %xmm1, %xmm0");
            self.ins("decq %rcx");
            self.ins(format!("jnz {loop_label}"));
            self.label(&done_label);
            self.ins("movq %xmm0, %rax");
        } else {
            self.ins("movq %rax, %rdx");
            self.ins("movq $1, %rax");
            self.ins("testq %rcx, %rcx");
            self.ins(format!("jle {done_label}"));
            self.label(&loop_label);
            self.ins("imulq %rdx, %rax");
            self.ins("decq %rcx");
            self.ins(format!("jnz {loop_label}"));
            self.label(&done_label);
        }
        Ok(())
    }

    fn g_unary(&mut self, op: UnaryOp, operand: &Expr) -> Result<()> {
        self.g_expr(operand)?;
        match op {
            UnaryOp::Pos => {}
            UnaryOp::Neg => {
                if operand.ty.is_float() {
                    self.ins("movq %rax, %xmm1");
                    self.ins("xorpd %xmm0, %xmm0");
                    self.ins("subsd %xmm1, %xmm0");
                    self.ins("movq %xmm0, %rax");
                } else {
                    self.ins("negq %rax");
                }
            }
            UnaryOp::Not => {
                self.ins("testq %rax, %rax");
                self.ins("sete %al");
                self.ins("movzbq %al, %rax");
            }
        }
        Ok(())
    }

    fn g_call(&mut self, callee: &str, args: &[Expr]) -> Result<()> {
        if self.analysis.functions.contains_key(callee) {
            return self.g_user_call(callee, args);
        }
        if let Some(builtin) = BuiltinFunction::from_name(callee) {
            return self.g_builtin_call(builtin, args);
        }
        internal(format!("call to unresolved function '{callee}'"))
    }

    /// Arguments evaluate left-to-right; register args stage through the
    /// stack, overflow args go to frame temporaries and are pushed
    /// right-to-left.
    fn g_user_call(&mut self, callee: &str, args: &[Expr]) -> Result<()> {
        let label = if callee == "main" && self.promoted_main {
            self.target.symbol("main")
        } else {
            function_label(callee)
        };

        let regs = self.target.arg_registers;
        if args.len() <= regs.len() {
            for arg in args {
                self.g_expr(arg)?;
                self.push("%rax");
            }
            for index in (0..args.len()).rev() {
                self.pop(regs[index]);
            }
            self.call_label(&label);
            return Ok(());
        }

        let temps = self.alloc_hidden(args.len());
        for (arg, offset) in args.iter().zip(&temps) {
            self.g_expr(arg)?;
            self.ins(format!("movq %rax, {offset}(%rbp)"));
        }
        let stack_args = args.len() - regs.len();
        let shadow = self.target.shadow_space as i64;
        let pushed = (stack_args as i64) * 8;
        let pad = (16 - (self.stack_depth + pushed + shadow) % 16) % 16;
        if pad > 0 {
            self.ins(format!("subq ${pad}, %rsp"));
            self.stack_depth += pad;
        }
        for offset in temps[regs.len()..].iter().rev() {
            self.ins(format!("pushq {offset}(%rbp)"));
            self.stack_depth += 8;
        }
        for (index, offset) in temps.iter().take(regs.len()).enumerate() {
            self.ins(format!("movq {}(%rbp), {}", offset, regs[index]));
        }
        if shadow > 0 {
            self.ins(format!("subq ${shadow}, %rsp"));
            self.stack_depth += shadow;
        }
        self.ins(format!("call {label}"));
        let cleanup = pad + pushed + shadow;
        self.ins(format!("addq ${cleanup}, %rsp"));
        self.stack_depth -= cleanup;
        Ok(())
    }

    fn g_builtin_call(&mut self, builtin: BuiltinFunction, args: &[Expr]) -> Result<()> {
        use BuiltinFunction::*;
        match builtin {
            Print => self.g_print(&args[0]),
            Len => {
                self.g_expr(&args[0])?;
                self.ins(format!("movq %rax, {}", self.areg(0)));
                match args[0].ty {
                    Type::List => self.call_runtime(RuntimeFn::ListLen),
                    Type::Dict => self.call_runtime(RuntimeFn::DictLen),
                    Type::Range => self.call_runtime(RuntimeFn::RangeLen),
                    Type::String => self.call_libc("strlen"),
                    ref other => return internal(format!("len of {other}")),
                }
                Ok(())
            }
            Range => {
                let constructor = match args.len() {
                    1 => RuntimeFn::RangeNewStop,
                    2 => RuntimeFn::RangeNewStartStop,
                    3 => RuntimeFn::RangeNew,
                    n => return internal(format!("range with {n} arguments")),
                };
                self.g_runtime_call(constructor, args)
            }
            Str => {
                self.g_expr(&args[0])?;
                match args[0].ty {
                    Type::Int32 | Type::Int64 => {
                        self.ins(format!("movq %rax, {}", self.areg(0)));
                        self.call_runtime(RuntimeFn::IntToString);
                    }
                    Type::Float32 | Type::Float64 => {
                        self.ins("movq %rax, %xmm0");
                        self.call_runtime(RuntimeFn::FloatToString);
                    }
                    Type::Bool => {
                        self.ins(format!("movq %rax, {}", self.areg(0)));
                        self.call_runtime(RuntimeFn::BoolToString);
                    }
                    Type::String => {
                        self.ins(format!("movq %rax, {}", self.areg(0)));
                        self.call_runtime(RuntimeFn::StringToString);
                    }
                    ref other => return internal(format!("str of {other}")),
                }
                Ok(())
            }
            Int => {
                self.g_expr(&args[0])?;
                match args[0].ty {
                    Type::Int32 | Type::Int64 | Type::Bool => {}
                    Type::Float32 | Type::Float64 => {
                        self.ins("movq %rax, %xmm0");
                        self.ins("cvttsd2siq %xmm0, %rax");
                    }
                    Type::String => {
                        self.ins(format!("movq %rax, {}", self.areg(0)));
                        self.call_runtime(RuntimeFn::StringToInt);
                    }
                    ref other => return internal(format!("int of {other}")),
                }
                Ok(())
            }
            Float => {
                self.g_expr(&args[0])?;
                match args[0].ty {
                    Type::Float32 | Type::Float64 => {}
                    Type::Int32 | Type::Int64 | Type::Bool => self.int_bits_to_float(),
                    Type::String => {
                        self.ins(format!("movq %rax, {}", self.areg(0)));
                        self.call_runtime(RuntimeFn::StringToFloat);
                        self.ins("movq %xmm0, %rax");
                    }
                    ref other => return internal(format!("float of {other}")),
                }
                Ok(())
            }
            Bool => {
                self.g_expr(&args[0])?;
                match args[0].ty {
                    Type::Bool => {}
                    Type::Int32 | Type::Int64 => self.normalize_bool(),
                    Type::Float32 | Type::Float64 => {
                        self.ins("movq %rax, %xmm0");
                        self.ins("xorpd %xmm1, %xmm1");
                        self.ins("ucomisd %xmm1, %xmm0");
                        self.ins("setne %al");
                        self.ins("movzbq %al, %rax");
                    }
                    ref other => return internal(format!("bool of {other}")),
                }
                Ok(())
            }
            Input => {
                if args.is_empty() {
                    self.call_runtime(RuntimeFn::Input);
                } else {
                    self.g_expr(&args[0])?;
                    self.ins(format!("movq %rax, {}", self.areg(0)));
                    self.call_runtime(RuntimeFn::InputPrompt);
                }
                Ok(())
            }
            Append => self.g_runtime_call(RuntimeFn::ListAppend, args),
            Pop => match args.len() {
                1 => self.g_runtime_call(RuntimeFn::ListPop, args),
                2 => self.g_runtime_call(RuntimeFn::DictPop, args),
                _ => self.g_runtime_call(RuntimeFn::DictPopDefault, args),
            },
            Insert => self.g_runtime_call(RuntimeFn::ListInsert, args),
            Extend => self.g_runtime_call(RuntimeFn::ListExtend, args),
            Concat => self.g_runtime_call(RuntimeFn::ListConcat, args),
            Repeat => self.g_runtime_call(RuntimeFn::ListRepeat, args),
            ToList => self.g_runtime_call(RuntimeFn::RangeToList, args),
            Keys => self.g_runtime_call(RuntimeFn::DictKeys, args),
            Values => self.g_runtime_call(RuntimeFn::DictValues, args),
            Items => self.g_runtime_call(RuntimeFn::DictItems, args),
            Contains => self.g_runtime_call(RuntimeFn::DictContains, args),
            Delete => self.g_runtime_call(RuntimeFn::DictDelete, args),
            Clear => self.g_runtime_call(RuntimeFn::DictClear, args),
            Update => self.g_runtime_call(RuntimeFn::DictUpdate, args),
            Get => self.g_runtime_call(RuntimeFn::DictGetDefault, args),
        }
    }

    /// `out` specializes on the static argument type; only erased positions
    /// would need the runtime's pointer-guessing fallback.
    fn g_print(&mut self, arg: &Expr) -> Result<()> {
        self.g_expr(arg)?;
        match arg.ty {
            Type::Int32 | Type::Int64 | Type::Enum(_) => {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(RuntimeFn::PrintInt);
            }
            Type::Float32 | Type::Float64 => {
                self.ins("movq %rax, %xmm0");
                self.call_runtime(RuntimeFn::PrintFloat);
            }
            Type::Bool => {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(RuntimeFn::PrintBool);
            }
            Type::String => {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(RuntimeFn::PrintString);
            }
            Type::List => {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(RuntimeFn::ListPrint);
            }
            _ => {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(RuntimeFn::PrintSmart);
            }
        }
        Ok(())
    }

    /// Generic runtime call with all-integer arguments in ABI registers.
    fn g_runtime_call(&mut self, f: RuntimeFn, args: &[Expr]) -> Result<()> {
        let regs = self.target.arg_registers;
        if args.len() > regs.len() {
            return internal(format!(
                "runtime call {} with {} arguments",
                f.symbol(),
                args.len()
            ));
        }
        for arg in args {
            self.g_expr(arg)?;
            self.push("%rax");
        }
        for index in (0..args.len()).rev() {
            self.pop(regs[index]);
        }
        self.call_runtime(f);
        Ok(())
    }

    /// List literal: elements to a scratch buffer, then one
    /// `list_from_data` call. `%r12` holds the buffer across element
    /// evaluation and is preserved for the caller.
    fn g_list_literal(&mut self, elements: &[Expr]) -> Result<()> {
        if elements.is_empty() {
            self.ins(format!("movq $4, {}", self.areg(0)));
            self.call_runtime(RuntimeFn::ListNew);
            return Ok(());
        }

        self.ins(format!("movq ${}, {}", elements.len() * 8, self.areg(0)));
        self.call_runtime(RuntimeFn::Malloc);
        self.push("%r12");
        self.ins("movq %rax, %r12");
        for (index, element) in elements.iter().enumerate() {
            self.g_expr(element)?;
            self.ins(format!("movq %rax, {}(%r12)", index * 8));
        }
        self.ins(format!("movq %r12, {}", self.areg(0)));
        self.ins(format!("movq ${}, {}", elements.len(), self.areg(1)));
        self.call_runtime(RuntimeFn::ListFromData);
        // list_from_data copies; the scratch buffer is freed immediately.
        self.push("%rax");
        self.ins(format!("movq %r12, {}", self.areg(0)));
        self.call_runtime(RuntimeFn::Free);
        self.pop("%rax");
        self.pop("%r12");
        Ok(())
    }

    fn g_dict_literal(&mut self, pairs: &[(Expr, Expr)]) -> Result<()> {
        let capacity = if pairs.len() > 8 { pairs.len() * 2 } else { 8 };
        self.ins(format!("movq ${}, {}", capacity, self.areg(0)));
        self.call_runtime(RuntimeFn::DictNew);
        if pairs.is_empty() {
            return Ok(());
        }
        self.push("%r12");
        self.ins("movq %rax, %r12");
        for (key, value) in pairs {
            self.g_expr(key)?;
            self.push("%rax");
            self.g_expr(value)?;
            self.ins(format!("movq %rax, {}", self.areg(2)));
            self.pop(self.areg(1));
            self.ins(format!("movq %r12, {}", self.areg(0)));
            self.call_runtime(RuntimeFn::DictSet);
        }
        self.ins("movq %r12, %rax");
        self.pop("%r12");
        Ok(())
    }
}

/// Variable access and the retain/release discipline.
impl Generator<'_> {
    fn load_variable(&mut self, name: &str) -> Result<()> {
        if let Some(slot) = self.vars.get(name) {
            let offset = slot.offset;
            self.ins(format!("movq {offset}(%rbp), %rax"));
            return Ok(());
        }
        if self.global_types.contains_key(name) {
            let reference = self.global_ref(&global_label(name));
            self.ins(format!("movq {reference}, %rax"));
            return Ok(());
        }
        if let Some(value) = self.analysis.enum_constants.get(name) {
            self.mov_immediate(*value);
            return Ok(());
        }
        internal(format!("unknown variable '{name}'"))
    }

    /// Stores `%rax` into the named binding. For refcounted kinds the new
    /// value is retained unless freshly constructed, and the previous
    /// contents are released.
    fn store_variable(&mut self, name: &str, value_ty: &Type, fresh: bool) -> Result<()> {
        enum Place {
            Slot(i64, Type),
            Global(String, Type),
        }
        let place = if let Some(slot) = self.vars.get(name) {
            Place::Slot(slot.offset, slot.ty.clone())
        } else if let Some(ty) = self.global_types.get(name) {
            Place::Global(global_label(name), ty.clone())
        } else {
            return internal(format!("unknown variable '{name}'"));
        };

        let slot_ty = match &place {
            Place::Slot(_, ty) | Place::Global(_, ty) => ty.clone(),
        };

        if refcounted(&slot_ty) && refcounted(value_ty) {
            if !fresh {
                self.ins(format!("movq %rax, {}", self.areg(0)));
                self.call_runtime(retain_fn(value_ty)?);
            }
            self.push("%rax");
            match &place {
                Place::Slot(offset, _) => {
                    self.ins(format!("movq {}(%rbp), {}", offset, self.areg(0)));
                }
                Place::Global(label, _) => {
                    let reference = self.global_ref(label);
                    self.ins(format!("movq {}, {}", reference, self.areg(0)));
                }
            }
            self.call_runtime(release_fn(&slot_ty)?);
            self.pop("%rax");
        }

        match place {
            Place::Slot(offset, _) => self.ins(format!("movq %rax, {offset}(%rbp)")),
            Place::Global(label, _) => {
                let reference = self.global_ref(&label);
                self.ins(format!("movq %rax, {reference}"));
            }
        }
        Ok(())
    }

    fn slot_offset(&self, name: &str) -> Result<i64> {
        match self.vars.get(name) {
            Some(slot) => Ok(slot.offset),
            None => internal(format!("no slot for '{name}'")),
        }
    }
}

/// Emission plumbing.
impl Generator<'_> {
    /// The target's n-th integer argument register.
    fn areg(&self, index: usize) -> &'static str {
        self.target.arg_registers[index]
    }

    fn ins(&mut self, instruction: impl AsRef<str>) {
        self.text.push_str("    ");
        self.text.push_str(instruction.as_ref());
        self.text.push('\n');
    }

    fn raw(&mut self, line: impl AsRef<str>) {
        self.text.push_str(line.as_ref());
        self.text.push('\n');
    }

    fn label(&mut self, label: &str) {
        self.text.push_str(label);
        self.text.push_str(":\n");
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }

    fn new_label(&mut self, prefix: &str) -> String {
        let label = format!(".L{}{}", prefix, self.next_label);
        self.next_label += 1;
        label
    }

    fn push(&mut self, reg: &str) {
        self.ins(format!("pushq {reg}"));
        self.stack_depth += 8;
    }

    fn pop(&mut self, reg: &str) {
        self.ins(format!("popq {reg}"));
        self.stack_depth -= 8;
    }

    fn mov_immediate(&mut self, value: i64) {
        if i32::try_from(value).is_ok() {
            self.ins(format!("movq ${value}, %rax"));
        } else {
            self.ins(format!("movabsq ${value}, %rax"));
        }
    }

    fn normalize_bool(&mut self) {
        self.ins("testq %rax, %rax");
        self.ins("setne %al");
        self.ins("movzbq %al, %rax");
    }

    /// Integer value in `%rax` becomes float64 bits in `%rax`.
    fn int_bits_to_float(&mut self) {
        self.ins("cvtsi2sdq %rax, %xmm0");
        self.ins("movq %xmm0, %rax");
    }

    fn call_runtime(&mut self, f: RuntimeFn) {
        let symbol = self.target.symbol(f.symbol());
        self.externs.insert(symbol.clone());
        self.emit_aligned_call(&symbol);
    }

    fn call_libc(&mut self, name: &str) {
        let symbol = self.target.symbol(name);
        self.externs.insert(symbol.clone());
        self.emit_aligned_call(&symbol);
    }

    fn call_label(&mut self, label: &str) {
        self.emit_aligned_call(label);
    }

    /// Emits a call with the stack pointer 16-aligned at the call
    /// instruction, reserving Win64 shadow space when the target wants it.
    fn emit_aligned_call(&mut self, symbol: &str) {
        let shadow = self.target.shadow_space as i64;
        let pad = (16 - (self.stack_depth + shadow) % 16) % 16;
        let adjust = pad + shadow;
        if adjust > 0 {
            self.ins(format!("subq ${adjust}, %rsp"));
            self.stack_depth += adjust;
        }
        self.ins(format!("call {symbol}"));
        if adjust > 0 {
            self.ins(format!("addq ${adjust}, %rsp"));
            self.stack_depth -= adjust;
        }
    }

    fn alloc_hidden(&mut self, count: usize) -> Vec<i64> {
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            self.hidden_cursor += 8;
            offsets.push(-self.hidden_cursor);
        }
        offsets
    }

    fn intern_string(&mut self, value: &str) -> String {
        let index = match self.string_labels.get(value) {
            Some(index) => *index,
            None => {
                let index = self.string_values.len();
                self.string_values.push(value.to_string());
                self.string_labels.insert(value.to_string(), index);
                index
            }
        };
        format!(".Lstr{index}")
    }

    fn global_ref(&self, label: &str) -> String {
        if self.target.rip_relative {
            format!("{label}(%rip)")
        } else {
            label.to_string()
        }
    }

    /// Assembles the final listing: externs, data section (interned strings
    /// and global slots), then the text section.
    fn render(&self) -> String {
        let mut out = String::new();
        for symbol in &self.externs {
            out.push_str(&self.target.extern_directive(symbol));
            out.push('\n');
        }
        if !self.externs.is_empty() {
            out.push('\n');
        }

        out.push_str(self.target.data_section);
        out.push('\n');
        for (index, value) in self.string_values.iter().enumerate() {
            let label = format!(".Lstr{index}");
            out.push_str(&self.target.string_directive(&label, value));
            out.push('\n');
        }
        for (name, _) in &self.analysis.globals {
            out.push_str(&self.target.quad_directive(&global_label(name), 0));
            out.push('\n');
        }
        out.push('\n');

        out.push_str(self.target.text_section);
        out.push('\n');
        out.push_str(&self.text);
        out
    }
}

fn align16(bytes: i64) -> i64 {
    (bytes + 15) / 16 * 16
}

fn function_label(name: &str) -> String {
    // Assembler-local labels keep user function names out of the object's
    // symbol table, so they cannot collide with libc or runtime symbols.
    format!(".Lfn_{name}")
}

fn global_label(name: &str) -> String {
    format!(".Lg_{name}")
}

fn int_set_instruction(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "sete",
        BinaryOp::NotEq => "setne",
        BinaryOp::Less => "setl",
        BinaryOp::LessEq => "setle",
        BinaryOp::Greater => "setg",
        BinaryOp::GreaterEq => "setge",
        _ => "sete",
    }
}

fn float_set_instruction(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "sete",
        BinaryOp::NotEq => "setne",
        BinaryOp::Less => "setb",
        BinaryOp::LessEq => "setbe",
        BinaryOp::Greater => "seta",
        BinaryOp::GreaterEq => "setae",
        _ => "sete",
    }
}

fn retain_fn(ty: &Type) -> Result<RuntimeFn> {
    match ty {
        Type::List => Ok(RuntimeFn::ListRetain),
        Type::Dict => Ok(RuntimeFn::DictRetain),
        Type::Range => Ok(RuntimeFn::RangeRetain),
        other => internal(format!("retain of non-refcounted {other}")),
    }
}

fn release_fn(ty: &Type) -> Result<RuntimeFn> {
    match ty {
        Type::List => Ok(RuntimeFn::ListRelease),
        Type::Dict => Ok(RuntimeFn::DictRelease),
        Type::Range => Ok(RuntimeFn::RangeRelease),
        other => internal(format!("release of non-refcounted {other}")),
    }
}

/// A fresh heap value owns its initial reference; binding it must not add
/// another.
fn is_fresh(expr: &Expr) -> bool {
    match &expr.kind {
        ExprKind::List(_) | ExprKind::Dict(_) => true,
        ExprKind::Call { .. } => refcounted(&expr.ty),
        _ => false,
    }
}

/// Upper bound of frame temporaries a statement needs (loop bookkeeping,
/// tuple staging, call-argument overflow).
fn count_hidden_stmt(stmt: &Stmt, target: &TargetSpec) -> usize {
    match &stmt.kind {
        StmtKind::VarDecl { init, .. } => count_hidden_expr(init, target),
        StmtKind::IndexAssign {
            object,
            index,
            value,
        } => {
            count_hidden_expr(object, target)
                + count_hidden_expr(index, target)
                + count_hidden_expr(value, target)
        }
        StmtKind::TupleAssign { targets, values } => {
            values.len()
                + values
                    .iter()
                    .chain(targets.iter())
                    .map(|e| count_hidden_expr(e, target))
                    .sum::<usize>()
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            count_hidden_expr(condition, target)
                + count_hidden_stmt(then_branch, target)
                + else_branch
                    .as_ref()
                    .map_or(0, |stmt| count_hidden_stmt(stmt, target))
        }
        StmtKind::While { condition, body } => {
            count_hidden_expr(condition, target) + count_hidden_stmt(body, target)
        }
        StmtKind::ForIn { iterable, body, .. } => {
            3 + count_hidden_expr(iterable, target) + count_hidden_stmt(body, target)
        }
        StmtKind::Return(value) => value
            .as_ref()
            .map_or(0, |expr| count_hidden_expr(expr, target)),
        StmtKind::Block(statements) => statements
            .iter()
            .map(|stmt| count_hidden_stmt(stmt, target))
            .sum(),
        StmtKind::Expression(expr) => count_hidden_expr(expr, target),
        _ => 0,
    }
}

fn count_hidden_expr(expr: &Expr, target: &TargetSpec) -> usize {
    match &expr.kind {
        ExprKind::Binary { left, right, .. } => {
            count_hidden_expr(left, target) + count_hidden_expr(right, target)
        }
        ExprKind::Unary { operand, .. } => count_hidden_expr(operand, target),
        ExprKind::Call { args, .. } => {
            let overflow = if args.len() > target.arg_registers.len() {
                args.len()
            } else {
                0
            };
            overflow
                + args
                    .iter()
                    .map(|arg| count_hidden_expr(arg, target))
                    .sum::<usize>()
        }
        ExprKind::Index { object, index } => {
            count_hidden_expr(object, target) + count_hidden_expr(index, target)
        }
        ExprKind::Tuple(items) | ExprKind::List(items) => items
            .iter()
            .map(|item| count_hidden_expr(item, target))
            .sum(),
        ExprKind::Dict(pairs) => pairs
            .iter()
            .map(|(k, v)| count_hidden_expr(k, target) + count_hidden_expr(v, target))
            .sum(),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::check_program;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use crate::target::{LINUX_X86_64, MACOS_X86_64, WINDOWS_X86_64};
    use indoc::indoc;
    use std::collections::HashSet;

    fn emit_for(source: &str, target: &TargetSpec) -> String {
        let tokens = tokenize(source).expect("tokenize should succeed");
        let mut program = parse_tokens(tokens).expect("parse should succeed");
        let analysis = check_program(&mut program).expect("analysis should succeed");
        Generator::new(target, &analysis)
            .generate(&program)
            .expect("codegen should succeed")
    }

    fn emit(source: &str) -> String {
        emit_for(source, &LINUX_X86_64)
    }

    #[test]
    fn hello_world_prints_a_string() {
        let asm = emit(indoc! {r#"
            fn main() { out("Hello World I'am Orion!") }
            main()
        "#});
        assert!(asm.contains(".Lstr0: .string \"Hello World I'am Orion!\""));
        assert!(asm.contains("call print_string"));
        assert!(asm.contains("leaq .Lstr0(%rip), %rax"));
        // Synthesized entry calls the user main.
        assert!(asm.contains(".globl main"));
        assert!(asm.contains("call .Lfn_main"));
    }

    #[test]
    fn integer_addition_uses_the_accumulator_scheme() {
        let asm = emit(indoc! {"
            fn add(a int, b int) -> int { return a + b }
            fn main() { out(add(5, 6)) }
            main()
        "});
        assert!(asm.contains(".Lfn_add:"));
        assert!(asm.contains("addq %rcx, %rax"));
        assert!(asm.contains("call print_int"));
        // Parameters spill from SysV registers.
        assert!(asm.contains("movq %rdi, -8(%rbp)"));
        assert!(asm.contains("movq %rsi, -16(%rbp)"));
    }

    #[test]
    fn labels_are_unique() {
        let asm = emit(indoc! {"
            fn main() {
                i = 0
                while i < 3 {
                    if i == 1 { out(i) } else { out(0 - i) }
                    i += 1
                }
                for j in range(0, 3) { out(j) }
            }
            main()
        "});
        let mut seen = HashSet::new();
        for line in asm.lines() {
            let line = line.trim_end();
            if line.starts_with(".L") && line.ends_with(':') {
                assert!(seen.insert(line.to_string()), "duplicate label {line}");
            }
        }
    }

    #[test]
    fn string_literals_are_deduplicated() {
        let asm = emit(indoc! {r#"
            fn main() {
                out("twice")
                out("twice")
                out("once")
            }
            main()
        "#});
        assert_eq!(asm.matches(": .string \"twice\"").count(), 1);
        assert_eq!(asm.matches(": .string \"once\"").count(), 1);
    }

    #[test]
    fn division_sign_extends_before_idiv() {
        let asm = emit("fn main() { out(7 / 2) }\nmain()\n");
        assert!(asm.contains("cqto"));
        assert!(asm.contains("idivq %rcx"));
    }

    #[test]
    fn comparison_materializes_a_flag() {
        let asm = emit("fn main() { out(1 < 2) }\nmain()\n");
        assert!(asm.contains("cmpq %rcx, %rax"));
        assert!(asm.contains("setl %al"));
        assert!(asm.contains("movzbq %al, %rax"));
        assert!(asm.contains("call print_bool"));
    }

    #[test]
    fn power_is_a_multiply_loop_with_fresh_labels() {
        let asm = emit("fn main() { out(2 ** 8) }\nmain()\n");
        assert!(asm.contains("imulq %rdx, %rax"));
        assert!(asm.contains(".Lpow"));
    }

    #[test]
    fn dict_literal_and_index_assignment() {
        let asm = emit(indoc! {r#"
            fn main() {
                d = {"x": 1}
                d["y"] = 2
                out(d["x"] + d["y"])
            }
            main()
        "#});
        assert!(asm.contains("call dict_new"));
        assert!(asm.contains("call dict_set"));
        assert!(asm.contains("call dict_get"));
        // Rebinding a dict-typed local releases the previous contents.
        assert!(asm.contains("call dict_release"));
    }

    #[test]
    fn list_literal_materializes_through_scratch_buffer() {
        let asm = emit(indoc! {"
            fn main() {
                a = [1, 2, 3]
                out(a[1])
            }
            main()
        "});
        assert!(asm.contains("call orion_malloc"));
        assert!(asm.contains("call list_from_data"));
        assert!(asm.contains("call orion_free"));
        assert!(asm.contains("call list_get"));
        assert!(asm.contains("pushq %r12"));
        assert!(asm.contains("popq %r12"));
    }

    #[test]
    fn range_for_materializes_bounds_in_frame() {
        let asm = emit(indoc! {"
            fn main() {
                for i in range(0, 10) { out(i) }
            }
            main()
        "});
        // Direct range(...) iterables skip the heap range object.
        assert!(!asm.contains("call range_new"));
        assert!(asm.contains("js .L"));
    }

    #[test]
    fn range_value_iteration_goes_through_runtime() {
        let asm = emit(indoc! {"
            fn main() {
                r = range(3)
                for i in r { out(i) }
            }
            main()
        "});
        assert!(asm.contains("call range_new_stop"));
        assert!(asm.contains("call range_len"));
        assert!(asm.contains("call range_get"));
        // The loop holds its own reference to the iterable.
        assert!(asm.contains("call range_retain"));
        assert!(asm.contains("call range_release"));
    }

    #[test]
    fn loop_keeps_iterable_alive_across_rebinding() {
        let asm = emit(indoc! {"
            fn main() {
                xs = [1, 2, 3]
                for x in xs {
                    out(x)
                    xs = [4, 5]
                }
            }
            main()
        "});
        // The loop retains the object it walks, so rebinding `xs` in the
        // body releases only the binding's reference, never the last one.
        let retains = asm.matches("call list_retain").count();
        let releases = asm.matches("call list_release").count();
        assert!(retains >= 1, "loop must retain its iterable");
        assert!(releases > retains);
    }

    #[test]
    fn pop_dispatches_on_receiver_and_arity() {
        let asm = emit(indoc! {r#"
            fn main() {
                d = {"x": 1}
                xs = [1, 2]
                out(pop(xs))
                out(pop(d, "x"))
                out(pop(d, "y", 0))
            }
            main()
        "#});
        assert!(asm.contains("call list_pop"));
        assert!(asm.contains("call dict_pop\n"));
        assert!(asm.contains("call dict_pop_default"));
    }

    #[test]
    fn while_loop_break_and_continue_target_loop_labels() {
        let asm = emit(indoc! {"
            fn main() {
                i = 0
                while True {
                    i += 1
                    if i == 3 { continue }
                    if i > 5 { break }
                }
                out(i)
            }
            main()
        "});
        assert!(asm.contains("jz .Lend_loop"));
        assert!(asm.contains("jmp .Lloop"));
    }

    #[test]
    fn tuple_assignment_stages_values_before_stores() {
        let asm = emit(indoc! {"
            fn main() {
                a = 1
                b = 2
                (a, b) = (b, a)
                out(a)
            }
            main()
        "});
        // Both values land in frame temporaries before either store.
        let staged = asm
            .lines()
            .filter(|l| l.trim().starts_with("movq %rax, -") && l.contains("(%rbp)"))
            .count();
        assert!(staged >= 2);
    }

    #[test]
    fn globals_live_in_the_data_section() {
        let asm = emit(indoc! {"
            counter = 0
            fn bump() {
                global counter
                counter += 1
            }
            bump()
            out(counter)
        "});
        assert!(asm.contains(".Lg_counter: .quad 0"));
        assert!(asm.contains("movq .Lg_counter(%rip), %rax"));
        assert!(asm.contains("movq %rax, .Lg_counter(%rip)"));
    }

    #[test]
    fn float_arithmetic_goes_through_sse() {
        let asm = emit("fn main() { out(1.5 + 2.25) }\nmain()\n");
        assert!(asm.contains("addsd %xmm1, %xmm0"));
        assert!(asm.contains("call print_float"));
    }

    #[test]
    fn mixed_arithmetic_widens_the_integer_side() {
        let asm = emit("fn main() { out(1 + 2.5) }\nmain()\n");
        assert!(asm.contains("cvtsi2sdq %rax, %xmm0"));
    }

    #[test]
    fn string_concat_calls_the_parts_helper() {
        let asm = emit("fn main() { out(\"a\" + \"b\") }\nmain()\n");
        assert!(asm.contains("call string_concat_parts"));
    }

    #[test]
    fn promoted_main_gets_the_entry_symbol_and_zero_return() {
        let asm = emit("fn main() { out(1) }");
        assert!(asm.contains(".globl main"));
        assert!(asm.contains("main:"));
        assert!(!asm.contains(".Lfn_main"));
        assert!(asm.contains("movq $0, %rax"));
    }

    #[test]
    fn externs_are_declared_for_runtime_symbols() {
        let asm = emit("fn main() { out(1) }\nmain()\n");
        assert!(asm.contains(".extern print_int"));
    }

    #[test]
    fn macos_prefixes_symbols() {
        let asm = emit_for("fn main() { out(1) }\nmain()\n", &MACOS_X86_64);
        assert!(asm.contains(".globl _main"));
        assert!(asm.contains("_main:"));
        assert!(asm.contains("call _print_int"));
        assert!(asm.contains(".extern _print_int"));
        assert!(asm.contains(".section __TEXT,__text"));
    }

    #[test]
    fn windows_reserves_shadow_space() {
        let asm = emit_for("fn main() { out(1) }\nmain()\n", &WINDOWS_X86_64);
        // 32 bytes of shadow space (plus any alignment pad) bracket calls.
        assert!(asm.contains("subq $32, %rsp") || asm.contains("subq $40, %rsp"));
        // Win64 integer args start in %rcx.
        assert!(asm.contains("movq %rax, %rcx") || asm.contains("popq %rcx"));
    }

    #[test]
    fn stack_depth_stays_balanced() {
        let asm = emit(indoc! {"
            fn f(a int, b int, c int, d int, e int, g int, h int) -> int {
                return a + b + c + d + e + g + h
            }
            fn main() { out(f(1, 2, 3, 4, 5, 6, 7)) }
            main()
        "});
        // Overflow argument is pushed and cleaned up after the call.
        assert!(asm.contains("pushq -"));
        assert!(asm.contains("addq $8, %rsp") || asm.contains("addq $16, %rsp"));
    }

    #[test]
    fn fresh_values_skip_retain_but_aliases_retain() {
        let asm = emit(indoc! {"
            fn main() {
                a = [1, 2]
                b = a
                out(len(b))
            }
            main()
        "});
        assert!(asm.contains("call list_retain"));
        assert!(asm.contains("call list_release"));
    }

    #[test]
    fn locals_release_on_early_return() {
        let asm = emit(indoc! {"
            fn f(flag bool) -> int {
                xs = [1, 2, 3]
                if flag { return 1 }
                return 2
            }
            fn main() { out(f(True)) }
            main()
        "});
        // Early returns jump to the single epilogue, which releases.
        assert!(asm.contains("jmp .Lepilogue"));
        assert!(asm.contains("call list_release"));
        // The refcounted slot starts null.
        assert!(asm.contains("movq $0, -"));
    }
}
