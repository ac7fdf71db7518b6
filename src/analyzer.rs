use std::collections::{HashMap, HashSet};
use std::fmt;

use thiserror::Error;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionBody, FunctionDecl, Program, Stmt, StmtKind, UnaryOp,
};
use crate::builtins::BuiltinFunction;
use crate::token::Span;
use crate::types::Type;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SemaErrorKind {
    #[error("TypeError: {0}")]
    Type(String),
    #[error("ScopeError: {0}")]
    Scope(String),
    #[error("OperatorError: operator '{op}' is not defined for {lhs} and {rhs}")]
    Operator { op: String, lhs: Type, rhs: Type },
    #[error("OperatorError: unary operator '{op}' is not defined for {operand}")]
    UnaryOperator { op: String, operand: Type },
    #[error("ReturnOutsideFunction: 'return' outside of a function body")]
    ReturnOutsideFunction,
    #[error("BreakOutsideLoop: '{keyword}' outside of a loop body")]
    BreakOutsideLoop { keyword: &'static str },
    #[error("ArityMismatch: function '{name}' expected {expected} arguments, got {found}")]
    ArityMismatch {
        name: String,
        expected: String,
        found: usize,
    },
    #[error("UnknownFunction: call to undefined function '{name}'")]
    UnknownFunction { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaError {
    pub kind: SemaErrorKind,
    pub line: usize,
    pub column: usize,
}

impl SemaError {
    fn new(kind: SemaErrorKind, span: Span) -> Self {
        Self {
            kind,
            line: span.line,
            column: span.column,
        }
    }
}

impl fmt::Display for SemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for SemaError {}

/// Per-function facts the code generator consumes.
#[derive(Debug, Clone, Default)]
pub struct FunctionInfo {
    pub params: Vec<(String, Type)>,
    /// Locals in first-assignment order, excluding parameters, with their
    /// final static types.
    pub locals: Vec<(String, Type)>,
    /// Names this function resolves against the root scope.
    pub global_refs: HashSet<String>,
    pub return_type: Type,
}

/// Result of semantic analysis over a whole program.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub functions: HashMap<String, FunctionInfo>,
    /// Root-scope bindings in declaration order.
    pub globals: Vec<(String, Type)>,
    /// Enum variant names flattened into root-scope integer constants.
    pub enum_constants: HashMap<String, i64>,
}

#[derive(Debug, Clone)]
struct Binding {
    ty: Type,
    explicit: bool,
}

#[derive(Debug, Clone)]
struct FunctionSig {
    params: Vec<(String, Type)>,
    return_type: Type,
}

/// Scope context for one checking pass: either the root scope (top-level
/// statements) or a function body.
struct Ctx {
    function: Option<String>,
    return_type: Type,
    locals: HashMap<String, Binding>,
    local_order: Vec<String>,
    global_decls: HashSet<String>,
    global_refs: HashSet<String>,
    loop_depth: usize,
}

impl Ctx {
    fn root() -> Self {
        Ctx {
            function: None,
            return_type: Type::Void,
            locals: HashMap::new(),
            local_order: Vec::new(),
            global_decls: HashSet::new(),
            global_refs: HashSet::new(),
            loop_depth: 0,
        }
    }
}

pub struct Analyzer {
    errors: Vec<SemaError>,
    functions: HashMap<String, FunctionSig>,
    structs: HashMap<String, Vec<(String, Type)>>,
    enums: HashMap<String, Vec<(String, i64)>>,
    enum_constants: HashMap<String, i64>,
    globals: HashMap<String, Binding>,
    global_order: Vec<String>,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            errors: Vec::new(),
            functions: HashMap::new(),
            structs: HashMap::new(),
            enums: HashMap::new(),
            enum_constants: HashMap::new(),
            globals: HashMap::new(),
            global_order: Vec::new(),
        }
    }

    /// Checks the program, annotating every expression with its static type.
    /// Analysis does not halt on the first error; all findings are returned
    /// together.
    pub fn check(mut self, program: &mut Program) -> Result<Analysis, Vec<SemaError>> {
        self.collect_declarations(program);

        // Top-level statements type the globals before function bodies are
        // checked against them.
        let mut root = Ctx::root();
        for stmt in &mut program.statements {
            if !matches!(stmt.kind, StmtKind::Function(_)) {
                self.check_stmt(stmt, &mut root);
            }
        }

        let mut infos = HashMap::new();
        for stmt in &mut program.statements {
            if let StmtKind::Function(func) = &mut stmt.kind {
                let info = self.check_function(func, stmt.span);
                infos.insert(func.name.clone(), info);
            }
        }

        if !self.errors.is_empty() {
            return Err(self.errors);
        }

        let globals = self
            .global_order
            .iter()
            .map(|name| {
                let ty = self.globals[name].ty.clone();
                (name.clone(), ty)
            })
            .collect();
        Ok(Analysis {
            functions: infos,
            globals,
            enum_constants: self.enum_constants,
        })
    }

    /// Registers structs, enums and function signatures so that forward
    /// references resolve.
    fn collect_declarations(&mut self, program: &mut Program) {
        for stmt in &program.statements {
            match &stmt.kind {
                StmtKind::Struct { name, fields } => {
                    if self.structs.contains_key(name) || self.enums.contains_key(name) {
                        self.error(
                            SemaErrorKind::Scope(format!("duplicate type name '{name}'")),
                            stmt.span,
                        );
                        continue;
                    }
                    let mut seen = HashSet::new();
                    for (field, _) in fields {
                        if !seen.insert(field.clone()) {
                            self.error(
                                SemaErrorKind::Scope(format!(
                                    "duplicate field '{field}' in struct '{name}'"
                                )),
                                stmt.span,
                            );
                        }
                    }
                    self.structs.insert(name.clone(), fields.clone());
                }
                StmtKind::Enum { name, values } => {
                    if self.structs.contains_key(name) || self.enums.contains_key(name) {
                        self.error(
                            SemaErrorKind::Scope(format!("duplicate type name '{name}'")),
                            stmt.span,
                        );
                        continue;
                    }
                    for (value_name, value) in values {
                        if self.enum_constants.contains_key(value_name) {
                            self.error(
                                SemaErrorKind::Scope(format!(
                                    "duplicate enum value name '{value_name}'"
                                )),
                                stmt.span,
                            );
                            continue;
                        }
                        self.enum_constants.insert(value_name.clone(), *value);
                    }
                    self.enums.insert(name.clone(), values.clone());
                }
                _ => {}
            }
        }

        for stmt in &mut program.statements {
            if let StmtKind::Function(func) = &mut stmt.kind {
                if self.functions.contains_key(&func.name) {
                    self.error(
                        SemaErrorKind::Scope(format!(
                            "duplicate function name '{}'",
                            func.name
                        )),
                        stmt.span,
                    );
                    continue;
                }
                let mut seen = HashSet::new();
                let mut params = Vec::new();
                for param in &mut func.params {
                    if !seen.insert(param.name.clone()) {
                        self.error(
                            SemaErrorKind::Scope(format!(
                                "duplicate parameter '{}' in function '{}'",
                                param.name, func.name
                            )),
                            stmt.span,
                        );
                    }
                    // Untyped parameters default to the erased machine type.
                    if param.ty.is_unknown() {
                        param.ty = Type::Int64;
                    } else {
                        param.ty = self.resolve_type(&param.ty, stmt.span);
                    }
                    params.push((param.name.clone(), param.ty.clone()));
                }
                func.return_type = self.resolve_type(&func.return_type, stmt.span);
                // A single-expression body infers its return type when no
                // '->' annotation was given.
                let return_type = match (&func.body, &func.return_type) {
                    (FunctionBody::Expr(_), Type::Void) => Type::Unknown,
                    _ => func.return_type.clone(),
                };
                self.functions.insert(
                    func.name.clone(),
                    FunctionSig {
                        params,
                        return_type,
                    },
                );
            }
        }
    }

    /// Maps a parsed named type onto the declared struct or enum.
    fn resolve_type(&mut self, ty: &Type, span: Span) -> Type {
        match ty {
            Type::Struct(name) | Type::Enum(name) => {
                if self.structs.contains_key(name) {
                    Type::Struct(name.clone())
                } else if self.enums.contains_key(name) {
                    Type::Enum(name.clone())
                } else {
                    self.error(
                        SemaErrorKind::Type(format!("unknown type name '{name}'")),
                        span,
                    );
                    Type::Int64
                }
            }
            other => other.clone(),
        }
    }

    fn check_function(&mut self, func: &mut FunctionDecl, span: Span) -> FunctionInfo {
        let mut ctx = Ctx {
            function: Some(func.name.clone()),
            return_type: self
                .functions
                .get(&func.name)
                .map(|sig| sig.return_type.clone())
                .unwrap_or(Type::Void),
            locals: HashMap::new(),
            local_order: Vec::new(),
            global_decls: HashSet::new(),
            global_refs: HashSet::new(),
            loop_depth: 0,
        };
        for param in &func.params {
            ctx.locals.insert(
                param.name.clone(),
                Binding {
                    ty: param.ty.clone(),
                    explicit: param.explicit_type,
                },
            );
        }

        match &mut func.body {
            FunctionBody::Block(body) => {
                // Pass 1: names assigned anywhere in the body become locals,
                // unless a `global` statement claims them for the root scope.
                let mut global_decls = HashSet::new();
                collect_global_decls(body, &mut global_decls);
                let mut assigned = Vec::new();
                collect_assigned_names(body, &mut assigned);
                ctx.global_decls = global_decls;
                for name in assigned {
                    if ctx.global_decls.contains(&name) || ctx.locals.contains_key(&name) {
                        continue;
                    }
                    ctx.locals.insert(
                        name.clone(),
                        Binding {
                            ty: Type::Unknown,
                            explicit: false,
                        },
                    );
                    ctx.local_order.push(name);
                }

                // Pass 2: statement-order type checking.
                for stmt in body.iter_mut() {
                    self.check_stmt(stmt, &mut ctx);
                }
            }
            FunctionBody::Expr(expr) => {
                let body_ty = self.check_expr(expr, &mut ctx);
                if ctx.return_type.is_unknown() {
                    ctx.return_type = body_ty.clone();
                    if let Some(sig) = self.functions.get_mut(&func.name) {
                        sig.return_type = body_ty.clone();
                    }
                    func.return_type = body_ty;
                } else if !assignable(&ctx.return_type, &body_ty) {
                    self.error(
                        SemaErrorKind::Type(format!(
                            "function '{}' declared to return {} but its body has type {}",
                            func.name, ctx.return_type, body_ty
                        )),
                        span,
                    );
                }
            }
        }

        let locals = ctx
            .local_order
            .iter()
            .map(|name| {
                let ty = match &ctx.locals[name].ty {
                    Type::Unknown => Type::Int64,
                    ty => ty.clone(),
                };
                (name.clone(), ty)
            })
            .collect();
        FunctionInfo {
            params: func
                .params
                .iter()
                .map(|p| (p.name.clone(), p.ty.clone()))
                .collect(),
            locals,
            global_refs: ctx.global_refs,
            return_type: func.return_type.clone(),
        }
    }

    fn check_stmt(&mut self, stmt: &mut Stmt, ctx: &mut Ctx) {
        let span = stmt.span;
        match &mut stmt.kind {
            StmtKind::Function(func) => {
                if ctx.function.is_some() {
                    self.error(
                        SemaErrorKind::Scope(format!(
                            "nested function '{}' is not supported",
                            func.name
                        )),
                        span,
                    );
                }
                // Top-level functions are checked separately.
            }
            StmtKind::Struct { name, .. } | StmtKind::Enum { name, .. } => {
                if ctx.function.is_some() {
                    self.error(
                        SemaErrorKind::Scope(format!(
                            "type declaration '{name}' must be top-level"
                        )),
                        span,
                    );
                }
            }
            StmtKind::VarDecl {
                name,
                declared,
                explicit_type,
                init,
            } => {
                let init_ty = self.check_expr(init, ctx);
                if *explicit_type {
                    *declared = self.resolve_type(declared, span);
                }
                self.bind_name(name, declared.clone(), *explicit_type, &init_ty, span, ctx);
            }
            StmtKind::IndexAssign {
                object,
                index,
                value,
            } => {
                let object_ty = self.check_expr(object, ctx);
                let index_ty = self.check_expr(index, ctx);
                let value_ty = self.check_expr(value, ctx);
                self.check_index_write(&object_ty, &index_ty, span);
                if value_ty == Type::Void {
                    self.error(
                        SemaErrorKind::Type("cannot store a void value".to_string()),
                        span,
                    );
                }
            }
            StmtKind::TupleAssign { targets, values } => {
                if targets.len() != values.len() {
                    self.error(
                        SemaErrorKind::Type(format!(
                            "tuple assignment arity mismatch: {} targets, {} values",
                            targets.len(),
                            values.len()
                        )),
                        span,
                    );
                }
                let value_types: Vec<Type> = values
                    .iter_mut()
                    .map(|value| self.check_expr(value, ctx))
                    .collect();
                for (target, value_ty) in targets.iter_mut().zip(value_types) {
                    match &mut target.kind {
                        ExprKind::Identifier(name) => {
                            let name = name.clone();
                            self.bind_name(&name, Type::Unknown, false, &value_ty, span, ctx);
                            target.ty = value_ty;
                        }
                        ExprKind::Index { object, index } => {
                            let object_ty = self.check_expr(object, ctx);
                            let index_ty = self.check_expr(index, ctx);
                            self.check_index_write(&object_ty, &index_ty, span);
                            target.ty = Type::Int64;
                        }
                        _ => {
                            self.error(
                                SemaErrorKind::Type(
                                    "tuple assignment target must be an identifier or index"
                                        .to_string(),
                                ),
                                target.span,
                            );
                        }
                    }
                }
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.check_condition(condition, ctx);
                self.check_stmt(then_branch, ctx);
                if let Some(else_branch) = else_branch {
                    self.check_stmt(else_branch, ctx);
                }
            }
            StmtKind::While { condition, body } => {
                self.check_condition(condition, ctx);
                ctx.loop_depth += 1;
                self.check_stmt(body, ctx);
                ctx.loop_depth -= 1;
            }
            StmtKind::ForIn {
                variable,
                iterable,
                body,
            } => {
                let iterable_ty = self.check_expr(iterable, ctx);
                if !matches!(iterable_ty, Type::Range | Type::List) {
                    self.error(
                        SemaErrorKind::Type(format!(
                            "for-in iterable must be a range or list, got {iterable_ty}"
                        )),
                        iterable.span,
                    );
                }
                // Elements are erased to int64 in both cases.
                self.bind_name(variable, Type::Unknown, false, &Type::Int64, span, ctx);
                ctx.loop_depth += 1;
                self.check_stmt(body, ctx);
                ctx.loop_depth -= 1;
            }
            StmtKind::Return(value) => {
                if ctx.function.is_none() {
                    self.error(SemaErrorKind::ReturnOutsideFunction, span);
                    if let Some(value) = value {
                        self.check_expr(value, ctx);
                    }
                    return;
                }
                match value {
                    Some(value) => {
                        let value_ty = self.check_expr(value, ctx);
                        if ctx.return_type == Type::Void {
                            self.error(
                                SemaErrorKind::Type(
                                    "cannot return a value from a void function".to_string(),
                                ),
                                span,
                            );
                        } else if !assignable(&ctx.return_type, &value_ty) {
                            self.error(
                                SemaErrorKind::Type(format!(
                                    "return type mismatch: expected {}, got {}",
                                    ctx.return_type, value_ty
                                )),
                                span,
                            );
                        }
                    }
                    None => {
                        if ctx.return_type != Type::Void {
                            self.error(
                                SemaErrorKind::Type(format!(
                                    "return without a value in a function returning {}",
                                    ctx.return_type
                                )),
                                span,
                            );
                        }
                    }
                }
            }
            StmtKind::Break => {
                if ctx.loop_depth == 0 {
                    self.error(SemaErrorKind::BreakOutsideLoop { keyword: "break" }, span);
                }
            }
            StmtKind::Continue => {
                if ctx.loop_depth == 0 {
                    self.error(
                        SemaErrorKind::BreakOutsideLoop {
                            keyword: "continue",
                        },
                        span,
                    );
                }
            }
            StmtKind::Pass => {}
            StmtKind::Block(statements) => {
                for inner in statements {
                    self.check_stmt(inner, ctx);
                }
            }
            StmtKind::Global(names) => {
                // Validated in pass 1 for functions; at top level the names
                // already live in the root scope.
                for name in names {
                    if ctx.function.is_some() {
                        ctx.global_refs.insert(name.clone());
                    }
                    if !self.globals.contains_key(name) {
                        self.globals.insert(
                            name.clone(),
                            Binding {
                                ty: Type::Unknown,
                                explicit: false,
                            },
                        );
                        self.global_order.push(name.clone());
                    }
                }
            }
            StmtKind::Local(names) => {
                if ctx.function.is_none() {
                    self.error(
                        SemaErrorKind::Scope("'local' outside of a function".to_string()),
                        span,
                    );
                    return;
                }
                for name in names.iter() {
                    if !ctx.locals.contains_key(name) {
                        ctx.locals.insert(
                            name.clone(),
                            Binding {
                                ty: Type::Unknown,
                                explicit: false,
                            },
                        );
                        ctx.local_order.push(name.clone());
                    }
                }
            }
            StmtKind::Expression(expr) => {
                self.check_expr(expr, ctx);
            }
        }
    }

    /// Applies declaration/rebinding rules for `name = value` in the current
    /// scope and records the binding's static type.
    fn bind_name(
        &mut self,
        name: &str,
        declared: Type,
        explicit: bool,
        init_ty: &Type,
        span: Span,
        ctx: &mut Ctx,
    ) {
        if *init_ty == Type::Void {
            self.error(
                SemaErrorKind::Type(format!("cannot assign a void value to '{name}'")),
                span,
            );
            return;
        }

        let target_ty = if explicit {
            if !assignable(&declared, init_ty) {
                self.error(
                    SemaErrorKind::Type(format!(
                        "cannot initialize '{name}' of type {declared} with a value of type {init_ty}"
                    )),
                    span,
                );
            }
            declared
        } else {
            init_ty.clone()
        };

        let goes_to_root = ctx.function.is_none() || ctx.global_decls.contains(name);
        if goes_to_root {
            if ctx.function.is_some() {
                ctx.global_refs.insert(name.to_string());
            }
            if let Some(binding) = self.globals.get(name).cloned() {
                self.check_rebind(name, &binding, &target_ty, span);
                if let Some(entry) = self.globals.get_mut(name) {
                    entry.ty = target_ty;
                    entry.explicit = entry.explicit || explicit;
                }
            } else {
                self.globals.insert(
                    name.to_string(),
                    Binding {
                        ty: target_ty,
                        explicit,
                    },
                );
                self.global_order.push(name.to_string());
            }
        } else if let Some(binding) = ctx.locals.get(name).cloned() {
            if !binding.ty.is_unknown() {
                self.check_rebind(name, &binding, &target_ty, span);
            }
            if let Some(entry) = ctx.locals.get_mut(name) {
                entry.ty = target_ty;
                entry.explicit = entry.explicit || explicit;
            }
        } else {
            // Not collected in pass 1 (e.g. a synthesized binding); register
            // it now so codegen assigns a slot.
            ctx.locals.insert(
                name.to_string(),
                Binding {
                    ty: target_ty,
                    explicit,
                },
            );
            ctx.local_order.push(name.to_string());
        }
    }

    /// Rebinding to a different type is allowed only for bindings that were
    /// not explicitly typed, and never across the refcounted kinds (a stack
    /// slot must stay in one release discipline for its whole live range).
    fn check_rebind(&mut self, name: &str, binding: &Binding, new_ty: &Type, span: Span) {
        if binding.ty == *new_ty || binding.ty.is_unknown() {
            return;
        }
        if binding.explicit {
            self.error(
                SemaErrorKind::Type(format!(
                    "cannot assign {} to '{}' declared as {}",
                    new_ty, name, binding.ty
                )),
                span,
            );
            return;
        }
        let old_rc = refcounted(&binding.ty);
        let new_rc = refcounted(new_ty);
        if old_rc || new_rc {
            self.error(
                SemaErrorKind::Type(format!(
                    "cannot rebind '{}' from {} to {}",
                    name, binding.ty, new_ty
                )),
                span,
            );
        }
    }

    fn check_index_write(&mut self, object_ty: &Type, index_ty: &Type, span: Span) {
        match object_ty {
            Type::List => {
                if !index_ty.is_integer() {
                    self.error(
                        SemaErrorKind::Type(format!(
                            "list index must be an integer, got {index_ty}"
                        )),
                        span,
                    );
                }
            }
            Type::Dict => {
                if !index_ty.is_integer() && *index_ty != Type::String {
                    self.error(
                        SemaErrorKind::Type(format!(
                            "dict key must be an integer or string, got {index_ty}"
                        )),
                        span,
                    );
                }
            }
            other => {
                self.error(
                    SemaErrorKind::Type(format!("type {other} does not support index assignment")),
                    span,
                );
            }
        }
    }

    fn check_condition(&mut self, condition: &mut Expr, ctx: &mut Ctx) {
        let ty = self.check_expr(condition, ctx);
        if !matches!(ty, Type::Bool) && !ty.is_integer() {
            self.error(
                SemaErrorKind::Type(format!("condition must be bool or integer, got {ty}")),
                condition.span,
            );
        }
    }

    fn check_expr(&mut self, expr: &mut Expr, ctx: &mut Ctx) -> Type {
        let span = expr.span;
        let ty = match &mut expr.kind {
            ExprKind::Int(_) => Type::Int64,
            ExprKind::Float(_) => Type::Float64,
            ExprKind::Bool(_) => Type::Bool,
            ExprKind::Str(_) => Type::String,
            ExprKind::Identifier(name) => self.resolve_identifier(name, span, ctx),
            ExprKind::Binary { left, op, right } => {
                let lhs = self.check_expr(left, ctx);
                let rhs = self.check_expr(right, ctx);
                self.check_binary(*op, &lhs, &rhs, span)
            }
            ExprKind::Unary { op, operand } => {
                let operand_ty = self.check_expr(operand, ctx);
                self.check_unary(*op, &operand_ty, span)
            }
            ExprKind::Call { callee, args } => {
                let callee = callee.clone();
                self.check_call(&callee, args, span, ctx)
            }
            ExprKind::Index { object, index } => {
                let object_ty = self.check_expr(object, ctx);
                let index_ty = self.check_expr(index, ctx);
                match object_ty {
                    Type::List | Type::Range => {
                        if !index_ty.is_integer() {
                            self.error(
                                SemaErrorKind::Type(format!(
                                    "index must be an integer, got {index_ty}"
                                )),
                                span,
                            );
                        }
                        Type::Int64
                    }
                    Type::Dict => {
                        if !index_ty.is_integer() && index_ty != Type::String {
                            self.error(
                                SemaErrorKind::Type(format!(
                                    "dict key must be an integer or string, got {index_ty}"
                                )),
                                span,
                            );
                        }
                        Type::Int64
                    }
                    other => {
                        self.error(
                            SemaErrorKind::Type(format!("type {other} is not indexable")),
                            span,
                        );
                        Type::Int64
                    }
                }
            }
            ExprKind::Tuple(elements) => {
                for element in elements.iter_mut() {
                    self.check_expr(element, ctx);
                }
                self.error(
                    SemaErrorKind::Type(
                        "tuple literal is only valid in a tuple assignment".to_string(),
                    ),
                    span,
                );
                Type::Int64
            }
            ExprKind::List(elements) => {
                for element in elements.iter_mut() {
                    let element_ty = self.check_expr(element, ctx);
                    if element_ty == Type::Void {
                        self.error(
                            SemaErrorKind::Type("list element cannot be void".to_string()),
                            element.span,
                        );
                    }
                }
                Type::List
            }
            ExprKind::Dict(pairs) => {
                for (key, value) in pairs.iter_mut() {
                    let key_ty = self.check_expr(key, ctx);
                    if !key_ty.is_integer() && key_ty != Type::String {
                        self.error(
                            SemaErrorKind::Type(format!(
                                "dict key must be an integer or string, got {key_ty}"
                            )),
                            key.span,
                        );
                    }
                    let value_ty = self.check_expr(value, ctx);
                    if value_ty == Type::Void {
                        self.error(
                            SemaErrorKind::Type("dict value cannot be void".to_string()),
                            value.span,
                        );
                    }
                }
                Type::Dict
            }
        };
        expr.ty = ty.clone();
        ty
    }

    fn resolve_identifier(&mut self, name: &str, span: Span, ctx: &mut Ctx) -> Type {
        if ctx.function.is_some() && !ctx.global_decls.contains(name) {
            if let Some(binding) = ctx.locals.get(name) {
                if binding.ty.is_unknown() {
                    self.error(
                        SemaErrorKind::Scope(format!(
                            "local variable '{name}' used before assignment"
                        )),
                        span,
                    );
                    return Type::Int64;
                }
                return binding.ty.clone();
            }
        }
        if let Some(binding) = self.globals.get(name) {
            if ctx.function.is_some() {
                ctx.global_refs.insert(name.to_string());
            }
            if binding.ty.is_unknown() {
                self.error(
                    SemaErrorKind::Scope(format!("global '{name}' used before assignment")),
                    span,
                );
                return Type::Int64;
            }
            return binding.ty.clone();
        }
        if self.enum_constants.contains_key(name) {
            return Type::Int64;
        }
        self.error(
            SemaErrorKind::Scope(format!("unresolved name '{name}'")),
            span,
        );
        Type::Int64
    }

    fn check_binary(&mut self, op: BinaryOp, lhs: &Type, rhs: &Type, span: Span) -> Type {
        use BinaryOp::*;
        match op {
            Add => {
                if *lhs == Type::String && *rhs == Type::String {
                    return Type::String;
                }
                match lhs.widen_numeric(rhs) {
                    Some(ty) => ty,
                    None => self.operator_error(op, lhs, rhs, span),
                }
            }
            Sub | Mul | Div => match lhs.widen_numeric(rhs) {
                Some(ty) => ty,
                None => self.operator_error(op, lhs, rhs, span),
            },
            FloorDiv | Mod => {
                if lhs.is_integer() && rhs.is_integer() {
                    Type::Int64
                } else {
                    self.operator_error(op, lhs, rhs, span)
                }
            }
            Power => {
                // The exponent drives a multiply loop and must be integral;
                // the result keeps the base operand's numeric type.
                if lhs.is_numeric() && rhs.is_integer() {
                    lhs.clone()
                } else {
                    self.operator_error(op, lhs, rhs, span)
                }
            }
            Eq | NotEq | Less | LessEq | Greater | GreaterEq => {
                if lhs.comparable_with(rhs) {
                    Type::Bool
                } else {
                    self.operator_error(op, lhs, rhs, span)
                }
            }
            And | Or => {
                if truthy(lhs) && truthy(rhs) {
                    Type::Bool
                } else {
                    self.operator_error(op, lhs, rhs, span)
                }
            }
        }
    }

    fn operator_error(&mut self, op: BinaryOp, lhs: &Type, rhs: &Type, span: Span) -> Type {
        self.error(
            SemaErrorKind::Operator {
                op: op.to_string(),
                lhs: lhs.clone(),
                rhs: rhs.clone(),
            },
            span,
        );
        if op.is_comparison() || op.is_logical() {
            Type::Bool
        } else {
            Type::Int64
        }
    }

    fn check_unary(&mut self, op: UnaryOp, operand: &Type, span: Span) -> Type {
        match op {
            UnaryOp::Neg | UnaryOp::Pos => {
                if operand.is_numeric() {
                    operand.clone()
                } else {
                    self.error(
                        SemaErrorKind::UnaryOperator {
                            op: op.to_string().trim().to_string(),
                            operand: operand.clone(),
                        },
                        span,
                    );
                    Type::Int64
                }
            }
            UnaryOp::Not => {
                if truthy(operand) {
                    Type::Bool
                } else {
                    self.error(
                        SemaErrorKind::UnaryOperator {
                            op: "not".to_string(),
                            operand: operand.clone(),
                        },
                        span,
                    );
                    Type::Bool
                }
            }
        }
    }

    fn check_call(
        &mut self,
        callee: &str,
        args: &mut [Expr],
        span: Span,
        ctx: &mut Ctx,
    ) -> Type {
        let arg_types: Vec<Type> = args
            .iter_mut()
            .map(|arg| self.check_expr(arg, ctx))
            .collect();

        if let Some(sig) = self.functions.get(callee).cloned() {
            if arg_types.len() != sig.params.len() {
                self.error(
                    SemaErrorKind::ArityMismatch {
                        name: callee.to_string(),
                        expected: sig.params.len().to_string(),
                        found: arg_types.len(),
                    },
                    span,
                );
            } else {
                for ((param_name, param_ty), arg_ty) in sig.params.iter().zip(&arg_types) {
                    if !assignable(param_ty, arg_ty) {
                        self.error(
                            SemaErrorKind::Type(format!(
                                "argument '{param_name}' of '{callee}' expects {param_ty}, got {arg_ty}"
                            )),
                            span,
                        );
                    }
                }
            }
            // Forward calls to single-expression functions that have not been
            // inferred yet fall back to the erased machine type.
            return match sig.return_type {
                Type::Unknown => Type::Int64,
                ty => ty,
            };
        }

        if let Some(builtin) = BuiltinFunction::from_name(callee) {
            return self.check_builtin_call(builtin, &arg_types, span);
        }

        self.error(
            SemaErrorKind::UnknownFunction {
                name: callee.to_string(),
            },
            span,
        );
        Type::Int64
    }

    fn check_builtin_call(
        &mut self,
        builtin: BuiltinFunction,
        args: &[Type],
        span: Span,
    ) -> Type {
        use BuiltinFunction::*;

        let (min, max) = builtin.arity();
        if args.len() < min || args.len() > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{min} to {max}")
            };
            self.error(
                SemaErrorKind::ArityMismatch {
                    name: builtin.name().to_string(),
                    expected,
                    found: args.len(),
                },
                span,
            );
            return builtin_fallback_type(builtin);
        }

        let expect = |analyzer: &mut Self, index: usize, ok: bool, wanted: &str| {
            if !ok {
                analyzer.error(
                    SemaErrorKind::Type(format!(
                        "argument {} of '{}' must be {}, got {}",
                        index + 1,
                        builtin.name(),
                        wanted,
                        args[index]
                    )),
                    span,
                );
            }
        };

        match builtin {
            Print => {
                expect(self, 0, args[0] != Type::Void, "a printable value");
                Type::Void
            }
            Len => {
                expect(
                    self,
                    0,
                    matches!(args[0], Type::List | Type::Dict | Type::Range | Type::String),
                    "a list, dict, range or string",
                );
                Type::Int64
            }
            Range => {
                for (index, arg) in args.iter().enumerate() {
                    expect(self, index, arg.is_integer(), "an integer");
                }
                Type::Range
            }
            Str => {
                expect(
                    self,
                    0,
                    args[0].is_numeric() || matches!(args[0], Type::Bool | Type::String),
                    "a number, bool or string",
                );
                Type::String
            }
            Int => {
                expect(
                    self,
                    0,
                    args[0].is_numeric() || matches!(args[0], Type::Bool | Type::String),
                    "a number, bool or string",
                );
                Type::Int64
            }
            Float => {
                expect(
                    self,
                    0,
                    args[0].is_numeric() || matches!(args[0], Type::Bool | Type::String),
                    "a number, bool or string",
                );
                Type::Float64
            }
            Bool => {
                expect(
                    self,
                    0,
                    args[0].is_numeric() || args[0] == Type::Bool,
                    "a number or bool",
                );
                Type::Bool
            }
            Input => {
                if !args.is_empty() {
                    expect(self, 0, args[0] == Type::String, "a string prompt");
                }
                Type::String
            }
            Append => {
                expect(self, 0, args[0] == Type::List, "a list");
                expect(self, 1, args[1] != Type::Void, "a storable value");
                Type::Void
            }
            Pop => {
                if args.len() == 1 {
                    expect(self, 0, args[0] == Type::List, "a list");
                } else {
                    expect(self, 0, args[0] == Type::Dict, "a dict");
                    expect(
                        self,
                        1,
                        args[1].is_integer() || args[1] == Type::String,
                        "an integer or string key",
                    );
                    if args.len() == 3 {
                        expect(self, 2, args[2] != Type::Void, "a storable default");
                    }
                }
                Type::Int64
            }
            Insert => {
                expect(self, 0, args[0] == Type::List, "a list");
                expect(self, 1, args[1].is_integer(), "an integer index");
                expect(self, 2, args[2] != Type::Void, "a storable value");
                Type::Void
            }
            Extend => {
                expect(self, 0, args[0] == Type::List, "a list");
                expect(self, 1, args[1] == Type::List, "a list");
                Type::Void
            }
            Concat => {
                expect(self, 0, args[0] == Type::List, "a list");
                expect(self, 1, args[1] == Type::List, "a list");
                Type::List
            }
            Repeat => {
                expect(self, 0, args[0] == Type::List, "a list");
                expect(self, 1, args[1].is_integer(), "an integer count");
                Type::List
            }
            ToList => {
                expect(self, 0, args[0] == Type::Range, "a range");
                Type::List
            }
            Keys | Values | Items => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                Type::List
            }
            Contains => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                expect(
                    self,
                    1,
                    args[1].is_integer() || args[1] == Type::String,
                    "an integer or string key",
                );
                Type::Bool
            }
            Delete => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                expect(
                    self,
                    1,
                    args[1].is_integer() || args[1] == Type::String,
                    "an integer or string key",
                );
                Type::Void
            }
            Clear => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                Type::Void
            }
            Update => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                expect(self, 1, args[1] == Type::Dict, "a dict");
                Type::Void
            }
            Get => {
                expect(self, 0, args[0] == Type::Dict, "a dict");
                expect(
                    self,
                    1,
                    args[1].is_integer() || args[1] == Type::String,
                    "an integer or string key",
                );
                Type::Int64
            }
        }
    }

    fn error(&mut self, kind: SemaErrorKind, span: Span) {
        self.errors.push(SemaError::new(kind, span));
    }
}

fn builtin_fallback_type(builtin: BuiltinFunction) -> Type {
    use BuiltinFunction::*;
    match builtin {
        Print | Append | Insert | Extend | Delete | Clear | Update => Type::Void,
        Str | Input => Type::String,
        Float => Type::Float64,
        Bool | Contains => Type::Bool,
        Range => Type::Range,
        Concat | Repeat | ToList | Keys | Values | Items => Type::List,
        Len | Int | Pop | Get => Type::Int64,
    }
}

/// Whether `value_ty` may initialize or be passed where `target` is expected.
fn assignable(target: &Type, value_ty: &Type) -> bool {
    if target == value_ty {
        return true;
    }
    if target.is_integer() && value_ty.is_integer() {
        return true;
    }
    if target.is_float() && value_ty.is_numeric() {
        return true;
    }
    false
}

fn truthy(ty: &Type) -> bool {
    *ty == Type::Bool || ty.is_integer()
}

/// Kinds whose bindings follow the runtime retain/release discipline.
pub fn refcounted(ty: &Type) -> bool {
    matches!(ty, Type::List | Type::Dict | Type::Range)
}

fn collect_global_decls(statements: &[Stmt], names: &mut HashSet<String>) {
    for stmt in statements {
        collect_global_decls_stmt(stmt, names);
    }
}

fn collect_global_decls_stmt(stmt: &Stmt, names: &mut HashSet<String>) {
    match &stmt.kind {
        StmtKind::Global(declared) => {
            names.extend(declared.iter().cloned());
        }
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_global_decls_stmt(then_branch, names);
            if let Some(else_branch) = else_branch {
                collect_global_decls_stmt(else_branch, names);
            }
        }
        StmtKind::While { body, .. } | StmtKind::ForIn { body, .. } => {
            collect_global_decls_stmt(body, names);
        }
        StmtKind::Block(inner) => collect_global_decls(inner, names),
        _ => {}
    }
}

/// Pass 1 of scope resolution: every name assigned in the body (plus loop
/// variables and `local` declarations) becomes a candidate function-local.
fn collect_assigned_names(statements: &[Stmt], names: &mut Vec<String>) {
    for stmt in statements {
        collect_assigned_names_stmt(stmt, names);
    }
}

fn collect_assigned_names_stmt(stmt: &Stmt, names: &mut Vec<String>) {
    fn push(name: &str, names: &mut Vec<String>) {
        if !names.iter().any(|existing| existing == name) {
            names.push(name.to_string());
        }
    }
    match &stmt.kind {
        StmtKind::VarDecl { name, .. } => push(name, names),
        StmtKind::TupleAssign { targets, .. } => {
            for target in targets {
                if let ExprKind::Identifier(name) = &target.kind {
                    push(name, names);
                }
            }
        }
        StmtKind::ForIn { variable, body, .. } => {
            push(variable, names);
            collect_assigned_names_stmt(body, names);
        }
        StmtKind::Local(declared) => {
            for name in declared {
                push(name, names);
            }
        }
        StmtKind::If {
            then_branch,
            else_branch,
            ..
        } => {
            collect_assigned_names_stmt(then_branch, names);
            if let Some(else_branch) = else_branch {
                collect_assigned_names_stmt(else_branch, names);
            }
        }
        StmtKind::While { body, .. } => {
            collect_assigned_names_stmt(body, names);
        }
        StmtKind::Block(inner) => collect_assigned_names(inner, names),
        _ => {}
    }
}

/// Checks a parsed program, returning the analysis facts for codegen.
pub fn check_program(program: &mut Program) -> Result<Analysis, Vec<SemaError>> {
    Analyzer::new().check(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::parse_tokens;
    use indoc::indoc;

    fn analyze(source: &str) -> (Program, Result<Analysis, Vec<SemaError>>) {
        let tokens = tokenize(source).expect("tokenize should succeed");
        let mut program = parse_tokens(tokens).expect("parse should succeed");
        let result = check_program(&mut program);
        (program, result)
    }

    fn analyze_ok(source: &str) -> (Program, Analysis) {
        let (program, result) = analyze(source);
        let analysis = result.expect("analysis should succeed");
        (program, analysis)
    }

    fn analyze_errors(source: &str) -> Vec<SemaError> {
        let (_, result) = analyze(source);
        result.expect_err("expected analysis errors")
    }

    fn assert_no_unknown(expr: &Expr) {
        assert!(!expr.ty.is_unknown(), "expression left unknown: {expr:?}");
        match &expr.kind {
            ExprKind::Binary { left, right, .. } => {
                assert_no_unknown(left);
                assert_no_unknown(right);
            }
            ExprKind::Unary { operand, .. } => assert_no_unknown(operand),
            ExprKind::Call { args, .. } => args.iter().for_each(assert_no_unknown),
            ExprKind::Index { object, index } => {
                assert_no_unknown(object);
                assert_no_unknown(index);
            }
            ExprKind::List(items) | ExprKind::Tuple(items) => {
                items.iter().for_each(assert_no_unknown)
            }
            ExprKind::Dict(pairs) => pairs.iter().for_each(|(k, v)| {
                assert_no_unknown(k);
                assert_no_unknown(v);
            }),
            _ => {}
        }
    }

    fn walk_exprs(stmt: &Stmt, check: &impl Fn(&Expr)) {
        match &stmt.kind {
            StmtKind::VarDecl { init, .. } => check(init),
            StmtKind::IndexAssign {
                object,
                index,
                value,
            } => {
                check(object);
                check(index);
                check(value);
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                check(condition);
                walk_exprs(then_branch, check);
                if let Some(else_branch) = else_branch {
                    walk_exprs(else_branch, check);
                }
            }
            StmtKind::While { condition, body } => {
                check(condition);
                walk_exprs(body, check);
            }
            StmtKind::ForIn { iterable, body, .. } => {
                check(iterable);
                walk_exprs(body, check);
            }
            StmtKind::Return(Some(value)) => check(value),
            StmtKind::Block(inner) => inner.iter().for_each(|s| walk_exprs(s, check)),
            StmtKind::Function(func) => match &func.body {
                FunctionBody::Block(body) => body.iter().for_each(|s| walk_exprs(s, check)),
                FunctionBody::Expr(expr) => check(expr),
            },
            StmtKind::Expression(expr) => check(expr),
            _ => {}
        }
    }

    #[test]
    fn types_cover_all_expressions_after_checking() {
        let source = indoc! {r#"
            fn add(a int, b int) -> int { return a + b }
            fn main() {
                xs = [1, 2, 3]
                d = {"x": 1}
                total = 0
                for i in range(0, len(xs)) {
                    total += xs[i]
                }
                out(add(total, d["x"]))
            }
            main()
        "#};
        let (program, _) = analyze_ok(source);
        for stmt in &program.statements {
            walk_exprs(stmt, &assert_no_unknown);
        }
    }

    #[test]
    fn infers_variable_types_from_initializers() {
        let (_, analysis) = analyze_ok(indoc! {"
            fn main() {
                a = 1
                b = 2.5
                c = \"hi\"
                d = [1]
            }
        "});
        let info = &analysis.functions["main"];
        let types: HashMap<_, _> = info.locals.iter().cloned().collect();
        assert_eq!(types["a"], Type::Int64);
        assert_eq!(types["b"], Type::Float64);
        assert_eq!(types["c"], Type::String);
        assert_eq!(types["d"], Type::List);
    }

    #[test]
    fn mixed_arithmetic_widens_to_float() {
        let (program, _) = analyze_ok("x = 1 + 2.5");
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(init.ty, Type::Float64);
    }

    #[test]
    fn string_concatenation_types_as_string() {
        let (program, _) = analyze_ok(r#"x = "a" + "b""#);
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected declaration");
        };
        assert_eq!(init.ty, Type::String);
    }

    #[test]
    fn floor_div_requires_integers() {
        let errors = analyze_errors("x = 1.5 // 2");
        assert!(
            errors
                .iter()
                .any(|e| matches!(e.kind, SemaErrorKind::Operator { .. }))
        );
    }

    #[test]
    fn unknown_function_reports_name_and_line() {
        let errors = analyze_errors("fn main() {\n    bogus()\n}\n");
        let error = &errors[0];
        assert!(matches!(
            &error.kind,
            SemaErrorKind::UnknownFunction { name } if name == "bogus"
        ));
        assert_eq!(error.line, 2);
        assert!(error.to_string().contains("UnknownFunction"));
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let errors = analyze_errors(indoc! {"
            fn add(a int, b int) -> int { return a + b }
            fn main() { add(1) }
        "});
        assert!(
            errors
                .iter()
                .any(|e| matches!(e.kind, SemaErrorKind::ArityMismatch { .. }))
        );
    }

    #[test]
    fn return_and_break_placement_is_validated() {
        let errors = analyze_errors("return 1");
        assert!(
            errors
                .iter()
                .any(|e| e.kind == SemaErrorKind::ReturnOutsideFunction)
        );

        let errors = analyze_errors("fn main() { break }");
        assert!(
            errors
                .iter()
                .any(|e| matches!(e.kind, SemaErrorKind::BreakOutsideLoop { keyword: "break" }))
        );
    }

    #[test]
    fn explicit_types_pin_rebinding() {
        let errors = analyze_errors(indoc! {"
            fn main() {
                int a = 1
                a = \"text\"
            }
        "});
        assert!(
            errors
                .iter()
                .any(|e| matches!(e.kind, SemaErrorKind::Type(_)))
        );

        // Inferred bindings may retype between non-refcounted kinds.
        analyze_ok(indoc! {"
            fn main() {
                a = 1
                a = \"text\"
            }
        "});
    }

    #[test]
    fn global_statement_routes_assignment_to_root() {
        let (_, analysis) = analyze_ok(indoc! {"
            counter = 0
            fn bump() {
                global counter
                counter += 1
            }
            bump()
        "});
        assert_eq!(analysis.globals, vec![("counter".to_string(), Type::Int64)]);
        let info = &analysis.functions["bump"];
        assert!(info.locals.is_empty());
        assert!(info.global_refs.contains("counter"));
    }

    #[test]
    fn unresolved_name_is_a_scope_error() {
        let errors = analyze_errors("fn main() { out(missing) }");
        assert!(
            errors
                .iter()
                .any(|e| matches!(&e.kind, SemaErrorKind::Scope(_)))
        );
    }

    #[test]
    fn duplicate_functions_and_params_are_rejected() {
        let errors = analyze_errors(indoc! {"
            fn f() { pass }
            fn f() { pass }
        "});
        assert!(errors.iter().any(|e| matches!(&e.kind, SemaErrorKind::Scope(_))));

        let errors = analyze_errors("fn g(a int, a int) { pass }");
        assert!(errors.iter().any(|e| matches!(&e.kind, SemaErrorKind::Scope(_))));
    }

    #[test]
    fn single_expression_function_infers_return_type() {
        let (_, analysis) = analyze_ok("fn double(x int) => x * 2");
        assert_eq!(analysis.functions["double"].return_type, Type::Int64);
    }

    #[test]
    fn enum_variants_become_integer_constants() {
        let (_, analysis) = analyze_ok(indoc! {"
            enum Color { Red, Green = 5, Blue }
            fn main() { out(Blue) }
        "});
        assert_eq!(analysis.enum_constants["Red"], 0);
        assert_eq!(analysis.enum_constants["Green"], 5);
        assert_eq!(analysis.enum_constants["Blue"], 6);
    }

    #[test]
    fn for_in_requires_iterable() {
        let errors = analyze_errors("fn main() { for i in 5 { pass } }");
        assert!(errors.iter().any(|e| matches!(&e.kind, SemaErrorKind::Type(_))));
    }

    #[test]
    fn tuple_swap_checks_and_counts() {
        analyze_ok(indoc! {"
            fn main() {
                a = 1
                b = 2
                (a, b) = (b, a)
            }
        "});
        let errors = analyze_errors(indoc! {"
            fn main() {
                (a, b) = (1, 2, 3)
            }
        "});
        assert!(errors.iter().any(|e| matches!(&e.kind, SemaErrorKind::Type(_))));
    }

    #[test]
    fn errors_keep_collecting_after_first() {
        let errors = analyze_errors(indoc! {"
            fn main() {
                bogus()
                more_bogus()
                return 1
            }
        "});
        assert!(errors.len() >= 3);
    }
}
