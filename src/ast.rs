use std::fmt;

use crate::token::Span;
use crate::types::Type;

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    Function(FunctionDecl),
    /// Declares or rebinds a variable. Compound assignments are desugared
    /// into this form by the parser (`x += e` becomes `x = x + e`).
    VarDecl {
        name: String,
        declared: Type,
        explicit_type: bool,
        init: Expr,
    },
    IndexAssign {
        object: Expr,
        index: Expr,
        value: Expr,
    },
    TupleAssign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
    },
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    ForIn {
        variable: String,
        iterable: Expr,
        body: Box<Stmt>,
    },
    Return(Option<Expr>),
    Break,
    Continue,
    Pass,
    Block(Vec<Stmt>),
    Struct {
        name: String,
        fields: Vec<(String, Type)>,
    },
    Enum {
        name: String,
        values: Vec<(String, i64)>,
    },
    Global(Vec<String>),
    Local(Vec<String>),
    Expression(Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Type,
    pub body: FunctionBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    pub ty: Type,
    pub explicit_type: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FunctionBody {
    Block(Vec<Stmt>),
    /// Single-expression form `fn f(...) => expr`; the expression is the
    /// return value.
    Expr(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
    /// Filled by the analyzer; `Type::Unknown` until then.
    pub ty: Type,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self {
            kind,
            span,
            ty: Type::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Identifier(String),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Tuple(Vec<Expr>),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    FloorDiv,
    Power,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Less
                | BinaryOp::LessEq
                | BinaryOp::Greater
                | BinaryOp::GreaterEq
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::FloorDiv => "//",
            BinaryOp::Power => "**",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::Less => "<",
            BinaryOp::LessEq => "<=",
            BinaryOp::Greater => ">",
            BinaryOp::GreaterEq => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => f.write_str("-"),
            UnaryOp::Pos => f.write_str("+"),
            UnaryOp::Not => f.write_str("not "),
        }
    }
}

/// Source-form rendering, used by the `--ast` round-trip tests. Every
/// expression prints fully parenthesized so re-parsing preserves shape.
impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Int(value) => write!(f, "{value}"),
            ExprKind::Float(value) => {
                if value.fract() == 0.0 && value.is_finite() {
                    write!(f, "{value:.1}")
                } else {
                    write!(f, "{value}")
                }
            }
            ExprKind::Bool(value) => write!(f, "{}", if *value { "True" } else { "False" }),
            ExprKind::Str(value) => {
                write!(f, "\"")?;
                for c in value.chars() {
                    match c {
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\\' => write!(f, "\\\\")?,
                        '"' => write!(f, "\\\"")?,
                        other => write!(f, "{other}")?,
                    }
                }
                write!(f, "\"")
            }
            ExprKind::Identifier(name) => write!(f, "{name}"),
            ExprKind::Binary { left, op, right } => write!(f, "({left} {op} {right})"),
            ExprKind::Unary { op, operand } => write!(f, "({op}{operand})"),
            ExprKind::Call { callee, args } => {
                write!(f, "{callee}(")?;
                write_comma_separated(f, args)?;
                write!(f, ")")
            }
            ExprKind::Index { object, index } => write!(f, "{object}[{index}]"),
            ExprKind::Tuple(elements) => {
                write!(f, "(")?;
                write_comma_separated(f, elements)?;
                if elements.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
            ExprKind::List(elements) => {
                write!(f, "[")?;
                write_comma_separated(f, elements)?;
                write!(f, "]")
            }
            ExprKind::Dict(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {value}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn write_comma_separated(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

// Named types print as their bare name in source position; `Type`'s Display
// is for diagnostics.
fn type_source(ty: &Type) -> String {
    match ty {
        Type::Struct(name) | Type::Enum(name) => name.clone(),
        other => other.to_string(),
    }
}

/// Renders a program back into parseable source text.
pub fn to_source(program: &Program) -> String {
    let mut out = String::new();
    for stmt in &program.statements {
        write_stmt(&mut out, stmt, 0);
    }
    out
}

/// Renders an indented node-per-line tree of the program, used by `--ast`.
pub fn dump(program: &Program) -> String {
    let mut out = String::new();
    out.push_str("Program\n");
    for stmt in &program.statements {
        dump_stmt(&mut out, stmt, 1);
    }
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    indent(out, depth);
    match &stmt.kind {
        StmtKind::Function(func) => {
            out.push_str(&format!("fn {}(", func.name));
            for (i, param) in func.params.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&param.name);
                if param.explicit_type {
                    out.push_str(&format!(" {}", type_source(&param.ty)));
                }
            }
            out.push(')');
            if func.return_type != Type::Void {
                out.push_str(&format!(" -> {}", type_source(&func.return_type)));
            }
            match &func.body {
                FunctionBody::Expr(expr) => out.push_str(&format!(" => {expr}\n")),
                FunctionBody::Block(body) => {
                    out.push_str(" {\n");
                    for inner in body {
                        write_stmt(out, inner, depth + 1);
                    }
                    indent(out, depth);
                    out.push_str("}\n");
                }
            }
        }
        StmtKind::VarDecl {
            name,
            declared,
            explicit_type,
            init,
        } => {
            if *explicit_type {
                out.push_str(&format!("{} {} = {}\n", name, type_source(declared), init));
            } else {
                out.push_str(&format!("{name} = {init}\n"));
            }
        }
        StmtKind::IndexAssign {
            object,
            index,
            value,
        } => out.push_str(&format!("{object}[{index}] = {value}\n")),
        StmtKind::TupleAssign { targets, values } => {
            out.push('(');
            for (i, target) in targets.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&target.to_string());
            }
            out.push_str(") = (");
            for (i, value) in values.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&value.to_string());
            }
            out.push_str(")\n");
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            out.push_str(&format!("if {condition} {{\n"));
            write_branch(out, then_branch, depth);
            indent(out, depth);
            out.push_str("}\n");
            if let Some(else_branch) = else_branch {
                indent(out, depth);
                out.push_str("else {\n");
                write_branch(out, else_branch, depth);
                indent(out, depth);
                out.push_str("}\n");
            }
        }
        StmtKind::While { condition, body } => {
            out.push_str(&format!("while {condition} {{\n"));
            write_branch(out, body, depth);
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::ForIn {
            variable,
            iterable,
            body,
        } => {
            out.push_str(&format!("for {variable} in {iterable} {{\n"));
            write_branch(out, body, depth);
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Return(value) => match value {
            Some(value) => out.push_str(&format!("return {value}\n")),
            None => out.push_str("return\n"),
        },
        StmtKind::Break => out.push_str("break\n"),
        StmtKind::Continue => out.push_str("continue\n"),
        StmtKind::Pass => out.push_str("pass\n"),
        StmtKind::Block(statements) => {
            out.push_str("{\n");
            for inner in statements {
                write_stmt(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Struct { name, fields } => {
            out.push_str(&format!("struct {name} {{\n"));
            for (field, ty) in fields {
                indent(out, depth + 1);
                out.push_str(&format!("{} {}\n", field, type_source(ty)));
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Enum { name, values } => {
            out.push_str(&format!("enum {name} {{\n"));
            for (value_name, value) in values {
                indent(out, depth + 1);
                out.push_str(&format!("{value_name} = {value}\n"));
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        StmtKind::Global(names) => out.push_str(&format!("global {}\n", names.join(", "))),
        StmtKind::Local(names) => out.push_str(&format!("local {}\n", names.join(", "))),
        StmtKind::Expression(expr) => out.push_str(&format!("{expr}\n")),
    }
}

// Branch bodies print their statements directly; a nested Block would
// otherwise round-trip into an extra brace level.
fn write_branch(out: &mut String, branch: &Stmt, depth: usize) {
    match &branch.kind {
        StmtKind::Block(statements) => {
            for inner in statements {
                write_stmt(out, inner, depth + 1);
            }
        }
        _ => write_stmt(out, branch, depth + 1),
    }
}

fn dump_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    indent(out, depth);
    match &stmt.kind {
        StmtKind::Function(func) => {
            out.push_str(&format!(
                "FunctionDeclaration {} -> {}\n",
                func.name, func.return_type
            ));
            for param in &func.params {
                indent(out, depth + 1);
                out.push_str(&format!("Param {} {}\n", param.name, param.ty));
            }
            match &func.body {
                FunctionBody::Expr(expr) => {
                    indent(out, depth + 1);
                    out.push_str("ExprBody\n");
                    dump_expr(out, expr, depth + 2);
                }
                FunctionBody::Block(body) => {
                    for inner in body {
                        dump_stmt(out, inner, depth + 1);
                    }
                }
            }
        }
        StmtKind::VarDecl {
            name,
            declared,
            explicit_type,
            init,
        } => {
            let marker = if *explicit_type { " (explicit)" } else { "" };
            out.push_str(&format!("VariableDeclaration {name} {declared}{marker}\n"));
            dump_expr(out, init, depth + 1);
        }
        StmtKind::IndexAssign {
            object,
            index,
            value,
        } => {
            out.push_str("IndexAssignment\n");
            dump_expr(out, object, depth + 1);
            dump_expr(out, index, depth + 1);
            dump_expr(out, value, depth + 1);
        }
        StmtKind::TupleAssign { targets, values } => {
            out.push_str("TupleAssignment\n");
            for target in targets {
                dump_expr(out, target, depth + 1);
            }
            indent(out, depth + 1);
            out.push_str("=\n");
            for value in values {
                dump_expr(out, value, depth + 1);
            }
        }
        StmtKind::If {
            condition,
            then_branch,
            else_branch,
        } => {
            out.push_str("If\n");
            dump_expr(out, condition, depth + 1);
            dump_stmt(out, then_branch, depth + 1);
            if let Some(else_branch) = else_branch {
                indent(out, depth);
                out.push_str("Else\n");
                dump_stmt(out, else_branch, depth + 1);
            }
        }
        StmtKind::While { condition, body } => {
            out.push_str("While\n");
            dump_expr(out, condition, depth + 1);
            dump_stmt(out, body, depth + 1);
        }
        StmtKind::ForIn {
            variable,
            iterable,
            body,
        } => {
            out.push_str(&format!("ForIn {variable}\n"));
            dump_expr(out, iterable, depth + 1);
            dump_stmt(out, body, depth + 1);
        }
        StmtKind::Return(value) => {
            out.push_str("Return\n");
            if let Some(value) = value {
                dump_expr(out, value, depth + 1);
            }
        }
        StmtKind::Break => out.push_str("Break\n"),
        StmtKind::Continue => out.push_str("Continue\n"),
        StmtKind::Pass => out.push_str("Pass\n"),
        StmtKind::Block(statements) => {
            out.push_str("Block\n");
            for inner in statements {
                dump_stmt(out, inner, depth + 1);
            }
        }
        StmtKind::Struct { name, fields } => {
            out.push_str(&format!("StructDeclaration {name}\n"));
            for (field, ty) in fields {
                indent(out, depth + 1);
                out.push_str(&format!("Field {field} {ty}\n"));
            }
        }
        StmtKind::Enum { name, values } => {
            out.push_str(&format!("EnumDeclaration {name}\n"));
            for (value_name, value) in values {
                indent(out, depth + 1);
                out.push_str(&format!("Value {value_name} = {value}\n"));
            }
        }
        StmtKind::Global(names) => out.push_str(&format!("Global {}\n", names.join(", "))),
        StmtKind::Local(names) => out.push_str(&format!("Local {}\n", names.join(", "))),
        StmtKind::Expression(expr) => {
            out.push_str("ExpressionStatement\n");
            dump_expr(out, expr, depth + 1);
        }
    }
}

fn dump_expr(out: &mut String, expr: &Expr, depth: usize) {
    indent(out, depth);
    match &expr.kind {
        ExprKind::Int(value) => out.push_str(&format!("IntLiteral {value}\n")),
        ExprKind::Float(value) => out.push_str(&format!("FloatLiteral {value}\n")),
        ExprKind::Bool(value) => out.push_str(&format!("BoolLiteral {value}\n")),
        ExprKind::Str(value) => out.push_str(&format!("StringLiteral {value:?}\n")),
        ExprKind::Identifier(name) => out.push_str(&format!("Identifier {name}\n")),
        ExprKind::Binary { left, op, right } => {
            out.push_str(&format!("Binary {op}\n"));
            dump_expr(out, left, depth + 1);
            dump_expr(out, right, depth + 1);
        }
        ExprKind::Unary { op, operand } => {
            out.push_str(&format!("Unary {}\n", op.to_string().trim_end()));
            dump_expr(out, operand, depth + 1);
        }
        ExprKind::Call { callee, args } => {
            out.push_str(&format!("FunctionCall {callee}\n"));
            for arg in args {
                dump_expr(out, arg, depth + 1);
            }
        }
        ExprKind::Index { object, index } => {
            out.push_str("Index\n");
            dump_expr(out, object, depth + 1);
            dump_expr(out, index, depth + 1);
        }
        ExprKind::Tuple(elements) => {
            out.push_str("Tuple\n");
            for element in elements {
                dump_expr(out, element, depth + 1);
            }
        }
        ExprKind::List(elements) => {
            out.push_str("ListLiteral\n");
            for element in elements {
                dump_expr(out, element, depth + 1);
            }
        }
        ExprKind::Dict(pairs) => {
            out.push_str("DictLiteral\n");
            for (key, value) in pairs {
                dump_expr(out, key, depth + 1);
                dump_expr(out, value, depth + 1);
            }
        }
    }
}
