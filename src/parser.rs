use std::fmt;

use thiserror::Error;

use crate::ast::{
    BinaryOp, Expr, ExprKind, FunctionBody, FunctionDecl, Param, Program, Stmt, StmtKind, UnaryOp,
};
use crate::token::{Span, Token, TokenKind};
use crate::types::Type;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseErrorKind {
    #[error("Expected {expected}, got {found}")]
    Unexpected { expected: String, found: String },
    #[error("Unexpected token in expression: {found}")]
    UnexpectedExpressionToken { found: String },
    #[error("Invalid variable declaration syntax")]
    InvalidDeclaration,
    #[error("Compound assignment is only supported for simple variables")]
    CompoundAssignTarget,
    #[error("Assignment target must be an identifier or an index expression")]
    InvalidAssignTarget,
    #[error("Expected 'in' after variable in for-in loop; C-style for loops are not supported")]
    CStyleFor,
    #[error("Can only call named functions")]
    NonIdentifierCallTarget,
    #[error("Tuple assignment targets must be identifiers or index expressions")]
    InvalidTupleTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub line: usize,
    pub column: usize,
}

impl ParseError {
    fn new(kind: ParseErrorKind, span: Span) -> Self {
        Self {
            kind,
            line: span.line,
            column: span.column,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

impl std::error::Error for ParseError {}

type Result<T, E = ParseError> = std::result::Result<T, E>;

pub struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    errors: Vec<ParseError>,
}

impl<'a> Parser<'a> {
    pub fn new(mut tokens: Vec<Token<'a>>) -> Self {
        if tokens.is_empty() {
            tokens.push(Token::new(TokenKind::Eof, Span::default()));
        }
        Self {
            tokens,
            pos: 0,
            errors: Vec::new(),
        }
    }

    /// Parses the whole token stream. Parse errors do not abort: the parser
    /// records each one, skips to the next statement boundary, and resumes,
    /// so one compile reports every error it found.
    pub fn parse_program(mut self) -> Result<Program, Vec<ParseError>> {
        let mut statements = Vec::new();
        while !self.check(&TokenKind::Eof) {
            if self.consume_separators() {
                continue;
            }
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(error) => {
                    self.errors.push(error);
                    self.synchronize();
                }
            }
        }
        if self.errors.is_empty() {
            Ok(Program { statements })
        } else {
            Err(self.errors)
        }
    }

    fn parse_statement(&mut self) -> Result<Stmt> {
        let span = self.peek_span();
        match self.peek_kind() {
            TokenKind::Fn => self.parse_function(),
            TokenKind::Global => self.parse_global_or_local(true),
            TokenKind::Local => self.parse_global_or_local(false),
            TokenKind::Struct => self.parse_struct(),
            TokenKind::Enum => self.parse_enum(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                self.advance();
                self.consume_terminator();
                Ok(Stmt::new(StmtKind::Break, span))
            }
            TokenKind::Continue => {
                self.advance();
                self.consume_terminator();
                Ok(Stmt::new(StmtKind::Continue, span))
            }
            TokenKind::Pass => {
                self.advance();
                self.consume_terminator();
                Ok(Stmt::new(StmtKind::Pass, span))
            }
            TokenKind::LBrace => {
                let statements = self.parse_block_body()?;
                Ok(Stmt::new(StmtKind::Block(statements), span))
            }
            TokenKind::LParen => self.parse_tuple_assignment_or_expression(),
            _ => self.parse_declaration_or_expression(),
        }
    }

    fn parse_function(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::Fn, "'fn'")?.span();
        let name = self.expect_identifier("function name")?;
        self.expect(TokenKind::LParen, "'(' after function name")?;

        let mut params = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                let param_name = self.expect_identifier("parameter name")?;
                let (ty, explicit_type) = if self.matches(&TokenKind::Colon) {
                    (self.parse_type()?, true)
                } else if self.peek_kind().is_type_keyword()
                    || matches!(self.peek_kind(), TokenKind::Identifier(_))
                {
                    (self.parse_type()?, true)
                } else {
                    (Type::Unknown, false)
                };
                params.push(Param {
                    name: param_name,
                    ty,
                    explicit_type,
                });
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.expect(TokenKind::RParen, "')' after parameters")?;

        let return_type = if self.matches(&TokenKind::Arrow) {
            self.parse_type()?
        } else {
            Type::Void
        };

        let body = if self.matches(&TokenKind::FatArrow) {
            FunctionBody::Expr(Box::new(self.parse_expression()?))
        } else {
            FunctionBody::Block(self.parse_block_body()?)
        };

        self.consume_terminator();
        Ok(Stmt::new(
            StmtKind::Function(FunctionDecl {
                name,
                params,
                return_type,
                body,
            }),
            span,
        ))
    }

    /// `{ statement* }` with per-statement error recovery inside the block.
    fn parse_block_body(&mut self) -> Result<Vec<Stmt>> {
        self.expect(TokenKind::LBrace, "'{'")?;
        let mut statements = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.consume_separators() {
                continue;
            }
            match self.parse_statement() {
                Ok(stmt) => statements.push(stmt),
                Err(error) => {
                    self.errors.push(error);
                    self.synchronize();
                }
            }
        }
        self.expect(TokenKind::RBrace, "'}' after block")?;
        Ok(statements)
    }

    fn parse_global_or_local(&mut self, global: bool) -> Result<Stmt> {
        let span = self.advance().span();
        let mut names = Vec::new();
        loop {
            names.push(self.expect_identifier("variable name")?);
            if !self.matches(&TokenKind::Comma) {
                break;
            }
        }
        self.consume_terminator();
        let kind = if global {
            StmtKind::Global(names)
        } else {
            StmtKind::Local(names)
        };
        Ok(Stmt::new(kind, span))
    }

    fn parse_struct(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::Struct, "'struct'")?.span();
        let name = self.expect_identifier("struct name")?;
        self.expect(TokenKind::LBrace, "'{' after struct name")?;

        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.consume_separators() {
                continue;
            }
            let field_name = self.expect_identifier("field name")?;
            let field_type = self.parse_type()?;
            fields.push((field_name, field_type));
            self.consume_terminator();
        }
        self.expect(TokenKind::RBrace, "'}' after struct fields")?;
        Ok(Stmt::new(StmtKind::Struct { name, fields }, span))
    }

    fn parse_enum(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::Enum, "'enum'")?.span();
        let name = self.expect_identifier("enum name")?;
        self.expect(TokenKind::LBrace, "'{' after enum name")?;

        let mut values = Vec::new();
        let mut next_value = 0;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            if self.consume_separators() {
                continue;
            }
            let value_name = self.expect_identifier("enum value name")?;
            if self.matches(&TokenKind::Assign) {
                let token = self.advance();
                match token.kind {
                    TokenKind::Int(value) => next_value = value,
                    _ => {
                        return Err(self.error_at(
                            token.span(),
                            ParseErrorKind::Unexpected {
                                expected: "integer value".to_string(),
                                found: token.kind.describe(),
                            },
                        ));
                    }
                }
            }
            values.push((value_name, next_value));
            next_value += 1;
            if !self.check(&TokenKind::RBrace) {
                self.matches(&TokenKind::Comma);
                self.consume_separators();
            }
        }
        self.expect(TokenKind::RBrace, "'}' after enum values")?;
        Ok(Stmt::new(StmtKind::Enum { name, values }, span))
    }

    fn parse_if(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::If, "'if'")?.span();
        self.parse_if_tail(span)
    }

    /// Body of an `if`/`elif` whose keyword was already consumed. An `elif`
    /// parses as a nested `if` in the else branch.
    fn parse_if_tail(&mut self, span: Span) -> Result<Stmt> {
        let condition = self.parse_expression()?;
        let then_branch = Box::new(self.parse_statement()?);

        self.skip_newlines_before_else();
        let else_branch = if self.check(&TokenKind::Elif) {
            let elif_span = self.advance().span();
            Some(Box::new(self.parse_if_tail(elif_span)?))
        } else if self.matches(&TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(Stmt::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            span,
        ))
    }

    fn parse_while(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::While, "'while'")?.span();
        let condition = self.parse_expression()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::new(StmtKind::While { condition, body }, span))
    }

    fn parse_for(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::For, "'for'")?.span();
        let variable = self.expect_identifier("variable name after 'for'")?;
        if !self.matches(&TokenKind::In) {
            return Err(self.error_here(ParseErrorKind::CStyleFor));
        }
        let iterable = self.parse_expression()?;
        let body = Box::new(self.parse_statement()?);
        Ok(Stmt::new(
            StmtKind::ForIn {
                variable,
                iterable,
                body,
            },
            span,
        ))
    }

    fn parse_return(&mut self) -> Result<Stmt> {
        let span = self.expect(TokenKind::Return, "'return'")?.span();
        let value = if matches!(
            self.peek_kind(),
            TokenKind::Newline | TokenKind::Semicolon | TokenKind::RBrace | TokenKind::Eof
        ) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.consume_terminator();
        Ok(Stmt::new(StmtKind::Return(value), span))
    }

    /// `(a, b) = x, y` tuple assignment, or a plain expression statement that
    /// happens to start with '('.
    fn parse_tuple_assignment_or_expression(&mut self) -> Result<Stmt> {
        let span = self.peek_span();
        let expr = self.parse_expression()?;

        if self.peek_kind().is_compound_assign() {
            return Err(self.error_here(ParseErrorKind::CompoundAssignTarget));
        }
        if !self.matches(&TokenKind::Assign) {
            self.consume_terminator();
            return Ok(Stmt::new(StmtKind::Expression(expr), span));
        }

        let targets = match expr.kind {
            ExprKind::Tuple(elements) => elements,
            _ => vec![expr],
        };
        for target in &targets {
            if !matches!(
                target.kind,
                ExprKind::Identifier(_) | ExprKind::Index { .. }
            ) {
                return Err(ParseError::new(ParseErrorKind::InvalidTupleTarget, target.span));
            }
        }

        let rhs = self.parse_expression()?;
        let values = match rhs.kind {
            ExprKind::Tuple(elements) => elements,
            _ => vec![rhs],
        };
        self.consume_terminator();
        Ok(Stmt::new(StmtKind::TupleAssign { targets, values }, span))
    }

    /// Disambiguates the declaration forms (`a = e`, `int a = e`, `a int = e`,
    /// `a = int e`, compound assignments) from plain expression statements.
    fn parse_declaration_or_expression(&mut self) -> Result<Stmt> {
        let span = self.peek_span();

        if self.peek_kind().is_type_keyword()
            && matches!(self.peek_kind_at(1), TokenKind::Identifier(_))
        {
            // int a = expr
            let declared = self.parse_type()?;
            let name = self.expect_identifier("variable name after type")?;
            self.expect(TokenKind::Assign, "'=' in variable declaration")?;
            let init = self.parse_expression()?;
            self.consume_terminator();
            return Ok(Stmt::new(
                StmtKind::VarDecl {
                    name,
                    declared,
                    explicit_type: true,
                    init,
                },
                span,
            ));
        }

        if let TokenKind::Identifier(name) = self.peek_kind() {
            let name = name.to_string();
            let next = self.peek_kind_at(1).clone();
            match next {
                TokenKind::Assign => {
                    self.advance();
                    self.advance();
                    // a = type expr (type-ascribed RHS) or a = expr; a type
                    // keyword directly followed by '(' is a conversion call.
                    let (declared, explicit_type) = if self.peek_kind().is_type_keyword()
                        && !matches!(self.peek_kind_at(1), TokenKind::LParen)
                    {
                        (self.parse_type()?, true)
                    } else {
                        (Type::Unknown, false)
                    };
                    let init = self.parse_expression()?;
                    self.consume_terminator();
                    return Ok(Stmt::new(
                        StmtKind::VarDecl {
                            name,
                            declared,
                            explicit_type,
                            init,
                        },
                        span,
                    ));
                }
                kind if kind.is_compound_assign() => {
                    self.advance();
                    let op_token = self.advance();
                    let op = match op_token.kind {
                        TokenKind::PlusAssign => BinaryOp::Add,
                        TokenKind::MinusAssign => BinaryOp::Sub,
                        TokenKind::StarAssign => BinaryOp::Mul,
                        TokenKind::SlashAssign => BinaryOp::Div,
                        TokenKind::PercentAssign => BinaryOp::Mod,
                        _ => unreachable!("checked by is_compound_assign"),
                    };
                    // Desugars in place: x op= e becomes x = x op e.
                    let right = self.parse_expression()?;
                    let init_span = span.to(right.span);
                    let left = Expr::new(ExprKind::Identifier(name.clone()), span);
                    let init = Expr::new(
                        ExprKind::Binary {
                            left: Box::new(left),
                            op,
                            right: Box::new(right),
                        },
                        init_span,
                    );
                    self.consume_terminator();
                    return Ok(Stmt::new(
                        StmtKind::VarDecl {
                            name,
                            declared: Type::Unknown,
                            explicit_type: false,
                            init,
                        },
                        span,
                    ));
                }
                kind if kind.is_type_keyword() => {
                    // a int = expr
                    self.advance();
                    let declared = self.parse_type()?;
                    self.expect(TokenKind::Assign, "'=' after type in variable declaration")?;
                    let init = self.parse_expression()?;
                    self.consume_terminator();
                    return Ok(Stmt::new(
                        StmtKind::VarDecl {
                            name,
                            declared,
                            explicit_type: true,
                            init,
                        },
                        span,
                    ));
                }
                _ => {}
            }
        }

        // Expression statement; an index expression followed by '=' is an
        // index assignment.
        let expr = self.parse_expression()?;
        if self.peek_kind().is_compound_assign() {
            return Err(self.error_here(ParseErrorKind::CompoundAssignTarget));
        }
        if self.matches(&TokenKind::Assign) {
            match expr.kind {
                ExprKind::Index { object, index } => {
                    let value = self.parse_expression()?;
                    self.consume_terminator();
                    return Ok(Stmt::new(
                        StmtKind::IndexAssign {
                            object: *object,
                            index: *index,
                            value,
                        },
                        span,
                    ));
                }
                _ => return Err(ParseError::new(ParseErrorKind::InvalidAssignTarget, expr.span)),
            }
        }
        self.consume_terminator();
        Ok(Stmt::new(StmtKind::Expression(expr), span))
    }

    fn parse_type(&mut self) -> Result<Type> {
        let token = self.advance();
        let ty = match token.kind {
            TokenKind::IntType => Type::Int32,
            TokenKind::Int64Type => Type::Int64,
            TokenKind::Float32Type => Type::Float32,
            TokenKind::Float64Type => Type::Float64,
            TokenKind::StringType => Type::String,
            TokenKind::BoolType => Type::Bool,
            TokenKind::VoidType => Type::Void,
            TokenKind::ListType => Type::List,
            TokenKind::DictType => Type::Dict,
            TokenKind::RangeType => Type::Range,
            // Could name a struct or an enum; the analyzer resolves which.
            TokenKind::Identifier(name) => Type::Struct(name.to_string()),
            ref other => {
                return Err(self.error_at(
                    token.span(),
                    ParseErrorKind::Unexpected {
                        expected: "type".to_string(),
                        found: other.describe(),
                    },
                ));
            }
        };
        Ok(ty)
    }

    fn parse_expression(&mut self) -> Result<Expr> {
        self.parse_logical_or()
    }

    fn parse_logical_or(&mut self) -> Result<Expr> {
        let mut expr = self.parse_logical_and()?;
        while self.matches(&TokenKind::Or) {
            let right = self.parse_logical_and()?;
            expr = binary(expr, BinaryOp::Or, right);
        }
        Ok(expr)
    }

    fn parse_logical_and(&mut self) -> Result<Expr> {
        let mut expr = self.parse_equality()?;
        while self.matches(&TokenKind::And) {
            let right = self.parse_equality()?;
            expr = binary(expr, BinaryOp::And, right);
        }
        Ok(expr)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        let mut expr = self.parse_comparison()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let mut expr = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Less => BinaryOp::Less,
                TokenKind::LessEq => BinaryOp::LessEq,
                TokenKind::Greater => BinaryOp::Greater,
                TokenKind::GreaterEq => BinaryOp::GreaterEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_term()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut expr = self.parse_factor()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_factor()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn parse_factor(&mut self) -> Result<Expr> {
        let mut expr = self.parse_power()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                TokenKind::FloorDiv => BinaryOp::FloorDiv,
                _ => break,
            };
            self.advance();
            let right = self.parse_power()?;
            expr = binary(expr, op, right);
        }
        Ok(expr)
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let expr = self.parse_unary()?;
        if self.matches(&TokenKind::Power) {
            // Right-associative: a ** b ** c parses as a ** (b ** c).
            let right = self.parse_power()?;
            return Ok(binary(expr, BinaryOp::Power, right));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        let op = match self.peek_kind() {
            TokenKind::Not => UnaryOp::Not,
            TokenKind::Minus => UnaryOp::Neg,
            TokenKind::Plus => UnaryOp::Pos,
            _ => return self.parse_call(),
        };
        let span = self.advance().span();
        let operand = self.parse_unary()?;
        let full_span = span.to(operand.span);
        Ok(Expr::new(
            ExprKind::Unary {
                op,
                operand: Box::new(operand),
            },
            full_span,
        ))
    }

    fn parse_call(&mut self) -> Result<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.matches(&TokenKind::LParen) {
                let callee_span = expr.span;
                let ExprKind::Identifier(callee) = expr.kind else {
                    return Err(ParseError::new(
                        ParseErrorKind::NonIdentifierCallTarget,
                        callee_span,
                    ));
                };
                let mut args = Vec::new();
                self.skip_newlines();
                if !self.check(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.matches(&TokenKind::Comma) {
                            break;
                        }
                        self.skip_newlines();
                    }
                }
                self.skip_newlines();
                let close = self.expect(TokenKind::RParen, "')' after arguments")?;
                expr = Expr::new(
                    ExprKind::Call { callee, args },
                    callee_span.to(close.span()),
                );
            } else if self.matches(&TokenKind::LBracket) {
                let index = self.parse_expression()?;
                let close = self.expect(TokenKind::RBracket, "']' after index")?;
                let span = expr.span.to(close.span());
                expr = Expr::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    span,
                );
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        let token = self.advance();
        let span = token.span();
        let expr = match token.kind {
            TokenKind::Int(value) => Expr::new(ExprKind::Int(value), span),
            TokenKind::Float(value) => Expr::new(ExprKind::Float(value), span),
            TokenKind::True => Expr::new(ExprKind::Bool(true), span),
            TokenKind::False => Expr::new(ExprKind::Bool(false), span),
            TokenKind::Str(value) => Expr::new(ExprKind::Str(value), span),
            TokenKind::Identifier(name) => {
                Expr::new(ExprKind::Identifier(name.to_string()), span)
            }
            // Conversion builtins share spellings with type keywords; a type
            // keyword directly followed by '(' is a call to the builtin.
            TokenKind::IntType if self.check(&TokenKind::LParen) => {
                Expr::new(ExprKind::Identifier("int".to_string()), span)
            }
            TokenKind::Int64Type if self.check(&TokenKind::LParen) => {
                Expr::new(ExprKind::Identifier("int64".to_string()), span)
            }
            TokenKind::BoolType if self.check(&TokenKind::LParen) => {
                Expr::new(ExprKind::Identifier("bool".to_string()), span)
            }
            TokenKind::RangeType if self.check(&TokenKind::LParen) => {
                Expr::new(ExprKind::Identifier("range".to_string()), span)
            }
            TokenKind::LParen => return self.parse_paren_or_tuple(span),
            TokenKind::LBracket => return self.parse_list_literal(span),
            TokenKind::LBrace => return self.parse_dict_literal(span),
            other => {
                return Err(self.error_at(
                    span,
                    ParseErrorKind::UnexpectedExpressionToken {
                        found: other.describe(),
                    },
                ));
            }
        };
        Ok(expr)
    }

    /// Any comma inside parentheses promotes the production to a tuple
    /// literal; `(expr)` stays a plain grouping.
    fn parse_paren_or_tuple(&mut self, open: Span) -> Result<Expr> {
        self.skip_newlines();
        let first = self.parse_expression()?;

        if !self.check(&TokenKind::Comma) {
            self.expect(TokenKind::RParen, "')' after expression")?;
            return Ok(first);
        }

        let mut elements = vec![first];
        while self.matches(&TokenKind::Comma) {
            self.skip_newlines();
            if self.check(&TokenKind::RParen) {
                break; // trailing comma
            }
            elements.push(self.parse_expression()?);
        }
        let close = self.expect(TokenKind::RParen, "')' after tuple")?;
        Ok(Expr::new(ExprKind::Tuple(elements), open.to(close.span())))
    }

    fn parse_list_literal(&mut self, open: Span) -> Result<Expr> {
        let mut elements = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RBracket) {
            loop {
                elements.push(self.parse_expression()?);
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(&TokenKind::RBracket) {
                    break; // trailing comma
                }
            }
        }
        self.skip_newlines();
        let close = self.expect(TokenKind::RBracket, "']' after list elements")?;
        Ok(Expr::new(ExprKind::List(elements), open.to(close.span())))
    }

    fn parse_dict_literal(&mut self, open: Span) -> Result<Expr> {
        let mut pairs = Vec::new();
        self.skip_newlines();
        if !self.check(&TokenKind::RBrace) {
            loop {
                let key = self.parse_expression()?;
                self.expect(TokenKind::Colon, "':' after dictionary key")?;
                let value = self.parse_expression()?;
                pairs.push((key, value));
                if !self.matches(&TokenKind::Comma) {
                    break;
                }
                self.skip_newlines();
                if self.check(&TokenKind::RBrace) {
                    break; // trailing comma
                }
            }
        }
        self.skip_newlines();
        let close = self.expect(TokenKind::RBrace, "'}' after dictionary elements")?;
        Ok(Expr::new(ExprKind::Dict(pairs), open.to(close.span())))
    }
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token<'a> {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn peek_kind(&self) -> &TokenKind<'a> {
        &self.peek().kind
    }

    fn peek_kind_at(&self, offset: usize) -> &TokenKind<'a> {
        let index = (self.pos + offset).min(self.tokens.len() - 1);
        &self.tokens[index].kind
    }

    fn peek_span(&self) -> Span {
        self.peek().span()
    }

    fn advance(&mut self) -> Token<'a> {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind<'a>) -> bool {
        self.peek_kind() == kind
    }

    fn matches(&mut self, kind: &TokenKind<'a>) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: TokenKind<'a>, expected: &str) -> Result<Token<'a>> {
        if self.check(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(ParseErrorKind::Unexpected {
                expected: expected.to_string(),
                found: self.peek_kind().describe(),
            }))
        }
    }

    fn expect_identifier(&mut self, expected: &str) -> Result<String> {
        if let TokenKind::Identifier(name) = self.peek_kind() {
            let name = name.to_string();
            self.advance();
            Ok(name)
        } else {
            Err(self.error_here(ParseErrorKind::Unexpected {
                expected: expected.to_string(),
                found: self.peek_kind().describe(),
            }))
        }
    }

    fn consume_separators(&mut self) -> bool {
        let mut consumed = false;
        while matches!(self.peek_kind(), TokenKind::Newline | TokenKind::Semicolon) {
            consumed = true;
            self.advance();
        }
        consumed
    }

    fn consume_terminator(&mut self) {
        if !self.matches(&TokenKind::Newline) {
            self.matches(&TokenKind::Semicolon);
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.advance();
        }
    }

    /// `}` newline `else` is accepted: newlines are consumed only when the
    /// next meaningful token actually is `elif`/`else`.
    fn skip_newlines_before_else(&mut self) {
        let mut lookahead = self.pos;
        while lookahead < self.tokens.len()
            && matches!(self.tokens[lookahead].kind, TokenKind::Newline)
        {
            lookahead += 1;
        }
        if lookahead < self.tokens.len()
            && matches!(
                self.tokens[lookahead].kind,
                TokenKind::Elif | TokenKind::Else
            )
        {
            self.pos = lookahead;
        }
    }

    /// Skips to the next statement boundary after an error: past the next
    /// newline/semicolon, or up to a statement-starting keyword.
    fn synchronize(&mut self) {
        while !self.check(&TokenKind::Eof) {
            match self.peek_kind() {
                TokenKind::Newline | TokenKind::Semicolon => {
                    self.advance();
                    return;
                }
                TokenKind::Fn
                | TokenKind::Struct
                | TokenKind::Enum
                | TokenKind::Global
                | TokenKind::Local
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return
                | TokenKind::Break
                | TokenKind::Continue
                | TokenKind::Pass
                | TokenKind::RBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn error_here(&self, kind: ParseErrorKind) -> ParseError {
        self.error_at(self.peek_span(), kind)
    }

    fn error_at(&self, span: Span, kind: ParseErrorKind) -> ParseError {
        ParseError::new(kind, span)
    }
}

fn binary(left: Expr, op: BinaryOp, right: Expr) -> Expr {
    let span = left.span.to(right.span);
    Expr::new(
        ExprKind::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        },
        span,
    )
}

pub fn parse_tokens(tokens: Vec<Token<'_>>) -> Result<Program, Vec<ParseError>> {
    Parser::new(tokens).parse_program()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use indoc::indoc;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Program {
        let tokens = tokenize(source).expect("tokenize should succeed");
        parse_tokens(tokens).expect("parse should succeed")
    }

    fn parse_errors(source: &str) -> Vec<ParseError> {
        let tokens = tokenize(source).expect("tokenize should succeed");
        parse_tokens(tokens).expect_err("expected parse errors")
    }

    #[test]
    fn parses_function_with_params_and_return_type() {
        let program = parse("fn add(a int, b int) -> int { return a + b }");
        let StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function declaration");
        };
        assert_eq!(func.name, "add");
        assert_eq!(func.params.len(), 2);
        assert_eq!(func.params[0].ty, Type::Int32);
        assert!(func.params[0].explicit_type);
        assert_eq!(func.return_type, Type::Int32);
        let FunctionBody::Block(body) = &func.body else {
            panic!("expected block body");
        };
        assert!(matches!(body[0].kind, StmtKind::Return(Some(_))));
    }

    #[test]
    fn parses_single_expression_function() {
        let program = parse("fn double(x) => x * 2");
        let StmtKind::Function(func) = &program.statements[0].kind else {
            panic!("expected function declaration");
        };
        assert!(!func.params[0].explicit_type);
        assert!(matches!(func.body, FunctionBody::Expr(_)));
    }

    #[test]
    fn declaration_forms_are_equivalent() {
        for source in ["int a = 5", "a int = 5", "a = int 5"] {
            let program = parse(source);
            let StmtKind::VarDecl {
                name,
                declared,
                explicit_type,
                ..
            } = &program.statements[0].kind
            else {
                panic!("expected variable declaration for {source}");
            };
            assert_eq!(name, "a");
            assert_eq!(*declared, Type::Int32, "for {source}");
            assert!(explicit_type);
        }

        let program = parse("a = 5");
        let StmtKind::VarDecl {
            declared,
            explicit_type,
            ..
        } = &program.statements[0].kind
        else {
            panic!("expected variable declaration");
        };
        assert_eq!(*declared, Type::Unknown);
        assert!(!explicit_type);
    }

    #[test]
    fn compound_assignment_desugars() {
        let program = parse("x = 1\nx += 2\n");
        let StmtKind::VarDecl { init, .. } = &program.statements[1].kind else {
            panic!("expected variable declaration");
        };
        let ExprKind::Binary { left, op, right } = &init.kind else {
            panic!("expected desugared binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert_eq!(left.kind, ExprKind::Identifier("x".to_string()));
        assert_eq!(right.kind, ExprKind::Int(2));
    }

    #[test]
    fn compound_assignment_rejects_index_target() {
        let errors = parse_errors("a[0] += 1");
        assert!(
            errors
                .iter()
                .any(|e| e.kind == ParseErrorKind::CompoundAssignTarget)
        );
    }

    #[test]
    fn power_is_right_associative() {
        let program = parse("x = 2 ** 3 ** 2");
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected variable declaration");
        };
        let ExprKind::Binary { left, op, right } = &init.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Power);
        assert_eq!(left.kind, ExprKind::Int(2));
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::Power,
                ..
            }
        ));
    }

    #[test]
    fn precedence_orders_term_below_factor() {
        let program = parse("x = 1 + 2 * 3");
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected variable declaration");
        };
        let ExprKind::Binary { op, right, .. } = &init.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            ExprKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn elif_nests_in_else_branch() {
        let source = indoc! {"
            if a { pass }
            elif b { pass }
            else { pass }
        "};
        let program = parse(source);
        let StmtKind::If { else_branch, .. } = &program.statements[0].kind else {
            panic!("expected if");
        };
        let nested = else_branch.as_ref().expect("expected elif branch");
        let StmtKind::If {
            else_branch: inner_else,
            ..
        } = &nested.kind
        else {
            panic!("expected nested if for elif");
        };
        assert!(inner_else.is_some());
    }

    #[test]
    fn index_assignment_and_tuple_assignment() {
        let program = parse("d[\"k\"] = 2\n(a, b) = (b, a)\n");
        assert!(matches!(
            program.statements[0].kind,
            StmtKind::IndexAssign { .. }
        ));
        let StmtKind::TupleAssign { targets, values } = &program.statements[1].kind else {
            panic!("expected tuple assignment");
        };
        assert_eq!(targets.len(), 2);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn parenthesized_expression_is_not_a_tuple() {
        let program = parse("x = (1 + 2)");
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected variable declaration");
        };
        assert!(matches!(init.kind, ExprKind::Binary { .. }));

        let program = parse("x = (1,)");
        let StmtKind::VarDecl { init, .. } = &program.statements[0].kind else {
            panic!("expected variable declaration");
        };
        let ExprKind::Tuple(elements) = &init.kind else {
            panic!("expected single-element tuple");
        };
        assert_eq!(elements.len(), 1);
    }

    #[test]
    fn for_requires_in() {
        let errors = parse_errors("for i { pass }");
        assert!(errors.iter().any(|e| e.kind == ParseErrorKind::CStyleFor));
    }

    #[test]
    fn enum_values_auto_increment() {
        let program = parse("enum Color { Red, Green = 5, Blue }");
        let StmtKind::Enum { values, .. } = &program.statements[0].kind else {
            panic!("expected enum declaration");
        };
        assert_eq!(
            values,
            &vec![
                ("Red".to_string(), 0),
                ("Green".to_string(), 5),
                ("Blue".to_string(), 6)
            ]
        );
    }

    #[test]
    fn recovers_and_collects_multiple_errors() {
        let source = indoc! {"
            x = = 1
            y = 2
            fn f( { pass }
        "};
        let errors = parse_errors(source);
        assert!(errors.len() >= 2, "expected at least two errors: {errors:?}");
    }

    #[test]
    fn errors_carry_line_numbers() {
        let errors = parse_errors("x = 1\ny = = 2\n");
        assert_eq!(errors[0].line, 2);
    }

    #[test]
    fn struct_and_global_statements() {
        let source = indoc! {"
            struct Point {
                x int
                y int
            }
            global total, count
        "};
        let program = parse(source);
        let StmtKind::Struct { name, fields } = &program.statements[0].kind else {
            panic!("expected struct");
        };
        assert_eq!(name, "Point");
        assert_eq!(fields.len(), 2);
        let StmtKind::Global(names) = &program.statements[1].kind else {
            panic!("expected global");
        };
        assert_eq!(names, &vec!["total".to_string(), "count".to_string()]);
    }

    #[test]
    fn dump_round_trips_through_parser() {
        let source = indoc! {r#"
            fn fact(n int) -> int {
                if n <= 1 { return 1 }
                return n * fact(n - 1)
            }
            fn main() {
                xs = [1, 2, 3]
                d = {"x": 1}
                for i in range(0, len(xs)) {
                    out(xs[i])
                }
                out(fact(6))
            }
            main()
        "#};
        let first = parse(source);
        let printed = crate::ast::to_source(&first);
        let second = parse(&printed);
        let reprinted = crate::ast::to_source(&second);
        assert_eq!(printed, reprinted);
    }
}
