#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl Span {
    pub fn new(start: usize, end: usize, line: usize, column: usize) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }

    /// Combines two spans into one covering both, anchored at `self`.
    pub fn to(self, end: Span) -> Span {
        Span {
            start: self.start,
            end: end.end,
            line: self.line,
            column: self.column,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    Identifier(&'a str),
    Int(i64),
    Float(f64),
    // Owned because escape sequences are resolved during lexing.
    Str(String),
    True,
    False,

    // Keywords
    Fn,
    If,
    Elif,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    Pass,
    Global,
    Local,
    Struct,
    Enum,
    And,
    Or,
    Not,

    // Type keywords
    IntType,
    Int64Type,
    Float32Type,
    Float64Type,
    StringType,
    BoolType,
    VoidType,
    ListType,
    DictType,
    RangeType,

    // Operators
    Assign,        // =
    PlusAssign,    // +=
    MinusAssign,   // -=
    StarAssign,    // *=
    SlashAssign,   // /=
    PercentAssign, // %=
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Power,    // **
    FloorDiv, // //
    EqEq,     // ==
    NotEq,    // !=
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Arrow,    // ->
    FatArrow, // =>

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,

    // Structural
    Newline,
    Eof,
}

impl TokenKind<'_> {
    /// Short description used in parser error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Identifier(name) => format!("identifier '{name}'"),
            TokenKind::Int(value) => format!("integer {value}"),
            TokenKind::Float(value) => format!("float {value}"),
            TokenKind::Str(_) => "string literal".to_string(),
            TokenKind::Newline => "newline".to_string(),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("'{}'", other.lexeme()),
        }
    }

    fn lexeme(&self) -> &'static str {
        match self {
            TokenKind::True => "True",
            TokenKind::False => "False",
            TokenKind::Fn => "fn",
            TokenKind::If => "if",
            TokenKind::Elif => "elif",
            TokenKind::Else => "else",
            TokenKind::While => "while",
            TokenKind::For => "for",
            TokenKind::In => "in",
            TokenKind::Return => "return",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::Pass => "pass",
            TokenKind::Global => "global",
            TokenKind::Local => "local",
            TokenKind::Struct => "struct",
            TokenKind::Enum => "enum",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::IntType => "int",
            TokenKind::Int64Type => "int64",
            TokenKind::Float32Type => "float32",
            TokenKind::Float64Type => "float64",
            TokenKind::StringType => "string",
            TokenKind::BoolType => "bool",
            TokenKind::VoidType => "void",
            TokenKind::ListType => "list",
            TokenKind::DictType => "dict",
            TokenKind::RangeType => "range",
            TokenKind::Assign => "=",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::PercentAssign => "%=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::Power => "**",
            TokenKind::FloorDiv => "//",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Less => "<",
            TokenKind::LessEq => "<=",
            TokenKind::Greater => ">",
            TokenKind::GreaterEq => ">=",
            TokenKind::Arrow => "->",
            TokenKind::FatArrow => "=>",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            _ => "?",
        }
    }

    pub fn is_type_keyword(&self) -> bool {
        matches!(
            self,
            TokenKind::IntType
                | TokenKind::Int64Type
                | TokenKind::Float32Type
                | TokenKind::Float64Type
                | TokenKind::StringType
                | TokenKind::BoolType
                | TokenKind::VoidType
                | TokenKind::ListType
                | TokenKind::DictType
                | TokenKind::RangeType
        )
    }

    pub fn is_compound_assign(&self) -> bool {
        matches!(
            self,
            TokenKind::PlusAssign
                | TokenKind::MinusAssign
                | TokenKind::StarAssign
                | TokenKind::SlashAssign
                | TokenKind::PercentAssign
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

impl<'a> Token<'a> {
    pub fn new(kind: TokenKind<'a>, span: Span) -> Self {
        Self { kind, span }
    }

    pub fn span(&self) -> Span {
        self.span
    }
}

pub static KEYWORDS: phf::Map<&'static str, TokenKind<'static>> = phf::phf_map! {
    "fn" => TokenKind::Fn,
    "if" => TokenKind::If,
    "elif" => TokenKind::Elif,
    "else" => TokenKind::Else,
    "while" => TokenKind::While,
    "for" => TokenKind::For,
    "in" => TokenKind::In,
    "return" => TokenKind::Return,
    "break" => TokenKind::Break,
    "continue" => TokenKind::Continue,
    "pass" => TokenKind::Pass,
    "global" => TokenKind::Global,
    "local" => TokenKind::Local,
    "struct" => TokenKind::Struct,
    "enum" => TokenKind::Enum,
    "and" => TokenKind::And,
    "or" => TokenKind::Or,
    "not" => TokenKind::Not,
    "True" => TokenKind::True,
    "False" => TokenKind::False,
    "int" => TokenKind::IntType,
    "int64" => TokenKind::Int64Type,
    "float32" => TokenKind::Float32Type,
    "float64" => TokenKind::Float64Type,
    "string" => TokenKind::StringType,
    "bool" => TokenKind::BoolType,
    "void" => TokenKind::VoidType,
    "list" => TokenKind::ListType,
    "dict" => TokenKind::DictType,
    "range" => TokenKind::RangeType,
};
