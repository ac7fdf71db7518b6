use thiserror::Error;

use crate::token::{KEYWORDS, Span, Token, TokenKind};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum LexError {
    #[error("Unexpected character '{character}' at line {line}, column {column}")]
    UnexpectedCharacter {
        character: char,
        line: usize,
        column: usize,
    },
    #[error("unterminated string at line {line}")]
    UnterminatedString { line: usize, column: usize },
    #[error("Unterminated block comment at line {line}, column {column}")]
    UnterminatedBlockComment { line: usize, column: usize },
    #[error("Invalid integer literal '{literal}' at line {line}, column {column}")]
    InvalidIntegerLiteral {
        literal: String,
        line: usize,
        column: usize,
    },
    #[error("Invalid float literal '{literal}' at line {line}, column {column}")]
    InvalidFloatLiteral {
        literal: String,
        line: usize,
        column: usize,
    },
}

impl LexError {
    pub fn line(&self) -> usize {
        match self {
            LexError::UnexpectedCharacter { line, .. }
            | LexError::UnterminatedString { line, .. }
            | LexError::UnterminatedBlockComment { line, .. }
            | LexError::InvalidIntegerLiteral { line, .. }
            | LexError::InvalidFloatLiteral { line, .. } => *line,
        }
    }

    pub fn column(&self) -> usize {
        match self {
            LexError::UnexpectedCharacter { column, .. }
            | LexError::UnterminatedString { column, .. }
            | LexError::UnterminatedBlockComment { column, .. }
            | LexError::InvalidIntegerLiteral { column, .. }
            | LexError::InvalidFloatLiteral { column, .. } => *column,
        }
    }
}

pub type LexResult<T> = Result<T, LexError>;

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
    line: usize,
    line_start: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input,
            pos: 0,
            line: 1,
            line_start: 0,
        }
    }

    pub fn next_token(&mut self) -> LexResult<Token<'a>> {
        loop {
            match self.current() {
                Some(' ' | '\t' | '\r') => {
                    self.bump();
                }
                Some('#') => {
                    self.eat_while(|c| c != '\n');
                }
                Some('/') if self.lookahead() == Some('*') => {
                    self.skip_block_comment()?;
                }
                _ => break,
            }
        }

        let start = self.pos;
        let (line, column) = (self.line, self.column());
        let Some(ch) = self.current() else {
            return Ok(Token::new(
                TokenKind::Eof,
                Span::new(start, start, line, column),
            ));
        };

        if ch == '\n' {
            self.bump();
            let token = Token::new(
                TokenKind::Newline,
                Span::new(start, start + 1, line, column),
            );
            self.line += 1;
            self.line_start = self.pos;
            return Ok(token);
        }

        let kind = match ch {
            '"' => return self.read_string(start, line, column),
            c if c.is_ascii_alphabetic() || c == '_' => return Ok(self.read_identifier(start)),
            c if c.is_ascii_digit() => return self.read_number(start, line, column),
            _ => self.read_operator(line, column)?,
        };

        Ok(Token::new(
            kind,
            Span::new(start, self.pos, line, column),
        ))
    }

    /// Greedy operator matching: two-character operators before their
    /// one-character prefixes.
    fn read_operator(&mut self, line: usize, column: usize) -> LexResult<TokenKind<'a>> {
        let ch = self
            .bump()
            .unwrap_or_else(|| unreachable!("read_operator called at EOF"));
        let kind = match ch {
            '=' => match self.current() {
                Some('=') => self.consume_with(TokenKind::EqEq),
                Some('>') => self.consume_with(TokenKind::FatArrow),
                _ => TokenKind::Assign,
            },
            '+' => match self.current() {
                Some('=') => self.consume_with(TokenKind::PlusAssign),
                _ => TokenKind::Plus,
            },
            '-' => match self.current() {
                Some('=') => self.consume_with(TokenKind::MinusAssign),
                Some('>') => self.consume_with(TokenKind::Arrow),
                _ => TokenKind::Minus,
            },
            '*' => match self.current() {
                Some('*') => self.consume_with(TokenKind::Power),
                Some('=') => self.consume_with(TokenKind::StarAssign),
                _ => TokenKind::Star,
            },
            '/' => match self.current() {
                Some('/') => self.consume_with(TokenKind::FloorDiv),
                Some('=') => self.consume_with(TokenKind::SlashAssign),
                _ => TokenKind::Slash,
            },
            '%' => match self.current() {
                Some('=') => self.consume_with(TokenKind::PercentAssign),
                _ => TokenKind::Percent,
            },
            '<' => match self.current() {
                Some('=') => self.consume_with(TokenKind::LessEq),
                _ => TokenKind::Less,
            },
            '>' => match self.current() {
                Some('=') => self.consume_with(TokenKind::GreaterEq),
                _ => TokenKind::Greater,
            },
            '!' => match self.current() {
                Some('=') => self.consume_with(TokenKind::NotEq),
                _ => {
                    return Err(LexError::UnexpectedCharacter {
                        character: '!',
                        line,
                        column,
                    });
                }
            },
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LBracket,
            ']' => TokenKind::RBracket,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            character => {
                return Err(LexError::UnexpectedCharacter {
                    character,
                    line,
                    column,
                });
            }
        };
        Ok(kind)
    }

    fn read_identifier(&mut self, start: usize) -> Token<'a> {
        let (line, column) = (self.line, self.column());
        let ident = self.eat_while(|c| c.is_ascii_alphanumeric() || c == '_');
        let kind = KEYWORDS
            .get(ident)
            .cloned()
            .unwrap_or(TokenKind::Identifier(ident));
        Token::new(kind, Span::new(start, self.pos, line, column))
    }

    fn read_number(&mut self, start: usize, line: usize, column: usize) -> LexResult<Token<'a>> {
        self.eat_while(|c| c.is_ascii_digit());

        // A dot followed by a digit promotes the literal to a float; a lone
        // dot is left for the operator scanner to reject.
        let mut is_float = false;
        if self.current() == Some('.') && self.lookahead().is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            self.bump();
            self.eat_while(|c| c.is_ascii_digit());
        }

        let end = self.pos;
        let literal = &self.input[start..end];
        let kind = if is_float {
            let value = literal
                .parse::<f64>()
                .map_err(|_| LexError::InvalidFloatLiteral {
                    literal: literal.to_string(),
                    line,
                    column,
                })?;
            TokenKind::Float(value)
        } else {
            let value = literal
                .parse::<i64>()
                .map_err(|_| LexError::InvalidIntegerLiteral {
                    literal: literal.to_string(),
                    line,
                    column,
                })?;
            TokenKind::Int(value)
        };
        Ok(Token::new(kind, Span::new(start, end, line, column)))
    }

    fn read_string(&mut self, start: usize, line: usize, column: usize) -> LexResult<Token<'a>> {
        self.bump(); // opening quote
        let mut value = String::new();

        loop {
            match self.bump() {
                Some('"') => break,
                Some('\n') | None => {
                    return Err(LexError::UnterminatedString { line, column });
                }
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some('"') => value.push('"'),
                    Some(other) => value.push(other),
                    None => {
                        return Err(LexError::UnterminatedString { line, column });
                    }
                },
                Some(c) => value.push(c),
            }
        }

        Ok(Token::new(
            TokenKind::Str(value),
            Span::new(start, self.pos, line, column),
        ))
    }

    fn skip_block_comment(&mut self) -> LexResult<()> {
        let (line, column) = (self.line, self.column());
        self.bump(); // '/'
        self.bump(); // '*'
        loop {
            match self.bump() {
                Some('*') if self.current() == Some('/') => {
                    self.bump();
                    return Ok(());
                }
                Some('\n') => {
                    self.line += 1;
                    self.line_start = self.pos;
                }
                Some(_) => {}
                None => return Err(LexError::UnterminatedBlockComment { line, column }),
            }
        }
    }

    fn consume_with(&mut self, kind: TokenKind<'a>) -> TokenKind<'a> {
        self.bump();
        kind
    }

    /// Unconsumed remainder of the input.
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    /// The character under the cursor, if any.
    fn current(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// The character one past the cursor, for two-character decisions.
    fn lookahead(&self) -> Option<char> {
        let mut upcoming = self.rest().chars();
        upcoming.next();
        upcoming.next()
    }

    /// Consumes the character under the cursor and returns it.
    fn bump(&mut self) -> Option<char> {
        let c = self.current()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    /// Advances while `keep` holds and returns the matched slice.
    fn eat_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let from = self.pos;
        while self.current().is_some_and(&keep) {
            self.bump();
        }
        &self.input[from..self.pos]
    }

    fn column(&self) -> usize {
        self.pos - self.line_start + 1
    }
}

pub fn tokenize(input: &str) -> LexResult<Vec<Token<'_>>> {
    let mut lexer = Lexer::new(input);
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.kind, TokenKind::Eof);
        tokens.push(token);
        if is_eof {
            break;
        }
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn kinds(input: &str) -> Vec<TokenKind<'_>> {
        tokenize(input)
            .expect("tokenize should succeed")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn lexes_function_declaration() {
        let input = indoc! {"
            fn add(a int, b int) -> int {
                return a + b
            }
        "};
        let expected = vec![
            TokenKind::Fn,
            TokenKind::Identifier("add"),
            TokenKind::LParen,
            TokenKind::Identifier("a"),
            TokenKind::IntType,
            TokenKind::Comma,
            TokenKind::Identifier("b"),
            TokenKind::IntType,
            TokenKind::RParen,
            TokenKind::Arrow,
            TokenKind::IntType,
            TokenKind::LBrace,
            TokenKind::Newline,
            TokenKind::Return,
            TokenKind::Identifier("a"),
            TokenKind::Plus,
            TokenKind::Identifier("b"),
            TokenKind::Newline,
            TokenKind::RBrace,
            TokenKind::Newline,
            TokenKind::Eof,
        ];
        assert_eq!(kinds(input), expected);
    }

    #[test]
    fn greedy_operator_matching() {
        let expected = vec![
            TokenKind::EqEq,
            TokenKind::NotEq,
            TokenKind::LessEq,
            TokenKind::GreaterEq,
            TokenKind::Power,
            TokenKind::FloorDiv,
            TokenKind::PlusAssign,
            TokenKind::MinusAssign,
            TokenKind::StarAssign,
            TokenKind::SlashAssign,
            TokenKind::PercentAssign,
            TokenKind::Arrow,
            TokenKind::FatArrow,
            TokenKind::Eof,
        ];
        assert_eq!(
            kinds("== != <= >= ** // += -= *= /= %= -> =>"),
            expected
        );
    }

    #[test]
    fn numbers_split_into_int_and_float() {
        assert_eq!(
            kinds("1 42 3.25 0.5"),
            vec![
                TokenKind::Int(1),
                TokenKind::Int(42),
                TokenKind::Float(3.25),
                TokenKind::Float(0.5),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes_are_resolved() {
        assert_eq!(
            kinds(r#""a\tb\n\"q\" \\""#),
            vec![
                TokenKind::Str("a\tb\n\"q\" \\".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        let input = indoc! {"
            a = 1 # trailing comment
            /* block
               comment */ b = 2
        "};
        assert_eq!(
            kinds(input),
            vec![
                TokenKind::Identifier("a"),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Identifier("b"),
                TokenKind::Assign,
                TokenKind::Int(2),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn errors_on_unterminated_string() {
        let err = tokenize("x = \"abc\n").expect_err("expected unterminated string failure");
        assert_eq!(
            err,
            LexError::UnterminatedString { line: 1, column: 5 }
        );
        assert!(err.to_string().contains("unterminated string at line 1"));
    }

    #[test]
    fn errors_on_integer_overflow() {
        let err = tokenize("n = 99999999999999999999999999").expect_err("expected overflow");
        assert!(err.to_string().contains("Invalid integer literal"));
        assert_eq!(err.line(), 1);
        assert_eq!(err.column(), 5);
    }

    #[test]
    fn errors_on_invalid_character() {
        let err = tokenize("x = 1 @ 2").expect_err("expected lexing failure");
        assert_eq!(
            err,
            LexError::UnexpectedCharacter {
                character: '@',
                line: 1,
                column: 7
            }
        );
    }

    #[test]
    fn errors_on_unterminated_block_comment() {
        let err = tokenize("/* never closed").expect_err("expected block comment failure");
        assert!(matches!(err, LexError::UnterminatedBlockComment { .. }));
    }

    #[test]
    fn tracks_lines_and_columns() {
        let tokens = tokenize("a = 1\n  b = 2\n").expect("tokenize should succeed");
        let b = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Identifier("b"))
            .expect("b token");
        assert_eq!(b.span.line, 2);
        assert_eq!(b.span.column, 3);
    }

    #[test]
    fn carriage_returns_are_ignored() {
        assert_eq!(
            kinds("a = 1\r\n"),
            vec![
                TokenKind::Identifier("a"),
                TokenKind::Assign,
                TokenKind::Int(1),
                TokenKind::Newline,
                TokenKind::Eof,
            ]
        );
    }
}
