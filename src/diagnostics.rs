use std::fmt;

use crate::analyzer::SemaError;
use crate::lexer::LexError;
use crate::parser::ParseError;

/// Pipeline phase a diagnostic originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Lex,
    Parse,
    Check,
    Codegen,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Lex => f.write_str("lex"),
            Phase::Parse => f.write_str("parse"),
            Phase::Check => f.write_str("check"),
            Phase::Codegen => f.write_str("codegen"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub phase: Phase,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(phase: Phase, line: usize, column: usize, message: String) -> Self {
        Self {
            phase,
            line,
            column,
            message,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error: {} at line {}: {}",
            self.phase, self.line, self.message
        )
    }
}

impl From<&LexError> for Diagnostic {
    fn from(error: &LexError) -> Self {
        Diagnostic::new(Phase::Lex, error.line(), error.column(), error.to_string())
    }
}

impl From<&ParseError> for Diagnostic {
    fn from(error: &ParseError) -> Self {
        Diagnostic::new(Phase::Parse, error.line, error.column, error.to_string())
    }
}

impl From<&SemaError> for Diagnostic {
    fn from(error: &SemaError) -> Self {
        Diagnostic::new(Phase::Check, error.line, error.column, error.to_string())
    }
}

/// Ordered diagnostic sink, deduplicated by (location, text).
#[derive(Debug, Default)]
pub struct Diagnostics {
    items: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        let duplicate = self.items.iter().any(|existing| {
            existing.line == diagnostic.line
                && existing.column == diagnostic.column
                && existing.message == diagnostic.message
        });
        if !duplicate {
            self.items.push(diagnostic);
        }
    }

    pub fn extend<I>(&mut self, diagnostics: I)
    where
        I: IntoIterator<Item = Diagnostic>,
    {
        for diagnostic in diagnostics {
            self.push(diagnostic);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_in_spec_format() {
        let diagnostic = Diagnostic::new(
            Phase::Check,
            7,
            3,
            "UnknownFunction: call to undefined function 'bogus'".to_string(),
        );
        assert_eq!(
            diagnostic.to_string(),
            "Error: check at line 7: UnknownFunction: call to undefined function 'bogus'"
        );
    }

    #[test]
    fn deduplicates_by_location_and_text() {
        let mut diagnostics = Diagnostics::new();
        let diagnostic = Diagnostic::new(Phase::Parse, 1, 2, "Expected ')'".to_string());
        diagnostics.push(diagnostic.clone());
        diagnostics.push(diagnostic.clone());
        assert_eq!(diagnostics.len(), 1);

        // Same text at a different location survives.
        diagnostics.push(Diagnostic::new(Phase::Parse, 2, 2, "Expected ')'".to_string()));
        assert_eq!(diagnostics.len(), 2);
    }
}
