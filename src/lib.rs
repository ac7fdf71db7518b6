//! `orion` library crate.
//!
//! Ahead-of-time compiler for the Orion language. High-level layout:
//! - frontend: `lexer` + `parser` produce the AST (`ast`), `analyzer`
//!   resolves scopes and annotates static types (`types`)
//! - backend: `codegen` walks the typed AST and emits x86-64 assembly text
//!   for one `target` descriptor, calling into the C runtime surface
//!   described by `runtime`
//! - `diagnostics` carries the collected, deduplicated error stream

pub mod analyzer;
pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod runtime;
pub mod target;
pub mod token;
pub mod types;

use diagnostics::{Diagnostic, Diagnostics};

/// Frontend failure (user errors) vs. emitter failure (compiler bug).
#[derive(Debug)]
pub enum CompileError {
    Diagnostics(Diagnostics),
    Internal(codegen::CodegenError),
}

/// Lexes, parses and type-checks `source`, returning the typed program and
/// the analysis facts, or every diagnostic collected along the way.
pub fn check_source(source: &str) -> Result<(ast::Program, analyzer::Analysis), Diagnostics> {
    let tokens = match lexer::tokenize(source) {
        Ok(tokens) => tokens,
        Err(error) => {
            let mut diagnostics = Diagnostics::new();
            diagnostics.push(Diagnostic::from(&error));
            return Err(diagnostics);
        }
    };

    let mut program = match parser::parse_tokens(tokens) {
        Ok(program) => program,
        Err(errors) => {
            let mut diagnostics = Diagnostics::new();
            diagnostics.extend(errors.iter().map(Diagnostic::from));
            return Err(diagnostics);
        }
    };

    match analyzer::check_program(&mut program) {
        Ok(analysis) => Ok((program, analysis)),
        Err(errors) => {
            let mut diagnostics = Diagnostics::new();
            diagnostics.extend(errors.iter().map(Diagnostic::from));
            Err(diagnostics)
        }
    }
}

/// Full pipeline: source text in, assembly text out.
pub fn compile_source(
    source: &str,
    target: &target::TargetSpec,
) -> Result<String, CompileError> {
    let (program, analysis) = check_source(source).map_err(CompileError::Diagnostics)?;
    codegen::Generator::new(target, &analysis)
        .generate(&program)
        .map_err(CompileError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_compiles_a_program() {
        let asm = compile_source(
            "fn main() { out(1 + 2) }\nmain()\n",
            target::host_default(),
        )
        .expect("compile should succeed");
        assert!(asm.contains("call"));
    }

    #[test]
    fn frontend_errors_surface_as_diagnostics() {
        let error = compile_source("fn main() { bogus() }\n", target::host_default())
            .expect_err("expected diagnostics");
        let CompileError::Diagnostics(diagnostics) = error else {
            panic!("expected frontend diagnostics");
        };
        assert!(!diagnostics.is_empty());
        let rendered = diagnostics
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        assert!(rendered.contains("UnknownFunction"));
    }
}
