use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, bail};
use orion::{CompileError, ast, check_source, compile_source, lexer, parser, target};

const EXIT_COMPILE_ERROR: i32 = 1;
const EXIT_INTERNAL: i32 = 2;
const EXIT_USAGE: i32 = 3;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Build,
    AsmOnly,
    CheckOnly,
    AstOnly,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let mut mode = Mode::Build;
    let mut input_path: Option<String> = None;

    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--asm" => mode = Mode::AsmOnly,
            "--check" => mode = Mode::CheckOnly,
            "--ast" => mode = Mode::AstOnly,
            other if other.starts_with("--") => {
                eprintln!("Unknown option '{other}'");
                usage();
                return EXIT_USAGE;
            }
            other => {
                if input_path.is_some() {
                    eprintln!("Only one input file is supported");
                    usage();
                    return EXIT_USAGE;
                }
                input_path = Some(other.to_string());
            }
        }
    }

    let Some(path) = input_path else {
        usage();
        return EXIT_USAGE;
    };

    let source = match fs::read_to_string(&path) {
        Ok(source) => source.replace('\r', ""),
        Err(error) => {
            eprintln!("Error: cannot read {path}: {error}");
            return EXIT_COMPILE_ERROR;
        }
    };

    match mode {
        Mode::CheckOnly => check_only(&source),
        Mode::AstOnly => ast_only(&source),
        Mode::AsmOnly => asm_only(&source),
        Mode::Build => build(&source, Path::new(&path)),
    }
}

fn usage() {
    eprintln!("Usage: orion [--asm | --check | --ast] <source-file>");
}

fn check_only(source: &str) -> i32 {
    match check_source(source) {
        Ok(_) => 0,
        Err(diagnostics) => {
            report(&diagnostics);
            EXIT_COMPILE_ERROR
        }
    }
}

fn ast_only(source: &str) -> i32 {
    let tokens = match lexer::tokenize(source) {
        Ok(tokens) => tokens,
        Err(error) => {
            eprintln!("{}", orion::diagnostics::Diagnostic::from(&error));
            return EXIT_COMPILE_ERROR;
        }
    };
    match parser::parse_tokens(tokens) {
        Ok(program) => {
            print!("{}", ast::dump(&program));
            0
        }
        Err(errors) => {
            for error in &errors {
                eprintln!("{}", orion::diagnostics::Diagnostic::from(error));
            }
            EXIT_COMPILE_ERROR
        }
    }
}

fn asm_only(source: &str) -> i32 {
    match compile_source(source, target::host_default()) {
        Ok(assembly) => {
            print!("{assembly}");
            0
        }
        Err(error) => report_compile_error(error),
    }
}

fn build(source: &str, source_path: &Path) -> i32 {
    let assembly = match compile_source(source, target::host_default()) {
        Ok(assembly) => assembly,
        Err(error) => return report_compile_error(error),
    };
    match assemble_and_link(&assembly, source_path) {
        Ok(()) => 0,
        Err(error) => {
            eprintln!("Error: {error:#}");
            EXIT_COMPILE_ERROR
        }
    }
}

/// Writes `<stem>.s` next to the source and hands it to the system
/// assembler/linker together with the runtime object.
fn assemble_and_link(assembly: &str, source_path: &Path) -> Result<()> {
    let spec = target::host_default();
    let stem = source_path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .context("source path has no file stem")?;
    let dir = source_path.parent().unwrap_or(Path::new("."));
    let asm_path = dir.join(format!("{stem}.s"));
    let exe_path = dir.join(format!("{stem}{}", spec.exe_extension));

    fs::write(&asm_path, assembly)
        .with_context(|| format!("writing {}", asm_path.display()))?;

    let command_line = spec.assembler_command_for(
        &asm_path.display().to_string(),
        &exe_path.display().to_string(),
    );
    let mut parts = command_line.split_whitespace();
    let program = parts.next().context("empty assembler command")?;
    let status = Command::new(program)
        .args(parts)
        .status()
        .with_context(|| format!("running '{command_line}'"))?;
    if !status.success() {
        bail!("assembler/linker failed: '{command_line}'");
    }
    Ok(())
}

fn report(diagnostics: &orion::diagnostics::Diagnostics) {
    for diagnostic in diagnostics.iter() {
        eprintln!("{diagnostic}");
    }
}

fn report_compile_error(error: CompileError) -> i32 {
    match error {
        CompileError::Diagnostics(diagnostics) => {
            report(&diagnostics);
            EXIT_COMPILE_ERROR
        }
        CompileError::Internal(error) => {
            eprintln!("Error: {error}");
            EXIT_INTERNAL
        }
    }
}
