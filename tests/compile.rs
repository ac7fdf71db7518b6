use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use orion::target::LINUX_X86_64;
use orion::{CompileError, ast, check_source, compile_source, lexer, parser};

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum CaseClass {
    CodegenSuccess,
    FrontendError,
}

#[derive(Debug, Deserialize, Clone)]
struct ExpectedOutcome {
    exit_code: i32,
    asm_contains_file: Option<String>,
    stderr_contains_file: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct CaseSpec {
    class: CaseClass,
    expected: ExpectedOutcome,
}

#[derive(Debug, Clone)]
struct Case {
    name: String,
    dir: PathBuf,
    program_path: PathBuf,
    spec: CaseSpec,
}

impl Case {
    fn read_text(&self, relative_path: &str) -> Result<String> {
        fs::read_to_string(self.dir.join(relative_path))
            .with_context(|| format!("Reading {} fixture file {}", self.name, relative_path))
    }

    fn source(&self) -> Result<String> {
        fs::read_to_string(&self.program_path)
            .map(|source| source.replace('\r', ""))
            .with_context(|| format!("Reading {}", self.name))
    }
}

fn load_cases(programs_dir: &Path) -> Result<Vec<Case>> {
    let mut cases = Vec::new();

    for entry in
        fs::read_dir(programs_dir).with_context(|| format!("Reading {}", programs_dir.display()))?
    {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }

        let case_path = path.join("case.yaml");
        if !case_path.exists() {
            continue;
        }

        let program_path = path.join("program.ori");
        ensure!(
            program_path.exists(),
            "Missing program.ori for case {}",
            path.display()
        );

        let case_name = path
            .file_name()
            .and_then(|value| value.to_str())
            .map(str::to_string)
            .with_context(|| format!("Invalid case directory name {}", path.display()))?;
        let case_raw = fs::read_to_string(&case_path)
            .with_context(|| format!("Reading {}", case_path.display()))?;
        let spec: CaseSpec = serde_yaml::from_str(&case_raw)
            .with_context(|| format!("Parsing {}", case_path.display()))?;

        cases.push(Case {
            name: case_name,
            dir: path,
            program_path,
            spec,
        });
    }

    ensure!(
        !cases.is_empty(),
        "No test cases found in {}",
        programs_dir.display()
    );
    cases.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(cases)
}

fn rendered_diagnostics(source: &str) -> Option<String> {
    match check_source(source) {
        Ok(_) => None,
        Err(diagnostics) => Some(
            diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n"),
        ),
    }
}

/// Every non-empty line of the expectation file must appear in the haystack.
fn assert_contains_lines(case: &str, haystack: &str, expectations: &str) -> Result<()> {
    for line in expectations.lines() {
        let needle = line.trim();
        if needle.is_empty() {
            continue;
        }
        ensure!(
            haystack.contains(needle),
            "Case {case}: expected output to contain '{needle}', got:\n{haystack}"
        );
    }
    Ok(())
}

#[test]
fn runs_codegen_success_cases() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in cases
        .iter()
        .filter(|case| case.spec.class == CaseClass::CodegenSuccess)
    {
        ensure!(
            case.spec.expected.exit_code == 0,
            "Case {} expected exit code must be 0 for codegen_success",
            case.name
        );
        let source = case.source()?;
        let assembly = compile_source(&source, &LINUX_X86_64)
            .map_err(|error| anyhow::anyhow!("Case {} failed to compile: {error:?}", case.name))?;

        let expectations_file = case
            .spec
            .expected
            .asm_contains_file
            .as_deref()
            .with_context(|| format!("Missing asm_contains_file in {}", case.name))?;
        let expectations = case.read_text(expectations_file)?;
        assert_contains_lines(&case.name, &assembly, &expectations)?;
    }
    Ok(())
}

#[test]
fn runs_frontend_error_cases() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in cases
        .iter()
        .filter(|case| case.spec.class == CaseClass::FrontendError)
    {
        ensure!(
            case.spec.expected.exit_code == 1,
            "Case {} expected exit code must be 1 for frontend_error",
            case.name
        );
        let source = case.source()?;
        let rendered = rendered_diagnostics(&source)
            .with_context(|| format!("Case {} unexpectedly checked cleanly", case.name))?;

        let expectations_file = case
            .spec
            .expected
            .stderr_contains_file
            .as_deref()
            .with_context(|| format!("Missing stderr_contains_file in {}", case.name))?;
        let expectations = case.read_text(expectations_file)?;
        assert_contains_lines(&case.name, &rendered, &expectations)?;
    }
    Ok(())
}

/// Two runs over the same source must produce byte-identical assembly.
#[test]
fn emission_is_deterministic() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in cases
        .iter()
        .filter(|case| case.spec.class == CaseClass::CodegenSuccess)
    {
        let source = case.source()?;
        let first = compile_source(&source, &LINUX_X86_64)
            .map_err(|error| anyhow::anyhow!("Case {}: {error:?}", case.name))?;
        let second = compile_source(&source, &LINUX_X86_64)
            .map_err(|error| anyhow::anyhow!("Case {}: {error:?}", case.name))?;
        ensure!(
            first == second,
            "Case {} emitted differing assembly across runs",
            case.name
        );
    }
    Ok(())
}

/// `.L` labels are defined at most once per emission.
#[test]
fn emitted_labels_are_unique() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in cases
        .iter()
        .filter(|case| case.spec.class == CaseClass::CodegenSuccess)
    {
        let source = case.source()?;
        let assembly = compile_source(&source, &LINUX_X86_64)
            .map_err(|error| anyhow::anyhow!("Case {}: {error:?}", case.name))?;
        let mut seen = HashSet::new();
        for line in assembly.lines() {
            let line = line.trim_end();
            if line.starts_with(".L") && line.ends_with(':') {
                ensure!(
                    seen.insert(line.to_string()),
                    "Case {} defines label {line} twice",
                    case.name
                );
            }
        }
    }
    Ok(())
}

/// Parsing the pretty-printed AST yields an equivalent AST.
#[test]
fn pretty_printed_programs_reparse() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in cases
        .iter()
        .filter(|case| case.spec.class == CaseClass::CodegenSuccess)
    {
        let source = case.source()?;
        let tokens = lexer::tokenize(&source)
            .map_err(|error| anyhow::anyhow!("Case {}: {error}", case.name))?;
        let program = parser::parse_tokens(tokens)
            .map_err(|errors| anyhow::anyhow!("Case {}: {errors:?}", case.name))?;

        let printed = ast::to_source(&program);
        let tokens = lexer::tokenize(&printed)
            .map_err(|error| anyhow::anyhow!("Case {} reprint: {error}", case.name))?;
        let reparsed = parser::parse_tokens(tokens)
            .map_err(|errors| anyhow::anyhow!("Case {} reprint: {errors:?}", case.name))?;
        let reprinted = ast::to_source(&reparsed);
        ensure!(
            printed == reprinted,
            "Case {} changed under print/parse round-trip",
            case.name
        );
    }
    Ok(())
}

/// Deterministic pseudo-random integer expression trees: every generated
/// tree must type-check and survive codegen, and the frontend's constant
/// meaning must match a straightforward reference evaluator.
#[test]
fn random_integer_expressions_compile() -> Result<()> {
    struct Lcg(u64);
    impl Lcg {
        fn next(&mut self, bound: u64) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) % bound
        }
    }

    // Builds an expression source string and its reference value together.
    // Division and modulo are excluded so the reference never traps.
    fn r#gen(rng: &mut Lcg, depth: usize) -> (String, i64) {
        if depth == 0 || rng.next(4) == 0 {
            let value = rng.next(9) as i64 + 1;
            return (value.to_string(), value);
        }
        let (left_src, left) = r#gen(rng, depth - 1);
        let (right_src, right) = r#gen(rng, depth - 1);
        match rng.next(3) {
            0 => (
                format!("({left_src} + {right_src})"),
                left.wrapping_add(right),
            ),
            1 => (
                format!("({left_src} - {right_src})"),
                left.wrapping_sub(right),
            ),
            _ => (
                format!("({left_src} * {right_src})"),
                left.wrapping_mul(right),
            ),
        }
    }

    let mut rng = Lcg(0x5eed);
    for _ in 0..64 {
        let (expr, value) = r#gen(&mut rng, 4);
        let source = format!("fn main() {{\n    result = {expr}\n    out(result)\n}}\nmain()\n");
        let assembly = compile_source(&source, &LINUX_X86_64)
            .map_err(|error| anyhow::anyhow!("expression '{expr}': {error:?}"))?;
        ensure!(
            assembly.contains("call print_int"),
            "expression '{expr}' (= {value}) should print an integer"
        );
    }
    Ok(())
}

/// Internal emitter failures are the only non-diagnostic error shape.
#[test]
fn checked_programs_never_fail_internally() -> Result<()> {
    let cases = load_cases(Path::new("tests/programs"))?;
    for case in &cases {
        let source = case.source()?;
        match compile_source(&source, &LINUX_X86_64) {
            Ok(_) => {}
            Err(CompileError::Diagnostics(_)) => {}
            Err(CompileError::Internal(error)) => {
                anyhow::bail!("Case {} hit an internal error: {error}", case.name);
            }
        }
    }
    Ok(())
}
