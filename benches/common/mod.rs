#![allow(dead_code)]
use std::fs;

use orion::analyzer::{self, Analysis};
use orion::ast::Program;
use orion::{lexer, parser};

pub const WORKLOADS: [(&str, &str); 2] = [
    ("long", "tests/programs/long.ori"),
    ("gcd", "tests/programs/bench_gcd.ori"),
];

pub fn workloads() -> [(&'static str, &'static str); 2] {
    WORKLOADS
}

pub fn load_source(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_else(|err| panic!("read {path}: {err}"))
}

pub fn load_program(path: &str) -> Program {
    let source = load_source(path);
    let tokens = lexer::tokenize(&source).unwrap_or_else(|err| panic!("tokenize {path}: {err}"));
    parser::parse_tokens(tokens).unwrap_or_else(|errs| panic!("parse {path}: {errs:?}"))
}

pub fn load_checked(path: &str) -> (Program, Analysis) {
    let mut program = load_program(path);
    let analysis = analyzer::check_program(&mut program)
        .unwrap_or_else(|errs| panic!("check {path}: {errs:?}"));
    (program, analysis)
}
