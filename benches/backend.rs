mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use orion::analyzer;
use orion::codegen::Generator;
use orion::target::LINUX_X86_64;

fn bench_backend(c: &mut Criterion) {
    for (label, path) in common::workloads() {
        c.bench_function(&format!("backend_check_{label}"), |b| {
            b.iter(|| {
                let mut program = common::load_program(black_box(path));
                let out = analyzer::check_program(&mut program).expect("check");
                black_box(out);
            })
        });

        let (program, analysis) = common::load_checked(path);
        c.bench_function(&format!("backend_codegen_{label}"), |b| {
            b.iter(|| {
                let out = Generator::new(&LINUX_X86_64, black_box(&analysis))
                    .generate(black_box(&program))
                    .expect("codegen");
                black_box(out);
            })
        });
    }
}

criterion_group!(benches, bench_backend);
criterion_main!(benches);
