use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tasklet_freeze::{emit, freeze_source, BootstrapKind, FrozenModule};

fn sample_source(functions: usize) -> String {
    let mut source = String::new();
    for i in 0..functions {
        source.push_str(&format!(
            "def helper_{i}(name, path=None):\n    \"\"\"Helper {i}.\"\"\"\n    if path is None:\n        path = [name, '{i}', 0x{i:x}]\n    return (path, {i}.5)\n\n"
        ));
    }
    source
}

fn bench_freeze(c: &mut Criterion) {
    let source = sample_source(200);
    let mut group = c.benchmark_group("freeze");
    group.throughput(Throughput::Bytes(source.len() as u64));

    group.bench_function("compile_and_encode", |b| {
        b.iter(|| freeze_source(black_box(&source), BootstrapKind::Bootstrap).unwrap())
    });

    let bytes = freeze_source(&source, BootstrapKind::Bootstrap).unwrap();
    group.bench_function("decode", |b| {
        b.iter(|| FrozenModule::decode(black_box(&bytes)).unwrap())
    });
    group.bench_function("render", |b| {
        b.iter(|| emit::render("FROZEN_BOOTSTRAP", black_box(&bytes)))
    });

    group.finish();
}

criterion_group!(benches, bench_freeze);
criterion_main!(benches);
