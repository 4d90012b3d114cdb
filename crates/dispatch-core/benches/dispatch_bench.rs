use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dispatch_core::template::{Field, Template};

fn expand_large_template(c: &mut Criterion) {
    let template = Template::new(
        1,
        vec![Field::Literal("x".into()), Field::Range { lo: 0, hi: 50_000 }],
    );
    c.bench_function("expand_50k_range", |b| {
        b.iter(|| black_box(template.clone().expand()))
    });
}

fn split_large_template(c: &mut Criterion) {
    let template = Template::new(1, vec![Field::Range { lo: 0, hi: 1_000_000 }]);
    c.bench_function("split_1m_into_512k_budget", |b| {
        b.iter(|| black_box(template.clone().split(512 * 1024)))
    });
}

criterion_group!(benches, expand_large_template, split_large_template);
criterion_main!(benches);
