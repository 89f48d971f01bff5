use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use migrator_core::{expansion_span, plan_ranges};

fn bench_plan_ranges(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_ranges");

    for &span in &[10_000i64, 1_000_000, 100_000_000] {
        group.throughput(Throughput::Elements(span as u64));
        group.bench_with_input(BenchmarkId::new("batch_10000", span), &span, |b, &span| {
            b.iter(|| plan_ranges(black_box(1), black_box(span), black_box(10_000)));
        });
    }

    group.finish();
}

fn bench_expansion(c: &mut Criterion) {
    c.bench_function("expansion_then_plan", |b| {
        b.iter(|| {
            expansion_span(black_box(25_001), black_box(Some(2_500_000)))
                .map(|span| plan_ranges(span.min, span.max, 10_000))
                .unwrap_or_default()
        });
    });
}

criterion_group!(benches, bench_plan_ranges, bench_expansion);
criterion_main!(benches);
