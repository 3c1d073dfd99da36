//! Address classification and size-class lookup.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mpkguard_membrane::region::{self, UNSAFE_REGION_LEN, UNSAFE_REGION_START};
use mpkguard_membrane::size_class;

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");
    let samples = [
        ("below", UNSAFE_REGION_START - 8),
        ("start", UNSAFE_REGION_START),
        ("inside", UNSAFE_REGION_START + UNSAFE_REGION_LEN / 2),
        ("end", UNSAFE_REGION_START + UNSAFE_REGION_LEN),
    ];
    for (label, addr) in samples {
        group.bench_with_input(BenchmarkId::new("address", label), &addr, |b, &addr| {
            b.iter(|| region::classify(black_box(addr)));
        });
    }
    group.finish();
}

fn bench_size_class(c: &mut Criterion) {
    let mut group = c.benchmark_group("size_class");
    for size in [1_usize, 24, 200, 3000, 1 << 20] {
        group.bench_with_input(BenchmarkId::new("bin_index", size), &size, |b, &size| {
            b.iter(|| size_class::bin_index(black_box(size)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_classify, bench_size_class);
criterion_main!(benches);
