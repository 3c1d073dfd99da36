//! Region heap allocation paths.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mpkguard_membrane::{RegionHeap, ReservedRegion};

const BENCH_WINDOW: ReservedRegion = ReservedRegion::new(0x5600_0000_0000, 1 << 32);

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let Ok(heap) = RegionHeap::reserve(BENCH_WINDOW) else {
        eprintln!("region_heap_bench: window unavailable, skipping");
        return;
    };
    let mut group = c.benchmark_group("region_alloc_free_cycle");
    for size in [16_usize, 64, 256, 1024, 4096, 32768, 1 << 20] {
        group.bench_with_input(BenchmarkId::new("region", size), &size, |b, &size| {
            b.iter(|| {
                let block = heap.allocate(black_box(size));
                // SAFETY: fresh block from this heap.
                unsafe { heap.deallocate(block) };
            });
        });
    }
    group.finish();

    let mut group = c.benchmark_group("region_alloc_burst");
    group.bench_function("1000x64B", |b| {
        b.iter(|| {
            let blocks: Vec<*mut u8> = (0..1000).map(|_| heap.allocate(64)).collect();
            for block in blocks {
                // SAFETY: live blocks from this heap.
                unsafe { heap.deallocate(block) };
            }
        });
    });
    group.bench_function("realloc_doubling_to_64K", |b| {
        b.iter(|| {
            let mut block = heap.allocate(16);
            let mut size = 16;
            while size < 1 << 16 {
                size *= 2;
                // SAFETY: `block` is live.
                block = unsafe { heap.reallocate(block, size) };
            }
            // SAFETY: as above.
            unsafe { heap.deallocate(block) };
        });
    });
    group.finish();
}

criterion_group!(benches, bench_alloc_free_cycle);
criterion_main!(benches);
