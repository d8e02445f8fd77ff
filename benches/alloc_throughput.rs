use blockheap::{BLOCK_SIZE, BlockPool};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// blockheap allocate/release throughput.
fn pool_allocate_release(pool: &mut BlockPool, size: usize) {
  for _ in 0..OPS {
    let ptr = pool.allocate(size);
    black_box(&ptr);
    if let Some(ptr) = ptr {
      pool.release(ptr.as_ptr());
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, BLOCK_SIZE, 4 * BLOCK_SIZE] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("blockheap", size), &size, |b, &size| {
      let mut pool = BlockPool::new();
      b.iter(|| pool_allocate_release(&mut pool, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput);
criterion_main!(benches);
