//! Benchmark: request-batch emission over a populated fault map.
//!
//! The cycler walks the dense fault vector positionally each tick; this
//! measures batch cost as the fault set grows.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use grid_repair::{RepairQueue, RepairQueueOptions};
use grid_types::{BlockAddress, BlockRef, Checksum};

fn populated_queue(faults: u64) -> RepairQueue {
    let mut queue = RepairQueue::init(RepairQueueOptions {
        blocks_max: usize::try_from(faults).expect("fits usize"),
        tables_max: 0,
    })
    .expect("reserve queue");
    for address in 0..faults {
        queue.enqueue_block(BlockAddress(address), Checksum(u128::from(address)));
    }
    queue
}

fn bench_next_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("next_batch_of_block_requests");
    for faults in [64_u64, 1024, 4096] {
        let mut queue = populated_queue(faults);
        let mut requests = [BlockRef::ZERO; 32];
        group.bench_function(BenchmarkId::from_parameter(faults), |b| {
            b.iter(|| black_box(queue.next_batch_of_block_requests(black_box(&mut requests))));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_next_batch);
criterion_main!(benches);
