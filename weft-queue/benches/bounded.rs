//! Throughput of the bounded ring queue across waiting strategies.

use std::sync::Arc;
use std::thread;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use weft_queue::bounded::wait::{FutexWait, SlotWait, SpinWait, YieldWait};
use weft_queue::BoundedSpsc;

const MESSAGES: u64 = 100_000;

fn spsc_round_trip<W: SlotWait + 'static>(capacity: usize) {
    let queue = Arc::new(BoundedSpsc::<u64, W>::new(capacity));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut sum = 0u64;
            while let Ok(value) = queue.pop() {
                sum = sum.wrapping_add(value);
            }
            sum
        })
    };

    for i in 0..MESSAGES {
        queue.push(i).unwrap();
    }
    queue.close();
    criterion::black_box(consumer.join().unwrap());
}

fn bench_spsc(c: &mut Criterion) {
    let mut group = c.benchmark_group("spsc");
    group.throughput(Throughput::Elements(MESSAGES));

    for capacity in [64usize, 1024] {
        group.bench_with_input(BenchmarkId::new("spin", capacity), &capacity, |b, &cap| {
            b.iter(|| spsc_round_trip::<SpinWait>(cap))
        });
        group.bench_with_input(BenchmarkId::new("yield", capacity), &capacity, |b, &cap| {
            b.iter(|| spsc_round_trip::<YieldWait>(cap))
        });
        group.bench_with_input(BenchmarkId::new("futex", capacity), &capacity, |b, &cap| {
            b.iter(|| spsc_round_trip::<FutexWait>(cap))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_spsc);
criterion_main!(benches);
