//! End-to-end scenarios for the bounded ring queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;

use weft_queue::bounded::wait::{FutexWait, YieldWait};
use weft_queue::{BoundedMpmc, BoundedSpsc, ConcurrentQueue, PopError};
use weft_sync::backoff::ExponentialBackoff;
use weft_sync::pause::CpuRelax;

/// One producer, one consumer, capacity 16: the consumer sees every value
/// in push order and then the closed state.
#[test]
fn spsc_drains_in_order() {
    let queue = Arc::new(BoundedSpsc::<u32, FutexWait>::new(16));

    let consumer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut received = Vec::new();
            loop {
                match queue.pop() {
                    Ok(value) => received.push(value),
                    Err(PopError) => return received,
                }
            }
        })
    };

    for i in 0..1000 {
        queue.push(i).unwrap();
    }
    queue.close();

    let received = consumer.join().unwrap();
    assert_eq!(received, (0..1000).collect::<Vec<u32>>());
}

/// Four producers and four consumers over a capacity-64 ring: the union of
/// what the consumers saw equals the union of what the producers sent, and
/// each producer's values arrive in that producer's order.
#[test]
fn mpmc_conserves_values_and_producer_order() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;

    let queue = Arc::new(BoundedMpmc::<String, FutexWait>::new(64));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for i in 0..PER_PRODUCER {
                    let backoff = ExponentialBackoff::<CpuRelax>::new(rng.gen_range(16..256));
                    queue
                        .push_with_backoff(format!("p{id}:{i}"), backoff)
                        .unwrap();
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..CONSUMERS)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(value) = queue.pop() {
                    seen.push(value);
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }
    queue.close();

    let per_consumer: Vec<Vec<String>> = consumers
        .into_iter()
        .map(|consumer| consumer.join().unwrap())
        .collect();

    // Conservation: the multisets match.
    let mut all: Vec<&String> = per_consumer.iter().flatten().collect();
    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER, "duplicate delivery");

    // Per-producer FIFO: within one consumer, any two values from the same
    // producer appear in the producer's push order.
    for seen in &per_consumer {
        let mut last_index = vec![None::<usize>; PRODUCERS];
        for value in seen {
            let (producer, index) = value[1..]
                .split_once(':')
                .map(|(p, i)| (p.parse::<usize>().unwrap(), i.parse::<usize>().unwrap()))
                .unwrap();
            if let Some(previous) = last_index[producer] {
                assert!(previous < index, "producer {producer} reordered");
            }
            last_index[producer] = Some(index);
        }
    }
}

/// Closing while producers are mid-push: every push either succeeds or
/// reports closed, and the number of successes equals the number of values
/// the consumer drained. Nobody hangs.
#[test]
fn close_with_in_flight_producers_loses_nothing() {
    const PRODUCERS: usize = 8;
    const ATTEMPTS: usize = 1000;

    let queue = Arc::new(BoundedMpmc::<u64, FutexWait>::new(16));
    let successes = Arc::new(AtomicUsize::new(0));

    let producers: Vec<_> = (0..PRODUCERS)
        .map(|id| {
            let queue = Arc::clone(&queue);
            let successes = Arc::clone(&successes);
            thread::spawn(move || {
                for i in 0..ATTEMPTS {
                    if queue.push((id * ATTEMPTS + i) as u64).is_ok() {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();

    let drained = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || {
            let mut count = 0usize;
            while queue.pop().is_ok() {
                count += 1;
            }
            count
        })
    };

    thread::sleep(Duration::from_millis(50));
    queue.close();

    for producer in producers {
        producer.join().unwrap();
    }
    let drained = drained.join().unwrap();
    assert_eq!(drained, successes.load(Ordering::Relaxed));
}

/// A failing constructor propagates its error to the producer and leaves a
/// gap the consumer never sees.
#[test]
fn failed_publications_are_invisible_to_consumers() {
    let queue = BoundedSpsc::<u32, YieldWait>::new(16);

    for i in 0..6u32 {
        if i == 4 {
            let result = queue.push_from(|| Err::<u32, &str>("move failed"));
            assert!(result.is_err());
        } else {
            queue.push(i).unwrap();
        }
    }
    queue.close();

    let drained: Vec<u32> = queue.drain().collect();
    assert_eq!(drained, [0, 1, 2, 3, 5]);
}

/// A producer facing a full ring parks instead of spinning and completes
/// once a consumer frees a slot.
#[test]
fn full_ring_parks_producer_until_pop() {
    let queue = Arc::new(BoundedMpmc::<u32, FutexWait>::new(16));
    for i in 0..16 {
        queue.push(i).unwrap();
    }

    let producer = {
        let queue = Arc::clone(&queue);
        thread::spawn(move || queue.push(99))
    };

    // Give the producer time to reach the parked state.
    thread::sleep(Duration::from_millis(50));
    assert_eq!(queue.pop(), Ok(0));

    producer.join().unwrap().unwrap();
    queue.close();
    let rest: Vec<u32> = queue.drain().collect();
    assert_eq!(rest.last(), Some(&99));
}

/// A consumer blocked on an empty queue wakes promptly when the queue is
/// closed underneath it.
#[test]
fn close_wakes_blocked_consumers() {
    let queue = Arc::new(BoundedMpmc::<u32, FutexWait>::new(16));
    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop())
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    queue.close();

    for consumer in consumers {
        assert_eq!(consumer.join().unwrap(), Err(PopError));
    }
}

/// The queue trait object view agrees with the inherent methods.
#[test]
fn works_through_the_queue_trait() {
    fn feed<Q: ConcurrentQueue<u32>>(queue: &Q) {
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.close();
        assert_eq!(queue.pop(), Ok(1));
        assert_eq!(queue.pop(), Ok(2));
        assert!(queue.pop().is_err());
        assert!(!queue.is_lock_free());
    }

    feed(&BoundedMpmc::<u32, YieldWait>::new(16));
}
