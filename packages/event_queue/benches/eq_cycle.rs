//! Benchmarks for the acquire/submit/poll cycle of `event_queue`.

#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use event_queue::{
    Clock, EventQueue, EventQueueConfig, LoopbackBackend, ResultCode, TaggedAttachment,
};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

const KIND: u8 = 0;

fn entrypoint(c: &mut Criterion) {
    let backend = Arc::new(LoopbackBackend::new());
    let config = EventQueueConfig::builder().capacity(64).build();
    let mut queue =
        EventQueue::<TaggedAttachment<u8>>::new(backend.clone(), config, Clock::system()).unwrap();

    let mut group = c.benchmark_group("eq_cycle");

    group.bench_function("acquire_return", |b| {
        b.iter(|| {
            let event = queue.acquire_event().unwrap().unwrap();
            black_box(queue.return_event(black_box(event)).unwrap());
        });
    });

    group.bench_function("single_operation", |b| {
        let mut out = Vec::with_capacity(1);

        b.iter(|| {
            let event = queue.acquire_event().unwrap().unwrap();
            queue.attach(event, TaggedAttachment::new(KIND, 1)).unwrap();
            queue.submit(event, black_box(&[1_u8, 2, 3][..])).unwrap();
            backend.complete(queue.backend_queue(), event, ResultCode::SUCCESS);

            queue
                .poll_completed(&mut out, KIND, None, 1, Duration::ZERO)
                .unwrap();
            black_box(out.pop());
        });
    });

    group.bench_function("batch_of_32_over_fetched", |b| {
        let mut out = Vec::with_capacity(32);

        b.iter(|| {
            for tag in 0..32 {
                let event = queue.acquire_event().unwrap().unwrap();
                queue.attach(event, TaggedAttachment::new(KIND, tag)).unwrap();
                queue.submit(event, &[]).unwrap();
            }

            backend.complete_all(queue.backend_queue(), ResultCode::SUCCESS);

            // Ask for a few at a time so most completions pass through the detain buffer.
            while out.len() < 32 {
                queue
                    .poll_completed(&mut out, KIND, None, 4, Duration::ZERO)
                    .unwrap();
            }

            black_box(out.drain(..).count());
        });
    });

    group.finish();
}
