//! Benchmarks for bulkmove
//!
//! Run with: cargo bench

use bulkmove::dispatch::{Command, FileCopy};
use bulkmove::pool::{Frame, FrameReader};
use bulkmove::queue::BoundedQueue;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::io::Cursor;
use std::sync::Arc;
use std::thread;

fn benchmark_queue_single_thread(c: &mut Criterion) {
    c.bench_function("queue_enter_dequeue", |b| {
        let queue = BoundedQueue::new(1024).unwrap();

        b.iter(|| {
            queue.enter(String::from("/test/path")).unwrap();
            let item = queue.dequeue().unwrap();
            black_box(item);
        })
    });
}

fn benchmark_queue_handoff(c: &mut Criterion) {
    const ITEMS: u64 = 10_000;
    let mut group = c.benchmark_group("queue_handoff");
    group.throughput(Throughput::Elements(ITEMS));

    for capacity in [1usize, 16, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(capacity), &capacity, |b, &capacity| {
            b.iter(|| {
                let queue = Arc::new(BoundedQueue::new(capacity).unwrap());
                let consumer = {
                    let queue = Arc::clone(&queue);
                    thread::spawn(move || {
                        let mut sum = 0u64;
                        while let Ok(n) = queue.dequeue() {
                            sum += n;
                        }
                        sum
                    })
                };
                for n in 0..ITEMS {
                    queue.enter(n).unwrap();
                }
                queue.finish_and_wait();
                black_box(consumer.join().unwrap());
            })
        });
    }
    group.finish();
}

fn benchmark_frame_encoding(c: &mut Criterion) {
    c.bench_function("frame_copy_command", |b| {
        let command = Command::Copy(
            FileCopy::new("/src/some/deep/path/file.dat", "/dst/some/deep/path/file.dat", 1 << 20)
                .skip_existing(true),
        );

        b.iter(|| {
            let mut frame = Frame::new();
            frame.put_i32(7).put_str(command.path()).put_i64(command.size() as i64);
            let mut reader = FrameReader::new(Cursor::new(frame.as_bytes().to_vec()));
            black_box((
                reader.get_i32().unwrap(),
                reader.get_string().unwrap(),
                reader.get_i64().unwrap(),
            ));
        })
    });
}

criterion_group!(
    benches,
    benchmark_queue_single_thread,
    benchmark_queue_handoff,
    benchmark_frame_encoding
);
criterion_main!(benches);
