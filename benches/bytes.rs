//! Cursor and store throughput benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use umbra::bytes::Bytes;
use umbra::lock::SharedLock;
use umbra::store::{ByteStore, NativeStore};
use std::hint::black_box;
use std::sync::Arc;

fn bench_sequential_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_writes");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut bytes = Bytes::alloc_native(size).unwrap();

            b.iter(|| {
                bytes.clear();
                while bytes.remaining() >= 8 {
                    bytes.write_u64(0x0123_4567_89AB_CDEF).unwrap();
                }
                black_box(bytes.position())
            });
        });
    }

    group.finish();
}

fn bench_sequential_reads(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_reads");

    for size in [1024, 64 * 1024, 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut bytes = Bytes::alloc_native(size).unwrap();
            while bytes.remaining() >= 8 {
                bytes.write_u64(0x0123_4567_89AB_CDEF).unwrap();
            }
            bytes.flip();

            b.iter(|| {
                bytes.set_position(0).unwrap();
                let mut sum = 0u64;
                while bytes.remaining() >= 8 {
                    sum = sum.wrapping_add(bytes.read_u64().unwrap());
                }
                black_box(sum)
            });
        });
    }

    group.finish();
}

fn bench_absolute_access(c: &mut Criterion) {
    let mut group = c.benchmark_group("absolute_access");

    group.throughput(Throughput::Elements(1));
    group.bench_function("u64_at", |b| {
        let mut bytes = Bytes::alloc_native(4096).unwrap();
        bytes.put_u64_at(128, 0xFEED_FACE).unwrap();

        b.iter(|| black_box(bytes.u64_at(128).unwrap()));
    });
    group.bench_function("put_u64_at", |b| {
        let mut bytes = Bytes::alloc_native(4096).unwrap();

        b.iter(|| bytes.put_u64_at(128, black_box(0xFEED_FACE)).unwrap());
    });

    group.finish();
}

fn bench_stop_bit(c: &mut Criterion) {
    let mut group = c.benchmark_group("stop_bit");

    for value in [7i64, 300, 1 << 20, i64::MAX, -1].iter() {
        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(value), value, |b, &value| {
            let mut bytes = Bytes::alloc_heap(64).unwrap();

            b.iter(|| {
                bytes.clear();
                bytes.write_stop_bit(value).unwrap();
                bytes.flip();
                black_box(bytes.read_stop_bit().unwrap())
            });
        });
    }

    group.finish();
}

fn bench_block_framing(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_framing");

    for size in [64, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let payload = vec![0xA5u8; size];
            let mut bytes = Bytes::alloc_native(size + 16).unwrap();

            b.iter(|| {
                bytes.clear();
                bytes.write_block(&payload).unwrap();
                bytes.flip();
                black_box(bytes.read_block().unwrap().len())
            });
        });
    }

    group.finish();
}

fn bench_atomics(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomics");

    group.throughput(Throughput::Elements(1));
    group.bench_function("cas_u64", |b| {
        let store = NativeStore::allocate(64).unwrap();
        let mut next = 1u64;

        b.iter(|| {
            let swapped = store.cas_u64_at(0, next - 1, next).unwrap();
            next += 1;
            black_box(swapped)
        });
    });
    group.bench_function("ordered_write_u64", |b| {
        let store = NativeStore::allocate(64).unwrap();

        b.iter(|| store.write_ordered_u64_at(0, black_box(42)).unwrap());
    });

    group.finish();
}

fn bench_lock_uncontended(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_uncontended");

    group.throughput(Throughput::Elements(1));
    group.bench_function("write_cycle", |b| {
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(64).unwrap());
        let lock = SharedLock::bind(Arc::clone(&store), 0).unwrap();

        b.iter(|| {
            assert!(lock.try_write_lock());
            lock.unlock_write().unwrap();
        });
    });
    group.bench_function("read_cycle", |b| {
        let store: Arc<dyn ByteStore> = Arc::new(NativeStore::allocate(64).unwrap());
        let lock = SharedLock::bind(Arc::clone(&store), 0).unwrap();

        b.iter(|| {
            assert!(lock.try_read_lock());
            lock.unlock_read().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_sequential_writes,
    bench_sequential_reads,
    bench_absolute_access,
    bench_stop_bit,
    bench_block_framing,
    bench_atomics,
    bench_lock_uncontended,
);

criterion_main!(benches);
