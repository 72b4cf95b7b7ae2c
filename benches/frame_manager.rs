//! Benchmarks for the frame manager hot path
//!
//! Measures one set → get → remove cycle per buffering policy, plus the
//! eviction path of a saturated overwrite queue.

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use framelink::test_utils::{RecordingOwner, frame_info};
use framelink::{BufferingPolicy, FrameManager};
use std::hint::black_box;

const CAPACITY: usize = 8;

fn bench_set_get_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_get_remove");
    group.throughput(Throughput::Elements(1));

    for policy in [
        BufferingPolicy::Discard,
        BufferingPolicy::Overwrite,
        BufferingPolicy::Realtime,
        BufferingPolicy::Unlimited,
    ] {
        let manager = FrameManager::new(policy);
        manager.init(CAPACITY, RecordingOwner::new()).expect("init");
        let mut seq = 0u64;

        group.bench_with_input(BenchmarkId::from_parameter(format!("{:?}", policy)), &policy, |b, _| {
            b.iter(|| {
                manager.set(black_box(frame_info(seq)), seq).expect("set");
                let frame = manager.get().expect("get");
                manager.remove(&frame, true).expect("remove");
                seq += 1;
            })
        });
    }

    group.finish();
}

fn bench_overwrite_eviction(c: &mut Criterion) {
    let manager = FrameManager::new(BufferingPolicy::Overwrite);
    manager.init(CAPACITY, RecordingOwner::new()).expect("init");
    for seq in 0..CAPACITY as u64 {
        manager.set(frame_info(seq), 0).expect("fill");
    }
    let mut seq = CAPACITY as u64;

    c.bench_function("overwrite_saturated_set", |b| {
        b.iter(|| {
            black_box(manager.set(black_box(frame_info(seq)), 0).expect("set"));
            seq += 1;
        })
    });
}

criterion_group!(benches, bench_set_get_remove, bench_overwrite_eviction);
criterion_main!(benches);
