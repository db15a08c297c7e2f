use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use soundcard_rt::{Presets, RingBuffer, RingLayout, SampleFormat, TimingTable, TransportState};

fn table_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("timing_table");
    for &(samplerate, buffer_size) in &[(44_100u32, 1_024usize), (48_000, 128), (96_000, 64)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{samplerate}_{buffer_size}")),
            &(samplerate, buffer_size),
            |b, &(samplerate, buffer_size)| {
                b.iter(|| {
                    TimingTable::compute(black_box(samplerate), black_box(buffer_size), 138.0, 0.25)
                        .expect("valid table")
                });
            },
        );
    }
    group.finish();
}

fn transport_ticks(c: &mut Criterion) {
    let table = TimingTable::compute(48_000, 64, 180.0, 0.25).expect("valid table");
    c.bench_function("transport/advance_tick_4096", |b| {
        let mut transport = TransportState::new();
        b.iter(|| {
            for _ in 0..4_096 {
                black_box(transport.advance_tick(&table));
            }
        });
    });
}

fn ring_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring");
    group.measurement_time(Duration::from_secs(5));

    let presets = Presets::new(2, 48_000, 256, SampleFormat::Float);
    let ring = RingBuffer::new(RingLayout::new(4, presets, 8)).expect("valid layout");
    group.bench_function("write_read_stereo_256", |b| {
        b.iter(|| {
            let mut slot = ring.try_acquire_write().expect("free slot");
            for frame in 0..256 {
                slot.write_sample(frame, 0, 0.25);
                slot.write_sample(frame, 1, -0.25);
            }
            slot.commit().expect("no sub-block held");
            let read = ring.try_acquire_read().expect("committed slot");
            black_box(read.read_sample(255, 1));
            read.commit();
        });
    });
    group.finish();
}

criterion_group!(benches, table_compute, transport_ticks, ring_cycle);
criterion_main!(benches);
