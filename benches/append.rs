use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};
use tempfile::tempdir;

use journal::{JournalConfig, SegmentedJournal, ASQN_IGNORE};

const APPENDS_PER_ITER: usize = 10_000;
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

fn open(dir: &std::path::Path) -> SegmentedJournal {
    let config = JournalConfig {
        max_segment_size: SEGMENT_SIZE,
        ..JournalConfig::new(dir)
    };
    SegmentedJournal::open(config).expect("journal")
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    for &size in &[64_usize, 256, 1024] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    let journal = open(dir.path());
                    let payload = vec![0u8; size];
                    (dir, journal, payload)
                },
                |(_dir, mut journal, payload)| {
                    for _ in 0..APPENDS_PER_ITER {
                        journal
                            .append(ASQN_IGNORE, black_box(&payload))
                            .expect("append");
                    }
                    journal.flush().expect("flush");
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
