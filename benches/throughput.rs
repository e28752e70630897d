use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tempfile::TempDir;
use whisperdb::{unix_now, ArchiveSpec, CreateOptions, WhisperFile};

fn bench_engine(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bench.wsp");
    let specs = [
        ArchiveSpec { seconds_per_point: 10, points: 8640 },
        ArchiveSpec { seconds_per_point: 60, points: 10080 },
    ];
    let mut db = WhisperFile::create(&path, &specs, &CreateOptions::default()).unwrap();
    let now = unix_now();

    let mut ts = now - 5000;
    c.bench_function("update_one_point", |b| {
        b.iter(|| {
            ts += 10;
            if ts > now {
                ts = now - 5000;
            }
            db.update_at(black_box(1.5), ts, now).unwrap();
        })
    });

    let points: Vec<(u32, f64)> = (0..500).map(|i| (now - 5000 + i * 10, f64::from(i))).collect();
    c.bench_function("update_many_500", |b| {
        b.iter(|| db.update_many_at(black_box(&points), now).unwrap())
    });

    c.bench_function("fetch_1h", |b| {
        b.iter(|| db.fetch_at(black_box(now - 3600), now, now).unwrap())
    });
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
