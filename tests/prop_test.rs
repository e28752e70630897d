use std::fs;

use proptest::prelude::*;
use tempfile::TempDir;
use whisperdb::{bulk, AggregationMethod, ArchiveSpec, CreateOptions, ResizeOptions, WhisperFile};

const NOW: u32 = 100_000;

fn spec(seconds_per_point: u32, points: u32) -> ArchiveSpec {
    ArchiveSpec { seconds_per_point, points }
}

/// One to three archives built so every layout rule holds: each coarser step
/// is `ratio ×` the finer one, retentions strictly grow, and every fine
/// archive covers at least one coarse slot.
fn arb_specs() -> impl Strategy<Value = Vec<ArchiveSpec>> {
    (
        1u32..=30,   // finest step
        2u32..=5,    // step ratio fine → mid
        2u32..=4,    // step ratio mid → coarse
        1u32..=6,    // finest points, in units of the first ratio
        0u32..=5,    // extra mid points
        0u32..=5,    // extra coarse points
        1usize..=3,  // archive count
    )
        .prop_map(|(s0, r1, r2, k0, j1, j2, count)| {
            let p0 = r1 * k0;
            let p1 = k0 + 1 + j1;
            let p2 = p1 / r2 + 1 + j2;
            let all = vec![spec(s0, p0), spec(s0 * r1, p1.max(r2)), spec(s0 * r1 * r2, p2)];
            let mut out = all[..count].to_vec();
            // Two archives alone must still satisfy the points-per-slot rule.
            if count >= 2 && out[1].seconds_per_point / out[0].seconds_per_point > out[0].points {
                out[0].points = out[1].seconds_per_point / out[0].seconds_per_point;
            }
            out
        })
        .prop_filter("retentions must strictly grow", |specs| {
            specs.windows(2).all(|w| w[1].retention() > w[0].retention())
        })
}

fn arb_method() -> impl Strategy<Value = AggregationMethod> {
    prop::sample::select(whisperdb::ALL_METHODS.to_vec())
}

fn two_level(dir: &TempDir, name: &str) -> (std::path::PathBuf, WhisperFile) {
    let path = dir.path().join(name);
    let db = WhisperFile::create(
        &path,
        &[spec(60, 10), spec(300, 10)],
        &CreateOptions::default(),
    )
    .unwrap();
    (path, db)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn create_info_roundtrip(
        specs in arb_specs(),
        method in arb_method(),
        xff_pct in 0u32..=100,
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.wsp");
        let opts = CreateOptions {
            aggregation_method: method,
            x_files_factor: xff_pct as f32 / 100.0,
            ..Default::default()
        };
        let created = WhisperFile::create(&path, &specs, &opts).unwrap();
        let created_header = created.header().clone();
        drop(created);

        prop_assert_eq!(fs::metadata(&path).unwrap().len(), created_header.file_size());

        let reopened = WhisperFile::open(&path).unwrap();
        let header = reopened.header();
        prop_assert_eq!(header.aggregation_method, method);
        prop_assert_eq!(header.x_files_factor, xff_pct as f32 / 100.0);
        prop_assert_eq!(header.archives.len(), specs.len());
        prop_assert_eq!(&header.archives, &created_header.archives);
        // Ascending precision, as validation sorts the request.
        let ascending = header.archives.windows(2).all(|w| w[0].seconds_per_point < w[1].seconds_per_point);
        prop_assert!(ascending);
    }

    #[test]
    fn update_then_fetch_returns_the_value(
        // Bounded so the aligned window still sits inside the fine archive's
        // 600s retention.
        age in 0u32..540,
        value in -1.0e9f64..1.0e9,
    ) {
        let dir = TempDir::new().unwrap();
        let (_path, mut db) = two_level(&dir, "p.wsp");
        let timestamp = NOW - age;
        db.update_at(value, timestamp, NOW).unwrap();

        let aligned = timestamp - timestamp % 60;
        let result = db.fetch_at(aligned, aligned + 60, NOW).unwrap();
        prop_assert_eq!((result.from, result.until, result.step), (aligned, aligned + 60, 60));
        prop_assert_eq!(&result.values, &vec![Some(value)]);
    }

    #[test]
    fn update_many_equals_sorted_updates(
        points in prop::collection::vec((0u32..600, -1.0e6f64..1.0e6), 1..20),
    ) {
        let dir = TempDir::new().unwrap();
        let (_pa, mut bulk_db) = two_level(&dir, "a.wsp");
        let (_pb, mut single_db) = two_level(&dir, "b.wsp");

        let points: Vec<(u32, f64)> = points.into_iter().map(|(age, v)| (NOW - age, v)).collect();
        bulk_db.update_many_at(&points, NOW).unwrap();

        let mut sorted = points.clone();
        sorted.sort_by_key(|&(ts, _)| ts);
        for (ts, value) in sorted {
            single_db.update_at(value, ts, NOW).unwrap();
        }

        prop_assert_eq!(bulk_db.archive_points(0).unwrap(), single_db.archive_points(0).unwrap());
    }

    #[test]
    fn reapplying_points_is_idempotent(
        points in prop::collection::vec((0u32..600, -1.0e6f64..1.0e6), 1..20),
    ) {
        let dir = TempDir::new().unwrap();
        let (path, mut db) = two_level(&dir, "p.wsp");
        let points: Vec<(u32, f64)> = points.into_iter().map(|(age, v)| (NOW - age, v)).collect();

        db.update_many_at(&points, NOW).unwrap();
        let first = fs::read(&path).unwrap();
        db.update_many_at(&points, NOW).unwrap();
        prop_assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn merge_twice_equals_merge_once(
        points in prop::collection::vec((0u32..600, -1.0e6f64..1.0e6), 1..20),
    ) {
        let dir = TempDir::new().unwrap();
        let (_pa, mut src) = two_level(&dir, "src.wsp");
        let (path_dst, mut dst) = two_level(&dir, "dst.wsp");

        let points: Vec<(u32, f64)> = points.into_iter().map(|(age, v)| (NOW - age, v)).collect();
        src.update_many_at(&points, NOW).unwrap();

        bulk::merge(&mut src, &mut dst, None, None, NOW).unwrap();
        let first = fs::read(&path_dst).unwrap();
        bulk::merge(&mut src, &mut dst, None, None, NOW).unwrap();
        prop_assert_eq!(fs::read(&path_dst).unwrap(), first);
    }

    #[test]
    fn fill_never_overwrites(
        // Bounded so aligned instants map to distinct fine slots; an older
        // tail would alias a ring slot and make overwriting it legitimate.
        src_points in prop::collection::vec((0u32..540, 1.0f64..100.0), 1..15),
        dst_points in prop::collection::vec((0u32..540, 1000.0f64..2000.0), 1..15),
    ) {
        let dir = TempDir::new().unwrap();
        let (_pa, mut src) = two_level(&dir, "src.wsp");
        let (_pb, mut dst) = two_level(&dir, "dst.wsp");

        let src_points: Vec<(u32, f64)> = src_points.into_iter().map(|(age, v)| (NOW - age, v)).collect();
        let dst_points: Vec<(u32, f64)> = dst_points.into_iter().map(|(age, v)| (NOW - age, v)).collect();
        src.update_many_at(&src_points, NOW).unwrap();
        dst.update_many_at(&dst_points, NOW).unwrap();

        let occupied_before: Vec<_> = dst
            .archive_points(0)
            .unwrap()
            .into_iter()
            .filter(|p| !p.is_empty())
            .collect();

        bulk::fill(&mut src, &mut dst, NOW).unwrap();

        let after = dst.archive_points(0).unwrap();
        for point in occupied_before {
            prop_assert!(after.contains(&point), "occupied slot {point:?} was rewritten");
        }
    }

    #[test]
    fn resize_size_is_exact(
        specs in arb_specs(),
        new_specs in arb_specs(),
    ) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p.wsp");
        WhisperFile::create(&path, &specs, &CreateOptions::default()).unwrap();

        let opts = ResizeOptions { force: true, nobackup: true, ..Default::default() };
        bulk::resize(&path, &new_specs, &opts, NOW).unwrap();

        let expected: u64 = 16
            + new_specs.len() as u64 * 12
            + new_specs.iter().map(|s| u64::from(s.points) * 12).sum::<u64>();
        prop_assert_eq!(fs::metadata(&path).unwrap().len(), expected);
        WhisperFile::open(&path).unwrap();
    }
}
