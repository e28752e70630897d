//! Bulk operations — two-file coordination: merge, fill, diff, resize.
//!
//! All four walk archives at explicit resolutions instead of trusting the
//! fetch planner blindly, and none of them mutate a source file.  `resize`
//! is the only operation that replaces a file, and it commits by renaming a
//! fully written temporary over the target, keeping a `.bak` of the old file
//! unless suppressed.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::Serialize;

use crate::aggregate::AggregationMethod;
use crate::error::{Result, WhisperError};
use crate::file::{CreateOptions, WhisperFile};
use crate::header::Header;
use crate::point::Point;
use crate::retention::{validate_archives, ArchiveSpec};

// ── merge ────────────────────────────────────────────────────────────────────

/// Copy `src`'s data into `dst` over the optional `[from, until)` window.
///
/// Source archives are applied coarsest first, so where several resolutions
/// cover the same instant the finest one wins the collision.  Points route
/// through [`WhisperFile::update_many_at`], which re-aggregates `dst`'s
/// coarser archives from the merged data.  Returns the number of points
/// applied.
pub fn merge(
    src: &mut WhisperFile,
    dst: &mut WhisperFile,
    from: Option<u32>,
    until: Option<u32>,
    now: u32,
) -> Result<usize> {
    let mut applied = 0;
    for idx in (0..src.header().archives.len()).rev() {
        let info = src.header().archives[idx];
        let step = info.seconds_per_point;

        let lo = from.unwrap_or(0).max(now.saturating_sub(info.retention()) + step);
        let hi = until.unwrap_or(now).min(now);
        if lo >= hi {
            continue;
        }

        // Alignment can pull the window start back below `lo`; keep only the
        // requested slots.
        let window = src.fetch_archive_at(idx, lo, hi)?;
        let points: Vec<(u32, f64)> = window.points().filter(|&(ts, _)| ts >= lo && ts < hi).collect();
        if points.is_empty() {
            continue;
        }
        debug!("merge: {} point(s) from {}s archive", points.len(), step);
        applied += points.len();
        dst.update_many_at(&points, now)?;
    }
    Ok(applied)
}

// ── fill ─────────────────────────────────────────────────────────────────────

/// Copy `src` values into the empty slots of `dst`, leaving every occupied
/// `dst` slot untouched.  Each time range is handled once, by the finest
/// `dst` archive retaining it; each empty slot takes its value from the
/// finest `src` archive holding one.  Returns the number of slots filled.
pub fn fill(src: &mut WhisperFile, dst: &mut WhisperFile, now: u32) -> Result<usize> {
    let mut filled = 0;
    let mut cursor = now;

    for idx in 0..dst.header().archives.len() {
        let info = dst.header().archives[idx];
        let step = info.seconds_per_point;
        let lo = now.saturating_sub(info.retention()) + step;
        if lo >= cursor {
            cursor = cursor.min(lo);
            continue;
        }

        let window = dst.fetch_archive_at(idx, lo, cursor)?;
        for (i, value) in window.values.iter().enumerate() {
            if value.is_some() {
                continue;
            }
            let interval = window.from + i as u32 * window.step;
            if let Some(found) = finest_source_value(src, interval, now)? {
                dst.write_archive_point(idx, Point::new(interval, found))?;
                filled += 1;
            }
        }
        cursor = lo;
    }
    if filled > 0 {
        dst.sync()?;
    }
    Ok(filled)
}

/// The value stored for `interval` in the finest `src` archive whose
/// retention reaches back that far, if any.
fn finest_source_value(src: &mut WhisperFile, interval: u32, now: u32) -> Result<Option<f64>> {
    let age = now.saturating_sub(interval);
    for idx in 0..src.header().archives.len() {
        let info = src.header().archives[idx];
        if age >= info.retention() {
            continue;
        }
        let aligned = info.align(interval);
        if aligned != interval {
            // A coarser source slot only maps cleanly when the instant sits
            // on its own step boundary.
            continue;
        }
        if let Some(value) = src.read_archive_slot(idx, aligned)? {
            return Ok(Some(value));
        }
    }
    Ok(None)
}

// ── diff ─────────────────────────────────────────────────────────────────────

/// One slot where the two files disagree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiffPoint {
    pub timestamp: u32,
    pub left:      Option<f64>,
    pub right:     Option<f64>,
}

/// Per-archive diff summary.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveDiff {
    pub index:             usize,
    pub seconds_per_point: u32,
    pub total_slots:       usize,
    pub points:            Vec<DiffPoint>,
}

/// Compare two files archive-by-archive (paired by index) over the shared
/// retention window.  With `ignore_empty`, slots missing on either side are
/// skipped; otherwise a one-sided value is reported as a difference.
pub fn diff(
    left: &mut WhisperFile,
    right: &mut WhisperFile,
    ignore_empty: bool,
    until: Option<u32>,
    now: u32,
) -> Result<Vec<ArchiveDiff>> {
    let archive_count = left.header().archives.len().min(right.header().archives.len());
    let mut report = Vec::with_capacity(archive_count);

    for idx in 0..archive_count {
        let li = left.header().archives[idx];
        let ri = right.header().archives[idx];
        if li.seconds_per_point != ri.seconds_per_point {
            return Err(WhisperError::InvalidConfiguration(format!(
                "archive {idx} precision differs ({}s vs {}s)",
                li.seconds_per_point, ri.seconds_per_point
            )));
        }
        let step = li.seconds_per_point;
        let shared_retention = li.retention().min(ri.retention());
        let lo = now.saturating_sub(shared_retention) + step;
        let hi = until.unwrap_or(now).min(now);
        if lo >= hi {
            report.push(ArchiveDiff { index: idx, seconds_per_point: step, total_slots: 0, points: Vec::new() });
            continue;
        }

        let lw = left.fetch_archive_at(idx, lo, hi)?;
        let rw = right.fetch_archive_at(idx, lo, hi)?;
        let points = lw
            .values
            .iter()
            .zip(&rw.values)
            .enumerate()
            .filter(|(_, (l, r))| l != r)
            .filter(|(_, (l, r))| !ignore_empty || (l.is_some() && r.is_some()))
            .map(|(i, (&l, &r))| DiffPoint {
                timestamp: lw.from + i as u32 * step,
                left:      l,
                right:     r,
            })
            .collect();
        report.push(ArchiveDiff {
            index:             idx,
            seconds_per_point: step,
            total_slots:       lw.values.len(),
            points,
        });
    }
    Ok(report)
}

// ── resize ───────────────────────────────────────────────────────────────────

/// Configuration for [`resize`].
#[derive(Debug, Clone, Default)]
pub struct ResizeOptions {
    /// Replace the xFilesFactor; default keeps the old one.
    pub x_files_factor:     Option<f32>,
    /// Replace the aggregation method; default keeps the old one.
    pub aggregation_method: Option<AggregationMethod>,
    /// Replay data through aggregation instead of per-archive copy.
    pub aggregate:          bool,
    /// Permit a retention shrink.
    pub force:              bool,
    /// Write the resized database here and leave the original in place.
    pub newfile:            Option<PathBuf>,
    /// Skip the `.bak` copy of the original.
    pub nobackup:           bool,
}

/// Rebuild `path` with a new archive set.  The new file is fully written and
/// fsynced at a temporary path first; the rename over the original is the
/// commit point, so a failure anywhere earlier leaves the original intact.
/// Returns the path holding the resized database.
pub fn resize(path: &Path, specs: &[ArchiveSpec], opts: &ResizeOptions, now: u32) -> Result<PathBuf> {
    let mut specs = specs.to_vec();
    validate_archives(&mut specs)?;
    let mut old = WhisperFile::open(path)?;

    let new_max_retention = specs.iter().map(|s| s.retention()).max().unwrap_or(0);
    if new_max_retention < old.header().max_retention && !opts.force {
        return Err(WhisperError::InvalidConfiguration(format!(
            "resize shrinks retention from {}s to {new_max_retention}s; pass force to allow it",
            old.header().max_retention
        )));
    }

    let (target, commit) = match &opts.newfile {
        Some(p) => (p.clone(), false),
        None => (path_with_suffix(path, ".tmp"), true),
    };
    let create_opts = CreateOptions {
        aggregation_method: opts.aggregation_method.unwrap_or(old.header().aggregation_method),
        x_files_factor:     opts.x_files_factor.unwrap_or(old.header().x_files_factor),
        sparse:             false,
        overwrite:          true,
    };
    let mut new = WhisperFile::create(&target, &specs, &create_opts)?;

    if let Err(e) = populate_resized(&mut old, &mut new, opts.aggregate, now) {
        drop(new);
        let _ = fs::remove_file(&target);
        return Err(e);
    }
    new.sync()?;
    drop(new);
    drop(old);

    if commit {
        if !opts.nobackup {
            let backup = path_with_suffix(path, ".bak");
            fs::copy(path, &backup)?;
            debug!("resize: kept backup {}", backup.display());
        }
        fs::rename(&target, path)?;
        Ok(path.to_path_buf())
    } else {
        Ok(target)
    }
}

fn populate_resized(old: &mut WhisperFile, new: &mut WhisperFile, aggregate: bool, now: u32) -> Result<()> {
    if aggregate {
        // Replay through the planner: each new archive takes the span not
        // already handled by a finer new archive, re-aggregated on write.
        let mut cursor = now;
        for idx in 0..new.header().archives.len() {
            let info = new.header().archives[idx];
            let lo = now.saturating_sub(info.retention()) + info.seconds_per_point;
            if lo >= cursor {
                cursor = cursor.min(lo);
                continue;
            }
            let window = match old.fetch_at(lo, cursor, now) {
                Ok(w) => w,
                Err(WhisperError::ArchiveBoundary(_)) => {
                    cursor = lo;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let points: Vec<(u32, f64)> = window.points().filter(|&(ts, _)| ts >= lo && ts < cursor).collect();
            new.update_many_at(&points, now)?;
            cursor = lo;
        }
    } else {
        // Best-effort copy: every new archive is sourced from the old
        // archive of nearest precision, realigned slot by slot (ascending,
        // so the newest point wins a collided slot).
        for idx in 0..new.header().archives.len() {
            let info = new.header().archives[idx];
            let src_idx = nearest_archive(old.header(), info.seconds_per_point);
            let mut points: Vec<Point> = old
                .archive_points(src_idx)?
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect();
            points.sort_by_key(|p| p.timestamp);

            for point in points {
                let age = i64::from(now) - i64::from(point.timestamp);
                if age < 0 || age >= i64::from(info.retention()) {
                    continue;
                }
                new.write_archive_point(idx, Point::new(info.align(point.timestamp), point.value))?;
            }
        }
    }
    Ok(())
}

/// Index of the archive whose precision is closest to `step` (ties go to the
/// finer one).
fn nearest_archive(header: &Header, step: u32) -> usize {
    let mut best = 0;
    let mut best_distance = u32::MAX;
    for (idx, info) in header.archives.iter().enumerate() {
        let distance = info.seconds_per_point.abs_diff(step);
        if distance < best_distance {
            best = idx;
            best_distance = distance;
        }
    }
    best
}

fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
