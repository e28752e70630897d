//! High-level [`WhisperFile`] API — the primary embedding surface.
//!
//! ```no_run
//! use whisperdb::{WhisperFile, CreateOptions};
//! use whisperdb::retention::parse_retention;
//!
//! let specs = vec![parse_retention("60:1440")?, parse_retention("5m:2d")?];
//! let mut db = WhisperFile::create("load.wsp", &specs, &CreateOptions::default())?;
//! db.update(0.35, None)?;
//! let result = db.fetch(1_700_000_000, None)?;
//! # Ok::<(), whisperdb::WhisperError>(())
//! ```
//!
//! Every operation opens with the handle's [`OpenOptions`]: an advisory lock
//! (shared for reads, exclusive for writes) held for the operation's whole
//! duration when enabled, an fsync after each mutation when `flush` is set,
//! and a read-only map of the file for interval reads when `mmap` is set.

use std::fs::{File, OpenOptions as FsOpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::debug;
use memmap2::Mmap;
use serde::Serialize;

use crate::aggregate::AggregationMethod;
use crate::archive;
use crate::error::{Result, WhisperError};
use crate::header::{ArchiveInfo, Header, ARCHIVE_INFO_SIZE, METADATA_SIZE};
use crate::io::{map_readonly, write_all_at, LockGuard};
use crate::point::Point;
use crate::retention::{validate_archives, ArchiveSpec};

/// Zero-fill unit for dense creation.
const CREATE_CHUNK: usize = 16384;

/// Seconds since the Unix epoch, saturating at zero.
pub fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

// ── Options ──────────────────────────────────────────────────────────────────

/// Configuration for [`WhisperFile::create`].
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub aggregation_method: AggregationMethod,
    pub x_files_factor:     f32,
    /// Allocate the data regions as a hole instead of writing zeros.
    pub sparse:             bool,
    /// Replace an existing file instead of failing with `FileExists`.
    pub overwrite:          bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            aggregation_method: AggregationMethod::Average,
            x_files_factor:     0.5,
            sparse:             false,
            overwrite:          false,
        }
    }
}

/// Per-handle behavior of subsequent operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    /// Take the advisory file lock for the duration of each operation.
    pub lock:  bool,
    /// fsync after every mutating operation.
    pub flush: bool,
    /// Serve interval reads from a read-only map of the file.
    pub mmap:  bool,
}

// ── Fetch result ─────────────────────────────────────────────────────────────

/// One fetched window: `values[i]` covers `[from + i*step, from + (i+1)*step)`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResult {
    pub from:   u32,
    pub until:  u32,
    pub step:   u32,
    pub values: Vec<Option<f64>>,
}

impl FetchResult {
    /// The present values as `(timestamp, value)` pairs.
    pub fn points(&self) -> impl Iterator<Item = (u32, f64)> + '_ {
        let (from, step) = (self.from, self.step);
        self.values
            .iter()
            .enumerate()
            .filter_map(move |(i, v)| v.map(|val| (from + i as u32 * step, val)))
    }
}

// ── WhisperFile ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct WhisperFile {
    path:    PathBuf,
    file:    File,
    header:  Header,
    mmap:    Option<Mmap>,
    options: OpenOptions,
}

impl WhisperFile {
    // ── Constructors ─────────────────────────────────────────────────────────

    /// Create a new database.  The archive set is validated and sorted by
    /// precision; the file is laid out, zero-filled (or punched sparse) and
    /// fsynced before this returns.
    pub fn create<P: AsRef<Path>>(path: P, specs: &[ArchiveSpec], opts: &CreateOptions) -> Result<Self> {
        let path = path.as_ref();
        let mut specs = specs.to_vec();
        validate_archives(&mut specs)?;
        check_xff(opts.x_files_factor)?;

        let header = Header::layout(&specs, opts.aggregation_method, opts.x_files_factor);

        let mut open = FsOpenOptions::new();
        open.read(true).write(true);
        if opts.overwrite {
            open.create(true).truncate(true);
        } else {
            open.create_new(true);
        }
        let mut file = open.open(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                WhisperError::FileExists(path.to_path_buf())
            } else {
                WhisperError::Io(e)
            }
        })?;

        header.write(&mut file)?;
        let total = header.file_size();
        if opts.sparse {
            file.set_len(total)?;
        } else {
            let zeros = [0u8; CREATE_CHUNK];
            let mut remaining = total - (METADATA_SIZE + specs.len() * ARCHIVE_INFO_SIZE) as u64;
            while remaining > 0 {
                let n = remaining.min(zeros.len() as u64) as usize;
                file.write_all(&zeros[..n])?;
                remaining -= n as u64;
            }
        }
        file.sync_all()?;
        debug!("created {} ({total} bytes, {} archives)", path.display(), header.archives.len());

        Ok(Self {
            path: path.to_path_buf(),
            file,
            header,
            mmap: None,
            options: OpenOptions::default(),
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    /// Open and fully validate an existing database.
    pub fn open_with<P: AsRef<Path>>(path: P, options: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = FsOpenOptions::new().read(true).write(true).open(&path)?;
        let actual_size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        let header = Header::read(&mut file, actual_size)?;
        let mmap = if options.mmap { Some(map_readonly(&file)?) } else { None };
        Ok(Self { path, file, header, mmap, options })
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed header: method, retention, xFilesFactor, archive table.
    pub fn header(&self) -> &Header {
        &self.header
    }

    // ── Update ───────────────────────────────────────────────────────────────

    /// Store one value at `timestamp` (default: now), then refresh every
    /// coarser archive covering it.
    pub fn update(&mut self, value: f64, timestamp: Option<u32>) -> Result<()> {
        let now = unix_now();
        self.update_at(value, timestamp.unwrap_or(now), now)
    }

    /// Like [`update`](Self::update) with an explicit clock.
    pub fn update_at(&mut self, value: f64, timestamp: u32, now: u32) -> Result<()> {
        let _guard = self.write_guard()?;

        let idx = self
            .covering_archive(timestamp, now)
            .ok_or(WhisperError::TimestampNotCovered {
                timestamp,
                max_retention: self.header.max_retention,
            })?;
        let info = self.header.archives[idx];
        let aligned = info.align(timestamp);

        archive::write_point(&mut self.file, &info, Point::new(aligned, value))?;
        for lower_idx in idx + 1..self.header.archives.len() {
            if !self.propagate(aligned, lower_idx - 1, lower_idx)? {
                break;
            }
        }
        self.maybe_flush()
    }

    /// Bulk update.  Points are applied in ascending timestamp order, runs of
    /// adjacent slots become single writes, and each affected coarse slot is
    /// aggregated once, after all finer writes.  Points older than the
    /// maximum retention are silently dropped.
    pub fn update_many(&mut self, points: &[(u32, f64)]) -> Result<()> {
        self.update_many_at(points, unix_now())
    }

    /// Like [`update_many`](Self::update_many) with an explicit clock.
    pub fn update_many_at(&mut self, points: &[(u32, f64)], now: u32) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        let _guard = self.write_guard()?;

        let mut sorted = points.to_vec();
        sorted.sort_by_key(|&(ts, _)| ts);

        let mut groups: Vec<Vec<(u32, f64)>> = vec![Vec::new(); self.header.archives.len()];
        let mut dropped = 0usize;
        for &(ts, value) in &sorted {
            match self.covering_archive(ts, now) {
                Some(idx) => groups[idx].push((ts, value)),
                None => dropped += 1,
            }
        }
        if dropped > 0 {
            debug!("update_many: dropped {dropped} point(s) outside retention");
        }

        for idx in 0..groups.len() {
            let group = std::mem::take(&mut groups[idx]);
            if !group.is_empty() {
                self.archive_update_many(idx, &group)?;
            }
        }
        self.maybe_flush()
    }

    /// Index of the finest archive whose retention still covers `timestamp`.
    fn covering_archive(&self, timestamp: u32, now: u32) -> Option<usize> {
        let age = i64::from(now) - i64::from(timestamp);
        if age < 0 {
            return None;
        }
        self.header
            .archives
            .iter()
            .position(|a| age < i64::from(a.retention()))
    }

    fn archive_update_many(&mut self, idx: usize, points: &[(u32, f64)]) -> Result<()> {
        let info = self.header.archives[idx];

        // Align to slots; ascending input, so a later point wins its slot.
        let mut aligned: Vec<Point> = Vec::with_capacity(points.len());
        for &(ts, value) in points {
            let interval = info.align(ts);
            match aligned.last_mut() {
                Some(last) if last.timestamp == interval => last.value = value,
                _ => aligned.push(Point::new(interval, value)),
            }
        }

        // Coalesce adjacent slots into contiguous runs.
        let mut runs: Vec<&[Point]> = Vec::new();
        let mut start = 0;
        for i in 1..aligned.len() {
            if aligned[i - 1].timestamp + info.seconds_per_point != aligned[i].timestamp {
                runs.push(&aligned[start..i]);
                start = i;
            }
        }
        runs.push(&aligned[start..]);
        for run in runs {
            archive::write_run(&mut self.file, &info, run)?;
        }

        // One propagation per affected coarse slot, the fine source advancing
        // level by level.
        let mut higher_idx = idx;
        for lower_idx in idx + 1..self.header.archives.len() {
            let lower = self.header.archives[lower_idx];
            let mut intervals: Vec<u32> = aligned.iter().map(|p| lower.align(p.timestamp)).collect();
            intervals.dedup();

            let mut propagated = false;
            for interval in intervals {
                if self.propagate(interval, higher_idx, lower_idx)? {
                    propagated = true;
                }
            }
            if !propagated {
                break;
            }
            higher_idx = lower_idx;
        }
        Ok(())
    }

    // ── Propagation ──────────────────────────────────────────────────────────

    /// Refresh the one `lower` slot covering `interval` from its `higher`
    /// neighbor.  Returns false — without error — when coverage stays below
    /// the xFilesFactor, which stops propagation at this level.
    fn propagate(&mut self, interval: u32, higher_idx: usize, lower_idx: usize) -> Result<bool> {
        let higher = self.header.archives[higher_idx];
        let lower = self.header.archives[lower_idx];

        let lower_start = lower.align(interval);
        let values = archive::read_interval(
            &mut self.file,
            self.mmap.as_ref(),
            &higher,
            lower_start,
            lower_start + lower.seconds_per_point,
        )?;

        let expected = values.len();
        let known: Vec<Point> = values
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                v.map(|value| Point::new(lower_start + i as u32 * higher.seconds_per_point, value))
            })
            .collect();

        if (known.len() as f64 / expected as f64) < f64::from(self.header.x_files_factor) {
            return Ok(false);
        }
        let Some(value) = self.header.aggregation_method.aggregate(&known, expected) else {
            return Ok(false);
        };

        debug!(
            "propagate {}/{} slots into {}s archive at {lower_start}",
            known.len(),
            expected,
            lower.seconds_per_point
        );
        archive::write_point(&mut self.file, &lower, Point::new(lower_start, value))?;
        Ok(true)
    }

    // ── Fetch ────────────────────────────────────────────────────────────────

    /// Fetch `[from, until)` (default `until`: now) from the finest archive
    /// whose retention reaches back to `from`.
    pub fn fetch(&mut self, from: u32, until: Option<u32>) -> Result<FetchResult> {
        let now = unix_now();
        self.fetch_at(from, until.unwrap_or(now), now)
    }

    /// Like [`fetch`](Self::fetch) with an explicit clock.
    pub fn fetch_at(&mut self, from: u32, until: u32, now: u32) -> Result<FetchResult> {
        let _guard = self.read_guard()?;

        if from >= until {
            return Err(WhisperError::ArchiveBoundary(format!(
                "from {from} is not before until {until}"
            )));
        }
        if from > now {
            return Err(WhisperError::ArchiveBoundary(format!(
                "window [{from}, {until}) lies entirely after now {now}"
            )));
        }
        let until = until.min(now);
        let from = from.max(now.saturating_sub(self.header.max_retention));
        if from >= until {
            return Err(WhisperError::ArchiveBoundary(
                "window is empty after clamping to now and retention".into(),
            ));
        }

        // Finest archive reaching back to `from`; the clamp above guarantees
        // at least the coarsest one does.
        let span = now - from;
        let info = *self
            .header
            .archives
            .iter()
            .find(|a| a.retention() >= span)
            .ok_or_else(|| {
                WhisperError::ArchiveBoundary(format!("no archive spans {span}s of history"))
            })?;

        let step = info.seconds_per_point;
        let from_aligned = info.align(from);
        let mut until_aligned = info.align(until);
        if until_aligned <= from_aligned {
            until_aligned = from_aligned + step;
        }

        let values = archive::read_interval(
            &mut self.file,
            self.mmap.as_ref(),
            &info,
            from_aligned,
            until_aligned,
        )?;
        Ok(FetchResult { from: from_aligned, until: until_aligned, step, values })
    }

    /// Aligned interval read from one specific archive, bypassing the
    /// planner.  Bulk operations use this to walk resolutions explicitly.
    pub fn fetch_archive_at(&mut self, index: usize, from: u32, until: u32) -> Result<FetchResult> {
        let info = *self.archive_info(index)?;
        let _guard = self.read_guard()?;

        let step = info.seconds_per_point;
        let from_aligned = info.align(from);
        let mut until_aligned = info.align(until);
        if until_aligned <= from_aligned {
            until_aligned = from_aligned + step;
        }
        let values = archive::read_interval(
            &mut self.file,
            self.mmap.as_ref(),
            &info,
            from_aligned,
            until_aligned,
        )?;
        Ok(FetchResult { from: from_aligned, until: until_aligned, step, values })
    }

    /// Every slot of one archive in physical ring order, for dump listings
    /// and whole-archive copies.
    pub fn archive_points(&mut self, index: usize) -> Result<Vec<Point>> {
        let info = *self.archive_info(index)?;
        let _guard = self.read_guard()?;
        Ok(archive::read_region(&mut self.file, self.mmap.as_ref(), &info)?)
    }

    // ── Header rewrites ──────────────────────────────────────────────────────

    /// Swap the aggregation method (and optionally the xFilesFactor) in
    /// place.  Data is left untouched; returns the previous method.
    pub fn set_aggregation_method(
        &mut self,
        method: AggregationMethod,
        x_files_factor: Option<f32>,
    ) -> Result<AggregationMethod> {
        if let Some(xff) = x_files_factor {
            check_xff(xff)?;
        }
        let _guard = self.write_guard()?;
        let old = self.header.aggregation_method;
        self.header.aggregation_method = method;
        if let Some(xff) = x_files_factor {
            self.header.x_files_factor = xff;
        }
        self.rewrite_header()?;
        Ok(old)
    }

    /// Replace the xFilesFactor; returns the previous value.
    pub fn set_x_files_factor(&mut self, x_files_factor: f32) -> Result<f32> {
        check_xff(x_files_factor)?;
        let _guard = self.write_guard()?;
        let old = self.header.x_files_factor;
        self.header.x_files_factor = x_files_factor;
        self.rewrite_header()?;
        Ok(old)
    }

    fn rewrite_header(&mut self) -> Result<()> {
        let mut buf = Vec::with_capacity(METADATA_SIZE + self.header.archives.len() * ARCHIVE_INFO_SIZE);
        self.header.write(&mut buf)?;
        write_all_at(&mut self.file, 0, &buf)?;
        self.maybe_flush()
    }

    // ── Slot-level access for bulk operations ────────────────────────────────

    pub(crate) fn read_archive_slot(&mut self, index: usize, interval: u32) -> Result<Option<f64>> {
        let info = self.header.archives[index];
        Ok(archive::read_slot(&mut self.file, self.mmap.as_ref(), &info, interval)?)
    }

    /// Direct single-slot write with no propagation; `point.timestamp` must
    /// already be aligned to the archive's step.
    pub(crate) fn write_archive_point(&mut self, index: usize, point: Point) -> Result<()> {
        let info = self.header.archives[index];
        archive::write_point(&mut self.file, &info, point)?;
        Ok(())
    }

    /// Force everything down to disk.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn archive_info(&self, index: usize) -> Result<&ArchiveInfo> {
        self.header.archives.get(index).ok_or_else(|| {
            WhisperError::InvalidConfiguration(format!(
                "archive index {index} out of range (file has {})",
                self.header.archives.len()
            ))
        })
    }

    fn read_guard(&self) -> Result<LockGuard> {
        Ok(if self.options.lock { LockGuard::shared(&self.file)? } else { LockGuard::none() })
    }

    fn write_guard(&self) -> Result<LockGuard> {
        Ok(if self.options.lock { LockGuard::exclusive(&self.file)? } else { LockGuard::none() })
    }

    fn maybe_flush(&mut self) -> Result<()> {
        if self.options.flush {
            self.file.sync_all()?;
        }
        Ok(())
    }
}

fn check_xff(xff: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&xff) {
        return Err(WhisperError::InvalidConfiguration(format!(
            "xFilesFactor {xff} outside [0, 1]"
        )));
    }
    Ok(())
}
