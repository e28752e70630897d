//! Archive ring — a circular slot region addressed by its anchor.
//!
//! The archive has no head pointer on disk.  The timestamp stored in the
//! first slot (the *anchor*) fixes the ring's rotation: the slot of an
//! aligned timestamp `t` sits at
//!
//! ```text
//! offset + ((t − anchor_ts) / step  mod  points) × 12
//! ```
//!
//! An entirely empty archive (anchor slot timestamp 0) is anchored by its
//! first write, which lands in slot 0.  A read only trusts a slot whose
//! stored timestamp equals the slot timestamp it was addressed by; anything
//! else is stale ring content and reported as missing.

use std::fs::File;
use std::io;

use memmap2::Mmap;

use crate::header::ArchiveInfo;
use crate::io::{read_exact_at, write_all_at};
use crate::point::{pack_points, unpack_points, Point, POINT_SIZE};

// ── Slot math ────────────────────────────────────────────────────────────────

/// Ring index of the slot holding aligned timestamp `interval`, given the
/// anchor timestamp.  `interval` may precede the anchor; distances are taken
/// modulo the ring length in either direction.
pub(crate) fn slot_index(info: &ArchiveInfo, anchor_ts: u32, interval: u32) -> u64 {
    let distance = (i64::from(interval) - i64::from(anchor_ts)) / i64::from(info.seconds_per_point);
    distance.rem_euclid(i64::from(info.points)) as u64
}

/// Absolute byte offset of the slot holding aligned timestamp `interval`.
pub(crate) fn slot_offset(info: &ArchiveInfo, anchor_ts: u32, interval: u32) -> u64 {
    info.offset as u64 + slot_index(info, anchor_ts, interval) * POINT_SIZE as u64
}

/// The anchor point: slot 0, whose timestamp orients the whole ring.
pub(crate) fn read_anchor(file: &mut File, mmap: Option<&Mmap>, info: &ArchiveInfo) -> io::Result<Point> {
    let mut buf = [0u8; POINT_SIZE];
    read_exact_at(file, mmap, info.offset as u64, &mut buf)?;
    Ok(Point::unpack(&buf))
}

// ── Single-slot access ───────────────────────────────────────────────────────

/// Overwrite the slot covering `point.timestamp` (already aligned by the
/// caller) with the point.
pub(crate) fn write_point(file: &mut File, info: &ArchiveInfo, point: Point) -> io::Result<()> {
    let anchor = read_anchor(file, None, info)?;
    let offset = if anchor.is_empty() {
        info.offset as u64
    } else {
        slot_offset(info, anchor.timestamp, point.timestamp)
    };
    write_all_at(file, offset, &point.pack())
}

/// Read the slot addressed by aligned timestamp `interval`; `None` when the
/// stored timestamp does not match.
pub(crate) fn read_slot(
    file: &mut File,
    mmap: Option<&Mmap>,
    info: &ArchiveInfo,
    interval: u32,
) -> io::Result<Option<f64>> {
    let anchor = read_anchor(file, mmap, info)?;
    if anchor.is_empty() {
        return Ok(None);
    }
    let mut buf = [0u8; POINT_SIZE];
    read_exact_at(file, mmap, slot_offset(info, anchor.timestamp, interval), &mut buf)?;
    let point = Point::unpack(&buf);
    Ok((point.timestamp == interval).then_some(point.value))
}

// ── Runs ─────────────────────────────────────────────────────────────────────

/// Write a run of points occupying consecutive slots (ascending, exactly one
/// step apart) as one or two contiguous writes, splitting at the ring edge.
pub(crate) fn write_run(file: &mut File, info: &ArchiveInfo, run: &[Point]) -> io::Result<()> {
    let Some(first) = run.first() else { return Ok(()) };
    let anchor = read_anchor(file, None, info)?;
    let base_ts = if anchor.is_empty() { first.timestamp } else { anchor.timestamp };

    let start = slot_offset(info, base_ts, first.timestamp);
    let packed = pack_points(run);
    let region_end = info.end();

    if start + packed.len() as u64 <= region_end {
        write_all_at(file, start, &packed)
    } else {
        let head = (region_end - start) as usize;
        write_all_at(file, start, &packed[..head])?;
        write_all_at(file, info.offset as u64, &packed[head..])
    }
}

/// Read the interval `[from, until)` (both aligned to the archive step) as
/// one value per slot, wrapping around the ring.  A slot whose stored
/// timestamp does not match its expected slot timestamp yields `None`.
pub(crate) fn read_interval(
    file: &mut File,
    mmap: Option<&Mmap>,
    info: &ArchiveInfo,
    from: u32,
    until: u32,
) -> io::Result<Vec<Option<f64>>> {
    let step = info.seconds_per_point;
    let n = ((u64::from(until) - u64::from(from)) / u64::from(step)) as usize;
    if n > info.points as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interval spans {n} slots but the archive holds {}", info.points),
        ));
    }

    let anchor = read_anchor(file, mmap, info)?;
    if anchor.is_empty() {
        return Ok(vec![None; n]);
    }

    let start = slot_offset(info, anchor.timestamp, from);
    let len = n * POINT_SIZE;
    let region_end = info.end();

    let mut buf = vec![0u8; len];
    if start + len as u64 <= region_end {
        read_exact_at(file, mmap, start, &mut buf)?;
    } else {
        let head = (region_end - start) as usize;
        read_exact_at(file, mmap, start, &mut buf[..head])?;
        read_exact_at(file, mmap, info.offset as u64, &mut buf[head..])?;
    }

    let values = unpack_points(&buf)
        .into_iter()
        .enumerate()
        .map(|(i, p)| (p.timestamp == from + i as u32 * step).then_some(p.value))
        .collect();
    Ok(values)
}

/// All slots in physical ring order, anchor slot first.  For dump-style
/// listings and whole-archive copies.
pub(crate) fn read_region(file: &mut File, mmap: Option<&Mmap>, info: &ArchiveInfo) -> io::Result<Vec<Point>> {
    let mut buf = vec![0u8; info.size()];
    read_exact_at(file, mmap, info.offset as u64, &mut buf)?;
    Ok(unpack_points(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ArchiveInfo {
        ArchiveInfo { offset: 28, seconds_per_point: 2, points: 3 }
    }

    fn ring_file(info: &ArchiveInfo, points: &[Point]) -> File {
        use std::io::Write as _;
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(&vec![0u8; info.offset as usize]).unwrap();
        f.write_all(&pack_points(points)).unwrap();
        f
    }

    #[test]
    fn slot_math_wraps_both_directions() {
        let info = info();
        let anchor = 1440392088;
        assert_eq!(slot_index(&info, anchor, 1440392088), 0);
        assert_eq!(slot_index(&info, anchor, 1440392090), 1);
        assert_eq!(slot_index(&info, anchor, 1440392092), 2);
        // wrap going up
        assert_eq!(slot_index(&info, anchor, 1440392094), 0);
        assert_eq!(slot_index(&info, anchor, 1440392096), 1);
        // wrap going down
        assert_eq!(slot_index(&info, anchor, 1440392086), 2);
        assert_eq!(slot_index(&info, anchor, 1440392084), 1);
        assert_eq!(slot_index(&info, anchor, 1440392082), 0);
    }

    #[test]
    fn slot_offset_is_byte_addressed() {
        let info = info();
        assert_eq!(slot_offset(&info, 100, 102), 28 + 12);
    }

    #[test]
    fn interval_read_wraps() {
        let info = info();
        let mut f = ring_file(
            &info,
            &[Point::new(1000, 1.0), Point::new(1002, 2.0), Point::new(1004, 3.0)],
        );
        // Start at the middle slot: [1002, 1008) wraps past the ring edge.
        // 1006 hashes to slot 0, which holds 1000 — stale, reported missing.
        let values = read_interval(&mut f, None, &info, 1002, 1008).unwrap();
        assert_eq!(values, vec![Some(2.0), Some(3.0), None]);
    }

    #[test]
    fn empty_archive_reads_all_missing() {
        let info = info();
        let mut f = ring_file(&info, &[Point::default(); 3]);
        let values = read_interval(&mut f, None, &info, 1000, 1006).unwrap();
        assert_eq!(values, vec![None; 3]);
    }

    #[test]
    fn first_write_anchors_slot_zero() {
        let info = info();
        let mut f = ring_file(&info, &[Point::default(); 3]);
        write_point(&mut f, &info, Point::new(1002, 9.0)).unwrap();
        let anchor = read_anchor(&mut f, None, &info).unwrap();
        assert_eq!(anchor, Point::new(1002, 9.0));
        assert_eq!(read_slot(&mut f, None, &info, 1002).unwrap(), Some(9.0));
    }

    #[test]
    fn run_write_splits_at_ring_edge() {
        let info = info();
        let mut f = ring_file(
            &info,
            &[Point::new(1000, 1.0), Point::new(1002, 2.0), Point::new(1004, 3.0)],
        );
        // Slots for 1004 and 1006: index 2, then wrap to index 0.
        write_run(&mut f, &info, &[Point::new(1004, 30.0), Point::new(1006, 40.0)]).unwrap();
        assert_eq!(read_slot(&mut f, None, &info, 1004).unwrap(), Some(30.0));
        assert_eq!(read_slot(&mut f, None, &info, 1006).unwrap(), Some(40.0));
        // 1006 overwrote slot 0, so it is the new anchor.
        assert_eq!(read_anchor(&mut f, None, &info).unwrap(), Point::new(1006, 40.0));
    }

    #[test]
    fn oversized_interval_is_rejected() {
        let info = info();
        let mut f = ring_file(&info, &[Point::default(); 3]);
        assert!(read_interval(&mut f, None, &info, 1000, 1010).is_err());
    }
}
