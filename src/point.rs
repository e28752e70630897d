//! Point codec — the 12-byte slot record.
//!
//! # On-disk layout (12 bytes, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   timestamp   epoch seconds; 0 = empty slot  (BE u32)
//!    4      8   value       IEEE-754 double                (BE f64)
//! ```
//!
//! A slot is self-describing: the stored timestamp *is* the occupancy marker
//! and the ring anchor.  There is no separate head pointer and no tombstone.

use byteorder::{BigEndian, ByteOrder};

/// Fixed byte size of one slot record.
pub const POINT_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub timestamp: u32,
    pub value:     f64,
}

impl Point {
    pub fn new(timestamp: u32, value: f64) -> Self {
        Self { timestamp, value }
    }

    /// An empty slot carries timestamp 0.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.timestamp == 0
    }

    pub fn pack_into(&self, buf: &mut [u8]) {
        BigEndian::write_u32(&mut buf[0..4], self.timestamp);
        BigEndian::write_f64(&mut buf[4..12], self.value);
    }

    pub fn pack(&self) -> [u8; POINT_SIZE] {
        let mut buf = [0u8; POINT_SIZE];
        self.pack_into(&mut buf);
        buf
    }

    /// Caller guarantees `buf` holds at least `POINT_SIZE` bytes.
    pub fn unpack(buf: &[u8]) -> Self {
        Self {
            timestamp: BigEndian::read_u32(&buf[0..4]),
            value:     BigEndian::read_f64(&buf[4..12]),
        }
    }
}

/// Unpack a buffer of consecutive slot records.  A trailing partial record
/// is ignored; archive regions are always a whole multiple of `POINT_SIZE`.
pub fn unpack_points(buf: &[u8]) -> Vec<Point> {
    buf.chunks_exact(POINT_SIZE).map(Point::unpack).collect()
}

/// Pack a run of points into one contiguous write.
pub fn pack_points(points: &[Point]) -> Vec<u8> {
    let mut buf = vec![0u8; points.len() * POINT_SIZE];
    for (chunk, point) in buf.chunks_exact_mut(POINT_SIZE).zip(points) {
        point.pack_into(chunk);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_roundtrip() {
        let p = Point::new(1440392088, 100.5);
        assert_eq!(Point::unpack(&p.pack()), p);
    }

    #[test]
    fn empty_slot_is_all_zero() {
        let p = Point::default();
        assert!(p.is_empty());
        assert_eq!(p.pack(), [0u8; POINT_SIZE]);
    }

    #[test]
    fn unpack_many() {
        let pts = vec![Point::new(60, 1.0), Point::new(120, -2.5), Point::default()];
        let buf = pack_points(&pts);
        assert_eq!(buf.len(), 36);
        assert_eq!(unpack_points(&buf), pts);
    }

    #[test]
    fn big_endian_wire_order() {
        // 0x55D933E8 = 1440428008, value 100.0 = 0x4059000000000000
        let buf = [0x55, 0xD9, 0x33, 0xE8, 0x40, 0x59, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let p = Point::unpack(&buf);
        assert_eq!(p.timestamp, 0x55D9_33E8);
        assert_eq!(p.value, 100.0);
    }
}
