//! File header — format anchor at offset 0.
//!
//! # On-disk layout (all fields big-endian)
//!
//! ```text
//! Offset      Size  Field
//!    0          4   aggregation_method   frozen code 1..8        (BE u32)
//!    4          4   max_retention        seconds, = largest span (BE u32)
//!    8          4   x_files_factor       in [0, 1]               (BE f32)
//!   12          4   archive_count        ≥ 1                     (BE u32)
//!   16       N×12   archive_info[N]      ascending step order
//!   16+N×12   ...   archive data regions, contiguous, in table order
//! ```
//!
//! Each archive_info record:
//!
//! ```text
//! Offset  Size  Field
//!    0      4   offset             absolute byte offset of the region (BE u32)
//!    4      4   seconds_per_point                                    (BE u32)
//!    8      4   points             ring capacity                     (BE u32)
//! ```
//!
//! # Validation
//! `read` rejects the file before any data access when: `archive_count` is 0,
//! the aggregation code is unknown, `x_files_factor` is outside [0, 1], the
//! archive table is not in strictly ascending step order, any region escapes
//! the actual file size, or the layout-implied size disagrees with the actual
//! size.  There is no partial open.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;

use crate::aggregate::AggregationMethod;
use crate::error::{Result, WhisperError};
use crate::point::POINT_SIZE;
use crate::retention::ArchiveSpec;

/// Byte size of the fixed metadata block.
pub const METADATA_SIZE: usize = 16;
/// Byte size of one archive_info record.
pub const ARCHIVE_INFO_SIZE: usize = 12;

/// Location and shape of one archive's data region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArchiveInfo {
    pub offset:            u32,
    pub seconds_per_point: u32,
    pub points:            u32,
}

impl ArchiveInfo {
    /// Seconds of history this archive retains.
    #[inline]
    pub fn retention(&self) -> u32 {
        self.seconds_per_point * self.points
    }

    /// Byte size of the data region.
    #[inline]
    pub fn size(&self) -> usize {
        self.points as usize * POINT_SIZE
    }

    /// One past the last byte of the data region.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset as u64 + self.size() as u64
    }

    /// Snap a raw timestamp down to this archive's step.
    #[inline]
    pub fn align(&self, timestamp: u32) -> u32 {
        timestamp - (timestamp % self.seconds_per_point)
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub aggregation_method: AggregationMethod,
    pub max_retention:      u32,
    pub x_files_factor:     f32,
    pub archives:           Vec<ArchiveInfo>,
}

impl Header {
    /// Lay out a header for a validated, ascending archive set.  Regions are
    /// placed contiguously after the archive_info table.
    pub fn layout(specs: &[ArchiveSpec], aggregation_method: AggregationMethod, x_files_factor: f32) -> Self {
        let mut offset = (METADATA_SIZE + specs.len() * ARCHIVE_INFO_SIZE) as u32;
        let archives = specs
            .iter()
            .map(|s| {
                let info = ArchiveInfo {
                    offset,
                    seconds_per_point: s.seconds_per_point,
                    points: s.points,
                };
                offset += info.size() as u32;
                info
            })
            .collect::<Vec<_>>();
        let max_retention = archives.iter().map(ArchiveInfo::retention).max().unwrap_or(0);
        Header { aggregation_method, max_retention, x_files_factor, archives }
    }

    /// Total file size implied by this header.
    pub fn file_size(&self) -> u64 {
        let data: u64 = self.archives.iter().map(|a| a.size() as u64).sum();
        METADATA_SIZE as u64 + (self.archives.len() * ARCHIVE_INFO_SIZE) as u64 + data
    }

    /// Write the metadata block and the archive_info table.
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_u32::<BigEndian>(self.aggregation_method.code())?;
        w.write_u32::<BigEndian>(self.max_retention)?;
        w.write_f32::<BigEndian>(self.x_files_factor)?;
        w.write_u32::<BigEndian>(self.archives.len() as u32)?;
        for info in &self.archives {
            w.write_u32::<BigEndian>(info.offset)?;
            w.write_u32::<BigEndian>(info.seconds_per_point)?;
            w.write_u32::<BigEndian>(info.points)?;
        }
        Ok(())
    }

    /// Read and fully validate a header.  `actual_size` is the on-disk file
    /// size; any disagreement with the layout is corruption.
    pub fn read<R: Read>(mut r: R, actual_size: u64) -> Result<Self> {
        let code          = r.read_u32::<BigEndian>()?;
        let max_retention = r.read_u32::<BigEndian>()?;
        let xff           = r.read_f32::<BigEndian>()?;
        let archive_count = r.read_u32::<BigEndian>()?;

        let aggregation_method = AggregationMethod::from_code(code)
            .ok_or_else(|| WhisperError::CorruptFile(format!("unknown aggregation code {code}")))?;
        if !(0.0..=1.0).contains(&xff) {
            return Err(WhisperError::CorruptFile(format!("xFilesFactor {xff} outside [0, 1]")));
        }
        if archive_count == 0 {
            return Err(WhisperError::CorruptFile("archive_count is 0".into()));
        }
        // An archive_info table larger than the file is unreadable garbage.
        let table_end = METADATA_SIZE as u64 + archive_count as u64 * ARCHIVE_INFO_SIZE as u64;
        if table_end > actual_size {
            return Err(WhisperError::CorruptFile(format!(
                "archive_count {archive_count} overflows the {actual_size}-byte file"
            )));
        }

        let mut archives: Vec<ArchiveInfo> = Vec::with_capacity(archive_count as usize);
        for i in 0..archive_count {
            let info = ArchiveInfo {
                offset:            r.read_u32::<BigEndian>()?,
                seconds_per_point: r.read_u32::<BigEndian>()?,
                points:            r.read_u32::<BigEndian>()?,
            };
            if info.seconds_per_point == 0 || info.points == 0 {
                return Err(WhisperError::CorruptFile(format!("archive {i} has a zero field")));
            }
            if info.end() > actual_size {
                return Err(WhisperError::CorruptFile(format!(
                    "archive {i} region [{}, {}) escapes the {actual_size}-byte file",
                    info.offset,
                    info.end()
                )));
            }
            if let Some(prev) = archives.last() {
                if info.seconds_per_point <= prev.seconds_per_point {
                    return Err(WhisperError::CorruptFile(
                        "archive table is not in ascending step order".into(),
                    ));
                }
            }
            archives.push(info);
        }

        let header = Header { aggregation_method, max_retention, x_files_factor: xff, archives };
        if header.file_size() != actual_size {
            return Err(WhisperError::CorruptFile(format!(
                "layout implies {} bytes but the file holds {actual_size}",
                header.file_size()
            )));
        }
        Ok(header)
    }
}
