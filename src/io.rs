//! File I/O driver — positioned access, advisory locking, durability.
//!
//! Reads go either through the seekable handle or, when the caller opted in,
//! through a read-only shared map of the whole file; both see writes issued
//! through the handle.  Writes always go through the handle and always emit
//! whole slot records.  Locks are advisory (`flock` semantics): readers take
//! shared, writers exclusive, and the guard releases on every exit path.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use fs2::FileExt;
use memmap2::Mmap;

// ── Positioned access ────────────────────────────────────────────────────────

/// Read `buf.len()` bytes at `offset`, from the map when one is active.
pub(crate) fn read_exact_at(
    file: &mut File,
    mmap: Option<&Mmap>,
    offset: u64,
    buf: &mut [u8],
) -> io::Result<()> {
    if let Some(map) = mmap {
        let start = offset as usize;
        let end = start + buf.len();
        if end > map.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("mapped read [{start}, {end}) beyond {} mapped bytes", map.len()),
            ));
        }
        buf.copy_from_slice(&map[start..end]);
        Ok(())
    } else {
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)
    }
}

/// Write all of `buf` at `offset`.
pub(crate) fn write_all_at(file: &mut File, offset: u64, buf: &[u8]) -> io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)
}

/// Map the whole file read-only.
pub(crate) fn map_readonly(file: &File) -> io::Result<Mmap> {
    // Safety: the map is read-only and private to this handle; concurrent
    // writers can at worst surface a torn 12-byte slot, which the slot
    // timestamp check already tolerates.
    unsafe { Mmap::map(file) }
}

// ── Scoped advisory lock ─────────────────────────────────────────────────────

/// Held for the whole operation; unlocks on drop.  The guard owns a
/// duplicated handle — dup'd descriptors share the open file description, so
/// the lock taken here covers the handle the operation writes through while
/// leaving that handle free to borrow mutably.  `LockGuard::none` is the
/// opt-out used when locking is disabled for the open handle.
pub(crate) struct LockGuard {
    file: Option<File>,
}

impl LockGuard {
    pub(crate) fn shared(file: &File) -> io::Result<Self> {
        let dup = file.try_clone()?;
        dup.lock_shared()?;
        Ok(Self { file: Some(dup) })
    }

    pub(crate) fn exclusive(file: &File) -> io::Result<Self> {
        let dup = file.try_clone()?;
        dup.lock_exclusive()?;
        Ok(Self { file: Some(dup) })
    }

    pub(crate) fn none() -> Self {
        Self { file: None }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            let _ = file.unlock();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn positioned_read_and_write() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&[0u8; 32]).unwrap();

        write_all_at(&mut tmp, 8, b"abcd").unwrap();
        let mut buf = [0u8; 4];
        read_exact_at(&mut tmp, None, 8, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn mapped_read_sees_writes_and_bounds_checks() {
        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(&[7u8; 16]).unwrap();
        let map = map_readonly(&tmp).unwrap();

        let mut buf = [0u8; 4];
        read_exact_at(&mut tmp, Some(&map), 12, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 4]);
        assert!(read_exact_at(&mut tmp, Some(&map), 14, &mut buf).is_err());
    }

    #[test]
    fn lock_guard_releases_on_drop() {
        let tmp = tempfile::tempfile().unwrap();
        {
            let _guard = LockGuard::exclusive(&tmp).unwrap();
        }
        // Re-acquiring after drop must succeed.
        let _guard = LockGuard::shared(&tmp).unwrap();
    }
}
