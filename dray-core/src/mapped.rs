//! Memory-mapped record files.
//!
//! The queue buffer, the message cache and the job-id table all share
//! one on-disk shape: an 8-byte header (a `u32` record count followed
//! by four spare header bytes) and a dense array of fixed-size
//! records. The header offset and record layouts are a contract with
//! the other daemons and the operator UI attached to the same files,
//! so this module never reorders or compacts behind their back - all
//! movement is explicit shifting, exactly as the index-based consumers
//! expect.

use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{CoreError, Result};

/// Offset of the first record: 4-byte count word + 4 header bytes.
pub const WORD_OFFSET: usize = 8;

/// Grow increment, in records, when a mapped file runs out of room.
const GROW_STEP: usize = 64;

/// Bound for records stored in a mapped file.
pub trait Record:
    FromBytes + IntoBytes + Immutable + KnownLayout + Copy + 'static
{
}

impl<T> Record for T where
    T: FromBytes + IntoBytes + Immutable + KnownLayout + Copy + 'static
{
}

/// A growable, persistent array of `T` with a count-word header.
#[derive(Debug)]
pub struct MappedRecords<T> {
    path: PathBuf,
    file: File,
    map: MmapMut,
    capacity: usize,
    _records: PhantomData<T>,
}

impl<T: Record> MappedRecords<T> {
    /// Open `path`, creating it with room for `initial_capacity`
    /// records when absent. An existing file keeps its contents; a
    /// torn count word is clamped to what the file can actually hold.
    pub fn open(path: &Path, initial_capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let min_len = (WORD_OFFSET + initial_capacity * size_of::<T>()) as u64;
        let file_len = file.metadata()?.len();
        if file_len < min_len {
            file.set_len(min_len)?;
        }
        // SAFETY: the file stays open for the lifetime of the map and
        // concurrent writers honour the record layout by contract.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let capacity = (map.len() - WORD_OFFSET) / size_of::<T>();
        let mut this = Self {
            path: path.to_path_buf(),
            file,
            map,
            capacity,
            _records: PhantomData,
        };
        if this.len() > this.capacity {
            let fixed = this.capacity;
            tracing::warn!(
                path = %this.path.display(),
                count = this.len(),
                capacity = fixed,
                "count word exceeds file size, clamping"
            );
            this.set_len(fixed);
        }
        Ok(this)
    }

    pub fn len(&self) -> usize {
        u32::from_ne_bytes(self.map[0..4].try_into().unwrap()) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_len(&mut self, len: usize) {
        self.map[0..4].copy_from_slice(&(len as u32).to_ne_bytes());
    }

    /// One of the four spare header bytes (index 0..4).
    pub fn header_byte(&self, index: usize) -> u8 {
        self.map[4 + index]
    }

    pub fn set_header_byte(&mut self, index: usize, value: u8) {
        self.map[4 + index] = value;
    }

    pub fn records(&self) -> &[T] {
        let len = self.len();
        let bytes = &self.map[WORD_OFFSET..WORD_OFFSET + len * size_of::<T>()];
        <[T]>::ref_from_bytes(bytes).expect("record layout")
    }

    pub fn records_mut(&mut self) -> &mut [T] {
        let len = self.len();
        let bytes =
            &mut self.map[WORD_OFFSET..WORD_OFFSET + len * size_of::<T>()];
        <[T]>::mut_from_bytes(bytes).expect("record layout")
    }

    pub fn get(&self, index: usize) -> &T {
        &self.records()[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut T {
        &mut self.records_mut()[index]
    }

    /// Append a record, growing the backing file when full.
    pub fn push(&mut self, record: T) -> Result<usize> {
        let index = self.len();
        self.ensure_capacity(index + 1)?;
        self.set_len(index + 1);
        *self.get_mut(index) = record;
        Ok(index)
    }

    /// Insert at `index`, shifting the tail one record to the right.
    pub fn insert(&mut self, index: usize, record: T) -> Result<()> {
        let len = self.len();
        debug_assert!(index <= len);
        self.ensure_capacity(len + 1)?;
        self.set_len(len + 1);
        let records = self.records_mut();
        records.copy_within(index..len, index + 1);
        records[index] = record;
        Ok(())
    }

    /// Remove at `index`, shifting the tail one record to the left.
    pub fn remove(&mut self, index: usize) {
        let len = self.len();
        debug_assert!(index < len);
        let records = self.records_mut();
        records.copy_within(index + 1..len, index);
        self.set_len(len - 1);
    }

    fn ensure_capacity(&mut self, needed: usize) -> Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        let new_capacity = needed.max(self.capacity + GROW_STEP);
        let new_len = (WORD_OFFSET + new_capacity * size_of::<T>()) as u64;
        self.map.flush()?;
        self.file.set_len(new_len)?;
        // SAFETY: same file, larger length; the old map is replaced.
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        Ok(())
    }

    /// Flush dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

/// Advisory write lock over a byte range of a mapped file, released on
/// drop. Other attached processes take the same ranges, which is the
/// only cross-process mutual exclusion the status areas have.
#[derive(Debug)]
pub struct RegionGuard {
    fd: RawFd,
    offset: i64,
    len: i64,
}

pub fn lock_region(fd: RawFd, offset: i64, len: i64) -> Result<RegionGuard> {
    flock_op(fd, nix::libc::F_WRLCK, offset, len)
        .map_err(CoreError::RegionLock)?;
    Ok(RegionGuard { fd, offset, len })
}

impl Drop for RegionGuard {
    fn drop(&mut self) {
        if let Err(errno) =
            flock_op(self.fd, nix::libc::F_UNLCK, self.offset, self.len)
        {
            tracing::warn!(%errno, "failed to release region lock");
        }
    }
}

fn flock_op(
    fd: RawFd,
    lock_type: nix::libc::c_int,
    offset: i64,
    len: i64,
) -> nix::Result<()> {
    let mut fl: nix::libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as i16;
    fl.l_whence = nix::libc::SEEK_SET as i16;
    fl.l_start = offset;
    fl.l_len = len;
    // SAFETY: fd is open for the caller's lifetime, fl is initialised.
    let ret = unsafe { nix::libc::fcntl(fd, nix::libc::F_SETLKW, &fl) };
    if ret == -1 {
        Err(nix::errno::Errno::last())
    } else {
        Ok(())
    }
}
