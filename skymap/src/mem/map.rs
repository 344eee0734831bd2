/*
 * Created on Wed Jan 10 2024
 *
 * This file is a part of Skymap
 * Skymap is a free and open-source embedded key/value store that maps a
 * single file into memory and indexes records in a concurrent hash trie,
 * written by Sayan Nandan ("the Author") with the vision to provide
 * predictable sub-microsecond lookups on the hot path of high-throughput
 * network services.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

/*
    mapped file
    ---
    A `MapFile` is the single backing file of a table, mapped read/write into
    the address space. Everything the store persists lives inside this
    mapping, and every inter-object link in it is a byte offset relative to
    the mapping base: the file is position independent, can land at any
    address on reopen, and the in-memory layout *is* the on-disk layout.

    The typed accessors below are the only place where offsets become
    references. They enforce range and alignment; everything past that is the
    caller's protocol (which is why they are unsafe: a `&T` into the mapping
    is only sound if `off` actually designates a `T` under the layout rules
    of the htrie module).
*/

use {
    crate::error::{StoreError, StoreResult},
    memmap2::MmapRaw,
    std::{fs, mem, path::Path, ptr},
};

pub struct MapFile {
    map: MmapRaw,
    // kept for the lifetime of the mapping
    _file: fs::File,
    len: u64,
}

impl MapFile {
    /// Create a new backing file of exactly `size` bytes (zero-filled) and
    /// map it
    pub fn create(path: &Path, size: u64) -> StoreResult<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(size)?;
        Self::map(file, size)
    }
    /// Map an existing backing file with whatever length it has
    pub fn open(path: &Path) -> StoreResult<Self> {
        let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Self::map(file, len)
    }
    fn map(file: fs::File, len: u64) -> StoreResult<Self> {
        let map = MmapRaw::map_raw(&file)?;
        Ok(Self {
            map,
            _file: file,
            len,
        })
    }
    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.len
    }
    #[inline(always)]
    fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }
    /// Validate that `[off, off + len)` lies inside the mapping
    #[inline]
    pub fn check_range(&self, off: u64, len: u64) -> StoreResult<()> {
        if off.checked_add(len).map_or(false, |end| end <= self.len) {
            Ok(())
        } else {
            Err(StoreError::Corrupted)
        }
    }
    /// Resolve `off` to a `&T` inside the mapping.
    ///
    /// ## Safety
    /// `off` must designate a live object of type `T` under the store's
    /// layout protocol. `T` may only contain atomics and plain old data.
    #[inline(always)]
    pub unsafe fn typed<T>(&self, off: u64) -> &T {
        debug_assert!(off + mem::size_of::<T>() as u64 <= self.len, "offset past mapping");
        debug_assert_eq!(off % mem::align_of::<T>() as u64, 0, "misaligned offset");
        &*(self.base().add(off as usize) as *const T)
    }
    /// Resolve `off` to a `&mut T` inside the mapping.
    ///
    /// ## Safety
    /// Same rules as [`Self::typed`], plus the caller must not hold any
    /// other reference overlapping the range.
    #[inline(always)]
    pub unsafe fn typed_mut<T>(&self, off: u64) -> &mut T {
        debug_assert!(off + mem::size_of::<T>() as u64 <= self.len, "offset past mapping");
        debug_assert_eq!(off % mem::align_of::<T>() as u64, 0, "misaligned offset");
        &mut *(self.base().add(off as usize) as *mut T)
    }
    /// Read `len` raw bytes at `off`.
    ///
    /// ## Safety
    /// The range must be in bounds and the bytes must not be concurrently
    /// mutated (record payloads are stable once the record is observable).
    #[inline(always)]
    pub unsafe fn bytes(&self, off: u64, len: usize) -> &[u8] {
        debug_assert!(off + len as u64 <= self.len, "range past mapping");
        std::slice::from_raw_parts(self.base().add(off as usize), len)
    }
    /// Copy `src` into the mapping at `off`.
    ///
    /// ## Safety
    /// The range must be in bounds and owned by the caller (unpublished
    /// block or write-locked region).
    #[inline(always)]
    pub unsafe fn copy_in(&self, off: u64, src: &[u8]) {
        debug_assert!(off + src.len() as u64 <= self.len, "range past mapping");
        ptr::copy_nonoverlapping(src.as_ptr(), self.base().add(off as usize), src.len());
    }
    /// Hand out a writable slice at `off`.
    ///
    /// ## Safety
    /// Same ownership rules as [`Self::copy_in`], and the caller must not
    /// hold any other reference overlapping the range.
    #[inline(always)]
    pub unsafe fn bytes_mut(&self, off: u64, len: usize) -> &mut [u8] {
        debug_assert!(off + len as u64 <= self.len, "range past mapping");
        std::slice::from_raw_parts_mut(self.base().add(off as usize), len)
    }
    /// Zero-fill `[off, off + len)`.
    ///
    /// ## Safety
    /// Same ownership rules as [`Self::copy_in`]
    #[inline(always)]
    pub unsafe fn zero(&self, off: u64, len: usize) {
        debug_assert!(off + len as u64 <= self.len, "range past mapping");
        ptr::write_bytes(self.base().add(off as usize), 0, len);
    }
    /// Flush the mapping to the backing file
    pub fn sync(&self) -> StoreResult<()> {
        self.map.flush()?;
        Ok(())
    }
}
