/*
 * Created on Thu Jan 11 2024
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
    store header
    ---
    The header occupies the metadata page of extent 0 and is the root of
    everything: geometry, the trie root offset, the extent cursor, per-class
    allocator heads and the runtime statistics. The static prefix (bytes
    [0, 48)) never changes after format and is protected by a CRC64/XZ
    checksum; everything after it is mutable at runtime and lives in atomics.

    The DIRTY flag is raised while a process has the table open and cleared
    on clean close. A table that was not closed cleanly fails validation:
    refcounts and free lists in the image are then meaningless and we refuse
    to serve from it.
*/

use {
    super::{
        alloc::ExtHdr,
        meta::{hf, HdrFlag, SizeClass, EXT_META_SZ, EXT_SZ},
    },
    crate::{
        error::{StoreError, StoreResult},
        mem::MapFile,
        sync::atm::{ORD_ACQ, ORD_ACR, ORD_RLX},
    },
    core::{
        mem,
        sync::atomic::{AtomicU32, AtomicU64},
    },
    crc::{Crc, CRC_64_XZ},
};

pub const HDR_MAGIC: u64 = 0x534B_594D_4150_3031; // "SKYMAP01"
pub const HDR_VERSION: u32 = 1;
/// length of the static, checksummed header prefix
const HDR_CHK_COVER: usize = 48;

// NOTE(@ohsayan): same polynomial we use everywhere else in the family
const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

#[repr(C)]
/// per-class allocator head
pub struct ClassHead {
    /// most recent extent of this class; extents chain via `ExtHdr::next`
    pub first: AtomicU64,
    /// allocation hint: extent to try first
    pub current: AtomicU64,
    /// serializes file growth for this class
    pub grow_lock: AtomicU32,
    _pad: u32,
}

#[repr(C)]
pub struct HdrStats {
    /// records currently installed (complete or not)
    pub n_records: AtomicU64,
    /// live buckets
    pub n_buckets: AtomicU64,
    /// live trie nodes
    pub n_nodes: AtomicU64,
    /// extents handed out
    pub n_extents: AtomicU64,
}

#[repr(C)]
pub struct StoreHdr {
    magic: u64,
    version: u32,
    rec_hint: u32,
    fsize: u64,
    ext_sz: u64,
    root: u64,
    node: u32,
    _pad0: u32,
    checksum: u64,
    flags: AtomicU32,
    _pad1: u32,
    pub ext_cursor: AtomicU64,
    classes: [ClassHead; SizeClass::COUNT],
    pub stats: HdrStats,
    /// extent 0's allocator header (its metadata page is this very header)
    pub ext0: ExtHdr,
}

assertions! {
    mem::size_of::<StoreHdr>() as u64 <= EXT_META_SZ,
    mem::offset_of!(StoreHdr, checksum) == HDR_CHK_COVER,
    mem::align_of::<StoreHdr>() == 8,
}

impl StoreHdr {
    #[inline(always)]
    pub fn root(&self) -> u64 {
        self.root
    }
    #[inline(always)]
    pub fn fsize(&self) -> u64 {
        self.fsize
    }
    #[inline(always)]
    pub fn class(&self, c: SizeClass) -> &ClassHead {
        &self.classes[c as usize]
    }
    pub fn set_dirty(&self) {
        self.flags.fetch_or(HdrFlag::DIRTY.d(), ORD_ACR);
    }
    pub fn clear_dirty(&self) {
        self.flags.fetch_and(!HdrFlag::DIRTY.d(), ORD_ACR);
    }
    pub fn is_dirty(&self) -> bool {
        hf(self.flags.load(ORD_ACQ), HdrFlag::DIRTY.d())
    }
}

/// Resolve the shared header view
#[inline(always)]
pub fn hdr(map: &MapFile) -> &StoreHdr {
    unsafe {
        // UNSAFE(@ohsayan): offset 0 is the header by definition; format or
        // verify ran before anyone got here
        map.typed::<StoreHdr>(0)
    }
}

/// Write the static header fields of a freshly created file. The caller
/// still owns the mapping exclusively.
pub(super) fn format(map: &MapFile, rec_hint: u32, node: u32) {
    let h = unsafe {
        // UNSAFE(@ohsayan): exclusive access during format
        map.typed_mut::<StoreHdr>(0)
    };
    h.magic = HDR_MAGIC;
    h.version = HDR_VERSION;
    h.rec_hint = rec_hint;
    h.fsize = map.len();
    h.ext_sz = EXT_SZ;
    h.root = 0;
    h.node = node;
}

/// Record the root offset and seal the static prefix with its checksum.
/// Runs once at the end of format, still under exclusive access.
pub(super) fn seal(map: &MapFile, root: u64) {
    let h = unsafe {
        // UNSAFE(@ohsayan): exclusive access during format
        map.typed_mut::<StoreHdr>(0)
    };
    h.root = root;
    h.checksum = CRC64.checksum(unsafe {
        // UNSAFE(@ohsayan): static prefix, no concurrent writers yet
        map.bytes(0, HDR_CHK_COVER)
    });
}

/// Validate the header of a reopened file against what the caller expects
pub(super) fn verify(map: &MapFile, rec_hint: u32, node: u32) -> StoreResult<()> {
    map.check_range(0, EXT_META_SZ)?;
    let h = unsafe {
        // UNSAFE(@ohsayan): range checked above; contents validated below
        map.typed::<StoreHdr>(0)
    };
    if h.magic != HDR_MAGIC || h.version != HDR_VERSION {
        return Err(StoreError::Corrupted);
    }
    let crc = CRC64.checksum(unsafe {
        // UNSAFE(@ohsayan): static prefix never changes after seal
        map.bytes(0, HDR_CHK_COVER)
    });
    if crc != h.checksum
        || h.fsize != map.len()
        || h.ext_sz != EXT_SZ
        || h.rec_hint != rec_hint
        || h.node != node
    {
        return Err(StoreError::Corrupted);
    }
    if h.is_dirty() {
        // the last owner never closed this table; refcounts and free lists
        // in the image can't be trusted
        return Err(StoreError::Corrupted);
    }
    if h.root == 0 || h.root % SizeClass::Node.block_size() != 0 {
        return Err(StoreError::Corrupted);
    }
    map.check_range(h.root, SizeClass::Node.block_size())?;
    let cursor = h.ext_cursor.load(ORD_RLX);
    if cursor % EXT_SZ != 0 || cursor > h.fsize {
        return Err(StoreError::Corrupted);
    }
    Ok(())
}
