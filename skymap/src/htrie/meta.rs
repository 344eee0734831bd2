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
    layout geometry
    ---
    The backing file is carved into fixed 2 MiB extents. Every extent
    reserves its leading 4 KiB page for metadata (extent 0 hosts the store
    header there; every other extent hosts its allocator header) and
    sub-allocates the rest into blocks of exactly one size class:

      - node:     128 B, one trie branch node (16 x 8 B tagged slots)
      - small:    256 B, a bucket or a complete fixed record
      - fragment: 2 KiB, a chained record head or one data fragment

    Block offsets are therefore always >= 128-byte aligned, which leaves the
    low bits of every trie slot free for tagging.
*/

pub const EXT_SHIFT: u64 = 21;
/// extent size: the unit of file growth (2 MiB)
pub const EXT_SZ: u64 = 1 << EXT_SHIFT;
pub const EXT_MASK: u64 = EXT_SZ - 1;
/// metadata page reserved at the base of every extent
pub const EXT_META_SZ: u64 = 4096;

/// key bits consumed per trie level
pub const BRANCH_BITS: u64 = 4;
/// trie fan-out
pub const BRANCH_MX: usize = 1 << BRANCH_BITS;
pub const BRANCH_MASK: u64 = (BRANCH_MX - 1) as u64;
/// full key width; descent past this shift can only overflow-chain
pub const KEY_BITS: u64 = u64::BITS as u64;

/// record-offset slots per bucket (256 B block minus the 24 B header)
pub const BUCKET_SLOTS: usize = 29;

/// low slot bit distinguishing a bucket offset from a child-node offset
pub const SLOT_BUCKET_BIT: u64 = 1;
pub const SLOT_ADDR_MASK: u64 = !(SLOT_BUCKET_BIT);

#[inline(always)]
pub const fn slot_is_bucket(v: u64) -> bool {
    v & SLOT_BUCKET_BIT != 0
}

#[inline(always)]
pub const fn slot_addr(v: u64) -> u64 {
    v & SLOT_ADDR_MASK
}

#[inline(always)]
pub const fn slot_new_bucket(off: u64) -> u64 {
    off | SLOT_BUCKET_BIT
}

#[inline(always)]
pub const fn ext_base(off: u64) -> u64 {
    off & !EXT_MASK
}

/// check a flag group against a flag
#[inline(always)]
pub const fn hf(bits: u32, f: u32) -> bool {
    bits & f == f
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
/// Block size classes. An extent belongs to exactly one class.
pub enum SizeClass {
    Node = 0,
    Small = 1,
    Fragment = 2,
}

impl SizeClass {
    pub const COUNT: usize = 3;
    #[inline(always)]
    pub const fn block_size(self) -> u64 {
        match self {
            Self::Node => 128,
            Self::Small => 256,
            Self::Fragment => 2048,
        }
    }
    #[inline(always)]
    pub const fn blocks_per_extent(self) -> u64 {
        (EXT_SZ - EXT_META_SZ) / self.block_size()
    }
    pub const fn try_from_raw(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Node),
            1 => Some(Self::Small),
            2 => Some(Self::Fragment),
            _ => None,
        }
    }
}

flags! {
    /// record state flags (high half of the record state word)
    pub struct RecFlag: u32 {
        /// fully written; visible to lookups
        COMPLETE = 0b001,
        /// logically deleted; invisible to new lookups, reclaimed once the
        /// refcount drains
        TOMBSTONE = 0b010,
        /// chained record: a fragment chain follows the header
        CHAINED = 0b100,
    }
}

flags! {
    /// bucket flags
    pub struct BucketFlag: u32 {
        /// replaced by a split; content is frozen and the block is on its
        /// way back to the free list
        RETIRED = 0b1,
    }
}

flags! {
    /// store header flags
    pub struct HdrFlag: u32 {
        /// set while a process has the table open; cleared on clean close
        DIRTY = 0b1,
    }
}

assertions! {
    EXT_META_SZ % SizeClass::Fragment.block_size() == 0,
    SizeClass::Node.block_size() as usize == BRANCH_MX * 8,
    (EXT_SZ - EXT_META_SZ) % SizeClass::Fragment.block_size() == 0,
}
