/*
 * Created on Fri Jan 12 2024
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
    extent and block allocators
    ---
    The extent allocator is a bump cursor in the store header: extents are
    claimed in file order and never returned (a claimed extent belongs to
    its size class for the life of the table). The block allocator runs per
    extent: a bump index for virgin blocks plus an offset-linked free list
    for recycled ones, both guarded by the extent's spinlock. Freed blocks
    store the next free offset in their leading 8 bytes.

    Per-class extent chains (`ClassHead::first` -> `ExtHdr::next`) let an
    exhausted hint sweep older extents for recycled blocks before growing
    the file. `ClassHead::current` is only ever a hint; correctness lives
    under the extent locks.

    Extent bases are encoded as index + 1 in the chains so that a zero word
    in a fresh (zero-filled) file reads as "none" even though extent 0 is a
    perfectly valid extent.
*/

use {
    super::{
        meta::{ext_base, SizeClass, EXT_META_SZ, EXT_SHIFT, EXT_SZ},
        Htrie,
    },
    crate::{
        error::{StoreError, StoreResult},
        sync::{
            atm::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
            spin::SpinGuard,
        },
    },
    core::{
        mem,
        sync::atomic::{AtomicU32, AtomicU64},
    },
    log::trace,
};

#[repr(C)]
/// per-extent allocator header, living in the extent's metadata page
pub struct ExtHdr {
    /// size class this extent serves (`SizeClass` as u32)
    class: AtomicU32,
    /// guards `bump`, `free_head`, `free_count`
    lock: AtomicU32,
    /// index of the next virgin block
    bump: AtomicU32,
    /// blocks currently on the free list
    free_count: AtomicU32,
    /// head of the offset-linked free list (0 = empty)
    free_head: AtomicU64,
    /// next extent of the same class (index + 1 encoding, 0 = end)
    pub next: AtomicU64,
}

assertions! {
    mem::size_of::<ExtHdr>() == 32,
    mem::align_of::<ExtHdr>() == 8,
}

#[inline(always)]
const fn enc_ext(base: u64) -> u64 {
    (base >> EXT_SHIFT) + 1
}

#[inline(always)]
const fn dec_ext(v: u64) -> u64 {
    (v - 1) << EXT_SHIFT
}

impl Htrie {
    #[inline(always)]
    pub(super) fn ext_hdr(&self, base: u64) -> &ExtHdr {
        debug_assert_eq!(base % EXT_SZ, 0, "not an extent base");
        if base == 0 {
            // extent 0's metadata page is the store header itself
            &self.hdr().ext0
        } else {
            unsafe {
                // UNSAFE(@ohsayan): extent bases come from the bounded
                // cursor, and the metadata page is reserved by layout
                self.map.typed::<ExtHdr>(base)
            }
        }
    }
    /// Allocate one block of the given class, growing the file if every
    /// extent of the class is exhausted
    pub(super) fn alloc_block(&self, c: SizeClass) -> StoreResult<u64> {
        let head = self.hdr().class(c);
        loop {
            let cur = head.current.load(ORD_ACQ);
            if cur != 0 {
                if let Some(off) = self.ext_try_alloc(dec_ext(cur), c) {
                    return Ok(off);
                }
                // hint exhausted: sweep the class chain for recycled blocks
                let mut e = head.first.load(ORD_ACQ);
                while e != 0 {
                    let base = dec_ext(e);
                    if e != cur {
                        if let Some(off) = self.ext_try_alloc(base, c) {
                            head.current.store(e, ORD_RLX);
                            return Ok(off);
                        }
                    }
                    e = self.ext_hdr(base).next.load(ORD_ACQ);
                }
            }
            self.grow_class(c)?;
        }
    }
    fn ext_try_alloc(&self, base: u64, c: SizeClass) -> Option<u64> {
        let e = self.ext_hdr(base);
        debug_assert_eq!(e.class.load(ORD_RLX), c as u32, "class mismatch");
        let _g = SpinGuard::lock(&e.lock);
        let fh = e.free_head.load(ORD_RLX);
        if fh != 0 {
            let next = unsafe {
                // UNSAFE(@ohsayan): free blocks carry the next free offset
                // in their leading word
                self.map.typed::<AtomicU64>(fh)
            }
            .load(ORD_RLX);
            e.free_head.store(next, ORD_RLX);
            e.free_count.fetch_sub(1, ORD_RLX);
            return Some(fh);
        }
        let bump = e.bump.load(ORD_RLX) as u64;
        if bump < c.blocks_per_extent() {
            e.bump.store((bump + 1) as u32, ORD_RLX);
            return Some(base + EXT_META_SZ + bump * c.block_size());
        }
        None
    }
    /// Return a block to its extent's free list
    pub(super) fn free_block(&self, off: u64, c: SizeClass) {
        let base = ext_base(off);
        let e = self.ext_hdr(base);
        debug_assert_eq!(e.class.load(ORD_RLX), c as u32, "class mismatch");
        debug_assert_eq!((off - EXT_META_SZ) % c.block_size(), 0, "bad block offset");
        {
            let _g = SpinGuard::lock(&e.lock);
            let fh = e.free_head.load(ORD_RLX);
            unsafe {
                // UNSAFE(@ohsayan): the block is dead; its leading word now
                // carries the free list link
                self.map.typed::<AtomicU64>(off)
            }
            .store(fh, ORD_RLX);
            e.free_head.store(off, ORD_RLX);
            e.free_count.fetch_add(1, ORD_RLX);
        }
        // steer the next allocation back to this extent
        self.hdr().class(c).current.store(enc_ext(base), ORD_RLX);
    }
    fn grow_class(&self, c: SizeClass) -> StoreResult<()> {
        let hdr = self.hdr();
        let head = hdr.class(c);
        let _g = SpinGuard::lock(&head.grow_lock);
        // somebody else may have grown while we waited on the lock
        let cur = head.current.load(ORD_ACQ);
        if cur != 0 && self.ext_has_room(dec_ext(cur), c) {
            return Ok(());
        }
        // claim the next extent; the cursor is shared by all classes
        let mut base;
        loop {
            base = hdr.ext_cursor.load(ORD_ACQ);
            if base >= hdr.fsize() {
                return Err(StoreError::NoSpace);
            }
            if hdr
                .ext_cursor
                .compare_exchange(base, base + EXT_SZ, ORD_ACR, ORD_ACQ)
                .is_ok()
            {
                break;
            }
        }
        let e = self.ext_hdr(base);
        e.class.store(c as u32, ORD_RLX);
        e.lock.store(0, ORD_RLX);
        e.bump.store(0, ORD_RLX);
        e.free_count.store(0, ORD_RLX);
        e.free_head.store(0, ORD_RLX);
        e.next.store(head.first.load(ORD_RLX), ORD_RLX);
        // publish: anyone who observes the extent also observes its header
        head.first.store(enc_ext(base), ORD_REL);
        head.current.store(enc_ext(base), ORD_REL);
        hdr.stats.n_extents.fetch_add(1, ORD_RLX);
        trace!("extent {} assigned to class {:?}", base >> EXT_SHIFT, c);
        Ok(())
    }
    fn ext_has_room(&self, base: u64, c: SizeClass) -> bool {
        let e = self.ext_hdr(base);
        e.free_count.load(ORD_RLX) > 0 || (e.bump.load(ORD_RLX) as u64) < c.blocks_per_extent()
    }
    /// Validate the allocator metadata of every claimed extent in a
    /// reopened image
    pub(super) fn verify_extents(&self) -> StoreResult<()> {
        let hdr = self.hdr();
        let cursor = hdr.ext_cursor.load(ORD_ACQ);
        let mut base = 0;
        while base < cursor {
            let e = self.ext_hdr(base);
            let Some(c) = SizeClass::try_from_raw(e.class.load(ORD_RLX)) else {
                return Err(StoreError::Corrupted);
            };
            if (e.bump.load(ORD_RLX) as u64) > c.blocks_per_extent() {
                return Err(StoreError::Corrupted);
            }
            base += EXT_SZ;
        }
        Ok(())
    }
}

#[cfg(test)]
impl Htrie {
    /// (class, blocks handed out, blocks on the free list) for one extent
    pub(crate) fn ext_usage(&self, base: u64) -> (SizeClass, u64, u64) {
        let e = self.ext_hdr(base);
        let c = SizeClass::try_from_raw(e.class.load(ORD_RLX)).unwrap();
        let _g = SpinGuard::lock(&e.lock);
        (
            c,
            e.bump.load(ORD_RLX) as u64,
            e.free_count.load(ORD_RLX) as u64,
        )
    }
    /// every extent base currently assigned to `c`
    pub(crate) fn class_extents(&self, c: SizeClass) -> Vec<u64> {
        let mut out = vec![];
        let mut e = self.hdr().class(c).first.load(ORD_ACQ);
        while e != 0 {
            let base = dec_ext(e);
            out.push(base);
            e = self.ext_hdr(base).next.load(ORD_ACQ);
        }
        out
    }
}
