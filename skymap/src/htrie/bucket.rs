/*
 * Created on Sun Jan 14 2024
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
    buckets
    ---
    A bucket is one small block: a 24 B header followed by 29 record-offset
    slots. Buckets that collide past the trie's maximum depth chain through
    `next`.

    Writer protocol: every mutation of a chain happens under the *chain
    head's* lock word (one writer per chain keeps install/remove/split
    trivially exclusive), and every bucket a writer actually touches gets its
    version counter bumped to odd and back around the mutation.

    Reader protocol: sample an even version, scan the slots in place, resample
    and retry on mismatch. Records are never moved by anybody, so a slot
    value is either zero or a record offset that stays dereferenceable for at
    least as long as the reader's epoch pin. Matching candidates are pinned
    afterwards with the record-state CAS, which rejects anything that got
    tombstoned between scan and pin.
*/

use {
    super::{
        meta::{hf, BucketFlag, SizeClass, BUCKET_SLOTS},
        Htrie,
    },
    crate::{
        error::{StoreError, StoreResult},
        sync::{
            atm::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
            spin::{ver_read_begin, ver_read_ok, ver_write_begin, ver_write_end, READ_RETRY_MX},
            Backoff,
        },
    },
    core::{
        mem,
        sync::atomic::{AtomicU32, AtomicU64},
    },
};

#[repr(C)]
pub struct BucketHdr {
    /// chain lock; meaningful only on the chain head
    pub lock: AtomicU32,
    /// even = stable, odd = writer inside
    pub ver: AtomicU32,
    flags: AtomicU32,
    _pad: u32,
    /// overflow link (0 = end)
    pub next: AtomicU64,
    /// record offsets (0 = empty)
    pub slots: [AtomicU64; BUCKET_SLOTS],
}

assertions! {
    mem::size_of::<BucketHdr>() as u64 == SizeClass::Small.block_size(),
    mem::align_of::<BucketHdr>() == 8,
}

impl BucketHdr {
    pub fn is_retired(&self) -> bool {
        hf(self.flags.load(ORD_ACQ), BucketFlag::RETIRED.d())
    }
    /// Freeze this bucket ahead of replacing it. Caller holds the chain
    /// lock.
    pub(super) fn retire(&self) {
        self.flags.fetch_or(BucketFlag::RETIRED.d(), ORD_ACR);
    }
}

/// fixed-capacity scratch for one bucket scan: (slot index, record offset)
pub(super) struct SlotMatches {
    n: usize,
    a: [(u32, u64); BUCKET_SLOTS],
}

impl SlotMatches {
    pub const fn new() -> Self {
        Self {
            n: 0,
            a: [(0, 0); BUCKET_SLOTS],
        }
    }
    fn clear(&mut self) {
        self.n = 0;
    }
    fn push(&mut self, slot: usize, off: u64) {
        debug_assert!(self.n < BUCKET_SLOTS);
        self.a[self.n] = (slot as u32, off);
        self.n += 1;
    }
    pub fn iter(&self) -> impl Iterator<Item = (usize, u64)> + '_ {
        self.a[..self.n].iter().map(|&(i, off)| (i as usize, off))
    }
}

impl Htrie {
    #[inline(always)]
    pub(super) fn bucket(&self, off: u64) -> &BucketHdr {
        unsafe {
            // UNSAFE(@ohsayan): bucket offsets only originate from tagged
            // trie slots and overflow links
            self.map.typed::<BucketHdr>(off)
        }
    }
    /// Allocate a zeroed bucket
    pub(super) fn alloc_bucket(&self) -> StoreResult<u64> {
        let off = self.alloc_block(SizeClass::Small)?;
        unsafe {
            // UNSAFE(@ohsayan): unpublished block
            self.map.zero(off, SizeClass::Small.block_size() as usize);
        }
        self.hdr().stats.n_buckets.fetch_add(1, ORD_RLX);
        Ok(off)
    }
    /// Optimistically collect the occupied slots of one bucket, starting at
    /// slot `start`, filtered by `key` if given. The collected set is a
    /// consistent snapshot (version validated); candidates still have to be
    /// pinned individually by the caller.
    pub(super) fn bucket_scan(
        &self,
        boff: u64,
        key: Option<u64>,
        start: usize,
        out: &mut SlotMatches,
    ) -> StoreResult<()> {
        let b = self.bucket(boff);
        let backoff = Backoff::new();
        let mut tries = READ_RETRY_MX;
        loop {
            let v1 = ver_read_begin(&b.ver)?;
            out.clear();
            for i in start..BUCKET_SLOTS {
                let off = b.slots[i].load(ORD_ACQ);
                if off == 0 {
                    continue;
                }
                if key.map_or(true, |k| self.rec_hdr(off).key() == k) {
                    out.push(i, off);
                }
            }
            if ver_read_ok(&b.ver, v1) {
                return Ok(());
            }
            if tries == 0 {
                return Err(StoreError::Transient);
            }
            tries -= 1;
            backoff.snooze();
        }
    }
    /// Install a record offset into the first empty slot of this bucket.
    /// Caller holds the chain lock. Returns false if the bucket is full.
    pub(super) fn bucket_install_locked(&self, boff: u64, rec_off: u64) -> bool {
        let b = self.bucket(boff);
        for slot in b.slots.iter() {
            if slot.load(ORD_RLX) == 0 {
                ver_write_begin(&b.ver);
                slot.store(rec_off, ORD_REL);
                ver_write_end(&b.ver);
                return true;
            }
        }
        false
    }
    /// Clear one slot. Caller holds the chain lock and already tombstoned
    /// the record.
    pub(super) fn bucket_clear_slot_locked(&self, boff: u64, slot: usize) {
        let b = self.bucket(boff);
        debug_assert_ne!(b.slots[slot].load(ORD_RLX), 0, "clearing empty slot");
        ver_write_begin(&b.ver);
        b.slots[slot].store(0, ORD_REL);
        ver_write_end(&b.ver);
    }
}
