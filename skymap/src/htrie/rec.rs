/*
 * Created on Sat Jan 13 2024
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
    records
    ---
    Two shapes share one header:

      fixed:    [RecHdr | payload]                      (one 256 B block)
      chained:  [RecHdr | FragHdr | payload]            (one 2 KiB block)
                      -> [FragHdr | payload] -> ...     (2 KiB blocks)

    The record state is a single atomic word: low 32 bits are the refcount,
    high 32 bits the flags. Packing both lets a reader pin a record with one
    CAS that simultaneously rejects tombstoned records, and lets release
    observe the reclaim predicate (refcount zero AND tombstoned) atomically.

    A record is born with refcount 2: one share owned by the index for as
    long as the record is installed, one handed to the caller. Fixed records
    are born complete; chained records are born incomplete and only become
    visible to lookups once the writer marks them complete.

    Fragment lengths are write cursors. A writer that abandons the tail of a
    fragment (because the next write would not fit contiguously) chops the
    fragment's capacity down to its cursor, so the skipped bytes can never be
    observed and a writer resuming the chain lands on the right fragment.
*/

use {
    super::{
        meta::{hf, RecFlag, SizeClass},
        Htrie,
    },
    crate::{
        error::{StoreError, StoreResult},
        sync::atm::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
    },
    core::{
        mem,
        sync::atomic::{AtomicU32, AtomicU64},
    },
};

pub(super) const REC_HDR_SZ: u64 = 24;
pub(super) const FRAG_HDR_SZ: u64 = 16;
/// payload capacity of a fixed record
pub const SMALL_CAP: usize = (SizeClass::Small.block_size() - REC_HDR_SZ) as usize;
/// payload capacity of a standalone fragment block
pub const FRAG_CAP: usize = (SizeClass::Fragment.block_size() - FRAG_HDR_SZ) as usize;
/// payload capacity of the fragment inlined in a chained record's head block
pub const HEAD_FRAG_CAP: usize =
    (SizeClass::Fragment.block_size() - REC_HDR_SZ - FRAG_HDR_SZ) as usize;

const REFS_MASK: u64 = u32::MAX as u64;

#[inline(always)]
const fn mk_state(refs: u32, flags: u32) -> u64 {
    ((flags as u64) << 32) | refs as u64
}

#[inline(always)]
const fn st_refs(st: u64) -> u32 {
    (st & REFS_MASK) as u32
}

#[inline(always)]
const fn st_flags(st: u64) -> u32 {
    (st >> 32) as u32
}

#[repr(C)]
/// common record header
pub struct RecHdr {
    key: u64,
    /// low 32: refcount, high 32: `RecFlag`s
    state: AtomicU64,
    /// payload bytes written (total across fragments for chained records)
    len: AtomicU32,
    /// payload capacity (fixed records only; 0 for chained)
    cap: u32,
}

#[repr(C)]
/// fragment header; payload follows inline
pub struct FragHdr {
    /// next fragment block (0 = end of chain)
    next: AtomicU64,
    /// write cursor within this fragment
    len: AtomicU32,
    /// payload capacity; chopped down to `len` when the tail is abandoned
    cap: AtomicU32,
}

assertions! {
    mem::size_of::<RecHdr>() as u64 == REC_HDR_SZ,
    mem::size_of::<FragHdr>() as u64 == FRAG_HDR_SZ,
    mem::align_of::<RecHdr>() == 8,
    mem::align_of::<FragHdr>() == 8,
}

impl RecHdr {
    #[inline(always)]
    pub fn key(&self) -> u64 {
        self.key
    }
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len.load(ORD_ACQ) as usize
    }
    #[inline(always)]
    fn flags(&self) -> u32 {
        st_flags(self.state.load(ORD_ACQ))
    }
    #[inline(always)]
    pub fn is_complete(&self) -> bool {
        hf(self.flags(), RecFlag::COMPLETE.d())
    }
    #[inline(always)]
    pub fn is_tombstoned(&self) -> bool {
        hf(self.flags(), RecFlag::TOMBSTONE.d())
    }
    #[inline(always)]
    pub fn is_chained(&self) -> bool {
        hf(self.flags(), RecFlag::CHAINED.d())
    }
    /// Make the record visible to lookups. Payload writes made before this
    /// call are visible to any reader that observes the flag.
    pub fn mark_complete(&self) {
        self.state
            .fetch_or((RecFlag::COMPLETE.d() as u64) << 32, ORD_REL);
    }
    /// Logically delete the record. Idempotent; visibility ends here,
    /// reclamation waits for the refcount.
    pub(super) fn tombstone(&self) {
        self.state
            .fetch_or((RecFlag::TOMBSTONE.d() as u64) << 32, ORD_ACR);
    }
    /// Try to take a shared reference: succeeds iff the record is complete
    /// and not tombstoned at CAS time
    pub(crate) fn try_ref(&self) -> bool {
        loop {
            let st = self.state.load(ORD_ACQ);
            let fl = st_flags(st);
            if !hf(fl, RecFlag::COMPLETE.d()) || hf(fl, RecFlag::TOMBSTONE.d()) {
                return false;
            }
            if self
                .state
                .compare_exchange(st, st + 1, ORD_ACR, ORD_ACQ)
                .is_ok()
            {
                return true;
            }
        }
    }
    /// Take an additional share on a record we already hold
    pub(crate) fn keep_ref(&self) {
        let prev = self.state.fetch_add(1, ORD_ACR);
        debug_assert!(st_refs(prev) > 0, "keep on a dead record");
    }
    /// Drop one share. Returns true iff this was the last share of a
    /// tombstoned record, i.e. the caller must reclaim the blocks.
    pub(crate) fn put_ref(&self) -> bool {
        loop {
            let st = self.state.load(ORD_ACQ);
            let refs = st_refs(st);
            debug_assert!(refs > 0, "refcount underflow (double put)");
            if refs == 0 {
                // saturate instead of wrapping in release builds
                return false;
            }
            let new = st - 1;
            if self
                .state
                .compare_exchange(st, new, ORD_ACR, ORD_ACQ)
                .is_ok()
            {
                return st_refs(new) == 0 && hf(st_flags(new), RecFlag::TOMBSTONE.d());
            }
        }
    }
    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        st_refs(self.state.load(ORD_ACQ))
    }
}

#[inline(always)]
pub(super) const fn head_frag_off(rec_off: u64) -> u64 {
    rec_off + REC_HDR_SZ
}

impl Htrie {
    #[inline(always)]
    pub(crate) fn rec_hdr(&self, off: u64) -> &RecHdr {
        unsafe {
            // UNSAFE(@ohsayan): record offsets only originate from bucket
            // slots and guards, which follow the layout protocol
            self.map.typed::<RecHdr>(off)
        }
    }
    #[inline(always)]
    pub(super) fn frag_hdr(&self, off: u64) -> &FragHdr {
        unsafe {
            // UNSAFE(@ohsayan): fragment offsets only originate from record
            // chains
            self.map.typed::<FragHdr>(off)
        }
    }
    /// Allocate and fully materialize a fixed record. Born complete.
    pub(crate) fn new_fixed(&self, key: u64, data: &[u8]) -> StoreResult<u64> {
        debug_assert!(!data.is_empty() && data.len() <= SMALL_CAP);
        let off = self.alloc_block(SizeClass::Small)?;
        unsafe {
            // UNSAFE(@ohsayan): the block is unpublished; we own it
            let h = self.map.typed_mut::<RecHdr>(off);
            h.key = key;
            h.state = AtomicU64::new(mk_state(2, RecFlag::COMPLETE.d()));
            h.len = AtomicU32::new(data.len() as u32);
            h.cap = SMALL_CAP as u32;
            self.map.copy_in(off + REC_HDR_SZ, data);
        }
        Ok(off)
    }
    /// Allocate an incomplete chained record with capacity for at least
    /// `len` bytes
    pub(crate) fn new_chained(&self, key: u64, len: usize) -> StoreResult<u64> {
        debug_assert!(len > 0);
        let off = self.alloc_block(SizeClass::Fragment)?;
        unsafe {
            // UNSAFE(@ohsayan): unpublished block
            let h = self.map.typed_mut::<RecHdr>(off);
            h.key = key;
            h.state = AtomicU64::new(mk_state(2, RecFlag::CHAINED.d()));
            h.len = AtomicU32::new(0);
            h.cap = 0;
            let f = self.map.typed_mut::<FragHdr>(head_frag_off(off));
            f.next = AtomicU64::new(0);
            f.len = AtomicU32::new(0);
            f.cap = AtomicU32::new(HEAD_FRAG_CAP as u32);
        }
        if len > HEAD_FRAG_CAP {
            if let Err(e) = self.grow_chain(head_frag_off(off), len - HEAD_FRAG_CAP) {
                self.free_rec_chain(off);
                return Err(e);
            }
        }
        Ok(off)
    }
    /// Append fragment blocks after `tail_frag` until at least `need` more
    /// payload bytes fit
    fn grow_chain(&self, mut tail_frag: u64, need: usize) -> StoreResult<()> {
        debug_assert_eq!(self.frag_hdr(tail_frag).next.load(ORD_RLX), 0);
        let mut got = 0;
        while got < need {
            let foff = self.alloc_block(SizeClass::Fragment)?;
            unsafe {
                // UNSAFE(@ohsayan): unpublished block
                let f = self.map.typed_mut::<FragHdr>(foff);
                f.next = AtomicU64::new(0);
                f.len = AtomicU32::new(0);
                f.cap = AtomicU32::new(FRAG_CAP as u32);
            }
            // link after the current tail; readers that follow the link also
            // observe the initialized fragment
            self.frag_hdr(tail_frag).next.store(foff, ORD_REL);
            tail_frag = foff;
            got += FRAG_CAP;
        }
        Ok(())
    }
    /// Ensure the chain of `rec_off` has room for at least `additional` more
    /// payload bytes past the current write cursor
    pub(crate) fn reserve(&self, rec_off: u64, additional: usize) -> StoreResult<()> {
        let rec = self.rec_hdr(rec_off);
        if !rec.is_chained() || additional == 0 {
            return Err(StoreError::BadInput);
        }
        let mut avail = 0usize;
        let mut frag = head_frag_off(rec_off);
        loop {
            let f = self.frag_hdr(frag);
            avail += (f.cap.load(ORD_ACQ) - f.len.load(ORD_ACQ)) as usize;
            let next = f.next.load(ORD_ACQ);
            if next == 0 {
                break;
            }
            frag = next;
        }
        if avail < additional {
            self.grow_chain(frag, additional - avail)?;
        }
        Ok(())
    }
    /// Free every block of a record. Only sound once the record is
    /// unreachable: tombstoned, refcount zero, and past its grace period.
    pub(crate) fn free_rec_chain(&self, rec_off: u64) {
        let rec = self.rec_hdr(rec_off);
        if !rec.is_chained() {
            self.free_block(rec_off, SizeClass::Small);
            return;
        }
        let mut frag = self.frag_hdr(head_frag_off(rec_off)).next.load(ORD_ACQ);
        self.free_block(rec_off, SizeClass::Fragment);
        while frag != 0 {
            let next = self.frag_hdr(frag).next.load(ORD_ACQ);
            self.free_block(frag, SizeClass::Fragment);
            frag = next;
        }
    }
}

/// A non-owning view of a record, handed to equality callbacks and backing
/// the public guard type. Callbacks must treat it as read-only and must
/// tolerate tombstoned records.
pub struct RecView<'a> {
    t: &'a Htrie,
    off: u64,
}

impl<'a> RecView<'a> {
    pub(crate) fn new(t: &'a Htrie, off: u64) -> Self {
        Self { t, off }
    }
    #[inline(always)]
    fn hdr(&self) -> &'a RecHdr {
        self.t.rec_hdr(self.off)
    }
    pub fn key(&self) -> u64 {
        self.hdr().key()
    }
    /// total payload bytes written so far
    pub fn len(&self) -> usize {
        self.hdr().len()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
    pub fn is_complete(&self) -> bool {
        self.hdr().is_complete()
    }
    pub fn is_tombstoned(&self) -> bool {
        self.hdr().is_tombstoned()
    }
    /// Iterate the payload as contiguous chunks (exactly one for a fixed
    /// record, one per fragment otherwise)
    pub fn chunks(&self) -> RecChunks<'a> {
        let h = self.hdr();
        if h.is_chained() {
            RecChunks::Chain {
                t: self.t,
                frag: head_frag_off(self.off),
            }
        } else {
            RecChunks::Fixed {
                t: self.t,
                off: self.off,
                done: false,
            }
        }
    }
    /// Collect the payload into an owned buffer
    pub fn read_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }
}

pub enum RecChunks<'a> {
    Fixed { t: &'a Htrie, off: u64, done: bool },
    Chain { t: &'a Htrie, frag: u64 },
}

impl<'a> Iterator for RecChunks<'a> {
    type Item = &'a [u8];
    fn next(&mut self) -> Option<&'a [u8]> {
        match self {
            Self::Fixed { t, off, done } => {
                if *done {
                    return None;
                }
                *done = true;
                let len = t.rec_hdr(*off).len();
                Some(unsafe {
                    // UNSAFE(@ohsayan): `len` payload bytes were published
                    // before the cursor moved past them
                    t.map.bytes(*off + REC_HDR_SZ, len)
                })
            }
            Self::Chain { t, frag } => {
                while *frag != 0 {
                    let f = t.frag_hdr(*frag);
                    let len = f.len.load(ORD_ACQ) as usize;
                    let cur = *frag;
                    *frag = f.next.load(ORD_ACQ);
                    if len != 0 {
                        return Some(unsafe {
                            // UNSAFE(@ohsayan): same argument as above
                            t.map.bytes(cur + FRAG_HDR_SZ, len)
                        });
                    }
                }
                None
            }
        }
    }
}

/// Write cursor over an incomplete chained record. Only the thread that owns
/// the incomplete record may drive this.
pub struct RecWriter<'a> {
    t: &'a Htrie,
    rec: u64,
    frag: u64,
}

impl<'a> RecWriter<'a> {
    pub(crate) fn new(t: &'a Htrie, rec_off: u64) -> StoreResult<Self> {
        let h = t.rec_hdr(rec_off);
        if !h.is_chained() || h.is_complete() {
            return Err(StoreError::BadInput);
        }
        // resume at the first fragment with unchopped room
        let mut frag = head_frag_off(rec_off);
        loop {
            let f = t.frag_hdr(frag);
            if f.len.load(ORD_ACQ) < f.cap.load(ORD_ACQ) {
                break;
            }
            let next = f.next.load(ORD_ACQ);
            if next == 0 {
                break;
            }
            frag = next;
        }
        Ok(Self {
            t,
            rec: rec_off,
            frag,
        })
    }
    /// Contiguous writable room of at least `tail_len` bytes, abandoning
    /// (chopping) the current fragment's tail if it cannot fit. `total_hint`
    /// sizes the chain growth when new fragments are needed. Commit written
    /// bytes with [`Self::advance`].
    pub fn room(&mut self, tail_len: usize, total_hint: usize) -> StoreResult<&mut [u8]> {
        if tail_len == 0 || tail_len > FRAG_CAP {
            return Err(StoreError::BadInput);
        }
        loop {
            let f = self.t.frag_hdr(self.frag);
            let len = f.len.load(ORD_RLX) as usize;
            let cap = f.cap.load(ORD_RLX) as usize;
            if cap - len >= tail_len {
                return Ok(unsafe {
                    // UNSAFE(@ohsayan): past-cursor region of a fragment
                    // owned by this writer
                    self.t
                        .map
                        .bytes_mut(self.frag + FRAG_HDR_SZ + len as u64, cap - len)
                });
            }
            // chop the tail so nobody ever resumes into the gap
            f.cap.store(len as u32, ORD_REL);
            let next = f.next.load(ORD_ACQ);
            if next != 0 {
                self.frag = next;
            } else {
                self.t.grow_chain(self.frag, tail_len.max(total_hint))?;
                self.frag = f.next.load(ORD_ACQ);
            }
        }
    }
    /// Commit `n` bytes written into the slice returned by [`Self::room`]
    pub fn advance(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let f = self.t.frag_hdr(self.frag);
        let len = f.len.load(ORD_RLX) as usize;
        debug_assert!(len + n <= f.cap.load(ORD_RLX) as usize, "advance past room");
        f.len.store((len + n) as u32, ORD_REL);
        self.t
            .rec_hdr(self.rec)
            .len
            .fetch_add(n as u32, ORD_REL);
    }
    /// Copy `data` into the record at the cursor, growing the chain as
    /// needed
    pub fn append(&mut self, mut data: &[u8]) -> StoreResult<()> {
        while !data.is_empty() {
            let room = self.room(data.len().min(FRAG_CAP), data.len())?;
            let n = room.len().min(data.len());
            room[..n].copy_from_slice(&data[..n]);
            self.advance(n);
            data = &data[n..];
        }
        Ok(())
    }
}
