/*
 * Created on Mon Jan 15 2024
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

mod alloc;
mod bucket;
mod hdr;
pub mod iter;
pub mod meta;
pub mod rec;
#[cfg(test)]
mod tests;

/*
    hash trie
    ---
    The index is a trie over the caller's 64 bit key, consuming 4 bits per
    level starting from the least significant group. A slot is either empty,
    a tagged bucket offset, or a child node offset; descent stops at the
    first empty or bucket slot. Everything in the trie is an offset into the
    mapping, so the whole structure survives a remap at a different address.

    Writers publish into slots with a single release CAS and retry from the
    same slot when they lose; a slot moves empty -> bucket -> child node and
    never backwards, so readers need no locks on the way down. A full bucket
    below the maximum depth is split: its records are redistributed into a
    fresh child node (the records themselves never move, only the container
    changes) and the old bucket is retired behind an epoch grace period. At
    maximum depth buckets chain through their overflow link instead.

    Reclamation: retired buckets and dead record chains go through
    crossbeam-epoch deferred callbacks. Every operation that resolves
    offsets runs under an epoch pin, which is exactly what makes it sound to
    keep dereferencing a bucket that a concurrent split just unlinked.
*/

use {
    self::{
        hdr::StoreHdr,
        meta::{
            slot_addr, slot_is_bucket, slot_new_bucket, SizeClass, BRANCH_BITS, BRANCH_MASK,
            BRANCH_MX, BUCKET_SLOTS, EXT_MASK, EXT_META_SZ, KEY_BITS,
        },
        rec::{RecView, RecWriter},
    },
    crate::{
        error::{StoreError, StoreResult},
        mem::MapFile,
        sync::{
            atm::{Guard, ORD_ACQ, ORD_REL, ORD_RLX},
            spin::{ver_write_begin, ver_write_end, SpinGuard},
        },
    },
    core::sync::atomic::AtomicU64,
    log::trace,
};

/// record equality callback: pure, must not call back into the store, must
/// tolerate tombstoned and incomplete records
pub type EqCb<'a> = dyn Fn(&RecView<'_>) -> bool + 'a;

/// parameters of the get-or-allocate compound
pub struct GetAlloc<'a> {
    /// payload capacity to provision if allocation is needed
    pub len: usize,
    /// picks the existing record to return
    pub eq: &'a EqCb<'a>,
    /// may veto allocation after the lookup missed
    pub precreate: Option<&'a dyn Fn() -> StoreResult<()>>,
    /// populates the fresh record; invoked exactly once, inside the
    /// critical section
    pub init: &'a dyn Fn(&mut RecWriter<'_>) -> StoreResult<()>,
}

/// Offsets whose blocks must be reclaimed once the current grace period
/// expires. Filled by mutating operations, drained by the owning handle
/// into epoch-deferred callbacks.
#[derive(Default)]
pub struct Reclaim {
    /// dead records (refcount hit zero while tombstoned)
    pub recs: Vec<u64>,
    /// buckets unlinked by splits
    pub buckets: Vec<u64>,
}

impl Reclaim {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn is_empty(&self) -> bool {
        self.recs.is_empty() && self.buckets.is_empty()
    }
}

pub struct Htrie {
    pub(self) map: MapFile,
}

impl Htrie {
    /// Format a freshly created mapping and bring up an empty trie
    pub(crate) fn create(map: MapFile, rec_hint: u32, node: u32) -> StoreResult<Self> {
        hdr::format(&map, rec_hint, node);
        let t = Self { map };
        let root = t.alloc_node()?;
        debug_assert_eq!(root, EXT_META_SZ, "root not first block of extent 0");
        hdr::seal(&t.map, root);
        t.hdr().set_dirty();
        t.map.sync()?;
        Ok(t)
    }
    /// Validate and adopt an existing mapping
    pub(crate) fn open(map: MapFile, rec_hint: u32, node: u32) -> StoreResult<Self> {
        hdr::verify(&map, rec_hint, node)?;
        let t = Self { map };
        t.verify_extents()?;
        t.verify_image()?;
        t.hdr().set_dirty();
        Ok(t)
    }
    /// Clean shutdown: drop the dirty flag and flush the mapping
    pub(crate) fn close(&self) -> StoreResult<()> {
        self.hdr().clear_dirty();
        self.map.sync()
    }
    #[inline(always)]
    pub(self) fn hdr(&self) -> &StoreHdr {
        hdr::hdr(&self.map)
    }
    pub(crate) fn fsize(&self) -> u64 {
        self.hdr().fsize()
    }
    /// (records, buckets, nodes, extents)
    pub(crate) fn stats_snapshot(&self) -> (u64, u64, u64, u64) {
        let s = &self.hdr().stats;
        (
            s.n_records.load(ORD_RLX),
            s.n_buckets.load(ORD_RLX),
            s.n_nodes.load(ORD_RLX),
            s.n_extents.load(ORD_RLX),
        )
    }
    pub(crate) fn sync(&self) -> StoreResult<()> {
        self.map.sync()
    }
    fn alloc_node(&self) -> StoreResult<u64> {
        let off = self.alloc_block(SizeClass::Node)?;
        unsafe {
            // UNSAFE(@ohsayan): unpublished block
            self.map.zero(off, SizeClass::Node.block_size() as usize);
        }
        self.hdr().stats.n_nodes.fetch_add(1, ORD_RLX);
        Ok(off)
    }
    #[inline(always)]
    pub(self) fn node_slot(&self, node_off: u64, idx: usize) -> &AtomicU64 {
        debug_assert!(idx < BRANCH_MX);
        unsafe {
            // UNSAFE(@ohsayan): node offsets only originate from slots and
            // the header root
            self.map.typed::<AtomicU64>(node_off + (idx as u64) * 8)
        }
    }
    /// Descend to the collision chain for `key`, if any. Caller must hold an
    /// epoch pin for the returned offset to stay dereferenceable.
    pub(crate) fn find_chain(&self, key: u64, _g: &Guard) -> Option<u64> {
        let mut node = self.hdr().root();
        let mut shift = 0;
        loop {
            let idx = ((key >> shift) & BRANCH_MASK) as usize;
            let v = self.node_slot(node, idx).load(ORD_ACQ);
            if v == 0 {
                return None;
            }
            if slot_is_bucket(v) {
                return Some(slot_addr(v));
            }
            node = v;
            shift += BRANCH_BITS;
        }
    }
    /// Install an already materialized record under `key`. With `uniq`, any
    /// equal complete record in the target chain is tombstoned and unlinked
    /// first, inside the same critical section.
    pub(crate) fn insert_rec(
        &self,
        key: u64,
        rec_off: u64,
        uniq: Option<&EqCb<'_>>,
        rc: &mut Reclaim,
        _g: &Guard,
    ) -> StoreResult<()> {
        let mut node = self.hdr().root();
        let mut shift = 0;
        loop {
            let idx = ((key >> shift) & BRANCH_MASK) as usize;
            let slot = self.node_slot(node, idx);
            let v = slot.load(ORD_ACQ);
            if v == 0 {
                // publish a fresh bucket with the record pre-installed
                let boff = self.alloc_bucket()?;
                self.bucket(boff).slots[0].store(rec_off, ORD_RLX);
                match slot.compare_exchange(0, slot_new_bucket(boff), ORD_REL, ORD_ACQ) {
                    Ok(_) => {
                        self.hdr().stats.n_records.fetch_add(1, ORD_RLX);
                        return Ok(());
                    }
                    Err(_) => {
                        // lost the race; the bucket was never published
                        self.hdr().stats.n_buckets.fetch_sub(1, ORD_RLX);
                        self.free_block(boff, SizeClass::Small);
                        continue;
                    }
                }
            }
            if !slot_is_bucket(v) {
                node = v;
                shift += BRANCH_BITS;
                continue;
            }
            let head = slot_addr(v);
            let b = self.bucket(head);
            let _lk = SpinGuard::lock(&b.lock);
            // the chain may have been split away while we waited on the lock
            if slot.load(ORD_ACQ) != v {
                continue;
            }
            debug_assert!(!b.is_retired(), "retired bucket still linked");
            if let Some(eq) = uniq {
                self.unlink_matching_locked(head, key, Some(eq), false, rc);
            }
            // install into the first free slot along the chain
            let mut cur = head;
            let tail = loop {
                if self.bucket_install_locked(cur, rec_off) {
                    self.hdr().stats.n_records.fetch_add(1, ORD_RLX);
                    return Ok(());
                }
                let nx = self.bucket(cur).next.load(ORD_ACQ);
                if nx == 0 {
                    break cur;
                }
                cur = nx;
            };
            if shift + BRANCH_BITS < KEY_BITS {
                // full below max depth: split and redescend
                debug_assert_eq!(
                    b.next.load(ORD_RLX),
                    0,
                    "overflow chain below max depth"
                );
                self.split_locked(slot, v, head, shift + BRANCH_BITS, rc)?;
                continue;
            }
            // full at max depth: grow the overflow chain
            let nb = self.alloc_bucket()?;
            self.bucket(nb).slots[0].store(rec_off, ORD_RLX);
            self.bucket(tail).next.store(nb, ORD_REL);
            self.hdr().stats.n_records.fetch_add(1, ORD_RLX);
            return Ok(());
        }
    }
    /// Split a full bucket: redistribute its records into a fresh child node
    /// by the next key bit group, swing the parent slot over, retire the
    /// bucket. Caller holds the chain lock.
    fn split_locked(
        &self,
        parent_slot: &AtomicU64,
        parent_val: u64,
        old_head: u64,
        child_shift: u64,
        rc: &mut Reclaim,
    ) -> StoreResult<()> {
        let node_off = self.alloc_node()?;
        let mut created = [0u64; BRANCH_MX];
        let mut created_n = 0;
        let old = self.bucket(old_head);
        let mut res = Ok(());
        'fill: for i in 0..BUCKET_SLOTS {
            let r = old.slots[i].load(ORD_RLX);
            if r == 0 {
                continue;
            }
            let j = ((self.rec_hdr(r).key() >> child_shift) & BRANCH_MASK) as usize;
            let cslot = self.node_slot(node_off, j);
            let cv = cslot.load(ORD_RLX);
            if cv == 0 {
                let nb = match self.alloc_bucket() {
                    Ok(nb) => nb,
                    Err(e) => {
                        res = Err(e);
                        break 'fill;
                    }
                };
                created[created_n] = nb;
                created_n += 1;
                self.bucket(nb).slots[0].store(r, ORD_RLX);
                cslot.store(slot_new_bucket(nb), ORD_RLX);
            } else {
                debug_assert!(slot_is_bucket(cv));
                let ok = self.bucket_install_locked(slot_addr(cv), r);
                debug_assert!(ok, "child bucket overflowed during split");
            }
        }
        if let Err(e) = res {
            // undo the unpublished subtree
            for nb in &created[..created_n] {
                self.hdr().stats.n_buckets.fetch_sub(1, ORD_RLX);
                self.free_block(*nb, SizeClass::Small);
            }
            self.hdr().stats.n_nodes.fetch_sub(1, ORD_RLX);
            self.free_block(node_off, SizeClass::Node);
            return Err(e);
        }
        // freeze the old bucket and publish the subtree. Concurrent readers
        // either finish on the frozen content (a valid pre-split snapshot)
        // or resample and redescend into the new node.
        old.retire();
        ver_write_begin(&old.ver);
        let swung = parent_slot
            .compare_exchange(parent_val, node_off, ORD_REL, ORD_ACQ)
            .is_ok();
        ver_write_end(&old.ver);
        debug_assert!(swung, "parent slot moved under the chain lock");
        self.hdr().stats.n_buckets.fetch_sub(1, ORD_RLX);
        rc.buckets.push(old_head);
        trace!("split bucket @{old_head} into node @{node_off}");
        Ok(())
    }
    /// Tombstone and unlink every record in the chain that matches `key`
    /// (and `eq`, if given). Incomplete records are skipped unless `force`.
    /// Caller holds the chain lock. Returns the number of records removed.
    fn unlink_matching_locked(
        &self,
        head: u64,
        key: u64,
        eq: Option<&EqCb<'_>>,
        force: bool,
        rc: &mut Reclaim,
    ) -> usize {
        let mut n = 0;
        let mut cur = head;
        loop {
            let b = self.bucket(cur);
            for i in 0..BUCKET_SLOTS {
                let r = b.slots[i].load(ORD_RLX);
                if r == 0 {
                    continue;
                }
                let h = self.rec_hdr(r);
                if h.key() != key {
                    continue;
                }
                debug_assert!(!h.is_tombstoned(), "tombstoned record still linked");
                if !h.is_complete() && !force {
                    continue;
                }
                if let Some(eq) = eq {
                    if !eq(&RecView::new(self, r)) {
                        continue;
                    }
                }
                h.tombstone();
                self.bucket_clear_slot_locked(cur, i);
                if h.put_ref() {
                    rc.recs.push(r);
                }
                self.hdr().stats.n_records.fetch_sub(1, ORD_RLX);
                n += 1;
            }
            cur = b.next.load(ORD_ACQ);
            if cur == 0 {
                break;
            }
        }
        n
    }
    /// Remove records under `key`. See [`Self::unlink_matching_locked`] for
    /// the matching rules.
    pub(crate) fn remove(
        &self,
        key: u64,
        eq: Option<&EqCb<'_>>,
        force: bool,
        rc: &mut Reclaim,
        g: &Guard,
    ) -> usize {
        loop {
            let Some(head) = self.find_chain(key, g) else {
                return 0;
            };
            let b = self.bucket(head);
            let _lk = SpinGuard::lock(&b.lock);
            if b.is_retired() {
                // split won the race; chase the key into the new subtree
                continue;
            }
            return self.unlink_matching_locked(head, key, eq, force, rc);
        }
    }
    /// Get-or-allocate, linearizable per key: the whole compound (lookup,
    /// veto, allocation, init, publication) runs under the chain head's
    /// lock, so observers on the same key see either the pre-existing
    /// record or the fresh one, never a lost insert. Returns the record
    /// offset with one caller share taken, and whether this call allocated.
    pub(crate) fn get_alloc(
        &self,
        key: u64,
        ctx: &GetAlloc<'_>,
        rc: &mut Reclaim,
        _g: &Guard,
    ) -> StoreResult<(u64, bool)> {
        loop {
            let (slot, v, shift) = self.descend_to_chain(key)?;
            let head = slot_addr(v);
            let b = self.bucket(head);
            let _lk = SpinGuard::lock(&b.lock);
            // the chain may have been split away while we waited on the lock
            if slot.load(ORD_ACQ) != v {
                continue;
            }
            debug_assert!(!b.is_retired(), "retired bucket still linked");
            if let Some(off) = self.chain_find_locked(head, key, ctx.eq) {
                return Ok((off, false));
            }
            // secure a slot for the install before any user-visible step, so
            // the entire miss path stays inside this critical section
            if !self.chain_has_room_locked(head) {
                if shift + BRANCH_BITS < KEY_BITS {
                    self.split_locked(slot, v, head, shift + BRANCH_BITS, rc)?;
                    continue;
                }
                let nb = self.alloc_bucket()?;
                let mut tail = head;
                loop {
                    let nx = self.bucket(tail).next.load(ORD_ACQ);
                    if nx == 0 {
                        break;
                    }
                    tail = nx;
                }
                self.bucket(tail).next.store(nb, ORD_REL);
            }
            if let Some(precreate) = ctx.precreate {
                precreate()?;
            }
            let off = self.new_chained(key, ctx.len)?;
            let filled = RecWriter::new(self, off).and_then(|mut w| (ctx.init)(&mut w));
            if let Err(e) = filled {
                // never published; reclaim immediately
                self.free_rec_chain(off);
                return Err(e);
            }
            self.rec_hdr(off).mark_complete();
            let installed = self.chain_install_locked(head, off);
            debug_assert!(installed, "reserved slot vanished under the chain lock");
            self.hdr().stats.n_records.fetch_add(1, ORD_RLX);
            return Ok((off, true));
        }
    }
    /// Descend to the chain-head slot for `key`, publishing an empty bucket
    /// if the terminal slot is empty. Returns the slot, its current value
    /// and the shift consumed to reach it.
    fn descend_to_chain(&self, key: u64) -> StoreResult<(&AtomicU64, u64, u64)> {
        let mut node = self.hdr().root();
        let mut shift = 0;
        loop {
            let idx = ((key >> shift) & BRANCH_MASK) as usize;
            let slot = self.node_slot(node, idx);
            let v = slot.load(ORD_ACQ);
            if v == 0 {
                let boff = self.alloc_bucket()?;
                match slot.compare_exchange(0, slot_new_bucket(boff), ORD_REL, ORD_ACQ) {
                    Ok(_) => return Ok((slot, slot_new_bucket(boff), shift)),
                    Err(_) => {
                        // lost the race; the bucket was never published
                        self.hdr().stats.n_buckets.fetch_sub(1, ORD_RLX);
                        self.free_block(boff, SizeClass::Small);
                        continue;
                    }
                }
            }
            if slot_is_bucket(v) {
                return Ok((slot, v, shift));
            }
            node = v;
            shift += BRANCH_BITS;
        }
    }
    /// First complete, non-tombstoned record under `key` that `eq` accepts,
    /// with a caller share taken. Caller holds the chain lock, which makes
    /// this scan authoritative.
    fn chain_find_locked(&self, head: u64, key: u64, eq: &EqCb<'_>) -> Option<u64> {
        let mut cur = head;
        loop {
            let b = self.bucket(cur);
            for i in 0..BUCKET_SLOTS {
                let r = b.slots[i].load(ORD_RLX);
                if r == 0 {
                    continue;
                }
                let h = self.rec_hdr(r);
                if h.key() != key || !h.is_complete() || h.is_tombstoned() {
                    continue;
                }
                if !eq(&RecView::new(self, r)) {
                    continue;
                }
                if h.try_ref() {
                    return Some(r);
                }
            }
            cur = b.next.load(ORD_ACQ);
            if cur == 0 {
                return None;
            }
        }
    }
    fn chain_has_room_locked(&self, head: u64) -> bool {
        let mut cur = head;
        loop {
            let b = self.bucket(cur);
            if b.slots.iter().any(|s| s.load(ORD_RLX) == 0) {
                return true;
            }
            cur = b.next.load(ORD_ACQ);
            if cur == 0 {
                return false;
            }
        }
    }
    fn chain_install_locked(&self, head: u64, rec_off: u64) -> bool {
        let mut cur = head;
        loop {
            if self.bucket_install_locked(cur, rec_off) {
                return true;
            }
            cur = self.bucket(cur).next.load(ORD_ACQ);
            if cur == 0 {
                return false;
            }
        }
    }
    /// Structural validation of a reopened image: every offset reachable
    /// from the root must be in range and correctly aligned, and the record
    /// population must match the header statistics.
    fn verify_image(&self) -> StoreResult<()> {
        let hdr = self.hdr();
        let (n_records, n_buckets, ..) = self.stats_snapshot();
        let mut stack = vec![(hdr.root(), 0u64)];
        let mut recs = 0u64;
        let mut buckets = 0u64;
        while let Some((node, depth)) = stack.pop() {
            if depth * BRANCH_BITS >= KEY_BITS {
                return Err(StoreError::Corrupted);
            }
            for idx in 0..BRANCH_MX {
                let v = self.node_slot(node, idx).load(ORD_RLX);
                if v == 0 {
                    continue;
                }
                let off = slot_addr(v);
                if !slot_is_bucket(v) {
                    self.check_block(off, SizeClass::Node)?;
                    stack.push((off, depth + 1));
                    continue;
                }
                let mut boff = off;
                while boff != 0 {
                    buckets += 1;
                    if buckets > n_buckets {
                        // more buckets than the header accounts for: a cycle
                        // or a torn image
                        return Err(StoreError::Corrupted);
                    }
                    self.check_block(boff, SizeClass::Small)?;
                    let b = self.bucket(boff);
                    for slot in b.slots.iter() {
                        let r = slot.load(ORD_RLX);
                        if r != 0 {
                            self.check_block(r, SizeClass::Small)?;
                            recs += 1;
                        }
                    }
                    boff = b.next.load(ORD_RLX);
                }
            }
        }
        if recs != n_records || buckets != n_buckets {
            return Err(StoreError::Corrupted);
        }
        Ok(())
    }
    fn check_block(&self, off: u64, c: SizeClass) -> StoreResult<()> {
        self.map.check_range(off, c.block_size())?;
        // every block offset is at least 128-aligned and past the extent's
        // metadata page; record offsets may come from either data class, so
        // the strictest shared alignment is the small block size
        let in_ext = off & EXT_MASK;
        if in_ext < EXT_META_SZ || off % SizeClass::Node.block_size() != 0 {
            return Err(StoreError::Corrupted);
        }
        Ok(())
    }
    /// Free a retired bucket's block. Only sound past its grace period.
    pub(crate) fn free_bucket(&self, off: u64) {
        self.free_block(off, SizeClass::Small)
    }
    #[inline(always)]
    pub(self) fn root(&self) -> u64 {
        self.hdr().root()
    }
    #[inline(always)]
    pub(self) fn load_slot(&self, node_off: u64, idx: usize) -> u64 {
        self.node_slot(node_off, idx).load(ORD_ACQ)
    }
    /// Overflow successor of a bucket
    #[inline(always)]
    pub(self) fn bucket_next_of(&self, boff: u64) -> u64 {
        self.bucket(boff).next.load(ORD_ACQ)
    }
}
