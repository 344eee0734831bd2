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
    in-file synchronization
    ---
    The lock words and version counters that guard buckets and extents live
    *inside* the mapped file (they are part of the persistent layout), so we
    can't use any heap-allocated lock type here. What we get instead is a tiny
    spinlock and a seqlock-style version protocol, both operating on a bare
    `AtomicU32` reference resolved from the mapping.

    Lock word: 0 = unlocked, 1 = locked. Critical sections are short and
    bounded (slot scans, free list pushes), so spinning with exponential
    backoff is the right trade.

    Version word: even = stable, odd = writer in progress. Writers bump the
    counter around every mutation; optimistic readers sample it before and
    after a scan and retry on mismatch. Both sides are bounded: readers give
    up with `Transient` after `READ_RETRY_MX` rounds.
*/

use {
    super::{
        atm::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX},
        Backoff,
    },
    crate::error::{StoreError, StoreResult},
    core::sync::atomic::AtomicU32,
};

/// upper bound on optimistic read attempts before we report `Transient`
pub const READ_RETRY_MX: usize = 4096;

/// RAII guard over an in-file spinlock word
pub struct SpinGuard<'a> {
    w: &'a AtomicU32,
}

impl<'a> SpinGuard<'a> {
    pub fn lock(w: &'a AtomicU32) -> Self {
        let b = Backoff::new();
        loop {
            match w.compare_exchange_weak(0, 1, ORD_ACQ, ORD_RLX) {
                Ok(_) => return Self { w },
                Err(_) => b.snooze(),
            }
        }
    }
}

impl<'a> Drop for SpinGuard<'a> {
    fn drop(&mut self) {
        self.w.store(0, ORD_REL);
    }
}

/// Begin a write section: flip the version to odd. Call with the owning lock
/// held; exactly one writer may be inside at any time.
#[inline(always)]
pub fn ver_write_begin(v: &AtomicU32) {
    let prev = v.fetch_add(1, ORD_ACR);
    debug_assert_eq!(prev & 1, 0, "nested write section");
}

/// End a write section: flip the version back to even
#[inline(always)]
pub fn ver_write_end(v: &AtomicU32) {
    let prev = v.fetch_add(1, ORD_REL);
    debug_assert_eq!(prev & 1, 1, "write section not open");
}

/// Sample a stable (even) version, spinning past any in-progress writer.
/// Bounded; fails with `Transient` once the budget runs out.
pub fn ver_read_begin(v: &AtomicU32) -> StoreResult<u32> {
    let b = Backoff::new();
    let mut tries = READ_RETRY_MX;
    loop {
        let sample = v.load(ORD_ACQ);
        if sample & 1 == 0 {
            return Ok(sample);
        }
        if tries == 0 {
            return Err(StoreError::Transient);
        }
        tries -= 1;
        b.snooze();
    }
}

/// Validate that the version did not move since `ver_read_begin`
#[inline(always)]
pub fn ver_read_ok(v: &AtomicU32, sample: u32) -> bool {
    v.load(ORD_ACQ) == sample
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        std::sync::{atomic::AtomicU32, Arc},
        std::thread,
    };

    #[test]
    fn spinlock_excludes() {
        let w = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let w = w.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _g = SpinGuard::lock(&w);
                        let c = counter.load(ORD_RLX);
                        counter.store(c + 1, ORD_RLX);
                    }
                })
            })
            .collect();
        threads.into_iter().for_each(|t| t.join().unwrap());
        assert_eq!(counter.load(ORD_RLX), 8000);
    }

    #[test]
    fn version_protocol() {
        let v = AtomicU32::new(0);
        let s = ver_read_begin(&v).unwrap();
        assert!(ver_read_ok(&v, s));
        ver_write_begin(&v);
        assert!(!ver_read_ok(&v, s));
        ver_write_end(&v);
        assert!(!ver_read_ok(&v, s));
        assert_eq!(ver_read_begin(&v).unwrap(), 2);
    }
}
