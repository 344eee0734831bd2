/*
 * Created on Tue Jan 09 2024
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

pub(crate) mod atm;
pub(crate) mod spin;

use std::{cell::Cell, hint::spin_loop, thread};

/// Exponential backoff for contended in-file words.
///
/// Spin rounds double up to `2^SPIN_LIMIT` iterations, then the waiter
/// yields to the scheduler instead. The caps are sized for this store's
/// critical sections (slot scans, free-list pushes, version flips): a
/// waiter that has spun past the limit is almost certainly behind a
/// descheduled lock holder, and hammering a mapped cache line any further
/// only slows that holder down.
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    pub const fn new() -> Self {
        Self { step: Cell::new(0) }
    }
    /// Burn a bounded number of cycles, escalating to a scheduler yield
    /// once spinning has run its course
    pub fn snooze(&self) {
        let step = self.step.get();
        if step <= Self::SPIN_LIMIT {
            for _ in 0..1u32 << step {
                spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if step < Self::YIELD_LIMIT {
            self.step.set(step + 1);
        }
    }
}
