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

use core::sync::atomic::Ordering;
// re-export here because the rest of the crate shouldn't care about the impl
pub use crossbeam_epoch::{pin as cpin, Guard};

pub(crate) const ORD_RLX: Ordering = Ordering::Relaxed;
pub(crate) const ORD_ACQ: Ordering = Ordering::Acquire;
pub(crate) const ORD_REL: Ordering = Ordering::Release;
pub(crate) const ORD_ACR: Ordering = Ordering::AcqRel;

/// Push this thread's deferred reclamation callbacks towards execution. One
/// round moves the local bag into the global queue; subsequent pins collect.
pub(crate) fn drain_deferred(rounds: usize) {
    for _ in 0..rounds {
        cpin().flush();
    }
}
