/*
 * Created on Mon Jan 08 2024
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

//! # Skymap
//!
//! An embedded key/value store backed by a single memory-mapped file. Records
//! are addressed by a caller-supplied 64 bit key (collisions chain) and
//! organized by a hash trie whose on-disk layout is its in-memory layout:
//! every link is a base-relative offset, so a table survives process restart
//! by re-reading the mapping.
//!
//! Readers are optimistic and non-blocking in the common case; writers
//! coordinate per collision chain. Records are refcounted: every lookup hands
//! out a guard that pins the record until dropped, and reclamation waits for
//! tombstoning plus a drained refcount plus an epoch grace period.

#[macro_use]
mod macros;

mod error;
mod htrie;
mod mem;
mod store;
mod sync;
#[cfg(test)]
mod tests;

pub use {
    error::{StoreError, StoreResult},
    htrie::{
        rec::{RecChunks, RecView, RecWriter, FRAG_CAP, HEAD_FRAG_CAP, SMALL_CAP},
        EqCb, GetAlloc,
    },
    store::{RecIter, RecRef, Store, StoreStats},
};
