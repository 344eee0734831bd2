/*
 * Created on Tue Jan 16 2024
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
    raw cursors
    ---
    These yield *candidate* record offsets: occupied slots sampled under the
    bucket version protocol. Pinning a candidate (the record-state CAS) is
    the caller's job, which is also what filters out incomplete and
    tombstoned records. Both cursors are only meaningful under an epoch pin
    held by the caller for their entire lifetime; that pin is what keeps a
    concurrently retired bucket dereferenceable until the cursor moves off
    it.
*/

use {
    super::{
        bucket::SlotMatches,
        meta::{slot_addr, slot_is_bucket, BRANCH_MX},
        Htrie,
    },
    crate::{error::StoreResult, sync::atm::Guard},
};

/// cursor over one collision chain
pub(crate) struct ChainCursor {
    boff: u64,
    slot: usize,
}

impl ChainCursor {
    /// Position at the chain for `key`; `None` if the trie has no chain
    /// there
    pub fn start(t: &Htrie, key: u64, g: &Guard) -> Option<Self> {
        t.find_chain(key, g).map(|boff| Self { boff, slot: 0 })
    }
    /// Next occupied slot holding `key`, in chain order
    pub fn next_candidate(&mut self, t: &Htrie, key: u64, _g: &Guard) -> StoreResult<Option<u64>> {
        let mut m = SlotMatches::new();
        loop {
            t.bucket_scan(self.boff, Some(key), self.slot, &mut m)?;
            if let Some((i, off)) = m.iter().next() {
                self.slot = i + 1;
                return Ok(Some(off));
            }
            let nx = t.bucket_next_of(self.boff);
            if nx == 0 {
                return Ok(None);
            }
            self.boff = nx;
            self.slot = 0;
        }
    }
}

/// depth-first cursor over every record in the trie
pub(crate) struct WalkCursor {
    stack: Vec<(u64, usize)>,
    chain: Option<ChainCursor>,
}

impl WalkCursor {
    pub fn new(t: &Htrie) -> Self {
        Self {
            stack: vec![(t.root(), 0)],
            chain: None,
        }
    }
    /// Next occupied slot anywhere in the index, hash order
    pub fn next_candidate(&mut self, t: &Htrie, _g: &Guard) -> StoreResult<Option<u64>> {
        let mut m = SlotMatches::new();
        loop {
            if let Some(c) = &mut self.chain {
                t.bucket_scan(c.boff, None, c.slot, &mut m)?;
                if let Some((i, off)) = m.iter().next() {
                    c.slot = i + 1;
                    return Ok(Some(off));
                }
                let nx = t.bucket_next_of(c.boff);
                if nx != 0 {
                    c.boff = nx;
                    c.slot = 0;
                    continue;
                }
                self.chain = None;
            }
            let Some((node, idx)) = self.stack.last_mut() else {
                return Ok(None);
            };
            if *idx == BRANCH_MX {
                self.stack.pop();
                continue;
            }
            let v = t.load_slot(*node, *idx);
            *idx += 1;
            if v == 0 {
                continue;
            }
            if slot_is_bucket(v) {
                self.chain = Some(ChainCursor {
                    boff: slot_addr(v),
                    slot: 0,
                });
            } else {
                self.stack.push((v, 0));
            }
        }
    }
}
