/*
 * Created on Thu Jan 18 2024
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
    tables
    ---
    A `Store` is one refcounted handle to an open table. Handles are
    registered by canonical file name so that opening the same table twice
    yields the same underlying mapping; the last reference to drop (handles
    and record guards alike) flushes the mapping and clears the dirty flag.

    Naming contract: the caller passes an absolute path ending in `.skm`;
    the actual backing file is `<name><node>.skm` next to it, so one table
    definition can fan out per NUMA node.
*/

use {
    crate::{
        error::{StoreError, StoreResult},
        htrie::{
            iter::{ChainCursor, WalkCursor},
            meta::EXT_SZ,
            rec::{RecChunks, RecView, RecWriter},
            EqCb, GetAlloc, Htrie, Reclaim,
        },
        mem::MapFile,
        sync::atm::{cpin, drain_deferred, Guard},
    },
    log::{debug, error, info},
    parking_lot::Mutex,
    std::{
        collections::BTreeMap,
        ops::ControlFlow,
        path::{Path, PathBuf},
        sync::{Arc, Weak},
    },
};

const TBL_SUFFIX: &str = ".skm";
/// `<name><node>.skm` must fit in this many characters
const TBL_NAME_MX: usize = 56;
const TBL_NODE_MX: u32 = 9;

/// open tables, keyed by canonical backing-file path
static TABLES: Mutex<BTreeMap<String, Weak<StoreInner>>> = Mutex::new(BTreeMap::new());

fn table_ident(path: &str, node: u32) -> StoreResult<(PathBuf, String)> {
    let p = Path::new(path);
    if !p.is_absolute() {
        return Err(StoreError::BadInput);
    }
    let fname = p
        .file_name()
        .and_then(|f| f.to_str())
        .ok_or(StoreError::BadInput)?;
    let name = fname
        .strip_suffix(TBL_SUFFIX)
        .ok_or(StoreError::BadInput)?;
    if name.is_empty() || name.len() + 1 + TBL_SUFFIX.len() > TBL_NAME_MX {
        return Err(StoreError::BadInput);
    }
    let ident = format!("{name}{node}{TBL_SUFFIX}");
    let file = p.parent().ok_or(StoreError::BadInput)?.join(&ident);
    Ok((file, ident))
}

pub(crate) struct StoreInner {
    pub(crate) trie: Htrie,
    /// table name as logged (`<name><node>.skm`)
    ident: String,
    /// registry key: full backing-file path
    path: String,
}

impl StoreInner {
    /// Queue every block in `rc` for reclamation after the current grace
    /// period.
    ///
    /// Callbacks hold a `Weak` so a pending free can never keep the table
    /// open: if the last handle drops first, the table closes cleanly and
    /// the callback turns into a no-op (the blocks are unreachable in the
    /// closed image, which only costs space).
    fn defer_reclaim(self: &Arc<Self>, rc: Reclaim, g: &Guard) {
        if rc.is_empty() {
            return;
        }
        for off in rc.recs {
            let me = Arc::downgrade(self);
            unsafe {
                // UNSAFE(@ohsayan): the upgraded Arc keeps the mapping alive
                // for the duration of the callback; the record is tombstoned
                // with a drained refcount, so nobody can pin it again
                g.defer_unchecked(move || {
                    if let Some(me) = me.upgrade() {
                        me.trie.free_rec_chain(off)
                    }
                });
            }
        }
        for boff in rc.buckets {
            let me = Arc::downgrade(self);
            unsafe {
                // UNSAFE(@ohsayan): as above; the bucket is retired and
                // unreachable from the trie
                g.defer_unchecked(move || {
                    if let Some(me) = me.upgrade() {
                        me.trie.free_bucket(boff)
                    }
                });
            }
        }
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        {
            let mut tables = TABLES.lock();
            if let Some(w) = tables.get(&self.path) {
                if w.strong_count() == 0 {
                    tables.remove(&self.path);
                }
            }
        }
        if let Err(e) = self.trie.close() {
            error!("failed to flush table {}: {e}", self.ident);
        } else {
            info!("closed table {}", self.ident);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreStats {
    pub records: u64,
    pub buckets: u64,
    pub nodes: u64,
    pub extents: u64,
    pub file_size: u64,
}

/// A refcounted handle to an open table
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open or create the table at `path` (absolute, `.skm` suffix) for
    /// NUMA node `node`. `size` is the full file size (a multiple of the
    /// 2 MiB extent size); `rec_hint` is the advisory record size recorded
    /// in the header. Reopening an already open table returns the existing
    /// handle.
    pub fn open(path: &str, size: u64, rec_hint: u32, node: u32) -> StoreResult<Self> {
        if node > TBL_NODE_MX {
            return Err(StoreError::BadInput);
        }
        let (file, ident) = table_ident(path, node)?;
        let file_key = file.to_string_lossy().into_owned();
        let mut tables = TABLES.lock();
        if let Some(w) = tables.get(&file_key) {
            if let Some(inner) = w.upgrade() {
                debug!("reusing open handle for table {ident}");
                return Ok(Self { inner });
            }
        }
        let trie = if file.exists() {
            let map = MapFile::open(&file)?;
            if map.len() != size {
                return Err(StoreError::BadInput);
            }
            Htrie::open(map, rec_hint, node)?
        } else {
            if size < EXT_SZ || size % EXT_SZ != 0 {
                return Err(StoreError::BadInput);
            }
            let map = MapFile::create(&file, size)?;
            Htrie::create(map, rec_hint, node)?
        };
        info!("opened table {ident}: size={size} rec_hint={rec_hint} node={node}");
        let inner = Arc::new(StoreInner {
            trie,
            ident,
            path: file_key.clone(),
        });
        tables.insert(file_key, Arc::downgrade(&inner));
        Ok(Self { inner })
    }
    /// Release this handle. The table stays open while other handles or
    /// record guards exist; the last one flushes and clears the dirty flag.
    pub fn close(self) {}
    /// Allocate a complete record and copy `data` into it. Records up to
    /// the fixed-record capacity land in a single small block; larger ones
    /// get a fragment chain. Visible to lookups as soon as this returns.
    pub fn create(&self, key: u64, data: &[u8]) -> StoreResult<RecRef> {
        if data.is_empty() {
            return Err(StoreError::BadInput);
        }
        let t = &self.inner.trie;
        let off = if data.len() <= crate::htrie::rec::SMALL_CAP {
            t.new_fixed(key, data)?
        } else {
            let off = t.new_chained(key, data.len())?;
            let fill = RecWriter::new(t, off).and_then(|mut w| w.append(data));
            if let Err(e) = fill {
                t.free_rec_chain(off);
                return Err(e);
            }
            t.rec_hdr(off).mark_complete();
            off
        };
        self.install(key, off, None)
    }
    /// Allocate an incomplete chained record with capacity for `len` bytes.
    /// Invisible to lookups until marked complete; fill it through
    /// [`RecRef::writer`].
    pub fn alloc(&self, key: u64, len: usize) -> StoreResult<RecRef> {
        if len == 0 {
            return Err(StoreError::BadInput);
        }
        let off = self.inner.trie.new_chained(key, len)?;
        self.install(key, off, None)
    }
    /// Like [`Self::alloc`], but first tombstones any existing complete
    /// record under `key` that `eq` accepts, inside the same critical
    /// section
    pub fn alloc_unique(&self, key: u64, len: usize, eq: &EqCb<'_>) -> StoreResult<RecRef> {
        if len == 0 {
            return Err(StoreError::BadInput);
        }
        let off = self.inner.trie.new_chained(key, len)?;
        self.install(key, off, Some(eq))
    }
    fn install(&self, key: u64, off: u64, uniq: Option<&EqCb<'_>>) -> StoreResult<RecRef> {
        let t = &self.inner.trie;
        let g = cpin();
        let mut rc = Reclaim::new();
        if let Err(e) = t.insert_rec(key, off, uniq, &mut rc, &g) {
            // never published; reclaim immediately
            t.free_rec_chain(off);
            self.inner.defer_reclaim(rc, &g);
            return Err(e);
        }
        self.inner.defer_reclaim(rc, &g);
        Ok(RecRef {
            inner: Arc::clone(&self.inner),
            off,
        })
    }
    /// Ensure the chain of an incomplete record has room for `additional`
    /// more payload bytes
    pub fn extend(&self, rec: &RecRef, additional: usize) -> StoreResult<()> {
        debug_assert!(Arc::ptr_eq(&self.inner, &rec.inner), "foreign record");
        self.inner.trie.reserve(rec.off, additional)
    }
    /// Remove every record under `key` accepted by `eq` (all of them if
    /// `eq` is `None`). Incomplete records are only removed with `force`.
    /// Returns the number of records removed; their blocks are reclaimed
    /// once outstanding guards drop.
    pub fn remove(&self, key: u64, eq: Option<&EqCb<'_>>, force: bool) -> usize {
        let g = cpin();
        let mut rc = Reclaim::new();
        let n = self.inner.trie.remove(key, eq, force, &mut rc, &g);
        self.inner.defer_reclaim(rc, &g);
        n
    }
    /// Refcounted iterator over the collision chain of `key`
    pub fn get(&self, key: u64) -> RecIter {
        RecIter {
            inner: Arc::clone(&self.inner),
            key,
            g: cpin(),
            cur: None,
            started: false,
        }
    }
    /// First complete record under `key`
    pub fn get_first(&self, key: u64) -> StoreResult<RecRef> {
        self.get(key).next()?.ok_or(StoreError::KeyAbsent)
    }
    /// Get-or-allocate, linearizable per key: return the first record under
    /// `key` accepted by `ctx.eq`, or allocate, initialize and complete a
    /// fresh one, all inside the target chain's critical section. The bool
    /// is true iff this call allocated.
    pub fn get_alloc(&self, key: u64, ctx: GetAlloc<'_>) -> StoreResult<(RecRef, bool)> {
        let g = cpin();
        let mut rc = Reclaim::new();
        let res = self.inner.trie.get_alloc(key, &ctx, &mut rc, &g);
        self.inner.defer_reclaim(rc, &g);
        let (off, is_new) = res?;
        Ok((
            RecRef {
                inner: Arc::clone(&self.inner),
                off,
            },
            is_new,
        ))
    }
    /// Visit every complete record. Hash order; concurrent inserts may or
    /// may not be observed; each record is pinned across its visit.
    pub fn walk<F>(&self, mut visitor: F) -> StoreResult<()>
    where
        F: FnMut(&RecRef) -> ControlFlow<()>,
    {
        let t = &self.inner.trie;
        let g = cpin();
        let mut cur = WalkCursor::new(t);
        while let Some(off) = cur.next_candidate(t, &g)? {
            if t.rec_hdr(off).try_ref() {
                let r = RecRef {
                    inner: Arc::clone(&self.inner),
                    off,
                };
                if visitor(&r).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
    pub fn stats(&self) -> StoreStats {
        let (records, buckets, nodes, extents) = self.inner.trie.stats_snapshot();
        StoreStats {
            records,
            buckets,
            nodes,
            extents,
            file_size: self.inner.trie.fsize(),
        }
    }
    /// Flush the mapping to the backing file
    pub fn sync(&self) -> StoreResult<()> {
        self.inner.trie.sync()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // nudge pending reclamation towards execution so a clean close isn't
        // held hostage by deferred callbacks
        drain_deferred(4);
    }
}

#[cfg(test)]
impl Store {
    /// run deferred reclamation to completion (best effort)
    pub(crate) fn quiesce(&self) {
        drain_deferred(64);
    }
}

/// A refcounted guard over one record. Holding it keeps the record's blocks
/// alive even across removal; dropping it releases exactly one share.
pub struct RecRef {
    inner: Arc<StoreInner>,
    off: u64,
}

impl std::fmt::Debug for RecRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecRef").field("off", &self.off).finish_non_exhaustive()
    }
}

impl RecRef {
    #[inline(always)]
    fn hdr(&self) -> &crate::htrie::rec::RecHdr {
        self.inner.trie.rec_hdr(self.off)
    }
    pub fn key(&self) -> u64 {
        self.hdr().key()
    }
    /// payload bytes written so far
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
    /// Make an incomplete record visible to lookups
    pub fn mark_complete(&self) {
        self.hdr().mark_complete()
    }
    /// Take an additional share
    pub fn keep(&self) -> RecRef {
        self.hdr().keep_ref();
        RecRef {
            inner: Arc::clone(&self.inner),
            off: self.off,
        }
    }
    pub fn view(&self) -> RecView<'_> {
        RecView::new(&self.inner.trie, self.off)
    }
    /// Payload as contiguous chunks (one per fragment)
    pub fn chunks(&self) -> RecChunks<'_> {
        self.view().chunks()
    }
    /// Collect the payload into an owned buffer
    pub fn read_to_vec(&self) -> Vec<u8> {
        self.view().read_to_vec()
    }
    /// Write cursor for an incomplete chained record
    pub fn writer(&self) -> StoreResult<RecWriter<'_>> {
        RecWriter::new(&self.inner.trie, self.off)
    }
    #[cfg(test)]
    pub(crate) fn refs(&self) -> u32 {
        self.hdr().refs()
    }
    #[cfg(test)]
    pub(crate) fn off(&self) -> u64 {
        self.off
    }
}

impl Clone for RecRef {
    fn clone(&self) -> Self {
        self.keep()
    }
}

impl Drop for RecRef {
    fn drop(&mut self) {
        if self.hdr().put_ref() {
            let me = Arc::downgrade(&self.inner);
            let off = self.off;
            let g = cpin();
            unsafe {
                // UNSAFE(@ohsayan): the upgraded Arc keeps the mapping alive
                // for the duration of the callback; see `defer_reclaim`
                g.defer_unchecked(move || {
                    if let Some(me) = me.upgrade() {
                        me.trie.free_rec_chain(off)
                    }
                });
            }
        }
    }
}

/// Refcounted iterator over a collision chain. Holds an epoch pin for its
/// whole lifetime, so don't park one and walk away.
pub struct RecIter {
    inner: Arc<StoreInner>,
    key: u64,
    g: Guard,
    cur: Option<ChainCursor>,
    started: bool,
}

impl RecIter {
    /// Next complete record under the key, refcounted. `Ok(None)` once the
    /// chain is exhausted.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> StoreResult<Option<RecRef>> {
        if !self.started {
            self.started = true;
            self.cur = ChainCursor::start(&self.inner.trie, self.key, &self.g);
        }
        let Some(cur) = &mut self.cur else {
            return Ok(None);
        };
        while let Some(off) = cur.next_candidate(&self.inner.trie, self.key, &self.g)? {
            if self.inner.trie.rec_hdr(off).try_ref() {
                return Ok(Some(RecRef {
                    inner: Arc::clone(&self.inner),
                    off,
                }));
            }
        }
        self.cur = None;
        Ok(None)
    }
}
