/*
 * Created on Wed Jan 24 2024
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

use {
    super::{
        iter::ChainCursor,
        meta::{SizeClass, BUCKET_SLOTS, EXT_META_SZ, EXT_SZ},
        rec::{RecWriter, FRAG_CAP, HEAD_FRAG_CAP, SMALL_CAP},
        Htrie, Reclaim,
    },
    crate::{error::StoreError, mem::MapFile, sync::atm::cpin},
    tempfile::TempDir,
};

fn tmp_trie(dir: &TempDir, name: &str, extents: u64) -> Htrie {
    let path = dir.path().join(name);
    let map = MapFile::create(&path, extents * EXT_SZ).unwrap();
    Htrie::create(map, 64, 0).unwrap()
}

/// collect the payload-bearing offsets in the chain of `key`
fn chain_offsets(t: &Htrie, key: u64) -> Vec<u64> {
    let g = cpin();
    let mut out = vec![];
    if let Some(mut c) = ChainCursor::start(t, key, &g) {
        while let Some(off) = c.next_candidate(t, key, &g).unwrap() {
            out.push(off);
        }
    }
    out
}

#[test]
fn geometry() {
    assert_eq!(SMALL_CAP, 232);
    assert_eq!(FRAG_CAP, 2032);
    assert_eq!(HEAD_FRAG_CAP, 2008);
    assert_eq!(SizeClass::Small.blocks_per_extent(), 8176);
}

#[test]
fn record_state_machine() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "state", 2);
    let off = t.new_fixed(0xCAFE, b"hello").unwrap();
    let h = t.rec_hdr(off);
    assert_eq!(h.key(), 0xCAFE);
    assert_eq!(h.len(), 5);
    assert!(h.is_complete());
    assert_eq!(h.refs(), 2);
    // pin, release
    assert!(h.try_ref());
    assert_eq!(h.refs(), 3);
    assert!(!h.put_ref());
    // tombstoning ends visibility but not the outstanding shares
    h.tombstone();
    assert!(!h.try_ref());
    assert!(!h.put_ref());
    // the last share of a tombstoned record is the reclaim signal
    assert!(h.put_ref());
}

#[test]
fn block_allocator_recycles_lifo() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "alloc", 3);
    let a = t.alloc_block(SizeClass::Small).unwrap();
    let b = t.alloc_block(SizeClass::Small).unwrap();
    // extent 0 went to the node class at format time
    assert_eq!(a, EXT_SZ + EXT_META_SZ);
    assert_eq!(b, a + SizeClass::Small.block_size());
    t.free_block(a, SizeClass::Small);
    assert_eq!(t.alloc_block(SizeClass::Small).unwrap(), a);
    // fragment allocations claim their own extent
    let f = t.alloc_block(SizeClass::Fragment).unwrap();
    assert_eq!(f, 2 * EXT_SZ + EXT_META_SZ);
}

#[test]
fn exhaustion_is_reported() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "full", 2);
    // extent 0: nodes. extent 1: smalls. nothing left for fragments.
    assert_eq!(
        t.alloc_block(SizeClass::Small).map(|_| ()),
        Ok(())
    );
    assert_eq!(
        t.alloc_block(SizeClass::Fragment).unwrap_err(),
        StoreError::NoSpace
    );
}

#[test]
fn insert_and_scan_chain() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "basic", 3);
    let g = cpin();
    let mut rc = Reclaim::new();
    for (key, val) in [(1u64, &b"one"[..]), (2, b"two"), (3, b"three")] {
        let off = t.new_fixed(key, val).unwrap();
        t.insert_rec(key, off, None, &mut rc, &g).unwrap();
        assert!(!t.rec_hdr(off).put_ref());
    }
    assert!(rc.is_empty());
    for (key, val) in [(1u64, &b"one"[..]), (2, b"two"), (3, b"three")] {
        let offs = chain_offsets(&t, key);
        assert_eq!(offs.len(), 1);
        let h = t.rec_hdr(offs[0]);
        assert_eq!(h.key(), key);
        assert_eq!(h.len(), val.len());
    }
    assert!(chain_offsets(&t, 4).is_empty());
}

#[test]
fn split_cascade_on_full_collision_chain() {
    // a single key never diverges by bit group, so filling one bucket
    // cascades splits all the way to maximum depth and then overflows
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "cascade", 8);
    let g = cpin();
    let mut rc = Reclaim::new();
    const KEY: u64 = 0xFEED;
    const N: usize = BUCKET_SLOTS + 11;
    for i in 0..N {
        let off = t.new_fixed(KEY, format!("v{i}").as_bytes()).unwrap();
        t.insert_rec(KEY, off, None, &mut rc, &g).unwrap();
        assert!(!t.rec_hdr(off).put_ref());
    }
    // the cascade retired one bucket per level
    assert!(!rc.buckets.is_empty());
    assert_eq!(chain_offsets(&t, KEY).len(), N);
    let (records, buckets, nodes, _) = t.stats_snapshot();
    assert_eq!(records, N as u64);
    assert!(nodes > 1, "no splits happened");
    assert!(buckets >= 2, "no overflow chain");
    for off in rc.buckets.drain(..) {
        t.free_bucket(off);
    }
}

#[test]
fn split_distributes_by_bit_group() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "distr", 8);
    let g = cpin();
    let mut rc = Reclaim::new();
    // all keys share the low 4 bits, so they pile into one root bucket and
    // then fan out on the second bit group after the split
    let keys: Vec<u64> = (0..(BUCKET_SLOTS + 5) as u64).map(|i| (i << 4) | 0xA).collect();
    for &key in &keys {
        let off = t.new_fixed(key, b"x").unwrap();
        t.insert_rec(key, off, None, &mut rc, &g).unwrap();
        assert!(!t.rec_hdr(off).put_ref());
    }
    for &key in &keys {
        assert_eq!(chain_offsets(&t, key).len(), 1, "key {key:#x} lost");
    }
    for off in rc.buckets.drain(..) {
        t.free_bucket(off);
    }
}

#[test]
fn remove_unlinks_and_signals_reclaim() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "remove", 3);
    let g = cpin();
    let mut rc = Reclaim::new();
    let off = t.new_fixed(77, b"gone").unwrap();
    t.insert_rec(77, off, None, &mut rc, &g).unwrap();
    assert!(!t.rec_hdr(off).put_ref());
    assert_eq!(t.remove(77, None, false, &mut rc, &g), 1);
    assert_eq!(rc.recs, vec![off]);
    assert!(chain_offsets(&t, 77).is_empty());
    // removing again is a no-op
    assert_eq!(t.remove(77, None, false, &mut rc, &g), 0);
    t.free_rec_chain(off);
}

#[test]
fn writer_chops_abandoned_tails() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "chop", 3);
    let off = t.new_chained(5, 100).unwrap();
    let mut w = RecWriter::new(&t, off).unwrap();
    w.append(&[7u8; 2000]).unwrap();
    // 8 bytes left in the head fragment: asking for 100 contiguous must
    // abandon them and move to a fresh fragment
    let room = w.room(100, 100).unwrap();
    assert!(room.len() >= 100);
    room[..100].copy_from_slice(&[9u8; 100]);
    w.advance(100);
    let h = t.rec_hdr(off);
    assert_eq!(h.len(), 2100);
    let view = super::rec::RecView::new(&t, off);
    let chunks: Vec<usize> = view.chunks().map(|c| c.len()).collect();
    assert_eq!(chunks, vec![2000, 100]);
    let mut expect = vec![7u8; 2000];
    expect.extend_from_slice(&[9u8; 100]);
    assert_eq!(view.read_to_vec(), expect);
    // a resumed writer lands after the chop, not inside it
    let mut w2 = RecWriter::new(&t, off).unwrap();
    w2.append(b"!").unwrap();
    assert_eq!(t.rec_hdr(off).len(), 2101);
    t.free_rec_chain(off);
}

#[test]
fn reserve_provisions_capacity() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "reserve", 4);
    let off = t.new_chained(6, 5000).unwrap();
    let mut w = RecWriter::new(&t, off).unwrap();
    w.append(&vec![1u8; 5000]).unwrap();
    t.reserve(off, 10_000).unwrap();
    let mut w = RecWriter::new(&t, off).unwrap();
    w.append(&vec![2u8; 10_000]).unwrap();
    let view = super::rec::RecView::new(&t, off);
    assert_eq!(view.len(), 15_000);
    let data = view.read_to_vec();
    assert!(data[..5000].iter().all(|&b| b == 1));
    assert!(data[5000..].iter().all(|&b| b == 2));
    t.free_rec_chain(off);
}

#[test]
fn allocator_conservation_after_churn() {
    let dir = TempDir::new().unwrap();
    let t = tmp_trie(&dir, "conserve", 4);
    let g = cpin();
    let mut rc = Reclaim::new();
    let keys: Vec<u64> = (0..200u64).map(|i| i.wrapping_mul(0x9E3779B97F4A7C15)).collect();
    for &key in &keys {
        let off = t.new_fixed(key, b"payload").unwrap();
        t.insert_rec(key, off, None, &mut rc, &g).unwrap();
        assert!(!t.rec_hdr(off).put_ref());
    }
    for &key in &keys {
        assert_eq!(t.remove(key, None, false, &mut rc, &g), 1);
    }
    // single threaded: reclaim inline instead of via the epoch queue
    for off in rc.recs.drain(..) {
        t.free_rec_chain(off);
    }
    for off in rc.buckets.drain(..) {
        t.free_bucket(off);
    }
    let (records, buckets, nodes, _) = t.stats_snapshot();
    assert_eq!(records, 0);
    // every small-class extent must account for exactly the live buckets
    let mut live_small = 0;
    for base in t.class_extents(SizeClass::Small) {
        let (c, bumped, free) = t.ext_usage(base);
        assert_eq!(c, SizeClass::Small);
        live_small += bumped - free;
    }
    assert_eq!(live_small, buckets);
    // node extents account for the trie nodes
    let mut live_nodes = 0;
    for base in t.class_extents(SizeClass::Node) {
        let (_, bumped, free) = t.ext_usage(base);
        live_nodes += bumped - free;
    }
    assert_eq!(live_nodes, nodes);
}
