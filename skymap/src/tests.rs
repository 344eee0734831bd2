/*
 * Created on Thu Jan 25 2024
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
    crate::{
        htrie::meta::EXT_SZ, GetAlloc, RecView, Store, StoreError,
    },
    std::{
        collections::HashSet,
        fs,
        io::{Read, Seek, SeekFrom, Write},
        ops::ControlFlow,
        sync::{Arc, RwLock},
        thread::{self, JoinHandle},
    },
    tempfile::TempDir,
};

fn init_log() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn tbl_path(dir: &TempDir, name: &str) -> String {
    dir.path()
        .join(format!("{name}.skm"))
        .to_str()
        .unwrap()
        .to_owned()
}

fn open_tmp(dir: &TempDir, name: &str, extents: u64) -> Store {
    Store::open(&tbl_path(dir, name), extents * EXT_SZ, 64, 0).unwrap()
}

const fn key(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

#[test]
fn small_round_trip() {
    init_log();
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "s1", 64);
    drop(s.create(0x1111, b"alpha").unwrap());
    drop(s.create(0x2222, b"beta").unwrap());
    assert_eq!(s.get_first(0x1111).unwrap().read_to_vec(), b"alpha");
    assert_eq!(s.get_first(0x2222).unwrap().read_to_vec(), b"beta");
    assert_eq!(s.get_first(0x3333).unwrap_err(), StoreError::KeyAbsent);
    assert!(s.get(0x3333).next().unwrap().is_none());
}

#[test]
fn collision_chain_visits_each_once() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "s2", 8);
    for val in [&b"a"[..], b"bb", b"ccc"] {
        drop(s.create(0xDEAD, val).unwrap());
    }
    let mut it = s.get(0xDEAD);
    let mut seen = vec![];
    while let Some(r) = it.next().unwrap() {
        assert_eq!(r.key(), 0xDEAD);
        seen.push(r.read_to_vec());
    }
    seen.sort();
    assert_eq!(seen, vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]);
    // the chain is exhausted
    assert!(it.next().unwrap().is_none());
}

#[test]
fn variable_record_grows_by_fragments() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "s3", 32);
    let chunk_a = vec![0xAAu8; 10_000];
    let chunk_b = vec![0xBBu8; 10_000];
    let chunk_c = vec![0xCCu8; 10_000];
    let r = s.alloc(7, 10_000).unwrap();
    r.writer().unwrap().append(&chunk_a).unwrap();
    s.extend(&r, 10_000).unwrap();
    r.writer().unwrap().append(&chunk_b).unwrap();
    s.extend(&r, 10_000).unwrap();
    r.writer().unwrap().append(&chunk_c).unwrap();
    r.mark_complete();
    drop(r);
    let got = s.get_first(7).unwrap();
    assert_eq!(got.len(), 30_000);
    let mut expect = chunk_a;
    expect.extend_from_slice(&chunk_b);
    expect.extend_from_slice(&chunk_c);
    assert_eq!(got.read_to_vec(), expect);
    // payload is chained, never copied out by the store itself
    assert!(got.chunks().count() > 1);
}

#[test]
fn unique_replace_leaves_single_record() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "s4", 8);
    drop(s.create(5, b"v1").unwrap());
    let r = s.alloc_unique(5, 2, &|_: &RecView<'_>| true).unwrap();
    r.writer().unwrap().append(b"v2").unwrap();
    r.mark_complete();
    drop(r);
    let mut it = s.get(5);
    let only = it.next().unwrap().unwrap();
    assert_eq!(only.read_to_vec(), b"v2");
    assert!(it.next().unwrap().is_none());
    assert_eq!(s.stats().records, 1);
}

#[test]
fn get_alloc_race_allocates_once() {
    init_log();
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "s5", 16);
    const THREADS: usize = 16;
    let gate = Arc::new(RwLock::new(()));
    let hold = gate.write().unwrap();
    let threads: Vec<JoinHandle<(u64, bool)>> = (0..THREADS)
        .map(|_| {
            let s = s.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let _go = gate.read().unwrap();
                let (r, is_new) = s
                    .get_alloc(
                        42,
                        GetAlloc {
                            len: 1,
                            eq: &|_| true,
                            precreate: None,
                            init: &|w| w.append(b"X"),
                        },
                    )
                    .unwrap();
                (r.off(), is_new)
            })
        })
        .collect();
    drop(hold);
    let results: Vec<(u64, bool)> = threads.into_iter().map(|t| t.join().unwrap()).collect();
    let fresh = results.iter().filter(|(_, is_new)| *is_new).count();
    assert_eq!(fresh, 1, "exactly one thread must allocate");
    let offs: HashSet<u64> = results.iter().map(|(off, _)| *off).collect();
    assert_eq!(offs.len(), 1, "everyone must see the same record");
    // all guards dropped: only the index share remains
    let r = s.get_first(42).unwrap();
    assert_eq!(r.read_to_vec(), b"X");
    assert_eq!(r.refs(), 2);
}

#[test]
fn incomplete_records_are_invisible() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "incomplete", 8);
    let r = s.alloc(9, 100).unwrap();
    r.writer().unwrap().append(b"half").unwrap();
    assert!(s.get(9).next().unwrap().is_none());
    let mut walked = 0;
    s.walk(|_| {
        walked += 1;
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(walked, 0);
    r.mark_complete();
    assert_eq!(s.get_first(9).unwrap().read_to_vec(), b"half");
}

#[test]
fn remove_and_force_remove() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "remove", 8);
    drop(s.create(1, b"x").unwrap());
    assert_eq!(s.remove(1, None, false), 1);
    assert!(s.get(1).next().unwrap().is_none());
    assert_eq!(s.remove(1, None, false), 0);
    // incomplete records survive a plain remove
    let r = s.alloc(2, 16).unwrap();
    assert_eq!(s.remove(2, None, false), 0);
    assert_eq!(s.remove(2, None, true), 1);
    drop(r);
    assert_eq!(s.stats().records, 0);
}

#[test]
fn guard_outlives_removal() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "uaf", 8);
    drop(s.create(11, b"still here").unwrap());
    let held = s.get_first(11).unwrap();
    assert_eq!(s.remove(11, None, false), 1);
    assert!(s.get(11).next().unwrap().is_none());
    s.quiesce();
    // the guard's share keeps the blocks alive
    assert!(held.is_tombstoned());
    assert_eq!(held.read_to_vec(), b"still here");
    drop(held);
    s.quiesce();
}

#[test]
fn keep_takes_an_extra_share() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "keep", 8);
    drop(s.create(3, b"k").unwrap());
    let a = s.get_first(3).unwrap();
    assert_eq!(a.refs(), 2);
    let b = a.keep();
    assert_eq!(a.refs(), 3);
    drop(b);
    assert_eq!(a.refs(), 2);
    drop(a);
    assert_eq!(s.get_first(3).unwrap().refs(), 2);
}

#[test]
fn reopen_preserves_complete_records() {
    init_log();
    let dir = TempDir::new().unwrap();
    let path = tbl_path(&dir, "s6");
    const N: u64 = 1000;
    {
        let s = Store::open(&path, 8 * EXT_SZ, 64, 0).unwrap();
        for i in 0..N {
            drop(s.create(key(i), format!("value-{i}").as_bytes()).unwrap());
        }
        s.close();
    }
    let s = Store::open(&path, 8 * EXT_SZ, 64, 0).unwrap();
    let mut walked = 0u64;
    s.walk(|_| {
        walked += 1;
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(walked, N);
    for i in (0..N).step_by(97) {
        assert_eq!(
            s.get_first(key(i)).unwrap().read_to_vec(),
            format!("value-{i}").as_bytes()
        );
    }
    assert_eq!(s.stats().records, N);
}

#[test]
fn registry_returns_live_handle() {
    let dir = TempDir::new().unwrap();
    let path = tbl_path(&dir, "shared");
    let a = Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap();
    let b = Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap();
    drop(a.create(1, b"via-a").unwrap());
    assert_eq!(b.get_first(1).unwrap().read_to_vec(), b"via-a");
    drop(a);
    // still open through b
    assert_eq!(b.stats().records, 1);
}

#[test]
fn bad_arguments_are_rejected() {
    let dir = TempDir::new().unwrap();
    // relative path
    assert_eq!(
        Store::open("rel.skm", 4 * EXT_SZ, 64, 0).unwrap_err(),
        StoreError::BadInput
    );
    // wrong suffix
    let nosuffix = dir.path().join("t.db").to_str().unwrap().to_owned();
    assert_eq!(
        Store::open(&nosuffix, 4 * EXT_SZ, 64, 0).unwrap_err(),
        StoreError::BadInput
    );
    // size not a multiple of the extent size
    assert_eq!(
        Store::open(&tbl_path(&dir, "sz"), 3 * EXT_SZ / 2, 64, 0).unwrap_err(),
        StoreError::BadInput
    );
    // node id out of range
    assert_eq!(
        Store::open(&tbl_path(&dir, "node"), 4 * EXT_SZ, 64, 10).unwrap_err(),
        StoreError::BadInput
    );
    // empty payloads don't exist
    let s = open_tmp(&dir, "args", 4);
    assert_eq!(s.create(1, b"").unwrap_err(), StoreError::BadInput);
    assert_eq!(s.alloc(1, 0).unwrap_err(), StoreError::BadInput);
}

#[test]
fn tampered_header_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = tbl_path(&dir, "tamper");
    {
        let s = Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap();
        drop(s.create(1, b"x").unwrap());
    }
    let file = dir.path().join("tamper0.skm");
    // flip a byte inside the checksummed prefix
    let mut f = fs::OpenOptions::new().read(true).write(true).open(&file).unwrap();
    f.seek(SeekFrom::Start(9)).unwrap();
    let mut b = [0u8; 1];
    f.read_exact(&mut b).unwrap();
    f.seek(SeekFrom::Start(9)).unwrap();
    f.write_all(&[b[0] ^ 0xFF]).unwrap();
    drop(f);
    assert_eq!(
        Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap_err(),
        StoreError::Corrupted
    );
}

#[test]
fn unclean_shutdown_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = tbl_path(&dir, "dirty");
    {
        let s = Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap();
        drop(s.create(1, b"x").unwrap());
    }
    let file = dir.path().join("dirty0.skm");
    // re-raise the dirty flag as if the owner had been killed
    let mut f = fs::OpenOptions::new().read(true).write(true).open(&file).unwrap();
    f.seek(SeekFrom::Start(56)).unwrap();
    f.write_all(&[1]).unwrap();
    drop(f);
    assert_eq!(
        Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap_err(),
        StoreError::Corrupted
    );
}

#[test]
fn mismatched_geometry_is_rejected() {
    let dir = TempDir::new().unwrap();
    let path = tbl_path(&dir, "geo");
    {
        let _ = Store::open(&path, 4 * EXT_SZ, 64, 0).unwrap();
    }
    assert_eq!(
        Store::open(&path, 8 * EXT_SZ, 64, 0).unwrap_err(),
        StoreError::BadInput
    );
    assert_eq!(
        Store::open(&path, 4 * EXT_SZ, 128, 0).unwrap_err(),
        StoreError::Corrupted
    );
}

#[test]
fn exhaustion_surfaces_no_space() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "full", 2);
    let payload = [0x5Au8; 100];
    let mut inserted = 0u64;
    let err = loop {
        match s.create(key(inserted), &payload) {
            Ok(r) => drop(r),
            Err(e) => break e,
        }
        inserted += 1;
        assert!(inserted < 20_000, "allocator never ran dry");
    };
    assert_eq!(err, StoreError::NoSpace);
    assert!(inserted > 1000, "gave up way too early");
    // the table is still consistent and readable
    assert_eq!(s.stats().records, inserted);
    assert_eq!(s.get_first(key(0)).unwrap().read_to_vec(), payload);
}

#[test]
fn multispam_insert() {
    init_log();
    const SPAM: u64 = 1024;
    const TENANTS: u64 = 8;
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "spam", 16);
    let gate = Arc::new(RwLock::new(()));
    let hold = gate.write().unwrap();
    let threads: Vec<JoinHandle<()>> = (0..TENANTS)
        .map(|tid| {
            let s = s.clone();
            let gate = gate.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _go = gate.read().unwrap();
                    for i in 0..SPAM {
                        let k = key(tid * SPAM + i);
                        drop(s.create(k, k.to_le_bytes().as_ref()).unwrap());
                    }
                })
                .unwrap()
        })
        .collect();
    // rush everyone to insert; superb intercore traffic
    drop(hold);
    threads.into_iter().for_each(|t| t.join().unwrap());
    assert_eq!(s.stats().records, SPAM * TENANTS);
    for i in 0..(SPAM * TENANTS) {
        let k = key(i);
        assert_eq!(s.get_first(k).unwrap().read_to_vec(), k.to_le_bytes());
    }
}

#[test]
fn readers_race_removal_without_teardown() {
    const ROUNDS: usize = 2000;
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "race", 8);
    drop(s.create(99, b"vvv").unwrap());
    let gate = Arc::new(RwLock::new(()));
    let hold = gate.write().unwrap();
    let readers: Vec<JoinHandle<()>> = (0..2)
        .map(|_| {
            let s = s.clone();
            let gate = gate.clone();
            thread::spawn(move || {
                let _go = gate.read().unwrap();
                for _ in 0..ROUNDS {
                    match s.get_first(99) {
                        Ok(r) => assert_eq!(r.read_to_vec(), b"vvv"),
                        Err(StoreError::KeyAbsent) => {}
                        Err(e) => panic!("reader failed: {e}"),
                    }
                }
            })
        })
        .collect();
    let writer = {
        let s = s.clone();
        let gate = gate.clone();
        thread::spawn(move || {
            let _go = gate.read().unwrap();
            for _ in 0..ROUNDS {
                s.remove(99, None, false);
                drop(s.create(99, b"vvv").unwrap());
            }
        })
    };
    drop(hold);
    readers.into_iter().for_each(|t| t.join().unwrap());
    writer.join().unwrap();
    assert_eq!(s.get_first(99).unwrap().read_to_vec(), b"vvv");
}

#[test]
fn walk_stops_on_break() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "walkstop", 8);
    for i in 0..50u64 {
        drop(s.create(key(i), b"w").unwrap());
    }
    let mut visited = 0;
    s.walk(|_| {
        visited += 1;
        if visited == 7 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })
    .unwrap();
    assert_eq!(visited, 7);
}

#[test]
fn get_alloc_returns_existing() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "gaexist", 8);
    drop(s.create(13, b"already").unwrap());
    let (r, is_new) = s
        .get_alloc(
            13,
            GetAlloc {
                len: 8,
                eq: &|v| v.len() == 7,
                precreate: None,
                init: &|w| w.append(b"ignored"),
            },
        )
        .unwrap();
    assert!(!is_new);
    assert_eq!(r.read_to_vec(), b"already");
}

#[test]
fn get_alloc_precreate_vetoes() {
    let dir = TempDir::new().unwrap();
    let s = open_tmp(&dir, "gaveto", 8);
    let res = s.get_alloc(
        21,
        GetAlloc {
            len: 4,
            eq: &|_| true,
            precreate: Some(&|| Err(StoreError::BadInput)),
            init: &|w| w.append(b"neve"),
        },
    );
    assert_eq!(res.unwrap_err(), StoreError::BadInput);
    assert!(s.get(21).next().unwrap().is_none());
    assert_eq!(s.stats().records, 0);
}
