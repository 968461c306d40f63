// SPDX-License-Identifier: AGPL-3.0-or-later
// NvHeap - Persistent Multi-Process Heap over Shared NVM
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Single-process end-to-end scenarios at full heap size.

use nvheap_storage::{ShelfFile, ShelfHeap};

const HEAP_SIZE: u64 = 128 * 1024 * 1024;

/// Create a 128 MiB heap, allocate ten integers, write 0..9, close,
/// reopen, read them back, destroy.
#[test]
fn full_size_create_alloc_read_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("itest_shelf");
    ShelfFile::new(&path).create(0).unwrap();

    let mut heap = ShelfHeap::new(&path);
    heap.create(HEAP_SIZE).unwrap();
    heap.open().unwrap();
    assert_eq!(heap.size(), HEAP_SIZE);

    let mut offsets = Vec::new();
    for i in 0..10i32 {
        let offset = heap.alloc(std::mem::size_of::<i32>() as u64);
        assert!(heap.is_valid_offset(offset));
        let ptr = heap.offset_to_ptr(offset) as *mut i32;
        assert_eq!(heap.ptr_to_offset(ptr as *const u8), offset);
        unsafe { ptr.write(i) };
        offsets.push(offset);
    }
    heap.close().unwrap();

    heap.open().unwrap();
    for (i, &offset) in offsets.iter().enumerate() {
        let value = unsafe { (heap.offset_to_ptr(offset) as *const i32).read() };
        assert_eq!(value, i as i32);
        heap.free(offset);
    }
    heap.close().unwrap();
    heap.destroy().unwrap();
}

/// Three 1 MiB objects keep their fill patterns across a reopen.
#[test]
fn large_objects_survive_reopen() {
    const OBJECT: usize = 1024 * 1024;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("itest_large");
    ShelfFile::new(&path).create(0).unwrap();

    let mut heap = ShelfHeap::new(&path);
    heap.create(HEAP_SIZE).unwrap();
    heap.open().unwrap();

    let mut offsets = Vec::new();
    for fill in 0u8..3 {
        let offset = heap.alloc(OBJECT as u64);
        assert!(heap.is_valid_offset(offset));
        unsafe { std::ptr::write_bytes(heap.offset_to_ptr(offset), fill, OBJECT) };
        offsets.push(offset);
    }
    heap.close().unwrap();

    heap.open().unwrap();
    for (fill, &offset) in offsets.iter().enumerate() {
        let buf = unsafe { std::slice::from_raw_parts(heap.offset_to_ptr(offset), OBJECT) };
        assert!(buf.iter().all(|&b| b == fill as u8), "pattern {} damaged", fill);
        heap.free(offset);
    }
    heap.close().unwrap();
    heap.destroy().unwrap();
}
