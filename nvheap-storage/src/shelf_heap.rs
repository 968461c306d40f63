// SPDX-License-Identifier: AGPL-3.0-or-later
// NvHeap - Persistent Multi-Process Heap over Shared NVM
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! # Shelf Heap — A Persistent Bump-Pointer Allocator over One Shelf
//!
//! The heap's entire persistent state is a three-cache-line header
//! followed by the data area:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0      64   magic (u64 LE = 684327; rest of the line zero)
//!  64      64   capacity (u64 LE, bytes of data area)
//! 128      64   next_free (u64 LE, monotonic allocation cursor)
//! 192       —   data area (capacity bytes)
//! ```
//!
//! `next_free` is the only mutable word. Allocation is a CAS-retry loop
//! on it; there is no lock, no free list and no coalescing. `free` is a
//! no-op at this layer — reclamation is the zone heap's concern — so the
//! heap exhausts once its capacity has been consumed by live and leaked
//! blocks alike.
//!
//! ## Crash consistency
//!
//! `create` persists `capacity`, `next_free` and the zeroed data area
//! *before* storing and persisting the magic sentinel. The sentinel is
//! the witness that the header is fully initialized: a crash anywhere
//! inside `create` leaves a heap that fails `verify`. `destroy` inverts
//! the order, clearing the magic first.
//!
//! ## Zoned variant
//!
//! A *zoned* heap keeps these same three header lines in a sibling
//! mapping (the zone heap's header shelf) instead of its own shelf. The
//! zone shelf's first `HEADER_SIZE` bytes are reserved-unused so that
//! offset arithmetic, validity checks and pointer conversion are
//! identical in both variants: the smallest valid offset is always
//! `HEADER_SIZE`.

use std::path::Path;

use tracing::{error, trace};

use nvheap_core::{NvHeapError, Offset, Result, ShelfId};

use crate::pmem;
use crate::shelf_file::{ShelfFile, ShelfMapping};

// =============================================================================
// Layout constants
// =============================================================================

/// Cache line size the layout is built around.
pub const CACHELINE: u64 = 64;

/// Allocation granularity: every block size is rounded up to this.
pub const MIN_ALLOC_SIZE: u64 = CACHELINE;

/// Size of the persistent header; also the smallest valid offset.
pub const HEADER_SIZE: u64 = 3 * CACHELINE;

/// Sentinel marking a fully-initialized heap header.
pub(crate) const HEAP_MAGIC: u64 = 684_327;

const MAGIC_OFFSET: usize = 0;
const CAPACITY_OFFSET: usize = CACHELINE as usize;
const NEXT_FREE_OFFSET: usize = 2 * CACHELINE as usize;

/// Round `n` up to the next multiple of `align`.
#[inline]
pub(crate) fn round_up(n: u64, align: u64) -> u64 {
    (n + align - 1) / align * align
}

// =============================================================================
// Shelf heap
// =============================================================================

/// A bump-pointer allocator over one shelf.
#[derive(Debug)]
pub struct ShelfHeap {
    file: ShelfFile,
    mapping: Option<ShelfMapping>,
    /// Header location: equals `base` for a plain heap, or points into a
    /// sibling mapping for the zoned variant.
    header: *mut u8,
    /// Base of the shelf mapping; offsets are relative to it.
    base: *mut u8,
    capacity: u64,
    is_open: bool,
}

// SAFETY: the only state mutated through a shared `&ShelfHeap` is mapped
// words reached via the SeqCst atomics in crate::pmem (`next_free`).
// Everything else (open/close/create/destroy) takes `&mut self` and is
// made exclusive by the borrow checker. For the zoned variant the caller
// guarantees the sibling header mapping outlives the heap (see
// `open_zoned`).
unsafe impl Send for ShelfHeap {}
unsafe impl Sync for ShelfHeap {}

impl ShelfHeap {
    /// Handle over the shelf file at `path`. The file must be created
    /// separately; `create` only formats it.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::from_file(ShelfFile::new(path.as_ref()))
    }

    /// Handle carrying the shelf identity for diagnostics.
    pub fn with_id(path: impl AsRef<Path>, shelf_id: ShelfId) -> Self {
        Self::from_file(ShelfFile::with_id(path.as_ref(), shelf_id))
    }

    fn from_file(file: ShelfFile) -> Self {
        Self {
            file,
            mapping: None,
            header: std::ptr::null_mut(),
            base: std::ptr::null_mut(),
            capacity: 0,
            is_open: false,
        }
    }

    /// Whether the heap is open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// Format the shelf as a heap with `capacity` data bytes.
    ///
    /// The backing shelf file must already exist; it is truncated to
    /// `HEADER_SIZE + capacity`. The magic sentinel is stored and
    /// persisted last.
    pub fn create(&mut self, capacity: u64) -> Result<()> {
        self.create_impl(capacity, None)
    }

    /// Format the shelf as a zoned heap whose header lines live at
    /// `header` (inside a sibling mapping owned by the caller).
    ///
    /// # Safety
    ///
    /// `header` must point at `HEADER_SIZE` writable bytes of a live
    /// `MAP_SHARED` mapping and stay valid for the duration of the call.
    pub unsafe fn create_zoned(&mut self, capacity: u64, header: *mut u8) -> Result<()> {
        self.create_impl(capacity, Some(header))
    }

    fn create_impl(&mut self, capacity: u64, external: Option<*mut u8>) -> Result<()> {
        debug_assert!(!self.is_open);
        if self.is_open {
            return Err(NvHeapError::AlreadyOpen);
        }
        if !self.file.exists() {
            return Err(NvHeapError::ShelfFileNotFound(self.file.path().to_path_buf()));
        }

        self.file.open()?;
        let total = HEADER_SIZE + capacity;
        self.file.truncate(total)?;
        let mapping = self.file.map(0, 0)?;
        let base = mapping.base();
        let header = external.unwrap_or(base);

        // SAFETY: base spans `total` mapped bytes; header points at three
        // writable cache lines (same mapping, or the caller-guaranteed
        // sibling mapping for the zoned variant).
        unsafe {
            // Invalidate any previous incarnation before touching the rest.
            pmem::store_u64(header.add(MAGIC_OFFSET), 0);
            pmem::persist(header, CACHELINE as usize);

            std::ptr::write_bytes(base, 0, total as usize);
            pmem::store_u64(header.add(CAPACITY_OFFSET), capacity);
            pmem::store_u64(header.add(NEXT_FREE_OFFSET), HEADER_SIZE);
            pmem::persist(header.add(CAPACITY_OFFSET), 2 * CACHELINE as usize);
            pmem::persist(base, total as usize);

            // The sentinel goes last: it witnesses a complete header.
            pmem::store_u64(header.add(MAGIC_OFFSET), HEAP_MAGIC);
            pmem::persist(header, CACHELINE as usize);
        }

        drop(mapping);
        self.file.close();
        trace!(path = %self.file.path().display(), capacity, "shelf heap created");
        Ok(())
    }

    /// Erase the heap's persistent state: the magic is cleared and
    /// persisted first, then the rest is zeroed.
    ///
    /// The backing file itself is left in place for its owner to remove.
    pub fn destroy(&mut self) -> Result<()> {
        self.destroy_impl(None)
    }

    /// Zoned counterpart of [`ShelfHeap::destroy`].
    ///
    /// # Safety
    ///
    /// Same contract as [`ShelfHeap::create_zoned`].
    pub unsafe fn destroy_zoned(&mut self, header: *mut u8) -> Result<()> {
        self.destroy_impl(Some(header))
    }

    fn destroy_impl(&mut self, external: Option<*mut u8>) -> Result<()> {
        debug_assert!(!self.is_open);
        if self.is_open {
            return Err(NvHeapError::AlreadyOpen);
        }
        if !self.file.exists() {
            return Err(NvHeapError::ShelfFileNotFound(self.file.path().to_path_buf()));
        }

        self.file.open()?;
        let mapping = self.file.map(0, 0)?;
        let base = mapping.base();
        let header = external.unwrap_or(base);
        let total = mapping.len();

        // SAFETY: same mapping contract as create_impl.
        unsafe {
            pmem::store_u64(header.add(MAGIC_OFFSET), 0);
            pmem::persist(header, CACHELINE as usize);

            pmem::store_u64(header.add(CAPACITY_OFFSET), 0);
            pmem::store_u64(header.add(NEXT_FREE_OFFSET), 0);
            std::ptr::write_bytes(base, 0, total);
            pmem::persist(header.add(CAPACITY_OFFSET), 2 * CACHELINE as usize);
            pmem::persist(base, total);
        }

        drop(mapping);
        self.file.close();
        trace!(path = %self.file.path().display(), "shelf heap destroyed");
        Ok(())
    }

    /// Check the magic sentinel with a single atomic load.
    ///
    /// `Ok(true)` means the heap was fully created and not destroyed.
    pub fn verify(&mut self) -> Result<bool> {
        if self.is_open {
            // SAFETY: header is valid while open.
            return Ok(unsafe { pmem::load_u64(self.header.add(MAGIC_OFFSET)) } == HEAP_MAGIC);
        }
        if !self.file.exists() {
            return Err(NvHeapError::ShelfFileNotFound(self.file.path().to_path_buf()));
        }
        self.file.open()?;
        let mapping = self.file.map(CACHELINE as usize, 0)?;
        // SAFETY: the mapping spans at least one cache line.
        let magic = unsafe { pmem::load_u64(mapping.base().add(MAGIC_OFFSET)) };
        drop(mapping);
        self.file.close();
        Ok(magic == HEAP_MAGIC)
    }

    /// Map the shelf and validate its header.
    pub fn open(&mut self) -> Result<()> {
        self.open_impl(None)
    }

    /// Open a zoned heap whose header lines live at `header`.
    ///
    /// # Safety
    ///
    /// `header` must point at `HEADER_SIZE` bytes of a live `MAP_SHARED`
    /// mapping that outlives this heap (i.e. stays mapped until after
    /// [`ShelfHeap::close`]).
    pub unsafe fn open_zoned(&mut self, header: *mut u8) -> Result<()> {
        self.open_impl(Some(header))
    }

    fn open_impl(&mut self, external: Option<*mut u8>) -> Result<()> {
        debug_assert!(!self.is_open);
        if self.is_open {
            return Err(NvHeapError::AlreadyOpen);
        }
        if !self.file.exists() {
            return Err(NvHeapError::ShelfFileNotFound(self.file.path().to_path_buf()));
        }

        self.file.open()?;
        let mapping = self.file.map(0, 0)?;
        let base = mapping.base();
        let header = external.unwrap_or(base);

        // SAFETY: mapping/sibling-mapping contract as in create_impl.
        let (magic, capacity, next_free) = unsafe {
            (
                pmem::load_u64(header.add(MAGIC_OFFSET)),
                pmem::load_u64(header.add(CAPACITY_OFFSET)),
                pmem::load_u64(header.add(NEXT_FREE_OFFSET)),
            )
        };

        if magic != HEAP_MAGIC {
            error!(
                path = %self.file.path().display(),
                magic,
                "shelf heap magic mismatch"
            );
            self.file.close();
            return Err(NvHeapError::HeapOpenFailed(format!(
                "magic mismatch in {}",
                self.file.path().display()
            )));
        }
        if (mapping.len() as u64) < HEADER_SIZE + capacity
            || next_free < HEADER_SIZE
            || next_free > HEADER_SIZE + capacity
        {
            self.file.close();
            return Err(NvHeapError::Corruption(format!(
                "heap header out of range in {} (capacity={}, next_free={}, mapped={})",
                self.file.path().display(),
                capacity,
                next_free,
                mapping.len()
            )));
        }

        self.mapping = Some(mapping);
        self.header = header;
        self.base = base;
        self.capacity = capacity;
        self.is_open = true;
        trace!(path = %self.file.path().display(), capacity, next_free, "shelf heap opened");
        Ok(())
    }

    /// Unmap and close.
    pub fn close(&mut self) -> Result<()> {
        debug_assert!(self.is_open);
        if !self.is_open {
            return Err(NvHeapError::NotOpen);
        }
        self.mapping = None;
        self.file.close();
        self.header = std::ptr::null_mut();
        self.base = std::ptr::null_mut();
        self.capacity = 0;
        self.is_open = false;
        Ok(())
    }

    /// Heap capacity in bytes (excluding the header).
    pub fn size(&self) -> u64 {
        debug_assert!(self.is_open);
        self.capacity
    }

    /// The rounding unit of every allocation.
    pub fn min_alloc_size(&self) -> u64 {
        MIN_ALLOC_SIZE
    }

    /// Allocate `size` bytes, returning the block's offset or `0` when
    /// the heap is exhausted.
    ///
    /// The request is rounded up to a cache-line multiple; a zero-size
    /// request still consumes one cache line so every successful
    /// allocation has a distinct offset. The cursor is advanced with a
    /// CAS-retry loop; no lock is taken.
    pub fn alloc(&self, size: u64) -> Offset {
        debug_assert!(self.is_open);
        if !self.is_open {
            return 0;
        }
        let need = round_up(size.max(1), MIN_ALLOC_SIZE);
        loop {
            // SAFETY: header stays valid while open; next_free is only
            // ever accessed through these atomics.
            let expected = unsafe { pmem::load_u64(self.header.add(NEXT_FREE_OFFSET)) };
            let desired = expected + need;
            if desired - HEADER_SIZE > self.capacity {
                return 0;
            }
            match unsafe { pmem::cas_u64(self.header.add(NEXT_FREE_OFFSET), expected, desired) } {
                Ok(_) => return expected,
                Err(_) => continue,
            }
        }
    }

    /// Release a block.
    ///
    /// Intentionally a no-op: the bump heap keeps no free list, so a
    /// released block is not reusable. Safe reclamation across processes
    /// is the epoch zone heap's responsibility.
    pub fn free(&self, offset: Offset) {
        debug_assert!(self.is_open);
        let _ = offset;
    }

    /// Whether `offset` lies inside the data area.
    #[inline]
    pub fn is_valid_offset(&self, offset: Offset) -> bool {
        offset >= HEADER_SIZE && offset < HEADER_SIZE + self.capacity
    }

    /// Local address of the block at `offset`.
    #[inline]
    pub fn offset_to_ptr(&self, offset: Offset) -> *mut u8 {
        debug_assert!(self.is_open);
        debug_assert!(self.is_valid_offset(offset));
        // SAFETY: the mapping spans HEADER_SIZE + capacity bytes and the
        // offset was validated against that range.
        unsafe { self.base.add(offset as usize) }
    }

    /// Inverse of [`ShelfHeap::offset_to_ptr`]; only defined for
    /// addresses inside this heap's mapping.
    #[inline]
    pub fn ptr_to_offset(&self, addr: *const u8) -> Offset {
        debug_assert!(self.is_open);
        let offset = (addr as usize - self.base as usize) as u64;
        debug_assert!(self.is_valid_offset(offset));
        offset
    }

    /// Base of the shelf mapping (offset zero).
    #[inline]
    pub(crate) fn base(&self) -> *mut u8 {
        debug_assert!(self.is_open);
        self.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    const TEST_CAPACITY: u64 = 1 << 20;

    fn fresh_heap(dir: &std::path::Path, capacity: u64) -> ShelfHeap {
        let path = dir.join("shelf_1_1");
        ShelfFile::new(&path).create(0).unwrap();
        let mut heap = ShelfHeap::new(&path);
        heap.create(capacity).unwrap();
        heap
    }

    #[test]
    fn round_up_matches_granularity() {
        assert_eq!(round_up(0, 64), 0);
        assert_eq!(round_up(1, 64), 64);
        assert_eq!(round_up(64, 64), 64);
        assert_eq!(round_up(65, 64), 128);
    }

    #[test]
    fn create_verify_destroy() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);

        assert!(heap.verify().unwrap());
        heap.destroy().unwrap();
        assert!(!heap.verify().unwrap());
    }

    #[test]
    fn create_requires_backing_file() {
        let dir = tempdir().unwrap();
        let mut heap = ShelfHeap::new(dir.path().join("missing"));
        let err = heap.create(TEST_CAPACITY).unwrap_err();
        assert!(matches!(err, NvHeapError::ShelfFileNotFound(_)));
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempdir().unwrap();
        let mut heap = ShelfHeap::new(dir.path().join("missing"));
        let err = heap.open().unwrap_err();
        assert!(matches!(err, NvHeapError::ShelfFileNotFound(_)));
    }

    #[test]
    fn crash_before_magic_fails_verification() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("torn");

        // Simulate a create interrupted after capacity/next_free were
        // written but before the magic sentinel: the heap must not verify.
        let mut file = ShelfFile::new(&path);
        file.create(HEADER_SIZE + 4096).unwrap();
        file.open().unwrap();
        let mapping = file.map(0, 0).unwrap();
        unsafe {
            crate::pmem::store_u64(mapping.base().add(CAPACITY_OFFSET), 4096);
            crate::pmem::store_u64(mapping.base().add(NEXT_FREE_OFFSET), HEADER_SIZE);
        }
        drop(mapping);
        file.close();

        let mut heap = ShelfHeap::new(&path);
        assert!(!heap.verify().unwrap());
        assert!(matches!(
            heap.open().unwrap_err(),
            NvHeapError::HeapOpenFailed(_)
        ));
    }

    #[test]
    fn allocations_are_disjoint_and_aligned() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();

        let sizes = [1u64, 64, 65, 100, 4096, 0];
        let mut intervals = Vec::new();
        for &size in &sizes {
            let offset = heap.alloc(size);
            assert!(heap.is_valid_offset(offset), "alloc({}) returned {}", size, offset);
            assert_eq!(offset % CACHELINE, 0);
            intervals.push((offset, offset + round_up(size.max(1), CACHELINE)));
        }
        for (i, a) in intervals.iter().enumerate() {
            for b in intervals.iter().skip(i + 1) {
                assert!(a.1 <= b.0 || b.1 <= a.0, "{:?} overlaps {:?}", a, b);
            }
        }

        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn alloc_zero_consumes_one_cache_line() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();

        let a = heap.alloc(0);
        let b = heap.alloc(0);
        assert!(heap.is_valid_offset(a));
        assert!(heap.is_valid_offset(b));
        assert_eq!(b, a + CACHELINE);

        heap.close().unwrap();
    }

    #[test]
    fn exact_capacity_fill_then_null() {
        let dir = tempdir().unwrap();
        let capacity = 4 * CACHELINE;
        let mut heap = fresh_heap(dir.path(), capacity);
        heap.open().unwrap();

        // Allocating up to exactly capacity succeeds...
        for _ in 0..4 {
            assert!(heap.is_valid_offset(heap.alloc(CACHELINE)));
        }
        // ...and the next allocation returns the null offset.
        assert_eq!(heap.alloc(1), 0);
        assert_eq!(heap.alloc(0), 0);

        heap.close().unwrap();
    }

    #[test]
    fn one_oversized_request_fills_whole_heap() {
        let dir = tempdir().unwrap();
        let capacity = 4 * CACHELINE;
        let mut heap = fresh_heap(dir.path(), capacity);
        heap.open().unwrap();

        let offset = heap.alloc(capacity);
        assert_eq!(offset, HEADER_SIZE);
        assert_eq!(heap.alloc(1), 0);

        heap.close().unwrap();
    }

    #[test]
    fn reopen_preserves_contents_and_cursor() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();

        let mut offsets = Vec::new();
        for i in 0..10u64 {
            let offset = heap.alloc(std::mem::size_of::<u64>() as u64);
            assert!(heap.is_valid_offset(offset));
            unsafe { (heap.offset_to_ptr(offset) as *mut u64).write(i) };
            offsets.push(offset);
        }
        let high_water = *offsets.last().unwrap();
        heap.close().unwrap();

        heap.open().unwrap();
        for (i, &offset) in offsets.iter().enumerate() {
            let value = unsafe { (heap.offset_to_ptr(offset) as *const u64).read() };
            assert_eq!(value, i as u64);
        }
        // The cursor is monotonic across reopen: new blocks never overlap
        // pre-crash allocations.
        let next = heap.alloc(8);
        assert!(next > high_water);

        heap.close().unwrap();
        heap.destroy().unwrap();
    }

    #[test]
    fn create_destroy_create_yields_fresh_heap() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();
        let first = heap.alloc(64);
        assert_eq!(first, HEADER_SIZE);
        assert!(heap.is_valid_offset(heap.alloc(64)));
        heap.close().unwrap();

        heap.destroy().unwrap();
        heap.create(TEST_CAPACITY).unwrap();
        heap.open().unwrap();
        // The cursor starts over: the recreated heap is empty.
        assert_eq!(heap.alloc(64), HEADER_SIZE);
        heap.close().unwrap();
    }

    #[test]
    fn offset_pointer_round_trip() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();

        let offset = heap.alloc(128);
        let ptr = heap.offset_to_ptr(offset);
        assert_eq!(heap.ptr_to_offset(ptr), offset);

        heap.close().unwrap();
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let dir = tempdir().unwrap();
        let mut heap = fresh_heap(dir.path(), TEST_CAPACITY);
        heap.open().unwrap();
        let heap = Arc::new(heap);

        const THREADS: usize = 5;
        const TRIES: usize = 10;

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let mut offsets = Vec::with_capacity(TRIES);
                    for i in 0..TRIES {
                        let offset = heap.alloc(std::mem::size_of::<u32>() as u64);
                        assert!(heap.is_valid_offset(offset));
                        unsafe {
                            (heap.offset_to_ptr(offset) as *mut u32)
                                .write((t * TRIES + i) as u32)
                        };
                        offsets.push(offset);
                    }
                    offsets
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        // Every write is still readable and every offset is distinct.
        all.sort_unstable();
        let len = all.len();
        all.dedup();
        assert_eq!(all.len(), len, "duplicate offsets handed out");

        let mut heap = Arc::try_unwrap(heap).unwrap();
        for &offset in &all {
            heap.free(offset);
        }
        heap.close().unwrap();
        heap.destroy().unwrap();
    }
}
