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

//! # Epoch Zone Heap
//!
//! The user-facing allocator: one [`ShelfHeap`] (the storage), one header
//! shelf (the deferred-free metadata) and the process-wide
//! [`EpochManager`], composed so that one process may `free` a block
//! while another still holds a [`GlobalPtr`] to it, without
//! use-after-free.
//!
//! ## Header shelf layout
//!
//! ```text
//! Offset  Size  Contents
//! ------  ----  --------
//!      0   320  5 stack head cells, one per cache line — the per-epoch
//!               delay lists, packed (index:u32, tag:u32), 0 = empty
//!    320   192  the zone shelf heap's header overlay (magic, capacity,
//!               next_free)
//! ```
//!
//! ## The `e + 3` rule
//!
//! A block freed under an epoch lease whose pinned reported epoch is `e`
//! goes onto `global_list[(e + 3) % 5]`. The cleaner, holding its own
//! lease at reported epoch `e'`, drains `global_list[e' % 5]`. The block
//! is therefore only handed back to the shelf heap once some observer
//! has seen `reported_epoch ≥ e + 3`, which by the epoch invariant means
//! no critical section that could have observed the pointer is still
//! active. Five buckets leave one spare around the `+3` horizon so
//! pushes at epoch `e` and pops at `e − 2` never touch the same cell.
//!
//! ## Cleaner lifecycle
//!
//! `stopped → starting → running → stopping → stopped`, with a
//! mutex/condvar handshake: `open` returns only after the cleaner has
//! reported `running`, so alloc/free never race a half-started worker.
//! Each pass drains at most [`FREE_BATCH`] blocks from a single bucket,
//! bounding the latency of one iteration. A crash between pop and free
//! leaks the popped block; the bump heap has no free list to corrupt.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace, warn};

use nvheap_core::{Config, GlobalPtr, NvHeapError, PoolId, Result, ShelfId, ShelfIndex};

use crate::entry_stack::EntryStack;
use crate::epoch::{EpochManager, EpochOp};
use crate::pmem;
use crate::pool::Pool;
use crate::region::ShelfRegion;
use crate::shelf_file::{ShelfFile, ShelfMapping};
use crate::shelf_heap::{round_up, ShelfHeap, CACHELINE};

// =============================================================================
// Constants
// =============================================================================

/// Number of per-epoch delay lists.
pub const LIST_COUNT: usize = 5;

/// Maximum blocks reclaimed per cleaner pass.
pub const FREE_BATCH: usize = 128;

/// Cleaner poll interval.
pub const WORKER_SLEEP_US: u64 = 10_000;

/// Shelf slot of the deferred-free metadata within the pool.
pub const HEADER_IDX: ShelfIndex = 0;

/// Shelf slot of the zone (storage) shelf within the pool.
pub const ZONE_IDX: ShelfIndex = 1;

/// Fixed size of the header shelf.
const HEADER_SHELF_SIZE: u64 = 4096;

/// Bytes reserved for the stack head cells.
const STACKS_RESERVED: u64 = (LIST_COUNT as u64) * CACHELINE;

// =============================================================================
// Cleaner state
// =============================================================================

/// Cleaner thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CleanerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// State shared between the heap handle and its cleaner thread.
struct ZoneShared {
    heap: ShelfHeap,
    /// Keeps the header shelf mapped; `stacks` and the heap's header
    /// overlay point into it.
    header_mapping: ShelfMapping,
    stacks: *const EntryStack,
    min_alloc: u64,
    epoch: Arc<EpochManager>,
    state: Mutex<CleanerState>,
    running: Condvar,
}

// SAFETY: `stacks` points into `header_mapping`, which lives exactly as
// long as this struct; the cells behind it and the heap's shared words
// are only ever accessed through SeqCst atomics. The remaining fields
// are Send + Sync on their own.
unsafe impl Send for ZoneShared {}
unsafe impl Sync for ZoneShared {}

impl ZoneShared {
    #[inline]
    fn bucket(&self, idx: usize) -> &EntryStack {
        debug_assert!(idx < LIST_COUNT);
        // SAFETY: the header mapping starts with LIST_COUNT cache-line
        // cells and outlives self.
        unsafe { &*self.stacks.add(idx) }
    }
}

// =============================================================================
// Epoch zone heap
// =============================================================================

/// A heap with epoch-protected, cross-process-safe deferred free.
pub struct EpochZoneHeap {
    pool_id: PoolId,
    pool: Pool,
    epoch: Arc<EpochManager>,
    shared: Option<Arc<ZoneShared>>,
    cleaner: Option<JoinHandle<()>>,
}

impl EpochZoneHeap {
    /// Handle for the zone heap stored in pool `pool_id`.
    pub fn new(pool_id: PoolId, config: Config, epoch: Arc<EpochManager>) -> Self {
        Self {
            pool_id,
            pool: Pool::new(pool_id, config),
            epoch,
            shared: None,
            cleaner: None,
        }
    }

    /// Whether the underlying pool exists.
    pub fn exists(&self) -> bool {
        self.pool.exists()
    }

    /// Whether the heap is open (and its cleaner running).
    pub fn is_open(&self) -> bool {
        self.shared.is_some()
    }

    fn zone_shelf_id(&self) -> ShelfId {
        ShelfId::new(self.pool_id, ZONE_IDX)
    }

    /// Offset of the zone heap's header overlay within the header shelf.
    fn overlay_offset() -> usize {
        round_up(STACKS_RESERVED, CACHELINE) as usize
    }

    /// Create the pool and both shelves, formatting the delay lists and
    /// the zoned shelf heap. The heap is left closed.
    pub fn create(&mut self, size: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        if self.pool.exists() {
            return Err(NvHeapError::PoolFound);
        }
        let result = self.create_inner(size);
        if self.pool.is_open() {
            let _ = self.pool.close();
        }
        result.map_err(|e| {
            error!(pool = self.pool_id, error = %e, "zone heap create failed");
            NvHeapError::HeapCreateFailed(e.to_string())
        })
    }

    fn create_inner(&mut self, size: u64) -> Result<()> {
        self.pool.create(size)?;
        self.pool.open()?;

        self.pool.add_shelf(HEADER_IDX, |path, _size| {
            ShelfRegion::new(path).create(HEADER_SHELF_SIZE)
        })?;

        // Map the header shelf and zero the delay lists.
        let mut region = ShelfRegion::new(self.pool.shelf_path(HEADER_IDX));
        region.open()?;
        let base = region.map(0, 0)?;
        // SAFETY: the mapping spans HEADER_SHELF_SIZE ≥ the stack cells
        // plus the heap header overlay.
        unsafe {
            std::ptr::write_bytes(base, 0, STACKS_RESERVED as usize);
        }
        pmem::persist(base, STACKS_RESERVED as usize);

        // Format the zone shelf as a heap whose header lives in this
        // region, right after the delay lists.
        let overlay = unsafe { base.add(Self::overlay_offset()) };
        let zone_id = self.zone_shelf_id();
        self.pool.add_shelf(ZONE_IDX, |path, shelf_size| {
            ShelfFile::new(path).create(0)?;
            let mut heap = ShelfHeap::with_id(path, zone_id);
            // SAFETY: overlay points into the region mapped above, which
            // stays mapped until after this closure returns.
            unsafe { heap.create_zoned(shelf_size, overlay) }
        })?;

        region.close()?;
        self.pool.close()?;
        debug!(pool = self.pool_id, size, "zone heap created");
        Ok(())
    }

    /// Remove both shelves and the pool.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        if !self.pool.exists() {
            return Err(NvHeapError::PoolNotFound);
        }
        let result = self.destroy_inner();
        if self.pool.is_open() {
            let _ = self.pool.close();
        }
        result.map_err(|e| {
            error!(pool = self.pool_id, error = %e, "zone heap destroy failed");
            NvHeapError::HeapDestroyFailed(e.to_string())
        })
    }

    fn destroy_inner(&mut self) -> Result<()> {
        self.pool.open()?;

        // Clear the zone heap's persistent state through its overlay.
        let mut file = ShelfFile::new(self.pool.shelf_path(HEADER_IDX));
        file.open()?;
        let mapping = file.map(0, 0)?;
        file.close();
        let overlay = unsafe { mapping.base().add(Self::overlay_offset()) };
        let mut heap = ShelfHeap::with_id(self.pool.shelf_path(ZONE_IDX), self.zone_shelf_id());
        // SAFETY: overlay points into `mapping`, alive until dropped below.
        unsafe { heap.destroy_zoned(overlay)? };
        drop(mapping);

        self.pool.remove_shelf(ZONE_IDX)?;
        self.pool.remove_shelf(HEADER_IDX)?;
        self.pool.close()?;
        self.pool.destroy()?;
        debug!(pool = self.pool_id, "zone heap destroyed");
        Ok(())
    }

    /// Map the header shelf, open the zoned shelf heap and start the
    /// cleaner; returns once the cleaner reports it is running.
    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        let result = self.open_inner();
        if result.is_err() && self.pool.is_open() {
            let _ = self.pool.close();
        }
        result.map_err(|e| {
            error!(pool = self.pool_id, error = %e, "zone heap open failed");
            NvHeapError::HeapOpenFailed(e.to_string())
        })
    }

    fn open_inner(&mut self) -> Result<()> {
        self.pool.open()?;

        let mut file = ShelfFile::with_id(
            self.pool.shelf_path(HEADER_IDX),
            ShelfId::new(self.pool_id, HEADER_IDX),
        );
        file.open()?;
        let header_mapping = file.map(0, 0)?;
        file.close();

        let base = header_mapping.base();
        let stacks = base as *const EntryStack;
        let overlay = unsafe { base.add(Self::overlay_offset()) };

        let mut heap = ShelfHeap::with_id(self.pool.shelf_path(ZONE_IDX), self.zone_shelf_id());
        // SAFETY: overlay points into header_mapping, which is moved into
        // ZoneShared below and outlives the heap (dropped together, heap
        // closed first in close()).
        unsafe { heap.open_zoned(overlay)? };
        let min_alloc = heap.min_alloc_size();

        let shared = Arc::new(ZoneShared {
            heap,
            header_mapping,
            stacks,
            min_alloc,
            epoch: Arc::clone(&self.epoch),
            state: Mutex::new(CleanerState::Starting),
            running: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("nvheap-cleaner-{}", self.pool_id))
            .spawn(move || cleaner_loop(worker_shared))
            .map_err(NvHeapError::Io)?;

        // Block until the cleaner has promoted itself to running, so
        // alloc/free never race a half-started worker.
        {
            let mut state = shared.state.lock();
            while *state != CleanerState::Running {
                shared.running.wait(&mut state);
            }
        }

        self.cleaner = Some(handle);
        self.shared = Some(shared);
        debug!(pool = self.pool_id, "zone heap opened");
        Ok(())
    }

    /// Stop and join the cleaner, close the shelf heap, unmap the header
    /// shelf.
    pub fn close(&mut self) -> Result<()> {
        debug_assert!(self.is_open());
        let shared = self.shared.take().ok_or(NvHeapError::NotOpen)?;

        {
            let mut state = shared.state.lock();
            if *state == CleanerState::Running || *state == CleanerState::Starting {
                *state = CleanerState::Stopping;
            }
        }
        if let Some(handle) = self.cleaner.take() {
            if handle.join().is_err() {
                warn!(pool = self.pool_id, "cleaner thread panicked");
            }
        }
        {
            let mut state = shared.state.lock();
            *state = CleanerState::Stopped;
        }

        let mut shared = Arc::try_unwrap(shared).map_err(|_| {
            NvHeapError::HeapCloseFailed("cleaner state still referenced".to_string())
        })?;
        shared
            .heap
            .close()
            .map_err(|e| NvHeapError::HeapCloseFailed(e.to_string()))?;
        drop(shared.header_mapping);

        self.pool
            .close()
            .map_err(|e| NvHeapError::HeapCloseFailed(e.to_string()))?;
        debug!(pool = self.pool_id, "zone heap closed");
        Ok(())
    }

    /// Usable capacity of the zone shelf in bytes.
    pub fn size(&self) -> u64 {
        self.shared
            .as_ref()
            .map(|s| s.heap.size())
            .unwrap_or(0)
    }

    /// Allocate `size` bytes; the null pointer signals exhaustion.
    pub fn alloc(&self, size: u64) -> GlobalPtr {
        let Some(shared) = self.shared.as_ref() else {
            debug_assert!(false, "alloc on a closed heap");
            return GlobalPtr::null();
        };
        let offset = shared.heap.alloc(size);
        if shared.heap.is_valid_offset(offset) {
            GlobalPtr::new(self.zone_shelf_id(), offset)
        } else {
            GlobalPtr::null()
        }
    }

    /// Allocate under an epoch lease.
    ///
    /// Allocation consumes no epoch state, but the lease is required by
    /// contract: any cross-process reader that may observe the returned
    /// pointer is protected by the same epoch it was published in.
    pub fn alloc_protected(&self, _op: &EpochOp<'_>, size: u64) -> GlobalPtr {
        self.alloc(size)
    }

    /// Deferred free under an epoch lease — the defining operation.
    ///
    /// With `e` the lease's pinned reported epoch, the block is pushed
    /// onto `global_list[(e + 3) % 5]` as a block index. It is *not*
    /// returned to the shelf heap here; the cleaner hands it over once
    /// the reported epoch has passed `e + 3`.
    pub fn free_protected(&self, op: &EpochOp<'_>, ptr: GlobalPtr) {
        let Some(shared) = self.shared.as_ref() else {
            debug_assert!(false, "free on a closed heap");
            return;
        };
        debug_assert_eq!(ptr.shelf_id(), self.zone_shelf_id());
        let offset = ptr.offset();
        if !shared.heap.is_valid_offset(offset) {
            return;
        }
        let epoch = op.reported_epoch();
        let bucket = ((epoch + 3) % LIST_COUNT as u64) as usize;
        trace!(offset, epoch = epoch + 3, "delay freeing block");
        // SAFETY: offset was validated against the heap's data range and
        // the bucket cell lives in the header mapping.
        unsafe {
            shared.bucket(bucket).push(
                shared.heap.base(),
                shared.min_alloc,
                (offset / shared.min_alloc) as u32,
            );
        }
    }

    /// Immediate free, outside any critical region.
    ///
    /// Equivalent to the shelf heap's own `free`; permissible only when
    /// the caller can prove no reader anywhere still holds the pointer.
    pub fn free_immediate(&self, ptr: GlobalPtr) {
        let Some(shared) = self.shared.as_ref() else {
            debug_assert!(false, "free on a closed heap");
            return;
        };
        shared.heap.free(ptr.offset());
    }

    /// Local address of the block `ptr` names.
    pub fn global_to_local(&self, ptr: GlobalPtr) -> *mut u8 {
        let Some(shared) = self.shared.as_ref() else {
            debug_assert!(false, "global_to_local on a closed heap");
            return std::ptr::null_mut();
        };
        debug_assert_eq!(ptr.shelf_id(), self.zone_shelf_id());
        shared.heap.offset_to_ptr(ptr.offset())
    }
}

impl Drop for EpochZoneHeap {
    fn drop(&mut self) {
        if self.is_open() {
            if let Err(e) = self.close() {
                warn!(pool = self.pool_id, error = %e, "zone heap close on drop failed");
            }
        }
    }
}

// =============================================================================
// Background worker
// =============================================================================

/// The background worker: drain one epoch bucket per pass.
fn cleaner_loop(shared: Arc<ZoneShared>) {
    trace!("cleaner: starting");
    loop {
        std::thread::sleep(Duration::from_micros(WORKER_SLEEP_US));

        {
            let mut state = shared.state.lock();
            if *state == CleanerState::Starting {
                *state = CleanerState::Running;
                shared.running.notify_all();
                trace!("cleaner: running");
            }
            if *state == CleanerState::Stopping {
                trace!("cleaner: exiting");
                return;
            }
        }

        let op = EpochOp::new(&shared.epoch);
        let epoch = op.reported_epoch();
        let bucket = shared.bucket((epoch % LIST_COUNT as u64) as usize);

        let mut freed = 0usize;
        for _ in 0..FREE_BATCH {
            // SAFETY: indices on the bucket were validated when pushed
            // and refer into the heap's mapped data range.
            let index = unsafe { bucket.pop(shared.heap.base(), shared.min_alloc) };
            if index == 0 {
                break;
            }
            // A crash here leaks the popped block.
            shared.heap.free(index as u64 * shared.min_alloc);
            freed += 1;
        }
        if freed > 0 {
            trace!(freed, epoch, "cleaner reclaimed blocks");
        }
    }
}
