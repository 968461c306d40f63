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

//! # Epoch Manager
//!
//! Coordinates global epoch advancement across every thread of every
//! process sharing one *epoch shelf*:
//!
//! ```text
//! Cell   Offset   Contents
//! ----   ------   --------
//!  0          0   magic
//!  1         64   frontier_epoch  (epoch new critical sections enter at)
//!  2        128   reported_epoch  (largest epoch with no active reader)
//!  3..      192   256 participant slots, one cache line each;
//!                 a slot holds the epoch its reader entered at,
//!                 0 = inactive
//! ```
//!
//! Every cell is a single 64-bit word alone in its cache line, accessed
//! exclusively through the persistent atomics in [`crate::pmem`].
//!
//! ## Protocol
//!
//! *Enter*: claim a free slot with CAS(0 → frontier), then re-validate:
//! if the frontier moved before the publication became visible, re-store
//! the new frontier and check again. The loop converges because the
//! frontier advances at most once per horizon computation.
//!
//! *Horizon* (`reported_epoch`): scan the slots for the minimum active
//! epoch `m`. The new reported value is `m − 1`, or `frontier − 1` when
//! nobody is active — raised with a CAS-max so every observer sees a
//! monotonically non-decreasing sequence. The same pass advances the
//! frontier by one CAS when all active readers have caught up with it,
//! which is what keeps reclamation moving: each cleaner pass opens a
//! fresh [`EpochOp`] and thereby pumps the horizon forward.
//!
//! Once a thread observes `reported_epoch = R`, no thread anywhere is
//! inside a critical section entered at an epoch ≤ R: active slots all
//! hold values > R, and a reader whose publication raced the scan
//! re-validates against the frontier (> R) before its enter returns.
//!
//! ## Fork
//!
//! The mapping is process-local state. `reset_before_fork` tears it
//! down, `reset_after_fork` rebuilds it; callers must quiesce all
//! threads around the pair, in parent and child alike.

use std::cell::Cell;
use std::path::Path;

use parking_lot::RwLock;
use tracing::{error, trace};

use nvheap_core::{Config, NvHeapError, Result};

use crate::pmem;
use crate::shelf_file::{ShelfFile, ShelfMapping};

// =============================================================================
// Constants
// =============================================================================

/// Sentinel marking an initialized epoch shelf ("EPOCH").
const EPOCH_MAGIC: u64 = 0x45504F4348;

/// Cells before the participant slots: magic, frontier, reported.
const HEADER_CELLS: usize = 3;

const MAGIC_CELL: usize = 0;
const FRONTIER_CELL: usize = 1;
const REPORTED_CELL: usize = 2;

/// Maximum number of simultaneously active critical sections, across all
/// processes sharing the epoch shelf.
pub const MAX_PARTICIPANTS: usize = 256;

/// Size of the epoch shelf file.
pub(crate) const EPOCH_SHELF_SIZE: u64 = ((HEADER_CELLS + MAX_PARTICIPANTS) * 64) as u64;

thread_local! {
    /// (claimed slot + 1, nesting depth) of this thread's critical
    /// section. One epoch manager per process: the slot is meaningful
    /// only against the process-wide epoch shelf.
    static ACTIVE_SLOT: Cell<(usize, usize)> = Cell::new((0, 0));
}

// =============================================================================
// Epoch shelf (shared state)
// =============================================================================

/// The mapped epoch shelf (process-local view of the shared state).
struct EpochShelf {
    mapping: ShelfMapping,
}

// SAFETY: all access to the mapping goes through SeqCst atomics on
// 8-aligned words (crate::pmem); the mapping is MAP_SHARED by design.
unsafe impl Send for EpochShelf {}
unsafe impl Sync for EpochShelf {}

impl EpochShelf {
    fn open(config: &Config) -> Result<Self> {
        let mut file = ShelfFile::new(config.epoch_shelf_path());
        file.open()?;
        let mapping = file.map(0, 0)?;
        file.close();
        if (mapping.len() as u64) < EPOCH_SHELF_SIZE {
            return Err(NvHeapError::Corruption(format!(
                "epoch shelf truncated: {} bytes",
                mapping.len()
            )));
        }
        let shelf = Self { mapping };
        if shelf.load(MAGIC_CELL) != EPOCH_MAGIC {
            return Err(NvHeapError::Corruption("epoch shelf magic mismatch".into()));
        }
        Ok(shelf)
    }

    #[inline]
    fn cell(&self, idx: usize) -> *mut u8 {
        debug_assert!(idx < HEADER_CELLS + MAX_PARTICIPANTS);
        // SAFETY: idx is bounded and the mapping spans EPOCH_SHELF_SIZE.
        unsafe { self.mapping.base().add(idx * 64) }
    }

    #[inline]
    fn load(&self, idx: usize) -> u64 {
        // SAFETY: cell() yields an 8-aligned word inside the mapping.
        unsafe { pmem::load_u64(self.cell(idx)) }
    }

    #[inline]
    fn store(&self, idx: usize, value: u64) {
        // SAFETY: as in load().
        unsafe { pmem::store_u64(self.cell(idx), value) }
    }

    #[inline]
    fn cas(&self, idx: usize, expected: u64, desired: u64) -> std::result::Result<u64, u64> {
        // SAFETY: as in load().
        unsafe { pmem::cas_u64(self.cell(idx), expected, desired) }
    }

    #[inline]
    fn slot_idx(i: usize) -> usize {
        HEADER_CELLS + i
    }

    /// Claim a free participant slot at the current frontier.
    fn claim_slot(&self) -> usize {
        loop {
            let mut epoch = self.load(FRONTIER_CELL);
            for i in 0..MAX_PARTICIPANTS {
                let idx = Self::slot_idx(i);
                if self.load(idx) == 0 && self.cas(idx, 0, epoch).is_ok() {
                    // Publish-then-validate: if the frontier moved before
                    // our publication became visible to a horizon scan,
                    // re-publish at the new frontier and check again.
                    loop {
                        let now = self.load(FRONTIER_CELL);
                        if now == epoch {
                            return i;
                        }
                        self.store(idx, now);
                        epoch = now;
                    }
                }
            }
            // Slot table full: wait for some reader to exit.
            std::hint::spin_loop();
        }
    }

    fn release_slot(&self, i: usize) {
        self.store(Self::slot_idx(i), 0);
    }

    fn min_active(&self) -> Option<u64> {
        let mut min = None;
        for i in 0..MAX_PARTICIPANTS {
            let v = self.load(Self::slot_idx(i));
            if v != 0 && min.map_or(true, |m| v < m) {
                min = Some(v);
            }
        }
        min
    }

    /// Recompute the horizon and return the (possibly raised) reported
    /// epoch. Advances the frontier when that unblocks progress.
    fn refresh_reported(&self) -> u64 {
        let frontier = self.load(FRONTIER_CELL);
        let candidate = match self.min_active() {
            None => {
                // Nobody is reading; advance so future refreshes can
                // report ever-larger quiescent epochs.
                let _ = self.cas(FRONTIER_CELL, frontier, frontier + 1);
                frontier.saturating_sub(1)
            }
            Some(min) => {
                if min >= frontier {
                    // Every reader has caught up; open the next epoch.
                    let _ = self.cas(FRONTIER_CELL, frontier, frontier + 1);
                }
                min - 1
            }
        };
        loop {
            let reported = self.load(REPORTED_CELL);
            if candidate <= reported {
                return reported;
            }
            if self.cas(REPORTED_CELL, reported, candidate).is_ok() {
                trace!(reported = candidate, frontier, "reported epoch advanced");
                return candidate;
            }
        }
    }
}

// =============================================================================
// Epoch manager
// =============================================================================

/// Process-wide handle to the shared epoch state.
///
/// Construct one per process at startup with [`EpochManager::open`] and
/// pass it by reference (typically inside an `Arc`) to everything that
/// needs epoch protection.
pub struct EpochManager {
    config: Config,
    shelf: RwLock<Option<EpochShelf>>,
}

impl EpochManager {
    /// One-shot bootstrap: create and format the epoch shelf if absent.
    ///
    /// Not thread- or process-safe; must run once before the first
    /// [`EpochManager::open`] anywhere.
    pub fn start(config: &Config) -> Result<()> {
        std::fs::create_dir_all(&config.base_dir)?;
        let path = config.epoch_shelf_path();
        if path.exists() {
            return Ok(());
        }
        let mut file = ShelfFile::new(&path);
        file.create(EPOCH_SHELF_SIZE)?;
        file.open()?;
        let mapping = file.map(0, 0)?;
        let base = mapping.base();
        // SAFETY: the fresh mapping spans EPOCH_SHELF_SIZE bytes.
        unsafe {
            std::ptr::write_bytes(base, 0, EPOCH_SHELF_SIZE as usize);
            pmem::store_u64(base.add(FRONTIER_CELL * 64), 1);
            pmem::store_u64(base.add(REPORTED_CELL * 64), 0);
            pmem::persist(base, EPOCH_SHELF_SIZE as usize);
            pmem::store_u64(base.add(MAGIC_CELL * 64), EPOCH_MAGIC);
            pmem::persist(base, 64);
        }
        drop(mapping);
        file.close();
        trace!(path = %path.display(), "epoch shelf created");
        Ok(())
    }

    /// Delete the epoch shelf. Must run with no user of the epoch state.
    pub fn reset(config: &Config) -> Result<()> {
        let path = config.epoch_shelf_path();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    /// Open the process-wide handle.
    ///
    /// A missing or corrupt epoch shelf is unrecoverable persistent
    /// state: continuing could corrupt user data, so this logs a
    /// diagnostic and terminates instead of returning an error.
    pub fn open(config: &Config) -> Self {
        match EpochShelf::open(config) {
            Ok(shelf) => Self {
                config: config.clone(),
                shelf: RwLock::new(Some(shelf)),
            },
            Err(e) => {
                Self::fatal(&config.epoch_shelf_path(), &e);
            }
        }
    }

    fn fatal(path: &Path, err: &NvHeapError) -> ! {
        error!(
            path = %path.display(),
            error = %err,
            "epoch shelf unusable; run EpochManager::start once before opening"
        );
        panic!("epoch shelf unusable at {}: {}", path.display(), err);
    }

    fn with_shelf<R>(&self, f: impl FnOnce(&EpochShelf) -> R) -> R {
        let guard = self.shelf.read();
        match guard.as_ref() {
            Some(shelf) => f(shelf),
            None => {
                error!("epoch manager used between reset_before_fork and reset_after_fork");
                panic!("epoch manager used between fork resets");
            }
        }
    }

    /// Publish that this thread is reading at an epoch ≥ the frontier
    /// observed now; blocks the horizon from passing that epoch until
    /// the matching [`EpochManager::exit_critical`]. Nestable.
    pub fn enter_critical(&self) {
        let (slot, depth) = ACTIVE_SLOT.with(|s| s.get());
        if depth > 0 {
            ACTIVE_SLOT.with(|s| s.set((slot, depth + 1)));
            return;
        }
        let claimed = self.with_shelf(|shelf| shelf.claim_slot());
        ACTIVE_SLOT.with(|s| s.set((claimed + 1, 1)));
    }

    /// Retract the publication made by the matching `enter_critical`.
    pub fn exit_critical(&self) {
        let (slot, depth) = ACTIVE_SLOT.with(|s| s.get());
        debug_assert!(depth > 0, "exit_critical without matching enter_critical");
        if depth == 0 {
            return;
        }
        if depth > 1 {
            ACTIVE_SLOT.with(|s| s.set((slot, depth - 1)));
            return;
        }
        self.with_shelf(|shelf| shelf.release_slot(slot - 1));
        ACTIVE_SLOT.with(|s| s.set((0, 0)));
    }

    /// The largest epoch `R` such that no thread anywhere is inside a
    /// critical section entered at an epoch ≤ R. Monotonically
    /// non-decreasing for every observer; calling it also drives epoch
    /// advancement.
    pub fn reported_epoch(&self) -> u64 {
        self.with_shelf(|shelf| shelf.refresh_reported())
    }

    /// The epoch new critical sections enter at. Always > the reported
    /// epoch.
    pub fn frontier_epoch(&self) -> u64 {
        self.with_shelf(|shelf| shelf.load(FRONTIER_CELL))
    }

    /// Racy hint: true only if at least one critical region was observed
    /// active at some instant during the call.
    pub fn exists_active_critical(&self) -> bool {
        self.with_shelf(|shelf| shelf.min_active().is_some())
    }

    /// Tear down the process-local mapping ahead of `fork()`. All
    /// threads using the manager must be quiesced first.
    pub fn reset_before_fork(&self) {
        *self.shelf.write() = None;
    }

    /// Rebuild the process-local mapping after `fork()`, in parent and
    /// child alike. Terminates (like [`EpochManager::open`]) if the
    /// epoch shelf has vanished meanwhile.
    pub fn reset_after_fork(&self) {
        let mut guard = self.shelf.write();
        match EpochShelf::open(&self.config) {
            Ok(shelf) => *guard = Some(shelf),
            Err(e) => Self::fatal(&self.config.epoch_shelf_path(), &e),
        }
    }
}

// =============================================================================
// Epoch lease (RAII)
// =============================================================================

/// RAII lease on an epoch-protected critical region.
///
/// Entering happens at construction, exiting on drop — on every exit
/// path. The lease pins the reported epoch observed at construction and
/// exposes nothing else; it can be neither copied nor cloned, so the
/// region ends exactly once.
pub struct EpochOp<'a> {
    manager: &'a EpochManager,
    reported: u64,
    /// The slot bookkeeping is thread-local: the lease must be released
    /// on the thread that acquired it.
    _not_send: std::marker::PhantomData<*const ()>,
}

impl<'a> EpochOp<'a> {
    /// Enter a critical region and pin the reported epoch.
    pub fn new(manager: &'a EpochManager) -> Self {
        manager.enter_critical();
        let reported = manager.reported_epoch();
        Self {
            manager,
            reported,
            _not_send: std::marker::PhantomData,
        }
    }

    /// The reported epoch pinned at construction.
    pub fn reported_epoch(&self) -> u64 {
        self.reported
    }
}

impl Drop for EpochOp<'_> {
    fn drop(&mut self) {
        self.manager.exit_critical();
    }
}
