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

//! # NvHeap Storage
//!
//! A persistent, multi-process heap allocator over shared non-volatile
//! memory. Processes mapping the same backing files observe one shared
//! address space of fixed-size *shelves* and exchange [`GlobalPtr`]s that
//! stay meaningful across processes and restarts.
//!
//! The crate is built from four cooperating components, leaves first:
//!
//! - [`ShelfRegion`] — a named, fixed-length byte extent backed by a file,
//!   mappable `MAP_SHARED` into any number of processes.
//! - [`ShelfHeap`] — a bump-pointer allocator laid over one shelf, with
//!   offset-based, lock-free, crash-recoverable metadata.
//! - [`EpochManager`] — coordinates global epoch advancement across all
//!   threads and processes sharing one epoch shelf.
//! - [`EpochZoneHeap`] — composes a shelf heap with a deferred-free
//!   metadata region and the epoch manager; its background cleaner
//!   recycles freed blocks only once no reader can still hold them.
//!
//! ```no_run
//! use std::sync::Arc;
//! use nvheap_core::Config;
//! use nvheap_storage::{EpochManager, EpochOp, EpochZoneHeap};
//!
//! # fn main() -> nvheap_core::Result<()> {
//! let config = Config::default();
//! EpochManager::start(&config)?;
//! let epoch = Arc::new(EpochManager::open(&config));
//!
//! let mut heap = EpochZoneHeap::new(1, config, Arc::clone(&epoch));
//! heap.create(64 * 1024 * 1024)?;
//! heap.open()?;
//!
//! let op = EpochOp::new(&epoch);
//! let ptr = heap.alloc_protected(&op, 4096);
//! assert!(!ptr.is_null());
//! heap.free_protected(&op, ptr);
//! drop(op);
//!
//! heap.close()?;
//! heap.destroy()?;
//! # Ok(())
//! # }
//! ```

pub mod entry_stack;
pub mod epoch;
pub mod pmem;
pub mod pool;
pub mod region;
pub mod shelf_file;
pub mod shelf_heap;
pub mod zone_heap;

pub use entry_stack::EntryStack;
pub use epoch::{EpochManager, EpochOp};
pub use pool::Pool;
pub use region::ShelfRegion;
pub use shelf_file::{ShelfFile, ShelfMapping};
pub use shelf_heap::{ShelfHeap, CACHELINE, HEADER_SIZE, MIN_ALLOC_SIZE};
pub use zone_heap::EpochZoneHeap;

#[doc(inline)]
pub use nvheap_core::{Config, GlobalPtr, NvHeapError, Offset, Result, ShelfId};
