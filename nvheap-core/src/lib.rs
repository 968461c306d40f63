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

//! # NvHeap Core
//!
//! Shared vocabulary for the NvHeap allocator crates:
//!
//! - [`NvHeapError`] / [`Result`] — the discriminated error surface. Out of
//!   heap memory is *not* an error; it is the null [`GlobalPtr`].
//! - [`GlobalPtr`] — a 64-bit process- and restart-stable pointer combining
//!   a shelf identity with a byte offset into that shelf.
//! - [`Config`] — base directory and user tag from which every shelf path
//!   is derived.

pub mod config;
pub mod error;
pub mod global_ptr;

pub use config::Config;
pub use error::{NvHeapError, Result};
pub use global_ptr::{GlobalPtr, Offset, PoolId, ShelfId, ShelfIndex};
