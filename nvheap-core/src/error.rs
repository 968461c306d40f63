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

//! Error surface of the allocator.
//!
//! Errors are discriminated results, never unwinding control flow:
//!
//! - resource-found / not-found codes are recoverable at the caller
//! - `Heap*Failed` wrap an I/O or mapping failure; the underlying cause is
//!   logged at the failure site
//! - precondition violations (`AlreadyOpen`, `NotOpen`) are debug-asserted
//!   and reported as a distinct code in release builds
//! - `Corruption` covers persistent-state damage such as a magic mismatch
//!
//! Out-of-memory is deliberately absent: `alloc` signals exhaustion with
//! the null global pointer.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the NvHeap crates.
pub type Result<T> = std::result::Result<T, NvHeapError>;

/// All error codes surfaced by the allocator.
#[derive(Debug, Error)]
pub enum NvHeapError {
    /// The pool already exists.
    #[error("pool already exists")]
    PoolFound,

    /// The pool does not exist.
    #[error("pool not found")]
    PoolNotFound,

    /// Creating a heap failed; the underlying cause has been logged.
    #[error("heap create failed: {0}")]
    HeapCreateFailed(String),

    /// Opening a heap failed; the underlying cause has been logged.
    #[error("heap open failed: {0}")]
    HeapOpenFailed(String),

    /// Closing a heap failed; the underlying cause has been logged.
    #[error("heap close failed: {0}")]
    HeapCloseFailed(String),

    /// Destroying a heap failed; the underlying cause has been logged.
    #[error("heap destroy failed: {0}")]
    HeapDestroyFailed(String),

    /// The backing shelf file does not exist.
    #[error("shelf file not found: {}", .0.display())]
    ShelfFileNotFound(PathBuf),

    /// The backing shelf file already exists.
    #[error("shelf file already exists: {}", .0.display())]
    ShelfFileFound(PathBuf),

    /// A lookup by id found nothing.
    #[error("id not found")]
    IdNotFound,

    /// An id that must be fresh is already in use.
    #[error("id already in use")]
    IdFound,

    /// Operation requires the handle to be open.
    #[error("handle is not open")]
    NotOpen,

    /// Operation requires the handle to be closed.
    #[error("handle is already open")]
    AlreadyOpen,

    /// Persistent state failed validation (e.g. magic mismatch).
    #[error("persistent state corrupted: {0}")]
    Corruption(String),

    /// An underlying I/O operation failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
