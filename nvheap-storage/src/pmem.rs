// SPDX-License-Identifier: AGPL-3.0-or-later
// NvHeap - Persistent Multi-Process Heap over Shared NVM
// Copyright (C) 2026 Sushanth Reddy Vanagala (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! # Persistent Atomic Primitives
//!
//! Every field shared across processes through a mapping — the heap's
//! `next_free` cursor, the per-epoch stack heads, the epoch counters and
//! participant slots — is read and written *only* through the helpers in
//! this module. Plain loads and stores of those fields are never assumed
//! coherent; a SeqCst atomic op on the mapped word is the single
//! synchronization primitive the design relies on.
//!
//! [`persist`] marks an ordering point for crash consistency: it forces
//! the given byte range of a shared mapping to stable storage before the
//! caller proceeds (create and destroy use it to order the magic sentinel
//! after the rest of the header). On tmpfs the call is cheap; on a
//! DAX-mapped device it degrades to a full `msync`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic 64-bit load from a shared mapping.
///
/// # Safety
///
/// `addr` must be 8-byte aligned and point into a live `MAP_SHARED`
/// mapping for the duration of the call.
#[inline]
pub unsafe fn load_u64(addr: *const u8) -> u64 {
    (*(addr as *const AtomicU64)).load(Ordering::SeqCst)
}

/// Atomic 64-bit store to a shared mapping.
///
/// # Safety
///
/// Same contract as [`load_u64`].
#[inline]
pub unsafe fn store_u64(addr: *mut u8, value: u64) {
    (*(addr as *const AtomicU64)).store(value, Ordering::SeqCst)
}

/// Atomic 64-bit compare-and-swap on a shared mapping.
///
/// Returns `Ok(previous)` when the swap happened, `Err(actual)` when the
/// current value did not match `expected`.
///
/// # Safety
///
/// Same contract as [`load_u64`].
#[inline]
pub unsafe fn cas_u64(addr: *mut u8, expected: u64, desired: u64) -> Result<u64, u64> {
    (*(addr as *const AtomicU64)).compare_exchange(
        expected,
        desired,
        Ordering::SeqCst,
        Ordering::SeqCst,
    )
}

/// Force `[addr, addr + len)` of a shared mapping to stable storage.
///
/// The range is widened to page boundaries as `msync` requires. Failure
/// is logged, not surfaced: the callers that need persist points (create,
/// destroy, bootstrap) treat the mapping itself as the source of truth
/// and a failed sync only weakens crash ordering, which the magic-last
/// protocol already tolerates by failing verification.
pub fn persist(addr: *const u8, len: usize) {
    const PAGE: usize = 4096;

    let start = (addr as usize) & !(PAGE - 1);
    let end = (addr as usize).saturating_add(len);
    let span = end.saturating_sub(start);
    let span = (span + PAGE - 1) & !(PAGE - 1);

    // SAFETY: msync on an address range is harmless even if parts of the
    // widened range are unmapped; the kernel rejects it with an error,
    // which we log and ignore.
    let rc = unsafe { libc::msync(start as *mut libc::c_void, span, libc::MS_SYNC) };
    if rc != 0 {
        tracing::warn!(
            errno = std::io::Error::last_os_error().raw_os_error(),
            addr = start,
            len = span,
            "msync failed; persist ordering not guaranteed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(8))]
    struct Word(u64);

    #[test]
    fn load_store_round_trip() {
        let mut word = Word(0);
        let addr = &mut word.0 as *mut u64 as *mut u8;
        unsafe {
            store_u64(addr, 684_327);
            assert_eq!(load_u64(addr), 684_327);
        }
    }

    #[test]
    fn cas_reports_actual_on_mismatch() {
        let mut word = Word(10);
        let addr = &mut word.0 as *mut u64 as *mut u8;
        unsafe {
            assert_eq!(cas_u64(addr, 10, 20), Ok(10));
            assert_eq!(cas_u64(addr, 10, 30), Err(20));
            assert_eq!(load_u64(addr), 20);
        }
    }
}
