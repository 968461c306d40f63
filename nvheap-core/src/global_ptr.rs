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

//! # Global Pointers
//!
//! A [`GlobalPtr`] is a 64-bit value that names a block of persistent
//! memory across processes and restarts:
//!
//! ```text
//! bit 63                48 47                                        0
//!     ┌───────┬─────────┬──────────────────────────────────────────┐
//!     │ pool  │ shelf   │                 offset                   │
//!     │ (8)   │ index(8)│                  (48)                    │
//!     └───────┴─────────┴──────────────────────────────────────────┘
//! ```
//!
//! The offset is a byte offset into the shelf's extent. An offset of zero
//! is the null pointer — no valid allocation ever starts at offset zero
//! because the shelf header occupies the first bytes of every heap.

use std::fmt;

/// Byte offset into a shelf.
pub type Offset = u64;

/// Identifier of a pool (a named group of shelves).
pub type PoolId = u8;

/// Index of a shelf within its pool.
pub type ShelfIndex = u8;

/// Number of bits reserved for the offset.
const OFFSET_BITS: u32 = 48;

/// Mask selecting the offset bits.
const OFFSET_MASK: u64 = (1u64 << OFFSET_BITS) - 1;

/// Identity of a single shelf: `(pool, index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ShelfId {
    pool_id: PoolId,
    shelf_idx: ShelfIndex,
}

impl ShelfId {
    /// Create a shelf id from its pool and index.
    pub fn new(pool_id: PoolId, shelf_idx: ShelfIndex) -> Self {
        Self { pool_id, shelf_idx }
    }

    /// The pool this shelf belongs to.
    #[inline]
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The shelf's slot within its pool.
    #[inline]
    pub fn shelf_idx(&self) -> ShelfIndex {
        self.shelf_idx
    }

    /// Pack into the 16-bit wire form used inside [`GlobalPtr`].
    #[inline]
    pub fn to_u16(self) -> u16 {
        ((self.pool_id as u16) << 8) | self.shelf_idx as u16
    }

    /// Unpack from the 16-bit wire form.
    #[inline]
    pub fn from_u16(raw: u16) -> Self {
        Self {
            pool_id: (raw >> 8) as PoolId,
            shelf_idx: (raw & 0xFF) as ShelfIndex,
        }
    }
}

impl fmt::Display for ShelfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}.{}]", self.pool_id, self.shelf_idx)
    }
}

/// A process- and restart-stable pointer: `(ShelfId, Offset)` in 64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct GlobalPtr(u64);

impl GlobalPtr {
    /// The null pointer (zero offset, zero shelf).
    pub const NULL: GlobalPtr = GlobalPtr(0);

    /// Combine a shelf id and a byte offset.
    ///
    /// Offsets must fit in 48 bits; shelves larger than 256 TiB are not
    /// representable.
    pub fn new(shelf_id: ShelfId, offset: Offset) -> Self {
        debug_assert!(offset <= OFFSET_MASK, "offset {} exceeds 48 bits", offset);
        Self(((shelf_id.to_u16() as u64) << OFFSET_BITS) | (offset & OFFSET_MASK))
    }

    /// The null pointer.
    #[inline]
    pub fn null() -> Self {
        Self::NULL
    }

    /// A pointer is null when its offset is zero, regardless of shelf.
    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset() == 0
    }

    /// The shelf this pointer refers into.
    #[inline]
    pub fn shelf_id(&self) -> ShelfId {
        ShelfId::from_u16((self.0 >> OFFSET_BITS) as u16)
    }

    /// The byte offset within the shelf.
    #[inline]
    pub fn offset(&self) -> Offset {
        self.0 & OFFSET_MASK
    }

    /// The raw 64-bit representation (stable across processes).
    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    /// Rebuild a pointer from its raw representation.
    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for GlobalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "(null)")
        } else {
            write!(f, "{}+{:#x}", self.shelf_id(), self.offset())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        let id = ShelfId::new(3, 7);
        let ptr = GlobalPtr::new(id, 0x1234_5678_9ABC);
        assert_eq!(ptr.shelf_id(), id);
        assert_eq!(ptr.offset(), 0x1234_5678_9ABC);
        assert_eq!(GlobalPtr::from_raw(ptr.to_raw()), ptr);
    }

    #[test]
    fn null_is_zero_offset() {
        assert!(GlobalPtr::null().is_null());
        assert!(GlobalPtr::default().is_null());
        // A zero offset is null even with a non-zero shelf id.
        assert!(GlobalPtr::new(ShelfId::new(1, 1), 0).is_null());
        assert!(!GlobalPtr::new(ShelfId::new(0, 0), 192).is_null());
    }

    #[test]
    fn shelf_id_wire_form() {
        let id = ShelfId::new(0xAB, 0xCD);
        assert_eq!(id.to_u16(), 0xABCD);
        assert_eq!(ShelfId::from_u16(0xABCD), id);
    }

    #[test]
    fn max_offset_survives() {
        let max = (1u64 << 48) - 1;
        let ptr = GlobalPtr::new(ShelfId::new(255, 255), max);
        assert_eq!(ptr.offset(), max);
        assert_eq!(ptr.shelf_id(), ShelfId::new(255, 255));
    }

    #[test]
    fn display_forms() {
        assert_eq!(GlobalPtr::null().to_string(), "(null)");
        let ptr = GlobalPtr::new(ShelfId::new(1, 2), 0xC0);
        assert_eq!(ptr.to_string(), "[1.2]+0xc0");
    }
}
