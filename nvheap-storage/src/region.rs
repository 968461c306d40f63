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

//! Persistent regions: named, fixed-length byte extents with no internal
//! structure. The client writes its own header at offset zero.
//!
//! A [`ShelfRegion`] may be mapped into any number of processes at once;
//! identical addresses across processes are *not* guaranteed, which is why
//! everything above this layer works in offsets rather than raw pointers.
//! Cross-process-coherent access to words inside the mapping goes through
//! [`crate::pmem`]; the region itself only manages the extent's lifecycle
//! and mapping.

use std::path::Path;

use nvheap_core::{NvHeapError, Result};

use crate::shelf_file::{ShelfFile, ShelfMapping};

/// A mappable file-backed extent.
#[derive(Debug)]
pub struct ShelfRegion {
    file: ShelfFile,
    mapping: Option<ShelfMapping>,
}

impl ShelfRegion {
    /// Handle to the region backed by `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            file: ShelfFile::new(path.as_ref()),
            mapping: None,
        }
    }

    /// Whether the backing file exists.
    pub fn exists(&self) -> bool {
        self.file.exists()
    }

    /// Whether the region holds an open file descriptor.
    pub fn is_open(&self) -> bool {
        self.file.is_open()
    }

    /// Whether the region is currently mapped.
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Create the backing extent with the given length.
    pub fn create(&mut self, size: u64) -> Result<()> {
        self.file.create(size)
    }

    /// Remove the backing extent.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_mapped());
        if self.is_mapped() {
            return Err(NvHeapError::AlreadyOpen);
        }
        self.file.destroy()
    }

    /// Open the region for mapping.
    pub fn open(&mut self) -> Result<()> {
        self.file.open()
    }

    /// Unmap (if mapped) and close.
    pub fn close(&mut self) -> Result<()> {
        self.unmap();
        self.file.close();
        Ok(())
    }

    /// Length of the backing extent.
    pub fn size(&self) -> Result<u64> {
        self.file.size()
    }

    /// Map `len` bytes at `offset` (`len == 0` maps to the end of the
    /// extent), `MAP_SHARED` read-write, and return the base address.
    ///
    /// The mapping stays owned by the region and is released by
    /// [`ShelfRegion::unmap`] or [`ShelfRegion::close`].
    pub fn map(&mut self, len: usize, offset: u64) -> Result<*mut u8> {
        debug_assert!(!self.is_mapped());
        if self.is_mapped() {
            return Err(NvHeapError::AlreadyOpen);
        }
        let mapping = self.file.map(len, offset)?;
        let base = mapping.base();
        self.mapping = Some(mapping);
        Ok(base)
    }

    /// Release the current mapping, if any.
    pub fn unmap(&mut self) {
        self.mapping = None;
    }

    /// Base address of the current mapping.
    pub fn base(&self) -> Result<*mut u8> {
        self.mapping
            .as_ref()
            .map(|m| m.base())
            .ok_or(NvHeapError::NotOpen)
    }

    /// Length of the current mapping.
    pub fn mapped_len(&self) -> Result<usize> {
        self.mapping
            .as_ref()
            .map(|m| m.len())
            .ok_or(NvHeapError::NotOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn lifecycle_create_open_map_close_destroy() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");
        let mut region = ShelfRegion::new(&path);

        assert!(!region.exists());
        region.create(8192).unwrap();
        assert!(region.exists());
        assert_eq!(region.size().unwrap(), 8192);

        region.open().unwrap();
        let base = region.map(0, 0).unwrap();
        assert!(!base.is_null());
        assert_eq!(region.mapped_len().unwrap(), 8192);

        region.close().unwrap();
        assert!(!region.is_mapped());
        region.destroy().unwrap();
        assert!(!region.exists());
    }

    #[test]
    fn two_handles_share_the_extent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region");

        let mut writer = ShelfRegion::new(&path);
        writer.create(4096).unwrap();
        writer.open().unwrap();
        let wbase = writer.map(0, 0).unwrap();

        let mut reader = ShelfRegion::new(&path);
        reader.open().unwrap();
        let rbase = reader.map(0, 0).unwrap();

        unsafe {
            crate::pmem::store_u64(wbase, 42);
            assert_eq!(crate::pmem::load_u64(rbase), 42);
        }

        writer.close().unwrap();
        reader.close().unwrap();
    }

    #[test]
    fn map_requires_open() {
        let dir = tempdir().unwrap();
        let mut region = ShelfRegion::new(dir.path().join("region"));
        region.create(4096).unwrap();
        let err = region.map(0, 0).unwrap_err();
        assert!(matches!(err, NvHeapError::NotOpen));
    }
}
