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

//! Shelf files: the file-backed extents everything else is built on.
//!
//! A [`ShelfFile`] wraps one file in the shared memory area and the usual
//! lifecycle around it — exclusive create, truncate, open/close, destroy —
//! plus [`ShelfFile::map`], which hands out a [`ShelfMapping`]: an owned
//! `MAP_SHARED` read-write mapping with raw-pointer access for the atomic
//! accessors in [`crate::pmem`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapOptions;

use nvheap_core::{NvHeapError, Result, ShelfId};

/// One file-backed extent in the shared memory area.
#[derive(Debug)]
pub struct ShelfFile {
    path: PathBuf,
    shelf_id: Option<ShelfId>,
    file: Option<File>,
}

impl ShelfFile {
    /// Handle to a shelf file at `path`. No filesystem access happens yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shelf_id: None,
            file: None,
        }
    }

    /// Handle carrying the shelf's identity (used in diagnostics).
    pub fn with_id(path: impl Into<PathBuf>, shelf_id: ShelfId) -> Self {
        Self {
            path: path.into(),
            shelf_id: Some(shelf_id),
            file: None,
        }
    }

    /// The path this handle refers to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The shelf identity, if one was attached.
    pub fn shelf_id(&self) -> Option<ShelfId> {
        self.shelf_id
    }

    /// Whether the backing file currently exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Whether this handle holds an open file descriptor.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Create the backing file with the given length.
    ///
    /// Creation is exclusive: an existing file yields
    /// [`NvHeapError::ShelfFileFound`]. The handle is left closed.
    pub fn create(&mut self, size: u64) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    NvHeapError::ShelfFileFound(self.path.clone())
                } else {
                    NvHeapError::Io(e)
                }
            })?;
        if size > 0 {
            file.set_len(size)?;
        }
        Ok(())
    }

    /// Remove the backing file. Fails when the handle is open or the file
    /// never existed.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        if !self.exists() {
            return Err(NvHeapError::ShelfFileNotFound(self.path.clone()));
        }
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Open the backing file read-write.
    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open());
        if self.is_open() {
            return Err(NvHeapError::AlreadyOpen);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    NvHeapError::ShelfFileNotFound(self.path.clone())
                } else {
                    NvHeapError::Io(e)
                }
            })?;
        self.file = Some(file);
        Ok(())
    }

    /// Drop the file descriptor. Mappings taken from it stay valid.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Current length of the backing file.
    pub fn size(&self) -> Result<u64> {
        match &self.file {
            Some(file) => Ok(file.metadata()?.len()),
            None => {
                let meta = std::fs::metadata(&self.path).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        NvHeapError::ShelfFileNotFound(self.path.clone())
                    } else {
                        NvHeapError::Io(e)
                    }
                })?;
                Ok(meta.len())
            }
        }
    }

    /// Grow or shrink the backing file. Requires an open handle.
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        match &self.file {
            Some(file) => {
                file.set_len(len)?;
                Ok(())
            }
            None => Err(NvHeapError::NotOpen),
        }
    }

    /// Map `len` bytes at `offset` of the open file, `MAP_SHARED`
    /// read-write. `len == 0` maps from `offset` to the end of the file.
    pub fn map(&self, len: usize, offset: u64) -> Result<ShelfMapping> {
        let file = self.file.as_ref().ok_or(NvHeapError::NotOpen)?;
        let mut opts = MmapOptions::new();
        opts.offset(offset);
        if len > 0 {
            opts.len(len);
        }
        // SAFETY: the mapping is file-backed and shared by design; all
        // concurrently mutated words inside it are accessed through the
        // atomic helpers in crate::pmem.
        let mmap = unsafe { opts.map_mut(file)? };
        Ok(ShelfMapping::new(mmap))
    }
}

/// An owned `MAP_SHARED` read-write mapping of (part of) a shelf file.
///
/// The raw base pointer is captured at construction so shared readers can
/// reach the mapping without exclusive access; the mapping is unmapped
/// when the value is dropped.
#[derive(Debug)]
pub struct ShelfMapping {
    mmap: memmap2::MmapMut,
    base: *mut u8,
    len: usize,
}

// SAFETY: the mapping is shared between processes by construction; every
// concurrently mutated word inside it is reached through SeqCst atomics
// (crate::pmem). Moving or sharing the owning handle across threads does
// not change what the pages contain.
unsafe impl Send for ShelfMapping {}
unsafe impl Sync for ShelfMapping {}

impl ShelfMapping {
    fn new(mut mmap: memmap2::MmapMut) -> Self {
        let base = mmap.as_mut_ptr();
        let len = mmap.len();
        Self { mmap, base, len }
    }

    /// Base address of the mapping in this process.
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// Length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the mapping is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `addr` lies inside this mapping.
    #[inline]
    pub fn contains(&self, addr: *const u8) -> bool {
        let addr = addr as usize;
        let base = self.base as usize;
        addr >= base && addr < base + self.len
    }

    /// Flush the whole mapping to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_is_exclusive() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shelf");
        let mut shelf = ShelfFile::new(&path);

        shelf.create(4096).unwrap();
        assert!(shelf.exists());
        assert_eq!(shelf.size().unwrap(), 4096);

        let err = ShelfFile::new(&path).create(4096).unwrap_err();
        assert!(matches!(err, NvHeapError::ShelfFileFound(_)));
    }

    #[test]
    fn open_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let mut shelf = ShelfFile::new(dir.path().join("missing"));
        let err = shelf.open().unwrap_err();
        assert!(matches!(err, NvHeapError::ShelfFileNotFound(_)));
    }

    #[test]
    fn destroy_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let mut shelf = ShelfFile::new(dir.path().join("missing"));
        let err = shelf.destroy().unwrap_err();
        assert!(matches!(err, NvHeapError::ShelfFileNotFound(_)));
    }

    #[test]
    fn mapping_is_shared_between_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shelf");

        let mut a = ShelfFile::new(&path);
        a.create(4096).unwrap();
        a.open().unwrap();
        let map_a = a.map(0, 0).unwrap();

        let mut b = ShelfFile::new(&path);
        b.open().unwrap();
        let map_b = b.map(0, 0).unwrap();

        // A store through one mapping is visible through the other.
        unsafe {
            crate::pmem::store_u64(map_a.base(), 0xDEAD_BEEF);
            assert_eq!(crate::pmem::load_u64(map_b.base()), 0xDEAD_BEEF);
        }
    }

    #[test]
    fn mapping_survives_handle_close() {
        let dir = tempdir().unwrap();
        let mut shelf = ShelfFile::new(dir.path().join("shelf"));
        shelf.create(4096).unwrap();
        shelf.open().unwrap();
        let mapping = shelf.map(0, 0).unwrap();
        shelf.close();

        unsafe {
            crate::pmem::store_u64(mapping.base(), 7);
            assert_eq!(crate::pmem::load_u64(mapping.base()), 7);
        }
        assert!(mapping.contains(mapping.base()));
        assert_eq!(mapping.len(), 4096);
    }
}
