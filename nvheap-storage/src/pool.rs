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

//! Pools: named groups of shelves.
//!
//! A pool is identified by its [`PoolId`] and remembered on disk by a
//! small marker file recording the pool's shelf size. Shelves are added
//! to a pool by index through a formatter callback, which creates and
//! initializes the shelf file in whatever layout the caller needs (a
//! plain region, a shelf heap, ...).

use std::path::PathBuf;

use tracing::trace;

use nvheap_core::{Config, NvHeapError, PoolId, Result, ShelfId, ShelfIndex};

/// A named group of shelves sharing one configured size.
#[derive(Debug)]
pub struct Pool {
    pool_id: PoolId,
    config: Config,
    shelf_size: u64,
    is_open: bool,
}

impl Pool {
    /// Handle for the pool `pool_id` under `config`.
    pub fn new(pool_id: PoolId, config: Config) -> Self {
        Self {
            pool_id,
            config,
            shelf_size: 0,
            is_open: false,
        }
    }

    /// The pool's identifier.
    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Whether the pool's marker file exists.
    pub fn exists(&self) -> bool {
        self.marker_path().exists()
    }

    /// Whether the handle is open.
    pub fn is_open(&self) -> bool {
        self.is_open
    }

    /// The shelf size recorded at creation. Valid while open.
    pub fn size(&self) -> u64 {
        self.shelf_size
    }

    fn marker_path(&self) -> PathBuf {
        self.config.pool_marker_path(self.pool_id)
    }

    /// Path of the shelf at `idx` within this pool.
    pub fn shelf_path(&self, idx: ShelfIndex) -> PathBuf {
        self.config.shelf_path(ShelfId::new(self.pool_id, idx))
    }

    /// Create the pool with the given per-shelf size.
    pub fn create(&mut self, shelf_size: u64) -> Result<()> {
        debug_assert!(!self.is_open);
        if self.exists() {
            return Err(NvHeapError::PoolFound);
        }
        std::fs::create_dir_all(&self.config.base_dir)?;
        std::fs::write(self.marker_path(), shelf_size.to_le_bytes())?;
        trace!(pool = self.pool_id, shelf_size, "pool created");
        Ok(())
    }

    /// Remove the pool's marker. Shelves must have been removed first.
    pub fn destroy(&mut self) -> Result<()> {
        debug_assert!(!self.is_open);
        if !self.exists() {
            return Err(NvHeapError::PoolNotFound);
        }
        std::fs::remove_file(self.marker_path())?;
        trace!(pool = self.pool_id, "pool destroyed");
        Ok(())
    }

    /// Open the pool, loading its recorded shelf size.
    pub fn open(&mut self) -> Result<()> {
        debug_assert!(!self.is_open);
        if self.is_open {
            return Err(NvHeapError::AlreadyOpen);
        }
        let bytes = std::fs::read(self.marker_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                NvHeapError::PoolNotFound
            } else {
                NvHeapError::Io(e)
            }
        })?;
        if bytes.len() != 8 {
            return Err(NvHeapError::Corruption(format!(
                "pool {} marker has {} bytes, expected 8",
                self.pool_id,
                bytes.len()
            )));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        self.shelf_size = u64::from_le_bytes(raw);
        self.is_open = true;
        Ok(())
    }

    /// Close the handle.
    pub fn close(&mut self) -> Result<()> {
        debug_assert!(self.is_open);
        if !self.is_open {
            return Err(NvHeapError::NotOpen);
        }
        self.is_open = false;
        Ok(())
    }

    /// Add the shelf at `idx`, initializing it through `format`.
    ///
    /// The formatter receives the shelf's path and the pool's shelf size
    /// and is responsible for creating the file in its final layout. The
    /// slot must be vacant.
    pub fn add_shelf<F>(&mut self, idx: ShelfIndex, format: F) -> Result<()>
    where
        F: FnOnce(&PathBuf, u64) -> Result<()>,
    {
        debug_assert!(self.is_open);
        if !self.is_open {
            return Err(NvHeapError::NotOpen);
        }
        let path = self.shelf_path(idx);
        if path.exists() {
            return Err(NvHeapError::IdFound);
        }
        format(&path, self.shelf_size)?;
        trace!(pool = self.pool_id, shelf = idx, "shelf added");
        Ok(())
    }

    /// Remove the shelf at `idx`.
    pub fn remove_shelf(&mut self, idx: ShelfIndex) -> Result<()> {
        debug_assert!(self.is_open);
        if !self.is_open {
            return Err(NvHeapError::NotOpen);
        }
        let path = self.shelf_path(idx);
        if !path.exists() {
            return Err(NvHeapError::IdNotFound);
        }
        std::fs::remove_file(&path)?;
        trace!(pool = self.pool_id, shelf = idx, "shelf removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shelf_file::ShelfFile;
    use tempfile::tempdir;

    fn config(dir: &std::path::Path) -> Config {
        Config {
            base_dir: dir.to_path_buf(),
            user: "test".to_string(),
        }
    }

    #[test]
    fn create_twice_is_pool_found() {
        let dir = tempdir().unwrap();
        let mut pool = Pool::new(1, config(dir.path()));
        pool.create(1024).unwrap();
        assert!(matches!(
            pool.create(1024).unwrap_err(),
            NvHeapError::PoolFound
        ));
    }

    #[test]
    fn destroy_missing_is_pool_not_found() {
        let dir = tempdir().unwrap();
        let mut pool = Pool::new(1, config(dir.path()));
        assert!(matches!(
            pool.destroy().unwrap_err(),
            NvHeapError::PoolNotFound
        ));
    }

    #[test]
    fn open_recovers_shelf_size() {
        let dir = tempdir().unwrap();
        let mut pool = Pool::new(2, config(dir.path()));
        pool.create(1 << 20).unwrap();

        let mut reopened = Pool::new(2, config(dir.path()));
        reopened.open().unwrap();
        assert_eq!(reopened.size(), 1 << 20);
        reopened.close().unwrap();
    }

    #[test]
    fn add_and_remove_shelves() {
        let dir = tempdir().unwrap();
        let mut pool = Pool::new(3, config(dir.path()));
        pool.create(4096).unwrap();
        pool.open().unwrap();

        pool.add_shelf(0, |path, size| {
            ShelfFile::new(path).create(size)?;
            Ok(())
        })
        .unwrap();
        assert!(pool.shelf_path(0).exists());

        // Occupied slot is rejected.
        let err = pool.add_shelf(0, |_, _| Ok(())).unwrap_err();
        assert!(matches!(err, NvHeapError::IdFound));

        pool.remove_shelf(0).unwrap();
        assert!(!pool.shelf_path(0).exists());
        assert!(matches!(
            pool.remove_shelf(0).unwrap_err(),
            NvHeapError::IdNotFound
        ));

        pool.close().unwrap();
        pool.destroy().unwrap();
    }

    #[test]
    fn formatter_failure_leaves_slot_vacant() {
        let dir = tempdir().unwrap();
        let mut pool = Pool::new(4, config(dir.path()));
        pool.create(4096).unwrap();
        pool.open().unwrap();

        let err = pool
            .add_shelf(1, |_, _| Err(NvHeapError::HeapCreateFailed("formatter".into())))
            .unwrap_err();
        assert!(matches!(err, NvHeapError::HeapCreateFailed(_)));
        assert!(!pool.shelf_path(1).exists());
        pool.close().unwrap();
    }
}
