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

//! Configuration of the shared memory area.
//!
//! All shelf files live flat in one base directory, prefixed by a user
//! tag so several users can share a tmpfs mount without collisions:
//!
//! ```text
//! {base_dir}/{user}_NVHEAP_EPOCH          the epoch shelf
//! {base_dir}/{user}_NVHEAP_{pool}_POOL    pool marker
//! {base_dir}/{user}_NVHEAP_{pool}_{idx}   one shelf of a pool
//! ```

use std::env;
use std::path::PathBuf;

use crate::global_ptr::{PoolId, ShelfId};

/// Environment variable overriding the default base directory.
pub const BASE_DIR_ENV: &str = "NVHEAP_BASE_DIR";

/// Default base directory: tmpfs, the closest widely-available stand-in
/// for an NVM-backed filesystem.
pub const DEFAULT_BASE_DIR: &str = "/dev/shm/nvheap";

/// Location and naming of every shelf file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding all shelf files. Must be on a filesystem whose
    /// pages can be mapped `MAP_SHARED` by every participating process.
    pub base_dir: PathBuf,
    /// User tag prefixed to every file name.
    pub user: String,
}

impl Default for Config {
    fn default() -> Self {
        let base_dir = env::var_os(BASE_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BASE_DIR));
        let user = env::var("USER").unwrap_or_else(|_| "nvheap".to_string());
        Self { base_dir, user }
    }
}

impl Config {
    /// Configuration rooted at an explicit directory.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Path of the process-shared epoch shelf.
    pub fn epoch_shelf_path(&self) -> PathBuf {
        self.base_dir.join(format!("{}_NVHEAP_EPOCH", self.user))
    }

    /// Path of the marker file recording a pool's existence and size.
    pub fn pool_marker_path(&self, pool_id: PoolId) -> PathBuf {
        self.base_dir
            .join(format!("{}_NVHEAP_{}_POOL", self.user, pool_id))
    }

    /// Path of a single shelf.
    pub fn shelf_path(&self, shelf_id: ShelfId) -> PathBuf {
        self.base_dir.join(format!(
            "{}_NVHEAP_{}_{}",
            self.user,
            shelf_id.pool_id(),
            shelf_id.shelf_idx()
        ))
    }
}
