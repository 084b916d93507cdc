// Copyright 2026 The TrieDB Authors.
// This file is part of triedb.

// triedb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// triedb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with triedb.  If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

/// Whether opening a device wipes its prior contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    OpenExisting,
    Truncate,
}

/// Startup configuration for [`crate::StoragePool`]. Mirrors §4.1's
/// enumerated option list.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub device_paths: Vec<PathBuf>,
    pub mode: PoolMode,
    /// Power-of-two byte size, fixed at pool creation and persisted in the
    /// device footer.
    pub chunk_capacity: u64,
    pub open_read_only: bool,
    pub open_read_only_allow_dirty: bool,
    /// Round-robin chunk placement across devices in proportion to each
    /// device's share, using the continuous-ratio algorithm from §4.1.
    pub interleave_chunks_evenly: bool,
    /// Diagnostic override: skip the config-hash cross-device check.
    pub disable_mismatching_storage_pool_check: bool,
}

impl PoolConfig {
    pub fn new(device_paths: Vec<PathBuf>, chunk_capacity: u64) -> Self {
        PoolConfig {
            device_paths,
            mode: PoolMode::OpenExisting,
            chunk_capacity,
            open_read_only: false,
            open_read_only_allow_dirty: false,
            interleave_chunks_evenly: true,
            disable_mismatching_storage_pool_check: false,
        }
    }

    pub fn truncate(mut self) -> Self {
        self.mode = PoolMode::Truncate;
        self
    }

    pub fn read_only(mut self, allow_dirty: bool) -> Self {
        self.open_read_only = true;
        self.open_read_only_allow_dirty = allow_dirty;
        self
    }

    pub fn validate(&self) -> crate::error::PoolResult<()> {
        if !self.chunk_capacity.is_power_of_two() {
            return Err(crate::error::PoolError::ChunkCapacityNotPowerOfTwo(
                self.chunk_capacity,
            ));
        }
        Ok(())
    }
}
