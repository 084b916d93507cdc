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

//! Startup configuration (§6), built with the same chained-`with_*`
//! pattern as [`triedb_pool::config::PoolConfig`].

use std::path::PathBuf;

use triedb_mpt::EngineConfig;
use triedb_pool::config::PoolConfig;

/// Enumerated startup options for a [`crate::Trie`]. Device layout and
/// read/write buffer sizing are forwarded straight to the pool and (once a
/// caller wires up its own [`triedb_io::Executor`]) the I/O executor;
/// `engine` carries the update-engine tunables from §4.6/§4.7 that aren't
/// part of this enumerated list but still need a single place to live.
#[derive(Debug, Clone)]
pub struct Config {
    pub device_paths: Vec<PathBuf>,
    /// `chunk_capacity = 1 << chunk_capacity_bits`, fixed at pool creation.
    pub chunk_capacity_bits: u32,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_ring_entries: u32,
    pub write_ring_entries: u32,
    pub read_buffers: usize,
    pub write_buffers: usize,
    pub concurrent_read_io_limit: usize,
    pub node_cache_bytes: usize,
    pub version_history_window: u64,
    pub eager_completions: bool,
    pub capture_io_latencies: bool,
    truncate: bool,
    pub engine: EngineConfig,
}

impl Config {
    pub fn new(device_paths: Vec<PathBuf>, chunk_capacity_bits: u32) -> Self {
        Config {
            device_paths,
            chunk_capacity_bits,
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_ring_entries: 256,
            write_ring_entries: 256,
            read_buffers: 128,
            write_buffers: 64,
            concurrent_read_io_limit: 64,
            node_cache_bytes: 64 << 20,
            version_history_window: 64,
            eager_completions: true,
            capture_io_latencies: false,
            truncate: false,
            engine: EngineConfig::default(),
        }
    }

    /// Wipes prior device contents on open instead of recovering them.
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    pub fn with_node_cache_bytes(mut self, bytes: usize) -> Self {
        self.node_cache_bytes = bytes;
        self
    }

    pub fn with_version_history_window(mut self, window: u64) -> Self {
        self.version_history_window = window;
        self
    }

    pub fn with_eager_completions(mut self, on: bool) -> Self {
        self.eager_completions = on;
        self
    }

    pub fn with_capture_io_latencies(mut self, on: bool) -> Self {
        self.capture_io_latencies = on;
        self
    }

    pub fn with_engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    pub(crate) fn pool_config(&self) -> PoolConfig {
        let chunk_capacity = 1u64 << self.chunk_capacity_bits;
        let mut config = PoolConfig::new(self.device_paths.clone(), chunk_capacity);
        if self.truncate {
            config = config.truncate();
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_config_derives_chunk_capacity_from_bits() {
        let config = Config::new(vec!["/tmp/does-not-matter".into()], 12);
        assert_eq!(config.pool_config().chunk_capacity, 4096);
    }

    #[test]
    fn truncate_propagates_to_pool_mode() {
        let config = Config::new(vec!["/tmp/does-not-matter".into()], 12).truncate();
        assert_eq!(config.pool_config().mode, triedb_pool::config::PoolMode::Truncate);
    }
}
