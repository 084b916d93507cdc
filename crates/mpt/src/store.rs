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

//! Shared node fetch/cache path used by the update engine, the compactor,
//! traversal, and find: decoding, read-through caching, and the weak
//! parent->child pointer derivation described in §4.5.

use std::sync::Arc;

use triedb_pool::offset::{PhysicalOffset, VirtualOffset};
use triedb_pool::StoragePool;

use crate::cache::NodeCache;
use crate::codec::Node;
use crate::error::{TrieError, TrieResult};

pub struct NodeStore {
    pub pool: Arc<StoragePool>,
    pub cache: Arc<NodeCache>,
}

impl NodeStore {
    pub fn new(pool: Arc<StoragePool>, cache: Arc<NodeCache>) -> Self {
        NodeStore { pool, cache }
    }

    /// Derives the virtual offset a parent implicitly trusts for a child
    /// pointer: the child's physical chunk's *current* insertion count
    /// combined with its intra-chunk byte offset. A chunk whose insertion
    /// count has since changed (because compaction relisted it) yields a
    /// different virtual offset than whatever was cached under the old
    /// generation, so a stale cache entry is never handed back as a hit.
    pub fn virtual_offset_of(&self, offset: PhysicalOffset) -> VirtualOffset {
        let insertion_count = self.pool.front.chunks[offset.chunk_id() as usize].insertion_count();
        VirtualOffset::new(insertion_count, offset.byte_offset() as u32)
    }

    /// Fetches a node, trying the cache first under its derived virtual
    /// offset, falling back to a synchronous pool read on miss. Every read
    /// populates the cache (read-through); write-path cache admission is a
    /// separate, policy-gated decision made by the update engine.
    pub fn load(&self, offset: PhysicalOffset) -> TrieResult<Arc<Node>> {
        let vo = self.virtual_offset_of(offset);
        if let Some(hit) = self.cache.find(vo) {
            return Ok(hit);
        }
        let bytes = self
            .pool
            .read_node_bytes(offset)
            .map_err(TrieError::Pool)?;
        let node = Node::decode(&bytes).map_err(|e| TrieError::Corrupt(offset, e.to_string()))?;
        Ok(self.cache.insert(vo, node))
    }
}
