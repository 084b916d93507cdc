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

//! The compactor (C8, §4.7): sweeps every still-live version's reachable
//! nodes forward out of the chunks nearest retirement, then returns those
//! chunks to the free list.
//!
//! A node is "reachable" from more than one live root whenever an upsert
//! touched only part of the trie; the sweep shares relocation work across
//! roots with a per-run memo table keyed by the node's prior physical
//! offset, so a subtree common to every live version is copied forward
//! exactly once. Relocation never needs to rehash: node content is
//! unchanged, only its backing chunk moves, so `cached_hash` is carried
//! over verbatim.

use rustc_hash::FxHashMap;

use triedb_pool::metadata::ChunkList;
use triedb_pool::offset::{PhysicalOffset, VirtualOffset};
use triedb_pool::ring::RootOffsetRing;

use crate::error::TrieResult;
use crate::store::NodeStore;

/// Below this free-chunk fraction, the compactor widens the retiring set
/// per list so reclamation keeps pace with allocation (§4.7).
const AGGRESSIVE_FREE_RATIO: f64 = 0.2;

pub struct Compactor<'a> {
    store: &'a NodeStore,
    ring: &'a RootOffsetRing,
    slow_fast_ratio_target: f64,
}

impl<'a> Compactor<'a> {
    pub fn new(store: &'a NodeStore, ring: &'a RootOffsetRing, slow_fast_ratio_target: f64) -> Self {
        Compactor {
            store,
            ring,
            slow_fast_ratio_target,
        }
    }

    /// Runs one bounded compaction pass: picks a handful of the
    /// oldest-insertion-count chunks off the fast and slow lists, relocates
    /// every node any still-live version can still reach out of them, and
    /// releases the now-empty chunks back to the free list.
    pub fn run_once(&self) -> TrieResult<()> {
        let Some(max_version) = self.ring.max_version() else {
            return Ok(());
        };
        let min_version = self.ring.min_valid_version().unwrap_or(max_version);

        let threshold = self.advance_frontier(ChunkList::Fast);
        let slow_threshold = self.advance_frontier(ChunkList::Slow);
        let threshold = threshold.max(slow_threshold);
        if threshold.insertion_count == 0 {
            return Ok(());
        }

        let dest_list = self.destination_list();
        let mut memo: FxHashMap<u64, PhysicalOffset> = FxHashMap::default();

        for version in min_version..=max_version {
            let Some(root) = self.ring.read(version) else {
                continue;
            };
            let new_root = self.relocate(root, &mut memo, threshold, dest_list)?;
            if new_root != root {
                self.ring.update(version, new_root);
            }
        }

        self.release_retired_chunks(ChunkList::Fast, threshold);
        self.release_retired_chunks(ChunkList::Slow, threshold);
        Ok(())
    }

    /// Recomputes the once-per-sweep destination list: slow unless the slow
    /// list has already grown past `slow_fast_ratio_target` relative to
    /// fast, in which case fast picks up the overflow (§4.7).
    fn destination_list(&self) -> ChunkList {
        let fast_len = self.store.pool.front.list_iter(ChunkList::Fast).len().max(1);
        let slow_len = self.store.pool.front.list_iter(ChunkList::Slow).len();
        let ratio = slow_len as f64 / fast_len as f64;
        if ratio > self.slow_fast_ratio_target {
            ChunkList::Fast
        } else {
            ChunkList::Slow
        }
    }

    /// Widens the sweep frontier for `list` by the oldest chunks not
    /// already behind it, and returns the resulting global threshold: any
    /// node whose chunk's insertion count is strictly below this value is
    /// eligible for relocation. Chooses the list's sole chunk (its active
    /// write head) to never retire, since a list with one chunk is still
    /// being appended to.
    fn advance_frontier(&self, list: ChunkList) -> VirtualOffset {
        let front = &self.store.pool.front;
        let chunks = front.list_iter(list); // newest-first
        if chunks.len() <= 1 {
            return self.current_frontier(list);
        }

        let total_chunks = front.chunks.len().max(1);
        let free_ratio = front.list_iter(ChunkList::Free).len() as f64 / total_chunks as f64;
        let retiring_count = if free_ratio < AGGRESSIVE_FREE_RATIO {
            (chunks.len() / 4).max(1)
        } else {
            1
        };

        // Oldest chunks are at the tail of a head-first list, excluding the
        // head itself (the active write target, never eligible).
        let retiring_start = chunks.len().saturating_sub(retiring_count).max(1);
        let retiring = &chunks[retiring_start..];
        if retiring.is_empty() {
            return self.current_frontier(list);
        }

        let newest_retiring_count = retiring
            .iter()
            .map(|&id| front.chunks[id as usize].insertion_count())
            .max()
            .unwrap_or(0);
        let new_frontier = VirtualOffset::new(newest_retiring_count + 1, 0);

        let mut slot = self.frontier_slot(list);
        if new_frontier > *slot {
            *slot = new_frontier;
        }
        *slot
    }

    fn frontier_slot(&self, list: ChunkList) -> parking_lot::MutexGuard<'_, VirtualOffset> {
        match list {
            ChunkList::Fast => self.store.pool.front.compact_offset_fast.lock(),
            ChunkList::Slow => self.store.pool.front.compact_offset_slow.lock(),
            ChunkList::Free => unreachable!("compaction never tracks a frontier for the free list"),
        }
    }

    fn current_frontier(&self, list: ChunkList) -> VirtualOffset {
        *self.frontier_slot(list)
    }

    /// Releases every chunk on `list` whose entire insertion-count range now
    /// falls behind `threshold`: the sweep above has already copied forward
    /// every node any live version could reach inside them, so whatever
    /// remains is provably unreachable garbage.
    fn release_retired_chunks(&self, list: ChunkList, threshold: VirtualOffset) {
        let front = &self.store.pool.front;
        let chunks = front.list_iter(list);
        for &id in chunks.iter().rev() {
            // tail-first: oldest chunks release first
            if front.chunks[id as usize].insertion_count() < threshold.insertion_count {
                front.release_chunk(list, id);
            } else {
                break;
            }
        }
    }

    /// Copies `offset`'s node forward to `dest_list` if it (or any
    /// descendant) is older than `threshold`, recursing into every child
    /// regardless of this node's own staleness — an untouched subtree can
    /// be older than its freshly rewritten parent, since ordinary upserts
    /// never rewrite nodes outside the path they touch.
    fn relocate(
        &self,
        offset: PhysicalOffset,
        memo: &mut FxHashMap<u64, PhysicalOffset>,
        threshold: VirtualOffset,
        dest_list: ChunkList,
    ) -> TrieResult<PhysicalOffset> {
        if let Some(&done) = memo.get(&offset.raw()) {
            return Ok(done);
        }

        let node = self.store.load(offset)?;
        let own_vo = self.store.virtual_offset_of(offset);
        let own_stale = own_vo < threshold;

        let mut new_children = Vec::with_capacity(node.children.len());
        let mut any_child_moved = false;
        for &child_offset in &node.children {
            let relocated = self.relocate(child_offset, memo, threshold, dest_list)?;
            any_child_moved |= relocated != child_offset;
            new_children.push(relocated);
        }

        let result = if own_stale || any_child_moved {
            let copy = crate::codec::Node {
                child_mask: node.child_mask,
                path: node.path.clone(),
                children: new_children,
                value: node.value.clone(),
                cached_hash: node.cached_hash,
            };
            let bytes = copy.encode();
            let (new_offset, _vo) = self
                .store
                .pool
                .append_bytes(dest_list, &bytes)
                .map_err(crate::error::TrieError::Pool)?;
            self.store.cache.invalidate(own_vo);
            new_offset
        } else {
            offset
        };

        memo.insert(offset.raw(), result);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeCache;
    use crate::engine::{EngineConfig, Update, UpdateEngine};
    use crate::hash::{HashProvider, EMPTY_TRIE_HASH};
    use crate::statemachine::{HashVariant, NodeDecision, StateMachine};
    use std::sync::Arc;
    use triedb_pool::config::PoolConfig;
    use triedb_pool::StoragePool;

    struct ConstHashProvider;
    impl HashProvider for ConstHashProvider {
        fn hash_node(&self, _variant: HashVariant, _node: &crate::codec::Node, _children: &[[u8; 32]]) -> [u8; 32] {
            EMPTY_TRIE_HASH
        }
    }

    struct AlwaysCache;
    impl StateMachine for AlwaysCache {
        fn decide(&self, _depth: u32, _tag: u8, _is_leaf: bool) -> NodeDecision {
            NodeDecision {
                cache_this_node: true,
                compact_through_here: true,
                auto_expire: false,
                hash_variant: HashVariant::None,
            }
        }
    }

    fn test_engine(num_chunks: u64) -> UpdateEngine {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * num_chunks + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file);
        UpdateEngine::new(
            pool,
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            64,
            EngineConfig::default(),
        )
    }

    fn key(nibbles: &[u8]) -> crate::nibble::NibbleVec {
        nibbles.iter().copied().collect()
    }

    #[test]
    fn run_once_with_no_versions_is_a_no_op() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 8 + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file);
        let cache = Arc::new(NodeCache::new(1 << 20));
        let store = NodeStore::new(pool, cache);
        let ring = RootOffsetRing::new(8);
        let compactor = Compactor::new(&store, &ring, 0.5);
        assert!(compactor.run_once().is_ok());
    }

    #[test]
    fn live_root_survives_compaction_with_same_content() {
        let engine = test_engine(64);
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3]), b"v".to_vec())], 1, false, true)
            .unwrap();
        let before = engine.store().load(root).unwrap();

        let compactor = Compactor::new(engine.store(), engine.ring(), 0.5);
        compactor.run_once().unwrap();

        let root_after = engine.read_root_for_version(1).unwrap();
        let after = engine.store().load(root_after).unwrap();
        assert_eq!(after.value, before.value);
        assert_eq!(after.path.as_slice(), before.path.as_slice());
    }

    #[test]
    fn many_versions_eventually_free_chunks_back_to_free_list() {
        let engine = test_engine(32);
        for v in 1..=40u64 {
            engine
                .upsert(vec![Update::upsert(key(&[(v % 16) as u8]), vec![v as u8; 200])], v, true, true)
                .unwrap();
        }
        let free_len = engine.store().pool.front.list_iter(ChunkList::Free).len();
        assert!(free_len > 0, "compaction should have reclaimed at least one retired chunk");
    }
}
