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

//! Versioned single-key lookup (§4.9).
//!
//! A find is a plain iterative descent: at each node, consume as much of
//! the node's compressed path as matches the remaining key, then either
//! land on a value, fall through a child slot, or report one of the
//! [`FindOutcome`] non-matches. [`FindMode::NonBlocking`] stops at the
//! first cache miss instead of reading through to disk, for a caller
//! driving lookups from the I/O executor's own thread that cannot afford
//! to block it on a synchronous read.

use triedb_pool::offset::PhysicalOffset;
use triedb_pool::ring::RootOffsetRing;

use crate::error::{FindOutcome, TrieResult};
use crate::store::NodeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindMode {
    /// Falls through to a synchronous pool read on every cache miss.
    Blocking,
    /// Returns [`FindOutcome::NeedToContinueInIoThread`] on the first miss
    /// rather than blocking; the caller is expected to resume the lookup
    /// (from `cur_offset` onward, via [`find_from`]) once an async read
    /// completes on the I/O executor thread.
    NonBlocking,
}

/// Looks up `key_nibbles` starting at `root`, per `mode`'s cache-miss policy.
pub fn find(store: &NodeStore, root: PhysicalOffset, key_nibbles: &[u8], mode: FindMode) -> TrieResult<FindOutcome> {
    find_from(store, root, key_nibbles, mode)
}

/// Resolves `version` to a root via `ring` first; a version that has
/// rolled out of the history window reports
/// [`FindOutcome::VersionNoLongerExists`] without touching the store.
pub fn find_versioned(
    store: &NodeStore,
    ring: &RootOffsetRing,
    version: u64,
    key_nibbles: &[u8],
    mode: FindMode,
) -> TrieResult<FindOutcome> {
    match ring.read(version) {
        Some(root) => find_from(store, root, key_nibbles, mode),
        None => Ok(FindOutcome::VersionNoLongerExists),
    }
}

/// The resumable core of [`find`]: exposed separately so a non-blocking
/// caller that got [`FindOutcome::NeedToContinueInIoThread`] can resume the
/// descent from the offset it stalled on, once that node is in cache.
pub fn find_from(store: &NodeStore, mut cur_offset: PhysicalOffset, key_nibbles: &[u8], mode: FindMode) -> TrieResult<FindOutcome> {
    let mut remaining = key_nibbles;

    loop {
        let node = match mode {
            FindMode::Blocking => store.load(cur_offset)?,
            FindMode::NonBlocking => {
                let vo = store.virtual_offset_of(cur_offset);
                match store.cache.find(vo) {
                    Some(node) => node,
                    None => return Ok(FindOutcome::NeedToContinueInIoThread),
                }
            }
        };

        let common = crate::nibble::common_prefix_len(&node.path, remaining);
        if common < node.path.len() {
            return Ok(if common == remaining.len() {
                FindOutcome::KeyEndsEarlierThanNode
            } else {
                FindOutcome::KeyMismatch
            });
        }
        remaining = &remaining[common..];

        if remaining.is_empty() {
            return Ok(match &node.value {
                Some(v) => FindOutcome::Found(v.clone()),
                None => FindOutcome::NotFound,
            });
        }

        let nibble = remaining[0];
        remaining = &remaining[1..];
        match node.child_slot(nibble) {
            Some(slot) => cur_offset = node.children[slot],
            None => return Ok(FindOutcome::BranchNotExist),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NodeCache;
    use crate::engine::{EngineConfig, Update, UpdateEngine};
    use crate::hash::{HashProvider, EMPTY_TRIE_HASH};
    use crate::nibble::NibbleVec;
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

    struct NeverCache;
    impl StateMachine for NeverCache {
        fn decide(&self, _depth: u32, _tag: u8, _is_leaf: bool) -> NodeDecision {
            NodeDecision {
                cache_this_node: false,
                compact_through_here: true,
                auto_expire: false,
                hash_variant: HashVariant::None,
            }
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

    fn test_engine(state_machine: Arc<dyn StateMachine>) -> UpdateEngine {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 16 + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file);
        UpdateEngine::new(
            pool,
            Arc::new(NodeCache::new(1 << 20)),
            state_machine,
            Arc::new(ConstHashProvider),
            4,
            EngineConfig::default(),
        )
    }

    fn key(nibbles: &[u8]) -> NibbleVec {
        nibbles.iter().copied().collect()
    }

    #[test]
    fn finds_an_existing_leaf() {
        let engine = test_engine(Arc::new(AlwaysCache));
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3, 4]), b"dead".to_vec())], 1, false, true)
            .unwrap();
        let outcome = find(engine.store(), root, &[1, 2, 3, 4], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::Found(b"dead".to_vec()));
    }

    #[test]
    fn branch_not_exist_when_nibble_has_no_child() {
        let engine = test_engine(Arc::new(AlwaysCache));
        let root = engine
            .upsert(
                vec![
                    Update::upsert(key(&[1, 0xa]), b"one".to_vec()),
                    Update::upsert(key(&[1, 0xb]), b"two".to_vec()),
                ],
                1,
                false,
                true,
            )
            .unwrap();
        let outcome = find(engine.store(), root, &[1, 0xc], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::BranchNotExist);
    }

    #[test]
    fn key_ends_earlier_than_a_longer_compressed_path() {
        let engine = test_engine(Arc::new(AlwaysCache));
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3, 4]), b"v".to_vec())], 1, false, true)
            .unwrap();
        let outcome = find(engine.store(), root, &[1, 2], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::KeyEndsEarlierThanNode);
    }

    #[test]
    fn key_mismatch_on_mid_path_divergence() {
        let engine = test_engine(Arc::new(AlwaysCache));
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3, 4]), b"v".to_vec())], 1, false, true)
            .unwrap();
        let outcome = find(engine.store(), root, &[1, 9, 3, 4], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::KeyMismatch);
    }

    #[test]
    fn not_found_on_branch_with_no_own_value() {
        let engine = test_engine(Arc::new(AlwaysCache));
        let root = engine
            .upsert(
                vec![
                    Update::upsert(key(&[1, 0xa]), b"one".to_vec()),
                    Update::upsert(key(&[1, 0xb]), b"two".to_vec()),
                ],
                1,
                false,
                true,
            )
            .unwrap();
        let outcome = find(engine.store(), root, &[1], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::NotFound);
    }

    #[test]
    fn non_blocking_mode_reports_need_to_continue_on_cache_miss() {
        let engine = test_engine(Arc::new(NeverCache));
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2]), b"v".to_vec())], 1, false, true)
            .unwrap();
        let outcome = find(engine.store(), root, &[1, 2], FindMode::NonBlocking).unwrap();
        assert_eq!(outcome, FindOutcome::NeedToContinueInIoThread);
    }

    #[test]
    fn versioned_find_reports_version_no_longer_exists() {
        let engine = test_engine(Arc::new(AlwaysCache));
        for v in 1..=6u64 {
            engine
                .upsert(vec![Update::upsert(key(&[(v % 16) as u8]), b"v".to_vec())], v, false, true)
                .unwrap();
        }
        // window is 4, so version 1 has rolled out by the time version 6 lands.
        let outcome = find_versioned(engine.store(), engine.ring(), 1, &[1], FindMode::Blocking).unwrap();
        assert_eq!(outcome, FindOutcome::VersionNoLongerExists);
    }
}
