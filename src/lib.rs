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

//! Versioned, content-addressed Merkle Patricia Trie storage engine.
//!
//! This crate is a thin facade over `triedb-pool` (chunked storage),
//! `triedb-io` (the io_uring executor, not yet wired through this facade —
//! see the note on [`Trie`]) and `triedb-mpt` (node codec, cache, update
//! engine, compactor, find, traversal). [`Trie::open`] wires a pool, a
//! node cache and an update engine together and exposes the commit
//! interface described in §6: upsert, version renumbering, versioned
//! reads, and the find/traversal entry points.

#[macro_use]
extern crate log;

pub mod config;
pub mod error;

use std::sync::Arc;

pub use config::Config;
pub use error::{abort_on_fatal, FatalError, EXIT_FATAL, EXIT_OK};

pub use triedb_mpt::{
    CancellationToken, Compactor, DefaultStateMachine, EngineConfig, FindMode, FindOutcome, HashProvider, HashVariant, NibbleVec, NodeDecision,
    NullHashProvider, ParallelTraversal, StateMachine, TrailingOffsetPlacement, TrieError, TrieResult, Update, ValuePlacement, Visitor,
    EMPTY_TRIE_HASH,
};
pub use triedb_pool::offset::PhysicalOffset;

use triedb_mpt::{NodeCache, UpdateEngine};
use triedb_pool::StoragePool;

/// The commit interface (§6): the single entry point external loaders and
/// the execution client hold onto for one versioned trie's lifetime.
///
/// Owns the storage pool, the node cache, and the update engine that runs
/// on the thread that called [`Trie::open`] (every subsequent [`Trie::upsert`]
/// must come from that same thread, per §5's single-owner rule). Does not
/// yet own a [`triedb_io::Executor`] — every read in this facade, including
/// [`Trie::find`] and [`Trie::traverse_blocking`], is a synchronous pool
/// read on cache miss; a caller that wants the executor's non-blocking path
/// constructs one separately against the same devices and drives
/// [`FindMode::NonBlocking`] itself.
pub struct Trie {
    engine: UpdateEngine,
    slow_fast_ratio_target: f64,
}

impl Trie {
    /// Opens (or truncates, per `config`) the backing devices. Per §7 every
    /// failure here — bad magic, a config-hash mismatch across devices,
    /// both metadata mirrors dirty — is fatal at open, so this returns a
    /// [`FatalError`] rather than a `Result` a caller is expected to retry.
    ///
    /// Equivalent to [`Trie::open_with_nested_updates`] with `None` for the
    /// [`ValuePlacement`] seam; use that instead when the caller will submit
    /// [`Update::Upsert`] values with a non-empty `nested` list (§4.6).
    pub fn open(config: Config, state_machine: Arc<dyn StateMachine>, hash_provider: Arc<dyn HashProvider>) -> Result<Trie, FatalError> {
        Trie::open_with_nested_updates(config, state_machine, hash_provider, None)
    }

    /// Like [`Trie::open`], but also wires the seam nested updates need:
    /// embedding a nested subtrie's root into its enclosing leaf's value
    /// bytes. See [`ValuePlacement`] and [`TrailingOffsetPlacement`] for a
    /// ready-made implementation.
    pub fn open_with_nested_updates(
        config: Config,
        state_machine: Arc<dyn StateMachine>,
        hash_provider: Arc<dyn HashProvider>,
        value_placement: Option<Arc<dyn ValuePlacement>>,
    ) -> Result<Trie, FatalError> {
        let pool = StoragePool::open(config.pool_config()).map_err(|e| FatalError::new("opening storage pool", e))?;
        let cache = Arc::new(NodeCache::new(config.node_cache_bytes));
        let engine = UpdateEngine::with_value_placement(
            Arc::new(pool),
            cache,
            state_machine,
            hash_provider,
            value_placement,
            config.version_history_window,
            config.engine.clone(),
        );
        Ok(Trie {
            engine,
            slow_fast_ratio_target: config.engine.slow_fast_ratio_target,
        })
    }

    /// Applies `updates` against `version - 1`'s root and publishes the
    /// result at `version`. See [`triedb_mpt::EngineConfig`] and
    /// [`triedb_mpt::UpdateEngine::upsert`] for what `compaction_enabled`
    /// and `write_to_fast_ring` each control.
    pub fn upsert(&self, updates: Vec<Update>, version: u64, compaction_enabled: bool, write_to_fast_ring: bool) -> TrieResult<PhysicalOffset> {
        self.engine.upsert(updates, version, compaction_enabled, write_to_fast_ring)
    }

    /// Renumbers `src_version`'s root to `dest_version` without copying
    /// any node data (§6, §3's "two-ring split" supplement notwithstanding
    /// — this is a ring-level rename, not an I/O operation).
    pub fn move_version_forward(&self, src_version: u64, dest_version: u64) {
        self.engine.ring().fast_forward_next_version(src_version, dest_version);
    }

    pub fn read_root_for_version(&self, version: u64) -> Option<PhysicalOffset> {
        self.engine.read_root_for_version(version)
    }

    pub fn min_valid_version(&self) -> Option<u64> {
        self.engine.min_valid_version()
    }

    pub fn max_version(&self) -> Option<u64> {
        self.engine.ring().max_version()
    }

    /// Runs one compaction sweep (§4.7) outside of an upsert's own
    /// `compaction_enabled` path — intended for a bulk loader that passes
    /// `compaction_enabled = false` to every upsert and compacts once,
    /// explicitly, after the load finishes.
    pub fn compact_once(&self) -> TrieResult<()> {
        Compactor::new(self.engine.store(), self.engine.ring(), self.slow_fast_ratio_target).run_once()
    }

    /// Looks up `key_nibbles` as of `version` (§4.9).
    pub fn find_versioned(&self, version: u64, key_nibbles: &[u8], mode: FindMode) -> TrieResult<FindOutcome> {
        triedb_mpt::find_versioned(self.engine.store(), self.engine.ring(), version, key_nibbles, mode)
    }

    /// Looks up `key_nibbles` starting from an already-resolved `root`,
    /// e.g. one returned by a prior [`Trie::upsert`].
    pub fn find(&self, root: PhysicalOffset, key_nibbles: &[u8], mode: FindMode) -> TrieResult<FindOutcome> {
        triedb_mpt::find(self.engine.store(), root, key_nibbles, mode)
    }

    /// Walks the subtree rooted at `root` on the calling thread (§4.8).
    pub fn traverse_blocking(&self, root: PhysicalOffset, visitor: &mut dyn Visitor, cancel: &CancellationToken) -> TrieResult<bool> {
        triedb_mpt::traverse_blocking(self.engine.store(), root, visitor, cancel)
    }

    /// Builds a bounded-concurrency traversal driver (§4.8) against this
    /// trie's node store; `run` still needs a root and a [`CancellationToken`].
    pub fn parallel_traversal(&self, concurrency_limit: usize) -> ParallelTraversal<'_> {
        ParallelTraversal::new(self.engine.store(), concurrency_limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triedb_mpt::codec::Node;

    struct ConstHashProvider;
    impl HashProvider for ConstHashProvider {
        fn hash_node(&self, _variant: HashVariant, _node: &Node, _children: &[[u8; 32]]) -> [u8; 32] {
            EMPTY_TRIE_HASH
        }
    }

    fn key(nibbles: &[u8]) -> NibbleVec {
        nibbles.iter().copied().collect()
    }

    fn test_trie() -> Trie {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 16 + 4096).unwrap();
        let config = Config::new(vec![file.path().to_path_buf()], 12).truncate().with_node_cache_bytes(1 << 20);
        std::mem::forget(file);
        Trie::open(config, Arc::new(DefaultStateMachine { cache_depth_threshold: 8 }), Arc::new(ConstHashProvider)).unwrap()
    }

    #[test]
    fn upsert_then_find_round_trips_through_the_facade() {
        let trie = test_trie();
        let root = trie
            .upsert(vec![Update::upsert(key(&[1, 2, 3, 4]), b"dead".to_vec())], 1, false, true)
            .unwrap();
        assert_eq!(trie.find(root, &[1, 2, 3, 4], FindMode::Blocking).unwrap(), FindOutcome::Found(b"dead".to_vec()));
        assert_eq!(trie.find_versioned(1, &[1, 2, 3, 4], FindMode::Blocking).unwrap(), FindOutcome::Found(b"dead".to_vec()));
    }

    #[test]
    fn move_version_forward_renumbers_without_copying_data() {
        let trie = test_trie();
        let root = trie
            .upsert(vec![Update::upsert(key(&[1, 2]), b"v".to_vec())], 1, false, true)
            .unwrap();
        trie.move_version_forward(1, 5);
        assert_eq!(trie.read_root_for_version(5), Some(root));
        assert_eq!(trie.max_version(), Some(5));
    }

    #[test]
    fn nested_updates_through_the_facade_embed_a_storage_subtrie_root() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 32 + 4096).unwrap();
        let config = Config::new(vec![file.path().to_path_buf()], 12).truncate().with_node_cache_bytes(1 << 20);
        std::mem::forget(file);
        let trie = Trie::open_with_nested_updates(
            config,
            Arc::new(DefaultStateMachine { cache_depth_threshold: 8 }),
            Arc::new(ConstHashProvider),
            Some(Arc::new(TrailingOffsetPlacement)),
        )
        .unwrap();

        let root = trie
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1, 2]),
                    b"account".to_vec(),
                    false,
                    vec![Update::upsert(key(&[0xa]), b"slot".to_vec())],
                )],
                1,
                false,
                true,
            )
            .unwrap();

        let FindOutcome::Found(value) = trie.find(root, &[1, 2], FindMode::Blocking).unwrap() else {
            panic!("expected the account leaf to be found");
        };
        let nested_root = TrailingOffsetPlacement.extract_nested_root(&value).expect("nested root embedded in value");
        assert_eq!(
            trie.find(nested_root, &[0xa], FindMode::Blocking).unwrap(),
            FindOutcome::Found(b"slot".to_vec())
        );
    }

    #[test]
    fn open_on_a_bad_device_reports_a_fatal_error() {
        let config = Config::new(vec!["/nonexistent/path/for/sure".into()], 12);
        let err = Trie::open(config, Arc::new(DefaultStateMachine { cache_depth_threshold: 8 }), Arc::new(ConstHashProvider)).unwrap_err();
        assert_eq!(err.context, "opening storage pool");
    }
}
