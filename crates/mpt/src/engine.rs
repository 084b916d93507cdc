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

//! The update engine (§4.6): applies one version's batch of upserts/erases
//! against a prior root and produces a new one. Runs entirely on its
//! owning thread; every rebuilt node is written children-before-parents.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;

use triedb_pool::error::FatalPoolError;
use triedb_pool::metadata::{ChunkList, DirtyGuard};
use triedb_pool::offset::PhysicalOffset;
use triedb_pool::ring::RootOffsetRing;
use triedb_pool::StoragePool;

use crate::cache::NodeCache;
use crate::codec::Node;
use crate::error::{TrieError, TrieResult};
use crate::hash::{HashProvider, EMPTY_TRIE_HASH};
use crate::nibble::{self, NibbleVec};
use crate::statemachine::{HashVariant, StateMachine};
use crate::store::NodeStore;
use crate::value_placement::ValuePlacement;

/// One requested change against a trie, keyed by nibble path from the root.
/// `nested` lets a single submission update a leaf's own value *and* a
/// subtrie rooted at that leaf (e.g. an account and its storage) in one
/// pass; building and embedding that subtrie's root requires the engine to
/// be constructed with a [`crate::value_placement::ValuePlacement`] (see
/// [`UpdateEngine::with_value_placement`]).
#[derive(Debug, Clone)]
pub enum Update {
    Upsert {
        key: NibbleVec,
        value: Vec<u8>,
        incarnation: bool,
        nested: Vec<Update>,
    },
    Erase {
        key: NibbleVec,
    },
}

impl Update {
    pub fn upsert(key: NibbleVec, value: Vec<u8>) -> Self {
        Update::Upsert {
            key,
            value,
            incarnation: false,
            nested: Vec::new(),
        }
    }

    /// An upsert that also applies `nested` against the subtrie rooted at
    /// this leaf's prior value (§4.6). `incarnation` abandons that prior
    /// subtrie instead of building on it — the account-resurrect case.
    pub fn upsert_with_nested(key: NibbleVec, value: Vec<u8>, incarnation: bool, nested: Vec<Update>) -> Self {
        Update::Upsert { key, value, incarnation, nested }
    }

    pub fn erase(key: NibbleVec) -> Self {
        Update::Erase { key }
    }
}

#[derive(Debug, Clone)]
enum Action {
    Upsert {
        value: Vec<u8>,
        incarnation: bool,
        nested: Vec<Update>,
    },
    Erase,
}

#[derive(Debug, Clone)]
struct Op {
    key: NibbleVec,
    action: Action,
}

fn flatten(updates: Vec<Update>) -> Vec<Op> {
    let mut ops = Vec::with_capacity(updates.len());
    for update in updates {
        match update {
            Update::Upsert {
                key,
                value,
                incarnation,
                nested,
            } => ops.push(Op {
                key,
                action: Action::Upsert { value, incarnation, nested },
            }),
            Update::Erase { key } => ops.push(Op {
                key,
                action: Action::Erase,
            }),
        }
    }
    ops
}

/// Tunables consulted by the writer-routing and path-compression logic.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Nodes at or above this trie depth are eligible for the fast list
    /// under normal writer routing; consulted by the compactor (every
    /// upsert-path write is already on the active path and goes fast).
    pub depth_threshold_fast: u32,
    /// Target slow:fast list-length ratio; exceeding it routes what would
    /// have been a slow write to fast instead (§4.6, §4.7).
    pub slow_fast_ratio_target: f64,
    /// Erasing a key with no existing value returns an error rather than
    /// being silently accepted as a no-op.
    pub strict_erase: bool,
    pub subtrie_tag: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            depth_threshold_fast: 4,
            slow_fast_ratio_target: 0.5,
            strict_erase: true,
            subtrie_tag: 0,
        }
    }
}

/// Either an untouched subtree (referenced by its existing physical
/// offset, never re-read unless a descendant changes) or a freshly built
/// one awaiting materialization to disk. Path compression collapses chains
/// of `New` candidates before any bytes are written, so a node that would
/// immediately be folded into its parent is never serialized.
enum Candidate {
    Existing(PhysicalOffset),
    New {
        path: NibbleVec,
        value: Option<Vec<u8>>,
        children: BTreeMap<u8, Candidate>,
    },
}

struct BuiltNode {
    offset: PhysicalOffset,
    hash: [u8; 32],
}

pub struct UpdateEngine {
    store: NodeStore,
    state_machine: Arc<dyn StateMachine>,
    hash_provider: Arc<dyn HashProvider>,
    value_placement: Option<Arc<dyn ValuePlacement>>,
    ring: RootOffsetRing,
    config: EngineConfig,
    owner: ThreadId,
    write_lock: Mutex<()>,
}

impl UpdateEngine {
    pub fn new(
        pool: Arc<StoragePool>,
        cache: Arc<NodeCache>,
        state_machine: Arc<dyn StateMachine>,
        hash_provider: Arc<dyn HashProvider>,
        version_window: u64,
        config: EngineConfig,
    ) -> Self {
        Self::with_value_placement(pool, cache, state_machine, hash_provider, None, version_window, config)
    }

    /// Like [`UpdateEngine::new`], but also wires the seam that §4.6's
    /// nested updates need: embedding a nested subtrie's root into the
    /// enclosing leaf's value bytes (see [`ValuePlacement`]). A caller that
    /// never submits [`Update::Upsert`] with a non-empty `nested` list can
    /// use [`UpdateEngine::new`] instead and pass `None` here.
    pub fn with_value_placement(
        pool: Arc<StoragePool>,
        cache: Arc<NodeCache>,
        state_machine: Arc<dyn StateMachine>,
        hash_provider: Arc<dyn HashProvider>,
        value_placement: Option<Arc<dyn ValuePlacement>>,
        version_window: u64,
        config: EngineConfig,
    ) -> Self {
        UpdateEngine {
            store: NodeStore::new(pool, cache),
            state_machine,
            hash_provider,
            value_placement,
            ring: RootOffsetRing::new(version_window),
            config,
            owner: std::thread::current().id(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn ring(&self) -> &RootOffsetRing {
        &self.ring
    }

    pub fn store(&self) -> &NodeStore {
        &self.store
    }

    fn assert_owner(&self) -> TrieResult<()> {
        if std::thread::current().id() != self.owner {
            return Err(TrieError::Io(triedb_io::error::IoError::WrongThread));
        }
        Ok(())
    }

    /// Applies `updates` against the root at `version - 1` (or an empty
    /// trie if there is none) and publishes the result at `version`.
    /// `write_to_fast_ring = false` routes every rebuilt node to the slow
    /// list instead of the default active-path fast routing — intended for
    /// bulk historical loads that should not crowd out the hot fast list.
    /// `compaction_enabled` runs the compactor's live-root sweep (§4.7)
    /// against every still-live version's root immediately after this
    /// version's root is published; callers doing a bulk historical load
    /// typically pass `false` and trigger compaction explicitly afterwards
    /// via [`crate::compactor::Compactor::run_once`] instead.
    pub fn upsert(
        &self,
        updates: Vec<Update>,
        version: u64,
        compaction_enabled: bool,
        write_to_fast_ring: bool,
    ) -> TrieResult<PhysicalOffset> {
        self.assert_owner()?;
        let _guard = self.write_lock.lock();

        let mut ops = flatten(updates);
        ops.sort_by(|a, b| a.key.cmp(&b.key));

        let list = if write_to_fast_ring { ChunkList::Fast } else { ChunkList::Slow };
        let prior_root = if version == 0 { None } else { self.ring.read(version - 1) };
        let existing = prior_root.map(Candidate::Existing);

        // Every chunk-metadata mutation this upsert makes (allocation,
        // byte reservation, list membership) lands on the front mirror as
        // it happens; the dirty bit stays raised for the whole commit so a
        // crash mid-write is detected as a dirty front on the next open
        // (§4.2, §5). It's cleared only once the back mirror has been
        // brought up to date and both copies are flushed to disk. The bit
        // itself is written to disk as its own byte, independent of the
        // bulk metadata flush below, so a crash between the two still
        // leaves a dirty front on the next open.
        let pool = self.store.pool.as_ref();
        let dirty_guard = DirtyGuard::enter(&pool.front);
        if let Err(e) = pool.persist_dirty_bit(0, true) {
            FatalPoolError::new("raising the front metadata dirty bit", e).abort();
        }

        let root = self.apply(existing, ops, 0, self.config.subtrie_tag, list)?;
        let built = match root {
            Some(candidate) => self.materialize(candidate, 0, self.config.subtrie_tag, list)?,
            None => self.write_empty_root(list)?,
        };

        self.ring.append(version, built.offset);

        if compaction_enabled {
            // Compaction's own list-membership changes are still a
            // front-mirror mutation made under this same commit's dirty
            // guard; it has to finish before the mirror/flush below or its
            // edits would go unmirrored until the next upsert.
            let compactor = crate::compactor::Compactor::new(&self.store, &self.ring, self.config.slow_fast_ratio_target);
            compactor.run_once()?;
        }

        pool.back.decode_into(&pool.front.encode());
        // A failed metadata flush here is exactly the kind of raw
        // device-I/O failure on the metadata path that §7 classifies as
        // fatal rather than recoverable: a half-flushed mirror pair must
        // never be handed back to a caller as an ordinary error.
        if let Err(e) = pool.persist_metadata() {
            FatalPoolError::new("persisting metadata mirrors after commit", e).abort();
        }
        if let Err(e) = pool.persist_dirty_bit(0, false) {
            FatalPoolError::new("clearing the front metadata dirty bit", e).abort();
        }
        drop(dirty_guard);

        Ok(built.offset)
    }

    pub fn read_root_for_version(&self, version: u64) -> Option<PhysicalOffset> {
        self.ring.read(version)
    }

    pub fn min_valid_version(&self) -> Option<u64> {
        self.ring.min_valid_version()
    }

    pub fn max_version(&self) -> Option<u64> {
        self.ring.max_version()
    }

    /// Renumbers a version without touching data, per the commit interface
    /// in §6.
    pub fn move_version_forward(&self, src_version: u64, dest_version: u64) -> TrieResult<()> {
        self.assert_owner()?;
        let _guard = self.write_lock.lock();
        self.ring.fast_forward_next_version(src_version, dest_version);
        Ok(())
    }

    fn write_empty_root(&self, list: ChunkList) -> TrieResult<BuiltNode> {
        let node = Node {
            child_mask: 0,
            path: NibbleVec::new(),
            children: Vec::new(),
            value: None,
            cached_hash: Some(EMPTY_TRIE_HASH),
        };
        let bytes = node.encode();
        let (offset, _vo) = self.store.pool.append_bytes(list, &bytes).map_err(TrieError::Pool)?;
        Ok(BuiltNode {
            offset,
            hash: EMPTY_TRIE_HASH,
        })
    }

    /// Decomposes any candidate into (path, value, children-as-candidates),
    /// reading through the node store when the candidate references an
    /// unmodified on-disk subtree.
    fn open(&self, candidate: Candidate) -> TrieResult<(NibbleVec, Option<Vec<u8>>, BTreeMap<u8, Candidate>)> {
        match candidate {
            Candidate::New { path, value, children } => Ok((path, value, children)),
            Candidate::Existing(offset) => {
                let node = self.store.load(offset)?;
                let mut children = BTreeMap::new();
                for (slot, nibble) in node.present_nibbles().enumerate() {
                    children.insert(nibble, Candidate::Existing(node.children[slot]));
                }
                Ok((node.path.clone(), node.value.clone(), children))
            }
        }
    }

    /// Folds chains of valueless single-child candidates into one
    /// compressed path (§4.6 step 4), recursing as far as the shape allows.
    fn collapse(
        &self,
        mut path: NibbleVec,
        value: Option<Vec<u8>>,
        children: BTreeMap<u8, Candidate>,
    ) -> TrieResult<Option<Candidate>> {
        if value.is_none() && children.is_empty() {
            return Ok(None);
        }
        if value.is_none() && children.len() == 1 {
            let (nibble, child) = children.into_iter().next().expect("len == 1");
            let (child_path, child_value, child_children) = self.open(child)?;
            path.push(nibble);
            path.extend(child_path);
            return self.collapse(path, child_value, child_children);
        }
        Ok(Some(Candidate::New { path, value, children }))
    }

    /// Applies `ops` (already stripped of the path consumed so far) to
    /// `existing`, which may be absent (a fresh insert), an untouched
    /// on-disk subtree, or a candidate already under construction at this
    /// recursion level (used when splitting a node's compressed path).
    fn apply(&self, existing: Option<Candidate>, ops: Vec<Op>, depth: u32, tag: u8, list: ChunkList) -> TrieResult<Option<Candidate>> {
        if ops.is_empty() {
            return Ok(existing);
        }

        let Some(candidate) = existing else {
            return self.apply_fresh(ops, depth, tag, list);
        };

        let (node_path, node_value, mut node_children) = self.open(candidate)?;
        let min_k = ops
            .iter()
            .map(|op| nibble::common_prefix_len(&node_path, &op.key))
            .min()
            .unwrap_or(0)
            .min(node_path.len());

        if min_k < node_path.len() {
            // The batch diverges partway through this node's compressed
            // path: split at `min_k`, re-rooting the old continuation under
            // `existing_nibble` and letting new ops target either branch.
            let existing_nibble = node_path[min_k];
            let existing_remainder: NibbleVec = node_path[min_k + 1..].iter().copied().collect();
            let existing_branch = Candidate::New {
                path: existing_remainder,
                value: node_value,
                children: node_children,
            };

            let mut own_action: Option<Action> = None;
            let mut groups: BTreeMap<u8, Vec<Op>> = BTreeMap::new();
            for op in ops {
                if op.key.len() == min_k {
                    own_action = Some(op.action);
                } else {
                    let nibble = op.key[min_k];
                    let rest: NibbleVec = op.key[min_k + 1..].iter().copied().collect();
                    groups.entry(nibble).or_default().push(Op { key: rest, action: op.action });
                }
            }

            let existing_nibble_ops = groups.remove(&existing_nibble).unwrap_or_default();
            let mut children = BTreeMap::new();
            if let Some(c) = self.apply(Some(existing_branch), existing_nibble_ops, depth + 1, tag, list)? {
                children.insert(existing_nibble, c);
            }
            for (nibble, group_ops) in groups {
                if let Some(c) = self.apply_fresh(group_ops, depth + 1, tag, list)? {
                    children.insert(nibble, c);
                }
            }

            // The split point is a brand-new key as far as this node's own
            // value slot is concerned — nothing here before this op, so
            // there's no prior nested root to inherit.
            let value = self.resolve_own_value(own_action, depth, false, None, tag, list)?;
            let split_path: NibbleVec = node_path[..min_k].iter().copied().collect();
            self.collapse(split_path, value, children)
        } else {
            // Every op fully consumes this node's path; continue into
            // children, or land on this node's own value.
            let prior_value = node_value.clone();
            let mut own_value = node_value;
            let mut groups: BTreeMap<u8, Vec<Op>> = BTreeMap::new();
            for op in ops {
                if op.key.len() == min_k {
                    match op.action {
                        Action::Upsert { value, incarnation, nested } => {
                            own_value = Some(self.resolve_nested_value(prior_value.as_deref(), value, incarnation, nested, depth, tag, list)?);
                        }
                        Action::Erase => {
                            if own_value.is_none() && self.config.strict_erase {
                                return Err(TrieError::EraseOfNonexistentKey(depth as usize));
                            }
                            own_value = None;
                        }
                    }
                } else {
                    let nibble = op.key[min_k];
                    let rest: NibbleVec = op.key[min_k + 1..].iter().copied().collect();
                    groups.entry(nibble).or_default().push(Op { key: rest, action: op.action });
                }
            }

            let mut children = BTreeMap::new();
            for (nibble, group_ops) in groups {
                let existing_child = node_children.remove(&nibble);
                if let Some(c) = self.apply(existing_child, group_ops, depth + 1, tag, list)? {
                    children.insert(nibble, c);
                }
            }
            children.extend(node_children);
            self.collapse(node_path, own_value, children)
        }
    }

    fn resolve_own_value(
        &self,
        action: Option<Action>,
        depth: u32,
        had_existing: bool,
        prior_value: Option<&[u8]>,
        tag: u8,
        list: ChunkList,
    ) -> TrieResult<Option<Vec<u8>>> {
        match action {
            Some(Action::Upsert { value, incarnation, nested }) => {
                Ok(Some(self.resolve_nested_value(prior_value, value, incarnation, nested, depth, tag, list)?))
            }
            Some(Action::Erase) => {
                if !had_existing && self.config.strict_erase {
                    return Err(TrieError::EraseOfNonexistentKey(depth as usize));
                }
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Resolves a leaf's final value bytes, folding in a nested subtrie
    /// update (§4.6) when `nested` is non-empty: builds the nested tree
    /// against its prior root (unless `incarnation` abandons it), writes it
    /// through [`Self::materialize`] immediately — satisfying
    /// children-before-parents since this leaf itself is materialized later
    /// — and asks [`ValuePlacement`] to embed the new root into `value`.
    fn resolve_nested_value(
        &self,
        prior_value: Option<&[u8]>,
        value: Vec<u8>,
        incarnation: bool,
        nested: Vec<Update>,
        _depth: u32,
        tag: u8,
        list: ChunkList,
    ) -> TrieResult<Vec<u8>> {
        if nested.is_empty() {
            return Ok(value);
        }
        let placement = self.value_placement.as_ref().ok_or_else(|| {
            TrieError::Corrupt(
                PhysicalOffset::INVALID,
                "nested updates require an UpdateEngine configured with a ValuePlacement".to_string(),
            )
        })?;

        let mut nested_ops = flatten(nested);
        nested_ops.sort_by(|a, b| a.key.cmp(&b.key));

        // The nested subtrie is its own tree with its own root: depth
        // restarts at 0 here rather than continuing the parent's depth
        // count, so the state machine's depth-keyed policy applies to the
        // nested tree on its own terms. Only the tag threads through, so one
        // `StateMachine` can still tell "in a storage subtrie" from "in the
        // account trie" apart.
        let nested_tag = tag.wrapping_add(1);
        let prior_root = if incarnation { None } else { prior_value.and_then(|v| placement.extract_nested_root(v)) };
        let existing = prior_root.map(Candidate::Existing);
        let candidate = self.apply(existing, nested_ops, 0, nested_tag, list)?;
        let built = match candidate {
            Some(c) => self.materialize(c, 0, nested_tag, list)?,
            None => self.write_empty_root(list)?,
        };
        Ok(placement.embed_nested_root(&value, built.offset))
    }

    fn apply_fresh(&self, ops: Vec<Op>, depth: u32, tag: u8, list: ChunkList) -> TrieResult<Option<Candidate>> {
        let mut own_value: Option<Vec<u8>> = None;
        let mut groups: BTreeMap<u8, Vec<Op>> = BTreeMap::new();
        for op in ops {
            if op.key.is_empty() {
                match op.action {
                    Action::Upsert { value, incarnation, nested } => {
                        own_value = Some(self.resolve_nested_value(None, value, incarnation, nested, depth, tag, list)?);
                    }
                    Action::Erase => {
                        if self.config.strict_erase {
                            return Err(TrieError::EraseOfNonexistentKey(depth as usize));
                        }
                    }
                }
            } else {
                let nibble = op.key[0];
                let rest: NibbleVec = op.key[1..].iter().copied().collect();
                groups.entry(nibble).or_default().push(Op { key: rest, action: op.action });
            }
        }

        let mut children = BTreeMap::new();
        for (nibble, group_ops) in groups {
            if let Some(c) = self.apply_fresh(group_ops, depth + 1, tag, list)? {
                children.insert(nibble, c);
            }
        }
        self.collapse(NibbleVec::new(), own_value, children)
    }

    /// Writes a candidate subtree bottom-up: children are materialized (and
    /// thus written) strictly before the parent that references their
    /// offsets, satisfying the children-before-parents ordering in §5.
    fn materialize(&self, candidate: Candidate, depth: u32, tag: u8, list: ChunkList) -> TrieResult<BuiltNode> {
        match candidate {
            Candidate::Existing(offset) => {
                let node = self.store.load(offset)?;
                Ok(BuiltNode {
                    offset,
                    hash: node.cached_hash.unwrap_or(EMPTY_TRIE_HASH),
                })
            }
            Candidate::New { path, value, children } => {
                let is_leaf = children.is_empty() && value.is_some();
                let mut child_mask: u16 = 0;
                for &nibble in children.keys() {
                    child_mask |= 1 << nibble;
                }

                let mut child_offsets = Vec::with_capacity(children.len());
                let mut child_hashes = Vec::with_capacity(children.len());
                for (_, child) in children {
                    let built = self.materialize(child, depth + 1, tag, list)?;
                    child_offsets.push(built.offset);
                    child_hashes.push(built.hash);
                }

                let mut node = Node {
                    child_mask,
                    path,
                    children: child_offsets,
                    value,
                    cached_hash: None,
                };

                let decision = self.state_machine.decide(depth, tag, is_leaf);
                let hash = match decision.hash_variant {
                    HashVariant::None => EMPTY_TRIE_HASH,
                    variant => self.hash_provider.hash_node(variant, &node, &child_hashes),
                };
                if decision.hash_variant != HashVariant::None {
                    node.cached_hash = Some(hash);
                }

                let bytes = node.encode();
                let (offset, vo) = self.store.pool.append_bytes(list, &bytes).map_err(TrieError::Pool)?;
                if decision.cache_this_node {
                    self.store.cache.insert(vo, node);
                }

                Ok(BuiltNode { offset, hash })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::NodeDecision;
    use triedb_pool::config::PoolConfig;

    struct ConstHashProvider;
    impl HashProvider for ConstHashProvider {
        fn hash_node(&self, _variant: HashVariant, _node: &Node, _children: &[[u8; 32]]) -> [u8; 32] {
            [0x42; 32]
        }
    }

    struct AlwaysCache;
    impl StateMachine for AlwaysCache {
        fn decide(&self, _depth: u32, _tag: u8, _is_leaf: bool) -> NodeDecision {
            NodeDecision {
                cache_this_node: true,
                compact_through_here: true,
                auto_expire: false,
                hash_variant: HashVariant::Generic,
            }
        }
    }

    fn test_engine(num_chunks: u64) -> UpdateEngine {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * num_chunks + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file); // keep the backing file alive for the pool's lifetime
        UpdateEngine::new(
            pool,
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            4,
            EngineConfig::default(),
        )
    }

    fn test_engine_with_nested_updates(num_chunks: u64) -> UpdateEngine {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * num_chunks + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file);
        UpdateEngine::with_value_placement(
            pool,
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            Some(Arc::new(crate::value_placement::TrailingOffsetPlacement)),
            4,
            EngineConfig::default(),
        )
    }

    fn key(nibbles: &[u8]) -> NibbleVec {
        nibbles.iter().copied().collect()
    }

    #[test]
    fn single_upsert_then_root_is_readable() {
        let engine = test_engine(16);
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3, 4]), b"dead".to_vec())], 1, false, true)
            .unwrap();
        assert_eq!(engine.read_root_for_version(1), Some(root));
        let node = engine.store().load(root).unwrap();
        assert!(node.is_leaf());
        assert_eq!(node.value.as_deref(), Some(b"dead".as_slice()));
        assert_eq!(node.path.as_slice(), &[1, 2, 3, 4]);
    }

    #[test]
    fn divergent_keys_produce_a_branch_with_two_children() {
        let engine = test_engine(16);
        let root = engine
            .upsert(
                vec![
                    Update::upsert(key(&[1, 2, 0xa]), b"one".to_vec()),
                    Update::upsert(key(&[1, 2, 0xb]), b"two".to_vec()),
                ],
                1,
                false,
                true,
            )
            .unwrap();
        let node = engine.store().load(root).unwrap();
        assert_eq!(node.path.as_slice(), &[1, 2]);
        assert_eq!(node.child_count(), 2);
        assert!(node.value.is_none());
    }

    #[test]
    fn second_version_builds_on_first() {
        let engine = test_engine(16);
        engine
            .upsert(vec![Update::upsert(key(&[1]), b"a".to_vec())], 1, false, true)
            .unwrap();
        let root2 = engine
            .upsert(vec![Update::upsert(key(&[2]), b"b".to_vec())], 2, true, true)
            .unwrap();
        let node = engine.store().load(root2).unwrap();
        assert_eq!(node.child_count(), 2);
        assert_eq!(engine.read_root_for_version(1).is_some(), true);
    }

    #[test]
    fn erase_of_only_key_collapses_to_empty_root() {
        let engine = test_engine(16);
        engine
            .upsert(vec![Update::upsert(key(&[9]), b"v".to_vec())], 1, false, true)
            .unwrap();
        let root2 = engine
            .upsert(vec![Update::erase(key(&[9]))], 2, false, true)
            .unwrap();
        let node = engine.store().load(root2).unwrap();
        assert_eq!(node.child_count(), 0);
        assert!(node.value.is_none());
    }

    #[test]
    fn strict_erase_of_missing_key_is_an_error() {
        let engine = test_engine(16);
        let result = engine.upsert(vec![Update::erase(key(&[1]))], 1, false, true);
        assert!(result.is_err());
    }

    #[test]
    fn path_compression_folds_single_child_branch_after_erase() {
        let engine = test_engine(16);
        engine
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
        let root2 = engine
            .upsert(vec![Update::erase(key(&[1, 0xa]))], 2, false, true)
            .unwrap();
        let node = engine.store().load(root2).unwrap();
        // only one child remains, and it carries no value of its own, so it
        // must have folded into a single leaf covering the full path.
        assert!(node.is_leaf());
        assert_eq!(node.path.as_slice(), &[1, 0xb]);
        assert_eq!(node.value.as_deref(), Some(b"two".as_slice()));
    }

    #[test]
    fn nested_updates_without_a_configured_value_placement_are_an_error() {
        let engine = test_engine(16);
        let result = engine.upsert(
            vec![Update::upsert_with_nested(
                key(&[1]),
                b"account".to_vec(),
                false,
                vec![Update::upsert(key(&[0xa]), b"slot".to_vec())],
            )],
            1,
            false,
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn nested_updates_build_a_storage_subtrie_embedded_in_the_leaf_value() {
        let engine = test_engine_with_nested_updates(16);
        let root = engine
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1]),
                    b"account-body".to_vec(),
                    false,
                    vec![Update::upsert(key(&[0xa, 0xb]), b"slot-one".to_vec())],
                )],
                1,
                false,
                true,
            )
            .unwrap();
        let node = engine.store().load(root).unwrap();
        assert!(node.is_leaf());
        let value = node.value.as_deref().unwrap();
        assert!(value.starts_with(b"account-body"));

        let placement = crate::value_placement::TrailingOffsetPlacement;
        let nested_root = placement.extract_nested_root(value).expect("nested root embedded");
        let nested_node = engine.store().load(nested_root).unwrap();
        assert!(nested_node.is_leaf());
        assert_eq!(nested_node.path.as_slice(), &[0xa, 0xb]);
        assert_eq!(nested_node.value.as_deref(), Some(b"slot-one".as_slice()));
    }

    #[test]
    fn nested_updates_extend_an_existing_subtrie_across_versions() {
        let engine = test_engine_with_nested_updates(32);
        let root1 = engine
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1]),
                    b"account-v1".to_vec(),
                    false,
                    vec![Update::upsert(key(&[0xa]), b"slot-a".to_vec())],
                )],
                1,
                false,
                true,
            )
            .unwrap();
        let placement = crate::value_placement::TrailingOffsetPlacement;
        let node1 = engine.store().load(root1).unwrap();
        let nested_root1 = placement.extract_nested_root(node1.value.as_deref().unwrap()).unwrap();

        let root2 = engine
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1]),
                    b"account-v2".to_vec(),
                    false,
                    vec![Update::upsert(key(&[0xb]), b"slot-b".to_vec())],
                )],
                2,
                false,
                true,
            )
            .unwrap();
        let node2 = engine.store().load(root2).unwrap();
        let nested_root2 = placement.extract_nested_root(node2.value.as_deref().unwrap()).unwrap();
        assert_ne!(nested_root1, nested_root2);

        let nested_branch = engine.store().load(nested_root2).unwrap();
        assert_eq!(nested_branch.child_count(), 2);
    }

    #[test]
    fn incarnation_abandons_the_prior_nested_subtrie() {
        let engine = test_engine_with_nested_updates(32);
        engine
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1]),
                    b"account-v1".to_vec(),
                    false,
                    vec![Update::upsert(key(&[0xa]), b"stale-slot".to_vec())],
                )],
                1,
                false,
                true,
            )
            .unwrap();

        let root2 = engine
            .upsert(
                vec![Update::upsert_with_nested(
                    key(&[1]),
                    b"account-resurrected".to_vec(),
                    true,
                    vec![Update::upsert(key(&[0xb]), b"fresh-slot".to_vec())],
                )],
                2,
                false,
                true,
            )
            .unwrap();
        let node2 = engine.store().load(root2).unwrap();
        let placement = crate::value_placement::TrailingOffsetPlacement;
        let nested_root2 = placement.extract_nested_root(node2.value.as_deref().unwrap()).unwrap();
        let nested_node2 = engine.store().load(nested_root2).unwrap();
        // only the fresh slot survives; the stale one from before the
        // incarnation is not reachable from the new nested root.
        assert!(nested_node2.is_leaf());
        assert_eq!(nested_node2.path.as_slice(), &[0xb]);
    }

    #[test]
    fn commit_clears_the_on_disk_dirty_bit_so_a_clean_reopen_trusts_the_front() {
        let engine = test_engine(16);
        engine
            .upsert(vec![Update::upsert(key(&[1, 2]), b"settled".to_vec())], 1, false, true)
            .unwrap();
        let pool = engine.store().pool.as_ref();
        assert!(!pool.front.is_dirty());
        assert!(!pool.back.is_dirty());
        assert!(!pool.load_dirty_bit(0).unwrap());
        assert!(!pool.load_dirty_bit(1).unwrap());
    }

    #[test]
    fn a_crash_between_front_and_back_mirroring_heals_on_reopen_and_keeps_the_prior_root() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 16 + 4096).unwrap();
        let path = file.path().to_path_buf();
        std::mem::forget(file);

        let config = PoolConfig::new(vec![path.clone()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        let engine = UpdateEngine::new(
            pool.clone(),
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            4,
            EngineConfig::default(),
        );
        let root = engine
            .upsert(vec![Update::upsert(key(&[1, 2, 3]), b"pre-crash".to_vec())], 1, false, true)
            .unwrap();

        // Simulate a crash that lands between the front mirror's update and
        // the back mirror catching up: mutate front alone, persist it, and
        // raise its on-disk dirty bit without ever mirroring to back.
        pool.front.allocate_chunk(ChunkList::Fast).unwrap();
        pool.persist_metadata().unwrap();
        pool.persist_dirty_bit(0, true).unwrap();
        drop(engine);
        drop(pool);

        let reopened_pool = Arc::new(StoragePool::open(PoolConfig::new(vec![path], 4096)).unwrap());
        assert!(!reopened_pool.front.is_dirty());
        let reopened_engine = UpdateEngine::new(
            reopened_pool,
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            4,
            EngineConfig::default(),
        );
        // The root ring itself is in-memory only (rebuilt by the loader from
        // its own log on restart); what crash recovery guarantees is that
        // the node data the pre-crash root points at is still there.
        let node = reopened_engine.store().load(root).unwrap();
        assert_eq!(node.value.as_deref(), Some(b"pre-crash".as_slice()));
    }
}
