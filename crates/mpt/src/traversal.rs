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

//! Async preorder traversal (C9, §4.8).
//!
//! [`traverse_blocking`] walks the whole subtree on the calling thread,
//! recursing through the call stack exactly like the update engine's own
//! descent. [`ParallelTraversal`] instead keeps per-node frames in an
//! explicit arena so a node whose child isn't cached can be suspended
//! without holding a stack frame open, and schedules those suspended
//! fetches through a depth-prioritized, left-sibling-biased queue bounded
//! by a concurrency limit — the shape a real io_uring-backed fetch would
//! need once [`crate::store::NodeStore`] grows an async load path. Until
//! then each "suspended" fetch still resolves with one synchronous pool
//! read; `concurrency_limit` governs how many are drained from the queue
//! per round rather than how many are in flight on the wire.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use triedb_pool::offset::PhysicalOffset;

use crate::codec::Node;
use crate::error::TrieResult;
use crate::store::NodeStore;

/// Implemented by the caller driving a traversal (e.g. a state-root diff,
/// an export, a consistency checker). Mirrors the update engine's own
/// depth-first shape: `down` is offered the chance to prune before a
/// subtree is ever read, `up` runs once that subtree (whatever survived
/// pruning) has been fully visited.
pub trait Visitor: Send {
    /// Returning `false` prunes this node's subtree — `up` is still called
    /// for this node, but no child is visited.
    fn down(&mut self, branch: u8, node: &Node) -> bool;
    fn up(&mut self, branch: u8, node: &Node);
    /// Per-child filter, checked before a present child is even queued for
    /// a fetch. Defaults to visiting every present child.
    fn should_visit(&mut self, _node: &Node, _branch: u8) -> bool {
        true
    }
}

/// Cooperative cancellation flag: set once a traversal's version has been
/// invalidated (rolled out of the history window mid-traversal) so
/// outstanding work can stop at the next frame boundary instead of
/// continuing to read nodes nobody can observe anymore.
#[derive(Clone)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::Acquire)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

fn traverse_blocking_impl(
    store: &NodeStore,
    branch: u8,
    node: &Node,
    visitor: &mut dyn Visitor,
    cancel: &CancellationToken,
) -> TrieResult<bool> {
    if cancel.is_cancelled() {
        return Ok(false);
    }
    if !visitor.down(branch, node) {
        return Ok(true);
    }
    for nibble in node.present_nibbles() {
        if !visitor.should_visit(node, nibble) {
            continue;
        }
        let slot = node.child_slot(nibble).expect("present_nibbles agrees with child_slot");
        let child = store.load(node.children[slot])?;
        if !traverse_blocking_impl(store, nibble, &child, visitor, cancel)? {
            return Ok(false);
        }
    }
    visitor.up(branch, node);
    Ok(true)
}

/// Walks the subtree rooted at `root` entirely on the calling thread.
/// Returns `Ok(true)` if the traversal ran to completion, `Ok(false)` if
/// it stopped early because `cancel` was set.
pub fn traverse_blocking(store: &NodeStore, root: PhysicalOffset, visitor: &mut dyn Visitor, cancel: &CancellationToken) -> TrieResult<bool> {
    let node = store.load(root)?;
    traverse_blocking_impl(store, 0, &node, visitor, cancel)
}

struct PendingFetch {
    depth: u32,
    sibling_rank: u32,
    branch: u8,
    offset: PhysicalOffset,
    parent_frame: usize,
}

impl PartialEq for PendingFetch {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.sibling_rank == other.sibling_rank
    }
}
impl Eq for PendingFetch {}

impl PartialOrd for PendingFetch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingFetch {
    /// Deeper nodes are serviced first (keeps the live frame arena from
    /// growing wide before it grows deep); among equal depth, lower
    /// sibling rank — i.e. the leftmost of up to three pending siblings —
    /// wins, biasing the scheduler toward left-to-right order within a
    /// round rather than an arbitrary one.
    fn cmp(&self, other: &Self) -> Ordering {
        self.depth.cmp(&other.depth).then_with(|| other.sibling_rank.cmp(&self.sibling_rank))
    }
}

struct Frame {
    branch: u8,
    node: Arc<Node>,
    remaining_children: usize,
    parent_frame: Option<usize>,
}

/// Bounded-concurrency preorder traversal driver (§4.8).
pub struct ParallelTraversal<'a> {
    store: &'a NodeStore,
    concurrency_limit: usize,
}

impl<'a> ParallelTraversal<'a> {
    pub fn new(store: &'a NodeStore, concurrency_limit: usize) -> Self {
        ParallelTraversal {
            store,
            concurrency_limit: concurrency_limit.max(1),
        }
    }

    pub fn run(&self, root: PhysicalOffset, visitor: &mut dyn Visitor, cancel: &CancellationToken) -> TrieResult<()> {
        let mut frames: Vec<Frame> = Vec::new();
        let mut queue: BinaryHeap<PendingFetch> = BinaryHeap::new();

        let root_node = self.store.load(root)?;
        self.open_frame(&mut frames, None, 0, root_node, 0, 0, visitor, &mut queue, cancel)?;

        while !cancel.is_cancelled() {
            let mut batch = Vec::with_capacity(self.concurrency_limit);
            for _ in 0..self.concurrency_limit {
                match queue.pop() {
                    Some(task) => batch.push(task),
                    None => break,
                }
            }
            if batch.is_empty() {
                break;
            }
            for task in batch {
                if cancel.is_cancelled() {
                    break;
                }
                let node = self.store.load(task.offset)?;
                self.open_frame(&mut frames, Some(task.parent_frame), task.branch, node, task.depth, task.sibling_rank, visitor, &mut queue, cancel)?;
            }
        }
        Ok(())
    }

    /// Opens a frame for `node`, calls `down`, and either queues its
    /// present children (cache misses) or recurses straight into them
    /// (cache hits, exactly like [`traverse_blocking_impl`] would) —
    /// matching the original traversal's own "if already materialized,
    /// recurse inline; otherwise suspend" split.
    #[allow(clippy::too_many_arguments)]
    fn open_frame(
        &self,
        frames: &mut Vec<Frame>,
        parent_frame: Option<usize>,
        branch: u8,
        node: Arc<Node>,
        depth: u32,
        sibling_rank: u32,
        visitor: &mut dyn Visitor,
        queue: &mut BinaryHeap<PendingFetch>,
        cancel: &CancellationToken,
    ) -> TrieResult<()> {
        let idx = frames.len();
        frames.push(Frame {
            branch,
            node: node.clone(),
            remaining_children: 0,
            parent_frame,
        });

        if cancel.is_cancelled() || !visitor.down(branch, &node) {
            self.close_frame(frames, idx, visitor);
            return Ok(());
        }

        let mut to_visit = Vec::new();
        for (rank, nibble) in node.present_nibbles().enumerate() {
            if visitor.should_visit(&node, nibble) {
                to_visit.push((rank as u32, nibble));
            }
        }
        if to_visit.is_empty() {
            self.close_frame(frames, idx, visitor);
            return Ok(());
        }

        frames[idx].remaining_children = to_visit.len();
        for (rank, nibble) in to_visit {
            let slot = node.child_slot(nibble).expect("present_nibbles agrees with child_slot");
            let child_offset = node.children[slot];
            let vo = self.store.virtual_offset_of(child_offset);
            if let Some(cached) = self.store.cache.find(vo) {
                self.open_frame(frames, Some(idx), nibble, cached, depth + 1, rank, visitor, queue, cancel)?;
            } else {
                queue.push(PendingFetch {
                    depth: depth + 1,
                    sibling_rank: rank,
                    branch: nibble,
                    offset: child_offset,
                    parent_frame: idx,
                });
            }
        }
        Ok(())
    }

    /// Calls `up` for `idx` and, once every sibling of its parent has also
    /// closed, recurses to close the parent — the post-order half of the
    /// traversal, driven by a remaining-children counter instead of a
    /// return value up a call stack, since frames may close in any order
    /// once their fetches are scheduled across rounds.
    fn close_frame(&self, frames: &mut Vec<Frame>, idx: usize, visitor: &mut dyn Visitor) {
        let (branch, node, parent) = {
            let f = &frames[idx];
            (f.branch, f.node.clone(), f.parent_frame)
        };
        visitor.up(branch, &node);
        if let Some(p) = parent {
            frames[p].remaining_children -= 1;
            if frames[p].remaining_children == 0 {
                self.close_frame(frames, p, visitor);
            }
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
        fn hash_node(&self, _variant: HashVariant, _node: &Node, _children: &[[u8; 32]]) -> [u8; 32] {
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

    fn test_engine() -> UpdateEngine {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096 * 16 + 4096).unwrap();
        let config = PoolConfig::new(vec![file.path().to_path_buf()], 4096).truncate();
        let pool = Arc::new(StoragePool::open(config).unwrap());
        std::mem::forget(file);
        UpdateEngine::new(
            pool,
            Arc::new(NodeCache::new(1 << 20)),
            Arc::new(AlwaysCache),
            Arc::new(ConstHashProvider),
            4,
            EngineConfig::default(),
        )
    }

    fn key(nibbles: &[u8]) -> NibbleVec {
        nibbles.iter().copied().collect()
    }

    struct CollectValues(Vec<Vec<u8>>);
    impl Visitor for CollectValues {
        fn down(&mut self, _branch: u8, _node: &Node) -> bool {
            true
        }
        fn up(&mut self, _branch: u8, node: &Node) {
            if let Some(v) = &node.value {
                self.0.push(v.clone());
            }
        }
    }

    #[test]
    fn blocking_traversal_visits_every_value() {
        let engine = test_engine();
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
        let mut visitor = CollectValues(Vec::new());
        let cancel = CancellationToken::new();
        let completed = traverse_blocking(engine.store(), root, &mut visitor, &cancel).unwrap();
        assert!(completed);
        visitor.0.sort();
        assert_eq!(visitor.0, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    struct PruneEverything;
    impl Visitor for PruneEverything {
        fn down(&mut self, _branch: u8, _node: &Node) -> bool {
            false
        }
        fn up(&mut self, _branch: u8, _node: &Node) {}
    }

    #[test]
    fn down_returning_false_prunes_without_aborting() {
        let engine = test_engine();
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
        let mut visitor = PruneEverything;
        let cancel = CancellationToken::new();
        let completed = traverse_blocking(engine.store(), root, &mut visitor, &cancel).unwrap();
        assert!(completed, "pruning the root's subtree should not be treated as cancellation");
    }

    #[test]
    fn cancellation_stops_a_blocking_traversal_early() {
        let engine = test_engine();
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
        let mut visitor = CollectValues(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let completed = traverse_blocking(engine.store(), root, &mut visitor, &cancel).unwrap();
        assert!(!completed);
    }

    #[test]
    fn parallel_traversal_visits_every_value() {
        let engine = test_engine();
        let root = engine
            .upsert(
                vec![
                    Update::upsert(key(&[1, 0xa]), b"one".to_vec()),
                    Update::upsert(key(&[1, 0xb]), b"two".to_vec()),
                    Update::upsert(key(&[2, 0xc]), b"three".to_vec()),
                ],
                1,
                false,
                true,
            )
            .unwrap();
        let mut visitor = CollectValues(Vec::new());
        let cancel = CancellationToken::new();
        let traversal = ParallelTraversal::new(engine.store(), 2);
        traversal.run(root, &mut visitor, &cancel).unwrap();
        visitor.0.sort();
        assert_eq!(visitor.0, vec![b"one".to_vec(), b"three".to_vec(), b"two".to_vec()]);
    }
}
