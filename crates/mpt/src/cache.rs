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

//! Process-wide LRU node cache (C6), keyed by virtual chunk offset and
//! bounded by a byte budget. Shared by readers and the update path.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use triedb_pool::offset::VirtualOffset;

use crate::codec::Node;

struct Entry {
    node: Arc<Node>,
    bytes: usize,
    prev: Option<VirtualOffset>,
    next: Option<VirtualOffset>,
}

/// An intrusive doubly-linked LRU: `FxHashMap` gives O(1) lookup, the
/// prev/next links embedded in each [`Entry`] give O(1) touch/evict without
/// a second indirection through an order structure.
struct Inner {
    map: FxHashMap<VirtualOffset, Entry>,
    head: Option<VirtualOffset>, // most recently used
    tail: Option<VirtualOffset>, // least recently used
    total_bytes: usize,
    byte_budget: usize,
}

impl Inner {
    fn detach(&mut self, key: VirtualOffset) {
        let (prev, next) = {
            let e = &self.map[&key];
            (e.prev, e.next)
        };
        match prev {
            Some(p) => self.map.get_mut(&p).unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.map.get_mut(&n).unwrap().prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, key: VirtualOffset) {
        let old_head = self.head;
        if let Some(h) = old_head {
            self.map.get_mut(&h).unwrap().prev = Some(key);
        }
        {
            let e = self.map.get_mut(&key).unwrap();
            e.prev = None;
            e.next = old_head;
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn touch(&mut self, key: VirtualOffset) {
        if self.head == Some(key) {
            return;
        }
        self.detach(key);
        self.push_front(key);
    }

    fn evict_to_budget(&mut self) {
        while self.total_bytes > self.byte_budget {
            let Some(tail) = self.tail else { break };
            self.detach(tail);
            if let Some(entry) = self.map.remove(&tail) {
                self.total_bytes -= entry.bytes;
            }
        }
    }
}

/// Bounded-bytes LRU of hot nodes. `find` is a non-evicting lookup that
/// still touches LRU order; `insert` is idempotent on key collision,
/// returning the entry already present rather than clobbering it (two
/// concurrent fetches of the same child must agree on one cached object).
pub struct NodeCache {
    inner: Mutex<Inner>,
}

impl NodeCache {
    pub fn new(byte_budget: usize) -> Self {
        NodeCache {
            inner: Mutex::new(Inner {
                map: FxHashMap::default(),
                head: None,
                tail: None,
                total_bytes: 0,
                byte_budget,
            }),
        }
    }

    pub fn find(&self, key: VirtualOffset) -> Option<Arc<Node>> {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&key) {
            inner.touch(key);
            Some(inner.map[&key].node.clone())
        } else {
            None
        }
    }

    /// Inserts `node` under `key`. If `key` is already present, the
    /// existing entry wins and is returned (idempotent on collision).
    pub fn insert(&self, key: VirtualOffset, node: Node) -> Arc<Node> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.map.get(&key) {
            let node = existing.node.clone();
            inner.touch(key);
            return node;
        }

        let bytes = approx_size(&node);
        let node = Arc::new(node);
        inner.map.insert(
            key,
            Entry {
                node: node.clone(),
                bytes,
                prev: None,
                next: None,
            },
        );
        inner.push_front(key);
        inner.total_bytes += bytes;
        inner.evict_to_budget();
        node
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().total_bytes
    }

    /// Removes an entry outright, used when a weak parent->child reference
    /// is found stale (the parent's recorded virtual offset for that child
    /// no longer matches) and the caller wants to force a re-fetch.
    pub fn invalidate(&self, key: VirtualOffset) {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(&key) {
            inner.detach(key);
            if let Some(e) = inner.map.remove(&key) {
                inner.total_bytes -= e.bytes;
            }
        }
    }
}

fn approx_size(node: &Node) -> usize {
    let mut size = std::mem::size_of::<Node>();
    size += node.children.len() * std::mem::size_of::<triedb_pool::offset::PhysicalOffset>();
    size += node.path.len();
    size += node.value.as_ref().map_or(0, |v| v.len());
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn leaf(n: u8) -> Node {
        Node::leaf(smallvec![n], vec![n; 16])
    }

    #[test]
    fn insert_then_find_touches_lru_order() {
        let cache = NodeCache::new(1 << 20);
        let key = VirtualOffset::new(1, 0);
        cache.insert(key, leaf(1));
        assert!(cache.find(key).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn insert_is_idempotent_on_collision() {
        let cache = NodeCache::new(1 << 20);
        let key = VirtualOffset::new(1, 0);
        let a = cache.insert(key, leaf(1));
        let b = cache.insert(key, leaf(2));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn eviction_is_strictly_bytes_based() {
        let node_size = approx_size(&leaf(0));
        let cache = NodeCache::new(node_size * 2 + 1);
        for i in 0..5u8 {
            cache.insert(VirtualOffset::new(i as u32, 0), leaf(i));
        }
        assert!(cache.total_bytes() <= node_size * 2 + 1);
        // most recently inserted entries survive
        assert!(cache.find(VirtualOffset::new(4, 0)).is_some());
        assert!(cache.find(VirtualOffset::new(0, 0)).is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = NodeCache::new(1 << 20);
        let key = VirtualOffset::new(1, 0);
        cache.insert(key, leaf(1));
        cache.invalidate(key);
        assert!(cache.find(key).is_none());
    }
}
