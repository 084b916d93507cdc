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

//! The state-machine hook: the sole mechanism by which the core learns
//! domain semantics. It never inspects value bytes (§6).

/// Which hash computation to use for a node's cached subtree hash. RLP
/// encoding and Keccak-256 itself live outside the core (§1); this tags
/// *which* external variant applies so the core can ask for it without
/// depending on account/receipt/transaction types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashVariant {
    None,
    AccountLeaf,
    StorageLeaf,
    ReceiptLeaf,
    Generic,
}

/// Per-node decision returned by [`StateMachine::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeDecision {
    pub cache_this_node: bool,
    pub compact_through_here: bool,
    pub auto_expire: bool,
    pub hash_variant: HashVariant,
}

/// Implemented by the external caller (account trie, storage trie, receipt
/// trie, ...) and consulted once per node materialized during an upsert.
/// Keyed by the node's current trie depth and a caller-supplied subtrie-type
/// tag so one engine instance can serve nested tries (e.g. an account trie
/// whose leaves carry a storage subtrie) without the core distinguishing
/// them itself.
pub trait StateMachine: Send + Sync {
    fn decide(&self, depth: u32, subtrie_tag: u8, is_leaf: bool) -> NodeDecision;
}

/// A state machine that caches everything at or above a fixed depth,
/// compacts everywhere, never auto-expires, and always uses the generic
/// hash variant. Useful as a default for tests and for standalone use of
/// the trie without an execution-client caller.
pub struct DefaultStateMachine {
    pub cache_depth_threshold: u32,
}

impl StateMachine for DefaultStateMachine {
    fn decide(&self, depth: u32, _subtrie_tag: u8, _is_leaf: bool) -> NodeDecision {
        NodeDecision {
            cache_this_node: depth <= self.cache_depth_threshold,
            compact_through_here: true,
            auto_expire: false,
            hash_variant: HashVariant::Generic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_state_machine_caches_up_to_threshold() {
        let sm = DefaultStateMachine { cache_depth_threshold: 4 };
        assert!(sm.decide(0, 0, false).cache_this_node);
        assert!(sm.decide(4, 0, false).cache_this_node);
        assert!(!sm.decide(5, 0, false).cache_this_node);
    }
}
