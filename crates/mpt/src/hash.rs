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

//! The external hash provider: RLP encoding and Keccak-256 are out of scope
//! for this crate (§1); this trait is the seam the update engine calls
//! through to recompute a node's cached subtree hash.

use crate::codec::Node;
use crate::statemachine::HashVariant;

pub const EMPTY_TRIE_HASH: [u8; 32] = [0u8; 32];

/// Implemented by the execution client's RLP/Keccak layer. `children_hashes`
/// are the already-computed subtree hashes of this node's present children,
/// in child-index order, so the provider never needs to re-read child bytes.
pub trait HashProvider: Send + Sync {
    fn hash_node(&self, variant: HashVariant, node: &Node, children_hashes: &[[u8; 32]]) -> [u8; 32];
}

/// A provider usable only when every node in a trie uses
/// [`HashVariant::None`] — e.g. scratch tries in tests that don't exercise
/// Merkle-root invariants. Panics if asked to hash anything else, since a
/// silent fallback would mask a caller bug.
pub struct NullHashProvider;

impl HashProvider for NullHashProvider {
    fn hash_node(&self, variant: HashVariant, _node: &Node, _children_hashes: &[[u8; 32]]) -> [u8; 32] {
        match variant {
            HashVariant::None => EMPTY_TRIE_HASH,
            other => panic!("NullHashProvider cannot hash variant {other:?}"),
        }
    }
}
