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

//! Versioned Merkle Patricia Trie on top of `triedb-pool`.
//!
//! Owns node layout and caching (`codec`, `store`, `cache`), the update
//! engine that turns a batch of key/value writes into a new version
//! (`engine`), the reclamation sweep that keeps live chunks bounded
//! (`compactor`), and the two read paths — point lookups (`find`) and
//! whole-subtree walks (`traversal`) — that run against whatever version a
//! caller pins. `statemachine` and `hash` are the seams a host crate
//! (account trie vs. storage trie vs. something else entirely) plugs its
//! own per-node caching policy and hash function into; `value_placement`
//! is the narrower seam consulted only when an upsert carries nested
//! updates, for embedding a subtrie's root into its parent leaf's value.

#[macro_use]
extern crate log;

pub mod cache;
pub mod codec;
pub mod compactor;
pub mod engine;
pub mod error;
pub mod find;
pub mod hash;
pub mod nibble;
pub mod statemachine;
pub mod store;
pub mod traversal;
pub mod value_placement;

pub use cache::NodeCache;
pub use codec::Node;
pub use compactor::Compactor;
pub use engine::{EngineConfig, Update, UpdateEngine};
pub use error::{FindOutcome, TrieError, TrieResult};
pub use find::{find, find_from, find_versioned, FindMode};
pub use hash::{HashProvider, NullHashProvider, EMPTY_TRIE_HASH};
pub use nibble::NibbleVec;
pub use statemachine::{DefaultStateMachine, HashVariant, NodeDecision, StateMachine};
pub use store::NodeStore;
pub use traversal::{traverse_blocking, CancellationToken, ParallelTraversal, Visitor};
pub use value_placement::{TrailingOffsetPlacement, ValuePlacement};
