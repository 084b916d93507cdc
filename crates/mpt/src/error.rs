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

use derive_more::{Display, From};

use triedb_io::error::IoError;
use triedb_pool::error::PoolError;

#[derive(Debug, Display, From)]
pub enum TrieError {
    #[display(fmt = "version {_0} has already left the history window")]
    VersionNoLongerExists(u64),
    #[display(fmt = "erase of nonexistent key at nibble depth {_0}")]
    EraseOfNonexistentKey(usize),
    #[display(fmt = "upsert batch is not sorted by key at index {_0}")]
    UnsortedBatch(usize),
    #[display(fmt = "node at {_0:?} failed to decode: {_1}")]
    Corrupt(triedb_pool::offset::PhysicalOffset, String),
    #[from]
    Pool(PoolError),
    #[from]
    Io(IoError),
}

impl std::error::Error for TrieError {}

pub type TrieResult<T> = Result<T, TrieError>;

/// Outcome of a single-key versioned lookup (§4.9). Kept distinct from
/// [`TrieError`] because most of these are expected, common results rather
/// than error conditions — a caller switches on the outcome, it doesn't
/// propagate it with `?`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FindOutcome {
    Found(Vec<u8>),
    NotFound,
    /// The nibble path diverged from the key before exhausting either,
    /// i.e. the key is provably absent without needing to read further.
    KeyEndsEarlierThanNode,
    KeyMismatch,
    BranchNotExist,
    VersionNoLongerExists,
    /// The lookup touched an uncached node and must resume from the I/O
    /// executor thread once the read completes.
    NeedToContinueInIoThread,
}
