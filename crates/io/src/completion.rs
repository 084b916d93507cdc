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

//! Typed sender/receiver I/O operations (C4): a thin wrapper over the raw
//! ring carrying the completion callback and result object for one
//! in-flight operation.

use crate::error::IoResult;

/// Opaque identifier for a pending completion, set as `user_data` on the
/// submission queue entry and echoed back on the completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

/// The result handed to a completion callback: number of bytes transferred
/// on success, or the kernel error.
pub type CompletionResult = IoResult<u32>;

/// A boxed completion callback. The executor owns the closure's lifetime
/// from submission until dispatch; re-initiating a sender (e.g. retrying
/// after EAGAIN) is a direct function call, never an exception or stack
/// unwind (see spec §9).
pub type CompletionCallback = Box<dyn FnOnce(CompletionResult) + Send>;

/// One record in the executor's pending-operation table (backed by a
/// `slab::Slab` in [`crate::executor::Executor`]).
pub struct PendingOp {
    pub callback: CompletionCallback,
    pub invalidated: bool,
}

impl PendingOp {
    pub fn new(callback: CompletionCallback) -> Self {
        PendingOp {
            callback,
            invalidated: false,
        }
    }

    /// Marks the operation invalidated: its callback will still run (the
    /// executor doesn't support mid-flight cancellation, per §4.3) but the
    /// callback is expected to short-circuit without acting on the result.
    pub fn invalidate(&mut self) {
        self.invalidated = true;
    }
}
