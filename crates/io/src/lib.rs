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

//! Single-threaded cooperative I/O executor.
//!
//! Each [`Executor`] owns a primary completion ring (reads + thread-safe
//! messages) and an optional dedicated write ring, a pool of pre-registered
//! fixed buffers, and a non-blocking message pipe armed as a multishot poll
//! on the primary ring. Only the thread that created an executor may submit
//! to it or poll it; every cross-thread handoff goes through
//! [`message::MessageSender`].

#[macro_use]
extern crate log;

pub mod buffers;
pub mod completion;
pub mod error;
#[cfg(target_os = "linux")]
pub mod executor;
pub mod message;
pub mod op;
pub mod priority;

pub use completion::CompletionToken;
pub use error::{IoError, IoResult};
#[cfg(target_os = "linux")]
pub use executor::{Executor, ExecutorConfig, PollMode};
pub use message::MessageSender;
pub use op::{Operation, OperationId, OperationKind};
pub use priority::IoPriority;
