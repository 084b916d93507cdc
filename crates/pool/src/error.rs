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
use std::io;

/// Non-fatal errors returned by the pool's configuration and lookup paths.
///
/// Raw device I/O failures on the metadata path are deliberately *not*
/// modeled here: per spec they are fatal and handled by `abort_on_fatal`
/// in the root crate, not propagated as a `Result`.
#[derive(Debug, Display, From)]
pub enum PoolError {
    #[display(fmt = "device magic mismatch on {_0}")]
    BadMagic(String),
    #[display(fmt = "config hash mismatch across devices: {_0:#010x} != {_1:#010x}")]
    ConfigHashMismatch(u32, u32),
    #[display(fmt = "zoned devices are not supported; refusing to open {_0}")]
    ZonedDeviceRefused(String),
    #[display(fmt = "chunk capacity must be a power of two, got {_0}")]
    ChunkCapacityNotPowerOfTwo(u64),
    #[display(fmt = "chunk {_0} list is empty")]
    ListExhausted(&'static str),
    #[display(fmt = "write of {requested} bytes would exceed chunk capacity {capacity}", requested = _0, capacity = _1)]
    ChunkCapacityExceeded(u64, u64),
    #[display(fmt = "offset {_0:#x} is not DISK_PAGE aligned")]
    Misaligned(u64),
    #[display(fmt = "both metadata mirrors are dirty and allow_dirty was not set")]
    BothMirrorsDirty,
    #[from]
    Io(io::Error),
}

impl std::error::Error for PoolError {}

pub type PoolResult<T> = Result<T, PoolError>;

/// A condition that per spec §7 is always fatal: the process must print the
/// diagnostic and terminate, never unwind. Kept as a distinct type so that
/// call sites which can legitimately recover (e.g. callers probing whether a
/// device is zoned) are not forced through the abort path.
#[derive(Debug, Display)]
#[display(fmt = "{context}: {source}")]
pub struct FatalPoolError {
    pub context: &'static str,
    pub source: io::Error,
}

impl FatalPoolError {
    pub fn new(context: &'static str, source: io::Error) -> Self {
        FatalPoolError { context, source }
    }

    /// Prints a single-line diagnostic with errno and context, then aborts
    /// the process. Matches the teacher's `ethcore-io` worker panic handling
    /// in spirit, but this path never unwinds: fatal metadata corruption must
    /// not leave half-written mirrors behind.
    pub fn abort(&self) -> ! {
        error!(
            "fatal storage pool error: {} (errno {:?})",
            self.context,
            self.source.raw_os_error()
        );
        std::process::abort()
    }
}
