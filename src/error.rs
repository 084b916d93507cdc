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

//! Fatal-error handling and exit codes (§7): the one place a standalone
//! utility embedding this crate decides what to print and what to return
//! from `main`.

use std::fmt;

/// Clean shutdown, no error.
pub const EXIT_OK: i32 = 0;
/// Metadata corruption or another condition §7 classifies as fatal.
pub const EXIT_FATAL: i32 = 1;

/// A condition §7 classifies as fatal: a storage pool that failed to open
/// (bad magic, config-hash mismatch, both metadata mirrors dirty), or
/// cross-thread misuse of the update engine. Deliberately not a `TrieError`
/// variant — nothing upstream of [`abort_on_fatal`] is meant to pattern
/// match on one of these and recover.
#[derive(Debug)]
pub struct FatalError {
    pub context: &'static str,
    pub detail: String,
}

impl FatalError {
    pub fn new(context: &'static str, detail: impl fmt::Display) -> Self {
        FatalError {
            context,
            detail: detail.to_string(),
        }
    }
}

impl fmt::Display for FatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.detail)
    }
}

impl std::error::Error for FatalError {}

/// Logs a single-line diagnostic and terminates the process without
/// unwinding, matching `triedb_pool::error::FatalPoolError::abort`'s
/// "print errno and context, then terminate" contract at the crate
/// boundary a caller actually links against.
pub fn abort_on_fatal(err: &FatalError) -> ! {
    error!("fatal: {err}");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context_and_detail() {
        let err = FatalError::new("opening storage pool", "device magic mismatch on /dev/foo");
        assert_eq!(err.to_string(), "opening storage pool: device magic mismatch on /dev/foo");
    }
}
