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

#[derive(Debug, Display, From)]
pub enum IoError {
    #[display(fmt = "chunk offset {_0:#x} is not DISK_PAGE aligned")]
    Misaligned(u64),
    #[display(fmt = "buffer of {_0} bytes exceeds the pool's registered buffer size {_1}")]
    BufferTooLarge(usize, usize),
    #[display(fmt = "no free buffer available and none in flight to wait on")]
    BufferPoolExhausted,
    #[display(fmt = "executor accessed from non-owning thread")]
    WrongThread,
    #[from]
    Kernel(std::io::Error),
}

impl std::error::Error for IoError {}

pub type IoResult<T> = Result<T, IoError>;
