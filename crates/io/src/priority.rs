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

/// Per-operation priority, mapped to realtime/normal/idle I/O priority
/// classes on submission (Linux `IOPRIO_CLASS_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoPriority {
    Idle,
    Normal,
    Highest,
}

impl IoPriority {
    /// Linux ioprio value: class in the high bits, level (0 = best) in the
    /// low bits, matching `IOPRIO_PRIO_VALUE(class, level)`.
    pub fn to_ioprio(self) -> u16 {
        const IOPRIO_CLASS_RT: u16 = 1;
        const IOPRIO_CLASS_BE: u16 = 2;
        const IOPRIO_CLASS_IDLE: u16 = 3;
        const SHIFT: u16 = 13;
        match self {
            IoPriority::Highest => (IOPRIO_CLASS_RT << SHIFT) | 0,
            IoPriority::Normal => (IOPRIO_CLASS_BE << SHIFT) | 4,
            IoPriority::Idle => (IOPRIO_CLASS_IDLE << SHIFT) | 7,
        }
    }
}

impl Default for IoPriority {
    fn default() -> Self {
        IoPriority::Normal
    }
}
