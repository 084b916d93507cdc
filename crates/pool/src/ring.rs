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

//! Rolling ring of per-version root offsets (§3, §4.2).

use parking_lot::RwLock;

use crate::offset::{PhysicalOffset, INVALID_PHYSICAL_OFFSET};

/// Circular buffer of length `W` storing the physical root offset per
/// version, indexed by `version mod W`.
pub struct RootOffsetRing {
    slots: RwLock<Vec<u64>>,
    window: u64,
    max_version: RwLock<Option<u64>>,
}

impl RootOffsetRing {
    pub fn new(window: u64) -> Self {
        assert!(window > 0, "version window must be non-zero");
        RootOffsetRing {
            slots: RwLock::new(vec![INVALID_PHYSICAL_OFFSET; window as usize]),
            window,
            max_version: RwLock::new(None),
        }
    }

    pub fn window(&self) -> u64 {
        self.window
    }

    pub fn max_version(&self) -> Option<u64> {
        *self.max_version.read()
    }

    /// Smallest version whose slot may still hold a live root: `max_version
    /// - W + 1`, clamped at the version this ring has actually seen.
    pub fn min_valid_version(&self) -> Option<u64> {
        self.max_version.read().map(|max| max.saturating_sub(self.window - 1))
    }

    /// Advances `max_version` and writes `offset` into slot `v mod W`.
    pub fn append(&self, v: u64, offset: PhysicalOffset) {
        let mut slots = self.slots.write();
        slots[(v % self.window) as usize] = offset.raw();
        let mut max = self.max_version.write();
        *max = Some(max.map_or(v, |m| m.max(v)));
    }

    /// Overwrites the offset for an already-occupied slot, used to
    /// invalidate a version (writing INVALID) or to record the result of a
    /// compaction relocation.
    pub fn update(&self, v: u64, offset: PhysicalOffset) {
        let mut slots = self.slots.write();
        slots[(v % self.window) as usize] = offset.raw();
    }

    /// Reads the root offset recorded for version `v`, if that slot is
    /// still within the live window and has not been invalidated.
    pub fn read(&self, v: u64) -> Option<PhysicalOffset> {
        let max = (*self.max_version.read())?;
        if v > max {
            return None;
        }
        if let Some(min) = self.min_valid_version() {
            if v < min {
                return None;
            }
        }
        let raw = self.slots.read()[(v % self.window) as usize];
        let offset = PhysicalOffset::from_raw(raw);
        if offset.is_invalid() {
            None
        } else {
            Some(offset)
        }
    }

    /// Invalidates the oldest live slot, used when the version window's
    /// trailing edge retires to make room for a new version.
    pub fn invalidate(&self, v: u64) {
        self.update(v, PhysicalOffset::INVALID);
    }

    /// Renumbers a version without copying data: jumps `max_version`
    /// forward to `dest`, inheriting `src`'s offset at the new slot.
    pub fn fast_forward_next_version(&self, src: u64, dest: u64) {
        if let Some(offset) = self.read(src) {
            self.append(dest, offset);
        } else {
            let mut max = self.max_version.write();
            *max = Some(max.map_or(dest, |m| m.max(dest)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_round_trip() {
        let ring = RootOffsetRing::new(4);
        ring.append(1, PhysicalOffset::new(1, 100, 1));
        assert_eq!(ring.read(1).unwrap().byte_offset(), 100);
        assert_eq!(ring.min_valid_version(), Some(1));
    }

    #[test]
    fn version_rollover_expires_old_slots() {
        let ring = RootOffsetRing::new(4);
        for v in 1..=6u64 {
            ring.append(v, PhysicalOffset::new(1, v, 1));
        }
        assert_eq!(ring.min_valid_version(), Some(3));
        assert!(ring.read(3).is_some());
        // slot for version 2 has been overwritten by version 6 (6 % 4 == 2)
        assert!(ring.read(2).is_none());
    }

    #[test]
    fn invalidate_marks_slot_unreadable() {
        let ring = RootOffsetRing::new(4);
        ring.append(1, PhysicalOffset::new(1, 10, 1));
        ring.invalidate(1);
        assert!(ring.read(1).is_none());
    }

    #[test]
    fn fast_forward_inherits_offset() {
        let ring = RootOffsetRing::new(8);
        ring.append(1, PhysicalOffset::new(1, 42, 1));
        ring.fast_forward_next_version(1, 5);
        assert_eq!(ring.read(5).unwrap().byte_offset(), 42);
        assert_eq!(ring.max_version(), Some(5));
    }
}
