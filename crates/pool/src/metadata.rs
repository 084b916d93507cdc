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

//! Chunk metadata table and the twin-mirror dirty-bit protocol (§4.2).
//!
//! Two copies of the same metadata live at the head of the conventional
//! chunk. Every mutation is applied to the front copy under a dirty guard,
//! mirrored to the back copy, then the dirty bit is cleared. On open: both
//! clean and identical -> use either; one dirty -> heal from the clean one;
//! both dirty -> fail unless `allow_dirty`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{PoolError, PoolResult};

/// Which intrusive list a sequential chunk currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkList {
    Free,
    Fast,
    Slow,
}

/// Per-chunk metadata row. Held inside [`MetadataMirror`]'s table.
#[derive(Debug)]
pub struct ChunkMetadata {
    pub device_index: u16,
    pub position_within_device: u32,
    /// Two 10-bit halves so the 20-bit counter can be bumped atomically
    /// without tearing under concurrent readers of the metadata page.
    insertion_count_lo: AtomicU32,
    insertion_count_hi: AtomicU32,
    pub list: Mutex<ChunkList>,
    pub prev: Mutex<Option<u32>>,
    pub next: Mutex<Option<u32>>,
    /// Append-only chunks only: bytes already reserved against this chunk's
    /// capacity. Random-access (conventional) chunks leave this at 0.
    pub bytes_used: AtomicU64,
}

impl ChunkMetadata {
    pub fn new(device_index: u16, position_within_device: u32) -> Self {
        ChunkMetadata {
            device_index,
            position_within_device,
            insertion_count_lo: AtomicU32::new(0),
            insertion_count_hi: AtomicU32::new(0),
            list: Mutex::new(ChunkList::Free),
            prev: Mutex::new(None),
            next: Mutex::new(None),
            bytes_used: AtomicU64::new(0),
        }
    }

    pub fn insertion_count(&self) -> u32 {
        let lo = self.insertion_count_lo.load(Ordering::Acquire) & 0x3ff;
        let hi = self.insertion_count_hi.load(Ordering::Acquire) & 0x3ff;
        (hi << 10) | lo
    }

    /// Assigns a new insertion count when the chunk is placed on a list,
    /// written through the two 10-bit halves independently so a torn read
    /// from the metadata mmap never observes a value outside [old, new].
    pub fn set_insertion_count(&self, count: u32) {
        self.insertion_count_lo
            .store(count & 0x3ff, Ordering::Release);
        self.insertion_count_hi
            .store((count >> 10) & 0x3ff, Ordering::Release);
    }

    pub fn reserve_bytes(&self, n: u64, capacity: u64) -> PoolResult<u64> {
        loop {
            let used = self.bytes_used.load(Ordering::Acquire);
            let new_used = used
                .checked_add(n)
                .ok_or(PoolError::ChunkCapacityExceeded(n, capacity))?;
            if new_used > capacity {
                return Err(PoolError::ChunkCapacityExceeded(new_used, capacity));
            }
            if self
                .bytes_used
                .compare_exchange(used, new_used, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(used);
            }
        }
    }

    /// A trim only ever reduces the byte-used counter, typically to zero.
    pub fn trim_to(&self, keep_bytes: u64) {
        self.bytes_used.fetch_min(keep_bytes, Ordering::AcqRel);
    }
}

/// One of the two redundant on-device metadata copies.
pub struct MetadataMirror {
    pub chunks: Vec<ChunkMetadata>,
    pub free_head: Mutex<Option<u32>>,
    pub fast_head: Mutex<Option<u32>>,
    pub slow_head: Mutex<Option<u32>>,
    pub fast_offset: AtomicU64,
    pub slow_offset: AtomicU64,
    pub compact_offset_fast: Mutex<crate::offset::VirtualOffset>,
    pub compact_offset_slow: Mutex<crate::offset::VirtualOffset>,
    next_insertion_count: AtomicU32,
    dirty: std::sync::atomic::AtomicBool,
}

impl MetadataMirror {
    pub fn new(num_chunks: usize) -> Self {
        let mut chunks = Vec::with_capacity(num_chunks);
        for i in 0..num_chunks {
            chunks.push(ChunkMetadata::new(0, i as u32));
        }
        MetadataMirror {
            chunks,
            free_head: Mutex::new(None),
            fast_head: Mutex::new(None),
            slow_head: Mutex::new(None),
            fast_offset: AtomicU64::new(0),
            slow_offset: AtomicU64::new(0),
            compact_offset_fast: Mutex::new(crate::offset::VirtualOffset::new(0, 0)),
            compact_offset_slow: Mutex::new(crate::offset::VirtualOffset::new(0, 0)),
            next_insertion_count: AtomicU32::new(0),
            dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Seeds the free list with every chunk, in ascending id order. Called
    /// once by `StoragePool::open` for a freshly truncated pool; an existing
    /// pool instead restores list membership via [`Self::decode_into`].
    pub fn seed_free_list(&self) {
        let mut prev: Option<u32> = None;
        for i in 0..self.chunks.len() as u32 {
            *self.chunks[i as usize].prev.lock() = prev;
            *self.chunks[i as usize].next.lock() = None;
            if let Some(p) = prev {
                *self.chunks[p as usize].next.lock() = Some(i);
            }
            prev = Some(i);
        }
        *self.free_head.lock() = if self.chunks.is_empty() { None } else { Some(0) };
    }

    fn head_mutex(&self, list: ChunkList) -> &Mutex<Option<u32>> {
        match list {
            ChunkList::Free => &self.free_head,
            ChunkList::Fast => &self.fast_head,
            ChunkList::Slow => &self.slow_head,
        }
    }

    /// Unlinks `chunk_id` from whichever list it currently heads or follows
    /// within `list`, fixing up neighbor pointers and the list head if needed.
    fn unlink(&self, list: ChunkList, chunk_id: u32) {
        let prev = *self.chunks[chunk_id as usize].prev.lock();
        let next = *self.chunks[chunk_id as usize].next.lock();
        match prev {
            Some(p) => *self.chunks[p as usize].next.lock() = next,
            None => *self.head_mutex(list).lock() = next,
        }
        if let Some(n) = next {
            *self.chunks[n as usize].prev.lock() = prev;
        }
    }

    /// Prepends `chunk_id` onto `list`'s head, tagging it with a fresh
    /// insertion count so virtual-offset ordering reflects arrival order.
    fn push_front(&self, list: ChunkList, chunk_id: u32) {
        let old_head = *self.head_mutex(list).lock();
        *self.chunks[chunk_id as usize].prev.lock() = None;
        *self.chunks[chunk_id as usize].next.lock() = old_head;
        if let Some(h) = old_head {
            *self.chunks[h as usize].prev.lock() = Some(chunk_id);
        }
        *self.head_mutex(list).lock() = Some(chunk_id);
        *self.chunks[chunk_id as usize].list.lock() = list;
        let count = self.next_insertion_count.fetch_add(1, Ordering::AcqRel);
        self.chunks[chunk_id as usize].set_insertion_count(count);
    }

    /// Pops a chunk off the free list and moves it onto `list`'s head,
    /// assigning it a fresh insertion count. `Err(ListExhausted)` means the
    /// caller is out of space, which per §4.6 is a fatal condition on the
    /// upsert path.
    pub fn allocate_chunk(&self, list: ChunkList) -> PoolResult<u32> {
        let chunk_id = self
            .free_head
            .lock()
            .ok_or(PoolError::ListExhausted("free"))?;
        self.unlink(ChunkList::Free, chunk_id);
        self.push_front(list, chunk_id);
        self.chunks[chunk_id as usize].bytes_used.store(0, Ordering::Release);
        Ok(chunk_id)
    }

    /// Moves `chunk_id` from its current list to `list`'s head without
    /// reassigning an insertion count (used by the compactor, which must
    /// preserve relative disk position for chunks it merely relists).
    pub fn move_chunk(&self, from: ChunkList, to: ChunkList, chunk_id: u32) {
        self.unlink(from, chunk_id);
        let old_head = *self.head_mutex(to).lock();
        *self.chunks[chunk_id as usize].prev.lock() = None;
        *self.chunks[chunk_id as usize].next.lock() = old_head;
        if let Some(h) = old_head {
            *self.chunks[h as usize].prev.lock() = Some(chunk_id);
        }
        *self.head_mutex(to).lock() = Some(chunk_id);
        *self.chunks[chunk_id as usize].list.lock() = to;
    }

    /// Releases a chunk back to the free list after compaction has relocated
    /// its live contents and the metadata mirror recording that move has
    /// been committed (§4.7).
    pub fn release_chunk(&self, from: ChunkList, chunk_id: u32) {
        self.unlink(from, chunk_id);
        self.chunks[chunk_id as usize].trim_to(0);
        let old_head = *self.free_head.lock();
        *self.chunks[chunk_id as usize].prev.lock() = None;
        *self.chunks[chunk_id as usize].next.lock() = old_head;
        if let Some(h) = old_head {
            *self.chunks[h as usize].prev.lock() = Some(chunk_id);
        }
        *self.free_head.lock() = Some(chunk_id);
        *self.chunks[chunk_id as usize].list.lock() = ChunkList::Free;
    }

    /// Chunk currently at the head of `list`, i.e. the one most recently
    /// placed there and thus the active write target.
    pub fn head(&self, list: ChunkList) -> Option<u32> {
        *self.head_mutex(list).lock()
    }

    /// Iterates a list tail-to-head is not supported; this walks head-first
    /// (most recently inserted first), which is what the compactor and
    /// free-list accounting both need.
    pub fn list_iter(&self, list: ChunkList) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = self.head(list);
        while let Some(id) = cur {
            out.push(id);
            cur = *self.chunks[id as usize].next.lock();
        }
        out
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    /// Serializes the per-chunk table and frontiers into a flat byte buffer
    /// suitable for writing into the mmap'd conventional chunk backing this
    /// mirror. The dirty bit itself is not included: callers raise/clear it
    /// around the write via [`DirtyGuard`], matching the protocol in §4.2
    /// where the dirty flag brackets the mutation rather than being part of
    /// the payload it guards.
    pub fn encode(&self) -> Vec<u8> {
        use byteorder::{LittleEndian, WriteBytesExt};
        let mut buf = Vec::with_capacity(16 + self.chunks.len() * 24);
        buf.write_u64::<LittleEndian>(self.chunks.len() as u64).unwrap();
        buf.write_u64::<LittleEndian>(self.fast_offset.load(Ordering::Acquire)).unwrap();
        buf.write_u64::<LittleEndian>(self.slow_offset.load(Ordering::Acquire)).unwrap();
        for c in &self.chunks {
            buf.write_u32::<LittleEndian>(c.insertion_count()).unwrap();
            buf.write_u64::<LittleEndian>(c.bytes_used.load(Ordering::Acquire)).unwrap();
            let tag: u8 = match *c.list.lock() {
                ChunkList::Free => 0,
                ChunkList::Fast => 1,
                ChunkList::Slow => 2,
            };
            buf.push(tag);
            buf.extend_from_slice(&[0u8; 7]); // pad to 8-byte alignment
        }
        buf
    }

    /// Inverse of [`Self::encode`]; used by [`recover`] to heal one mirror
    /// from the other.
    pub fn decode_into(&self, bytes: &[u8]) {
        use byteorder::{LittleEndian, ReadBytesExt};
        let mut cur = std::io::Cursor::new(bytes);
        let n = cur.read_u64::<LittleEndian>().unwrap_or(0) as usize;
        self.fast_offset.store(cur.read_u64::<LittleEndian>().unwrap_or(0), Ordering::Release);
        self.slow_offset.store(cur.read_u64::<LittleEndian>().unwrap_or(0), Ordering::Release);
        for i in 0..n.min(self.chunks.len()) {
            let count = cur.read_u32::<LittleEndian>().unwrap_or(0);
            let used = cur.read_u64::<LittleEndian>().unwrap_or(0);
            let tag = cur.read_u8().unwrap_or(0);
            let mut pad = [0u8; 7];
            let _ = std::io::Read::read_exact(&mut cur, &mut pad);
            self.chunks[i].set_insertion_count(count);
            self.chunks[i].bytes_used.store(used, Ordering::Release);
            *self.chunks[i].list.lock() = match tag {
                1 => ChunkList::Fast,
                2 => ChunkList::Slow,
                _ => ChunkList::Free,
            };
        }
    }
}

/// Guards a mutation across the front/back mirror pair: raises dirty on the
/// front copy, runs the mutation, mirrors it, then clears dirty. Never held
/// across a suspension point (see spec §5).
pub struct DirtyGuard<'a> {
    front: &'a MetadataMirror,
}

impl<'a> DirtyGuard<'a> {
    pub fn enter(front: &'a MetadataMirror) -> Self {
        front.mark_dirty();
        DirtyGuard { front }
    }
}

impl<'a> Drop for DirtyGuard<'a> {
    fn drop(&mut self) {
        self.front.clear_dirty();
    }
}

/// Recovery decision made when opening a device's twin mirrors.
pub enum RecoveryAction {
    UseFront,
    UseBack,
    HealFrontFromBack,
    HealBackFromFront,
}

/// Implements the open-time recovery protocol from §4.2.
pub fn recover(
    front: &MetadataMirror,
    back: &MetadataMirror,
    allow_dirty: bool,
) -> PoolResult<RecoveryAction> {
    let front_dirty = front.is_dirty();
    let back_dirty = back.is_dirty();

    match (front_dirty, back_dirty) {
        (false, false) => Ok(RecoveryAction::UseFront),
        (true, false) => Ok(RecoveryAction::HealFrontFromBack),
        (false, true) => Ok(RecoveryAction::HealBackFromFront),
        (true, true) => {
            let deadline = Instant::now() + Duration::from_secs(1);
            while Instant::now() < deadline {
                if !front.is_dirty() {
                    return Ok(RecoveryAction::HealBackFromFront);
                }
                if !back.is_dirty() {
                    return Ok(RecoveryAction::HealFrontFromBack);
                }
                std::thread::yield_now();
            }
            if allow_dirty {
                warn!("both metadata mirrors dirty at open; proceeding with allow_dirty healing");
                Ok(RecoveryAction::HealFrontFromBack)
            } else {
                Err(PoolError::BothMirrorsDirty)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_count_round_trips_through_split_halves() {
        let c = ChunkMetadata::new(0, 0);
        c.set_insertion_count(0xABCDE & 0xfffff);
        assert_eq!(c.insertion_count(), 0xABCDE & 0xfffff);
    }

    #[test]
    fn reserve_bytes_rejects_over_capacity() {
        let c = ChunkMetadata::new(0, 0);
        assert!(c.reserve_bytes(100, 100).is_ok());
        assert!(c.reserve_bytes(1, 100).is_err());
    }

    #[test]
    fn trim_only_reduces_bytes_used() {
        let c = ChunkMetadata::new(0, 0);
        c.reserve_bytes(500, 1000).unwrap();
        c.trim_to(0);
        assert_eq!(c.bytes_used.load(Ordering::Acquire), 0);
    }

    #[test]
    fn recover_picks_clean_copy_when_one_dirty() {
        let front = MetadataMirror::new(1);
        let back = MetadataMirror::new(1);
        front.mark_dirty();
        match recover(&front, &back, false).unwrap() {
            RecoveryAction::HealFrontFromBack => {}
            _ => panic!("expected heal front from back"),
        }
    }

    #[test]
    fn recover_fails_when_both_dirty_and_not_allowed() {
        let front = MetadataMirror::new(1);
        let back = MetadataMirror::new(1);
        front.mark_dirty();
        back.mark_dirty();
        assert!(recover(&front, &back, false).is_err());
    }

    #[test]
    fn allocate_chunk_moves_from_free_to_requested_list() {
        let m = MetadataMirror::new(4);
        m.seed_free_list();
        let chunk = m.allocate_chunk(ChunkList::Fast).unwrap();
        assert_eq!(*m.chunks[chunk as usize].list.lock(), ChunkList::Fast);
        assert_eq!(m.head(ChunkList::Fast), Some(chunk));
        assert_eq!(m.list_iter(ChunkList::Free).len(), 3);
    }

    #[test]
    fn allocate_chunk_fails_when_free_list_exhausted() {
        let m = MetadataMirror::new(1);
        m.seed_free_list();
        m.allocate_chunk(ChunkList::Fast).unwrap();
        assert!(m.allocate_chunk(ChunkList::Slow).is_err());
    }

    #[test]
    fn release_chunk_returns_it_to_free_and_zeroes_usage() {
        let m = MetadataMirror::new(2);
        m.seed_free_list();
        let chunk = m.allocate_chunk(ChunkList::Slow).unwrap();
        m.chunks[chunk as usize].reserve_bytes(128, 4096).unwrap();
        m.release_chunk(ChunkList::Slow, chunk);
        assert_eq!(*m.chunks[chunk as usize].list.lock(), ChunkList::Free);
        assert_eq!(m.chunks[chunk as usize].bytes_used.load(Ordering::Acquire), 0);
        assert_eq!(m.head(ChunkList::Free), Some(chunk));
    }

    #[test]
    fn move_chunk_preserves_insertion_count() {
        let m = MetadataMirror::new(2);
        m.seed_free_list();
        let chunk = m.allocate_chunk(ChunkList::Fast).unwrap();
        let count_before = m.chunks[chunk as usize].insertion_count();
        m.move_chunk(ChunkList::Fast, ChunkList::Slow, chunk);
        assert_eq!(m.chunks[chunk as usize].insertion_count(), count_before);
        assert_eq!(*m.chunks[chunk as usize].list.lock(), ChunkList::Slow);
    }
}
