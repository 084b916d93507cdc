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

//! Fixed-size buffer pools pre-registered with the kernel so the ring can
//! address them by index (`IORING_OP_READ_FIXED` / `IORING_OP_WRITE_FIXED`)
//! instead of pinning a fresh address range per operation.

use crate::error::{IoError, IoResult};

/// A single fixed-size buffer slot plus whether it is currently checked out.
struct Slot {
    data: Box<[u8]>,
    in_use: bool,
}

/// Owns a flat arena of same-size buffers. Registration with the kernel is
/// performed once by the owning [`crate::executor::Executor`] at
/// construction time, over the full arena described by
/// [`BufferPool::iovecs`].
pub struct BufferPool {
    buffer_size: usize,
    slots: Vec<Slot>,
    free: Vec<usize>,
}

/// A checked-out buffer. Returning it to the pool happens explicitly via
/// [`BufferPool::release`] once its completion has been dispatched — there
/// is no `Drop` auto-release because in-flight buffers must not be reused
/// while the kernel still holds a reference to their memory.
pub struct BufferHandle {
    pub index: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let mut slots = Vec::with_capacity(count);
        let mut free = Vec::with_capacity(count);
        for i in 0..count {
            slots.push(Slot {
                data: vec![0u8; buffer_size].into_boxed_slice(),
                in_use: false,
            });
            free.push(i);
        }
        BufferPool {
            buffer_size,
            slots,
            free,
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Raw (pointer, len) pairs in slot order, used once at construction to
    /// register the arena with `io_uring_register(IORING_REGISTER_BUFFERS)`.
    pub fn iovecs(&mut self) -> Vec<(*mut u8, usize)> {
        self.slots
            .iter_mut()
            .map(|s| (s.data.as_mut_ptr(), s.data.len()))
            .collect()
    }

    /// Checks out a free buffer. Returns `None` (mapped by the caller to
    /// [`IoError::BufferPoolExhausted`]) when every slot is in flight.
    pub fn acquire(&mut self) -> Option<BufferHandle> {
        let index = self.free.pop()?;
        self.slots[index].in_use = true;
        Some(BufferHandle { index })
    }

    pub fn release(&mut self, handle: BufferHandle) {
        self.slots[handle.index].in_use = false;
        self.free.push(handle.index);
    }

    pub fn slice(&self, index: usize) -> &[u8] {
        &self.slots[index].data
    }

    pub fn slice_mut(&mut self, index: usize) -> &mut [u8] {
        &mut self.slots[index].data
    }

    pub fn checked_len(&self, requested: usize) -> IoResult<()> {
        if requested > self.buffer_size {
            return Err(IoError::BufferTooLarge(requested, self.buffer_size));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trips() {
        let mut pool = BufferPool::new(4096, 2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        pool.release(a);
        assert!(pool.acquire().is_some());
        pool.release(b);
    }

    #[test]
    fn rejects_oversized_requests() {
        let pool = BufferPool::new(4096, 1);
        assert!(pool.checked_len(4096).is_ok());
        assert!(pool.checked_len(4097).is_err());
    }
}
