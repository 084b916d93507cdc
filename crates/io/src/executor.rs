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

//! The single-threaded cooperative I/O executor (C3).

use std::collections::{HashMap, VecDeque};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;

use slab::Slab;

use crate::buffers::BufferPool;
use crate::completion::{CompletionCallback, CompletionResult, CompletionToken, PendingOp};
use crate::error::{IoError, IoResult};
use crate::message::{self, MessageReceiver, MessageSender};
use crate::priority::IoPriority;

/// How a single call to [`Executor::poll`] should behave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Block until at least one completion (read, write, timer, or
    /// thread-safe message) is ready, or return 0 immediately if nothing is
    /// in flight.
    Blocking,
    /// Peek only; never blocks.
    NonBlocking,
    /// Like `Blocking`, but once the first completion is dequeued, drain
    /// every other ready completion in the same pass before dispatching any
    /// callbacks.
    Eager,
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub read_ring_entries: u32,
    pub write_ring_entries: u32,
    pub read_buffers: usize,
    pub write_buffers: usize,
    pub concurrent_read_io_limit: usize,
    /// Whether the transport supports a dedicated write ring; when false
    /// writes are submitted on the primary ring alongside reads.
    pub split_write_ring: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            read_buffer_size: 4096,
            write_buffer_size: 4096,
            read_ring_entries: 256,
            write_ring_entries: 256,
            read_buffers: 128,
            write_buffers: 64,
            concurrent_read_io_limit: 64,
            split_write_ring: true,
        }
    }
}

struct PendingRead {
    fd: RawFd,
    offset: u64,
    buffer_index: usize,
    len: usize,
    priority: IoPriority,
    token: usize,
}

/// What's needed to resubmit a read that is currently in flight, kept
/// around only so an `-EAGAIN` completion can re-initiate it without
/// surfacing an error to the caller (§4.3, §9).
#[derive(Clone, Copy)]
struct InFlightReadRequest {
    fd: RawFd,
    offset: u64,
    len: usize,
    priority: IoPriority,
}

/// A single-threaded cooperative I/O executor bound to the thread that
/// created it. Owning thread is enforced on every submit/poll call.
pub struct Executor {
    owner: ThreadId,
    config: ExecutorConfig,
    read_buffers: BufferPool,
    write_buffers: BufferPool,
    pending_ops: Slab<PendingOp>,
    in_flight_reads: usize,
    in_flight_writes: usize,
    in_flight_timers_or_messages: usize,
    pending_reads: VecDeque<PendingRead>,
    in_flight_read_requests: HashMap<usize, InFlightReadRequest>,
    reads_retried: u64,
    message_receiver: MessageReceiver,
    message_sender_template: MessageSender,
    next_op_id: AtomicU64,
    #[cfg(target_os = "linux")]
    primary_ring: io_uring::IoUring,
    #[cfg(target_os = "linux")]
    write_ring: Option<io_uring::IoUring>,
}

impl Executor {
    #[cfg(target_os = "linux")]
    pub fn new(config: ExecutorConfig) -> IoResult<Executor> {
        let owner = std::thread::current().id();
        let mut primary_ring = io_uring::IoUring::new(config.read_ring_entries)?;
        let write_ring = if config.split_write_ring {
            Some(io_uring::IoUring::new(config.write_ring_entries)?)
        } else {
            None
        };

        let mut read_buffers = BufferPool::new(config.read_buffer_size, config.read_buffers);
        let mut write_buffers = BufferPool::new(config.write_buffer_size, config.write_buffers);
        register_buffers(&primary_ring, &mut read_buffers)?;
        if let Some(ring) = write_ring.as_ref() {
            register_buffers(ring, &mut write_buffers)?;
        } else {
            register_buffers(&primary_ring, &mut write_buffers)?;
        }

        let waker: Arc<dyn Fn() + Send + Sync> = Arc::new(|| {});
        let (message_sender_template, message_receiver) = message::channel(waker);

        Ok(Executor {
            owner,
            config,
            read_buffers,
            write_buffers,
            pending_ops: Slab::new(),
            in_flight_reads: 0,
            in_flight_writes: 0,
            in_flight_timers_or_messages: 0,
            pending_reads: VecDeque::new(),
            in_flight_read_requests: HashMap::new(),
            reads_retried: 0,
            message_receiver,
            message_sender_template,
            next_op_id: AtomicU64::new(1),
            primary_ring,
            write_ring,
        })
    }

    pub fn message_sender(&self) -> MessageSender {
        self.message_sender_template.clone()
    }

    pub fn reads_retried(&self) -> u64 {
        self.reads_retried
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight_reads + self.in_flight_writes + self.in_flight_timers_or_messages
    }

    fn assert_owner(&self) -> IoResult<()> {
        if std::thread::current().id() != self.owner {
            return Err(IoError::WrongThread);
        }
        Ok(())
    }

    fn check_alignment(offset: u64) -> IoResult<()> {
        const DISK_PAGE: u64 = 4096;
        if offset % DISK_PAGE != 0 {
            return Err(IoError::Misaligned(offset));
        }
        Ok(())
    }

    /// Submits a read. `chunk_offset` MUST be DISK_PAGE aligned. On a full
    /// submission queue, drains completions until space is available. When
    /// `concurrent_read_io_limit` is already saturated, the request is
    /// queued on the pending-reads list instead of submitted immediately.
    #[cfg(target_os = "linux")]
    pub fn submit_read(
        &mut self,
        fd: RawFd,
        chunk_offset: u64,
        len: usize,
        priority: IoPriority,
        callback: CompletionCallback,
    ) -> IoResult<CompletionToken> {
        self.assert_owner()?;
        Self::check_alignment(chunk_offset)?;
        self.read_buffers.checked_len(len)?;

        let token = self.pending_ops.insert(PendingOp::new(callback));

        if self.in_flight_reads >= self.config.concurrent_read_io_limit {
            let buffer = self.read_buffers.acquire();
            match buffer {
                Some(handle) => {
                    self.pending_reads.push_back(PendingRead {
                        fd,
                        offset: chunk_offset,
                        buffer_index: handle.index,
                        len,
                        priority,
                        token,
                    });
                }
                None => {
                    // No free buffer either; queue without a buffer and
                    // acquire one lazily when drained.
                    self.pending_reads.push_back(PendingRead {
                        fd,
                        offset: chunk_offset,
                        buffer_index: usize::MAX,
                        len,
                        priority,
                        token,
                    });
                }
            }
            return Ok(CompletionToken(token as u64));
        }

        self.submit_read_now(fd, chunk_offset, len, priority, token)?;
        Ok(CompletionToken(token as u64))
    }

    #[cfg(target_os = "linux")]
    fn submit_read_now(&mut self, fd: RawFd, offset: u64, len: usize, priority: IoPriority, token: usize) -> IoResult<()> {
        let buffer = self
            .read_buffers
            .acquire()
            .ok_or(IoError::BufferPoolExhausted)?;
        let ptr = self.read_buffers.slice_mut(buffer.index).as_mut_ptr();
        let entry = io_uring::opcode::ReadFixed::new(io_uring::types::Fd(fd), ptr, len as u32, buffer.index as u16)
            .offset(offset)
            .ioprio(priority.to_ioprio())
            .build()
            .user_data(encode_user_data(token, buffer.index))
            .flags(io_uring::squeue::Flags::empty());
        unsafe {
            while self.primary_ring.submission().push(&entry).is_err() {
                self.drain_primary(true);
            }
        }
        self.primary_ring.submitter().submit()?;
        self.in_flight_reads += 1;
        self.in_flight_read_requests
            .insert(token, InFlightReadRequest { fd, offset, len, priority });
        Ok(())
    }

    /// Submits a write. Same alignment/size rules as reads. Routed to the
    /// dedicated write ring when one exists.
    #[cfg(target_os = "linux")]
    pub fn submit_write(
        &mut self,
        fd: RawFd,
        chunk_offset: u64,
        data: &[u8],
        priority: IoPriority,
        callback: CompletionCallback,
    ) -> IoResult<CompletionToken> {
        self.assert_owner()?;
        Self::check_alignment(chunk_offset)?;
        self.write_buffers.checked_len(data.len())?;

        // Write-buffer exhaustion under no in-flight I/O is a programmer
        // error (fatal per spec §8 boundary 12); under in-flight I/O the
        // caller should drain write completions and retry.
        let buffer = self.write_buffers.acquire().ok_or(IoError::BufferPoolExhausted)?;
        self.write_buffers.slice_mut(buffer.index)[..data.len()].copy_from_slice(data);

        let token = self.pending_ops.insert(PendingOp::new(callback));
        let ptr = self.write_buffers.slice_mut(buffer.index).as_mut_ptr();
        let entry = io_uring::opcode::WriteFixed::new(io_uring::types::Fd(fd), ptr, data.len() as u32, buffer.index as u16)
            .offset(chunk_offset)
            .ioprio(priority.to_ioprio())
            .build()
            .user_data(encode_user_data(token, buffer.index))
            .flags(io_uring::squeue::Flags::empty());

        let ring = self.write_ring.as_mut().unwrap_or(&mut self.primary_ring);
        unsafe {
            while ring.submission().push(&entry).is_err() {
                ring.submitter().submit()?;
            }
        }
        ring.submitter().submit()?;
        self.in_flight_writes += 1;
        Ok(CompletionToken(token as u64))
    }

    /// Drains completions from the primary ring, dispatching callbacks and
    /// retrying reads that failed with EAGAIN. Returns the number of
    /// completions processed.
    #[cfg(target_os = "linux")]
    fn drain_primary(&mut self, at_least_one: bool) -> usize {
        let mut processed = 0;
        loop {
            let cqe = {
                let mut cq = self.primary_ring.completion();
                cq.next()
            };
            let Some(cqe) = cqe else {
                if processed == 0 && at_least_one {
                    let _ = self.primary_ring.submit_and_wait(1);
                    continue;
                }
                break;
            };
            processed += 1;
            self.handle_read_completion(cqe);
        }
        self.drain_pending_reads();
        processed
    }

    #[cfg(target_os = "linux")]
    fn handle_read_completion(&mut self, cqe: io_uring::cqueue::Entry) {
        let (token, buffer_index) = decode_user_data(cqe.user_data());
        let result = cqe.result();
        self.in_flight_reads = self.in_flight_reads.saturating_sub(1);

        if result == -libc::EAGAIN {
            self.reads_retried += 1;
            warn!("read EAGAIN, retrying after throttle");
            std::thread::sleep(Duration::from_micros(50));
            self.read_buffers.release(crate::buffers::BufferHandle { index: buffer_index });

            // Re-initiate: a direct function call re-queuing the same
            // request, never an exception or stack unwind back to the
            // caller (§4.3, §9). The caller's callback is untouched and
            // still waiting in `pending_ops` under the same token.
            if let Some(pending) = self.pending_ops.get(token) {
                if pending.invalidated {
                    self.in_flight_read_requests.remove(&token);
                    self.complete(token, Ok(0));
                    return;
                }
            }
            if let Some(req) = self.in_flight_read_requests.remove(&token) {
                self.pending_reads.push_front(PendingRead {
                    fd: req.fd,
                    offset: req.offset,
                    buffer_index: usize::MAX,
                    len: req.len,
                    priority: req.priority,
                    token,
                });
            } else {
                // No retained request (shouldn't happen outside tests that
                // drive handle_read_completion directly); surface the
                // transient error rather than silently dropping the token.
                self.complete(token, Err(IoError::Kernel(std::io::Error::from_raw_os_error(libc::EAGAIN))));
            }
            return;
        }

        self.in_flight_read_requests.remove(&token);
        let completion_result: CompletionResult = if result < 0 {
            Err(IoError::Kernel(std::io::Error::from_raw_os_error(-result)))
        } else {
            Ok(result as u32)
        };
        self.read_buffers.release(crate::buffers::BufferHandle { index: buffer_index });
        self.complete(token, completion_result);
    }

    fn complete(&mut self, token: usize, result: CompletionResult) {
        if self.pending_ops.contains(token) {
            let op = self.pending_ops.remove(token);
            if !op.invalidated {
                (op.callback)(result);
            }
        }
    }

    /// Opportunistically submits queued reads up to the concurrency cap and
    /// submission-queue space.
    #[cfg(target_os = "linux")]
    fn drain_pending_reads(&mut self) {
        while self.in_flight_reads < self.config.concurrent_read_io_limit {
            let Some(pending) = self.pending_reads.pop_front() else {
                break;
            };
            let buffer_index = if pending.buffer_index == usize::MAX {
                match self.read_buffers.acquire() {
                    Some(h) => h.index,
                    None => {
                        self.pending_reads.push_front(pending);
                        break;
                    }
                }
            } else {
                pending.buffer_index
            };
            let ptr = self.read_buffers.slice_mut(buffer_index).as_mut_ptr();
            let entry = io_uring::opcode::ReadFixed::new(
                io_uring::types::Fd(pending.fd),
                ptr,
                pending.len as u32,
                buffer_index as u16,
            )
            .offset(pending.offset)
            .ioprio(pending.priority.to_ioprio())
            .build()
            .user_data(encode_user_data(pending.token, buffer_index))
            .flags(io_uring::squeue::Flags::empty());
            let ok = unsafe { self.primary_ring.submission().push(&entry).is_ok() };
            if ok {
                let _ = self.primary_ring.submitter().submit();
                self.in_flight_reads += 1;
                self.in_flight_read_requests.insert(
                    pending.token,
                    InFlightReadRequest {
                        fd: pending.fd,
                        offset: pending.offset,
                        len: pending.len,
                        priority: pending.priority,
                    },
                );
            } else {
                self.read_buffers.release(crate::buffers::BufferHandle { index: buffer_index });
                // Put back with the buffer already released; next drain
                // pass re-acquires one.
                self.pending_reads.push_front(PendingRead {
                    buffer_index: usize::MAX,
                    ..pending
                });
                break;
            }
        }
    }

    /// Single call to poll completions, per §4.3's three modes.
    #[cfg(target_os = "linux")]
    pub fn poll(&mut self, mode: PollMode) -> IoResult<usize> {
        self.assert_owner()?;
        if self.message_receiver.has_pending() {
            self.message_receiver.drain();
        }

        match mode {
            PollMode::NonBlocking => Ok(self.drain_primary(false) + self.drain_write_ring(false)),
            PollMode::Blocking => {
                if self.in_flight_count() == 0 {
                    return Ok(0);
                }
                Ok(self.drain_primary(true) + self.drain_write_ring(false))
            }
            PollMode::Eager => {
                if self.in_flight_count() == 0 {
                    return Ok(0);
                }
                let mut total = self.drain_primary(true);
                total += self.drain_write_ring(false);
                loop {
                    let more = self.drain_primary(false) + self.drain_write_ring(false);
                    if more == 0 {
                        break;
                    }
                    total += more;
                }
                Ok(total)
            }
        }
    }

    #[cfg(target_os = "linux")]
    fn drain_write_ring(&mut self, at_least_one: bool) -> usize {
        let Some(ring) = self.write_ring.as_mut() else {
            return 0;
        };
        let mut processed = 0;
        loop {
            let cqe = {
                let mut cq = ring.completion();
                cq.next()
            };
            let Some(cqe) = cqe else {
                if processed == 0 && at_least_one {
                    let _ = ring.submit_and_wait(1);
                    continue;
                }
                break;
            };
            processed += 1;
            let (token, buffer_index) = decode_user_data(cqe.user_data());
            let result = cqe.result();
            self.in_flight_writes = self.in_flight_writes.saturating_sub(1);
            self.write_buffers.release(crate::buffers::BufferHandle { index: buffer_index });
            let completion_result = if result < 0 {
                Err(IoError::Kernel(std::io::Error::from_raw_os_error(-result)))
            } else {
                Ok(result as u32)
            };
            self.complete(token, completion_result);
        }
        processed
    }

    /// Drives the executor until every outstanding operation has completed.
    /// Used by `Drop` and by coarse cancellation on version invalidation.
    #[cfg(target_os = "linux")]
    pub fn drain_to_quiescence(&mut self) {
        while self.in_flight_count() > 0 {
            let _ = self.poll(PollMode::Blocking);
        }
    }
}

#[cfg(target_os = "linux")]
impl Drop for Executor {
    fn drop(&mut self) {
        if std::thread::current().id() != self.owner {
            error!("Executor dropped from a non-owning thread; this is a fatal programmer error");
            std::process::abort();
        }
        trace!("draining executor to quiescence before shutdown");
        self.drain_to_quiescence();
    }
}

#[cfg(target_os = "linux")]
fn register_buffers(ring: &io_uring::IoUring, pool: &mut BufferPool) -> IoResult<()> {
    let iovecs: Vec<libc::iovec> = pool
        .iovecs()
        .into_iter()
        .map(|(ptr, len)| libc::iovec {
            iov_base: ptr as *mut _,
            iov_len: len,
        })
        .collect();
    unsafe {
        ring.submitter().register_buffers(&iovecs)?;
    }
    Ok(())
}

fn encode_user_data(token: usize, buffer_index: usize) -> u64 {
    ((token as u64) << 24) | (buffer_index as u64 & 0xFF_FFFF)
}

fn decode_user_data(user_data: u64) -> (usize, usize) {
    ((user_data >> 24) as usize, (user_data & 0xFF_FFFF) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_round_trips_token_and_buffer_index() {
        let encoded = encode_user_data(1234, 56);
        assert_eq!(decode_user_data(encoded), (1234, 56));
    }

    #[test]
    fn ioprio_values_are_ordered_rt_best() {
        assert!(IoPriority::Highest.to_ioprio() < IoPriority::Normal.to_ioprio());
    }
}
