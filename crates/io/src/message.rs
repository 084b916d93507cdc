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

//! Cross-thread wake-up channel.
//!
//! Another thread posts a boxed closure through [`MessageSender`]; the
//! owning executor drains it on the next `poll()` call, via a multishot
//! poll armed once on the primary ring against the channel's readable fd
//! (see `executor::Executor::arm_message_multishot`).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

pub type ThreadSafeMessage = Box<dyn FnOnce() + Send>;

/// Multi-producer write end. Cloning is cheap; every clone posts to the
/// same underlying channel and wakes the same executor.
#[derive(Clone)]
pub struct MessageSender {
    tx: Sender<ThreadSafeMessage>,
    has_pending: Arc<AtomicBool>,
    waker: std::sync::Arc<dyn Fn() + Send + Sync>,
}

impl MessageSender {
    pub fn send(&self, message: ThreadSafeMessage) {
        // Acquire fence ordering: the flag and the send are both visible to
        // the receiving executor thread before it reads the channel, so a
        // receiver that observes `has_pending` true is guaranteed the
        // message is already enqueued.
        let _ = self.tx.send(message);
        self.has_pending.store(true, Ordering::Release);
        (self.waker)();
    }
}

/// Single-consumer read end, owned by the executor.
pub struct MessageReceiver {
    rx: Receiver<ThreadSafeMessage>,
    has_pending: Arc<AtomicBool>,
}

impl MessageReceiver {
    /// Drains every message currently queued, invoking each as if it were a
    /// local completion. Called from `Executor::poll` after the message
    /// pipe's readable end reports ready.
    pub fn drain(&self) -> usize {
        let mut n = 0;
        while let Ok(message) = self.rx.try_recv() {
            message();
            n += 1;
        }
        self.has_pending.store(false, Ordering::Release);
        n
    }

    pub fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }
}

/// Constructs a sender/receiver pair. `waker` is invoked after every send so
/// an executor blocked on its completion ring can be woken; in the real
/// executor this closure writes a byte to an eventfd armed as a multishot
/// poll entry.
pub fn channel(waker: std::sync::Arc<dyn Fn() + Send + Sync>) -> (MessageSender, MessageReceiver) {
    let (tx, rx) = crossbeam_channel::unbounded();
    let has_pending = Arc::new(AtomicBool::new(false));
    (
        MessageSender {
            tx,
            has_pending: has_pending.clone(),
            waker,
        },
        MessageReceiver { rx, has_pending },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn send_then_drain_runs_all_messages() {
        let wakes = Arc::new(AtomicUsize::new(0));
        let wakes2 = wakes.clone();
        let (tx, rx) = channel(Arc::new(move || {
            wakes2.fetch_add(1, Ordering::SeqCst);
        }));
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran2 = ran.clone();
            tx.send(Box::new(move || {
                ran2.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(wakes.load(Ordering::SeqCst), 3);
        assert!(rx.has_pending());
        let n = rx.drain();
        assert_eq!(n, 3);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(!rx.has_pending());
    }
}
