// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard},
    time::Duration,
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    sync::Notify,
    time::{Instant, timeout_at},
};
use tracing::debug;

bitflags::bitflags! {
    /// Behaviour modifiers for [`PacketQueue::add`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AddFlags: u8 {
        /// Park until space is available instead of failing on a full queue.
        const WAIT = 1 << 0;
        /// Insert at the head (LIFO) instead of the tail.
        const PUSH = 1 << 1;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,
    #[error("queue is shutting down")]
    Shutdown,
}

#[derive(Debug)]
struct Inner {
    nodes: VecDeque<Bytes>,
    totsize: usize,
    max_nodes: usize,
    last_add: Instant,
    shutdown: bool,
    /// Parked consumers. Tracked so shutdown can prove quiescence.
    readers: usize,
    /// Parked producers.
    writers: usize,
}

/// Bounded FIFO of IP frames shared between the TUN tasks and the network
/// tasks.
///
/// Every wait loop observes the shutdown flag cooperatively: a waiter that is
/// woken re-checks state under the lock and bails out once `shutdown` is set,
/// so [`PacketQueue::shutdown`] can wake-and-drain until no waiter remains
/// without ever cancelling a task mid-critical-section. Waiter registration
/// happens *before* the state re-check (`Notified::enable`), which closes the
/// window where a notification could slip between unlock and park.
#[derive(Debug)]
pub struct PacketQueue {
    inner: Mutex<Inner>,
    not_empty: Notify,
    not_full: Notify,
}

/// Decrements the waiter count even when the parked future is dropped.
struct WaiterGuard<'a> {
    q: &'a PacketQueue,
    reader: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.q.lock();
        if self.reader {
            inner.readers -= 1;
        } else {
            inner.writers -= 1;
        }
    }
}

impl PacketQueue {
    /// `max_nodes == 0` means unbounded.
    pub fn new(max_nodes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                nodes: VecDeque::new(),
                totsize: 0,
                max_nodes,
                last_add: Instant::now(),
                shutdown: false,
                readers: 0,
                writers: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn insert(inner: &mut Inner, frame: Bytes, push: bool) {
        inner.totsize += frame.len();
        if push {
            inner.nodes.push_front(frame);
        } else {
            inner.nodes.push_back(frame);
        }
        inner.last_add = Instant::now();
    }

    /// Enqueues one frame. Without [`AddFlags::WAIT`] a full queue fails
    /// immediately; with it the caller parks until space appears or the
    /// queue shuts down (the frame is dropped in that case).
    pub async fn add(&self, frame: Bytes, flags: AddFlags) -> Result<(), QueueError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if inner.shutdown {
                    return Err(QueueError::Shutdown);
                }
                let full =
                    inner.max_nodes != 0 && inner.nodes.len() >= inner.max_nodes;
                if !full {
                    Self::insert(&mut inner, frame, flags.contains(AddFlags::PUSH));
                    drop(inner);
                    self.not_empty.notify_waiters();
                    return Ok(());
                }
                if !flags.contains(AddFlags::WAIT) {
                    return Err(QueueError::Full);
                }
                notified.as_mut().enable();
                inner.writers += 1;
            }
            let _guard = WaiterGuard { q: self, reader: false };
            notified.await;
        }
    }

    /// Dequeues the head frame. Without [`AddFlags::WAIT`] an empty queue
    /// yields `None` immediately. With `wait` and no timeout the caller
    /// parks until data arrives or shutdown; with a timeout, `None` is
    /// returned on expiry.
    pub async fn remove(&self, wait: bool, deadline: Option<Duration>) -> Option<Bytes> {
        let expires = deadline.map(|d| Instant::now() + d);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if let Some(frame) = inner.nodes.pop_front() {
                    inner.totsize -= frame.len();
                    let writer_parked = inner.writers > 0;
                    drop(inner);
                    if writer_parked {
                        self.not_full.notify_one();
                    }
                    return Some(frame);
                }
                if inner.shutdown || !wait {
                    return None;
                }
                notified.as_mut().enable();
                inner.readers += 1;
            }
            let _guard = WaiterGuard { q: self, reader: true };
            match expires {
                Some(at) => {
                    if timeout_at(at, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Waits up to `dur` for data to be present without consuming it.
    /// Returns `false` on timeout or shutdown.
    pub async fn timed_wait(&self, dur: Duration) -> bool {
        let expires = Instant::now() + dur;
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            {
                let mut inner = self.lock();
                if !inner.nodes.is_empty() {
                    return true;
                }
                if inner.shutdown {
                    return false;
                }
                notified.as_mut().enable();
                inner.readers += 1;
            }
            let _guard = WaiterGuard { q: self, reader: true };
            if timeout_at(expires, notified).await.is_err() {
                return false;
            }
        }
    }

    /// Sets the shutdown flag, then wakes writers and readers until none are
    /// parked, draining whatever frames are left. Safe to call concurrently
    /// with in-flight adds and removes, and idempotent.
    pub async fn shutdown(&self) {
        {
            let mut inner = self.lock();
            inner.shutdown = true;
            inner.nodes.clear();
            inner.totsize = 0;
        }
        loop {
            self.not_full.notify_waiters();
            self.not_empty.notify_waiters();
            let quiesced = {
                let inner = self.lock();
                inner.readers == 0 && inner.writers == 0
            };
            if quiesced {
                break;
            }
            tokio::task::yield_now().await;
        }
        debug!("queue shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    /// Sum of the lengths of all queued frames.
    pub fn total_size(&self) -> usize {
        self.lock().totsize
    }

    pub fn last_add(&self) -> Instant {
        self.lock().last_add
    }

    pub fn max_nodes(&self) -> usize {
        self.lock().max_nodes
    }

    /// One-line state summary for the session dump.
    pub fn stats(&self) -> String {
        let inner = self.lock();
        format!(
            "len={}, size={}, readers={}, writers={}, shutdown={}",
            inner.nodes.len(),
            inner.totsize,
            inner.readers,
            inner.writers,
            inner.shutdown
        )
    }
}
