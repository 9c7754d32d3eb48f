//! # Bounded Stage Queues
//!
//! Hand-off queues between pipeline stages with a keyframe-preserving
//! overflow policy: on a full queue, non-keyframe video is displaced oldest
//! first to make room for new video, keyframes are never displaced, and
//! non-video items are dropped-new. Overflows are reported to the caller so
//! they can be counted.
//!
//! `crossbeam` channels cannot displace queued items, which is why this is a
//! mutex + condvar queue rather than a channel.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::fragment::CompressedFrame;

/// Classification hooks for the overflow policy.
pub trait QueueItem {
    /// Video payload that may be displaced under pressure.
    fn is_droppable_video(&self) -> bool;
    /// Video payload at all (keyframe or not).
    fn is_video(&self) -> bool;
}

impl QueueItem for CompressedFrame {
    fn is_droppable_video(&self) -> bool {
        !self.is_keyframe
    }

    fn is_video(&self) -> bool {
        true
    }
}

/// What happened to a pushed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued normally.
    Queued,
    /// Queued after displacing the oldest non-keyframe video item.
    DisplacedOld,
    /// The queue was full and the new item was dropped.
    DroppedNew,
}

/// Fixed-capacity FIFO with blocking pop and the keyframe-preserving
/// overflow policy.
pub struct BoundedQueue<T> {
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T: QueueItem> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be positive");
        BoundedQueue {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Push an item, applying the overflow policy when full.
    pub fn push(&self, item: T) -> PushOutcome {
        let mut queue = self.lock();
        if queue.len() < self.capacity {
            queue.push_back(item);
            self.not_empty.notify_one();
            return PushOutcome::Queued;
        }

        // Full: video may displace the oldest droppable entry. Anything else
        // is dropped-new.
        if item.is_video() {
            if let Some(pos) = queue.iter().position(|i| i.is_droppable_video()) {
                queue.remove(pos);
                queue.push_back(item);
                self.not_empty.notify_one();
                return PushOutcome::DisplacedOld;
            }
        }
        PushOutcome::DroppedNew
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop, waiting up to `timeout` for an item. Bounded so a shutdown flag
    /// is observed within one loop iteration.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let mut queue = self.lock();
        if let Some(item) = queue.pop_front() {
            return Some(item);
        }
        let (mut queue, result) = self
            .not_empty
            .wait_timeout(queue, timeout)
            .unwrap_or_else(|e| e.into_inner());
        let _ = result;
        queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
