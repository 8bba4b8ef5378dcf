// src/timer.rs
//! Indexed binary min-heap of deadlines.
//!
//! Each node maps an id to an expiry instant and a callback. A side table
//! keeps every id's heap slot so refresh, cancel and forced firing are
//! `O(log n)` instead of a linear search. The timer is not synchronized; the
//! server only touches it from the event-loop thread.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub type TimeoutCallback = Box<dyn FnOnce() + Send + 'static>;

struct TimerNode<K> {
    id: K,
    expires: Instant,
    cb: TimeoutCallback,
}

pub struct DeadlineTimer<K> {
    heap: Vec<TimerNode<K>>,
    index: HashMap<K, usize>,
}

impl<K: Copy + Eq + Hash> DeadlineTimer<K> {
    pub fn new() -> Self {
        Self {
            heap: Vec::with_capacity(64),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, id: K) -> bool {
        self.index.contains_key(&id)
    }

    /// Schedule `cb` to run `timeout` from now. An id that is already
    /// scheduled gets the new expiry and callback in place.
    pub fn add<F>(&mut self, id: K, timeout: Duration, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let expires = Instant::now() + timeout;
        match self.index.get(&id).copied() {
            None => {
                let idx = self.heap.len();
                self.index.insert(id, idx);
                self.heap.push(TimerNode {
                    id,
                    expires,
                    cb: Box::new(cb),
                });
                self.sift_up(idx);
            }
            Some(idx) => {
                self.heap[idx].expires = expires;
                self.heap[idx].cb = Box::new(cb);
                self.resift(idx);
            }
        }
    }

    /// Push an existing deadline to `timeout` from now.
    ///
    /// # Panics
    /// If `id` is not scheduled.
    pub fn adjust(&mut self, id: K, timeout: Duration) {
        let idx = *self
            .index
            .get(&id)
            .expect("adjust() on an id that is not scheduled");
        self.heap[idx].expires = Instant::now() + timeout;
        self.resift(idx);
    }

    /// Run and remove `id`'s callback now, whatever its expiry.
    /// Returns false if `id` was not scheduled.
    pub fn fire(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(idx) => {
                let node = self.remove_at(idx);
                (node.cb)();
                true
            }
            None => false,
        }
    }

    /// Remove `id` without running its callback.
    pub fn cancel(&mut self, id: K) -> bool {
        match self.index.get(&id).copied() {
            Some(idx) => {
                self.remove_at(idx);
                true
            }
            None => false,
        }
    }

    /// Run every callback whose deadline has passed, earliest first.
    pub fn sweep(&mut self) {
        let now = Instant::now();
        while let Some(root) = self.heap.first() {
            if root.expires > now {
                break;
            }
            let node = self.remove_at(0);
            (node.cb)();
        }
    }

    /// Remove the earliest node without running it.
    pub fn pop(&mut self) {
        assert!(!self.heap.is_empty(), "pop() on an empty timer");
        self.remove_at(0);
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.heap.clear();
    }

    /// Sweep, then report milliseconds until the next deadline, rounded up,
    /// or `-1` when nothing is scheduled (an infinite epoll wait).
    pub fn next_deadline_ms(&mut self) -> i32 {
        self.sweep();
        match self.heap.first() {
            None => -1,
            Some(root) => {
                let left = root.expires.saturating_duration_since(Instant::now());
                let ms = left.as_micros().div_ceil(1000);
                ms.min(i32::MAX as u128) as i32
            }
        }
    }

    fn resift(&mut self, idx: usize) {
        let n = self.heap.len();
        if !self.sift_down(idx, n) {
            self.sift_up(idx);
        }
    }

    fn remove_at(&mut self, idx: usize) -> TimerNode<K> {
        let last = self.heap.len() - 1;
        if idx < last {
            self.swap_nodes(idx, last);
            if !self.sift_down(idx, last) {
                self.sift_up(idx);
            }
        }
        let node = self.heap.pop().expect("heap is non-empty");
        self.index.remove(&node.id);
        node
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[parent].expires <= self.heap[idx].expires {
                break;
            }
            self.swap_nodes(idx, parent);
            idx = parent;
        }
    }

    /// Sift within `heap[..n]`; true if the node moved.
    fn sift_down(&mut self, idx: usize, n: usize) -> bool {
        let mut i = idx;
        let mut child = i * 2 + 1;
        while child < n {
            if child + 1 < n && self.heap[child + 1].expires < self.heap[child].expires {
                child += 1;
            }
            if self.heap[i].expires <= self.heap[child].expires {
                break;
            }
            self.swap_nodes(i, child);
            i = child;
            child = i * 2 + 1;
        }
        i > idx
    }

    fn swap_nodes(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].id, i);
        self.index.insert(self.heap[j].id, j);
    }

    #[cfg(test)]
    fn is_valid_heap(&self) -> bool {
        (1..self.heap.len()).all(|i| self.heap[(i - 1) / 2].expires <= self.heap[i].expires)
            && self.index.len() == self.heap.len()
            && self.index.iter().all(|(id, &idx)| self.heap[idx].id == *id)
    }
}

impl<K: Copy + Eq + Hash> Default for DeadlineTimer<K> {
    fn default() -> Self {
        Self::new()
    }
}
