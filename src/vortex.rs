//! The time vortex: a per-partition priority queue of pending activities.
//!
//! Activities come out in `(deliver_time, priority, order_tag,
//! queue_order)` order. The vortex is single-owner state of its partition's
//! scheduler thread; it never locks.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::event::{Activity, ActivityKey};
use crate::types::SimTime;

/// Min-ordered activity queue with a depth watermark.
#[derive(Debug, Default)]
pub struct TimeVortex {
    heap: BinaryHeap<Reverse<Activity>>,
    insertions: u64,
    max_depth: usize,
}

impl TimeVortex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an activity. The caller is responsible for having stamped
    /// `queue_order`; the vortex only tracks totals.
    pub fn insert(&mut self, activity: Activity) {
        self.heap.push(Reverse(activity));
        self.insertions += 1;
        if self.heap.len() > self.max_depth {
            self.max_depth = self.heap.len();
        }
    }

    /// Removes and returns the earliest activity.
    pub fn pop(&mut self) -> Option<Activity> {
        self.heap.pop().map(|Reverse(a)| a)
    }

    /// Returns the earliest activity without removing it.
    pub fn peek(&self) -> Option<&Activity> {
        self.heap.peek().map(|Reverse(a)| a)
    }

    /// Delivery time of the earliest activity, or `None` if empty.
    pub fn next_time(&self) -> Option<SimTime> {
        self.peek().map(|a| a.time())
    }

    /// Ordering key of the earliest activity.
    pub fn next_key(&self) -> Option<ActivityKey> {
        self.peek().map(|a| a.key())
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Current number of queued activities (alias kept for symmetry with
    /// the watermark accessor).
    pub fn current_depth(&self) -> usize {
        self.heap.len()
    }

    /// High-water mark of queue depth over the life of the vortex.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Total number of insertions ever performed.
    pub fn total_insertions(&self) -> u64 {
        self.insertions
    }

    /// Drains the vortex into a vector in delivery order. Used by the
    /// checkpoint writer; the vortex is empty afterwards.
    pub fn drain_ordered(&mut self) -> Vec<Activity> {
        let mut out = Vec::with_capacity(self.heap.len());
        while let Some(Reverse(a)) = self.heap.pop() {
            out.push(a);
        }
        out
    }

    /// Rebuilds the heap from a checkpointed activity list.
    pub fn restore(&mut self, activities: Vec<Activity>) {
        for a in activities {
            self.insert(a);
        }
    }
}
