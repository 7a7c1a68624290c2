//! Core type definitions for the simulation engine.
//!
//! This module defines the fundamental identifiers and the priority bands
//! used to order simultaneous activities.

use serde::{Deserialize, Serialize};

/// Simulation time as an unsigned tick count from simulation start.
///
/// One tick is the base period established by the
/// [`TimeLord`](crate::time::TimeLord) at startup. All scheduling
/// arithmetic is integer arithmetic on ticks.
pub type SimTime = u64;

/// Sentinel for "no pending activity" when exchanging next-event times.
pub const TIME_MAX: SimTime = u64::MAX;

/// Unique identifier for a component in the simulation graph.
pub type ComponentId = u64;

/// Unique identifier for one endpoint of a configured link.
///
/// Each logical link has two endpoints; an event in flight carries the
/// *destination* endpoint id so the receiving partition can resolve the
/// handler (or the forwarding link) without pointers.
pub type LinkId = u64;

/// Rank index (process-level partition coordinate).
pub type RankId = u32;

/// Thread index within a rank.
pub type ThreadId = u32;

/// A partition is one (rank, thread) pair owning a disjoint subset of
/// components and a private activity queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionId {
    pub rank: RankId,
    pub thread: ThreadId,
}

impl PartitionId {
    pub fn new(rank: RankId, thread: ThreadId) -> Self {
        Self { rank, thread }
    }

    /// Flat index of this partition within an `R x T` topology.
    pub fn flat_index(&self, threads: u32) -> usize {
        (self.rank * threads + self.thread) as usize
    }
}

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.rank, self.thread)
    }
}

/// The rank/thread shape of a launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub ranks: u32,
    pub threads: u32,
}

impl Topology {
    pub fn new(ranks: u32, threads: u32) -> Self {
        Self { ranks, threads }
    }

    pub fn num_partitions(&self) -> usize {
        (self.ranks * self.threads) as usize
    }

    /// Returns true when the whole simulation runs in a single partition
    /// and no synchronization layer is required.
    pub fn is_serial(&self) -> bool {
        self.ranks == 1 && self.threads == 1
    }

    /// Iterates all partitions in (rank, thread) order.
    pub fn partitions(&self) -> impl Iterator<Item = PartitionId> + '_ {
        let threads = self.threads;
        (0..self.ranks).flat_map(move |r| (0..threads).map(move |t| PartitionId::new(r, t)))
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self { ranks: 1, threads: 1 }
    }
}

/// Priority bands for simultaneous activities. Lower values execute first
/// at the same tick.
///
/// The band layout guarantees that a sync barrier at tick `t` runs before
/// payload events stamped `t` (those belong to the next window), and that
/// the stop action at the configured end time runs after the events due
/// at that tick.
pub mod priority {
    /// Sync barrier actions; must precede everything else at a window edge.
    pub const SYNC: i32 = 25;
    /// Checkpoint triggers fire right after sync at the same tick.
    pub const CHECKPOINT: i32 = 27;
    /// Component clock ticks.
    pub const CLOCK: i32 = 40;
    /// Ordinary events.
    pub const EVENT: i32 = 50;
    /// Statistics output clocks run after the events they observe.
    pub const STAT_CLOCK: i32 = 60;
    /// Statistic start/stop one-shots.
    pub const STAT_EDGE: i32 = 70;
    /// End-of-simulation stop action; events due at the stop tick still run.
    pub const STOP: i32 = 99;
}
