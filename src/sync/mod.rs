//! Synchronization layers for conservative parallel execution.
//!
//! Partitions advance freely inside a *safe window* bounded by the global
//! minimum cross-partition link latency. At each window edge every
//! partition reaches a barrier; the two layers here exchange the events
//! that crossed partition boundaries during the window and agree on the
//! next window:
//!
//! - [`thread::ThreadSync`] connects the threads of one rank through
//!   shared memory.
//! - [`rank::RankSync`] connects ranks through serialized batches over a
//!   [`rank::Collective`]; a rank barrier strictly includes the thread
//!   barrier.
//!
//! The next window end is `max(barrier_time + min_latency, earliest
//! pending activity anywhere)`: at least one latency past the barrier,
//! further when every partition is idle until later.

pub mod rank;
pub mod thread;

pub use rank::{Collective, MemoryCollective, RankSync};
pub use thread::ThreadSync;

use crate::types::{SimTime, TIME_MAX};

/// What every partition learns from a barrier exchange.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    /// End of the next safe window. All participants in a barrier see the
    /// same value.
    pub window_end: SimTime,
    /// The exit detector fired: transition to COMPLETE.
    pub exit_done: bool,
    /// No partition has pending work: the simulation drained.
    pub drained: bool,
    /// A checkpoint is due at this barrier.
    pub checkpoint: bool,
    /// A stop was requested (signal or stop-at): wind down.
    pub stop: bool,
    /// Some partition failed; abort without further dispatch.
    pub failed: bool,
}

/// Computes the next safe window end from globally-reduced inputs.
pub fn next_window(barrier_time: SimTime, min_latency: SimTime, global_min_pending: SimTime) -> SimTime {
    let base = barrier_time.saturating_add(min_latency);
    if global_min_pending == TIME_MAX {
        // Nothing pending anywhere; the caller reports `drained`.
        return base;
    }
    base.max(global_min_pending)
}
