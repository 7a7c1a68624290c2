//! Activities: the units scheduled in the time vortex.
//!
//! An [`Activity`] is either an [`Event`] (user payload traveling over a
//! link) or an [`Action`] (engine-internal work such as clock ticks, sync
//! barriers, statistic edges, checkpoint triggers, and the stop action).
//! Activities are totally ordered by `(deliver_time, priority, order_tag,
//! queue_order)`; the last field is an insertion sequence assigned at
//! enqueue, which makes the order a total one and preserves send order for
//! otherwise identical events.

use serde::{Deserialize, Serialize};

use crate::types::{LinkId, RankId, SimTime};

/// Identifier unique across ranks and events, for tracing and debugging.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId {
    pub serial: u64,
    pub rank: RankId,
}

/// The data an event carries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Ordinary user payload.
    Data(serde_json::Value),
    /// Empty carrier used by the sync layers to advance a receiver's safe
    /// window when no real traffic crosses a link. Dropped at dispatch.
    Null,
}

impl Payload {
    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Null)
    }
}

/// An event in flight on a link.
///
/// `dest_link` names the endpoint that will resolve delivery at the
/// receiving partition: a locally-bound endpoint dispatches to its
/// component handler, a sync-bound endpoint forwards across the partition
/// boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub deliver_time: SimTime,
    pub priority: i32,
    /// Deterministic tag derived from the link's sorted endpoint names;
    /// equal-time, equal-priority events from different links sort by it.
    pub order_tag: u64,
    /// Insertion sequence within the enqueueing partition.
    pub queue_order: u64,
    pub dest_link: LinkId,
    pub id: EventId,
    pub payload: Payload,
}

impl Event {
    /// The ordering key for this event.
    pub fn key(&self) -> ActivityKey {
        ActivityKey {
            time: self.deliver_time,
            priority: self.priority,
            order_tag: self.order_tag,
            queue_order: self.queue_order,
        }
    }
}

/// Engine-internal work scheduled in the vortex alongside events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    /// Window edge: pause the run loop and exchange with peer partitions.
    SyncBarrier,
    /// Component clock tick for the given period.
    Clock { period: SimTime },
    /// Periodic statistics flush for all statistics on this period.
    StatOutput { period: SimTime },
    /// One-shot statistic enable.
    StatStart { stat: usize },
    /// One-shot statistic disable.
    StatStop { stat: usize },
    /// Serial-mode checkpoint trigger (multi-partition runs checkpoint at
    /// barriers instead).
    CheckpointTrigger,
    /// End of simulated time.
    Stop,
}

/// An action with its position in the activity order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionEntry {
    pub time: SimTime,
    pub priority: i32,
    pub queue_order: u64,
    pub kind: Action,
}

/// The key that totally orders activities within a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityKey {
    pub time: SimTime,
    pub priority: i32,
    pub order_tag: u64,
    pub queue_order: u64,
}

/// Anything the time vortex can hold.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Activity {
    Event(Event),
    Action(ActionEntry),
}

impl Activity {
    pub fn key(&self) -> ActivityKey {
        match self {
            Activity::Event(e) => e.key(),
            Activity::Action(a) => ActivityKey {
                time: a.time,
                priority: a.priority,
                order_tag: 0,
                queue_order: a.queue_order,
            },
        }
    }

    pub fn time(&self) -> SimTime {
        match self {
            Activity::Event(e) => e.deliver_time,
            Activity::Action(a) => a.time,
        }
    }

    pub fn is_event(&self) -> bool {
        matches!(self, Activity::Event(_))
    }

    pub fn is_action(&self) -> bool {
        matches!(self, Activity::Action(_))
    }
}

impl PartialEq for Activity {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Activity {}

impl PartialOrd for Activity {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Activity {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}
