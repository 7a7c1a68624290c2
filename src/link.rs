//! Links: typed directional channels with fixed latency.
//!
//! A configured link has two endpoints; wire-up materializes one [`Link`]
//! per endpoint in the partition that owns it. Each endpoint records the
//! component and port that own it, its outgoing `latency`, its `partner`
//! endpoint id, and a [`DeliveryTarget`] describing where the partner
//! lives: this partition, another thread of this rank, or another rank.
//!
//! Sending an event on endpoint A stamps `deliver_time = now + latency +
//! extra_delay`, A's deterministic order tag, the partition's insertion
//! sequence, and `dest_link = A.partner`; routing follows `A.target`. On
//! delivery the receiving partition resolves `dest_link` to the partner
//! endpoint and dispatches to that endpoint's owning component and port.
//! Events sent on the same link are received in send order.

use serde::{Deserialize, Serialize};

use crate::types::{ComponentId, LinkId, RankId, SimTime, ThreadId};

/// Where events sent on a link endpoint are routed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryTarget {
    /// Partner endpoint in this partition: push straight into the local
    /// vortex.
    Local,
    /// Partner endpoint owned by another thread of this rank.
    CrossThread { thread: ThreadId },
    /// Partner endpoint owned by another rank.
    CrossRank { rank: RankId, thread: ThreadId },
}

impl DeliveryTarget {
    /// True when events on this endpoint leave the sending partition.
    pub fn crosses_partition(&self) -> bool {
        !matches!(self, DeliveryTarget::Local)
    }

    pub fn crosses_rank(&self) -> bool {
        matches!(self, DeliveryTarget::CrossRank { .. })
    }
}

/// One live endpoint of a configured link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub id: LinkId,
    /// Component owning this endpoint; events *addressed to* this
    /// endpoint are delivered here.
    pub owner: ComponentId,
    /// Port name on the owning component.
    pub owner_port: String,
    /// Outgoing latency in ticks. Both endpoints of a logical link carry
    /// the same configured value unless explicitly overridden; the
    /// sender's copy is the one applied.
    pub latency: SimTime,
    /// The endpoint id events sent here are addressed to.
    pub partner: LinkId,
    /// Deterministic tag shared by both endpoints, derived from the
    /// sorted endpoint names. Third field of the activity order.
    pub order_tag: u64,
    pub target: DeliveryTarget,
    /// Declared event-type name of the owning port; wire-up refuses links
    /// whose endpoints declare different types.
    pub event_type: String,
}

impl Link {
    /// Delivery time for an event sent now with an additional delay.
    pub fn deliver_time(&self, now: SimTime, extra_delay: SimTime) -> SimTime {
        now + self.latency + extra_delay
    }
}

/// Deterministic order tag from the two endpoint names ("comp.port").
///
/// The names are sorted before hashing so both endpoints compute the same
/// tag, and the hash is FNV-1a so the tag is stable across processes and
/// runs.
pub fn order_tag_for(endpoint_a: &str, endpoint_b: &str) -> u64 {
    let (lo, hi) = if endpoint_a <= endpoint_b {
        (endpoint_a, endpoint_b)
    } else {
        (endpoint_b, endpoint_a)
    };
    let mut hash = fnv1a(lo.as_bytes(), 0xcbf2_9ce4_8422_2325);
    hash = fnv1a(b"|", hash);
    fnv1a(hi.as_bytes(), hash)
}

pub(crate) fn fnv1a(bytes: &[u8], mut hash: u64) -> u64 {
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// The link table of one partition.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkMap {
    links: std::collections::HashMap<LinkId, Link>,
}

impl LinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, link: Link) {
        self.links.insert(link.id, link);
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(&id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.values()
    }

    /// Minimum latency over links leaving this partition, or `None` if no
    /// link crosses the boundary.
    pub fn min_cross_partition_latency(&self) -> Option<SimTime> {
        self.links
            .values()
            .filter(|l| l.target.crosses_partition())
            .map(|l| l.latency)
            .min()
    }

    /// Endpoint ids of links leaving this partition, sorted for
    /// deterministic iteration.
    pub fn cross_partition_links(&self) -> Vec<LinkId> {
        let mut out: Vec<_> = self
            .links
            .values()
            .filter(|l| l.target.crosses_partition())
            .map(|l| l.id)
            .collect();
        out.sort_unstable();
        out
    }
}
