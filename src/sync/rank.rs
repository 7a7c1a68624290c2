//! Inter-rank synchronization over a collective transport.
//!
//! [`RankSync`] exchanges serialized event batches between ranks with one
//! all-to-all per barrier and reduces window/exit values with
//! allreduce operations. The transport is the [`Collective`] trait;
//! [`MemoryCollective`] is the in-process implementation connecting rank
//! threads in one address space, which is also what the tests drive.
//! Batches make the full serialize → exchange → deserialize round trip
//! through [`crate::wire`] either way, so the wire contract is exercised
//! even in-process.

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::event::Event;
use crate::types::RankId;
use crate::wire::{self, WireError};

#[derive(Debug, Error)]
pub enum RankSyncError {
    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("collective failed: {0}")]
    Collective(String),
}

/// The collective operations RankSync needs from its transport.
///
/// Every rank must call the same operations in the same order; each call
/// is a synchronization point across all ranks.
pub trait Collective: Send {
    fn ranks(&self) -> u32;
    fn rank(&self) -> RankId;

    /// Blocks until all ranks arrive.
    fn barrier(&self);

    /// Global minimum of `value` across ranks.
    fn allreduce_min(&self, value: u64) -> u64;

    /// Global sum of `value` across ranks.
    fn allreduce_sum(&self, value: i64) -> i64;

    /// Sends `out[r]` to rank `r` and returns the buffers received from
    /// every rank, indexed by source rank.
    fn alltoall(&self, out: Vec<Vec<u8>>) -> Vec<Vec<u8>>;
}

enum Packet {
    Value(u64),
    Signed(i64),
    Bytes(Vec<u8>),
    Token,
}

/// In-process collective: a full mesh of channels between rank threads.
///
/// Each operation sends to every peer and receives one packet from every
/// peer; per-pair FIFO plus the identical operation order on every rank
/// keeps packets matched to operations.
pub struct MemoryCollective {
    rank: RankId,
    ranks: u32,
    senders: Vec<Sender<Packet>>,
    receivers: Vec<Receiver<Packet>>,
}

impl MemoryCollective {
    /// Creates one connected collective handle per rank.
    pub fn create(ranks: u32) -> Vec<MemoryCollective> {
        let n = ranks as usize;
        let mut txs: Vec<Vec<Option<Sender<Packet>>>> = (0..n).map(|_| vec![None; n]).collect();
        let mut rxs: Vec<Vec<Option<Receiver<Packet>>>> = (0..n).map(|_| vec![None; n]).collect();
        for from in 0..n {
            for to in 0..n {
                let (tx, rx) = crossbeam_channel::unbounded();
                txs[from][to] = Some(tx);
                rxs[to][from] = Some(rx);
            }
        }
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (tx_row, rx_row))| MemoryCollective {
                rank: rank as RankId,
                ranks,
                senders: tx_row.into_iter().map(|t| t.expect("mesh built")).collect(),
                receivers: rx_row.into_iter().map(|r| r.expect("mesh built")).collect(),
            })
            .collect()
    }

    fn exchange(&self, mut make: impl FnMut(usize) -> Packet) -> Vec<Packet> {
        let me = self.rank as usize;
        for (peer, tx) in self.senders.iter().enumerate() {
            if peer != me {
                // A disconnected peer means that rank died; treated as
                // fatal by the caller via panic propagation at join.
                tx.send(make(peer)).expect("peer rank disappeared");
            }
        }
        let mut inbound = Vec::with_capacity(self.ranks as usize);
        for (peer, rx) in self.receivers.iter().enumerate() {
            if peer == me {
                inbound.push(make(me));
            } else {
                inbound.push(rx.recv().expect("peer rank disappeared"));
            }
        }
        inbound
    }
}

impl Collective for MemoryCollective {
    fn ranks(&self) -> u32 {
        self.ranks
    }

    fn rank(&self) -> RankId {
        self.rank
    }

    fn barrier(&self) {
        self.exchange(|_| Packet::Token);
    }

    fn allreduce_min(&self, value: u64) -> u64 {
        self.exchange(|_| Packet::Value(value))
            .into_iter()
            .map(|p| match p {
                Packet::Value(v) => v,
                _ => unreachable!("mismatched collective"),
            })
            .min()
            .unwrap_or(value)
    }

    fn allreduce_sum(&self, value: i64) -> i64 {
        self.exchange(|_| Packet::Signed(value))
            .into_iter()
            .map(|p| match p {
                Packet::Signed(v) => v,
                _ => unreachable!("mismatched collective"),
            })
            .sum()
    }

    fn alltoall(&self, out: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        assert_eq!(out.len(), self.ranks as usize);
        let mut out = out.into_iter().map(Some).collect::<Vec<_>>();
        self.exchange(|peer| Packet::Bytes(out[peer].take().unwrap_or_default()))
            .into_iter()
            .map(|p| match p {
                Packet::Bytes(b) => b,
                _ => unreachable!("mismatched collective"),
            })
            .collect()
    }
}

/// The rank-level half of a barrier: batch exchange plus reductions.
pub struct RankSync {
    collective: Box<dyn Collective>,
}

impl RankSync {
    pub fn new(collective: Box<dyn Collective>) -> Self {
        Self { collective }
    }

    pub fn ranks(&self) -> u32 {
        self.collective.ranks()
    }

    pub fn rank(&self) -> RankId {
        self.collective.rank()
    }

    pub fn barrier(&self) {
        self.collective.barrier();
    }

    pub fn allreduce_min(&self, value: u64) -> u64 {
        self.collective.allreduce_min(value)
    }

    pub fn allreduce_sum(&self, value: i64) -> i64 {
        self.collective.allreduce_sum(value)
    }

    /// Serializes per-destination-rank batches, runs the all-to-all, and
    /// returns all inbound events. The caller (thread 0 of the rank) fans
    /// them out to destination threads.
    pub fn exchange_events(
        &self,
        out_by_rank: Vec<Vec<Event>>,
    ) -> Result<Vec<Event>, RankSyncError> {
        let mut encoded = Vec::with_capacity(out_by_rank.len());
        for batch in &out_by_rank {
            encoded.push(wire::encode_batch(batch)?);
        }
        let inbound = self.collective.alltoall(encoded);
        let mut events = Vec::new();
        for (source, buf) in inbound.into_iter().enumerate() {
            if source == self.rank() as usize {
                continue;
            }
            events.extend(wire::decode_batch(&buf)?);
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Payload};
    use crate::types::priority;

    fn spawn_ranks<F, R>(ranks: u32, f: F) -> Vec<R>
    where
        F: Fn(MemoryCollective) -> R + Send + Sync + Clone + 'static,
        R: Send + 'static,
    {
        let handles: Vec<_> = MemoryCollective::create(ranks)
            .into_iter()
            .map(|c| {
                let f = f.clone();
                std::thread::spawn(move || f(c))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_allreduce_min() {
        let results = spawn_ranks(3, |c| c.allreduce_min(100 + c.rank() as u64 * 10));
        assert_eq!(results, vec![100, 100, 100]);
    }

    #[test]
    fn test_allreduce_sum() {
        let results = spawn_ranks(4, |c| c.allreduce_sum(c.rank() as i64 + 1));
        assert_eq!(results, vec![10, 10, 10, 10]);
    }

    #[test]
    fn test_alltoall_routes_by_destination() {
        let results = spawn_ranks(3, |c| {
            let me = c.rank();
            let out = (0..3).map(|dst| vec![me as u8, dst as u8]).collect();
            c.alltoall(out)
        });
        // Rank 1 receives [src, 1] from every source.
        assert_eq!(results[1][0], vec![0u8, 1]);
        assert_eq!(results[1][2], vec![2u8, 1]);
    }

    #[test]
    fn test_exchange_events_round_trip() {
        fn ev(seq: u64, rank: RankId) -> Event {
            Event {
                deliver_time: 10 * seq,
                priority: priority::EVENT,
                order_tag: 1,
                queue_order: seq,
                dest_link: seq,
                id: EventId { serial: seq, rank },
                payload: Payload::Data(serde_json::json!({"from": rank})),
            }
        }

        let results = spawn_ranks(2, |c| {
            let me = c.rank();
            let sync = RankSync::new(Box::new(c));
            let mut out = vec![Vec::new(), Vec::new()];
            // Each rank sends two events to the other.
            out[(1 - me) as usize] = vec![ev(1, me), ev(2, me)];
            sync.exchange_events(out).unwrap()
        });

        for (me, events) in results.iter().enumerate() {
            assert_eq!(events.len(), 2);
            for e in events {
                assert_eq!(e.id.rank, 1 - me as RankId);
            }
            // Per-link FIFO: queue_order preserved in batch order.
            assert!(events[0].queue_order < events[1].queue_order);
        }
    }

    #[test]
    fn test_barrier_completes() {
        let results = spawn_ranks(3, |c| {
            c.barrier();
            c.barrier();
            true
        });
        assert_eq!(results, vec![true, true, true]);
    }
}
