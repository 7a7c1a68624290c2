//! Intra-rank synchronization: shared-memory event exchange between the
//! threads of one rank.
//!
//! One [`ThreadSync`] exists per rank, shared by its `T` partition
//! threads. Each directed (src, dst) thread pair owns a dedicated
//! unbounded channel; sends during a window go straight into the channel
//! and the receiver only drains at a barrier, after every sender has
//! arrived, so the barrier itself seals the queues.
//!
//! The struct also carries the per-barrier scratch slots each thread
//! publishes into (earliest pending time, exit count, votes) and the
//! agreed [`SyncOutcome`] thread 0 writes back. The barrier protocol
//! itself is driven by the scheduler; this type only provides the
//! primitives.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Barrier;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::checkpoint::PartitionSnapshot;
use crate::event::Event;
use crate::stats::StatRow;
use crate::sync::SyncOutcome;
use crate::types::{LinkId, SimTime, ThreadId, TIME_MAX};

/// Per-thread values published at a barrier.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadReport {
    /// Earliest pending activity after draining inbound queues.
    pub min_pending: SimTime,
    /// Absolute local exit count.
    pub exit_count: i64,
    pub exit_armed: bool,
    pub checkpoint_vote: bool,
    pub stop_vote: bool,
    pub failure_vote: bool,
    /// Init fixed point: this partition did work or sent events.
    pub work_vote: bool,
}

/// Rank-level aggregation of all thread reports.
#[derive(Clone, Copy, Debug, Default)]
pub struct RankAggregate {
    pub min_pending: SimTime,
    pub exit_sum: i64,
    pub exit_armed: bool,
    pub checkpoint: bool,
    pub stop: bool,
    pub failed: bool,
    pub work: bool,
}

/// Shared synchronization state for the threads of one rank.
pub struct ThreadSync {
    threads: u32,
    barrier: Barrier,
    /// Event channels, indexed `src * threads + dst`.
    event_tx: Vec<Sender<Event>>,
    event_rx: Vec<Receiver<Event>>,
    /// Fan-out of rank-inbound events to destination threads.
    inbox_tx: Vec<Sender<Event>>,
    inbox_rx: Vec<Receiver<Event>>,
    /// Outgoing cross-rank batches staged by all threads, indexed by
    /// destination rank. Thread 0 takes them for the collective.
    rank_staging: Mutex<Vec<Vec<Event>>>,
    /// Per-thread partition snapshots staged at a checkpoint barrier;
    /// thread 0 takes them and writes the rank blob.
    ckpt_staging: Mutex<Vec<Option<PartitionSnapshot>>>,
    /// Statistic rows funneled to thread 0 at end of simulation; thread 0
    /// owns the rank's sink file.
    stat_staging: Mutex<Vec<StatRow>>,
    /// Destination thread for every link endpoint owned by this rank.
    link_thread: HashMap<LinkId, ThreadId>,
    mins: Vec<AtomicU64>,
    exits: Vec<AtomicI64>,
    armed: Vec<AtomicBool>,
    ckpt_votes: Vec<AtomicBool>,
    stop_votes: Vec<AtomicBool>,
    fail_votes: Vec<AtomicBool>,
    work_votes: Vec<AtomicBool>,
    out_window: AtomicU64,
    out_exit_done: AtomicBool,
    out_drained: AtomicBool,
    out_checkpoint: AtomicBool,
    out_stop: AtomicBool,
    out_failed: AtomicBool,
    out_work: AtomicBool,
}

impl ThreadSync {
    /// Builds the shared state for `threads` partition threads and
    /// `ranks` destination ranks. `link_thread` maps every link endpoint
    /// owned by this rank to its owning thread, for inbound fan-out.
    pub fn new(threads: u32, ranks: u32, link_thread: HashMap<LinkId, ThreadId>) -> Self {
        let t = threads as usize;
        let mut event_tx = Vec::with_capacity(t * t);
        let mut event_rx = Vec::with_capacity(t * t);
        for _ in 0..t * t {
            let (tx, rx) = crossbeam_channel::unbounded();
            event_tx.push(tx);
            event_rx.push(rx);
        }
        let mut inbox_tx = Vec::with_capacity(t);
        let mut inbox_rx = Vec::with_capacity(t);
        for _ in 0..t {
            let (tx, rx) = crossbeam_channel::unbounded();
            inbox_tx.push(tx);
            inbox_rx.push(rx);
        }
        Self {
            threads,
            barrier: Barrier::new(t),
            event_tx,
            event_rx,
            inbox_tx,
            inbox_rx,
            rank_staging: Mutex::new(vec![Vec::new(); ranks as usize]),
            ckpt_staging: Mutex::new((0..t).map(|_| None).collect()),
            stat_staging: Mutex::new(Vec::new()),
            link_thread,
            mins: (0..t).map(|_| AtomicU64::new(TIME_MAX)).collect(),
            exits: (0..t).map(|_| AtomicI64::new(0)).collect(),
            armed: (0..t).map(|_| AtomicBool::new(false)).collect(),
            ckpt_votes: (0..t).map(|_| AtomicBool::new(false)).collect(),
            stop_votes: (0..t).map(|_| AtomicBool::new(false)).collect(),
            fail_votes: (0..t).map(|_| AtomicBool::new(false)).collect(),
            work_votes: (0..t).map(|_| AtomicBool::new(false)).collect(),
            out_window: AtomicU64::new(0),
            out_exit_done: AtomicBool::new(false),
            out_drained: AtomicBool::new(false),
            out_checkpoint: AtomicBool::new(false),
            out_stop: AtomicBool::new(false),
            out_failed: AtomicBool::new(false),
            out_work: AtomicBool::new(false),
        }
    }

    pub fn threads(&self) -> u32 {
        self.threads
    }

    /// Blocks until all threads of the rank arrive.
    pub fn wait(&self) {
        self.barrier.wait();
    }

    /// Queues an event from `src` thread to `dst` thread. Safe during the
    /// run window; the receiver drains only after the next barrier.
    pub fn send_event(&self, src: ThreadId, dst: ThreadId, event: Event) {
        let idx = (src * self.threads + dst) as usize;
        // Receiver end lives as long as self; send cannot fail.
        let _ = self.event_tx[idx].send(event);
    }

    /// Stages an outgoing cross-rank batch for the next collective.
    pub fn stage_rank_batch(&self, dst_rank: usize, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        self.rank_staging.lock()[dst_rank].extend(events);
    }

    /// Takes all staged cross-rank batches. Thread 0 only, between
    /// barriers.
    pub fn take_rank_staging(&self) -> Vec<Vec<Event>> {
        let mut staging = self.rank_staging.lock();
        let ranks = staging.len();
        std::mem::replace(&mut *staging, vec![Vec::new(); ranks])
    }

    /// Routes rank-inbound events to their destination threads' inboxes.
    /// Thread 0 only.
    pub fn route_rank_inbound(&self, events: Vec<Event>) {
        for ev in events {
            match self.link_thread.get(&ev.dest_link) {
                Some(&thread) => {
                    let _ = self.inbox_tx[thread as usize].send(ev);
                }
                None => {
                    // A link this rank does not own: wire-up bug.
                    panic!(
                        "inbound event addressed to unknown link {} on this rank",
                        ev.dest_link
                    );
                }
            }
        }
    }

    /// Drains everything addressed to `dst`: all thread pair channels
    /// plus the rank inbox. Call only between barriers.
    pub fn drain_events(&self, dst: ThreadId, mut deliver: impl FnMut(Event)) {
        for src in 0..self.threads {
            let idx = (src * self.threads + dst) as usize;
            while let Ok(ev) = self.event_rx[idx].try_recv() {
                deliver(ev);
            }
        }
        while let Ok(ev) = self.inbox_rx[dst as usize].try_recv() {
            deliver(ev);
        }
    }

    /// Stages this thread's partition snapshot at a checkpoint barrier.
    pub fn stage_checkpoint(&self, thread: ThreadId, snapshot: PartitionSnapshot) {
        self.ckpt_staging.lock()[thread as usize] = Some(snapshot);
    }

    /// Takes all staged snapshots in thread order. Thread 0 only, after
    /// the staging barrier.
    pub fn take_checkpoints(&self) -> Vec<PartitionSnapshot> {
        self.ckpt_staging
            .lock()
            .iter_mut()
            .filter_map(Option::take)
            .collect()
    }

    /// Funnels statistic rows toward the rank's sink owner (thread 0).
    pub fn stage_stat_rows(&self, rows: Vec<StatRow>) {
        self.stat_staging.lock().extend(rows);
    }

    /// Takes all funneled statistic rows. Thread 0 only.
    pub fn take_stat_rows(&self) -> Vec<StatRow> {
        std::mem::take(&mut *self.stat_staging.lock())
    }

    /// Publishes this thread's barrier report.
    pub fn publish(&self, thread: ThreadId, report: ThreadReport) {
        let i = thread as usize;
        self.mins[i].store(report.min_pending, Ordering::Release);
        self.exits[i].store(report.exit_count, Ordering::Release);
        self.armed[i].store(report.exit_armed, Ordering::Release);
        self.ckpt_votes[i].store(report.checkpoint_vote, Ordering::Release);
        self.stop_votes[i].store(report.stop_vote, Ordering::Release);
        self.fail_votes[i].store(report.failure_vote, Ordering::Release);
        self.work_votes[i].store(report.work_vote, Ordering::Release);
    }

    /// Aggregates all thread reports. Thread 0, after the publish
    /// barrier.
    pub fn aggregate(&self) -> RankAggregate {
        let t = self.threads as usize;
        let mut agg = RankAggregate {
            min_pending: TIME_MAX,
            ..Default::default()
        };
        for i in 0..t {
            agg.min_pending = agg.min_pending.min(self.mins[i].load(Ordering::Acquire));
            agg.exit_sum += self.exits[i].load(Ordering::Acquire);
            agg.exit_armed |= self.armed[i].load(Ordering::Acquire);
            agg.checkpoint |= self.ckpt_votes[i].load(Ordering::Acquire);
            agg.stop |= self.stop_votes[i].load(Ordering::Acquire);
            agg.failed |= self.fail_votes[i].load(Ordering::Acquire);
            agg.work |= self.work_votes[i].load(Ordering::Acquire);
        }
        agg
    }

    /// Stores the outcome for all threads to read after the final
    /// barrier. Thread 0 only.
    pub fn set_outcome(&self, outcome: SyncOutcome, work: bool) {
        self.out_window.store(outcome.window_end, Ordering::Release);
        self.out_exit_done.store(outcome.exit_done, Ordering::Release);
        self.out_drained.store(outcome.drained, Ordering::Release);
        self.out_checkpoint.store(outcome.checkpoint, Ordering::Release);
        self.out_stop.store(outcome.stop, Ordering::Release);
        self.out_failed.store(outcome.failed, Ordering::Release);
        self.out_work.store(work, Ordering::Release);
    }

    pub fn outcome(&self) -> SyncOutcome {
        SyncOutcome {
            window_end: self.out_window.load(Ordering::Acquire),
            exit_done: self.out_exit_done.load(Ordering::Acquire),
            drained: self.out_drained.load(Ordering::Acquire),
            checkpoint: self.out_checkpoint.load(Ordering::Acquire),
            stop: self.out_stop.load(Ordering::Acquire),
            failed: self.out_failed.load(Ordering::Acquire),
        }
    }

    /// Global "any work done" flag from the last init exchange.
    pub fn work_flag(&self) -> bool {
        self.out_work.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, Payload};
    use crate::types::priority;

    fn ev(seq: u64, dest_link: LinkId) -> Event {
        Event {
            deliver_time: seq,
            priority: priority::EVENT,
            order_tag: 0,
            queue_order: seq,
            dest_link,
            id: EventId { serial: seq, rank: 0 },
            payload: Payload::Null,
        }
    }

    #[test]
    fn test_pairwise_channels_preserve_order() {
        let sync = ThreadSync::new(2, 1, HashMap::new());
        sync.send_event(0, 1, ev(1, 0));
        sync.send_event(0, 1, ev(2, 0));
        sync.send_event(1, 0, ev(3, 0));

        let mut got = Vec::new();
        sync.drain_events(1, |e| got.push(e.queue_order));
        assert_eq!(got, vec![1, 2]);

        got.clear();
        sync.drain_events(0, |e| got.push(e.queue_order));
        assert_eq!(got, vec![3]);
    }

    #[test]
    fn test_rank_inbound_fan_out() {
        let mut link_thread = HashMap::new();
        link_thread.insert(10, 0);
        link_thread.insert(11, 1);
        let sync = ThreadSync::new(2, 2, link_thread);

        sync.route_rank_inbound(vec![ev(1, 10), ev(2, 11), ev(3, 10)]);

        let mut t0 = Vec::new();
        sync.drain_events(0, |e| t0.push(e.queue_order));
        assert_eq!(t0, vec![1, 3]);

        let mut t1 = Vec::new();
        sync.drain_events(1, |e| t1.push(e.queue_order));
        assert_eq!(t1, vec![2]);
    }

    #[test]
    fn test_rank_staging_accumulates_and_clears() {
        let sync = ThreadSync::new(2, 3, HashMap::new());
        sync.stage_rank_batch(1, vec![ev(1, 0)]);
        sync.stage_rank_batch(1, vec![ev(2, 0)]);
        sync.stage_rank_batch(2, vec![ev(3, 0)]);

        let staged = sync.take_rank_staging();
        assert_eq!(staged[0].len(), 0);
        assert_eq!(staged[1].len(), 2);
        assert_eq!(staged[2].len(), 1);

        let again = sync.take_rank_staging();
        assert!(again.iter().all(Vec::is_empty));
    }

    #[test]
    fn test_publish_and_aggregate() {
        let sync = ThreadSync::new(3, 1, HashMap::new());
        sync.publish(
            0,
            ThreadReport {
                min_pending: 500,
                exit_count: 2,
                exit_armed: true,
                ..Default::default()
            },
        );
        sync.publish(
            1,
            ThreadReport {
                min_pending: 200,
                exit_count: -1,
                ..Default::default()
            },
        );
        sync.publish(
            2,
            ThreadReport {
                min_pending: TIME_MAX,
                exit_count: 0,
                checkpoint_vote: true,
                ..Default::default()
            },
        );

        let agg = sync.aggregate();
        assert_eq!(agg.min_pending, 200);
        assert_eq!(agg.exit_sum, 1);
        assert!(agg.exit_armed);
        assert!(agg.checkpoint);
        assert!(!agg.stop);
        assert!(!agg.failed);
    }

    #[test]
    fn test_outcome_round_trip() {
        let sync = ThreadSync::new(1, 1, HashMap::new());
        let outcome = SyncOutcome {
            window_end: 1500,
            exit_done: true,
            drained: false,
            checkpoint: true,
            stop: false,
            failed: false,
        };
        sync.set_outcome(outcome, true);
        assert_eq!(sync.outcome(), outcome);
        assert!(sync.work_flag());
    }

    #[test]
    fn test_barrier_across_threads() {
        use std::sync::Arc;
        let sync = Arc::new(ThreadSync::new(4, 1, HashMap::new()));
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let sync = Arc::clone(&sync);
                std::thread::spawn(move || {
                    sync.publish(
                        t,
                        ThreadReport {
                            min_pending: 100 * (t as u64 + 1),
                            ..Default::default()
                        },
                    );
                    sync.wait();
                    if t == 0 {
                        let agg = sync.aggregate();
                        assert_eq!(agg.min_pending, 100);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
