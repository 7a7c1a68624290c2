//! A component modeling a fixed amount of outstanding work.
//!
//! `Worker` holds an exit reference from setup until `work_for` ticks
//! have elapsed, then releases it. With only workers in a graph, the
//! simulation ends at the first barrier at or after the last release.

use crate::component::{BaseComponentData, Component, ComponentError, ComponentRegistry};
use crate::event::Event;
use crate::sim::SimContext;

#[derive(Debug)]
pub struct Worker {
    base: BaseComponentData,
    work_for: u64,
    done: bool,
}

impl Worker {
    pub fn new(base: BaseComponentData) -> Self {
        let work_for = base.params.get_typed("work_for", 100u64);
        Self {
            base,
            work_for,
            done: false,
        }
    }
}

impl Component for Worker {
    fn base(&self) -> &BaseComponentData {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseComponentData {
        &mut self.base
    }

    fn setup(&mut self, ctx: &mut SimContext<'_>) {
        if self.done {
            return;
        }
        ctx.exit_inc();
        ctx.register_clock(self.work_for);
    }

    fn handle_event(
        &mut self,
        _port: &str,
        _event: Event,
        _ctx: &mut SimContext<'_>,
    ) -> Result<(), ComponentError> {
        Ok(())
    }

    fn on_clock(&mut self, _cycle: u64, ctx: &mut SimContext<'_>) -> bool {
        if !self.done {
            self.done = true;
            ctx.exit_dec();
        }
        true
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "done": self.done })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.done = state["done"].as_bool().unwrap_or(false);
    }
}

pub fn register(registry: &mut ComponentRegistry) {
    registry.register("Worker", vec![], |base| Box::new(Worker::new(base)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkMap;
    use crate::sim::PartitionCore;
    use crate::stats::{StatEngine, StatOutputFormat};
    use crate::types::{PartitionId, Topology};

    fn core() -> PartitionCore {
        PartitionCore::new(
            PartitionId::new(0, 0),
            Topology::new(1, 1),
            LinkMap::new(),
            StatEngine::new(StatOutputFormat::Csv, ".", "t", 0, 1),
            false,
        )
    }

    #[test]
    fn test_worker_holds_then_releases() {
        let mut base = BaseComponentData::default();
        base.params.insert("work_for", "50", true);
        let mut w = Worker::new(base);
        let mut c = core();

        w.setup(&mut c.context(0));
        assert_eq!(c.exit.local_count(), 1);
        assert!(c.exit.locally_armed());

        // First clock fire releases the reference and unregisters.
        assert!(w.on_clock(1, &mut c.context(0)));
        assert_eq!(c.exit.local_count(), 0);
    }

    #[test]
    fn test_restored_worker_does_not_rearm() {
        let mut base = BaseComponentData::default();
        base.params.insert("work_for", "50", true);
        let mut w = Worker::new(base);
        w.restore(serde_json::json!({ "done": true }));

        let mut c = core();
        w.setup(&mut c.context(0));
        assert_eq!(c.exit.local_count(), 0);
    }
}
