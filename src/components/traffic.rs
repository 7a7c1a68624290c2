//! Clock-driven traffic source and a counting sink.

use serde::{Deserialize, Serialize};

use crate::component::{BaseComponentData, Component, ComponentError, ComponentRegistry, PortDecl};
use crate::event::Event;
use crate::sim::SimContext;

/// Emits one packet per clock cycle on its `out` port, up to `count`
/// packets.
///
/// Parameters: `count` (packets to send, default 10), `interval` (clock
/// period in ticks, default 100), `keep_alive` (hold an exit reference
/// until the last packet, default false).
#[derive(Debug)]
pub struct TrafficSource {
    base: BaseComponentData,
    count: u64,
    interval: u64,
    keep_alive: bool,
    sent: u64,
}

impl TrafficSource {
    pub fn new(base: BaseComponentData) -> Self {
        let count = base.params.get_typed("count", 10u64);
        let interval = base.params.get_typed("interval", 100u64);
        let keep_alive = base.params.get_typed("keep_alive", false);
        Self {
            base,
            count,
            interval,
            keep_alive,
            sent: 0,
        }
    }
}

impl Component for TrafficSource {
    fn base(&self) -> &BaseComponentData {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseComponentData {
        &mut self.base
    }

    fn setup(&mut self, ctx: &mut SimContext<'_>) {
        if self.sent >= self.count {
            return;
        }
        if self.keep_alive {
            ctx.exit_inc();
        }
        ctx.register_clock(self.interval);
    }

    fn handle_event(
        &mut self,
        _port: &str,
        _event: Event,
        _ctx: &mut SimContext<'_>,
    ) -> Result<(), ComponentError> {
        Err(ComponentError::new("traffic source accepts no input"))
    }

    fn on_clock(&mut self, _cycle: u64, ctx: &mut SimContext<'_>) -> bool {
        let Some(link) = self.base.link("out") else {
            return true;
        };
        let seq = self.sent;
        if ctx.send(link, 0, serde_json::json!({ "seq": seq })).is_err() {
            return true;
        }
        self.sent += 1;
        if self.sent >= self.count {
            if self.keep_alive {
                ctx.exit_dec();
            }
            return true;
        }
        false
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({ "sent": self.sent })
    }

    fn restore(&mut self, state: serde_json::Value) {
        self.sent = state["sent"].as_u64().unwrap_or(0);
    }
}

/// Counts everything arriving on its `in` port.
///
/// Feeds a `received` statistic when one is configured.
#[derive(Debug)]
pub struct Sink {
    base: BaseComponentData,
    received: u64,
    last_seq: Option<u64>,
}

#[derive(Serialize, Deserialize)]
struct SinkState {
    received: u64,
    last_seq: Option<u64>,
}

impl Sink {
    pub fn new(base: BaseComponentData) -> Self {
        Self {
            base,
            received: 0,
            last_seq: None,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }
}

impl Component for Sink {
    fn base(&self) -> &BaseComponentData {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseComponentData {
        &mut self.base
    }

    fn handle_event(
        &mut self,
        _port: &str,
        event: Event,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), ComponentError> {
        self.received += 1;
        if let crate::event::Payload::Data(v) = &event.payload {
            if let Some(seq) = v["seq"].as_u64() {
                // Per-link FIFO: sequence numbers never regress.
                if let Some(last) = self.last_seq {
                    if seq <= last {
                        return Err(ComponentError::new(format!(
                            "out-of-order delivery: {seq} after {last}"
                        )));
                    }
                }
                self.last_seq = Some(seq);
            }
        }
        if let Some(stat) = ctx.stat("received") {
            ctx.stat_add(stat, 1.0);
        }
        Ok(())
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(SinkState {
            received: self.received,
            last_seq: self.last_seq,
        })
        .unwrap_or_default()
    }

    fn restore(&mut self, state: serde_json::Value) {
        if let Ok(s) = serde_json::from_value::<SinkState>(state) {
            self.received = s.received;
            self.last_seq = s.last_seq;
        }
    }
}

pub fn register(registry: &mut ComponentRegistry) {
    registry.register(
        "TrafficSource",
        vec![PortDecl::new("out", "Packet")],
        |base| Box::new(TrafficSource::new(base)),
    );
    registry.register("Sink", vec![PortDecl::new("in", "Packet")], |base| {
        Box::new(Sink::new(base))
    });
}
