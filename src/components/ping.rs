//! A component that echoes every event back on its single port.
//!
//! Two `PingPong`s on one link bounce an event back and forth forever,
//! one round trip per link latency. The side configured with
//! `start = true` serves the first ball during setup.

use serde::{Deserialize, Serialize};

use crate::component::{BaseComponentData, Component, ComponentError, ComponentRegistry, PortDecl};
use crate::event::{Event, Payload};
use crate::sim::SimContext;

#[derive(Debug)]
pub struct PingPong {
    base: BaseComponentData,
    received: u64,
    sent: u64,
}

#[derive(Serialize, Deserialize)]
struct PingPongState {
    received: u64,
    sent: u64,
}

impl PingPong {
    pub fn new(base: BaseComponentData) -> Self {
        Self {
            base,
            received: 0,
            sent: 0,
        }
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    fn volley(&mut self, hop: u64, ctx: &mut SimContext<'_>) -> Result<(), ComponentError> {
        let link = self
            .base
            .link("port")
            .ok_or_else(|| ComponentError::new("port not wired"))?;
        ctx.send(link, 0, serde_json::json!({ "hop": hop }))?;
        self.sent += 1;
        Ok(())
    }
}

impl Component for PingPong {
    fn base(&self) -> &BaseComponentData {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseComponentData {
        &mut self.base
    }

    fn setup(&mut self, ctx: &mut SimContext<'_>) {
        if self.base.params.get_typed("start", false) {
            // Port is checked at wire-up; a missing link here is a bug.
            self.volley(0, ctx).expect("serve");
        }
    }

    fn handle_event(
        &mut self,
        _port: &str,
        event: Event,
        ctx: &mut SimContext<'_>,
    ) -> Result<(), ComponentError> {
        self.received += 1;
        if let Some(stat) = ctx.stat("events_received") {
            ctx.stat_add(stat, 1.0);
        }
        let hop = match &event.payload {
            Payload::Data(v) => v["hop"].as_u64().unwrap_or(0),
            Payload::Null => 0,
        };
        self.volley(hop + 1, ctx)
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(PingPongState {
            received: self.received,
            sent: self.sent,
        })
        .unwrap_or_default()
    }

    fn restore(&mut self, state: serde_json::Value) {
        if let Ok(s) = serde_json::from_value::<PingPongState>(state) {
            self.received = s.received;
            self.sent = s.sent;
        }
    }
}

pub fn register(registry: &mut ComponentRegistry) {
    registry.register(
        "PingPong",
        vec![PortDecl::new("port", "Ball")],
        |base| Box::new(PingPong::new(base)),
    );
}
