//! # Tempest Simulation Core
//!
//! A conservative parallel discrete-event simulation (PDES) engine.
//! A simulation is a graph of user-defined components connected by
//! fixed-latency links, partitioned across `R ranks x T threads`
//! partitions that each own a private time-ordered activity queue.
//!
//! ## Design Principles
//!
//! - **One timeline, integer ticks**: the [`time::TimeLord`] fixes a base
//!   tick at startup; every schedule is integer arithmetic on ticks.
//! - **Conservative windows**: partitions advance freely up to the global
//!   minimum cross-partition link latency past the last barrier, then
//!   exchange boundary events and agree on the next window. No rollback.
//! - **Everything is an activity**: events, clocks, statistic flushes,
//!   sync barriers, checkpoints, and the stop condition all flow through
//!   the same ordered queue, so "run to the window edge" is a single pop
//!   loop.
//! - **Id-based delivery**: events carry destination link ids, never
//!   pointers, which is also what makes checkpoint/restart a two-pass
//!   rebuild.

pub mod checkpoint;
pub mod component;
pub mod components;
pub mod config;
pub mod event;
pub mod exit;
pub mod graph;
pub mod link;
pub mod params;
pub mod partition;
pub mod signal;
pub mod sim;
pub mod stats;
pub mod sync;
pub mod time;
pub mod types;
pub mod vortex;
pub mod wire;
pub mod wireup;

// Re-export commonly used types
pub use component::{BaseComponentData, Component, ComponentError, ComponentRegistry, PortDecl};
pub use config::{EngineConfig, EngineConfigBuilder, GraphSpec};
pub use event::{Action, Activity, Event, Payload};
pub use graph::{ConfigGraph, ConfigStatistic};
pub use params::Params;
pub use sim::{run_ranks, SimContext, SimError, SimReport, Simulation};
pub use time::{TimeConverter, TimeLord};
pub use types::{ComponentId, LinkId, PartitionId, RankId, SimTime, ThreadId, Topology};
pub use vortex::TimeVortex;
