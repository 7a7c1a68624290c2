//! Wire-up: turning an assigned graph into live partitions.
//!
//! For one rank, wire-up instantiates every component assigned to its
//! partitions through the factory registry, materializes both endpoints
//! of every link the rank touches, type-checks ports against the
//! registry's declarations, and registers the configured statistics.
//! Unknown types, unknown ports, and mismatched port event types are all
//! fatal before the simulation starts.

use std::collections::HashMap;

use thiserror::Error;

use crate::component::{BaseComponentData, ComponentRegistry};
use crate::config::EngineConfig;
use crate::graph::ConfigGraph;
use crate::link::{order_tag_for, DeliveryTarget, Link, LinkMap};
use crate::sim::{PartitionCore, PartitionRunner};
use crate::stats::{StatEngine, StatError};
use crate::time::TimeLord;
use crate::types::{ComponentId, LinkId, PartitionId, RankId, ThreadId, Topology};

#[derive(Debug, Error)]
pub enum WireupError {
    #[error("component \"{name}\" has unregistered type \"{type_name}\"")]
    UnknownComponentType { name: String, type_name: String },

    #[error("type \"{type_name}\" declares no port \"{port}\"")]
    UnknownPort { type_name: String, port: String },

    #[error("link {link} connects port types \"{type_a}\" and \"{type_b}\"")]
    PortTypeMismatch {
        link: LinkId,
        type_a: String,
        type_b: String,
    },

    #[error("component {0} has no partition assignment")]
    Unassigned(ComponentId),

    #[error("statistics error: {0}")]
    Stat(#[from] StatError),
}

/// The wired partitions of one rank, plus the endpoint-to-thread map the
/// sync layer uses to fan inbound events out.
pub struct WiredRank {
    pub runners: Vec<PartitionRunner>,
    pub link_thread: HashMap<LinkId, ThreadId>,
}

impl std::fmt::Debug for WiredRank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiredRank")
            .field("runners", &self.runners.len())
            .field("link_thread", &self.link_thread)
            .finish()
    }
}

/// Builds every partition of `rank` from the assigned graph.
pub fn build_rank(
    graph: &ConfigGraph,
    topo: Topology,
    rank: RankId,
    registry: &ComponentRegistry,
    lord: &TimeLord,
    config: &EngineConfig,
) -> Result<WiredRank, WireupError> {
    let assignment: HashMap<ComponentId, PartitionId> = graph
        .components
        .iter()
        .map(|c| c.partition.map(|p| (c.id, p)).ok_or(WireupError::Unassigned(c.id)))
        .collect::<Result<_, _>>()?;
    let names: HashMap<ComponentId, &str> = graph
        .components
        .iter()
        .map(|c| (c.id, c.name.as_str()))
        .collect();
    let types: HashMap<ComponentId, &str> = graph
        .components
        .iter()
        .map(|c| (c.id, c.type_name.as_str()))
        .collect();

    let mut link_maps: Vec<LinkMap> = (0..topo.threads).map(|_| LinkMap::new()).collect();
    let mut link_thread: HashMap<LinkId, ThreadId> = HashMap::new();
    let mut port_bindings: HashMap<ComponentId, HashMap<String, LinkId>> = HashMap::new();

    for cfg_link in &graph.links {
        // Check both port declarations regardless of ownership so a
        // misdeclared remote side fails everywhere identically.
        let mut decls = Vec::with_capacity(2);
        for ep in &cfg_link.endpoints {
            let type_name = types[&ep.component];
            let decl = registry.port(type_name, &ep.port).ok_or_else(|| {
                WireupError::UnknownPort {
                    type_name: type_name.to_string(),
                    port: ep.port.clone(),
                }
            })?;
            decls.push(decl.event_type.clone());
        }
        if decls[0] != decls[1] {
            return Err(WireupError::PortTypeMismatch {
                link: cfg_link.id,
                type_a: decls[0].clone(),
                type_b: decls[1].clone(),
            });
        }

        let name_a = format!("{}.{}", names[&cfg_link.endpoints[0].component], cfg_link.endpoints[0].port);
        let name_b = format!("{}.{}", names[&cfg_link.endpoints[1].component], cfg_link.endpoints[1].port);
        let tag = order_tag_for(&name_a, &name_b);

        for side in 0..2 {
            let ep = &cfg_link.endpoints[side];
            let other = &cfg_link.endpoints[1 - side];
            let p = assignment[&ep.component];
            let q = assignment[&other.component];
            let ep_id = cfg_link.endpoint_id(side);

            if p.rank != rank {
                continue;
            }
            link_thread.insert(ep_id, p.thread);
            port_bindings
                .entry(ep.component)
                .or_default()
                .insert(ep.port.clone(), ep_id);

            let target = if q == p {
                DeliveryTarget::Local
            } else if q.rank == p.rank {
                DeliveryTarget::CrossThread { thread: q.thread }
            } else {
                DeliveryTarget::CrossRank {
                    rank: q.rank,
                    thread: q.thread,
                }
            };
            link_maps[p.thread as usize].insert(Link {
                id: ep_id,
                owner: ep.component,
                owner_port: ep.port.clone(),
                latency: ep.latency,
                partner: cfg_link.endpoint_id(1 - side),
                order_tag: tag,
                target,
                event_type: decls[side].clone(),
            });
        }
    }

    let mut runners = Vec::with_capacity(topo.threads as usize);
    for thread in 0..topo.threads {
        let partition = PartitionId::new(rank, thread);
        let mut stats = StatEngine::new(
            config.stat_format,
            config.output_dir.clone(),
            config.stat_base_name.clone(),
            rank,
            topo.ranks,
        );

        let mut components = Vec::new();
        for cfg in &graph.components {
            if assignment[&cfg.id] != partition {
                continue;
            }
            if !registry.contains(&cfg.type_name) {
                return Err(WireupError::UnknownComponentType {
                    name: cfg.name.clone(),
                    type_name: cfg.type_name.clone(),
                });
            }
            for stat_cfg in &cfg.statistics {
                stats.register(cfg.id, &cfg.name, stat_cfg, lord)?;
            }
            let base = BaseComponentData {
                id: cfg.id,
                name: cfg.name.clone(),
                type_name: cfg.type_name.clone(),
                params: cfg.params.clone(),
                links: port_bindings.remove(&cfg.id).unwrap_or_default(),
            };
            // contains() was checked above; create cannot fail.
            let comp = registry
                .create(&cfg.type_name, base)
                .expect("registered type");
            components.push(comp);
        }

        let core = PartitionCore::new(
            partition,
            topo,
            std::mem::take(&mut link_maps[thread as usize]),
            stats,
            config.record_trace,
        );
        tracing::debug!(
            partition = %partition,
            components = components.len(),
            links = core.links.len(),
            "partition wired"
        );
        runners.push(PartitionRunner::new(core, components));
    }

    Ok(WiredRank {
        runners,
        link_thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentError, PortDecl};
    use crate::event::Event;
    use crate::sim::SimContext;

    struct Dummy {
        base: BaseComponentData,
    }

    impl Component for Dummy {
        fn base(&self) -> &BaseComponentData {
            &self.base
        }
        fn base_mut(&mut self) -> &mut BaseComponentData {
            &mut self.base
        }
        fn handle_event(
            &mut self,
            _port: &str,
            _event: Event,
            _ctx: &mut SimContext<'_>,
        ) -> Result<(), ComponentError> {
            Ok(())
        }
    }

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register(
            "Dummy",
            vec![PortDecl::new("left", "Packet"), PortDecl::new("right", "Packet")],
            |base| Box::new(Dummy { base }),
        );
        reg.register(
            "Odd",
            vec![PortDecl::new("left", "Token")],
            |base| Box::new(Dummy { base }),
        );
        reg
    }

    fn lord() -> TimeLord {
        TimeLord::new("1ps").unwrap()
    }

    fn assigned_graph(threads: u32) -> ConfigGraph {
        let mut g = ConfigGraph::new();
        let a = g.add_component("a", "Dummy");
        let b = g.add_component("b", "Dummy");
        g.add_link(a, "right", b, "left", 100);
        g.component_mut(a).unwrap().partition = Some(PartitionId::new(0, 0));
        g.component_mut(b).unwrap().partition = Some(PartitionId::new(0, threads - 1));
        g
    }

    #[test]
    fn test_local_wireup() {
        let g = assigned_graph(1);
        let wired = build_rank(
            &g,
            Topology::new(1, 1),
            0,
            &registry(),
            &lord(),
            &EngineConfig::default(),
        )
        .unwrap();
        assert_eq!(wired.runners.len(), 1);
        let core = &wired.runners[0].core;
        assert_eq!(core.links.len(), 2);
        let l0 = core.links.get(0).unwrap();
        assert_eq!(l0.target, DeliveryTarget::Local);
        assert_eq!(l0.partner, 1);
        assert_eq!(l0.owner, 0);
        // Both endpoints share the order tag.
        assert_eq!(l0.order_tag, core.links.get(1).unwrap().order_tag);
    }

    #[test]
    fn test_cross_thread_wireup() {
        let mut cfg = EngineConfig::default();
        cfg.threads = 2;
        let g = assigned_graph(2);
        let wired = build_rank(&g, Topology::new(1, 2), 0, &registry(), &lord(), &cfg).unwrap();
        assert_eq!(wired.runners.len(), 2);

        let t0 = &wired.runners[0].core;
        let l0 = t0.links.get(0).unwrap();
        assert_eq!(l0.target, DeliveryTarget::CrossThread { thread: 1 });
        assert_eq!(t0.links.min_cross_partition_latency(), Some(100));

        // Fan-out map covers both endpoints.
        assert_eq!(wired.link_thread[&0], 0);
        assert_eq!(wired.link_thread[&1], 1);
    }

    #[test]
    fn test_unknown_type_fatal() {
        let mut g = ConfigGraph::new();
        let a = g.add_component("ghost", "Phantom");
        g.component_mut(a).unwrap().partition = Some(PartitionId::new(0, 0));
        let err = build_rank(
            &g,
            Topology::new(1, 1),
            0,
            &registry(),
            &lord(),
            &EngineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WireupError::UnknownComponentType { .. }));
    }

    #[test]
    fn test_unknown_port_fatal() {
        let mut g = ConfigGraph::new();
        let a = g.add_component("a", "Dummy");
        let b = g.add_component("b", "Dummy");
        g.add_link(a, "sideband", b, "left", 1);
        g.component_mut(a).unwrap().partition = Some(PartitionId::new(0, 0));
        g.component_mut(b).unwrap().partition = Some(PartitionId::new(0, 0));
        let err = build_rank(
            &g,
            Topology::new(1, 1),
            0,
            &registry(),
            &lord(),
            &EngineConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, WireupError::UnknownPort { .. }));
    }

    #[test]
    fn test_port_type_mismatch_fatal() {
        let mut g = ConfigGraph::new();
        let a = g.add_component("a", "Dummy");
        let b = g.add_component("b", "Odd");
        g.add_link(a, "right", b, "left", 1);
        g.component_mut(a).unwrap().partition = Some(PartitionId::new(0, 0));
        g.component_mut(b).unwrap().partition = Some(PartitionId::new(0, 0));
        let err = build_rank(
            &g,
            Topology::new(1, 1),
            0,
            &registry(),
            &lord(),
            &EngineConfig::default(),
        )
        .unwrap_err();
        match err {
            WireupError::PortTypeMismatch { type_a, type_b, .. } => {
                assert_eq!(type_a, "Packet");
                assert_eq!(type_b, "Token");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn test_statistics_registered() {
        let mut g = assigned_graph(1);
        g.add_statistic(0, crate::graph::ConfigStatistic::periodic("hits", "10ps"));
        let wired = build_rank(
            &g,
            Topology::new(1, 1),
            0,
            &registry(),
            &lord(),
            &EngineConfig::default(),
        )
        .unwrap();
        let core = &wired.runners[0].core;
        assert_eq!(core.stats.num_stats(), 1);
        assert!(core.stats.lookup(0, "hits").is_some());
    }
}
