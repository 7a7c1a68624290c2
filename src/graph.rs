//! The component graph consumed by partitioning and wire-up.
//!
//! A [`ConfigGraph`] is the engine-facing description of a simulation:
//! components with type names and parameters, links with exactly two
//! endpoints, and per-component statistic configurations. The front end
//! that produces it (script, file loader, or test code building it
//! directly) is outside the core; the core validates it, partitions it,
//! and wires it up.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::Params;
use crate::stats::StatMode;
use crate::types::{ComponentId, LinkId, PartitionId, SimTime, Topology};

/// Errors detected while building or validating a graph. All of these are
/// fatal before the simulation starts.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("duplicate component id {0}")]
    DuplicateComponent(ComponentId),

    #[error("duplicate component name \"{0}\"")]
    DuplicateName(String),

    #[error("link {link} references unknown component {component}")]
    UnknownComponent { link: LinkId, component: ComponentId },

    #[error("link {link} connects component {component} to itself on port \"{port}\"")]
    SelfLoopPort {
        link: LinkId,
        component: ComponentId,
        port: String,
    },

    #[error("component {0} has no partition assignment")]
    Unassigned(ComponentId),

    #[error("cross-partition link {0} has zero latency; minimum is one tick")]
    ZeroLatencyCrossing(LinkId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One endpoint of a configured link.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkEndpoint {
    pub component: ComponentId,
    pub port: String,
    /// Latency applied to events *sent from* this endpoint, in ticks.
    pub latency: SimTime,
}

/// A logical link: exactly two endpoints.
///
/// Endpoint `i` of link `id` materializes as live link endpoint id
/// `2 * id + i`; the partner of one endpoint is the other.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigLink {
    pub id: LinkId,
    pub endpoints: [LinkEndpoint; 2],
}

impl ConfigLink {
    /// Live endpoint id for side `side` (0 or 1).
    pub fn endpoint_id(&self, side: usize) -> LinkId {
        self.id * 2 + side as LinkId
    }

    /// Minimum of the two endpoint latencies.
    pub fn min_latency(&self) -> SimTime {
        self.endpoints[0].latency.min(self.endpoints[1].latency)
    }
}

/// Statistic enablement attached to a component in the graph.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigStatistic {
    pub name: String,
    pub mode: StatMode,
    /// Collection rate: a time spec for periodic mode ("10ns"), an event
    /// count for count mode, ignored for dump-at-end.
    #[serde(default)]
    pub rate: Option<String>,
    /// Absolute enable time spec; the statistic starts disabled until it.
    #[serde(default)]
    pub start_at: Option<String>,
    /// Absolute disable time spec.
    #[serde(default)]
    pub stop_at: Option<String>,
    /// Output group; grouped statistics share a sink and a clock.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default = "default_true")]
    pub reset_on_output: bool,
    #[serde(default = "default_true")]
    pub output_at_end: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ConfigStatistic {
    pub fn periodic(name: impl Into<String>, rate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: StatMode::Periodic,
            rate: Some(rate.into()),
            start_at: None,
            stop_at: None,
            group: None,
            reset_on_output: true,
            output_at_end: true,
            enabled: true,
        }
    }

    pub fn by_count(name: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            mode: StatMode::Count,
            rate: Some(count.to_string()),
            start_at: None,
            stop_at: None,
            group: None,
            reset_on_output: true,
            output_at_end: true,
            enabled: true,
        }
    }

    pub fn at_end(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: StatMode::DumpAtEnd,
            rate: None,
            start_at: None,
            stop_at: None,
            group: None,
            reset_on_output: false,
            output_at_end: true,
            enabled: true,
        }
    }

    pub fn with_window(mut self, start_at: impl Into<String>, stop_at: impl Into<String>) -> Self {
        self.start_at = Some(start_at.into());
        self.stop_at = Some(stop_at.into());
        self
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// A component as described to the engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigComponent {
    pub id: ComponentId,
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    /// Filled by the partitioner before wire-up.
    #[serde(default)]
    pub partition: Option<PartitionId>,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub statistics: Vec<ConfigStatistic>,
}

/// The whole partitioned component graph.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigGraph {
    pub components: Vec<ConfigComponent>,
    pub links: Vec<ConfigLink>,
    #[serde(skip)]
    next_component: ComponentId,
    #[serde(skip)]
    next_link: LinkId,
}

impl ConfigGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a component; returns its id.
    pub fn add_component(
        &mut self,
        name: impl Into<String>,
        type_name: impl Into<String>,
    ) -> ComponentId {
        let id = self.next_component;
        self.next_component += 1;
        self.components.push(ConfigComponent {
            id,
            name: name.into(),
            type_name: type_name.into(),
            partition: None,
            params: Params::new(),
            statistics: Vec::new(),
        });
        id
    }

    /// Connects two component ports with the same latency on both sides.
    pub fn add_link(
        &mut self,
        a: ComponentId,
        port_a: impl Into<String>,
        b: ComponentId,
        port_b: impl Into<String>,
        latency: SimTime,
    ) -> LinkId {
        self.add_link_asym(a, port_a, latency, b, port_b, latency)
    }

    /// Connects two component ports with per-endpoint send latencies.
    pub fn add_link_asym(
        &mut self,
        a: ComponentId,
        port_a: impl Into<String>,
        latency_a: SimTime,
        b: ComponentId,
        port_b: impl Into<String>,
        latency_b: SimTime,
    ) -> LinkId {
        let id = self.next_link;
        self.next_link += 1;
        self.links.push(ConfigLink {
            id,
            endpoints: [
                LinkEndpoint {
                    component: a,
                    port: port_a.into(),
                    latency: latency_a,
                },
                LinkEndpoint {
                    component: b,
                    port: port_b.into(),
                    latency: latency_b,
                },
            ],
        });
        id
    }

    pub fn component(&self, id: ComponentId) -> Option<&ConfigComponent> {
        self.components.iter().find(|c| c.id == id)
    }

    pub fn component_mut(&mut self, id: ComponentId) -> Option<&mut ConfigComponent> {
        self.components.iter_mut().find(|c| c.id == id)
    }

    /// Sets a parameter on a component. No-op for an unknown id.
    pub fn set_param(&mut self, id: ComponentId, key: &str, value: impl Into<String>) {
        if let Some(c) = self.component_mut(id) {
            c.params.insert(key, value, true);
        }
    }

    /// Attaches a statistic configuration to a component.
    pub fn add_statistic(&mut self, id: ComponentId, stat: ConfigStatistic) {
        if let Some(c) = self.component_mut(id) {
            c.statistics.push(stat);
        }
    }

    /// Structural validation, run before partitioning.
    pub fn validate(&self) -> Result<(), GraphError> {
        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for c in &self.components {
            if !ids.insert(c.id) {
                return Err(GraphError::DuplicateComponent(c.id));
            }
            if !names.insert(c.name.clone()) {
                return Err(GraphError::DuplicateName(c.name.clone()));
            }
        }
        for l in &self.links {
            for ep in &l.endpoints {
                if !ids.contains(&ep.component) {
                    return Err(GraphError::UnknownComponent {
                        link: l.id,
                        component: ep.component,
                    });
                }
            }
            let [a, b] = &l.endpoints;
            if a.component == b.component && a.port == b.port {
                return Err(GraphError::SelfLoopPort {
                    link: l.id,
                    component: a.component,
                    port: a.port.clone(),
                });
            }
        }
        Ok(())
    }

    /// Post-partitioning validation: every component assigned, and every
    /// link that crosses a partition boundary has latency >= 1 on both
    /// sending sides.
    pub fn validate_partitioned(&self) -> Result<(), GraphError> {
        let mut assignment: HashMap<ComponentId, PartitionId> = HashMap::new();
        for c in &self.components {
            let part = c.partition.ok_or(GraphError::Unassigned(c.id))?;
            assignment.insert(c.id, part);
        }
        for l in &self.links {
            let pa = assignment[&l.endpoints[0].component];
            let pb = assignment[&l.endpoints[1].component];
            if pa != pb && l.min_latency() == 0 {
                return Err(GraphError::ZeroLatencyCrossing(l.id));
            }
        }
        Ok(())
    }

    /// Partition of a component; only valid after assignment.
    pub fn partition_of(&self, id: ComponentId) -> Option<PartitionId> {
        self.component(id).and_then(|c| c.partition)
    }

    pub fn num_components(&self) -> usize {
        self.components.len()
    }

    pub fn num_links(&self) -> usize {
        self.links.len()
    }

    /// Renders the graph in DOT format, clustered by rank.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph simulation {\n");
        let mut by_rank: HashMap<u32, Vec<&ConfigComponent>> = HashMap::new();
        for c in &self.components {
            by_rank
                .entry(c.partition.map(|p| p.rank).unwrap_or(0))
                .or_default()
                .push(c);
        }
        let mut ranks: Vec<_> = by_rank.keys().copied().collect();
        ranks.sort_unstable();
        for rank in ranks {
            out.push_str(&format!("  subgraph cluster_rank{rank} {{\n"));
            out.push_str(&format!("    label = \"rank {rank}\";\n"));
            for c in &by_rank[&rank] {
                out.push_str(&format!(
                    "    c{} [label=\"{}\\n({})\"];\n",
                    c.id, c.name, c.type_name
                ));
            }
            out.push_str("  }\n");
        }
        for l in &self.links {
            out.push_str(&format!(
                "  c{} -> c{} [dir=both, label=\"{}\"];\n",
                l.endpoints[0].component,
                l.endpoints[1].component,
                l.min_latency()
            ));
        }
        out.push_str("}\n");
        out
    }

    /// Writes the DOT rendering to a file.
    pub fn write_dot<P: AsRef<Path>>(&self, path: P) -> Result<(), GraphError> {
        let mut f = std::fs::File::create(path)?;
        f.write_all(self.to_dot().as_bytes())?;
        Ok(())
    }

    /// Writes the graph as JSON. With `parallel` set, writes one file per
    /// rank (suffix `_<rank>` before the extension) containing only that
    /// rank's components and the links touching them.
    pub fn write_json<P: AsRef<Path>>(
        &self,
        path: P,
        topo: Topology,
        parallel: bool,
    ) -> Result<(), GraphError> {
        let path = path.as_ref();
        if !parallel || topo.ranks == 1 {
            let f = std::fs::File::create(path)?;
            serde_json::to_writer_pretty(f, self)?;
            return Ok(());
        }
        for rank in 0..topo.ranks {
            let members: HashSet<ComponentId> = self
                .components
                .iter()
                .filter(|c| c.partition.map(|p| p.rank) == Some(rank))
                .map(|c| c.id)
                .collect();
            let slice = ConfigGraph {
                components: self
                    .components
                    .iter()
                    .filter(|c| members.contains(&c.id))
                    .cloned()
                    .collect(),
                links: self
                    .links
                    .iter()
                    .filter(|l| l.endpoints.iter().any(|e| members.contains(&e.component)))
                    .cloned()
                    .collect(),
                next_component: 0,
                next_link: 0,
            };
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("graph");
            let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("json");
            let per_rank = path.with_file_name(format!("{stem}_{rank}.{ext}"));
            let f = std::fs::File::create(per_rank)?;
            serde_json::to_writer_pretty(f, &slice)?;
        }
        Ok(())
    }
}
