//! Partitioning strategies: assigning components to (rank, thread).
//!
//! A [`Partitioner`] fills in the `partition` field of every component in
//! a [`ConfigGraph`]. Strategies are selected by name so the launch
//! configuration can pick one without code changes. All shipped
//! strategies are deterministic for a given graph and topology, which is
//! what makes checkpoint/restart traces reproducible.

use thiserror::Error;

use crate::graph::ConfigGraph;
use crate::types::{PartitionId, Topology};

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("unknown partitioner \"{0}\"")]
    UnknownStrategy(String),

    #[error("graph has no components to partition")]
    EmptyGraph,

    #[error("topology has zero partitions")]
    EmptyTopology,
}

/// A strategy that assigns every component to a partition.
pub trait Partitioner: Send {
    fn name(&self) -> &'static str;

    /// Assigns `component.partition` for every component. Implementations
    /// must be deterministic in (graph, topology).
    fn assign(&self, graph: &mut ConfigGraph, topo: Topology) -> Result<(), PartitionError>;
}

/// Everything on partition (0, 0). The implicit choice for serial runs.
pub struct SinglePartitioner;

impl Partitioner for SinglePartitioner {
    fn name(&self) -> &'static str {
        "single"
    }

    fn assign(&self, graph: &mut ConfigGraph, _topo: Topology) -> Result<(), PartitionError> {
        if graph.components.is_empty() {
            return Err(PartitionError::EmptyGraph);
        }
        for c in &mut graph.components {
            c.partition = Some(PartitionId::new(0, 0));
        }
        Ok(())
    }
}

/// Contiguous blocks of component ids per partition. Keeps neighbors in a
/// linearly-built graph together, minimizing boundary crossings.
pub struct LinearPartitioner;

impl Partitioner for LinearPartitioner {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn assign(&self, graph: &mut ConfigGraph, topo: Topology) -> Result<(), PartitionError> {
        let parts = topo.num_partitions();
        if parts == 0 {
            return Err(PartitionError::EmptyTopology);
        }
        let n = graph.components.len();
        if n == 0 {
            return Err(PartitionError::EmptyGraph);
        }
        let partitions: Vec<PartitionId> = topo.partitions().collect();
        let per = n.div_ceil(parts);
        let mut sorted: Vec<usize> = (0..n).collect();
        sorted.sort_by_key(|&i| graph.components[i].id);
        for (pos, idx) in sorted.into_iter().enumerate() {
            graph.components[idx].partition = Some(partitions[(pos / per).min(parts - 1)]);
        }
        Ok(())
    }
}

/// Components dealt round-robin across partitions in id order. Spreads
/// load evenly regardless of graph construction order.
pub struct RoundRobinPartitioner;

impl Partitioner for RoundRobinPartitioner {
    fn name(&self) -> &'static str {
        "roundrobin"
    }

    fn assign(&self, graph: &mut ConfigGraph, topo: Topology) -> Result<(), PartitionError> {
        let parts = topo.num_partitions();
        if parts == 0 {
            return Err(PartitionError::EmptyTopology);
        }
        if graph.components.is_empty() {
            return Err(PartitionError::EmptyGraph);
        }
        let partitions: Vec<PartitionId> = topo.partitions().collect();
        let mut sorted: Vec<usize> = (0..graph.components.len()).collect();
        sorted.sort_by_key(|&i| graph.components[i].id);
        for (pos, idx) in sorted.into_iter().enumerate() {
            graph.components[idx].partition = Some(partitions[pos % parts]);
        }
        Ok(())
    }
}

/// Looks up a partitioner by its configured name.
pub fn create(name: &str) -> Result<Box<dyn Partitioner>, PartitionError> {
    match name {
        "single" => Ok(Box::new(SinglePartitioner)),
        "linear" => Ok(Box::new(LinearPartitioner)),
        "roundrobin" => Ok(Box::new(RoundRobinPartitioner)),
        other => Err(PartitionError::UnknownStrategy(other.to_string())),
    }
}

/// Names of all built-in partitioners.
pub fn strategy_names() -> &'static [&'static str] {
    &["single", "linear", "roundrobin"]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(n: usize) -> ConfigGraph {
        let mut g = ConfigGraph::new();
        for i in 0..n {
            g.add_component(format!("c{i}"), "T");
        }
        g
    }

    #[test]
    fn test_single_assigns_everything_to_zero() {
        let mut g = graph(5);
        SinglePartitioner.assign(&mut g, Topology::new(2, 2)).unwrap();
        assert!(g
            .components
            .iter()
            .all(|c| c.partition == Some(PartitionId::new(0, 0))));
    }

    #[test]
    fn test_linear_blocks() {
        let mut g = graph(8);
        LinearPartitioner.assign(&mut g, Topology::new(2, 2)).unwrap();
        // 8 components over 4 partitions: blocks of 2.
        assert_eq!(g.components[0].partition, Some(PartitionId::new(0, 0)));
        assert_eq!(g.components[1].partition, Some(PartitionId::new(0, 0)));
        assert_eq!(g.components[2].partition, Some(PartitionId::new(0, 1)));
        assert_eq!(g.components[7].partition, Some(PartitionId::new(1, 1)));
    }

    #[test]
    fn test_linear_uneven() {
        let mut g = graph(5);
        LinearPartitioner.assign(&mut g, Topology::new(1, 2)).unwrap();
        // ceil(5/2) = 3 in the first partition, 2 in the second.
        let first = g
            .components
            .iter()
            .filter(|c| c.partition == Some(PartitionId::new(0, 0)))
            .count();
        assert_eq!(first, 3);
    }

    #[test]
    fn test_round_robin_spreads() {
        let mut g = graph(6);
        RoundRobinPartitioner
            .assign(&mut g, Topology::new(1, 3))
            .unwrap();
        for (i, c) in g.components.iter().enumerate() {
            assert_eq!(c.partition, Some(PartitionId::new(0, (i % 3) as u32)));
        }
    }

    #[test]
    fn test_deterministic_assignment() {
        let mut a = graph(7);
        let mut b = graph(7);
        RoundRobinPartitioner
            .assign(&mut a, Topology::new(2, 2))
            .unwrap();
        RoundRobinPartitioner
            .assign(&mut b, Topology::new(2, 2))
            .unwrap();
        for (x, y) in a.components.iter().zip(&b.components) {
            assert_eq!(x.partition, y.partition);
        }
    }

    #[test]
    fn test_create_by_name() {
        assert_eq!(create("linear").unwrap().name(), "linear");
        assert_eq!(create("roundrobin").unwrap().name(), "roundrobin");
        assert!(matches!(
            create("metis"),
            Err(PartitionError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn test_empty_graph_rejected() {
        let mut g = ConfigGraph::new();
        assert!(matches!(
            LinearPartitioner.assign(&mut g, Topology::new(1, 1)),
            Err(PartitionError::EmptyGraph)
        ));
    }
}
