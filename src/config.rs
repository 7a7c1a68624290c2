//! Launch configuration and declarative graph files.
//!
//! [`EngineConfig`] carries the knobs that alter core behavior (topology,
//! stop time, checkpointing, partitioner choice, output paths). The CLI
//! that fills it in is outside the core; tests and embedders construct it
//! directly or through the builder.
//!
//! [`GraphSpec`] is the declarative YAML/JSON description of a simulation
//! graph:
//!
//! ```yaml
//! simulation:
//!   timebase: 1ps
//!   stop_at: 100ns
//!
//! components:
//!   - name: ping
//!     type: PingPong
//!     params:
//!       start: "true"
//!
//! links:
//!   - a: ping.port
//!     b: pong.port
//!     latency: 10ns
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{ConfigGraph, ConfigStatistic};
use crate::stats::StatOutputFormat;
use crate::time::TimeLord;
use crate::types::Topology;

/// Errors from configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown file format: {0}")]
    UnknownFormat(String),

    #[error("time parse error: {0}")]
    Time(#[from] crate::time::TimeError),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Engine launch configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of ranks in the launch; must match a loaded checkpoint.
    #[serde(default = "default_one")]
    pub ranks: u32,

    /// Threads per rank; must match a loaded checkpoint.
    #[serde(default = "default_one")]
    pub threads: u32,

    /// Base tick period, e.g. "1ps".
    #[serde(default = "default_timebase")]
    pub timebase: String,

    /// Maximum simulated time, e.g. "100ns". `None` runs until the exit
    /// detector fires or all queues drain.
    #[serde(default)]
    pub stop_at: Option<String>,

    /// Partitioning strategy name.
    #[serde(default = "default_partitioner")]
    pub partitioner: String,

    /// Simulated-time checkpoint interval.
    #[serde(default)]
    pub checkpoint_period: Option<String>,

    /// Wall-clock checkpoint interval in seconds.
    #[serde(default)]
    pub checkpoint_wall_period: Option<u64>,

    #[serde(default = "default_dot_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default = "default_checkpoint_prefix")]
    pub checkpoint_prefix: String,

    /// Registry file to restore from; enters the restart path.
    #[serde(default)]
    pub load_checkpoint: Option<PathBuf>,

    #[serde(default = "default_dot_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub stat_format: StatOutputFormat,

    #[serde(default = "default_stat_name")]
    pub stat_base_name: String,

    /// Graph dump destinations, written after wire-up.
    #[serde(default)]
    pub output_dot: Option<PathBuf>,

    #[serde(default)]
    pub output_json: Option<PathBuf>,

    /// Per-rank graph dump files instead of one serial file.
    #[serde(default)]
    pub parallel_output: bool,

    #[serde(default)]
    pub verbose: u32,

    #[serde(default)]
    pub print_timing: bool,

    #[serde(default)]
    pub timing_json: Option<PathBuf>,

    /// Record the delivered-event trace. Used by the checkpoint
    /// equivalence tests; costs memory proportional to event count.
    #[serde(default)]
    pub record_trace: bool,
}

fn default_one() -> u32 {
    1
}

fn default_timebase() -> String {
    "1ps".to_string()
}

fn default_partitioner() -> String {
    "linear".to_string()
}

fn default_dot_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_checkpoint_prefix() -> String {
    "checkpoint".to_string()
}

fn default_stat_name() -> String {
    "stats".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ranks: 1,
            threads: 1,
            timebase: default_timebase(),
            stop_at: None,
            partitioner: default_partitioner(),
            checkpoint_period: None,
            checkpoint_wall_period: None,
            checkpoint_dir: default_dot_dir(),
            checkpoint_prefix: default_checkpoint_prefix(),
            load_checkpoint: None,
            output_dir: default_dot_dir(),
            stat_format: StatOutputFormat::default(),
            stat_base_name: default_stat_name(),
            output_dot: None,
            output_json: None,
            parallel_output: false,
            verbose: 0,
            print_timing: false,
            timing_json: None,
            record_trace: false,
        }
    }
}

impl EngineConfig {
    pub fn topology(&self) -> Topology {
        Topology::new(self.ranks, self.threads)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.ranks == 0 || self.threads == 0 {
            return Err(ConfigError::Validation(
                "ranks and threads must both be at least 1".to_string(),
            ));
        }
        crate::partition::create(&self.partitioner)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        TimeLord::new(&self.timebase)?;
        Ok(())
    }
}

/// Builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topology(mut self, ranks: u32, threads: u32) -> Self {
        self.config.ranks = ranks;
        self.config.threads = threads;
        self
    }

    pub fn timebase(mut self, base: impl Into<String>) -> Self {
        self.config.timebase = base.into();
        self
    }

    pub fn stop_at(mut self, spec: impl Into<String>) -> Self {
        self.config.stop_at = Some(spec.into());
        self
    }

    pub fn partitioner(mut self, name: impl Into<String>) -> Self {
        self.config.partitioner = name.into();
        self
    }

    pub fn checkpoint_period(mut self, spec: impl Into<String>) -> Self {
        self.config.checkpoint_period = Some(spec.into());
        self
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.checkpoint_dir = dir.into();
        self
    }

    pub fn load_checkpoint(mut self, registry: impl Into<PathBuf>) -> Self {
        self.config.load_checkpoint = Some(registry.into());
        self
    }

    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn record_trace(mut self, enable: bool) -> Self {
        self.config.record_trace = enable;
        self
    }

    pub fn verbose(mut self, level: u32) -> Self {
        self.config.verbose = level;
        self
    }

    pub fn build(self) -> ConfigResult<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Declarative component entry in a graph file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default)]
    pub shared_param_sets: Vec<String>,
    #[serde(default)]
    pub statistics: Vec<ConfigStatistic>,
}

/// Declarative link entry: endpoints as "component.port".
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    /// Latency spec applied to both endpoints, e.g. "10ns".
    pub latency: String,
    /// Optional override for endpoint `b`'s send latency.
    #[serde(default)]
    pub latency_b: Option<String>,
}

/// A complete declarative simulation description.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub simulation: Option<EngineConfig>,
    #[serde(default)]
    pub components: Vec<ComponentSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl GraphSpec {
    pub fn from_yaml(yaml: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a spec file, auto-detecting YAML or JSON by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext.to_lowercase().as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "json" => Self::from_json(&content),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }

    /// Builds the engine-facing graph, parsing latency specs with the
    /// given time lord.
    pub fn build_graph(&self, lord: &TimeLord) -> ConfigResult<ConfigGraph> {
        let mut graph = ConfigGraph::new();
        let mut by_name = HashMap::new();

        for spec in &self.components {
            let id = graph.add_component(&spec.name, &spec.type_name);
            by_name.insert(spec.name.clone(), id);
            if let Some(c) = graph.component_mut(id) {
                for (k, v) in &spec.params {
                    c.params.insert(k, v.clone(), true);
                }
                for set in &spec.shared_param_sets {
                    c.params.attach_shared_set(set);
                }
                c.statistics = spec.statistics.clone();
            }
        }

        for link in &self.links {
            let (comp_a, port_a) = split_endpoint(&link.a)?;
            let (comp_b, port_b) = split_endpoint(&link.b)?;
            let a = *by_name.get(comp_a).ok_or_else(|| {
                ConfigError::Validation(format!("link references unknown component \"{comp_a}\""))
            })?;
            let b = *by_name.get(comp_b).ok_or_else(|| {
                ConfigError::Validation(format!("link references unknown component \"{comp_b}\""))
            })?;
            let lat_a = lord.to_ticks(&link.latency)?;
            let lat_b = match &link.latency_b {
                Some(spec) => lord.to_ticks(spec)?,
                None => lat_a,
            };
            graph.add_link_asym(a, port_a, lat_a, b, port_b, lat_b);
        }

        graph
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        Ok(graph)
    }
}

fn split_endpoint(spec: &str) -> ConfigResult<(&str, &str)> {
    spec.split_once('.').ok_or_else(|| {
        ConfigError::Validation(format!(
            "endpoint \"{spec}\" is not of the form component.port"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_serial() {
        let cfg = EngineConfig::default();
        assert!(cfg.topology().is_serial());
        cfg.validate().unwrap();
    }

    #[test]
    fn test_builder() {
        let cfg = EngineConfigBuilder::new()
            .topology(2, 4)
            .timebase("1ns")
            .stop_at("1us")
            .partitioner("roundrobin")
            .verbose(2)
            .build()
            .unwrap();
        assert_eq!(cfg.ranks, 2);
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.stop_at.as_deref(), Some("1us"));
        assert_eq!(cfg.partitioner, "roundrobin");
    }

    #[test]
    fn test_invalid_topology_rejected() {
        let result = EngineConfigBuilder::new().topology(0, 1).build();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_unknown_partitioner_rejected() {
        let result = EngineConfigBuilder::new().partitioner("metis").build();
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_yaml_graph_spec() {
        let yaml = r#"
simulation:
  timebase: 1ps
  stop_at: 100ns

components:
  - name: ping
    type: PingPong
    params:
      start: "true"
  - name: pong
    type: PingPong

links:
  - a: ping.port
    b: pong.port
    latency: 10ns
"#;
        let spec = GraphSpec::from_yaml(yaml).unwrap();
        assert_eq!(spec.components.len(), 2);
        assert_eq!(spec.links.len(), 1);
        let sim = spec.simulation.as_ref().unwrap();
        assert_eq!(sim.stop_at.as_deref(), Some("100ns"));

        let lord = TimeLord::new("1ps").unwrap();
        let graph = spec.build_graph(&lord).unwrap();
        assert_eq!(graph.num_components(), 2);
        assert_eq!(graph.links[0].endpoints[0].latency, 10_000);
        assert_eq!(
            graph.component(0).unwrap().params.get("start"),
            Some("true".to_string())
        );
    }

    #[test]
    fn test_asymmetric_latency() {
        let yaml = r#"
components:
  - name: a
    type: T
  - name: b
    type: T
links:
  - a: a.out
    b: b.out
    latency: 5ns
    latency_b: 7ns
"#;
        let spec = GraphSpec::from_yaml(yaml).unwrap();
        let lord = TimeLord::new("1ns").unwrap();
        let graph = spec.build_graph(&lord).unwrap();
        assert_eq!(graph.links[0].endpoints[0].latency, 5);
        assert_eq!(graph.links[0].endpoints[1].latency, 7);
    }

    #[test]
    fn test_unknown_component_in_link_spec() {
        let yaml = r#"
components:
  - name: a
    type: T
links:
  - a: a.out
    b: ghost.in
    latency: 1ns
"#;
        let spec = GraphSpec::from_yaml(yaml).unwrap();
        let lord = TimeLord::new("1ns").unwrap();
        assert!(matches!(
            spec.build_graph(&lord),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_bad_endpoint_form() {
        let yaml = r#"
components:
  - name: a
    type: T
links:
  - a: a
    b: a.in
    latency: 1ns
"#;
        let spec = GraphSpec::from_yaml(yaml).unwrap();
        let lord = TimeLord::new("1ns").unwrap();
        assert!(spec.build_graph(&lord).is_err());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let cfg = EngineConfigBuilder::new()
            .topology(2, 2)
            .stop_at("50ns")
            .build()
            .unwrap();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.ranks, 2);
        assert_eq!(back.stop_at.as_deref(), Some("50ns"));
    }
}
