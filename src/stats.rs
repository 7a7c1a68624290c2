//! The statistics engine.
//!
//! Each partition owns one [`StatEngine`]. Components declare statistics
//! in the graph; wire-up registers them here and hands the component a
//! [`StatId`] it feeds through `SimContext::stat_add`. Three scheduling
//! regimes exist:
//!
//! - **Periodic**: the engine schedules a stat-output action per distinct
//!   period factor; firing flushes every statistic on that period.
//! - **Count**: the statistic counts `add_data` calls and flushes itself
//!   when the configured count is reached.
//! - **Dump-at-end**: flushed once at end of simulation.
//!
//! Start/stop times become one-shot actions that enable or disable the
//! statistic. Groups share one sink row batch and one clock. Output lands
//! in one CSV or JSON file per rank, suffixed `_<rank>` when the run has
//! more than one rank.
//!
//! Sampling runs on the scheduler thread; nothing here blocks.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::ConfigStatistic;
use crate::time::TimeLord;
use crate::types::{ComponentId, RankId, SimTime};

/// Index of a registered statistic within its partition's engine.
pub type StatId = usize;

#[derive(Debug, Error)]
pub enum StatError {
    #[error("statistic \"{0}\" has no collection rate")]
    MissingRate(String),

    #[error("statistic \"{name}\" has a bad rate \"{rate}\"")]
    BadRate { name: String, rate: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// When a statistic is collected and flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatMode {
    Periodic,
    Count,
    DumpAtEnd,
    Undefined,
}

/// Running accumulator over sampled values.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct Accumulator {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl Accumulator {
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// One registered statistic.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatSlot {
    pub name: String,
    pub component: ComponentId,
    pub component_name: String,
    pub mode: StatMode,
    pub enabled: bool,
    pub data: Accumulator,
    /// Count mode: flush when `data.count` reaches this.
    pub count_limit: u64,
    pub reset_on_output: bool,
    pub output_at_end: bool,
    pub group: Option<String>,
}

/// One emitted output record.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatRow {
    pub time: SimTime,
    pub component: String,
    pub statistic: String,
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub end_of_sim: bool,
}

/// Output file format for statistic rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StatOutputFormat {
    #[default]
    Csv,
    Json,
}

/// A group of statistics sharing one clock and one row batch.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StatGroup {
    period: Option<SimTime>,
    members: Vec<StatId>,
}

/// Checkpointable engine state: slot data only; the configuration is
/// rebuilt from the graph on restore.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatEngineState {
    pub slots: Vec<StatSlot>,
    pub rows: Vec<StatRow>,
}

/// Per-partition statistics engine.
#[derive(Debug)]
pub struct StatEngine {
    slots: Vec<StatSlot>,
    by_component: HashMap<ComponentId, Vec<StatId>>,
    by_name: HashMap<(ComponentId, String), StatId>,
    /// Periodic stats grouped by period factor.
    by_period: BTreeMap<SimTime, Vec<StatId>>,
    /// Count-mode stats, for introspection.
    event_stats: Vec<StatId>,
    groups: HashMap<String, StatGroup>,
    /// Start/stop edges to install as one-shot actions.
    edges: Vec<(SimTime, StatEdge, StatId)>,
    rows: Vec<StatRow>,
    format: StatOutputFormat,
    output_dir: PathBuf,
    base_name: String,
    rank: RankId,
    ranks: u32,
}

/// The kind of a start/stop edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatEdge {
    Start,
    Stop,
}

impl StatEngine {
    pub fn new(
        format: StatOutputFormat,
        output_dir: impl Into<PathBuf>,
        base_name: impl Into<String>,
        rank: RankId,
        ranks: u32,
    ) -> Self {
        Self {
            slots: Vec::new(),
            by_component: HashMap::new(),
            by_name: HashMap::new(),
            by_period: BTreeMap::new(),
            event_stats: Vec::new(),
            groups: HashMap::new(),
            edges: Vec::new(),
            rows: Vec::new(),
            format,
            output_dir: output_dir.into(),
            base_name: base_name.into(),
            rank,
            ranks,
        }
    }

    /// Registers a statistic from its graph configuration. Returns the id
    /// the owning component uses to feed it.
    pub fn register(
        &mut self,
        component: ComponentId,
        component_name: &str,
        cfg: &ConfigStatistic,
        lord: &TimeLord,
    ) -> Result<StatId, StatError> {
        let id = self.slots.len();
        let mut count_limit = 0;
        match cfg.mode {
            StatMode::Periodic => {
                let rate = cfg
                    .rate
                    .as_deref()
                    .ok_or_else(|| StatError::MissingRate(cfg.name.clone()))?;
                let period = lord.to_ticks(rate).map_err(|_| StatError::BadRate {
                    name: cfg.name.clone(),
                    rate: rate.to_string(),
                })?;
                match &cfg.group {
                    Some(g) => {
                        let group = self.groups.entry(g.clone()).or_default();
                        group.members.push(id);
                        let p = group.period.map_or(period, |p| p.min(period));
                        group.period = Some(p);
                    }
                    None => self.by_period.entry(period).or_default().push(id),
                }
            }
            StatMode::Count => {
                let rate = cfg
                    .rate
                    .as_deref()
                    .ok_or_else(|| StatError::MissingRate(cfg.name.clone()))?;
                count_limit = rate.parse().map_err(|_| StatError::BadRate {
                    name: cfg.name.clone(),
                    rate: rate.to_string(),
                })?;
                self.event_stats.push(id);
            }
            StatMode::DumpAtEnd | StatMode::Undefined => {}
        }

        // Start/stop edges; a start time means the stat begins disabled.
        let mut enabled = cfg.enabled;
        if let Some(start) = &cfg.start_at {
            let t = lord.to_ticks(start).map_err(|_| StatError::BadRate {
                name: cfg.name.clone(),
                rate: start.clone(),
            })?;
            self.edges.push((t, StatEdge::Start, id));
            enabled = false;
        }
        if let Some(stop) = &cfg.stop_at {
            let t = lord.to_ticks(stop).map_err(|_| StatError::BadRate {
                name: cfg.name.clone(),
                rate: stop.clone(),
            })?;
            self.edges.push((t, StatEdge::Stop, id));
        }

        self.slots.push(StatSlot {
            name: cfg.name.clone(),
            component,
            component_name: component_name.to_string(),
            mode: cfg.mode,
            enabled,
            data: Accumulator::default(),
            count_limit,
            reset_on_output: cfg.reset_on_output,
            output_at_end: cfg.output_at_end,
            group: cfg.group.clone(),
        });
        self.by_component.entry(component).or_default().push(id);
        self.by_name
            .insert((component, cfg.name.clone()), id);
        Ok(id)
    }

    /// Id of a statistic by owning component and name.
    pub fn lookup(&self, component: ComponentId, name: &str) -> Option<StatId> {
        self.by_name.get(&(component, name.to_string())).copied()
    }

    /// Statistic ids registered by a component.
    pub fn for_component(&self, component: ComponentId) -> &[StatId] {
        self.by_component
            .get(&component)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct period factors the scheduler must drive, including group
    /// clocks.
    pub fn periods(&self) -> Vec<SimTime> {
        let mut out: Vec<SimTime> = self.by_period.keys().copied().collect();
        for g in self.groups.values() {
            if let Some(p) = g.period {
                out.push(p);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Start/stop edges to install as one-shot actions.
    pub fn edges(&self) -> Vec<(SimTime, StatEdge, StatId)> {
        self.edges.clone()
    }

    /// Count-mode statistic ids.
    pub fn event_stat_ids(&self) -> &[StatId] {
        &self.event_stats
    }

    /// Feeds a sample. Count-mode statistics flush themselves when their
    /// limit is reached.
    pub fn add_data(&mut self, id: StatId, time: SimTime, value: f64) {
        let slot = &mut self.slots[id];
        if !slot.enabled {
            return;
        }
        slot.data.add(value);
        if slot.mode == StatMode::Count && slot.data.count >= slot.count_limit {
            self.output_one(id, time, false);
        }
    }

    /// Fires the periodic output for every statistic (and group) on the
    /// given period.
    pub fn output_period(&mut self, period: SimTime, time: SimTime) {
        if let Some(ids) = self.by_period.get(&period) {
            for id in ids.clone() {
                self.output_one(id, time, false);
            }
        }
        let group_members: Vec<StatId> = self
            .groups
            .values()
            .filter(|g| g.period == Some(period))
            .flat_map(|g| g.members.iter().copied())
            .collect();
        for id in group_members {
            self.output_one(id, time, false);
        }
    }

    /// One-shot start edge.
    pub fn start_event(&mut self, id: StatId) {
        self.slots[id].enabled = true;
    }

    /// One-shot stop edge.
    pub fn stop_event(&mut self, id: StatId) {
        self.slots[id].enabled = false;
    }

    /// End-of-simulation flush: dump-at-end statistics plus everything
    /// flagged `output_at_end`.
    pub fn end_of_sim(&mut self, time: SimTime) {
        for id in 0..self.slots.len() {
            let slot = &self.slots[id];
            if slot.mode == StatMode::DumpAtEnd || slot.output_at_end {
                self.output_one(id, time, true);
            }
        }
    }

    fn output_one(&mut self, id: StatId, time: SimTime, end_of_sim: bool) {
        let slot = &mut self.slots[id];
        self.rows.push(StatRow {
            time,
            component: slot.component_name.clone(),
            statistic: slot.name.clone(),
            count: slot.data.count,
            sum: slot.data.sum,
            min: slot.data.min,
            max: slot.data.max,
            end_of_sim,
        });
        if slot.reset_on_output && !end_of_sim {
            slot.data.reset();
        }
    }

    /// Rows emitted so far (mainly for tests and status dumps).
    pub fn rows(&self) -> &[StatRow] {
        &self.rows
    }

    /// Takes the emitted rows, leaving the engine empty. Multi-threaded
    /// ranks funnel rows to thread 0, which owns the sink file.
    pub fn take_rows(&mut self) -> Vec<StatRow> {
        std::mem::take(&mut self.rows)
    }

    pub fn num_stats(&self) -> usize {
        self.slots.len()
    }

    /// The output file for this rank.
    pub fn output_path(&self) -> PathBuf {
        let ext = match self.format {
            StatOutputFormat::Csv => "csv",
            StatOutputFormat::Json => "json",
        };
        let name = if self.ranks > 1 {
            format!("{}_{}.{ext}", self.base_name, self.rank)
        } else {
            format!("{}.{ext}", self.base_name)
        };
        self.output_dir.join(name)
    }

    /// Writes accumulated rows to the per-rank output file. An I/O
    /// failure here is logged and swallowed: statistics output must never
    /// take the simulation down.
    pub fn flush_to_disk(&self) {
        self.flush_collected(&self.rows);
    }

    /// Writes an explicit row collection (this thread's plus rows
    /// funneled from the rank's other threads) to the per-rank file.
    pub fn flush_collected(&self, rows: &[StatRow]) {
        if rows.is_empty() {
            return;
        }
        let path = self.output_path();
        if let Err(e) = self.write_rows(&path, rows) {
            tracing::warn!(path = %path.display(), error = %e, "statistics output failed, continuing");
        }
    }

    fn write_rows(&self, path: &Path, rows: &[StatRow]) -> Result<(), StatError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(path)?;
        match self.format {
            StatOutputFormat::Csv => {
                writeln!(f, "time,component,statistic,count,sum,min,max,end_of_sim")?;
                for r in rows {
                    writeln!(
                        f,
                        "{},{},{},{},{},{},{},{}",
                        r.time, r.component, r.statistic, r.count, r.sum, r.min, r.max, r.end_of_sim
                    )?;
                }
            }
            StatOutputFormat::Json => {
                serde_json::to_writer_pretty(&mut f, rows)?;
            }
        }
        Ok(())
    }

    /// Checkpointable state.
    pub fn snapshot(&self) -> StatEngineState {
        StatEngineState {
            slots: self.slots.clone(),
            rows: self.rows.clone(),
        }
    }

    /// Restores accumulator contents and emitted rows. The structural
    /// indices were already rebuilt by re-registration from the graph.
    pub fn restore(&mut self, state: StatEngineState) {
        debug_assert_eq!(state.slots.len(), self.slots.len());
        self.slots = state.slots;
        self.rows = state.rows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> StatEngine {
        StatEngine::new(StatOutputFormat::Csv, ".", "stats_test", 0, 1)
    }

    fn lord() -> TimeLord {
        TimeLord::new("1ns").unwrap()
    }

    #[test]
    fn test_accumulator() {
        let mut a = Accumulator::default();
        a.add(3.0);
        a.add(1.0);
        a.add(8.0);
        assert_eq!(a.count, 3);
        assert_eq!(a.sum, 12.0);
        assert_eq!(a.min, 1.0);
        assert_eq!(a.max, 8.0);
        assert_eq!(a.mean(), 4.0);
        a.reset();
        assert_eq!(a.count, 0);
    }

    #[test]
    fn test_periodic_registration_and_output() {
        let mut e = engine();
        let cfg = ConfigStatistic::periodic("hits", "10ns");
        let id = e.register(1, "cache0", &cfg, &lord()).unwrap();

        assert_eq!(e.periods(), vec![10]);
        e.add_data(id, 3, 1.0);
        e.add_data(id, 7, 1.0);
        e.output_period(10, 10);

        assert_eq!(e.rows().len(), 1);
        assert_eq!(e.rows()[0].count, 2);
        // reset_on_output clears the accumulator.
        e.output_period(10, 20);
        assert_eq!(e.rows()[1].count, 0);
    }

    #[test]
    fn test_count_mode_self_flush() {
        let mut e = engine();
        let cfg = ConfigStatistic::by_count("bursts", 3);
        let id = e.register(1, "nic0", &cfg, &lord()).unwrap();
        assert_eq!(e.event_stat_ids(), &[id]);

        e.add_data(id, 1, 1.0);
        e.add_data(id, 2, 1.0);
        assert!(e.rows().is_empty());
        e.add_data(id, 3, 1.0);
        assert_eq!(e.rows().len(), 1);
        assert_eq!(e.rows()[0].count, 3);
    }

    #[test]
    fn test_dump_at_end() {
        let mut e = engine();
        let cfg = ConfigStatistic::at_end("total");
        let id = e.register(2, "sink0", &cfg, &lord()).unwrap();
        e.add_data(id, 5, 10.0);
        assert!(e.rows().is_empty());
        e.end_of_sim(100);
        assert_eq!(e.rows().len(), 1);
        assert!(e.rows()[0].end_of_sim);
        assert_eq!(e.rows()[0].sum, 10.0);
    }

    #[test]
    fn test_start_stop_edges() {
        let mut e = engine();
        let cfg = ConfigStatistic::periodic("window", "10ns").with_window("20ns", "50ns");
        let id = e.register(1, "c", &cfg, &lord()).unwrap();

        let edges = e.edges();
        assert_eq!(edges.len(), 2);
        assert!(edges.contains(&(20, StatEdge::Start, id)));
        assert!(edges.contains(&(50, StatEdge::Stop, id)));

        // Disabled until the start edge: samples are dropped.
        e.add_data(id, 5, 1.0);
        e.start_event(id);
        e.add_data(id, 25, 1.0);
        e.stop_event(id);
        e.add_data(id, 55, 1.0);
        e.output_period(10, 60);
        assert_eq!(e.rows()[0].count, 1);
    }

    #[test]
    fn test_groups_share_a_clock() {
        let mut e = engine();
        let a = ConfigStatistic::periodic("a", "10ns").in_group("g");
        let b = ConfigStatistic::periodic("b", "20ns").in_group("g");
        let ia = e.register(1, "c1", &a, &lord()).unwrap();
        let ib = e.register(2, "c2", &b, &lord()).unwrap();

        // Group clock runs at the fastest member rate.
        assert_eq!(e.periods(), vec![10]);
        e.add_data(ia, 1, 1.0);
        e.add_data(ib, 2, 2.0);
        e.output_period(10, 10);
        assert_eq!(e.rows().len(), 2);
    }

    #[test]
    fn test_rank_suffix_naming() {
        let solo = StatEngine::new(StatOutputFormat::Csv, "out", "run", 0, 1);
        assert_eq!(solo.output_path(), PathBuf::from("out/run.csv"));
        let multi = StatEngine::new(StatOutputFormat::Csv, "out", "run", 2, 4);
        assert_eq!(multi.output_path(), PathBuf::from("out/run_2.csv"));
    }

    #[test]
    fn test_missing_rate_rejected() {
        let mut e = engine();
        let mut cfg = ConfigStatistic::periodic("x", "10ns");
        cfg.rate = None;
        assert!(matches!(
            e.register(1, "c", &cfg, &lord()),
            Err(StatError::MissingRate(_))
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let mut e = engine();
        let cfg = ConfigStatistic::periodic("hits", "10ns");
        let id = e.register(1, "c", &cfg, &lord()).unwrap();
        e.add_data(id, 1, 4.0);
        let snap = e.snapshot();

        let mut e2 = engine();
        e2.register(1, "c", &cfg, &lord()).unwrap();
        e2.restore(snap);
        assert_eq!(e2.slots[id].data.count, 1);
        assert_eq!(e2.slots[id].data.sum, 4.0);
    }
}
