//! Checkpoint file layout and IO.
//!
//! A checkpoint is a registry text file referencing binary blobs:
//!
//! ```text
//! <prefix>.reg            registry (text)
//! <prefix>_globals.bin    launch-wide state
//! <prefix>_rank<r>.bin    one blob per rank
//! ```
//!
//! The registry contains a `** (globals): <file>` line and one
//! `** rank <r>: <file>` line per rank; file names are resolved relative
//! to the registry's directory so a checkpoint directory can be moved as
//! a unit. Each binary blob is a `u64` little-endian length prefix
//! followed by that many bytes of serialized state.
//!
//! The globals blob carries the launch topology, current simulated time,
//! the partitioned graph, and the shared parameter sets; each rank blob
//! carries the full state of that rank's partitions: component snapshots,
//! vortex contents in delivery order, link tables, statistics, exit
//! counters, and clock registrations. Restore verifies the format tag and
//! the (ranks, threads) shape before touching any rank blob.

use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::EngineConfig;
use crate::event::Activity;
use crate::exit::ExitCounter;
use crate::graph::ConfigGraph;
use crate::link::LinkMap;
use crate::sim::ClockRegistry;
use crate::stats::StatEngineState;
use crate::types::{ComponentId, PartitionId, RankId, SimTime};

/// Format tag embedded in the globals header; checkpoints from other
/// engine versions are rejected.
pub const FORMAT_TAG: &str = "tempest-ckpt-1";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no checkpoint registry configured")]
    NoRegistry,

    #[error("unsupported checkpoint format \"{0}\"")]
    BadFormat(String),

    #[error("malformed registry line: {0}")]
    BadRegistry(String),

    #[error("registry names no blob for rank {0}")]
    MissingRankBlob(RankId),

    #[error("blob truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: u64, found: u64 },
}

/// Launch-wide checkpoint state.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GlobalsHeader {
    pub format_tag: String,
    pub ranks: u32,
    pub threads: u32,
    pub current_sim_time: SimTime,
    pub current_priority: i32,
    pub timebase: String,
    pub config: EngineConfig,
    pub graph: ConfigGraph,
    pub shared_params: BTreeMap<String, BTreeMap<String, String>>,
}

/// One component's checkpointed state. Handlers are not stored; the
/// restore path recreates the component from its type and rebinds links
/// by id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComponentState {
    pub id: ComponentId,
    pub type_name: String,
    pub name: String,
    pub state: serde_json::Value,
}

/// Full state of one partition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionSnapshot {
    pub partition: PartitionId,
    pub time: SimTime,
    pub seq: u64,
    pub next_event_serial: u64,
    /// Safe window in force when the snapshot was taken.
    pub window_end: SimTime,
    pub next_checkpoint: SimTime,
    pub components: Vec<ComponentState>,
    /// Pending activities in delivery order.
    pub vortex: Vec<Activity>,
    pub links: LinkMap,
    pub stats: StatEngineState,
    pub exit: ExitCounter,
    pub clocks: ClockRegistry,
}

/// All partitions of one rank.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankBlob {
    pub rank: RankId,
    pub partitions: Vec<PartitionSnapshot>,
}

/// Parsed registry file.
#[derive(Clone, Debug)]
pub struct CheckpointManifest {
    pub globals_path: PathBuf,
    pub rank_paths: HashMap<RankId, PathBuf>,
}

fn globals_file(prefix: &str) -> String {
    format!("{prefix}_globals.bin")
}

fn rank_file(prefix: &str, rank: RankId) -> String {
    format!("{prefix}_rank{rank}.bin")
}

fn write_length_prefixed<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec(value)?;
    let mut f = std::fs::File::create(path)?;
    f.write_all(&(bytes.len() as u64).to_le_bytes())?;
    f.write_all(&bytes)?;
    Ok(())
}

fn read_length_prefixed<T: DeserializeOwned>(path: &Path) -> Result<T, CheckpointError> {
    let mut f = std::fs::File::open(path)?;
    let mut len_buf = [0u8; 8];
    f.read_exact(&mut len_buf)?;
    let expected = u64::from_le_bytes(len_buf);
    let mut bytes = Vec::with_capacity(expected as usize);
    f.read_to_end(&mut bytes)?;
    if (bytes.len() as u64) < expected {
        return Err(CheckpointError::Truncated {
            expected,
            found: bytes.len() as u64,
        });
    }
    Ok(serde_json::from_slice(&bytes[..expected as usize])?)
}

/// Writes the globals blob, the given rank blobs, and the registry.
/// Returns the registry path. Rank blobs not in `blobs` (written by
/// their own ranks) are still listed in the registry by their
/// deterministic names.
pub fn write_checkpoint<'a>(
    dir: &Path,
    prefix: &str,
    header: &GlobalsHeader,
    blobs: impl Iterator<Item = &'a RankBlob>,
) -> Result<PathBuf, CheckpointError> {
    std::fs::create_dir_all(dir)?;
    write_length_prefixed(&dir.join(globals_file(prefix)), header)?;
    for blob in blobs {
        write_length_prefixed(&dir.join(rank_file(prefix, blob.rank)), blob)?;
    }

    let registry_path = dir.join(format!("{prefix}.reg"));
    let mut reg = std::fs::File::create(&registry_path)?;
    writeln!(reg, "format: {}", header.format_tag)?;
    writeln!(reg, "ranks: {}", header.ranks)?;
    writeln!(reg, "threads: {}", header.threads)?;
    writeln!(reg, "time: {}", header.current_sim_time)?;
    writeln!(reg, "** (globals): {}", globals_file(prefix))?;
    for rank in 0..header.ranks {
        writeln!(reg, "** rank {rank}: {}", rank_file(prefix, rank))?;
    }
    Ok(registry_path)
}

/// Writes one rank's blob under the deterministic name the registry
/// expects. Non-zero ranks call this; rank 0 writes the registry.
pub fn write_rank_blob(dir: &Path, prefix: &str, blob: &RankBlob) -> Result<(), CheckpointError> {
    std::fs::create_dir_all(dir)?;
    write_length_prefixed(&dir.join(rank_file(prefix, blob.rank)), blob)
}

/// Parses a registry file into blob paths, resolved relative to the
/// registry's directory.
pub fn read_registry(path: &Path) -> Result<CheckpointManifest, CheckpointError> {
    let text = std::fs::read_to_string(path)?;
    let base = path.parent().unwrap_or(Path::new("."));
    let mut globals_path = None;
    let mut rank_paths = HashMap::new();

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("** (globals): ") {
            globals_path = Some(base.join(rest.trim()));
        } else if let Some(rest) = line.strip_prefix("** rank ") {
            let (rank_str, file) = rest
                .split_once(':')
                .ok_or_else(|| CheckpointError::BadRegistry(line.to_string()))?;
            let rank: RankId = rank_str
                .trim()
                .parse()
                .map_err(|_| CheckpointError::BadRegistry(line.to_string()))?;
            rank_paths.insert(rank, base.join(file.trim()));
        }
    }

    Ok(CheckpointManifest {
        globals_path: globals_path
            .ok_or_else(|| CheckpointError::BadRegistry("missing globals line".to_string()))?,
        rank_paths,
    })
}

pub fn read_globals(path: &Path) -> Result<GlobalsHeader, CheckpointError> {
    read_length_prefixed(path)
}

pub fn read_rank_blob(path: &Path) -> Result<RankBlob, CheckpointError> {
    read_length_prefixed(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionId;

    fn header(ranks: u32, threads: u32) -> GlobalsHeader {
        GlobalsHeader {
            format_tag: FORMAT_TAG.to_string(),
            ranks,
            threads,
            current_sim_time: 12345,
            current_priority: 27,
            timebase: "1ps".to_string(),
            config: EngineConfig::default(),
            graph: ConfigGraph::new(),
            shared_params: BTreeMap::new(),
        }
    }

    fn blob(rank: RankId) -> RankBlob {
        RankBlob {
            rank,
            partitions: vec![PartitionSnapshot {
                partition: PartitionId::new(rank, 0),
                time: 12345,
                seq: 7,
                next_event_serial: 9,
                window_end: 13000,
                next_checkpoint: 20000,
                components: vec![ComponentState {
                    id: 1,
                    type_name: "T".to_string(),
                    name: "c1".to_string(),
                    state: serde_json::json!({"count": 3}),
                }],
                vortex: Vec::new(),
                links: LinkMap::new(),
                stats: StatEngineState {
                    slots: Vec::new(),
                    rows: Vec::new(),
                },
                exit: ExitCounter::new(),
                clocks: ClockRegistry::default(),
            }],
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(1, 1);
        let b = blob(0);
        let registry = write_checkpoint(dir.path(), "ckpt", &h, std::iter::once(&b)).unwrap();

        let manifest = read_registry(&registry).unwrap();
        let back_h = read_globals(&manifest.globals_path).unwrap();
        assert_eq!(back_h.current_sim_time, 12345);
        assert_eq!(back_h.format_tag, FORMAT_TAG);

        let back_b = read_rank_blob(&manifest.rank_paths[&0]).unwrap();
        assert_eq!(back_b.rank, 0);
        assert_eq!(back_b.partitions[0].seq, 7);
        assert_eq!(back_b.partitions[0].components[0].state["count"], 3);
    }

    #[test]
    fn test_registry_lists_all_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(3, 2);
        // Rank 0 writes only its own blob; the registry still names all.
        let b = blob(0);
        let registry = write_checkpoint(dir.path(), "ckpt", &h, std::iter::once(&b)).unwrap();
        let manifest = read_registry(&registry).unwrap();
        assert_eq!(manifest.rank_paths.len(), 3);
        assert!(manifest.rank_paths.contains_key(&2));
    }

    #[test]
    fn test_rank_blob_written_separately() {
        let dir = tempfile::tempdir().unwrap();
        let h = header(2, 1);
        let registry =
            write_checkpoint(dir.path(), "ckpt", &h, std::iter::once(&blob(0))).unwrap();
        write_rank_blob(dir.path(), "ckpt", &blob(1)).unwrap();

        let manifest = read_registry(&registry).unwrap();
        let b1 = read_rank_blob(&manifest.rank_paths[&1]).unwrap();
        assert_eq!(b1.rank, 1);
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(&1000u64.to_le_bytes()).unwrap();
        f.write_all(b"short").unwrap();
        drop(f);
        assert!(matches!(
            read_globals(&path),
            Err(CheckpointError::Truncated { .. })
        ));
    }

    #[test]
    fn test_malformed_registry_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.reg");
        std::fs::write(&path, "** rank x: file.bin\n").unwrap();
        assert!(read_registry(&path).is_err());

        std::fs::write(&path, "no marker lines at all\n").unwrap();
        assert!(matches!(
            read_registry(&path),
            Err(CheckpointError::BadRegistry(_))
        ));
    }
}
