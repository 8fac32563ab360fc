//! Partition-table introspection of disk images.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::command;
use super::error::BackendError;

const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionEntry {
    pub start_sector: u64,
    pub sectors: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionTable {
    pub sector_size: u64,
    pub partitions: Vec<PartitionEntry>,
}

pub trait PartitionInspector: Send + Sync {
    fn inspect(&self, image: &Path) -> Result<PartitionTable, BackendError>;
}

#[derive(Clone, Debug)]
pub struct SfdiskInspector {
    sfdisk: PathBuf,
}

impl Default for SfdiskInspector {
    fn default() -> Self {
        Self {
            sfdisk: PathBuf::from("sfdisk"),
        }
    }
}

impl PartitionInspector for SfdiskInspector {
    fn inspect(&self, image: &Path) -> Result<PartitionTable, BackendError> {
        if !image.exists() {
            return Err(BackendError::not_found("image", image.display().to_string()));
        }
        let out = command::run(Command::new(&self.sfdisk).arg("--json").arg(image))?;
        parse_sfdisk_json(&out.stdout)
    }
}

#[derive(Deserialize)]
struct SfdiskDump {
    partitiontable: SfdiskTable,
}

#[derive(Deserialize)]
struct SfdiskTable {
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<SfdiskPartition>,
}

#[derive(Deserialize)]
struct SfdiskPartition {
    start: u64,
    size: u64,
}

fn parse_sfdisk_json(stdout: &str) -> Result<PartitionTable, BackendError> {
    let dump: SfdiskDump = serde_json::from_str(stdout).map_err(|err| BackendError::Parse {
        program: "sfdisk".into(),
        reason: err.to_string(),
    })?;
    let table = dump.partitiontable;
    Ok(PartitionTable {
        sector_size: table.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE),
        partitions: table
            .partitions
            .into_iter()
            .map(|part| PartitionEntry {
                start_sector: part.start,
                sectors: part.size,
            })
            .collect(),
    })
}
