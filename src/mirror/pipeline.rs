//! The streaming job: snapshot delta -> optional throttle -> device writer.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use super::error::MirrorError;
use crate::backend::PartitionTable;
use crate::config::MirrorConfig;
use crate::core::VolumeGuid;

/// Byte range of the only partition on a source image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PartitionGeometry {
    /// Partition start within the full image.
    pub offset: u64,
    pub length: u64,
}

impl PartitionGeometry {
    pub fn from_table(image: &Path, table: &PartitionTable) -> Result<Self, MirrorError> {
        let [partition] = table.partitions.as_slice() else {
            return Err(MirrorError::PartitionCount {
                image: image.to_path_buf(),
                found: table.partitions.len(),
            });
        };
        let overflow = || MirrorError::GeometryOverflow {
            image: image.to_path_buf(),
            start_sector: partition.start_sector,
            sectors: partition.sectors,
            sector_size: table.sector_size,
        };
        let offset = partition
            .start_sector
            .checked_mul(table.sector_size)
            .ok_or_else(overflow)?;
        let length = partition
            .sectors
            .checked_mul(table.sector_size)
            .ok_or_else(overflow)?;
        Ok(Self { offset, length })
    }

    /// The exported device is the partition itself, which starts at 0.
    pub fn write_offset(&self) -> i128 {
        -i128::from(self.offset)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamPlan {
    pub base_snapshot_dir: PathBuf,
    pub target_snapshot_dir: PathBuf,
    pub volume: VolumeGuid,
    pub geometry: PartitionGeometry,
    pub device: PathBuf,
    pub exit_file: PathBuf,
}

impl StreamPlan {
    /// POSIX sh script; the exit file receives the first failing stage's
    /// status (diff, then writer) and the device is synced last.
    pub fn script(&self, tools: &MirrorConfig) -> String {
        let exit = self.exit_file.display().to_string();
        let diff_rc = quote(&format!("{exit}.diff-rc"));
        let write_rc = quote(&format!("{exit}.write-rc"));
        let tmp = quote(&format!("{exit}.tmp"));
        let device = quote_path(&self.device);

        let mut script = String::new();
        let _ = write!(
            script,
            "{{ {} {} {} {} {} {}; echo $? > {diff_rc}; }}",
            quote_path(&tools.diff_program),
            quote_path(&self.base_snapshot_dir),
            quote_path(&self.target_snapshot_dir),
            quote(self.volume.as_str()),
            self.geometry.offset,
            self.geometry.length,
        );
        if let Some(rate) = tools.rate_limit_bytes_per_sec {
            let _ = write!(script, " | {} -q -L {rate}", quote_path(&tools.throttle_program));
        }
        let _ = writeln!(
            script,
            " | {{ {} {device} {}; echo $? > {write_rc}; }}",
            quote_path(&tools.writer_program),
            self.geometry.write_offset(),
        );
        let _ = writeln!(script, "rc=$(cat {diff_rc} 2>/dev/null)");
        let _ = writeln!(
            script,
            "if [ \"${{rc:-1}}\" = 0 ]; then rc=$(cat {write_rc} 2>/dev/null); fi"
        );
        let _ = writeln!(script, "rc=${{rc:-1}}");
        let _ = writeln!(script, "rm -f {diff_rc} {write_rc}");
        let _ = writeln!(
            script,
            "printf '%s\\n' \"$rc\" > {tmp} && mv -f {tmp} {}",
            quote(&exit)
        );
        let _ = writeln!(script, "sync {device} 2>/dev/null || sync");
        let _ = writeln!(script, "exit \"$rc\"");
        script
    }
}

fn quote_path(path: &Path) -> String {
    quote(&path.display().to_string())
}

/// Single-quote for sh.
fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    use crate::backend::PartitionEntry;

    fn table(sector_size: u64, parts: &[(u64, u64)]) -> PartitionTable {
        PartitionTable {
            sector_size,
            partitions: parts
                .iter()
                .map(|&(start_sector, sectors)| PartitionEntry {
                    start_sector,
                    sectors,
                })
                .collect(),
        }
    }

    #[test]
    fn geometry_requires_exactly_one_partition() {
        let image = Path::new("/img");
        for parts in [&[][..], &[(2048, 10), (4096, 10)][..]] {
            let err = PartitionGeometry::from_table(image, &table(512, parts)).unwrap_err();
            assert!(matches!(err, MirrorError::PartitionCount { found, .. } if found == parts.len()));
        }
    }

    #[test]
    fn geometry_overflow_is_reported() {
        let err =
            PartitionGeometry::from_table(Path::new("/img"), &table(4096, &[(u64::MAX / 2, 1)]))
                .unwrap_err();
        assert!(matches!(err, MirrorError::GeometryOverflow { .. }));
    }

    proptest! {
        #[test]
        fn offset_is_start_times_sector_size(
            start in 0u64..(1 << 32),
            sectors in 1u64..(1 << 32),
            sector_size in prop::sample::select(vec![512u64, 1024, 2048, 4096]),
        ) {
            let geometry =
                PartitionGeometry::from_table(Path::new("/img"), &table(sector_size, &[(start, sectors)]))
                    .unwrap();
            prop_assert_eq!(geometry.offset, start * sector_size);
            prop_assert_eq!(geometry.length, sectors * sector_size);
            prop_assert_eq!(geometry.write_offset(), -i128::from(start * sector_size));
        }
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(quote("a'b"), r"'a'\''b'");
    }

    #[test]
    fn script_wires_tools_in_order() {
        let plan = StreamPlan {
            base_snapshot_dir: PathBuf::from("/home/agents/A1/.zfs/snapshot/1000"),
            target_snapshot_dir: PathBuf::from("/home/agents/A1/.zfs/snapshot/1100"),
            volume: VolumeGuid::new("vol1").unwrap(),
            geometry: PartitionGeometry {
                offset: 1_048_576,
                length: 8_192,
            },
            device: PathBuf::from("/dev/sdc"),
            exit_file: PathBuf::from("/state/mirror/p_A1_vol1_1100.exit"),
        };
        let mut tools = MirrorConfig::default();
        let plain = plan.script(&tools);
        assert!(plain.contains(
            "'snapdiff' '/home/agents/A1/.zfs/snapshot/1000' '/home/agents/A1/.zfs/snapshot/1100' 'vol1' 1048576 8192"
        ));
        assert!(plain.contains("'blockwrite' '/dev/sdc' -1048576"));
        assert!(!plain.contains("'pv'"));
        assert!(plain.contains("'/state/mirror/p_A1_vol1_1100.exit'"));

        tools.rate_limit_bytes_per_sec = Some(5_000_000);
        let throttled = plan.script(&tools);
        assert!(throttled.contains("| 'pv' -q -L 5000000 |"));
    }
}
