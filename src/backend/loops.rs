//! Loopback block devices over disk image files.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use super::command;
use super::error::BackendError;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoopDevice {
    pub device: PathBuf,
    pub backing_file: PathBuf,
    /// Partition nodes discovered by the partition scan, in order.
    pub partitions: Vec<PathBuf>,
}

pub trait LoopDevices: Send + Sync {
    /// Attach `image` with partition scanning enabled.
    fn attach(&self, image: &Path) -> Result<LoopDevice, BackendError>;

    fn detach(&self, device: &Path) -> Result<(), BackendError>;

    /// Detach every loop device whose backing file lives under `dir`.
    fn detach_all_under(&self, dir: &Path) -> Result<usize, BackendError>;
}

#[derive(Clone, Debug)]
pub struct LosetupLoops {
    losetup: PathBuf,
    sys_block: PathBuf,
}

impl Default for LosetupLoops {
    fn default() -> Self {
        Self {
            losetup: PathBuf::from("losetup"),
            sys_block: PathBuf::from("/sys/block"),
        }
    }
}

impl LosetupLoops {
    fn losetup(&self) -> Command {
        Command::new(&self.losetup)
    }

    fn partitions_of(&self, device: &Path) -> Result<Vec<PathBuf>, BackendError> {
        let Some(name) = device.file_name().and_then(|name| name.to_str()) else {
            return Err(BackendError::Parse {
                program: "losetup".into(),
                reason: format!("device path {} has no name", device.display()),
            });
        };
        let sys_dir = self.sys_block.join(name);
        let entries = fs::read_dir(&sys_dir).map_err(|err| BackendError::io(&sys_dir, err))?;
        let mut parts: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|entry| is_partition_of(name, entry))
            .collect();
        parts.sort_by_key(|part| partition_number(name, part));
        let dev_dir = device.parent().unwrap_or(Path::new("/dev"));
        Ok(parts.into_iter().map(|part| dev_dir.join(part)).collect())
    }
}

fn is_partition_of(device: &str, entry: &str) -> bool {
    entry
        .strip_prefix(device)
        .and_then(|rest| rest.strip_prefix('p'))
        .is_some_and(|num| !num.is_empty() && num.chars().all(|c| c.is_ascii_digit()))
}

fn partition_number(device: &str, entry: &str) -> u32 {
    entry
        .strip_prefix(device)
        .and_then(|rest| rest.strip_prefix('p'))
        .and_then(|num| num.parse().ok())
        .unwrap_or(u32::MAX)
}

impl LoopDevices for LosetupLoops {
    fn attach(&self, image: &Path) -> Result<LoopDevice, BackendError> {
        if !image.exists() {
            return Err(BackendError::not_found("image", image.display().to_string()));
        }
        let out = command::run(
            self.losetup()
                .args(["--find", "--show", "--partscan"])
                .arg(image),
        )?;
        let device = PathBuf::from(out.stdout.trim());
        if device.as_os_str().is_empty() {
            return Err(BackendError::Parse {
                program: "losetup".into(),
                reason: "no device printed".into(),
            });
        }
        let partitions = match self.partitions_of(&device) {
            Ok(partitions) => partitions,
            Err(err) => {
                let _ = self.detach(&device);
                return Err(err);
            }
        };
        tracing::debug!(device = %device.display(), image = %image.display(), partitions = partitions.len(), "attached loop");
        Ok(LoopDevice {
            device,
            backing_file: image.to_path_buf(),
            partitions,
        })
    }

    fn detach(&self, device: &Path) -> Result<(), BackendError> {
        command::run(self.losetup().arg("--detach").arg(device))?;
        Ok(())
    }

    fn detach_all_under(&self, dir: &Path) -> Result<usize, BackendError> {
        let out = command::run(self.losetup().args(["--list", "--json", "-O", "NAME,BACK-FILE"]))?;
        let devices = parse_loop_list(&out.stdout)?;
        let mut detached = 0;
        for (device, backing) in devices {
            if backing.starts_with(dir) {
                self.detach(&device)?;
                detached += 1;
            }
        }
        Ok(detached)
    }
}

#[derive(Deserialize)]
struct LoopList {
    #[serde(default)]
    loopdevices: Vec<LoopListEntry>,
}

#[derive(Deserialize)]
struct LoopListEntry {
    name: PathBuf,
    #[serde(rename = "back-file")]
    back_file: Option<String>,
}

/// `losetup --list --json` output; empty output means no devices.
fn parse_loop_list(stdout: &str) -> Result<Vec<(PathBuf, PathBuf)>, BackendError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let list: LoopList = serde_json::from_str(stdout).map_err(|err| BackendError::Parse {
        program: "losetup".into(),
        reason: err.to_string(),
    })?;
    Ok(list
        .loopdevices
        .into_iter()
        .filter_map(|entry| {
            let back = entry.back_file?;
            let back = back.trim_end_matches(" (deleted)").trim();
            Some((entry.name, PathBuf::from(back)))
        })
        .collect())
}
