//! Storage-protocol initiator (the client side used to reach a peer's targets).

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use super::command;
use super::error::BackendError;
use crate::core::PeerAddress;

/// iscsiadm exit status for "no matching sessions/records".
const ISCSI_ERR_NO_OBJS_FOUND: i32 = 21;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub portal: String,
    pub name: String,
}

pub trait Initiator: Send + Sync {
    fn discover(&self, peer: &PeerAddress) -> Result<Vec<DiscoveredTarget>, BackendError>;

    fn login(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError>;

    /// Succeeds when no session to `target` exists.
    fn logout(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError>;

    /// Log out of every session to `peer`; succeeds when there are none.
    fn logout_all(&self, peer: &PeerAddress) -> Result<(), BackendError>;

    /// Drop discovery and node records for `peer`.
    fn purge_discovery(&self, peer: &PeerAddress) -> Result<(), BackendError>;

    /// Peers present in the discovery database.
    fn discovery_peers(&self) -> Result<Vec<PeerAddress>, BackendError>;

    /// Local block device nodes backing a logged-in target.
    fn block_devices(&self, peer: &PeerAddress, target: &str)
    -> Result<Vec<PathBuf>, BackendError>;
}

#[derive(Clone, Debug)]
pub struct IscsiadmInitiator {
    iscsiadm: PathBuf,
    by_path: PathBuf,
}

impl Default for IscsiadmInitiator {
    fn default() -> Self {
        Self {
            iscsiadm: PathBuf::from("iscsiadm"),
            by_path: PathBuf::from("/dev/disk/by-path"),
        }
    }
}

impl IscsiadmInitiator {
    fn iscsiadm(&self) -> Command {
        Command::new(&self.iscsiadm)
    }

    /// Run, treating "nothing found" as success.
    fn run_tolerant(&self, cmd: &mut Command) -> Result<(), BackendError> {
        let out = command::output(cmd)?;
        match out.code {
            Some(0) | Some(ISCSI_ERR_NO_OBJS_FOUND) => Ok(()),
            code => Err(BackendError::CommandFailed {
                program: "iscsiadm".into(),
                code,
                stderr: out.stderr,
            }),
        }
    }
}

impl Initiator for IscsiadmInitiator {
    fn discover(&self, peer: &PeerAddress) -> Result<Vec<DiscoveredTarget>, BackendError> {
        let out = command::run(
            self.iscsiadm()
                .args(["-m", "discovery", "-t", "sendtargets", "-p"])
                .arg(peer.as_str()),
        )?;
        Ok(parse_sendtargets(&out.stdout))
    }

    fn login(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError> {
        command::run(
            self.iscsiadm()
                .args(["-m", "node", "-T", target, "-p"])
                .arg(peer.as_str())
                .arg("--login"),
        )?;
        Ok(())
    }

    fn logout(&self, peer: &PeerAddress, target: &str) -> Result<(), BackendError> {
        self.run_tolerant(
            self.iscsiadm()
                .args(["-m", "node", "-T", target, "-p"])
                .arg(peer.as_str())
                .arg("--logout"),
        )
    }

    fn logout_all(&self, peer: &PeerAddress) -> Result<(), BackendError> {
        self.run_tolerant(
            self.iscsiadm()
                .args(["-m", "node", "-p"])
                .arg(peer.as_str())
                .arg("--logout"),
        )
    }

    fn purge_discovery(&self, peer: &PeerAddress) -> Result<(), BackendError> {
        self.run_tolerant(
            self.iscsiadm()
                .args(["-m", "node", "-p"])
                .arg(peer.as_str())
                .args(["-o", "delete"]),
        )?;
        self.run_tolerant(
            self.iscsiadm()
                .args(["-m", "discoverydb", "-t", "sendtargets", "-p"])
                .arg(peer.as_str())
                .args(["-o", "delete"]),
        )
    }

    fn discovery_peers(&self) -> Result<Vec<PeerAddress>, BackendError> {
        let out = command::output(self.iscsiadm().args(["-m", "discoverydb"]))?;
        match out.code {
            Some(0) => Ok(parse_discoverydb(&out.stdout)),
            Some(ISCSI_ERR_NO_OBJS_FOUND) => Ok(Vec::new()),
            code => Err(BackendError::CommandFailed {
                program: "iscsiadm".into(),
                code,
                stderr: out.stderr,
            }),
        }
    }

    fn block_devices(
        &self,
        peer: &PeerAddress,
        target: &str,
    ) -> Result<Vec<PathBuf>, BackendError> {
        find_by_path_devices(&self.by_path, peer, target)
    }
}

/// `<portal>,<tpgt> <target>` per line.
fn parse_sendtargets(stdout: &str) -> Vec<DiscoveredTarget> {
    stdout
        .lines()
        .filter_map(|line| {
            let (portal, name) = line.trim().split_once(char::is_whitespace)?;
            let portal = portal.split(',').next().unwrap_or(portal);
            Some(DiscoveredTarget {
                portal: portal.to_string(),
                name: name.trim().to_string(),
            })
        })
        .collect()
}

/// `<portal> via sendtargets` per line; the portal port is kept as recorded.
fn parse_discoverydb(stdout: &str) -> Vec<PeerAddress> {
    let mut peers: Vec<PeerAddress> = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter_map(|portal| PeerAddress::new(portal).ok())
        .collect();
    peers.sort();
    peers.dedup();
    peers
}

/// by-path links look like `ip-<host>[:port]-iscsi-<target>-lun-<n>`.
fn by_path_matches(entry: &str, peer: &PeerAddress, target: &str) -> bool {
    if entry.contains("-part") {
        return false;
    }
    let Some(rest) = entry
        .strip_prefix("ip-")
        .and_then(|rest| rest.strip_prefix(peer.as_str()))
    else {
        return false;
    };
    let rest = match rest.strip_prefix(':') {
        Some(port_and_rest) => port_and_rest.trim_start_matches(|c: char| c.is_ascii_digit()),
        None => rest,
    };
    rest.strip_prefix("-iscsi-")
        .and_then(|rest| rest.strip_prefix(target))
        .is_some_and(|rest| rest.starts_with("-lun-"))
}

fn find_by_path_devices(
    by_path: &Path,
    peer: &PeerAddress,
    target: &str,
) -> Result<Vec<PathBuf>, BackendError> {
    let entries = match fs::read_dir(by_path) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BackendError::io(by_path, err)),
    };
    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| BackendError::io(by_path, err))?;
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if by_path_matches(&name, peer, target) {
            let link = entry.path();
            let device = fs::canonicalize(&link).map_err(|err| BackendError::io(&link, err))?;
            devices.push(device);
        }
    }
    devices.sort();
    Ok(devices)
}
