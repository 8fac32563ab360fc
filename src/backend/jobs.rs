//! Labelled background jobs.
//!
//! A job is a process group led by the launched program. The launching
//! [`ProcessJobRunner`] keeps the child handle on a waiter thread and learns
//! about exits over a channel; other processes fall back to the pid file and
//! a signal-0 probe of the group.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;

use super::command;
use super::error::BackendError;
use crate::core::{CoreError, InvalidId};
use crate::paths::{self, StateDir};

const EXIT_WAIT_SLICE: Duration = Duration::from_millis(50);

/// Stable, filesystem-safe job identity.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobLabel(String);

impl JobLabel {
    pub fn new(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let valid = !s.is_empty()
            && !s.starts_with('.')
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(InvalidId::JobLabel {
                raw: s,
                reason: "must be ascii alphanumeric, '-', '_' or '.'".into(),
            }
            .into());
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobLabel({:?})", self.0)
    }
}

impl fmt::Display for JobLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    pub label: JobLabel,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Run in the background; otherwise `launch` waits for completion.
    pub detached: bool,
}

pub trait JobRunner: Send + Sync {
    /// `AlreadyExists` when a job with the same label is running.
    fn launch(&self, job: &JobSpec) -> Result<(), BackendError>;

    fn is_running(&self, label: &JobLabel) -> Result<bool, BackendError>;

    /// Whether the job got as far as running, even if it already finished.
    fn has_started(&self, label: &JobLabel) -> Result<bool, BackendError> {
        self.is_running(label)
    }

    /// Wait up to `attempts` probes, `interval` apart, for the job to start.
    fn await_started(
        &self,
        label: &JobLabel,
        attempts: u32,
        interval: Duration,
    ) -> Result<bool, BackendError> {
        for attempt in 0..attempts {
            if self.has_started(label)? {
                return Ok(true);
            }
            if attempt + 1 < attempts {
                thread::sleep(interval);
            }
        }
        Ok(false)
    }

    fn running_labels(&self) -> Result<Vec<JobLabel>, BackendError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Running,
    /// Exit code, or `None` when killed by a signal.
    Exited(Option<i32>),
}

#[derive(Debug)]
struct JobExit {
    label: JobLabel,
    pgid: i32,
    code: Option<i32>,
}

#[derive(Debug)]
struct JobRecord {
    pgid: i32,
    state: JobState,
}

#[derive(Debug)]
pub struct ProcessJobRunner {
    state_dir: StateDir,
    records: Mutex<HashMap<JobLabel, JobRecord>>,
    exit_tx: Sender<JobExit>,
    exit_rx: Receiver<JobExit>,
}

impl ProcessJobRunner {
    pub fn new(state_dir: StateDir) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        Self {
            state_dir,
            records: Mutex::new(HashMap::new()),
            exit_tx,
            exit_rx,
        }
    }

    fn log_path(&self, label: &JobLabel) -> PathBuf {
        self.state_dir
            .jobs_dir()
            .join(format!("{}.log", label.as_str()))
    }

    fn record_exit(&self, records: &mut HashMap<JobLabel, JobRecord>, exit: JobExit) {
        if let Some(record) = records.get_mut(&exit.label)
            && record.pgid == exit.pgid
        {
            record.state = JobState::Exited(exit.code);
        }
    }

    fn drain_exits(&self, records: &mut HashMap<JobLabel, JobRecord>) {
        for exit in self.exit_rx.try_iter() {
            self.record_exit(records, exit);
        }
    }

    /// State of a job this runner launched; `None` for foreign jobs.
    pub fn state(&self, label: &JobLabel) -> Option<JobState> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        self.drain_exits(&mut records);
        records.get(label).map(|record| record.state)
    }

    /// Block until a job launched here exits or `timeout` passes.
    ///
    /// Returns `Some(JobState::Running)` on timeout and `None` for jobs this
    /// runner did not launch.
    pub fn wait_for_exit(&self, label: &JobLabel, timeout: Duration) -> Option<JobState> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.state(label) {
                Some(JobState::Running) => {}
                other => return other,
            }
            let now = Instant::now();
            if now >= deadline {
                return Some(JobState::Running);
            }
            // Short slices: another caller may drain our exit first.
            let slice = (now + EXIT_WAIT_SLICE).min(deadline);
            if let Ok(exit) = self.exit_rx.recv_deadline(slice) {
                let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
                self.record_exit(&mut records, exit);
            }
        }
    }

    fn launch_detached(&self, job: &JobSpec) -> Result<(), BackendError> {
        let jobs_dir = self.state_dir.jobs_dir();
        fs::create_dir_all(&jobs_dir).map_err(|err| BackendError::io(&jobs_dir, err))?;
        let log_path = self.log_path(&job.label);
        let log = fs::File::create(&log_path).map_err(|err| BackendError::io(&log_path, err))?;
        let log_err = log
            .try_clone()
            .map_err(|err| BackendError::io(&log_path, err))?;

        let program = job.program.display().to_string();
        let mut child = Command::new(&job.program)
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|source| BackendError::Spawn { program, source })?;

        let pgid = i32::try_from(child.id()).map_err(|_| BackendError::Parse {
            program: job.program.display().to_string(),
            reason: format!("pid {} out of range", child.id()),
        })?;
        let pid_path = self.state_dir.job_pid_path(job.label.as_str());
        if let Err(err) = paths::atomic_write(&pid_path, pgid.to_string().as_bytes()) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BackendError::io(&pid_path, err));
        }

        {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.insert(
                job.label.clone(),
                JobRecord {
                    pgid,
                    state: JobState::Running,
                },
            );
        }

        let label = job.label.clone();
        let exit_tx = self.exit_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", label.as_str()))
            .spawn(move || {
                let code = match child.wait() {
                    Ok(status) => status.code(),
                    Err(err) => {
                        tracing::warn!(label = %label, error = %err, "failed to wait on job");
                        None
                    }
                };
                remove_pid_file_if_owned(&pid_path, pgid);
                tracing::info!(label = %label, pgid, code = ?code, "job exited");
                let _ = exit_tx.send(JobExit { label, pgid, code });
            });
        if let Err(err) = spawned {
            return Err(BackendError::io(&jobs_dir, err));
        }
        tracing::info!(label = %job.label, pgid, "launched job");
        Ok(())
    }

    fn probe_pid_file(&self, label: &JobLabel) -> Result<bool, BackendError> {
        let pid_path = self.state_dir.job_pid_path(label.as_str());
        let Some(pgid) = read_pid_file(&pid_path)? else {
            return Ok(false);
        };
        Ok(process_group_alive(pgid))
    }
}

impl JobRunner for ProcessJobRunner {
    fn launch(&self, job: &JobSpec) -> Result<(), BackendError> {
        if self.is_running(&job.label)? {
            return Err(BackendError::AlreadyExists {
                what: "job",
                name: job.label.to_string(),
            });
        }
        if job.detached {
            return self.launch_detached(job);
        }
        command::run(
            Command::new(&job.program)
                .args(&job.args)
                .process_group(0),
        )?;
        Ok(())
    }

    fn is_running(&self, label: &JobLabel) -> Result<bool, BackendError> {
        match self.state(label) {
            Some(state) => Ok(state == JobState::Running),
            None => self.probe_pid_file(label),
        }
    }

    fn has_started(&self, label: &JobLabel) -> Result<bool, BackendError> {
        if self.state(label).is_some() {
            return Ok(true);
        }
        self.probe_pid_file(label)
    }

    fn await_started(
        &self,
        label: &JobLabel,
        attempts: u32,
        interval: Duration,
    ) -> Result<bool, BackendError> {
        // The child handle is held from spawn onwards, so no polling is needed.
        if self.state(label).is_some() {
            return Ok(true);
        }
        for attempt in 0..attempts {
            if self.probe_pid_file(label)? {
                return Ok(true);
            }
            if attempt + 1 < attempts {
                thread::sleep(interval);
            }
        }
        Ok(false)
    }

    fn running_labels(&self) -> Result<Vec<JobLabel>, BackendError> {
        let jobs_dir = self.state_dir.jobs_dir();
        let entries = match fs::read_dir(&jobs_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(BackendError::io(&jobs_dir, err)),
        };
        let mut labels = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| BackendError::io(&jobs_dir, err))?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(label) = name
                .strip_suffix(".pid")
                .and_then(|stem| JobLabel::new(stem).ok())
            else {
                continue;
            };
            if self.is_running(&label)? {
                labels.push(label);
            }
        }
        labels.sort();
        Ok(labels)
    }
}

fn read_pid_file(path: &Path) -> Result<Option<i32>, BackendError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BackendError::io(path, err)),
    };
    match raw.trim().parse::<i32>() {
        Ok(pgid) if pgid > 0 => Ok(Some(pgid)),
        _ => {
            tracing::warn!(path = %path.display(), "ignoring malformed pid file");
            Ok(None)
        }
    }
}

fn remove_pid_file_if_owned(path: &Path, pgid: i32) {
    if let Ok(Some(recorded)) = read_pid_file(path)
        && recorded == pgid
        && let Err(err) = paths::remove_if_exists(path)
    {
        tracing::warn!(path = %path.display(), error = %err, "failed to remove pid file");
    }
}

/// Signal 0 to the group: delivered, or refused for permissions, means alive.
pub(crate) fn process_group_alive(pgid: i32) -> bool {
    match killpg(Pid::from_raw(pgid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Signal 0 to a single process.
pub(crate) fn process_alive(pid: i32) -> bool {
    match nix::sys::signal::kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}
