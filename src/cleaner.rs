//! Reclamation of abandoned restore clones and discovery records.
//!
//! A sweep never fails because of one artifact: every per-clone and
//! per-peer failure is logged and counted, and the sweep moves on.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use crate::assembly::RestoreAssembler;
use crate::backend::BackendError;
use crate::config::CleanerConfig;
use crate::core::{CloneSpec, CloneSuffix, WallClock};
use crate::mirror::MirrorService;
use crate::paths::StateDir;

/// Last observed activity of a restore clone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Activity {
    /// Progress logs exist; the pushing flow owns the clone.
    Push { last: WallClock },
    /// Only the creation timestamp is known.
    Pull { created: WallClock },
    /// Neither progress logs nor a timestamp file.
    Unknown,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub destroyed: usize,
    pub skipped_running: usize,
    pub skipped_push: usize,
    pub skipped_fresh: usize,
    pub failed: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    pub purged: usize,
    pub skipped_running: usize,
    pub failed: usize,
}

pub struct BmrCleaner {
    assembler: Arc<RestoreAssembler>,
    mirrors: Arc<MirrorService>,
    config: CleanerConfig,
    state_dir: StateDir,
}

impl BmrCleaner {
    pub fn new(
        assembler: Arc<RestoreAssembler>,
        mirrors: Arc<MirrorService>,
        config: CleanerConfig,
        state_dir: StateDir,
    ) -> Self {
        Self {
            assembler,
            mirrors,
            config,
            state_dir,
        }
    }

    pub fn clean_stale_bmrs(&self, immediate: bool) -> Result<SweepReport, BackendError> {
        self.clean_stale_bmrs_at(immediate, WallClock::now())
    }

    /// Sweep as if the current time were `now`.
    pub fn clean_stale_bmrs_at(
        &self,
        immediate: bool,
        now: WallClock,
    ) -> Result<SweepReport, BackendError> {
        let span = tracing::info_span!("clean_stale_bmrs", immediate);
        let _enter = span.enter();

        let mut report = SweepReport::default();
        for spec in self.bmr_clones()? {
            report.examined += 1;
            let span = tracing::info_span!("artifact", clone = %spec);
            let _enter = span.enter();
            self.sweep_one(&spec, immediate, now, &mut report);
        }
        tracing::info!(
            examined = report.examined,
            destroyed = report.destroyed,
            failed = report.failed,
            "stale restore sweep finished"
        );
        Ok(report)
    }

    fn bmr_clones(&self) -> Result<Vec<CloneSpec>, BackendError> {
        let suffixes = [CloneSuffix::bmr(), CloneSuffix::differential_rollback()];
        let names = self.assembler.backends().storage.list_clones()?;
        Ok(names
            .iter()
            .filter_map(|name| {
                suffixes
                    .iter()
                    .find_map(|suffix| CloneSpec::parse_clone_name(name, suffix).ok())
            })
            .collect())
    }

    fn sweep_one(
        &self,
        spec: &CloneSpec,
        immediate: bool,
        now: WallClock,
        report: &mut SweepReport,
    ) {
        let activity = match self.activity(spec) {
            Ok(activity) => activity,
            Err(err) => {
                tracing::error!(error = %err, "failed to read restore activity");
                report.failed += 1;
                return;
            }
        };
        let created = match activity {
            Activity::Push { last } => {
                tracing::debug!(last_activity = last.0, "push-style restore left to its owner");
                report.skipped_push += 1;
                return;
            }
            Activity::Pull { created } => Some(created),
            Activity::Unknown => None,
        };
        let stale = immediate
            || created.is_some_and(|created| now.elapsed_since(created) > self.config.grace_period());
        if !stale {
            if created.is_none() {
                tracing::warn!("restore clone has no creation timestamp; keeping it");
            }
            report.skipped_fresh += 1;
            return;
        }

        match self.mirrors.running_for_asset(spec.asset()) {
            Ok(false) => {}
            Ok(true) => {
                tracing::info!("mirror running for asset; not destroying");
                report.skipped_running += 1;
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to check running mirrors");
                report.failed += 1;
                return;
            }
        }

        match self.assembler.teardown(spec) {
            Ok(()) => {
                tracing::info!("destroyed stale restore");
                report.destroyed += 1;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to destroy stale restore");
                report.failed += 1;
            }
        }
    }

    /// Progress logs take precedence over the creation timestamp.
    pub fn activity(&self, spec: &CloneSpec) -> Result<Activity, BackendError> {
        if let Some(last) = newest_mtime(&self.state_dir.progress_dir(spec))? {
            return Ok(Activity::Push { last });
        }
        let stamp = self.state_dir.clone_timestamp_path(spec);
        let raw = match fs::read_to_string(&stamp) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Activity::Unknown),
            Err(err) => return Err(BackendError::io(&stamp, err)),
        };
        let created = match raw.trim().parse::<u64>() {
            Ok(ms) => WallClock(ms),
            Err(_) => {
                let modified = fs::metadata(&stamp)
                    .and_then(|meta| meta.modified())
                    .map_err(|err| BackendError::io(&stamp, err))?;
                WallClock::from_system_time(modified)
            }
        };
        Ok(Activity::Pull { created })
    }

    /// Purge discovery state of every peer without a running mirror.
    pub fn clean_discovery_db(&self) -> Result<DiscoveryReport, BackendError> {
        let span = tracing::info_span!("clean_discovery_db");
        let _enter = span.enter();

        let initiator = self.mirrors.backends().initiator.as_ref();
        let mut report = DiscoveryReport::default();
        for peer in initiator.discovery_peers()? {
            match self.mirrors.running_for_peer(&peer) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::debug!(%peer, "mirror running; keeping discovery record");
                    report.skipped_running += 1;
                    continue;
                }
                Err(err) => {
                    tracing::error!(%peer, error = %err, "failed to check running mirrors");
                    report.failed += 1;
                    continue;
                }
            }
            let purged = initiator
                .logout_all(&peer)
                .and_then(|()| initiator.purge_discovery(&peer));
            match purged {
                Ok(()) => {
                    tracing::info!(%peer, "purged discovery record");
                    report.purged += 1;
                }
                Err(err) => {
                    tracing::error!(%peer, error = %err, "failed to purge discovery record");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}

/// Newest modification time of the files directly in `dir`.
fn newest_mtime(dir: &Path) -> Result<Option<WallClock>, BackendError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(BackendError::io(dir, err)),
    };
    let mut newest: Option<SystemTime> = None;
    for entry in entries {
        let entry = entry.map_err(|err| BackendError::io(dir, err))?;
        let meta = entry
            .metadata()
            .map_err(|err| BackendError::io(entry.path(), err))?;
        if !meta.is_file() {
            continue;
        }
        let modified = meta
            .modified()
            .map_err(|err| BackendError::io(entry.path(), err))?;
        newest = Some(newest.map_or(modified, |seen| seen.max(modified)));
    }
    Ok(newest.map(WallClock::from_system_time))
}
