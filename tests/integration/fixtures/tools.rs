//! Stand-in diff and writer programs for streaming jobs.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bmr_rs::config::MirrorConfig;

pub struct Tools {
    pub dir: PathBuf,
}

impl Tools {
    /// `snapdiff` prints its arguments as the delta; `blockwrite` records
    /// its arguments and the delta it received.
    pub fn install(dir: &Path) -> Self {
        Self::install_with_diff_status(dir, 0)
    }

    pub fn install_with_diff_status(dir: &Path, status: i32) -> Self {
        fs::create_dir_all(dir).expect("create tools dir");
        let written = dir.join("blockwrite.out");
        script(
            &dir.join("snapdiff"),
            &format!("printf 'delta %s %s %s %s %s\\n' \"$@\"\nexit {status}\n"),
        );
        script(
            &dir.join("blockwrite"),
            &format!("{{ echo \"$1 $2\"; cat; }} > '{}'\n", written.display()),
        );
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn configure(&self, mirror: &mut MirrorConfig) {
        mirror.diff_program = self.dir.join("snapdiff");
        mirror.writer_program = self.dir.join("blockwrite");
        mirror.rate_limit_bytes_per_sec = None;
    }

    pub fn written(&self) -> Option<String> {
        fs::read_to_string(self.dir.join("blockwrite.out")).ok()
    }
}

fn script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}")).expect("write tool script");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod tool script");
}
