//! Running the system tools the adapters shell out to.

use std::process::{Command, Stdio};

use super::error::BackendError;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Run to completion and capture output; any exit code is returned as data.
pub fn output(cmd: &mut Command) -> Result<CommandOutput, BackendError> {
    let program = program_name(cmd);
    tracing::debug!(
        program = %program,
        args = ?cmd.get_args().collect::<Vec<_>>(),
        "running command"
    );
    let out = cmd
        .stdin(Stdio::null())
        .output()
        .map_err(|source| BackendError::Spawn {
            program: program.clone(),
            source,
        })?;
    Ok(CommandOutput {
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
    })
}

/// Run to completion; a non-zero exit is an error.
pub fn run(cmd: &mut Command) -> Result<CommandOutput, BackendError> {
    let program = program_name(cmd);
    let out = output(cmd)?;
    if out.success() {
        Ok(out)
    } else {
        Err(BackendError::CommandFailed {
            program,
            code: out.code,
            stderr: out.stderr,
        })
    }
}
