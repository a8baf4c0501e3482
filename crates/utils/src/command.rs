//! Helpers intended for [`std::process::Command`] and related structures.

use std::process::{Command, ExitStatus, Output, Stdio};

use anyhow::{Context, Result};

/// Failure of an external tool.
///
/// Every invocation made through [`CommandRunExt`] reports failures with this
/// type as the root cause, so callers can always recover which program failed
/// and how.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// The program could not be started at all.
    #[error("Failed to spawn {program}")]
    Spawn {
        /// Name of the program
        program: String,
        /// The underlying error
        #[source]
        source: std::io::Error,
    },
    /// The program ran and exited unsuccessfully.
    #[error("{program} failed ({status}){}", stderr_suffix(.stderr))]
    Failed {
        /// Name of the program
        program: String,
        /// Exit status of the process
        status: ExitStatus,
        /// Captured standard error, if any
        stderr: String,
    },
}

impl CommandError {
    /// The program this failure refers to.
    pub fn program(&self) -> &str {
        match self {
            CommandError::Spawn { program, .. } | CommandError::Failed { program, .. } => program,
        }
    }

    /// The exit code, if the process ran and exited normally.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Spawn { .. } => None,
            CommandError::Failed { status, .. } => status.code(),
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

fn program_of(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process; stdout is inherited, stderr is captured
    /// and included in the error on failure.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process with all stdio inherited from the parent.
    fn run_inherited(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;
}

/// Turn a finished process into a [`CommandError`] if it failed.
fn check_output(program: String, output: &Output) -> Result<(), CommandError> {
    if output.status.success() {
        return Ok(());
    }
    Err(CommandError::Failed {
        program,
        status: output.status,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let program = program_of(self);
        tracing::trace!("exec: {self:?}");
        let output = self
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;
        check_output(program, &output)?;
        Ok(())
    }

    fn run_inherited(&mut self) -> Result<()> {
        let program = program_of(self);
        tracing::trace!("exec: {self:?}");
        let status = self.status().map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;
        if !status.success() {
            return Err(CommandError::Failed {
                program,
                status,
                stderr: String::new(),
            }
            .into());
        }
        Ok(())
    }

    fn run_get_string(&mut self) -> Result<String> {
        let program = program_of(self);
        tracing::trace!("exec: {self:?}");
        let output = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|source| CommandError::Spawn {
                program: program.clone(),
                source,
            })?;
        check_output(program.clone(), &output)?;
        String::from_utf8(output.stdout).with_context(|| format!("Parsing output of {program}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run_capture_stderr().unwrap();
        Command::new("true").run_inherited().unwrap();
        assert_eq!(
            Command::new("echo").arg("hello").run_get_string().unwrap(),
            "hello\n"
        );
    }

    #[test]
    fn command_failure_carries_program_and_status() {
        let e = Command::new("sh")
            .args(["-c", "echo oops 1>&2; exit 3"])
            .run_capture_stderr()
            .unwrap_err();
        let e = e.downcast_ref::<CommandError>().unwrap();
        assert_eq!(e.program(), "sh");
        assert_eq!(e.exit_code(), Some(3));
        let msg = e.to_string();
        assert!(msg.starts_with("sh failed ("), "{msg}");
        assert!(msg.ends_with(": oops"), "{msg}");
    }

    #[test]
    fn command_spawn_failure() {
        let e = Command::new("/nonexistent/abupdate-test-binary")
            .run_inherited()
            .unwrap_err();
        let e = e.downcast_ref::<CommandError>().unwrap();
        assert!(matches!(e, CommandError::Spawn { .. }));
        assert_eq!(e.exit_code(), None);
    }
}
