//! External command execution
//!
//! Every collaborator shells out to an admin tool (`dmsetup`, `tgtadm`,
//! `iscsiadm`, ...). They all go through [`CommandRunner`] so the optional
//! root helper is applied in one place.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DriverError, DriverResult};

/// Runs admin tools, optionally through a root helper such as `sudo`
#[derive(Clone, Debug, Default)]
pub struct CommandRunner {
    root_helper: Option<String>,
}

impl CommandRunner {
    pub fn new(root_helper: Option<String>) -> Self {
        Self {
            root_helper: root_helper.filter(|h| !h.trim().is_empty()),
        }
    }

    /// Run a command and capture stdout. Fails if the exit code is non-zero.
    pub async fn run(&self, program: &str, args: &[&str]) -> DriverResult<String> {
        self.run_allowing(program, args, &[]).await
    }

    /// Run a command, additionally treating `ok_codes` as success.
    ///
    /// Used for tools that report "already done" through a dedicated exit
    /// code (e.g. `iscsiadm` login on an existing session).
    pub async fn run_allowing(
        &self,
        program: &str,
        args: &[&str],
        ok_codes: &[i32],
    ) -> DriverResult<String> {
        let (mut command, cmdline) = self.command(program, args);
        debug!(command = %cmdline, "executing");

        let output = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| DriverError::Spawn {
                command: cmdline.clone(),
                source,
            })?;

        check_status(&cmdline, &output, ok_codes)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a command with `input` written to its stdin.
    pub async fn run_with_stdin(
        &self,
        program: &str,
        args: &[&str],
        input: &str,
    ) -> DriverResult<String> {
        let (mut command, cmdline) = self.command(program, args);
        debug!(command = %cmdline, "executing with stdin");

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| DriverError::Spawn {
                command: cmdline.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await?;
            // Dropping stdin closes the pipe so the tool sees EOF.
        }

        let output = child.wait_with_output().await?;
        check_status(&cmdline, &output, &[])?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn command(&self, program: &str, args: &[&str]) -> (Command, String) {
        let mut cmdline = String::new();
        let mut command = match &self.root_helper {
            Some(helper) => {
                let mut parts = helper.split_whitespace();
                // `new` filters out blank helpers, so there is always a first word.
                let first = parts.next().unwrap_or(program);
                let mut command = Command::new(first);
                cmdline.push_str(helper.trim());
                cmdline.push(' ');
                command.args(parts);
                command.arg(program);
                command
            }
            None => Command::new(program),
        };
        command.args(args);
        cmdline.push_str(program);
        for arg in args {
            cmdline.push(' ');
            cmdline.push_str(arg);
        }
        (command, cmdline)
    }
}

fn check_status(
    cmdline: &str,
    output: &std::process::Output,
    ok_codes: &[i32],
) -> DriverResult<()> {
    if output.status.success() {
        return Ok(());
    }
    let code = output.status.code().unwrap_or(-1);
    if ok_codes.contains(&code) {
        debug!(command = %cmdline, code, "tolerated exit code");
        return Ok(());
    }
    Err(DriverError::CommandFailed {
        command: cmdline.to_string(),
        code,
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}
