//! SSH execution layer.
//!
//! Uses the `ssh` binary directly. The script is piped to stdin (not passed
//! as an argument) to avoid argument length limits; only the task name and
//! its arguments travel on the remote command line, single-quoted.

use super::{pipe_script, shell_quote, ExecOutput, TransportError};
use std::process::Command;

/// Expand a leading `~/` against `$HOME`.
fn expand_home(key: &str) -> String {
    match (key.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home, rest),
        _ => key.to_string(),
    }
}

/// Remote command line: `bash -s -- 'arg'...`.
fn remote_command(argv: &[String]) -> String {
    let mut parts = vec!["bash".to_string(), "-s".to_string(), "--".to_string()];
    parts.extend(argv.iter().map(|a| shell_quote(a)));
    parts.join(" ")
}

fn ssh_command(target: &str, identity: Option<&str>, argv: &[String]) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.args(["-o", "BatchMode=yes"])
        .args(["-o", "ConnectTimeout=5"])
        .args(["-o", "StrictHostKeyChecking=accept-new"]);
    if let Some(key) = identity {
        cmd.arg("-i").arg(expand_home(key));
    }
    cmd.arg(target).arg(remote_command(argv));
    cmd
}

/// Run a script on `target` via SSH.
pub fn exec_ssh(
    target: &str,
    identity: Option<&str>,
    script: &str,
    argv: &[String],
) -> Result<ExecOutput, TransportError> {
    pipe_script(ssh_command(target, identity, argv), "ssh", script)
}
