//! Docker execution layer: a throwaway container per run.

use super::{pipe_script, ExecOutput, TransportError};
use std::process::Command;

fn docker_command(image: &str, argv: &[String]) -> Command {
    let mut cmd = Command::new("docker");
    cmd.args(["run", "--rm", "-i"])
        .arg(image)
        .args(["bash", "-s", "--"])
        .args(argv);
    cmd
}

/// Run a script in a fresh container of `image`.
pub fn exec_docker(image: &str, script: &str, argv: &[String]) -> Result<ExecOutput, TransportError> {
    pipe_script(docker_command(image, argv), "docker", script)
}
