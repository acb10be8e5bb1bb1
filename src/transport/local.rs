//! Local execution layer.

use super::{pipe_script, ExecOutput, TransportError};
use std::process::Command;

/// Run a script locally via `bash -s -- argv...`.
/// bash, not sh: the runtime header uses associative arrays.
pub fn exec_local(script: &str, argv: &[String]) -> Result<ExecOutput, TransportError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-s").arg("--").args(argv);
    pipe_script(cmd, "bash", script)
}
