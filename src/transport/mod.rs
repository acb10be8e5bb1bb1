//! Execution layers: where a compiled script runs.
//!
//! A layer receives the script as an opaque string and pipes it to
//! `bash -s -- <task> <args>` on its target. Layers are a closed enum built
//! from a spec string (`local`, `ssh:user@host[#key]`, `docker:image`)
//! through a registry of constructors.

pub mod docker;
pub mod local;
pub mod ssh;

use std::fmt;
use std::io::Write;
use std::process::{Command, Stdio};
use std::str::FromStr;
use thiserror::Error;

/// Layer construction or process plumbing failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown layer '{spec}' (known: {known})")]
    UnknownLayer { spec: String, known: String },

    #[error("layer '{layer}' needs {expected}")]
    MissingArgument {
        layer: &'static str,
        expected: &'static str,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Output from executing a script on a target.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Where a script runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layer {
    Local,
    Ssh {
        /// `user@host` or a host alias from ssh config
        target: String,
        /// Private key path (`~/` is expanded)
        identity: Option<String>,
    },
    Docker {
        image: String,
    },
}

type LayerCtor = fn(Option<&str>) -> Result<Layer, TransportError>;

/// Discriminator → constructor.
const LAYERS: &[(&str, LayerCtor)] = &[
    ("local", local_layer),
    ("ssh", ssh_layer),
    ("docker", docker_layer),
];

fn local_layer(_arg: Option<&str>) -> Result<Layer, TransportError> {
    Ok(Layer::Local)
}

fn ssh_layer(arg: Option<&str>) -> Result<Layer, TransportError> {
    let arg = arg
        .filter(|a| !a.is_empty())
        .ok_or(TransportError::MissingArgument {
            layer: "ssh",
            expected: "a target (ssh:user@host[#key])",
        })?;
    let (target, identity) = match arg.split_once('#') {
        Some((t, key)) if !key.is_empty() => (t, Some(key.to_string())),
        Some((t, _)) => (t, None),
        None => (arg, None),
    };
    if target.is_empty() {
        return Err(TransportError::MissingArgument {
            layer: "ssh",
            expected: "a target (ssh:user@host[#key])",
        });
    }
    Ok(Layer::Ssh {
        target: target.to_string(),
        identity,
    })
}

fn docker_layer(arg: Option<&str>) -> Result<Layer, TransportError> {
    let image = arg
        .filter(|a| !a.is_empty())
        .ok_or(TransportError::MissingArgument {
            layer: "docker",
            expected: "an image (docker:<image>)",
        })?;
    Ok(Layer::Docker {
        image: image.to_string(),
    })
}

impl Layer {
    /// Build a layer from `kind[:argument]`.
    pub fn from_spec(spec: &str) -> Result<Self, TransportError> {
        let (kind, arg) = match spec.split_once(':') {
            Some((k, a)) => (k, Some(a)),
            None => (spec, None),
        };
        let (_, ctor) = LAYERS
            .iter()
            .find(|(name, _)| *name == kind)
            .ok_or_else(|| TransportError::UnknownLayer {
                spec: spec.to_string(),
                known: LAYERS
                    .iter()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
                    .join(", "),
            })?;
        ctor(arg)
    }
}

impl FromStr for Layer {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Layer::from_spec(s)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::Local => write!(f, "local"),
            Layer::Ssh {
                target,
                identity: Some(key),
            } => write!(f, "ssh:{}#{}", target, key),
            Layer::Ssh { target, .. } => write!(f, "ssh:{}", target),
            Layer::Docker { image } => write!(f, "docker:{}", image),
        }
    }
}

/// Execute `script` on `layer`, passing `argv` (task name and arguments).
pub fn exec_script(layer: &Layer, script: &str, argv: &[String]) -> Result<ExecOutput, TransportError> {
    tracing::debug!(layer = %layer, argv = ?argv, "executing script");
    match layer {
        Layer::Local => local::exec_local(script, argv),
        Layer::Ssh { target, identity } => ssh::exec_ssh(target, identity.as_deref(), script, argv),
        Layer::Docker { image } => docker::exec_docker(image, script, argv),
    }
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Spawn `cmd`, write `script` to its stdin and collect its output.
///
/// Stdin is fed from a scoped thread while stdout/stderr drain, so neither
/// side can fill a pipe and stall the other.
fn pipe_script(mut cmd: Command, program: &str, script: &str) -> Result<ExecOutput, TransportError> {
    let io_err = |source| TransportError::Io {
        program: program.to_string(),
        source,
    };
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| TransportError::Spawn {
            program: program.to_string(),
            source,
        })?;

    let stdin = child.stdin.take();
    let (written, output) = std::thread::scope(|s| {
        let writer = s.spawn(move || -> std::io::Result<()> {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(script.as_bytes()) {
                    // the script exited before reading all of its input
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
            // dropping stdin closes it so `bash -s` sees end of input
            Ok(())
        });
        let output = child.wait_with_output();
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
        (written, output)
    });
    written.map_err(io_err)?;
    let output = output.map_err(io_err)?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}
