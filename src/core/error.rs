//! Error taxonomy for the compiler pipeline.
//!
//! Every stage has its own enum so callers can tell a malformed document
//! (`ParseError`) from a broken import graph (`ResolutionError`), a bad task
//! definition (`CompileError`) or a failing compile-time side effect
//! (`EvalError`). All of them are fatal: nothing is emitted on error.

use std::path::PathBuf;
use thiserror::Error;

use super::template::TemplateError;
use crate::transport::TransportError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed document or wrong shape for a structural field.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{origin}: YAML parse error: {source}")]
    Yaml {
        origin: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[error("{origin}: document root must be a mapping")]
    NotAMapping { origin: String },

    #[error("{origin}: missing required field 'name'")]
    MissingName { origin: String },

    #[error("{origin}: '{field}' must be {expected}")]
    WrongShape {
        origin: String,
        field: String,
        expected: &'static str,
    },

    #[error("{origin}: module '{alias}' must have a 'source' field")]
    MissingSource { origin: String, alias: String },
}

/// Import graph, preset or task lookup failure.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("module source not found: {source_path} (resolved to {})", resolved.display())]
    ModuleNotFound {
        alias: String,
        source_path: String,
        resolved: PathBuf,
    },

    #[error("include not found: {include} (resolved to {})", resolved.display())]
    IncludeNotFound { include: String, resolved: PathBuf },

    #[error("unknown preset '{name}'")]
    UnknownPreset { name: String },

    #[error("unknown task '{name}' (available: {available})")]
    UnknownTask { name: String, available: String },
}

/// Invalid task definition or template failure, always tied to a task.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("task '{task}': invalid uses reference '{reference}' (expected 'module.task')")]
    InvalidUses { task: String, reference: String },

    #[error("task '{task}': unknown module '{alias}'")]
    UnknownModule { task: String, alias: String },

    #[error("task '{task}': module '{alias}' has no task '{name}'")]
    UnknownTask {
        task: String,
        alias: String,
        name: String,
    },

    #[error("task '{task}': no implementation (missing 'run' or 'uses')")]
    MissingImplementation { task: String },

    #[error("{scope}: {source}")]
    Template {
        scope: String,
        #[source]
        source: TemplateError,
    },
}

/// A compile-time side effect (`shell()`, `include_file()`) failed.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("shell('{command}') could not be spawned: {source}")]
    ShellSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("shell('{command}') exited with {status}: {stderr}")]
    ShellFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("include_file: {} does not exist", path.display())]
    IncludeMissing { path: PathBuf },

    #[error("include_file: {} is a directory", path.display())]
    IncludeIsDirectory { path: PathBuf },

    #[error("include_file: cannot read {}: {source}", path.display())]
    IncludeRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Top-level error for every public entry point.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("{scope}: {source}")]
    Eval {
        scope: String,
        #[source]
        source: EvalError,
    },

    #[error("{} already exists", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("cannot serialize script IR: {0}")]
    Json(#[from] serde_json::Error),

    #[error("cannot write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    /// Wrap a template failure raised while rendering `scope` (a task FQN or
    /// `var <name>`). Compile-time evaluation failures keep their own category.
    pub fn from_template(scope: impl Into<String>, err: TemplateError) -> Self {
        let scope = scope.into();
        match err {
            TemplateError::Eval(source) => Error::Eval { scope, source },
            other => Error::Compile(CompileError::Template {
                scope,
                source: other,
            }),
        }
    }
}
