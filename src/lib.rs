//! qwl: a YAML task-graph to bash compiler.
//!
//! A task document declares variables, tasks and imported modules. The
//! pipeline parses it, resolves the module graph, renders task templates
//! and emits one self-contained bash script with a dependency-ordered
//! runtime header.

pub mod cli;
pub mod core;
pub mod transport;
