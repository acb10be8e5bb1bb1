//! Compiler pipeline: parse → overlay → resolve → compile → render.

pub mod compiler;
pub mod error;
pub mod hasher;
pub mod overlay;
pub mod parser;
pub mod renderer;
pub mod resolver;
pub mod template;
pub mod types;
