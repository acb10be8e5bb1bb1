//! Module graph resolution and canonical aliasing.
//!
//! Walks the import graph breadth-first from the root module, loading each
//! imported file relative to its importer's directory. Every alias gets a
//! `ModuleEnv`; two aliases bound to the same source with the same resolved
//! vars share an env hash, and the first one seen becomes canonical.

use super::error::{ResolutionError, Result};
use super::hasher;
use super::parser;
use super::types::*;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

/// Parsed modules memoized across one compile.
///
/// Keyed by alias (to avoid re-reading) and by source hash (so one file
/// imported under several aliases is parsed once).
#[derive(Debug, Default)]
pub struct ModuleCache {
    alias_to_source_hash: FxHashMap<String, String>,
    by_source_hash: FxHashMap<String, Module>,
}

impl ModuleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct module sources loaded.
    pub fn len(&self) -> usize {
        self.by_source_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_source_hash.is_empty()
    }

    /// Load (or recall) the module for `alias` from `path`.
    fn load(&mut self, alias: &str, path: &Path) -> Result<(String, Module)> {
        if let Some(hash) = self.alias_to_source_hash.get(alias) {
            if let Some(module) = self.by_source_hash.get(hash) {
                return Ok((hash.clone(), module.clone()));
            }
        }
        let bytes = std::fs::read(path).map_err(|source| {
            super::error::ParseError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        let source_hash = hasher::hash_bytes(&bytes);
        let module = match self.by_source_hash.get(&source_hash) {
            Some(m) => {
                tracing::trace!(alias, hash = %source_hash, "module source already parsed");
                let mut m = m.clone();
                m.source_path = Some(path.to_path_buf());
                m
            }
            None => {
                tracing::debug!(alias, path = %path.display(), "loading module");
                let module = parser::parse_file(path)?;
                self.by_source_hash
                    .insert(source_hash.clone(), module.clone());
                module
            }
        };
        self.alias_to_source_hash
            .insert(alias.to_string(), source_hash.clone());
        Ok((source_hash, module))
    }
}

/// One module instance in the flattened environment.
#[derive(Debug, Clone)]
pub struct ModuleEnv {
    /// `""` for the root, otherwise the import alias
    pub alias: String,
    pub module: Module,
    /// Directory relative paths (imports, `shell`, `include_file`) resolve against
    pub source_dir: PathBuf,
    pub source_hash: String,
    pub env_hash: String,
    /// Alias of the importing module (`None` for the root)
    pub parent: Option<String>,
    /// Parent's vars overlaid with the module's own (unrendered)
    pub vars: IndexMap<String, serde_yaml_ng::Value>,
    /// Task name → canonical FQN
    pub tasks: IndexMap<String, String>,
}

/// Flattened import graph for one compile.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Alias → module instance, in BFS order
    pub envs: IndexMap<String, ModuleEnv>,
    alias_to_env_hash: FxHashMap<String, String>,
    env_hash_to_alias: FxHashMap<String, String>,
}

impl Environment {
    pub fn get(&self, alias: &str) -> Option<&ModuleEnv> {
        self.envs.get(alias)
    }

    /// First alias registered for the same env hash as `alias`.
    pub fn canonical_alias<'a>(&'a self, alias: &'a str) -> &'a str {
        self.alias_to_env_hash
            .get(alias)
            .and_then(|h| self.env_hash_to_alias.get(h))
            .map(String::as_str)
            .unwrap_or(alias)
    }

    /// Function name for `task` under `alias`: bare at the root, otherwise
    /// `canonical_alias:task`.
    pub fn canonical_fqn(&self, alias: &str, task: &str) -> String {
        fqn(self.canonical_alias(alias), task)
    }

    /// Root module instance.
    pub fn root(&self) -> Option<&ModuleEnv> {
        self.envs.get("")
    }

    /// Whether `name` is the canonical FQN of some loaded task.
    pub fn is_known_fqn(&self, name: &str) -> bool {
        match name.split_once(':') {
            Some((alias, task)) => self
                .envs
                .get(alias)
                .is_some_and(|e| e.module.tasks.contains_key(task) && self.canonical_alias(alias) == alias),
            None => self.root().is_some_and(|e| e.module.tasks.contains_key(name)),
        }
    }
}

fn fqn(alias: &str, task: &str) -> String {
    if alias.is_empty() {
        task.to_string()
    } else {
        format!("{}:{}", alias, task)
    }
}

/// Resolve the import graph of `root`.
///
/// `root_dir` is the root module's source directory. Aliases form one global
/// namespace: an alias already loaded elsewhere in the graph is not reloaded.
pub fn resolve(root: &Module, root_dir: &Path, cache: &mut ModuleCache) -> Result<Environment> {
    let mut env = Environment::default();
    let root_hash = hasher::root_hash(&root.name);
    let root_env_hash = hasher::env_hash(&root_hash, &root.vars);
    register(
        &mut env,
        ModuleEnv {
            alias: String::new(),
            module: root.clone(),
            source_dir: root_dir.to_path_buf(),
            source_hash: root_hash,
            env_hash: root_env_hash,
            parent: None,
            vars: root.vars.clone(),
            tasks: IndexMap::new(),
        },
    );

    let mut queue: VecDeque<String> = VecDeque::new();
    queue.push_back(String::new());

    while let Some(parent_alias) = queue.pop_front() {
        let Some(parent) = env.envs.get(&parent_alias) else {
            continue;
        };
        let imports: Vec<ModuleRef> = parent.module.modules.values().cloned().collect();
        let parent_dir = parent.source_dir.clone();
        let parent_vars = parent.vars.clone();

        for mref in imports {
            if env.envs.contains_key(&mref.alias) {
                tracing::trace!(alias = %mref.alias, "alias already loaded");
                continue;
            }
            let path = parent_dir.join(&mref.source);
            if !path.is_file() {
                return Err(ResolutionError::ModuleNotFound {
                    alias: mref.alias.clone(),
                    source_path: mref.source.clone(),
                    resolved: path,
                }
                .into());
            }
            let (source_hash, module) = cache.load(&mref.alias, &path)?;

            let mut vars = parent_vars.clone();
            for (k, v) in &module.vars {
                vars.insert(k.clone(), v.clone());
            }
            let env_hash = hasher::env_hash(&source_hash, &vars);
            let source_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();

            register(
                &mut env,
                ModuleEnv {
                    alias: mref.alias.clone(),
                    module,
                    source_dir,
                    source_hash,
                    env_hash,
                    parent: Some(parent_alias.clone()),
                    vars,
                    tasks: IndexMap::new(),
                },
            );
            queue.push_back(mref.alias);
        }
    }

    // Task refs point at the function that is actually emitted.
    let aliases: Vec<String> = env.envs.keys().cloned().collect();
    for alias in aliases {
        let canonical = env.canonical_alias(&alias).to_string();
        if let Some(menv) = env.envs.get_mut(&alias) {
            menv.tasks = menv
                .module
                .tasks
                .keys()
                .map(|t| (t.clone(), fqn(&canonical, t)))
                .collect();
        }
    }

    Ok(env)
}

fn register(env: &mut Environment, menv: ModuleEnv) {
    if let Some(existing) = env.env_hash_to_alias.get(&menv.env_hash) {
        tracing::debug!(alias = %menv.alias, canonical = %existing, "duplicate module instance");
    } else {
        env.env_hash_to_alias
            .insert(menv.env_hash.clone(), menv.alias.clone());
    }
    env.alias_to_env_hash
        .insert(menv.alias.clone(), menv.env_hash.clone());
    env.envs.insert(menv.alias.clone(), menv);
}
