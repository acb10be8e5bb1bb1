//! Module AST and bash IR types.
//!
//! The AST side mirrors the YAML document (modules, tasks, presets); the IR
//! side (`BashFunction`, `BashScript`) is what the compiler hands to the
//! renderer. Maps are `IndexMap`s because declaration order is observable:
//! it seeds the BFS, drives incremental var resolution and orders `help`.

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ============================================================================
// Module AST
// ============================================================================

/// A parsed task document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    /// Module name (required)
    pub name: String,

    /// Module-level variables (templatable)
    pub vars: IndexMap<String, serde_yaml_ng::Value>,

    /// Task declarations (order-preserving)
    pub tasks: IndexMap<String, Task>,

    /// Imports: alias used in templates → source file
    pub modules: IndexMap<String, ModuleRef>,

    /// Files merged underneath this module before compilation
    pub includes: Vec<String>,

    /// Named overlays
    pub presets: IndexMap<String, Preset>,

    /// Presets applied when none are requested explicitly
    pub defaults: Vec<String>,

    /// File this module was parsed from, if any
    pub source_path: Option<PathBuf>,
}

impl Module {
    /// Directory that relative paths in this module resolve against.
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_path.as_deref().and_then(Path::parent)
    }
}

/// Reference to an external module to import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    pub alias: String,
    /// Path relative to the importing module's directory
    pub source: String,
}

/// A single task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub name: String,

    /// Template text (a YAML list is joined with newlines at parse time)
    pub run: Option<String>,

    /// `module.task` reference to inline
    pub uses: Option<String>,

    /// Arguments for `uses`
    pub with: Vec<WithItem>,

    /// Task-local variables
    pub vars: IndexMap<String, serde_yaml_ng::Value>,

    /// Environment exported for the duration of the task
    pub env: IndexMap<String, String>,

    /// One-line description shown by `help`
    pub desc: Option<String>,
}

impl Task {
    /// A task is complete once it has something to execute.
    pub fn has_implementation(&self) -> bool {
        self.run.is_some() || self.uses.is_some()
    }
}

/// One entry of a task's `with` list, classified once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum WithItem {
    /// `{run: ...}`: rendered as its own template and emitted as a line
    Run(String),
    /// bare string, emitted as `<function> <item>`
    Positional(String),
    /// anything else
    Raw(serde_yaml_ng::Value),
}

/// Overlay shape shared by presets and include files.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preset {
    pub name: Option<String>,
    pub vars: IndexMap<String, serde_yaml_ng::Value>,
    pub tasks: IndexMap<String, Task>,
    pub modules: IndexMap<String, ModuleRef>,
    pub includes: Vec<String>,
    pub source_path: Option<PathBuf>,
}

impl Preset {
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_path.as_deref().and_then(Path::parent)
    }
}

// ============================================================================
// Bash IR
// ============================================================================

/// Shebang plus strict unset-variable handling.
pub const DEFAULT_PREAMBLE: &str = "#!/usr/bin/env bash\n\nset -u";

/// Dispatch to the requested task, or `help` when none is given.
pub const DEFAULT_ENTRYPOINT: &str = r#"if [ $# -eq 0 ]; then help; else "$@"; fi"#;

/// Runtime helpers injected into every script.
///
/// `module:include` prints the definitions of the named functions and their
/// transitive dependencies so they can be shipped across a remote boundary.
pub const MODULE_HEADER: &str = r#"module:register_dependency () {
  declare -gA MODULE_DEPENDENCIES
  MODULE_DEPENDENCIES["$1"]="${2:-}"
}
module:register_dependency "module:register_dependency" ""

module:collect_dependencies () {
  local name="$1"
  local deps="${MODULE_DEPENDENCIES[$name]:-}"
  local result=()
  local dep
  for dep in $deps; do
    result+=($(module:collect_dependencies "$dep"))
    result+=("$dep")
  done
  local -A seen=()
  local unique=()
  local item
  for item in ${result[@]+"${result[@]}"}; do
    if [[ -z "${seen[$item]+x}" ]]; then
      seen[$item]=1
      unique+=("$item")
    fi
  done
  echo ${unique[@]+"${unique[@]}"}
}
module:register_dependency "module:collect_dependencies" ""

module:include () {
  local -A seen=()
  local unique=()
  local name item
  for name in "$@"; do
    for item in $(module:collect_dependencies "$name") "$name"; do
      if [[ -z "${seen[$item]+x}" ]]; then
        seen[$item]=1
        unique+=("$item")
      fi
    done
  done
  declare -f module:register_dependency module:collect_dependencies module:include ${unique[@]+"${unique[@]}"}
  local fn
  for fn in ${unique[@]+"${unique[@]}"}; do
    echo "module:register_dependency \"$fn\" \"${MODULE_DEPENDENCIES[$fn]:-}\""
  done
}
module:register_dependency "module:include" "module:register_dependency module:collect_dependencies""#;

/// A single bash function definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BashFunction {
    /// Canonical name, e.g. `log:debug` or bare `greet` at root
    pub name: String,

    /// Rendered function body
    pub body: String,

    /// Canonical names referenced by the body (sorted)
    pub dependencies: Vec<String>,
}

/// Complete bash script IR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BashScript {
    pub preamble: String,
    pub header: String,
    pub functions: Vec<BashFunction>,

    /// Root task names, for `help`
    pub available_tasks: Vec<String>,

    /// Dropped duplicate → the function emitted in its place
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub stand_ins: BTreeMap<String, String>,

    pub entrypoint: String,
}

impl BashScript {
    /// Script with the default preamble, runtime header and entrypoint.
    pub fn new(functions: Vec<BashFunction>, available_tasks: Vec<String>) -> Self {
        Self {
            preamble: DEFAULT_PREAMBLE.to_string(),
            header: MODULE_HEADER.to_string(),
            functions,
            available_tasks,
            stand_ins: BTreeMap::new(),
            entrypoint: DEFAULT_ENTRYPOINT.to_string(),
        }
    }

    /// Look up a compiled function by canonical name.
    pub fn function(&self, name: &str) -> Option<&BashFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Function that runs root task `name` (or `help`), following stand-ins.
    pub fn entry_function(&self, name: &str) -> Option<&BashFunction> {
        if name != "help" && !self.available_tasks.iter().any(|t| t == name) {
            return None;
        }
        let target = self.stand_ins.get(name).map_or(name, String::as_str);
        self.function(target)
    }
}

// ============================================================================
// Template helper
// ============================================================================

/// Convert a YAML value to the text a template substitutes for it.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        serde_yaml_ng::Value::Tagged(tagged) => yaml_value_to_string(&tagged.value),
        other => serde_json::to_string(other).unwrap_or_else(|_| format!("{:?}", other)),
    }
}

// ============================================================================
// Tests
// ============================================================================
