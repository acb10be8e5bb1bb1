//! Reachability compiler: effective module → `BashScript` IR.
//!
//! Pipeline: merge includes/presets, resolve the import graph, render every
//! environment's vars (parents first), then walk tasks breadth-first from
//! the root. Only tasks reachable from a root task are compiled, and a task
//! whose rendered body matches an earlier one is dropped in its favor.

use super::error::{CompileError, Error, Result};
use super::hasher;
use super::overlay;
use super::parser;
use super::resolver::{self, Environment, ModuleCache, ModuleEnv};
use super::template::{self, RenderEnv};
use super::types::*;
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// `{{ alias.task }}` or `{{ task }}` in unrendered template text.
static DEP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{-?\s*([A-Za-z_][A-Za-z0-9_-]*)(?:\.([A-Za-z_][A-Za-z0-9_-]*))?\s*-?\}\}")
        .expect("dependency pattern")
});

const HELP_FUNCTION: &str = "help";

/// Knobs for library callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompileOptions<'a> {
    /// Directory includes and imports of the root resolve against. Defaults
    /// to the root module's source directory, then the current directory.
    pub base_dir: Option<&'a Path>,

    /// Presets to apply; `None` selects the module's `defaults`.
    pub presets: Option<&'a [String]>,
}

/// Compile a module into a script IR. Nothing is returned on error.
pub fn compile(module: &Module, opts: &CompileOptions<'_>) -> Result<BashScript> {
    let base_dir = match opts.base_dir {
        Some(dir) => dir.to_path_buf(),
        None => match module.source_dir() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        },
    };

    let effective = overlay::effective_module(module, &base_dir, opts.presets)?;
    let mut cache = ModuleCache::new();
    let env = resolver::resolve(&effective, &base_dir, &mut cache)?;
    tracing::debug!(
        module = %effective.name,
        instances = env.envs.len(),
        sources = cache.len(),
        "module graph resolved"
    );

    let compiler = Compiler::new(&env)?;
    compiler.compile_reachable(&effective)
}

/// Parse `path` and compile it with its directory as base.
pub fn compile_file(path: &Path, presets: Option<&[String]>) -> Result<BashScript> {
    let module = parser::parse_file(path)?;
    compile(
        &module,
        &CompileOptions {
            base_dir: None,
            presets,
        },
    )
}

struct Compiler<'e> {
    env: &'e Environment,
    /// Canonical FQNs of every loaded task
    known: HashSet<String>,
    /// Alias → rendered vars (inherited plus own)
    vars: HashMap<String, Mapping>,
}

impl<'e> Compiler<'e> {
    fn new(env: &'e Environment) -> Result<Self> {
        let known = env
            .envs
            .values()
            .flat_map(|e| e.tasks.values().cloned())
            .collect();
        let mut compiler = Self {
            env,
            known,
            vars: HashMap::new(),
        };
        compiler.resolve_vars()?;
        Ok(compiler)
    }

    // ------------------------------------------------------------------------
    // Scopes and vars
    // ------------------------------------------------------------------------

    /// Module metadata and task refs for `menv`, plus its imports' task refs.
    fn shallow_scope(&self, menv: &ModuleEnv) -> Mapping {
        let mut scope = Mapping::new();
        self.insert_metadata(&mut scope, menv);
        for alias in menv.module.modules.keys() {
            if let Some(import) = self.env.get(alias) {
                let mut inner = Mapping::new();
                self.insert_metadata(&mut inner, import);
                scope.insert(Value::String(alias.clone()), Value::Mapping(inner));
            }
        }
        scope
    }

    fn insert_metadata(&self, scope: &mut Mapping, menv: &ModuleEnv) {
        scope.insert(
            Value::String("module_name".into()),
            Value::String(menv.module.name.clone()),
        );
        scope.insert(
            Value::String("__srcdir__".into()),
            Value::String(menv.source_dir.display().to_string()),
        );
        for (task, fqn) in &menv.tasks {
            scope.insert(Value::String(task.clone()), Value::String(fqn.clone()));
        }
    }

    /// Full template scope for an alias: rendered vars, metadata, task refs
    /// and nested scopes of its imports.
    fn scope(&self, alias: &str, stack: &mut Vec<String>) -> Mapping {
        let mut scope = self.vars.get(alias).cloned().unwrap_or_default();
        let Some(menv) = self.env.get(alias) else {
            return scope;
        };
        self.insert_metadata(&mut scope, menv);
        stack.push(alias.to_string());
        for import in menv.module.modules.keys() {
            if stack.iter().any(|a| a == import) || self.env.get(import).is_none() {
                continue;
            }
            let inner = self.scope(import, stack);
            scope.insert(Value::String(import.clone()), Value::Mapping(inner));
        }
        stack.pop();
        scope
    }

    /// Render module-level vars for every environment, parents first.
    fn resolve_vars(&mut self) -> Result<()> {
        let env = self.env;
        for (alias, menv) in &env.envs {
            let mut resolved = menv
                .parent
                .as_ref()
                .and_then(|p| self.vars.get(p))
                .cloned()
                .unwrap_or_default();
            let shallow = self.shallow_scope(menv);
            let mut renv = RenderEnv::new(&menv.source_dir, &self.known);

            for (name, raw) in &menv.module.vars {
                let mut ctx = resolved.clone();
                for (k, v) in &shallow {
                    ctx.insert(k.clone(), v.clone());
                }
                let scope = if alias.is_empty() {
                    format!("var {}", name)
                } else {
                    format!("var {}.{}", alias, name)
                };
                let value = render_value(raw, &ctx, &mut renv)
                    .map_err(|e| Error::from_template(scope, e))?;
                resolved.insert(Value::String(name.clone()), value);
            }
            tracing::trace!(alias = %alias, count = resolved.len(), "vars resolved");
            self.vars.insert(alias.clone(), resolved);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // BFS
    // ------------------------------------------------------------------------

    fn compile_reachable(&self, root: &Module) -> Result<BashScript> {
        let mut queue: VecDeque<(String, String)> = root
            .tasks
            .keys()
            .map(|t| (String::new(), t.clone()))
            .collect();
        let mut visited: HashSet<String> = HashSet::new();
        let mut functions: Vec<BashFunction> = Vec::new();
        let mut by_body_hash: HashMap<String, String> = HashMap::new();
        let mut stand_in: HashMap<String, String> = HashMap::new();

        while let Some((alias, task_name)) = queue.pop_front() {
            let fqn = self.env.canonical_fqn(&alias, &task_name);
            if !visited.insert(fqn.clone()) {
                continue;
            }
            let canonical = self.env.canonical_alias(&alias).to_string();
            let Some(menv) = self.env.get(&canonical) else {
                continue;
            };
            let Some(task) = menv.module.tasks.get(&task_name) else {
                continue;
            };
            tracing::debug!(task = %fqn, "compiling");

            let mut deps: BTreeSet<String> = BTreeSet::new();
            for (dep_alias, dep_task) in self.static_dependencies(&fqn, menv, task)? {
                let dep_fqn = self.env.canonical_fqn(&dep_alias, &dep_task);
                if !visited.contains(&dep_fqn) {
                    queue.push_back((dep_alias, dep_task));
                }
                deps.insert(dep_fqn);
            }

            let (body, qx_deps) = self.compile_task(&fqn, &canonical, menv, task)?;

            let mut found = template::find_task_refs(&body, &self.known);
            found.extend(qx_deps);
            for name in found {
                if let Some((a, t)) = name.split_once(':') {
                    if !visited.contains(&name) {
                        queue.push_back((a.to_string(), t.to_string()));
                    }
                }
                deps.insert(name);
            }
            deps.remove(&fqn);

            let body_hash = hasher::hash_string(&body);
            if let Some(existing) = by_body_hash.get(&body_hash) {
                tracing::debug!(task = %fqn, stands_in = %existing, "identical body, dropping");
                stand_in.insert(fqn, existing.clone());
                continue;
            }
            by_body_hash.insert(body_hash, fqn.clone());
            functions.push(BashFunction {
                name: fqn,
                body,
                dependencies: deps.into_iter().collect(),
            });
        }

        for f in &mut functions {
            let remapped: BTreeSet<String> = f
                .dependencies
                .iter()
                .map(|d| stand_in.get(d).cloned().unwrap_or_else(|| d.clone()))
                .filter(|d| *d != f.name)
                .collect();
            f.dependencies = remapped.into_iter().collect();
            if !stand_in.is_empty() {
                f.body = replace_task_names(&f.body, &stand_in);
            }
        }

        let available: Vec<String> = root.tasks.keys().cloned().collect();
        if root.tasks.contains_key(HELP_FUNCTION) {
            tracing::warn!("root task 'help' replaces the generated help");
        } else {
            functions.push(help_function(root));
        }
        let mut script = BashScript::new(functions, available);
        script.stand_ins = stand_in.into_iter().collect();
        Ok(script)
    }

    /// Dependencies visible before rendering: the `uses` target, plus
    /// `{{ alias.task }}` / `{{ task }}` references in template text.
    fn static_dependencies(
        &self,
        fqn: &str,
        menv: &ModuleEnv,
        task: &Task,
    ) -> Result<Vec<(String, String)>> {
        let mut deps = Vec::new();
        let texts: Vec<&str> = match &task.uses {
            Some(reference) => {
                deps.push(self.resolve_uses(fqn, menv, reference)?);
                task.with
                    .iter()
                    .filter_map(|item| match item {
                        WithItem::Run(text) => Some(text.as_str()),
                        _ => None,
                    })
                    .collect()
            }
            None => task.run.as_deref().into_iter().collect(),
        };
        for text in texts {
            for cap in DEP_RE.captures_iter(text) {
                let first = &cap[1];
                match cap.get(2) {
                    Some(second) => {
                        let imported = menv.module.modules.contains_key(first);
                        let exists = self
                            .env
                            .get(first)
                            .is_some_and(|e| e.module.tasks.contains_key(second.as_str()));
                        if imported && exists {
                            deps.push((first.to_string(), second.as_str().to_string()));
                        }
                    }
                    None => {
                        if menv.module.tasks.contains_key(first) {
                            deps.push((menv.alias.clone(), first.to_string()));
                        }
                    }
                }
            }
        }
        Ok(deps)
    }

    /// `module.task` (alias imported here) or `module:task` (alias loaded
    /// anywhere) → (alias, task).
    fn resolve_uses(
        &self,
        fqn: &str,
        menv: &ModuleEnv,
        reference: &str,
    ) -> Result<(String, String)> {
        let invalid = || CompileError::InvalidUses {
            task: fqn.to_string(),
            reference: reference.to_string(),
        };
        let (alias, name, imported_only) = if let Some((a, t)) = reference.split_once('.') {
            (a, t, true)
        } else if let Some((a, t)) = reference.split_once(':') {
            (a, t, false)
        } else {
            return Err(invalid().into());
        };
        if alias.is_empty() || name.is_empty() {
            return Err(invalid().into());
        }
        let target = if imported_only && !menv.module.modules.contains_key(alias) {
            None
        } else {
            self.env.get(alias)
        };
        let Some(target) = target else {
            return Err(CompileError::UnknownModule {
                task: fqn.to_string(),
                alias: alias.to_string(),
            }
            .into());
        };
        if !target.module.tasks.contains_key(name) {
            return Err(CompileError::UnknownTask {
                task: fqn.to_string(),
                alias: alias.to_string(),
                name: name.to_string(),
            }
            .into());
        }
        Ok((alias.to_string(), name.to_string()))
    }

    // ------------------------------------------------------------------------
    // Per-task rendering
    // ------------------------------------------------------------------------

    /// Render one task body. Returns the body and the names found in its
    /// `qx` blocks.
    fn compile_task(
        &self,
        fqn: &str,
        alias: &str,
        menv: &ModuleEnv,
        task: &Task,
    ) -> Result<(String, BTreeSet<String>)> {
        let mut ctx = self.scope(alias, &mut Vec::new());
        let mut renv = RenderEnv::new(&menv.source_dir, &self.known);
        let wrap = |e| Error::from_template(fqn, e);

        for (name, raw) in &task.vars {
            let value = render_value(raw, &ctx, &mut renv).map_err(wrap)?;
            ctx.insert(Value::String(name.clone()), value);
        }

        let mut lines: Vec<String> = Vec::new();
        for (key, raw) in &task.env {
            let value = template::render(raw, &ctx, &mut renv).map_err(wrap)?;
            lines.push(format!("local -x {}=\"{}\"", key, escape_quotes(&value)));
        }

        match (&task.uses, &task.run) {
            (Some(reference), _) => {
                let (target_alias, target_task) = self.resolve_uses(fqn, menv, reference)?;
                let callee = self.env.canonical_fqn(&target_alias, &target_task);
                if task.with.is_empty() {
                    lines.push(callee.clone());
                }
                for item in &task.with {
                    match item {
                        WithItem::Run(text) => {
                            lines.push(template::render(text, &ctx, &mut renv).map_err(wrap)?);
                        }
                        WithItem::Positional(arg) => {
                            let arg = template::render(arg, &ctx, &mut renv).map_err(wrap)?;
                            lines.push(format!("{} {}", callee, arg));
                        }
                        WithItem::Raw(Value::Mapping(_)) => {
                            tracing::warn!(task = %fqn, "ignoring 'with' mapping without 'run'");
                        }
                        WithItem::Raw(other) => {
                            let text = yaml_value_to_string(other);
                            lines.push(template::render(&text, &ctx, &mut renv).map_err(wrap)?);
                        }
                    }
                }
            }
            (None, Some(run)) => {
                lines.push(template::render(run, &ctx, &mut renv).map_err(wrap)?);
            }
            (None, None) => {
                return Err(CompileError::MissingImplementation {
                    task: fqn.to_string(),
                }
                .into())
            }
        }

        Ok((lines.join("\n"), renv.qx_deps))
    }
}

/// Render string leaves of a var value.
fn render_value(
    value: &Value,
    ctx: &Mapping,
    renv: &mut RenderEnv<'_>,
) -> std::result::Result<Value, template::TemplateError> {
    match value {
        Value::String(s) => Ok(Value::String(template::render(s, ctx, renv)?)),
        Value::Sequence(items) => Ok(Value::Sequence(
            items
                .iter()
                .map(|v| render_value(v, ctx, renv))
                .collect::<std::result::Result<_, _>>()?,
        )),
        Value::Mapping(m) => {
            let mut out = Mapping::new();
            for (k, v) in m {
                out.insert(k.clone(), render_value(v, ctx, renv)?);
            }
            Ok(Value::Mapping(out))
        }
        other => Ok(other.clone()),
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':')
}

/// Replace whole-word function names in `body` through `map`. Words that
/// are parameter expansions, path parts or assignments are left alone.
fn replace_task_names(body: &str, map: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(body.len());
    let mut prev: Option<char> = None;
    let mut chars = body.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if !is_name_char(c) {
            out.push(c);
            prev = Some(c);
            continue;
        }
        let mut end = start + c.len_utf8();
        while let Some(&(i, n)) = chars.peek() {
            if !is_name_char(n) {
                break;
            }
            end = i + n.len_utf8();
            chars.next();
        }
        let word = &body[start..end];
        let next = body[end..].chars().next();
        let bare = !matches!(prev, Some('$' | '{' | '.' | '/'))
            && !matches!(next, Some('.' | '=' | '/'));
        match map.get(word) {
            Some(survivor) if bare => out.push_str(survivor),
            _ => out.push_str(word),
        }
        prev = word.chars().last();
    }
    out
}

/// Escape for a double-quoted string that still expands `$VAR`.
fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Escape for a double-quoted string taken literally.
fn escape_double_quoted(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn help_function(root: &Module) -> BashFunction {
    let mut lines = vec![
        r#"echo "Usage: $0 [task]""#.to_string(),
        r#"echo """#.to_string(),
        r#"echo "Tasks:""#.to_string(),
    ];
    for (name, task) in &root.tasks {
        match &task.desc {
            Some(desc) => lines.push(format!(
                "echo \"  {} - {}\"",
                escape_double_quoted(name),
                escape_double_quoted(desc)
            )),
            None => lines.push(format!("echo \"  {}\"", escape_double_quoted(name))),
        }
    }
    BashFunction {
        name: HELP_FUNCTION.to_string(),
        body: lines.join("\n"),
        dependencies: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::{EvalError, ResolutionError};
    use crate::core::renderer;
    use crate::transport::local::exec_local;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn compile_str(yaml: &str) -> Result<BashScript> {
        let module = parser::parse(yaml).unwrap();
        let dir = std::env::temp_dir();
        compile(
            &module,
            &CompileOptions {
                base_dir: Some(dir.as_path()),
                presets: None,
            },
        )
    }

    fn compile_in(dir: &Path, yaml: &str) -> Result<BashScript> {
        write(dir, "qwl.yaml", yaml);
        compile_file(&dir.join("qwl.yaml"), None)
    }

    fn names(script: &BashScript) -> Vec<&str> {
        script.functions.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_compile_simple_module() {
        let script = compile_str(
            "name: test\nvars:\n  message: hello\ntasks:\n  greet:\n    run: 'echo \"{{ message }}\"'\n",
        )
        .unwrap();
        assert_eq!(names(&script), vec!["greet", "help"]);
        let greet = script.function("greet").unwrap();
        assert!(greet.body.contains(r#"echo "hello""#));
        assert!(!greet.body.contains("{{ message }}"));
        assert!(script.function("help").unwrap().body.contains("greet"));
        assert_eq!(script.available_tasks, vec!["greet"]);
    }

    #[test]
    fn test_identical_bodies_dedup_to_first() {
        let script =
            compile_str("name: t\ntasks:\n  a:\n    run: echo same\n  b:\n    run: echo same\n")
                .unwrap();
        assert_eq!(names(&script), vec!["a", "help"]);
        assert_eq!(script.available_tasks, vec!["a", "b"]);
        assert_eq!(script.stand_ins.get("b").map(String::as_str), Some("a"));
        assert_eq!(script.entry_function("b").unwrap().name, "a");
    }

    #[test]
    fn test_references_to_dropped_duplicate_call_survivor() {
        let script = compile_str(
            "name: t\ntasks:\n  a: echo same\n  b: echo same\n  c: '{{ b }} && echo c'\n",
        )
        .unwrap();
        assert_eq!(names(&script), vec!["a", "c", "help"]);
        let c = script.function("c").unwrap();
        assert_eq!(c.body, "a && echo c");
        assert_eq!(c.dependencies, vec!["a"]);

        let bash = renderer::render(&script);
        let out = exec_local(&bash, &["c".to_string()]).unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert_eq!(out.stdout, "same\nc\n");
        let out = exec_local(&bash, &["b".to_string()]).unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert_eq!(out.stdout, "same\n");
    }

    #[test]
    fn test_replace_task_names_whole_words_only() {
        let map: HashMap<String, String> = [
            ("b".to_string(), "a".to_string()),
            ("log:x".to_string(), "log:y".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(replace_task_names("b && log:x 1", &map), "a && log:y 1");
        let untouched = "$b ${b} b.txt ./b b=1 bb log:xz";
        assert_eq!(replace_task_names(untouched, &map), untouched);
        assert_eq!(
            replace_task_names("$(module:include log:x)\nb", &map),
            "$(module:include log:y)\na"
        );
    }

    #[test]
    fn test_vars_resolve_incrementally() {
        let script = compile_str(
            "name: t\nvars:\n  a: one\n  b: '{{ a }}-two'\n  list: ['{{ b }}', 3]\ntasks:\n  show: echo {{ b }} {{ list.0 }} {{ module_name }}\n",
        )
        .unwrap();
        assert_eq!(
            script.function("show").unwrap().body,
            "echo one-two one-two t"
        );
    }

    #[test]
    fn test_var_referencing_later_var_is_undefined() {
        let err = compile_str("name: t\nvars:\n  a: '{{ b }}'\n  b: x\ntasks:\n  s: echo\n")
            .unwrap_err();
        assert!(err.to_string().contains("var a"));
    }

    #[test]
    fn test_undefined_in_task_names_task() {
        let err = compile_str("name: t\ntasks:\n  s: echo {{ ghost }}\n").unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::Template { .. })));
        assert!(err.to_string().starts_with("s: "));
    }

    #[test]
    fn test_task_vars_and_env() {
        let script = compile_str(
            "name: t\nvars: {who: world}\ntasks:\n  s:\n    vars: {greeting: 'hi {{ who }}'}\n    env: {TARGET: '{{ who }}'}\n    run: echo {{ greeting }}\n",
        )
        .unwrap();
        assert_eq!(
            script.function("s").unwrap().body,
            "local -x TARGET=\"world\"\necho hi world"
        );
    }

    #[test]
    fn test_imported_tasks_are_prefixed_and_reachable_only() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "std/log.yaml",
            "name: log\ntasks:\n  info: echo \"[info] $*\"\n  debug: echo \"[debug] $*\"\n",
        );
        write(dir.path(), "unused.yaml", "name: unused\ntasks:\n  x: echo x\n");
        let script = compile_in(
            dir.path(),
            "name: app\nmodules:\n  log:\n    source: std/log.yaml\ntasks:\n  deploy: '{{ log.info }} deploying'\n",
        )
        .unwrap();
        assert_eq!(names(&script), vec!["deploy", "log:info", "help"]);
        let deploy = script.function("deploy").unwrap();
        assert_eq!(deploy.body, "log:info deploying");
        assert_eq!(deploy.dependencies, vec!["log:info"]);
        assert!(script.function("log:debug").is_none());
    }

    #[test]
    fn test_duplicate_alias_uses_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "log.yaml", "name: log\ntasks:\n  info: echo info\n");
        let script = compile_in(
            dir.path(),
            "name: app\nmodules:\n  log:\n    source: log.yaml\n  logger:\n    source: log.yaml\ntasks:\n  a: '{{ log.info }} a'\n  b: '{{ logger.info }} b'\n",
        )
        .unwrap();
        assert_eq!(names(&script), vec!["a", "b", "log:info", "help"]);
        assert_eq!(script.function("b").unwrap().body, "log:info b");
    }

    #[test]
    fn test_same_module_task_reference_is_dependency() {
        let script = compile_str(
            "name: t\ntasks:\n  all: '{{ build }} && {{ check }}'\n  build: cargo build\n  check: cargo test\n",
        )
        .unwrap();
        let all = script.function("all").unwrap();
        assert_eq!(all.body, "build && check");
        assert_eq!(all.dependencies, vec!["build", "check"]);
    }

    #[test]
    fn test_uses_with_items() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "log.yaml", "name: log\ntasks:\n  info: echo \"$@\"\n");
        let script = compile_in(
            dir.path(),
            "name: app\nvars: {v: '1.0'}\nmodules:\n  log:\n    source: log.yaml\ntasks:\n  notify:\n    uses: log.info\n    with:\n      - 'release {{ v }}'\n      - run: echo done\n      - {level: 2}\n  bare:\n    uses: 'log:info'\n",
        )
        .unwrap();
        assert_eq!(
            script.function("notify").unwrap().body,
            "log:info release 1.0\necho done"
        );
        assert_eq!(script.function("bare").unwrap().body, "log:info");
        assert!(script.function("log:info").is_some());
        assert_eq!(
            script.function("notify").unwrap().dependencies,
            vec!["log:info"]
        );
    }

    #[test]
    fn test_uses_errors() {
        let err = compile_str("name: t\ntasks:\n  a:\n    uses: nodots\n").unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::InvalidUses { .. })));

        let err = compile_str("name: t\ntasks:\n  a:\n    uses: ghost.task\n").unwrap_err();
        assert!(matches!(err, Error::Compile(CompileError::UnknownModule { .. })));

        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "log.yaml", "name: log\ntasks:\n  info: echo\n");
        let err = compile_in(
            dir.path(),
            "name: t\nmodules:\n  log:\n    source: log.yaml\ntasks:\n  a:\n    uses: log.nope\n",
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "task 'a': module 'log' has no task 'nope'"
        );
    }

    #[test]
    fn test_missing_implementation() {
        let err = compile_str("name: t\ntasks:\n  later:\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Compile(CompileError::MissingImplementation { ref task }) if task == "later"
        ));
    }

    #[test]
    fn test_preset_completes_task() {
        let module = parser::parse(
            "name: t\ntasks:\n  deploy:\npresets:\n  prod:\n    vars: {target: prod}\n    tasks:\n      deploy: echo {{ target }}\n",
        )
        .unwrap();
        let presets = vec!["prod".to_string()];
        let script = compile(
            &module,
            &CompileOptions {
                base_dir: Some(Path::new(".")),
                presets: Some(presets.as_slice()),
            },
        )
        .unwrap();
        assert_eq!(script.function("deploy").unwrap().body, "echo prod");

        let err = compile(
            &module,
            &CompileOptions {
                base_dir: Some(Path::new(".")),
                presets: Some(&["nope".to_string()][..]),
            },
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnknownPreset { .. })
        ));
    }

    #[test]
    fn test_qx_adds_include_and_dependency() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "log.yaml", "name: log\ntasks:\n  info: echo \"$@\"\n");
        let script = compile_in(
            dir.path(),
            "name: app\nmodules:\n  log:\n    source: log.yaml\ntasks:\n  remote: |\n    ssh host bash <<'EOF'\n    {% qx %}\n    log:info \"x\"\n    {% endqx %}\n    EOF\n",
        )
        .unwrap();
        let remote = script.function("remote").unwrap();
        assert!(remote.body.contains("$(module:include log:info)\n"));
        assert_eq!(remote.dependencies, vec!["log:info"]);
        assert!(script.function("log:info").is_some());
    }

    #[test]
    fn test_runtime_ships_transitive_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "lib/fmt.yaml",
            r#"name: fmt
tasks:
  pad: printf '%s' "$1"
  line: echo "[$({{ pad }} fmt)] $1"
"#,
        );
        write(
            dir.path(),
            "lib/log.yaml",
            r#"name: log
modules:
  fmt:
    source: fmt.yaml
tasks:
  color: printf '*'
  info: '{{ color }}; {{ fmt.line }} "$1"'
"#,
        );
        let script = compile_in(
            dir.path(),
            r#"name: app
modules:
  log:
    source: lib/log.yaml
tasks:
  order: module:collect_dependencies log:info
  ship: |
    bash -s <<EOF
    {% qx %}log:info hi{% endqx %}
    EOF
"#,
        )
        .unwrap();
        assert_eq!(
            script.function("log:info").unwrap().dependencies,
            vec!["fmt:line", "log:color"]
        );
        let bash = renderer::render(&script);

        let out = exec_local(&bash, &["order".to_string()]).unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert_eq!(out.stdout, "fmt:pad fmt:line log:color\n");

        // a fresh bash only has what module:include shipped
        let out = exec_local(&bash, &["ship".to_string()]).unwrap();
        assert!(out.success(), "{}", out.stderr);
        assert_eq!(out.stdout, "*[fmt] hi\n");
    }

    #[test]
    fn test_srcdir_and_include_file() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "data.txt", "Line 1\nLine 2\n");
        let script = compile_in(
            dir.path(),
            "name: t\ntasks:\n  show: |\n    echo \"{{ __srcdir__ }}\"\n    cat <<'HEREDOC'\n    {{ include_file('data.txt', __srcdir__) }}\n    HEREDOC\n",
        )
        .unwrap();
        let body = &script.function("show").unwrap().body;
        assert!(body.contains(&dir.path().display().to_string()));
        assert!(body.contains("Line 1\nLine 2"));
        assert!(!body.contains("include_file"));
    }

    #[test]
    fn test_shell_failure_is_eval_error() {
        let err = compile_str("name: t\ntasks:\n  s: echo {{ shell('exit 1') }}\n").unwrap_err();
        assert!(matches!(
            err,
            Error::Eval {
                source: EvalError::ShellFailed { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_imported_module_sees_inherited_vars() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "lib.yaml",
            "name: lib\nvars: {suffix: '{{ prefix }}-lib'}\ntasks:\n  show: echo {{ suffix }} {{ __srcdir__ }}\n",
        );
        let script = compile_in(
            dir.path(),
            "name: app\nvars: {prefix: app}\nmodules:\n  lib:\n    source: lib.yaml\ntasks:\n  go: '{{ lib.show }}'\n",
        )
        .unwrap();
        let show = script.function("lib:show").unwrap();
        assert_eq!(
            show.body,
            format!("echo app-lib {}", dir.path().display())
        );
    }

    #[test]
    fn test_help_lists_descriptions() {
        let script = compile_str(
            "name: t\ntasks:\n  build:\n    desc: Build \"all\"\n    run: make\n  test: make test\n",
        )
        .unwrap();
        let help = script.function("help").unwrap();
        assert!(help.body.contains(r#"echo "  build - Build \"all\"""#));
        assert!(help.body.contains(r#"echo "  test""#));
    }

    #[test]
    fn test_user_help_task_wins() {
        let script = compile_str("name: t\ntasks:\n  help: echo custom\n").unwrap();
        assert_eq!(names(&script), vec!["help"]);
        assert_eq!(script.function("help").unwrap().body, "echo custom");
    }

    #[test]
    fn test_compile_is_deterministic() {
        let yaml = "name: t\nvars: {a: '1'}\ntasks:\n  x: echo {{ a }}\n  y: '{{ x }} again'\n";
        assert_eq!(compile_str(yaml).unwrap(), compile_str(yaml).unwrap());
    }

    #[test]
    fn test_escape_double_quoted() {
        assert_eq!(escape_double_quoted(r#"a"b$c`d\"#), r#"a\"b\$c\`d\\"#);
    }
}
