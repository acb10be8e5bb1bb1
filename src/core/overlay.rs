//! Include and preset merging.
//!
//! Builds the effective module the resolver sees. Layers apply in increasing
//! priority: includes, then the module's own content, then each active preset
//! (its includes first, then its own content).

use super::error::{ResolutionError, Result};
use super::parser;
use super::types::*;
use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Merge includes and presets into a module with no includes or presets left.
///
/// `base_dir` anchors include paths. `active_presets` of `None` selects the
/// module's `defaults`.
pub fn effective_module(
    module: &Module,
    base_dir: &Path,
    active_presets: Option<&[String]>,
) -> Result<Module> {
    let mut eff = Module {
        name: module.name.clone(),
        source_path: module.source_path.clone(),
        ..Default::default()
    };
    let mut chain = Vec::new();

    for include in &module.includes {
        apply_include(&mut eff, base_dir, Path::new(""), include, &mut chain)?;
    }
    merge_layer(&mut eff, &module.vars, &module.tasks, &module.modules, None);

    let names = active_presets.unwrap_or(module.defaults.as_slice());
    for name in names {
        let preset = module
            .presets
            .get(name)
            .ok_or_else(|| ResolutionError::UnknownPreset { name: name.clone() })?;
        tracing::debug!(preset = %name, "applying preset");
        for include in &preset.includes {
            apply_include(&mut eff, base_dir, Path::new(""), include, &mut chain)?;
        }
        merge_layer(&mut eff, &preset.vars, &preset.tasks, &preset.modules, None);
    }

    Ok(eff)
}

/// Apply one include file. `rel_dir` is the including file's directory
/// relative to `base_dir`; import sources are rebased onto the include's own
/// directory so they keep resolving after the merge.
fn apply_include(
    eff: &mut Module,
    base_dir: &Path,
    rel_dir: &Path,
    include: &str,
    chain: &mut Vec<PathBuf>,
) -> Result<()> {
    let resolved = base_dir.join(rel_dir).join(include);
    if !resolved.is_file() {
        return Err(ResolutionError::IncludeNotFound {
            include: include.to_string(),
            resolved,
        }
        .into());
    }
    let key = resolved.canonicalize().unwrap_or_else(|_| resolved.clone());
    if chain.contains(&key) {
        tracing::debug!(include, "include already applied in this chain, skipping");
        return Ok(());
    }

    tracing::debug!(path = %resolved.display(), "applying include");
    let partial = parser::parse_partial_file(&resolved)?;
    let include_rel = rel_dir
        .join(include)
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    chain.push(key);
    for nested in &partial.includes {
        apply_include(eff, base_dir, &include_rel, nested, chain)?;
    }
    chain.pop();

    merge_layer(
        eff,
        &partial.vars,
        &partial.tasks,
        &partial.modules,
        Some(&include_rel),
    );
    Ok(())
}

fn merge_layer(
    eff: &mut Module,
    vars: &IndexMap<String, serde_yaml_ng::Value>,
    tasks: &IndexMap<String, Task>,
    modules: &IndexMap<String, ModuleRef>,
    rebase: Option<&Path>,
) {
    for (k, v) in vars {
        eff.vars.insert(k.clone(), v.clone());
    }
    for (alias, mref) in modules {
        let source = match rebase {
            Some(dir) if !dir.as_os_str().is_empty() => {
                dir.join(&mref.source).to_string_lossy().into_owned()
            }
            _ => mref.source.clone(),
        };
        eff.modules.insert(
            alias.clone(),
            ModuleRef {
                alias: alias.clone(),
                source,
            },
        );
    }
    for (name, overlay) in tasks {
        match eff.tasks.get_mut(name) {
            Some(existing) => merge_task(existing, overlay),
            None => {
                eff.tasks.insert(name.clone(), overlay.clone());
            }
        }
    }
}

fn merge_task(into: &mut Task, overlay: &Task) {
    if overlay.has_implementation() {
        into.run = overlay.run.clone();
        into.uses = overlay.uses.clone();
    }
    if !overlay.with.is_empty() {
        into.with = overlay.with.clone();
    }
    into.vars
        .extend(overlay.vars.iter().map(|(k, v)| (k.clone(), v.clone())));
    into.env
        .extend(overlay.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    if overlay.desc.is_some() {
        into.desc = overlay.desc.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Error;

    fn write(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_no_overlays_is_identity_on_content() {
        let m = parser::parse("name: x\nvars: {a: 1}\ntasks:\n  t: echo\n").unwrap();
        let eff = effective_module(&m, Path::new("."), None).unwrap();
        assert_eq!(eff.vars, m.vars);
        assert_eq!(eff.tasks, m.tasks);
        assert!(eff.presets.is_empty());
    }

    #[test]
    fn test_module_content_beats_include() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "common.yaml",
            "vars:\n  who: include\n  extra: yes\ntasks:\n  shared: echo shared\n  greet: echo old\n",
        );
        let m = parser::parse(
            "name: x\nincludes: [common.yaml]\nvars:\n  who: module\ntasks:\n  greet: echo new\n",
        )
        .unwrap();
        let eff = effective_module(&m, dir.path(), None).unwrap();
        assert_eq!(eff.vars["who"], serde_yaml_ng::Value::String("module".into()));
        assert!(eff.vars.contains_key("extra"));
        assert_eq!(eff.tasks["greet"].run.as_deref(), Some("echo new"));
        assert_eq!(eff.tasks["shared"].run.as_deref(), Some("echo shared"));
        assert!(eff.includes.is_empty());
    }

    #[test]
    fn test_presets_apply_in_order_over_module() {
        let yaml = r#"
name: x
vars: {env: dev, region: eu}
tasks:
  deploy:
    desc: Deploy
    run: echo deploy
presets:
  prod:
    vars: {env: prod}
    tasks:
      deploy:
        env: {STAGE: prod}
  us:
    vars: {region: us, env: staging}
"#;
        let m = parser::parse(yaml).unwrap();
        let active = vec!["prod".to_string(), "us".to_string()];
        let eff = effective_module(&m, Path::new("."), Some(active.as_slice())).unwrap();
        assert_eq!(eff.vars["env"], serde_yaml_ng::Value::String("staging".into()));
        assert_eq!(eff.vars["region"], serde_yaml_ng::Value::String("us".into()));
        let deploy = &eff.tasks["deploy"];
        assert_eq!(deploy.run.as_deref(), Some("echo deploy"));
        assert_eq!(deploy.desc.as_deref(), Some("Deploy"));
        assert_eq!(deploy.env["STAGE"], "prod");
    }

    #[test]
    fn test_defaults_used_when_no_presets_given() {
        let yaml = "name: x\ntasks:\n  t:\npresets:\n  fill:\n    tasks:\n      t: echo filled\ndefaults: fill\n";
        let m = parser::parse(yaml).unwrap();
        let eff = effective_module(&m, Path::new("."), None).unwrap();
        assert_eq!(eff.tasks["t"].run.as_deref(), Some("echo filled"));

        let none: Vec<String> = Vec::new();
        let eff = effective_module(&m, Path::new("."), Some(none.as_slice())).unwrap();
        assert!(!eff.tasks["t"].has_implementation());
    }

    #[test]
    fn test_overlay_uses_replaces_run() {
        let yaml = "name: x\ntasks:\n  t: echo local\npresets:\n  p:\n    tasks:\n      t:\n        uses: log.info\n        with: [hi]\n";
        let m = parser::parse(yaml).unwrap();
        let eff = effective_module(&m, Path::new("."), Some(&["p".to_string()][..])).unwrap();
        let t = &eff.tasks["t"];
        assert!(t.run.is_none());
        assert_eq!(t.uses.as_deref(), Some("log.info"));
        assert_eq!(t.with, vec![WithItem::Positional("hi".into())]);
    }

    #[test]
    fn test_unknown_preset() {
        let m = parser::parse("name: x\n").unwrap();
        let err = effective_module(&m, Path::new("."), Some(&["ghost".to_string()][..])).unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::UnknownPreset { ref name }) if name == "ghost"
        ));
    }

    #[test]
    fn test_missing_include() {
        let dir = tempfile::tempdir().unwrap();
        let m = parser::parse("name: x\nincludes: [nope.yaml]\n").unwrap();
        let err = effective_module(&m, dir.path(), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Resolution(ResolutionError::IncludeNotFound { .. })
        ));
    }

    #[test]
    fn test_nested_include_rebases_module_sources() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "shared/base.yaml",
            "includes: [inner/more.yaml]\nmodules:\n  log:\n    source: log.yaml\n",
        );
        write(
            dir.path(),
            "shared/inner/more.yaml",
            "vars: {deep: 1}\nmodules:\n  fmt:\n    source: fmt.yaml\n",
        );
        let m = parser::parse("name: x\nincludes: [shared/base.yaml]\n").unwrap();
        let eff = effective_module(&m, dir.path(), None).unwrap();
        assert!(eff.vars.contains_key("deep"));
        assert_eq!(
            Path::new(&eff.modules["log"].source),
            Path::new("shared/log.yaml")
        );
        assert_eq!(
            Path::new(&eff.modules["fmt"].source),
            Path::new("shared/inner/fmt.yaml")
        );
    }

    #[test]
    fn test_include_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.yaml", "includes: [b.yaml]\nvars: {a: 1}\n");
        write(dir.path(), "b.yaml", "includes: [a.yaml]\nvars: {b: 1}\n");
        let m = parser::parse("name: x\nincludes: [a.yaml]\n").unwrap();
        let eff = effective_module(&m, dir.path(), None).unwrap();
        assert!(eff.vars.contains_key("a"));
        assert!(eff.vars.contains_key("b"));
    }
}
