//! YAML parsing and shape validation for task documents.
//!
//! Documents are loaded as untyped YAML and converted field by field so a
//! wrong shape produces an error naming the exact field. Nothing here crosses
//! module boundaries: imports, includes and presets are only recorded.

use super::error::{ParseError, Result};
use super::types::*;
use indexmap::IndexMap;
use serde_yaml_ng::{Mapping, Value};
use std::path::Path;

const IN_MEMORY_ORIGIN: &str = "<string>";

const MODULE_KEYS: &[&str] = &[
    "name", "vars", "tasks", "modules", "includes", "presets", "defaults",
];

/// Parse a task document from a string.
pub fn parse(text: &str) -> Result<Module> {
    parse_with_origin(text, IN_MEMORY_ORIGIN)
}

/// Parse a task document from disk, recording its source path.
pub fn parse_file(path: &Path) -> Result<Module> {
    let text = read(path)?;
    let mut module = parse_with_origin(&text, &path.display().to_string())?;
    module.source_path = Some(path.to_path_buf());
    Ok(module)
}

/// Parse the preset/include shape: `name` optional, no nested presets.
pub fn parse_partial(text: &str, origin: &str) -> Result<Preset> {
    let map = load_mapping(text, origin)?;
    Ok(partial_from_mapping(&map, origin, "")?)
}

/// Parse an include file from disk, recording its source path.
pub fn parse_partial_file(path: &Path) -> Result<Preset> {
    let text = read(path)?;
    let mut partial = parse_partial(&text, &path.display().to_string())?;
    partial.source_path = Some(path.to_path_buf());
    Ok(partial)
}

fn read(path: &Path) -> std::result::Result<String, ParseError> {
    std::fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_with_origin(text: &str, origin: &str) -> Result<Module> {
    let map = load_mapping(text, origin)?;

    let name = match map.get("name") {
        None | Some(Value::Null) => {
            return Err(ParseError::MissingName {
                origin: origin.to_string(),
            }
            .into())
        }
        Some(Value::String(s)) => s.clone(),
        Some(_) => return Err(wrong_shape(origin, "name", "a string").into()),
    };

    for key in map.keys() {
        let key = key_string(key);
        if !MODULE_KEYS.contains(&key.as_str()) {
            tracing::debug!(origin, key = %key, "ignoring unknown top-level key");
        }
    }

    let presets = match map.get("presets") {
        None | Some(Value::Null) => IndexMap::new(),
        Some(Value::Mapping(m)) => {
            let mut presets = IndexMap::new();
            for (k, v) in m {
                let preset_name = key_string(k);
                let field = format!("presets.{}", preset_name);
                let preset_map = match v {
                    Value::Mapping(pm) => pm.clone(),
                    Value::Null => Mapping::new(),
                    _ => return Err(wrong_shape(origin, &field, "a mapping").into()),
                };
                let partial = partial_from_mapping(&preset_map, origin, &format!("{}.", field))?;
                presets.insert(preset_name, partial);
            }
            presets
        }
        Some(_) => return Err(wrong_shape(origin, "presets", "a mapping").into()),
    };

    let defaults = match map.get("defaults") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(v @ Value::Sequence(_)) => string_list(v, origin, "defaults")?,
        Some(_) => {
            return Err(wrong_shape(origin, "defaults", "a preset name or list of names").into())
        }
    };

    Ok(Module {
        name,
        vars: parse_vars(map.get("vars"), origin, "vars")?,
        tasks: parse_tasks(map.get("tasks"), origin, "tasks")?,
        modules: parse_modules(map.get("modules"), origin, "modules")?,
        includes: parse_includes(map.get("includes"), origin, "includes")?,
        presets,
        defaults,
        source_path: None,
    })
}

fn load_mapping(text: &str, origin: &str) -> std::result::Result<Mapping, ParseError> {
    let value: Value = serde_yaml_ng::from_str(text).map_err(|source| ParseError::Yaml {
        origin: origin.to_string(),
        source,
    })?;
    match value {
        Value::Mapping(m) => Ok(m),
        _ => Err(ParseError::NotAMapping {
            origin: origin.to_string(),
        }),
    }
}

fn partial_from_mapping(
    map: &Mapping,
    origin: &str,
    prefix: &str,
) -> std::result::Result<Preset, ParseError> {
    for nested in ["presets", "defaults"] {
        if map.contains_key(nested) {
            return Err(wrong_shape(
                origin,
                &format!("{}{}", prefix, nested),
                "absent (presets and includes cannot declare presets)",
            ));
        }
    }
    let name = match map.get("name") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(wrong_shape(origin, &format!("{}name", prefix), "a string")),
    };
    Ok(Preset {
        name,
        vars: parse_vars(map.get("vars"), origin, &format!("{}vars", prefix))?,
        tasks: parse_tasks(map.get("tasks"), origin, &format!("{}tasks", prefix))?,
        modules: parse_modules(map.get("modules"), origin, &format!("{}modules", prefix))?,
        includes: parse_includes(map.get("includes"), origin, &format!("{}includes", prefix))?,
        source_path: None,
    })
}

// ============================================================================
// Field converters
// ============================================================================

fn wrong_shape(origin: &str, field: &str, expected: &'static str) -> ParseError {
    ParseError::WrongShape {
        origin: origin.to_string(),
        field: field.to_string(),
        expected,
    }
}

fn key_string(key: &Value) -> String {
    yaml_value_to_string(key)
}

fn is_scalar(v: &Value) -> bool {
    matches!(
        v,
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null
    )
}

fn parse_vars(
    value: Option<&Value>,
    origin: &str,
    field: &str,
) -> std::result::Result<IndexMap<String, Value>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(IndexMap::new()),
        Some(Value::Mapping(m)) => Ok(m.iter().map(|(k, v)| (key_string(k), v.clone())).collect()),
        Some(_) => Err(wrong_shape(origin, field, "a mapping")),
    }
}

fn string_list(
    value: &Value,
    origin: &str,
    field: &str,
) -> std::result::Result<Vec<String>, ParseError> {
    let Value::Sequence(items) = value else {
        return Err(wrong_shape(origin, field, "a list of strings"));
    };
    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            _ => Err(wrong_shape(origin, field, "a list of strings")),
        })
        .collect()
}

fn parse_includes(
    value: Option<&Value>,
    origin: &str,
    field: &str,
) -> std::result::Result<Vec<String>, ParseError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(v) => string_list(v, origin, field),
    }
}

fn parse_modules(
    value: Option<&Value>,
    origin: &str,
    field: &str,
) -> std::result::Result<IndexMap<String, ModuleRef>, ParseError> {
    let m = match value {
        None | Some(Value::Null) => return Ok(IndexMap::new()),
        Some(Value::Mapping(m)) => m,
        Some(_) => return Err(wrong_shape(origin, field, "a mapping")),
    };
    let mut modules = IndexMap::new();
    for (k, v) in m {
        let alias = key_string(k);
        let source = match v {
            Value::Mapping(entry) => match entry.get("source") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    return Err(ParseError::MissingSource {
                        origin: origin.to_string(),
                        alias,
                    })
                }
                Some(_) => {
                    return Err(wrong_shape(
                        origin,
                        &format!("{}.{}.source", field, alias),
                        "a string",
                    ))
                }
            },
            Value::Null => {
                return Err(ParseError::MissingSource {
                    origin: origin.to_string(),
                    alias,
                })
            }
            _ => {
                return Err(wrong_shape(
                    origin,
                    &format!("{}.{}", field, alias),
                    "a mapping with a 'source' field",
                ))
            }
        };
        modules.insert(alias.clone(), ModuleRef { alias, source });
    }
    Ok(modules)
}

fn parse_tasks(
    value: Option<&Value>,
    origin: &str,
    field: &str,
) -> std::result::Result<IndexMap<String, Task>, ParseError> {
    let m = match value {
        None | Some(Value::Null) => return Ok(IndexMap::new()),
        Some(Value::Mapping(m)) => m,
        Some(_) => return Err(wrong_shape(origin, field, "a mapping")),
    };
    let mut tasks = IndexMap::new();
    for (k, v) in m {
        let name = key_string(k);
        let task = parse_task(&name, v, origin, &format!("{}.{}", field, name))?;
        tasks.insert(name, task);
    }
    Ok(tasks)
}

fn parse_task(
    name: &str,
    value: &Value,
    origin: &str,
    field: &str,
) -> std::result::Result<Task, ParseError> {
    let mut task = Task {
        name: name.to_string(),
        ..Default::default()
    };
    let m = match value {
        Value::String(s) => {
            task.run = Some(s.clone());
            return Ok(task);
        }
        Value::Null => return Ok(task),
        Value::Mapping(m) => m,
        _ => return Err(wrong_shape(origin, field, "a string or mapping")),
    };

    task.run = match m.get("run") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            run_text(v).ok_or_else(|| {
                wrong_shape(origin, &format!("{}.run", field), "a string or list of strings")
            })?,
        ),
    };
    task.uses = match m.get("uses") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(_) => return Err(wrong_shape(origin, &format!("{}.uses", field), "a string")),
    };
    task.with = match m.get("with") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Sequence(items)) => items.iter().map(classify_with_item).collect(),
        Some(_) => return Err(wrong_shape(origin, &format!("{}.with", field), "a list")),
    };
    task.vars = parse_vars(m.get("vars"), origin, &format!("{}.vars", field))?;
    task.env = parse_env(m.get("env"), origin, &format!("{}.env", field))?;
    task.desc = match m.get("desc") {
        None | Some(Value::Null) => None,
        Some(v) if is_scalar(v) => Some(yaml_value_to_string(v)),
        Some(_) => return Err(wrong_shape(origin, &format!("{}.desc", field), "a string")),
    };
    Ok(task)
}

/// `run:` text; a list of lines is joined with newlines.
fn run_text(value: &Value) -> Option<String> {
    match value {
        Value::Sequence(lines) => {
            let mut out = Vec::with_capacity(lines.len());
            for line in lines {
                if !is_scalar(line) {
                    return None;
                }
                out.push(yaml_value_to_string(line));
            }
            Some(out.join("\n"))
        }
        v if is_scalar(v) => Some(yaml_value_to_string(v)),
        _ => None,
    }
}

fn classify_with_item(item: &Value) -> WithItem {
    match item {
        Value::String(s) => WithItem::Positional(s.clone()),
        Value::Mapping(m) => match m.get("run").and_then(run_text) {
            Some(text) => WithItem::Run(text),
            None => WithItem::Raw(item.clone()),
        },
        other => WithItem::Raw(other.clone()),
    }
}

fn is_shell_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn parse_env(
    value: Option<&Value>,
    origin: &str,
    field: &str,
) -> std::result::Result<IndexMap<String, String>, ParseError> {
    let m = match value {
        None | Some(Value::Null) => return Ok(IndexMap::new()),
        Some(Value::Mapping(m)) => m,
        Some(_) => return Err(wrong_shape(origin, field, "a mapping")),
    };
    let mut env = IndexMap::new();
    for (k, v) in m {
        let key = key_string(k);
        if !is_shell_identifier(&key) {
            return Err(wrong_shape(
                origin,
                &format!("{}.{}", field, key),
                "keyed by a shell identifier",
            ));
        }
        if !is_scalar(v) {
            return Err(wrong_shape(
                origin,
                &format!("{}.{}", field, key),
                "a scalar",
            ));
        }
        env.insert(key, yaml_value_to_string(v));
    }
    Ok(env)
}
