//! Bash text generation from the script IR.
//!
//! Function bodies are indented two spaces, except heredoc terminators:
//! a stack of open delimiters is tracked line by line and a line equal to
//! the innermost open delimiter is emitted flush left, so heredocs (nested
//! ones included) keep terminating after indentation.

use super::types::{BashFunction, BashScript};
use regex::Regex;
use std::sync::LazyLock;

const INDENT: &str = "  ";

/// `<<WORD`, `<<-WORD`, `<<'WORD'`, `<<"WORD"`, `<<\WORD`; not `<<<`.
/// An unquoted delimiter is any shell word (`END-OF`, `EOF.1`).
static HEREDOC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^<])<<-?\s*(?:'([^']+)'|"([^"]+)"|\\?([^\s;&|<>()'"]+))"#)
        .expect("heredoc pattern")
});

/// `(( ... ))` and `$(( ... ))`: `<<` in there is a shift.
static ARITH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$?\(\(.*?\)\)").expect("arithmetic pattern"));

/// Render a complete script: preamble, runtime header, functions, entrypoint.
pub fn render(script: &BashScript) -> String {
    let mut out = String::new();
    out.push_str(&script.preamble);
    out.push_str("\n\n");
    out.push_str(&script.header);
    out.push_str("\n\n");
    for function in &script.functions {
        out.push_str(&render_function(function));
        out.push_str("\n\n");
    }
    if !script.stand_ins.is_empty() {
        out.push_str(&stand_in_dispatch(script));
        out.push_str("\n\n");
    }
    out.push_str(&script.entrypoint);
    out.push('\n');
    out
}

/// Rewrites `$1` when it names a task dropped as a duplicate.
fn stand_in_dispatch(script: &BashScript) -> String {
    let mut out = String::from("case \"${1:-}\" in\n");
    for (dropped, survivor) in &script.stand_ins {
        out.push_str(&format!(
            "{}\"{}\") set -- \"{}\" \"${{@:2}}\" ;;\n",
            INDENT, dropped, survivor
        ));
    }
    out.push_str("esac");
    out
}

/// One function definition followed by its dependency registration.
pub fn render_function(function: &BashFunction) -> String {
    let body = function.body.trim();
    let body = if body.is_empty() {
        format!("{}:", INDENT)
    } else {
        indent_body(body)
    };
    format!(
        "{name} () {{\n{body}\n}}\nmodule:register_dependency \"{name}\" \"{deps}\"",
        name = function.name,
        body = body,
        deps = function.dependencies.join(" "),
    )
}

/// Delimiters introduced on `line`, in order of appearance.
fn heredoc_delimiters(line: &str) -> Vec<String> {
    let line = ARITH_RE.replace_all(line, " ");
    HEREDOC_RE
        .captures_iter(&line)
        .filter_map(|cap| {
            cap.get(1)
                .or_else(|| cap.get(2))
                .or_else(|| cap.get(3))
                .map(|m| m.as_str().to_string())
        })
        .collect()
}

/// Indent every line, leaving heredoc terminators flush left.
pub fn indent_body(body: &str) -> String {
    let mut open: Vec<String> = Vec::new();
    let mut lines = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if open.last().is_some_and(|top| top == trimmed) {
            open.pop();
            lines.push(trimmed.to_string());
            continue;
        }
        // bash reads the bodies in order, so the first delimiter closes first
        for delim in heredoc_delimiters(line).into_iter().rev() {
            open.push(delim);
        }
        if line.is_empty() {
            lines.push(String::new());
        } else {
            lines.push(format!("{}{}", INDENT, line));
        }
    }
    lines.join("\n")
}
