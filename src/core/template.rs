//! Restricted Jinja-style template engine.
//!
//! Supported syntax:
//! - `{{ expr }}` with dotted lookups (`log.info`, `items.0`), string and
//!   integer literals, calls with keyword arguments and `|` filters
//! - `{% qx %}...{% endqx %}` remote-boundary blocks
//! - `{% raw %}...{% endraw %}` literal blocks and `{# ... #}` comments
//! - `-` whitespace control on any delimiter
//!
//! Lookups of undefined names are errors. Globals: `random`, `env`, `shell`,
//! `include_file`. Filters: `random`, `upper`, `lower`.

use super::error::EvalError;
use super::types::yaml_value_to_string;
use rand::Rng;
use regex::Regex;
use serde_yaml_ng::{Mapping, Value};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::process::Command;
use std::sync::LazyLock;
use thiserror::Error;

const RANDOM_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const RANDOM_DEFAULT_LEN: u64 = 8;

static TASK_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z_][A-Za-z0-9_-]*:[A-Za-z_][A-Za-z0-9_-]*").expect("task ref pattern")
});

/// Template failure. `Eval` wraps failures of compile-time side effects.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template syntax error: {0}")]
    Syntax(String),

    #[error("undefined variable '{name}'")]
    Undefined { name: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("unknown filter '{0}'")]
    UnknownFilter(String),

    #[error("{function}(): {message}")]
    BadArgument { function: String, message: String },

    #[error(transparent)]
    Eval(#[from] EvalError),
}

type TResult<T> = std::result::Result<T, TemplateError>;

fn syntax(msg: impl Into<String>) -> TemplateError {
    TemplateError::Syntax(msg.into())
}

/// Per-render state: where relative paths resolve, which canonical task
/// names exist, and the names collected from `qx` blocks.
#[derive(Debug)]
pub struct RenderEnv<'a> {
    pub source_dir: &'a Path,
    pub known_tasks: &'a HashSet<String>,
    pub qx_deps: BTreeSet<String>,
}

impl<'a> RenderEnv<'a> {
    pub fn new(source_dir: &'a Path, known_tasks: &'a HashSet<String>) -> Self {
        Self {
            source_dir,
            known_tasks,
            qx_deps: BTreeSet::new(),
        }
    }
}

/// Known canonical `alias:task` names mentioned in `text`, sorted.
pub fn find_task_refs(text: &str, known: &HashSet<String>) -> BTreeSet<String> {
    TASK_REF_RE
        .find_iter(text)
        .map(|m| m.as_str())
        .filter(|name| known.contains(*name))
        .map(str::to_string)
        .collect()
}

/// Parse and render in one step.
pub fn render(src: &str, ctx: &Mapping, env: &mut RenderEnv<'_>) -> TResult<String> {
    Template::parse(src)?.render(ctx, env)
}

// ============================================================================
// AST
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Text(String),
    Expr(Expr),
    Qx(Vec<Node>),
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Str(String),
    Int(i64),
    Path(String, Vec<Segment>),
    Call(String, Vec<Arg>),
    Filter(Box<Expr>, String, Vec<Arg>),
}

#[derive(Debug, Clone, PartialEq)]
struct Arg {
    name: Option<String>,
    value: Expr,
}

/// A parsed template.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    nodes: Vec<Node>,
}

impl Template {
    pub fn parse(src: &str) -> TResult<Self> {
        let src = src.strip_suffix('\n').unwrap_or(src);
        let pieces = lex(src)?;
        Ok(Self {
            nodes: build(pieces)?,
        })
    }

    pub fn render(&self, ctx: &Mapping, env: &mut RenderEnv<'_>) -> TResult<String> {
        let mut out = String::new();
        render_nodes(&self.nodes, ctx, env, &mut out)?;
        Ok(out)
    }
}

// ============================================================================
// Lexer: text / expression / tag pieces
// ============================================================================

#[derive(Debug, PartialEq)]
enum Piece {
    Text(String),
    Expr(String),
    Tag(String),
}

#[derive(Clone, Copy, PartialEq)]
enum Delim {
    Expr,
    Tag,
    Comment,
}

impl Delim {
    fn close(self) -> &'static str {
        match self {
            Delim::Expr => "}}",
            Delim::Tag => "%}",
            Delim::Comment => "#}",
        }
    }
}

fn find_open(s: &str) -> Option<(usize, Delim)> {
    let b = s.as_bytes();
    (0..b.len().saturating_sub(1)).find_map(|i| {
        if b[i] != b'{' {
            return None;
        }
        match b[i + 1] {
            b'{' => Some((i, Delim::Expr)),
            b'%' => Some((i, Delim::Tag)),
            b'#' => Some((i, Delim::Comment)),
            _ => None,
        }
    })
}

/// Offset of `close` in `s`, skipping quoted strings when `quoted`.
fn find_close(s: &str, close: &str, quoted: bool) -> Option<usize> {
    let b = s.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < b.len() {
        match quote {
            Some(q) => {
                if b[i] == b'\\' {
                    i += 2;
                    continue;
                }
                if b[i] == q {
                    quote = None;
                }
            }
            None => {
                if quoted && (b[i] == b'\'' || b[i] == b'"') {
                    quote = Some(b[i]);
                } else if b[i..].starts_with(close.as_bytes()) {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

fn push_text(pieces: &mut Vec<Piece>, text: &str) {
    if !text.is_empty() {
        pieces.push(Piece::Text(text.to_string()));
    }
}

fn lex(src: &str) -> TResult<Vec<Piece>> {
    let mut pieces = Vec::new();
    let mut rest = src;
    let mut trim_next = false;

    while let Some((pos, delim)) = find_open(rest) {
        let mut text = &rest[..pos];
        if trim_next {
            text = text.trim_start();
        }
        let mut inner_start = &rest[pos + 2..];
        if let Some(stripped) = inner_start.strip_prefix('-') {
            text = text.trim_end();
            inner_start = stripped;
        }
        push_text(&mut pieces, text);

        let end = find_close(inner_start, delim.close(), delim != Delim::Comment)
            .ok_or_else(|| syntax(format!("unclosed '{}'", &rest[pos..pos + 2])))?;
        let mut inner = &inner_start[..end];
        trim_next = false;
        if let Some(stripped) = inner.strip_suffix('-') {
            inner = stripped;
            trim_next = true;
        }
        rest = &inner_start[end + 2..];

        match delim {
            Delim::Comment => {}
            Delim::Expr => pieces.push(Piece::Expr(inner.trim().to_string())),
            Delim::Tag if inner.trim() == "raw" => {
                let (raw, after, trim_after) = take_raw(rest, trim_next)?;
                push_text(&mut pieces, raw);
                rest = after;
                trim_next = trim_after;
            }
            Delim::Tag => pieces.push(Piece::Tag(inner.trim().to_string())),
        }
    }

    let text = if trim_next { rest.trim_start() } else { rest };
    push_text(&mut pieces, text);
    Ok(pieces)
}

/// Split off the body of a raw block. Returns (body, remainder, trim flag
/// of the closing tag).
fn take_raw(rest: &str, trim_start: bool) -> TResult<(&str, &str, bool)> {
    let mut offset = 0;
    while let Some(rel) = rest[offset..].find("{%") {
        let open = offset + rel;
        let after_open = &rest[open + 2..];
        let Some(close) = after_open.find("%}") else {
            break;
        };
        let inner = &after_open[..close];
        let strip_before = inner.starts_with('-');
        let strip_after = inner.ends_with('-');
        let tag = inner.trim_start_matches('-').trim_end_matches('-').trim();
        if tag == "endraw" {
            let mut body = &rest[..open];
            if trim_start {
                body = body.trim_start();
            }
            if strip_before {
                body = body.trim_end();
            }
            return Ok((body, &after_open[close + 2..], strip_after));
        }
        offset = open + 2;
    }
    Err(syntax("unclosed raw block"))
}

fn build(pieces: Vec<Piece>) -> TResult<Vec<Node>> {
    let mut stack: Vec<Vec<Node>> = vec![Vec::new()];
    for piece in pieces {
        match piece {
            Piece::Text(t) => top(&mut stack).push(Node::Text(t)),
            Piece::Expr(src) => {
                let expr = ExprParser::new(&src)?.parse()?;
                top(&mut stack).push(Node::Expr(expr));
            }
            Piece::Tag(tag) => match tag.as_str() {
                "qx" => stack.push(Vec::new()),
                "endqx" => {
                    if stack.len() < 2 {
                        return Err(syntax("'endqx' without matching 'qx'"));
                    }
                    let body = stack.pop().unwrap_or_default();
                    top(&mut stack).push(Node::Qx(body));
                }
                other => return Err(syntax(format!("unsupported tag '{}'", other))),
            },
        }
    }
    if stack.len() != 1 {
        return Err(syntax("unclosed 'qx' block"));
    }
    Ok(stack.pop().unwrap_or_default())
}

fn top(stack: &mut [Vec<Node>]) -> &mut Vec<Node> {
    let last = stack.len() - 1;
    &mut stack[last]
}

// ============================================================================
// Expression parser
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Int(i64),
    Dot,
    Pipe,
    LParen,
    RParen,
    Comma,
    Assign,
}

fn tokenize(src: &str) -> TResult<Vec<Tok>> {
    let mut toks = Vec::new();
    let mut chars = src.char_indices().peekable();
    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' | '|' | '(' | ')' | ',' | '=' => {
                chars.next();
                toks.push(match c {
                    '.' => Tok::Dot,
                    '|' => Tok::Pipe,
                    '(' => Tok::LParen,
                    ')' => Tok::RParen,
                    ',' => Tok::Comma,
                    _ => Tok::Assign,
                });
            }
            '\'' | '"' => {
                chars.next();
                let mut s = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        closed = true;
                        break;
                    }
                    if ch == '\\' {
                        match chars.next() {
                            Some((_, 'n')) => s.push('\n'),
                            Some((_, 't')) => s.push('\t'),
                            Some((_, other)) => s.push(other),
                            None => break,
                        }
                    } else {
                        s.push(ch);
                    }
                }
                if !closed {
                    return Err(syntax(format!("unterminated string in '{}'", src)));
                }
                toks.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                let mut end = i;
                while let Some(&(j, d)) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    end = j + d.len_utf8();
                    chars.next();
                }
                let n = src[i..end]
                    .parse()
                    .map_err(|_| syntax(format!("integer out of range in '{}'", src)))?;
                toks.push(Tok::Int(n));
            }
            c if c == '_' || c.is_ascii_alphabetic() => {
                let mut end = i;
                while let Some(&(j, d)) = chars.peek() {
                    if !(d == '_' || d == '-' || d.is_ascii_alphanumeric()) {
                        break;
                    }
                    end = j + d.len_utf8();
                    chars.next();
                }
                toks.push(Tok::Ident(src[i..end].to_string()));
            }
            other => {
                return Err(syntax(format!(
                    "unexpected character '{}' in '{}'",
                    other, src
                )))
            }
        }
    }
    Ok(toks)
}

struct ExprParser<'s> {
    src: &'s str,
    toks: Vec<Tok>,
    pos: usize,
}

impl<'s> ExprParser<'s> {
    fn new(src: &'s str) -> TResult<Self> {
        Ok(Self {
            src,
            toks: tokenize(src)?,
            pos: 0,
        })
    }

    fn parse(mut self) -> TResult<Expr> {
        if self.toks.is_empty() {
            return Err(syntax("empty expression"));
        }
        let expr = self.filtered()?;
        if self.pos != self.toks.len() {
            return Err(self.unexpected());
        }
        Ok(expr)
    }

    fn unexpected(&self) -> TemplateError {
        match self.toks.get(self.pos) {
            Some(tok) => syntax(format!("unexpected {:?} in '{}'", tok, self.src)),
            None => syntax(format!("unexpected end of '{}'", self.src)),
        }
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let tok = self.toks.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn ident(&mut self) -> TResult<String> {
        match self.next() {
            Some(Tok::Ident(name)) => Ok(name),
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    fn filtered(&mut self) -> TResult<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&Tok::Pipe) {
            let name = self.ident()?;
            let args = if self.eat(&Tok::LParen) {
                self.args()?
            } else {
                Vec::new()
            };
            expr = Expr::Filter(Box::new(expr), name, args);
        }
        Ok(expr)
    }

    fn primary(&mut self) -> TResult<Expr> {
        match self.next() {
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Int(n)) => Ok(Expr::Int(n)),
            Some(Tok::LParen) => {
                let inner = self.filtered()?;
                if !self.eat(&Tok::RParen) {
                    return Err(self.unexpected());
                }
                Ok(inner)
            }
            Some(Tok::Ident(name)) => {
                if self.eat(&Tok::LParen) {
                    return Ok(Expr::Call(name, self.args()?));
                }
                let mut segments = Vec::new();
                while self.eat(&Tok::Dot) {
                    match self.next() {
                        Some(Tok::Ident(key)) => segments.push(Segment::Key(key)),
                        Some(Tok::Int(n)) => {
                            let idx = usize::try_from(n)
                                .map_err(|_| syntax(format!("bad index in '{}'", self.src)))?;
                            segments.push(Segment::Index(idx));
                        }
                        _ => {
                            self.pos -= 1;
                            return Err(self.unexpected());
                        }
                    }
                }
                Ok(Expr::Path(name, segments))
            }
            _ => {
                self.pos -= 1;
                Err(self.unexpected())
            }
        }
    }

    /// Arguments after an opening paren, through the closing one.
    fn args(&mut self) -> TResult<Vec<Arg>> {
        let mut args = Vec::new();
        if self.eat(&Tok::RParen) {
            return Ok(args);
        }
        loop {
            let name = match (self.toks.get(self.pos), self.toks.get(self.pos + 1)) {
                (Some(Tok::Ident(n)), Some(Tok::Assign)) => {
                    let n = n.clone();
                    self.pos += 2;
                    Some(n)
                }
                _ => None,
            };
            let value = self.filtered()?;
            args.push(Arg { name, value });
            if self.eat(&Tok::Comma) {
                continue;
            }
            if self.eat(&Tok::RParen) {
                return Ok(args);
            }
            return Err(self.unexpected());
        }
    }
}

// ============================================================================
// Evaluation
// ============================================================================

fn render_nodes(
    nodes: &[Node],
    ctx: &Mapping,
    env: &mut RenderEnv<'_>,
    out: &mut String,
) -> TResult<()> {
    for node in nodes {
        match node {
            Node::Text(t) => out.push_str(t),
            Node::Expr(e) => out.push_str(&yaml_value_to_string(&eval(e, ctx, env)?)),
            Node::Qx(body) => {
                let mut content = String::new();
                render_nodes(body, ctx, env, &mut content)?;
                let deps = find_task_refs(&content, env.known_tasks);
                if !deps.is_empty() {
                    let list: Vec<&str> = deps.iter().map(String::as_str).collect();
                    out.push_str(&format!("$(module:include {})\n", list.join(" ")));
                    env.qx_deps.extend(deps);
                }
                out.push_str(&content);
            }
        }
    }
    Ok(())
}

fn eval(expr: &Expr, ctx: &Mapping, env: &mut RenderEnv<'_>) -> TResult<Value> {
    match expr {
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Int(n) => Ok(Value::Number((*n).into())),
        Expr::Path(head, segments) => lookup(ctx, head, segments),
        Expr::Call(name, args) => {
            let args = Args::eval(args, ctx, env)?;
            call(name, args, env)
        }
        Expr::Filter(input, name, args) => {
            let input = eval(input, ctx, env)?;
            let args = Args::eval(args, ctx, env)?;
            filter(name, input, args)
        }
    }
}

fn lookup(ctx: &Mapping, head: &str, segments: &[Segment]) -> TResult<Value> {
    let undefined = || {
        let mut name = head.to_string();
        for seg in segments {
            match seg {
                Segment::Key(k) => name.push_str(&format!(".{}", k)),
                Segment::Index(i) => name.push_str(&format!(".{}", i)),
            }
        }
        TemplateError::Undefined { name }
    };
    let mut cur = ctx.get(head).ok_or_else(undefined)?;
    for seg in segments {
        let next = match (cur, seg) {
            (Value::Mapping(m), Segment::Key(k)) => m.get(k.as_str()),
            (Value::Mapping(m), Segment::Index(i)) => m.get(Value::Number((*i as u64).into())),
            (Value::Sequence(s), Segment::Index(i)) => s.get(*i),
            _ => None,
        };
        cur = next.ok_or_else(undefined)?;
    }
    Ok(cur.clone())
}

struct Args {
    positional: Vec<Value>,
    named: Vec<(String, Value)>,
}

impl Args {
    fn eval(args: &[Arg], ctx: &Mapping, env: &mut RenderEnv<'_>) -> TResult<Self> {
        let mut out = Args {
            positional: Vec::new(),
            named: Vec::new(),
        };
        for arg in args {
            let v = eval(&arg.value, ctx, env)?;
            match &arg.name {
                Some(n) => out.named.push((n.clone(), v)),
                None => out.positional.push(v),
            }
        }
        Ok(out)
    }

    fn get(&self, idx: usize, name: &str) -> Option<&Value> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .or_else(|| self.positional.get(idx))
    }

    fn string(&self, function: &str, idx: usize, name: &str) -> TResult<Option<String>> {
        match self.get(idx, name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(v) if !matches!(v, Value::Sequence(_) | Value::Mapping(_)) => {
                Ok(Some(yaml_value_to_string(v)))
            }
            Some(_) => Err(bad_argument(function, format!("'{}' must be a string", name))),
        }
    }

    fn required_string(&self, function: &str, idx: usize, name: &str) -> TResult<String> {
        self.string(function, idx, name)?
            .ok_or_else(|| bad_argument(function, format!("missing argument '{}'", name)))
    }
}

fn bad_argument(function: &str, message: String) -> TemplateError {
    TemplateError::BadArgument {
        function: function.to_string(),
        message,
    }
}

fn length_arg(function: &str, value: Option<&Value>) -> TResult<usize> {
    match value {
        None => Ok(RANDOM_DEFAULT_LEN as usize),
        Some(v) => v
            .as_u64()
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(|| bad_argument(function, "length must be a non-negative integer".into())),
    }
}

fn call(name: &str, args: Args, env: &RenderEnv<'_>) -> TResult<Value> {
    tracing::trace!(function = name, "template call");
    match name {
        "random" => Ok(Value::String(random_string(length_arg(
            "random",
            args.get(0, "length"),
        )?))),
        "env" => {
            let var = args.required_string("env", 0, "name")?;
            let default = args.string("env", 1, "default")?.unwrap_or_default();
            Ok(Value::String(std::env::var(&var).unwrap_or(default)))
        }
        "shell" => {
            let cmd = args.required_string("shell", 0, "cmd")?;
            let out = match args.string("shell", 1, "cwd")? {
                Some(cwd) => shell(&cmd, Path::new(&cwd))?,
                None => shell(&cmd, env.source_dir)?,
            };
            Ok(Value::String(out))
        }
        "include_file" => {
            let path = args.required_string("include_file", 0, "path")?;
            let out = match args.string("include_file", 1, "source_dir")? {
                Some(dir) => include_file(&path, Path::new(&dir))?,
                None => include_file(&path, env.source_dir)?,
            };
            Ok(Value::String(out))
        }
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

fn filter(name: &str, input: Value, args: Args) -> TResult<Value> {
    match name {
        "random" => {
            let len = match args.get(0, "length") {
                Some(v) => length_arg("random", Some(v))?,
                None => length_arg("random", Some(&input))?,
            };
            Ok(Value::String(random_string(len)))
        }
        "upper" => Ok(Value::String(yaml_value_to_string(&input).to_uppercase())),
        "lower" => Ok(Value::String(yaml_value_to_string(&input).to_lowercase())),
        other => Err(TemplateError::UnknownFilter(other.to_string())),
    }
}

// ============================================================================
// Builtins
// ============================================================================

/// Uppercase letters and digits.
pub fn random_string(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| RANDOM_CHARSET[rng.random_range(0..RANDOM_CHARSET.len())] as char)
        .collect()
}

/// Run `cmd` with `bash -c` in `cwd` and return its trimmed stdout.
pub fn shell(cmd: &str, cwd: &Path) -> Result<String, EvalError> {
    tracing::debug!(cmd, cwd = %cwd.display(), "compile-time shell");
    let output = Command::new("bash")
        .arg("-c")
        .arg(cmd)
        .current_dir(cwd)
        .output()
        .map_err(|source| EvalError::ShellSpawn {
            command: cmd.to_string(),
            source,
        })?;
    if !output.status.success() {
        return Err(EvalError::ShellFailed {
            command: cmd.to_string(),
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Raw contents of `path` relative to `source_dir`.
pub fn include_file(path: &str, source_dir: &Path) -> Result<String, EvalError> {
    let full = source_dir.join(path);
    if !full.exists() {
        return Err(EvalError::IncludeMissing { path: full });
    }
    if full.is_dir() {
        return Err(EvalError::IncludeIsDirectory { path: full });
    }
    std::fs::read_to_string(&full).map_err(|source| EvalError::IncludeRead { path: full, source })
}
