//! Expression resolution for node parameters.
//!
//! Parameter strings may embed `{{ expr }}` expressions. A string that is a
//! single expression resolves to the raw JSON value; any other string has each
//! expression stringified in place. The grammar is a small path language:
//!
//! ```text
//! expr      := path ( "??" literal )?
//! path      := root accessor*
//! root      := $json | $binary | $item | $input | $run | $workflow | $vars
//!            | $node[ "Name" ]
//! accessor  := .ident | [integer] | ["string"]
//! ```
//!
//! Resolution reads only the [`ExpressionScope`]; it never looks at the clock
//! or the environment, so the same scope always yields the same value.

use std::sync::OnceLock;

use regex_lite::Regex;
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::context::{NodeLookup, RunSnapshot};
use crate::error::Error;
use crate::nodes::DataItem;

/// Expression failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// The referenced node exists but has not produced output in this run.
    #[error("node '{node}' has not produced output in this run")]
    UnresolvedReference { node: String },

    #[error("unknown node '{node}'")]
    UnknownNode { node: String },

    #[error("syntax error in '{expr}': {message}")]
    Syntax { expr: String, message: String },
}

impl From<ExpressionError> for Error {
    fn from(err: ExpressionError) -> Self {
        match err {
            ExpressionError::UnresolvedReference { node } => Error::UnresolvedReference { node },
            other => Error::Expression(other.to_string()),
        }
    }
}

type ExprResult<T> = std::result::Result<T, ExpressionError>;

/// Everything an expression may read.
#[derive(Debug, Clone, Copy)]
pub struct ExpressionScope<'a> {
    /// Current item, absent for batch nodes without input
    pub item: Option<&'a DataItem>,
    pub item_index: usize,
    /// Items on the current node's input 0
    pub input: &'a [DataItem],
    pub run: &'a RunSnapshot,
}

impl<'a> ExpressionScope<'a> {
    pub fn new(run: &'a RunSnapshot, input: &'a [DataItem]) -> Self {
        Self {
            item: None,
            item_index: 0,
            input,
            run,
        }
    }

    pub fn for_item(mut self, index: usize, item: &'a DataItem) -> Self {
        self.item = Some(item);
        self.item_index = index;
        self
    }
}

/// Whether a value contains any `{{` that would need resolving.
pub fn contains_expression(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains("{{"),
        Value::Array(items) => items.iter().any(contains_expression),
        Value::Object(map) => map.values().any(contains_expression),
        _ => false,
    }
}

/// Resolve every string in `params`, recursing through arrays and objects.
/// Object keys are left untouched.
pub fn resolve_params(params: &Value, scope: &ExpressionScope<'_>) -> ExprResult<Value> {
    match params {
        Value::String(s) => resolve(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_params(v, scope))
            .collect::<ExprResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_params(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// A string that is exactly one `{{ expr }}`, surrounding whitespace allowed.
fn whole_expression_regex() -> &'static Regex {
    static WHOLE_EXPRESSION: OnceLock<Regex> = OnceLock::new();
    WHOLE_EXPRESSION
        .get_or_init(|| Regex::new(r"^\s*\{\{\s*([^{}]+?)\s*\}\}\s*$").expect("valid regex"))
}

/// Each `{{ expr }}` embedded in a string.
fn template_regex() -> &'static Regex {
    static TEMPLATE: OnceLock<Regex> = OnceLock::new();
    TEMPLATE.get_or_init(|| Regex::new(r"\{\{\s*(.+?)\s*\}\}").expect("valid regex"))
}

/// Resolve one template string.
pub fn resolve(template: &str, scope: &ExpressionScope<'_>) -> ExprResult<Value> {
    if !template.contains("{{") {
        return Ok(Value::String(template.to_string()));
    }

    if let Some(inner) = whole_expression_regex()
        .captures(template)
        .and_then(|caps| caps.get(1))
    {
        return evaluate(inner.as_str(), scope);
    }

    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in template_regex().captures_iter(template) {
        let (Some(whole), Some(inner)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        out.push_str(&stringify(&evaluate(inner.as_str(), scope)?));
        last = whole.end();
    }

    let rest = &template[last..];
    if rest.contains("{{") {
        return Err(ExpressionError::Syntax {
            expr: template.to_string(),
            message: "unclosed '{{'".to_string(),
        });
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate(src: &str, scope: &ExpressionScope<'_>) -> ExprResult<Value> {
    let expr = parse(src)?;
    let value = eval_path(&expr.path, scope)?;
    match (value, expr.fallback) {
        (Value::Null, Some(fallback)) => Ok(fallback),
        (value, _) => Ok(value),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Root {
    Json,
    Binary,
    Item,
    Input,
    Run,
    Workflow,
    Vars,
    Node(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Accessor {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq)]
struct Path {
    root: Root,
    accessors: Vec<Accessor>,
}

#[derive(Debug, Clone, PartialEq)]
struct Expr {
    path: Path,
    fallback: Option<Value>,
}

fn parse(src: &str) -> ExprResult<Expr> {
    let (path_src, fallback_src) = split_fallback(src);
    let path = PathParser::new(src, path_src).parse()?;
    let fallback = fallback_src.map(|lit| parse_literal(src, lit)).transpose()?;
    Ok(Expr { path, fallback })
}

/// Split at the first `??` outside quotes.
fn split_fallback(src: &str) -> (&str, Option<&str>) {
    let mut quote: Option<char> = None;
    let mut prev = '\0';
    for (idx, c) in src.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '"' || c == '\'' => quote = Some(c),
            None if c == '?' && prev == '?' => {
                return (&src[..idx - 1], Some(&src[idx + 1..]));
            }
            None => {}
        }
        prev = c;
    }
    (src, None)
}

fn parse_literal(expr: &str, lit: &str) -> ExprResult<Value> {
    let lit = lit.trim();
    if lit.len() >= 2 && lit.starts_with('\'') && lit.ends_with('\'') {
        return Ok(Value::String(lit[1..lit.len() - 1].to_string()));
    }
    serde_json::from_str(lit).map_err(|_| ExpressionError::Syntax {
        expr: expr.to_string(),
        message: format!("invalid fallback literal '{}'", lit),
    })
}

struct PathParser<'a> {
    expr: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> PathParser<'a> {
    fn new(expr: &'a str, src: &str) -> Self {
        Self {
            expr,
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::Syntax {
            expr: self.expr.trim().to_string(),
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().map(|c| c.is_whitespace()).unwrap_or(false) {
            self.pos += 1;
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while self
            .peek()
            .map(|c| c.is_alphanumeric() || c == '_')
            .unwrap_or(false)
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn quoted(&mut self) -> ExprResult<String> {
        let quote = match self.peek() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.error("expected quoted string")),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let s: String = self.chars[start..self.pos].iter().collect();
                self.pos += 1;
                return Ok(s);
            }
            self.pos += 1;
        }
        Err(self.error("unterminated string"))
    }

    fn bracket(&mut self) -> ExprResult<Accessor> {
        self.skip_ws();
        let accessor = match self.peek() {
            Some('"' | '\'') => Accessor::Key(self.quoted()?),
            Some(c) if c.is_ascii_digit() => {
                let digits = self.ident();
                let index = digits
                    .parse::<usize>()
                    .map_err(|_| self.error(format!("invalid index '{}'", digits)))?;
                Accessor::Index(index)
            }
            _ => return Err(self.error("expected index or quoted key inside '[]'")),
        };
        self.skip_ws();
        if !self.eat(']') {
            return Err(self.error("expected ']'"));
        }
        Ok(accessor)
    }

    fn parse(mut self) -> ExprResult<Path> {
        self.skip_ws();
        if !self.eat('$') {
            return Err(self.error("expression must start with '$'"));
        }

        let root = match self.ident().as_str() {
            "json" => Root::Json,
            "binary" => Root::Binary,
            "item" => Root::Item,
            "input" => Root::Input,
            "run" => Root::Run,
            "workflow" => Root::Workflow,
            "vars" => Root::Vars,
            "node" => {
                self.skip_ws();
                if !self.eat('[') {
                    return Err(self.error("expected '[' after $node"));
                }
                match self.bracket()? {
                    Accessor::Key(name) => Root::Node(name),
                    Accessor::Index(_) => {
                        return Err(self.error("$node expects a quoted node name"))
                    }
                }
            }
            other => return Err(self.error(format!("unknown root '${}'", other))),
        };

        let mut accessors = Vec::new();
        loop {
            if self.eat('.') {
                let key = self.ident();
                if key.is_empty() {
                    return Err(self.error("expected field name after '.'"));
                }
                accessors.push(Accessor::Key(key));
            } else if self.eat('[') {
                accessors.push(self.bracket()?);
            } else {
                break;
            }
        }

        self.skip_ws();
        if let Some(c) = self.peek() {
            return Err(self.error(format!("unexpected character '{}'", c)));
        }

        Ok(Path { root, accessors })
    }
}

fn eval_path(path: &Path, scope: &ExpressionScope<'_>) -> ExprResult<Value> {
    let base = match &path.root {
        Root::Json => scope.item.map(|i| i.json.clone()).unwrap_or(Value::Null),
        Root::Binary => scope
            .item
            .and_then(|i| i.binary.as_ref())
            .and_then(|b| serde_json::to_value(b).ok())
            .unwrap_or(Value::Null),
        Root::Item => json!({ "index": scope.item_index }),
        Root::Input => json!({
            "items": items_json(scope.input),
            "first": scope.input.first().map(|i| i.json.clone()).unwrap_or(Value::Null),
            "last": scope.input.last().map(|i| i.json.clone()).unwrap_or(Value::Null),
        }),
        Root::Run => json!({
            "id": scope.run.run_id,
            "mode": scope.run.mode.as_str(),
            "started_at": scope.run.started_at.to_rfc3339(),
        }),
        Root::Workflow => json!({
            "id": scope.run.workflow.id,
            "name": scope.run.workflow.name,
        }),
        Root::Vars => serde_json::to_value(&scope.run.workflow.variables).unwrap_or(Value::Null),
        Root::Node(name) => return eval_node(name, &path.accessors, scope),
    };

    Ok(walk(base, &path.accessors))
}

fn eval_node(name: &str, accessors: &[Accessor], scope: &ExpressionScope<'_>) -> ExprResult<Value> {
    let output = match scope.run.lookup(name) {
        NodeLookup::Output(output) => output,
        NodeLookup::NotExecuted => {
            return Err(ExpressionError::UnresolvedReference {
                node: name.to_string(),
            })
        }
        NodeLookup::Unknown => {
            return Err(ExpressionError::UnknownNode {
                node: name.to_string(),
            })
        }
    };

    let mut rest = accessors;
    let mut branch = 0;
    if let [Accessor::Key(key), Accessor::Index(n), tail @ ..] = rest {
        if key == "output" {
            branch = *n;
            rest = tail;
        }
    }
    let items = output.branch(branch);

    let (base, rest) = match rest.split_first() {
        None => (items_json(items), rest),
        Some((Accessor::Key(selector), tail)) => {
            let base = match selector.as_str() {
                "json" => items
                    .get(scope.item_index)
                    .map(|i| i.json.clone())
                    .unwrap_or(Value::Null),
                "first" => items.first().map(|i| i.json.clone()).unwrap_or(Value::Null),
                "last" => items.last().map(|i| i.json.clone()).unwrap_or(Value::Null),
                "items" => items_json(items),
                "run_index" => json!(output.run_index),
                other => {
                    return Err(ExpressionError::Syntax {
                        expr: format!("$node[\"{}\"]", name),
                        message: format!(
                            "unknown selector '.{}', expected json, first, last, items, output[n] or run_index",
                            other
                        ),
                    })
                }
            };
            (base, tail)
        }
        Some((Accessor::Index(_), _)) => {
            return Err(ExpressionError::Syntax {
                expr: format!("$node[\"{}\"]", name),
                message: "index a node's items through .items[n]".to_string(),
            })
        }
    };

    Ok(walk(base, rest))
}

fn items_json(items: &[DataItem]) -> Value {
    Value::Array(items.iter().map(|i| i.json.clone()).collect())
}

/// Follow accessors; anything missing resolves to null.
fn walk(mut current: Value, accessors: &[Accessor]) -> Value {
    for accessor in accessors {
        current = match (accessor, current) {
            (Accessor::Key(key), Value::Object(mut map)) => map.remove(key).unwrap_or(Value::Null),
            (Accessor::Key(key), Value::Array(items)) if key == "length" => json!(items.len()),
            (Accessor::Index(idx), Value::Array(mut items)) if *idx < items.len() => {
                items.swap_remove(*idx)
            }
            _ => return Value::Null,
        };
    }
    current
}
