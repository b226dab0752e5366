//! Dotted-path reads and edits on JSON documents.
//!
//! Paths are `.` separated keys, for example
//! `items.0.spec.containers.0.resources.requests`. Numeric keys index into
//! arrays, and `\.` escapes a literal dot inside a key such as a label name.
//!
//! Reads additionally understand a small query language:
//!
//! - `#` is the array length, or a fan-out over the elements when more
//!   segments follow (`items.#.metadata.name`)
//! - `#(sub.path=value)` selects the first element whose `sub.path` equals
//!   `value`, `!=` negates the comparison
//! - `#(sub.path=value)#` selects every matching element
//!
//! Writes create missing intermediate containers. A numeric key creates an
//! array, and `-1` appends to one.

use serde_json::{Map, Value};

use crate::error::{E2eError, E2eResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum QueryOp {
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Count,
    Query {
        path: String,
        op: QueryOp,
        value: String,
        all: bool,
    },
}

/// One step of a manifest edit batch.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonEdit {
    /// Set every `key: value` of `values` below `path` (a path prefix that
    /// normally ends in `.`). A non-object `values` replaces `path` itself.
    Set { path: String, values: Value },
    /// Remove whatever lives at `path`.
    Delete { path: String },
}

impl JsonEdit {
    pub fn set(path: impl Into<String>, values: Value) -> Self {
        Self::Set {
            path: path.into(),
            values,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::Delete { path: path.into() }
    }
}

fn split_path(path: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = path.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if depth > 0 {
                        current.push('\\');
                    }
                    current.push(escaped);
                }
            }
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '.' if depth == 0 => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

fn parse_segment(raw: String) -> Segment {
    if raw == "#" {
        return Segment::Count;
    }
    let Some(body) = raw.strip_prefix("#(") else {
        return Segment::Key(raw);
    };
    let (body, all) = match body.strip_suffix(")#") {
        Some(inner) => (inner, true),
        None => match body.strip_suffix(')') {
            Some(inner) => (inner, false),
            None => return Segment::Key(raw),
        },
    };
    let (path, op, value) = if let Some((p, v)) = body.split_once("!=") {
        (p, QueryOp::Ne, v)
    } else if let Some((p, v)) = body.split_once("==") {
        (p, QueryOp::Eq, v)
    } else if let Some((p, v)) = body.split_once('=') {
        (p, QueryOp::Eq, v)
    } else {
        return Segment::Key(raw);
    };
    Segment::Query {
        path: path.trim().to_string(),
        op,
        value: value.trim().trim_matches('"').to_string(),
        all,
    }
}

fn parse(path: &str) -> Vec<Segment> {
    split_path(path).into_iter().map(parse_segment).collect()
}

fn plain_keys(path: &str) -> E2eResult<Vec<String>> {
    parse(path)
        .into_iter()
        .map(|segment| match segment {
            Segment::Key(key) => Ok(key),
            _ => Err(E2eError::JsonPath {
                path: path.to_string(),
                reason: "queries are read-only".to_string(),
            }),
        })
        .collect()
}

/// The string form of a value: strings unquoted, null empty, the rest as
/// compact JSON.
#[must_use]
pub fn to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn query_matches(item: &Value, path: &str, op: &QueryOp, expected: &str) -> bool {
    let actual = lookup(item, &parse(path)).map(|v| to_plain_string(&v));
    match op {
        QueryOp::Eq => actual.as_deref() == Some(expected),
        QueryOp::Ne => actual.as_deref() != Some(expected),
    }
}

fn lookup(value: &Value, segments: &[Segment]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match first {
        Segment::Key(key) => {
            let next = match value {
                Value::Object(map) => map.get(key)?,
                Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
                _ => return None,
            };
            lookup(next, rest)
        }
        Segment::Count => {
            let items = value.as_array()?;
            if rest.is_empty() {
                Some(Value::from(items.len()))
            } else {
                Some(Value::Array(
                    items.iter().filter_map(|item| lookup(item, rest)).collect(),
                ))
            }
        }
        Segment::Query {
            path,
            op,
            value: expected,
            all,
        } => {
            let items = value.as_array()?;
            let mut matches = items
                .iter()
                .filter(|item| query_matches(item, path, op, expected));
            if *all {
                Some(Value::Array(
                    matches.filter_map(|item| lookup(item, rest)).collect(),
                ))
            } else {
                lookup(matches.next()?, rest)
            }
        }
    }
}

/// Read the value at `path`, `None` when any segment is missing.
#[must_use]
pub fn get(doc: &Value, path: &str) -> Option<Value> {
    lookup(doc, &parse(path))
}

/// Read the value at `path` as a string, `""` when missing.
#[must_use]
pub fn get_string(doc: &Value, path: &str) -> String {
    get(doc, path).map(|v| to_plain_string(&v)).unwrap_or_default()
}

/// Whether `path` resolves to anything.
#[must_use]
pub fn exists(doc: &Value, path: &str) -> bool {
    get(doc, path).is_some()
}

fn is_index(key: &str) -> bool {
    key == "-1" || key.parse::<usize>().is_ok()
}

fn set_keys(current: &mut Value, keys: &[String], new_value: Value, path: &str) -> E2eResult<()> {
    let Some((key, rest)) = keys.split_first() else {
        *current = new_value;
        return Ok(());
    };
    if current.is_null() {
        *current = if is_index(key) {
            Value::Array(Vec::new())
        } else {
            Value::Object(Map::new())
        };
    }
    let slot = match current {
        Value::Object(map) => map.entry(key.clone()).or_insert(Value::Null),
        Value::Array(items) => {
            let index = if key == "-1" {
                items.len()
            } else {
                key.parse::<usize>().map_err(|_| E2eError::JsonPath {
                    path: path.to_string(),
                    reason: format!("'{key}' is not an array index"),
                })?
            };
            if index >= items.len() {
                items.resize(index + 1, Value::Null);
            }
            &mut items[index]
        }
        _ => {
            return Err(E2eError::JsonPath {
                path: path.to_string(),
                reason: format!("cannot descend into a scalar at '{key}'"),
            })
        }
    };
    set_keys(slot, rest, new_value, path)
}

/// Set `path` to `new_value`, creating intermediate containers.
///
/// # Errors
///
/// Returns an error if the path contains a query or walks through a scalar.
pub fn set(doc: &mut Value, path: &str, new_value: Value) -> E2eResult<()> {
    let keys = plain_keys(path)?;
    set_keys(doc, &keys, new_value, path)
}

/// Remove the value at `path`. Returns whether anything was removed.
///
/// # Errors
///
/// Returns an error if the path is empty or contains a query.
pub fn delete(doc: &mut Value, path: &str) -> E2eResult<bool> {
    let keys = plain_keys(path)?;
    let Some((last, parents)) = keys.split_last() else {
        return Err(E2eError::JsonPath {
            path: path.to_string(),
            reason: "empty path".to_string(),
        });
    };
    let mut current = doc;
    for key in parents {
        current = match current {
            Value::Object(map) => match map.get_mut(key) {
                Some(next) => next,
                None => return Ok(false),
            },
            Value::Array(items) => match key.parse::<usize>().ok().and_then(|i| items.get_mut(i)) {
                Some(next) => next,
                None => return Ok(false),
            },
            _ => return Ok(false),
        };
    }
    Ok(match current {
        Value::Object(map) => map.remove(last).is_some(),
        Value::Array(items) => match last.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    })
}

fn escape_key(key: &str) -> String {
    key.replace('.', "\\.")
}

/// Apply a batch of edits in order.
///
/// # Errors
///
/// Returns the first path error encountered.
pub fn apply_edits(doc: &mut Value, edits: &[JsonEdit]) -> E2eResult<()> {
    for edit in edits {
        match edit {
            JsonEdit::Set { path, values } => match values {
                Value::Object(map) => {
                    for (key, value) in map {
                        set(doc, &format!("{path}{}", escape_key(key)), value.clone())?;
                    }
                }
                other => set(doc, path.trim_end_matches('.'), other.clone())?,
            },
            JsonEdit::Delete { path } => {
                delete(doc, path)?;
            }
        }
    }
    Ok(())
}

/// Path prefix that extra parameters attach to: the first list item when the
/// document is a `List`, the root otherwise.
#[must_use]
pub fn default_edit_prefix(doc: &Value) -> &'static str {
    if exists(doc, "items.0") {
        "items.0."
    } else {
        ""
    }
}
