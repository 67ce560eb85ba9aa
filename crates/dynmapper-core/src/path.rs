//! Path expressions over JSON values.
//!
//! Source paths support dotted names, an optional leading `$`, back-quoted
//! names, array indices (negative indices count from the end), `[*]`
//! projection and implicit mapping of a name over an array:
//!
//! ```text
//! c8y_Temperature.value
//! `_TOPIC_LEVEL_`[1]
//! values.id          // ids of every object in the "values" array
//! values[-1].id
//! ```
//!
//! Target paths support names and indices only.

use serde_json::{Map, Value};

/// One step of a path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
}

/// Path evaluation and assignment errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Malformed path expression '{path}': {reason}")]
    Malformed { path: String, reason: String },

    #[error("Parent of '{path}' does not exist in target")]
    MissingParent { path: String },

    #[error("Cannot assign '{path}': parent is not an object or array")]
    NotContainer { path: String },
}

const RESERVED: &[char] = &[
    '(', ')', '$', '"', '\'', '{', '}', '=', '<', '>', '!', '&', '|', ',', '+', '*', '/', ' ', ':',
    '?', ';', ']',
];

fn malformed(path: &str, reason: impl Into<String>) -> PathError {
    PathError::Malformed {
        path: path.to_string(),
        reason: reason.into(),
    }
}

/// Parse a path expression into segments. `$` alone is the root.
pub fn parse(expr: &str) -> Result<Vec<Segment>, PathError> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Err(malformed(expr, "empty expression"));
    }
    let body = if trimmed == "$" {
        ""
    } else if let Some(rest) = trimmed.strip_prefix("$.") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix('$') {
        if !rest.starts_with('[') {
            return Err(malformed(expr, "functions and variables are not supported"));
        }
        rest
    } else {
        trimmed
    };

    let chars: Vec<char> = body.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;
    // a name is expected at the start and after every '.'
    let mut expect_name = !body.is_empty() && !body.starts_with('[');

    while i < chars.len() {
        match chars[i] {
            '.' => {
                if expect_name || segments.is_empty() {
                    return Err(malformed(expr, "empty path segment"));
                }
                expect_name = true;
                i += 1;
            }
            '[' => {
                if expect_name {
                    return Err(malformed(expr, "empty path segment"));
                }
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .ok_or_else(|| malformed(expr, "unterminated '['"))?;
                let inner: String = chars[i + 1..i + close].iter().collect();
                let inner = inner.trim();
                if inner == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    let index = inner
                        .parse::<i64>()
                        .map_err(|_| malformed(expr, format!("invalid index '{}'", inner)))?;
                    segments.push(Segment::Index(index));
                }
                i += close + 1;
            }
            '`' => {
                let close = chars[i + 1..]
                    .iter()
                    .position(|c| *c == '`')
                    .ok_or_else(|| malformed(expr, "unterminated '`'"))?;
                let name: String = chars[i + 1..i + 1 + close].iter().collect();
                segments.push(Segment::Field(name));
                expect_name = false;
                i += close + 2;
            }
            _ => {
                let start = i;
                while i < chars.len() && !matches!(chars[i], '.' | '[' | '`') {
                    if RESERVED.contains(&chars[i]) {
                        return Err(malformed(
                            expr,
                            format!("unsupported character '{}'", chars[i]),
                        ));
                    }
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                if name == "*" {
                    segments.push(Segment::Wildcard);
                } else {
                    segments.push(Segment::Field(name));
                }
                expect_name = false;
            }
        }
    }
    if expect_name {
        return Err(malformed(expr, "trailing '.'"));
    }
    Ok(segments)
}

fn resolve_index(index: i64, len: usize) -> Option<usize> {
    let len = len as i64;
    let resolved = if index < 0 { len + index } else { index };
    if resolved >= 0 && resolved < len {
        Some(resolved as usize)
    } else {
        None
    }
}

/// Evaluate a source path.
///
/// Returns `Ok(None)` when the path selects nothing. A name mapped over an
/// array, or a `[*]` projection, yields an array of the selected values.
pub fn evaluate(data: &Value, expr: &str) -> Result<Option<Value>, PathError> {
    let segments = parse(expr)?;
    let mut current: Vec<&Value> = vec![data];
    let mut sequence = false;

    for segment in &segments {
        let mut next = Vec::new();
        match segment {
            Segment::Field(name) => {
                for value in current {
                    match value {
                        Value::Object(map) => {
                            if let Some(found) = map.get(name) {
                                push_flattened(&mut next, found, sequence);
                            }
                        }
                        Value::Array(items) => {
                            sequence = true;
                            for item in items {
                                if let Some(found) = item.as_object().and_then(|m| m.get(name)) {
                                    push_flattened(&mut next, found, true);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            Segment::Index(index) => {
                if sequence {
                    if let Some(i) = resolve_index(*index, current.len()) {
                        next.push(current[i]);
                    }
                    sequence = false;
                } else {
                    for value in current {
                        if let Value::Array(items) = value {
                            if let Some(i) = resolve_index(*index, items.len()) {
                                next.push(&items[i]);
                            }
                        } else if *index == 0 || *index == -1 {
                            next.push(value);
                        }
                    }
                }
            }
            Segment::Wildcard => {
                sequence = true;
                for value in current {
                    match value {
                        Value::Array(items) => next.extend(items.iter()),
                        Value::Object(map) => next.extend(map.values()),
                        _ => {}
                    }
                }
            }
        }
        current = next;
        if current.is_empty() {
            return Ok(None);
        }
    }

    if sequence || current.len() > 1 {
        Ok(Some(Value::Array(current.into_iter().cloned().collect())))
    } else {
        Ok(current.into_iter().next().cloned())
    }
}

fn push_flattened<'a>(next: &mut Vec<&'a Value>, found: &'a Value, flatten: bool) {
    match found {
        Value::Array(items) if flatten => next.extend(items.iter()),
        other => next.push(other),
    }
}

/// Whether the path selects a value, an explicit `null` counts as present.
pub fn exists(data: &Value, expr: &str) -> bool {
    matches!(evaluate(data, expr), Ok(Some(_)))
}

/// Assign `value` at a target path.
///
/// Without `create_missing` every intermediate container must already exist.
pub fn set_path(target: &mut Value, path: &str, value: Value, create_missing: bool) -> Result<(), PathError> {
    let segments = parse(path)?;
    let Some((last, parents)) = segments.split_last() else {
        *target = value;
        return Ok(());
    };

    let mut current = target;
    for segment in parents {
        current = if create_missing {
            child_or_create(current, segment, path)?
        } else {
            child_mut(current, segment, path)?.ok_or_else(|| PathError::MissingParent {
                path: path.to_string(),
            })?
        };
    }

    if create_missing && current.is_null() {
        *current = Value::Object(Map::new());
    }
    match (last, current) {
        (Segment::Field(name), Value::Object(map)) => {
            map.insert(name.clone(), value);
            Ok(())
        }
        (Segment::Index(index), Value::Array(items)) => {
            if let Some(i) = resolve_index(*index, items.len()) {
                items[i] = value;
                Ok(())
            } else if create_missing && *index as usize == items.len() {
                items.push(value);
                Ok(())
            } else {
                Err(PathError::MissingParent {
                    path: path.to_string(),
                })
            }
        }
        (Segment::Wildcard, _) => Err(malformed(path, "'*' is not allowed in a target path")),
        _ => Err(PathError::NotContainer {
            path: path.to_string(),
        }),
    }
}

/// Remove the value at a target path. Returns whether anything was removed.
pub fn remove_path(target: &mut Value, path: &str) -> Result<bool, PathError> {
    let segments = parse(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Ok(false);
    };
    let mut current = target;
    for segment in parents {
        match child_mut(current, segment, path)? {
            Some(child) => current = child,
            None => return Ok(false),
        }
    }
    let removed = match (last, current) {
        (Segment::Field(name), Value::Object(map)) => map.remove(name).is_some(),
        (Segment::Index(index), Value::Array(items)) => match resolve_index(*index, items.len()) {
            Some(i) => {
                items.remove(i);
                true
            }
            None => false,
        },
        _ => false,
    };
    Ok(removed)
}

fn child_mut<'a>(current: &'a mut Value, segment: &Segment, path: &str) -> Result<Option<&'a mut Value>, PathError> {
    match segment {
        Segment::Field(name) => Ok(current.as_object_mut().and_then(|m| m.get_mut(name))),
        Segment::Index(index) => Ok(current.as_array_mut().and_then(|items| {
            let i = resolve_index(*index, items.len())?;
            items.get_mut(i)
        })),
        Segment::Wildcard => Err(malformed(path, "'*' is not allowed in a target path")),
    }
}

fn child_or_create<'a>(current: &'a mut Value, segment: &Segment, path: &str) -> Result<&'a mut Value, PathError> {
    match segment {
        Segment::Field(name) => {
            if current.is_null() {
                *current = Value::Object(Map::new());
            }
            match current {
                Value::Object(map) => Ok(map
                    .entry(name.clone())
                    .or_insert_with(|| Value::Object(Map::new()))),
                _ => Err(PathError::NotContainer {
                    path: path.to_string(),
                }),
            }
        }
        Segment::Index(index) => match current {
            Value::Array(items) => {
                let i = resolve_index(*index, items.len()).ok_or_else(|| PathError::MissingParent {
                    path: path.to_string(),
                })?;
                Ok(&mut items[i])
            }
            _ => Err(PathError::NotContainer {
                path: path.to_string(),
            }),
        },
        Segment::Wildcard => Err(malformed(path, "'*' is not allowed in a target path")),
    }
}
