//! Parameter substitution: `${ref.path}` tokens resolved against prior
//! tasks' results within the same workflow.
//!
//! Grounded on the dot-path extraction logic of the original dependency
//! resolver component, with one deliberate divergence: a missing reference
//! is a hard error here rather than a logged warning that silently leaves
//! the placeholder text in place.

use std::collections::HashMap;

use serde_json::Value;
use snafu::Snafu;
use uuid::Uuid;

#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display("substitution reference not found: {path}"))]
    SubstitutionError { path: String },

    #[snafu(display("substitution reference '{reference}' is not in the task's dependency set"))]
    UndeclaredReference { reference: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<Segment> {
    path.split('.')
        .map(|segment| match segment.parse::<usize>() {
            Ok(index) => Segment::Index(index),
            Err(_) => Segment::Key(segment.to_string()),
        })
        .collect()
}

/// Finds the next `${...}` token in `s` starting at or after `from`.
/// Returns `(start, end, ref_text)` where `end` is one past the closing `}`.
fn find_token(s: &str, from: usize) -> Option<(usize, usize, &str)> {
    let bytes = s.as_bytes();
    let mut i = from;
    while i + 1 < s.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            if let Some(rel_end) = s[i + 2..].find('}') {
                let end = i + 2 + rel_end + 1;
                return Some((i, end, &s[i + 2..i + 2 + rel_end]));
            }
            return None;
        }
        i += 1;
    }
    None
}

fn extract(value: &Value, segments: &[Segment], full_path: &str) -> Result<Value> {
    let mut current = value.clone();
    for segment in segments {
        current = match (segment, &current) {
            (Segment::Key(key), Value::Object(map)) => map
                .get(key)
                .cloned()
                .ok_or_else(|| Error::SubstitutionError {
                    path: full_path.to_string(),
                })?,
            (Segment::Index(idx), Value::Array(arr)) => arr
                .get(*idx)
                .cloned()
                .ok_or_else(|| Error::SubstitutionError {
                    path: full_path.to_string(),
                })?,
            _ => {
                return Err(Error::SubstitutionError {
                    path: full_path.to_string(),
                })
            }
        };
    }
    Ok(current)
}

fn canonical_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves all `${ref.path}` tokens in `value` against `results`, a map
/// from task name/id to that task's stored JSON result. `declared_refs` is
/// the set of reference keys (names/ids) the task statically declared as
/// dependencies; any token referencing something outside that set is an
/// `UndeclaredReference` (a static error that should be caught at
/// submission time).
pub fn substitute(
    value: &Value,
    results: &HashMap<String, Value>,
    declared_refs: &[String],
) -> Result<Value> {
    match value {
        Value::String(s) => substitute_string(s, results, declared_refs),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, results, declared_refs)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(substitute(item, results, declared_refs)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_string(
    s: &str,
    results: &HashMap<String, Value>,
    declared_refs: &[String],
) -> Result<Value> {
    let Some((start, end, token_ref)) = find_token(s, 0) else {
        return Ok(Value::String(s.to_string()));
    };

    let whole_string_is_one_token = start == 0 && end == s.len();
    let resolved = resolve_reference(token_ref, results, declared_refs)?;

    if whole_string_is_one_token {
        // No further token can follow; preserve the resolved value's type.
        return Ok(resolved);
    }

    let mut out = String::new();
    out.push_str(&s[..start]);
    out.push_str(&canonical_string(&resolved));

    let mut cursor = end;
    loop {
        match find_token(s, cursor) {
            Some((next_start, next_end, next_ref)) => {
                out.push_str(&s[cursor..next_start]);
                let value = resolve_reference(next_ref, results, declared_refs)?;
                out.push_str(&canonical_string(&value));
                cursor = next_end;
            }
            None => {
                out.push_str(&s[cursor..]);
                break;
            }
        }
    }

    Ok(Value::String(out))
}

fn resolve_reference(
    token_ref: &str,
    results: &HashMap<String, Value>,
    declared_refs: &[String],
) -> Result<Value> {
    let mut parts = token_ref.splitn(2, '.');
    let key = parts.next().unwrap_or_default();
    let rest = parts.next().unwrap_or_default();

    if !declared_refs.iter().any(|r| r == key) {
        return Err(Error::UndeclaredReference {
            reference: key.to_string(),
        });
    }

    let base = results
        .get(key)
        .ok_or_else(|| Error::SubstitutionError {
            path: token_ref.to_string(),
        })?;

    if rest.is_empty() {
        return Ok(base.clone());
    }

    let segments = parse_path(rest);
    extract(base, &segments, token_ref)
}

/// Collects the declared-dependency key (the part before the first `.`) for
/// every `${ref.path}` token appearing anywhere in `value`'s string leaves.
/// Used at submission time to check that a task only references keys within
/// its own declared dependency set.
#[must_use]
pub fn referenced_keys(value: &Value) -> Vec<String> {
    let mut out = Vec::new();
    collect_referenced_keys(value, &mut out);
    out
}

fn collect_referenced_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            let mut cursor = 0;
            while let Some((_, end, token_ref)) = find_token(s, cursor) {
                let key = token_ref.splitn(2, '.').next().unwrap_or_default();
                out.push(key.to_string());
                cursor = end;
            }
        }
        Value::Object(map) => map.values().for_each(|v| collect_referenced_keys(v, out)),
        Value::Array(items) => items.iter().for_each(|v| collect_referenced_keys(v, out)),
        _ => {}
    }
}

/// Tracks per-task pending-dependency counts for readiness (the other half
/// shared with `queue::TaskQueue::mark_completed`/`mark_failed`,
/// which already implement the decrement-and-check logic over task ids).
/// This helper resolves dependency *references* (name-or-id strings as they
/// appear in `Task::dependencies`) to concrete task ids within a workflow.
#[must_use]
pub fn resolve_dependency_ids(
    dependencies: &[String],
    name_to_id: &HashMap<String, Uuid>,
) -> Option<Vec<Uuid>> {
    dependencies
        .iter()
        .map(|reference| {
            Uuid::parse_str(reference)
                .ok()
                .or_else(|| name_to_id.get(reference).copied())
        })
        .collect()
}
