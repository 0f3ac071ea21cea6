//! Dotted-path / `[index]` access into a `serde_json::Value`. This is the
//! thin bridge the record engine needs on top of plain JSON values.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Key(String),
    Index(usize),
}

fn parse_path(path: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    for dotted in path.split('.') {
        if dotted.is_empty() {
            continue;
        }
        let mut rest = dotted;
        if let Some(bracket) = rest.find('[') {
            let key = &rest[..bracket];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            rest = &rest[bracket..];
            while let Some(stripped) = rest.strip_prefix('[') {
                if let Some(end) = stripped.find(']') {
                    if let Ok(idx) = stripped[..end].parse::<usize>() {
                        segments.push(Segment::Index(idx));
                    }
                    rest = &stripped[end + 1..];
                } else {
                    break;
                }
            }
        } else {
            segments.push(Segment::Key(rest.to_string()));
        }
    }
    segments
}

/// Looks up the value at `path`. Callers that need a deep copy clone the
/// result themselves.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    let segments = parse_path(path);
    let mut current = root;
    for seg in segments {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => map.get(&k)?,
            (Segment::Index(i), Value::Array(arr)) => arr.get(i)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets `value` at `path`, creating intermediate objects (or arrays, for
/// index segments) as needed.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    if path.is_empty() {
        *root = value;
        return;
    }
    let segments = parse_path(path);
    set_recursive(root, &segments, value);
}

fn set_recursive(current: &mut Value, segments: &[Segment], value: Value) {
    let Some((head, tail)) = segments.split_first() else {
        *current = value;
        return;
    };
    match head {
        Segment::Key(k) => {
            if !current.is_object() {
                *current = Value::Object(Map::new());
            }
            let map = current.as_object_mut().unwrap();
            let entry = map.entry(k.clone()).or_insert_with(|| default_for(tail));
            set_recursive(entry, tail, value);
        }
        Segment::Index(i) => {
            if !current.is_array() {
                *current = Value::Array(Vec::new());
            }
            let arr = current.as_array_mut().unwrap();
            if arr.len() <= *i {
                arr.resize(*i + 1, Value::Null);
            }
            set_recursive(&mut arr[*i], tail, value);
        }
    }
}

fn default_for(remaining: &[Segment]) -> Value {
    match remaining.first() {
        Some(Segment::Index(_)) => Value::Array(Vec::new()),
        Some(Segment::Key(_)) => Value::Object(Map::new()),
        None => Value::Null,
    }
}

/// Deletes whatever sits at `path`, if anything. Used for `"U"`-typed
/// (undefined) patch payloads on record updates.
pub fn delete_path(root: &mut Value, path: &str) {
    let segments = parse_path(path);
    let Some((last, init)) = segments.split_last() else {
        return;
    };
    let mut current = root;
    for seg in init {
        current = match (seg, current) {
            (Segment::Key(k), Value::Object(map)) => match map.get_mut(k) {
                Some(v) => v,
                None => return,
            },
            (Segment::Index(i), Value::Array(arr)) => match arr.get_mut(*i) {
                Some(v) => v,
                None => return,
            },
            _ => return,
        };
    }
    match (last, current) {
        (Segment::Key(k), Value::Object(map)) => {
            map.remove(k);
        }
        (Segment::Index(i), Value::Array(arr)) => {
            if *i < arr.len() {
                arr.remove(*i);
            }
        }
        _ => {}
    }
}
