use serde_json::{Map, Value};
use std::fmt;

/// A fixed key path into a loosely typed JSON document.
///
/// Hub events and coordinator data are both free-form trees; every field the
/// display reads or writes is named by one of these instead of ad-hoc
/// `get(..).and_then(..)` chains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValuePath(&'static [&'static str]);

impl ValuePath {
    pub const fn new(segments: &'static [&'static str]) -> Self {
        Self(segments)
    }

    /// Walks the path and returns the value at its end. `null` is reported as
    /// absent, same as a missing key.
    pub fn lookup<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in self.0 {
            current = current.as_object()?.get(*segment)?;
        }
        if current.is_null() {
            None
        } else {
            Some(current)
        }
    }

    pub fn lookup_str<'a>(&self, root: &'a Value) -> Option<&'a str> {
        self.lookup(root).and_then(Value::as_str)
    }

    /// Like [`lookup`](Self::lookup) but renders any present scalar as text.
    pub fn lookup_text(&self, root: &Value) -> Option<String> {
        self.lookup(root).map(|value| match value {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
    }

    /// Writes `value` at the end of the path, creating (or replacing with)
    /// objects for every intermediate segment. An empty path replaces `root`.
    pub fn insert(&self, root: &mut Value, value: Value) {
        insert_at(root, self.0, value);
    }
}

fn insert_at(node: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *node = value;
        return;
    };
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert_at(child, rest, value);
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}
