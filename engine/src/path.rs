//! JSONPath-style field access.
//!
//! A [`FieldPath`] is parsed once and evaluated against many records. Plain
//! attribute names take a fast path that is a single map lookup; everything
//! else is walked segment by segment.
//!
//! Supported syntax:
//!
//! - `name`, `$.name`, `a.b.c`
//! - `a[0]`, `a[-1]` (index from the end)
//! - `a['key with spaces']`, `a["key"]`
//! - `a[*]`, `a.*` (all children)
//! - `$..name` (every `name` attribute at any depth)
//!
//! Paths containing a wildcard or recursive descent yield an array of all
//! matches; other paths yield at most one value.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Child(String),
    Index(i64),
    Wildcard,
    Descendant(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathKind {
    Attribute(String),
    Segments { segments: Vec<Segment>, multi: bool },
}

/// A compiled field path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    source: String,
    kind: PathKind,
}

impl FieldPath {
    /// Parse a path expression.
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim();
        if source.is_empty() {
            return Err(invalid(source, "empty path"));
        }

        if is_identifier(source) {
            return Ok(Self {
                source: source.to_string(),
                kind: PathKind::Attribute(source.to_string()),
            });
        }

        let segments = parse_segments(source)?;
        if segments.is_empty() {
            return Err(invalid(source, "path selects the whole record"));
        }

        // `$.name` is just as cheap as `name`.
        if let [Segment::Child(name)] = segments.as_slice() {
            return Ok(Self {
                source: source.to_string(),
                kind: PathKind::Attribute(name.clone()),
            });
        }

        let multi = segments
            .iter()
            .any(|s| matches!(s, Segment::Wildcard | Segment::Descendant(_)));

        Ok(Self {
            source: source.to_string(),
            kind: PathKind::Segments { segments, multi },
        })
    }

    /// The expression this path was parsed from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether this path is a direct attribute lookup.
    pub fn is_attribute(&self) -> bool {
        matches!(self.kind, PathKind::Attribute(_))
    }

    /// The attribute name this path addresses, if it is a direct lookup.
    pub fn attribute_name(&self) -> Option<&str> {
        match &self.kind {
            PathKind::Attribute(name) => Some(name),
            PathKind::Segments { .. } => None,
        }
    }

    /// Evaluate the path against a record.
    ///
    /// Returns `None` when nothing matches.
    pub fn evaluate<'a>(&self, record: &'a Value) -> Option<Cow<'a, Value>> {
        match &self.kind {
            PathKind::Attribute(name) => record.get(name.as_str()).map(Cow::Borrowed),
            PathKind::Segments { segments, multi } => {
                let mut current: Vec<&'a Value> = vec![record];
                for segment in segments {
                    current = step(current, segment);
                    if current.is_empty() {
                        return None;
                    }
                }
                if *multi {
                    Some(Cow::Owned(Value::Array(
                        current.into_iter().cloned().collect(),
                    )))
                } else {
                    current.into_iter().next().map(Cow::Borrowed)
                }
            }
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        FieldPath::parse(&source).map_err(serde::de::Error::custom)
    }
}

fn invalid(path: &str, reason: &str) -> Error {
    Error::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_segments(source: &str) -> Result<Vec<Segment>> {
    let chars: Vec<char> = source.chars().collect();
    let mut segments = Vec::new();
    let mut i = 0;

    if chars.first() == Some(&'$') {
        i = 1;
    } else {
        // A leading bare name behaves like `$.name`.
        let (name, next) = read_name(&chars, 0);
        if name.is_empty() && chars.first() != Some(&'[') {
            return Err(invalid(source, "expected a name"));
        }
        if !name.is_empty() {
            segments.push(Segment::Child(name));
        }
        i = next;
    }

    while i < chars.len() {
        match chars[i] {
            '.' if chars.get(i + 1) == Some(&'.') => {
                let (name, next) = read_name(&chars, i + 2);
                if name.is_empty() {
                    return Err(invalid(source, "expected a name after '..'"));
                }
                segments.push(Segment::Descendant(name));
                i = next;
            }
            '.' if chars.get(i + 1) == Some(&'*') => {
                segments.push(Segment::Wildcard);
                i += 2;
            }
            '.' => {
                let (name, next) = read_name(&chars, i + 1);
                if name.is_empty() {
                    return Err(invalid(source, "expected a name after '.'"));
                }
                segments.push(Segment::Child(name));
                i = next;
            }
            '[' => {
                let close = chars[i..]
                    .iter()
                    .position(|c| *c == ']')
                    .map(|p| p + i)
                    .ok_or_else(|| invalid(source, "unterminated bracket"))?;
                let inner: String = chars[i + 1..close].iter().collect();
                segments.push(parse_bracket(source, inner.trim())?);
                i = close + 1;
            }
            c => {
                return Err(invalid(source, &format!("unexpected character '{}'", c)));
            }
        }
    }

    Ok(segments)
}

fn read_name(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn parse_bracket(source: &str, inner: &str) -> Result<Segment> {
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    let quoted = (inner.starts_with('\'') && inner.ends_with('\''))
        || (inner.starts_with('"') && inner.ends_with('"'));
    if quoted && inner.len() >= 2 {
        return Ok(Segment::Child(inner[1..inner.len() - 1].to_string()));
    }
    inner
        .parse::<i64>()
        .map(Segment::Index)
        .map_err(|_| invalid(source, &format!("invalid subscript '{}'", inner)))
}

fn step<'a>(current: Vec<&'a Value>, segment: &Segment) -> Vec<&'a Value> {
    let mut next = Vec::new();
    for value in current {
        match segment {
            Segment::Child(name) => {
                if let Some(child) = value.get(name.as_str()) {
                    next.push(child);
                }
            }
            Segment::Index(index) => {
                if let Value::Array(items) = value {
                    let len = items.len() as i64;
                    let at = if *index < 0 { len + index } else { *index };
                    if (0..len).contains(&at) {
                        next.push(&items[at as usize]);
                    }
                }
            }
            Segment::Wildcard => match value {
                Value::Array(items) => next.extend(items.iter()),
                Value::Object(map) => next.extend(map.values()),
                _ => {}
            },
            Segment::Descendant(name) => collect_descendants(value, name, &mut next),
        }
    }
    next
}

fn collect_descendants<'a>(value: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
    match value {
        Value::Object(map) => {
            if let Some(hit) = map.get(name) {
                out.push(hit);
            }
            for child in map.values() {
                collect_descendants(child, name, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_descendants(child, name, out);
            }
        }
        _ => {}
    }
}
