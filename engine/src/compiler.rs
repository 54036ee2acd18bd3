//! Filter and sort compilation.
//!
//! The [`QueryCompiler`] turns a [`Filter`] into a [`Predicate`] and a sort
//! order into a [`Comparator`]. Field paths and regular expressions are built
//! once at compile time; the returned closures only evaluate.
//!
//! # Matching rules
//!
//! - `string`, `containsString`, `like` and `stringMap` compare text
//!   case-insensitively unless [`CompileOptions::case_sensitive`] is set.
//! - `like` maps `%` to "anything" and must match the whole field value.
//! - `string`, `containsString` and `like` accept array-valued fields when any
//!   element matches.
//! - Range filters fail for falsy field values. Absent bounds are unbounded and
//!   `min == max` is an equality test.
//! - Enum filters without a value list match falsy fields only.
//!
//! # Sorting rules
//!
//! Keys are compared in order and the first difference decides. Absent and
//! `null` values sort before everything else. Arrays compare element by
//! element, a scalar behaving like a one-element array.

use crate::filter::{DateBound, Filter, LogicalOperator};
use crate::path::FieldPath;
use crate::record::is_truthy;
use crate::sort::SortField;
use crate::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde_json::Value;
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// A compiled filter.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A compiled sort order.
pub type Comparator = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// Options affecting compilation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOptions {
    /// Compare text case-sensitively
    pub case_sensitive: bool,
}

/// Compiles filters and sort orders into closures.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryCompiler {
    options: CompileOptions,
}

impl QueryCompiler {
    /// Create a compiler with the given options.
    pub fn new(options: CompileOptions) -> Self {
        Self { options }
    }

    /// The options this compiler applies.
    pub fn options(&self) -> CompileOptions {
        self.options
    }

    /// Compile a filter from its JSON description.
    pub fn compile_filter_json(&self, filter: &Value) -> Result<Predicate> {
        self.compile_filter(&Filter::from_json(filter)?)
    }

    /// Compile a filter into a predicate.
    pub fn compile_filter(&self, filter: &Filter) -> Result<Predicate> {
        let case_sensitive = self.options.case_sensitive;

        match filter {
            Filter::LogOp { operation, filters } => {
                let children = filters
                    .iter()
                    .map(|f| self.compile_filter(f))
                    .collect::<Result<Vec<_>>>()?;
                let operation = *operation;
                Ok(Arc::new(move |record: &Value| {
                    let all = || children.iter().all(|p| p(record));
                    let any = || children.iter().any(|p| p(record));
                    match operation {
                        LogicalOperator::And => all(),
                        LogicalOperator::Or => any(),
                        LogicalOperator::Nand => !all(),
                        LogicalOperator::Nor => !any(),
                    }
                }))
            }

            Filter::Boolean { field_name, value } => {
                let path = FieldPath::parse(field_name)?;
                let expected = *value;
                Ok(Arc::new(move |record: &Value| {
                    is_truthy(path.evaluate(record).as_deref()) == expected
                }))
            }

            Filter::String { field_name, value } => {
                let path = FieldPath::parse(field_name)?;
                match value {
                    Some(value) => {
                        let re = anchored(&regex::escape(value), case_sensitive)?;
                        Ok(text_predicate(path, re))
                    }
                    None => Ok(falsy_predicate(path)),
                }
            }

            Filter::ContainsString {
                field_name,
                contains,
            } => {
                let path = FieldPath::parse(field_name)?;
                let re = build_regex(&regex::escape(contains), case_sensitive)?;
                Ok(text_predicate(path, re))
            }

            Filter::Like { field_name, like } => {
                let path = FieldPath::parse(field_name)?;
                let pattern = like
                    .split('%')
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(".*");
                let re = anchored(&pattern, case_sensitive)?;
                Ok(text_predicate(path, re))
            }

            Filter::StringMap {
                field_name,
                key,
                value,
            } => {
                let path = FieldPath::parse(field_name)?;
                let key = key.clone();
                match value {
                    Some(value) => {
                        let re = anchored(&regex::escape(value), case_sensitive)?;
                        Ok(Arc::new(move |record: &Value| {
                            path.evaluate(record)
                                .and_then(|map| map.get(key.as_str()).and_then(scalar_text_owned))
                                .map(|text| re.is_match(&text))
                                .unwrap_or(false)
                        }))
                    }
                    None => Ok(Arc::new(move |record: &Value| {
                        let field = path.evaluate(record);
                        !is_truthy(field.as_deref().and_then(|map| map.get(key.as_str())))
                    })),
                }
            }

            Filter::StringEnum { field_name, values } => {
                let path = FieldPath::parse(field_name)?;
                match values {
                    Some(values) => {
                        let fold = move |s: &str| {
                            if case_sensitive {
                                s.to_string()
                            } else {
                                s.to_lowercase()
                            }
                        };
                        let members: HashSet<String> = values.iter().map(|v| fold(v)).collect();
                        Ok(Arc::new(move |record: &Value| {
                            path.evaluate(record)
                                .as_deref()
                                .and_then(scalar_text)
                                .map(|text| members.contains(&fold(&text)))
                                .unwrap_or(false)
                        }))
                    }
                    None => Ok(falsy_predicate(path)),
                }
            }

            Filter::LongEnum { field_name, values } => {
                let path = FieldPath::parse(field_name)?;
                match values {
                    Some(values) => {
                        let members: HashSet<i64> = values.iter().copied().collect();
                        Ok(Arc::new(move |record: &Value| {
                            path.evaluate(record)
                                .as_deref()
                                .and_then(as_integer)
                                .map(|n| members.contains(&n))
                                .unwrap_or(false)
                        }))
                    }
                    None => Ok(falsy_predicate(path)),
                }
            }

            Filter::StringRange {
                field_name,
                min,
                max,
            } => {
                let path = FieldPath::parse(field_name)?;
                let range = Range::new(min.clone(), max.clone());
                Ok(Arc::new(move |record: &Value| {
                    let field = path.evaluate(record);
                    if !is_truthy(field.as_deref()) {
                        return false;
                    }
                    field
                        .as_deref()
                        .and_then(scalar_text)
                        .map(|text| range.contains(&text.into_owned()))
                        .unwrap_or(false)
                }))
            }

            Filter::LongRange {
                field_name,
                min,
                max,
            } => {
                let path = FieldPath::parse(field_name)?;
                let range = Range::new(min.map(|v| v as f64), max.map(|v| v as f64));
                Ok(numeric_range_predicate(path, range))
            }

            Filter::DoubleRange {
                field_name,
                min,
                max,
            } => {
                let path = FieldPath::parse(field_name)?;
                Ok(numeric_range_predicate(path, Range::new(*min, *max)))
            }

            Filter::DateRange {
                field_name,
                min,
                max,
            } => {
                let path = FieldPath::parse(field_name)?;
                let min = min.as_ref().map(bound_millis).transpose()?;
                let max = max.as_ref().map(bound_millis).transpose()?;
                let range = Range::new(min, max);
                Ok(Arc::new(move |record: &Value| {
                    let field = path.evaluate(record);
                    if !is_truthy(field.as_deref()) {
                        return false;
                    }
                    field
                        .as_deref()
                        .and_then(value_millis)
                        .map(|millis| range.contains(&millis))
                        .unwrap_or(false)
                }))
            }

            Filter::Null {
                field_name,
                is_null,
            } => {
                let path = FieldPath::parse(field_name)?;
                let expected = *is_null;
                Ok(Arc::new(move |record: &Value| {
                    let null = matches!(path.evaluate(record).as_deref(), None | Some(Value::Null));
                    null == expected
                }))
            }
        }
    }

    /// Compile a sort order into a comparator.
    pub fn compile_sort(&self, order: &[SortField]) -> Result<Comparator> {
        let keys = order
            .iter()
            .map(|field| Ok((FieldPath::parse(&field.field_path)?, field.ascending)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Arc::new(move |a: &Value, b: &Value| {
            for (path, ascending) in &keys {
                let left = path.evaluate(a);
                let right = path.evaluate(b);
                let ordering = compare_values(left.as_deref(), right.as_deref());
                if ordering != Ordering::Equal {
                    return if *ascending {
                        ordering
                    } else {
                        ordering.reverse()
                    };
                }
            }
            Ordering::Equal
        }))
    }
}

/// Total order over optional JSON values used by compiled comparators.
pub fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    let a = a.filter(|v| !v.is_null());
    let b = b.filter(|v| !v.is_null());

    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) if a.is_array() || b.is_array() => {
            let left = as_elements(a);
            let right = as_elements(b);
            for i in 0..left.len().max(right.len()) {
                let ordering = compare_values(left.get(i).copied(), right.get(i).copied());
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        }
        (Some(a), Some(b)) => compare_scalars(a, b),
    }
}

fn as_elements(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_scalars(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Object(_), Value::Object(_)) => Ordering::Equal,
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Inclusive range; `min == max` degenerates to equality.
struct Range<T> {
    min: Option<T>,
    max: Option<T>,
}

impl<T: PartialOrd> Range<T> {
    fn new(min: Option<T>, max: Option<T>) -> Self {
        Self { min, max }
    }

    fn contains(&self, value: &T) -> bool {
        match (&self.min, &self.max) {
            (Some(min), Some(max)) if min == max => value == min,
            (min, max) => {
                min.as_ref().map(|min| value >= min).unwrap_or(true)
                    && max.as_ref().map(|max| value <= max).unwrap_or(true)
            }
        }
    }
}

fn build_regex(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(!case_sensitive)
        .build()
        .map_err(|e| Error::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
}

fn anchored(pattern: &str, case_sensitive: bool) -> Result<Regex> {
    build_regex(&format!("^(?s:{})$", pattern), case_sensitive)
}

/// Text form of a scalar; `None` for null, arrays and objects.
fn scalar_text(value: &Value) -> Option<Cow<'_, str>> {
    match value {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Number(n) => Some(Cow::Owned(n.to_string())),
        Value::Bool(b) => Some(Cow::Owned(b.to_string())),
        _ => None,
    }
}

fn scalar_text_owned(value: &Value) -> Option<String> {
    scalar_text(value).map(Cow::into_owned)
}

fn text_predicate(path: FieldPath, re: Regex) -> Predicate {
    Arc::new(move |record: &Value| {
        let matches = |v: &Value| scalar_text(v).map(|t| re.is_match(&t)).unwrap_or(false);
        match path.evaluate(record).as_deref() {
            Some(Value::Array(items)) => items.iter().any(matches),
            Some(value) => matches(value),
            None => false,
        }
    })
}

fn falsy_predicate(path: FieldPath) -> Predicate {
    Arc::new(move |record: &Value| !is_truthy(path.evaluate(record).as_deref()))
}

fn numeric_range_predicate(path: FieldPath, range: Range<f64>) -> Predicate {
    Arc::new(move |record: &Value| {
        let field = path.evaluate(record);
        if !is_truthy(field.as_deref()) {
            return false;
        }
        field
            .as_deref()
            .and_then(as_number)
            .map(|n| range.contains(&n))
            .unwrap_or(false)
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn parse_date_millis(text: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn bound_millis(bound: &DateBound) -> Result<i64> {
    match bound {
        DateBound::Millis(millis) => Ok(*millis),
        DateBound::Text(text) => parse_date_millis(text)
            .ok_or_else(|| Error::InvalidFilter(format!("invalid date bound '{}'", text))),
    }
}

fn value_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => parse_date_millis(s),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sort::parse_sort_order;
    use serde_json::json;

    fn compile(filter: Value) -> Predicate {
        QueryCompiler::default().compile_filter_json(&filter).unwrap()
    }

    #[test]
    fn string_filter_is_case_insensitive_by_default() {
        let p = compile(json!({"type": "string", "fieldName": "name", "value": "alice"}));
        assert!(p(&json!({"name": "Alice"})));
        assert!(!p(&json!({"name": "Alice B"})));
        assert!(!p(&json!({})));

        let strict = QueryCompiler::new(CompileOptions {
            case_sensitive: true,
        })
        .compile_filter(&Filter::string("name", "alice"))
        .unwrap();
        assert!(!strict(&json!({"name": "Alice"})));
        assert!(strict(&json!({"name": "alice"})));
    }

    #[test]
    fn string_filter_escapes_regex_syntax() {
        let p = compile(json!({"type": "string", "fieldName": "v", "value": "a.b*"}));
        assert!(p(&json!({"v": "a.b*"})));
        assert!(!p(&json!({"v": "axbbb"})));
    }

    #[test]
    fn string_filter_without_value_matches_falsy() {
        let p = compile(json!({"type": "string", "fieldName": "name"}));
        assert!(p(&json!({"name": ""})));
        assert!(p(&json!({})));
        assert!(!p(&json!({"name": "x"})));
    }

    #[test]
    fn like_anchors_whole_value() {
        let p = compile(json!({"type": "like", "fieldName": "title", "like": "re%port"}));
        assert!(p(&json!({"title": "Report"})));
        assert!(p(&json!({"title": "re-sport"})));
        assert!(!p(&json!({"title": "a report"})));
        assert!(!p(&json!({"title": "reports!"})));

        let p = compile(json!({"type": "like", "fieldName": "title", "like": "%port%"}));
        assert!(p(&json!({"title": "a report here"})));
    }

    #[test]
    fn array_fields_match_any_element() {
        let p = compile(json!({"type": "containsString", "fieldName": "tags", "contains": "RUS"}));
        assert!(p(&json!({"tags": ["go", "rust"]})));
        assert!(!p(&json!({"tags": ["go", "zig"]})));
        assert!(!p(&json!({"tags": []})));

        let p = compile(json!({"type": "string", "fieldName": "tags", "value": "go"}));
        assert!(p(&json!({"tags": ["go", "rust"]})));
    }

    #[test]
    fn range_filters() {
        let p = compile(json!({"type": "longRange", "fieldName": "n", "min": 2, "max": 5}));
        assert!(p(&json!({"n": 2})));
        assert!(p(&json!({"n": 5})));
        assert!(!p(&json!({"n": 6})));
        assert!(!p(&json!({"n": 1})));
        assert!(!p(&json!({})));

        // Falsy values fail even when inside the range.
        let p = compile(json!({"type": "longRange", "fieldName": "n", "min": -5}));
        assert!(!p(&json!({"n": 0})));
        assert!(p(&json!({"n": 100})));

        let p = compile(json!({"type": "doubleRange", "fieldName": "x", "min": 1.5, "max": 1.5}));
        assert!(p(&json!({"x": 1.5})));
        assert!(!p(&json!({"x": 1.6})));

        let p = compile(json!({"type": "stringRange", "fieldName": "s", "min": "b", "max": "d"}));
        assert!(p(&json!({"s": "c"})));
        assert!(!p(&json!({"s": "e"})));
        assert!(!p(&json!({"s": ""})));
    }

    #[test]
    fn date_range_accepts_text_and_millis() {
        let p = compile(json!({
            "type": "dateRange", "fieldName": "at",
            "min": "2024-01-01", "max": "2024-12-31T23:59:59Z"
        }));
        assert!(p(&json!({"at": "2024-06-01T12:00:00Z"})));
        assert!(p(&json!({"at": 1717243200000i64})));
        assert!(!p(&json!({"at": "2025-01-02"})));

        let err = QueryCompiler::default()
            .compile_filter_json(&json!({"type": "dateRange", "fieldName": "at", "min": "soon"}))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidFilter(_)));
    }

    #[test]
    fn enum_filters() {
        let p = compile(json!({"type": "stringEnum", "fieldName": "s", "values": ["Open", "closed"]}));
        assert!(p(&json!({"s": "open"})));
        assert!(p(&json!({"s": "CLOSED"})));
        assert!(!p(&json!({"s": "pending"})));

        let p = compile(json!({"type": "longEnum", "fieldName": "n", "values": [1, 3]}));
        assert!(p(&json!({"n": 3})));
        assert!(p(&json!({"n": 3.0})));
        assert!(!p(&json!({"n": 2})));

        let p = compile(json!({"type": "longEnum", "fieldName": "n"}));
        assert!(p(&json!({"n": 0})));
        assert!(!p(&json!({"n": 2})));
    }

    #[test]
    fn string_map_and_boolean() {
        let p = compile(json!({"type": "stringMap", "fieldName": "labels", "key": "env", "value": "PROD"}));
        assert!(p(&json!({"labels": {"env": "prod"}})));
        assert!(!p(&json!({"labels": {"env": "dev"}})));
        assert!(!p(&json!({"labels": "prod"})));

        let p = compile(json!({"type": "boolean", "fieldName": "done", "value": false}));
        assert!(p(&json!({"done": false})));
        assert!(p(&json!({})));
        assert!(!p(&json!({"done": true})));
    }

    #[test]
    fn null_filter_polarity() {
        let p = compile(json!({"type": "null", "fieldName": "owner", "isNull": true}));
        assert!(p(&json!({})));
        assert!(p(&json!({"owner": null})));
        assert!(!p(&json!({"owner": ""})));

        let p = compile(json!({"type": "null", "fieldName": "owner", "isNull": false}));
        assert!(p(&json!({"owner": 0})));
        assert!(!p(&json!({"owner": null})));
    }

    #[test]
    fn logical_operators() {
        let a = json!({"type": "string", "fieldName": "a", "value": "1"});
        let b = json!({"type": "string", "fieldName": "b", "value": "1"});
        let record = json!({"a": "1", "b": "2"});

        let op = |name: &str| compile(json!({"type": "logOp", "operation": name, "filters": [a, b]}));
        assert!(!op("and")(&record));
        assert!(op("or")(&record));
        assert!(op("nand")(&record));
        assert!(!op("nor")(&record));

        let empty_and = compile(json!({"type": "logOp", "operation": "and", "filters": []}));
        assert!(empty_and(&record));
    }

    #[test]
    fn nested_field_paths() {
        let p = compile(json!({"type": "string", "fieldName": "address.city", "value": "oslo"}));
        assert!(p(&json!({"address": {"city": "Oslo"}})));
        assert!(!p(&json!({"address": {"town": "Oslo"}})));
    }

    #[test]
    fn sort_compares_keys_in_order() {
        let cmp = QueryCompiler::default()
            .compile_sort(&parse_sort_order(&["+last", "-age"]).unwrap())
            .unwrap();

        let a = json!({"last": "Doe", "age": 30});
        let b = json!({"last": "Doe", "age": 40});
        let c = json!({"last": "Adams", "age": 10});

        assert_eq!(cmp(&a, &b), Ordering::Greater);
        assert_eq!(cmp(&c, &a), Ordering::Less);
        assert_eq!(cmp(&a, &a), Ordering::Equal);
    }

    #[test]
    fn nulls_sort_first_and_arrays_elementwise() {
        assert_eq!(compare_values(None, Some(&json!(1))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(null)), Some(&json!("a"))), Ordering::Less);
        assert_eq!(compare_values(Some(&json!(null)), None), Ordering::Equal);
        assert_eq!(
            compare_values(Some(&json!([1, 2])), Some(&json!([1, 3]))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!([1, 2])), Some(&json!([1]))),
            Ordering::Greater
        );
        assert_eq!(compare_values(Some(&json!(1)), Some(&json!([1]))), Ordering::Equal);
        assert_eq!(compare_values(Some(&json!(2.5)), Some(&json!(10))), Ordering::Less);
    }

    #[test]
    fn invalid_paths_fail_compilation() {
        let err = QueryCompiler::default()
            .compile_filter_json(&json!({"type": "string", "fieldName": "a[", "value": "x"}))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidPath { .. }));
    }
}
