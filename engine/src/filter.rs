//! Declarative filter descriptions.
//!
//! Filters use the JSON shape servers accept in query strings:
//!
//! ```json
//! {"type": "logOp", "operation": "and", "filters": [
//!     {"type": "string", "fieldName": "status", "value": "open"},
//!     {"type": "longRange", "fieldName": "priority", "min": 2}
//! ]}
//! ```
//!
//! Every leaf carries a field path expression (see [`crate::path`]).

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical operators combining child filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalOperator {
    And,
    Or,
    Nand,
    Nor,
}

impl std::str::FromStr for LogicalOperator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "and" => Ok(LogicalOperator::And),
            "or" => Ok(LogicalOperator::Or),
            "nand" => Ok(LogicalOperator::Nand),
            "nor" => Ok(LogicalOperator::Nor),
            _ => Err(Error::UnknownOperation(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for LogicalOperator {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let name = std::string::String::deserialize(deserializer)?;
        name.parse().map_err(serde::de::Error::custom)
    }
}

/// Bound of a date range: milliseconds since the epoch or an RFC 3339 string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateBound {
    Millis(i64),
    Text(String),
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Filter {
    /// Combine child filters with a logical operator.
    LogOp {
        operation: LogicalOperator,
        #[serde(default)]
        filters: Vec<Filter>,
    },
    /// Field truthiness equals `value`.
    #[serde(rename_all = "camelCase")]
    Boolean { field_name: String, value: bool },
    /// Field equals `value`. A missing value matches falsy fields.
    #[serde(rename_all = "camelCase")]
    String {
        field_name: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Field contains the given substring.
    #[serde(rename_all = "camelCase")]
    ContainsString { field_name: String, contains: String },
    /// Field matches a `%`-wildcard pattern.
    #[serde(rename_all = "camelCase")]
    Like { field_name: String, like: String },
    /// Field is one of `values`. A missing list matches falsy fields.
    #[serde(rename_all = "camelCase")]
    StringEnum {
        field_name: String,
        #[serde(default)]
        values: Option<Vec<String>>,
    },
    /// Field is one of `values`. A missing list matches falsy fields.
    #[serde(rename_all = "camelCase")]
    LongEnum {
        field_name: String,
        #[serde(default)]
        values: Option<Vec<i64>>,
    },
    #[serde(rename_all = "camelCase")]
    StringRange {
        field_name: String,
        #[serde(default)]
        min: Option<String>,
        #[serde(default)]
        max: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    LongRange {
        field_name: String,
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    #[serde(rename_all = "camelCase")]
    DoubleRange {
        field_name: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    DateRange {
        field_name: String,
        #[serde(default)]
        min: Option<DateBound>,
        #[serde(default)]
        max: Option<DateBound>,
    },
    /// Field is an object whose `key` entry equals `value`.
    #[serde(rename_all = "camelCase")]
    StringMap {
        field_name: String,
        key: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Field is (or is not) null/absent.
    #[serde(rename_all = "camelCase")]
    Null {
        field_name: String,
        #[serde(default = "default_true")]
        is_null: bool,
    },
}

fn default_true() -> bool {
    true
}

const FILTER_TYPES: &[&str] = &[
    "logOp",
    "boolean",
    "string",
    "containsString",
    "like",
    "stringEnum",
    "longEnum",
    "stringRange",
    "longRange",
    "doubleRange",
    "dateRange",
    "stringMap",
    "null",
];

impl Filter {
    /// Parse a filter from its JSON description.
    ///
    /// Unknown `type` or `operation` tags are reported as such rather than as a
    /// generic decoding failure.
    pub fn from_json(value: &Value) -> Result<Self> {
        check_tags(value)?;
        serde_json::from_value(value.clone()).map_err(|e| Error::InvalidFilter(e.to_string()))
    }

    /// Combine two filters with `and`.
    pub fn and(self, other: Filter) -> Filter {
        Filter::LogOp {
            operation: LogicalOperator::And,
            filters: vec![self, other],
        }
    }

    /// Shorthand for a `string` equality filter.
    pub fn string(field_name: impl Into<String>, value: impl Into<String>) -> Filter {
        Filter::String {
            field_name: field_name.into(),
            value: Some(value.into()),
        }
    }

    /// Shorthand for a `longRange` filter.
    pub fn long_range(field_name: impl Into<String>, min: Option<i64>, max: Option<i64>) -> Filter {
        Filter::LongRange {
            field_name: field_name.into(),
            min,
            max,
        }
    }

    /// The field path of a leaf filter.
    pub fn field_name(&self) -> Option<&str> {
        match self {
            Filter::LogOp { .. } => None,
            Filter::Boolean { field_name, .. }
            | Filter::String { field_name, .. }
            | Filter::ContainsString { field_name, .. }
            | Filter::Like { field_name, .. }
            | Filter::StringEnum { field_name, .. }
            | Filter::LongEnum { field_name, .. }
            | Filter::StringRange { field_name, .. }
            | Filter::LongRange { field_name, .. }
            | Filter::DoubleRange { field_name, .. }
            | Filter::DateRange { field_name, .. }
            | Filter::StringMap { field_name, .. }
            | Filter::Null { field_name, .. } => Some(field_name),
        }
    }

    /// Flatten directly nested `and` nodes into their parent.
    pub fn flatten(self) -> Filter {
        match self {
            Filter::LogOp { operation, filters } => {
                let mut flat = Vec::with_capacity(filters.len());
                for child in filters {
                    match (operation, child.flatten()) {
                        (
                            LogicalOperator::And,
                            Filter::LogOp {
                                operation: LogicalOperator::And,
                                filters: grandchildren,
                            },
                        ) => flat.extend(grandchildren),
                        (_, child) => flat.push(child),
                    }
                }
                if operation == LogicalOperator::And && flat.len() == 1 {
                    return flat.remove(0);
                }
                Filter::LogOp {
                    operation,
                    filters: flat,
                }
            }
            leaf => leaf,
        }
    }
}

fn check_tags(value: &Value) -> Result<()> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::InvalidFilter("filter must be an object".into()))?;
    let tag = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::InvalidFilter("filter has no 'type'".into()))?;
    if !FILTER_TYPES.contains(&tag) {
        return Err(Error::UnknownFilterType(tag.to_string()));
    }
    if tag == "logOp" {
        let operation = object
            .get("operation")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidFilter("logOp has no 'operation'".into()))?;
        operation.parse::<LogicalOperator>()?;
        if let Some(children) = object.get("filters").and_then(Value::as_array) {
            for child in children {
                check_tags(child)?;
            }
        }
    }
    Ok(())
}
