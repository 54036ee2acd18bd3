//! Sort order descriptions.

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// One key of a sort order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SortField {
    /// Field path expression of the sort key
    pub field_path: String,
    /// Whether the key sorts ascending
    pub ascending: bool,
}

impl SortField {
    /// Ascending sort on a field.
    pub fn asc(field_path: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            ascending: true,
        }
    }

    /// Descending sort on a field.
    pub fn desc(field_path: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            ascending: false,
        }
    }
}

/// Parses `"+name"`, `"-name"` and `"name"`.
impl std::str::FromStr for SortField {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (ascending, path) = match s.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, s.strip_prefix('+').unwrap_or(s)),
        };
        let path = path.trim();
        if path.is_empty() {
            return Err(Error::InvalidSortField(s.to_string()));
        }
        Ok(Self {
            field_path: path.to_string(),
            ascending,
        })
    }
}

impl fmt::Display for SortField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.ascending { '+' } else { '-' };
        write!(f, "{}{}", sign, self.field_path)
    }
}

impl<'de> Deserialize<'de> for SortField {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            #[serde(rename_all = "camelCase")]
            Full {
                field_path: String,
                #[serde(default = "ascending_default")]
                ascending: bool,
            },
        }

        fn ascending_default() -> bool {
            true
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.parse().map_err(serde::de::Error::custom),
            Repr::Full {
                field_path,
                ascending,
            } => Ok(SortField {
                field_path,
                ascending,
            }),
        }
    }
}

/// Ordered list of sort keys; earlier keys take precedence.
pub type SortOrder = Vec<SortField>;

/// Parse a list of `"+name"` / `"-name"` strings.
pub fn parse_sort_order<S: AsRef<str>>(fields: &[S]) -> Result<SortOrder> {
    fields.iter().map(|f| f.as_ref().parse()).collect()
}
