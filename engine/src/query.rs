//! Query descriptions.
//!
//! A [`GetQuery`] describes a window (`offset`/`limit`), a sort order, a filter
//! and an optional field projection. Queries from several layers are combined
//! with [`GetQuery::merge`] and normalized with [`GetQuery::optimize`].

use crate::filter::Filter;
use crate::sort::{SortField, SortOrder};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A read query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetQuery {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort_order: SortOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl GetQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_sort(mut self, field: SortField) -> Self {
        self.sort_order.push(field);
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// Whether the query adds nothing to a plain read.
    pub fn is_empty(&self) -> bool {
        self.limit.is_none()
            && self.offset.is_none()
            && self.sort_order.is_empty()
            && self.filter.is_none()
            && self.fields.is_empty()
    }

    /// First row of the window.
    pub fn start(&self) -> usize {
        self.offset.unwrap_or(0)
    }

    /// One past the last row of the window; `None` when unbounded.
    pub fn end(&self) -> Option<usize> {
        self.limit.map(|limit| self.start().saturating_add(limit))
    }

    /// Combine two queries.
    ///
    /// Windows are intersected, sort orders and field lists concatenated
    /// (`self` first) and filters joined with `and`. A limit without an offset
    /// is a page size counted from the merged offset. Neither input is
    /// modified.
    pub fn merge(&self, other: &GetQuery) -> GetQuery {
        let start = self.start().max(other.start());
        let end_from = |query: &GetQuery| match query.offset {
            Some(_) => query.end(),
            None => query.limit.map(|limit| start.saturating_add(limit)),
        };
        let end = match (end_from(self), end_from(other)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let offset = if self.offset.is_some() || other.offset.is_some() {
            Some(start)
        } else {
            None
        };
        let limit = end.map(|end| end.saturating_sub(start));

        let filter = match (&self.filter, &other.filter) {
            (Some(a), Some(b)) => Some(a.clone().and(b.clone())),
            (a, b) => a.clone().or_else(|| b.clone()),
        };

        let mut sort_order = self.sort_order.clone();
        sort_order.extend(other.sort_order.iter().cloned());

        let mut fields = self.fields.clone();
        fields.extend(other.fields.iter().cloned());

        GetQuery {
            limit,
            offset,
            sort_order,
            filter,
            fields,
        }
    }

    /// Normalize the query.
    ///
    /// Nested `and` filters are flattened, repeated sort keys keep their first
    /// occurrence and the field projection is sorted without duplicates.
    pub fn optimize(mut self) -> GetQuery {
        self.filter = self.filter.map(Filter::flatten);

        let mut seen = HashSet::new();
        self.sort_order
            .retain(|field| seen.insert(field.field_path.clone()));

        self.fields.sort();
        self.fields.dedup();
        self
    }

    /// Encode the query as URL query pairs for a remote read.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        for field in &self.sort_order {
            pairs.push(("sortOrder".to_string(), field.to_string()));
        }
        for field in &self.fields {
            pairs.push(("field".to_string(), field.clone()));
        }
        if let Some(filter) = &self.filter {
            if let Ok(json) = serde_json::to_string(filter) {
                pairs.push(("filter".to_string(), json));
            }
        }
        pairs
    }
}
