//! Live result sets.
//!
//! A [`LiveView`] holds the records a query currently shows, kept filtered and
//! sorted as live messages arrive. Sorted inserts use a locality-aware
//! insertion point: the neighbourhood of the previous insert is checked first,
//! then the whole array is binary searched.

use crate::compiler::{CompileOptions, Comparator, Predicate, QueryCompiler};
use crate::message::{LiveMessage, Method};
use crate::query::GetQuery;
use crate::record::{merge_patch, record_id, DEFAULT_ID_ATTRIBUTE};
use crate::{RecordId, Result};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// A change made to a view by [`LiveView::apply`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ViewChange {
    Added { index: usize, id: RecordId },
    Removed { index: usize, id: RecordId },
    Changed { index: usize, id: RecordId },
    /// The record changed and its sort position moved
    Moved { from: usize, to: usize, id: RecordId },
    /// Every record was replaced
    Reset { len: usize },
}

/// Index at which `value` keeps `records` sorted.
///
/// Equal elements insert after existing ones. `hint` is checked together with
/// its neighbours before falling back to a binary search; both paths give
/// the same answer.
pub fn insertion_point<F>(records: &[Value], compare: F, value: &Value, hint: usize) -> usize
where
    F: Fn(&Value, &Value) -> Ordering,
{
    let len = records.len();
    let fits = |i: usize| {
        (i == 0 || compare(&records[i - 1], value) != Ordering::Greater)
            && (i == len || compare(value, &records[i]) == Ordering::Less)
    };

    let hint = hint.min(len);
    for candidate in [hint, hint.saturating_sub(1), hint + 1] {
        if candidate <= len && fits(candidate) {
            return candidate;
        }
    }

    records.partition_point(|existing| compare(existing, value) != Ordering::Greater)
}

/// Records shown by a query, kept in sync with live messages.
pub struct LiveView {
    query: GetQuery,
    predicate: Option<Predicate>,
    comparator: Option<Comparator>,
    id_attribute: String,
    records: Vec<Value>,
    last_insertion_point: usize,
    more: bool,
    end: bool,
    next: bool,
    prev: bool,
}

impl fmt::Debug for LiveView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveView")
            .field("query", &self.query)
            .field("id_attribute", &self.id_attribute)
            .field("len", &self.records.len())
            .field("more", &self.more)
            .field("end", &self.end)
            .field("next", &self.next)
            .field("prev", &self.prev)
            .finish()
    }
}

impl LiveView {
    /// Create an empty view for a query.
    pub fn new(query: GetQuery, options: CompileOptions) -> Result<Self> {
        let compiler = QueryCompiler::new(options);
        let predicate = query
            .filter
            .as_ref()
            .map(|f| compiler.compile_filter(f))
            .transpose()?;
        let comparator = if query.sort_order.is_empty() {
            None
        } else {
            Some(compiler.compile_sort(&query.sort_order)?)
        };

        Ok(Self {
            query,
            predicate,
            comparator,
            id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(),
            records: Vec::new(),
            last_insertion_point: 0,
            more: false,
            end: false,
            next: false,
            prev: false,
        })
    }

    /// Use a different id attribute.
    pub fn with_id_attribute(mut self, id_attribute: impl Into<String>) -> Self {
        self.id_attribute = id_attribute.into();
        self
    }

    pub fn query(&self) -> &GetQuery {
        &self.query
    }

    pub fn records(&self) -> &[Value] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn id_attribute(&self) -> &str {
        &self.id_attribute
    }

    pub fn has_more(&self) -> bool {
        self.more
    }

    pub fn is_end(&self) -> bool {
        self.end
    }

    pub fn has_next(&self) -> bool {
        self.next
    }

    pub fn has_prev(&self) -> bool {
        self.prev
    }

    pub fn set_more(&mut self, more: bool) {
        self.more = more;
        self.end = !more;
    }

    pub fn set_next(&mut self, next: bool) {
        self.next = next;
    }

    pub fn set_prev(&mut self, prev: bool) {
        self.prev = prev;
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.query.limit = limit;
    }

    pub fn set_offset(&mut self, offset: Option<usize>) {
        self.query.offset = offset;
    }

    pub fn last_insertion_point(&self) -> usize {
        self.last_insertion_point
    }

    /// Whether a record passes the view's filter.
    pub fn matches(&self, record: &Value) -> bool {
        self.predicate.as_ref().map(|p| p(record)).unwrap_or(true)
    }

    /// Index of the record with the given id.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.records
            .iter()
            .position(|r| record_id(r, &self.id_attribute).as_deref() == Some(id))
    }

    /// Sorted insertion point for a record, updating the locality hint.
    pub fn insertion_point(&mut self, record: &Value) -> usize {
        let index = match &self.comparator {
            Some(compare) => insertion_point(
                &self.records,
                |a: &Value, b: &Value| compare(a, b),
                record,
                self.last_insertion_point,
            ),
            None => self.records.len(),
        };
        self.last_insertion_point = index;
        index
    }

    /// Apply the view's filter and sort order to a set of records, then cut
    /// out the window `[offset, offset + limit)`.
    pub fn select(&self, records: Vec<Value>, offset: usize, limit: Option<usize>) -> Vec<Value> {
        let mut selected: Vec<Value> = records.into_iter().filter(|r| self.matches(r)).collect();
        if let Some(compare) = &self.comparator {
            selected.sort_by(|a, b| compare(a, b));
        }
        let window = selected.into_iter().skip(offset);
        match limit {
            Some(limit) => window.take(limit).collect(),
            None => window.collect(),
        }
    }

    /// Replace every record.
    pub fn reset(&mut self, records: Vec<Value>) -> ViewChange {
        self.records = records;
        self.last_insertion_point = 0;
        ViewChange::Reset {
            len: self.records.len(),
        }
    }

    /// Insert a page of records, returning the index of the first one.
    ///
    /// With a sort order the batch lands at the insertion point of its first
    /// record; otherwise it is appended.
    pub fn insert_batch(&mut self, batch: Vec<Value>) -> usize {
        let index = match batch.first() {
            Some(first) if self.comparator.is_some() => self.insertion_point(first),
            _ => self.records.len(),
        };
        self.records.splice(index..index, batch);
        index
    }

    /// Merge a live message into the view.
    pub fn apply(&mut self, message: &LiveMessage) -> Vec<ViewChange> {
        if message.is_reset() {
            let records = match &message.data {
                Value::Array(items) => items.clone(),
                Value::Null => Vec::new(),
                other => vec![other.clone()],
            };
            return vec![self.reset(records)];
        }

        let id = record_id(&message.data, &self.id_attribute).unwrap_or_else(|| message.id.clone());
        let existing = self.position(&id);

        match (message.method, existing) {
            (Method::Read, _) => Vec::new(),
            (Method::Delete, Some(index)) => {
                self.records.remove(index);
                vec![ViewChange::Removed { index, id }]
            }
            (Method::Delete, None) => Vec::new(),
            (Method::Patch, Some(index)) => {
                merge_patch(&mut self.records[index], &message.data);
                self.reposition(index, id)
            }
            (Method::Create | Method::Update, Some(index)) => {
                self.records[index] = message.data.clone();
                self.reposition(index, id)
            }
            (Method::Create | Method::Update | Method::Patch, None) => {
                if !self.matches(&message.data) {
                    return Vec::new();
                }
                self.insert_windowed(message.data.clone(), id)
            }
        }
    }

    fn reposition(&mut self, index: usize, id: RecordId) -> Vec<ViewChange> {
        if !self.matches(&self.records[index]) {
            self.records.remove(index);
            return vec![ViewChange::Removed { index, id }];
        }
        if self.comparator.is_none() {
            return vec![ViewChange::Changed { index, id }];
        }

        let record = self.records.remove(index);
        self.last_insertion_point = index;
        let to = self.insertion_point(&record);
        self.records.insert(to, record);
        if to == index {
            vec![ViewChange::Changed { index, id }]
        } else {
            vec![ViewChange::Moved {
                from: index,
                to,
                id,
            }]
        }
    }

    fn insert_windowed(&mut self, record: Value, id: RecordId) -> Vec<ViewChange> {
        let index = self.insertion_point(&record);
        let offset = self.query.start();

        // Sorts before the first shown record: belongs to an earlier page.
        if self.comparator.is_some() && offset > 0 && index == 0 {
            return Vec::new();
        }
        if let Some(limit) = self.query.limit {
            if self.records.len() >= limit && index >= self.records.len() {
                return Vec::new();
            }
        }

        self.records.insert(index, record);
        let mut changes = vec![ViewChange::Added { index, id }];

        if let Some(limit) = self.query.limit {
            while self.records.len() > limit {
                let evicted = self.records.len() - 1;
                if let Some(record) = self.records.pop() {
                    changes.push(ViewChange::Removed {
                        index: evicted,
                        id: record_id(&record, &self.id_attribute).unwrap_or_default(),
                    });
                }
            }
        }
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Filter;
    use crate::sort::SortField;
    use serde_json::json;

    fn by_n() -> impl Fn(&Value, &Value) -> Ordering {
        |a: &Value, b: &Value| a["n"].as_i64().cmp(&b["n"].as_i64())
    }

    fn rows(ns: &[i64]) -> Vec<Value> {
        ns.iter().map(|n| json!({"id": n.to_string(), "n": n})).collect()
    }

    fn view(query: GetQuery) -> LiveView {
        LiveView::new(query, CompileOptions::default()).unwrap()
    }

    fn ids(view: &LiveView) -> Vec<String> {
        view.records()
            .iter()
            .map(|r| r["id"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn insertion_point_appends_after_equals() {
        let records = rows(&[1, 3, 3, 5]);
        let value = json!({"n": 3});
        for hint in 0..=5 {
            assert_eq!(insertion_point(&records, by_n(), &value, hint), 3);
        }
        assert_eq!(insertion_point(&records, by_n(), &json!({"n": 0}), 4), 0);
        assert_eq!(insertion_point(&records, by_n(), &json!({"n": 9}), 0), 4);
        assert_eq!(insertion_point(&[], by_n(), &json!({"n": 9}), 7), 0);
    }

    #[test]
    fn sorted_create_lands_in_place() {
        let mut view = view(GetQuery::new().with_sort(SortField::asc("n")));
        view.reset(rows(&[1, 5, 9]));

        let changes = view.apply(&LiveMessage::new("7", Method::Create, json!({"id": "7", "n": 7})));
        assert_eq!(
            changes,
            vec![ViewChange::Added {
                index: 2,
                id: "7".into()
            }]
        );
        assert_eq!(ids(&view), vec!["1", "5", "7", "9"]);
        assert_eq!(view.last_insertion_point(), 2);
    }

    #[test]
    fn filtered_out_create_is_dropped() {
        let mut view = view(GetQuery::new().with_filter(Filter::long_range("n", Some(5), None)));
        let changes = view.apply(&LiveMessage::new("1", Method::Create, json!({"id": "1", "n": 1})));
        assert!(changes.is_empty());
        assert!(view.is_empty());
    }

    #[test]
    fn patch_that_fails_filter_removes_record() {
        let mut view = view(
            GetQuery::new()
                .with_filter(Filter::long_range("n", Some(5), None))
                .with_sort(SortField::asc("n")),
        );
        view.reset(rows(&[5, 6, 7]));

        let changes = view.apply(&LiveMessage::new("6", Method::Patch, json!({"n": 1})));
        assert_eq!(
            changes,
            vec![ViewChange::Removed {
                index: 1,
                id: "6".into()
            }]
        );
        assert_eq!(ids(&view), vec!["5", "7"]);
    }

    #[test]
    fn patch_resorts_record() {
        let mut view = view(GetQuery::new().with_sort(SortField::asc("n")));
        view.reset(rows(&[1, 2, 3, 4]));

        let changes = view.apply(&LiveMessage::new("1", Method::Patch, json!({"n": 10})));
        assert_eq!(
            changes,
            vec![ViewChange::Moved {
                from: 0,
                to: 3,
                id: "1".into()
            }]
        );
        assert_eq!(ids(&view), vec!["2", "3", "4", "1"]);

        let changes = view.apply(&LiveMessage::new("3", Method::Patch, json!({"label": "x"})));
        assert_eq!(
            changes,
            vec![ViewChange::Changed {
                index: 1,
                id: "3".into()
            }]
        );
    }

    #[test]
    fn window_discards_and_evicts() {
        let mut view = view(
            GetQuery::new()
                .with_sort(SortField::asc("n"))
                .with_limit(3),
        );
        view.reset(rows(&[2, 4, 6]));

        // Past the end of a full window.
        assert!(view
            .apply(&LiveMessage::new("8", Method::Create, json!({"id": "8", "n": 8})))
            .is_empty());

        // Inside the window: the tail is evicted.
        let changes = view.apply(&LiveMessage::new("3", Method::Create, json!({"id": "3", "n": 3})));
        assert_eq!(
            changes,
            vec![
                ViewChange::Added {
                    index: 1,
                    id: "3".into()
                },
                ViewChange::Removed {
                    index: 3,
                    id: "6".into()
                },
            ]
        );
        assert_eq!(ids(&view), vec!["2", "3", "4"]);
    }

    #[test]
    fn insert_before_offset_window_is_discarded() {
        let mut view = view(
            GetQuery::new()
                .with_sort(SortField::asc("n"))
                .with_offset(3),
        );
        view.reset(rows(&[10, 11]));
        assert!(view
            .apply(&LiveMessage::new("1", Method::Create, json!({"id": "1", "n": 1})))
            .is_empty());
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn delete_and_reset() {
        let mut view = view(GetQuery::new());
        view.reset(rows(&[1, 2]));

        assert_eq!(
            view.apply(&LiveMessage::new("1", Method::Delete, Value::Null)),
            vec![ViewChange::Removed {
                index: 0,
                id: "1".into()
            }]
        );
        assert!(view
            .apply(&LiveMessage::new("404", Method::Delete, Value::Null))
            .is_empty());

        let changes = view.apply(&LiveMessage::new("all", Method::Update, json!(rows(&[7, 8, 9]))));
        assert_eq!(changes, vec![ViewChange::Reset { len: 3 }]);
        assert_eq!(ids(&view), vec!["7", "8", "9"]);
    }

    #[test]
    fn replaying_a_message_is_idempotent() {
        let mut view = view(GetQuery::new().with_sort(SortField::asc("n")));
        view.reset(rows(&[1, 3]));
        let message = LiveMessage::new("2", Method::Create, json!({"id": "2", "n": 2}));

        view.apply(&message);
        let once = view.records().to_vec();
        view.apply(&message);
        assert_eq!(view.records(), once.as_slice());
    }

    #[test]
    fn insert_batch_at_sorted_position() {
        let mut view = view(GetQuery::new().with_sort(SortField::asc("n")));
        view.reset(rows(&[1, 2]));
        let index = view.insert_batch(rows(&[3, 4]));
        assert_eq!(index, 2);
        assert_eq!(ids(&view), vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn select_filters_sorts_and_windows() {
        let view = view(
            GetQuery::new()
                .with_filter(Filter::long_range("n", Some(2), None))
                .with_sort(SortField::desc("n")),
        );
        let selected = view.select(rows(&[1, 4, 2, 5, 3]), 1, Some(2));
        let ns: Vec<_> = selected.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![4, 3]);
    }

    #[test]
    fn unsorted_view_appends() {
        let mut view = view(GetQuery::new());
        view.reset(rows(&[3, 1]));
        view.apply(&LiveMessage::new("2", Method::Create, json!({"id": "2", "n": 2})));
        assert_eq!(ids(&view), vec!["3", "1", "2"]);
    }
}
