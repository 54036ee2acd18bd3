//! Edge case tests for ebb-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use ebb_engine::{
    CompileOptions, Error, Filter, GetQuery, LiveMessage, LiveView, Method, OfflineMessage,
    QueryCompiler, SendClock, SortField, ViewChange,
};
use serde_json::{json, Value};

fn compile(filter: Value) -> ebb_engine::Predicate {
    QueryCompiler::default().compile_filter_json(&filter).unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn unicode_strings_match_case_insensitively() {
    let p = compile(json!({"type": "string", "fieldName": "name", "value": "ÅSE"}));
    assert!(p(&json!({"name": "åse"})));

    let p = compile(json!({"type": "containsString", "fieldName": "name", "contains": "🚀"}));
    assert!(p(&json!({"name": "launch 🚀 now"})));
}

#[test]
fn multiline_values_match_like_patterns() {
    let p = compile(json!({"type": "like", "fieldName": "body", "like": "hello%world"}));
    assert!(p(&json!({"body": "hello\nbig\nworld"})));
}

#[test]
fn numbers_and_booleans_compare_as_text() {
    let p = compile(json!({"type": "string", "fieldName": "code", "value": "42"}));
    assert!(p(&json!({"code": 42})));

    let p = compile(json!({"type": "string", "fieldName": "flag", "value": "true"}));
    assert!(p(&json!({"flag": true})));
}

#[test]
fn objects_never_match_string_filters() {
    let p = compile(json!({"type": "containsString", "fieldName": "x", "contains": "a"}));
    assert!(!p(&json!({"x": {"a": "a"}})));
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let p = compile(json!({"type": "longRange", "fieldName": "n", "min": i64::MAX - 1}));
    assert!(p(&json!({"n": i64::MAX})));

    let p = compile(json!({"type": "longEnum", "fieldName": "n", "values": [i64::MIN]}));
    assert!(p(&json!({"n": i64::MIN})));
}

#[test]
fn numeric_strings_satisfy_ranges() {
    let p = compile(json!({"type": "doubleRange", "fieldName": "price", "max": 10.0}));
    assert!(p(&json!({"price": "9.99"})));
    assert!(!p(&json!({"price": "expensive"})));
}

#[test]
fn clock_saturates_at_max() {
    let mut clock = SendClock::with_last(u64::MAX);
    assert_eq!(clock.next(0), u64::MAX);
}

// ============================================================================
// Filter Structure Edge Cases
// ============================================================================

#[test]
fn deeply_nested_filters() {
    let mut filter = json!({"type": "string", "fieldName": "a", "value": "1"});
    for _ in 0..50 {
        filter = json!({"type": "logOp", "operation": "and", "filters": [filter]});
    }
    let p = compile(filter.clone());
    assert!(p(&json!({"a": "1"})));

    let flat = Filter::from_json(&filter).unwrap().flatten();
    assert_eq!(flat, Filter::string("a", "1"));
}

#[test]
fn empty_or_matches_nothing() {
    let p = compile(json!({"type": "logOp", "operation": "or", "filters": []}));
    assert!(!p(&json!({"a": 1})));

    let p = compile(json!({"type": "logOp", "operation": "nor", "filters": []}));
    assert!(p(&json!({"a": 1})));
}

#[test]
fn unknown_nested_tags_fail_compilation() {
    let err = QueryCompiler::default()
        .compile_filter_json(&json!({
            "type": "logOp", "operation": "OR",
            "filters": [{"type": "logOp", "operation": "xor", "filters": []}]
        }))
        .err()
        .unwrap();
    assert_eq!(err, Error::UnknownOperation("xor".into()));
}

#[test]
fn case_sensitive_option_applies_to_like() {
    let compiler = QueryCompiler::new(CompileOptions {
        case_sensitive: true,
    });
    let p = compiler
        .compile_filter_json(&json!({"type": "like", "fieldName": "x", "like": "A%"}))
        .unwrap();
    assert!(p(&json!({"x": "Apple"})));
    assert!(!p(&json!({"x": "apple"})));
}

// ============================================================================
// Sorting Edge Cases
// ============================================================================

#[test]
fn mixed_types_sort_deterministically() {
    let compare = QueryCompiler::default()
        .compile_sort(&[SortField::asc("v")])
        .unwrap();
    let mut records = vec![
        json!({"v": "b"}),
        json!({"v": 2}),
        json!({}),
        json!({"v": true}),
        json!({"v": null}),
        json!({"v": "a"}),
    ];
    records.sort_by(|a, b| compare(a, b));

    let values: Vec<_> = records.iter().map(|r| r.get("v").cloned()).collect();
    assert_eq!(values[0..2].iter().filter(|v| matches!(v, None | Some(Value::Null))).count(), 2);
    assert_eq!(values[2], Some(json!(true)));
    assert_eq!(values[3], Some(json!(2)));
    assert_eq!(values[4], Some(json!("a")));
    assert_eq!(values[5], Some(json!("b")));
}

#[test]
fn descending_keeps_nulls_last() {
    let compare = QueryCompiler::default()
        .compile_sort(&[SortField::desc("v")])
        .unwrap();
    let mut records = vec![json!({}), json!({"v": 1}), json!({"v": 3})];
    records.sort_by(|a, b| compare(a, b));
    assert_eq!(records, vec![json!({"v": 3}), json!({"v": 1}), json!({})]);
}

// ============================================================================
// Live View Edge Cases
// ============================================================================

#[test]
fn zero_limit_view_accepts_nothing() {
    let mut view = LiveView::new(GetQuery::new().with_limit(0), CompileOptions::default()).unwrap();
    let changes = view.apply(&LiveMessage::new("1", Method::Create, json!({"id": "1"})));
    assert!(changes.is_empty());
    assert!(view.is_empty());
}

#[test]
fn numeric_ids_address_the_same_record() {
    let mut view = LiveView::new(GetQuery::new(), CompileOptions::default()).unwrap();
    view.apply(&LiveMessage::new("7", Method::Create, json!({"id": 7, "n": 1})));
    let changes = view.apply(&LiveMessage::new("7", Method::Delete, Value::Null));
    assert_eq!(
        changes,
        vec![ViewChange::Removed {
            index: 0,
            id: "7".into()
        }]
    );
}

#[test]
fn custom_id_attribute() {
    let mut view = LiveView::new(GetQuery::new(), CompileOptions::default())
        .unwrap()
        .with_id_attribute("uuid");
    view.apply(&LiveMessage::new("u1", Method::Create, json!({"uuid": "u1", "n": 1})));
    view.apply(&LiveMessage::new("u1", Method::Patch, json!({"n": 2})));
    assert_eq!(view.len(), 1);
    assert_eq!(view.records()[0]["n"], 2);
}

#[test]
fn reset_with_null_payload_clears_view() {
    let mut view = LiveView::new(GetQuery::new(), CompileOptions::default()).unwrap();
    view.apply(&LiveMessage::new("1", Method::Create, json!({"id": "1"})));
    let changes = view.apply(&LiveMessage::new("all", Method::Update, Value::Null));
    assert_eq!(changes, vec![ViewChange::Reset { len: 0 }]);
}

// ============================================================================
// Offline Message Edge Cases
// ============================================================================

#[test]
fn record_ids_may_contain_separator() {
    let message = OfflineMessage::new("tasks", "a~b", Method::Update, json!({}), 1, 0);
    assert_eq!(message.id, "tasks~a~b");
    assert_eq!(message.entity(), Some("tasks"));
}

#[test]
fn rapid_changes_fold_into_one_message() {
    let mut message = Some(OfflineMessage::new(
        "tasks",
        "1",
        Method::Create,
        json!({"id": "1", "n": 0}),
        10,
        0,
    ));
    for n in 1..100 {
        message = message.and_then(|m| m.merge(Method::Patch, json!({"n": n})));
    }
    let message = message.unwrap();
    assert_eq!(message.method, Method::Create);
    assert_eq!(message.data, json!({"id": "1", "n": 99}));
    assert_eq!(message.time, 10);
}
