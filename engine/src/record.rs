//! Record helpers.
//!
//! Records are opaque JSON documents. The engine only looks at the id
//! attribute; everything else is entity-defined.

use crate::{Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute holding the record id unless an entity says otherwise.
pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// Attribute some servers use instead of the configured id attribute.
const SERVER_ID_ATTRIBUTE: &str = "_id";

/// Where a set of records was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Served from the local store
    Local,
    /// Received from remote/server
    Remote,
}

/// Read the id of a record.
///
/// Numeric ids are returned in their decimal form so that `{"id": 7}` and
/// `{"id": "7"}` address the same row.
pub fn record_id(record: &Value, id_attribute: &str) -> Option<RecordId> {
    match record.get(id_attribute)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read the id of a record, failing if it has none.
pub fn require_id(record: &Value, id_attribute: &str) -> crate::Result<RecordId> {
    record_id(record, id_attribute).ok_or_else(|| Error::MissingId(id_attribute.to_string()))
}

/// Set the id attribute of a record. Non-object records are replaced by an
/// object holding only the id.
pub fn set_record_id(record: &mut Value, id_attribute: &str, id: &str) {
    match record.as_object_mut() {
        Some(map) => {
            map.insert(id_attribute.to_string(), Value::String(id.to_string()));
        }
        None => {
            let mut map = serde_json::Map::new();
            map.insert(id_attribute.to_string(), Value::String(id.to_string()));
            *record = Value::Object(map);
        }
    }
}

/// Apply `patch` on top of `target`, attribute by attribute.
///
/// Top-level attributes of the patch replace those of the target; attributes
/// the patch does not mention are kept.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    match (target.as_object_mut(), patch.as_object()) {
        (Some(existing), Some(changes)) => {
            for (key, value) in changes {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = patch.clone(),
    }
}

/// Repair id quirks in data delivered by a server.
///
/// If the configured id attribute is missing, it is taken from `_id` and then
/// from the id of the envelope that carried the data.
pub fn fix_server_id(data: &mut Value, id_attribute: &str, envelope_id: Option<&str>) {
    if record_id(data, id_attribute).is_some() {
        return;
    }
    if let Some(server_id) = record_id(data, SERVER_ID_ATTRIBUTE) {
        set_record_id(data, id_attribute, &server_id);
        return;
    }
    if let Some(id) = envelope_id.filter(|id| !id.is_empty()) {
        if data.is_object() {
            set_record_id(data, id_attribute, id);
        }
    }
}

/// JavaScript-style truthiness of an optional JSON value.
///
/// Absent values, `null`, `false`, `0`, `NaN` and the empty string are falsy.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_string_and_numeric_ids() {
        assert_eq!(record_id(&json!({"id": "a1"}), "id"), Some("a1".into()));
        assert_eq!(record_id(&json!({"id": 42}), "id"), Some("42".into()));
        assert_eq!(record_id(&json!({"id": ""}), "id"), None);
        assert_eq!(record_id(&json!({"name": "x"}), "id"), None);
        assert_eq!(record_id(&json!({"uuid": "u"}), "uuid"), Some("u".into()));
    }

    #[test]
    fn require_id_reports_attribute() {
        let err = require_id(&json!({}), "uuid").unwrap_err();
        assert_eq!(err, Error::MissingId("uuid".into()));
    }

    #[test]
    fn merge_patch_keeps_untouched_attributes() {
        let mut record = json!({"id": "1", "name": "Alice", "age": 30});
        merge_patch(&mut record, &json!({"age": 31, "city": "Oslo"}));
        assert_eq!(
            record,
            json!({"id": "1", "name": "Alice", "age": 31, "city": "Oslo"})
        );
    }

    #[test]
    fn fix_server_id_prefers_underscore_id() {
        let mut data = json!({"_id": "srv-1", "name": "x"});
        fix_server_id(&mut data, "id", Some("env"));
        assert_eq!(data["id"], "srv-1");

        let mut data = json!({"name": "x"});
        fix_server_id(&mut data, "id", Some("env-1"));
        assert_eq!(data["id"], "env-1");

        let mut data = json!({"id": "keep"});
        fix_server_id(&mut data, "id", Some("env-1"));
        assert_eq!(data["id"], "keep");
    }

    #[test]
    fn truthiness() {
        assert!(!is_truthy(None));
        assert!(!is_truthy(Some(&json!(null))));
        assert!(!is_truthy(Some(&json!(0))));
        assert!(!is_truthy(Some(&json!(0.0))));
        assert!(!is_truthy(Some(&json!(""))));
        assert!(!is_truthy(Some(&json!(false))));
        assert!(is_truthy(Some(&json!("0"))));
        assert!(is_truthy(Some(&json!([]))));
        assert!(is_truthy(Some(&json!(-1))));
    }
}
