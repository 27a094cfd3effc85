//! The action: a typed, serializable message flowing between client and server.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RedboneError;

/// `{type, payload?, ...fields}` on the wire.
///
/// Actions are immutable once dispatched: the pipeline hands every handler a
/// shared `Arc<Action>`, and handlers that want a different action build a
/// new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Fully qualified type, e.g. `@@server/rpc/CALL`.
    #[serde(rename = "type")]
    pub action_type: String,

    /// Nested payload, absent when the action carries none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    /// Every other root field (`id`, merged payload fields, RPC parameters).
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Action {
    /// Action with a type and nothing else.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
            payload: None,
            fields: Map::new(),
        }
    }

    /// Action with a nested payload.
    pub fn with_payload(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            payload: Some(payload),
            ..Self::new(action_type)
        }
    }

    /// Build an outbound action from `data`.
    ///
    /// With `merge` and an object `data`, the object's fields land on the
    /// action root (a `type` key in `data` is ignored, a `payload` key becomes
    /// the payload). Otherwise `data` is nested under `payload`.
    pub fn reply(action_type: impl Into<String>, data: Value, merge: bool) -> Self {
        let mut action = Self::new(action_type);
        match data {
            Value::Object(map) if merge => {
                for (key, value) in map {
                    match key.as_str() {
                        "type" => {}
                        "payload" => action.payload = Some(value),
                        _ => {
                            action.fields.insert(key, value);
                        }
                    }
                }
            }
            data => action.payload = Some(data),
        }
        action
    }

    /// Parse and validate a raw wire value.
    pub fn from_value(value: Value) -> Result<Self, RedboneError> {
        match value.get("type") {
            Some(Value::String(t)) if !t.is_empty() => {}
            Some(Value::String(_)) => {
                return Err(RedboneError::InvalidAction(
                    "action.type should be a non-empty string".into(),
                ))
            }
            Some(_) | None if value.is_object() => {
                return Err(RedboneError::InvalidAction(
                    "action.type should be a string".into(),
                ))
            }
            _ => {
                return Err(RedboneError::InvalidAction(
                    "action should be an object".into(),
                ))
            }
        }
        serde_json::from_value(value).map_err(|e| RedboneError::InvalidAction(e.to_string()))
    }

    /// Check the type invariant.
    pub fn validate(&self) -> Result<(), RedboneError> {
        if self.action_type.is_empty() {
            return Err(RedboneError::InvalidAction(
                "action.type should be a non-empty string".into(),
            ));
        }
        Ok(())
    }

    /// Add a root field. A `type` key is ignored and a `payload` key sets
    /// the payload, so the wire object never carries either twice.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        match key.as_str() {
            "type" => {}
            "payload" => self.payload = Some(value.into()),
            _ => {
                self.fields.insert(key, value.into());
            }
        }
        self
    }

    /// Root field by name.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Root field as a non-empty string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Root field as a flag; missing or non-boolean reads as `false`.
    pub fn flag(&self, key: &str) -> bool {
        self.fields.get(key).and_then(Value::as_bool).unwrap_or(false)
    }

    /// `id` field, stringified.
    pub fn id(&self) -> Option<String> {
        match self.fields.get("id")? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Wire representation.
    pub fn to_value(&self) -> Value {
        let mut map = Map::with_capacity(self.fields.len() + 2);
        map.insert("type".into(), Value::String(self.action_type.clone()));
        if let Some(payload) = &self.payload {
            map.insert("payload".into(), payload.clone());
        }
        for (key, value) in &self.fields {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_value_rejects_missing_or_bad_type() {
        assert!(Action::from_value(json!({ "payload": 1 })).is_err());
        assert!(Action::from_value(json!({ "type": 7 })).is_err());
        assert!(Action::from_value(json!({ "type": "" })).is_err());
        assert!(Action::from_value(json!("t")).is_err());
    }

    #[test]
    fn from_value_keeps_root_fields() {
        let action = Action::from_value(json!({
            "type": "t",
            "payload": [1, 2],
            "module": "hello",
            "id": 12
        }))
        .unwrap();

        assert_eq!(action.action_type, "t");
        assert_eq!(action.payload, Some(json!([1, 2])));
        assert_eq!(action.get_str("module"), Some("hello"));
        assert_eq!(action.id().as_deref(), Some("12"));
    }

    #[test]
    fn reply_merges_objects_only_when_asked() {
        let merged = Action::reply("t", json!({ "echo": "x", "type": "ignored" }), true);
        assert_eq!(merged.action_type, "t");
        assert_eq!(merged.get("echo"), Some(&json!("x")));
        assert!(merged.payload.is_none());

        let nested = Action::reply("t", json!({ "echo": "x" }), false);
        assert_eq!(nested.payload, Some(json!({ "echo": "x" })));

        let scalar = Action::reply("t", json!("abab"), true);
        assert_eq!(scalar.payload, Some(json!("abab")));
    }

    #[test]
    fn to_value_matches_wire_shape() {
        let action = Action::with_payload("t", json!(1)).with_field("id", "7");
        assert_eq!(action.to_value(), json!({ "type": "t", "payload": 1, "id": "7" }));
        assert_eq!(serde_json::to_value(&action).unwrap(), action.to_value());
    }

    #[test]
    fn with_field_keeps_type_and_payload_out_of_fields() {
        let action = Action::new("t")
            .with_field("type", "other")
            .with_field("payload", json!([1]))
            .with_field("id", 3);
        assert!(action.get("type").is_none());
        assert!(action.get("payload").is_none());
        assert_eq!(action.to_value(), json!({ "type": "t", "payload": [1], "id": 3 }));
    }
}
