//! Namespaced action type constants.
//!
//! A namespace `name` maps short keys to fully qualified types
//! `@@<name>/<KEY>`. The registry is populated during setup and read-only once
//! the router is built.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::action::Action;
use crate::error::RedboneError;

/// Keys appended to a namespace declared with `is_collection`.
pub const COLLECTION_TYPES: [&str; 7] = ["PUSH", "POP", "SHIFT", "UNSHIFT", "SET", "SETUP", "REMOVE"];

/// Serde-friendly namespace declaration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypesDef {
    /// Prefix override; defaults to `@@<name>/`.
    #[serde(default)]
    pub prefix: Option<String>,
    /// Short keys.
    pub types: Vec<String>,
    /// Append [`COLLECTION_TYPES`].
    #[serde(default)]
    pub is_collection: bool,
}

/// Lifecycle types dispatched by the connector binding.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LifecycleTypes {
    /// Dispatched once when a client connects.
    pub connection: String,
    /// Dispatched once when a client disconnects.
    pub disconnect: String,
    /// Type of the error notifications sent by the default catcher.
    pub error: String,
}

impl Default for LifecycleTypes {
    fn default() -> Self {
        Self {
            connection: "@@server/CONNECTION".into(),
            disconnect: "@@server/DISCONNECT".into(),
            error: "@@server/ERROR".into(),
        }
    }
}

/// Registry of action type namespaces.
#[derive(Debug, Clone, Default)]
pub struct ActionTypes {
    namespaces: HashMap<String, HashMap<String, String>>,
}

impl ActionTypes {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `keys` under `@@<name>/`.
    pub fn register<I, S>(&mut self, name: &str, keys: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let prefix = format!("@@{name}/");
        self.register_with_prefix(name, &prefix, keys)
    }

    /// Register `keys` under an explicit prefix.
    ///
    /// Replaces any namespace previously registered under `name`.
    pub fn register_with_prefix<I, S>(
        &mut self,
        name: &str,
        prefix: &str,
        keys: I,
    ) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        check_name(name)?;
        if prefix.is_empty() {
            return Err(RedboneError::InvalidName(format!("prefix of {name} is empty")));
        }
        let mut namespace = HashMap::new();
        for key in keys {
            let key = key.into();
            check_name(&key)?;
            let qualified = format!("{prefix}{key}");
            if namespace.insert(key.clone(), qualified).is_some() {
                return Err(RedboneError::DuplicateType {
                    name: name.to_string(),
                    key,
                });
            }
        }
        self.namespaces.insert(name.to_string(), namespace);
        Ok(self)
    }

    /// Register a namespace from its declaration.
    pub fn register_def(&mut self, name: &str, def: &TypesDef) -> Result<&mut Self, RedboneError> {
        let prefix = def.prefix.clone().unwrap_or_else(|| format!("@@{name}/"));
        let mut keys = def.types.clone();
        if def.is_collection {
            keys.extend(COLLECTION_TYPES.iter().map(|k| k.to_string()));
        }
        self.register_with_prefix(name, &prefix, keys)
    }

    /// Add fully qualified entries to a namespace, creating it if needed.
    ///
    /// Existing keys are left untouched.
    pub fn extend<'a, I>(&mut self, name: &str, entries: I) -> Result<&mut Self, RedboneError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        check_name(name)?;
        let namespace = self.namespaces.entry(name.to_string()).or_default();
        for (key, qualified) in entries {
            check_name(key)?;
            namespace
                .entry(key.to_string())
                .or_insert_with(|| qualified.to_string());
        }
        Ok(self)
    }

    /// Qualified type for `name/key`.
    pub fn get(&self, name: &str, key: &str) -> Option<&str> {
        self.namespaces.get(name)?.get(key).map(String::as_str)
    }

    /// Whole namespace.
    pub fn namespace(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.namespaces.get(name)
    }

    /// Build an action of type `name/key`.
    ///
    /// `merge` flattens an object payload into the action root.
    pub fn make_action(
        &self,
        name: &str,
        key: &str,
        payload: Value,
        merge: bool,
    ) -> Result<Action, RedboneError> {
        let action_type = self.get(name, key).ok_or_else(|| RedboneError::UnknownType {
            name: name.to_string(),
            key: key.to_string(),
        })?;
        Ok(Action::reply(action_type, payload, merge))
    }
}

pub(crate) fn check_name(name: &str) -> Result<(), RedboneError> {
    if name.is_empty() {
        return Err(RedboneError::InvalidName("name is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_builds_qualified_types() {
        let mut types = ActionTypes::new();
        types.register("client", ["HELLO", "BYE"]).unwrap();
        assert_eq!(types.get("client", "HELLO"), Some("@@client/HELLO"));
        assert_eq!(types.get("client", "NOPE"), None);
        assert_eq!(types.get("server", "HELLO"), None);
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let mut types = ActionTypes::new();
        let err = types.register("client", ["A", "A"]).unwrap_err();
        assert!(matches!(err, RedboneError::DuplicateType { .. }));
    }

    #[test]
    fn collection_def_appends_collection_keys() {
        let def: TypesDef = serde_json::from_value(json!({
            "types": ["LOAD"],
            "isCollection": true
        }))
        .unwrap();
        let mut types = ActionTypes::new();
        types.register_def("todos", &def).unwrap();
        assert_eq!(types.get("todos", "LOAD"), Some("@@todos/LOAD"));
        assert_eq!(types.get("todos", "UNSHIFT"), Some("@@todos/UNSHIFT"));
    }

    #[test]
    fn make_action_nests_or_merges() {
        let mut types = ActionTypes::new();
        types.register("server/rpc", ["CALL"]).unwrap();

        let nested = types.make_action("server/rpc", "CALL", json!(false), false).unwrap();
        assert_eq!(nested.to_value(), json!({ "type": "@@server/rpc/CALL", "payload": false }));

        let merged = types
            .make_action("server/rpc", "CALL", json!({ "module": "m" }), true)
            .unwrap();
        assert_eq!(merged.get_str("module"), Some("m"));

        assert!(types.make_action("server/rpc", "NOPE", json!(null), false).is_err());
    }

    #[test]
    fn lifecycle_types_default_and_override() {
        let types: LifecycleTypes = serde_json::from_value(json!({
            "connection": "@@app/CONNECT"
        }))
        .unwrap();
        assert_eq!(types.connection, "@@app/CONNECT");
        assert_eq!(types.error, "@@server/ERROR");
    }
}
