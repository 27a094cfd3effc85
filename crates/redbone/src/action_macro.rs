//! Macros for building actions.

/// Build an [`Action`](crate::Action) from a type, an optional payload and
/// root fields.
///
/// Field names are written as identifiers and used verbatim, so
/// `backType = "x"` becomes the `backType` root field. Values go through
/// `Into<serde_json::Value>`.
///
/// # Example
///
/// ```ignore
/// use redbone_core::action;
/// use serde_json::json;
///
/// let ping = action!("@@client/PING");
///
/// let call = action!(
///     "@@server/rpc/CALL",
///     module = "hello",
///     method = "double",
///     arguments = json!(["ab"]),
///     flat = true,
///     id = 7,
/// );
///
/// let update = action!("@@client/UPDATE", payload = json!({ "count": 2 }));
/// ```
#[macro_export]
macro_rules! action {
    ($action_type:expr $(,)?) => {
        $crate::Action::new($action_type)
    };
    ($action_type:expr, payload = $payload:expr $(, $key:ident = $value:expr)* $(,)?) => {
        $crate::Action::with_payload($action_type, ::core::convert::Into::into($payload))
            $(.with_field(::core::stringify!($key), $value))*
    };
    ($action_type:expr $(, $key:ident = $value:expr)+ $(,)?) => {
        $crate::Action::new($action_type)
            $(.with_field(::core::stringify!($key), $value))+
    };
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    #[test]
    fn builds_bare_actions() {
        let action = action!("t");
        assert_eq!(action.to_value(), json!({ "type": "t" }));
    }

    #[test]
    fn builds_fields_verbatim() {
        let action = action!("t", module = "hello", backType = "b", flat = true, id = 7);
        assert_eq!(
            action.to_value(),
            json!({ "type": "t", "module": "hello", "backType": "b", "flat": true, "id": 7 })
        );
    }

    #[test]
    fn payload_goes_under_payload() {
        let action = action!("t", payload = json!([1, 2]), id = "x");
        assert_eq!(action.payload, Some(json!([1, 2])));
        assert_eq!(action.id().as_deref(), Some("x"));
    }
}
