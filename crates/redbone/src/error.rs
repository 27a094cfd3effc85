//! Error types for the dispatcher and its extensions.
//!
//! Two families live here:
//!
//! - [`RedboneError`]: structured library errors (validation, registration,
//!   listener bookkeeping). These are programmer errors and are returned at
//!   the call site that detects them.
//! - [`HttpError`]: protocol errors raised inside the pipeline (malformed
//!   request, missing resource). The default catcher recognises them and
//!   echoes `{code, status, message}` back to the client.
//!
//! Everything else a handler returns is an `anyhow::Error` and travels to the
//! catcher unchanged.

use thiserror::Error;

/// Library error.
#[derive(Debug, Error)]
pub enum RedboneError {
    /// The action does not carry a non-empty string `type`.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A registration name (namespace, lib, module, event) is malformed.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// `name/key` is not present in the action type registry.
    #[error("unknown action type {name}/{key}")]
    UnknownType {
        /// Namespace name.
        name: String,
        /// Short type key.
        key: String,
    },

    /// A type key appears twice inside one namespace.
    #[error("duplicate type key {key} in namespace {name}")]
    DuplicateType {
        /// Namespace name.
        name: String,
        /// Short type key.
        key: String,
    },

    /// The client already listens to this event of this model.
    #[error("client {client_id} already has a listener for event {event}")]
    DuplicateListener {
        /// Owning client.
        client_id: String,
        /// Event name.
        event: String,
    },

    /// The client already went through disconnect.
    #[error("client {0} is disconnected")]
    ClientDisconnected(String),

    /// `set/model` is not registered with the Pub/Sub extension.
    #[error("model {set}/{model} is not registered")]
    UnknownModel {
        /// Model set.
        set: String,
        /// Model name inside the set.
        model: String,
    },

    /// The client was created without a transport sender.
    #[error("dispatcher is not implemented")]
    DispatcherNotImplemented,

    /// The client has not been bound to a router yet.
    #[error("client {0} is not bound to a router")]
    NotBound(String),

    /// The transport refused the outbound action (closed channel, dropped peer).
    #[error("transport closed for client {0}")]
    TransportClosed(String),

    /// The catcher failed while handling a pipeline error.
    #[error(transparent)]
    Unhandled(anyhow::Error),
}

/// HTTP-style protocol error with a numeric code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HttpError {
    /// Numeric code, e.g. 400 or 404.
    pub code: u16,
    /// Human readable message.
    pub message: String,
}

impl HttpError {
    /// Create an error with an arbitrary code.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// 400: the request is malformed.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    /// 404: the addressed resource does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(404, message)
    }

    /// Standard reason phrase for [`code`](Self::code).
    pub fn status(&self) -> &'static str {
        status_text(self.code)
    }
}

/// Reason phrase for an HTTP status code, `"Undefined Message"` if unknown.
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        415 => "Unsupported Media Type",
        422 => "Unprocessable Entity",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Undefined Message",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_status_text() {
        assert_eq!(HttpError::bad_request("x").status(), "Bad Request");
        assert_eq!(HttpError::not_found("x").status(), "Not Found");
        assert_eq!(HttpError::new(799, "x").status(), "Undefined Message");
    }

    #[test]
    fn http_error_survives_anyhow_downcast() {
        let err: anyhow::Error = HttpError::not_found("module is not found").into();
        let http = err.downcast_ref::<HttpError>().unwrap();
        assert_eq!(http.code, 404);
        assert_eq!(err.to_string(), "module is not found");
    }
}
