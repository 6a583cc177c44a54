//! Structured error values shared by the client and server engines.
//!
//! Errors here are **values**, not exceptions: they travel inside the wire
//! envelope, through middleware chains, and out of public APIs as the `Err`
//! arm of [`Result`]. The shape mirrors the wire layout exactly:
//! `message` (required), `category`, `code`, and a free-form `details` map.
//!
//! Equality is field-by-field, which makes errors convenient to assert on in
//! tests and to compare across a round-trip.

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// Common result alias for the runtime.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Well-known error categories produced by the engines.
///
/// The set is open: servers may put any string into `category`; these are the
/// ones the runtime itself emits.
pub mod category {
    /// Input failed required-field validation.
    pub const VALIDATION: &str = "ValidationError";
    /// The client received a non-2xx HTTP status.
    pub const HTTP: &str = "HTTPError";
    /// A per-attempt deadline expired.
    pub const TIMEOUT: &str = "TimeoutError";
    /// Malformed or oversized SSE payload.
    pub const PROTOCOL: &str = "ProtocolError";
    /// Precondition failure before any transport call.
    pub const CLIENT: &str = "ClientError";
    /// Stream or request transport interruption.
    pub const CONNECTION: &str = "ConnectionError";
}

/// Machine-readable error codes produced by the engines.
pub mod code {
    pub const MISSING_REQUIRED_FIELD: &str = "MISSING_REQUIRED_FIELD";
    pub const BAD_STATUS: &str = "BAD_STATUS";
    pub const MESSAGE_TOO_LARGE: &str = "MESSAGE_TOO_LARGE";
    pub const REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";
    pub const ENCODE_INPUT: &str = "ENCODE_INPUT";
    pub const UNKNOWN_OPERATION: &str = "UNKNOWN_OPERATION";
    pub const CONNECT_FAILED: &str = "CONNECT_FAILED";
}

/// Structured RPC error.
///
/// `message` is always non-empty for errors produced by the runtime. The
/// optional fields are omitted from the wire when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct Error {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub details: Option<JsonMap<String, Value>>,
}

impl Error {
    /// Plain error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: None,
            code: None,
            details: None,
        }
    }

    /// Validation error for a missing required field.
    ///
    /// Produces `{category: "ValidationError", code: "MISSING_REQUIRED_FIELD"}`
    /// with the given message, e.g. `"field text is required"`.
    pub fn missing_required_field(message: impl Into<String>) -> Self {
        Self::new(message)
            .with_category(category::VALIDATION)
            .with_code(code::MISSING_REQUIRED_FIELD)
    }

    /// Wrap any displayable value as a plain `{message}` error.
    ///
    /// This is the catch-all conversion the engines apply to foreign errors
    /// (I/O, serde, transport) before they cross the wire. An [`Error`] is
    /// already an error value and never needs wrapping.
    pub fn wrap(err: impl std::fmt::Display) -> Self {
        Self::new(err.to_string())
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Attach one detail entry, creating the map on first use.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.details
            .get_or_insert_with(JsonMap::new)
            .insert(key.into(), value);
        self
    }

    /// Whether this error carries the given category.
    pub fn is_category(&self, category: &str) -> bool {
        self.category.as_deref() == Some(category)
    }

    /// Whether this error carries the given code.
    pub fn is_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::new(format!("json error: {e}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::new(format!("io error: {e}")).with_category(category::CONNECTION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_required_field_shape() {
        let e = Error::missing_required_field("field text is required");
        assert_eq!(e.message, "field text is required");
        assert!(e.is_category(category::VALIDATION));
        assert!(e.is_code(code::MISSING_REQUIRED_FIELD));
        assert!(e.details.is_none());
    }

    #[test]
    fn equality_is_by_all_fields() {
        let a = Error::new("boom").with_code(code::BAD_STATUS);
        let b = Error::new("boom").with_code(code::BAD_STATUS);
        let c = Error::new("boom");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn optional_fields_omitted_on_wire() {
        let v = serde_json::to_value(Error::new("plain")).unwrap();
        assert_eq!(v, json!({"message": "plain"}));

        let v = serde_json::to_value(
            Error::new("full")
                .with_category(category::HTTP)
                .with_code(code::BAD_STATUS)
                .with_detail("status", json!(502)),
        )
        .unwrap();
        assert_eq!(
            v,
            json!({
                "message": "full",
                "category": "HTTPError",
                "code": "BAD_STATUS",
                "details": {"status": 502}
            })
        );
    }

    #[test]
    fn wrap_foreign_error() {
        let e = Error::wrap(std::fmt::Error);
        assert!(!e.message.is_empty());
        assert!(e.category.is_none());
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let e = Error::new("oops")
            .with_category(category::PROTOCOL)
            .with_code(code::MESSAGE_TOO_LARGE)
            .with_detail("limit", json!(64));
        let back: Error = serde_json::from_str(&serde_json::to_string(&e).unwrap()).unwrap();
        assert_eq!(e, back);
    }
}
