//! The shared error taxonomy and its wire envelope.
//!
//! Every fallible operation in the core surfaces one of these kinds, either
//! locally as a [`FabricError`] or, once it crosses the bus, serialized as
//! the `err` envelope this module also defines.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// The closed set of error kinds the core itself can produce. Business
/// handlers are free to map their own errors onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    PayloadTooLarge,
    Internal,
    NotImplemented,
    DeadlineExceeded,
    NoResponder,
    Canceled,
    Validation,
}

impl ErrorKind {
    /// The HTTP-shaped status code this kind carries on the wire.
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadRequest => 400,
            ErrorKind::Unauthorized => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::PayloadTooLarge => 413,
            ErrorKind::Internal => 500,
            ErrorKind::NotImplemented => 501,
            ErrorKind::NoResponder => 503,
            ErrorKind::DeadlineExceeded => 504,
            // Canceled and Validation have no canonical HTTP status; callers
            // that need one should map them explicitly (typically 499/400).
            ErrorKind::Canceled => 499,
            ErrorKind::Validation => 400,
        }
    }

    /// Whether this kind's status falls in the 5xx range, i.e. whether a
    /// redacting [`ErrorEnvelope`] replaces its message.
    pub fn is_server_error(&self) -> bool {
        self.status_code() >= 500
    }
}

/// A fabric-taxonomy error: a kind, a human message, and an open-ended
/// property bag plus optional stack/trace-id for diagnostics.
#[derive(Debug, Error, Clone)]
pub struct FabricError {
    kind: ErrorKind,
    message: String,
    trace_id: Option<String>,
    stack: Option<Vec<String>>,
    properties: Map<String, Value>,
}

impl fmt::Display for FabricError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind.status_code(), kind_name(self.kind), self.message)
    }
}

fn kind_name(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::BadRequest => "BadRequest",
        ErrorKind::Unauthorized => "Unauthorized",
        ErrorKind::Forbidden => "Forbidden",
        ErrorKind::NotFound => "NotFound",
        ErrorKind::PayloadTooLarge => "PayloadTooLarge",
        ErrorKind::Internal => "Internal",
        ErrorKind::NotImplemented => "NotImplemented",
        ErrorKind::DeadlineExceeded => "DeadlineExceeded",
        ErrorKind::NoResponder => "NoResponder",
        ErrorKind::Canceled => "Canceled",
        ErrorKind::Validation => "Validation",
    }
}

macro_rules! kind_ctor {
    ($name:ident, $kind:expr) => {
        pub fn $name(message: impl Into<String>) -> Self {
            Self::new($kind, message)
        }
    };
}

impl FabricError {
    /// Build a new error of the given kind with a message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            trace_id: None,
            stack: None,
            properties: Map::new(),
        }
    }

    kind_ctor!(bad_request, ErrorKind::BadRequest);
    kind_ctor!(unauthorized, ErrorKind::Unauthorized);
    kind_ctor!(forbidden, ErrorKind::Forbidden);
    kind_ctor!(not_found, ErrorKind::NotFound);
    kind_ctor!(payload_too_large, ErrorKind::PayloadTooLarge);
    kind_ctor!(internal, ErrorKind::Internal);
    kind_ctor!(not_implemented, ErrorKind::NotImplemented);
    kind_ctor!(deadline_exceeded, ErrorKind::DeadlineExceeded);
    kind_ctor!(no_responder, ErrorKind::NoResponder);
    kind_ctor!(canceled, ErrorKind::Canceled);
    kind_ctor!(validation, ErrorKind::Validation);

    /// Attach a trace id.
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Attach a captured stack (innermost frame first).
    pub fn with_stack(mut self, stack: Vec<String>) -> Self {
        self.stack = Some(stack);
        self
    }

    /// Attach an arbitrary property. A name beginning with `_` marks the
    /// property as internal-only; [`ErrorEnvelope::render`] always drops it
    /// before the envelope leaves the process.
    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    /// Project this error into the wire [`ErrorEnvelope`].
    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: self.message.clone(),
            status_code: self.status_code(),
            trace: self.trace_id.clone().unwrap_or_default(),
            stack: self.stack.clone(),
            properties: self.properties.clone(),
        }
    }
}

/// The `err` envelope body: `{"err": {...}}`.
///
/// `stack` is only present for diagnostics-enabled callers; [`render`]
/// applies the redaction rules from the error handling design before the
/// envelope is serialized for an untrusted caller.
///
/// [`render`]: ErrorEnvelope::render
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub trace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<Vec<String>>,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ErrorEnvelope {
    /// Render this envelope as `{"err": {...}}`, applying redaction.
    ///
    /// When `redact` is true: the stack is omitted, underscore-prefixed
    /// properties are dropped, and a 5xx `error` message is replaced with
    /// `"internal server error"`. A status outside `[100, 999]` is coerced
    /// to 500. 4xx messages are preserved verbatim even when redacted.
    pub fn render(&self, redact: bool) -> Value {
        let status = if (100..=999).contains(&self.status_code) {
            self.status_code
        } else {
            500
        };
        let message = if redact && status >= 500 {
            "internal server error".to_string()
        } else {
            self.error.clone()
        };

        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(message));
        body.insert("statusCode".to_string(), Value::Number(status.into()));
        body.insert("trace".to_string(), Value::String(self.trace.clone()));
        if !redact {
            if let Some(stack) = &self.stack {
                body.insert(
                    "stack".to_string(),
                    Value::Array(stack.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        for (key, value) in &self.properties {
            if key.starts_with('_') {
                continue;
            }
            body.insert(key.clone(), value.clone());
        }

        let mut root = Map::new();
        root.insert("err".to_string(), Value::Object(body));
        Value::Object(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(ErrorKind::BadRequest.status_code(), 400);
        assert_eq!(ErrorKind::NoResponder.status_code(), 503);
        assert_eq!(ErrorKind::DeadlineExceeded.status_code(), 504);
    }

    #[test]
    fn redaction_replaces_5xx_message_and_drops_stack() {
        let err = FabricError::internal("disk is on fire")
            .with_trace_id("trace-1")
            .with_stack(vec!["frame1".into()]);
        let rendered = err.to_envelope().render(true);
        assert_eq!(rendered["err"]["error"], "internal server error");
        assert!(rendered["err"].get("stack").is_none());
    }

    #[test]
    fn redaction_preserves_4xx_message() {
        let err = FabricError::not_found("widget 1 not found");
        let rendered = err.to_envelope().render(true);
        assert_eq!(rendered["err"]["error"], "widget 1 not found");
    }

    #[test]
    fn underscore_properties_are_always_dropped() {
        let err = FabricError::bad_request("bad input")
            .with_property("_internalDebug", "secret")
            .with_property("field", "email");
        let rendered = err.to_envelope().render(false);
        assert!(rendered["err"].get("_internalDebug").is_none());
        assert_eq!(rendered["err"]["field"], "email");
    }

    #[test]
    fn out_of_range_status_coerces_to_500() {
        let mut envelope = FabricError::internal("x").to_envelope();
        envelope.status_code = 9001;
        let rendered = envelope.render(false);
        assert_eq!(rendered["err"]["statusCode"], 500);
    }
}
