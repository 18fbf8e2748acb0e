//! Lazy trace messages and error messages.
//!
//! Messages are never rendered on the hot path: instrumentation hands the
//! engine a [`MessageSupplier`] and the text is produced only when a
//! snapshot is built.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A rendered message: short text plus an optional structured detail map
/// for display layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub detail: Option<serde_json::Value>,
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            detail: None,
        }
    }

    pub fn with_detail(text: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            text: text.into(),
            detail: Some(detail),
        }
    }
}

/// Capability that produces a [`Message`] on demand.
///
/// Suppliers must be cheap to construct; any expensive rendering belongs in
/// [`get`](MessageSupplier::get), which runs off the hot path.
pub trait MessageSupplier: Send + Sync {
    fn get(&self) -> Message;
}

impl<F> MessageSupplier for F
where
    F: Fn() -> Message + Send + Sync,
{
    fn get(&self) -> Message {
        self()
    }
}

/// Supplier for a fixed piece of text, the common case at instrumentation
/// sites.
pub fn message_supplier(text: impl Into<String>) -> Arc<dyn MessageSupplier> {
    let message = Message::text(text);
    Arc::new(move || message.clone())
}

/// Error attached to a trace entry or transaction.
///
/// `exception` carries the rendered source-error chain when the error was
/// built from a real error value; bare-text errors leave it `None`, which
/// signals the engine to capture a stack trace instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub exception: Option<String>,
}

impl ErrorMessage {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            exception: None,
        }
    }

    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut rendered = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            rendered.push_str(": ");
            rendered.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            exception: Some(rendered),
        }
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }
}
