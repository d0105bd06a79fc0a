//! Error taxonomy for everything observable across the bridge
//!
//! Every failure a script can see is a [`BridgeError`] with a stable
//! [`ErrorKind`] and `ERR_*` code. Native implementations raise typed failures
//! with [`Exception`]; anything else is reported as unexpected.

use crate::registration_error::RegistrationError;
use crate::shared::ObjectId;
use crate::value::JsValue;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Alias used throughout the bridge.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Machine-readable category of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Arity,
    ArgumentConversion,
    Implementation,
    Unexpected,
    ContextLost,
    ObjectNotFound,
    NotInstalled,
    FunctionNotFound,
    UnknownClass,
    JavaScript,
    Registration,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Arity => "ArityError",
            ErrorKind::ArgumentConversion => "ArgumentConversionError",
            ErrorKind::Implementation => "ImplementationError",
            ErrorKind::Unexpected => "UnexpectedError",
            ErrorKind::ContextLost => "ContextLostError",
            ErrorKind::ObjectNotFound => "ObjectNotFoundError",
            ErrorKind::NotInstalled => "NotInstalledError",
            ErrorKind::FunctionNotFound => "FunctionNotFoundError",
            ErrorKind::UnknownClass => "UnknownClassError",
            ErrorKind::JavaScript => "JavaScriptError",
            ErrorKind::Registration => "RegistrationError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure raised on purpose by a native implementation.
///
/// ```ignore
/// return Err(Exception::new("ERR_NOT_FOUND", "no such contact").into());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Exception {
    code: String,
    message: String,
}

impl Exception {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a single raw value could not become the declared native type.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConversionError {
    #[error("expected {expected}, received {received}")]
    TypeMismatch {
        expected: String,
        received: &'static str,
    },

    #[error("number {value} is not representable as {expected}")]
    OutOfRange { value: f64, expected: &'static str },

    #[error("element {index}: {source}")]
    Element {
        index: usize,
        #[source]
        source: Box<ConversionError>,
    },

    #[error("shared object {id} does not exist in this runtime")]
    ObjectNotFound { id: ObjectId },

    #[error("shared object {id} is a '{actual}', expected '{expected}'")]
    WrongClass {
        id: ObjectId,
        expected: String,
        actual: String,
    },

    #[error("{0}")]
    Custom(String),
}

/// Top-level error type for bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("'{function}' takes {expected} argument(s), but received {received}")]
    Arity {
        function: String,
        expected: usize,
        received: usize,
    },

    #[error("argument {index} of '{function}' cannot be cast to {expected}: {source}")]
    ArgumentConversion {
        function: String,
        index: usize,
        expected: String,
        #[source]
        source: ConversionError,
    },

    #[error("call to '{module}.{function}' has been rejected: {message}")]
    Implementation {
        module: String,
        function: String,
        code: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("unexpected failure in '{module}.{function}': {message}")]
    Unexpected {
        module: String,
        function: String,
        message: String,
    },

    #[error("context lost: {reason}")]
    ContextLost { reason: String },

    #[error("shared object {id} was not found")]
    ObjectNotFound { id: ObjectId },

    #[error("runtime is not installed")]
    NotInstalled,

    #[error("'{function}' is not a member of module '{module}'")]
    FunctionNotFound { module: String, function: String },

    #[error("class '{name}' is not registered in this runtime")]
    UnknownClass { name: String },

    #[error("uncaught JavaScript exception: {message}")]
    JavaScript { message: String },

    #[error(transparent)]
    Registration(#[from] RegistrationError),
}

impl BridgeError {
    pub fn context_lost(reason: impl Into<String>) -> Self {
        BridgeError::ContextLost {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Arity { .. } => ErrorKind::Arity,
            BridgeError::ArgumentConversion { .. } => ErrorKind::ArgumentConversion,
            BridgeError::Implementation { .. } => ErrorKind::Implementation,
            BridgeError::Unexpected { .. } => ErrorKind::Unexpected,
            BridgeError::ContextLost { .. } => ErrorKind::ContextLost,
            BridgeError::ObjectNotFound { .. } => ErrorKind::ObjectNotFound,
            BridgeError::NotInstalled => ErrorKind::NotInstalled,
            BridgeError::FunctionNotFound { .. } => ErrorKind::FunctionNotFound,
            BridgeError::UnknownClass { .. } => ErrorKind::UnknownClass,
            BridgeError::JavaScript { .. } => ErrorKind::JavaScript,
            BridgeError::Registration(_) => ErrorKind::Registration,
        }
    }

    /// Stable code surfaced to scripts as `error.code`.
    pub fn code(&self) -> &str {
        match self {
            BridgeError::Arity { .. } => "ERR_INVALID_ARGS_NUMBER",
            BridgeError::ArgumentConversion { .. } => "ERR_ARGUMENT_CAST",
            BridgeError::Implementation { code, .. } => code,
            BridgeError::Unexpected { .. } => "ERR_UNEXPECTED",
            BridgeError::ContextLost { .. } => "ERR_CONTEXT_LOST",
            BridgeError::ObjectNotFound { .. } => "ERR_OBJECT_NOT_FOUND",
            BridgeError::NotInstalled => "ERR_RUNTIME_NOT_INSTALLED",
            BridgeError::FunctionNotFound { .. } => "ERR_FUNCTION_NOT_FOUND",
            BridgeError::UnknownClass { .. } => "ERR_UNKNOWN_CLASS",
            BridgeError::JavaScript { .. } => "ERR_JAVASCRIPT",
            BridgeError::Registration(_) => "ERR_REGISTRATION",
        }
    }

    /// `{ code, kind, message }` object handed to the awaiting script.
    pub fn to_js(&self) -> JsValue {
        JsValue::object([
            ("code", JsValue::from(self.code())),
            ("kind", JsValue::from(self.kind().as_str())),
            ("message", JsValue::from(self.to_string())),
        ])
    }

    /// Re-tag a failure returned by a native implementation.
    ///
    /// Typed failures ([`Exception`] or a nested [`BridgeError`]) keep their
    /// code; anything else becomes [`BridgeError::Unexpected`].
    pub(crate) fn from_implementation(module: &str, function: &str, error: anyhow::Error) -> Self {
        if let Some(exception) = error.downcast_ref::<Exception>() {
            return BridgeError::Implementation {
                module: module.to_string(),
                function: function.to_string(),
                code: exception.code().to_string(),
                message: exception.message().to_string(),
                source: Some(Box::new(exception.clone())),
            };
        }
        match error.downcast::<BridgeError>() {
            Ok(inner) => BridgeError::Implementation {
                module: module.to_string(),
                function: function.to_string(),
                code: inner.code().to_string(),
                message: inner.to_string(),
                source: Some(Box::new(inner)),
            },
            Err(other) => BridgeError::Unexpected {
                module: module.to_string(),
                function: function.to_string(),
                message: format!("{other:#}"),
            },
        }
    }

    /// Wrap a caught panic payload.
    pub(crate) fn from_panic(module: &str, function: &str, payload: Box<dyn Any + Send>) -> Self {
        BridgeError::Unexpected {
            module: module.to_string(),
            function: function.to_string(),
            message: panic_message(payload.as_ref()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked with a non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceptions_keep_their_code() {
        let error = anyhow::Error::new(Exception::new("ERR_NO_CONTACT", "contact missing"));
        let bridged = BridgeError::from_implementation("Contacts", "get", error);
        assert_eq!(bridged.kind(), ErrorKind::Implementation);
        assert_eq!(bridged.code(), "ERR_NO_CONTACT");
        assert!(bridged.to_string().contains("Contacts.get"));
    }

    #[test]
    fn nested_bridge_errors_are_tagged() {
        let error = anyhow::Error::new(BridgeError::ObjectNotFound {
            id: ObjectId::from_raw(9),
        });
        let bridged = BridgeError::from_implementation("Files", "read", error);
        assert_eq!(bridged.kind(), ErrorKind::Implementation);
        assert_eq!(bridged.code(), "ERR_OBJECT_NOT_FOUND");
    }

    #[test]
    fn untyped_failures_are_unexpected() {
        let bridged =
            BridgeError::from_implementation("Files", "read", anyhow::anyhow!("disk on fire"));
        assert_eq!(bridged.kind(), ErrorKind::Unexpected);
        assert_eq!(bridged.code(), "ERR_UNEXPECTED");
        assert!(bridged.to_string().contains("disk on fire"));
    }

    #[test]
    fn js_form_carries_code_and_message() {
        let error = BridgeError::Arity {
            function: "add".into(),
            expected: 2,
            received: 1,
        };
        let js = error.to_js();
        assert_eq!(js.get("code"), Some(&JsValue::from("ERR_INVALID_ARGS_NUMBER")));
        assert_eq!(js.get("kind"), Some(&JsValue::from("ArityError")));
    }

    #[test]
    fn panic_payloads_are_described() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        let error = BridgeError::from_panic("M", "f", payload);
        assert!(error.to_string().contains("panicked: boom"));
    }
}
