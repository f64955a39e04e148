//! Error types for the invocation agent.

use crate::panic::{InvocationError, type_name_of};
use std::any::TypeId;
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

/// Boxed error type returned to the Lambda runtime.
pub type BoxError = lambda_runtime::Error;

/// A specialised Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur while configuring or constructing the agent.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum AgentError {
    /// Configuration error.
    #[error("configuration error")]
    Config(#[source] Box<figment::Error>),

    /// The handler handed to the agent has an unsupported shape.
    #[error(transparent)]
    HandlerShape(#[from] HandlerShapeError),

    /// Tracing subscriber initialisation failed.
    #[error("failed to initialise tracing")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),
}

impl From<figment::Error> for AgentError {
    fn from(err: figment::Error) -> Self {
        AgentError::Config(Box::new(err))
    }
}

/// Wrap-time rejection of a handler whose signature cannot be adapted.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerShapeError {
    /// No handler was supplied.
    #[error("handler is nil")]
    Nil,

    /// The supplied value is not callable.
    #[error("handler kind {kind} is not func")]
    NotFunc { kind: String },

    #[error("handlers may not take more than two arguments, but handler takes {count}")]
    TooManyArguments { count: usize },

    #[error("handler takes two arguments, but the first is not Context. got {got}")]
    FirstArgumentNotContext { got: String },

    #[error("handler may not return more than two values")]
    TooManyReturnValues,

    #[error("handler returns two values, but the second does not implement error")]
    SecondReturnNotError,
}

/// Error produced by an adapted handler.
///
/// Wraps the handler's own error without altering its message, and keeps the
/// short type name of the original so it can be recorded on the report.
#[derive(Debug)]
pub struct HandlerError {
    name: Cow<'static, str>,
    inner: BoxError,
}

impl HandlerError {
    /// Wraps an error returned by handler code.
    ///
    /// When the handler's error type is already [`BoxError`], the name is
    /// taken from the boxed value if it is one of a few well-known error
    /// types, and is `Error` otherwise.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<BoxError> + 'static,
    {
        let inner = err.into();
        let name = if TypeId::of::<E>() == TypeId::of::<BoxError>() {
            boxed_type_name(inner.as_ref()).unwrap_or_else(type_name_of::<E>)
        } else {
            type_name_of::<E>()
        };

        Self {
            name: Cow::Owned(name),
            inner,
        }
    }

    /// Wraps a payload decoding failure.
    pub fn decode(err: serde_json::Error) -> Self {
        Self::new(err)
    }

    /// Creates an error from a bare message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            name: Cow::Borrowed("Error"),
            inner: message.into().into(),
        }
    }

    /// Short type name of the wrapped error.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the error exactly as the handler produced it.
    pub fn into_inner(self) -> BoxError {
        self.inner
    }
}

/// Concrete name of a boxed error, for the types that can be recognised.
fn boxed_type_name(err: &(dyn std::error::Error + Send + Sync + 'static)) -> Option<String> {
    macro_rules! recognise {
        ($($ty:ty),* $(,)?) => {
            $(
                if err.is::<$ty>() {
                    return Some(type_name_of::<$ty>());
                }
            )*
        };
    }

    recognise!(
        std::num::ParseIntError,
        std::num::ParseFloatError,
        std::num::TryFromIntError,
        std::str::ParseBoolError,
        std::str::Utf8Error,
        std::string::FromUtf8Error,
        std::net::AddrParseError,
        std::fmt::Error,
        InvocationError,
        HandlerShapeError,
    );
    None
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("widget jammed")]
    struct WidgetError;

    #[test]
    fn test_boxed_error_named_after_concrete_type() {
        let parse = "12x".parse::<u32>().unwrap_err();
        let err = HandlerError::new(BoxError::from(parse));
        assert_eq!(err.name(), "ParseIntError");
        assert_eq!(err.to_string(), "invalid digit found in string");
        assert!(err.into_inner().is::<std::num::ParseIntError>());
    }

    #[test]
    fn test_shape_error_messages() {
        assert_eq!(HandlerShapeError::Nil.to_string(), "handler is nil");
        assert_eq!(
            HandlerShapeError::NotFunc {
                kind: "struct".to_string()
            }
            .to_string(),
            "handler kind struct is not func"
        );
        assert_eq!(
            HandlerShapeError::TooManyArguments { count: 3 }.to_string(),
            "handlers may not take more than two arguments, but handler takes 3"
        );
        assert_eq!(
            HandlerShapeError::FirstArgumentNotContext {
                got: "String".to_string()
            }
            .to_string(),
            "handler takes two arguments, but the first is not Context. got String"
        );
    }

    #[test]
    fn test_handler_error_keeps_message_and_name() {
        let err = HandlerError::new(WidgetError);
        assert_eq!(err.to_string(), "widget jammed");
        assert_eq!(err.name(), "WidgetError");
        assert_eq!(err.into_inner().to_string(), "widget jammed");
    }

    #[test]
    fn test_boxed_handler_error_name() {
        let boxed: BoxError = "plain failure".into();
        let err = HandlerError::new(boxed);
        assert_eq!(err.name(), "Error");
        assert_eq!(err.to_string(), "plain failure");
    }

    #[test]
    fn test_figment_error_converts_to_config() {
        let err: AgentError = figment::Error::from("bad value".to_string()).into();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
