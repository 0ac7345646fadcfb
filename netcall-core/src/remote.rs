//! Errors raised on the far side of a call.

use std::fmt::{Display, Formatter};

use crate::value::Value;

/// Kind reported when a stream finished normally.
pub const STOP_ITERATION: &str = "StopIteration";
/// Kind reported when a stream was closed on request.
pub const GENERATOR_EXIT: &str = "GeneratorExit";
pub const DESERIALIZATION_ERROR: &str = "DeserializationError";
pub const LOOKUP_ERROR: &str = "LookupError";
pub const NOT_IMPLEMENTED_ERROR: &str = "NotImplementedError";
pub const TYPE_ERROR: &str = "TypeError";
pub const RUNTIME_ERROR: &str = "RuntimeError";

/// Structured description of an error carried by a FAIL reply.
///
/// A missing traceback marks normal stream termination, or a failure that
/// happened before any handler code ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl RemoteError {
    pub fn new(kind: &str, message: &str, traceback: Option<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.to_string(),
            traceback,
        }
    }

    /// Error raised by running code, with a traceback attached.
    pub fn raised(kind: &str, message: &str, traceback: String) -> Self {
        Self::new(kind, message, Some(traceback))
    }

    pub fn stop_iteration() -> Self {
        Self::new(STOP_ITERATION, "", None)
    }

    pub fn generator_exit() -> Self {
        Self::new(GENERATOR_EXIT, "", None)
    }

    pub fn deserialization(message: &str) -> Self {
        Self::new(DESERIALIZATION_ERROR, message, None)
    }

    /// True when the error only marks the end of a stream.
    pub fn is_termination(&self) -> bool {
        self.traceback.is_none()
    }

    /// Encodes as `[kind, message]` or `[kind, message, traceback]`.
    pub fn to_value(&self) -> Value {
        let mut list = vec![
            Value::Str(self.kind.clone()),
            Value::Str(self.message.clone()),
        ];
        if let Some(tb) = &self.traceback {
            list.push(Value::Str(tb.clone()));
        }
        Value::List(list)
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        let list = value.as_list()?;
        match list {
            [kind, message] => Some(Self::new(kind.as_str()?, message.as_str()?, None)),
            [kind, message, tb] => Some(Self::new(
                kind.as_str()?,
                message.as_str()?,
                Some(tb.as_str()?.to_string()),
            )),
            _ => None,
        }
    }
}

impl Display for RemoteError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for RemoteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_shape() {
        let err = RemoteError::raised("ValueError", "bad", "trace".to_string());
        assert_eq!(RemoteError::from_value(&err.to_value()), Some(err.clone()));
        assert!(!err.is_termination());
        assert_eq!(err.to_string(), "ValueError: bad");

        let end = RemoteError::stop_iteration();
        assert_eq!(end.to_value().as_list().map(|l| l.len()), Some(2));
        assert!(end.is_termination());
    }

    #[test]
    fn rejects_other_shapes() {
        assert_eq!(RemoteError::from_value(&Value::Int(1)), None);
        assert_eq!(
            RemoteError::from_value(&Value::List(vec![Value::Int(1), Value::Int(2)])),
            None
        );
    }
}
