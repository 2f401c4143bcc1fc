//! VM error type.

use thiserror::Error;

use crate::value::Value;

/// An error raised inside the VM.
///
/// `Runtime` carries the script-visible error value; it is what `pcall`
/// leaves on the stack. The remaining variants are raised by the VM itself
/// and surface to scripts as their message string.
#[derive(Debug, Clone, Error)]
pub enum VmError {
    #[error("{}", describe(.0))]
    Runtime(Value),

    #[error("stack overflow")]
    StackOverflow,

    #[error("C stack overflow")]
    CallDepth,

    #[error("invalid stack index {0}")]
    InvalidIndex(i32),

    #[error("attempt to use a closed VM")]
    Closed,
}

impl VmError {
    /// A runtime error whose value is the string `message`.
    pub fn runtime(message: impl AsRef<str>) -> Self {
        VmError::Runtime(Value::string(message.as_ref()))
    }

    /// The value a protected call leaves on the stack for this error.
    pub fn to_value(&self) -> Value {
        match self {
            VmError::Runtime(v) => v.clone(),
            other => Value::string(&other.to_string()),
        }
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string_lossy(),
        Value::Number(_) => value.to_string(),
        other => format!("({} error object)", other.type_of().name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        assert_eq!(VmError::runtime("boom").to_string(), "boom");
        assert_eq!(VmError::CallDepth.to_string(), "C stack overflow");
        assert_eq!(VmError::Runtime(Value::Boolean(true)).to_string(), "(boolean error object)");
    }

    #[test]
    fn error_values() {
        assert!(matches!(VmError::StackOverflow.to_value(), Value::String(_)));
        assert!(matches!(VmError::Runtime(Value::Number(1.0)).to_value(), Value::Number(_)));
    }
}
