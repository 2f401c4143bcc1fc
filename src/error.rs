use thiserror::Error;
use variant_bridge_vm::VmError;

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// A bridge contract violation or a VM error surfaced by a bridge operation.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    #[error("invalid stack index {0}")]
    InvalidIndex(i32),

    #[error("stack overflow: cannot reserve {requested} slots")]
    StackExhausted { requested: usize },

    #[error("unsupported VM type '{0}'")]
    UnsupportedType(&'static str),

    #[error("VM session is closed")]
    SessionClosed,

    #[error(transparent)]
    Vm(#[from] VmError),
}

impl From<BridgeError> for VmError {
    fn from(error: BridgeError) -> Self {
        match error {
            BridgeError::Vm(e) => e,
            other => VmError::runtime(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_into_script_errors() {
        let e: VmError = BridgeError::StackExhausted { requested: 3 }.into();
        assert_eq!(e.to_string(), "stack overflow: cannot reserve 3 slots");
        let e: VmError = BridgeError::Vm(VmError::CallDepth).into();
        assert!(matches!(e, VmError::CallDepth));
    }
}
