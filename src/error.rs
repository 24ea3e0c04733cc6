//! Error types shared by the data-movement engines.
//!
//! Every failure is either detected synchronously, before any work is
//! enqueued (precondition and unsupported-operation violations), or it
//! is an asynchronous device fault that surfaces at the next
//! synchronization point.

use thiserror::Error;

use crate::block::dtype::{CacheFormat, DType, Encoding};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("both buffers are host-resident; at least one side must be on a device")]
    NoDeviceSide,

    #[error("buffers must be on same device (got devices {src} and {dst})")]
    DeviceMismatch { src: usize, dst: usize },

    #[error("{op} requires device-resident buffers")]
    DeviceOnly { op: &'static str },

    #[error("{op} requires a host-resident buffer")]
    HostOnly { op: &'static str },

    #[error("shape mismatch: {context} ({left:?} vs {right:?})")]
    ShapeMismatch {
        context: &'static str,
        left: Vec<usize>,
        right: Vec<usize>,
    },

    #[error("dtype mismatch: {context} ({left} vs {right})")]
    DtypeMismatch {
        context: &'static str,
        left: DType,
        right: DType,
    },

    #[error("key cache has {keys} layers but value cache has {values}")]
    LayerCountMismatch { keys: usize, values: usize },

    #[error("block index {index} out of range for {num_blocks} blocks")]
    BlockOutOfRange { index: u32, num_blocks: usize },

    #[error("slot {slot} out of range for {num_slots} slots")]
    SlotOutOfRange { slot: i64, num_slots: usize },

    #[error("token buffers hold {tokens} tokens but the slot mapping has {slots} entries")]
    TokenCountMismatch { tokens: usize, slots: usize },

    #[error("scale must be positive (got {scale})")]
    NonPositiveScale { scale: f32 },

    #[error("element type of width {width} does not match a {dtype} buffer")]
    ElemWidthMismatch { dtype: DType, width: usize },

    #[error("buffer holds {expected} elements but {actual} were supplied")]
    ElemCountMismatch { expected: usize, actual: usize },

    #[error("no {input} -> {cache} scatter path for the {format:?} cache format")]
    UnsupportedScatter {
        input: DType,
        cache: DType,
        format: CacheFormat,
    },

    #[error("no conversion from {src} to {dst} with the {encoding:?} encoding")]
    UnsupportedConversion {
        src: DType,
        dst: DType,
        encoding: Encoding,
    },

    #[error("the flat cache layout does not support quantized writes")]
    FlatLayoutQuantization,

    #[error("device fault surfaced at synchronization: {0}")]
    ExecutionFault(String),
}

/// Coarse failure category, for callers that branch on class rather
/// than on the specific violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Structural precondition violated; nothing was enqueued or
    /// written.
    Precondition,
    /// The requested dtype/encoding combination has no implementation.
    Unsupported,
    /// A device-level fault latched by earlier work.
    ExecutionFault,
}

impl EngineError {
    /// Classifies this error into one of the three failure categories.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::UnsupportedScatter { .. }
            | EngineError::UnsupportedConversion { .. }
            | EngineError::FlatLayoutQuantization => ErrorKind::Unsupported,
            EngineError::ExecutionFault(_) => ErrorKind::ExecutionFault,
            _ => ErrorKind::Precondition,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(EngineError::NoDeviceSide.kind(), ErrorKind::Precondition);
        assert_eq!(
            EngineError::FlatLayoutQuantization.kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            EngineError::ExecutionFault("boom".into()).kind(),
            ErrorKind::ExecutionFault
        );
    }

    #[test]
    fn test_device_mismatch_message() {
        let err = EngineError::DeviceMismatch { src: 0, dst: 1 };
        assert!(err.to_string().contains("must be on same device"));
    }
}
