use std::collections::TryReserveError;

use thiserror::Error;

use crate::layer::LayerId;

/// Everything the engine can fail with.
///
/// Storage errors (`Allocation`) abort the enclosing mutation. Contract
/// violations (`UnknownCompositeOp`, `FormatMismatch`, ...) are reported at
/// the call that introduced them, never mid-composite.
#[derive(Debug, Error)]
pub enum PaintError {
    #[error("failed to allocate {bytes} bytes of pixel storage")]
    Allocation { bytes: usize },

    #[error("color space mismatch: image uses {expected}, layer uses {found}")]
    FormatMismatch { expected: String, found: String },

    #[error("composite op '{op}' is not available in color space {space}")]
    UnsupportedCompositeOp { op: &'static str, space: String },

    #[error("unknown composite op '{0}'")]
    UnknownCompositeOp(String),

    #[error("unknown color space '{0}'")]
    UnknownColorSpace(String),

    #[error("layer {0} does not exist")]
    InvalidLayer(LayerId),

    #[error("layer {0} is not a group")]
    NotAGroup(LayerId),

    #[error("layer {0} does not own a paint device")]
    NotAPaintLayer(LayerId),

    #[error("pixel is {got} bytes but {space} pixels are {expected} bytes")]
    InvalidPixel {
        space: String,
        expected: usize,
        got: usize,
    },

    #[error("buffer holds {got} bytes, region needs {expected}")]
    BufferSize { expected: usize, got: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),

    #[error("settings error: {0}")]
    Settings(#[from] serde_json::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
}

pub type PaintResult<T> = Result<T, PaintError>;

impl PaintError {
    pub fn allocation(bytes: usize) -> Self {
        Self::Allocation { bytes }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn format_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::FormatMismatch {
            expected: expected.into(),
            found: found.into(),
        }
    }

    /// `true` for errors that leave nothing to retry (storage failures).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Allocation { .. })
    }
}

/// Allocate a zeroed byte buffer, reporting exhaustion instead of aborting.
pub fn try_alloc_bytes(len: usize) -> PaintResult<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_: TryReserveError| PaintError::allocation(len))?;
    buf.resize(len, 0);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_error_is_fatal() {
        assert!(PaintError::allocation(64).is_fatal());
        assert!(!PaintError::Cancelled.is_fatal());
    }

    #[test]
    fn display_mentions_op_and_space() {
        let e = PaintError::UnsupportedCompositeOp {
            op: "hue",
            space: "GRAYA8".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("hue"));
        assert!(msg.contains("GRAYA8"));
    }

    #[test]
    fn try_alloc_bytes_zeroes() {
        let buf = try_alloc_bytes(16).unwrap();
        assert_eq!(buf, vec![0u8; 16]);
    }
}
