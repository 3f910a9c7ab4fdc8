use thiserror::Error;

/// Contract violations. Rejections (unknown face, spoof, multiple faces) are
/// not errors; they are reported through [`crate::AttendanceOutcome`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("descriptor dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid descriptor value (NaN/Inf)")]
    InvalidDescriptorValue,
    #[error("identity must not be empty")]
    EmptyIdentity,
    #[error("frame buffer holds {got} bytes, expected {expected} for {width}x{height}")]
    InvalidFrame {
        width: u32,
        height: u32,
        expected: usize,
        got: usize,
    },
}
