//! `DistVectorError`: unified error type for dist-vector public APIs.
//!
//! Every fatal condition aborts the specific operation with a descriptive
//! error; no operation is retried and no partial result is committed.

use thiserror::Error;

/// Unified error type for dist-vector operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistVectorError {
    /// Operand vectors have different global sizes.
    #[error("dimension mismatch: expected global size {expected}, found {found}")]
    DimensionMismatch { expected: u64, found: u64 },
    /// Operation requires identical partition layouts on both operands.
    #[error("operands are partitioned differently; operation requires identical layouts")]
    DifferentLayout,
    /// A global index was outside the vector's global range.
    #[error("global index {index} out of range (global size {global_len})")]
    IndexOutOfRange { index: u64, global_len: u64 },
    /// A global index is valid but not owned by this participant.
    #[error("global index {0} is not locally owned")]
    NotLocallyOwned(u64),
    /// A destination index has no owner in the source partition.
    #[error("global index {0} has no owner in the source partition")]
    UnownedIndex(u64),
    /// Division by a zero scalar.
    #[error("division by zero scalar")]
    ZeroDivision,
    /// A scalar argument was NaN or infinite.
    #[error("scalar argument is not finite")]
    NonFiniteScalar,
    /// The requested combine mode (or other capability) is not implemented.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),
    /// An externally supplied communication pattern had the wrong kind.
    #[error("communication pattern type mismatch: expected {expected}, found {found}")]
    PatternTypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// A cached or supplied plan does not match the layouts of the operands.
    #[error("redistribution plan was built for different partition layouts")]
    PlanLayoutMismatch,
    /// The sparse import set has mismatched index/value lengths.
    #[error("sparse import length mismatch: {indices} indices vs {values} values")]
    ImportLengthMismatch { indices: usize, values: usize },
    /// A metadata count exceeded its fixed-width wire field.
    #[error("wire count overflow: {0} does not fit in 32 bits")]
    WireCountOverflow(usize),
    /// A partition layout failed construction-time validation.
    #[error("invalid partition layout: {0}")]
    InvalidLayout(String),
    /// A point-to-point or collective exchange with a neighbor failed.
    #[error("communication error with rank {neighbor}: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<CommErrorKind>,
    },
    /// Writing a textual dump failed.
    #[error("I/O error while printing vector: {0}")]
    Io(String),
}

/// Boxed payload for [`DistVectorError::CommError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CommErrorKind(pub String);

impl DistVectorError {
    /// Shorthand used by the exchange stages.
    pub fn comm(neighbor: usize, msg: impl Into<String>) -> Self {
        DistVectorError::CommError {
            neighbor,
            source: Box::new(CommErrorKind(msg.into())),
        }
    }
}
