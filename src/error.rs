use thiserror::Error;

/// Structural failures. These abort the whole run.
#[derive(Debug, Error)]
pub(crate) enum AnalysisError {
    #[error("malformed module: {0}")]
    MalformedModule(String),
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{0}` has no entry block")]
    MissingEntryBlock(String),
    #[error("unsupported type in signature of `{func}`: {ty}")]
    UnsupportedSignature { func: String, ty: String },
    #[error("solver `{0}` is not available in this build")]
    SolverUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<wasmparser::BinaryReaderError> for AnalysisError {
    fn from(err: wasmparser::BinaryReaderError) -> Self {
        Self::MalformedModule(err.to_string())
    }
}

/// Failures that only end the path that triggered them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub(crate) enum PathError {
    #[error("unsupported instruction `{0}`")]
    UnsupportedInstruction(String),
    #[error("unsupported value type {0}")]
    UnsupportedType(String),
    #[error("read of uninitialized {kind} {index}")]
    UninitializedRead { kind: &'static str, index: u32 },
    #[error("malformed memory access: {0}")]
    MalformedMemoryAccess(String),
    #[error("operand stack underflow at `{0}`")]
    StackUnderflow(String),
}

/// Malformed operator input in guided mode. Always answered with a re-prompt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub(crate) enum OperatorInputError {
    #[error("empty input")]
    Empty,
    #[error("`{0}` is not a state index")]
    NotAnIndex(String),
    #[error("state index {index} is out of range (1 -- {count})")]
    IndexOutOfRange { index: usize, count: usize },
    #[error("`{0}` is not one of T, F, f, u")]
    UnknownBranch(String),
    #[error("branch `{0}` is not available here")]
    UnavailableBranch(char),
    #[error("unexpected suffix `{0}`, only `i` is accepted")]
    BadSuffix(String),
}
