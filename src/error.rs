use thiserror::Error;

pub type Result<T> = std::result::Result<T, CopyError>;

/// Error taxonomy for the copy tool. Each variant carries the message shown
/// to the user and maps to a distinct process exit code.
#[derive(Error, Debug)]
pub enum CopyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    Syntax(String),

    #[error("file error: {0}")]
    File(String),

    #[error("lock error: {0}")]
    Flock(String),

    #[error("medium or hardware error: {0}")]
    MediumHard(String),

    #[error("unit attention: {0}")]
    UnitAttention(String),

    #[error("aborted command: {0}")]
    AbortedCommand(String),

    #[error("device not ready: {0}")]
    NotReady(String),

    #[error("invalid operation: {0}")]
    InvalidOp(String),

    #[error("protection information error")]
    Protection,

    #[error("protection information error (with info)")]
    ProtectionWithInfo,

    #[error("{0}")]
    Other(String),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl CopyError {
    pub fn syntax<T: Into<String>>(msg: T) -> Self {
        Self::Syntax(msg.into())
    }

    pub fn file<T: Into<String>>(msg: T) -> Self {
        Self::File(msg.into())
    }

    pub fn flock<T: Into<String>>(msg: T) -> Self {
        Self::Flock(msg.into())
    }

    pub fn medium<T: Into<String>>(msg: T) -> Self {
        Self::MediumHard(msg.into())
    }

    pub fn unit_attention<T: Into<String>>(msg: T) -> Self {
        Self::UnitAttention(msg.into())
    }

    pub fn aborted<T: Into<String>>(msg: T) -> Self {
        Self::AbortedCommand(msg.into())
    }

    pub fn not_ready<T: Into<String>>(msg: T) -> Self {
        Self::NotReady(msg.into())
    }

    pub fn invalid_op<T: Into<String>>(msg: T) -> Self {
        Self::InvalidOp(msg.into())
    }

    pub fn other<T: Into<String>>(msg: T) -> Self {
        Self::Other(msg.into())
    }

    /// Process exit code, following the sg3_utils numbering the tool's
    /// predecessors established.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Syntax(_) => 1,
            Self::NotReady(_) => 2,
            Self::MediumHard(_) => 3,
            Self::UnitAttention(_) => 6,
            Self::InvalidOp(_) => 9,
            Self::Protection => 10,
            Self::AbortedCommand(_) => 11,
            Self::ProtectionWithInfo => 14,
            Self::File(_) | Self::Io(_) => 15,
            Self::Flock(_) => 90,
            Self::Other(_) | Self::Generic(_) => 99,
        }
    }
}
