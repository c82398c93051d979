use crate::engine::format::Format;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HbmError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(Format),

    #[error("Unsupported usage bits: {0:#x}")]
    UnsupportedUsage(u64),

    #[error("No memory type satisfies the request")]
    NoSuitableMemoryType,

    #[error("Backend allocation failed: {0}")]
    BackendAllocationFailed(String),

    #[error("Re-import into device context failed: {0}")]
    ReimportFailed(String),

    #[error("Buffer is already mapped")]
    AlreadyMapped,

    #[error("Buffer is not mapped")]
    NotMapped,

    #[error("Waiting for the implicit fence failed: {0}")]
    SyncWaitFailed(String),

    #[error("Staging copy failed: {0}")]
    CopyFailed(String),

    #[error("Layout computation overflowed")]
    LayoutOverflow,

    #[error("Invalid parameter: {0}")]
    InvalidParam(String),
}

// A convenient alias
pub type HbmResult<T> = Result<T, HbmError>;
