//! Error types for the debug-info indexing library

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("DWARF parsing error: {0}")]
    Gimli(#[from] gimli::Error),
    #[error("Object file error: {0}")]
    Object(#[from] object::Error),
    #[error("no supplementary container attached, but unit {offset:#x} requires one")]
    MissingSupplementary { offset: u64 },
    #[error("indexing run is gone (driver task dropped)")]
    PipelineGone,
    #[error("wait cancelled by caller")]
    WaitCancelled,
}

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;
