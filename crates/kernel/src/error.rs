use std::path::PathBuf;

/// Represents all possible errors that can occur in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error occurred while loading the configuration file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(#[from] config::Error),

    /// Error occurred while reading data from procfs.
    #[error("Failed to read procfs info: {0}")]
    ProcfsReadFailed(#[from] procfs::ProcError),

    /// Error occurred while performing I/O operation on a file.
    #[error("Failed to perform I/O operation on file: {0}")]
    FileIOFailed(#[from] std::io::Error),

    /// Error occurred while performing a POSIX fadvise operation.
    ///
    /// # See Also
    ///
    /// [`readahead`](crate::utils::readahead)
    #[error("Failed to readahead: {0}")]
    ReadaheadFailed(#[from] nix::Error),

    /// The exe associated with a markov edge has been deallocated.
    #[error("Exe associated with markov has been deallocated")]
    ExeMarkovDeallocated,

    /// The path is invalid.
    #[error("Path is invalid: {0}")]
    InvalidPath(PathBuf),

    /// A glob in the exclude list failed to compile.
    #[error("Invalid exclude pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: globset::Error,
    },
}
