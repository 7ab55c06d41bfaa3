//! The result taxonomy shared by every engine operation.
//!
//! Internally fallible operations return `Result<T, FsError>`; the guest-facing
//! completion blocks carry a [`Status`], which is the wire projection of either
//! outcome. The two enums deliberately mirror each other so the mapping stays a
//! straight projection.

/// Completion status visible to the guest kernel.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Operation completed, outputs are valid.
    Success = 0,
    /// The worker has not produced a result yet.
    Pending,
    /// Final path segment not found.
    NameNotFound,
    /// Intermediate directory missing.
    PathNotFound,
    /// The path resolved to the root directory of a partition.
    IsRootDir,
    /// Attribute/flag mismatch: the object is a directory.
    IsADirectory,
    /// Attribute/flag mismatch: the object is not a directory.
    NotADirectory,
    /// DELETE_ON_CLOSE requested on a read-only file.
    CannotDelete,
    /// Insufficient free clusters.
    Full,
    /// Delete requested on a non-empty directory.
    NotEmpty,
    /// Persistent-structure inconsistency.
    Corrupt,
    /// Host I/O failure.
    Error,
    /// Access-check denial.
    Failed,
}

/// Failure kinds produced by the FATX engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FsError {
    #[error("final path segment not found")]
    NameNotFound,
    #[error("intermediate directory missing")]
    PathNotFound,
    #[error("object is a directory")]
    IsADirectory,
    #[error("object is not a directory")]
    NotADirectory,
    #[error("cannot delete a read-only file")]
    CannotDelete,
    #[error("insufficient free clusters")]
    Full,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("persistent structure is corrupted")]
    Corrupt,
    #[error("host i/o failure")]
    Error,
    #[error("access denied")]
    Failed,
}

impl FsError {
    pub fn status(self) -> Status {
        match self {
            FsError::NameNotFound => Status::NameNotFound,
            FsError::PathNotFound => Status::PathNotFound,
            FsError::IsADirectory => Status::IsADirectory,
            FsError::NotADirectory => Status::NotADirectory,
            FsError::CannotDelete => Status::CannotDelete,
            FsError::Full => Status::Full,
            FsError::NotEmpty => Status::NotEmpty,
            FsError::Corrupt => Status::Corrupt,
            FsError::Error => Status::Error,
            FsError::Failed => Status::Failed,
        }
    }
}

impl From<FsError> for Status {
    fn from(err: FsError) -> Self {
        err.status()
    }
}

impl Status {
    /// Projects an engine result onto the wire status.
    pub fn from_result<T>(result: &Result<T, FsError>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(err) => err.status(),
        }
    }
}
