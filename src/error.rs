use onlyerror::Error;

/// Everything the disk and the façade can report. None of these abort the
/// process; a failed operation is one-shot and never retried internally.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("no record matches the requested id or name")]
    NotFound,
    #[error("inode bloc list or directory bloc is full")]
    CapacityExceeded,
    #[error("disk file cannot be opened")]
    ResourceUnavailable,
    #[error("record payload cannot be decoded")]
    CorruptRecord,
    #[error("id {0} is already used by a live record")]
    CollisionRetry(u32),
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("an entry with this name already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotDirectory,
    #[error("not a regular file")]
    NotRegularFile,
    #[error("invalid file name")]
    InvalidName,
    #[error("cannot move a directory into itself")]
    InvalidMove,
    #[error("i/o failure: {0}")]
    Io(std::io::ErrorKind),
    #[error("diagnostic encoding failed")]
    Encoding,
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.kind())
    }
}

pub type FsResult<T> = core::result::Result<T, FsError>;
