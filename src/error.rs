//! Typed errors mapped onto the POSIX errno set the on-disk format was designed against.
//!
//! Every fallible core operation returns [`Result<T>`]; callers that face an external,
//! sysfs-like surface convert the final result with [`Error::errno`].

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no space left on device")]
    NoSpace,
    #[error("no such file or directory")]
    NotFound,
    #[error("invalid argument")]
    Invalid,
    #[error("I/O error")]
    Io,
    #[error("file too large")]
    FileTooBig,
    #[error("too many links")]
    TooManyLinks,
    #[error("file name too long")]
    NameTooLong,
    #[error("file exists")]
    Exists,
    #[error("out of memory")]
    NoMemory,
    #[error("not a directory")]
    NotDir,
    #[error("directory not empty")]
    NotEmpty,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("operation not supported")]
    NotSupported,
}

impl Error {
    /// Conventional POSIX errno value (negated, as returned by the original kernel module).
    pub const fn errno(self) -> i32 {
        match self {
            Error::NoSpace => -28,      // ENOSPC
            Error::NotFound => -2,      // ENOENT
            Error::Invalid => -22,      // EINVAL
            Error::Io => -5,            // EIO
            Error::FileTooBig => -27,   // EFBIG
            Error::TooManyLinks => -31, // EMLINK
            Error::NameTooLong => -36,  // ENAMETOOLONG
            Error::Exists => -17,       // EEXIST
            Error::NoMemory => -12,     // ENOMEM
            Error::NotDir => -20,       // ENOTDIR
            Error::NotEmpty => -39,     // ENOTEMPTY
            Error::NotPermitted => -1,  // EPERM
            Error::NotSupported => -95, // ENOTSUPP
        }
    }
}
