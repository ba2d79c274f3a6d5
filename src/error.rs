//! Error type shared by every layer of the core.
//!
//! Capacity exhaustion, lookup misses and I/O failures come back as
//! [`FsError`]. Bugs in callers that would corrupt the bitmap or the inode
//! table (double free, putting an unreferenced inode) panic instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    /// Block device failure, propagated as-is.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata that cannot be decoded.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u32, detail: String },

    /// Not a filesystem this crate understands, or a device too small to format.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    #[error("no free inodes on device {0}")]
    NoFreeInodes(u32),

    #[error("no free zones on device {0}")]
    NoSpace(u32),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name too long ({0} bytes)")]
    NameTooLong(usize),

    #[error("invalid name")]
    InvalidName,

    /// The inode table has no reusable slot.
    #[error("too many open inodes")]
    TooManyOpen,

    #[error("inode {inum} out of range on device {dev}")]
    BadInode { dev: u32, inum: u32 },

    /// Directory lock hand-off misuse.
    #[error("directory lock protocol violation: {0}")]
    LockProtocol(&'static str),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("file exists")]
    Exists,

    #[error("device or resource busy")]
    Busy,

    #[error("device {0} is not mounted")]
    NotMounted(u32),

    #[error("file too big")]
    FileTooBig,

    #[error("cross-device link")]
    CrossDevice,
}

impl FsError {
    /// POSIX errno for this error.
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidName | Self::LockProtocol(_) => libc::EINVAL,
            Self::NoFreeInodes(_) | Self::NoSpace(_) => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NameTooLong(_) => libc::ENAMETOOLONG,
            Self::TooManyOpen => libc::ENFILE,
            Self::BadInode { .. } => libc::EINVAL,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::Exists => libc::EEXIST,
            Self::Busy => libc::EBUSY,
            Self::NotMounted(_) => libc::ENODEV,
            Self::FileTooBig => libc::EFBIG,
            Self::CrossDevice => libc::EXDEV,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_map_to_enospc() {
        assert_eq!(FsError::NoFreeInodes(1).to_errno(), libc::ENOSPC);
        assert_eq!(FsError::NoSpace(1).to_errno(), libc::ENOSPC);
        assert_eq!(FsError::TooManyOpen.to_errno(), libc::ENFILE);
    }

    #[test]
    fn io_error_keeps_os_errno() {
        let err = FsError::from(std::io::Error::from_raw_os_error(libc::EROFS));
        assert_eq!(err.to_errno(), libc::EROFS);
        let err = FsError::from(std::io::Error::other("short read"));
        assert_eq!(err.to_errno(), libc::EIO);
    }

    #[test]
    fn display_names_the_entry() {
        let err = FsError::NotFound("foo".to_owned());
        assert_eq!(err.to_string(), "not found: foo");
    }
}
