use crate::error::CanopyError;
use crate::overlay::types::{EntryKind, EntryStat};
use fuser::{FileAttr, FileType};
use std::io;

/// Block size reported to the kernel for every entry.
const BLKSIZE: u32 = 4096;

/// Map std::io::Error to appropriate libc error code.
/// This provides more specific error codes than generic EIO for better debugging.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    // The raw OS error is the most accurate answer when there is one
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::TimedOut => libc::ETIMEDOUT,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::WouldBlock => libc::EAGAIN,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

/// Errno the kernel sees for a failed stack operation.
pub(crate) fn error_to_errno(err: &CanopyError) -> i32 {
    match err {
        CanopyError::NotFound(_) => libc::ENOENT,
        CanopyError::AlreadyExists(_) => libc::EEXIST,
        CanopyError::NotEmpty(_) => libc::ENOTEMPTY,
        CanopyError::NotADirectory(_) => libc::ENOTDIR,
        CanopyError::IsADirectory(_) => libc::EISDIR,
        CanopyError::InvalidPath(_) => libc::EINVAL,
        CanopyError::Stale(_) => libc::ESTALE,
        CanopyError::Locked(_) | CanopyError::PathInUse(_) => libc::EBUSY,
        CanopyError::CopyUpFailed { source, .. } => match source.raw_os_error() {
            Some(code) => code,
            None => libc::EIO,
        },
        CanopyError::Io(e) => io_error_to_libc(e),
        CanopyError::LayerConflict { .. } => libc::EIO,
        _ => libc::EIO,
    }
}

pub(crate) fn kind_to_filetype(kind: EntryKind) -> FileType {
    match kind {
        EntryKind::File => FileType::RegularFile,
        EntryKind::Directory => FileType::Directory,
        EntryKind::Symlink => FileType::Symlink,
        // Device nodes and sockets are not created by the stack; a lower
        // layer holding one is served as an opaque file.
        EntryKind::Special => FileType::RegularFile,
    }
}

pub(crate) fn stat_to_fileattr(stat: &EntryStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: stat.size,
        blocks: stat.blocks,
        atime: stat.atime,
        mtime: stat.mtime,
        ctime: stat.ctime,
        crtime: stat.ctime,
        kind: kind_to_filetype(stat.kind),
        perm: (stat.perm & 0o7777) as u16,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: stat.rdev,
        blksize: BLKSIZE,
        flags: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_copy_up_failure_keeps_underlying_errno() {
        let err = CanopyError::copy_up("a", io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(error_to_errno(&err), libc::ENOSPC);

        let err = CanopyError::copy_up("a", io::Error::other("no errno"));
        assert_eq!(error_to_errno(&err), libc::EIO);
    }

    #[test]
    fn test_layer_errors_map_to_posix_codes() {
        assert_eq!(
            error_to_errno(&CanopyError::NotFound("x".into())),
            libc::ENOENT
        );
        assert_eq!(
            error_to_errno(&CanopyError::Stale("job".into())),
            libc::ESTALE
        );
        assert_eq!(
            error_to_errno(&CanopyError::LayerConflict {
                path: PathBuf::from("x"),
                detail: String::new(),
            }),
            libc::EIO
        );
        assert_eq!(
            error_to_errno(&CanopyError::NotEmpty(PathBuf::from("d"))),
            libc::ENOTEMPTY
        );
    }

    #[test]
    fn test_io_error_kind_fallback() {
        let err = io::Error::new(io::ErrorKind::AlreadyExists, "exists");
        assert_eq!(io_error_to_libc(&err), libc::EEXIST);
    }
}
