// SPDX-License-Identifier: GPL-3.0-only

//! Verification of file descriptors received from callers.
//!
//! A [`SafeFd`] pairs a received descriptor with the host path it was
//! checked against. It can only be built by [`verify_fd`].

use std::{
    ffi::OsStr,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
};

use rustix::fs::{Access, FileType, OFlags};

use crate::app_info::AppInfo;

const DELETED_SUFFIX: &[u8] = b" (deleted)";

#[derive(Debug, thiserror::Error)]
pub enum FdError {
    #[error("not a directory")]
    NotDirectory,
    #[error("not a regular file")]
    NotRegular,
    #[error("file name is not usable")]
    InvalidFilename,
    #[error("permission denied")]
    PermissionDenied,
    #[error("O_PATH file descriptors are not supported for this caller")]
    NotSupported,
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("path {} does not match the file descriptor", .0.display())]
    PathMismatch(PathBuf),
}

impl From<rustix::io::Errno> for FdError {
    fn from(err: rustix::io::Errno) -> Self {
        FdError::Io(err.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Any,
    Directory,
    Regular,
}

#[derive(Debug)]
pub struct SafeFd {
    fd: OwnedFd,
    path: PathBuf,
    writable: bool,
    directory: bool,
}

impl SafeFd {
    /// Host path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn is_directory(&self) -> bool {
        self.directory
    }

    pub fn uri(&self) -> Option<String> {
        url::Url::from_file_path(&self.path)
            .ok()
            .map(String::from)
    }

    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for SafeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn proc_fd_path(fd: BorrowedFd<'_>) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Checks `fd` and resolves its host path as seen by `app_info`.
///
/// `documents_mount` is the mountpoint of the document store, whose files
/// may legitimately show up as deleted.
pub fn verify_fd(
    app_info: &AppInfo,
    fd: OwnedFd,
    required: FileKind,
    documents_mount: &Path,
) -> Result<SafeFd, FdError> {
    let flags = rustix::fs::fcntl_getfl(&fd)?;
    let st = rustix::fs::fstat(&fd)?;
    let file_type = FileType::from_raw_mode(st.st_mode);
    match required {
        FileKind::Directory if file_type != FileType::Directory => return Err(FdError::NotDirectory),
        FileKind::Regular if file_type != FileType::RegularFile => return Err(FdError::NotRegular),
        _ => {}
    }
    let directory = file_type == FileType::Directory;

    let proc_path = proc_fd_path(fd.as_fd());
    let target = std::fs::read_link(&proc_path)?;
    let target_bytes = target.as_os_str().as_bytes();
    if !target_bytes.starts_with(b"/") {
        return Err(FdError::InvalidFilename);
    }
    let target = match target_bytes.strip_suffix(DELETED_SUFFIX) {
        Some(stripped) => {
            let stripped = Path::new(OsStr::from_bytes(stripped));
            if !stripped.starts_with(documents_mount) {
                return Err(FdError::InvalidFilename);
            }
            stripped.to_path_buf()
        }
        None => target,
    };
    let path = app_info.remap_path(&target);

    let writable = if flags.contains(OFlags::PATH) {
        if !app_info.supports_opath() {
            return Err(FdError::NotSupported);
        }
        if flags.contains(OFlags::NOFOLLOW) {
            return Err(FdError::InvalidArgument(
                "O_PATH file descriptors must not be opened with O_NOFOLLOW".into(),
            ));
        }
        let mut access = Access::READ_OK;
        if directory {
            access |= Access::EXEC_OK;
        }
        rustix::fs::access(&proc_path, access).map_err(|_| FdError::PermissionDenied)?;
        app_info.is_unconfined() || rustix::fs::access(&proc_path, Access::WRITE_OK).is_ok()
    } else {
        let mode = flags.bits() as libc::c_int & libc::O_ACCMODE;
        if mode != libc::O_RDONLY && mode != libc::O_RDWR {
            return Err(FdError::InvalidArgument(
                "File descriptors must be opened read-only or read-write".into(),
            ));
        }
        app_info.is_unconfined() || mode == libc::O_RDWR
    };

    let same_file = |candidate: &Path| {
        rustix::fs::stat(candidate)
            .is_ok_and(|other| other.st_dev == st.st_dev && other.st_ino == st.st_ino)
    };
    let path = if same_file(&path) {
        path
    } else {
        match documents_alternate(&path, documents_mount, app_info.id()) {
            Some(alternate) if same_file(&alternate) => alternate,
            _ => return Err(FdError::PathMismatch(path)),
        }
    };

    Ok(SafeFd {
        fd,
        path,
        writable,
        directory,
    })
}

/// The same document as seen through the per-application view of the
/// document store.
fn documents_alternate(path: &Path, documents_mount: &Path, app_id: &str) -> Option<PathBuf> {
    if app_id.is_empty() {
        return None;
    }
    let rest = path.strip_prefix(documents_mount).ok()?;
    Some(documents_mount.join("by-app").join(app_id).join(rest))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::app_info::{flatpak::FlatpakMetadata, AppInfo};
    use crate::utils::dirs::HostDirs;
    use rustix::fs::Mode;

    fn host() -> AppInfo {
        AppInfo::host(String::new(), None, None)
    }

    fn sandboxed(opath: bool) -> AppInfo {
        let version = if opath { "1.14.0" } else { "1.6.0" };
        let info = format!(
            "[Application]\nname=org.example.App\n[Instance]\ninstance-id=1\nflatpak-version={version}\n"
        );
        AppInfo::flatpak(
            FlatpakMetadata::parse(&info).unwrap(),
            1,
            None,
            &HostDirs::rooted(Path::new("/nonexistent")),
        )
    }

    fn open(path: &Path, flags: OFlags) -> OwnedFd {
        rustix::fs::open(path, flags | OFlags::CLOEXEC, Mode::empty()).unwrap()
    }

    fn no_docs() -> PathBuf {
        PathBuf::from("/nonexistent/doc")
    }

    #[test]
    fn test_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hostname");
        std::fs::write(&file, "box").unwrap();

        let safe = verify_fd(&host(), open(&file, OFlags::RDONLY), FileKind::Regular, &no_docs()).unwrap();
        assert_eq!(safe.path(), std::fs::canonicalize(&file).unwrap());
        assert!(safe.writable());
        assert!(!safe.is_directory());
        assert!(safe.uri().unwrap().starts_with("file:///"));

        let safe = verify_fd(&sandboxed(true), open(&file, OFlags::RDONLY), FileKind::Any, &no_docs()).unwrap();
        assert!(!safe.writable());
        let safe = verify_fd(&sandboxed(true), open(&file, OFlags::RDWR), FileKind::Any, &no_docs()).unwrap();
        assert!(safe.writable());
    }

    #[test]
    fn test_type_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            verify_fd(&host(), open(&file, OFlags::RDONLY), FileKind::Directory, &no_docs()),
            Err(FdError::NotDirectory)
        ));
        assert!(matches!(
            verify_fd(&host(), open(dir.path(), OFlags::RDONLY | OFlags::DIRECTORY), FileKind::Regular, &no_docs()),
            Err(FdError::NotRegular)
        ));
        let safe = verify_fd(&host(), open(dir.path(), OFlags::RDONLY | OFlags::DIRECTORY), FileKind::Directory, &no_docs()).unwrap();
        assert!(safe.is_directory());
    }

    #[test]
    fn test_opath_nofollow_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        let fd = open(&file, OFlags::PATH | OFlags::NOFOLLOW);
        assert!(matches!(
            verify_fd(&host(), fd, FileKind::Any, &no_docs()),
            Err(FdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_opath_needs_support() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            verify_fd(&sandboxed(false), open(&file, OFlags::PATH), FileKind::Any, &no_docs()),
            Err(FdError::NotSupported)
        ));
        let safe = verify_fd(&host(), open(&file, OFlags::PATH), FileKind::Regular, &no_docs()).unwrap();
        assert!(safe.writable());
    }

    #[test]
    fn test_write_only_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "").unwrap();
        assert!(matches!(
            verify_fd(&host(), open(&file, OFlags::WRONLY), FileKind::Any, &no_docs()),
            Err(FdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_deleted_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("gone");
        std::fs::write(&file, "").unwrap();
        let fd = open(&file, OFlags::RDONLY);
        std::fs::remove_file(&file).unwrap();
        assert!(matches!(
            verify_fd(&host(), fd, FileKind::Any, &no_docs()),
            Err(FdError::InvalidFilename)
        ));
    }

    #[test]
    fn test_pipe_rejected() {
        let (read, _write) = rustix::pipe::pipe().unwrap();
        assert!(matches!(
            verify_fd(&host(), read, FileKind::Any, &no_docs()),
            Err(FdError::InvalidFilename)
        ));
    }

    #[test]
    fn test_documents_alternate() {
        assert_eq!(
            documents_alternate(Path::new("/run/user/1/doc/abc/f"), Path::new("/run/user/1/doc"), "org.example.App"),
            Some(PathBuf::from("/run/user/1/doc/by-app/org.example.App/abc/f"))
        );
        assert_eq!(documents_alternate(Path::new("/etc/f"), Path::new("/run/user/1/doc"), "a.b.c"), None);
    }
}
