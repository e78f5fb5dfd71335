// SPDX-License-Identifier: GPL-3.0-only

//! Exporting host files to sandboxed applications through the document
//! store.

use std::{
    collections::HashMap,
    ffi::OsStr,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
};

use bitflags::bitflags;
use rustix::{
    fs::{Mode, OFlags},
    io::Errno,
};
use tracing::{debug, warn};
use zbus::zvariant::{Fd, OwnedValue};

use crate::app_info::AppInfo;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DocumentFlags: u32 {
        const REUSE_EXISTING = 1 << 0;
        const PERSISTENT = 1 << 1;
        const AS_NEEDED_BY_APP = 1 << 2;
        const EXPORT_DIRECTORY = 1 << 3;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document store unavailable")]
    Unavailable,
    #[error("document store call failed: {0}")]
    Bus(#[from] zbus::Error),
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        source: Errno,
    },
    #[error("{0} is not a local file")]
    NotLocal(String),
}

#[zbus::proxy(
    interface = "org.freedesktop.portal.Documents",
    default_service = "org.freedesktop.portal.Documents",
    default_path = "/org/freedesktop/portal/documents"
)]
trait DocumentStore {
    fn get_mount_point(&self) -> zbus::Result<Vec<u8>>;

    fn add_full(
        &self,
        o_path_fds: &[Fd<'_>],
        flags: u32,
        app_id: &str,
        permissions: &[&str],
    ) -> zbus::Result<(Vec<String>, HashMap<String, OwnedValue>)>;

    fn add_named_full(
        &self,
        o_path_fd: Fd<'_>,
        filename: &[u8],
        flags: u32,
        app_id: &str,
        permissions: &[&str],
    ) -> zbus::Result<(String, HashMap<String, OwnedValue>)>;
}

/// How a file is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Export {
    pub writable: bool,
    pub directory: bool,
}

impl Export {
    pub fn flags(&self) -> DocumentFlags {
        let mut flags =
            DocumentFlags::REUSE_EXISTING | DocumentFlags::PERSISTENT | DocumentFlags::AS_NEEDED_BY_APP;
        if self.directory {
            flags |= DocumentFlags::EXPORT_DIRECTORY;
        }
        flags
    }

    pub fn permissions(&self) -> Vec<&'static str> {
        let mut permissions = vec!["read"];
        if self.writable {
            permissions.extend(["write", "grant-permissions"]);
        }
        permissions
    }
}

/// `GetMountPoint` answers with a NUL terminated byte string.
pub fn parse_mount_point(bytes: &[u8]) -> PathBuf {
    let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
    PathBuf::from(OsStr::from_bytes(bytes))
}

pub fn document_uri(mount: &Path, doc_id: &str, path: &Path) -> Option<String> {
    let mut document = mount.join(doc_id);
    if let Some(name) = path.file_name() {
        document.push(name);
    }
    url::Url::from_file_path(document).ok().map(String::from)
}

pub fn uri_to_path(uri: &str) -> Option<PathBuf> {
    let url = url::Url::parse(uri).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    url.to_file_path().ok()
}

pub struct Documents {
    proxy: Option<DocumentStoreProxy<'static>>,
    mount: PathBuf,
}

impl Documents {
    pub async fn connect(connection: &zbus::Connection, runtime_dir: &Path) -> Documents {
        let fallback = runtime_dir.join("doc");
        let proxy = match DocumentStoreProxy::new(connection).await {
            Ok(proxy) => proxy,
            Err(err) => {
                warn!(?err, "Document store unavailable");
                return Documents {
                    proxy: None,
                    mount: fallback,
                };
            }
        };
        let mount = match proxy.get_mount_point().await {
            Ok(bytes) => parse_mount_point(&bytes),
            Err(err) => {
                warn!(?err, "Cannot query document store mount point");
                fallback
            }
        };
        debug!(mount = %mount.display(), "Document store");
        Documents {
            proxy: Some(proxy),
            mount,
        }
    }

    #[cfg(test)]
    pub fn offline(mount: PathBuf) -> Documents {
        Documents { proxy: None, mount }
    }

    pub fn mount(&self) -> &Path {
        &self.mount
    }

    /// Makes the host file at `path` visible to `app_id`. Returns its URI
    /// inside the document store.
    pub async fn register(&self, path: &Path, app_id: &str, export: Export) -> Result<String, DocumentError> {
        let proxy = self.proxy.as_ref().ok_or(DocumentError::Unavailable)?;
        if path.starts_with(&self.mount) {
            // Already a document.
            return url::Url::from_file_path(path)
                .map(String::from)
                .map_err(|_| DocumentError::NotLocal(path.display().to_string()));
        }
        let doc_id = match rustix::fs::open(path, OFlags::PATH | OFlags::CLOEXEC, Mode::empty()) {
            Ok(fd) => {
                let (doc_ids, _extra) = proxy
                    .add_full(&[Fd::from(&fd)], export.flags().bits(), app_id, &export.permissions())
                    .await?;
                doc_ids
                    .into_iter()
                    .next()
                    .ok_or_else(|| DocumentError::NotLocal(path.display().to_string()))?
            }
            // A file about to be saved does not exist yet.
            Err(Errno::NOENT) if export.writable => self.register_named(proxy, path, app_id, export).await?,
            Err(source) => {
                return Err(DocumentError::Open {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        document_uri(&self.mount, &doc_id, path).ok_or_else(|| DocumentError::NotLocal(path.display().to_string()))
    }

    async fn register_named(
        &self,
        proxy: &DocumentStoreProxy<'static>,
        path: &Path,
        app_id: &str,
        export: Export,
    ) -> Result<String, DocumentError> {
        let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
            return Err(DocumentError::NotLocal(path.display().to_string()));
        };
        let parent_fd = rustix::fs::open(parent, OFlags::PATH | OFlags::CLOEXEC, Mode::empty()).map_err(|source| {
            DocumentError::Open {
                path: parent.to_path_buf(),
                source,
            }
        })?;
        // The store expects a NUL terminated byte string.
        let mut filename = name.as_bytes().to_vec();
        filename.push(0);
        let (doc_id, _extra) = proxy
            .add_named_full(
                Fd::from(&parent_fd),
                &filename,
                export.flags().bits(),
                app_id,
                &export.permissions(),
            )
            .await?;
        Ok(doc_id)
    }

    /// Rewrites `file:` URIs returned by an implementation so a confined
    /// caller can open them. Other URIs and unconfined callers pass through.
    pub async fn export_uris(&self, app_info: &AppInfo, uris: Vec<String>, export: Export) -> Vec<String> {
        if app_info.is_unconfined() {
            return uris;
        }
        let mut exported = Vec::with_capacity(uris.len());
        for uri in uris {
            let Some(path) = uri_to_path(&uri) else {
                exported.push(uri);
                continue;
            };
            match self.register(&path, app_info.id(), export).await {
                Ok(document) => exported.push(document),
                Err(err) => warn!(uri, %err, "Failed to export file, dropping it"),
            }
        }
        exported
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mount_point() {
        assert_eq!(parse_mount_point(b"/run/user/1000/doc\0"), PathBuf::from("/run/user/1000/doc"));
        assert_eq!(parse_mount_point(b"/run/user/1000/doc"), PathBuf::from("/run/user/1000/doc"));
    }

    #[test]
    fn test_document_uri() {
        assert_eq!(
            document_uri(Path::new("/run/user/1000/doc"), "a1b2c3", Path::new("/etc/motd")).as_deref(),
            Some("file:///run/user/1000/doc/a1b2c3/motd")
        );
        assert_eq!(
            document_uri(Path::new("/run/user/1000/doc"), "a1b2c3", Path::new("/tmp/with space")).as_deref(),
            Some("file:///run/user/1000/doc/a1b2c3/with%20space")
        );
    }

    #[test]
    fn test_uri_to_path() {
        assert_eq!(uri_to_path("file:///etc/hostname"), Some(PathBuf::from("/etc/hostname")));
        assert_eq!(uri_to_path("file:///tmp/a%20b"), Some(PathBuf::from("/tmp/a b")));
        assert_eq!(uri_to_path("https://example.org/"), None);
        assert_eq!(uri_to_path("not a uri"), None);
    }

    #[test]
    fn test_export_flags() {
        let read_only = Export {
            writable: false,
            directory: false,
        };
        assert_eq!(read_only.permissions(), vec!["read"]);
        assert!(!read_only.flags().contains(DocumentFlags::EXPORT_DIRECTORY));

        let directory = Export {
            writable: true,
            directory: true,
        };
        assert_eq!(directory.permissions(), vec!["read", "write", "grant-permissions"]);
        assert!(directory.flags().contains(DocumentFlags::EXPORT_DIRECTORY | DocumentFlags::PERSISTENT));
    }

    #[test]
    fn test_unconfined_uris_pass_through() {
        let documents = Documents::offline(PathBuf::from("/run/user/1000/doc"));
        let info = AppInfo::host(String::new(), None, None);
        let uris = vec!["file:///etc/hostname".to_string()];
        let exported = futures_executor::block_on(documents.export_uris(
            &info,
            uris.clone(),
            Export {
                writable: false,
                directory: false,
            },
        ));
        assert_eq!(exported, uris);
    }

    #[test]
    fn test_confined_without_store_drops_files() {
        let documents = Documents::offline(PathBuf::from("/run/user/1000/doc"));
        let info = AppInfo::sandboxed_for_test("org.example.App");
        let exported = futures_executor::block_on(documents.export_uris(
            &info,
            vec!["file:///etc/hostname".into(), "https://example.org/".into()],
            Export {
                writable: false,
                directory: false,
            },
        ));
        assert_eq!(exported, vec!["https://example.org/".to_string()]);
    }
}
