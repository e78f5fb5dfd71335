// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::Read,
    os::fd::OwnedFd,
    path::{Path, PathBuf},
};

use rustix::fs::{Mode, OFlags};
use serde::Deserialize;

use super::{id::is_valid_app_id, keyfile::KeyFile, usb::UsbQueries, IdentityError};

const METADATA_FILE: &str = ".flatpak-info";
/// First release with `O_PATH` file descriptor support in the document store.
const OPATH_MIN_VERSION: (u32, u32, u32) = (1, 7, 1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatpakMetadata {
    pub id: String,
    pub instance_id: Option<String>,
    pub app_path: Option<PathBuf>,
    pub runtime_path: Option<PathBuf>,
    pub has_network: bool,
    pub supports_opath: bool,
    pub usb_queries: Option<UsbQueries>,
}

impl FlatpakMetadata {
    pub fn parse(text: &str) -> Result<FlatpakMetadata, IdentityError> {
        let keyfile = KeyFile::parse(text)?;
        let group = if keyfile.has_group("Runtime") {
            "Runtime"
        } else {
            "Application"
        };
        let id = keyfile
            .string(group, "name")
            .filter(|id| is_valid_app_id(id))
            .ok_or_else(|| IdentityError::Metadata("missing or invalid application name".into()))?;
        let supports_opath = keyfile
            .string("Instance", "flatpak-version")
            .and_then(|version| parse_version(&version))
            .is_some_and(|version| version >= OPATH_MIN_VERSION);
        let has_network = keyfile
            .list("Context", "shared")
            .iter()
            .any(|shared| shared == "network");

        Ok(FlatpakMetadata {
            id,
            instance_id: keyfile.string("Instance", "instance-id"),
            app_path: keyfile.string("Instance", "app-path").map(PathBuf::from),
            runtime_path: keyfile.string("Instance", "runtime-path").map(PathBuf::from),
            has_network,
            supports_opath,
            usb_queries: UsbQueries::from_keyfile(&keyfile),
        })
    }
}

fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let mut parts = version.trim().splitn(3, '.').map(|part| {
        let digits = part
            .find(|c: char| !c.is_ascii_digit())
            .map_or(part, |end| &part[..end]);
        digits.parse::<u32>().ok()
    });
    Some((parts.next()??, parts.next()??, parts.next().flatten().unwrap_or(0)))
}

/// Opens the metadata file through the root of `pid`. Returns `None` if the
/// process is not sandboxed this way.
///
/// The pidfd has to be checked for liveness after this returns, since the
/// pid may have been recycled while the path was traversed.
pub fn read_metadata(proc_root: &Path, pid: u32) -> Result<Option<String>, IdentityError> {
    let root_path = proc_root.join(pid.to_string()).join("root");
    let root = match rustix::fs::open(
        &root_path,
        OFlags::RDONLY | OFlags::DIRECTORY | OFlags::CLOEXEC | OFlags::NOCTTY,
        Mode::empty(),
    ) {
        Ok(root) => root,
        // Not allowed to look into the root: another user or an exited process.
        Err(rustix::io::Errno::ACCESS) | Err(rustix::io::Errno::PERM) => {
            return Err(IdentityError::Proc {
                path: root_path,
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            })
        }
        Err(err) => {
            return Err(IdentityError::Proc {
                path: root_path,
                source: err.into(),
            })
        }
    };
    let metadata = match rustix::fs::openat(
        &root,
        METADATA_FILE,
        OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NOCTTY | OFlags::NOFOLLOW,
        Mode::empty(),
    ) {
        Ok(fd) => fd,
        Err(rustix::io::Errno::NOENT) => return Ok(None),
        Err(err) => {
            return Err(IdentityError::Proc {
                path: root_path.join(METADATA_FILE),
                source: err.into(),
            })
        }
    };
    let mut text = String::new();
    File::from(OwnedFd::from(metadata))
        .read_to_string(&mut text)
        .map_err(|source| IdentityError::Proc {
            path: root_path.join(METADATA_FILE),
            source,
        })?;
    Ok(Some(text))
}

#[derive(Debug, Deserialize)]
struct BwrapInfo {
    #[serde(rename = "child-pid")]
    child_pid: u32,
}

/// Pid of the sandbox supervisor child, from the instance's `bwrapinfo.json`.
pub fn supervisor_pid(runtime_dir: &Path, instance_id: &str) -> Result<u32, IdentityError> {
    let path = runtime_dir
        .join(".flatpak")
        .join(instance_id)
        .join("bwrapinfo.json");
    let file = File::open(&path).map_err(|source| IdentityError::Proc {
        path: path.clone(),
        source,
    })?;
    let info: BwrapInfo = serde_json::from_reader(file)
        .map_err(|err| IdentityError::Metadata(format!("{}: {err}", path.display())))?;
    Ok(info.child_pid)
}

/// Directories used to translate sandbox paths to host paths.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    pub app_path: Option<PathBuf>,
    pub runtime_path: Option<PathBuf>,
    pub runtime_dir: PathBuf,
    pub var_app_dir: PathBuf,
}

impl SandboxPaths {
    /// Maps a path as seen inside the sandbox to the host path. Unknown
    /// prefixes are returned unchanged; the first matching prefix wins.
    pub fn remap(&self, path: &Path) -> PathBuf {
        let path = path
            .strip_prefix("/newroot")
            .map(|rest| Path::new("/").join(rest))
            .unwrap_or_else(|_| path.to_path_buf());

        let rules: [(&str, Option<&Path>); 2] = [
            ("/app", self.app_path.as_deref()),
            ("/usr", self.runtime_path.as_deref()),
        ];
        for (prefix, target) in rules {
            if let (Ok(rest), Some(target)) = (path.strip_prefix(prefix), target) {
                return join_rest(target, rest);
            }
        }

        let fixed: [(&str, PathBuf); 6] = [
            ("/run/host/usr", PathBuf::from("/usr")),
            ("/run/host/etc", PathBuf::from("/etc")),
            ("/run/flatpak/app", self.runtime_dir.join("app")),
            ("/run/flatpak/doc", self.runtime_dir.join("doc")),
            ("/var/config", self.var_app_dir.join("config")),
            ("/var/data", self.var_app_dir.join("data")),
        ];
        for (prefix, target) in fixed {
            if let Ok(rest) = path.strip_prefix(prefix) {
                return join_rest(&target, rest);
            }
        }
        path
    }
}

fn join_rest(target: &Path, rest: &Path) -> PathBuf {
    if rest.as_os_str().is_empty() {
        target.to_path_buf()
    } else {
        target.join(rest)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const INFO: &str = "\
[Application]
name=org.example.App
runtime=runtime/org.gnome.Platform/x86_64/46

[Instance]
instance-id=3141592
app-path=/var/lib/flatpak/app/org.example.App/x86_64/stable/abc/files
runtime-path=/var/lib/flatpak/runtime/org.gnome.Platform/x86_64/46/def/files
flatpak-version=1.14.4

[Context]
shared=network;ipc;
";

    fn paths() -> SandboxPaths {
        SandboxPaths {
            app_path: Some("/host/app".into()),
            runtime_path: Some("/host/runtime".into()),
            runtime_dir: "/run/user/1000".into(),
            var_app_dir: "/home/u/.var/app/org.example.App".into(),
        }
    }

    #[test]
    fn test_parse_metadata() {
        let metadata = FlatpakMetadata::parse(INFO).unwrap();
        assert_eq!(metadata.id, "org.example.App");
        assert_eq!(metadata.instance_id.as_deref(), Some("3141592"));
        assert!(metadata.has_network);
        assert!(metadata.supports_opath);
        assert_eq!(metadata.usb_queries, None);
    }

    #[test]
    fn test_old_version_and_no_network() {
        let info = INFO
            .replace("flatpak-version=1.14.4", "flatpak-version=1.6.5")
            .replace("shared=network;ipc;", "shared=ipc;");
        let metadata = FlatpakMetadata::parse(&info).unwrap();
        assert!(!metadata.supports_opath);
        assert!(!metadata.has_network);
    }

    #[test]
    fn test_invalid_name_rejected() {
        let info = INFO.replace("name=org.example.App", "name=nodots");
        assert!(FlatpakMetadata::parse(&info).is_err());
    }

    #[test]
    fn test_version_parsing() {
        assert_eq!(parse_version("1.7.1"), Some((1, 7, 1)));
        assert_eq!(parse_version("1.15.10~rc1"), Some((1, 15, 10)));
        assert_eq!(parse_version("2.0"), Some((2, 0, 0)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_remap_paths() {
        let paths = paths();
        let remap = |p: &str| paths.remap(Path::new(p));
        assert_eq!(remap("/app/bin/tool"), PathBuf::from("/host/app/bin/tool"));
        assert_eq!(remap("/usr/lib/libfoo.so"), PathBuf::from("/host/runtime/lib/libfoo.so"));
        assert_eq!(remap("/newroot/app/bin"), PathBuf::from("/host/app/bin"));
        assert_eq!(remap("/run/host/etc/hosts"), PathBuf::from("/etc/hosts"));
        assert_eq!(remap("/run/flatpak/doc/abc/f.txt"), PathBuf::from("/run/user/1000/doc/abc/f.txt"));
        assert_eq!(
            remap("/var/config/settings.ini"),
            PathBuf::from("/home/u/.var/app/org.example.App/config/settings.ini")
        );
        assert_eq!(remap("/application/x"), PathBuf::from("/application/x"));
        assert_eq!(remap("/home/u/file"), PathBuf::from("/home/u/file"));
    }

    #[test]
    fn test_supervisor_pid() {
        let dir = tempfile::tempdir().unwrap();
        let instance = dir.path().join(".flatpak/42");
        std::fs::create_dir_all(&instance).unwrap();
        std::fs::write(instance.join("bwrapinfo.json"), r#"{"child-pid": 777, "mnt-namespace": 1}"#).unwrap();
        assert_eq!(supervisor_pid(dir.path(), "42").unwrap(), 777);
        assert!(supervisor_pid(dir.path(), "43").is_err());
    }
}
