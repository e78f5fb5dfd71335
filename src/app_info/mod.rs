// SPDX-License-Identifier: GPL-3.0-only

//! Identity of the applications calling into the broker.
//!
//! A caller is classified once per bus connection, by looking at its
//! process through a pidfd: sandbox metadata first, then snap
//! confinement, and finally the systemd unit of unconfined processes.

use std::{
    fmt,
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    path::{Path, PathBuf},
};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::utils::dirs::HostDirs;

use self::{
    flatpak::{FlatpakMetadata, SandboxPaths},
    keyfile::KeyFileError,
    snap::SnapMetadata,
    usb::UsbQueries,
};

pub mod flatpak;
pub mod host;
pub mod id;
pub mod keyfile;
pub mod pids;
mod resolver;
pub mod snap;
pub mod usb;

pub use self::resolver::AppInfoResolver;

pub const PROC_ROOT: &str = "/proc";

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("failed to read {}: {source}", path.display())]
    Proc {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Procfs(#[from] procfs::ProcError),
    #[error("invalid sandbox metadata: {0}")]
    Metadata(String),
    #[error(transparent)]
    KeyFile(#[from] KeyFileError),
    #[error("caller process exited during identification")]
    ProcessGone,
    #[error("bus did not report credentials: {0}")]
    Credentials(String),
    #[error("pid mapping failed: {0}")]
    PidMapping(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppKind {
    /// Application-bundle sandbox with a `.flatpak-info` metadata file.
    Flatpak,
    Snap,
    /// Unconfined process, id derived from its systemd unit.
    Host,
    /// Unconfined process that told the host registry its id.
    Registered,
    /// Identity forced by configuration.
    Test,
}

impl fmt::Display for AppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AppKind::Flatpak => "flatpak",
            AppKind::Snap => "snap",
            AppKind::Host => "host",
            AppKind::Registered => "registered",
            AppKind::Test => "test",
        })
    }
}

#[derive(Debug)]
enum Sandbox {
    Flatpak {
        instance: Option<String>,
        paths: SandboxPaths,
        usb_queries: Option<UsbQueries>,
    },
    Snap {
        desktop_file: Option<String>,
    },
    Unconfined(AppKind),
}

/// Immutable identity of one caller.
#[derive(Debug)]
pub struct AppInfo {
    id: String,
    pid: Option<u32>,
    pidfd: Option<OwnedFd>,
    sandbox: Sandbox,
    has_network: bool,
    supports_opath: bool,
    pidns: OnceCell<u64>,
}

impl AppInfo {
    pub fn host(id: String, pid: Option<u32>, pidfd: Option<OwnedFd>) -> AppInfo {
        AppInfo::unconfined(AppKind::Host, id, pid, pidfd)
    }

    pub fn registered(id: String, previous: &AppInfo) -> AppInfo {
        let pidfd = previous
            .pidfd
            .as_ref()
            .and_then(|fd| fd.try_clone().ok());
        AppInfo::unconfined(AppKind::Registered, id, previous.pid, pidfd)
    }

    pub fn test(id: String) -> AppInfo {
        AppInfo::unconfined(AppKind::Test, id, None, None)
    }

    fn unconfined(kind: AppKind, id: String, pid: Option<u32>, pidfd: Option<OwnedFd>) -> AppInfo {
        AppInfo {
            id,
            pid,
            pidfd,
            sandbox: Sandbox::Unconfined(kind),
            has_network: true,
            supports_opath: true,
            pidns: OnceCell::new(),
        }
    }

    pub(crate) fn flatpak(metadata: FlatpakMetadata, pid: u32, pidfd: Option<OwnedFd>, dirs: &HostDirs) -> AppInfo {
        let paths = SandboxPaths {
            app_path: metadata.app_path,
            runtime_path: metadata.runtime_path,
            runtime_dir: dirs.runtime_dir.clone(),
            var_app_dir: dirs.var_app_dir(&metadata.id),
        };
        AppInfo {
            id: metadata.id,
            pid: Some(pid),
            pidfd,
            sandbox: Sandbox::Flatpak {
                instance: metadata.instance_id,
                paths,
                usb_queries: metadata.usb_queries,
            },
            has_network: metadata.has_network,
            supports_opath: metadata.supports_opath,
            pidns: OnceCell::new(),
        }
    }

    /// A confined caller for tests elsewhere in the crate.
    #[cfg(test)]
    pub(crate) fn sandboxed_for_test(id: &str) -> AppInfo {
        let info = format!("[Application]\nname={id}\n\n[Instance]\ninstance-id=1\nflatpak-version=1.14.0\n");
        let dirs = HostDirs::rooted(Path::new("/r"));
        AppInfo::flatpak(FlatpakMetadata::parse(&info).unwrap(), 10, None, &dirs)
    }

    pub(crate) fn snap(metadata: SnapMetadata, pid: u32, pidfd: Option<OwnedFd>) -> AppInfo {
        AppInfo {
            id: metadata.app_id(),
            pid: Some(pid),
            pidfd,
            sandbox: Sandbox::Snap {
                desktop_file: metadata.desktop_file,
            },
            has_network: metadata.has_network,
            supports_opath: false,
            pidns: OnceCell::new(),
        }
    }

    pub fn kind(&self) -> AppKind {
        match self.sandbox {
            Sandbox::Flatpak { .. } => AppKind::Flatpak,
            Sandbox::Snap { .. } => AppKind::Snap,
            Sandbox::Unconfined(kind) => kind,
        }
    }

    /// Application id, possibly empty for unconfined callers.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn pidfd(&self) -> Option<BorrowedFd<'_>> {
        self.pidfd.as_ref().map(AsFd::as_fd)
    }

    pub fn instance(&self) -> Option<&str> {
        match &self.sandbox {
            Sandbox::Flatpak { instance, .. } => instance.as_deref(),
            _ => None,
        }
    }

    pub fn is_unconfined(&self) -> bool {
        matches!(self.sandbox, Sandbox::Unconfined(_))
    }

    pub fn has_network(&self) -> bool {
        self.has_network
    }

    pub fn supports_opath(&self) -> bool {
        self.supports_opath
    }

    /// Ids sent by this caller live in another pid namespace.
    pub fn requires_pid_mapping(&self) -> bool {
        matches!(self.sandbox, Sandbox::Flatpak { .. })
    }

    /// Desktop file id used for notifications and launchers.
    pub fn desktop_id(&self) -> Option<String> {
        match &self.sandbox {
            Sandbox::Snap { desktop_file } => desktop_file.clone(),
            _ if self.id.is_empty() => None,
            _ => Some(format!("{}.desktop", self.id)),
        }
    }

    pub fn usb_queries(&self) -> Option<&UsbQueries> {
        match &self.sandbox {
            Sandbox::Flatpak { usb_queries, .. } => usb_queries.as_ref(),
            _ => None,
        }
    }

    /// Host path for a path as the caller sees it.
    pub fn remap_path(&self, path: &Path) -> PathBuf {
        match &self.sandbox {
            Sandbox::Flatpak { paths, .. } => paths.remap(path),
            _ => path.to_path_buf(),
        }
    }

    /// Pid namespace of the caller's sandbox, looked up once.
    pub fn pidns_id(&self, runtime_dir: &Path) -> Result<u64, IdentityError> {
        self.pidns
            .get_or_try_init(|| {
                match &self.sandbox {
                    Sandbox::Flatpak {
                        instance: Some(instance),
                        ..
                    } => {
                        let supervisor = flatpak::supervisor_pid(runtime_dir, instance)?;
                        pids::pidns_of(&pids::process(supervisor)?)
                    }
                    Sandbox::Flatpak { instance: None, .. } => {
                        Err(IdentityError::PidMapping("sandbox has no instance id".into()))
                    }
                    _ => pids::pidns_of(&pids::process(std::process::id())?),
                }
            })
            .copied()
    }

    /// Translates process ids sent by the caller to host ids.
    pub fn map_pids(&self, runtime_dir: &Path, ids: &[u32]) -> Result<Vec<u32>, IdentityError> {
        if !self.requires_pid_mapping() {
            return Ok(ids.to_vec());
        }
        let pidns = self.pidns_id(runtime_dir)?;
        pids::map_ids(pidns, ids, None)
    }

    /// Translates thread ids of the (already mapped) host process `owner`.
    pub fn map_tids(&self, runtime_dir: &Path, owner: u32, ids: &[u32]) -> Result<Vec<u32>, IdentityError> {
        if !self.requires_pid_mapping() {
            return Ok(ids.to_vec());
        }
        let pidns = self.pidns_id(runtime_dir)?;
        pids::map_ids(pidns, ids, Some(owner))
    }

    /// Whether `sub_id` may name a launcher or notification owned by this
    /// application.
    pub fn is_valid_sub_app_id(&self, sub_id: &str) -> bool {
        if self.id.is_empty() {
            return false;
        }
        let prefix = match &self.sandbox {
            Sandbox::Snap { .. } => format!("{}_", self.id.trim_start_matches("snap.")),
            _ => format!("{}.", self.id),
        };
        let valid = match &self.sandbox {
            Sandbox::Snap { .. } => sub_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')),
            _ => id::is_valid_app_id(sub_id),
        };
        valid && sub_id.len() > prefix.len() && sub_id.starts_with(&prefix)
    }

    /// Command line that starts `argv` in the caller's context, for
    /// autostart entries. `None` if this kind of caller cannot be launched.
    pub fn launch_command(&self, argv: &[String]) -> Option<Vec<String>> {
        let (command, args) = argv.split_first()?;
        match &self.sandbox {
            Sandbox::Flatpak { .. } => {
                let mut rewritten = vec![
                    "flatpak".to_string(),
                    "run".to_string(),
                    format!("--command={command}"),
                    self.id.clone(),
                ];
                rewritten.extend(args.iter().cloned());
                Some(rewritten)
            }
            Sandbox::Snap { .. } => None,
            Sandbox::Unconfined(_) => Some(argv.to_vec()),
        }
    }

    /// Like [`AppInfo::launch_command`] but keeping desktop-entry field
    /// codes usable: file arguments are forwarded into the sandbox.
    pub fn launcher_exec(&self, argv: &[String]) -> Option<Vec<String>> {
        if !matches!(self.sandbox, Sandbox::Flatpak { .. }) {
            return self.launch_command(argv);
        }
        let (command, args) = argv.split_first()?;
        let mut rewritten = vec![
            "flatpak".to_string(),
            "run".to_string(),
            format!("--command={command}"),
        ];
        let forwarding = args.iter().any(|arg| is_file_field_code(arg));
        if forwarding {
            rewritten.push("--file-forwarding".to_string());
        }
        rewritten.push(self.id.clone());
        for arg in args {
            match arg.as_str() {
                "%u" | "%U" => rewritten.extend(["@@u".to_string(), arg.clone(), "@@".to_string()]),
                "%f" | "%F" => rewritten.extend(["@@".to_string(), arg.clone(), "@@".to_string()]),
                _ => rewritten.push(arg.clone()),
            }
        }
        Some(rewritten)
    }

    /// Whether the caller is still alive, when a pidfd is known.
    pub fn is_alive(&self) -> bool {
        self.pidfd.as_ref().is_none_or(|fd| pidfd_alive(fd.as_fd()))
    }
}

fn is_file_field_code(arg: &str) -> bool {
    matches!(arg, "%u" | "%U" | "%f" | "%F")
}

fn pidfd_alive(pidfd: BorrowedFd<'_>) -> bool {
    // Signal 0 only checks that the process can be signalled.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_pidfd_send_signal,
            pidfd.as_raw_fd(),
            0,
            std::ptr::null::<libc::siginfo_t>(),
            0,
        )
    };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Classifies process `pid`. Blocking: reads `/proc` and may run `snap`.
pub fn detect(pid: u32, pidfd: OwnedFd, dirs: &HostDirs) -> Result<AppInfo, IdentityError> {
    let proc_root = Path::new(PROC_ROOT);

    if let Some(text) = flatpak::read_metadata(proc_root, pid)? {
        if !pidfd_alive(pidfd.as_fd()) {
            return Err(IdentityError::ProcessGone);
        }
        let metadata = FlatpakMetadata::parse(&text)?;
        let instance = metadata
            .instance_id
            .as_deref()
            .ok_or_else(|| IdentityError::Metadata("missing instance id".into()))?;
        // The supervisor has the same namespaces as the caller, but its
        // identity can't be hidden behind a bus proxy.
        let supervisor = flatpak::supervisor_pid(&dirs.runtime_dir, instance)?;
        let supervisor_fd = open_pidfd(supervisor)?;
        debug!(pid, supervisor, app_id = %metadata.id, "Identified sandboxed caller");
        return Ok(AppInfo::flatpak(metadata, pid, Some(supervisor_fd), dirs));
    }

    let cgroups = pids::process(pid)?.cgroups()?.0;
    if !pidfd_alive(pidfd.as_fd()) {
        return Err(IdentityError::ProcessGone);
    }

    if snap::cgroup_is_snap(&cgroups) {
        let metadata = snap::query(pid)?;
        debug!(pid, app_id = %metadata.app_id(), "Identified snap caller");
        return Ok(AppInfo::snap(metadata, pid, Some(pidfd)));
    }

    let id = host::user_unit(&cgroups)
        .map(|unit| host::app_id_from_unit(&unit))
        .unwrap_or_default();
    debug!(pid, app_id = %id, "Identified unconfined caller");
    Ok(AppInfo::host(id, Some(pid), Some(pidfd)))
}

pub fn open_pidfd(pid: u32) -> Result<OwnedFd, IdentityError> {
    let raw = i32::try_from(pid)
        .ok()
        .and_then(rustix::process::Pid::from_raw)
        .ok_or_else(|| IdentityError::PidMapping(format!("invalid pid {pid}")))?;
    rustix::process::pidfd_open(raw, rustix::process::PidfdFlags::empty()).map_err(|err| {
        IdentityError::Proc {
            path: PathBuf::from(PROC_ROOT).join(pid.to_string()),
            source: err.into(),
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const INFO: &str = "[Application]\nname=org.example.App\n\n[Instance]\ninstance-id=7\napp-path=/host/app\nflatpak-version=1.14.0\n";

    fn flatpak_app() -> AppInfo {
        let dirs = HostDirs::rooted(Path::new("/r"));
        AppInfo::flatpak(FlatpakMetadata::parse(INFO).unwrap(), 10, None, &dirs)
    }

    #[test]
    fn test_flatpak_flags() {
        let app = flatpak_app();
        assert_eq!(app.kind(), AppKind::Flatpak);
        assert_eq!(app.id(), "org.example.App");
        assert_eq!(app.instance(), Some("7"));
        assert!(app.requires_pid_mapping());
        assert!(app.supports_opath());
        assert!(!app.has_network());
        assert!(!app.is_unconfined());
        assert_eq!(app.desktop_id().as_deref(), Some("org.example.App.desktop"));
        assert_eq!(
            app.remap_path(Path::new("/var/data/x")),
            PathBuf::from("/r/home/.var/app/org.example.App/data/x")
        );
    }

    #[test]
    fn test_host_flags() {
        let app = AppInfo::host(String::new(), Some(1), None);
        assert_eq!(app.kind(), AppKind::Host);
        assert!(app.is_unconfined());
        assert!(app.has_network() && app.supports_opath());
        assert!(!app.requires_pid_mapping());
        assert_eq!(app.desktop_id(), None);
        assert_eq!(app.map_pids(Path::new("/run"), &[5, 6]).unwrap(), vec![5, 6]);
        assert!(!app.is_valid_sub_app_id("org.example.App.Sub"));
    }

    #[test]
    fn test_sub_app_ids() {
        let app = flatpak_app();
        assert!(app.is_valid_sub_app_id("org.example.App.Game"));
        assert!(!app.is_valid_sub_app_id("org.example.App"));
        assert!(!app.is_valid_sub_app_id("org.example.Other.Game"));
        assert!(!app.is_valid_sub_app_id("org.example.AppGame.x"));
    }

    #[test]
    fn test_launch_commands() {
        let app = flatpak_app();
        let argv = vec!["tool".to_string(), "--flag".to_string()];
        assert_eq!(
            app.launch_command(&argv).unwrap(),
            vec!["flatpak", "run", "--command=tool", "org.example.App", "--flag"]
        );
        let exec = app
            .launcher_exec(&["viewer".to_string(), "%U".to_string()])
            .unwrap();
        assert_eq!(
            exec,
            vec![
                "flatpak",
                "run",
                "--command=viewer",
                "--file-forwarding",
                "org.example.App",
                "@@u",
                "%U",
                "@@"
            ]
        );
        assert_eq!(AppInfo::test("a.b.c".into()).launch_command(&argv).unwrap(), argv);
        assert_eq!(app.launch_command(&[]), None);
    }

    #[test]
    fn test_detect_self() {
        let dirs = HostDirs::rooted(Path::new("/nonexistent"));
        let pidfd = open_pidfd(std::process::id()).unwrap();
        let app = detect(std::process::id(), pidfd, &dirs).unwrap();
        assert!(matches!(app.kind(), AppKind::Host | AppKind::Flatpak | AppKind::Snap));
    }
}
