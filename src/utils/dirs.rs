// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use tracing::warn;
use xdg::BaseDirectories;

/// Per-user directories resolved once at startup.
#[derive(Debug, Clone)]
pub struct HostDirs {
    pub home: PathBuf,
    pub runtime_dir: PathBuf,
    pub config_home: PathBuf,
    pub data_home: PathBuf,
}

impl HostDirs {
    pub fn from_env(xdg: Option<&BaseDirectories>) -> HostDirs {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/"));
        let runtime_dir = xdg
            .and_then(|xdg| xdg.get_runtime_directory().ok().cloned())
            .unwrap_or_else(|| {
                let fallback = PathBuf::from(format!("/run/user/{}", rustix::process::getuid().as_raw()));
                warn!(path = %fallback.display(), "XDG_RUNTIME_DIR not usable, using fallback");
                fallback
            });
        let config_home = xdg
            .map(BaseDirectories::get_config_home)
            .unwrap_or_else(|| home.join(".config"));
        let data_home = xdg
            .map(BaseDirectories::get_data_home)
            .unwrap_or_else(|| home.join(".local/share"));
        HostDirs {
            home,
            runtime_dir,
            config_home,
            data_home,
        }
    }

    /// Per-application data directory of a sandboxed application.
    pub fn var_app_dir(&self, app_id: &str) -> PathBuf {
        self.home.join(".var/app").join(app_id)
    }

    pub fn autostart_dir(&self) -> PathBuf {
        self.config_home.join("autostart")
    }

    pub fn applications_dir(&self) -> PathBuf {
        self.data_home.join("applications")
    }

    /// Icons of installed launchers, referenced by absolute path.
    pub fn icons_dir(&self) -> PathBuf {
        self.data_home.join("portal-broker/icons")
    }

    /// Fixed layout below `root`, for tests.
    #[cfg(test)]
    pub fn rooted(root: &std::path::Path) -> HostDirs {
        HostDirs {
            home: root.join("home"),
            runtime_dir: root.join("run"),
            config_home: root.join("home/.config"),
            data_home: root.join("home/.local/share"),
        }
    }
}
