// SPDX-License-Identifier: GPL-3.0-only

use std::process::Command;

use procfs::ProcessCGroup;

use super::{id::is_valid_snap_name, keyfile::KeyFile, IdentityError};

const SNAP_INFO_GROUP: &str = "Snap Info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapMetadata {
    pub instance_name: String,
    pub desktop_file: Option<String>,
    pub has_network: bool,
}

/// Snap confined processes are placed below a `snap.<name>...` cgroup on
/// the freezer, named systemd or unified hierarchy.
pub fn cgroup_is_snap(cgroups: &[ProcessCGroup]) -> bool {
    cgroups.iter().any(|cgroup| {
        let tracked = cgroup.controllers.iter().all(String::is_empty)
            || cgroup
                .controllers
                .iter()
                .any(|controller| matches!(controller.as_str(), "freezer" | "name=systemd"));
        tracked && cgroup.pathname.contains("/snap.")
    })
}

impl SnapMetadata {
    pub fn parse(text: &str) -> Result<SnapMetadata, IdentityError> {
        let keyfile = KeyFile::parse(text)?;
        let instance_name = keyfile
            .string(SNAP_INFO_GROUP, "InstanceName")
            .filter(|name| is_valid_snap_name(name))
            .ok_or_else(|| IdentityError::Metadata("missing snap instance name".into()))?;
        Ok(SnapMetadata {
            instance_name,
            desktop_file: keyfile
                .string(SNAP_INFO_GROUP, "DesktopFile")
                .filter(|file| !file.is_empty()),
            has_network: keyfile
                .boolean(SNAP_INFO_GROUP, "HasNetworkStatus")
                .unwrap_or(false),
        })
    }

    pub fn app_id(&self) -> String {
        format!("snap.{}", self.instance_name)
    }
}

/// Asks snapd about a confined process.
pub fn query(pid: u32) -> Result<SnapMetadata, IdentityError> {
    let output = Command::new("snap")
        .args(["routine", "portal-info", &pid.to_string()])
        .output()
        .map_err(|err| IdentityError::Metadata(format!("failed to run snap: {err}")))?;
    if !output.status.success() {
        return Err(IdentityError::Metadata(format!(
            "snap routine portal-info exited with {}",
            output.status
        )));
    }
    let text = String::from_utf8(output.stdout)
        .map_err(|_| IdentityError::Metadata("snap output is not UTF-8".into()))?;
    SnapMetadata::parse(&text)
}

#[cfg(test)]
mod test {
    use super::*;

    fn cgroup(hierarchy: u32, controllers: &[&str], pathname: &str) -> ProcessCGroup {
        ProcessCGroup {
            hierarchy,
            controllers: controllers.iter().map(|c| c.to_string()).collect(),
            pathname: pathname.to_string(),
        }
    }

    #[test]
    fn test_cgroup_detection() {
        assert!(cgroup_is_snap(&[cgroup(
            0,
            &[],
            "/user.slice/user-1000.slice/user@1000.service/app.slice/snap.firefox.firefox.1f2e.scope"
        )]));
        assert!(cgroup_is_snap(&[cgroup(0, &[], "/system.slice/snap.lxd.daemon.service")]));
        assert!(cgroup_is_snap(&[cgroup(7, &["freezer"], "/snap.hello")]));
        assert!(!cgroup_is_snap(&[cgroup(5, &["cpu"], "/snap.hello")]));
        assert!(!cgroup_is_snap(&[cgroup(
            0,
            &[],
            "/user.slice/user-1000.slice/user@1000.service/app.slice/app-gnome-org.gnome.Terminal-1234.scope"
        )]));
    }

    #[test]
    fn test_parse_portal_info() {
        let metadata = SnapMetadata::parse(
            "[Snap Info]\nInstanceName=hello_dev\nAppName=hello\nDesktopFile=hello_hello.desktop\nHasNetworkStatus=true\n",
        )
        .unwrap();
        assert_eq!(metadata.app_id(), "snap.hello_dev");
        assert_eq!(metadata.desktop_file.as_deref(), Some("hello_hello.desktop"));
        assert!(metadata.has_network);

        assert!(SnapMetadata::parse("[Snap Info]\nAppName=hello\n").is_err());
    }
}
