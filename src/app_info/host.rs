// SPDX-License-Identifier: GPL-3.0-only

//! Application ids of unsandboxed processes, derived from the systemd user
//! unit they were launched in.

use once_cell::sync::Lazy;
use procfs::ProcessCGroup;
use regex::Regex;

use super::id::is_valid_app_id;

static SCOPE_OR_SLICE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^app-(?:[[:alnum:]]+\-)?(.+?)(?:\-[[:alnum:]]*)(?:\.scope|\.slice)$").ok());
static SERVICE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^app-(?:[[:alnum:]]+\-)?(.+?)(?:@[[:alnum:]]*|\-autostart)?\.service$").ok());

/// Cgroup path of the unified hierarchy, falling back to the named systemd
/// hierarchy on legacy setups.
fn systemd_cgroup_path(cgroups: &[ProcessCGroup]) -> Option<&str> {
    let mut legacy = None;
    for cgroup in cgroups {
        if cgroup.hierarchy == 0 && cgroup.controllers.iter().all(String::is_empty) {
            return Some(&cgroup.pathname);
        }
        if cgroup.controllers.iter().any(|controller| controller == "name=systemd") {
            legacy = Some(cgroup.pathname.as_str());
        }
    }
    legacy
}

/// The unit below the `user@<uid>.service` manager a process belongs to.
pub fn user_unit(cgroups: &[ProcessCGroup]) -> Option<String> {
    let path = systemd_cgroup_path(cgroups)?;
    let mut components = path.split('/').skip_while(|c| !(c.starts_with("user@") && c.ends_with(".service")));
    components.next()?;

    let mut last_slice = None;
    for component in components {
        if component.ends_with(".slice") {
            last_slice = Some(component);
        } else if !component.is_empty() {
            return Some(component.to_string());
        }
    }
    last_slice.map(str::to_string)
}

/// Undoes systemd's `\xNN` escaping of unit name components.
pub fn unescape_unit(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') {
            let decoded = bytes
                .get(i + 2..i + 4)
                .and_then(|hex| std::str::from_utf8(hex).ok())
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// Application id encoded in a user unit name, or the empty string when the
/// unit does not follow the launcher naming scheme.
pub fn app_id_from_unit(unit: &str) -> String {
    let captures = |regex: &Lazy<Option<Regex>>| regex.as_ref().and_then(|regex| regex.captures(unit));
    let captured = captures(&SCOPE_OR_SLICE)
        .or_else(|| captures(&SERVICE))
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str());
    captured
        .and_then(unescape_unit)
        .filter(|id| is_valid_app_id(id))
        .unwrap_or_default()
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
    fn test_user_unit() {
        let unified = [cgroup(
            0,
            &[],
            "/user.slice/user-1000.slice/user@1000.service/app.slice/app-gnome-org.gnome.Terminal-4242.scope",
        )];
        assert_eq!(
            user_unit(&unified).as_deref(),
            Some("app-gnome-org.gnome.Terminal-4242.scope")
        );
        let legacy = [
            cgroup(12, &["pids"], "/user.slice"),
            cgroup(
                1,
                &["name=systemd"],
                "/user.slice/user-1000.slice/user@1000.service/app.slice/app-org.example.Foo.service",
            ),
        ];
        assert_eq!(user_unit(&legacy).as_deref(), Some("app-org.example.Foo.service"));
        let slice_only = [cgroup(
            0,
            &[],
            "/user.slice/user-1000.slice/user@1000.service/app.slice/app-org.example.Bar-1.slice",
        )];
        assert_eq!(user_unit(&slice_only).as_deref(), Some("app-org.example.Bar-1.slice"));
        assert_eq!(user_unit(&[cgroup(0, &[], "/system.slice/sshd.service")]), None);
    }

    #[test]
    fn test_app_id_from_unit() {
        assert_eq!(app_id_from_unit("app-gnome-org.gnome.Terminal-4242.scope"), "org.gnome.Terminal");
        assert_eq!(app_id_from_unit("app-org.example.Foo.service"), "org.example.Foo");
        assert_eq!(app_id_from_unit("app-org.example.Foo@12.service"), "org.example.Foo");
        assert_eq!(app_id_from_unit("app-gnome-org.example.Foo-autostart.service"), "org.example.Foo");
        assert_eq!(app_id_from_unit("app-org.example.My\\x2dApp-3.scope"), "org.example.My-App");
        assert_eq!(app_id_from_unit("session-2.scope"), "");
        assert_eq!(app_id_from_unit("app-firefox-12.scope"), "");
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape_unit("a\\x2db").as_deref(), Some("a-b"));
        assert_eq!(unescape_unit("a\\xzz").as_deref(), Some("a\\xzz"));
        assert_eq!(unescape_unit("\\xff"), None);
    }
}
