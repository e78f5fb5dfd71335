// SPDX-License-Identifier: GPL-3.0-only

//! Desktop entries written on behalf of applications: autostart files and
//! installed launchers. Command lines coming from a sandbox are always
//! re-quoted and wrapped so they start inside that sandbox again.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::app_info::{keyfile::KeyFile, AppInfo};

pub const DESKTOP_GROUP: &str = "Desktop Entry";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LauncherError {
    #[error("unterminated quote in Exec line")]
    UnterminatedQuote,
    #[error("Exec line is empty")]
    Empty,
    #[error("{0} applications cannot be launched this way")]
    Unsupported(String),
    #[error("desktop entry has no {0} key")]
    MissingKey(&'static str),
}

const RESERVED: &[char] = &[
    ' ', '\t', '\n', '"', '\'', '\\', '>', '<', '~', '|', '&', ';', '$', '*', '?', '#', '(', ')', '`',
];

/// Quotes one argument for an `Exec` line.
pub fn quote_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains(RESERVED) {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// `Exec` value for `argv`. Literal `%` are escaped unless `field_codes`
/// allows `%f`-style codes through.
pub fn exec_line(argv: &[String], field_codes: bool) -> String {
    argv.iter()
        .map(|arg| {
            let arg = if field_codes || !arg.contains('%') {
                arg.clone()
            } else {
                arg.replace('%', "%%")
            };
            quote_arg(&arg)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Splits an `Exec` value into arguments.
pub fn parse_exec(exec: &str) -> Result<Vec<String>, LauncherError> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut chars = exec.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                in_arg = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => current.push(escaped),
                            None => return Err(LauncherError::UnterminatedQuote),
                        },
                        Some(c) => current.push(c),
                        None => return Err(LauncherError::UnterminatedQuote),
                    }
                }
            }
            ' ' | '\t' | '\n' => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            c => {
                in_arg = true;
                current.push(c);
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    if args.is_empty() {
        return Err(LauncherError::Empty);
    }
    Ok(args)
}

/// Command starting `app_info`, or `commandline` inside it.
fn autostart_command(app_info: &AppInfo, commandline: Option<&[String]>) -> Result<Vec<String>, LauncherError> {
    let unsupported = || LauncherError::Unsupported(app_info.kind().to_string());
    match commandline {
        Some(argv) if !argv.is_empty() => app_info.launch_command(argv).ok_or_else(unsupported),
        _ => match app_info.kind() {
            crate::app_info::AppKind::Flatpak => Ok(vec![
                "flatpak".to_string(),
                "run".to_string(),
                app_info.id().to_string(),
            ]),
            _ => Err(unsupported()),
        },
    }
}

/// Contents of the autostart entry for `app_info`.
pub fn autostart_entry(
    app_info: &AppInfo,
    commandline: Option<&[String]>,
    dbus_activatable: bool,
) -> Result<String, LauncherError> {
    let command = autostart_command(app_info, commandline)?;
    let mut entry = KeyFile::default();
    entry.set_string(DESKTOP_GROUP, "Type", "Application");
    entry.set_string(DESKTOP_GROUP, "Name", app_info.id());
    entry.set_string(DESKTOP_GROUP, "Exec", &exec_line(&command, false));
    if dbus_activatable {
        entry.set_string(DESKTOP_GROUP, "DBusActivatable", "true");
    }
    if app_info.kind() == crate::app_info::AppKind::Flatpak {
        entry.set_string(DESKTOP_GROUP, "X-Flatpak", app_info.id());
    }
    Ok(entry.to_string())
}

fn autostart_path(dir: &Path, app_id: &str) -> PathBuf {
    dir.join(format!("{app_id}.desktop"))
}

/// Writes `contents` through a temporary file so readers never see half
/// a file.
pub fn write_entry(path: &Path, contents: impl AsRef<[u8]>) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "entry path has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_ref())?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

pub fn write_autostart(dir: &Path, app_id: &str, contents: &str) -> io::Result<PathBuf> {
    let path = autostart_path(dir, app_id);
    write_entry(&path, contents)?;
    Ok(path)
}

pub fn remove_autostart(dir: &Path, app_id: &str) -> io::Result<()> {
    match fs::remove_file(autostart_path(dir, app_id)) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        result => result,
    }
}

/// Prepares a desktop entry supplied by `app_info` for installation: its
/// `Exec` is wrapped for the sandbox and keys that could run anything else
/// are dropped.
pub fn rewrite_desktop_entry(
    entry: &mut KeyFile,
    app_info: &AppInfo,
    icon: Option<&Path>,
) -> Result<(), LauncherError> {
    let exec = entry
        .string(DESKTOP_GROUP, "Exec")
        .ok_or(LauncherError::MissingKey("Exec"))?;
    let argv = parse_exec(&exec)?;
    let wrapped = app_info
        .launcher_exec(&argv)
        .ok_or_else(|| LauncherError::Unsupported(app_info.kind().to_string()))?;
    entry.set_string(DESKTOP_GROUP, "Exec", &exec_line(&wrapped, true));
    entry.remove_key(DESKTOP_GROUP, "TryExec");
    entry.remove_key(DESKTOP_GROUP, "DBusActivatable");
    if app_info.kind() == crate::app_info::AppKind::Flatpak {
        entry.set_string(DESKTOP_GROUP, "X-Flatpak", app_info.id());
    }
    match icon {
        Some(icon) => entry.set_string(DESKTOP_GROUP, "Icon", &icon.to_string_lossy()),
        None => entry.remove_key(DESKTOP_GROUP, "Icon"),
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn test_quote_arg() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg("a\"b$c"), "\"a\\\"b\\$c\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[test]
    fn test_exec_round_trip() {
        let args = argv(&["tool", "--name=my file", "$HOME", "100%"]);
        let line = exec_line(&args, false);
        assert!(line.contains("100%%"));
        let parsed = parse_exec(&exec_line(&args, true)).unwrap();
        assert_eq!(parsed, args);
    }

    #[test]
    fn test_parse_exec_errors() {
        assert_eq!(parse_exec("  "), Err(LauncherError::Empty));
        assert_eq!(parse_exec("tool \"open"), Err(LauncherError::UnterminatedQuote));
        assert_eq!(parse_exec("tool  %U").unwrap(), argv(&["tool", "%U"]));
    }

    #[test]
    fn test_flatpak_autostart_entry() {
        let info = AppInfo::sandboxed_for_test("org.example.App");
        let entry = autostart_entry(&info, Some(&argv(&["app", "--background"])), false).unwrap();
        let parsed = KeyFile::parse(&entry).unwrap();
        assert_eq!(
            parsed.string(DESKTOP_GROUP, "Exec").as_deref(),
            Some("flatpak run --command=app org.example.App --background")
        );
        assert_eq!(parsed.string(DESKTOP_GROUP, "X-Flatpak").as_deref(), Some("org.example.App"));

        let default = autostart_entry(&info, None, true).unwrap();
        let parsed = KeyFile::parse(&default).unwrap();
        assert_eq!(
            parsed.string(DESKTOP_GROUP, "Exec").as_deref(),
            Some("flatpak run org.example.App")
        );
        assert_eq!(parsed.boolean(DESKTOP_GROUP, "DBusActivatable"), Some(true));
    }

    #[test]
    fn test_host_autostart_needs_command() {
        let info = AppInfo::host("org.example.Tool".into(), None, None);
        assert!(matches!(autostart_entry(&info, None, false), Err(LauncherError::Unsupported(_))));
        assert!(autostart_entry(&info, Some(&argv(&["tool"])), false).is_ok());
    }

    #[test]
    fn test_write_and_remove_autostart() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_autostart(dir.path(), "org.example.App", "[Desktop Entry]\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[Desktop Entry]\n");
        remove_autostart(dir.path(), "org.example.App").unwrap();
        assert!(!path.exists());
        remove_autostart(dir.path(), "org.example.App").unwrap();
    }

    #[test]
    fn test_rewrite_desktop_entry() {
        let info = AppInfo::sandboxed_for_test("org.example.App");
        let mut entry = KeyFile::parse(
            "[Desktop Entry]\nType=Application\nName=Site\nExec=browser --app \"https://example.org\" %U\nTryExec=browser\n",
        )
        .unwrap();
        rewrite_desktop_entry(&mut entry, &info, Some(Path::new("/icons/site.png"))).unwrap();
        assert_eq!(
            entry.string(DESKTOP_GROUP, "Exec").as_deref(),
            Some("flatpak run --command=browser --file-forwarding org.example.App --app https://example.org @@u %U @@")
        );
        assert!(entry.raw(DESKTOP_GROUP, "TryExec").is_none());
        assert_eq!(entry.string(DESKTOP_GROUP, "Icon").as_deref(), Some("/icons/site.png"));
    }
}
