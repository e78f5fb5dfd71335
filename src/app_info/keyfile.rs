// SPDX-License-Identifier: GPL-3.0-only

//! Minimal reader and writer for the `[Group]` / `key=value` format used by
//! `.flatpak-info`, `snap routine portal-info` and desktop entries.

use std::fmt;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("line {0}: key outside of any group")]
    KeyOutsideGroup(usize),
    #[error("line {0}: malformed group header")]
    BadGroup(usize),
    #[error("line {0}: expected key=value")]
    BadEntry(usize),
}

#[derive(Debug, Default, Clone)]
pub struct KeyFile {
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl KeyFile {
    pub fn parse(text: &str) -> Result<KeyFile, KeyFileError> {
        let mut keyfile = KeyFile::default();
        let mut current = None;
        for (index, line) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest
                    .trim_end()
                    .strip_suffix(']')
                    .filter(|name| !name.is_empty() && !name.contains(['[', ']']))
                    .ok_or(KeyFileError::BadGroup(lineno))?;
                current = Some(keyfile.group_index(name));
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(KeyFileError::BadEntry(lineno))?;
            let key = key.trim_end();
            if key.is_empty() {
                return Err(KeyFileError::BadEntry(lineno));
            }
            let group = &mut keyfile.groups[current.ok_or(KeyFileError::KeyOutsideGroup(lineno))?];
            let value = value.trim_start().to_string();
            match group.entries.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = value,
                None => group.entries.push((key.to_string(), value)),
            }
        }
        Ok(keyfile)
    }

    fn group(&self, name: &str) -> Option<&Group> {
        self.groups.iter().find(|group| group.name == name)
    }

    /// Index of group `name`, appended if it is new.
    fn group_index(&mut self, name: &str) -> usize {
        match self.groups.iter().position(|group| group.name == name) {
            Some(position) => position,
            None => {
                self.groups.push(Group {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.groups.len() - 1
            }
        }
    }

    fn group_mut(&mut self, name: &str) -> &mut Group {
        let position = self.group_index(name);
        &mut self.groups[position]
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.group(name).is_some()
    }

    pub fn start_group(&self) -> Option<&str> {
        self.groups.first().map(|group| group.name.as_str())
    }

    /// Raw, still escaped value.
    pub fn raw(&self, group: &str, key: &str) -> Option<&str> {
        self.group(group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn string(&self, group: &str, key: &str) -> Option<String> {
        self.raw(group, key).map(unescape)
    }

    pub fn boolean(&self, group: &str, key: &str) -> Option<bool> {
        match self.raw(group, key)?.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    /// `;`-separated list, with `\;` escaping a literal separator.
    pub fn list(&self, group: &str, key: &str) -> Vec<String> {
        let Some(raw) = self.raw(group, key) else {
            return Vec::new();
        };
        let mut items = Vec::new();
        let mut current = String::new();
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(';') => current.push(';'),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => current.push('\\'),
                },
                ';' => items.push(unescape(&std::mem::take(&mut current))),
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            items.push(unescape(&current));
        }
        items
    }

    pub fn set_string(&mut self, group: &str, key: &str, value: &str) {
        self.set_raw(group, key, escape(value));
    }

    pub fn set_raw(&mut self, group: &str, key: &str, value: String) {
        let group = self.group_mut(group);
        match group.entries.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value,
            None => group.entries.push((key.to_string(), value)),
        }
    }

    pub fn remove_key(&mut self, group: &str, key: &str) {
        if let Some(group) = self.groups.iter_mut().find(|g| g.name == group) {
            group.entries.retain(|(k, _)| k != key);
        }
    }

    pub fn keys(&self, group: &str) -> impl Iterator<Item = &str> {
        self.group(group)
            .into_iter()
            .flat_map(|group| group.entries.iter().map(|(k, _)| k.as_str()))
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, group) in self.groups.iter().enumerate() {
            if index > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", group.name)?;
            for (key, value) in &group.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for (index, c) in value.chars().enumerate() {
        match c {
            ' ' if index == 0 => out.push_str("\\s"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = "\
# comment
[Application]
name=org.example.App
runtime=runtime/org.gnome.Platform/x86_64/46

[Context]
shared=network;ipc;
sockets = x11;wayland;

[Instance]
instance-id=1234567
";

    #[test]
    fn test_parse_groups_and_values() {
        let keyfile = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(keyfile.start_group(), Some("Application"));
        assert_eq!(
            keyfile.string("Application", "name").as_deref(),
            Some("org.example.App")
        );
        assert_eq!(keyfile.list("Context", "shared"), vec!["network", "ipc"]);
        assert_eq!(keyfile.list("Context", "sockets"), vec!["x11", "wayland"]);
        assert_eq!(keyfile.raw("Instance", "missing"), None);
        assert!(!keyfile.has_group("Session"));
    }

    #[test]
    fn test_reopened_group() {
        let keyfile = KeyFile::parse("[Application]\nname=a\n[Instance]\nx=1\n[Application]\nruntime=r\n").unwrap();
        assert_eq!(keyfile.string("Application", "runtime").as_deref(), Some("r"));
        assert_eq!(keyfile.string("Application", "name").as_deref(), Some("a"));
        assert_eq!(keyfile.raw("Instance", "runtime"), None);
    }

    #[test]
    fn test_rejects_key_before_group() {
        assert_eq!(
            KeyFile::parse("a=b\n[G]\n").unwrap_err(),
            KeyFileError::KeyOutsideGroup(1)
        );
        assert_eq!(KeyFile::parse("[G\n").unwrap_err(), KeyFileError::BadGroup(1));
        assert_eq!(KeyFile::parse("[G]\nnovalue\n").unwrap_err(), KeyFileError::BadEntry(2));
    }

    #[test]
    fn test_escapes() {
        let keyfile = KeyFile::parse("[G]\nk=\\sa\\tb\\\\c\nl=a\\;b;c\n").unwrap();
        assert_eq!(keyfile.string("G", "k").as_deref(), Some(" a\tb\\c"));
        assert_eq!(keyfile.list("G", "l"), vec!["a;b", "c"]);
    }

    #[test]
    fn test_set_and_serialize() {
        let mut keyfile = KeyFile::parse("[Desktop Entry]\nName=Foo\n").unwrap();
        keyfile.set_string("Desktop Entry", "Name", "Bar");
        keyfile.set_string("Desktop Entry", "Comment", "line\nbreak");
        keyfile.remove_key("Desktop Entry", "Missing");
        assert_eq!(
            keyfile.to_string(),
            "[Desktop Entry]\nName=Bar\nComment=line\\nbreak\n"
        );
    }
}
