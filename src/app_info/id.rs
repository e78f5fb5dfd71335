// SPDX-License-Identifier: GPL-3.0-only

//! Grammar checks for application ids, handle tokens and unit names.

pub const MAX_APP_ID_LEN: usize = 255;
pub const MAX_TOKEN_LEN: usize = 64;

/// Reverse-DNS application id: at least three dot-separated components,
/// each starting with `[A-Za-z_]` and made of `[A-Za-z0-9_]`. The last
/// component may also contain `-`.
pub fn is_valid_app_id(id: &str) -> bool {
    if id.is_empty() || id.len() > MAX_APP_ID_LEN {
        return false;
    }
    let components = id.split('.').collect::<Vec<_>>();
    if components.len() < 3 {
        return false;
    }
    let last = components.len() - 1;
    components
        .iter()
        .enumerate()
        .all(|(i, component)| is_valid_component(component, i == last))
}

fn is_valid_component(component: &str, allow_dash: bool) -> bool {
    let allowed = |c: char| c.is_ascii_alphanumeric() || c == '_' || (allow_dash && c == '-');
    let mut chars = component.chars();
    match chars.next() {
        Some(first) if (first.is_ascii_alphabetic() || first == '_' || (allow_dash && first == '-')) => {
            chars.all(allowed)
        }
        _ => false,
    }
}

/// Snap instance names are lowercase alphanumerics and dashes, with an
/// optional `_key` suffix.
pub fn is_valid_snap_name(name: &str) -> bool {
    let (base, key) = match name.split_once('_') {
        Some((base, key)) => (base, Some(key)),
        None => (name, None),
    };
    let snap_chars = |s: &str| {
        !s.is_empty()
            && s.chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    };
    snap_chars(base)
        && !base.starts_with('-')
        && !base.ends_with('-')
        && key.is_none_or(|key| key.len() <= 10 && snap_chars(key))
}

/// Tokens end up in object paths, so they are limited to `[A-Za-z0-9_]`.
pub fn is_valid_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= MAX_TOKEN_LEN
        && token.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Object path element for a unique bus name: `:1.42` becomes `1_42`.
pub fn escape_sender(sender: &str) -> String {
    sender.trim_start_matches(':').replace('.', "_")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_app_id_grammar() {
        assert!(is_valid_app_id("org.gnome.Maps"));
        assert!(is_valid_app_id("com.example.my-app"));
        assert!(is_valid_app_id("_x.y_.z9"));
        assert!(!is_valid_app_id("org.gnome"));
        assert!(!is_valid_app_id(""));
        assert!(!is_valid_app_id(".org.gnome.Maps"));
        assert!(!is_valid_app_id("org.9gnome.Maps"));
        assert!(!is_valid_app_id("org.gno-me.Maps"));
        assert!(!is_valid_app_id("org..Maps"));
        assert!(!is_valid_app_id(&format!("org.example.{}", "a".repeat(250))));
    }

    #[test]
    fn test_snap_names() {
        assert!(is_valid_snap_name("firefox"));
        assert!(is_valid_snap_name("hello-world_dev"));
        assert!(!is_valid_snap_name("Firefox"));
        assert!(!is_valid_snap_name("-lead"));
        assert!(!is_valid_snap_name(""));
    }

    #[test]
    fn test_tokens() {
        assert!(is_valid_token("t1"));
        assert!(is_valid_token("portal_123"));
        assert!(!is_valid_token(""));
        assert!(!is_valid_token("a-b"));
        assert!(!is_valid_token(&"x".repeat(65)));
    }

    #[test]
    fn test_escape_sender() {
        assert_eq!(escape_sender(":1.42"), "1_42");
        assert_eq!(escape_sender(":1.2.3"), "1_2_3");
    }
}
