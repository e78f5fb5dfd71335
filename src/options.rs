// SPDX-License-Identifier: GPL-3.0-only

//! Whitelisting of `a{sv}` option dictionaries.

use std::collections::HashMap;

use tracing::debug;
use zbus::zvariant::{OwnedValue, Value};

use crate::{app_info::id::is_valid_token, error::PortalError};

pub type VarDict = HashMap<String, OwnedValue>;

pub type Validator = fn(key: &str, value: &Value<'_>, options: &VarDict) -> Result<(), PortalError>;

/// One accepted option: its key, its D-Bus signature (`v` accepts any
/// type) and an optional validator.
#[derive(Clone, Copy)]
pub struct OptionSpec {
    pub key: &'static str,
    pub signature: &'static str,
    pub validate: Option<Validator>,
}

impl OptionSpec {
    pub const fn new(key: &'static str, signature: &'static str) -> OptionSpec {
        OptionSpec {
            key,
            signature,
            validate: None,
        }
    }

    pub const fn validated(key: &'static str, signature: &'static str, validate: Validator) -> OptionSpec {
        OptionSpec {
            key,
            signature,
            validate: Some(validate),
        }
    }
}

/// Copies the options listed in `specs` out of `options`.
///
/// Unknown keys are dropped. A known key with the wrong type, or one its
/// validator refuses, fails the whole call with `InvalidArgument`.
pub fn filter_options(options: &VarDict, specs: &[OptionSpec]) -> Result<VarDict, PortalError> {
    let mut filtered = VarDict::new();
    for (key, value) in options {
        let Some(spec) = specs.iter().find(|spec| spec.key == key) else {
            debug!(key, "Dropping unsupported option");
            continue;
        };
        let signature = value.value_signature().to_string();
        if spec.signature != "v" && signature != spec.signature {
            return Err(PortalError::invalid(format!(
                "Option {key} has type {signature}, expected {}",
                spec.signature
            )));
        }
        if let Some(validate) = spec.validate {
            validate(key, value, options)?;
        }
        filtered.insert(key.clone(), value.try_clone()?);
    }
    Ok(filtered)
}

pub fn to_value<'a, T>(value: T) -> Result<OwnedValue, PortalError>
where
    T: Into<Value<'a>>,
{
    Ok(value.into().try_to_owned()?)
}

pub fn get_str<'a>(options: &'a VarDict, key: &str) -> Option<&'a str> {
    match &**options.get(key)? {
        Value::Str(s) => Some(s.as_str()),
        Value::ObjectPath(path) => Some(path.as_str()),
        _ => None,
    }
}

pub fn get_u32(options: &VarDict, key: &str) -> Option<u32> {
    match &**options.get(key)? {
        Value::U32(n) => Some(*n),
        _ => None,
    }
}

pub fn get_bool(options: &VarDict, key: &str) -> Option<bool> {
    match &**options.get(key)? {
        Value::Bool(b) => Some(*b),
        _ => None,
    }
}

pub fn get_strv(options: &VarDict, key: &str) -> Option<Vec<String>> {
    value_strv(options.get(key)?)
}

pub fn value_strv(value: &Value<'_>) -> Option<Vec<String>> {
    match value {
        Value::Array(array) => array
            .iter()
            .map(|item| match item {
                Value::Str(s) => Some(s.to_string()),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

/// Byte string options (`ay`), as used for paths.
pub fn get_bytes(options: &VarDict, key: &str) -> Option<Vec<u8>> {
    match &**options.get(key)? {
        Value::Array(array) => array
            .iter()
            .map(|item| match item {
                Value::U8(b) => Some(*b),
                _ => None,
            })
            .collect(),
        _ => None,
    }
}

fn str_of<'v>(key: &str, value: &'v Value<'_>) -> Result<&'v str, PortalError> {
    match value {
        Value::Str(s) => Ok(s.as_str()),
        _ => Err(PortalError::invalid(format!("Option {key} must be a string"))),
    }
}

pub fn validate_reason(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    let reason = str_of(key, value)?;
    if reason.chars().count() > 256 {
        return Err(PortalError::invalid(format!("Option {key} is longer than 256 characters")));
    }
    Ok(())
}

pub fn validate_token(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    if !is_valid_token(str_of(key, value)?) {
        return Err(PortalError::invalid(format!("Option {key} is not a valid token")));
    }
    Ok(())
}

pub fn validate_uuid(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    uuid::Uuid::parse_str(str_of(key, value)?)
        .map(|_| ())
        .map_err(|_| PortalError::invalid(format!("Option {key} is not a UUID")))
}

pub fn validate_persist_mode(key: &str, value: &Value<'_>, _: &VarDict) -> Result<(), PortalError> {
    match value {
        Value::U32(mode) if *mode <= 2 => Ok(()),
        _ => Err(PortalError::invalid(format!("Option {key} must be 0, 1 or 2"))),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const SPECS: &[OptionSpec] = &[
        OptionSpec::validated("reason", "s", validate_reason),
        OptionSpec::new("autostart", "b"),
        OptionSpec::new("commandline", "as"),
        OptionSpec::validated("persist_mode", "u", validate_persist_mode),
        OptionSpec::new("anything", "v"),
    ];

    fn dict(entries: Vec<(&str, OwnedValue)>) -> VarDict {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_unknown_keys_dropped() {
        let options = dict(vec![
            ("reason", to_value("sync").unwrap()),
            ("bogus", to_value(7u32).unwrap()),
        ]);
        let filtered = filter_options(&options, SPECS).unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(get_str(&filtered, "reason"), Some("sync"));
    }

    #[test]
    fn test_wrong_type_rejected() {
        let options = dict(vec![("autostart", to_value("yes").unwrap())]);
        assert!(matches!(
            filter_options(&options, SPECS),
            Err(PortalError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_validators() {
        let long = dict(vec![("reason", to_value("x".repeat(257)).unwrap())]);
        assert!(filter_options(&long, SPECS).is_err());
        let ok = dict(vec![("reason", to_value("é".repeat(256)).unwrap())]);
        assert!(filter_options(&ok, SPECS).is_ok());
        let mode = dict(vec![("persist_mode", to_value(3u32).unwrap())]);
        assert!(filter_options(&mode, SPECS).is_err());
        let mode = dict(vec![("persist_mode", to_value(2u32).unwrap())]);
        assert_eq!(get_u32(&filter_options(&mode, SPECS).unwrap(), "persist_mode"), Some(2));
    }

    #[test]
    fn test_accessors() {
        let options = dict(vec![
            ("commandline", to_value(vec!["a".to_string(), "b".to_string()]).unwrap()),
            ("autostart", to_value(true).unwrap()),
            ("anything", to_value(1.5f64).unwrap()),
        ]);
        let filtered = filter_options(&options, SPECS).unwrap();
        assert_eq!(get_strv(&filtered, "commandline"), Some(vec!["a".into(), "b".into()]));
        assert_eq!(get_bool(&filtered, "autostart"), Some(true));
        assert_eq!(get_str(&filtered, "autostart"), None);
        assert!(filtered.contains_key("anything"));
    }

    #[test]
    fn test_uuid_and_token() {
        let value = Value::from("2f1a3c1e-0b6e-4b8e-9c52-6c5a7d0e9f11");
        assert!(validate_uuid("id", &value, &VarDict::new()).is_ok());
        assert!(validate_uuid("id", &Value::from("nope"), &VarDict::new()).is_err());
        assert!(validate_token("t", &Value::from("abc_1"), &VarDict::new()).is_ok());
        assert!(validate_token("t", &Value::from("a/b"), &VarDict::new()).is_err());
    }
}
