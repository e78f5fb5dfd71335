// SPDX-License-Identifier: GPL-3.0-only

//! USB device rules from the sandbox metadata, e.g. `vnd:0fd9+dev:0063` or
//! `cls:03:*`.

use super::keyfile::KeyFile;

pub const USB_GROUP: &str = "USB Devices";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbRule {
    All,
    Class { class: u8, subclass: Option<u8> },
    Vendor(u16),
    Product(u16),
}

/// A set of rules that all have to match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbQuery(Vec<UsbRule>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbQueries {
    pub enumerable: Vec<UsbQuery>,
    pub hidden: Vec<UsbQuery>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIds {
    pub vendor: u16,
    pub product: u16,
    pub class: u8,
    pub subclass: u8,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid USB rule {0:?}")]
pub struct UsbRuleError(pub String);

impl UsbRule {
    pub fn parse(rule: &str) -> Result<UsbRule, UsbRuleError> {
        let err = || UsbRuleError(rule.to_string());
        if rule == "all" {
            return Ok(UsbRule::All);
        }
        let (kind, value) = rule.split_once(':').ok_or_else(err)?;
        match kind {
            "cls" => {
                let (class, subclass) = value.split_once(':').ok_or_else(err)?;
                let class = u8::from_str_radix(class, 16).map_err(|_| err())?;
                let subclass = match subclass {
                    "*" => None,
                    subclass => Some(u8::from_str_radix(subclass, 16).map_err(|_| err())?),
                };
                Ok(UsbRule::Class { class, subclass })
            }
            "vnd" => hex16(value).map(UsbRule::Vendor).ok_or_else(err),
            "dev" => hex16(value).map(UsbRule::Product).ok_or_else(err),
            _ => Err(err()),
        }
    }

    fn matches(&self, ids: &UsbIds) -> bool {
        match *self {
            UsbRule::All => true,
            UsbRule::Class { class, subclass } => {
                ids.class == class && subclass.is_none_or(|subclass| ids.subclass == subclass)
            }
            UsbRule::Vendor(vendor) => ids.vendor == vendor,
            UsbRule::Product(product) => ids.product == product,
        }
    }
}

fn hex16(value: &str) -> Option<u16> {
    (value.len() == 4)
        .then(|| u16::from_str_radix(value, 16).ok())
        .flatten()
}

impl UsbQuery {
    pub fn parse(query: &str) -> Result<UsbQuery, UsbRuleError> {
        let rules = query
            .split('+')
            .map(UsbRule::parse)
            .collect::<Result<Vec<_>, _>>()?;
        let products = rules.iter().filter(|r| matches!(r, UsbRule::Product(_))).count();
        let vendors = rules.iter().filter(|r| matches!(r, UsbRule::Vendor(_))).count();
        // A product id is only meaningful next to its vendor.
        if products > 1 || vendors > 1 || (products == 1 && vendors == 0) {
            return Err(UsbRuleError(query.to_string()));
        }
        Ok(UsbQuery(rules))
    }

    pub fn matches(&self, ids: &UsbIds) -> bool {
        self.0.iter().all(|rule| rule.matches(ids))
    }
}

impl UsbQueries {
    /// Reads the `[USB Devices]` group. Malformed entries are skipped.
    pub fn from_keyfile(keyfile: &KeyFile) -> Option<UsbQueries> {
        if !keyfile.has_group(USB_GROUP) {
            return None;
        }
        let parse_all = |key: &str| {
            keyfile
                .list(USB_GROUP, key)
                .iter()
                .filter_map(|query| match UsbQuery::parse(query) {
                    Ok(query) => Some(query),
                    Err(err) => {
                        tracing::debug!(%err, "Skipping USB query");
                        None
                    }
                })
                .collect()
        };
        Some(UsbQueries {
            enumerable: parse_all("enumerable-devices"),
            hidden: parse_all("hidden-devices"),
        })
    }

    pub fn allows(&self, ids: &UsbIds) -> bool {
        self.enumerable.iter().any(|query| query.matches(ids))
            && !self.hidden.iter().any(|query| query.matches(ids))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const KEYBOARD: UsbIds = UsbIds {
        vendor: 0x046d,
        product: 0xc31c,
        class: 0x03,
        subclass: 0x01,
    };

    #[test]
    fn test_parse_rules() {
        assert_eq!(UsbRule::parse("all"), Ok(UsbRule::All));
        assert_eq!(
            UsbRule::parse("cls:03:*"),
            Ok(UsbRule::Class {
                class: 3,
                subclass: None
            })
        );
        assert_eq!(UsbRule::parse("vnd:046d"), Ok(UsbRule::Vendor(0x046d)));
        assert!(UsbRule::parse("vnd:46d").is_err());
        assert!(UsbRule::parse("foo:1").is_err());
        assert!(UsbQuery::parse("dev:c31c").is_err());
    }

    #[test]
    fn test_enumerable_and_hidden() {
        let keyfile = KeyFile::parse(
            "[USB Devices]\nenumerable-devices=vnd:046d;cls:08:*;\nhidden-devices=vnd:046d+dev:c31c;\n",
        )
        .unwrap();
        let queries = UsbQueries::from_keyfile(&keyfile).unwrap();
        assert_eq!(queries.enumerable.len(), 2);
        assert!(!queries.allows(&KEYBOARD));
        assert!(queries.allows(&UsbIds {
            product: 0xc52b,
            ..KEYBOARD
        }));
        assert!(queries.allows(&UsbIds {
            vendor: 0x1234,
            class: 0x08,
            ..KEYBOARD
        }));
    }

    #[test]
    fn test_missing_group() {
        let keyfile = KeyFile::parse("[Application]\nname=a.b.c\n").unwrap();
        assert_eq!(UsbQueries::from_keyfile(&keyfile), None);
    }
}
