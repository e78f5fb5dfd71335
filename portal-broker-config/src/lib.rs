// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub mod permission;

pub use permission::DefaultPermission;

/// Implementation name that disables a portal when listed for its interface.
pub const DISABLED_BACKEND: &str = "none";

/// Prefix every implementation's well-known bus name is built from.
pub const BACKEND_BUS_PREFIX: &str = "org.freedesktop.impl.portal.desktop.";

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Implementations tried for every interface without an explicit entry.
    pub default: Vec<String>,
    /// `org.freedesktop.impl.portal.X` to the implementations serving it.
    pub interfaces: HashMap<String, Vec<String>>,
    pub screenshot_default: DefaultPermission,
    pub test_app_id: Option<String>,
    pub worker_threads: usize,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            default: Vec::new(),
            interfaces: HashMap::new(),
            screenshot_default: DefaultPermission::Ask,
            test_app_id: None,
            worker_threads: 4,
        }
    }
}

impl BrokerConfig {
    /// Ordered implementation names for `interface`, `None` if the portal is disabled.
    pub fn backends_for(&self, interface: &str) -> Option<&[String]> {
        let names = self
            .interfaces
            .get(interface)
            .map(Vec::as_slice)
            .unwrap_or(self.default.as_slice());

        if names.is_empty() || names.iter().any(|name| name == DISABLED_BACKEND) {
            None
        } else {
            Some(names)
        }
    }

    /// Well-known bus names for `interface`, in order of preference.
    pub fn backend_bus_names(&self, interface: &str) -> Vec<String> {
        self.backends_for(interface)
            .unwrap_or_default()
            .iter()
            .map(|name| format!("{BACKEND_BUS_PREFIX}{name}"))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn interface_entry_overrides_default() {
        let config: BrokerConfig = ron::from_str(
            r#"(
                default: ["gtk"],
                interfaces: {
                    "org.freedesktop.impl.portal.Screenshot": ["wlr", "gtk"],
                    "org.freedesktop.impl.portal.Wallpaper": ["none"],
                },
            )"#,
        )
        .unwrap();

        assert_eq!(
            config.backend_bus_names("org.freedesktop.impl.portal.Screenshot"),
            vec![
                "org.freedesktop.impl.portal.desktop.wlr".to_string(),
                "org.freedesktop.impl.portal.desktop.gtk".to_string(),
            ]
        );
        assert_eq!(
            config.backend_bus_names("org.freedesktop.impl.portal.FileChooser"),
            vec!["org.freedesktop.impl.portal.desktop.gtk".to_string()]
        );
        assert!(config
            .backends_for("org.freedesktop.impl.portal.Wallpaper")
            .is_none());
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.screenshot_default, DefaultPermission::Ask);
    }

    #[test]
    fn empty_config_disables_everything() {
        let config = BrokerConfig::default();
        assert!(config
            .backends_for("org.freedesktop.impl.portal.FileChooser")
            .is_none());
    }
}
