// SPDX-License-Identifier: GPL-3.0-only

use std::collections::{HashMap, HashSet};

use portal_broker_config::BrokerConfig;
use tracing::{debug, info, warn};
use zbus::fdo::DBusProxy;

pub mod name_owners;

/// Well-known name the broker serves on the session bus.
pub const DESKTOP_SERVICE: &str = "org.freedesktop.portal.Desktop";

/// First configured implementation of `interface` that is running or can
/// be activated.
pub fn choose_backend(config: &BrokerConfig, interface: &str, available: &HashSet<String>) -> Option<String> {
    config
        .backend_bus_names(interface)
        .into_iter()
        .find(|name| available.contains(name))
}

/// Implementation picked for each `org.freedesktop.impl.portal.X` interface.
#[derive(Debug, Default, Clone)]
pub struct Backends {
    chosen: HashMap<String, String>,
}

impl Backends {
    pub async fn resolve(dbus: &DBusProxy<'_>, config: &BrokerConfig, interfaces: &[&str]) -> Backends {
        let mut available = HashSet::new();
        match dbus.list_names().await {
            Ok(names) => available.extend(names.iter().map(|name| name.to_string())),
            Err(err) => warn!(?err, "Failed to list bus names"),
        }
        match dbus.list_activatable_names().await {
            Ok(names) => available.extend(names.iter().map(|name| name.to_string())),
            Err(err) => warn!(?err, "Failed to list activatable bus names"),
        }
        Backends::from_available(config, interfaces, &available)
    }

    pub fn from_available(config: &BrokerConfig, interfaces: &[&str], available: &HashSet<String>) -> Backends {
        let mut chosen = HashMap::new();
        for interface in interfaces {
            match choose_backend(config, interface, available) {
                Some(name) => {
                    info!(interface, backend = %name, "Using implementation");
                    chosen.insert(interface.to_string(), name);
                }
                None => debug!(interface, "No implementation"),
            }
        }
        Backends { chosen }
    }

    pub fn get(&self, interface: &str) -> Option<&str> {
        self.chosen.get(interface).map(String::as_str)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> BrokerConfig {
        BrokerConfig {
            default: vec!["gtk".into()],
            interfaces: HashMap::from([(
                "org.freedesktop.impl.portal.Screenshot".to_string(),
                vec!["wlr".to_string(), "gtk".to_string()],
            )]),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn test_first_available_wins() {
        let available = HashSet::from([
            "org.freedesktop.impl.portal.desktop.gtk".to_string(),
            "org.freedesktop.impl.portal.desktop.wlr".to_string(),
        ]);
        let backends = Backends::from_available(
            &config(),
            &["org.freedesktop.impl.portal.Screenshot", "org.freedesktop.impl.portal.FileChooser"],
            &available,
        );
        assert_eq!(
            backends.get("org.freedesktop.impl.portal.Screenshot"),
            Some("org.freedesktop.impl.portal.desktop.wlr")
        );
        assert_eq!(
            backends.get("org.freedesktop.impl.portal.FileChooser"),
            Some("org.freedesktop.impl.portal.desktop.gtk")
        );
    }

    #[test]
    fn test_missing_backend_skipped() {
        let available = HashSet::from(["org.freedesktop.impl.portal.desktop.gtk".to_string()]);
        assert_eq!(
            choose_backend(&config(), "org.freedesktop.impl.portal.Screenshot", &available).as_deref(),
            Some("org.freedesktop.impl.portal.desktop.gtk")
        );
        assert_eq!(
            choose_backend(&config(), "org.freedesktop.impl.portal.Screenshot", &HashSet::new()),
            None
        );
    }
}
