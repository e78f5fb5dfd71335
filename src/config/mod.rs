// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::OpenOptions,
    path::{Path, PathBuf},
};

use portal_broker_config::BrokerConfig;
use tracing::{debug, info, warn};

use crate::utils::env;

pub const TEST_APP_ID_VAR: &str = "PORTAL_BROKER_TEST_APP_ID";
pub const DEFAULT_BACKEND_VAR: &str = "PORTAL_BROKER_DEFAULT_BACKEND";

/// Files tried in order, the first existing one wins.
pub fn config_candidates(config_home: Option<&Path>, config_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let mut locations = Vec::new();
    if let Some(home) = config_home {
        locations.push(home.join("portal-broker/config.ron"));
        locations.push(home.join("portal-broker.ron"));
    }
    locations.extend(config_dirs.iter().map(|dir| dir.join("portal-broker/config.ron")));
    locations.push(PathBuf::from("/etc/portal-broker/config.ron"));
    locations
}

fn read_config(path: &Path) -> Option<BrokerConfig> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(err) => {
            warn!(?err, "Failed to open {}", path.display());
            return None;
        }
    };
    match ron::de::from_reader(file) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!(%err, "Malformed config file {}, using defaults", path.display());
            None
        }
    }
}

/// First config found in `locations`, or the defaults.
pub fn load_from(locations: &[PathBuf]) -> BrokerConfig {
    for path in locations {
        debug!("Trying config location: {}", path.display());
        if path.exists() {
            info!("Using config at {}", path.display());
            return read_config(path).unwrap_or_default();
        }
    }
    info!("No config file found, using defaults");
    BrokerConfig::default()
}

pub fn apply_overrides(config: &mut BrokerConfig, test_app_id: Option<String>, default_backend: Option<String>) {
    if let Some(app_id) = test_app_id {
        info!(app_id, "Treating every caller as a test application");
        config.test_app_id = Some(app_id);
    }
    if let Some(backends) = default_backend {
        config.default = backends
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        info!(default = ?config.default, "Default implementations overridden");
    }
}

pub fn load(xdg: Option<&xdg::BaseDirectories>) -> BrokerConfig {
    let config_home = xdg.map(xdg::BaseDirectories::get_config_home);
    let config_dirs = xdg.map(xdg::BaseDirectories::get_config_dirs).unwrap_or_default();
    let mut config = load_from(&config_candidates(config_home.as_deref(), &config_dirs));
    apply_overrides(&mut config, env::str_var(TEST_APP_ID_VAR), env::str_var(DEFAULT_BACKEND_VAR));
    config
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_search_order() {
        let candidates = config_candidates(Some(Path::new("/home/u/.config")), &[PathBuf::from("/etc/xdg")]);
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/home/u/.config/portal-broker/config.ron"),
                PathBuf::from("/home/u/.config/portal-broker.ron"),
                PathBuf::from("/etc/xdg/portal-broker/config.ron"),
                PathBuf::from("/etc/portal-broker/config.ron"),
            ]
        );
    }

    #[test]
    fn test_first_existing_wins() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.ron");
        let second = dir.path().join("second.ron");
        std::fs::write(&second, r#"(default: ["gtk"], worker_threads: 2)"#).unwrap();
        let config = load_from(&[first, second]);
        assert_eq!(config.default, vec!["gtk".to_string()]);
        assert_eq!(config.worker_threads, 2);
    }

    #[test]
    fn test_malformed_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ron");
        std::fs::write(&path, "(default: [").unwrap();
        assert_eq!(load_from(&[path]), BrokerConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = BrokerConfig::default();
        apply_overrides(&mut config, Some("org.example.Test".into()), Some("gnome, gtk,".into()));
        assert_eq!(config.test_app_id.as_deref(), Some("org.example.Test"));
        assert_eq!(config.default, vec!["gnome".to_string(), "gtk".to_string()]);
        assert_eq!(
            config.backend_bus_names("org.freedesktop.impl.portal.FileChooser")[0],
            "org.freedesktop.impl.portal.desktop.gnome"
        );
    }
}
