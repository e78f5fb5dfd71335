// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashMap, os::fd::AsFd, sync::Arc};

use futures_executor::ThreadPool;
use parking_lot::Mutex;
use tracing::debug;
use zbus::{
    fdo,
    names::{BusName, UniqueName},
};

use super::{detect, id::is_valid_app_id, AppInfo, AppKind, IdentityError};
use crate::{dbus::name_owners::OwnerSubscriber, error::PortalError, utils::dirs::HostDirs};

#[derive(Debug, Default)]
struct Cache {
    entries: HashMap<String, Arc<AppInfo>>,
    /// Resolutions in flight per sender. Dropped when the sender vanishes,
    /// so late results are not cached.
    pending: HashMap<String, usize>,
}

/// Per-connection cache of caller identities.
///
/// Resolution runs outside the lock; if two calls race, the first inserted
/// identity wins and both callers see it.
#[derive(Debug)]
pub struct AppInfoResolver {
    cache: Mutex<Cache>,
    dirs: HostDirs,
    test_app_id: Option<String>,
}

impl AppInfoResolver {
    pub fn new(dirs: HostDirs, test_app_id: Option<String>) -> AppInfoResolver {
        AppInfoResolver {
            cache: Mutex::new(Cache::default()),
            dirs,
            test_app_id,
        }
    }

    pub fn cached(&self, sender: &UniqueName<'_>) -> Option<Arc<AppInfo>> {
        self.cache.lock().entries.get(sender.as_str()).cloned()
    }

    fn insert(&self, sender: &UniqueName<'_>, info: AppInfo) -> Arc<AppInfo> {
        self.cache
            .lock()
            .entries
            .entry(sender.to_string())
            .or_insert_with(|| Arc::new(info))
            .clone()
    }

    fn begin(&self, sender: &UniqueName<'_>) {
        *self.cache.lock().pending.entry(sender.to_string()).or_default() += 1;
    }

    /// Ends a resolution started with `begin`. The identity is only cached
    /// if the sender is still on the bus.
    fn finish(&self, sender: &UniqueName<'_>, info: Option<AppInfo>) -> Option<Arc<AppInfo>> {
        let mut cache = self.cache.lock();
        let Some(count) = cache.pending.get_mut(sender.as_str()) else {
            debug!(sender = %sender, "Caller left during identification");
            return info.map(Arc::new);
        };
        *count -= 1;
        if *count == 0 {
            cache.pending.remove(sender.as_str());
        }
        let info = info?;
        Some(
            cache
                .entries
                .entry(sender.to_string())
                .or_insert_with(|| Arc::new(info))
                .clone(),
        )
    }

    pub async fn resolve(
        &self,
        dbus: &fdo::DBusProxy<'_>,
        executor: &ThreadPool,
        sender: &UniqueName<'_>,
    ) -> Result<Arc<AppInfo>, IdentityError> {
        if let Some(info) = self.cached(sender) {
            return Ok(info);
        }
        if let Some(id) = &self.test_app_id {
            return Ok(self.insert(sender, AppInfo::test(id.clone())));
        }

        self.begin(sender);
        let detected = self.identify(dbus, executor, sender).await;
        match detected {
            Ok(info) => self.finish(sender, Some(info)).ok_or(IdentityError::ProcessGone),
            Err(err) => {
                self.finish(sender, None);
                Err(err)
            }
        }
    }

    async fn identify(
        &self,
        dbus: &fdo::DBusProxy<'_>,
        executor: &ThreadPool,
        sender: &UniqueName<'_>,
    ) -> Result<AppInfo, IdentityError> {
        let credentials = dbus
            .get_connection_credentials(BusName::from(sender.clone()))
            .await
            .map_err(|err| IdentityError::Credentials(err.to_string()))?;
        let pid = credentials
            .process_id()
            .ok_or_else(|| IdentityError::Credentials("no process id".into()))?;
        let pidfd = credentials
            .process_fd()
            .ok_or_else(|| IdentityError::Credentials("no process fd".into()))?
            .as_fd()
            .try_clone_to_owned()
            .map_err(|source| IdentityError::Proc {
                path: "pidfd".into(),
                source,
            })?;

        let dirs = self.dirs.clone();
        crate::utils::unblock(executor, move || detect(pid, pidfd, &dirs))
            .await
            .map_err(|err| IdentityError::Credentials(err.to_string()))?
    }

    /// Associates an application id with an unconfined caller. Only allowed
    /// once, and never for sandboxed callers.
    pub fn register(
        &self,
        sender: &UniqueName<'_>,
        current: &AppInfo,
        app_id: &str,
    ) -> Result<Arc<AppInfo>, PortalError> {
        if !current.is_unconfined() || current.kind() == AppKind::Test {
            return Err(PortalError::not_allowed(format!(
                "Registration not available to {} applications",
                current.kind()
            )));
        }
        if !is_valid_app_id(app_id) {
            return Err(PortalError::invalid(format!("Invalid application id {app_id:?}")));
        }
        let mut cache = self.cache.lock();
        if let Some(existing) = cache.entries.get(sender.as_str()) {
            if !existing.id().is_empty() && existing.id() != app_id {
                return Err(PortalError::Exists(format!(
                    "Connection already associated with application {:?}",
                    existing.id()
                )));
            }
        }
        let info = Arc::new(AppInfo::registered(app_id.to_string(), current));
        cache.entries.insert(sender.to_string(), info.clone());
        debug!(sender = %sender, app_id, "Registered host application");
        Ok(info)
    }

    /// Connections currently known as `app_id`.
    pub fn senders_of(&self, app_id: &str) -> Vec<UniqueName<'static>> {
        self.cache
            .lock()
            .entries
            .iter()
            .filter(|(_, info)| info.id() == app_id)
            .filter_map(|(sender, _)| UniqueName::try_from(sender.clone()).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().entries.len()
    }
}

impl OwnerSubscriber for AppInfoResolver {
    fn owner_vanished(&self, owner: &UniqueName<'static>) {
        let mut cache = self.cache.lock();
        cache.entries.remove(owner.as_str());
        cache.pending.remove(owner.as_str());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;

    fn sender(name: &str) -> UniqueName<'static> {
        UniqueName::try_from(name.to_string()).unwrap()
    }

    #[test]
    fn test_first_insert_wins() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        let a = resolver.insert(&sender(":1.5"), AppInfo::host("org.example.A".into(), None, None));
        let b = resolver.insert(&sender(":1.5"), AppInfo::host("org.example.B".into(), None, None));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.id(), "org.example.A");
    }

    #[test]
    fn test_eviction() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        resolver.insert(&sender(":1.5"), AppInfo::host(String::new(), None, None));
        resolver.owner_vanished(&sender(":1.5"));
        assert!(resolver.cached(&sender(":1.5")).is_none());
        assert_eq!(resolver.len(), 0);
    }

    #[test]
    fn test_vanished_during_resolution() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        let name = sender(":1.8");
        resolver.begin(&name);
        resolver.owner_vanished(&name);
        let info = resolver.finish(&name, Some(AppInfo::host("org.example.A".into(), None, None)));
        assert_eq!(info.unwrap().id(), "org.example.A");
        assert!(resolver.cached(&name).is_none());
        assert_eq!(resolver.len(), 0);
        assert!(resolver.cache.lock().pending.is_empty());
    }

    #[test]
    fn test_resolution_is_cached() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        let name = sender(":1.8");
        resolver.begin(&name);
        resolver.begin(&name);
        let first = resolver.finish(&name, Some(AppInfo::host("org.example.A".into(), None, None))).unwrap();
        assert!(resolver.finish(&name, None).is_none());
        assert!(Arc::ptr_eq(&first, &resolver.cached(&name).unwrap()));
        assert!(resolver.cache.lock().pending.is_empty());
    }

    #[test]
    fn test_senders_of() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        resolver.insert(&sender(":1.5"), AppInfo::host("org.example.A".into(), None, None));
        resolver.insert(&sender(":1.6"), AppInfo::host("org.example.A".into(), None, None));
        resolver.insert(&sender(":1.7"), AppInfo::host("org.example.B".into(), None, None));
        let mut senders = resolver
            .senders_of("org.example.A")
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>();
        senders.sort();
        assert_eq!(senders, vec![":1.5".to_string(), ":1.6".to_string()]);
    }

    #[test]
    fn test_register_host_once() {
        let resolver = AppInfoResolver::new(HostDirs::rooted(Path::new("/r")), None);
        let name = sender(":1.9");
        let host = resolver.insert(&name, AppInfo::host(String::new(), Some(42), None));
        let registered = resolver.register(&name, &host, "org.example.Tool").unwrap();
        assert_eq!(registered.kind(), AppKind::Registered);
        assert_eq!(registered.pid(), Some(42));
        assert_eq!(resolver.cached(&name).unwrap().id(), "org.example.Tool");
        assert!(matches!(
            resolver.register(&name, &registered, "org.example.Other"),
            Err(PortalError::Exists(_))
        ));
        assert!(resolver.register(&name, &registered, "org.example.Tool").is_ok());
        assert!(matches!(
            resolver.register(&name, &registered, "bad"),
            Err(PortalError::InvalidArgument(_))
        ));
        let sandboxed = AppInfo::test("org.example.Sandboxed".into());
        assert!(matches!(
            resolver.register(&sender(":1.10"), &sandboxed, "org.example.Tool"),
            Err(PortalError::NotAllowed(_))
        ));
    }
}
