// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use zbus::zvariant::{OwnedValue, Value};

use super::{PermissionStore, StoreEntry, StoreError};

const NOT_FOUND: &str = "org.freedesktop.portal.Error.NotFound";

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.PermissionStore",
    default_service = "org.freedesktop.impl.portal.PermissionStore",
    default_path = "/org/freedesktop/impl/portal/PermissionStore"
)]
trait StoreService {
    fn lookup(&self, table: &str, id: &str) -> zbus::Result<(HashMap<String, Vec<String>>, OwnedValue)>;

    fn set(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app_permissions: &HashMap<String, Vec<String>>,
        data: &Value<'_>,
    ) -> zbus::Result<()>;

    fn set_value(&self, table: &str, create: bool, id: &str, data: &Value<'_>) -> zbus::Result<()>;

    fn set_permission(
        &self,
        table: &str,
        create: bool,
        id: &str,
        app: &str,
        permissions: &[String],
    ) -> zbus::Result<()>;

    fn delete(&self, table: &str, id: &str) -> zbus::Result<()>;

    fn delete_permission(&self, table: &str, id: &str, app: &str) -> zbus::Result<()>;
}

/// Calls come from worker threads, so the store keeps a blocking handle.
fn blocking(proxy: StoreServiceProxy<'static>) -> StoreServiceProxyBlocking<'static> {
    StoreServiceProxyBlocking::from(proxy.into_inner())
}

/// Permission store service on the session bus.
pub struct BusPermissionStore {
    proxy: StoreServiceProxyBlocking<'static>,
}

impl BusPermissionStore {
    pub async fn connect(connection: &zbus::Connection) -> zbus::Result<BusPermissionStore> {
        let async_proxy = StoreServiceProxy::new(connection).await?;
        Ok(BusPermissionStore {
            proxy: blocking(async_proxy),
        })
    }

    /// Whether the store service is running or activatable.
    pub async fn available(connection: &zbus::Connection) -> bool {
        let Ok(dbus) = zbus::fdo::DBusProxy::new(connection).await else {
            return false;
        };
        let name = match zbus::names::BusName::try_from("org.freedesktop.impl.portal.PermissionStore") {
            Ok(name) => name,
            Err(_) => return false,
        };
        if dbus.name_has_owner(name.clone()).await.unwrap_or(false) {
            return true;
        }
        dbus.list_activatable_names()
            .await
            .map(|names| names.iter().any(|activatable| activatable.as_str() == name.as_str()))
            .unwrap_or(false)
    }
}

fn is_not_found(err: &zbus::Error) -> bool {
    matches!(err, zbus::Error::MethodError(name, _, _) if name.as_str() == NOT_FOUND)
}

impl PermissionStore for BusPermissionStore {
    fn lookup(&self, table: &str, id: &str) -> Result<Option<StoreEntry>, StoreError> {
        match self.proxy.lookup(table, id) {
            Ok((permissions, data)) => Ok(Some(StoreEntry {
                permissions,
                data: Some(data),
            })),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn set_permission(&self, table: &str, id: &str, app_id: &str, permissions: &[String]) -> Result<(), StoreError> {
        Ok(self.proxy.set_permission(table, true, id, app_id, permissions)?)
    }

    fn set(
        &self,
        table: &str,
        id: &str,
        permissions: &HashMap<String, Vec<String>>,
        data: &Value<'_>,
    ) -> Result<(), StoreError> {
        Ok(self.proxy.set(table, true, id, permissions, data)?)
    }

    fn set_value(&self, table: &str, id: &str, data: &Value<'_>) -> Result<(), StoreError> {
        Ok(self.proxy.set_value(table, true, id, data)?)
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        match self.proxy.delete(table, id) {
            Err(err) if !is_not_found(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn delete_permission(&self, table: &str, id: &str, app_id: &str) -> Result<(), StoreError> {
        match self.proxy.delete_permission(table, id, app_id) {
            Err(err) if !is_not_found(&err) => Err(err.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_blocking_handle_keeps_target() {
        let (connection, _peer) = crate::utils::peer_connections();
        let proxy = futures_executor::block_on(
            StoreServiceProxy::builder(&connection)
                .cache_properties(zbus::proxy::CacheProperties::No)
                .build(),
        )
        .unwrap();
        let proxy = blocking(proxy);
        assert_eq!(proxy.inner().path().as_str(), "/org/freedesktop/impl/portal/PermissionStore");
        assert_eq!(
            proxy.inner().interface().as_str(),
            "org.freedesktop.impl.portal.PermissionStore"
        );
    }
}
