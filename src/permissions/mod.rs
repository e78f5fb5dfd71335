// SPDX-License-Identifier: GPL-3.0-only

//! Typed access to the key/value permission store.
//!
//! Records are keyed by `(table, id)` and hold a list of short strings per
//! application id, plus one opaque data value.

use std::collections::HashMap;

use tracing::warn;
use zbus::zvariant::{OwnedValue, Value};

mod bus;
mod memory;
mod transient;

pub use self::{bus::BusPermissionStore, memory::MemoryPermissionStore, transient::TransientPermissions};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("permission store call failed: {0}")]
    Bus(#[from] zbus::Error),
    #[error("permission store value: {0}")]
    Value(#[from] zbus::zvariant::Error),
}

/// One `(table, id)` record.
#[derive(Debug, Default)]
pub struct StoreEntry {
    pub permissions: HashMap<String, Vec<String>>,
    pub data: Option<OwnedValue>,
}

/// Blocking interface of a permission store; called from worker threads.
pub trait PermissionStore: Send + Sync {
    /// `None` when the record does not exist.
    fn lookup(&self, table: &str, id: &str) -> Result<Option<StoreEntry>, StoreError>;
    fn set_permission(&self, table: &str, id: &str, app_id: &str, permissions: &[String]) -> Result<(), StoreError>;
    /// Replaces a whole record.
    fn set(
        &self,
        table: &str,
        id: &str,
        permissions: &HashMap<String, Vec<String>>,
        data: &Value<'_>,
    ) -> Result<(), StoreError>;
    fn set_value(&self, table: &str, id: &str, data: &Value<'_>) -> Result<(), StoreError>;
    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;
    fn delete_permission(&self, table: &str, id: &str, app_id: &str) -> Result<(), StoreError>;
}

/// Tri-state view of a single-entry permission list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Permission {
    #[default]
    Unset,
    No,
    Yes,
    Ask,
}

impl Permission {
    pub fn from_list(list: &[String]) -> Permission {
        match list {
            [] => Permission::Unset,
            [single] => match single.as_str() {
                "yes" => Permission::Yes,
                "no" => Permission::No,
                "ask" => Permission::Ask,
                other => {
                    warn!(value = other, "Unknown permission value");
                    Permission::Unset
                }
            },
            _ => {
                warn!(?list, "Unexpected permission list");
                Permission::Unset
            }
        }
    }

    pub fn to_list(self) -> Vec<String> {
        match self {
            Permission::Unset => Vec::new(),
            Permission::No => vec!["no".to_string()],
            Permission::Yes => vec!["yes".to_string()],
            Permission::Ask => vec!["ask".to_string()],
        }
    }
}

impl From<portal_broker_config::DefaultPermission> for Permission {
    fn from(default: portal_broker_config::DefaultPermission) -> Self {
        match default {
            portal_broker_config::DefaultPermission::Yes => Permission::Yes,
            portal_broker_config::DefaultPermission::No => Permission::No,
            portal_broker_config::DefaultPermission::Ask => Permission::Ask,
        }
    }
}

/// Permission list of `app_id` for `(table, id)`; empty if unknown.
pub fn get(store: &dyn PermissionStore, app_id: &str, table: &str, id: &str) -> Result<Vec<String>, StoreError> {
    Ok(store
        .lookup(table, id)?
        .and_then(|mut entry| entry.permissions.remove(app_id))
        .unwrap_or_default())
}

pub fn set(store: &dyn PermissionStore, app_id: &str, table: &str, id: &str, list: &[String]) -> Result<(), StoreError> {
    store.set_permission(table, id, app_id, list)
}

pub fn delete(store: &dyn PermissionStore, app_id: &str, table: &str, id: &str) -> Result<(), StoreError> {
    store.delete_permission(table, id, app_id)
}

/// Store failures are logged and read as [`Permission::Unset`].
pub fn get_permission(store: &dyn PermissionStore, table: &str, id: &str, app_id: &str) -> Permission {
    match get(store, app_id, table, id) {
        Ok(list) => Permission::from_list(&list),
        Err(err) => {
            warn!(table, id, app_id, %err, "Failed to read permission");
            Permission::Unset
        }
    }
}

pub fn set_permission(store: &dyn PermissionStore, table: &str, id: &str, app_id: &str, permission: Permission) {
    if let Err(err) = set(store, app_id, table, id, &permission.to_list()) {
        warn!(table, id, app_id, %err, "Failed to store permission");
    }
}
