// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use parking_lot::Mutex;
use zbus::names::UniqueName;

use super::Permission;
use crate::dbus::name_owners::OwnerSubscriber;

/// Answers that were not meant to be remembered, scoped to the bus
/// connection that received them.
#[derive(Debug, Default)]
pub struct TransientPermissions {
    by_sender: Mutex<HashMap<String, HashMap<(String, String), Permission>>>,
}

impl TransientPermissions {
    pub fn get(&self, sender: &str, table: &str, id: &str) -> Permission {
        self.by_sender
            .lock()
            .get(sender)
            .and_then(|entries| entries.get(&(table.to_string(), id.to_string())))
            .copied()
            .unwrap_or_default()
    }

    pub fn set(&self, sender: &str, table: &str, id: &str, permission: Permission) {
        let mut by_sender = self.by_sender.lock();
        let entries = by_sender.entry(sender.to_string()).or_default();
        match permission {
            Permission::Unset => {
                entries.remove(&(table.to_string(), id.to_string()));
            }
            permission => {
                entries.insert((table.to_string(), id.to_string()), permission);
            }
        }
    }

    pub fn forget(&self, sender: &str) {
        self.by_sender.lock().remove(sender);
    }
}

impl OwnerSubscriber for TransientPermissions {
    fn owner_vanished(&self, owner: &UniqueName<'static>) {
        self.forget(owner.as_str());
    }
}
