// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use parking_lot::Mutex;
use zbus::zvariant::{OwnedValue, Value};

use super::{PermissionStore, StoreEntry, StoreError};

#[derive(Debug, Default)]
struct Record {
    permissions: HashMap<String, Vec<String>>,
    data: Option<OwnedValue>,
}

/// Process-lifetime store, used when the store service is unreachable.
#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    records: Mutex<HashMap<(String, String), Record>>,
}

fn key(table: &str, id: &str) -> (String, String) {
    (table.to_string(), id.to_string())
}

impl PermissionStore for MemoryPermissionStore {
    fn lookup(&self, table: &str, id: &str) -> Result<Option<StoreEntry>, StoreError> {
        let records = self.records.lock();
        let Some(record) = records.get(&key(table, id)) else {
            return Ok(None);
        };
        let data = record.data.as_ref().map(OwnedValue::try_clone).transpose()?;
        Ok(Some(StoreEntry {
            permissions: record.permissions.clone(),
            data,
        }))
    }

    fn set_permission(&self, table: &str, id: &str, app_id: &str, permissions: &[String]) -> Result<(), StoreError> {
        self.records
            .lock()
            .entry(key(table, id))
            .or_default()
            .permissions
            .insert(app_id.to_string(), permissions.to_vec());
        Ok(())
    }

    fn set(
        &self,
        table: &str,
        id: &str,
        permissions: &HashMap<String, Vec<String>>,
        data: &Value<'_>,
    ) -> Result<(), StoreError> {
        let record = Record {
            permissions: permissions.clone(),
            data: Some(data.try_to_owned()?),
        };
        self.records.lock().insert(key(table, id), record);
        Ok(())
    }

    fn set_value(&self, table: &str, id: &str, data: &Value<'_>) -> Result<(), StoreError> {
        let data = data.try_to_owned()?;
        self.records.lock().entry(key(table, id)).or_default().data = Some(data);
        Ok(())
    }

    fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        self.records.lock().remove(&key(table, id));
        Ok(())
    }

    fn delete_permission(&self, table: &str, id: &str, app_id: &str) -> Result<(), StoreError> {
        if let Some(record) = self.records.lock().get_mut(&key(table, id)) {
            record.permissions.remove(app_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_records() {
        let store = MemoryPermissionStore::default();
        assert!(store.lookup("t", "a").unwrap().is_none());

        let perms = HashMap::from([("org.example.App".to_string(), vec!["yes".to_string()])]);
        store.set("t", "a", &perms, &Value::from(7u32)).unwrap();
        let entry = store.lookup("t", "a").unwrap().unwrap();
        assert_eq!(entry.permissions, perms);
        assert_eq!(u32::try_from(entry.data.unwrap()).unwrap(), 7);

        store.set_value("t", "a", &Value::from("x")).unwrap();
        let entry = store.lookup("t", "a").unwrap().unwrap();
        assert_eq!(entry.permissions.len(), 1);

        store.delete("t", "a").unwrap();
        assert!(store.lookup("t", "a").unwrap().is_none());
    }
}
