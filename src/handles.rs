// SPDX-License-Identifier: GPL-3.0-only

//! Object path tables for client visible handles, indexed by owner.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use zbus::zvariant::{ObjectPath, OwnedObjectPath};

use crate::{
    app_info::id::{escape_sender, is_valid_token},
    error::{CoreError, PortalError},
};

pub const REQUEST_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/request";
pub const SESSION_PATH_PREFIX: &str = "/org/freedesktop/portal/desktop/session";

/// A handle that lives at an object path on behalf of one bus name.
pub trait Handle: Send + Sync {
    fn path(&self) -> &ObjectPath<'static>;
    fn owner(&self) -> &str;
}

static TOKEN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Object path `<prefix>/<escaped sender>/<token>`.
///
/// Without a client supplied token one is generated.
pub fn handle_path(prefix: &str, sender: &str, token: Option<&str>) -> Result<OwnedObjectPath, PortalError> {
    let token = match token {
        Some(token) if is_valid_token(token) => token.to_string(),
        Some(token) => return Err(PortalError::invalid(format!("Invalid token {token:?}"))),
        None => format!("t{}", TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)),
    };
    let path = format!("{prefix}/{}/{token}", escape_sender(sender));
    Ok(OwnedObjectPath::try_from(path)?)
}

#[derive(Debug)]
struct Tables<T> {
    by_path: HashMap<String, Arc<T>>,
    by_owner: HashMap<String, HashSet<String>>,
}

#[derive(Debug)]
pub struct HandleTable<T> {
    inner: Mutex<Tables<T>>,
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        HandleTable {
            inner: Mutex::new(Tables {
                by_path: HashMap::new(),
                by_owner: HashMap::new(),
            }),
        }
    }
}

impl<T: Handle> HandleTable<T> {
    /// Fails if the path is taken, which for a live owner means its token
    /// was reused.
    pub fn insert(&self, handle: Arc<T>) -> Result<(), CoreError> {
        let mut tables = self.inner.lock();
        let path = handle.path().to_string();
        if tables.by_path.contains_key(&path) {
            return Err(CoreError::TokenReuse(path));
        }
        tables
            .by_owner
            .entry(handle.owner().to_string())
            .or_default()
            .insert(path.clone());
        tables.by_path.insert(path, handle);
        Ok(())
    }

    pub fn get(&self, path: &ObjectPath<'_>) -> Option<Arc<T>> {
        self.inner.lock().by_path.get(path.as_str()).cloned()
    }

    pub fn remove(&self, path: &ObjectPath<'_>) -> Option<Arc<T>> {
        let mut tables = self.inner.lock();
        let handle = tables.by_path.remove(path.as_str())?;
        if let Some(paths) = tables.by_owner.get_mut(handle.owner()) {
            paths.remove(path.as_str());
            if paths.is_empty() {
                tables.by_owner.remove(handle.owner());
            }
        }
        Some(handle)
    }

    /// Removes and returns everything owned by `owner`.
    pub fn take_owner(&self, owner: &str) -> Vec<Arc<T>> {
        let mut tables = self.inner.lock();
        let Some(paths) = tables.by_owner.remove(owner) else {
            return Vec::new();
        };
        paths
            .iter()
            .filter_map(|path| tables.by_path.remove(path))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_path.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Item {
        path: ObjectPath<'static>,
        owner: String,
    }

    impl Handle for Item {
        fn path(&self) -> &ObjectPath<'static> {
            &self.path
        }

        fn owner(&self) -> &str {
            &self.owner
        }
    }

    fn item(owner: &str, token: &str) -> Arc<Item> {
        let path = handle_path(REQUEST_PATH_PREFIX, owner, Some(token)).unwrap();
        Arc::new(Item {
            path: path.into_inner(),
            owner: owner.to_string(),
        })
    }

    #[test]
    fn test_handle_path() {
        let path = handle_path(REQUEST_PATH_PREFIX, ":1.42", Some("abc_1")).unwrap();
        assert_eq!(path.as_str(), "/org/freedesktop/portal/desktop/request/1_42/abc_1");

        assert!(handle_path(REQUEST_PATH_PREFIX, ":1.42", Some("a/b")).is_err());
        assert!(handle_path(REQUEST_PATH_PREFIX, ":1.42", Some("")).is_err());

        let first = handle_path(SESSION_PATH_PREFIX, ":1.42", None).unwrap();
        let second = handle_path(SESSION_PATH_PREFIX, ":1.42", None).unwrap();
        assert_ne!(first, second);
        assert!(first.as_str().starts_with("/org/freedesktop/portal/desktop/session/1_42/t"));
    }

    #[test]
    fn test_token_reuse_rejected() {
        let table = HandleTable::default();
        table.insert(item(":1.1", "one")).unwrap();
        assert!(matches!(
            table.insert(item(":1.1", "one")),
            Err(CoreError::TokenReuse(_))
        ));
        // Same token from another sender lands on another path.
        table.insert(item(":1.2", "one")).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_take_owner() {
        let table = HandleTable::default();
        table.insert(item(":1.1", "one")).unwrap();
        table.insert(item(":1.1", "two")).unwrap();
        table.insert(item(":1.2", "one")).unwrap();

        let mut taken = table
            .take_owner(":1.1")
            .iter()
            .map(|item| item.path.to_string())
            .collect::<Vec<_>>();
        taken.sort();
        assert_eq!(
            taken,
            vec![
                "/org/freedesktop/portal/desktop/request/1_1/one".to_string(),
                "/org/freedesktop/portal/desktop/request/1_1/two".to_string(),
            ]
        );
        assert_eq!(table.len(), 1);
        assert!(table.take_owner(":1.1").is_empty());
    }

    #[test]
    fn test_remove_updates_owner_index() {
        let table = HandleTable::default();
        let one = item(":1.1", "one");
        table.insert(one.clone()).unwrap();
        assert!(table.get(&one.path).is_some());
        assert!(table.remove(&one.path).is_some());
        assert!(table.remove(&one.path).is_none());
        assert!(table.take_owner(":1.1").is_empty());
    }
}
