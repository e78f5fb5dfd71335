// SPDX-License-Identifier: GPL-3.0-only

//! Restore tokens: opaque handles under which implementation-private
//! session state is kept between runs.
//!
//! Implementations return `restore_data`, a `(suv)` tuple the broker never
//! looks into. Clients only ever see the `restore_token` naming it.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, warn};
use zbus::{names::UniqueName, zvariant::OwnedValue};

use crate::{
    dbus::name_owners::OwnerSubscriber,
    options::{get_str, get_u32, to_value, VarDict},
    permissions::PermissionStore,
};

pub const RESTORE_TOKEN: &str = "restore_token";
pub const RESTORE_DATA: &str = "restore_data";
pub const PERSIST_MODE: &str = "persist_mode";
pub const RESTORE_DATA_SIGNATURE: &str = "(suv)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PersistMode {
    #[default]
    None = 0,
    Transient = 1,
    Persistent = 2,
}

impl PersistMode {
    /// Out-of-range values are refused at option filtering; here they
    /// clamp to the strongest mode so they can never escalate anything.
    pub fn from_u32(mode: u32) -> PersistMode {
        match mode {
            0 => PersistMode::None,
            1 => PersistMode::Transient,
            _ => PersistMode::Persistent,
        }
    }
}

/// Restore bookkeeping of one session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreState {
    pub token: Option<String>,
    pub persist_mode: PersistMode,
}

/// Who a restore entry belongs to.
#[derive(Debug, Clone, Copy)]
pub struct RestoreOwner<'a> {
    pub sender: &'a str,
    pub app_id: &'a str,
}

pub fn is_restore_data(value: &OwnedValue) -> bool {
    value.value_signature().to_string() == RESTORE_DATA_SIGNATURE
}

pub struct RestoreTokens {
    /// `(table, "<sender>/<token>")` to payload.
    transient: Mutex<HashMap<(String, String), OwnedValue>>,
    store: Arc<dyn PermissionStore>,
}

fn transient_key(table: &str, sender: &str, token: &str) -> (String, String) {
    (table.to_string(), format!("{sender}/{token}"))
}

impl RestoreTokens {
    pub fn new(store: Arc<dyn PermissionStore>) -> RestoreTokens {
        RestoreTokens {
            transient: Mutex::new(HashMap::new()),
            store,
        }
    }

    fn take_transient(&self, table: &str, sender: &str, token: &str) -> Option<OwnedValue> {
        self.transient
            .lock()
            .remove(&transient_key(table, sender, token))
    }

    /// Blocking: talks to the permission store.
    fn take_persistent(&self, table: &str, app_id: &str, token: &str) -> Option<OwnedValue> {
        if app_id.is_empty() {
            return None;
        }
        let entry = match self.store.lookup(table, token) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => {
                warn!(table, token, %err, "Failed to look up restore data");
                return None;
            }
        };
        if !entry.permissions.contains_key(app_id) {
            debug!(table, token, app_id, "Restore token belongs to another application");
            return None;
        }
        let data = entry.data.filter(is_restore_data)?;
        if let Err(err) = self.store.delete(table, token) {
            warn!(table, token, %err, "Failed to remove consumed restore data");
        }
        Some(data)
    }

    /// Swaps a client supplied `restore_token` for the stored
    /// `restore_data`, and records the requested persist mode.
    ///
    /// Blocking: may talk to the permission store.
    pub fn replace_token_with_data(
        &self,
        owner: RestoreOwner<'_>,
        state: &mut RestoreState,
        table: &str,
        options: &mut VarDict,
    ) {
        let requested = get_u32(options, PERSIST_MODE).map(PersistMode::from_u32);
        state.persist_mode = requested.unwrap_or_default();

        let Some(token) = get_str(options, RESTORE_TOKEN).map(str::to_string) else {
            return;
        };
        options.remove(RESTORE_TOKEN);

        let found = self
            .take_transient(table, owner.sender, &token)
            .map(|data| (data, PersistMode::Transient))
            .or_else(|| {
                self.take_persistent(table, owner.app_id, &token)
                    .map(|data| (data, PersistMode::Persistent))
            });
        match found {
            Some((data, held_in)) => {
                options.insert(RESTORE_DATA.to_string(), data);
                state.token = Some(token);
                // A restored session keeps living where it came from unless
                // the client says otherwise.
                if requested.is_none() {
                    state.persist_mode = held_in;
                }
            }
            None => debug!(table, token, "Unknown restore token"),
        }
    }

    /// Stores `restore_data` returned by an implementation and hands the
    /// client a `restore_token` for it instead.
    ///
    /// Blocking: may talk to the permission store.
    pub fn replace_data_with_token(
        &self,
        owner: RestoreOwner<'_>,
        state: &mut RestoreState,
        table: &str,
        results: &mut VarDict,
    ) {
        // Implementations may lower the mode the client asked for, never raise it.
        let mut mode = match get_u32(results, PERSIST_MODE) {
            Some(mode) => state.persist_mode.min(PersistMode::from_u32(mode)),
            None => state.persist_mode,
        };
        if mode == PersistMode::Persistent && owner.app_id.is_empty() {
            mode = PersistMode::Transient;
        }
        state.persist_mode = mode;
        if let Ok(value) = to_value(mode as u32) {
            results.insert(PERSIST_MODE.to_string(), value);
        }

        let Some(data) = results.remove(RESTORE_DATA) else {
            return;
        };
        if !is_restore_data(&data) {
            warn!(table, signature = %data.value_signature(), "Ignoring malformed restore data");
            return;
        }
        if mode == PersistMode::None {
            return;
        }

        let token = state
            .token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        match mode {
            PersistMode::Transient => {
                self.transient
                    .lock()
                    .insert(transient_key(table, owner.sender, &token), data);
            }
            PersistMode::Persistent => {
                let permissions = HashMap::from([(owner.app_id.to_string(), vec!["yes".to_string()])]);
                if let Err(err) = self.store.set(table, &token, &permissions, &data) {
                    warn!(table, %err, "Failed to persist restore data");
                    return;
                }
            }
            PersistMode::None => return,
        }
        if let Ok(value) = to_value(token.as_str()) {
            results.insert(RESTORE_TOKEN.to_string(), value);
        }
        state.token = Some(token);
    }

    pub fn forget_sender(&self, sender: &str) {
        let prefix = format!("{sender}/");
        self.transient
            .lock()
            .retain(|(_, key), _| !key.starts_with(&prefix));
    }

    #[cfg(test)]
    fn transient_len(&self) -> usize {
        self.transient.lock().len()
    }
}

impl OwnerSubscriber for RestoreTokens {
    fn owner_vanished(&self, owner: &UniqueName<'static>) {
        self.forget_sender(owner.as_str());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::permissions::MemoryPermissionStore;
    use zbus::zvariant::{Structure, Value};

    const TABLE: &str = "screen-cast";
    const OWNER: RestoreOwner<'static> = RestoreOwner {
        sender: ":1.7",
        app_id: "org.example.App",
    };

    fn restore_data(blob: u32) -> OwnedValue {
        let tuple = Structure::from(("io.example", 1u32, Value::from(blob)));
        Value::Structure(tuple).try_to_owned().unwrap()
    }

    fn tokens() -> (Arc<MemoryPermissionStore>, RestoreTokens) {
        let store = Arc::new(MemoryPermissionStore::default());
        (store.clone(), RestoreTokens::new(store))
    }

    fn dict(entries: Vec<(&str, OwnedValue)>) -> VarDict {
        entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn test_restore_data_signature() {
        assert!(is_restore_data(&restore_data(5)));
        assert!(!is_restore_data(&to_value("nope").unwrap()));
    }

    #[test]
    fn test_persistent_round_trip() {
        let (store, tokens) = tokens();

        // First run: no token, implementation hands back data.
        let mut state = RestoreState::default();
        let mut options = dict(vec![(PERSIST_MODE, to_value(2u32).unwrap())]);
        tokens.replace_token_with_data(OWNER, &mut state, TABLE, &mut options);
        assert_eq!(state.persist_mode, PersistMode::Persistent);
        assert!(!options.contains_key(RESTORE_DATA));

        let mut results = dict(vec![(RESTORE_DATA, restore_data(42))]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);
        let token = get_str(&results, RESTORE_TOKEN).unwrap().to_string();
        assert!(!results.contains_key(RESTORE_DATA));
        assert!(uuid::Uuid::parse_str(&token).is_ok());
        let entry = store.lookup(TABLE, &token).unwrap().unwrap();
        assert_eq!(entry.permissions[OWNER.app_id], vec!["yes".to_string()]);

        // Second run: the token turns back into data and is reissued.
        let mut state = RestoreState::default();
        let mut options = dict(vec![
            (RESTORE_TOKEN, to_value(token.as_str()).unwrap()),
            (PERSIST_MODE, to_value(2u32).unwrap()),
        ]);
        tokens.replace_token_with_data(OWNER, &mut state, TABLE, &mut options);
        assert!(!options.contains_key(RESTORE_TOKEN));
        assert!(is_restore_data(&options[RESTORE_DATA]));
        assert!(store.lookup(TABLE, &token).unwrap().is_none());

        let mut results = dict(vec![(RESTORE_DATA, options.remove(RESTORE_DATA).unwrap())]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);
        assert_eq!(get_str(&results, RESTORE_TOKEN), Some(token.as_str()));
        assert!(store.lookup(TABLE, &token).unwrap().is_some());
        assert_eq!(tokens.transient_len(), 0);
    }

    #[test]
    fn test_token_without_mode_keeps_store() {
        let (store, tokens) = tokens();
        let permissions = HashMap::from([("org.example.App".to_string(), vec!["yes".to_string()])]);
        store.set(TABLE, "U1", &permissions, &restore_data(1)).unwrap();

        let mut state = RestoreState::default();
        let mut options = dict(vec![(RESTORE_TOKEN, to_value("U1").unwrap())]);
        tokens.replace_token_with_data(OWNER, &mut state, TABLE, &mut options);
        assert_eq!(state.persist_mode, PersistMode::Persistent);

        let mut results = dict(vec![
            ("streams", to_value(vec![7u32]).unwrap()),
            (RESTORE_DATA, options.remove(RESTORE_DATA).unwrap()),
        ]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);
        assert_eq!(get_str(&results, RESTORE_TOKEN), Some("U1"));
        assert!(results.contains_key("streams"));
        assert!(store.lookup(TABLE, "U1").unwrap().is_some());
    }

    #[test]
    fn test_other_app_cannot_use_token() {
        let (store, tokens) = tokens();
        let permissions = HashMap::from([("org.example.App".to_string(), vec!["yes".to_string()])]);
        store.set(TABLE, "U1", &permissions, &restore_data(1)).unwrap();

        let mut state = RestoreState::default();
        let mut options = dict(vec![(RESTORE_TOKEN, to_value("U1").unwrap())]);
        let thief = RestoreOwner {
            sender: ":1.8",
            app_id: "org.example.Thief",
        };
        tokens.replace_token_with_data(thief, &mut state, TABLE, &mut options);
        assert!(!options.contains_key(RESTORE_DATA));
        assert!(store.lookup(TABLE, "U1").unwrap().is_some());
    }

    #[test]
    fn test_mode_none_stores_nothing() {
        let (store, tokens) = tokens();
        let permissions = HashMap::from([("org.example.App".to_string(), vec!["yes".to_string()])]);
        store.set(TABLE, "U1", &permissions, &restore_data(1)).unwrap();

        let mut state = RestoreState::default();
        let mut options = dict(vec![
            (RESTORE_TOKEN, to_value("U1").unwrap()),
            (PERSIST_MODE, to_value(0u32).unwrap()),
        ]);
        tokens.replace_token_with_data(OWNER, &mut state, TABLE, &mut options);
        let mut results = dict(vec![(RESTORE_DATA, restore_data(1))]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);

        assert!(!results.contains_key(RESTORE_TOKEN));
        assert!(store.lookup(TABLE, "U1").unwrap().is_none());
        assert_eq!(tokens.transient_len(), 0);
    }

    #[test]
    fn test_implementation_may_only_lower_mode() {
        let (store, tokens) = tokens();
        let mut state = RestoreState {
            token: None,
            persist_mode: PersistMode::Transient,
        };
        let mut results = dict(vec![
            (RESTORE_DATA, restore_data(3)),
            (PERSIST_MODE, to_value(2u32).unwrap()),
        ]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);
        assert_eq!(state.persist_mode, PersistMode::Transient);
        assert_eq!(get_u32(&results, PERSIST_MODE), Some(1));
        let token = get_str(&results, RESTORE_TOKEN).unwrap().to_string();
        assert!(store.lookup(TABLE, &token).unwrap().is_none());
        assert_eq!(tokens.transient_len(), 1);

        tokens.owner_vanished(&UniqueName::try_from(OWNER.sender).unwrap());
        assert_eq!(tokens.transient_len(), 0);
    }

    #[test]
    fn test_transient_token_round_trip() {
        let (_, tokens) = tokens();
        let mut state = RestoreState {
            token: None,
            persist_mode: PersistMode::Transient,
        };
        let mut results = dict(vec![(RESTORE_DATA, restore_data(9))]);
        tokens.replace_data_with_token(OWNER, &mut state, TABLE, &mut results);
        let token = get_str(&results, RESTORE_TOKEN).unwrap().to_string();

        let mut state = RestoreState::default();
        let mut options = dict(vec![(RESTORE_TOKEN, to_value(token.as_str()).unwrap())]);
        tokens.replace_token_with_data(OWNER, &mut state, TABLE, &mut options);
        assert!(options.contains_key(RESTORE_DATA));
        assert_eq!(state.token.as_deref(), Some(token.as_str()));
        assert_eq!(tokens.transient_len(), 0);
    }

    #[test]
    fn test_empty_app_id_downgrades_to_transient() {
        let (_, tokens) = tokens();
        let owner = RestoreOwner {
            sender: ":1.9",
            app_id: "",
        };
        let mut state = RestoreState {
            token: None,
            persist_mode: PersistMode::Persistent,
        };
        let mut results = dict(vec![(RESTORE_DATA, restore_data(1))]);
        tokens.replace_data_with_token(owner, &mut state, TABLE, &mut results);
        assert_eq!(state.persist_mode, PersistMode::Transient);
        assert_eq!(tokens.transient_len(), 1);
    }
}
