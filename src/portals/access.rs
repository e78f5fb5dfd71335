// SPDX-License-Identifier: GPL-3.0-only

//! Permission checks that may ask the user.

use tracing::{debug, warn};
use zbus::zvariant::{ObjectPath, Value};

use super::impl_proxy;
use crate::{
    error::PortalError,
    handles::Handle,
    options::{to_value, VarDict},
    permissions::{get_permission, set_permission, Permission, PermissionStore, TransientPermissions},
    request::{Request, ResponseCode},
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Access";

const REMEMBER_CHOICE: &str = "remember";

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Access",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplAccess {
    #[allow(clippy::too_many_arguments)]
    fn access_dialog(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        parent_window: &str,
        title: &str,
        subtitle: &str,
        body: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;
}

/// Permission store record a decision is kept in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionKey {
    pub table: &'static str,
    pub id: String,
}

impl PermissionKey {
    pub fn new(table: &'static str, id: impl Into<String>) -> PermissionKey {
        PermissionKey { table, id: id.into() }
    }
}

/// Texts of the access dialog.
#[derive(Debug, Default, Clone)]
pub struct Prompt {
    pub title: String,
    pub subtitle: String,
    pub body: String,
    pub grant_label: Option<String>,
    pub deny_label: Option<String>,
    pub icon: Option<String>,
}

impl Prompt {
    pub fn new(title: impl Into<String>, subtitle: impl Into<String>) -> Prompt {
        Prompt {
            title: title.into(),
            subtitle: subtitle.into(),
            ..Prompt::default()
        }
    }

    pub fn grant(mut self, label: &str) -> Prompt {
        self.grant_label = Some(label.to_string());
        self
    }

    pub fn deny(mut self, label: &str) -> Prompt {
        self.deny_label = Some(label.to_string());
        self
    }

    pub fn icon(mut self, icon: &str) -> Prompt {
        self.icon = Some(icon.to_string());
        self
    }

    fn options(&self) -> Result<VarDict, PortalError> {
        let mut options = VarDict::new();
        for (key, value) in [
            ("grant_label", &self.grant_label),
            ("deny_label", &self.deny_label),
            ("icon", &self.icon),
        ] {
            if let Some(value) = value {
                options.insert(key.to_string(), to_value(value.as_str())?);
            }
        }
        let choices = vec![(REMEMBER_CHOICE, "Remember this choice", Vec::<(&str, &str)>::new(), "true")];
        options.insert("choices".to_string(), to_value(choices)?);
        Ok(options)
    }
}

/// What the user picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Answer {
    pub granted: bool,
    pub remember: bool,
}

/// Value of choice `id` in the `choices` result of a dialog.
pub fn choice(results: &VarDict, id: &str) -> Option<String> {
    let Value::Array(choices) = &**results.get("choices")? else {
        return None;
    };
    choices.iter().find_map(|choice| match choice {
        Value::Structure(choice) => match choice.fields() {
            [Value::Str(key), Value::Str(value)] if key.as_str() == id => Some(value.to_string()),
            _ => None,
        },
        _ => None,
    })
}

/// `None` if the dialog itself failed. Without a `remember` choice in the
/// results the answer is kept.
pub fn parse_answer(response: u32, results: &VarDict) -> Option<Answer> {
    let granted = match ResponseCode::from(response) {
        ResponseCode::Success => true,
        ResponseCode::Cancelled => false,
        ResponseCode::Other => return None,
    };
    let remember = choice(results, REMEMBER_CHOICE).is_none_or(|value| value == "true");
    Some(Answer { granted, remember })
}

/// Answer already known without asking: a transient answer beats the
/// store, which beats `default`.
pub fn known_permission(transient: Permission, stored: Permission, default: Permission) -> Permission {
    [transient, stored]
        .into_iter()
        .find(|permission| *permission != Permission::Unset)
        .unwrap_or(default)
}

/// Application a permission is checked for. The transient map is only
/// used when the application is the one talking to us.
#[derive(Debug, Clone, Copy)]
pub struct Subject<'a> {
    pub app_id: &'a str,
    pub sender: Option<&'a str>,
}

impl<'a> Subject<'a> {
    pub fn caller(request: &'a Request) -> Subject<'a> {
        Subject {
            app_id: request.app_info().id(),
            sender: Some(request.sender().as_str()),
        }
    }
}

/// Shows the access dialog for `request`, on behalf of `app_id`.
pub async fn ask(
    broker: &Broker,
    request: &Request,
    app_id: &str,
    parent_window: &str,
    prompt: &Prompt,
) -> Result<Option<Answer>, PortalError> {
    let Some(backend) = broker.backends.get(IMPL_INTERFACE) else {
        warn!("No access dialog implementation, denying");
        return Ok(None);
    };
    let proxy: ImplAccessProxy<'static> = impl_proxy(&broker.connection, backend).await?;
    request.set_implementation(backend);
    let (response, results) = proxy
        .access_dialog(
            request.path(),
            app_id,
            parent_window,
            &prompt.title,
            &prompt.subtitle,
            &prompt.body,
            &prompt.options()?,
        )
        .await?;
    Ok(parse_answer(response, &results))
}

/// Whether the caller of `request` holds `key`, asking the user when
/// nothing is known yet. Blocking: talks to the permission store.
pub async fn check_permission(
    broker: &Broker,
    request: &Request,
    parent_window: &str,
    key: &PermissionKey,
    default: Permission,
    prompt: &Prompt,
) -> Result<bool, PortalError> {
    check_permission_for(broker, request, Subject::caller(request), parent_window, key, default, prompt).await
}

#[allow(clippy::too_many_arguments)]
pub async fn check_permission_for(
    broker: &Broker,
    request: &Request,
    subject: Subject<'_>,
    parent_window: &str,
    key: &PermissionKey,
    default: Permission,
    prompt: &Prompt,
) -> Result<bool, PortalError> {
    let app_id = subject.app_id;
    match lookup_permission(&*broker.permissions, &broker.transient, subject, key, default) {
        Permission::Yes => return Ok(true),
        Permission::No => {
            debug!(app_id, table = key.table, id = %key.id, "Permission denied");
            return Ok(false);
        }
        Permission::Ask | Permission::Unset => {}
    }

    let Some(answer) = ask(broker, request, app_id, parent_window, prompt).await? else {
        return Ok(false);
    };
    record_answer(&*broker.permissions, &broker.transient, subject, key, answer);
    Ok(answer.granted)
}

/// What is known about `key` for `subject` without asking.
pub fn lookup_permission(
    store: &dyn PermissionStore,
    transient: &TransientPermissions,
    subject: Subject<'_>,
    key: &PermissionKey,
    default: Permission,
) -> Permission {
    let transient = subject
        .sender
        .map_or(Permission::Unset, |sender| transient.get(sender, key.table, &key.id));
    let stored = match transient {
        Permission::Unset => get_permission(store, key.table, &key.id, subject.app_id),
        _ => Permission::Unset,
    };
    known_permission(transient, stored, default)
}

/// Keeps a dialog answer, in the store if it is to be remembered and
/// otherwise for the asking connection only.
pub fn record_answer(
    store: &dyn PermissionStore,
    transient: &TransientPermissions,
    subject: Subject<'_>,
    key: &PermissionKey,
    answer: Answer,
) {
    let permission = if answer.granted {
        Permission::Yes
    } else {
        Permission::No
    };
    match (answer.remember, subject.sender) {
        (true, _) => set_permission(store, key.table, &key.id, subject.app_id, permission),
        (false, Some(sender)) => transient.set(sender, key.table, &key.id, permission),
        (false, None) => {}
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::permissions::{self, MemoryPermissionStore};
    use zbus::zvariant::OwnedValue;

    fn choices(remember: &str) -> OwnedValue {
        to_value(vec![(REMEMBER_CHOICE, remember)]).unwrap()
    }

    #[test]
    fn test_answer() {
        let results = VarDict::from([("choices".to_string(), choices("false"))]);
        assert_eq!(
            parse_answer(0, &results),
            Some(Answer {
                granted: true,
                remember: false
            })
        );
        assert_eq!(
            parse_answer(1, &VarDict::new()),
            Some(Answer {
                granted: false,
                remember: true
            })
        );
        assert_eq!(parse_answer(2, &results), None);
    }

    #[test]
    fn test_choice_lookup() {
        let results = VarDict::from([("choices".to_string(), choices("true"))]);
        assert_eq!(choice(&results, REMEMBER_CHOICE).as_deref(), Some("true"));
        assert_eq!(choice(&results, "other"), None);
        assert_eq!(choice(&VarDict::new(), REMEMBER_CHOICE), None);
    }

    #[test]
    fn test_known_permission_order() {
        use Permission::*;
        assert_eq!(known_permission(No, Yes, Ask), No);
        assert_eq!(known_permission(Unset, Yes, Ask), Yes);
        assert_eq!(known_permission(Unset, Unset, Ask), Ask);
        assert_eq!(known_permission(Unset, Unset, Yes), Yes);
    }

    #[test]
    fn test_prompt_offers_remember() {
        let options = Prompt::new("Allow?", "Details").grant("Allow").options().unwrap();
        assert!(options.contains_key("grant_label"));
        assert!(!options.contains_key("deny_label"));
        assert_eq!(options["choices"].value_signature().to_string(), "a(ssa(ss)s)");
    }

    #[test]
    fn test_remembered_denial_is_stored() {
        let store = MemoryPermissionStore::default();
        let transient = TransientPermissions::default();
        let key = PermissionKey::new("screenshot", "screenshot");
        let subject = Subject {
            app_id: "",
            sender: Some(":1.30"),
        };
        assert_eq!(
            lookup_permission(&store, &transient, subject, &key, Permission::Ask),
            Permission::Ask
        );

        let answer = parse_answer(1, &VarDict::from([("choices".to_string(), choices("true"))])).unwrap();
        record_answer(&store, &transient, subject, &key, answer);
        assert_eq!(
            permissions::get(&store, "", "screenshot", "screenshot").unwrap(),
            vec!["no".to_string()]
        );
        assert_eq!(transient.get(":1.30", "screenshot", "screenshot"), Permission::Unset);
        assert_eq!(
            lookup_permission(&store, &transient, subject, &key, Permission::Ask),
            Permission::No
        );
    }

    #[test]
    fn test_unremembered_answer_is_transient() {
        let store = MemoryPermissionStore::default();
        let transient = TransientPermissions::default();
        let key = PermissionKey::new("devices", "camera");
        let subject = Subject {
            app_id: "org.example.App",
            sender: Some(":1.31"),
        };
        let answer = parse_answer(0, &VarDict::from([("choices".to_string(), choices("false"))])).unwrap();
        record_answer(&store, &transient, subject, &key, answer);
        assert!(permissions::get(&store, "org.example.App", "devices", "camera")
            .unwrap()
            .is_empty());
        assert_eq!(
            lookup_permission(&store, &transient, subject, &key, Permission::Unset),
            Permission::Yes
        );
        let other = Subject {
            sender: Some(":1.32"),
            ..subject
        };
        assert_eq!(
            lookup_permission(&store, &transient, other, &key, Permission::Unset),
            Permission::Unset
        );
    }
}
