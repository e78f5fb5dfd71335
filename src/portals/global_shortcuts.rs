// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::HashSet, sync::Arc};

use futures_util::StreamExt;
use tracing::warn;
use zbus::{
    message::Header,
    object_server::SignalEmitter,
    zvariant::{ObjectPath, OwnedObjectPath},
};

use super::{begin_request, create_session, handle_token, impl_proxy, publish_session, RequestReply};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_str, validate_token, OptionSpec, VarDict},
    request::Response,
    session::{Session, SessionData},
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.GlobalShortcuts";

pub type Shortcut = (String, VarDict);

const CREATE_OPTIONS: &[OptionSpec] = &[OptionSpec::validated("session_handle_token", "s", validate_token)];

const SHORTCUT_OPTIONS: &[OptionSpec] = &[
    OptionSpec::new("description", "s"),
    OptionSpec::new("preferred_trigger", "s"),
];

/// Filters the options of every shortcut. Ids must be unique and
/// non-empty.
pub fn validate_shortcuts(shortcuts: &[Shortcut]) -> Result<Vec<Shortcut>, PortalError> {
    let mut seen = HashSet::new();
    shortcuts
        .iter()
        .map(|(id, options)| {
            if id.is_empty() {
                return Err(PortalError::invalid("Empty shortcut id"));
            }
            if !seen.insert(id.as_str()) {
                return Err(PortalError::invalid(format!("Duplicate shortcut id {id:?}")));
            }
            Ok((id.clone(), filter_options(options, SHORTCUT_OPTIONS)?))
        })
        .collect()
}

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.GlobalShortcuts",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplGlobalShortcuts {
    fn create_session(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn bind_shortcuts(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        shortcuts: &[Shortcut],
        parent_window: &str,
        options: &VarDict,
    ) -> zbus::Result<(u32, VarDict)>;

    fn list_shortcuts(&self, handle: &ObjectPath<'_>, session_handle: &ObjectPath<'_>) -> zbus::Result<(u32, VarDict)>;

    #[zbus(signal)]
    fn activated(&self, session_handle: ObjectPath<'_>, shortcut_id: &str, timestamp: u64, options: VarDict)
        -> zbus::Result<()>;

    #[zbus(signal)]
    fn deactivated(&self, session_handle: ObjectPath<'_>, shortcut_id: &str, timestamp: u64, options: VarDict)
        -> zbus::Result<()>;

    #[zbus(signal)]
    fn shortcuts_changed(&self, session_handle: ObjectPath<'_>, shortcuts: Vec<Shortcut>) -> zbus::Result<()>;
}

pub struct GlobalShortcuts {
    broker: Arc<Broker>,
    backend: String,
}

impl GlobalShortcuts {
    pub fn new(broker: Arc<Broker>, backend: String) -> GlobalShortcuts {
        GlobalShortcuts { broker, backend }
    }

    fn shortcuts_session(&self, session: &Session) -> Result<(), PortalError> {
        if !session.with_data(|data| matches!(data, SessionData::GlobalShortcuts)) {
            return Err(PortalError::invalid("Not a global shortcuts session"));
        }
        session.ensure_started()
    }
}

#[zbus::interface(name = "org.freedesktop.portal.GlobalShortcuts")]
impl GlobalShortcuts {
    async fn create_session(
        &self,
        #[zbus(header)] header: Header<'_>,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, CREATE_OPTIONS)?;
        let session = create_session(
            &self.broker,
            &call,
            get_str(&options, "session_handle_token"),
            Some(&self.backend),
            SessionData::GlobalShortcuts,
        )?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let created = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplGlobalShortcutsProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .create_session(request.path(), created.path(), request.app_info().id(), &VarDict::new())
                .await?;
            let mut response = Response::from(reply);
            if response.is_success() {
                created.mark_started();
                publish_session(&broker, &created, &mut response.results).await?;
            }
            Ok(response)
        })
        .await
    }

    async fn bind_shortcuts(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        shortcuts: Vec<Shortcut>,
        parent_window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        self.shortcuts_session(&session)?;
        let token = handle_token(&options);
        let shortcuts = validate_shortcuts(&shortcuts)?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplGlobalShortcutsProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy
                .bind_shortcuts(request.path(), session.path(), &shortcuts, &parent_window, &VarDict::new())
                .await?;
            Ok(Response::from(reply))
        })
        .await
    }

    async fn list_shortcuts(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        self.shortcuts_session(&session)?;
        let token = handle_token(&options);
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let proxy: ImplGlobalShortcutsProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let reply = proxy.list_shortcuts(request.path(), session.path()).await?;
            Ok(Response::from(reply))
        })
        .await
    }

    #[zbus(signal)]
    async fn activated(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        shortcut_id: &str,
        timestamp: u64,
        options: &VarDict,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn deactivated(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        shortcut_id: &str,
        timestamp: u64,
        options: &VarDict,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn shortcuts_changed(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        shortcuts: &[Shortcut],
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

fn shortcuts_session(broker: &Broker, path: &ObjectPath<'_>) -> Option<Arc<Session>> {
    broker
        .sessions
        .get(path)
        .filter(|session| session.with_data(|data| matches!(data, SessionData::GlobalShortcuts)))
}

/// Relays shortcut signals of the implementation to session owners.
pub fn forward_shortcuts(broker: Arc<Broker>, backend: String) {
    let executor = broker.executor.clone();

    let (activated_broker, activated_backend) = (broker.clone(), backend.clone());
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplGlobalShortcutsProxy<'static> =
                impl_proxy(&activated_broker.connection, &activated_backend).await?;
            let mut signals = proxy.receive_activated().await?;
            while let Some(signal) = signals.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = shortcuts_session(&activated_broker, &args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let (id, timestamp, options) = (args.shortcut_id.to_string(), args.timestamp, args.options);
                session
                    .forward(|emitter| async move {
                        GlobalShortcuts::activated(&emitter, &path, &id, timestamp, &options).await
                    })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding shortcut activations");
        }
    });

    let (deactivated_broker, deactivated_backend) = (broker.clone(), backend.clone());
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplGlobalShortcutsProxy<'static> =
                impl_proxy(&deactivated_broker.connection, &deactivated_backend).await?;
            let mut signals = proxy.receive_deactivated().await?;
            while let Some(signal) = signals.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = shortcuts_session(&deactivated_broker, &args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let (id, timestamp, options) = (args.shortcut_id.to_string(), args.timestamp, args.options);
                session
                    .forward(|emitter| async move {
                        GlobalShortcuts::deactivated(&emitter, &path, &id, timestamp, &options).await
                    })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding shortcut deactivations");
        }
    });

    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplGlobalShortcutsProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            let mut signals = proxy.receive_shortcuts_changed().await?;
            while let Some(signal) = signals.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = shortcuts_session(&broker, &args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let shortcuts = args.shortcuts;
                session
                    .forward(|emitter| async move { GlobalShortcuts::shortcuts_changed(&emitter, &path, &shortcuts).await })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding shortcut changes");
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::options::to_value;

    fn shortcut(id: &str) -> Shortcut {
        (
            id.to_string(),
            VarDict::from([
                ("description".to_string(), to_value("Toggle").unwrap()),
                ("bogus".to_string(), to_value(1u32).unwrap()),
            ]),
        )
    }

    #[test]
    fn test_validate_shortcuts() {
        let shortcuts = validate_shortcuts(&[shortcut("toggle"), shortcut("mute")]).unwrap();
        assert_eq!(shortcuts.len(), 2);
        assert_eq!(shortcuts[0].1.len(), 1);

        assert!(validate_shortcuts(&[shortcut("toggle"), shortcut("toggle")]).is_err());
        assert!(validate_shortcuts(&[shortcut("")]).is_err());
    }
}
