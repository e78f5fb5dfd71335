// SPDX-License-Identifier: GPL-3.0-only

use std::sync::Arc;

use bitflags::bitflags;
use futures_util::StreamExt;
use tracing::{debug, warn};
use zbus::{
    message::Header,
    object_server::SignalEmitter,
    zvariant::{ObjectPath, OwnedObjectPath},
};

use super::{begin_request, create_session, handle_token, impl_proxy, publish_session, RequestReply};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, get_str, validate_reason, validate_token, OptionSpec, VarDict},
    permissions::{self, PermissionStore},
    request::{Completion, Response},
    session::SessionData,
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Inhibit";

const TABLE: &str = "inhibit";

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InhibitFlags: u32 {
        const LOGOUT = 1;
        const SWITCH_USER = 2;
        const SUSPEND = 4;
        const IDLE = 8;
    }
}

const FLAG_NAMES: &[(&str, InhibitFlags)] = &[
    ("logout", InhibitFlags::LOGOUT),
    ("switch", InhibitFlags::SWITCH_USER),
    ("suspend", InhibitFlags::SUSPEND),
    ("idle", InhibitFlags::IDLE),
];

/// Flags the application may still use. Without a stored list nothing is
/// restricted.
pub fn allowed_flags(list: &[String]) -> InhibitFlags {
    if list.is_empty() {
        return InhibitFlags::all();
    }
    list.iter()
        .filter_map(|name| FLAG_NAMES.iter().find(|(known, _)| known == name))
        .fold(InhibitFlags::empty(), |flags, (_, flag)| flags | *flag)
}

fn stored_flags(store: &dyn PermissionStore, app_id: &str) -> InhibitFlags {
    match permissions::get(store, app_id, TABLE, TABLE) {
        Ok(list) => allowed_flags(&list),
        Err(err) => {
            warn!(app_id, %err, "Failed to read inhibit permissions");
            InhibitFlags::all()
        }
    }
}

const INHIBIT_OPTIONS: &[OptionSpec] = &[OptionSpec::validated("reason", "s", validate_reason)];

const MONITOR_OPTIONS: &[OptionSpec] = &[OptionSpec::validated("session_handle_token", "s", validate_token)];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Inhibit",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplInhibit {
    fn inhibit(
        &self,
        handle: &ObjectPath<'_>,
        app_id: &str,
        window: &str,
        flags: u32,
        options: &VarDict,
    ) -> zbus::Result<()>;

    fn create_monitor(
        &self,
        handle: &ObjectPath<'_>,
        session_handle: &ObjectPath<'_>,
        app_id: &str,
        window: &str,
    ) -> zbus::Result<u32>;

    fn query_end_response(&self, session_handle: &ObjectPath<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    fn state_changed(&self, session_handle: ObjectPath<'_>, state: VarDict) -> zbus::Result<()>;
}

pub struct Inhibit {
    broker: Arc<Broker>,
    backend: String,
}

impl Inhibit {
    pub fn new(broker: Arc<Broker>, backend: String) -> Inhibit {
        Inhibit { broker, backend }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Inhibit")]
impl Inhibit {
    /// The returned handle holds the inhibitor until it is closed.
    async fn inhibit(
        &self,
        #[zbus(header)] header: Header<'_>,
        window: String,
        flags: u32,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, INHIBIT_OPTIONS)?;
        let requested =
            InhibitFlags::from_bits(flags).ok_or_else(|| PortalError::invalid(format!("Unknown inhibit flags {flags:#x}")))?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        begin_request(&self.broker, &call, token.as_deref(), None, move |request| async move {
            let app_id = request.app_info().id();
            let flags = requested & stored_flags(&*broker.permissions, app_id);
            if flags.is_empty() {
                debug!(app_id, ?requested, "No inhibit flags left");
                return Ok(Completion::KeepAlive);
            }
            let proxy: ImplInhibitProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            proxy
                .inhibit(request.path(), app_id, &window, flags.bits(), &options)
                .await?;
            debug!(app_id, ?flags, reason = ?get_str(&options, "reason"), "Inhibiting");
            Ok(Completion::KeepAlive)
        })
        .await
    }

    async fn create_monitor(
        &self,
        #[zbus(header)] header: Header<'_>,
        window: String,
        options: VarDict,
    ) -> Result<RequestReply, PortalError> {
        let call = self.broker.authorize(&header).await?;
        let token = handle_token(&options);
        let options = filter_options(&options, MONITOR_OPTIONS)?;
        let session = create_session(
            &self.broker,
            &call,
            get_str(&options, "session_handle_token"),
            Some(&self.backend),
            SessionData::InhibitMonitor,
        )?;
        let broker = self.broker.clone();
        let backend = self.backend.clone();
        let monitor = session.clone();
        begin_request(&self.broker, &call, token.as_deref(), Some(session), move |request| async move {
            let proxy: ImplInhibitProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            request.set_implementation(&backend);
            let code = proxy
                .create_monitor(request.path(), monitor.path(), request.app_info().id(), &window)
                .await?;
            let mut response = Response::new(code.into(), VarDict::new());
            if response.is_success() {
                monitor.mark_started();
                publish_session(&broker, &monitor, &mut response.results).await?;
            }
            Ok(response)
        })
        .await
    }

    async fn query_end_response(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        if !session.with_data(|data| matches!(data, SessionData::InhibitMonitor)) {
            return Err(PortalError::invalid("Not an inhibit monitor session"));
        }
        session.ensure_started()?;
        let proxy: ImplInhibitProxy<'static> = impl_proxy(&self.broker.connection, &self.backend).await?;
        proxy.query_end_response(session.path()).await?;
        Ok(())
    }

    #[zbus(signal)]
    async fn state_changed(emitter: &SignalEmitter<'_>, session_handle: &ObjectPath<'_>, state: &VarDict)
        -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        3
    }
}

/// Relays `StateChanged` of monitors to their owners.
pub fn forward_state(broker: Arc<Broker>, backend: String) {
    let executor = broker.executor.clone();
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplInhibitProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            let mut changes = proxy.receive_state_changed().await?;
            while let Some(signal) = changes.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = broker.sessions.get(&args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let state = args.state;
                session
                    .forward(|emitter| async move { Inhibit::state_changed(&emitter, &path, &state).await })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding inhibit state");
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::permissions::MemoryPermissionStore;

    #[test]
    fn test_allowed_flags() {
        assert_eq!(allowed_flags(&[]), InhibitFlags::all());
        let list = vec!["logout".to_string(), "idle".to_string(), "bogus".to_string()];
        assert_eq!(allowed_flags(&list), InhibitFlags::LOGOUT | InhibitFlags::IDLE);
    }

    #[test]
    fn test_stored_flags_mask() {
        let store = MemoryPermissionStore::default();
        assert_eq!(stored_flags(&store, "org.example.App"), InhibitFlags::all());
        permissions::set(&store, "org.example.App", TABLE, TABLE, &["suspend".to_string()]).unwrap();
        let requested = InhibitFlags::SUSPEND | InhibitFlags::IDLE;
        assert_eq!(requested & stored_flags(&store, "org.example.App"), InhibitFlags::SUSPEND);
    }
}
