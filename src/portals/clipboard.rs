// SPDX-License-Identifier: GPL-3.0-only

//! Clipboard sharing inside remote desktop sessions.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};
use zbus::{
    message::Header,
    object_server::SignalEmitter,
    zvariant::{ObjectPath, OwnedFd, OwnedObjectPath},
};

use super::{impl_proxy, remote_desktop::RemoteDesktopSession};
use crate::{
    error::PortalError,
    handles::Handle,
    options::{filter_options, OptionSpec, VarDict},
    session::{Session, SessionData, SessionPhase},
    state::Broker,
};

pub const IMPL_INTERFACE: &str = "org.freedesktop.impl.portal.Clipboard";

const SELECTION_OPTIONS: &[OptionSpec] = &[OptionSpec::new("mime_types", "as")];

#[zbus::proxy(
    interface = "org.freedesktop.impl.portal.Clipboard",
    default_path = "/org/freedesktop/portal/desktop",
    gen_blocking = false
)]
pub trait ImplClipboard {
    fn request_clipboard(&self, session_handle: &ObjectPath<'_>, options: &VarDict) -> zbus::Result<()>;

    fn set_selection(&self, session_handle: &ObjectPath<'_>, options: &VarDict) -> zbus::Result<()>;

    fn selection_write(&self, session_handle: &ObjectPath<'_>, serial: u32) -> zbus::Result<OwnedFd>;

    fn selection_write_done(&self, session_handle: &ObjectPath<'_>, serial: u32, success: bool) -> zbus::Result<()>;

    fn selection_read(&self, session_handle: &ObjectPath<'_>, mime_type: &str) -> zbus::Result<OwnedFd>;

    #[zbus(signal)]
    fn selection_owner_changed(&self, session_handle: ObjectPath<'_>, options: VarDict) -> zbus::Result<()>;

    #[zbus(signal)]
    fn selection_transfer(&self, session_handle: ObjectPath<'_>, mime_type: &str, serial: u32) -> zbus::Result<()>;
}

fn remote_desktop<R>(
    session: &Session,
    f: impl FnOnce(&mut RemoteDesktopSession) -> Result<R, PortalError>,
) -> Result<R, PortalError> {
    session.with_data(|data| match data {
        SessionData::RemoteDesktop(remote_desktop) => f(remote_desktop),
        data => Err(PortalError::invalid(format!("No clipboard in a {} session", data.name()))),
    })
}

pub struct Clipboard {
    broker: Arc<Broker>,
    backend: String,
}

impl Clipboard {
    pub fn new(broker: Arc<Broker>, backend: String) -> Clipboard {
        Clipboard { broker, backend }
    }

    async fn proxy(&self) -> Result<ImplClipboardProxy<'static>, PortalError> {
        Ok(impl_proxy(&self.broker.connection, &self.backend).await?)
    }

    /// The caller's session, if it may already use the clipboard.
    async fn enabled_session(&self, header: &Header<'_>, session_handle: &ObjectPath<'_>) -> Result<Arc<Session>, PortalError> {
        let call = self.broker.authorize(header).await?;
        let session = self.broker.sessions.lookup(session_handle, &call.sender)?;
        session.ensure_started()?;
        remote_desktop(&session, |remote_desktop| {
            if remote_desktop.clipboard_enabled {
                Ok(())
            } else {
                Err(PortalError::not_allowed("Clipboard access was not granted"))
            }
        })?;
        Ok(session)
    }

    fn check_implementation(&self, session: &Session) -> Result<(), PortalError> {
        if session.implementation() == Some(self.backend.as_str()) {
            Ok(())
        } else {
            Err(PortalError::not_allowed("Session is handled by another implementation"))
        }
    }
}

#[zbus::interface(name = "org.freedesktop.portal.Clipboard")]
impl Clipboard {
    /// Must come before the session is started.
    async fn request_clipboard(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        _options: VarDict,
    ) -> Result<(), PortalError> {
        let call = self.broker.authorize(&header).await?;
        let session = self.broker.sessions.lookup(&session_handle, &call.sender)?;
        self.check_implementation(&session)?;
        match session.phase() {
            SessionPhase::Init | SessionPhase::Configuring => {}
            phase => return Err(PortalError::failed(format!("Clipboard requested in phase {phase:?}"))),
        }
        remote_desktop(&session, |remote_desktop| {
            if remote_desktop.clipboard_requested {
                return Err(PortalError::failed("Clipboard already requested"));
            }
            remote_desktop.clipboard_requested = true;
            Ok(())
        })?;
        self.proxy()
            .await?
            .request_clipboard(session.path(), &VarDict::new())
            .await?;
        debug!(path = %session.path(), "Clipboard requested");
        Ok(())
    }

    async fn set_selection(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        options: VarDict,
    ) -> Result<(), PortalError> {
        let session = self.enabled_session(&header, &session_handle).await?;
        let options = filter_options(&options, SELECTION_OPTIONS)?;
        self.proxy().await?.set_selection(session.path(), &options).await?;
        Ok(())
    }

    async fn selection_write(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        serial: u32,
    ) -> Result<OwnedFd, PortalError> {
        let session = self.enabled_session(&header, &session_handle).await?;
        Ok(self.proxy().await?.selection_write(session.path(), serial).await?)
    }

    async fn selection_write_done(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        serial: u32,
        success: bool,
    ) -> Result<(), PortalError> {
        let session = self.enabled_session(&header, &session_handle).await?;
        self.proxy()
            .await?
            .selection_write_done(session.path(), serial, success)
            .await?;
        Ok(())
    }

    async fn selection_read(
        &self,
        #[zbus(header)] header: Header<'_>,
        session_handle: OwnedObjectPath,
        mime_type: String,
    ) -> Result<OwnedFd, PortalError> {
        let session = self.enabled_session(&header, &session_handle).await?;
        Ok(self.proxy().await?.selection_read(session.path(), &mime_type).await?)
    }

    #[zbus(signal)]
    async fn selection_owner_changed(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        options: &VarDict,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn selection_transfer(
        emitter: &SignalEmitter<'_>,
        session_handle: &ObjectPath<'_>,
        mime_type: &str,
        serial: u32,
    ) -> zbus::Result<()>;

    #[zbus(property)]
    fn version(&self) -> u32 {
        1
    }
}

fn clipboard_session(broker: &Broker, path: &ObjectPath<'_>) -> Option<Arc<Session>> {
    let session = broker.sessions.get(path)?;
    let enabled = session.with_data(|data| matches!(data, SessionData::RemoteDesktop(rd) if rd.clipboard_enabled));
    enabled.then_some(session)
}

/// Relays selection signals of the implementation to session owners.
pub fn forward_selection(broker: Arc<Broker>, backend: String) {
    let executor = broker.executor.clone();
    let owners_broker = broker.clone();
    let owners_backend = backend.clone();
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplClipboardProxy<'static> = impl_proxy(&owners_broker.connection, &owners_backend).await?;
            let mut owners = proxy.receive_selection_owner_changed().await?;
            while let Some(signal) = owners.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = clipboard_session(&owners_broker, &args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let options = args.options;
                session
                    .forward(|emitter| async move { Clipboard::selection_owner_changed(&emitter, &path, &options).await })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding selection owner changes");
        }
    });
    executor.spawn_ok(async move {
        let forwarded = async {
            let proxy: ImplClipboardProxy<'static> = impl_proxy(&broker.connection, &backend).await?;
            let mut transfers = proxy.receive_selection_transfer().await?;
            while let Some(signal) = transfers.next().await {
                let Ok(args) = signal.args() else {
                    continue;
                };
                let Some(session) = clipboard_session(&broker, &args.session_handle) else {
                    continue;
                };
                let path = session.path().clone();
                let mime_type = args.mime_type.to_string();
                let serial = args.serial;
                session
                    .forward(|emitter| async move {
                        Clipboard::selection_transfer(&emitter, &path, &mime_type, serial).await
                    })
                    .await;
            }
            Ok::<_, zbus::Error>(())
        }
        .await;
        if let Err(err) = forwarded {
            warn!(?err, "Stopped forwarding selection transfers");
        }
    });
}
